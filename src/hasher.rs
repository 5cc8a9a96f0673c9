//! Key hashing
//!
//! Maps keys to owning ranks and to in-memory hash buckets, and provides the
//! two independent 64-bit hashes used by the bloom filter.

use std::fmt;

use crate::config::PartitionFn;

/// Seed of the secondary (mixing) hash
const MURMUR_SEED: u64 = 0x1f0d_3804;

/// Partition function and bucket hashing for one database
#[derive(Clone)]
pub struct Hasher {
    nranks: usize,
    partition: Option<PartitionFn>,
}

impl fmt::Debug for Hasher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Hasher")
            .field("nranks", &self.nranks)
            .field("custom_partition", &self.partition.is_some())
            .finish()
    }
}

impl Hasher {
    pub fn new(nranks: usize, partition: Option<PartitionFn>) -> Self {
        Self {
            nranks: nranks.max(1),
            partition,
        }
    }

    /// Owner rank of a key
    pub fn key_rank(&self, key: &[u8]) -> usize {
        match &self.partition {
            Some(f) => f(key, self.nranks) % self.nranks,
            None => (Self::key_hash(key) % self.nranks as u64) as usize,
        }
    }

    /// Bucket index for a power-of-two sized bucket array
    pub fn key_bucket(key: &[u8], bucket_size: usize) -> usize {
        (Self::key_hash(key) & (bucket_size as u64 - 1)) as usize
    }

    /// Bucket array size for `count` entries
    pub fn bucket_size(count: usize) -> usize {
        count.max(1).next_power_of_two() << 2
    }

    pub fn key_hash(key: &[u8]) -> u64 {
        djb2(key)
    }

    pub fn nranks(&self) -> usize {
        self.nranks
    }
}

/// Multiplicative string hash (bytes are sign-extended like a C `char`)
pub fn djb2(key: &[u8]) -> u64 {
    key.iter().fold(5381u64, |hash, &b| {
        (hash << 5)
            .wrapping_add(hash)
            .wrapping_add(b as i8 as i64 as u64)
    })
}

/// MurmurHash64A with the default seed
pub fn murmur2(key: &[u8]) -> u64 {
    murmur2_seeded(key, MURMUR_SEED)
}

pub fn murmur2_seeded(key: &[u8], seed: u64) -> u64 {
    const M: u64 = 0xc6a4_a793_5bd1_e995;
    const R: u32 = 47;

    let mut h = seed ^ (key.len() as u64).wrapping_mul(M);

    let mut chunks = key.chunks_exact(8);
    for chunk in &mut chunks {
        let mut word = [0u8; 8];
        word.copy_from_slice(chunk);
        let mut k = u64::from_le_bytes(word);
        k = k.wrapping_mul(M);
        k ^= k >> R;
        k = k.wrapping_mul(M);
        h ^= k;
        h = h.wrapping_mul(M);
    }

    let tail = chunks.remainder();
    if !tail.is_empty() {
        for (i, &b) in tail.iter().enumerate() {
            h ^= (b as u64) << (8 * i);
        }
        h = h.wrapping_mul(M);
    }

    h ^= h >> R;
    h = h.wrapping_mul(M);
    h ^= h >> R;
    h
}
