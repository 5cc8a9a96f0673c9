//! Bloom filter
//!
//! One fixed-width bit array per persisted generation. Each key sets two bits,
//! chosen by [`djb2`] and [`murmur2`]. A clear bit proves absence; two set
//! bits only suggest presence.

use crate::hasher::{djb2, murmur2};

/// Bloom filter geometry shared by builder and query
#[derive(Debug, Clone, Copy)]
pub struct Bloom {
    bit_len: u64,
}

impl Bloom {
    /// `bit_len` must be a non-zero multiple of 64
    pub fn new(bit_len: usize) -> Self {
        Self {
            bit_len: bit_len.max(64) as u64,
        }
    }

    /// Number of u64 words in the bit array
    pub fn words(&self) -> usize {
        (self.bit_len / 64) as usize
    }

    /// Build the bit array covering every key
    pub fn bits<'a, I>(&self, keys: I) -> Vec<u64>
    where
        I: IntoIterator<Item = &'a [u8]>,
    {
        let mut bits = self.empty();
        for key in keys {
            self.insert(&mut bits, key);
        }
        bits
    }

    pub fn empty(&self) -> Vec<u64> {
        vec![0u64; self.words()]
    }

    /// Set the bits for one key; `bits` must come from [`Bloom::empty`]
    pub fn insert(&self, bits: &mut [u64], key: &[u8]) {
        for (idx, bit) in self.positions(key) {
            if let Some(word) = bits.get_mut(idx) {
                *word |= bit;
            }
        }
    }

    /// False only if `key` is certainly absent
    pub fn maybe(&self, key: &[u8], bits: &[u64]) -> bool {
        self.positions(key).iter().all(|&(idx, bit)| match bits.get(idx) {
            Some(word) => word & bit == bit,
            None => {
                tracing::error!(words = bits.len(), idx, "bloom position outside bit array");
                false
            }
        })
    }

    fn positions(&self, key: &[u8]) -> [(usize, u64); 2] {
        let position = |hash: u64| {
            let pos = hash % self.bit_len;
            ((pos / 64) as usize, 1u64 << (pos % 64))
        };
        [position(djb2(key)), position(murmur2(key))]
    }
}
