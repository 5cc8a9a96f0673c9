//! Remote write-combining buffer
//!
//! Pending writes to other ranks are appended to one region per destination
//! and shipped as a single MIGRATE once the region is full or a fence asks
//! for it. The same record encoding carries sorted remote memtables.
//!
//! ## Record Format
//! ```text
//! ┌──────────────┬──────────────┬───────┬─────────┬───────────────┐
//! │ KeyLen: u64  │ ValLen: u64  │  Key  │  Value  │ Tombstone: u8 │
//! └──────────────┴──────────────┴───────┴─────────┴───────────────┘
//! ```
//! Integers are little-endian.

use bytes::{Buf, BufMut};
use parking_lot::Mutex;

use crate::error::{Result, ShardError};
use crate::memtable::{Slice, RECORD_OVERHEAD};

/// Per-destination write-combining regions
pub struct RemoteBuffer {
    /// Capacity of each region in bytes
    unit: usize,
    regions: Mutex<Vec<Vec<u8>>>,
}

impl RemoteBuffer {
    pub fn new(nranks: usize, unit: usize) -> Self {
        Self {
            unit,
            regions: Mutex::new(vec![Vec::new(); nranks]),
        }
    }

    pub fn unit(&self) -> usize {
        self.unit
    }

    /// Whether a record fits in `rank`'s region without exceeding the unit
    pub fn available(&self, key_len: usize, value_len: usize, rank: usize) -> bool {
        let regions = self.regions.lock();
        match regions.get(rank) {
            Some(region) => region.len() + record_size(key_len, value_len) <= self.unit,
            None => false,
        }
    }

    /// Append a record if it fits; returns false when the region is full
    pub fn try_put(&self, rank: usize, key: &[u8], value: &[u8], tombstone: bool) -> bool {
        let mut regions = self.regions.lock();
        let region = match regions.get_mut(rank) {
            Some(region) => region,
            None => return false,
        };
        if region.len() + record_size(key.len(), value.len()) > self.unit {
            return false;
        }
        encode_record(region, key, value, tombstone);
        true
    }

    /// Append a record unconditionally
    pub fn put(&self, rank: usize, key: &[u8], value: &[u8], tombstone: bool) {
        let mut regions = self.regions.lock();
        if let Some(region) = regions.get_mut(rank) {
            encode_record(region, key, value, tombstone);
        }
    }

    /// Pending bytes for `rank`
    pub fn size(&self, rank: usize) -> usize {
        self.regions.lock().get(rank).map_or(0, |r| r.len())
    }

    /// Snapshot and reset `rank`'s region
    pub fn take(&self, rank: usize) -> Vec<u8> {
        let mut regions = self.regions.lock();
        match regions.get_mut(rank) {
            Some(region) => std::mem::take(region),
            None => Vec::new(),
        }
    }

    /// Snapshot and reset every non-empty region
    pub fn take_all(&self) -> Vec<(usize, Vec<u8>)> {
        let mut regions = self.regions.lock();
        regions
            .iter_mut()
            .enumerate()
            .filter(|(_, region)| !region.is_empty())
            .map(|(rank, region)| (rank, std::mem::take(region)))
            .collect()
    }

    /// Read-your-writes lookup of the newest pending record for `key`
    pub fn find(&self, rank: usize, key: &[u8]) -> Option<Slice> {
        let regions = self.regions.lock();
        find_record(regions.get(rank)?, rank, key)
    }
}

/// Newest record for `key` in a run of encoded records
pub fn find_record(records: &[u8], rank: usize, key: &[u8]) -> Option<Slice> {
    decode_records(records, rank)
        .ok()?
        .into_iter()
        .rev()
        .find(|s| s.key == key)
}

/// Serialized size of one record
pub fn record_size(key_len: usize, value_len: usize) -> usize {
    key_len + value_len + RECORD_OVERHEAD
}

pub fn encode_record(buf: &mut Vec<u8>, key: &[u8], value: &[u8], tombstone: bool) {
    buf.reserve(record_size(key.len(), value.len()));
    buf.put_u64_le(key.len() as u64);
    buf.put_u64_le(value.len() as u64);
    buf.put_slice(key);
    buf.put_slice(value);
    buf.put_u8(tombstone as u8);
}

/// Decode a run of records; `rank` is stamped on every slice
pub fn decode_records(mut buf: &[u8], rank: usize) -> Result<Vec<Slice>> {
    let mut slices = Vec::new();
    while buf.has_remaining() {
        if buf.remaining() < 16 {
            return Err(ShardError::Protocol(format!(
                "record header truncated ({} bytes left)",
                buf.remaining()
            )));
        }
        let key_len = buf.get_u64_le() as usize;
        let value_len = buf.get_u64_le() as usize;
        let body = key_len
            .checked_add(value_len)
            .and_then(|n| n.checked_add(1))
            .filter(|&n| n <= buf.remaining());
        if body.is_none() {
            return Err(ShardError::Protocol(format!(
                "record body truncated (key {} value {} left {})",
                key_len,
                value_len,
                buf.remaining()
            )));
        }
        let key = buf[..key_len].to_vec();
        buf.advance(key_len);
        let value = buf[..value_len].to_vec();
        buf.advance(value_len);
        let tombstone = buf.get_u8() != 0;
        slices.push(Slice {
            key,
            value,
            tombstone,
            rank,
        });
    }
    Ok(slices)
}
