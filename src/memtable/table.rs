//! MemTable implementation
//!
//! Arena + BTreeMap memtable behind a parking_lot Mutex.

use std::collections::BTreeMap;

use parking_lot::Mutex;

use crate::hasher::Hasher;

use super::{Lookup, Slice};

/// In-memory table for one shard generation
pub struct MemTable {
    /// In-memory identity, used as the position handle of its records
    id: u64,
    inner: Mutex<Inner>,
}

#[derive(Default)]
struct Inner {
    /// Record arena; positions are stable for the table's lifetime
    slices: Vec<Slice>,
    /// key → arena position
    index: BTreeMap<Vec<u8>, usize>,
    /// Optional bucket index: bucket → arena positions
    buckets: Option<Vec<Vec<usize>>>,
    /// Aggregate accounted size in bytes
    size: usize,
}

impl Inner {
    fn position(&self, key: &[u8]) -> Option<usize> {
        match &self.buckets {
            Some(buckets) => {
                let bucket = Hasher::key_bucket(key, buckets.len());
                buckets[bucket]
                    .iter()
                    .copied()
                    .find(|&pos| self.slices[pos].key == key)
            }
            None => self.index.get(key).copied(),
        }
    }

    fn insert(&mut self, slice: Slice) {
        let pos = self.slices.len();
        self.size += slice.size();
        if let Some(buckets) = &mut self.buckets {
            let bucket = Hasher::key_bucket(&slice.key, buckets.len());
            buckets[bucket].push(pos);
        }
        self.index.insert(slice.key.clone(), pos);
        self.slices.push(slice);
    }
}

impl MemTable {
    /// Create a new empty MemTable
    pub fn new(id: u64) -> Self {
        Self {
            id,
            inner: Mutex::new(Inner::default()),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Insert or merge a record, returning the table's size afterwards
    ///
    /// Merge rules against an existing record for the same key:
    /// - tombstone over tombstone: no-op
    /// - tombstone over value: the existing record becomes a tombstone
    /// - otherwise: the value is replaced (in place when lengths match)
    pub fn put(&self, slice: Slice) -> usize {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        let pos = match inner.position(&slice.key) {
            Some(pos) => pos,
            None => {
                inner.insert(slice);
                return inner.size;
            }
        };

        let old_len = inner.slices[pos].value.len();
        let existing = &mut inner.slices[pos];
        match (existing.tombstone, slice.tombstone) {
            (true, true) => {}
            (false, true) => {
                existing.tombstone = true;
                existing.value = Vec::new();
                inner.size -= old_len;
            }
            _ => {
                existing.replace_value(&slice.value);
                existing.tombstone = slice.tombstone;
                inner.size = inner.size - old_len + slice.value.len();
            }
        }
        inner.size
    }

    /// Point lookup
    pub fn get(&self, key: &[u8]) -> Lookup {
        let inner = self.inner.lock();
        match inner.position(key) {
            Some(pos) => {
                let slice = &inner.slices[pos];
                if slice.tombstone {
                    Lookup::Tombstone
                } else {
                    Lookup::Found(slice.value.clone())
                }
            }
            None => Lookup::NotFound,
        }
    }

    pub fn contains(&self, key: &[u8]) -> bool {
        self.inner.lock().position(key).is_some()
    }

    /// Key-ordered copy of every record (tombstones included)
    pub fn snapshot(&self) -> Vec<Slice> {
        let inner = self.inner.lock();
        inner
            .index
            .values()
            .map(|&pos| inner.slices[pos].clone())
            .collect()
    }

    /// Build the bucket index over the current records
    pub fn hash(&self) {
        let mut inner = self.inner.lock();
        let size = Hasher::bucket_size(inner.slices.len());
        let mut buckets = vec![Vec::new(); size];
        for (pos, slice) in inner.slices.iter().enumerate() {
            buckets[Hasher::key_bucket(&slice.key, size)].push(pos);
        }
        tracing::debug!(table = self.id, records = inner.slices.len(), buckets = size, "memtable hashed");
        inner.buckets = Some(buckets);
    }

    /// Drop the bucket index
    pub fn clear_bucket(&self) {
        self.inner.lock().buckets = None;
    }

    pub fn is_hashed(&self) -> bool {
        self.inner.lock().buckets.is_some()
    }

    /// Deep copy of every record into a new table with the same id
    pub fn duplicate(&self) -> MemTable {
        let inner = self.inner.lock();
        let copy = MemTable::new(self.id);
        {
            let mut dst = copy.inner.lock();
            for &pos in inner.index.values() {
                dst.insert(inner.slices[pos].clone());
            }
        }
        copy
    }

    /// Accounted size in bytes
    pub fn size(&self) -> usize {
        self.inner.lock().size
    }

    pub fn len(&self) -> usize {
        self.inner.lock().slices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().slices.is_empty()
    }
}

impl std::fmt::Debug for MemTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("MemTable")
            .field("id", &self.id)
            .field("records", &inner.slices.len())
            .field("size", &inner.size)
            .field("hashed", &inner.buckets.is_some())
            .finish()
    }
}
