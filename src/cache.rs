//! Read cache
//!
//! A byte-bounded LRU over lookup outcomes. Each database keeps one for keys
//! it owns (SSTable results) and one for keys fetched from other ranks.
//! Tombstone and not-found outcomes are cached like values so repeated misses
//! skip the generation scan or the round trip.
//!
//! ## Structure
//! ```text
//!   map: key → slot            slab: [slot0][slot1][slot2]...
//!                                       ▲ head (most recent)
//!   head ⇄ ... ⇄ tail                    tail (evicted first)
//! ```

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;

use crate::memtable::{Lookup, RECORD_OVERHEAD};

struct Node {
    key: Vec<u8>,
    value: Lookup,
    size: usize,
    prev: Option<usize>,
    next: Option<usize>,
}

#[derive(Default)]
struct LruInner {
    slab: Vec<Option<Node>>,
    free: Vec<usize>,
    map: HashMap<Vec<u8>, usize>,
    head: Option<usize>,
    tail: Option<usize>,
    size: usize,
}

impl LruInner {
    fn node(&self, slot: usize) -> Option<&Node> {
        self.slab.get(slot).and_then(|n| n.as_ref())
    }

    fn node_mut(&mut self, slot: usize) -> Option<&mut Node> {
        self.slab.get_mut(slot).and_then(|n| n.as_mut())
    }

    fn unlink(&mut self, slot: usize) {
        let (prev, next) = match self.node(slot) {
            Some(n) => (n.prev, n.next),
            None => return,
        };
        match prev {
            Some(p) => {
                if let Some(n) = self.node_mut(p) {
                    n.next = next;
                }
            }
            None => self.head = next,
        }
        match next {
            Some(nx) => {
                if let Some(n) = self.node_mut(nx) {
                    n.prev = prev;
                }
            }
            None => self.tail = prev,
        }
    }

    fn push_front(&mut self, slot: usize) {
        let old_head = self.head;
        if let Some(n) = self.node_mut(slot) {
            n.prev = None;
            n.next = old_head;
        }
        if let Some(h) = old_head {
            if let Some(n) = self.node_mut(h) {
                n.prev = Some(slot);
            }
        }
        self.head = Some(slot);
        if self.tail.is_none() {
            self.tail = Some(slot);
        }
    }

    fn remove_slot(&mut self, slot: usize) -> Option<Node> {
        self.unlink(slot);
        let node = self.slab.get_mut(slot).and_then(|n| n.take())?;
        self.map.remove(&node.key);
        self.size -= node.size;
        self.free.push(slot);
        Some(node)
    }

    fn insert(&mut self, node: Node) {
        self.size += node.size;
        let key = node.key.clone();
        let slot = match self.free.pop() {
            Some(slot) => {
                self.slab[slot] = Some(node);
                slot
            }
            None => {
                self.slab.push(Some(node));
                self.slab.len() - 1
            }
        };
        self.map.insert(key, slot);
        self.push_front(slot);
    }
}

/// Byte-bounded LRU cache of lookup outcomes
pub struct Cache {
    capacity: usize,
    enabled: bool,
    inner: Mutex<LruInner>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl Cache {
    pub fn new(capacity: usize, enabled: bool) -> Self {
        Self {
            capacity,
            enabled,
            inner: Mutex::new(LruInner::default()),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Cache an outcome, replacing any earlier entry for the key
    ///
    /// Evicts least-recently-used entries until the total fits the capacity.
    /// An entry larger than the whole capacity is not cached.
    pub fn put(&self, key: &[u8], value: Lookup) {
        if !self.enabled {
            return;
        }
        let size = key.len() + value_len(&value) + RECORD_OVERHEAD;

        let mut inner = self.inner.lock();
        if let Some(&slot) = inner.map.get(key) {
            inner.remove_slot(slot);
        }
        if size > self.capacity {
            return;
        }

        inner.insert(Node {
            key: key.to_vec(),
            value,
            size,
            prev: None,
            next: None,
        });

        while inner.size > self.capacity {
            match inner.tail {
                Some(tail) => {
                    if let Some(evicted) = inner.remove_slot(tail) {
                        tracing::trace!(key_len = evicted.key.len(), size = evicted.size, "cache eviction");
                    }
                }
                None => break,
            }
        }
    }

    /// Cached outcome, or `None` when the key is not cached
    pub fn get(&self, key: &[u8]) -> Option<Lookup> {
        if !self.enabled {
            return None;
        }
        let mut inner = self.inner.lock();
        let slot = match inner.map.get(key) {
            Some(&slot) => slot,
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                return None;
            }
        };
        inner.unlink(slot);
        inner.push_front(slot);
        self.hits.fetch_add(1, Ordering::Relaxed);
        inner.node(slot).map(|n| n.value.clone())
    }

    pub fn invalidate(&self, key: &[u8]) {
        if !self.enabled {
            return;
        }
        let mut inner = self.inner.lock();
        if let Some(&slot) = inner.map.get(key) {
            inner.remove_slot(slot);
        }
    }

    pub fn invalidate_all(&self) {
        let mut inner = self.inner.lock();
        *inner = LruInner::default();
    }

    /// Total accounted bytes of cached entries
    pub fn size(&self) -> usize {
        self.inner.lock().size
    }

    pub fn len(&self) -> usize {
        self.inner.lock().map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }
}

fn value_len(value: &Lookup) -> usize {
    match value {
        Lookup::Found(v) => v.len(),
        _ => 0,
    }
}
