//! MemTable Module
//!
//! In-memory shard buffer for recent writes.
//!
//! ## Responsibilities
//! - Insert/merge records with tombstone semantics
//! - Track aggregate byte size for freeze decisions
//! - Ordered snapshots for SSTable flush and bulk migration
//! - Optional hash-bucket index for read-only/update-only phases
//!
//! ## Data Structure Choice
//! Records live in an arena (`Vec<Slice>`) addressed by position. A `BTreeMap`
//! from key to position gives ordered traversal and O(log n) lookup; the
//! bucket index (built by [`MemTable::hash`]) maps `djb2(key) & (n - 1)` to
//! arena positions for O(1) lookup. Frozen tables are shared as
//! `Arc<MemTable>` between the immutable chain and live iterators, and are
//! dropped once the last holder lets go.

mod slice;
mod table;

pub use slice::{Slice, RECORD_OVERHEAD};
pub use table::MemTable;

/// Tri-state lookup outcome
///
/// `Tombstone` is distinct from `NotFound`: it shadows older generations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Lookup {
    Found(Vec<u8>),
    Tombstone,
    NotFound,
}

impl Lookup {
    /// Whether this result ends a newest-to-oldest search
    pub fn is_definitive(&self) -> bool {
        !matches!(self, Lookup::NotFound)
    }

    pub fn into_value(self) -> Option<Vec<u8>> {
        match self {
            Lookup::Found(v) => Some(v),
            _ => None,
        }
    }

    /// Wire status code (1 found, 2 tombstone, 3 not found)
    pub fn code(&self) -> u64 {
        match self {
            Lookup::Found(_) => 1,
            Lookup::Tombstone => 2,
            Lookup::NotFound => 3,
        }
    }
}
