//! Configuration for ShardKV
//!
//! Centralized configuration with sensible defaults. A [`Config`] is shared by
//! every database opened on a [`crate::Context`]; per-database knobs live in
//! [`OpenOptions`].

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use crate::error::{Result, ShardError};

/// Custom partition function: `(key, rank_count) -> owner rank`
pub type PartitionFn = Arc<dyn Fn(&[u8], usize) -> usize + Send + Sync>;

/// Main configuration for a ShardKV context
#[derive(Debug, Clone)]
pub struct Config {
    // -------------------------------------------------------------------------
    // Storage Configuration
    // -------------------------------------------------------------------------
    /// Root directory for all generation files
    /// Internal structure:
    ///   {repository}/
    ///     └── {rank}/          ({db}_{rank}_{level}_{generation}.{idx,sst,blm})
    pub repository: PathBuf,

    /// Remove the repository when the context shuts down
    pub destroy_repository: bool,

    /// Lookup strategy used against persisted indexes
    pub search_mode: SearchMode,

    /// Build and consult a bloom filter per generation
    pub bloom: bool,

    /// Bloom filter width in bits (multiple of 64)
    pub bloom_bits: usize,

    /// Ranks per storage group (0 = every rank is its own group)
    pub group_size: usize,

    // -------------------------------------------------------------------------
    // MemTable Configuration
    // -------------------------------------------------------------------------
    /// Max size of a memtable before it is frozen (in bytes)
    pub memtable_size: usize,

    // -------------------------------------------------------------------------
    // Remote Write Configuration
    // -------------------------------------------------------------------------
    /// Default consistency mode for newly opened databases
    pub consistency: Consistency,

    /// Write-combining buffer size per destination rank (in bytes)
    pub remote_buffer_size: usize,

    /// Largest value size eligible for write-combining (in bytes)
    pub remote_buffer_entry_max: usize,

    // -------------------------------------------------------------------------
    // Cache Configuration
    // -------------------------------------------------------------------------
    /// Capacity of each read cache (in bytes)
    pub cache_size: usize,

    /// Cache SSTable results for locally owned keys
    pub local_cache: bool,

    /// Cache fetched results for remotely owned keys (read-only mode)
    pub remote_cache: bool,

    // -------------------------------------------------------------------------
    // Restart Configuration
    // -------------------------------------------------------------------------
    /// Redistribute records on restart even when the rank count matches
    pub force_redistribute: bool,

    // -------------------------------------------------------------------------
    // Worker Configuration
    // -------------------------------------------------------------------------
    /// Capacity of the dispatcher work queue
    pub queue_capacity: usize,

    /// Capacity of the compactor work queue
    pub compactor_queue_capacity: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            repository: PathBuf::from("./shardkv_data"),
            destroy_repository: true,
            search_mode: SearchMode::Binary,
            bloom: true,
            bloom_bits: 64 * 1024 * 4,
            group_size: 1,
            memtable_size: 1024 * 1024 * 1024, // 1 GB
            consistency: Consistency::Relaxed,
            remote_buffer_size: 128 * 1024,     // 128 KB
            remote_buffer_entry_max: 4 * 1024, // 4 KB
            cache_size: 128 * 1024 * 1024,      // 128 MB
            local_cache: true,
            remote_cache: true,
            force_redistribute: false,
            queue_capacity: 1024,
            compactor_queue_capacity: 4,
        }
    }
}

impl Config {
    /// Create a new config builder
    pub fn builder() -> ConfigBuilder {
        ConfigBuilder::default()
    }

    /// Check invariants that the storage and queue layers rely on
    pub fn validate(&self) -> Result<()> {
        if self.bloom && (self.bloom_bits == 0 || self.bloom_bits % 64 != 0) {
            return Err(ShardError::Config(format!(
                "bloom_bits must be a non-zero multiple of 64, got {}",
                self.bloom_bits
            )));
        }
        if self.queue_capacity == 0 || self.compactor_queue_capacity == 0 {
            return Err(ShardError::Config("queue capacities must be non-zero".to_string()));
        }
        if self.memtable_size == 0 {
            return Err(ShardError::Config("memtable_size must be non-zero".to_string()));
        }
        Ok(())
    }

    /// Storage group of a rank
    pub fn group_of(&self, rank: usize) -> usize {
        if self.group_size == 0 {
            rank
        } else {
            rank / self.group_size
        }
    }
}

/// Builder for Config
#[derive(Default)]
pub struct ConfigBuilder {
    config: Config,
}

impl ConfigBuilder {
    /// Set the repository directory (root for all storage)
    pub fn repository(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.repository = path.into();
        self
    }

    /// Remove the repository on shutdown
    pub fn destroy_repository(mut self, destroy: bool) -> Self {
        self.config.destroy_repository = destroy;
        self
    }

    /// Set the SSTable lookup strategy
    pub fn search_mode(mut self, mode: SearchMode) -> Self {
        self.config.search_mode = mode;
        self
    }

    /// Enable or disable bloom filters
    pub fn bloom(mut self, enable: bool) -> Self {
        self.config.bloom = enable;
        self
    }

    /// Set the bloom filter width in bits
    pub fn bloom_bits(mut self, bits: usize) -> Self {
        self.config.bloom_bits = bits;
        self
    }

    /// Set the storage group size
    pub fn group_size(mut self, size: usize) -> Self {
        self.config.group_size = size;
        self
    }

    /// Set the memtable size threshold (in bytes)
    pub fn memtable_size(mut self, size: usize) -> Self {
        self.config.memtable_size = size;
        self
    }

    /// Set the default consistency mode
    pub fn consistency(mut self, consistency: Consistency) -> Self {
        self.config.consistency = consistency;
        self
    }

    /// Set the per-destination write-combining buffer size (in bytes)
    pub fn remote_buffer_size(mut self, size: usize) -> Self {
        self.config.remote_buffer_size = size;
        self
    }

    /// Set the largest value eligible for write-combining (in bytes)
    pub fn remote_buffer_entry_max(mut self, size: usize) -> Self {
        self.config.remote_buffer_entry_max = size;
        self
    }

    /// Set the capacity of each read cache (in bytes)
    pub fn cache_size(mut self, size: usize) -> Self {
        self.config.cache_size = size;
        self
    }

    /// Enable or disable the local read cache
    pub fn local_cache(mut self, enable: bool) -> Self {
        self.config.local_cache = enable;
        self
    }

    /// Enable or disable the remote read cache
    pub fn remote_cache(mut self, enable: bool) -> Self {
        self.config.remote_cache = enable;
        self
    }

    /// Always redistribute on restart
    pub fn force_redistribute(mut self, force: bool) -> Self {
        self.config.force_redistribute = force;
        self
    }

    /// Set the dispatcher queue capacity
    pub fn queue_capacity(mut self, capacity: usize) -> Self {
        self.config.queue_capacity = capacity;
        self
    }

    /// Set the compactor queue capacity
    pub fn compactor_queue_capacity(mut self, capacity: usize) -> Self {
        self.config.compactor_queue_capacity = capacity;
        self
    }

    pub fn build(self) -> Config {
        self.config
    }
}

// =============================================================================
// Modes
// =============================================================================

/// Ordering guarantee for remote writes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum Consistency {
    /// Every remote write is a synchronous RPC
    Sequential = 0x1,
    /// Remote writes are buffered until a fence, barrier, or full buffer
    Relaxed = 0x2,
}

impl TryFrom<i32> for Consistency {
    type Error = ShardError;

    fn try_from(value: i32) -> Result<Self> {
        match value {
            0x1 => Ok(Consistency::Sequential),
            0x2 => Ok(Consistency::Relaxed),
            _ => Err(ShardError::InvalidMode(format!("consistency 0x{:x}", value))),
        }
    }
}

/// Access restriction on a database handle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum Protection {
    ReadWrite = 0x08,
    WriteOnly = 0x10,
    ReadOnly = 0x20,
    UpdateOnly = 0x40,
}

impl Protection {
    /// Whether puts and deletes are accepted
    pub fn allows_write(self) -> bool {
        self != Protection::ReadOnly
    }

    /// Whether a write must invalidate cached reads of the same key
    pub fn invalidates_on_write(self) -> bool {
        matches!(self, Protection::ReadWrite | Protection::UpdateOnly)
    }

    /// Whether the memtable may be hash-indexed
    pub fn allows_hash_index(self) -> bool {
        matches!(self, Protection::ReadOnly | Protection::UpdateOnly)
    }
}

impl TryFrom<i32> for Protection {
    type Error = ShardError;

    fn try_from(value: i32) -> Result<Self> {
        match value {
            0x08 => Ok(Protection::ReadWrite),
            0x10 => Ok(Protection::WriteOnly),
            0x20 => Ok(Protection::ReadOnly),
            0x40 => Ok(Protection::UpdateOnly),
            _ => Err(ShardError::InvalidMode(format!("protection 0x{:x}", value))),
        }
    }
}

/// Persisted-index search strategy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchMode {
    Sequential,
    Binary,
}

/// Durability level requested by fence/barrier
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum Level {
    /// Pending writes reach the owner's memtable
    MemTable = 0x1,
    /// Pending writes reach the owner's memtable and are flushed to SSTable
    SsTable = 0x2,
}

impl Level {
    pub fn includes_sstable(self) -> bool {
        self == Level::SsTable
    }
}

impl TryFrom<i32> for Level {
    type Error = ShardError;

    fn try_from(value: i32) -> Result<Self> {
        match value {
            0x1 => Ok(Level::MemTable),
            0x2 | 0x3 => Ok(Level::SsTable),
            _ => Err(ShardError::Protocol(format!("unknown level 0x{:x}", value))),
        }
    }
}

// =============================================================================
// Per-database options
// =============================================================================

/// Options supplied when opening or restarting a database
#[derive(Clone)]
pub struct OpenOptions {
    /// Typical key length hint
    pub key_len: usize,
    /// Typical value length hint; enables write-combining when small enough
    pub value_len: usize,
    /// Custom partition function (defaults to hash modulo rank count)
    pub partition: Option<PartitionFn>,
    /// Consistency override (defaults to the context config)
    pub consistency: Option<Consistency>,
    /// Initial protection mode
    pub protection: Protection,
}

impl Default for OpenOptions {
    fn default() -> Self {
        Self {
            key_len: 0,
            value_len: 0,
            partition: None,
            consistency: None,
            protection: Protection::ReadWrite,
        }
    }
}

impl fmt::Debug for OpenOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OpenOptions")
            .field("key_len", &self.key_len)
            .field("value_len", &self.value_len)
            .field("partition", &self.partition.as_ref().map(|_| "custom"))
            .field("consistency", &self.consistency)
            .field("protection", &self.protection)
            .finish()
    }
}

impl OpenOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn key_len(mut self, len: usize) -> Self {
        self.key_len = len;
        self
    }

    pub fn value_len(mut self, len: usize) -> Self {
        self.value_len = len;
        self
    }

    pub fn partition(mut self, f: PartitionFn) -> Self {
        self.partition = Some(f);
        self
    }

    pub fn consistency(mut self, consistency: Consistency) -> Self {
        self.consistency = Some(consistency);
        self
    }

    pub fn protection(mut self, protection: Protection) -> Self {
        self.protection = protection;
        self
    }
}
