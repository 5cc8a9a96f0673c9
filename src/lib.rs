//! # ShardKV
//!
//! A partitioned, in-memory-first key-value store for checkpoint/restart of
//! large jobs running as cooperating ranks:
//! - Keys hashed to an owning rank; each rank serves its shard from memory
//! - Frozen memtables spill to immutable SSTable generations with bloom filters
//! - Sequential or relaxed (write-combined) remote writes
//! - Checkpoint to a shared directory; restart on the same or a different
//!   number of ranks
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                    Application threads                       │
//! └─────────────────────┬───────────────────────────────────────┘
//!                       │ put / get / update / barrier
//! ┌─────────────────────▼───────────────────────────────────────┐
//! │                          Db                                  │
//! │          (owner routing, consistency, protection)            │
//! └───────┬──────────────────────┬──────────────────────┬───────┘
//!         │ local                │ remote               │ flush / load
//!         ▼                      ▼                      ▼
//!  ┌─────────────┐        ┌─────────────┐        ┌─────────────┐
//!  │  MemTable   │        │ Dispatcher  │───────▶│  Compactor  │
//!  │ + immutables│        │   (queue)   │        └──────┬──────┘
//!  └─────────────┘        └──────┬──────┘               ▼
//!                                │ frames        ┌─────────────┐
//!                                ▼               │   SSTable   │
//!                         ┌─────────────┐        │ generations │
//!                         │  Listener   │        └─────────────┘
//!                         │ (peer rank) │
//!                         └─────────────┘
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod config;
pub mod error;

pub mod bloom;
pub mod cache;
pub mod command;
pub mod compactor;
mod context;
pub mod db;
pub mod hasher;
pub mod memtable;
pub mod network;
pub mod protocol;
pub mod remote_buffer;
pub mod signal;
pub mod storage;

// =============================================================================
// Public API Re-exports
// =============================================================================

pub use config::{Config, Consistency, Level, OpenOptions, PartitionFn, Protection, SearchMode};
pub use context::Context;
pub use db::{Db, EventId, LocalIter, Position, UpdateFn, UpdateOutcome};
pub use error::{Result, ShardError};
pub use memtable::{Lookup, Slice};
pub use network::{MemEndpoint, MemFabric, Transport};

// =============================================================================
// Version Info
// =============================================================================

/// Current version of ShardKV
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
