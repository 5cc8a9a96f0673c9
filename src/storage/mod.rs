//! Storage Module
//!
//! Persistent, log-structured storage of flushed memtables.
//!
//! ## Responsibilities
//! - Persist each frozen memtable as an immutable generation
//! - Point lookups newest → oldest with bloom-filter skipping
//! - Table of contents and file transfer for checkpoint/restart
//!
//! ## Layout
//! ```text
//! {repository}/
//!   └── {rank}/
//!         ├── {db}_{rank}_0_1.idx / .sst / .blm
//!         ├── {db}_{rank}_0_2.idx / .sst / .blm
//!         └── ...
//! {checkpoint}/
//!   ├── {db}.toc
//!   └── {db}_{rank}_0_{generation}.idx / .sst / .blm   (every rank)
//! ```

mod manager;
pub mod sstable;
pub mod toc;

pub use manager::SsTable;
pub use sstable::{GenerationBuilder, GenerationFile, GenerationPaths, GenerationReader, IndexRecord};
