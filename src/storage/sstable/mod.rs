//! SSTable generation files
//!
//! One flushed memtable becomes one generation made of three files.
//!
//! ## File Format
//! ```text
//! {name}_{rank}_{level}_{generation}.idx   index, one record per entry
//! ┌──────────────────────────────────────────────────────────┐
//! │ Offset: u64 (8) | KeyLen: u64 (8) | Tombstone: u8 (1)    │
//! │ ... repeated, sorted by key ...                          │
//! └──────────────────────────────────────────────────────────┘
//!
//! {name}_{rank}_{level}_{generation}.sst   data
//! ┌──────────────────────────────────────────────────────────┐
//! │ [Key][Value][Key][Value]...                              │
//! │ (value length = next offset - offset - key length)      │
//! └──────────────────────────────────────────────────────────┘
//!
//! {name}_{rank}_{level}_{generation}.blm   bloom (optional)
//! ┌──────────────────────────────────────────────────────────┐
//! │ Word: u64 ... (bloom_bits / 64 words)                    │
//! └──────────────────────────────────────────────────────────┘
//! ```
//! All integers are little-endian. Level is always 0.

mod builder;
mod iterator;
mod reader;

use std::path::{Path, PathBuf};

pub use builder::{write_bloom, GenerationBuilder};
pub use iterator::{GenerationIter, Record};
pub use reader::{read_bloom, GenerationFile, GenerationReader};

/// Size of one packed index record
pub(crate) const INDEX_RECORD_SIZE: usize = 17;

/// Level component of every file name (no leveling)
pub(crate) const LEVEL: u32 = 0;

/// Location of one entry in the data file
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexRecord {
    /// Cumulative offset of the key in the data file
    pub offset: u64,
    pub key_len: u64,
    pub tombstone: bool,
}

impl IndexRecord {
    pub fn encode(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&self.offset.to_le_bytes());
        buf.extend_from_slice(&self.key_len.to_le_bytes());
        buf.push(self.tombstone as u8);
    }

    pub fn decode(raw: &[u8; INDEX_RECORD_SIZE]) -> Self {
        let mut offset = [0u8; 8];
        let mut key_len = [0u8; 8];
        offset.copy_from_slice(&raw[0..8]);
        key_len.copy_from_slice(&raw[8..16]);
        Self {
            offset: u64::from_le_bytes(offset),
            key_len: u64::from_le_bytes(key_len),
            tombstone: raw[16] != 0,
        }
    }
}

/// Paths of the three files of one generation
#[derive(Debug, Clone)]
pub struct GenerationPaths {
    pub index: PathBuf,
    pub data: PathBuf,
    pub bloom: PathBuf,
}

impl GenerationPaths {
    /// `{dir}/{name}_{rank}_0_{generation}.{idx,sst,blm}`
    pub fn new(dir: &Path, name: &str, rank: usize, generation: u64) -> Self {
        let stem = format!("{}_{}_{}_{}", name, rank, LEVEL, generation);
        Self {
            index: dir.join(format!("{}.idx", stem)),
            data: dir.join(format!("{}.sst", stem)),
            bloom: dir.join(format!("{}.blm", stem)),
        }
    }
}
