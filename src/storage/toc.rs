//! Table of contents
//!
//! Written by rank 0 at checkpoint time, one file per database:
//! ```text
//! {path}/{name}.toc
//! ┌───────────────────────┬───────────────────────────────────────┐
//! │ RankCount: i32 (4)    │ Generation: u64 (8) x RankCount       │
//! └───────────────────────┴───────────────────────────────────────┘
//! ```

use std::fs;
use std::path::{Path, PathBuf};

use crate::error::{Result, ShardError};

pub fn toc_path(path: &Path, name: &str) -> PathBuf {
    path.join(format!("{}.toc", name))
}

/// Persist the newest generation id of every rank
pub fn write_toc(path: &Path, name: &str, generations: &[u64]) -> Result<()> {
    let mut raw = Vec::with_capacity(4 + generations.len() * 8);
    raw.extend_from_slice(&(generations.len() as i32).to_le_bytes());
    for generation in generations {
        raw.extend_from_slice(&generation.to_le_bytes());
    }
    fs::write(toc_path(path, name), raw)?;
    Ok(())
}

/// Read the per-rank generation ids of a checkpoint
pub fn read_toc(path: &Path, name: &str) -> Result<Vec<u64>> {
    let file = toc_path(path, name);
    let raw = fs::read(&file)?;
    decode_toc(&raw).map_err(|e| match e {
        ShardError::Corrupt(msg) => ShardError::Corrupt(format!("{}: {}", file.display(), msg)),
        other => other,
    })
}

pub fn decode_toc(raw: &[u8]) -> Result<Vec<u64>> {
    if raw.len() < 4 {
        return Err(ShardError::Corrupt("toc header truncated".to_string()));
    }
    let mut count = [0u8; 4];
    count.copy_from_slice(&raw[0..4]);
    let count = i32::from_le_bytes(count);
    if count <= 0 || raw.len() != 4 + count as usize * 8 {
        return Err(ShardError::Corrupt(format!(
            "toc declares {} ranks in {} bytes",
            count,
            raw.len()
        )));
    }
    Ok(raw[4..]
        .chunks_exact(8)
        .map(|chunk| {
            let mut word = [0u8; 8];
            word.copy_from_slice(chunk);
            u64::from_le_bytes(word)
        })
        .collect())
}
