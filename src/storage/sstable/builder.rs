//! Generation Builder
//!
//! Writes sorted records to a new generation's index, data and bloom files.

use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::Path;

use crate::bloom::Bloom;
use crate::error::{Result, ShardError};

use super::{GenerationPaths, IndexRecord, INDEX_RECORD_SIZE};

/// Builder for one generation
pub struct GenerationBuilder {
    paths: GenerationPaths,
    index: BufWriter<File>,
    data: BufWriter<File>,
    /// Bloom geometry and bits accumulated so far
    bloom: Option<(Bloom, Vec<u64>)>,
    /// Current write position in the data file
    offset: u64,
    /// Last key written, to enforce sorted order
    last_key: Option<Vec<u8>>,
    entry_count: u64,
}

impl GenerationBuilder {
    /// Create the index and data files; call `add()` in sorted key order,
    /// then `finish()`.
    pub fn new(paths: GenerationPaths, bloom: Option<Bloom>) -> Result<Self> {
        let index = BufWriter::new(create(&paths.index)?);
        let data = BufWriter::new(create(&paths.data)?);

        Ok(Self {
            paths,
            index,
            data,
            bloom: bloom.map(|b| (b, b.empty())),
            offset: 0,
            last_key: None,
            entry_count: 0,
        })
    }

    /// Append one record (must be called in sorted key order)
    pub fn add(&mut self, key: &[u8], value: &[u8], tombstone: bool) -> Result<()> {
        if let Some(last) = &self.last_key {
            if last.as_slice() >= key {
                return Err(ShardError::Storage(format!(
                    "generation keys out of order in {}",
                    self.paths.data.display()
                )));
            }
        }

        let mut record = Vec::with_capacity(INDEX_RECORD_SIZE);
        IndexRecord {
            offset: self.offset,
            key_len: key.len() as u64,
            tombstone,
        }
        .encode(&mut record);
        self.index.write_all(&record)?;

        self.data.write_all(key)?;
        self.data.write_all(value)?;
        self.offset += (key.len() + value.len()) as u64;

        if let Some((bloom, bits)) = &mut self.bloom {
            bloom.insert(bits, key);
        }

        self.last_key = Some(key.to_vec());
        self.entry_count += 1;
        Ok(())
    }

    /// Flush all files to disk, returning the number of records written
    pub fn finish(mut self) -> Result<u64> {
        self.index.flush()?;
        self.data.flush()?;
        self.index.get_ref().sync_all()?;
        self.data.get_ref().sync_all()?;

        if let Some((_, bits)) = &self.bloom {
            write_bloom(&self.paths.bloom, bits)?;
        }

        tracing::trace!(
            path = %self.paths.data.display(),
            entries = self.entry_count,
            bytes = self.offset,
            "generation written"
        );
        Ok(self.entry_count)
    }
}

/// Write a bloom bit array as little-endian words
pub fn write_bloom(path: &Path, bits: &[u64]) -> Result<()> {
    let mut raw = Vec::with_capacity(bits.len() * 8);
    for word in bits {
        raw.extend_from_slice(&word.to_le_bytes());
    }
    let mut file = create(path)?;
    file.write_all(&raw)?;
    file.sync_all()?;
    Ok(())
}

fn create(path: &Path) -> Result<File> {
    Ok(OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(path)?)
}
