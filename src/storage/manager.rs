//! Generation Manager
//!
//! Tracks the SSTable generations of one database on one rank.
//!
//! ## Responsibilities
//! - Flush frozen memtables into new generations
//! - Search generations newest → oldest, skipping by bloom filter
//! - Load a generation back into a memtable for iteration
//! - Export/import generation files for checkpoint and restart
//!
//! Generations are never merged or deleted while the database is open; a
//! lookup for an absent key scans every generation down to 1.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use crate::bloom::Bloom;
use crate::config::SearchMode;
use crate::error::Result;
use crate::memtable::{Lookup, MemTable, Slice};

use super::sstable::{
    read_bloom, write_bloom, GenerationBuilder, GenerationFile, GenerationPaths, GenerationReader,
};

/// Persisted generations of one database on one rank
///
/// ## Concurrency:
/// - `sid`: newest complete generation, published after its files are synced
/// - Flushes are serialized by the single compactor worker
pub struct SsTable {
    name: String,
    rank: usize,
    /// Repository root; each rank writes under `{root}/{rank}/`
    root: PathBuf,
    search_mode: SearchMode,
    bloom: Option<Bloom>,
    sid: AtomicU64,
}

impl SsTable {
    pub fn new(
        root: impl Into<PathBuf>,
        name: impl Into<String>,
        rank: usize,
        search_mode: SearchMode,
        bloom: Option<Bloom>,
    ) -> Self {
        Self {
            name: name.into(),
            rank,
            root: root.into(),
            search_mode,
            bloom,
            sid: AtomicU64::new(0),
        }
    }

    /// Newest generation id (0 = none)
    pub fn sid(&self) -> u64 {
        self.sid.load(Ordering::Acquire)
    }

    pub fn set_sid(&self, sid: u64) {
        self.sid.store(sid, Ordering::Release);
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn search_mode(&self) -> SearchMode {
        self.search_mode
    }

    /// Directory holding a rank's generations
    pub fn rank_dir(&self, rank: usize) -> PathBuf {
        self.root.join(rank.to_string())
    }

    pub fn paths(&self, rank: usize, generation: u64) -> GenerationPaths {
        GenerationPaths::new(&self.rank_dir(rank), &self.name, rank, generation)
    }

    // =========================================================================
    // Flush / Load
    // =========================================================================

    /// Persist a memtable as the next generation
    ///
    /// Empty tables are skipped and the current generation id is returned.
    pub fn flush(&self, memtable: &MemTable) -> Result<u64> {
        let current = self.sid();
        if memtable.is_empty() {
            return Ok(current);
        }

        let generation = current + 1;
        let paths = self.paths(self.rank, generation);
        let mut builder = GenerationBuilder::new(paths, self.bloom)?;
        for slice in memtable.snapshot() {
            builder.add(&slice.key, &slice.value, slice.tombstone)?;
        }
        let entries = builder.finish()?;
        self.set_sid(generation);

        tracing::debug!(
            db = %self.name,
            rank = self.rank,
            generation,
            entries,
            "memtable flushed"
        );
        Ok(generation)
    }

    /// Replay one generation into a fresh memtable
    pub fn load(&self, generation: u64) -> Result<MemTable> {
        let reader = self.read_generation(self.rank, generation)?;
        let memtable = MemTable::new(generation);
        for record in reader.iter() {
            let mut slice = Slice::new(record.key.to_vec(), record.value.to_vec(), self.rank);
            slice.tombstone = record.tombstone;
            memtable.put(slice);
        }
        tracing::trace!(db = %self.name, generation, records = reader.len(), "generation loaded");
        Ok(memtable)
    }

    /// Open one generation; I/O and format errors are surfaced
    pub fn read_generation(&self, rank: usize, generation: u64) -> Result<GenerationReader> {
        GenerationReader::open(&self.paths(rank, generation))
    }

    // =========================================================================
    // Lookup
    // =========================================================================

    /// Search this rank's generations newest → oldest
    pub fn get(&self, key: &[u8]) -> Lookup {
        self.get_from(self.rank, self.sid(), key)
    }

    /// Search `rank`'s generations from `sid` down to 1
    ///
    /// A generation whose index or data cannot be read ends the scan with
    /// `NotFound`. An unreadable bloom filter only costs the skip: that
    /// generation is searched anyway.
    pub fn get_from(&self, rank: usize, sid: u64, key: &[u8]) -> Lookup {
        for generation in (1..=sid).rev() {
            let paths = self.paths(rank, generation);

            if let Some(bloom) = &self.bloom {
                match read_bloom(&paths.bloom) {
                    Ok(bits) if !bloom.maybe(key, &bits) => continue,
                    Ok(_) => {}
                    Err(e) => {
                        tracing::error!(db = %self.name, rank, generation, error = %e, "bloom unreadable");
                    }
                }
            }

            match GenerationFile::open(&paths).and_then(|mut file| file.get(key, self.search_mode)) {
                Ok(result) if result.is_definitive() => return result,
                Ok(_) => {}
                Err(e) => {
                    tracing::error!(db = %self.name, rank, generation, error = %e, "generation unreadable");
                    break;
                }
            }
        }
        Lookup::NotFound
    }

    // =========================================================================
    // Checkpoint / Restart
    // =========================================================================

    /// Copy this rank's generations to `path`, newest first
    pub fn send_files(&self, path: &Path) -> Result<u64> {
        let sid = self.sid();
        for generation in (1..=sid).rev() {
            let src = self.paths(self.rank, generation);
            let dst = GenerationPaths::new(path, &self.name, self.rank, generation);
            fs::copy(&src.index, &dst.index)?;
            fs::copy(&src.data, &dst.data)?;
            if self.bloom.is_some() {
                fs::copy(&src.bloom, &dst.bloom)?;
            }
        }
        tracing::debug!(db = %self.name, rank = self.rank, sid, path = %path.display(), "generations exported");
        Ok(sid)
    }

    /// Import this rank's generations 1..=sid from `path`
    pub fn recv_files(&self, path: &Path, sid: u64) -> Result<()> {
        for generation in (1..=sid).rev() {
            let src = GenerationPaths::new(path, &self.name, self.rank, generation);
            let dst = self.paths(self.rank, generation);
            fs::copy(&src.index, &dst.index)?;
            fs::copy(&src.data, &dst.data)?;

            if let Some(bloom) = &self.bloom {
                match fs::copy(&src.bloom, &dst.bloom) {
                    Ok(_) => {}
                    Err(e) if e.kind() == io::ErrorKind::NotFound => {
                        // checkpoint was taken without bloom filters
                        let reader = GenerationReader::open(&dst)?;
                        let bits = bloom.bits(reader.iter().map(|r| r.key));
                        write_bloom(&dst.bloom, &bits)?;
                    }
                    Err(e) => return Err(e.into()),
                }
            }
        }
        self.set_sid(sid);
        tracing::debug!(db = %self.name, rank = self.rank, sid, path = %path.display(), "generations imported");
        Ok(())
    }

    /// Open a generation exported by any rank to a checkpoint directory
    pub fn read_exported(path: &Path, name: &str, rank: usize, generation: u64) -> Result<GenerationReader> {
        GenerationReader::open(&GenerationPaths::new(path, name, rank, generation))
    }

    /// Remove this rank's generation files
    pub fn destroy(&self) -> Result<()> {
        for generation in 1..=self.sid() {
            let paths = self.paths(self.rank, generation);
            for file in [&paths.index, &paths.data, &paths.bloom] {
                match fs::remove_file(file) {
                    Ok(()) => {}
                    Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                    Err(e) => return Err(e.into()),
                }
            }
        }
        self.set_sid(0);
        Ok(())
    }
}

impl std::fmt::Debug for SsTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SsTable")
            .field("name", &self.name)
            .field("rank", &self.rank)
            .field("sid", &self.sid())
            .finish()
    }
}
