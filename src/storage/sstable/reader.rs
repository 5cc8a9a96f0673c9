//! Generation Reader
//!
//! Point lookups by sequential scan or binary search over a generation's
//! sorted index, either reading keys from the data file on demand
//! ([`GenerationFile`]) or from a fully loaded copy ([`GenerationReader`]).

use std::cmp::Ordering;
use std::convert::Infallible;
use std::fs::{self, File};
use std::io::{BufReader, Read, Seek, SeekFrom};
use std::path::Path;

use crate::config::SearchMode;
use crate::error::{Result, ShardError};
use crate::memtable::Lookup;

use super::iterator::GenerationIter;
use super::{GenerationPaths, IndexRecord, INDEX_RECORD_SIZE};

// =============================================================================
// Point Lookups
// =============================================================================

/// One generation opened for point lookups
///
/// The index is held in memory; key and value bytes are read from the data
/// file on demand, so a lookup touches only the records it compares.
pub struct GenerationFile {
    index: Vec<IndexRecord>,
    data: BufReader<File>,
    data_len: u64,
    /// Reused buffer for keys read during a search
    scratch: Vec<u8>,
}

impl GenerationFile {
    /// Load a generation's index and open its data file
    pub fn open(paths: &GenerationPaths) -> Result<Self> {
        let raw_index = fs::read(&paths.index)?;
        let file = File::open(&paths.data)?;
        let data_len = file.metadata()?.len();
        let index = decode_index(&raw_index, data_len)?;

        Ok(Self {
            index,
            data: BufReader::new(file),
            data_len,
            scratch: Vec::new(),
        })
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    /// Look up a key with the given strategy
    pub fn get(&mut self, key: &[u8], mode: SearchMode) -> Result<Lookup> {
        let hit = search(self.index.len(), mode, |i| {
            self.read_key(i)?;
            Ok::<_, ShardError>(self.scratch.as_slice().cmp(key))
        })?;
        match hit {
            Some(i) if self.index[i].tombstone => Ok(Lookup::Tombstone),
            Some(i) => self.read_value(i).map(Lookup::Found),
            None => Ok(Lookup::NotFound),
        }
    }

    fn read_key(&mut self, i: usize) -> Result<()> {
        let record = self.index[i];
        self.scratch.resize(record.key_len as usize, 0);
        self.data.seek(SeekFrom::Start(record.offset))?;
        self.data.read_exact(&mut self.scratch)?;
        Ok(())
    }

    fn read_value(&mut self, i: usize) -> Result<Vec<u8>> {
        let record = self.index[i];
        let start = record.offset + record.key_len;
        let end = self.index.get(i + 1).map_or(self.data_len, |next| next.offset);
        let mut value = vec![0u8; end.saturating_sub(start) as usize];
        self.data.seek(SeekFrom::Start(start))?;
        self.data.read_exact(&mut value)?;
        Ok(value)
    }
}

// =============================================================================
// Whole-Generation Reads
// =============================================================================

/// In-memory view of one generation, for loads and redistribution
pub struct GenerationReader {
    index: Vec<IndexRecord>,
    data: Vec<u8>,
}

impl GenerationReader {
    /// Read a generation's index and data files completely
    pub fn open(paths: &GenerationPaths) -> Result<Self> {
        let raw_index = fs::read(&paths.index)?;
        let data = fs::read(&paths.data)?;
        Self::from_parts(&raw_index, data)
    }

    /// Decode a raw index against its data bytes, validating every record
    pub fn from_parts(raw_index: &[u8], data: Vec<u8>) -> Result<Self> {
        let index = decode_index(raw_index, data.len() as u64)?;
        Ok(Self { index, data })
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    /// Look up a key with the given strategy
    pub fn get(&self, key: &[u8], mode: SearchMode) -> Lookup {
        let hit = search(self.index.len(), mode, |i| Ok::<_, Infallible>(self.key_at(i).cmp(key)));
        match hit {
            Ok(Some(i)) => self.lookup_at(i),
            Ok(None) => Lookup::NotFound,
            Err(never) => match never {},
        }
    }

    /// Linear scan, stopping at the first key greater than `key`
    pub fn get_sequential(&self, key: &[u8]) -> Lookup {
        self.get(key, SearchMode::Sequential)
    }

    /// Binary search; on an equal prefix the shorter key orders first
    pub fn get_binary(&self, key: &[u8]) -> Lookup {
        self.get(key, SearchMode::Binary)
    }

    /// Iterate every record in index order
    pub fn iter(&self) -> GenerationIter<'_> {
        GenerationIter::new(self)
    }

    pub(super) fn key_at(&self, i: usize) -> &[u8] {
        let record = &self.index[i];
        let start = record.offset as usize;
        &self.data[start..start + record.key_len as usize]
    }

    pub(super) fn value_at(&self, i: usize) -> &[u8] {
        let record = &self.index[i];
        let start = (record.offset + record.key_len) as usize;
        let end = match self.index.get(i + 1) {
            Some(next) => next.offset as usize,
            None => self.data.len(),
        };
        &self.data[start..end.max(start)]
    }

    pub(super) fn tombstone_at(&self, i: usize) -> bool {
        self.index[i].tombstone
    }

    fn lookup_at(&self, i: usize) -> Lookup {
        if self.tombstone_at(i) {
            Lookup::Tombstone
        } else {
            Lookup::Found(self.value_at(i).to_vec())
        }
    }
}

// =============================================================================
// Index Decoding / Search
// =============================================================================

/// Decode a packed index, checking every key lies inside `data_len` bytes
fn decode_index(raw_index: &[u8], data_len: u64) -> Result<Vec<IndexRecord>> {
    if raw_index.len() % INDEX_RECORD_SIZE != 0 {
        return Err(ShardError::Corrupt(format!(
            "index length {} is not a multiple of {}",
            raw_index.len(),
            INDEX_RECORD_SIZE
        )));
    }

    let mut index = Vec::with_capacity(raw_index.len() / INDEX_RECORD_SIZE);
    let mut prev_offset = 0u64;
    for chunk in raw_index.chunks_exact(INDEX_RECORD_SIZE) {
        let mut raw = [0u8; INDEX_RECORD_SIZE];
        raw.copy_from_slice(chunk);
        let record = IndexRecord::decode(&raw);
        match record.offset.checked_add(record.key_len) {
            Some(end) if record.offset >= prev_offset && end <= data_len => {
                prev_offset = record.offset;
            }
            _ => {
                return Err(ShardError::Corrupt(format!(
                    "index record at offset {} (key_len {}) outside data of {} bytes",
                    record.offset, record.key_len, data_len
                )))
            }
        }
        index.push(record);
    }
    Ok(index)
}

/// Position of the record whose key compares equal, if any
///
/// `cmp_at(i)` orders record `i`'s key against the target. The sequential
/// scan stops at the first greater key; both strategies need a sorted index.
fn search<E>(
    len: usize,
    mode: SearchMode,
    mut cmp_at: impl FnMut(usize) -> std::result::Result<Ordering, E>,
) -> std::result::Result<Option<usize>, E> {
    match mode {
        SearchMode::Sequential => {
            for i in 0..len {
                match cmp_at(i)? {
                    Ordering::Less => continue,
                    Ordering::Equal => return Ok(Some(i)),
                    Ordering::Greater => break,
                }
            }
            Ok(None)
        }
        SearchMode::Binary => {
            let mut lo = 0usize;
            let mut hi = len;
            while lo < hi {
                let mid = lo + (hi - lo) / 2;
                match cmp_at(mid)? {
                    Ordering::Less => lo = mid + 1,
                    Ordering::Greater => hi = mid,
                    Ordering::Equal => return Ok(Some(mid)),
                }
            }
            Ok(None)
        }
    }
}

/// Read a bloom bit array written by the builder
pub fn read_bloom(path: &Path) -> Result<Vec<u64>> {
    let raw = fs::read(path)?;
    if raw.len() % 8 != 0 {
        return Err(ShardError::Corrupt(format!(
            "bloom file {} has {} bytes",
            path.display(),
            raw.len()
        )));
    }
    Ok(raw
        .chunks_exact(8)
        .map(|chunk| {
            let mut word = [0u8; 8];
            word.copy_from_slice(chunk);
            u64::from_le_bytes(word)
        })
        .collect())
}
