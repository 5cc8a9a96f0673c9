//! Tests for SSTable generations
//!
//! These tests verify:
//! - Flushing a memtable preserves every lookup outcome
//! - Tombstones persist and shadow older generations
//! - Sequential and binary search agree
//! - Bloom filters have no false negatives
//! - Table of contents and checkpoint file transfer

use std::fs;
use std::path::Path;

use shardkv::bloom::Bloom;
use shardkv::config::SearchMode;
use shardkv::memtable::{Lookup, MemTable, Slice};
use shardkv::storage::toc::{decode_toc, read_toc, write_toc};
use shardkv::storage::{GenerationBuilder, GenerationFile, GenerationPaths, GenerationReader, SsTable};
use shardkv::ShardError;
use tempfile::TempDir;

// =============================================================================
// Helper Functions
// =============================================================================

fn setup_sstable(dir: &Path, rank: usize, mode: SearchMode, bloom: bool) -> SsTable {
    fs::create_dir_all(dir.join(rank.to_string())).unwrap();
    let bloom = bloom.then(|| Bloom::new(4096));
    SsTable::new(dir, "db", rank, mode, bloom)
}

fn create_memtable_with_entries(entries: &[(&[u8], Option<&[u8]>)]) -> MemTable {
    let memtable = MemTable::new(1);
    for (key, value) in entries {
        let slice = match value {
            Some(v) => Slice::new(key.to_vec(), v.to_vec(), 0),
            None => Slice::tombstone(key.to_vec(), 0),
        };
        memtable.put(slice);
    }
    memtable
}

fn numbered_memtable(range: std::ops::Range<usize>, tag: &str) -> MemTable {
    let memtable = MemTable::new(1);
    for i in range {
        memtable.put(Slice::new(
            format!("key-{:04}", i).into_bytes(),
            format!("{}-{}", tag, i).into_bytes(),
            0,
        ));
    }
    memtable
}

// =============================================================================
// Flush / Get
// =============================================================================

#[test]
fn test_flush_preserves_values() {
    let temp = TempDir::new().unwrap();
    let sstable = setup_sstable(temp.path(), 0, SearchMode::Binary, true);
    let memtable = numbered_memtable(0..500, "v");
    memtable.put(Slice::tombstone(b"key-0100".to_vec(), 0));

    let before: Vec<Lookup> = (0..500)
        .map(|i| memtable.get(format!("key-{:04}", i).as_bytes()))
        .collect();

    assert_eq!(sstable.flush(&memtable).unwrap(), 1);
    assert_eq!(sstable.sid(), 1);

    for (i, expected) in before.iter().enumerate() {
        assert_eq!(&sstable.get(format!("key-{:04}", i).as_bytes()), expected);
    }
    assert_eq!(sstable.get(b"key-0100"), Lookup::Tombstone);
    assert_eq!(sstable.get(b"absent"), Lookup::NotFound);
}

#[test]
fn test_empty_memtable_is_not_flushed() {
    let temp = TempDir::new().unwrap();
    let sstable = setup_sstable(temp.path(), 0, SearchMode::Binary, false);

    assert_eq!(sstable.flush(&MemTable::new(1)).unwrap(), 0);
    assert_eq!(sstable.sid(), 0);
    assert!(!sstable.paths(0, 1).index.exists());
}

#[test]
fn test_newer_generation_shadows_older() {
    let temp = TempDir::new().unwrap();
    let sstable = setup_sstable(temp.path(), 0, SearchMode::Binary, true);

    sstable
        .flush(&create_memtable_with_entries(&[
            (b"a", Some(b"old")),
            (b"b", Some(b"old")),
            (b"c", Some(b"old")),
        ]))
        .unwrap();
    sstable
        .flush(&create_memtable_with_entries(&[(b"a", Some(b"new")), (b"b", None)]))
        .unwrap();

    assert_eq!(sstable.sid(), 2);
    assert_eq!(sstable.get(b"a"), Lookup::Found(b"new".to_vec()));
    assert_eq!(sstable.get(b"b"), Lookup::Tombstone);
    assert_eq!(sstable.get(b"c"), Lookup::Found(b"old".to_vec()));
}

#[test]
fn test_files_follow_naming_scheme() {
    let temp = TempDir::new().unwrap();
    let sstable = setup_sstable(temp.path(), 3, SearchMode::Binary, true);
    sstable.flush(&numbered_memtable(0..3, "v")).unwrap();

    let dir = temp.path().join("3");
    assert!(dir.join("db_3_0_1.idx").exists());
    assert!(dir.join("db_3_0_1.sst").exists());
    assert!(dir.join("db_3_0_1.blm").exists());
    // three 17-byte index records
    assert_eq!(fs::metadata(dir.join("db_3_0_1.idx")).unwrap().len(), 3 * 17);
    // 4096 bits as 64 little-endian words
    assert_eq!(fs::metadata(dir.join("db_3_0_1.blm")).unwrap().len(), 4096 / 8);
}

#[test]
fn test_load_replays_generation() {
    let temp = TempDir::new().unwrap();
    let sstable = setup_sstable(temp.path(), 0, SearchMode::Binary, false);
    sstable
        .flush(&create_memtable_with_entries(&[(b"x", Some(b"1")), (b"y", None)]))
        .unwrap();

    let loaded = sstable.load(1).unwrap();
    assert_eq!(loaded.len(), 2);
    assert_eq!(loaded.get(b"x"), Lookup::Found(b"1".to_vec()));
    assert_eq!(loaded.get(b"y"), Lookup::Tombstone);
}

#[test]
fn test_unreadable_generation_stops_scan() {
    let temp = TempDir::new().unwrap();
    let sstable = setup_sstable(temp.path(), 0, SearchMode::Binary, false);
    sstable.flush(&create_memtable_with_entries(&[(b"k", Some(b"v1"))])).unwrap();
    sstable.flush(&create_memtable_with_entries(&[(b"other", Some(b"v2"))])).unwrap();

    fs::remove_file(sstable.paths(0, 2).data).unwrap();

    // generation 2 is unreadable, so generation 1 is not consulted
    assert_eq!(sstable.get(b"k"), Lookup::NotFound);
    assert!(sstable.read_generation(0, 2).is_err());
    assert!(sstable.read_generation(0, 1).is_ok());
}

#[test]
fn test_unreadable_bloom_still_searches_generation() {
    let temp = TempDir::new().unwrap();
    let sstable = setup_sstable(temp.path(), 0, SearchMode::Binary, true);
    sstable.flush(&create_memtable_with_entries(&[(b"k", Some(b"v1"))])).unwrap();
    sstable.flush(&create_memtable_with_entries(&[(b"other", Some(b"v2"))])).unwrap();

    fs::remove_file(sstable.paths(0, 2).bloom).unwrap();
    fs::remove_file(sstable.paths(0, 1).bloom).unwrap();

    assert_eq!(sstable.get(b"other"), Lookup::Found(b"v2".to_vec()));
    assert_eq!(sstable.get(b"k"), Lookup::Found(b"v1".to_vec()));
    assert_eq!(sstable.get(b"absent"), Lookup::NotFound);
}

#[test]
fn test_get_from_reads_another_rank() {
    let temp = TempDir::new().unwrap();
    let owner = setup_sstable(temp.path(), 1, SearchMode::Binary, true);
    owner.flush(&numbered_memtable(0..10, "owner")).unwrap();

    let reader = setup_sstable(temp.path(), 0, SearchMode::Binary, true);
    assert_eq!(
        reader.get_from(1, owner.sid(), b"key-0004"),
        Lookup::Found(b"owner-4".to_vec())
    );
    assert_eq!(reader.get(b"key-0004"), Lookup::NotFound);
}

// =============================================================================
// Sequential vs Binary
// =============================================================================

#[test]
fn test_sequential_and_binary_agree() {
    let temp = TempDir::new().unwrap();
    let paths = GenerationPaths::new(temp.path(), "cmp", 0, 1);

    let mut keys: Vec<Vec<u8>> = vec![
        b"a".to_vec(),
        b"ab".to_vec(),
        b"abc".to_vec(),
        b"abd".to_vec(),
        b"b".to_vec(),
        b"ba".to_vec(),
        b"zzzz".to_vec(),
    ];
    for i in 0..100 {
        keys.push(format!("n{:03}", i * 3).into_bytes());
    }
    keys.sort();

    let mut builder = GenerationBuilder::new(paths.clone(), None).unwrap();
    for (i, key) in keys.iter().enumerate() {
        builder.add(key, format!("value{}", i).as_bytes(), i % 5 == 0).unwrap();
    }
    assert_eq!(builder.finish().unwrap(), keys.len() as u64);

    let reader = GenerationReader::open(&paths).unwrap();
    let mut lookups = keys.clone();
    let extras: [&[u8]; 8] = [b"", b"aa", b"abcd", b"c", b"n001", b"n299", b"zzzzz", b"0"];
    for extra in extras {
        lookups.push(extra.to_vec());
    }
    for target in &lookups {
        assert_eq!(reader.get_sequential(target), reader.get_binary(target), "target {:?}", target);
    }
    assert_eq!(reader.get_binary(b"ab"), Lookup::Found(b"value1".to_vec()));
    assert_eq!(reader.get_binary(b"a"), Lookup::Tombstone);
    assert_eq!(reader.get_binary(b"abcd"), Lookup::NotFound);

    // reading keys from the data file on demand gives the same answers
    let mut file = GenerationFile::open(&paths).unwrap();
    assert_eq!(file.len(), keys.len());
    for target in &lookups {
        let expected = reader.get_binary(target);
        assert_eq!(file.get(target, SearchMode::Binary).unwrap(), expected, "target {:?}", target);
        assert_eq!(file.get(target, SearchMode::Sequential).unwrap(), expected, "target {:?}", target);
    }
}

#[test]
fn test_generation_file_reads_last_value_to_end_of_data() {
    let temp = TempDir::new().unwrap();
    let paths = GenerationPaths::new(temp.path(), "tail", 0, 1);
    let mut builder = GenerationBuilder::new(paths.clone(), None).unwrap();
    builder.add(b"a", b"first", false).unwrap();
    builder.add(b"b", b"", false).unwrap();
    builder.add(b"c", b"the last value", false).unwrap();
    builder.finish().unwrap();

    let mut file = GenerationFile::open(&paths).unwrap();
    assert_eq!(file.get(b"a", SearchMode::Binary).unwrap(), Lookup::Found(b"first".to_vec()));
    assert_eq!(file.get(b"b", SearchMode::Binary).unwrap(), Lookup::Found(Vec::new()));
    assert_eq!(
        file.get(b"c", SearchMode::Sequential).unwrap(),
        Lookup::Found(b"the last value".to_vec())
    );
}

#[test]
fn test_generation_file_rejects_index_past_data() {
    let temp = TempDir::new().unwrap();
    let paths = GenerationPaths::new(temp.path(), "short", 0, 1);
    let mut raw = Vec::new();
    raw.extend_from_slice(&0u64.to_le_bytes());
    raw.extend_from_slice(&100u64.to_le_bytes());
    raw.push(0);
    fs::write(&paths.index, &raw).unwrap();
    fs::write(&paths.data, b"short").unwrap();

    assert!(matches!(GenerationFile::open(&paths), Err(ShardError::Corrupt(_))));
}

#[test]
fn test_builder_rejects_unsorted_keys() {
    let temp = TempDir::new().unwrap();
    let paths = GenerationPaths::new(temp.path(), "bad", 0, 1);
    let mut builder = GenerationBuilder::new(paths, None).unwrap();

    builder.add(b"b", b"1", false).unwrap();
    assert!(builder.add(b"a", b"2", false).is_err());
    assert!(builder.add(b"b", b"3", false).is_err());
}

#[test]
fn test_corrupt_index_is_rejected() {
    let mut raw = Vec::new();
    raw.extend_from_slice(&0u64.to_le_bytes());
    raw.extend_from_slice(&100u64.to_le_bytes());
    raw.push(0);

    let result = GenerationReader::from_parts(&raw, b"short".to_vec());
    assert!(matches!(result, Err(ShardError::Corrupt(_))));
    assert!(matches!(
        GenerationReader::from_parts(&raw[..10], Vec::new()),
        Err(ShardError::Corrupt(_))
    ));
}

// =============================================================================
// Bloom
// =============================================================================

#[test]
fn test_bloom_has_no_false_negatives_on_disk() {
    let temp = TempDir::new().unwrap();
    let sstable = setup_sstable(temp.path(), 0, SearchMode::Sequential, true);
    sstable.flush(&numbered_memtable(0..300, "v")).unwrap();

    let bloom = Bloom::new(4096);
    let bits = shardkv::storage::sstable::read_bloom(&sstable.paths(0, 1).bloom).unwrap();
    for i in 0..300 {
        assert!(bloom.maybe(format!("key-{:04}", i).as_bytes(), &bits));
    }
    for i in 0..300 {
        assert_eq!(
            sstable.get(format!("key-{:04}", i).as_bytes()),
            Lookup::Found(format!("v-{}", i).into_bytes())
        );
    }
}

// =============================================================================
// Table of Contents
// =============================================================================

#[test]
fn test_toc_round_trip() {
    let temp = TempDir::new().unwrap();
    write_toc(temp.path(), "db", &[3, 0, 7]).unwrap();

    let raw = fs::read(temp.path().join("db.toc")).unwrap();
    assert_eq!(raw.len(), 4 + 3 * 8);
    assert_eq!(&raw[..4], &3i32.to_le_bytes());
    assert_eq!(read_toc(temp.path(), "db").unwrap(), vec![3, 0, 7]);
}

#[test]
fn test_corrupt_toc_header() {
    assert!(matches!(decode_toc(&[1, 0]), Err(ShardError::Corrupt(_))));

    let mut raw = 2i32.to_le_bytes().to_vec();
    raw.extend_from_slice(&5u64.to_le_bytes());
    assert!(matches!(decode_toc(&raw), Err(ShardError::Corrupt(_))));

    let raw = (-1i32).to_le_bytes();
    assert!(matches!(decode_toc(&raw), Err(ShardError::Corrupt(_))));
}

#[test]
fn test_missing_toc_is_io_error() {
    let temp = TempDir::new().unwrap();
    assert!(matches!(read_toc(temp.path(), "nope"), Err(ShardError::Io(_))));
}

// =============================================================================
// Checkpoint File Transfer
// =============================================================================

#[test]
fn test_send_and_recv_files() {
    let temp = TempDir::new().unwrap();
    let checkpoint = temp.path().join("ckpt");
    fs::create_dir_all(&checkpoint).unwrap();

    let source = setup_sstable(&temp.path().join("run1"), 0, SearchMode::Binary, true);
    source.flush(&numbered_memtable(0..20, "first")).unwrap();
    source.flush(&numbered_memtable(10..30, "second")).unwrap();
    assert_eq!(source.send_files(&checkpoint).unwrap(), 2);

    let target = setup_sstable(&temp.path().join("run2"), 0, SearchMode::Binary, true);
    target.recv_files(&checkpoint, 2).unwrap();
    assert_eq!(target.sid(), 2);
    assert_eq!(target.get(b"key-0005"), Lookup::Found(b"first-5".to_vec()));
    assert_eq!(target.get(b"key-0015"), Lookup::Found(b"second-15".to_vec()));
    assert_eq!(target.get(b"key-0030"), Lookup::NotFound);

    let exported = SsTable::read_exported(&checkpoint, "db", 0, 1).unwrap();
    assert_eq!(exported.len(), 20);
}

#[test]
fn test_recv_files_rebuilds_missing_bloom() {
    let temp = TempDir::new().unwrap();
    let checkpoint = temp.path().join("ckpt");
    fs::create_dir_all(&checkpoint).unwrap();

    let source = setup_sstable(&temp.path().join("run1"), 0, SearchMode::Binary, false);
    source.flush(&numbered_memtable(0..50, "v")).unwrap();
    source.send_files(&checkpoint).unwrap();
    assert!(!checkpoint.join("db_0_0_1.blm").exists());

    let target = setup_sstable(&temp.path().join("run2"), 0, SearchMode::Binary, true);
    target.recv_files(&checkpoint, 1).unwrap();
    assert!(target.paths(0, 1).bloom.exists());
    for i in 0..50 {
        assert_eq!(
            target.get(format!("key-{:04}", i).as_bytes()),
            Lookup::Found(format!("v-{}", i).into_bytes())
        );
    }
}

#[test]
fn test_destroy_removes_generations() {
    let temp = TempDir::new().unwrap();
    let sstable = setup_sstable(temp.path(), 0, SearchMode::Binary, true);
    sstable.flush(&numbered_memtable(0..5, "v")).unwrap();
    sstable.flush(&numbered_memtable(5..10, "v")).unwrap();

    sstable.destroy().unwrap();
    assert_eq!(sstable.sid(), 0);
    assert!(!sstable.paths(0, 1).index.exists());
    assert!(!sstable.paths(0, 2).data.exists());
}
