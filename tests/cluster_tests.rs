//! Multi-rank tests
//!
//! Every test runs N ranks as threads connected by an in-process fabric.
//! Collective operations (open, barrier, checkpoint, restart, shutdown) are
//! issued by every rank in the same order.
//!
//! These tests verify:
//! - Remote writes under sequential and relaxed consistency
//! - Write-combining buffers and read-your-writes
//! - Checkpoint on N ranks, restart on the same or a different rank count
//! - Storage groups reading peers' generations directly
//! - Signals and remote updates

use std::path::Path;
use std::sync::Arc;
use std::thread;

use bytes::Bytes;
use shardkv::network::Channel;
use shardkv::protocol::{decode_get_reply, encode_message, GetHeader, Message};
use shardkv::remote_buffer::record_size;
use shardkv::storage::GenerationPaths;
use shardkv::{
    Config, Consistency, Context, Level, Lookup, MemFabric, OpenOptions, PartitionFn, Position, Protection,
    ShardError, Transport,
};
use tempfile::TempDir;

// =============================================================================
// Helper Functions
// =============================================================================

/// Start `ranks` contexts on one fabric and run `body` on each
fn run_ranks<F>(ranks: usize, config: Config, body: F)
where
    F: Fn(&Context) + Sync,
{
    let body = &body;
    thread::scope(|scope| {
        let handles: Vec<_> = MemFabric::new(ranks)
            .into_iter()
            .map(|endpoint| {
                let config = config.clone();
                scope.spawn(move || {
                    let transport: Arc<dyn Transport> = endpoint;
                    let ctx = Context::start(config, transport).unwrap();
                    body(&ctx);
                    ctx.shutdown().unwrap();
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
    });
}

fn repo(dir: &Path, label: &str) -> shardkv::config::ConfigBuilder {
    Config::builder().repository(dir.join(label))
}

/// Owner is the leading decimal digit of the key
fn digit_partition() -> PartitionFn {
    Arc::new(|key: &[u8], _nranks: usize| key.first().map_or(0, |b| b.wrapping_sub(b'0') as usize))
}

fn key(i: usize) -> Vec<u8> {
    format!("key-{:05}", i).into_bytes()
}

fn value(i: usize, tag: &str) -> Vec<u8> {
    format!("{}-{}", tag, i).into_bytes()
}

fn found(v: &[u8]) -> Lookup {
    Lookup::Found(v.to_vec())
}

fn as_u64(raw: &[u8]) -> u64 {
    let mut word = [0u8; 8];
    word.copy_from_slice(&raw[..8]);
    u64::from_le_bytes(word)
}

fn add(_key: &[u8], current: Option<&[u8]>, input: &[u8], output: &mut Vec<u8>) -> Option<Vec<u8>> {
    let sum = current.map_or(0, as_u64) + as_u64(input);
    output.extend_from_slice(&sum.to_le_bytes());
    Some(sum.to_le_bytes().to_vec())
}

// =============================================================================
// Remote Writes
// =============================================================================

#[test]
fn test_sequential_remote_writes() {
    let temp = TempDir::new().unwrap();
    let config = repo(temp.path(), "seq").consistency(Consistency::Sequential).build();

    run_ranks(3, config, |ctx| {
        let db = ctx.open("seq", OpenOptions::new()).unwrap();
        let start = ctx.rank() * 100;
        for i in start..start + 100 {
            db.put(&key(i), &value(i, "v")).unwrap();
        }
        for i in (start..start + 100).step_by(7) {
            db.delete(&key(i)).unwrap();
        }
        db.barrier(Level::MemTable).unwrap();

        for i in 0..300 {
            let expected = if (i % 100) % 7 == 0 {
                Lookup::Tombstone
            } else {
                found(&value(i, "v"))
            };
            assert_eq!(db.get(&key(i)).unwrap(), expected, "key {}", i);
        }
        assert_eq!(db.migrations(), 0);
    });
}

#[test]
fn test_write_combining_migrates_full_region() {
    let temp = TempDir::new().unwrap();
    let config = repo(temp.path(), "wc")
        .remote_buffer_size(2 * record_size(2, 2))
        .build();

    run_ranks(2, config, |ctx| {
        let options = OpenOptions::new().value_len(2).partition(digit_partition());
        let db = ctx.open("wc", options).unwrap();

        if ctx.rank() == 0 {
            db.put(b"1a", b"va").unwrap();
            db.put(b"1b", b"vb").unwrap();
            assert_eq!(db.migrations(), 0);
            assert_eq!(db.pending_remote_bytes(1), 2 * record_size(2, 2));

            db.put(b"1c", b"vc").unwrap();
            assert_eq!(db.migrations(), 1);
            assert_eq!(db.pending_remote_bytes(1), record_size(2, 2));
            // still staged here, visible to the writer
            assert_eq!(db.get(b"1c").unwrap(), found(b"vc"));
            // migrated or in flight, but never invisible
            assert_eq!(db.get(b"1a").unwrap(), found(b"va"));
            assert_eq!(db.get(b"1b").unwrap(), found(b"vb"));
        }
        db.barrier(Level::MemTable).unwrap();

        assert_eq!(db.pending_remote_bytes(1), 0);
        assert_eq!(db.get(b"1a").unwrap(), found(b"va"));
        assert_eq!(db.get(b"1b").unwrap(), found(b"vb"));
        assert_eq!(db.get(b"1c").unwrap(), found(b"vc"));
        if ctx.rank() == 1 {
            assert_eq!(db.memtable_len(), 3);
        }
    });
}

#[test]
fn test_writer_reads_own_writes_while_regions_migrate() {
    let temp = TempDir::new().unwrap();
    let config = repo(temp.path(), "inflight")
        .remote_buffer_size(2 * record_size(4, 4))
        .build();

    run_ranks(2, config, |ctx| {
        let options = OpenOptions::new().value_len(4).partition(digit_partition());
        let db = ctx.open("inflight", options).unwrap();

        if ctx.rank() == 0 {
            for round in 0..300 {
                let keys = [format!("1a{:02}", round % 100), format!("1b{:02}", round % 100)];
                let value = format!("{:04}", round).into_bytes();
                for key in &keys {
                    db.put(key.as_bytes(), &value).unwrap();
                }
                for key in &keys {
                    assert_eq!(db.get(key.as_bytes()).unwrap(), found(&value), "round {}", round);
                }
            }
            assert!(db.migrations() > 0);
        }
        db.barrier(Level::MemTable).unwrap();
    });
}

#[test]
fn test_oversize_value_bypasses_buffer() {
    let temp = TempDir::new().unwrap();
    let config = repo(temp.path(), "big").remote_buffer_entry_max(16).build();

    run_ranks(2, config, |ctx| {
        let options = OpenOptions::new().value_len(8).partition(digit_partition());
        let db = ctx.open("big", options).unwrap();

        if ctx.rank() == 0 {
            db.put(b"1small", b"tiny").unwrap();
            assert!(db.pending_remote_bytes(1) > 0);
            // the pending region is shipped ahead of the synchronous put
            db.put(b"1large", &[7u8; 64]).unwrap();
            assert_eq!(db.pending_remote_bytes(1), 0);
            assert_eq!(db.migrations(), 1);
            assert_eq!(db.get(b"1small").unwrap(), found(b"tiny"));
            assert_eq!(db.get(b"1large").unwrap(), found(&[7u8; 64]));
        }
        db.barrier(Level::MemTable).unwrap();
    });
}

#[test]
fn test_relaxed_remote_memtable_read_your_writes() {
    let temp = TempDir::new().unwrap();
    let config = repo(temp.path(), "relaxed").memtable_size(512).build();

    run_ranks(3, config, |ctx| {
        // no value length hint: remote writes stage in a remote memtable
        let db = ctx.open("relaxed", OpenOptions::new()).unwrap();
        let start = ctx.rank() * 200;
        for i in start..start + 200 {
            db.put(&key(i), &value(i, "r")).unwrap();
            assert_eq!(db.get(&key(i)).unwrap(), found(&value(i, "r")));
        }
        assert!(db.migrations() > 0);

        db.barrier(Level::SsTable).unwrap();
        assert!(db.sstable_generation() > 0);
        for i in 0..600 {
            assert_eq!(db.get(&key(i)).unwrap(), found(&value(i, "r")), "key {}", i);
        }
    });
}

#[test]
fn test_consistency_can_change_midway() {
    let temp = TempDir::new().unwrap();
    let config = repo(temp.path(), "switch").build();

    run_ranks(2, config, |ctx| {
        let db = ctx.open("switch", OpenOptions::new()).unwrap();
        let other = 1 - ctx.rank();
        let start = ctx.rank() * 50;
        for i in start..start + 25 {
            db.put(&key(i), &value(i, "a")).unwrap();
        }
        db.set_consistency(Consistency::Sequential).unwrap();
        for i in start + 25..start + 50 {
            db.put(&key(i), &value(i, "a")).unwrap();
        }
        db.barrier(Level::MemTable).unwrap();

        for i in other * 50..other * 50 + 50 {
            assert_eq!(db.get(&key(i)).unwrap(), found(&value(i, "a")));
        }
    });
}

#[test]
fn test_remote_cache_in_read_only_mode() {
    let temp = TempDir::new().unwrap();
    let config = repo(temp.path(), "rocache").build();

    run_ranks(2, config, |ctx| {
        let db = ctx.open("rocache", OpenOptions::new().partition(digit_partition())).unwrap();
        if ctx.rank() == 1 {
            db.put(b"1k", b"v").unwrap();
        }
        db.set_protection(Protection::ReadOnly).unwrap();

        if ctx.rank() == 0 {
            assert_eq!(db.get(b"1k").unwrap(), found(b"v"));
            assert_eq!(db.get(b"1k").unwrap(), found(b"v"));
            assert_eq!(db.get(b"1missing").unwrap(), Lookup::NotFound);
            assert_eq!(db.get(b"1missing").unwrap(), Lookup::NotFound);
            assert_eq!(db.remote_cache().hits(), 2);
        }
        db.set_protection(Protection::ReadWrite).unwrap();
    });
}

// =============================================================================
// Checkpoint / Restart
// =============================================================================

fn expected(i: usize) -> Lookup {
    if i % 10 == 0 {
        Lookup::Tombstone
    } else if i % 3 == 0 {
        found(&value(i, "new"))
    } else {
        found(&value(i, "old"))
    }
}

/// Each rank writes its slice in three generations: values, rewrites, deletes
fn write_checkpoint(dir: &Path, checkpoint: &Path, ranks: usize) {
    let config = repo(dir, "write").memtable_size(4096).build();
    run_ranks(ranks, config, |ctx| {
        let db = ctx.open("ckpt", OpenOptions::new()).unwrap();
        let start = ctx.rank() * 100;
        for i in start..start + 100 {
            db.put(&key(i), &value(i, "old")).unwrap();
        }
        db.barrier(Level::SsTable).unwrap();
        for i in (start..start + 100).filter(|i| i % 3 == 0) {
            db.put(&key(i), &value(i, "new")).unwrap();
        }
        db.barrier(Level::SsTable).unwrap();
        for i in (start..start + 100).filter(|i| i % 10 == 0) {
            db.delete(&key(i)).unwrap();
        }
        db.checkpoint(checkpoint, false).unwrap();
    });
}

fn verify_all(db: &shardkv::Db, total: usize) {
    for i in 0..total {
        assert_eq!(db.get(&key(i)).unwrap(), expected(i), "key {}", i);
    }
}

#[test]
fn test_restart_on_fewer_ranks() {
    let temp = TempDir::new().unwrap();
    let checkpoint = temp.path().join("ckpt");
    write_checkpoint(temp.path(), &checkpoint, 3);

    let toc = shardkv::storage::toc::read_toc(&checkpoint, "ckpt").unwrap();
    assert_eq!(toc.len(), 3);
    assert!(toc.iter().all(|&sid| sid > 0));

    run_ranks(2, repo(temp.path(), "restart2").build(), |ctx| {
        let (db, event) = ctx.restart(&checkpoint, "ckpt", OpenOptions::new(), false).unwrap();
        assert!(event.is_none());
        verify_all(&db, 300);
    });
}

#[test]
fn test_restart_on_more_ranks_asynchronously() {
    let temp = TempDir::new().unwrap();
    let checkpoint = temp.path().join("ckpt");
    write_checkpoint(temp.path(), &checkpoint, 2);

    run_ranks(3, repo(temp.path(), "restart3").build(), |ctx| {
        let (db, event) = ctx.restart(&checkpoint, "ckpt", OpenOptions::new(), true).unwrap();
        let event = event.expect("redistribution runs as an event");
        db.wait(event).unwrap();
        verify_all(&db, 200);
    });
}

#[test]
fn test_asynchronous_restart_reports_replay_failure_on_wait() {
    let temp = TempDir::new().unwrap();
    let checkpoint = temp.path().join("ckpt");
    write_checkpoint(temp.path(), &checkpoint, 2);

    let toc = shardkv::storage::toc::read_toc(&checkpoint, "ckpt").unwrap();
    for (rank, &sid) in toc.iter().enumerate() {
        for generation in 1..=sid {
            let paths = GenerationPaths::new(&checkpoint, "ckpt", rank, generation);
            std::fs::remove_file(&paths.data).unwrap();
        }
    }
    let pairs: u64 = toc.iter().sum();

    run_ranks(3, repo(temp.path(), "broken").build(), |ctx| {
        // the replay runs behind the event, so restart itself succeeds
        let (db, event) = ctx.restart(&checkpoint, "ckpt", OpenOptions::new(), true).unwrap();
        let replayed = db.wait(event.unwrap());
        // a rank is handed a pair when there are more pairs than its rank
        assert_eq!(replayed.is_err(), pairs as usize > ctx.rank(), "rank {}", ctx.rank());
    });
}

#[test]
fn test_restart_on_same_rank_count() {
    let temp = TempDir::new().unwrap();
    let checkpoint = temp.path().join("ckpt");
    write_checkpoint(temp.path(), &checkpoint, 3);

    run_ranks(3, repo(temp.path(), "same").build(), |ctx| {
        let (db, _) = ctx.restart(&checkpoint, "ckpt", OpenOptions::new(), false).unwrap();
        // generations are imported, nothing is replayed
        assert!(db.sstable_generation() > 0);
        assert_eq!(db.memtable_len(), 0);
        verify_all(&db, 300);
    });
}

#[test]
fn test_checkpoint_exports_every_rank() {
    let temp = TempDir::new().unwrap();
    let checkpoint = temp.path().join("ckpt");
    write_checkpoint(temp.path(), &checkpoint, 2);

    let toc = shardkv::storage::toc::read_toc(&checkpoint, "ckpt").unwrap();
    for (rank, &sid) in toc.iter().enumerate() {
        for generation in 1..=sid {
            let reader = shardkv::storage::SsTable::read_exported(&checkpoint, "ckpt", rank, generation);
            assert!(reader.is_ok(), "rank {} generation {}", rank, generation);
        }
    }
}

// =============================================================================
// Storage Groups
// =============================================================================

#[test]
fn test_group_reads_peer_generations() {
    let temp = TempDir::new().unwrap();
    let config = repo(temp.path(), "group").group_size(2).build();

    run_ranks(2, config, |ctx| {
        let db = ctx.open("group", OpenOptions::new()).unwrap();
        let start = ctx.rank() * 100;
        for i in start..start + 100 {
            db.put(&key(i), &value(i, "disk")).unwrap();
        }
        db.barrier(Level::SsTable).unwrap();
        for i in (start..start + 100).step_by(5) {
            db.put(&key(i), &value(i, "mem")).unwrap();
        }
        db.barrier(Level::MemTable).unwrap();

        for i in 0..200 {
            let tag = if i % 5 == 0 { "mem" } else { "disk" };
            assert_eq!(db.get(&key(i)).unwrap(), found(&value(i, tag)), "key {}", i);
        }
        assert_eq!(db.get(b"absent").unwrap(), Lookup::NotFound);
    });
}

// =============================================================================
// Signals / Updates
// =============================================================================

#[test]
fn test_signals_between_ranks() {
    let temp = TempDir::new().unwrap();
    run_ranks(3, repo(temp.path(), "signal").build(), |ctx| {
        let others: Vec<usize> = (0..ctx.size()).filter(|&r| r != ctx.rank()).collect();
        ctx.signal_notify(5, &others).unwrap();
        ctx.signal_wait(5, &others);

        // rank 0 releases the rest
        if ctx.rank() == 0 {
            ctx.signal_notify(6, &others).unwrap();
        } else {
            ctx.signal_wait(6, &[0]);
        }
    });
}

#[test]
fn test_remote_updates_are_serialized_on_owner() {
    let temp = TempDir::new().unwrap();
    run_ranks(3, repo(temp.path(), "update").build(), |ctx| {
        let db = ctx.open("update", OpenOptions::new().partition(digit_partition())).unwrap();
        db.register_update(1, add).unwrap();

        for _ in 0..20 {
            let outcome = db.update(b"2counter", Position::NONE, 1, &1u64.to_le_bytes()).unwrap();
            assert!(outcome.rewritten);
        }
        db.barrier(Level::MemTable).unwrap();

        assert_eq!(db.get(b"2counter").unwrap(), found(&60u64.to_le_bytes()));
    });
}

#[test]
fn test_duplicate_update_fn_still_joins_barrier() {
    let temp = TempDir::new().unwrap();
    run_ranks(2, repo(temp.path(), "dup").build(), |ctx| {
        let db = ctx.open("dup", OpenOptions::new()).unwrap();
        db.register_update(1, add).unwrap();

        if ctx.rank() == 0 {
            let err = db.register_update(1, add).unwrap_err();
            assert!(matches!(err, ShardError::DuplicateUpdateFn(1)));
        } else {
            db.register_update(2, add).unwrap();
        }
        db.barrier(Level::MemTable).unwrap();
    });
}

#[test]
fn test_remote_update_sees_staged_put() {
    let temp = TempDir::new().unwrap();
    run_ranks(2, repo(temp.path(), "staged").build(), |ctx| {
        let db = ctx.open("staged", OpenOptions::new().partition(digit_partition())).unwrap();
        db.register_update(1, add).unwrap();

        if ctx.rank() == 0 {
            db.put(b"1n", &10u64.to_le_bytes()).unwrap();
            let outcome = db.update(b"1n", Position::NONE, 1, &5u64.to_le_bytes()).unwrap();
            assert_eq!(as_u64(&outcome.output), 15);
        }
        db.barrier(Level::MemTable).unwrap();
        assert_eq!(db.get(b"1n").unwrap(), found(&15u64.to_le_bytes()));
    });
}

// =============================================================================
// Listener
// =============================================================================

#[test]
fn test_get_for_unknown_database_gets_a_reply() {
    let temp = TempDir::new().unwrap();
    let config = repo(temp.path(), "unknown").destroy_repository(false).build();
    let mut endpoints = MemFabric::new(2).into_iter();
    let local: Arc<dyn Transport> = endpoints.next().unwrap();
    let peer = endpoints.next().unwrap();

    let ctx = Context::start(config, local).unwrap();

    let header = GetHeader {
        dbid: 99,
        tag: 5,
        key_len: 1,
        position: 0,
        group: -1,
    };
    peer.send(0, Channel::Request, 0, encode_message(&Message::Get(header))).unwrap();
    peer.send(0, Channel::Request, 5, Bytes::from_static(b"k")).unwrap();

    let (source, reply) = peer.recv(Some(0), Channel::Reply, 5).unwrap();
    assert_eq!(source, 0);
    assert!(matches!(decode_get_reply(&reply), Err(ShardError::UnknownDatabase(99))));

    // the listener keeps serving after the error reply
    thread::scope(|scope| {
        scope.spawn(|| peer.barrier().unwrap());
        ctx.shutdown().unwrap();
    });
}
