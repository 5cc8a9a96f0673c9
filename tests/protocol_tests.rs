//! Tests for the wire protocol and the in-process fabric
//!
//! These tests verify:
//! - Every request frame decodes to the message it was encoded from
//! - Bulk length and tag reported for each message
//! - Reply encodings (status, GET, UPDATE)
//! - Tag matching, source filtering and collectives on the fabric

use std::sync::Arc;
use std::thread;

use bytes::Bytes;
use shardkv::config::Level;
use shardkv::memtable::Lookup;
use shardkv::network::{Channel, MemFabric, Transport};
use shardkv::protocol::{
    decode_get_reply, decode_message, decode_status, decode_update_reply, encode_get_reply,
    encode_message, encode_status, encode_update_reply, BarrierHeader, GetHeader, GetReply,
    LookupScope, Message, MigrateHeader, OpCode, PutHeader, UpdateHeader, FRAME_SIZE,
    GET_REPLY_SIZE, STATUS_ERROR, STATUS_OK, STATUS_UNCHANGED,
};
use shardkv::ShardError;

// =============================================================================
// Helper Functions
// =============================================================================

fn sample_messages() -> Vec<Message> {
    vec![
        Message::Put(PutHeader {
            dbid: 1,
            tag: 17,
            key_len: 5,
            value_len: 300,
            tombstone: false,
            sync: true,
        }),
        Message::Get(GetHeader {
            dbid: 2,
            tag: 18,
            key_len: 9,
            position: 4,
            group: -1,
        }),
        Message::Migrate(MigrateHeader {
            dbid: 3,
            tag: 19,
            sync: false,
            level: Level::SsTable,
            size: 4096,
        }),
        Message::Signal { signum: 12 },
        Message::Barrier(BarrierHeader {
            dbid: 4,
            level: Level::MemTable,
            command: 77,
        }),
        Message::Update(UpdateHeader {
            dbid: 5,
            tag: 20,
            key_len: 3,
            position: 0,
            fnid: 2,
            input_len: 8,
            output_len: 0,
        }),
        Message::Exit,
    ]
}

// =============================================================================
// Request Frames
// =============================================================================

#[test]
fn test_every_message_survives_a_frame() {
    for message in sample_messages() {
        let frame = encode_message(&message);
        assert_eq!(frame.len(), FRAME_SIZE);
        assert_eq!(decode_message(&frame).unwrap(), message);
    }
}

#[test]
fn test_frame_starts_with_op_code() {
    let expected = [
        OpCode::Put,
        OpCode::Get,
        OpCode::Migrate,
        OpCode::Signal,
        OpCode::Barrier,
        OpCode::Update,
        OpCode::Exit,
    ];
    for (message, op) in sample_messages().iter().zip(expected) {
        let frame = encode_message(message);
        assert_eq!(&frame[0..4], &(op as i32).to_le_bytes());
        assert_eq!(message.op_code(), op);
    }
}

#[test]
fn test_bulk_length_and_tag() {
    let messages = sample_messages();
    let bulk: Vec<u64> = messages.iter().map(|m| m.bulk_len()).collect();
    assert_eq!(bulk, vec![305, 9, 4096, 0, 0, 11, 0]);

    let tags: Vec<Option<u64>> = messages.iter().map(|m| m.tag()).collect();
    assert_eq!(tags, vec![Some(17), Some(18), Some(19), None, None, Some(20), None]);
}

#[test]
fn test_combined_level_decodes_as_sstable() {
    let mut frame = encode_message(&Message::Barrier(BarrierHeader {
        dbid: 1,
        level: Level::MemTable,
        command: 2,
    }))
    .to_vec();
    // dbid occupies bytes 4..12, level follows
    frame[12..16].copy_from_slice(&3i32.to_le_bytes());
    match decode_message(&frame).unwrap() {
        Message::Barrier(h) => assert_eq!(h.level, Level::SsTable),
        other => panic!("unexpected message {:?}", other),
    }

    frame[12..16].copy_from_slice(&9i32.to_le_bytes());
    assert!(matches!(decode_message(&frame), Err(ShardError::Protocol(_))));
}

// =============================================================================
// Replies
// =============================================================================

#[test]
fn test_status_reply() {
    for status in [STATUS_OK, STATUS_ERROR, STATUS_UNCHANGED] {
        assert_eq!(decode_status(&encode_status(status)).unwrap(), status);
    }
    assert!(decode_status(&[0, 0]).is_err());
}

#[test]
fn test_get_reply_without_value() {
    for result in [Lookup::Tombstone, Lookup::NotFound] {
        let reply = GetReply {
            result,
            scope: LookupScope::MemTable,
            sid: 7,
            position: 3,
        };
        let raw = encode_get_reply(&reply);
        assert_eq!(raw.len(), GET_REPLY_SIZE);
        assert_eq!(decode_get_reply(&raw).unwrap(), reply);
    }
}

#[test]
fn test_get_reply_rejects_unknown_status() {
    let mut raw = encode_get_reply(&GetReply {
        result: Lookup::NotFound,
        scope: LookupScope::SsTable,
        sid: 0,
        position: 0,
    })
    .to_vec();
    raw[0..8].copy_from_slice(&9u64.to_le_bytes());
    assert!(decode_get_reply(&raw).is_err());
}

#[test]
fn test_update_reply_carries_output() {
    let raw = encode_update_reply(STATUS_OK, b"result");
    let (status, output) = decode_update_reply(&raw).unwrap();
    assert_eq!(status, STATUS_OK);
    assert_eq!(output, b"result");

    let (status, output) = decode_update_reply(&encode_update_reply(STATUS_UNCHANGED, b"")).unwrap();
    assert_eq!(status, STATUS_UNCHANGED);
    assert!(output.is_empty());
}

// =============================================================================
// Fabric
// =============================================================================

#[test]
fn test_fabric_matches_channel_and_tag() {
    let endpoints = MemFabric::new(2);
    let (a, b) = (&endpoints[0], &endpoints[1]);

    a.send(1, Channel::Reply, 5, Bytes::from_static(b"reply")).unwrap();
    a.send(1, Channel::Request, 9, Bytes::from_static(b"bulk")).unwrap();
    a.send(1, Channel::Request, 0, Bytes::from_static(b"frame")).unwrap();

    let (source, payload) = b.recv(None, Channel::Request, 0).unwrap();
    assert_eq!((source, &payload[..]), (0, &b"frame"[..]));
    let (_, payload) = b.recv(Some(0), Channel::Request, 9).unwrap();
    assert_eq!(&payload[..], b"bulk");
    let (_, payload) = b.recv(Some(0), Channel::Reply, 5).unwrap();
    assert_eq!(&payload[..], b"reply");
}

#[test]
fn test_fabric_preserves_send_order() {
    let endpoints = MemFabric::new(2);
    for i in 0..10u8 {
        endpoints[0].send(1, Channel::Request, 0, Bytes::from(vec![i])).unwrap();
    }
    for i in 0..10u8 {
        let (_, payload) = endpoints[1].recv(Some(0), Channel::Request, 0).unwrap();
        assert_eq!(payload[0], i);
    }
}

#[test]
fn test_fabric_send_to_unknown_rank() {
    let endpoints = MemFabric::new(1);
    assert!(matches!(
        endpoints[0].send(3, Channel::Request, 0, Bytes::new()),
        Err(ShardError::Network(_))
    ));
}

#[test]
fn test_close_wakes_receiver() {
    let endpoints = MemFabric::new(2);
    let receiver = Arc::clone(&endpoints[1]);
    let handle = thread::spawn(move || receiver.recv(Some(0), Channel::Reply, 1));

    endpoints[0].close();
    assert!(matches!(handle.join().unwrap(), Err(ShardError::Network(_))));
}

#[test]
fn test_gather_collects_at_root() {
    let endpoints = MemFabric::new(4);
    let handles: Vec<_> = endpoints
        .into_iter()
        .map(|endpoint| {
            thread::spawn(move || {
                let value = (endpoint.rank() as u64 + 1) * 10;
                let gathered = endpoint.gather_u64(value, 0).unwrap();
                endpoint.barrier().unwrap();
                (endpoint.rank(), gathered)
            })
        })
        .collect();

    for handle in handles {
        let (rank, gathered) = handle.join().unwrap();
        if rank == 0 {
            assert_eq!(gathered, Some(vec![10, 20, 30, 40]));
        } else {
            assert_eq!(gathered, None);
        }
    }
}
