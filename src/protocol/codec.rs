//! Protocol codec
//!
//! Encoding and decoding of request frames and replies.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::config::Level;
use crate::error::{Result, ShardError};
use crate::memtable::Lookup;

use super::message::{
    BarrierHeader, GetHeader, GetReply, LookupScope, Message, MigrateHeader, OpCode, PutHeader,
    UpdateHeader,
};

/// Size of every request frame
pub const FRAME_SIZE: usize = 256;

/// Fixed part of a GET reply: five u64 fields
pub const GET_REPLY_SIZE: usize = 40;

/// GET reply status: the owner has no database with the requested id
pub const GET_UNKNOWN_DATABASE: u64 = 4;
/// GET reply status: the owner rejected the request
pub const GET_FAILED: u64 = 5;

// =============================================================================
// Request Frames
// =============================================================================

/// Encode a request into a zero-padded frame
pub fn encode_message(message: &Message) -> Bytes {
    let mut buf = BytesMut::with_capacity(FRAME_SIZE);
    buf.put_i32_le(message.op_code() as i32);

    match message {
        Message::Put(h) => {
            buf.put_u64_le(h.dbid);
            buf.put_u64_le(h.tag);
            buf.put_u64_le(h.key_len);
            buf.put_u64_le(h.value_len);
            buf.put_u8(h.tombstone as u8);
            buf.put_u8(h.sync as u8);
        }
        Message::Get(h) => {
            buf.put_u64_le(h.dbid);
            buf.put_u64_le(h.tag);
            buf.put_u64_le(h.key_len);
            buf.put_u64_le(h.position);
            buf.put_i32_le(h.group);
        }
        Message::Migrate(h) => {
            buf.put_u64_le(h.dbid);
            buf.put_u64_le(h.tag);
            buf.put_u8(h.sync as u8);
            buf.put_i32_le(h.level as i32);
            buf.put_u64_le(h.size);
        }
        Message::Signal { signum } => {
            buf.put_i32_le(*signum);
        }
        Message::Barrier(h) => {
            buf.put_u64_le(h.dbid);
            buf.put_i32_le(h.level as i32);
            buf.put_u64_le(h.command);
        }
        Message::Update(h) => {
            buf.put_u64_le(h.dbid);
            buf.put_u64_le(h.tag);
            buf.put_u64_le(h.key_len);
            buf.put_u64_le(h.position);
            buf.put_i32_le(h.fnid);
            buf.put_u64_le(h.input_len);
            buf.put_u64_le(h.output_len);
        }
        Message::Exit => {}
    }

    buf.resize(FRAME_SIZE, 0);
    buf.freeze()
}

/// Decode a request frame
pub fn decode_message(frame: &[u8]) -> Result<Message> {
    if frame.len() != FRAME_SIZE {
        return Err(ShardError::Protocol(format!(
            "frame of {} bytes (expected {})",
            frame.len(),
            FRAME_SIZE
        )));
    }

    let mut buf = frame;
    let op = OpCode::try_from(buf.get_i32_le())?;

    let message = match op {
        OpCode::Put => Message::Put(PutHeader {
            dbid: buf.get_u64_le(),
            tag: buf.get_u64_le(),
            key_len: buf.get_u64_le(),
            value_len: buf.get_u64_le(),
            tombstone: buf.get_u8() != 0,
            sync: buf.get_u8() != 0,
        }),
        OpCode::Get => Message::Get(GetHeader {
            dbid: buf.get_u64_le(),
            tag: buf.get_u64_le(),
            key_len: buf.get_u64_le(),
            position: buf.get_u64_le(),
            group: buf.get_i32_le(),
        }),
        OpCode::Migrate => Message::Migrate(MigrateHeader {
            dbid: buf.get_u64_le(),
            tag: buf.get_u64_le(),
            sync: buf.get_u8() != 0,
            level: Level::try_from(buf.get_i32_le())?,
            size: buf.get_u64_le(),
        }),
        OpCode::Signal => Message::Signal {
            signum: buf.get_i32_le(),
        },
        OpCode::Barrier => Message::Barrier(BarrierHeader {
            dbid: buf.get_u64_le(),
            level: Level::try_from(buf.get_i32_le())?,
            command: buf.get_u64_le(),
        }),
        OpCode::Update => Message::Update(UpdateHeader {
            dbid: buf.get_u64_le(),
            tag: buf.get_u64_le(),
            key_len: buf.get_u64_le(),
            position: buf.get_u64_le(),
            fnid: buf.get_i32_le(),
            input_len: buf.get_u64_le(),
            output_len: buf.get_u64_le(),
        }),
        OpCode::Exit => Message::Exit,
    };

    if message.checked_bulk_len().is_none() {
        return Err(ShardError::Protocol(format!(
            "{:?} frame advertises a bulk length that overflows u64",
            op
        )));
    }
    Ok(message)
}

// =============================================================================
// Replies
// =============================================================================

pub fn encode_status(status: i32) -> Bytes {
    Bytes::copy_from_slice(&status.to_le_bytes())
}

pub fn decode_status(reply: &[u8]) -> Result<i32> {
    if reply.len() < 4 {
        return Err(ShardError::Protocol(format!("status reply of {} bytes", reply.len())));
    }
    let mut buf = reply;
    Ok(buf.get_i32_le())
}

/// Encode a GET reply telling the asker the owner could not serve it
///
/// `code` is [`GET_UNKNOWN_DATABASE`] or [`GET_FAILED`]; the sid slot carries
/// the database id.
pub fn encode_get_error(code: u64, dbid: u64) -> Bytes {
    let mut buf = BytesMut::with_capacity(GET_REPLY_SIZE);
    buf.put_u64_le(code);
    buf.put_u64_le(LookupScope::SsTable as u64);
    buf.put_u64_le(0);
    buf.put_u64_le(dbid);
    buf.put_u64_le(0);
    buf.freeze()
}

/// Encode a GET reply packet followed by the value when found
pub fn encode_get_reply(reply: &GetReply) -> Bytes {
    let value: &[u8] = match &reply.result {
        Lookup::Found(v) => v,
        _ => &[],
    };
    let mut buf = BytesMut::with_capacity(GET_REPLY_SIZE + value.len());
    buf.put_u64_le(reply.result.code());
    buf.put_u64_le(reply.scope as u64);
    buf.put_u64_le(value.len() as u64);
    buf.put_u64_le(reply.sid);
    buf.put_u64_le(reply.position);
    buf.put_slice(value);
    buf.freeze()
}

pub fn decode_get_reply(reply: &[u8]) -> Result<GetReply> {
    if reply.len() < GET_REPLY_SIZE {
        return Err(ShardError::Protocol(format!("get reply of {} bytes", reply.len())));
    }
    let mut buf = reply;
    let status = buf.get_u64_le();
    let scope = match buf.get_u64_le() {
        1 => LookupScope::MemTable,
        2 => LookupScope::SsTable,
        other => return Err(ShardError::Protocol(format!("unknown lookup scope {}", other))),
    };
    let value_len = buf.get_u64_le() as usize;
    let sid = buf.get_u64_le();
    let position = buf.get_u64_le();

    let result = match status {
        1 => {
            if buf.remaining() != value_len {
                return Err(ShardError::Protocol(format!(
                    "get reply advertises {} value bytes, carries {}",
                    value_len,
                    buf.remaining()
                )));
            }
            Lookup::Found(buf.to_vec())
        }
        2 => Lookup::Tombstone,
        3 => Lookup::NotFound,
        GET_UNKNOWN_DATABASE => return Err(ShardError::UnknownDatabase(sid)),
        GET_FAILED => {
            return Err(ShardError::Network(format!(
                "owner could not serve get on database {}",
                sid
            )))
        }
        other => return Err(ShardError::Protocol(format!("unknown get status {}", other))),
    };

    Ok(GetReply {
        result,
        scope,
        sid,
        position,
    })
}

/// Encode an UPDATE reply: status followed by the function's output
pub fn encode_update_reply(status: i32, output: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(4 + output.len());
    buf.put_i32_le(status);
    buf.put_slice(output);
    buf.freeze()
}

pub fn decode_update_reply(reply: &[u8]) -> Result<(i32, Vec<u8>)> {
    let status = decode_status(reply)?;
    Ok((status, reply[4..].to_vec()))
}
