//! Message definitions
//!
//! Typed request headers carried in the fixed frame.

use crate::config::Level;
use crate::error::{Result, ShardError};
use crate::memtable::Lookup;

/// Request op-codes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum OpCode {
    Put = 0x2101,
    Get = 0x2102,
    Migrate = 0x2104,
    Signal = 0x2106,
    Barrier = 0x2107,
    Update = 0x210c,
    Exit = 0x21ff,
}

impl TryFrom<i32> for OpCode {
    type Error = ShardError;

    fn try_from(value: i32) -> Result<Self> {
        match value {
            0x2101 => Ok(OpCode::Put),
            0x2102 => Ok(OpCode::Get),
            0x2104 => Ok(OpCode::Migrate),
            0x2106 => Ok(OpCode::Signal),
            0x2107 => Ok(OpCode::Barrier),
            0x210c => Ok(OpCode::Update),
            0x21ff => Ok(OpCode::Exit),
            _ => Err(ShardError::Protocol(format!("unknown op-code 0x{:x}", value))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PutHeader {
    pub dbid: u64,
    pub tag: u64,
    pub key_len: u64,
    pub value_len: u64,
    pub tombstone: bool,
    pub sync: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GetHeader {
    pub dbid: u64,
    pub tag: u64,
    pub key_len: u64,
    /// Opaque position handle requested by the asker (0 = none)
    pub position: u64,
    /// Storage group of the asker
    pub group: i32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigrateHeader {
    pub dbid: u64,
    pub tag: u64,
    pub sync: bool,
    pub level: Level,
    /// Bytes of serialized records that follow
    pub size: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdateHeader {
    pub dbid: u64,
    pub tag: u64,
    pub key_len: u64,
    pub position: u64,
    pub fnid: i32,
    pub input_len: u64,
    pub output_len: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BarrierHeader {
    pub dbid: u64,
    pub level: Level,
    /// Id of the pending barrier command to complete
    pub command: u64,
}

/// A decoded request frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Put(PutHeader),
    Get(GetHeader),
    Migrate(MigrateHeader),
    Signal { signum: i32 },
    Barrier(BarrierHeader),
    Update(UpdateHeader),
    Exit,
}

impl Message {
    pub fn op_code(&self) -> OpCode {
        match self {
            Message::Put(_) => OpCode::Put,
            Message::Get(_) => OpCode::Get,
            Message::Migrate(_) => OpCode::Migrate,
            Message::Signal { .. } => OpCode::Signal,
            Message::Barrier(_) => OpCode::Barrier,
            Message::Update(_) => OpCode::Update,
            Message::Exit => OpCode::Exit,
        }
    }

    /// Length of the bulk transfer that follows the frame (0 = none)
    ///
    /// Saturates on overflow; decoded frames never overflow.
    pub fn bulk_len(&self) -> u64 {
        self.checked_bulk_len().unwrap_or(u64::MAX)
    }

    pub(crate) fn checked_bulk_len(&self) -> Option<u64> {
        match self {
            Message::Put(h) => h.key_len.checked_add(h.value_len),
            Message::Get(h) => Some(h.key_len),
            Message::Migrate(h) => Some(h.size),
            Message::Update(h) => h.key_len.checked_add(h.input_len),
            Message::Signal { .. } | Message::Barrier(_) | Message::Exit => Some(0),
        }
    }

    /// Tag of the bulk transfer and reply
    pub fn tag(&self) -> Option<u64> {
        match self {
            Message::Put(h) => Some(h.tag),
            Message::Get(h) => Some(h.tag),
            Message::Migrate(h) => Some(h.tag),
            Message::Update(h) => Some(h.tag),
            Message::Signal { .. } | Message::Barrier(_) | Message::Exit => None,
        }
    }
}

/// How far the owner searched before replying to a GET
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u64)]
pub enum LookupScope {
    MemTable = 1,
    SsTable = 2,
}

/// Reply to a GET
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GetReply {
    pub result: Lookup,
    pub scope: LookupScope,
    /// Owner's newest generation, for an asker that reads the files itself
    pub sid: u64,
    pub position: u64,
}
