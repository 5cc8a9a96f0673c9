//! Protocol Module
//!
//! Defines the rank-to-rank wire protocol.
//!
//! ## Frame Format
//! Every request starts with one fixed-size frame on the request channel
//! (tag 0). Integers are little-endian; unused bytes are zero.
//! ```text
//! ┌────────────┬──────────────────────────────────────────────────┐
//! │ OpCode i32 │ typed fields ... zero padding up to 256 bytes    │
//! └────────────┴──────────────────────────────────────────────────┘
//! ```
//! Variable-length bytes (keys, values, update input, migrated records)
//! follow as one bulk transfer on the request channel, using the command's
//! tag, with exactly the length advertised in the frame. Replies travel on
//! the reply channel under the same tag.
//!
//! ### Op-codes and fields
//! - 0x2101 PUT:     dbid u64, tag u64, key_len u64, value_len u64, tombstone u8, sync u8
//!                   bulk: key ‖ value; reply (sync only): status i32
//! - 0x2102 GET:     dbid u64, tag u64, key_len u64, position u64, group i32
//!                   bulk: key; reply: GetReply packet ‖ value
//! - 0x2104 MIGRATE: dbid u64, tag u64, sync u8, level i32, size u64
//!                   bulk: records; reply (sync only): status i32
//! - 0x2106 SIGNAL:  signum i32
//! - 0x2107 BARRIER: dbid u64, level i32, command u64 (sent to self)
//! - 0x210c UPDATE:  dbid u64, tag u64, key_len u64, position u64, fnid i32,
//!                   input_len u64, output_len u64
//!                   bulk: key ‖ input; reply: status i32 ‖ output
//! - 0x21ff EXIT:    (sent to self to stop the listener)
//!
//! ### GET reply packet
//! ```text
//! ┌──────────┬──────────┬──────────────┬──────────┬──────────────┐
//! │status u64│scope u64 │value_len u64 │ sid u64  │position u64  │ value...
//! └──────────┴──────────┴──────────────┴──────────┴──────────────┘
//! status: 1 found, 2 tombstone, 3 not found,
//!         4 unknown database, 5 request failed (sid carries the dbid)
//! scope:  1 memtable only, 2 memtable + sstable
//! ```

mod codec;
mod message;

pub use codec::{
    decode_get_reply, decode_message, decode_status, decode_update_reply, encode_get_error,
    encode_get_reply, encode_message, encode_status, encode_update_reply, FRAME_SIZE, GET_FAILED,
    GET_REPLY_SIZE, GET_UNKNOWN_DATABASE,
};
pub use message::{
    BarrierHeader, GetHeader, GetReply, LookupScope, Message, MigrateHeader, OpCode, PutHeader,
    UpdateHeader,
};

/// Reply status: success
pub const STATUS_OK: i32 = 0;
/// Reply status: the operation failed on the owner
pub const STATUS_ERROR: i32 = -1;
/// Update reply status: the function declined to rewrite the value
pub const STATUS_UNCHANGED: i32 = 1;
