//! Messaging capability
//!
//! Point-to-point send/receive with rank addressing and tags, plus the two
//! collectives the store needs. Any interconnect can back it; the crate ships
//! [`super::MemFabric`] for ranks living in one process.

use bytes::Bytes;

use crate::error::{Result, ShardError};

/// Logical message stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Channel {
    /// Request frames (tag 0) and bulk payloads (command tag)
    Request,
    /// Replies, matched by command tag
    Reply,
    /// Collective traffic (gather)
    Collective,
}

/// Interconnect between ranks
pub trait Transport: Send + Sync {
    /// This participant's rank
    fn rank(&self) -> usize;

    /// Number of participating ranks
    fn size(&self) -> usize;

    /// Deliver `payload` to `dest`
    fn send(&self, dest: usize, channel: Channel, tag: u64, payload: Bytes) -> Result<()>;

    /// Block until a message matching `(source, channel, tag)` arrives
    ///
    /// `source = None` matches any sender. Returns the sender's rank.
    fn recv(&self, source: Option<usize>, channel: Channel, tag: u64) -> Result<(usize, Bytes)>;

    /// Collective rendezvous of every rank
    fn barrier(&self) -> Result<()>;

    /// Collect one value per rank at `root`, indexed by rank
    ///
    /// Returns `Some` on the root and `None` elsewhere.
    fn gather_u64(&self, value: u64, root: usize) -> Result<Option<Vec<u64>>> {
        if self.rank() != root {
            self.send(root, Channel::Collective, 0, Bytes::copy_from_slice(&value.to_le_bytes()))?;
            return Ok(None);
        }

        let mut values = vec![0u64; self.size()];
        values[root] = value;
        for rank in (0..self.size()).filter(|&r| r != root) {
            let (_, payload) = self.recv(Some(rank), Channel::Collective, 0)?;
            let mut word = [0u8; 8];
            if payload.len() != 8 {
                return Err(ShardError::Protocol(format!(
                    "gather payload of {} bytes from rank {}",
                    payload.len(),
                    rank
                )));
            }
            word.copy_from_slice(&payload);
            values[rank] = u64::from_le_bytes(word);
        }
        Ok(Some(values))
    }
}
