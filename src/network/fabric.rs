//! In-process fabric
//!
//! Connects N ranks running as threads of one process. Each rank owns a
//! mailbox; `recv` scans it for the oldest envelope matching
//! `(source, channel, tag)` and otherwise sleeps on the mailbox condvar.
//! Messages between one pair of ranks on one `(channel, tag)` arrive in
//! send order.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Barrier};

use bytes::Bytes;
use parking_lot::{Condvar, Mutex};

use crate::error::{Result, ShardError};

use super::transport::{Channel, Transport};

struct Envelope {
    source: usize,
    channel: Channel,
    tag: u64,
    payload: Bytes,
}

#[derive(Default)]
struct Mailbox {
    queue: Mutex<VecDeque<Envelope>>,
    cond: Condvar,
}

struct FabricShared {
    mailboxes: Vec<Mailbox>,
    barrier: Barrier,
    closed: AtomicBool,
}

/// Factory for a set of connected in-process endpoints
pub struct MemFabric;

impl MemFabric {
    /// Create `size` endpoints, one per rank
    pub fn new(size: usize) -> Vec<Arc<MemEndpoint>> {
        let size = size.max(1);
        let shared = Arc::new(FabricShared {
            mailboxes: (0..size).map(|_| Mailbox::default()).collect(),
            barrier: Barrier::new(size),
            closed: AtomicBool::new(false),
        });
        (0..size)
            .map(|rank| {
                Arc::new(MemEndpoint {
                    rank,
                    shared: Arc::clone(&shared),
                })
            })
            .collect()
    }
}

/// One rank's view of the fabric
pub struct MemEndpoint {
    rank: usize,
    shared: Arc<FabricShared>,
}

impl MemEndpoint {
    /// Wake every blocked receiver with a `Network` error
    pub fn close(&self) {
        self.shared.closed.store(true, Ordering::Release);
        for mailbox in &self.shared.mailboxes {
            let _queue = mailbox.queue.lock();
            mailbox.cond.notify_all();
        }
    }
}

impl Transport for MemEndpoint {
    fn rank(&self) -> usize {
        self.rank
    }

    fn size(&self) -> usize {
        self.shared.mailboxes.len()
    }

    fn send(&self, dest: usize, channel: Channel, tag: u64, payload: Bytes) -> Result<()> {
        let mailbox = self
            .shared
            .mailboxes
            .get(dest)
            .ok_or_else(|| ShardError::Network(format!("no rank {}", dest)))?;
        let mut queue = mailbox.queue.lock();
        queue.push_back(Envelope {
            source: self.rank,
            channel,
            tag,
            payload,
        });
        mailbox.cond.notify_all();
        Ok(())
    }

    fn recv(&self, source: Option<usize>, channel: Channel, tag: u64) -> Result<(usize, Bytes)> {
        let mailbox = &self.shared.mailboxes[self.rank];
        let mut queue = mailbox.queue.lock();
        loop {
            let found = queue.iter().position(|e| {
                e.channel == channel && e.tag == tag && source.map_or(true, |s| s == e.source)
            });
            if let Some(pos) = found {
                if let Some(envelope) = queue.remove(pos) {
                    return Ok((envelope.source, envelope.payload));
                }
            }
            if self.shared.closed.load(Ordering::Acquire) {
                return Err(ShardError::Network("fabric closed".to_string()));
            }
            mailbox.cond.wait(&mut queue);
        }
    }

    fn barrier(&self) -> Result<()> {
        self.shared.barrier.wait();
        Ok(())
    }
}
