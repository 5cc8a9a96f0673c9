//! Listener
//!
//! Single receive loop per rank. Each request frame is handled to completion
//! before the next one is received, so inbound operations on a rank never run
//! concurrently with each other.

use std::collections::HashMap;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use bytes::Bytes;
use parking_lot::{Mutex, RwLock};

use crate::command::CommandOutput;
use crate::db::Db;
use crate::error::{Result, ShardError};
use crate::protocol::{
    decode_message, encode_get_error, encode_get_reply, encode_status, encode_update_reply, Message,
    GET_FAILED, GET_UNKNOWN_DATABASE, STATUS_ERROR, STATUS_OK,
};
use crate::signal::Signal;

use super::dispatcher::PendingCommands;
use super::transport::{Channel, Transport};

/// Open databases of one rank, by id
pub type Registry = RwLock<HashMap<u64, Arc<Db>>>;

struct Inbound {
    transport: Arc<dyn Transport>,
    registry: Arc<Registry>,
    pending: Arc<PendingCommands>,
    signal: Arc<Signal>,
}

/// Inbound request executor
pub struct Listener {
    rank: usize,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl Listener {
    pub fn start(
        transport: Arc<dyn Transport>,
        registry: Arc<Registry>,
        pending: Arc<PendingCommands>,
        signal: Arc<Signal>,
    ) -> Result<Self> {
        let rank = transport.rank();
        let inbound = Inbound {
            transport,
            registry,
            pending,
            signal,
        };
        let worker = thread::Builder::new()
            .name(format!("shardkv-listener-{}", rank))
            .spawn(move || inbound.run())?;
        tracing::debug!(rank, "listener started");

        Ok(Self {
            rank,
            worker: Mutex::new(Some(worker)),
        })
    }

    /// Join the receive loop; an EXIT message must already be on its way
    pub fn join(&self) {
        let handle = self.worker.lock().take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                tracing::error!(rank = self.rank, "listener panicked");
            }
            tracing::debug!(rank = self.rank, "listener stopped");
        }
    }
}

impl Inbound {
    fn run(self) {
        loop {
            let (source, frame) = match self.transport.recv(None, Channel::Request, 0) {
                Ok(received) => received,
                Err(e) => {
                    tracing::error!(error = %e, "listener receive failed");
                    break;
                }
            };

            let message = match decode_message(&frame) {
                Ok(message) => message,
                Err(e) => {
                    tracing::error!(source, error = %e, "dropping malformed frame");
                    continue;
                }
            };

            if message == Message::Exit {
                break;
            }
            if let Err(e) = self.handle(source, &message) {
                tracing::error!(source, error = %e, "request failed");
                self.reply_failure(source, &message);
            }
        }
    }

    fn handle(&self, source: usize, message: &Message) -> Result<()> {
        tracing::trace!(source, op = ?message.op_code(), "handling");

        let bulk = match message.tag() {
            Some(tag) if message.bulk_len() > 0 => {
                let (_, bulk) = self.transport.recv(Some(source), Channel::Request, tag)?;
                if bulk.len() as u64 != message.bulk_len() {
                    return Err(ShardError::Protocol(format!(
                        "bulk of {} bytes, frame advertised {}",
                        bulk.len(),
                        message.bulk_len()
                    )));
                }
                bulk
            }
            _ => Bytes::new(),
        };

        match message {
            Message::Put(h) => {
                let (key, value) = split_bulk(&bulk, h.key_len)?;
                let status = match self.db(h.dbid) {
                    Ok(db) => {
                        db.put_local(key.to_vec(), value.to_vec(), h.tombstone);
                        STATUS_OK
                    }
                    Err(e) => {
                        tracing::warn!(source, error = %e, "put for unknown database");
                        STATUS_ERROR
                    }
                };
                if h.sync {
                    self.reply(source, h.tag, encode_status(status))?;
                }
            }
            Message::Get(h) => {
                let reply = match self.db(h.dbid) {
                    Ok(db) => encode_get_reply(&db.serve_get(&bulk, h.group)),
                    Err(e) => {
                        tracing::warn!(source, error = %e, "get for unknown database");
                        encode_get_error(GET_UNKNOWN_DATABASE, h.dbid)
                    }
                };
                self.reply(source, h.tag, reply)?;
            }
            Message::Migrate(h) => {
                let status = match self.db(h.dbid).and_then(|db| db.serve_migrate(&bulk, source, h.level)) {
                    Ok(()) => STATUS_OK,
                    Err(e) => {
                        tracing::error!(source, error = %e, "migration failed");
                        STATUS_ERROR
                    }
                };
                if h.sync {
                    self.reply(source, h.tag, encode_status(status))?;
                }
            }
            Message::Update(h) => {
                let (key, input) = split_bulk(&bulk, h.key_len)?;
                let (status, output) = match self.db(h.dbid) {
                    Ok(db) => db.serve_update(key, h.position, h.fnid, input, h.output_len as usize),
                    Err(_) => (STATUS_ERROR, Vec::new()),
                };
                self.reply(source, h.tag, encode_update_reply(status, &output))?;
            }
            Message::Barrier(h) => {
                let flushed = match self.db(h.dbid) {
                    Ok(db) if h.level.includes_sstable() => db.flush_local_sync(),
                    Ok(_) => Ok(()),
                    Err(e) => Err(e),
                };
                match self.pending.lock().remove(&h.command) {
                    Some(command) => command.complete(flushed.map(|_| CommandOutput::None)),
                    None => tracing::warn!(command = h.command, "barrier for unknown command"),
                }
            }
            Message::Signal { signum } => self.signal.notify_local(*signum, source),
            Message::Exit => {}
        }
        Ok(())
    }

    fn db(&self, dbid: u64) -> Result<Arc<Db>> {
        self.registry
            .read()
            .get(&dbid)
            .cloned()
            .ok_or(ShardError::UnknownDatabase(dbid))
    }

    fn reply(&self, dest: usize, tag: u64, payload: Bytes) -> Result<()> {
        self.transport.send(dest, Channel::Reply, tag, payload)
    }

    /// Answer a request that could not be handled so the asker does not block
    fn reply_failure(&self, source: usize, message: &Message) {
        let sent = match message {
            Message::Put(h) if h.sync => self.reply(source, h.tag, encode_status(STATUS_ERROR)),
            Message::Migrate(h) if h.sync => self.reply(source, h.tag, encode_status(STATUS_ERROR)),
            Message::Get(h) => self.reply(source, h.tag, encode_get_error(GET_FAILED, h.dbid)),
            Message::Update(h) => self.reply(source, h.tag, encode_update_reply(STATUS_ERROR, &[])),
            _ => Ok(()),
        };
        if let Err(e) = sent {
            tracing::error!(source, error = %e, "failure reply not sent");
        }
    }
}

/// Split a bulk transfer into its key and the bytes after it
fn split_bulk(bulk: &[u8], key_len: u64) -> Result<(&[u8], &[u8])> {
    match usize::try_from(key_len) {
        Ok(len) if len <= bulk.len() => Ok(bulk.split_at(len)),
        _ => Err(ShardError::Protocol(format!(
            "key of {} bytes in a bulk of {}",
            key_len,
            bulk.len()
        ))),
    }
}
