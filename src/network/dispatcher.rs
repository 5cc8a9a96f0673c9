//! Dispatcher
//!
//! The only component that issues requests to other ranks.
//!
//! ## Responsibilities
//! - Synchronous RPCs issued inline by the caller (PUT, GET, UPDATE, SIGNAL)
//! - A bounded FIFO queue drained by one worker for migrations, barrier
//!   rendezvous and checkpoint/restart file transfer
//! - Unique tags so concurrent callers match their own bulk and replies

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use bytes::Bytes;
use crossbeam::channel::{self, Receiver, Sender, TrySendError};
use parking_lot::Mutex;

use crate::command::{Command, CommandKind, CommandOutput};
use crate::config::Level;
use crate::error::{Result, ShardError};
use crate::protocol::{
    decode_get_reply, decode_status, decode_update_reply, encode_message, BarrierHeader,
    GetHeader, GetReply, Message, MigrateHeader, PutHeader, UpdateHeader, STATUS_OK,
};

use super::transport::{Channel, Transport};

/// Barrier commands waiting for this rank's listener, by command id
pub type PendingCommands = Mutex<HashMap<u64, Arc<Command>>>;

/// Request sender shared by callers and the worker
struct Outbound {
    rank: usize,
    transport: Arc<dyn Transport>,
    next_tag: AtomicU64,
}

impl Outbound {
    fn tag(&self) -> u64 {
        // tag 0 is reserved for request frames
        self.next_tag.fetch_add(1, Ordering::Relaxed)
    }

    fn request(&self, dest: usize, message: &Message, bulk: Option<Bytes>) -> Result<()> {
        tracing::trace!(dest, op = ?message.op_code(), "request");
        self.transport
            .send(dest, Channel::Request, 0, encode_message(message))?;
        match (message.tag(), bulk) {
            (Some(tag), Some(bulk)) if !bulk.is_empty() => {
                self.transport.send(dest, Channel::Request, tag, bulk)?;
            }
            _ => {}
        }
        Ok(())
    }

    fn reply(&self, dest: usize, tag: u64) -> Result<Bytes> {
        let (_, payload) = self.transport.recv(Some(dest), Channel::Reply, tag)?;
        Ok(payload)
    }

    fn migrate(&self, dest: usize, dbid: u64, records: Bytes, level: Level, sync: bool) -> Result<()> {
        let tag = self.tag();
        let message = Message::Migrate(MigrateHeader {
            dbid,
            tag,
            sync,
            level,
            size: records.len() as u64,
        });
        tracing::debug!(dest, dbid, bytes = records.len(), ?level, sync, "migrate");
        self.request(dest, &message, Some(records))?;
        if sync {
            check_status(dest, decode_status(&self.reply(dest, tag)?)?)?;
        }
        Ok(())
    }
}

/// Outbound request issuer and its queue worker
pub struct Dispatcher {
    outbound: Arc<Outbound>,
    queue: Sender<Arc<Command>>,
    pending: Arc<PendingCommands>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl Dispatcher {
    /// Start the worker thread
    pub fn start(transport: Arc<dyn Transport>, capacity: usize) -> Result<Self> {
        let rank = transport.rank();
        let outbound = Arc::new(Outbound {
            rank,
            transport,
            next_tag: AtomicU64::new(1),
        });
        let pending: Arc<PendingCommands> = Arc::new(Mutex::new(HashMap::new()));
        let (queue, receiver) = channel::bounded(capacity.max(1));

        let worker = {
            let outbound = Arc::clone(&outbound);
            let pending = Arc::clone(&pending);
            thread::Builder::new()
                .name(format!("shardkv-dispatcher-{}", rank))
                .spawn(move || run(outbound, pending, receiver))?
        };
        tracing::debug!(rank, capacity, "dispatcher started");

        Ok(Self {
            outbound,
            queue,
            pending,
            worker: Mutex::new(Some(worker)),
        })
    }

    /// Queue a command, retrying while the queue is full
    pub fn enqueue(&self, command: Arc<Command>) {
        enqueue(&self.queue, command);
    }

    /// Barrier commands awaiting completion by the listener
    pub fn pending(&self) -> Arc<PendingCommands> {
        Arc::clone(&self.pending)
    }

    // =========================================================================
    // Synchronous RPCs
    // =========================================================================

    /// Write one record on `dest`
    pub fn execute_put(
        &self,
        dest: usize,
        dbid: u64,
        key: &[u8],
        value: &[u8],
        tombstone: bool,
        sync: bool,
    ) -> Result<()> {
        let out = &self.outbound;
        let tag = out.tag();
        let message = Message::Put(PutHeader {
            dbid,
            tag,
            key_len: key.len() as u64,
            value_len: value.len() as u64,
            tombstone,
            sync,
        });
        let mut bulk = Vec::with_capacity(key.len() + value.len());
        bulk.extend_from_slice(key);
        bulk.extend_from_slice(value);
        out.request(dest, &message, Some(Bytes::from(bulk)))?;
        if sync {
            check_status(dest, decode_status(&out.reply(dest, tag)?)?)?;
        }
        Ok(())
    }

    /// Look up a key on `dest`
    pub fn execute_get(&self, dest: usize, dbid: u64, key: &[u8], position: u64, group: i32) -> Result<GetReply> {
        let out = &self.outbound;
        let tag = out.tag();
        let message = Message::Get(GetHeader {
            dbid,
            tag,
            key_len: key.len() as u64,
            position,
            group,
        });
        out.request(dest, &message, Some(Bytes::copy_from_slice(key)))?;
        decode_get_reply(&out.reply(dest, tag)?)
    }

    /// Run a registered update function on `dest`
    ///
    /// Returns the reply status and the function's output.
    #[allow(clippy::too_many_arguments)]
    pub fn execute_update(
        &self,
        dest: usize,
        dbid: u64,
        key: &[u8],
        position: u64,
        fnid: i32,
        input: &[u8],
        output_len: usize,
    ) -> Result<(i32, Vec<u8>)> {
        let out = &self.outbound;
        let tag = out.tag();
        let message = Message::Update(UpdateHeader {
            dbid,
            tag,
            key_len: key.len() as u64,
            position,
            fnid,
            input_len: input.len() as u64,
            output_len: output_len as u64,
        });
        let mut bulk = Vec::with_capacity(key.len() + input.len());
        bulk.extend_from_slice(key);
        bulk.extend_from_slice(input);
        out.request(dest, &message, Some(Bytes::from(bulk)))?;
        decode_update_reply(&out.reply(dest, tag)?)
    }

    /// Ship serialized records to `dest` from the calling thread
    pub fn execute_migrate(&self, dest: usize, dbid: u64, records: Vec<u8>, level: Level, sync: bool) -> Result<()> {
        self.outbound.migrate(dest, dbid, Bytes::from(records), level, sync)
    }

    pub fn signal(&self, dest: usize, signum: i32) -> Result<()> {
        self.outbound.request(dest, &Message::Signal { signum }, None)
    }

    /// Ask this rank's listener to stop
    pub fn exit_listener(&self) -> Result<()> {
        self.outbound.request(self.outbound.rank, &Message::Exit, None)
    }

    /// Drain the queue and stop the worker
    pub fn shutdown(&self, id: u64) {
        let handle = self.worker.lock().take();
        if let Some(handle) = handle {
            let exit = Command::new(id, CommandKind::Exit);
            enqueue(&self.queue, Arc::clone(&exit));
            if let Err(e) = exit.wait() {
                tracing::warn!(error = %e, "dispatcher exit");
            }
            if handle.join().is_err() {
                tracing::error!("dispatcher worker panicked");
            }
            tracing::debug!(rank = self.outbound.rank, "dispatcher stopped");
        }
    }
}

pub(crate) fn enqueue(queue: &Sender<Arc<Command>>, command: Arc<Command>) {
    let mut command = command;
    loop {
        match queue.try_send(command) {
            Ok(()) => return,
            Err(TrySendError::Full(back)) => {
                command = back;
                thread::yield_now();
            }
            Err(TrySendError::Disconnected(back)) => {
                back.complete(Err(ShardError::Shutdown));
                return;
            }
        }
    }
}

fn check_status(dest: usize, status: i32) -> Result<()> {
    if status == STATUS_OK {
        Ok(())
    } else {
        Err(ShardError::Network(format!("rank {} replied with status {}", dest, status)))
    }
}

// =============================================================================
// Worker
// =============================================================================

fn run(outbound: Arc<Outbound>, pending: Arc<PendingCommands>, receiver: Receiver<Arc<Command>>) {
    for command in receiver.iter() {
        command.start();
        tracing::debug!(id = command.id(), kind = ?command.kind().code(), "dispatching");

        let result = match command.kind() {
            CommandKind::Migrate {
                db,
                batches,
                source,
                level,
                sync,
            } => {
                let sent = batches.iter().try_for_each(|(dest, records)| {
                    outbound.migrate(*dest, db.id(), records.clone(), *level, *sync)
                });
                db.migration_sent(&command, source.as_ref());
                sent.map(|_| CommandOutput::None)
            }
            CommandKind::Barrier { db, level } => {
                pending.lock().insert(command.id(), Arc::clone(&command));
                let message = Message::Barrier(BarrierHeader {
                    dbid: db.id(),
                    level: *level,
                    command: command.id(),
                });
                match outbound.request(outbound.rank, &message, None) {
                    // completed by the listener
                    Ok(()) => continue,
                    Err(e) => {
                        pending.lock().remove(&command.id());
                        Err(e)
                    }
                }
            }
            CommandKind::Checkpoint { db, path } => {
                db.sstable().send_files(path).map(CommandOutput::Generation)
            }
            CommandKind::Restart { db, path, sid } => db
                .sstable()
                .recv_files(path, *sid)
                .map(|_| CommandOutput::Generation(*sid)),
            CommandKind::Exit => {
                command.complete(Ok(CommandOutput::None));
                break;
            }
            // redistribution issues barriers through this queue, so it runs on its own thread
            CommandKind::Distribute { .. } => Err(ShardError::Storage(format!(
                "command {} cannot run on the dispatcher",
                command.id()
            ))),
            CommandKind::Flush { .. } | CommandKind::Load { .. } => Err(ShardError::Storage(
                format!("command {} belongs to the compactor", command.id()),
            )),
        };

        if let Err(e) = &result {
            tracing::error!(id = command.id(), error = %e, "command failed");
        }
        command.complete(result);
    }
}
