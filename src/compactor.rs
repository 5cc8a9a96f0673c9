//! Compactor
//!
//! Background worker that moves data between memtables and SSTable
//! generations.
//!
//! ## Responsibilities
//! - FLUSH: persist a frozen memtable, then drop it from the immutable chain
//! - LOAD: replay one generation into a memtable for iteration
//!
//! Commands run one at a time in queue order, so generations are written in
//! the order their memtables were frozen.

use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam::channel::{self, Receiver, Sender};
use parking_lot::Mutex;

use crate::command::{Command, CommandKind, CommandOutput};
use crate::error::{Result, ShardError};
use crate::network::dispatcher::enqueue;

/// Flush/load worker for one rank
pub struct Compactor {
    rank: usize,
    queue: Sender<Arc<Command>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl Compactor {
    pub fn start(rank: usize, capacity: usize) -> Result<Self> {
        let (queue, receiver) = channel::bounded(capacity.max(1));
        let worker = thread::Builder::new()
            .name(format!("shardkv-compactor-{}", rank))
            .spawn(move || run(receiver))?;
        tracing::debug!(rank, capacity, "compactor started");

        Ok(Self {
            rank,
            queue,
            worker: Mutex::new(Some(worker)),
        })
    }

    /// Queue a command, retrying while the queue is full
    pub fn enqueue(&self, command: Arc<Command>) {
        enqueue(&self.queue, command);
    }

    /// Finish queued work and stop the worker
    pub fn shutdown(&self, id: u64) {
        let handle = self.worker.lock().take();
        if let Some(handle) = handle {
            let exit = Command::new(id, CommandKind::Exit);
            enqueue(&self.queue, Arc::clone(&exit));
            if let Err(e) = exit.wait() {
                tracing::warn!(error = %e, "compactor exit");
            }
            if handle.join().is_err() {
                tracing::error!("compactor worker panicked");
            }
            tracing::debug!(rank = self.rank, "compactor stopped");
        }
    }
}

fn run(receiver: Receiver<Arc<Command>>) {
    for command in receiver.iter() {
        command.start();

        let result = match command.kind() {
            CommandKind::Flush { db, memtable } => {
                let flushed = db.sstable().flush(memtable);
                // keep the table readable if the flush failed
                if flushed.is_ok() {
                    db.remove_immutable(memtable);
                }
                flushed.map(CommandOutput::Generation)
            }
            CommandKind::Load { db, generation } => db.sstable().load(*generation).map(CommandOutput::Table),
            CommandKind::Exit => {
                command.complete(Ok(CommandOutput::None));
                break;
            }
            other => Err(ShardError::Storage(format!(
                "command {:?} is not a compactor command",
                other.code()
            ))),
        };

        if let Err(e) = &result {
            tracing::error!(id = command.id(), error = %e, "compactor command failed");
        }
        command.complete(result);
    }
}
