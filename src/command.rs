//! Commands
//!
//! A unit of work handed to the dispatcher or compactor worker. The issuer
//! keeps an `Arc<Command>` and either waits on it (synchronous) or drops it
//! (fire-and-forget); the worker completes it exactly once.
//!
//! ## Lifecycle
//! ```text
//! Queued ──(worker picks up)──▶ Running ──(complete)──▶ Complete
//! ```

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::{Condvar, Mutex};

use crate::config::Level;
use crate::db::Db;
use crate::error::{Result, ShardError};
use crate::memtable::MemTable;

/// Command kinds (0x11xx)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum CommandCode {
    Migrate = 0x1104,
    Barrier = 0x1107,
    Checkpoint = 0x1108,
    Restart = 0x1109,
    Distribute = 0x110a,
    Flush = 0x110b,
    Load = 0x110c,
    Exit = 0x11ff,
}

/// Operation payload
pub enum CommandKind {
    /// Ship serialized records to their owners
    Migrate {
        db: Arc<Db>,
        /// (destination rank, serialized records); stays readable until sent
        batches: Vec<(usize, Bytes)>,
        /// Frozen remote memtable the batches were cut from
        source: Option<Arc<MemTable>>,
        level: Level,
        sync: bool,
    },
    /// Rendezvous with this rank's listener
    Barrier { db: Arc<Db>, level: Level },
    /// Export this rank's generations
    Checkpoint { db: Arc<Db>, path: PathBuf },
    /// Import this rank's generations
    Restart { db: Arc<Db>, path: PathBuf, sid: u64 },
    /// Replay a checkpoint taken on `sids.len()` ranks through the put path
    Distribute { db: Arc<Db>, path: PathBuf, sids: Vec<u64> },
    /// Persist a frozen memtable
    Flush { db: Arc<Db>, memtable: Arc<MemTable> },
    /// Replay one generation into a memtable
    Load { db: Arc<Db>, generation: u64 },
    /// Stop the worker
    Exit,
}

impl CommandKind {
    pub fn code(&self) -> CommandCode {
        match self {
            CommandKind::Migrate { .. } => CommandCode::Migrate,
            CommandKind::Barrier { .. } => CommandCode::Barrier,
            CommandKind::Checkpoint { .. } => CommandCode::Checkpoint,
            CommandKind::Restart { .. } => CommandCode::Restart,
            CommandKind::Distribute { .. } => CommandCode::Distribute,
            CommandKind::Flush { .. } => CommandCode::Flush,
            CommandKind::Load { .. } => CommandCode::Load,
            CommandKind::Exit => CommandCode::Exit,
        }
    }
}

/// What a completed command produced
#[derive(Debug)]
pub enum CommandOutput {
    None,
    Generation(u64),
    Table(MemTable),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandState {
    Queued,
    Running,
    Complete,
}

struct Completion {
    state: CommandState,
    result: Option<Result<CommandOutput>>,
}

/// A queued operation with its own completion signal
pub struct Command {
    id: u64,
    kind: CommandKind,
    completion: Mutex<Completion>,
    cond: Condvar,
}

impl Command {
    pub fn new(id: u64, kind: CommandKind) -> Arc<Self> {
        Arc::new(Self {
            id,
            kind,
            completion: Mutex::new(Completion {
                state: CommandState::Queued,
                result: None,
            }),
            cond: Condvar::new(),
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn kind(&self) -> &CommandKind {
        &self.kind
    }

    pub fn state(&self) -> CommandState {
        self.completion.lock().state
    }

    pub fn is_complete(&self) -> bool {
        self.state() == CommandState::Complete
    }

    pub(crate) fn start(&self) {
        let mut completion = self.completion.lock();
        if completion.state == CommandState::Queued {
            completion.state = CommandState::Running;
        }
    }

    /// Record the result and wake every waiter; later calls are ignored
    pub(crate) fn complete(&self, result: Result<CommandOutput>) {
        let mut completion = self.completion.lock();
        if completion.state == CommandState::Complete {
            return;
        }
        completion.state = CommandState::Complete;
        completion.result = Some(result);
        self.cond.notify_all();
    }

    /// Block until complete and take the result
    ///
    /// Only the first waiter receives the output; later waiters get
    /// `CommandOutput::None`.
    pub fn wait(&self) -> Result<CommandOutput> {
        let mut completion = self.completion.lock();
        while completion.state != CommandState::Complete {
            self.cond.wait(&mut completion);
        }
        completion.result.take().unwrap_or(Ok(CommandOutput::None))
    }

    /// Wait and discard the output
    pub fn wait_ok(&self) -> Result<()> {
        self.wait().map(|_| ())
    }

    /// Wait for a `Load` and take its memtable
    pub fn wait_table(&self) -> Result<MemTable> {
        match self.wait()? {
            CommandOutput::Table(table) => Ok(table),
            other => Err(ShardError::Storage(format!(
                "command {} produced {:?} instead of a memtable",
                self.id, other
            ))),
        }
    }
}

impl fmt::Debug for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Command")
            .field("id", &self.id)
            .field("kind", &self.kind.code())
            .field("state", &self.state())
            .finish()
    }
}
