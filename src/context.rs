//! Context Module
//!
//! Per-rank owner of every worker and every open database.
//!
//! ## Responsibilities
//! - Create the rank's repository directory and start the workers
//! - Open, close, destroy and restart databases (collective operations)
//! - Cross-rank signals
//! - Orderly shutdown, optionally removing the repository
//!
//! ```text
//!   application threads
//!          │  Context::open / Db::put / Db::get ...
//!          ▼
//!   ┌─────────────┐  queue   ┌──────────────┐  frames  ┌──────────────┐
//!   │     Db      ├─────────▶│  Dispatcher  ├─────────▶│ Listener (N) │
//!   └──────┬──────┘          └──────────────┘          └──────────────┘
//!          │ queue
//!          ▼
//!   ┌─────────────┐
//!   │  Compactor  │──▶ {repository}/{rank}/*.idx|.sst|.blm
//!   └─────────────┘
//! ```

use std::fs;
use std::io;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use crate::bloom::Bloom;
use crate::command::{Command, CommandKind};
use crate::compactor::Compactor;
use crate::config::{Config, Level, OpenOptions};
use crate::db::{Db, EventId};
use crate::error::Result;
use crate::network::{Dispatcher, Listener, Registry, Transport};
use crate::signal::Signal;
use crate::storage::toc;

/// Services shared by every database of one rank
pub(crate) struct Runtime {
    pub rank: usize,
    pub nranks: usize,
    pub config: Config,
    pub transport: Arc<dyn Transport>,
    pub dispatcher: Dispatcher,
    pub compactor: Compactor,
    pub signal: Arc<Signal>,
    pub bloom: Option<Bloom>,
    next_command: AtomicU64,
}

impl Runtime {
    pub fn next_command_id(&self) -> u64 {
        self.next_command.fetch_add(1, Ordering::Relaxed)
    }

    /// Storage group of this rank
    pub fn group(&self) -> i32 {
        self.config.group_of(self.rank) as i32
    }
}

/// One rank's handle on the store
pub struct Context {
    rt: Arc<Runtime>,
    registry: Arc<Registry>,
    listener: Listener,
    next_db: AtomicU64,
    closed: AtomicBool,
}

impl Context {
    /// Start this rank's workers over `transport`
    pub fn start(config: Config, transport: Arc<dyn Transport>) -> Result<Self> {
        config.validate()?;
        let rank = transport.rank();
        let nranks = transport.size();

        // Step 1: Every rank writes its generations under {repository}/{rank}
        fs::create_dir_all(config.repository.join(rank.to_string()))?;

        // Step 2: Workers
        let dispatcher = Dispatcher::start(Arc::clone(&transport), config.queue_capacity)?;
        let compactor = Compactor::start(rank, config.compactor_queue_capacity)?;
        let signal = Arc::new(Signal::new());
        let registry: Arc<Registry> = Arc::default();
        let listener = Listener::start(
            Arc::clone(&transport),
            Arc::clone(&registry),
            dispatcher.pending(),
            Arc::clone(&signal),
        )?;

        let bloom = config.bloom.then(|| Bloom::new(config.bloom_bits));
        tracing::info!(
            rank,
            nranks,
            repository = %config.repository.display(),
            consistency = ?config.consistency,
            "context started"
        );

        Ok(Self {
            rt: Arc::new(Runtime {
                rank,
                nranks,
                config,
                transport,
                dispatcher,
                compactor,
                signal,
                bloom,
                next_command: AtomicU64::new(1),
            }),
            registry,
            listener,
            next_db: AtomicU64::new(1),
            closed: AtomicBool::new(false),
        })
    }

    pub fn rank(&self) -> usize {
        self.rt.rank
    }

    pub fn size(&self) -> usize {
        self.rt.nranks
    }

    pub fn config(&self) -> &Config {
        &self.rt.config
    }

    // =========================================================================
    // Databases
    // =========================================================================

    /// Open a database on every rank
    ///
    /// Collective: every rank must open the same databases in the same order
    /// so that database ids agree.
    pub fn open(&self, name: &str, options: OpenOptions) -> Result<Arc<Db>> {
        let id = self.next_db.fetch_add(1, Ordering::SeqCst);
        let db = Db::new(id, name, Arc::clone(&self.rt), options);
        self.registry.write().insert(id, Arc::clone(&db));
        // no rank may send requests for `id` before its owner registered it
        self.rt.transport.barrier()?;

        tracing::info!(rank = self.rt.rank, db = id, name, "database opened");
        Ok(db)
    }

    /// Settle pending writes and unregister a database (collective)
    pub fn close(&self, db: &Arc<Db>) -> Result<()> {
        let level = if self.rt.config.destroy_repository {
            Level::MemTable
        } else {
            Level::SsTable
        };
        db.barrier(level)?;
        db.wait_all()?;
        self.registry.write().remove(&db.id());

        tracing::info!(rank = self.rt.rank, db = db.id(), name = db.name(), "database closed");
        Ok(())
    }

    /// Close a database and remove its local generation files (collective)
    pub fn destroy(&self, db: &Arc<Db>) -> Result<()> {
        db.barrier(Level::MemTable)?;
        db.wait_all()?;
        self.registry.write().remove(&db.id());
        db.sstable().destroy()?;
        self.rt.transport.barrier()?;

        tracing::info!(rank = self.rt.rank, db = db.id(), name = db.name(), "database destroyed");
        Ok(())
    }

    /// Reopen a checkpointed database from `path` (collective)
    ///
    /// Ranks import their own generations when the rank count matches the
    /// checkpoint; otherwise every record is redistributed through the
    /// normal put path. With `asynchronous`, the returned event must be
    /// waited on before the data is guaranteed visible.
    pub fn restart(
        &self,
        path: impl AsRef<Path>,
        name: &str,
        options: OpenOptions,
        asynchronous: bool,
    ) -> Result<(Arc<Db>, Option<EventId>)> {
        let path = path.as_ref();
        let sids = toc::read_toc(path, name)?;
        let db = self.open(name, options)?;

        let redistribute = sids.len() != self.rt.nranks || self.rt.config.force_redistribute;
        tracing::info!(
            rank = self.rt.rank,
            name,
            checkpoint_ranks = sids.len(),
            redistribute,
            asynchronous,
            "restarting"
        );

        if redistribute {
            if asynchronous {
                let event = db.distribute_in_background(path, sids)?;
                return Ok((db, Some(event)));
            }
            let replayed = db.distribute_files(path, &sids);
            db.barrier(Level::MemTable)?;
            replayed?;
            return Ok((db, None));
        }

        let sid = sids[self.rt.rank];
        if asynchronous {
            let command = Command::new(
                self.rt.next_command_id(),
                CommandKind::Restart {
                    db: Arc::clone(&db),
                    path: path.to_path_buf(),
                    sid,
                },
            );
            self.rt.dispatcher.enqueue(Arc::clone(&command));
            return Ok((Arc::clone(&db), Some(db.track(command))));
        }

        db.sstable().recv_files(path, sid)?;
        db.barrier(Level::MemTable)?;
        Ok((db, None))
    }

    /// Database by id, if open on this rank
    pub fn database(&self, id: u64) -> Option<Arc<Db>> {
        self.registry.read().get(&id).cloned()
    }

    // =========================================================================
    // Signals
    // =========================================================================

    /// Send `signum` to each rank in `targets`
    pub fn signal_notify(&self, signum: i32, targets: &[usize]) -> Result<()> {
        for &dest in targets {
            self.rt.dispatcher.signal(dest, signum)?;
        }
        Ok(())
    }

    /// Block until every rank in `sources` has sent `signum`
    pub fn signal_wait(&self, signum: i32, sources: &[usize]) {
        self.rt.signal.wait(signum, sources);
    }

    // =========================================================================
    // Shutdown
    // =========================================================================

    /// Close every database, stop the workers and clean up (collective)
    pub fn shutdown(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let mut dbs: Vec<Arc<Db>> = self.registry.read().values().cloned().collect();
        dbs.sort_by_key(|db| db.id());
        for db in &dbs {
            self.close(db)?;
        }

        // peers may still be talking to our listener until everyone got here
        self.rt.transport.barrier()?;
        self.stop_workers();

        if self.rt.config.destroy_repository {
            let dir = self.rt.config.repository.join(self.rt.rank.to_string());
            match fs::remove_dir_all(&dir) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
            self.rt.transport.barrier()?;
            if self.rt.rank == 0 {
                // fails when the repository holds anything but rank directories
                let _ = fs::remove_dir(&self.rt.config.repository);
            }
        }

        tracing::info!(rank = self.rt.rank, "context stopped");
        Ok(())
    }

    fn stop_workers(&self) {
        if let Err(e) = self.rt.dispatcher.exit_listener() {
            tracing::error!(rank = self.rt.rank, error = %e, "failed to stop listener");
        } else {
            self.listener.join();
        }
        self.rt.dispatcher.shutdown(self.rt.next_command_id());
        self.rt.compactor.shutdown(self.rt.next_command_id());
    }
}

impl Drop for Context {
    fn drop(&mut self) {
        // without a collective shutdown, only this rank's workers are stopped
        if !self.closed.swap(true, Ordering::SeqCst) {
            tracing::warn!(rank = self.rt.rank, "context dropped without shutdown");
            self.stop_workers();
        }
    }
}
