//! Database Module
//!
//! One logical table spread over every rank.
//!
//! ## Responsibilities
//! - Route puts, deletes, gets and updates to the key's owner
//! - Manage the local memtable lifecycle (mutable → immutable → generation)
//! - Stage remote writes under relaxed consistency and migrate them in bulk
//! - Fence, barrier, checkpoint, redistribution and local iteration
//!
//! ## Write Path
//! ```text
//!              put(k, v)
//!                  │ owner = hash(k) % nranks
//!        ┌─────────┴──────────┐
//!     local                 remote
//!        │          ┌─────────┴──────────────┐
//!        ▼      sequential               relaxed
//!   local memtable   │            ┌──────────┴───────────┐
//!   (freeze when     ▼        buffered               unbuffered
//!    full → flush)  sync PUT  RemoteBuffer region   remote memtable
//!                             (MIGRATE when full)   (MIGRATE when full)
//! ```
//!
//! ## Read Path (local keys)
//! mutable memtable → immutable chain (newest first) → cache → generations
//! `sid` down to 1. The first definitive answer (value or tombstone) wins.

mod iter;

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::fmt;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread;

use bytes::Bytes;
use parking_lot::{Mutex, RwLock};

use crate::cache::Cache;
use crate::command::{Command, CommandKind, CommandOutput};
use crate::config::{Consistency, Level, OpenOptions, Protection};
use crate::context::Runtime;
use crate::error::{Result, ShardError};
use crate::hasher::Hasher;
use crate::memtable::{Lookup, MemTable, Slice};
use crate::protocol::{GetReply, LookupScope, STATUS_ERROR, STATUS_OK, STATUS_UNCHANGED};
use crate::remote_buffer::{decode_records, encode_record, find_record, record_size, RemoteBuffer};
use crate::storage::SsTable;

pub use iter::LocalIter;

/// Update function: `(key, current value, input, output) -> new value`
///
/// Returning `Some` rewrites the value; `None` leaves it untouched. Anything
/// written to `output` is handed back to the caller.
pub type UpdateFn = Arc<dyn Fn(&[u8], Option<&[u8]>, &[u8], &mut Vec<u8>) -> Option<Vec<u8>> + Send + Sync>;

/// Handle of an asynchronous checkpoint or restart
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EventId(u64);

impl EventId {
    pub fn raw(self) -> u64 {
        self.0
    }
}

/// Opaque handle of the memtable slot a key was read from
///
/// Under update-only protection an update carrying the handle rewrites the
/// slot directly while that memtable is still the mutable one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Position(u64);

impl Position {
    pub const NONE: Position = Position(0);

    pub fn is_none(self) -> bool {
        self.0 == 0
    }

    pub fn raw(self) -> u64 {
        self.0
    }
}

/// Result of [`Db::update`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdateOutcome {
    /// Whether the function rewrote the value
    pub rewritten: bool,
    /// Bytes the function wrote to its output
    pub output: Vec<u8>,
}

/// A database handle on one rank
pub struct Db {
    this: Weak<Db>,
    id: u64,
    name: String,
    rt: Arc<Runtime>,
    hasher: Hasher,

    consistency: RwLock<Consistency>,
    protection: RwLock<Protection>,
    /// Stage small remote writes in the write-combining buffer
    buffered: bool,
    next_table: AtomicU64,

    // -------------------------------------------------------------------------
    // Local shard
    // -------------------------------------------------------------------------
    local: Mutex<Arc<MemTable>>,
    /// Frozen local tables awaiting flush, newest first
    immutables: Mutex<VecDeque<Arc<MemTable>>>,
    local_cache: Cache,
    sstable: SsTable,

    // -------------------------------------------------------------------------
    // Remote staging (relaxed consistency)
    // -------------------------------------------------------------------------
    remote: Mutex<Arc<MemTable>>,
    /// Frozen remote tables still being migrated, oldest first
    remote_immutables: Mutex<Vec<Arc<MemTable>>>,
    /// Migrations queued but not yet sent, oldest first
    in_flight: Mutex<Vec<Arc<Command>>>,
    remote_buffer: RemoteBuffer,
    remote_cache: Cache,

    // -------------------------------------------------------------------------
    // Updates and events
    // -------------------------------------------------------------------------
    update_fns: RwLock<HashMap<i32, UpdateFn>>,
    /// Serializes updates against each other and against local puts
    update_lock: Mutex<()>,
    events: Mutex<HashMap<u64, Arc<Command>>>,

    // -------------------------------------------------------------------------
    // Diagnostics
    // -------------------------------------------------------------------------
    freezes: AtomicU64,
    migrations: AtomicU64,
}

impl Db {
    pub(crate) fn new(id: u64, name: &str, rt: Arc<Runtime>, options: OpenOptions) -> Arc<Self> {
        let config = &rt.config;
        let consistency = options.consistency.unwrap_or(config.consistency);
        let buffered = options.value_len > 0 && options.value_len <= config.remote_buffer_entry_max;

        tracing::debug!(
            db = id,
            name,
            ?consistency,
            protection = ?options.protection,
            buffered,
            "opening database"
        );

        let hasher = Hasher::new(rt.nranks, options.partition);
        let local_cache = Cache::new(config.cache_size, config.local_cache);
        let remote_cache = Cache::new(config.cache_size, config.remote_cache);
        let remote_buffer = RemoteBuffer::new(rt.nranks, config.remote_buffer_size);
        let sstable = SsTable::new(&config.repository, name, rt.rank, config.search_mode, rt.bloom);

        Arc::new_cyclic(|this| Self {
            this: this.clone(),
            id,
            name: name.to_string(),
            hasher,
            consistency: RwLock::new(consistency),
            protection: RwLock::new(options.protection),
            buffered,
            next_table: AtomicU64::new(3),
            local: Mutex::new(Arc::new(MemTable::new(1))),
            immutables: Mutex::new(VecDeque::new()),
            local_cache,
            sstable,
            remote: Mutex::new(Arc::new(MemTable::new(2))),
            remote_immutables: Mutex::new(Vec::new()),
            in_flight: Mutex::new(Vec::new()),
            remote_buffer,
            remote_cache,
            update_fns: RwLock::new(HashMap::new()),
            update_lock: Mutex::new(()),
            events: Mutex::new(HashMap::new()),
            freezes: AtomicU64::new(0),
            migrations: AtomicU64::new(0),
            rt,
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn consistency(&self) -> Consistency {
        *self.consistency.read()
    }

    pub fn protection(&self) -> Protection {
        *self.protection.read()
    }

    /// Owner rank of `key`
    pub fn owner(&self, key: &[u8]) -> usize {
        self.hasher.key_rank(key)
    }

    pub fn sstable(&self) -> &SsTable {
        &self.sstable
    }

    pub(crate) fn runtime(&self) -> &Runtime {
        &self.rt
    }

    fn arc(&self) -> Result<Arc<Db>> {
        self.this.upgrade().ok_or(ShardError::Shutdown)
    }

    fn new_table(&self) -> Arc<MemTable> {
        Arc::new(MemTable::new(self.next_table.fetch_add(1, Ordering::Relaxed)))
    }

    fn command(&self, kind: CommandKind) -> Arc<Command> {
        Command::new(self.rt.next_command_id(), kind)
    }

    // =========================================================================
    // Put / Delete
    // =========================================================================

    pub fn put(&self, key: &[u8], value: &[u8]) -> Result<()> {
        self.check_write("put")?;
        self.route_put(key, value, false)
    }

    /// Write a tombstone for `key`
    pub fn delete(&self, key: &[u8]) -> Result<()> {
        self.check_write("delete")?;
        self.route_put(key, &[], true)
    }

    fn check_write(&self, op: &'static str) -> Result<()> {
        let protection = self.protection();
        if protection.allows_write() {
            Ok(())
        } else {
            Err(ShardError::ProtectionViolation { op, protection })
        }
    }

    fn route_put(&self, key: &[u8], value: &[u8], tombstone: bool) -> Result<()> {
        let owner = self.hasher.key_rank(key);
        if owner == self.rt.rank {
            self.put_local(key.to_vec(), value.to_vec(), tombstone);
            return Ok(());
        }

        if self.protection().invalidates_on_write() {
            self.remote_cache.invalidate(key);
        }
        match self.consistency() {
            Consistency::Sequential => {
                self.rt.dispatcher.execute_put(owner, self.id, key, value, tombstone, true)
            }
            Consistency::Relaxed if self.buffered => self.put_buffered(owner, key, value, tombstone),
            Consistency::Relaxed => self.put_remote_table(owner, key, value, tombstone),
        }
    }

    /// Apply a write to this rank's shard
    pub(crate) fn put_local(&self, key: Vec<u8>, value: Vec<u8>, tombstone: bool) {
        let slice = Slice {
            key,
            value,
            tombstone,
            rank: self.rt.rank,
        };
        let _guard = self.update_lock.lock();
        self.insert_local(slice);
    }

    /// Caller holds `update_lock`
    fn insert_local(&self, slice: Slice) {
        if self.protection().invalidates_on_write() {
            self.local_cache.invalidate(&slice.key);
        }

        let mut slot = self.local.lock();
        let table = &*slot;
        if !table.is_empty()
            && !table.contains(&slice.key)
            && table.size() + slice.size() >= self.rt.config.memtable_size
        {
            let frozen = std::mem::replace(&mut *slot, self.new_table());
            self.freeze(frozen);
        }
        tracing::trace!(db = self.id, key_len = slice.key.len(), tombstone = slice.tombstone, "put local");
        slot.put(slice);
    }

    /// Move a full table onto the immutable chain and queue its flush
    fn freeze(&self, frozen: Arc<MemTable>) {
        self.immutables.lock().push_front(Arc::clone(&frozen));
        self.freezes.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(db = self.id, table = frozen.id(), size = frozen.size(), "memtable frozen");

        match self.arc() {
            Ok(db) => self.rt.compactor.enqueue(self.command(CommandKind::Flush { db, memtable: frozen })),
            Err(e) => tracing::error!(db = self.id, error = %e, "flush not queued"),
        }
    }

    /// Freeze the mutable table and wait until it is persisted
    pub(crate) fn flush_local_sync(&self) -> Result<()> {
        let frozen = {
            let mut slot = self.local.lock();
            let frozen = std::mem::replace(&mut *slot, self.new_table());
            if !frozen.is_empty() {
                self.immutables.lock().push_front(Arc::clone(&frozen));
                self.freezes.fetch_add(1, Ordering::Relaxed);
            }
            frozen
        };

        let command = self.command(CommandKind::Flush {
            db: self.arc()?,
            memtable: frozen,
        });
        self.rt.compactor.enqueue(Arc::clone(&command));
        command.wait_ok()
    }

    pub(crate) fn remove_immutable(&self, table: &Arc<MemTable>) {
        self.immutables.lock().retain(|t| !Arc::ptr_eq(t, table));
    }

    /// Forget a migration once the dispatcher has sent it
    pub(crate) fn migration_sent(&self, command: &Arc<Command>, source: Option<&Arc<MemTable>>) {
        self.in_flight.lock().retain(|c| !Arc::ptr_eq(c, command));
        if let Some(table) = source {
            self.remote_immutables.lock().retain(|t| !Arc::ptr_eq(t, table));
        }
    }

    // =========================================================================
    // Remote staging
    // =========================================================================

    fn put_buffered(&self, owner: usize, key: &[u8], value: &[u8], tombstone: bool) -> Result<()> {
        let buffer = &self.remote_buffer;
        if value.len() > self.rt.config.remote_buffer_entry_max
            || record_size(key.len(), value.len()) > buffer.unit()
        {
            // ship what is pending first so the owner sees writes in order
            let pending = buffer.take(owner);
            if !pending.is_empty() {
                self.migrate(vec![(owner, pending)], None, Level::MemTable, true)?;
            }
            return self.rt.dispatcher.execute_put(owner, self.id, key, value, tombstone, true);
        }

        while !buffer.try_put(owner, key, value, tombstone) {
            let pending = buffer.take(owner);
            if !pending.is_empty() {
                self.migrate(vec![(owner, pending)], None, Level::MemTable, false)?;
            }
        }
        Ok(())
    }

    fn put_remote_table(&self, owner: usize, key: &[u8], value: &[u8], tombstone: bool) -> Result<()> {
        let size = self.remote.lock().put(Slice {
            key: key.to_vec(),
            value: value.to_vec(),
            tombstone,
            rank: owner,
        });
        if size >= self.rt.config.memtable_size {
            if let Some((batches, frozen)) = self.freeze_remote() {
                self.migrate(batches, Some(frozen), Level::MemTable, false)?;
            }
        }
        Ok(())
    }

    /// Swap out a non-empty remote table and cut its records per owner
    fn freeze_remote(&self) -> Option<(Vec<(usize, Vec<u8>)>, Arc<MemTable>)> {
        let frozen = {
            let mut slot = self.remote.lock();
            if slot.is_empty() {
                return None;
            }
            std::mem::replace(&mut *slot, self.new_table())
        };
        self.remote_immutables.lock().push(Arc::clone(&frozen));

        let mut batches: BTreeMap<usize, Vec<u8>> = BTreeMap::new();
        for slice in frozen.snapshot() {
            encode_record(batches.entry(slice.rank).or_default(), &slice.key, &slice.value, slice.tombstone);
        }
        Some((batches.into_iter().collect(), frozen))
    }

    fn migrate(
        &self,
        batches: Vec<(usize, Vec<u8>)>,
        source: Option<Arc<MemTable>>,
        level: Level,
        sync: bool,
    ) -> Result<()> {
        self.migrations.fetch_add(1, Ordering::Relaxed);
        let staged = batches.iter().any(|(_, records)| !records.is_empty());
        let command = self.command(CommandKind::Migrate {
            db: self.arc()?,
            batches: batches
                .into_iter()
                .map(|(dest, records)| (dest, Bytes::from(records)))
                .collect(),
            source,
            level,
            sync,
        });
        if staged {
            self.in_flight.lock().push(Arc::clone(&command));
        }
        self.rt.dispatcher.enqueue(Arc::clone(&command));
        if sync {
            command.wait_ok()?;
        }
        Ok(())
    }

    // =========================================================================
    // Get
    // =========================================================================

    pub fn get(&self, key: &[u8]) -> Result<Lookup> {
        self.get_pos(key).map(|(result, _)| result)
    }

    /// Look up `key` and return the position handle of its slot
    pub fn get_pos(&self, key: &[u8]) -> Result<(Lookup, Position)> {
        let owner = self.hasher.key_rank(key);
        if owner == self.rt.rank {
            Ok(self.get_local(key))
        } else {
            self.get_remote(owner, key)
        }
    }

    fn get_local(&self, key: &[u8]) -> (Lookup, Position) {
        if let Some(found) = self.get_memtables(key) {
            return found;
        }
        if let Some(cached) = self.local_cache.get(key) {
            return (cached, Position::NONE);
        }
        let result = self.sstable.get(key);
        self.local_cache.put(key, result.clone());
        (result, Position::NONE)
    }

    fn get_memtables(&self, key: &[u8]) -> Option<(Lookup, Position)> {
        let table = Arc::clone(&*self.local.lock());
        let result = table.get(key);
        if result.is_definitive() {
            return Some((result, Position(table.id())));
        }

        let immutables = self.immutables.lock();
        immutables
            .iter()
            .map(|table| table.get(key))
            .find(Lookup::is_definitive)
            .map(|result| (result, Position::NONE))
    }

    fn get_remote(&self, owner: usize, key: &[u8]) -> Result<(Lookup, Position)> {
        if self.consistency() == Consistency::Relaxed {
            if let Some(staged) = self.get_staged(owner, key) {
                return Ok((staged, Position::NONE));
            }
        }

        let cacheable = self.protection() == Protection::ReadOnly;
        if cacheable {
            if let Some(cached) = self.remote_cache.get(key) {
                return Ok((cached, Position::NONE));
            }
        }

        let reply = self
            .rt
            .dispatcher
            .execute_get(owner, self.id, key, 0, self.rt.group())?;
        let mut result = reply.result;
        if !result.is_definitive() && reply.scope == LookupScope::MemTable {
            // same storage group: read the owner's generations directly
            result = self.sstable.get_from(owner, reply.sid, key);
        }

        if cacheable {
            self.remote_cache.put(key, result.clone());
        }
        Ok((result, Position(reply.position)))
    }

    /// Newest not-yet-migrated write to `key`
    ///
    /// Searched newest first: the open buffer region, the mutable remote
    /// table, queued migrations, then frozen remote tables.
    fn get_staged(&self, owner: usize, key: &[u8]) -> Option<Lookup> {
        if let Some(slice) = self.remote_buffer.find(owner, key) {
            return Some(slice_lookup(slice));
        }
        let result = self.remote.lock().get(key);
        if result.is_definitive() {
            return Some(result);
        }
        let queued = self.in_flight.lock().iter().rev().find_map(|command| match command.kind() {
            CommandKind::Migrate { batches, .. } => batches
                .iter()
                .filter(|(dest, _)| *dest == owner)
                .find_map(|(_, records)| find_record(records, owner, key)),
            _ => None,
        });
        if let Some(slice) = queued {
            return Some(slice_lookup(slice));
        }
        let frozen = self.remote_immutables.lock();
        frozen.iter().rev().map(|table| table.get(key)).find(Lookup::is_definitive)
    }

    // =========================================================================
    // Fence / Barrier / Modes
    // =========================================================================

    /// Push every staged remote write to its owner and wait for the acks
    ///
    /// A no-op under sequential consistency. Every peer receives a
    /// synchronous MIGRATE, possibly empty, which also settles earlier
    /// asynchronous migrations to it.
    pub fn fence(&self, level: Level) -> Result<()> {
        if self.consistency() == Consistency::Sequential {
            return Ok(());
        }

        let mut batches: BTreeMap<usize, Vec<u8>> = self.remote_buffer.take_all().into_iter().collect();
        let frozen = match self.freeze_remote() {
            Some((table_batches, frozen)) => {
                for (rank, records) in table_batches {
                    batches.entry(rank).or_default().extend_from_slice(&records);
                }
                Some(frozen)
            }
            None => None,
        };
        for rank in (0..self.rt.nranks).filter(|&r| r != self.rt.rank) {
            batches.entry(rank).or_default();
        }

        tracing::debug!(db = self.id, ?level, destinations = batches.len(), "fence");
        self.migrate(batches.into_iter().collect(), frozen, level, true)
    }

    /// Fence plus collective rendezvous (collective)
    ///
    /// At `Level::SsTable` every rank also flushes its mutable memtable once
    /// all writes issued before the barrier have arrived.
    pub fn barrier(&self, level: Level) -> Result<()> {
        tracing::debug!(db = self.id, ?level, consistency = ?self.consistency(), "barrier");
        let transport = &self.rt.transport;
        match self.consistency() {
            Consistency::Sequential => {
                transport.barrier()?;
                if level.includes_sstable() {
                    self.flush_local_sync()?;
                    transport.barrier()?;
                }
            }
            Consistency::Relaxed => {
                self.fence(Level::MemTable)?;
                transport.barrier()?;
                let command = self.command(CommandKind::Barrier { db: self.arc()?, level });
                self.rt.dispatcher.enqueue(Arc::clone(&command));
                command.wait_ok()?;
                transport.barrier()?;
            }
        }
        Ok(())
    }

    /// Switch consistency mode (collective)
    pub fn set_consistency(&self, consistency: Consistency) -> Result<()> {
        self.barrier(Level::MemTable)?;
        *self.consistency.write() = consistency;
        tracing::debug!(db = self.id, ?consistency, "consistency changed");
        Ok(())
    }

    /// Switch protection mode (collective)
    pub fn set_protection(&self, protection: Protection) -> Result<()> {
        self.barrier(Level::MemTable)?;
        let previous = std::mem::replace(&mut *self.protection.write(), protection);
        if previous == protection {
            return Ok(());
        }

        if previous == Protection::WriteOnly {
            self.local_cache.invalidate_all();
        }
        if protection == Protection::ReadOnly {
            self.remote_cache.invalidate_all();
        }
        if !protection.allows_hash_index() {
            self.local.lock().clear_bucket();
        }
        tracing::debug!(db = self.id, ?previous, ?protection, "protection changed");
        Ok(())
    }

    /// Build the bucket index over the mutable memtable
    pub fn hash(&self) -> Result<()> {
        let protection = self.protection();
        if !protection.allows_hash_index() {
            return Err(ShardError::InvalidMode(format!(
                "hash index needs read-only or update-only protection, not {:?}",
                protection
            )));
        }
        let table = self.local.lock();
        if !table.is_empty() {
            table.hash();
        }
        Ok(())
    }

    // =========================================================================
    // Checkpoint / Redistribution
    // =========================================================================

    /// Persist every rank's data and export it to `path` (collective)
    ///
    /// With `asynchronous`, the file export runs on the dispatcher and the
    /// returned event must be waited on.
    pub fn checkpoint(&self, path: impl AsRef<Path>, asynchronous: bool) -> Result<Option<EventId>> {
        let path = path.as_ref();

        // Step 1: Everything written so far reaches a generation file
        self.barrier(Level::SsTable)?;
        self.flush_local_sync()?;

        // Step 2: Table of contents
        let sid = self.sstable.sid();
        let sids = self.rt.transport.gather_u64(sid, 0)?;
        std::fs::create_dir_all(path)?;
        if let Some(sids) = sids {
            crate::storage::toc::write_toc(path, &self.name, &sids)?;
        }

        tracing::info!(db = self.id, rank = self.rt.rank, sid, path = %path.display(), asynchronous, "checkpoint");

        // Step 3: Export
        if asynchronous {
            let command = self.command(CommandKind::Checkpoint {
                db: self.arc()?,
                path: path.to_path_buf(),
            });
            self.rt.dispatcher.enqueue(Arc::clone(&command));
            return Ok(Some(self.track(command)));
        }
        self.sstable.send_files(path)?;
        self.rt.transport.barrier()?;
        Ok(None)
    }

    /// Replay a checkpoint taken with a different rank count (collective)
    ///
    /// Each `(old rank, generation)` pair gets a sequence number, counting
    /// through old ranks in order and generations newest first; this rank
    /// replays the pairs whose number is congruent to its rank. Replay runs
    /// one generation number at a time, oldest first, with a barrier between
    /// rounds so that newer records overwrite older ones at their new owner.
    pub(crate) fn distribute_files(&self, path: &Path, sids: &[u64]) -> Result<()> {
        let nranks = self.rt.nranks;
        let mut mine: BTreeMap<u64, Vec<usize>> = BTreeMap::new();
        let mut sequence = 0usize;
        for (old_rank, &sid) in sids.iter().enumerate() {
            for generation in (1..=sid).rev() {
                if sequence % nranks == self.rt.rank {
                    mine.entry(generation).or_default().push(old_rank);
                }
                sequence += 1;
            }
        }

        let rounds = sids.iter().copied().max().unwrap_or(0);
        let mut replayed = 0usize;
        // an unreadable generation fails the replay, but this rank keeps
        // joining every round's barrier so its peers finish theirs
        let mut failure = None;
        for generation in 1..=rounds {
            for &old_rank in mine.get(&generation).into_iter().flatten() {
                match SsTable::read_exported(path, &self.name, old_rank, generation) {
                    Ok(reader) => {
                        for record in reader.iter() {
                            self.route_put(record.key, record.value, record.tombstone)?;
                        }
                        replayed += reader.len();
                    }
                    Err(e) => {
                        tracing::error!(db = self.id, old_rank, generation, error = %e, "exported generation unreadable");
                        failure.get_or_insert(e);
                    }
                }
            }
            self.barrier(Level::MemTable)?;
        }
        if let Some(e) = failure {
            return Err(e);
        }

        tracing::info!(
            db = self.id,
            rank = self.rt.rank,
            old_ranks = sids.len(),
            generations = mine.values().map(Vec::len).sum::<usize>(),
            records = replayed,
            "records redistributed"
        );
        Ok(())
    }

    /// Run [`Db::distribute_files`] on a dedicated thread (collective)
    ///
    /// The replay issues barriers of its own, so no other collective
    /// operation may be started on this rank until the event is waited on.
    pub(crate) fn distribute_in_background(&self, path: &Path, sids: Vec<u64>) -> Result<EventId> {
        let command = self.command(CommandKind::Distribute {
            db: self.arc()?,
            path: path.to_path_buf(),
            sids,
        });

        let worker = Arc::clone(&command);
        thread::Builder::new()
            .name(format!("shardkv-distribute-{}", self.rt.rank))
            .spawn(move || {
                worker.start();
                let result = match worker.kind() {
                    CommandKind::Distribute { db, path, sids } => db.distribute_files(path, sids),
                    _ => Ok(()),
                };
                if let Err(e) = &result {
                    tracing::error!(id = worker.id(), error = %e, "redistribution failed");
                }
                worker.complete(result.map(|_| CommandOutput::None));
            })?;
        Ok(self.track(command))
    }

    // =========================================================================
    // Events
    // =========================================================================

    pub(crate) fn track(&self, command: Arc<Command>) -> EventId {
        let id = command.id();
        self.events.lock().insert(id, command);
        EventId(id)
    }

    /// Wait for an asynchronous checkpoint or restart (collective)
    pub fn wait(&self, event: EventId) -> Result<()> {
        let command = self
            .events
            .lock()
            .remove(&event.0)
            .ok_or(ShardError::UnknownEvent(event.0))?;
        let finished = command.wait_ok();

        match command.kind() {
            // peers whose replay succeeded are waiting here too
            CommandKind::Distribute { .. } => {
                self.barrier(Level::MemTable)?;
                finished
            }
            CommandKind::Checkpoint { .. } | CommandKind::Restart { .. } => {
                finished?;
                self.rt.transport.barrier()
            }
            _ => finished,
        }
    }

    /// Wait for every outstanding event, oldest first
    pub fn wait_all(&self) -> Result<()> {
        let mut ids: Vec<u64> = self.events.lock().keys().copied().collect();
        ids.sort_unstable();
        for id in ids {
            self.wait(EventId(id))?;
        }
        Ok(())
    }

    // =========================================================================
    // Updates
    // =========================================================================

    /// Register `f` under `fnid` on this rank (collective)
    pub fn register_update<F>(&self, fnid: i32, f: F) -> Result<()>
    where
        F: Fn(&[u8], Option<&[u8]>, &[u8], &mut Vec<u8>) -> Option<Vec<u8>> + Send + Sync + 'static,
    {
        let registered = {
            let mut fns = self.update_fns.write();
            if fns.contains_key(&fnid) {
                Err(ShardError::DuplicateUpdateFn(fnid))
            } else {
                fns.insert(fnid, Arc::new(f));
                Ok(())
            }
        };
        // every rank reaches the barrier, even the one that rejects
        self.rt.transport.barrier()?;
        registered
    }

    /// Atomically read-modify-write `key` on its owner
    pub fn update(&self, key: &[u8], position: Position, fnid: i32, input: &[u8]) -> Result<UpdateOutcome> {
        if !self.update_fns.read().contains_key(&fnid) {
            return Err(ShardError::UnknownUpdateFn(fnid));
        }
        self.check_write("update")?;

        let owner = self.hasher.key_rank(key);
        if owner == self.rt.rank {
            return self.update_local(key, position, fnid, input);
        }

        if self.protection().invalidates_on_write() {
            self.remote_cache.invalidate(key);
        }
        // staged writes to the key must land before the owner reads it
        self.fence(Level::MemTable)?;
        let (status, output) =
            self.rt
                .dispatcher
                .execute_update(owner, self.id, key, position.0, fnid, input, 0)?;
        match status {
            STATUS_OK => Ok(UpdateOutcome { rewritten: true, output }),
            STATUS_UNCHANGED => Ok(UpdateOutcome { rewritten: false, output }),
            _ => Err(ShardError::Network(format!(
                "update {} on rank {} failed with status {}",
                fnid, owner, status
            ))),
        }
    }

    fn update_local(&self, key: &[u8], position: Position, fnid: i32, input: &[u8]) -> Result<UpdateOutcome> {
        let f = self
            .update_fns
            .read()
            .get(&fnid)
            .cloned()
            .ok_or(ShardError::UnknownUpdateFn(fnid))?;

        let _guard = self.update_lock.lock();
        let slot = self.in_place_slot(key, position);
        let current = match &slot {
            Some(table) => table.get(key),
            None => self.get_local(key).0,
        };

        let mut output = Vec::new();
        let rewritten = match f(key, current.into_value().as_deref(), input, &mut output) {
            Some(value) => {
                let slice = Slice::new(key.to_vec(), value, self.rt.rank);
                match slot {
                    Some(table) => {
                        self.local_cache.invalidate(key);
                        table.put(slice);
                    }
                    None => self.insert_local(slice),
                }
                true
            }
            None => false,
        };

        tracing::trace!(db = self.id, fnid, rewritten, in_place = position.0 != 0, "update");
        Ok(UpdateOutcome { rewritten, output })
    }

    /// Mutable table addressed by `position`, if it still holds `key`
    fn in_place_slot(&self, key: &[u8], position: Position) -> Option<Arc<MemTable>> {
        if position.is_none() || self.protection() != Protection::UpdateOnly {
            return None;
        }
        let table = self.local.lock();
        (table.id() == position.0 && table.contains(key)).then(|| Arc::clone(&*table))
    }

    // =========================================================================
    // Serving remote requests (listener thread)
    // =========================================================================

    pub(crate) fn serve_get(&self, key: &[u8], group: i32) -> GetReply {
        if group == self.rt.group() {
            let (result, position) = self.get_memtables(key).unwrap_or((Lookup::NotFound, Position::NONE));
            return GetReply {
                result,
                scope: LookupScope::MemTable,
                sid: self.sstable.sid(),
                position: position.0,
            };
        }

        let (result, position) = self.get_local(key);
        GetReply {
            result,
            scope: LookupScope::SsTable,
            sid: self.sstable.sid(),
            position: position.0,
        }
    }

    pub(crate) fn serve_migrate(&self, records: &[u8], source: usize, level: Level) -> Result<()> {
        let slices = decode_records(records, self.rt.rank)?;
        tracing::debug!(db = self.id, source, records = slices.len(), ?level, "applying migration");
        {
            let _guard = self.update_lock.lock();
            for slice in slices {
                self.insert_local(slice);
            }
        }
        if level.includes_sstable() {
            self.flush_local_sync()?;
        }
        Ok(())
    }

    pub(crate) fn serve_update(
        &self,
        key: &[u8],
        position: u64,
        fnid: i32,
        input: &[u8],
        output_len: usize,
    ) -> (i32, Vec<u8>) {
        match self.update_local(key, Position(position), fnid, input) {
            Ok(outcome) => {
                let mut output = outcome.output;
                if output_len > 0 {
                    output.truncate(output_len);
                }
                let status = if outcome.rewritten { STATUS_OK } else { STATUS_UNCHANGED };
                (status, output)
            }
            Err(e) => {
                tracing::warn!(db = self.id, fnid, error = %e, "update failed");
                (STATUS_ERROR, Vec::new())
            }
        }
    }

    // =========================================================================
    // Iteration
    // =========================================================================

    /// Iterate this rank's records, newest layer first
    pub fn iter_local(&self) -> Result<LocalIter> {
        let mut tables = VecDeque::new();
        {
            let table = self.local.lock();
            if !table.is_empty() {
                tables.push_back(Arc::new(table.duplicate()));
            }
        }
        tables.extend(self.immutables.lock().iter().cloned());
        Ok(LocalIter::new(self.arc()?, tables, self.sstable.sid()))
    }

    // =========================================================================
    // Diagnostics
    // =========================================================================

    pub fn local_cache(&self) -> &Cache {
        &self.local_cache
    }

    pub fn remote_cache(&self) -> &Cache {
        &self.remote_cache
    }

    /// Id of the mutable local memtable
    pub fn memtable_id(&self) -> u64 {
        self.local.lock().id()
    }

    /// Records in the mutable local memtable
    pub fn memtable_len(&self) -> usize {
        self.local.lock().len()
    }

    /// Frozen local memtables not yet flushed
    pub fn immutable_len(&self) -> usize {
        self.immutables.lock().len()
    }

    /// Local memtables frozen so far
    pub fn freezes(&self) -> u64 {
        self.freezes.load(Ordering::Relaxed)
    }

    /// Migration commands issued so far
    pub fn migrations(&self) -> u64 {
        self.migrations.load(Ordering::Relaxed)
    }

    /// Newest local SSTable generation (0 = none)
    pub fn sstable_generation(&self) -> u64 {
        self.sstable.sid()
    }

    /// Bytes waiting in the write-combining region for `rank`
    pub fn pending_remote_bytes(&self, rank: usize) -> usize {
        self.remote_buffer.size(rank)
    }
}

fn slice_lookup(slice: Slice) -> Lookup {
    if slice.tombstone {
        Lookup::Tombstone
    } else {
        Lookup::Found(slice.value)
    }
}

impl fmt::Debug for Db {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Db")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("rank", &self.rt.rank)
            .field("consistency", &self.consistency())
            .field("protection", &self.protection())
            .field("buffered", &self.buffered)
            .field("sstable", &self.sstable)
            .finish()
    }
}
