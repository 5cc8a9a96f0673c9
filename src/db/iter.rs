//! Local iteration
//!
//! Walks this rank's records layer by layer, newest first:
//! a private copy of the mutable memtable, the immutable chain, then every
//! SSTable generation from the newest down to 1. Generations are loaded by
//! the compactor one step ahead of the consumer.
//!
//! Every record of every layer is yielded, tombstones included. A key that
//! was rewritten appears once per layer holding it; its first occurrence is
//! the current one.

use std::collections::VecDeque;
use std::sync::Arc;
use std::vec;

use crate::command::{Command, CommandKind};
use crate::error::Result;
use crate::memtable::{MemTable, Slice};

use super::Db;

/// Forward iterator over one rank's local records
pub struct LocalIter {
    db: Arc<Db>,
    current: vec::IntoIter<Slice>,
    tables: VecDeque<Arc<MemTable>>,
    /// Next generation to request (0 = none left)
    next_generation: u64,
    prefetch: Option<Arc<Command>>,
}

impl LocalIter {
    pub(crate) fn new(db: Arc<Db>, tables: VecDeque<Arc<MemTable>>, sid: u64) -> Self {
        let mut iter = Self {
            db,
            current: Vec::new().into_iter(),
            tables,
            next_generation: sid,
            prefetch: None,
        };
        if iter.next_generation > 0 {
            iter.prefetch = Some(iter.load());
        }
        iter
    }

    fn load(&mut self) -> Arc<Command> {
        let generation = self.next_generation;
        self.next_generation -= 1;

        let rt = self.db.runtime();
        let command = Command::new(
            rt.next_command_id(),
            CommandKind::Load {
                db: Arc::clone(&self.db),
                generation,
            },
        );
        rt.compactor.enqueue(Arc::clone(&command));
        command
    }
}

impl Iterator for LocalIter {
    type Item = Result<Slice>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(slice) = self.current.next() {
                return Some(Ok(slice));
            }

            if let Some(table) = self.tables.pop_front() {
                self.current = table.snapshot().into_iter();
                continue;
            }

            let command = match self.prefetch.take() {
                Some(command) => command,
                None if self.next_generation > 0 => self.load(),
                None => return None,
            };
            if self.next_generation > 0 {
                self.prefetch = Some(self.load());
            }

            match command.wait_table() {
                Ok(table) => self.current = table.snapshot().into_iter(),
                Err(e) => {
                    self.next_generation = 0;
                    self.prefetch = None;
                    return Some(Err(e));
                }
            }
        }
    }
}
