//! Cross-rank signals
//!
//! A counting wait handle per `(signum, source rank)`. The listener bumps it
//! when a SIGNAL message arrives; `wait` consumes one notification from each
//! requested source.

use std::collections::HashMap;

use parking_lot::{Condvar, Mutex};

#[derive(Default)]
pub struct Signal {
    counts: Mutex<HashMap<(i32, usize), u64>>,
    cond: Condvar,
}

impl Signal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one notification of `signum` from `source`
    pub fn notify_local(&self, signum: i32, source: usize) {
        let mut counts = self.counts.lock();
        *counts.entry((signum, source)).or_insert(0) += 1;
        self.cond.notify_all();
    }

    /// Block until each of `sources` has notified `signum` once
    pub fn wait(&self, signum: i32, sources: &[usize]) {
        let mut counts = self.counts.lock();
        for &source in sources {
            loop {
                match counts.get_mut(&(signum, source)) {
                    Some(count) if *count > 0 => {
                        *count -= 1;
                        break;
                    }
                    _ => self.cond.wait(&mut counts),
                }
            }
        }
    }

    /// Pending notifications of `signum` from `source`
    pub fn pending(&self, signum: i32, source: usize) -> u64 {
        self.counts.lock().get(&(signum, source)).copied().unwrap_or(0)
    }
}
