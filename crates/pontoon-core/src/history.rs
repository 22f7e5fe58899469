//! Bounded ring of recently sent commands.
//!
//! When the bridge dies we want to know what it was doing. Every produced
//! command is recorded here (cheaply, ids only) and the whole ring is
//! dumped at error level on terminal failure.

use std::collections::VecDeque;

use crate::commands::Command;

const DEFAULT_CAPACITY: usize = 128;

#[derive(Debug)]
pub struct CommandHistory {
    entries: VecDeque<(u32, Command)>,
    capacity: usize,
    total: u64,
}

impl CommandHistory {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            entries: VecDeque::with_capacity(capacity),
            capacity,
            total: 0,
        }
    }

    pub fn record(&mut self, uid: u32, command: Command) {
        if self.entries.len() == self.capacity {
            self.entries.pop_front();
        }
        self.entries.push_back((uid, command));
        self.total += 1;
    }

    /// Total commands ever recorded, including evicted ones.
    pub fn total(&self) -> u64 {
        self.total
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Dump the retained window, oldest first.
    pub fn dump(&self) {
        tracing::error!(
            total = self.total,
            retained = self.entries.len(),
            "recent command history follows"
        );
        for (uid, command) in &self.entries {
            tracing::error!(uid, command = command.name(), "  history entry");
        }
    }
}

impl Default for CommandHistory {
    fn default() -> Self {
        Self::new()
    }
}
