// Deadline queue for the persistence worker
//
// Tasks are keyed by (deadline, sequence) so entries with the same deadline
// run in the order they were scheduled. Cancelling removes every pending
// entry of a task.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

use super::{Task, TaskId};

pub(crate) struct DeadlineQueue {
    entries: BTreeMap<(Instant, u64), Arc<dyn Task>>,
    seq: u64,
}

impl DeadlineQueue {
    pub fn new() -> Self {
        Self {
            entries: BTreeMap::new(),
            seq: 0,
        }
    }

    pub fn push(&mut self, task: Arc<dyn Task>, at: Instant) {
        self.seq += 1;
        self.entries.insert((at, self.seq), task);
    }

    /// Remove all pending entries of `id`, returning how many were removed
    pub fn cancel(&mut self, id: TaskId) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, task| task.id() != id);
        before - self.entries.len()
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.entries.keys().next().map(|(at, _)| *at)
    }

    /// Pop the earliest entry if it is due at `now`
    pub fn pop_due(&mut self, now: Instant) -> Option<Arc<dyn Task>> {
        let key = *self.entries.keys().next()?;
        if key.0 > now {
            return None;
        }
        self.entries.remove(&key)
    }

    /// Remove every pending entry, earliest first
    pub fn drain(&mut self) -> Vec<Arc<dyn Task>> {
        std::mem::take(&mut self.entries).into_values().collect()
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
