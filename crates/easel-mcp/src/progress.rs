//! Latest progress per command, as served by the `get_progress` tool.
//!
//! Entries age on the receiver's clock. A command whose last update was
//! terminal is kept for a retention window and then dropped; the table is
//! also capped, evicting the entry seen longest ago.

use easel_core::ProgressUpdate;
use std::collections::HashMap;
use std::time::Duration;
use tokio::time::Instant;

/// How long a finished command's last update stays readable.
pub const DEFAULT_RETENTION: Duration = Duration::from_secs(300);

/// Most commands tracked at once.
pub const DEFAULT_CAPACITY: usize = 1024;

#[derive(Debug)]
struct Entry {
    update: ProgressUpdate,
    seen: Instant,
}

#[derive(Debug)]
pub struct ProgressLog {
    entries: HashMap<String, Entry>,
    retention: Duration,
    capacity: usize,
}

impl Default for ProgressLog {
    fn default() -> Self {
        Self::new(DEFAULT_RETENTION, DEFAULT_CAPACITY)
    }
}

impl ProgressLog {
    pub fn new(retention: Duration, capacity: usize) -> Self {
        Self {
            entries: HashMap::new(),
            retention,
            capacity: capacity.max(1),
        }
    }

    /// Store `update` as the latest for its command.
    pub fn record(&mut self, update: ProgressUpdate) {
        let now = Instant::now();
        self.prune(now);

        if !self.entries.contains_key(&update.command_id) && self.entries.len() >= self.capacity {
            let oldest = self
                .entries
                .iter()
                .min_by_key(|(_, entry)| entry.seen)
                .map(|(id, _)| id.clone());
            if let Some(id) = oldest {
                tracing::debug!(command_id = %id, "Progress table full, evicting oldest entry");
                self.entries.remove(&id);
            }
        }

        self.entries.insert(
            update.command_id.clone(),
            Entry { update, seen: now },
        );
    }

    /// Drop finished commands older than the retention window.
    pub fn prune(&mut self, now: Instant) -> usize {
        let before = self.entries.len();
        let retention = self.retention;
        self.entries.retain(|_, entry| {
            !entry.update.status.is_terminal() || now.duration_since(entry.seen) < retention
        });
        before - self.entries.len()
    }

    pub fn get(&self, command_id: &str) -> Option<&ProgressUpdate> {
        self.entries.get(command_id).map(|entry| &entry.update)
    }

    /// Every tracked update, oldest first by sender timestamp.
    pub fn all(&self) -> Vec<ProgressUpdate> {
        let mut all: Vec<ProgressUpdate> =
            self.entries.values().map(|entry| entry.update.clone()).collect();
        all.sort_by_key(|u| u.timestamp);
        all
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
