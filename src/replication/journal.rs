//! Pending primary writes awaiting the next gossip flush.

use super::types::GossipEntry;
use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

/// Latest value per key written since the last flush.
#[derive(Debug, Default)]
pub struct UpdateBatch {
    entries: Mutex<HashMap<String, Option<String>>>,
}

impl UpdateBatch {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a write; a later write to the same key replaces the earlier one.
    pub fn record(&self, key: String, value: Option<String>) {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key, value);
    }

    /// Takes everything pending and leaves the batch empty, in one step.
    pub fn take(&self) -> Vec<GossipEntry> {
        let drained = std::mem::take(&mut *self.entries.lock().unwrap_or_else(PoisonError::into_inner));
        let mut entries: Vec<GossipEntry> = drained
            .into_iter()
            .map(|(key, value)| GossipEntry { key, value })
            .collect();
        entries.sort_by(|a, b| a.key.cmp(&b.key));
        entries
    }

    pub fn len(&self) -> usize {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
