//! Key/value storage behind a node.
//!
//! Persistence and cache eviction live behind this trait; the node only needs
//! point access and range scans over ring positions.

use crate::ring::{KeyRange, hash_position};
use dashmap::DashMap;

pub trait KvStore: Send + Sync {
    fn get(&self, key: &str) -> Option<String>;

    /// Stores `value`, returning the previous value if there was one.
    fn put(&self, key: &str, value: String) -> Option<String>;

    fn remove(&self, key: &str) -> Option<String>;

    /// All pairs whose key hashes into `range`.
    fn scan(&self, range: &KeyRange) -> Vec<(String, String)>;

    /// Deletes every pair whose key hashes into `range`; returns how many went.
    fn remove_range(&self, range: &KeyRange) -> usize;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    data: DashMap<String, String>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KvStore for MemoryStore {
    fn get(&self, key: &str) -> Option<String> {
        self.data.get(key).map(|value| value.clone())
    }

    fn put(&self, key: &str, value: String) -> Option<String> {
        self.data.insert(key.to_string(), value)
    }

    fn remove(&self, key: &str) -> Option<String> {
        self.data.remove(key).map(|(_, value)| value)
    }

    fn scan(&self, range: &KeyRange) -> Vec<(String, String)> {
        let mut entries: Vec<(String, String)> = self
            .data
            .iter()
            .filter(|entry| range.contains(hash_position(entry.key())))
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect();
        entries.sort();
        entries
    }

    fn remove_range(&self, range: &KeyRange) -> usize {
        // Counted per key: peer transfers may insert while this runs.
        let mut removed = 0;
        self.data.retain(|key, _| {
            let stale = range.contains(hash_position(key));
            if stale {
                removed += 1;
            }
            !stale
        });
        removed
    }

    fn len(&self) -> usize {
        self.data.len()
    }
}
