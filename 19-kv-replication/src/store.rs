//! In-memory key-value map owned by a single coordinator.

use std::collections::BTreeMap;

/// Key-value store mutated only by the coordinator task that owns it.
///
/// No lock is needed: the coordinator processes one event at a time and
/// hands out clones (see [`KvStore::snapshot`]) rather than references.
/// `BTreeMap` keeps iteration order deterministic, which makes catch-up
/// replication and status output stable.
#[derive(Debug, Default, Clone)]
pub struct KvStore {
    data: BTreeMap<String, String>,
}

impl KvStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: String, value: String) {
        self.data.insert(key, value);
    }

    pub fn remove(&mut self, key: &str) {
        self.data.remove(key);
    }

    /// Sets or deletes `key` depending on whether a value is present.
    pub fn apply(&mut self, key: &str, value: Option<&str>) {
        match value {
            Some(value) => self.insert(key.to_string(), value.to_string()),
            None => self.remove(key),
        }
    }

    pub fn get(&self, key: &str) -> Option<String> {
        self.data.get(key).cloned()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &String)> {
        self.data.iter()
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn snapshot(&self) -> BTreeMap<String, String> {
        self.data.clone()
    }
}
