use std::collections::BTreeMap;

use crate::models::ResponseSnapshot;

/// One cache version: request key → response snapshot.
#[derive(Debug, Clone, Default)]
pub struct Cache {
    entries: BTreeMap<String, ResponseSnapshot>,
}

impl Cache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn match_key(&self, key: &str) -> Option<&ResponseSnapshot> {
        self.entries.get(key)
    }

    /// Store an entry, replacing any prior entry for the key.
    pub fn put(&mut self, key: String, snapshot: ResponseSnapshot) {
        self.entries.insert(key, snapshot);
    }

    /// Store a batch of entries together.
    pub fn put_all(&mut self, entries: impl IntoIterator<Item = (String, ResponseSnapshot)>) {
        self.entries.extend(entries);
    }

    pub fn delete(&mut self, key: &str) -> bool {
        self.entries.remove(key).is_some()
    }

    pub fn keys(&self) -> Vec<&str> {
        self.entries.keys().map(String::as_str).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// All cache versions held for the origin.
#[derive(Debug, Default)]
pub struct CacheStorage {
    caches: BTreeMap<String, Cache>,
}

impl CacheStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a cache, creating it if it doesn't exist.
    pub fn open(&mut self, name: &str) -> &mut Cache {
        self.caches
            .entry(name.to_string())
            .or_default()
    }

    pub fn get(&self, name: &str) -> Option<&Cache> {
        self.caches.get(name)
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut Cache> {
        self.caches.get_mut(name)
    }

    pub fn has(&self, name: &str) -> bool {
        self.caches.contains_key(name)
    }

    pub fn delete(&mut self, name: &str) -> bool {
        self.caches.remove(name).is_some()
    }

    /// Cache names in sorted order.
    pub fn keys(&self) -> Vec<String> {
        self.caches.keys().cloned().collect()
    }
}
