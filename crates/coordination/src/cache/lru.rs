//! Bounded LRU map with per-entry expiry (the local cache tier).

use indexmap::IndexMap;
use tokio::time::Instant;

#[derive(Debug, Clone)]
struct Entry<V> {
    value: V,
    expires_at: Instant,
}

/// Strict LRU: index 0 is least recently used, the last index is most recent.
#[derive(Debug)]
pub struct LruTier<V> {
    entries: IndexMap<String, Entry<V>>,
    capacity: usize,
}

impl<V: Clone> LruTier<V> {
    /// A zero capacity is bumped to one.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            entries: IndexMap::with_capacity(capacity),
            capacity,
        }
    }

    /// Look up a live entry and promote it to most recently used.
    pub fn get(&mut self, key: &str, now: Instant) -> Option<V> {
        let idx = self.entries.get_index_of(key)?;
        if self.entries[idx].expires_at <= now {
            self.entries.shift_remove_index(idx);
            return None;
        }
        let last = self.entries.len() - 1;
        self.entries.move_index(idx, last);
        Some(self.entries[last].value.clone())
    }

    /// Insert or replace as most recently used, evicting the LRU entry when full.
    pub fn insert(&mut self, key: String, value: V, expires_at: Instant) {
        if let Some(idx) = self.entries.get_index_of(&key) {
            self.entries.shift_remove_index(idx);
        } else if self.entries.len() >= self.capacity {
            self.entries.shift_remove_index(0);
        }
        self.entries.insert(key, Entry { value, expires_at });
    }

    pub fn remove(&mut self, key: &str) -> Option<V> {
        self.entries.shift_remove(key).map(|entry| entry.value)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}
