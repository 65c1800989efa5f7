//! Sync id to local key cache used during bulk applies.

use std::collections::HashMap;
use std::time::{Duration, Instant};
use uuid::Uuid;

/// Maps `(type name, sync id)` to a local storage key.
///
/// Filled lazily while applying a batch. The whole cache is dropped when it
/// outlives its timeout or when its session ends; callers re-validate every
/// hit against the row they load.
#[derive(Debug)]
pub struct PrimaryKeyCache {
    entries: HashMap<(String, Uuid), u64>,
    timeout: Duration,
    filled_at: Instant,
    hits: u64,
    misses: u64,
}

impl PrimaryKeyCache {
    /// Creates an empty cache.
    pub fn new(timeout: Duration) -> Self {
        Self {
            entries: HashMap::new(),
            timeout,
            filled_at: Instant::now(),
            hits: 0,
            misses: 0,
        }
    }

    /// Looks up a key.
    pub fn get(&mut self, type_name: &str, sync_id: Uuid) -> Option<u64> {
        self.expire();
        match self.entries.get(&(type_name.to_string(), sync_id)) {
            Some(key) => {
                self.hits += 1;
                Some(*key)
            }
            None => {
                self.misses += 1;
                None
            }
        }
    }

    /// Records a key.
    pub fn insert(&mut self, type_name: &str, sync_id: Uuid, key: u64) {
        self.expire();
        self.entries.insert((type_name.to_string(), sync_id), key);
    }

    /// Forgets one entry.
    pub fn remove(&mut self, type_name: &str, sync_id: Uuid) {
        self.entries.remove(&(type_name.to_string(), sync_id));
    }

    /// Forgets everything.
    pub fn clear(&mut self) {
        self.entries.clear();
        self.filled_at = Instant::now();
    }

    /// Number of cached entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true if nothing is cached.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Returns `(hits, misses)`.
    pub fn stats(&self) -> (u64, u64) {
        (self.hits, self.misses)
    }

    fn expire(&mut self) {
        if self.filled_at.elapsed() >= self.timeout {
            if !self.entries.is_empty() {
                tracing::trace!(entries = self.entries.len(), "primary key cache expired");
            }
            self.clear();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hit_and_miss() {
        let mut cache = PrimaryKeyCache::new(Duration::from_secs(60));
        let id = Uuid::new_v4();
        assert_eq!(cache.get("Person", id), None);

        cache.insert("Person", id, 7);
        assert_eq!(cache.get("Person", id), Some(7));
        assert_eq!(cache.get("Address", id), None);
        assert_eq!(cache.stats(), (1, 2));

        cache.remove("Person", id);
        assert!(cache.is_empty());
    }

    #[test]
    fn zero_timeout_never_holds_entries() {
        let mut cache = PrimaryKeyCache::new(Duration::ZERO);
        let id = Uuid::new_v4();
        cache.insert("Person", id, 1);
        assert_eq!(cache.get("Person", id), None);
    }
}
