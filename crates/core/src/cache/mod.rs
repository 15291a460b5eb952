//! Bounded least-recently-used caches for decoded audio and generated
//! artifacts.

mod manager;

use std::{borrow::Borrow, fmt, hash::Hash, num::NonZeroUsize};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

pub use manager::{ArtifactKey, CacheManager, CacheManagerStats};

/// Occupancy snapshot of a single cache.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CacheStats {
    pub size: usize,
    pub capacity: usize,
    /// `size / capacity`, in [0, 1].
    pub utilization: f64,
}

/// Thread-safe LRU cache with a fixed entry capacity.
///
/// Reads and writes both promote the entry to most recently used. Entries
/// only leave through capacity eviction on [`LruCache::set`], [`LruCache::delete`]
/// or [`LruCache::clear`].
pub struct LruCache<K, V> {
    entries: Mutex<lru::LruCache<K, V>>,
    capacity: NonZeroUsize,
}

impl<K: Hash + Eq, V: Clone> LruCache<K, V> {
    /// Creates a cache holding at most `capacity` entries. Zero is treated
    /// as one.
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            entries: Mutex::new(lru::LruCache::new(capacity)),
            capacity,
        }
    }

    pub fn get<Q>(&self, key: &Q) -> Option<V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.entries.lock().get(key).cloned()
    }

    /// Inserts `value` as the most recently used entry and returns the entry
    /// evicted to make room, if any.
    pub fn set(&self, key: K, value: V) -> Option<(K, V)> {
        let mut entries = self.entries.lock();
        entries.pop(&key);
        entries.push(key, value)
    }

    /// Checks for `key` without touching its recency.
    pub fn has<Q>(&self, key: &Q) -> bool
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.entries.lock().contains(key)
    }

    pub fn delete<Q>(&self, key: &Q) -> Option<V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.entries.lock().pop(key)
    }

    pub fn clear(&self) {
        self.entries.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity.get()
    }

    pub fn stats(&self) -> CacheStats {
        let size = self.len();
        let capacity = self.capacity();
        CacheStats {
            size,
            capacity,
            utilization: size as f64 / capacity as f64,
        }
    }
}

impl<K: Hash + Eq + Clone, V> LruCache<K, V> {
    /// Keys ordered from least to most recently used.
    pub fn keys(&self) -> Vec<K> {
        self.entries
            .lock()
            .iter()
            .rev()
            .map(|(key, _)| key.clone())
            .collect()
    }
}

impl<K: Hash + Eq, V> fmt::Debug for LruCache<K, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LruCache")
            .field("size", &self.entries.lock().len())
            .field("capacity", &self.capacity)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn filled(capacity: usize, keys: &[&'static str]) -> LruCache<&'static str, usize> {
        let cache = LruCache::new(capacity);
        for (value, key) in keys.iter().enumerate() {
            cache.set(*key, value);
        }
        cache
    }

    #[test]
    fn retains_most_recent_keys() {
        let cache = filled(3, &["a", "b", "c", "d", "e"]);

        assert_eq!(cache.len(), 3);
        assert_eq!(cache.keys(), vec!["c", "d", "e"]);
        assert_eq!(cache.get(&"a"), None);
    }

    #[test]
    fn get_protects_entry_from_eviction() {
        let cache = filled(3, &["a", "b", "c"]);

        assert_eq!(cache.get(&"a"), Some(0));
        let evicted = cache.set("d", 3);

        assert_eq!(evicted, Some(("b", 1)));
        assert!(cache.has(&"a"));
        assert_eq!(cache.keys(), vec!["c", "a", "d"]);
    }

    #[test]
    fn reinsertion_promotes_without_evicting() {
        let cache = filled(3, &["a", "b", "c"]);

        let evicted = cache.set("a", 10);

        assert_eq!(evicted, None);
        assert_eq!(cache.len(), 3);
        assert_eq!(cache.keys(), vec!["b", "c", "a"]);
        assert_eq!(cache.get(&"a"), Some(10));
    }

    #[test]
    fn has_does_not_promote() {
        let cache = filled(2, &["a", "b"]);

        assert!(cache.has(&"a"));
        cache.set("c", 2);

        assert!(!cache.has(&"a"));
    }

    #[test]
    fn delete_and_clear() {
        let cache = filled(4, &["a", "b", "c"]);

        assert_eq!(cache.delete(&"b"), Some(1));
        assert_eq!(cache.delete(&"b"), None);
        assert_eq!(cache.keys(), vec!["a", "c"]);

        cache.clear();
        assert!(cache.is_empty());
        assert_eq!(cache.capacity(), 4);
    }

    #[test]
    fn reports_utilization() {
        let cache = filled(4, &["a"]);
        let stats = cache.stats();

        assert_eq!(stats.size, 1);
        assert_eq!(stats.capacity, 4);
        assert!((stats.utilization - 0.25).abs() < f64::EPSILON);
    }

    #[test]
    fn zero_capacity_holds_one_entry() {
        let cache = filled(0, &["a", "b"]);
        assert_eq!(cache.capacity(), 1);
        assert_eq!(cache.keys(), vec!["b"]);
    }
}
