//! Shared LRU cache with load-on-miss
//!
//! [`LruCache`] maps keys to loaded values and evicts the least-recently-used
//! entry once the configured capacity is reached. It is used both for lazily
//! loaded dataset entities and for memoizing match results per User-Agent.
//!
//! # Concurrency
//!
//! The loader runs outside the critical section, so two threads missing on
//! the same key may both compute a value. Only the first value stored wins;
//! the loser's value is dropped and the stored one is returned to both. The
//! mutex covers the lookup-and-promote step and the insert-and-evict step,
//! never the load itself.
//!
//! # Example
//!
//! ```
//! use uamatch_cache::LruCache;
//!
//! let cache: LruCache<u32, String> = LruCache::new(2);
//! let v = cache.get_or_load(&7, |k| Ok::<_, ()>(format!("value {}", k)))?;
//! assert_eq!(v.as_str(), "value 7");
//! assert_eq!(cache.misses(), 1);
//! # Ok::<(), ()>(())
//! ```

use std::borrow::Borrow;
use std::hash::{BuildHasherDefault, Hash};
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use rustc_hash::FxHasher;

type Inner<K, V> = lru::LruCache<K, Arc<V>, BuildHasherDefault<FxHasher>>;

/// Point-in-time cache counters
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct CacheStats {
    /// Lookups since creation or the last reset
    pub requests: u64,
    /// Lookups that had to invoke the loader
    pub misses: u64,
    /// Entries currently held
    pub len: usize,
    /// Maximum number of entries
    pub capacity: usize,
}

impl CacheStats {
    /// Fraction of requests that missed (0.0 to 1.0)
    pub fn percentage_misses(&self) -> f64 {
        if self.requests == 0 {
            0.0
        } else {
            self.misses as f64 / self.requests as f64
        }
    }
}

/// Thread-safe least-recently-used cache
pub struct LruCache<K, V> {
    inner: Mutex<Inner<K, V>>,
    capacity: NonZeroUsize,
    requests: AtomicU64,
    misses: AtomicU64,
}

impl<K: Hash + Eq, V> LruCache<K, V> {
    /// Create a cache holding at most `capacity` entries (minimum 1)
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            inner: Mutex::new(lru::LruCache::with_hasher(
                capacity,
                BuildHasherDefault::<FxHasher>::default(),
            )),
            capacity,
            requests: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    // A panicking loader never runs under the lock, so a poisoned mutex still
    // guards a consistent map.
    fn lock(&self) -> MutexGuard<'_, Inner<K, V>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Return the cached value for `key`, loading it on a miss
    ///
    /// A hit moves the entry to the head of the recency list. A miss calls
    /// `loader` without holding the lock, then stores the result unless
    /// another thread stored a value for the same key first, in which case
    /// that earlier value is returned. Loader errors propagate and leave the
    /// cache untouched.
    pub fn get_or_load<Q, F, E>(&self, key: &Q, loader: F) -> Result<Arc<V>, E>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ToOwned<Owned = K> + ?Sized,
        F: FnOnce(&Q) -> Result<V, E>,
    {
        self.requests.fetch_add(1, Ordering::Relaxed);

        if let Some(value) = self.lock().get(key) {
            return Ok(Arc::clone(value));
        }

        self.misses.fetch_add(1, Ordering::Relaxed);
        let loaded = Arc::new(loader(key)?);

        let mut inner = self.lock();
        if let Some(existing) = inner.get(key) {
            return Ok(Arc::clone(existing));
        }
        inner.put(key.to_owned(), Arc::clone(&loaded));
        Ok(loaded)
    }

    /// Look up `key` without loading; a hit is promoted
    pub fn get<Q>(&self, key: &Q) -> Option<Arc<V>>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.lock().get(key).cloned()
    }

    /// Whether `key` is present, without touching recency
    pub fn contains<Q>(&self, key: &Q) -> bool
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.lock().contains(key)
    }

    /// Number of entries currently held
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Whether the cache holds no entries
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Maximum number of entries
    pub fn capacity(&self) -> usize {
        self.capacity.get()
    }

    /// Lookups since creation or the last reset
    pub fn requests(&self) -> u64 {
        self.requests.load(Ordering::Relaxed)
    }

    /// Lookups that invoked the loader
    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }

    /// `misses / requests`, or 0.0 before the first request
    pub fn percentage_misses(&self) -> f64 {
        self.stats().percentage_misses()
    }

    /// Snapshot of the counters
    pub fn stats(&self) -> CacheStats {
        CacheStats {
            requests: self.requests(),
            misses: self.misses(),
            len: self.len(),
            capacity: self.capacity(),
        }
    }

    /// Drop every entry and zero the counters
    pub fn reset(&self) {
        self.lock().clear();
        self.requests.store(0, Ordering::Relaxed);
        self.misses.store(0, Ordering::Relaxed);
    }
}

impl<K, V> std::fmt::Debug for LruCache<K, V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LruCache")
            .field("capacity", &self.capacity)
            .field("requests", &self.requests.load(Ordering::Relaxed))
            .field("misses", &self.misses.load(Ordering::Relaxed))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;
    use std::convert::Infallible;
    use std::sync::Barrier;
    use std::thread;

    fn load_square(k: &u32) -> Result<u64, Infallible> {
        Ok(u64::from(*k) * u64::from(*k))
    }

    #[test]
    fn test_miss_then_hit() {
        let cache = LruCache::new(4);
        let calls = Cell::new(0);

        let first = cache
            .get_or_load(&3, |k| {
                calls.set(calls.get() + 1);
                load_square(k)
            })
            .unwrap();
        let second = cache
            .get_or_load(&3, |k| {
                calls.set(calls.get() + 1);
                load_square(k)
            })
            .unwrap();

        assert_eq!(*first, 9);
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(calls.get(), 1, "loader must only run on the miss");
        assert_eq!(cache.misses(), 1);
        assert_eq!(cache.requests(), 2);
        assert!((cache.percentage_misses() - 0.5).abs() < f64::EPSILON);
    }

    #[test]
    fn test_evicts_least_recently_used() {
        let cache = LruCache::new(3);
        for k in 1..=3u32 {
            cache.get_or_load(&k, load_square).unwrap();
        }
        // Touch 1 so that 2 becomes the oldest entry
        cache.get_or_load(&1, load_square).unwrap();
        cache.get_or_load(&4, load_square).unwrap();

        assert_eq!(cache.len(), 3);
        assert!(!cache.contains(&2), "2 was least recently used");
        assert!(cache.contains(&1));
        assert!(cache.contains(&3));
        assert!(cache.contains(&4));
    }

    #[test]
    fn test_len_stabilizes_at_capacity() {
        let cache = LruCache::new(5);
        for k in 0..50u32 {
            cache.get_or_load(&k, load_square).unwrap();
        }
        assert_eq!(cache.len(), 5);
        assert_eq!(cache.capacity(), 5);
    }

    #[test]
    fn test_loader_error_leaves_no_entry() {
        let cache: LruCache<u32, u64> = LruCache::new(2);
        let result = cache.get_or_load(&1, |_| Err("boom"));
        assert_eq!(result.unwrap_err(), "boom");
        assert!(cache.is_empty());

        let value = cache.get_or_load(&1, |_| Ok::<_, &str>(11)).unwrap();
        assert_eq!(*value, 11);
    }

    #[test]
    fn test_string_keys_borrow_as_str() {
        let cache: LruCache<String, usize> = LruCache::new(8);
        let len = cache
            .get_or_load("Mozilla/5.0", |s: &str| Ok::<_, Infallible>(s.len()))
            .unwrap();
        assert_eq!(*len, 11);
        assert!(cache.contains("Mozilla/5.0"));
    }

    #[test]
    fn test_reset_clears_entries_and_counters() {
        let cache = LruCache::new(2);
        cache.get_or_load(&1, load_square).unwrap();
        cache.get_or_load(&1, load_square).unwrap();
        cache.reset();

        let stats = cache.stats();
        assert_eq!(stats.requests, 0);
        assert_eq!(stats.misses, 0);
        assert_eq!(stats.len, 0);
        assert_eq!(stats.percentage_misses(), 0.0);
    }

    #[test]
    fn test_concurrent_misses_store_one_value() {
        let cache = Arc::new(LruCache::<u32, Vec<u8>>::new(16));
        let barrier = Arc::new(Barrier::new(8));

        let handles: Vec<_> = (0..8u8)
            .map(|id| {
                let cache = Arc::clone(&cache);
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    barrier.wait();
                    cache
                        .get_or_load(&42, |_| Ok::<_, Infallible>(vec![id]))
                        .unwrap()
                })
            })
            .collect();

        let values: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        let stored = cache.get(&42).unwrap();
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.requests(), 8);
        // Losers of the insert race drop their own value and see the winner's
        assert!(values.iter().all(|v| Arc::ptr_eq(v, &stored)));
    }
}
