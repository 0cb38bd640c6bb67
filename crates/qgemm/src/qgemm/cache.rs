use std::collections::HashMap;
use std::hash::Hash;
use std::num::NonZeroUsize;

use lru::LruCache;
use serde::Serialize;

/// Retention policy for a keyed resource cache.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub enum CachePolicy {
    /// Entries live until the owning context is dropped.
    #[default]
    Unbounded,
    /// At most `capacity` entries; the least recently used one is dropped first.
    Lru { capacity: NonZeroUsize },
}

impl CachePolicy {
    pub fn from_capacity(capacity: Option<NonZeroUsize>) -> Self {
        match capacity {
            Some(capacity) => CachePolicy::Lru { capacity },
            None => CachePolicy::Unbounded,
        }
    }
}

/// Hit/miss counters shared by the descriptor and scale caches.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub entries: usize,
}

pub(crate) enum CacheStore<K: Hash + Eq, V> {
    Unbounded(HashMap<K, V>),
    Lru(LruCache<K, V>),
}

impl<K: Hash + Eq, V> CacheStore<K, V> {
    pub(crate) fn new(policy: CachePolicy) -> Self {
        match policy {
            CachePolicy::Unbounded => CacheStore::Unbounded(HashMap::new()),
            CachePolicy::Lru { capacity } => CacheStore::Lru(LruCache::new(capacity)),
        }
    }

    /// Looks up `key`, refreshing its recency under the LRU policy.
    pub(crate) fn get(&mut self, key: &K) -> Option<&V> {
        match self {
            CacheStore::Unbounded(map) => map.get(key),
            CacheStore::Lru(cache) => cache.get(key),
        }
    }

    /// Inserts `value`, returning `true` when another entry was evicted to make room.
    pub(crate) fn insert(&mut self, key: K, value: V) -> bool {
        match self {
            CacheStore::Unbounded(map) => {
                map.insert(key, value);
                false
            }
            CacheStore::Lru(cache) => match cache.push(key, value) {
                Some((evicted, _)) => !cache.contains(&evicted),
                None => false,
            },
        }
    }

    pub(crate) fn len(&self) -> usize {
        match self {
            CacheStore::Unbounded(map) => map.len(),
            CacheStore::Lru(cache) => cache.len(),
        }
    }
}
