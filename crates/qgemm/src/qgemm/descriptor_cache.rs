use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use serde::Serialize;

use crate::backend::spec::{BackendError, BackendResult};
use crate::profiling;
use crate::tensor::DevicePtr;

use super::cache::{CachePolicy, CacheStats, CacheStore};

/// Everything that determines how a generic-backend handle bundle is built.
///
/// `bias` is the bias buffer's device address. The address is baked into the
/// operation descriptor, so a different bias buffer needs a different bundle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct ShapeKey {
    pub m: usize,
    pub k: usize,
    pub n: usize,
    pub lda: usize,
    pub ldb: usize,
    pub ldc: usize,
    pub transpose_a: bool,
    pub transpose_b: bool,
    pub bias: DevicePtr,
}

/// Keyed cache of backend handle bundles.
///
/// A single mutex guards the whole map and is held while a missing bundle is
/// constructed, so each key is built at most once even when callers race.
pub struct DescriptorCache<B> {
    inner: Mutex<CacheStore<ShapeKey, Arc<B>>>,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
}

impl<B> DescriptorCache<B> {
    pub fn new(policy: CachePolicy) -> Self {
        Self {
            inner: Mutex::new(CacheStore::new(policy)),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
        }
    }

    /// Returns the bundle for `key`, building it with `create` on a miss.
    ///
    /// A failed construction inserts nothing and is returned to the caller.
    pub fn get_or_create<F>(&self, key: ShapeKey, create: F) -> BackendResult<Arc<B>>
    where
        F: FnOnce(&ShapeKey) -> BackendResult<B>,
    {
        let mut cache = self
            .inner
            .lock()
            .map_err(|_| BackendError::execution("descriptor cache mutex poisoned"))?;
        if let Some(found) = cache.get(&key) {
            self.hits.fetch_add(1, Ordering::Relaxed);
            profiling::cache_event("qgemm.descriptor_cache.hit");
            return Ok(Arc::clone(found));
        }
        profiling::cache_event("qgemm.descriptor_cache.miss");
        log::debug!(
            "descriptor cache miss m={} k={} n={} lda={} ldb={} ldc={} transa={} transb={} bias={:?}",
            key.m,
            key.k,
            key.n,
            key.lda,
            key.ldb,
            key.ldc,
            key.transpose_a,
            key.transpose_b,
            key.bias
        );

        let bundle = Arc::new(create(&key)?);
        self.misses.fetch_add(1, Ordering::Relaxed);
        if cache.insert(key, Arc::clone(&bundle)) {
            self.evictions.fetch_add(1, Ordering::Relaxed);
            profiling::cache_event("qgemm.descriptor_cache.evict");
        }
        Ok(bundle)
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            entries: self.inner.lock().map(|cache| cache.len()).unwrap_or(0),
        }
    }
}
