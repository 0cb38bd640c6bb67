use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use once_cell::sync::OnceCell;
use serde::Serialize;

use crate::backend::driver::{DeviceDriver, StreamHandle};
use crate::backend::spec::{BackendError, BackendResult};
use crate::profiling;
use crate::tensor::{BufferIdentity, DevicePtr};

use super::cache::{CachePolicy, CacheStats, CacheStore};

/// Identities of the input, weight and output scale buffers.
///
/// Callers guarantee that a repeated identity triple points at unchanged
/// values; the cache never re-reads a buffer it has already seen.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct ScaleKey {
    pub input_scale: BufferIdentity,
    pub weight_scale: BufferIdentity,
    pub output_scale: BufferIdentity,
}

/// Requantization factor applied to the int32 accumulator.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct CombinedScale(pub f32);

impl CombinedScale {
    /// `input * weight / output`.
    pub fn compose(input: f32, weight: f32, output: f32) -> BackendResult<Self> {
        let combined = input * weight / output;
        if !combined.is_finite() || combined == 0.0 {
            return Err(BackendError::invalid_operand(format!(
                "degenerate quantization scales: input={input} weight={weight} output={output}"
            )));
        }
        Ok(CombinedScale(combined))
    }

    pub fn value(self) -> f32 {
        self.0
    }
}

type ScaleCell = Arc<OnceCell<CombinedScale>>;

/// Keyed cache of combined scales.
///
/// Each key owns a once-cell: the map lock only covers get-or-insert of the
/// cell, and the loader runs inside the cell initializer. Concurrent callers
/// for the same key block until the first loader finishes; other keys are not
/// held up by an in-flight load.
pub struct ScaleCache {
    inner: Mutex<CacheStore<ScaleKey, ScaleCell>>,
    hits: AtomicU64,
    loads: AtomicU64,
    evictions: AtomicU64,
}

impl ScaleCache {
    pub fn new(policy: CachePolicy) -> Self {
        Self {
            inner: Mutex::new(CacheStore::new(policy)),
            hits: AtomicU64::new(0),
            loads: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
        }
    }

    pub fn resolve<F>(&self, key: ScaleKey, loader: F) -> BackendResult<CombinedScale>
    where
        F: FnOnce() -> BackendResult<CombinedScale>,
    {
        let cell = {
            let mut cache = self
                .inner
                .lock()
                .map_err(|_| BackendError::execution("scale cache mutex poisoned"))?;
            match cache.get(&key) {
                Some(cell) => Arc::clone(cell),
                None => {
                    let cell: ScaleCell = Arc::new(OnceCell::new());
                    if cache.insert(key, Arc::clone(&cell)) {
                        self.evictions.fetch_add(1, Ordering::Relaxed);
                        profiling::cache_event("qgemm.scale_cache.evict");
                    }
                    cell
                }
            }
        };

        if let Some(scale) = cell.get() {
            self.hits.fetch_add(1, Ordering::Relaxed);
            profiling::cache_event("qgemm.scale_cache.hit");
            return Ok(*scale);
        }

        let mut loaded = false;
        let scale = *cell.get_or_try_init(|| {
            loaded = true;
            self.loads.fetch_add(1, Ordering::Relaxed);
            profiling::cache_event("qgemm.scale_cache.load");
            log::debug!("scale cache miss for {key:?}");
            loader()
        })?;
        if !loaded {
            // Another caller finished the load while this one waited on the cell.
            self.hits.fetch_add(1, Ordering::Relaxed);
        }
        Ok(scale)
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.loads.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            entries: self.inner.lock().map(|cache| cache.len()).unwrap_or(0),
        }
    }
}

/// Device pointers of the three scale scalars.
#[derive(Debug, Clone, Copy)]
pub struct ScaleBuffers {
    pub input: DevicePtr,
    pub weight: DevicePtr,
    pub output: DevicePtr,
}

/// Reads the three f32 scales with one copy each, then synchronizes `stream` once.
pub fn load_combined_scale(
    driver: &dyn DeviceDriver,
    stream: StreamHandle,
    buffers: ScaleBuffers,
) -> BackendResult<CombinedScale> {
    let _scope = profiling::backend_scope("qgemm.scale_load");
    let mut input = [0u8; 4];
    let mut weight = [0u8; 4];
    let mut output = [0u8; 4];
    driver.copy_device_to_host(stream, buffers.input, &mut input)?;
    driver.copy_device_to_host(stream, buffers.weight, &mut weight)?;
    driver.copy_device_to_host(stream, buffers.output, &mut output)?;
    driver.synchronize_stream(stream)?;
    CombinedScale::compose(
        f32::from_ne_bytes(input),
        f32::from_ne_bytes(weight),
        f32::from_ne_bytes(output),
    )
}
