//! Lightweight profiler for backend scopes and cache events.
//!
//! Every entry point compiles to a no-op unless the `profiler` feature is
//! enabled, so call sites can stay unconditional.

#[cfg(feature = "profiler")]
use std::collections::HashMap;
#[cfg(feature = "profiler")]
use std::sync::{Mutex, OnceLock};
#[cfg(feature = "profiler")]
use std::time::Duration;
#[cfg(feature = "profiler")]
use std::time::Instant;

use serde::Serialize;

#[cfg_attr(not(feature = "profiler"), allow(dead_code))]
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
enum ProfilerKey {
    Backend { name: &'static str },
    Cache { name: &'static str },
}

#[cfg_attr(not(feature = "profiler"), allow(dead_code))]
#[derive(Debug, Default, Clone, Copy, Serialize)]
pub struct WorkStats {
    pub elements: u64,
    pub bytes_read: u64,
    pub bytes_written: u64,
    pub flops: u64,
}

#[cfg_attr(not(feature = "profiler"), allow(dead_code))]
#[derive(Default, Clone)]
struct Stat {
    calls: u64,
    total_ns: u128,
    work: WorkStats,
}

#[cfg(feature = "profiler")]
struct Profiler {
    stats: Mutex<HashMap<ProfilerKey, Stat>>,
}

#[cfg(feature = "profiler")]
impl Profiler {
    fn instance() -> &'static Profiler {
        static INSTANCE: OnceLock<Profiler> = OnceLock::new();
        INSTANCE.get_or_init(|| Profiler {
            stats: Mutex::new(HashMap::new()),
        })
    }

    fn record(&self, key: ProfilerKey, duration: Duration, work: WorkStats) {
        let Ok(mut stats) = self.stats.lock() else {
            return;
        };
        let entry = stats.entry(key).or_default();
        entry.calls = entry.calls.saturating_add(1);
        entry.total_ns = entry.total_ns.saturating_add(duration.as_nanos());
        entry.work.elements = entry.work.elements.saturating_add(work.elements);
        entry.work.bytes_read = entry.work.bytes_read.saturating_add(work.bytes_read);
        entry.work.bytes_written = entry.work.bytes_written.saturating_add(work.bytes_written);
        entry.work.flops = entry.work.flops.saturating_add(work.flops);
    }
}

/// Records the enclosing scope's wall time when dropped.
#[must_use = "the scope ends when the guard is dropped"]
pub struct ScopeGuard {
    #[cfg(feature = "profiler")]
    key: Option<ProfilerKey>,
    #[cfg(feature = "profiler")]
    start: Instant,
    #[cfg(feature = "profiler")]
    work: WorkStats,
}

impl ScopeGuard {
    #[cfg_attr(not(feature = "profiler"), allow(unused_variables))]
    fn new(key: ProfilerKey, work: WorkStats) -> Self {
        #[cfg(feature = "profiler")]
        {
            ScopeGuard {
                key: Some(key),
                start: Instant::now(),
                work,
            }
        }
        #[cfg(not(feature = "profiler"))]
        {
            ScopeGuard {}
        }
    }
}

impl Drop for ScopeGuard {
    fn drop(&mut self) {
        #[cfg(feature = "profiler")]
        if let Some(key) = self.key.take() {
            Profiler::instance().record(key, self.start.elapsed(), self.work);
        }
    }
}

#[inline(always)]
pub fn backend_scope(name: &'static str) -> ScopeGuard {
    ScopeGuard::new(ProfilerKey::Backend { name }, WorkStats::default())
}

#[inline(always)]
pub fn backend_scope_with_work<F>(name: &'static str, work: F) -> ScopeGuard
where
    F: FnOnce() -> WorkStats,
{
    #[cfg(feature = "profiler")]
    {
        ScopeGuard::new(ProfilerKey::Backend { name }, work())
    }
    #[cfg(not(feature = "profiler"))]
    {
        let _ = work;
        backend_scope(name)
    }
}

#[inline(always)]
pub fn cache_event(name: &'static str) {
    #[cfg(feature = "profiler")]
    {
        Profiler::instance().record(
            ProfilerKey::Cache { name },
            Duration::ZERO,
            WorkStats::default(),
        );
    }
    #[cfg(not(feature = "profiler"))]
    {
        let _ = name;
    }
}

/// Work estimate for an `m x n x k` integer GEMM.
pub fn gemm_work(m: usize, n: usize, k: usize) -> WorkStats {
    let (m, n, k) = (m as u64, n as u64, k as u64);
    WorkStats {
        elements: m.saturating_mul(n),
        bytes_read: m.saturating_mul(k).saturating_add(n.saturating_mul(k)),
        bytes_written: m.saturating_mul(n),
        flops: m.saturating_mul(n).saturating_mul(k).saturating_mul(2),
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ProfileRow {
    pub name: String,
    pub calls: u64,
    pub total_ms: f64,
    pub work: WorkStats,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ProfileReport {
    pub backend: Vec<ProfileRow>,
    pub cache: Vec<ProfileRow>,
}

/// Drains the collected statistics. `None` when profiling is compiled out.
pub fn take_report() -> Option<ProfileReport> {
    #[cfg(feature = "profiler")]
    {
        let drained = {
            let mut stats = Profiler::instance().stats.lock().ok()?;
            std::mem::take(&mut *stats)
        };
        let mut report = ProfileReport::default();
        for (key, stat) in drained {
            let (name, rows) = match key {
                ProfilerKey::Backend { name } => (name, &mut report.backend),
                ProfilerKey::Cache { name } => (name, &mut report.cache),
            };
            rows.push(ProfileRow {
                name: name.to_string(),
                calls: stat.calls,
                total_ms: Duration::from_nanos(stat.total_ns.min(u64::MAX as u128) as u64)
                    .as_secs_f64()
                    * 1_000.0,
                work: stat.work,
            });
        }
        report.backend.sort_by(|a, b| a.name.cmp(&b.name));
        report.cache.sort_by(|a, b| a.name.cmp(&b.name));
        Some(report)
    }
    #[cfg(not(feature = "profiler"))]
    {
        None
    }
}

pub fn reset() {
    #[cfg(feature = "profiler")]
    if let Ok(mut stats) = Profiler::instance().stats.lock() {
        stats.clear();
    }
}
