use std::env;
use std::num::NonZeroUsize;
use std::sync::OnceLock;

use serde::Serialize;

static QGEMM_DISABLE_FUSED: OnceLock<bool> = OnceLock::new();
static QGEMM_DESCRIPTOR_CACHE_CAPACITY: OnceLock<Option<NonZeroUsize>> = OnceLock::new();
static QGEMM_SCALE_CACHE_CAPACITY: OnceLock<Option<NonZeroUsize>> = OnceLock::new();
static COMPILER_TOGGLES: OnceLock<CompilerToggles> = OnceLock::new();

pub fn parse_bool(value: &str) -> bool {
    let normalized = value.trim().to_ascii_lowercase();
    matches!(normalized.as_str(), "1" | "true" | "yes" | "on")
}

/// `None` for empty, zero or unparsable values (unbounded cache).
pub fn parse_capacity(value: &str) -> Option<NonZeroUsize> {
    value.trim().parse::<usize>().ok().and_then(NonZeroUsize::new)
}

fn bool_var(name: &str) -> bool {
    match env::var(name) {
        Ok(value) if !value.trim().is_empty() => parse_bool(&value),
        _ => false,
    }
}

fn capacity_var(name: &str) -> Option<NonZeroUsize> {
    let value = env::var(name).ok()?;
    let parsed = parse_capacity(&value);
    if parsed.is_none() && !value.trim().is_empty() && value.trim() != "0" {
        log::warn!("ignoring {name}={value:?}: expected a non-negative integer");
    }
    parsed
}

pub(crate) fn fused_disabled() -> bool {
    *QGEMM_DISABLE_FUSED.get_or_init(|| bool_var("QGEMM_DISABLE_FUSED"))
}

pub(crate) fn descriptor_cache_capacity() -> Option<NonZeroUsize> {
    *QGEMM_DESCRIPTOR_CACHE_CAPACITY
        .get_or_init(|| capacity_var("QGEMM_DESCRIPTOR_CACHE_CAPACITY"))
}

pub(crate) fn scale_cache_capacity() -> Option<NonZeroUsize> {
    *QGEMM_SCALE_CACHE_CAPACITY.get_or_init(|| capacity_var("QGEMM_SCALE_CACHE_CAPACITY"))
}

/// Library path override, read on every call so backends can be probed
/// with different settings within one process.
pub fn library_override(name: &str) -> Option<String> {
    match env::var(name) {
        Ok(value) if !value.trim().is_empty() => Some(value.trim().to_string()),
        _ => None,
    }
}

/// Graph-compiler switches that decide whether quantized GEMMs reach this
/// kernel at all. They do not change kernel behavior.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CompilerToggles {
    pub compute_intensive_fuse: bool,
    pub stitch: bool,
    pub shape_constraint_ir: bool,
}

impl CompilerToggles {
    pub fn from_env() -> Self {
        Self {
            compute_intensive_fuse: bool_var("DISC_ENABLE_COMPUTE_INTENSIVE_FUSE"),
            stitch: bool_var("DISC_ENABLE_STITCH"),
            shape_constraint_ir: bool_var("DISC_ENABLE_SHAPE_CONSTRAINT_IR"),
        }
    }
}

pub fn compiler_toggles() -> CompilerToggles {
    *COMPILER_TOGGLES.get_or_init(CompilerToggles::from_env)
}
