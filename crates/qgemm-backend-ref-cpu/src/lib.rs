pub mod driver;
pub mod gemm;

use std::sync::Arc;

pub use driver::{HostDriver, HostDriverStats};
pub use gemm::{RefFusedBackend, RefLtBackend, RefLtBundle, RefStats};

/// Host driver plus both reference backends sharing its memory.
pub fn reference_backends() -> (Arc<HostDriver>, Arc<RefLtBackend>, Arc<RefFusedBackend>) {
    let driver = Arc::new(HostDriver::new());
    let generic = Arc::new(RefLtBackend::new(Arc::clone(&driver)));
    let fused = Arc::new(RefFusedBackend::new(Arc::clone(&driver)));
    (driver, generic, fused)
}
