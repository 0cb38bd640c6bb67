//! CUDA implementations of the quantized GEMM contracts.
//!
//! Every native library is opened with `libloading` on first use, so the crate
//! builds and links without a CUDA toolkit and reports unavailability at run
//! time instead.

pub mod cublaslt;
pub mod device;
#[cfg(feature = "fused")]
pub mod fused;

pub use cublaslt::{CublasLtBackend, CublasLtBundle};
pub use device::{CudaDriver, CudaStream};
#[cfg(feature = "fused")]
pub use fused::VendorFusedBackend;

/// `true` when both the CUDA driver and cuBLASLt can be loaded.
pub fn is_available() -> bool {
    device::is_available() && cublaslt::is_available()
}
