//! Device driver contract consumed by the quantized GEMM path.
//!
//! The driver owns device memory and streams. Implementations exist for the
//! CUDA driver API (`qgemm-backend-cuda`) and for host memory
//! (`qgemm-backend-ref-cpu`).

use std::ffi::c_void;

use crate::backend::spec::BackendResult;
use crate::tensor::DevicePtr;

/// Opaque stream token handed to kernels by the execution engine.
///
/// `StreamHandle::DEFAULT` names the device's default stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct StreamHandle(pub usize);

impl StreamHandle {
    pub const DEFAULT: StreamHandle = StreamHandle(0);
}

/// Platform stream object (e.g. a `CUstream`) resolved from a [`StreamHandle`].
///
/// Stored as `usize` so it can cross thread boundaries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct NativeStream(pub usize);

impl NativeStream {
    pub fn as_ptr(self) -> *mut c_void {
        self.0 as *mut c_void
    }
}

pub trait DeviceDriver: Send + Sync {
    /// Returns a human-readable driver identifier (e.g. "cuda", "host").
    fn name(&self) -> &str;

    /// Allocates `bytes` of device memory. Contents are unspecified.
    fn allocate(&self, bytes: usize) -> BackendResult<DevicePtr>;

    /// Releases memory previously returned by [`DeviceDriver::allocate`].
    fn deallocate(&self, ptr: DevicePtr) -> BackendResult<()>;

    fn copy_host_to_device(
        &self,
        stream: StreamHandle,
        dst: DevicePtr,
        src: &[u8],
    ) -> BackendResult<()>;

    /// Stream-ordered device-to-host copy into pageable host memory. The copy
    /// has landed in `dst` when this returns; callers still synchronize the
    /// stream before treating the value as current with respect to other work.
    fn copy_device_to_host(
        &self,
        stream: StreamHandle,
        src: DevicePtr,
        dst: &mut [u8],
    ) -> BackendResult<()>;

    /// Blocks the calling thread until all work enqueued on `stream` has completed.
    fn synchronize_stream(&self, stream: StreamHandle) -> BackendResult<()>;

    fn native_stream_handle(&self, stream: StreamHandle) -> BackendResult<NativeStream>;
}
