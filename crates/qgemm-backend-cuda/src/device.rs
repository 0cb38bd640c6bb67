use std::ffi::c_void;
use std::sync::{Arc, OnceLock};

use libloading::Library;
use qgemm::backend::driver::DeviceDriver;
use qgemm::{BackendError, BackendResult, DevicePtr, NativeStream, StreamHandle};

type CUresult = i32;
type CUdevice = i32;
type CUcontext = *mut c_void;
type CUdeviceptr = u64;
type CUstream = *mut c_void;

const CUDA_SUCCESS: CUresult = 0;
const CU_STREAM_NON_BLOCKING: u32 = 0x1;

type CuInitFn = unsafe extern "C" fn(flags: u32) -> CUresult;
type CuDeviceGetFn = unsafe extern "C" fn(device: *mut CUdevice, ordinal: i32) -> CUresult;
type CuCtxCreateV2Fn =
    unsafe extern "C" fn(ctx: *mut CUcontext, flags: u32, dev: CUdevice) -> CUresult;
type CuCtxDestroyV2Fn = unsafe extern "C" fn(ctx: CUcontext) -> CUresult;
type CuCtxSetCurrentFn = unsafe extern "C" fn(ctx: CUcontext) -> CUresult;
type CuMemAllocV2Fn = unsafe extern "C" fn(dptr: *mut CUdeviceptr, bytesize: usize) -> CUresult;
type CuMemFreeV2Fn = unsafe extern "C" fn(dptr: CUdeviceptr) -> CUresult;
type CuMemcpyHtoDAsyncV2Fn = unsafe extern "C" fn(
    dst_device: CUdeviceptr,
    src_host: *const c_void,
    byte_count: usize,
    stream: CUstream,
) -> CUresult;
type CuMemcpyDtoHAsyncV2Fn = unsafe extern "C" fn(
    dst_host: *mut c_void,
    src_device: CUdeviceptr,
    byte_count: usize,
    stream: CUstream,
) -> CUresult;
type CuStreamCreateFn = unsafe extern "C" fn(stream: *mut CUstream, flags: u32) -> CUresult;
type CuStreamDestroyV2Fn = unsafe extern "C" fn(stream: CUstream) -> CUresult;
type CuStreamSynchronizeFn = unsafe extern "C" fn(stream: CUstream) -> CUresult;

struct DriverFns {
    cu_init: CuInitFn,
    cu_device_get: CuDeviceGetFn,
    cu_ctx_create_v2: CuCtxCreateV2Fn,
    cu_ctx_destroy_v2: CuCtxDestroyV2Fn,
    cu_ctx_set_current: CuCtxSetCurrentFn,
    cu_mem_alloc_v2: CuMemAllocV2Fn,
    cu_mem_free_v2: CuMemFreeV2Fn,
    cu_memcpy_hto_d_async_v2: CuMemcpyHtoDAsyncV2Fn,
    cu_memcpy_dto_h_async_v2: CuMemcpyDtoHAsyncV2Fn,
    cu_stream_create: CuStreamCreateFn,
    cu_stream_destroy_v2: CuStreamDestroyV2Fn,
    cu_stream_synchronize: CuStreamSynchronizeFn,
}

/// CUDA driver API bound to device 0 through a dedicated context.
///
/// A [`StreamHandle`] is the raw `CUstream` address; `StreamHandle::DEFAULT`
/// is the legacy default stream.
pub struct CudaDriver {
    _lib: Library,
    fns: DriverFns,
    // Stored as usize so CudaDriver can satisfy Send/Sync requirements for driver traits.
    ctx: usize,
}

impl Drop for CudaDriver {
    fn drop(&mut self) {
        if self.ctx != 0 {
            // SAFETY: Context is owned by this driver instance and destroyed once on drop.
            let _ = unsafe { (self.fns.cu_ctx_destroy_v2)(self.ctx_ptr()) };
            self.ctx = 0;
        }
    }
}

/// Non-blocking stream owned by a [`CudaDriver`].
pub struct CudaStream {
    driver: Arc<CudaDriver>,
    stream: usize,
}

impl CudaStream {
    pub fn handle(&self) -> StreamHandle {
        StreamHandle(self.stream)
    }
}

impl Drop for CudaStream {
    fn drop(&mut self) {
        if self.stream != 0 {
            // SAFETY: Stream was created by this driver and is destroyed once.
            let _ = unsafe { (self.driver.fns.cu_stream_destroy_v2)(self.stream as CUstream) };
            self.stream = 0;
        }
    }
}

static CUDA_DRIVER: OnceLock<Result<Arc<CudaDriver>, String>> = OnceLock::new();

pub fn is_available() -> bool {
    driver().is_ok()
}

/// Process-wide driver instance, created on first use.
pub fn driver() -> BackendResult<Arc<CudaDriver>> {
    let init = CUDA_DRIVER.get_or_init(|| match CudaDriver::new() {
        Ok(driver) => Ok(Arc::new(driver)),
        Err(err) => Err(err.to_string()),
    });
    match init {
        Ok(driver) => Ok(Arc::clone(driver)),
        Err(msg) => Err(BackendError::execution(format!(
            "CUDA driver unavailable: {msg}"
        ))),
    }
}

impl CudaDriver {
    fn new() -> BackendResult<Self> {
        let lib = load_cuda_library()?;
        let fns = DriverFns {
            cu_init: load_symbol(&lib, b"cuInit\0")?,
            cu_device_get: load_symbol(&lib, b"cuDeviceGet\0")?,
            cu_ctx_create_v2: load_symbol(&lib, b"cuCtxCreate_v2\0")?,
            cu_ctx_destroy_v2: load_symbol(&lib, b"cuCtxDestroy_v2\0")?,
            cu_ctx_set_current: load_symbol(&lib, b"cuCtxSetCurrent\0")?,
            cu_mem_alloc_v2: load_symbol(&lib, b"cuMemAlloc_v2\0")?,
            cu_mem_free_v2: load_symbol(&lib, b"cuMemFree_v2\0")?,
            cu_memcpy_hto_d_async_v2: load_symbol(&lib, b"cuMemcpyHtoDAsync_v2\0")?,
            cu_memcpy_dto_h_async_v2: load_symbol(&lib, b"cuMemcpyDtoHAsync_v2\0")?,
            cu_stream_create: load_symbol(&lib, b"cuStreamCreate\0")?,
            cu_stream_destroy_v2: load_symbol(&lib, b"cuStreamDestroy_v2\0")?,
            cu_stream_synchronize: load_symbol(&lib, b"cuStreamSynchronize\0")?,
        };

        // SAFETY: Calls are made with valid pointers and follow CUDA driver API contract.
        unsafe {
            check_cuda((fns.cu_init)(0), "cuInit")?;
            let mut dev: CUdevice = 0;
            check_cuda(
                (fns.cu_device_get)(&mut dev as *mut CUdevice, 0),
                "cuDeviceGet",
            )?;
            let mut ctx: CUcontext = std::ptr::null_mut();
            check_cuda(
                (fns.cu_ctx_create_v2)(&mut ctx as *mut CUcontext, 0, dev),
                "cuCtxCreate_v2",
            )?;
            check_cuda((fns.cu_ctx_set_current)(ctx), "cuCtxSetCurrent")?;
            log::info!("CUDA driver initialized on device 0");
            Ok(Self {
                _lib: lib,
                fns,
                ctx: ctx as usize,
            })
        }
    }

    pub fn create_stream(self: &Arc<Self>) -> BackendResult<CudaStream> {
        self.ensure_current()?;
        let mut stream: CUstream = std::ptr::null_mut();
        // SAFETY: `stream` is a valid out pointer.
        unsafe {
            check_cuda(
                (self.fns.cu_stream_create)(&mut stream as *mut CUstream, CU_STREAM_NON_BLOCKING),
                "cuStreamCreate",
            )?;
        }
        Ok(CudaStream {
            driver: Arc::clone(self),
            stream: stream as usize,
        })
    }

    pub fn ensure_current(&self) -> BackendResult<()> {
        // SAFETY: Context was created by this driver and remains valid until drop.
        unsafe {
            check_cuda(
                (self.fns.cu_ctx_set_current)(self.ctx_ptr()),
                "cuCtxSetCurrent",
            )
        }
    }

    fn ctx_ptr(&self) -> CUcontext {
        self.ctx as CUcontext
    }
}

fn cu_stream(stream: StreamHandle) -> CUstream {
    stream.0 as CUstream
}

impl DeviceDriver for CudaDriver {
    fn name(&self) -> &str {
        "cuda"
    }

    fn allocate(&self, bytes: usize) -> BackendResult<DevicePtr> {
        self.ensure_current()?;
        let mut ptr: CUdeviceptr = 0;
        // SAFETY: `ptr` is a valid out pointer for CUDA allocation.
        unsafe {
            check_cuda(
                (self.fns.cu_mem_alloc_v2)(&mut ptr as *mut CUdeviceptr, bytes.max(1)),
                "cuMemAlloc_v2",
            )?;
        }
        Ok(DevicePtr(ptr))
    }

    fn deallocate(&self, ptr: DevicePtr) -> BackendResult<()> {
        self.ensure_current()?;
        // SAFETY: Pointer was returned by cuMemAlloc_v2 on this context.
        unsafe { check_cuda((self.fns.cu_mem_free_v2)(ptr.0), "cuMemFree_v2") }
    }

    fn copy_host_to_device(
        &self,
        stream: StreamHandle,
        dst: DevicePtr,
        src: &[u8],
    ) -> BackendResult<()> {
        if src.is_empty() {
            return Ok(());
        }
        self.ensure_current()?;
        // SAFETY: Pageable source is staged before the call returns; destination is a live allocation.
        unsafe {
            check_cuda(
                (self.fns.cu_memcpy_hto_d_async_v2)(
                    dst.0,
                    src.as_ptr() as *const c_void,
                    src.len(),
                    cu_stream(stream),
                ),
                "cuMemcpyHtoDAsync_v2",
            )
        }
    }

    fn copy_device_to_host(
        &self,
        stream: StreamHandle,
        src: DevicePtr,
        dst: &mut [u8],
    ) -> BackendResult<()> {
        if dst.is_empty() {
            return Ok(());
        }
        self.ensure_current()?;
        // SAFETY: Copies into pageable memory complete before the call returns, so `dst`
        // is not written after this borrow ends.
        unsafe {
            check_cuda(
                (self.fns.cu_memcpy_dto_h_async_v2)(
                    dst.as_mut_ptr() as *mut c_void,
                    src.0,
                    dst.len(),
                    cu_stream(stream),
                ),
                "cuMemcpyDtoHAsync_v2",
            )
        }
    }

    fn synchronize_stream(&self, stream: StreamHandle) -> BackendResult<()> {
        self.ensure_current()?;
        // SAFETY: Stream handle is either the default stream or one created on this context.
        unsafe {
            check_cuda(
                (self.fns.cu_stream_synchronize)(cu_stream(stream)),
                "cuStreamSynchronize",
            )
        }
    }

    fn native_stream_handle(&self, stream: StreamHandle) -> BackendResult<NativeStream> {
        Ok(NativeStream(stream.0))
    }
}

fn load_cuda_library() -> BackendResult<Library> {
    let candidates = ["libcuda.so.1", "libcuda.so", "nvcuda.dll", "libcuda.dylib"];

    for candidate in candidates {
        // SAFETY: Dynamic library probe only; no symbols are invoked at this stage.
        if let Ok(lib) = unsafe { Library::new(candidate) } {
            return Ok(lib);
        }
    }

    Err(BackendError::execution(
        "failed to load CUDA driver library (tried libcuda.so.1, libcuda.so, nvcuda.dll, libcuda.dylib)",
    ))
}

pub(crate) fn load_symbol<T: Copy>(lib: &Library, name: &'static [u8]) -> BackendResult<T> {
    // SAFETY: Caller provides the expected symbol type for the loaded library.
    let sym = unsafe { lib.get::<T>(name) }.map_err(|err| {
        BackendError::execution(format!(
            "failed to resolve symbol {}: {err}",
            String::from_utf8_lossy(name.strip_suffix(b"\0").unwrap_or(name))
        ))
    })?;
    Ok(*sym)
}

fn check_cuda(code: CUresult, call: &'static str) -> BackendResult<()> {
    if code == CUDA_SUCCESS {
        Ok(())
    } else {
        Err(BackendError::Driver { call, status: code })
    }
}
