//! cuBLASLt int8 GEMM with a bias epilogue.
//!
//! A [`CublasLtBundle`] owns the matmul descriptor and the three matrix
//! layouts for one [`GemmPlan`]; the library handle is shared by every bundle
//! of a backend. The bias pointer is baked into the descriptor.

use std::ffi::c_void;
use std::sync::{Arc, OnceLock};

use libloading::Library;
use qgemm::env;
use qgemm::qgemm::{Epilogue, GemmCall, GemmPlan, GenericBackend, MatrixLayout, Transpose};
use qgemm::{BackendError, BackendResult, DType, StreamHandle};

use crate::device::{self, load_symbol, CudaDriver};

type CublasStatus = i32;
type CublasLtHandle = *mut c_void;
type CublasLtMatmulDesc = *mut c_void;
type CublasLtMatrixLayout = *mut c_void;
type CUstream = *mut c_void;

const CUBLAS_STATUS_SUCCESS: CublasStatus = 0;

const CUBLAS_COMPUTE_32I: i32 = 72;
const CUDA_R_32F: i32 = 0;
const CUDA_R_8I: i32 = 3;
const CUBLAS_OP_N: i32 = 0;
const CUBLAS_OP_T: i32 = 1;
const CUBLASLT_EPILOGUE_BIAS: u32 = 4;

const CUBLASLT_MATMUL_DESC_TRANSA: i32 = 3;
const CUBLASLT_MATMUL_DESC_TRANSB: i32 = 4;
const CUBLASLT_MATMUL_DESC_EPILOGUE: i32 = 7;
const CUBLASLT_MATMUL_DESC_BIAS_POINTER: i32 = 8;

/// Environment variable naming an explicit `libcublasLt` path.
pub const CUBLASLT_LIBRARY_ENV: &str = "QGEMM_CUBLASLT_LIBRARY";

type CublasLtCreateFn = unsafe extern "C" fn(handle: *mut CublasLtHandle) -> CublasStatus;
type CublasLtDestroyFn = unsafe extern "C" fn(handle: CublasLtHandle) -> CublasStatus;
type CublasLtMatmulDescCreateFn = unsafe extern "C" fn(
    desc: *mut CublasLtMatmulDesc,
    compute_type: i32,
    scale_type: i32,
) -> CublasStatus;
type CublasLtMatmulDescDestroyFn = unsafe extern "C" fn(desc: CublasLtMatmulDesc) -> CublasStatus;
type CublasLtMatmulDescSetAttributeFn = unsafe extern "C" fn(
    desc: CublasLtMatmulDesc,
    attr: i32,
    buf: *const c_void,
    size_in_bytes: usize,
) -> CublasStatus;
type CublasLtMatrixLayoutCreateFn = unsafe extern "C" fn(
    layout: *mut CublasLtMatrixLayout,
    data_type: i32,
    rows: u64,
    cols: u64,
    ld: i64,
) -> CublasStatus;
type CublasLtMatrixLayoutDestroyFn =
    unsafe extern "C" fn(layout: CublasLtMatrixLayout) -> CublasStatus;
type CublasLtMatmulFn = unsafe extern "C" fn(
    handle: CublasLtHandle,
    desc: CublasLtMatmulDesc,
    alpha: *const c_void,
    a: *const c_void,
    a_desc: CublasLtMatrixLayout,
    b: *const c_void,
    b_desc: CublasLtMatrixLayout,
    beta: *const c_void,
    c: *const c_void,
    c_desc: CublasLtMatrixLayout,
    d: *mut c_void,
    d_desc: CublasLtMatrixLayout,
    algo: *const c_void,
    workspace: *mut c_void,
    workspace_size: usize,
    stream: CUstream,
) -> CublasStatus;

struct LtFns {
    create: CublasLtCreateFn,
    destroy: CublasLtDestroyFn,
    matmul_desc_create: CublasLtMatmulDescCreateFn,
    matmul_desc_destroy: CublasLtMatmulDescDestroyFn,
    matmul_desc_set_attribute: CublasLtMatmulDescSetAttributeFn,
    matrix_layout_create: CublasLtMatrixLayoutCreateFn,
    matrix_layout_destroy: CublasLtMatrixLayoutDestroyFn,
    matmul: CublasLtMatmulFn,
}

struct LtApi {
    _lib: Library,
    fns: LtFns,
}

static CUBLASLT: OnceLock<Result<Arc<LtApi>, String>> = OnceLock::new();

pub fn is_available() -> bool {
    api().is_ok()
}

fn api() -> BackendResult<Arc<LtApi>> {
    let init = CUBLASLT.get_or_init(|| match LtApi::load() {
        Ok(api) => Ok(Arc::new(api)),
        Err(err) => Err(err.to_string()),
    });
    match init {
        Ok(api) => Ok(Arc::clone(api)),
        Err(msg) => Err(BackendError::execution(format!(
            "cuBLASLt unavailable: {msg}"
        ))),
    }
}

impl LtApi {
    fn load() -> BackendResult<Self> {
        let lib = load_cublaslt_library()?;
        let fns = LtFns {
            create: load_symbol(&lib, b"cublasLtCreate\0")?,
            destroy: load_symbol(&lib, b"cublasLtDestroy\0")?,
            matmul_desc_create: load_symbol(&lib, b"cublasLtMatmulDescCreate\0")?,
            matmul_desc_destroy: load_symbol(&lib, b"cublasLtMatmulDescDestroy\0")?,
            matmul_desc_set_attribute: load_symbol(&lib, b"cublasLtMatmulDescSetAttribute\0")?,
            matrix_layout_create: load_symbol(&lib, b"cublasLtMatrixLayoutCreate\0")?,
            matrix_layout_destroy: load_symbol(&lib, b"cublasLtMatrixLayoutDestroy\0")?,
            matmul: load_symbol(&lib, b"cublasLtMatmul\0")?,
        };
        Ok(Self { _lib: lib, fns })
    }
}

fn load_cublaslt_library() -> BackendResult<Library> {
    if let Some(path) = env::library_override(CUBLASLT_LIBRARY_ENV) {
        // SAFETY: Dynamic library probe only; no symbols are invoked at this stage.
        return match unsafe { Library::new(&path) } {
            Ok(lib) => {
                log::info!("loaded cuBLASLt from {path}");
                Ok(lib)
            }
            Err(err) => Err(BackendError::execution(format!(
                "failed to load {CUBLASLT_LIBRARY_ENV}={path}: {err}"
            ))),
        };
    }

    let candidates = [
        "libcublasLt.so.12",
        "libcublasLt.so.11",
        "libcublasLt.so",
        "cublasLt64_12.dll",
        "cublasLt64_11.dll",
    ];
    for candidate in candidates {
        // SAFETY: Dynamic library probe only; no symbols are invoked at this stage.
        if let Ok(lib) = unsafe { Library::new(candidate) } {
            log::info!("loaded cuBLASLt from {candidate}");
            return Ok(lib);
        }
    }

    Err(BackendError::execution(format!(
        "failed to load cuBLASLt (tried {}); set {CUBLASLT_LIBRARY_ENV} to override",
        candidates.join(", ")
    )))
}

fn check_cublas(code: CublasStatus, call: &'static str) -> BackendResult<()> {
    if code == CUBLAS_STATUS_SUCCESS {
        Ok(())
    } else {
        Err(BackendError::BackendCall { call, status: code })
    }
}

fn cublas_op(transpose: Transpose) -> i32 {
    match transpose {
        Transpose::None => CUBLAS_OP_N,
        Transpose::Transpose => CUBLAS_OP_T,
    }
}

/// Descriptor and layouts for one shape key, destroyed on drop.
pub struct CublasLtBundle {
    api: Arc<LtApi>,
    // Raw handles stored as usize so bundles can be shared across threads.
    desc: usize,
    a_layout: usize,
    b_layout: usize,
    c_layout: usize,
}

impl Drop for CublasLtBundle {
    fn drop(&mut self) {
        let fns = &self.api.fns;
        // SAFETY: Each handle was created for this bundle and is destroyed once; zero means unset.
        unsafe {
            for layout in [self.c_layout, self.b_layout, self.a_layout] {
                if layout != 0 {
                    let _ = (fns.matrix_layout_destroy)(layout as CublasLtMatrixLayout);
                }
            }
            if self.desc != 0 {
                let _ = (fns.matmul_desc_destroy)(self.desc as CublasLtMatmulDesc);
            }
        }
    }
}

impl CublasLtBundle {
    fn create(api: Arc<LtApi>, plan: &GemmPlan) -> BackendResult<Self> {
        // Partially built bundles release what they hold through Drop.
        let mut bundle = CublasLtBundle {
            api: Arc::clone(&api),
            desc: 0,
            a_layout: 0,
            b_layout: 0,
            c_layout: 0,
        };
        let fns = &api.fns;
        let mut desc: CublasLtMatmulDesc = std::ptr::null_mut();
        // SAFETY: Out pointer is valid; enum values follow the cuBLASLt headers.
        unsafe {
            check_cublas(
                (fns.matmul_desc_create)(&mut desc, CUBLAS_COMPUTE_32I, CUDA_R_32F),
                "cublasLtMatmulDescCreate",
            )?;
        }
        bundle.desc = desc as usize;

        let transa = cublas_op(plan.transa);
        let transb = cublas_op(plan.transb);
        let Epilogue::Bias(bias) = plan.epilogue;
        let epilogue = CUBLASLT_EPILOGUE_BIAS;
        let bias_ptr = bias.0 as *const c_void;
        // SAFETY: Attribute buffers live for the duration of each call and match the attribute sizes.
        unsafe {
            set_attribute(fns, desc, CUBLASLT_MATMUL_DESC_TRANSA, &transa)?;
            set_attribute(fns, desc, CUBLASLT_MATMUL_DESC_TRANSB, &transb)?;
            set_attribute(fns, desc, CUBLASLT_MATMUL_DESC_EPILOGUE, &epilogue)?;
            set_attribute(fns, desc, CUBLASLT_MATMUL_DESC_BIAS_POINTER, &bias_ptr)?;
        }

        bundle.a_layout = create_layout(fns, &plan.a)?;
        bundle.b_layout = create_layout(fns, &plan.b)?;
        bundle.c_layout = create_layout(fns, &plan.c)?;
        Ok(bundle)
    }
}

unsafe fn set_attribute<T>(
    fns: &LtFns,
    desc: CublasLtMatmulDesc,
    attr: i32,
    value: &T,
) -> BackendResult<()> {
    check_cublas(
        (fns.matmul_desc_set_attribute)(
            desc,
            attr,
            value as *const T as *const c_void,
            std::mem::size_of::<T>(),
        ),
        "cublasLtMatmulDescSetAttribute",
    )
}

fn create_layout(fns: &LtFns, layout: &MatrixLayout) -> BackendResult<usize> {
    if layout.dtype != DType::Si8 {
        return Err(BackendError::unsupported(
            "cublasLtMatrixLayoutCreate",
            format!("only s8 layouts are built, got {}", layout.dtype),
        ));
    }
    let ld = i64::try_from(layout.ld)
        .map_err(|_| BackendError::invalid_operand("leading dimension exceeds i64"))?;
    let mut handle: CublasLtMatrixLayout = std::ptr::null_mut();
    // SAFETY: Out pointer is valid; extents describe a column-major int8 matrix.
    unsafe {
        check_cublas(
            (fns.matrix_layout_create)(
                &mut handle,
                CUDA_R_8I,
                layout.rows as u64,
                layout.cols as u64,
                ld,
            ),
            "cublasLtMatrixLayoutCreate",
        )?;
    }
    Ok(handle as usize)
}

/// Generic int8 GEMM through cuBLASLt on the shared [`CudaDriver`] context.
pub struct CublasLtBackend {
    api: Arc<LtApi>,
    driver: Arc<CudaDriver>,
    handle: usize,
}

impl Drop for CublasLtBackend {
    fn drop(&mut self) {
        if self.handle != 0 {
            // SAFETY: Handle was created by this backend and is destroyed once.
            let _ = unsafe { (self.api.fns.destroy)(self.handle as CublasLtHandle) };
            self.handle = 0;
        }
    }
}

impl CublasLtBackend {
    pub fn new() -> BackendResult<Self> {
        let driver = device::driver()?;
        let api = api()?;
        driver.ensure_current()?;
        let mut handle: CublasLtHandle = std::ptr::null_mut();
        // SAFETY: Out pointer is valid.
        unsafe {
            check_cublas((api.fns.create)(&mut handle), "cublasLtCreate")?;
        }
        Ok(Self {
            api,
            driver,
            handle: handle as usize,
        })
    }

    pub fn driver(&self) -> &Arc<CudaDriver> {
        &self.driver
    }
}

impl GenericBackend for CublasLtBackend {
    type Bundle = CublasLtBundle;

    fn backend_name(&self) -> &str {
        "cublaslt"
    }

    fn create_bundle(&self, plan: &GemmPlan) -> BackendResult<CublasLtBundle> {
        self.driver.ensure_current()?;
        CublasLtBundle::create(Arc::clone(&self.api), plan)
    }

    fn matmul(
        &self,
        stream: StreamHandle,
        bundle: &CublasLtBundle,
        call: &GemmCall,
    ) -> BackendResult<()> {
        self.driver.ensure_current()?;
        let c_layout = bundle.c_layout as CublasLtMatrixLayout;
        // SAFETY: Operand pointers are live device allocations matching the bundle's layouts;
        // alpha and beta are host scalars read before the call returns.
        unsafe {
            check_cublas(
                (self.api.fns.matmul)(
                    self.handle as CublasLtHandle,
                    bundle.desc as CublasLtMatmulDesc,
                    &call.alpha as *const f32 as *const c_void,
                    call.a.0 as *const c_void,
                    bundle.a_layout as CublasLtMatrixLayout,
                    call.b.0 as *const c_void,
                    bundle.b_layout as CublasLtMatrixLayout,
                    &call.beta as *const f32 as *const c_void,
                    call.c.0 as *const c_void,
                    c_layout,
                    call.c.0 as *mut c_void,
                    c_layout,
                    std::ptr::null(),
                    std::ptr::null_mut(),
                    0,
                    stream.0 as CUstream,
                ),
                "cublasLtMatmul",
            )
        }
    }
}
