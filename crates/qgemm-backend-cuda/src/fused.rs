//! Optional vendor fused int8 GEMM kernel.
//!
//! The kernel library is named by `QGEMM_FUSED_GEMM_LIBRARY` and must export
//! `qgemm_fused_gemm` with the C signature below, returning `false` when it
//! does not handle a problem:
//!
//! ```c
//! bool qgemm_fused_gemm(void* stream,
//!                       int a_dtype, bool a_trans, const void* a, int a_rows, int a_cols,
//!                       int b_dtype, bool b_trans, const void* b, int b_rows, int b_cols,
//!                       int c_dtype, void* c, int c_rows, int c_cols,
//!                       int batch, bool a_batch_shared, bool b_batch_shared,
//!                       const float* alpha, const float* beta, const void* bias);
//! ```
//!
//! Dtype codes: 0 = f32, 1 = s8, 2 = s32.

use std::ffi::c_void;
use std::sync::Arc;

use libloading::Library;
use qgemm::backend::shape_helpers::dim_to_i32_or_error;
use qgemm::env;
use qgemm::qgemm::{FusedBackend, FusedGemmArgs, FusedOperand};
use qgemm::{BackendError, BackendResult, DType};

use crate::device::{self, load_symbol, CudaDriver};

/// Environment variable naming the fused kernel library.
pub const FUSED_GEMM_LIBRARY_ENV: &str = "QGEMM_FUSED_GEMM_LIBRARY";

type FusedGemmFn = unsafe extern "C" fn(
    stream: *mut c_void,
    a_dtype: i32,
    a_trans: bool,
    a: *const c_void,
    a_rows: i32,
    a_cols: i32,
    b_dtype: i32,
    b_trans: bool,
    b: *const c_void,
    b_rows: i32,
    b_cols: i32,
    c_dtype: i32,
    c: *mut c_void,
    c_rows: i32,
    c_cols: i32,
    batch: i32,
    a_batch_shared: bool,
    b_batch_shared: bool,
    alpha: *const f32,
    beta: *const f32,
    bias: *const c_void,
) -> bool;

fn dtype_code(dtype: DType) -> i32 {
    match dtype {
        DType::F32 => 0,
        DType::Si8 => 1,
        DType::Si32 => 2,
    }
}

struct Operand {
    dtype: i32,
    transposed: bool,
    rows: i32,
    cols: i32,
}

impl Operand {
    fn from_fused(operand: &FusedOperand) -> Option<Self> {
        Some(Self {
            dtype: dtype_code(operand.dtype),
            transposed: operand.transposed,
            rows: dim_to_i32_or_error(operand.rows, || ()).ok()?,
            cols: dim_to_i32_or_error(operand.cols, || ()).ok()?,
        })
    }
}

pub struct VendorFusedBackend {
    _lib: Library,
    gemm: FusedGemmFn,
    driver: Arc<CudaDriver>,
}

impl VendorFusedBackend {
    /// Loads the kernel library; an error means the fused path is unavailable.
    pub fn load() -> BackendResult<Self> {
        let path = env::library_override(FUSED_GEMM_LIBRARY_ENV).ok_or_else(|| {
            BackendError::unsupported(
                "fused_gemm",
                format!("{FUSED_GEMM_LIBRARY_ENV} is not set"),
            )
        })?;
        let driver = device::driver()?;
        // SAFETY: Dynamic library probe only; no symbols are invoked at this stage.
        let lib = unsafe { Library::new(&path) }.map_err(|err| {
            BackendError::execution(format!(
                "failed to load {FUSED_GEMM_LIBRARY_ENV}={path}: {err}"
            ))
        })?;
        let gemm: FusedGemmFn = load_symbol(&lib, b"qgemm_fused_gemm\0")?;
        log::info!("loaded fused int8 gemm from {path}");
        Ok(Self {
            _lib: lib,
            gemm,
            driver,
        })
    }

    /// `Some` when the library is configured and loads, logging why otherwise.
    pub fn try_load() -> Option<Arc<dyn FusedBackend>> {
        match Self::load() {
            Ok(backend) => Some(Arc::new(backend)),
            Err(err) => {
                log::warn!("fused int8 gemm disabled: {err}");
                None
            }
        }
    }
}

impl FusedBackend for VendorFusedBackend {
    fn backend_name(&self) -> &str {
        "vendor-fused"
    }

    fn gemm(&self, args: &FusedGemmArgs) -> bool {
        let (Some(a), Some(b), Some(c)) = (
            Operand::from_fused(&args.a),
            Operand::from_fused(&args.b),
            Operand::from_fused(&args.c),
        ) else {
            log::debug!("fused gemm skipped: extents exceed i32");
            return false;
        };
        let Ok(batch) = i32::try_from(args.batch) else {
            return false;
        };
        if let Err(err) = self.driver.ensure_current() {
            log::warn!("fused gemm skipped: {err}");
            return false;
        }
        // SAFETY: Operand pointers are live device allocations of the given extents and the
        // scalar pointers reference locals that outlive the call.
        unsafe {
            (self.gemm)(
                args.stream.as_ptr(),
                a.dtype,
                a.transposed,
                args.a.ptr.0 as *const c_void,
                a.rows,
                a.cols,
                b.dtype,
                b.transposed,
                args.b.ptr.0 as *const c_void,
                b.rows,
                b.cols,
                c.dtype,
                args.c.ptr.0 as *mut c_void,
                c.rows,
                c.cols,
                batch,
                false,
                false,
                &args.alpha,
                &args.beta,
                args.bias.0 as *const c_void,
            )
        }
    }
}
