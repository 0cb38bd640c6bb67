//! Reference int8 GEMM backends running on [`HostDriver`] memory.
//!
//! [`RefLtBackend`] follows the column-major conventions of a vendor GEMM
//! library and executes whatever [`GemmPlan`] it is handed. [`RefFusedBackend`]
//! mirrors a fused int8 kernel with its own alignment limits.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use qgemm::backend::shape_helpers::dim_to_i32_or_error;
use qgemm::qgemm::{
    requantize_s8, Epilogue, FusedBackend, FusedGemmArgs, GemmCall, GemmPlan, GenericBackend,
    MatrixLayout,
};
use qgemm::{BackendError, BackendResult, DType, StreamHandle};

use crate::driver::HostDriver;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RefStats {
    pub bundles_created: u64,
    pub calls: u64,
    pub declined: u64,
}

/// Validated plan standing in for the vendor descriptor objects.
#[derive(Debug)]
pub struct RefLtBundle {
    plan: GemmPlan,
}

impl RefLtBundle {
    pub fn plan(&self) -> &GemmPlan {
        &self.plan
    }
}

pub struct RefLtBackend {
    driver: Arc<HostDriver>,
    bundles_created: AtomicU64,
    calls: AtomicU64,
}

impl RefLtBackend {
    pub fn new(driver: Arc<HostDriver>) -> Self {
        Self {
            driver,
            bundles_created: AtomicU64::new(0),
            calls: AtomicU64::new(0),
        }
    }

    pub fn stats(&self) -> RefStats {
        RefStats {
            bundles_created: self.bundles_created.load(Ordering::Relaxed),
            calls: self.calls.load(Ordering::Relaxed),
            declined: 0,
        }
    }
}

/// Bytes spanned by a column-major layout.
fn layout_span(layout: &MatrixLayout) -> usize {
    if layout.rows == 0 || layout.cols == 0 {
        return 0;
    }
    (layout.cols - 1) * layout.ld + layout.rows
}

fn check_layout(name: &str, layout: &MatrixLayout) -> BackendResult<()> {
    if layout.dtype != DType::Si8 {
        return Err(BackendError::unsupported(
            "ref_lt_matmul",
            format!("{name} must be s8, got {}", layout.dtype),
        ));
    }
    if layout.ld < layout.rows.max(1) {
        return Err(BackendError::invalid_operand(format!(
            "{name} leading dimension {} is smaller than its {} rows",
            layout.ld, layout.rows
        )));
    }
    layout
        .cols
        .checked_mul(layout.ld)
        .map(|_| ())
        .ok_or_else(|| BackendError::invalid_operand(format!("{name} layout overflows")))
}

impl GenericBackend for RefLtBackend {
    type Bundle = RefLtBundle;

    fn backend_name(&self) -> &str {
        "ref-lt"
    }

    fn create_bundle(&self, plan: &GemmPlan) -> BackendResult<RefLtBundle> {
        check_layout("A", &plan.a)?;
        check_layout("B", &plan.b)?;
        check_layout("C", &plan.c)?;
        self.bundles_created.fetch_add(1, Ordering::Relaxed);
        Ok(RefLtBundle { plan: plan.clone() })
    }

    fn matmul(
        &self,
        _stream: StreamHandle,
        bundle: &RefLtBundle,
        call: &GemmCall,
    ) -> BackendResult<()> {
        self.calls.fetch_add(1, Ordering::Relaxed);
        let plan = &bundle.plan;
        let Epilogue::Bias(bias_ptr) = plan.epilogue;

        let a = self.driver.read_i8(call.a, layout_span(&plan.a))?;
        let b = self.driver.read_i8(call.b, layout_span(&plan.b))?;
        let bias = self.driver.read_i8(bias_ptr, plan.m)?;
        let c_span = layout_span(&plan.c);
        let mut c = if call.beta == 0.0 {
            vec![0i8; c_span]
        } else {
            self.driver.read_i8(call.c, c_span)?
        };

        for col in 0..plan.n {
            for row in 0..plan.m {
                // int32 accumulation wraps like the vendor kernels.
                let acc = (0..plan.k).fold(0i32, |acc, kk| {
                    let x = a[plan.a_offset(row, kk)] as i32;
                    let w = b[plan.b_offset(kk, col)] as i32;
                    let prod = x.wrapping_mul(w);
                    acc.wrapping_add(prod)
                });
                let idx = plan.c.offset(row, col);
                let prior = if call.beta == 0.0 {
                    0.0
                } else {
                    call.beta * c[idx] as f32
                };
                c[idx] = requantize_s8(acc, call.alpha, prior + bias[row] as f32);
            }
        }
        self.driver.write_i8(call.c, &c)
    }
}

/// Fused int8 kernel: row-major `A`, transposed `B`, row-major `C`.
///
/// Declines unless `k` and `n` are multiples of four, `batch == 1`, and every
/// extent fits the kernel's 32-bit indexing.
pub struct RefFusedBackend {
    driver: Arc<HostDriver>,
    calls: AtomicU64,
    declined: AtomicU64,
}

const FUSED_ALIGNMENT: usize = 4;

impl RefFusedBackend {
    pub fn new(driver: Arc<HostDriver>) -> Self {
        Self {
            driver,
            calls: AtomicU64::new(0),
            declined: AtomicU64::new(0),
        }
    }

    pub fn stats(&self) -> RefStats {
        RefStats {
            bundles_created: 0,
            calls: self.calls.load(Ordering::Relaxed),
            declined: self.declined.load(Ordering::Relaxed),
        }
    }

    fn supports(args: &FusedGemmArgs) -> Result<(usize, usize, usize), String> {
        let (a, b, c) = (&args.a, &args.b, &args.c);
        if [a.dtype, b.dtype, c.dtype].iter().any(|dtype| *dtype != DType::Si8) {
            return Err("operands must be s8".to_string());
        }
        if a.transposed || !b.transposed || c.transposed {
            return Err("expects row-major A and C with transposed B".to_string());
        }
        if args.batch != 1 {
            return Err(format!("batch {} is not supported", args.batch));
        }
        let (m, k, n) = (a.rows, a.cols, b.rows);
        if b.cols != k || c.rows != m || c.cols != n {
            return Err(format!(
                "inconsistent extents a={}x{} b={}x{} c={}x{}",
                a.rows, a.cols, b.rows, b.cols, c.rows, c.cols
            ));
        }
        if k % FUSED_ALIGNMENT != 0 || n % FUSED_ALIGNMENT != 0 {
            return Err(format!("k={k} n={n} are not multiples of {FUSED_ALIGNMENT}"));
        }
        for dim in [m, k, n] {
            dim_to_i32_or_error(dim, || format!("extent {dim} exceeds i32"))?;
        }
        Ok((m, k, n))
    }

    fn run(&self, args: &FusedGemmArgs, m: usize, k: usize, n: usize) -> BackendResult<()> {
        let a = self.driver.read_i8(args.a.ptr, m * k)?;
        let b = self.driver.read_i8(args.b.ptr, n * k)?;
        let bias = self.driver.read_i8(args.bias, n)?;
        let mut c = vec![0i8; m * n];
        for (i, out_row) in c.chunks_exact_mut(n.max(1)).enumerate().take(m) {
            let a_row = &a[i * k..(i + 1) * k];
            for (j, out) in out_row.iter_mut().enumerate() {
                let b_row = &b[j * k..(j + 1) * k];
                let acc = a_row.iter().zip(b_row).fold(0i32, |acc, (x, w)| {
                    acc.wrapping_add((*x as i32).wrapping_mul(*w as i32))
                });
                *out = requantize_s8(acc, args.alpha, args.beta * bias[j] as f32);
            }
        }
        self.driver.write_i8(args.c.ptr, &c)
    }
}

impl FusedBackend for RefFusedBackend {
    fn backend_name(&self) -> &str {
        "ref-fused"
    }

    fn gemm(&self, args: &FusedGemmArgs) -> bool {
        self.calls.fetch_add(1, Ordering::Relaxed);
        let (m, k, n) = match Self::supports(args) {
            Ok(dims) => dims,
            Err(reason) => {
                log::debug!("ref fused gemm declined: {reason}");
                self.declined.fetch_add(1, Ordering::Relaxed);
                return false;
            }
        };
        match self.run(args, m, k, n) {
            Ok(()) => true,
            Err(err) => {
                log::warn!("ref fused gemm failed: {err}");
                self.declined.fetch_add(1, Ordering::Relaxed);
                false
            }
        }
    }
}
