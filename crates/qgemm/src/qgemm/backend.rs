//! Backend capabilities behind the dispatcher.
//!
//! A [`FusedBackend`] is an optional vendor kernel tried first; a
//! [`GenericBackend`] wraps a vendor GEMM library and is always available.

use crate::backend::driver::{NativeStream, StreamHandle};
use crate::backend::spec::{BackendResult, DType};
use crate::tensor::DevicePtr;

use super::plan::GemmPlan;

/// Operands of one generic GEMM call, `C = alpha * op(A) op(B) + beta * C + bias`.
#[derive(Debug, Clone, Copy)]
pub struct GemmCall {
    pub a: DevicePtr,
    pub b: DevicePtr,
    pub c: DevicePtr,
    pub alpha: f32,
    pub beta: f32,
}

pub trait GenericBackend: Send + Sync {
    /// Library handle bundle built once per distinct shape key.
    type Bundle: Send + Sync + 'static;

    fn backend_name(&self) -> &str;

    fn create_bundle(&self, plan: &GemmPlan) -> BackendResult<Self::Bundle>;

    /// Issues the GEMM on `stream`. A non-success library status is returned
    /// as [`crate::backend::spec::BackendError::BackendCall`].
    fn matmul(
        &self,
        stream: StreamHandle,
        bundle: &Self::Bundle,
        call: &GemmCall,
    ) -> BackendResult<()>;
}

/// One operand of a fused GEMM: `rows x cols` as seen by the kernel.
#[derive(Debug, Clone, Copy)]
pub struct FusedOperand {
    pub dtype: DType,
    pub transposed: bool,
    pub ptr: DevicePtr,
    pub rows: usize,
    pub cols: usize,
}

/// Arguments of a fused int8 GEMM with requantization and bias epilogue:
/// `C[i, j] = sat(round(alpha * sum_k A[i, k] * B[k, j] + beta * bias[j]))`.
///
/// `a` is row-major `m x k`; `b` is column-major `k x n` (stored as `n x k`,
/// `transposed = true`); `c` is row-major `m x n`.
#[derive(Debug, Clone, Copy)]
pub struct FusedGemmArgs {
    pub stream: NativeStream,
    pub a: FusedOperand,
    pub b: FusedOperand,
    pub c: FusedOperand,
    pub batch: usize,
    pub alpha: f32,
    pub beta: f32,
    pub bias: DevicePtr,
}

pub trait FusedBackend: Send + Sync {
    fn backend_name(&self) -> &str;

    /// Runs the kernel. `false` means the kernel declined or failed and the
    /// caller must fall back; it is never an error by itself.
    fn gemm(&self, args: &FusedGemmArgs) -> bool;
}
