//! Quantized int8 GEMM with fused bias-add and per-tensor requantization.
//!
//! [`QuantizedMatmul`] resolves the combined scale through a [`ScaleCache`],
//! tries an optional [`FusedBackend`], and otherwise runs the always-present
//! [`GenericBackend`] with handle bundles from a [`DescriptorCache`].

mod backend;
mod cache;
mod descriptor_cache;
mod kernel_table;
mod plan;
mod requant;
mod scale_cache;

use std::sync::Arc;

use serde::Serialize;
use smallvec::SmallVec;

pub use backend::{FusedBackend, FusedGemmArgs, FusedOperand, GemmCall, GenericBackend};
pub use cache::{CachePolicy, CacheStats};
pub use descriptor_cache::{DescriptorCache, ShapeKey};
pub use kernel_table::{KernelTable, QGEMM_DEVICE, QGEMM_KERNEL_NAME, QGEMM_SUPPORTED_RANKS};
pub use plan::{ComputeType, Epilogue, GemmPlan, MatrixLayout, Transpose};
pub use requant::requantize_s8;
pub use scale_cache::{load_combined_scale, CombinedScale, ScaleBuffers, ScaleCache, ScaleKey};

use crate::backend::context::ExecutionContext;
use crate::backend::driver::{DeviceDriver, StreamHandle};
use crate::backend::shape_helpers::checked_element_count_or_error;
use crate::backend::spec::{BackendError, BackendResult, DType, ErrorKind};
use crate::env;
use crate::profiling;
use crate::tensor::{DevicePtr, TensorRef};

/// Named context resource holding the shared scale cache.
pub const SCALE_CACHE_RESOURCE: &str = "qgemm.gpu.scale_cache.s8";

/// Named context resource holding the descriptor cache of `backend`.
pub fn descriptor_cache_resource(backend: &str) -> String {
    format!("qgemm.gpu.descriptor_cache.{backend}.s8")
}

/// Dispatcher settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct QgemmConfig {
    pub fused_enabled: bool,
    pub descriptor_cache: CachePolicy,
    pub scale_cache: CachePolicy,
}

impl Default for QgemmConfig {
    fn default() -> Self {
        Self {
            fused_enabled: true,
            descriptor_cache: CachePolicy::Unbounded,
            scale_cache: CachePolicy::Unbounded,
        }
    }
}

impl QgemmConfig {
    /// Reads `QGEMM_DISABLE_FUSED`, `QGEMM_DESCRIPTOR_CACHE_CAPACITY` and
    /// `QGEMM_SCALE_CACHE_CAPACITY`.
    pub fn from_env() -> Self {
        Self {
            fused_enabled: !env::fused_disabled(),
            descriptor_cache: CachePolicy::from_capacity(env::descriptor_cache_capacity()),
            scale_cache: CachePolicy::from_capacity(env::scale_cache_capacity()),
        }
    }

    pub fn with_fused_enabled(mut self, enabled: bool) -> Self {
        self.fused_enabled = enabled;
        self
    }

    pub fn with_descriptor_cache(mut self, policy: CachePolicy) -> Self {
        self.descriptor_cache = policy;
        self
    }

    pub fn with_scale_cache(mut self, policy: CachePolicy) -> Self {
        self.scale_cache = policy;
        self
    }
}

/// Scale and zero-point scalars of one quantized tensor.
#[derive(Debug, Clone, Copy)]
pub struct QuantParams<'a> {
    pub scale: &'a TensorRef,
    pub zero_point: &'a TensorRef,
}

/// Operands of `ral_pdll_qgemm`.
///
/// `weight` is `[n, k]` (stored transposed relative to the activation),
/// `bias` is `[n]`, and the activation is `[..., k]`.
#[derive(Debug, Clone, Copy)]
pub struct QgemmArgs<'a> {
    pub activation: &'a TensorRef,
    pub weight: &'a TensorRef,
    pub bias: &'a TensorRef,
    pub input: QuantParams<'a>,
    pub weight_quant: QuantParams<'a>,
    pub output: QuantParams<'a>,
}

/// Object-safe kernel interface stored in a [`KernelTable`].
pub trait QgemmKernel: Send + Sync {
    fn launch(
        &self,
        ctx: &ExecutionContext,
        stream: StreamHandle,
        args: &QgemmArgs<'_>,
    ) -> BackendResult<TensorRef>;
}

/// Normalized problem dimensions.
#[derive(Debug, Clone, PartialEq, Eq)]
struct QgemmProblem {
    m: usize,
    k: usize,
    n: usize,
    result_dims: SmallVec<[usize; 4]>,
    empty: bool,
}

impl QgemmProblem {
    fn from_args(args: &QgemmArgs<'_>) -> BackendResult<Self> {
        expect_operand(args.activation, "activation", DType::Si8, None)?;
        expect_operand(args.weight, "weight", DType::Si8, Some(2))?;
        expect_operand(args.bias, "bias", DType::Si8, Some(1))?;
        expect_operand(args.input.scale, "input scale", DType::F32, Some(0))?;
        expect_operand(args.weight_quant.scale, "weight scale", DType::F32, Some(0))?;
        expect_operand(args.output.scale, "output scale", DType::F32, Some(0))?;
        expect_operand(args.input.zero_point, "input zero point", DType::Si32, Some(0))?;
        expect_operand(
            args.weight_quant.zero_point,
            "weight zero point",
            DType::Si32,
            Some(0),
        )?;
        expect_operand(args.output.zero_point, "output zero point", DType::Si32, Some(0))?;

        let rank = args.activation.rank();
        if rank < 2 {
            return Err(BackendError::invalid_operand(format!(
                "activation must have rank >= 2, got rank {rank}"
            )));
        }
        let n = args.weight.dims[0];
        let k = args.weight.dims[1];
        let leading = &args.activation.dims[..rank - 1];
        if args.activation.dims[rank - 1] != k {
            return Err(BackendError::invalid_operand(format!(
                "activation inner dimension {} does not match weight k={k}",
                args.activation.dims[rank - 1]
            )));
        }
        if args.bias.dims[0] != n {
            return Err(BackendError::invalid_operand(format!(
                "bias length {} does not match weight n={n}",
                args.bias.dims[0]
            )));
        }
        let m = checked_element_count_or_error(leading, || {
            BackendError::invalid_operand("activation leading dimensions overflow")
        })?;

        let mut result_dims: SmallVec<[usize; 4]> = leading.iter().copied().collect();
        result_dims.push(n);
        Ok(Self {
            m,
            k,
            n,
            result_dims,
            empty: args.activation.is_empty() || args.weight.is_empty(),
        })
    }
}

fn expect_operand(
    tensor: &TensorRef,
    name: &str,
    dtype: DType,
    rank: Option<usize>,
) -> BackendResult<()> {
    if tensor.dtype != dtype {
        return Err(BackendError::invalid_operand(format!(
            "{name} must be {dtype}, got {}",
            tensor.dtype
        )));
    }
    if let Some(rank) = rank {
        if tensor.rank() != rank {
            return Err(BackendError::invalid_operand(format!(
                "{name} must have rank {rank}, got rank {}",
                tensor.rank()
            )));
        }
    }
    Ok(())
}

/// Two-tier quantized GEMM dispatcher.
pub struct QuantizedMatmul<G: GenericBackend> {
    generic: Arc<G>,
    fused: Option<Arc<dyn FusedBackend>>,
    descriptors: Arc<DescriptorCache<G::Bundle>>,
    scales: Arc<ScaleCache>,
    config: QgemmConfig,
}

impl<G: GenericBackend> QuantizedMatmul<G> {
    pub fn new(
        generic: Arc<G>,
        fused: Option<Arc<dyn FusedBackend>>,
        descriptors: Arc<DescriptorCache<G::Bundle>>,
        scales: Arc<ScaleCache>,
        config: QgemmConfig,
    ) -> Self {
        Self {
            generic,
            fused,
            descriptors,
            scales,
            config,
        }
    }

    /// Builds a dispatcher whose caches are owned by `ctx` as named resources.
    ///
    /// The lookup happens once here; launches never consult the registry.
    pub fn from_context(
        ctx: &ExecutionContext,
        generic: Arc<G>,
        fused: Option<Arc<dyn FusedBackend>>,
        config: QgemmConfig,
    ) -> BackendResult<Self> {
        let descriptors = ctx.get_or_create_resource(
            &descriptor_cache_resource(generic.backend_name()),
            || DescriptorCache::<G::Bundle>::new(config.descriptor_cache),
        )?;
        let scales = ctx.get_or_create_resource(SCALE_CACHE_RESOURCE, || {
            ScaleCache::new(config.scale_cache)
        })?;
        Ok(Self::new(generic, fused, descriptors, scales, config))
    }

    pub fn config(&self) -> &QgemmConfig {
        &self.config
    }

    pub fn descriptor_cache(&self) -> &Arc<DescriptorCache<G::Bundle>> {
        &self.descriptors
    }

    pub fn scale_cache(&self) -> &Arc<ScaleCache> {
        &self.scales
    }

    /// Runs `output = requant(activation x weight^T + bias)` and returns the
    /// freshly allocated output. The caller owns the returned buffer.
    pub fn quantized_matmul(
        &self,
        ctx: &ExecutionContext,
        stream: StreamHandle,
        args: &QgemmArgs<'_>,
    ) -> BackendResult<TensorRef> {
        let problem = QgemmProblem::from_args(args)?;
        if problem.empty {
            log::debug!("qgemm: early return for empty operand");
            profiling::cache_event("qgemm.empty_operand");
            return Ok(TensorRef::empty(DType::Si8, problem.result_dims));
        }

        let driver = ctx.driver().as_ref();
        let scale = self.resolve_scale(driver, stream, args)?;
        log::debug!(
            "qgemm: zero points ignored (symmetric per-tensor quantization only) m={} k={} n={}",
            problem.m,
            problem.k,
            problem.n
        );

        let bytes = problem
            .m
            .checked_mul(problem.n)
            .ok_or_else(|| BackendError::invalid_operand("qgemm output size overflow"))?;
        let out = driver.allocate(bytes)?;
        let output = TensorRef::new(DType::Si8, problem.result_dims.iter().copied(), out);

        if self.try_fused(driver, stream, args, &problem, scale, out) {
            return Ok(output);
        }

        match self.run_generic(stream, args, &problem, scale, out) {
            Ok(()) => Ok(output),
            Err(err) => {
                ctx.signal_error(
                    ErrorKind::Failure,
                    format!(
                        "qgemm fallback on '{}' failed: {err}",
                        self.generic.backend_name()
                    ),
                );
                if let Err(free_err) = driver.deallocate(out) {
                    log::warn!("qgemm: failed to release output after error: {free_err}");
                }
                Err(err)
            }
        }
    }

    fn resolve_scale(
        &self,
        driver: &dyn DeviceDriver,
        stream: StreamHandle,
        args: &QgemmArgs<'_>,
    ) -> BackendResult<CombinedScale> {
        let key = ScaleKey {
            input_scale: args.input.scale.identity(),
            weight_scale: args.weight_quant.scale.identity(),
            output_scale: args.output.scale.identity(),
        };
        self.scales.resolve(key, || {
            load_combined_scale(
                driver,
                stream,
                ScaleBuffers {
                    input: args.input.scale.data,
                    weight: args.weight_quant.scale.data,
                    output: args.output.scale.data,
                },
            )
        })
    }

    /// `true` when the fused kernel produced the output.
    fn try_fused(
        &self,
        driver: &dyn DeviceDriver,
        stream: StreamHandle,
        args: &QgemmArgs<'_>,
        problem: &QgemmProblem,
        scale: CombinedScale,
        out: DevicePtr,
    ) -> bool {
        let Some(fused) = self.fused.as_ref() else {
            return false;
        };
        if !self.config.fused_enabled {
            return false;
        }
        let native = match driver.native_stream_handle(stream) {
            Ok(native) => native,
            Err(err) => {
                log::warn!("qgemm: fused path unavailable, no native stream: {err}");
                return false;
            }
        };
        let QgemmProblem { m, k, n, .. } = *problem;
        let fused_args = FusedGemmArgs {
            stream: native,
            a: FusedOperand {
                dtype: DType::Si8,
                transposed: false,
                ptr: args.activation.data,
                rows: m,
                cols: k,
            },
            b: FusedOperand {
                dtype: DType::Si8,
                transposed: true,
                ptr: args.weight.data,
                rows: n,
                cols: k,
            },
            c: FusedOperand {
                dtype: DType::Si8,
                transposed: false,
                ptr: out,
                rows: m,
                cols: n,
            },
            batch: 1,
            alpha: scale.value(),
            beta: 1.0,
            bias: args.bias.data,
        };
        let _scope =
            profiling::backend_scope_with_work("qgemm.fused", || profiling::gemm_work(m, n, k));
        if fused.gemm(&fused_args) {
            return true;
        }
        log::debug!(
            "qgemm: fused backend '{}' declined m={m} k={k} n={n}, falling back to '{}'",
            fused.backend_name(),
            self.generic.backend_name()
        );
        false
    }

    fn run_generic(
        &self,
        stream: StreamHandle,
        args: &QgemmArgs<'_>,
        problem: &QgemmProblem,
        scale: CombinedScale,
        out: DevicePtr,
    ) -> BackendResult<()> {
        let QgemmProblem { m, k, n, .. } = *problem;
        // Column-major library: C^T(n x m) = W(n x k) * X^T(k x m), weight as the left operand.
        let key = ShapeKey {
            m: n,
            k,
            n: m,
            lda: k,
            ldb: k,
            ldc: n,
            transpose_a: true,
            transpose_b: false,
            bias: args.bias.data,
        };
        let bundle = self.descriptors.get_or_create(key, |key| {
            self.generic.create_bundle(&GemmPlan::from_key(key))
        })?;
        let _scope =
            profiling::backend_scope_with_work("qgemm.generic", || profiling::gemm_work(m, n, k));
        self.generic.matmul(
            stream,
            &bundle,
            &GemmCall {
                a: args.weight.data,
                b: args.activation.data,
                c: out,
                alpha: scale.value(),
                beta: 0.0,
            },
        )
    }
}

impl<G: GenericBackend> QgemmKernel for QuantizedMatmul<G> {
    fn launch(
        &self,
        ctx: &ExecutionContext,
        stream: StreamHandle,
        args: &QgemmArgs<'_>,
    ) -> BackendResult<TensorRef> {
        self.quantized_matmul(ctx, stream, args)
    }
}
