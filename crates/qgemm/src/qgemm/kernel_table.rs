//! Dispatch table mapping `(kernel name, device, activation rank)` to a kernel.
//!
//! The execution engine looks kernels up by name when it runs a compiled
//! program; the quantized GEMM registers itself for activation ranks 2 and 3.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use crate::backend::context::ExecutionContext;
use crate::backend::driver::StreamHandle;
use crate::backend::spec::{BackendError, BackendResult};
use crate::tensor::TensorRef;

use super::{QgemmArgs, QgemmKernel};

/// Name the graph compiler emits for quantized GEMM custom calls.
pub const QGEMM_KERNEL_NAME: &str = "ral_pdll_qgemm";
pub const QGEMM_DEVICE: &str = "gpu";
pub const QGEMM_SUPPORTED_RANKS: [usize; 2] = [2, 3];

const KERNEL_TABLE_RESOURCE: &str = "ral.kernel_table";

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
struct KernelKey {
    name: String,
    device: String,
    rank: usize,
}

#[derive(Default)]
pub struct KernelTable {
    kernels: RwLock<HashMap<KernelKey, Arc<dyn QgemmKernel>>>,
}

impl KernelTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Table shared by every caller of `ctx`.
    pub fn from_context(ctx: &ExecutionContext) -> BackendResult<Arc<Self>> {
        ctx.get_or_create_resource(KERNEL_TABLE_RESOURCE, KernelTable::new)
    }

    /// Registers `kernel`, replacing any kernel already bound to the same key.
    pub fn register(
        &self,
        name: impl Into<String>,
        device: impl Into<String>,
        rank: usize,
        kernel: Arc<dyn QgemmKernel>,
    ) -> BackendResult<()> {
        let key = KernelKey {
            name: name.into(),
            device: device.into(),
            rank,
        };
        let mut kernels = self
            .kernels
            .write()
            .map_err(|_| BackendError::execution("kernel table lock poisoned"))?;
        if kernels.insert(key.clone(), kernel).is_some() {
            log::warn!(
                "replaced kernel {} on {} for rank {}",
                key.name,
                key.device,
                key.rank
            );
        }
        Ok(())
    }

    /// Binds `kernel` to `ral_pdll_qgemm` on the GPU for every supported rank.
    pub fn register_qgemm(&self, kernel: Arc<dyn QgemmKernel>) -> BackendResult<()> {
        for rank in QGEMM_SUPPORTED_RANKS {
            self.register(QGEMM_KERNEL_NAME, QGEMM_DEVICE, rank, Arc::clone(&kernel))?;
        }
        Ok(())
    }

    pub fn lookup(&self, name: &str, device: &str, rank: usize) -> Option<Arc<dyn QgemmKernel>> {
        let kernels = self.kernels.read().ok()?;
        kernels
            .get(&KernelKey {
                name: name.to_string(),
                device: device.to_string(),
                rank,
            })
            .cloned()
    }

    /// Registered `(name, device, rank)` triples in sorted order.
    pub fn registered(&self) -> Vec<(String, String, usize)> {
        let Ok(kernels) = self.kernels.read() else {
            return Vec::new();
        };
        let mut keys: Vec<_> = kernels.keys().cloned().collect();
        keys.sort();
        keys.into_iter()
            .map(|key| (key.name, key.device, key.rank))
            .collect()
    }

    /// Runs the quantized GEMM kernel registered for the activation's rank.
    ///
    /// Every error leaving this entry point is also signalled on `ctx`.
    pub fn launch_qgemm(
        &self,
        ctx: &ExecutionContext,
        stream: StreamHandle,
        args: &QgemmArgs<'_>,
    ) -> BackendResult<TensorRef> {
        let rank = args.activation.rank();
        let Some(kernel) = self.lookup(QGEMM_KERNEL_NAME, QGEMM_DEVICE, rank) else {
            let err = BackendError::unsupported(
                QGEMM_KERNEL_NAME,
                format!("no kernel registered for activation rank {rank}"),
            );
            ctx.signal_error(err.kind(), err.to_string());
            return Err(err);
        };
        kernel.launch(ctx, stream, args).map_err(|err| {
            ctx.signal_error(err.kind(), format!("{QGEMM_KERNEL_NAME}: {err}"));
            err
        })
    }
}
