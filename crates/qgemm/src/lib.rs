//! Quantized int8 GEMM execution path for compiled inference programs.
//!
//! The crate provides the backend-neutral pieces: tensor views, the device
//! driver contract, the execution context, the descriptor and scale caches,
//! and the fused-or-generic dispatcher. Concrete drivers and GEMM libraries
//! live in the `qgemm-backend-*` crates.

pub mod backend;
pub mod env;
pub mod profiling;
pub mod qgemm;
pub mod tensor;

pub use backend::context::ExecutionContext;
pub use backend::driver::{DeviceDriver, NativeStream, StreamHandle};
pub use backend::spec::{BackendError, BackendResult, ContextError, DType, ErrorKind};
pub use qgemm::{
    KernelTable, QgemmArgs, QgemmConfig, QgemmKernel, QuantParams, QuantizedMatmul,
};
pub use tensor::{BufferIdentity, BufferToken, DevicePtr, TensorRef};
