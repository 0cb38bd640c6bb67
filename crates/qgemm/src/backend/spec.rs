use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Scalar element types understood by the quantized GEMM contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DType {
    Si8,
    Si32,
    F32,
}

impl DType {
    /// Returns the storage size in bytes.
    pub fn size_in_bytes(self) -> usize {
        match self {
            DType::Si8 => 1,
            DType::Si32 | DType::F32 => 4,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            DType::Si8 => "s8",
            DType::Si32 => "s32",
            DType::F32 => "f32",
        }
    }
}

impl fmt::Display for DType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Severity attached to errors signalled through the execution context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum ErrorKind {
    /// Aborts the current program execution.
    Failure,
    /// A requested feature is not available in this build or on this device.
    Unsupported,
}

/// Backend error surfaced to higher layers.
#[derive(Debug, Error)]
pub enum BackendError {
    #[error("invalid operand: {0}")]
    InvalidOperand(String),
    #[error("{op} is not supported: {reason}")]
    Unsupported { op: &'static str, reason: String },
    #[error("backend call {call} failed with status {status}")]
    BackendCall { call: &'static str, status: i32 },
    #[error("driver call {call} failed with status {status}")]
    Driver { call: &'static str, status: i32 },
    #[error("resource '{name}' exists with a different type")]
    ResourceType { name: String },
    #[error("backend execution failure: {message}")]
    Execution { message: String },
}

impl BackendError {
    pub fn invalid_operand(message: impl Into<String>) -> Self {
        BackendError::InvalidOperand(message.into())
    }

    pub fn unsupported(op: &'static str, reason: impl Into<String>) -> Self {
        BackendError::Unsupported {
            op,
            reason: reason.into(),
        }
    }

    pub fn execution(message: impl Into<String>) -> Self {
        BackendError::Execution {
            message: message.into(),
        }
    }

    /// Kind used when this error is reported through the execution context.
    pub fn kind(&self) -> ErrorKind {
        match self {
            BackendError::Unsupported { .. } => ErrorKind::Unsupported,
            _ => ErrorKind::Failure,
        }
    }
}

/// Convenience alias for results returned by backend routines.
pub type BackendResult<T> = Result<T, BackendError>;

/// Fatal diagnostic recorded by [`crate::backend::context::ExecutionContext::signal_error`].
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize)]
#[error("{kind:?}: {message}")]
pub struct ContextError {
    pub kind: ErrorKind,
    pub message: String,
}
