use std::fmt;

use serde::Serialize;
use smallvec::SmallVec;

use crate::backend::shape_helpers::checked_element_count_or_error;
use crate::backend::spec::{BackendError, BackendResult, DType};

/// Raw device address. Zero is the null pointer.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize)]
pub struct DevicePtr(pub u64);

impl DevicePtr {
    pub const NULL: DevicePtr = DevicePtr(0);

    pub fn is_null(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Debug for DevicePtr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DevicePtr({:#x})", self.0)
    }
}

/// Stable identifier the graph compiler assigns to a logical buffer.
///
/// Unlike a device address, a token is never reused for a different logical
/// tensor within one execution context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct BufferToken(pub u64);

/// Identity used to key caches on "the same buffer".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum BufferIdentity {
    Token(u64),
    Address(u64),
}

/// Non-owning view over a device buffer: element type, extents and data pointer.
#[derive(Clone, PartialEq, Eq)]
pub struct TensorRef {
    pub dtype: DType,
    pub dims: SmallVec<[usize; 4]>,
    pub data: DevicePtr,
    pub token: Option<BufferToken>,
}

impl TensorRef {
    pub fn new(dtype: DType, dims: impl IntoIterator<Item = usize>, data: DevicePtr) -> Self {
        Self {
            dtype,
            dims: dims.into_iter().collect(),
            data,
            token: None,
        }
    }

    /// Rank-0 view.
    pub fn scalar(dtype: DType, data: DevicePtr) -> Self {
        Self::new(dtype, [], data)
    }

    /// Shape-only view with no backing storage.
    pub fn empty(dtype: DType, dims: impl IntoIterator<Item = usize>) -> Self {
        Self::new(dtype, dims, DevicePtr::NULL)
    }

    pub fn with_token(mut self, token: BufferToken) -> Self {
        self.token = Some(token);
        self
    }

    pub fn rank(&self) -> usize {
        self.dims.len()
    }

    pub fn num_elements(&self) -> BackendResult<usize> {
        checked_element_count_or_error(&self.dims, || {
            BackendError::invalid_operand(format!(
                "element count overflow for dims {:?}",
                self.dims
            ))
        })
    }

    pub fn is_empty(&self) -> bool {
        self.dims.iter().any(|dim| *dim == 0)
    }

    /// Token when the compiler provided one, otherwise the raw address.
    pub fn identity(&self) -> BufferIdentity {
        match self.token {
            Some(BufferToken(token)) => BufferIdentity::Token(token),
            None => BufferIdentity::Address(self.data.0),
        }
    }
}

impl fmt::Debug for TensorRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TensorRef")
            .field("dtype", &self.dtype)
            .field("dims", &self.dims.as_slice())
            .field("data", &self.data)
            .field("token", &self.token)
            .finish()
    }
}
