//! Backend-neutral description of the handle bundle built for a [`ShapeKey`].
//!
//! All layouts are column-major, matching vendor GEMM libraries. A generic
//! backend turns a `GemmPlan` into its own descriptor objects.

use serde::Serialize;

use crate::backend::spec::DType;
use crate::tensor::DevicePtr;

use super::descriptor_cache::ShapeKey;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum Transpose {
    None,
    Transpose,
}

impl Transpose {
    pub fn from_flag(transposed: bool) -> Self {
        if transposed {
            Transpose::Transpose
        } else {
            Transpose::None
        }
    }
}

/// Accumulator precision of the matmul operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum ComputeType {
    I32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum Epilogue {
    /// Adds `bias[row]` to every column of the result.
    Bias(DevicePtr),
}

/// Column-major matrix layout: `rows x cols` with leading dimension `ld`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct MatrixLayout {
    pub dtype: DType,
    pub rows: usize,
    pub cols: usize,
    pub ld: usize,
}

impl MatrixLayout {
    /// Element offset of `(row, col)`.
    #[inline]
    pub fn offset(&self, row: usize, col: usize) -> usize {
        col * self.ld + row
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct GemmPlan {
    pub compute: ComputeType,
    pub scale_type: DType,
    pub transa: Transpose,
    pub transb: Transpose,
    pub epilogue: Epilogue,
    pub a: MatrixLayout,
    pub b: MatrixLayout,
    pub c: MatrixLayout,
    pub m: usize,
    pub n: usize,
    pub k: usize,
}

impl GemmPlan {
    /// Fixed int8 operands, int32 accumulation and f32 scaling.
    pub fn from_key(key: &ShapeKey) -> Self {
        let transa = Transpose::from_flag(key.transpose_a);
        let transb = Transpose::from_flag(key.transpose_b);
        let (a_rows, a_cols) = match transa {
            Transpose::None => (key.m, key.k),
            Transpose::Transpose => (key.k, key.m),
        };
        let (b_rows, b_cols) = match transb {
            Transpose::None => (key.k, key.n),
            Transpose::Transpose => (key.n, key.k),
        };
        Self {
            compute: ComputeType::I32,
            scale_type: DType::F32,
            transa,
            transb,
            epilogue: Epilogue::Bias(key.bias),
            a: MatrixLayout {
                dtype: DType::Si8,
                rows: a_rows,
                cols: a_cols,
                ld: key.lda,
            },
            b: MatrixLayout {
                dtype: DType::Si8,
                rows: b_rows,
                cols: b_cols,
                ld: key.ldb,
            },
            c: MatrixLayout {
                dtype: DType::Si8,
                rows: key.m,
                cols: key.n,
                ld: key.ldc,
            },
            m: key.m,
            n: key.n,
            k: key.k,
        }
    }

    /// Element offset of logical `op(A)[row, kk]` inside A's storage.
    #[inline]
    pub fn a_offset(&self, row: usize, kk: usize) -> usize {
        match self.transa {
            Transpose::None => self.a.offset(row, kk),
            Transpose::Transpose => self.a.offset(kk, row),
        }
    }

    /// Element offset of logical `op(B)[kk, col]` inside B's storage.
    #[inline]
    pub fn b_offset(&self, kk: usize, col: usize) -> usize {
        match self.transb {
            Transpose::None => self.b.offset(kk, col),
            Transpose::Transpose => self.b.offset(col, kk),
        }
    }
}
