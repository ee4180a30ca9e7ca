//! The strided n-dimensional tensor and its shape algebra.
//!
//! A [`Tensor`] is metadata only: dtype, shape, byte strides, the operator
//! that produced it, and a slot describing where its bytes live inside the
//! owning [`Context`](crate::Context). Views alias another tensor's storage
//! at a byte offset and never own bytes themselves.

mod dtype;

pub use dtype::Dtype;

use crate::graph::Op;

/// Maximum tensor rank. Trailing dimensions are 1.
pub const MAX_DIMS: usize = 4;
/// Maximum number of source operands an operator may reference.
pub const MAX_SRC: usize = 6;
/// Tensor names are truncated to this many bytes.
pub const MAX_NAME: usize = 64;
/// Fixed size of the opaque per-op parameter block.
pub const MAX_OP_PARAMS: usize = 64;

/// Index of a tensor inside its owning context. All references between
/// tensors (sources, views, gradients) are expressed as ids that resolve
/// through the same context, which pins every participant to one arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TensorId(pub(crate) u32);

impl TensorId {
    #[inline]
    pub(crate) fn index(self) -> usize {
        self.0 as usize
    }
}

/// Where a tensor's bytes live.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum DataSlot {
    /// Offset into the context's main arena.
    Main { offs: usize },
    /// Offset into pushed scratch buffer `buf`.
    Scratch { buf: usize, offs: usize },
}

#[derive(Debug, Clone)]
pub struct Tensor {
    pub dtype: Dtype,
    pub n_dims: usize,
    /// Elements per dimension; unused trailing dimensions are 1.
    pub ne: [usize; MAX_DIMS],
    /// Byte stride per dimension. `nb[0]` is the block byte size, so the
    /// byte offset of element `i0` along dimension 0 is
    /// `(i0 / block_size) * nb[0]`.
    pub nb: [usize; MAX_DIMS],
    pub op: Op,
    pub op_params: [u8; MAX_OP_PARAMS],
    pub src: [Option<TensorId>; MAX_SRC],
    pub view_src: Option<TensorId>,
    pub view_offs: usize,
    pub grad: Option<TensorId>,
    pub is_param: bool,
    pub(crate) data: Option<DataSlot>,
    pub name: String,
}

impl Tensor {
    pub(crate) fn new(dtype: Dtype, n_dims: usize, ne: &[usize]) -> Self {
        assert!((1..=MAX_DIMS).contains(&n_dims), "tensor rank {n_dims} out of range");
        assert!(
            ne[0] % dtype.block_size() == 0,
            "ne[0] = {} not divisible by the {:?} block size {}",
            ne[0],
            dtype,
            dtype.block_size()
        );
        let mut shape = [1usize; MAX_DIMS];
        shape[..n_dims].copy_from_slice(&ne[..n_dims]);

        let mut nb = [0usize; MAX_DIMS];
        nb[0] = dtype.type_size();
        nb[1] = nb[0] * (shape[0] / dtype.block_size());
        for i in 2..MAX_DIMS {
            nb[i] = nb[i - 1] * shape[i - 1];
        }

        Tensor {
            dtype,
            n_dims,
            ne: shape,
            nb,
            op: Op::None,
            op_params: [0u8; MAX_OP_PARAMS],
            src: [None; MAX_SRC],
            view_src: None,
            view_offs: 0,
            grad: None,
            is_param: false,
            data: None,
            name: String::new(),
        }
    }

    #[inline]
    pub fn nelements(&self) -> usize {
        self.ne[0] * self.ne[1] * self.ne[2] * self.ne[3]
    }

    #[inline]
    pub fn nrows(&self) -> usize {
        self.ne[1] * self.ne[2] * self.ne[3]
    }

    /// Bytes spanned by this tensor's elements, honoring strides.
    pub fn nbytes(&self) -> usize {
        let mut bytes = self.ne[0] / self.dtype.block_size() * self.nb[0];
        for i in 1..MAX_DIMS {
            bytes += (self.ne[i] - 1) * self.nb[i];
        }
        bytes
    }

    /// Byte size of one logical row (`ne[0]` elements).
    #[inline]
    pub fn row_size(&self) -> usize {
        self.dtype.row_size(self.ne[0])
    }

    pub fn is_contiguous(&self) -> bool {
        let bs = self.dtype.block_size();
        self.nb[0] == self.dtype.type_size()
            && self.nb[1] == self.nb[0] * (self.ne[0] / bs)
            && self.nb[2] == self.nb[1] * self.ne[1]
            && self.nb[3] == self.nb[2] * self.ne[2]
    }

    pub fn is_transposed(&self) -> bool {
        self.nb[0] > self.nb[1]
    }

    pub fn is_permuted(&self) -> bool {
        self.nb[0] > self.nb[1] || self.nb[1] > self.nb[2] || self.nb[2] > self.nb[3]
    }

    pub fn is_scalar(&self) -> bool {
        self.nelements() == 1
    }

    pub fn is_vector(&self) -> bool {
        self.ne[1] == 1 && self.ne[2] == 1 && self.ne[3] == 1
    }

    pub fn is_matrix(&self) -> bool {
        self.ne[2] == 1 && self.ne[3] == 1
    }

    pub fn same_shape(&self, other: &Tensor) -> bool {
        self.ne == other.ne
    }

    /// Broadcast rule for elementwise ops: every destination axis must be a
    /// whole multiple of the source axis.
    pub fn can_repeat_to(&self, dst: &Tensor) -> bool {
        dst.ne[0] % self.ne[0] == 0
            && dst.ne[1] % self.ne[1] == 0
            && dst.ne[2] % self.ne[2] == 0
            && dst.ne[3] % self.ne[3] == 0
    }

    /// Matching contracted dimension, broadcast-compatible batch axes.
    pub fn can_mul_mat(a: &Tensor, b: &Tensor) -> bool {
        a.ne[0] == b.ne[0] && b.ne[2] % a.ne[2] == 0 && b.ne[3] % a.ne[3] == 0
    }

    /// Unravel a flat element index into per-dimension coordinates.
    pub fn unravel(&self, mut i: usize) -> [usize; MAX_DIMS] {
        let i0 = i % self.ne[0];
        i /= self.ne[0];
        let i1 = i % self.ne[1];
        i /= self.ne[1];
        let i2 = i % self.ne[2];
        let i3 = i / self.ne[2];
        [i0, i1, i2, i3]
    }

    /// Byte offset of element `(i0, i1, i2, i3)` relative to the tensor's
    /// own data slot.
    #[inline]
    pub fn elem_offset(&self, idx: [usize; MAX_DIMS]) -> usize {
        idx[0] / self.dtype.block_size() * self.nb[0]
            + idx[1] * self.nb[1]
            + idx[2] * self.nb[2]
            + idx[3] * self.nb[3]
    }

    pub fn set_name(&mut self, name: &str) {
        let mut end = name.len().min(MAX_NAME);
        while !name.is_char_boundary(end) {
            end -= 1;
        }
        self.name = name[..end].to_string();
    }

    pub fn set_op_params(&mut self, params: &[u8]) {
        assert!(params.len() <= MAX_OP_PARAMS);
        self.op_params[..params.len()].copy_from_slice(params);
    }

    pub fn op_params_i32(&self, idx: usize) -> i32 {
        let at = idx * 4;
        i32::from_ne_bytes(self.op_params[at..at + 4].try_into().unwrap())
    }

    pub fn set_op_params_i32(&mut self, idx: usize, value: i32) {
        let at = idx * 4;
        self.op_params[at..at + 4].copy_from_slice(&value.to_ne_bytes());
    }

    pub fn op_params_f32(&self, idx: usize) -> f32 {
        let at = idx * 4;
        f32::from_ne_bytes(self.op_params[at..at + 4].try_into().unwrap())
    }

    pub fn set_op_params_f32(&mut self, idx: usize, value: f32) {
        let at = idx * 4;
        self.op_params[at..at + 4].copy_from_slice(&value.to_ne_bytes());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn contiguous_strides() {
        let t = Tensor::new(Dtype::F32, 3, &[4, 3, 2]);
        assert_eq!(t.nb, [4, 16, 48, 96]);
        assert!(t.is_contiguous());
        assert!(!t.is_transposed());
        assert_eq!(t.nelements(), 24);
        assert_eq!(t.nbytes(), 96);
    }

    #[test]
    fn quantized_row_strides() {
        let t = Tensor::new(Dtype::Q4_0, 2, &[64, 3]);
        assert_eq!(t.nb[0], 18);
        assert_eq!(t.nb[1], 36);
        assert_eq!(t.nbytes(), 108);
    }

    #[test]
    #[should_panic(expected = "not divisible")]
    fn rejects_partial_blocks() {
        let _ = Tensor::new(Dtype::Q4_0, 1, &[33]);
    }

    #[test]
    fn name_truncates_at_64_bytes() {
        let mut t = Tensor::new(Dtype::F32, 1, &[1]);
        t.set_name(&"x".repeat(100));
        assert_eq!(t.name.len(), MAX_NAME);
    }
}
