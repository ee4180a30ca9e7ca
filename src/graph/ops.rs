//! Operator constructors.
//!
//! Each tensor-returning operator allocates its output in the context,
//! stamps `op`, `op_params`, and `src[]`, and — when any source carries a
//! gradient — allocates a shape-matching `grad` sibling. Shape and dtype
//! contracts are checked here, at build time; nothing is validated again
//! during execution.

use super::{Op, UnaryKind};
use crate::context::Context;
use crate::error::ComputeResult;
use crate::tensor::{Dtype, Tensor, TensorId, MAX_DIMS};

/// Pooling flavor for [`Context::pool_1d`] / [`Context::pool_2d`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolKind {
    Max,
    Avg,
}

fn n_dims_from(ne: &[usize; MAX_DIMS], at_least: usize) -> usize {
    let mut n = MAX_DIMS;
    while n > at_least && ne[n - 1] == 1 {
        n -= 1;
    }
    n
}

pub(crate) fn conv_output_size(ins: usize, ks: usize, s: usize, p: usize, d: usize) -> usize {
    (ins + 2 * p - d * (ks - 1) - 1) / s + 1
}

impl Context {
    /// Marks a leaf as trainable and gives it a zero-initialized gradient
    /// accumulator.
    pub fn set_param(&mut self, id: TensorId) -> ComputeResult<()> {
        assert!(self.tensor(id).op == Op::None, "parameters must be leaves");
        self.tensors[id.index()].is_param = true;
        if self.tensor(id).grad.is_none() {
            let grad = self.dup_tensor(id)?;
            self.tensors[id.index()].grad = Some(grad);
        }
        Ok(())
    }

    fn stamp(&mut self, id: TensorId, op: Op, srcs: &[TensorId]) -> ComputeResult<TensorId> {
        {
            let t = &mut self.tensors[id.index()];
            t.op = op;
            for (slot, s) in t.src.iter_mut().zip(srcs) {
                *slot = Some(*s);
            }
        }
        let is_node = srcs.iter().any(|s| self.tensor(*s).grad.is_some());
        if is_node {
            let grad = self.dup_tensor(id)?;
            self.tensors[id.index()].grad = Some(grad);
        }
        Ok(id)
    }

    fn unary_like(&mut self, op: Op, a: TensorId) -> ComputeResult<TensorId> {
        let out = self.dup_tensor(a)?;
        self.stamp(out, op, &[a])
    }

    // -- elementwise ------------------------------------------------------

    pub fn dup(&mut self, a: TensorId) -> ComputeResult<TensorId> {
        self.unary_like(Op::Dup, a)
    }

    fn binary(&mut self, op: Op, a: TensorId, b: TensorId) -> ComputeResult<TensorId> {
        assert!(
            self.tensor(b).can_repeat_to(self.tensor(a)),
            "{} operand shapes incompatible: {:?} does not divide {:?}",
            op.name(),
            self.tensor(b).ne,
            self.tensor(a).ne
        );
        assert_eq!(self.tensor(b).dtype, Dtype::F32, "{} second operand must be f32", op.name());
        assert!(
            self.tensor(a).dtype == Dtype::F32
                || (op == Op::Add && self.tensor(a).dtype.is_quantized()),
            "{} does not support a {:?} first operand",
            op.name(),
            self.tensor(a).dtype
        );
        let out = self.dup_tensor(a)?;
        self.stamp(out, op, &[a, b])
    }

    pub fn add(&mut self, a: TensorId, b: TensorId) -> ComputeResult<TensorId> {
        self.binary(Op::Add, a, b)
    }

    pub fn sub(&mut self, a: TensorId, b: TensorId) -> ComputeResult<TensorId> {
        self.binary(Op::Sub, a, b)
    }

    pub fn mul(&mut self, a: TensorId, b: TensorId) -> ComputeResult<TensorId> {
        self.binary(Op::Mul, a, b)
    }

    pub fn div(&mut self, a: TensorId, b: TensorId) -> ComputeResult<TensorId> {
        self.binary(Op::Div, a, b)
    }

    pub fn sqr(&mut self, a: TensorId) -> ComputeResult<TensorId> {
        self.unary_like(Op::Sqr, a)
    }

    pub fn sqrt(&mut self, a: TensorId) -> ComputeResult<TensorId> {
        self.unary_like(Op::Sqrt, a)
    }

    pub fn scale(&mut self, a: TensorId, s: f32) -> ComputeResult<TensorId> {
        let out = self.unary_like(Op::Scale, a)?;
        self.tensor_mut(out).set_op_params_f32(0, s);
        Ok(out)
    }

    pub fn clamp(&mut self, a: TensorId, min: f32, max: f32) -> ComputeResult<TensorId> {
        let out = self.unary_like(Op::Clamp, a)?;
        self.tensor_mut(out).set_op_params_f32(0, min);
        self.tensor_mut(out).set_op_params_f32(1, max);
        Ok(out)
    }

    pub fn unary(&mut self, a: TensorId, kind: UnaryKind) -> ComputeResult<TensorId> {
        let out = self.unary_like(Op::Unary, a)?;
        self.tensor_mut(out).set_op_params_i32(0, kind.to_i32());
        Ok(out)
    }

    pub fn abs(&mut self, a: TensorId) -> ComputeResult<TensorId> {
        self.unary(a, UnaryKind::Abs)
    }

    pub fn sgn(&mut self, a: TensorId) -> ComputeResult<TensorId> {
        self.unary(a, UnaryKind::Sgn)
    }

    pub fn neg(&mut self, a: TensorId) -> ComputeResult<TensorId> {
        self.unary(a, UnaryKind::Neg)
    }

    pub fn step(&mut self, a: TensorId) -> ComputeResult<TensorId> {
        self.unary(a, UnaryKind::Step)
    }

    pub fn tanh(&mut self, a: TensorId) -> ComputeResult<TensorId> {
        self.unary(a, UnaryKind::Tanh)
    }

    pub fn elu(&mut self, a: TensorId) -> ComputeResult<TensorId> {
        self.unary(a, UnaryKind::Elu)
    }

    pub fn relu(&mut self, a: TensorId) -> ComputeResult<TensorId> {
        self.unary(a, UnaryKind::Relu)
    }

    pub fn gelu(&mut self, a: TensorId) -> ComputeResult<TensorId> {
        self.unary(a, UnaryKind::Gelu)
    }

    pub fn gelu_quick(&mut self, a: TensorId) -> ComputeResult<TensorId> {
        self.unary(a, UnaryKind::GeluQuick)
    }

    pub fn silu(&mut self, a: TensorId) -> ComputeResult<TensorId> {
        self.unary(a, UnaryKind::Silu)
    }

    /// dx for silu: `a` is the forward input, `b` the output gradient.
    pub fn silu_back(&mut self, a: TensorId, b: TensorId) -> ComputeResult<TensorId> {
        assert!(self.tensor(a).same_shape(self.tensor(b)));
        let out = self.dup_tensor(a)?;
        self.stamp(out, Op::SiluBack, &[a, b])
    }

    // -- reductions -------------------------------------------------------

    pub fn sum(&mut self, a: TensorId) -> ComputeResult<TensorId> {
        let out = self.new_tensor_1d(Dtype::F32, 1)?;
        self.stamp(out, Op::Sum, &[a])
    }

    pub fn sum_rows(&mut self, a: TensorId) -> ComputeResult<TensorId> {
        let ne = self.tensor(a).ne;
        let n_dims = self.tensor(a).n_dims;
        let out = self.push_tensor(Tensor::new(Dtype::F32, n_dims, &[1, ne[1], ne[2], ne[3]]))?;
        self.stamp(out, Op::SumRows, &[a])
    }

    pub fn mean(&mut self, a: TensorId) -> ComputeResult<TensorId> {
        let ne = self.tensor(a).ne;
        let n_dims = self.tensor(a).n_dims;
        let out = self.push_tensor(Tensor::new(Dtype::F32, n_dims, &[1, ne[1], ne[2], ne[3]]))?;
        self.stamp(out, Op::Mean, &[a])
    }

    /// Broadcasts `a` to the shape of `b`.
    pub fn repeat(&mut self, a: TensorId, b: TensorId) -> ComputeResult<TensorId> {
        assert!(
            self.tensor(a).can_repeat_to(self.tensor(b)),
            "repeat: {:?} does not divide {:?}",
            self.tensor(a).ne,
            self.tensor(b).ne
        );
        let (dtype, n_dims, ne) = {
            let t = self.tensor(b);
            (self.tensor(a).dtype, t.n_dims, t.ne)
        };
        let out = self.push_tensor(Tensor::new(dtype, n_dims, &ne))?;
        self.stamp(out, Op::Repeat, &[a, b])
    }

    // -- normalization ----------------------------------------------------

    pub fn norm(&mut self, a: TensorId, eps: f32) -> ComputeResult<TensorId> {
        let out = self.unary_like(Op::Norm, a)?;
        self.tensor_mut(out).set_op_params_f32(0, eps);
        Ok(out)
    }

    pub fn rms_norm(&mut self, a: TensorId, eps: f32) -> ComputeResult<TensorId> {
        let out = self.unary_like(Op::RmsNorm, a)?;
        self.tensor_mut(out).set_op_params_f32(0, eps);
        Ok(out)
    }

    /// dx for rms_norm: `a` is the forward input, `b` the output gradient.
    pub fn rms_norm_back(&mut self, a: TensorId, b: TensorId, eps: f32) -> ComputeResult<TensorId> {
        assert!(self.tensor(a).same_shape(self.tensor(b)));
        let out = self.dup_tensor(a)?;
        let out = self.stamp(out, Op::RmsNormBack, &[a, b])?;
        self.tensor_mut(out).set_op_params_f32(0, eps);
        Ok(out)
    }

    // -- matrix products --------------------------------------------------

    pub fn mul_mat(&mut self, a: TensorId, b: TensorId) -> ComputeResult<TensorId> {
        assert!(
            Tensor::can_mul_mat(self.tensor(a), self.tensor(b)),
            "mul_mat shapes incompatible: {:?} x {:?}",
            self.tensor(a).ne,
            self.tensor(b).ne
        );
        let ne = {
            let (a, b) = (self.tensor(a), self.tensor(b));
            [a.ne[1], b.ne[1], b.ne[2], b.ne[3]]
        };
        let n_dims = n_dims_from(&ne, 2);
        let out = self.push_tensor(Tensor::new(Dtype::F32, n_dims, &ne))?;
        self.stamp(out, Op::MulMat, &[a, b])
    }

    /// `out[i, j] = Σ_k a[i, k] · b[j, k]` — the rank-expansion used by the
    /// matmul backward rule.
    pub fn out_prod(&mut self, a: TensorId, b: TensorId) -> ComputeResult<TensorId> {
        assert_eq!(
            self.tensor(a).ne[1],
            self.tensor(b).ne[1],
            "out_prod contraction axis mismatch"
        );
        let ne = {
            let (a, b) = (self.tensor(a), self.tensor(b));
            [a.ne[0], b.ne[0], b.ne[2], b.ne[3]]
        };
        let n_dims = n_dims_from(&ne, 2);
        let out = self.push_tensor(Tensor::new(Dtype::F32, n_dims, &ne))?;
        self.stamp(out, Op::OutProd, &[a, b])
    }

    // -- structural -------------------------------------------------------

    /// Copies `a` into `b`'s storage (converting dtype if they differ).
    /// The result aliases `b`.
    pub fn cpy(&mut self, a: TensorId, b: TensorId) -> ComputeResult<TensorId> {
        assert_eq!(
            self.tensor(a).nelements(),
            self.tensor(b).nelements(),
            "cpy element counts differ"
        );
        let out = self.view_tensor(b)?;
        self.stamp(out, Op::Cpy, &[a, b])
    }

    /// Materializes a contiguous copy of `a`.
    pub fn cont(&mut self, a: TensorId) -> ComputeResult<TensorId> {
        let (dtype, n_dims, ne) = {
            let t = self.tensor(a);
            (t.dtype, t.n_dims, t.ne)
        };
        let out = self.push_tensor(Tensor::new(dtype, n_dims, &ne))?;
        self.stamp(out, Op::Cont, &[a])
    }

    pub fn reshape(&mut self, a: TensorId, ne: &[usize]) -> ComputeResult<TensorId> {
        {
            let t = self.tensor(a);
            assert!(t.is_contiguous(), "reshape requires a contiguous tensor");
            assert_eq!(t.nelements(), ne.iter().product::<usize>(), "reshape element count");
        }
        let dtype = self.tensor(a).dtype;
        let out = self.view_tensor_impl(a, dtype, ne.len(), ne, 0, &[])?;
        self.stamp(out, Op::Reshape, &[a])
    }

    pub fn reshape_2d(&mut self, a: TensorId, ne0: usize, ne1: usize) -> ComputeResult<TensorId> {
        self.reshape(a, &[ne0, ne1])
    }

    pub fn reshape_3d(
        &mut self,
        a: TensorId,
        ne0: usize,
        ne1: usize,
        ne2: usize,
    ) -> ComputeResult<TensorId> {
        self.reshape(a, &[ne0, ne1, ne2])
    }

    pub fn view_1d(&mut self, a: TensorId, ne0: usize, offs: usize) -> ComputeResult<TensorId> {
        let dtype = self.tensor(a).dtype;
        let out = self.view_tensor_impl(a, dtype, 1, &[ne0], offs, &[])?;
        self.stamp(out, Op::View, &[a])
    }

    pub fn view_2d(
        &mut self,
        a: TensorId,
        ne0: usize,
        ne1: usize,
        nb1: usize,
        offs: usize,
    ) -> ComputeResult<TensorId> {
        let dtype = self.tensor(a).dtype;
        let out = self.view_tensor_impl(a, dtype, 2, &[ne0, ne1], offs, &[nb1])?;
        self.stamp(out, Op::View, &[a])
    }

    pub fn view_3d(
        &mut self,
        a: TensorId,
        ne0: usize,
        ne1: usize,
        ne2: usize,
        nb1: usize,
        nb2: usize,
        offs: usize,
    ) -> ComputeResult<TensorId> {
        let dtype = self.tensor(a).dtype;
        let out = self.view_tensor_impl(a, dtype, 3, &[ne0, ne1, ne2], offs, &[nb1, nb2])?;
        self.stamp(out, Op::View, &[a])
    }

    #[allow(clippy::too_many_arguments)]
    pub fn view_4d(
        &mut self,
        a: TensorId,
        ne0: usize,
        ne1: usize,
        ne2: usize,
        ne3: usize,
        nb1: usize,
        nb2: usize,
        nb3: usize,
        offs: usize,
    ) -> ComputeResult<TensorId> {
        let dtype = self.tensor(a).dtype;
        let out =
            self.view_tensor_impl(a, dtype, 4, &[ne0, ne1, ne2, ne3], offs, &[nb1, nb2, nb3])?;
        self.stamp(out, Op::View, &[a])
    }

    pub fn permute(
        &mut self,
        a: TensorId,
        axis0: usize,
        axis1: usize,
        axis2: usize,
        axis3: usize,
    ) -> ComputeResult<TensorId> {
        let axes = [axis0, axis1, axis2, axis3];
        {
            let mut seen = [false; MAX_DIMS];
            for &ax in &axes {
                assert!(ax < MAX_DIMS && !seen[ax], "invalid permutation {axes:?}");
                seen[ax] = true;
            }
        }
        let out = self.view_tensor(a)?;
        {
            let src = self.tensor(a).clone();
            let t = self.tensor_mut(out);
            for i in 0..MAX_DIMS {
                t.ne[axes[i]] = src.ne[i];
                t.nb[axes[i]] = src.nb[i];
            }
            t.n_dims = src.n_dims;
        }
        let out = self.stamp(out, Op::Permute, &[a])?;
        for (i, &ax) in axes.iter().enumerate() {
            self.tensor_mut(out).set_op_params_i32(i, ax as i32);
        }
        Ok(out)
    }

    pub fn transpose(&mut self, a: TensorId) -> ComputeResult<TensorId> {
        let out = self.view_tensor(a)?;
        {
            let t = self.tensor_mut(out);
            t.ne.swap(0, 1);
            t.nb.swap(0, 1);
        }
        self.stamp(out, Op::Transpose, &[a])
    }

    /// Writes `b` over the region of `a` described by the byte strides and
    /// offset; the rest of `a` is copied through unchanged.
    pub fn set(
        &mut self,
        a: TensorId,
        b: TensorId,
        nb1: usize,
        nb2: usize,
        nb3: usize,
        offset: usize,
    ) -> ComputeResult<TensorId> {
        assert!(self.tensor(b).nbytes() + offset <= self.tensor(a).nbytes());
        let out = self.dup_tensor(a)?;
        let out = self.stamp(out, Op::Set, &[a, b])?;
        let t = self.tensor_mut(out);
        t.set_op_params_i32(0, nb1 as i32);
        t.set_op_params_i32(1, nb2 as i32);
        t.set_op_params_i32(2, nb3 as i32);
        t.set_op_params_i32(3, offset as i32);
        Ok(out)
    }

    // -- selection / masking ----------------------------------------------

    pub fn get_rows(&mut self, a: TensorId, b: TensorId) -> ComputeResult<TensorId> {
        assert!(self.tensor(a).is_matrix(), "get_rows source must be a matrix");
        assert!(
            self.tensor(b).is_vector() && self.tensor(b).dtype == Dtype::I32,
            "get_rows indices must be an i32 vector"
        );
        let ne0 = self.tensor(a).ne[0];
        let n_rows = self.tensor(b).ne[0];
        let out = self.new_tensor_2d(Dtype::F32, ne0, n_rows)?;
        self.stamp(out, Op::GetRows, &[a, b])
    }

    /// Scatter-adds the rows of `a` back into a zero tensor shaped like
    /// `c`, at the row indices `b`. Inverse of [`get_rows`](Self::get_rows).
    pub fn get_rows_back(
        &mut self,
        a: TensorId,
        b: TensorId,
        c: TensorId,
    ) -> ComputeResult<TensorId> {
        assert!(self.tensor(a).is_matrix() && self.tensor(c).is_matrix());
        assert_eq!(self.tensor(a).ne[0], self.tensor(c).ne[0]);
        let (ne0, ne1) = {
            let c = self.tensor(c);
            (c.ne[0], c.ne[1])
        };
        let out = self.new_tensor_2d(Dtype::F32, ne0, ne1)?;
        self.stamp(out, Op::GetRowsBack, &[a, b])
    }

    pub fn diag_mask_inf(&mut self, a: TensorId, n_past: usize) -> ComputeResult<TensorId> {
        let out = self.unary_like(Op::DiagMaskInf, a)?;
        self.tensor_mut(out).set_op_params_i32(0, n_past as i32);
        Ok(out)
    }

    pub fn diag_mask_zero(&mut self, a: TensorId, n_past: usize) -> ComputeResult<TensorId> {
        let out = self.unary_like(Op::DiagMaskZero, a)?;
        self.tensor_mut(out).set_op_params_i32(0, n_past as i32);
        Ok(out)
    }

    pub fn soft_max(&mut self, a: TensorId) -> ComputeResult<TensorId> {
        self.unary_like(Op::SoftMax, a)
    }

    /// dx for softmax: `a` is the output gradient, `b` the forward output.
    pub fn soft_max_back(&mut self, a: TensorId, b: TensorId) -> ComputeResult<TensorId> {
        assert!(self.tensor(a).same_shape(self.tensor(b)));
        let out = self.dup_tensor(a)?;
        self.stamp(out, Op::SoftMaxBack, &[a, b])
    }

    // -- position / attention ---------------------------------------------

    /// Rotary position embedding over the first `n_dims` features.
    /// `mode` bit 1 selects the interleaved-pair variant; the ChatGLM
    /// variant (bit 2) is not supported.
    pub fn rope(
        &mut self,
        a: TensorId,
        n_past: usize,
        n_dims: usize,
        mode: i32,
    ) -> ComputeResult<TensorId> {
        assert!(mode & 4 == 0, "ChatGLM rope mode is not supported");
        let out = self.unary_like(Op::Rope, a)?;
        let t = self.tensor_mut(out);
        t.set_op_params_i32(0, n_past as i32);
        t.set_op_params_i32(1, n_dims as i32);
        t.set_op_params_i32(2, mode);
        Ok(out)
    }

    pub fn rope_back(
        &mut self,
        a: TensorId,
        n_past: usize,
        n_dims: usize,
        mode: i32,
    ) -> ComputeResult<TensorId> {
        assert!(mode & 4 == 0, "ChatGLM rope mode is not supported");
        let out = self.unary_like(Op::RopeBack, a)?;
        let t = self.tensor_mut(out);
        t.set_op_params_i32(0, n_past as i32);
        t.set_op_params_i32(1, n_dims as i32);
        t.set_op_params_i32(2, mode);
        Ok(out)
    }

    /// Adds the head-indexed linear position bias to a `[n_kv, n_q, n_head]`
    /// score tensor.
    pub fn alibi(
        &mut self,
        a: TensorId,
        n_past: usize,
        n_head: usize,
        bias_max: f32,
    ) -> ComputeResult<TensorId> {
        let out = self.unary_like(Op::Alibi, a)?;
        let t = self.tensor_mut(out);
        t.set_op_params_i32(0, n_past as i32);
        t.set_op_params_i32(1, n_head as i32);
        t.set_op_params_f32(2, bias_max);
        Ok(out)
    }

    pub fn flash_attn(
        &mut self,
        q: TensorId,
        k: TensorId,
        v: TensorId,
        masked: bool,
    ) -> ComputeResult<TensorId> {
        assert!(Tensor::can_mul_mat(self.tensor(k), self.tensor(q)));
        assert_eq!(self.tensor(v).ne[1], self.tensor(k).ne[0], "v must be transposed");
        let (n_dims, ne) = {
            let q = self.tensor(q);
            (q.n_dims, q.ne)
        };
        let out = self.push_tensor(Tensor::new(Dtype::F32, n_dims, &ne))?;
        let out = self.stamp(out, Op::FlashAttn, &[q, k, v])?;
        self.tensor_mut(out).set_op_params_i32(0, masked as i32);
        Ok(out)
    }

    // -- convolution / pooling / spatial ----------------------------------

    /// `a` is the kernel `[K, IC, OC]`, `b` the signal `[L, IC]`.
    pub fn conv_1d(
        &mut self,
        a: TensorId,
        b: TensorId,
        s0: usize,
        p0: usize,
        d0: usize,
    ) -> ComputeResult<TensorId> {
        assert_eq!(self.tensor(a).ne[1], self.tensor(b).ne[1], "conv_1d channel mismatch");
        let ol = conv_output_size(self.tensor(b).ne[0], self.tensor(a).ne[0], s0, p0, d0);
        let oc = self.tensor(a).ne[2];
        let out = self.new_tensor_2d(Dtype::F32, ol, oc)?;
        let out = self.stamp(out, Op::Conv1d, &[a, b])?;
        let t = self.tensor_mut(out);
        t.set_op_params_i32(0, s0 as i32);
        t.set_op_params_i32(1, p0 as i32);
        t.set_op_params_i32(2, d0 as i32);
        Ok(out)
    }

    /// `a` is the kernel `[KW, KH, IC, OC]`, `b` the image `[W, H, IC, N]`.
    #[allow(clippy::too_many_arguments)]
    pub fn conv_2d(
        &mut self,
        a: TensorId,
        b: TensorId,
        s0: usize,
        s1: usize,
        p0: usize,
        p1: usize,
        d0: usize,
        d1: usize,
    ) -> ComputeResult<TensorId> {
        assert_eq!(self.tensor(a).ne[2], self.tensor(b).ne[2], "conv_2d channel mismatch");
        let (ow, oh) = {
            let (a, b) = (self.tensor(a), self.tensor(b));
            (
                conv_output_size(b.ne[0], a.ne[0], s0, p0, d0),
                conv_output_size(b.ne[1], a.ne[1], s1, p1, d1),
            )
        };
        let oc = self.tensor(a).ne[3];
        let n = self.tensor(b).ne[3];
        let out = self.new_tensor_4d(Dtype::F32, ow, oh, oc, n)?;
        let out = self.stamp(out, Op::Conv2d, &[a, b])?;
        let t = self.tensor_mut(out);
        t.set_op_params_i32(0, s0 as i32);
        t.set_op_params_i32(1, s1 as i32);
        t.set_op_params_i32(2, p0 as i32);
        t.set_op_params_i32(3, p1 as i32);
        t.set_op_params_i32(4, d0 as i32);
        t.set_op_params_i32(5, d1 as i32);
        Ok(out)
    }

    pub fn pool_1d(
        &mut self,
        a: TensorId,
        kind: PoolKind,
        k0: usize,
        s0: usize,
        p0: usize,
    ) -> ComputeResult<TensorId> {
        let ol = conv_output_size(self.tensor(a).ne[0], k0, s0, p0, 1);
        let c = self.tensor(a).ne[1];
        let out = self.new_tensor_2d(Dtype::F32, ol, c)?;
        let out = self.stamp(out, Op::Pool1d, &[a])?;
        let t = self.tensor_mut(out);
        t.set_op_params_i32(0, matches!(kind, PoolKind::Max) as i32);
        t.set_op_params_i32(1, k0 as i32);
        t.set_op_params_i32(2, s0 as i32);
        t.set_op_params_i32(3, p0 as i32);
        Ok(out)
    }

    #[allow(clippy::too_many_arguments)]
    pub fn pool_2d(
        &mut self,
        a: TensorId,
        kind: PoolKind,
        k0: usize,
        k1: usize,
        s0: usize,
        s1: usize,
        p0: usize,
        p1: usize,
    ) -> ComputeResult<TensorId> {
        let (ow, oh) = {
            let t = self.tensor(a);
            (conv_output_size(t.ne[0], k0, s0, p0, 1), conv_output_size(t.ne[1], k1, s1, p1, 1))
        };
        let (c, n) = {
            let t = self.tensor(a);
            (t.ne[2], t.ne[3])
        };
        let out = self.new_tensor_4d(Dtype::F32, ow, oh, c, n)?;
        let out = self.stamp(out, Op::Pool2d, &[a])?;
        let t = self.tensor_mut(out);
        t.set_op_params_i32(0, matches!(kind, PoolKind::Max) as i32);
        t.set_op_params_i32(1, k0 as i32);
        t.set_op_params_i32(2, k1 as i32);
        t.set_op_params_i32(3, s0 as i32);
        t.set_op_params_i32(4, s1 as i32);
        t.set_op_params_i32(5, p0 as i32);
        t.set_op_params_i32(6, p1 as i32);
        Ok(out)
    }

    /// Nearest-neighbor upscaling of the first two dimensions.
    pub fn upscale(&mut self, a: TensorId, scale_factor: usize) -> ComputeResult<TensorId> {
        let (n_dims, ne) = {
            let t = self.tensor(a);
            (t.n_dims, t.ne)
        };
        let out = self.push_tensor(Tensor::new(
            Dtype::F32,
            n_dims.max(2),
            &[ne[0] * scale_factor, ne[1] * scale_factor, ne[2], ne[3]],
        ))?;
        let out = self.stamp(out, Op::Upscale, &[a])?;
        self.tensor_mut(out).set_op_params_i32(0, scale_factor as i32);
        Ok(out)
    }

    /// Partitions a `[C, W, H, 1]` tensor into non-overlapping `w`×`w`
    /// windows (zero-padded at the far edges).
    pub fn win_part(&mut self, a: TensorId, w: usize) -> ComputeResult<TensorId> {
        let ne = self.tensor(a).ne;
        assert_eq!(ne[3], 1, "win_part expects a single batch");
        let px = (w - ne[1] % w) % w;
        let py = (w - ne[2] % w) % w;
        let npx = (ne[1] + px) / w;
        let npy = (ne[2] + py) / w;
        let out = self.new_tensor_4d(Dtype::F32, ne[0], w, w, npx * npy)?;
        let out = self.stamp(out, Op::WinPart, &[a])?;
        let t = self.tensor_mut(out);
        t.set_op_params_i32(0, npx as i32);
        t.set_op_params_i32(1, npy as i32);
        t.set_op_params_i32(2, w as i32);
        Ok(out)
    }

    /// Reverses [`win_part`](Self::win_part) for an original spatial size
    /// `w0`×`h0`.
    pub fn win_unpart(
        &mut self,
        a: TensorId,
        w0: usize,
        h0: usize,
        w: usize,
    ) -> ComputeResult<TensorId> {
        let ne0 = self.tensor(a).ne[0];
        let out = self.new_tensor_4d(Dtype::F32, ne0, w0, h0, 1)?;
        let out = self.stamp(out, Op::WinUnpart, &[a])?;
        self.tensor_mut(out).set_op_params_i32(0, w as i32);
        Ok(out)
    }

    // -- loss -------------------------------------------------------------

    /// Softmax cross-entropy between logits `a` and target distribution
    /// `b`, averaged over rows. Scalar output.
    pub fn cross_entropy_loss(&mut self, a: TensorId, b: TensorId) -> ComputeResult<TensorId> {
        assert!(self.tensor(a).same_shape(self.tensor(b)));
        let out = self.new_tensor_1d(Dtype::F32, 1)?;
        self.stamp(out, Op::CrossEntropyLoss, &[a, b])
    }

    pub fn cross_entropy_loss_back(
        &mut self,
        a: TensorId,
        b: TensorId,
        c: TensorId,
    ) -> ComputeResult<TensorId> {
        assert!(self.tensor(a).same_shape(self.tensor(b)));
        assert!(self.tensor(c).is_scalar());
        let out = self.dup_tensor(a)?;
        self.stamp(out, Op::CrossEntropyLossBack, &[a, b, c])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::ContextInit;

    fn ctx() -> Context {
        Context::init(ContextInit::with_mem_size(1 << 20)).unwrap()
    }

    #[test]
    fn mul_mat_shape_and_dtype() {
        let mut ctx = ctx();
        let a = ctx.new_tensor_2d(Dtype::Q4_0, 64, 32).unwrap();
        let b = ctx.new_tensor_2d(Dtype::F32, 64, 16).unwrap();
        let y = ctx.mul_mat(a, b).unwrap();
        assert_eq!(ctx.tensor(y).ne, [32, 16, 1, 1]);
        assert_eq!(ctx.tensor(y).dtype, Dtype::F32);
    }

    #[test]
    fn permute_swaps_strides_without_copying() {
        let mut ctx = ctx();
        let a = ctx.new_tensor_2d(Dtype::F32, 3, 2).unwrap();
        let p = ctx.permute(a, 1, 0, 2, 3).unwrap();
        let (at, pt) = (ctx.tensor(a).clone(), ctx.tensor(p).clone());
        assert_eq!(pt.ne[0], at.ne[1]);
        assert_eq!(pt.nb[1], at.nb[0]);
        assert!(pt.is_transposed());
        assert_eq!(ctx.data_ptr(p), ctx.data_ptr(a));
    }

    #[test]
    fn grad_allocated_when_source_has_grad() {
        let mut ctx = ctx();
        let a = ctx.new_tensor_1d(Dtype::F32, 4).unwrap();
        ctx.set_param(a).unwrap();
        let y = ctx.sqr(a).unwrap();
        assert!(ctx.tensor(y).grad.is_some());
        let z = ctx.new_tensor_1d(Dtype::F32, 4).unwrap();
        let w = ctx.sqr(z).unwrap();
        assert!(ctx.tensor(w).grad.is_none());
    }

    #[test]
    #[should_panic(expected = "mul_mat shapes incompatible")]
    fn mul_mat_rejects_bad_inner_dim() {
        let mut ctx = ctx();
        let a = ctx.new_tensor_2d(Dtype::F32, 8, 2).unwrap();
        let b = ctx.new_tensor_2d(Dtype::F32, 4, 2).unwrap();
        let _ = ctx.mul_mat(a, b);
    }
}
