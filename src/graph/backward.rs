//! Reverse-mode gradient expansion.
//!
//! Walks the forward nodes in reverse and, for each node whose output
//! carries a gradient, emits the source gradients as new tensors appended
//! to the same context. A zero-table tracks gradients still at their zero
//! initial value so the first contribution overwrites instead of adding.
//!
//! Operators without a derived rule reject at build time. Computing a
//! wrong gradient silently is never an option.

use std::collections::HashMap;

use super::{Graph, IdSet, Op, UnaryKind};
use crate::context::Context;
use crate::error::ComputeResult;
use crate::tensor::{Tensor, TensorId, MAX_DIMS};

impl Context {
    /// Builds a graph that evaluates the forward pass and every parameter
    /// gradient. `keep` detaches the gradient accumulators from the
    /// forward graph first, so the forward grads survive a later reset.
    pub fn build_backward(&mut self, gf: &Graph, keep: bool) -> ComputeResult<Graph> {
        let mut gb = gf.clone();
        self.build_backward_expand(gf, &mut gb, keep)?;
        Ok(gb)
    }

    pub fn build_backward_expand(
        &mut self,
        gf: &Graph,
        gb: &mut Graph,
        keep: bool,
    ) -> ComputeResult<()> {
        self.backward_walk(gf, keep)?;
        self.expand_param_grads(gf, gb)
    }

    /// Like [`build_backward_expand`](Self::build_backward_expand), but
    /// every backward reference to a forward intermediate that is not in
    /// `checkpoints` is rewritten to a recomputed clone whose sources
    /// terminate at checkpoints, parameters, and leaves. Trades memory for
    /// recomputation.
    pub fn build_backward_checkpointed(
        &mut self,
        gf: &Graph,
        gb: &mut Graph,
        checkpoints: &[TensorId],
        keep: bool,
    ) -> ComputeResult<()> {
        let first_backward = self.tensors.len() as u32;
        self.backward_walk(gf, keep)?;
        let mut ckpt = IdSet::new();
        for &c in checkpoints {
            ckpt.insert(c);
        }
        let mut replacements: HashMap<TensorId, TensorId> = HashMap::new();
        let backward_ids: Vec<TensorId> =
            (first_backward..self.tensors.len() as u32).map(TensorId).collect();
        for id in backward_ids {
            for slot in 0..self.tensor(id).src.len() {
                let Some(src) = self.tensor(id).src[slot] else { continue };
                if src.0 < first_backward
                    && self.tensor(src).op != Op::None
                    && !ckpt.contains(src)
                {
                    let clone =
                        self.recompute_clone(src, &ckpt, first_backward, &mut replacements)?;
                    self.tensors[id.index()].src[slot] = Some(clone);
                }
            }
        }
        self.expand_param_grads(gf, gb)
    }

    /// A fresh tensor that recomputes `id` from checkpoints and leaves.
    fn recompute_clone(
        &mut self,
        id: TensorId,
        ckpt: &IdSet,
        first_backward: u32,
        replacements: &mut HashMap<TensorId, TensorId>,
    ) -> ComputeResult<TensorId> {
        if let Some(&r) = replacements.get(&id) {
            return Ok(r);
        }
        if self.tensor(id).op == Op::None || ckpt.contains(id) || id.0 >= first_backward {
            return Ok(id);
        }
        let t = self.tensor(id).clone();
        let mut srcs = t.src;
        for slot in srcs.iter_mut() {
            if let Some(s) = *slot {
                *slot = Some(self.recompute_clone(s, ckpt, first_backward, replacements)?);
            }
        }
        let clone = if t.view_src.is_some() {
            // structural op: re-alias the (possibly recomputed) base
            let base_orig = t.src[0].expect("view without a source");
            let base_new = srcs[0].expect("view without a source");
            let rel = t.view_offs - self.tensor(base_orig).view_offs;
            let clone = self.view_tensor_impl(base_new, t.dtype, t.n_dims, &t.ne, rel, &[])?;
            let ct = self.tensor_mut(clone);
            ct.ne = t.ne;
            ct.nb = t.nb;
            ct.n_dims = t.n_dims;
            clone
        } else {
            self.push_tensor(Tensor::new(t.dtype, t.n_dims, &t.ne))?
        };
        {
            let ct = self.tensor_mut(clone);
            ct.op = t.op;
            ct.op_params = t.op_params;
            ct.src = srcs;
        }
        replacements.insert(id, clone);
        Ok(clone)
    }

    fn expand_param_grads(&mut self, gf: &Graph, gb: &mut Graph) -> ComputeResult<()> {
        let params: Vec<TensorId> = gf
            .leafs
            .iter()
            .chain(gf.nodes.iter())
            .copied()
            .filter(|&id| self.tensor(id).is_param)
            .collect();
        for p in params {
            let grad = self.tensor(p).grad.expect("parameter without gradient");
            self.build_forward_expand(gb, grad);
        }
        for i in 0..gb.nodes.len() {
            gb.grads[i] = self.tensor(gb.nodes[i]).grad;
        }
        Ok(())
    }

    fn backward_walk(&mut self, gf: &Graph, keep: bool) -> ComputeResult<IdSet> {
        if keep {
            // detach: forward grads are preserved, accumulation happens in
            // fresh tensors
            for &node in &gf.nodes {
                if self.tensor(node).grad.is_some() {
                    let fresh = self.dup_tensor(node)?;
                    self.tensors[node.index()].grad = Some(fresh);
                }
            }
        }
        let mut zero = IdSet::new();
        for id in gf.leafs.iter().chain(gf.nodes.iter()) {
            if let Some(g) = self.tensor(*id).grad {
                zero.insert(g);
            }
        }
        for &node in gf.nodes.iter().rev() {
            if self.tensor(node).grad.is_some() {
                self.compute_backward(node, &mut zero)?;
            }
        }
        Ok(zero)
    }

    /// Accumulates `contrib` into `src`'s gradient, overwriting the zero
    /// initial value on first write.
    fn add_or_set(
        &mut self,
        src: TensorId,
        contrib: TensorId,
        zero: &mut IdSet,
    ) -> ComputeResult<()> {
        let g = self.tensor(src).grad.expect("accumulation target has no gradient");
        let new_g = if zero.contains(g) {
            zero.remove(g);
            contrib
        } else {
            self.add(g, contrib)?
        };
        self.tensors[src.index()].grad = Some(new_g);
        Ok(())
    }

    fn sub_or_set(
        &mut self,
        src: TensorId,
        contrib: TensorId,
        zero: &mut IdSet,
    ) -> ComputeResult<()> {
        let g = self.tensor(src).grad.expect("accumulation target has no gradient");
        let new_g = if zero.contains(g) {
            zero.remove(g);
            self.neg(contrib)?
        } else {
            self.sub(g, contrib)?
        };
        self.tensors[src.index()].grad = Some(new_g);
        Ok(())
    }

    fn src_has_grad(&self, src: Option<TensorId>) -> bool {
        src.is_some_and(|s| self.tensor(s).grad.is_some())
    }

    /// Reduces a repeat gradient `g` (shaped like the broadcast output)
    /// back to the pre-broadcast shape of `a`.
    fn reduce_to(&mut self, g: TensorId, a: TensorId) -> ComputeResult<TensorId> {
        let a_ne = self.tensor(a).ne;
        let a_dims = self.tensor(a).n_dims;
        if self.tensor(g).ne == a_ne {
            return Ok(g);
        }
        if a_ne.iter().product::<usize>() == 1 {
            let s = self.sum(g)?;
            return if self.tensor(s).ne == a_ne { Ok(s) } else { self.reshape(s, &a_ne[..a_dims]) };
        }
        if a_ne[1] == 1 && a_ne[2] == 1 && a_ne[3] == 1 {
            // row broadcast: fold every repeated row into one
            let ne0 = a_ne[0];
            let rows = self.tensor(g).nelements() / ne0;
            let flat = self.reshape(g, &[ne0, rows])?;
            let t = self.transpose(flat)?;
            let t = self.cont(t)?;
            let summed = self.sum_rows(t)?;
            return self.reshape(summed, &a_ne[..a_dims]);
        }
        panic!("backward of repeat is not implemented for target shape {a_ne:?}");
    }

    fn compute_backward(&mut self, id: TensorId, zero: &mut IdSet) -> ComputeResult<()> {
        let t = self.tensor(id).clone();
        let g = t.grad.expect("node has no gradient");
        let src0 = t.src[0];
        let src1 = t.src[1];
        match t.op {
            Op::None => {}
            Op::Dup | Op::Cont => {
                if self.src_has_grad(src0) {
                    self.add_or_set(src0.unwrap(), g, zero)?;
                }
            }
            Op::Cpy => {
                if self.src_has_grad(src0) {
                    let a = src0.unwrap();
                    let a_ne = self.tensor(a).ne;
                    let a_dims = self.tensor(a).n_dims;
                    let contrib = if self.tensor(g).ne == a_ne {
                        g
                    } else {
                        self.reshape(g, &a_ne[..a_dims])?
                    };
                    self.add_or_set(a, contrib, zero)?;
                }
                assert!(
                    !self.src_has_grad(src1),
                    "backward of cpy into a gradient-carrying destination is not implemented"
                );
            }
            Op::Add => {
                if self.src_has_grad(src0) {
                    self.add_or_set(src0.unwrap(), g, zero)?;
                }
                if self.src_has_grad(src1) {
                    let b = src1.unwrap();
                    assert!(
                        self.tensor(b).same_shape(&t),
                        "backward of broadcast add is not implemented"
                    );
                    self.add_or_set(b, g, zero)?;
                }
            }
            Op::Sub => {
                if self.src_has_grad(src0) {
                    self.add_or_set(src0.unwrap(), g, zero)?;
                }
                if self.src_has_grad(src1) {
                    let b = src1.unwrap();
                    assert!(
                        self.tensor(b).same_shape(&t),
                        "backward of broadcast sub is not implemented"
                    );
                    self.sub_or_set(b, g, zero)?;
                }
            }
            Op::Mul => {
                if self.src_has_grad(src0) {
                    let contrib = self.mul(g, src1.unwrap())?;
                    self.add_or_set(src0.unwrap(), contrib, zero)?;
                }
                if self.src_has_grad(src1) {
                    let b = src1.unwrap();
                    assert!(
                        self.tensor(b).same_shape(&t),
                        "backward of broadcast mul is not implemented"
                    );
                    let contrib = self.mul(g, src0.unwrap())?;
                    self.add_or_set(b, contrib, zero)?;
                }
            }
            Op::Div => {
                if self.src_has_grad(src0) {
                    let contrib = self.div(g, src1.unwrap())?;
                    self.add_or_set(src0.unwrap(), contrib, zero)?;
                }
                if self.src_has_grad(src1) {
                    let b = src1.unwrap();
                    assert!(
                        self.tensor(b).same_shape(&t),
                        "backward of broadcast div is not implemented"
                    );
                    let ratio = self.div(id, b)?;
                    let contrib = self.mul(g, ratio)?;
                    self.sub_or_set(b, contrib, zero)?;
                }
            }
            Op::Sqr => {
                if self.src_has_grad(src0) {
                    let a = src0.unwrap();
                    let prod = self.mul(a, g)?;
                    let contrib = self.scale(prod, 2.0)?;
                    self.add_or_set(a, contrib, zero)?;
                }
            }
            Op::Sqrt => {
                if self.src_has_grad(src0) {
                    let ratio = self.div(g, id)?;
                    let contrib = self.scale(ratio, 0.5)?;
                    self.add_or_set(src0.unwrap(), contrib, zero)?;
                }
            }
            Op::Sum | Op::SumRows => {
                if self.src_has_grad(src0) {
                    let a = src0.unwrap();
                    let contrib = self.repeat(g, a)?;
                    self.add_or_set(a, contrib, zero)?;
                }
            }
            Op::Mean => {
                if self.src_has_grad(src0) {
                    let a = src0.unwrap();
                    let spread = self.repeat(g, a)?;
                    let contrib = self.scale(spread, 1.0 / self.tensor(a).ne[0] as f32)?;
                    self.add_or_set(a, contrib, zero)?;
                }
            }
            Op::Repeat => {
                if self.src_has_grad(src0) {
                    let a = src0.unwrap();
                    let contrib = self.reduce_to(g, a)?;
                    self.add_or_set(a, contrib, zero)?;
                }
            }
            Op::Unary => {
                if self.src_has_grad(src0) {
                    let a = src0.unwrap();
                    match UnaryKind::from_i32(t.op_params_i32(0)) {
                        UnaryKind::Sgn | UnaryKind::Step => {}
                        UnaryKind::Abs => {
                            let sign = self.sgn(a)?;
                            let contrib = self.mul(sign, g)?;
                            self.add_or_set(a, contrib, zero)?;
                        }
                        UnaryKind::Neg => self.sub_or_set(a, g, zero)?,
                        UnaryKind::Relu => {
                            let mask = self.step(a)?;
                            let contrib = self.mul(mask, g)?;
                            self.add_or_set(a, contrib, zero)?;
                        }
                        UnaryKind::Silu => {
                            let contrib = self.silu_back(a, g)?;
                            self.add_or_set(a, contrib, zero)?;
                        }
                        kind @ (UnaryKind::Tanh
                        | UnaryKind::Elu
                        | UnaryKind::Gelu
                        | UnaryKind::GeluQuick) => {
                            panic!("backward of {kind:?} is not implemented")
                        }
                    }
                }
            }
            Op::RmsNorm => {
                if self.src_has_grad(src0) {
                    let a = src0.unwrap();
                    let contrib = self.rms_norm_back(a, g, t.op_params_f32(0))?;
                    self.add_or_set(a, contrib, zero)?;
                }
            }
            Op::MulMat => {
                if self.src_has_grad(src0) {
                    let contrib = self.out_prod(src1.unwrap(), g)?;
                    self.add_or_set(src0.unwrap(), contrib, zero)?;
                }
                if self.src_has_grad(src1) {
                    let at = self.transpose(src0.unwrap())?;
                    let at = self.cont(at)?;
                    let contrib = self.mul_mat(at, g)?;
                    self.add_or_set(src1.unwrap(), contrib, zero)?;
                }
            }
            Op::Scale => {
                if self.src_has_grad(src0) {
                    let contrib = self.scale(g, t.op_params_f32(0))?;
                    self.add_or_set(src0.unwrap(), contrib, zero)?;
                }
            }
            Op::Reshape => {
                if self.src_has_grad(src0) {
                    let a = src0.unwrap();
                    let a_ne = self.tensor(a).ne;
                    let a_dims = self.tensor(a).n_dims;
                    let contrib = self.reshape(g, &a_ne[..a_dims])?;
                    self.add_or_set(a, contrib, zero)?;
                }
            }
            Op::Permute => {
                if self.src_has_grad(src0) {
                    let mut inv = [0usize; MAX_DIMS];
                    for i in 0..MAX_DIMS {
                        inv[t.op_params_i32(i) as usize] = i;
                    }
                    let p = self.permute(g, inv[0], inv[1], inv[2], inv[3])?;
                    let contrib = self.cont(p)?;
                    self.add_or_set(src0.unwrap(), contrib, zero)?;
                }
            }
            Op::Transpose => {
                if self.src_has_grad(src0) {
                    let tr = self.transpose(g)?;
                    let contrib = self.cont(tr)?;
                    self.add_or_set(src0.unwrap(), contrib, zero)?;
                }
            }
            Op::GetRows => {
                if self.src_has_grad(src0) {
                    let a = src0.unwrap();
                    let contrib = self.get_rows_back(g, src1.unwrap(), a)?;
                    self.add_or_set(a, contrib, zero)?;
                }
            }
            Op::DiagMaskInf | Op::DiagMaskZero => {
                if self.src_has_grad(src0) {
                    let contrib = self.diag_mask_zero(g, t.op_params_i32(0) as usize)?;
                    self.add_or_set(src0.unwrap(), contrib, zero)?;
                }
            }
            Op::SoftMax => {
                if self.src_has_grad(src0) {
                    let contrib = self.soft_max_back(g, id)?;
                    self.add_or_set(src0.unwrap(), contrib, zero)?;
                }
            }
            Op::Rope => {
                if self.src_has_grad(src0) {
                    let (n_past, n_dims, mode) =
                        (t.op_params_i32(0), t.op_params_i32(1), t.op_params_i32(2));
                    let contrib = self.rope_back(g, n_past as usize, n_dims as usize, mode)?;
                    self.add_or_set(src0.unwrap(), contrib, zero)?;
                }
            }
            Op::RopeBack => {
                if self.src_has_grad(src0) {
                    let (n_past, n_dims, mode) =
                        (t.op_params_i32(0), t.op_params_i32(1), t.op_params_i32(2));
                    let contrib = self.rope(g, n_past as usize, n_dims as usize, mode)?;
                    self.add_or_set(src0.unwrap(), contrib, zero)?;
                }
            }
            Op::CrossEntropyLoss => {
                if self.src_has_grad(src0) {
                    let contrib = self.cross_entropy_loss_back(src0.unwrap(), src1.unwrap(), g)?;
                    self.add_or_set(src0.unwrap(), contrib, zero)?;
                }
                assert!(
                    !self.src_has_grad(src1),
                    "backward of cross_entropy_loss targets is not implemented"
                );
            }
            op @ (Op::SiluBack
            | Op::Norm
            | Op::RmsNormBack
            | Op::OutProd
            | Op::Set
            | Op::View
            | Op::GetRowsBack
            | Op::SoftMaxBack
            | Op::Alibi
            | Op::Clamp
            | Op::Conv1d
            | Op::Conv2d
            | Op::Pool1d
            | Op::Pool2d
            | Op::Upscale
            | Op::FlashAttn
            | Op::WinPart
            | Op::WinUnpart
            | Op::CrossEntropyLossBack) => {
                panic!("backward of {} is not implemented", op.name())
            }
        }
        Ok(())
    }
}
