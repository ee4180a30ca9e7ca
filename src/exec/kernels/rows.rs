//! Row-oriented kernels: normalization, softmax, rotary embeddings, row
//! selection, masking, and the cross-entropy loss pair.

use super::{row_range, unravel_row};
use crate::context::Context;
use crate::exec::{ComputeParams, TaskPhase};
use crate::graph::Op;
use crate::quant;
use crate::tensor::{Dtype, TensorId};

/// norm / rms_norm over each row.
pub(crate) fn norm(ctx: &Context, params: &ComputeParams, id: TensorId) {
    if params.phase != TaskPhase::Compute {
        return;
    }
    let t = ctx.tensor(id);
    let eps = t.op_params_f32(0);
    let dst = ctx.tv(id);
    let a = ctx.tv(t.src[0].unwrap());
    assert_eq!(a.t.dtype, Dtype::F32);
    let ne0 = a.t.ne[0];
    let nr = a.t.nrows();
    for ir in row_range(nr, params.ith, params.nth) {
        let (i1, i2, i3) = unravel_row(a.t, ir);
        let x = a.row_f32(i1, i2, i3);
        let out = dst.row_f32_mut(i1, i2, i3);
        match t.op {
            Op::Norm => {
                let mean = x.iter().sum::<f32>() / ne0 as f32;
                let mut var = 0.0f32;
                for (o, &v) in out.iter_mut().zip(x) {
                    let c = v - mean;
                    *o = c;
                    var += c * c;
                }
                var /= ne0 as f32;
                let scale = 1.0 / (var + eps).sqrt();
                for o in out.iter_mut() {
                    *o *= scale;
                }
            }
            Op::RmsNorm => {
                let mean_sq = x.iter().map(|v| v * v).sum::<f32>() / ne0 as f32;
                let scale = 1.0 / (mean_sq + eps).sqrt();
                for (o, &v) in out.iter_mut().zip(x) {
                    *o = v * scale;
                }
            }
            _ => unreachable!(),
        }
    }
}

/// dx of rms_norm:
/// `dx = r·dy − (r³/n)·x·(x·dy)` with `r = (mean(x²)+eps)^-1/2`.
pub(crate) fn rms_norm_back(ctx: &Context, params: &ComputeParams, id: TensorId) {
    if params.phase != TaskPhase::Compute {
        return;
    }
    let t = ctx.tensor(id);
    let eps = t.op_params_f32(0);
    let dst = ctx.tv(id);
    let x = ctx.tv(t.src[0].unwrap());
    let dy = ctx.tv(t.src[1].unwrap());
    let ne0 = x.t.ne[0];
    let nr = x.t.nrows();
    for ir in row_range(nr, params.ith, params.nth) {
        let (i1, i2, i3) = unravel_row(x.t, ir);
        let xr = x.row_f32(i1, i2, i3);
        let gr = dy.row_f32(i1, i2, i3);
        let out = dst.row_f32_mut(i1, i2, i3);
        let mut sum_sq = 0.0f32;
        let mut dot = 0.0f32;
        for (&xv, &gv) in xr.iter().zip(gr) {
            sum_sq += xv * xv;
            dot += xv * gv;
        }
        let r = 1.0 / (sum_sq / ne0 as f32 + eps).sqrt();
        let coeff = r * r * r * dot / ne0 as f32;
        for ((o, &xv), &gv) in out.iter_mut().zip(xr).zip(gr) {
            *o = r * gv - coeff * xv;
        }
    }
}

pub(crate) fn soft_max(ctx: &Context, params: &ComputeParams, id: TensorId) {
    if params.phase != TaskPhase::Compute {
        return;
    }
    let t = ctx.tensor(id);
    let dst = ctx.tv(id);
    let a = ctx.tv(t.src[0].unwrap());
    assert_eq!(a.t.dtype, Dtype::F32);
    let nr = a.t.nrows();
    for ir in row_range(nr, params.ith, params.nth) {
        let (i1, i2, i3) = unravel_row(a.t, ir);
        let x = a.row_f32(i1, i2, i3);
        let out = dst.row_f32_mut(i1, i2, i3);
        let max = x.iter().copied().fold(f32::NEG_INFINITY, f32::max);
        let mut sum = 0.0f32;
        for (o, &v) in out.iter_mut().zip(x) {
            if v == f32::NEG_INFINITY {
                *o = 0.0;
            } else {
                let e = (v - max).exp();
                *o = e;
                sum += e;
            }
        }
        let inv = 1.0 / sum;
        for o in out.iter_mut() {
            *o *= inv;
        }
    }
}

/// dx of softmax: `dx = (dy − (dy·y)) ⊙ y`, rowwise. `src0` is the
/// incoming gradient, `src1` the forward output.
pub(crate) fn soft_max_back(ctx: &Context, params: &ComputeParams, id: TensorId) {
    if params.phase != TaskPhase::Compute {
        return;
    }
    let t = ctx.tensor(id);
    let dst = ctx.tv(id);
    let dy = ctx.tv(t.src[0].unwrap());
    let y = ctx.tv(t.src[1].unwrap());
    let nr = dst.t.nrows();
    for ir in row_range(nr, params.ith, params.nth) {
        let (i1, i2, i3) = unravel_row(dst.t, ir);
        let g = dy.row_f32(i1, i2, i3);
        let p = y.row_f32(i1, i2, i3);
        let out = dst.row_f32_mut(i1, i2, i3);
        let dot: f32 = g.iter().zip(p).map(|(a, b)| a * b).sum();
        for ((o, &gv), &pv) in out.iter_mut().zip(g).zip(p) {
            *o = (gv - dot) * pv;
        }
    }
}

/// Rotary position embedding, normal and interleaved (NeoX) modes. The
/// backward variant rotates with the opposite sign.
pub(crate) fn rope(ctx: &Context, params: &ComputeParams, id: TensorId) {
    if params.phase != TaskPhase::Compute {
        return;
    }
    let t = ctx.tensor(id);
    let n_past = t.op_params_i32(0) as usize;
    let n_dims = t.op_params_i32(1) as usize;
    let mode = t.op_params_i32(2);
    let backward = t.op == Op::RopeBack;
    let dst = ctx.tv(id);
    let a = ctx.tv(t.src[0].unwrap());
    let ne0 = a.t.ne[0];
    let theta_scale = 10000.0f32.powf(-2.0 / n_dims as f32);
    let neox = mode & 2 != 0;
    let nr = a.t.nrows();
    for ir in row_range(nr, params.ith, params.nth) {
        let (i1, i2, i3) = unravel_row(a.t, ir);
        // dimension 2 indexes the token position
        let p = (n_past + i2) as f32;
        let x = a.row_f32(i1, i2, i3);
        let out = dst.row_f32_mut(i1, i2, i3);
        let mut theta = p;
        if neox {
            let half = n_dims / 2;
            for i0 in 0..half {
                let (sin, cos) = theta.sin_cos();
                let sin = if backward { -sin } else { sin };
                let x0 = x[i0];
                let x1 = x[i0 + half];
                out[i0] = x0 * cos - x1 * sin;
                out[i0 + half] = x0 * sin + x1 * cos;
                theta *= theta_scale;
            }
        } else {
            for i0 in (0..n_dims).step_by(2) {
                let (sin, cos) = theta.sin_cos();
                let sin = if backward { -sin } else { sin };
                let x0 = x[i0];
                let x1 = x[i0 + 1];
                out[i0] = x0 * cos - x1 * sin;
                out[i0 + 1] = x0 * sin + x1 * cos;
                theta *= theta_scale;
            }
        }
        out[n_dims..ne0].copy_from_slice(&x[n_dims..ne0]);
    }
}

/// Gathers (and dequantizes) the rows of `src0` selected by the i32
/// indices in `src1`.
pub(crate) fn get_rows(ctx: &Context, params: &ComputeParams, id: TensorId) {
    if params.phase != TaskPhase::Compute {
        return;
    }
    let t = ctx.tensor(id);
    let dst = ctx.tv(id);
    let a = ctx.tv(t.src[0].unwrap());
    let idx = t.src[1].unwrap();
    let n = ctx.tensor(idx).ne[0];
    for r in 0..n {
        let row = ctx.get_i32_1d(idx, r) as usize;
        assert!(row < a.t.ne[1], "row index {row} out of range");
        let out = dst.row_f32_mut(r, 0, 0);
        if a.t.dtype.is_quantized() {
            quant::dequantize_row(a.t.dtype, a.row_bytes(row, 0, 0), out);
        } else {
            for (i0, o) in out.iter_mut().enumerate() {
                *o = super::read_native(&a, [i0, row, 0, 0]);
            }
        }
    }
}

/// Scatter-adds the rows of `src0` into a zeroed destination at the
/// indices in `src1`. Single task; INIT zeroes.
pub(crate) fn get_rows_back(ctx: &Context, params: &ComputeParams, id: TensorId) {
    let t = ctx.tensor(id);
    let dst = ctx.tv(id);
    match params.phase {
        TaskPhase::Init => unsafe {
            std::ptr::write_bytes(dst.ptr, 0, dst.t.nbytes());
        },
        TaskPhase::Compute => {
            let a = ctx.tv(t.src[0].unwrap());
            let idx = t.src[1].unwrap();
            let n = ctx.tensor(idx).ne[0];
            for r in 0..n {
                let row = ctx.get_i32_1d(idx, r) as usize;
                let src = a.row_f32(r, 0, 0);
                let out = dst.row_f32_mut(row, 0, 0);
                for (o, &v) in out.iter_mut().zip(src) {
                    *o += v;
                }
            }
        }
        TaskPhase::Finalize => {}
    }
}

/// Masks columns past the diagonal with −∞ (or zero), leaving the first
/// `n_past` columns of every row untouched.
pub(crate) fn diag_mask(ctx: &Context, params: &ComputeParams, id: TensorId) {
    if params.phase != TaskPhase::Compute {
        return;
    }
    let t = ctx.tensor(id);
    let n_past = t.op_params_i32(0) as usize;
    let fill = if t.op == Op::DiagMaskInf { f32::NEG_INFINITY } else { 0.0 };
    let dst = ctx.tv(id);
    let a = ctx.tv(t.src[0].unwrap());
    let ne0 = a.t.ne[0];
    for ir in 0..a.t.nrows() {
        let (i1, i2, i3) = unravel_row(a.t, ir);
        let x = a.row_f32(i1, i2, i3);
        let out = dst.row_f32_mut(i1, i2, i3);
        for i0 in 0..ne0 {
            out[i0] = if i0 > n_past + i1 { fill } else { x[i0] };
        }
    }
}

/// Adds the per-head linear position bias of ALiBi attention.
pub(crate) fn alibi(ctx: &Context, params: &ComputeParams, id: TensorId) {
    if params.phase != TaskPhase::Compute {
        return;
    }
    let t = ctx.tensor(id);
    let n_head = t.op_params_i32(1) as usize;
    let bias_max = t.op_params_f32(2);
    let dst = ctx.tv(id);
    let a = ctx.tv(t.src[0].unwrap());
    let n_heads_log2_floor = 1usize << (n_head as f32).log2().floor() as usize;
    let m0 = 2.0f32.powf(-bias_max / n_heads_log2_floor as f32);
    let m1 = 2.0f32.powf(-bias_max / (2.0 * n_heads_log2_floor as f32));
    let nr = a.t.nrows();
    for ir in row_range(nr, params.ith, params.nth) {
        let (i1, i2, i3) = unravel_row(a.t, ir);
        let head = i2;
        let slope = if head < n_heads_log2_floor {
            m0.powi(head as i32 + 1)
        } else {
            m1.powi(2 * (head - n_heads_log2_floor) as i32 + 1)
        };
        let x = a.row_f32(i1, i2, i3);
        let out = dst.row_f32_mut(i1, i2, i3);
        for (i0, (o, &v)) in out.iter_mut().zip(x).enumerate() {
            *o = v + slope * i0 as f32;
        }
    }
}

/// Mean softmax cross-entropy over rows. COMPUTE accumulates per-thread
/// partial sums in the work buffer; FINALIZE reduces and averages them.
pub(crate) fn cross_entropy_loss(ctx: &Context, params: &ComputeParams, id: TensorId) {
    let t = ctx.tensor(id);
    let a = ctx.tv(t.src[0].unwrap());
    match params.phase {
        TaskPhase::Init => {}
        TaskPhase::Compute => {
            let b = ctx.tv(t.src[1].unwrap());
            let ne0 = a.t.ne[0];
            let scratch = unsafe { params.thread_scratch_f32(ne0 + 1) };
            let (partial, _row_buf) = scratch.split_last_mut().unwrap();
            *partial = 0.0;
            let nr = a.t.nrows();
            for ir in row_range(nr, params.ith, params.nth) {
                let (i1, i2, i3) = unravel_row(a.t, ir);
                let x = a.row_f32(i1, i2, i3);
                let target = b.row_f32(i1, i2, i3);
                let max = x.iter().copied().fold(f32::NEG_INFINITY, f32::max);
                let log_sum = x.iter().map(|v| (v - max).exp()).sum::<f32>().ln();
                let mut row_loss = 0.0f32;
                for (&xv, &tv) in x.iter().zip(target) {
                    row_loss += tv * (xv - max - log_sum);
                }
                *partial -= row_loss;
            }
        }
        TaskPhase::Finalize => {
            let dst = ctx.tv(id);
            let nr = a.t.nrows();
            let mut total = 0.0f32;
            for ith in 0..params.nth {
                let worker = ComputeParams { ith, ..*params };
                let scratch = unsafe { worker.thread_scratch_f32(a.t.ne[0] + 1) };
                total += *scratch.last().unwrap();
            }
            dst.put([0, 0, 0, 0], total / nr as f32);
        }
    }
}

/// dx of the mean cross-entropy: `(softmax(x) − target) · dloss / nr`.
pub(crate) fn cross_entropy_loss_back(ctx: &Context, params: &ComputeParams, id: TensorId) {
    if params.phase != TaskPhase::Compute {
        return;
    }
    let t = ctx.tensor(id);
    let dst = ctx.tv(id);
    let a = ctx.tv(t.src[0].unwrap());
    let b = ctx.tv(t.src[1].unwrap());
    let dloss = ctx.get_f32_1d(t.src[2].unwrap(), 0);
    let nr = a.t.nrows();
    let scale = dloss / nr as f32;
    for ir in row_range(nr, params.ith, params.nth) {
        let (i1, i2, i3) = unravel_row(a.t, ir);
        let x = a.row_f32(i1, i2, i3);
        let target = b.row_f32(i1, i2, i3);
        let out = dst.row_f32_mut(i1, i2, i3);
        let max = x.iter().copied().fold(f32::NEG_INFINITY, f32::max);
        let mut sum = 0.0f32;
        for (o, &v) in out.iter_mut().zip(x) {
            let e = (v - max).exp();
            *o = e;
            sum += e;
        }
        let inv = 1.0 / sum;
        for (o, &tv) in out.iter_mut().zip(target) {
            *o = (*o * inv - tv) * scale;
        }
    }
}
