//! Elementwise binary/unary kernels, reductions, and broadcast repeat.

use super::{row_range, unravel_row, Tv};
use crate::context::globals;
use crate::context::Context;
use crate::exec::{ComputeParams, TaskPhase};
use crate::graph::{Op, UnaryKind};
use crate::quant;
use crate::tensor::{Dtype, TensorId};

/// add / sub / mul / div with the second operand broadcast along any axis
/// it evenly divides.
pub(crate) fn binary(ctx: &Context, params: &ComputeParams, id: TensorId) {
    if params.phase != TaskPhase::Compute {
        return;
    }
    let t = ctx.tensor(id);
    let op = t.op;
    let dst = ctx.tv(id);
    let a = ctx.tv(t.src[0].unwrap());
    let b = ctx.tv(t.src[1].unwrap());

    if a.t.dtype.is_quantized() {
        assert!(op == Op::Add, "only add supports quantized operands");
        assert_eq!(b.t.dtype, Dtype::F32);
        add_quantized(params, &dst, &a, &b);
        return;
    }
    assert_eq!(a.t.dtype, Dtype::F32);
    assert_eq!(b.t.dtype, Dtype::F32);

    let nr = dst.t.nrows();
    let ne0 = dst.t.ne[0];
    let bne = b.t.ne;
    for ir in row_range(nr, params.ith, params.nth) {
        let (i1, i2, i3) = unravel_row(dst.t, ir);
        let (b1, b2, b3) = (i1 % bne[1], i2 % bne[2], i3 % bne[3]);
        for i0 in 0..ne0 {
            let x = a.at([i0, i1, i2, i3]);
            let y = b.at([i0 % bne[0], b1, b2, b3]);
            let v = match op {
                Op::Add => x + y,
                Op::Sub => x - y,
                Op::Mul => x * y,
                Op::Div => x / y,
                _ => unreachable!(),
            };
            dst.put([i0, i1, i2, i3], v);
        }
    }
}

/// Quantized `a` + f32 `b`: dequantize a row into per-thread scratch, add,
/// requantize into the (same-format) destination row.
fn add_quantized(params: &ComputeParams, dst: &Tv<'_>, a: &Tv<'_>, b: &Tv<'_>) {
    let ne0 = dst.t.ne[0];
    let scratch = unsafe { params.thread_scratch_f32(ne0) };
    let nr = dst.t.nrows();
    let bne = b.t.ne;
    for ir in row_range(nr, params.ith, params.nth) {
        let (i1, i2, i3) = unravel_row(dst.t, ir);
        quant::dequantize_row(a.t.dtype, a.row_bytes(i1, i2, i3), scratch);
        let brow = b.row_f32(i1 % bne[1], i2 % bne[2], i3 % bne[3]);
        for (j, v) in scratch.iter_mut().enumerate() {
            *v += brow[j % bne[0]];
        }
        quant::quantize_row(dst.t.dtype, scratch, dst.row_bytes_mut(i1, i2, i3));
    }
}

/// sqr / sqrt / scale / clamp / unary(kind).
pub(crate) fn unary(ctx: &Context, params: &ComputeParams, id: TensorId) {
    if params.phase != TaskPhase::Compute {
        return;
    }
    let t = ctx.tensor(id);
    let dst = ctx.tv(id);
    let a = ctx.tv(t.src[0].unwrap());
    assert_eq!(a.t.dtype, Dtype::F32);

    let f: Box<dyn Fn(f32) -> f32> = match t.op {
        Op::Sqr => Box::new(|x| x * x),
        Op::Sqrt => Box::new(|x| x.sqrt()),
        Op::Scale => {
            let s = t.op_params_f32(0);
            Box::new(move |x| x * s)
        }
        Op::Clamp => {
            let (lo, hi) = (t.op_params_f32(0), t.op_params_f32(1));
            Box::new(move |x| x.clamp(lo, hi))
        }
        Op::Unary => match UnaryKind::from_i32(t.op_params_i32(0)) {
            UnaryKind::Abs => Box::new(f32::abs),
            UnaryKind::Sgn => Box::new(|x| {
                if x > 0.0 {
                    1.0
                } else if x < 0.0 {
                    -1.0
                } else {
                    0.0
                }
            }),
            UnaryKind::Neg => Box::new(|x| -x),
            UnaryKind::Step => Box::new(|x| if x > 0.0 { 1.0 } else { 0.0 }),
            UnaryKind::Tanh => Box::new(f32::tanh),
            UnaryKind::Elu => Box::new(|x| if x >= 0.0 { x } else { x.exp_m1() }),
            UnaryKind::Relu => Box::new(|x| x.max(0.0)),
            UnaryKind::Gelu => Box::new(|x| {
                globals::gelu_f16_lookup(half::f16::from_f32(x)).to_f32()
            }),
            UnaryKind::GeluQuick => Box::new(|x| {
                globals::gelu_quick_f16_lookup(half::f16::from_f32(x)).to_f32()
            }),
            UnaryKind::Silu => Box::new(|x| {
                globals::silu_f16_lookup(half::f16::from_f32(x)).to_f32()
            }),
        },
        _ => unreachable!(),
    };

    if a.t.is_contiguous() && dst.t.is_contiguous() {
        let n = dst.t.nelements();
        let src = unsafe { std::slice::from_raw_parts(a.ptr as *const f32, n) };
        let out = unsafe { std::slice::from_raw_parts_mut(dst.ptr as *mut f32, n) };
        for k in row_range(n, params.ith, params.nth) {
            out[k] = f(src[k]);
        }
    } else {
        let n = dst.t.nelements();
        for k in row_range(n, params.ith, params.nth) {
            let idx = dst.t.unravel(k);
            dst.put(idx, f(a.at(a.t.unravel(k))));
        }
    }
}

/// dx of silu: `src0` is the forward input, `src1` the incoming gradient.
pub(crate) fn silu_back(ctx: &Context, params: &ComputeParams, id: TensorId) {
    if params.phase != TaskPhase::Compute {
        return;
    }
    let t = ctx.tensor(id);
    let dst = ctx.tv(id);
    let x = ctx.tv(t.src[0].unwrap());
    let dy = ctx.tv(t.src[1].unwrap());
    let n = dst.t.nelements();
    for k in row_range(n, params.ith, params.nth) {
        let xv = x.at(x.t.unravel(k));
        let s = 1.0 / (1.0 + (-xv).exp());
        let g = dy.at(dy.t.unravel(k));
        dst.put(dst.t.unravel(k), g * s * (1.0 + xv * (1.0 - s)));
    }
}

/// sum / sum_rows / mean. Single-task kernels.
pub(crate) fn reduce(ctx: &Context, params: &ComputeParams, id: TensorId) {
    if params.phase != TaskPhase::Compute {
        return;
    }
    let t = ctx.tensor(id);
    let dst = ctx.tv(id);
    let a = ctx.tv(t.src[0].unwrap());
    assert_eq!(a.t.dtype, Dtype::F32);
    match t.op {
        Op::Sum => {
            let mut total = 0.0f32;
            for k in 0..a.t.nelements() {
                total += a.at(a.t.unravel(k));
            }
            dst.put([0, 0, 0, 0], total);
        }
        Op::SumRows | Op::Mean => {
            let scale = if t.op == Op::Mean { 1.0 / a.t.ne[0] as f32 } else { 1.0 };
            for ir in 0..a.t.nrows() {
                let (i1, i2, i3) = unravel_row(a.t, ir);
                let mut sum = 0.0f32;
                for i0 in 0..a.t.ne[0] {
                    sum += a.at([i0, i1, i2, i3]);
                }
                dst.put([0, i1, i2, i3], sum * scale);
            }
        }
        _ => unreachable!(),
    }
}

/// Broadcasts `src0` into the (larger) destination shape.
pub(crate) fn repeat(ctx: &Context, params: &ComputeParams, id: TensorId) {
    if params.phase != TaskPhase::Compute {
        return;
    }
    let t = ctx.tensor(id);
    let dst = ctx.tv(id);
    let a = ctx.tv(t.src[0].unwrap());
    assert_eq!(a.t.dtype, Dtype::F32);
    let ane = a.t.ne;
    for k in 0..dst.t.nelements() {
        let [i0, i1, i2, i3] = dst.t.unravel(k);
        let v = a.at([i0 % ane[0], i1 % ane[1], i2 % ane[2], i3 % ane[3]]);
        dst.put([i0, i1, i2, i3], v);
    }
}
