//! Convolution, pooling, upscaling, window partitioning, and fused
//! attention.

use super::{row_range, unravel_row};
use crate::context::Context;
use crate::exec::{ComputeParams, TaskPhase};
use crate::quant::simd::vec_dot_f32;
use crate::tensor::{Dtype, TensorId};

/// 1-d convolution. INIT unrolls the padded signal into an im2col table in
/// the work buffer (one `[IC·K]` column per output position); COMPUTE
/// reduces each output element to a dot product against the flattened
/// kernel for its output channel.
pub(crate) fn conv_1d(ctx: &Context, params: &ComputeParams, id: TensorId) {
    let t = ctx.tensor(id);
    let dst = ctx.tv(id);
    let a = ctx.tv(t.src[0].unwrap());
    let b = ctx.tv(t.src[1].unwrap());
    assert_eq!(a.t.dtype, Dtype::F32);
    assert_eq!(b.t.dtype, Dtype::F32);
    let (s0, p0, d0) = (
        t.op_params_i32(0) as usize,
        t.op_params_i32(1) as isize,
        t.op_params_i32(2) as usize,
    );
    let (k, ic) = (a.t.ne[0], a.t.ne[1]);
    let (l, ol, oc) = (b.t.ne[0], dst.t.ne[0], dst.t.ne[1]);
    let col = ic * k;

    match params.phase {
        TaskPhase::Init => {
            let table =
                unsafe { std::slice::from_raw_parts_mut(params.work as *mut f32, ol * col) };
            for o in 0..ol {
                for c in 0..ic {
                    for kk in 0..k {
                        let pos = (o * s0 + kk * d0) as isize - p0;
                        table[o * col + c * k + kk] = if (0..l as isize).contains(&pos) {
                            b.at([pos as usize, c, 0, 0])
                        } else {
                            0.0
                        };
                    }
                }
            }
        }
        TaskPhase::Compute => {
            let table =
                unsafe { std::slice::from_raw_parts(params.work as *const f32, ol * col) };
            for ch in row_range(oc, params.ith, params.nth) {
                let kernel = unsafe {
                    std::slice::from_raw_parts(a.row_ptr(0, ch, 0) as *const f32, col)
                };
                let out = dst.row_f32_mut(ch, 0, 0);
                for o in 0..ol {
                    out[o] = vec_dot_f32(kernel, &table[o * col..(o + 1) * col]);
                }
            }
        }
        TaskPhase::Finalize => {}
    }
}

/// 2-d convolution over `[W, H, IC, N]` images, same im2col structure as
/// [`conv_1d`].
pub(crate) fn conv_2d(ctx: &Context, params: &ComputeParams, id: TensorId) {
    let t = ctx.tensor(id);
    let dst = ctx.tv(id);
    let a = ctx.tv(t.src[0].unwrap());
    let b = ctx.tv(t.src[1].unwrap());
    assert_eq!(a.t.dtype, Dtype::F32);
    assert_eq!(b.t.dtype, Dtype::F32);
    let (s0, s1) = (t.op_params_i32(0) as usize, t.op_params_i32(1) as usize);
    let (p0, p1) = (t.op_params_i32(2) as isize, t.op_params_i32(3) as isize);
    let (d0, d1) = (t.op_params_i32(4) as usize, t.op_params_i32(5) as usize);
    let (kw, kh, ic) = (a.t.ne[0], a.t.ne[1], a.t.ne[2]);
    let (w, h) = (b.t.ne[0], b.t.ne[1]);
    let (ow, oh, oc, n) = (dst.t.ne[0], dst.t.ne[1], dst.t.ne[2], dst.t.ne[3]);
    let col = ic * kh * kw;

    match params.phase {
        TaskPhase::Init => {
            let table = unsafe {
                std::slice::from_raw_parts_mut(params.work as *mut f32, ow * oh * n * col)
            };
            for ni in 0..n {
                for oy in 0..oh {
                    for ox in 0..ow {
                        let base = ((ni * oh + oy) * ow + ox) * col;
                        for c in 0..ic {
                            for ky in 0..kh {
                                for kx in 0..kw {
                                    let ix = (ox * s0 + kx * d0) as isize - p0;
                                    let iy = (oy * s1 + ky * d1) as isize - p1;
                                    let at = base + (c * kh + ky) * kw + kx;
                                    table[at] = if (0..w as isize).contains(&ix)
                                        && (0..h as isize).contains(&iy)
                                    {
                                        b.at([ix as usize, iy as usize, c, ni])
                                    } else {
                                        0.0
                                    };
                                }
                            }
                        }
                    }
                }
            }
        }
        TaskPhase::Compute => {
            let table = unsafe {
                std::slice::from_raw_parts(params.work as *const f32, ow * oh * n * col)
            };
            let nr = oh * oc * n;
            for ir in row_range(nr, params.ith, params.nth) {
                let (oy, ch, ni) = unravel_row(dst.t, ir);
                let kernel = unsafe {
                    std::slice::from_raw_parts(a.row_ptr(0, 0, ch) as *const f32, col)
                };
                let out = dst.row_f32_mut(oy, ch, ni);
                for ox in 0..ow {
                    let base = ((ni * oh + oy) * ow + ox) * col;
                    out[ox] = vec_dot_f32(kernel, &table[base..base + col]);
                }
            }
        }
        TaskPhase::Finalize => {}
    }
}

pub(crate) fn pool_1d(ctx: &Context, params: &ComputeParams, id: TensorId) {
    if params.phase != TaskPhase::Compute {
        return;
    }
    let t = ctx.tensor(id);
    let dst = ctx.tv(id);
    let a = ctx.tv(t.src[0].unwrap());
    let is_max = t.op_params_i32(0) != 0;
    let (k0, s0, p0) =
        (t.op_params_i32(1) as usize, t.op_params_i32(2) as usize, t.op_params_i32(3) as isize);
    let (l, ol, c) = (a.t.ne[0], dst.t.ne[0], dst.t.ne[1]);
    for ch in row_range(c, params.ith, params.nth) {
        let x = a.row_f32(ch, 0, 0);
        let out = dst.row_f32_mut(ch, 0, 0);
        for o in 0..ol {
            let mut acc = if is_max { f32::NEG_INFINITY } else { 0.0 };
            for kk in 0..k0 {
                let pos = (o * s0 + kk) as isize - p0;
                if (0..l as isize).contains(&pos) {
                    let v = x[pos as usize];
                    acc = if is_max { acc.max(v) } else { acc + v };
                }
            }
            out[o] = if is_max { acc } else { acc / k0 as f32 };
        }
    }
}

pub(crate) fn pool_2d(ctx: &Context, params: &ComputeParams, id: TensorId) {
    if params.phase != TaskPhase::Compute {
        return;
    }
    let t = ctx.tensor(id);
    let dst = ctx.tv(id);
    let a = ctx.tv(t.src[0].unwrap());
    let is_max = t.op_params_i32(0) != 0;
    let (k0, k1) = (t.op_params_i32(1) as usize, t.op_params_i32(2) as usize);
    let (s0, s1) = (t.op_params_i32(3) as usize, t.op_params_i32(4) as usize);
    let (p0, p1) = (t.op_params_i32(5) as isize, t.op_params_i32(6) as isize);
    let (w, h) = (a.t.ne[0], a.t.ne[1]);
    let ow = dst.t.ne[0];
    let nr = dst.t.nrows();
    for ir in row_range(nr, params.ith, params.nth) {
        let (oy, ch, ni) = unravel_row(dst.t, ir);
        let out = dst.row_f32_mut(oy, ch, ni);
        for ox in 0..ow {
            let mut acc = if is_max { f32::NEG_INFINITY } else { 0.0 };
            for ky in 0..k1 {
                for kx in 0..k0 {
                    let ix = (ox * s0 + kx) as isize - p0;
                    let iy = (oy * s1 + ky) as isize - p1;
                    if (0..w as isize).contains(&ix) && (0..h as isize).contains(&iy) {
                        let v = a.at([ix as usize, iy as usize, ch, ni]);
                        acc = if is_max { acc.max(v) } else { acc + v };
                    }
                }
            }
            out[ox] = if is_max { acc } else { acc / (k0 * k1) as f32 };
        }
    }
}

/// Nearest-neighbor upscale of the first two dimensions.
pub(crate) fn upscale(ctx: &Context, params: &ComputeParams, id: TensorId) {
    if params.phase != TaskPhase::Compute {
        return;
    }
    let t = ctx.tensor(id);
    let sf = t.op_params_i32(0) as usize;
    let dst = ctx.tv(id);
    let a = ctx.tv(t.src[0].unwrap());
    let nr = dst.t.nrows();
    for ir in row_range(nr, params.ith, params.nth) {
        let (i1, i2, i3) = unravel_row(dst.t, ir);
        let out = dst.row_f32_mut(i1, i2, i3);
        for (i0, o) in out.iter_mut().enumerate() {
            *o = a.at([i0 / sf, i1 / sf, i2, i3]);
        }
    }
}

/// Splits `[C, W, H, 1]` into `w`×`w` windows, zero-padding the far
/// edges.
pub(crate) fn win_part(ctx: &Context, params: &ComputeParams, id: TensorId) {
    if params.phase != TaskPhase::Compute {
        return;
    }
    let t = ctx.tensor(id);
    let dst = ctx.tv(id);
    let a = ctx.tv(t.src[0].unwrap());
    let npx = t.op_params_i32(0) as usize;
    let w = t.op_params_i32(2) as usize;
    let (c, iw, ih) = (a.t.ne[0], a.t.ne[1], a.t.ne[2]);
    let np = dst.t.ne[3];
    for p in 0..np {
        let (px, py) = (p % npx, p / npx);
        for wy in 0..w {
            for wx in 0..w {
                let (x, y) = (px * w + wx, py * w + wy);
                for ci in 0..c {
                    let v = if x < iw && y < ih { a.at([ci, x, y, 0]) } else { 0.0 };
                    dst.put([ci, wx, wy, p], v);
                }
            }
        }
    }
}

/// Reassembles windows back into `[C, w0, h0, 1]`.
pub(crate) fn win_unpart(ctx: &Context, params: &ComputeParams, id: TensorId) {
    if params.phase != TaskPhase::Compute {
        return;
    }
    let t = ctx.tensor(id);
    let dst = ctx.tv(id);
    let a = ctx.tv(t.src[0].unwrap());
    let w = t.op_params_i32(0) as usize;
    let (c, w0, h0) = (dst.t.ne[0], dst.t.ne[1], dst.t.ne[2]);
    let npx = (w0 + (w - w0 % w) % w) / w;
    for y in 0..h0 {
        for x in 0..w0 {
            let p = (y / w) * npx + x / w;
            let (wx, wy) = (x % w, y % w);
            for ci in 0..c {
                dst.put([ci, x, y, 0], a.at([ci, wx, wy, p]));
            }
        }
    }
}

/// Fused scaled-dot-product attention: per query row, scores against every
/// key go into per-thread scratch, get softmaxed, then weight the value
/// columns. `v` must be stored transposed (`[M, D]`).
pub(crate) fn flash_attn(ctx: &Context, params: &ComputeParams, id: TensorId) {
    if params.phase != TaskPhase::Compute {
        return;
    }
    let t = ctx.tensor(id);
    let masked = t.op_params_i32(0) != 0;
    let dst = ctx.tv(id);
    let q = ctx.tv(t.src[0].unwrap());
    let kt = ctx.tv(t.src[1].unwrap());
    let v = ctx.tv(t.src[2].unwrap());
    let d = q.t.ne[0];
    let n = q.t.ne[1];
    let m = kt.t.ne[1];
    let scale = 1.0 / (d as f32).sqrt();
    let scores = unsafe { params.thread_scratch_f32(m) };
    let nr = q.t.nrows();
    let (kne, vne) = (kt.t.ne, v.t.ne);
    for ir in row_range(nr, params.ith, params.nth) {
        let (i1, i2, i3) = unravel_row(q.t, ir);
        let q_row = q.row_f32(i1, i2, i3);
        let (k2, k3) = (i2 % kne[2], i3 % kne[3]);
        for (mi, s) in scores.iter_mut().enumerate() {
            *s = if masked && mi as isize > m as isize - n as isize + i1 as isize {
                f32::NEG_INFINITY
            } else {
                vec_dot_f32(q_row, kt.row_f32(mi, k2, k3)) * scale
            };
        }
        let max = scores.iter().copied().fold(f32::NEG_INFINITY, f32::max);
        let mut sum = 0.0f32;
        for s in scores.iter_mut() {
            if *s == f32::NEG_INFINITY {
                *s = 0.0;
            } else {
                *s = (*s - max).exp();
                sum += *s;
            }
        }
        let inv = 1.0 / sum;
        for s in scores.iter_mut() {
            *s *= inv;
        }
        let out = dst.row_f32_mut(i1, i2, i3);
        let (v2, v3) = (i2 % vne[2], i3 % vne[3]);
        for (di, o) in out.iter_mut().enumerate() {
            *o = vec_dot_f32(scores, v.row_f32(di, v2, v3));
        }
    }
}
