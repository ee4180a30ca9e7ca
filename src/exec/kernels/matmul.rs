//! Matrix multiply and outer product.

use super::{row_range, unravel_row};
use crate::context::Context;
use crate::exec::{mul_mat_requant_dtype, ComputeParams, TaskPhase};
use crate::quant;
use crate::tensor::{Dtype, TensorId};

/// Tile edge for the (m, n) loops. Affects cache reuse only, never
/// results: each output element is still one `vec_dot` call.
const TILE: usize = 16;

/// `dst[m, n] = Σ_k a[k, m] · b[k, n]`, batched over the outer two axes
/// with `b`'s batches broadcast onto `a`'s.
///
/// INIT requantizes `b` row-wise into the work buffer whenever `a`'s dot
/// kernel needs a different right-hand format (e.g. Q4_0 pairs with Q8_0,
/// F16 with F16). COMPUTE partitions the output rows across workers.
pub(crate) fn mul_mat(ctx: &Context, params: &ComputeParams, id: TensorId) {
    let t = ctx.tensor(id);
    let dst = ctx.tv(id);
    let a = ctx.tv(t.src[0].unwrap());
    let b = ctx.tv(t.src[1].unwrap());
    let k = a.t.ne[0];
    let requant = mul_mat_requant_dtype(a.t.dtype, b.t.dtype);
    let b_row_size = match requant {
        Some(vdt) => vdt.row_size(k),
        None => b.t.row_size(),
    };

    match params.phase {
        TaskPhase::Init => {
            let Some(vdt) = requant else { return };
            assert_eq!(b.t.dtype, Dtype::F32, "mul_mat rhs must be f32 before requantization");
            let nrows = b.t.nrows();
            for ir in 0..nrows {
                let (i1, i2, i3) = unravel_row(b.t, ir);
                let out = unsafe {
                    std::slice::from_raw_parts_mut(params.work.add(ir * b_row_size), b_row_size)
                };
                quant::quantize_row(vdt, b.row_f32(i1, i2, i3), out);
            }
        }
        TaskPhase::Compute => {
            assert_eq!(a.t.nb[0], a.t.dtype.type_size(), "mul_mat lhs rows must be dense");
            let m = dst.t.ne[0];
            let nr = dst.t.nrows();
            let (ane, bne) = (a.t.ne, b.t.ne);
            for ir in row_range(nr, params.ith, params.nth) {
                let (i1, i2, i3) = unravel_row(dst.t, ir);
                let b_row: &[u8] = match requant {
                    Some(_) => unsafe {
                        let row_idx = i1 + i2 * bne[1] + i3 * bne[1] * bne[2];
                        std::slice::from_raw_parts(params.work.add(row_idx * b_row_size), b_row_size)
                    },
                    None => b.row_bytes(i1, i2, i3),
                };
                let out = dst.row_f32_mut(i1, i2, i3);
                let (a2, a3) = (i2 % ane[2], i3 % ane[3]);
                for m0 in (0..m).step_by(TILE) {
                    for mi in m0..(m0 + TILE).min(m) {
                        out[mi] = quant::vec_dot(a.t.dtype, k, a.row_bytes(mi, a2, a3), b_row);
                    }
                }
            }
        }
        TaskPhase::Finalize => {}
    }
}

/// `dst[i, j] = Σ_t a[i, t] · b[j, t]`. The destination is zeroed during
/// INIT; COMPUTE owns one destination row (fixed `j`) per iteration, so
/// the accumulation order per element is fixed regardless of thread
/// count.
pub(crate) fn out_prod(ctx: &Context, params: &ComputeParams, id: TensorId) {
    let t = ctx.tensor(id);
    let dst = ctx.tv(id);
    let a = ctx.tv(t.src[0].unwrap());
    let b = ctx.tv(t.src[1].unwrap());
    assert_eq!(a.t.dtype, Dtype::F32, "out_prod supports f32 operands");
    assert_eq!(b.t.dtype, Dtype::F32, "out_prod supports f32 operands");

    match params.phase {
        TaskPhase::Init => {
            let n = dst.t.nbytes();
            unsafe { std::ptr::write_bytes(dst.ptr, 0, n) };
        }
        TaskPhase::Compute => {
            let nr = dst.t.nrows();
            let contracted = a.t.ne[1];
            let ane = a.t.ne;
            for ir in row_range(nr, params.ith, params.nth) {
                let (j, i2, i3) = unravel_row(dst.t, ir);
                let out = dst.row_f32_mut(j, i2, i3);
                for ti in 0..contracted {
                    let coeff = b.at([j, ti, i2, i3]);
                    let a_row = a.row_f32(ti, i2 % ane[2], i3 % ane[3]);
                    for (o, &av) in out.iter_mut().zip(a_row) {
                        *o += coeff * av;
                    }
                }
            }
        }
        TaskPhase::Finalize => {}
    }
}
