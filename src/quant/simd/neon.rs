//! NEON dot kernels for aarch64.
//!
//! Uses the widening `vmull_s8` path, available on every aarch64 core, so
//! no runtime feature detection is needed.

use std::arch::aarch64::*;

use crate::context::globals::fp16_to_f32;
use crate::quant::blocks::*;

#[inline]
unsafe fn block_sum_i32(vx0: int8x16_t, vx1: int8x16_t, vy0: int8x16_t, vy1: int8x16_t) -> i32 {
    let p0 = vmull_s8(vget_low_s8(vx0), vget_low_s8(vy0));
    let p1 = vmull_s8(vget_high_s8(vx0), vget_high_s8(vy0));
    let p2 = vmull_s8(vget_low_s8(vx1), vget_low_s8(vy1));
    let p3 = vmull_s8(vget_high_s8(vx1), vget_high_s8(vy1));
    let s = vaddq_s32(
        vaddq_s32(vpaddlq_s16(p0), vpaddlq_s16(p1)),
        vaddq_s32(vpaddlq_s16(p2), vpaddlq_s16(p3)),
    );
    vaddvq_s32(s)
}

pub unsafe fn vec_dot_q4_0_q8_0(n: usize, x: &[BlockQ4_0], y: &[BlockQ8_0]) -> f32 {
    let nb = n / QK8_0;
    let m4 = vdupq_n_u8(0x0F);
    let s8 = vdupq_n_s8(8);
    let mut sumf = 0.0f32;
    for i in 0..nb {
        let v0 = vld1q_u8(x[i].qs.as_ptr());
        let lo = vsubq_s8(vreinterpretq_s8_u8(vandq_u8(v0, m4)), s8);
        let hi = vsubq_s8(vreinterpretq_s8_u8(vshrq_n_u8(v0, 4)), s8);
        let y0 = vld1q_s8(y[i].qs.as_ptr());
        let y1 = vld1q_s8(y[i].qs.as_ptr().add(16));
        let sumi = block_sum_i32(lo, hi, y0, y1);
        sumf += sumi as f32 * fp16_to_f32(x[i].d) * fp16_to_f32(y[i].d);
    }
    sumf
}

pub unsafe fn vec_dot_q8_0_q8_0(n: usize, x: &[BlockQ8_0], y: &[BlockQ8_0]) -> f32 {
    let nb = n / QK8_0;
    let mut sumf = 0.0f32;
    for i in 0..nb {
        let x0 = vld1q_s8(x[i].qs.as_ptr());
        let x1 = vld1q_s8(x[i].qs.as_ptr().add(16));
        let y0 = vld1q_s8(y[i].qs.as_ptr());
        let y1 = vld1q_s8(y[i].qs.as_ptr().add(16));
        let sumi = block_sum_i32(x0, x1, y0, y1);
        sumf += sumi as f32 * fp16_to_f32(x[i].d) * fp16_to_f32(y[i].d);
    }
    sumf
}

pub unsafe fn vec_dot_f32(x: &[f32], y: &[f32]) -> f32 {
    let n = x.len().min(y.len());
    let mut acc0 = vdupq_n_f32(0.0);
    let mut acc1 = vdupq_n_f32(0.0);
    let mut acc2 = vdupq_n_f32(0.0);
    let mut acc3 = vdupq_n_f32(0.0);
    let xp = x.as_ptr();
    let yp = y.as_ptr();
    let chunks = n / 16;
    for i in 0..chunks {
        let base = i * 16;
        acc0 = vfmaq_f32(acc0, vld1q_f32(xp.add(base)), vld1q_f32(yp.add(base)));
        acc1 = vfmaq_f32(acc1, vld1q_f32(xp.add(base + 4)), vld1q_f32(yp.add(base + 4)));
        acc2 = vfmaq_f32(acc2, vld1q_f32(xp.add(base + 8)), vld1q_f32(yp.add(base + 8)));
        acc3 = vfmaq_f32(acc3, vld1q_f32(xp.add(base + 12)), vld1q_f32(yp.add(base + 12)));
    }
    let mut sum = vaddvq_f32(vaddq_f32(vaddq_f32(acc0, acc1), vaddq_f32(acc2, acc3)));
    for i in chunks * 16..n {
        sum += x[i] * y[i];
    }
    sum
}
