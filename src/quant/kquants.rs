//! 256-element K-quant superblock codecs.
//!
//! Each format stores sub-block scales (and for the asymmetric formats,
//! sub-block minima) quantized to 4 or 6 bits under a super-block scale
//! pair, then packs the per-element quants at 2–8 bits. The reference
//! quantizers below follow the canonical fitting procedure: per-sub-block
//! least-squares scale search, super-block scale quantization, then a
//! requantization pass against the scales actually stored.
//!
//! All dot products pair with [`BlockQ8K`] on the right-hand side.

use half::f16;

use super::blocks::*;
use crate::context::globals::fp16_to_f32;

#[inline]
fn nearest(x: f32) -> i32 {
    x.round() as i32
}

/// Least-squares symmetric scale fit for one sub-block: maps the signed
/// extreme onto `-nmax` then searches nearby scales for a lower weighted
/// rmse. Writes unsigned quants `l + nmax` into `l_out`.
fn make_qx_quants(nmax: i32, x: &[f32], l_out: &mut [u8], rmse_fit: bool) -> f32 {
    let mut amax = 0.0f32;
    let mut max = 0.0f32;
    for &v in x {
        if v.abs() > amax {
            amax = v.abs();
            max = v;
        }
    }
    if amax == 0.0 {
        l_out.fill(0);
        return 0.0;
    }
    let mut iscale = -(nmax as f32) / max;
    if !rmse_fit {
        for (l, &v) in l_out.iter_mut().zip(x) {
            let q = nearest(iscale * v).clamp(-nmax, nmax - 1);
            *l = (q + nmax) as u8;
        }
        return 1.0 / iscale;
    }
    let mut sumlx = 0.0f32;
    let mut suml2 = 0.0f32;
    for (l, &v) in l_out.iter_mut().zip(x) {
        let q = nearest(iscale * v).clamp(-nmax, nmax - 1);
        *l = (q + nmax) as u8;
        let w = v * v;
        sumlx += w * v * q as f32;
        suml2 += w * (q * q) as f32;
    }
    let mut scale = sumlx / suml2;
    let mut best = scale * sumlx;
    for is in -9..=9 {
        if is == 0 {
            continue;
        }
        iscale = -(nmax as f32 + 0.1 * is as f32) / max;
        let mut slx = 0.0f32;
        let mut sl2 = 0.0f32;
        for &v in x {
            let q = nearest(iscale * v).clamp(-nmax, nmax - 1);
            let w = v * v;
            slx += w * v * q as f32;
            sl2 += w * (q * q) as f32;
        }
        if sl2 > 0.0 && slx * slx > best * sl2 {
            for (l, &v) in l_out.iter_mut().zip(x) {
                let q = nearest(iscale * v).clamp(-nmax, nmax - 1);
                *l = (q + nmax) as u8;
            }
            scale = slx / sl2;
            best = scale * slx;
        }
    }
    scale
}

/// Iterative min/max fit for one sub-block of an asymmetric format.
/// Returns `(scale, min)` with `min >= 0` (the stored minimum is negated).
fn make_qkx1_quants(nmax: i32, x: &[f32], l_out: &mut [u8], ntry: usize) -> (f32, f32) {
    let n = x.len();
    let mut min = x.iter().copied().fold(f32::INFINITY, f32::min);
    let max = x.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    if max == min {
        l_out.fill(0);
        return (0.0, 0.0);
    }
    if min > 0.0 {
        min = 0.0;
    }
    let mut iscale = nmax as f32 / (max - min);
    let mut scale = 1.0 / iscale;
    for _ in 0..ntry {
        let mut sumlx = 0.0f32;
        let mut suml2 = 0i32;
        let mut did_change = false;
        for (l, &v) in l_out.iter_mut().zip(x) {
            let q = nearest(iscale * (v - min)).clamp(0, nmax);
            if q as u8 != *l {
                *l = q as u8;
                did_change = true;
            }
            sumlx += (v - min) * q as f32;
            suml2 += q * q;
        }
        scale = sumlx / suml2 as f32;
        let sum: f32 = l_out.iter().zip(x).map(|(&l, &v)| v - scale * l as f32).sum();
        min = sum / n as f32;
        if min > 0.0 {
            min = 0.0;
        }
        iscale = 1.0 / scale;
        if !did_change {
            break;
        }
    }
    (scale, -min)
}

/// Per-element rmse refinement used by the 3-bit format.
fn make_q3_quants(nmax: i32, x: &[f32], l_out: &mut [i8]) -> f32 {
    let mut amax = 0.0f32;
    let mut max = 0.0f32;
    for &v in x {
        if v.abs() > amax {
            amax = v.abs();
            max = v;
        }
    }
    if amax == 0.0 {
        l_out.fill(0);
        return 0.0;
    }
    let iscale = -(nmax as f32) / max;
    let mut sumlx = 0.0f32;
    let mut suml2 = 0.0f32;
    for (l, &v) in l_out.iter_mut().zip(x) {
        let q = nearest(iscale * v).clamp(-nmax, nmax - 1);
        *l = q as i8;
        let w = v * v;
        sumlx += w * v * q as f32;
        suml2 += w * (q * q) as f32;
    }
    for _ in 0..5 {
        let mut n_changed = 0;
        for (i, &v) in x.iter().enumerate() {
            let w = v * v;
            let mut slx = sumlx - w * v * l_out[i] as f32;
            if slx > 0.0 {
                let mut sl2 = suml2 - w * (l_out[i] as i32 * l_out[i] as i32) as f32;
                let new_l = nearest(v * sl2 / slx).clamp(-nmax, nmax - 1);
                if new_l != l_out[i] as i32 {
                    slx += w * v * new_l as f32;
                    sl2 += w * (new_l * new_l) as f32;
                    if sl2 > 0.0 && slx * slx * suml2 > sumlx * sumlx * sl2 {
                        l_out[i] = new_l as i8;
                        sumlx = slx;
                        suml2 = sl2;
                        n_changed += 1;
                    }
                }
            }
        }
        if n_changed == 0 {
            break;
        }
    }
    for l in l_out.iter_mut() {
        *l += nmax as i8;
    }
    sumlx / suml2
}

/// Unpacks the (scale, min) pair `j` (0..8) from the shared 12-byte table
/// used by the 4- and 5-bit superblock formats.
#[inline]
fn get_scale_min_k4(j: usize, q: &[u8; K_SCALE_SIZE]) -> (u8, u8) {
    if j < 4 {
        (q[j] & 63, q[j + 4] & 63)
    } else {
        (
            (q[j + 4] & 0x0F) | ((q[j - 4] >> 6) << 4),
            (q[j + 4] >> 4) | ((q[j] >> 6) << 4),
        )
    }
}

// ---------------------------------------------------------------------------
// Q2K
// ---------------------------------------------------------------------------

pub fn quantize_row_q2k_reference(x: &[f32], y: &mut [BlockQ2K]) {
    assert_eq!(x.len(), y.len() * QK_K);
    for (block, xb) in y.iter_mut().zip(x.chunks_exact(QK_K)) {
        let mut l = [0u8; QK_K];
        let mut scales = [0.0f32; QK_K / 16];
        let mut mins = [0.0f32; QK_K / 16];
        for ib in 0..QK_K / 16 {
            let (s, m) =
                make_qkx1_quants(3, &xb[16 * ib..16 * (ib + 1)], &mut l[16 * ib..16 * (ib + 1)], 5);
            scales[ib] = s;
            mins[ib] = m;
        }
        let max_scale = scales.iter().copied().fold(0.0f32, f32::max);
        let max_min = mins.iter().copied().fold(0.0f32, f32::max);
        block.scales.fill(0);
        if max_scale > 0.0 {
            let iscale = 15.0 / max_scale;
            for (bs, &s) in block.scales.iter_mut().zip(&scales) {
                *bs = nearest(iscale * s) as u8;
            }
            block.d = f16::from_f32(max_scale / 15.0);
        } else {
            block.d = f16::from_f32(0.0);
        }
        if max_min > 0.0 {
            let iscale = 15.0 / max_min;
            for (bs, &m) in block.scales.iter_mut().zip(&mins) {
                *bs |= (nearest(iscale * m) as u8) << 4;
            }
            block.dmin = f16::from_f32(max_min / 15.0);
        } else {
            block.dmin = f16::from_f32(0.0);
        }
        for ib in 0..QK_K / 16 {
            let d = fp16_to_f32(block.d) * (block.scales[ib] & 0x0F) as f32;
            if d == 0.0 {
                continue;
            }
            let dm = fp16_to_f32(block.dmin) * (block.scales[ib] >> 4) as f32;
            for i in 0..16 {
                l[16 * ib + i] = nearest((xb[16 * ib + i] + dm) / d).clamp(0, 3) as u8;
            }
        }
        for j in (0..QK_K).step_by(128) {
            for i in 0..32 {
                block.qs[j / 4 + i] = l[j + i]
                    | (l[j + i + 32] << 2)
                    | (l[j + i + 64] << 4)
                    | (l[j + i + 96] << 6);
            }
        }
    }
}

pub fn dequantize_row_q2k(x: &[BlockQ2K], y: &mut [f32]) {
    assert_eq!(y.len(), x.len() * QK_K);
    for (block, yb) in x.iter().zip(y.chunks_exact_mut(QK_K)) {
        let d = fp16_to_f32(block.d);
        let min = fp16_to_f32(block.dmin);
        for (e, out) in yb.iter_mut().enumerate() {
            let shift = 2 * ((e % 128) / 32);
            let q = (block.qs[(e / 128) * 32 + e % 32] >> shift) & 3;
            let sc = block.scales[e / 16];
            *out = d * (sc & 0x0F) as f32 * q as f32 - min * (sc >> 4) as f32;
        }
    }
}

pub fn vec_dot_q2k_q8k(n: usize, x: &[BlockQ2K], y: &[BlockQ8K]) -> f32 {
    let nb = n / QK_K;
    let mut sumf = 0.0f32;
    for i in 0..nb {
        let mut summs = 0i32;
        for (j, &b) in y[i].bsums.iter().enumerate() {
            summs += b as i32 * (x[i].scales[j] >> 4) as i32;
        }
        let mut isum = 0i32;
        for j in 0..QK_K / 16 {
            let mut sum16 = 0i32;
            for k in 0..16 {
                let e = 16 * j + k;
                let shift = 2 * ((e % 128) / 32);
                let q = (x[i].qs[(e / 128) * 32 + e % 32] >> shift) & 3;
                sum16 += q as i32 * y[i].qs[e] as i32;
            }
            isum += (x[i].scales[j] & 0x0F) as i32 * sum16;
        }
        let dall = y[i].d * fp16_to_f32(x[i].d);
        let dmin = y[i].d * fp16_to_f32(x[i].dmin);
        sumf += dall * isum as f32 - dmin * summs as f32;
    }
    sumf
}

// ---------------------------------------------------------------------------
// Q3K
// ---------------------------------------------------------------------------

#[inline]
fn q3k_scale(scales: &[u8; K_SCALE_SIZE], j: usize) -> i32 {
    let low = if j < 8 { scales[j] & 0x0F } else { scales[j - 8] >> 4 };
    let high = (scales[8 + j % 4] >> (2 * (j / 4))) & 3;
    ((low as i32) | ((high as i32) << 4)) - 32
}

pub fn quantize_row_q3k_reference(x: &[f32], y: &mut [BlockQ3K]) {
    assert_eq!(x.len(), y.len() * QK_K);
    for (block, xb) in y.iter_mut().zip(x.chunks_exact(QK_K)) {
        let mut l = [0i8; QK_K];
        let mut scales = [0.0f32; QK_K / 16];
        for ib in 0..QK_K / 16 {
            let mut sub = [0i8; 16];
            scales[ib] = make_q3_quants(4, &xb[16 * ib..16 * (ib + 1)], &mut sub);
            l[16 * ib..16 * (ib + 1)].copy_from_slice(&sub);
        }
        let mut max_scale = 0.0f32;
        let mut amax_scale = 0.0f32;
        for &s in &scales {
            if s.abs() > amax_scale {
                amax_scale = s.abs();
                max_scale = s;
            }
        }
        block.scales.fill(0);
        if max_scale != 0.0 {
            let iscale = -32.0 / max_scale;
            for (j, &s) in scales.iter().enumerate() {
                let q = (nearest(iscale * s).clamp(-32, 31) + 32) as u8;
                if j < 8 {
                    block.scales[j] |= q & 0x0F;
                } else {
                    block.scales[j - 8] |= (q & 0x0F) << 4;
                }
                block.scales[8 + j % 4] |= (q >> 4) << (2 * (j / 4));
            }
            block.d = f16::from_f32(1.0 / iscale);
        } else {
            block.d = f16::from_f32(0.0);
        }
        for ib in 0..QK_K / 16 {
            let sc = q3k_scale(&block.scales, ib);
            let d = fp16_to_f32(block.d) * sc as f32;
            if d == 0.0 {
                continue;
            }
            for i in 0..16 {
                let q = nearest(xb[16 * ib + i] / d).clamp(-4, 3);
                l[16 * ib + i] = (q + 4) as i8;
            }
        }
        block.hmask.fill(0);
        let mut m = 0usize;
        let mut hm = 1u8;
        for q in l.iter_mut() {
            if *q > 3 {
                block.hmask[m] |= hm;
                *q -= 4;
            }
            m += 1;
            if m == QK_K / 8 {
                m = 0;
                hm <<= 1;
            }
        }
        for j in (0..QK_K).step_by(128) {
            for i in 0..32 {
                block.qs[j / 4 + i] = l[j + i] as u8
                    | ((l[j + i + 32] as u8) << 2)
                    | ((l[j + i + 64] as u8) << 4)
                    | ((l[j + i + 96] as u8) << 6);
            }
        }
    }
}

#[inline]
fn q3k_value(block: &BlockQ3K, e: usize) -> i32 {
    let shift = 2 * ((e % 128) / 32);
    let q = ((block.qs[(e / 128) * 32 + e % 32] >> shift) & 3) as i32;
    let high = block.hmask[e % 32] & (1 << (e / 32));
    q - if high != 0 { 0 } else { 4 }
}

pub fn dequantize_row_q3k(x: &[BlockQ3K], y: &mut [f32]) {
    assert_eq!(y.len(), x.len() * QK_K);
    for (block, yb) in x.iter().zip(y.chunks_exact_mut(QK_K)) {
        let d = fp16_to_f32(block.d);
        for (e, out) in yb.iter_mut().enumerate() {
            let sc = q3k_scale(&block.scales, e / 16);
            *out = d * sc as f32 * q3k_value(block, e) as f32;
        }
    }
}

pub fn vec_dot_q3k_q8k(n: usize, x: &[BlockQ3K], y: &[BlockQ8K]) -> f32 {
    let nb = n / QK_K;
    let mut sumf = 0.0f32;
    for i in 0..nb {
        let mut isum = 0i32;
        for j in 0..QK_K / 16 {
            let mut sum16 = 0i32;
            for k in 0..16 {
                let e = 16 * j + k;
                sum16 += q3k_value(&x[i], e) * y[i].qs[e] as i32;
            }
            isum += q3k_scale(&x[i].scales, j) * sum16;
        }
        sumf += y[i].d * fp16_to_f32(x[i].d) * isum as f32;
    }
    sumf
}

// ---------------------------------------------------------------------------
// Q4K
// ---------------------------------------------------------------------------

fn pack_scales_k4(scales: &[f32; 8], mins: &[f32; 8], inv_scale: f32, inv_min: f32) -> [u8; K_SCALE_SIZE] {
    let mut packed = [0u8; K_SCALE_SIZE];
    for j in 0..8 {
        let ls = nearest(inv_scale * scales[j]).min(63) as u8;
        let lm = nearest(inv_min * mins[j]).min(63) as u8;
        if j < 4 {
            packed[j] = ls;
            packed[j + 4] = lm;
        } else {
            packed[j + 4] = (ls & 0x0F) | ((lm & 0x0F) << 4);
            packed[j - 4] |= (ls >> 4) << 6;
            packed[j] |= (lm >> 4) << 6;
        }
    }
    packed
}

pub fn quantize_row_q4k_reference(x: &[f32], y: &mut [BlockQ4K]) {
    assert_eq!(x.len(), y.len() * QK_K);
    for (block, xb) in y.iter_mut().zip(x.chunks_exact(QK_K)) {
        let mut l = [0u8; QK_K];
        let mut scales = [0.0f32; 8];
        let mut mins = [0.0f32; 8];
        for ib in 0..8 {
            let (s, m) = make_qkx1_quants(
                15,
                &xb[32 * ib..32 * (ib + 1)],
                &mut l[32 * ib..32 * (ib + 1)],
                5,
            );
            scales[ib] = s;
            mins[ib] = m;
        }
        let max_scale = scales.iter().copied().fold(0.0f32, f32::max);
        let max_min = mins.iter().copied().fold(0.0f32, f32::max);
        let inv_scale = if max_scale > 0.0 { 63.0 / max_scale } else { 0.0 };
        let inv_min = if max_min > 0.0 { 63.0 / max_min } else { 0.0 };
        block.scales = pack_scales_k4(&scales, &mins, inv_scale, inv_min);
        block.d = f16::from_f32(max_scale / 63.0);
        block.dmin = f16::from_f32(max_min / 63.0);
        for ib in 0..8 {
            let (sc, m) = get_scale_min_k4(ib, &block.scales);
            let d = fp16_to_f32(block.d) * sc as f32;
            if d == 0.0 {
                continue;
            }
            let dm = fp16_to_f32(block.dmin) * m as f32;
            for i in 0..32 {
                l[32 * ib + i] = nearest((xb[32 * ib + i] + dm) / d).clamp(0, 15) as u8;
            }
        }
        for j in (0..QK_K).step_by(64) {
            for i in 0..32 {
                block.qs[j / 2 + i] = l[j + i] | (l[j + i + 32] << 4);
            }
        }
    }
}

pub fn dequantize_row_q4k(x: &[BlockQ4K], y: &mut [f32]) {
    assert_eq!(y.len(), x.len() * QK_K);
    for (block, yb) in x.iter().zip(y.chunks_exact_mut(QK_K)) {
        let d = fp16_to_f32(block.d);
        let min = fp16_to_f32(block.dmin);
        for (e, out) in yb.iter_mut().enumerate() {
            let qs = block.qs[(e / 64) * 32 + e % 32];
            let q = if (e % 64) < 32 { qs & 0x0F } else { qs >> 4 };
            let (sc, m) = get_scale_min_k4(e / 32, &block.scales);
            *out = d * sc as f32 * q as f32 - min * m as f32;
        }
    }
}

pub fn vec_dot_q4k_q8k(n: usize, x: &[BlockQ4K], y: &[BlockQ8K]) -> f32 {
    let nb = n / QK_K;
    let mut sumf = 0.0f32;
    for i in 0..nb {
        let mut sumi_mins = 0i32;
        let mut isum = 0i32;
        for j in 0..8 {
            let (sc, m) = get_scale_min_k4(j, &x[i].scales);
            sumi_mins += m as i32 * (y[i].bsums[2 * j] as i32 + y[i].bsums[2 * j + 1] as i32);
            let mut sum32 = 0i32;
            for k in 0..32 {
                let e = 32 * j + k;
                let qs = x[i].qs[(e / 64) * 32 + e % 32];
                let q = if (e % 64) < 32 { qs & 0x0F } else { qs >> 4 };
                sum32 += q as i32 * y[i].qs[e] as i32;
            }
            isum += sc as i32 * sum32;
        }
        let dall = y[i].d * fp16_to_f32(x[i].d);
        let dmin = y[i].d * fp16_to_f32(x[i].dmin);
        sumf += dall * isum as f32 - dmin * sumi_mins as f32;
    }
    sumf
}

// ---------------------------------------------------------------------------
// Q5K
// ---------------------------------------------------------------------------

pub fn quantize_row_q5k_reference(x: &[f32], y: &mut [BlockQ5K]) {
    assert_eq!(x.len(), y.len() * QK_K);
    for (block, xb) in y.iter_mut().zip(x.chunks_exact(QK_K)) {
        let mut l = [0u8; QK_K];
        let mut scales = [0.0f32; 8];
        let mut mins = [0.0f32; 8];
        for ib in 0..8 {
            let (s, m) = make_qkx1_quants(
                31,
                &xb[32 * ib..32 * (ib + 1)],
                &mut l[32 * ib..32 * (ib + 1)],
                5,
            );
            scales[ib] = s;
            mins[ib] = m;
        }
        let max_scale = scales.iter().copied().fold(0.0f32, f32::max);
        let max_min = mins.iter().copied().fold(0.0f32, f32::max);
        let inv_scale = if max_scale > 0.0 { 63.0 / max_scale } else { 0.0 };
        let inv_min = if max_min > 0.0 { 63.0 / max_min } else { 0.0 };
        block.scales = pack_scales_k4(&scales, &mins, inv_scale, inv_min);
        block.d = f16::from_f32(max_scale / 63.0);
        block.dmin = f16::from_f32(max_min / 63.0);
        for ib in 0..8 {
            let (sc, m) = get_scale_min_k4(ib, &block.scales);
            let d = fp16_to_f32(block.d) * sc as f32;
            if d == 0.0 {
                continue;
            }
            let dm = fp16_to_f32(block.dmin) * m as f32;
            for i in 0..32 {
                l[32 * ib + i] = nearest((xb[32 * ib + i] + dm) / d).clamp(0, 31) as u8;
            }
        }
        block.qh.fill(0);
        let mut m1 = 1u8;
        let mut m2 = 2u8;
        for j in (0..QK_K).step_by(64) {
            for i in 0..32 {
                let mut l1 = l[j + i];
                if l1 > 15 {
                    l1 -= 16;
                    block.qh[i] |= m1;
                }
                let mut l2 = l[j + i + 32];
                if l2 > 15 {
                    l2 -= 16;
                    block.qh[i] |= m2;
                }
                block.qs[j / 2 + i] = l1 | (l2 << 4);
            }
            m1 <<= 2;
            m2 <<= 2;
        }
    }
}

#[inline]
fn q5k_value(block: &BlockQ5K, e: usize) -> i32 {
    let qs = block.qs[(e / 64) * 32 + e % 32];
    let low = if (e % 64) < 32 { qs & 0x0F } else { qs >> 4 };
    let bit = 1u8 << (2 * (e / 64) + (e % 64) / 32);
    low as i32 + if block.qh[e % 32] & bit != 0 { 16 } else { 0 }
}

pub fn dequantize_row_q5k(x: &[BlockQ5K], y: &mut [f32]) {
    assert_eq!(y.len(), x.len() * QK_K);
    for (block, yb) in x.iter().zip(y.chunks_exact_mut(QK_K)) {
        let d = fp16_to_f32(block.d);
        let min = fp16_to_f32(block.dmin);
        for (e, out) in yb.iter_mut().enumerate() {
            let (sc, m) = get_scale_min_k4(e / 32, &block.scales);
            *out = d * sc as f32 * q5k_value(block, e) as f32 - min * m as f32;
        }
    }
}

pub fn vec_dot_q5k_q8k(n: usize, x: &[BlockQ5K], y: &[BlockQ8K]) -> f32 {
    let nb = n / QK_K;
    let mut sumf = 0.0f32;
    for i in 0..nb {
        let mut sumi_mins = 0i32;
        let mut isum = 0i32;
        for j in 0..8 {
            let (sc, m) = get_scale_min_k4(j, &x[i].scales);
            sumi_mins += m as i32 * (y[i].bsums[2 * j] as i32 + y[i].bsums[2 * j + 1] as i32);
            let mut sum32 = 0i32;
            for k in 0..32 {
                let e = 32 * j + k;
                sum32 += q5k_value(&x[i], e) * y[i].qs[e] as i32;
            }
            isum += sc as i32 * sum32;
        }
        let dall = y[i].d * fp16_to_f32(x[i].d);
        let dmin = y[i].d * fp16_to_f32(x[i].dmin);
        sumf += dall * isum as f32 - dmin * sumi_mins as f32;
    }
    sumf
}

// ---------------------------------------------------------------------------
// Q6K
// ---------------------------------------------------------------------------

pub fn quantize_row_q6k_reference(x: &[f32], y: &mut [BlockQ6K]) {
    assert_eq!(x.len(), y.len() * QK_K);
    for (block, xb) in y.iter_mut().zip(x.chunks_exact(QK_K)) {
        let mut l = [0u8; QK_K];
        let mut scales = [0.0f32; QK_K / 16];
        let mut max_scale = 0.0f32;
        let mut amax_scale = 0.0f32;
        for ib in 0..QK_K / 16 {
            let s = make_qx_quants(32, &xb[16 * ib..16 * (ib + 1)], &mut l[16 * ib..16 * (ib + 1)], true);
            scales[ib] = s;
            if s.abs() > amax_scale {
                amax_scale = s.abs();
                max_scale = s;
            }
        }
        if max_scale == 0.0 {
            block.ql.fill(0);
            block.qh.fill(0);
            block.scales.fill(0);
            block.d = f16::from_f32(0.0);
            continue;
        }
        let iscale = -128.0 / max_scale;
        block.d = f16::from_f32(1.0 / iscale);
        for (bs, &s) in block.scales.iter_mut().zip(&scales) {
            *bs = nearest(iscale * s).min(127) as i8;
        }
        for ib in 0..QK_K / 16 {
            let d = fp16_to_f32(block.d) * block.scales[ib] as f32;
            if d == 0.0 {
                continue;
            }
            for i in 0..16 {
                let q = nearest(xb[16 * ib + i] / d).clamp(-32, 31);
                l[16 * ib + i] = (q + 32) as u8;
            }
        }
        for j in (0..QK_K).step_by(128) {
            for i in 0..32 {
                let q1 = l[j + i] & 0x0F;
                let q2 = l[j + i + 32] & 0x0F;
                let q3 = l[j + i + 64] & 0x0F;
                let q4 = l[j + i + 96] & 0x0F;
                block.ql[j / 2 + i] = q1 | (q3 << 4);
                block.ql[j / 2 + i + 32] = q2 | (q4 << 4);
                block.qh[j / 4 + i] = (l[j + i] >> 4)
                    | ((l[j + i + 32] >> 4) << 2)
                    | ((l[j + i + 64] >> 4) << 4)
                    | ((l[j + i + 96] >> 4) << 6);
            }
        }
    }
}

#[inline]
fn q6k_value(block: &BlockQ6K, e: usize) -> i32 {
    let chunk = e / 128;
    let r = e % 128;
    let i = r % 32;
    let m = r / 32;
    let low = match m {
        0 => block.ql[chunk * 64 + i] & 0x0F,
        1 => block.ql[chunk * 64 + 32 + i] & 0x0F,
        2 => block.ql[chunk * 64 + i] >> 4,
        _ => block.ql[chunk * 64 + 32 + i] >> 4,
    };
    let high = (block.qh[chunk * 32 + i] >> (2 * m)) & 3;
    (low as i32 | ((high as i32) << 4)) - 32
}

pub fn dequantize_row_q6k(x: &[BlockQ6K], y: &mut [f32]) {
    assert_eq!(y.len(), x.len() * QK_K);
    for (block, yb) in x.iter().zip(y.chunks_exact_mut(QK_K)) {
        let d = fp16_to_f32(block.d);
        for (e, out) in yb.iter_mut().enumerate() {
            *out = d * block.scales[e / 16] as f32 * q6k_value(block, e) as f32;
        }
    }
}

pub fn vec_dot_q6k_q8k(n: usize, x: &[BlockQ6K], y: &[BlockQ8K]) -> f32 {
    let nb = n / QK_K;
    let mut sumf = 0.0f32;
    for i in 0..nb {
        let mut isum = 0i32;
        for j in 0..QK_K / 16 {
            let mut sum16 = 0i32;
            for k in 0..16 {
                let e = 16 * j + k;
                sum16 += q6k_value(&x[i], e) * y[i].qs[e] as i32;
            }
            isum += x[i].scales[j] as i32 * sum16;
        }
        sumf += y[i].d * fp16_to_f32(x[i].d) * isum as f32;
    }
    sumf
}

// ---------------------------------------------------------------------------
// Q8K
// ---------------------------------------------------------------------------

pub fn quantize_row_q8k_reference(x: &[f32], y: &mut [BlockQ8K]) {
    assert_eq!(x.len(), y.len() * QK_K);
    for (block, xb) in y.iter_mut().zip(x.chunks_exact(QK_K)) {
        let mut amax = 0.0f32;
        let mut max = 0.0f32;
        for &v in xb {
            if v.abs() > amax {
                amax = v.abs();
                max = v;
            }
        }
        if amax == 0.0 {
            block.d = 0.0;
            block.qs.fill(0);
            block.bsums.fill(0);
            continue;
        }
        let iscale = -128.0 / max;
        for (q, &v) in block.qs.iter_mut().zip(xb) {
            *q = nearest(iscale * v).clamp(-128, 127) as i8;
        }
        for j in 0..QK_K / 16 {
            let sum: i32 = block.qs[16 * j..16 * (j + 1)].iter().map(|&q| q as i32).sum();
            block.bsums[j] = sum as i16;
        }
        block.d = 1.0 / iscale;
    }
}

pub fn dequantize_row_q8k(x: &[BlockQ8K], y: &mut [f32]) {
    assert_eq!(y.len(), x.len() * QK_K);
    for (block, yb) in x.iter().zip(y.chunks_exact_mut(QK_K)) {
        for (out, &q) in yb.iter_mut().zip(&block.qs) {
            *out = block.d * q as f32;
        }
    }
}

pub fn vec_dot_q8k_q8k(n: usize, x: &[BlockQ8K], y: &[BlockQ8K]) -> f32 {
    let nb = n / QK_K;
    let mut sumf = 0.0f32;
    for i in 0..nb {
        let mut sumi = 0i32;
        for j in 0..QK_K {
            sumi += x[i].qs[j] as i32 * y[i].qs[j] as i32;
        }
        sumf += sumi as f32 * x[i].d * y[i].d;
    }
    sumf
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ramp(n: usize) -> Vec<f32> {
        (0..n).map(|i| (i as f32 * 0.37).sin() * 4.0).collect()
    }

    #[test]
    fn q6k_round_trip_is_tight() {
        let x = ramp(QK_K);
        let mut blocks = vec![
            BlockQ6K {
                ql: [0; QK_K / 2],
                qh: [0; QK_K / 4],
                scales: [0; QK_K / 16],
                d: f16::from_f32(0.0),
            };
            1
        ];
        quantize_row_q6k_reference(&x, &mut blocks);
        let mut y = vec![0.0f32; QK_K];
        dequantize_row_q6k(&blocks, &mut y);
        let amax = x.iter().fold(0.0f32, |a, v| a.max(v.abs()));
        for (a, b) in x.iter().zip(&y) {
            assert!((a - b).abs() <= amax / 16.0, "{a} vs {b}");
        }
    }

    #[test]
    fn q8k_bsums_are_consistent() {
        let x = ramp(QK_K);
        let mut blocks = vec![
            BlockQ8K { d: 0.0, qs: [0; QK_K], bsums: [0; QK_K / 16] };
            1
        ];
        quantize_row_q8k_reference(&x, &mut blocks);
        for j in 0..QK_K / 16 {
            let sum: i32 = blocks[0].qs[16 * j..16 * (j + 1)].iter().map(|&q| q as i32).sum();
            assert_eq!(sum as i16, blocks[0].bsums[j]);
        }
    }

    #[test]
    fn scale_min_packing_round_trips() {
        let scales = [3.0f32, 1.5, 0.3, 2.2, 1.1, 0.9, 2.7, 1.9];
        let mins = [0.4f32, 0.1, 0.2, 0.5, 0.3, 0.6, 0.2, 0.1];
        let packed = pack_scales_k4(&scales, &mins, 63.0 / 3.0, 63.0 / 0.6);
        for j in 0..8 {
            let (sc, m) = get_scale_min_k4(j, &packed);
            assert_eq!(sc as i32, nearest(63.0 / 3.0 * scales[j]).min(63));
            assert_eq!(m as i32, nearest(63.0 / 0.6 * mins[j]).min(63));
        }
    }
}
