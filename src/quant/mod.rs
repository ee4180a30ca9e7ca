//! Quantization codecs.
//!
//! A process-wide immutable [`Codec`] table maps each dtype to its block
//! geometry, (de)quantizers, and dot kernel. `from_float` is free to use
//! approximate SIMD rounding; `from_float_reference` is the deterministic
//! scalar contract used when bit-identity across implementations matters.
//! In this build the two coincide.

pub mod blocks;
pub mod kquants;
pub mod scalar;
pub mod simd;

use blocks::*;

use crate::tensor::Dtype;

/// Reinterprets a packed byte region as blocks. The region must be
/// block-aligned, which holds for arena tensors (16-byte base alignment,
/// strides in whole blocks).
pub(crate) fn cast_blocks<T>(bytes: &[u8]) -> &[T] {
    let size = std::mem::size_of::<T>();
    debug_assert_eq!(bytes.len() % size, 0);
    debug_assert_eq!(bytes.as_ptr() as usize % std::mem::align_of::<T>(), 0);
    unsafe { std::slice::from_raw_parts(bytes.as_ptr() as *const T, bytes.len() / size) }
}

pub(crate) fn cast_blocks_mut<T>(bytes: &mut [u8]) -> &mut [T] {
    let size = std::mem::size_of::<T>();
    debug_assert_eq!(bytes.len() % size, 0);
    debug_assert_eq!(bytes.as_ptr() as usize % std::mem::align_of::<T>(), 0);
    unsafe { std::slice::from_raw_parts_mut(bytes.as_mut_ptr() as *mut T, bytes.len() / size) }
}

/// Per-dtype capability entry.
pub struct Codec {
    pub block_size: usize,
    pub type_size: usize,
    pub to_float: fn(&[u8], &mut [f32]),
    pub from_float: fn(&[f32], &mut [u8]),
    pub from_float_reference: fn(&[f32], &mut [u8]),
    /// `vec_dot(n, a, b)` with `b` encoded as `vec_dot_type`.
    pub vec_dot: fn(usize, &[u8], &[u8]) -> f32,
    pub vec_dot_type: Dtype,
}

macro_rules! quant_codec {
    ($block:ty, $bs:expr, $quant:path, $dequant:path, $dot:path, $dot_rhs:ty, $dot_ty:expr) => {
        Codec {
            block_size: $bs,
            type_size: std::mem::size_of::<$block>(),
            to_float: |src, dst| $dequant(cast_blocks::<$block>(src), dst),
            from_float: |src, dst| $quant(src, cast_blocks_mut::<$block>(dst)),
            from_float_reference: |src, dst| $quant(src, cast_blocks_mut::<$block>(dst)),
            vec_dot: |n, a, b| $dot(n, cast_blocks::<$block>(a), cast_blocks::<$dot_rhs>(b)),
            vec_dot_type: $dot_ty,
        }
    };
}

static F32_CODEC: Codec = Codec {
    block_size: 1,
    type_size: 4,
    to_float: |src, dst| dst.copy_from_slice(cast_blocks::<f32>(src)),
    from_float: |src, dst| cast_blocks_mut::<f32>(dst).copy_from_slice(src),
    from_float_reference: |src, dst| cast_blocks_mut::<f32>(dst).copy_from_slice(src),
    vec_dot: |_, a, b| simd::vec_dot_f32(cast_blocks::<f32>(a), cast_blocks::<f32>(b)),
    vec_dot_type: Dtype::F32,
};

static F16_CODEC: Codec = Codec {
    block_size: 1,
    type_size: 2,
    to_float: |src, dst| {
        for (out, h) in dst.iter_mut().zip(cast_blocks::<half::f16>(src)) {
            *out = crate::context::globals::fp16_to_f32(*h);
        }
    },
    from_float: |src, dst| {
        for (out, &v) in cast_blocks_mut::<half::f16>(dst).iter_mut().zip(src) {
            *out = half::f16::from_f32(v);
        }
    },
    from_float_reference: |src, dst| {
        for (out, &v) in cast_blocks_mut::<half::f16>(dst).iter_mut().zip(src) {
            *out = half::f16::from_f32(v);
        }
    },
    vec_dot: |_, a, b| scalar::vec_dot_f16(cast_blocks::<half::f16>(a), cast_blocks::<half::f16>(b)),
    vec_dot_type: Dtype::F16,
};

static Q4_0_CODEC: Codec = quant_codec!(
    BlockQ4_0,
    QK4_0,
    scalar::quantize_row_q4_0_reference,
    scalar::dequantize_row_q4_0,
    simd::vec_dot_q4_0_q8_0,
    BlockQ8_0,
    Dtype::Q8_0
);
static Q4_1_CODEC: Codec = quant_codec!(
    BlockQ4_1,
    QK4_1,
    scalar::quantize_row_q4_1_reference,
    scalar::dequantize_row_q4_1,
    simd::vec_dot_q4_1_q8_1,
    BlockQ8_1,
    Dtype::Q8_1
);
static Q5_0_CODEC: Codec = quant_codec!(
    BlockQ5_0,
    QK5_0,
    scalar::quantize_row_q5_0_reference,
    scalar::dequantize_row_q5_0,
    scalar::vec_dot_q5_0_q8_0,
    BlockQ8_0,
    Dtype::Q8_0
);
static Q5_1_CODEC: Codec = quant_codec!(
    BlockQ5_1,
    QK5_1,
    scalar::quantize_row_q5_1_reference,
    scalar::dequantize_row_q5_1,
    scalar::vec_dot_q5_1_q8_1,
    BlockQ8_1,
    Dtype::Q8_1
);
static Q8_0_CODEC: Codec = quant_codec!(
    BlockQ8_0,
    QK8_0,
    scalar::quantize_row_q8_0_reference,
    scalar::dequantize_row_q8_0,
    simd::vec_dot_q8_0_q8_0,
    BlockQ8_0,
    Dtype::Q8_0
);
static Q8_1_CODEC: Codec = quant_codec!(
    BlockQ8_1,
    QK8_1,
    scalar::quantize_row_q8_1_reference,
    scalar::dequantize_row_q8_1,
    scalar::vec_dot_q8_1_q8_1,
    BlockQ8_1,
    Dtype::Q8_1
);
static Q2K_CODEC: Codec = quant_codec!(
    BlockQ2K,
    QK_K,
    kquants::quantize_row_q2k_reference,
    kquants::dequantize_row_q2k,
    kquants::vec_dot_q2k_q8k,
    BlockQ8K,
    Dtype::Q8K
);
static Q3K_CODEC: Codec = quant_codec!(
    BlockQ3K,
    QK_K,
    kquants::quantize_row_q3k_reference,
    kquants::dequantize_row_q3k,
    kquants::vec_dot_q3k_q8k,
    BlockQ8K,
    Dtype::Q8K
);
static Q4K_CODEC: Codec = quant_codec!(
    BlockQ4K,
    QK_K,
    kquants::quantize_row_q4k_reference,
    kquants::dequantize_row_q4k,
    kquants::vec_dot_q4k_q8k,
    BlockQ8K,
    Dtype::Q8K
);
static Q5K_CODEC: Codec = quant_codec!(
    BlockQ5K,
    QK_K,
    kquants::quantize_row_q5k_reference,
    kquants::dequantize_row_q5k,
    kquants::vec_dot_q5k_q8k,
    BlockQ8K,
    Dtype::Q8K
);
static Q6K_CODEC: Codec = quant_codec!(
    BlockQ6K,
    QK_K,
    kquants::quantize_row_q6k_reference,
    kquants::dequantize_row_q6k,
    kquants::vec_dot_q6k_q8k,
    BlockQ8K,
    Dtype::Q8K
);
static Q8K_CODEC: Codec = quant_codec!(
    BlockQ8K,
    QK_K,
    kquants::quantize_row_q8k_reference,
    kquants::dequantize_row_q8k,
    kquants::vec_dot_q8k_q8k,
    BlockQ8K,
    Dtype::Q8K
);

/// Looks up the codec for a dtype. Integer dtypes have no codec; they are
/// accessed element-wise instead.
pub fn codec(dtype: Dtype) -> Option<&'static Codec> {
    let entry = match dtype {
        Dtype::F32 => &F32_CODEC,
        Dtype::F16 => &F16_CODEC,
        Dtype::Q4_0 => &Q4_0_CODEC,
        Dtype::Q4_1 => &Q4_1_CODEC,
        Dtype::Q5_0 => &Q5_0_CODEC,
        Dtype::Q5_1 => &Q5_1_CODEC,
        Dtype::Q8_0 => &Q8_0_CODEC,
        Dtype::Q8_1 => &Q8_1_CODEC,
        Dtype::Q2K => &Q2K_CODEC,
        Dtype::Q3K => &Q3K_CODEC,
        Dtype::Q4K => &Q4K_CODEC,
        Dtype::Q5K => &Q5K_CODEC,
        Dtype::Q6K => &Q6K_CODEC,
        Dtype::Q8K => &Q8K_CODEC,
        Dtype::I8 | Dtype::I16 | Dtype::I32 => return None,
    };
    Some(entry)
}

pub(crate) fn dequantize_row(dtype: Dtype, src: &[u8], dst: &mut [f32]) {
    let c = codec(dtype).unwrap_or_else(|| panic!("no codec for {dtype:?}"));
    (c.to_float)(src, dst)
}

pub(crate) fn quantize_row(dtype: Dtype, src: &[f32], dst: &mut [u8]) {
    let c = codec(dtype).unwrap_or_else(|| panic!("no codec for {dtype:?}"));
    (c.from_float)(src, dst)
}

pub(crate) fn vec_dot(dtype: Dtype, n: usize, a: &[u8], b: &[u8]) -> f32 {
    let c = codec(dtype).unwrap_or_else(|| panic!("no codec for {dtype:?}"));
    (c.vec_dot)(n, a, b)
}

/// Bulk-encodes `src[start..start + n]` into `dst` at the matching block
/// offset, tallying quant codes into the 16-bucket `hist` side-channel.
/// Returns the number of bytes written.
pub fn quantize_chunk(
    dtype: Dtype,
    src: &[f32],
    dst: &mut [u8],
    start: usize,
    n: usize,
    hist: &mut [i64; 16],
) -> usize {
    let c = codec(dtype).unwrap_or_else(|| panic!("no codec for {dtype:?}"));
    assert!(start % c.block_size == 0, "chunk start must be block-aligned");
    assert!(n % c.block_size == 0, "chunk length must be a whole number of blocks");
    let byte_start = start / c.block_size * c.type_size;
    let byte_len = n / c.block_size * c.type_size;
    let out = &mut dst[byte_start..byte_start + byte_len];
    (c.from_float_reference)(&src[start..start + n], out);
    histogram(dtype, out, hist);
    byte_len
}

fn histogram(dtype: Dtype, encoded: &[u8], hist: &mut [i64; 16]) {
    match dtype {
        Dtype::Q4_0 => {
            for b in cast_blocks::<BlockQ4_0>(encoded) {
                for &q in &b.qs {
                    hist[(q & 0x0F) as usize] += 1;
                    hist[(q >> 4) as usize] += 1;
                }
            }
        }
        Dtype::Q4_1 => {
            for b in cast_blocks::<BlockQ4_1>(encoded) {
                for &q in &b.qs {
                    hist[(q & 0x0F) as usize] += 1;
                    hist[(q >> 4) as usize] += 1;
                }
            }
        }
        Dtype::Q5_0 => {
            for b in cast_blocks::<BlockQ5_0>(encoded) {
                let qh = u32::from_le_bytes(b.qh);
                for (j, &q) in b.qs.iter().enumerate() {
                    let v0 = (q & 0x0F) as u32 | (((qh >> j) & 1) << 4);
                    let v1 = (q >> 4) as u32 | (((qh >> (j + QK5_0 / 2)) & 1) << 4);
                    hist[(v0 / 2) as usize] += 1;
                    hist[(v1 / 2) as usize] += 1;
                }
            }
        }
        Dtype::Q5_1 => {
            for b in cast_blocks::<BlockQ5_1>(encoded) {
                let qh = u32::from_le_bytes(b.qh);
                for (j, &q) in b.qs.iter().enumerate() {
                    let v0 = (q & 0x0F) as u32 | (((qh >> j) & 1) << 4);
                    let v1 = (q >> 4) as u32 | (((qh >> (j + QK5_1 / 2)) & 1) << 4);
                    hist[(v0 / 2) as usize] += 1;
                    hist[(v1 / 2) as usize] += 1;
                }
            }
        }
        Dtype::Q8_0 => {
            for b in cast_blocks::<BlockQ8_0>(encoded) {
                for &q in &b.qs {
                    hist[((q as i32 + 128) >> 4) as usize] += 1;
                }
            }
        }
        Dtype::Q8_1 => {
            for b in cast_blocks::<BlockQ8_1>(encoded) {
                for &q in &b.qs {
                    hist[((q as i32 + 128) >> 4) as usize] += 1;
                }
            }
        }
        // K formats tally their primary quant plane.
        Dtype::Q2K => {
            for b in cast_blocks::<BlockQ2K>(encoded) {
                for &q in &b.qs {
                    for shift in [0, 2, 4, 6] {
                        hist[((q >> shift) & 3) as usize] += 1;
                    }
                }
            }
        }
        Dtype::Q3K => {
            for b in cast_blocks::<BlockQ3K>(encoded) {
                for &q in &b.qs {
                    for shift in [0, 2, 4, 6] {
                        hist[((q >> shift) & 3) as usize] += 1;
                    }
                }
            }
        }
        Dtype::Q4K => {
            for b in cast_blocks::<BlockQ4K>(encoded) {
                for &q in &b.qs {
                    hist[(q & 0x0F) as usize] += 1;
                    hist[(q >> 4) as usize] += 1;
                }
            }
        }
        Dtype::Q5K => {
            for b in cast_blocks::<BlockQ5K>(encoded) {
                for &q in &b.qs {
                    hist[(q & 0x0F) as usize] += 1;
                    hist[(q >> 4) as usize] += 1;
                }
            }
        }
        Dtype::Q6K => {
            for b in cast_blocks::<BlockQ6K>(encoded) {
                for &q in &b.ql {
                    hist[(q & 0x0F) as usize] += 1;
                    hist[(q >> 4) as usize] += 1;
                }
            }
        }
        Dtype::Q8K => {
            for b in cast_blocks::<BlockQ8K>(encoded) {
                for &q in &b.qs {
                    hist[((q as i32 + 128) >> 4) as usize] += 1;
                }
            }
        }
        Dtype::F32 | Dtype::F16 | Dtype::I8 | Dtype::I16 | Dtype::I32 => {}
    }
}
