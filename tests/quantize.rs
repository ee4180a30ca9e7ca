//! Codec properties: round-trip error bounds, reference determinism, and
//! scalar/SIMD dot-product parity.

use llm_compute::quant::blocks::*;
use llm_compute::quant::{codec, quantize_chunk, scalar, simd};
use llm_compute::Dtype;

fn signal(n: usize) -> Vec<f32> {
    (0..n).map(|i| ((i as f32 * 0.17).sin() + 0.3 * (i as f32 * 0.013).cos()) * 2.5).collect()
}

fn round_trip(dtype: Dtype, x: &[f32]) -> Vec<f32> {
    let c = codec(dtype).unwrap();
    let mut encoded = vec![0u8; x.len() / c.block_size * c.type_size];
    (c.from_float_reference)(x, &mut encoded);
    let mut decoded = vec![0.0f32; x.len()];
    (c.to_float)(&encoded, &mut decoded);
    decoded
}

fn assert_round_trip_bound(dtype: Dtype, divisor: f32) {
    let x = signal(512);
    let y = round_trip(dtype, &x);
    let amax = x.iter().fold(0.0f32, |a, v| a.max(v.abs()));
    let bound = amax / divisor;
    for (i, (a, b)) in x.iter().zip(&y).enumerate() {
        assert!(
            (a - b).abs() <= bound,
            "{dtype:?} element {i}: {a} vs {b} exceeds {bound}"
        );
    }
}

#[test]
fn round_trip_error_bounds() {
    assert_round_trip_bound(Dtype::Q4_0, 8.0);
    assert_round_trip_bound(Dtype::Q4_1, 7.0);
    assert_round_trip_bound(Dtype::Q5_0, 16.0);
    assert_round_trip_bound(Dtype::Q5_1, 15.0);
    assert_round_trip_bound(Dtype::Q8_0, 64.0);
    assert_round_trip_bound(Dtype::Q8_1, 64.0);
    assert_round_trip_bound(Dtype::Q8K, 64.0);
    assert_round_trip_bound(Dtype::Q6K, 8.0);
    assert_round_trip_bound(Dtype::Q5K, 8.0);
    assert_round_trip_bound(Dtype::Q4K, 4.0);
    assert_round_trip_bound(Dtype::Q3K, 2.0);
    assert_round_trip_bound(Dtype::Q2K, 1.0);
}

#[test]
fn zeros_encode_cleanly_in_symmetric_formats() {
    let mut x = signal(64);
    for v in x.iter_mut().take(32).skip(8) {
        *v = 0.0;
    }
    for dtype in [Dtype::Q4_0, Dtype::Q5_0, Dtype::Q8_0] {
        let y = round_trip(dtype, &x);
        for i in 8..32 {
            assert_eq!(y[i], 0.0, "{dtype:?} does not decode zero at {i}");
        }
    }
}

#[test]
fn reference_quantizer_is_deterministic() {
    let x = signal(1024);
    for dtype in [
        Dtype::Q4_0,
        Dtype::Q4_1,
        Dtype::Q5_0,
        Dtype::Q5_1,
        Dtype::Q8_0,
        Dtype::Q2K,
        Dtype::Q3K,
        Dtype::Q4K,
        Dtype::Q5K,
        Dtype::Q6K,
        Dtype::Q8K,
    ] {
        let c = codec(dtype).unwrap();
        let mut a = vec![0u8; x.len() / c.block_size * c.type_size];
        let mut b = a.clone();
        (c.from_float_reference)(&x, &mut a);
        (c.from_float_reference)(&x, &mut b);
        assert_eq!(a, b, "{dtype:?} reference quantization is not deterministic");
    }
}

fn q8_0_blocks(x: &[f32]) -> Vec<BlockQ8_0> {
    let mut blocks = vec![BlockQ8_0 { d: half::f16::from_f32(0.0), qs: [0; QK8_0] }; x.len() / QK8_0];
    scalar::quantize_row_q8_0_reference(x, &mut blocks);
    blocks
}

#[test]
fn simd_dot_matches_scalar_reference() {
    let n = 256;
    let xa = signal(n);
    let xb: Vec<f32> = (0..n).map(|i| ((i as f32 + 3.0) * 0.29).cos() * 1.7).collect();

    // Q4_0 · Q8_0
    let mut a4 = vec![
        BlockQ4_0 { d: half::f16::from_f32(0.0), qs: [0; QK4_0 / 2] };
        n / QK4_0
    ];
    scalar::quantize_row_q4_0_reference(&xa, &mut a4);
    let b8 = q8_0_blocks(&xb);
    let fast = simd::vec_dot_q4_0_q8_0(n, &a4, &b8);
    let reference = scalar::vec_dot_q4_0_q8_0(n, &a4, &b8);
    assert!((fast - reference).abs() <= reference.abs() * 1e-5 + 1e-4);

    // Q8_0 · Q8_0
    let a8 = q8_0_blocks(&xa);
    let fast = simd::vec_dot_q8_0_q8_0(n, &a8, &b8);
    let reference = scalar::vec_dot_q8_0_q8_0(n, &a8, &b8);
    assert!((fast - reference).abs() <= reference.abs() * 1e-5 + 1e-4);

    // Q4_1 · Q8_1
    let mut a41 = vec![
        BlockQ4_1 {
            d: half::f16::from_f32(0.0),
            m: half::f16::from_f32(0.0),
            qs: [0; QK4_1 / 2]
        };
        n / QK4_1
    ];
    scalar::quantize_row_q4_1_reference(&xa, &mut a41);
    let mut b81 = vec![BlockQ8_1 { d: 0.0, s: 0.0, qs: [0; QK8_1] }; n / QK8_1];
    scalar::quantize_row_q8_1_reference(&xb, &mut b81);
    let fast = simd::vec_dot_q4_1_q8_1(n, &a41, &b81);
    let reference = scalar::vec_dot_q4_1_q8_1(n, &a41, &b81);
    assert!((fast - reference).abs() <= reference.abs() * 1e-5 + 1e-4);

    // F32 · F32
    let fast = simd::vec_dot_f32(&xa, &xb);
    let reference = scalar::vec_dot_f32(&xa, &xb);
    assert!((fast - reference).abs() <= reference.abs() * 1e-5 + 1e-4);
}

#[test]
fn quantized_dot_tracks_float_dot() {
    let n = 128;
    let xa = signal(n);
    let xb: Vec<f32> = (0..n).map(|i| (i as f32 * 0.11).sin()).collect();
    let mut a4 = vec![
        BlockQ4_0 { d: half::f16::from_f32(0.0), qs: [0; QK4_0 / 2] };
        n / QK4_0
    ];
    scalar::quantize_row_q4_0_reference(&xa, &mut a4);
    let b8 = q8_0_blocks(&xb);
    let quantized = scalar::vec_dot_q4_0_q8_0(n, &a4, &b8);

    let mut da = vec![0.0f32; n];
    scalar::dequantize_row_q4_0(&a4, &mut da);
    let mut db = vec![0.0f32; n];
    scalar::dequantize_row_q8_0(&b8, &mut db);
    let float = scalar::vec_dot_f32(&da, &db);
    assert!((quantized - float).abs() < 1e-3, "{quantized} vs {float}");
}

#[test]
fn quantize_chunk_histograms_every_code() {
    let x = signal(256);
    let mut dst = vec![0u8; 256 / QK4_0 * Dtype::Q4_0.type_size()];
    let mut hist = [0i64; 16];
    let written = quantize_chunk(Dtype::Q4_0, &x, &mut dst, 0, 256, &mut hist);
    assert_eq!(written, dst.len());
    assert_eq!(hist.iter().sum::<i64>(), 256);

    // a second chunk accumulates into the same histogram
    let mut dst2 = vec![0u8; dst.len()];
    quantize_chunk(Dtype::Q4_0, &x, &mut dst2, 0, 256, &mut hist);
    assert_eq!(hist.iter().sum::<i64>(), 512);
}

#[test]
fn quantize_chunk_respects_start_offset() {
    let x = signal(128);
    let mut whole = vec![0u8; 128 / QK8_0 * Dtype::Q8_0.type_size()];
    let mut hist = [0i64; 16];
    quantize_chunk(Dtype::Q8_0, &x, &mut whole, 0, 128, &mut hist);

    let mut chunked = vec![0u8; whole.len()];
    quantize_chunk(Dtype::Q8_0, &x, &mut chunked, 0, 64, &mut hist);
    quantize_chunk(Dtype::Q8_0, &x, &mut chunked, 64, 64, &mut hist);
    assert_eq!(whole, chunked);
}
