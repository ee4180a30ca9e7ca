//! Executor scenarios: quantized matmul parity, normalization and loss
//! numerics, thread-count determinism, cancellation, and plan sizing.

use std::sync::atomic::{AtomicUsize, Ordering};

use llm_compute::quant::quantize_chunk;
use llm_compute::{ComputeError, Context, ContextInit, Dtype, Status, TensorId};

fn ctx() -> Context {
    // RUST_LOG=llm_compute=trace surfaces executor and arena events
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
    Context::init(ContextInit::with_mem_size(1 << 24)).unwrap()
}

fn fill_quantized(ctx: &mut Context, id: TensorId, values: &[f32]) {
    let dtype = ctx.tensor(id).dtype;
    let mut hist = [0i64; 16];
    let n = values.len();
    quantize_chunk(dtype, values, ctx.data_mut(id), 0, n, &mut hist);
}

/// Quantized matmul must track the f32 matmul of the dequantized
/// operands to 5e-3 per element.
#[test]
fn quantized_mul_mat_parity() {
    let mut ctx = ctx();
    let a_vals: Vec<f32> = (0..32)
        .flat_map(|j| (0..64).map(move |i| 0.01 * (i as f32 - j as f32)))
        .collect();
    let b_vals: Vec<f32> =
        (0..16).flat_map(|j| (0..64).map(move |i| ((i + j) as f32).sin())).collect();

    let a = ctx.new_tensor_2d(Dtype::Q4_0, 64, 32).unwrap();
    let b = ctx.new_tensor_2d(Dtype::Q8_0, 64, 16).unwrap();
    fill_quantized(&mut ctx, a, &a_vals);
    fill_quantized(&mut ctx, b, &b_vals);

    let y = ctx.mul_mat(a, b).unwrap();
    let graph = ctx.build_forward(y);
    ctx.graph_compute_with_ctx(&graph, 2).unwrap();

    let da = ctx.to_vec_f32(a);
    let db = ctx.to_vec_f32(b);
    for n in 0..16 {
        for m in 0..32 {
            let mut reference = 0.0f32;
            for k in 0..64 {
                reference += da[m * 64 + k] * db[n * 64 + k];
            }
            let got = ctx.get_f32_nd(y, [m, n, 0, 0]);
            assert!(
                (got - reference).abs() <= 5e-3,
                "element ({m}, {n}): {got} vs {reference}"
            );
        }
    }
}

#[test]
fn rms_norm_forward_values() {
    let mut ctx = ctx();
    let x = ctx.new_tensor_1d(Dtype::F32, 4).unwrap();
    ctx.load_f32(x, &[1.0, 2.0, 3.0, 4.0]);
    let y = ctx.rms_norm(x, 1e-6).unwrap();
    let graph = ctx.build_forward(y);
    ctx.graph_compute_with_ctx(&graph, 1).unwrap();

    let expected = [0.3651, 0.7303, 1.0954, 1.4606];
    let got = ctx.to_vec_f32(y);
    for (g, e) in got.iter().zip(&expected) {
        assert!((g - e).abs() < 1e-4, "{g} vs {e}");
    }
}

#[test]
fn softmax_and_cross_entropy_values() {
    let mut ctx = ctx();
    let logits = ctx.new_tensor_1d(Dtype::F32, 3).unwrap();
    ctx.load_f32(logits, &[1.0, 2.0, 3.0]);
    let target = ctx.new_tensor_1d(Dtype::F32, 3).unwrap();
    ctx.load_f32(target, &[0.0, 0.0, 1.0]);

    let p = ctx.soft_max(logits).unwrap();
    let loss = ctx.cross_entropy_loss(logits, target).unwrap();
    let mut graph = ctx.build_forward(p);
    ctx.build_forward_expand(&mut graph, loss);
    ctx.graph_compute_with_ctx(&graph, 2).unwrap();

    let probs = ctx.to_vec_f32(p);
    let expected = [0.09003, 0.24473, 0.66524];
    for (g, e) in probs.iter().zip(&expected) {
        assert!((g - e).abs() < 1e-4, "{g} vs {e}");
    }
    let got = ctx.get_f32_1d(loss, 0);
    assert!((got - 0.40761).abs() < 1e-4, "loss {got}");
}

fn matmul_add_output(n_threads: usize, quantized: bool) -> Vec<u8> {
    let mut ctx = ctx();
    let a_vals: Vec<f32> =
        (0..64 * 32).map(|i| ((i as f32) * 0.021).sin() * 0.8).collect();
    let b_vals: Vec<f32> =
        (0..64 * 16).map(|i| ((i as f32) * 0.017).cos() * 1.2).collect();

    let (a, b) = if quantized {
        let a = ctx.new_tensor_2d(Dtype::Q4_0, 64, 32).unwrap();
        let b = ctx.new_tensor_2d(Dtype::Q8_0, 64, 16).unwrap();
        fill_quantized(&mut ctx, a, &a_vals);
        fill_quantized(&mut ctx, b, &b_vals);
        (a, b)
    } else {
        let a = ctx.new_tensor_2d(Dtype::F32, 64, 32).unwrap();
        let b = ctx.new_tensor_2d(Dtype::F32, 64, 16).unwrap();
        ctx.load_f32(a, &a_vals);
        ctx.load_f32(b, &b_vals);
        (a, b)
    };

    let c = ctx.new_tensor_2d(Dtype::F32, 32, 16).unwrap();
    let c_vals: Vec<f32> = (0..32 * 16).map(|i| i as f32 * 0.003).collect();
    ctx.load_f32(c, &c_vals);

    let y = ctx.mul_mat(a, b).unwrap();
    let out = ctx.add(y, c).unwrap();
    let graph = ctx.build_forward(out);
    ctx.graph_compute_with_ctx(&graph, n_threads).unwrap();
    ctx.data(out).to_vec()
}

/// A matmul followed by an add must be bit-identical across thread
/// counts, for both native and quantized inputs.
#[test]
fn barrier_ordering_is_thread_count_invariant() {
    assert_eq!(matmul_add_output(1, false), matmul_add_output(4, false));
    assert_eq!(matmul_add_output(1, true), matmul_add_output(4, true));
}

#[test]
fn repeated_compute_is_bit_identical() {
    let mut ctx = ctx();
    let a = ctx.new_tensor_2d(Dtype::F32, 48, 8).unwrap();
    let vals: Vec<f32> = (0..48 * 8).map(|i| ((i * 7) % 13) as f32 * 0.21 - 1.0).collect();
    ctx.load_f32(a, &vals);
    let b = ctx.soft_max(a).unwrap();
    let y = ctx.mul_mat(a, b).unwrap();
    let graph = ctx.build_forward(y);

    ctx.graph_compute_with_ctx(&graph, 3).unwrap();
    let first = ctx.data(y).to_vec();
    ctx.graph_compute_with_ctx(&graph, 3).unwrap();
    assert_eq!(first, ctx.data(y).to_vec());
}

#[test]
fn abort_callback_stops_between_nodes() {
    let mut ctx = ctx();
    let a = ctx.new_tensor_1d(Dtype::F32, 64).unwrap();
    ctx.fill_f32(a, 1.0);
    let mut t = a;
    for _ in 0..8 {
        t = ctx.sqr(t).unwrap();
    }
    let graph = ctx.build_forward(t);
    let mut plan = ctx.graph_plan(&graph, 2);
    plan.alloc_work();

    let polls = AtomicUsize::new(0);
    let abort = || polls.fetch_add(1, Ordering::Relaxed) >= 1;
    let status = ctx.graph_compute_with_abort(&graph, &mut plan, Some(&abort)).unwrap();
    assert_eq!(status, Status::Aborted);
    assert!(polls.load(Ordering::Relaxed) < 16, "abort was not honored promptly");
}

#[test]
fn undersized_work_buffer_reports_required_size() {
    let mut ctx = ctx();
    let a = ctx.new_tensor_2d(Dtype::Q4_0, 64, 4).unwrap();
    let b = ctx.new_tensor_2d(Dtype::F32, 64, 4).unwrap();
    let y = ctx.mul_mat(a, b).unwrap();
    let graph = ctx.build_forward(y);

    let mut plan = ctx.graph_plan(&graph, 2);
    assert!(plan.work_size > 0, "requantizing matmul must claim scratch");
    let err = ctx.graph_compute(&graph, &mut plan).unwrap_err();
    match err {
        ComputeError::WorkBufferTooSmall { needed, available } => {
            assert_eq!(needed, plan.work_size);
            assert_eq!(available, 0);
        }
        other => panic!("unexpected error {other}"),
    }

    plan.alloc_work();
    assert_eq!(ctx.graph_compute(&graph, &mut plan).unwrap(), Status::Ok);
}

#[test]
fn requantizing_mul_mat_matches_prequantized_rhs() {
    // mul_mat(Q4_0, f32-b) requantizes b to Q8_0 during INIT; feeding the
    // same b already encoded as Q8_0 must give identical results
    let mut ctx = ctx();
    let a_vals: Vec<f32> = (0..64 * 8).map(|i| ((i as f32) * 0.05).sin()).collect();
    let b_vals: Vec<f32> = (0..64 * 4).map(|i| ((i as f32) * 0.03).cos()).collect();

    let a = ctx.new_tensor_2d(Dtype::Q4_0, 64, 8).unwrap();
    fill_quantized(&mut ctx, a, &a_vals);
    let b_f32 = ctx.new_tensor_2d(Dtype::F32, 64, 4).unwrap();
    ctx.load_f32(b_f32, &b_vals);
    let b_q8 = ctx.new_tensor_2d(Dtype::Q8_0, 64, 4).unwrap();
    fill_quantized(&mut ctx, b_q8, &b_vals);

    let y1 = ctx.mul_mat(a, b_f32).unwrap();
    let y2 = ctx.mul_mat(a, b_q8).unwrap();
    let mut graph = ctx.build_forward(y1);
    ctx.build_forward_expand(&mut graph, y2);
    ctx.graph_compute_with_ctx(&graph, 2).unwrap();

    assert_eq!(ctx.data(y1), ctx.data(y2));
}

#[test]
fn get_rows_dequantizes_selected_rows() {
    let mut ctx = ctx();
    let table_vals: Vec<f32> = (0..32 * 4).map(|i| (i as f32 * 0.11).sin()).collect();
    let table = ctx.new_tensor_2d(Dtype::Q8_0, 32, 4).unwrap();
    fill_quantized(&mut ctx, table, &table_vals);
    let idx = ctx.new_tensor_1d(Dtype::I32, 2).unwrap();
    ctx.set_i32_1d(idx, 0, 3);
    ctx.set_i32_1d(idx, 1, 1);

    let rows = ctx.get_rows(table, idx).unwrap();
    let graph = ctx.build_forward(rows);
    ctx.graph_compute_with_ctx(&graph, 1).unwrap();

    let dense = ctx.to_vec_f32(table);
    let got = ctx.to_vec_f32(rows);
    for (j, &row) in [3usize, 1].iter().enumerate() {
        for i in 0..32 {
            assert!((got[j * 32 + i] - dense[row * 32 + i]).abs() < 1e-6);
        }
    }
}

#[test]
fn repeat_broadcasts_rows_and_scalars() {
    let mut ctx = ctx();
    let row = ctx.new_tensor_1d(Dtype::F32, 4).unwrap();
    ctx.load_f32(row, &[1.0, 2.0, 3.0, 4.0]);
    let target = ctx.new_tensor_2d(Dtype::F32, 4, 3).unwrap();
    let y = ctx.repeat(row, target).unwrap();
    let graph = ctx.build_forward(y);
    ctx.graph_compute_with_ctx(&graph, 1).unwrap();
    assert_eq!(
        ctx.to_vec_f32(y),
        vec![1.0, 2.0, 3.0, 4.0, 1.0, 2.0, 3.0, 4.0, 1.0, 2.0, 3.0, 4.0]
    );
}

#[test]
fn rope_rotates_pairs_and_preserves_tail() {
    let mut ctx = ctx();
    // one head of width 4, two positions, rope over the first 2 features
    let x = ctx.new_tensor_3d(Dtype::F32, 4, 1, 2).unwrap();
    ctx.load_f32(x, &[1.0, 0.0, 5.0, 6.0, 1.0, 0.0, 5.0, 6.0]);
    let y = ctx.rope(x, 0, 2, 0).unwrap();
    let graph = ctx.build_forward(y);
    ctx.graph_compute_with_ctx(&graph, 1).unwrap();

    let got = ctx.to_vec_f32(y);
    // position 0: identity rotation
    assert!((got[0] - 1.0).abs() < 1e-6 && got[1].abs() < 1e-6);
    // position 1: rotate by 1 radian
    assert!((got[4] - 1.0f32.cos()).abs() < 1e-5);
    assert!((got[5] - 1.0f32.sin()).abs() < 1e-5);
    // features past n_dims pass through
    assert_eq!(&got[2..4], &[5.0, 6.0]);
    assert_eq!(&got[6..8], &[5.0, 6.0]);
}

#[test]
fn diag_mask_inf_then_softmax_zeroes_future_positions() {
    let mut ctx = ctx();
    let x = ctx.new_tensor_2d(Dtype::F32, 3, 3).unwrap();
    ctx.fill_f32(x, 1.0);
    let masked = ctx.diag_mask_inf(x, 0).unwrap();
    let p = ctx.soft_max(masked).unwrap();
    let graph = ctx.build_forward(p);
    ctx.graph_compute_with_ctx(&graph, 1).unwrap();

    let got = ctx.to_vec_f32(p);
    // row 0 attends only to position 0
    assert_eq!(got[0], 1.0);
    assert_eq!(&got[1..3], &[0.0, 0.0]);
    // row 1 splits evenly between positions 0 and 1
    assert!((got[3] - 0.5).abs() < 1e-6 && (got[4] - 0.5).abs() < 1e-6);
    assert_eq!(got[5], 0.0);
}
