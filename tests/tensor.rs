//! Tensor model properties: view aliasing, contiguity, reshape/permute
//! element order, and arena discipline.

use llm_compute::{Context, ContextInit, Dtype, ScratchBuffer};

fn ctx() -> Context {
    Context::init(ContextInit::with_mem_size(1 << 22)).unwrap()
}

#[test]
fn view_aliases_base_storage() {
    let mut ctx = ctx();
    let base = ctx.new_tensor_1d(Dtype::F32, 16).unwrap();
    ctx.fill_f32(base, 0.0);
    let view = ctx.view_1d(base, 8, 4 * 4).unwrap();

    let base_ptr = ctx.data(base).as_ptr() as usize;
    let view_ptr = ctx.data(view).as_ptr() as usize;
    assert_eq!(view_ptr, base_ptr + 16);

    // writes through the view are visible through the base
    ctx.set_f32_1d(view, 0, 42.0);
    assert_eq!(ctx.get_f32_1d(base, 4), 42.0);
    ctx.set_f32_1d(base, 5, 7.0);
    assert_eq!(ctx.get_f32_1d(view, 1), 7.0);
}

#[test]
#[should_panic(expected = "escapes base tensor")]
fn view_out_of_bounds_fails_at_build_time() {
    let mut ctx = ctx();
    let base = ctx.new_tensor_1d(Dtype::F32, 8).unwrap();
    let _ = ctx.view_1d(base, 8, 4);
}

#[test]
fn reshape_permute_cont_element_order() {
    // a [6] vector reshaped into 2 rows of 3, transposed, then
    // materialized must read 0, 3, 1, 4, 2, 5
    let mut ctx = ctx();
    let x = ctx.new_tensor_1d(Dtype::F32, 6).unwrap();
    ctx.load_f32(x, &[0.0, 1.0, 2.0, 3.0, 4.0, 5.0]);
    let r = ctx.reshape(x, &[3, 2]).unwrap();
    let p = ctx.permute(r, 1, 0, 2, 3).unwrap();
    let c = ctx.cont(p).unwrap();
    let graph = ctx.build_forward(c);
    ctx.graph_compute_with_ctx(&graph, 1).unwrap();

    assert!(ctx.tensor(c).is_contiguous());
    assert_eq!(ctx.to_vec_f32(c), vec![0.0, 3.0, 1.0, 4.0, 2.0, 5.0]);
}

#[test]
fn cont_of_permuted_matches_strided_reads() {
    let mut ctx = ctx();
    let x = ctx.new_tensor_2d(Dtype::F32, 4, 3).unwrap();
    let values: Vec<f32> = (0..12).map(|v| v as f32).collect();
    ctx.load_f32(x, &values);
    let t = ctx.transpose(x).unwrap();
    assert!(ctx.tensor(t).is_transposed());
    assert!(!ctx.tensor(t).is_contiguous());

    let c = ctx.cont(t).unwrap();
    let graph = ctx.build_forward(c);
    ctx.graph_compute_with_ctx(&graph, 2).unwrap();
    assert!(ctx.tensor(c).is_contiguous());
    let got = ctx.to_vec_f32(c);
    for i1 in 0..4 {
        for i0 in 0..3 {
            assert_eq!(got[i0 + 3 * i1], ctx.get_f32_nd(x, [i1, i0, 0, 0]));
        }
    }
}

#[test]
fn stride_invariants_for_quantized_tensors() {
    let mut ctx = ctx();
    let q = ctx.new_tensor_2d(Dtype::Q8_0, 64, 5).unwrap();
    let t = ctx.tensor(q);
    assert_eq!(t.nb[0], 34);
    assert_eq!(t.nb[1], 34 * 2);
    assert!(t.is_contiguous());
    assert_eq!(t.nelements(), 320);
}

#[test]
fn dup_tensor_matches_shape_with_fresh_storage() {
    let mut ctx = ctx();
    let a = ctx.new_tensor_3d(Dtype::F16, 8, 2, 2).unwrap();
    let b = ctx.dup_tensor(a).unwrap();
    assert_eq!(ctx.tensor(a).ne, ctx.tensor(b).ne);
    assert_eq!(ctx.tensor(a).dtype, ctx.tensor(b).dtype);
    assert_ne!(ctx.data(a).as_ptr(), ctx.data(b).as_ptr());
}

#[test]
fn scratch_backed_tensors_survive_pop() {
    let mut ctx = ctx();
    ctx.scratch_push(ScratchBuffer::with_size(1 << 12));
    let t = ctx.new_tensor_1d(Dtype::F32, 32).unwrap();
    ctx.fill_f32(t, 3.5);
    ctx.scratch_pop();
    assert_eq!(ctx.get_f32_1d(t, 31), 3.5);
}

#[test]
fn element_access_dispatches_by_dtype() {
    let mut ctx = ctx();
    let h = ctx.new_tensor_1d(Dtype::F16, 4).unwrap();
    ctx.set_f32_1d(h, 2, 1.5);
    assert_eq!(ctx.get_f32_1d(h, 2), 1.5);

    let i = ctx.new_tensor_1d(Dtype::I32, 4).unwrap();
    ctx.set_i32_1d(i, 1, -7);
    assert_eq!(ctx.get_i32_1d(i, 1), -7);
    assert_eq!(ctx.get_f32_1d(i, 1), -7.0);
}

#[test]
fn names_are_capped_at_64_bytes() {
    let mut ctx = ctx();
    let t = ctx.new_tensor_1d(Dtype::F32, 1).unwrap();
    ctx.set_name(t, &"n".repeat(200));
    assert_eq!(ctx.tensor(t).name.len(), 64);
}
