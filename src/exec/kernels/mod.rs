//! Forward kernels, dispatched on the operator tag.
//!
//! Kernels see the graph through [`Tv`] views: tensor metadata plus a raw
//! base pointer into the owning context. COMPUTE-phase workers partition
//! the output by rows and write disjoint regions; INIT and FINALIZE run on
//! a single thread (see the module docs in [`crate::exec`]).

mod elementwise;
mod matmul;
mod rows;
mod spatial;

use super::{ComputeParams, TaskPhase};
use crate::context::Context;
use crate::graph::Op;
use crate::quant;
use crate::tensor::{Dtype, Tensor, TensorId, MAX_DIMS};

/// A tensor resolved for kernel access.
pub(crate) struct Tv<'a> {
    pub t: &'a Tensor,
    pub ptr: *mut u8,
}

impl Context {
    pub(crate) fn tv(&self, id: TensorId) -> Tv<'_> {
        Tv { t: self.tensor(id), ptr: self.data_ptr(id) }
    }
}

impl Tv<'_> {
    #[inline]
    pub fn row_ptr(&self, i1: usize, i2: usize, i3: usize) -> *mut u8 {
        unsafe { self.ptr.add(i1 * self.t.nb[1] + i2 * self.t.nb[2] + i3 * self.t.nb[3]) }
    }

    /// Row `ne[0]` as an f32 slice. The row must be dense (`nb[0] == 4`).
    #[inline]
    pub fn row_f32(&self, i1: usize, i2: usize, i3: usize) -> &[f32] {
        debug_assert_eq!(self.t.nb[0], 4);
        unsafe { std::slice::from_raw_parts(self.row_ptr(i1, i2, i3) as *const f32, self.t.ne[0]) }
    }

    #[inline]
    #[allow(clippy::mut_from_ref)]
    pub fn row_f32_mut(&self, i1: usize, i2: usize, i3: usize) -> &mut [f32] {
        debug_assert_eq!(self.t.nb[0], 4);
        unsafe {
            std::slice::from_raw_parts_mut(self.row_ptr(i1, i2, i3) as *mut f32, self.t.ne[0])
        }
    }

    /// Row `ne[0]` as raw block bytes (dense rows only).
    #[inline]
    pub fn row_bytes(&self, i1: usize, i2: usize, i3: usize) -> &[u8] {
        debug_assert_eq!(self.t.nb[0], self.t.dtype.type_size());
        unsafe { std::slice::from_raw_parts(self.row_ptr(i1, i2, i3), self.t.row_size()) }
    }

    #[inline]
    #[allow(clippy::mut_from_ref)]
    pub fn row_bytes_mut(&self, i1: usize, i2: usize, i3: usize) -> &mut [u8] {
        debug_assert_eq!(self.t.nb[0], self.t.dtype.type_size());
        unsafe { std::slice::from_raw_parts_mut(self.row_ptr(i1, i2, i3), self.t.row_size()) }
    }

    #[inline]
    pub fn elem_ptr(&self, idx: [usize; MAX_DIMS]) -> *mut u8 {
        unsafe { self.ptr.add(self.t.elem_offset(idx)) }
    }

    /// Strided f32 read.
    #[inline]
    pub fn at(&self, idx: [usize; MAX_DIMS]) -> f32 {
        debug_assert_eq!(self.t.dtype, Dtype::F32);
        unsafe { (self.elem_ptr(idx) as *const f32).read_unaligned() }
    }

    /// Strided f32 write.
    #[inline]
    pub fn put(&self, idx: [usize; MAX_DIMS], value: f32) {
        debug_assert_eq!(self.t.dtype, Dtype::F32);
        unsafe { (self.elem_ptr(idx) as *mut f32).write_unaligned(value) }
    }
}

/// The chunk of `nr` rows worker `ith` of `nth` owns.
#[inline]
pub(crate) fn row_range(nr: usize, ith: usize, nth: usize) -> std::ops::Range<usize> {
    let dr = nr.div_ceil(nth);
    let ir0 = (dr * ith).min(nr);
    ir0..(ir0 + dr).min(nr)
}

/// Splits a flat row index into the `(i1, i2, i3)` coordinates of `t`.
#[inline]
pub(crate) fn unravel_row(t: &Tensor, ir: usize) -> (usize, usize, usize) {
    let i1 = ir % t.ne[1];
    let i2 = (ir / t.ne[1]) % t.ne[2];
    let i3 = ir / (t.ne[1] * t.ne[2]);
    (i1, i2, i3)
}

pub(crate) fn compute_forward(ctx: &Context, params: &ComputeParams, id: TensorId) {
    let op = ctx.tensor(id).op;
    let src = ctx.tensor(id).src;
    match op {
        // metadata-only: the output aliases or annotates existing storage
        Op::None | Op::Reshape | Op::View | Op::Permute | Op::Transpose => {}
        Op::Dup | Op::Cont | Op::Cpy => {
            if params.phase == TaskPhase::Compute {
                copy_tensor(ctx, params, src[0].unwrap(), id);
            }
        }
        Op::Set => compute_set(ctx, params, id),
        Op::Add | Op::Sub | Op::Mul | Op::Div => elementwise::binary(ctx, params, id),
        Op::Sqr | Op::Sqrt | Op::Scale | Op::Clamp | Op::Unary => {
            elementwise::unary(ctx, params, id)
        }
        Op::SiluBack => elementwise::silu_back(ctx, params, id),
        Op::Sum | Op::SumRows | Op::Mean => elementwise::reduce(ctx, params, id),
        Op::Repeat => elementwise::repeat(ctx, params, id),
        Op::Norm | Op::RmsNorm => rows::norm(ctx, params, id),
        Op::RmsNormBack => rows::rms_norm_back(ctx, params, id),
        Op::SoftMax => rows::soft_max(ctx, params, id),
        Op::SoftMaxBack => rows::soft_max_back(ctx, params, id),
        Op::Rope | Op::RopeBack => rows::rope(ctx, params, id),
        Op::GetRows => rows::get_rows(ctx, params, id),
        Op::GetRowsBack => rows::get_rows_back(ctx, params, id),
        Op::DiagMaskInf | Op::DiagMaskZero => rows::diag_mask(ctx, params, id),
        Op::Alibi => rows::alibi(ctx, params, id),
        Op::CrossEntropyLoss => rows::cross_entropy_loss(ctx, params, id),
        Op::CrossEntropyLossBack => rows::cross_entropy_loss_back(ctx, params, id),
        Op::MulMat => matmul::mul_mat(ctx, params, id),
        Op::OutProd => matmul::out_prod(ctx, params, id),
        Op::Conv1d => spatial::conv_1d(ctx, params, id),
        Op::Conv2d => spatial::conv_2d(ctx, params, id),
        Op::Pool1d => spatial::pool_1d(ctx, params, id),
        Op::Pool2d => spatial::pool_2d(ctx, params, id),
        Op::Upscale => spatial::upscale(ctx, params, id),
        Op::WinPart => spatial::win_part(ctx, params, id),
        Op::WinUnpart => spatial::win_unpart(ctx, params, id),
        Op::FlashAttn => spatial::flash_attn(ctx, params, id),
    }
}

/// Shared by dup, cont, and cpy: copies `src` into `dst`, converting
/// dtype when they differ. Shapes may differ as long as the element
/// counts match; elements map in row-major order.
fn copy_tensor(ctx: &Context, params: &ComputeParams, src: TensorId, dst: TensorId) {
    let s = ctx.tv(src);
    let d = ctx.tv(dst);
    let same_layout = s.t.dtype == d.t.dtype && s.t.ne == d.t.ne;

    if same_layout && s.t.nb[0] == s.t.dtype.type_size() && d.t.nb[0] == d.t.dtype.type_size() {
        // row-dense on both sides: move whole rows
        let nr = s.t.nrows();
        for ir in row_range(nr, params.ith, params.nth) {
            let (i1, i2, i3) = unravel_row(s.t, ir);
            d.row_bytes_mut(i1, i2, i3).copy_from_slice(s.row_bytes(i1, i2, i3));
        }
        return;
    }

    if !s.t.dtype.is_quantized() && !d.t.dtype.is_quantized() {
        // native to native, arbitrary strides and shapes
        let n = s.t.nelements();
        let chunk = row_range(n, params.ith, params.nth);
        for k in chunk {
            let v = read_native(&s, s.t.unravel(k));
            write_native(&d, d.t.unravel(k), v);
        }
        return;
    }

    // one side quantized: go through f32 rows
    assert_eq!(s.t.ne[0], d.t.ne[0], "quantized copy must preserve row length");
    let nr = s.t.nrows();
    let mut row = vec![0.0f32; s.t.ne[0]];
    for ir in row_range(nr, params.ith, params.nth) {
        let (i1, i2, i3) = unravel_row(s.t, ir);
        let (d1, d2, d3) = unravel_row(d.t, ir);
        if s.t.dtype.is_quantized() {
            quant::dequantize_row(s.t.dtype, s.row_bytes(i1, i2, i3), &mut row);
        } else {
            for (j, v) in row.iter_mut().enumerate() {
                *v = read_native(&s, [j, i1, i2, i3]);
            }
        }
        if d.t.dtype.is_quantized() {
            quant::quantize_row(d.t.dtype, &row, d.row_bytes_mut(d1, d2, d3));
        } else {
            for (j, &v) in row.iter().enumerate() {
                write_native(&d, [j, d1, d2, d3], v);
            }
        }
    }
}

fn read_native(tv: &Tv<'_>, idx: [usize; MAX_DIMS]) -> f32 {
    let p = tv.elem_ptr(idx);
    unsafe {
        match tv.t.dtype {
            Dtype::F32 => (p as *const f32).read_unaligned(),
            Dtype::F16 => crate::context::globals::fp16_to_f32(half::f16::from_bits(
                (p as *const u16).read_unaligned(),
            )),
            Dtype::I8 => (p as *const i8).read_unaligned() as f32,
            Dtype::I16 => (p as *const i16).read_unaligned() as f32,
            Dtype::I32 => (p as *const i32).read_unaligned() as f32,
            other => panic!("native read on {other:?}"),
        }
    }
}

fn write_native(tv: &Tv<'_>, idx: [usize; MAX_DIMS], value: f32) {
    let p = tv.elem_ptr(idx);
    unsafe {
        match tv.t.dtype {
            Dtype::F32 => (p as *mut f32).write_unaligned(value),
            Dtype::F16 => (p as *mut u16).write_unaligned(half::f16::from_f32(value).to_bits()),
            Dtype::I8 => (p as *mut i8).write_unaligned(value as i8),
            Dtype::I16 => (p as *mut i16).write_unaligned(value as i16),
            Dtype::I32 => (p as *mut i32).write_unaligned(value as i32),
            other => panic!("native write on {other:?}"),
        }
    }
}

/// Copies the base through, then overwrites the strided destination
/// region with `src1`.
fn compute_set(ctx: &Context, params: &ComputeParams, id: TensorId) {
    let dst = ctx.tv(id);
    let t = ctx.tensor(id);
    match params.phase {
        TaskPhase::Init => {
            let a = ctx.tv(t.src[0].unwrap());
            assert!(a.t.is_contiguous() && dst.t.is_contiguous());
            unsafe {
                std::ptr::copy_nonoverlapping(a.ptr, dst.ptr, a.t.nbytes());
            }
        }
        TaskPhase::Compute => {
            let b = ctx.tv(t.src[1].unwrap());
            assert_eq!(b.t.dtype, Dtype::F32);
            let nb1 = t.op_params_i32(0) as usize;
            let nb2 = t.op_params_i32(1) as usize;
            let nb3 = t.op_params_i32(2) as usize;
            let offset = t.op_params_i32(3) as usize;
            for k in 0..b.t.nelements() {
                let [i0, i1, i2, i3] = b.t.unravel(k);
                let at = offset + i0 * 4 + i1 * nb1 + i2 * nb2 + i3 * nb3;
                unsafe {
                    (dst.ptr.add(at) as *mut f32).write_unaligned(b.at([i0, i1, i2, i3]));
                }
            }
        }
        TaskPhase::Finalize => {}
    }
}
