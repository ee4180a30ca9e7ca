//! Session-scoped arena context.
//!
//! A [`Context`] owns one bump-allocated byte arena plus a typed object
//! table. Tensors, work buffers, and graph storage are carved out of the
//! arena in strictly increasing address order; nothing is freed until the
//! context itself drops, which invalidates every [`TensorId`] at once.
//!
//! Large transient tensor storage can be redirected into a pushed
//! [`ScratchBuffer`] whose offset advances independently of the main arena.

pub(crate) mod globals;

use std::alloc::Layout;

use crate::error::{ComputeError, ComputeResult};
use crate::tensor::{DataSlot, Dtype, Tensor, TensorId, MAX_DIMS};

/// Every object the arena hands out is aligned to at least this.
pub const OBJECT_ALIGN: usize = 16;

/// What a raw arena object is used for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjectKind {
    Tensor,
    Graph,
    WorkBuffer,
}

/// Header recorded for every arena allocation, in address order.
#[derive(Debug, Clone, Copy)]
#[allow(dead_code)]
struct ObjectInfo {
    kind: ObjectKind,
    offs: usize,
    size: usize,
}

/// A byte buffer with stable address and 16-byte-aligned base, either
/// allocated here or adopted from a caller-provided `Vec`.
///
/// Workers write through raw pointers into disjoint sub-ranges during
/// graph execution, hence the manual `Send`/`Sync`.
struct ArenaBuf {
    ptr: *mut u8,
    len: usize,
    source: BufSource,
    /// First 16-byte-aligned offset from `ptr`.
    base: usize,
}

enum BufSource {
    Owned(Layout),
    Adopted,
}

unsafe impl Send for ArenaBuf {}
unsafe impl Sync for ArenaBuf {}

impl ArenaBuf {
    fn owned(size: usize) -> Self {
        let size = size.max(1);
        let layout = Layout::from_size_align(size, OBJECT_ALIGN).expect("arena layout");
        let ptr = unsafe { std::alloc::alloc_zeroed(layout) };
        assert!(!ptr.is_null(), "arena allocation of {size} bytes failed");
        ArenaBuf { ptr, len: size, source: BufSource::Owned(layout), base: 0 }
    }

    fn adopt(vec: Vec<u8>) -> Self {
        let mut boxed = vec.into_boxed_slice();
        boxed.iter_mut().for_each(|b| *b = 0);
        let len = boxed.len();
        let ptr = Box::into_raw(boxed) as *mut u8;
        let base = ptr.align_offset(OBJECT_ALIGN).min(len);
        ArenaBuf { ptr, len, source: BufSource::Adopted, base }
    }

    #[inline]
    fn base_ptr(&self) -> *mut u8 {
        unsafe { self.ptr.add(self.base) }
    }

    #[inline]
    fn capacity(&self) -> usize {
        self.len - self.base
    }
}

impl Drop for ArenaBuf {
    fn drop(&mut self) {
        match self.source {
            BufSource::Owned(layout) => unsafe { std::alloc::dealloc(self.ptr, layout) },
            BufSource::Adopted => unsafe {
                drop(Box::from_raw(std::slice::from_raw_parts_mut(self.ptr, self.len)));
            },
        }
    }
}

/// A secondary allocation region for short-lived tensor storage. Pushed
/// onto a context around operator construction; the context retains the
/// buffer (and thus the storage of every tensor placed in it) until the
/// context drops.
pub struct ScratchBuffer {
    buf: ArenaBuf,
    offs: usize,
}

impl ScratchBuffer {
    pub fn with_size(size: usize) -> Self {
        ScratchBuffer { buf: ArenaBuf::owned(size), offs: 0 }
    }

    pub fn capacity(&self) -> usize {
        self.buf.capacity()
    }

    pub fn used(&self) -> usize {
        self.offs
    }
}

/// Parameters for [`Context::init`].
pub struct ContextInit {
    pub mem_size: usize,
    pub mem_buffer: Option<Vec<u8>>,
    /// Create metadata objects only, leaving tensor data unallocated. Used
    /// when a downstream allocator (e.g. a container loader mapping
    /// payloads) binds storage later.
    pub no_alloc: bool,
}

impl ContextInit {
    pub fn with_mem_size(mem_size: usize) -> Self {
        ContextInit { mem_size, mem_buffer: None, no_alloc: false }
    }

    pub fn with_buffer(mem_buffer: Vec<u8>) -> Self {
        ContextInit { mem_size: mem_buffer.len(), mem_buffer: Some(mem_buffer), no_alloc: false }
    }

    pub fn no_alloc(mut self, no_alloc: bool) -> Self {
        self.no_alloc = no_alloc;
        self
    }
}

/// The arena context. See the module docs.
pub struct Context {
    buf: ArenaBuf,
    offs: usize,
    no_alloc: bool,
    objects: Vec<ObjectInfo>,
    pub(crate) tensors: Vec<Tensor>,
    scratch_bufs: Vec<ScratchBuffer>,
    scratch_active: Vec<usize>,
}

impl Context {
    /// Creates a context. Concurrent calls serialize behind a process-wide
    /// critical section; the first call through also builds the global
    /// fp16 conversion and activation tables.
    pub fn init(params: ContextInit) -> ComputeResult<Self> {
        let _guard = globals::CONTEXT_INIT_LOCK
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        globals::ensure_tables();

        let buf = match params.mem_buffer {
            Some(vec) => ArenaBuf::adopt(vec),
            None => ArenaBuf::owned(params.mem_size),
        };
        crate::trace!(mem_size = buf.capacity(), no_alloc = params.no_alloc, "context created");
        Ok(Context {
            buf,
            offs: 0,
            no_alloc: params.no_alloc,
            objects: Vec::new(),
            tensors: Vec::new(),
            scratch_bufs: Vec::new(),
            scratch_active: Vec::new(),
        })
    }

    pub fn mem_size(&self) -> usize {
        self.buf.capacity()
    }

    pub fn used_mem(&self) -> usize {
        self.offs
    }

    pub fn no_alloc(&self) -> bool {
        self.no_alloc
    }

    pub fn n_tensors(&self) -> usize {
        self.tensors.len()
    }

    /// Reserves `size` aligned bytes in the main arena and records the
    /// object. Returns the byte offset of the new region.
    pub fn new_object(&mut self, kind: ObjectKind, size: usize) -> ComputeResult<usize> {
        let offs = self.offs;
        let size_padded = align_up(size);
        if offs + size_padded > self.buf.capacity() {
            crate::error!(
                arena = "context",
                needed = size_padded,
                available = self.buf.capacity() - offs,
                "arena exhausted"
            );
            return Err(ComputeError::OutOfArena {
                arena: "context",
                needed: size_padded,
                available: self.buf.capacity() - offs,
            });
        }
        self.offs += size_padded;
        self.objects.push(ObjectInfo { kind, offs, size });
        Ok(offs)
    }

    fn alloc_scratch(&mut self, buf_idx: usize, size: usize) -> ComputeResult<usize> {
        let sb = &mut self.scratch_bufs[buf_idx];
        let offs = sb.offs;
        let size_padded = align_up(size);
        if offs + size_padded > sb.buf.capacity() {
            crate::error!(
                arena = "scratch",
                needed = size_padded,
                available = sb.buf.capacity() - offs,
                "arena exhausted"
            );
            return Err(ComputeError::OutOfArena {
                arena: "scratch",
                needed: size_padded,
                available: sb.buf.capacity() - offs,
            });
        }
        sb.offs += size_padded;
        Ok(offs)
    }

    /// Makes `scratch` the active region for tensor data until the
    /// matching [`scratch_pop`](Self::scratch_pop). The buffer is retained
    /// by the context so storage placed in it stays valid.
    pub fn scratch_push(&mut self, scratch: ScratchBuffer) {
        let idx = self.scratch_bufs.len();
        self.scratch_bufs.push(scratch);
        self.scratch_active.push(idx);
    }

    pub fn scratch_pop(&mut self) {
        self.scratch_active.pop().expect("scratch_pop without a matching scratch_push");
    }

    pub(crate) fn push_tensor(&mut self, mut tensor: Tensor) -> ComputeResult<TensorId> {
        if tensor.data.is_none() && tensor.view_src.is_none() && !self.no_alloc {
            let nbytes = tensor.nbytes();
            tensor.data = Some(match self.scratch_active.last().copied() {
                Some(buf) => DataSlot::Scratch { buf, offs: self.alloc_scratch(buf, nbytes)? },
                None => DataSlot::Main { offs: self.new_object(ObjectKind::Tensor, nbytes)? },
            });
        }
        let id = TensorId(u32::try_from(self.tensors.len()).expect("tensor count overflow"));
        self.tensors.push(tensor);
        Ok(id)
    }

    pub fn new_tensor(&mut self, dtype: Dtype, ne: &[usize]) -> ComputeResult<TensorId> {
        self.push_tensor(Tensor::new(dtype, ne.len(), ne))
    }

    pub fn new_tensor_1d(&mut self, dtype: Dtype, ne0: usize) -> ComputeResult<TensorId> {
        self.new_tensor(dtype, &[ne0])
    }

    pub fn new_tensor_2d(&mut self, dtype: Dtype, ne0: usize, ne1: usize) -> ComputeResult<TensorId> {
        self.new_tensor(dtype, &[ne0, ne1])
    }

    pub fn new_tensor_3d(
        &mut self,
        dtype: Dtype,
        ne0: usize,
        ne1: usize,
        ne2: usize,
    ) -> ComputeResult<TensorId> {
        self.new_tensor(dtype, &[ne0, ne1, ne2])
    }

    pub fn new_tensor_4d(
        &mut self,
        dtype: Dtype,
        ne0: usize,
        ne1: usize,
        ne2: usize,
        ne3: usize,
    ) -> ComputeResult<TensorId> {
        self.new_tensor(dtype, &[ne0, ne1, ne2, ne3])
    }

    /// Same dtype and shape as `src`, fresh storage.
    pub fn dup_tensor(&mut self, src: TensorId) -> ComputeResult<TensorId> {
        let (dtype, n_dims, ne) = {
            let s = self.tensor(src);
            (s.dtype, s.n_dims, s.ne)
        };
        self.push_tensor(Tensor::new(dtype, n_dims, &ne))
    }

    /// A scalar constant.
    pub fn new_f32(&mut self, value: f32) -> ComputeResult<TensorId> {
        let id = self.new_tensor_1d(Dtype::F32, 1)?;
        if !self.no_alloc {
            self.set_f32_1d(id, 0, value);
        }
        Ok(id)
    }

    /// Allocates a tensor aliasing `base`'s storage at byte offset `offs`,
    /// with the given shape and optional stride overrides for `nb[1..]`.
    /// The view must stay inside the base tensor.
    pub(crate) fn view_tensor_impl(
        &mut self,
        base: TensorId,
        dtype: Dtype,
        n_dims: usize,
        ne: &[usize],
        offs: usize,
        nb_override: &[usize],
    ) -> ComputeResult<TensorId> {
        // Resolve chained views down to the tensor that owns the bytes.
        let (root, root_offs) = {
            let b = self.tensor(base);
            match b.view_src {
                Some(root) => (root, b.view_offs + offs),
                None => (base, offs),
            }
        };
        let mut t = Tensor::new(dtype, n_dims, ne);
        if !nb_override.is_empty() {
            for (i, &nb) in nb_override.iter().enumerate() {
                t.nb[1 + i] = nb;
            }
            for i in 1 + nb_override.len()..MAX_DIMS {
                t.nb[i] = t.nb[i - 1] * t.ne[i - 1];
            }
        }
        assert!(
            root_offs + t.nbytes() <= self.tensor(root).nbytes(),
            "view of {} bytes at offset {root_offs} escapes base tensor of {} bytes",
            t.nbytes(),
            self.tensor(root).nbytes()
        );
        t.view_src = Some(root);
        t.view_offs = root_offs;
        t.data = self.resolve_view_slot(root, root_offs);
        self.push_tensor(t)
    }

    fn resolve_view_slot(&self, root: TensorId, root_offs: usize) -> Option<DataSlot> {
        self.tensor(root).data.map(|slot| match slot {
            DataSlot::Main { offs: base_offs } => DataSlot::Main { offs: base_offs + root_offs },
            DataSlot::Scratch { buf, offs: base_offs } => {
                DataSlot::Scratch { buf, offs: base_offs + root_offs }
            }
        })
    }

    /// A whole-tensor alias of `src` preserving its exact shape and
    /// strides.
    pub fn view_tensor(&mut self, src: TensorId) -> ComputeResult<TensorId> {
        let (root, root_offs, mut t) = {
            let s = self.tensor(src);
            let mut t = Tensor::new(s.dtype, s.n_dims, &s.ne);
            t.nb = s.nb;
            t.n_dims = s.n_dims;
            match s.view_src {
                Some(root) => (root, s.view_offs, t),
                None => (src, 0, t),
            }
        };
        t.view_src = Some(root);
        t.view_offs = root_offs;
        t.data = self.resolve_view_slot(root, root_offs);
        self.push_tensor(t)
    }

    #[inline]
    pub fn tensor(&self, id: TensorId) -> &Tensor {
        &self.tensors[id.index()]
    }

    #[inline]
    pub fn tensor_mut(&mut self, id: TensorId) -> &mut Tensor {
        &mut self.tensors[id.index()]
    }

    pub fn set_name(&mut self, id: TensorId, name: &str) {
        self.tensor_mut(id).set_name(name);
    }

    /// First tensor carrying `name`, if any.
    pub fn find_tensor(&self, name: &str) -> Option<TensorId> {
        self.tensors
            .iter()
            .position(|t| t.name == name)
            .map(|at| TensorId(at as u32))
    }

    pub fn is_allocated(&self, id: TensorId) -> bool {
        self.tensor(id).data.is_some()
    }

    /// Raw pointer into the main arena at `offs`, e.g. a work-buffer
    /// object. The caller is responsible for staying inside the object.
    pub(crate) unsafe fn arena_ptr(&self, offs: usize) -> *mut u8 {
        self.buf.base_ptr().add(offs)
    }

    /// Raw pointer to the tensor's first byte. Panics when allocation was
    /// deferred (`no_alloc`) and storage was never bound.
    #[inline]
    pub(crate) fn data_ptr(&self, id: TensorId) -> *mut u8 {
        let t = &self.tensors[id.index()];
        let slot = t.data.unwrap_or_else(|| panic!("tensor '{}' has no storage", t.name));
        match slot {
            DataSlot::Main { offs } => unsafe { self.buf.base_ptr().add(offs) },
            DataSlot::Scratch { buf, offs } => unsafe {
                self.scratch_bufs[buf].buf.base_ptr().add(offs)
            },
        }
    }

    /// The tensor's bytes as a slice. Only meaningful for contiguous
    /// tensors (views included).
    pub fn data(&self, id: TensorId) -> &[u8] {
        let n = self.tensor(id).nbytes();
        unsafe { std::slice::from_raw_parts(self.data_ptr(id), n) }
    }

    pub fn data_mut(&mut self, id: TensorId) -> &mut [u8] {
        let n = self.tensor(id).nbytes();
        unsafe { std::slice::from_raw_parts_mut(self.data_ptr(id), n) }
    }

    /// Binds storage for a tensor created under `no_alloc`, copying
    /// `bytes` into the main arena.
    pub fn bind_data(&mut self, id: TensorId, bytes: &[u8]) -> ComputeResult<()> {
        assert_eq!(bytes.len(), self.tensor(id).nbytes(), "payload size mismatch");
        assert!(self.tensor(id).data.is_none(), "tensor storage already bound");
        let offs = self.new_object(ObjectKind::Tensor, bytes.len())?;
        self.tensors[id.index()].data = Some(DataSlot::Main { offs });
        self.data_mut(id).copy_from_slice(bytes);
        Ok(())
    }

    pub fn get_f32_1d(&self, id: TensorId, i: usize) -> f32 {
        let t = self.tensor(id);
        self.get_f32_nd(id, t.unravel(i))
    }

    pub fn set_f32_1d(&mut self, id: TensorId, i: usize, value: f32) {
        let idx = self.tensor(id).unravel(i);
        self.set_f32_nd(id, idx, value);
    }

    pub fn get_f32_nd(&self, id: TensorId, idx: [usize; MAX_DIMS]) -> f32 {
        let t = self.tensor(id);
        let p = unsafe { self.data_ptr(id).add(t.elem_offset(idx)) };
        unsafe {
            match t.dtype {
                Dtype::F32 => (p as *const f32).read_unaligned(),
                Dtype::F16 => globals::fp16_to_f32(half::f16::from_bits(
                    (p as *const u16).read_unaligned(),
                )),
                Dtype::I8 => (p as *const i8).read_unaligned() as f32,
                Dtype::I16 => (p as *const i16).read_unaligned() as f32,
                Dtype::I32 => (p as *const i32).read_unaligned() as f32,
                other => panic!("element access on quantized dtype {other:?}"),
            }
        }
    }

    pub fn set_f32_nd(&mut self, id: TensorId, idx: [usize; MAX_DIMS], value: f32) {
        let t = self.tensor(id);
        let p = unsafe { self.data_ptr(id).add(t.elem_offset(idx)) };
        unsafe {
            match t.dtype {
                Dtype::F32 => (p as *mut f32).write_unaligned(value),
                Dtype::F16 => {
                    (p as *mut u16).write_unaligned(half::f16::from_f32(value).to_bits())
                }
                Dtype::I8 => (p as *mut i8).write_unaligned(value as i8),
                Dtype::I16 => (p as *mut i16).write_unaligned(value as i16),
                Dtype::I32 => (p as *mut i32).write_unaligned(value as i32),
                other => panic!("element access on quantized dtype {other:?}"),
            }
        }
    }

    pub fn get_i32_1d(&self, id: TensorId, i: usize) -> i32 {
        let t = self.tensor(id);
        let p = unsafe { self.data_ptr(id).add(t.elem_offset(t.unravel(i))) };
        unsafe {
            match t.dtype {
                Dtype::I8 => (p as *const i8).read_unaligned() as i32,
                Dtype::I16 => (p as *const i16).read_unaligned() as i32,
                Dtype::I32 => (p as *const i32).read_unaligned(),
                Dtype::F32 => (p as *const f32).read_unaligned() as i32,
                other => panic!("integer access on dtype {other:?}"),
            }
        }
    }

    pub fn set_i32_1d(&mut self, id: TensorId, i: usize, value: i32) {
        let idx = self.tensor(id).unravel(i);
        let t = self.tensor(id);
        let p = unsafe { self.data_ptr(id).add(t.elem_offset(idx)) };
        unsafe {
            match t.dtype {
                Dtype::I8 => (p as *mut i8).write_unaligned(value as i8),
                Dtype::I16 => (p as *mut i16).write_unaligned(value as i16),
                Dtype::I32 => (p as *mut i32).write_unaligned(value),
                other => panic!("integer access on dtype {other:?}"),
            }
        }
    }

    /// Sets every element of a native-dtype tensor to `value`.
    pub fn fill_f32(&mut self, id: TensorId, value: f32) {
        let n = self.tensor(id).nelements();
        for i in 0..n {
            self.set_f32_1d(id, i, value);
        }
    }

    /// Bulk-loads a contiguous F32 tensor from a slice.
    pub fn load_f32(&mut self, id: TensorId, values: &[f32]) {
        let t = self.tensor(id);
        assert!(t.dtype == Dtype::F32 && t.is_contiguous());
        assert_eq!(values.len(), t.nelements());
        let dst = self.data_mut(id);
        for (chunk, v) in dst.chunks_exact_mut(4).zip(values) {
            chunk.copy_from_slice(&v.to_ne_bytes());
        }
    }

    /// Reads any native or quantized tensor out as dequantized f32 values
    /// in row-major order. Requires contiguous storage for quantized types.
    pub fn to_vec_f32(&self, id: TensorId) -> Vec<f32> {
        let t = self.tensor(id);
        let n = t.nelements();
        if t.dtype.is_quantized() {
            assert!(t.is_contiguous(), "dequantizing a non-contiguous tensor");
            let mut out = vec![0.0f32; n];
            crate::quant::dequantize_row(t.dtype, self.data(id), &mut out);
            out
        } else {
            (0..n).map(|i| self.get_f32_1d(id, i)).collect()
        }
    }
}

#[inline]
fn align_up(size: usize) -> usize {
    (size + OBJECT_ALIGN - 1) & !(OBJECT_ALIGN - 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocations_are_aligned_and_ordered() {
        let mut ctx = Context::init(ContextInit::with_mem_size(4096)).unwrap();
        let a = ctx.new_object(ObjectKind::WorkBuffer, 10).unwrap();
        let b = ctx.new_object(ObjectKind::WorkBuffer, 10).unwrap();
        assert_eq!(a % OBJECT_ALIGN, 0);
        assert_eq!(b % OBJECT_ALIGN, 0);
        assert!(b > a);
    }

    #[test]
    fn out_of_arena_is_recoverable() {
        let mut ctx = Context::init(ContextInit::with_mem_size(64)).unwrap();
        let before = ctx.used_mem();
        let err = ctx.new_object(ObjectKind::WorkBuffer, 1 << 20).unwrap_err();
        assert!(matches!(err, ComputeError::OutOfArena { arena: "context", .. }));
        assert_eq!(ctx.used_mem(), before);
    }

    #[test]
    fn scratch_allocations_leave_main_arena_untouched() {
        let mut ctx = Context::init(ContextInit::with_mem_size(4096)).unwrap();
        let used = ctx.used_mem();
        ctx.scratch_push(ScratchBuffer::with_size(1024));
        let t = ctx.new_tensor_1d(Dtype::F32, 16).unwrap();
        ctx.scratch_pop();
        assert_eq!(ctx.used_mem(), used);
        assert!(ctx.is_allocated(t));
    }

    #[test]
    fn no_alloc_defers_storage() {
        let mut ctx =
            Context::init(ContextInit::with_mem_size(1024).no_alloc(true)).unwrap();
        let t = ctx.new_tensor_1d(Dtype::F32, 8).unwrap();
        assert!(!ctx.is_allocated(t));
        ctx.bind_data(t, &[0u8; 32]).unwrap();
        assert!(ctx.is_allocated(t));
    }
}
