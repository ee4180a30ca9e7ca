//! The CPU graph executor.
//!
//! [`Context::graph_plan`] assigns every node a task count and sizes the
//! shared work buffer. [`Context::graph_compute`] then drives `T − 1`
//! spawned workers plus the calling thread through each node in three
//! phases — INIT (one thread), COMPUTE (up to `n_tasks` threads),
//! FINALIZE (one thread) — separated by a lock-free spin barrier: a shared
//! `n_active` countdown whose last arrival finalizes the current node,
//! initializes the next, and publishes the new node index the spinning
//! workers are waiting on.

mod kernels;

use std::sync::atomic::{AtomicBool, AtomicIsize, AtomicUsize, Ordering};

use crate::context::{Context, ObjectKind};
use crate::error::{ComputeError, ComputeResult};
use crate::graph::{Graph, Op};
use crate::quant;
use crate::tensor::Dtype;

const CACHE_LINE: usize = 64;

/// Outcome of a compute call. `DidNotConverge` is reserved for iterative
/// drivers layered on top of the executor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Ok,
    Aborted,
    DidNotConverge,
}

/// Phase of the per-node protocol a kernel invocation runs in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TaskPhase {
    Init,
    Compute,
    Finalize,
}

#[derive(Clone, Copy)]
pub(crate) struct ComputeParams {
    pub phase: TaskPhase,
    pub ith: usize,
    pub nth: usize,
    pub work: *mut u8,
    pub work_size: usize,
}

impl ComputeParams {
    /// Per-thread f32 scratch of `len` elements at slot `ith`, carved from
    /// the shared work buffer with cache-line padding between threads.
    pub(crate) unsafe fn thread_scratch_f32(&self, len: usize) -> &mut [f32] {
        let stride = padded_f32_bytes(len);
        debug_assert!((self.ith + 1) * stride <= self.work_size);
        let base = self.work.add(self.ith * stride) as *mut f32;
        std::slice::from_raw_parts_mut(base, len)
    }
}

fn padded_f32_bytes(len: usize) -> usize {
    (len * 4 + CACHE_LINE - 1) / CACHE_LINE * CACHE_LINE
}

/// Execution plan: per-node task counts plus the worst-case work buffer.
pub struct ComputePlan {
    pub n_threads: usize,
    pub n_tasks: Vec<usize>,
    pub work_size: usize,
    pub work_data: Vec<u8>,
}

impl ComputePlan {
    /// Sizes the owned work buffer to what the plan requires.
    pub fn alloc_work(&mut self) -> &mut Self {
        if self.work_data.len() < self.work_size {
            self.work_data.resize(self.work_size, 0);
        }
        self
    }
}

fn node_n_tasks(ctx: &Context, graph: &Graph, i: usize, n_threads: usize) -> usize {
    let node = ctx.tensor(graph.nodes[i]);
    match node.op {
        Op::None
        | Op::Reshape
        | Op::View
        | Op::Permute
        | Op::Transpose
        | Op::GetRows
        | Op::GetRowsBack
        | Op::DiagMaskInf
        | Op::DiagMaskZero
        | Op::Set
        | Op::Sum
        | Op::SumRows
        | Op::Mean
        | Op::Repeat
        | Op::WinPart
        | Op::WinUnpart => 1,
        _ => n_threads,
    }
}

/// Work-buffer requirement of one node, given its task count.
fn node_work_size(ctx: &Context, graph: &Graph, i: usize, n_tasks: usize) -> usize {
    let node = ctx.tensor(graph.nodes[i]);
    match node.op {
        Op::MulMat => {
            let a = ctx.tensor(node.src[0].unwrap());
            let b = ctx.tensor(node.src[1].unwrap());
            let vdt = a.dtype.vec_dot_type();
            if b.dtype != vdt {
                vdt.row_size(b.ne[0]) * b.nrows()
            } else {
                0
            }
        }
        Op::Add => {
            let a = ctx.tensor(node.src[0].unwrap());
            if a.dtype.is_quantized() {
                padded_f32_bytes(a.ne[0]) * n_tasks
            } else {
                0
            }
        }
        Op::FlashAttn => {
            let k = ctx.tensor(node.src[1].unwrap());
            2 * padded_f32_bytes(k.ne[1]) * n_tasks
        }
        Op::Conv1d => {
            let a = ctx.tensor(node.src[0].unwrap());
            let ol = node.ne[0];
            a.ne[0] * a.ne[1] * ol * 4
        }
        Op::Conv2d => {
            let a = ctx.tensor(node.src[0].unwrap());
            let (ow, oh, n) = (node.ne[0], node.ne[1], node.ne[3]);
            a.ne[0] * a.ne[1] * a.ne[2] * ow * oh * n * 4
        }
        Op::CrossEntropyLoss => {
            let a = ctx.tensor(node.src[0].unwrap());
            padded_f32_bytes(a.ne[0] + 1) * n_tasks
        }
        _ => 0,
    }
}

impl Context {
    /// Plans a graph for `n_threads` workers: operator-specific task
    /// counts and the summed worst case of every per-node scratch need.
    pub fn graph_plan(&self, graph: &Graph, n_threads: usize) -> ComputePlan {
        let n_threads = n_threads.max(1);
        let mut n_tasks = Vec::with_capacity(graph.nodes.len());
        let mut work_size = 0usize;
        for i in 0..graph.nodes.len() {
            let tasks = node_n_tasks(self, graph, i, n_threads);
            work_size = work_size.max(node_work_size(self, graph, i, tasks));
            n_tasks.push(tasks);
        }
        if work_size > 0 {
            work_size += CACHE_LINE * n_threads;
        }
        ComputePlan { n_threads, n_tasks, work_size, work_data: Vec::new() }
    }

    /// Runs the graph to completion. The plan's work buffer must already
    /// be large enough (see [`ComputePlan::alloc_work`]); too small a
    /// buffer reports the required size instead of executing.
    pub fn graph_compute(&self, graph: &Graph, plan: &mut ComputePlan) -> ComputeResult<Status> {
        self.graph_compute_with_abort(graph, plan, None)
    }

    /// Like [`graph_compute`](Self::graph_compute) with a cancellation
    /// callback polled between nodes. A `true` return aborts cleanly after
    /// the current node; in-flight writes are not rolled back.
    pub fn graph_compute_with_abort(
        &self,
        graph: &Graph,
        plan: &mut ComputePlan,
        abort: Option<&(dyn Fn() -> bool + Sync)>,
    ) -> ComputeResult<Status> {
        if plan.work_size > 0 && plan.work_data.len() < plan.work_size {
            return Err(ComputeError::WorkBufferTooSmall {
                needed: plan.work_size,
                available: plan.work_data.len(),
            });
        }
        let work = WorkPtr { ptr: plan.work_data.as_mut_ptr(), size: plan.work_data.len() };
        self.compute_internal(graph, &plan.n_tasks, plan.n_threads, work, abort)
    }

    /// Convenience: plans the graph and places the work buffer in this
    /// context's arena.
    pub fn graph_compute_with_ctx(
        &mut self,
        graph: &Graph,
        n_threads: usize,
    ) -> ComputeResult<Status> {
        let plan = self.graph_plan(graph, n_threads);
        let work = if plan.work_size > 0 {
            let offs = self.new_object(ObjectKind::WorkBuffer, plan.work_size)?;
            WorkPtr { ptr: unsafe { self.arena_ptr(offs) }, size: plan.work_size }
        } else {
            WorkPtr { ptr: std::ptr::null_mut(), size: 0 }
        };
        self.compute_internal(graph, &plan.n_tasks, plan.n_threads, work, None)
    }

    fn compute_internal(
        &self,
        graph: &Graph,
        n_tasks: &[usize],
        n_threads: usize,
        work: WorkPtr,
        abort: Option<&(dyn Fn() -> bool + Sync)>,
    ) -> ComputeResult<Status> {
        debug_assert_eq!(n_tasks.len(), graph.nodes.len());
        let shared = SharedState {
            n_active: AtomicUsize::new(n_threads),
            node_n: AtomicIsize::new(-1),
            aborted: AtomicBool::new(false),
        };
        let affinity = AffinityGuard::capture(n_threads);
        let status = std::thread::scope(|scope| -> ComputeResult<Status> {
            let mut handles = Vec::with_capacity(n_threads.saturating_sub(1));
            for ith in 1..n_threads {
                let shared = &shared;
                let affinity = &affinity;
                let spawned = std::thread::Builder::new()
                    .name(format!("compute-{ith}"))
                    .spawn_scoped(scope, move || {
                        affinity.pin_worker(ith);
                        worker_loop(self, graph, n_tasks, n_threads, ith, work, shared, abort);
                    });
                let handle = match spawned {
                    Ok(handle) => handle,
                    Err(source) => {
                        // release any workers already spinning before the
                        // scope joins them
                        shared.node_n.store(graph.nodes.len() as isize, Ordering::Release);
                        return Err(ComputeError::ThreadSpawn {
                            index: ith,
                            requested: n_threads,
                            source,
                        });
                    }
                };
                handles.push(handle);
            }
            affinity.pin_worker(0);
            worker_loop(self, graph, n_tasks, n_threads, 0, work, &shared, abort);
            for handle in handles {
                handle.join().expect("worker thread panicked");
            }
            Ok(if shared.aborted.load(Ordering::Acquire) { Status::Aborted } else { Status::Ok })
        })?;
        affinity.restore();
        Ok(status)
    }
}

/// Raw view of the shared work buffer, writable from every worker. The
/// kernels partition it by thread index or fill it exclusively during
/// INIT, so writes never overlap.
#[derive(Clone, Copy)]
pub(crate) struct WorkPtr {
    pub ptr: *mut u8,
    pub size: usize,
}

unsafe impl Send for WorkPtr {}
unsafe impl Sync for WorkPtr {}

struct SharedState {
    n_active: AtomicUsize,
    node_n: AtomicIsize,
    aborted: AtomicBool,
}

#[allow(clippy::too_many_arguments)]
fn worker_loop(
    ctx: &Context,
    graph: &Graph,
    n_tasks: &[usize],
    n_threads: usize,
    ith: usize,
    work: WorkPtr,
    shared: &SharedState,
    abort: Option<&(dyn Fn() -> bool + Sync)>,
) {
    let n_nodes = graph.nodes.len() as isize;
    let mut node_n: isize = -1;
    loop {
        if shared.n_active.fetch_sub(1, Ordering::AcqRel) == 1 {
            // last to finish the phase: finalize, then advance
            if node_n >= 0 {
                let i = node_n as usize;
                run_phase(ctx, graph, i, TaskPhase::Finalize, 0, n_tasks[i], work);
            }
            if abort.is_some_and(|cb| cb()) {
                shared.aborted.store(true, Ordering::Release);
                node_n = n_nodes;
            }
            while node_n < n_nodes {
                node_n += 1;
                if node_n == n_nodes {
                    break;
                }
                let i = node_n as usize;
                if op_has_init(ctx.tensor(graph.nodes[i]).op) {
                    run_phase(ctx, graph, i, TaskPhase::Init, 0, n_tasks[i], work);
                }
                if n_tasks[i] == 1 {
                    // single-task nodes run start to finish right here
                    run_phase(ctx, graph, i, TaskPhase::Compute, 0, 1, work);
                    run_phase(ctx, graph, i, TaskPhase::Finalize, 0, 1, work);
                    if abort.is_some_and(|cb| cb()) {
                        shared.aborted.store(true, Ordering::Release);
                        node_n = n_nodes;
                        break;
                    }
                } else {
                    break;
                }
            }
            shared.n_active.store(n_threads, Ordering::Release);
            shared.node_n.store(node_n, Ordering::Release);
        } else {
            while shared.node_n.load(Ordering::Acquire) == node_n {
                std::hint::spin_loop();
            }
            node_n = shared.node_n.load(Ordering::Acquire);
        }
        if node_n >= n_nodes {
            return;
        }
        let i = node_n as usize;
        if ith < n_tasks[i] {
            run_phase(ctx, graph, i, TaskPhase::Compute, ith, n_tasks[i], work);
        }
    }
}

fn run_phase(
    ctx: &Context,
    graph: &Graph,
    node: usize,
    phase: TaskPhase,
    ith: usize,
    nth: usize,
    work: WorkPtr,
) {
    let params = ComputeParams { phase, ith, nth, work: work.ptr, work_size: work.size };
    kernels::compute_forward(ctx, &params, graph.nodes[node]);
}

/// Operators with a meaningful INIT phase: inputs that must exist before
/// any COMPUTE worker proceeds (matmul requantization, destination
/// zeroing, base copies, im2col tables). Everything else skips straight
/// to COMPUTE.
fn op_has_init(op: Op) -> bool {
    matches!(
        op,
        Op::MulMat | Op::OutProd | Op::Set | Op::GetRowsBack | Op::Conv1d | Op::Conv2d
    )
}

/// Requantization target dtype for a matmul right-hand side, if any.
pub(crate) fn mul_mat_requant_dtype(a: Dtype, b: Dtype) -> Option<Dtype> {
    let vdt = a.vec_dot_type();
    (b != vdt && quant::codec(vdt).is_some()).then_some(vdt)
}

// --- worker pinning --------------------------------------------------------

/// Pins workers round-robin across NUMA-local CPU sets on multi-node Linux
/// hosts and restores the caller's affinity on exit. A no-op everywhere
/// else.
struct AffinityGuard {
    #[cfg(target_os = "linux")]
    saved: Option<nix::sched::CpuSet>,
    #[cfg(target_os = "linux")]
    nodes: Vec<Vec<usize>>,
}

impl AffinityGuard {
    #[cfg(target_os = "linux")]
    fn capture(n_threads: usize) -> Self {
        let topo = crate::context::globals::NumaTopology::get();
        if n_threads < 2 || topo.nodes.len() < 2 {
            return AffinityGuard { saved: None, nodes: Vec::new() };
        }
        let saved = nix::sched::sched_getaffinity(nix::unistd::Pid::from_raw(0)).ok();
        AffinityGuard { saved, nodes: topo.nodes.clone() }
    }

    #[cfg(not(target_os = "linux"))]
    fn capture(_n_threads: usize) -> Self {
        AffinityGuard {}
    }

    #[cfg(target_os = "linux")]
    fn pin_worker(&self, ith: usize) {
        if self.nodes.is_empty() {
            return;
        }
        let cpus = &self.nodes[ith % self.nodes.len()];
        let mut set = nix::sched::CpuSet::new();
        for &cpu in cpus {
            if set.set(cpu).is_err() {
                return;
            }
        }
        if let Err(err) = nix::sched::sched_setaffinity(nix::unistd::Pid::from_raw(0), &set) {
            crate::warn!(worker = ith, %err, "failed to pin worker");
        }
    }

    #[cfg(not(target_os = "linux"))]
    fn pin_worker(&self, _ith: usize) {}

    #[cfg(target_os = "linux")]
    fn restore(&self) {
        if let Some(saved) = &self.saved {
            let _ = nix::sched::sched_setaffinity(nix::unistd::Pid::from_raw(0), saved);
        }
    }

    #[cfg(not(target_os = "linux"))]
    fn restore(&self) {}
}
