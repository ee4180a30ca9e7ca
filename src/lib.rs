//! llm_compute – CPU tensor graph engine with GGML-compatible quantized kernels
//! ===========================================================================
//!
//! - **Arena context** – every tensor, graph, and work buffer for a session
//!   lives in one bump-allocated [`Context`]; teardown frees everything at
//!   once.
//! - **Strided tensors** – up to 4 dimensions, zero-copy views, reshape and
//!   permute as metadata-only operations.
//! - **Quantized blocks** – the GGML block formats (Q4_0 .. Q8_1 plus the
//!   K-quant superblocks) with reference codecs and SIMD dot kernels.
//! - **Graph executor** – a DAG of operator nodes driven across a thread
//!   pool with a lock-free INIT → COMPUTE → FINALIZE barrier per node.
//! - **Container I/O** – self-describing GGUF-style serialization of
//!   tensors and typed metadata.
//!
//! ```rust
//! use llm_compute::{Context, ContextInit, Dtype};
//!
//! fn main() -> llm_compute::ComputeResult<()> {
//!     let mut ctx = Context::init(ContextInit::with_mem_size(16 << 20))?;
//!     let a = ctx.new_tensor_2d(Dtype::F32, 4, 2)?;
//!     let b = ctx.new_tensor_2d(Dtype::F32, 4, 3)?;
//!     ctx.fill_f32(a, 1.0);
//!     ctx.fill_f32(b, 2.0);
//!     let y = ctx.mul_mat(a, b)?;
//!     let graph = ctx.build_forward(y);
//!     ctx.graph_compute_with_ctx(&graph, 2)?;
//!     assert_eq!(ctx.get_f32_1d(y, 0), 8.0);
//!     Ok(())
//! }
//! ```

pub mod context;
pub mod error;
pub mod exec;
pub mod gguf;
pub mod graph;
pub mod quant;
pub mod tensor;

pub use context::{Context, ContextInit, ObjectKind, ScratchBuffer};
pub use error::{ComputeError, ComputeResult};
pub use exec::{ComputePlan, Status};
pub use gguf::{GgufFile, Value, ValueType};
pub use graph::ops::PoolKind;
pub use graph::{Graph, GraphOrder, Op, UnaryKind};
pub use quant::quantize_chunk;
pub use tensor::{Dtype, Tensor, TensorId};

#[allow(unused_imports)]
pub(crate) use tracing::{debug, error, info, trace, warn};
