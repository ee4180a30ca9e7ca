//! The dataflow graph: operator tags, topological construction, and the
//! reverse-mode gradient expansion.

pub mod backward;
pub mod ops;

use crate::context::Context;
use crate::tensor::TensorId;

/// Default node capacity of a graph. The visited table is sized past twice
/// this so open addressing stays short-chained.
pub const GRAPH_NODE_CAP: usize = 4096;
const VISITED_SLOTS: usize = 9973;

/// Operator tag stamped on every non-leaf tensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Op {
    None,
    Dup,
    Add,
    Sub,
    Mul,
    Div,
    Sqr,
    Sqrt,
    Sum,
    SumRows,
    Mean,
    Repeat,
    Unary,
    SiluBack,
    Norm,
    RmsNorm,
    RmsNormBack,
    MulMat,
    OutProd,
    Scale,
    Set,
    Cpy,
    Cont,
    Reshape,
    View,
    Permute,
    Transpose,
    GetRows,
    GetRowsBack,
    DiagMaskInf,
    DiagMaskZero,
    SoftMax,
    SoftMaxBack,
    Rope,
    RopeBack,
    Alibi,
    Clamp,
    Conv1d,
    Conv2d,
    Pool1d,
    Pool2d,
    Upscale,
    FlashAttn,
    WinPart,
    WinUnpart,
    CrossEntropyLoss,
    CrossEntropyLossBack,
}

impl Op {
    pub fn name(self) -> &'static str {
        match self {
            Op::None => "none",
            Op::Dup => "dup",
            Op::Add => "add",
            Op::Sub => "sub",
            Op::Mul => "mul",
            Op::Div => "div",
            Op::Sqr => "sqr",
            Op::Sqrt => "sqrt",
            Op::Sum => "sum",
            Op::SumRows => "sum_rows",
            Op::Mean => "mean",
            Op::Repeat => "repeat",
            Op::Unary => "unary",
            Op::SiluBack => "silu_back",
            Op::Norm => "norm",
            Op::RmsNorm => "rms_norm",
            Op::RmsNormBack => "rms_norm_back",
            Op::MulMat => "mul_mat",
            Op::OutProd => "out_prod",
            Op::Scale => "scale",
            Op::Set => "set",
            Op::Cpy => "cpy",
            Op::Cont => "cont",
            Op::Reshape => "reshape",
            Op::View => "view",
            Op::Permute => "permute",
            Op::Transpose => "transpose",
            Op::GetRows => "get_rows",
            Op::GetRowsBack => "get_rows_back",
            Op::DiagMaskInf => "diag_mask_inf",
            Op::DiagMaskZero => "diag_mask_zero",
            Op::SoftMax => "soft_max",
            Op::SoftMaxBack => "soft_max_back",
            Op::Rope => "rope",
            Op::RopeBack => "rope_back",
            Op::Alibi => "alibi",
            Op::Clamp => "clamp",
            Op::Conv1d => "conv_1d",
            Op::Conv2d => "conv_2d",
            Op::Pool1d => "pool_1d",
            Op::Pool2d => "pool_2d",
            Op::Upscale => "upscale",
            Op::FlashAttn => "flash_attn",
            Op::WinPart => "win_part",
            Op::WinUnpart => "win_unpart",
            Op::CrossEntropyLoss => "cross_entropy_loss",
            Op::CrossEntropyLossBack => "cross_entropy_loss_back",
        }
    }
}

/// Kind tag for [`Op::Unary`], stored in `op_params[0]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryKind {
    Abs,
    Sgn,
    Neg,
    Step,
    Tanh,
    Elu,
    Relu,
    Gelu,
    GeluQuick,
    Silu,
}

impl UnaryKind {
    pub(crate) fn from_i32(v: i32) -> Self {
        match v {
            0 => UnaryKind::Abs,
            1 => UnaryKind::Sgn,
            2 => UnaryKind::Neg,
            3 => UnaryKind::Step,
            4 => UnaryKind::Tanh,
            5 => UnaryKind::Elu,
            6 => UnaryKind::Relu,
            7 => UnaryKind::Gelu,
            8 => UnaryKind::GeluQuick,
            9 => UnaryKind::Silu,
            _ => panic!("unknown unary kind {v}"),
        }
    }

    pub(crate) fn to_i32(self) -> i32 {
        match self {
            UnaryKind::Abs => 0,
            UnaryKind::Sgn => 1,
            UnaryKind::Neg => 2,
            UnaryKind::Step => 3,
            UnaryKind::Tanh => 4,
            UnaryKind::Elu => 5,
            UnaryKind::Relu => 6,
            UnaryKind::Gelu => 7,
            UnaryKind::GeluQuick => 8,
            UnaryKind::Silu => 9,
        }
    }
}

/// Direction of the depth-first walk over each node's sources. Fixed per
/// graph so repeated builds produce identical node sequences.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum GraphOrder {
    #[default]
    LeftToRight,
    RightToLeft,
}

/// Open-addressed identity set used for DFS de-duplication and for the
/// backward pass's zero-gradient table. Saturation is fatal: it means the
/// graph outgrew [`GRAPH_NODE_CAP`].
#[derive(Clone)]
pub(crate) struct IdSet {
    slots: Box<[Option<TensorId>]>,
}

impl IdSet {
    pub(crate) fn new() -> Self {
        IdSet { slots: vec![None; VISITED_SLOTS].into_boxed_slice() }
    }

    fn slot_of(&self, id: TensorId) -> usize {
        (id.0 as usize).wrapping_mul(0x9e37_79b9) % self.slots.len()
    }

    /// Returns true when `id` was not present before.
    pub(crate) fn insert(&mut self, id: TensorId) -> bool {
        let mut at = self.slot_of(id);
        for _ in 0..self.slots.len() {
            match self.slots[at] {
                None => {
                    self.slots[at] = Some(id);
                    return true;
                }
                Some(existing) if existing == id => return false,
                Some(_) => at = (at + 1) % self.slots.len(),
            }
        }
        panic!("graph table saturated: more than {GRAPH_NODE_CAP} nodes");
    }

    pub(crate) fn contains(&self, id: TensorId) -> bool {
        let mut at = self.slot_of(id);
        for _ in 0..self.slots.len() {
            match self.slots[at] {
                None => return false,
                Some(existing) if existing == id => return true,
                Some(_) => at = (at + 1) % self.slots.len(),
            }
        }
        false
    }

    pub(crate) fn remove(&mut self, id: TensorId) {
        // Removed slots become tombstones so later probe chains stay
        // intact. Removed ids are never re-inserted.
        let mut at = self.slot_of(id);
        for _ in 0..self.slots.len() {
            match self.slots[at] {
                None => return,
                Some(existing) if existing == id => {
                    self.slots[at] = Some(TensorId(u32::MAX));
                    return;
                }
                Some(_) => at = (at + 1) % self.slots.len(),
            }
        }
    }
}

/// An ordered sequence of operator nodes plus the leaves they consume.
/// Nodes are topologically sorted: every source precedes its consumers.
#[derive(Clone)]
pub struct Graph {
    pub nodes: Vec<TensorId>,
    pub grads: Vec<Option<TensorId>>,
    pub leafs: Vec<TensorId>,
    pub order: GraphOrder,
    pub(crate) visited: IdSet,
}

impl Default for Graph {
    fn default() -> Self {
        Graph::new(GraphOrder::LeftToRight)
    }
}

impl Graph {
    pub fn new(order: GraphOrder) -> Self {
        Graph {
            nodes: Vec::new(),
            grads: Vec::new(),
            leafs: Vec::new(),
            order,
            visited: IdSet::new(),
        }
    }

    pub fn n_nodes(&self) -> usize {
        self.nodes.len()
    }
}

impl Context {
    /// Builds the topologically ordered graph rooted at `root`.
    pub fn build_forward(&self, root: TensorId) -> Graph {
        let mut graph = Graph::default();
        self.build_forward_expand(&mut graph, root);
        graph
    }

    /// Extends `graph` with every tensor reachable from `root` that is not
    /// already recorded. Reverse post-order: sources first.
    pub fn build_forward_expand(&self, graph: &mut Graph, root: TensorId) {
        self.visit_parents(graph, root);
    }

    fn visit_parents(&self, graph: &mut Graph, id: TensorId) {
        if !graph.visited.insert(id) {
            return;
        }
        let srcs = self.tensor(id).src;
        match graph.order {
            GraphOrder::LeftToRight => {
                for src in srcs.iter().flatten() {
                    self.visit_parents(graph, *src);
                }
            }
            GraphOrder::RightToLeft => {
                for src in srcs.iter().rev().flatten() {
                    self.visit_parents(graph, *src);
                }
            }
        }
        let t = self.tensor(id);
        if t.op == Op::None {
            graph.leafs.push(id);
        } else {
            assert!(graph.nodes.len() < GRAPH_NODE_CAP, "graph node capacity exceeded");
            graph.nodes.push(id);
            graph.grads.push(t.grad);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn id_set_inserts_and_rejects_duplicates() {
        let mut set = IdSet::new();
        assert!(set.insert(TensorId(7)));
        assert!(!set.insert(TensorId(7)));
        assert!(set.contains(TensorId(7)));
        assert!(!set.contains(TensorId(8)));
        set.remove(TensorId(7));
        assert!(!set.contains(TensorId(7)));
    }
}
