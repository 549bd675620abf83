//! Intermediate representation core.
//!
//! # Components
//!
//! - **Arena** (`arena.rs`): slot-reusing node storage and typed ids
//! - **Operators** (`operators.rs`): the closed node-kind set and per-input
//!   edge-kind signatures
//! - **Node** (`node.rs`): node structure and compact input lists
//! - **Graph** (`graph.rs`): the mutable store with its reverse usage index
//! - **CFG** (`cfg.rs`): blocks, dominance, frequencies, loop forest
//! - **Schedule** (`schedule.rs`): node-to-block assignment
//!
//! # Design principles
//!
//! - **Indices over pointers**: nodes address each other through arena ids;
//!   "is this still referenced" is an index-set query, never a pointer scan
//! - **Symmetric edges**: forward input lists and the reverse usage index
//!   are updated together by every mutation primitive
//! - **Derive, don't cache**: CFG and schedule are recomputed after
//!   structural edits, not invalidated

pub mod arena;
pub mod cfg;
pub mod graph;
pub mod node;
pub mod operators;
pub mod schedule;

#[cfg(test)]
pub mod test_graphs;

pub use arena::{Arena, BitSet, Id, SecondaryMap};
pub use cfg::{BasicBlock, BlockId, Cfg, CfgOptions, Loop};
pub use graph::{Graph, GraphError, GraphResult};
pub use node::{InputList, Node, NodeAux, NodeFlags, NodeId};
pub use operators::{
    ArithOp, BarrierKind, BitwiseOp, CmpOp, ControlOp, ConvertOp, DeoptAction, DeoptReason,
    EdgeKind, GuardKind, MemoryOp, Operator, ValueType,
};
pub use schedule::Schedule;
