//! Graph-rewrite passes.
//!
//! Passes mutate the graph in place and leave it in a valid, re-analyzable
//! state. Each pass derives whatever CFG/schedule context it needs, fresh,
//! after its own structural edits where required.
//!
//! # Failure semantics
//!
//! A pass has no recoverable failure path for malformed input: a structural
//! error escalates to [`PassError`], which aborts the compilation of that
//! one unit. This channel is deliberately separate from ordinary negative
//! results (such as match failures in instruction selection), which are
//! plain values.

use crate::ir::graph::{Graph, GraphError};

pub mod deopt_group;
pub mod profiling;

pub use deopt_group::{DeoptGroupingPass, GroupingStats};
pub use profiling::{
    CounterDescriptor, CounterKind, CounterTable, ProfilingConfig, ProfilingPass, ProfilingStats,
};

// =============================================================================
// Pass Error
// =============================================================================

/// Fatal pass-level failure: the graph violated an invariant mid-rewrite.
///
/// Indicates a bug in the pass or a corrupt input graph, never a legitimate
/// compilation outcome.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PassError {
    /// A graph mutation primitive rejected the pass's edit.
    #[error("graph corrupted during {pass}: {source}")]
    GraphCorrupted {
        /// The pass that hit the violation.
        pass: &'static str,
        /// The underlying structural error.
        #[source]
        source: GraphError,
    },
}

impl PassError {
    pub(crate) fn corrupted(pass: &'static str, source: GraphError) -> Self {
        PassError::GraphCorrupted { pass, source }
    }
}

// =============================================================================
// Pass Trait
// =============================================================================

/// A graph-rewrite pass.
pub trait OptimizationPass {
    /// Pass name for diagnostics and telemetry.
    fn name(&self) -> &'static str;

    /// Run the pass. Returns whether the graph changed.
    fn run(&mut self, graph: &mut Graph) -> Result<bool, PassError>;
}
