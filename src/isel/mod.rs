//! Instruction selection: tree-pattern matching over scheduled blocks.
//!
//! The matcher consumes the graph and a schedule; a lowering stage (out of
//! scope here) consumes the match results and capture bindings to emit
//! target instructions.

pub mod matcher;
pub mod pattern;

pub use matcher::{
    MatchBindings, MatchContext, MatchFail, MatchFailureDetail, MatchResult, Matcher,
    SelectorState,
};
pub use pattern::{MatchPattern, MatchRule, OpClass};
