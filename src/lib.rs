//! JIT compiler core: IR graph, rewrite passes, and instruction selection.
//!
//! This crate owns the method-compiler's middle end:
//! - Sea-of-Nodes style IR graph with a reverse usage index
//! - Control-flow/loop analysis derived on demand
//! - Graph-rewrite passes (deoptimization grouping, profiling
//!   instrumentation)
//! - A tree-pattern matcher for instruction selection
//!
//! A graph is owned by exactly one compilation at a time; everything here is
//! synchronous, single-threaded graph traversal and in-place mutation.
//! Immutable rule tables and the telemetry counter registry are the only
//! state shared across concurrent compilations.
#![deny(unsafe_op_in_unsafe_fn)]

pub mod ir;
pub mod isel;
pub mod opt;
pub mod telemetry;
