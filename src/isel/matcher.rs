//! Two-phase tree-pattern matching.
//!
//! Matching is shape-first, usage-second, because a wrong tree shape is by
//! far the most common rejection and must stay cheap:
//!
//! 1. **Shape** ([`Matcher::match_shape`]): node classes and single-user
//!    constraints, recursing through declared child positions. No shared
//!    state is touched, so a rejection costs nothing to back out of.
//! 2. **Usage/safety** ([`Matcher::match_usage`]): consumption bookkeeping
//!    against the scheduling block (claims, block membership, ordering,
//!    intervening side effects, barriers) plus capture binding. Nothing is
//!    committed until the whole rule matches.
//!
//! Failure is the common case and is a plain value, not an error: the
//! reason enum is `Copy`, so the hot failure path allocates nothing. In
//! verbose mode the matcher additionally retains the failing node and
//! offending template for printable diagnostics.

use rustc_hash::{FxHashMap, FxHashSet};

use super::pattern::{MatchPattern, MatchRule};
use crate::ir::cfg::BlockId;
use crate::ir::graph::Graph;
use crate::ir::node::{NodeFlags, NodeId};
use crate::ir::operators::BarrierKind;
use crate::ir::schedule::Schedule;
use crate::telemetry::CounterRegistry;

// =============================================================================
// Match Failure
// =============================================================================

/// Why a match attempt was rejected. An ordinary negative result, not an
/// error: the selector just tries the next rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MatchFail {
    /// The actual node's class differs from the template's.
    WrongClass,
    /// A repeated capture name resolved to two different nodes.
    NamedValueMismatch,
    /// A single-user sub-pattern hit a node with multiple value consumers.
    TooManyUsers,
    /// The consumed node lies outside the current scheduling block.
    NotInBlock,
    /// Consuming would reorder the node past an intervening side effect.
    NotSafe,
    /// The node is already claimed by a different match.
    AlreadyUsed,
    /// The node is scheduled after the consuming instruction.
    TooLate,
    /// The node carries a memory barrier and is never foldable.
    Barrier,
}

impl MatchFail {
    /// Telemetry counter name for this reason.
    pub fn counter_name(self) -> &'static str {
        match self {
            MatchFail::WrongClass => "isel.fail.wrong_class",
            MatchFail::NamedValueMismatch => "isel.fail.named_value_mismatch",
            MatchFail::TooManyUsers => "isel.fail.too_many_users",
            MatchFail::NotInBlock => "isel.fail.not_in_block",
            MatchFail::NotSafe => "isel.fail.not_safe",
            MatchFail::AlreadyUsed => "isel.fail.already_used",
            MatchFail::TooLate => "isel.fail.too_late",
            MatchFail::Barrier => "isel.fail.barrier",
        }
    }
}

/// Result of a match attempt.
pub type MatchResult = Result<MatchBindings, MatchFail>;

/// Detail retained for the last failure in verbose mode.
#[derive(Debug, Clone)]
pub struct MatchFailureDetail {
    /// The node the template was rejected against.
    pub node: NodeId,
    /// Rendered template.
    pub pattern: String,
    /// The rejection reason.
    pub reason: MatchFail,
}

// =============================================================================
// Bindings
// =============================================================================

/// Capture bindings of a successful match.
#[derive(Debug, Clone, Default)]
pub struct MatchBindings {
    map: FxHashMap<&'static str, NodeId>,
}

impl MatchBindings {
    /// Node bound to a capture name.
    pub fn get(&self, name: &str) -> Option<NodeId> {
        self.map.get(name).copied()
    }

    /// Number of bound names.
    pub fn len(&self) -> usize {
        self.map.len()
    }

    /// Check if no names are bound.
    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

// =============================================================================
// Selector State
// =============================================================================

/// Selector-wide claims: nodes consumed by committed matches.
#[derive(Debug, Default)]
pub struct SelectorState {
    consumed: FxHashSet<NodeId>,
}

impl SelectorState {
    /// Create an empty state.
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether a node is claimed by a committed match.
    pub fn is_consumed(&self, node: NodeId) -> bool {
        self.consumed.contains(&node)
    }
}

// =============================================================================
// Match Context
// =============================================================================

/// Per-attempt state: the scheduling block view, this attempt's pending
/// consumptions, and the capture map. Discarded wholesale on failure.
pub struct MatchContext<'a> {
    graph: &'a Graph,
    schedule: &'a Schedule,
    block: BlockId,
    root_position: u32,
    pending: Vec<NodeId>,
    bindings: MatchBindings,
}

impl<'a> MatchContext<'a> {
    /// Create a context for a match rooted at `root`.
    pub fn new(
        graph: &'a Graph,
        schedule: &'a Schedule,
        root: NodeId,
    ) -> Option<MatchContext<'a>> {
        let block = schedule.block_of(root)?;
        let root_position = schedule.position(root)?;
        Some(MatchContext {
            graph,
            schedule,
            block,
            root_position,
            pending: Vec::new(),
            bindings: MatchBindings::default(),
        })
    }

    /// Request consumption of `node` into the compound instruction.
    pub fn consume(
        &mut self,
        state: &SelectorState,
        node: NodeId,
        ignores_side_effects: bool,
    ) -> Result<(), MatchFail> {
        // Barriers are never foldable, unconditionally.
        if self.graph.node(node).aux.barrier() != BarrierKind::None {
            return Err(MatchFail::Barrier);
        }

        if state.is_consumed(node)
            || self.graph.node(node).flags.contains(NodeFlags::FOLDED)
            || self.pending.contains(&node)
        {
            return Err(MatchFail::AlreadyUsed);
        }

        if self.schedule.block_of(node) != Some(self.block) {
            return Err(MatchFail::NotInBlock);
        }

        let position = self
            .schedule
            .position(node)
            .ok_or(MatchFail::NotInBlock)?;
        if position > self.root_position {
            return Err(MatchFail::TooLate);
        }

        // Folding moves the node's effective execution point to the root;
        // anything with a side effect in between forbids that.
        if !ignores_side_effects {
            let order = self.schedule.nodes_in(self.block);
            for &between in &order[(position + 1) as usize..self.root_position as usize] {
                if self.graph.node(between).op.has_side_effect() {
                    return Err(MatchFail::NotSafe);
                }
            }
        }

        self.pending.push(node);
        Ok(())
    }

    /// Bind a capture name to a node. The same logical name must resolve
    /// identically everywhere it recurs within one rule.
    pub fn bind(&mut self, name: &'static str, node: NodeId) -> Result<(), MatchFail> {
        match self.bindings.map.get(name) {
            Some(&bound) if bound != node => Err(MatchFail::NamedValueMismatch),
            _ => {
                self.bindings.map.insert(name, node);
                Ok(())
            }
        }
    }

    /// Final global validation after the whole rule matched.
    pub fn validate(&self, state: &SelectorState) -> Result<(), MatchFail> {
        for &node in &self.pending {
            if state.is_consumed(node) {
                return Err(MatchFail::AlreadyUsed);
            }
        }
        Ok(())
    }

    /// Nodes this attempt wants to fold.
    pub fn pending(&self) -> &[NodeId] {
        &self.pending
    }
}

// =============================================================================
// Matcher
// =============================================================================

/// The pattern matcher, with per-reason diagnostic counters.
pub struct Matcher {
    telemetry: Option<CounterRegistry>,
    verbose: bool,
    last_failure: Option<MatchFailureDetail>,
}

impl Matcher {
    /// Create a matcher.
    pub fn new() -> Self {
        Matcher {
            telemetry: None,
            verbose: false,
            last_failure: None,
        }
    }

    /// Attach a telemetry registry for per-reason failure counters.
    pub fn with_telemetry(mut self, registry: CounterRegistry) -> Self {
        self.telemetry = Some(registry);
        self
    }

    /// Retain failing node/template detail for printable diagnostics.
    pub fn verbose(mut self) -> Self {
        self.verbose = true;
        self
    }

    /// Detail of the last failure (verbose mode only).
    pub fn last_failure(&self) -> Option<&MatchFailureDetail> {
        self.last_failure.as_ref()
    }

    /// Attempt to match `pattern` against the DAG rooted at `root`.
    ///
    /// On success the match is committed: consumed nodes are claimed in
    /// `state` and flagged on the graph. On failure nothing is committed.
    pub fn try_match(
        &mut self,
        graph: &mut Graph,
        schedule: &Schedule,
        state: &mut SelectorState,
        pattern: &MatchPattern,
        root: NodeId,
    ) -> MatchResult {
        // Phase 1: shape. A strict precondition for the usage phase.
        if let Err(reason) = self.match_shape(graph, pattern, root, true) {
            return Err(self.reject(pattern, root, reason));
        }

        // Phase 2: usage/safety and captures.
        let mut ctx = match MatchContext::new(graph, schedule, root) {
            Some(ctx) => ctx,
            None => return Err(self.reject(pattern, root, MatchFail::NotInBlock)),
        };
        if let Err(reason) = self.match_usage(graph, &mut ctx, state, pattern, root, true) {
            return Err(self.reject(pattern, root, reason));
        }
        if let Err(reason) = ctx.validate(state) {
            return Err(self.reject(pattern, root, reason));
        }

        // Commit: claim consumptions selector-wide and on the graph.
        let MatchContext {
            pending, bindings, ..
        } = ctx;
        for node in pending {
            state.consumed.insert(node);
            graph.node_mut(node).flags.insert(NodeFlags::FOLDED);
        }
        Ok(bindings)
    }

    /// Shape phase: classes, arity, single-user constraints.
    fn match_shape(
        &self,
        graph: &Graph,
        pattern: &MatchPattern,
        node: NodeId,
        at_root: bool,
    ) -> Result<(), MatchFail> {
        let actual = graph.node(node);

        if let Some(class) = &pattern.op {
            if !class.matches(&actual.op) {
                return Err(MatchFail::WrongClass);
            }
        }

        // Duplicating a constant is free, so fan-out never disqualifies it.
        if pattern.single_user && !at_root && !actual.is_constant() {
            if !graph.is_single_value_user(node) {
                return Err(MatchFail::TooManyUsers);
            }
        }

        for (position, child) in &pattern.children {
            let input = actual
                .inputs
                .get(*position)
                .filter(|id| id.is_valid())
                .ok_or(MatchFail::WrongClass)?;
            self.match_shape(graph, child, input, false)?;
        }

        Ok(())
    }

    /// Usage phase: consumption, captures, recursion.
    fn match_usage(
        &self,
        graph: &Graph,
        ctx: &mut MatchContext<'_>,
        state: &SelectorState,
        pattern: &MatchPattern,
        node: NodeId,
        at_root: bool,
    ) -> Result<(), MatchFail> {
        if pattern.consumable && !at_root {
            ctx.consume(state, node, pattern.ignores_side_effects)?;
        }

        if let Some(name) = pattern.capture {
            ctx.bind(name, node)?;
        }

        for (position, child) in &pattern.children {
            let input = graph
                .node(node)
                .inputs
                .get(*position)
                .expect("shape phase verified child positions");
            self.match_usage(graph, ctx, state, child, input, false)?;
        }

        Ok(())
    }

    /// Record a failure: bump the per-reason counter and, in verbose mode,
    /// retain the offending node and template. The reason itself is a
    /// `Copy` value, so the non-verbose path allocates nothing.
    fn reject(&mut self, pattern: &MatchPattern, node: NodeId, reason: MatchFail) -> MatchFail {
        if let Some(registry) = &self.telemetry {
            registry.inc(reason.counter_name());
        }
        if self.verbose {
            self.last_failure = Some(MatchFailureDetail {
                node,
                pattern: pattern.to_string(),
                reason,
            });
        }
        reason
    }

    /// Run a rule table over one block, late to early, committing the first
    /// rule that matches at each root.
    pub fn match_block(
        &mut self,
        graph: &mut Graph,
        schedule: &Schedule,
        state: &mut SelectorState,
        block: BlockId,
        rules: &[MatchRule],
    ) -> Vec<(NodeId, &'static str, MatchBindings)> {
        let order: Vec<NodeId> = schedule.nodes_in(block).to_vec();
        let mut selected = Vec::new();

        for &root in order.iter().rev() {
            if graph.node(root).flags.contains(NodeFlags::FOLDED) {
                continue;
            }
            for rule in rules {
                match self.try_match(graph, schedule, state, &rule.pattern, root) {
                    Ok(bindings) => {
                        selected.push((root, rule.name, bindings));
                        break;
                    }
                    Err(_) => continue,
                }
            }
        }

        selected
    }
}

impl Default for Matcher {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// Tests
// =============================================================================
