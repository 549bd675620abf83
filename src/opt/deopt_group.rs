//! Deoptimization grouping.
//!
//! Several bailout points frequently share one frame state: every guard
//! lowered from the same bytecode location deoptimizes to the same resume
//! point, differing only in action/reason and speculation. This pass merges
//! all `Deoptimize` nodes sharing a frame state behind one control-flow
//! join, with per-origin selector values carried by phis:
//!
//! ```text
//!   pred1──Deopt(a1,s1,F)        pred1──End1──┐
//!   pred2──Deopt(a2,s2,F)   ═▶   pred2──End2──Merge──DynamicDeopt(φa,φs,F)
//!   pred3──Deopt(a3,s3,F)        pred3──End3──┘
//! ```
//!
//! Moving a deopt's effective exit out of its loops must still announce
//! every loop boundary crossed, so the rewired path gets one `LoopExit`
//! marker per enclosing loop, innermost first.
//!
//! The CFG (with its loop forest) is computed lazily, once per pass
//! invocation; the slightly stale loop info after this pass's own edits is
//! an accepted trade-off, since grouping never changes which loops enclose
//! a *remaining* deopt.

use log::debug;
use smallvec::SmallVec;

use super::{OptimizationPass, PassError};
use crate::ir::cfg::{Cfg, CfgOptions};
use crate::ir::graph::Graph;
use crate::ir::node::{InputList, NodeId};
use crate::ir::operators::{ControlOp, Operator};
use crate::telemetry::CounterRegistry;

/// Input positions on `Deoptimize`/`DynamicDeoptimize` nodes.
const DEOPT_ACTION_REASON_INPUT: usize = 1;
const DEOPT_SPECULATION_INPUT: usize = 2;

// =============================================================================
// Statistics
// =============================================================================

/// Counters reported by one pass invocation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GroupingStats {
    /// Frame states inspected.
    pub frame_states_seen: usize,
    /// Frame states that had ≥2 deopt usages and were grouped.
    pub groups_formed: usize,
    /// Original deoptimize nodes folded into dynamic deopts.
    pub deopts_merged: usize,
    /// Loop-exit markers inserted on rewired paths.
    pub loop_exits_inserted: usize,
}

// =============================================================================
// Pass
// =============================================================================

/// The deoptimization-grouping pass.
pub struct DeoptGroupingPass {
    stats: GroupingStats,
    telemetry: Option<CounterRegistry>,
}

impl DeoptGroupingPass {
    /// Create the pass.
    pub fn new() -> Self {
        DeoptGroupingPass {
            stats: GroupingStats::default(),
            telemetry: None,
        }
    }

    /// Create the pass with a telemetry registry.
    pub fn with_telemetry(registry: CounterRegistry) -> Self {
        DeoptGroupingPass {
            stats: GroupingStats::default(),
            telemetry: Some(registry),
        }
    }

    /// Statistics from the last run.
    pub fn stats(&self) -> GroupingStats {
        self.stats
    }

    /// Group one frame state's deopts. `cfg` is the lazily computed CFG
    /// shared by the whole invocation.
    fn group(
        &mut self,
        graph: &mut Graph,
        frame_state: NodeId,
        deopts: &[NodeId],
        cfg: &Cfg,
    ) -> Result<(), PassError> {
        let merge = graph.merge(&[]);

        let mut action_phi = NodeId::INVALID;
        let mut speculation_phi = NodeId::INVALID;

        for (i, &deopt) in deopts.iter().enumerate() {
            let action = graph
                .node(deopt)
                .inputs
                .get(DEOPT_ACTION_REASON_INPUT)
                .expect("deoptimize node carries an action-and-reason input");
            let speculation = graph
                .node(deopt)
                .inputs
                .get(DEOPT_SPECULATION_INPUT)
                .expect("deoptimize node carries a speculation input");

            // The deopt's block, per the (possibly stale) CFG. The deopt
            // itself has not been moved yet, so its block is current.
            let block = cfg.block_for(deopt);

            // Redirect the deopt's predecessor into a fresh forward end.
            let end = graph.add_node_no_dedup(Operator::Control(ControlOp::End), InputList::Empty);
            graph
                .replace_at_predecessor(deopt, end)
                .map_err(|e| PassError::corrupted(self.name(), e))?;

            // Announce every loop boundary the rewired path now crosses:
            // one exit per enclosing loop, innermost first, each inserted
            // immediately before the end.
            if let Some(block) = block {
                let enclosing: SmallVec<[usize; 4]> =
                    cfg.enclosing_loops(block).into_iter().collect();
                for loop_idx in enclosing {
                    let loop_begin = cfg.block(cfg.loops()[loop_idx].header).start;
                    let exit = graph.add_node_no_dedup(
                        Operator::Control(ControlOp::LoopExit),
                        InputList::Empty,
                    );
                    graph
                        .replace_at_predecessor(end, exit)
                        .map_err(|e| PassError::corrupted(self.name(), e))?;
                    graph.replace_input(end, 0, exit);
                    graph.add_input(exit, loop_begin);
                    self.stats.loop_exits_inserted += 1;
                }
            }

            graph.add_input(merge, end);

            if i == 0 {
                action_phi = graph.add_node_no_dedup(Operator::Phi, InputList::Pair(merge, action));
                speculation_phi =
                    graph.add_node_no_dedup(Operator::Phi, InputList::Pair(merge, speculation));
            } else {
                graph.add_input(action_phi, action);
                graph.add_input(speculation_phi, speculation);
            }
        }

        // One dynamic deopt consumes the selector phis and the shared state.
        let dynamic = graph.add_node_no_dedup(
            Operator::DynamicDeoptimize,
            InputList::from_slice(&[merge, action_phi, speculation_phi, frame_state]),
        );

        // The originals are sinks; anything still using one means the graph
        // is corrupt, which safe_delete surfaces as a fatal error.
        for &deopt in deopts {
            graph
                .safe_delete(deopt)
                .map_err(|e| PassError::corrupted(self.name(), e))?;
        }

        debug!(
            "grouped {} deopts of frame state {:?} into {:?}",
            deopts.len(),
            frame_state,
            dynamic
        );
        self.stats.groups_formed += 1;
        self.stats.deopts_merged += deopts.len();
        Ok(())
    }
}

impl Default for DeoptGroupingPass {
    fn default() -> Self {
        Self::new()
    }
}

impl OptimizationPass for DeoptGroupingPass {
    fn name(&self) -> &'static str {
        "DeoptGrouping"
    }

    fn run(&mut self, graph: &mut Graph) -> Result<bool, PassError> {
        self.stats = GroupingStats::default();

        let frame_states: Vec<NodeId> = graph
            .iter()
            .filter(|(_, node)| matches!(node.op, Operator::FrameState))
            .map(|(id, _)| id)
            .collect();

        let mut cfg: Option<Cfg> = None;
        let mut changed = false;

        for frame_state in frame_states {
            self.stats.frame_states_seen += 1;

            let deopts: Vec<NodeId> = graph
                .usages(frame_state)
                .filter(|&user| matches!(graph.node(user).op, Operator::Deoptimize))
                .collect();

            // Nothing to group for zero or one bailout point.
            if deopts.len() < 2 {
                continue;
            }

            // One CFG per invocation, computed on first demand.
            let cfg = cfg.get_or_insert_with(|| {
                Cfg::compute(
                    graph,
                    CfgOptions {
                        frequencies: false,
                        loops: true,
                    },
                )
            });

            self.group(graph, frame_state, &deopts, cfg)?;
            changed = true;
        }

        if let Some(registry) = &self.telemetry {
            registry
                .counter("deopt_group.groups_formed")
                .add(self.stats.groups_formed as u64);
            registry
                .counter("deopt_group.deopts_merged")
                .add(self.stats.deopts_merged as u64);
            registry
                .counter("deopt_group.loop_exits_inserted")
                .add(self.stats.loop_exits_inserted as u64);
        }

        Ok(changed)
    }
}

// =============================================================================
// Tests
// =============================================================================
