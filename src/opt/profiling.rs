//! Profiling instrumentation.
//!
//! Inserts execution counters at function entry and at every sufficiently
//! probable loop header, with increments weighted by what one pass through
//! the counted region actually costs:
//!
//! 1. Compute a full schedule and a CFG with frequencies and loops.
//! 2. For each loop, weigh the loop's own blocks (nested loops get their
//!    own counters, so descendant blocks are excluded), normalize by the
//!    header's relative frequency, and clamp.
//! 3. Weigh the function entry region the same way, minus all top-level
//!    loops' blocks, and insert its counter past the initial linear
//!    prologue (inserting at the raw entry interacts badly with
//!    on-stack-replacement entry points).
//! 4. Optionally add invoke-free-section counters per region and one
//!    per-call-site counter per invoke.
//!
//! The weight table is a single reviewable match keyed on node kind.
//! Runs once per compilation; re-running double-instruments.

use log::debug;
use rustc_hash::FxHashSet;

use super::{OptimizationPass, PassError};
use crate::ir::cfg::{BlockId, Cfg, CfgOptions};
use crate::ir::graph::Graph;
use crate::ir::node::{InputList, NodeAux, NodeId};
use crate::ir::operators::{ArithOp, ControlOp, MemoryOp, Operator};
use crate::ir::schedule::Schedule;
use crate::telemetry::CounterRegistry;

// =============================================================================
// Configuration
// =============================================================================

/// Configuration for the profiling pass.
///
/// The numeric thresholds are policy, not semantics: they guard against
/// division blow-up and runaway increments, and are safe to tune.
#[derive(Debug, Clone)]
pub struct ProfilingConfig {
    /// Loops whose header frequency falls below this are not counted.
    pub min_loop_frequency: f64,
    /// Ceiling for a single counter increment.
    pub max_increment: u64,
    /// Also emit a counter per region that contains no invoke.
    pub invoke_free_sections: bool,
    /// Also emit one counter per invoke call site, labeled by callee.
    pub per_callsite_counters: bool,
}

impl Default for ProfilingConfig {
    fn default() -> Self {
        Self {
            min_loop_frequency: 1.0 / u32::MAX as f64,
            max_increment: 1 << 48,
            invoke_free_sections: false,
            per_callsite_counters: false,
        }
    }
}

impl ProfilingConfig {
    /// Everything on, for detailed profiling runs.
    pub fn detailed() -> Self {
        Self {
            invoke_free_sections: true,
            per_callsite_counters: true,
            ..Default::default()
        }
    }
}

// =============================================================================
// Counter Table
// =============================================================================

/// What a counter measures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CounterKind {
    /// Whole-function entry counter.
    FunctionEntry,
    /// One loop's header counter.
    LoopHeader,
    /// Region counter emitted only for invoke-free regions.
    InvokeFreeSection,
    /// Per-call-site invocation counter.
    CallSite,
}

/// Descriptor of one inserted counter.
#[derive(Debug, Clone)]
pub struct CounterDescriptor {
    /// Counter name, as exposed to telemetry.
    pub name: String,
    /// What the counter measures.
    pub kind: CounterKind,
    /// Weighted increment applied per firing.
    pub increment: u64,
}

/// Table of counters inserted by one pass invocation; `CounterInc` nodes
/// index into it.
#[derive(Debug, Clone, Default)]
pub struct CounterTable {
    descriptors: Vec<CounterDescriptor>,
}

impl CounterTable {
    fn add(&mut self, descriptor: CounterDescriptor) -> u32 {
        self.descriptors.push(descriptor);
        (self.descriptors.len() - 1) as u32
    }

    /// Descriptor for a counter id.
    pub fn get(&self, id: u32) -> Option<&CounterDescriptor> {
        self.descriptors.get(id as usize)
    }

    /// All descriptors, in insertion order.
    pub fn descriptors(&self) -> &[CounterDescriptor] {
        &self.descriptors
    }

    /// Number of counters.
    pub fn len(&self) -> usize {
        self.descriptors.len()
    }

    /// Check if no counters were inserted.
    pub fn is_empty(&self) -> bool {
        self.descriptors.is_empty()
    }
}

// =============================================================================
// Statistics
// =============================================================================

/// Counters reported by one pass invocation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProfilingStats {
    /// Counter nodes inserted.
    pub counters_inserted: usize,
    /// Loops that received a counter.
    pub loops_instrumented: usize,
    /// Loops skipped for negligible frequency.
    pub loops_skipped: usize,
    /// Invoke call sites counted.
    pub call_sites_counted: usize,
}

// =============================================================================
// Node Weights
// =============================================================================

/// Heuristic execution cost of a node, by kind.
///
/// Markers, constants, parameters, and SSA bookkeeping cost nothing; memory,
/// multiplication, calls, allocation, and division carry their approximate
/// relative latencies. Multi-successor and sink control nodes weigh their
/// successor count. Unlisted kinds default to 2.
fn node_weight(graph: &Graph, node: NodeId) -> u64 {
    let op = &graph.node(node).op;
    match op {
        // Bookkeeping, markers, constants, parameters: free.
        Operator::Control(ControlOp::Start)
        | Operator::Control(ControlOp::Begin)
        | Operator::Control(ControlOp::End)
        | Operator::Control(ControlOp::Merge)
        | Operator::Control(ControlOp::LoopBegin)
        | Operator::Control(ControlOp::LoopExit)
        | Operator::Phi
        | Operator::FrameState
        | Operator::ConstInt(_)
        | Operator::ConstFloat(_)
        | Operator::Parameter(_)
        | Operator::CounterInc(_) => 0,

        // Simple logic, compares, converts, branches, safepoints.
        Operator::IntCmp(_)
        | Operator::FloatCmp(_)
        | Operator::Bitwise(_)
        | Operator::Convert(_)
        | Operator::Guard(_)
        | Operator::Control(ControlOp::If)
        | Operator::Safepoint => 1,

        // Floating memory reads.
        Operator::Memory(MemoryOp::Load) => 2,

        // Multiplication.
        Operator::IntOp(ArithOp::Mul) | Operator::FloatOp(ArithOp::Mul) => 3,

        // Calls.
        Operator::Invoke => 5,

        // Allocation and division/remainder.
        Operator::Memory(MemoryOp::Alloc)
        | Operator::IntOp(ArithOp::Div)
        | Operator::IntOp(ArithOp::Rem)
        | Operator::FloatOp(ArithOp::Div)
        | Operator::FloatOp(ArithOp::Rem) => 10,

        // Multi-successor / sink control nodes: successor count.
        Operator::Control(ControlOp::Switch)
        | Operator::Control(ControlOp::Return)
        | Operator::Control(ControlOp::Unwind)
        | Operator::Deoptimize
        | Operator::DynamicDeoptimize => graph.control_successors(node).len() as u64,

        // Everything else.
        _ => 2,
    }
}

// =============================================================================
// Pass
// =============================================================================

/// One planned counter insertion: splice before `before` (or append after
/// the entry chain when the region has no following node).
struct PlannedCounter {
    descriptor: CounterDescriptor,
    anchor: Anchor,
}

enum Anchor {
    /// Splice immediately before this fixed node.
    Before(NodeId),
    /// Append after this node (end of a dangling chain).
    After(NodeId),
}

/// The profiling-instrumentation pass.
pub struct ProfilingPass {
    config: ProfilingConfig,
    table: CounterTable,
    stats: ProfilingStats,
    telemetry: Option<CounterRegistry>,
}

impl ProfilingPass {
    /// Create the pass with default configuration.
    pub fn new() -> Self {
        Self::with_config(ProfilingConfig::default())
    }

    /// Create the pass with a custom configuration.
    pub fn with_config(config: ProfilingConfig) -> Self {
        ProfilingPass {
            config,
            table: CounterTable::default(),
            stats: ProfilingStats::default(),
            telemetry: None,
        }
    }

    /// Attach a telemetry registry; inserted counters are pre-registered.
    pub fn with_telemetry(mut self, registry: CounterRegistry) -> Self {
        self.telemetry = Some(registry);
        self
    }

    /// The counter table from the last run.
    pub fn counter_table(&self) -> &CounterTable {
        &self.table
    }

    /// Statistics from the last run.
    pub fn stats(&self) -> ProfilingStats {
        self.stats
    }

    // =========================================================================
    // Region Weighing
    // =========================================================================

    /// Weighted cost of one pass through the region's blocks, normalized by
    /// the region header's own frequency and clamped.
    fn region_increment(
        &self,
        graph: &Graph,
        cfg: &Cfg,
        schedule: &Schedule,
        blocks: &[BlockId],
        header_frequency: f64,
    ) -> u64 {
        let mut weight = 0.0;
        for &block in blocks {
            let freq = cfg.relative_frequency(block);
            for &node in schedule.nodes_in(block) {
                weight += freq * node_weight(graph, node) as f64;
            }
        }
        // The counter fires once per header visit, not once per weighted
        // occurrence.
        let normalized = weight / header_frequency;
        normalized.max(0.0).min(self.config.max_increment as f64) as u64
    }

    /// Whether any block of the region schedules an invoke.
    fn region_has_invoke(&self, graph: &Graph, schedule: &Schedule, blocks: &[BlockId]) -> bool {
        blocks.iter().any(|&block| {
            schedule
                .nodes_in(block)
                .iter()
                .any(|&node| matches!(graph.node(node).op, Operator::Invoke))
        })
    }

    // =========================================================================
    // Insertion
    // =========================================================================

    /// Splice a counter node at the planned anchor.
    fn insert(&mut self, graph: &mut Graph, planned: PlannedCounter) -> Result<(), PassError> {
        if let Some(registry) = &self.telemetry {
            registry.counter(&planned.descriptor.name);
        }
        let increment = planned.descriptor.increment;
        let id = self.table.add(planned.descriptor);

        match planned.anchor {
            Anchor::Before(next) => {
                let counter = graph.add_node_with_aux(
                    Operator::CounterInc(id),
                    InputList::Empty,
                    NodeAux::Increment(increment),
                );
                graph
                    .replace_at_predecessor(next, counter)
                    .map_err(|e| PassError::corrupted("ProfilingInstrumentation", e))?;
                graph.replace_input(next, 0, counter);
            }
            Anchor::After(prev) => {
                graph.add_node_with_aux(
                    Operator::CounterInc(id),
                    InputList::Single(prev),
                    NodeAux::Increment(increment),
                );
            }
        }

        self.stats.counters_inserted += 1;
        Ok(())
    }
}

impl Default for ProfilingPass {
    fn default() -> Self {
        Self::new()
    }
}

impl OptimizationPass for ProfilingPass {
    fn name(&self) -> &'static str {
        "ProfilingInstrumentation"
    }

    fn run(&mut self, graph: &mut Graph) -> Result<bool, PassError> {
        self.stats = ProfilingStats::default();
        self.table = CounterTable::default();

        let cfg = Cfg::compute(graph, CfgOptions::full());
        let schedule = Schedule::compute(graph, &cfg);

        let mut planned: Vec<PlannedCounter> = Vec::new();

        // Loop regions: each loop's own blocks, nested loops excluded so
        // outer counts never double-count inner iterations.
        for (loop_idx, l) in cfg.loops().iter().enumerate() {
            let header_freq = cfg.relative_frequency(l.header);
            if header_freq <= self.config.min_loop_frequency {
                self.stats.loops_skipped += 1;
                continue;
            }

            let region = l.exclusive_blocks(cfg.loops());
            let increment = self.region_increment(graph, &cfg, &schedule, &region, header_freq);
            let header_node = cfg.block(l.header).start;
            let anchor = loop_counter_anchor(&cfg, l.header);

            planned.push(PlannedCounter {
                descriptor: CounterDescriptor {
                    name: format!(
                        "profile.loop.{}@{}",
                        loop_idx,
                        graph.node(header_node).bc_offset
                    ),
                    kind: CounterKind::LoopHeader,
                    increment,
                },
                anchor,
            });
            self.stats.loops_instrumented += 1;

            if self.config.invoke_free_sections
                && !self.region_has_invoke(graph, &schedule, &region)
            {
                planned.push(PlannedCounter {
                    descriptor: CounterDescriptor {
                        name: format!(
                            "profile.loop.{}@{}.invoke_free",
                            loop_idx,
                            graph.node(header_node).bc_offset
                        ),
                        kind: CounterKind::InvokeFreeSection,
                        increment,
                    },
                    anchor: loop_counter_anchor(&cfg, l.header),
                });
            }
        }

        // Entry region: the whole function minus every top-level loop.
        let mut excluded: FxHashSet<BlockId> = FxHashSet::default();
        for l in cfg.loops().iter().filter(|l| l.parent.is_none()) {
            excluded.extend(l.blocks.iter().copied());
        }
        let entry_region: Vec<BlockId> = cfg
            .iter()
            .map(|(id, _)| id)
            .filter(|id| !excluded.contains(id))
            .collect();
        let entry_increment = self.region_increment(graph, &cfg, &schedule, &entry_region, 1.0);

        planned.push(PlannedCounter {
            descriptor: CounterDescriptor {
                name: "profile.entry".to_string(),
                kind: CounterKind::FunctionEntry,
                increment: entry_increment,
            },
            anchor: entry_counter_anchor(graph, &cfg),
        });

        if self.config.invoke_free_sections
            && !self.region_has_invoke(graph, &schedule, &entry_region)
        {
            planned.push(PlannedCounter {
                descriptor: CounterDescriptor {
                    name: "profile.entry.invoke_free".to_string(),
                    kind: CounterKind::InvokeFreeSection,
                    increment: entry_increment,
                },
                anchor: entry_counter_anchor(graph, &cfg),
            });
        }

        // Per-call-site invoke counters.
        if self.config.per_callsite_counters {
            let invokes: Vec<NodeId> = graph
                .iter()
                .filter(|(_, node)| matches!(node.op, Operator::Invoke))
                .map(|(id, _)| id)
                .collect();
            for invoke in invokes {
                let callee = match &graph.node(invoke).aux {
                    NodeAux::Callee(name) => name.clone(),
                    _ => "<unknown>".to_string(),
                };
                planned.push(PlannedCounter {
                    descriptor: CounterDescriptor {
                        name: format!("profile.invoke.{}", callee),
                        kind: CounterKind::CallSite,
                        increment: 1,
                    },
                    anchor: Anchor::Before(invoke),
                });
                self.stats.call_sites_counted += 1;
            }
        }

        // All weights are computed against the pre-insertion CFG/schedule;
        // splicing happens only now.
        let changed = !planned.is_empty();
        for counter in planned {
            self.insert(graph, counter)?;
        }

        debug!(
            "inserted {} counters ({} loops, {} skipped)",
            self.stats.counters_inserted, self.stats.loops_instrumented, self.stats.loops_skipped
        );
        Ok(changed)
    }
}

/// Anchor for a loop-header counter: before the first fixed node after the
/// `LoopBegin`, or appended when the header has no following chain.
fn loop_counter_anchor(cfg: &Cfg, header: BlockId) -> Anchor {
    let block = cfg.block(header);
    match block.nodes.get(1) {
        Some(&next) => Anchor::Before(next),
        None => Anchor::After(block.start),
    }
}

/// Anchor for the entry counter: past the initial run of `Begin` markers.
fn entry_counter_anchor(graph: &Graph, cfg: &Cfg) -> Anchor {
    let entry = cfg.block(cfg.entry);
    for &node in &entry.nodes[1..] {
        if !matches!(graph.node(node).op, Operator::Control(ControlOp::Begin)) {
            return Anchor::Before(node);
        }
    }
    Anchor::After(*entry.nodes.last().expect("entry block is never empty"))
}

// =============================================================================
// Tests
// =============================================================================
