//! Node scheduling: assignment of every node to a basic block.
//!
//! Fixed nodes already live in the block whose control chain they occupy.
//! Floating nodes (constants, arithmetic, phis, frame states) are placed in
//! the block of their earliest fixed transitive user, emitted just before
//! that user in the block-local order. The result is the linear view the
//! profiling pass weighs and the match context consults for ordering and
//! side-effect queries.
//!
//! Like the CFG, a schedule is derived fresh and must not outlive a
//! structural edit to the graph.

use rustc_hash::FxHashMap;

use super::arena::SecondaryMap;
use super::cfg::{BlockId, Cfg};
use super::graph::Graph;
use super::node::{Node, NodeId};

// =============================================================================
// Schedule
// =============================================================================

/// A complete node-to-block assignment with block-local linear order.
#[derive(Debug, Clone)]
pub struct Schedule {
    /// Block assignment per node.
    node_block: SecondaryMap<Node, BlockId>,

    /// Linear order per block: block start first, floating nodes before
    /// their first fixed user, terminator last.
    block_order: Vec<Vec<NodeId>>,

    /// Position of each node within its block's order.
    position: FxHashMap<NodeId, u32>,
}

impl Schedule {
    /// Compute a schedule for the graph against a fresh CFG.
    pub fn compute(graph: &Graph, cfg: &Cfg) -> Self {
        let mut schedule = Schedule {
            node_block: SecondaryMap::with_capacity(graph.node_bound()),
            block_order: vec![Vec::new(); cfg.len()],
            position: FxHashMap::default(),
        };

        schedule.assign_blocks(graph, cfg);
        schedule.order_blocks(graph, cfg);
        schedule
    }

    // =========================================================================
    // Block Assignment
    // =========================================================================

    fn assign_blocks(&mut self, graph: &Graph, cfg: &Cfg) {
        // Fixed nodes keep their control-chain block.
        for (id, node) in graph.iter() {
            if node.is_fixed() {
                if let Some(block) = cfg.block_for(id) {
                    self.node_block.set(id, block);
                }
            }
        }

        // Phis belong to their merge's block.
        for (id, node) in graph.iter() {
            if node.is_phi() {
                if let Some(merge) = node.inputs.get(0) {
                    if let Some(block) = cfg.block_for(merge) {
                        self.node_block.set(id, block);
                    }
                }
            }
        }

        // Remaining floating nodes: the earliest (minimum RPO index) block
        // among their fixed transitive users; entry when unused.
        let rpo_index: FxHashMap<BlockId, usize> = cfg
            .rpo
            .iter()
            .enumerate()
            .map(|(i, &b)| (b, i))
            .collect();

        for (id, node) in graph.iter() {
            if node.is_fixed() || node.is_phi() {
                continue;
            }
            let block = self
                .earliest_user_block(graph, id, &rpo_index)
                .unwrap_or(cfg.entry);
            self.node_block.set(id, block);
        }
    }

    fn earliest_user_block(
        &self,
        graph: &Graph,
        id: NodeId,
        rpo_index: &FxHashMap<BlockId, usize>,
    ) -> Option<BlockId> {
        let mut best: Option<(usize, BlockId)> = None;
        let mut stack = vec![id];
        let mut seen = super::arena::BitSet::with_capacity(graph.node_bound());
        seen.insert(id.as_usize());

        while let Some(current) = stack.pop() {
            for user in graph.usages(current) {
                if seen.contains(user.as_usize()) {
                    continue;
                }
                seen.insert(user.as_usize());

                let user_node = graph.node(user);
                let assigned = if user_node.is_fixed() {
                    self.node_block.get(user).copied().filter(|b| b.is_valid())
                } else if user_node.is_phi() {
                    self.node_block.get(user).copied().filter(|b| b.is_valid())
                } else {
                    stack.push(user);
                    None
                };

                if let Some(block) = assigned {
                    let idx = rpo_index.get(&block).copied().unwrap_or(usize::MAX);
                    if best.map_or(true, |(best_idx, _)| idx < best_idx) {
                        best = Some((idx, block));
                    }
                }
            }
        }

        best.map(|(_, block)| block)
    }

    // =========================================================================
    // Block-Local Order
    // =========================================================================

    fn order_blocks(&mut self, graph: &Graph, cfg: &Cfg) {
        let mut emitted = super::arena::BitSet::with_capacity(graph.node_bound());

        for (block_id, block) in cfg.iter() {
            let mut order: Vec<NodeId> = Vec::new();

            // Block start, then the block's phis.
            order.push(block.start);
            emitted.insert(block.start.as_usize());
            for user in graph.usages(block.start) {
                if graph.node(user).is_phi() && !emitted.contains(user.as_usize()) {
                    emitted.insert(user.as_usize());
                    order.push(user);
                }
            }

            // Fixed chain, pulling in floating dependencies first.
            for &fixed in &block.nodes[1..] {
                self.emit_floating_deps(graph, block_id, fixed, &mut emitted, &mut order);
                if !emitted.contains(fixed.as_usize()) {
                    emitted.insert(fixed.as_usize());
                    order.push(fixed);
                }
            }

            self.block_order[block_id.as_usize()] = order;
        }

        // Floating nodes nothing pulled in (unused, or used only in other
        // blocks' chains through phis): append to their assigned block.
        for (id, node) in graph.iter() {
            if emitted.contains(id.as_usize()) {
                continue;
            }
            if node.is_fixed() {
                continue; // unreachable fixed nodes stay unscheduled
            }
            if let Some(&block) = self.node_block.get(id) {
                if block.is_valid() {
                    self.block_order[block.as_usize()].push(id);
                }
            }
        }

        for order in &self.block_order {
            for (pos, &node) in order.iter().enumerate() {
                self.position.insert(node, pos as u32);
            }
        }
    }

    fn emit_floating_deps(
        &self,
        graph: &Graph,
        block: BlockId,
        user: NodeId,
        emitted: &mut super::arena::BitSet,
        order: &mut Vec<NodeId>,
    ) {
        for input in graph.node(user).inputs.iter_valid() {
            if emitted.contains(input.as_usize()) {
                continue;
            }
            let node = graph.node(input);
            if node.is_fixed() || node.is_phi() {
                continue;
            }
            if self.node_block.get(input).copied() != Some(block) {
                continue;
            }
            emitted.insert(input.as_usize());
            self.emit_floating_deps(graph, block, input, emitted, order);
            order.push(input);
        }
    }

    // =========================================================================
    // Query API
    // =========================================================================

    /// Block assignment of a node.
    pub fn block_of(&self, node: NodeId) -> Option<BlockId> {
        self.node_block.get(node).copied().filter(|b| b.is_valid())
    }

    /// Scheduled nodes of a block, in emission order.
    pub fn nodes_in(&self, block: BlockId) -> &[NodeId] {
        self.block_order
            .get(block.as_usize())
            .map(|v| v.as_slice())
            .unwrap_or(&[])
    }

    /// Position of a node within its block's emission order.
    pub fn position(&self, node: NodeId) -> Option<u32> {
        self.position.get(&node).copied()
    }

    /// Iterate over all scheduled nodes of all blocks.
    pub fn iter(&self) -> impl Iterator<Item = (BlockId, NodeId)> + '_ {
        self.block_order.iter().enumerate().flat_map(|(i, nodes)| {
            nodes
                .iter()
                .map(move |&n| (BlockId::new(i as u32), n))
        })
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::cfg::CfgOptions;
    use crate::ir::test_graphs;

    #[test]
    fn test_every_node_assigned() {
        let (g, _) = test_graphs::counted_loop();
        let cfg = Cfg::compute(&g, CfgOptions::full());
        let schedule = Schedule::compute(&g, &cfg);

        for (id, _) in g.iter() {
            assert!(
                schedule.block_of(id).is_some(),
                "node {:?} not assigned to a block",
                id
            );
        }
    }

    #[test]
    fn test_phi_lands_in_merge_block() {
        let (g, d) = test_graphs::diamond(0.5);
        let cfg = Cfg::compute(&g, CfgOptions::default());
        let schedule = Schedule::compute(&g, &cfg);

        assert_eq!(schedule.block_of(d.phi), cfg.block_for(d.merge));

        // And it is scheduled right after the merge marker.
        let join = cfg.block_for(d.merge).unwrap();
        let order = schedule.nodes_in(join);
        assert_eq!(order[0], d.merge);
        assert_eq!(order[1], d.phi);
    }

    #[test]
    fn test_floating_dep_before_user() {
        let (g, l) = test_graphs::counted_loop();
        let cfg = Cfg::compute(&g, CfgOptions::full());
        let schedule = Schedule::compute(&g, &cfg);

        // The loop condition is floating; it must be emitted before the If
        // that consumes it, in the same block.
        let header = cfg.block_for(l.loop_begin).unwrap();
        let order = schedule.nodes_in(header);
        let iff_pos = order
            .iter()
            .position(|&n| {
                matches!(
                    g.node(n).op,
                    crate::ir::operators::Operator::Control(
                        crate::ir::operators::ControlOp::If
                    )
                )
            })
            .expect("if scheduled in header");

        for (pos, &n) in order.iter().enumerate() {
            for input in g.node(order[iff_pos]).inputs.iter_valid() {
                if input == n {
                    assert!(pos < iff_pos);
                }
            }
        }
    }

    #[test]
    fn test_positions_match_order() {
        let (g, _) = test_graphs::diamond(0.5);
        let cfg = Cfg::compute(&g, CfgOptions::default());
        let schedule = Schedule::compute(&g, &cfg);

        for (block, _) in cfg.iter() {
            for (pos, &node) in schedule.nodes_in(block).iter().enumerate() {
                assert_eq!(schedule.position(node), Some(pos as u32));
            }
        }
    }
}
