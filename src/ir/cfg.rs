//! Control-flow graph analysis over the IR.
//!
//! Basic blocks, dominance, relative execution frequencies, and the loop
//! forest are all *derived* structures: [`Cfg::compute`] builds them fresh
//! from the graph on demand, and a `Cfg` computed before a structural edit
//! must not be consulted after it. Passes re-derive instead of invalidating,
//! so staleness is impossible by construction rather than by convention.
//!
//! # Structure
//!
//! A block starts at a `Start`, `Begin`, `Merge`, or `LoopBegin` node and
//! extends along the fixed control chain until a split, a sink, a forward
//! `End`, or the next block start.

use rustc_hash::FxHashMap;

use super::arena::{BitSet, Id, SecondaryMap};
use super::graph::Graph;
use super::node::{NodeAux, NodeId};
use super::operators::{ControlOp, Operator};

/// Default trip-count estimate for loops without profile data.
const DEFAULT_LOOP_FREQUENCY: f64 = 10.0;

// =============================================================================
// Basic Block
// =============================================================================

/// A basic block: a maximal single-entry run of fixed nodes.
#[derive(Debug, Clone)]
pub struct BasicBlock {
    /// The block-start node (`Start`, `Begin`, `Merge`, or `LoopBegin`).
    pub start: NodeId,

    /// Fixed nodes in control order, starting with `start`.
    pub nodes: Vec<NodeId>,

    /// Predecessor blocks.
    pub predecessors: Vec<BlockId>,

    /// Successor blocks.
    pub successors: Vec<BlockId>,

    /// Execution frequency relative to function entry (1.0 = entry).
    pub frequency: f64,
}

impl BasicBlock {
    fn new(start: NodeId) -> Self {
        BasicBlock {
            start,
            nodes: vec![start],
            predecessors: Vec::new(),
            successors: Vec::new(),
            frequency: 1.0,
        }
    }

    /// The last fixed node of the block.
    pub fn terminator(&self) -> NodeId {
        *self.nodes.last().expect("block has at least its start node")
    }
}

/// Block identifier.
pub type BlockId = Id<BasicBlock>;

// =============================================================================
// Options
// =============================================================================

/// What to derive beyond the bare block structure.
#[derive(Debug, Clone, Copy, Default)]
pub struct CfgOptions {
    /// Compute per-block relative execution frequencies.
    pub frequencies: bool,
    /// Compute the loop forest.
    pub loops: bool,
}

impl CfgOptions {
    /// Blocks, dominators, frequencies, and loops.
    pub fn full() -> Self {
        CfgOptions {
            frequencies: true,
            loops: true,
        }
    }
}

// =============================================================================
// CFG
// =============================================================================

/// Control-flow graph derived from the IR.
#[derive(Debug, Clone)]
pub struct Cfg {
    blocks: Vec<BasicBlock>,

    /// Block assignment for every fixed node.
    node_block: SecondaryMap<super::node::Node, BlockId>,

    /// Entry block (contains `Start`).
    pub entry: BlockId,

    /// Reverse postorder traversal.
    pub rpo: Vec<BlockId>,

    /// Postorder numbers (for dominance intersection).
    postorder: SecondaryMap<BasicBlock, u32>,

    /// Immediate dominators.
    idom: SecondaryMap<BasicBlock, BlockId>,

    /// Loop forest (empty unless requested).
    loops: Vec<Loop>,

    /// Innermost enclosing loop per block.
    block_loop: FxHashMap<BlockId, usize>,
}

impl Cfg {
    /// Derive a fresh CFG from the graph.
    pub fn compute(graph: &Graph, options: CfgOptions) -> Self {
        let mut cfg = Cfg {
            blocks: Vec::new(),
            node_block: SecondaryMap::with_capacity(graph.node_bound()),
            entry: BlockId::INVALID,
            rpo: Vec::new(),
            postorder: SecondaryMap::new(),
            idom: SecondaryMap::new(),
            loops: Vec::new(),
            block_loop: FxHashMap::default(),
        };

        cfg.build_blocks(graph);
        cfg.compute_rpo();
        cfg.compute_dominators();

        if options.loops || options.frequencies {
            cfg.compute_loops(graph);
        }
        if options.frequencies {
            cfg.compute_frequencies(graph);
        }

        cfg
    }

    // =========================================================================
    // Block Construction
    // =========================================================================

    fn build_blocks(&mut self, graph: &Graph) {
        // Allocate one block per block-start node.
        let mut start_block: FxHashMap<NodeId, BlockId> = FxHashMap::default();
        for (id, node) in graph.iter() {
            if node.op.is_block_start() {
                let block_id = BlockId::new(self.blocks.len() as u32);
                self.blocks.push(BasicBlock::new(id));
                start_block.insert(id, block_id);
                if matches!(node.op, Operator::Control(ControlOp::Start)) {
                    self.entry = block_id;
                }
            }
        }

        // Walk each block's fixed chain and record edges.
        let mut edges: Vec<(BlockId, BlockId)> = Vec::new();
        for block_idx in 0..self.blocks.len() {
            let block_id = BlockId::new(block_idx as u32);
            let mut cursor = self.blocks[block_idx].start;
            self.node_block.set(cursor, block_id);

            loop {
                let node = graph.node(cursor);

                // Splits: every control successor starts a new block.
                if matches!(
                    node.op,
                    Operator::Control(ControlOp::If) | Operator::Control(ControlOp::Switch)
                ) {
                    for succ in graph.control_successors(cursor) {
                        if let Some(&succ_block) = start_block.get(&succ) {
                            edges.push((block_id, succ_block));
                        }
                    }
                    break;
                }

                // Sinks end the block with no successors.
                if node.op.is_control_sink() {
                    break;
                }

                let succs = graph.control_successors(cursor);
                let Some(&next) = succs.first() else {
                    break; // dangling chain (under construction)
                };

                if let Some(&succ_block) = start_block.get(&next) {
                    // Forward edge into the next block (End -> Merge,
                    // Begin after a linear chain, loop back edges).
                    edges.push((block_id, succ_block));
                    break;
                }

                // Linear fixed node: stays in this block.
                self.blocks[block_idx].nodes.push(next);
                self.node_block.set(next, block_id);
                cursor = next;
            }
        }

        for (from, to) in edges {
            if !self.blocks[from.as_usize()].successors.contains(&to) {
                self.blocks[from.as_usize()].successors.push(to);
            }
            if !self.blocks[to.as_usize()].predecessors.contains(&from) {
                self.blocks[to.as_usize()].predecessors.push(from);
            }
        }
    }

    fn compute_rpo(&mut self) {
        if !self.entry.is_valid() {
            return;
        }

        let mut visited = BitSet::with_capacity(self.blocks.len());
        let mut postorder = Vec::with_capacity(self.blocks.len());
        self.dfs_postorder(self.entry, &mut visited, &mut postorder);

        for (i, &block) in postorder.iter().enumerate() {
            self.postorder.set(block, i as u32);
        }
        postorder.reverse();
        self.rpo = postorder;
    }

    fn dfs_postorder(&self, block: BlockId, visited: &mut BitSet, out: &mut Vec<BlockId>) {
        if visited.contains(block.as_usize()) {
            return;
        }
        visited.insert(block.as_usize());
        for &succ in &self.blocks[block.as_usize()].successors {
            self.dfs_postorder(succ, visited, out);
        }
        out.push(block);
    }

    // =========================================================================
    // Dominators (Cooper-Harvey-Kennedy)
    // =========================================================================

    fn compute_dominators(&mut self) {
        let n = self.blocks.len();
        if n == 0 || !self.entry.is_valid() {
            return;
        }

        for i in 0..n {
            self.idom.set(BlockId::new(i as u32), BlockId::INVALID);
        }
        self.idom.set(self.entry, self.entry);

        let mut changed = true;
        while changed {
            changed = false;
            let rpo = self.rpo.clone();

            for &block in &rpo {
                if block == self.entry {
                    continue;
                }

                let preds = self.blocks[block.as_usize()].predecessors.clone();
                let mut new_idom = BlockId::INVALID;
                for &pred in &preds {
                    if self.idom[pred].is_valid() {
                        new_idom = pred;
                        break;
                    }
                }
                if !new_idom.is_valid() {
                    continue;
                }

                for &pred in &preds {
                    if pred != new_idom && self.idom[pred].is_valid() {
                        new_idom = self.intersect(pred, new_idom);
                    }
                }

                if self.idom[block] != new_idom {
                    self.idom.set(block, new_idom);
                    changed = true;
                }
            }
        }
    }

    fn intersect(&self, mut b1: BlockId, mut b2: BlockId) -> BlockId {
        while b1 != b2 {
            let po1 = self.postorder.get(b1).copied().unwrap_or(0);
            let po2 = self.postorder.get(b2).copied().unwrap_or(0);
            if po1 < po2 {
                b1 = self.idom[b1];
                if !b1.is_valid() {
                    return b2;
                }
            } else {
                b2 = self.idom[b2];
                if !b2.is_valid() {
                    return b1;
                }
            }
        }
        b1
    }

    /// Check if `a` dominates `b`.
    pub fn dominates(&self, a: BlockId, b: BlockId) -> bool {
        if a == b {
            return true;
        }
        let mut current = b;
        loop {
            let idom = self.idom.get(current).copied().unwrap_or(BlockId::INVALID);
            if !idom.is_valid() || idom == current {
                return false;
            }
            if idom == a {
                return true;
            }
            current = idom;
        }
    }

    // =========================================================================
    // Loop Forest
    // =========================================================================

    fn compute_loops(&mut self, graph: &Graph) {
        // Back edges: block -> succ where succ dominates block.
        let mut header_loop: FxHashMap<BlockId, usize> = FxHashMap::default();
        for block_idx in 0..self.blocks.len() {
            let block = BlockId::new(block_idx as u32);
            for &succ in &self.blocks[block_idx].successors.clone() {
                if self.dominates(succ, block) {
                    let loop_idx = *header_loop.entry(succ).or_insert_with(|| {
                        self.loops.push(Loop::new(succ));
                        self.loops.len() - 1
                    });
                    if !self.loops[loop_idx].back_edges.contains(&block) {
                        self.loops[loop_idx].back_edges.push(block);
                    }
                }
            }
        }

        // Bodies: forward traversal from the header, bounded by dominance
        // and by this loop's exit markers. Every path leaving the loop is
        // announced by a `LoopExit` associated with the header's
        // `LoopBegin`; blocks carrying one are outside, and deopt branches
        // (which never reach a back edge) are inside.
        for loop_idx in 0..self.loops.len() {
            let header = self.loops[loop_idx].header;
            let loop_begin = self.blocks[header.as_usize()].start;

            let mut body = BitSet::with_capacity(self.blocks.len());
            body.insert(header.as_usize());
            let mut worklist = vec![header];

            while let Some(block) = worklist.pop() {
                for &succ in &self.blocks[block.as_usize()].successors {
                    if body.contains(succ.as_usize())
                        || !self.dominates(header, succ)
                        || self.has_loop_exit_of(graph, succ, loop_begin)
                    {
                        continue;
                    }
                    body.insert(succ.as_usize());
                    worklist.push(succ);
                }
            }

            self.loops[loop_idx].blocks = body.iter().map(|i| BlockId::new(i as u32)).collect();
        }

        // Nesting: parent = smallest strictly-enclosing body.
        let n = self.loops.len();
        for i in 0..n {
            let header = self.loops[i].header;
            let mut best: Option<usize> = None;
            let mut best_size = usize::MAX;
            for j in 0..n {
                if i != j
                    && self.loops[j].blocks.contains(&header)
                    && self.loops[j].blocks.len() < best_size
                {
                    best = Some(j);
                    best_size = self.loops[j].blocks.len();
                }
            }
            if let Some(parent) = best {
                self.loops[i].parent = Some(parent);
            }
        }
        for i in 0..n {
            if let Some(parent) = self.loops[i].parent {
                self.loops[parent].children.push(i);
            }
            self.loops[i].depth = {
                let mut depth = 1;
                let mut cur = self.loops[i].parent;
                while let Some(p) = cur {
                    depth += 1;
                    cur = self.loops[p].parent;
                }
                depth
            };
        }

        // Innermost loop per block: the smallest body containing it.
        for (i, l) in self.loops.iter().enumerate() {
            for &block in &l.blocks {
                match self.block_loop.get(&block) {
                    Some(&existing) if self.loops[existing].blocks.len() <= l.blocks.len() => {}
                    _ => {
                        self.block_loop.insert(block, i);
                    }
                }
            }
        }
    }

    /// Whether a block's fixed chain carries a `LoopExit` associated with
    /// the given `LoopBegin`.
    fn has_loop_exit_of(&self, graph: &Graph, block: BlockId, loop_begin: NodeId) -> bool {
        self.blocks[block.as_usize()].nodes.iter().any(|&n| {
            let node = graph.node(n);
            matches!(node.op, Operator::Control(ControlOp::LoopExit))
                && node.inputs.get(1) == Some(loop_begin)
        })
    }

    // =========================================================================
    // Frequencies
    // =========================================================================

    fn compute_frequencies(&mut self, graph: &Graph) {
        let rpo = self.rpo.clone();
        for &block in &rpo {
            if block == self.entry {
                self.blocks[block.as_usize()].frequency = 1.0;
                continue;
            }

            // Sum forward-predecessor contributions; back edges are folded
            // into the header's trip-count multiplier instead.
            let preds = self.blocks[block.as_usize()].predecessors.clone();
            let mut freq = 0.0;
            for &pred in &preds {
                if self.dominates(block, pred) {
                    continue; // back edge
                }
                let pred_freq = self.blocks[pred.as_usize()].frequency;
                freq += pred_freq * self.edge_probability(graph, pred, block);
            }

            let start = self.blocks[block.as_usize()].start;
            if matches!(
                graph.node(start).op,
                Operator::Control(ControlOp::LoopBegin)
            ) {
                let trip = match graph.node(start).aux {
                    NodeAux::LoopFrequency(f) => f,
                    _ => DEFAULT_LOOP_FREQUENCY,
                };
                freq *= trip;
            }

            self.blocks[block.as_usize()].frequency = freq;
        }
    }

    fn edge_probability(&self, graph: &Graph, from: BlockId, to: BlockId) -> f64 {
        let block = &self.blocks[from.as_usize()];
        let term = graph.node(block.terminator());
        match term.op {
            Operator::Control(ControlOp::If) => {
                let p = match term.aux {
                    NodeAux::Probability(p) => p.clamp(0.0, 1.0),
                    _ => 0.5,
                };
                match block.successors.iter().position(|&s| s == to) {
                    Some(0) => p,
                    _ => 1.0 - p,
                }
            }
            Operator::Control(ControlOp::Switch) => {
                1.0 / block.successors.len().max(1) as f64
            }
            _ => 1.0,
        }
    }

    // =========================================================================
    // Query API
    // =========================================================================

    /// Get a block by id.
    #[inline]
    pub fn block(&self, id: BlockId) -> &BasicBlock {
        &self.blocks[id.as_usize()]
    }

    /// Block assignment of a fixed node.
    pub fn block_for(&self, node: NodeId) -> Option<BlockId> {
        self.node_block.get(node).copied().filter(|b| b.is_valid())
    }

    /// Relative execution frequency of a block.
    #[inline]
    pub fn relative_frequency(&self, block: BlockId) -> f64 {
        self.blocks[block.as_usize()].frequency
    }

    /// Number of blocks.
    #[inline]
    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    /// Check if there are no blocks.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    /// Iterate over blocks with their ids.
    pub fn iter(&self) -> impl Iterator<Item = (BlockId, &BasicBlock)> {
        self.blocks
            .iter()
            .enumerate()
            .map(|(i, b)| (BlockId::new(i as u32), b))
    }

    /// The loop forest.
    #[inline]
    pub fn loops(&self) -> &[Loop] {
        &self.loops
    }

    /// Index of the innermost loop containing a block.
    pub fn innermost_loop(&self, block: BlockId) -> Option<usize> {
        self.block_loop.get(&block).copied()
    }

    /// Enclosing loop indices of a block, innermost first.
    pub fn enclosing_loops(&self, block: BlockId) -> Vec<usize> {
        let mut chain = Vec::new();
        let mut current = self.innermost_loop(block);
        while let Some(idx) = current {
            chain.push(idx);
            current = self.loops[idx].parent;
        }
        chain
    }
}

// =============================================================================
// Loop
// =============================================================================

/// A natural loop in the CFG.
#[derive(Debug, Clone)]
pub struct Loop {
    /// The header block (a `LoopBegin` in well-formed graphs).
    pub header: BlockId,

    /// Back-edge source blocks.
    pub back_edges: Vec<BlockId>,

    /// All member blocks, including nested loops' blocks.
    pub blocks: Vec<BlockId>,

    /// Enclosing loop, if nested.
    pub parent: Option<usize>,

    /// Directly nested loops.
    pub children: Vec<usize>,

    /// Nesting depth (1 = outermost).
    pub depth: u32,
}

impl Loop {
    fn new(header: BlockId) -> Self {
        Loop {
            header,
            back_edges: Vec::new(),
            blocks: Vec::new(),
            parent: None,
            children: Vec::new(),
            depth: 1,
        }
    }

    /// Member blocks excluding all descendant loops' blocks.
    pub fn exclusive_blocks(&self, all: &[Loop]) -> Vec<BlockId> {
        let mut nested = BitSet::new();
        let mut worklist: Vec<usize> = self.children.clone();
        while let Some(idx) = worklist.pop() {
            for &b in &all[idx].blocks {
                nested.insert(b.as_usize());
            }
            worklist.extend(all[idx].children.iter().copied());
        }
        self.blocks
            .iter()
            .copied()
            .filter(|b| !nested.contains(b.as_usize()))
            .collect()
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::node::InputList;
    use crate::ir::test_graphs;

    #[test]
    fn test_linear_graph_single_block_chain() {
        let mut g = Graph::new();
        let v = g.const_int(1);
        let _ret = g.return_value(g.start, v);

        let cfg = Cfg::compute(&g, CfgOptions::default());
        assert_eq!(cfg.len(), 1);
        assert_eq!(cfg.block(cfg.entry).nodes.len(), 2);
        assert_eq!(cfg.block_for(g.start), Some(cfg.entry));
    }

    #[test]
    fn test_diamond_blocks_and_edges() {
        let (g, d) = test_graphs::diamond(0.5);
        let cfg = Cfg::compute(&g, CfgOptions::full());

        // entry, two arms, join
        assert_eq!(cfg.len(), 4);

        let entry = cfg.block(cfg.entry);
        assert_eq!(entry.successors.len(), 2);

        let join = cfg.block_for(d.merge).unwrap();
        assert_eq!(cfg.block(join).predecessors.len(), 2);

        // dominance: entry dominates everything, arms don't dominate join
        for (id, _) in cfg.iter() {
            assert!(cfg.dominates(cfg.entry, id));
        }
        let arm = cfg.block_for(d.true_begin).unwrap();
        assert!(!cfg.dominates(arm, join));
    }

    #[test]
    fn test_diamond_frequencies() {
        let (g, d) = test_graphs::diamond(0.5);
        let cfg = Cfg::compute(&g, CfgOptions::full());

        let t = cfg.block_for(d.true_begin).unwrap();
        let f = cfg.block_for(d.false_begin).unwrap();
        let join = cfg.block_for(d.merge).unwrap();

        assert!((cfg.relative_frequency(t) - 0.5).abs() < 1e-9);
        assert!((cfg.relative_frequency(f) - 0.5).abs() < 1e-9);
        assert!((cfg.relative_frequency(join) - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_biased_branch_frequencies() {
        let (g, d) = test_graphs::diamond(0.9);
        let cfg = Cfg::compute(&g, CfgOptions::full());

        let t = cfg.block_for(d.true_begin).unwrap();
        let f = cfg.block_for(d.false_begin).unwrap();
        assert!((cfg.relative_frequency(t) - 0.9).abs() < 1e-9);
        assert!((cfg.relative_frequency(f) - 0.1).abs() < 1e-9);
    }

    #[test]
    fn test_single_loop_detected() {
        let (g, l) = test_graphs::counted_loop();
        let cfg = Cfg::compute(&g, CfgOptions::full());

        assert_eq!(cfg.loops().len(), 1);
        let lp = &cfg.loops()[0];
        assert_eq!(lp.header, cfg.block_for(l.loop_begin).unwrap());
        assert_eq!(lp.depth, 1);
        assert!(lp.parent.is_none());

        // Loop body runs ~10x entry with the default trip estimate.
        let header_freq = cfg.relative_frequency(lp.header);
        assert!(header_freq > 5.0, "header frequency {}", header_freq);
    }

    #[test]
    fn test_nested_loops_forest() {
        let (g, l) = test_graphs::nested_loops();
        let cfg = Cfg::compute(&g, CfgOptions::full());

        assert_eq!(cfg.loops().len(), 2);

        let outer_header = cfg.block_for(l.outer_begin).unwrap();
        let inner_header = cfg.block_for(l.inner_begin).unwrap();

        let outer_idx = cfg.innermost_loop(outer_header).unwrap();
        let inner_idx = cfg.innermost_loop(inner_header).unwrap();
        assert_ne!(outer_idx, inner_idx);

        assert_eq!(cfg.loops()[inner_idx].parent, Some(outer_idx));
        assert_eq!(cfg.loops()[inner_idx].depth, 2);
        assert_eq!(cfg.loops()[outer_idx].children, vec![inner_idx]);

        // Enclosing chain from the inner header: inner, then outer.
        assert_eq!(cfg.enclosing_loops(inner_header), vec![inner_idx, outer_idx]);

        // Inner blocks are excluded from the outer loop's exclusive set.
        let exclusive = cfg.loops()[outer_idx].exclusive_blocks(cfg.loops());
        assert!(!exclusive.contains(&inner_header));
        assert!(exclusive.contains(&outer_header));
    }

    #[test]
    fn test_stale_cfg_discipline_is_recompute() {
        // Not a behavior test so much as an API shape check: Cfg::compute
        // takes &Graph and returns an owned value; there is no cache to
        // invalidate.
        let mut g = Graph::new();
        let v = g.const_int(3);
        let ret = g.return_value(g.start, v);
        let before = Cfg::compute(&g, CfgOptions::default());

        // Structural edit: splice a begin between start and return.
        let begin = g.add_node_no_dedup(
            Operator::Control(ControlOp::Begin),
            InputList::Empty,
        );
        g.replace_at_predecessor(ret, begin).unwrap();
        g.replace_input(ret, 0, begin);

        let after = Cfg::compute(&g, CfgOptions::default());
        assert!(after.len() >= before.len());
        assert_eq!(after.block_for(begin).is_some(), true);
    }
}
