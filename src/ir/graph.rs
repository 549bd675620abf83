//! The mutable IR graph store.
//!
//! The graph owns all nodes and maintains the reverse usage index alongside
//! the forward input lists: every structural mutation updates both sides
//! before returning, so no pass can observe the two out of sync.
//!
//! # Mutation primitives
//!
//! - [`Graph::add_node`]: allocate, register usages, value-number pure nodes
//! - [`Graph::add_node_no_dedup`]: allocate unconditionally (per-site phis)
//! - [`Graph::replace_at_predecessor`]: rewire a unique control predecessor
//! - [`Graph::safe_delete`]: remove a node, refusing while usages remain
//!
//! Topology violations (`InvalidTopology`, `NodeStillUsed`) are programmer
//! errors inside a pass: they surface as `Err` so tests can observe them,
//! and passes escalate them into their fatal channel.

use rustc_hash::FxHashMap;

use super::arena::{Arena, SecondaryMap};
use super::node::{InputList, Node, NodeAux, NodeId};
use super::operators::{ControlOp, EdgeKind, Operator};

// =============================================================================
// Errors
// =============================================================================

/// Structural errors raised by graph mutation primitives.
///
/// These indicate an invariant violation by the calling pass, not a
/// legitimate compilation outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum GraphError {
    /// A single-predecessor operation was applied to a node with zero or
    /// multiple control predecessors.
    #[error("node {0} does not have exactly one control predecessor")]
    InvalidTopology(NodeId),

    /// A node was deleted while consumers still reference it.
    #[error("node {0} still has usages")]
    NodeStillUsed(NodeId),
}

/// Result alias for graph mutations.
pub type GraphResult<T> = Result<T, GraphError>;

// =============================================================================
// Graph
// =============================================================================

/// An IR graph: arena-backed nodes plus a reverse usage index.
#[derive(Clone)]
pub struct Graph {
    /// Node storage.
    nodes: Arena<Node>,

    /// Usage index: for each node, the nodes that have it as an input.
    /// A user appears once per referencing input position.
    uses: SecondaryMap<Node, Vec<NodeId>>,

    /// Value-numbering table for pure nodes.
    pure_cache: FxHashMap<(Operator, InputList), NodeId>,

    /// The start node (control entry).
    pub start: NodeId,

    /// Bytecode offset stamped onto newly created nodes.
    next_bc_offset: u32,
}

impl Graph {
    /// Create a new graph containing only the start node.
    pub fn new() -> Self {
        let mut nodes = Arena::with_capacity(64);
        let start = nodes.alloc(Node::new(
            Operator::Control(ControlOp::Start),
            InputList::Empty,
        ));

        Graph {
            nodes,
            uses: SecondaryMap::new(),
            pure_cache: FxHashMap::default(),
            start,
            next_bc_offset: 0,
        }
    }

    // =========================================================================
    // Node Access
    // =========================================================================

    /// Get a reference to a node. Panics on a freed id.
    #[inline]
    pub fn node(&self, id: NodeId) -> &Node {
        &self.nodes[id]
    }

    /// Get a mutable reference to a node. Panics on a freed id.
    ///
    /// Callers must not change the input list through this; use the
    /// mutation primitives, which keep the usage index in sync.
    #[inline]
    pub fn node_mut(&mut self, id: NodeId) -> &mut Node {
        &mut self.nodes[id]
    }

    /// Get a node by id, if it is live.
    #[inline]
    pub fn get(&self, id: NodeId) -> Option<&Node> {
        self.nodes.get(id)
    }

    /// Check whether an id refers to a live node.
    #[inline]
    pub fn contains(&self, id: NodeId) -> bool {
        self.nodes.contains(id)
    }

    /// Number of live nodes.
    #[inline]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Check if the graph holds only the start node.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.nodes.len() <= 1
    }

    /// Upper bound on node indices (for sizing secondary structures).
    #[inline]
    pub fn node_bound(&self) -> usize {
        self.nodes.slot_bound()
    }

    /// Iterate over live nodes with their ids.
    pub fn iter(&self) -> impl Iterator<Item = (NodeId, &Node)> {
        self.nodes.iter()
    }

    /// Iterate over live node ids.
    pub fn ids(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.nodes.ids()
    }

    /// Set the bytecode offset stamped onto nodes created after this call.
    pub fn set_bc_offset(&mut self, offset: u32) {
        self.next_bc_offset = offset;
    }

    // =========================================================================
    // Node Creation
    // =========================================================================

    /// Add a node, value-numbering pure operators.
    ///
    /// Two pure nodes with identical operator and inputs resolve to one id.
    /// Impure, control, and phi nodes always allocate.
    pub fn add_node(&mut self, op: Operator, inputs: InputList) -> NodeId {
        if op.is_pure() {
            let key = (op, inputs.clone());
            if let Some(&existing) = self.pure_cache.get(&key) {
                if self.nodes.contains(existing) {
                    return existing;
                }
            }
            let id = self.alloc_node(Node::new(op, inputs));
            self.pure_cache.insert(key, id);
            return id;
        }
        self.alloc_node(Node::new(op, inputs))
    }

    /// Add a node, skipping value numbering unconditionally.
    ///
    /// Required for per-site phi nodes: two phis over the same merge with
    /// coincidentally equal inputs must remain distinct nodes.
    pub fn add_node_no_dedup(&mut self, op: Operator, inputs: InputList) -> NodeId {
        self.alloc_node(Node::new(op, inputs))
    }

    /// Add a node carrying an aux payload (never value-numbered).
    pub fn add_node_with_aux(&mut self, op: Operator, inputs: InputList, aux: NodeAux) -> NodeId {
        self.alloc_node(Node::with_aux(op, inputs, aux))
    }

    fn alloc_node(&mut self, mut node: Node) -> NodeId {
        node.bc_offset = self.next_bc_offset;
        let inputs = node.inputs.clone();
        let id = self.nodes.alloc(node);
        for input in inputs.iter_valid() {
            self.add_use(input, id);
        }
        id
    }

    // =========================================================================
    // Usage Index
    // =========================================================================

    /// The consumers of a node, one entry per referencing input position.
    ///
    /// The returned iterator is restartable: call again to rescan after a
    /// mutation. Collect first when mutating while walking.
    pub fn usages(&self, id: NodeId) -> impl Iterator<Item = NodeId> + '_ {
        self.usage_list(id).iter().copied()
    }

    /// The usage list as a slice.
    #[inline]
    pub fn usage_list(&self, id: NodeId) -> &[NodeId] {
        self.uses.get(id).map(|v| v.as_slice()).unwrap_or(&[])
    }

    /// Total usage count (all edge kinds).
    #[inline]
    pub fn use_count(&self, id: NodeId) -> usize {
        self.usage_list(id).len()
    }

    /// Count of `Value`-kind input positions among all usages of `id`.
    pub fn value_usage_count(&self, id: NodeId) -> usize {
        let mut count = 0;
        for &user in self.usage_list(id) {
            let node = &self.nodes[user];
            for (pos, input) in node.inputs.iter().enumerate() {
                if input == id && node.edge_kind(pos) == EdgeKind::Value {
                    count += 1;
                }
            }
        }
        count
    }

    /// Whether `id` has exactly one value consumer.
    ///
    /// A node admitting non-value usages (e.g. guard anchors) can have
    /// `use_count() > 1` while still having a single value consumer, so this
    /// counts value-kind positions rather than raw usages.
    ///
    /// Precondition (preserved from the source heuristic, not verified
    /// beyond a debug assertion): when called on a node that admits guard
    /// usages, at least one value usage exists.
    pub fn is_single_value_user(&self, id: NodeId) -> bool {
        let total = self.use_count(id);
        if total <= 1 {
            return total == 1;
        }
        let value_uses = self.value_usage_count(id);
        debug_assert!(
            value_uses >= 1,
            "single-value-user query on all-non-value usages of {:?}",
            id
        );
        value_uses == 1
    }

    fn add_use(&mut self, def: NodeId, user: NodeId) {
        self.uses.resize(def.as_usize() + 1);
        self.uses[def].push(user);
    }

    fn remove_use(&mut self, def: NodeId, user: NodeId) {
        if let Some(uses) = self.uses.get_mut(def) {
            if let Some(pos) = uses.iter().position(|&u| u == user) {
                uses.swap_remove(pos);
            }
        }
    }

    // =========================================================================
    // Mutation Primitives
    // =========================================================================

    /// Replace the input at `index` of `node` with `new_input`.
    pub fn replace_input(&mut self, node: NodeId, index: usize, new_input: NodeId) {
        if let Some(old) = self.nodes[node].inputs.get(index) {
            if old.is_valid() {
                self.remove_use(old, node);
            }
        }
        self.nodes[node].inputs.set(index, new_input);
        if new_input.is_valid() {
            self.add_use(new_input, node);
        }
    }

    /// Append an input position to `node` (merge predecessors, phi values).
    pub fn add_input(&mut self, node: NodeId, input: NodeId) {
        self.nodes[node].inputs.push(input);
        if input.is_valid() {
            self.add_use(input, node);
        }
    }

    /// Rewire the unique control predecessor of `node` to flow into
    /// `replacement` instead.
    ///
    /// After this call the predecessor's control successor is `replacement`;
    /// `node` is left without a control predecessor (its slot is detached,
    /// pending deletion or re-wiring by the caller).
    ///
    /// Fails with [`GraphError::InvalidTopology`] if `node` has zero or more
    /// than one attached control predecessor, or if `replacement` cannot
    /// accept a control predecessor at position 0.
    pub fn replace_at_predecessor(
        &mut self,
        node: NodeId,
        replacement: NodeId,
    ) -> GraphResult<()> {
        // Locate the unique attached control input of `node`.
        let mut found: Option<(usize, NodeId)> = None;
        {
            let n = &self.nodes[node];
            for (pos, input) in n.inputs.iter().enumerate() {
                if input.is_valid() && n.edge_kind(pos) == EdgeKind::Control {
                    if found.is_some() {
                        return Err(GraphError::InvalidTopology(node));
                    }
                    found = Some((pos, input));
                }
            }
        }
        let (pos, pred) = found.ok_or(GraphError::InvalidTopology(node))?;

        // The replacement's position-0 slot must be a control edge.
        {
            let r = &self.nodes[replacement];
            let slot_count = r.inputs.len().max(1);
            if r.op.edge_kind(0, slot_count) != EdgeKind::Control {
                return Err(GraphError::InvalidTopology(replacement));
            }
        }

        // Detach pred -> node.
        self.remove_use(pred, node);
        self.nodes[node].inputs.set(pos, NodeId::INVALID);

        // Attach pred -> replacement.
        if self.nodes[replacement].inputs.is_empty() {
            self.nodes[replacement].inputs.push(pred);
        } else {
            let old = self.nodes[replacement].inputs.get(0).unwrap_or(NodeId::INVALID);
            if old.is_valid() {
                self.remove_use(old, replacement);
            }
            self.nodes[replacement].inputs.set(0, pred);
        }
        self.add_use(pred, replacement);

        Ok(())
    }

    /// Delete a node, provided nothing uses it.
    ///
    /// Fails with [`GraphError::NodeStillUsed`] (leaving the graph
    /// unchanged) if any usages remain: the guard against silently
    /// orphaning live data.
    pub fn safe_delete(&mut self, id: NodeId) -> GraphResult<()> {
        if self.use_count(id) > 0 {
            return Err(GraphError::NodeStillUsed(id));
        }

        // Unregister this node from its producers.
        let inputs: Vec<NodeId> = self.nodes[id].inputs.iter_valid().collect();
        for input in inputs {
            self.remove_use(input, id);
        }

        // Drop any value-numbering entry pointing at this node.
        let node = &self.nodes[id];
        if node.op.is_pure() {
            let key = (node.op, node.inputs.clone());
            if self.pure_cache.get(&key) == Some(&id) {
                self.pure_cache.remove(&key);
            }
        }

        self.nodes.free(id);
        Ok(())
    }

    // =========================================================================
    // Control Queries
    // =========================================================================

    /// The attached control predecessors of a node (inputs with control
    /// edge kind).
    pub fn control_predecessors(&self, id: NodeId) -> Vec<NodeId> {
        let node = &self.nodes[id];
        node.inputs
            .iter()
            .enumerate()
            .filter(|&(pos, input)| input.is_valid() && node.edge_kind(pos) == EdgeKind::Control)
            .map(|(_, input)| input)
            .collect()
    }

    /// The control successors of a node: users that reference it through a
    /// control-kind input position.
    pub fn control_successors(&self, id: NodeId) -> Vec<NodeId> {
        let mut succs = Vec::new();
        for &user in self.usage_list(id) {
            let node = &self.nodes[user];
            for (pos, input) in node.inputs.iter().enumerate() {
                if input == id && node.edge_kind(pos) == EdgeKind::Control {
                    succs.push(user);
                    break;
                }
            }
        }
        succs
    }

    // =========================================================================
    // Construction Helpers
    // =========================================================================

    /// Create an integer constant (value-numbered).
    pub fn const_int(&mut self, value: i64) -> NodeId {
        self.add_node(Operator::ConstInt(value), InputList::Empty)
    }

    /// Create a float constant (value-numbered).
    pub fn const_float(&mut self, value: f64) -> NodeId {
        self.add_node(Operator::ConstFloat(value.to_bits()), InputList::Empty)
    }

    /// Create a parameter node.
    pub fn parameter(&mut self, index: u16) -> NodeId {
        self.add_node(Operator::Parameter(index), InputList::Empty)
    }

    /// Create a block begin marker after `pred`.
    pub fn begin(&mut self, pred: NodeId) -> NodeId {
        self.add_node_no_dedup(Operator::Control(ControlOp::Begin), InputList::Single(pred))
    }

    /// Create a forward end after `pred`.
    pub fn end(&mut self, pred: NodeId) -> NodeId {
        self.add_node_no_dedup(Operator::Control(ControlOp::End), InputList::Single(pred))
    }

    /// Create a merge over forward ends.
    pub fn merge(&mut self, ends: &[NodeId]) -> NodeId {
        self.add_node_no_dedup(
            Operator::Control(ControlOp::Merge),
            InputList::from_slice(ends),
        )
    }

    /// Create a phi over `merge` (never value-numbered).
    pub fn phi(&mut self, merge: NodeId, values: &[NodeId]) -> NodeId {
        let mut inputs = vec![merge];
        inputs.extend_from_slice(values);
        self.add_node_no_dedup(Operator::Phi, InputList::from_slice(&inputs))
    }

    /// Create a frame state capturing `values` at `method`/`bci`.
    pub fn frame_state(&mut self, method: u32, bci: u32, values: &[NodeId]) -> NodeId {
        self.add_node_with_aux(
            Operator::FrameState,
            InputList::from_slice(values),
            NodeAux::FrameInfo { method, bci },
        )
    }

    /// Create a deoptimize sink after `pred`.
    pub fn deoptimize(
        &mut self,
        pred: NodeId,
        action_reason: NodeId,
        speculation: NodeId,
        state: NodeId,
    ) -> NodeId {
        self.add_node_no_dedup(
            Operator::Deoptimize,
            InputList::from_slice(&[pred, action_reason, speculation, state]),
        )
    }

    /// Create a return sink after `pred`.
    pub fn return_value(&mut self, pred: NodeId, value: NodeId) -> NodeId {
        self.add_node_no_dedup(
            Operator::Control(ControlOp::Return),
            InputList::Pair(pred, value),
        )
    }

    // =========================================================================
    // Verification
    // =========================================================================

    /// Verify input/usage symmetry and basic topology (debug aid).
    pub fn verify(&self) -> Result<(), String> {
        for (id, node) in self.iter() {
            for input in node.inputs.iter_valid() {
                if !self.nodes.contains(input) {
                    return Err(format!("node {:?} references freed input {:?}", id, input));
                }
                if !self.usage_list(input).contains(&id) {
                    return Err(format!(
                        "missing usage entry: {:?} uses {:?} but is not in its usage list",
                        id, input
                    ));
                }
            }
        }
        for (id, _) in self.iter() {
            for &user in self.usage_list(id) {
                if !self.nodes.contains(user) {
                    return Err(format!("usage list of {:?} contains freed node {:?}", id, user));
                }
                let node = &self.nodes[user];
                if !node.inputs.iter().any(|input| input == id) {
                    return Err(format!(
                        "stale usage entry: {:?} listed as user of {:?}",
                        user, id
                    ));
                }
            }
        }
        if !self.nodes[self.start].inputs.is_empty() {
            return Err("start node must have no inputs".into());
        }
        Ok(())
    }
}

impl Default for Graph {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Graph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "Graph ({} nodes):", self.nodes.len())?;
        for (id, node) in self.iter() {
            writeln!(f, "  {:?}: {} {:?}", id, node.op.mnemonic(), node.inputs)?;
        }
        Ok(())
    }
}

// =============================================================================
// Tests
// =============================================================================
