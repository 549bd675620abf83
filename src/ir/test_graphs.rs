//! Canonical graph shapes shared by unit tests.

use super::graph::Graph;
use super::node::{InputList, NodeAux, NodeId};
use super::operators::{ArithOp, CmpOp, ControlOp, Operator};

/// Named nodes of a diamond: `if (cond) { a } else { b }; join`.
pub struct Diamond {
    pub iff: NodeId,
    pub true_begin: NodeId,
    pub false_begin: NodeId,
    pub merge: NodeId,
    pub phi: NodeId,
    pub ret: NodeId,
}

/// Build a diamond with the given true-branch probability.
pub fn diamond(probability: f64) -> (Graph, Diamond) {
    let mut g = Graph::new();

    let cond = g.parameter(0);
    let iff = g.add_node_with_aux(
        Operator::Control(ControlOp::If),
        InputList::Pair(g.start, cond),
        NodeAux::Probability(probability),
    );
    let true_begin = g.begin(iff);
    let false_begin = g.begin(iff);

    let e1 = g.end(true_begin);
    let e2 = g.end(false_begin);
    let merge = g.merge(&[e1, e2]);

    let a = g.const_int(1);
    let b = g.const_int(2);
    let phi = g.phi(merge, &[a, b]);
    let ret = g.return_value(merge, phi);

    (
        g,
        Diamond {
            iff,
            true_begin,
            false_begin,
            merge,
            phi,
            ret,
        },
    )
}

/// Named nodes of a single counted loop.
pub struct CountedLoop {
    pub loop_begin: NodeId,
    pub body_begin: NodeId,
    pub exit_begin: NodeId,
    pub loop_exit: NodeId,
    pub phi: NodeId,
    pub ret: NodeId,
}

/// Build `for (i = 0; i < n; i++) {}` with a 0.9 stay-in-loop probability.
pub fn counted_loop() -> (Graph, CountedLoop) {
    let mut g = Graph::new();

    let e0 = g.end(g.start);
    let loop_begin =
        g.add_node_no_dedup(Operator::Control(ControlOp::LoopBegin), InputList::Single(e0));

    let zero = g.const_int(0);
    let phi = g.phi(loop_begin, &[zero]);

    let limit = g.parameter(0);
    let cond = g.add_node(Operator::IntCmp(CmpOp::Lt), InputList::Pair(phi, limit));
    let iff = g.add_node_with_aux(
        Operator::Control(ControlOp::If),
        InputList::Pair(loop_begin, cond),
        NodeAux::Probability(0.9),
    );

    let body_begin = g.begin(iff);
    let exit_begin = g.begin(iff);

    let one = g.const_int(1);
    let inc = g.add_node(Operator::IntOp(ArithOp::Add), InputList::Pair(phi, one));
    let back = g.end(body_begin);
    g.add_input(loop_begin, back);
    g.add_input(phi, inc);

    let loop_exit = g.add_node_no_dedup(
        Operator::Control(ControlOp::LoopExit),
        InputList::Pair(exit_begin, loop_begin),
    );
    let ret = g.return_value(loop_exit, phi);

    (
        g,
        CountedLoop {
            loop_begin,
            body_begin,
            exit_begin,
            loop_exit,
            phi,
            ret,
        },
    )
}

/// Named nodes of two nested loops.
pub struct NestedLoops {
    pub outer_begin: NodeId,
    pub inner_begin: NodeId,
    pub inner_body_begin: NodeId,
    pub outer_exit_begin: NodeId,
    pub ret: NodeId,
}

/// Build an outer loop whose body is an inner loop.
pub fn nested_loops() -> (Graph, NestedLoops) {
    let mut g = Graph::new();

    let e0 = g.end(g.start);
    let outer_begin =
        g.add_node_no_dedup(Operator::Control(ControlOp::LoopBegin), InputList::Single(e0));

    let cond_o = g.parameter(0);
    let oiff = g.add_node_with_aux(
        Operator::Control(ControlOp::If),
        InputList::Pair(outer_begin, cond_o),
        NodeAux::Probability(0.9),
    );
    let outer_body_begin = g.begin(oiff);
    let outer_exit_begin = g.begin(oiff);

    let e1 = g.end(outer_body_begin);
    let inner_begin =
        g.add_node_no_dedup(Operator::Control(ControlOp::LoopBegin), InputList::Single(e1));

    let cond_i = g.parameter(1);
    let iiff = g.add_node_with_aux(
        Operator::Control(ControlOp::If),
        InputList::Pair(inner_begin, cond_i),
        NodeAux::Probability(0.9),
    );
    let inner_body_begin = g.begin(iiff);
    let inner_exit_begin = g.begin(iiff);

    let iback = g.end(inner_body_begin);
    g.add_input(inner_begin, iback);

    let inner_exit = g.add_node_no_dedup(
        Operator::Control(ControlOp::LoopExit),
        InputList::Pair(inner_exit_begin, inner_begin),
    );
    let oback = g.end(inner_exit);
    g.add_input(outer_begin, oback);

    let outer_exit = g.add_node_no_dedup(
        Operator::Control(ControlOp::LoopExit),
        InputList::Pair(outer_exit_begin, outer_begin),
    );
    let value = g.const_int(0);
    let ret = g.return_value(outer_exit, value);

    (
        g,
        NestedLoops {
            outer_begin,
            inner_begin,
            inner_body_begin,
            outer_exit_begin,
            ret,
        },
    )
}
