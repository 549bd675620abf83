//! End-to-end scenarios for the rewrite passes over realistic graphs.

use ember_jit::ir::{
    CfgOptions, Cfg, ControlOp, Graph, InputList, NodeAux, NodeId, Operator,
};
use ember_jit::opt::{DeoptGroupingPass, OptimizationPass, ProfilingConfig, ProfilingPass};
use ember_jit::telemetry::CounterRegistry;

/// Three deoptimize nodes sharing one frame state: D1 and D2 inside a loop,
/// D3 outside it.
struct Scenario {
    graph: Graph,
    frame_state: NodeId,
    loop_begin: NodeId,
    d1_begin: NodeId,
    d2_begin: NodeId,
    outside_begin: NodeId,
    actions: [NodeId; 3],
    speculations: [NodeId; 3],
}

fn build_scenario() -> Scenario {
    let mut g = Graph::new();

    let local = g.parameter(0);
    let frame_state = g.frame_state(7, 21, &[local]);

    // start -> If -> (loop side | outside side)
    let outer_cond = g.parameter(1);
    let outer_if = g.add_node_with_aux(
        Operator::Control(ControlOp::If),
        InputList::Pair(g.start, outer_cond),
        NodeAux::Probability(0.5),
    );
    let loop_side = g.begin(outer_if);
    let outside_begin = g.begin(outer_if);

    // The loop: header with two guard-style deopt branches in its body.
    let e0 = g.end(loop_side);
    let loop_begin = g.add_node_no_dedup(
        Operator::Control(ControlOp::LoopBegin),
        InputList::Single(e0),
    );

    let c1 = g.parameter(2);
    let iff1 = g.add_node_no_dedup(
        Operator::Control(ControlOp::If),
        InputList::Pair(loop_begin, c1),
    );
    let d1_begin = g.begin(iff1);
    let cont1 = g.begin(iff1);

    let c2 = g.parameter(3);
    let iff2 = g.add_node_no_dedup(
        Operator::Control(ControlOp::If),
        InputList::Pair(cont1, c2),
    );
    let d2_begin = g.begin(iff2);
    let cont2 = g.begin(iff2);

    let back = g.end(cont2);
    g.add_input(loop_begin, back);

    // Distinct selector values so phi input order is observable.
    let actions = [g.const_int(101), g.const_int(102), g.const_int(103)];
    let speculations = [g.const_int(201), g.const_int(202), g.const_int(203)];

    g.deoptimize(d1_begin, actions[0], speculations[0], frame_state);
    g.deoptimize(d2_begin, actions[1], speculations[1], frame_state);
    g.deoptimize(outside_begin, actions[2], speculations[2], frame_state);

    Scenario {
        graph: g,
        frame_state,
        loop_begin,
        d1_begin,
        d2_begin,
        outside_begin,
        actions,
        speculations,
    }
}

fn deopt_usages(g: &Graph, fs: NodeId) -> Vec<NodeId> {
    g.usages(fs)
        .filter(|&u| {
            matches!(
                g.node(u).op,
                Operator::Deoptimize | Operator::DynamicDeoptimize
            )
        })
        .collect()
}

/// Follow the control chain from `begin` and collect operator mnemonics
/// until a merge-feeding end (inclusive).
fn path_mnemonics(g: &Graph, begin: NodeId) -> Vec<&'static str> {
    let mut path = Vec::new();
    let mut cursor = begin;
    loop {
        let succs = g.control_successors(cursor);
        assert_eq!(succs.len(), 1, "linear path expected");
        cursor = succs[0];
        path.push(g.node(cursor).op.mnemonic());
        if matches!(g.node(cursor).op, Operator::Control(ControlOp::End)) {
            return path;
        }
    }
}

#[test]
fn three_deopts_two_in_loop_one_outside() {
    let _ = env_logger::builder().is_test(true).try_init();
    let mut s = build_scenario();

    let mut pass = DeoptGroupingPass::new();
    let changed = pass.run(&mut s.graph).unwrap();
    assert!(changed);

    let stats = pass.stats();
    assert_eq!(stats.groups_formed, 1);
    assert_eq!(stats.deopts_merged, 3);
    assert_eq!(stats.loop_exits_inserted, 2);

    // The frame state's only remaining deopt-kind usage is the new dynamic
    // deopt.
    let remaining = deopt_usages(&s.graph, s.frame_state);
    assert_eq!(remaining.len(), 1);
    let dynamic = remaining[0];
    assert!(matches!(
        s.graph.node(dynamic).op,
        Operator::DynamicDeoptimize
    ));

    // One merge with exactly three forward predecessors.
    let merge = s.graph.node(dynamic).inputs.get(0).unwrap();
    assert!(matches!(
        s.graph.node(merge).op,
        Operator::Control(ControlOp::Merge)
    ));
    assert_eq!(s.graph.node(merge).inputs.len(), 3);

    // Phi inputs ordered [D1, D2, D3].
    let action_phi = s.graph.node(dynamic).inputs.get(1).unwrap();
    let spec_phi = s.graph.node(dynamic).inputs.get(2).unwrap();
    for (phi, values) in [(action_phi, &s.actions), (spec_phi, &s.speculations)] {
        let node = s.graph.node(phi);
        assert!(node.is_phi());
        assert_eq!(node.inputs.len(), 4); // merge + 3 values
        assert_eq!(node.inputs.get(0), Some(merge));
        for (i, &value) in values.iter().enumerate() {
            assert_eq!(node.inputs.get(i + 1), Some(value));
        }
    }

    // D1's and D2's paths cross the loop boundary exactly once; D3's does
    // not cross it at all.
    assert_eq!(path_mnemonics(&s.graph, s.d1_begin), vec!["LoopExit", "End"]);
    assert_eq!(path_mnemonics(&s.graph, s.d2_begin), vec!["LoopExit", "End"]);
    assert_eq!(path_mnemonics(&s.graph, s.outside_begin), vec!["End"]);

    // The inserted exits announce the right loop.
    for begin in [s.d1_begin, s.d2_begin] {
        let exit = s.graph.control_successors(begin)[0];
        assert_eq!(s.graph.node(exit).inputs.get(1), Some(s.loop_begin));
    }

    assert!(s.graph.verify().is_ok());
}

#[test]
fn grouping_then_profiling_leaves_valid_graph() {
    let mut s = build_scenario();

    let mut grouping = DeoptGroupingPass::new();
    grouping.run(&mut s.graph).unwrap();

    let registry = CounterRegistry::new();
    let mut profiling = ProfilingPass::with_config(ProfilingConfig::default())
        .with_telemetry(registry.clone());
    profiling.run(&mut s.graph).unwrap();

    // The loop survived grouping and still gets its own counter.
    assert_eq!(profiling.stats().loops_instrumented, 1);
    assert!(profiling.counter_table().len() >= 2);
    assert_eq!(registry.len(), profiling.counter_table().len());

    // Every increment respects the clamp and the graph is still sound.
    for descriptor in profiling.counter_table().descriptors() {
        assert!(descriptor.increment <= ProfilingConfig::default().max_increment);
    }
    assert!(s.graph.verify().is_ok());

    // The grouped deopt region is cold: rerunning analysis on the mutated
    // graph must succeed (derive-fresh discipline).
    let cfg = Cfg::compute(&s.graph, CfgOptions::full());
    assert!(cfg.loops().len() >= 1);
}

#[test]
fn rerunning_grouping_is_noop() {
    let mut s = build_scenario();

    let mut pass = DeoptGroupingPass::new();
    assert!(pass.run(&mut s.graph).unwrap());

    // A second invocation finds one dynamic deopt per frame state and no
    // deoptimize-kind groups left to form.
    let mut second = DeoptGroupingPass::new();
    assert!(!second.run(&mut s.graph).unwrap());
    assert_eq!(second.stats().groups_formed, 0);
}
