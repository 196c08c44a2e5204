use crate::config::AnalysisConfig;
use crate::descriptors::DescriptorSet;
use crate::il::Program;
use crate::listing_lifter::lift_from;
use std::sync::Arc;

#[cfg(test)]
use crate::{
    apidb::JsonApiDictionary,
    call_graph::CallGraphNode,
    calls::CallTarget,
    error::{ConfigError, PathFinderError},
    path_finder::{FinderState, PathFinder},
    solver::{Engine, Verdict},
    stack_delta::StackDelta,
};

/// `func(n)` checks `n > 2 && n < 10` before calling `goal`, and calls `bad` when `n <= 2`.
/// `main` only calls `func` with a value of `rand()` greater than 2.
pub const COMPOUND_CONDITION: &str = "
PROGRAM
name compound_condition
arch x86

IMPORTS
0x3000 msvcrt.dll rand var=1

LISTING
function func 0x1000
0x1000 IntSub ESP ESP const:4:4                 ; push ebp
0x1000 Store _ [ESP]:4 EBP
0x1001 Copy EBP ESP                             ; mov ebp, esp
0x1003 IntSub ESP ESP const:4:4                 ; call path_start
0x1003 Store _ [ESP]:4 const:0x1008:4
0x1003 Call _ @0x1100
0x1008 IntAdd tmp:0x100:4 EBP const:8:4         ; mov eax, [ebp+8]
0x1008 Load EAX [tmp:0x100]:4
0x100b IntSLessEqual tmp:0x200:1 EAX const:2:4  ; cmp eax, 2; jle 0x1040
0x100b Cbranch _ @0x1040 tmp:0x200:1
0x1010 IntSLessEqual tmp:0x200:1 const:10:4 EAX ; cmp eax, 10; jge 0x1060
0x1010 Cbranch _ @0x1060 tmp:0x200:1
0x1030 IntSub ESP ESP const:4:4                 ; call goal
0x1030 Store _ [ESP]:4 const:0x1035:4
0x1030 Call _ @0x1200
0x1035 Branch _ @0x1060                         ; jmp 0x1060
0x1040 IntSub ESP ESP const:4:4                 ; call bad
0x1040 Store _ [ESP]:4 const:0x1045:4
0x1040 Call _ @0x1210
0x1060 Load EBP [ESP]:4                         ; pop ebp
0x1060 IntAdd ESP ESP const:4:4
0x1061 Load tmp:0x300:4 [ESP]:4                 ; ret
0x1061 IntAdd ESP ESP const:4:4
0x1061 Return _ tmp:0x300:4
end
function path_start 0x1100
0x1100 Load tmp:0x300:4 [ESP]:4                 ; ret
0x1100 IntAdd ESP ESP const:4:4
0x1100 Return _ tmp:0x300:4
end
function goal 0x1200
0x1200 Load tmp:0x300:4 [ESP]:4                 ; ret
0x1200 IntAdd ESP ESP const:4:4
0x1200 Return _ tmp:0x300:4
end
function bad 0x1210
0x1210 Load tmp:0x300:4 [ESP]:4                 ; ret
0x1210 IntAdd ESP ESP const:4:4
0x1210 Return _ tmp:0x300:4
end
function main 0x1300
0x1300 IntSub ESP ESP const:4:4                 ; call [rand]
0x1300 Store _ [ESP]:4 const:0x1306:4
0x1300 CallInd _ ram:0x3000:4
0x1306 IntSLess tmp:0x200:1 const:2:4 EAX       ; cmp eax, 2; jle 0x1320
0x1306 BoolNegate tmp:0x201:1 tmp:0x200:1
0x1306 Cbranch _ @0x1320 tmp:0x201:1
0x1310 IntSub ESP ESP const:4:4                 ; push eax
0x1310 Store _ [ESP]:4 EAX
0x1311 IntSub ESP ESP const:4:4                 ; call func
0x1311 Store _ [ESP]:4 const:0x1316:4
0x1311 Call _ @0x1000
0x1316 IntAdd ESP ESP const:4:4                 ; add esp, 4
0x1320 Load tmp:0x300:4 [ESP]:4                 ; ret
0x1320 IntAdd ESP ESP const:4:4
0x1320 Return _ tmp:0x300:4
end
";

pub const API_DATABASE: &str = r#"[
    {"library": "msvcrt.dll", "name": "rand", "stack_delta": 0, "convention": "cdecl"}
]"#;

pub fn compound_condition_program() -> Arc<Program> {
    Arc::new(lift_from(COMPOUND_CONDITION).unwrap())
}

pub fn compound_condition_descriptors(config: AnalysisConfig) -> DescriptorSet {
    DescriptorSet::new(compound_condition_program(), config).unwrap()
}

#[cfg(test)]
fn position(order: &[u64], f: u64) -> usize {
    order.iter().position(|&a| a == f).unwrap()
}

#[test]
fn discovery_is_idempotent() {
    let ds = compound_condition_descriptors(AnalysisConfig::default());
    assert!(Arc::ptr_eq(
        &ds.get_or_create_function(0x1000),
        &ds.get_or_create_function(0x1000)
    ));
    let call = ds.get_or_create_call(0x1003).unwrap();
    assert!(Arc::ptr_eq(&call, &ds.get_or_create_call(0x1003).unwrap()));
    assert_eq!(call.target(), CallTarget::Function(0x1100));
    assert!(Arc::ptr_eq(
        &ds.add_import(0x3000, "msvcrt.dll", "rand", None),
        &ds.get_import(0x3000).unwrap()
    ));
    assert!(Arc::ptr_eq(
        &ds.get_or_create_global(0x5000),
        &ds.get_or_create_global(0x5000)
    ));
    // Not a call instruction
    assert!(ds.get_or_create_call(0x1001).is_none());
}

#[test]
fn call_graph_separates_imports_from_functions() {
    let ds = compound_condition_descriptors(AnalysisConfig::default());
    let cg = ds.call_graph();
    for c in ds.calls() {
        if let CallTarget::Function(callee) = c.target() {
            assert!(cg.has_edge(
                CallGraphNode::Function(c.caller()),
                CallGraphNode::Function(callee)
            ));
        }
    }
    assert_eq!(
        ds.get_call(0x1300).map(|c| c.target()),
        Some(CallTarget::Import(0x3000))
    );
    let mut callees = cg.callees(0x1300);
    callees.sort();
    assert_eq!(
        callees,
        vec![CallGraphNode::Function(0x1000), CallGraphNode::Import(0x3000)]
    );
}

#[test]
fn indirect_import_resolution_can_be_disabled() {
    let config: AnalysisConfig =
        vec![crate::config::CommandLineAnalysisConfig::DisableIndirectImportResolution].into();
    let ds = compound_condition_descriptors(config);
    assert_eq!(
        ds.get_call(0x1300).map(|c| c.target()),
        Some(CallTarget::Unresolved)
    );
    assert!(ds
        .call_graph()
        .has_edge(CallGraphNode::Function(0x1300), CallGraphNode::Unresolved));
}

#[test]
fn bottom_up_order_lists_callees_first() {
    let ds = compound_condition_descriptors(AnalysisConfig::default());
    let order: Vec<u64> = ds
        .functions_in_bottom_up_order()
        .iter()
        .map(|f| f.address())
        .collect();
    assert_eq!(order.len(), 5);
    for callee in [0x1100, 0x1200, 0x1210] {
        assert!(position(&order, callee) < position(&order, 0x1000));
    }
    assert!(position(&order, 0x1000) < position(&order, 0x1300));
    assert!(ds.dump().contains("Bottom-up order:"));
}

#[test]
fn import_resolution_is_monotonic() {
    let ds = compound_condition_descriptors(AnalysisConfig::default())
        .with_api_dictionary(Arc::new(JsonApiDictionary::from_json_str(API_DATABASE).unwrap()));
    assert_eq!(ds.get_import(0x3000).unwrap().stack_delta(), StackDelta::Unknown);
    assert_eq!(ds.resolve_imports(), 1);
    assert_eq!(ds.get_import(0x3000).unwrap().stack_delta(), StackDelta::Known(0));
    assert_eq!(ds.resolve_imports(), 0);
    assert_eq!(ds.get_import(0x3000).unwrap().stack_delta(), StackDelta::Known(0));
}

#[test]
fn cleared_imports_leave_stale_variables() {
    let ds = compound_condition_descriptors(AnalysisConfig::default());
    assert_eq!(
        ds.get_import_by_variable(1).map(|i| i.address()),
        Some(0x3000)
    );
    ds.clear_imports();
    assert!(ds.get_import_by_variable(1).is_none());
    assert!(!ds.bind_import_variable(2, 0x3000));
}

#[test]
fn cleared_imports_route_calls_to_the_unresolved_sink() {
    let ds = compound_condition_descriptors(AnalysisConfig::default());
    ds.clear_imports();
    ds.update_connections();
    let cg = ds.call_graph();
    // The call keeps its resolved target, but the graph has no sink for it any more
    assert_eq!(
        ds.get_call(0x1300).unwrap().target(),
        CallTarget::Import(0x3000)
    );
    assert!(!cg.contains(CallGraphNode::Import(0x3000)));
    assert!(cg.has_edge(
        CallGraphNode::Function(0x1300),
        CallGraphNode::Unresolved
    ));
    for (_, to) in cg.edges() {
        if let CallGraphNode::Import(a) = to {
            assert!(ds.get_import(a).is_some(), "stale sink {:#x}", a);
        }
    }
}

#[cfg(test)]
type ConnectionSnapshot = (
    Vec<(CallGraphNode, CallGraphNode)>,
    Vec<(u64, CallTarget)>,
    Vec<(u64, Vec<u64>, Vec<u64>)>,
);

#[cfg(test)]
fn connections(ds: &DescriptorSet) -> ConnectionSnapshot {
    let mut edges = ds.call_graph().edges();
    edges.sort();
    let mut targets: Vec<(u64, CallTarget)> =
        ds.calls().iter().map(|c| (c.address(), c.target())).collect();
    targets.sort();
    let mut globals: Vec<(u64, Vec<u64>, Vec<u64>)> = ds
        .globals()
        .iter()
        .map(|g| (g.address(), g.reads(), g.writes()))
        .collect();
    globals.sort();
    (edges, targets, globals)
}

#[test]
fn update_connections_is_idempotent() {
    let ds = compound_condition_descriptors(AnalysisConfig::default());
    // Without the import, its slot is an ordinary global read by `main`
    ds.clear_imports();
    ds.update_connections();
    let first = connections(&ds);
    assert!(first
        .2
        .iter()
        .any(|(a, reads, _)| *a == 0x3000 && reads == &vec![0x1300]));
    for _ in 0..3 {
        ds.update_connections();
        assert_eq!(connections(&ds), first);
    }
}

#[test]
fn concurrent_discovery_creates_one_descriptor_per_address() {
    let ds = compound_condition_descriptors(AnalysisConfig::default());
    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(8)
        .build()
        .unwrap();
    let found = parking_lot::Mutex::new(vec![]);
    pool.scope(|s| {
        for _ in 0..32 {
            s.spawn(|_| {
                let f = ds.get_or_create_function(0x5000);
                let g = ds.get_or_create_global(0x6000);
                let i = ds.add_import(0x7000, "kernel32.dll", "Sleep", None);
                found.lock().push((f, g, i));
            });
        }
    });
    let found = found.into_inner();
    assert_eq!(found.len(), 32);
    let (f0, g0, i0) = &found[0];
    for (f, g, i) in &found {
        assert!(Arc::ptr_eq(f, f0));
        assert!(Arc::ptr_eq(g, g0));
        assert!(Arc::ptr_eq(i, i0));
    }
    let count = |addrs: Vec<u64>, a: u64| addrs.into_iter().filter(|&x| x == a).count();
    assert_eq!(
        count(ds.functions().iter().map(|f| f.address()).collect(), 0x5000),
        1
    );
    assert_eq!(
        count(ds.globals().iter().map(|g| g.address()).collect(), 0x6000),
        1
    );
    assert_eq!(
        count(ds.imports().iter().map(|i| i.address()).collect(), 0x7000),
        1
    );
}

#[test]
fn analysis_finds_cdecl_deltas_and_slices() {
    let ds = compound_condition_descriptors(AnalysisConfig::default());
    ds.analyze_functions();
    for f in [0x1000, 0x1100, 0x1300] {
        assert_eq!(
            ds.get_function(f).unwrap().stack_delta(),
            StackDelta::Known(0)
        );
    }
    let pdg = ds.function_pdg(0x1000).unwrap();
    let (cbranch, _) = ds.engine().il_range_for_machine_address(0x100b).unwrap();
    // The comparison feeding the branch and the branch itself
    assert!(pdg.in_slice(cbranch));
    assert!(pdg.in_slice(cbranch + 1));
    assert!(ds.call_graph().to_dot().contains("digraph"));
}

#[test]
fn dependency_graph_links_branches_and_calls() {
    let ds = compound_condition_descriptors(AnalysisConfig::default());
    ds.analyze_functions();
    let engine = ds.engine();
    let il = |a: u64| engine.il_range_for_machine_address(a).unwrap().0;
    let pdg = ds.function_pdg(0x1000).unwrap();
    let first_branch = il(0x100b) + 1;
    let second_branch = il(0x1010) + 1;
    assert!(pdg.data_dependencies(first_branch).contains(&il(0x100b)));
    assert!(pdg.data_dependencies(il(0x100b)).contains(&(il(0x1008) + 1)));
    assert!(pdg.control_dependencies(il(0x1010)).contains(&first_branch));
    assert!(pdg
        .control_dependencies(il(0x1030) + 2)
        .contains(&second_branch));
    assert!(pdg.control_dependencies(il(0x1060)).is_empty());
    assert!(pdg.to_dot(|n| n.to_string()).contains("Pdg_1000"));

    let whole = ds.program_pdg();
    assert!(whole.call_edges.contains(&(il(0x1003) + 2, il(0x1100))));
    assert!(whole.successors(il(0x1003) + 2).contains(&il(0x1100)));
}

#[test]
fn source_equal_to_target_is_trivially_reachable() {
    let ds = compound_condition_descriptors(AnalysisConfig::default());
    let mut finder = PathFinder::new(&ds, Engine::Bounded);
    let r = finder.find_path_hierarchical(0x1010, 0x1010).unwrap();
    match &r.verdict {
        Verdict::Sat(w) => assert!(w.steps.is_empty()),
        v => panic!("expected sat, got {:?}", v),
    }
    assert_eq!(r.cycles, 1);
    assert_eq!(finder.state(), &FinderState::Finished(r.verdict.clone()));
}

#[test]
fn control_flow_unreachable_target_is_unsat() {
    let ds = compound_condition_descriptors(AnalysisConfig::default());
    let mut finder = PathFinder::new(&ds, Engine::Bounded);
    // From the `bad` call there is no way back to the `goal` call
    let r = finder.find_path_hierarchical(0x1040, 0x1030).unwrap();
    assert_eq!(r.verdict, Verdict::Unsat);
    assert_eq!(r.cycles, 1);
    assert!(r.answer.is_some());
}

#[test]
fn compound_condition_is_satisfiable() {
    let ds = compound_condition_descriptors(AnalysisConfig::default());
    ds.analyze_functions();
    let mut finder = PathFinder::new(&ds, Engine::Bounded);
    let r = finder.find_path_hierarchical(0x1000, 0x1030).unwrap();
    let w = match &r.verdict {
        Verdict::Sat(w) => w,
        v => panic!("expected sat, got {:?}", v),
    };
    // `path_start` has to be inlined before the argument is known to survive the call
    assert_eq!(r.level, 1);
    assert_eq!(w.steps.last(), Some(&0x1030));
    assert_eq!(w.used_abstraction, Some(false));
    let (_, n) = w
        .inputs
        .iter()
        .find(|(name, _)| name.starts_with("mem_0["))
        .unwrap();
    assert!(*n > 2 && *n < 10, "n = {}", n);
    assert!(r.encoding_text.contains("(query goal)"));
}

#[test]
fn caller_precondition_makes_target_unreachable() {
    let ds = compound_condition_descriptors(AnalysisConfig::default());
    ds.analyze_functions();
    let mut finder = PathFinder::new(&ds, Engine::Bounded);
    let r = finder.find_path_hierarchical(0x1300, 0x1210).unwrap();
    assert_eq!(r.verdict, Verdict::Unsat);
    assert_eq!(r.level, 2);
    assert_eq!(r.cycles, 3);
}

#[test]
fn target_in_the_caller_after_a_return_is_reachable() {
    let ds = compound_condition_descriptors(AnalysisConfig::default());
    ds.analyze_functions();
    let mut finder = PathFinder::new(&ds, Engine::Bounded);
    // `func` returns into `main` right after `call func`
    let r = finder.find_path_hierarchical(0x1000, 0x1316).unwrap();
    let w = match &r.verdict {
        Verdict::Sat(w) => w,
        v => panic!("expected sat, got {:?}", v),
    };
    assert_eq!(r.level, 1);
    assert_eq!(w.used_abstraction, Some(false));
    assert_eq!(w.steps.last(), Some(&0x1316));
    assert!(r.encoding_text.contains("returned through [0x1311]"));
}

#[test]
fn callee_invoked_after_the_source_returns_is_reachable() {
    let ds = compound_condition_descriptors(AnalysisConfig::default());
    ds.analyze_functions();
    let mut finder = PathFinder::new(&ds, Engine::Bounded);
    // `path_start` returns into `func`, which goes on to call `goal`
    let r = finder.find_path_hierarchical(0x1100, 0x1200).unwrap();
    let w = match &r.verdict {
        Verdict::Sat(w) => w,
        v => panic!("expected sat, got {:?}", v),
    };
    assert_eq!(r.level, 1);
    assert_eq!(w.used_abstraction, Some(false));
    assert_eq!(w.steps.last(), Some(&0x1200));
}

#[test]
fn returning_to_unknown_callers_is_never_unsat() {
    // With the indirect call left unresolved, any function may have callers nobody knows
    let config = AnalysisConfig {
        resolve_indirect_calls_through_import_slots: false,
        refinement_budget: 2,
        ..AnalysisConfig::default()
    };
    let ds = compound_condition_descriptors(config);
    let mut finder = PathFinder::new(&ds, Engine::Bounded);
    let r = finder.find_path_hierarchical(0x1040, 0x1030).unwrap();
    assert!(r.verdict.is_unknown(), "{:?}", r.verdict);
    assert_eq!(r.cycles, 2);
}

#[test]
fn refinement_respects_the_budget() {
    for budget in 1..=4 {
        let config = AnalysisConfig {
            refinement_budget: budget,
            ..AnalysisConfig::default()
        };
        let ds = compound_condition_descriptors(config);
        let mut finder = PathFinder::new(&ds, Engine::Bounded);
        let r = finder.find_path_hierarchical(0x1300, 0x1210).unwrap();
        assert!(r.cycles <= budget);
        if budget < 3 {
            assert!(r.verdict.is_unknown(), "budget {}: {:?}", budget, r.verdict);
        } else {
            assert_eq!(r.verdict, Verdict::Unsat);
        }
    }
}

#[test]
fn addresses_outside_functions_are_rejected() {
    let ds = compound_condition_descriptors(AnalysisConfig::default());
    let mut finder = PathFinder::new(&ds, Engine::Bounded);
    assert!(matches!(
        finder.find_path_hierarchical(0x9999, 0x1030),
        Err(PathFinderError::Config(ConfigError::AddressNotInFunction {
            which: "source",
            address: 0x9999
        }))
    ));
    assert!(matches!(
        finder.find_path_hierarchical(0x1000, 0x1002),
        Err(PathFinderError::Config(ConfigError::AddressNotInFunction {
            which: "target",
            ..
        }))
    ));
    assert_eq!(finder.state(), &FinderState::Unstarted);
}
