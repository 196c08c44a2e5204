//! Program dependency graphs.
//!
//! Nodes are IL addresses. A data edge `d -> u` means a definition at `d` reaches a use at `u`; a
//! control edge `b -> n` means whether `n` executes is decided by branch `b`.

use std::collections::{BTreeMap, BTreeSet};

use petgraph::algo::dominators;
use petgraph::graphmap::DiGraphMap;

use crate::dataflow::{DataFlow, FunctionSummary, ProgPoint};
use crate::engine::DefUseLocation;
use crate::il::{Op, RAM_SPACE};
use crate::reaching_definitions::ReachingDefinitionsElement;

/// Labels of a dependency edge
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Dependency {
    pub data: bool,
    pub control: bool,
}

/// Sentinel for the virtual exit of the post-dominator computation
const VIRTUAL_EXIT: usize = usize::MAX;

/// The dependency graph of one function.
#[derive(Debug)]
pub struct FunctionPdg {
    pub function: u64,
    pub entry: usize,
    nodes: Vec<usize>,
    edges: BTreeMap<(usize, usize), Dependency>,
    slice: BTreeSet<usize>,
}

impl FunctionPdg {
    /// Build from a function summary and its reaching definitions.
    pub fn build(
        function: u64,
        summary: &FunctionSummary,
        rd: &DataFlow<ReachingDefinitionsElement>,
    ) -> Self {
        let mut r = Self {
            function,
            entry: summary.entry,
            nodes: summary.il_addrs.clone(),
            edges: BTreeMap::new(),
            slice: BTreeSet::new(),
        };
        r.add_data_edges(summary, rd);
        r.add_control_edges(summary);
        r.slice = r.compute_slice(summary);
        r
    }

    fn add_edge(&mut self, from: usize, to: usize, data: bool) {
        let e = self.edges.entry((from, to)).or_default();
        if data {
            e.data = true;
        } else {
            e.control = true;
        }
    }

    fn add_data_edges(&mut self, summary: &FunctionSummary, rd: &DataFlow<ReachingDefinitionsElement>) {
        for &n in &summary.il_addrs {
            let rd_in = match rd.ins.get(&n) {
                Some(r) => r,
                None => continue,
            };
            let op = summary.engine.instruction(n).map(|i| i.op);
            // Calls and returns hand every live value to code outside this function.
            let uses: Vec<DefUseLocation> = if matches!(op, Some(o) if o.is_call() || o == Op::Return)
            {
                rd_in.defs.keys().cloned().collect()
            } else {
                summary
                    .def_use
                    .get(&n)
                    .map(|du| du.uses.clone())
                    .unwrap_or_default()
            };
            let mut sources: Vec<usize> = vec![];
            for u in &uses {
                for p in rd_in.reaching(u) {
                    if let ProgPoint::Insn(d) = p {
                        sources.push(*d);
                    }
                }
            }
            for d in sources {
                self.add_edge(d, n, true);
            }
        }
    }

    /// Control dependence from post-dominance on the reversed control-flow graph
    fn add_control_edges(&mut self, summary: &FunctionSummary) {
        let mut reversed: DiGraphMap<usize, ()> = DiGraphMap::new();
        reversed.add_node(VIRTUAL_EXIT);
        for &n in &summary.il_addrs {
            reversed.add_node(n);
            for &s in summary.successors.get(&n).into_iter().flatten() {
                reversed.add_edge(s, n, ());
            }
        }
        for e in summary.exits() {
            reversed.add_edge(VIRTUAL_EXIT, e, ());
        }
        let pdom = dominators::simple_fast(&reversed, VIRTUAL_EXIT);

        let mut control: Vec<(usize, usize)> = vec![];
        for &a in &summary.il_addrs {
            let succs = match summary.successors.get(&a) {
                Some(s) if s.len() > 1 => s,
                _ => continue,
            };
            let stop = match pdom.immediate_dominator(a) {
                Some(p) => p,
                None => continue,
            };
            for &b in succs {
                let mut runner = b;
                while runner != stop && runner != VIRTUAL_EXIT {
                    control.push((a, runner));
                    runner = match pdom.immediate_dominator(runner) {
                        Some(p) => p,
                        None => break,
                    };
                }
            }
        }
        for (a, b) in control {
            self.add_edge(a, b, false);
        }
    }

    fn is_slice_root(summary: &FunctionSummary, n: usize) -> bool {
        let ins = match summary.engine.instruction(n) {
            Some(i) => i,
            None => return false,
        };
        match ins.op {
            Op::Cbranch
            | Op::Branch
            | Op::Return
            | Op::Store
            | Op::ProcessorException
            | Op::CallWithFallthrough
            | Op::CallWithFallthroughIndirect
            | Op::CallWithNoFallthrough => true,
            _ => ins.output.global_address().is_some()
                || matches!(ins.output.try_to_aslocation(), Some(l) if l.address_space_idx == RAM_SPACE),
        }
    }

    fn compute_slice(&self, summary: &FunctionSummary) -> BTreeSet<usize> {
        let mut incoming: BTreeMap<usize, Vec<usize>> = BTreeMap::new();
        for &(a, b) in self.edges.keys() {
            incoming.entry(b).or_default().push(a);
        }
        let mut slice = BTreeSet::new();
        let mut worklist: Vec<usize> = self
            .nodes
            .iter()
            .cloned()
            .filter(|&n| Self::is_slice_root(summary, n))
            .collect();
        while let Some(n) = worklist.pop() {
            if !slice.insert(n) {
                continue;
            }
            worklist.extend(incoming.get(&n).into_iter().flatten().cloned());
        }
        slice
    }

    pub fn nodes(&self) -> &[usize] {
        &self.nodes
    }

    pub fn contains(&self, n: usize) -> bool {
        self.nodes.binary_search(&n).is_ok()
    }

    pub fn edges(&self) -> impl Iterator<Item = (usize, usize, Dependency)> + '_ {
        self.edges.iter().map(|(&(a, b), &d)| (a, b, d))
    }

    pub fn dependency(&self, from: usize, to: usize) -> Option<Dependency> {
        self.edges.get(&(from, to)).cloned()
    }

    pub fn data_dependencies(&self, n: usize) -> Vec<usize> {
        self.edges
            .iter()
            .filter(|((_, b), d)| *b == n && d.data)
            .map(|((a, _), _)| *a)
            .collect()
    }

    pub fn control_dependencies(&self, n: usize) -> Vec<usize> {
        self.edges
            .iter()
            .filter(|((_, b), d)| *b == n && d.control)
            .map(|((a, _), _)| *a)
            .collect()
    }

    /// Instructions that side effects, branches, calls, or returns transitively depend upon
    pub fn slice(&self) -> &BTreeSet<usize> {
        &self.slice
    }

    pub fn in_slice(&self, n: usize) -> bool {
        self.slice.contains(&n)
    }

    /// Render as graphviz, labelling nodes with `label`
    pub fn to_dot(&self, label: impl Fn(usize) -> String) -> String {
        type Edge = (usize, usize, Dependency);
        struct G<'a, F: Fn(usize) -> String> {
            pdg: &'a FunctionPdg,
            label: F,
        }

        impl<'a, F: Fn(usize) -> String> dot::Labeller<'a, usize, Edge> for G<'a, F> {
            fn graph_id(&'a self) -> dot::Id<'a> {
                dot::Id::new(format!("Pdg_{:x}", self.pdg.function)).unwrap()
            }
            fn node_id(&'a self, n: &usize) -> dot::Id<'a> {
                dot::Id::new(format!("n{}", n)).unwrap()
            }
            fn node_label<'b>(&'b self, n: &usize) -> dot::LabelText<'b> {
                dot::LabelText::label((self.label)(*n))
            }
            fn edge_label<'b>(&'b self, e: &Edge) -> dot::LabelText<'b> {
                dot::LabelText::label(match (e.2.data, e.2.control) {
                    (true, true) => "data+control",
                    (true, false) => "data",
                    _ => "control",
                })
            }
            fn edge_style(&'a self, e: &Edge) -> dot::Style {
                if e.2.data {
                    dot::Style::Solid
                } else {
                    dot::Style::Dashed
                }
            }
        }

        impl<'a, F: Fn(usize) -> String> dot::GraphWalk<'a, usize, Edge> for G<'a, F> {
            fn nodes(&self) -> dot::Nodes<'a, usize> {
                self.pdg.nodes.clone().into()
            }
            fn edges(&'a self) -> dot::Edges<'a, Edge> {
                self.pdg.edges().collect::<Vec<_>>().into()
            }
            fn source(&self, e: &Edge) -> usize {
                e.0
            }
            fn target(&self, e: &Edge) -> usize {
                e.1
            }
        }

        let mut s: Vec<u8> = vec![];
        let _ = dot::render(&G { pdg: self, label }, &mut s);
        String::from_utf8_lossy(&s).into_owned()
    }
}

/// The whole-program dependency graph: the union of per-function graphs joined at resolved call
/// sites (call node to callee entry).
#[derive(Debug, Default)]
pub struct ProgramDependencyGraph {
    pub functions: BTreeMap<u64, std::sync::Arc<FunctionPdg>>,
    /// `(call IL address, callee entry IL address)`
    pub call_edges: BTreeSet<(usize, usize)>,
}

impl ProgramDependencyGraph {
    pub fn node_count(&self) -> usize {
        self.functions.values().map(|p| p.nodes().len()).sum()
    }

    pub fn edge_count(&self) -> usize {
        self.functions.values().map(|p| p.edges.len()).sum::<usize>() + self.call_edges.len()
    }

    /// Direct successors of IL node `n` across function boundaries
    pub fn successors(&self, n: usize) -> Vec<usize> {
        let mut v: Vec<usize> = self
            .functions
            .values()
            .filter(|p| p.contains(n))
            .flat_map(|p| p.edges().filter(move |(a, _, _)| *a == n).map(|(_, b, _)| b))
            .collect();
        v.extend(
            self.call_edges
                .iter()
                .filter(|(a, _)| *a == n)
                .map(|(_, b)| *b),
        );
        v.sort_unstable();
        v.dedup();
        v
    }
}
