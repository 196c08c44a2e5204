//! Compute data flow across a single function of a [`RecoveryEngine`]

use crate::containers::unordered::{UnorderedMap, UnorderedSet};
use crate::engine::{DefUse, DefUseLocation, RecoveryEngine};
use crate::log::*;
use std::collections::VecDeque;

/// A pointer into some address space.
#[derive(Clone, Copy, PartialOrd, Ord, PartialEq, Eq, Hash)]
pub struct ASLocation {
    /// An index into the program's address spaces
    pub address_space_idx: usize,
    /// An offset into the address space
    pub offset: usize,
}
impl std::fmt::Debug for ASLocation {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        let ASLocation {
            address_space_idx,
            offset,
        } = self;
        write!(f, "ASLocation(as={}, off={:#x})", address_space_idx, offset)
    }
}

#[derive(PartialEq, PartialOrd, Ord, Eq, Clone, Copy, Hash)]
/// Different program points to refer to points in the program, as well as their predecessors and
/// successors.
pub enum ProgPoint {
    /// Values live on entry to the function, defined by its caller
    FunctionEntry,
    Insn(usize),
}
impl std::fmt::Debug for ProgPoint {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            ProgPoint::FunctionEntry => write!(f, "Entry"),
            ProgPoint::Insn(n) => write!(f, "Insn({})", n),
        }
    }
}

/// A summary of a single function, keeping track of inputs, outputs, predecessors, and successors
/// of each of its IL instructions.
pub struct FunctionSummary<'a> {
    pub engine: &'a dyn RecoveryEngine,
    /// Index into the engine's functions
    pub function: usize,
    /// IL address of the function's entry point
    pub entry: usize,
    /// All IL addresses of the function, in increasing order
    pub il_addrs: Vec<usize>,
    pub predecessors: UnorderedMap<usize, UnorderedSet<usize>>,
    pub successors: UnorderedMap<usize, Vec<usize>>,
    pub def_use: UnorderedMap<usize, DefUse>,
    /// Every location with a fixed address the function mentions
    pub all_variables: UnorderedSet<ASLocation>,
}

impl<'a> FunctionSummary<'a> {
    /// Compute a summary of function number `function` of the `engine`
    pub fn compute(engine: &'a dyn RecoveryEngine, function: usize) -> Self {
        let info = &engine.functions()[function];
        let mut il_addrs: Vec<usize> = info
            .basic_blocks
            .iter()
            .filter_map(|&bb| engine.basic_block(bb))
            .flat_map(|bb| bb.iter().cloned())
            .collect();
        il_addrs.sort_unstable();

        let mut r = Self {
            engine,
            function,
            entry: info.entry_il,
            il_addrs: vec![],
            predecessors: Default::default(),
            successors: Default::default(),
            def_use: Default::default(),
            all_variables: Default::default(),
        };

        for &i in &il_addrs {
            r.predecessors.entry(i).or_insert_with(Default::default);
        }
        for &i in &il_addrs {
            let succs: Vec<usize> = engine
                .successors(i)
                .into_iter()
                .filter(|s| {
                    let same = engine.function_containing(*s) == Some(function);
                    if !same {
                        debug!(
                            "Found branch across functions, ignoring in successor/predecessor calculation";
                            "from" => i,
                            "to" => *s,
                        );
                    }
                    same
                })
                .collect();
            for &s in &succs {
                r.predecessors
                    .entry(s)
                    .or_insert_with(Default::default)
                    .insert(i);
            }
            r.successors.insert(i, succs);

            let du = engine.def_use(i);
            for loc in du.defs.iter().chain(du.uses.iter()) {
                if let DefUseLocation::Fixed(l) = loc {
                    r.all_variables.insert(*l);
                }
            }
            r.def_use.insert(i, du);
        }
        r.il_addrs = il_addrs;
        r
    }

    /// Instructions without any intra-procedural successor
    pub fn exits(&self) -> Vec<usize> {
        self.il_addrs
            .iter()
            .cloned()
            .filter(|i| self.successors.get(i).map(|s| s.is_empty()).unwrap_or(true))
            .collect()
    }

    pub fn contains(&self, il_addr: usize) -> bool {
        self.successors.contains_key(&il_addr)
    }
}

/// A single element in the data-flow analysis. Each instruction in the function holds on to one
/// member of this element.
///
/// The definition of this element is crucial to defining the entire data flow, since it also
/// defines the expected transfer function for the data flow.
pub trait DataFlowElement: PartialEq + Clone {
    /// Facts about the surroundings of the function (e.g., effects of its callees) needed by the
    /// transfer function.
    type Context;

    /// The initial/default value to start at.
    fn init() -> Self;
    /// The join operator, when joining outs from different predecessors.
    ///
    /// Satisfies property `a.join_from(init())` keeps `a` unmodified.
    fn join_from(&mut self, other: &Self);

    /// The value flowing into the function's entry point from its callers
    fn init_func_start(summary: &FunctionSummary, ctx: &Self::Context) -> Self;

    /// The transfer function that (along with the init and join) defines the specific kind of data
    /// flow analysis at play.
    fn transfer_function(&self, ins: usize, summary: &FunctionSummary, ctx: &Self::Context) -> Self;
}

/// Results of a data flow analysis. Uses the definition of the [`DataFlowElement`] to define the
/// type of analysis.
#[derive(Debug)]
pub struct DataFlow<T: DataFlowElement> {
    pub outs: UnorderedMap<usize, T>,
    pub ins: UnorderedMap<usize, T>,
}

impl<T: DataFlowElement> DataFlow<T> {
    /// Perform a forwards analysis of the data flow of the summarized function
    ///
    /// Uses the worklist algorithm to compute data flow
    pub fn forward_analyze(summary: &FunctionSummary, ctx: &T::Context) -> Self {
        let outs: UnorderedMap<usize, T> = summary
            .il_addrs
            .iter()
            .cloned()
            .map(|il_addr| (il_addr, T::init()))
            .collect();
        let ins = outs.clone();

        let mut r = Self { outs, ins };

        let mut changed: VecDeque<usize> = summary.il_addrs.iter().cloned().collect();

        while let Some(n) = changed.pop_front() {
            let mut in_n = T::init();
            if n == summary.entry {
                in_n.join_from(&T::init_func_start(summary, ctx));
            }
            let preds = summary.predecessors.get(&n);
            if n != summary.entry && preds.map(|p| p.is_empty()).unwrap_or(true) {
                trace!(
                    "Non-entry instruction found to not have predecessor";
                    "ilpc" => n,
                    "ins" => ?summary.engine.instruction(n),
                );
            }
            for p in preds.into_iter().flatten() {
                if let Some(o) = r.outs.get(p) {
                    in_n.join_from(o);
                }
            }

            let new_out = in_n.transfer_function(n, summary, ctx);
            r.ins.insert(n, in_n);
            let old_out = r.outs.insert(n, new_out);

            if old_out.as_ref() != r.outs.get(&n) {
                for &s in summary.successors.get(&n).into_iter().flatten() {
                    changed.push_back(s);
                }
            }
        }

        r
    }
}
