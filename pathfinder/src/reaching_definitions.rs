//! [`DataFlow`](crate::dataflow::DataFlow) equations for the reaching-definitions analysis.

use std::rc::Rc;

use crate::containers::unordered::{UnorderedMap, UnorderedSet};
use crate::dataflow::{DataFlowElement, FunctionSummary, ProgPoint};
use crate::engine::DefUseLocation;

/// Effects of the calls inside a function, as seen from the caller.
#[derive(Debug, Default)]
pub struct CallEffects {
    /// Locations each call (by IL address) may redefine. Calls not listed here redefine nothing.
    pub clobbered: UnorderedMap<usize, Vec<DefUseLocation>>,
}

#[derive(PartialEq, Clone)]
// PERF: This is going to be a quite inefficient representation. Might be good to use a `Cow` or
// similar to reduce the number of copies held around?
#[derive(Debug)]
/// Reaching definitions at a specific IL instruction.
pub struct ReachingDefinitionsElement {
    /// A map of locations to the set of definition points that reach it.
    pub defs: UnorderedMap<DefUseLocation, Rc<UnorderedSet<ProgPoint>>>,
}

impl ReachingDefinitionsElement {
    fn kill_and_define(&mut self, loc: DefUseLocation, at: usize) {
        match loc {
            DefUseLocation::Fixed(_) => {
                self.defs
                    .insert(loc, Rc::new(std::iter::once(ProgPoint::Insn(at)).collect()));
            }
            // A write through a computed address may leave any other memory byte untouched, so
            // older memory definitions keep reaching.
            DefUseLocation::IndirectMemory => {
                let d = self.defs.entry(loc).or_insert_with(Default::default);
                let mut s: UnorderedSet<ProgPoint> = d.iter().cloned().collect();
                s.insert(ProgPoint::Insn(at));
                *d = Rc::new(s);
            }
        }
    }

    /// Definition points reaching `loc`
    pub fn reaching(&self, loc: &DefUseLocation) -> impl Iterator<Item = &ProgPoint> {
        self.defs.get(loc).into_iter().flat_map(|s| s.iter())
    }
}

impl DataFlowElement for ReachingDefinitionsElement {
    type Context = CallEffects;

    /// Initially, all reaching definitions start out empty.
    fn init() -> Self {
        Self {
            defs: Default::default(),
        }
    }

    /// Joining two reaching definitions consists of taking the union on all definitions.
    fn join_from(&mut self, other: &Self) {
        for (d, s) in other.defs.iter() {
            let def_d = self.defs.entry(*d).or_insert_with(Default::default);
            *def_d = Rc::new(def_d.union(s).cloned().collect());
        }
    }

    /// Every location the function mentions is defined by the caller on entry.
    fn init_func_start(summary: &FunctionSummary, _ctx: &CallEffects) -> Self {
        let entry: Rc<UnorderedSet<ProgPoint>> =
            Rc::new(std::iter::once(ProgPoint::FunctionEntry).collect());
        Self {
            defs: summary
                .all_variables
                .iter()
                .map(|&v| DefUseLocation::Fixed(v))
                .chain(std::iter::once(DefUseLocation::IndirectMemory))
                .map(|v| (v, entry.clone()))
                .collect(),
        }
    }

    /// An instruction transfers reaching definitions by killing all over-ridden values in the
    /// output, replacing it with the current definition. All other definitions stay the same.
    fn transfer_function(&self, ins: usize, summary: &FunctionSummary, ctx: &CallEffects) -> Self {
        // OUT[n] = GEN[n] Union (IN[n] -KILL[n]);
        let mut ret = self.clone();

        if let Some(clobbered) = ctx.clobbered.get(&ins) {
            for &loc in clobbered {
                ret.kill_and_define(loc, ins);
            }
        }

        if let Some(du) = summary.def_use.get(&ins) {
            for &d in &du.defs {
                ret.kill_and_define(d, ins);
            }
        }
        ret
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::dataflow::DataFlow;
    use crate::engine::RegisterFile;
    use crate::il::{Endian, Instruction, Op, Program, Variable};

    #[test]
    fn redefinition_kills_and_calls_clobber() {
        let rf = RegisterFile::x86();
        let eax = rf.varnode("EAX").unwrap();
        let ecx = rf.varnode("ECX").unwrap();
        let c = |v| Variable::Constant { value: v, size: 4 };
        let mut prog = Program::new(rf.clone(), Endian::Little);
        prog.begin_function("f", 0x10);
        prog.add_one_machine_instruction(vec![Instruction::new(
            0x10,
            Op::Copy,
            eax.clone(),
            [c(1), Variable::Unused],
        )]);
        prog.add_one_machine_instruction(vec![Instruction::new(
            0x11,
            Op::Copy,
            ecx.clone(),
            [eax.clone(), Variable::Unused],
        )]);
        prog.add_one_machine_instruction(vec![Instruction::new(
            0x12,
            Op::CallWithFallthrough,
            Variable::Unused,
            [Variable::MachineAddress { addr: 0x99 }, Variable::Unused],
        )]);
        prog.add_one_machine_instruction(vec![Instruction::new(
            0x13,
            Op::Copy,
            eax.clone(),
            [ecx.clone(), Variable::Unused],
        )]);
        prog.end_function();

        let summary = FunctionSummary::compute(&prog, 0);
        let mut effects = CallEffects::default();
        effects.clobbered.insert(
            2,
            vec![DefUseLocation::Fixed(rf.location("ECX").unwrap())],
        );
        let rd = DataFlow::<ReachingDefinitionsElement>::forward_analyze(&summary, &effects);

        let ecx_loc = DefUseLocation::Fixed(rf.location("ECX").unwrap());
        let eax_loc = DefUseLocation::Fixed(rf.location("EAX").unwrap());
        let at3 = rd.ins.get(&3).unwrap();
        assert_eq!(
            at3.reaching(&ecx_loc).cloned().collect::<Vec<_>>(),
            vec![ProgPoint::Insn(2)]
        );
        assert_eq!(
            at3.reaching(&eax_loc).cloned().collect::<Vec<_>>(),
            vec![ProgPoint::Insn(0)]
        );
        let at0 = rd.ins.get(&0).unwrap();
        assert_eq!(
            at0.reaching(&eax_loc).cloned().collect::<Vec<_>>(),
            vec![ProgPoint::FunctionEntry]
        );
    }
}
