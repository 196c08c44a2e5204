//! Stack-delta estimation.
//!
//! A function's stack delta is the number of bytes it releases from its caller's stack beyond the
//! return address: zero for cdecl-like functions, the size of the stack arguments for
//! stdcall-like functions. It is found by tracking which locations hold the entry stack pointer
//! plus a known constant.

use std::collections::BTreeMap;

use crate::containers::unordered::UnorderedMap;
use crate::dataflow::{ASLocation, DataFlow, DataFlowElement, FunctionSummary};
use crate::il::{Op, Variable};
use crate::log::*;

/// The stack delta of a function or import.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum StackDelta {
    Unknown,
    Known(i64),
}

impl StackDelta {
    pub fn is_known(&self) -> bool {
        matches!(self, StackDelta::Known(_))
    }

    pub fn known(&self) -> Option<i64> {
        match self {
            StackDelta::Known(d) => Some(*d),
            StackDelta::Unknown => None,
        }
    }
}

impl std::fmt::Display for StackDelta {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            StackDelta::Unknown => write!(f, "unknown"),
            StackDelta::Known(d) => write!(f, "{}", d),
        }
    }
}

/// What the stack-delta analysis needs to know about the function's surroundings.
#[derive(Debug)]
pub struct StackContext {
    pub stack_pointer: ASLocation,
    pub word_size: usize,
    /// Stack delta of the callee of each call (by IL address)
    pub callee_deltas: UnorderedMap<usize, StackDelta>,
    /// Locations each call may clobber, besides the stack pointer
    pub clobbered: UnorderedMap<usize, Vec<ASLocation>>,
}

/// Locations known to hold `entry stack pointer + offset`.
#[derive(Clone, Debug, PartialEq)]
pub struct StackOffsets {
    reached: bool,
    pub offsets: BTreeMap<ASLocation, i64>,
}

fn sign_extend(value: u64, size: usize) -> i64 {
    if size >= 8 {
        value as i64
    } else {
        let shift = 64 - 8 * size as u32;
        ((value << shift) as i64) >> shift
    }
}

impl StackOffsets {
    fn offset_of(&self, v: &Variable) -> Option<i64> {
        match v {
            Variable::Varnode { .. } => self.offsets.get(&v.try_to_aslocation()?).cloned(),
            _ => None,
        }
    }

    pub fn stack_pointer_offset(&self, ctx: &StackContext) -> Option<i64> {
        self.offsets.get(&ctx.stack_pointer).cloned()
    }
}

impl DataFlowElement for StackOffsets {
    type Context = StackContext;

    fn init() -> Self {
        Self {
            reached: false,
            offsets: BTreeMap::new(),
        }
    }

    /// Keep only facts both sides agree upon. An unreached side contributes nothing.
    fn join_from(&mut self, other: &Self) {
        if !other.reached {
            return;
        }
        if !self.reached {
            *self = other.clone();
            return;
        }
        self.offsets
            .retain(|k, v| other.offsets.get(k) == Some(v));
    }

    fn init_func_start(_summary: &FunctionSummary, ctx: &StackContext) -> Self {
        Self {
            reached: true,
            offsets: std::iter::once((ctx.stack_pointer, 0)).collect(),
        }
    }

    fn transfer_function(&self, ins: usize, summary: &FunctionSummary, ctx: &StackContext) -> Self {
        let mut ret = self.clone();
        if !ret.reached {
            return ret;
        }
        let insn = match summary.engine.instruction(ins) {
            Some(i) => i,
            None => return ret,
        };

        if insn.op.is_call() {
            for l in ctx.clobbered.get(&ins).into_iter().flatten() {
                ret.offsets.remove(l);
            }
            let adjust = match ctx.callee_deltas.get(&ins) {
                Some(StackDelta::Known(d)) => Some(ctx.word_size as i64 + d),
                _ => None,
            };
            match (ret.offsets.get(&ctx.stack_pointer).cloned(), adjust) {
                (Some(sp), Some(a)) => {
                    ret.offsets.insert(ctx.stack_pointer, sp + a);
                }
                _ => {
                    ret.offsets.remove(&ctx.stack_pointer);
                }
            }
            return ret;
        }

        let out = match insn.output.try_to_aslocation() {
            Some(o) if matches!(insn.output, Variable::Varnode { .. }) => o,
            _ => return ret,
        };
        let constant = |v: &Variable| match v {
            Variable::Constant { value, size } => Some(sign_extend(*value, *size)),
            _ => None,
        };
        let [i0, i1] = &insn.inputs;
        let new = match insn.op {
            Op::Copy => self.offset_of(i0),
            Op::IntAdd => match (self.offset_of(i0), constant(i1), constant(i0), self.offset_of(i1))
            {
                (Some(o), Some(c), _, _) | (_, _, Some(c), Some(o)) => Some(o + c),
                _ => None,
            },
            Op::IntSub => match (self.offset_of(i0), constant(i1)) {
                (Some(o), Some(c)) => Some(o - c),
                _ => None,
            },
            _ => None,
        };
        match new {
            Some(n) => {
                ret.offsets.insert(out, n);
            }
            None => {
                ret.offsets.remove(&out);
            }
        }
        ret
    }
}

/// Estimate the stack delta of the summarized function.
pub fn estimate(summary: &FunctionSummary, ctx: &StackContext) -> StackDelta {
    let df = DataFlow::<StackOffsets>::forward_analyze(summary, ctx);
    let mut delta: Option<i64> = None;
    for &i in &summary.il_addrs {
        let is_return = summary
            .engine
            .instruction(i)
            .map(|ins| ins.op == Op::Return)
            .unwrap_or(false);
        if !is_return {
            continue;
        }
        let at_return = match df.ins.get(&i) {
            Some(s) if s.reached => s,
            // Unreachable return
            _ => continue,
        };
        let d = match at_return.stack_pointer_offset(ctx) {
            Some(sp) => sp - ctx.word_size as i64,
            None => {
                debug!("Stack pointer unknown at return"; "ilpc" => i);
                return StackDelta::Unknown;
            }
        };
        match delta {
            None => delta = Some(d),
            Some(prev) if prev == d => {}
            Some(prev) => {
                debug!(
                    "Paths disagree on the stack delta";
                    "function" => summary.function, "first" => prev, "second" => d,
                );
                return StackDelta::Unknown;
            }
        }
    }
    delta.map(StackDelta::Known).unwrap_or(StackDelta::Unknown)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::engine::RegisterFile;
    use crate::il::{Endian, Instruction, Program};

    /// `push ebp; mov ebp, esp; pop ebp; ret 8`
    fn stdcall_like() -> Program {
        let rf = RegisterFile::x86();
        let esp = rf.varnode("ESP").unwrap();
        let ebp = rf.varnode("EBP").unwrap();
        let tmp = Variable::Varnode {
            address_space_idx: crate::il::UNIQUE_SPACE,
            offset: 0,
            size: 4,
        };
        let at_esp = Variable::DerefVarnode {
            derefval_address_space_idx: crate::il::RAM_SPACE,
            derefval_size: 4,
            addr_address_space_idx: crate::il::REGISTER_SPACE,
            addr_offset: 0x10,
        };
        let c = |v| Variable::Constant { value: v, size: 4 };
        let mut prog = Program::new(rf, Endian::Little);
        prog.begin_function("f", 0x10);
        prog.add_one_machine_instruction(vec![
            Instruction::new(0x10, Op::IntSub, esp.clone(), [esp.clone(), c(4)]),
            Instruction::new(0x10, Op::Store, Variable::Unused, [at_esp.clone(), ebp.clone()]),
        ]);
        prog.add_one_machine_instruction(vec![Instruction::new(
            0x11,
            Op::Copy,
            ebp.clone(),
            [esp.clone(), Variable::Unused],
        )]);
        prog.add_one_machine_instruction(vec![
            Instruction::new(0x13, Op::Load, ebp.clone(), [at_esp.clone(), Variable::Unused]),
            Instruction::new(0x13, Op::IntAdd, esp.clone(), [esp.clone(), c(4)]),
        ]);
        prog.add_one_machine_instruction(vec![
            Instruction::new(0x14, Op::Load, tmp.clone(), [at_esp, Variable::Unused]),
            Instruction::new(0x14, Op::IntAdd, esp.clone(), [esp, c(12)]),
            Instruction::new(0x14, Op::Return, Variable::Unused, [tmp, Variable::Unused]),
        ]);
        prog.end_function();
        prog
    }

    #[test]
    fn stdcall_releases_its_arguments() {
        let prog = stdcall_like();
        let rf = RegisterFile::x86();
        let summary = FunctionSummary::compute(&prog, 0);
        let ctx = StackContext {
            stack_pointer: rf.stack_pointer_location().unwrap(),
            word_size: 4,
            callee_deltas: Default::default(),
            clobbered: Default::default(),
        };
        assert_eq!(estimate(&summary, &ctx), StackDelta::Known(8));
    }

    #[test]
    fn negative_constants_are_sign_extended() {
        assert_eq!(sign_extend(0xffff_fffc, 4), -4);
        assert_eq!(sign_extend(4, 4), 4);
    }
}
