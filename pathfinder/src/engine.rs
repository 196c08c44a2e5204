//! The capability interface through which the analyses consume a recovery engine's output.
//!
//! Anything able to answer instruction, basic-block, function-partition, def/use, and
//! register-file queries can drive the [`DescriptorSet`](crate::descriptors::DescriptorSet). The
//! in-memory [`Program`] is the implementation shipped with this crate.

use crate::dataflow::ASLocation;
use crate::il::{
    Endian, FunctionInfo, ImportFact, Instruction, Op, Program, Variable, REGISTER_SPACE,
};

/// A single architectural register.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegisterInfo {
    pub name: String,
    /// Offset in the `register` address space
    pub offset: usize,
    pub size: usize,
    /// Callee-saved under every calling convention of the architecture
    pub preserved: bool,
}

/// Description of the architecture's registers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegisterFile {
    pub arch_name: String,
    /// Size of a machine word (and of a pointer), in bytes
    pub word_size: usize,
    pub registers: Vec<RegisterInfo>,
    pub stack_pointer: String,
    pub instruction_pointer: String,
}

impl RegisterFile {
    fn build(
        arch_name: &str,
        word_size: usize,
        regs: &[(&str, usize, usize)],
        preserved: &[&str],
        sp: &str,
        ip: &str,
    ) -> Self {
        Self {
            arch_name: arch_name.to_owned(),
            word_size,
            registers: regs
                .iter()
                .map(|&(name, offset, size)| RegisterInfo {
                    name: name.to_owned(),
                    offset,
                    size,
                    preserved: preserved.contains(&name),
                })
                .collect(),
            stack_pointer: sp.to_owned(),
            instruction_pointer: ip.to_owned(),
        }
    }

    /// 32-bit x86
    pub fn x86() -> Self {
        Self::build(
            "x86",
            4,
            &[
                ("EAX", 0x0, 4),
                ("ECX", 0x4, 4),
                ("EDX", 0x8, 4),
                ("EBX", 0xc, 4),
                ("ESP", 0x10, 4),
                ("EBP", 0x14, 4),
                ("ESI", 0x18, 4),
                ("EDI", 0x1c, 4),
                ("EIP", 0x20, 4),
                ("CF", 0x200, 1),
                ("PF", 0x202, 1),
                ("ZF", 0x206, 1),
                ("SF", 0x207, 1),
                ("OF", 0x20b, 1),
            ],
            &["EBX", "ESP", "EBP", "ESI", "EDI"],
            "ESP",
            "EIP",
        )
    }

    /// x86-64
    pub fn x86_64() -> Self {
        Self::build(
            "x86_64",
            8,
            &[
                ("RAX", 0x0, 8),
                ("RCX", 0x8, 8),
                ("RDX", 0x10, 8),
                ("RBX", 0x18, 8),
                ("RSP", 0x20, 8),
                ("RBP", 0x28, 8),
                ("RSI", 0x30, 8),
                ("RDI", 0x38, 8),
                ("R8", 0x80, 8),
                ("R9", 0x88, 8),
                ("R10", 0x90, 8),
                ("R11", 0x98, 8),
                ("R12", 0xa0, 8),
                ("R13", 0xa8, 8),
                ("R14", 0xb0, 8),
                ("R15", 0xb8, 8),
                ("RIP", 0x288, 8),
                ("CF", 0x200, 1),
                ("PF", 0x202, 1),
                ("ZF", 0x206, 1),
                ("SF", 0x207, 1),
                ("OF", 0x20b, 1),
            ],
            &["RBX", "RSP", "RBP", "R12", "R13", "R14", "R15"],
            "RSP",
            "RIP",
        )
    }

    /// A built-in register file by architecture name
    pub fn by_arch_name(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "x86" | "x86_32" | "i386" => Some(Self::x86()),
            "x86_64" | "x64" | "amd64" => Some(Self::x86_64()),
            _ => None,
        }
    }

    /// Look up a register by (case-insensitive) name
    pub fn lookup(&self, name: &str) -> Option<&RegisterInfo> {
        self.registers
            .iter()
            .find(|r| r.name.eq_ignore_ascii_case(name))
    }

    /// The register whose storage starts at `offset`
    pub fn at_offset(&self, offset: usize) -> Option<&RegisterInfo> {
        self.registers.iter().find(|r| r.offset == offset)
    }

    /// The varnode naming register `name`
    pub fn varnode(&self, name: &str) -> Option<Variable> {
        self.lookup(name).map(|r| Variable::Varnode {
            address_space_idx: REGISTER_SPACE,
            offset: r.offset,
            size: r.size,
        })
    }

    pub fn location(&self, name: &str) -> Option<ASLocation> {
        self.lookup(name).map(|r| ASLocation {
            address_space_idx: REGISTER_SPACE,
            offset: r.offset,
        })
    }

    pub fn stack_pointer_location(&self) -> Option<ASLocation> {
        self.location(&self.stack_pointer)
    }

    /// Whether `loc` is preserved across calls regardless of the callee
    pub fn is_preserved(&self, loc: &ASLocation) -> bool {
        loc.address_space_idx == REGISTER_SPACE
            && self
                .at_offset(loc.offset)
                .map(|r| r.preserved)
                .unwrap_or(false)
    }
}

/// A location defined or used by an instruction.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum DefUseLocation {
    /// A varnode with a statically known location
    Fixed(ASLocation),
    /// Memory reached through a computed address
    IndirectMemory,
}

/// Def/use facts of a single IL instruction. Effects of calls on the callee side are not included.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DefUse {
    pub defs: Vec<DefUseLocation>,
    pub uses: Vec<DefUseLocation>,
}

/// Def/use facts derived from the operand shapes of `ins`
pub fn def_use_of(ins: &Instruction) -> DefUse {
    let mut r = DefUse::default();
    let fixed = |v: &Variable| match v {
        Variable::Varnode { .. } => v.try_to_aslocation().map(DefUseLocation::Fixed),
        _ => None,
    };
    match ins.op {
        Op::Load => {
            r.uses.extend(ins.inputs[0].try_to_aslocation().map(DefUseLocation::Fixed));
            r.uses.push(DefUseLocation::IndirectMemory);
            r.defs.extend(fixed(&ins.output));
        }
        Op::Store => {
            r.uses.extend(ins.inputs[0].try_to_aslocation().map(DefUseLocation::Fixed));
            r.uses.extend(fixed(&ins.inputs[1]));
            r.defs.push(DefUseLocation::IndirectMemory);
        }
        _ => {
            r.uses.extend(ins.inputs.iter().filter_map(fixed));
            r.defs.extend(fixed(&ins.output));
        }
    }
    r
}

/// The narrow interface a recovery engine exposes to the analyses. The analyses only read.
pub trait RecoveryEngine: Send + Sync {
    fn register_file(&self) -> &RegisterFile;
    fn endianness(&self) -> Endian;
    fn instruction_count(&self) -> usize;
    fn instruction(&self, il_addr: usize) -> Option<&Instruction>;
    /// First IL address and number of IL instructions lifted from `machine_addr`
    fn il_range_for_machine_address(&self, machine_addr: u64) -> Option<(usize, usize)>;
    /// All machine addresses with lifted instructions, in increasing order
    fn machine_addresses(&self) -> Vec<u64>;
    fn basic_block(&self, idx: usize) -> Option<&[usize]>;
    fn block_containing(&self, il_addr: usize) -> Option<usize>;
    fn functions(&self) -> &[FunctionInfo];
    /// Index into [`Self::functions`] of the function containing `il_addr`
    fn function_containing(&self, il_addr: usize) -> Option<usize>;
    /// Intra-procedural successors of `il_addr`
    fn successors(&self, il_addr: usize) -> Vec<usize>;
    /// Resolve a branch or call target operand of the instruction at `il_addr`
    fn resolve_control_target(&self, il_addr: usize, target: &Variable) -> Option<usize>;
    /// Import table as reported by the loader
    fn imports(&self) -> &[ImportFact];

    fn def_use(&self, il_addr: usize) -> DefUse {
        self.instruction(il_addr).map(def_use_of).unwrap_or_default()
    }
}

impl RecoveryEngine for Program {
    fn register_file(&self) -> &RegisterFile {
        &self.register_file
    }

    fn endianness(&self) -> Endian {
        self.endianness
    }

    fn instruction_count(&self) -> usize {
        self.instructions.len()
    }

    fn instruction(&self, il_addr: usize) -> Option<&Instruction> {
        self.instructions.get(il_addr)
    }

    fn il_range_for_machine_address(&self, machine_addr: u64) -> Option<(usize, usize)> {
        self.get_il_addrs_for_machine_addr(machine_addr)
    }

    fn machine_addresses(&self) -> Vec<u64> {
        Program::machine_addresses(self)
    }

    fn basic_block(&self, idx: usize) -> Option<&[usize]> {
        self.basic_blocks.get(idx).map(|b| b.as_slice())
    }

    fn block_containing(&self, il_addr: usize) -> Option<usize> {
        self.block_index_for_il(il_addr)
    }

    fn functions(&self) -> &[FunctionInfo] {
        &self.functions
    }

    fn function_containing(&self, il_addr: usize) -> Option<usize> {
        self.function_index_for_il(il_addr)
    }

    fn successors(&self, il_addr: usize) -> Vec<usize> {
        self.get_successor_instruction_addresses_for(il_addr)
    }

    fn resolve_control_target(&self, il_addr: usize, target: &Variable) -> Option<usize> {
        Program::resolve_control_target(self, il_addr, target)
    }

    fn imports(&self) -> &[ImportFact] {
        &self.imports
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::il::{RAM_SPACE, UNIQUE_SPACE};

    #[test]
    fn store_defines_indirect_memory() {
        let rf = RegisterFile::x86();
        let ins = Instruction::new(
            0x10,
            Op::Store,
            Variable::Unused,
            [
                Variable::DerefVarnode {
                    derefval_address_space_idx: RAM_SPACE,
                    derefval_size: 4,
                    addr_address_space_idx: REGISTER_SPACE,
                    addr_offset: 0x10,
                },
                Variable::Varnode {
                    address_space_idx: UNIQUE_SPACE,
                    offset: 0,
                    size: 4,
                },
            ],
        );
        let du = def_use_of(&ins);
        assert_eq!(du.defs, vec![DefUseLocation::IndirectMemory]);
        assert_eq!(
            du.uses[0],
            DefUseLocation::Fixed(rf.stack_pointer_location().unwrap())
        );
        assert_eq!(du.uses.len(), 2);
    }

    #[test]
    fn register_lookup_is_case_insensitive() {
        let rf = RegisterFile::x86_64();
        assert_eq!(rf.lookup("rsp").map(|r| r.offset), Some(0x20));
        assert!(rf.is_preserved(&rf.location("RBX").unwrap()));
        assert!(!rf.is_preserved(&rf.location("RAX").unwrap()));
    }
}
