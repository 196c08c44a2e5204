//! Intermediate language produced by the recovery engine.
//!
//! Inspired by (but distinct from) Ghidra's [P-Code intermediate
//! language](https://ghidra.re/courses/languages/html/pcoderef.html). Each machine instruction is
//! lifted to one or more IL [`Instruction`]s, which are stored contiguously in a [`Program`] and
//! addressed by their IL address (an index into [`Program::instructions`]).

use crate::containers::unordered::UnorderedMap;
use crate::dataflow::ASLocation;
use crate::engine::RegisterFile;
use crate::log::*;

/// Index of the `ram` address space in every [`Program`].
pub const RAM_SPACE: usize = 0;
/// Index of the `register` address space in every [`Program`].
pub const REGISTER_SPACE: usize = 1;
/// Index of the `unique` (temporaries) address space in every [`Program`].
pub const UNIQUE_SPACE: usize = 2;

/// An IL operation that operates on [`Variable`]s.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, PartialOrd, Ord)]
pub enum Op {
    /// Copy a sequence of contiguous bytes from `input0` to `output`
    Copy,
    /// Wrapping sum of `input0` and `input1`
    IntAdd,
    /// Wrapping subtraction `input0 - input1`
    IntSub,
    /// Wrapping multiplication of `input0` and `input1`
    IntMult,
    /// Bitwise AND of `input0` and `input1`
    IntAnd,
    /// Bitwise OR or `input0` and `input1`
    IntOr,
    /// Bitwise XOR of `input0` and `input1`
    IntXor,
    /// Left shift `input0 << input1`
    IntLeftShift,
    /// Unsigned right shift `input0 u>> input1` (aka logical right shift)
    IntURightShift,
    /// Signed right shift `input0 s>> input1` (aka arithmetic right shift)
    IntSRightShift,
    /// Check if `input0 == input1`
    IntEqual,
    /// Check if `input0 != input1`
    IntNotEqual,
    /// Unsigned integer comparison `input0 u< input1`
    IntLess,
    /// Signed integer comparison `input0 s< input1`
    IntSLess,
    /// Unsigned integer comparison `input0 u<= input1`
    IntLessEqual,
    /// Signed integer comparison `input0 s<= input1`
    IntSLessEqual,
    /// Zero-extend `input0`
    IntZext,
    /// Sign-extend `input0`
    IntSext,
    /// Two's complement of `input0`
    IntTwosComp,
    /// One's complement of `input0` (i.e., bitwise NOT)
    IntOnesComp,
    /// Truncate `input0 u>> (8 * input1)` to fit into the output. `input1` is a constant number of
    /// least-significant bytes to remove.
    SubPiece,
    /// Boolean AND; despite being size 1, it is interpreted only as true or false
    BoolAnd,
    /// Boolean OR; despite being size 1, it is interpreted only as true or false
    BoolOr,
    /// Boolean XOR; despite being size 1, it is interpreted only as true or false
    BoolXor,
    /// Boolean logical negation; despite being size 1, it is interpreted only as true or false
    BoolNegate,
    /// Load from `input0` (must be [`Variable::DerefVarnode`])
    Load,
    /// Store `input1` into `input0` (must be [`Variable::DerefVarnode`])
    Store,
    /// Unconditional branch to `input0`
    Branch,
    /// A conditional branch to `input0` taken iff `input1` is non-zero
    Cbranch,
    /// A call to the direct target `input0`; the callee _may_ return to the fallthrough.
    CallWithFallthrough,
    /// A call to the address held in `input0`; the callee _may_ return to the fallthrough.
    CallWithFallthroughIndirect,
    /// A call to the direct target `input0` that never returns.
    CallWithNoFallthrough,
    /// Return to the caller. `input0`, if used, holds the return address.
    Return,
    /// A no-op, causes simple fallthrough to next IL instruction
    Nop,
    /// Throw a processor exception, halting all execution. No fallthrough.
    ProcessorException,
    /// Marks the output as non-deterministically modified each time it is executed. Used for
    /// instructions whose semantics the lifter does not model.
    UnderspecifiedOutputModification,
}

impl Op {
    /// Whether this op transfers control to another function
    pub fn is_call(&self) -> bool {
        matches!(
            self,
            Op::CallWithFallthrough | Op::CallWithFallthroughIndirect | Op::CallWithNoFallthrough
        )
    }

    /// Whether the instruction following this op must start a new basic block
    pub fn ends_basic_block(&self) -> bool {
        matches!(
            self,
            Op::Branch | Op::Cbranch | Op::Return | Op::ProcessorException
        ) || self.is_call()
    }

    /// Whether execution may continue with the next IL instruction
    pub fn has_fallthrough(&self) -> bool {
        !matches!(
            self,
            Op::Branch | Op::Return | Op::ProcessorException | Op::CallWithNoFallthrough
        )
    }
}

/// An input to or output from an [`Op`].
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Variable {
    /// An unused input/output for the relevant op.
    // Note: We use this rather than an `Option<Variable>` at every
    // use case to keep pattern matching cleaner.
    Unused,
    /// An untyped contiguous sequence of bytes in some address space
    /// that can be treated as a single value. The operation on the
    /// variable determines its interpretation.
    Varnode {
        /// An index into the program's address spaces
        address_space_idx: usize,
        /// An offset into the address space
        offset: usize,
        /// The size of the variable
        size: usize,
    },
    /// An untyped contiguous sequence of bytes in some address space referred to by an address from
    /// a (potentially different) address space. Must only be used with [`Op::Load`] and
    /// [`Op::Store`] as their 0th operand. The address itself is a pointer-sized value.
    DerefVarnode {
        /// An index into the program's address spaces, where the dereferenced value lives.
        derefval_address_space_idx: usize,
        /// The size of the dereferenced value
        derefval_size: usize,
        /// An index into the program's address spaces, where the address of the value lives.
        addr_address_space_idx: usize,
        /// An offset into the address space, where the address of the value lives.
        addr_offset: usize,
    },
    /// Constant or "immediate" value
    Constant { value: u64, size: usize },
    /// An original processor address. Refers to the first [`Op`] with
    /// this particular address.
    MachineAddress { addr: u64 },
    /// An IL offset. Refers to an offset from the IL address
    /// currently executing IL instruction.
    ILOffset { offset: isize },
}

impl Variable {
    pub fn try_size(&self) -> Option<usize> {
        match self {
            Variable::Unused | Variable::ILOffset { .. } | Variable::MachineAddress { .. } => None,
            Variable::Constant { size, .. } => Some(*size),
            Variable::Varnode { size, .. } => Some(*size),
            // Should not use `size` on DerefVarnode. Get the address or derefval size directly
            // instead.
            Variable::DerefVarnode { .. } => None,
        }
    }

    pub fn try_to_aslocation(&self) -> Option<ASLocation> {
        match self {
            Variable::Unused
            | Variable::ILOffset { .. }
            | Variable::MachineAddress { .. }
            | Variable::Constant { .. } => None,
            Variable::Varnode {
                address_space_idx,
                offset,
                size: _,
            } => Some(ASLocation {
                address_space_idx: *address_space_idx,
                offset: *offset,
            }),
            // Points to the address's location. Dereferenced value is ignored.
            Variable::DerefVarnode {
                addr_address_space_idx,
                addr_offset,
                ..
            } => Some(ASLocation {
                address_space_idx: *addr_address_space_idx,
                offset: *addr_offset,
            }),
        }
    }

    pub fn is_used(&self) -> bool {
        !matches!(self, Variable::Unused)
    }

    /// The static global memory address this variable names directly, if any.
    pub fn global_address(&self) -> Option<u64> {
        match self {
            Variable::Varnode {
                address_space_idx: RAM_SPACE,
                offset,
                ..
            } => Some(*offset as u64),
            _ => None,
        }
    }
}

impl std::fmt::Debug for Variable {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        use Variable::*;
        match self {
            Unused => write!(f, "Unused"),
            Varnode {
                address_space_idx,
                offset,
                size,
            } => write!(
                f,
                "Varnode{{as={}, off={:#x}, sz={}}}",
                address_space_idx, offset, size
            ),
            DerefVarnode {
                derefval_address_space_idx,
                derefval_size,
                addr_address_space_idx,
                addr_offset,
            } => write!(
                f,
                "Deref@{},sz={}{{as={}, off={:#x}}}",
                derefval_address_space_idx, derefval_size, addr_address_space_idx, addr_offset
            ),
            Constant { value, size } => {
                if f.alternate() {
                    write!(f, "${:#x}u{}", value, size)
                } else {
                    write!(f, "${:}u{}", value, size)
                }
            }
            MachineAddress { addr } => write!(f, "MCA({:#x?})", addr),
            ILOffset { offset } => write!(f, "ILO({:+})", offset),
        }
    }
}

/// Endianness
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Endian {
    Big,
    Little,
}

/// An IL instruction.
///
/// Original processor instructions may be translated to one or more
/// IL instructions.
#[derive(Clone, PartialEq, Eq)]
pub struct Instruction {
    /// The address of the original processor instruction this
    /// instruction was translated from.
    pub address: u64,
    /// The actual operation performed by the instruction. This
    /// dictates the number of `inputs` and whether or not there is
    /// any `output`.
    pub op: Op,
    /// The outputs of the instruction. If it produces no output, must
    /// be set to [`Variable::Unused`].
    pub output: Variable,
    /// The inputs to the instruction. Any unused inputs must be set
    /// to [`Variable::Unused`].
    pub inputs: [Variable; 2],
}

impl std::fmt::Debug for Instruction {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(
            f,
            "Instruction {{ addr: {:#x}, op: {:?}, output: {:?}, inputs: {:?} }}",
            self.address, self.op, self.output, self.inputs
        )
    }
}

impl Instruction {
    /// Shorthand constructor
    pub fn new(address: u64, op: Op, output: Variable, inputs: [Variable; 2]) -> Self {
        Self {
            address,
            op,
            output,
            inputs,
        }
    }

    /// Confirms the validity of the instruction.
    pub fn try_confirm_valid(&self) -> Result<(), String> {
        macro_rules! exp {
            (__fail $e:expr => [$failpats:tt]) => {{
                return Err(format!(
                    "Got {} {:?} for operation {:?}. Expected {}. Address: {:#x}.",
                    stringify!($e),
                    $e,
                    self.op,
                    stringify!($failpats),
                    self.address,
                ));
            }};
            (__fail $e:expr => [$($failpats:tt)*]) => {{
                return Err(format!(
                    "Got {} {:?} for operation {:?}. Expected one of [{}]. Address: {:#x}.",
                    stringify!($e),
                    $e,
                    self.op,
                    stringify!($($failpats)*),
                    self.address,
                ));
            }};
            (__internal $e:expr => [$pat:pat] [$($failpats:tt)*]) => {
                match $e {
                    $pat => (),
                    _ => exp!(__fail $e => [$($failpats)* $pat]),
                }
            };
            (__internal $e:expr => [$pat:pat, $($pats:pat),*] [$($failpats:tt)*]) => {
                match $e {
                    $pat => (),
                    _ => exp!(__internal $e => [$($pats),*] [$($failpats)* $pat]),
                }
            };
            (__same_size $e:expr, $f:expr) => {
                match ($e.try_size(), $f.try_size()) {
                    (Some(sz1), Some(sz2)) =>
                        if sz1 != sz2 {
                            return Err(format!(
                                "Got unequal sizes {} and {} for {} and {} operation {:?}",
                                sz1, sz2, stringify!($e), stringify!($f), self.op));
                        },
                    _ => (),
                }
            };
            (__size_lt $e:expr, $f:expr) => {
                match ($e.try_size(), $f.try_size()) {
                    (Some(sz1), Some(sz2)) =>
                        if !(sz1 < sz2) {
                            return Err(format!(
                                "Got invalid sizes {} and {} for {} and {} operation {:?}",
                                sz1, sz2, stringify!($e), stringify!($f), self.op));
                        },
                    _ => (),
                }
            };
            (__ref i0) => { self.inputs[0] };
            (__ref i1) => { self.inputs[1] };
            (__ref o) => { self.output };
            (_m $e:expr => [0]) => { exp!(__internal $e => [Variable::Unused] []) };
            (_m $e:expr => [vn]) => { exp!(__internal $e => [Variable::Varnode {..}] []) };
            (_m $e:expr => [vn0]) => { exp!(__internal $e => [Variable::Varnode {..}, Variable::Unused] []) };
            (_m $e:expr => [vnc]) => { exp!(__internal $e => [Variable::Varnode {..}, Variable::Constant{..}] []) };
            (_m $e:expr => [vnc0]) => { exp!(__internal $e => [Variable::Varnode {..}, Variable::Constant{..} | Variable::Unused] []) };
            (_m $e:expr => [c]) => { exp!(__internal $e => [Variable::Constant{..}] []) };
            (_m $e:expr => [dr]) => { exp!(__internal $e => [Variable::DerefVarnode {..}] []) };
            (_m $e:expr => [pc]) => { exp!(__internal $e => [Variable::MachineAddress {..}, Variable::ILOffset {..}] []) };
            ($ti0:tt $ti1:tt $to:tt) => {{
                exp!(_m self.inputs[0] => [$ti0]);
                exp!(_m self.inputs[1] => [$ti1]);
                exp!(_m self.output => [$to]);
            }};
            (szeq($a:tt,$b:tt) $($rest:tt)*) => {{
                exp!($($rest)*);
                exp!(__same_size exp!(__ref $a), exp!(__ref $b));
            }};
            (szlt($a:tt,$b:tt) $($rest:tt)*) => {{
                exp!($($rest)*);
                exp!(__size_lt exp!(__ref $a), exp!(__ref $b));
            }};
            (sz($a:tt,$b:literal) $($rest:tt)*) => {{
                exp!($($rest)*);
                if exp!(__ref $a).try_size() != Some($b) {
                    return Err(format!(
                        "Got size {:?} for {} in operation {:?}. Expected {}",
                        exp!(__ref $a).try_size(), stringify!(exp!(__ref $a)),
                        self.op,
                        $b));
                }
            }};
            // Dump an error if we (for some reason) don't match anything
            ($($t:tt)*) => {
                compile_error!(concat!($(stringify!($t), " "),*))
            };
        }
        match self.op {
            Op::Branch | Op::CallWithFallthrough | Op::CallWithNoFallthrough => exp!(pc 0 0),
            Op::CallWithFallthroughIndirect => exp!(vn 0 0),
            Op::Return => exp!(vn0 0 0),
            Op::Cbranch => {
                // Some binaries seem to actually have constant-branching conditionals
                // so we need to allow constants here too.
                exp!(pc vnc 0)
            }
            Op::Copy => exp!(szeq(i0,o) vnc 0 vn),
            Op::BoolNegate => exp!(szeq(i0,o) sz(o,1) vnc 0 vn),
            Op::IntAdd
            | Op::IntSub
            | Op::IntMult
            | Op::IntAnd
            | Op::IntOr
            | Op::IntXor => {
                exp!(szeq(i0,i1) szeq(i0,o) vnc vnc vn)
            }
            Op::BoolAnd | Op::BoolOr | Op::BoolXor => {
                exp!(szeq(i0,i1) szeq(i0,o) sz(o,1) vnc vnc vn)
            }
            Op::IntEqual
            | Op::IntNotEqual
            | Op::IntSLess
            | Op::IntLess
            | Op::IntSLessEqual
            | Op::IntLessEqual => {
                exp!(szeq(i0,i1) sz(o,1) vnc vnc vn)
            }
            Op::IntLeftShift | Op::IntURightShift | Op::IntSRightShift => {
                exp!(szeq(i0,o) vnc vnc vn)
            }
            Op::IntOnesComp | Op::IntTwosComp => exp!(szeq(i0,o) vnc 0 vn),
            Op::IntZext | Op::IntSext => exp!(szlt(i0,o) vnc 0 vn),
            Op::SubPiece => exp!(szlt(o,i0) vnc c vn),
            Op::Load => {
                exp!(dr 0 vn);
                if let Variable::DerefVarnode { derefval_size, .. } = &self.inputs[0] {
                    if Some(*derefval_size) != self.output.try_size() {
                        return Err(format!(
                            "Load of {} bytes into output {:?}. Address: {:#x}.",
                            derefval_size, self.output, self.address
                        ));
                    }
                }
            }
            Op::Store => exp!(dr vnc 0),
            Op::Nop | Op::ProcessorException => exp!(0 0 0),
            Op::UnderspecifiedOutputModification => exp!(vnc0 vnc0 vn),
        };
        Ok(())
    }

    /// The intra-program target of a branch, call, or conditional branch, if statically known.
    pub fn static_target(&self) -> Option<&Variable> {
        match self.op {
            Op::Branch | Op::Cbranch | Op::CallWithFallthrough | Op::CallWithNoFallthrough => {
                Some(&self.inputs[0])
            }
            _ => None,
        }
    }
}

/// A function as partitioned by the recovery engine.
#[derive(Debug, Clone)]
pub struct FunctionInfo {
    /// A human-readable name
    pub name: String,
    /// The machine address of the function's entry point
    pub entry: u64,
    /// The IL address of the first IL instruction of the entry point
    pub entry_il: usize,
    /// Indexes into [`Program::basic_blocks`]
    pub basic_blocks: Vec<usize>,
}

/// An import table entry, as reported by the loader.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImportFact {
    /// Address of the import slot (or thunk) through which the import is reached
    pub address: u64,
    pub library: String,
    pub symbol: String,
    pub ordinal: Option<u32>,
    /// The unique symbolic value id the loader assigned to the value held by the slot
    pub variable_id: Option<usize>,
}

/// The actual program
#[derive(Debug)]
pub struct Program {
    /// Memory byte order
    pub endianness: Endian,
    /// The actual executable instructions.
    pub instructions: Vec<Instruction>,
    /// Mapping of original processor addresses to a contiguous range of IL `instructions`,
    /// represented by an offset and length.
    address_mapping: UnorderedMap<u64, (usize, usize)>,
    /// List of basic blocks, where each basic block is a contiguous list of IL addresses.
    pub basic_blocks: Vec<Vec<usize>>,
    /// For each IL address, the basic block that contains it
    block_of_il: Vec<usize>,
    /// For each basic block, the function that contains it
    function_of_block: Vec<usize>,
    /// List of functions in the program. No two functions share a basic block.
    pub functions: Vec<FunctionInfo>,
    /// Import table
    pub imports: Vec<ImportFact>,
    /// Description of the architecture's registers
    pub register_file: RegisterFile,
    /// Comments on machine instructions, used only for debugging purposes
    pub machine_insn_comments: UnorderedMap<u64, String>,
    /// Function currently being added: name, entry, and the IL address of its first instruction
    current_function: Option<(String, u64, usize)>,
}

impl Program {
    /// Build a new empty program for an architecture described by `register_file`
    pub fn new(register_file: RegisterFile, endianness: Endian) -> Self {
        Self {
            endianness,
            instructions: Vec::new(),
            address_mapping: Default::default(),
            basic_blocks: Vec::new(),
            block_of_il: Vec::new(),
            function_of_block: Vec::new(),
            functions: Vec::new(),
            imports: Vec::new(),
            register_file,
            machine_insn_comments: Default::default(),
            current_function: None,
        }
    }

    /// Begin adding instructions for a new function with name `f`, starting at machine address
    /// `entry`. Must be followed by [`Self::end_function`] before the next function begins.
    pub fn begin_function(&mut self, f: impl Into<String>, entry: u64) {
        assert!(
            self.current_function.is_none(),
            "Started a new function before ending the previous one"
        );
        self.current_function = Some((f.into(), entry, self.instructions.len()));
    }

    /// Add the IL `instructions` for a new machine-level instruction. Panics if any sanity check
    /// fails; see [`Self::try_add_one_machine_instruction`] for a non-panicking variant.
    pub fn add_one_machine_instruction(&mut self, instructions: Vec<Instruction>) {
        self.try_add_one_machine_instruction(instructions)
            .unwrap_or_else(|e| panic!("{}", e))
    }

    /// Add the IL `instructions` for a new machine-level instruction, checking that they are all
    /// valid, all belong to the same (new) machine address, and that a function is open.
    pub fn try_add_one_machine_instruction(
        &mut self,
        instructions: Vec<Instruction>,
    ) -> Result<(), String> {
        if self.current_function.is_none() {
            return Err("Instructions must be added inside a function".into());
        }
        if instructions.is_empty() {
            return Err("Expected some IL instructions.".into());
        }
        let addr = instructions[0].address;
        if !instructions.iter().all(|i| i.address == addr) {
            return Err(format!(
                "Not all provided IL instructions correspond to a single machine \
                 instruction. Got: {:?}",
                instructions
            ));
        }
        if let Some((existing_il_addr, existing_il_len)) = self.address_mapping.get(&addr) {
            return Err(format!(
                "Instruction at address {:#x} was already added earlier. \
                 Old IL instructions are {:?}.",
                addr,
                &self.instructions[*existing_il_addr..existing_il_addr + existing_il_len],
            ));
        }
        for ins in &instructions {
            ins.try_confirm_valid()?;
        }

        let il_addr = self.instructions.len();
        self.address_mapping
            .insert(addr, (il_addr, instructions.len()));
        let mut instructions = instructions;
        self.instructions.append(&mut instructions);
        Ok(())
    }

    /// End adding instructions for the current function, partitioning it into maximal basic
    /// blocks. Panics on failure; see [`Self::try_end_function`].
    pub fn end_function(&mut self) {
        self.try_end_function().unwrap_or_else(|e| panic!("{}", e))
    }

    /// End adding instructions for the current function, partitioning it into maximal basic
    /// blocks. Leaders are the entry point, statically known branch targets inside the function,
    /// and the instruction after every control transfer (calls included).
    pub fn try_end_function(&mut self) -> Result<(), String> {
        let (name, entry, start) = self
            .current_function
            .take()
            .ok_or_else(|| "Ended a function that was never begun".to_string())?;
        let end = self.instructions.len();
        if start == end {
            return Err(format!("Function {} at {:#x} has no instructions", name, entry));
        }
        let entry_il = match self.address_mapping.get(&entry) {
            Some(&(il, _)) if (start..end).contains(&il) => il,
            _ => {
                return Err(format!(
                    "Entry point {:#x} of function {} is not one of its instructions",
                    entry, name
                ))
            }
        };

        let mut leaders = std::collections::BTreeSet::new();
        leaders.insert(start);
        leaders.insert(entry_il);
        for il in start..end {
            let ins = &self.instructions[il];
            if let Some(tgt) = ins.static_target() {
                if !ins.op.is_call() {
                    match self.resolve_control_target(il, tgt) {
                        Some(t) if (start..end).contains(&t) => {
                            leaders.insert(t);
                        }
                        _ => {
                            debug!(
                                "Branch to outside the current function";
                                "function" => &name,
                                "ins" => ?ins,
                            );
                        }
                    }
                }
            }
            if ins.op.ends_basic_block() && il + 1 < end {
                leaders.insert(il + 1);
            }
        }

        let leaders: Vec<usize> = leaders.into_iter().collect();
        let func_idx = self.functions.len();
        let mut bbs = vec![];
        self.block_of_il.resize(end, usize::MAX);
        for (i, &l) in leaders.iter().enumerate() {
            let bb_end = leaders.get(i + 1).cloned().unwrap_or(end);
            let bb_idx = self.basic_blocks.len();
            self.basic_blocks.push((l..bb_end).collect());
            self.function_of_block.push(func_idx);
            for il in l..bb_end {
                self.block_of_il[il] = bb_idx;
            }
            bbs.push(bb_idx);
        }

        self.functions.push(FunctionInfo {
            name,
            entry,
            entry_il,
            basic_blocks: bbs,
        });
        Ok(())
    }

    /// Add an import table entry
    pub fn add_import(&mut self, fact: ImportFact) {
        self.imports.push(fact);
    }

    /// Add a comment to a machine address
    pub fn add_comment_to_machine_address(&mut self, machine_addr: u64, comment: &str) {
        self.machine_insn_comments
            .entry(machine_addr)
            .and_modify(|c| {
                c.push_str("; ");
                c.push_str(comment)
            })
            .or_insert_with(|| comment.to_owned());
    }

    /// Get the IL addresses for a machine address
    pub fn get_il_addrs_for_machine_addr(&self, machine_addr: u64) -> Option<(usize, usize)> {
        self.address_mapping.get(&machine_addr).cloned()
    }

    /// All machine addresses with lifted instructions, in order
    pub fn machine_addresses(&self) -> Vec<u64> {
        let mut v: Vec<u64> = self.address_mapping.keys().cloned().collect();
        v.sort_unstable();
        v
    }

    /// Resolve a control-flow target operand of the instruction at `il_addr` to an IL address
    pub fn resolve_control_target(&self, il_addr: usize, target: &Variable) -> Option<usize> {
        match target {
            Variable::MachineAddress { addr } => Some(self.address_mapping.get(addr)?.0),
            Variable::ILOffset { offset } => {
                let v = il_addr as isize + offset;
                (v >= 0 && (v as usize) < self.instructions.len()).then(|| v as usize)
            }
            _ => None,
        }
    }

    /// Index of the basic block containing IL address `il_addr`
    pub fn block_index_for_il(&self, il_addr: usize) -> Option<usize> {
        self.block_of_il
            .get(il_addr)
            .cloned()
            .filter(|&b| b != usize::MAX)
    }

    /// Index of the function containing IL address `il_addr`
    pub fn function_index_for_il(&self, il_addr: usize) -> Option<usize> {
        self.block_index_for_il(il_addr)
            .map(|b| self.function_of_block[b])
    }

    /// Get the potential next instructions after instruction at IL address `il_addr`, restricted
    /// to the function containing it. Calls fall through; the callee is not a successor.
    pub fn get_successor_instruction_addresses_for(&self, il_addr: usize) -> Vec<usize> {
        let ins = &self.instructions[il_addr];
        let func = self.function_index_for_il(il_addr);
        let same_function = |t: usize| func.is_some() && self.function_index_for_il(t) == func;

        let fallthrough = if ins.op.has_fallthrough() && same_function(il_addr + 1) {
            vec![il_addr + 1]
        } else {
            vec![]
        };

        match ins.op {
            Op::Branch | Op::Cbranch => {
                let mut v = fallthrough;
                match self.resolve_control_target(il_addr, &ins.inputs[0]) {
                    Some(t) if same_function(t) => {
                        if !v.contains(&t) {
                            v.push(t)
                        }
                    }
                    _ => {
                        trace!(
                            "Branch leaving the function. Ignoring for successor.";
                            "ins" => ?ins, "ilpc" => il_addr,
                        );
                    }
                }
                v
            }
            _ => fallthrough,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn reg(offset: usize) -> Variable {
        Variable::Varnode {
            address_space_idx: REGISTER_SPACE,
            offset,
            size: 4,
        }
    }

    #[test]
    fn validation_rejects_bad_operands() {
        let bad_add = Instruction::new(
            0x10,
            Op::IntAdd,
            Variable::Constant { value: 1, size: 4 },
            [reg(0), reg(4)],
        );
        assert!(bad_add.try_confirm_valid().is_err());

        let mismatched = Instruction::new(
            0x10,
            Op::IntAdd,
            reg(0),
            [reg(0), Variable::Constant { value: 1, size: 2 }],
        );
        assert!(mismatched.try_confirm_valid().is_err());

        let ok = Instruction::new(
            0x10,
            Op::IntAdd,
            reg(0),
            [reg(0), Variable::Constant { value: 1, size: 4 }],
        );
        assert!(ok.try_confirm_valid().is_ok());
    }

    #[test]
    fn basic_blocks_split_at_branches_and_calls() {
        let mut prog = Program::new(RegisterFile::x86(), Endian::Little);
        prog.begin_function("f", 0x100);
        prog.add_one_machine_instruction(vec![Instruction::new(
            0x100,
            Op::Copy,
            reg(0),
            [Variable::Constant { value: 0, size: 4 }, Variable::Unused],
        )]);
        prog.add_one_machine_instruction(vec![Instruction::new(
            0x102,
            Op::CallWithFallthrough,
            Variable::Unused,
            [Variable::MachineAddress { addr: 0x200 }, Variable::Unused],
        )]);
        prog.add_one_machine_instruction(vec![Instruction::new(
            0x107,
            Op::Branch,
            Variable::Unused,
            [Variable::MachineAddress { addr: 0x102 }, Variable::Unused],
        )]);
        prog.end_function();

        assert_eq!(prog.basic_blocks, vec![vec![0], vec![1], vec![2]]);
        assert_eq!(prog.get_successor_instruction_addresses_for(1), vec![2]);
        assert_eq!(prog.get_successor_instruction_addresses_for(2), vec![1]);
        assert_eq!(prog.function_index_for_il(2), Some(0));
    }
}
