//! A lifter from a textual IL listing.
//!
//! The listing is what a disassembler front-end exports after control-flow recovery. It has the
//! following sections, each introduced by its name on a line of its own:
//!
//! ```text
//! PROGRAM
//! name example
//! arch x86
//! big_endian false
//!
//! REGISTERS            (optional; extends or replaces the built-in register file)
//! word 4
//! sp ESP
//! ip EIP
//! reg EAX 0x0 4
//! reg EBX 0xc 4 preserved
//!
//! IMPORTS              (optional)
//! 0x3000 msvcrt.dll rand var=1
//! 0x3004 kernel32.dll ExitProcess ordinal=183
//!
//! LISTING
//! function main 0x1000
//! 0x1000 IntSub ESP ESP const:0x4:4   ; push ebp
//! 0x1000 Store _ [ESP]:4 EBP
//! 0x1001 Copy EBP ESP
//! end
//! ```
//!
//! Consecutive lines sharing a machine address form a single machine instruction. Operands are
//! written as `_` (unused), a register name, `reg:OFF:SIZE`, `tmp:OFF:SIZE`, `ram:OFF:SIZE`,
//! `const:VALUE:SIZE`, `[ADDR]:SIZE` (memory at the address held in `ADDR`, itself a register name
//! or `tmp:OFF`/`reg:OFF`/`ram:OFF`), `@ADDR` (machine address) or `+N`/`-N` (IL offset). Text after
//! `#` is ignored; text after `;` is kept as a comment on the machine instruction.

use crate::engine::{RegisterFile, RegisterInfo};
use crate::error::RecoveryError;
use crate::il::{
    Endian, ImportFact, Instruction, Op, Program, Variable, RAM_SPACE, REGISTER_SPACE, UNIQUE_SPACE,
};
use crate::log::*;

use itertools::Itertools;
use std::collections::BTreeMap;
use std::path::Path;

lazy_static::lazy_static! {
    static ref OPS_BY_NAME: BTreeMap<&'static str, Op> = {
        use Op::*;
        [
            ("Copy", Copy),
            ("IntAdd", IntAdd),
            ("IntSub", IntSub),
            ("IntMult", IntMult),
            ("IntAnd", IntAnd),
            ("IntOr", IntOr),
            ("IntXor", IntXor),
            ("IntLeftShift", IntLeftShift),
            ("IntURightShift", IntURightShift),
            ("IntSRightShift", IntSRightShift),
            ("IntEqual", IntEqual),
            ("IntNotEqual", IntNotEqual),
            ("IntLess", IntLess),
            ("IntSLess", IntSLess),
            ("IntLessEqual", IntLessEqual),
            ("IntSLessEqual", IntSLessEqual),
            ("IntZext", IntZext),
            ("IntSext", IntSext),
            ("IntTwosComp", IntTwosComp),
            ("IntOnesComp", IntOnesComp),
            ("SubPiece", SubPiece),
            ("BoolAnd", BoolAnd),
            ("BoolOr", BoolOr),
            ("BoolXor", BoolXor),
            ("BoolNegate", BoolNegate),
            ("Load", Load),
            ("Store", Store),
            ("Branch", Branch),
            ("Cbranch", Cbranch),
            ("Call", CallWithFallthrough),
            ("CallWithFallthrough", CallWithFallthrough),
            ("CallInd", CallWithFallthroughIndirect),
            ("CallWithFallthroughIndirect", CallWithFallthroughIndirect),
            ("CallWithNoFallthrough", CallWithNoFallthrough),
            ("Return", Return),
            ("Nop", Nop),
            ("ProcessorException", ProcessorException),
            ("UnderspecifiedOutputModification", UnderspecifiedOutputModification),
        ]
        .into_iter()
        .collect()
    };
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum Section {
    None,
    Program,
    Registers,
    Imports,
    Listing,
}

/// Parse a number written in hexadecimal (`0x` prefix) or decimal, possibly negated.
fn parse_num(s: &str) -> Option<i128> {
    let (neg, s) = match s.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, s),
    };
    let v = if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        i128::from_str_radix(hex, 16).ok()?
    } else {
        s.parse::<i128>().ok()?
    };
    Some(if neg { -v } else { v })
}

fn parse_unsigned(s: &str) -> Result<u64, String> {
    match parse_num(s) {
        Some(v) if v >= 0 && v <= u64::MAX as i128 => Ok(v as u64),
        _ => Err(format!("expected a non-negative number, got {:?}", s)),
    }
}

fn parse_space(s: &str) -> Option<usize> {
    match s {
        "ram" => Some(RAM_SPACE),
        "reg" | "register" => Some(REGISTER_SPACE),
        "tmp" | "unique" => Some(UNIQUE_SPACE),
        _ => None,
    }
}

/// Parse a single operand
fn parse_variable(tok: &str, rf: &RegisterFile) -> Result<Variable, String> {
    if tok == "_" {
        return Ok(Variable::Unused);
    }
    if let Some(addr) = tok.strip_prefix('@') {
        return Ok(Variable::MachineAddress {
            addr: parse_unsigned(addr)?,
        });
    }
    if tok.starts_with('+') || (tok.starts_with('-') && tok.len() > 1) {
        let offset = parse_num(tok.trim_start_matches('+'))
            .ok_or_else(|| format!("bad IL offset {:?}", tok))?;
        return Ok(Variable::ILOffset {
            offset: offset as isize,
        });
    }
    if let Some(rest) = tok.strip_prefix('[') {
        let (inner, size) = rest
            .split_once("]:")
            .ok_or_else(|| format!("expected `[ADDR]:SIZE`, got {:?}", tok))?;
        let (addr_address_space_idx, addr_offset) = match inner.split_once(':') {
            Some((space, off)) => (
                parse_space(space).ok_or_else(|| format!("unknown address space {:?}", space))?,
                parse_unsigned(off)? as usize,
            ),
            None => {
                let r = rf
                    .lookup(inner)
                    .ok_or_else(|| format!("unknown register {:?}", inner))?;
                (REGISTER_SPACE, r.offset)
            }
        };
        return Ok(Variable::DerefVarnode {
            derefval_address_space_idx: RAM_SPACE,
            derefval_size: parse_unsigned(size)? as usize,
            addr_address_space_idx,
            addr_offset,
        });
    }
    let parts: Vec<&str> = tok.split(':').collect();
    match parts.as_slice() {
        ["const", value, size] => {
            let size = parse_unsigned(size)? as usize;
            let value = parse_num(value).ok_or_else(|| format!("bad constant {:?}", value))?;
            let mask = if size >= 8 {
                u64::MAX
            } else {
                (1u64 << (8 * size)) - 1
            };
            Ok(Variable::Constant {
                value: (value as u64) & mask,
                size,
            })
        }
        [space, offset, size] => Ok(Variable::Varnode {
            address_space_idx: parse_space(space)
                .ok_or_else(|| format!("unknown address space {:?}", space))?,
            offset: parse_unsigned(offset)? as usize,
            size: parse_unsigned(size)? as usize,
        }),
        [name] => rf
            .varnode(name)
            .ok_or_else(|| format!("unknown register {:?}", name)),
        _ => Err(format!("cannot parse operand {:?}", tok)),
    }
}

/// Accumulates state while walking the listing
struct LiftState {
    name: Option<String>,
    arch: Option<RegisterFile>,
    endianness: Endian,
    register_overrides: Vec<(usize, Vec<String>)>,
    imports: Vec<ImportFact>,
    functions: Vec<ListedFunction>,
}

struct ListedFunction {
    line: usize,
    name: String,
    entry: u64,
    /// Machine instructions, each with the line it started on, its IL, and an optional comment
    instructions: Vec<(usize, Vec<Instruction>, Option<String>)>,
}

/// Raw (not yet register-resolved) instruction line
struct RawInsn {
    line: usize,
    address: u64,
    op: Op,
    operands: Vec<String>,
    comment: Option<String>,
}

/// Lift a listing to a program.
pub fn lift_from(listing: &str) -> Result<Program, RecoveryError> {
    let perr = |line: usize, message: String| RecoveryError::Parse { line, message };

    let mut st = LiftState {
        name: None,
        arch: None,
        endianness: Endian::Little,
        register_overrides: vec![],
        imports: vec![],
        functions: vec![],
    };
    let mut raw_functions: Vec<(usize, String, u64, Vec<RawInsn>)> = vec![];
    let mut open_function: Option<(usize, String, u64, Vec<RawInsn>)> = None;
    let mut section = Section::None;

    for (idx, raw_line) in listing.lines().enumerate() {
        let lineno = idx + 1;
        let line = raw_line.split('#').next().unwrap_or("");
        let (line, comment) = match line.split_once(';') {
            Some((l, c)) => (l.trim(), Some(c.trim().to_owned()).filter(|c| !c.is_empty())),
            None => (line.trim(), None),
        };
        if line.is_empty() {
            continue;
        }
        match line {
            "PROGRAM" => {
                section = Section::Program;
                continue;
            }
            "REGISTERS" => {
                section = Section::Registers;
                continue;
            }
            "IMPORTS" => {
                section = Section::Imports;
                continue;
            }
            "LISTING" => {
                section = Section::Listing;
                continue;
            }
            _ => {}
        }
        let toks: Vec<&str> = line.split_whitespace().collect();
        match section {
            Section::None => {
                return Err(perr(lineno, format!("content outside of a section: {:?}", line)))
            }
            Section::Program => match toks.as_slice() {
                ["name", n] => st.name = Some(n.to_string()),
                ["arch", a] => {
                    st.arch = Some(
                        RegisterFile::by_arch_name(a)
                            .ok_or_else(|| perr(lineno, format!("unknown architecture {:?}", a)))?,
                    )
                }
                ["big_endian", "false"] => st.endianness = Endian::Little,
                ["big_endian", "true"] => st.endianness = Endian::Big,
                l => return Err(perr(lineno, format!("unexpected program fact {:?}", l))),
            },
            Section::Registers => st
                .register_overrides
                .push((lineno, toks.iter().map(|t| t.to_string()).collect())),
            Section::Imports => {
                if toks.len() < 3 {
                    return Err(perr(
                        lineno,
                        "expected `ADDRESS LIBRARY SYMBOL [ordinal=N] [var=N]`".into(),
                    ));
                }
                let mut fact = ImportFact {
                    address: parse_unsigned(toks[0]).map_err(|e| perr(lineno, e))?,
                    library: toks[1].to_owned(),
                    symbol: toks[2].to_owned(),
                    ordinal: None,
                    variable_id: None,
                };
                for t in &toks[3..] {
                    match t.split_once('=') {
                        Some(("ordinal", v)) => {
                            fact.ordinal =
                                Some(parse_unsigned(v).map_err(|e| perr(lineno, e))? as u32)
                        }
                        Some(("var", v)) => {
                            fact.variable_id =
                                Some(parse_unsigned(v).map_err(|e| perr(lineno, e))? as usize)
                        }
                        _ => {
                            return Err(perr(lineno, format!("unknown import attribute {:?}", t)))
                        }
                    }
                }
                st.imports.push(fact);
            }
            Section::Listing => match toks.as_slice() {
                ["function", name, entry] => {
                    if open_function.is_some() {
                        return Err(perr(lineno, "function started before `end`".into()));
                    }
                    let entry = parse_unsigned(entry).map_err(|e| perr(lineno, e))?;
                    open_function = Some((lineno, name.to_string(), entry, vec![]));
                }
                ["end"] => match open_function.take() {
                    Some(f) => raw_functions.push(f),
                    None => return Err(perr(lineno, "`end` without `function`".into())),
                },
                [addr, op, operands @ ..] => {
                    let f = open_function
                        .as_mut()
                        .ok_or_else(|| perr(lineno, "instruction outside a function".into()))?;
                    let op = *OPS_BY_NAME.get(*op).ok_or_else(|| {
                        perr(
                            lineno,
                            format!(
                                "unknown op {:?}; expected one of {}",
                                op,
                                OPS_BY_NAME.keys().join(", ")
                            ),
                        )
                    })?;
                    if operands.len() > 3 {
                        return Err(perr(lineno, "too many operands".into()));
                    }
                    f.3.push(RawInsn {
                        line: lineno,
                        address: parse_unsigned(addr).map_err(|e| perr(lineno, e))?,
                        op,
                        operands: operands.iter().map(|s| s.to_string()).collect(),
                        comment,
                    });
                }
                l => return Err(perr(lineno, format!("cannot parse listing line {:?}", l))),
            },
        }
    }
    if let Some((line, name, _, _)) = open_function {
        return Err(perr(line, format!("function {} is missing `end`", name)));
    }

    let rf = build_register_file(st.arch.take(), &st.register_overrides)?;

    for (line, name, entry, raws) in raw_functions {
        let mut instructions: Vec<(usize, Vec<Instruction>, Option<String>)> = vec![];
        for raw in raws {
            let mut vars = raw
                .operands
                .iter()
                .map(|t| parse_variable(t, &rf))
                .collect::<Result<Vec<Variable>, String>>()
                .map_err(|e| perr(raw.line, e))?;
            vars.resize(3, Variable::Unused);
            let ins = Instruction::new(
                raw.address,
                raw.op,
                vars[0].clone(),
                [vars[1].clone(), vars[2].clone()],
            );
            match instructions.last_mut() {
                Some((_, group, comment)) if group[0].address == raw.address => {
                    group.push(ins);
                    if comment.is_none() {
                        *comment = raw.comment;
                    }
                }
                _ => instructions.push((raw.line, vec![ins], raw.comment)),
            }
        }
        st.functions.push(ListedFunction {
            line,
            name,
            entry,
            instructions,
        });
    }

    debug!(
        "Parsed listing";
        "name" => st.name.as_deref().unwrap_or("<unnamed>"),
        "arch" => &rf.arch_name,
        "functions" => st.functions.len(),
        "imports" => st.imports.len(),
    );

    let mut prog = Program::new(rf, st.endianness);
    for f in st.functions {
        prog.begin_function(f.name.clone(), f.entry);
        for (line, group, comment) in f.instructions {
            let address = group[0].address;
            prog.try_add_one_machine_instruction(group)
                .map_err(|message| {
                    debug!("Invalid instruction"; "line" => line, "message" => &message);
                    RecoveryError::InvalidInstruction { address, message }
                })?;
            if let Some(c) = comment {
                prog.add_comment_to_machine_address(address, &c);
            }
        }
        prog.try_end_function().map_err(|e| perr(f.line, e))?;
    }
    for fact in st.imports {
        prog.add_import(fact);
    }

    if prog.instructions.is_empty() {
        return Err(RecoveryError::EmptyProgram);
    }
    Ok(prog)
}

fn build_register_file(
    base: Option<RegisterFile>,
    overrides: &[(usize, Vec<String>)],
) -> Result<RegisterFile, RecoveryError> {
    let perr = |line: usize, message: String| RecoveryError::Parse { line, message };
    let mut rf = base.unwrap_or(RegisterFile {
        arch_name: "custom".into(),
        word_size: 0,
        registers: vec![],
        stack_pointer: String::new(),
        instruction_pointer: String::new(),
    });
    for (line, toks) in overrides {
        let toks: Vec<&str> = toks.iter().map(|s| s.as_str()).collect();
        match toks.as_slice() {
            ["word", n] => rf.word_size = parse_unsigned(n).map_err(|e| perr(*line, e))? as usize,
            ["sp", n] => rf.stack_pointer = n.to_string(),
            ["ip", n] => rf.instruction_pointer = n.to_string(),
            ["reg", name, offset, size, rest @ ..] => {
                let info = RegisterInfo {
                    name: name.to_string(),
                    offset: parse_unsigned(offset).map_err(|e| perr(*line, e))? as usize,
                    size: parse_unsigned(size).map_err(|e| perr(*line, e))? as usize,
                    preserved: matches!(rest, ["preserved"]),
                };
                rf.registers.retain(|r| !r.name.eq_ignore_ascii_case(name));
                rf.registers.push(info);
            }
            l => return Err(perr(*line, format!("unexpected register fact {:?}", l))),
        }
    }
    if rf.word_size == 0 || rf.lookup(&rf.stack_pointer).is_none() {
        return Err(perr(
            0,
            "the listing names no architecture with a word size and a stack pointer".into(),
        ));
    }
    Ok(rf)
}

/// Lift the listing stored in the file at `path`
pub fn lift_from_file(path: &Path) -> Result<Program, RecoveryError> {
    let text = std::fs::read_to_string(path).map_err(|source| RecoveryError::Io {
        path: path.to_owned(),
        source,
    })?;
    lift_from(&text)
}

#[cfg(test)]
mod test {
    use super::*;

    const SMALL: &str = "
PROGRAM
name small
arch x86

IMPORTS
0x3000 msvcrt.dll rand var=7

LISTING
function main 0x1000
0x1000 IntSub ESP ESP const:4:4   ; push ebp
0x1000 Store _ [ESP]:4 EBP
0x1001 Copy EBP ESP
0x1003 Cbranch _ @0x1008 ZF
0x1005 Call _ @0x2000
0x1008 Return _
end
";

    #[test]
    fn lifts_small_listing() {
        let prog = lift_from(SMALL).unwrap();
        assert_eq!(prog.functions.len(), 1);
        assert_eq!(prog.get_il_addrs_for_machine_addr(0x1000), Some((0, 2)));
        assert_eq!(prog.imports[0].variable_id, Some(7));
        assert_eq!(
            prog.machine_insn_comments.get(&0x1000).map(|s| s.as_str()),
            Some("push ebp")
        );
        // Leaders: entry, after cbranch, after call, the cbranch target
        assert_eq!(prog.basic_blocks.len(), 3);
    }

    #[test]
    fn invalid_operand_is_a_parse_error() {
        let bad = SMALL.replace("Copy EBP ESP", "Copy EBP QQQ");
        match lift_from(&bad) {
            Err(RecoveryError::Parse { line, .. }) => assert_eq!(line, 13),
            r => panic!("unexpected {:?}", r.map(|p| p.instructions.len())),
        }
    }

    #[test]
    fn invalid_instruction_is_reported_with_its_address() {
        let bad = SMALL.replace("Copy EBP ESP", "Copy EBP const:1:2");
        assert!(matches!(
            lift_from(&bad),
            Err(RecoveryError::InvalidInstruction { address: 0x1001, .. })
        ));
    }

    #[test]
    fn constants_wrap_to_their_size() {
        let rf = RegisterFile::x86();
        assert_eq!(
            parse_variable("const:-1:2", &rf).unwrap(),
            Variable::Constant {
                value: 0xffff,
                size: 2
            }
        );
        assert_eq!(
            parse_variable("-2", &rf).unwrap(),
            Variable::ILOffset { offset: -2 }
        );
    }

    #[test]
    fn missing_file_is_an_io_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            lift_from_file(&dir.path().join("nope.listing")),
            Err(RecoveryError::Io { .. })
        ));
    }
}
