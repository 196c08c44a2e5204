//! Bit-vector terms and constraints over symbolic machine state.
//!
//! Widths are in bytes. Boolean values are one-byte terms holding `0` or `1`. Terms are built
//! through simplifying constructors, so that constant operands fold and memory reads through
//! stores with comparable addresses are resolved eagerly.

use std::rc::Rc;

use crate::il::Endian;

/// Bit-mask for a value of `width` bytes
pub fn mask(width: usize) -> u64 {
    if width >= 8 {
        u64::MAX
    } else {
        (1u64 << (8 * width)) - 1
    }
}

/// Sign-extend the low `width` bytes of `value` to 64 bits
pub fn sign_extend(value: u64, width: usize) -> i64 {
    if width >= 8 || width == 0 {
        value as i64
    } else {
        let shift = 64 - 8 * width as u32;
        ((value << shift) as i64) >> shift
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum UnOp {
    Neg,
    Not,
    BoolNot,
    Zext,
    Sext,
    /// Bytes `[offset, offset + width)` of the argument
    Extract { offset: usize },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    And,
    Or,
    Xor,
    Shl,
    LShr,
    AShr,
    Eq,
    Ne,
    Ult,
    Ule,
    Slt,
    Sle,
    BoolAnd,
    BoolOr,
    BoolXor,
}

impl BinOp {
    pub fn is_comparison(&self) -> bool {
        use BinOp::*;
        matches!(self, Eq | Ne | Ult | Ule | Slt | Sle)
    }

    pub fn is_boolean(&self) -> bool {
        use BinOp::*;
        matches!(self, BoolAnd | BoolOr | BoolXor) || self.is_comparison()
    }

    fn is_commutative(&self) -> bool {
        use BinOp::*;
        matches!(self, Add | Mul | And | Or | Xor | Eq | Ne | BoolAnd | BoolOr | BoolXor)
    }

    fn symbol(&self) -> &'static str {
        use BinOp::*;
        match self {
            Add => "+",
            Sub => "-",
            Mul => "*",
            And => "&",
            Or => "|",
            Xor => "^",
            Shl => "<<",
            LShr => ">>",
            AShr => "s>>",
            Eq => "==",
            Ne => "!=",
            Ult => "<",
            Ule => "<=",
            Slt => "s<",
            Sle => "s<=",
            BoolAnd => "&&",
            BoolOr => "||",
            BoolXor => "^^",
        }
    }

    /// Evaluate on already-masked operands of `width` bytes
    pub fn apply(&self, a: u64, b: u64, width: usize) -> u64 {
        use BinOp::*;
        let m = mask(width);
        let bits = 8 * width as u64;
        match self {
            Add => a.wrapping_add(b) & m,
            Sub => a.wrapping_sub(b) & m,
            Mul => a.wrapping_mul(b) & m,
            And => a & b,
            Or => a | b,
            Xor => a ^ b,
            Shl => {
                if b >= bits {
                    0
                } else {
                    (a << b) & m
                }
            }
            LShr => {
                if b >= bits {
                    0
                } else {
                    a >> b
                }
            }
            AShr => {
                let s = sign_extend(a, width);
                let sh = b.min(bits.saturating_sub(1)) as u32;
                ((s >> sh) as u64) & m
            }
            Eq => (a == b) as u64,
            Ne => (a != b) as u64,
            Ult => (a < b) as u64,
            Ule => (a <= b) as u64,
            Slt => (sign_extend(a, width) < sign_extend(b, width)) as u64,
            Sle => (sign_extend(a, width) <= sign_extend(b, width)) as u64,
            BoolAnd => (a != 0 && b != 0) as u64,
            BoolOr => (a != 0 || b != 0) as u64,
            BoolXor => ((a != 0) != (b != 0)) as u64,
        }
    }
}

/// A symbolic memory state.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Memory {
    /// Unconstrained initial (or havocked) memory
    Var(Rc<str>),
    Store {
        base: Rc<Memory>,
        address: Rc<Term>,
        value: Rc<Term>,
        size: usize,
    },
}

/// A bit-vector term.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Term {
    Const {
        value: u64,
        width: usize,
    },
    Var {
        name: Rc<str>,
        width: usize,
    },
    Unary {
        op: UnOp,
        arg: Rc<Term>,
        width: usize,
    },
    Binary {
        op: BinOp,
        lhs: Rc<Term>,
        rhs: Rc<Term>,
        width: usize,
    },
    Load {
        memory: Rc<Memory>,
        address: Rc<Term>,
        size: usize,
        endian: EndianTag,
    },
}

/// Byte order tag carried by loads and stores. A plain copy of [`Endian`] that can be ordered and
/// hashed.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum EndianTag {
    Little,
    Big,
}

impl From<Endian> for EndianTag {
    fn from(e: Endian) -> Self {
        match e {
            Endian::Little => EndianTag::Little,
            Endian::Big => EndianTag::Big,
        }
    }
}

impl Term {
    pub fn width(&self) -> usize {
        match self {
            Term::Const { width, .. }
            | Term::Var { width, .. }
            | Term::Unary { width, .. }
            | Term::Binary { width, .. } => *width,
            Term::Load { size, .. } => *size,
        }
    }

    pub fn as_const(&self) -> Option<u64> {
        match self {
            Term::Const { value, .. } => Some(*value),
            _ => None,
        }
    }

    pub fn constant(value: u64, width: usize) -> Rc<Term> {
        Rc::new(Term::Const {
            value: value & mask(width),
            width,
        })
    }

    pub fn var(name: impl Into<Rc<str>>, width: usize) -> Rc<Term> {
        Rc::new(Term::Var {
            name: name.into(),
            width,
        })
    }

    /// Split into a symbolic base and a constant offset
    pub fn base_offset(t: &Rc<Term>) -> (Option<Rc<Term>>, u64) {
        match &**t {
            Term::Const { value, .. } => (None, *value),
            Term::Binary {
                op: BinOp::Add,
                lhs,
                rhs,
                ..
            } => match rhs.as_const() {
                Some(c) => (Some(lhs.clone()), c),
                None => (Some(t.clone()), 0),
            },
            _ => (Some(t.clone()), 0),
        }
    }

    pub fn unary(op: UnOp, arg: Rc<Term>, width: usize) -> Rc<Term> {
        let aw = arg.width();
        if let Some(a) = arg.as_const() {
            let v = match op {
                UnOp::Neg => 0u64.wrapping_sub(a),
                UnOp::Not => !a,
                UnOp::BoolNot => (a == 0) as u64,
                UnOp::Zext => a,
                UnOp::Sext => sign_extend(a, aw) as u64,
                UnOp::Extract { offset } => {
                    if offset >= 8 {
                        0
                    } else {
                        a >> (8 * offset)
                    }
                }
            };
            return Term::constant(v, width);
        }
        match (op, &*arg) {
            (UnOp::Zext, _) | (UnOp::Sext, _) if aw == width => return arg,
            (UnOp::Extract { offset: 0 }, _) if aw == width => return arg,
            (UnOp::BoolNot, Term::Unary {
                op: UnOp::BoolNot,
                arg: inner,
                ..
            }) if inner.is_boolean() => return inner.clone(),
            (UnOp::BoolNot, Term::Binary { op: bop, lhs, rhs, .. }) if bop.is_comparison() => {
                let flipped = match bop {
                    BinOp::Eq => Some((BinOp::Ne, lhs, rhs)),
                    BinOp::Ne => Some((BinOp::Eq, lhs, rhs)),
                    BinOp::Ult => Some((BinOp::Ule, rhs, lhs)),
                    BinOp::Ule => Some((BinOp::Ult, rhs, lhs)),
                    BinOp::Slt => Some((BinOp::Sle, rhs, lhs)),
                    BinOp::Sle => Some((BinOp::Slt, rhs, lhs)),
                    _ => None,
                };
                if let Some((o, l, r)) = flipped {
                    return Term::binary(o, l.clone(), r.clone());
                }
            }
            _ => {}
        }
        Rc::new(Term::Unary { op, arg, width })
    }

    /// Whether the term only ever takes the values `0` and `1`
    pub fn is_boolean(&self) -> bool {
        match self {
            Term::Const { value, width } => *width == 1 && *value <= 1,
            Term::Binary { op, .. } => op.is_boolean(),
            Term::Unary {
                op: UnOp::BoolNot, ..
            } => true,
            _ => false,
        }
    }

    pub fn binary(op: BinOp, lhs: Rc<Term>, rhs: Rc<Term>) -> Rc<Term> {
        let width = if op.is_comparison() { 1 } else { lhs.width() };
        let w = lhs.width();
        match (lhs.as_const(), rhs.as_const()) {
            (Some(a), Some(b)) => return Term::constant(op.apply(a, b, w), width),
            (Some(_), None) if op.is_commutative() => return Term::binary(op, rhs, lhs),
            _ => {}
        }
        if let Some(c) = rhs.as_const() {
            match op {
                BinOp::Add | BinOp::Sub | BinOp::Or | BinOp::Xor | BinOp::Shl | BinOp::LShr
                | BinOp::AShr
                    if c == 0 =>
                {
                    return lhs
                }
                BinOp::Sub => {
                    return Term::binary(BinOp::Add, lhs, Term::constant(0u64.wrapping_sub(c), w))
                }
                BinOp::Add => {
                    if let Term::Binary {
                        op: BinOp::Add,
                        lhs: inner,
                        rhs: c1,
                        ..
                    } = &*lhs
                    {
                        if let Some(c1) = c1.as_const() {
                            return Term::binary(
                                BinOp::Add,
                                inner.clone(),
                                Term::constant(c1.wrapping_add(c), w),
                            );
                        }
                    }
                }
                BinOp::Mul if c == 1 => return lhs,
                BinOp::Mul | BinOp::And if c == 0 => return Term::constant(0, w),
                BinOp::And if c == mask(w) => return lhs,
                BinOp::BoolAnd => {
                    return if c == 0 {
                        Term::constant(0, 1)
                    } else {
                        Term::binary(BinOp::Ne, lhs.clone(), Term::constant(0, w))
                            .keep_if_boolean(lhs)
                    }
                }
                BinOp::BoolOr => {
                    return if c != 0 {
                        Term::constant(1, 1)
                    } else {
                        Term::binary(BinOp::Ne, lhs.clone(), Term::constant(0, w))
                            .keep_if_boolean(lhs)
                    }
                }
                BinOp::BoolXor | BinOp::Xor if c == 1 && lhs.is_boolean() => {
                    return Term::unary(UnOp::BoolNot, lhs, 1)
                }
                BinOp::Eq if c == 0 && lhs.is_boolean() => {
                    return Term::unary(UnOp::BoolNot, lhs, 1)
                }
                BinOp::Ne if c == 0 && lhs.is_boolean() => return lhs,
                BinOp::Eq if c == 1 && lhs.is_boolean() => return lhs,
                _ => {}
            }
        }
        if lhs == rhs {
            match op {
                BinOp::Sub | BinOp::Xor => return Term::constant(0, w),
                BinOp::Eq | BinOp::Ule | BinOp::Sle => return Term::constant(1, 1),
                BinOp::Ne | BinOp::Ult | BinOp::Slt => return Term::constant(0, 1),
                BinOp::And | BinOp::Or => return lhs,
                _ => {}
            }
        }
        Rc::new(Term::Binary {
            op,
            lhs,
            rhs,
            width,
        })
    }

    /// `self` unless `orig` is already boolean, in which case `orig`
    fn keep_if_boolean(self: Rc<Self>, orig: Rc<Term>) -> Rc<Term> {
        if orig.is_boolean() {
            orig
        } else {
            self
        }
    }

    /// Read `size` bytes at `address` from `memory`, resolving through stores whose addresses are
    /// comparable with `address`.
    pub fn load(memory: &Rc<Memory>, address: Rc<Term>, size: usize, endian: EndianTag) -> Rc<Term> {
        let addr_width = address.width();
        let (lbase, loff) = Term::base_offset(&address);
        let mut cur = memory.clone();
        loop {
            let next = match &*cur {
                Memory::Var(_) => break,
                Memory::Store {
                    base,
                    address: saddr,
                    value,
                    size: ssize,
                } => {
                    let (sbase, soff) = Term::base_offset(saddr);
                    if sbase != lbase {
                        break;
                    }
                    let d = sign_extend(loff.wrapping_sub(soff) & mask(addr_width), addr_width);
                    let (ls, ss) = (size as i64, *ssize as i64);
                    if d >= ss || -d >= ls {
                        // Disjoint
                        base.clone()
                    } else if d >= 0 && d + ls <= ss {
                        let offset = match endian {
                            EndianTag::Little => d as usize,
                            EndianTag::Big => (ss - d - ls) as usize,
                        };
                        return Term::unary(UnOp::Extract { offset }, value.clone(), size);
                    } else {
                        break;
                    }
                }
            };
            cur = next;
        }
        Rc::new(Term::Load {
            memory: cur,
            address,
            size,
            endian,
        })
    }

    /// Evaluate under an assignment to variables. `None` if a variable is unassigned or the term
    /// reads memory.
    pub fn eval(&self, env: &dyn Fn(&str) -> Option<u64>) -> Option<u64> {
        Some(match self {
            Term::Const { value, .. } => *value,
            Term::Var { name, width } => env(name)? & mask(*width),
            Term::Unary { op, arg, width } => {
                let a = arg.eval(env)?;
                let aw = arg.width();
                let v = match op {
                    UnOp::Neg => 0u64.wrapping_sub(a),
                    UnOp::Not => !a,
                    UnOp::BoolNot => (a == 0) as u64,
                    UnOp::Zext => a,
                    UnOp::Sext => sign_extend(a, aw) as u64,
                    UnOp::Extract { offset } => {
                        if *offset >= 8 {
                            0
                        } else {
                            a >> (8 * offset)
                        }
                    }
                };
                v & mask(*width)
            }
            Term::Binary { op, lhs, rhs, .. } => {
                op.apply(lhs.eval(env)?, rhs.eval(env)?, lhs.width())
            }
            Term::Load { .. } => return None,
        })
    }

    /// Names of all variables in the term, loads excluded
    pub fn collect_vars(&self, out: &mut std::collections::BTreeMap<Rc<str>, usize>) {
        match self {
            Term::Const { .. } | Term::Load { .. } => {}
            Term::Var { name, width } => {
                out.insert(name.clone(), *width);
            }
            Term::Unary { arg, .. } => arg.collect_vars(out),
            Term::Binary { lhs, rhs, .. } => {
                lhs.collect_vars(out);
                rhs.collect_vars(out);
            }
        }
    }

    /// All memory reads appearing in the term (not descending into their addresses)
    pub fn collect_loads(self: &Rc<Self>, out: &mut Vec<Rc<Term>>) {
        match &**self {
            Term::Const { .. } | Term::Var { .. } => {}
            Term::Load { .. } => {
                if !out.contains(self) {
                    out.push(self.clone())
                }
            }
            Term::Unary { arg, .. } => arg.collect_loads(out),
            Term::Binary { lhs, rhs, .. } => {
                lhs.collect_loads(out);
                rhs.collect_loads(out);
            }
        }
    }

    /// Rebuild the term with `f` applied bottom-up to every memory read
    pub fn map_loads(self: &Rc<Self>, f: &mut dyn FnMut(&Rc<Term>) -> Rc<Term>) -> Rc<Term> {
        match &**self {
            Term::Const { .. } | Term::Var { .. } => self.clone(),
            Term::Load { .. } => f(self),
            Term::Unary { op, arg, width } => Term::unary(*op, arg.map_loads(f), *width),
            Term::Binary { op, lhs, rhs, .. } => {
                Term::binary(*op, lhs.map_loads(f), rhs.map_loads(f))
            }
        }
    }

    /// SMT-LIB rendering. Values are bit-vectors of `8 * width` bits; memory is an array from
    /// addresses to bytes.
    pub fn to_smtlib(&self) -> String {
        let bv = |w: usize| 8 * w;
        let boolbv = |cond: String| format!("(ite {} #x01 #x00)", cond);
        match self {
            Term::Const { value, width } => format!("(_ bv{} {})", value, bv(*width)),
            Term::Var { name, .. } => smt_symbol(name),
            Term::Unary { op, arg, width } => {
                let a = arg.to_smtlib();
                let aw = arg.width();
                match op {
                    UnOp::Neg => format!("(bvneg {})", a),
                    UnOp::Not => format!("(bvnot {})", a),
                    UnOp::BoolNot => boolbv(format!("(= {} #x00)", a)),
                    UnOp::Zext => format!("((_ zero_extend {}) {})", bv(width - aw), a),
                    UnOp::Sext => format!("((_ sign_extend {}) {})", bv(width - aw), a),
                    UnOp::Extract { offset } => format!(
                        "((_ extract {} {}) {})",
                        bv(offset + width) - 1,
                        bv(*offset),
                        a
                    ),
                }
            }
            Term::Binary { op, lhs, rhs, .. } => {
                let (a, b) = (lhs.to_smtlib(), rhs.to_smtlib());
                let bin = |f: &str| format!("({} {} {})", f, a, b);
                match op {
                    BinOp::Add => bin("bvadd"),
                    BinOp::Sub => bin("bvsub"),
                    BinOp::Mul => bin("bvmul"),
                    BinOp::And => bin("bvand"),
                    BinOp::Or => bin("bvor"),
                    BinOp::Xor => bin("bvxor"),
                    BinOp::Shl => bin("bvshl"),
                    BinOp::LShr => bin("bvlshr"),
                    BinOp::AShr => bin("bvashr"),
                    BinOp::Eq => boolbv(bin("=")),
                    BinOp::Ne => boolbv(format!("(not {})", bin("="))),
                    BinOp::Ult => boolbv(bin("bvult")),
                    BinOp::Ule => boolbv(bin("bvule")),
                    BinOp::Slt => boolbv(bin("bvslt")),
                    BinOp::Sle => boolbv(bin("bvsle")),
                    BinOp::BoolAnd => boolbv(format!(
                        "(and (not (= {} #x00)) (not (= {} #x00)))",
                        a, b
                    )),
                    BinOp::BoolOr => boolbv(format!(
                        "(or (not (= {} #x00)) (not (= {} #x00)))",
                        a, b
                    )),
                    BinOp::BoolXor => boolbv(format!(
                        "(xor (not (= {} #x00)) (not (= {} #x00)))",
                        a, b
                    )),
                }
            }
            Term::Load {
                memory,
                address,
                size,
                endian,
            } => {
                let m = memory.to_smtlib_with(*endian);
                let a = address.to_smtlib();
                let aw = address.width();
                let byte = |i: usize| {
                    if i == 0 {
                        format!("(select {} {})", m, a)
                    } else {
                        format!("(select {} (bvadd {} (_ bv{} {})))", m, a, i, bv(aw))
                    }
                };
                if *size == 1 {
                    return byte(0);
                }
                // `concat` takes the most significant part first
                let order: Vec<usize> = match endian {
                    EndianTag::Little => (0..*size).rev().collect(),
                    EndianTag::Big => (0..*size).collect(),
                };
                format!(
                    "(concat {})",
                    order.into_iter().map(byte).collect::<Vec<_>>().join(" ")
                )
            }
        }
    }
}

impl Memory {
    pub fn var(name: impl Into<Rc<str>>) -> Rc<Memory> {
        Rc::new(Memory::Var(name.into()))
    }

    pub fn store(base: &Rc<Memory>, address: Rc<Term>, value: Rc<Term>) -> Rc<Memory> {
        let size = value.width();
        Rc::new(Memory::Store {
            base: base.clone(),
            address,
            value,
            size,
        })
    }

    /// Name of the memory variable at the bottom of the store chain
    pub fn root(&self) -> &Rc<str> {
        match self {
            Memory::Var(n) => n,
            Memory::Store { base, .. } => base.root(),
        }
    }

    pub fn to_smtlib_with(&self, endian: EndianTag) -> String {
        match self {
            Memory::Var(n) => smt_symbol(n),
            Memory::Store {
                base,
                address,
                value,
                size,
            } => {
                let mut m = base.to_smtlib_with(endian);
                let a = address.to_smtlib();
                let v = value.to_smtlib();
                let aw = address.width();
                for i in 0..*size {
                    let byte_index = match endian {
                        EndianTag::Little => i,
                        EndianTag::Big => size - 1 - i,
                    };
                    let addr = if i == 0 {
                        a.clone()
                    } else {
                        format!("(bvadd {} (_ bv{} {}))", a, i, 8 * aw)
                    };
                    m = format!(
                        "(store {} {} ((_ extract {} {}) {}))",
                        m,
                        addr,
                        8 * byte_index + 7,
                        8 * byte_index,
                        v
                    );
                }
                m
            }
        }
    }
}

/// Quote a symbol if needed
pub fn smt_symbol(name: &str) -> String {
    if name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || "_.!$%&*+-/<=>?@^~".contains(c))
        && !name.starts_with(|c: char| c.is_ascii_digit())
    {
        name.to_owned()
    } else {
        format!("|{}|", name.replace('|', "_"))
    }
}

impl std::fmt::Display for Term {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Term::Const { value, .. } => {
                if *value < 10 {
                    write!(f, "{}", value)
                } else {
                    write!(f, "{:#x}", value)
                }
            }
            Term::Var { name, .. } => write!(f, "{}", name),
            Term::Unary { op, arg, width } => match op {
                UnOp::Neg => write!(f, "-({})", arg),
                UnOp::Not => write!(f, "~({})", arg),
                UnOp::BoolNot => write!(f, "!({})", arg),
                UnOp::Zext => write!(f, "zext{}({})", 8 * width, arg),
                UnOp::Sext => write!(f, "sext{}({})", 8 * width, arg),
                UnOp::Extract { offset } => {
                    write!(f, "{}[{}..{}]", arg, 8 * offset, 8 * (offset + width))
                }
            },
            Term::Binary { op, lhs, rhs, .. } => write!(f, "({} {} {})", lhs, op.symbol(), rhs),
            Term::Load {
                memory,
                address,
                size,
                ..
            } => write!(f, "{}[{}]:{}", memory.root(), address, size),
        }
    }
}

/// A path constraint: `term` is non-zero iff `holds`.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Constraint {
    pub term: Rc<Term>,
    pub holds: bool,
}

impl Constraint {
    pub fn new(term: Rc<Term>, holds: bool) -> Self {
        Self { term, holds }
    }

    /// Split into simpler equivalent conjuncts. A constraint that is trivially true disappears; a
    /// trivially false one is kept as the constant `0`.
    pub fn normalize(self) -> Vec<Constraint> {
        let mut out = vec![];
        let mut work = vec![self];
        while let Some(c) = work.pop() {
            if let Some(v) = c.term.as_const() {
                if (v != 0) != c.holds {
                    return vec![Constraint::new(Term::constant(0, 1), true)];
                }
                continue;
            }
            match &*c.term {
                Term::Unary {
                    op: UnOp::BoolNot,
                    arg,
                    ..
                } => work.push(Constraint::new(arg.clone(), !c.holds)),
                Term::Binary {
                    op: BinOp::BoolAnd,
                    lhs,
                    rhs,
                    ..
                } if c.holds => {
                    work.push(Constraint::new(lhs.clone(), true));
                    work.push(Constraint::new(rhs.clone(), true));
                }
                Term::Binary {
                    op: BinOp::BoolOr,
                    lhs,
                    rhs,
                    ..
                } if !c.holds => {
                    work.push(Constraint::new(lhs.clone(), false));
                    work.push(Constraint::new(rhs.clone(), false));
                }
                Term::Binary { op, lhs, rhs, .. } if !c.holds && op.is_comparison() => {
                    let negated = Term::unary(
                        UnOp::BoolNot,
                        Rc::new(Term::Binary {
                            op: *op,
                            lhs: lhs.clone(),
                            rhs: rhs.clone(),
                            width: 1,
                        }),
                        1,
                    );
                    if matches!(&*negated, Term::Binary { .. }) {
                        work.push(Constraint::new(negated, true));
                    } else {
                        out.push(c);
                    }
                }
                _ => out.push(c),
            }
        }
        out
    }

    /// Whether the constraint is the trivially false constant
    pub fn is_false(&self) -> bool {
        matches!(self.term.as_const(), Some(v) if (v != 0) != self.holds)
    }

    pub fn eval(&self, env: &dyn Fn(&str) -> Option<u64>) -> Option<bool> {
        self.term.eval(env).map(|v| (v != 0) == self.holds)
    }

    pub fn to_smtlib(&self) -> String {
        if self.holds {
            format!("(not (= {} (_ bv0 {})))", self.term.to_smtlib(), 8 * self.term.width())
        } else {
            format!("(= {} (_ bv0 {}))", self.term.to_smtlib(), 8 * self.term.width())
        }
    }
}

impl std::fmt::Display for Constraint {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        if self.holds {
            write!(f, "{}", self.term)
        } else {
            write!(f, "!{}", self.term)
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn constants_fold_and_offsets_merge() {
        let x = Term::var("x", 4);
        let t = Term::binary(
            BinOp::Add,
            Term::binary(BinOp::Sub, x.clone(), Term::constant(4, 4)),
            Term::constant(12, 4),
        );
        assert_eq!(t, Term::binary(BinOp::Add, x.clone(), Term::constant(8, 4)));
        assert_eq!(
            Term::binary(BinOp::Add, Term::constant(0xffff_ffff, 4), Term::constant(2, 4))
                .as_const(),
            Some(1)
        );
    }

    #[test]
    fn loads_resolve_through_comparable_stores() {
        let sp = Term::var("ESP_0", 4);
        let m0 = Memory::var("mem_0");
        let v = Term::var("EBP_0", 4);
        let below = Term::binary(BinOp::Add, sp.clone(), Term::constant(0xffff_fffc, 4));
        let m1 = Memory::store(&m0, below.clone(), v.clone());
        assert_eq!(Term::load(&m1, below.clone(), 4, EndianTag::Little), v);
        // Disjoint read skips the store
        let above = Term::binary(BinOp::Add, sp.clone(), Term::constant(4, 4));
        match &*Term::load(&m1, above, 4, EndianTag::Little) {
            Term::Load { memory, .. } => assert_eq!(memory, &m0),
            t => panic!("unexpected {:?}", t),
        }
        // Unrelated base stays a read of the stored memory
        let other = Term::var("EAX_0", 4);
        match &*Term::load(&m1, other, 4, EndianTag::Little) {
            Term::Load { memory, .. } => assert_eq!(memory, &m1),
            t => panic!("unexpected {:?}", t),
        }
    }

    #[test]
    fn negated_comparisons_normalize() {
        let n = Term::var("n", 4);
        let c = Constraint::new(Term::binary(BinOp::Slt, Term::constant(2, 4), n.clone()), false);
        let norm = c.normalize();
        assert_eq!(norm.len(), 1);
        assert_eq!(
            norm[0],
            Constraint::new(Term::binary(BinOp::Sle, n, Term::constant(2, 4)), true)
        );
    }

    #[test]
    fn eval_respects_signedness() {
        let x = Term::var("x", 4);
        let t = Term::binary(BinOp::Slt, x.clone(), Term::constant(3, 4));
        assert_eq!(t.eval(&|_| Some(0xffff_ffff)), Some(1));
        let t = Term::binary(BinOp::Ult, x, Term::constant(3, 4));
        assert_eq!(t.eval(&|_| Some(0xffff_ffff)), Some(0));
    }
}
