//! In-process decision of path conditions with z3. Terms become bit-vectors and memories become
//! arrays from addresses to bytes, so reads through unrelated pointers alias exactly when the model
//! says so.

use std::collections::BTreeMap;
use std::rc::Rc;

use z3::ast::{Array, Ast, Bool, BV};
use z3::{Config, Context, Params, SatResult, Solver, Sort};

use crate::constraint_solver::Decision;
use crate::log::*;
use crate::term::{BinOp, Constraint, EndianTag, Memory, Term, UnOp};

fn bits(width: usize) -> u32 {
    8 * width as u32
}

/// `v` zero-extended or truncated to `size` bits
fn resize<'ctx>(v: BV<'ctx>, size: u32) -> BV<'ctx> {
    let have = v.get_size();
    if have < size {
        v.zero_ext(size - have)
    } else if have > size {
        v.extract(size - 1, 0)
    } else {
        v
    }
}

/// `v` sign-extended or truncated to `size` bits
fn sign_resize<'ctx>(v: BV<'ctx>, size: u32) -> BV<'ctx> {
    let have = v.get_size();
    if have < size {
        v.sign_ext(size - have)
    } else {
        resize(v, size)
    }
}

struct Translator<'ctx> {
    ctx: &'ctx Context,
    vars: BTreeMap<Rc<str>, BV<'ctx>>,
}

impl<'ctx> Translator<'ctx> {
    fn constant(&self, value: u64, size: u32) -> BV<'ctx> {
        BV::from_u64(self.ctx, value, size)
    }

    /// Booleans are bit-vectors holding `0` or `1`
    fn bool_value(&self, b: &Bool<'ctx>, width: usize) -> BV<'ctx> {
        b.ite(
            &self.constant(1, bits(width)),
            &self.constant(0, bits(width)),
        )
    }

    fn truthy(&self, v: &BV<'ctx>) -> Bool<'ctx> {
        v._eq(&self.constant(0, v.get_size())).not()
    }

    fn term(&mut self, t: &Term) -> BV<'ctx> {
        match t {
            Term::Const { value, width } => self.constant(*value, bits(*width)),
            Term::Var { name, width } => {
                let ctx = self.ctx;
                let v = self
                    .vars
                    .entry(name.clone())
                    .or_insert_with(|| BV::new_const(ctx, &**name, bits(*width)))
                    .clone();
                resize(v, bits(*width))
            }
            Term::Load {
                memory,
                address,
                size,
                endian,
            } => {
                let address = self.term(address);
                let memory = self.memory(memory, address.get_size(), *endian);
                let bytes: Vec<BV<'ctx>> = (0..*size)
                    .map(|i| self.byte(&memory, &address, i))
                    .collect();
                let mut order: Vec<&BV<'ctx>> = bytes.iter().collect();
                if *endian == EndianTag::Little {
                    order.reverse();
                }
                let (first, rest) = match order.split_first() {
                    Some(split) => split,
                    None => return self.constant(0, 8),
                };
                rest.iter().fold((*first).clone(), |acc, b| acc.concat(b))
            }
            Term::Unary { op, arg, width } => {
                let a = self.term(arg);
                let size = bits(*width);
                match op {
                    UnOp::Neg => resize(a.bvneg(), size),
                    UnOp::Not => resize(a.bvnot(), size),
                    UnOp::BoolNot => self.bool_value(&self.truthy(&a).not(), *width),
                    UnOp::Zext => resize(a, size),
                    UnOp::Sext => sign_resize(a, size),
                    UnOp::Extract { offset } => {
                        let low = bits(*offset);
                        if low >= a.get_size() {
                            self.constant(0, size)
                        } else {
                            let high = a.get_size() - 1;
                            resize(a.extract(high, low), size)
                        }
                    }
                }
            }
            Term::Binary {
                op,
                lhs,
                rhs,
                width,
            } => {
                let a = self.term(lhs);
                let b = self.term(rhs);
                self.binary(*op, a, b, *width)
            }
        }
    }

    /// Byte `i` past `address`
    fn byte(&self, memory: &Array<'ctx>, address: &BV<'ctx>, i: usize) -> BV<'ctx> {
        let at = address.bvadd(&self.constant(i as u64, address.get_size()));
        memory
            .select(&at)
            .as_bv()
            .unwrap_or_else(|| BV::fresh_const(self.ctx, "byte", 8))
    }

    fn memory(&mut self, m: &Memory, address_bits: u32, endian: EndianTag) -> Array<'ctx> {
        match m {
            Memory::Var(name) => Array::new_const(
                self.ctx,
                &**name,
                &Sort::bitvector(self.ctx, address_bits),
                &Sort::bitvector(self.ctx, 8),
            ),
            Memory::Store {
                base,
                address,
                value,
                size,
            } => {
                let mut memory = self.memory(base, address_bits, endian);
                let address = resize(self.term(address), address_bits);
                let value = resize(self.term(value), bits(*size));
                for i in 0..*size {
                    let k = match endian {
                        EndianTag::Little => i,
                        EndianTag::Big => *size - 1 - i,
                    } as u32;
                    let byte = value.extract(8 * k + 7, 8 * k);
                    let at = address.bvadd(&self.constant(i as u64, address_bits));
                    memory = memory.store(&at, &byte);
                }
                memory
            }
        }
    }

    fn binary(&self, op: BinOp, a: BV<'ctx>, b: BV<'ctx>, width: usize) -> BV<'ctx> {
        use BinOp::*;
        let size = bits(width);
        let operand = a.get_size();
        match op {
            // The shift amount may be wider than the value; shift at the wider size
            Shl | LShr | AShr => {
                let wide = operand.max(b.get_size());
                let amount = resize(b, wide);
                let shifted = match op {
                    Shl => resize(a, wide).bvshl(&amount),
                    LShr => resize(a, wide).bvlshr(&amount),
                    _ => sign_resize(a, wide).bvashr(&amount),
                };
                resize(resize(shifted, operand), size)
            }
            BoolAnd | BoolOr | BoolXor => {
                let (x, y) = (self.truthy(&a), self.truthy(&b));
                let r = match op {
                    BoolAnd => Bool::and(self.ctx, &[&x, &y]),
                    BoolOr => Bool::or(self.ctx, &[&x, &y]),
                    _ => x.xor(&y),
                };
                self.bool_value(&r, width)
            }
            _ => {
                let b = resize(b, operand);
                if op.is_comparison() {
                    let r = match op {
                        Eq => a._eq(&b),
                        Ne => a._eq(&b).not(),
                        Ult => a.bvult(&b),
                        Ule => a.bvule(&b),
                        Slt => a.bvslt(&b),
                        _ => a.bvsle(&b),
                    };
                    return self.bool_value(&r, width);
                }
                let r = match op {
                    Add => a.bvadd(&b),
                    Sub => a.bvsub(&b),
                    Mul => a.bvmul(&b),
                    And => a.bvand(&b),
                    Or => a.bvor(&b),
                    _ => a.bvxor(&b),
                };
                resize(r, size)
            }
        }
    }
}

/// Decide the conjunction of `constraints`. A model also values each of the named `loads`.
pub(crate) fn decide(
    constraints: &[Constraint],
    loads: &[(Rc<str>, Rc<Term>)],
    timeout_ms: u32,
) -> Decision {
    let cfg = Config::new();
    let ctx = Context::new(&cfg);
    let solver = Solver::new(&ctx);
    if timeout_ms > 0 {
        let mut params = Params::new(&ctx);
        params.set_u32("timeout", timeout_ms);
        solver.set_params(&params);
    }
    let mut tr = Translator {
        ctx: &ctx,
        vars: BTreeMap::new(),
    };
    for c in constraints {
        let v = tr.term(&c.term);
        let holds = tr.truthy(&v);
        solver.assert(&if c.holds { holds } else { holds.not() });
    }
    let reads: Vec<(Rc<str>, BV)> = loads
        .iter()
        .map(|(n, l)| (n.clone(), tr.term(l)))
        .collect();
    match solver.check() {
        SatResult::Unsat => Decision::Unsat,
        SatResult::Unknown => {
            let reason = solver
                .get_reason_unknown()
                .unwrap_or_else(|| "z3 returned unknown".into());
            debug!("Path condition undecided"; "reason" => &reason);
            Decision::Unknown(reason)
        }
        SatResult::Sat => match solver.get_model() {
            Some(model) => Decision::Sat(
                tr.vars
                    .iter()
                    .chain(reads.iter().map(|(n, v)| (n, v)))
                    .filter_map(|(n, v)| {
                        let value = model.eval(v, true)?.as_u64()?;
                        Some((n.clone(), value))
                    })
                    .collect(),
            ),
            None => Decision::Unknown("z3 produced no model".into()),
        },
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn x() -> Rc<Term> {
        Term::var("x", 1)
    }

    fn model(constraints: &[Constraint]) -> BTreeMap<Rc<str>, u64> {
        match decide(constraints, &[], 0) {
            Decision::Sat(m) => m,
            Decision::Unsat => panic!("unexpected unsat"),
            Decision::Unknown(r) => panic!("unexpected unknown: {}", r),
        }
    }

    #[test]
    fn signed_comparisons_follow_the_width() {
        // x s< 0 for a byte means the top bit is set
        let m = model(&[
            Constraint::new(Term::binary(BinOp::Slt, x(), Term::constant(0, 1)), true),
            Constraint::new(Term::binary(BinOp::Ult, x(), Term::constant(0x81, 1)), true),
        ]);
        assert_eq!(m[&Rc::from("x")], 0x80);
    }

    #[test]
    fn negated_constraints_are_honored() {
        let zero = Term::binary(BinOp::Eq, x(), Term::constant(0, 1));
        let m = model(&[
            Constraint::new(zero, false),
            Constraint::new(Term::binary(BinOp::Ule, x(), Term::constant(1, 1)), true),
        ]);
        assert_eq!(m[&Rc::from("x")], 1);
    }

    #[test]
    fn wide_shift_amounts_clear_the_value() {
        // Shifting a byte by 8 or more leaves nothing
        let s = Term::var("s", 4);
        let shifted = Term::binary(BinOp::Shl, Term::constant(1, 1), s.clone());
        let cs = [
            Constraint::new(Term::binary(BinOp::Eq, shifted, Term::constant(0, 1)), true),
            Constraint::new(Term::binary(BinOp::Ult, s, Term::constant(9, 4)), true),
        ];
        assert_eq!(model(&cs)[&Rc::from("s")], 8);
    }

    #[test]
    fn stores_through_equal_pointers_are_seen_by_reads() {
        let p = Term::var("p", 4);
        let q = Term::var("q", 4);
        let mem = Memory::store(&Memory::var("mem_0"), p.clone(), Term::constant(5, 4));
        let read = Term::load(&mem, q.clone(), 4, EndianTag::Little);
        let same = Constraint::new(Term::binary(BinOp::Eq, p, q), true);
        let six = Constraint::new(Term::binary(BinOp::Eq, read.clone(), Term::constant(6, 4)), true);
        assert!(matches!(
            decide(&[same, six.clone()], &[], 0),
            Decision::Unsat
        ));
        // Unless `q` equals `p` the read is unconstrained
        let loads = [(Rc::<str>::from("load!0"), read)];
        match decide(&[six], &loads, 0) {
            Decision::Sat(m) => assert_eq!(m["load!0"], 6),
            _ => panic!("expected a model"),
        }
    }

    #[test]
    fn byte_order_follows_the_tag() {
        let p = Term::var("p", 4);
        let alias = Term::var("alias", 4);
        let mem = Memory::store(&Memory::var("mem_0"), p.clone(), Term::constant(0x1122, 2));
        for (endian, first) in [(EndianTag::Little, 0x22), (EndianTag::Big, 0x11)] {
            let read = Term::load(&mem, alias.clone(), 1, endian);
            let cs = [
                Constraint::new(Term::binary(BinOp::Eq, alias.clone(), p.clone()), true),
                Constraint::new(Term::binary(BinOp::Eq, read, Term::constant(first, 1)), false),
            ];
            assert!(matches!(decide(&cs, &[], 0), Decision::Unsat), "{:?}", endian);
        }
    }
}
