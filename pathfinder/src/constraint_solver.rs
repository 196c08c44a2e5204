//! Decision of path conditions.
//!
//! By default the constraints go to z3 in process, with memory as byte arrays. Without z3, or
//! when asked to, memory reads are abstracted into fresh variables and models are searched for
//! by backtracking over candidate values drawn from the boundaries the constraints mention. When
//! every constraint bounds a single variable (optionally offset by a constant) against a
//! constant, the boundary candidates cover every feasible interval, so an exhausted search
//! proves unsatisfiability.

use std::collections::{BTreeMap, BTreeSet};
use std::rc::Rc;

use crate::config::AnalysisConfig;
use crate::log::*;
use crate::term::{mask, BinOp, Constraint, Memory, Term, UnOp};

/// An assignment satisfying a set of constraints
#[derive(Clone, Debug, Default)]
pub struct Model {
    pub values: BTreeMap<Rc<str>, u64>,
    /// Values of the memory reads, keyed by their rendering
    pub loads: Vec<(String, u64)>,
    /// Whether distinct reads might alias each other or read through unresolved stores
    pub imprecise: bool,
}

#[derive(Clone, Debug)]
pub enum Outcome {
    Sat(Model),
    Unsat,
    Unknown(String),
}

/// Upper bound on candidate assignments tried by one search
const MAX_SEARCH_STEPS: usize = 200_000;

/// How abstracted constraints are decided
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Backend {
    /// z3's bit-vector theory. A zero timeout means none.
    #[cfg(feature = "z3")]
    Z3 { timeout_ms: u32 },
    /// Backtracking over boundary values
    CandidateSearch { max_steps: usize },
}

/// Answer of a backend. Models include the values read by loads, under their `load!` names.
pub(crate) enum Decision {
    Sat(BTreeMap<Rc<str>, u64>),
    Unsat,
    Unknown(String),
}

pub struct ConstraintSolver {
    backend: Backend,
}

impl Default for ConstraintSolver {
    fn default() -> Self {
        Self::from_config(&AnalysisConfig::default())
    }
}

/// Whether two reads of the same memory might observe each other's bytes in a way the abstraction
/// does not model
fn loads_imprecise(loads: &[Rc<Term>]) -> bool {
    let parts: Vec<(&Rc<Memory>, &Rc<Term>, usize)> = loads
        .iter()
        .filter_map(|l| match &**l {
            Term::Load {
                memory,
                address,
                size,
                ..
            } => Some((memory, address, *size)),
            _ => None,
        })
        .collect();
    if parts
        .iter()
        .any(|(m, _, _)| matches!(&***m, Memory::Store { .. }))
    {
        return true;
    }
    for (i, (ma, aa, sa)) in parts.iter().enumerate() {
        for (mb, ab, sb) in &parts[i + 1..] {
            if ma.root() != mb.root() {
                continue;
            }
            let (ba, oa) = Term::base_offset(aa);
            let (bb, ob) = Term::base_offset(ab);
            if ba != bb {
                return true;
            }
            let d = crate::term::sign_extend(oa.wrapping_sub(ob) & mask(aa.width()), aa.width());
            let disjoint = d >= *sb as i64 || -d >= *sa as i64;
            if !disjoint {
                return true;
            }
        }
    }
    false
}

/// `x` or `x + k`, possibly truncated
fn is_linear_in_var(t: &Term) -> bool {
    match t {
        Term::Var { .. } => true,
        Term::Binary {
            op: BinOp::Add,
            lhs,
            rhs,
            ..
        } => matches!(&**lhs, Term::Var { .. }) && rhs.as_const().is_some(),
        Term::Unary {
            op: UnOp::Extract { offset: 0 },
            arg,
            ..
        } => is_linear_in_var(arg),
        _ => false,
    }
}

/// Constraints whose feasible set is a union of intervals with boundaries among the candidates
fn is_simple(t: &Term) -> bool {
    match t {
        Term::Var { .. } => true,
        Term::Unary {
            op: UnOp::BoolNot,
            arg,
            ..
        } => is_simple(arg),
        Term::Binary { op, lhs, rhs, .. } if op.is_comparison() => {
            (is_linear_in_var(lhs) && rhs.as_const().is_some())
                || (is_linear_in_var(rhs) && lhs.as_const().is_some())
        }
        _ => false,
    }
}

fn collect_constants(t: &Term, out: &mut BTreeSet<u64>) {
    match t {
        Term::Const { value, .. } => {
            out.insert(*value);
        }
        Term::Var { .. } | Term::Load { .. } => {}
        Term::Unary { arg, .. } => collect_constants(arg, out),
        Term::Binary { lhs, rhs, .. } => {
            collect_constants(lhs, out);
            collect_constants(rhs, out);
        }
    }
}

/// Values worth trying for a variable of `width` bytes mentioned alongside `constants`
fn candidates(width: usize, constants: &BTreeSet<u64>) -> Vec<u64> {
    let m = mask(width);
    let smin = if width >= 8 {
        1u64 << 63
    } else {
        1u64 << (8 * width - 1)
    };
    let smax = smin - 1;
    let mut out: BTreeSet<u64> = [0, 1, m, smin, smax].into_iter().collect();
    for &c in constants {
        for &k in constants {
            let base = c.wrapping_sub(k);
            out.extend([base, base.wrapping_add(1), base.wrapping_sub(1)]);
        }
        out.extend([
            c,
            c.wrapping_add(1),
            c.wrapping_sub(1),
            0u64.wrapping_sub(c),
            0u64.wrapping_sub(c).wrapping_sub(1),
            smin.wrapping_sub(c),
            smax.wrapping_sub(c),
        ]);
    }
    let mut v: Vec<u64> = out.into_iter().map(|x| x & m).collect();
    v.sort_unstable();
    v.dedup();
    // Small magnitudes first so that models read naturally
    v.sort_by_key(|&x| {
        let neg = x & smin != 0;
        (if neg { (m - x).saturating_add(1) } else { x }, neg)
    });
    v
}

struct Search<'c> {
    order: Vec<(Rc<str>, usize)>,
    candidates: Vec<Vec<u64>>,
    /// Constraints to check once the variable at each position is assigned
    checks: Vec<Vec<&'c Constraint>>,
    values: BTreeMap<Rc<str>, u64>,
    steps: usize,
    max_steps: usize,
}

enum Found {
    Yes,
    Exhausted,
    Budget,
}

impl<'c> Search<'c> {
    fn run(&mut self, i: usize) -> Found {
        if i == self.order.len() {
            return Found::Yes;
        }
        let name = self.order[i].0.clone();
        for ci in 0..self.candidates[i].len() {
            self.steps += 1;
            if self.steps > self.max_steps {
                return Found::Budget;
            }
            self.values.insert(name.clone(), self.candidates[i][ci]);
            let values = &self.values;
            let env = |n: &str| values.get(n).cloned();
            let ok = self.checks[i].iter().all(|c| c.eval(&env) == Some(true));
            if ok {
                match self.run(i + 1) {
                    Found::Exhausted => {}
                    other => return other,
                }
            }
        }
        self.values.remove(&name);
        Found::Exhausted
    }
}

impl ConstraintSolver {
    pub fn new(backend: Backend) -> Self {
        Self { backend }
    }

    #[cfg_attr(not(feature = "z3"), allow(unused_variables))]
    pub fn from_config(config: &AnalysisConfig) -> Self {
        let search = Backend::CandidateSearch {
            max_steps: MAX_SEARCH_STEPS,
        };
        #[cfg(feature = "z3")]
        let backend = if config.use_candidate_search {
            search
        } else {
            Backend::Z3 {
                timeout_ms: config.constraint_timeout_ms,
            }
        };
        #[cfg(not(feature = "z3"))]
        let backend = search;
        Self::new(backend)
    }

    pub fn backend(&self) -> Backend {
        self.backend
    }

    /// Decide the conjunction of `constraints`
    pub fn check(&self, constraints: &[Constraint]) -> Outcome {
        let mut loads: Vec<Rc<Term>> = vec![];
        for c in constraints {
            c.term.collect_loads(&mut loads);
        }
        let load_vars: Vec<Rc<str>> = (0..loads.len())
            .map(|i| format!("load!{}", i).into())
            .collect();

        let (decision, imprecise) = match self.backend {
            #[cfg(feature = "z3")]
            Backend::Z3 { timeout_ms } => {
                let named: Vec<(Rc<str>, Rc<Term>)> =
                    load_vars.iter().cloned().zip(loads.iter().cloned()).collect();
                (
                    crate::z3_backend::decide(constraints, &named, timeout_ms),
                    false,
                )
            }
            Backend::CandidateSearch { max_steps } => {
                let abstracted: Vec<Constraint> = constraints
                    .iter()
                    .map(|c| {
                        let term =
                            c.term.map_loads(&mut |l| match loads.iter().position(|x| x == l) {
                                Some(i) => Term::var(load_vars[i].clone(), l.width()),
                                None => l.clone(),
                            });
                        Constraint::new(term, c.holds)
                    })
                    .collect();
                (search(&abstracted, max_steps), loads_imprecise(&loads))
            }
        };
        match decision {
            Decision::Sat(values) => {
                let loads = loads
                    .iter()
                    .zip(&load_vars)
                    .filter_map(|(l, n)| values.get(n).map(|v| (l.to_string(), *v)))
                    .collect();
                trace!("Found model"; "variables" => values.len(), "imprecise" => imprecise);
                Outcome::Sat(Model {
                    values: values
                        .into_iter()
                        .filter(|(n, _)| !n.starts_with("load!"))
                        .collect(),
                    loads,
                    imprecise,
                })
            }
            Decision::Unsat => Outcome::Unsat,
            Decision::Unknown(reason) => Outcome::Unknown(reason),
        }
    }
}

/// Look for a model of load-free constraints among candidate values
fn search(abstracted: &[Constraint], max_steps: usize) -> Decision {
    let mut vars: BTreeMap<Rc<str>, usize> = BTreeMap::new();
    let mut per_constraint: Vec<BTreeMap<Rc<str>, usize>> = vec![];
    for c in abstracted {
        let mut vs = BTreeMap::new();
        c.term.collect_vars(&mut vs);
        if vs.is_empty() && c.eval(&|_| None) == Some(false) {
            return Decision::Unsat;
        }
        vars.extend(vs.iter().map(|(n, w)| (n.clone(), *w)));
        per_constraint.push(vs);
    }

    let complete = abstracted
        .iter()
        .zip(&per_constraint)
        .all(|(c, vs)| vs.len() <= 1 && (vs.is_empty() || is_simple(&c.term)));

    // Most constrained variables first
    let mut order: Vec<(Rc<str>, usize)> = vars.into_iter().collect();
    let mentions = |n: &Rc<str>| per_constraint.iter().filter(|vs| vs.contains_key(n)).count();
    order.sort_by_key(|(n, _)| std::cmp::Reverse(mentions(n)));
    let position: BTreeMap<Rc<str>, usize> = order
        .iter()
        .enumerate()
        .map(|(i, (n, _))| (n.clone(), i))
        .collect();

    let mut checks: Vec<Vec<&Constraint>> = vec![vec![]; order.len()];
    for (c, vs) in abstracted.iter().zip(&per_constraint) {
        if let Some(last) = vs.keys().map(|n| position[n]).max() {
            checks[last].push(c);
        }
    }
    let candidates: Vec<Vec<u64>> = order
        .iter()
        .map(|(n, w)| {
            let mut constants = BTreeSet::new();
            for (c, vs) in abstracted.iter().zip(&per_constraint) {
                if vs.contains_key(n) {
                    collect_constants(&c.term, &mut constants);
                }
            }
            candidates(*w, &constants)
        })
        .collect();

    let mut search = Search {
        order,
        candidates,
        checks,
        values: BTreeMap::new(),
        steps: 0,
        max_steps,
    };
    match search.run(0) {
        Found::Yes => Decision::Sat(search.values),
        Found::Exhausted if complete => Decision::Unsat,
        Found::Exhausted => Decision::Unknown("no model among the candidate values".into()),
        Found::Budget => Decision::Unknown("constraint search budget exhausted".into()),
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::term::EndianTag;

    fn n() -> Rc<Term> {
        Term::var("n", 4)
    }

    #[test]
    fn finds_value_in_signed_range() {
        let cs = vec![
            Constraint::new(Term::binary(BinOp::Slt, Term::constant(2, 4), n()), true),
            Constraint::new(Term::binary(BinOp::Slt, n(), Term::constant(10, 4)), true),
        ];
        match ConstraintSolver::default().check(&cs) {
            Outcome::Sat(m) => {
                let v = m.values[&Rc::from("n")];
                assert!(v > 2 && v < 10);
                assert!(!m.imprecise);
            }
            o => panic!("expected a model, got {:?}", o),
        }
    }

    #[test]
    fn contradictory_bounds_are_unsat() {
        let cs = vec![
            Constraint::new(Term::binary(BinOp::Slt, Term::constant(2, 4), n()), true),
            Constraint::new(Term::binary(BinOp::Sle, n(), Term::constant(2, 4)), true),
        ];
        assert!(matches!(
            ConstraintSolver::default().check(&cs),
            Outcome::Unsat
        ));
    }

    #[test]
    fn offset_variables_respect_wraparound() {
        // n + 5 == 3 (mod 2^32)
        let t = Term::binary(BinOp::Add, n(), Term::constant(5, 4));
        let cs = vec![Constraint::new(
            Term::binary(BinOp::Eq, t, Term::constant(3, 4)),
            true,
        )];
        match ConstraintSolver::default().check(&cs) {
            Outcome::Sat(m) => assert_eq!(m.values[&Rc::from("n")], 0xffff_fffe),
            o => panic!("expected a model, got {:?}", o),
        }
    }

    #[test]
    fn reads_become_inputs() {
        let mem = Memory::var("mem_0");
        let addr = Term::binary(BinOp::Add, Term::var("ESP_0", 4), Term::constant(4, 4));
        let l = Term::load(&mem, addr, 4, EndianTag::Little);
        let cs = vec![Constraint::new(
            Term::binary(BinOp::Eq, l, Term::constant(7, 4)),
            true,
        )];
        match ConstraintSolver::default().check(&cs) {
            Outcome::Sat(m) => {
                assert_eq!(m.loads.len(), 1);
                assert!(m.loads[0].0.starts_with("mem_0["));
                assert_eq!(m.loads[0].1, 7);
                assert!(!m.imprecise);
            }
            o => panic!("expected a model, got {:?}", o),
        }
    }

    #[test]
    fn candidate_search_proves_simple_bounds() {
        let search = ConstraintSolver::new(Backend::CandidateSearch {
            max_steps: MAX_SEARCH_STEPS,
        });
        let cs = vec![
            Constraint::new(Term::binary(BinOp::Slt, Term::constant(2, 4), n()), true),
            Constraint::new(Term::binary(BinOp::Sle, n(), Term::constant(2, 4)), true),
        ];
        assert!(matches!(search.check(&cs), Outcome::Unsat));
        // 3 * n == 21 has a single solution that no boundary value hits
        let product = vec![Constraint::new(
            Term::binary(
                BinOp::Eq,
                Term::binary(BinOp::Mul, n(), Term::constant(3, 4)),
                Term::constant(21, 4),
            ),
            true,
        )];
        assert!(matches!(search.check(&product), Outcome::Unknown(_)));
    }

    #[cfg(feature = "z3")]
    #[test]
    fn z3_decides_nonlinear_constraints() {
        let z3 = ConstraintSolver::new(Backend::Z3 { timeout_ms: 0 });
        let product = vec![Constraint::new(
            Term::binary(
                BinOp::Eq,
                Term::binary(BinOp::Mul, n(), Term::constant(3, 4)),
                Term::constant(21, 4),
            ),
            true,
        )];
        match z3.check(&product) {
            Outcome::Sat(m) => assert_eq!(m.values[&Rc::from("n")], 7),
            o => panic!("expected a model, got {:?}", o),
        }
        // n is odd and even at once
        let odd = Term::binary(BinOp::And, n(), Term::constant(1, 4));
        let even = Term::binary(BinOp::Shl, n(), Term::constant(31, 4));
        let parity = vec![
            Constraint::new(Term::binary(BinOp::Eq, odd, Term::constant(1, 4)), true),
            Constraint::new(Term::binary(BinOp::Eq, even, Term::constant(0, 4)), true),
        ];
        assert!(matches!(z3.check(&parity), Outcome::Unsat));
    }

    #[cfg(feature = "z3")]
    #[test]
    fn default_solver_uses_z3() {
        assert!(matches!(
            ConstraintSolver::default().backend(),
            Backend::Z3 { .. }
        ));
        let config = AnalysisConfig {
            use_candidate_search: true,
            ..AnalysisConfig::default()
        };
        assert!(matches!(
            ConstraintSolver::from_config(&config).backend(),
            Backend::CandidateSearch { .. }
        ));
    }

    #[test]
    fn overlapping_reads_are_imprecise() {
        let mem = Memory::var("mem_0");
        let a = Term::var("p", 4);
        let b = Term::binary(BinOp::Add, Term::var("p", 4), Term::constant(2, 4));
        let l1 = Term::load(&mem, a, 4, EndianTag::Little);
        let l2 = Term::load(&mem, b, 4, EndianTag::Little);
        assert!(loads_imprecise(&[l1, l2]));
    }
}
