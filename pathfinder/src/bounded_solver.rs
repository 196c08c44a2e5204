//! Built-in solver: bounded forward exploration of an encoding.
//!
//! Starting from the fact, clauses are applied depth-first to a symbolic state. Guards accumulate
//! as path constraints and infeasible prefixes are pruned. Reaching a goal clause with satisfiable
//! constraints yields a witness. Exhausting the clause graph without hitting a bound proves the
//! goal unreachable.

use std::collections::BTreeMap;
use std::rc::Rc;

use crate::chc::{Clause, Encoding, Head, RelationId, MEMORY};
use crate::config::AnalysisConfig;
use crate::constraint_solver::{ConstraintSolver, Outcome};
use crate::containers::unordered::UnorderedMap;
use crate::error::SolverError;
use crate::log::*;
use crate::solver::{Answer, Solver, Verdict, Witness};
use crate::term::{Constraint, Memory, Term};

pub struct BoundedSolver {
    max_path_length: usize,
    max_explored_states: usize,
    constraints: ConstraintSolver,
}

impl BoundedSolver {
    pub fn new(config: &AnalysisConfig) -> Self {
        Self {
            max_path_length: config.max_path_length,
            max_explored_states: config.max_explored_states,
            constraints: ConstraintSolver::from_config(config),
        }
    }
}

#[derive(Clone)]
struct PathState {
    relation: RelationId,
    regs: Vec<Rc<Term>>,
    mem: Rc<Memory>,
    constraints: Vec<Constraint>,
    steps: Vec<u64>,
    used_abstraction: bool,
    length: usize,
}

/// Rewrites a clause's terms in terms of the current path state
struct Substitution<'a> {
    slots: &'a BTreeMap<&'a str, usize>,
    regs: &'a [Rc<Term>],
    mem: &'a Rc<Memory>,
    renamed: BTreeMap<Rc<str>, Rc<str>>,
    memo: UnorderedMap<usize, Rc<Term>>,
}

impl<'a> Substitution<'a> {
    fn term(&mut self, t: &Rc<Term>) -> Rc<Term> {
        let key = Rc::as_ptr(t) as usize;
        if let Some(r) = self.memo.get(&key) {
            return r.clone();
        }
        let r = match &**t {
            Term::Const { .. } => t.clone(),
            Term::Var { name, width } => {
                if let Some(&i) = self.slots.get(&**name) {
                    self.regs[i].clone()
                } else if let Some(n) = self.renamed.get(name) {
                    Term::var(n.clone(), *width)
                } else {
                    t.clone()
                }
            }
            Term::Unary { op, arg, width } => Term::unary(*op, self.term(arg), *width),
            Term::Binary { op, lhs, rhs, .. } => {
                let (l, r) = (self.term(lhs), self.term(rhs));
                Term::binary(*op, l, r)
            }
            Term::Load {
                memory,
                address,
                size,
                endian,
            } => {
                let m = self.memory(memory);
                let a = self.term(address);
                Term::load(&m, a, *size, *endian)
            }
        };
        self.memo.insert(key, r.clone());
        r
    }

    fn memory(&mut self, m: &Rc<Memory>) -> Rc<Memory> {
        match &**m {
            Memory::Var(name) if &**name == MEMORY => self.mem.clone(),
            Memory::Var(name) => match self.renamed.get(name) {
                Some(n) => Memory::var(n.clone()),
                None => m.clone(),
            },
            Memory::Store {
                base,
                address,
                value,
                ..
            } => {
                let b = self.memory(base);
                let a = self.term(address);
                let v = self.term(value);
                Memory::store(&b, a, v)
            }
        }
    }
}

struct Exploration<'e> {
    encoding: &'e Encoding,
    slots: BTreeMap<&'e str, usize>,
    outgoing: Vec<Vec<&'e Clause>>,
    explored: usize,
    applications: usize,
    truncated: Option<String>,
    inconclusive: Option<String>,
    abstract_sat: Option<Witness>,
}

impl<'e> Exploration<'e> {
    /// Apply `clause` to `state`. `None` if the result is infeasible.
    fn apply(
        &mut self,
        solver: &BoundedSolver,
        clause: &Clause,
        state: &PathState,
    ) -> Option<PathState> {
        self.applications += 1;
        let mut renamed = BTreeMap::new();
        if clause.body.is_some() {
            for (n, _) in &clause.fresh {
                renamed.insert(n.clone(), format!("{}#{}", n, self.applications).into());
            }
            for n in &clause.fresh_memories {
                renamed.insert(n.clone(), format!("{}#{}", n, self.applications).into());
            }
        }
        let mut sub = Substitution {
            slots: &self.slots,
            regs: &state.regs,
            mem: &state.mem,
            renamed,
            memo: UnorderedMap::new(),
        };
        let mut constraints = state.constraints.clone();
        let mut added = false;
        for g in &clause.guards {
            let t = sub.term(&g.term);
            for c in Constraint::new(t, g.holds).normalize() {
                if c.is_false() {
                    return None;
                }
                if !constraints.contains(&c) {
                    constraints.push(c);
                    added = true;
                }
            }
        }
        let regs = clause.registers.iter().map(|t| sub.term(t)).collect();
        let mem = sub.memory(&clause.memory);
        drop(sub);

        if added {
            if let Outcome::Unsat = solver.constraints.check(&constraints) {
                trace!("Pruned infeasible path"; "length" => state.length);
                return None;
            }
        }
        let mut steps = state.steps.clone();
        let relation = match clause.head {
            Head::Relation(r) => {
                if clause.body.is_some() {
                    steps.push(self.encoding.relations[r].address);
                }
                r
            }
            Head::Goal => state.relation,
        };
        Some(PathState {
            relation,
            regs,
            mem,
            constraints,
            steps,
            used_abstraction: state.used_abstraction || clause.is_abstraction(),
            length: state.length + 1,
        })
    }

    /// Try to complete a path that reached the goal. Returns only definitive witnesses.
    fn reach_goal(&mut self, solver: &BoundedSolver, state: PathState) -> Option<Witness> {
        match solver.constraints.check(&state.constraints) {
            Outcome::Sat(model) => {
                let PathState {
                    steps,
                    constraints,
                    used_abstraction,
                    ..
                } = state;
                let mut inputs: Vec<(String, u64)> = model
                    .values
                    .iter()
                    .map(|(n, v)| (n.to_string(), *v))
                    .collect();
                inputs.extend(model.loads.iter().cloned());
                if !used_abstraction && !model.imprecise {
                    return Some(Witness {
                        steps,
                        inputs,
                        constraints: constraints.iter().map(|c| c.to_string()).collect(),
                        used_abstraction: Some(false),
                        imprecise: false,
                    });
                }
                debug!(
                    "Goal reached through an approximation";
                    "abstraction" => used_abstraction,
                    "imprecise" => model.imprecise,
                );
                let w = Witness {
                    steps,
                    inputs,
                    constraints: constraints.iter().map(|c| c.to_string()).collect(),
                    used_abstraction: Some(used_abstraction),
                    imprecise: model.imprecise,
                };
                if self.abstract_sat.is_none() {
                    self.abstract_sat = Some(w);
                }
                None
            }
            Outcome::Unsat => None,
            Outcome::Unknown(reason) => {
                self.inconclusive = Some(reason);
                None
            }
        }
    }
}

impl Solver for BoundedSolver {
    fn name(&self) -> &'static str {
        "bounded"
    }

    fn answer(&self, encoding: &Encoding) -> Result<Answer, SolverError> {
        if !encoding.goal_reachable() {
            debug!("Goal is not reachable in the clause graph");
            return Ok(Answer {
                verdict: Verdict::Unsat,
                text: Some("no chain of clauses leads from the source to the goal".into()),
            });
        }
        let mut outgoing: Vec<Vec<&Clause>> = vec![vec![]; encoding.relations.len()];
        for c in &encoding.clauses {
            if let Some(b) = c.body {
                outgoing[b].push(c);
            }
        }
        let mut ex = Exploration {
            encoding,
            slots: encoding
                .slots
                .iter()
                .enumerate()
                .map(|(i, s)| (s.name.as_str(), i))
                .collect(),
            outgoing,
            explored: 0,
            applications: 0,
            truncated: None,
            inconclusive: None,
            abstract_sat: None,
        };
        let identity = PathState {
            relation: 0,
            regs: (0..encoding.slots.len()).map(|i| encoding.slot_var(i)).collect(),
            mem: Memory::var(MEMORY),
            constraints: vec![],
            steps: vec![],
            used_abstraction: false,
            length: 0,
        };

        let mut stack: Vec<PathState> = encoding
            .clauses
            .iter()
            .filter(|c| c.body.is_none())
            .filter_map(|c| ex.apply(self, c, &identity))
            .collect();
        stack.reverse();

        'explore: while let Some(state) = stack.pop() {
            ex.explored += 1;
            if ex.explored > self.max_explored_states {
                ex.truncated = Some("explored-state bound reached".into());
                break 'explore;
            }
            let mut successors = vec![];
            for clause in ex.outgoing[state.relation].clone() {
                let next = match ex.apply(self, clause, &state) {
                    Some(n) => n,
                    None => continue,
                };
                if clause.head == Head::Goal {
                    if let Some(w) = ex.reach_goal(self, next) {
                        info!(
                            "Found a path";
                            "steps" => w.steps.len(),
                            "explored" => ex.explored,
                        );
                        return Ok(Verdict::Sat(w).into());
                    }
                } else if next.length >= self.max_path_length {
                    ex.truncated = Some("path-length bound reached".into());
                } else {
                    successors.push(next);
                }
            }
            stack.extend(successors.into_iter().rev());
        }

        debug!(
            "Exploration finished";
            "explored" => ex.explored,
            "applications" => ex.applications,
            "truncated" => ?ex.truncated,
            "inconclusive" => ?ex.inconclusive,
        );
        Ok(if let Some(w) = ex.abstract_sat {
            Verdict::Sat(w).into()
        } else if let Some(reason) = ex.truncated.or(ex.inconclusive) {
            Verdict::Unknown(reason).into()
        } else {
            Answer {
                verdict: Verdict::Unsat,
                text: Some(format!(
                    "every path to the goal is infeasible ({} states explored)",
                    ex.explored
                )),
            }
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::encoder::Encoder;
    use crate::path_finder::PathFinder;
    use crate::solver::Engine;
    use crate::tests::compound_condition_descriptors;

    fn solve_at(config: AnalysisConfig, source: u64, target: u64, level: usize) -> Verdict {
        let ds = compound_condition_descriptors(config.clone());
        let query = PathFinder::new(&ds, Engine::Bounded)
            .validate(source, target)
            .unwrap();
        let encoding = Encoder::new(&ds, &query, level).encode();
        BoundedSolver::new(&config).solve(&encoding).unwrap()
    }

    #[test]
    fn path_bound_makes_the_answer_unknown() {
        let config = AnalysisConfig {
            max_path_length: 1,
            ..AnalysisConfig::default()
        };
        assert_eq!(
            solve_at(config, 0x1000, 0x1030, 1),
            Verdict::Unknown("path-length bound reached".into())
        );
    }

    #[test]
    fn summarized_callee_reaching_the_target_is_an_abstraction() {
        // `func` is summarized at level 0 but calls `bad`
        match solve_at(AnalysisConfig::default(), 0x1300, 0x1210, 0) {
            Verdict::Sat(w) => assert_eq!(w.used_abstraction, Some(true)),
            v => panic!("expected an abstract sat, got {:?}", v),
        }
    }

    #[test]
    fn unsat_answers_explain_themselves() {
        let config = AnalysisConfig::default();
        let ds = compound_condition_descriptors(config.clone());
        let query = PathFinder::new(&ds, Engine::Bounded)
            .validate(0x1040, 0x1030)
            .unwrap();
        let encoding = Encoder::new(&ds, &query, 0).encode();
        let a = BoundedSolver::new(&config).answer(&encoding).unwrap();
        assert_eq!(a.verdict, Verdict::Unsat);
        assert!(a.text.is_some());
    }

    #[test]
    fn precise_goal_keeps_the_path_and_inputs() {
        match solve_at(AnalysisConfig::default(), 0x1000, 0x1030, 1) {
            Verdict::Sat(w) => {
                assert_eq!(w.used_abstraction, Some(false));
                assert!(!w.imprecise);
                assert_eq!(w.steps.last(), Some(&0x1030));
                assert!(!w.constraints.is_empty());
            }
            v => panic!("expected a precise sat, got {:?}", v),
        }
    }
}
