//! Hierarchical reachability queries.
//!
//! A query starts with only the source's function encoded. Each solver answer that is not
//! definitive, while abstractions of internal code remain, triggers one more layer of inlining, up
//! to the configured number of encode/solve cycles.

use crate::descriptors::DescriptorSet;
use crate::encoder::{Encoder, Query};
use crate::error::{ConfigError, PathFinderError};
use crate::log::*;
use crate::solver::{Answer, Engine, Solver, Verdict};

/// Where a query is in its lifecycle
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FinderState {
    Unstarted,
    Encoding { level: usize },
    Solving { level: usize },
    Finished(Verdict),
}

/// What to do after a solver answer
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Step {
    Finish(Verdict),
    Refine { level: usize },
}

/// Decide the next step from the answer at `level`, after `cycles` cycles out of `budget`.
/// `has_abstractions` tells whether the encoding summarized any internal code.
pub fn next_step(
    level: usize,
    cycles: usize,
    budget: usize,
    has_abstractions: bool,
    verdict: Verdict,
) -> Step {
    let inconclusive = match verdict {
        Verdict::Unsat => return Step::Finish(Verdict::Unsat),
        Verdict::Sat(w) => {
            let used_abstraction = w.used_abstraction.unwrap_or(has_abstractions);
            if !used_abstraction && !w.imprecise {
                return Step::Finish(Verdict::Sat(w));
            }
            if used_abstraction {
                "the path goes through a summarized function".to_owned()
            } else {
                "the path depends on possibly-aliasing memory reads".to_owned()
            }
        }
        Verdict::Unknown(reason) => reason,
    };
    if has_abstractions && cycles < budget {
        Step::Refine { level: level + 1 }
    } else {
        Step::Finish(Verdict::Unknown(inconclusive))
    }
}

/// The outcome of a query
#[derive(Clone, Debug)]
pub struct PathResult {
    pub verdict: Verdict,
    /// SMT-LIB rendering of the last encoding solved
    pub encoding_text: String,
    /// The solver's derivation or proof for a final `Sat` or `Unsat`, when it gives one
    pub answer: Option<String>,
    pub cycles: usize,
    pub level: usize,
}

pub struct PathFinder<'d> {
    descriptors: &'d DescriptorSet,
    solver: Box<dyn Solver>,
    budget: usize,
    state: FinderState,
}

impl<'d> PathFinder<'d> {
    pub fn new(descriptors: &'d DescriptorSet, engine: Engine) -> Self {
        Self::with_solver(descriptors, engine.solver(descriptors.config()))
    }

    pub fn with_solver(descriptors: &'d DescriptorSet, solver: Box<dyn Solver>) -> Self {
        Self {
            descriptors,
            solver,
            budget: descriptors.config().refinement_budget.max(1),
            state: FinderState::Unstarted,
        }
    }

    pub fn state(&self) -> &FinderState {
        &self.state
    }

    fn locate(&self, which: &'static str, address: u64) -> Result<(usize, u64), ConfigError> {
        let not_found = || ConfigError::AddressNotInFunction { which, address };
        let f = self
            .descriptors
            .function_containing_address(address)
            .ok_or_else(not_found)?;
        let engine = self.descriptors.engine();
        let (il, _) = engine
            .il_range_for_machine_address(address)
            .ok_or_else(not_found)?;
        match f.engine_index() {
            Some(idx) if engine.function_containing(il) == Some(idx) => Ok((il, f.address())),
            _ => Err(not_found()),
        }
    }

    /// Check that both addresses are instructions of known functions
    pub fn validate(&self, source: u64, target: u64) -> Result<Query, ConfigError> {
        let (source_il, source_function) = self.locate("source", source)?;
        let (target_il, target_function) = self.locate("target", target)?;
        Ok(Query {
            source,
            target,
            source_il,
            target_il,
            source_function,
            target_function,
        })
    }

    /// Decide whether `target` is reachable from `source`, refining the encoding as needed
    pub fn find_path_hierarchical(
        &mut self,
        source: u64,
        target: u64,
    ) -> Result<PathResult, PathFinderError> {
        let query = self.validate(source, target)?;
        info!(
            "Starting query";
            "source" => format!("{:#x}", source),
            "target" => format!("{:#x}", target),
            "solver" => self.solver.name(),
            "budget" => self.budget,
        );
        let mut level = 0;
        let mut cycles = 0;
        loop {
            self.state = FinderState::Encoding { level };
            let encoding = Encoder::new(self.descriptors, &query, level).encode();
            let encoding_text = encoding.to_string();

            self.state = FinderState::Solving { level };
            let Answer { verdict, text } = self.solver.answer(&encoding)?;
            cycles += 1;
            info!(
                "Solved";
                "level" => level,
                "cycle" => cycles,
                "verdict" => %verdict,
                "clauses" => encoding.clauses.len(),
            );

            match next_step(
                level,
                cycles,
                self.budget,
                encoding.has_abstractions(),
                verdict,
            ) {
                Step::Finish(verdict) => {
                    self.state = FinderState::Finished(verdict.clone());
                    let answer = text.filter(|_| !verdict.is_unknown());
                    return Ok(PathResult {
                        verdict,
                        encoding_text,
                        answer,
                        cycles,
                        level,
                    });
                }
                Step::Refine { level: next } => {
                    debug!("Refining"; "level" => next);
                    level = next;
                }
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::solver::Witness;

    fn sat(used_abstraction: Option<bool>) -> Verdict {
        Verdict::Sat(Witness {
            used_abstraction,
            ..Witness::default()
        })
    }

    #[test]
    fn unsat_is_final() {
        assert_eq!(next_step(0, 1, 4, true, Verdict::Unsat), Step::Finish(Verdict::Unsat));
    }

    #[test]
    fn abstract_sat_refines() {
        assert_eq!(
            next_step(0, 1, 4, true, sat(Some(true))),
            Step::Refine { level: 1 }
        );
        assert_eq!(next_step(0, 1, 4, true, sat(Some(false))), Step::Finish(sat(Some(false))));
        // Without path information, any abstraction in the encoding is suspect
        assert_eq!(next_step(2, 3, 4, true, sat(None)), Step::Refine { level: 3 });
        assert_eq!(next_step(2, 3, 4, false, sat(None)), Step::Finish(sat(None)));
    }

    #[test]
    fn budget_ends_refinement() {
        assert!(matches!(
            next_step(3, 4, 4, true, Verdict::Unknown("bound".into())),
            Step::Finish(Verdict::Unknown(r)) if r == "bound"
        ));
        assert!(matches!(
            next_step(0, 1, 4, false, Verdict::Unknown("bound".into())),
            Step::Finish(Verdict::Unknown(_))
        ));
    }

    /// Answers every encoding the same way
    struct Fixed(Answer);

    impl Solver for Fixed {
        fn name(&self) -> &'static str {
            "fixed"
        }

        fn answer(&self, _: &crate::chc::Encoding) -> Result<Answer, crate::error::SolverError> {
            Ok(self.0.clone())
        }
    }

    #[test]
    fn final_answers_keep_the_solver_explanation() {
        let ds = crate::tests::compound_condition_descriptors(Default::default());
        let proof = Answer {
            verdict: Verdict::Unsat,
            text: Some("(forall ((A (_ BitVec 32))) true)".into()),
        };
        let r = PathFinder::with_solver(&ds, Box::new(Fixed(proof)))
            .find_path_hierarchical(0x1300, 0x1210)
            .unwrap();
        assert!(r.verdict.is_unsat());
        assert_eq!(
            r.answer.as_deref(),
            Some("(forall ((A (_ BitVec 32))) true)")
        );

        // A derivation through summaries is not an answer once the budget runs out
        let abstract_sat = Answer {
            verdict: sat(Some(true)),
            text: Some("(goal)".into()),
        };
        let r = PathFinder::with_solver(&ds, Box::new(Fixed(abstract_sat)))
            .find_path_hierarchical(0x1300, 0x1210)
            .unwrap();
        assert!(r.verdict.is_unknown());
        assert_eq!(r.answer, None);
    }
}
