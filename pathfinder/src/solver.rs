//! Solver backends for Horn-clause encodings.

use crate::chc::Encoding;
use crate::config::AnalysisConfig;
use crate::error::{ConfigError, SolverError};

/// A satisfying execution, as far as the solver reports one.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Witness {
    /// Machine addresses of the blocks visited after the source, in order
    pub steps: Vec<u64>,
    /// Values for the free inputs of the path (initial state and outputs of external calls)
    pub inputs: Vec<(String, u64)>,
    /// The path constraints, rendered
    pub constraints: Vec<String>,
    /// Whether the path went through an abstraction of internal code. `None` if the solver
    /// cannot tell.
    pub used_abstraction: Option<bool>,
    /// Whether the model relied on memory reads that were not resolved exactly
    pub imprecise: bool,
}

impl std::fmt::Display for Witness {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        if self.steps.is_empty() && self.used_abstraction.is_none() {
            writeln!(f, "Path: no path information")?;
        } else if self.steps.is_empty() {
            writeln!(f, "Path: <source is the target>")?;
        } else {
            writeln!(
                f,
                "Path: {}",
                itertools::join(self.steps.iter().map(|a| format!("{:#x}", a)), " -> ")
            )?;
        }
        if !self.inputs.is_empty() {
            writeln!(f, "Inputs:")?;
            for (n, v) in &self.inputs {
                writeln!(f, "  {} = {:#x}", n, v)?;
            }
        }
        if !self.constraints.is_empty() {
            writeln!(f, "Constraints:")?;
            for c in &self.constraints {
                writeln!(f, "  {}", c)?;
            }
        }
        Ok(())
    }
}

/// Outcome of solving one encoding
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Verdict {
    Sat(Witness),
    Unsat,
    /// The solver gave up, with the reason
    Unknown(String),
}

impl Verdict {
    pub fn is_sat(&self) -> bool {
        matches!(self, Verdict::Sat(_))
    }

    pub fn is_unsat(&self) -> bool {
        matches!(self, Verdict::Unsat)
    }

    pub fn is_unknown(&self) -> bool {
        matches!(self, Verdict::Unknown(_))
    }

    pub fn witness(&self) -> Option<&Witness> {
        match self {
            Verdict::Sat(w) => Some(w),
            _ => None,
        }
    }
}

impl std::fmt::Display for Verdict {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Verdict::Sat(_) => write!(f, "sat"),
            Verdict::Unsat => write!(f, "unsat"),
            Verdict::Unknown(_) => write!(f, "unknown"),
        }
    }
}

/// A verdict with the solver's own account of it
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Answer {
    pub verdict: Verdict,
    /// The derivation behind `Sat` or the proof behind `Unsat`, as the solver renders it
    pub text: Option<String>,
}

impl From<Verdict> for Answer {
    fn from(verdict: Verdict) -> Self {
        Self {
            verdict,
            text: None,
        }
    }
}

/// Anything that can decide an [`Encoding`]
pub trait Solver {
    fn name(&self) -> &'static str;
    fn answer(&self, encoding: &Encoding) -> Result<Answer, SolverError>;

    fn solve(&self, encoding: &Encoding) -> Result<Verdict, SolverError> {
        self.answer(encoding).map(|a| a.verdict)
    }
}

/// Available solver backends
#[derive(clap::ArgEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum Engine {
    /// Built-in bounded symbolic exploration
    Bounded,
    /// z3's fixedpoint engine, run as an external process
    Spacer,
}

impl Default for Engine {
    fn default() -> Self {
        Engine::Bounded
    }
}

impl std::str::FromStr for Engine {
    type Err = ConfigError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "bounded" => Ok(Engine::Bounded),
            "spacer" | "z3" => Ok(Engine::Spacer),
            _ => Err(ConfigError::UnknownEngine(s.to_owned())),
        }
    }
}

impl Engine {
    pub fn solver(&self, config: &AnalysisConfig) -> Box<dyn Solver> {
        match self {
            Engine::Bounded => Box::new(crate::bounded_solver::BoundedSolver::new(config)),
            Engine::Spacer => Box::new(crate::spacer::SpacerSolver::from_env()),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn engine_names() {
        assert_eq!("bounded".parse::<Engine>().unwrap(), Engine::Bounded);
        assert_eq!("Spacer".parse::<Engine>().unwrap(), Engine::Spacer);
        assert!(matches!(
            "cvc".parse::<Engine>(),
            Err(ConfigError::UnknownEngine(e)) if e == "cvc"
        ));
    }

    #[test]
    fn verdicts_render_lowercase() {
        assert_eq!(Verdict::Unsat.to_string(), "unsat");
        assert_eq!(Verdict::Unknown("bound".into()).to_string(), "unknown");
        assert_eq!(Verdict::Sat(Witness::default()).to_string(), "sat");
    }

    #[test]
    fn witness_without_path_information_says_so() {
        let w = Witness {
            constraints: vec!["(goal)".into()],
            ..Witness::default()
        };
        let text = w.to_string();
        assert!(text.starts_with("Path: no path information"), "{}", text);
        assert!(!text.contains("source is the target"));
        assert!(text.contains("  (goal)"));

        let trivial = Witness {
            used_abstraction: Some(false),
            ..Witness::default()
        };
        assert!(trivial.to_string().contains("<source is the target>"));
    }
}
