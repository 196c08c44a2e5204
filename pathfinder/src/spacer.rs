//! External solver backend: z3's `spacer` fixedpoint engine, run as a child process.

use std::io::Write;
use std::path::PathBuf;
use std::process::{Command, Stdio};

use crate::chc::Encoding;
use crate::error::SolverError;
use crate::log::*;
use crate::solver::{Answer, Solver, Verdict, Witness};

pub struct SpacerSolver {
    program: PathBuf,
    args: Vec<String>,
}

impl SpacerSolver {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: vec!["-in".into()],
        }
    }

    /// Replace the arguments the solver is started with. The encoding is always fed on stdin.
    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    /// The binary named by `PATHFINDER_Z3`, or `z3` from `PATH`
    pub fn from_env() -> Self {
        Self::new(
            std::env::var_os("PATHFINDER_Z3")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("z3")),
        )
    }

    fn run(&self, input: &str) -> Result<String, SolverError> {
        let program = self.program.display().to_string();
        let spawn_error = |e: std::io::Error| SolverError::Spawn {
            program: program.clone(),
            message: e.to_string(),
        };
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(spawn_error)?;
        // The child may answer before it has read everything, so stdout is drained while writing
        let writer = child.stdin.take().map(|mut stdin| {
            let input = input.to_owned();
            std::thread::spawn(move || stdin.write_all(input.as_bytes()))
        });
        let output = child.wait_with_output().map_err(spawn_error)?;
        if let Some(writer) = writer {
            match writer.join() {
                Ok(written) => written.map_err(spawn_error)?,
                Err(_) => {
                    return Err(SolverError::Spawn {
                        program,
                        message: "stdin writer panicked".into(),
                    })
                }
            }
        }
        let stdout = String::from_utf8_lossy(&output.stdout).to_string();
        if !output.status.success() && parse_response(&stdout).is_err() {
            return Err(SolverError::Exit(output.status.to_string()));
        }
        Ok(stdout)
    }
}

/// Interpret z3's output for `(query goal)` followed by `(get-answer)`
pub fn parse_response(stdout: &str) -> Result<Answer, SolverError> {
    let mut lines = stdout.lines().map(str::trim).filter(|l| !l.is_empty());
    let first = lines.next();
    // `get-answer` fails after `unknown`; its error is not part of the answer
    let rest: Vec<&str> = lines.filter(|l| !l.starts_with("(error")).collect();
    let text = (!rest.is_empty()).then(|| rest.join("\n"));
    match first {
        Some("sat") => Ok(Answer {
            verdict: Verdict::Sat(Witness {
                constraints: rest.iter().map(|l| l.to_string()).collect(),
                used_abstraction: None,
                ..Witness::default()
            }),
            text,
        }),
        Some("unsat") => Ok(Answer {
            verdict: Verdict::Unsat,
            text,
        }),
        Some("unknown") => Ok(Verdict::Unknown(
            rest.first()
                .map(|l| l.to_string())
                .unwrap_or_else(|| "spacer returned unknown".into()),
        )
        .into()),
        _ => Err(SolverError::MalformedResponse(
            first.unwrap_or_default().to_owned(),
        )),
    }
}

impl Solver for SpacerSolver {
    fn name(&self) -> &'static str {
        "spacer"
    }

    fn answer(&self, encoding: &Encoding) -> Result<Answer, SolverError> {
        let text = format!("{}(get-answer)\n", encoding);
        debug!("Running spacer"; "program" => %self.program.display(), "bytes" => text.len());
        let stdout = self.run(&text)?;
        parse_response(&stdout)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn responses() {
        let sat = parse_response("sat\n(and (query!0 true)\n  (goal))\n").unwrap();
        match &sat.verdict {
            Verdict::Sat(w) => {
                assert_eq!(w.used_abstraction, None);
                assert_eq!(w.constraints, vec!["(and (query!0 true)", "(goal))"]);
            }
            v => panic!("expected sat, got {:?}", v),
        }
        assert!(sat.text.unwrap().contains("(goal))"));

        let unsat = parse_response("\nunsat\n(forall ((A (_ BitVec 32))) true)\n").unwrap();
        assert!(unsat.verdict.is_unsat());
        assert_eq!(
            unsat.text.as_deref(),
            Some("(forall ((A (_ BitVec 32))) true)")
        );
        assert!(matches!(
            parse_response("unknown\n(incomplete quantifiers)\n").map(|a| a.verdict),
            Ok(Verdict::Unknown(r)) if r == "(incomplete quantifiers)"
        ));
        assert!(matches!(
            parse_response("unknown\n(error \"line 9: no answer\")\n").map(|a| a.verdict),
            Ok(Verdict::Unknown(r)) if r == "spacer returned unknown"
        ));
        assert!(matches!(
            parse_response("(error \"line 3: unknown sort\")"),
            Err(SolverError::MalformedResponse(_))
        ));
        assert!(matches!(
            parse_response(""),
            Err(SolverError::MalformedResponse(_))
        ));
    }

    #[cfg(unix)]
    #[test]
    fn large_inputs_do_not_block_on_a_chatty_child() {
        // `cat` echoes everything, filling its stdout pipe long before stdin is exhausted
        let input: String = std::iter::repeat("(rule goal) ; padding\n")
            .take(64 * 1024)
            .collect();
        let s = SpacerSolver::new("cat").with_args(Vec::<String>::new());
        assert_eq!(s.run(&input).unwrap().len(), input.len());
    }

    #[test]
    fn missing_binary_is_a_spawn_error() {
        let s = SpacerSolver::new("/nonexistent/pathfinder-z3");
        assert!(matches!(s.run("(query goal)"), Err(SolverError::Spawn { .. })));
    }
}
