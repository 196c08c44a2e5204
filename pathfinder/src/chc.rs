//! Constrained Horn clause encodings of reachability queries.
//!
//! Every relation ranges over the same machine state: one bit-vector per [`StateSlot`] plus a
//! byte-addressed memory. In a clause, the body relation's state is named by the slot names (and
//! [`MEMORY`]); everything else a clause mentions is one of its `fresh` variables.

use std::collections::{BTreeSet, VecDeque};
use std::rc::Rc;

use crate::calls::CallTarget;
use crate::dataflow::ASLocation;
use crate::term::{smt_symbol, Constraint, EndianTag, Memory, Term};

/// Name of the body relation's memory inside a clause
pub const MEMORY: &str = "mem";

pub type RelationId = usize;

/// One component of the machine state.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StateSlot {
    pub location: ASLocation,
    /// Width in bytes
    pub width: usize,
    pub name: String,
}

/// The program point a relation stands for
#[derive(Clone, Debug)]
pub struct Relation {
    pub id: RelationId,
    pub name: String,
    /// Machine addresses of the inlined call sites leading here, outermost first
    pub context: Vec<u64>,
    /// Call sites the path returned through after leaving the source's function, in order
    pub returned_through: Vec<u64>,
    /// Entry address of the function
    pub function: u64,
    /// IL address of the block leader
    pub il_address: usize,
    /// Machine address of the block leader
    pub address: u64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ClauseKind {
    /// Initial state at the source
    Fact,
    /// Transfer between two blocks of the same call context
    Block,
    /// Entry of an inlined callee
    Call,
    /// Return from an inlined callee to its call site
    Return,
    /// A call replaced by a summary of its effects
    Summary,
    /// The target is reached
    Goal,
    /// The target may be reached inside a summarized callee, or after returning to unknown code
    AbstractGoal,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Head {
    Relation(RelationId),
    Goal,
}

/// Details of a summarized call
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SummarizedCall {
    pub site: u64,
    pub target: CallTarget,
    /// Whether the callee's code is part of the program. Summaries of internal callees are
    /// abstractions that a finer refinement level may remove.
    pub internal: bool,
}

#[derive(Clone, Debug)]
pub struct Clause {
    pub kind: ClauseKind,
    pub body: Option<RelationId>,
    pub head: Head,
    pub guards: Vec<Constraint>,
    /// Head state, one term per slot
    pub registers: Vec<Rc<Term>>,
    pub memory: Rc<Memory>,
    /// Variables local to the clause, with widths
    pub fresh: Vec<(Rc<str>, usize)>,
    pub fresh_memories: Vec<Rc<str>>,
    pub summarized: Option<SummarizedCall>,
}

impl Clause {
    /// Whether taking this clause relies on an abstraction of internal code
    pub fn is_abstraction(&self) -> bool {
        self.kind == ClauseKind::AbstractGoal
            || matches!(self.summarized, Some(s) if s.internal)
    }
}

/// A complete encoding of one query at one refinement level.
#[derive(Clone, Debug)]
pub struct Encoding {
    pub level: usize,
    pub word_size: usize,
    pub endian: EndianTag,
    pub slots: Vec<StateSlot>,
    pub relations: Vec<Relation>,
    pub clauses: Vec<Clause>,
}

impl Encoding {
    /// The variable naming slot `i` of the body state
    pub fn slot_var(&self, i: usize) -> Rc<Term> {
        Term::var(self.slots[i].name.as_str(), self.slots[i].width)
    }

    /// Whether any clause abstracts internal code
    pub fn has_abstractions(&self) -> bool {
        self.clauses.iter().any(Clause::is_abstraction)
    }

    /// Whether the goal is reachable at all in the clause graph, ignoring every guard that is not
    /// trivially false.
    pub fn goal_reachable(&self) -> bool {
        let mut seen: BTreeSet<RelationId> = BTreeSet::new();
        let mut queue: VecDeque<RelationId> = VecDeque::new();
        let viable = |c: &Clause| !c.guards.iter().any(Constraint::is_false);
        for c in self.clauses.iter().filter(|c| c.body.is_none() && viable(c)) {
            match c.head {
                Head::Goal => return true,
                Head::Relation(r) => {
                    if seen.insert(r) {
                        queue.push_back(r);
                    }
                }
            }
        }
        while let Some(r) = queue.pop_front() {
            for c in self
                .clauses
                .iter()
                .filter(|c| c.body == Some(r) && viable(c))
            {
                match c.head {
                    Head::Goal => return true,
                    Head::Relation(h) => {
                        if seen.insert(h) {
                            queue.push_back(h);
                        }
                    }
                }
            }
        }
        false
    }

    fn memory_sort(&self) -> String {
        format!(
            "(Array (_ BitVec {}) (_ BitVec 8))",
            8 * self.word_size
        )
    }
}

/// SMT-LIB fixedpoint rendering, accepted by z3's `spacer` engine
fn hex_list(addresses: &[u64]) -> String {
    addresses
        .iter()
        .map(|a| format!("{:#x}", a))
        .collect::<Vec<_>>()
        .join(" ")
}

impl std::fmt::Display for Encoding {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        writeln!(f, "; refinement level {}", self.level)?;
        writeln!(f, "(set-option :fixedpoint.engine spacer)")?;
        let sorts: Vec<String> = self
            .slots
            .iter()
            .map(|s| format!("(_ BitVec {})", 8 * s.width))
            .chain(std::iter::once(self.memory_sort()))
            .collect();
        for r in &self.relations {
            writeln!(
                f,
                "(declare-rel {} ({})) ; {:#x} context [{}]{}",
                smt_symbol(&r.name),
                sorts.join(" "),
                r.address,
                hex_list(&r.context),
                if r.returned_through.is_empty() {
                    String::new()
                } else {
                    format!(" returned through [{}]", hex_list(&r.returned_through))
                },
            )?;
        }
        writeln!(f, "(declare-rel goal ())")?;

        let mut declarations: Vec<(String, String)> = vec![];
        let mut declared: BTreeSet<String> = BTreeSet::new();
        let mut declare = |name: &str, sort: String| {
            if declared.insert(name.to_owned()) {
                declarations.push((smt_symbol(name), sort));
            }
        };
        for s in &self.slots {
            declare(&s.name, format!("(_ BitVec {})", 8 * s.width));
        }
        declare(MEMORY, self.memory_sort());
        for c in &self.clauses {
            for (n, w) in &c.fresh {
                declare(n, format!("(_ BitVec {})", 8 * w));
            }
            for m in &c.fresh_memories {
                declare(m, self.memory_sort());
            }
        }
        for (name, sort) in &declarations {
            writeln!(f, "(declare-var {} {})", name, sort)?;
        }

        let body_args: String = self
            .slots
            .iter()
            .map(|s| smt_symbol(&s.name))
            .chain(std::iter::once(MEMORY.to_owned()))
            .collect::<Vec<_>>()
            .join(" ");
        for c in &self.clauses {
            let mut premises: Vec<String> = vec![];
            if let Some(b) = c.body {
                premises.push(format!(
                    "({} {})",
                    smt_symbol(&self.relations[b].name),
                    body_args
                ));
            }
            premises.extend(c.guards.iter().map(Constraint::to_smtlib));
            let head = match c.head {
                Head::Goal => "goal".to_owned(),
                Head::Relation(h) => format!(
                    "({} {})",
                    smt_symbol(&self.relations[h].name),
                    c.registers
                        .iter()
                        .map(|t| t.to_smtlib())
                        .chain(std::iter::once(c.memory.to_smtlib_with(self.endian)))
                        .collect::<Vec<_>>()
                        .join(" ")
                ),
            };
            let rule = match premises.len() {
                0 => head,
                1 => format!("(=> {} {})", premises[0], head),
                _ => format!("(=> (and {}) {})", premises.join(" "), head),
            };
            writeln!(f, "(rule {}) ; {:?}", rule, c.kind)?;
        }
        writeln!(f, "(query goal)")
    }
}
