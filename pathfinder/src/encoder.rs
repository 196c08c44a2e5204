//! Encoding of a reachability query as Horn clauses over block-level relations.
//!
//! A relation stands for a block leader inside a call context. The source's function is the root
//! context; at refinement level `k`, calls made from contexts shallower than `k` are inlined as new
//! contexts, and all other calls are replaced by summaries that havoc whatever the callee may
//! change. A return out of the source's function continues in every caller that has a call site
//! for it, each in a context of its own; when callers may be unknown the return is an abstraction.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::rc::Rc;
use std::sync::Arc;

use crate::call_graph::{CallGraph, CallGraphNode};
use crate::calls::CallTarget;
use crate::chc::{
    Clause, ClauseKind, Encoding, Head, Relation, RelationId, StateSlot, SummarizedCall, MEMORY,
};
use crate::dataflow::ASLocation;
use crate::descriptors::DescriptorSet;
use crate::il::{Instruction, Op, Variable, RAM_SPACE, REGISTER_SPACE, UNIQUE_SPACE};
use crate::log::*;
use crate::pdg::FunctionPdg;
use crate::stack_delta::StackDelta;
use crate::term::{mask, BinOp, Constraint, EndianTag, Memory, Term, UnOp};

/// Upper bound on the number of call contexts in one encoding. Calls beyond it are summarized.
const MAX_CONTEXTS: usize = 4096;

/// A validated reachability query.
#[derive(Clone, Debug)]
pub struct Query {
    pub source: u64,
    pub target: u64,
    pub source_il: usize,
    pub target_il: usize,
    /// Entry address of the function containing the source
    pub source_function: u64,
    /// Entry address of the function containing the target
    pub target_function: u64,
}

/// A function inlined at a particular chain of call sites
struct Context {
    call_sites: Vec<u64>,
    /// Call sites returned through to reach this context, in the order the path took them
    returned_through: Vec<u64>,
    /// Functions on the inlined call stack, this one last
    stack: Vec<u64>,
    function: u64,
    engine_index: usize,
    leaders: BTreeSet<usize>,
    /// Caller context and IL address to continue at after a return
    return_to: Option<(usize, usize)>,
    pdg: Option<Arc<FunctionPdg>>,
}

/// Symbolic state while executing one block
#[derive(Clone)]
struct SymState {
    regs: Vec<Rc<Term>>,
    mem: Rc<Memory>,
    guards: Vec<Constraint>,
    fresh: Vec<(Rc<str>, usize)>,
    fresh_memories: Vec<Rc<str>>,
}

pub struct Encoder<'a> {
    descriptors: &'a DescriptorSet,
    query: &'a Query,
    level: usize,
    endian: EndianTag,
    call_graph: Arc<CallGraph>,
    slots: Vec<StateSlot>,
    slot_index: BTreeMap<ASLocation, usize>,
    contexts: Vec<Context>,
    context_index: BTreeMap<(Vec<u64>, Vec<u64>), usize>,
    relations: Vec<Relation>,
    relation_contexts: Vec<usize>,
    relation_index: BTreeMap<(usize, usize), RelationId>,
    clauses: Vec<Clause>,
    worklist: VecDeque<RelationId>,
    fresh_counter: usize,
}

impl<'a> Encoder<'a> {
    pub fn new(descriptors: &'a DescriptorSet, query: &'a Query, level: usize) -> Self {
        let call_graph = descriptors.call_graph();
        let mut r = Self {
            descriptors,
            query,
            level,
            endian: descriptors.engine().endianness().into(),
            call_graph,
            slots: vec![],
            slot_index: BTreeMap::new(),
            contexts: vec![],
            context_index: BTreeMap::new(),
            relations: vec![],
            relation_contexts: vec![],
            relation_index: BTreeMap::new(),
            clauses: vec![],
            worklist: VecDeque::new(),
            fresh_counter: 0,
        };
        r.compute_slots();
        r
    }

    fn word_size(&self) -> usize {
        self.descriptors.architecture().word_size
    }

    /// One slot per register or temporary location that any function a path may execute mentions,
    /// at the widest width it is used with. Paths may return into callers of the source's function.
    fn compute_slots(&mut self) {
        let descriptors = self.descriptors;
        let engine = descriptors.engine();
        let word = self.word_size();
        let mut widths: BTreeMap<ASLocation, usize> = BTreeMap::new();
        let mut note = |loc: ASLocation, size: usize| {
            if loc.address_space_idx == REGISTER_SPACE || loc.address_space_idx == UNIQUE_SPACE {
                let w = widths.entry(loc).or_insert(size);
                *w = (*w).max(size);
            }
        };
        note(descriptors.architecture().stack_pointer, word);
        let functions: BTreeSet<u64> = self
            .call_graph
            .ancestors(self.query.source_function)
            .into_iter()
            .flat_map(|a| self.call_graph.reachable_functions(a))
            .collect();
        for f in functions {
            let idx = match descriptors.get_function(f).and_then(|f| f.engine_index()) {
                Some(i) => i,
                None => continue,
            };
            for &bb in &engine.functions()[idx].basic_blocks {
                for &il in engine.basic_block(bb).unwrap_or(&[]) {
                    let ins = match engine.instruction(il) {
                        Some(i) => i,
                        None => continue,
                    };
                    for v in std::iter::once(&ins.output).chain(ins.inputs.iter()) {
                        match v {
                            Variable::Varnode { size, .. } => {
                                if let Some(l) = v.try_to_aslocation() {
                                    note(l, *size)
                                }
                            }
                            Variable::DerefVarnode { .. } => {
                                if let Some(l) = v.try_to_aslocation() {
                                    note(l, word)
                                }
                            }
                            _ => {}
                        }
                    }
                }
            }
        }
        let rf = engine.register_file();
        for (loc, width) in widths {
            let name = if loc.address_space_idx == REGISTER_SPACE {
                match rf.at_offset(loc.offset) {
                    Some(r) => r.name.clone(),
                    None => format!("reg_{:x}", loc.offset),
                }
            } else {
                format!("tmp_{:x}", loc.offset)
            };
            self.slot_index.insert(loc, self.slots.len());
            self.slots.push(StateSlot {
                location: loc,
                width,
                name,
            });
        }
    }

    fn fresh_name(&mut self, base: &str) -> Rc<str> {
        self.fresh_counter += 1;
        format!("{}!{}", base, self.fresh_counter).into()
    }

    fn fresh_var(&mut self, st: &mut SymState, base: &str, width: usize) -> Rc<Term> {
        let n = self.fresh_name(base);
        st.fresh.push((n.clone(), width));
        Term::var(n, width)
    }

    fn initial_state(&self) -> SymState {
        SymState {
            regs: (0..self.slots.len())
                .map(|i| Term::var(self.slots[i].name.as_str(), self.slots[i].width))
                .collect(),
            mem: Memory::var(MEMORY),
            guards: vec![],
            fresh: vec![],
            fresh_memories: vec![],
        }
    }

    fn get_or_create_context(
        &mut self,
        returned_through: Vec<u64>,
        call_sites: Vec<u64>,
        stack: Vec<u64>,
        function: u64,
        return_to: Option<(usize, usize)>,
    ) -> Option<usize> {
        let key = (returned_through, call_sites);
        if let Some(&c) = self.context_index.get(&key) {
            return Some(c);
        }
        let (returned_through, call_sites) = key;
        let descriptors = self.descriptors;
        let engine = descriptors.engine();
        let engine_index = descriptors.get_function(function)?.engine_index()?;
        let mut leaders: BTreeSet<usize> = engine.functions()[engine_index]
            .basic_blocks
            .iter()
            .filter_map(|&bb| engine.basic_block(bb).and_then(|b| b.first().cloned()))
            .collect();
        for il in [self.query.source_il, self.query.target_il] {
            if engine.function_containing(il) == Some(engine_index) {
                leaders.insert(il);
            }
        }
        let pdg = if descriptors.config().enable_pdg_slicing {
            descriptors.function_pdg(function)
        } else {
            None
        };
        let id = self.contexts.len();
        self.context_index
            .insert((returned_through.clone(), call_sites.clone()), id);
        self.contexts.push(Context {
            call_sites,
            returned_through,
            stack,
            function,
            engine_index,
            leaders,
            return_to,
            pdg,
        });
        Some(id)
    }

    fn get_or_create_relation(&mut self, context: usize, il: usize) -> RelationId {
        if let Some(&r) = self.relation_index.get(&(context, il)) {
            return r;
        }
        let address = self
            .descriptors
            .engine()
            .instruction(il)
            .map(|i| i.address)
            .unwrap_or_default();
        let id = self.relations.len();
        let ctx = &self.contexts[context];
        self.relations.push(Relation {
            id,
            name: format!("r{}_{:x}", id, address),
            context: ctx.call_sites.clone(),
            returned_through: ctx.returned_through.clone(),
            function: ctx.function,
            il_address: il,
            address,
        });
        self.relation_index.insert((context, il), id);
        self.relation_contexts.push(context);
        self.worklist.push_back(id);
        if il == self.query.target_il {
            let st = self.initial_state();
            self.push_clause(ClauseKind::Goal, Some(id), Head::Goal, st, None);
        }
        id
    }

    fn push_clause(
        &mut self,
        kind: ClauseKind,
        body: Option<RelationId>,
        head: Head,
        st: SymState,
        summarized: Option<SummarizedCall>,
    ) {
        let mut guards = vec![];
        for g in st.guards {
            let norm = g.normalize();
            if norm.iter().any(Constraint::is_false) {
                trace!("Dropping infeasible clause"; "kind" => ?kind, "body" => ?body);
                return;
            }
            guards.extend(norm);
        }
        guards.sort();
        guards.dedup();
        self.clauses.push(Clause {
            kind,
            body,
            head,
            guards,
            registers: st.regs,
            memory: st.mem,
            fresh: st.fresh,
            fresh_memories: st.fresh_memories,
            summarized,
        });
    }

    /// Build the encoding
    pub fn encode(mut self) -> Encoding {
        let root = self.get_or_create_context(
            vec![],
            vec![],
            vec![self.query.source_function],
            self.query.source_function,
            None,
        );
        if let Some(root) = root {
            let mut st = self.initial_state();
            for i in 0..self.slots.len() {
                let n: Rc<str> = format!("{}_0", self.slots[i].name).into();
                st.fresh.push((n.clone(), self.slots[i].width));
                st.regs[i] = Term::var(n, self.slots[i].width);
            }
            let m0: Rc<str> = "mem_0".into();
            st.fresh_memories.push(m0.clone());
            st.mem = Memory::var(m0);
            let head = self.get_or_create_relation(root, self.query.source_il);
            self.push_clause(ClauseKind::Fact, None, Head::Relation(head), st, None);
        }
        while let Some(r) = self.worklist.pop_front() {
            self.encode_block(r);
        }
        debug!(
            "Encoded query";
            "level" => self.level,
            "contexts" => self.contexts.len(),
            "relations" => self.relations.len(),
            "clauses" => self.clauses.len(),
            "slots" => self.slots.len(),
        );
        Encoding {
            level: self.level,
            word_size: self.word_size(),
            endian: self.endian,
            slots: self.slots,
            relations: self.relations,
            clauses: self.clauses,
        }
    }

    fn same_function(&self, context: usize, il: usize) -> bool {
        self.descriptors.engine().function_containing(il) == Some(self.contexts[context].engine_index)
    }

    fn emit_block(&mut self, body: RelationId, context: usize, il: usize, st: SymState) {
        if !self.same_function(context, il) {
            debug!("Control leaves the function; path ends"; "il" => il);
            return;
        }
        let head = self.get_or_create_relation(context, il);
        self.push_clause(ClauseKind::Block, Some(body), Head::Relation(head), st, None);
    }

    /// Symbolically execute the block of relation `r` and emit its outgoing clauses
    fn encode_block(&mut self, r: RelationId) {
        let descriptors = self.descriptors;
        let engine = descriptors.engine();
        let leader = self.relations[r].il_address;
        let context = self.relation_contexts[r];
        let mut st = self.initial_state();
        let mut il = leader;
        loop {
            if il != leader && self.contexts[context].leaders.contains(&il) {
                self.emit_block(r, context, il, st);
                return;
            }
            let ins = match engine.instruction(il) {
                Some(i) => i.clone(),
                None => return,
            };
            match ins.op {
                Op::Cbranch => {
                    let cond = self.read(&mut st, &ins.inputs[1]);
                    let taken = engine.resolve_control_target(il, &ins.inputs[0]);
                    let mut t = st.clone();
                    t.guards.push(Constraint::new(cond.clone(), true));
                    match taken {
                        Some(target) => self.emit_block(r, context, target, t),
                        None => debug!("Unresolvable branch target"; "ins" => ?ins),
                    }
                    st.guards.push(Constraint::new(cond, false));
                    self.emit_block(r, context, il + 1, st);
                    return;
                }
                Op::Branch => {
                    match engine.resolve_control_target(il, &ins.inputs[0]) {
                        Some(target) => self.emit_block(r, context, target, st),
                        None => debug!("Unresolvable branch target"; "ins" => ?ins),
                    }
                    return;
                }
                Op::Return => {
                    match self.contexts[context].return_to {
                        Some((caller, cont)) => {
                            let head = self.get_or_create_relation(caller, cont);
                            self.push_clause(
                                ClauseKind::Return,
                                Some(r),
                                Head::Relation(head),
                                st,
                                None,
                            );
                        }
                        None => self.return_to_callers(r, context, &ins, st),
                    }
                    return;
                }
                Op::CallWithFallthrough
                | Op::CallWithFallthroughIndirect
                | Op::CallWithNoFallthrough => {
                    self.encode_call(r, context, il, &ins, st);
                    return;
                }
                Op::ProcessorException => return,
                _ => {
                    let sliced_out = descriptors.config().enable_pdg_slicing
                        && matches!(&self.contexts[context].pdg, Some(p) if !p.in_slice(il));
                    if !sliced_out {
                        self.execute(&mut st, &ins);
                    }
                    il += 1;
                    if !self.same_function(context, il) {
                        return;
                    }
                }
            }
        }
    }

    fn encode_call(
        &mut self,
        r: RelationId,
        context: usize,
        il: usize,
        ins: &Instruction,
        st: SymState,
    ) {
        let site = ins.address;
        let target = self
            .descriptors
            .get_call(site)
            .map(|c| c.target())
            .unwrap_or(CallTarget::Unresolved);
        let fallthrough = ins.op.has_fallthrough() && self.same_function(context, il + 1);
        let continuation = fallthrough.then(|| (context, il + 1));

        let internal_callee = match target {
            CallTarget::Function(a) => self
                .descriptors
                .get_function(a)
                .and_then(|f| f.engine_index())
                .map(|_| a),
            _ => None,
        };

        if let Some(callee) = internal_callee {
            let ctx = &self.contexts[context];
            let recursive = ctx.stack.contains(&callee);
            if ctx.call_sites.len() < self.level && !recursive && self.contexts.len() < MAX_CONTEXTS
            {
                let returned_through = ctx.returned_through.clone();
                let mut call_sites = ctx.call_sites.clone();
                call_sites.push(site);
                let mut stack = ctx.stack.clone();
                stack.push(callee);
                if let Some(c) = self.get_or_create_context(
                    returned_through,
                    call_sites,
                    stack,
                    callee,
                    continuation,
                ) {
                    let entry_il = self.descriptors.engine().functions()
                        [self.contexts[c].engine_index]
                        .entry_il;
                    let head = self.get_or_create_relation(c, entry_il);
                    self.push_clause(ClauseKind::Call, Some(r), Head::Relation(head), st, None);
                    return;
                }
            }
        }

        trace!("Summarizing call";
               "site" => format_args!("{:#x}", site),
               "target" => %target,
               OptionalKV("callee", internal_callee.map(|a| format!("{:#x}", a))),
               "level" => self.level,
        );
        let summary = SummarizedCall {
            site,
            target,
            internal: internal_callee.is_some(),
        };
        if let Some(callee) = internal_callee {
            if self
                .call_graph
                .can_reach(callee, self.query.target_function)
            {
                self.push_clause(
                    ClauseKind::AbstractGoal,
                    Some(r),
                    Head::Goal,
                    st.clone(),
                    Some(summary),
                );
            }
        }
        if let Some((c, cont)) = continuation {
            let after = self.summarize_call(st, target);
            let head = self.get_or_create_relation(c, cont);
            self.push_clause(
                ClauseKind::Summary,
                Some(r),
                Head::Relation(head),
                after,
                Some(summary),
            );
        }
    }

    /// Continue a path that returns out of a context nobody inlined. Each call site of the
    /// function resumes in a context of the caller, guarded on the return address matching the
    /// instruction after that call.
    fn return_to_callers(&mut self, r: RelationId, context: usize, ins: &Instruction, st: SymState) {
        let descriptors = self.descriptors;
        let engine = descriptors.engine();
        let function = self.contexts[context].function;
        let callee = CallGraphNode::Function(function);
        if self.call_graph.contains(CallGraphNode::Unresolved) {
            debug!("Returning to callers that may be unknown";
                   "function" => format_args!("{:#x}", function));
            self.push_clause(ClauseKind::AbstractGoal, Some(r), Head::Goal, st.clone(), None);
        }
        let mut st = st;
        let return_address = self.read(&mut st, &ins.inputs[0]);
        let width = return_address.width();
        for caller in self.call_graph.callers(callee) {
            for site in self
                .call_graph
                .call_sites(CallGraphNode::Function(caller), callee)
            {
                if self.contexts[context].returned_through.contains(&site) {
                    continue;
                }
                let call_il = match descriptors.get_call(site) {
                    Some(c) => c.il_address(),
                    None => continue,
                };
                let resume_il = call_il + 1;
                let resume = match engine.instruction(resume_il) {
                    Some(i) if engine.function_containing(resume_il)
                        == engine.function_containing(call_il) =>
                    {
                        i.address
                    }
                    _ => continue,
                };
                if self.contexts.len() >= MAX_CONTEXTS {
                    debug!("Context limit reached; return not followed";
                           "site" => format_args!("{:#x}", site));
                    return;
                }
                let mut returned_through = self.contexts[context].returned_through.clone();
                returned_through.push(site);
                let c = match self.get_or_create_context(
                    returned_through,
                    vec![],
                    vec![caller],
                    caller,
                    None,
                ) {
                    Some(c) => c,
                    None => continue,
                };
                trace!("Returning into caller";
                       "site" => format_args!("{:#x}", site),
                       "resume" => format_args!("{:#x}", resume));
                let head = self.get_or_create_relation(c, resume_il);
                let mut after = st.clone();
                after.guards.push(Constraint::new(
                    Term::binary(
                        BinOp::Eq,
                        return_address.clone(),
                        Term::constant(resume, width),
                    ),
                    true,
                ));
                self.push_clause(ClauseKind::Return, Some(r), Head::Relation(head), after, None);
            }
        }
    }

    /// State after a call whose callee is not encoded
    fn summarize_call(&mut self, mut st: SymState, target: CallTarget) -> SymState {
        let arch = self.descriptors.architecture().clone();
        let config = self.descriptors.config().clone();
        for i in 0..self.slots.len() {
            let loc = self.slots[i].location;
            let clobbered = loc.address_space_idx == UNIQUE_SPACE
                || (loc != arch.stack_pointer && !arch.is_preserved(&loc));
            if clobbered {
                let name = format!("{}_ret", self.slots[i].name);
                st.regs[i] = self.fresh_var(&mut st, &name, self.slots[i].width);
            }
        }
        if let Some(&sp) = self.slot_index.get(&arch.stack_pointer) {
            let width = self.slots[sp].width;
            let adjust = match self.descriptors.target_stack_delta(target) {
                StackDelta::Known(d) => Some(arch.word_size as i64 + d),
                StackDelta::Unknown if config.assume_cdecl_for_unknown_stack_delta => {
                    Some(arch.word_size as i64)
                }
                StackDelta::Unknown => None,
            };
            st.regs[sp] = match adjust {
                Some(a) => Term::binary(
                    BinOp::Add,
                    st.regs[sp].clone(),
                    Term::constant(a as u64, width),
                ),
                None => self.fresh_var(&mut st, "sp_ret", width),
            };
        }
        if config.havoc_memory_on_summarized_calls {
            let m = self.fresh_name("mem_ret");
            st.fresh_memories.push(m.clone());
            st.mem = Memory::var(m);
        }
        st
    }

    fn address_term(&self, st: &SymState, v: &Variable) -> Option<Rc<Term>> {
        let loc = v.try_to_aslocation()?;
        let word = self.word_size();
        let addr_var = Variable::Varnode {
            address_space_idx: loc.address_space_idx,
            offset: loc.offset,
            size: word,
        };
        self.read_opt(st, &addr_var)
    }

    fn read_opt(&self, st: &SymState, v: &Variable) -> Option<Rc<Term>> {
        match v {
            Variable::Constant { value, size } => Some(Term::constant(*value, *size)),
            Variable::Varnode {
                address_space_idx: RAM_SPACE,
                offset,
                size,
            } => Some(Term::load(
                &st.mem,
                Term::constant(*offset as u64, self.word_size()),
                *size,
                self.endian,
            )),
            Variable::Varnode { size, .. } => {
                let idx = *self.slot_index.get(&v.try_to_aslocation()?)?;
                let t = st.regs[idx].clone();
                Some(if *size < t.width() {
                    Term::unary(UnOp::Extract { offset: 0 }, t, *size)
                } else {
                    t
                })
            }
            _ => None,
        }
    }

    /// Read `v`, or a fresh value if it cannot be modelled
    fn read(&mut self, st: &mut SymState, v: &Variable) -> Rc<Term> {
        match self.read_opt(st, v) {
            Some(t) => t,
            None => {
                debug!("Unmodelled operand; using a fresh value"; "operand" => ?v);
                let w = v.try_size().unwrap_or(1);
                self.fresh_var(st, "unknown", w)
            }
        }
    }

    fn write(&self, st: &mut SymState, v: &Variable, value: Rc<Term>) {
        match v {
            Variable::Varnode {
                address_space_idx: RAM_SPACE,
                offset,
                ..
            } => {
                st.mem = Memory::store(
                    &st.mem,
                    Term::constant(*offset as u64, self.word_size()),
                    value,
                );
            }
            Variable::Varnode { size, .. } => {
                let idx = match v.try_to_aslocation().and_then(|l| self.slot_index.get(&l)) {
                    Some(&i) => i,
                    None => return,
                };
                let width = self.slots[idx].width;
                st.regs[idx] = if *size >= width {
                    value
                } else {
                    let kept = Term::binary(
                        BinOp::And,
                        st.regs[idx].clone(),
                        Term::constant(!mask(*size), width),
                    );
                    Term::binary(BinOp::Or, kept, Term::unary(UnOp::Zext, value, width))
                };
            }
            _ => {}
        }
    }

    /// Bring `b` to the width of `a`
    fn fit(a: &Rc<Term>, b: Rc<Term>) -> Rc<Term> {
        let (wa, wb) = (a.width(), b.width());
        if wa == wb {
            b
        } else if wb < wa {
            Term::unary(UnOp::Zext, b, wa)
        } else {
            Term::unary(UnOp::Extract { offset: 0 }, b, wa)
        }
    }

    /// Symbolically execute a non-control instruction
    fn execute(&mut self, st: &mut SymState, ins: &Instruction) {
        let out_width = ins.output.try_size().unwrap_or(1);
        let bop = match ins.op {
            Op::IntAdd => Some(BinOp::Add),
            Op::IntSub => Some(BinOp::Sub),
            Op::IntMult => Some(BinOp::Mul),
            Op::IntAnd => Some(BinOp::And),
            Op::IntOr => Some(BinOp::Or),
            Op::IntXor => Some(BinOp::Xor),
            Op::IntLeftShift => Some(BinOp::Shl),
            Op::IntURightShift => Some(BinOp::LShr),
            Op::IntSRightShift => Some(BinOp::AShr),
            Op::IntEqual => Some(BinOp::Eq),
            Op::IntNotEqual => Some(BinOp::Ne),
            Op::IntLess => Some(BinOp::Ult),
            Op::IntSLess => Some(BinOp::Slt),
            Op::IntLessEqual => Some(BinOp::Ule),
            Op::IntSLessEqual => Some(BinOp::Sle),
            Op::BoolAnd => Some(BinOp::BoolAnd),
            Op::BoolOr => Some(BinOp::BoolOr),
            Op::BoolXor => Some(BinOp::BoolXor),
            _ => None,
        };
        let value = if let Some(op) = bop {
            let a = self.read(st, &ins.inputs[0]);
            let b = self.read(st, &ins.inputs[1]);
            let b = Self::fit(&a, b);
            Term::binary(op, a, b)
        } else {
            match ins.op {
                Op::Copy => self.read(st, &ins.inputs[0]),
                Op::IntZext => Term::unary(UnOp::Zext, self.read(st, &ins.inputs[0]), out_width),
                Op::IntSext => Term::unary(UnOp::Sext, self.read(st, &ins.inputs[0]), out_width),
                Op::IntTwosComp => {
                    Term::unary(UnOp::Neg, self.read(st, &ins.inputs[0]), out_width)
                }
                Op::IntOnesComp => {
                    Term::unary(UnOp::Not, self.read(st, &ins.inputs[0]), out_width)
                }
                Op::BoolNegate => Term::unary(UnOp::BoolNot, self.read(st, &ins.inputs[0]), 1),
                Op::SubPiece => {
                    let offset = match ins.inputs[1] {
                        Variable::Constant { value, .. } => value as usize,
                        _ => 0,
                    };
                    Term::unary(
                        UnOp::Extract { offset },
                        self.read(st, &ins.inputs[0]),
                        out_width,
                    )
                }
                Op::Load => {
                    let size = match ins.inputs[0] {
                        Variable::DerefVarnode { derefval_size, .. } => derefval_size,
                        _ => out_width,
                    };
                    match self.address_term(st, &ins.inputs[0]) {
                        Some(addr) => Term::load(&st.mem, addr, size, self.endian),
                        None => self.fresh_var(st, "load", size),
                    }
                }
                Op::Store => {
                    let value = self.read(st, &ins.inputs[1]);
                    match self.address_term(st, &ins.inputs[0]) {
                        Some(addr) => st.mem = Memory::store(&st.mem, addr, value),
                        None => {
                            debug!("Store through an unmodelled address; havocking memory"; "ins" => ?ins);
                            let m = self.fresh_name("mem_store");
                            st.fresh_memories.push(m.clone());
                            st.mem = Memory::var(m);
                        }
                    }
                    return;
                }
                Op::UnderspecifiedOutputModification => {
                    self.fresh_var(st, "underspecified", out_width)
                }
                _ => return,
            }
        };
        self.write(st, &ins.output, value);
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn fit_adjusts_widths() {
        let a = Term::var("a", 4);
        let b = Term::var("b", 1);
        assert_eq!(Encoder::fit(&a, b).width(), 4);
        let c = Term::var("c", 8);
        assert_eq!(Encoder::fit(&a, c).width(), 4);
    }

    #[test]
    fn source_returns_resume_after_each_call_site() {
        use crate::config::AnalysisConfig;
        use crate::path_finder::PathFinder;
        use crate::solver::Engine;
        use crate::tests::compound_condition_descriptors;

        let ds = compound_condition_descriptors(AnalysisConfig::default());
        let query = PathFinder::new(&ds, Engine::Bounded)
            .validate(0x1100, 0x1200)
            .unwrap();
        let encoding = Encoder::new(&ds, &query, 0).encode();
        let returns: Vec<&Clause> = encoding
            .clauses
            .iter()
            .filter(|c| c.kind == ClauseKind::Return)
            .collect();
        // `path_start` is only called from `func`; `func` is only called from `main`
        assert_eq!(returns.len(), 2);
        for c in returns {
            assert!(!c.guards.is_empty());
            let head = match c.head {
                Head::Relation(h) => &encoding.relations[h],
                Head::Goal => panic!("return into the goal"),
            };
            assert!(head.context.is_empty());
            match head.function {
                0x1000 => assert_eq!(head.returned_through, vec![0x1003]),
                0x1300 => assert_eq!(head.returned_through, vec![0x1003, 0x1311]),
                f => panic!("unexpected caller {:#x}", f),
            }
        }
        // `main` has no callers, so nothing follows its return
        assert!(!encoding.clauses.iter().any(|c| c.kind == ClauseKind::AbstractGoal
            && c.summarized.is_none()));
    }
}
