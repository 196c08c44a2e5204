//! The descriptor set: canonical, address-keyed records of the functions, call sites, imports, and
//! global memory locations of a recovered program.
//!
//! Every record kind lives in its own [`AddressArena`]; cross references (call to target, import
//! variable to import) are addresses looked up in those arenas. Discovery is get-or-create, so any
//! pass may ask for a descriptor without caring whether someone else created it first.

use std::collections::BTreeMap;
use std::sync::Arc;

use itertools::Itertools;
use parking_lot::RwLock;
use rayon::prelude::*;

use crate::apidb::ApiDictionary;
use crate::call_graph::{CallEdge, CallGraph, CallGraphNode};
use crate::calls::{CallDescriptor, CallTarget};
use crate::config::{AnalysisConfig, Architecture};
use crate::containers::unordered::UnorderedMap;
use crate::containers::AddressArena;
use crate::convention::{entry_register_reads, match_convention, CallingConvention};
use crate::dataflow::{ASLocation, DataFlow, FunctionSummary, ProgPoint};
use crate::engine::{DefUseLocation, RecoveryEngine};
use crate::error::RecoveryError;
use crate::functions::FunctionDescriptor;
use crate::globals::GlobalDescriptor;
use crate::il::{Instruction, Op, Variable, REGISTER_SPACE};
use crate::imports::{ImportDescriptor, ImportVariableMap};
use crate::log::*;
use crate::pdg::{FunctionPdg, ProgramDependencyGraph};
use crate::reaching_definitions::{CallEffects, ReachingDefinitionsElement};
use crate::stack_delta::{self, StackContext, StackDelta};

/// The central index of program entities.
pub struct DescriptorSet {
    engine: Arc<dyn RecoveryEngine>,
    config: AnalysisConfig,
    arch: Architecture,
    api: Option<Arc<dyn ApiDictionary>>,
    /// Entry address to index into the engine's functions
    engine_functions: BTreeMap<u64, usize>,
    functions: AddressArena<FunctionDescriptor>,
    calls: AddressArena<CallDescriptor>,
    imports: AddressArena<ImportDescriptor>,
    globals: AddressArena<GlobalDescriptor>,
    import_variables: ImportVariableMap,
    call_graph: RwLock<Arc<CallGraph>>,
}

impl DescriptorSet {
    /// Build the descriptor set for everything the recovery engine reports. Fails only if the
    /// engine has nothing to offer at all.
    pub fn new(
        engine: Arc<dyn RecoveryEngine>,
        config: AnalysisConfig,
    ) -> Result<Self, RecoveryError> {
        if engine.instruction_count() == 0 {
            return Err(RecoveryError::EmptyProgram);
        }
        let rf = engine.register_file();
        let arch = Architecture::from_register_file(rf)
            .ok_or_else(|| RecoveryError::NoStackPointer(rf.arch_name.clone()))?;
        let engine_functions = engine
            .functions()
            .iter()
            .enumerate()
            .map(|(i, f)| (f.entry, i))
            .collect();

        let r = Self {
            engine,
            config,
            arch,
            api: None,
            engine_functions,
            functions: AddressArena::new(),
            calls: AddressArena::new(),
            imports: AddressArena::new(),
            globals: AddressArena::new(),
            import_variables: ImportVariableMap::default(),
            call_graph: RwLock::new(Arc::new(CallGraph::default())),
        };

        for f in r.engine.functions() {
            r.get_or_create_function(f.entry);
        }
        for fact in r.engine.imports() {
            r.add_import(fact.address, &fact.library, &fact.symbol, fact.ordinal);
            if let Some(v) = fact.variable_id {
                r.bind_import_variable(v, fact.address);
            }
        }
        r.update_connections();
        info!(
            "Built descriptor set";
            "arch" => &r.arch.name,
            "functions" => r.functions.len(),
            "calls" => r.calls.len(),
            "imports" => r.imports.len(),
            "globals" => r.globals.len(),
        );
        Ok(r)
    }

    /// Use `api` to resolve import signatures
    pub fn with_api_dictionary(mut self, api: Arc<dyn ApiDictionary>) -> Self {
        self.api = Some(api);
        self
    }

    pub fn engine(&self) -> &dyn RecoveryEngine {
        self.engine.as_ref()
    }

    pub fn config(&self) -> &AnalysisConfig {
        &self.config
    }

    pub fn architecture(&self) -> &Architecture {
        &self.arch
    }

    /// Number of workers used for per-function analyses
    pub fn concurrency_level(&self) -> usize {
        self.config.effective_concurrency()
    }

    pub fn get_or_create_function(&self, address: u64) -> Arc<FunctionDescriptor> {
        let (f, created) = self.functions.get_or_insert_with(address, || {
            match self.engine_functions.get(&address) {
                Some(&idx) => {
                    let info = &self.engine.functions()[idx];
                    FunctionDescriptor::new(
                        address,
                        info.name.clone(),
                        Some(idx),
                        info.basic_blocks.clone(),
                    )
                }
                None => FunctionDescriptor::new(address, format!("sub_{:x}", address), None, vec![]),
            }
        });
        if created {
            trace!("New function descriptor"; "addr" => format!("{:#x}", address), "name" => f.name());
            if !f.is_resolved() {
                debug!(
                    "Function is unknown to the recovery engine";
                    "addr" => format!("{:#x}", address),
                );
            }
        }
        f
    }

    /// The call descriptor for the call instruction at machine address `address`. `None` if there
    /// is no call there or it is not inside a known function.
    pub fn get_or_create_call(&self, address: u64) -> Option<Arc<CallDescriptor>> {
        if let Some(c) = self.calls.get(address) {
            return Some(c);
        }
        let (start, len) = self.engine.il_range_for_machine_address(address)?;
        let il = (start..start + len).find(|&i| {
            self.engine
                .instruction(i)
                .map(|ins| ins.op.is_call())
                .unwrap_or(false)
        })?;
        let caller = self.engine.functions()[self.engine.function_containing(il)?].entry;
        let (c, created) = self
            .calls
            .get_or_insert_with(address, || CallDescriptor::new(address, il, caller));
        if created {
            self.get_or_create_function(caller).add_call(address);
        }
        Some(c)
    }

    pub fn get_or_create_global(&self, address: u64) -> Arc<GlobalDescriptor> {
        self.globals
            .get_or_insert_with(address, || GlobalDescriptor::new(address))
            .0
    }

    /// Insert the import reached through `address`, or return the one already there
    pub fn add_import(
        &self,
        address: u64,
        library: &str,
        symbol: &str,
        ordinal: Option<u32>,
    ) -> Arc<ImportDescriptor> {
        let (i, created) = self.imports.get_or_insert_with(address, || {
            ImportDescriptor::new(address, library, symbol, ordinal)
        });
        if !created && (i.library() != library || i.symbol() != symbol) {
            warn!(
                "Conflicting import for an already known slot; keeping the first";
                "addr" => format!("{:#x}", address),
                "kept" => %i,
                "ignored" => format!("{}!{}", library, symbol),
            );
        }
        i
    }

    /// Record that symbolic value `variable_id` originates from the import at `import_address`.
    /// Returns `false` if there is no such import.
    pub fn bind_import_variable(&self, variable_id: usize, import_address: u64) -> bool {
        match self.imports.get(import_address) {
            Some(i) => {
                self.import_variables.bind(variable_id, &i);
                true
            }
            None => false,
        }
    }

    /// The import that produced `variable_id`. `None` if unbound or if the import is gone.
    pub fn get_import_by_variable(&self, variable_id: usize) -> Option<Arc<ImportDescriptor>> {
        self.import_variables.get(variable_id)
    }

    /// Drop every import descriptor. Variables bound to them become stale.
    pub fn clear_imports(&self) {
        self.imports.clear();
    }

    pub fn get_function(&self, address: u64) -> Option<Arc<FunctionDescriptor>> {
        self.functions.get(address)
    }

    pub fn get_call(&self, address: u64) -> Option<Arc<CallDescriptor>> {
        self.calls.get(address)
    }

    pub fn get_import(&self, address: u64) -> Option<Arc<ImportDescriptor>> {
        self.imports.get(address)
    }

    pub fn get_global(&self, address: u64) -> Option<Arc<GlobalDescriptor>> {
        self.globals.get(address)
    }

    pub fn functions(&self) -> Vec<Arc<FunctionDescriptor>> {
        self.functions.values()
    }

    pub fn calls(&self) -> Vec<Arc<CallDescriptor>> {
        self.calls.values()
    }

    pub fn imports(&self) -> Vec<Arc<ImportDescriptor>> {
        self.imports.values()
    }

    pub fn globals(&self) -> Vec<Arc<GlobalDescriptor>> {
        self.globals.values()
    }

    /// The function whose code contains machine address `address`
    pub fn function_containing_address(&self, address: u64) -> Option<Arc<FunctionDescriptor>> {
        let (il, _) = self.engine.il_range_for_machine_address(address)?;
        let idx = self.engine.function_containing(il)?;
        Some(self.get_or_create_function(self.engine.functions()[idx].entry))
    }

    /// Index of the basic block containing machine address `address`
    pub fn block_containing_address(&self, address: u64) -> Option<usize> {
        let (il, _) = self.engine.il_range_for_machine_address(address)?;
        self.engine.block_containing(il)
    }

    pub fn call_graph(&self) -> Arc<CallGraph> {
        self.call_graph.read().clone()
    }

    /// Function descriptors, callees before callers. Members of a recursive cycle are adjacent, in
    /// address order.
    pub fn functions_in_bottom_up_order(&self) -> Vec<Arc<FunctionDescriptor>> {
        self.call_graph()
            .bottom_up_order()
            .into_iter()
            .filter_map(|a| self.get_function(a))
            .collect()
    }

    /// Fill in missing import stack deltas and conventions from the API dictionary. Returns the
    /// number of imports that changed. Imports without a signature stay unknown.
    pub fn resolve_imports(&self) -> usize {
        let api = match &self.api {
            Some(api) => api,
            None => {
                debug!("No API dictionary; import stack deltas stay unknown");
                return 0;
            }
        };
        let mut changed = 0;
        for imp in self.imports.values() {
            if imp.stack_delta().is_known() && imp.convention().is_known() {
                continue;
            }
            let sig = match api.lookup(imp.library(), imp.symbol(), imp.ordinal()) {
                Some(sig) => sig,
                None => {
                    debug!("No signature for import"; "import" => %imp);
                    continue;
                }
            };
            let mut c = false;
            if let Some(d) = sig.stack_delta {
                c |= imp.set_stack_delta(StackDelta::Known(d));
            }
            let conv = sig
                .convention
                .filter(CallingConvention::is_known)
                .unwrap_or_else(|| {
                    CallingConvention::from_stack_delta(self.arch.word_size, imp.stack_delta())
                });
            c |= imp.set_convention(conv);
            if c {
                changed += 1;
                trace!(
                    "Resolved import";
                    "import" => %imp,
                    "stack_delta" => %imp.stack_delta(),
                    "convention" => %imp.convention(),
                );
                for caller in self.call_graph().callers(CallGraphNode::Import(imp.address())) {
                    self.invalidate_function(caller);
                }
            }
        }
        info!("Resolved imports"; "changed" => changed, "total" => self.imports.len());
        changed
    }

    /// Re-derive call targets, global references, and the call graph from the current maps.
    /// Idempotent.
    pub fn update_connections(&self) {
        for addr in self.engine.machine_addresses() {
            let (start, len) = match self.engine.il_range_for_machine_address(addr) {
                Some(r) => r,
                None => continue,
            };
            for il in start..start + len {
                let ins = match self.engine.instruction(il) {
                    Some(i) => i,
                    None => continue,
                };
                if ins.op.is_call() {
                    if let Some(c) = self.get_or_create_call(addr) {
                        if c.il_address() == il {
                            c.resolve(self.static_call_target(ins));
                        }
                    }
                }
                self.record_direct_global_references(addr, ins);
            }
        }
        self.rebuild_call_graph();
    }

    fn record_direct_global_references(&self, machine_addr: u64, ins: &Instruction) {
        let is_global = |a: u64| !self.imports.contains(a);
        if let Some(g) = ins.output.global_address().filter(|&a| is_global(a)) {
            self.get_or_create_global(g).add_write(machine_addr);
        }
        for g in ins
            .inputs
            .iter()
            .filter_map(Variable::global_address)
            .filter(|&a| is_global(a))
        {
            self.get_or_create_global(g).add_read(machine_addr);
        }
    }

    /// Call target derived from the call instruction alone
    fn static_call_target(&self, ins: &Instruction) -> CallTarget {
        match (ins.op, &ins.inputs[0]) {
            (Op::CallWithFallthrough | Op::CallWithNoFallthrough, Variable::MachineAddress { addr }) => {
                if self.imports.contains(*addr) {
                    CallTarget::Import(*addr)
                } else {
                    CallTarget::Function(self.get_or_create_function(*addr).address())
                }
            }
            (Op::CallWithFallthroughIndirect, v) => match v.global_address() {
                Some(slot) if self.config.resolve_indirect_calls_through_import_slots => self
                    .import_through_slot(slot)
                    .map(|i| CallTarget::Import(i.address()))
                    .unwrap_or(CallTarget::Unresolved),
                _ => CallTarget::Unresolved,
            },
            _ => CallTarget::Unresolved,
        }
    }

    /// The import whose value the loader placed in `slot`
    fn import_through_slot(&self, slot: u64) -> Option<Arc<ImportDescriptor>> {
        self.engine
            .imports()
            .iter()
            .filter(|f| f.address == slot)
            .find_map(|f| f.variable_id.and_then(|v| self.import_variables.get(v)))
            .or_else(|| self.imports.get(slot))
    }

    fn rebuild_call_graph(&self) {
        let functions: Vec<(u64, String)> = self
            .functions
            .values()
            .iter()
            .map(|f| (f.address(), f.name().to_owned()))
            .collect();
        let import_names: BTreeMap<u64, String> = self
            .imports
            .values()
            .iter()
            .map(|i| (i.address(), i.to_string()))
            .collect();
        // A call resolved to a since-cleared import has no sink to point at
        let calls: Vec<CallEdge> = self
            .calls
            .values()
            .iter()
            .map(|c| CallEdge {
                caller: c.caller(),
                site: c.address(),
                target: match c.target() {
                    CallTarget::Import(a) if !import_names.contains_key(&a) => {
                        CallTarget::Unresolved
                    }
                    t => t,
                },
            })
            .collect();
        let g = CallGraph::build(&functions, &calls, &import_names);
        debug!("Rebuilt call graph"; "nodes" => g.node_count(), "edges" => g.edge_count());
        *self.call_graph.write() = Arc::new(g);
    }

    /// Convention of whatever a call target refers to
    pub fn target_convention(&self, t: CallTarget) -> CallingConvention {
        match t {
            CallTarget::Function(a) => self
                .get_function(a)
                .map(|f| f.convention())
                .unwrap_or(CallingConvention::Unknown),
            CallTarget::Import(a) => self
                .get_import(a)
                .map(|i| i.convention())
                .unwrap_or(CallingConvention::Unknown),
            CallTarget::Unresolved => CallingConvention::Unknown,
        }
    }

    /// Stack delta of whatever a call target refers to
    pub fn target_stack_delta(&self, t: CallTarget) -> StackDelta {
        match t {
            CallTarget::Function(a) => self
                .get_function(a)
                .map(|f| f.stack_delta())
                .unwrap_or(StackDelta::Unknown),
            CallTarget::Import(a) => self
                .get_import(a)
                .map(|i| i.stack_delta())
                .unwrap_or(StackDelta::Unknown),
            CallTarget::Unresolved => StackDelta::Unknown,
        }
    }

    /// Call descriptors of `f`, keyed by the IL address of their call operation
    pub fn calls_by_il(&self, f: &FunctionDescriptor) -> BTreeMap<usize, Arc<CallDescriptor>> {
        f.calls()
            .into_iter()
            .filter_map(|a| self.get_call(a))
            .map(|c| (c.il_address(), c))
            .collect()
    }

    fn summary_of(&self, f: &FunctionDescriptor) -> Option<FunctionSummary> {
        f.engine_index()
            .map(|idx| FunctionSummary::compute(self.engine.as_ref(), idx))
    }

    /// What the calls of a function may redefine: everything but the stack pointer, or only the
    /// non-preserved locations when the callee's convention is known. Memory always.
    fn call_effects(&self, f: &FunctionDescriptor, summary: &FunctionSummary) -> CallEffects {
        let mut clobbered = UnorderedMap::new();
        for (il, c) in self.calls_by_il(f) {
            let known = self.target_convention(c.target()).is_known();
            let locs: Vec<DefUseLocation> = summary
                .all_variables
                .iter()
                .filter(|&&l| l != self.arch.stack_pointer)
                .filter(|l| !known || !self.arch.is_preserved(l))
                .map(|&l| DefUseLocation::Fixed(l))
                .chain(std::iter::once(DefUseLocation::IndirectMemory))
                .collect();
            clobbered.insert(il, locs);
        }
        CallEffects { clobbered }
    }

    /// The dependency graph of the function at `address`, built on first request and cached on
    /// its descriptor. `None` for functions whose code is unknown.
    pub fn function_pdg(&self, address: u64) -> Option<Arc<FunctionPdg>> {
        let f = self.get_function(address)?;
        if let Some(p) = f.cached_pdg() {
            return Some(p);
        }
        let summary = self.summary_of(&f)?;
        let effects = self.call_effects(&f, &summary);
        let rd = DataFlow::<ReachingDefinitionsElement>::forward_analyze(&summary, &effects);
        let pdg = FunctionPdg::build(address, &summary, &rd);
        trace!(
            "Built dependency graph";
            "function" => f.name(),
            "nodes" => pdg.nodes().len(),
            "slice" => pdg.slice().len(),
        );
        self.update_global_variables_for_func(&summary, &rd);
        if self.config.resolve_indirect_calls_through_import_slots
            && self.resolve_indirect_calls_for_func(&f, &summary, &rd)
        {
            self.rebuild_call_graph();
        }
        Some(f.cache_pdg(Arc::new(pdg)))
    }

    /// The constant all reaching definitions of `loc` agree upon
    fn constant_reaching(
        &self,
        rd_in: &ReachingDefinitionsElement,
        loc: ASLocation,
    ) -> Option<u64> {
        let mut value = None;
        for p in rd_in.reaching(&DefUseLocation::Fixed(loc)) {
            let d = match p {
                ProgPoint::Insn(d) => *d,
                ProgPoint::FunctionEntry => return None,
            };
            let v = match self.engine.instruction(d) {
                Some(Instruction {
                    op: Op::Copy,
                    inputs: [Variable::Constant { value, .. }, _],
                    ..
                }) => *value,
                _ => return None,
            };
            match value {
                None => value = Some(v),
                Some(prev) if prev == v => {}
                Some(_) => return None,
            }
        }
        value
    }

    /// Record loads and stores through constant addresses as global references
    fn update_global_variables_for_func(
        &self,
        summary: &FunctionSummary,
        rd: &DataFlow<ReachingDefinitionsElement>,
    ) {
        for &i in &summary.il_addrs {
            let ins = match self.engine.instruction(i) {
                Some(ins) if matches!(ins.op, Op::Load | Op::Store) => ins,
                _ => continue,
            };
            let (addr_loc, rd_in) = match (ins.inputs[0].try_to_aslocation(), rd.ins.get(&i)) {
                (Some(l), Some(r)) => (l, r),
                _ => continue,
            };
            let g = match self.constant_reaching(rd_in, addr_loc) {
                Some(g) if !self.imports.contains(g) => g,
                _ => continue,
            };
            let gd = self.get_or_create_global(g);
            if ins.op == Op::Load {
                gd.add_read(ins.address);
            } else {
                gd.add_write(ins.address);
            }
        }
    }

    /// The import slot every reaching definition of `loc` at `il` was read from
    fn slot_reaching(
        &self,
        rd: &DataFlow<ReachingDefinitionsElement>,
        il: usize,
        loc: ASLocation,
    ) -> Option<u64> {
        let mut slot = None;
        for p in rd.ins.get(&il)?.reaching(&DefUseLocation::Fixed(loc)) {
            let d = match p {
                ProgPoint::Insn(d) => *d,
                ProgPoint::FunctionEntry => return None,
            };
            let ins = self.engine.instruction(d)?;
            let s = match ins.op {
                Op::Copy => ins.inputs[0].global_address()?,
                Op::Load => {
                    let addr_loc = ins.inputs[0].try_to_aslocation()?;
                    self.constant_reaching(rd.ins.get(&d)?, addr_loc)?
                }
                _ => return None,
            };
            match slot {
                None => slot = Some(s),
                Some(prev) if prev == s => {}
                Some(_) => return None,
            }
        }
        slot
    }

    /// Resolve indirect calls whose target register was loaded from an import slot. Returns
    /// whether any call changed.
    fn resolve_indirect_calls_for_func(
        &self,
        f: &FunctionDescriptor,
        summary: &FunctionSummary,
        rd: &DataFlow<ReachingDefinitionsElement>,
    ) -> bool {
        let mut changed = false;
        for (il, c) in self.calls_by_il(f) {
            if c.target().is_resolved() {
                continue;
            }
            let loc = match self.engine.instruction(il) {
                Some(Instruction {
                    op: Op::CallWithFallthroughIndirect,
                    inputs: [v @ Variable::Varnode { .. }, _],
                    ..
                }) if v.global_address().is_none() => v.try_to_aslocation(),
                _ => None,
            };
            let import = loc
                .and_then(|l| self.slot_reaching(rd, il, l))
                .and_then(|s| self.import_through_slot(s));
            if let Some(i) = import {
                debug!(
                    "Resolved indirect call through import slot";
                    "call" => format!("{:#x}", c.address()),
                    "import" => %i,
                    "function" => summary.function,
                );
                changed |= c.resolve(CallTarget::Import(i.address()));
            }
        }
        changed
    }

    /// The whole-program dependency graph over all functions with known code
    pub fn program_pdg(&self) -> ProgramDependencyGraph {
        let mut r = ProgramDependencyGraph::default();
        for f in self.functions.values() {
            if let Some(p) = self.function_pdg(f.address()) {
                r.functions.insert(f.address(), p);
            }
        }
        for c in self.calls.values() {
            if let CallTarget::Function(a) = c.target() {
                let entry_il = self
                    .get_function(a)
                    .and_then(|f| f.engine_index())
                    .map(|idx| self.engine.functions()[idx].entry_il);
                if let Some(e) = entry_il {
                    r.call_edges.insert((c.il_address(), e));
                }
            }
        }
        r
    }

    /// Drop the cached dependency graph of `address` and of all its callers
    fn invalidate_function(&self, address: u64) {
        if let Some(f) = self.get_function(address) {
            f.invalidate_pdg();
        }
        for caller in self.call_graph().callers(CallGraphNode::Function(address)) {
            if let Some(f) = self.get_function(caller) {
                f.invalidate_pdg();
            }
        }
    }

    /// Estimate the stack delta of `address` from its callees' current deltas. Returns whether it
    /// changed.
    fn estimate_stack_delta(&self, address: u64) -> bool {
        let f = match self.get_function(address) {
            Some(f) => f,
            None => return false,
        };
        let summary = match self.summary_of(&f) {
            Some(s) => s,
            None => return false,
        };
        let clobber: Vec<ASLocation> = summary
            .all_variables
            .iter()
            .filter(|l| l.address_space_idx == REGISTER_SPACE)
            .filter(|l| **l != self.arch.stack_pointer && !self.arch.is_preserved(l))
            .cloned()
            .collect();
        let mut ctx = StackContext {
            stack_pointer: self.arch.stack_pointer,
            word_size: self.arch.word_size,
            callee_deltas: UnorderedMap::new(),
            clobbered: UnorderedMap::new(),
        };
        for (il, c) in self.calls_by_il(&f) {
            let mut d = self.target_stack_delta(c.target());
            if !d.is_known() && self.config.assume_cdecl_for_unknown_stack_delta {
                d = StackDelta::Known(0);
            }
            ctx.callee_deltas.insert(il, d);
            ctx.clobbered.insert(il, clobber.clone());
        }
        let d = stack_delta::estimate(&summary, &ctx);
        let changed = f.set_stack_delta(d);
        if changed {
            trace!("Stack delta"; "function" => f.name(), "delta" => %d);
            self.invalidate_function(address);
        }
        changed
    }

    fn convention_of(&self, f: &FunctionDescriptor) -> CallingConvention {
        match self.summary_of(f) {
            Some(summary) => {
                let reads = entry_register_reads(&summary, &self.arch);
                match_convention(
                    &self.arch,
                    self.engine.register_file(),
                    f.stack_delta(),
                    &reads,
                )
            }
            None => CallingConvention::Unknown,
        }
    }

    /// Run `op` on every function descriptor on a pool of [`Self::concurrency_level`] workers
    fn for_each_function_parallel<R: Send>(
        &self,
        op: impl Fn(&Arc<FunctionDescriptor>) -> R + Send + Sync,
    ) -> Vec<R> {
        let functions = self.functions.values();
        match rayon::ThreadPoolBuilder::new()
            .num_threads(self.concurrency_level())
            .build()
        {
            Ok(pool) => pool.install(|| functions.par_iter().map(&op).collect()),
            Err(e) => {
                warn!("Could not start worker pool; running sequentially"; "error" => %e);
                functions.iter().map(&op).collect()
            }
        }
    }

    /// Estimate stack deltas bottom-up, match calling conventions, and build every function's
    /// dependency graph. Enrichment failures leave values unknown.
    pub fn analyze_functions(&self) {
        for scc in self.call_graph().bottom_up_components() {
            // Recursive components iterate until their deltas settle
            for _ in 0..=scc.len() {
                let mut changed = false;
                for &a in &scc {
                    changed |= self.estimate_stack_delta(a);
                }
                if !changed || scc.len() == 1 {
                    break;
                }
            }
        }

        let conventions = self.for_each_function_parallel(|f| (f.clone(), self.convention_of(f)));
        for (f, c) in conventions {
            if f.set_convention(c) {
                trace!("Calling convention"; "function" => f.name(), "convention" => %c);
                self.invalidate_function(f.address());
            }
        }

        self.for_each_function_parallel(|f| {
            self.function_pdg(f.address());
        });
        self.rebuild_call_graph();
        info!(
            "Analyzed functions";
            "functions" => self.functions.len(),
            "known_stack_deltas" => self
                .functions
                .values()
                .iter()
                .filter(|f| f.stack_delta().is_known())
                .count(),
        );
    }

    /// Human-readable listing of all descriptors
    pub fn dump(&self) -> String {
        let mut s = String::new();
        s += &format!("Architecture: {} ({}-byte words)\n", self.arch.name, self.arch.word_size);
        s += "Functions:\n";
        for f in self.functions.values() {
            s += &format!(
                "  {:#x} {} convention={} stack_delta={}{}\n",
                f.address(),
                f.name(),
                f.convention(),
                f.stack_delta(),
                if f.is_resolved() { "" } else { " (unresolved)" },
            );
            for c in f.calls().into_iter().filter_map(|a| self.get_call(a)) {
                s += &format!("    call {:#x} -> {}\n", c.address(), c.target());
            }
        }
        s += "Imports:\n";
        for i in self.imports.values() {
            s += &format!(
                "  {:#x} {} convention={} stack_delta={}\n",
                i.address(),
                i,
                i.convention(),
                i.stack_delta()
            );
        }
        s += "Globals:\n";
        for g in self.globals.values() {
            s += &format!(
                "  {:#x} reads=[{}] writes=[{}]\n",
                g.address(),
                g.reads().iter().map(|a| format!("{:#x}", a)).join(", "),
                g.writes().iter().map(|a| format!("{:#x}", a)).join(", "),
            );
        }
        s += &format!(
            "Bottom-up order: {}\n",
            self.functions_in_bottom_up_order()
                .iter()
                .map(|f| f.name().to_owned())
                .join(", ")
        );
        s
    }
}
