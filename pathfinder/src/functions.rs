//! Function descriptors.

use std::collections::BTreeSet;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::convention::CallingConvention;
use crate::pdg::FunctionPdg;
use crate::stack_delta::StackDelta;

/// One recovered function.
///
/// Created once per entry address. Its convention, stack delta, call list, and cached dependency
/// graph are refined in place by later passes.
#[derive(Debug)]
pub struct FunctionDescriptor {
    address: u64,
    name: String,
    /// Index into the recovery engine's functions. `None` for a function only known as a call
    /// target.
    engine_index: Option<usize>,
    basic_blocks: Vec<usize>,
    convention: RwLock<CallingConvention>,
    stack_delta: RwLock<StackDelta>,
    /// Machine addresses of the call sites inside this function
    calls: RwLock<BTreeSet<u64>>,
    pdg: RwLock<Option<Arc<FunctionPdg>>>,
}

impl FunctionDescriptor {
    pub(crate) fn new(
        address: u64,
        name: String,
        engine_index: Option<usize>,
        basic_blocks: Vec<usize>,
    ) -> Self {
        Self {
            address,
            name,
            engine_index,
            basic_blocks,
            convention: RwLock::new(CallingConvention::Unknown),
            stack_delta: RwLock::new(StackDelta::Unknown),
            calls: RwLock::new(BTreeSet::new()),
            pdg: RwLock::new(None),
        }
    }

    pub fn address(&self) -> u64 {
        self.address
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn engine_index(&self) -> Option<usize> {
        self.engine_index
    }

    /// Whether the recovery engine knows this function's code
    pub fn is_resolved(&self) -> bool {
        self.engine_index.is_some()
    }

    pub fn basic_blocks(&self) -> &[usize] {
        &self.basic_blocks
    }

    pub fn convention(&self) -> CallingConvention {
        *self.convention.read()
    }

    pub fn stack_delta(&self) -> StackDelta {
        *self.stack_delta.read()
    }

    /// Returns whether the value changed
    pub(crate) fn set_convention(&self, c: CallingConvention) -> bool {
        let mut cur = self.convention.write();
        let changed = *cur != c;
        *cur = c;
        changed
    }

    /// Returns whether the value changed
    pub(crate) fn set_stack_delta(&self, d: StackDelta) -> bool {
        let mut cur = self.stack_delta.write();
        let changed = *cur != d;
        *cur = d;
        changed
    }

    pub fn calls(&self) -> Vec<u64> {
        self.calls.read().iter().cloned().collect()
    }

    pub(crate) fn add_call(&self, call_address: u64) {
        self.calls.write().insert(call_address);
    }

    pub fn cached_pdg(&self) -> Option<Arc<FunctionPdg>> {
        self.pdg.read().clone()
    }

    pub(crate) fn cache_pdg(&self, pdg: Arc<FunctionPdg>) -> Arc<FunctionPdg> {
        let mut slot = self.pdg.write();
        slot.get_or_insert(pdg).clone()
    }

    /// Drop the cached dependency graph so the next query rebuilds it
    pub fn invalidate_pdg(&self) {
        *self.pdg.write() = None;
    }
}
