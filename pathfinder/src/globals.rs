//! Global memory descriptors.

use std::collections::BTreeSet;

use parking_lot::RwLock;

/// A statically addressable memory location. References only ever accumulate.
#[derive(Debug)]
pub struct GlobalDescriptor {
    address: u64,
    /// Machine addresses of reading instructions
    reads: RwLock<BTreeSet<u64>>,
    /// Machine addresses of writing instructions
    writes: RwLock<BTreeSet<u64>>,
}

impl GlobalDescriptor {
    pub(crate) fn new(address: u64) -> Self {
        Self {
            address,
            reads: RwLock::new(BTreeSet::new()),
            writes: RwLock::new(BTreeSet::new()),
        }
    }

    pub fn address(&self) -> u64 {
        self.address
    }

    pub fn reads(&self) -> Vec<u64> {
        self.reads.read().iter().cloned().collect()
    }

    pub fn writes(&self) -> Vec<u64> {
        self.writes.read().iter().cloned().collect()
    }

    pub(crate) fn add_read(&self, insn: u64) {
        self.reads.write().insert(insn);
    }

    pub(crate) fn add_write(&self, insn: u64) {
        self.writes.write().insert(insn);
    }
}
