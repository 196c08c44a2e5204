//! Call-site descriptors.

use parking_lot::RwLock;

/// What a call site transfers control to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum CallTarget {
    /// Indirect or otherwise unknown
    Unresolved,
    /// Entry address of a function descriptor
    Function(u64),
    /// Address of an import descriptor
    Import(u64),
}

impl CallTarget {
    pub fn is_resolved(&self) -> bool {
        !matches!(self, CallTarget::Unresolved)
    }
}

impl std::fmt::Display for CallTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            CallTarget::Unresolved => write!(f, "<unresolved>"),
            CallTarget::Function(a) => write!(f, "function {:#x}", a),
            CallTarget::Import(a) => write!(f, "import {:#x}", a),
        }
    }
}

/// One call instruction site.
#[derive(Debug)]
pub struct CallDescriptor {
    address: u64,
    /// IL address of the call operation
    il_address: usize,
    /// Entry address of the enclosing function
    caller: u64,
    target: RwLock<CallTarget>,
}

impl CallDescriptor {
    pub(crate) fn new(address: u64, il_address: usize, caller: u64) -> Self {
        Self {
            address,
            il_address,
            caller,
            target: RwLock::new(CallTarget::Unresolved),
        }
    }

    pub fn address(&self) -> u64 {
        self.address
    }

    pub fn il_address(&self) -> usize {
        self.il_address
    }

    pub fn caller(&self) -> u64 {
        self.caller
    }

    pub fn target(&self) -> CallTarget {
        *self.target.read()
    }

    /// Record a resolved target. A resolved target is never replaced by `Unresolved`. Returns
    /// whether the target changed.
    pub(crate) fn resolve(&self, t: CallTarget) -> bool {
        if !t.is_resolved() {
            return false;
        }
        let mut cur = self.target.write();
        let changed = *cur != t;
        *cur = t;
        changed
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn resolution_never_reverts() {
        let c = CallDescriptor::new(0x10, 3, 0x0);
        assert!(c.resolve(CallTarget::Import(0x3000)));
        assert!(!c.resolve(CallTarget::Unresolved));
        assert_eq!(c.target(), CallTarget::Import(0x3000));
    }
}
