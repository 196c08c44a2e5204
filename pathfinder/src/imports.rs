//! Import descriptors and the import-variable map.

use std::collections::BTreeMap;
use std::sync::{Arc, Weak};

use parking_lot::RwLock;

use crate::convention::CallingConvention;
use crate::stack_delta::StackDelta;

/// An external symbol reached through an import slot or thunk.
#[derive(Debug)]
pub struct ImportDescriptor {
    address: u64,
    library: String,
    symbol: String,
    ordinal: Option<u32>,
    stack_delta: RwLock<StackDelta>,
    convention: RwLock<CallingConvention>,
}

impl ImportDescriptor {
    pub(crate) fn new(address: u64, library: &str, symbol: &str, ordinal: Option<u32>) -> Self {
        Self {
            address,
            library: library.to_owned(),
            symbol: symbol.to_owned(),
            ordinal,
            stack_delta: RwLock::new(StackDelta::Unknown),
            convention: RwLock::new(CallingConvention::Unknown),
        }
    }

    pub fn address(&self) -> u64 {
        self.address
    }

    pub fn library(&self) -> &str {
        &self.library
    }

    pub fn symbol(&self) -> &str {
        &self.symbol
    }

    pub fn ordinal(&self) -> Option<u32> {
        self.ordinal
    }

    pub fn stack_delta(&self) -> StackDelta {
        *self.stack_delta.read()
    }

    pub fn convention(&self) -> CallingConvention {
        *self.convention.read()
    }

    /// Record a known stack delta. Unknown never overwrites known.
    pub(crate) fn set_stack_delta(&self, d: StackDelta) -> bool {
        if !d.is_known() {
            return false;
        }
        let mut cur = self.stack_delta.write();
        let changed = *cur != d;
        *cur = d;
        changed
    }

    pub(crate) fn set_convention(&self, c: CallingConvention) -> bool {
        if !c.is_known() {
            return false;
        }
        let mut cur = self.convention.write();
        let changed = *cur != c;
        *cur = c;
        changed
    }
}

impl std::fmt::Display for ImportDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}!{}", self.library, self.symbol)?;
        if let Some(o) = self.ordinal {
            write!(f, "@{}", o)?;
        }
        Ok(())
    }
}

/// Non-owning index from loader-assigned symbolic value ids to the import that produced them.
#[derive(Debug, Default)]
pub struct ImportVariableMap {
    map: RwLock<BTreeMap<usize, Weak<ImportDescriptor>>>,
}

impl ImportVariableMap {
    pub fn bind(&self, variable_id: usize, import: &Arc<ImportDescriptor>) {
        self.map.write().insert(variable_id, Arc::downgrade(import));
    }

    /// The import that produced `variable_id`, or `None` if unbound or stale
    pub fn get(&self, variable_id: usize) -> Option<Arc<ImportDescriptor>> {
        self.map.read().get(&variable_id).and_then(Weak::upgrade)
    }

    pub fn len(&self) -> usize {
        self.map.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn stack_delta_never_regresses() {
        let i = ImportDescriptor::new(0x3000, "msvcrt.dll", "rand", None);
        assert!(i.set_stack_delta(StackDelta::Known(0)));
        assert!(!i.set_stack_delta(StackDelta::Unknown));
        assert_eq!(i.stack_delta(), StackDelta::Known(0));
    }

    #[test]
    fn dropped_import_leaves_a_stale_binding() {
        let m = ImportVariableMap::default();
        let i = Arc::new(ImportDescriptor::new(0x3000, "msvcrt.dll", "rand", None));
        m.bind(4, &i);
        assert!(m.get(4).is_some());
        drop(i);
        assert!(m.get(4).is_none());
    }
}
