//! Calling-convention matching.

use serde::{Deserialize, Serialize};

use crate::config::Architecture;
use crate::containers::unordered::UnorderedMap;
use crate::dataflow::{ASLocation, DataFlow, FunctionSummary, ProgPoint};
use crate::engine::{DefUseLocation, RegisterFile};
use crate::reaching_definitions::{CallEffects, ReachingDefinitionsElement};
use crate::stack_delta::StackDelta;

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallingConvention {
    Unknown,
    Cdecl,
    Stdcall,
    Fastcall,
    Thiscall,
    #[serde(alias = "sysv", alias = "systemv")]
    SystemV64,
}

impl CallingConvention {
    pub fn is_known(&self) -> bool {
        !matches!(self, CallingConvention::Unknown)
    }

    /// The convention implied by a stack delta alone
    pub fn from_stack_delta(word_size: usize, delta: StackDelta) -> Self {
        match (word_size, delta) {
            (8, StackDelta::Known(0)) => CallingConvention::SystemV64,
            (8, _) => CallingConvention::Unknown,
            (_, StackDelta::Known(0)) => CallingConvention::Cdecl,
            (_, StackDelta::Known(d)) if d > 0 => CallingConvention::Stdcall,
            _ => CallingConvention::Unknown,
        }
    }
}

impl std::fmt::Display for CallingConvention {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        let s = match self {
            CallingConvention::Unknown => "unknown",
            CallingConvention::Cdecl => "cdecl",
            CallingConvention::Stdcall => "stdcall",
            CallingConvention::Fastcall => "fastcall",
            CallingConvention::Thiscall => "thiscall",
            CallingConvention::SystemV64 => "systemv64",
        };
        write!(f, "{}", s)
    }
}

/// Match the convention of a function from its stack delta and the registers it reads before
/// writing them.
pub fn match_convention(
    arch: &Architecture,
    rf: &RegisterFile,
    delta: StackDelta,
    entry_reads: &[ASLocation],
) -> CallingConvention {
    if arch.word_size == 8 {
        return CallingConvention::from_stack_delta(8, delta);
    }
    let reads = |name: &str| {
        rf.location(name)
            .map(|l| entry_reads.contains(&l))
            .unwrap_or(false)
    };
    match delta {
        StackDelta::Unknown => CallingConvention::Unknown,
        StackDelta::Known(d) => {
            if reads("ECX") && reads("EDX") {
                CallingConvention::Fastcall
            } else if reads("ECX") && d > 0 {
                CallingConvention::Thiscall
            } else {
                CallingConvention::from_stack_delta(arch.word_size, delta)
            }
        }
    }
}

/// Non-preserved registers the function reads before defining them. Calls are assumed to clobber
/// exactly the non-preserved registers.
pub fn entry_register_reads(summary: &FunctionSummary, arch: &Architecture) -> Vec<ASLocation> {
    let clobber: Vec<DefUseLocation> = summary
        .all_variables
        .iter()
        .filter(|l| !arch.is_preserved(l))
        .map(|l| DefUseLocation::Fixed(*l))
        .collect();
    let mut effects = CallEffects {
        clobbered: UnorderedMap::new(),
    };
    for &i in &summary.il_addrs {
        let is_call = summary
            .engine
            .instruction(i)
            .map(|ins| ins.op.is_call())
            .unwrap_or(false);
        if is_call {
            effects.clobbered.insert(i, clobber.clone());
        }
    }
    let rd = DataFlow::<ReachingDefinitionsElement>::forward_analyze(summary, &effects);

    let mut r: Vec<ASLocation> = vec![];
    for &i in &summary.il_addrs {
        let (du, rd_in) = match (summary.def_use.get(&i), rd.ins.get(&i)) {
            (Some(du), Some(rd_in)) => (du, rd_in),
            _ => continue,
        };
        for u in &du.uses {
            if let DefUseLocation::Fixed(l) = u {
                if l.address_space_idx == crate::il::REGISTER_SPACE
                    && !arch.is_preserved(l)
                    && rd_in.reaching(u).any(|p| *p == ProgPoint::FunctionEntry)
                    && !r.contains(l)
                {
                    r.push(*l);
                }
            }
        }
    }
    r.sort();
    r
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn conventions_from_delta_and_registers() {
        let rf = RegisterFile::x86();
        let arch = Architecture::from_register_file(&rf).unwrap();
        let ecx = rf.location("ECX").unwrap();
        let edx = rf.location("EDX").unwrap();
        assert_eq!(
            match_convention(&arch, &rf, StackDelta::Known(0), &[]),
            CallingConvention::Cdecl
        );
        assert_eq!(
            match_convention(&arch, &rf, StackDelta::Known(8), &[]),
            CallingConvention::Stdcall
        );
        assert_eq!(
            match_convention(&arch, &rf, StackDelta::Known(4), &[ecx]),
            CallingConvention::Thiscall
        );
        assert_eq!(
            match_convention(&arch, &rf, StackDelta::Known(0), &[ecx, edx]),
            CallingConvention::Fastcall
        );
        assert_eq!(
            match_convention(&arch, &rf, StackDelta::Unknown, &[ecx]),
            CallingConvention::Unknown
        );
    }

    #[test]
    fn convention_names_deserialize() {
        let c: CallingConvention = serde_json::from_str("\"stdcall\"").unwrap();
        assert_eq!(c, CallingConvention::Stdcall);
        let c: CallingConvention = serde_json::from_str("\"sysv\"").unwrap();
        assert_eq!(c, CallingConvention::SystemV64);
    }
}
