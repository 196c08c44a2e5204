//! Analysis configuration and the immutable architecture description.
//!
//! Unlike a process-wide store, an [`AnalysisConfig`] is an explicit value handed to
//! [`DescriptorSet::new`](crate::descriptors::DescriptorSet::new) and to the path finder, so that
//! independent analyses in the same process may run with different settings.

use crate::dataflow::ASLocation;
use crate::engine::RegisterFile;

/// Knobs that affect analysis and path finding.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AnalysisConfig {
    /// Number of worker threads for per-function analyses. `0` means one per available CPU.
    pub concurrency_level: usize,
    /// Maximum number of encode/solve cycles per reachability query.
    pub refinement_budget: usize,
    /// Maximum number of clause applications along a single explored path.
    pub max_path_length: usize,
    /// Maximum number of symbolic states explored per solver invocation.
    pub max_explored_states: usize,
    /// Skip instructions outside a function's dependency-graph slice while encoding.
    pub enable_pdg_slicing: bool,
    /// Treat all memory as clobbered by a summarized call.
    pub havoc_memory_on_summarized_calls: bool,
    /// When the callee's stack delta is unknown, assume that it releases no arguments (cdecl).
    /// Otherwise the stack pointer after such a call becomes unconstrained.
    pub assume_cdecl_for_unknown_stack_delta: bool,
    /// Resolve indirect calls whose target was loaded from an import slot to that import.
    pub resolve_indirect_calls_through_import_slots: bool,
    /// Decide path conditions by candidate search instead of z3.
    pub use_candidate_search: bool,
    /// Time limit for one z3 check of a path condition, in milliseconds. `0` means none.
    pub constraint_timeout_ms: u32,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        AnalysisConfig {
            concurrency_level: 0,
            refinement_budget: 4,
            max_path_length: 512,
            max_explored_states: 100_000,
            enable_pdg_slicing: true,
            havoc_memory_on_summarized_calls: true,
            assume_cdecl_for_unknown_stack_delta: true,
            resolve_indirect_calls_through_import_slots: true,
            use_candidate_search: false,
            constraint_timeout_ms: 10_000,
        }
    }
}

impl AnalysisConfig {
    /// The actual number of worker threads to use
    pub fn effective_concurrency(&self) -> usize {
        if self.concurrency_level == 0 {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1)
        } else {
            self.concurrency_level
        }
    }
}

#[derive(clap::ArgEnum, Clone, Debug)]
/// Analysis configuration parameters
pub enum CommandLineAnalysisConfig {
    DisablePdgSlicing,
    PreserveMemoryAcrossSummarizedCalls,
    DisableCdeclAssumptionForUnknownStackDelta,
    DisableIndirectImportResolution,
    UseCandidateSearch,
}

impl From<Vec<CommandLineAnalysisConfig>> for AnalysisConfig {
    fn from(v: Vec<CommandLineAnalysisConfig>) -> Self {
        use CommandLineAnalysisConfig::*;
        let mut r = AnalysisConfig::default();
        for v in v {
            match v {
                DisablePdgSlicing => {
                    r.enable_pdg_slicing = false;
                }
                PreserveMemoryAcrossSummarizedCalls => {
                    r.havoc_memory_on_summarized_calls = false;
                }
                DisableCdeclAssumptionForUnknownStackDelta => {
                    r.assume_cdecl_for_unknown_stack_delta = false;
                }
                DisableIndirectImportResolution => {
                    r.resolve_indirect_calls_through_import_slots = false;
                }
                UseCandidateSearch => {
                    r.use_candidate_search = true;
                }
            }
        }
        r
    }
}

/// Architecture facts, fixed for the lifetime of a descriptor set.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Architecture {
    pub name: String,
    pub word_size: usize,
    pub stack_pointer: ASLocation,
    pub instruction_pointer: Option<ASLocation>,
    /// Registers that every calling convention preserves
    pub preserved: Vec<ASLocation>,
}

impl Architecture {
    /// Derive the architecture from a register file. `None` if the register file does not name a
    /// stack pointer it defines.
    pub fn from_register_file(rf: &RegisterFile) -> Option<Self> {
        Some(Self {
            name: rf.arch_name.clone(),
            word_size: rf.word_size,
            stack_pointer: rf.stack_pointer_location()?,
            instruction_pointer: rf.location(&rf.instruction_pointer),
            preserved: rf
                .registers
                .iter()
                .filter(|r| r.preserved)
                .filter_map(|r| rf.location(&r.name))
                .collect(),
        })
    }

    pub fn is_preserved(&self, loc: &ASLocation) -> bool {
        self.preserved.contains(loc)
    }

    /// Bit-mask of a machine word
    pub fn word_mask(&self) -> u64 {
        if self.word_size >= 8 {
            u64::MAX
        } else {
            (1u64 << (8 * self.word_size)) - 1
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn command_line_flags_toggle_defaults() {
        let c: AnalysisConfig = vec![
            CommandLineAnalysisConfig::DisablePdgSlicing,
            CommandLineAnalysisConfig::PreserveMemoryAcrossSummarizedCalls,
        ]
        .into();
        assert!(!c.enable_pdg_slicing);
        assert!(!c.havoc_memory_on_summarized_calls);
        assert!(c.assume_cdecl_for_unknown_stack_delta);
        assert_eq!(c.refinement_budget, 4);
        assert!(!c.use_candidate_search);
        let c: AnalysisConfig = vec![CommandLineAnalysisConfig::UseCandidateSearch].into();
        assert!(c.use_candidate_search);
    }

    #[test]
    fn architecture_from_x86() {
        let a = Architecture::from_register_file(&RegisterFile::x86()).unwrap();
        assert_eq!(a.word_size, 4);
        assert_eq!(a.word_mask(), 0xffff_ffff);
        assert_eq!(a.preserved.len(), 5);
    }
}
