pub mod apidb;
pub mod bounded_solver;
pub mod call_graph;
pub mod calls;
pub mod chc;
pub mod config;
pub mod constraint_solver;
pub mod containers;
pub mod convention;
pub mod dataflow;
pub mod descriptors;
pub mod encoder;
pub mod engine;
pub mod error;
pub mod functions;
pub mod globals;
pub mod il;
pub mod imports;
pub mod listing_lifter;
pub mod path_finder;
pub mod pdg;
pub mod reaching_definitions;
pub mod solver;
pub mod spacer;
pub mod stack_delta;
pub mod term;
pub mod tests;
#[cfg(feature = "z3")]
mod z3_backend;

pub mod log {
    pub use slog_scope::{crit, debug, error, info, trace, warn};

    /// A key that is only logged when its value is present
    pub struct OptionalKV<V: slog::Value>(pub &'static str, pub Option<V>);
    impl<V: slog::Value> slog::KV for OptionalKV<V> {
        fn serialize(
            &self,
            record: &slog::Record,
            serializer: &mut dyn slog::Serializer,
        ) -> slog::Result {
            match &self.1 {
                Some(v) => v.serialize(record, self.0, serializer),
                None => Ok(()),
            }
        }
    }

    /// Sends records to the terminal and, optionally, to a JSON log file
    pub struct FileAndTermDrain {
        file_drain: Option<slog::Logger>,
        term_drain: slog::Logger,
    }
    impl FileAndTermDrain {
        /// Root logger at verbosity `debug_level` (0 warn, 1 info, 2 debug, 3+ trace). With a log
        /// file, the terminal only shows errors.
        pub fn new(
            debug_level: usize,
            disable_terminal_logging: bool,
            force_block: bool,
            path: Option<std::path::PathBuf>,
        ) -> Result<slog::Logger, sloggers::Error> {
            use sloggers::types::{Format, OverflowStrategy, Severity};
            use sloggers::Build;

            let level = match debug_level {
                0 => Severity::Warning,
                1 => Severity::Info,
                2 => Severity::Debug,
                _ => Severity::Trace,
            };

            let term_drain = if disable_terminal_logging {
                sloggers::null::NullLoggerBuilder.build()?
            } else {
                let (term_level, overflow) = match (&path, force_block) {
                    (None, _) => (level, OverflowStrategy::Block),
                    (Some(_), true) => (Severity::Error, OverflowStrategy::Block),
                    (Some(_), false) => (Severity::Error, OverflowStrategy::DropAndReport),
                };
                sloggers::terminal::TerminalLoggerBuilder::new()
                    .destination(sloggers::terminal::Destination::Stderr)
                    .level(term_level)
                    .overflow_strategy(overflow)
                    .format(Format::Compact)
                    .build()?
            };

            let file_drain = match path {
                Some(path) => Some(
                    sloggers::file::FileLoggerBuilder::new(path)
                        .truncate()
                        .level(level)
                        .overflow_strategy(OverflowStrategy::Block)
                        .format(Format::Json)
                        .build()?,
                ),
                None => None,
            };

            Ok(slog::Logger::root(
                Self {
                    file_drain,
                    term_drain,
                },
                slog::o!(),
            ))
        }
    }
    impl slog::Drain for FileAndTermDrain {
        type Ok = ();
        type Err = slog::Never;
        fn log(&self, r: &slog::Record<'_>, kv: &slog::OwnedKVList) -> Result<(), slog::Never> {
            if let Some(f) = &self.file_drain {
                <slog::Logger as slog::Drain>::log(f, r, kv)?;
            }
            <slog::Logger as slog::Drain>::log(&self.term_drain, r, kv)
        }
    }
}
