use pathfinder::*;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::Parser;

use crate::config::AnalysisConfig;
use crate::descriptors::DescriptorSet;
use crate::error::{parse_address, ConfigError};
use crate::path_finder::PathFinder;
use crate::solver::{Engine, Verdict};

#[derive(clap::Args, Debug)]
struct LogArgs {
    /// Disable terminal logging, even for high severity alerts. Strongly discouraged for normal
    /// use.
    #[clap(long)]
    debug_disable_terminal_logging: bool,
    /// Force blocking for terminal logging. If too many messages are being spewed the logger,
    /// by default, does not block, but instead dumps a dropped-messages alert. This option
    /// forces it to block and dump even if too many are being sent.
    #[clap(long)]
    debug_forced_blocking_terminal_logging: bool,
    /// Path to send log (as JSON) to
    ///
    /// Error or higher severity alerts will still continue being shown at stderr (in addition
    /// to being added to the log)
    #[clap(long = "log")]
    log_file: Option<PathBuf>,
    /// Debug level (repeat for more: 0-warn, 1-info, 2-debug, 3-trace)
    #[clap(short, long, parse(from_occurrences))]
    debug: usize,
}

/// Decide reachability between program points of a lifted binary
#[derive(Parser, Debug)]
#[clap(about, version, author)]
enum Args {
    /// Decide whether a target address is reachable from a source address
    FindPath {
        /// Path to an IL listing, as exported by the disassembler front-end
        listing: PathBuf,
        /// Source address (hex with `0x`, or decimal)
        #[clap(long)]
        source: Option<String>,
        /// Target address (hex with `0x`, or decimal)
        #[clap(long)]
        target: Option<String>,
        /// Solver engine
        #[clap(long, arg_enum, default_value = "bounded")]
        engine: Engine,
        /// JSON API signature database used to resolve imports
        #[clap(long)]
        apidb: Option<PathBuf>,
        /// Maximum number of encode/solve cycles
        #[clap(long)]
        refinement_budget: Option<usize>,
        /// Worker threads for per-function analyses (0 for one per CPU)
        #[clap(long)]
        concurrency: Option<usize>,
        #[clap(flatten)]
        log: LogArgs,
        /// Advanced configuration options to tweak the analysis behavior
        #[clap(short = 'Z', long, arg_enum)]
        advanced_config: Vec<config::CommandLineAnalysisConfig>,
    },
    /// Print the recovered descriptors and the bottom-up function order
    Describe {
        /// Path to an IL listing, as exported by the disassembler front-end
        listing: PathBuf,
        /// JSON API signature database used to resolve imports
        #[clap(long)]
        apidb: Option<PathBuf>,
        /// Output the call graph as a GraphViz `.dot` file to the given path
        #[clap(long)]
        output_call_graph: Option<PathBuf>,
        #[clap(flatten)]
        log: LogArgs,
        /// Advanced configuration options to tweak the analysis behavior
        #[clap(short = 'Z', long, arg_enum)]
        advanced_config: Vec<config::CommandLineAnalysisConfig>,
    },
}

type CliResult<T> = Result<T, Box<dyn std::error::Error>>;

fn install_logger(args: LogArgs) -> CliResult<slog_scope::GlobalLoggerGuard> {
    let logger = crate::log::FileAndTermDrain::new(
        args.debug,
        args.debug_disable_terminal_logging,
        args.debug_forced_blocking_terminal_logging,
        args.log_file,
    )?;
    Ok(slog_scope::set_global_logger(logger))
}

/// Lift the listing and build the analyzed descriptor set
fn load(
    listing: &Path,
    api_database: Option<&Path>,
    config: AnalysisConfig,
) -> CliResult<DescriptorSet> {
    let prog = listing_lifter::lift_from_file(listing)?;
    let mut descriptors = DescriptorSet::new(Arc::new(prog), config)?;
    if let Some(path) = api_database {
        let db = apidb::JsonApiDictionary::load(path)?;
        descriptors = descriptors.with_api_dictionary(Arc::new(db));
        descriptors.resolve_imports();
    }
    descriptors.analyze_functions();
    Ok(descriptors)
}

fn run(args: Args) -> CliResult<()> {
    match args {
        Args::FindPath {
            listing,
            source,
            target,
            engine,
            apidb,
            refinement_budget,
            concurrency,
            log: log_args,
            advanced_config,
        } => {
            let _log_guard = install_logger(log_args)?;

            let source = source.ok_or(ConfigError::MissingAddress("source"))?;
            let target = target.ok_or(ConfigError::MissingAddress("target"))?;
            let source = parse_address("source", &source)?;
            let target = parse_address("target", &target)?;

            let mut config = AnalysisConfig::from(advanced_config);
            if let Some(b) = refinement_budget {
                config.refinement_budget = b;
            }
            if let Some(c) = concurrency {
                config.concurrency_level = c;
            }

            let descriptors = load(&listing, apidb.as_deref(), config)?;
            let mut finder = PathFinder::new(&descriptors, engine);
            let result = finder.find_path_hierarchical(source, target)?;

            println!("The CHC encoding is:");
            println!("{}", result.encoding_text);
            println!("---");
            println!("The result is '{}'", result.verdict);
            match &result.verdict {
                Verdict::Sat(witness) => {
                    println!("The answer is:");
                    print!("{}", witness);
                }
                Verdict::Unknown(reason) => println!("Reason: {}", reason),
                Verdict::Unsat => {
                    println!("The answer is:");
                    println!(
                        "{}",
                        result.answer.as_deref().unwrap_or("no path information")
                    );
                }
            }
            log::info!(
                "Done";
                "cycles" => result.cycles,
                "level" => result.level,
            );
        }
        Args::Describe {
            listing,
            apidb,
            output_call_graph,
            log: log_args,
            advanced_config,
        } => {
            let _log_guard = install_logger(log_args)?;
            let descriptors = load(&listing, apidb.as_deref(), advanced_config.into())?;
            print!("{}", descriptors.dump());
            if let Some(path) = output_call_graph {
                std::fs::write(&path, descriptors.call_graph().to_dot())?;
            }
            log::trace!("Done");
        }
    }
    Ok(())
}

fn main() {
    if let Err(e) = run(Args::parse()) {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}
