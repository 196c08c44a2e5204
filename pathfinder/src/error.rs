//! Error families.
//!
//! Only genuinely exceptional conditions live here. Partial resolution (unknown stack deltas,
//! unresolved call targets, missing API signatures) is represented by explicit "unknown" values on
//! the descriptors instead, and solver inconclusiveness is a first-class verdict.

use std::path::PathBuf;

/// Invalid user-provided configuration, reported before any analysis work begins.
#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    /// A required address was not provided
    #[error("You forgot to specify a {0} address.")]
    MissingAddress(&'static str),

    /// An address could not be parsed as a number
    #[error("could not parse {which} address {text:?}")]
    MalformedAddress { which: &'static str, text: String },

    /// An address is not contained in any function known to the recovery engine
    #[error("{which} address {address:#x} is not contained in any known function")]
    AddressNotInFunction { which: &'static str, address: u64 },

    /// The requested solver engine does not exist
    #[error("unknown analysis engine {0:?} (expected one of: bounded, spacer)")]
    UnknownEngine(String),
}

/// The recovery engine could not produce an instruction stream at all. Always fatal.
#[derive(thiserror::Error, Debug)]
pub enum RecoveryError {
    #[error("could not read {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("malformed listing at line {line}: {message}")]
    Parse { line: usize, message: String },

    #[error("invalid IL instruction at {address:#x}: {message}")]
    InvalidInstruction { address: u64, message: String },

    #[error("the recovery engine produced no instructions")]
    EmptyProgram,

    #[error("the {0} register file does not define its stack pointer")]
    NoStackPointer(String),
}

/// Failure to set up or talk to a solver backend. Distinct from an `Unknown` verdict.
#[derive(thiserror::Error, Debug)]
pub enum SolverError {
    #[error("failed to start solver {program}: {message}")]
    Spawn { program: String, message: String },

    #[error("solver exited with {0}")]
    Exit(String),

    #[error("unrecognized solver response: {0:?}")]
    MalformedResponse(String),
}

/// The API signature database could not be loaded.
#[derive(thiserror::Error, Debug)]
pub enum ApiDatabaseError {
    #[error("could not read API database {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("could not parse API database: {0}")]
    Json(#[from] serde_json::Error),
}

/// Errors surfaced by a reachability query.
#[derive(thiserror::Error, Debug)]
pub enum PathFinderError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Solver(#[from] SolverError),
}

/// Parse an address given either as `0x`-prefixed hexadecimal or as decimal.
pub fn parse_address(which: &'static str, text: &str) -> Result<u64, ConfigError> {
    let t = text.trim();
    let parsed = if let Some(hex) = t.strip_prefix("0x").or_else(|| t.strip_prefix("0X")) {
        u64::from_str_radix(hex, 16)
    } else {
        t.parse::<u64>()
    };
    parsed.map_err(|_| ConfigError::MalformedAddress {
        which,
        text: text.to_owned(),
    })
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn addresses_parse_in_hex_and_decimal() {
        assert_eq!(parse_address("source", "0x401000").unwrap(), 0x401000);
        assert_eq!(parse_address("source", "4096").unwrap(), 4096);
        assert!(matches!(
            parse_address("target", "zzz"),
            Err(ConfigError::MalformedAddress { which: "target", .. })
        ));
    }

    #[test]
    fn missing_address_message_names_the_address() {
        assert_eq!(
            ConfigError::MissingAddress("source").to_string(),
            "You forgot to specify a source address."
        );
    }
}
