//! Error types for the vector-add CLI.

use thiserror::Error;

/// CLI result type alias.
pub type CliResult<T> = Result<T, CliError>;

/// CLI error type.
#[derive(Error, Debug)]
pub enum CliError {
    /// Runtime or routine failure.
    #[error(transparent)]
    Offload(#[from] offload::OffloadError),

    /// Configuration file or environment could not be read.
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    /// The device produced a wrong result.
    #[error("Verification failed: {mismatches} of {checked} elements differ")]
    VerificationFailed {
        /// Elements that differ.
        mismatches: usize,
        /// Elements checked.
        checked: usize,
    },
}
