//! CLI error types.

use thiserror::Error;

use tilecascade::batch::BatchError;
use tilecascade::config::ConfigError;
use tilecascade::io::SourceError;

/// Errors surfaced to the command line.
#[derive(Debug, Error)]
pub enum CliError {
    #[error("invalid argument: {0}")]
    Argument(String),

    #[error("unknown process: {0}")]
    UnknownProcess(String),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Output(#[from] SourceError),

    #[error(transparent)]
    Batch(#[from] BatchError),
}
