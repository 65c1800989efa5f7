//! CLI command implementations.

pub mod inspect;
pub mod prune;
pub mod seed;
pub mod sync;
pub mod token;

use thiserror::Error;

/// Usage errors reported before a command touches any file.
#[derive(Debug, Error)]
pub enum CliError {
    /// The command needs `--path`.
    #[error("snapshot path required for {0}")]
    PathRequired(&'static str),

    /// `--format` named an unknown format.
    #[error("unknown output format: {0}")]
    UnknownFormat(String),

    /// The server snapshot is the local snapshot.
    #[error("remote snapshot must differ from the local snapshot")]
    SameSnapshot,

    /// Page sizes must be positive.
    #[error("page size must be at least 1")]
    EmptyPage,
}
