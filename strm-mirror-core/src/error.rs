//! Error type shared by the mirror engine.

use std::fmt;
use std::path::PathBuf;

use thiserror::Error;

/// Which configured root a structural error refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RootRole {
    /// The tree being mirrored.
    Source,
    /// The derived mirror tree.
    Destination,
}

impl fmt::Display for RootRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RootRole::Source => f.write_str("source"),
            RootRole::Destination => f.write_str("destination"),
        }
    }
}

/// Errors raised by the mirror engine.
#[derive(Error, Debug)]
pub enum MirrorError {
    /// Filesystem failure on a single path.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// A configured root is missing or not a directory.
    #[error("{role} root {} is missing or not a directory", path.display())]
    InvalidRoot { role: RootRole, path: PathBuf },

    /// The `notify` backend could not be set up.
    #[error("Watch error: {0}")]
    Watch(#[from] notify::Error),

    /// A refresh run failed to spawn, timed out or exited unsuccessfully.
    #[error("Refresh job '{job}' failed: {reason}")]
    Refresh { job: String, reason: String },

    /// An identifier pattern did not compile.
    #[error("Invalid identifier pattern: {0}")]
    Pattern(#[from] regex::Error),

    /// A blocking task could not be joined.
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result alias for the mirror engine.
pub type Result<T> = std::result::Result<T, MirrorError>;
