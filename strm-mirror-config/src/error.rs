//! Errors that abort configuration loading.

use std::path::PathBuf;

use thiserror::Error;

use crate::validation::ConfigGuardRailError;

/// Why a configuration could not be loaded.
#[derive(Debug, Error)]
pub enum ConfigLoadError {
    /// An explicitly named config file does not exist.
    #[error("configuration file missing: {}", path.display())]
    MissingConfig { path: PathBuf },
    /// The config file exists but could not be read.
    #[error("failed to read configuration {}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    /// Malformed TOML.
    #[error("failed to parse configuration {}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    /// Malformed JSON.
    #[error("failed to parse configuration {}", path.display())]
    ParseJson {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    /// A root is set neither in the file nor in the environment.
    #[error("`{field}` is required (set it in the config file or via {env})")]
    MissingField {
        field: &'static str,
        env: &'static str,
    },
    /// A duration is not in humantime form (`2s`, `24h`, `1h 30m`).
    #[error("invalid duration for `{field}`: '{value}'")]
    InvalidDuration {
        field: &'static str,
        value: String,
        #[source]
        source: humantime::DurationError,
    },
    /// A count is not a non-negative integer.
    #[error("invalid number for `{field}`: '{value}'")]
    InvalidNumber { field: &'static str, value: String },
    /// Path normalisation or destination creation failed.
    #[error("filesystem initialization failed")]
    Filesystem { source: anyhow::Error },
    /// The resolved configuration was rejected.
    #[error(transparent)]
    GuardRail(#[from] ConfigGuardRailError),
    /// The `.env` file exists but is malformed.
    #[error(transparent)]
    EnvFile(#[from] dotenvy::Error),
}
