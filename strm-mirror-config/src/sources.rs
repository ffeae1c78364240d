//! Raw configuration layers before resolution.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::util::{parse_csv, split_command};

/// Raw configuration as written in a TOML (or JSON) file. Every field is
/// optional; defaults are applied when the configuration is resolved.
#[derive(Debug, Default, Clone, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub struct FileConfig {
    /// Root of the tree being mirrored (alias `src_dir`).
    #[serde(alias = "src_dir", skip_serializing_if = "Option::is_none")]
    pub source_root: Option<PathBuf>,
    /// Root of the mirror (alias `dst_dir`).
    #[serde(alias = "dst_dir", skip_serializing_if = "Option::is_none")]
    pub dest_root: Option<PathBuf>,
    /// Mirrored extension, `strm` when unset.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub extension: Option<String>,
    /// Event debouncing.
    #[serde(default)]
    pub watch: FileWatchConfig,
    /// Scheduled full reconciliation.
    #[serde(default)]
    pub full_sync: FileFullSyncConfig,
    /// Remote refresh job.
    #[serde(default)]
    pub refresh: FileRefreshConfig,
    /// Graceful shutdown.
    #[serde(default)]
    pub shutdown: FileShutdownConfig,
    /// Identifier extraction.
    #[serde(default)]
    pub identifier: FileIdentifierConfig,
}

/// `[watch]` table.
#[derive(Debug, Default, Clone, Deserialize, Serialize)]
pub struct FileWatchConfig {
    /// Humantime duration, for example `2s`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub debounce: Option<String>,
}

/// `[full_sync]` table.
#[derive(Debug, Default, Clone, Deserialize, Serialize)]
pub struct FileFullSyncConfig {
    /// Humantime duration.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub interval: Option<String>,
    /// Humantime duration used after a failed full sync.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_interval: Option<String>,
    /// Failed batches before a path is quarantined.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_path_retries: Option<u32>,
}

/// `[refresh]` table.
#[derive(Debug, Default, Clone, Deserialize, Serialize)]
pub struct FileRefreshConfig {
    /// Humantime duration.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub interval: Option<String>,
    /// Humantime duration.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout: Option<String>,
    /// Program followed by its arguments.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub command: Option<Vec<String>>,
}

/// `[shutdown]` table.
#[derive(Debug, Default, Clone, Deserialize, Serialize)]
pub struct FileShutdownConfig {
    /// Humantime duration.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout: Option<String>,
}

/// `[identifier]` table.
#[derive(Debug, Default, Clone, Deserialize, Serialize)]
pub struct FileIdentifierConfig {
    /// Identifiers returned verbatim.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exceptions: Option<Vec<String>>,
    /// Regexes stripped before matching.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ignored_patterns: Option<Vec<String>>,
}

/// Variable naming the config file; the `STRM_MIRROR_*` constants below
/// override the matching file field.
pub const ENV_CONFIG_PATH: &str = "STRM_MIRROR_CONFIG";
/// Overrides `source_root`.
pub const ENV_SOURCE_ROOT: &str = "STRM_MIRROR_SOURCE_ROOT";
/// Overrides `dest_root`.
pub const ENV_DEST_ROOT: &str = "STRM_MIRROR_DEST_ROOT";
/// Overrides `extension`.
pub const ENV_EXTENSION: &str = "STRM_MIRROR_EXTENSION";
/// Overrides `watch.debounce`.
pub const ENV_DEBOUNCE: &str = "STRM_MIRROR_DEBOUNCE";
/// Overrides `full_sync.interval`.
pub const ENV_FULL_SYNC_INTERVAL: &str = "STRM_MIRROR_FULL_SYNC_INTERVAL";
/// Overrides `full_sync.retry_interval`.
pub const ENV_FULL_SYNC_RETRY: &str = "STRM_MIRROR_FULL_SYNC_RETRY";
/// Overrides `full_sync.max_path_retries`.
pub const ENV_MAX_PATH_RETRIES: &str = "STRM_MIRROR_MAX_PATH_RETRIES";
/// Overrides `refresh.interval`.
pub const ENV_REFRESH_INTERVAL: &str = "STRM_MIRROR_REFRESH_INTERVAL";
/// Overrides `refresh.timeout`.
pub const ENV_REFRESH_TIMEOUT: &str = "STRM_MIRROR_REFRESH_TIMEOUT";
/// Overrides `refresh.command`, split on whitespace.
pub const ENV_REFRESH_COMMAND: &str = "STRM_MIRROR_REFRESH_COMMAND";
/// Overrides `shutdown.timeout`.
pub const ENV_SHUTDOWN_TIMEOUT: &str = "STRM_MIRROR_SHUTDOWN_TIMEOUT";
/// Overrides `identifier.exceptions`, comma separated.
pub const ENV_IDENTIFIER_EXCEPTIONS: &str = "STRM_MIRROR_IDENTIFIER_EXCEPTIONS";

/// Environment-derived values. Durations and numbers stay raw here so the
/// resolver can report which variable was malformed.
#[derive(Debug, Default, Clone)]
pub struct EnvConfig {
    /// [`ENV_CONFIG_PATH`]
    pub config_path: Option<PathBuf>,
    /// [`ENV_SOURCE_ROOT`]
    pub source_root: Option<PathBuf>,
    /// [`ENV_DEST_ROOT`]
    pub dest_root: Option<PathBuf>,
    /// [`ENV_EXTENSION`]
    pub extension: Option<String>,
    /// [`ENV_DEBOUNCE`]
    pub debounce: Option<String>,
    /// [`ENV_FULL_SYNC_INTERVAL`]
    pub full_sync_interval: Option<String>,
    /// [`ENV_FULL_SYNC_RETRY`]
    pub full_sync_retry: Option<String>,
    /// [`ENV_MAX_PATH_RETRIES`]
    pub max_path_retries: Option<String>,
    /// [`ENV_REFRESH_INTERVAL`]
    pub refresh_interval: Option<String>,
    /// [`ENV_REFRESH_TIMEOUT`]
    pub refresh_timeout: Option<String>,
    /// [`ENV_REFRESH_COMMAND`]
    pub refresh_command: Option<Vec<String>>,
    /// [`ENV_SHUTDOWN_TIMEOUT`]
    pub shutdown_timeout: Option<String>,
    /// [`ENV_IDENTIFIER_EXCEPTIONS`]
    pub identifier_exceptions: Option<Vec<String>>,
}

impl EnvConfig {
    /// Collect values through `lookup`; blank values count as unset.
    pub fn gather_with<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |name: &str| lookup(name).filter(|value| !value.trim().is_empty());

        Self {
            config_path: var(ENV_CONFIG_PATH).map(PathBuf::from),
            source_root: var(ENV_SOURCE_ROOT).map(PathBuf::from),
            dest_root: var(ENV_DEST_ROOT).map(PathBuf::from),
            extension: var(ENV_EXTENSION),
            debounce: var(ENV_DEBOUNCE),
            full_sync_interval: var(ENV_FULL_SYNC_INTERVAL),
            full_sync_retry: var(ENV_FULL_SYNC_RETRY),
            max_path_retries: var(ENV_MAX_PATH_RETRIES),
            refresh_interval: var(ENV_REFRESH_INTERVAL),
            refresh_timeout: var(ENV_REFRESH_TIMEOUT),
            refresh_command: var(ENV_REFRESH_COMMAND).map(|raw| split_command(&raw)),
            shutdown_timeout: var(ENV_SHUTDOWN_TIMEOUT),
            identifier_exceptions: var(ENV_IDENTIFIER_EXCEPTIONS).map(|raw| parse_csv(&raw)),
        }
    }

    /// Collect values from the process environment.
    pub fn gather() -> Self {
        Self::gather_with(|name| std::env::var(name).ok())
    }
}
