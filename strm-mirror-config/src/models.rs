//! Resolved configuration and its conversions into core types.

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use humantime::format_duration;
use strm_mirror_core::{
    CatalogIdExtractor, CommandRefreshJob, NoopRefreshJob, ReconcileSettings, RefreshJob,
};

/// Where the configuration file came from.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ConfigSource {
    /// No file; environment and defaults only.
    #[default]
    Defaults,
    /// Passed explicitly (`--config`).
    Explicit(PathBuf),
    /// Named by `$STRM_MIRROR_CONFIG`.
    EnvPath(PathBuf),
    /// Found among the default locations.
    File(PathBuf),
}

impl ConfigSource {
    /// The file that was read, if any.
    pub fn path(&self) -> Option<&PathBuf> {
        match self {
            ConfigSource::Defaults => None,
            ConfigSource::Explicit(path) | ConfigSource::EnvPath(path) | ConfigSource::File(path) => {
                Some(path)
            }
        }
    }
}

/// How the configuration was assembled.
#[derive(Debug, Clone, Default)]
pub struct ConfigMetadata {
    /// Origin of the file layer.
    pub source: ConfigSource,
    /// Whether a `.env` file was found and applied.
    pub env_file_loaded: bool,
}

/// Remote refresh job settings.
#[derive(Debug, Clone)]
pub struct RefreshConfig {
    /// Start-to-start cadence.
    pub interval: Duration,
    /// Upper bound on one run of the command.
    pub timeout: Duration,
    /// Program followed by its arguments; empty disables the job.
    pub command: Vec<String>,
}

/// Catalog identifier extraction settings.
#[derive(Debug, Clone, Default)]
pub struct IdentifierConfig {
    /// Identifiers returned verbatim when they occur in a name.
    pub exceptions: Vec<String>,
    /// Regexes stripped from a name before matching.
    pub ignored_patterns: Vec<String>,
}

/// Fully resolved configuration.
#[derive(Debug, Clone)]
pub struct MirrorConfig {
    /// Absolute root of the tree being mirrored.
    pub source_root: PathBuf,
    /// Absolute root of the mirror.
    pub dest_root: PathBuf,
    /// Normalised: no leading dot, lower-case.
    pub extension: String,
    /// Quiet period before an incremental batch.
    pub debounce_window: Duration,
    /// Cadence of scheduled full syncs.
    pub full_sync_interval: Duration,
    /// Cadence after a failed or inconclusive full sync.
    pub full_sync_retry_interval: Duration,
    /// Failed batches before a path is quarantined; `0` never gives up.
    pub max_path_retries: u32,
    /// Remote refresh job.
    pub refresh: RefreshConfig,
    /// How long shutdown waits for each loop.
    pub shutdown_timeout: Duration,
    /// Identifier extraction.
    pub identifier: IdentifierConfig,
    /// Where the values came from.
    pub metadata: ConfigMetadata,
}

impl MirrorConfig {
    /// Settings for the reconciliation loop.
    pub fn reconcile_settings(&self) -> ReconcileSettings {
        ReconcileSettings {
            debounce_window: self.debounce_window,
            full_sync_interval: self.full_sync_interval,
            full_sync_retry_interval: self.full_sync_retry_interval,
            max_path_retries: self.max_path_retries,
        }
    }

    /// Extractor honouring the configured exceptions and ignored patterns.
    pub fn identifier_extractor(&self) -> strm_mirror_core::Result<CatalogIdExtractor> {
        CatalogIdExtractor::new(
            self.identifier.exceptions.clone(),
            &self.identifier.ignored_patterns,
        )
    }

    /// The configured command, or a no-op job when none is set.
    pub fn refresh_job(&self) -> Arc<dyn RefreshJob> {
        match CommandRefreshJob::from_command_line(&self.refresh.command, self.refresh.timeout) {
            Some(job) => Arc::new(job),
            None => Arc::new(NoopRefreshJob),
        }
    }
}

impl fmt::Display for MirrorConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let source = match self.metadata.source.path() {
            Some(path) => path.display().to_string(),
            None => "<environment and defaults>".to_string(),
        };
        let command = if self.refresh.command.is_empty() {
            "<none>".to_string()
        } else {
            self.refresh.command.join(" ")
        };

        writeln!(f, "config file:             {source}")?;
        writeln!(f, "source root:             {}", self.source_root.display())?;
        writeln!(f, "destination root:        {}", self.dest_root.display())?;
        writeln!(f, "extension:               .{}", self.extension)?;
        writeln!(f, "debounce:                {}", format_duration(self.debounce_window))?;
        writeln!(f, "full sync interval:      {}", format_duration(self.full_sync_interval))?;
        writeln!(
            f,
            "full sync retry:         {}",
            format_duration(self.full_sync_retry_interval)
        )?;
        writeln!(f, "max path retries:        {}", self.max_path_retries)?;
        writeln!(f, "refresh interval:        {}", format_duration(self.refresh.interval))?;
        writeln!(f, "refresh timeout:         {}", format_duration(self.refresh.timeout))?;
        writeln!(f, "refresh command:         {command}")?;
        writeln!(f, "shutdown timeout:        {}", format_duration(self.shutdown_timeout))?;
        writeln!(
            f,
            "identifier exceptions:   {}",
            self.identifier.exceptions.len()
        )?;
        write!(
            f,
            "ignored patterns:        {}",
            self.identifier.ignored_patterns.len()
        )
    }
}
