//! Assembles a [`MirrorConfig`] from `.env`, a config file, the environment
//! and defaults.

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use strm_mirror_core::settings::{
    DEFAULT_DEBOUNCE_WINDOW, DEFAULT_FULL_SYNC_INTERVAL, DEFAULT_FULL_SYNC_RETRY_INTERVAL,
    DEFAULT_MAX_PATH_RETRIES, DEFAULT_MIRROR_EXTENSION, DEFAULT_REFRESH_INTERVAL,
    DEFAULT_REFRESH_TIMEOUT, DEFAULT_SHUTDOWN_TIMEOUT, normalize_extension,
};
use tracing::{debug, info};

use crate::error::ConfigLoadError;
use crate::models::{ConfigMetadata, ConfigSource, IdentifierConfig, MirrorConfig, RefreshConfig};
use crate::sources::{ENV_DEST_ROOT, ENV_SOURCE_ROOT, EnvConfig, FileConfig};
use crate::util::resolve_duration;
use crate::validation::{self, ConfigWarnings};

const DEFAULT_CONFIG_LOCATIONS: &[&str] = &[
    "strm-mirror.toml",
    "config/strm-mirror.toml",
    "data/config.toml",
];

type EnvLookup = Arc<dyn Fn(&str) -> Option<String> + Send + Sync>;

#[derive(Debug, Default, Clone)]
struct ConfigLoaderOptions {
    config_path: Option<PathBuf>,
    env_file: Option<PathBuf>,
    /// Directory the default config locations are resolved against; the
    /// working directory when unset.
    search_dir: Option<PathBuf>,
}

/// Resolved configuration plus the non-fatal findings about it.
#[derive(Debug, Clone)]
pub struct ConfigLoad {
    /// The resolved configuration.
    pub config: MirrorConfig,
    /// Findings that do not prevent running.
    pub warnings: ConfigWarnings,
}

/// Builder for one configuration load.
#[derive(Default)]
pub struct ConfigLoader {
    options: ConfigLoaderOptions,
    env: Option<EnvLookup>,
}

impl fmt::Debug for ConfigLoader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConfigLoader")
            .field("options", &self.options)
            .field("custom_env", &self.env.is_some())
            .finish()
    }
}

impl ConfigLoader {
    /// Loader using the working directory and the process environment.
    pub fn new() -> Self {
        Self::default()
    }

    /// Read this file instead of searching for one.
    pub fn with_config_path<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.options.config_path = Some(path.into());
        self
    }

    /// Load this `.env` file instead of `./.env`.
    pub fn with_env_file<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.options.env_file = Some(path.into());
        self
    }

    /// Resolve the default config locations against `dir`.
    pub fn with_search_dir<P: Into<PathBuf>>(mut self, dir: P) -> Self {
        self.options.search_dir = Some(dir.into());
        self
    }

    /// Read variables through `lookup` instead of the process environment.
    /// No `.env` file is loaded in that case.
    pub fn with_env_lookup<F>(mut self, lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String> + Send + Sync + 'static,
    {
        self.env = Some(Arc::new(lookup));
        self
    }

    /// Resolve, normalise and validate. Creates `dest_root` when missing,
    /// after the source root and root overlap checks pass.
    pub fn load(&self) -> Result<ConfigLoad, ConfigLoadError> {
        let env_file_loaded = match &self.env {
            Some(_) => false,
            None => self.load_env_file()?,
        };

        let env = match &self.env {
            Some(lookup) => EnvConfig::gather_with(|name| lookup(name)),
            None => EnvConfig::gather(),
        };

        let (file_config, source) = self.load_file_config(&env)?;

        let mut warnings = ConfigWarnings::default();
        if source == ConfigSource::Defaults {
            warnings.push_with_hint(
                "No strm-mirror.toml detected; using environment variables and defaults",
                "Pass --config or set STRM_MIRROR_CONFIG to point at a configuration file",
            );
        }

        let metadata = ConfigMetadata {
            source,
            env_file_loaded,
        };
        let mut config = resolve(file_config, env, metadata)?;

        normalize_paths(&mut config).map_err(|source| ConfigLoadError::Filesystem { source })?;
        validation::check_roots(&config)?;
        ensure_directories(&config).map_err(|source| ConfigLoadError::Filesystem { source })?;

        warnings.extend(validation::apply_guard_rails(&config)?);

        debug!(
            target: "mirror::config",
            source_root = %config.source_root.display(),
            dest_root = %config.dest_root.display(),
            warnings = warnings.items.len(),
            "configuration loaded"
        );
        Ok(ConfigLoad { config, warnings })
    }

    fn load_env_file(&self) -> Result<bool, ConfigLoadError> {
        let loaded = match &self.options.env_file {
            Some(path) => dotenvy::from_path(path).map(|_| true),
            None => dotenvy::dotenv().map(|_| true),
        };
        match loaded {
            Ok(loaded) => Ok(loaded),
            Err(dotenvy::Error::Io(_)) => Ok(false),
            Err(err) => Err(err.into()),
        }
    }

    fn load_file_config(
        &self,
        env: &EnvConfig,
    ) -> Result<(FileConfig, ConfigSource), ConfigLoadError> {
        let (path, source) = if let Some(explicit) = &self.options.config_path {
            (explicit.clone(), ConfigSource::Explicit(explicit.clone()))
        } else if let Some(from_env) = &env.config_path {
            (from_env.clone(), ConfigSource::EnvPath(from_env.clone()))
        } else if let Some(found) = self.find_default_file() {
            (found.clone(), ConfigSource::File(found))
        } else {
            return Ok((FileConfig::default(), ConfigSource::Defaults));
        };

        if !path.exists() {
            return Err(ConfigLoadError::MissingConfig { path });
        }

        let contents = fs::read_to_string(&path).map_err(|source| ConfigLoadError::Io {
            path: path.clone(),
            source,
        })?;
        let file_config = parse_file_config(&path, &contents)?;
        Ok((file_config, source))
    }

    fn find_default_file(&self) -> Option<PathBuf> {
        let base = self.options.search_dir.as_deref().unwrap_or(Path::new(""));
        DEFAULT_CONFIG_LOCATIONS
            .iter()
            .map(|candidate| base.join(candidate))
            .find(|path| path.is_file())
    }
}

fn parse_file_config(path: &Path, contents: &str) -> Result<FileConfig, ConfigLoadError> {
    match path.extension().and_then(|ext| ext.to_str()) {
        Some("json") => {
            serde_json::from_str(contents).map_err(|source| ConfigLoadError::ParseJson {
                path: path.to_path_buf(),
                source,
            })
        }
        _ => toml::from_str(contents).map_err(|source| ConfigLoadError::Parse {
            path: path.to_path_buf(),
            source,
        }),
    }
}

/// Environment values override file values; anything still unset takes its
/// default.
fn resolve(
    file: FileConfig,
    env: EnvConfig,
    metadata: ConfigMetadata,
) -> Result<MirrorConfig, ConfigLoadError> {
    let source_root = env
        .source_root
        .or(file.source_root)
        .ok_or(ConfigLoadError::MissingField {
            field: "source_root",
            env: ENV_SOURCE_ROOT,
        })?;
    let dest_root = env
        .dest_root
        .or(file.dest_root)
        .ok_or(ConfigLoadError::MissingField {
            field: "dest_root",
            env: ENV_DEST_ROOT,
        })?;

    let extension = normalize_extension(
        env.extension
            .as_deref()
            .or(file.extension.as_deref())
            .unwrap_or(DEFAULT_MIRROR_EXTENSION),
    );

    let debounce_window = resolve_duration(
        "watch.debounce",
        [env.debounce.as_deref(), file.watch.debounce.as_deref()],
        DEFAULT_DEBOUNCE_WINDOW,
    )?;
    let full_sync_interval = resolve_duration(
        "full_sync.interval",
        [
            env.full_sync_interval.as_deref(),
            file.full_sync.interval.as_deref(),
        ],
        DEFAULT_FULL_SYNC_INTERVAL,
    )?;
    let full_sync_retry_interval = resolve_duration(
        "full_sync.retry_interval",
        [
            env.full_sync_retry.as_deref(),
            file.full_sync.retry_interval.as_deref(),
        ],
        DEFAULT_FULL_SYNC_RETRY_INTERVAL,
    )?;
    let max_path_retries = match env.max_path_retries {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|_| ConfigLoadError::InvalidNumber {
                field: "full_sync.max_path_retries",
                value: raw.clone(),
            })?,
        None => file
            .full_sync
            .max_path_retries
            .unwrap_or(DEFAULT_MAX_PATH_RETRIES),
    };

    let refresh = RefreshConfig {
        interval: resolve_duration(
            "refresh.interval",
            [
                env.refresh_interval.as_deref(),
                file.refresh.interval.as_deref(),
            ],
            DEFAULT_REFRESH_INTERVAL,
        )?,
        timeout: resolve_duration(
            "refresh.timeout",
            [
                env.refresh_timeout.as_deref(),
                file.refresh.timeout.as_deref(),
            ],
            DEFAULT_REFRESH_TIMEOUT,
        )?,
        command: env
            .refresh_command
            .or(file.refresh.command)
            .unwrap_or_default(),
    };

    let shutdown_timeout = resolve_duration(
        "shutdown.timeout",
        [
            env.shutdown_timeout.as_deref(),
            file.shutdown.timeout.as_deref(),
        ],
        DEFAULT_SHUTDOWN_TIMEOUT,
    )?;

    let identifier = IdentifierConfig {
        exceptions: env
            .identifier_exceptions
            .or(file.identifier.exceptions)
            .unwrap_or_default(),
        ignored_patterns: file.identifier.ignored_patterns.unwrap_or_default(),
    };

    Ok(MirrorConfig {
        source_root,
        dest_root,
        extension,
        debounce_window,
        full_sync_interval,
        full_sync_retry_interval,
        max_path_retries,
        refresh,
        shutdown_timeout,
        identifier,
        metadata,
    })
}

fn normalize_paths(config: &mut MirrorConfig) -> anyhow::Result<()> {
    config.source_root = std::path::absolute(&config.source_root)
        .with_context(|| format!("failed to resolve {}", config.source_root.display()))?;
    config.dest_root = std::path::absolute(&config.dest_root)
        .with_context(|| format!("failed to resolve {}", config.dest_root.display()))?;
    Ok(())
}

fn ensure_directories(config: &MirrorConfig) -> anyhow::Result<()> {
    if !config.dest_root.exists() {
        fs::create_dir_all(&config.dest_root).with_context(|| {
            format!(
                "failed to create destination root {}",
                config.dest_root.display()
            )
        })?;
        info!(
            target: "mirror::config",
            dest_root = %config.dest_root.display(),
            "created destination root"
        );
    }
    Ok(())
}
