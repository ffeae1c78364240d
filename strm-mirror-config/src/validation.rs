//! Guard rails applied to a resolved configuration.

use std::fs;
use std::path::{Path, PathBuf};

use strm_mirror_core::{CatalogIdExtractor, RootRole};
use thiserror::Error;

use crate::models::MirrorConfig;

/// A configuration the daemon cannot run with.
#[derive(Debug, Error)]
pub enum ConfigGuardRailError {
    /// A root is missing, not a directory, or unresolvable.
    #[error("{role} root {} {reason}", path.display())]
    InvalidRoot {
        role: RootRole,
        path: PathBuf,
        reason: &'static str,
    },
    /// One root lies inside the other.
    #[error(
        "source root {} and destination root {} must not contain each other",
        source_root.display(),
        dest_root.display()
    )]
    OverlappingRoots {
        source_root: PathBuf,
        dest_root: PathBuf,
    },
    /// An interval or timeout is zero.
    #[error("`{field}` must be greater than zero")]
    ZeroInterval { field: &'static str },
    /// The mirrored extension is empty.
    #[error("mirrored extension must not be empty")]
    EmptyExtension,
    /// An identifier pattern does not compile.
    #[error("invalid identifier configuration: {reason}")]
    InvalidIdentifier { reason: String },
}

/// A non-fatal finding.
#[derive(Debug, Clone)]
pub struct ConfigWarning {
    /// What is off.
    pub message: String,
    /// How to fix it, when there is an obvious fix.
    pub hint: Option<String>,
}

/// Warnings collected during a load, in discovery order.
#[derive(Debug, Default, Clone)]
pub struct ConfigWarnings {
    /// The warnings.
    pub items: Vec<ConfigWarning>,
}

impl ConfigWarnings {
    /// Add a warning without a hint.
    pub fn push<S: Into<String>>(&mut self, message: S) {
        self.items.push(ConfigWarning {
            message: message.into(),
            hint: None,
        });
    }

    /// Add a warning with a hint.
    pub fn push_with_hint<S: Into<String>, H: Into<String>>(&mut self, message: S, hint: H) {
        self.items.push(ConfigWarning {
            message: message.into(),
            hint: Some(hint.into()),
        });
    }

    /// No warnings.
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Append `other`.
    pub fn extend(&mut self, other: ConfigWarnings) {
        self.items.extend(other.items);
    }

    /// Any message contains `needle`.
    pub fn contains(&self, needle: &str) -> bool {
        self.items.iter().any(|item| item.message.contains(needle))
    }
}

/// Root checks that must pass before anything is created on disk. The
/// destination may still be missing; its overlap with the source is judged
/// from the nearest existing ancestor.
pub fn check_roots(config: &MirrorConfig) -> Result<(), ConfigGuardRailError> {
    if config.extension.is_empty() {
        return Err(ConfigGuardRailError::EmptyExtension);
    }

    let source_root = existing_dir(RootRole::Source, &config.source_root)?;
    let dest_root = if config.dest_root.exists() {
        existing_dir(RootRole::Destination, &config.dest_root)?
    } else {
        resolve_missing(&config.dest_root)
    };
    if source_root.starts_with(&dest_root) || dest_root.starts_with(&source_root) {
        return Err(ConfigGuardRailError::OverlappingRoots {
            source_root,
            dest_root,
        });
    }
    Ok(())
}

/// Semantic checks on a resolved configuration. Expects `dest_root` to have
/// been created already.
pub fn apply_guard_rails(config: &MirrorConfig) -> Result<ConfigWarnings, ConfigGuardRailError> {
    let mut warnings = ConfigWarnings::default();

    check_roots(config)?;
    existing_dir(RootRole::Destination, &config.dest_root)?;

    for (field, value) in [
        ("full_sync.interval", config.full_sync_interval),
        ("full_sync.retry_interval", config.full_sync_retry_interval),
        ("refresh.interval", config.refresh.interval),
        ("refresh.timeout", config.refresh.timeout),
        ("shutdown.timeout", config.shutdown_timeout),
    ] {
        if value.is_zero() {
            return Err(ConfigGuardRailError::ZeroInterval { field });
        }
    }

    CatalogIdExtractor::new(
        config.identifier.exceptions.clone(),
        &config.identifier.ignored_patterns,
    )
    .map_err(|err| ConfigGuardRailError::InvalidIdentifier {
        reason: err.to_string(),
    })?;

    if config.debounce_window.is_zero() {
        warnings.push_with_hint(
            "watch.debounce is zero; every event burst triggers its own batch",
            "Use at least a second or two so copy-then-rename writers settle",
        );
    }

    if config.full_sync_retry_interval > config.full_sync_interval {
        warnings.push(
            "full_sync.retry_interval is longer than full_sync.interval; failed full syncs retry later than scheduled ones",
        );
    }

    if config.refresh.command.is_empty() {
        warnings.push_with_hint(
            "No refresh command configured; the refresh loop will idle",
            "Set refresh.command or STRM_MIRROR_REFRESH_COMMAND",
        );
    }

    Ok(warnings)
}

fn existing_dir(role: RootRole, path: &Path) -> Result<PathBuf, ConfigGuardRailError> {
    let invalid = |reason| ConfigGuardRailError::InvalidRoot {
        role,
        path: path.to_path_buf(),
        reason,
    };

    let metadata = fs::metadata(path).map_err(|_| invalid("does not exist"))?;
    if !metadata.is_dir() {
        return Err(invalid("is not a directory"));
    }
    fs::canonicalize(path).map_err(|_| invalid("cannot be resolved"))
}

/// Canonical form of a path that does not exist yet: the deepest existing
/// ancestor, canonicalized, with the missing components appended.
fn resolve_missing(path: &Path) -> PathBuf {
    let mut missing = Vec::new();
    let mut current = path;
    loop {
        if let Ok(resolved) = fs::canonicalize(current) {
            return missing
                .iter()
                .rev()
                .fold(resolved, |acc: PathBuf, part| acc.join(part));
        }
        match (current.parent(), current.file_name()) {
            (Some(parent), Some(name)) => {
                missing.push(name);
                current = parent;
            }
            _ => return path.to_path_buf(),
        }
    }
}
