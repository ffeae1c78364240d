//! Pure source → mirror path mapping.
//!
//! `root/catA/catB/NAME.strm` maps to `dest/catA/catB/<identifier>/NAME.strm`:
//! the relative directory and filename are preserved and exactly one directory
//! level named by the canonical identifier is inserted. No filesystem I/O
//! happens here, so the source path does not need to exist.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{debug, warn};

use crate::identifier::IdentifierExtractor;
use crate::settings::normalize_extension;

/// Maps placeholder files between the source tree and the mirror tree.
#[derive(Clone)]
pub struct MirrorMapper {
    source_root: PathBuf,
    dest_root: PathBuf,
    extension: String,
    extractor: Arc<dyn IdentifierExtractor>,
}

impl fmt::Debug for MirrorMapper {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MirrorMapper")
            .field("source_root", &self.source_root)
            .field("dest_root", &self.dest_root)
            .field("extension", &self.extension)
            .finish()
    }
}

impl MirrorMapper {
    /// Mapper between the two roots for files with `extension` (leading dot
    /// and case ignored).
    pub fn new(
        source_root: impl Into<PathBuf>,
        dest_root: impl Into<PathBuf>,
        extension: &str,
        extractor: Arc<dyn IdentifierExtractor>,
    ) -> Self {
        Self {
            source_root: source_root.into(),
            dest_root: dest_root.into(),
            extension: normalize_extension(extension),
            extractor,
        }
    }

    /// Root of the tree being mirrored.
    pub fn source_root(&self) -> &Path {
        &self.source_root
    }

    /// Root of the mirror.
    pub fn dest_root(&self) -> &Path {
        &self.dest_root
    }

    /// Whether `path` carries the mirrored extension (case-insensitive).
    pub fn has_mirrored_extension(&self, path: &Path) -> bool {
        has_extension(path, &self.extension)
    }

    /// Destination of `source` in the mirror, or `None` when the file is not
    /// eligible (wrong extension, outside the source root, or no identifier).
    pub fn map_path(&self, source: &Path) -> Option<PathBuf> {
        if !self.has_mirrored_extension(source) {
            debug!(target: "mirror::sync", path = %source.display(), "extension not mirrored");
            return None;
        }

        let Ok(relative) = source.strip_prefix(&self.source_root) else {
            debug!(
                target: "mirror::sync",
                path = %source.display(),
                root = %self.source_root.display(),
                "path is outside the source root"
            );
            return None;
        };

        let name = source.file_name()?;
        let identifier = self.extractor.extract(&name.to_string_lossy());
        if identifier.is_empty() {
            warn!(
                target: "mirror::sync",
                path = %relative.display(),
                "failed to extract identifier, skipping"
            );
            return None;
        }

        let mut dest = self.dest_root.clone();
        if let Some(parent) = relative.parent().filter(|p| !p.as_os_str().is_empty()) {
            dest.push(parent);
        }
        dest.push(identifier);
        dest.push(name);
        Some(dest)
    }

    /// Inverse of [`MirrorMapper::map_path`]: recover the source path a
    /// mirrored file was produced from by dropping the identifier directory.
    ///
    /// Returns `None` for paths outside the mirror root and for files that sit
    /// directly in it (no identifier level to strip). The result is only a
    /// candidate; callers confirm it by mapping forward again.
    pub fn source_for_mirror(&self, mirrored: &Path) -> Option<PathBuf> {
        let relative = mirrored.strip_prefix(&self.dest_root).ok()?;
        let name = relative.file_name()?;
        let identifier_dir = relative.parent()?;
        if identifier_dir.as_os_str().is_empty() {
            return None;
        }
        let category_dir = identifier_dir.parent()?;

        let mut source = self.source_root.clone();
        if !category_dir.as_os_str().is_empty() {
            source.push(category_dir);
        }
        source.push(name);
        Some(source)
    }
}

pub(crate) fn has_extension(path: &Path, extension: &str) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| ext.eq_ignore_ascii_case(extension))
}
