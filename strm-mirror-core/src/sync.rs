//! Filesystem side of the mirror: copy, delete, prune and full reconciliation.

use std::fmt;
use std::fs;
use std::io;
use std::ops::AddAssign;
use std::path::{Path, PathBuf};
use std::time::Instant;

use filetime::FileTime;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::error::{MirrorError, Result, RootRole};
use crate::mapper::MirrorMapper;

/// Counters for a single run (one full sync or one incremental batch).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncCounters {
    /// Mirror files written.
    pub updated: u64,
    /// Mirror files already at least as new as their source.
    pub skipped: u64,
    /// Mirror files removed.
    pub deleted: u64,
    /// Directories pruned after becoming empty.
    pub dirs_deleted: u64,
    /// Per-file failures that were logged and isolated inside a full sync.
    pub failed: u64,
}

impl AddAssign for SyncCounters {
    fn add_assign(&mut self, rhs: Self) {
        self.updated += rhs.updated;
        self.skipped += rhs.skipped;
        self.deleted += rhs.deleted;
        self.dirs_deleted += rhs.dirs_deleted;
        self.failed += rhs.failed;
    }
}

impl fmt::Display for SyncCounters {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "updated={} skipped={} deleted={} dirs_deleted={} failed={}",
            self.updated, self.skipped, self.deleted, self.dirs_deleted, self.failed
        )
    }
}

/// Operations the reconciliation loop drives. All of them block on disk I/O
/// and are meant to be called from a blocking context.
pub trait MirrorSync: Send + Sync + 'static {
    /// Bring the mirror copy of `source` up to date.
    fn update_one(&self, source: &Path, counters: &mut SyncCounters) -> Result<()>;

    /// Remove the mirror copy of `source` and any directories left empty.
    fn delete_one(&self, source: &Path, counters: &mut SyncCounters) -> Result<()>;

    /// Authoritative reconciliation of the whole tree. Fails only when a root
    /// is missing or not a directory.
    fn full_sync(&self) -> Result<SyncCounters>;
}

/// [`MirrorSync`] backed by the real filesystem.
#[derive(Debug, Clone)]
pub struct SyncExecutor {
    mapper: MirrorMapper,
}

impl SyncExecutor {
    /// Executor writing where `mapper` says.
    pub fn new(mapper: MirrorMapper) -> Self {
        Self { mapper }
    }

    fn check_roots(&self) -> Result<()> {
        if !self.mapper.source_root().is_dir() {
            return Err(MirrorError::InvalidRoot {
                role: RootRole::Source,
                path: self.mapper.source_root().to_path_buf(),
            });
        }
        if !self.mapper.dest_root().is_dir() {
            return Err(MirrorError::InvalidRoot {
                role: RootRole::Destination,
                path: self.mapper.dest_root().to_path_buf(),
            });
        }
        Ok(())
    }

    /// Remove one mirrored file, then prune its now-empty ancestors.
    fn remove_mirrored(&self, dest: &Path, counters: &mut SyncCounters) -> Result<()> {
        match fs::remove_file(dest) {
            Ok(()) => {
                counters.deleted += 1;
                info!(target: "mirror::sync", path = %dest.display(), "removed mirrored file");
            }
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(()),
            Err(err) => return Err(err.into()),
        }

        match dest.parent() {
            Some(parent) => self.prune_upward(parent, counters),
            None => Ok(()),
        }
    }

    /// Walk up from `start`, removing empty directories. Stops at the first
    /// non-empty directory and never touches `dest_root` or anything outside it.
    fn prune_upward(&self, start: &Path, counters: &mut SyncCounters) -> Result<()> {
        let root = self.mapper.dest_root();
        let mut current = start;

        while current != root && current.starts_with(root) {
            match fs::remove_dir(current) {
                Ok(()) => {
                    counters.dirs_deleted += 1;
                    debug!(target: "mirror::sync", dir = %current.display(), "pruned empty directory");
                }
                Err(err) if err.kind() == io::ErrorKind::DirectoryNotEmpty => break,
                Err(err) if err.kind() == io::ErrorKind::NotFound => {}
                Err(err) => return Err(err.into()),
            }

            match current.parent() {
                Some(parent) => current = parent,
                None => break,
            }
        }
        Ok(())
    }

    fn mirror_source_tree(&self, counters: &mut SyncCounters) {
        for entry in WalkDir::new(self.mapper.source_root()).follow_links(false) {
            let entry = match entry {
                Ok(entry) => entry,
                Err(err) => {
                    warn!(target: "mirror::sync", error = %err, "failed to read source entry");
                    counters.failed += 1;
                    continue;
                }
            };

            if !entry.file_type().is_file() || !self.mapper.has_mirrored_extension(entry.path()) {
                continue;
            }

            if let Err(err) = self.update_one(entry.path(), counters) {
                warn!(
                    target: "mirror::sync",
                    path = %entry.path().display(),
                    error = %err,
                    "failed to mirror file"
                );
                counters.failed += 1;
            }
        }
    }

    /// A mirrored file is kept only when its recovered source exists and maps
    /// forward to exactly this path.
    fn is_orphan(&self, mirrored: &Path) -> bool {
        match self.mapper.source_for_mirror(mirrored) {
            Some(source) => {
                !source.is_file() || self.mapper.map_path(&source).as_deref() != Some(mirrored)
            }
            None => true,
        }
    }

    fn remove_orphans(&self, counters: &mut SyncCounters) {
        let mut orphans: Vec<PathBuf> = Vec::new();
        for entry in WalkDir::new(self.mapper.dest_root()).follow_links(false) {
            let entry = match entry {
                Ok(entry) => entry,
                Err(err) => {
                    warn!(target: "mirror::sync", error = %err, "failed to read mirror entry");
                    counters.failed += 1;
                    continue;
                }
            };

            if entry.file_type().is_file()
                && self.mapper.has_mirrored_extension(entry.path())
                && self.is_orphan(entry.path())
            {
                orphans.push(entry.into_path());
            }
        }

        for orphan in orphans {
            if let Err(err) = self.remove_mirrored(&orphan, counters) {
                warn!(
                    target: "mirror::sync",
                    path = %orphan.display(),
                    error = %err,
                    "failed to remove orphaned mirror file"
                );
                counters.failed += 1;
            }
        }
    }

    fn prune_empty_dirs(&self, counters: &mut SyncCounters) {
        let walker = WalkDir::new(self.mapper.dest_root())
            .follow_links(false)
            .min_depth(1)
            .contents_first(true);

        for entry in walker {
            let Ok(entry) = entry else { continue };
            if !entry.file_type().is_dir() {
                continue;
            }
            match fs::remove_dir(entry.path()) {
                Ok(()) => counters.dirs_deleted += 1,
                Err(err)
                    if matches!(
                        err.kind(),
                        io::ErrorKind::DirectoryNotEmpty | io::ErrorKind::NotFound
                    ) => {}
                Err(err) => {
                    warn!(
                        target: "mirror::sync",
                        dir = %entry.path().display(),
                        error = %err,
                        "failed to prune directory"
                    );
                    counters.failed += 1;
                }
            }
        }
    }
}

impl MirrorSync for SyncExecutor {
    fn update_one(&self, source: &Path, counters: &mut SyncCounters) -> Result<()> {
        let Some(dest) = self.mapper.map_path(source) else {
            return Ok(());
        };

        let source_meta = match fs::metadata(source) {
            Ok(meta) => meta,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                debug!(target: "mirror::sync", path = %source.display(), "source vanished before update");
                return Ok(());
            }
            Err(err) => return Err(err.into()),
        };
        if !source_meta.is_file() {
            return Ok(());
        }
        let source_mtime = FileTime::from_last_modification_time(&source_meta);

        match fs::metadata(&dest) {
            Ok(dest_meta) if FileTime::from_last_modification_time(&dest_meta) >= source_mtime => {
                counters.skipped += 1;
                debug!(target: "mirror::sync", path = %dest.display(), "mirror up to date");
                return Ok(());
            }
            Ok(_) => {}
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => return Err(err.into()),
        }

        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent)?;
        }

        match fs::copy(source, &dest) {
            Ok(_) => {}
            Err(err) if err.kind() == io::ErrorKind::NotFound && !source.exists() => {
                debug!(target: "mirror::sync", path = %source.display(), "source vanished during copy");
                return Ok(());
            }
            Err(err) => return Err(err.into()),
        }
        filetime::set_file_times(
            &dest,
            FileTime::from_last_access_time(&source_meta),
            source_mtime,
        )?;

        counters.updated += 1;
        info!(
            target: "mirror::sync",
            source = %source.display(),
            dest = %dest.display(),
            "mirrored file"
        );
        Ok(())
    }

    fn delete_one(&self, source: &Path, counters: &mut SyncCounters) -> Result<()> {
        match self.mapper.map_path(source) {
            Some(dest) => self.remove_mirrored(&dest, counters),
            None => Ok(()),
        }
    }

    fn full_sync(&self) -> Result<SyncCounters> {
        self.check_roots()?;

        let started = Instant::now();
        let mut counters = SyncCounters::default();

        self.mirror_source_tree(&mut counters);
        self.remove_orphans(&mut counters);
        self.prune_empty_dirs(&mut counters);

        info!(
            target: "mirror::sync",
            updated = counters.updated,
            skipped = counters.skipped,
            deleted = counters.deleted,
            dirs_deleted = counters.dirs_deleted,
            failed = counters.failed,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "full sync finished"
        );
        Ok(counters)
    }
}
