//! Change aggregation for the source tree.
//!
//! [`WatchSubscription`] wraps a `notify` watcher whose callback runs on the
//! backend's own thread. The callback only feeds [`ChangeAggregator`], which
//! keeps the pending `changed`/`deleted` sets and the event clock behind one
//! mutex and raises the trigger the reconciliation loop waits on. No
//! filesystem I/O happens here.

use std::collections::BTreeSet;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use notify::event::{CreateKind, EventKind, ModifyKind, RemoveKind, RenameMode};
use notify::{Config as NotifyConfig, Event, RecommendedWatcher, RecursiveMode, Watcher};
use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::mapper::has_extension;
use crate::settings::normalize_extension;

#[derive(Debug, Default)]
struct PendingState {
    changed: BTreeSet<PathBuf>,
    deleted: BTreeSet<PathBuf>,
    last_event: Option<Instant>,
    event_counter: u64,
}

impl PendingState {
    fn touch(&mut self) {
        self.last_event = Some(Instant::now());
        self.event_counter += 1;
    }

    fn is_empty(&self) -> bool {
        self.changed.is_empty() && self.deleted.is_empty()
    }
}

struct Inner {
    extension: String,
    state: Mutex<PendingState>,
    trigger: watch::Sender<bool>,
    rescan: AtomicBool,
}

/// Pending paths taken out of the aggregator for one incremental batch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PendingSnapshot {
    /// Paths created or modified since the previous snapshot.
    pub changed: Vec<PathBuf>,
    /// Paths removed since the previous snapshot.
    pub deleted: Vec<PathBuf>,
    /// Event counter at the moment the sets were taken.
    pub event_counter: u64,
}

impl PendingSnapshot {
    /// Nothing to apply.
    pub fn is_empty(&self) -> bool {
        self.changed.is_empty() && self.deleted.is_empty()
    }
}

/// Thread-safe producer side of the pending change set.
#[derive(Clone)]
pub struct ChangeAggregator {
    inner: Arc<Inner>,
}

impl fmt::Debug for ChangeAggregator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (changed, deleted) = self.pending_counts();
        f.debug_struct("ChangeAggregator")
            .field("extension", &self.inner.extension)
            .field("changed", &changed)
            .field("deleted", &deleted)
            .field("event_counter", &self.event_counter())
            .field("triggered", &self.is_triggered())
            .finish()
    }
}

impl ChangeAggregator {
    /// Empty aggregator accepting paths with `extension`.
    pub fn new(extension: &str) -> Self {
        let (trigger, _) = watch::channel(false);
        Self {
            inner: Arc::new(Inner {
                extension: normalize_extension(extension),
                state: Mutex::new(PendingState::default()),
                trigger,
                rescan: AtomicBool::new(false),
            }),
        }
    }

    fn accepts(&self, path: &Path) -> bool {
        has_extension(path, &self.inner.extension)
    }

    fn signal(&self) {
        self.inner.trigger.send_replace(true);
    }

    /// Mark `path` as created or modified.
    pub fn record_changed(&self, path: PathBuf) {
        let mut state = self.inner.state.lock();
        state.deleted.remove(&path);
        state.changed.insert(path);
        state.touch();
        self.signal();
    }

    /// Mark `path` as removed.
    pub fn record_deleted(&self, path: PathBuf) {
        let mut state = self.inner.state.lock();
        state.changed.remove(&path);
        state.deleted.insert(path);
        state.touch();
        self.signal();
    }

    /// Classify one raw notification. Renames become a delete of the old path
    /// followed by a create of the new one. Other paths without the mirrored
    /// extension are dropped.
    ///
    /// The backend reports a directory created, removed or moved as a single
    /// event on the directory itself, so those request a rescan to pick up
    /// the placeholders underneath.
    pub fn handle_event(&self, event: &Event) {
        if event.need_rescan() {
            warn!(target: "mirror::watch", "watch backend dropped events, requesting rescan");
            self.request_rescan();
        }

        match event.kind {
            EventKind::Create(CreateKind::Folder) | EventKind::Remove(RemoveKind::Folder) => {
                debug!(target: "mirror::watch", paths = ?event.paths, "directory event, requesting rescan");
                self.request_rescan();
            }
            EventKind::Modify(ModifyKind::Name(mode)) => self.handle_rename(mode, &event.paths),
            EventKind::Create(_) | EventKind::Modify(_) => {
                for path in &event.paths {
                    if self.accepts(path) {
                        self.record_changed(path.clone());
                    }
                }
            }
            EventKind::Remove(_) => {
                for path in &event.paths {
                    if self.accepts(path) {
                        self.record_deleted(path.clone());
                    }
                }
            }
            EventKind::Access(_) | EventKind::Any | EventKind::Other => {}
        }
    }

    fn handle_rename(&self, mode: RenameMode, paths: &[PathBuf]) {
        // May be a directory; its contents never get events of their own.
        if paths.iter().any(|path| !self.accepts(path)) {
            debug!(target: "mirror::watch", ?paths, "rename outside the mirrored extension, requesting rescan");
            self.request_rescan();
        }

        match (mode, paths) {
            (RenameMode::Both, [from, to, ..]) => {
                if self.accepts(from) {
                    self.record_deleted(from.clone());
                }
                if self.accepts(to) {
                    self.record_changed(to.clone());
                }
            }
            (RenameMode::From, _) => {
                for path in paths.iter().filter(|path| self.accepts(path)) {
                    self.record_deleted(path.clone());
                }
            }
            // Ambiguous renames are treated as changes; a vanished source
            // turns the update into a no-op and the next full sync removes
            // its mirror copy.
            _ => {
                for path in paths.iter().filter(|path| self.accepts(path)) {
                    self.record_changed(path.clone());
                }
            }
        }
    }

    /// Watch backend errors may mean lost events, so they escalate to a rescan.
    pub fn handle_error(&self, error: &notify::Error) {
        warn!(target: "mirror::watch", error = %error, "watch error, requesting rescan");
        self.request_rescan();
    }

    /// Ask the reconciliation loop for a full sync. Counts as an event so an
    /// in-flight scheduled full sync does not clear pending state.
    pub fn request_rescan(&self) {
        let mut state = self.inner.state.lock();
        self.inner.rescan.store(true, Ordering::SeqCst);
        state.touch();
        self.signal();
    }

    /// Consume a pending rescan request.
    pub fn take_rescan_request(&self) -> bool {
        self.inner.rescan.swap(false, Ordering::SeqCst)
    }

    /// Atomically take both pending sets and capture the event counter.
    pub fn snapshot_and_clear(&self) -> PendingSnapshot {
        let mut state = self.inner.state.lock();
        PendingSnapshot {
            changed: std::mem::take(&mut state.changed).into_iter().collect(),
            deleted: std::mem::take(&mut state.deleted).into_iter().collect(),
            event_counter: state.event_counter,
        }
    }

    /// Put failed paths back for the next debounce cycle. A path that was
    /// reclassified by a newer event while the batch ran keeps the newer
    /// classification.
    pub fn requeue(&self, changed: Vec<PathBuf>, deleted: Vec<PathBuf>) {
        if changed.is_empty() && deleted.is_empty() {
            return;
        }
        let mut state = self.inner.state.lock();
        for path in changed {
            if !state.deleted.contains(&path) {
                state.changed.insert(path);
            }
        }
        for path in deleted {
            if !state.changed.contains(&path) {
                state.deleted.insert(path);
            }
        }
        state.last_event = Some(Instant::now());
        self.signal();
    }

    /// After an incremental batch: clear the trigger when nothing arrived
    /// since `before` and nothing is pending. Returns whether it was cleared.
    pub fn settle(&self, before: u64) -> bool {
        let state = self.inner.state.lock();
        let quiet = state.event_counter == before
            && state.is_empty()
            && !self.inner.rescan.load(Ordering::SeqCst);
        if quiet {
            self.inner.trigger.send_replace(false);
        }
        quiet
    }

    /// After a successful scheduled full sync: drop pending state and the
    /// trigger if no event arrived since `before`. Returns whether it cleared.
    pub fn clear_if_unchanged(&self, before: u64) -> bool {
        let mut state = self.inner.state.lock();
        if state.event_counter != before {
            return false;
        }
        state.changed.clear();
        state.deleted.clear();
        self.inner.trigger.send_replace(false);
        true
    }

    /// Number of accepted events so far.
    pub fn event_counter(&self) -> u64 {
        self.inner.state.lock().event_counter
    }

    /// Time since the last accepted event, `None` before the first one.
    pub fn since_last_event(&self) -> Option<Duration> {
        self.inner.state.lock().last_event.map(|at| at.elapsed())
    }

    /// Whether work is pending for the reconciliation loop.
    pub fn is_triggered(&self) -> bool {
        *self.inner.trigger.borrow()
    }

    /// Resolves once the trigger is raised (immediately if it already is).
    pub async fn triggered(&self) {
        let mut rx = self.inner.trigger.subscribe();
        // The sender lives in `self`, so the channel cannot close here.
        let _ = rx.wait_for(|raised| *raised).await;
    }

    /// Whether `path` is pending as a change.
    pub fn contains_changed(&self, path: &Path) -> bool {
        self.inner.state.lock().changed.contains(path)
    }

    /// Whether `path` is pending as a deletion.
    pub fn contains_deleted(&self, path: &Path) -> bool {
        self.inner.state.lock().deleted.contains(path)
    }

    /// `(changed, deleted)` sizes.
    pub fn pending_counts(&self) -> (usize, usize) {
        let state = self.inner.state.lock();
        (state.changed.len(), state.deleted.len())
    }
}

/// Live recursive watch on the source root. Dropping it stops notifications.
pub struct WatchSubscription {
    root: PathBuf,
    _watcher: RecommendedWatcher,
}

impl fmt::Debug for WatchSubscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WatchSubscription")
            .field("root", &self.root)
            .finish_non_exhaustive()
    }
}

impl WatchSubscription {
    /// Watch `root` recursively, feeding every event into `aggregator`.
    pub fn start(root: &Path, aggregator: ChangeAggregator) -> Result<Self> {
        let handler = move |res: notify::Result<Event>| match res {
            Ok(event) => aggregator.handle_event(&event),
            Err(err) => aggregator.handle_error(&err),
        };

        let mut watcher = RecommendedWatcher::new(handler, NotifyConfig::default())?;
        watcher.watch(root, RecursiveMode::Recursive)?;
        info!(target: "mirror::watch", root = %root.display(), "watching source tree");

        Ok(Self {
            root: root.to_path_buf(),
            _watcher: watcher,
        })
    }
}

impl Drop for WatchSubscription {
    fn drop(&mut self) {
        debug!(target: "mirror::watch", root = %self.root.display(), "watch released");
    }
}
