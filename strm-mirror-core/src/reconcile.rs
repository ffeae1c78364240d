//! Reconciliation state machine.
//!
//! One consumer task owns the schedule and drives [`MirrorSync`] from the
//! pending sets kept by [`ChangeAggregator`]. Disk work runs on the blocking
//! pool; the aggregator lock is never held across it.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio::task::spawn_blocking;
use tokio::time::{Instant, sleep, sleep_until};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::{MirrorError, Result};
use crate::settings::{
    DEFAULT_DEBOUNCE_WINDOW, DEFAULT_FULL_SYNC_INTERVAL, DEFAULT_FULL_SYNC_RETRY_INTERVAL,
    DEFAULT_MAX_PATH_RETRIES,
};
use crate::sync::{MirrorSync, SyncCounters};
use crate::watch::{ChangeAggregator, PendingSnapshot, WatchSubscription};

/// Timing knobs for the reconciliation loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconcileSettings {
    /// Quiet period after the last event before a batch runs.
    pub debounce_window: Duration,
    /// Cadence of scheduled full syncs.
    pub full_sync_interval: Duration,
    /// Cadence used after a failed or inconclusive full sync, and between
    /// startup attempts.
    pub full_sync_retry_interval: Duration,
    /// Consecutive failed batches before a path is quarantined. `0` retries
    /// forever.
    pub max_path_retries: u32,
}

impl Default for ReconcileSettings {
    fn default() -> Self {
        Self {
            debounce_window: DEFAULT_DEBOUNCE_WINDOW,
            full_sync_interval: DEFAULT_FULL_SYNC_INTERVAL,
            full_sync_retry_interval: DEFAULT_FULL_SYNC_RETRY_INTERVAL,
            max_path_retries: DEFAULT_MAX_PATH_RETRIES,
        }
    }
}

/// States of the reconciliation loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LoopState {
    /// Establishing the baseline with a full sync; repeats until one succeeds.
    Starting,
    /// Waiting for the deadline, the trigger or shutdown.
    IdleWait,
    /// Waiting out the debounce window after the last event.
    DrainDebounce,
    /// Applying one snapshot of pending paths.
    RunningIncremental,
    /// Scheduled (or rescan-requested) full sync.
    RunningScheduledFull,
    /// Shutdown observed; the loop has returned.
    Stopped,
}

#[derive(Debug)]
struct ScheduleState {
    next_full_sync: Instant,
    current_interval: Duration,
}

impl ScheduleState {
    fn arm(&mut self, interval: Duration) {
        self.current_interval = interval;
        self.next_full_sync = Instant::now() + interval;
    }
}

#[derive(Debug, Default)]
struct BatchOutcome {
    counters: SyncCounters,
    failed_changed: Vec<PathBuf>,
    failed_deleted: Vec<PathBuf>,
}

/// Deletions first, then updates, each path isolated from the others.
fn apply_batch<S: MirrorSync>(sync: &S, snapshot: &PendingSnapshot) -> BatchOutcome {
    let mut outcome = BatchOutcome::default();

    for path in &snapshot.deleted {
        if let Err(err) = sync.delete_one(path, &mut outcome.counters) {
            warn!(target: "mirror::reconcile", path = %path.display(), error = %err, "incremental delete failed");
            outcome.failed_deleted.push(path.clone());
        }
    }
    for path in &snapshot.changed {
        if let Err(err) = sync.update_one(path, &mut outcome.counters) {
            warn!(target: "mirror::reconcile", path = %path.display(), error = %err, "incremental update failed");
            outcome.failed_changed.push(path.clone());
        }
    }

    outcome
}

/// Consumer side of the mirror: alternates incremental batches and full syncs
/// until the shutdown token fires.
pub struct ReconcileLoop<S: MirrorSync> {
    sync: Arc<S>,
    aggregator: ChangeAggregator,
    settings: ReconcileSettings,
    shutdown: CancellationToken,
    schedule: ScheduleState,
    failures: HashMap<PathBuf, u32>,
    subscription: Option<WatchSubscription>,
}

impl<S: MirrorSync> fmt::Debug for ReconcileLoop<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReconcileLoop")
            .field("sync_type", &std::any::type_name::<S>())
            .field("settings", &self.settings)
            .field("schedule", &self.schedule)
            .field("tracked_failures", &self.failures.len())
            .field("watching", &self.subscription.is_some())
            .finish()
    }
}

impl<S: MirrorSync> ReconcileLoop<S> {
    /// Loop in [`LoopState::Starting`] that stops once `shutdown` fires.
    pub fn new(
        sync: Arc<S>,
        aggregator: ChangeAggregator,
        settings: ReconcileSettings,
        shutdown: CancellationToken,
    ) -> Self {
        let interval = settings.full_sync_interval;
        Self {
            sync,
            aggregator,
            settings,
            shutdown,
            schedule: ScheduleState {
                next_full_sync: Instant::now() + interval,
                current_interval: interval,
            },
            failures: HashMap::new(),
            subscription: None,
        }
    }

    /// Keep the watch alive for as long as the loop runs.
    pub fn with_subscription(mut self, subscription: WatchSubscription) -> Self {
        self.subscription = Some(subscription);
        self
    }

    /// Drive the state machine until shutdown. The watch subscription is
    /// released when this returns.
    pub async fn run(mut self) {
        let mut state = LoopState::Starting;
        while state != LoopState::Stopped {
            let next = self.step(state).await;
            if next != state {
                debug!(target: "mirror::reconcile", from = ?state, to = ?next, "state transition");
            }
            state = next;
        }
        info!(target: "mirror::reconcile", "reconciliation loop stopped");
    }

    async fn step(&mut self, state: LoopState) -> LoopState {
        match state {
            LoopState::Starting => self.establish_baseline().await,
            LoopState::IdleWait => self.idle_wait().await,
            LoopState::DrainDebounce => self.drain_debounce().await,
            LoopState::RunningIncremental => self.run_incremental_batch().await,
            LoopState::RunningScheduledFull => self.run_scheduled_full_sync().await,
            LoopState::Stopped => LoopState::Stopped,
        }
    }

    async fn full_sync(&self) -> Result<SyncCounters> {
        let sync = Arc::clone(&self.sync);
        spawn_blocking(move || sync.full_sync())
            .await
            .map_err(|err| MirrorError::Internal(format!("full sync task failed: {err}")))?
    }

    async fn establish_baseline(&mut self) -> LoopState {
        if self.shutdown.is_cancelled() {
            return LoopState::Stopped;
        }
        // The baseline covers whatever a pending rescan would.
        self.aggregator.take_rescan_request();

        match self.full_sync().await {
            Ok(counters) => {
                self.schedule.arm(self.settings.full_sync_interval);
                info!(target: "mirror::reconcile", %counters, "baseline full sync complete");
                LoopState::IdleWait
            }
            Err(err) => {
                let retry = self.settings.full_sync_retry_interval;
                error!(
                    target: "mirror::reconcile",
                    error = %err,
                    retry_in = ?retry,
                    "baseline full sync failed"
                );
                tokio::select! {
                    _ = self.shutdown.cancelled() => LoopState::Stopped,
                    _ = sleep(retry) => LoopState::Starting,
                }
            }
        }
    }

    async fn idle_wait(&mut self) -> LoopState {
        if self.shutdown.is_cancelled() {
            return LoopState::Stopped;
        }

        tokio::select! {
            biased;
            _ = self.shutdown.cancelled() => LoopState::Stopped,
            _ = sleep_until(self.schedule.next_full_sync) => LoopState::RunningScheduledFull,
            _ = self.aggregator.triggered() => {
                if self.aggregator.take_rescan_request() {
                    LoopState::RunningScheduledFull
                } else {
                    LoopState::DrainDebounce
                }
            }
        }
    }

    async fn drain_debounce(&mut self) -> LoopState {
        let window = self.settings.debounce_window;
        loop {
            let remaining = self
                .aggregator
                .since_last_event()
                .map_or(Duration::ZERO, |elapsed| window.saturating_sub(elapsed));
            if remaining.is_zero() {
                return LoopState::RunningIncremental;
            }

            tokio::select! {
                _ = self.shutdown.cancelled() => return LoopState::Stopped,
                _ = sleep(remaining) => {}
            }
        }
    }

    async fn run_incremental_batch(&mut self) -> LoopState {
        let snapshot = Arc::new(self.aggregator.snapshot_and_clear());
        let before = snapshot.event_counter;

        if !snapshot.is_empty() {
            let sync = Arc::clone(&self.sync);
            let batch = Arc::clone(&snapshot);
            let outcome = match spawn_blocking(move || apply_batch(sync.as_ref(), &batch)).await {
                Ok(outcome) => outcome,
                Err(err) => {
                    error!(target: "mirror::reconcile", error = %err, "incremental batch task failed");
                    BatchOutcome {
                        counters: SyncCounters::default(),
                        failed_changed: snapshot.changed.clone(),
                        failed_deleted: snapshot.deleted.clone(),
                    }
                }
            };

            info!(
                target: "mirror::reconcile",
                changed = snapshot.changed.len(),
                deleted = snapshot.deleted.len(),
                counters = %outcome.counters,
                "incremental batch applied"
            );
            self.requeue_failures(&snapshot, outcome);
        }

        if self.aggregator.settle(before) {
            LoopState::IdleWait
        } else if self.shutdown.is_cancelled() {
            LoopState::Stopped
        } else if self.aggregator.take_rescan_request() {
            LoopState::RunningScheduledFull
        } else {
            LoopState::DrainDebounce
        }
    }

    /// Charge failures against each path's retry budget and requeue the ones
    /// that still have budget left. Successful paths start over.
    fn requeue_failures(&mut self, snapshot: &PendingSnapshot, outcome: BatchOutcome) {
        let failed_count = outcome.failed_changed.len() + outcome.failed_deleted.len();
        {
            let failed: HashSet<&PathBuf> = outcome
                .failed_changed
                .iter()
                .chain(outcome.failed_deleted.iter())
                .collect();
            for path in snapshot.changed.iter().chain(snapshot.deleted.iter()) {
                if !failed.contains(path) {
                    self.failures.remove(path);
                }
            }
        }
        if failed_count == 0 {
            return;
        }

        let mut changed = Vec::new();
        for path in outcome.failed_changed {
            if self.charge_failure(&path) {
                changed.push(path);
            }
        }
        let mut deleted = Vec::new();
        for path in outcome.failed_deleted {
            if self.charge_failure(&path) {
                deleted.push(path);
            }
        }

        warn!(
            target: "mirror::reconcile",
            failed = failed_count,
            requeued = changed.len() + deleted.len(),
            "incremental batch had failures, requeueing"
        );
        self.aggregator.requeue(changed, deleted);
    }

    /// Returns whether `path` still has retry budget.
    fn charge_failure(&mut self, path: &Path) -> bool {
        let budget = self.settings.max_path_retries;
        let attempts = self.failures.entry(path.to_path_buf()).or_insert(0);
        *attempts += 1;
        if budget == 0 || *attempts <= budget {
            return true;
        }

        error!(
            target: "mirror::reconcile",
            path = %path.display(),
            attempts = *attempts,
            "path keeps failing, quarantined until its next change or full sync"
        );
        self.failures.remove(path);
        false
    }

    async fn run_scheduled_full_sync(&mut self) -> LoopState {
        let before = self.aggregator.event_counter();
        let result = self.full_sync().await;

        match result {
            Ok(counters) if self.aggregator.clear_if_unchanged(before) => {
                self.failures.clear();
                self.schedule.arm(self.settings.full_sync_interval);
                info!(target: "mirror::reconcile", %counters, "scheduled full sync complete");
            }
            Ok(counters) => {
                self.schedule.arm(self.settings.full_sync_retry_interval);
                info!(
                    target: "mirror::reconcile",
                    %counters,
                    retry_in = ?self.schedule.current_interval,
                    "events arrived during full sync, keeping pending changes"
                );
            }
            Err(err) => {
                self.schedule.arm(self.settings.full_sync_retry_interval);
                error!(
                    target: "mirror::reconcile",
                    error = %err,
                    retry_in = ?self.schedule.current_interval,
                    "scheduled full sync failed"
                );
            }
        }

        LoopState::IdleWait
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::RootRole;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct ScriptedSync {
        calls: Mutex<Vec<(&'static str, PathBuf)>>,
        failing: Mutex<HashSet<PathBuf>>,
        full_syncs: AtomicUsize,
        full_sync_failures: AtomicUsize,
        inject_during_full_sync: Mutex<Option<ChangeAggregator>>,
        inject_during_update: Mutex<Option<ChangeAggregator>>,
    }

    impl ScriptedSync {
        fn fail_on(&self, path: &str) {
            self.failing.lock().insert(PathBuf::from(path));
        }

        fn calls(&self) -> Vec<(&'static str, PathBuf)> {
            self.calls.lock().clone()
        }

        fn outcome(&self, path: &Path) -> Result<()> {
            if self.failing.lock().contains(path) {
                Err(std::io::Error::other("scripted failure").into())
            } else {
                Ok(())
            }
        }
    }

    impl MirrorSync for ScriptedSync {
        fn update_one(&self, source: &Path, counters: &mut SyncCounters) -> Result<()> {
            self.calls.lock().push(("update", source.to_path_buf()));
            if let Some(aggregator) = self.inject_during_update.lock().take() {
                aggregator.record_changed(PathBuf::from("/src/late/LATE-002.strm"));
            }
            self.outcome(source)?;
            counters.updated += 1;
            Ok(())
        }

        fn delete_one(&self, source: &Path, counters: &mut SyncCounters) -> Result<()> {
            self.calls.lock().push(("delete", source.to_path_buf()));
            self.outcome(source)?;
            counters.deleted += 1;
            Ok(())
        }

        fn full_sync(&self) -> Result<SyncCounters> {
            self.full_syncs.fetch_add(1, Ordering::SeqCst);
            if let Some(aggregator) = self.inject_during_full_sync.lock().as_ref() {
                aggregator.record_changed(PathBuf::from("/src/late/LATE-001.strm"));
            }
            let remaining = self.full_sync_failures.load(Ordering::SeqCst);
            if remaining > 0 {
                self.full_sync_failures.store(remaining - 1, Ordering::SeqCst);
                return Err(MirrorError::InvalidRoot {
                    role: RootRole::Source,
                    path: PathBuf::from("/src"),
                });
            }
            Ok(SyncCounters::default())
        }
    }

    fn settings() -> ReconcileSettings {
        ReconcileSettings {
            debounce_window: Duration::from_millis(150),
            full_sync_interval: Duration::from_secs(3600),
            full_sync_retry_interval: Duration::from_millis(20),
            max_path_retries: 2,
        }
    }

    fn harness() -> (Arc<ScriptedSync>, ChangeAggregator, ReconcileLoop<ScriptedSync>) {
        let sync = Arc::new(ScriptedSync::default());
        let aggregator = ChangeAggregator::new("strm");
        let reconcile = ReconcileLoop::new(
            Arc::clone(&sync),
            aggregator.clone(),
            settings(),
            CancellationToken::new(),
        );
        (sync, aggregator, reconcile)
    }

    #[tokio::test]
    async fn deletions_run_before_updates() {
        let (sync, aggregator, mut reconcile) = harness();
        aggregator.record_changed(PathBuf::from("/src/ABC-1.strm"));
        aggregator.record_deleted(PathBuf::from("/src/ABC-2.strm"));

        let next = reconcile.step(LoopState::RunningIncremental).await;
        assert_eq!(next, LoopState::IdleWait);
        assert_eq!(
            sync.calls(),
            vec![
                ("delete", PathBuf::from("/src/ABC-2.strm")),
                ("update", PathBuf::from("/src/ABC-1.strm")),
            ]
        );
        assert!(!aggregator.is_triggered());
    }

    #[tokio::test]
    async fn failed_path_is_requeued_and_retriggers() {
        let (sync, aggregator, mut reconcile) = harness();
        sync.fail_on("/src/BAD-1.strm");
        aggregator.record_changed(PathBuf::from("/src/BAD-1.strm"));
        aggregator.record_changed(PathBuf::from("/src/ABC-1.strm"));

        let next = reconcile.step(LoopState::RunningIncremental).await;
        assert_eq!(next, LoopState::DrainDebounce);
        assert!(aggregator.contains_changed(Path::new("/src/BAD-1.strm")));
        assert!(!aggregator.contains_changed(Path::new("/src/ABC-1.strm")));
        assert!(aggregator.is_triggered());
    }

    #[tokio::test]
    async fn persistent_failure_is_quarantined_after_budget() {
        let (sync, aggregator, mut reconcile) = harness();
        sync.fail_on("/src/BAD-1.strm");
        aggregator.record_changed(PathBuf::from("/src/BAD-1.strm"));

        // Budget of two retries: attempts one and two requeue, three quarantines.
        for _ in 0..2 {
            reconcile.step(LoopState::RunningIncremental).await;
            assert!(aggregator.contains_changed(Path::new("/src/BAD-1.strm")));
        }
        let next = reconcile.step(LoopState::RunningIncremental).await;
        assert!(!aggregator.contains_changed(Path::new("/src/BAD-1.strm")));
        assert_eq!(next, LoopState::IdleWait);

        // A fresh event gives the path a new budget.
        aggregator.record_changed(PathBuf::from("/src/BAD-1.strm"));
        reconcile.step(LoopState::RunningIncremental).await;
        assert!(aggregator.contains_changed(Path::new("/src/BAD-1.strm")));
    }

    #[tokio::test]
    async fn events_during_batch_keep_trigger_raised() {
        let (sync, aggregator, mut reconcile) = harness();
        aggregator.record_changed(PathBuf::from("/src/ABC-1.strm"));
        *sync.inject_during_update.lock() = Some(aggregator.clone());

        let next = reconcile.step(LoopState::RunningIncremental).await;
        assert_eq!(next, LoopState::DrainDebounce);
        assert!(aggregator.is_triggered());
        assert!(aggregator.contains_changed(Path::new("/src/late/LATE-002.strm")));
    }

    #[tokio::test]
    async fn scheduled_full_sync_clears_pending_when_quiet() {
        let (_sync, aggregator, mut reconcile) = harness();
        aggregator.record_changed(PathBuf::from("/src/ABC-1.strm"));

        let next = reconcile.step(LoopState::RunningScheduledFull).await;
        assert_eq!(next, LoopState::IdleWait);
        assert_eq!(aggregator.pending_counts(), (0, 0));
        assert!(!aggregator.is_triggered());
        assert_eq!(
            reconcile.schedule.current_interval,
            settings().full_sync_interval
        );
    }

    #[tokio::test]
    async fn scheduled_full_sync_keeps_pending_when_events_race() {
        let (sync, aggregator, mut reconcile) = harness();
        aggregator.record_changed(PathBuf::from("/src/ABC-1.strm"));
        *sync.inject_during_full_sync.lock() = Some(aggregator.clone());

        reconcile.step(LoopState::RunningScheduledFull).await;
        assert!(aggregator.contains_changed(Path::new("/src/ABC-1.strm")));
        assert!(aggregator.contains_changed(Path::new("/src/late/LATE-001.strm")));
        assert!(aggregator.is_triggered());
        assert_eq!(
            reconcile.schedule.current_interval,
            settings().full_sync_retry_interval
        );
    }

    #[tokio::test]
    async fn failed_scheduled_full_sync_uses_retry_interval() {
        let (sync, aggregator, mut reconcile) = harness();
        aggregator.record_changed(PathBuf::from("/src/ABC-1.strm"));
        sync.full_sync_failures.store(1, Ordering::SeqCst);

        reconcile.step(LoopState::RunningScheduledFull).await;
        assert_eq!(aggregator.pending_counts(), (1, 0));
        assert_eq!(
            reconcile.schedule.current_interval,
            settings().full_sync_retry_interval
        );
    }

    #[tokio::test]
    async fn baseline_retries_until_success() {
        let (sync, _aggregator, mut reconcile) = harness();
        sync.full_sync_failures.store(2, Ordering::SeqCst);

        let mut state = LoopState::Starting;
        let mut steps = 0;
        while state == LoopState::Starting {
            state = reconcile.step(state).await;
            steps += 1;
        }
        assert_eq!(state, LoopState::IdleWait);
        assert_eq!(steps, 3);
        assert_eq!(sync.full_syncs.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn debounce_coalesces_a_burst_into_one_batch() {
        let (sync, aggregator, mut reconcile) = harness();
        aggregator.record_changed(PathBuf::from("/src/BURST-1.strm"));

        let producer = {
            let aggregator = aggregator.clone();
            tokio::spawn(async move {
                for n in 2..=5 {
                    sleep(Duration::from_millis(30)).await;
                    aggregator.record_changed(PathBuf::from(format!("/src/BURST-{n}.strm")));
                }
            })
        };

        let started = Instant::now();
        let next = reconcile.step(LoopState::DrainDebounce).await;
        assert_eq!(next, LoopState::RunningIncremental);
        producer.await.expect("producer");
        assert!(started.elapsed() >= settings().debounce_window);

        reconcile.step(LoopState::RunningIncremental).await;
        let updated: HashSet<PathBuf> = sync.calls().into_iter().map(|(_, path)| path).collect();
        assert_eq!(updated.len(), 5);
        assert_eq!(aggregator.pending_counts(), (0, 0));
    }

    #[tokio::test]
    async fn rescan_request_runs_full_sync_from_idle() {
        let (sync, aggregator, mut reconcile) = harness();
        aggregator.request_rescan();

        let next = reconcile.step(LoopState::IdleWait).await;
        assert_eq!(next, LoopState::RunningScheduledFull);
        reconcile.step(next).await;
        assert_eq!(sync.full_syncs.load(Ordering::SeqCst), 1);
        assert!(!aggregator.is_triggered());
    }

    #[tokio::test]
    async fn rescan_raised_during_batch_escalates_to_full_sync() {
        let (_sync, aggregator, mut reconcile) = harness();
        aggregator.record_changed(PathBuf::from("/src/ABC-1.strm"));
        aggregator.request_rescan();

        let next = reconcile.step(LoopState::RunningIncremental).await;
        assert_eq!(next, LoopState::RunningScheduledFull);
        assert!(!aggregator.take_rescan_request());
    }

    #[tokio::test]
    async fn cancellation_stops_idle_wait() {
        let (_sync, _aggregator, mut reconcile) = harness();
        reconcile.shutdown.cancel();
        assert_eq!(reconcile.step(LoopState::IdleWait).await, LoopState::Stopped);
        assert_eq!(reconcile.step(LoopState::Starting).await, LoopState::Stopped);
    }
}
