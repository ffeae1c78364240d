//! Process-level supervision of the two long-running loops.
//!
//! [`MirrorService`] wires the watch subscription, the reconciliation loop
//! and the refresh loop to one [`CancellationToken`]. The loops share nothing
//! else. On shutdown each loop gets the same grace period; a loop that does
//! not finish in time is reported and left alone.

use std::fmt;
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use futures::future::{join_all, select_all};
use tokio::task::{JoinError, JoinHandle};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::error::Result;
use crate::reconcile::{ReconcileLoop, ReconcileSettings};
use crate::refresh::{NoopRefreshJob, RefreshJob, run_refresh_loop};
use crate::settings::{DEFAULT_REFRESH_INTERVAL, DEFAULT_SHUTDOWN_TIMEOUT};
use crate::sync::MirrorSync;
use crate::watch::{ChangeAggregator, WatchSubscription};

const RECONCILE_TASK: &str = "reconcile";
const REFRESH_TASK: &str = "refresh";

/// How a supervised loop ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskExit {
    /// Returned on its own after cancellation.
    Clean,
    /// Panicked or was cancelled by the runtime.
    Failed(String),
    /// Still running when the shutdown timeout elapsed.
    TimedOut,
}

impl TaskExit {
    fn from_join(result: std::result::Result<(), JoinError>) -> Self {
        match result {
            Ok(()) => TaskExit::Clean,
            Err(err) if err.is_panic() => TaskExit::Failed(format!("panicked: {err}")),
            Err(err) => TaskExit::Failed(err.to_string()),
        }
    }
}

impl fmt::Display for TaskExit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskExit::Clean => f.write_str("clean"),
            TaskExit::Failed(reason) => write!(f, "failed ({reason})"),
            TaskExit::TimedOut => f.write_str("timed out"),
        }
    }
}

/// Per-loop outcome of a shutdown.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ShutdownReport {
    /// Task name and exit, in start order.
    pub tasks: Vec<(&'static str, TaskExit)>,
}

impl ShutdownReport {
    /// Every loop returned on its own.
    pub fn is_clean(&self) -> bool {
        self.tasks.iter().all(|(_, exit)| *exit == TaskExit::Clean)
    }

    /// Exit of the task named `task` (`"reconcile"` or `"refresh"`).
    pub fn exit_of(&self, task: &str) -> Option<&TaskExit> {
        self.tasks
            .iter()
            .find(|(name, _)| *name == task)
            .map(|(_, exit)| exit)
    }
}

/// Unstarted service: the reconciliation loop over `sync` plus a refresh job.
pub struct MirrorService<S: MirrorSync> {
    sync: Arc<S>,
    source_root: PathBuf,
    aggregator: ChangeAggregator,
    settings: ReconcileSettings,
    refresh_job: Arc<dyn RefreshJob>,
    refresh_interval: Duration,
    shutdown_timeout: Duration,
    watch: bool,
}

impl<S: MirrorSync> fmt::Debug for MirrorService<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MirrorService")
            .field("source_root", &self.source_root)
            .field("settings", &self.settings)
            .field("refresh_job", &self.refresh_job.name())
            .field("refresh_interval", &self.refresh_interval)
            .field("shutdown_timeout", &self.shutdown_timeout)
            .field("watch", &self.watch)
            .finish()
    }
}

impl<S: MirrorSync> MirrorService<S> {
    /// Service watching `source_root` for files with `extension`, with a
    /// no-op refresh job until [`MirrorService::with_refresh`] is called.
    pub fn new(
        sync: Arc<S>,
        source_root: impl Into<PathBuf>,
        extension: &str,
        settings: ReconcileSettings,
    ) -> Self {
        Self {
            sync,
            source_root: source_root.into(),
            aggregator: ChangeAggregator::new(extension),
            settings,
            refresh_job: Arc::new(NoopRefreshJob),
            refresh_interval: DEFAULT_REFRESH_INTERVAL,
            shutdown_timeout: DEFAULT_SHUTDOWN_TIMEOUT,
            watch: true,
        }
    }

    /// Replace the no-op refresh job and its interval.
    pub fn with_refresh(mut self, job: Arc<dyn RefreshJob>, interval: Duration) -> Self {
        self.refresh_job = job;
        self.refresh_interval = interval;
        self
    }

    /// How long shutdown waits for each loop.
    pub fn with_shutdown_timeout(mut self, shutdown_timeout: Duration) -> Self {
        self.shutdown_timeout = shutdown_timeout;
        self
    }

    /// Skip the filesystem watch; changes then arrive only through
    /// [`MirrorService::aggregator`] and scheduled full syncs.
    pub fn without_watch(mut self) -> Self {
        self.watch = false;
        self
    }

    /// Producer handle feeding the reconciliation loop.
    pub fn aggregator(&self) -> ChangeAggregator {
        self.aggregator.clone()
    }

    /// Start the watch and spawn both loops. Must be called from within a
    /// Tokio runtime.
    pub fn start(self) -> Result<RunningService> {
        let shutdown = CancellationToken::new();

        let mut reconcile = ReconcileLoop::new(
            self.sync,
            self.aggregator.clone(),
            self.settings,
            shutdown.clone(),
        );
        if self.watch {
            let subscription = WatchSubscription::start(&self.source_root, self.aggregator)?;
            reconcile = reconcile.with_subscription(subscription);
        }

        let reconcile_handle = tokio::spawn(reconcile.run());
        let refresh_handle = tokio::spawn(run_refresh_loop(
            self.refresh_job,
            self.refresh_interval,
            shutdown.clone(),
        ));

        info!(
            target: "mirror::lifecycle",
            source_root = %self.source_root.display(),
            "mirror service started"
        );

        Ok(RunningService {
            shutdown,
            shutdown_timeout: self.shutdown_timeout,
            tasks: vec![
                SupervisedTask::new(RECONCILE_TASK, reconcile_handle),
                SupervisedTask::new(REFRESH_TASK, refresh_handle),
            ],
        })
    }
}

struct SupervisedTask {
    name: &'static str,
    handle: Option<JoinHandle<()>>,
    exit: Option<TaskExit>,
}

impl SupervisedTask {
    fn new(name: &'static str, handle: JoinHandle<()>) -> Self {
        Self {
            name,
            handle: Some(handle),
            exit: None,
        }
    }
}

/// Handle to the started loops.
pub struct RunningService {
    shutdown: CancellationToken,
    shutdown_timeout: Duration,
    tasks: Vec<SupervisedTask>,
}

impl fmt::Debug for RunningService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<&str> = self.tasks.iter().map(|task| task.name).collect();
        f.debug_struct("RunningService")
            .field("shutdown_timeout", &self.shutdown_timeout)
            .field("cancelled", &self.shutdown.is_cancelled())
            .field("tasks", &names)
            .finish()
    }
}

impl RunningService {
    /// Wait for `signal`, logging any loop that exits on its own in the
    /// meantime, then shut down.
    pub async fn run_until<F>(mut self, signal: F) -> ShutdownReport
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(signal);

        loop {
            tokio::select! {
                _ = &mut signal => break,
                (index, exit) = next_exit(&mut self.tasks) => {
                    error!(
                        target: "mirror::lifecycle",
                        task = self.tasks[index].name,
                        %exit,
                        "loop exited while the service was running"
                    );
                    self.tasks[index].exit = Some(exit);
                }
            }
        }

        self.shutdown().await
    }

    /// Cancel both loops and wait up to the shutdown timeout for each.
    pub async fn shutdown(mut self) -> ShutdownReport {
        info!(target: "mirror::lifecycle", timeout = ?self.shutdown_timeout, "shutting down");
        self.shutdown.cancel();

        let grace = self.shutdown_timeout;
        let waits = self.tasks.iter_mut().map(|task| {
            let name = task.name;
            let earlier = task.exit.take();
            let handle = task.handle.take();
            async move {
                let exit = match (earlier, handle) {
                    (Some(exit), _) => exit,
                    (None, Some(handle)) => match timeout(grace, handle).await {
                        Ok(result) => TaskExit::from_join(result),
                        Err(_) => {
                            warn!(
                                target: "mirror::lifecycle",
                                task = name,
                                timeout = ?grace,
                                "loop did not stop in time, leaving it running"
                            );
                            TaskExit::TimedOut
                        }
                    },
                    (None, None) => TaskExit::Clean,
                };
                (name, exit)
            }
        });

        let report = ShutdownReport {
            tasks: join_all(waits).await,
        };
        for (name, exit) in &report.tasks {
            info!(target: "mirror::lifecycle", task = *name, %exit, "loop finished");
        }
        report
    }
}

/// Resolves when any still-running task finishes; pending forever if none is.
async fn next_exit(tasks: &mut [SupervisedTask]) -> (usize, TaskExit) {
    let (indices, handles): (Vec<usize>, Vec<&mut JoinHandle<()>>) = tasks
        .iter_mut()
        .enumerate()
        .filter_map(|(index, task)| task.handle.as_mut().map(|handle| (index, handle)))
        .unzip();
    if handles.is_empty() {
        return std::future::pending().await;
    }

    let (result, position, _) = select_all(handles).await;
    let index = indices[position];
    tasks[index].handle = None;
    (index, TaskExit::from_join(result))
}
