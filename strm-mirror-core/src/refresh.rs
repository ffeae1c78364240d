//! Periodic remote refresh, scheduled independently of filesystem events.

use std::any::Any;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::FutureExt;
use tokio::process::Command;
use tokio::time::{Instant, sleep, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::error::{MirrorError, Result};

/// Opaque job invoked once per refresh interval.
#[async_trait]
pub trait RefreshJob: Send + Sync + 'static {
    /// Short label used in logs and errors.
    fn name(&self) -> &str;

    /// One refresh pass.
    async fn run(&self) -> Result<()>;
}

/// Refresh job used when nothing is configured.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopRefreshJob;

#[async_trait]
impl RefreshJob for NoopRefreshJob {
    fn name(&self) -> &str {
        "noop"
    }

    async fn run(&self) -> Result<()> {
        debug!(target: "mirror::refresh", "no refresh command configured");
        Ok(())
    }
}

/// Runs an external program, bounded by a timeout. The child is killed if the
/// timeout fires or the run is dropped (for example when the runtime shuts
/// down while a detached run is still going).
#[derive(Clone)]
pub struct CommandRefreshJob {
    name: String,
    program: String,
    args: Vec<String>,
    timeout: Duration,
}

impl fmt::Debug for CommandRefreshJob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandRefreshJob")
            .field("program", &self.program)
            .field("args", &self.args)
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl CommandRefreshJob {
    /// Job running `program` with `args`, named after the program.
    pub fn new(program: impl Into<String>, args: Vec<String>, timeout: Duration) -> Self {
        let program = program.into();
        Self {
            name: program.clone(),
            program,
            args,
            timeout,
        }
    }

    /// First element is the program, the rest its arguments. `None` when empty.
    pub fn from_command_line(parts: &[String], timeout: Duration) -> Option<Self> {
        let (program, args) = parts.split_first()?;
        Some(Self::new(program.clone(), args.to_vec(), timeout))
    }

    fn failure(&self, reason: impl Into<String>) -> MirrorError {
        MirrorError::Refresh {
            job: self.name.clone(),
            reason: reason.into(),
        }
    }
}

#[async_trait]
impl RefreshJob for CommandRefreshJob {
    fn name(&self) -> &str {
        &self.name
    }

    async fn run(&self) -> Result<()> {
        let child = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|err| self.failure(format!("failed to spawn: {err}")))?;

        let output = match timeout(self.timeout, child.wait_with_output()).await {
            Ok(result) => result.map_err(|err| self.failure(format!("failed to wait: {err}")))?,
            Err(_) => return Err(self.failure(format!("timed out after {:?}", self.timeout))),
        };

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(self.failure(format!("{}: {}", output.status, stderr.trim())));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        if !stdout.trim().is_empty() {
            debug!(target: "mirror::refresh", job = %self.name, output = %stdout.trim(), "refresh command output");
        }
        Ok(())
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

/// Run `job` now and then every `interval` (measured start to start) until
/// `shutdown` fires. Failures and panics are logged and scheduling continues.
/// Cancellation only cuts the wait between runs; a run already started is
/// awaited to completion.
pub async fn run_refresh_loop(
    job: Arc<dyn RefreshJob>,
    interval: Duration,
    shutdown: CancellationToken,
) {
    info!(target: "mirror::refresh", job = job.name(), ?interval, "refresh loop started");

    while !shutdown.is_cancelled() {
        let started = Instant::now();
        // A run in progress is allowed to finish; shutdown bounds the wait.
        match AssertUnwindSafe(job.run()).catch_unwind().await {
            Ok(Ok(())) => info!(
                target: "mirror::refresh",
                job = job.name(),
                elapsed_ms = started.elapsed().as_millis() as u64,
                "refresh run finished"
            ),
            Ok(Err(err)) => error!(target: "mirror::refresh", job = job.name(), error = %err, "refresh run failed"),
            Err(payload) => error!(
                target: "mirror::refresh",
                job = job.name(),
                panic = %panic_message(payload.as_ref()),
                "refresh run panicked"
            ),
        }

        let wait = interval.saturating_sub(started.elapsed());
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = sleep(wait) => {}
        }
    }

    info!(target: "mirror::refresh", job = job.name(), "refresh loop stopped");
}
