/// Sandbox Executor - run one request in one container, always clean up
///
/// **Responsibility:**
/// Drive a `ContainerPlatform` through create → start → wait (bounded by
/// the request's timeout) → inspect → collect logs → remove.
///
/// **Guarantees:**
/// - A deadline hit stops the container and is reported as `timed_out`,
///   never as an error
/// - OOM is read from the final container state, independent of timeout
/// - Once a container exists it is removed exactly once, even when a
///   later step fails or the caller drops the future mid-run
use crate::engine::{ContainerPlatform, LogStream, StdStream};
use anyhow::{Context, Result};
use futures_util::StreamExt;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// How long to wait for the log follower to drain after the container exits
const LOG_DRAIN_GRACE: Duration = Duration::from_secs(5);

/// How long to wait for an exit code after stopping a timed-out container
const STOP_WAIT_GRACE: Duration = Duration::from_secs(15);

/// A line longer than this is flushed without waiting for its newline
const MAX_LINE_BYTES: usize = 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BindMount {
    pub source: String,
    pub target: String,
    pub read_only: bool,
}

/// Everything needed to run one sandbox
#[derive(Debug, Clone)]
pub struct ExecutionRequest {
    pub image: String,
    pub command: Vec<String>,
    pub working_dir: String,
    pub timeout: Duration,
    pub memory_limit_mb: u64,
    /// Fractional cores, 0 = unlimited
    pub cpu_limit: f64,
    pub env: BTreeMap<String, String>,
    pub mounts: Vec<BindMount>,
}

/// Result of one sandbox run.
/// `timed_out` and a normal exit are exclusive; `oom` may accompany either.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecutionOutcome {
    pub exit_code: i64,
    pub stdout: String,
    pub stderr: String,
    pub timed_out: bool,
    pub oom: bool,
}

/// One complete line written by the sandbox
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogLine {
    pub stream: StdStream,
    pub text: String,
}

pub struct SandboxExecutor {
    platform: Arc<dyn ContainerPlatform>,
}

impl SandboxExecutor {
    pub fn new(platform: Arc<dyn ContainerPlatform>) -> Self {
        Self { platform }
    }

    pub async fn run(&self, request: &ExecutionRequest) -> Result<ExecutionOutcome> {
        self.run_with_logs(request, None).await
    }

    /// Like [`run`](Self::run), additionally sending every line the
    /// container writes to `lines` as it is written. Dropping the receiver
    /// stops the streaming but not the run.
    pub async fn run_with_logs(
        &self,
        request: &ExecutionRequest,
        lines: Option<mpsc::Sender<LogLine>>,
    ) -> Result<ExecutionOutcome> {
        let id = self
            .platform
            .create(request)
            .await
            .context("Failed to create container")?;

        tracing::debug!(container_id = %id, image = %request.image, "Container created");

        let guard = RemovalGuard {
            platform: Arc::clone(&self.platform),
            id: Some(id.clone()),
        };
        let result = self.supervise(&id, request, lines).await;
        guard.remove().await;

        result
    }

    async fn supervise(
        &self,
        id: &str,
        request: &ExecutionRequest,
        lines: Option<mpsc::Sender<LogLine>>,
    ) -> Result<ExecutionOutcome> {
        self.platform
            .start(id)
            .await
            .context("Failed to start container")?;

        let mut follower =
            lines.map(|tx| tokio::spawn(stream_lines(self.platform.follow_logs(id), tx)));

        let mut outcome = ExecutionOutcome::default();

        match tokio::time::timeout(request.timeout, self.platform.wait(id)).await {
            Ok(Ok(code)) => outcome.exit_code = code,
            Ok(Err(e)) => {
                if let Some(handle) = follower.take() {
                    handle.abort();
                }
                return Err(e.context("Error waiting for container"));
            }
            Err(_) => {
                outcome.timed_out = true;
                tracing::warn!(
                    container_id = %id,
                    timeout_secs = request.timeout.as_secs(),
                    "Container exceeded its timeout; stopping"
                );
                if let Err(e) = self.platform.stop(id).await {
                    tracing::warn!(container_id = %id, error = %e, "Failed to stop container");
                }
                let stopped = tokio::time::timeout(STOP_WAIT_GRACE, self.platform.wait(id)).await;
                outcome.exit_code = match stopped {
                    Ok(Ok(code)) => code,
                    _ => -1,
                };
            }
        }

        if let Some(handle) = follower {
            drain(handle).await;
        }

        outcome.oom = match self.platform.oom_killed(id).await {
            Ok(oom) => oom,
            Err(e) => {
                tracing::warn!(container_id = %id, error = %e, "Failed to inspect container");
                false
            }
        };

        match self.platform.logs(id).await {
            Ok((stdout, stderr)) => {
                outcome.stdout = stdout;
                outcome.stderr = stderr;
            }
            Err(e) => {
                tracing::warn!(container_id = %id, error = %e, "Failed to collect container logs");
            }
        }

        Ok(outcome)
    }
}

async fn drain(mut handle: JoinHandle<()>) {
    if tokio::time::timeout(LOG_DRAIN_GRACE, &mut handle).await.is_err() {
        tracing::warn!("Log follower did not finish after container exit; aborting it");
        handle.abort();
    }
}

/// Removes the container exactly once: explicitly via [`remove`], or from
/// `Drop` on a spawned task if the owning future was cancelled first.
///
/// [`remove`]: RemovalGuard::remove
struct RemovalGuard {
    platform: Arc<dyn ContainerPlatform>,
    id: Option<String>,
}

impl RemovalGuard {
    async fn remove(mut self) {
        if let Some(id) = self.id.take() {
            // Own task, so cancelling the caller cannot interrupt teardown
            let handle = tokio::spawn(remove_container(Arc::clone(&self.platform), id));
            let _ = handle.await;
        }
    }
}

impl Drop for RemovalGuard {
    fn drop(&mut self) {
        let Some(id) = self.id.take() else {
            return;
        };
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn(remove_container(Arc::clone(&self.platform), id));
            }
            Err(_) => {
                tracing::error!(container_id = %id, "No runtime left to remove container");
            }
        }
    }
}

async fn remove_container(platform: Arc<dyn ContainerPlatform>, id: String) {
    match platform.remove(&id).await {
        Ok(()) => tracing::debug!(container_id = %id, "Container removed"),
        Err(e) => tracing::warn!(container_id = %id, error = %e, "Failed to remove container"),
    }
}

/// Split raw log chunks into lines and forward them until the container
/// exits or the receiver goes away.
async fn stream_lines(mut logs: LogStream, tx: mpsc::Sender<LogLine>) {
    let mut stdout = LineBuffer::default();
    let mut stderr = LineBuffer::default();

    while let Some(chunk) = logs.next().await {
        let chunk = match chunk {
            Ok(chunk) => chunk,
            Err(e) => {
                tracing::warn!(error = %e, "Log stream failed");
                break;
            }
        };

        let buffer = match chunk.stream {
            StdStream::Stdout => &mut stdout,
            StdStream::Stderr => &mut stderr,
        };

        for text in buffer.push(&chunk.bytes) {
            let line = LogLine {
                stream: chunk.stream,
                text,
            };
            if tx.send(line).await.is_err() {
                tracing::debug!("Line receiver closed; stop streaming logs");
                return;
            }
        }
    }

    for (stream, buffer) in [(StdStream::Stdout, stdout), (StdStream::Stderr, stderr)] {
        if let Some(text) = buffer.finish() {
            if tx.send(LogLine { stream, text }).await.is_err() {
                return;
            }
        }
    }
}

/// Reassembles lines from arbitrarily split byte chunks
#[derive(Debug, Default)]
struct LineBuffer {
    pending: Vec<u8>,
}

impl LineBuffer {
    fn push(&mut self, bytes: &[u8]) -> Vec<String> {
        self.pending.extend_from_slice(bytes);

        let mut lines = Vec::new();
        while let Some(pos) = self.pending.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.pending.drain(..=pos).collect();
            lines.push(to_text(&line[..line.len() - 1]));
        }
        if self.pending.len() > MAX_LINE_BYTES {
            lines.push(to_text(&std::mem::take(&mut self.pending)));
        }
        lines
    }

    fn finish(self) -> Option<String> {
        (!self.pending.is_empty()).then(|| to_text(&self.pending))
    }
}

fn to_text(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes)
        .trim_end_matches('\r')
        .to_string()
}
