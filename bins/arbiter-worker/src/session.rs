/// Judge Session - lifecycle of one fetched task
///
/// **Core Responsibility:**
/// Take a polled task from configuration through slot acquisition, sandbox
/// execution and progress forwarding to a final report, and clean up the
/// slot and heartbeat no matter how it ends.
///
/// **State flow:**
/// Fetched → Configuring → Acquiring → Running → Reporting → Completed,
/// with any failure ending in Failed.
///
/// **Ceiling invariant:**
/// The slot and the session's heartbeat are taken in one atomic step. The
/// slot is then released exactly once: by this session, or by the worker
/// that reclaimed the heartbeat. A reclaimed heartbeat is never recreated.
use crate::engine::StdStream;
use crate::executor::{ExecutionOutcome, ExecutionRequest, LogLine, SandboxExecutor};
use crate::limiter::RateLimiter;
use crate::registry::SessionRegistry;
use crate::task::RunTaskSpec;
use anyhow::Result;
use arbiter_common::{
    decode_line, Config, GradingBackend, Payload, SlotDeniedPolicy, SolutionDetails, SolutionInfo,
    SolutionPoll, SolutionRef,
};
use std::ops::ControlFlow;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::Instrument;

/// Lines buffered between the log follower and the progress consumer
const LINE_CHANNEL_CAPACITY: usize = 256;

pub const TIME_LIMIT_EXCEEDED: &str = "Time limit exceeded";
pub const MEMORY_LIMIT_EXCEEDED: &str = "Memory limit exceeded";

#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub shared_volume_path: String,
    pub poll_interval: Duration,
    pub slot_denied_policy: SlotDeniedPolicy,
    pub slot_wait_timeout: Duration,
}

impl SessionSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            shared_volume_path: config.shared_volume_path.clone(),
            poll_interval: config.poll_interval,
            slot_denied_policy: config.slot_denied_policy,
            slot_wait_timeout: config.slot_wait_timeout,
        }
    }
}

/// Everything a session needs from its worker; cheap to clone
#[derive(Clone)]
pub struct SessionContext {
    pub backend: Arc<dyn GradingBackend>,
    pub limiter: RateLimiter,
    pub registry: SessionRegistry,
    pub executor: Arc<SandboxExecutor>,
    pub settings: SessionSettings,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Fetched,
    Configuring,
    Acquiring,
    Running,
    Reporting,
    Completed,
    Failed,
}

#[derive(Debug)]
pub struct SessionReport {
    pub state: SessionState,
    pub outcome: Option<ExecutionOutcome>,
    /// Why the session failed, if it did
    pub error: Option<String>,
}

/// What the progress consumer observed while the sandbox ran
#[derive(Debug, Default, Clone, Copy)]
struct Progress {
    messages: usize,
    /// A score patch reached the backend
    patched: bool,
    /// Completion reached the backend
    completed: bool,
    /// The heartbeat vanished: another worker recovered this session
    reclaimed: bool,
}

pub struct JudgeSession {
    id: String,
    ctx: SessionContext,
    poll: SolutionPoll,
    solution: SolutionRef,
    state: SessionState,
}

impl JudgeSession {
    pub fn new(ctx: SessionContext, poll: SolutionPoll) -> Self {
        let solution = poll.solution_ref();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            ctx,
            poll,
            solution,
            state: SessionState::Fetched,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn solution(&self) -> &SolutionRef {
        &self.solution
    }

    /// Drive the session to a terminal state. Never returns an error:
    /// every failure is reported to the backend (or deliberately dropped)
    /// and summarised in the report.
    pub async fn run(self) -> SessionReport {
        let span = tracing::info_span!(
            "session",
            session_id = %self.id,
            solution_id = %self.solution.solution_id,
            task_id = %self.solution.task_id
        );
        self.drive().instrument(span).await
    }

    async fn drive(mut self) -> SessionReport {
        tracing::info!("Judging started");

        self.state = SessionState::Configuring;
        let request = match RunTaskSpec::from_judge_config(&self.poll.problem_config.judge.config) {
            Ok(spec) => spec.build_request(&self.poll, &self.ctx.settings.shared_volume_path),
            Err(e) => return self.fail(format!("{:#}", e)).await,
        };

        self.state = SessionState::Acquiring;
        match self.acquire_slot(request.timeout).await {
            Ok(true) => {}
            Ok(false) => return self.slot_denied().await,
            Err(e) => return self.fail(format!("{:#}", e)).await,
        }

        // Slot held from here on
        let (result, progress) = self.execute(&request).await;

        let report = match result {
            Ok(outcome) => {
                self.state = SessionState::Reporting;
                self.report(&outcome, progress).await;
                self.state = SessionState::Completed;
                tracing::info!("Judging completed");
                SessionReport {
                    state: self.state,
                    outcome: Some(outcome),
                    error: None,
                }
            }
            Err(e) => {
                let reason = format!("Failed to run solution: {:#}", e);
                report_failure(self.ctx.backend.as_ref(), &self.solution, &reason).await;
                self.state = SessionState::Failed;
                SessionReport {
                    state: self.state,
                    outcome: None,
                    error: Some(reason),
                }
            }
        };

        self.release(progress.reclaimed).await;
        report
    }

    /// Take a slot, writing the first heartbeat with it
    async fn acquire_slot(&self, timeout: Duration) -> Result<bool> {
        let settings = &self.ctx.settings;
        let started = Instant::now();
        loop {
            let (key, value) = self.ctx.registry.record(&self.id, &self.solution, timeout)?;
            if self.ctx.limiter.acquire(Some((key.as_str(), value.as_str()))).await? {
                tracing::debug!("Slot acquired");
                return Ok(true);
            }
            if settings.slot_denied_policy != SlotDeniedPolicy::Wait
                || started.elapsed() >= settings.slot_wait_timeout
            {
                return Ok(false);
            }
            tokio::time::sleep(settings.poll_interval).await;
        }
    }

    async fn slot_denied(mut self) -> SessionReport {
        match self.ctx.settings.slot_denied_policy {
            SlotDeniedPolicy::Abandon => {
                tracing::warn!("No execution slot available; abandoning task");
                self.state = SessionState::Failed;
                SessionReport {
                    state: self.state,
                    outcome: None,
                    error: Some("No execution slot available".to_string()),
                }
            }
            SlotDeniedPolicy::Wait => {
                let waited = self.ctx.settings.slot_wait_timeout.as_secs();
                self.fail(format!("No execution slot available after waiting {}s", waited))
                    .await
            }
            SlotDeniedPolicy::Fail => self.fail("No execution slot available".to_string()).await,
        }
    }

    /// Failure before a slot was held: report and stop
    async fn fail(mut self, reason: String) -> SessionReport {
        report_failure(self.ctx.backend.as_ref(), &self.solution, &reason).await;
        self.state = SessionState::Failed;
        SessionReport {
            state: self.state,
            outcome: None,
            error: Some(reason),
        }
    }

    async fn execute(
        &mut self,
        request: &ExecutionRequest,
    ) -> (Result<ExecutionOutcome>, Progress) {
        self.state = SessionState::Running;

        let (tx, rx) = mpsc::channel(LINE_CHANNEL_CAPACITY);
        let consumer = ProgressConsumer {
            ctx: &self.ctx,
            session_id: &self.id,
            solution: &self.solution,
            timeout: request.timeout,
            progress: Progress::default(),
        };

        tokio::join!(
            self.ctx.executor.run_with_logs(request, Some(tx)),
            consumer.consume(rx)
        )
    }

    async fn report(&self, outcome: &ExecutionOutcome, progress: Progress) {
        tracing::info!(
            exit_code = outcome.exit_code,
            timed_out = outcome.timed_out,
            oom = outcome.oom,
            messages = progress.messages,
            "Sandbox finished"
        );

        let backend = self.ctx.backend.as_ref();

        if !progress.patched && (outcome.timed_out || outcome.oom) {
            let message = if outcome.oom {
                MEMORY_LIMIT_EXCEEDED
            } else {
                TIME_LIMIT_EXCEEDED
            };
            if let Err(e) = backend.patch(&self.solution, &SolutionInfo::error(message)).await {
                tracing::warn!(error = %e, "Failed to report resource limit");
            }
        }

        if !progress.completed {
            if let Err(e) = backend.complete(&self.solution).await {
                tracing::error!(error = %e, "Failed to mark task complete");
            }
        }
    }

    /// Give the slot back unless recovery already did
    async fn release(&self, reclaimed: bool) {
        let reclaimed = reclaimed
            || match self.ctx.registry.remove(&self.id).await {
                Ok(existed) => !existed,
                Err(e) => {
                    tracing::warn!(error = %e, "Failed to remove heartbeat");
                    false
                }
            };

        if reclaimed {
            tracing::warn!("Heartbeat was reclaimed by another worker; slot already released");
            return;
        }
        if let Err(e) = self.ctx.limiter.release().await {
            tracing::error!(error = %e, "Failed to release slot");
        }
    }
}

/// Reads sandbox output in order and forwards protocol messages
struct ProgressConsumer<'a> {
    ctx: &'a SessionContext,
    session_id: &'a str,
    solution: &'a SolutionRef,
    timeout: Duration,
    progress: Progress,
}

impl ProgressConsumer<'_> {
    async fn consume(mut self, mut rx: mpsc::Receiver<LogLine>) -> Progress {
        while let Some(line) = rx.recv().await {
            if self.handle(line).await.is_break() {
                tracing::info!("Sandbox quit; no longer reading its output");
                break;
            }
        }
        self.progress
    }

    async fn handle(&mut self, line: LogLine) -> ControlFlow<()> {
        if line.stream == StdStream::Stderr {
            tracing::debug!(line = %line.text, "sandbox stderr");
            return ControlFlow::Continue(());
        }

        let Some(message) = decode_line(&line.text) else {
            tracing::debug!(line = %line.text, "Ignoring non-protocol output");
            return ControlFlow::Continue(());
        };
        self.progress.messages += 1;

        if !self.progress.reclaimed {
            match self
                .ctx
                .registry
                .refresh(self.session_id, self.solution, self.timeout)
                .await
            {
                Ok(true) => {}
                Ok(false) => {
                    tracing::warn!("Heartbeat reclaimed by another worker; not refreshing it");
                    self.progress.reclaimed = true;
                }
                Err(e) => tracing::warn!(error = %e, "Failed to refresh heartbeat"),
            }
        }

        let backend = self.ctx.backend.as_ref();
        match message.payload {
            Payload::Greet => tracing::info!("Sandbox greeted"),
            Payload::Noop => {}
            Payload::Unknown(tag) => tracing::debug!(tag = %tag, "Unknown action"),
            Payload::Error(text) => tracing::warn!(message = %text, "Sandbox reported an error"),
            Payload::Log(text) => tracing::info!(message = %text, "Sandbox log"),
            Payload::Patch(info) => match backend.patch(self.solution, &info).await {
                Ok(()) => self.progress.patched = true,
                Err(e) => tracing::warn!(error = %e, "Failed to forward patch"),
            },
            Payload::Detail(details) => {
                if let Err(e) = backend.save_detail(self.solution, &details).await {
                    tracing::warn!(error = %e, "Failed to forward detail");
                }
            }
            Payload::Complete => match backend.complete(self.solution).await {
                Ok(()) => self.progress.completed = true,
                Err(e) => tracing::warn!(error = %e, "Failed to forward completion"),
            },
            Payload::Quit => return ControlFlow::Break(()),
        }
        ControlFlow::Continue(())
    }
}

/// Close out a task as failed: error patch, detail summary, completion.
/// Backend errors are logged; there is nobody left to return them to.
pub async fn report_failure(backend: &dyn GradingBackend, solution: &SolutionRef, reason: &str) {
    tracing::error!(solution = %solution, reason, "Judging failed");

    if let Err(e) = backend.patch(solution, &SolutionInfo::error(reason)).await {
        tracing::warn!(solution = %solution, error = %e, "Failed to report failure status");
    }
    if let Err(e) = backend
        .save_detail(solution, &SolutionDetails::summary(reason))
        .await
    {
        tracing::warn!(solution = %solution, error = %e, "Failed to save failure detail");
    }
    if let Err(e) = backend.complete(solution).await {
        tracing::error!(solution = %solution, error = %e, "Failed to mark failed task complete");
    }
}
