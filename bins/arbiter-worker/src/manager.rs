/// Manager - the worker's two long-running loops
///
/// **Dispatch loop:**
/// Poll the backend every poll interval and run each fetched task to
/// completion as a judge session.
///
/// **Shutdown:**
/// Once shutdown is signalled no new task is polled. A session already
/// running is finished, so its container, slot and heartbeat are cleaned up
/// before `start` returns.
///
/// **Recovery loop:**
/// Periodically look for heartbeats that stopped being refreshed (their
/// worker crashed or stalled), win the claim on each, return its slot and
/// close out its task as failed.
use crate::engine::{ContainerPlatform, DockerEngine};
use crate::executor::SandboxExecutor;
use crate::limiter::RateLimiter;
use crate::registry::SessionRegistry;
use crate::session::{
    report_failure, JudgeSession, SessionContext, SessionReport, SessionSettings,
};
use anyhow::Result;
use arbiter_common::redis::RedisStore;
use arbiter_common::{AoiClient, Config, CoordinationStore, GradingBackend};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;

pub const WORKER_UNRESPONSIVE: &str = "judge worker stopped responding";

#[derive(Clone)]
pub struct Manager {
    worker_id: String,
    poll_interval: Duration,
    recovery_interval: Duration,
    stale_threshold: Duration,
    ctx: SessionContext,
}

impl Manager {
    /// Connect to the backend, Redis and Docker. Fails fast without runner
    /// credentials, before touching anything else.
    pub async fn initialize(config: &Config) -> Result<Self> {
        let (runner_id, runner_key) = config.credentials()?;

        let backend = Arc::new(AoiClient::new(
            &config.endpoint,
            runner_id,
            runner_key,
            config.http_timeout,
        )?);
        let store = Arc::new(RedisStore::connect(&config.redis_url).await?);
        tracing::info!(redis_url = %config.redis_url, "Connected to Redis");
        let platform = Arc::new(DockerEngine::connect()?);

        Self::with_parts(config, backend, store, platform).await
    }

    pub async fn with_parts(
        config: &Config,
        backend: Arc<dyn GradingBackend>,
        store: Arc<dyn CoordinationStore>,
        platform: Arc<dyn ContainerPlatform>,
    ) -> Result<Self> {
        let worker_id = generate_worker_id();

        let limiter = RateLimiter::new(Arc::clone(&store));
        limiter.initialize(config.rate_limit).await?;

        let ctx = SessionContext {
            backend,
            limiter,
            registry: SessionRegistry::new(store, worker_id.clone()),
            executor: Arc::new(SandboxExecutor::new(platform)),
            settings: SessionSettings::from_config(config),
        };

        Ok(Self {
            worker_id,
            poll_interval: config.poll_interval,
            recovery_interval: config.recovery_interval,
            stale_threshold: config.stale_threshold,
            ctx,
        })
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    /// Recovery in the background, dispatch in the foreground, until
    /// `shutdown` turns true (or its sender goes away)
    pub async fn start(&self, mut shutdown: watch::Receiver<bool>) {
        tracing::info!(
            worker_id = %self.worker_id,
            poll_interval_ms = self.poll_interval.as_millis() as u64,
            "Worker started"
        );

        match self.ctx.limiter.usage().await {
            Ok(usage) => {
                tracing::info!(used = usage.used, limit = usage.limit, "Fleet slot usage")
            }
            Err(e) => tracing::warn!(error = %e, "Failed to read slot usage"),
        }

        let recovery = tokio::spawn(self.clone().recovery_loop());
        let _recovery = AbortOnDrop(recovery);

        loop {
            if *shutdown.borrow() {
                break;
            }
            tokio::select! {
                _ = tokio::time::sleep(self.poll_interval) => {}
                _ = shutdown.changed() => break,
            }
            self.dispatch_once().await;
        }
        tracing::info!("Dispatch stopped; no session in flight");
    }

    /// One poll; runs the fetched task, if any, to completion
    pub async fn dispatch_once(&self) -> Option<SessionReport> {
        let poll = match self.ctx.backend.poll().await {
            Ok(Some(poll)) => poll,
            Ok(None) => return None,
            Err(e) => {
                tracing::warn!(error = %e, "Failed to poll");
                return None;
            }
        };

        let session = JudgeSession::new(self.ctx.clone(), poll);
        tracing::info!(
            session_id = session.id(),
            solution = %session.solution(),
            "Received solution"
        );
        Some(session.run().await)
    }

    async fn recovery_loop(self) {
        let mut ticker = tokio::time::interval(self.recovery_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;
            match self.recover_once(Utc::now()).await {
                Ok(0) => {}
                Ok(recovered) => tracing::info!(recovered, "Recovered stale sessions"),
                Err(e) => tracing::warn!(error = %e, "Recovery pass failed"),
            }
        }
    }

    /// Claim every session stale at `now`; returns how many this worker won
    pub async fn recover_once(&self, now: DateTime<Utc>) -> Result<usize> {
        let registry = &self.ctx.registry;
        let stale = registry.stale(now, self.stale_threshold).await?;

        let mut recovered = 0;
        for session in stale {
            match registry.claim(&session).await {
                Ok(true) => {}
                Ok(false) => {
                    tracing::debug!(
                        session_id = %session.session_id,
                        "Session claimed elsewhere or revived"
                    );
                    continue;
                }
                Err(e) => {
                    tracing::warn!(
                        session_id = %session.session_id,
                        error = %e,
                        "Failed to claim session"
                    );
                    continue;
                }
            }
            recovered += 1;

            if let Err(e) = self.ctx.limiter.release().await {
                tracing::error!(
                    session_id = %session.session_id,
                    error = %e,
                    "Failed to release recovered slot"
                );
            }

            match &session.heartbeat {
                Some(heartbeat) => {
                    tracing::warn!(
                        session_id = %session.session_id,
                        solution = %heartbeat.solution,
                        owner = %heartbeat.worker,
                        last_seen = %heartbeat.at,
                        "Recovering stale session"
                    );
                    let backend = self.ctx.backend.as_ref();
                    report_failure(backend, &heartbeat.solution, WORKER_UNRESPONSIVE).await;
                }
                None => {
                    tracing::warn!(
                        session_id = %session.session_id,
                        "Dropped undecodable heartbeat record"
                    );
                }
            }
        }
        Ok(recovered)
    }
}

struct AbortOnDrop(tokio::task::JoinHandle<()>);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// `<hostname>-<8 random hex chars>`
fn generate_worker_id() -> String {
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    format!("{}-{}", hostname(), &suffix[..8])
}

fn hostname() -> String {
    std::env::var("HOSTNAME")
        .ok()
        .or_else(|| std::fs::read_to_string("/etc/hostname").ok())
        .map(|name| name.trim().to_string())
        .filter(|name| !name.is_empty())
        .unwrap_or_else(|| "arbiter".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{
        poll_with_config, BackendCall, ContainerScript, MemoryStore, RecordingBackend,
        ScriptedPlatform,
    };
    use crate::session::SessionState;
    use arbiter_common::redis::{session_key, SESSION_PREFIX};
    use arbiter_common::{Message, Payload, SolutionDetails, SolutionInfo, SolutionRef};
    use serde_json::json;
    use std::sync::atomic::Ordering;

    fn config() -> Config {
        let mut config = Config::from_lookup(|_| None).unwrap();
        config.rate_limit = 4;
        config
    }

    async fn manager(
        backend: &Arc<RecordingBackend>,
        store: &Arc<MemoryStore>,
        script: ContainerScript,
    ) -> Manager {
        Manager::with_parts(
            &config(),
            backend.clone(),
            store.clone(),
            Arc::new(ScriptedPlatform::new(script)),
        )
        .await
        .unwrap()
    }

    fn orphan() -> SolutionRef {
        SolutionRef {
            solution_id: "s9".to_string(),
            task_id: "t9".to_string(),
        }
    }

    /// A session left behind by a worker that died mid-run
    async fn plant_orphan(store: &Arc<MemoryStore>) {
        let dead = SessionRegistry::new(store.clone(), "dead-worker");
        let (key, value) = dead
            .record("orphan", &orphan(), Duration::from_secs(10))
            .unwrap();
        let limiter = RateLimiter::new(store.clone());
        assert!(limiter.acquire(Some((key.as_str(), value.as_str()))).await.unwrap());
    }

    async fn used(store: &Arc<MemoryStore>) -> i64 {
        RateLimiter::new(store.clone()).usage().await.unwrap().used
    }

    #[tokio::test]
    async fn test_empty_poll_does_nothing() {
        let backend = Arc::new(RecordingBackend::default());
        let store = Arc::new(MemoryStore::default());
        let manager = manager(&backend, &store, ContainerScript::default()).await;

        assert!(manager.dispatch_once().await.is_none());
        assert!(backend.calls().is_empty());
    }

    #[tokio::test]
    async fn test_poll_error_is_skipped() {
        let backend = Arc::new(RecordingBackend::default());
        let store = Arc::new(MemoryStore::default());
        let manager = manager(&backend, &store, ContainerScript::default()).await;
        backend.enqueue(poll_with_config("s1", json!({"image": "grader"})));
        backend.fail_polls.store(true, Ordering::SeqCst);

        assert!(manager.dispatch_once().await.is_none());

        backend.fail_polls.store(false, Ordering::SeqCst);
        assert!(manager.dispatch_once().await.is_some());
    }

    #[tokio::test]
    async fn test_dispatch_runs_session() {
        let backend = Arc::new(RecordingBackend::default());
        let store = Arc::new(MemoryStore::default());
        let done = Message::new(Payload::Complete).encode();
        let manager = manager(&backend, &store, ContainerScript::stdout(&[&done])).await;
        backend.enqueue(poll_with_config("s1", json!({"image": "grader"})));

        let report = manager.dispatch_once().await.unwrap();

        assert_eq!(report.state, SessionState::Completed);
        assert_eq!(
            backend.calls(),
            vec![BackendCall::Complete(SolutionRef {
                solution_id: "s1".to_string(),
                task_id: "task-s1".to_string(),
            })]
        );
        assert!(store.scan(SESSION_PREFIX).await.unwrap().is_empty());
        assert_eq!(used(&store).await, 0);
    }

    #[tokio::test]
    async fn test_recovers_stale_session() {
        let backend = Arc::new(RecordingBackend::default());
        let store = Arc::new(MemoryStore::default());
        let manager = manager(&backend, &store, ContainerScript::default()).await;
        plant_orphan(&store).await;

        let later = Utc::now() + chrono::Duration::seconds(3600);
        assert_eq!(manager.recover_once(later).await.unwrap(), 1);

        assert_eq!(
            backend.calls(),
            vec![
                BackendCall::Patch(orphan(), SolutionInfo::error(WORKER_UNRESPONSIVE)),
                BackendCall::Detail(orphan(), SolutionDetails::summary(WORKER_UNRESPONSIVE)),
                BackendCall::Complete(orphan()),
            ]
        );
        assert!(store.get(&session_key("orphan")).await.unwrap().is_none());
        assert_eq!(used(&store).await, 0);
    }

    #[tokio::test]
    async fn test_fresh_session_not_recovered() {
        let backend = Arc::new(RecordingBackend::default());
        let store = Arc::new(MemoryStore::default());
        let manager = manager(&backend, &store, ContainerScript::default()).await;
        plant_orphan(&store).await;

        assert_eq!(manager.recover_once(Utc::now()).await.unwrap(), 0);
        assert!(backend.calls().is_empty());
        assert_eq!(used(&store).await, 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_two_workers_recover_exactly_once() {
        let backend = Arc::new(RecordingBackend::default());
        let store = Arc::new(MemoryStore::default());
        let first = manager(&backend, &store, ContainerScript::default()).await;
        let second = manager(&backend, &store, ContainerScript::default()).await;
        assert_ne!(first.worker_id(), second.worker_id());
        plant_orphan(&store).await;

        let later = Utc::now() + chrono::Duration::seconds(3600);
        let (a, b) = tokio::join!(
            tokio::spawn(async move { first.recover_once(later).await.unwrap() }),
            tokio::spawn(async move { second.recover_once(later).await.unwrap() }),
        );

        assert_eq!(a.unwrap() + b.unwrap(), 1);
        assert_eq!(backend.calls().len(), 3);
        assert_eq!(used(&store).await, 0);
    }

    #[tokio::test]
    async fn test_undecodable_record_releases_slot() {
        let backend = Arc::new(RecordingBackend::default());
        let store = Arc::new(MemoryStore::default());
        let manager = manager(&backend, &store, ContainerScript::default()).await;
        store.set(&session_key("junk"), "not json").await.unwrap();
        assert!(RateLimiter::new(store.clone()).acquire(None).await.unwrap());

        assert_eq!(manager.recover_once(Utc::now()).await.unwrap(), 1);
        assert!(backend.calls().is_empty());
        assert_eq!(used(&store).await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_finishes_running_session() {
        let backend = Arc::new(RecordingBackend::default());
        let store = Arc::new(MemoryStore::default());
        let mut script = ContainerScript::stdout(&[&Message::new(Payload::Complete).encode()]);
        script.exit_delay = Duration::from_secs(5);
        let platform = Arc::new(ScriptedPlatform::new(script));
        let manager = Manager::with_parts(
            &config(),
            backend.clone(),
            store.clone(),
            platform.clone(),
        )
        .await
        .unwrap();
        for id in ["s1", "s2"] {
            backend.enqueue(poll_with_config(id, json!({"image": "grader", "timeout": 10})));
        }

        let (stop, shutdown) = watch::channel(false);
        let running = tokio::spawn(async move { manager.start(shutdown).await });

        // First session is mid-run when shutdown arrives
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(used(&store).await, 1);
        stop.send(true).unwrap();

        running.await.unwrap();
        assert_eq!(platform.created().len(), 1);
        assert_eq!(platform.remove_calls(), 1);
        assert_eq!(used(&store).await, 0);
        assert!(store.scan(SESSION_PREFIX).await.unwrap().is_empty());
        assert_eq!(backend.pending(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_while_idle() {
        let backend = Arc::new(RecordingBackend::default());
        let store = Arc::new(MemoryStore::default());
        let manager = manager(&backend, &store, ContainerScript::default()).await;

        let (stop, shutdown) = watch::channel(false);
        let running = tokio::spawn(async move { manager.start(shutdown).await });
        tokio::time::sleep(Duration::from_secs(1)).await;
        drop(stop);

        running.await.unwrap();
        assert!(backend.calls().is_empty());
    }

    #[tokio::test]
    async fn test_initialize_requires_credentials() {
        let err = Manager::initialize(&config()).await.err().unwrap();
        assert!(err.to_string().contains("RUNNER_ID"));
    }

    #[test]
    fn test_worker_id_format() {
        let id = generate_worker_id();
        let (host, suffix) = id.rsplit_once('-').unwrap();
        assert!(!host.is_empty());
        assert_eq!(suffix.len(), 8);
        assert!(suffix.chars().all(|c| c.is_ascii_hexdigit()));
    }
}
