/// Session Registry - heartbeat records for in-flight judge sessions
///
/// **Core Responsibility:**
/// Record that a session is alive, find sessions that stopped beating, and
/// arbitrate which worker gets to clean up after them.
///
/// **Recovery arbitration:**
/// A stale record is claimed by deleting it only if it still holds the exact
/// value that was observed when it was judged stale. Exactly one claimer wins,
/// and a session that refreshed its heartbeat in between makes every claim fail.
use crate::task::MAX_TIMEOUT_SECS;
use anyhow::{Context, Result};
use arbiter_common::redis::{session_id_from_key, session_key, SESSION_PREFIX};
use arbiter_common::{CoordinationStore, Heartbeat, SolutionRef};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;

/// Extra time past a session's own execution deadline before it can be stale
pub const STALE_GRACE: Duration = Duration::from_secs(60);

/// A heartbeat record that has not been refreshed in time
#[derive(Debug, Clone)]
pub struct StaleSession {
    pub session_id: String,
    /// Exact stored value, used as the claim's expected value
    pub raw: String,
    /// `None` when the record could not be decoded
    pub heartbeat: Option<Heartbeat>,
}

#[derive(Clone)]
pub struct SessionRegistry {
    store: Arc<dyn CoordinationStore>,
    worker_id: String,
}

impl SessionRegistry {
    pub fn new(store: Arc<dyn CoordinationStore>, worker_id: impl Into<String>) -> Self {
        Self {
            store,
            worker_id: worker_id.into(),
        }
    }

    /// Heartbeat key and encoded record for `session_id`, stamped now.
    /// First written together with the slot by [`RateLimiter::acquire`].
    ///
    /// [`RateLimiter::acquire`]: crate::limiter::RateLimiter::acquire
    pub fn record(
        &self,
        session_id: &str,
        solution: &SolutionRef,
        timeout: Duration,
    ) -> Result<(String, String)> {
        let heartbeat = Heartbeat {
            at: Utc::now(),
            solution: solution.clone(),
            worker: self.worker_id.clone(),
            timeout_secs: timeout.as_secs(),
        };
        Ok((session_key(session_id), serde_json::to_string(&heartbeat)?))
    }

    /// Restamp an existing heartbeat. Returns `false` when the record is
    /// gone, i.e. another worker reclaimed the session; it is not recreated.
    pub async fn refresh(
        &self,
        session_id: &str,
        solution: &SolutionRef,
        timeout: Duration,
    ) -> Result<bool> {
        let (key, value) = self.record(session_id, solution, timeout)?;
        self.store
            .set_if_exists(&key, &value)
            .await
            .with_context(|| format!("Failed to refresh heartbeat for session {}", session_id))
    }

    /// Returns whether a record was present
    pub async fn remove(&self, session_id: &str) -> Result<bool> {
        self.store
            .delete(&session_key(session_id))
            .await
            .with_context(|| format!("Failed to remove heartbeat for session {}", session_id))
    }

    /// Every record older than `max(threshold, timeout + STALE_GRACE)` at `now`.
    /// Undecodable records are always reported.
    pub async fn stale(
        &self,
        now: DateTime<Utc>,
        threshold: Duration,
    ) -> Result<Vec<StaleSession>> {
        let keys = self
            .store
            .scan(SESSION_PREFIX)
            .await
            .context("Failed to scan heartbeats")?;

        let mut stale = Vec::new();
        for key in keys {
            let Some(session_id) = session_id_from_key(&key) else {
                continue;
            };
            // Deleted since the scan
            let Some(raw) = self.store.get(&key).await? else {
                continue;
            };

            match serde_json::from_str::<Heartbeat>(&raw) {
                Ok(heartbeat) => {
                    if is_stale(&heartbeat, now, threshold) {
                        stale.push(StaleSession {
                            session_id: session_id.to_string(),
                            raw,
                            heartbeat: Some(heartbeat),
                        });
                    }
                }
                Err(e) => {
                    tracing::warn!(session_id, error = %e, "Undecodable heartbeat record");
                    stale.push(StaleSession {
                        session_id: session_id.to_string(),
                        raw,
                        heartbeat: None,
                    });
                }
            }
        }
        Ok(stale)
    }

    /// Try to take ownership of a stale session's cleanup.
    /// Only the caller that gets `true` may act on it.
    pub async fn claim(&self, stale: &StaleSession) -> Result<bool> {
        self.store
            .compare_and_delete(&session_key(&stale.session_id), &stale.raw)
            .await
            .with_context(|| format!("Failed to claim session {}", stale.session_id))
    }
}

/// Records claiming a timeout above the accepted maximum are judged by the maximum
fn is_stale(heartbeat: &Heartbeat, now: DateTime<Utc>, threshold: Duration) -> bool {
    let timeout = Duration::from_secs(heartbeat.timeout_secs.min(MAX_TIMEOUT_SECS));
    let allowance = threshold.max(timeout.saturating_add(STALE_GRACE));
    let Ok(allowance) = chrono::Duration::from_std(allowance) else {
        return false;
    };
    now.signed_duration_since(heartbeat.at) > allowance
}
