use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use reqwest::{header, Client, RequestBuilder, Response};
use std::time::Duration;

use crate::types::{
    RunnerCredentials, RunnerRegistration, SolutionDetails, SolutionInfo, SolutionPoll,
    SolutionRef,
};

pub const USER_AGENT: &str = concat!("arbiter/", env!("CARGO_PKG_VERSION"));

/// Grading backend as seen by a judging worker
#[async_trait]
pub trait GradingBackend: Send + Sync {
    /// At most one pending task; `None` means nothing to do
    async fn poll(&self) -> Result<Option<SolutionPoll>>;

    async fn patch(&self, solution: &SolutionRef, info: &SolutionInfo) -> Result<()>;

    async fn save_detail(&self, solution: &SolutionRef, details: &SolutionDetails) -> Result<()>;

    /// Marks grading finished. Safe to call more than once per task.
    async fn complete(&self, solution: &SolutionRef) -> Result<()>;
}

/// HTTP client for the AOI runner API.
///
/// Every request is bounded by the configured timeout, so a hung backend
/// surfaces as an error instead of stalling the session that called it.
#[derive(Clone)]
pub struct AoiClient {
    base_url: String,
    client: Client,
}

impl AoiClient {
    /// Client authenticated as a registered runner
    pub fn new(
        base_url: &str,
        runner_id: &str,
        runner_key: &str,
        timeout: Duration,
    ) -> Result<Self> {
        let mut headers = header::HeaderMap::new();
        headers.insert(
            "X-AOI-Runner-Id",
            header::HeaderValue::from_str(runner_id).context("Invalid runner id")?,
        );
        let mut key = header::HeaderValue::from_str(runner_key).context("Invalid runner key")?;
        key.set_sensitive(true);
        headers.insert("X-AOI-Runner-Key", key);

        Self::build(base_url, headers, timeout)
    }

    /// Client without runner credentials; only good for [`register`](Self::register)
    pub fn anonymous(base_url: &str, timeout: Duration) -> Result<Self> {
        Self::build(base_url, header::HeaderMap::new(), timeout)
    }

    fn build(base_url: &str, headers: header::HeaderMap, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .user_agent(USER_AGENT)
            .default_headers(headers)
            .connect_timeout(timeout)
            .timeout(timeout)
            .build()
            .context("Failed to build HTTP client")?;

        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client,
        })
    }

    /// Exchange a registration token for a runner id and key
    pub async fn register(&self, registration: &RunnerRegistration) -> Result<RunnerCredentials> {
        let url = format!("{}/api/runner/register", self.base_url);
        let response = Self::send(self.client.post(url).json(registration), "register").await?;
        response
            .json()
            .await
            .context("Malformed registration response")
    }

    fn task_url(&self, solution: &SolutionRef, suffix: &str) -> String {
        format!(
            "{}/api/runner/solution/task/{}/{}{}",
            self.base_url, solution.solution_id, solution.task_id, suffix
        )
    }

    async fn send(request: RequestBuilder, what: &str) -> Result<Response> {
        let response = request
            .send()
            .await
            .with_context(|| format!("{} request failed", what))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            bail!("{} failed: {} {}", what, status, body.trim());
        }
        Ok(response)
    }
}

#[async_trait]
impl GradingBackend for AoiClient {
    async fn poll(&self) -> Result<Option<SolutionPoll>> {
        let url = format!("{}/api/runner/solution/poll", self.base_url);
        let response = Self::send(self.client.post(url), "poll").await?;

        let poll: SolutionPoll = response.json().await.context("Malformed poll response")?;
        if poll.is_empty() {
            return Ok(None);
        }
        Ok(Some(poll))
    }

    async fn patch(&self, solution: &SolutionRef, info: &SolutionInfo) -> Result<()> {
        let request = self.client.patch(self.task_url(solution, "")).json(info);
        Self::send(request, "patch").await?;
        Ok(())
    }

    async fn save_detail(&self, solution: &SolutionRef, details: &SolutionDetails) -> Result<()> {
        let request = self
            .client
            .put(self.task_url(solution, "/detail"))
            .json(details);
        Self::send(request, "save detail").await?;
        Ok(())
    }

    async fn complete(&self, solution: &SolutionRef) -> Result<()> {
        let request = self.client.post(self.task_url(solution, "/complete"));
        Self::send(request, "complete").await?;
        Ok(())
    }
}
