use crate::executor::{BindMount, ExecutionRequest};
use anyhow::{bail, Context, Result};
use arbiter_common::SolutionPoll;
use serde::Deserialize;
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::time::Duration;

pub const DEFAULT_TIMEOUT_SECS: u64 = 300;
pub const DEFAULT_MEMORY_LIMIT_MB: u64 = 512;

/// Largest accepted timeout: one day
pub const MAX_TIMEOUT_SECS: u64 = 24 * 60 * 60;
/// Largest accepted memory limit: 1 TiB
pub const MAX_MEMORY_LIMIT_MB: u64 = 1024 * 1024;

/// Working directory inside every sandbox
pub const WORK_DIR: &str = "/work";
/// Where the shared data volume appears inside every sandbox
pub const DATA_MOUNT_TARGET: &str = "/data";

/// Per-task execution recipe, decoded from the problem's judge config.
/// Zero timeout or memory limit means "use the default".
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunTaskSpec {
    pub image: String,
    #[serde(default)]
    pub command: Vec<String>,
    /// Seconds
    #[serde(default)]
    pub timeout: u64,
    /// Megabytes
    #[serde(default)]
    pub memory_limit: u64,
    /// Fractional cores, 0 = unlimited
    #[serde(default)]
    pub cpu_limit: f64,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    /// Template variables, exposed to the sandbox as JSON in JUDGE_VARIABLES
    #[serde(default)]
    pub variables: Option<Map<String, Value>>,
}

impl RunTaskSpec {
    pub fn from_judge_config(config: &Value) -> Result<Self> {
        let spec: RunTaskSpec =
            serde_json::from_value(config.clone()).context("Malformed judge config")?;
        if spec.image.trim().is_empty() {
            bail!("Malformed judge config: no image given");
        }
        if spec.timeout > MAX_TIMEOUT_SECS {
            bail!(
                "Malformed judge config: timeout {}s exceeds the {}s maximum",
                spec.timeout,
                MAX_TIMEOUT_SECS
            );
        }
        if spec.memory_limit > MAX_MEMORY_LIMIT_MB {
            bail!(
                "Malformed judge config: memory limit {}MB exceeds the {}MB maximum",
                spec.memory_limit,
                MAX_MEMORY_LIMIT_MB
            );
        }
        Ok(spec)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(if self.timeout == 0 {
            DEFAULT_TIMEOUT_SECS
        } else {
            self.timeout
        })
    }

    /// Build the executor request: defaults applied, task identity and data
    /// locations injected, shared volume mounted read-only.
    /// An empty `shared_volume_path` disables the mount.
    pub fn build_request(
        &self,
        poll: &SolutionPoll,
        shared_volume_path: &str,
    ) -> ExecutionRequest {
        let memory_limit_mb = if self.memory_limit == 0 {
            DEFAULT_MEMORY_LIMIT_MB
        } else {
            self.memory_limit
        };

        // User env first so identity variables cannot be overridden
        let mut env = self.env.clone();
        let identity = [
            ("SOLUTION_ID", &poll.solution_id),
            ("TASK_ID", &poll.task_id),
            ("USER_ID", &poll.user_id),
            ("SOLUTION_DATA_URL", &poll.solution_data_url),
            ("SOLUTION_DATA_HASH", &poll.solution_data_hash),
            ("PROBLEM_DATA_URL", &poll.problem_data_url),
            ("PROBLEM_DATA_HASH", &poll.problem_data_hash),
        ];
        for (key, value) in identity {
            env.insert(key.to_string(), value.clone());
        }

        if let Some(variables) = &self.variables {
            match serde_json::to_string(variables) {
                Ok(json) => {
                    env.insert("JUDGE_VARIABLES".to_string(), json);
                }
                Err(e) => tracing::warn!(error = %e, "Failed to serialize judge variables"),
            }
        }

        let mut mounts = Vec::new();
        if !shared_volume_path.is_empty() {
            mounts.push(BindMount {
                source: shared_volume_path.to_string(),
                target: DATA_MOUNT_TARGET.to_string(),
                read_only: true,
            });
        }

        ExecutionRequest {
            image: self.image.clone(),
            command: self.command.clone(),
            working_dir: WORK_DIR.to_string(),
            timeout: self.timeout(),
            memory_limit_mb,
            cpu_limit: self.cpu_limit.max(0.0),
            env,
            mounts,
        }
    }
}
