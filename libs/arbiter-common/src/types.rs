use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

/// Status values the worker itself reports.
/// Anything a sandbox sends in a patch is forwarded verbatim.
pub mod status {
    pub const ERROR: &str = "error";
}

/// Judge section of a problem's configuration.
/// `config` is opaque here - the worker decodes it into its run recipe.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JudgeConfig {
    #[serde(default)]
    pub adapter: String,
    #[serde(default)]
    pub config: Value,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProblemConfig {
    #[serde(default)]
    pub judge: JudgeConfig,
}

/// Task descriptor returned by a successful poll.
///
/// The backend answers "nothing to do" with an object whose ids are empty,
/// so every field defaults.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SolutionPoll {
    pub task_id: String,
    pub solution_id: String,
    pub user_id: String,
    pub problem_config: ProblemConfig,
    pub problem_data_url: String,
    pub problem_data_hash: String,
    pub solution_data_url: String,
    pub solution_data_hash: String,
}

impl SolutionPoll {
    /// A poll without both ids carries no work.
    pub fn is_empty(&self) -> bool {
        self.solution_id.is_empty() || self.task_id.is_empty()
    }

    pub fn solution_ref(&self) -> SolutionRef {
        SolutionRef {
            solution_id: self.solution_id.clone(),
            task_id: self.task_id.clone(),
        }
    }
}

/// Identifies one judging task on every backend call
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SolutionRef {
    pub solution_id: String,
    pub task_id: String,
}

impl fmt::Display for SolutionRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.solution_id, self.task_id)
    }
}

/// Partial update of a task's grading state (score patch)
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SolutionInfo {
    #[serde(default)]
    pub score: f64,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub message: String,
}

impl SolutionInfo {
    /// Zero score with the error status.
    pub fn error(message: impl Into<String>) -> Self {
        Self {
            score: 0.0,
            status: status::ERROR.to_string(),
            message: message.into(),
        }
    }
}

/// Result-detail blob attached to a task.
/// Only `summary` is interpreted; everything else passes through untouched.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SolutionDetails {
    #[serde(default)]
    pub summary: String,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl SolutionDetails {
    pub fn summary(summary: impl Into<String>) -> Self {
        Self {
            summary: summary.into(),
            extra: Map::new(),
        }
    }
}

/// Body of a runner registration request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunnerRegistration {
    pub name: String,
    pub labels: Vec<String>,
    pub version: String,
    pub registration_token: String,
}

/// Identity issued to a newly registered runner
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunnerCredentials {
    pub runner_id: String,
    pub runner_key: String,
}

/// Liveness record of an in-flight session, stored under its heartbeat key.
///
/// `at` is the last time the session processed a progress message.
/// The solution reference lets another worker close out the task if the
/// owning worker dies.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Heartbeat {
    pub at: DateTime<Utc>,
    pub solution: SolutionRef,
    pub worker: String,
    pub timeout_secs: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_poll_deserialization() {
        let json = r#"{
            "taskId": "t-1",
            "solutionId": "s-1",
            "userId": "u-1",
            "problemConfig": {"judge": {"adapter": "docker", "config": {"image": "grader:latest"}}},
            "problemDataUrl": "https://data/p",
            "problemDataHash": "ph",
            "solutionDataUrl": "https://data/s",
            "solutionDataHash": "sh"
        }"#;

        let poll: SolutionPoll = serde_json::from_str(json).unwrap();
        assert!(!poll.is_empty());
        assert_eq!(poll.user_id, "u-1");
        assert_eq!(poll.problem_config.judge.config["image"], "grader:latest");
        assert_eq!(
            poll.solution_ref(),
            SolutionRef {
                solution_id: "s-1".to_string(),
                task_id: "t-1".to_string(),
            }
        );
    }

    #[test]
    fn test_empty_poll() {
        let poll: SolutionPoll = serde_json::from_str("{}").unwrap();
        assert!(poll.is_empty());

        let poll: SolutionPoll = serde_json::from_str(r#"{"solutionId": "s"}"#).unwrap();
        assert!(poll.is_empty());
    }

    #[test]
    fn test_solution_info_defaults() {
        let info: SolutionInfo = serde_json::from_str(r#"{"score": 80, "status": "ok"}"#).unwrap();
        assert_eq!(info.score, 80.0);
        assert_eq!(info.status, "ok");
        assert_eq!(info.message, "");
    }

    #[test]
    fn test_error_info() {
        let info = SolutionInfo::error("boom");
        assert_eq!(info.score, 0.0);
        assert_eq!(info.status, "error");
        assert_eq!(info.message, "boom");
    }

    #[test]
    fn test_details_keep_free_form_fields() {
        let json = r#"{"summary": "2/3 passed", "jobs": [{"name": "a", "score": 1}]}"#;
        let details: SolutionDetails = serde_json::from_str(json).unwrap();
        assert_eq!(details.summary, "2/3 passed");
        assert!(details.extra.contains_key("jobs"));

        let back = serde_json::to_value(&details).unwrap();
        assert_eq!(back["jobs"][0]["name"], "a");
    }

    #[test]
    fn test_heartbeat_serialization() {
        let beat = Heartbeat {
            at: Utc::now(),
            solution: SolutionRef {
                solution_id: "s".to_string(),
                task_id: "t".to_string(),
            },
            worker: "host-abc".to_string(),
            timeout_secs: 300,
        };
        let json = serde_json::to_string(&beat).unwrap();
        let back: Heartbeat = serde_json::from_str(&json).unwrap();
        assert_eq!(back, beat);
    }
}
