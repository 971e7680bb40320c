use std::env;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{key} must be {expected}, got {value:?}")]
    Invalid {
        key: &'static str,
        expected: &'static str,
        value: String,
    },
    #[error("RUNNER_ID and RUNNER_KEY must be provided")]
    MissingCredentials,
}

/// What a session does when the fleet-wide slot ceiling denies it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotDeniedPolicy {
    /// Keep retrying at the poll interval until a slot frees up or the
    /// slot wait timeout passes, then fail the task
    Wait,
    /// Drop the task without reporting; the backend re-offers it once its
    /// own visibility timeout lapses
    Abandon,
    /// Report the task as failed right away
    Fail,
}

impl FromStr for SlotDeniedPolicy {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "wait" => Ok(SlotDeniedPolicy::Wait),
            "abandon" => Ok(SlotDeniedPolicy::Abandon),
            "fail" => Ok(SlotDeniedPolicy::Fail),
            _ => Err(()),
        }
    }
}

impl fmt::Display for SlotDeniedPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SlotDeniedPolicy::Wait => write!(f, "wait"),
            SlotDeniedPolicy::Abandon => write!(f, "abandon"),
            SlotDeniedPolicy::Fail => write!(f, "fail"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Text,
    Json,
}

/// Application configuration
/// Provides defaults with environment variable overrides
#[derive(Debug, Clone)]
pub struct Config {
    pub redis_url: String,
    pub endpoint: String,
    pub runner_id: Option<String>,
    pub runner_key: Option<String>,
    /// Fleet-wide ceiling on concurrently running sandboxes
    pub rate_limit: i64,
    /// Host path mounted read-only at /data; empty disables the mount
    pub shared_volume_path: String,
    pub poll_interval: Duration,
    pub recovery_interval: Duration,
    pub stale_threshold: Duration,
    pub slot_denied_policy: SlotDeniedPolicy,
    pub slot_wait_timeout: Duration,
    /// Bound on every backend HTTP request, connect included
    pub http_timeout: Duration,
    pub log_format: LogFormat,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build from an arbitrary key lookup; unset and empty values take the
    /// default.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        Ok(Self {
            redis_url: get("REDIS_URL").unwrap_or_else(|| "redis://127.0.0.1:6379".to_string()),
            endpoint: get("ENDPOINT").unwrap_or_else(|| "http://127.0.0.1:3000".to_string()),
            runner_id: get("RUNNER_ID"),
            runner_key: get("RUNNER_KEY"),
            rate_limit: parse(&get, "RATE_LIMIT", "a non-negative integer", 64i64)
                .and_then(|v| non_negative("RATE_LIMIT", v))?,
            shared_volume_path: lookup("SHARED_VOLUME_PATH")
                .unwrap_or_else(|| "/data".to_string()),
            poll_interval: Duration::from_millis(parse(
                &get,
                "POLL_INTERVAL_MS",
                "milliseconds",
                250,
            )?),
            recovery_interval: Duration::from_secs(parse(
                &get,
                "RECOVERY_INTERVAL_SECS",
                "seconds",
                30,
            )?),
            stale_threshold: Duration::from_secs(parse(
                &get,
                "STALE_THRESHOLD_SECS",
                "seconds",
                120,
            )?),
            slot_denied_policy: parse(
                &get,
                "SLOT_DENIED_POLICY",
                "one of wait, abandon, fail",
                SlotDeniedPolicy::Wait,
            )?,
            slot_wait_timeout: Duration::from_secs(parse(
                &get,
                "SLOT_WAIT_TIMEOUT_SECS",
                "seconds",
                600,
            )?),
            http_timeout: Duration::from_secs(parse(
                &get,
                "HTTP_TIMEOUT_SECS",
                "seconds",
                30,
            )?),
            log_format: match get("LOG_FORMAT").as_deref().map(str::to_lowercase).as_deref() {
                None | Some("text") => LogFormat::Text,
                Some("json") => LogFormat::Json,
                Some(other) => {
                    return Err(ConfigError::Invalid {
                        key: "LOG_FORMAT",
                        expected: "text or json",
                        value: other.to_string(),
                    })
                }
            },
        })
    }

    /// Runner credentials, required to talk to the grading backend
    pub fn credentials(&self) -> Result<(&str, &str), ConfigError> {
        match (self.runner_id.as_deref(), self.runner_key.as_deref()) {
            (Some(id), Some(key)) => Ok((id, key)),
            _ => Err(ConfigError::MissingCredentials),
        }
    }
}

fn parse<T, G>(
    get: &G,
    key: &'static str,
    expected: &'static str,
    default: T,
) -> Result<T, ConfigError>
where
    T: FromStr,
    G: Fn(&str) -> Option<String>,
{
    match get(key) {
        None => Ok(default),
        Some(raw) => raw.trim().parse().map_err(|_| ConfigError::Invalid {
            key,
            expected,
            value: raw,
        }),
    }
}

fn non_negative(key: &'static str, value: i64) -> Result<i64, ConfigError> {
    if value < 0 {
        return Err(ConfigError::Invalid {
            key,
            expected: "a non-negative integer",
            value: value.to_string(),
        });
    }
    Ok(value)
}
