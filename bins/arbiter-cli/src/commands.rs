// Operator commands for an arbiter fleet
use anyhow::{bail, Context, Result};
use arbiter_common::redis::{session_id_from_key, RedisStore, SESSION_PREFIX, SLOTS_USED_KEY};
use arbiter_common::{
    slot_usage, AoiClient, Config, CoordinationStore, GradingBackend, Heartbeat, Message,
    Payload, RunnerRegistration, SolutionDetails, SolutionInfo,
};
use chrono::{DateTime, Utc};
use clap::Subcommand;
use serde_json::Value;

#[derive(Debug, Subcommand)]
pub enum EmitAction {
    /// Announce the sandbox has started
    Greet,
    /// Heartbeat only
    Noop,
    /// Free-form log text
    Log { text: String },
    /// Non-fatal error text
    Error { text: String },
    /// Score patch
    Patch {
        #[arg(long)]
        score: f64,
        #[arg(long)]
        status: String,
        #[arg(long, default_value = "")]
        message: String,
    },
    /// Result detail
    Detail {
        #[arg(long)]
        summary: String,
        /// Extra fields as a JSON object
        #[arg(long)]
        data: Option<String>,
    },
    /// Grading is finished
    Complete,
    /// Stop reading sandbox output
    Quit,
}

/// Register this host as a runner and print the issued credentials
pub async fn register(
    config: &Config,
    name: String,
    labels: Vec<String>,
    token: String,
) -> Result<()> {
    let client = AoiClient::anonymous(&config.endpoint, config.http_timeout)?;
    let registration = registration(name, labels, token)?;

    println!("📝 Registering runner {:?} at {}", registration.name, config.endpoint);
    let credentials = client.register(&registration).await?;

    println!("✅ Runner registered. Add these to the worker environment:");
    println!("RUNNER_ID={}", credentials.runner_id);
    println!("RUNNER_KEY={}", credentials.runner_key);
    Ok(())
}

fn registration(name: String, labels: Vec<String>, token: String) -> Result<RunnerRegistration> {
    if name.trim().is_empty() {
        bail!("--name must not be empty");
    }
    if token.trim().is_empty() {
        bail!("--token must not be empty");
    }
    Ok(RunnerRegistration {
        name,
        labels,
        version: env!("CARGO_PKG_VERSION").to_string(),
        registration_token: token,
    })
}

/// Poll once with the configured runner credentials
pub async fn poll_once(config: &Config) -> Result<()> {
    let (runner_id, runner_key) = config.credentials()?;
    let client = AoiClient::new(&config.endpoint, runner_id, runner_key, config.http_timeout)?;

    match client.poll().await? {
        Some(poll) => println!("{}", serde_json::to_string_pretty(&poll)?),
        None => println!("No pending solution."),
    }
    Ok(())
}

pub async fn show_slots(config: &Config, reset: bool) -> Result<()> {
    let store = RedisStore::connect(&config.redis_url).await?;

    if reset {
        store
            .set(SLOTS_USED_KEY, "0")
            .await
            .context("Failed to reset slot counter")?;
        println!("✅ Slot counter reset");
    }

    let usage = slot_usage(&store).await?;
    println!("📊 Slots: {}/{} in use", usage.used, usage.limit);
    Ok(())
}

pub async fn list_sessions(config: &Config) -> Result<()> {
    let store = RedisStore::connect(&config.redis_url).await?;
    let keys = store.scan(SESSION_PREFIX).await?;

    if keys.is_empty() {
        println!("No sessions in flight.");
        return Ok(());
    }

    let now = Utc::now();
    println!(
        "{:<38} {:<30} {:<28} {:>8} {:>8}",
        "SESSION", "SOLUTION", "WORKER", "AGE", "TIMEOUT"
    );
    println!("{}", "─".repeat(116));

    for key in &keys {
        let Some(session_id) = session_id_from_key(key) else {
            continue;
        };
        let Some(raw) = store.get(key).await? else {
            continue;
        };
        match serde_json::from_str::<Heartbeat>(&raw) {
            Ok(heartbeat) => println!(
                "{:<38} {:<30} {:<28} {:>8} {:>7}s",
                session_id,
                heartbeat.solution.to_string(),
                heartbeat.worker,
                format_age(now, heartbeat.at),
                heartbeat.timeout_secs
            ),
            Err(_) => println!("{:<38} <undecodable: {}>", session_id, raw),
        }
    }

    println!("\nTotal: {} session(s)", keys.len());
    Ok(())
}

/// The protocol line for `action`
pub fn emit(action: EmitAction) -> Result<String> {
    Ok(Message::new(payload(action)?).encode())
}

fn payload(action: EmitAction) -> Result<Payload> {
    Ok(match action {
        EmitAction::Greet => Payload::Greet,
        EmitAction::Noop => Payload::Noop,
        EmitAction::Log { text } => Payload::Log(text),
        EmitAction::Error { text } => Payload::Error(text),
        EmitAction::Patch {
            score,
            status,
            message,
        } => Payload::Patch(SolutionInfo {
            score,
            status,
            message,
        }),
        EmitAction::Detail { summary, data } => {
            let mut details = SolutionDetails::summary(summary);
            if let Some(data) = data {
                match serde_json::from_str::<Value>(&data).context("--data is not valid JSON")? {
                    Value::Object(fields) => details.extra = fields,
                    _ => bail!("--data must be a JSON object"),
                }
                details.extra.remove("summary");
            }
            Payload::Detail(details)
        }
        EmitAction::Complete => Payload::Complete,
        EmitAction::Quit => Payload::Quit,
    })
}

/// Compact age like `42s`, `3m05s` or `2h10m`
fn format_age(now: DateTime<Utc>, at: DateTime<Utc>) -> String {
    let secs = now.signed_duration_since(at).num_seconds().max(0);
    match secs {
        s if s < 60 => format!("{}s", s),
        s if s < 3600 => format!("{}m{:02}s", s / 60, s % 60),
        s => format!("{}h{:02}m", s / 3600, (s % 3600) / 60),
    }
}
