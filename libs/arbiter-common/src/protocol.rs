/// Progress Protocol - line-oriented messages on a sandbox's stdout
///
/// Every line is one self-contained JSON object:
///
/// ```text
/// {"t": "<rfc3339 timestamp>", "a": "<action tag>", "b": <optional body>}
/// ```
///
/// A line that does not decode is not an error: sandboxes are free to print
/// unrelated diagnostics, which are simply skipped. Order of arrival is the
/// only ordering guarantee.
use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use std::fmt;

use crate::types::{SolutionDetails, SolutionInfo};

/// Closed set of action tags
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Action {
    Greet,
    Noop,
    Error,
    Log,
    Complete,
    Quit,
    Patch,
    Detail,
}

impl Action {
    pub fn all_variants() -> &'static [Action] {
        &[
            Action::Greet,
            Action::Noop,
            Action::Error,
            Action::Log,
            Action::Complete,
            Action::Quit,
            Action::Patch,
            Action::Detail,
        ]
    }

    /// Wire tag
    pub fn tag(self) -> &'static str {
        match self {
            Action::Greet => "0",
            Action::Noop => "n",
            Action::Error => "e",
            Action::Log => "l",
            Action::Complete => "c",
            Action::Quit => "q",
            Action::Patch => "p",
            Action::Detail => "d",
        }
    }

    pub fn from_tag(tag: &str) -> Option<Action> {
        Action::all_variants()
            .iter()
            .copied()
            .find(|action| action.tag() == tag)
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Action::Greet => "greet",
            Action::Noop => "noop",
            Action::Error => "error",
            Action::Log => "log",
            Action::Complete => "complete",
            Action::Quit => "quit",
            Action::Patch => "patch",
            Action::Detail => "detail",
        };
        f.write_str(name)
    }
}

/// Typed body, one case per action.
///
/// `Unknown` holds a tag outside the known set. Consumers must treat it as
/// a no-op.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    Greet,
    Noop,
    Error(String),
    Log(String),
    Complete,
    Quit,
    Patch(SolutionInfo),
    Detail(SolutionDetails),
    Unknown(String),
}

impl Payload {
    pub fn action(&self) -> Option<Action> {
        match self {
            Payload::Greet => Some(Action::Greet),
            Payload::Noop => Some(Action::Noop),
            Payload::Error(_) => Some(Action::Error),
            Payload::Log(_) => Some(Action::Log),
            Payload::Complete => Some(Action::Complete),
            Payload::Quit => Some(Action::Quit),
            Payload::Patch(_) => Some(Action::Patch),
            Payload::Detail(_) => Some(Action::Detail),
            Payload::Unknown(_) => None,
        }
    }

    fn tag(&self) -> &str {
        match self {
            Payload::Unknown(tag) => tag,
            known => known.action().map(Action::tag).unwrap_or_default(),
        }
    }

    fn body(&self) -> Option<Value> {
        match self {
            Payload::Error(text) | Payload::Log(text) => Some(Value::String(text.clone())),
            Payload::Patch(info) => serde_json::to_value(info).ok(),
            Payload::Detail(details) => serde_json::to_value(details).ok(),
            _ => None,
        }
    }
}

/// A decoded progress message
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub time: DateTime<Utc>,
    pub payload: Payload,
}

#[derive(Serialize, Deserialize)]
struct WireMessage {
    #[serde(
        default,
        deserialize_with = "lenient_time",
        skip_serializing_if = "Option::is_none"
    )]
    t: Option<DateTime<Utc>>,
    a: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    b: Option<Value>,
}

/// Timestamps are informational only; one that fails to parse must not
/// cost us the message.
fn lenient_time<'de, D>(deserializer: D) -> Result<Option<DateTime<Utc>>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = Option::<Value>::deserialize(deserializer)?;
    Ok(match raw {
        Some(Value::String(s)) => DateTime::parse_from_rfc3339(&s)
            .ok()
            .map(|t| t.with_timezone(&Utc)),
        _ => None,
    })
}

impl Message {
    /// Stamp a payload with the current time
    pub fn new(payload: Payload) -> Self {
        Self {
            time: Utc::now(),
            payload,
        }
    }

    /// Encode as exactly one line (no trailing newline)
    pub fn encode(&self) -> String {
        let wire = WireMessage {
            t: Some(self.time),
            a: self.payload.tag().to_string(),
            b: self.payload.body(),
        };
        serde_json::to_string(&wire).unwrap_or_else(|_| {
            format!(
                r#"{{"t":"{}","a":"e","b":"failed to encode message"}}"#,
                Utc::now().to_rfc3339()
            )
        })
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.encode())
    }
}

/// Decode one line of sandbox output.
///
/// Returns `None` for anything that is not a well-formed message: invalid
/// JSON, a missing action tag, or a body whose shape does not match its
/// action.
pub fn decode_line(line: &str) -> Option<Message> {
    let line = line.trim();
    if !line.starts_with('{') {
        return None;
    }

    let wire: WireMessage = serde_json::from_str(line).ok()?;
    let time = wire.t.unwrap_or_else(Utc::now);

    let payload = match Action::from_tag(&wire.a) {
        None => Payload::Unknown(wire.a),
        Some(Action::Greet) => Payload::Greet,
        Some(Action::Noop) => Payload::Noop,
        Some(Action::Complete) => Payload::Complete,
        Some(Action::Quit) => Payload::Quit,
        Some(Action::Error) => Payload::Error(text_body(wire.b)?),
        Some(Action::Log) => Payload::Log(text_body(wire.b)?),
        Some(Action::Patch) => Payload::Patch(serde_json::from_value(wire.b?).ok()?),
        Some(Action::Detail) => Payload::Detail(serde_json::from_value(wire.b?).ok()?),
    };

    Some(Message { time, payload })
}

fn text_body(body: Option<Value>) -> Option<String> {
    match body {
        None | Some(Value::Null) => Some(String::new()),
        Some(Value::String(text)) => Some(text),
        Some(_) => None,
    }
}
