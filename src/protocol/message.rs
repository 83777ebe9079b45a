//! Wire envelopes exchanged between the host and strategy sandboxes.
//!
//! Every message is a JSON object `{ "type": ..., "systemId": ..., ...payload }`.
//! Receivers must never fail hard on bad input: [`Message::parse`] returns a
//! [`ProtocolError`] and callers log and drop.

use std::fmt;

use serde::de::{self, Deserializer};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

/// Message types understood by either side of the channel.
const KNOWN_TYPES: [&str; 8] = [
    "run", "stop", "log", "metric", "order", "error", "tick", "stopped",
];

/// Opaque session identifier supplied by the host at `run` time.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SystemId(String);

impl SystemId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SystemId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<&str> for SystemId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for SystemId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// Payload of a `run` command.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunRequest {
    pub system_id: SystemId,

    /// Strategy source (WebAssembly text format)
    pub source: String,

    /// Strategy parameters, handed to the strategy read-only
    #[serde(default)]
    pub config: Map<String, Value>,

    /// Descriptive metadata, passed through untouched
    #[serde(default)]
    pub meta: Value,
}

/// Which side of the channel originates a message type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    HostToSandbox,
    SandboxToHost,
}

/// A protocol envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase", rename_all_fields = "camelCase")]
pub enum Message {
    /// Start a session.
    Run(RunRequest),

    /// Request a graceful halt.
    Stop { system_id: SystemId },

    /// Human-readable trace line.
    Log {
        system_id: SystemId,
        msg: String,
        #[serde(default)]
        tick_count: u64,
    },

    /// Point-in-time measurement (e.g. running P&L).
    Metric {
        system_id: SystemId,
        #[serde(deserialize_with = "numeric_like")]
        pnl: f64,
        #[serde(default)]
        tick_count: u64,
    },

    /// Order intent for external routing.
    Order {
        system_id: SystemId,
        order: Value,
        #[serde(default)]
        tick_count: u64,
    },

    /// Failure description. `fatal` marks the session as crashed.
    Error {
        system_id: SystemId,
        error: String,
        #[serde(default)]
        fatal: bool,
    },

    /// Progress notification after each completed `onTick` invocation.
    Tick { system_id: SystemId, tick_count: u64 },

    /// Terminal acknowledgment of a stop. Always the last message of a session.
    Stopped { system_id: SystemId },
}

impl Message {
    /// Parse a raw JSON line.
    pub fn parse(raw: &str) -> Result<Self, ProtocolError> {
        let value: Value = serde_json::from_str(raw).map_err(ProtocolError::NotJson)?;
        Self::from_value(value)
    }

    /// Validate and convert an already-decoded JSON value.
    pub fn from_value(value: Value) -> Result<Self, ProtocolError> {
        let kind = match &value {
            Value::Object(map) => match map.get("type") {
                Some(Value::String(kind)) => kind.clone(),
                _ => return Err(ProtocolError::MissingType),
            },
            _ => return Err(ProtocolError::NotObject),
        };

        if !KNOWN_TYPES.contains(&kind.as_str()) {
            return Err(ProtocolError::UnknownType(kind));
        }

        serde_json::from_value(value).map_err(|source| ProtocolError::Malformed { kind, source })
    }

    /// Render as a single JSON line.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn system_id(&self) -> &SystemId {
        match self {
            Message::Run(request) => &request.system_id,
            Message::Stop { system_id }
            | Message::Log { system_id, .. }
            | Message::Metric { system_id, .. }
            | Message::Order { system_id, .. }
            | Message::Error { system_id, .. }
            | Message::Tick { system_id, .. }
            | Message::Stopped { system_id } => system_id,
        }
    }

    /// Wire name of the message type.
    pub fn kind(&self) -> &'static str {
        match self {
            Message::Run(_) => "run",
            Message::Stop { .. } => "stop",
            Message::Log { .. } => "log",
            Message::Metric { .. } => "metric",
            Message::Order { .. } => "order",
            Message::Error { .. } => "error",
            Message::Tick { .. } => "tick",
            Message::Stopped { .. } => "stopped",
        }
    }

    pub fn direction(&self) -> Direction {
        match self {
            Message::Run(_) | Message::Stop { .. } => Direction::HostToSandbox,
            _ => Direction::SandboxToHost,
        }
    }

    /// Whether this is the last message a session will ever emit.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Message::Stopped { .. } | Message::Error { fatal: true, .. }
        )
    }
}

/// Rejected inbound message. Always dropped by the receiver, never fatal.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("message is not valid JSON: {0}")]
    NotJson(#[source] serde_json::Error),

    #[error("message is not a JSON object")]
    NotObject,

    #[error("message has no string `type` field")]
    MissingType,

    #[error("unrecognized message type `{0}`")]
    UnknownType(String),

    #[error("malformed `{kind}` message: {source}")]
    Malformed {
        kind: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("`{0}` messages are not accepted on this channel")]
    WrongDirection(&'static str),
}

/// Interpret a JSON value as a number: numbers, numeric strings and booleans.
pub fn as_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
        _ => None,
    }
}

// Non-finite metrics serialize as `null`; read them back as NaN.
fn numeric_like<'de, D>(deserializer: D) -> Result<f64, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Value::deserialize(deserializer)?;
    match value {
        Value::Null => Ok(f64::NAN),
        other => as_number(&other)
            .ok_or_else(|| de::Error::custom(format!("expected a numeric pnl, got {other}"))),
    }
}
