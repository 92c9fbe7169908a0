//! Push-channel message types and parser.
//!
//! The execution server sends JSON text frames of the shape
//! `{"type": "<kind>", "execution_id": "...", ...}` where the remaining
//! fields depend on the kind. This module deserializes them into a
//! strongly-typed [`InboundMessage`] enum. Payload fields are optional at
//! this layer; the dispatcher decides which combinations produce a
//! handler call.

use serde::{Deserialize, Serialize};

/// All known push-channel message kinds.
///
/// Deserialized via the internally-tagged `"type"` field.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InboundMessage {
    /// A log line emitted by the running execution.
    Log {
        #[serde(default)]
        execution_id: Option<String>,
        #[serde(default)]
        log: Option<LogEntry>,
    },

    /// The execution changed status (`running`, `paused`, ...).
    Status {
        #[serde(default)]
        execution_id: Option<String>,
        #[serde(default)]
        status: Option<String>,
    },

    /// One node of the workflow changed state.
    NodeUpdate {
        #[serde(default)]
        execution_id: Option<String>,
        #[serde(default)]
        node_id: Option<serde_json::Value>,
        #[serde(default)]
        node_state: Option<serde_json::Value>,
    },

    /// The execution finished and produced a result.
    Completion {
        #[serde(default)]
        execution_id: Option<String>,
        #[serde(default)]
        result: serde_json::Value,
    },

    /// The execution reported an error.
    Error {
        #[serde(default)]
        execution_id: Option<String>,
        #[serde(default)]
        error: Option<String>,
    },
}

impl InboundMessage {
    /// The execution this frame belongs to, when the server included it.
    pub fn execution_id(&self) -> Option<&str> {
        match self {
            Self::Log { execution_id, .. }
            | Self::Status { execution_id, .. }
            | Self::NodeUpdate { execution_id, .. }
            | Self::Completion { execution_id, .. }
            | Self::Error { execution_id, .. } => execution_id.as_deref(),
        }
    }

    /// Wire name of the variant, for log context.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Log { .. } => "log",
            Self::Status { .. } => "status",
            Self::NodeUpdate { .. } => "node_update",
            Self::Completion { .. } => "completion",
            Self::Error { .. } => "error",
        }
    }
}

/// A single log line. Shared by push frames and poll snapshots.
///
/// Text fields are read leniently: `null` is treated as absent and
/// numeric values (epoch timestamps, numeric levels) are kept as text, so
/// a present `log` payload is never dropped over a field type.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    #[serde(default, deserialize_with = "lenient_text")]
    pub timestamp: Option<String>,
    #[serde(default, deserialize_with = "lenient_text")]
    pub level: Option<String>,
    #[serde(default, deserialize_with = "lenient_message")]
    pub message: String,
    /// Node that emitted the line, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_id: Option<String>,
}

fn lenient_text<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let value = Option::<serde_json::Value>::deserialize(deserializer)?;
    Ok(match value {
        Some(serde_json::Value::String(text)) => Some(text),
        Some(serde_json::Value::Number(n)) => Some(n.to_string()),
        Some(serde_json::Value::Bool(b)) => Some(b.to_string()),
        _ => None,
    })
}

fn lenient_message<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: serde::Deserializer<'de>,
{
    Ok(lenient_text(deserializer)?.unwrap_or_default())
}

/// Parse a push-channel text frame into a typed enum.
///
/// Returns `Err` for malformed JSON, non-object payloads, or unknown
/// `type` values. Callers should log the error and continue.
pub fn parse_message(text: &str) -> Result<InboundMessage, serde_json::Error> {
    serde_json::from_str(text)
}
