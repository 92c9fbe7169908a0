//! Resolved execution events and transport lifecycle events.
//!
//! [`ExecutionEvent`]s are what the dispatcher and the poller produce
//! after interpreting raw input; they map one-to-one onto the handler
//! callbacks. [`TransportEvent`]s describe the push channel itself and
//! never reach the caller's handlers.

use std::time::Duration;

use flowwatch_core::execution::ExecutionStatus;
use serde::{Deserialize, Serialize};

use crate::messages::LogEntry;

/// A fully-resolved update for one execution.
///
/// Serialized adjacently tagged: `{"type": "status", "payload": "running"}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum ExecutionEvent {
    Log(LogEntry),
    Status(String),
    NodeUpdate {
        node_id: String,
        node_state: serde_json::Value,
    },
    Completion(serde_json::Value),
    Error(String),
}

impl ExecutionEvent {
    /// Handler name this event is routed to, for log context.
    pub fn handler_name(&self) -> &'static str {
        match self {
            Self::Log(_) => "on_log",
            Self::Status(_) => "on_status",
            Self::NodeUpdate { .. } => "on_node_update",
            Self::Completion(_) => "on_completion",
            Self::Error(_) => "on_error",
        }
    }
}

/// Terminal status announced by a completion result.
///
/// A failed run still ends with a completion frame, carrying
/// `result.status = "failed"`. Anything that is not a terminal status
/// counts as a successful finish.
pub fn completion_status(result: &serde_json::Value) -> ExecutionStatus {
    result
        .get("status")
        .and_then(serde_json::Value::as_str)
        .and_then(|raw| raw.parse::<ExecutionStatus>().ok())
        .filter(|status| status.is_terminal())
        .unwrap_or(ExecutionStatus::Completed)
}

/// Lifecycle of a push channel as seen by its owner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// The channel finished its handshake.
    Connected,
    /// The channel closed; a reconnect may follow.
    Disconnected,
    /// A reconnect attempt is scheduled after `delay`.
    Reconnecting { attempt: u32, delay: Duration },
    /// The channel will not be reopened (budget exhausted, construction
    /// failure, or a clean server-side close).
    GaveUp,
}

/// Orthogonal transport state overlaying the execution status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportState {
    Connected,
    Disconnected,
}

/// Destination for events resolved from one execution's inputs.
///
/// Implemented by [`ExecutionHandlers`](crate::handlers::ExecutionHandlers)
/// for direct delivery and by the coordinator, which filters stale
/// updates before forwarding them.
pub trait EventSink: Send + Sync {
    /// Deliver one resolved event.
    fn deliver(&self, event: ExecutionEvent);

    /// Observe a push-channel lifecycle change.
    fn transport_changed(&self, _event: TransportEvent) {}
}
