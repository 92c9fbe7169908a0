//! Push-channel frame dispatch.
//!
//! Turns one raw text frame into zero or one [`ExecutionEvent`] and hands
//! it to an [`EventSink`]. Parsing failures and frames that lack the
//! payload their kind requires are dropped here; nothing in this module
//! panics or returns an error to the channel loop.

use crate::events::{EventSink, ExecutionEvent};
use crate::messages::{parse_message, InboundMessage};

/// Parse `text` and deliver the resolved event, if any, to `sink`.
///
/// Returns `true` when an event was delivered.
pub fn dispatch(text: &str, sink: &dyn EventSink) -> bool {
    let message = match parse_message(text) {
        Ok(message) => message,
        Err(e) => {
            tracing::warn!(
                error = %e,
                raw_message = %text,
                "Failed to parse execution message",
            );
            return false;
        }
    };

    let kind = message.kind();
    match resolve(message) {
        Some(event) => {
            sink.deliver(event);
            true
        }
        None => {
            tracing::debug!(kind, "Execution message carried no deliverable payload");
            false
        }
    }
}

/// Map a parsed message onto the event its handler receives.
///
/// | kind          | requires                                   |
/// |---------------|--------------------------------------------|
/// | `log`         | `log` present                              |
/// | `status`      | `status` present                           |
/// | `node_update` | `node_state` present and a truthy node id  |
/// | `completion`  | nothing                                    |
/// | `error`       | `error` present                            |
pub fn resolve(message: InboundMessage) -> Option<ExecutionEvent> {
    match message {
        InboundMessage::Log { log, .. } => log.map(ExecutionEvent::Log),
        InboundMessage::Status { status, .. } => status.map(ExecutionEvent::Status),
        InboundMessage::NodeUpdate {
            node_id,
            node_state,
            ..
        } => {
            let node_state = node_state.filter(|state| !state.is_null())?;
            let node_id = resolve_node_id(node_id.as_ref(), &node_state)?;
            Some(ExecutionEvent::NodeUpdate {
                node_id,
                node_state,
            })
        }
        InboundMessage::Completion { result, .. } => Some(ExecutionEvent::Completion(result)),
        InboundMessage::Error { error, .. } => error.map(ExecutionEvent::Error),
    }
}

/// A top-level `node_id` wins when truthy; otherwise `node_state.node_id`.
pub fn resolve_node_id(
    top_level: Option<&serde_json::Value>,
    node_state: &serde_json::Value,
) -> Option<String> {
    top_level
        .and_then(truthy_id)
        .or_else(|| node_state.get("node_id").and_then(truthy_id))
}

/// Node ids arrive as strings, occasionally as numbers. Empty strings,
/// zero, `null` and non-scalar values do not identify a node.
fn truthy_id(value: &serde_json::Value) -> Option<String> {
    match value {
        serde_json::Value::String(s) if !s.is_empty() => Some(s.clone()),
        serde_json::Value::Number(n) if n.as_f64().is_some_and(|f| f != 0.0) => {
            Some(n.to_string())
        }
        _ => None,
    }
}
