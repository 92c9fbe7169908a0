//! Caller-supplied callback set for one subscription.
//!
//! [`ExecutionHandlers`] is a plain struct of optional callbacks built
//! with chained setters:
//!
//! ```rust
//! use flowwatch_monitor::handlers::ExecutionHandlers;
//!
//! let handlers = ExecutionHandlers::new()
//!     .on_status(|status| println!("status: {status}"))
//!     .on_error(|error| eprintln!("error: {error}"));
//! ```
//!
//! Every invocation is isolated: a panicking callback is caught, logged,
//! and does not affect later deliveries.

use std::any::Any;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use crate::events::{EventSink, ExecutionEvent};
use crate::messages::LogEntry;

type LogFn = Arc<dyn Fn(LogEntry) + Send + Sync>;
type TextFn = Arc<dyn Fn(String) + Send + Sync>;
type NodeFn = Arc<dyn Fn(String, serde_json::Value) + Send + Sync>;
type ValueFn = Arc<dyn Fn(serde_json::Value) + Send + Sync>;

/// Optional callbacks invoked for resolved [`ExecutionEvent`]s.
#[derive(Clone, Default)]
pub struct ExecutionHandlers {
    on_log: Option<LogFn>,
    on_status: Option<TextFn>,
    on_node_update: Option<NodeFn>,
    on_completion: Option<ValueFn>,
    on_error: Option<TextFn>,
}

impl ExecutionHandlers {
    /// A handler set with no callbacks registered.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_log(mut self, f: impl Fn(LogEntry) + Send + Sync + 'static) -> Self {
        self.on_log = Some(Arc::new(f));
        self
    }

    pub fn on_status(mut self, f: impl Fn(String) + Send + Sync + 'static) -> Self {
        self.on_status = Some(Arc::new(f));
        self
    }

    /// Called with the resolved node id and the raw node-state payload.
    pub fn on_node_update(
        mut self,
        f: impl Fn(String, serde_json::Value) + Send + Sync + 'static,
    ) -> Self {
        self.on_node_update = Some(Arc::new(f));
        self
    }

    pub fn on_completion(mut self, f: impl Fn(serde_json::Value) + Send + Sync + 'static) -> Self {
        self.on_completion = Some(Arc::new(f));
        self
    }

    pub fn on_error(mut self, f: impl Fn(String) + Send + Sync + 'static) -> Self {
        self.on_error = Some(Arc::new(f));
        self
    }

    /// Route `event` to its callback.
    ///
    /// Returns `false` only when the callback panicked. A missing callback
    /// is not an error.
    pub fn invoke(&self, event: ExecutionEvent) -> bool {
        let handler = event.handler_name();
        let outcome = catch_unwind(AssertUnwindSafe(|| match event {
            ExecutionEvent::Log(entry) => {
                if let Some(f) = &self.on_log {
                    f(entry);
                }
            }
            ExecutionEvent::Status(status) => {
                if let Some(f) = &self.on_status {
                    f(status);
                }
            }
            ExecutionEvent::NodeUpdate {
                node_id,
                node_state,
            } => {
                if let Some(f) = &self.on_node_update {
                    f(node_id, node_state);
                }
            }
            ExecutionEvent::Completion(result) => {
                if let Some(f) = &self.on_completion {
                    f(result);
                }
            }
            ExecutionEvent::Error(error) => {
                if let Some(f) = &self.on_error {
                    f(error);
                }
            }
        }));

        match outcome {
            Ok(()) => true,
            Err(payload) => {
                tracing::error!(
                    handler,
                    panic = %panic_message(payload.as_ref()),
                    "Execution handler panicked",
                );
                false
            }
        }
    }
}

impl EventSink for ExecutionHandlers {
    fn deliver(&self, event: ExecutionEvent) {
        self.invoke(event);
    }
}

impl fmt::Debug for ExecutionHandlers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecutionHandlers")
            .field("on_log", &self.on_log.is_some())
            .field("on_status", &self.on_status.is_some())
            .field("on_node_update", &self.on_node_update.is_some())
            .field("on_completion", &self.on_completion.is_some())
            .field("on_error", &self.on_error.is_some())
            .finish()
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "<non-string panic payload>".to_string()
    }
}
