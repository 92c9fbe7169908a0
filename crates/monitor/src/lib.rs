//! Live execution monitoring client.
//!
//! Keeps the status of remote, long-running executions in sync by
//! multiplexing a WebSocket push channel with a REST polling fallback.
//! Provides typed message parsing, push-channel lifecycle management with
//! reconnection, a bounded status poller, and the
//! [`SubscriptionCoordinator`] facade that callers subscribe through.

use std::sync::{Mutex, MutexGuard, PoisonError};

pub mod api;
pub mod config;
pub mod connection;
pub mod coordinator;
pub mod dispatcher;
pub mod events;
pub mod handlers;
pub mod messages;
pub mod poller;
pub mod reconnect;
pub mod transport;

pub use config::MonitorConfig;
pub use coordinator::{
    MonitorError, Subscription, SubscriptionCoordinator, SubscriptionHandle, TrackingMode,
};
pub use handlers::ExecutionHandlers;

/// Lock a mutex, recovering the data if a previous holder panicked.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
