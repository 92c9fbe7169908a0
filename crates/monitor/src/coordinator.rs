//! Subscription facade.
//!
//! [`SubscriptionCoordinator`] is the single entry point for callers. It
//! owns one [`Subscription`] record per execution id, opens a push
//! channel and registers the execution with the poller, and filters every
//! event through the execution's status state machine before it reaches
//! the caller's [`ExecutionHandlers`].
//!
//! Once an execution reaches a terminal status its channel is closed, its
//! polling stops, and later reports for it are ignored until it is
//! subscribed again.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};

use chrono::Utc;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use flowwatch_core::execution::{
    is_temporary_execution_id, validate_execution_id, ExecutionStatus,
};
use flowwatch_core::types::{ExecutionId, Timestamp};

use crate::api::{ExecutionApi, StatusSource};
use crate::config::MonitorConfig;
use crate::connection::{CloseReason, ConnectionManager};
use crate::events::{completion_status, EventSink, ExecutionEvent, TransportEvent, TransportState};
use crate::handlers::ExecutionHandlers;
use crate::lock;
use crate::poller::{PollGuardState, PollingFallback};
use crate::transport::{PushTransport, WsTransport};

/// Errors returned to callers of the coordinator.
#[derive(Debug, thiserror::Error)]
pub enum MonitorError {
    #[error("Invalid execution id: {0:?}")]
    InvalidExecutionId(String),

    #[error("Execution id {0} is temporary and cannot be monitored")]
    TemporaryExecutionId(String),

    #[error("Monitor has been shut down")]
    ShutDown,
}

/// Which sources feed a subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackingMode {
    Push,
    Poll,
    Both,
}

/// Snapshot of one subscription's state.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Subscription {
    pub execution_id: ExecutionId,
    pub mode: TrackingMode,
    pub status: ExecutionStatus,
    /// Reconnect attempts since the push channel was last open.
    pub retry_count: u32,
    /// When the last event for this execution was accepted.
    pub last_seen_at: Option<Timestamp>,
    pub transport: TransportState,
}

struct Entry {
    subscription_id: Uuid,
    record: Subscription,
    handlers: ExecutionHandlers,
    connection: Option<ConnectionManager>,
    /// Cancelled on teardown; every sink checks it before delivering.
    gate: CancellationToken,
}

impl Entry {
    /// Close the channel and stop delivery without waiting.
    fn halt(&mut self, reason: CloseReason) {
        if let Some(connection) = self.connection.as_mut() {
            connection.close(reason);
        }
        self.gate.cancel();
        self.record.transport = TransportState::Disconnected;
    }
}

struct CoordinatorInner {
    subscriptions: Mutex<HashMap<ExecutionId, Entry>>,
    poller: PollingFallback,
}

/// Entry point for monitoring executions.
pub struct SubscriptionCoordinator {
    config: MonitorConfig,
    transport: Arc<dyn PushTransport>,
    inner: Arc<CoordinatorInner>,
    cancel: CancellationToken,
}

impl SubscriptionCoordinator {
    /// Create a coordinator over explicit transport and status source.
    pub fn new(
        config: MonitorConfig,
        transport: Arc<dyn PushTransport>,
        source: Arc<dyn StatusSource>,
    ) -> Self {
        let cancel = CancellationToken::new();
        let poller = PollingFallback::new(config.poll.clone(), source, &cancel);
        Self {
            config,
            transport,
            inner: Arc::new(CoordinatorInner {
                subscriptions: Mutex::new(HashMap::new()),
                poller,
            }),
            cancel,
        }
    }

    /// Create a coordinator that talks WebSocket and HTTP to the
    /// configured server.
    pub fn from_config(config: MonitorConfig) -> Self {
        let source = Arc::new(ExecutionApi::new(config.api_url.clone()));
        Self::new(config, Arc::new(WsTransport), source)
    }

    pub fn config(&self) -> &MonitorConfig {
        &self.config
    }

    /// Start monitoring `execution_id`.
    ///
    /// Any existing subscription for the same id is torn down first, so at
    /// most one channel per execution is ever live. A push channel that
    /// cannot be constructed is reported once through `on_error` and the
    /// subscription continues on polling alone.
    pub async fn subscribe(
        &self,
        execution_id: impl Into<ExecutionId>,
        handlers: ExecutionHandlers,
    ) -> Result<SubscriptionHandle, MonitorError> {
        let execution_id = execution_id.into();
        if self.cancel.is_cancelled() {
            return Err(MonitorError::ShutDown);
        }
        validate_execution_id(&execution_id)
            .map_err(|_| MonitorError::InvalidExecutionId(execution_id.clone()))?;
        if is_temporary_execution_id(&execution_id) {
            return Err(MonitorError::TemporaryExecutionId(execution_id));
        }

        if self
            .inner
            .remove(&execution_id, None, CloseReason::Replaced)
            .await
        {
            tracing::debug!(execution_id = %execution_id, "Replaced existing subscription");
        }

        let mode = match (self.config.enable_push, self.config.enable_polling) {
            (true, true) => TrackingMode::Both,
            (true, false) => TrackingMode::Push,
            (false, _) => TrackingMode::Poll,
        };
        let subscription_id = Uuid::new_v4();
        let gate = self.cancel.child_token();
        let sink: Arc<dyn EventSink> = Arc::new(TrackedSink {
            execution_id: execution_id.clone(),
            subscription_id,
            gate: gate.clone(),
            inner: Arc::downgrade(&self.inner),
        });

        // The entry must exist before the channel opens: construction
        // failures are reported through the sink.
        lock(&self.inner.subscriptions).insert(
            execution_id.clone(),
            Entry {
                subscription_id,
                record: Subscription {
                    execution_id: execution_id.clone(),
                    mode,
                    status: ExecutionStatus::Pending,
                    retry_count: 0,
                    last_seen_at: None,
                    transport: TransportState::Disconnected,
                },
                handlers,
                connection: None,
                gate: gate.clone(),
            },
        );

        if mode != TrackingMode::Push {
            self.inner.poller.track(&execution_id, Arc::clone(&sink));
            self.inner.poller.start();
        }

        if mode != TrackingMode::Poll {
            let mut connection = ConnectionManager::new(
                execution_id.clone(),
                self.config.channel_url(&execution_id),
                Arc::clone(&self.transport),
                self.config.reconnect.clone(),
                &gate,
            );
            // Failure was already surfaced through the sink.
            let _ = connection.open(Arc::clone(&sink));

            let mut subscriptions = lock(&self.inner.subscriptions);
            match subscriptions.get_mut(&execution_id) {
                Some(entry) if entry.subscription_id == subscription_id => {
                    entry.connection = Some(connection);
                }
                _ => connection.close(CloseReason::Replaced),
            }
        }

        tracing::info!(
            execution_id = %execution_id,
            subscription_id = %subscription_id,
            mode = ?mode,
            "Subscribed to execution",
        );

        Ok(SubscriptionHandle {
            execution_id,
            subscription_id,
            inner: Arc::downgrade(&self.inner),
        })
    }

    /// Stop monitoring `execution_id`. Returns whether it was subscribed.
    ///
    /// No handler for the execution runs after this returns.
    pub async fn unsubscribe(&self, execution_id: &str) -> bool {
        let removed = self
            .inner
            .remove(execution_id, None, CloseReason::Unsubscribed)
            .await;
        if removed {
            tracing::info!(execution_id, "Unsubscribed from execution");
        }
        removed
    }

    /// Snapshot of the subscription for `execution_id`.
    pub fn subscription(&self, execution_id: &str) -> Option<Subscription> {
        lock(&self.inner.subscriptions)
            .get(execution_id)
            .map(|entry| entry.record.clone())
    }

    /// Number of subscriptions whose execution has not finished.
    pub fn active_count(&self) -> usize {
        lock(&self.inner.subscriptions)
            .values()
            .filter(|entry| !entry.record.status.is_terminal())
            .count()
    }

    /// Poller guard state for `execution_id`, if it is being polled.
    pub fn poll_guard_state(&self, execution_id: &str) -> Option<PollGuardState> {
        self.inner.poller.guard_state(execution_id)
    }

    /// Tear down every subscription and stop the poller.
    ///
    /// Later calls to [`subscribe`](Self::subscribe) fail with
    /// [`MonitorError::ShutDown`].
    pub async fn shutdown(&self) {
        let mut entries: Vec<Entry> = lock(&self.inner.subscriptions)
            .drain()
            .map(|(_, entry)| entry)
            .collect();

        for entry in &mut entries {
            entry.halt(CloseReason::Shutdown);
        }
        self.cancel.cancel();
        self.inner.poller.stop_and_wait().await;

        for entry in &mut entries {
            if let Some(connection) = entry.connection.as_mut() {
                connection.close_and_wait(CloseReason::Shutdown).await;
            }
        }
        tracing::info!(subscriptions = entries.len(), "Execution monitor shut down");
    }
}

impl Drop for SubscriptionCoordinator {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Returned by [`SubscriptionCoordinator::subscribe`].
///
/// Unsubscribing through a handle only removes the subscription it was
/// issued for, never one that replaced it.
#[derive(Debug, Clone)]
pub struct SubscriptionHandle {
    execution_id: ExecutionId,
    subscription_id: Uuid,
    inner: Weak<CoordinatorInner>,
}

impl SubscriptionHandle {
    pub fn execution_id(&self) -> &str {
        &self.execution_id
    }

    pub fn subscription_id(&self) -> Uuid {
        self.subscription_id
    }

    /// Stop monitoring. Returns `false` if the subscription was already
    /// gone or replaced.
    pub async fn unsubscribe(self) -> bool {
        let Some(inner) = self.inner.upgrade() else {
            return false;
        };
        inner
            .remove(
                &self.execution_id,
                Some(self.subscription_id),
                CloseReason::Unsubscribed,
            )
            .await
    }
}

// ---------------------------------------------------------------------------
// Event filtering
// ---------------------------------------------------------------------------

/// What to do with one accepted event.
struct Accepted {
    handlers: ExecutionHandlers,
    terminal: bool,
}

impl CoordinatorInner {
    /// Remove the subscription for `execution_id`, optionally only if it is
    /// still `expected`, and wait for its channel task to stop.
    async fn remove(
        &self,
        execution_id: &str,
        expected: Option<Uuid>,
        reason: CloseReason,
    ) -> bool {
        let entry = {
            let mut subscriptions = lock(&self.subscriptions);
            let matches = subscriptions
                .get(execution_id)
                .is_some_and(|entry| expected.map_or(true, |id| id == entry.subscription_id));
            if matches {
                subscriptions.remove(execution_id)
            } else {
                None
            }
        };
        let Some(mut entry) = entry else {
            return false;
        };

        entry.halt(reason);
        self.poller.untrack(execution_id);
        if let Some(connection) = entry.connection.as_mut() {
            connection.close_and_wait(reason).await;
        }
        true
    }

    /// Update the record for an incoming event and decide whether it is
    /// delivered.
    fn accept(
        &self,
        execution_id: &str,
        subscription_id: Uuid,
        event: &ExecutionEvent,
    ) -> Option<Accepted> {
        let mut subscriptions = lock(&self.subscriptions);
        let entry = subscriptions
            .get_mut(execution_id)
            .filter(|entry| entry.subscription_id == subscription_id)?;

        let current = entry.record.status;
        if current.is_terminal() {
            tracing::debug!(
                execution_id,
                status = %current,
                handler = event.handler_name(),
                "Ignoring event for finished execution",
            );
            return None;
        }

        let next = match event {
            ExecutionEvent::Status(raw) => match raw.parse::<ExecutionStatus>() {
                Ok(next) => match current.transition_to(next) {
                    Ok(next) => Some(next),
                    Err(e) => {
                        tracing::debug!(execution_id, error = %e, "Ignoring stale status");
                        return None;
                    }
                },
                Err(_) => {
                    tracing::debug!(execution_id, status = %raw, "Unrecognised status, forwarding as-is");
                    None
                }
            },
            ExecutionEvent::Completion(result) => Some(completion_status(result)),
            _ => None,
        };

        if let Some(next) = next {
            if next != current {
                tracing::debug!(execution_id, from = %current, to = %next, "Execution status changed");
            }
            entry.record.status = next;
        }
        entry.record.last_seen_at = Some(Utc::now());

        Some(Accepted {
            handlers: entry.handlers.clone(),
            terminal: entry.record.status.is_terminal(),
        })
    }

    /// Terminal teardown: close the channel and stop polling, keeping the
    /// record so callers can read the final status.
    fn finish(&self, execution_id: &str, subscription_id: Uuid) {
        {
            let mut subscriptions = lock(&self.subscriptions);
            match subscriptions.get_mut(execution_id) {
                Some(entry) if entry.subscription_id == subscription_id => {
                    entry.halt(CloseReason::ExecutionFinished);
                }
                _ => return,
            }
        }
        self.poller.untrack(execution_id);
        tracing::info!(execution_id, "Execution finished, monitoring stopped");
    }

    fn fold_transport(&self, execution_id: &str, subscription_id: Uuid, event: TransportEvent) {
        let mut subscriptions = lock(&self.subscriptions);
        let Some(entry) = subscriptions
            .get_mut(execution_id)
            .filter(|entry| entry.subscription_id == subscription_id)
        else {
            return;
        };
        let record = &mut entry.record;

        match event {
            TransportEvent::Connected => {
                record.transport = TransportState::Connected;
                record.retry_count = 0;
            }
            TransportEvent::Disconnected => {
                record.transport = TransportState::Disconnected;
            }
            TransportEvent::Reconnecting { attempt, .. } => {
                record.retry_count = attempt;
            }
            TransportEvent::GaveUp => {
                record.transport = TransportState::Disconnected;
                if record.mode == TrackingMode::Both {
                    record.mode = TrackingMode::Poll;
                    tracing::info!(execution_id, "Push channel unavailable, continuing on polling");
                }
            }
        }
    }
}

/// Sink handed to the connection and the poller for one subscription.
struct TrackedSink {
    execution_id: ExecutionId,
    subscription_id: Uuid,
    gate: CancellationToken,
    inner: Weak<CoordinatorInner>,
}

impl EventSink for TrackedSink {
    fn deliver(&self, event: ExecutionEvent) {
        if self.gate.is_cancelled() {
            return;
        }
        let Some(inner) = self.inner.upgrade() else {
            return;
        };
        let Some(accepted) = inner.accept(&self.execution_id, self.subscription_id, &event) else {
            return;
        };

        if let ExecutionEvent::Status(status) = &event {
            inner.poller.observe_status(&self.execution_id, status);
        }
        accepted.handlers.invoke(event);

        if accepted.terminal {
            inner.finish(&self.execution_id, self.subscription_id);
        }
    }

    fn transport_changed(&self, event: TransportEvent) {
        if self.gate.is_cancelled() {
            return;
        }
        if let Some(inner) = self.inner.upgrade() {
            inner.fold_transport(&self.execution_id, self.subscription_id, event);
        }
    }
}
