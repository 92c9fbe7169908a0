//! Push-channel lifecycle for one execution.
//!
//! [`ConnectionManager`] owns at most one [`PushChannel`] at a time. It
//! constructs the channel, runs a task that feeds inbound frames through
//! the dispatcher, and reopens the channel with exponential backoff when
//! it drops. The previous channel object is always finished before the
//! next one is constructed.
//!
//! Closing is driven by a [`CancellationToken`]: the channel task races
//! every wait against it and re-checks it before each delivery, so no
//! event reaches the sink once [`ConnectionManager::close`] has returned.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use flowwatch_core::types::ExecutionId;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::dispatcher::dispatch;
use crate::events::{EventSink, ExecutionEvent, TransportEvent};
use crate::lock;
use crate::reconnect::{decide, ReconnectConfig, ReconnectDecision};
use crate::transport::{
    ChannelEvent, CloseInfo, ConstructionError, PushChannel, PushTransport, ReadyState,
    NORMAL_CLOSURE,
};

/// How long [`ConnectionManager::close_and_wait`] waits for the channel
/// task before aborting it.
const TASK_STOP_TIMEOUT: Duration = Duration::from_secs(5);

/// Why the owner closed the channel. Sent as the close-frame reason.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    ExecutionFinished,
    Unsubscribed,
    Replaced,
    Shutdown,
}

impl CloseReason {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ExecutionFinished => "Execution completed",
            Self::Unsubscribed => "Unsubscribed",
            Self::Replaced => "Replaced",
            Self::Shutdown => "Shutdown",
        }
    }
}

/// Manages the push channel of a single execution.
pub struct ConnectionManager {
    execution_id: ExecutionId,
    url: String,
    transport: Arc<dyn PushTransport>,
    reconnect: ReconnectConfig,
    cancel: CancellationToken,
    reason: Arc<Mutex<CloseReason>>,
    task: Option<JoinHandle<()>>,
}

/// Everything the channel task needs, owned by the task.
struct ChannelContext {
    execution_id: ExecutionId,
    url: String,
    transport: Arc<dyn PushTransport>,
    reconnect: ReconnectConfig,
    sink: Arc<dyn EventSink>,
    cancel: CancellationToken,
    reason: Arc<Mutex<CloseReason>>,
}

enum PumpOutcome {
    Cancelled,
    Closed(CloseInfo),
}

impl ConnectionManager {
    /// Create a manager for `execution_id` whose channel lives at `url`.
    ///
    /// The manager's token is a child of `parent`, so cancelling the
    /// parent closes this channel too.
    pub fn new(
        execution_id: impl Into<ExecutionId>,
        url: impl Into<String>,
        transport: Arc<dyn PushTransport>,
        reconnect: ReconnectConfig,
        parent: &CancellationToken,
    ) -> Self {
        Self {
            execution_id: execution_id.into(),
            url: url.into(),
            transport,
            reconnect,
            cancel: parent.child_token(),
            reason: Arc::new(Mutex::new(CloseReason::Shutdown)),
            task: None,
        }
    }

    pub fn execution_id(&self) -> &str {
        &self.execution_id
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Whether [`close`](Self::close) was called (or the parent token
    /// was cancelled).
    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Construct the channel and spawn the task that drives it.
    ///
    /// A construction failure is logged, reported once to `sink` as an
    /// error event followed by [`TransportEvent::GaveUp`], and returned.
    /// It never panics. Calling `open` on a manager that already has a
    /// running channel, or that was closed, does nothing.
    pub fn open(&mut self, sink: Arc<dyn EventSink>) -> Result<(), ConstructionError> {
        if self.is_closed() {
            tracing::debug!(execution_id = %self.execution_id, "Push channel already closed");
            return Ok(());
        }
        if self.task.as_ref().is_some_and(|t| !t.is_finished()) {
            tracing::debug!(execution_id = %self.execution_id, "Push channel already open");
            return Ok(());
        }

        let ctx = ChannelContext {
            execution_id: self.execution_id.clone(),
            url: self.url.clone(),
            transport: Arc::clone(&self.transport),
            reconnect: self.reconnect.clone(),
            sink,
            cancel: self.cancel.clone(),
            reason: Arc::clone(&self.reason),
        };

        let channel = construct(&ctx)?;
        self.task = Some(tokio::spawn(run_channel_loop(ctx, channel)));
        Ok(())
    }

    /// Tear down the channel and cancel any pending reconnect. Idempotent.
    ///
    /// The channel task sends a close frame with `reason` and exits in the
    /// background; use [`close_and_wait`](Self::close_and_wait) to wait
    /// for it.
    pub fn close(&mut self, reason: CloseReason) {
        if self.cancel.is_cancelled() {
            return;
        }
        *lock(&self.reason) = reason;
        self.cancel.cancel();
        tracing::debug!(
            execution_id = %self.execution_id,
            reason = reason.as_str(),
            "Push channel close requested",
        );
    }

    /// Close the channel and wait until its task has finished, aborting
    /// it after a timeout.
    pub async fn close_and_wait(&mut self, reason: CloseReason) {
        self.close(reason);

        if let Some(handle) = self.task.take() {
            let abort = handle.abort_handle();
            if tokio::time::timeout(TASK_STOP_TIMEOUT, handle).await.is_err() {
                tracing::warn!(
                    execution_id = %self.execution_id,
                    "Push channel task did not stop in time, aborting",
                );
                abort.abort();
            }
        }
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Build a channel through the transport, handling construction failure.
fn construct(ctx: &ChannelContext) -> Result<Box<dyn PushChannel>, ConstructionError> {
    tracing::debug!(
        execution_id = %ctx.execution_id,
        url = %ctx.url,
        "Opening push channel",
    );

    ctx.transport.open(&ctx.url).map_err(|e| {
        tracing::error!(
            execution_id = %ctx.execution_id,
            error = %e,
            ready_state = %ReadyState::Closed,
            url = %ctx.url,
            "Failed to create push channel",
        );
        ctx.sink.deliver(ExecutionEvent::Error(e.to_string()));
        ctx.sink.transport_changed(TransportEvent::GaveUp);
        e
    })
}

/// Channel task: pump events, then reconnect or stop.
async fn run_channel_loop(ctx: ChannelContext, initial: Box<dyn PushChannel>) {
    let mut channel = initial;
    let mut attempts = 0u32;

    loop {
        let close = match pump(&ctx, channel.as_mut(), &mut attempts).await {
            PumpOutcome::Cancelled => {
                let reason = *lock(&ctx.reason);
                channel.close(NORMAL_CLOSURE, reason.as_str()).await;
                tracing::info!(
                    execution_id = %ctx.execution_id,
                    reason = reason.as_str(),
                    "Push channel closed",
                );
                return;
            }
            PumpOutcome::Closed(close) => close,
        };

        tracing::debug!(
            execution_id = %ctx.execution_id,
            code = close.code,
            reason = %close.reason,
            was_clean = close.was_clean,
            reconnect_attempts = attempts,
            "Push channel disconnected",
        );
        if ctx.cancel.is_cancelled() {
            return;
        }
        ctx.sink.transport_changed(TransportEvent::Disconnected);

        match decide(&close, attempts, &ctx.reconnect) {
            ReconnectDecision::Retry { attempt, delay } => {
                attempts = attempt;
                tracing::info!(
                    execution_id = %ctx.execution_id,
                    attempt,
                    max_attempts = ctx.reconnect.max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    "Reconnecting push channel",
                );
                ctx.sink
                    .transport_changed(TransportEvent::Reconnecting { attempt, delay });

                tokio::select! {
                    biased;
                    _ = ctx.cancel.cancelled() => return,
                    _ = tokio::time::sleep(delay) => {}
                }

                channel.close(NORMAL_CLOSURE, "Reconnecting").await;
                channel = match construct(&ctx) {
                    Ok(channel) => channel,
                    Err(_) => return,
                };
            }
            ReconnectDecision::CleanClose => {
                tracing::debug!(
                    execution_id = %ctx.execution_id,
                    "Push channel closed cleanly by server, not reconnecting",
                );
                ctx.sink.transport_changed(TransportEvent::GaveUp);
                return;
            }
            ReconnectDecision::Exhausted { attempts } => {
                tracing::warn!(
                    execution_id = %ctx.execution_id,
                    attempts,
                    "Max reconnect attempts reached",
                );
                ctx.sink.deliver(ExecutionEvent::Error(format!(
                    "WebSocket connection failed after {} attempts",
                    ctx.reconnect.max_attempts
                )));
                ctx.sink.transport_changed(TransportEvent::GaveUp);
                return;
            }
        }
    }
}

/// Drive one channel until it closes or the manager is cancelled.
async fn pump(
    ctx: &ChannelContext,
    channel: &mut dyn PushChannel,
    attempts: &mut u32,
) -> PumpOutcome {
    loop {
        let event = tokio::select! {
            biased;
            _ = ctx.cancel.cancelled() => return PumpOutcome::Cancelled,
            event = channel.next_event() => event,
        };
        if ctx.cancel.is_cancelled() {
            return PumpOutcome::Cancelled;
        }

        match event {
            Some(ChannelEvent::Opened) => {
                *attempts = 0;
                tracing::info!(
                    execution_id = %ctx.execution_id,
                    url = %channel.url(),
                    "Push channel connected",
                );
                ctx.sink.transport_changed(TransportEvent::Connected);
            }
            Some(ChannelEvent::Message(text)) => {
                dispatch(&text, ctx.sink.as_ref());
            }
            Some(ChannelEvent::Error { error: e, ready_state }) => {
                tracing::error!(
                    execution_id = %ctx.execution_id,
                    error = %e,
                    ready_state = %ready_state,
                    url = %channel.url(),
                    "Push channel error",
                );
                ctx.sink.deliver(ExecutionEvent::Error(e.to_string()));
            }
            Some(ChannelEvent::Closed(close)) => return PumpOutcome::Closed(close),
            None => return PumpOutcome::Closed(CloseInfo::abnormal()),
        }
    }
}
