//! Timer-driven status polling.
//!
//! [`PollingFallback`] runs one background task that, on every tick,
//! fetches the status of each tracked execution through a
//! [`StatusSource`] and turns the changes it sees into
//! [`ExecutionEvent`]s for that execution's sink. It keeps status tracking
//! moving when no push channel is available and acts as a safety net when
//! one is.
//!
//! Two ceilings bound the work:
//!
//! - **Iterations.** Each execution is fetched at most
//!   [`PollConfig::max_iterations`] times. The tick that reaches the
//!   ceiling logs one warning and polling for that execution halts until
//!   it is tracked again.
//! - **Cardinality.** At most [`PollConfig::max_polled`] executions are
//!   fetched per tick, in tracking order. Crossing the cap logs one
//!   warning; the warning re-arms once the count drops back under it.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use futures::future::join_all;
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use flowwatch_core::execution::{is_temporary_execution_id, ExecutionStatus};
use flowwatch_core::types::{ExecutionId, Timestamp};

use crate::api::{ExecutionSnapshot, StatusSource};
use crate::config::PollConfig;
use crate::events::{EventSink, ExecutionEvent};
use crate::lock;

/// How long [`PollingFallback::stop_and_wait`] waits for the poll task.
const TASK_STOP_TIMEOUT: Duration = Duration::from_secs(5);

/// Per-execution poll bookkeeping.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PollGuardState {
    /// Fetches issued since the execution was tracked.
    pub iteration_count: u32,
    pub last_polled_at: Option<Timestamp>,
}

struct PollJob {
    execution_id: ExecutionId,
    sink: Arc<dyn EventSink>,
    guard: PollGuardState,
    halted: bool,
    terminal: bool,
    last_status: Option<String>,
    node_states: serde_json::Map<String, serde_json::Value>,
    logs_delivered: usize,
}

impl PollJob {
    fn new(execution_id: ExecutionId, sink: Arc<dyn EventSink>) -> Self {
        Self {
            execution_id,
            sink,
            guard: PollGuardState::default(),
            halted: false,
            terminal: false,
            last_status: None,
            node_states: serde_json::Map::new(),
            logs_delivered: 0,
        }
    }

    fn is_active(&self) -> bool {
        !self.halted && !self.terminal
    }

    /// Diff `snapshot` against what was already reported and record it.
    ///
    /// Events are ordered logs, node updates, then status, so a terminal
    /// status is the last thing a sink sees for the tick.
    fn absorb(&mut self, snapshot: ExecutionSnapshot) -> Vec<ExecutionEvent> {
        let mut events = Vec::new();

        if snapshot.logs.len() >= self.logs_delivered {
            let fresh = snapshot.logs.into_iter().skip(self.logs_delivered);
            for entry in fresh {
                self.logs_delivered += 1;
                events.push(ExecutionEvent::Log(entry));
            }
        } else {
            // Server-side log window shrank; resync without replaying.
            self.logs_delivered = snapshot.logs.len();
        }

        for (node_id, node_state) in snapshot.node_states {
            if self.node_states.get(&node_id) == Some(&node_state) {
                continue;
            }
            self.node_states.insert(node_id.clone(), node_state.clone());
            events.push(ExecutionEvent::NodeUpdate {
                node_id,
                node_state,
            });
        }

        if self.last_status.as_deref() != Some(snapshot.status.as_str()) {
            self.observe_status(&snapshot.status);
            events.push(ExecutionEvent::Status(snapshot.status));
        }

        events
    }

    fn observe_status(&mut self, status: &str) {
        self.last_status = Some(status.to_string());
        if status
            .parse::<ExecutionStatus>()
            .is_ok_and(ExecutionStatus::is_terminal)
        {
            self.terminal = true;
        }
    }
}

#[derive(Default)]
struct PollerState {
    /// Tracking order is insertion order.
    jobs: Vec<PollJob>,
    /// Latched while the active set is over the cardinality cap.
    over_capacity: bool,
}

impl PollerState {
    fn job_mut(&mut self, execution_id: &str) -> Option<&mut PollJob> {
        self.jobs
            .iter_mut()
            .find(|job| job.execution_id == execution_id)
    }
}

/// One fetch scheduled for the current tick.
struct PollTarget {
    execution_id: ExecutionId,
    sink: Arc<dyn EventSink>,
}

/// Background poller for execution status.
pub struct PollingFallback {
    config: PollConfig,
    source: Arc<dyn StatusSource>,
    state: Arc<Mutex<PollerState>>,
    cancel: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl PollingFallback {
    /// Create a stopped poller. Its token is a child of `parent`.
    pub fn new(config: PollConfig, source: Arc<dyn StatusSource>, parent: &CancellationToken) -> Self {
        Self {
            config,
            source,
            state: Arc::new(Mutex::new(PollerState::default())),
            cancel: parent.child_token(),
            task: Mutex::new(None),
        }
    }

    pub fn interval(&self) -> Duration {
        self.config.interval
    }

    /// Spawn the poll task. The first tick fires one interval from now.
    ///
    /// Does nothing if the task is already running or the poller was
    /// stopped.
    pub fn start(&self) {
        if self.cancel.is_cancelled() {
            return;
        }
        let mut task = lock(&self.task);
        if task.as_ref().is_some_and(|t| !t.is_finished()) {
            return;
        }

        let worker = PollWorker {
            first_tick: Instant::now() + self.config.interval,
            config: self.config.clone(),
            source: Arc::clone(&self.source),
            state: Arc::clone(&self.state),
            cancel: self.cancel.clone(),
        };
        tracing::debug!(
            interval_ms = self.config.interval.as_millis() as u64,
            "Starting status poller",
        );
        *task = Some(tokio::spawn(worker.run()));
    }

    /// Begin polling `execution_id`, delivering changes to `sink`.
    ///
    /// Tracking an execution that is already tracked replaces its sink and
    /// resets its guard state. Temporary ids are never polled and return
    /// `false`.
    pub fn track(&self, execution_id: &str, sink: Arc<dyn EventSink>) -> bool {
        if is_temporary_execution_id(execution_id) {
            tracing::debug!(execution_id, "Not polling temporary execution id");
            return false;
        }

        let mut state = lock(&self.state);
        let job = PollJob::new(execution_id.to_string(), sink);
        match state.job_mut(execution_id) {
            Some(existing) => *existing = job,
            None => state.jobs.push(job),
        }
        tracing::debug!(execution_id, tracked = state.jobs.len(), "Tracking execution for polling");
        true
    }

    /// Stop polling `execution_id`. Returns whether it was tracked.
    pub fn untrack(&self, execution_id: &str) -> bool {
        let mut state = lock(&self.state);
        let before = state.jobs.len();
        state.jobs.retain(|job| job.execution_id != execution_id);
        before != state.jobs.len()
    }

    /// Record a status learned from another source so the next poll does
    /// not report it again. A terminal status stops polling the execution.
    pub fn observe_status(&self, execution_id: &str, status: &str) {
        if let Some(job) = lock(&self.state).job_mut(execution_id) {
            job.observe_status(status);
        }
    }

    /// Guard state of one tracked execution.
    pub fn guard_state(&self, execution_id: &str) -> Option<PollGuardState> {
        lock(&self.state)
            .jobs
            .iter()
            .find(|job| job.execution_id == execution_id)
            .map(|job| job.guard.clone())
    }

    /// Number of tracked executions, including halted and terminal ones.
    pub fn tracked_count(&self) -> usize {
        lock(&self.state).jobs.len()
    }

    /// Cancel the timer. No fetch starts and no event is delivered after
    /// this returns, even for a tick that was already in flight.
    pub fn stop(&self) {
        self.cancel.cancel();
        if let Some(handle) = lock(&self.task).take() {
            handle.abort();
        }
    }

    /// [`stop`](Self::stop), then wait for the task to unwind.
    pub async fn stop_and_wait(&self) {
        self.cancel.cancel();
        let handle = lock(&self.task).take();
        if let Some(handle) = handle {
            let abort = handle.abort_handle();
            if tokio::time::timeout(TASK_STOP_TIMEOUT, handle).await.is_err() {
                tracing::warn!("Status poller did not stop in time, aborting");
                abort.abort();
            }
        }
    }
}

impl Drop for PollingFallback {
    fn drop(&mut self) {
        self.stop();
    }
}

// ---------------------------------------------------------------------------
// Poll task
// ---------------------------------------------------------------------------

struct PollWorker {
    first_tick: Instant,
    config: PollConfig,
    source: Arc<dyn StatusSource>,
    state: Arc<Mutex<PollerState>>,
    cancel: CancellationToken,
}

impl PollWorker {
    async fn run(self) {
        let mut interval = tokio::time::interval_at(self.first_tick, self.config.interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => {
                    tracing::debug!("Status poller cancelled");
                    break;
                }
                _ = interval.tick() => self.tick().await,
            }
        }
    }

    async fn tick(&self) {
        let targets = self.select_targets();
        if targets.is_empty() || self.cancel.is_cancelled() {
            return;
        }

        let fetches = targets
            .iter()
            .map(|target| self.source.get_execution(&target.execution_id));
        let results = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return,
            results = join_all(fetches) => results,
        };

        for (target, result) in targets.into_iter().zip(results) {
            if self.cancel.is_cancelled() {
                return;
            }
            match result {
                Ok(snapshot) => self.apply(target, snapshot),
                Err(e) => {
                    tracing::error!(
                        execution_id = %target.execution_id,
                        error = %e,
                        "Failed to poll execution status",
                    );
                }
            }
        }
    }

    /// Pick this tick's fetches and charge them against the ceilings.
    fn select_targets(&self) -> Vec<PollTarget> {
        let mut state = lock(&self.state);
        let max_polled = self.config.max_polled;
        let max_iterations = self.config.max_iterations;

        let active = state.jobs.iter().filter(|job| job.is_active()).count();
        if active > max_polled {
            if !state.over_capacity {
                tracing::warn!(
                    count = active,
                    limit = max_polled,
                    "Too many running executions ({active}), limiting to {max_polled}",
                );
            }
            state.over_capacity = true;
        } else {
            state.over_capacity = false;
        }

        let now = Utc::now();
        let mut targets = Vec::with_capacity(active.min(max_polled));
        for job in state.jobs.iter_mut().filter(|job| job.is_active()).take(max_polled) {
            job.guard.iteration_count += 1;
            job.guard.last_polled_at = Some(now);
            if job.guard.iteration_count >= max_iterations {
                job.halted = true;
                tracing::warn!(
                    execution_id = %job.execution_id,
                    limit = max_iterations,
                    "Max polling iterations ({max_iterations}) reached",
                );
            }
            targets.push(PollTarget {
                execution_id: job.execution_id.clone(),
                sink: Arc::clone(&job.sink),
            });
        }
        targets
    }

    fn apply(&self, target: PollTarget, snapshot: ExecutionSnapshot) {
        let events = {
            let mut state = lock(&self.state);
            let Some(job) = state.job_mut(&target.execution_id) else {
                // Untracked while the fetch was in flight.
                return;
            };
            if !Arc::ptr_eq(&job.sink, &target.sink) {
                // Re-tracked with a new sink; the next tick reports to it.
                return;
            }
            job.absorb(snapshot)
        };

        if !events.is_empty() {
            tracing::debug!(
                execution_id = %target.execution_id,
                events = events.len(),
                "Poll reported changes",
            );
        }
        for event in events {
            if self.cancel.is_cancelled() {
                return;
            }
            target.sink.deliver(event);
        }
    }
}
