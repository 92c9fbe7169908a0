//! Integration tests for `PollingFallback`.
//!
//! All tests run on a paused clock and drive ticks with
//! `tokio::time::advance`, counting fetches against an in-memory status
//! source.

mod common;

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use flowwatch_monitor::config::PollConfig;
use flowwatch_monitor::events::ExecutionEvent;
use flowwatch_monitor::poller::PollingFallback;

use common::{advance, capture_logs, settle, FakeSource, RecordingSink};

const TICK: Duration = Duration::from_millis(2_000);

fn poller(interval_ms: i64, source: &FakeSource) -> PollingFallback {
    PollingFallback::new(
        PollConfig::from_interval_ms(interval_ms),
        Arc::new(source.clone()),
        &CancellationToken::new(),
    )
}

// ---------------------------------------------------------------------------
// Test: an invalid interval falls back to 2000 ms
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn negative_interval_first_fetch_at_default() {
    let source = FakeSource::new();
    let poller = poller(-100, &source);
    assert_eq!(poller.interval(), TICK);

    poller.track("exec-1", Arc::new(RecordingSink::new()));
    poller.start();
    settle().await;

    advance(Duration::from_millis(1_999)).await;
    assert_eq!(source.calls(), 0, "no fetch before the default interval");

    advance(Duration::from_millis(1)).await;
    assert_eq!(source.calls(), 1, "first fetch at exactly 2000 ms");
}

// ---------------------------------------------------------------------------
// Test: iteration ceiling halts polling after the 1000th fetch
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn iteration_ceiling_warns_once_and_halts() {
    let (logs, _guard) = capture_logs();
    let source = FakeSource::new();
    let poller = poller(2_000, &source);

    poller.track("exec-1", Arc::new(RecordingSink::new()));
    poller.start();
    settle().await;

    for _ in 0..1_000 {
        advance(TICK).await;
    }
    assert_eq!(source.calls_for("exec-1"), 1_000);
    assert_eq!(logs.count("Max polling iterations (1000) reached"), 1);
    assert_eq!(
        poller.guard_state("exec-1").map(|g| g.iteration_count),
        Some(1_000)
    );

    for _ in 0..5 {
        advance(TICK).await;
    }
    assert_eq!(source.calls_for("exec-1"), 1_000, "no fetch after the ceiling");
    assert_eq!(logs.count("Max polling iterations (1000) reached"), 1);
}

// ---------------------------------------------------------------------------
// Test: re-tracking resets the iteration ceiling
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn retracking_resets_guard_state() {
    let source = FakeSource::new();
    let poller = PollingFallback::new(
        PollConfig {
            interval: TICK,
            max_iterations: 3,
            max_polled: 50,
        },
        Arc::new(source.clone()),
        &CancellationToken::new(),
    );

    poller.track("exec-1", Arc::new(RecordingSink::new()));
    poller.start();
    settle().await;
    for _ in 0..5 {
        advance(TICK).await;
    }
    assert_eq!(source.calls(), 3);

    poller.track("exec-1", Arc::new(RecordingSink::new()));
    assert_eq!(
        poller.guard_state("exec-1").map(|g| g.iteration_count),
        Some(0)
    );
    advance(TICK).await;
    assert_eq!(source.calls(), 4);
}

// ---------------------------------------------------------------------------
// Test: cardinality ceiling limits each tick to 50 fetches
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn sixty_jobs_poll_fifty_and_warn_once() {
    let (logs, _guard) = capture_logs();
    let source = FakeSource::new();
    let poller = poller(2_000, &source);

    for i in 0..60 {
        poller.track(&format!("exec-{i}"), Arc::new(RecordingSink::new()));
    }
    assert_eq!(poller.tracked_count(), 60);
    poller.start();
    settle().await;

    advance(TICK).await;
    assert_eq!(source.calls(), 50);
    // Tracking order decides who is polled.
    assert_eq!(source.calls_for("exec-49"), 1);
    assert_eq!(source.calls_for("exec-50"), 0);

    advance(TICK).await;
    assert_eq!(source.calls(), 100);
    assert_eq!(
        logs.count("Too many running executions (60), limiting to 50"),
        1
    );
}

// ---------------------------------------------------------------------------
// Test: finished jobs free up capacity
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn terminal_jobs_do_not_count_toward_cap() {
    let source = FakeSource::new();
    let poller = poller(2_000, &source);

    for i in 0..55 {
        poller.track(&format!("exec-{i}"), Arc::new(RecordingSink::new()));
    }
    for i in 0..10 {
        poller.observe_status(&format!("exec-{i}"), "completed");
    }
    poller.start();
    settle().await;

    advance(TICK).await;
    assert_eq!(source.calls(), 45);
    assert_eq!(source.calls_for("exec-0"), 0);
}

// ---------------------------------------------------------------------------
// Test: stop() cancels the timer
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn stop_yields_zero_further_fetches() {
    let source = FakeSource::new();
    let poller = poller(2_000, &source);

    poller.track("exec-1", Arc::new(RecordingSink::new()));
    poller.start();
    settle().await;
    advance(TICK).await;
    assert_eq!(source.calls(), 1);

    poller.stop();
    for _ in 0..10 {
        advance(TICK).await;
    }
    assert_eq!(source.calls(), 1);
}

// ---------------------------------------------------------------------------
// Test: stop() during an in-flight fetch drops its result
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn stop_mid_fetch_delivers_nothing() {
    let source = FakeSource::new();
    source.set_latency(Duration::from_millis(500));
    let sink = RecordingSink::new();
    let poller = poller(2_000, &source);

    poller.track("exec-1", Arc::new(sink.clone()));
    poller.start();
    settle().await;

    advance(TICK).await;
    assert_eq!(source.calls(), 1, "fetch is in flight");

    poller.stop();
    advance(Duration::from_millis(1_000)).await;
    assert!(sink.events().is_empty());
}

// ---------------------------------------------------------------------------
// Test: poll results are translated into events
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn poll_reports_status_changes_only() {
    let source = FakeSource::new();
    let sink = RecordingSink::new();
    let poller = poller(2_000, &source);

    poller.track("exec-1", Arc::new(sink.clone()));
    poller.start();
    settle().await;

    advance(TICK).await;
    advance(TICK).await;
    assert_eq!(sink.events(), vec![ExecutionEvent::Status("running".into())]);

    source.set_status("exec-1", "completed");
    advance(TICK).await;
    assert_eq!(
        sink.events().last(),
        Some(&ExecutionEvent::Status("completed".into()))
    );

    // Terminal: no more fetches.
    let calls = source.calls();
    advance(TICK).await;
    assert_eq!(source.calls(), calls);
}

// ---------------------------------------------------------------------------
// Test: a failed poll is logged and the job stays tracked
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn failed_poll_keeps_polling() {
    let (logs, _guard) = capture_logs();
    let source = FakeSource::new();
    source.set_failing(true);
    let sink = RecordingSink::new();
    let poller = poller(2_000, &source);

    poller.track("exec-1", Arc::new(sink.clone()));
    poller.start();
    settle().await;

    advance(TICK).await;
    advance(TICK).await;
    assert_eq!(source.calls(), 2);
    assert!(sink.events().is_empty());
    assert_eq!(logs.count("Failed to poll execution status"), 2);
    assert_eq!(
        poller.guard_state("exec-1").map(|g| g.iteration_count),
        Some(2)
    );

    source.set_failing(false);
    advance(TICK).await;
    assert_eq!(sink.events(), vec![ExecutionEvent::Status("running".into())]);
}

// ---------------------------------------------------------------------------
// Test: temporary ids are never polled
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn temporary_ids_are_not_tracked() {
    let source = FakeSource::new();
    let poller = poller(2_000, &source);

    assert!(!poller.track("pending-1", Arc::new(RecordingSink::new())));
    assert!(!poller.track("temp-abc", Arc::new(RecordingSink::new())));
    assert_eq!(poller.tracked_count(), 0);

    poller.start();
    settle().await;
    advance(TICK).await;
    assert_eq!(source.calls(), 0);
}
