#![allow(dead_code)]

use std::collections::HashMap;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing_subscriber::fmt::MakeWriter;

use flowwatch_monitor::api::{ApiError, ExecutionSnapshot, StatusSource};
use flowwatch_monitor::events::{EventSink, ExecutionEvent};
use flowwatch_monitor::transport::{
    ChannelEvent, CloseInfo, ConstructionError, PushChannel, PushTransport, ReadyState,
    TransportError, NORMAL_CLOSURE,
};

// ---------------------------------------------------------------------------
// Time
// ---------------------------------------------------------------------------

/// Let spawned tasks run until they block again.
pub async fn settle() {
    for _ in 0..20 {
        tokio::task::yield_now().await;
    }
}

/// Advance the paused clock and let woken tasks run.
pub async fn advance(duration: Duration) {
    tokio::time::advance(duration).await;
    settle().await;
}

// ---------------------------------------------------------------------------
// Push transport fake
// ---------------------------------------------------------------------------

#[derive(Default)]
struct TransportState {
    urls: Vec<String>,
    senders: Vec<mpsc::UnboundedSender<ChannelEvent>>,
    live: usize,
    max_live: usize,
    closes: Vec<(u16, String)>,
}

/// In-memory [`PushTransport`]. Every opened channel is fed by the test
/// through [`FakeTransport::send`].
#[derive(Clone, Default)]
pub struct FakeTransport {
    state: Arc<Mutex<TransportState>>,
    fail_construction: Arc<AtomicBool>,
}

impl FakeTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// A transport whose `open` always fails.
    pub fn failing() -> Self {
        let transport = Self::default();
        transport.fail_construction.store(true, Ordering::SeqCst);
        transport
    }

    /// Channels constructed so far.
    pub fn opened(&self) -> usize {
        self.state.lock().unwrap().urls.len()
    }

    pub fn urls(&self) -> Vec<String> {
        self.state.lock().unwrap().urls.clone()
    }

    /// Channels neither closed nor dropped.
    pub fn live(&self) -> usize {
        self.state.lock().unwrap().live
    }

    /// Highest number of simultaneously live channels.
    pub fn max_live(&self) -> usize {
        self.state.lock().unwrap().max_live
    }

    /// `(code, reason)` of every owner-initiated close.
    pub fn closes(&self) -> Vec<(u16, String)> {
        self.state.lock().unwrap().closes.clone()
    }

    /// Feed `event` to the `index`-th channel. Returns `false` if that
    /// channel is gone.
    pub fn send(&self, index: usize, event: ChannelEvent) -> bool {
        let state = self.state.lock().unwrap();
        state
            .senders
            .get(index)
            .is_some_and(|tx| tx.send(event).is_ok())
    }

    /// Feed `event` to the most recently opened channel.
    pub fn send_latest(&self, event: ChannelEvent) -> bool {
        let index = self.opened().saturating_sub(1);
        self.send(index, event)
    }

    pub fn send_text(&self, index: usize, text: &str) -> bool {
        self.send(index, ChannelEvent::Message(text.to_string()))
    }
}

impl PushTransport for FakeTransport {
    fn open(&self, url: &str) -> Result<Box<dyn PushChannel>, ConstructionError> {
        if self.fail_construction.load(Ordering::SeqCst) {
            return Err(ConstructionError::InvalidUrl {
                url: url.to_string(),
                reason: "refused by test transport".to_string(),
            });
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let mut state = self.state.lock().unwrap();
        state.urls.push(url.to_string());
        state.senders.push(tx);
        state.live += 1;
        state.max_live = state.max_live.max(state.live);

        Ok(Box::new(FakeChannel {
            url: url.to_string(),
            rx,
            ready_state: ReadyState::Connecting,
            released: false,
            shared: Arc::clone(&self.state),
        }))
    }
}

struct FakeChannel {
    url: String,
    rx: mpsc::UnboundedReceiver<ChannelEvent>,
    ready_state: ReadyState,
    released: bool,
    shared: Arc<Mutex<TransportState>>,
}

impl FakeChannel {
    fn release(&mut self) {
        if !self.released {
            self.released = true;
            self.shared.lock().unwrap().live -= 1;
        }
    }
}

#[async_trait]
impl PushChannel for FakeChannel {
    fn url(&self) -> &str {
        &self.url
    }

    fn ready_state(&self) -> ReadyState {
        self.ready_state
    }

    async fn next_event(&mut self) -> Option<ChannelEvent> {
        if self.ready_state == ReadyState::Closed {
            return None;
        }
        let event = self.rx.recv().await?;
        match &event {
            ChannelEvent::Opened => self.ready_state = ReadyState::Open,
            ChannelEvent::Closed(_) => self.ready_state = ReadyState::Closed,
            _ => {}
        }
        Some(event)
    }

    async fn close(&mut self, code: u16, reason: &str) {
        if self.ready_state != ReadyState::Closed {
            self.shared
                .lock()
                .unwrap()
                .closes
                .push((code, reason.to_string()));
        }
        self.ready_state = ReadyState::Closed;
        self.release();
    }
}

impl Drop for FakeChannel {
    fn drop(&mut self) {
        self.release();
    }
}

/// An unclean drop, as seen after a network failure.
pub fn dropped() -> ChannelEvent {
    ChannelEvent::Closed(CloseInfo::abnormal())
}

/// A receive failure reported while the channel was in `ready_state`.
pub fn transport_error(message: &str, ready_state: ReadyState) -> ChannelEvent {
    ChannelEvent::Error {
        error: TransportError::Receive(message.to_string()),
        ready_state,
    }
}

/// The server closed the channel cleanly.
pub fn closed_cleanly() -> ChannelEvent {
    ChannelEvent::Closed(CloseInfo {
        code: NORMAL_CLOSURE,
        reason: "Execution completed".to_string(),
        was_clean: true,
    })
}

// ---------------------------------------------------------------------------
// Status source fake
// ---------------------------------------------------------------------------

/// In-memory [`StatusSource`] counting fetches. Executions without a
/// scripted snapshot report `running`.
#[derive(Clone, Default)]
pub struct FakeSource {
    calls: Arc<AtomicUsize>,
    per_execution: Arc<Mutex<HashMap<String, usize>>>,
    snapshots: Arc<Mutex<HashMap<String, ExecutionSnapshot>>>,
    failing: Arc<AtomicBool>,
    latency: Arc<Mutex<Option<Duration>>>,
}

impl FakeSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn calls_for(&self, execution_id: &str) -> usize {
        self.per_execution
            .lock()
            .unwrap()
            .get(execution_id)
            .copied()
            .unwrap_or(0)
    }

    pub fn set_snapshot(&self, snapshot: ExecutionSnapshot) {
        self.snapshots
            .lock()
            .unwrap()
            .insert(snapshot.id.clone(), snapshot);
    }

    pub fn set_status(&self, execution_id: &str, status: &str) {
        self.set_snapshot(snapshot(execution_id, status));
    }

    /// Make every fetch return a 503.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Make every fetch take `latency` of (paused) time.
    pub fn set_latency(&self, latency: Duration) {
        *self.latency.lock().unwrap() = Some(latency);
    }
}

#[async_trait]
impl StatusSource for FakeSource {
    async fn get_execution(&self, execution_id: &str) -> Result<ExecutionSnapshot, ApiError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        *self
            .per_execution
            .lock()
            .unwrap()
            .entry(execution_id.to_string())
            .or_default() += 1;

        let latency = *self.latency.lock().unwrap();
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }

        if self.failing.load(Ordering::SeqCst) {
            return Err(ApiError::Status {
                status: 503,
                body: "unavailable".to_string(),
            });
        }

        let scripted = self.snapshots.lock().unwrap().get(execution_id).cloned();
        Ok(scripted.unwrap_or_else(|| snapshot(execution_id, "running")))
    }
}

pub fn snapshot(execution_id: &str, status: &str) -> ExecutionSnapshot {
    ExecutionSnapshot {
        id: execution_id.to_string(),
        status: status.to_string(),
        ..Default::default()
    }
}

// ---------------------------------------------------------------------------
// Event recording
// ---------------------------------------------------------------------------

/// [`EventSink`] that records every delivered event.
#[derive(Clone, Default)]
pub struct RecordingSink {
    events: Arc<Mutex<Vec<ExecutionEvent>>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<ExecutionEvent> {
        self.events.lock().unwrap().clone()
    }
}

impl EventSink for RecordingSink {
    fn deliver(&self, event: ExecutionEvent) {
        self.events.lock().unwrap().push(event);
    }
}

/// Shared list of strings handlers push into.
#[derive(Clone, Default)]
pub struct Calls(Arc<Mutex<Vec<String>>>);

impl Calls {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, call: impl Into<String>) {
        self.0.lock().unwrap().push(call.into());
    }

    pub fn all(&self) -> Vec<String> {
        self.0.lock().unwrap().clone()
    }

    pub fn count_prefix(&self, prefix: &str) -> usize {
        self.all().iter().filter(|c| c.starts_with(prefix)).count()
    }
}

// ---------------------------------------------------------------------------
// Log capture
// ---------------------------------------------------------------------------

/// `MakeWriter` appending formatted log lines to a shared buffer.
#[derive(Clone, Default)]
pub struct LogCapture {
    buffer: Arc<Mutex<Vec<u8>>>,
}

impl LogCapture {
    pub fn contents(&self) -> String {
        String::from_utf8_lossy(&self.buffer.lock().unwrap()).into_owned()
    }

    /// Number of captured lines containing `needle`.
    pub fn count(&self, needle: &str) -> usize {
        self.contents()
            .lines()
            .filter(|line| line.contains(needle))
            .count()
    }
}

pub struct CaptureWriter {
    buffer: Arc<Mutex<Vec<u8>>>,
}

impl io::Write for CaptureWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.buffer.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl<'a> MakeWriter<'a> for LogCapture {
    type Writer = CaptureWriter;

    fn make_writer(&'a self) -> Self::Writer {
        CaptureWriter {
            buffer: Arc::clone(&self.buffer),
        }
    }
}

/// Capture everything logged on this thread until the guard drops.
///
/// `#[tokio::test]` runs spawned tasks on the test thread, so their logs
/// are captured too.
pub fn capture_logs() -> (LogCapture, tracing::subscriber::DefaultGuard) {
    let capture = LogCapture::default();
    let subscriber = tracing_subscriber::fmt()
        .with_writer(capture.clone())
        .with_ansi(false)
        .with_max_level(tracing::Level::DEBUG)
        .finish();
    let guard = tracing::subscriber::set_default(subscriber);
    (capture, guard)
}
