//! Push-channel transport abstraction and its WebSocket implementation.
//!
//! Opening a channel is split in two steps, mirroring how a browser
//! socket behaves:
//!
//! 1. [`PushTransport::open`] validates the target synchronously and
//!    returns a channel in the [`ReadyState::Connecting`] state, or a
//!    [`ConstructionError`] when no channel can be built at all.
//! 2. The handshake runs when the owner first polls
//!    [`PushChannel::next_event`]; a handshake failure surfaces as a
//!    [`ChannelEvent::Error`] followed by an abnormal
//!    [`ChannelEvent::Closed`].

use std::borrow::Cow;
use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::handshake::client::Request;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

/// Close code for a caller-initiated, orderly shutdown.
pub const NORMAL_CLOSURE: u16 = 1000;
/// Close code reported when the peer sent a close frame without a code.
pub const NO_STATUS_RECEIVED: u16 = 1005;
/// Close code reported when the connection dropped without a close frame.
pub const ABNORMAL_CLOSURE: u16 = 1006;

/// Upper bound on waiting for the peer to acknowledge our close frame.
const CLOSE_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

type WsStream = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

/// The four socket states a channel moves through.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadyState {
    Connecting,
    Open,
    Closing,
    Closed,
}

impl fmt::Display for ReadyState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Connecting => "CONNECTING",
            Self::Open => "OPEN",
            Self::Closing => "CLOSING",
            Self::Closed => "CLOSED",
        })
    }
}

/// How a channel ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseInfo {
    pub code: u16,
    pub reason: String,
    /// Whether the close handshake completed.
    pub was_clean: bool,
}

impl CloseInfo {
    /// The connection dropped without a close handshake.
    pub fn abnormal() -> Self {
        Self {
            code: ABNORMAL_CLOSURE,
            reason: String::new(),
            was_clean: false,
        }
    }

    /// A clean close with the normal-closure code. Such a close means the
    /// server is done with this execution and must not be retried.
    pub fn is_normal(&self) -> bool {
        self.was_clean && self.code == NORMAL_CLOSURE
    }
}

/// Lifecycle and data events produced by a [`PushChannel`].
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelEvent {
    /// The handshake completed; the channel is open.
    Opened,
    /// One text frame.
    Message(String),
    /// A transport failure. A [`ChannelEvent::Closed`] follows.
    ///
    /// `ready_state` is the state the channel was in when the failure
    /// happened, before any transition it caused.
    Error {
        error: TransportError,
        ready_state: ReadyState,
    },
    /// The channel is closed. No further events are produced.
    Closed(CloseInfo),
}

/// A channel could not be constructed at all.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConstructionError {
    #[error("Invalid push channel URL {url}: {reason}")]
    InvalidUrl { url: String, reason: String },

    #[error("Unsupported push channel URL scheme: {0}")]
    UnsupportedScheme(String),
}

/// A failure on a constructed channel, in any ready state.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("Handshake failed: {0}")]
    Handshake(String),

    #[error("Receive failed: {0}")]
    Receive(String),
}

/// One live push channel.
#[async_trait]
pub trait PushChannel: Send {
    /// The URL the channel was opened against.
    fn url(&self) -> &str;

    /// Current socket state.
    fn ready_state(&self) -> ReadyState;

    /// Wait for the next event. Returns `None` once the channel has
    /// yielded [`ChannelEvent::Closed`] or was closed by its owner.
    ///
    /// Must be cancel-safe: it is raced against cancellation tokens.
    async fn next_event(&mut self) -> Option<ChannelEvent>;

    /// Close the channel from our side. Idempotent.
    async fn close(&mut self, code: u16, reason: &str);
}

/// Factory for push channels.
pub trait PushTransport: Send + Sync {
    /// Construct a channel for `url` without performing any I/O.
    fn open(&self, url: &str) -> Result<Box<dyn PushChannel>, ConstructionError>;
}

// ---------------------------------------------------------------------------
// WebSocket implementation
// ---------------------------------------------------------------------------

/// [`PushTransport`] backed by `tokio-tungstenite`.
#[derive(Debug, Clone, Copy, Default)]
pub struct WsTransport;

impl PushTransport for WsTransport {
    fn open(&self, url: &str) -> Result<Box<dyn PushChannel>, ConstructionError> {
        let request = url
            .into_client_request()
            .map_err(|e| ConstructionError::InvalidUrl {
                url: url.to_string(),
                reason: e.to_string(),
            })?;

        match request.uri().scheme_str() {
            Some("ws") | Some("wss") => {}
            _ => return Err(ConstructionError::UnsupportedScheme(url.to_string())),
        }

        Ok(Box::new(WsChannel {
            url: url.to_string(),
            request: Some(request),
            state: ReadyState::Connecting,
            stream: None,
            pending_close: None,
        }))
    }
}

/// A WebSocket push channel.
pub struct WsChannel {
    url: String,
    /// Handshake request, consumed by the first `next_event` call.
    request: Option<Request>,
    state: ReadyState,
    stream: Option<WsStream>,
    /// Close event still owed to the owner after an error.
    pending_close: Option<CloseInfo>,
}

impl WsChannel {
    fn fail(&mut self, error: TransportError) -> Option<ChannelEvent> {
        let ready_state = self.state;
        self.state = ReadyState::Closed;
        self.stream = None;
        self.pending_close = Some(CloseInfo::abnormal());
        Some(ChannelEvent::Error { error, ready_state })
    }

    async fn handshake(&mut self) -> Option<ChannelEvent> {
        let Some(request) = self.request.take() else {
            self.state = ReadyState::Closed;
            return Some(ChannelEvent::Closed(CloseInfo::abnormal()));
        };

        match connect_async(request).await {
            Ok((stream, _response)) => {
                self.stream = Some(stream);
                self.state = ReadyState::Open;
                Some(ChannelEvent::Opened)
            }
            Err(e) => self.fail(TransportError::Handshake(e.to_string())),
        }
    }

    async fn read_frame(&mut self) -> Option<ChannelEvent> {
        loop {
            let Some(stream) = self.stream.as_mut() else {
                self.state = ReadyState::Closed;
                return self.pending_close.take().map(ChannelEvent::Closed);
            };

            match stream.next().await {
                Some(Ok(Message::Text(text))) => return Some(ChannelEvent::Message(text)),
                Some(Ok(Message::Binary(_))) => {
                    tracing::trace!(url = %self.url, "Ignoring binary frame");
                }
                Some(Ok(Message::Ping(_) | Message::Pong(_) | Message::Frame(_))) => {
                    // Handled automatically by tungstenite.
                }
                Some(Ok(Message::Close(frame))) => {
                    self.state = ReadyState::Closed;
                    self.stream = None;
                    let info = match frame {
                        Some(frame) => CloseInfo {
                            code: u16::from(frame.code),
                            reason: frame.reason.into_owned(),
                            was_clean: true,
                        },
                        None => CloseInfo {
                            code: NO_STATUS_RECEIVED,
                            reason: String::new(),
                            was_clean: true,
                        },
                    };
                    return Some(ChannelEvent::Closed(info));
                }
                Some(Err(e)) => return self.fail(TransportError::Receive(e.to_string())),
                None => {
                    self.state = ReadyState::Closed;
                    self.stream = None;
                    return Some(ChannelEvent::Closed(CloseInfo::abnormal()));
                }
            }
        }
    }
}

#[async_trait]
impl PushChannel for WsChannel {
    fn url(&self) -> &str {
        &self.url
    }

    fn ready_state(&self) -> ReadyState {
        self.state
    }

    async fn next_event(&mut self) -> Option<ChannelEvent> {
        match self.state {
            ReadyState::Connecting => self.handshake().await,
            ReadyState::Open | ReadyState::Closing => self.read_frame().await,
            ReadyState::Closed => self.pending_close.take().map(ChannelEvent::Closed),
        }
    }

    async fn close(&mut self, code: u16, reason: &str) {
        self.request = None;
        self.pending_close = None;

        if let Some(mut stream) = self.stream.take() {
            self.state = ReadyState::Closing;
            let frame = CloseFrame {
                code: CloseCode::from(code),
                reason: Cow::Owned(reason.to_string()),
            };
            match tokio::time::timeout(CLOSE_HANDSHAKE_TIMEOUT, stream.close(Some(frame))).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    tracing::debug!(url = %self.url, error = %e, "Close handshake failed");
                }
                Err(_) => {
                    tracing::debug!(url = %self.url, "Close handshake timed out");
                }
            }
        }

        self.state = ReadyState::Closed;
    }
}
