//! Signaling transport: WebSocket connections carrying JSON text frames
//!
//! A broadcast session talks to the companion server through a
//! [`SignalingChannel`], a frame sink plus a frame stream. The
//! [`WebSocketConnector`] produces channels backed by `tokio-tungstenite`;
//! the [`MemoryConnector`] produces in-process channels whose server ends are
//! handed out by a [`MemoryListener`].

use crate::error::{Result, TileCastError};
use async_trait::async_trait;
use futures::channel::mpsc as fmpsc;
use futures::{future, Sink, SinkExt, Stream, StreamExt};
use std::borrow::Cow;
use std::fmt;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tracing::{debug, trace};
use tungstenite::protocol::frame::coding::CloseCode;
use tungstenite::protocol::CloseFrame;
use tungstenite::Message;

/// Close code used for voluntary teardown ("normal closure")
pub const NORMAL_CLOSURE: u16 = 1000;

/// Default timeout for establishing a signaling connection
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// A single signaling frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// UTF-8 text payload (JSON signaling message)
    Text(String),
    /// Close frame with optional close code
    Close(Option<u16>),
}

impl Frame {
    /// Normal-closure close frame
    pub fn normal_close() -> Self {
        Frame::Close(Some(NORMAL_CLOSURE))
    }

    fn into_message(self) -> Message {
        match self {
            Frame::Text(text) => Message::Text(text),
            Frame::Close(code) => Message::Close(code.map(|code| CloseFrame {
                code: CloseCode::from(code),
                reason: Cow::Borrowed(""),
            })),
        }
    }

    fn from_message(message: Message) -> Option<Self> {
        match message {
            Message::Text(text) => Some(Frame::Text(text)),
            Message::Close(frame) => Some(Frame::Close(frame.map(|f| u16::from(f.code)))),
            other => {
                trace!("Ignoring non-text signaling frame: {:?}", other);
                None
            }
        }
    }
}

/// Outbound half of a signaling channel
pub type FrameSink = Pin<Box<dyn Sink<Frame, Error = TileCastError> + Send>>;

/// Inbound half of a signaling channel
pub type FrameStream = Pin<Box<dyn Stream<Item = Result<Frame>> + Send>>;

/// An established signaling connection
pub struct SignalingChannel {
    /// Frames sent to the server
    pub sink: FrameSink,
    /// Frames received from the server
    pub stream: FrameStream,
}

impl fmt::Debug for SignalingChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SignalingChannel").finish_non_exhaustive()
    }
}

/// Which side of a stream a signaling connection represents
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StreamRole {
    /// The broadcasting side (offers media)
    Sender,
    /// The viewing side (answers)
    Receiver,
}

impl StreamRole {
    /// Query-string value for this role
    pub fn as_str(&self) -> &'static str {
        match self {
            StreamRole::Sender => "sender",
            StreamRole::Receiver => "receiver",
        }
    }

    /// Parse a query-string value
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "sender" => Some(StreamRole::Sender),
            "receiver" => Some(StreamRole::Receiver),
            _ => None,
        }
    }

    /// The role on the other end of the stream
    pub fn counterpart(&self) -> Self {
        match self {
            StreamRole::Sender => StreamRole::Receiver,
            StreamRole::Receiver => StreamRole::Sender,
        }
    }
}

/// Build the signaling URL for a stream: `ws://<host>:<port>/<stream_id>?mode=<role>`
pub fn signaling_url(host: &str, port: u16, stream_id: &str, role: StreamRole) -> String {
    format!("ws://{}:{}/{}?mode={}", host, port, stream_id, role.as_str())
}

/// Split a request target of the form `/<stream_id>?mode=<role>`
///
/// Returns `None` when the stream id is empty, contains a further path
/// segment, or the mode is missing or unknown.
pub fn parse_signaling_target(target: &str) -> Option<(String, StreamRole)> {
    let (path, query) = target.split_once('?')?;
    let stream_id = path.strip_prefix('/')?;
    if stream_id.is_empty() || stream_id.contains('/') {
        return None;
    }

    let role = query
        .split('&')
        .filter_map(|pair| pair.split_once('='))
        .find(|(key, _)| *key == "mode")
        .and_then(|(_, value)| StreamRole::parse(value))?;

    Some((stream_id.to_string(), role))
}

/// Opens signaling channels
#[async_trait]
pub trait TransportConnector: Send + Sync + fmt::Debug {
    /// Connect to the given signaling URL
    async fn connect(&self, url: &str) -> Result<SignalingChannel>;
}

/// WebSocket signaling connector
#[derive(Debug, Clone)]
pub struct WebSocketConnector {
    connect_timeout: Duration,
}

impl WebSocketConnector {
    /// Create a connector with the given handshake timeout
    pub fn new(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }

    /// Handshake timeout
    pub fn connect_timeout(&self) -> Duration {
        self.connect_timeout
    }
}

impl Default for WebSocketConnector {
    fn default() -> Self {
        Self::new(DEFAULT_CONNECT_TIMEOUT)
    }
}

#[async_trait]
impl TransportConnector for WebSocketConnector {
    async fn connect(&self, url: &str) -> Result<SignalingChannel> {
        let (ws_stream, _) = tokio::time::timeout(self.connect_timeout, connect_async(url))
            .await
            .map_err(|_| TileCastError::ConnectionTimeout {
                url: url.to_string(),
                timeout: self.connect_timeout,
            })?
            .map_err(|e| TileCastError::Transport {
                reason: format!("WebSocket connection to {} failed: {}", url, e),
            })?;

        debug!("WebSocket signaling connection established: {}", url);

        let (write, read) = ws_stream.split();
        let sink = write
            .sink_map_err(TileCastError::from)
            .with(|frame: Frame| future::ready(Ok::<_, TileCastError>(frame.into_message())));
        let stream = read.filter_map(|message| {
            future::ready(match message {
                Ok(message) => Frame::from_message(message).map(Ok),
                Err(e) => Some(Err(TileCastError::from(e))),
            })
        });

        Ok(SignalingChannel {
            sink: Box::pin(sink),
            stream: Box::pin(stream),
        })
    }
}

/// In-process connector; every successful `connect` yields a
/// [`MemoryEndpoint`] from the paired [`MemoryListener`]
#[derive(Debug, Clone)]
pub struct MemoryConnector {
    accepted: mpsc::UnboundedSender<MemoryEndpoint>,
    refusing: Arc<AtomicBool>,
}

/// Server side of a [`MemoryConnector`]
#[derive(Debug)]
pub struct MemoryListener {
    accepted: mpsc::UnboundedReceiver<MemoryEndpoint>,
}

/// Server end of one in-process signaling connection
pub struct MemoryEndpoint {
    url: String,
    inbound: fmpsc::UnboundedReceiver<Frame>,
    outbound: fmpsc::UnboundedSender<Result<Frame>>,
}

impl MemoryConnector {
    /// Create a connector and its listener
    pub fn new() -> (Self, MemoryListener) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                accepted: tx,
                refusing: Arc::new(AtomicBool::new(false)),
            },
            MemoryListener { accepted: rx },
        )
    }

    /// Make subsequent connects fail (or succeed again)
    pub fn set_refusing(&self, refusing: bool) {
        self.refusing.store(refusing, Ordering::SeqCst);
    }
}

#[async_trait]
impl TransportConnector for MemoryConnector {
    async fn connect(&self, url: &str) -> Result<SignalingChannel> {
        if self.refusing.load(Ordering::SeqCst) {
            return Err(TileCastError::Transport {
                reason: format!("connection to {} refused", url),
            });
        }

        let (client_tx, server_rx) = fmpsc::unbounded::<Frame>();
        let (server_tx, client_rx) = fmpsc::unbounded::<Result<Frame>>();

        self.accepted
            .send(MemoryEndpoint {
                url: url.to_string(),
                inbound: server_rx,
                outbound: server_tx,
            })
            .map_err(|_| TileCastError::Transport {
                reason: format!("no listener for {}", url),
            })?;

        Ok(SignalingChannel {
            sink: Box::pin(client_tx.sink_map_err(|_| TileCastError::TransportClosed)),
            stream: Box::pin(client_rx),
        })
    }
}

impl MemoryListener {
    /// Wait for the next connection
    pub async fn accept(&mut self) -> Option<MemoryEndpoint> {
        self.accepted.recv().await
    }

    /// Take a connection if one is already pending
    pub fn try_accept(&mut self) -> Option<MemoryEndpoint> {
        self.accepted.try_recv().ok()
    }
}

impl fmt::Debug for MemoryEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryEndpoint").field("url", &self.url).finish()
    }
}

impl MemoryEndpoint {
    /// URL the client dialed
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Next frame from the client; `None` once the client dropped its sink
    pub async fn recv(&mut self) -> Option<Frame> {
        self.inbound.next().await
    }

    /// Send a text frame to the client
    pub fn send_text(&self, text: impl Into<String>) -> Result<()> {
        self.push(Ok(Frame::Text(text.into())))
    }

    /// Send a close frame to the client
    pub fn close(&self, code: u16) -> Result<()> {
        self.push(Ok(Frame::Close(Some(code))))
    }

    /// Deliver a transport error to the client
    pub fn fail(&self, reason: impl Into<String>) -> Result<()> {
        self.push(Err(TileCastError::Transport {
            reason: reason.into(),
        }))
    }

    fn push(&self, item: Result<Frame>) -> Result<()> {
        self.outbound
            .unbounded_send(item)
            .map_err(|_| TileCastError::TransportClosed)
    }
}
