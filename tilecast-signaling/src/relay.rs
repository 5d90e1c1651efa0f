//! Companion signaling relay
//!
//! A minimal WebSocket server pairing one sender and one receiver per stream
//! ID. Clients connect to `/<stream_id>?mode=sender|receiver`; text frames
//! from one role are forwarded verbatim to the other. Frames sent before the
//! counterpart joins are buffered and flushed when it connects.

use dashmap::DashMap;
use futures::{SinkExt, StreamExt};
use std::borrow::Cow;
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tilecast_core::{parse_signaling_target, Result, StreamRole, TileCastError, NORMAL_CLOSURE};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::accept_hdr_async;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;

/// Frames buffered per direction while the counterpart is absent
const MAX_PENDING_FRAMES: usize = 256;

#[derive(Debug)]
struct Peer {
    connection_id: u64,
    tx: mpsc::UnboundedSender<Message>,
}

/// Both ends of one stream plus frames waiting for an absent end
#[derive(Debug, Default)]
struct StreamSlot {
    sender: Option<Peer>,
    receiver: Option<Peer>,
    pending_for_sender: VecDeque<String>,
    pending_for_receiver: VecDeque<String>,
}

impl StreamSlot {
    fn peer_mut(&mut self, role: StreamRole) -> &mut Option<Peer> {
        match role {
            StreamRole::Sender => &mut self.sender,
            StreamRole::Receiver => &mut self.receiver,
        }
    }

    fn pending_mut(&mut self, role: StreamRole) -> &mut VecDeque<String> {
        match role {
            StreamRole::Sender => &mut self.pending_for_sender,
            StreamRole::Receiver => &mut self.pending_for_receiver,
        }
    }

    fn is_vacant(&self) -> bool {
        self.sender.is_none()
            && self.receiver.is_none()
            && self.pending_for_sender.is_empty()
            && self.pending_for_receiver.is_empty()
    }
}

fn normal_close() -> Message {
    Message::Close(Some(CloseFrame {
        code: CloseCode::from(NORMAL_CLOSURE),
        reason: Cow::Borrowed(""),
    }))
}

/// Sender/receiver relay for broadcast signaling
#[derive(Debug, Clone)]
pub struct SignalingRelay {
    /// Address the relay binds to
    pub bind_addr: SocketAddr,
    streams: Arc<DashMap<String, StreamSlot>>,
    next_connection: Arc<AtomicU64>,
}

impl SignalingRelay {
    /// Create a relay for `bind_addr`
    pub fn new(bind_addr: SocketAddr) -> Self {
        Self {
            bind_addr,
            streams: Arc::new(DashMap::new()),
            next_connection: Arc::new(AtomicU64::new(1)),
        }
    }

    /// Bind and serve forever
    pub async fn start(&self) -> Result<()> {
        let listener = TcpListener::bind(self.bind_addr).await.map_err(|e| {
            TileCastError::ServerStartFailed {
                address: self.bind_addr,
                source: e.into(),
            }
        })?;
        self.serve(listener).await
    }

    /// Serve connections accepted from an already bound listener
    pub async fn serve(&self, listener: TcpListener) -> Result<()> {
        let address = listener.local_addr().unwrap_or(self.bind_addr);
        tracing::info!("Signaling relay listening on {}", address);

        loop {
            match listener.accept().await {
                Ok((stream, addr)) => {
                    tracing::debug!("New connection from {}", addr);
                    let relay = self.clone();
                    tokio::spawn(async move { relay.handle_connection(stream).await });
                }
                Err(e) => {
                    tracing::error!("Failed to accept connection: {}", e);
                }
            }
        }
    }

    /// Whether a sender is connected for `stream_id`
    pub fn has_sender(&self, stream_id: &str) -> bool {
        self.streams
            .get(stream_id)
            .map(|slot| slot.sender.is_some())
            .unwrap_or(false)
    }

    /// Whether a receiver is connected for `stream_id`
    pub fn has_receiver(&self, stream_id: &str) -> bool {
        self.streams
            .get(stream_id)
            .map(|slot| slot.receiver.is_some())
            .unwrap_or(false)
    }

    /// Number of streams with a connected peer or buffered frames
    pub fn stream_count(&self) -> usize {
        self.streams.len()
    }

    async fn handle_connection(&self, stream: TcpStream) {
        let mut target = None;
        let callback = |request: &Request, response: Response| {
            let path = request
                .uri()
                .path_and_query()
                .map(|path| path.as_str())
                .unwrap_or("/");
            match parse_signaling_target(path) {
                Some(parsed) => {
                    target = Some(parsed);
                    Ok(response)
                }
                None => {
                    let mut error = ErrorResponse::new(Some(format!(
                        "expected /<stream_id>?mode=sender|receiver, got {}",
                        path
                    )));
                    *error.status_mut() = StatusCode::BAD_REQUEST;
                    Err(error)
                }
            }
        };

        let ws_stream = match accept_hdr_async(stream, callback).await {
            Ok(ws) => ws,
            Err(e) => {
                tracing::warn!("WebSocket handshake failed: {}", e);
                return;
            }
        };
        let Some((stream_id, role)) = target else {
            return;
        };

        let connection_id = self.next_connection.fetch_add(1, Ordering::SeqCst);
        let (tx, mut rx) = mpsc::unbounded_channel::<Message>();
        let (mut write, mut read) = ws_stream.split();
        let writer = tokio::spawn(async move {
            while let Some(message) = rx.recv().await {
                let closing = matches!(message, Message::Close(_));
                if write.send(message).await.is_err() || closing {
                    break;
                }
            }
        });

        self.join(&stream_id, role, Peer { connection_id, tx });
        tracing::info!("{} connected to stream {}", role.as_str(), stream_id);

        while let Some(message) = read.next().await {
            match message {
                Ok(Message::Text(text)) => self.forward(&stream_id, role, text),
                Ok(Message::Close(_)) => break,
                Err(e) => {
                    tracing::debug!("Connection {} error: {}", connection_id, e);
                    break;
                }
                _ => {
                    // Binary, Ping, Pong
                }
            }
        }

        self.leave(&stream_id, role, connection_id);
        tracing::info!("{} left stream {}", role.as_str(), stream_id);
        let _ = writer.await;
    }

    fn join(&self, stream_id: &str, role: StreamRole, peer: Peer) {
        let mut slot = self.streams.entry(stream_id.to_string()).or_default();

        for text in slot.pending_mut(role).drain(..) {
            let _ = peer.tx.send(Message::Text(text));
        }
        if let Some(previous) = slot.peer_mut(role).replace(peer) {
            tracing::info!("Replacing {} on stream {}", role.as_str(), stream_id);
            let _ = previous.tx.send(normal_close());
        }
    }

    fn forward(&self, stream_id: &str, from: StreamRole, text: String) {
        let to = from.counterpart();
        let mut slot = self.streams.entry(stream_id.to_string()).or_default();

        let text = match slot.peer_mut(to) {
            Some(peer) => match peer.tx.send(Message::Text(text)) {
                Ok(()) => return,
                Err(mpsc::error::SendError(Message::Text(text))) => text,
                Err(_) => return,
            },
            None => text,
        };

        let pending = slot.pending_mut(to);
        if pending.len() >= MAX_PENDING_FRAMES {
            tracing::warn!("Dropping oldest buffered frame for {} on {}", to.as_str(), stream_id);
            pending.pop_front();
        }
        pending.push_back(text);
    }

    fn leave(&self, stream_id: &str, role: StreamRole, connection_id: u64) {
        if let Some(mut slot) = self.streams.get_mut(stream_id) {
            let current = slot
                .peer_mut(role)
                .as_ref()
                .map(|peer| peer.connection_id == connection_id)
                .unwrap_or(false);
            if !current {
                return;
            }
            *slot.peer_mut(role) = None;

            // A departing sender ends the stream for its viewer
            if role == StreamRole::Sender {
                slot.pending_for_receiver.clear();
                slot.pending_for_sender.clear();
                if let Some(receiver) = slot.receiver.take() {
                    let _ = receiver.tx.send(normal_close());
                }
            }
        }
        self.streams.remove_if(stream_id, |_, slot| slot.is_vacant());
    }
}
