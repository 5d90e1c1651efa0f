//! Broadcast sessions
//!
//! A session owns one peer connection and one signaling transport for a
//! single captured track. It runs as its own task: dial the transport, send
//! the offer once it opens, then relay answers and candidates until the
//! registry stops it, the track ends or the transport goes away.
//!
//! Self-triggered teardown removes the registry entry only while it still
//! belongs to this session's generation, so a late teardown never evicts a
//! replacement opened under the same stream ID.

use crate::peer::{PeerConnection, SignalingState};
use crate::protocol::{IceCandidate, SignalMessage};
use chrono::{DateTime, Utc};
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Weak};
use tilecast_core::{Frame, FrameSink, Result, SignalingChannel, TransportConnector};
use tilecast_media::CapturedTrack;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

/// Lifecycle state of a broadcast session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionState {
    /// Signaling transport being established
    Connecting,
    /// Transport open, offer sent, waiting for the answer
    Negotiating,
    /// Remote description applied
    Open,
    /// Torn down
    Closed,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::Connecting => "connecting",
            SessionState::Negotiating => "negotiating",
            SessionState::Open => "open",
            SessionState::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// Why a session ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Termination {
    /// Closed or replaced through the registry
    Stopped,
    /// The captured track ended
    TrackEnded,
    /// The server closed the transport
    TransportClosed,
    /// Dial failure or transport error
    TransportError(String),
}

pub(crate) type SessionMap = Mutex<HashMap<String, SessionHandle>>;

/// Registry-side handle of a running session
pub(crate) struct SessionHandle {
    pub(crate) generation: u64,
    pub(crate) track: CapturedTrack,
    pub(crate) state: watch::Receiver<SessionState>,
    pub(crate) started_at: DateTime<Utc>,
    stop: CancellationToken,
    task: JoinHandle<Termination>,
}

impl SessionHandle {
    pub(crate) fn new(
        generation: u64,
        track: CapturedTrack,
        state: watch::Receiver<SessionState>,
        stop: CancellationToken,
        task: JoinHandle<Termination>,
    ) -> Self {
        Self {
            generation,
            track,
            state,
            started_at: Utc::now(),
            stop,
            task,
        }
    }

    /// Signal the session to stop without waiting for it
    pub(crate) fn cancel(&self) {
        self.stop.cancel();
    }

    /// Stop the session and wait until its peer connection and transport
    /// are closed
    pub(crate) async fn shutdown(self) -> Option<Termination> {
        self.stop.cancel();
        match self.task.await {
            Ok(termination) => Some(termination),
            Err(e) => {
                warn!("Session task (generation {}) failed: {}", self.generation, e);
                None
            }
        }
    }
}

/// Task-side state of a running session
pub(crate) struct Session {
    pub(crate) stream_id: String,
    pub(crate) generation: u64,
    pub(crate) url: String,
    pub(crate) peer: Arc<dyn PeerConnection>,
    pub(crate) track: CapturedTrack,
    pub(crate) connector: Arc<dyn TransportConnector>,
    pub(crate) sessions: Weak<SessionMap>,
    pub(crate) stop: CancellationToken,
    pub(crate) state: watch::Sender<SessionState>,
}

impl Session {
    /// Drive the session to completion
    pub(crate) async fn run(
        self,
        mut candidates: mpsc::UnboundedReceiver<Option<IceCandidate>>,
    ) -> Termination {
        let ended = self.track.ended();
        tokio::pin!(ended);

        let channel = tokio::select! {
            biased;
            _ = self.stop.cancelled() => return self.teardown(None, Termination::Stopped).await,
            _ = &mut ended => return self.teardown(None, Termination::TrackEnded).await,
            connected = self.connector.connect(&self.url) => match connected {
                Ok(channel) => channel,
                Err(e) => {
                    warn!("Signaling connection for {} failed: {}", self.stream_id, e);
                    let termination = Termination::TransportError(e.to_string());
                    return self.teardown(None, termination).await;
                }
            },
        };
        let SignalingChannel {
            mut sink,
            mut stream,
        } = channel;
        debug!("Signaling transport open for {}", self.stream_id);

        // Candidates gathered while dialing are not replayed
        while let Ok(candidate) = candidates.try_recv() {
            trace!("Dropping early candidate for {}: {:?}", self.stream_id, candidate);
        }

        // The offer is dropped unsent if the transport goes away first
        let mut early = Vec::new();
        let interrupted = {
            let negotiation = self.negotiate(&mut sink);
            tokio::pin!(negotiation);
            loop {
                tokio::select! {
                    biased;
                    _ = self.stop.cancelled() => break None,
                    _ = &mut ended => break Some(Termination::TrackEnded),
                    frame = stream.next() => match frame {
                        Some(Ok(Frame::Text(text))) => early.push(text),
                        gone => break Some(self.transport_gone(gone)),
                    },
                    _ = &mut negotiation => break None,
                }
            }
        };
        if let Some(termination) = interrupted {
            let sink = (termination == Termination::TrackEnded).then_some(sink);
            return self.teardown(sink, termination).await;
        }
        for text in early {
            self.handle_message(&text).await;
        }

        let mut transport_open = true;
        let termination = loop {
            tokio::select! {
                biased;
                _ = self.stop.cancelled() => break Termination::Stopped,
                _ = &mut ended => break Termination::TrackEnded,
                frame = stream.next() => match frame {
                    Some(Ok(Frame::Text(text))) => self.handle_message(&text).await,
                    gone => {
                        transport_open = false;
                        break self.transport_gone(gone);
                    }
                },
                Some(candidate) = candidates.recv() => {
                    self.send_candidate(&mut sink, candidate).await;
                }
            }
        };

        let sink = if transport_open { Some(sink) } else { None };
        self.teardown(sink, termination).await
    }

    /// Classify an inbound item that ends the transport
    fn transport_gone(&self, frame: Option<Result<Frame>>) -> Termination {
        match frame {
            Some(Ok(Frame::Close(code))) => {
                debug!("Signaling transport for {} closed by server ({:?})", self.stream_id, code);
                Termination::TransportClosed
            }
            Some(Err(e)) => {
                warn!("Signaling transport error for {}: {}", self.stream_id, e);
                Termination::TransportError(e.to_string())
            }
            Some(Ok(Frame::Text(_))) | None => {
                debug!("Signaling transport for {} ended", self.stream_id);
                Termination::TransportClosed
            }
        }
    }

    async fn negotiate(&self, sink: &mut FrameSink) {
        if self.peer.signaling_state() == SignalingState::Closed {
            debug!("Peer connection for {} already closed, not offering", self.stream_id);
            return;
        }
        self.transition(SessionState::Negotiating);

        let offer = match self.peer.create_offer().await {
            Ok(offer) => offer,
            Err(e) => {
                warn!("Failed to create offer for {}: {}", self.stream_id, e);
                return;
            }
        };
        if let Err(e) = self.peer.set_local_description(offer.clone()).await {
            warn!("Failed to apply local offer for {}: {}", self.stream_id, e);
            return;
        }
        if self.stop.is_cancelled() {
            debug!("Session {} stopped during negotiation, offer dropped", self.stream_id);
            return;
        }
        self.send(sink, SignalMessage::Sdp(offer)).await;
    }

    async fn handle_message(&self, text: &str) {
        match SignalMessage::parse(text) {
            Ok(Some(SignalMessage::Sdp(description))) => {
                match self.peer.set_remote_description(description).await {
                    Ok(()) => {
                        debug!("Remote description applied for {}", self.stream_id);
                        self.transition(SessionState::Open);
                    }
                    Err(e) => warn!("Failed to apply remote description for {}: {}", self.stream_id, e),
                }
            }
            Ok(Some(SignalMessage::Candidate(candidate))) => {
                if let Err(e) = self.peer.add_ice_candidate(candidate).await {
                    warn!("Failed to add remote candidate for {}: {}", self.stream_id, e);
                }
            }
            Ok(None) => trace!("Ignoring signaling message for {}: {}", self.stream_id, text),
            Err(e) => warn!("Malformed signaling message for {}: {}", self.stream_id, e),
        }
    }

    async fn send_candidate(&self, sink: &mut FrameSink, candidate: Option<IceCandidate>) {
        match candidate {
            Some(candidate) if !self.stop.is_cancelled() => {
                self.send(sink, SignalMessage::Candidate(candidate)).await;
            }
            Some(_) => trace!("Session {} stopping, candidate dropped", self.stream_id),
            None => trace!("Candidate gathering complete for {}", self.stream_id),
        }
    }

    async fn send(&self, sink: &mut FrameSink, message: SignalMessage) {
        let text = match message.to_json() {
            Ok(text) => text,
            Err(e) => {
                warn!("Failed to encode {} for {}: {}", message.kind(), self.stream_id, e);
                return;
            }
        };
        if let Err(e) = sink.send(Frame::Text(text)).await {
            warn!("Failed to send {} for {}: {}", message.kind(), self.stream_id, e);
        }
    }

    fn transition(&self, next: SessionState) {
        let changed = self.state.send_if_modified(|state| {
            if *state == next || *state == SessionState::Closed {
                false
            } else {
                *state = next;
                true
            }
        });
        if changed {
            debug!("Session {} is now {}", self.stream_id, next);
        }
    }

    async fn teardown(self, sink: Option<FrameSink>, termination: Termination) -> Termination {
        if termination != Termination::Stopped {
            self.retire();
        }
        self.transition(SessionState::Closed);

        if let Err(e) = self.peer.close().await {
            debug!("Ignoring peer close error for {}: {}", self.stream_id, e);
        }
        if let Some(mut sink) = sink {
            if let Err(e) = sink.send(Frame::normal_close()).await {
                debug!("Ignoring transport close error for {}: {}", self.stream_id, e);
            }
        }

        info!("Stopped stream: {} ({:?})", self.stream_id, termination);
        termination
    }

    /// Remove this session's registry entry if it has not been replaced
    fn retire(&self) {
        let Some(sessions) = self.sessions.upgrade() else {
            return;
        };
        let mut sessions = sessions.lock();
        let current = sessions
            .get(&self.stream_id)
            .map(|handle| handle.generation == self.generation)
            .unwrap_or(false);
        if current {
            sessions.remove(&self.stream_id);
        } else {
            trace!(
                "Session {} (generation {}) already replaced",
                self.stream_id,
                self.generation
            );
        }
    }
}
