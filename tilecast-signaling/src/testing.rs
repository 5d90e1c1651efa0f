//! Scripted peer connections
//!
//! [`MockPeerConnection`] records every call a session makes and lets a test
//! emit local ICE candidates on demand. [`MockPeerFactory`] hands them out
//! and keeps them for inspection.

use crate::peer::{IceCandidateHandler, PeerConnection, PeerConnectionFactory, SignalingState};
use crate::protocol::{IceCandidate, SdpType, SessionDescription};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tilecast_core::{Result, TileCastError};
use tilecast_media::{CapturedTrack, MediaStream};

/// A call made on a [`MockPeerConnection`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerCall {
    /// `add_track`
    AddTrack {
        /// Track ID
        track_id: String,
        /// Stream ID
        stream_id: String,
    },
    /// `create_offer`
    CreateOffer,
    /// `set_local_description`
    SetLocalDescription(SessionDescription),
    /// `set_remote_description`
    SetRemoteDescription(SessionDescription),
    /// `add_ice_candidate`
    AddIceCandidate(IceCandidate),
    /// `close`
    Close,
}

/// In-memory peer connection
pub struct MockPeerConnection {
    index: usize,
    calls: Mutex<Vec<PeerCall>>,
    state: Mutex<SignalingState>,
    handler: Mutex<Option<IceCandidateHandler>>,
    offer_delay: Option<Duration>,
    reject_remote: AtomicBool,
}

impl MockPeerConnection {
    /// Create a peer; `index` is embedded in its offers
    pub fn new(index: usize) -> Self {
        Self {
            index,
            calls: Mutex::new(Vec::new()),
            state: Mutex::new(SignalingState::Stable),
            handler: Mutex::new(None),
            offer_delay: None,
            reject_remote: AtomicBool::new(false),
        }
    }

    /// Delay `create_offer` by `delay`
    pub fn with_offer_delay(mut self, delay: Duration) -> Self {
        self.offer_delay = Some(delay);
        self
    }

    /// SDP of the offers this peer creates
    pub fn offer_sdp(&self) -> String {
        format!("v=0\r\no=mock {} 0 IN IP4 127.0.0.1\r\n", self.index)
    }

    /// Every call so far, in order
    pub fn calls(&self) -> Vec<PeerCall> {
        self.calls.lock().clone()
    }

    /// Remote descriptions applied so far
    pub fn remote_descriptions(&self) -> Vec<SessionDescription> {
        self.calls
            .lock()
            .iter()
            .filter_map(|call| match call {
                PeerCall::SetRemoteDescription(description) => Some(description.clone()),
                _ => None,
            })
            .collect()
    }

    /// Remote candidates added so far
    pub fn remote_candidates(&self) -> Vec<IceCandidate> {
        self.calls
            .lock()
            .iter()
            .filter_map(|call| match call {
                PeerCall::AddIceCandidate(candidate) => Some(candidate.clone()),
                _ => None,
            })
            .collect()
    }

    /// How many times `close` was called
    pub fn close_count(&self) -> usize {
        self.calls
            .lock()
            .iter()
            .filter(|call| **call == PeerCall::Close)
            .count()
    }

    /// Whether a local candidate handler is registered
    pub fn has_candidate_handler(&self) -> bool {
        self.handler.lock().is_some()
    }

    /// Emit a local candidate through the registered handler
    pub fn emit_candidate(&self, candidate: Option<IceCandidate>) {
        if let Some(handler) = self.handler.lock().as_ref() {
            handler(candidate);
        }
    }

    /// Force the signaling state
    pub fn set_signaling_state(&self, state: SignalingState) {
        *self.state.lock() = state;
    }

    /// Make `set_remote_description` fail
    pub fn reject_remote_descriptions(&self, reject: bool) {
        self.reject_remote.store(reject, Ordering::SeqCst);
    }

    fn record(&self, call: PeerCall) {
        self.calls.lock().push(call);
    }

    fn ensure_open(&self) -> Result<()> {
        if *self.state.lock() == SignalingState::Closed {
            return Err(TileCastError::PeerConnection {
                reason: "peer connection is closed".to_string(),
            });
        }
        Ok(())
    }
}

impl fmt::Debug for MockPeerConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MockPeerConnection")
            .field("index", &self.index)
            .field("state", &*self.state.lock())
            .finish()
    }
}

#[async_trait]
impl PeerConnection for MockPeerConnection {
    async fn add_track(&self, track: &CapturedTrack, stream: &MediaStream) -> Result<()> {
        self.ensure_open()?;
        self.record(PeerCall::AddTrack {
            track_id: track.id().to_string(),
            stream_id: stream.id().to_string(),
        });
        Ok(())
    }

    async fn create_offer(&self) -> Result<SessionDescription> {
        self.ensure_open()?;
        self.record(PeerCall::CreateOffer);
        if let Some(delay) = self.offer_delay {
            tokio::time::sleep(delay).await;
        }
        Ok(SessionDescription::offer(self.offer_sdp()))
    }

    async fn set_local_description(&self, description: SessionDescription) -> Result<()> {
        self.ensure_open()?;
        if description.sdp_type == SdpType::Offer {
            *self.state.lock() = SignalingState::HaveLocalOffer;
        }
        self.record(PeerCall::SetLocalDescription(description));
        Ok(())
    }

    async fn set_remote_description(&self, description: SessionDescription) -> Result<()> {
        self.ensure_open()?;
        self.record(PeerCall::SetRemoteDescription(description));
        if self.reject_remote.load(Ordering::SeqCst) {
            return Err(TileCastError::PeerConnection {
                reason: "remote description rejected".to_string(),
            });
        }
        *self.state.lock() = SignalingState::Stable;
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()> {
        self.ensure_open()?;
        self.record(PeerCall::AddIceCandidate(candidate));
        Ok(())
    }

    fn on_ice_candidate(&self, handler: IceCandidateHandler) {
        *self.handler.lock() = Some(handler);
    }

    fn signaling_state(&self) -> SignalingState {
        *self.state.lock()
    }

    async fn close(&self) -> Result<()> {
        *self.state.lock() = SignalingState::Closed;
        self.record(PeerCall::Close);
        Ok(())
    }
}

/// Factory handing out [`MockPeerConnection`]s
#[derive(Default)]
pub struct MockPeerFactory {
    created: Mutex<Vec<Arc<MockPeerConnection>>>,
    offer_delay: Mutex<Option<Duration>>,
    failures: AtomicUsize,
}

impl MockPeerFactory {
    /// Create a factory
    pub fn new() -> Self {
        Self::default()
    }

    /// Peers created from now on delay their offers by `delay`
    pub fn set_offer_delay(&self, delay: Option<Duration>) {
        *self.offer_delay.lock() = delay;
    }

    /// Make the next `count` creations fail
    pub fn fail_next(&self, count: usize) {
        self.failures.store(count, Ordering::SeqCst);
    }

    /// Every peer created so far
    pub fn peers(&self) -> Vec<Arc<MockPeerConnection>> {
        self.created.lock().clone()
    }

    /// Peer created at `index`
    pub fn peer(&self, index: usize) -> Option<Arc<MockPeerConnection>> {
        self.created.lock().get(index).cloned()
    }

    /// Number of peers created so far
    pub fn created_count(&self) -> usize {
        self.created.lock().len()
    }
}

impl fmt::Debug for MockPeerFactory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MockPeerFactory")
            .field("created", &self.created_count())
            .finish()
    }
}

#[async_trait]
impl PeerConnectionFactory for MockPeerFactory {
    async fn create(&self) -> Result<Arc<dyn PeerConnection>> {
        let failing = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(TileCastError::PeerConnection {
                reason: "peer creation failed".to_string(),
            });
        }

        let mut created = self.created.lock();
        let mut peer = MockPeerConnection::new(created.len());
        if let Some(delay) = *self.offer_delay.lock() {
            peer = peer.with_offer_delay(delay);
        }
        let peer = Arc::new(peer);
        created.push(Arc::clone(&peer));
        Ok(peer)
    }
}
