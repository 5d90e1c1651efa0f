//! Peer connections
//!
//! Broadcast sessions drive a send-only peer connection through the
//! [`PeerConnection`] trait. [`RtcPeerFactory`] builds real connections on
//! the `webrtc` stack; the `testing` module (feature `testing`) provides a
//! scripted one.

use crate::protocol::{IceCandidate, SdpType, SessionDescription};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tilecast_core::{Result, TileCastError};
use tilecast_media::{CapturedTrack, MediaStream};
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::{APIBuilder, API};
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::media::Sample;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::signaling_state::RTCSignalingState;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;

/// Callback receiving locally gathered ICE candidates; `None` marks the end
/// of gathering
pub type IceCandidateHandler = Box<dyn Fn(Option<IceCandidate>) + Send + Sync>;

/// Offer/answer state of a peer connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SignalingState {
    /// No negotiation in progress
    Stable,
    /// Local offer applied
    HaveLocalOffer,
    /// Remote offer applied
    HaveRemoteOffer,
    /// Local provisional answer applied
    HaveLocalPranswer,
    /// Remote provisional answer applied
    HaveRemotePranswer,
    /// Connection closed
    Closed,
}

/// Send-only peer connection used by a broadcast session
#[async_trait]
pub trait PeerConnection: Send + Sync + fmt::Debug {
    /// Attach `track`, announced as part of `stream`
    async fn add_track(&self, track: &CapturedTrack, stream: &MediaStream) -> Result<()>;

    /// Create an offer
    async fn create_offer(&self) -> Result<SessionDescription>;

    /// Apply a local description
    async fn set_local_description(&self, description: SessionDescription) -> Result<()>;

    /// Apply the remote description
    async fn set_remote_description(&self, description: SessionDescription) -> Result<()>;

    /// Add a remote ICE candidate
    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()>;

    /// Register the local candidate callback, replacing any previous one
    fn on_ice_candidate(&self, handler: IceCandidateHandler);

    /// Current signaling state
    fn signaling_state(&self) -> SignalingState;

    /// Close the connection
    async fn close(&self) -> Result<()>;
}

/// Creates peer connections for new sessions
#[async_trait]
pub trait PeerConnectionFactory: Send + Sync + fmt::Debug {
    /// Create a fresh peer connection
    async fn create(&self) -> Result<Arc<dyn PeerConnection>>;
}

/// Peer connection settings
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PeerConfig {
    /// STUN/TURN server URLs; empty for host candidates only
    pub ice_servers: Vec<String>,
}

impl PeerConfig {
    /// Use the given ICE server URLs
    pub fn with_ice_servers<I, S>(mut self, servers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.ice_servers = servers.into_iter().map(Into::into).collect();
        self
    }
}

fn peer_error(error: impl fmt::Display) -> TileCastError {
    TileCastError::PeerConnection {
        reason: error.to_string(),
    }
}

/// Builds [`RtcPeerConnection`]s on the `webrtc` stack
pub struct RtcPeerFactory {
    api: API,
    config: PeerConfig,
}

impl RtcPeerFactory {
    /// Create a factory with default codecs and interceptors registered
    pub fn new(config: PeerConfig) -> Result<Self> {
        let mut media_engine = MediaEngine::default();
        media_engine.register_default_codecs().map_err(peer_error)?;

        let registry = register_default_interceptors(Registry::new(), &mut media_engine)
            .map_err(peer_error)?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        Ok(Self { api, config })
    }

    fn rtc_configuration(&self) -> RTCConfiguration {
        let ice_servers = if self.config.ice_servers.is_empty() {
            Vec::new()
        } else {
            vec![RTCIceServer {
                urls: self.config.ice_servers.clone(),
                ..Default::default()
            }]
        };
        RTCConfiguration {
            ice_servers,
            ..Default::default()
        }
    }
}

impl fmt::Debug for RtcPeerFactory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RtcPeerFactory")
            .field("config", &self.config)
            .finish()
    }
}

#[async_trait]
impl PeerConnectionFactory for RtcPeerFactory {
    async fn create(&self) -> Result<Arc<dyn PeerConnection>> {
        let connection = self
            .api
            .new_peer_connection(self.rtc_configuration())
            .await
            .map_err(peer_error)?;
        Ok(Arc::new(RtcPeerConnection::new(Arc::new(connection))))
    }
}

/// [`PeerConnection`] backed by an `RTCPeerConnection`
///
/// Each added track gets a sample track bound to the stream ID; a forwarder
/// task copies the captured track's samples into it until the track ends or
/// the connection closes.
pub struct RtcPeerConnection {
    inner: Arc<RTCPeerConnection>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl RtcPeerConnection {
    /// Wrap an existing connection
    pub fn new(inner: Arc<RTCPeerConnection>) -> Self {
        Self {
            inner,
            tasks: Mutex::new(Vec::new()),
        }
    }
}

impl fmt::Debug for RtcPeerConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RtcPeerConnection")
            .field("signaling_state", &self.signaling_state())
            .finish()
    }
}

#[async_trait]
impl PeerConnection for RtcPeerConnection {
    async fn add_track(&self, track: &CapturedTrack, stream: &MediaStream) -> Result<()> {
        let codec = track.codec();
        let local = Arc::new(TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: codec.mime_type.clone(),
                clock_rate: codec.clock_rate,
                channels: codec.channels,
                ..Default::default()
            },
            track.id().to_string(),
            stream.id().to_string(),
        ));

        let sender = self
            .inner
            .add_track(Arc::clone(&local) as Arc<dyn TrackLocal + Send + Sync>)
            .await
            .map_err(peer_error)?;

        // Interceptors only run while RTCP is being read
        let rtcp = tokio::spawn(async move {
            let mut buf = vec![0u8; 1500];
            while sender.read(&mut buf).await.is_ok() {}
        });

        let track_id = track.id().to_string();
        let mut samples = track.subscribe_samples();
        let ended = track.ended();
        let forwarder = tokio::spawn(async move {
            tokio::pin!(ended);
            loop {
                tokio::select! {
                    _ = &mut ended => break,
                    received = samples.recv() => match received {
                        Ok(sample) => {
                            let sample = Sample {
                                data: sample.data,
                                duration: sample.duration,
                                ..Default::default()
                            };
                            if let Err(e) = local.write_sample(&sample).await {
                                debug!("Sample write for track {} failed: {}", track_id, e);
                                break;
                            }
                        }
                        Err(RecvError::Lagged(skipped)) => {
                            trace!("Track {} forwarder skipped {} samples", track_id, skipped);
                        }
                        Err(RecvError::Closed) => break,
                    },
                }
            }
        });

        self.tasks.lock().extend([rtcp, forwarder]);
        Ok(())
    }

    async fn create_offer(&self) -> Result<SessionDescription> {
        let offer = self.inner.create_offer(None).await.map_err(peer_error)?;
        from_rtc_description(offer)
    }

    async fn set_local_description(&self, description: SessionDescription) -> Result<()> {
        self.inner
            .set_local_description(to_rtc_description(description)?)
            .await
            .map_err(peer_error)
    }

    async fn set_remote_description(&self, description: SessionDescription) -> Result<()> {
        self.inner
            .set_remote_description(to_rtc_description(description)?)
            .await
            .map_err(peer_error)
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()> {
        self.inner
            .add_ice_candidate(candidate.into())
            .await
            .map_err(peer_error)
    }

    fn on_ice_candidate(&self, handler: IceCandidateHandler) {
        self.inner
            .on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
                let candidate = candidate.and_then(|candidate| match candidate.to_json() {
                    Ok(init) => Some(IceCandidate::from(init)),
                    Err(e) => {
                        warn!("Dropping unserializable local candidate: {}", e);
                        None
                    }
                });
                handler(candidate);
                Box::pin(async {})
            }));
    }

    fn signaling_state(&self) -> SignalingState {
        match self.inner.signaling_state() {
            RTCSignalingState::HaveLocalOffer => SignalingState::HaveLocalOffer,
            RTCSignalingState::HaveRemoteOffer => SignalingState::HaveRemoteOffer,
            RTCSignalingState::HaveLocalPranswer => SignalingState::HaveLocalPranswer,
            RTCSignalingState::HaveRemotePranswer => SignalingState::HaveRemotePranswer,
            RTCSignalingState::Closed => SignalingState::Closed,
            _ => SignalingState::Stable,
        }
    }

    async fn close(&self) -> Result<()> {
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
        self.inner.close().await.map_err(peer_error)
    }
}

fn to_rtc_description(description: SessionDescription) -> Result<RTCSessionDescription> {
    match description.sdp_type {
        SdpType::Offer => RTCSessionDescription::offer(description.sdp),
        SdpType::Answer => RTCSessionDescription::answer(description.sdp),
        SdpType::Pranswer => RTCSessionDescription::pranswer(description.sdp),
        SdpType::Rollback => return Err(peer_error("rollback descriptions are not supported")),
    }
    .map_err(peer_error)
}

fn from_rtc_description(description: RTCSessionDescription) -> Result<SessionDescription> {
    let sdp_type = match description.sdp_type {
        RTCSdpType::Offer => SdpType::Offer,
        RTCSdpType::Answer => SdpType::Answer,
        RTCSdpType::Pranswer => SdpType::Pranswer,
        RTCSdpType::Rollback => SdpType::Rollback,
        RTCSdpType::Unspecified => return Err(peer_error("unspecified description type")),
    };
    Ok(SessionDescription {
        sdp_type,
        sdp: description.sdp,
    })
}

impl From<RTCIceCandidateInit> for IceCandidate {
    fn from(init: RTCIceCandidateInit) -> Self {
        Self {
            candidate: init.candidate,
            sdp_mid: init.sdp_mid,
            sdp_mline_index: init.sdp_mline_index,
            username_fragment: init.username_fragment,
        }
    }
}

impl From<IceCandidate> for RTCIceCandidateInit {
    fn from(candidate: IceCandidate) -> Self {
        Self {
            candidate: candidate.candidate,
            sdp_mid: candidate.sdp_mid,
            sdp_mline_index: candidate.sdp_mline_index,
            username_fragment: candidate.username_fragment,
        }
    }
}
