//! # tilecast signaling
//!
//! Broadcast sessions and their registry, the JSON signaling protocol, the
//! peer connection abstraction over `webrtc`, and the companion relay that
//! pairs a broadcaster with a viewer per stream ID.

#![deny(missing_docs)]
#![warn(clippy::all)]

pub mod peer;
pub mod protocol;
pub mod registry;
pub mod relay;
mod session;
#[cfg(any(test, feature = "testing"))]
pub mod testing;

// Re-export main types
pub use peer::{
    IceCandidateHandler, PeerConfig, PeerConnection, PeerConnectionFactory, RtcPeerConnection,
    RtcPeerFactory, SignalingState,
};
pub use protocol::{IceCandidate, SdpType, SessionDescription, SignalMessage};
pub use registry::{BroadcastRegistry, RegistryConfig, SessionInfo};
pub use relay::SignalingRelay;
pub use session::SessionState;
