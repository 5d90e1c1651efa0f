//! # tilecast
//!
//! Broadcasts the live video tiles of a call as individual WebRTC streams.
//! The host hands over video elements as they appear; the
//! [`CaptureCoordinator`] captures the ones that are genuine live sources,
//! derives a stable stream key from the participant tile and starts one
//! broadcast session per captured track through the [`BroadcastRegistry`].
//! Each session signals over a WebSocket to a companion server that relays
//! the offer to a viewer.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use tilecast::{
//!     CaptureConfig, CaptureCoordinator, ElementSource, PeerConfig, RegistryConfig, VideoElement,
//! };
//!
//! #[derive(Debug)]
//! struct Document;
//!
//! impl ElementSource for Document {
//!     fn video_elements(&self) -> Vec<Arc<dyn VideoElement>> {
//!         Vec::new()
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() -> Result<(), tilecast::TileCastError> {
//!     tilecast::init_logging()?;
//!
//!     let coordinator = CaptureCoordinator::webrtc(
//!         CaptureConfig::default(),
//!         RegistryConfig::default(),
//!         PeerConfig::default(),
//!         Arc::new(Document),
//!     )?;
//!
//!     // Pick up whatever is already on screen
//!     coordinator.rescan().await;
//!
//!     coordinator.shutdown().await;
//!     Ok(())
//! }
//! ```

#![deny(missing_docs)]
#![warn(clippy::all)]

// Re-export core types for easy access
pub use tilecast_core::{
    MemoryConnector, Result, StreamRole, TileCastError, TransportConnector, WebSocketConnector,
};

pub use tilecast_media::{
    derive_identity, is_valid_source, CapturedTrack, ElementSource, MediaSample, MediaStream,
    ReadyState, SourceIdentity, TrackCodec, TrackKind, VideoElement, VideoTile,
};

pub use tilecast_signaling::{
    BroadcastRegistry, PeerConfig, PeerConnection, PeerConnectionFactory, RegistryConfig,
    RtcPeerFactory, SessionInfo, SessionState, SignalingRelay,
};

// Public API modules
pub mod config;
pub mod coordinator;
pub mod logging;

// Re-export main API types
pub use config::{CaptureConfig, TileCastConfig, DEFAULT_SIGNALING_PORT};
pub use coordinator::CaptureCoordinator;
pub use logging::{init_logging, init_logging_with, DEFAULT_LOG_DIRECTIVE};
