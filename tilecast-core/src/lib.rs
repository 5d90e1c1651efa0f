//! # tilecast core
//!
//! Error types and the signaling transport shared by the tilecast crates.
//! Broadcast sessions exchange JSON signaling frames with a companion
//! WebSocket server through the [`TransportConnector`] abstraction defined
//! here.

#![deny(missing_docs)]
#![warn(clippy::all)]

pub mod error;
pub mod serde_millis;
pub mod transport;

// Re-export main types
pub use error::{Result, TileCastError};
pub use transport::{
    parse_signaling_target, signaling_url, Frame, FrameSink, FrameStream, MemoryConnector,
    MemoryEndpoint, MemoryListener, SignalingChannel, StreamRole, TransportConnector,
    WebSocketConnector, DEFAULT_CONNECT_TIMEOUT, NORMAL_CLOSURE,
};
