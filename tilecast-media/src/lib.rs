//! # tilecast media
//!
//! Media tracks captured from host video elements, the element
//! collaborator traits, the live-source predicate and stream identity
//! derivation.

#![warn(clippy::all)]

pub mod element;
pub mod identity;
#[cfg(any(test, feature = "testing"))]
pub mod testing;
pub mod tracks;

// Re-export main types
pub use element::{
    capture_element, is_valid_source, ElementSource, ReadyState, VideoElement, VideoTile,
    MIN_SOURCE_DIMENSION,
};
pub use identity::{derive_identity, session_key, SourceIdentity};
pub use tracks::{CapturedTrack, MediaSample, MediaStream, TrackCodec, TrackKind};
