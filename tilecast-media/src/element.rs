//! Video elements exposed by the host document
//!
//! The host UI owns element enumeration and geometry; tilecast only sees the
//! [`VideoElement`] and [`ElementSource`] traits. This module also holds the
//! predicate deciding whether an element is a genuine live source.

use crate::tracks::MediaStream;
use futures::future::BoxFuture;
use std::fmt;
use std::sync::Arc;

/// Minimum intrinsic width and height of a live source; anything smaller is
/// an icon or a loading spinner
pub const MIN_SOURCE_DIMENSION: u32 = 50;

/// Media element ready state, ordered as in HTML media elements
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ReadyState {
    /// No information about the media
    HaveNothing = 0,
    /// Duration and dimensions known
    HaveMetadata = 1,
    /// Data for the current playback position available
    HaveCurrentData = 2,
    /// Data for at least the next frame available
    HaveFutureData = 3,
    /// Enough data to play through
    HaveEnoughData = 4,
}

impl ReadyState {
    /// Map the numeric HTML ready state; values above 4 saturate
    pub fn from_level(level: u8) -> Self {
        match level {
            0 => ReadyState::HaveNothing,
            1 => ReadyState::HaveMetadata,
            2 => ReadyState::HaveCurrentData,
            3 => ReadyState::HaveFutureData,
            _ => ReadyState::HaveEnoughData,
        }
    }
}

/// Participant tile enclosing a video element
///
/// Resolved by the host from the nearest ancestor carrying a per-tile
/// participant attribute and the tile's accessibility focus target.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VideoTile {
    /// Participant identifier from the tile attribute
    pub participant_id: Option<String>,
    /// Accessibility label, e.g. `"Call tile, muted, Jane Doe."`
    pub accessibility_label: Option<String>,
}

/// A media-bearing element in the host document
pub trait VideoElement: Send + Sync + fmt::Debug {
    /// Whether the element is attached to the active document
    fn is_connected(&self) -> bool;

    /// Intrinsic video width
    fn video_width(&self) -> u32;

    /// Intrinsic video height
    fn video_height(&self) -> u32;

    /// Current ready state
    fn ready_state(&self) -> ReadyState;

    /// Enclosing participant tile, if any
    fn tile(&self) -> Option<VideoTile>;

    /// Capture the element's live output
    fn capture_stream(&self) -> Option<MediaStream>;

    /// Vendor-prefixed capture, tried when [`VideoElement::capture_stream`] yields nothing
    fn vendor_capture_stream(&self) -> Option<MediaStream> {
        None
    }

    /// Resolves when the element starts playing. The future must not borrow
    /// the element; it may never resolve.
    fn playing(&self) -> BoxFuture<'static, ()>;
}

/// Enumerates the candidate elements currently in the document
pub trait ElementSource: Send + Sync + fmt::Debug {
    /// All video elements currently present
    fn video_elements(&self) -> Vec<Arc<dyn VideoElement>>;
}

/// Whether `element` is a genuine live source: attached, at least
/// `min_dimension` in both directions, and holding current frame data
pub fn is_valid_source(element: &dyn VideoElement, min_dimension: u32) -> bool {
    if !element.is_connected() {
        return false;
    }
    if element.video_width() < min_dimension || element.video_height() < min_dimension {
        return false;
    }
    element.ready_state() >= ReadyState::HaveCurrentData
}

/// Capture `element`, falling back to the vendor method
pub fn capture_element(element: &dyn VideoElement) -> Option<MediaStream> {
    element
        .capture_stream()
        .or_else(|| element.vendor_capture_stream())
}
