//! Synthetic host elements
//!
//! In-memory [`VideoElement`] and [`ElementSource`] implementations whose
//! geometry, readiness and capture results are set directly. Used by the
//! tilecast test suites in place of a real host document.

use crate::element::{ElementSource, ReadyState, VideoElement, VideoTile};
use crate::tracks::MediaStream;
use futures::future::BoxFuture;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::watch;

#[derive(Debug)]
struct ElementState {
    connected: bool,
    width: u32,
    height: u32,
    ready_state: ReadyState,
    tile: Option<VideoTile>,
    capture: Option<MediaStream>,
    vendor_capture: Option<MediaStream>,
}

/// A video element whose observable state is set by the test
#[derive(Debug)]
pub struct SyntheticElement {
    state: Mutex<ElementState>,
    playing: watch::Sender<bool>,
    listeners: Arc<()>,
    capture_calls: AtomicUsize,
}

impl SyntheticElement {
    /// Attached, 0x0, no data, no tile, nothing to capture
    pub fn new() -> Self {
        let (playing, _) = watch::channel(false);
        Self {
            state: Mutex::new(ElementState {
                connected: true,
                width: 0,
                height: 0,
                ready_state: ReadyState::HaveNothing,
                tile: None,
                capture: None,
                vendor_capture: None,
            }),
            playing,
            listeners: Arc::new(()),
            capture_calls: AtomicUsize::new(0),
        }
    }

    /// A playing element of the given size inside a tile, capturing `stream`
    pub fn live(width: u32, height: u32, tile: Option<VideoTile>, stream: MediaStream) -> Self {
        let element = Self::new();
        element.set_size(width, height);
        element.set_ready_state(ReadyState::HaveEnoughData);
        element.set_tile(tile);
        element.set_capture(Some(stream));
        element
    }

    /// Attach or detach the element
    pub fn set_connected(&self, connected: bool) {
        self.state.lock().connected = connected;
    }

    /// Set the intrinsic video size
    pub fn set_size(&self, width: u32, height: u32) {
        let mut state = self.state.lock();
        state.width = width;
        state.height = height;
    }

    /// Set the ready state
    pub fn set_ready_state(&self, ready_state: ReadyState) {
        self.state.lock().ready_state = ready_state;
    }

    /// Set the enclosing tile
    pub fn set_tile(&self, tile: Option<VideoTile>) {
        self.state.lock().tile = tile;
    }

    /// Set the result of the primary capture method
    pub fn set_capture(&self, stream: Option<MediaStream>) {
        self.state.lock().capture = stream;
    }

    /// Set the result of the vendor capture method
    pub fn set_vendor_capture(&self, stream: Option<MediaStream>) {
        self.state.lock().vendor_capture = stream;
    }

    /// Fire the "playing" signal
    pub fn fire_playing(&self) {
        self.playing.send_replace(true);
    }

    /// Tracks outstanding `playing` futures; each holds a strong reference
    /// until it completes or is dropped
    pub fn playing_listeners(&self) -> Weak<()> {
        Arc::downgrade(&self.listeners)
    }

    /// How many times a capture method was invoked
    pub fn capture_calls(&self) -> usize {
        self.capture_calls.load(Ordering::SeqCst)
    }
}

impl Default for SyntheticElement {
    fn default() -> Self {
        Self::new()
    }
}

impl VideoElement for SyntheticElement {
    fn is_connected(&self) -> bool {
        self.state.lock().connected
    }

    fn video_width(&self) -> u32 {
        self.state.lock().width
    }

    fn video_height(&self) -> u32 {
        self.state.lock().height
    }

    fn ready_state(&self) -> ReadyState {
        self.state.lock().ready_state
    }

    fn tile(&self) -> Option<VideoTile> {
        self.state.lock().tile.clone()
    }

    fn capture_stream(&self) -> Option<MediaStream> {
        self.capture_calls.fetch_add(1, Ordering::SeqCst);
        self.state.lock().capture.clone()
    }

    fn vendor_capture_stream(&self) -> Option<MediaStream> {
        self.state.lock().vendor_capture.clone()
    }

    fn playing(&self) -> BoxFuture<'static, ()> {
        let mut playing = self.playing.subscribe();
        let listener = Arc::clone(&self.listeners);
        Box::pin(async move {
            let _listener = listener;
            // A dropped element never starts playing
            if playing.wait_for(|playing| *playing).await.is_err() {
                futures::future::pending::<()>().await;
            }
        })
    }
}

/// An element source backed by a plain list
#[derive(Debug, Default)]
pub struct SyntheticDocument {
    elements: Mutex<Vec<Arc<dyn VideoElement>>>,
}

impl SyntheticDocument {
    /// Empty document
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an element
    pub fn insert(&self, element: Arc<dyn VideoElement>) {
        self.elements.lock().push(element);
    }

    /// Remove an element by identity
    pub fn remove(&self, element: &Arc<dyn VideoElement>) {
        self.elements
            .lock()
            .retain(|candidate| !Arc::ptr_eq(candidate, element));
    }
}

impl ElementSource for SyntheticDocument {
    fn video_elements(&self) -> Vec<Arc<dyn VideoElement>> {
        self.elements.lock().clone()
    }
}
