//! Capture coordinator
//!
//! Watches video elements handed over by the host, captures the ones that
//! turn out to be genuine live sources and broadcasts each captured track
//! through the [`BroadcastRegistry`]. When a track ends its broadcast is
//! closed and the document is rescanned shortly after, so a source that
//! reappears is picked up again.
//!
//! Timers and track watchers never run capture logic themselves; they post
//! events to one driver task that handles them in order.

use crate::config::CaptureConfig;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tilecast_core::Result;
use tilecast_media::{
    capture_element, derive_identity, is_valid_source, ElementSource, MediaStream, VideoElement,
};
use tilecast_signaling::{BroadcastRegistry, PeerConfig, RegistryConfig, RtcPeerFactory};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

/// Shortest period between liveness checks of a pending element
const MIN_LIVENESS_PERIOD: Duration = Duration::from_millis(10);

/// Work posted to the coordinator's driver task
#[derive(Debug)]
enum CoordinatorEvent {
    /// Re-check a pending element
    Check(Weak<dyn VideoElement>),
    /// A broadcast track ended
    TrackEnded {
        stream_key: String,
        stream_id: String,
        session_key: String,
        track_id: String,
    },
    /// Look for unprocessed elements
    Rescan,
}

/// An element the coordinator has already seen
struct ProcessedElement {
    element: Weak<dyn VideoElement>,
    captured: bool,
}

/// Identity key of an element: the address of its shared allocation. The
/// stored `Weak` keeps the allocation reserved, so a live key is never
/// reused by another element.
fn element_key(element: &Arc<dyn VideoElement>) -> usize {
    Arc::as_ptr(element) as *const () as usize
}

/// Discovers live video elements and broadcasts their tracks
pub struct CaptureCoordinator {
    inner: Arc<CoordinatorInner>,
    driver: Mutex<Option<JoinHandle<()>>>,
}

struct CoordinatorInner {
    config: CaptureConfig,
    registry: Arc<BroadcastRegistry>,
    source: Arc<dyn ElementSource>,
    processed: Mutex<HashMap<usize, ProcessedElement>>,
    streams: DashMap<String, MediaStream>,
    events: mpsc::UnboundedSender<CoordinatorEvent>,
    stop: CancellationToken,
}

impl CaptureCoordinator {
    /// Create a coordinator and start its driver task
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(
        config: CaptureConfig,
        registry: Arc<BroadcastRegistry>,
        source: Arc<dyn ElementSource>,
    ) -> Result<Self> {
        config.validate()?;

        let (events, receiver) = mpsc::unbounded_channel();
        let inner = Arc::new(CoordinatorInner {
            config,
            registry,
            source,
            processed: Mutex::new(HashMap::new()),
            streams: DashMap::new(),
            events,
            stop: CancellationToken::new(),
        });
        let driver = tokio::spawn(CoordinatorInner::drive(Arc::clone(&inner), receiver));

        Ok(Self {
            inner,
            driver: Mutex::new(Some(driver)),
        })
    }

    /// Create a coordinator broadcasting over WebSocket signaling and
    /// `webrtc` peer connections
    pub fn webrtc(
        config: CaptureConfig,
        registry_config: RegistryConfig,
        peer_config: PeerConfig,
        source: Arc<dyn ElementSource>,
    ) -> Result<Self> {
        let peers = Arc::new(RtcPeerFactory::new(peer_config)?);
        let registry = Arc::new(BroadcastRegistry::websocket(peers, registry_config)?);
        Self::new(config, registry, source)
    }

    /// Handle an element added to the document
    ///
    /// Elements are handled once; repeated calls for the same element are
    /// ignored. A valid element is captured right away, anything else is
    /// re-checked when it starts playing and once after the validity
    /// fallback delay.
    pub async fn handle_new_element(&self, element: Arc<dyn VideoElement>) {
        self.inner.handle_new_element(element).await;
    }

    /// Handle an element removed from the document
    ///
    /// Broadcasts end through their tracks, not through element removal.
    pub fn handle_removed_element(&self, element: &Arc<dyn VideoElement>) {
        trace!("Element {:#x} removed", element_key(element));
    }

    /// Handle every element in the document not processed yet
    pub async fn rescan(&self) {
        self.inner.rescan().await;
    }

    /// Whether `element` has been handled
    pub fn is_processed(&self, element: &Arc<dyn VideoElement>) -> bool {
        self.inner.processed.lock().contains_key(&element_key(element))
    }

    /// Stream keys of the captured sources, sorted
    pub fn active_streams(&self) -> Vec<String> {
        let mut keys: Vec<String> = self
            .inner
            .streams
            .iter()
            .map(|entry| entry.key().clone())
            .collect();
        keys.sort();
        keys
    }

    /// Session registry the coordinator broadcasts through
    pub fn registry(&self) -> &Arc<BroadcastRegistry> {
        &self.inner.registry
    }

    /// Configuration in use
    pub fn config(&self) -> &CaptureConfig {
        &self.inner.config
    }

    /// Stop the driver and every watcher, then close all broadcasts
    pub async fn shutdown(&self) {
        self.inner.stop.cancel();
        let driver = self.driver.lock().take();
        if let Some(driver) = driver {
            let _ = driver.await;
        }
        self.inner.streams.clear();
        self.inner.registry.close_all().await;
        info!("Capture coordinator stopped");
    }
}

impl fmt::Debug for CaptureCoordinator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CaptureCoordinator")
            .field("config", &self.inner.config)
            .field("streams", &self.active_streams())
            .finish()
    }
}

impl Drop for CaptureCoordinator {
    fn drop(&mut self) {
        self.inner.stop.cancel();
    }
}

impl CoordinatorInner {
    async fn drive(self: Arc<Self>, mut events: mpsc::UnboundedReceiver<CoordinatorEvent>) {
        loop {
            let event = tokio::select! {
                biased;
                _ = self.stop.cancelled() => break,
                event = events.recv() => match event {
                    Some(event) => event,
                    None => break,
                },
            };
            self.handle_event(event).await;
        }
        debug!("Coordinator driver stopped");
    }

    async fn handle_event(&self, event: CoordinatorEvent) {
        match event {
            CoordinatorEvent::Check(element) => {
                if let Some(element) = element.upgrade() {
                    if is_valid_source(element.as_ref(), self.config.min_dimension) {
                        self.capture(&element).await;
                    } else {
                        trace!("Element {:#x} not valid yet", element_key(&element));
                    }
                }
            }
            CoordinatorEvent::TrackEnded {
                stream_key,
                stream_id,
                session_key,
                track_id,
            } => {
                self.track_ended(&stream_key, &stream_id, &session_key, &track_id)
                    .await;
            }
            CoordinatorEvent::Rescan => self.rescan().await,
        }
    }

    async fn handle_new_element(&self, element: Arc<dyn VideoElement>) {
        if !self.mark_processed(&element) {
            trace!("Element {:#x} already processed", element_key(&element));
            return;
        }

        if is_valid_source(element.as_ref(), self.config.min_dimension) {
            self.capture(&element).await;
        } else {
            self.watch_readiness(&element);
        }
    }

    async fn rescan(&self) {
        let elements = self.source.video_elements();
        trace!("Rescanning {} elements", elements.len());
        for element in elements {
            self.handle_new_element(element).await;
        }
    }

    /// Record `element` as processed; `false` if it already was
    fn mark_processed(&self, element: &Arc<dyn VideoElement>) -> bool {
        let mut processed = self.processed.lock();
        processed.retain(|_, entry| entry.element.strong_count() > 0);
        match processed.entry(element_key(element)) {
            Entry::Occupied(_) => false,
            Entry::Vacant(slot) => {
                slot.insert(ProcessedElement {
                    element: Arc::downgrade(element),
                    captured: false,
                });
                true
            }
        }
    }

    /// Claim the single capture of `element`; `false` if already claimed
    fn claim_capture(&self, element: &Arc<dyn VideoElement>) -> bool {
        let mut processed = self.processed.lock();
        let entry = processed
            .entry(element_key(element))
            .or_insert_with(|| ProcessedElement {
                element: Arc::downgrade(element),
                captured: false,
            });
        !std::mem::replace(&mut entry.captured, true)
    }

    /// Re-check `element` once it plays and once after the fallback delay
    ///
    /// Once the fallback has fired the watcher also ends when the element
    /// is dropped, since its playing signal may never resolve.
    fn watch_readiness(&self, element: &Arc<dyn VideoElement>) {
        let weak = Arc::downgrade(element);
        let playing = element.playing();
        let fallback = tokio::time::sleep(self.config.validity_fallback);
        let mut liveness = tokio::time::interval(
            self.config.validity_fallback.max(MIN_LIVENESS_PERIOD),
        );
        let events = self.events.clone();
        let stop = self.stop.clone();

        tokio::spawn(async move {
            tokio::pin!(playing);
            tokio::pin!(fallback);
            let mut played = false;
            let mut fell_back = false;

            while !(played && fell_back) {
                tokio::select! {
                    _ = stop.cancelled() => return,
                    _ = &mut playing, if !played => played = true,
                    _ = &mut fallback, if !fell_back => fell_back = true,
                    _ = liveness.tick(), if fell_back => {
                        if weak.strong_count() == 0 {
                            trace!("Element dropped before playing, watcher done");
                            return;
                        }
                        continue;
                    }
                }
                if weak.strong_count() == 0 {
                    return;
                }
                if events.send(CoordinatorEvent::Check(weak.clone())).is_err() {
                    return;
                }
            }
        });
    }

    async fn capture(&self, element: &Arc<dyn VideoElement>) {
        if !self.claim_capture(element) {
            trace!("Element {:#x} already captured", element_key(element));
            return;
        }

        let Some(stream) = capture_element(element.as_ref()) else {
            debug!("Element {:#x} yielded no stream", element_key(element));
            return;
        };

        let identity = derive_identity(element.tile().as_ref());
        info!(
            "Capturing {} ({} tracks, participant {})",
            identity.stream_key,
            stream.tracks().len(),
            identity.participant_id
        );
        self.streams.insert(identity.stream_key.clone(), stream.clone());

        for track in stream.tracks() {
            let session_key = identity.session_key(track.kind());
            if let Err(e) = self
                .registry
                .open(track.clone(), &session_key, self.config.signaling_port)
                .await
            {
                warn!("Failed to start stream {}: {}", session_key, e);
            }

            let event = CoordinatorEvent::TrackEnded {
                stream_key: identity.stream_key.clone(),
                stream_id: stream.id().to_string(),
                session_key,
                track_id: track.id().to_string(),
            };
            let ended = track.ended();
            let events = self.events.clone();
            let stop = self.stop.clone();
            tokio::spawn(async move {
                tokio::select! {
                    _ = stop.cancelled() => {}
                    _ = ended => {
                        let _ = events.send(event);
                    }
                }
            });
        }
    }

    async fn track_ended(&self, stream_key: &str, stream_id: &str, session_key: &str, track_id: &str) {
        debug!("Track {} of {} ended", track_id, stream_key);
        self.streams
            .remove_if(stream_key, |_, stream| stream.id() == stream_id);

        // A replacement broadcast under the same key carries another track
        let current = self
            .registry
            .session_info(session_key)
            .map(|info| info.track_id == track_id)
            .unwrap_or(false);
        if current {
            self.registry.close(session_key).await;
        }

        let delay = self.config.rescan_delay;
        let events = self.events.clone();
        let stop = self.stop.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = stop.cancelled() => {}
                _ = tokio::time::sleep(delay) => {
                    let _ = events.send(CoordinatorEvent::Rescan);
                }
            }
        });
    }
}
