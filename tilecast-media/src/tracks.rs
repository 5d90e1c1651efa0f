//! Track abstractions and captured media streams

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tracing::debug;
use uuid::Uuid;

/// Capacity of the per-track sample fan-out channel
const SAMPLE_CHANNEL_CAPACITY: usize = 64;

/// Media kind of a track
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackKind {
    /// Audio track
    Audio,
    /// Video track
    Video,
}

impl TrackKind {
    /// Lowercase kind name, as used in session keys
    pub fn as_str(&self) -> &'static str {
        match self {
            TrackKind::Audio => "audio",
            TrackKind::Video => "video",
        }
    }

    /// Codec used when a capture source does not specify one
    pub fn default_codec(&self) -> TrackCodec {
        match self {
            TrackKind::Audio => TrackCodec::opus(),
            TrackKind::Video => TrackCodec::vp8(),
        }
    }
}

impl fmt::Display for TrackKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Codec parameters a track's samples are encoded with
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackCodec {
    /// MIME type, e.g. `video/VP8`
    pub mime_type: String,
    /// RTP clock rate in Hz
    pub clock_rate: u32,
    /// Channel count (0 for video)
    pub channels: u16,
}

impl TrackCodec {
    /// Opus, 48 kHz stereo
    pub fn opus() -> Self {
        Self {
            mime_type: "audio/opus".to_string(),
            clock_rate: 48_000,
            channels: 2,
        }
    }

    /// VP8, 90 kHz clock
    pub fn vp8() -> Self {
        Self {
            mime_type: "video/VP8".to_string(),
            clock_rate: 90_000,
            channels: 0,
        }
    }
}

/// One encoded media sample
#[derive(Debug, Clone)]
pub struct MediaSample {
    /// Encoded payload
    pub data: Bytes,
    /// Playout duration of the sample
    pub duration: Duration,
}

/// A live media track captured from a source element
///
/// Clones share the same underlying track. Samples pushed into the track fan
/// out to every subscriber; [`CapturedTrack::stop`] ends the track for all
/// clones and wakes every [`CapturedTrack::ended`] waiter.
#[derive(Clone)]
pub struct CapturedTrack {
    inner: Arc<TrackInner>,
}

struct TrackInner {
    id: String,
    kind: TrackKind,
    codec: TrackCodec,
    samples: broadcast::Sender<MediaSample>,
    ended: watch::Sender<bool>,
}

impl CapturedTrack {
    /// Create a live track with the kind's default codec
    pub fn new(kind: TrackKind) -> Self {
        Self::with_codec(kind, kind.default_codec())
    }

    /// Create a live track with an explicit codec
    pub fn with_codec(kind: TrackKind, codec: TrackCodec) -> Self {
        let (samples, _) = broadcast::channel(SAMPLE_CHANNEL_CAPACITY);
        let (ended, _) = watch::channel(false);
        Self {
            inner: Arc::new(TrackInner {
                id: Uuid::new_v4().to_string(),
                kind,
                codec,
                samples,
                ended,
            }),
        }
    }

    /// Track ID
    pub fn id(&self) -> &str {
        &self.inner.id
    }

    /// Track kind
    pub fn kind(&self) -> TrackKind {
        self.inner.kind
    }

    /// Codec of the track's samples
    pub fn codec(&self) -> &TrackCodec {
        &self.inner.codec
    }

    /// Push a sample to all subscribers; returns how many received it
    pub fn push_sample(&self, sample: MediaSample) -> usize {
        if self.is_ended() {
            return 0;
        }
        self.inner.samples.send(sample).unwrap_or(0)
    }

    /// Subscribe to the track's samples
    pub fn subscribe_samples(&self) -> broadcast::Receiver<MediaSample> {
        self.inner.samples.subscribe()
    }

    /// End the track. Returns `true` if this call ended it.
    pub fn stop(&self) -> bool {
        let stopped = self.inner.ended.send_if_modified(|ended| {
            if *ended {
                false
            } else {
                *ended = true;
                true
            }
        });
        if stopped {
            debug!("Track {} ({}) ended", self.inner.id, self.inner.kind);
        }
        stopped
    }

    /// Whether the track has ended
    pub fn is_ended(&self) -> bool {
        *self.inner.ended.borrow()
    }

    /// Resolves once the track has ended (immediately if it already has)
    pub fn ended(&self) -> impl Future<Output = ()> + Send + 'static {
        let mut ended = self.inner.ended.subscribe();
        async move {
            // A dropped sender means every handle to the track is gone
            let _ = ended.wait_for(|ended| *ended).await;
        }
    }

    /// Whether both handles refer to the same track
    pub fn same_track(&self, other: &CapturedTrack) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl fmt::Debug for CapturedTrack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CapturedTrack")
            .field("id", &self.inner.id)
            .field("kind", &self.inner.kind)
            .field("ended", &self.is_ended())
            .finish()
    }
}

/// A set of tracks captured together from one source
#[derive(Debug, Clone)]
pub struct MediaStream {
    id: String,
    tracks: Vec<CapturedTrack>,
}

impl MediaStream {
    /// Create a stream with a fresh ID
    pub fn new(tracks: Vec<CapturedTrack>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            tracks,
        }
    }

    /// Fresh stream carrying only `track`
    pub fn single(track: CapturedTrack) -> Self {
        Self::new(vec![track])
    }

    /// Stream ID
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Tracks in the stream
    pub fn tracks(&self) -> &[CapturedTrack] {
        &self.tracks
    }

    /// Whether any track is still live
    pub fn is_active(&self) -> bool {
        self.tracks.iter().any(|track| !track.is_ended())
    }

    /// End every track in the stream
    pub fn stop(&self) {
        for track in &self.tracks {
            track.stop();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::{timeout, Duration};

    #[test]
    fn test_track_kind_names() {
        assert_eq!(TrackKind::Audio.as_str(), "audio");
        assert_eq!(TrackKind::Video.to_string(), "video");
        assert_eq!(serde_json::to_string(&TrackKind::Video).unwrap(), "\"video\"");
    }

    #[test]
    fn test_default_codecs() {
        assert_eq!(TrackKind::Audio.default_codec().mime_type, "audio/opus");
        assert_eq!(TrackKind::Video.default_codec().clock_rate, 90_000);
    }

    #[test]
    fn test_stop_is_idempotent() {
        let track = CapturedTrack::new(TrackKind::Video);
        let clone = track.clone();
        assert!(!track.is_ended());
        assert!(clone.stop());
        assert!(!track.stop());
        assert!(track.is_ended());
    }

    #[tokio::test]
    async fn test_ended_resolves_for_late_subscriber() {
        let track = CapturedTrack::new(TrackKind::Audio);
        let early = track.ended();
        track.stop();
        timeout(Duration::from_secs(1), early).await.unwrap();
        timeout(Duration::from_secs(1), track.ended()).await.unwrap();
    }

    #[tokio::test]
    async fn test_samples_fan_out_until_ended() {
        let track = CapturedTrack::new(TrackKind::Video);
        let mut first = track.subscribe_samples();
        let mut second = track.subscribe_samples();

        let sample = MediaSample {
            data: Bytes::from_static(b"frame"),
            duration: Duration::from_millis(33),
        };
        assert_eq!(track.push_sample(sample), 2);
        assert_eq!(first.recv().await.unwrap().data, Bytes::from_static(b"frame"));
        assert_eq!(second.recv().await.unwrap().duration, Duration::from_millis(33));

        track.stop();
        let late = MediaSample {
            data: Bytes::new(),
            duration: Duration::ZERO,
        };
        assert_eq!(track.push_sample(late), 0);
    }

    #[test]
    fn test_single_stream_gets_fresh_id() {
        let track = CapturedTrack::new(TrackKind::Video);
        let a = MediaStream::single(track.clone());
        let b = MediaStream::single(track.clone());
        assert_ne!(a.id(), b.id());
        assert!(a.tracks()[0].same_track(&b.tracks()[0]));
        assert!(a.is_active());
        a.stop();
        assert!(!b.is_active());
    }
}
