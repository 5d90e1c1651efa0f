//! Broadcast session registry
//!
//! Maps stream IDs to running broadcast sessions. At most one session is
//! registered per stream ID; opening a stream ID that is already live tears
//! the existing session down completely before the new one starts.

use crate::peer::PeerConnectionFactory;
use crate::session::{Session, SessionHandle, SessionMap, SessionState};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tilecast_core::{
    signaling_url, Result, StreamRole, TileCastError, TransportConnector, WebSocketConnector,
    DEFAULT_CONNECT_TIMEOUT,
};
use tilecast_media::{CapturedTrack, MediaStream, TrackKind};
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Registry settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    /// Host of the companion signaling server
    pub host: String,
    /// Timeout for establishing a signaling connection
    #[serde(with = "tilecast_core::serde_millis")]
    pub connect_timeout: Duration,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }
}

impl RegistryConfig {
    /// Set the signaling host
    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }

    /// Set the connect timeout
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Check the settings
    pub fn validate(&self) -> Result<()> {
        if self.host.trim().is_empty() {
            return Err(TileCastError::invalid_configuration(
                "host",
                "must not be empty",
            ));
        }
        if self.connect_timeout.is_zero() {
            return Err(TileCastError::invalid_configuration(
                "connect_timeout",
                "must be greater than zero",
            ));
        }
        Ok(())
    }
}

/// Snapshot of a registered session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionInfo {
    /// Stream ID the session is registered under
    pub stream_id: String,
    /// ID of the broadcast track
    pub track_id: String,
    /// Kind of the broadcast track
    pub kind: TrackKind,
    /// Current lifecycle state
    pub state: SessionState,
    /// When the session was opened
    pub started_at: DateTime<Utc>,
}

/// Registry of live broadcast sessions
pub struct BroadcastRegistry {
    sessions: Arc<SessionMap>,
    peers: Arc<dyn PeerConnectionFactory>,
    connector: Arc<dyn TransportConnector>,
    config: RegistryConfig,
    next_generation: AtomicU64,
}

impl BroadcastRegistry {
    /// Create a registry
    pub fn new(
        peers: Arc<dyn PeerConnectionFactory>,
        connector: Arc<dyn TransportConnector>,
        config: RegistryConfig,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            sessions: Arc::new(Mutex::new(HashMap::new())),
            peers,
            connector,
            config,
            next_generation: AtomicU64::new(1),
        })
    }

    /// Create a registry signaling over WebSocket
    pub fn websocket(peers: Arc<dyn PeerConnectionFactory>, config: RegistryConfig) -> Result<Self> {
        let connector = Arc::new(WebSocketConnector::new(config.connect_timeout));
        Self::new(peers, connector, config)
    }

    /// Registry settings
    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    /// Start broadcasting `track` under `stream_id` to the signaling server
    /// on `port`
    ///
    /// Any session already registered under `stream_id` is closed first and
    /// its teardown awaited. Returns once the new session is registered; the
    /// transport is dialed in the background and dial failures surface only
    /// as the session removing itself.
    pub async fn open(&self, track: CapturedTrack, stream_id: &str, port: u16) -> Result<()> {
        if stream_id.is_empty() {
            return Err(TileCastError::invalid_configuration(
                "stream_id",
                "must not be empty",
            ));
        }
        if port == 0 {
            return Err(TileCastError::invalid_configuration(
                "port",
                "must be non-zero",
            ));
        }

        let previous = self.sessions.lock().remove(stream_id);
        if let Some(previous) = previous {
            info!("Restarting stream: {}", stream_id);
            previous.shutdown().await;
        }

        info!("Starting stream: {}", stream_id);
        let peer = self.peers.create().await?;
        let stream = MediaStream::single(track.clone());
        if let Err(e) = peer.add_track(&track, &stream).await {
            let _ = peer.close().await;
            return Err(e);
        }

        let (candidate_tx, candidate_rx) = mpsc::unbounded_channel();
        peer.on_ice_candidate(Box::new(move |candidate| {
            let _ = candidate_tx.send(candidate);
        }));

        let generation = self.next_generation.fetch_add(1, Ordering::SeqCst);
        let (state_tx, state_rx) = watch::channel(SessionState::Connecting);
        let stop = CancellationToken::new();
        let session = Session {
            stream_id: stream_id.to_string(),
            generation,
            url: signaling_url(&self.config.host, port, stream_id, StreamRole::Sender),
            peer,
            track: track.clone(),
            connector: Arc::clone(&self.connector),
            sessions: Arc::downgrade(&self.sessions),
            stop: stop.clone(),
            state: state_tx,
        };

        // Registered before the task can run, so a session that ends at once
        // still finds its own entry to remove
        let displaced = {
            let mut sessions = self.sessions.lock();
            let task = tokio::spawn(session.run(candidate_rx));
            sessions.insert(
                stream_id.to_string(),
                SessionHandle::new(generation, track, state_rx, stop, task),
            )
        };
        if let Some(displaced) = displaced {
            warn!("Concurrent open replaced session for {}", stream_id);
            displaced.shutdown().await;
        }
        Ok(())
    }

    /// Close the session registered under `stream_id`, if any, and wait for
    /// its teardown. Closing an unknown stream ID is a no-op.
    pub async fn close(&self, stream_id: &str) {
        let session = self.sessions.lock().remove(stream_id);
        if let Some(session) = session {
            session.shutdown().await;
        }
    }

    /// Close every session
    pub async fn close_all(&self) {
        let sessions: Vec<SessionHandle> = self
            .sessions
            .lock()
            .drain()
            .map(|(_, session)| session)
            .collect();
        futures::future::join_all(sessions.into_iter().map(SessionHandle::shutdown)).await;
    }

    /// Whether a session is registered under `stream_id`
    pub fn is_active(&self, stream_id: &str) -> bool {
        self.sessions.lock().contains_key(stream_id)
    }

    /// Registered stream IDs, sorted
    pub fn active_streams(&self) -> Vec<String> {
        let mut streams: Vec<String> = self.sessions.lock().keys().cloned().collect();
        streams.sort();
        streams
    }

    /// Number of registered sessions
    pub fn len(&self) -> usize {
        self.sessions.lock().len()
    }

    /// Whether no session is registered
    pub fn is_empty(&self) -> bool {
        self.sessions.lock().is_empty()
    }

    /// State of the session registered under `stream_id`
    pub fn state(&self, stream_id: &str) -> Option<SessionState> {
        self.sessions
            .lock()
            .get(stream_id)
            .map(|session| *session.state.borrow())
    }

    /// Watch the state of the session registered under `stream_id`
    pub fn subscribe_state(&self, stream_id: &str) -> Option<watch::Receiver<SessionState>> {
        self.sessions
            .lock()
            .get(stream_id)
            .map(|session| session.state.clone())
    }

    /// Snapshot of the session registered under `stream_id`
    pub fn session_info(&self, stream_id: &str) -> Option<SessionInfo> {
        self.sessions.lock().get(stream_id).map(|session| SessionInfo {
            stream_id: stream_id.to_string(),
            track_id: session.track.id().to_string(),
            kind: session.track.kind(),
            state: *session.state.borrow(),
            started_at: session.started_at,
        })
    }
}

impl fmt::Debug for BroadcastRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BroadcastRegistry")
            .field("config", &self.config)
            .field("streams", &self.active_streams())
            .finish()
    }
}

impl Drop for BroadcastRegistry {
    fn drop(&mut self) {
        for session in self.sessions.lock().values() {
            session.cancel();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockPeerFactory;
    use tilecast_core::MemoryConnector;

    fn registry() -> BroadcastRegistry {
        let (connector, _listener) = MemoryConnector::new();
        BroadcastRegistry::new(
            Arc::new(MockPeerFactory::new()),
            Arc::new(connector),
            RegistryConfig::default(),
        )
        .unwrap()
    }

    #[test]
    fn test_config_defaults() {
        let config = RegistryConfig::default();
        assert_eq!(config.host, "127.0.0.1");
        assert_eq!(config.connect_timeout, Duration::from_secs(10));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_rejects_empty_host() {
        let config = RegistryConfig::default().with_host(" ");
        assert_eq!(
            config.validate().unwrap_err().error_code(),
            "INVALID_CONFIGURATION"
        );
        let config = RegistryConfig::default().with_connect_timeout(Duration::ZERO);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_from_json() {
        let config: RegistryConfig =
            serde_json::from_str(r#"{"host":"10.0.0.5","connect_timeout":2500}"#).unwrap();
        assert_eq!(config.host, "10.0.0.5");
        assert_eq!(config.connect_timeout, Duration::from_millis(2500));

        let partial: RegistryConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(partial, RegistryConfig::default());
    }

    #[tokio::test]
    async fn test_open_rejects_invalid_arguments() {
        let registry = registry();
        let track = CapturedTrack::new(TrackKind::Video);

        let err = registry.open(track.clone(), "", 4455).await.unwrap_err();
        assert_eq!(err.error_code(), "INVALID_CONFIGURATION");
        let err = registry.open(track, "alice_video", 0).await.unwrap_err();
        assert_eq!(err.error_code(), "INVALID_CONFIGURATION");
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_empty_registry_queries() {
        let registry = registry();
        assert_eq!(registry.len(), 0);
        assert!(registry.active_streams().is_empty());
        assert!(registry.state("missing").is_none());
        assert!(registry.session_info("missing").is_none());
        registry.close("missing").await;
        registry.close_all().await;
    }
}
