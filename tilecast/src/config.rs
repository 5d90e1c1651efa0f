//! Configuration types and defaults

use serde::{Deserialize, Serialize};
use std::time::Duration;
use tilecast_core::{Result, TileCastError};
use tilecast_media::MIN_SOURCE_DIMENSION;
use tilecast_signaling::{PeerConfig, RegistryConfig};

/// Default port of the companion signaling server
pub const DEFAULT_SIGNALING_PORT: u16 = 4455;

/// Capture coordinator configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    /// Port every broadcast session signals on
    pub signaling_port: u16,
    /// Minimum intrinsic width and height of a live source
    pub min_dimension: u32,
    /// Delay of the one-off validity re-check for elements not yet valid
    #[serde(with = "tilecast_core::serde_millis")]
    pub validity_fallback: Duration,
    /// Delay between a track ending and the rescan of the document
    #[serde(with = "tilecast_core::serde_millis")]
    pub rescan_delay: Duration,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            signaling_port: DEFAULT_SIGNALING_PORT,
            min_dimension: MIN_SOURCE_DIMENSION,
            validity_fallback: Duration::from_millis(500),
            rescan_delay: Duration::from_millis(100),
        }
    }
}

impl CaptureConfig {
    /// Set the signaling port
    pub fn with_signaling_port(mut self, port: u16) -> Self {
        self.signaling_port = port;
        self
    }

    /// Set the minimum source dimension
    pub fn with_min_dimension(mut self, min_dimension: u32) -> Self {
        self.min_dimension = min_dimension;
        self
    }

    /// Set the validity fallback delay
    pub fn with_validity_fallback(mut self, delay: Duration) -> Self {
        self.validity_fallback = delay;
        self
    }

    /// Set the rescan delay
    pub fn with_rescan_delay(mut self, delay: Duration) -> Self {
        self.rescan_delay = delay;
        self
    }

    /// Check the settings
    pub fn validate(&self) -> Result<()> {
        if self.signaling_port == 0 {
            return Err(TileCastError::invalid_configuration(
                "signaling_port",
                "must be non-zero",
            ));
        }
        Ok(())
    }
}

/// Complete configuration, as loaded from a host settings store
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TileCastConfig {
    /// Capture coordinator settings
    pub capture: CaptureConfig,
    /// Session registry settings
    pub registry: RegistryConfig,
    /// Peer connection settings
    pub peer: PeerConfig,
}

impl TileCastConfig {
    /// Parse and validate a JSON document; missing fields take defaults
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)
            .map_err(|e| TileCastError::invalid_configuration("config", e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Check every section
    pub fn validate(&self) -> Result<()> {
        self.capture.validate()?;
        self.registry.validate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capture_defaults() {
        let config = CaptureConfig::default();
        assert_eq!(config.signaling_port, 4455);
        assert_eq!(config.min_dimension, 50);
        assert_eq!(config.validity_fallback, Duration::from_millis(500));
        assert_eq!(config.rescan_delay, Duration::from_millis(100));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_zero_port_rejected() {
        let err = CaptureConfig::default()
            .with_signaling_port(0)
            .validate()
            .unwrap_err();
        assert_eq!(err.error_code(), "INVALID_CONFIGURATION");
    }

    #[test]
    fn test_from_json_fills_defaults() {
        let config = TileCastConfig::from_json(
            r#"{"capture":{"signaling_port":9000,"rescan_delay":250},"peer":{"ice_servers":["stun:stun.example.org"]}}"#,
        )
        .unwrap();
        assert_eq!(config.capture.signaling_port, 9000);
        assert_eq!(config.capture.rescan_delay, Duration::from_millis(250));
        assert_eq!(config.capture.validity_fallback, Duration::from_millis(500));
        assert_eq!(config.registry, RegistryConfig::default());
        assert_eq!(config.peer.ice_servers, vec!["stun:stun.example.org"]);
    }

    #[test]
    fn test_from_json_rejects_bad_input() {
        assert!(TileCastConfig::from_json("{").is_err());
        assert!(TileCastConfig::from_json(r#"{"capture":{"signaling_port":0}}"#).is_err());
    }
}
