//! Error types for tilecast

use std::time::Duration;
use thiserror::Error;

/// Result alias used across the tilecast crates
pub type Result<T> = std::result::Result<T, TileCastError>;

/// Main error type for tilecast operations
#[derive(Error, Debug)]
pub enum TileCastError {
    /// Invalid configuration or argument
    #[error("Invalid configuration for {field}: {reason}")]
    InvalidConfiguration {
        /// Offending field or argument
        field: String,
        /// Why it was rejected
        reason: String,
    },

    /// Transport error
    #[error("Transport error: {reason}")]
    Transport {
        /// Reason for transport error
        reason: String,
    },

    /// Transport connection timed out
    #[error("Connecting to {url} timed out after {timeout:?}")]
    ConnectionTimeout {
        /// Signaling URL being dialed
        url: String,
        /// Timeout that elapsed
        timeout: Duration,
    },

    /// Operation attempted on a transport that is no longer open
    #[error("Transport closed")]
    TransportClosed,

    /// Peer connection operation failed
    #[error("Peer connection error: {reason}")]
    PeerConnection {
        /// Reason for failure
        reason: String,
    },

    /// Invalid message format
    #[error("Invalid message format: {message}, error: {source}")]
    InvalidMessage {
        /// Invalid message content
        message: String,
        /// Parsing error
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// Message could not be encoded
    #[error("Failed to encode message: {reason}")]
    Encoding {
        /// Reason for failure
        reason: String,
    },

    /// Server start failed
    #[error("Failed to start server on {address}: {source}")]
    ServerStartFailed {
        /// Address that failed to bind
        address: std::net::SocketAddr,
        /// Underlying error
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// Logging could not be initialized
    #[error("Logging initialization failed: {reason}")]
    Logging {
        /// Reason for failure
        reason: String,
    },
}

impl TileCastError {
    /// Get error code for programmatic handling
    pub fn error_code(&self) -> String {
        match self {
            TileCastError::InvalidConfiguration { .. } => "INVALID_CONFIGURATION".to_string(),
            TileCastError::Transport { .. } => "TRANSPORT_ERROR".to_string(),
            TileCastError::ConnectionTimeout { .. } => "CONNECTION_TIMEOUT".to_string(),
            TileCastError::TransportClosed => "TRANSPORT_CLOSED".to_string(),
            TileCastError::PeerConnection { .. } => "PEER_CONNECTION_ERROR".to_string(),
            TileCastError::InvalidMessage { .. } => "INVALID_MESSAGE".to_string(),
            TileCastError::Encoding { .. } => "ENCODING_FAILED".to_string(),
            TileCastError::ServerStartFailed { .. } => "SERVER_START_FAILED".to_string(),
            TileCastError::Logging { .. } => "LOGGING_INIT_FAILED".to_string(),
        }
    }

    /// Whether the error leaves the transport unusable
    pub fn is_transport_fatal(&self) -> bool {
        matches!(
            self,
            TileCastError::Transport { .. }
                | TileCastError::ConnectionTimeout { .. }
                | TileCastError::TransportClosed
        )
    }

    /// Shorthand for [`TileCastError::InvalidConfiguration`]
    pub fn invalid_configuration(field: &str, reason: impl Into<String>) -> Self {
        TileCastError::InvalidConfiguration {
            field: field.to_string(),
            reason: reason.into(),
        }
    }
}

impl From<tungstenite::Error> for TileCastError {
    fn from(error: tungstenite::Error) -> Self {
        match error {
            tungstenite::Error::ConnectionClosed | tungstenite::Error::AlreadyClosed => {
                TileCastError::TransportClosed
            }
            other => TileCastError::Transport {
                reason: other.to_string(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        let cases = [
            (TileCastError::invalid_configuration("port", "zero"), "INVALID_CONFIGURATION"),
            (
                TileCastError::Transport {
                    reason: "reset".to_string(),
                },
                "TRANSPORT_ERROR",
            ),
            (TileCastError::TransportClosed, "TRANSPORT_CLOSED"),
            (
                TileCastError::PeerConnection {
                    reason: "ice".to_string(),
                },
                "PEER_CONNECTION_ERROR",
            ),
            (
                TileCastError::Encoding {
                    reason: "bad".to_string(),
                },
                "ENCODING_FAILED",
            ),
            (
                TileCastError::Logging {
                    reason: "set".to_string(),
                },
                "LOGGING_INIT_FAILED",
            ),
        ];
        for (error, code) in cases {
            assert_eq!(error.error_code(), code);
        }
    }

    #[test]
    fn test_transport_fatal() {
        assert!(TileCastError::from(tungstenite::Error::ConnectionClosed).is_transport_fatal());
        assert!(!TileCastError::PeerConnection {
            reason: "ice".to_string()
        }
        .is_transport_fatal());
    }
}
