//! Structured logging bootstrap

use tilecast_core::{Result, TileCastError};
use tracing_subscriber::EnvFilter;

/// Filter used when `RUST_LOG` is not set
pub const DEFAULT_LOG_DIRECTIVE: &str = "info,webrtc=warn";

/// Install a global fmt subscriber filtered by `RUST_LOG`, falling back to
/// [`DEFAULT_LOG_DIRECTIVE`]
pub fn init_logging() -> Result<()> {
    init_logging_with(DEFAULT_LOG_DIRECTIVE)
}

/// Install a global fmt subscriber filtered by `RUST_LOG`, falling back to
/// `default_directive`
///
/// Fails if the directive does not parse or a global subscriber is
/// already installed.
pub fn init_logging_with(default_directive: &str) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_directive))
        .map_err(|e| TileCastError::Logging {
            reason: e.to_string(),
        })?;

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .try_init()
        .map_err(|e| TileCastError::Logging {
            reason: e.to_string(),
        })
}
