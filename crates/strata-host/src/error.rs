//! Error types for strata-host.

use thiserror::Error;

/// Result type alias for strata-host operations.
pub type Result<T> = std::result::Result<T, HostError>;

/// Errors that can occur while talking to the compute host.
#[derive(Debug, Error)]
pub enum HostError {
    /// Failed to create the container
    #[error("failed to create container: {0}")]
    Create(String),

    /// Failed to start the container
    #[error("failed to start container: {0}")]
    Start(String),

    /// Failed to launch or observe a guest process
    #[error("guest process error: {0}")]
    Process(String),

    /// Failed to shut the container down
    #[error("failed to shut down container: {0}")]
    Shutdown(String),

    /// No virtual switch matches the requested mode
    #[error("no virtual network found for mode {0}")]
    NetworkNotFound(String),

    /// Container is not in expected state
    #[error("invalid container state: expected {expected}, got {actual}")]
    InvalidState { expected: String, actual: String },

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Guest processes outlived the shutdown timeout
    #[error("shutdown timed out after {0:?}")]
    Timeout(std::time::Duration),
}
