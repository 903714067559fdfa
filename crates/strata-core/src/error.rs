//! Error types for strata-core.

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for strata-core operations.
pub type Result<T> = std::result::Result<T, CoreError>;

/// Errors that can occur while provisioning, running or tearing down a
/// container.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Image or layer chain could not be resolved
    #[error("layer resolution failed: {0}")]
    Resolution(String),

    /// Sandbox path is already taken
    #[error("sandbox path already exists: {}", .0.display())]
    Conflict(PathBuf),

    /// No virtual network matches the requested mode
    #[error("network not found: {0}")]
    NotFound(String),

    /// Container could not be created or started
    #[error("allocation failed: {0}")]
    Allocation(String),

    /// Guest process could not be launched or observed
    #[error("execution failed: {0}")]
    Execution(String),

    /// Container shutdown or sandbox destruction failed
    #[error("teardown failed: {0}")]
    Teardown(String),

    /// Run was cancelled by the caller
    #[error("run cancelled")]
    Cancelled,

    /// Invalid configuration
    #[error("configuration error: {0}")]
    Config(String),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl CoreError {
    /// Whether this error came out of the teardown phase.
    pub fn is_teardown(&self) -> bool {
        matches!(self, Self::Teardown(_))
    }
}
