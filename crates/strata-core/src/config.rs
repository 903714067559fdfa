//! Run configuration types.

use crate::error::CoreError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use strata_host::NetworkMode;

/// Default bound on waiting for the guest process to exit.
pub const DEFAULT_EXIT_TIMEOUT: Duration = Duration::from_millis(5000);

/// Which part of an image's layer chain a sandbox is built on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LayerSelection {
    /// The whole chain, in descriptor order.
    #[default]
    Full,
    /// Only the root-most layer (last descriptor entry).
    Base,
}

impl fmt::Display for LayerSelection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Full => write!(f, "full"),
            Self::Base => write!(f, "base"),
        }
    }
}

impl FromStr for LayerSelection {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "full" => Ok(Self::Full),
            "base" | "base-only" => Ok(Self::Base),
            other => Err(CoreError::Config(format!("unknown layer selection: {other}"))),
        }
    }
}

/// Configuration shared by every run of an orchestrator.
#[derive(Debug, Clone)]
pub struct RunConfig {
    /// Directory under which per-run sandboxes are created.
    pub sandbox_root: PathBuf,
    /// Virtual network mode to attach containers to (default: NAT).
    pub network_mode: NetworkMode,
    /// How long to wait for the guest process to exit (default: 5s).
    pub exit_timeout: Duration,
    /// Which layers of the chain to mount (default: all).
    pub layer_selection: LayerSelection,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            sandbox_root: PathBuf::from("/tmp/strata/sandboxes"),
            network_mode: NetworkMode::Nat,
            exit_timeout: DEFAULT_EXIT_TIMEOUT,
            layer_selection: LayerSelection::Full,
        }
    }
}

impl RunConfig {
    /// Create a new config builder.
    pub fn builder() -> RunConfigBuilder {
        RunConfigBuilder::default()
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), CoreError> {
        if self.sandbox_root.as_os_str().is_empty() {
            return Err(CoreError::Config("sandbox_root is required".into()));
        }
        if self.exit_timeout.is_zero() {
            return Err(CoreError::Config("exit_timeout must be > 0".into()));
        }
        Ok(())
    }
}

/// Builder for RunConfig.
#[derive(Debug, Default)]
pub struct RunConfigBuilder {
    config: RunConfig,
}

impl RunConfigBuilder {
    /// Set the sandbox root directory.
    pub fn sandbox_root(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.sandbox_root = path.into();
        self
    }

    /// Set the network mode.
    pub fn network_mode(mut self, mode: NetworkMode) -> Self {
        self.config.network_mode = mode;
        self
    }

    /// Set the guest exit timeout.
    pub fn exit_timeout(mut self, timeout: Duration) -> Self {
        self.config.exit_timeout = timeout;
        self
    }

    /// Set the layer selection.
    pub fn layer_selection(mut self, selection: LayerSelection) -> Self {
        self.config.layer_selection = selection;
        self
    }

    /// Build the configuration, validating all fields.
    pub fn build(self) -> Result<RunConfig, CoreError> {
        self.config.validate()?;
        Ok(self.config)
    }
}
