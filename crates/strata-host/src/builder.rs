//! Builder pattern for ergonomic container configuration.

use crate::config::{ContainerSettings, LayerRef, NetworkId};
use crate::container::{ComputeHost, Container};
use crate::error::Result;
use std::path::PathBuf;

/// Fluent builder for configuring and creating containers.
///
/// # Example
///
/// ```no_run
/// use strata_host::{ContainerBuilder, LocalHost, NetworkMode, ComputeHost};
///
/// # async fn example() -> strata_host::Result<()> {
/// let host = LocalHost::with_default_nat();
/// let network = host.find_network(NetworkMode::Nat).await?;
///
/// let container = ContainerBuilder::new()
///     .sandbox("/tmp/strata/sandboxes/demo")
///     .layer("/var/lib/strata/layers/base")
///     .network(network)
///     .build(&host, "demo")
///     .await?;
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct ContainerBuilder {
    settings: ContainerSettings,
}

impl Default for ContainerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl ContainerBuilder {
    /// Create a new builder with default settings.
    pub fn new() -> Self {
        Self {
            settings: ContainerSettings::default(),
        }
    }

    /// Set the sandbox directory.
    pub fn sandbox(mut self, path: impl Into<PathBuf>) -> Self {
        self.settings.sandbox_path = path.into();
        self
    }

    /// Append a layer, minting a fresh identifier for it.
    pub fn layer(mut self, path: impl Into<PathBuf>) -> Self {
        self.settings.layers.push(LayerRef::new(path));
        self
    }

    /// Replace the layer list.
    pub fn layers(mut self, layers: Vec<LayerRef>) -> Self {
        self.settings.layers = layers;
        self
    }

    /// Attach the container to a virtual switch.
    pub fn network(mut self, id: NetworkId) -> Self {
        self.settings.network_id = Some(id);
        self
    }

    /// Set whether the container is terminated when its handle is dropped.
    pub fn kill_on_close(mut self, kill: bool) -> Self {
        self.settings.kill_on_close = kill;
        self
    }

    /// Build and return the settings without creating a container.
    pub fn build_settings(self) -> ContainerSettings {
        self.settings
    }

    /// Validate the settings and create the container on `host`.
    ///
    /// # Errors
    /// Returns an error if the settings are invalid or the host refuses.
    pub async fn build(self, host: &dyn ComputeHost, id: &str) -> Result<Box<dyn Container>> {
        self.settings.validate()?;
        host.create_container(id, self.settings).await
    }
}
