//! Network lookup.

use crate::error::{CoreError, Result};
use std::sync::Arc;
use strata_host::{ComputeHost, HostError, NetworkId, NetworkMode};

/// Finds the virtual switch a container should attach to.
///
/// Read-only: the switch pre-exists on the host and is never owned by a run.
#[derive(Clone)]
pub struct NetworkLocator {
    host: Arc<dyn ComputeHost>,
}

impl NetworkLocator {
    /// Create a locator querying `host`.
    pub fn new(host: Arc<dyn ComputeHost>) -> Self {
        Self { host }
    }

    /// Find a network for `mode`.
    ///
    /// # Errors
    /// Returns [`CoreError::NotFound`] if no switch matches.
    pub async fn find(&self, mode: NetworkMode) -> Result<NetworkId> {
        match self.host.find_network(mode).await {
            Ok(id) => {
                tracing::debug!(%mode, network_id = %id, "Network found");
                Ok(id)
            }
            Err(HostError::NetworkNotFound(_)) => {
                tracing::warn!(%mode, "No virtual switch for network mode");
                Err(CoreError::NotFound(format!("no virtual switch with mode {mode}")))
            }
            Err(e) => Err(CoreError::NotFound(format!("network lookup failed: {e}"))),
        }
    }
}
