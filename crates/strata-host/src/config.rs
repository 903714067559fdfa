//! Configuration types handed to the compute host.

use crate::error::{HostError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use uuid::Uuid;

/// Directory inside a sandbox that guest processes see as their root.
pub const ROOTFS_DIR: &str = "rootfs";

/// A read-only filesystem layer a container is built on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LayerRef {
    /// Identifier minted when the layer was resolved
    pub id: Uuid,
    /// Path to the layer content on the host
    pub path: PathBuf,
}

impl LayerRef {
    /// Create a layer reference with a fresh identifier.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            id: Uuid::new_v4(),
            path: path.into(),
        }
    }
}

/// Identifier of a virtual network switch registered on the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NetworkId(Uuid);

impl NetworkId {
    /// Create a new random network ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Get the underlying UUID.
    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for NetworkId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for NetworkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<Uuid> for NetworkId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

/// How a virtual switch connects its containers to the outside.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NetworkMode {
    /// Address translation behind the host
    #[default]
    Nat,
    /// Bridged straight onto the physical network
    Transparent,
    /// Layer-2 bridge with host-side routing
    L2Bridge,
    /// Host and containers only
    Internal,
}

impl fmt::Display for NetworkMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NetworkMode::Nat => write!(f, "nat"),
            NetworkMode::Transparent => write!(f, "transparent"),
            NetworkMode::L2Bridge => write!(f, "l2bridge"),
            NetworkMode::Internal => write!(f, "internal"),
        }
    }
}

impl FromStr for NetworkMode {
    type Err = HostError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "nat" => Ok(Self::Nat),
            "transparent" => Ok(Self::Transparent),
            "l2bridge" => Ok(Self::L2Bridge),
            "internal" => Ok(Self::Internal),
            other => Err(HostError::Config(format!("unknown network mode: {other}"))),
        }
    }
}

/// A virtual switch known to the host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VirtualSwitch {
    pub id: NetworkId,
    pub name: String,
    pub mode: NetworkMode,
}

impl VirtualSwitch {
    /// Create a switch with a fresh ID.
    pub fn new(name: impl Into<String>, mode: NetworkMode) -> Self {
        Self {
            id: NetworkId::new(),
            name: name.into(),
            mode,
        }
    }
}

/// Settings for creating a new container.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContainerSettings {
    /// Writable sandbox directory the container runs on
    pub sandbox_path: PathBuf,
    /// Read-only layers under the sandbox, leaf first
    pub layers: Vec<LayerRef>,
    /// Virtual switch to attach to (optional)
    pub network_id: Option<NetworkId>,
    /// Terminate the container when its handle is dropped
    pub kill_on_close: bool,
}

impl Default for ContainerSettings {
    fn default() -> Self {
        Self {
            sandbox_path: PathBuf::new(),
            layers: Vec::new(),
            network_id: None,
            kill_on_close: true,
        }
    }
}

impl ContainerSettings {
    /// Validate the settings.
    ///
    /// # Errors
    /// Returns an error if the sandbox path is missing or no layer is given.
    pub fn validate(&self) -> Result<()> {
        if self.sandbox_path.as_os_str().is_empty() {
            return Err(HostError::Config("sandbox_path is required".into()));
        }

        if self.layers.is_empty() {
            return Err(HostError::Config("at least one layer is required".into()));
        }

        let mut ids = Vec::with_capacity(self.layers.len());
        for layer in &self.layers {
            if ids.contains(&layer.id) {
                return Err(HostError::Config(format!("duplicate layer id: {}", layer.id)));
            }
            ids.push(layer.id);
        }

        Ok(())
    }
}

/// Describes a process to launch inside a running container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessStartInfo {
    /// Command line, interpreted by the guest shell
    pub command_line: String,
    /// Capture standard output instead of inheriting it
    pub redirect_stdout: bool,
    /// Kill the process when its handle is dropped
    pub kill_on_close: bool,
}

impl ProcessStartInfo {
    /// Start info with output redirection and kill-on-close enabled.
    pub fn redirected(command_line: impl Into<String>) -> Self {
        Self {
            command_line: command_line.into(),
            redirect_stdout: true,
            kill_on_close: true,
        }
    }
}
