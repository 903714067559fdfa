//! Compute host interface - the seam between orchestration and the host.

use crate::config::{ContainerSettings, NetworkId, NetworkMode, ProcessStartInfo};
use crate::error::Result;
use async_trait::async_trait;
use std::time::Duration;
use tokio::io::AsyncRead;

/// Redirected standard output of a guest process.
pub type OutputStream = Box<dyn AsyncRead + Send + Unpin>;

/// Current state of a container.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerState {
    /// Container exists but has not been started
    Created,
    /// Container is running and accepts processes
    Running,
    /// Shutdown requested, processes are being terminated
    ShuttingDown,
    /// Container is gone
    Terminated,
}

impl std::fmt::Display for ContainerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ContainerState::Created => write!(f, "created"),
            ContainerState::Running => write!(f, "running"),
            ContainerState::ShuttingDown => write!(f, "shutting down"),
            ContainerState::Terminated => write!(f, "terminated"),
        }
    }
}

/// Host service that owns virtual networks and creates containers.
#[async_trait]
pub trait ComputeHost: Send + Sync {
    /// Find a virtual switch for the given mode.
    ///
    /// # Errors
    /// Returns [`HostError::NetworkNotFound`](crate::HostError::NetworkNotFound)
    /// if no registered switch matches.
    async fn find_network(&self, mode: NetworkMode) -> Result<NetworkId>;

    /// Create a container in the `Created` state.
    async fn create_container(
        &self,
        id: &str,
        settings: ContainerSettings,
    ) -> Result<Box<dyn Container>>;
}

/// One isolated compute environment.
///
/// Dropping the handle disposes of it. Callers are expected to call
/// [`shutdown`](Container::shutdown) first.
#[async_trait]
pub trait Container: Send + Sync {
    /// Container identifier as given at creation.
    fn id(&self) -> &str;

    /// Current state.
    fn state(&self) -> ContainerState;

    /// Start the container.
    ///
    /// # Errors
    /// Returns an error unless the container is in the `Created` state.
    async fn start(&mut self) -> Result<()>;

    /// Launch a process inside the running container.
    async fn create_process(&mut self, info: ProcessStartInfo) -> Result<Box<dyn GuestProcess>>;

    /// Shut the container down, terminating any remaining processes.
    ///
    /// `None` waits without bound. Calling this on a terminated container
    /// is a no-op.
    async fn shutdown(&mut self, timeout: Option<Duration>) -> Result<()>;
}

/// A process running inside a container.
#[async_trait]
pub trait GuestProcess: Send {
    /// Host-side process identifier, if the host exposes one.
    fn pid(&self) -> Option<u32>;

    /// Take the redirected stdout stream. Returns `None` if output was not
    /// redirected or the stream was already taken.
    fn take_stdout(&mut self) -> Option<OutputStream>;

    /// Wait up to `timeout` for the process to exit.
    ///
    /// Returns `Ok(None)` if the process is still running when the timeout
    /// elapses.
    async fn wait_for_exit(&mut self, timeout: Duration) -> Result<Option<i32>>;

    /// Forcefully terminate the process.
    async fn kill(&mut self) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_container_state_display() {
        assert_eq!(ContainerState::Created.to_string(), "created");
        assert_eq!(ContainerState::Running.to_string(), "running");
        assert_eq!(ContainerState::ShuttingDown.to_string(), "shutting down");
        assert_eq!(ContainerState::Terminated.to_string(), "terminated");
    }
}
