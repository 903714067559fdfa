//! Local compute host backed by ordinary host processes.
//!
//! Containers are bookkeeping entries bound to a sandbox directory; guest
//! processes run through `sh -c` with the sandbox root filesystem as their
//! working directory. There is no kernel-level isolation here. The backend
//! exists so the orchestration protocol can run end to end on any Unix host.
//!
//! Each guest process leads its own process group. Killing a guest kills
//! the whole group, so nothing it forked outlives the container.

use crate::config::{
    ContainerSettings, NetworkId, NetworkMode, ProcessStartInfo, VirtualSwitch, ROOTFS_DIR,
};
use crate::container::{ComputeHost, Container, ContainerState, GuestProcess, OutputStream};
use crate::error::{HostError, Result};
use async_trait::async_trait;
use nix::errno::Errno;
use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::process::{Child, ChildStdout, Command};

/// Shared map of live container IDs to their last known state.
type Registry = Arc<Mutex<HashMap<String, ContainerState>>>;

/// A spawned guest: its process group and the `sh` that leads it.
#[derive(Clone)]
struct GuestGroup {
    pgid: Option<u32>,
    child: Arc<tokio::sync::Mutex<Child>>,
}

impl GuestGroup {
    /// SIGKILL every process in the group. An already empty group is fine.
    fn kill(&self) -> std::result::Result<(), Errno> {
        let Some(pgid) = self.pgid else {
            return Ok(());
        };
        match killpg(Pid::from_raw(pgid as i32), Signal::SIGKILL) {
            Ok(()) | Err(Errno::ESRCH) => Ok(()),
            Err(e) => Err(e),
        }
    }
}

fn lock(registry: &Mutex<HashMap<String, ContainerState>>) -> MutexGuard<'_, HashMap<String, ContainerState>> {
    registry.lock().unwrap_or_else(PoisonError::into_inner)
}

/// A compute host that runs guest processes directly on this machine.
///
/// Cloning is cheap; clones share the container registry.
#[derive(Debug, Clone, Default)]
pub struct LocalHost {
    switches: Vec<VirtualSwitch>,
    containers: Registry,
}

impl LocalHost {
    /// Create a host with no virtual switches.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a host with a single NAT switch named `strata-nat`.
    pub fn with_default_nat() -> Self {
        Self::new().with_switch(VirtualSwitch::new("strata-nat", NetworkMode::Nat))
    }

    /// Register a virtual switch.
    pub fn with_switch(mut self, switch: VirtualSwitch) -> Self {
        tracing::debug!(switch_id = %switch.id, name = %switch.name, mode = %switch.mode, "Registering virtual switch");
        self.switches.push(switch);
        self
    }

    /// Registered virtual switches.
    pub fn switches(&self) -> &[VirtualSwitch] {
        &self.switches
    }

    /// IDs of containers that have been created and not yet terminated.
    pub fn containers(&self) -> Vec<String> {
        let mut ids: Vec<String> = lock(&self.containers).keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Last known state of a live container.
    pub fn container_state(&self, id: &str) -> Option<ContainerState> {
        lock(&self.containers).get(id).copied()
    }
}

#[async_trait]
impl ComputeHost for LocalHost {
    async fn find_network(&self, mode: NetworkMode) -> Result<NetworkId> {
        tracing::debug!(%mode, switches = self.switches.len(), "Looking up virtual switch");
        let switch = self
            .switches
            .iter()
            .find(|s| s.mode == mode)
            .ok_or_else(|| HostError::NetworkNotFound(mode.to_string()))?;
        tracing::debug!(%mode, switch_id = %switch.id, name = %switch.name, "Virtual switch found");
        Ok(switch.id)
    }

    async fn create_container(
        &self,
        id: &str,
        settings: ContainerSettings,
    ) -> Result<Box<dyn Container>> {
        settings.validate()?;

        if let Some(network_id) = settings.network_id {
            if !self.switches.iter().any(|s| s.id == network_id) {
                return Err(HostError::NetworkNotFound(network_id.to_string()));
            }
        }

        let is_dir = tokio::fs::metadata(&settings.sandbox_path)
            .await
            .map(|m| m.is_dir())
            .unwrap_or(false);
        if !is_dir {
            return Err(HostError::Create(format!(
                "sandbox not found: {}",
                settings.sandbox_path.display()
            )));
        }

        {
            let mut registry = lock(&self.containers);
            if registry.contains_key(id) {
                return Err(HostError::Create(format!("container {id} already exists")));
            }
            registry.insert(id.to_string(), ContainerState::Created);
        }

        tracing::info!(
            container_id = %id,
            sandbox = %settings.sandbox_path.display(),
            layers = settings.layers.len(),
            "Container created"
        );

        Ok(Box::new(LocalContainer {
            id: id.to_string(),
            settings,
            state: ContainerState::Created,
            processes: Vec::new(),
            registry: Arc::clone(&self.containers),
        }))
    }
}

/// A container created by [`LocalHost`].
pub struct LocalContainer {
    id: String,
    settings: ContainerSettings,
    state: ContainerState,
    processes: Vec<GuestGroup>,
    registry: Registry,
}

impl LocalContainer {
    fn set_state(&mut self, state: ContainerState) {
        self.state = state;
        let mut registry = lock(&self.registry);
        if state == ContainerState::Terminated {
            registry.remove(&self.id);
        } else {
            registry.insert(self.id.clone(), state);
        }
    }

    /// Guest processes run in the sandbox root filesystem when present.
    fn workdir(&self) -> PathBuf {
        let rootfs = self.settings.sandbox_path.join(ROOTFS_DIR);
        if rootfs.is_dir() {
            rootfs
        } else {
            self.settings.sandbox_path.clone()
        }
    }

    fn ensure_state(&self, expected: ContainerState) -> Result<()> {
        if self.state != expected {
            return Err(HostError::InvalidState {
                expected: expected.to_string(),
                actual: self.state.to_string(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl Container for LocalContainer {
    fn id(&self) -> &str {
        &self.id
    }

    fn state(&self) -> ContainerState {
        self.state
    }

    async fn start(&mut self) -> Result<()> {
        self.ensure_state(ContainerState::Created)?;

        if tokio::fs::metadata(&self.settings.sandbox_path).await.is_err() {
            return Err(HostError::Start(format!(
                "sandbox disappeared: {}",
                self.settings.sandbox_path.display()
            )));
        }

        self.set_state(ContainerState::Running);
        tracing::info!(container_id = %self.id, "Container started");
        Ok(())
    }

    async fn create_process(&mut self, info: ProcessStartInfo) -> Result<Box<dyn GuestProcess>> {
        self.ensure_state(ContainerState::Running)?;

        let mut cmd = Command::new("sh");
        cmd.arg("-c")
            .arg(&info.command_line)
            .current_dir(self.workdir())
            .env("STRATA_CONTAINER_ID", &self.id)
            .stdin(Stdio::null())
            .stdout(if info.redirect_stdout {
                Stdio::piped()
            } else {
                Stdio::inherit()
            })
            .process_group(0)
            .kill_on_drop(info.kill_on_close);
        if let Some(network_id) = self.settings.network_id {
            cmd.env("STRATA_NETWORK_ID", network_id.to_string());
        }

        let mut child = cmd
            .spawn()
            .map_err(|e| HostError::Process(format!("spawn failed: {e}")))?;
        let stdout = child.stdout.take();
        let pid = child.id();
        tracing::debug!(container_id = %self.id, pid = ?pid, cmd = %info.command_line, "Guest process spawned");

        let group = GuestGroup {
            pgid: pid,
            child: Arc::new(tokio::sync::Mutex::new(child)),
        };
        self.processes.push(group.clone());

        Ok(Box::new(LocalProcess {
            pid,
            group,
            stdout,
            kill_on_close: info.kill_on_close,
            exit_code: None,
        }))
    }

    async fn shutdown(&mut self, timeout: Option<Duration>) -> Result<()> {
        if self.state == ContainerState::Terminated {
            return Ok(());
        }

        tracing::info!(container_id = %self.id, timeout = ?timeout, "Shutting down container");
        self.set_state(ContainerState::ShuttingDown);

        let mut failures = Vec::new();
        let mut timed_out = false;
        for group in std::mem::take(&mut self.processes) {
            // The group may outlive its leader
            if let Err(e) = group.kill() {
                failures.push(format!("kill of process group {:?} failed: {e}", group.pgid));
            }
            let mut child = group.child.lock().await;
            if matches!(child.try_wait(), Ok(Some(_))) {
                continue;
            }
            if let Err(e) = child.start_kill() {
                failures.push(format!("kill failed: {e}"));
                continue;
            }
            match timeout {
                Some(limit) => match tokio::time::timeout(limit, child.wait()).await {
                    Ok(Ok(_)) => {}
                    Ok(Err(e)) => failures.push(format!("wait failed: {e}")),
                    Err(_) => timed_out = true,
                },
                None => {
                    if let Err(e) = child.wait().await {
                        failures.push(format!("wait failed: {e}"));
                    }
                }
            }
        }

        self.set_state(ContainerState::Terminated);

        match (timed_out, timeout) {
            (true, Some(limit)) => {
                tracing::warn!(container_id = %self.id, ?limit, "Guest outlived shutdown timeout");
                Err(HostError::Timeout(limit))
            }
            _ if !failures.is_empty() => Err(HostError::Shutdown(failures.join("; "))),
            _ => {
                tracing::info!(container_id = %self.id, "Container terminated");
                Ok(())
            }
        }
    }
}

impl Drop for LocalContainer {
    fn drop(&mut self) {
        if self.state == ContainerState::Terminated {
            return;
        }
        tracing::warn!(container_id = %self.id, state = %self.state, "Container disposed without shutdown");
        if self.settings.kill_on_close {
            for group in &self.processes {
                let _ = group.kill();
                if let Ok(mut child) = group.child.try_lock() {
                    let _ = child.start_kill();
                }
            }
        }
        lock(&self.registry).remove(&self.id);
    }
}

/// A guest process started by [`LocalContainer`].
pub struct LocalProcess {
    pid: Option<u32>,
    group: GuestGroup,
    stdout: Option<ChildStdout>,
    kill_on_close: bool,
    exit_code: Option<i32>,
}

#[async_trait]
impl GuestProcess for LocalProcess {
    fn pid(&self) -> Option<u32> {
        self.pid
    }

    fn take_stdout(&mut self) -> Option<OutputStream> {
        self.stdout.take().map(|s| Box::new(s) as OutputStream)
    }

    async fn wait_for_exit(&mut self, timeout: Duration) -> Result<Option<i32>> {
        if let Some(code) = self.exit_code {
            return Ok(Some(code));
        }

        let mut child = self.group.child.lock().await;
        match tokio::time::timeout(timeout, child.wait()).await {
            Ok(Ok(status)) => {
                // -1 when killed by a signal
                let code = status.code().unwrap_or(-1);
                self.exit_code = Some(code);
                Ok(Some(code))
            }
            Ok(Err(e)) => Err(HostError::Process(format!("wait failed: {e}"))),
            Err(_) => {
                tracing::debug!(pid = ?self.pid, ?timeout, "Guest process still running");
                Ok(None)
            }
        }
    }

    async fn kill(&mut self) -> Result<()> {
        tracing::warn!(pid = ?self.pid, "Force killing guest process group");
        self.group
            .kill()
            .map_err(|e| HostError::Process(format!("kill of process group failed: {e}")))?;
        let mut child = self.group.child.lock().await;
        if matches!(child.try_wait(), Ok(Some(_))) {
            return Ok(());
        }
        child
            .start_kill()
            .map_err(|e| HostError::Process(format!("kill failed: {e}")))
    }
}

impl Drop for LocalProcess {
    fn drop(&mut self) {
        if !self.kill_on_close {
            return;
        }
        // Leader may have exited while its children still run
        let _ = self.group.kill();
        if self.exit_code.is_some() {
            return;
        }
        if let Ok(mut child) = self.group.child.try_lock() {
            if matches!(child.try_wait(), Ok(None)) {
                let _ = child.start_kill();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LayerRef;
    use tokio::io::AsyncReadExt;

    fn settings(sandbox: &std::path::Path, network_id: Option<NetworkId>) -> ContainerSettings {
        ContainerSettings {
            sandbox_path: sandbox.to_path_buf(),
            layers: vec![LayerRef::new("/layers/base")],
            network_id,
            kill_on_close: true,
        }
    }

    #[tokio::test]
    async fn test_find_network_by_mode() {
        let host = LocalHost::with_default_nat();
        let id = host.find_network(NetworkMode::Nat).await.unwrap();
        assert_eq!(id, host.switches()[0].id);

        let missing = host.find_network(NetworkMode::Transparent).await;
        assert!(matches!(missing, Err(HostError::NetworkNotFound(_))));
    }

    #[tokio::test]
    async fn test_create_rejects_unknown_network() {
        let dir = tempfile::tempdir().unwrap();
        let host = LocalHost::new();
        let result = host
            .create_container("c1", settings(dir.path(), Some(NetworkId::new())))
            .await;
        assert!(matches!(result, Err(HostError::NetworkNotFound(_))));
        assert!(host.containers().is_empty());
    }

    #[tokio::test]
    async fn test_create_rejects_duplicate_id() {
        let dir = tempfile::tempdir().unwrap();
        let host = LocalHost::new();
        let _first = host
            .create_container("c1", settings(dir.path(), None))
            .await
            .unwrap();
        let second = host.create_container("c1", settings(dir.path(), None)).await;
        assert!(matches!(second, Err(HostError::Create(_))));
    }

    #[tokio::test]
    async fn test_process_requires_running_container() {
        let dir = tempfile::tempdir().unwrap();
        let host = LocalHost::new();
        let mut container = host
            .create_container("c1", settings(dir.path(), None))
            .await
            .unwrap();
        let result = container
            .create_process(ProcessStartInfo::redirected("true"))
            .await;
        assert!(matches!(result, Err(HostError::InvalidState { .. })));
    }

    #[tokio::test]
    async fn test_container_lifecycle() {
        let dir = tempfile::tempdir().unwrap();
        let host = LocalHost::with_default_nat();
        let network = host.find_network(NetworkMode::Nat).await.unwrap();

        let mut container = host
            .create_container("c1", settings(dir.path(), Some(network)))
            .await
            .unwrap();
        assert_eq!(host.container_state("c1"), Some(ContainerState::Created));

        container.start().await.unwrap();
        assert_eq!(container.state(), ContainerState::Running);
        assert!(container.start().await.is_err());

        let mut process = container
            .create_process(ProcessStartInfo::redirected("echo hi; echo $STRATA_CONTAINER_ID"))
            .await
            .unwrap();
        let mut output = String::new();
        process
            .take_stdout()
            .unwrap()
            .read_to_string(&mut output)
            .await
            .unwrap();
        let code = process.wait_for_exit(Duration::from_secs(5)).await.unwrap();

        assert_eq!(code, Some(0));
        assert!(output.contains("hi"));
        assert!(output.contains("c1"));

        drop(process);
        container.shutdown(None).await.unwrap();
        assert_eq!(container.state(), ContainerState::Terminated);
        assert!(host.containers().is_empty());
    }

    #[tokio::test]
    async fn test_wait_times_out_and_shutdown_kills() {
        let dir = tempfile::tempdir().unwrap();
        let host = LocalHost::new();
        let mut container = host
            .create_container("c1", settings(dir.path(), None))
            .await
            .unwrap();
        container.start().await.unwrap();

        let mut process = container
            .create_process(ProcessStartInfo::redirected("sleep 30"))
            .await
            .unwrap();
        let code = process
            .wait_for_exit(Duration::from_millis(50))
            .await
            .unwrap();
        assert_eq!(code, None);

        container.shutdown(Some(Duration::from_secs(5))).await.unwrap();
        assert!(host.containers().is_empty());
    }

    #[tokio::test]
    async fn test_shutdown_kills_nested_shell() {
        let dir = tempfile::tempdir().unwrap();
        let host = LocalHost::new();
        let mut container = host
            .create_container("c1", settings(dir.path(), None))
            .await
            .unwrap();
        container.start().await.unwrap();

        let _process = container
            .create_process(ProcessStartInfo::redirected(
                "sh -c 'sleep 1; touch marker'; true",
            ))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        container.shutdown(None).await.unwrap();
        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert!(!dir.path().join("marker").exists());
    }

    #[tokio::test]
    async fn test_shutdown_kills_background_children_of_exited_guest() {
        let dir = tempfile::tempdir().unwrap();
        let host = LocalHost::new();
        let mut container = host
            .create_container("c1", settings(dir.path(), None))
            .await
            .unwrap();
        container.start().await.unwrap();

        let mut process = container
            .create_process(ProcessStartInfo::redirected(
                "(sleep 1; touch marker) > /dev/null & exit 0",
            ))
            .await
            .unwrap();
        let code = process.wait_for_exit(Duration::from_secs(5)).await.unwrap();
        assert_eq!(code, Some(0));

        container.shutdown(None).await.unwrap();
        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert!(!dir.path().join("marker").exists());
        drop(process);
    }

    #[test]
    fn test_shutdown_timeout_error() {
        let err = HostError::Timeout(Duration::from_millis(250));
        assert_eq!(err.to_string(), "shutdown timed out after 250ms");
    }

    #[tokio::test]
    async fn test_drop_deregisters_container() {
        let dir = tempfile::tempdir().unwrap();
        let host = LocalHost::new();
        let container = host
            .create_container("c1", settings(dir.path(), None))
            .await
            .unwrap();
        assert_eq!(host.containers(), vec!["c1".to_string()]);
        drop(container);
        assert!(host.containers().is_empty());
    }
}
