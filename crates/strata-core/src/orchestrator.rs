//! Container orchestrator - one command in one fresh container, from cold
//! start to full teardown.
//!
//! A run acquires its resources in a fixed order:
//!
//! ```text
//! Init -> SandboxReady -> ContainerCreated -> ContainerStarted
//!      -> ProcessLaunched -> ProcessExited
//!      -> ContainerShuttingDown -> SandboxDestroyed -> Done
//! ```
//!
//! Each acquisition pushes its release onto an [`UnwindStack`]. Whatever
//! happens after the sandbox exists (success, failure, timeout or
//! cancellation) the stack is unwound before `run` returns, so the guest
//! process handle is released first, then the container is shut down, then
//! the sandbox is destroyed.

use crate::config::RunConfig;
use crate::error::{CoreError, Result};
use crate::events::{EventRecord, EventSink, NullSink, RunEvent};
use crate::layers::{ImageInspector, LayerChain, LayerResolver};
use crate::network::NetworkLocator;
use crate::storage::{Sandbox, SandboxStorage};
use crate::unwind::{TeardownFailure, UnwindStack};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use strata_host::{ComputeHost, Container, ContainerSettings, GuestProcess, ProcessStartInfo};
use tokio::io::AsyncReadExt;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

const STEP_DESTROY_SANDBOX: &str = "destroy-sandbox";
const STEP_SHUTDOWN_CONTAINER: &str = "shutdown-container";

/// Unique identifier for a run.
///
/// Names both the sandbox directory and the container, so concurrent runs
/// never collide without any coordination between them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RunId(Uuid);

impl RunId {
    /// Create a new random run ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Get the underlying UUID.
    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<Uuid> for RunId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

/// Lifecycle phase of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum RunPhase {
    Init,
    SandboxReady,
    ContainerCreated,
    ContainerStarted,
    ProcessLaunched,
    ProcessExited,
    ContainerShuttingDown,
    SandboxDestroyed,
    Done,
}

impl fmt::Display for RunPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Init => write!(f, "Init"),
            Self::SandboxReady => write!(f, "SandboxReady"),
            Self::ContainerCreated => write!(f, "ContainerCreated"),
            Self::ContainerStarted => write!(f, "ContainerStarted"),
            Self::ProcessLaunched => write!(f, "ProcessLaunched"),
            Self::ProcessExited => write!(f, "ProcessExited"),
            Self::ContainerShuttingDown => write!(f, "ContainerShuttingDown"),
            Self::SandboxDestroyed => write!(f, "SandboxDestroyed"),
            Self::Done => write!(f, "Done"),
        }
    }
}

/// What to run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunRequest {
    /// Image identifier, resolved through the image inspector.
    pub image: String,
    /// Command line for the guest process.
    pub command_line: String,
}

impl RunRequest {
    pub fn new(image: impl Into<String>, command_line: impl Into<String>) -> Self {
        Self {
            image: image.into(),
            command_line: command_line.into(),
        }
    }
}

/// Outcome of a completed run.
#[derive(Debug, Clone)]
pub struct RunReport {
    pub run_id: RunId,
    pub container_id: String,
    pub sandbox_path: PathBuf,
    pub layers: LayerChain,
    /// `None` when the guest was still running at the exit timeout.
    pub exit_code: Option<i32>,
    pub timed_out: bool,
    /// Captured standard output, lossily decoded as UTF-8.
    pub output: String,
    /// Phases the run passed through, in order.
    pub phases: Vec<RunPhase>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl RunReport {
    /// Whether the guest exited with status zero.
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }
}

/// What the guest process did.
struct Execution {
    exit_code: Option<i32>,
    output: String,
}

/// Tracks the phase of one run and stamps its events.
struct RunTracker {
    run_id: RunId,
    phases: Vec<RunPhase>,
    events: Arc<dyn EventSink>,
}

impl RunTracker {
    fn new(run_id: RunId, events: Arc<dyn EventSink>) -> Self {
        Self {
            run_id,
            phases: vec![RunPhase::Init],
            events,
        }
    }

    fn phase(&self) -> RunPhase {
        self.phases.last().copied().unwrap_or(RunPhase::Init)
    }

    fn reached(&self, phase: RunPhase) -> bool {
        self.phases.contains(&phase)
    }

    fn enter(&mut self, phase: RunPhase) {
        tracing::trace!(run_id = %self.run_id, from = %self.phase(), to = %phase, "Phase transition");
        self.phases.push(phase);
    }

    fn emit(&self, event: RunEvent) {
        self.events.emit(EventRecord::now(self.run_id, event));
    }

    /// Record the end of unwinding. The sandbox only counts as destroyed
    /// when destroying it did not fail.
    fn finish(&mut self, failures: &[TeardownFailure]) {
        if !failures.iter().any(|f| f.step == STEP_DESTROY_SANDBOX) {
            self.enter(RunPhase::SandboxDestroyed);
        }
        self.enter(RunPhase::Done);
    }
}

fn check_cancelled(cancel: &CancellationToken) -> Result<()> {
    if cancel.is_cancelled() {
        return Err(CoreError::Cancelled);
    }
    Ok(())
}

/// Drives provisioning, execution and teardown of single-command runs.
///
/// Cloning is cheap. Clones share the host, storage and event sink, and
/// can run concurrently.
#[derive(Clone)]
pub struct Orchestrator {
    config: RunConfig,
    resolver: LayerResolver,
    storage: Arc<dyn SandboxStorage>,
    host: Arc<dyn ComputeHost>,
    network: NetworkLocator,
    events: Arc<dyn EventSink>,
}

impl Orchestrator {
    /// Create an orchestrator. Events are discarded until a sink is set
    /// with [`with_events`](Self::with_events).
    pub fn new(
        config: RunConfig,
        images: Arc<dyn ImageInspector>,
        storage: Arc<dyn SandboxStorage>,
        host: Arc<dyn ComputeHost>,
    ) -> Self {
        Self {
            config,
            resolver: LayerResolver::new(images),
            storage,
            network: NetworkLocator::new(Arc::clone(&host)),
            host,
            events: Arc::new(NullSink),
        }
    }

    /// Report lifecycle events to `sink`.
    pub fn with_events(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.events = sink;
        self
    }

    /// Get the run configuration.
    pub fn config(&self) -> &RunConfig {
        &self.config
    }

    /// Sandbox directory for a run.
    pub fn sandbox_path(&self, run_id: RunId) -> PathBuf {
        self.config.sandbox_root.join(run_id.to_string())
    }

    /// Resolve `request.image` and run `request.command_line` in a fresh
    /// container on it.
    ///
    /// # Errors
    /// Returns the first error encountered. Teardown failures are returned
    /// only when nothing else failed. Every resource acquired by the run
    /// has been released by the time this returns.
    ///
    /// # Cancellation
    /// Cancel through `cancel` to get teardown done before this returns.
    /// Dropping the future instead is not cancel-safe in that sense:
    /// pending teardown is then finished by a background task on the
    /// current runtime, after the drop.
    pub async fn run(&self, request: &RunRequest, cancel: &CancellationToken) -> Result<RunReport> {
        tracing::info!(image = %request.image, cmd = %request.command_line, "Run requested");

        // Nothing is held while resolving, so it can be abandoned outright.
        let chain = tokio::select! {
            chain = self.resolver.resolve(&request.image) => chain?,
            _ = cancel.cancelled() => return Err(CoreError::Cancelled),
        };

        let layers = chain.select(self.config.layer_selection);
        self.run_chain(layers, &request.command_line, cancel).await
    }

    /// Run `command_line` in a fresh container over an already resolved
    /// layer chain.
    ///
    /// Cancellation is honored between acquisitions and while the guest
    /// runs. An in-flight acquisition always completes so that whatever it
    /// allocated is known and can be released.
    pub async fn run_chain(
        &self,
        layers: LayerChain,
        command_line: &str,
        cancel: &CancellationToken,
    ) -> Result<RunReport> {
        let run_id = RunId::new();
        let container_id = run_id.to_string();
        let sandbox_path = self.sandbox_path(run_id);
        let started_at = Utc::now();
        let start = std::time::Instant::now();
        let mut run = RunTracker::new(run_id, Arc::clone(&self.events));

        check_cancelled(cancel)?;

        tracing::info!(
            run_id = %run_id,
            sandbox = %sandbox_path.display(),
            layers = layers.len(),
            "Creating sandbox"
        );
        let sandbox = match self.storage.create_sandbox(&sandbox_path, &layers).await {
            Ok(sandbox) => sandbox,
            Err(e) => {
                tracing::error!(run_id = %run_id, error = %e, "Sandbox creation failed");
                return Err(e);
            }
        };
        run.enter(RunPhase::SandboxReady);
        run.emit(RunEvent::SandboxCreated {
            path: sandbox_path.clone(),
        });

        let mut unwind = UnwindStack::new();
        {
            let storage = Arc::clone(&self.storage);
            let events = Arc::clone(&self.events);
            let path = sandbox_path.clone();
            unwind.push(STEP_DESTROY_SANDBOX, move || async move {
                storage.destroy_sandbox(&path).await?;
                events.emit(EventRecord::now(run_id, RunEvent::SandboxDestroyed));
                Ok::<(), CoreError>(())
            });
        }

        let outcome = self
            .execute(&mut run, &mut unwind, &sandbox, &container_id, command_line, cancel)
            .await;

        if run.reached(RunPhase::ContainerCreated) {
            run.enter(RunPhase::ContainerShuttingDown);
        }
        let failures = unwind.unwind().await;
        run.finish(&failures);
        run.emit(RunEvent::TornDown {
            succeeded: outcome.is_ok() && failures.is_empty(),
        });

        let elapsed_ms = start.elapsed().as_millis() as u64;
        let execution = match outcome {
            Ok(execution) => execution,
            Err(e) => {
                // The original error wins over anything teardown reported.
                for failure in &failures {
                    tracing::warn!(run_id = %run_id, step = failure.step, error = %failure.error, "Teardown failed after run error");
                }
                tracing::error!(run_id = %run_id, error = %e, elapsed_ms, "Run failed");
                return Err(e);
            }
        };

        if let Some(failure) = failures.into_iter().next() {
            tracing::error!(run_id = %run_id, step = failure.step, error = %failure.error, elapsed_ms, "Run teardown failed");
            return Err(failure.error);
        }

        tracing::info!(
            run_id = %run_id,
            exit_code = ?execution.exit_code,
            output_len = execution.output.len(),
            elapsed_ms,
            "Run complete"
        );

        Ok(RunReport {
            run_id,
            container_id,
            sandbox_path,
            layers,
            timed_out: execution.exit_code.is_none(),
            exit_code: execution.exit_code,
            output: execution.output,
            phases: run.phases,
            started_at,
            finished_at: Utc::now(),
        })
    }

    /// Everything between a ready sandbox and container shutdown.
    async fn execute(
        &self,
        run: &mut RunTracker,
        unwind: &mut UnwindStack,
        sandbox: &Sandbox,
        container_id: &str,
        command_line: &str,
        cancel: &CancellationToken,
    ) -> Result<Execution> {
        check_cancelled(cancel)?;
        let network_id = self.network.find(self.config.network_mode).await?;

        let settings = ContainerSettings {
            sandbox_path: sandbox.path().to_path_buf(),
            layers: sandbox.layers().as_slice().to_vec(),
            network_id: Some(network_id),
            kill_on_close: true,
        };

        tracing::info!(run_id = %run.run_id, container_id, network_id = %network_id, "Creating container");
        let container = self
            .host
            .create_container(container_id, settings)
            .await
            .map_err(|e| CoreError::Allocation(e.to_string()))?;
        let container: Arc<Mutex<Box<dyn Container>>> = Arc::new(Mutex::new(container));
        run.enter(RunPhase::ContainerCreated);
        run.emit(RunEvent::ContainerCreated {
            container_id: container_id.to_string(),
            network_id,
        });

        {
            let container = Arc::clone(&container);
            let events = Arc::clone(&self.events);
            let run_id = run.run_id;
            unwind.push(STEP_SHUTDOWN_CONTAINER, move || async move {
                let mut container = container.lock().await;
                tracing::info!(run_id = %run_id, container_id = container.id(), "Shutting down container");
                match container.shutdown(None).await {
                    Ok(()) => {
                        events.emit(EventRecord::now(run_id, RunEvent::ContainerShutDown));
                        Ok::<(), CoreError>(())
                    }
                    Err(e) => Err(CoreError::Teardown(format!(
                        "container {}: {e}",
                        container.id()
                    ))),
                }
            });
        }

        check_cancelled(cancel)?;
        tracing::info!(run_id = %run.run_id, container_id, "Starting container");
        container
            .lock()
            .await
            .start()
            .await
            .map_err(|e| CoreError::Allocation(e.to_string()))?;
        run.enter(RunPhase::ContainerStarted);
        run.emit(RunEvent::ContainerStarted);

        check_cancelled(cancel)?;
        let mut process = container
            .lock()
            .await
            .create_process(ProcessStartInfo::redirected(command_line))
            .await
            .map_err(|e| CoreError::Execution(format!("launch failed: {e}")))?;
        tracing::debug!(run_id = %run.run_id, pid = ?process.pid(), cmd = %command_line, "Guest process launched");
        run.enter(RunPhase::ProcessLaunched);
        run.emit(RunEvent::ProcessLaunched {
            command_line: command_line.to_string(),
        });

        let execution = self.observe(run, process.as_mut(), cancel).await;
        // Release the process handle before the container goes down.
        drop(process);
        execution
    }

    /// Drain the guest's output and wait for it to exit, all within the
    /// exit timeout.
    async fn observe(
        &self,
        run: &mut RunTracker,
        process: &mut dyn GuestProcess,
        cancel: &CancellationToken,
    ) -> Result<Execution> {
        let timeout = self.config.exit_timeout;
        let deadline = Instant::now() + timeout;

        let mut buf = Vec::new();
        if let Some(mut stdout) = process.take_stdout() {
            tokio::select! {
                read = tokio::time::timeout_at(deadline, stdout.read_to_end(&mut buf)) => match read {
                    Ok(Ok(_)) => {}
                    Ok(Err(e)) => {
                        return Err(CoreError::Execution(format!("reading output failed: {e}")));
                    }
                    Err(_) => {
                        tracing::debug!(run_id = %run.run_id, "Output still open at exit timeout");
                    }
                },
                _ = cancel.cancelled() => return Err(CoreError::Cancelled),
            }
        }
        let output = String::from_utf8_lossy(&buf).into_owned();

        let remaining = deadline.saturating_duration_since(Instant::now());
        let exit_code = tokio::select! {
            exit = process.wait_for_exit(remaining) => {
                exit.map_err(|e| CoreError::Execution(format!("wait failed: {e}")))?
            }
            _ = cancel.cancelled() => return Err(CoreError::Cancelled),
        };

        match exit_code {
            Some(code) => {
                tracing::info!(run_id = %run.run_id, exit_code = code, "Process exited");
                run.enter(RunPhase::ProcessExited);
                run.emit(RunEvent::ProcessExited { exit_code: code });
            }
            None => {
                tracing::warn!(run_id = %run.run_id, timeout_ms = timeout.as_millis() as u64, "Process did not exit in time");
                run.emit(RunEvent::ProcessTimedOut {
                    timeout_ms: timeout.as_millis() as u64,
                });
            }
        }

        Ok(Execution { exit_code, output })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layers::DirectoryImageStore;
    use crate::storage::DirectorySandboxStorage;
    use std::collections::HashSet;
    use strata_host::LocalHost;

    fn orchestrator(root: &std::path::Path) -> Orchestrator {
        let config = RunConfig::builder()
            .sandbox_root(root.join("sandboxes"))
            .build()
            .unwrap();
        Orchestrator::new(
            config,
            Arc::new(DirectoryImageStore::new(root.join("images"))),
            Arc::new(DirectorySandboxStorage::new()),
            Arc::new(LocalHost::with_default_nat()),
        )
    }

    #[test]
    fn test_run_id_display() {
        let id = RunId::new();
        let s = format!("{}", id);
        // UUID format: xxxxxxxx-xxxx-xxxx-xxxx-xxxxxxxxxxxx
        assert_eq!(s.len(), 36);
        assert!(s.contains('-'));
    }

    #[test]
    fn test_run_id_from_uuid() {
        let uuid = Uuid::new_v4();
        let id: RunId = uuid.into();
        assert_eq!(id.as_uuid(), uuid);
    }

    #[test]
    fn test_sandbox_paths_are_distinct() {
        let orchestrator = orchestrator(std::path::Path::new("/tmp/strata-test"));
        let paths: HashSet<PathBuf> = (0..1000)
            .map(|_| orchestrator.sandbox_path(RunId::new()))
            .collect();
        assert_eq!(paths.len(), 1000);
        assert!(paths
            .iter()
            .all(|p| p.starts_with("/tmp/strata-test/sandboxes")));
    }

    #[test]
    fn test_phase_display() {
        assert_eq!(RunPhase::Init.to_string(), "Init");
        assert_eq!(
            RunPhase::ContainerShuttingDown.to_string(),
            "ContainerShuttingDown"
        );
        assert_eq!(RunPhase::Done.to_string(), "Done");
    }

    #[test]
    fn test_tracker_records_phases() {
        let mut tracker = RunTracker::new(RunId::new(), Arc::new(NullSink));
        assert_eq!(tracker.phase(), RunPhase::Init);
        tracker.enter(RunPhase::SandboxReady);
        assert!(tracker.reached(RunPhase::SandboxReady));
        assert!(!tracker.reached(RunPhase::ContainerCreated));
        assert_eq!(tracker.phase(), RunPhase::SandboxReady);
    }

    #[test]
    fn test_failed_destroy_skips_destroyed_phase() {
        let mut tracker = RunTracker::new(RunId::new(), Arc::new(NullSink));
        tracker.finish(&[TeardownFailure {
            step: STEP_DESTROY_SANDBOX,
            error: CoreError::Teardown("busy".into()),
        }]);
        assert!(!tracker.reached(RunPhase::SandboxDestroyed));
        assert_eq!(tracker.phase(), RunPhase::Done);

        let mut tracker = RunTracker::new(RunId::new(), Arc::new(NullSink));
        tracker.finish(&[TeardownFailure {
            step: STEP_SHUTDOWN_CONTAINER,
            error: CoreError::Teardown("stuck".into()),
        }]);
        assert!(tracker.reached(RunPhase::SandboxDestroyed));
    }

    #[tokio::test]
    async fn test_cancelled_before_start_allocates_nothing() {
        let root = tempfile::tempdir().unwrap();
        let orchestrator = orchestrator(root.path());
        let cancel = CancellationToken::new();
        cancel.cancel();

        let chain = LayerChain::from_paths([root.path().join("layer")]).unwrap();
        let result = orchestrator.run_chain(chain, "echo hi", &cancel).await;
        assert!(matches!(result, Err(CoreError::Cancelled)));
        assert!(!root.path().join("sandboxes").exists());
    }
}
