//! Lifecycle events emitted during a run.
//!
//! The orchestrator never writes to a console. It reports progress to an
//! injected [`EventSink`] instead.

use crate::orchestrator::RunId;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};
use strata_host::NetworkId;
use tokio::sync::mpsc;

/// Something that happened during a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum RunEvent {
    SandboxCreated { path: PathBuf },
    ContainerCreated {
        container_id: String,
        network_id: NetworkId,
    },
    ContainerStarted,
    ProcessLaunched { command_line: String },
    ProcessExited { exit_code: i32 },
    ProcessTimedOut { timeout_ms: u64 },
    ContainerShutDown,
    SandboxDestroyed,
    /// Final event of every run, emitted after all teardown has run.
    TornDown { succeeded: bool },
}

impl fmt::Display for RunEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SandboxCreated { path } => write!(f, "Sandbox created at {}", path.display()),
            Self::ContainerCreated { container_id, .. } => {
                write!(f, "Created container {container_id}")
            }
            Self::ContainerStarted => write!(f, "Container started"),
            Self::ProcessLaunched { command_line } => write!(f, "Running {command_line}"),
            Self::ProcessExited { exit_code } => write!(f, "Process exited with {exit_code}."),
            Self::ProcessTimedOut { timeout_ms } => {
                write!(f, "Process still running after {timeout_ms} ms")
            }
            Self::ContainerShutDown => write!(f, "Container shut down"),
            Self::SandboxDestroyed => write!(f, "Sandbox destroyed"),
            Self::TornDown { .. } => write!(f, "Container stopped."),
        }
    }
}

/// A [`RunEvent`] stamped with its run and time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EventRecord {
    pub run_id: RunId,
    pub at: DateTime<Utc>,
    #[serde(flatten)]
    pub event: RunEvent,
}

impl EventRecord {
    /// Stamp `event` with the current time.
    pub fn now(run_id: RunId, event: RunEvent) -> Self {
        Self {
            run_id,
            at: Utc::now(),
            event,
        }
    }
}

/// Receiver of run events. Must not block.
pub trait EventSink: Send + Sync {
    fn emit(&self, record: EventRecord);
}

/// Discards every event.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullSink;

impl EventSink for NullSink {
    fn emit(&self, _record: EventRecord) {}
}

/// Logs events through `tracing`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingSink;

impl EventSink for TracingSink {
    fn emit(&self, record: EventRecord) {
        tracing::info!(run_id = %record.run_id, event = ?record.event, "{}", record.event);
    }
}

/// Forwards events into a tokio channel.
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<EventRecord>,
}

impl ChannelSink {
    /// Create a sink and the receiver it feeds.
    pub fn new() -> (Self, mpsc::UnboundedReceiver<EventRecord>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl EventSink for ChannelSink {
    fn emit(&self, record: EventRecord) {
        if self.tx.send(record).is_err() {
            tracing::trace!("Event receiver dropped");
        }
    }
}

/// Keeps every event in memory.
#[derive(Debug, Clone, Default)]
pub struct MemorySink {
    records: Arc<Mutex<Vec<EventRecord>>>,
}

impl MemorySink {
    /// Create an empty sink.
    pub fn new() -> Self {
        Self::default()
    }

    /// Events recorded so far, oldest first.
    pub fn events(&self) -> Vec<RunEvent> {
        self.records()
            .into_iter()
            .map(|record| record.event)
            .collect()
    }

    /// Full records, oldest first.
    pub fn records(&self) -> Vec<EventRecord> {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl EventSink for MemorySink {
    fn emit(&self, record: EventRecord) {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(record);
    }
}
