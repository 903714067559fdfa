//! # strata-host
//!
//! Compute host abstraction for strata containers.
//!
//! The orchestration layer talks to the host only through the
//! [`ComputeHost`], [`Container`] and [`GuestProcess`] traits. This crate
//! also ships [`LocalHost`], a process-backed implementation that runs guest
//! commands on the local machine inside a sandbox directory.
//!
//! ## Quick Start
//!
//! ```no_run
//! use strata_host::{ComputeHost, ContainerBuilder, LocalHost, NetworkMode, ProcessStartInfo};
//! use std::time::Duration;
//!
//! # async fn example() -> strata_host::Result<()> {
//! let host = LocalHost::with_default_nat();
//! let network = host.find_network(NetworkMode::Nat).await?;
//!
//! let mut container = ContainerBuilder::new()
//!     .sandbox("/tmp/strata/sandboxes/demo")
//!     .layer("/var/lib/strata/layers/base")
//!     .network(network)
//!     .build(&host, "demo")
//!     .await?;
//!
//! container.start().await?;
//! let mut process = container
//!     .create_process(ProcessStartInfo::redirected("echo hi"))
//!     .await?;
//! let exit_code = process.wait_for_exit(Duration::from_secs(5)).await?;
//!
//! // Cleanup
//! drop(process);
//! container.shutdown(None).await?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Features
//!
//! - **Lifecycle Management**: Create, start and shut down containers
//! - **Network Lookup**: Find a virtual switch by network mode
//! - **Guest Processes**: Launch commands with redirected stdout and bounded waits
//! - **Kill on Close**: Dropped handles terminate what they own
//! - **Builder Pattern**: Ergonomic configuration with `ContainerBuilder`

mod builder;
mod config;
mod container;
mod error;
mod local;

pub use builder::ContainerBuilder;
pub use config::{
    ContainerSettings, LayerRef, NetworkId, NetworkMode, ProcessStartInfo, VirtualSwitch,
    ROOTFS_DIR,
};
pub use container::{ComputeHost, Container, ContainerState, GuestProcess, OutputStream};
pub use error::{HostError, Result};
pub use local::{LocalContainer, LocalHost, LocalProcess};
