//! # strata-core
//!
//! Provision a container from a chain of immutable filesystem layers, run
//! one command in it, capture its output, and tear everything down again,
//! even when a step fails partway through.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                   strata-core (host)                     │
//! ├──────────────────────────────────────────────────────────┤
//! │                                                          │
//! │  ┌─────────────────┐     ┌──────────────────────────┐    │
//! │  │  Orchestrator   │────▶│  UnwindStack             │    │
//! │  │   - run()       │     │   (cleanup, LIFO)        │    │
//! │  │   - run_chain() │     └──────────────────────────┘    │
//! │  └─────────────────┘                                     │
//! │      │      │      │                                     │
//! │      ▼      │      ▼                                     │
//! │  ┌────────┐ │  ┌────────────────┐                        │
//! │  │ Layer  │ │  │ SandboxStorage │  layerchain.json       │
//! │  │Resolver│ │  │ create/destroy │  upper/ rootfs/        │
//! │  └────────┘ │  └────────────────┘                        │
//! │             ▼                                            │
//! │  ┌─────────────────┐     ┌──────────────────────────┐    │
//! │  │ NetworkLocator  │────▶│  ComputeHost             │    │
//! │  └─────────────────┘     │   (from strata-host)     │    │
//! │                          └──────────────────────────┘    │
//! └──────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```ignore
//! use std::sync::Arc;
//! use strata_core::{
//!     DirectoryImageStore, DirectorySandboxStorage, Orchestrator, RunConfig, RunRequest,
//!     TracingSink,
//! };
//! use strata_host::LocalHost;
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn example() -> strata_core::Result<()> {
//! let orchestrator = Orchestrator::new(
//!     RunConfig::builder().sandbox_root("/tmp/strata/sandboxes").build()?,
//!     Arc::new(DirectoryImageStore::new("/var/lib/strata/images")),
//!     Arc::new(DirectorySandboxStorage::new()),
//!     Arc::new(LocalHost::with_default_nat()),
//! )
//! .with_events(Arc::new(TracingSink));
//!
//! let report = orchestrator
//!     .run(&RunRequest::new("runtime:4.8", "echo hi"), &CancellationToken::new())
//!     .await?;
//! println!("exit code {:?}: {}", report.exit_code, report.output);
//! # Ok(())
//! # }
//! ```
//!
//! ## Features
//!
//! - **Layer Resolution**: Strict `layerchain.json` parsing into a non-empty chain
//! - **Sandboxes**: Per-run writable filesystems, atomic to create, idempotent to destroy
//! - **Network Lookup**: Attach to a pre-existing virtual switch by mode
//! - **Guaranteed Teardown**: Explicit unwind stack, first error wins
//! - **Bounded Waits**: A guest that never exits cannot hang a run
//! - **Cancellation**: Honored without ever skipping teardown
//! - **Events**: Lifecycle events to an injected sink

mod config;
mod error;
mod events;
mod layers;
mod network;
mod orchestrator;
mod storage;
mod unwind;

pub use config::{LayerSelection, RunConfig, RunConfigBuilder, DEFAULT_EXIT_TIMEOUT};
pub use error::{CoreError, Result};
pub use events::{
    ChannelSink, EventRecord, EventSink, MemorySink, NullSink, RunEvent, TracingSink,
};
pub use layers::{
    parse_layer_chain, sanitize_image_name, DirectoryImageStore, ImageInfo, ImageInspector,
    LayerChain, LayerResolver, LAYER_CHAIN_FILE,
};
pub use network::NetworkLocator;
pub use orchestrator::{Orchestrator, RunId, RunPhase, RunReport, RunRequest};
pub use storage::{DirectorySandboxStorage, Sandbox, SandboxStorage, UPPER_DIR};
pub use strata_host::LayerRef;
pub use unwind::{TeardownFailure, UnwindStack};
