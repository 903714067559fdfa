//! Strata runner entry point.
//!
//! Runs one command in a fresh container built from an image's layer chain
//! and exits with the command's exit code. Logs go to stderr; stdout
//! carries only the guest's output.
//!
//! ```text
//! strata <image> <command...>
//! ```

mod config;

use config::{ConfigError, Invocation, StrataConfig};
use std::io::Write;
use std::process::ExitCode;
use std::sync::Arc;
use strata_core::{
    ChannelSink, CoreError, DirectoryImageStore, DirectorySandboxStorage, Orchestrator,
    RunRequest,
};
use strata_host::LocalHost;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Exit status when the guest was still running at the exit timeout.
const EXIT_TIMED_OUT: u8 = 124;

/// Exit status when the run was interrupted.
const EXIT_INTERRUPTED: u8 = 130;

/// Exit status for a bad invocation.
const EXIT_USAGE: u8 = 2;

/// What an interrupt does to the run.
#[derive(Debug, PartialEq, Eq)]
enum Interrupt {
    /// The run was cancelled; teardown proceeds.
    Cancelled,
    /// The run was already cancelled; give up on teardown.
    Exit,
}

fn on_interrupt(cancel: &CancellationToken) -> Interrupt {
    if cancel.is_cancelled() {
        return Interrupt::Exit;
    }
    cancel.cancel();
    Interrupt::Cancelled
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    // Initialize tracing - logs go to stderr (stdout is guest output)
    tracing_subscriber::registry()
        .with(EnvFilter::from_default_env().add_directive("strata=info".parse()?))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let invocation = match Invocation::parse(std::env::args().skip(1)) {
        Ok(invocation) => invocation,
        Err(ConfigError::Usage) => {
            eprintln!("{}", config::USAGE);
            return Ok(ExitCode::from(EXIT_USAGE));
        }
        Err(e) => return Err(e.into()),
    };

    let config = StrataConfig::from_env();
    tracing::debug!(?config, "Configuration loaded");
    config.validate_warn();

    // Events become log lines
    let (sink, mut events) = ChannelSink::new();
    let drain = tokio::spawn(async move {
        while let Some(record) = events.recv().await {
            tracing::info!(run_id = %record.run_id, "{}", record.event);
        }
    });

    let orchestrator = Orchestrator::new(
        config.run_config()?,
        Arc::new(DirectoryImageStore::new(&config.image_root)),
        Arc::new(DirectorySandboxStorage::new()),
        Arc::new(LocalHost::with_default_nat()),
    )
    .with_events(Arc::new(sink));

    // First Ctrl-C cancels the run and lets teardown complete; a second
    // one exits immediately
    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            while signal::ctrl_c().await.is_ok() {
                match on_interrupt(&cancel) {
                    Interrupt::Cancelled => tracing::info!("Received interrupt, cancelling run"),
                    Interrupt::Exit => {
                        tracing::warn!("Second interrupt, exiting without teardown");
                        std::process::exit(i32::from(EXIT_INTERRUPTED));
                    }
                }
            }
        });
    }

    let request = RunRequest::new(invocation.image, invocation.command_line);
    let result = orchestrator.run(&request, &cancel).await;

    // Dropping the orchestrator closes the event channel
    drop(orchestrator);
    if let Err(e) = drain.await {
        tracing::warn!(error = %e, "Event drain task failed");
    }

    let report = match result {
        Ok(report) => report,
        Err(CoreError::Cancelled) => {
            tracing::warn!("Run cancelled");
            return Ok(ExitCode::from(EXIT_INTERRUPTED));
        }
        Err(e) => return Err(e.into()),
    };

    let mut stdout = std::io::stdout().lock();
    stdout.write_all(report.output.as_bytes())?;
    stdout.flush()?;

    Ok(match report.exit_code {
        // Exit statuses are truncated to a byte, as a shell would
        Some(code) => ExitCode::from(code as u8),
        None => ExitCode::from(EXIT_TIMED_OUT),
    })
}
