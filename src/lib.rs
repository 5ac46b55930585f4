//! # bulkfetch
//!
//! Resumable bulk downloader that routes every transfer through a
//! health-checked, rotating pool of proxies.
//!
//! ## Design Philosophy
//!
//! bulkfetch is designed to be:
//! - **Resumable** - Completed items are recorded durably and never fetched twice
//! - **Proxy-aware** - Proxies are probed, ranked by throughput and retired when they fail
//! - **Library-first** - No CLI or UI; the downloader and storage are pluggable traits
//! - **Event-driven** - Consumers subscribe to events, no polling required
//!
//! ## Quick Start
//!
//! ```no_run
//! use bulkfetch::{Config, DownloadOrchestrator, ItemId, run_with_shutdown};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let mut config = Config::from_env()?;
//!     config.proxy.list_url = Some("https://example.com/proxies.txt".to_string());
//!     config.probe.reference_item = Some("dQw4w9WgXcQ".to_string());
//!
//!     let orchestrator = DownloadOrchestrator::from_config(config).await?;
//!
//!     // Subscribe to events
//!     let mut events = orchestrator.subscribe();
//!     tokio::spawn(async move {
//!         while let Ok(event) = events.recv().await {
//!             println!("Event: {:?}", event);
//!         }
//!     });
//!
//!     let ids = vec![ItemId::new("jNQXAC9IVRw")?];
//!     let summary = run_with_shutdown(&orchestrator, &ids).await?;
//!     std::process::exit(summary.exit_code());
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::unwrap_used)]
#![warn(clippy::expect_used)]

/// Configuration types
pub mod config;
/// Database persistence layer
pub mod db;
/// Error types
pub mod error;
/// Downloader trait and the external-tool implementation
pub mod fetch;
/// ID list input
pub mod input;
/// Download orchestration (worker pool, task state machine, circuit breaker)
pub mod orchestrator;
/// Proxy pool, health probes and supervision
pub mod proxy;
/// Retry logic with exponential backoff
pub mod retry;
/// Storage sinks for finished artifacts
pub mod sink;
/// Resumable state store
pub mod state;
/// Core types and events
pub mod types;

// Re-export commonly used types
pub use config::Config;
pub use db::Database;
pub use error::{DatabaseError, Error, FailureClass, FetchError, Result, SinkError};
pub use fetch::{Artifact, CliDownloader, Downloader, ItemMetadata};
pub use input::{IdList, IdListFormat, parse_id_list, read_id_list};
pub use orchestrator::{CircuitBreaker, DownloadOrchestrator};
pub use proxy::{
    HealthProbe, HealthState, ProxyEndpoint, ProxyListSource, ProxySupervisor, ReleaseOutcome,
};
pub use sink::{LocalDirSink, NoOpSink, StorageSink};
pub use state::{RecoveryReport, ResumableStateStore};
pub use types::{
    DownloadTask, Event, FormatConstraints, ItemId, MediaSelection, RecordStatus, Resolution,
    RunSummary, TaskState,
};

/// Run the full download lifecycle with graceful signal handling.
///
/// A termination signal cancels the run: no new tasks start, waits are
/// abandoned, and interrupted items are returned to pending so the next run
/// picks them up. The orchestrator is shut down either way.
///
/// - **Unix:** listens for SIGTERM and SIGINT, with fallbacks if signal registration fails.
/// - **Windows/other:** listens for Ctrl+C via `tokio::signal::ctrl_c()`.
///
/// # Example
///
/// ```no_run
/// use bulkfetch::{Config, DownloadOrchestrator, ItemId, run_with_shutdown};
///
/// # async fn example(ids: Vec<ItemId>) -> Result<(), Box<dyn std::error::Error>> {
/// let orchestrator = DownloadOrchestrator::from_config(Config::from_env()?).await?;
///
/// // Run with automatic signal handling
/// let summary = run_with_shutdown(&orchestrator, &ids).await?;
/// println!("{} completed, {} failed", summary.completed, summary.failed);
/// # Ok(())
/// # }
/// ```
pub async fn run_with_shutdown(
    orchestrator: &DownloadOrchestrator,
    ids: &[ItemId],
) -> Result<RunSummary> {
    let cancel = tokio_util::sync::CancellationToken::new();
    let watcher = {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = wait_for_signal() => {
                    tracing::info!("Cancelling run, in-flight downloads will finish");
                    cancel.cancel();
                }
                _ = cancel.cancelled() => {}
            }
        })
    };

    let result = orchestrator.run_to_completion(ids, cancel.clone()).await;

    // stops the watcher when the run ended on its own
    cancel.cancel();
    watcher.await.ok();
    result
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{SignalKind, signal};

    // Set up signal handlers - these may fail in restricted environments (containers, tests)
    let sigterm_result = signal(SignalKind::terminate());
    let sigint_result = signal(SignalKind::interrupt());

    match (sigterm_result, sigint_result) {
        (Ok(mut sigterm), Ok(mut sigint)) => {
            tokio::select! {
                _ = sigterm.recv() => {
                    tracing::info!("Received SIGTERM signal");
                }
                _ = sigint.recv() => {
                    tracing::info!("Received SIGINT signal (Ctrl+C)");
                }
            }
        }
        (Err(e), _) => {
            tracing::warn!(error = %e, "Could not register SIGTERM handler, waiting for SIGINT only");
            if let Ok(mut sigint) = signal(SignalKind::interrupt()) {
                sigint.recv().await;
                tracing::info!("Received SIGINT signal (Ctrl+C)");
            } else {
                tracing::error!("Could not register any signal handlers, using ctrl_c fallback");
                tokio::signal::ctrl_c().await.ok();
            }
        }
        (_, Err(e)) => {
            tracing::warn!(error = %e, "Could not register SIGINT handler, waiting for SIGTERM only");
            if let Ok(mut sigterm) = signal(SignalKind::terminate()) {
                sigterm.recv().await;
                tracing::info!("Received SIGTERM signal");
            } else {
                tracing::error!("Could not register any signal handlers, using ctrl_c fallback");
                tokio::signal::ctrl_c().await.ok();
            }
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => {
            tracing::info!("Received Ctrl+C signal");
        }
        Err(e) => {
            tracing::error!(error = %e, "Failed to listen for Ctrl+C signal");
        }
    }
}
