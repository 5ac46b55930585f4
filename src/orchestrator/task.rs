//! Per-task state machine
//!
//! `Pending → AcquiringProxy → Downloading → {Succeeded | Retrying → AcquiringProxy | Failed}`
//!
//! A task owns one item from the moment a worker pops it until it is marked
//! complete, failed, or (when the run is cancelled or the breaker trips)
//! pending again. Attempts
//! are strictly sequential; every lease taken is released before the next
//! suspension point.

use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::error::{FailureClass, FetchError};
use crate::fetch::Downloader;
use crate::proxy::{ProxyEndpoint, ProxySupervisor, ReleaseOutcome};
use crate::retry::Backoff;
use crate::sink::StorageSink;
use crate::state::ResumableStateStore;
use crate::types::{AttemptOutcome, DownloadAttempt, DownloadTask, Event, ItemId, TaskState};

/// Growth factor of the wait for a free proxy
const ACQUIRE_BACKOFF_MULTIPLIER: f64 = 2.0;

/// Everything a task needs, shared by all workers of a run
#[derive(Clone)]
pub(crate) struct TaskContext {
    pub(crate) config: Arc<Config>,
    pub(crate) supervisor: Arc<ProxySupervisor>,
    pub(crate) store: Arc<ResumableStateStore>,
    pub(crate) downloader: Arc<dyn Downloader>,
    pub(crate) sink: Arc<dyn StorageSink>,
    pub(crate) event_tx: broadcast::Sender<Event>,
    /// Fires when the run is cancelled or the circuit breaker trips
    pub(crate) stop: CancellationToken,
}

/// How a task ended
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) enum TaskOutcome {
    /// Stored and marked complete
    Succeeded {
        /// Attempts used
        attempts: u32,
    },
    /// Marked failed for this run
    Failed {
        /// Attempts used
        attempts: u32,
        /// Last error
        error: String,
    },
    /// Stopped before reaching a terminal state; reset to pending
    Interrupted,
}

impl TaskContext {
    fn emit(&self, event: Event) {
        // no subscribers is fine
        self.event_tx.send(event).ok();
    }

    fn emit_state(&self, item: &ItemId, state: TaskState) {
        self.emit(Event::TaskState {
            item: item.clone(),
            state,
        });
    }

    /// Build the task for `item`, rooted in the scratch directory
    pub(crate) fn task_for(&self, item: ItemId) -> DownloadTask {
        DownloadTask {
            target_dir: self.config.downloads_dir().join(item.as_str()),
            constraints: self.config.download.constraints.clone(),
            item,
        }
    }
}

/// Drive one task to a terminal state and persist it
pub(crate) async fn run_task(ctx: &TaskContext, task: DownloadTask) -> TaskOutcome {
    let item = task.item.clone();

    if let Err(e) = ctx.store.mark_in_progress(&item).await {
        tracing::error!(item = %item, error = %e, "Failed to mark item in progress");
        let error = format!("state store unavailable: {}", e);
        ctx.emit(Event::TaskFailed {
            item,
            attempts: 0,
            error: error.clone(),
        });
        return TaskOutcome::Failed { attempts: 0, error };
    }

    let outcome = attempt_loop(ctx, &task).await;

    match &outcome {
        TaskOutcome::Succeeded { attempts } => {
            tracing::info!(item = %item, attempts, "Item complete");
            ctx.emit_state(&item, TaskState::Succeeded);
            ctx.emit(Event::TaskCompleted {
                item,
                attempts: *attempts,
            });
        }
        TaskOutcome::Failed { attempts, error } => {
            tracing::warn!(item = %item, attempts, error = %error, "Item failed");
            if let Err(e) = ctx.store.mark_failed(&item, *attempts, error).await {
                tracing::error!(item = %item, error = %e, "Failed to record item failure");
            }
            remove_scratch(&task.target_dir).await;
            ctx.emit_state(&item, TaskState::Failed);
            ctx.emit(Event::TaskFailed {
                item,
                attempts: *attempts,
                error: error.clone(),
            });
        }
        TaskOutcome::Interrupted => {
            tracing::info!(item = %item, "Item interrupted, returning to pending");
            if let Err(e) = ctx.store.mark_pending(&item).await {
                tracing::error!(item = %item, error = %e, "Failed to reset interrupted item");
            }
            remove_scratch(&task.target_dir).await;
            ctx.emit_state(&item, TaskState::Pending);
        }
    }

    outcome
}

async fn attempt_loop(ctx: &TaskContext, task: &DownloadTask) -> TaskOutcome {
    let item = &task.item;
    let max_attempts = ctx.config.retry.max_attempts.saturating_add(1);
    let mut retry_backoff = Backoff::from_retry_config(&ctx.config.retry);
    // every proxy that failed this task; none of them is leased to it again
    let mut failed_proxies: HashSet<ProxyEndpoint> = HashSet::new();

    for attempt in 1..=max_attempts {
        if let Err(e) = prepare_scratch(&task.target_dir).await {
            return TaskOutcome::Failed {
                attempts: attempt - 1,
                error: format!("cannot prepare {}: {}", task.target_dir.display(), e),
            };
        }

        ctx.emit_state(item, TaskState::AcquiringProxy);
        let record = match acquire_proxy(ctx, item, &failed_proxies).await {
            Acquired::Leased(proxy) => {
                ctx.emit_state(item, TaskState::Downloading);
                run_attempt(ctx, task, attempt, proxy, &mut failed_proxies).await
            }
            Acquired::Unavailable {
                waited,
                class,
                reason,
            } => DownloadAttempt {
                attempt,
                proxy: None,
                outcome: AttemptOutcome::Failed {
                    class,
                    error: format!("{} after waiting {:?}", reason, waited),
                },
                elapsed: waited,
            },
            Acquired::Stopped => return TaskOutcome::Interrupted,
        };

        let (class, error) = match record.outcome {
            AttemptOutcome::Success => return TaskOutcome::Succeeded { attempts: attempt },
            AttemptOutcome::Failed { class, error } => (class, error),
        };

        let stopped = ctx.stop.is_cancelled();
        let will_retry = class.is_transient() && attempt < max_attempts && !stopped;
        let proxy = record.proxy.as_ref().map(ToString::to_string);
        tracing::warn!(
            item = %item,
            attempt,
            proxy = proxy.as_deref().unwrap_or("none"),
            elapsed_ms = record.elapsed.as_millis() as u64,
            class = ?class,
            error = %error,
            will_retry,
            "Attempt failed"
        );
        ctx.emit(Event::AttemptFailed {
            item: item.clone(),
            attempt,
            proxy,
            error: error.clone(),
            will_retry,
        });

        if !will_retry {
            if class.is_transient() && stopped {
                return TaskOutcome::Interrupted;
            }
            return TaskOutcome::Failed {
                attempts: attempt,
                error,
            };
        }

        ctx.emit_state(item, TaskState::Retrying);
        let delay = retry_backoff.next_delay();
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = ctx.stop.cancelled() => return TaskOutcome::Interrupted,
        }
    }

    // the loop always returns on its last iteration
    TaskOutcome::Failed {
        attempts: max_attempts,
        error: "retries exhausted".to_string(),
    }
}

/// Result of waiting for a lease
enum Acquired {
    Leased(ProxyEndpoint),
    /// Nothing qualified within `proxy.acquire_max_wait`
    Unavailable {
        waited: Duration,
        class: FailureClass,
        reason: String,
    },
    /// The run was cancelled or the breaker tripped
    Stopped,
}

/// Wait, bounded by `proxy.acquire_max_wait`, until a proxy outside `exclude` can be leased
async fn acquire_proxy(
    ctx: &TaskContext,
    item: &ItemId,
    exclude: &HashSet<ProxyEndpoint>,
) -> Acquired {
    let max_wait = ctx.config.proxy.acquire_max_wait;
    let mut backoff = Backoff::new(
        ctx.config.proxy.acquire_initial_backoff,
        ctx.config.proxy.acquire_max_backoff,
        ACQUIRE_BACKOFF_MULTIPLIER,
        true,
    );
    let started = Instant::now();
    let mut waiting = false;

    loop {
        if ctx.stop.is_cancelled() {
            return Acquired::Stopped;
        }
        let err = match ctx.supervisor.acquire(exclude).await {
            Ok(proxy) => {
                if waiting {
                    tracing::debug!(item = %item, proxy = %proxy, waited_ms = started.elapsed().as_millis() as u64, "Proxy acquired after waiting");
                }
                return Acquired::Leased(proxy);
            }
            Err(e) => e,
        };

        let class = err.class();
        let waited = started.elapsed();
        if !class.is_transient() || waited >= max_wait {
            return Acquired::Unavailable {
                waited,
                class,
                reason: err.to_string(),
            };
        }
        if !waiting {
            tracing::info!(item = %item, excluded = exclude.len(), reason = %err, "Waiting for a usable proxy");
            waiting = true;
        }

        let delay = backoff.next_delay().min(max_wait.saturating_sub(waited));
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = ctx.stop.cancelled() => return Acquired::Stopped,
        }
    }
}

/// One fetch-and-store try through `proxy`; the lease is released before returning
///
/// A proxy blamed for the failure is added to `failed_proxies`.
async fn run_attempt(
    ctx: &TaskContext,
    task: &DownloadTask,
    attempt: u32,
    proxy: ProxyEndpoint,
    failed_proxies: &mut HashSet<ProxyEndpoint>,
) -> DownloadAttempt {
    let timeout = ctx.config.download.attempt_timeout;
    let started = Instant::now();

    tracing::debug!(item = %task.item, attempt, proxy = %proxy, "Fetching");
    let fetched = match tokio::time::timeout(
        timeout,
        ctx.downloader
            .fetch(&task.item, &proxy, &task.constraints, &task.target_dir),
    )
    .await
    {
        Ok(result) => result,
        Err(_) => Err(FetchError::Timeout(timeout)),
    };
    let elapsed = started.elapsed();

    let release = match &fetched {
        Ok(artifact) => ReleaseOutcome::Success {
            bytes: artifact.bytes,
            elapsed,
        },
        Err(e) if e.blames_proxy() => {
            failed_proxies.insert(proxy.clone());
            ReleaseOutcome::Failure
        }
        Err(_) => ReleaseOutcome::Neutral,
    };
    ctx.supervisor.release(&proxy, release).await;

    let outcome = match fetched {
        Err(e) => failed(e.class(), &e),
        Ok(artifact) => {
            match ctx.sink.store(&task.item, &artifact, &artifact.metadata).await {
                Ok(()) => match ctx.store.mark_complete(&task.item, attempt).await {
                    Ok(()) => AttemptOutcome::Success,
                    // storing again would not fix the record
                    Err(e) => failed(
                        FailureClass::PermanentItem,
                        &format!("stored but not recorded: {}", e),
                    ),
                },
                Err(e) => failed(e.class(), &e),
            }
        }
    };

    DownloadAttempt {
        attempt,
        proxy: Some(proxy),
        outcome,
        elapsed,
    }
}

fn failed(class: FailureClass, error: &impl std::fmt::Display) -> AttemptOutcome {
    AttemptOutcome::Failed {
        class,
        error: error.to_string(),
    }
}

/// Start every attempt from an empty scratch directory
async fn prepare_scratch(dir: &Path) -> std::io::Result<()> {
    match tokio::fs::remove_dir_all(dir).await {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(e),
    }
    tokio::fs::create_dir_all(dir).await
}

async fn remove_scratch(dir: &Path) {
    if let Err(e) = tokio::fs::remove_dir_all(dir).await
        && e.kind() != std::io::ErrorKind::NotFound
    {
        tracing::warn!(dir = %dir.display(), error = %e, "Failed to remove scratch directory");
    }
}
