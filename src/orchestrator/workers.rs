//! Worker pool: N workers pulling item IDs from one shared queue.

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use super::DownloadOrchestrator;
use super::breaker::CircuitBreaker;
use super::task::{TaskContext, TaskOutcome, run_task};
use crate::error::{Error, Result};
use crate::types::{Event, ItemId, RunSummary};

/// Interval between progress log lines
const PROGRESS_LOG_INTERVAL: Duration = Duration::from_secs(30);

/// Counters shared by the workers of one run
#[derive(Default)]
struct RunCounters {
    completed: AtomicUsize,
    failed: AtomicUsize,
    interrupted: AtomicUsize,
}

impl DownloadOrchestrator {
    /// Download every ID in `ids` that is not already complete
    ///
    /// Duplicates are ignored. At most `max_concurrent` tasks run at once.
    /// The run ends when the queue is drained, when the circuit breaker trips
    /// or when `cancel` fires. Either stop abandons proxy waits and retry
    /// delays and returns those items to pending; transfers already running
    /// finish or hit their timeout.
    ///
    /// A tripped breaker is reported through [`RunSummary::breaker_tripped`],
    /// not as an error.
    ///
    /// # Errors
    ///
    /// [`Error::ShuttingDown`] when `cancel` has already fired, or a state
    /// store error when the records cannot be read at start.
    pub async fn run(&self, ids: &[ItemId], cancel: CancellationToken) -> Result<RunSummary> {
        if cancel.is_cancelled() {
            return Err(Error::ShuttingDown);
        }

        let mut seen = HashSet::with_capacity(ids.len());
        let unique: Vec<ItemId> = ids
            .iter()
            .filter(|id| seen.insert((*id).clone()))
            .cloned()
            .collect();

        let split = self.store.pending_of(&unique).await?;
        let total = unique.len();
        let scheduled = split.pending.len();

        tracing::info!(
            total,
            already_complete = split.already_complete,
            scheduled,
            workers = self.config.download.max_concurrent,
            "Starting run"
        );
        self.event_tx
            .send(Event::RunStarted {
                total,
                already_complete: split.already_complete,
                scheduled,
            })
            .ok();

        let queue = Arc::new(Mutex::new(VecDeque::from(split.pending)));
        let breaker = Arc::new(CircuitBreaker::new(
            self.config.circuit_breaker.error_threshold,
        ));
        let counters = Arc::new(RunCounters::default());
        let ctx = TaskContext {
            config: Arc::clone(&self.config),
            supervisor: Arc::clone(&self.supervisor),
            store: Arc::clone(&self.store),
            downloader: Arc::clone(&self.downloader),
            sink: Arc::clone(&self.sink),
            event_tx: self.event_tx.clone(),
            stop: cancel.child_token(),
        };

        let progress_stop = CancellationToken::new();
        let progress = self.spawn_progress_logger(
            total,
            split.already_complete,
            Arc::clone(&counters),
            Arc::clone(&queue),
            progress_stop.clone(),
        );

        let workers = self.config.download.max_concurrent.max(1).min(scheduled.max(1));
        let handles: Vec<_> = (0..workers)
            .map(|worker| {
                let ctx = ctx.clone();
                let queue = Arc::clone(&queue);
                let breaker = Arc::clone(&breaker);
                let counters = Arc::clone(&counters);
                tokio::spawn(async move {
                    run_worker(worker, ctx, queue, breaker, counters).await;
                })
            })
            .collect();

        for result in futures::future::join_all(handles).await {
            if let Err(e) = result {
                tracing::error!(error = %e, "Worker task panicked");
            }
        }
        progress_stop.cancel();
        progress.await.ok();

        let remaining = queue.lock().await.len();
        let summary = RunSummary {
            total,
            already_complete: split.already_complete,
            completed: counters.completed.load(Ordering::SeqCst),
            failed: counters.failed.load(Ordering::SeqCst),
            pending: remaining + counters.interrupted.load(Ordering::SeqCst),
            breaker_tripped: breaker.is_open(),
            cancelled: cancel.is_cancelled(),
        };

        if summary.breaker_tripped {
            let err = Error::CircuitOpen {
                consecutive_failures: breaker.consecutive_failures(),
                threshold: breaker.threshold(),
            };
            tracing::error!(
                error = %err,
                completed = summary.completed,
                failed = summary.failed,
                pending = summary.pending,
                "Run stopped by circuit breaker"
            );
        } else {
            tracing::info!(
                completed = summary.completed,
                failed = summary.failed,
                pending = summary.pending,
                cancelled = summary.cancelled,
                "Run finished"
            );
        }
        self.event_tx.send(Event::RunFinished { summary }).ok();

        Ok(summary)
    }

    fn spawn_progress_logger(
        &self,
        total: usize,
        already_complete: usize,
        counters: Arc<RunCounters>,
        queue: Arc<Mutex<VecDeque<ItemId>>>,
        stop: CancellationToken,
    ) -> tokio::task::JoinHandle<()> {
        let supervisor = Arc::clone(&self.supervisor);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(PROGRESS_LOG_INTERVAL);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            interval.tick().await;

            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        let completed = counters.completed.load(Ordering::SeqCst);
                        let failed = counters.failed.load(Ordering::SeqCst);
                        let queued = queue.lock().await.len();
                        let pool = supervisor.stats().await;
                        tracing::info!(
                            done = already_complete + completed,
                            total,
                            failed,
                            queued,
                            proxies_available = pool.available,
                            proxies_in_use = pool.in_use,
                            "Progress"
                        );
                    }
                    _ = stop.cancelled() => break,
                }
            }
        })
    }
}

async fn run_worker(
    worker: usize,
    ctx: TaskContext,
    queue: Arc<Mutex<VecDeque<ItemId>>>,
    breaker: Arc<CircuitBreaker>,
    counters: Arc<RunCounters>,
) {
    loop {
        if ctx.stop.is_cancelled() || breaker.is_open() {
            break;
        }
        let next = queue.lock().await.pop_front();
        let Some(item) = next else {
            break;
        };

        match run_task(&ctx, ctx.task_for(item)).await {
            TaskOutcome::Succeeded { .. } => {
                counters.completed.fetch_add(1, Ordering::SeqCst);
                breaker.record_success();
            }
            TaskOutcome::Failed { .. } => {
                counters.failed.fetch_add(1, Ordering::SeqCst);
                if breaker.record_failure() {
                    let consecutive_failures = breaker.consecutive_failures();
                    tracing::error!(
                        consecutive_failures,
                        threshold = breaker.threshold(),
                        "Circuit breaker tripped, no new tasks will start"
                    );
                    ctx.stop.cancel();
                    ctx.event_tx
                        .send(Event::BreakerTripped {
                            consecutive_failures,
                        })
                        .ok();
                }
            }
            TaskOutcome::Interrupted => {
                counters.interrupted.fetch_add(1, Ordering::SeqCst);
            }
        }
    }
    tracing::debug!(worker, "Worker stopped");
}
