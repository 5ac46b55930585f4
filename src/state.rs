//! Resumable state store
//!
//! Durable per-item status backed by the SQLite [`Database`]. Every mutation
//! is sent to one writer task over a channel and acknowledged only after the
//! write has committed, so two workers can never interleave updates and a
//! caller that saw `Ok(())` knows the status is on disk. Reads go straight to
//! the connection pool.

use chrono::{DateTime, TimeZone, Utc};
use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::{Mutex, mpsc, oneshot};

use crate::db::{Database, ItemRow, StatusCounts};
use crate::error::DatabaseError;
use crate::types::{ItemId, RecordStatus};
use crate::{Error, Result};

/// Buffer size of the writer channel
const WRITER_CHANNEL_BUFFER: usize = 256;

/// Durable record of one item
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ResumableRecord {
    /// Item
    pub item: ItemId,
    /// Current status
    pub status: RecordStatus,
    /// Attempts made across all runs
    pub attempts: u32,
    /// Time of the last change
    pub updated_at: DateTime<Utc>,
    /// Last error summary
    pub error: Option<String>,
}

impl TryFrom<ItemRow> for ResumableRecord {
    type Error = Error;

    fn try_from(row: ItemRow) -> Result<Self> {
        Ok(Self {
            item: ItemId::new(row.item_id)?,
            status: RecordStatus::from_i32(row.status),
            attempts: u32::try_from(row.attempts.max(0)).unwrap_or(u32::MAX),
            updated_at: Utc
                .timestamp_opt(row.updated_at, 0)
                .single()
                .unwrap_or_else(Utc::now),
            error: row.last_error,
        })
    }
}

/// What startup recovery found
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    /// The previous run did not shut down cleanly
    pub unclean_shutdown: bool,
    /// In-progress records reset to pending
    pub reset: u64,
}

/// Result of filtering an input list against the store
#[derive(Clone, Debug, Default)]
pub struct PendingSplit {
    /// IDs still to download, in input order
    pub pending: Vec<ItemId>,
    /// IDs skipped because they are complete
    pub already_complete: usize,
}

enum WriteCommand {
    SetStatus {
        item: ItemId,
        status: RecordStatus,
        attempts: u32,
        error: Option<String>,
        ack: oneshot::Sender<Result<()>>,
    },
    ResetToPending {
        item: ItemId,
        ack: oneshot::Sender<Result<()>>,
    },
    Recover {
        ack: oneshot::Sender<Result<RecoveryReport>>,
    },
    MarkCleanShutdown {
        ack: oneshot::Sender<Result<()>>,
    },
}

/// Single-writer store of item status
pub struct ResumableStateStore {
    db: Arc<Database>,
    tx: mpsc::Sender<WriteCommand>,
    writer: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl ResumableStateStore {
    /// Open (or create) the database at `path` and start the writer task
    pub async fn open(path: &Path) -> Result<Self> {
        let db = Database::new(path).await?;
        Ok(Self::with_database(Arc::new(db)))
    }

    /// Wrap an already open database and start the writer task
    pub fn with_database(db: Arc<Database>) -> Self {
        let (tx, rx) = mpsc::channel(WRITER_CHANNEL_BUFFER);
        let writer = spawn_writer(Arc::clone(&db), rx);
        Self {
            db,
            tx,
            writer: Mutex::new(Some(writer)),
        }
    }

    async fn send<T>(&self, make: impl FnOnce(oneshot::Sender<Result<T>>) -> WriteCommand) -> Result<T> {
        let (ack, rx) = oneshot::channel();
        self.tx
            .send(make(ack))
            .await
            .map_err(|_| Error::Database(DatabaseError::WriterClosed))?;
        rx.await
            .map_err(|_| Error::Database(DatabaseError::WriterClosed))?
    }

    /// Startup recovery: reset in-progress records and note whether the
    /// previous run crashed
    ///
    /// Also marks the current run as started, so a crash during this run is
    /// detected next time.
    pub async fn recover(&self) -> Result<RecoveryReport> {
        let report = self.send(|ack| WriteCommand::Recover { ack }).await?;
        if report.unclean_shutdown {
            tracing::warn!(reset = report.reset, "Previous run did not shut down cleanly, recovering");
        } else if report.reset > 0 {
            tracing::info!(reset = report.reset, "Reset interrupted items to pending");
        }
        Ok(report)
    }

    /// Whether `item` is complete
    pub async fn is_complete(&self, item: &ItemId) -> Result<bool> {
        Ok(self
            .db
            .get_item(item.as_str())
            .await?
            .is_some_and(|row| RecordStatus::from_i32(row.status) == RecordStatus::Complete))
    }

    /// Full record of `item`
    pub async fn record(&self, item: &ItemId) -> Result<Option<ResumableRecord>> {
        self.db
            .get_item(item.as_str())
            .await?
            .map(ResumableRecord::try_from)
            .transpose()
    }

    /// Split `ids` into those still to download and a count of complete ones
    pub async fn pending_of(&self, ids: &[ItemId]) -> Result<PendingSplit> {
        let complete: HashSet<String> = self.db.completed_item_ids().await?;
        let mut split = PendingSplit::default();
        for id in ids {
            if complete.contains(id.as_str()) {
                split.already_complete += 1;
            } else {
                split.pending.push(id.clone());
            }
        }
        Ok(split)
    }

    /// Record that a worker took `item`
    pub async fn mark_in_progress(&self, item: &ItemId) -> Result<()> {
        self.send(|ack| WriteCommand::SetStatus {
            item: item.clone(),
            status: RecordStatus::InProgress,
            attempts: 0,
            error: None,
            ack,
        })
        .await
    }

    /// Record that `item` is downloaded and stored; terminal
    pub async fn mark_complete(&self, item: &ItemId, attempts: u32) -> Result<()> {
        self.send(|ack| WriteCommand::SetStatus {
            item: item.clone(),
            status: RecordStatus::Complete,
            attempts,
            error: None,
            ack,
        })
        .await
    }

    /// Record that `item` failed for this run
    pub async fn mark_failed(&self, item: &ItemId, attempts: u32, reason: &str) -> Result<()> {
        self.send(|ack| WriteCommand::SetStatus {
            item: item.clone(),
            status: RecordStatus::Failed,
            attempts,
            error: Some(reason.to_string()),
            ack,
        })
        .await
    }

    /// Put an interrupted `item` back to pending
    pub async fn mark_pending(&self, item: &ItemId) -> Result<()> {
        self.send(|ack| WriteCommand::ResetToPending {
            item: item.clone(),
            ack,
        })
        .await
    }

    /// Records per status
    pub async fn counts(&self) -> Result<StatusCounts> {
        self.db.count_items_by_status().await
    }

    /// Mark a clean shutdown and stop the writer
    ///
    /// Writes already queued are applied first. Later mutations fail with
    /// [`DatabaseError::WriterClosed`].
    pub async fn shutdown(&self) -> Result<()> {
        let marked = self
            .send(|ack| WriteCommand::MarkCleanShutdown { ack })
            .await;

        if let Some(writer) = self.writer.lock().await.take()
            && let Err(e) = writer.await
        {
            tracing::error!(error = %e, "State writer task ended abnormally");
        }
        marked
    }
}

fn spawn_writer(
    db: Arc<Database>,
    mut rx: mpsc::Receiver<WriteCommand>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(command) = rx.recv().await {
            match command {
                WriteCommand::SetStatus {
                    item,
                    status,
                    attempts,
                    error,
                    ack,
                } => {
                    let result = db
                        .set_item_status(item.as_str(), status, attempts, error.as_deref())
                        .await;
                    match &result {
                        Ok(false) => {
                            tracing::debug!(item = %item, status = ?status, "Item already complete, update ignored")
                        }
                        Err(e) => {
                            tracing::error!(item = %item, status = ?status, error = %e, "Failed to persist item status")
                        }
                        Ok(true) => {}
                    }
                    ack.send(result.map(|_| ())).ok();
                }
                WriteCommand::ResetToPending { item, ack } => {
                    let result = db.reset_item_to_pending(item.as_str()).await;
                    ack.send(result.map(|_| ())).ok();
                }
                WriteCommand::Recover { ack } => {
                    let result = async {
                        let unclean_shutdown = db.was_unclean_shutdown().await?;
                        let reset = db.reset_in_progress().await?;
                        db.set_clean_start().await?;
                        Ok::<_, Error>(RecoveryReport {
                            unclean_shutdown,
                            reset,
                        })
                    }
                    .await;
                    ack.send(result).ok();
                }
                WriteCommand::MarkCleanShutdown { ack } => {
                    let result = db.set_clean_shutdown().await;
                    ack.send(result).ok();
                    break;
                }
            }
        }
        tracing::debug!("State writer stopped");
    })
}
