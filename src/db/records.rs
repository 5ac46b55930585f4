//! Per-item status records for resume support.
//!
//! Complete records are never overwritten: every status-changing statement
//! carries a `status != COMPLETE` guard.

use crate::error::DatabaseError;
use crate::types::RecordStatus;
use crate::{Error, Result};
use std::collections::HashSet;

use super::{Database, ItemRow, StatusCounts};

const COMPLETE: i32 = 2;

impl Database {
    /// Upsert the status of an item unless it is already complete
    ///
    /// `attempts` is added to the stored attempt count. Returns whether a row
    /// changed.
    pub async fn set_item_status(
        &self,
        item_id: &str,
        status: RecordStatus,
        attempts: u32,
        last_error: Option<&str>,
    ) -> Result<bool> {
        let now = chrono::Utc::now().timestamp();
        let result = sqlx::query(
            r#"
            INSERT INTO items (item_id, status, attempts, last_error, updated_at)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT(item_id) DO UPDATE SET
                status = excluded.status,
                attempts = items.attempts + excluded.attempts,
                last_error = excluded.last_error,
                updated_at = excluded.updated_at
            WHERE items.status != ?
            "#,
        )
        .bind(item_id)
        .bind(status.to_i32())
        .bind(i64::from(attempts))
        .bind(last_error)
        .bind(now)
        .bind(COMPLETE)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            Error::Database(DatabaseError::QueryFailed(format!(
                "Failed to update item status: {}",
                e
            )))
        })?;

        Ok(result.rows_affected() > 0)
    }

    /// Put an in-progress item back to pending (interrupted task)
    pub async fn reset_item_to_pending(&self, item_id: &str) -> Result<bool> {
        let now = chrono::Utc::now().timestamp();
        let result = sqlx::query(
            r#"
            UPDATE items SET status = ?, updated_at = ?
            WHERE item_id = ? AND status = ?
            "#,
        )
        .bind(RecordStatus::Pending.to_i32())
        .bind(now)
        .bind(item_id)
        .bind(RecordStatus::InProgress.to_i32())
        .execute(&self.pool)
        .await
        .map_err(|e| {
            Error::Database(DatabaseError::QueryFailed(format!(
                "Failed to reset item: {}",
                e
            )))
        })?;

        Ok(result.rows_affected() > 0)
    }

    /// Reset every in-progress item to pending
    ///
    /// Called on startup: an in-progress record means the previous run died
    /// mid-transfer. Returns the number of reset records.
    pub async fn reset_in_progress(&self) -> Result<u64> {
        let now = chrono::Utc::now().timestamp();
        let result = sqlx::query("UPDATE items SET status = ?, updated_at = ? WHERE status = ?")
            .bind(RecordStatus::Pending.to_i32())
            .bind(now)
            .bind(RecordStatus::InProgress.to_i32())
            .execute(&self.pool)
            .await
            .map_err(|e| {
                Error::Database(DatabaseError::QueryFailed(format!(
                    "Failed to reset in-progress items: {}",
                    e
                )))
            })?;

        Ok(result.rows_affected())
    }

    /// Get one item record
    pub async fn get_item(&self, item_id: &str) -> Result<Option<ItemRow>> {
        let row = sqlx::query_as::<_, ItemRow>(
            r#"
            SELECT item_id, status, attempts, last_error, updated_at
            FROM items WHERE item_id = ?
            "#,
        )
        .bind(item_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| {
            Error::Database(DatabaseError::QueryFailed(format!(
                "Failed to get item: {}",
                e
            )))
        })?;

        Ok(row)
    }

    /// Get all items with a given status
    pub async fn list_items_by_status(&self, status: RecordStatus) -> Result<Vec<ItemRow>> {
        let rows = sqlx::query_as::<_, ItemRow>(
            r#"
            SELECT item_id, status, attempts, last_error, updated_at
            FROM items WHERE status = ?
            ORDER BY updated_at ASC, item_id ASC
            "#,
        )
        .bind(status.to_i32())
        .fetch_all(&self.pool)
        .await
        .map_err(|e| {
            Error::Database(DatabaseError::QueryFailed(format!(
                "Failed to list items: {}",
                e
            )))
        })?;

        Ok(rows)
    }

    /// IDs of every complete item
    pub async fn completed_item_ids(&self) -> Result<HashSet<String>> {
        let ids: Vec<String> = sqlx::query_scalar("SELECT item_id FROM items WHERE status = ?")
            .bind(COMPLETE)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| {
                Error::Database(DatabaseError::QueryFailed(format!(
                    "Failed to list completed items: {}",
                    e
                )))
            })?;

        Ok(ids.into_iter().collect())
    }

    /// Count records per status
    pub async fn count_items_by_status(&self) -> Result<StatusCounts> {
        let rows: Vec<(i32, i64)> =
            sqlx::query_as("SELECT status, COUNT(*) FROM items GROUP BY status")
                .fetch_all(&self.pool)
                .await
                .map_err(|e| {
                    Error::Database(DatabaseError::QueryFailed(format!(
                        "Failed to count items: {}",
                        e
                    )))
                })?;

        let mut counts = StatusCounts::default();
        for (status, count) in rows {
            let count = count.max(0) as u64;
            match RecordStatus::from_i32(status) {
                RecordStatus::Pending => counts.pending += count,
                RecordStatus::InProgress => counts.in_progress += count,
                RecordStatus::Complete => counts.complete += count,
                RecordStatus::Failed => counts.failed += count,
            }
        }
        Ok(counts)
    }
}
