//! Database layer for bulkfetch
//!
//! SQLite persistence for per-item download status.
//!
//! ## Submodules
//!
//! Methods on [`Database`] are organized by domain:
//! - [`migrations`] - Database lifecycle, schema migrations
//! - [`records`] - Per-item status records
//! - [`state`] - Runtime state (shutdown tracking)
//!
//! Writes are expected to come from a single task (see
//! [`ResumableStateStore`](crate::state::ResumableStateStore)); reads may run
//! concurrently thanks to WAL mode.

use sqlx::{FromRow, sqlite::SqlitePool};

mod migrations;
mod records;
mod state;

/// Item record from database
#[derive(Debug, Clone, FromRow)]
pub struct ItemRow {
    /// Item ID
    pub item_id: String,
    /// Status code (0=pending, 1=in progress, 2=complete, 3=failed)
    pub status: i32,
    /// Attempts made across all runs
    pub attempts: i64,
    /// Last error summary
    pub last_error: Option<String>,
    /// Unix timestamp of the last change
    pub updated_at: i64,
}

/// Number of records per status
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatusCounts {
    /// Pending records
    pub pending: u64,
    /// In-progress records
    pub in_progress: u64,
    /// Complete records
    pub complete: u64,
    /// Failed records
    pub failed: u64,
}

impl StatusCounts {
    /// Total number of records
    pub fn total(&self) -> u64 {
        self.pending + self.in_progress + self.complete + self.failed
    }
}

/// Database handle for bulkfetch
pub struct Database {
    pool: SqlitePool,
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests;
