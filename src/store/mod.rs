//! SQLite-backed persistence for queue and resume state.
//!
//! Each tracked chart serializes as one row. On process restart,
//! queued/paused rows are reloaded into the orchestrator but are not
//! auto-promoted to downloading; an explicit resume/schedule call is
//! required.

mod error;
mod record;

pub use error::{Result, StoreError};
pub use record::PersistedTask;

use sqlx::Row;
use tracing::instrument;

use crate::db::Database;
use crate::download::{DownloadTask, ResumeRecord, TaskStatus};

/// Task persistence gateway.
///
/// All mutations flow through the orchestrator's transition functions; this
/// type only talks to the database.
#[derive(Debug, Clone)]
pub struct TaskStore {
    db: Database,
}

impl TaskStore {
    /// Creates a store over the given database.
    #[must_use]
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Inserts or replaces the row for a task.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if the write fails.
    #[instrument(skip(self, task), fields(chart_id = %task.chart_id))]
    pub async fn upsert_task(&self, task: &DownloadTask) -> Result<()> {
        sqlx::query(
            r"
            INSERT INTO downloads
                (chart_id, url, priority, status, bytes_downloaded, total_bytes,
                 attempts, last_error_category, last_error, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, datetime('now'))
            ON CONFLICT(chart_id) DO UPDATE SET
                url = excluded.url,
                priority = excluded.priority,
                status = excluded.status,
                bytes_downloaded = excluded.bytes_downloaded,
                total_bytes = excluded.total_bytes,
                attempts = excluded.attempts,
                last_error_category = excluded.last_error_category,
                last_error = excluded.last_error,
                updated_at = datetime('now')
            ",
        )
        .bind(&task.chart_id)
        .bind(&task.source_url)
        .bind(task.priority.as_str())
        .bind(task.status.as_str())
        .bind(i64::try_from(task.bytes_downloaded).unwrap_or(i64::MAX))
        .bind(task.total_bytes.and_then(|t| i64::try_from(t).ok()))
        .bind(i64::from(task.attempts))
        .bind(task.last_error_category.map(|c| c.as_str()))
        .bind(task.attempt_errors.last().map(|e| e.message.clone()))
        .execute(self.db.pool())
        .await?;
        Ok(())
    }

    /// Updates progress counters for a row.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if the write fails.
    pub async fn update_progress(
        &self,
        chart_id: &str,
        bytes_downloaded: u64,
        total_bytes: Option<u64>,
    ) -> Result<()> {
        sqlx::query(
            r"
            UPDATE downloads
            SET bytes_downloaded = ?, total_bytes = ?, updated_at = datetime('now')
            WHERE chart_id = ?
            ",
        )
        .bind(i64::try_from(bytes_downloaded).unwrap_or(i64::MAX))
        .bind(total_bytes.and_then(|t| i64::try_from(t).ok()))
        .bind(chart_id)
        .execute(self.db.pool())
        .await?;
        Ok(())
    }

    /// Writes the resume record columns for a paused task.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if the write fails.
    #[instrument(skip(self, record), fields(chart_id = %record.chart_id))]
    pub async fn save_resume(&self, record: &ResumeRecord) -> Result<()> {
        sqlx::query(
            r"
            UPDATE downloads
            SET bytes_downloaded = ?, part_path = ?, updated_at = datetime('now')
            WHERE chart_id = ?
            ",
        )
        .bind(i64::try_from(record.bytes_downloaded).unwrap_or(i64::MAX))
        .bind(record.part_path.to_string_lossy().into_owned())
        .bind(&record.chart_id)
        .execute(self.db.pool())
        .await?;
        Ok(())
    }

    /// Loads the resume record for a chart, if one is persisted.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if the read fails.
    pub async fn load_resume(&self, chart_id: &str) -> Result<Option<ResumeRecord>> {
        let row = sqlx::query(
            r"SELECT bytes_downloaded, part_path FROM downloads WHERE chart_id = ?",
        )
        .bind(chart_id)
        .fetch_optional(self.db.pool())
        .await?;

        Ok(row.and_then(|row| {
            let part_path: Option<String> = row.get("part_path");
            let bytes: i64 = row.get("bytes_downloaded");
            part_path.map(|path| ResumeRecord {
                chart_id: chart_id.to_string(),
                bytes_downloaded: u64::try_from(bytes).unwrap_or(0),
                part_path: path.into(),
            })
        }))
    }

    /// Clears the resume record columns; called on cancel and on successful
    /// completion.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if the write fails.
    pub async fn clear_resume(&self, chart_id: &str) -> Result<()> {
        sqlx::query(
            r"UPDATE downloads SET part_path = NULL, updated_at = datetime('now') WHERE chart_id = ?",
        )
        .bind(chart_id)
        .execute(self.db.pool())
        .await?;
        Ok(())
    }

    /// Reads one row.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if the read fails.
    pub async fn get(&self, chart_id: &str) -> Result<Option<PersistedTask>> {
        let task = sqlx::query_as::<_, PersistedTask>(
            r"SELECT * FROM downloads WHERE chart_id = ?",
        )
        .bind(chart_id)
        .fetch_optional(self.db.pool())
        .await?;
        Ok(task)
    }

    /// Reads every persisted row, oldest first.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if the read fails.
    pub async fn all(&self) -> Result<Vec<PersistedTask>> {
        let tasks = sqlx::query_as::<_, PersistedTask>(
            r"SELECT * FROM downloads ORDER BY created_at, chart_id",
        )
        .fetch_all(self.db.pool())
        .await?;
        Ok(tasks)
    }

    /// Reads the rows a restart should reload: queued and paused tasks.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if the read fails.
    pub async fn load_restorable(&self) -> Result<Vec<PersistedTask>> {
        let tasks = sqlx::query_as::<_, PersistedTask>(
            r"
            SELECT * FROM downloads
            WHERE status IN (?, ?)
            ORDER BY created_at, chart_id
            ",
        )
        .bind(TaskStatus::Queued.as_str())
        .bind(TaskStatus::Paused.as_str())
        .fetch_all(self.db.pool())
        .await?;
        Ok(tasks)
    }

    /// Deletes one row.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if the write fails.
    pub async fn delete(&self, chart_id: &str) -> Result<()> {
        sqlx::query(r"DELETE FROM downloads WHERE chart_id = ?")
            .bind(chart_id)
            .execute(self.db.pool())
            .await?;
        Ok(())
    }
}
