//! Persisted row types for the download queue.

use std::path::PathBuf;

use sqlx::FromRow;

use crate::download::{ErrorCategory, Priority, ResumeRecord, TaskStatus};

use super::error::StoreError;

/// One persisted download row, as stored.
///
/// Enum-typed fields are kept as text and parsed through accessors so a row
/// written by a newer build degrades to a [`StoreError::CorruptRow`] instead
/// of failing the whole load.
#[derive(Debug, Clone, FromRow)]
pub struct PersistedTask {
    /// Chart cell id (primary key).
    pub chart_id: String,
    /// Source artifact URL.
    pub url: String,
    /// Priority as text (`low`/`normal`/`high`/`critical`).
    #[sqlx(rename = "priority")]
    pub priority_str: String,
    /// Status as text.
    #[sqlx(rename = "status")]
    pub status_str: String,
    /// Fully acknowledged bytes, doubling as the resume offset.
    pub bytes_downloaded: i64,
    /// Expected total bytes when known.
    pub total_bytes: Option<i64>,
    /// Attempts made in the last run.
    pub attempts: i64,
    /// Category of the last failure as text.
    pub last_error_category: Option<String>,
    /// Message of the last failure.
    pub last_error: Option<String>,
    /// Part file path while paused.
    pub part_path: Option<String>,
    /// Row creation time.
    pub created_at: String,
    /// Last mutation time.
    pub updated_at: String,
}

impl PersistedTask {
    /// Parses the stored priority.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::CorruptRow`] for unrecognized text.
    pub fn priority(&self) -> Result<Priority, StoreError> {
        self.priority_str.parse().map_err(|e| StoreError::CorruptRow {
            chart_id: self.chart_id.clone(),
            detail: e,
        })
    }

    /// Parses the stored status.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::CorruptRow`] for unrecognized text.
    pub fn status(&self) -> Result<TaskStatus, StoreError> {
        self.status_str.parse().map_err(|e| StoreError::CorruptRow {
            chart_id: self.chart_id.clone(),
            detail: e,
        })
    }

    /// Parses the stored failure category, when present. Unrecognized text
    /// degrades to `Unknown` rather than erroring; the category is
    /// diagnostic only.
    #[must_use]
    pub fn last_error_category(&self) -> Option<ErrorCategory> {
        self.last_error_category
            .as_deref()
            .map(|s| s.parse().unwrap_or(ErrorCategory::Unknown))
    }

    /// Reconstructs the resume record, when the row carries one.
    #[must_use]
    pub fn resume_record(&self) -> Option<ResumeRecord> {
        let part_path = self.part_path.as_ref()?;
        Some(ResumeRecord {
            chart_id: self.chart_id.clone(),
            bytes_downloaded: u64::try_from(self.bytes_downloaded).unwrap_or(0),
            part_path: PathBuf::from(part_path),
        })
    }
}
