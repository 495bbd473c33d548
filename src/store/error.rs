//! Error types for queue/resume persistence.

use thiserror::Error;

/// Errors from task-store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Underlying database operation failed.
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// A persisted row holds a value the current code cannot parse.
    #[error("corrupt row for chart {chart_id}: {detail}")]
    CorruptRow {
        /// Chart id of the offending row.
        chart_id: String,
        /// What failed to parse.
        detail: String,
    },
}

/// Result type for store operations.
pub type Result<T> = std::result::Result<T, StoreError>;
