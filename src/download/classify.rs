//! Error classification into the closed download-failure taxonomy.
//!
//! Raw [`TransferError`] values carry whatever the transport reported; the
//! retry engine and the progress surface work on a fixed set of categories
//! with a retryability flag. Classification is total: every raw error maps to
//! exactly one [`ErrorCategory`], and anything unrecognized lands in
//! [`ErrorCategory::Unknown`], which is conservatively non-retryable.
//!
//! The classified value is a single tagged struct, matched exhaustively at
//! call sites. There is deliberately no error-class hierarchy.

use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

use tracing::instrument;

use super::error::TransferError;
use super::rate_limit::parse_retry_after;

/// Closed taxonomy of download failure categories.
///
/// | Category | Retryable |
/// |---|---|
/// | `NoConnection` | yes |
/// | `Timeout` | yes |
/// | `ServerError` | yes |
/// | `RateLimited` | yes |
/// | `AuthFailed` | no |
/// | `ChartNotAvailable` | no |
/// | `ChecksumMismatch` | once |
/// | `Cancelled` | no (not a failure) |
/// | `Unknown` | no (conservative default) |
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    /// DNS failure, connection refused, or socket-level error.
    NoConnection,
    /// Connect/read/send timeout.
    Timeout,
    /// HTTP 5xx from the chart server.
    ServerError,
    /// HTTP 429; may carry a Retry-After hint in metadata.
    RateLimited,
    /// HTTP 401/403; credentials are the problem, not the link.
    AuthFailed,
    /// HTTP 404; the chart cell does not exist on the server.
    ChartNotAvailable,
    /// Downloaded bytes disagree with the expected digest.
    ChecksumMismatch,
    /// Explicit cancellation; terminal but not an error condition.
    Cancelled,
    /// Anything the taxonomy does not recognize.
    Unknown,
}

impl ErrorCategory {
    /// Whether the category is retryable under the default policy.
    ///
    /// `ChecksumMismatch` is retryable, but the retry engine additionally
    /// limits it to a single retry regardless of the attempt budget.
    #[must_use]
    pub fn is_retryable(self) -> bool {
        match self {
            Self::NoConnection
            | Self::Timeout
            | Self::ServerError
            | Self::RateLimited
            | Self::ChecksumMismatch => true,
            Self::AuthFailed | Self::ChartNotAvailable | Self::Cancelled | Self::Unknown => false,
        }
    }

    /// Whether a later `resume` call is expected to succeed after a failure
    /// in this category. False only where the remote resource itself is the
    /// problem.
    #[must_use]
    pub fn resume_expected(self) -> bool {
        !matches!(self, Self::ChartNotAvailable | Self::AuthFailed)
    }

    /// Short user-facing recommendation attached to failure surfaces.
    #[must_use]
    pub fn recommended_action(self) -> &'static str {
        match self {
            Self::NoConnection => "check connection",
            Self::Timeout | Self::ServerError | Self::RateLimited => "wait and retry",
            Self::AuthFailed => "check account credentials",
            Self::ChartNotAvailable => "chart is not available from this source",
            Self::ChecksumMismatch => "retry the download",
            Self::Cancelled => "re-enqueue to download again",
            Self::Unknown => "contact support",
        }
    }

    /// Stable string form used in persisted rows and progress snapshots.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::NoConnection => "no_connection",
            Self::Timeout => "timeout",
            Self::ServerError => "server_error",
            Self::RateLimited => "rate_limited",
            Self::AuthFailed => "auth_failed",
            Self::ChartNotAvailable => "chart_not_available",
            Self::ChecksumMismatch => "checksum_mismatch",
            Self::Cancelled => "cancelled",
            Self::Unknown => "unknown",
        }
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ErrorCategory {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "no_connection" => Ok(Self::NoConnection),
            "timeout" => Ok(Self::Timeout),
            "server_error" => Ok(Self::ServerError),
            "rate_limited" => Ok(Self::RateLimited),
            "auth_failed" => Ok(Self::AuthFailed),
            "chart_not_available" => Ok(Self::ChartNotAvailable),
            "checksum_mismatch" => Ok(Self::ChecksumMismatch),
            "cancelled" => Ok(Self::Cancelled),
            "unknown" => Ok(Self::Unknown),
            _ => Err(format!("invalid error category: {s}")),
        }
    }
}

/// A classified download failure: category, message, metadata, retryability.
///
/// This is the single tagged error value the orchestrator and callers match
/// on. `metadata` carries optional context such as the HTTP status
/// (`"status"`) or the raw Retry-After header (`"retry_after"`).
#[derive(Debug, Clone)]
pub struct DownloadFailure {
    /// Taxonomy category.
    pub category: ErrorCategory,
    /// Human-readable description of what went wrong.
    pub message: String,
    /// Optional string context (status code, retry-after hint, path).
    pub metadata: HashMap<String, String>,
    /// Whether retrying can help, per the category.
    pub retryable: bool,
}

impl DownloadFailure {
    /// Builds a failure for a category with a message and no metadata.
    #[must_use]
    pub fn new(category: ErrorCategory, message: impl Into<String>) -> Self {
        Self {
            category,
            message: message.into(),
            metadata: HashMap::new(),
            retryable: category.is_retryable(),
        }
    }

    /// Builds the failure recorded for an explicit cancellation.
    #[must_use]
    pub fn cancelled() -> Self {
        Self::new(ErrorCategory::Cancelled, "transfer cancelled")
    }

    fn with_meta(mut self, key: &str, value: impl Into<String>) -> Self {
        self.metadata.insert(key.to_string(), value.into());
        self
    }

    /// Server-mandated retry delay parsed from the Retry-After hint, if the
    /// failure carried one.
    #[must_use]
    pub fn retry_after(&self) -> Option<Duration> {
        self.metadata
            .get("retry_after")
            .and_then(|raw| parse_retry_after(raw))
    }

    /// Whether a later `resume` call is expected to succeed.
    #[must_use]
    pub fn resume_expected(&self) -> bool {
        self.category.resume_expected()
    }
}

impl fmt::Display for DownloadFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.category, self.message)
    }
}

/// Classifies a raw transfer error into the closed taxonomy.
///
/// HTTP statuses map as: 401/403 → `AuthFailed`, 404 → `ChartNotAvailable`,
/// 408 → `Timeout`, 429 → `RateLimited`, any 5xx → `ServerError`. Other
/// statuses fall to `Unknown`: the taxonomy is closed, so unfamiliar client
/// errors are treated as non-retryable rather than guessed at.
#[instrument]
pub fn classify(error: &TransferError) -> DownloadFailure {
    let message = error.to_string();
    match error {
        TransferError::HttpStatus {
            status, retry_after, ..
        } => {
            let failure = classify_http_status(*status, message);
            match (failure.category, retry_after) {
                (ErrorCategory::RateLimited, Some(hint)) => {
                    failure.with_meta("retry_after", hint.clone())
                }
                _ => failure,
            }
        }

        TransferError::Timeout { .. } => DownloadFailure::new(ErrorCategory::Timeout, message),

        TransferError::Network { source, .. } => {
            if source.is_timeout() {
                DownloadFailure::new(ErrorCategory::Timeout, message)
            } else if source.is_connect() || source.is_request() || source.is_body() {
                // DNS failures, refused connections, and mid-stream socket
                // errors all mean the link is the problem.
                DownloadFailure::new(ErrorCategory::NoConnection, message)
            } else {
                DownloadFailure::new(ErrorCategory::Unknown, message)
            }
        }

        TransferError::Checksum {
            expected, actual, ..
        } => DownloadFailure::new(ErrorCategory::ChecksumMismatch, message)
            .with_meta("expected", expected.clone())
            .with_meta("actual", actual.clone()),

        TransferError::Cancelled => DownloadFailure::cancelled(),

        TransferError::Io { .. } | TransferError::InvalidUrl { .. } => {
            DownloadFailure::new(ErrorCategory::Unknown, message)
        }
    }
}

fn classify_http_status(status: u16, message: String) -> DownloadFailure {
    let category = match status {
        401 | 403 => ErrorCategory::AuthFailed,
        404 => ErrorCategory::ChartNotAvailable,
        408 => ErrorCategory::Timeout,
        429 => ErrorCategory::RateLimited,
        s if (500..600).contains(&s) => ErrorCategory::ServerError,
        _ => ErrorCategory::Unknown,
    };
    DownloadFailure::new(category, message).with_meta("status", status.to_string())
}
