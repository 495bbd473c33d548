//! Raw error types for chart transfer operations.
//!
//! These are the errors as the transport and filesystem report them, before
//! classification. The orchestrator never matches on these directly; it runs
//! them through [`classify`](super::classify::classify) to obtain a
//! [`DownloadFailure`](super::classify::DownloadFailure) with a category and
//! retryability flag.

use std::path::PathBuf;

use thiserror::Error;

/// Errors surfaced by a transfer attempt (network, HTTP, or local I/O).
#[derive(Debug, Error)]
pub enum TransferError {
    /// Network-level error (DNS resolution, connection refused, TLS errors,
    /// mid-stream socket resets).
    #[error("network error fetching {url}: {source}")]
    Network {
        /// The URL that failed.
        url: String,
        /// The underlying network error.
        #[source]
        source: reqwest::Error,
    },

    /// Request or body read timed out before completion.
    #[error("timeout fetching {url}")]
    Timeout {
        /// The URL that timed out.
        url: String,
    },

    /// HTTP error response (4xx client errors, 5xx server errors).
    #[error("HTTP {status} fetching {url}")]
    HttpStatus {
        /// The URL that returned an error status.
        url: String,
        /// The HTTP status code.
        status: u16,
        /// The Retry-After header value, if present (429 responses).
        retry_after: Option<String>,
    },

    /// File system error on the part or final file.
    #[error("IO error at {path}: {source}")]
    Io {
        /// The file path where the error occurred.
        path: PathBuf,
        /// The underlying IO error.
        #[source]
        source: std::io::Error,
    },

    /// The provided URL is malformed or invalid.
    #[error("invalid URL: {url}")]
    InvalidUrl {
        /// The invalid URL string.
        url: String,
    },

    /// Finished part file does not match the expected SHA-256 digest.
    #[error("checksum mismatch for {path}: expected {expected}, got {actual}")]
    Checksum {
        /// Part file path that failed verification.
        path: PathBuf,
        /// Expected hex digest.
        expected: String,
        /// Computed hex digest.
        actual: String,
    },

    /// Transfer was cancelled by an explicit command.
    #[error("transfer cancelled")]
    Cancelled,
}

impl TransferError {
    /// Creates a network error from a reqwest error.
    pub fn network(url: impl Into<String>, source: reqwest::Error) -> Self {
        Self::Network {
            url: url.into(),
            source,
        }
    }

    /// Creates a timeout error.
    pub fn timeout(url: impl Into<String>) -> Self {
        Self::Timeout { url: url.into() }
    }

    /// Creates an HTTP status error.
    pub fn http_status(url: impl Into<String>, status: u16) -> Self {
        Self::HttpStatus {
            url: url.into(),
            status,
            retry_after: None,
        }
    }

    /// Creates an HTTP status error carrying a Retry-After header value.
    pub fn http_status_with_retry_after(
        url: impl Into<String>,
        status: u16,
        retry_after: Option<String>,
    ) -> Self {
        Self::HttpStatus {
            url: url.into(),
            status,
            retry_after,
        }
    }

    /// Creates an IO error.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Creates an invalid URL error.
    pub fn invalid_url(url: impl Into<String>) -> Self {
        Self::InvalidUrl { url: url.into() }
    }

    /// Creates a checksum mismatch error.
    pub fn checksum(
        path: impl Into<PathBuf>,
        expected: impl Into<String>,
        actual: impl Into<String>,
    ) -> Self {
        Self::Checksum {
            path: path.into(),
            expected: expected.into(),
            actual: actual.into(),
        }
    }
}

// No `From<reqwest::Error>` / `From<std::io::Error>` impls: every variant
// needs context (url, path) that the source errors don't carry. The helper
// constructors are the supported construction path.

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_timeout_display_includes_url() {
        let error = TransferError::timeout("https://charts.example.gov/US5WA11M.zip");
        assert!(error.to_string().contains("timeout"));
        assert!(error.to_string().contains("US5WA11M.zip"));
    }

    #[test]
    fn test_http_status_display() {
        let error = TransferError::http_status("https://charts.example.gov/missing.zip", 404);
        let msg = error.to_string();
        assert!(msg.contains("404"), "Expected '404' in: {msg}");
        assert!(msg.contains("missing.zip"), "Expected URL in: {msg}");
    }

    #[test]
    fn test_io_display_includes_path() {
        let io_error = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "access denied");
        let error = TransferError::io(PathBuf::from("/charts/US5WA11M.zip.part"), io_error);
        assert!(error.to_string().contains("US5WA11M.zip.part"));
    }

    #[test]
    fn test_checksum_display_includes_digests() {
        let error = TransferError::checksum("/charts/x.zip.part", "aabb", "ccdd");
        let msg = error.to_string();
        assert!(msg.contains("aabb"), "Expected digest in: {msg}");
        assert!(msg.contains("ccdd"), "Expected digest in: {msg}");
    }

    #[test]
    fn test_invalid_url_display() {
        let error = TransferError::invalid_url("not-a-url");
        assert!(error.to_string().contains("invalid URL"));
    }
}
