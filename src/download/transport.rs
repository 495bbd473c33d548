//! Range-capable fetch seam between the orchestrator and the network.
//!
//! The download core does not implement an HTTP client; it consumes a
//! [`ChartTransport`] that can start a byte stream at an offset and surface
//! raw errors for classification. [`HttpTransport`] is the thin production
//! adapter over reqwest.

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::stream::BoxStream;
use futures_util::{StreamExt, TryStreamExt};
use reqwest::header::{CONTENT_RANGE, RANGE, RETRY_AFTER};
use tracing::{debug, instrument};
use url::Url;

use super::error::TransferError;

/// An open transfer: metadata plus the chunk stream.
pub struct TransferStream {
    /// Total size of the complete artifact (existing offset included), when
    /// the server reported it.
    pub total_bytes: Option<u64>,
    /// Whether the server honored the range request (HTTP 206). When false,
    /// the stream starts at byte zero regardless of the requested offset.
    pub resumed: bool,
    /// The body chunks.
    pub chunks: BoxStream<'static, Result<Bytes, TransferError>>,
}

impl fmt::Debug for TransferStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransferStream")
            .field("total_bytes", &self.total_bytes)
            .field("resumed", &self.resumed)
            .finish_non_exhaustive()
    }
}

/// Range-capable fetch primitive.
///
/// Implementations must support HTTP Range requests for resume and must
/// surface raw errors (timeout, connection, HTTP status with Retry-After)
/// without interpreting them; classification happens in the caller.
#[async_trait]
pub trait ChartTransport: Send + Sync + fmt::Debug {
    /// Opens a byte stream for `url`, starting at `range_start` when given.
    /// `timeout` bounds the whole attempt including the body read.
    async fn fetch(
        &self,
        url: &str,
        range_start: Option<u64>,
        timeout: Duration,
    ) -> Result<TransferStream, TransferError>;
}

/// Default connect timeout for chart fetches.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Production transport over reqwest with streaming and gzip.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
}

impl Default for HttpTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl HttpTransport {
    /// Creates the transport with default timeouts.
    ///
    /// # Panics
    ///
    /// Panics if the HTTP client cannot be built with the static
    /// configuration; this does not happen in practice.
    #[must_use]
    #[allow(clippy::expect_used)]
    pub fn new() -> Self {
        let client = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .gzip(true)
            .build()
            .expect("failed to build transport HTTP client");
        Self { client }
    }
}

#[async_trait]
impl ChartTransport for HttpTransport {
    #[instrument(skip(self), fields(url = %url))]
    async fn fetch(
        &self,
        url: &str,
        range_start: Option<u64>,
        timeout: Duration,
    ) -> Result<TransferStream, TransferError> {
        Url::parse(url).map_err(|_| TransferError::invalid_url(url))?;

        let mut request = self.client.get(url).timeout(timeout);
        if let Some(offset) = range_start.filter(|offset| *offset > 0) {
            request = request.header(RANGE, format!("bytes={offset}-"));
        }

        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                TransferError::timeout(url)
            } else {
                TransferError::network(url, e)
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            let retry_after = response
                .headers()
                .get(RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string);
            return Err(TransferError::http_status_with_retry_after(
                url,
                status.as_u16(),
                retry_after,
            ));
        }

        let resumed = status.as_u16() == 206;
        let total_bytes = if resumed {
            // Content-Range: bytes <start>-<end>/<total>
            parse_content_range_total(&response).or_else(|| {
                response
                    .content_length()
                    .zip(range_start)
                    .map(|(remaining, offset)| offset + remaining)
            })
        } else {
            response.content_length()
        };

        debug!(
            status = status.as_u16(),
            resumed,
            total_bytes,
            "transfer stream opened"
        );

        let stream_url = url.to_string();
        let chunks = response
            .bytes_stream()
            .map_err(move |e| {
                if e.is_timeout() {
                    TransferError::timeout(stream_url.clone())
                } else {
                    TransferError::network(stream_url.clone(), e)
                }
            })
            .boxed();

        Ok(TransferStream {
            total_bytes,
            resumed,
            chunks,
        })
    }
}

/// Extracts the total size from a `Content-Range` header on a 206 response.
fn parse_content_range_total(response: &reqwest::Response) -> Option<u64> {
    response
        .headers()
        .get(CONTENT_RANGE)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.rsplit('/').next())
        .and_then(|total| total.trim().parse::<u64>().ok())
}
