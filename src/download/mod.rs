//! Resilient chart-download core.
//!
//! Large chart artifacts come down over unreliable, low-bandwidth links and
//! must survive interruption without corrupting data or losing progress.
//! The pieces, leaves first:
//!
//! - [`classify`] - closed error taxonomy with retryability
//! - [`retry`] - backoff curves and the attempt budget
//! - [`rate_limit`] - sliding-window admission, priority-aware variant
//! - [`quality`] - network-quality monitor gating large transfers
//! - [`writer`] - part files, resume records, atomic promotion
//! - [`transport`] - range-capable fetch seam (reqwest adapter included)
//! - [`orchestrator`] - the queue/worker coordinator tying it together
//!
//! Data flows one way: orchestrator → rate limiter → quality gate →
//! transport → file writer → progress sink. Failures flow back through the
//! classifier into the retry engine, which feeds the next decision to the
//! orchestrator.

pub mod cancel;
pub mod classify;
mod error;
pub mod orchestrator;
pub mod quality;
pub mod rate_limit;
pub mod retry;
pub mod task;
pub mod transport;
pub mod writer;

pub use cancel::{StopKind, StopToken};
pub use classify::{DownloadFailure, ErrorCategory, classify};
pub use error::TransferError;
pub use orchestrator::{DownloadOrchestrator, FailureReport, OrchestratorError};
pub use quality::{
    HttpProbe, NetworkQualityMonitor, NetworkQualitySample, NetworkStatus, ProbeReport,
    QualityProbe, QualityTier,
};
pub use rate_limit::{PriorityRateLimiter, SlidingWindowLimiter, parse_retry_after};
pub use retry::{DEFAULT_MAX_RETRIES, RetryDecision, RetryPolicy};
pub use task::{
    AttemptError, ChannelSink, DownloadTask, NullSink, Priority, ProgressSink, ProgressSnapshot,
    SpeedCalculator, TaskStatus, is_valid_chart_id,
};
pub use transport::{ChartTransport, HttpTransport, TransferStream};
pub use writer::{PartFileWriter, ResumeRecord, normalized_progress, part_path_for};
