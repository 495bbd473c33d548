//! Download task model: priorities, lifecycle states, progress snapshots.
//!
//! Tasks are owned exclusively by the orchestrator and mutated only through
//! its transition functions; everything here is the data those transitions
//! operate on.

use std::fmt;
use std::sync::OnceLock;
use std::time::{Duration, Instant, SystemTime};

use regex::Regex;
use serde::{Deserialize, Serialize};

use super::classify::ErrorCategory;

/// Scheduling priority for a chart download.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    /// Background refreshes.
    Low,
    /// Default for user-requested charts.
    Normal,
    /// Charts for the active route.
    High,
    /// Charts needed for the vessel's current position.
    Critical,
}

impl Priority {
    /// Numeric rank; higher means more urgent.
    #[must_use]
    pub fn rank(self) -> u8 {
        match self {
            Self::Low => 0,
            Self::Normal => 1,
            Self::High => 2,
            Self::Critical => 3,
        }
    }

    /// Stable string form used in persisted rows.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Normal => "normal",
            Self::High => "high",
            Self::Critical => "critical",
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Priority {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "low" => Ok(Self::Low),
            "normal" => Ok(Self::Normal),
            "high" => Ok(Self::High),
            "critical" => Ok(Self::Critical),
            _ => Err(format!("invalid priority: {s}")),
        }
    }
}

/// Lifecycle state of a download task.
///
/// `queued → downloading ⇄ paused → {completed | failed | cancelled}`;
/// `paused` returns to `queued` on resume. Terminal states stay terminal
/// unless the chart is explicitly re-enqueued as a new task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    /// Waiting for a scheduling slot.
    Queued,
    /// Transfer in flight.
    Downloading,
    /// Cooperatively stopped with a resume record on disk.
    Paused,
    /// Final file promoted; no part file remains.
    Completed,
    /// Attempt budget exhausted or permanent failure.
    Failed,
    /// Explicitly cancelled; part file and resume record removed.
    Cancelled,
}

impl TaskStatus {
    /// Whether the state is terminal.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// Stable string form used in persisted rows.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Downloading => "downloading",
            Self::Paused => "paused",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(Self::Queued),
            "downloading" => Ok(Self::Downloading),
            "paused" => Ok(Self::Paused),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            _ => Err(format!("invalid task status: {s}")),
        }
    }
}

/// Checks a chart cell id against the ENC naming convention: a two-letter
/// producer code, a usage-band digit, then 2–5 alphanumerics (e.g.
/// `US5WA11M`).
#[must_use]
pub fn is_valid_chart_id(chart_id: &str) -> bool {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    let re = PATTERN.get_or_init(|| {
        Regex::new(r"^[A-Z]{2}[0-9][A-Z0-9]{2,5}$").unwrap_or_else(|e| {
            // The pattern is a literal; a failure here is a programming error.
            panic!("invalid chart id pattern: {e}")
        })
    });
    re.is_match(chart_id)
}

/// One failed attempt recorded for the exhaustion report.
#[derive(Debug, Clone)]
pub struct AttemptError {
    /// 1-indexed attempt number that failed.
    pub attempt: u32,
    /// Taxonomy category of the failure.
    pub category: ErrorCategory,
    /// Human-readable message captured at failure time.
    pub message: String,
    /// When the attempt failed.
    pub at: SystemTime,
}

/// A download task as tracked by the orchestrator.
#[derive(Debug, Clone)]
pub struct DownloadTask {
    /// Unique chart cell id.
    pub chart_id: String,
    /// Source artifact URL.
    pub source_url: String,
    /// Scheduling priority.
    pub priority: Priority,
    /// Lifecycle state.
    pub status: TaskStatus,
    /// Normalized progress in [0, 1]; exactly 1.0 on completion.
    pub progress: f64,
    /// Fully acknowledged bytes on disk.
    pub bytes_downloaded: u64,
    /// Expected total bytes once the server reports them.
    pub total_bytes: Option<u64>,
    /// Attempts made so far (1-indexed during a run).
    pub attempts: u32,
    /// Category of the most recent failure, if any.
    pub last_error_category: Option<ErrorCategory>,
    /// Every failed attempt in the current run, for diagnostics.
    pub attempt_errors: Vec<AttemptError>,
    /// When the task was enqueued.
    pub created_at: SystemTime,
    /// Last state mutation.
    pub updated_at: SystemTime,
    /// Expected SHA-256 of the finished artifact, when the catalog provides
    /// one. Verified before promotion.
    pub expected_sha256: Option<String>,
    /// Transfer-rate tracker for snapshot speed/ETA fields.
    pub speed: SpeedCalculator,
}

impl DownloadTask {
    /// Creates a freshly queued task.
    #[must_use]
    pub fn new(chart_id: impl Into<String>, source_url: impl Into<String>, priority: Priority) -> Self {
        let now = SystemTime::now();
        Self {
            chart_id: chart_id.into(),
            source_url: source_url.into(),
            priority,
            status: TaskStatus::Queued,
            progress: 0.0,
            bytes_downloaded: 0,
            total_bytes: None,
            attempts: 0,
            last_error_category: None,
            attempt_errors: Vec::new(),
            created_at: now,
            updated_at: now,
            expected_sha256: None,
            speed: SpeedCalculator::default_window(),
        }
    }

    /// Builds a progress snapshot of the current state.
    #[must_use]
    pub fn snapshot(&self) -> ProgressSnapshot {
        let bytes_per_second = self.speed.bytes_per_second();
        let eta_seconds = match (self.total_bytes, bytes_per_second) {
            (Some(total), Some(speed)) if speed > 0 && total > self.bytes_downloaded => {
                Some((total - self.bytes_downloaded) / speed)
            }
            _ => None,
        };
        ProgressSnapshot {
            chart_id: self.chart_id.clone(),
            status: self.status,
            progress: self.progress,
            bytes_downloaded: self.bytes_downloaded,
            total_bytes: self.total_bytes,
            error_category: self.last_error_category,
            bytes_per_second,
            eta_seconds,
            timestamp: SystemTime::now(),
        }
    }
}

/// Point-in-time view of a task, delivered to the progress sink on every
/// state mutation. Per chart id, snapshots arrive with non-decreasing
/// offsets; there is no ordering guarantee across chart ids.
#[derive(Debug, Clone, Serialize)]
pub struct ProgressSnapshot {
    /// Chart cell id.
    pub chart_id: String,
    /// Lifecycle state at snapshot time.
    pub status: TaskStatus,
    /// Normalized progress in [0, 1].
    pub progress: f64,
    /// Fully acknowledged bytes.
    pub bytes_downloaded: u64,
    /// Expected total, when known.
    pub total_bytes: Option<u64>,
    /// Most recent failure category, if any.
    #[serde(serialize_with = "serialize_category")]
    pub error_category: Option<ErrorCategory>,
    /// Recent transfer rate, when measurable.
    pub bytes_per_second: Option<u64>,
    /// Estimated seconds remaining, when computable.
    pub eta_seconds: Option<u64>,
    /// When the snapshot was taken.
    pub timestamp: SystemTime,
}

fn serialize_category<S>(
    category: &Option<ErrorCategory>,
    serializer: S,
) -> Result<S::Ok, S::Error>
where
    S: serde::Serializer,
{
    match category {
        Some(c) => serializer.serialize_some(c.as_str()),
        None => serializer.serialize_none(),
    }
}

/// Receives progress snapshots from the orchestrator.
///
/// Implementations must not block: snapshots are emitted from inside the
/// orchestrator's transition functions.
pub trait ProgressSink: Send + Sync + fmt::Debug {
    /// Called on every task state mutation, at-least-once.
    fn on_progress(&self, snapshot: ProgressSnapshot);
}

/// Sink that forwards snapshots into an unbounded channel; the common
/// adapter for UI/state layers consuming progress asynchronously.
#[derive(Debug)]
pub struct ChannelSink {
    tx: tokio::sync::mpsc::UnboundedSender<ProgressSnapshot>,
}

impl ChannelSink {
    /// Creates the sink and the receiving half.
    #[must_use]
    pub fn new() -> (Self, tokio::sync::mpsc::UnboundedReceiver<ProgressSnapshot>) {
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl ProgressSink for ChannelSink {
    fn on_progress(&self, snapshot: ProgressSnapshot) {
        // A dropped receiver just means nobody is watching anymore.
        let _ = self.tx.send(snapshot);
    }
}

/// Sink that discards snapshots; used where no observer is attached.
#[derive(Debug, Default)]
pub struct NullSink;

impl ProgressSink for NullSink {
    fn on_progress(&self, _snapshot: ProgressSnapshot) {}
}

/// Transfer-rate estimator over a sliding sample window.
///
/// Samples of cumulative byte counts are kept for a few seconds; the rate is
/// the byte delta across the window, which smooths out chunk-level jitter on
/// slow links.
#[derive(Debug, Clone)]
pub struct SpeedCalculator {
    samples: std::collections::VecDeque<(Instant, u64)>,
    window: Duration,
    max_samples: usize,
}

impl SpeedCalculator {
    /// Creates a calculator with the given sample window.
    #[must_use]
    pub fn new(window: Duration) -> Self {
        Self {
            samples: std::collections::VecDeque::with_capacity(64),
            window,
            max_samples: 64,
        }
    }

    /// Default 5-second window.
    #[must_use]
    pub fn default_window() -> Self {
        Self::new(Duration::from_secs(5))
    }

    /// Records the cumulative downloaded byte count.
    pub fn record(&mut self, downloaded_bytes: u64) {
        let now = Instant::now();
        while let Some((at, _)) = self.samples.front() {
            if now.duration_since(*at) > self.window {
                self.samples.pop_front();
            } else {
                break;
            }
        }
        self.samples.push_back((now, downloaded_bytes));
        while self.samples.len() > self.max_samples {
            self.samples.pop_front();
        }
    }

    /// Average rate across the window, when at least two samples exist.
    #[must_use]
    pub fn bytes_per_second(&self) -> Option<u64> {
        if self.samples.len() < 2 {
            return None;
        }
        let (first_at, first_bytes) = self.samples.front()?;
        let (last_at, last_bytes) = self.samples.back()?;
        let elapsed = last_at.duration_since(*first_at).as_secs_f64().max(0.001);
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        Some((last_bytes.saturating_sub(*first_bytes) as f64 / elapsed) as u64)
    }

    /// Clears all samples, e.g. across a pause.
    pub fn reset(&mut self) {
        self.samples.clear();
    }
}
