//! Queue/worker coordinator for chart downloads.
//!
//! The orchestrator owns the task map and is the only code that mutates it;
//! every command and every worker outcome flows through transition functions
//! that lock the queue state, mutate, emit a progress snapshot, and persist.
//! The rate limiter and the network-quality monitor are injected as explicit
//! dependencies so tests substitute deterministic fakes.
//!
//! Scheduling picks the highest-priority queued task (FIFO within a tier),
//! consults the quality monitor, and dispatches a worker per task up to the
//! concurrency bound. When the link is unsuitable the queue head stays put
//! and scheduling is retried on the monitor's next status tick; a link that
//! never recovers keeps tasks queued indefinitely, which is the documented
//! tradeoff rather than a bug.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use futures_util::StreamExt;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};
use url::Url;

use crate::store::{PersistedTask, StoreError, TaskStore};

use super::cancel::{StopHandle, StopKind, StopToken, stop_channel};
use super::classify::{DownloadFailure, ErrorCategory, classify};
use super::error::TransferError;
use super::quality::NetworkQualityMonitor;
use super::rate_limit::PriorityRateLimiter;
use super::retry::{RetryDecision, RetryPolicy};
use super::task::{
    AttemptError, DownloadTask, Priority, ProgressSink, ProgressSnapshot, TaskStatus,
    is_valid_chart_id,
};
use super::transport::ChartTransport;
use super::writer::{PartFileWriter, ResumeRecord, normalized_progress, part_path_for};

/// Persist progress to the store at most once per this many new bytes; every
/// chunk still updates the in-memory task and the progress sink.
const PERSIST_EVERY_BYTES: u64 = 256 * 1024;

/// How long `shutdown` waits for in-flight workers to wind down.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Errors from orchestrator commands.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    /// Chart id does not match the ENC cell naming convention.
    #[error("invalid chart id: {chart_id}")]
    InvalidChartId {
        /// The rejected id.
        chart_id: String,
    },

    /// No tracked task for the chart id.
    #[error("unknown chart: {chart_id}")]
    UnknownChart {
        /// The unknown id.
        chart_id: String,
    },

    /// The command does not apply in the task's current state.
    #[error("cannot {action} chart {chart_id} in state {from}")]
    InvalidTransition {
        /// The chart id.
        chart_id: String,
        /// State the task was in.
        from: TaskStatus,
        /// The rejected command.
        action: &'static str,
    },

    /// Concurrency bound must be positive.
    #[error("invalid max concurrent downloads: {value} (must be > 0)")]
    InvalidConcurrency {
        /// The rejected value.
        value: usize,
    },

    /// Persistence failed.
    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

/// Structured report for a task whose attempt budget was exhausted or that
/// hit a permanent failure. Carries every error seen in the run, not just
/// the last one.
#[derive(Debug, Clone)]
pub struct FailureReport {
    /// The failed chart.
    pub chart_id: String,
    /// Category of the final failure.
    pub category: ErrorCategory,
    /// Message of the final failure.
    pub message: String,
    /// What the user should do about it.
    pub recommended_action: &'static str,
    /// Whether a subsequent `resume` is expected to succeed.
    pub resume_expected: bool,
    /// Retries performed (attempts minus the initial one).
    pub retry_count: u32,
    /// Wall-clock time from first attempt to the failed transition.
    pub elapsed: Duration,
    /// Every failed attempt in order.
    pub errors: Vec<AttemptError>,
    /// Partial progress at failure time.
    pub bytes_downloaded: u64,
    /// Expected total, when it was learned.
    pub total_bytes: Option<u64>,
}

/// Mutable queue state. Owned by [`Inner::state`]; nothing outside the
/// transition functions may touch it.
#[derive(Debug)]
struct QueueState {
    tasks: HashMap<String, DownloadTask>,
    /// Chart ids waiting for a slot, enqueue order preserved.
    pending: Vec<String>,
    /// Stop handles of in-flight transfers; its size is the active count.
    active: HashMap<String, StopHandle>,
    max_concurrent: usize,
    paused_all: bool,
    failure_reports: HashMap<String, FailureReport>,
    scheduler: Option<JoinHandle<()>>,
}

struct Inner {
    charts_dir: PathBuf,
    limiter: Arc<PriorityRateLimiter>,
    monitor: Arc<NetworkQualityMonitor>,
    transport: Arc<dyn ChartTransport>,
    store: TaskStore,
    policy: RetryPolicy,
    sink: Arc<dyn ProgressSink>,
    attempt_timeout: Duration,
    state: Mutex<QueueState>,
}

impl std::fmt::Debug for Inner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DownloadOrchestrator")
            .field("charts_dir", &self.charts_dir)
            .finish_non_exhaustive()
    }
}

/// How a worker run ended.
#[derive(Debug)]
enum TaskOutcome {
    Completed(PathBuf),
    Stopped(StopKind),
    Failed(DownloadFailure),
}

/// Why a single attempt ended without completing.
#[derive(Debug)]
enum AttemptEnd {
    Stopped(StopKind),
    Failed(TransferError),
}

/// How the chunk loop ended inside the per-attempt timeout.
enum StreamEnd {
    Done,
    Stopped(StopKind),
}

/// Composition root of the download subsystem.
///
/// Cheap to clone; all clones share one queue.
#[derive(Debug, Clone)]
pub struct DownloadOrchestrator {
    inner: Arc<Inner>,
}

impl DownloadOrchestrator {
    /// Creates an orchestrator.
    ///
    /// # Arguments
    ///
    /// * `charts_dir` - directory receiving final artifacts and part files
    /// * `limiter` / `monitor` - shared admission gates, injected
    /// * `transport` - range-capable fetch primitive
    /// * `store` - queue/resume persistence
    /// * `policy` - retry policy for transfers
    /// * `sink` - progress observer; must not block
    /// * `max_concurrent` - concurrency bound, must be positive
    /// * `attempt_timeout` - per-attempt base timeout, scaled by the
    ///   monitor's multiplier under poor conditions
    ///
    /// # Errors
    ///
    /// Returns [`OrchestratorError::InvalidConcurrency`] for a zero bound.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        charts_dir: impl Into<PathBuf>,
        limiter: Arc<PriorityRateLimiter>,
        monitor: Arc<NetworkQualityMonitor>,
        transport: Arc<dyn ChartTransport>,
        store: TaskStore,
        policy: RetryPolicy,
        sink: Arc<dyn ProgressSink>,
        max_concurrent: usize,
        attempt_timeout: Duration,
    ) -> Result<Self, OrchestratorError> {
        if max_concurrent == 0 {
            return Err(OrchestratorError::InvalidConcurrency { value: 0 });
        }
        Ok(Self {
            inner: Arc::new(Inner {
                charts_dir: charts_dir.into(),
                limiter,
                monitor,
                transport,
                store,
                policy,
                sink,
                attempt_timeout,
                state: Mutex::new(QueueState {
                    tasks: HashMap::new(),
                    pending: Vec::new(),
                    active: HashMap::new(),
                    max_concurrent,
                    paused_all: false,
                    failure_reports: HashMap::new(),
                    scheduler: None,
                }),
            }),
        })
    }

    /// Starts the scheduler tick: every status sample from the quality
    /// monitor re-runs a scheduling pass, which is what lets a queue head
    /// blocked on an unsuitable link proceed once conditions recover.
    /// Idempotent.
    pub async fn start(&self) {
        let mut state = self.inner.state.lock().await;
        if state.scheduler.is_some() {
            return;
        }
        let inner = Arc::clone(&self.inner);
        state.scheduler = Some(tokio::spawn(async move {
            let mut status_rx = inner.monitor.subscribe();
            while status_rx.changed().await.is_ok() {
                Inner::schedule(&inner).await;
            }
        }));
        drop(state);
        Inner::schedule(&self.inner).await;
    }

    /// Stops the scheduler, asks in-flight transfers to pause (preserving
    /// resume records), and waits briefly for them to wind down.
    pub async fn shutdown(&self) {
        {
            let mut state = self.inner.state.lock().await;
            if let Some(handle) = state.scheduler.take() {
                handle.abort();
            }
            state.paused_all = true;
            for handle in state.active.values() {
                handle.signal(StopKind::Pause);
            }
        }

        let deadline = Instant::now() + SHUTDOWN_GRACE;
        loop {
            if self.inner.state.lock().await.active.is_empty() {
                break;
            }
            if Instant::now() >= deadline {
                warn!("shutdown grace period elapsed with transfers still active");
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        info!("orchestrator shut down");
    }

    /// Adds a chart to the queue and triggers scheduling.
    ///
    /// Enqueueing an id that is already tracked and not terminal is a warned
    /// no-op. A terminal task (completed/failed/cancelled) is replaced by a
    /// fresh one.
    ///
    /// # Errors
    ///
    /// Returns [`OrchestratorError::InvalidChartId`] for ids that do not
    /// look like ENC cell names, or a store error if persistence fails.
    #[instrument(skip(self, source_url), fields(url = %source_url))]
    pub async fn enqueue(
        &self,
        chart_id: &str,
        source_url: &str,
        priority: Priority,
    ) -> Result<(), OrchestratorError> {
        self.enqueue_with_checksum(chart_id, source_url, priority, None)
            .await
    }

    /// [`enqueue`](Self::enqueue) with an expected SHA-256 digest verified
    /// before the artifact is promoted.
    ///
    /// # Errors
    ///
    /// Same as [`enqueue`](Self::enqueue).
    pub async fn enqueue_with_checksum(
        &self,
        chart_id: &str,
        source_url: &str,
        priority: Priority,
        expected_sha256: Option<String>,
    ) -> Result<(), OrchestratorError> {
        if !is_valid_chart_id(chart_id) {
            return Err(OrchestratorError::InvalidChartId {
                chart_id: chart_id.to_string(),
            });
        }

        {
            let mut state = self.inner.state.lock().await;
            if let Some(existing) = state.tasks.get(chart_id) {
                if !existing.status.is_terminal() {
                    warn!(chart_id, status = %existing.status, "chart already tracked, ignoring enqueue");
                    return Ok(());
                }
                debug!(chart_id, "re-enqueueing terminal chart as a new task");
                state.failure_reports.remove(chart_id);
            }

            let mut task = DownloadTask::new(chart_id, source_url, priority);
            task.expected_sha256 = expected_sha256;
            self.inner.emit(&task);
            self.inner.store.upsert_task(&task).await?;
            state.tasks.insert(chart_id.to_string(), task);
            state.pending.retain(|id| id != chart_id);
            state.pending.push(chart_id.to_string());
            info!(chart_id, priority = %priority, "chart enqueued");
        }

        Inner::schedule(&self.inner).await;
        Ok(())
    }

    /// Cooperatively pauses an in-flight download. The worker persists a
    /// resume record at the last acknowledged offset, frees its slot, and
    /// transitions the task to paused.
    ///
    /// # Errors
    ///
    /// Returns [`OrchestratorError::UnknownChart`] or
    /// [`OrchestratorError::InvalidTransition`] when the task is not
    /// downloading.
    #[instrument(skip(self))]
    pub async fn pause(&self, chart_id: &str) -> Result<(), OrchestratorError> {
        let state = self.inner.state.lock().await;
        let task = state
            .tasks
            .get(chart_id)
            .ok_or_else(|| OrchestratorError::UnknownChart {
                chart_id: chart_id.to_string(),
            })?;
        if task.status != TaskStatus::Downloading {
            return Err(OrchestratorError::InvalidTransition {
                chart_id: chart_id.to_string(),
                from: task.status,
                action: "pause",
            });
        }
        if let Some(handle) = state.active.get(chart_id) {
            handle.signal(StopKind::Pause);
            info!(chart_id, "pause requested");
        }
        Ok(())
    }

    /// Re-enqueues a paused task; the existing resume record makes the next
    /// attempt continue from the recorded offset.
    ///
    /// # Errors
    ///
    /// Returns [`OrchestratorError::UnknownChart`] or
    /// [`OrchestratorError::InvalidTransition`] when the task is not paused.
    #[instrument(skip(self))]
    pub async fn resume(&self, chart_id: &str) -> Result<(), OrchestratorError> {
        {
            let mut state = self.inner.state.lock().await;
            let task = state
                .tasks
                .get_mut(chart_id)
                .ok_or_else(|| OrchestratorError::UnknownChart {
                    chart_id: chart_id.to_string(),
                })?;
            if task.status != TaskStatus::Paused {
                return Err(OrchestratorError::InvalidTransition {
                    chart_id: chart_id.to_string(),
                    from: task.status,
                    action: "resume",
                });
            }
            task.status = TaskStatus::Queued;
            task.updated_at = SystemTime::now();
            let snapshot_task = task.clone();
            self.inner.emit(&snapshot_task);
            self.inner.store.upsert_task(&snapshot_task).await?;
            state.pending.push(chart_id.to_string());
            info!(chart_id, "resumed into queue");
        }
        Inner::schedule(&self.inner).await;
        Ok(())
    }

    /// Cancels a task: stops any in-flight transfer and deletes the part
    /// file and resume record.
    ///
    /// # Errors
    ///
    /// Returns [`OrchestratorError::UnknownChart`] or
    /// [`OrchestratorError::InvalidTransition`] for terminal tasks.
    #[instrument(skip(self))]
    pub async fn cancel(&self, chart_id: &str) -> Result<(), OrchestratorError> {
        let mut state = self.inner.state.lock().await;
        let status = state
            .tasks
            .get(chart_id)
            .ok_or_else(|| OrchestratorError::UnknownChart {
                chart_id: chart_id.to_string(),
            })?
            .status;

        match status {
            TaskStatus::Downloading => {
                if let Some(handle) = state.active.get(chart_id) {
                    handle.signal(StopKind::Cancel);
                    info!(chart_id, "cancel requested");
                }
                Ok(())
            }
            TaskStatus::Queued | TaskStatus::Paused => {
                let snapshot_task = {
                    let Some(task) = state.tasks.get_mut(chart_id) else {
                        return Ok(());
                    };
                    task.status = TaskStatus::Cancelled;
                    task.updated_at = SystemTime::now();
                    task.clone()
                };
                let part_path = part_path_for(&self.inner.final_path_for(
                    chart_id,
                    &snapshot_task.source_url,
                ));
                state.pending.retain(|id| id != chart_id);
                self.inner.emit(&snapshot_task);
                self.inner.store.upsert_task(&snapshot_task).await?;
                self.inner.store.clear_resume(chart_id).await?;
                drop(state);
                let _ = tokio::fs::remove_file(&part_path).await;
                info!(chart_id, "cancelled");
                Ok(())
            }
            status => Err(OrchestratorError::InvalidTransition {
                chart_id: chart_id.to_string(),
                from: status,
                action: "cancel",
            }),
        }
    }

    /// Sets the global pause flag; no new transfers are dispatched while it
    /// is set. In-flight transfers run to completion.
    pub async fn pause_all(&self) {
        self.inner.state.lock().await.paused_all = true;
        info!("global pause set");
    }

    /// Clears the global pause flag and re-triggers scheduling.
    pub async fn resume_all(&self) {
        self.inner.state.lock().await.paused_all = false;
        info!("global pause cleared");
        Inner::schedule(&self.inner).await;
    }

    /// Updates the concurrency bound and re-triggers scheduling.
    ///
    /// # Errors
    ///
    /// Returns [`OrchestratorError::InvalidConcurrency`] for zero.
    pub async fn set_max_concurrent_downloads(&self, n: usize) -> Result<(), OrchestratorError> {
        if n == 0 {
            return Err(OrchestratorError::InvalidConcurrency { value: 0 });
        }
        self.inner.state.lock().await.max_concurrent = n;
        info!(max_concurrent = n, "concurrency bound updated");
        Inner::schedule(&self.inner).await;
        Ok(())
    }

    /// The persisted resume record for a chart, if any.
    ///
    /// # Errors
    ///
    /// Returns a store error if the read fails.
    pub async fn get_resume_data(
        &self,
        chart_id: &str,
    ) -> Result<Option<ResumeRecord>, OrchestratorError> {
        Ok(self.inner.store.load_resume(chart_id).await?)
    }

    /// Every persisted task row, for state inspection across restarts.
    ///
    /// # Errors
    ///
    /// Returns a store error if the read fails.
    pub async fn get_persisted_state(&self) -> Result<Vec<PersistedTask>, OrchestratorError> {
        Ok(self.inner.store.all().await?)
    }

    /// Reloads queued/paused rows from the store into the in-memory queue.
    /// Reloaded tasks are **not** auto-promoted to downloading; call
    /// [`resume`](Self::resume) for paused charts and [`start`](Self::start)
    /// or any scheduling command for queued ones.
    ///
    /// Returns the number of tasks reloaded.
    ///
    /// # Errors
    ///
    /// Returns a store error if the read fails.
    #[instrument(skip(self))]
    pub async fn restore(&self) -> Result<usize, OrchestratorError> {
        let rows = self.inner.store.load_restorable().await?;
        let mut state = self.inner.state.lock().await;
        let mut reloaded = 0;
        for row in rows {
            if state.tasks.contains_key(&row.chart_id) {
                continue;
            }
            let status = row.status()?;
            let priority = row.priority()?;
            let mut task = DownloadTask::new(&row.chart_id, &row.url, priority);
            task.status = status;
            task.bytes_downloaded = u64::try_from(row.bytes_downloaded).unwrap_or(0);
            task.total_bytes = row.total_bytes.and_then(|t| u64::try_from(t).ok());
            task.progress = normalized_progress(task.bytes_downloaded, task.total_bytes);
            task.last_error_category = row.last_error_category();
            if status == TaskStatus::Queued {
                state.pending.push(row.chart_id.clone());
            }
            state.tasks.insert(row.chart_id.clone(), task);
            reloaded += 1;
        }
        info!(reloaded, "restored persisted queue state");
        Ok(reloaded)
    }

    /// Snapshot of one tracked task.
    pub async fn task_snapshot(&self, chart_id: &str) -> Option<ProgressSnapshot> {
        self.inner
            .state
            .lock()
            .await
            .tasks
            .get(chart_id)
            .map(DownloadTask::snapshot)
    }

    /// Snapshots of every tracked task, unordered.
    pub async fn snapshots(&self) -> Vec<ProgressSnapshot> {
        self.inner
            .state
            .lock()
            .await
            .tasks
            .values()
            .map(DownloadTask::snapshot)
            .collect()
    }

    /// The structured failure report for a failed chart, if any.
    pub async fn failure_report(&self, chart_id: &str) -> Option<FailureReport> {
        self.inner
            .state
            .lock()
            .await
            .failure_reports
            .get(chart_id)
            .cloned()
    }

    /// Number of transfers currently in flight.
    pub async fn active_count(&self) -> usize {
        self.inner.state.lock().await.active.len()
    }
}

impl Inner {
    /// Emits a snapshot to the progress sink. Called inside transition
    /// functions, so per-chart snapshots are naturally ordered.
    fn emit(&self, task: &DownloadTask) {
        self.sink.on_progress(task.snapshot());
    }

    /// Final artifact path: last URL path segment, falling back to
    /// `<chart_id>.zip`.
    fn final_path_for(&self, chart_id: &str, url: &str) -> PathBuf {
        let filename = Url::parse(url)
            .ok()
            .and_then(|u| {
                u.path_segments()
                    .and_then(|mut segments| segments.next_back().map(str::to_string))
            })
            .filter(|name| !name.is_empty())
            .unwrap_or_else(|| format!("{chart_id}.zip"));
        self.charts_dir.join(filename)
    }

    /// One scheduling pass: dispatch queued tasks while slots remain, the
    /// queue is non-empty, the global pause flag is clear, and the link is
    /// suitable.
    fn schedule<'a>(
        inner: &'a Arc<Self>,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = ()> + Send + 'a>> {
        Box::pin(async move {
        loop {
            let dispatch = {
                let mut state = inner.state.lock().await;
                if state.paused_all
                    || state.active.len() >= state.max_concurrent
                    || state.pending.is_empty()
                {
                    return;
                }

                // Highest priority first, enqueue order within a tier.
                let Some(next_index) = select_next(&state) else {
                    return;
                };

                if !inner.monitor.is_suitable_for_chart_download() {
                    // Leave the head in place; the monitor's next status
                    // tick re-runs this pass.
                    debug!("link unsuitable for chart download, deferring dispatch");
                    return;
                }

                let chart_id = state.pending.remove(next_index);
                let Some(task) = state.tasks.get_mut(&chart_id) else {
                    warn!(chart_id = %chart_id, "pending id without task entry, dropping");
                    continue;
                };
                task.status = TaskStatus::Downloading;
                task.updated_at = SystemTime::now();
                task.attempts = 0;
                task.attempt_errors.clear();
                task.speed.reset();
                let snapshot_task = task.clone();

                let (handle, token) = stop_channel();
                state.active.insert(chart_id.clone(), handle);
                inner.emit(&snapshot_task);
                Some((chart_id, snapshot_task, token))
            };

            let Some((chart_id, task, token)) = dispatch else {
                return;
            };
            if let Err(e) = inner.store.upsert_task(&task).await {
                warn!(chart_id = %chart_id, error = %e, "failed to persist downloading transition");
            }

            info!(chart_id = %chart_id, priority = %task.priority, "dispatching download");
            let worker_inner = Arc::clone(inner);
            tokio::spawn(async move {
                Self::run_task(worker_inner, chart_id, task.source_url, task.priority, token)
                    .await;
            });
        }
        })
    }

    /// Drives one task through attempt/retry cycles until a terminal
    /// outcome, then applies the closing transition and reschedules.
    #[instrument(skip(inner, url, token), fields(priority = %priority))]
    async fn run_task(
        inner: Arc<Self>,
        chart_id: String,
        url: String,
        priority: Priority,
        mut token: StopToken,
    ) {
        let run_started = Instant::now();
        let mut attempt: u32 = 0;

        let outcome = loop {
            attempt += 1;
            {
                let mut state = inner.state.lock().await;
                if let Some(task) = state.tasks.get_mut(&chart_id) {
                    task.attempts = attempt;
                    task.updated_at = SystemTime::now();
                }
            }
            debug!(chart_id = %chart_id, attempt, "starting attempt");

            // Admission: rate-limit permit at the task's priority, raced
            // against stop so pause/cancel interrupt the wait.
            let stopped = tokio::select! {
                biased;
                kind = token.stopped() => Some(kind),
                () = inner.limiter.acquire(priority) => None,
            };
            if let Some(kind) = stopped {
                break TaskOutcome::Stopped(kind);
            }

            let timeout = inner
                .attempt_timeout
                .mul_f64(inner.monitor.timeout_multiplier());

            match Self::transfer_attempt(&inner, &chart_id, &url, timeout, &mut token).await {
                Ok(final_path) => break TaskOutcome::Completed(final_path),
                Err(AttemptEnd::Stopped(kind)) => break TaskOutcome::Stopped(kind),
                Err(AttemptEnd::Failed(raw)) => {
                    let failure = classify(&raw);
                    {
                        let mut state = inner.state.lock().await;
                        if let Some(task) = state.tasks.get_mut(&chart_id) {
                            task.last_error_category = Some(failure.category);
                            task.attempt_errors.push(AttemptError {
                                attempt,
                                category: failure.category,
                                message: failure.message.clone(),
                                at: SystemTime::now(),
                            });
                            task.updated_at = SystemTime::now();
                        }
                    }

                    let retry_after = failure.retry_after();
                    match inner.policy.decide(failure.category, attempt) {
                        RetryDecision::Retry {
                            delay: backoff_delay,
                            next_attempt,
                        } => {
                            // A server-mandated Retry-After overrides the
                            // computed backoff for this cycle.
                            if let Some(mandated) = retry_after {
                                inner.limiter.record_rate_limit(mandated);
                            }
                            let delay = retry_after.unwrap_or(backoff_delay);
                            info!(
                                chart_id = %chart_id,
                                next_attempt,
                                delay_ms = delay.as_millis(),
                                using_retry_after = retry_after.is_some(),
                                error = %failure,
                                "retrying download"
                            );
                            let stopped = tokio::select! {
                                biased;
                                kind = token.stopped() => Some(kind),
                                () = tokio::time::sleep(delay) => None,
                            };
                            if let Some(kind) = stopped {
                                break TaskOutcome::Stopped(kind);
                            }
                        }
                        RetryDecision::DoNotRetry { reason } => {
                            debug!(chart_id = %chart_id, %reason, "not retrying");
                            break TaskOutcome::Failed(failure);
                        }
                    }
                }
            }
        };

        Self::finish_task(&inner, &chart_id, outcome, run_started, attempt).await;
        Self::schedule(&inner).await;
    }

    /// One transfer attempt: open the part file (resuming when a record
    /// exists), stream chunks under the per-attempt timeout, and promote on
    /// completion. On failure the acknowledged progress is flushed and
    /// recorded so the next attempt resumes instead of starting over.
    async fn transfer_attempt(
        inner: &Arc<Self>,
        chart_id: &str,
        url: &str,
        timeout: Duration,
        token: &mut StopToken,
    ) -> Result<PathBuf, AttemptEnd> {
        let final_path = inner.final_path_for(chart_id, url);
        let resume = match inner.store.load_resume(chart_id).await {
            Ok(record) => record,
            Err(e) => {
                warn!(chart_id, error = %e, "failed to load resume record, starting fresh");
                None
            }
        };

        let expected_sha256 = {
            let state = inner.state.lock().await;
            state
                .tasks
                .get(chart_id)
                .and_then(|t| t.expected_sha256.clone())
        };

        let mut writer = PartFileWriter::begin(
            chart_id,
            &final_path,
            resume.as_ref(),
            expected_sha256.is_some(),
        )
        .await
        .map_err(AttemptEnd::Failed)?;
        let offset = writer.resume_offset();

        let streamed = tokio::time::timeout(
            timeout,
            Self::stream_body(inner, chart_id, url, timeout, token, &mut writer, offset),
        )
        .await;

        match streamed {
            Err(_elapsed) => {
                Self::record_partial(inner, chart_id, writer).await;
                Err(AttemptEnd::Failed(TransferError::timeout(url)))
            }
            Ok(Err(raw)) => {
                Self::record_partial(inner, chart_id, writer).await;
                Err(AttemptEnd::Failed(raw))
            }
            Ok(Ok(StreamEnd::Stopped(StopKind::Pause))) => {
                match writer.pause().await {
                    Ok(record) => {
                        if let Err(e) = inner.store.save_resume(&record).await {
                            warn!(chart_id, error = %e, "failed to persist resume record");
                        }
                    }
                    Err(e) => warn!(chart_id, error = %e, "failed to flush part file on pause"),
                }
                Err(AttemptEnd::Stopped(StopKind::Pause))
            }
            Ok(Ok(StreamEnd::Stopped(StopKind::Cancel))) => {
                if let Err(e) = writer.discard().await {
                    warn!(chart_id, error = %e, "failed to remove part file on cancel");
                }
                if let Err(e) = inner.store.clear_resume(chart_id).await {
                    warn!(chart_id, error = %e, "failed to clear resume record on cancel");
                }
                Err(AttemptEnd::Stopped(StopKind::Cancel))
            }
            Ok(Ok(StreamEnd::Done)) => {
                let promoted = writer.finalize(expected_sha256.as_deref()).await;
                match promoted {
                    Ok(path) => {
                        if let Err(e) = inner.store.clear_resume(chart_id).await {
                            warn!(chart_id, error = %e, "failed to clear resume record");
                        }
                        Ok(path)
                    }
                    Err(raw) => {
                        // Checksum failures already removed the part file;
                        // clear the record so a retry starts clean.
                        if matches!(raw, TransferError::Checksum { .. }) {
                            let _ = inner.store.clear_resume(chart_id).await;
                        }
                        Err(AttemptEnd::Failed(raw))
                    }
                }
            }
        }
    }

    /// The chunk loop: fetch from the transport (ranged when resuming),
    /// write whole chunks, update progress, and watch the stop token between
    /// chunks.
    async fn stream_body(
        inner: &Arc<Self>,
        chart_id: &str,
        url: &str,
        timeout: Duration,
        token: &mut StopToken,
        writer: &mut PartFileWriter,
        offset: u64,
    ) -> Result<StreamEnd, TransferError> {
        let mut stream = inner
            .transport
            .fetch(url, (offset > 0).then_some(offset), timeout)
            .await?;

        if offset > 0 && !stream.resumed {
            writer.restart().await?;
        }

        let total_bytes = stream.total_bytes;
        Self::update_progress(inner, chart_id, writer.bytes_written(), total_bytes).await;

        let mut last_persisted = writer.bytes_written();
        while let Some(chunk) = stream.chunks.next().await {
            let chunk = chunk?;
            if let Some(kind) = token.check() {
                return Ok(StreamEnd::Stopped(kind));
            }
            writer.write_chunk(&chunk).await?;

            let written = writer.bytes_written();
            Self::update_progress(inner, chart_id, written, total_bytes).await;
            if written.saturating_sub(last_persisted) >= PERSIST_EVERY_BYTES {
                last_persisted = written;
                if let Err(e) = inner
                    .store
                    .update_progress(chart_id, written, total_bytes)
                    .await
                {
                    warn!(chart_id, error = %e, "failed to persist progress");
                }
            }
        }

        if let Some(kind) = token.check() {
            return Ok(StreamEnd::Stopped(kind));
        }
        Ok(StreamEnd::Done)
    }

    /// Updates the in-memory task counters and emits a snapshot.
    async fn update_progress(
        inner: &Arc<Self>,
        chart_id: &str,
        bytes_downloaded: u64,
        total_bytes: Option<u64>,
    ) {
        let mut state = inner.state.lock().await;
        if let Some(task) = state.tasks.get_mut(chart_id) {
            task.bytes_downloaded = bytes_downloaded;
            if total_bytes.is_some() {
                task.total_bytes = total_bytes;
            }
            task.progress = normalized_progress(task.bytes_downloaded, task.total_bytes);
            task.speed.record(bytes_downloaded);
            task.updated_at = SystemTime::now();
            inner.emit(task);
        }
    }

    /// Salvages acknowledged progress after a failed attempt: flushes the
    /// part file and records the offset so the next attempt resumes.
    async fn record_partial(inner: &Arc<Self>, chart_id: &str, writer: PartFileWriter) {
        match writer.pause().await {
            Ok(record) if record.bytes_downloaded > 0 => {
                if let Err(e) = inner.store.save_resume(&record).await {
                    warn!(chart_id, error = %e, "failed to persist partial progress");
                }
            }
            Ok(_) => {}
            Err(e) => warn!(chart_id, error = %e, "failed to flush part file after error"),
        }
    }

    /// Applies the closing transition for a finished worker.
    async fn finish_task(
        inner: &Arc<Self>,
        chart_id: &str,
        outcome: TaskOutcome,
        run_started: Instant,
        attempts: u32,
    ) {
        let mut state = inner.state.lock().await;
        state.active.remove(chart_id);
        if !state.tasks.contains_key(chart_id) {
            warn!(chart_id, "finished worker for untracked chart");
            return;
        }

        match outcome {
            TaskOutcome::Completed(path) => {
                let snapshot_task = {
                    let Some(task) = state.tasks.get_mut(chart_id) else {
                        return;
                    };
                    task.status = TaskStatus::Completed;
                    if task.total_bytes.is_none() {
                        task.total_bytes = Some(task.bytes_downloaded);
                    }
                    // Completion is exactly 1.0 even when the total was
                    // never reported.
                    task.progress = 1.0;
                    task.last_error_category = None;
                    task.updated_at = SystemTime::now();
                    task.clone()
                };
                inner.emit(&snapshot_task);
                if let Err(e) = inner.store.upsert_task(&snapshot_task).await {
                    warn!(chart_id, error = %e, "failed to persist completion");
                }
                info!(
                    chart_id,
                    path = %path.display(),
                    bytes = snapshot_task.bytes_downloaded,
                    attempts,
                    "download completed"
                );
            }
            TaskOutcome::Stopped(StopKind::Pause) => {
                let snapshot_task = {
                    let Some(task) = state.tasks.get_mut(chart_id) else {
                        return;
                    };
                    task.status = TaskStatus::Paused;
                    task.updated_at = SystemTime::now();
                    task.clone()
                };
                inner.emit(&snapshot_task);
                if let Err(e) = inner.store.upsert_task(&snapshot_task).await {
                    warn!(chart_id, error = %e, "failed to persist pause");
                }
                // A paused task always has a resume record, even when the
                // stop landed before the first byte.
                let existing = inner.store.load_resume(chart_id).await.ok().flatten();
                if existing.is_none() {
                    let record = ResumeRecord {
                        chart_id: chart_id.to_string(),
                        bytes_downloaded: snapshot_task.bytes_downloaded,
                        part_path: part_path_for(
                            &inner.final_path_for(chart_id, &snapshot_task.source_url),
                        ),
                    };
                    if let Err(e) = inner.store.save_resume(&record).await {
                        warn!(chart_id, error = %e, "failed to persist resume record");
                    }
                }
                info!(chart_id, offset = snapshot_task.bytes_downloaded, "download paused");
            }
            TaskOutcome::Stopped(StopKind::Cancel) => {
                let snapshot_task = {
                    let Some(task) = state.tasks.get_mut(chart_id) else {
                        return;
                    };
                    task.status = TaskStatus::Cancelled;
                    task.updated_at = SystemTime::now();
                    task.clone()
                };
                let part_path =
                    part_path_for(&inner.final_path_for(chart_id, &snapshot_task.source_url));
                inner.emit(&snapshot_task);
                if let Err(e) = inner.store.upsert_task(&snapshot_task).await {
                    warn!(chart_id, error = %e, "failed to persist cancellation");
                }
                if let Err(e) = inner.store.clear_resume(chart_id).await {
                    warn!(chart_id, error = %e, "failed to clear resume record");
                }
                let _ = tokio::fs::remove_file(&part_path).await;
                info!(chart_id, "download cancelled");
            }
            TaskOutcome::Failed(failure) => {
                let (snapshot_task, report) = {
                    let Some(task) = state.tasks.get_mut(chart_id) else {
                        return;
                    };
                    task.status = TaskStatus::Failed;
                    task.last_error_category = Some(failure.category);
                    task.updated_at = SystemTime::now();
                    let report = FailureReport {
                        chart_id: chart_id.to_string(),
                        category: failure.category,
                        message: failure.message.clone(),
                        recommended_action: failure.category.recommended_action(),
                        resume_expected: failure.resume_expected(),
                        retry_count: attempts.saturating_sub(1),
                        elapsed: run_started.elapsed(),
                        errors: task.attempt_errors.clone(),
                        bytes_downloaded: task.bytes_downloaded,
                        total_bytes: task.total_bytes,
                    };
                    (task.clone(), report)
                };
                state.failure_reports.insert(chart_id.to_string(), report);
                inner.emit(&snapshot_task);
                if let Err(e) = inner.store.upsert_task(&snapshot_task).await {
                    warn!(chart_id, error = %e, "failed to persist failure");
                }
                warn!(
                    chart_id,
                    category = %failure.category,
                    retry_count = attempts.saturating_sub(1),
                    elapsed_ms = run_started.elapsed().as_millis() as u64,
                    bytes = snapshot_task.bytes_downloaded,
                    "download failed: {}",
                    failure.message
                );
            }
        }
    }
}

/// Index into `pending` of the next task to dispatch: highest priority,
/// enqueue order within a tier.
fn select_next(state: &QueueState) -> Option<usize> {
    let mut best: Option<(usize, Priority)> = None;
    for (index, chart_id) in state.pending.iter().enumerate() {
        let Some(task) = state.tasks.get(chart_id) else {
            continue;
        };
        match best {
            None => best = Some((index, task.priority)),
            Some((_, best_priority)) if task.priority.rank() > best_priority.rank() => {
                best = Some((index, task.priority));
            }
            Some(_) => {}
        }
    }
    best.map(|(index, _)| index)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::db::Database;
    use crate::download::quality::{ProbeReport, QualityProbe};
    use crate::download::task::ChannelSink;
    use crate::download::transport::TransferStream;
    use async_trait::async_trait;
    use bytes::Bytes;
    use std::sync::Mutex as StdMutex;
    use std::sync::atomic::{AtomicBool, Ordering};
    use tempfile::TempDir;

    /// Transport serving a fixed body from memory, honoring range requests,
    /// with optional per-chunk latency and scripted failures.
    #[derive(Debug)]
    struct FakeTransport {
        body: Vec<u8>,
        chunk_size: usize,
        chunk_delay: Duration,
        /// Errors returned before any successful fetch, front first.
        fail_first: StdMutex<Vec<u16>>,
    }

    impl FakeTransport {
        fn new(body: Vec<u8>) -> Self {
            Self {
                body,
                chunk_size: 1024,
                chunk_delay: Duration::ZERO,
                fail_first: StdMutex::new(Vec::new()),
            }
        }

        fn with_chunks(mut self, chunk_size: usize, chunk_delay: Duration) -> Self {
            self.chunk_size = chunk_size;
            self.chunk_delay = chunk_delay;
            self
        }

        fn failing_with(self, statuses: Vec<u16>) -> Self {
            *self.fail_first.lock().unwrap() = statuses;
            self
        }
    }

    #[async_trait]
    impl ChartTransport for FakeTransport {
        async fn fetch(
            &self,
            url: &str,
            range_start: Option<u64>,
            _timeout: Duration,
        ) -> Result<TransferStream, TransferError> {
            {
                let mut failures = self.fail_first.lock().unwrap();
                if !failures.is_empty() {
                    let status = failures.remove(0);
                    return Err(TransferError::http_status(url, status));
                }
            }

            let offset = usize::try_from(range_start.unwrap_or(0)).unwrap();
            let remaining = self.body.get(offset..).unwrap_or(&[]).to_vec();
            let chunks: Vec<Result<Bytes, TransferError>> = remaining
                .chunks(self.chunk_size)
                .map(|c| Ok(Bytes::copy_from_slice(c)))
                .collect();
            let delay = self.chunk_delay;
            let stream = futures_util::stream::iter(chunks)
                .then(move |chunk| async move {
                    if !delay.is_zero() {
                        tokio::time::sleep(delay).await;
                    }
                    chunk
                })
                .boxed();
            Ok(TransferStream {
                total_bytes: Some(self.body.len() as u64),
                resumed: offset > 0,
                chunks: stream,
            })
        }
    }

    /// Probe whose suitability is flipped by tests.
    #[derive(Debug)]
    struct SwitchProbe {
        good: Arc<AtomicBool>,
    }

    #[async_trait]
    impl QualityProbe for SwitchProbe {
        async fn probe(&self) -> ProbeReport {
            if self.good.load(Ordering::SeqCst) {
                ProbeReport {
                    reachable: true,
                    latency: Some(Duration::from_millis(50)),
                    throughput_mbps: Some(20.0),
                }
            } else {
                ProbeReport {
                    reachable: true,
                    latency: Some(Duration::from_millis(900)),
                    throughput_mbps: Some(0.2),
                }
            }
        }
    }

    struct Harness {
        orchestrator: DownloadOrchestrator,
        monitor: Arc<NetworkQualityMonitor>,
        rx: tokio::sync::mpsc::UnboundedReceiver<ProgressSnapshot>,
        dir: TempDir,
        #[allow(dead_code)]
        good_link: Arc<AtomicBool>,
    }

    async fn harness(transport: Arc<dyn ChartTransport>, max_concurrent: usize) -> Harness {
        harness_with_policy(
            transport,
            max_concurrent,
            RetryPolicy::new(
                2,
                Duration::from_millis(10),
                Duration::from_millis(50),
                2.0,
            )
            .without_jitter(),
        )
        .await
    }

    async fn harness_with_policy(
        transport: Arc<dyn ChartTransport>,
        max_concurrent: usize,
        policy: RetryPolicy,
    ) -> Harness {
        let dir = TempDir::new().unwrap();
        let good_link = Arc::new(AtomicBool::new(true));
        let monitor = Arc::new(NetworkQualityMonitor::new(
            Arc::new(SwitchProbe {
                good: Arc::clone(&good_link),
            }),
            Duration::from_millis(20),
        ));
        let limiter = Arc::new(PriorityRateLimiter::new(64, Duration::from_millis(100)));
        let store = TaskStore::new(Database::new_in_memory().await.unwrap());
        let (sink, rx) = ChannelSink::new();
        let orchestrator = DownloadOrchestrator::new(
            dir.path(),
            limiter,
            monitor.clone(),
            transport,
            store,
            policy,
            Arc::new(sink),
            max_concurrent,
            Duration::from_secs(30),
        )
        .unwrap();
        Harness {
            orchestrator,
            monitor,
            rx,
            dir,
            good_link,
        }
    }

    async fn wait_for_status(
        orchestrator: &DownloadOrchestrator,
        chart_id: &str,
        status: TaskStatus,
    ) {
        let deadline = Instant::now() + Duration::from_secs(30);
        loop {
            if let Some(snapshot) = orchestrator.task_snapshot(chart_id).await {
                if snapshot.status == status {
                    return;
                }
            }
            assert!(
                Instant::now() < deadline,
                "timed out waiting for {chart_id} to reach {status}"
            );
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    #[tokio::test]
    async fn test_zero_concurrency_rejected_at_construction() {
        let h = harness(Arc::new(FakeTransport::new(vec![1, 2, 3])), 1).await;
        // The harness built fine with 1; zero must fail.
        let result = h.orchestrator.set_max_concurrent_downloads(0).await;
        assert!(matches!(
            result,
            Err(OrchestratorError::InvalidConcurrency { value: 0 })
        ));
    }

    #[tokio::test]
    async fn test_single_chart_completes_with_final_file() {
        let body = vec![0xAB; 10 * 1024];
        let h = harness(Arc::new(FakeTransport::new(body.clone())), 1).await;

        h.orchestrator
            .enqueue("US5WA11M", "https://charts.example.gov/US5WA11M.zip", Priority::Normal)
            .await
            .unwrap();
        wait_for_status(&h.orchestrator, "US5WA11M", TaskStatus::Completed).await;

        let snapshot = h.orchestrator.task_snapshot("US5WA11M").await.unwrap();
        assert!((snapshot.progress - 1.0).abs() < f64::EPSILON);
        assert_eq!(snapshot.bytes_downloaded, body.len() as u64);

        let final_path = h.dir.path().join("US5WA11M.zip");
        assert_eq!(
            tokio::fs::metadata(&final_path).await.unwrap().len(),
            body.len() as u64
        );
        assert!(!part_path_for(&final_path).exists());
    }

    #[tokio::test]
    async fn test_invalid_chart_id_rejected() {
        let h = harness(Arc::new(FakeTransport::new(vec![1])), 1).await;
        let result = h
            .orchestrator
            .enqueue("not a chart", "https://example.com/x.zip", Priority::Normal)
            .await;
        assert!(matches!(
            result,
            Err(OrchestratorError::InvalidChartId { .. })
        ));
    }

    #[tokio::test]
    async fn test_duplicate_enqueue_is_noop() {
        let h = harness(
            Arc::new(
                FakeTransport::new(vec![1; 64])
                    .with_chunks(8, Duration::from_millis(20)),
            ),
            1,
        )
        .await;

        h.orchestrator
            .enqueue("US5WA11M", "https://charts.example.gov/US5WA11M.zip", Priority::Normal)
            .await
            .unwrap();
        h.orchestrator
            .enqueue("US5WA11M", "https://charts.example.gov/other.zip", Priority::Critical)
            .await
            .unwrap();

        let snapshot = h.orchestrator.task_snapshot("US5WA11M").await.unwrap();
        // The second enqueue must not have replaced the task.
        wait_for_status(&h.orchestrator, "US5WA11M", TaskStatus::Completed).await;
        let final_path = h.dir.path().join("US5WA11M.zip");
        assert!(final_path.exists());
        drop(snapshot);
    }

    #[tokio::test]
    async fn test_progress_snapshots_monotonic_and_end_at_one() {
        let body = vec![7u8; 8 * 1024];
        let h = harness(
            Arc::new(FakeTransport::new(body).with_chunks(1024, Duration::from_millis(1))),
            1,
        )
        .await;
        let mut rx = h.rx;

        h.orchestrator
            .enqueue("US5WA11M", "https://charts.example.gov/US5WA11M.zip", Priority::Normal)
            .await
            .unwrap();
        wait_for_status(&h.orchestrator, "US5WA11M", TaskStatus::Completed).await;

        let mut last_progress = 0.0f64;
        let mut last_offset = 0u64;
        let mut final_progress = 0.0f64;
        while let Ok(snapshot) = rx.try_recv() {
            assert!(
                snapshot.progress >= last_progress,
                "progress regressed: {} < {last_progress}",
                snapshot.progress
            );
            assert!(
                snapshot.bytes_downloaded >= last_offset,
                "offset regressed"
            );
            last_progress = snapshot.progress;
            last_offset = snapshot.bytes_downloaded;
            final_progress = snapshot.progress;
        }
        assert!((final_progress - 1.0).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn test_concurrency_bound_never_exceeded() {
        let h = harness(
            Arc::new(
                FakeTransport::new(vec![5u8; 4 * 1024])
                    .with_chunks(512, Duration::from_millis(5)),
            ),
            2,
        )
        .await;

        for chart_id in ["US5WA11M", "US4CA11M", "US3NY01M", "US2AK05M", "US5FL22M"] {
            h.orchestrator
                .enqueue(
                    chart_id,
                    &format!("https://charts.example.gov/{chart_id}.zip"),
                    Priority::Normal,
                )
                .await
                .unwrap();
        }

        let mut max_seen = 0;
        let deadline = Instant::now() + Duration::from_secs(30);
        loop {
            let active = h.orchestrator.active_count().await;
            max_seen = max_seen.max(active);
            assert!(active <= 2, "active count {active} exceeded bound");
            let snapshots = h.orchestrator.snapshots().await;
            if snapshots
                .iter()
                .all(|s| s.status == TaskStatus::Completed)
            {
                break;
            }
            assert!(Instant::now() < deadline, "downloads did not finish");
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(max_seen >= 1);
    }

    #[tokio::test]
    async fn test_retry_exhaustion_reports_full_history() {
        let transport =
            FakeTransport::new(vec![1]).failing_with(vec![500, 500, 500, 500, 500, 500]);
        let h = harness_with_policy(
            Arc::new(transport),
            1,
            RetryPolicy::new(2, Duration::from_millis(5), Duration::from_millis(20), 2.0)
                .without_jitter(),
        )
        .await;

        h.orchestrator
            .enqueue("US5WA11M", "https://charts.example.gov/US5WA11M.zip", Priority::Normal)
            .await
            .unwrap();
        wait_for_status(&h.orchestrator, "US5WA11M", TaskStatus::Failed).await;

        let report = h.orchestrator.failure_report("US5WA11M").await.unwrap();
        // max_retries = 2 means exactly 3 attempts and retry_count 2.
        assert_eq!(report.retry_count, 2);
        assert_eq!(report.errors.len(), 3);
        assert_eq!(report.category, ErrorCategory::ServerError);
        assert!(report.resume_expected);
        assert!(report.elapsed > Duration::ZERO);
    }

    #[tokio::test]
    async fn test_permanent_failure_fails_immediately() {
        let transport = FakeTransport::new(vec![1]).failing_with(vec![404]);
        let h = harness(Arc::new(transport), 1).await;

        h.orchestrator
            .enqueue("US5WA11M", "https://charts.example.gov/US5WA11M.zip", Priority::Normal)
            .await
            .unwrap();
        wait_for_status(&h.orchestrator, "US5WA11M", TaskStatus::Failed).await;

        let report = h.orchestrator.failure_report("US5WA11M").await.unwrap();
        assert_eq!(report.category, ErrorCategory::ChartNotAvailable);
        assert_eq!(report.retry_count, 0);
        assert!(!report.resume_expected);
        assert_eq!(
            report.recommended_action,
            "chart is not available from this source"
        );
    }

    #[tokio::test]
    async fn test_transient_failures_recover() {
        let transport = FakeTransport::new(vec![9u8; 2048]).failing_with(vec![503]);
        let h = harness(Arc::new(transport), 1).await;

        h.orchestrator
            .enqueue("US5WA11M", "https://charts.example.gov/US5WA11M.zip", Priority::Normal)
            .await
            .unwrap();
        wait_for_status(&h.orchestrator, "US5WA11M", TaskStatus::Completed).await;

        let snapshot = h.orchestrator.task_snapshot("US5WA11M").await.unwrap();
        assert_eq!(snapshot.bytes_downloaded, 2048);
    }

    #[tokio::test]
    async fn test_pause_persists_resume_record_and_resume_completes() {
        let body: Vec<u8> = (0..32 * 1024).map(|i| (i % 251) as u8).collect();
        let h = harness(
            Arc::new(
                FakeTransport::new(body.clone())
                    .with_chunks(1024, Duration::from_millis(5)),
            ),
            1,
        )
        .await;

        h.orchestrator
            .enqueue("US5WA11M", "https://charts.example.gov/US5WA11M.zip", Priority::Normal)
            .await
            .unwrap();

        // Wait until some bytes landed, then pause.
        let deadline = Instant::now() + Duration::from_secs(10);
        loop {
            let snapshot = h.orchestrator.task_snapshot("US5WA11M").await.unwrap();
            if snapshot.bytes_downloaded >= 1024 && snapshot.status == TaskStatus::Downloading {
                break;
            }
            assert!(Instant::now() < deadline, "no progress before pause");
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        h.orchestrator.pause("US5WA11M").await.unwrap();
        wait_for_status(&h.orchestrator, "US5WA11M", TaskStatus::Paused).await;

        let record = h
            .orchestrator
            .get_resume_data("US5WA11M")
            .await
            .unwrap()
            .unwrap();
        assert!(record.bytes_downloaded > 0);
        assert!(record.bytes_downloaded < body.len() as u64);

        h.orchestrator.resume("US5WA11M").await.unwrap();
        wait_for_status(&h.orchestrator, "US5WA11M", TaskStatus::Completed).await;

        let bytes = tokio::fs::read(h.dir.path().join("US5WA11M.zip"))
            .await
            .unwrap();
        assert_eq!(bytes, body, "resumed file must be byte-identical");
        // Resume record is gone after completion.
        assert!(
            h.orchestrator
                .get_resume_data("US5WA11M")
                .await
                .unwrap()
                .is_none()
        );
    }

    #[tokio::test]
    async fn test_pause_requires_downloading_state() {
        let h = harness(Arc::new(FakeTransport::new(vec![1])), 1).await;
        let result = h.orchestrator.pause("US5WA11M").await;
        assert!(matches!(result, Err(OrchestratorError::UnknownChart { .. })));
    }

    #[tokio::test]
    async fn test_cancel_removes_part_file_and_resume_record() {
        let h = harness(
            Arc::new(
                FakeTransport::new(vec![3u8; 64 * 1024])
                    .with_chunks(1024, Duration::from_millis(5)),
            ),
            1,
        )
        .await;

        h.orchestrator
            .enqueue("US5WA11M", "https://charts.example.gov/US5WA11M.zip", Priority::Normal)
            .await
            .unwrap();
        let deadline = Instant::now() + Duration::from_secs(10);
        loop {
            let snapshot = h.orchestrator.task_snapshot("US5WA11M").await.unwrap();
            if snapshot.bytes_downloaded > 0 {
                break;
            }
            assert!(Instant::now() < deadline);
            tokio::time::sleep(Duration::from_millis(2)).await;
        }

        h.orchestrator.cancel("US5WA11M").await.unwrap();
        wait_for_status(&h.orchestrator, "US5WA11M", TaskStatus::Cancelled).await;

        let final_path = h.dir.path().join("US5WA11M.zip");
        assert!(!final_path.exists());
        assert!(!part_path_for(&final_path).exists());
        assert!(
            h.orchestrator
                .get_resume_data("US5WA11M")
                .await
                .unwrap()
                .is_none()
        );
    }

    #[tokio::test]
    async fn test_cancelled_task_can_be_reenqueued() {
        let h = harness(Arc::new(FakeTransport::new(vec![8u8; 512])), 1).await;

        h.orchestrator
            .enqueue("US5WA11M", "https://charts.example.gov/US5WA11M.zip", Priority::Normal)
            .await
            .unwrap();
        wait_for_status(&h.orchestrator, "US5WA11M", TaskStatus::Completed).await;

        // Terminal: a fresh enqueue replaces the task.
        h.orchestrator
            .enqueue("US5WA11M", "https://charts.example.gov/US5WA11M.zip", Priority::High)
            .await
            .unwrap();
        wait_for_status(&h.orchestrator, "US5WA11M", TaskStatus::Completed).await;
    }

    #[tokio::test]
    async fn test_global_pause_defers_dispatch() {
        let h = harness(Arc::new(FakeTransport::new(vec![1u8; 256])), 1).await;

        h.orchestrator.pause_all().await;
        h.orchestrator
            .enqueue("US5WA11M", "https://charts.example.gov/US5WA11M.zip", Priority::Normal)
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(100)).await;
        let snapshot = h.orchestrator.task_snapshot("US5WA11M").await.unwrap();
        assert_eq!(snapshot.status, TaskStatus::Queued);

        h.orchestrator.resume_all().await;
        wait_for_status(&h.orchestrator, "US5WA11M", TaskStatus::Completed).await;
    }

    #[tokio::test]
    async fn test_priority_order_within_queue() {
        // Concurrency 1 and slow chunks force strict serialization; the
        // higher-priority chart enqueued later must start first.
        let h = harness(
            Arc::new(
                FakeTransport::new(vec![1u8; 2048]).with_chunks(256, Duration::from_millis(5)),
            ),
            1,
        )
        .await;

        h.orchestrator.pause_all().await;
        h.orchestrator
            .enqueue("US5WA11M", "https://charts.example.gov/US5WA11M.zip", Priority::Low)
            .await
            .unwrap();
        h.orchestrator
            .enqueue("US4CA11M", "https://charts.example.gov/US4CA11M.zip", Priority::Critical)
            .await
            .unwrap();
        h.orchestrator.resume_all().await;

        // The critical chart must be the one downloading first.
        let deadline = Instant::now() + Duration::from_secs(10);
        loop {
            let critical = h.orchestrator.task_snapshot("US4CA11M").await.unwrap();
            let low = h.orchestrator.task_snapshot("US5WA11M").await.unwrap();
            if critical.status == TaskStatus::Downloading {
                assert_eq!(low.status, TaskStatus::Queued);
                break;
            }
            assert!(
                low.status != TaskStatus::Downloading,
                "low priority dispatched before critical"
            );
            assert!(Instant::now() < deadline);
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
    }

    #[tokio::test]
    async fn test_unsuitable_link_defers_until_recovery() {
        let h = harness(Arc::new(FakeTransport::new(vec![2u8; 512])), 1).await;
        h.good_link.store(false, Ordering::SeqCst);
        h.monitor.sample().await;
        h.orchestrator.start().await;

        h.orchestrator
            .enqueue("US5WA11M", "https://charts.example.gov/US5WA11M.zip", Priority::Normal)
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(100)).await;
        let snapshot = h.orchestrator.task_snapshot("US5WA11M").await.unwrap();
        assert_eq!(snapshot.status, TaskStatus::Queued);
        assert_eq!(snapshot.bytes_downloaded, 0, "no bytes before link recovers");

        // Link recovers; the monitor tick re-runs scheduling.
        h.good_link.store(true, Ordering::SeqCst);
        h.monitor.sample().await;
        wait_for_status(&h.orchestrator, "US5WA11M", TaskStatus::Completed).await;
        h.orchestrator.shutdown().await;
    }

    #[tokio::test]
    async fn test_restore_reloads_without_auto_promotion() {
        let db = Database::new_in_memory().await.unwrap();
        let store = TaskStore::new(db);

        let queued = DownloadTask::new(
            "US5WA11M",
            "https://charts.example.gov/US5WA11M.zip",
            Priority::Normal,
        );
        store.upsert_task(&queued).await.unwrap();
        let mut paused = DownloadTask::new(
            "US4CA11M",
            "https://charts.example.gov/US4CA11M.zip",
            Priority::High,
        );
        paused.status = TaskStatus::Paused;
        paused.bytes_downloaded = 2048;
        paused.total_bytes = Some(8192);
        store.upsert_task(&paused).await.unwrap();

        let dir = TempDir::new().unwrap();
        let monitor = Arc::new(NetworkQualityMonitor::new(
            Arc::new(SwitchProbe {
                good: Arc::new(AtomicBool::new(true)),
            }),
            Duration::from_secs(30),
        ));
        let (sink, _rx) = ChannelSink::new();
        let orchestrator = DownloadOrchestrator::new(
            dir.path(),
            Arc::new(PriorityRateLimiter::new(8, Duration::from_secs(1))),
            monitor,
            Arc::new(FakeTransport::new(vec![1u8; 128])),
            store,
            RetryPolicy::default().without_jitter(),
            Arc::new(sink),
            2,
            Duration::from_secs(30),
        )
        .unwrap();

        let reloaded = orchestrator.restore().await.unwrap();
        assert_eq!(reloaded, 2);

        // Nothing auto-promotes: statuses are exactly as persisted.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(
            orchestrator.task_snapshot("US5WA11M").await.unwrap().status,
            TaskStatus::Queued
        );
        let paused_snapshot = orchestrator.task_snapshot("US4CA11M").await.unwrap();
        assert_eq!(paused_snapshot.status, TaskStatus::Paused);
        assert_eq!(paused_snapshot.bytes_downloaded, 2048);

        // An explicit resume brings the paused chart back through the queue.
        orchestrator.resume("US4CA11M").await.unwrap();
        wait_for_status(&orchestrator, "US4CA11M", TaskStatus::Completed).await;
    }

    #[tokio::test]
    async fn test_checksum_mismatch_retries_once_then_fails() {
        let body = b"not what the catalog promised".to_vec();
        let h = harness_with_policy(
            Arc::new(FakeTransport::new(body)),
            1,
            RetryPolicy::new(5, Duration::from_millis(5), Duration::from_millis(20), 2.0)
                .without_jitter(),
        )
        .await;

        h.orchestrator
            .enqueue_with_checksum(
                "US5WA11M",
                "https://charts.example.gov/US5WA11M.zip",
                Priority::Normal,
                Some("0".repeat(64)),
            )
            .await
            .unwrap();
        wait_for_status(&h.orchestrator, "US5WA11M", TaskStatus::Failed).await;

        let report = h.orchestrator.failure_report("US5WA11M").await.unwrap();
        assert_eq!(report.category, ErrorCategory::ChecksumMismatch);
        // One retry, regardless of the generous budget.
        assert_eq!(report.retry_count, 1);
        assert!(!h.dir.path().join("US5WA11M.zip").exists());
    }
}
