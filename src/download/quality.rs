//! Network quality monitoring and admission gating.
//!
//! Chart artifacts are tens of megabytes and the links that fetch them are
//! often satellite-backed. The monitor periodically probes reachability,
//! round-trip latency, and throughput, folds the measurements into a quality
//! tier, and answers two questions for the orchestrator: *should a large
//! transfer be admitted right now*, and *how much should per-attempt
//! timeouts be stretched*.
//!
//! Probing is behind the [`QualityProbe`] trait so tests substitute
//! deterministic fakes; [`HttpProbe`] is the production implementation.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

/// Latency above which a link is treated as satellite-class.
const SATELLITE_LATENCY: Duration = Duration::from_millis(600);

/// Minimum throughput (Mbps) for admitting a chart download.
const MIN_DOWNLOAD_THROUGHPUT_MBPS: f64 = 1.0;

/// Bounded sample history used for stability assessment.
const HISTORY_LIMIT: usize = 32;

/// Quality tier derived from latency and throughput measurements.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QualityTier {
    /// No reachability.
    Offline,
    /// Barely usable; large transfers are gated out.
    VeryPoor,
    /// Usable for small requests only; large transfers are gated out.
    Poor,
    /// Acceptable for chart downloads.
    Fair,
    /// Comfortable margins.
    Good,
    /// Broadband-class link.
    Excellent,
}

impl QualityTier {
    /// Numeric rank; higher is better. Used for stability variance.
    #[must_use]
    pub fn rank(self) -> u8 {
        match self {
            Self::Offline => 0,
            Self::VeryPoor => 1,
            Self::Poor => 2,
            Self::Fair => 3,
            Self::Good => 4,
            Self::Excellent => 5,
        }
    }
}

impl std::fmt::Display for QualityTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Offline => "offline",
            Self::VeryPoor => "very_poor",
            Self::Poor => "poor",
            Self::Fair => "fair",
            Self::Good => "good",
            Self::Excellent => "excellent",
        };
        f.write_str(s)
    }
}

/// Raw measurements from one probe round.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProbeReport {
    /// Whether the probe host answered at all.
    pub reachable: bool,
    /// Round-trip latency of the reachability request.
    pub latency: Option<Duration>,
    /// Estimated throughput from a small timed transfer, in Mbps.
    pub throughput_mbps: Option<f64>,
}

/// Measurement source for the monitor.
#[async_trait]
pub trait QualityProbe: Send + Sync + std::fmt::Debug {
    /// Performs one probe round: reachability, latency, throughput.
    async fn probe(&self) -> ProbeReport;
}

/// One classified sample in the rolling history.
#[derive(Debug, Clone, Copy)]
pub struct NetworkQualitySample {
    /// When the sample was taken.
    pub sampled_at: SystemTime,
    /// Measured round-trip latency, when reachable.
    pub latency: Option<Duration>,
    /// Estimated throughput in Mbps, when measured.
    pub throughput_mbps: Option<f64>,
    /// Derived tier.
    pub tier: QualityTier,
}

/// Current link status broadcast to subscribers on every sample.
#[derive(Debug, Clone, Copy)]
pub struct NetworkStatus {
    /// Derived tier of the latest sample.
    pub tier: QualityTier,
    /// Latency of the latest sample.
    pub latency: Option<Duration>,
    /// Throughput of the latest sample, in Mbps.
    pub throughput_mbps: Option<f64>,
    /// When the latest sample was taken.
    pub sampled_at: SystemTime,
}

/// State shared between the monitor handle and its sampling task.
struct MonitorShared {
    probe: Arc<dyn QualityProbe>,
    history: Mutex<VecDeque<NetworkQualitySample>>,
    status_tx: watch::Sender<Option<NetworkStatus>>,
}

impl std::fmt::Debug for MonitorShared {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MonitorShared").finish_non_exhaustive()
    }
}

/// Periodic network-quality monitor.
///
/// Injected into the orchestrator as an explicit dependency; never accessed
/// through globals, so tests run it against a fake probe (or skip starting
/// it entirely; before the first sample, admission is not gated).
#[derive(Debug)]
pub struct NetworkQualityMonitor {
    shared: Arc<MonitorShared>,
    interval: Duration,
    sampler: Mutex<Option<JoinHandle<()>>>,
}

impl NetworkQualityMonitor {
    /// Creates a monitor sampling through `probe` every `interval` once
    /// started.
    #[must_use]
    pub fn new(probe: Arc<dyn QualityProbe>, interval: Duration) -> Self {
        let (status_tx, _) = watch::channel(None);
        Self {
            shared: Arc::new(MonitorShared {
                probe,
                history: Mutex::new(VecDeque::with_capacity(HISTORY_LIMIT)),
                status_tx,
            }),
            interval,
            sampler: Mutex::new(None),
        }
    }

    /// Starts the fixed-interval sampling task. Idempotent.
    pub fn start(&self) {
        let mut sampler = self.lock_sampler();
        if sampler.is_some() {
            return;
        }
        info!(interval_secs = self.interval.as_secs(), "starting network quality monitor");
        let shared = Arc::clone(&self.shared);
        let interval = self.interval;
        *sampler = Some(tokio::spawn(async move {
            loop {
                shared.sample().await;
                tokio::time::sleep(interval).await;
            }
        }));
    }

    /// Stops the sampling task and releases its timer.
    pub fn stop(&self) {
        if let Some(handle) = self.lock_sampler().take() {
            handle.abort();
            info!("stopped network quality monitor");
        }
    }

    /// Performs one probe round, classifies it, appends it to the history,
    /// and broadcasts the new status.
    pub async fn sample(&self) -> NetworkQualitySample {
        self.shared.sample().await
    }

    /// Latest broadcast status; `None` before the first sample.
    #[must_use]
    pub fn current(&self) -> Option<NetworkStatus> {
        *self.shared.status_tx.borrow()
    }

    /// Subscribes to status updates; one message per sample.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<Option<NetworkStatus>> {
        self.shared.status_tx.subscribe()
    }

    /// Whether conditions admit a large chart transfer: tier must be at
    /// least `Fair` and throughput at least 1.0 Mbps. Before the first
    /// sample (monitor not started), admission is not gated.
    #[must_use]
    pub fn is_suitable_for_chart_download(&self) -> bool {
        match self.current() {
            None => true,
            Some(status) => {
                matches!(
                    status.tier,
                    QualityTier::Excellent | QualityTier::Good | QualityTier::Fair
                ) && status
                    .throughput_mbps
                    .is_some_and(|mbps| mbps >= MIN_DOWNLOAD_THROUGHPUT_MBPS)
            }
        }
    }

    /// Timeout scaling factor for the current conditions: 1x on a healthy
    /// link, up to 4x under very poor conditions. Latency above 600ms is
    /// treated as a satellite-class link and floors the multiplier at 3x.
    #[must_use]
    pub fn timeout_multiplier(&self) -> f64 {
        let Some(status) = self.current() else {
            return 1.0;
        };
        let tier_factor: f64 = match status.tier {
            QualityTier::Excellent | QualityTier::Good => 1.0,
            QualityTier::Fair => 1.5,
            QualityTier::Poor => 2.0,
            QualityTier::VeryPoor | QualityTier::Offline => 4.0,
        };
        if status.latency.is_some_and(|l| l > SATELLITE_LATENCY) {
            tier_factor.max(3.0)
        } else {
            tier_factor
        }
    }

    /// Variance of tier ranks across the rolling history. Low variance means
    /// the link quality is stable, independent of how good it is.
    #[must_use]
    pub fn stability(&self) -> f64 {
        let history = self.lock_history();
        if history.len() < 2 {
            return 0.0;
        }
        let ranks: Vec<f64> = history.iter().map(|s| f64::from(s.tier.rank())).collect();
        let mean = ranks.iter().sum::<f64>() / ranks.len() as f64;
        ranks.iter().map(|r| (r - mean).powi(2)).sum::<f64>() / ranks.len() as f64
    }

    /// Whether recent samples agree closely enough to trust the current
    /// tier for admission decisions.
    #[must_use]
    pub fn is_stable(&self) -> bool {
        self.stability() <= 1.0
    }

    /// Copy of the rolling sample history, oldest first.
    #[must_use]
    pub fn history(&self) -> Vec<NetworkQualitySample> {
        self.lock_history().iter().copied().collect()
    }

    fn lock_history(&self) -> std::sync::MutexGuard<'_, VecDeque<NetworkQualitySample>> {
        self.shared
            .history
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn lock_sampler(&self) -> std::sync::MutexGuard<'_, Option<JoinHandle<()>>> {
        self.sampler
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

impl MonitorShared {
    /// One probe round: measure, classify, append, broadcast.
    #[instrument(skip(self))]
    async fn sample(&self) -> NetworkQualitySample {
        let report = self.probe.probe().await;
        let tier = classify_report(&report);
        let sample = NetworkQualitySample {
            sampled_at: SystemTime::now(),
            latency: report.latency,
            throughput_mbps: report.throughput_mbps,
            tier,
        };

        {
            let mut history = self
                .history
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            history.push_back(sample);
            while history.len() > HISTORY_LIMIT {
                history.pop_front();
            }
        }

        let previous_tier = self.status_tx.borrow().map(|s| s.tier);
        if previous_tier != Some(tier) {
            info!(
                tier = %tier,
                latency_ms = report.latency.map(|l| l.as_millis() as u64),
                throughput_mbps = report.throughput_mbps,
                "network quality changed"
            );
        } else {
            debug!(tier = %tier, "network quality sample");
        }
        self.status_tx.send_replace(Some(NetworkStatus {
            tier,
            latency: report.latency,
            throughput_mbps: report.throughput_mbps,
            sampled_at: sample.sampled_at,
        }));

        sample
    }
}

impl Drop for NetworkQualityMonitor {
    fn drop(&mut self) {
        if let Some(handle) = self.lock_sampler().take() {
            handle.abort();
        }
    }
}

/// Folds raw measurements into a tier: the worse of the throughput band and
/// the latency band, `Offline` when unreachable.
fn classify_report(report: &ProbeReport) -> QualityTier {
    if !report.reachable {
        return QualityTier::Offline;
    }

    let throughput_band = report.throughput_mbps.map(|mbps| {
        if mbps >= 10.0 {
            QualityTier::Excellent
        } else if mbps >= 5.0 {
            QualityTier::Good
        } else if mbps >= 1.0 {
            QualityTier::Fair
        } else if mbps >= 0.25 {
            QualityTier::Poor
        } else {
            QualityTier::VeryPoor
        }
    });

    let latency_band = report.latency.map(|latency| {
        let ms = latency.as_millis();
        if ms <= 100 {
            QualityTier::Excellent
        } else if ms <= 250 {
            QualityTier::Good
        } else if ms <= 500 {
            QualityTier::Fair
        } else if ms <= 1000 {
            QualityTier::Poor
        } else {
            QualityTier::VeryPoor
        }
    });

    match (throughput_band, latency_band) {
        (Some(t), Some(l)) => {
            if t.rank() <= l.rank() {
                t
            } else {
                l
            }
        }
        (Some(band), None) | (None, Some(band)) => band,
        // Reachable but nothing measured: assume the worst usable tier.
        (None, None) => QualityTier::Poor,
    }
}

/// Production probe: HEAD against a known host for reachability/latency and
/// a small ranged GET for throughput.
#[derive(Debug)]
pub struct HttpProbe {
    client: reqwest::Client,
    endpoint: String,
}

/// Bytes requested for the timed throughput transfer (64 KiB).
const THROUGHPUT_PROBE_BYTES: u64 = 64 * 1024;

impl HttpProbe {
    /// Creates a probe against the given endpoint.
    ///
    /// # Panics
    ///
    /// Panics if the HTTP client cannot be built with the static
    /// configuration; this does not happen in practice.
    #[must_use]
    #[allow(clippy::expect_used)]
    pub fn new(endpoint: impl Into<String>) -> Self {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .timeout(Duration::from_secs(20))
            .build()
            .expect("failed to build probe HTTP client");
        Self {
            client,
            endpoint: endpoint.into(),
        }
    }
}

#[async_trait]
impl QualityProbe for HttpProbe {
    async fn probe(&self) -> ProbeReport {
        let started = tokio::time::Instant::now();
        let head = self.client.head(&self.endpoint).send().await;
        let latency = started.elapsed();

        let Ok(response) = head else {
            debug!(endpoint = %self.endpoint, "reachability probe failed");
            return ProbeReport::default();
        };
        if response.status().is_server_error() {
            warn!(status = response.status().as_u16(), "probe host unhealthy");
            return ProbeReport::default();
        }

        // Small timed transfer for a throughput estimate. Servers that
        // ignore the Range header just give us a larger sample.
        let throughput_mbps = {
            let fetch_started = tokio::time::Instant::now();
            let result = self
                .client
                .get(&self.endpoint)
                .header(
                    reqwest::header::RANGE,
                    format!("bytes=0-{}", THROUGHPUT_PROBE_BYTES - 1),
                )
                .send()
                .await;
            match result {
                Ok(response) => match response.bytes().await {
                    Ok(body) if !body.is_empty() => {
                        let secs = fetch_started.elapsed().as_secs_f64().max(0.001);
                        Some(body.len() as f64 * 8.0 / 1_000_000.0 / secs)
                    }
                    _ => None,
                },
                Err(_) => None,
            }
        };

        ProbeReport {
            reachable: true,
            latency: Some(latency),
            throughput_mbps,
        }
    }
}
