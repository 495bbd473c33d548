//! Shared helpers for integration tests: a fully wired orchestrator against
//! a real `HttpTransport`, an in-memory store, and a controllable quality
//! probe.

#![allow(dead_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tempfile::TempDir;
use tokio::sync::mpsc::UnboundedReceiver;

use chartloader_core::download::quality::{ProbeReport, QualityProbe};
use chartloader_core::{
    ChannelSink, Database, DownloadOrchestrator, HttpTransport, NetworkQualityMonitor,
    PriorityRateLimiter, ProgressSnapshot, RetryPolicy, TaskStatus, TaskStore,
};

/// Probe whose link quality is toggled from tests. Good means a broadband
/// profile; bad means a satellite trickle that gates chart downloads.
#[derive(Debug)]
pub struct TogglingProbe {
    good: AtomicBool,
}

impl TogglingProbe {
    pub fn new(good: bool) -> Self {
        Self {
            good: AtomicBool::new(good),
        }
    }

    pub fn set_good(&self, good: bool) {
        self.good.store(good, Ordering::SeqCst);
    }
}

#[async_trait]
impl QualityProbe for TogglingProbe {
    async fn probe(&self) -> ProbeReport {
        if self.good.load(Ordering::SeqCst) {
            ProbeReport {
                reachable: true,
                latency: Some(Duration::from_millis(40)),
                throughput_mbps: Some(25.0),
            }
        } else {
            ProbeReport {
                reachable: true,
                latency: Some(Duration::from_millis(950)),
                throughput_mbps: Some(0.3),
            }
        }
    }
}

pub struct Harness {
    pub orchestrator: DownloadOrchestrator,
    pub charts_dir: TempDir,
    pub monitor: Arc<NetworkQualityMonitor>,
    pub probe: Arc<TogglingProbe>,
    pub store: TaskStore,
    pub progress: UnboundedReceiver<ProgressSnapshot>,
}

/// Builds an orchestrator over a real `HttpTransport` with an in-memory
/// store and a generous rate limiter.
pub async fn harness(max_concurrent: usize, policy: RetryPolicy) -> Harness {
    let charts_dir = TempDir::new().expect("temp dir");
    let probe = Arc::new(TogglingProbe::new(true));
    let monitor = Arc::new(NetworkQualityMonitor::new(
        Arc::clone(&probe) as Arc<dyn QualityProbe>,
        Duration::from_millis(25),
    ));
    let store = TaskStore::new(Database::new_in_memory().await.expect("in-memory db"));
    let (sink, progress) = ChannelSink::new();

    let orchestrator = DownloadOrchestrator::new(
        charts_dir.path(),
        Arc::new(PriorityRateLimiter::new(64, Duration::from_millis(100))),
        Arc::clone(&monitor),
        Arc::new(HttpTransport::new()),
        store.clone(),
        policy,
        Arc::new(sink),
        max_concurrent,
        Duration::from_secs(30),
    )
    .expect("orchestrator");

    Harness {
        orchestrator,
        charts_dir,
        monitor,
        probe,
        store,
        progress,
    }
}

/// Fast retry policy for tests: deterministic delays, small budget.
pub fn test_policy(max_retries: u32) -> RetryPolicy {
    RetryPolicy::new(
        max_retries,
        Duration::from_millis(10),
        Duration::from_millis(50),
        2.0,
    )
    .without_jitter()
}

/// Polls until the chart reaches `status`, failing after 30 seconds.
pub async fn wait_for_status(
    orchestrator: &DownloadOrchestrator,
    chart_id: &str,
    status: TaskStatus,
) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(30);
    loop {
        if let Some(snapshot) = orchestrator.task_snapshot(chart_id).await {
            if snapshot.status == status {
                return;
            }
            assert!(
                !(snapshot.status.is_terminal() && snapshot.status != status),
                "{chart_id} reached terminal {} while waiting for {status}",
                snapshot.status
            );
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting for {chart_id} to reach {status}"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
