//! Download subsystem configuration.
//!
//! A plain serde value with builder-style setters and environment
//! overrides; the CLI loads it, wires the pieces, and hands the orchestrator
//! its dependencies.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Default concurrency bound for chart downloads.
const DEFAULT_MAX_CONCURRENT: usize = 3;

/// Default sliding-window capacity for outbound calls.
const DEFAULT_RATE_CAPACITY: usize = 5;

/// Default sliding-window size in seconds.
const DEFAULT_RATE_WINDOW_SECS: u64 = 10;

/// Default per-attempt timeout in seconds, before quality scaling.
const DEFAULT_ATTEMPT_TIMEOUT_SECS: u64 = 300;

/// Default quality-probe sample interval in seconds.
const DEFAULT_SAMPLE_INTERVAL_SECS: u64 = 30;

/// Default probe endpoint: the chart distribution host itself.
const DEFAULT_PROBE_ENDPOINT: &str = "https://charts.noaa.gov/ENCs/";

/// Configuration for the download subsystem.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DownloadConfig {
    /// Directory receiving final artifacts and part files.
    pub charts_dir: PathBuf,
    /// Queue/resume database path.
    pub db_path: PathBuf,
    /// Concurrency bound; must be positive.
    pub max_concurrent: usize,
    /// Sliding-window limiter capacity; must be positive.
    pub rate_capacity: usize,
    /// Sliding-window size in seconds.
    pub rate_window_secs: u64,
    /// Per-attempt timeout in seconds, scaled up under poor conditions.
    pub attempt_timeout_secs: u64,
    /// Network-quality sample interval in seconds.
    pub sample_interval_secs: u64,
    /// Endpoint probed for reachability/latency/throughput.
    pub probe_endpoint: String,
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            charts_dir: PathBuf::from("./charts"),
            db_path: PathBuf::from("./charts/downloads.db"),
            max_concurrent: DEFAULT_MAX_CONCURRENT,
            rate_capacity: DEFAULT_RATE_CAPACITY,
            rate_window_secs: DEFAULT_RATE_WINDOW_SECS,
            attempt_timeout_secs: DEFAULT_ATTEMPT_TIMEOUT_SECS,
            sample_interval_secs: DEFAULT_SAMPLE_INTERVAL_SECS,
            probe_endpoint: DEFAULT_PROBE_ENDPOINT.to_string(),
        }
    }
}

impl DownloadConfig {
    /// Creates the default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the charts directory and relocates the queue database under it.
    #[must_use]
    pub fn with_charts_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.charts_dir = dir.into();
        self.db_path = self.charts_dir.join("downloads.db");
        self
    }

    /// Sets the concurrency bound.
    #[must_use]
    pub fn with_max_concurrent(mut self, max: usize) -> Self {
        self.max_concurrent = max;
        self
    }

    /// Sets the per-attempt timeout.
    #[must_use]
    pub fn with_attempt_timeout(mut self, seconds: u64) -> Self {
        self.attempt_timeout_secs = seconds;
        self
    }

    /// Applies `CHARTLOADER_*` environment overrides on top of `self`.
    #[must_use]
    pub fn with_env_overrides(mut self) -> Self {
        if let Ok(dir) = std::env::var("CHARTLOADER_CHARTS_DIR") {
            self.charts_dir = PathBuf::from(dir);
            self.db_path = self.charts_dir.join("downloads.db");
        }
        if let Ok(value) = std::env::var("CHARTLOADER_MAX_CONCURRENT") {
            if let Ok(parsed) = value.parse() {
                self.max_concurrent = parsed;
            }
        }
        if let Ok(endpoint) = std::env::var("CHARTLOADER_PROBE_ENDPOINT") {
            self.probe_endpoint = endpoint;
        }
        self
    }

    /// Parses a configuration from JSON.
    ///
    /// # Errors
    ///
    /// Returns the serde error for malformed input.
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    /// Serializes the configuration to pretty JSON.
    ///
    /// # Errors
    ///
    /// Returns the serde error if serialization fails.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }

    /// Checks bounds that the runtime cannot work with.
    ///
    /// # Errors
    ///
    /// Returns a description of the first invalid field.
    pub fn validate(&self) -> Result<(), String> {
        if self.max_concurrent == 0 {
            return Err("max_concurrent must be > 0".to_string());
        }
        if self.rate_capacity == 0 {
            return Err("rate_capacity must be > 0".to_string());
        }
        if self.attempt_timeout_secs == 0 {
            return Err("attempt_timeout_secs must be > 0".to_string());
        }
        Ok(())
    }

    /// The sliding-window size as a duration.
    #[must_use]
    pub fn rate_window(&self) -> Duration {
        Duration::from_secs(self.rate_window_secs)
    }

    /// The per-attempt timeout as a duration.
    #[must_use]
    pub fn attempt_timeout(&self) -> Duration {
        Duration::from_secs(self.attempt_timeout_secs)
    }

    /// The probe interval as a duration.
    #[must_use]
    pub fn sample_interval(&self) -> Duration {
        Duration::from_secs(self.sample_interval_secs)
    }
}
