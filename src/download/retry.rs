//! Retry policy engine: backoff curve, attempt budget, retry predicate.
//!
//! A [`RetryPolicy`] is an immutable value object chosen per operation class.
//! Chart downloads over marine links use a gentler curve than ordinary API
//! calls: servers that rate-limit satellite traffic respond badly to
//! aggressive doubling, so the chart policy grows 1.5× per attempt and caps
//! at 8× the base delay.
//!
//! Attempt numbering is 1-indexed: `delay_for(1)` is the base delay
//! unmodified, and a policy with `max_retries = R` allows `R + 1` total
//! attempts.

use std::time::Duration;

use rand::Rng;
use tracing::{debug, instrument};

use super::classify::ErrorCategory;

/// Default retry budget for chart downloads.
pub const DEFAULT_MAX_RETRIES: u32 = 4;

/// Maximum jitter added to delays (500ms).
const MAX_JITTER: Duration = Duration::from_millis(500);

/// Decision on whether to retry a failed attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryDecision {
    /// Retry after the given delay.
    Retry {
        /// How long to wait before retrying.
        delay: Duration,
        /// The attempt number the retry will be (1-indexed).
        next_attempt: u32,
    },

    /// Do not retry.
    DoNotRetry {
        /// Human-readable reason why retry is not attempted.
        reason: String,
    },
}

/// Immutable retry configuration for one operation class.
///
/// Delay formula: `min(base_delay * multiplier^(attempt-1), max_delay)`,
/// plus bounded jitter when enabled.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Number of retries after the initial attempt.
    max_retries: u32,
    /// Delay before the first retry.
    base_delay: Duration,
    /// Cap on any single delay.
    max_delay: Duration,
    /// Growth factor per attempt.
    backoff_multiplier: f64,
    /// Randomize delays to avoid synchronized retries across tasks.
    jitter: bool,
    /// Opt-in override: treat `Unknown` failures as retryable.
    retry_unknown: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::chart_download()
    }
}

impl RetryPolicy {
    /// Policy for catalog/API requests: steeper 2.0× curve, 1s base, 32s cap.
    #[must_use]
    pub fn api_request() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(32),
            backoff_multiplier: 2.0,
            jitter: true,
            retry_unknown: false,
        }
    }

    /// Policy for large chart transfers over degraded links: gentler 1.5×
    /// curve, 2s base, capped at 8× the base delay.
    #[must_use]
    pub fn chart_download() -> Self {
        let base_delay = Duration::from_secs(2);
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            base_delay,
            max_delay: base_delay * 8,
            backoff_multiplier: 1.5,
            jitter: true,
            retry_unknown: false,
        }
    }

    /// Builds a custom policy. `max_retries` of zero means a single attempt.
    #[must_use]
    pub fn new(
        max_retries: u32,
        base_delay: Duration,
        max_delay: Duration,
        backoff_multiplier: f64,
    ) -> Self {
        Self {
            max_retries,
            base_delay,
            max_delay,
            backoff_multiplier,
            jitter: true,
            retry_unknown: false,
        }
    }

    /// Returns a copy with jitter disabled; used by deterministic tests.
    #[must_use]
    pub fn without_jitter(mut self) -> Self {
        self.jitter = false;
        self
    }

    /// Returns a copy that retries `Unknown` failures. The taxonomy treats
    /// `Unknown` as non-retryable by default; callers who know their
    /// transport surfaces odd-but-transient errors can opt in.
    #[must_use]
    pub fn with_unknown_retryable(mut self) -> Self {
        self.retry_unknown = true;
        self
    }

    /// Returns a copy with a different retry budget.
    #[must_use]
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// The configured retry budget (retries after the first attempt).
    #[must_use]
    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    /// Total attempts allowed, counting the initial one.
    #[must_use]
    pub fn max_attempts(&self) -> u32 {
        self.max_retries + 1
    }

    /// Computes the backoff delay before the retry following `attempt`.
    ///
    /// Attempt 1 returns the base delay unmodified (plus jitter when
    /// enabled); each further attempt multiplies by the backoff factor,
    /// capped at `max_delay`.
    #[must_use]
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = f64::from(attempt.saturating_sub(1));
        let raw_ms = self.base_delay.as_millis() as f64 * self.backoff_multiplier.powf(exponent);
        let capped_ms = raw_ms.min(self.max_delay.as_millis() as f64);

        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let delay = Duration::from_millis(capped_ms as u64);

        if self.jitter {
            delay + jitter()
        } else {
            delay
        }
    }

    /// Whether the attempt that just failed with `category` should be
    /// retried.
    ///
    /// False once the budget is spent; false for permanent categories; true
    /// for transient ones. `ChecksumMismatch` is allowed exactly one retry
    /// regardless of remaining budget. `Unknown` is non-retryable unless the
    /// policy was built with [`with_unknown_retryable`](Self::with_unknown_retryable).
    #[must_use]
    pub fn should_retry(&self, category: ErrorCategory, attempt: u32) -> bool {
        matches!(self.decide(category, attempt), RetryDecision::Retry { .. })
    }

    /// Full retry decision with delay, for the orchestrator's attempt loop.
    #[instrument(skip(self), fields(max_attempts = self.max_attempts()))]
    pub fn decide(&self, category: ErrorCategory, attempt: u32) -> RetryDecision {
        let retryable = match category {
            ErrorCategory::Unknown => self.retry_unknown,
            // A second mismatch on identical bytes means the source is bad,
            // not the link.
            ErrorCategory::ChecksumMismatch => attempt < 2,
            other => other.is_retryable(),
        };

        if !retryable {
            return RetryDecision::DoNotRetry {
                reason: format!("{category} is not retryable"),
            };
        }

        if attempt >= self.max_attempts() {
            debug!(attempt, max = self.max_attempts(), "attempt budget spent");
            return RetryDecision::DoNotRetry {
                reason: format!("attempt budget ({}) exhausted", self.max_attempts()),
            };
        }

        let delay = self.delay_for(attempt);
        debug!(attempt, delay_ms = delay.as_millis(), "will retry");
        RetryDecision::Retry {
            delay,
            next_attempt: attempt + 1,
        }
    }
}

/// Random jitter in `[0, MAX_JITTER]` to avoid synchronized retries when
/// several tasks fail at once.
fn jitter() -> Duration {
    let mut rng = rand::thread_rng();
    Duration::from_millis(rng.gen_range(0..=MAX_JITTER.as_millis() as u64))
}
