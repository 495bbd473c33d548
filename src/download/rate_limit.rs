//! Sliding-window admission control for outbound chart-server calls.
//!
//! Two gates live here. [`SlidingWindowLimiter`] is the base form: a queue of
//! admission timestamps purged as they age out of the window, shared across
//! all outbound calls of one class. [`PriorityRateLimiter`] layers priority
//! semantics on top: capacity floors reserved per priority, higher-priority
//! waiters admitted before lower ones, and FIFO ordering within a class.
//!
//! The priority variant intentionally privileges urgent traffic: under
//! sustained critical/high load, `low` requests can wait indefinitely.
//! Callers rely on that exclusivity, so it is documented rather than
//! corrected here.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use tokio::time::Instant;
use tracing::{debug, instrument, warn};

use super::task::Priority;

/// Maximum Retry-After value (1 hour) to prevent excessive delays.
const MAX_RETRY_AFTER: Duration = Duration::from_secs(3600);

/// Warning threshold for cumulative admission delay (30 seconds).
const CUMULATIVE_DELAY_WARNING_THRESHOLD: Duration = Duration::from_secs(30);

/// Re-check interval while an admission is blocked by ordering rather than
/// by window capacity.
const ORDERING_POLL: Duration = Duration::from_millis(20);

/// Extra wait applied per strictly-higher-priority request ahead in queue.
const HIGHER_WAITER_DELAY: Duration = Duration::from_millis(25);

/// Sliding-window rate limiter.
///
/// Admissions are timestamps in a queue; an entry counts against capacity
/// until it is older than the window. Designed to be wrapped in `Arc` and
/// shared by every task the orchestrator runs.
#[derive(Debug)]
pub struct SlidingWindowLimiter {
    capacity: usize,
    window: Duration,
    admissions: Mutex<VecDeque<Instant>>,
}

impl SlidingWindowLimiter {
    /// Creates a limiter admitting `capacity` calls per sliding `window`.
    ///
    /// # Panics
    ///
    /// Panics if `capacity` is zero; a zero-capacity gate would never admit.
    #[must_use]
    pub fn new(capacity: usize, window: Duration) -> Self {
        assert!(capacity > 0, "rate limiter capacity must be > 0");
        Self {
            capacity,
            window,
            admissions: Mutex::new(VecDeque::with_capacity(capacity)),
        }
    }

    /// Configured capacity per window.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Configured window size.
    #[must_use]
    pub fn window(&self) -> Duration {
        self.window
    }

    /// Whether a call could be admitted right now without waiting.
    pub fn can_admit(&self) -> bool {
        let mut admissions = self.lock_admissions();
        purge(&mut admissions, self.window);
        admissions.len() < self.capacity
    }

    /// Time until the oldest entry exits the window once at capacity; zero
    /// when below capacity.
    pub fn wait_time(&self) -> Duration {
        let mut admissions = self.lock_admissions();
        purge(&mut admissions, self.window);
        if admissions.len() < self.capacity {
            return Duration::ZERO;
        }
        admissions
            .front()
            .map(|oldest| (*oldest + self.window).saturating_duration_since(Instant::now()))
            .unwrap_or(Duration::ZERO)
    }

    /// Cooperatively waits until a slot is free, then records the admission.
    #[instrument(level = "debug", skip(self))]
    pub async fn acquire(&self) {
        loop {
            let wait = {
                let mut admissions = self.lock_admissions();
                purge(&mut admissions, self.window);
                if admissions.len() < self.capacity {
                    admissions.push_back(Instant::now());
                    return;
                }
                (*admissions.front().unwrap_or(&Instant::now()) + self.window)
                    .saturating_duration_since(Instant::now())
            };
            debug!(wait_ms = wait.as_millis(), "rate limit window full, waiting");
            tokio::time::sleep(wait.max(Duration::from_millis(1))).await;
        }
    }

    fn lock_admissions(&self) -> std::sync::MutexGuard<'_, VecDeque<Instant>> {
        self.admissions
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

fn purge(admissions: &mut VecDeque<Instant>, window: Duration) {
    let now = Instant::now();
    while let Some(front) = admissions.front() {
        if now.duration_since(*front) >= window {
            admissions.pop_front();
        } else {
            break;
        }
    }
}

/// Internal wait/ordering state of the priority limiter.
#[derive(Debug, Default)]
struct PriorityState {
    /// Admission timestamps still inside the window.
    admissions: VecDeque<Instant>,
    /// FIFO ticket queues of waiters, per priority.
    waiting: HashMap<Priority, VecDeque<u64>>,
    /// Monotonic ticket source.
    next_ticket: u64,
}

impl PriorityState {
    fn purge(&mut self, window: Duration) {
        purge(&mut self.admissions, window);
    }

    fn register(&mut self, priority: Priority) -> u64 {
        let ticket = self.next_ticket;
        self.next_ticket += 1;
        self.waiting.entry(priority).or_default().push_back(ticket);
        ticket
    }

    fn deregister(&mut self, priority: Priority, ticket: u64) {
        if let Some(queue) = self.waiting.get_mut(&priority) {
            queue.retain(|t| *t != ticket);
        }
    }

    fn waiting_higher_than(&self, priority: Priority) -> usize {
        self.waiting
            .iter()
            .filter(|(p, _)| p.rank() > priority.rank())
            .map(|(_, queue)| queue.len())
            .sum()
    }

    fn is_class_head(&self, priority: Priority, ticket: u64) -> bool {
        self.waiting
            .get(&priority)
            .and_then(VecDeque::front)
            .is_some_and(|head| *head == ticket)
    }
}

/// Priority-aware sliding-window limiter.
///
/// Extends the base window accounting with:
/// - **capacity reservations**: [`reserve_capacity`](Self::reserve_capacity)
///   sets a floor per priority that other classes cannot consume; the
///   availability seen by class `p` is the total capacity minus every *other*
///   class's reservation;
/// - **priority ordering**: no request proceeds while a strictly
///   higher-priority request is waiting; within one class, admission is FIFO;
/// - **scaled waits**: the base window wait is multiplied per priority
///   (critical fastest, low slowest), plus a small delay per higher-priority
///   waiter ahead in queue.
#[derive(Debug)]
pub struct PriorityRateLimiter {
    capacity: usize,
    window: Duration,
    reservations: DashMap<Priority, usize>,
    state: Mutex<PriorityState>,
    /// Total time callers have spent blocked on this gate, for the
    /// excessive-limiting warning.
    cumulative_delay_ms: AtomicU64,
}

impl PriorityRateLimiter {
    /// Creates a priority limiter admitting `capacity` calls per `window`.
    ///
    /// # Panics
    ///
    /// Panics if `capacity` is zero.
    #[must_use]
    pub fn new(capacity: usize, window: Duration) -> Self {
        assert!(capacity > 0, "rate limiter capacity must be > 0");
        Self {
            capacity,
            window,
            reservations: DashMap::new(),
            state: Mutex::new(PriorityState::default()),
            cumulative_delay_ms: AtomicU64::new(0),
        }
    }

    /// Configured capacity per window.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Reserves `n` slots of the window for `priority`. Other classes see a
    /// capacity reduced by the sum of every reservation that is not theirs.
    ///
    /// Reservations over total capacity are clamped with a warning.
    pub fn reserve_capacity(&self, priority: Priority, n: usize) {
        let clamped = n.min(self.capacity);
        if clamped < n {
            warn!(
                priority = %priority,
                requested = n,
                capacity = self.capacity,
                "reservation exceeds capacity, clamping"
            );
        }
        self.reservations.insert(priority, clamped);
    }

    /// Capacity visible to `priority` after subtracting other classes'
    /// reservations. Never below 1 for a class holding its own reservation.
    #[must_use]
    pub fn effective_capacity(&self, priority: Priority) -> usize {
        let reserved_by_others: usize = self
            .reservations
            .iter()
            .filter(|entry| *entry.key() != priority)
            .map(|entry| *entry.value())
            .sum();
        self.capacity.saturating_sub(reserved_by_others)
    }

    /// Whether a request at `priority` could be admitted right now.
    pub fn can_admit(&self, priority: Priority) -> bool {
        let mut state = self.lock_state();
        state.purge(self.window);
        state.waiting_higher_than(priority) == 0
            && state.admissions.len() < self.effective_capacity(priority)
    }

    /// Estimated wait for a request at `priority`: the base window wait
    /// scaled by the class multiplier, plus a delay per strictly-higher
    /// waiter ahead in queue.
    pub fn wait_time(&self, priority: Priority) -> Duration {
        let mut state = self.lock_state();
        state.purge(self.window);
        let higher = state.waiting_higher_than(priority);
        let base = if state.admissions.len() < self.effective_capacity(priority) {
            Duration::ZERO
        } else {
            state
                .admissions
                .front()
                .map(|oldest| (*oldest + self.window).saturating_duration_since(Instant::now()))
                .unwrap_or(Duration::ZERO)
        };
        scale_wait(base, priority) + HIGHER_WAITER_DELAY * higher as u32
    }

    /// Cooperatively waits for admission at `priority`, respecting
    /// reservations, priority ordering, and in-class FIFO.
    ///
    /// Cancel-safe: dropping the future mid-wait releases the waiter's queue
    /// position.
    #[instrument(level = "debug", skip(self))]
    pub async fn acquire(&self, priority: Priority) {
        let ticket = self.lock_state().register(priority);
        let mut guard = WaitGuard {
            limiter: self,
            priority,
            ticket,
            admitted: false,
        };

        loop {
            let wait = {
                let mut state = self.lock_state();
                state.purge(self.window);

                let higher = state.waiting_higher_than(priority);
                let at_head = state.is_class_head(priority, ticket);
                let capacity = self.effective_capacity(priority);

                if higher == 0 && at_head && state.admissions.len() < capacity {
                    state.admissions.push_back(Instant::now());
                    state.deregister(priority, ticket);
                    guard.admitted = true;
                    return;
                }

                let base = if state.admissions.len() >= capacity {
                    state
                        .admissions
                        .front()
                        .map(|oldest| {
                            (*oldest + self.window).saturating_duration_since(Instant::now())
                        })
                        .unwrap_or(ORDERING_POLL)
                } else {
                    // Blocked on ordering, not on the window: poll soon.
                    ORDERING_POLL
                };
                scale_wait(base, priority) + HIGHER_WAITER_DELAY * higher as u32
            };
            let wait = wait.max(Duration::from_millis(1));
            let cumulative = self.add_cumulative_delay(wait);
            debug!(
                priority = %priority,
                wait_ms = wait.as_millis(),
                cumulative_ms = cumulative.as_millis(),
                "waiting for priority admission"
            );
            if cumulative >= CUMULATIVE_DELAY_WARNING_THRESHOLD {
                warn!(
                    priority = %priority,
                    cumulative_delay_secs = cumulative.as_secs(),
                    "excessive rate limiting - chart server may be under heavy load"
                );
            }
            tokio::time::sleep(wait).await;
        }
    }

    /// Records a server-mandated rate-limit delay (from a Retry-After
    /// header) against the cumulative-delay accounting, so server pushback
    /// trips the same excessive-limiting warning as local waiting.
    pub fn record_rate_limit(&self, delay: Duration) {
        let cumulative = self.add_cumulative_delay(delay);
        debug!(
            delay_ms = delay.as_millis(),
            cumulative_ms = cumulative.as_millis(),
            "recorded server rate limit"
        );
        if cumulative >= CUMULATIVE_DELAY_WARNING_THRESHOLD {
            warn!(
                cumulative_delay_secs = cumulative.as_secs(),
                "excessive server rate limiting - chart server may be under heavy load"
            );
        }
    }

    /// Total time spent blocked on this gate plus recorded server delays.
    #[must_use]
    pub fn cumulative_delay(&self) -> Duration {
        Duration::from_millis(self.cumulative_delay_ms.load(Ordering::Relaxed))
    }

    fn add_cumulative_delay(&self, delay: Duration) -> Duration {
        let total = self
            .cumulative_delay_ms
            .fetch_add(delay.as_millis() as u64, Ordering::Relaxed)
            + delay.as_millis() as u64;
        Duration::from_millis(total)
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, PriorityState> {
        self.state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

/// Removes the waiter's ticket if its `acquire` future is dropped before
/// admission, so an abandoned wait cannot block its class's FIFO head.
struct WaitGuard<'a> {
    limiter: &'a PriorityRateLimiter,
    priority: Priority,
    ticket: u64,
    admitted: bool,
}

impl Drop for WaitGuard<'_> {
    fn drop(&mut self) {
        if !self.admitted {
            self.limiter
                .lock_state()
                .deregister(self.priority, self.ticket);
        }
    }
}

/// Per-priority wait multiplier: critical fastest, low slowest.
fn scale_wait(base: Duration, priority: Priority) -> Duration {
    let factor = match priority {
        Priority::Critical => 0.25,
        Priority::High => 0.5,
        Priority::Normal => 1.0,
        Priority::Low => 2.0,
    };
    base.mul_f64(factor)
}

/// Parses a Retry-After header value into a Duration.
///
/// Supports both RFC 7231 forms: integer seconds and HTTP-date. Negative or
/// unparseable values yield `None`; values over one hour are capped.
#[must_use]
pub fn parse_retry_after(header_value: &str) -> Option<Duration> {
    let header_value = header_value.trim();

    if let Ok(seconds) = header_value.parse::<i64>() {
        if seconds < 0 {
            debug!(seconds, "negative Retry-After value, ignoring");
            return None;
        }
        #[allow(clippy::cast_sign_loss)]
        let duration = Duration::from_secs(seconds as u64);
        if duration > MAX_RETRY_AFTER {
            warn!(
                seconds,
                max_seconds = MAX_RETRY_AFTER.as_secs(),
                "Retry-After exceeds maximum, capping at 1 hour"
            );
            return Some(MAX_RETRY_AFTER);
        }
        return Some(duration);
    }

    if let Ok(datetime) = httpdate::parse_http_date(header_value) {
        let now = std::time::SystemTime::now();
        if let Ok(duration) = datetime.duration_since(now) {
            if duration > MAX_RETRY_AFTER {
                return Some(MAX_RETRY_AFTER);
            }
            Some(duration)
        } else {
            // Date is in the past.
            Some(Duration::ZERO)
        }
    } else {
        debug!(header_value, "unparseable Retry-After value");
        None
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    // ==================== SlidingWindowLimiter ====================

    #[tokio::test]
    async fn test_admissions_below_capacity_are_immediate() {
        tokio::time::pause();
        let limiter = SlidingWindowLimiter::new(3, Duration::from_secs(10));
        let start = Instant::now();
        limiter.acquire().await;
        limiter.acquire().await;
        limiter.acquire().await;
        assert!(start.elapsed() < Duration::from_millis(10));
    }

    #[tokio::test]
    async fn test_capacity_plus_one_waits_out_the_window() {
        tokio::time::pause();
        let window = Duration::from_secs(10);
        let limiter = SlidingWindowLimiter::new(2, window);
        limiter.acquire().await;
        limiter.acquire().await;

        let start = Instant::now();
        limiter.acquire().await;
        // The third acquisition must wait at least until the first entry
        // ages out of the window.
        assert!(start.elapsed() >= window);
    }

    #[tokio::test]
    async fn test_entries_age_out_and_free_capacity() {
        tokio::time::pause();
        let limiter = SlidingWindowLimiter::new(1, Duration::from_secs(5));
        limiter.acquire().await;
        assert!(!limiter.can_admit());

        tokio::time::sleep(Duration::from_secs(6)).await;
        assert!(limiter.can_admit());
        assert_eq!(limiter.wait_time(), Duration::ZERO);
    }

    #[tokio::test]
    async fn test_wait_time_zero_below_capacity() {
        let limiter = SlidingWindowLimiter::new(2, Duration::from_secs(10));
        assert_eq!(limiter.wait_time(), Duration::ZERO);
    }

    #[tokio::test]
    async fn test_wait_time_tracks_oldest_entry() {
        tokio::time::pause();
        let limiter = SlidingWindowLimiter::new(1, Duration::from_secs(10));
        limiter.acquire().await;
        tokio::time::sleep(Duration::from_secs(4)).await;
        let wait = limiter.wait_time();
        assert!(wait <= Duration::from_secs(6));
        assert!(wait >= Duration::from_secs(5));
    }

    #[test]
    #[should_panic(expected = "capacity must be > 0")]
    fn test_zero_capacity_rejected() {
        let _ = SlidingWindowLimiter::new(0, Duration::from_secs(1));
    }

    // ==================== PriorityRateLimiter ====================

    #[test]
    fn test_effective_capacity_subtracts_other_reservations() {
        let limiter = PriorityRateLimiter::new(10, Duration::from_secs(10));
        limiter.reserve_capacity(Priority::Critical, 4);
        limiter.reserve_capacity(Priority::High, 2);

        // Normal sees 10 - (4 + 2) = 4.
        assert_eq!(limiter.effective_capacity(Priority::Normal), 4);
        // Critical keeps its own reservation: 10 - 2 = 8.
        assert_eq!(limiter.effective_capacity(Priority::Critical), 8);
        assert_eq!(limiter.effective_capacity(Priority::High), 6);
    }

    #[test]
    fn test_reservation_clamped_to_capacity() {
        let limiter = PriorityRateLimiter::new(3, Duration::from_secs(10));
        limiter.reserve_capacity(Priority::Critical, 99);
        assert_eq!(limiter.effective_capacity(Priority::Low), 0);
        assert_eq!(limiter.effective_capacity(Priority::Critical), 3);
    }

    #[tokio::test]
    async fn test_reserved_floor_blocks_other_classes() {
        tokio::time::pause();
        let limiter = PriorityRateLimiter::new(2, Duration::from_secs(10));
        limiter.reserve_capacity(Priority::Critical, 1);

        // Normal can only use 1 of the 2 slots.
        limiter.acquire(Priority::Normal).await;
        assert!(!limiter.can_admit(Priority::Normal));
        // Critical still has room.
        assert!(limiter.can_admit(Priority::Critical));
        limiter.acquire(Priority::Critical).await;
        assert!(!limiter.can_admit(Priority::Critical));
    }

    #[tokio::test]
    async fn test_higher_priority_waiter_blocks_lower_admission() {
        tokio::time::pause();
        let limiter = std::sync::Arc::new(PriorityRateLimiter::new(1, Duration::from_secs(5)));
        limiter.acquire(Priority::Critical).await;

        // A critical waiter queues up behind the full window.
        let critical = {
            let limiter = std::sync::Arc::clone(&limiter);
            tokio::spawn(async move {
                limiter.acquire(Priority::Critical).await;
                Instant::now()
            })
        };
        // Give the critical waiter time to register.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!limiter.can_admit(Priority::Low));

        let low = {
            let limiter = std::sync::Arc::clone(&limiter);
            tokio::spawn(async move {
                limiter.acquire(Priority::Low).await;
                Instant::now()
            })
        };

        let critical_at = critical.await.unwrap();
        let low_at = low.await.unwrap();
        assert!(
            critical_at <= low_at,
            "critical admitted at {critical_at:?}, low at {low_at:?}"
        );
    }

    #[tokio::test]
    async fn test_same_class_admitted_fifo() {
        tokio::time::pause();
        let limiter = std::sync::Arc::new(PriorityRateLimiter::new(1, Duration::from_secs(2)));
        limiter.acquire(Priority::Normal).await;

        let mut handles = Vec::new();
        for i in 0..3u32 {
            let limiter = std::sync::Arc::clone(&limiter);
            handles.push(tokio::spawn(async move {
                limiter.acquire(Priority::Normal).await;
                (i, Instant::now())
            }));
            // Stagger registration so tickets are ordered.
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        let mut admissions = Vec::new();
        for handle in handles {
            admissions.push(handle.await.unwrap());
        }
        admissions.sort_by_key(|(_, at)| *at);
        let order: Vec<u32> = admissions.iter().map(|(i, _)| *i).collect();
        assert_eq!(order, vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn test_dropped_waiter_releases_queue_position() {
        tokio::time::pause();
        let limiter = std::sync::Arc::new(PriorityRateLimiter::new(1, Duration::from_secs(3)));
        limiter.acquire(Priority::Normal).await;

        // Start a waiter, then drop it before admission.
        let abandoned = {
            let limiter = std::sync::Arc::clone(&limiter);
            tokio::spawn(async move { limiter.acquire(Priority::Normal).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        abandoned.abort();
        let _ = abandoned.await;

        // A later waiter in the same class must still be admitted.
        let start = Instant::now();
        limiter.acquire(Priority::Normal).await;
        assert!(start.elapsed() < Duration::from_secs(60));
    }

    #[test]
    fn test_wait_time_scaled_by_priority() {
        let limiter = PriorityRateLimiter::new(1, Duration::from_secs(10));
        // Empty window: zero wait regardless of class.
        assert_eq!(limiter.wait_time(Priority::Low), Duration::ZERO);
    }

    #[test]
    fn test_record_rate_limit_accumulates() {
        let limiter = PriorityRateLimiter::new(4, Duration::from_secs(10));
        assert_eq!(limiter.cumulative_delay(), Duration::ZERO);
        limiter.record_rate_limit(Duration::from_secs(5));
        limiter.record_rate_limit(Duration::from_secs(10));
        assert_eq!(limiter.cumulative_delay(), Duration::from_secs(15));
    }

    #[tokio::test]
    async fn test_blocked_acquire_counts_toward_cumulative_delay() {
        tokio::time::pause();
        let limiter = PriorityRateLimiter::new(1, Duration::from_secs(5));
        limiter.acquire(Priority::Normal).await;
        assert_eq!(limiter.cumulative_delay(), Duration::ZERO);

        // Second acquisition waits out the window and records the wait.
        limiter.acquire(Priority::Normal).await;
        assert!(limiter.cumulative_delay() >= Duration::from_secs(4));
    }

    // ==================== parse_retry_after ====================

    #[test]
    fn test_parse_retry_after_seconds() {
        assert_eq!(parse_retry_after("120"), Some(Duration::from_secs(120)));
        assert_eq!(parse_retry_after("0"), Some(Duration::ZERO));
        assert_eq!(parse_retry_after("  30  "), Some(Duration::from_secs(30)));
    }

    #[test]
    fn test_parse_retry_after_rejects_garbage() {
        assert_eq!(parse_retry_after("-5"), None);
        assert_eq!(parse_retry_after("soon"), None);
        assert_eq!(parse_retry_after(""), None);
    }

    #[test]
    fn test_parse_retry_after_caps_at_one_hour() {
        assert_eq!(parse_retry_after("7200"), Some(Duration::from_secs(3600)));
    }

    #[test]
    fn test_parse_retry_after_http_date_in_past_is_zero() {
        assert_eq!(
            parse_retry_after("Wed, 01 Jan 2020 00:00:00 GMT"),
            Some(Duration::ZERO)
        );
    }

    #[test]
    fn test_parse_retry_after_http_date_in_future() {
        let future = std::time::SystemTime::now() + Duration::from_secs(60);
        let value = httpdate::fmt_http_date(future);
        let parsed = parse_retry_after(&value).unwrap();
        assert!(parsed >= Duration::from_secs(55));
        assert!(parsed <= Duration::from_secs(65));
    }
}
