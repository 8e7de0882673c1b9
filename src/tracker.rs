//! Request statistics and rate-limit hints.
//!
//! [`StatsTracker`] counts what a client has done since it was built;
//! [`RateLimitTracker`] remembers the quota the service last reported so
//! the next request can be spaced out before the service starts refusing.

use crate::error::parse_retry_after;
use parking_lot::Mutex;
use reqwest::header::HeaderMap;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Remaining-quota header.
pub const RATE_LIMIT_REMAINING: &str = "x-ratelimit-remaining";
/// Seconds until the quota resets.
pub const RATE_LIMIT_RESET: &str = "x-ratelimit-reset";

/// Longest reset window taken from a header.
const MAX_RESET_WINDOW: Duration = Duration::from_secs(24 * 60 * 60);

/// Statistics tracker for client calls.
#[derive(Debug)]
pub struct StatsTracker {
    /// Creation time.
    start_time: Instant,
    /// Logical calls finished.
    total_processed: AtomicU64,
    /// Calls that succeeded.
    success_count: AtomicU64,
    /// Calls that failed.
    failure_count: AtomicU64,
    /// Attempts beyond the first.
    retry_count: AtomicU64,
    /// Attempts refused by the circuit breaker.
    circuit_rejections: AtomicU64,
    /// 429 answers seen.
    rate_limited: AtomicU64,
    /// Total latency of successful calls in microseconds.
    total_latency_us: AtomicU64,
    /// Completions in the last second (for RPS calculation).
    recent_requests: Mutex<VecDeque<Instant>>,
}

impl StatsTracker {
    /// Create a new statistics tracker.
    pub fn new() -> Self {
        Self {
            start_time: Instant::now(),
            total_processed: AtomicU64::new(0),
            success_count: AtomicU64::new(0),
            failure_count: AtomicU64::new(0),
            retry_count: AtomicU64::new(0),
            circuit_rejections: AtomicU64::new(0),
            rate_limited: AtomicU64::new(0),
            total_latency_us: AtomicU64::new(0),
            recent_requests: Mutex::new(VecDeque::new()),
        }
    }

    /// Record a successful call.
    pub fn record_success(&self, latency: Duration) {
        self.total_processed.fetch_add(1, Ordering::Relaxed);
        self.success_count.fetch_add(1, Ordering::Relaxed);
        self.total_latency_us
            .fetch_add(latency.as_micros() as u64, Ordering::Relaxed);
        self.record_recent();
    }

    /// Record a failed call.
    pub fn record_failure(&self) {
        self.total_processed.fetch_add(1, Ordering::Relaxed);
        self.failure_count.fetch_add(1, Ordering::Relaxed);
        self.record_recent();
    }

    /// Record a retry attempt.
    pub fn record_retry(&self) {
        self.retry_count.fetch_add(1, Ordering::Relaxed);
    }

    /// Record an attempt refused by the circuit breaker.
    pub fn record_circuit_rejection(&self) {
        self.circuit_rejections.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a 429 answer.
    pub fn record_rate_limited(&self) {
        self.rate_limited.fetch_add(1, Ordering::Relaxed);
    }

    fn record_recent(&self) {
        let now = Instant::now();
        let mut recent = self.recent_requests.lock();
        recent.push_back(now);
        prune(&mut recent, now);
    }

    /// Calls completed in the last second.
    pub fn requests_per_second(&self) -> f64 {
        let mut recent = self.recent_requests.lock();
        prune(&mut recent, Instant::now());
        recent.len() as f64
    }

    /// Get the current statistics snapshot.
    ///
    /// `token_refreshes` is owned by the token manager and passed in.
    pub fn snapshot(&self, token_refreshes: u64) -> StatsSnapshot {
        let elapsed = self.start_time.elapsed();
        let total = self.total_processed.load(Ordering::Relaxed);
        let success = self.success_count.load(Ordering::Relaxed);
        let total_latency = self.total_latency_us.load(Ordering::Relaxed);

        let avg_latency_ms = if success > 0 {
            (total_latency as f64 / success as f64) / 1000.0
        } else {
            0.0
        };

        let overall_rps = if elapsed.as_secs_f64() > 0.0 {
            total as f64 / elapsed.as_secs_f64()
        } else {
            0.0
        };

        StatsSnapshot {
            elapsed,
            total_processed: total,
            success_count: success,
            failure_count: self.failure_count.load(Ordering::Relaxed),
            retry_count: self.retry_count.load(Ordering::Relaxed),
            circuit_rejections: self.circuit_rejections.load(Ordering::Relaxed),
            rate_limited: self.rate_limited.load(Ordering::Relaxed),
            token_refreshes,
            avg_latency_ms,
            current_rps: self.requests_per_second(),
            overall_rps,
        }
    }
}

impl Default for StatsTracker {
    fn default() -> Self {
        Self::new()
    }
}

fn prune(recent: &mut VecDeque<Instant>, now: Instant) {
    let Some(cutoff) = now.checked_sub(Duration::from_secs(1)) else {
        return;
    };
    while recent.front().is_some_and(|front| *front < cutoff) {
        recent.pop_front();
    }
}

/// A snapshot of client statistics.
#[derive(Debug, Clone)]
pub struct StatsSnapshot {
    /// Time since the client was built.
    pub elapsed: Duration,
    /// Logical calls finished.
    pub total_processed: u64,
    /// Successful calls.
    pub success_count: u64,
    /// Failed calls.
    pub failure_count: u64,
    /// Retry attempts.
    pub retry_count: u64,
    /// Attempts refused by the circuit breaker.
    pub circuit_rejections: u64,
    /// 429 answers seen.
    pub rate_limited: u64,
    /// Bearer token renewals.
    pub token_refreshes: u64,
    /// Average latency of successful calls in milliseconds.
    pub avg_latency_ms: f64,
    /// Calls completed in the last second.
    pub current_rps: f64,
    /// Calls per second since creation.
    pub overall_rps: f64,
}

impl StatsSnapshot {
    /// Get the success rate as a percentage.
    pub fn success_rate(&self) -> f64 {
        if self.total_processed > 0 {
            (self.success_count as f64 / self.total_processed as f64) * 100.0
        } else {
            100.0
        }
    }

    /// Format as a human-readable summary.
    pub fn summary(&self) -> String {
        format!(
            "Calls: {} | Success: {} | Failed: {} | Retries: {} | Breaker rejections: {} | Avg Latency: {:.1}ms | RPS: {:.0}",
            self.total_processed,
            self.success_count,
            self.failure_count,
            self.retry_count,
            self.circuit_rejections,
            self.avg_latency_ms,
            self.current_rps
        )
    }
}

#[derive(Debug, Clone, Copy)]
struct Quota {
    remaining: u64,
    resets_at: Option<Instant>,
}

/// Last quota reported by the service.
#[derive(Debug, Default)]
pub struct RateLimitTracker {
    quota: Mutex<Option<Quota>>,
}

impl RateLimitTracker {
    /// Create a tracker with no hint.
    pub fn new() -> Self {
        Self::default()
    }

    /// Read quota headers from a response. Responses without them leave
    /// the previous hint in place.
    pub fn observe(&self, headers: &HeaderMap) {
        let Some(remaining) = header_u64(headers, RATE_LIMIT_REMAINING) else {
            return;
        };
        let reset = header_u64(headers, RATE_LIMIT_RESET)
            .map(Duration::from_secs)
            .or_else(|| parse_retry_after(headers));

        *self.quota.lock() = Some(Quota {
            remaining,
            resets_at: reset
                .and_then(|d| Instant::now().checked_add(d.min(MAX_RESET_WINDOW))),
        });
    }

    /// Remaining quota last reported, if any.
    pub fn remaining(&self) -> Option<u64> {
        self.quota.lock().map(|q| q.remaining)
    }

    /// How long to hold the next request.
    ///
    /// Nothing while the quota is above `low_water`. Below it, the reset
    /// window is spread over what remains; with nothing left, the whole
    /// window is waited out. Never more than `cap`.
    pub fn pacing_delay(&self, low_water: u64, cap: Duration) -> Option<Duration> {
        let quota = (*self.quota.lock())?;
        if quota.remaining > low_water {
            return None;
        }
        let window = quota
            .resets_at?
            .checked_duration_since(Instant::now())
            .filter(|d| !d.is_zero())?;

        let delay = match quota.remaining {
            0 => window,
            n => window / u32::try_from(n).unwrap_or(u32::MAX),
        };
        Some(delay.min(cap))
    }
}

fn header_u64(headers: &HeaderMap, name: &str) -> Option<u64> {
    headers.get(name)?.to_str().ok()?.trim().parse().ok()
}
