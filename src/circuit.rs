//! Circuit breaker shared by every call a client makes.
//!
//! All state lives behind one mutex so each admission and each outcome is a
//! single atomic transition. While half-open, exactly one trial request is
//! admitted; the trial slot is released when its [`Permit`] records an
//! outcome or is dropped.

use crate::error::FreeseekError;
use parking_lot::Mutex;
use std::time::{Duration, Instant};
use tracing::{info, warn};

/// The state of a circuit breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CircuitState {
    /// Requests flow through normally.
    #[default]
    Closed,
    /// Requests fail fast without touching the network.
    Open,
    /// One trial request is allowed to probe for recovery.
    HalfOpen,
}

/// Breaker thresholds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CircuitSettings {
    /// Consecutive service faults before opening.
    pub failure_threshold: u32,
    /// Time spent open before a trial is admitted.
    pub recovery_timeout: Duration,
}

/// Point-in-time view of the breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CircuitSnapshot {
    /// Current state.
    pub state: CircuitState,
    /// Consecutive faults recorded while closed.
    pub consecutive_failures: u32,
    /// Whether a half-open trial is in flight.
    pub trial_in_flight: bool,
}

#[derive(Debug)]
struct Inner {
    settings: CircuitSettings,
    state: CircuitState,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
    trial_in_flight: bool,
}

impl Inner {
    /// Move Open to HalfOpen once the recovery timeout has elapsed.
    fn refresh(&mut self, now: Instant) {
        if self.state == CircuitState::Open {
            let elapsed = self.opened_at.map_or(Duration::MAX, |at| now.duration_since(at));
            if elapsed >= self.settings.recovery_timeout {
                self.state = CircuitState::HalfOpen;
                self.trial_in_flight = false;
                info!("Circuit breaker half-open, admitting a trial request");
            }
        }
    }

    fn open(&mut self, now: Instant) {
        self.state = CircuitState::Open;
        self.opened_at = Some(now);
        self.trial_in_flight = false;
        warn!(
            failures = self.consecutive_failures,
            recovery_ms = self.settings.recovery_timeout.as_millis() as u64,
            "Circuit breaker opened"
        );
    }

    fn close(&mut self) {
        if self.state != CircuitState::Closed {
            info!("Circuit breaker closed");
        }
        self.state = CircuitState::Closed;
        self.consecutive_failures = 0;
        self.opened_at = None;
        self.trial_in_flight = false;
    }

    fn retry_in(&self, now: Instant) -> Duration {
        self.opened_at.map_or(Duration::ZERO, |at| {
            self.settings
                .recovery_timeout
                .saturating_sub(now.duration_since(at))
        })
    }
}

/// A failure-threshold circuit breaker.
#[derive(Debug)]
pub struct CircuitBreaker {
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    /// Create a closed breaker.
    pub fn new(settings: CircuitSettings) -> Self {
        Self {
            inner: Mutex::new(Inner {
                settings,
                state: CircuitState::Closed,
                consecutive_failures: 0,
                opened_at: None,
                trial_in_flight: false,
            }),
        }
    }

    /// Ask to send one request.
    ///
    /// Fails with [`FreeseekError::CircuitOpen`] while open, and while
    /// half-open if the trial slot is already taken.
    pub fn try_acquire(&self) -> Result<Permit<'_>, FreeseekError> {
        let now = Instant::now();
        let mut inner = self.inner.lock();
        inner.refresh(now);

        match inner.state {
            CircuitState::Closed => Ok(Permit::new(self, false)),
            CircuitState::HalfOpen if !inner.trial_in_flight => {
                inner.trial_in_flight = true;
                Ok(Permit::new(self, true))
            }
            CircuitState::HalfOpen => Err(FreeseekError::CircuitOpen {
                retry_in: Duration::ZERO,
            }),
            CircuitState::Open => Err(FreeseekError::CircuitOpen {
                retry_in: inner.retry_in(now),
            }),
        }
    }

    /// Current state, with Open reported as HalfOpen once recovery is due.
    pub fn state(&self) -> CircuitState {
        let mut inner = self.inner.lock();
        inner.refresh(Instant::now());
        inner.state
    }

    /// Current state and counters.
    pub fn snapshot(&self) -> CircuitSnapshot {
        let mut inner = self.inner.lock();
        inner.refresh(Instant::now());
        CircuitSnapshot {
            state: inner.state,
            consecutive_failures: inner.consecutive_failures,
            trial_in_flight: inner.trial_in_flight,
        }
    }

    /// Replace thresholds. The current state is kept.
    pub fn reconfigure(&self, settings: CircuitSettings) {
        self.inner.lock().settings = settings;
    }

    /// Force the breaker closed.
    pub fn reset(&self) {
        self.inner.lock().close();
    }

    fn on_success(&self, trial: bool) {
        let mut inner = self.inner.lock();
        match inner.state {
            CircuitState::HalfOpen if trial => inner.close(),
            CircuitState::Closed => inner.consecutive_failures = 0,
            // A request admitted before the breaker opened; its success
            // says nothing about the current trial.
            _ => {}
        }
    }

    fn on_failure(&self, trial: bool) {
        let now = Instant::now();
        let mut inner = self.inner.lock();
        match inner.state {
            CircuitState::Closed => {
                inner.consecutive_failures += 1;
                if inner.consecutive_failures >= inner.settings.failure_threshold {
                    inner.open(now);
                }
            }
            CircuitState::HalfOpen if trial => inner.open(now),
            _ => {}
        }
    }

    fn on_abandon(&self) {
        let mut inner = self.inner.lock();
        if inner.state == CircuitState::HalfOpen {
            inner.trial_in_flight = false;
        }
    }
}

/// Admission ticket for one request.
///
/// Record the outcome with [`Permit::success`] or [`Permit::failure`].
/// Dropping an unrecorded trial permit frees the half-open slot.
#[derive(Debug)]
#[must_use = "a permit should record the request outcome"]
pub struct Permit<'a> {
    breaker: &'a CircuitBreaker,
    trial: bool,
    recorded: bool,
}

impl<'a> Permit<'a> {
    fn new(breaker: &'a CircuitBreaker, trial: bool) -> Self {
        Self {
            breaker,
            trial,
            recorded: false,
        }
    }

    /// Whether this permit is the half-open trial.
    pub fn is_trial(&self) -> bool {
        self.trial
    }

    /// The service answered.
    pub fn success(mut self) {
        self.recorded = true;
        self.breaker.on_success(self.trial);
    }

    /// The service faulted.
    pub fn failure(mut self) {
        self.recorded = true;
        self.breaker.on_failure(self.trial);
    }
}

impl Drop for Permit<'_> {
    fn drop(&mut self) {
        if !self.recorded && self.trial {
            self.breaker.on_abandon();
        }
    }
}
