//! Circuit breaker guarding calls against a known-bad core.

use std::sync::Mutex;
use std::time::{Duration, Instant};

use serde::Serialize;

use crate::config::BreakerConfig;
use crate::core::error::{QsysError, Result};

/// Breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum BreakerState {
    /// Calls pass through; failures are counted.
    Closed,
    /// Calls fail fast until the open timeout elapses.
    Open,
    /// One probe call is admitted at a time.
    HalfOpen,
}

impl std::fmt::Display for BreakerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Closed => "CLOSED",
            Self::Open => "OPEN",
            Self::HalfOpen => "HALF_OPEN",
        };
        write!(f, "{}", s)
    }
}

#[derive(Debug)]
struct BreakerInner {
    state: BreakerState,
    consecutive_failures: u32,
    half_open_successes: u32,
    opened_at: Option<Instant>,
    probe_in_flight: bool,
}

/// Three-state circuit breaker.
///
/// Closed: failures increment a counter; at `failure_threshold` the
/// breaker opens. Open: every acquire fails fast until
/// `open_timeout_ms`, then the breaker half-opens. HalfOpen: exactly one
/// probe call is admitted at a time; `success_threshold` successes close
/// the breaker, any failure re-opens it and restarts the timer.
#[derive(Debug)]
pub struct CircuitBreaker {
    config: BreakerConfig,
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    /// Create a closed breaker.
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            config,
            inner: Mutex::new(BreakerInner {
                state: BreakerState::Closed,
                consecutive_failures: 0,
                half_open_successes: 0,
                opened_at: None,
                probe_in_flight: false,
            }),
        }
    }

    /// Current state, advancing Open → HalfOpen when the timer expired.
    pub fn state(&self) -> BreakerState {
        let mut inner = self.inner.lock().expect("breaker lock");
        self.advance(&mut inner);
        inner.state
    }

    /// Ask to make a call. Fails with `CIRCUIT_OPEN` when the breaker
    /// refuses (open, or half-open with a probe already in flight).
    pub fn acquire(&self) -> Result<()> {
        let mut inner = self.inner.lock().expect("breaker lock");
        self.advance(&mut inner);
        match inner.state {
            BreakerState::Closed => Ok(()),
            BreakerState::Open => Err(QsysError::circuit_open()),
            BreakerState::HalfOpen => {
                if inner.probe_in_flight {
                    Err(QsysError::circuit_open())
                } else {
                    inner.probe_in_flight = true;
                    Ok(())
                }
            }
        }
    }

    /// Record a successful call.
    pub fn record_success(&self) {
        let mut inner = self.inner.lock().expect("breaker lock");
        inner.probe_in_flight = false;
        match inner.state {
            BreakerState::Closed => {
                inner.consecutive_failures = 0;
            }
            BreakerState::HalfOpen => {
                inner.half_open_successes += 1;
                if inner.half_open_successes >= self.config.success_threshold {
                    inner.state = BreakerState::Closed;
                    inner.consecutive_failures = 0;
                    inner.half_open_successes = 0;
                    inner.opened_at = None;
                    tracing::info!("Circuit breaker closed");
                }
            }
            BreakerState::Open => {
                // A success while open means a call raced the breaker
                // opening. The counter state stays as-is.
            }
        }
    }

    /// Record a failed call.
    pub fn record_failure(&self) {
        let mut inner = self.inner.lock().expect("breaker lock");
        inner.probe_in_flight = false;
        match inner.state {
            BreakerState::Closed => {
                inner.consecutive_failures += 1;
                if inner.consecutive_failures >= self.config.failure_threshold {
                    self.open(&mut inner);
                }
            }
            BreakerState::HalfOpen => {
                // Any half-open failure re-opens with a fresh timer.
                self.open(&mut inner);
            }
            BreakerState::Open => {}
        }
    }

    /// Consecutive failure count (closed state).
    pub fn consecutive_failures(&self) -> u32 {
        self.inner
            .lock()
            .expect("breaker lock")
            .consecutive_failures
    }

    /// Reset to closed with clean counters.
    pub fn reset(&self) {
        let mut inner = self.inner.lock().expect("breaker lock");
        inner.state = BreakerState::Closed;
        inner.consecutive_failures = 0;
        inner.half_open_successes = 0;
        inner.opened_at = None;
        inner.probe_in_flight = false;
    }

    fn open(&self, inner: &mut BreakerInner) {
        inner.state = BreakerState::Open;
        inner.opened_at = Some(Instant::now());
        inner.half_open_successes = 0;
        tracing::warn!(
            failures = inner.consecutive_failures,
            "Circuit breaker opened"
        );
    }

    fn advance(&self, inner: &mut BreakerInner) {
        if inner.state == BreakerState::Open {
            let elapsed = inner
                .opened_at
                .map(|t| t.elapsed())
                .unwrap_or(Duration::ZERO);
            if elapsed >= Duration::from_millis(self.config.open_timeout_ms) {
                inner.state = BreakerState::HalfOpen;
                inner.half_open_successes = 0;
                inner.probe_in_flight = false;
                tracing::info!("Circuit breaker half-open");
            }
        }
    }
}
