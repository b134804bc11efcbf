//! Three-state failure gate for an upstream provider.
//!
//! ```text
//! Closed --[failures >= max_failures]--> Open
//! Open --[retry_after elapsed, next is_open()]--> HalfOpen (one trial admitted)
//! HalfOpen --[record_success]--> Closed
//! HalfOpen --[record_failure]--> Open
//! ```
//!
//! While half-open the single trial is in flight; every other caller is
//! refused until it reports back.

use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::sync::lock;

/// Circuit breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Calls flow; failures accumulate.
    Closed,
    /// Calls are refused until the cooldown elapses.
    Open,
    /// One trial call is in flight.
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Closed => "closed",
            Self::Open => "open",
            Self::HalfOpen => "half-open",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug)]
struct BreakerInner {
    state: CircuitState,
    failures: u32,
    last_failure: Option<Instant>,
}

#[derive(Debug)]
pub struct CircuitBreaker {
    max_failures: u32,
    retry_after: Duration,
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    pub fn new(max_failures: u32, retry_after: Duration) -> Self {
        Self {
            max_failures: max_failures.max(1),
            retry_after,
            inner: Mutex::new(BreakerInner {
                state: CircuitState::Closed,
                failures: 0,
                last_failure: None,
            }),
        }
    }

    /// Whether a call must be refused right now.
    ///
    /// When the cooldown has elapsed on an open circuit this flips it to
    /// half-open and returns `false` for exactly this caller, admitting it as
    /// the trial.
    pub fn is_open(&self) -> bool {
        let mut inner = lock(&self.inner);
        match inner.state {
            CircuitState::Closed => false,
            CircuitState::HalfOpen => true,
            CircuitState::Open => {
                let cooled = inner
                    .last_failure
                    .is_none_or(|at| at.elapsed() >= self.retry_after);
                if cooled {
                    inner.state = CircuitState::HalfOpen;
                    tracing::info!("Circuit half-open, admitting trial call");
                    false
                } else {
                    true
                }
            }
        }
    }

    /// Report a successful call. Closes the circuit and clears failures.
    pub fn record_success(&self) {
        let mut inner = lock(&self.inner);
        if inner.state != CircuitState::Closed {
            tracing::info!(from = %inner.state, "Circuit closed");
        }
        inner.state = CircuitState::Closed;
        inner.failures = 0;
    }

    /// Report a failed call.
    pub fn record_failure(&self) {
        let mut inner = lock(&self.inner);
        inner.failures = inner.failures.saturating_add(1);
        inner.last_failure = Some(Instant::now());

        let trip = match inner.state {
            CircuitState::HalfOpen => true,
            CircuitState::Closed => inner.failures >= self.max_failures,
            CircuitState::Open => false,
        };
        if trip {
            tracing::warn!(
                failures = inner.failures,
                retry_after_ms = self.retry_after.as_millis() as u64,
                "Circuit opened"
            );
            inner.state = CircuitState::Open;
        }
    }

    /// Give up a half-open trial that never reported back. The circuit
    /// returns to open with its cooldown already elapsed, so the next caller
    /// becomes the new trial. Does nothing outside half-open.
    pub fn release_trial(&self) {
        let mut inner = lock(&self.inner);
        if inner.state == CircuitState::HalfOpen {
            inner.state = CircuitState::Open;
            tracing::debug!("Circuit trial abandoned");
        }
    }

    pub fn state(&self) -> CircuitState {
        lock(&self.inner).state
    }

    pub fn failures(&self) -> u32 {
        lock(&self.inner).failures
    }
}
