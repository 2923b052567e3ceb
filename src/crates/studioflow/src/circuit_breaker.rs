//! Circuit breaker for a fragile external dependency
//!
//! ```text
//!            failure_threshold consecutive failures
//!   CLOSED ─────────────────────────────────────────▶ OPEN
//!     ▲                                              │  ▲
//!     │ probe succeeds          recovery_timeout     │  │ probe fails, or more than
//!     │                         elapsed (on read)    ▼  │ half_open_max_calls probes
//!     └──────────────────────────────────────── HALF_OPEN
//! ```
//!
//! The OPEN → HALF_OPEN transition is computed lazily whenever the state is read;
//! there is no background timer. Time comes from `tokio::time`, so tests can drive
//! it with a paused clock.
//!
//! Every trip or reset starts a new generation. A call only moves the circuit if it
//! settles in the generation that admitted it, so a straggler from an earlier
//! half-open window can neither close nor re-open the current one.

use crate::config::CircuitBreakerConfig;
use crate::error::{Result, StudioflowError};
use parking_lot::Mutex;
use serde::Serialize;
use std::future::Future;
use tokio::time::Instant;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Closed => "closed",
            Self::Open => "open",
            Self::HalfOpen => "half_open",
        }
    }
}

/// Point-in-time view for health reporting
#[derive(Debug, Clone, Serialize)]
pub struct CircuitSnapshot {
    pub name: String,
    pub state: CircuitState,
    pub consecutive_failures: u32,
    pub half_open_in_flight: u32,
}

#[derive(Debug)]
struct Inner {
    state: CircuitState,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
    half_open_in_flight: u32,
    generation: u64,
}

/// Circuit breaker guarding calls to one dependency
#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    inner: Mutex<Inner>,
}

/// Admission ticket for one call; releases its half-open slot if dropped early
struct Admission<'a> {
    breaker: &'a CircuitBreaker,
    probe: bool,
    generation: u64,
    settled: bool,
}

impl Admission<'_> {
    fn settle(mut self, success: bool) {
        self.settled = true;
        if success {
            self.breaker.on_success(self.probe, self.generation);
        } else {
            self.breaker.on_failure(self.probe, self.generation);
        }
    }
}

impl Drop for Admission<'_> {
    fn drop(&mut self) {
        if !self.settled && self.probe {
            // Cancelled mid-call: free the probe slot without judging the dependency
            let mut inner = self.breaker.inner.lock();
            if inner.state == CircuitState::HalfOpen && inner.generation == self.generation {
                inner.half_open_in_flight = inner.half_open_in_flight.saturating_sub(1);
            }
        }
    }
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            name: name.into(),
            config,
            inner: Mutex::new(Inner {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                opened_at: None,
                half_open_in_flight: 0,
                generation: 0,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current state, applying any due OPEN → HALF_OPEN transition
    pub fn state(&self) -> CircuitState {
        let mut inner = self.inner.lock();
        self.refresh(&mut inner);
        inner.state
    }

    pub fn snapshot(&self) -> CircuitSnapshot {
        let mut inner = self.inner.lock();
        self.refresh(&mut inner);
        CircuitSnapshot {
            name: self.name.clone(),
            state: inner.state,
            consecutive_failures: inner.consecutive_failures,
            half_open_in_flight: inner.half_open_in_flight,
        }
    }

    /// Force the circuit closed
    pub fn reset(&self) {
        let mut inner = self.inner.lock();
        inner.state = CircuitState::Closed;
        inner.consecutive_failures = 0;
        inner.opened_at = None;
        inner.half_open_in_flight = 0;
        inner.generation += 1;
        info!(circuit = %self.name, "Circuit reset");
    }

    /// Run `operation` through the breaker
    ///
    /// While open, fails with [`StudioflowError::CircuitOpen`] without running it.
    pub async fn call<F, Fut, T>(&self, operation: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let admission = self.admit()?;
        let result = operation().await;
        admission.settle(result.is_ok());
        result
    }

    fn admit(&self) -> Result<Admission<'_>> {
        let mut inner = self.inner.lock();
        self.refresh(&mut inner);

        let probe = match inner.state {
            CircuitState::Closed => false,
            CircuitState::Open => return Err(StudioflowError::CircuitOpen(self.name.clone())),
            CircuitState::HalfOpen => {
                if inner.half_open_in_flight >= self.config.half_open_max_calls {
                    self.trip(&mut inner);
                    return Err(StudioflowError::CircuitOpen(self.name.clone()));
                }
                inner.half_open_in_flight += 1;
                true
            }
        };

        Ok(Admission {
            breaker: self,
            probe,
            generation: inner.generation,
            settled: false,
        })
    }

    fn refresh(&self, inner: &mut Inner) {
        if inner.state != CircuitState::Open {
            return;
        }
        let due = inner
            .opened_at
            .map_or(true, |at| at.elapsed() >= self.config.recovery_timeout());
        if due {
            inner.state = CircuitState::HalfOpen;
            inner.half_open_in_flight = 0;
            info!(circuit = %self.name, "Circuit half-open, admitting probes");
        }
    }

    fn trip(&self, inner: &mut Inner) {
        inner.state = CircuitState::Open;
        inner.opened_at = Some(Instant::now());
        inner.half_open_in_flight = 0;
        inner.generation += 1;
        warn!(
            circuit = %self.name,
            consecutive_failures = inner.consecutive_failures,
            "Circuit opened"
        );
    }

    fn on_success(&self, probe: bool, generation: u64) {
        let mut inner = self.inner.lock();
        if inner.generation != generation {
            // Admitted before the last trip or reset
            return;
        }
        match inner.state {
            CircuitState::HalfOpen if probe => {
                inner.state = CircuitState::Closed;
                inner.consecutive_failures = 0;
                inner.opened_at = None;
                inner.half_open_in_flight = 0;
                info!(circuit = %self.name, "Circuit closed");
            }
            CircuitState::Closed => inner.consecutive_failures = 0,
            _ => {}
        }
    }

    fn on_failure(&self, probe: bool, generation: u64) {
        let mut inner = self.inner.lock();
        if inner.generation != generation {
            return;
        }
        match inner.state {
            CircuitState::HalfOpen if probe => {
                inner.consecutive_failures = 0;
                self.trip(&mut inner);
            }
            CircuitState::Closed => {
                inner.consecutive_failures += 1;
                if inner.consecutive_failures >= self.config.failure_threshold {
                    self.trip(&mut inner);
                }
            }
            _ => {}
        }
    }
}
