//! Circuit breaker guarding calls to the server.
//!
//! ```text
//!   Closed ──(failure_threshold consecutive failures)──► Open
//!     ▲                                                   │
//!     │                                        reset_timeout elapsed
//!     │                                                   ▼
//!     └──(half_open_max_calls successes)────────────── HalfOpen
//!                                                         │
//!                      any failure ───────────────────────┘──► Open
//! ```
//!
//! Outcome classification: transport failures, timeouts and protocol errors
//! count against the circuit. A server-side error is a healthy round trip and
//! counts as success. Cancellation and calls rejected before reaching the
//! server are neutral.

use std::fmt;
use std::future::Future;
use std::sync::{Mutex, MutexGuard, PoisonError};

use tokio::time::Instant;

use crate::config::CircuitBreakerConfig;
use crate::error::{BridgeError, ErrorKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Calls pass through.
    Closed,
    /// Calls are rejected with [`BridgeError::CircuitOpen`].
    Open,
    /// A limited number of trial calls pass through.
    HalfOpen,
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "closed"),
            CircuitState::Open => write!(f, "open"),
            CircuitState::HalfOpen => write!(f, "half-open"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Success,
    Failure,
    Neutral,
}

fn classify<T>(result: &Result<T, BridgeError>) -> Outcome {
    match result {
        Ok(_) => Outcome::Success,
        Err(e) => match e.kind() {
            ErrorKind::Transport | ErrorKind::Timeout | ErrorKind::Protocol => Outcome::Failure,
            ErrorKind::Server => Outcome::Success,
            ErrorKind::Cancelled | ErrorKind::NotRunning | ErrorKind::CircuitOpen => {
                Outcome::Neutral
            }
        },
    }
}

#[derive(Debug)]
struct Inner {
    state: CircuitState,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
    half_open_in_flight: u32,
    half_open_successes: u32,
    /// Bumped on every transition; outcomes from an older generation are ignored.
    generation: u64,
}

impl Inner {
    fn transition(&mut self, to: CircuitState) {
        let from = self.state;
        self.state = to;
        self.generation += 1;
        self.half_open_in_flight = 0;
        self.half_open_successes = 0;
        match to {
            CircuitState::Open => self.opened_at = Some(Instant::now()),
            CircuitState::Closed => {
                self.opened_at = None;
                self.consecutive_failures = 0;
            }
            CircuitState::HalfOpen => {}
        }
        tracing::info!(from = %from, to = %to, "Circuit breaker state change");
    }
}

#[derive(Debug)]
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    inner: Mutex<Inner>,
}

/// Admission ticket for one call. Dropping it unsettled frees a trial slot.
struct Permit<'a> {
    breaker: &'a CircuitBreaker,
    generation: u64,
    trial: bool,
    settled: bool,
}

impl Permit<'_> {
    fn settle(mut self, outcome: Outcome) {
        self.settled = true;
        self.breaker.record(self.generation, self.trial, outcome);
    }
}

impl Drop for Permit<'_> {
    fn drop(&mut self) {
        if !self.settled {
            self.breaker.record(self.generation, self.trial, Outcome::Neutral);
        }
    }
}

impl CircuitBreaker {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            inner: Mutex::new(Inner {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                opened_at: None,
                half_open_in_flight: 0,
                half_open_successes: 0,
                generation: 0,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|poisoned| {
            tracing::error!("Circuit breaker lock poisoned - recovering");
            PoisonError::into_inner(poisoned)
        })
    }

    /// Current state, applying a pending Open -> HalfOpen transition.
    pub fn state(&self) -> CircuitState {
        let mut inner = self.lock();
        self.maybe_half_open(&mut inner);
        inner.state
    }

    /// Consecutive failures counted while closed.
    pub fn failure_count(&self) -> u32 {
        self.lock().consecutive_failures
    }

    fn maybe_half_open(&self, inner: &mut Inner) {
        if inner.state == CircuitState::Open
            && inner
                .opened_at
                .is_some_and(|at| at.elapsed() >= self.config.reset_timeout)
        {
            inner.transition(CircuitState::HalfOpen);
        }
    }

    fn try_acquire(&self) -> Result<Permit<'_>, BridgeError> {
        let mut inner = self.lock();
        self.maybe_half_open(&mut inner);

        let trial = match inner.state {
            CircuitState::Closed => false,
            CircuitState::Open => {
                tracing::debug!("Circuit breaker is open, rejecting call");
                return Err(BridgeError::CircuitOpen);
            }
            CircuitState::HalfOpen => {
                if inner.half_open_in_flight >= self.config.half_open_max_calls {
                    tracing::debug!("Circuit breaker trial slots exhausted, rejecting call");
                    return Err(BridgeError::CircuitOpen);
                }
                inner.half_open_in_flight += 1;
                true
            }
        };

        Ok(Permit {
            breaker: self,
            generation: inner.generation,
            trial,
            settled: false,
        })
    }

    fn record(&self, generation: u64, trial: bool, outcome: Outcome) {
        let mut inner = self.lock();
        if inner.generation != generation {
            return;
        }
        if trial {
            inner.half_open_in_flight = inner.half_open_in_flight.saturating_sub(1);
        }

        match (inner.state, outcome) {
            (_, Outcome::Neutral) => {}
            (CircuitState::Closed, Outcome::Success) => inner.consecutive_failures = 0,
            (CircuitState::Closed, Outcome::Failure) => {
                inner.consecutive_failures += 1;
                if inner.consecutive_failures >= self.config.failure_threshold {
                    tracing::warn!(
                        failures = inner.consecutive_failures,
                        "Failure threshold reached, opening circuit"
                    );
                    inner.transition(CircuitState::Open);
                }
            }
            (CircuitState::HalfOpen, Outcome::Success) => {
                inner.half_open_successes += 1;
                if inner.half_open_successes >= self.config.half_open_max_calls {
                    inner.transition(CircuitState::Closed);
                }
            }
            (CircuitState::HalfOpen, Outcome::Failure) => {
                tracing::warn!("Trial call failed, reopening circuit");
                inner.transition(CircuitState::Open);
            }
            (CircuitState::Open, _) => {}
        }
    }

    /// Run `operation` through the breaker on the calling thread.
    pub fn call<T>(
        &self,
        operation: impl FnOnce() -> Result<T, BridgeError>,
    ) -> Result<T, BridgeError> {
        let permit = self.try_acquire()?;
        let result = operation();
        permit.settle(classify(&result));
        result
    }

    /// Run `operation` through the breaker. A future dropped mid-flight
    /// releases its trial slot without counting.
    pub async fn call_async<T, F, Fut>(&self, operation: F) -> Result<T, BridgeError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, BridgeError>>,
    {
        let permit = self.try_acquire()?;
        let result = operation().await;
        permit.settle(classify(&result));
        result
    }
}
