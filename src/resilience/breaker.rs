//! Named circuit breaker with a bounded internal retry loop.
//!
//! - **Closed**: calls pass through; consecutive failures are counted.
//! - **Open**: calls fail fast without invoking the operation until the reset
//!   timeout has elapsed.
//! - **HalfOpen**: a single probe call is admitted. Success closes the circuit,
//!   failure re-opens it. Other callers are rejected while the probe runs.

use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;

use super::telemetry::ErrorSignal;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Closed => "CLOSED",
            Self::Open => "OPEN",
            Self::HalfOpen => "HALF_OPEN",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BreakerConfig {
    /// Consecutive failed calls that open the circuit.
    pub failure_threshold: u32,
    /// How long the circuit stays open before a probe is admitted.
    pub reset_timeout: Duration,
    /// Retries performed inside a single call before it counts as a failure.
    pub max_retries: u32,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            reset_timeout: Duration::from_secs(60),
            max_retries: 3,
        }
    }
}

/// Payload passed to state-change hooks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateChange {
    pub name: String,
    pub previous: CircuitState,
    pub new_state: CircuitState,
    pub reason: String,
}

pub type StateChangeHook = Arc<dyn Fn(&StateChange) + Send + Sync>;

#[derive(Debug, Error)]
pub enum BreakerError<E> {
    #[error("circuit breaker '{name}' is open; retry in {}ms", .retry_in.as_millis())]
    Open { name: String, retry_in: Duration },

    #[error("{0}")]
    Operation(E),
}

impl<E> BreakerError<E> {
    pub fn is_open(&self) -> bool {
        matches!(self, Self::Open { .. })
    }
}

impl<E: ErrorSignal> ErrorSignal for BreakerError<E> {
    fn status_code(&self) -> Option<u16> {
        match self {
            Self::Open { .. } => None,
            Self::Operation(error) => error.status_code(),
        }
    }
}

/// State and failure count at a point in time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BreakerSnapshot {
    pub state: CircuitState,
    pub failure_count: u32,
}

#[derive(Debug)]
struct BreakerState {
    state: CircuitState,
    failure_count: u32,
    opened_at: Option<Instant>,
    probe_in_flight: bool,
}

pub struct CircuitBreaker {
    name: String,
    config: BreakerConfig,
    state: Mutex<BreakerState>,
    hooks: Vec<StateChangeHook>,
}

impl std::fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("name", &self.name)
            .field("config", &self.config)
            .field("state", &self.snapshot())
            .finish_non_exhaustive()
    }
}

/// Marks a call admitted by the breaker. Dropping it without settling (the
/// caller's future was cancelled mid-probe) releases the probe slot so the
/// breaker cannot get stuck in HALF_OPEN.
struct Admission<'a> {
    breaker: &'a CircuitBreaker,
    probe: bool,
    settled: bool,
}

impl Drop for Admission<'_> {
    fn drop(&mut self) {
        if self.probe && !self.settled {
            self.breaker.lock().probe_in_flight = false;
        }
    }
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: BreakerConfig) -> Self {
        Self {
            name: name.into(),
            config,
            state: Mutex::new(BreakerState {
                state: CircuitState::Closed,
                failure_count: 0,
                opened_at: None,
                probe_in_flight: false,
            }),
            hooks: Vec::new(),
        }
    }

    pub fn with_state_change_hook(mut self, hook: StateChangeHook) -> Self {
        self.hooks.push(hook);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &BreakerConfig {
        &self.config
    }

    fn lock(&self) -> MutexGuard<'_, BreakerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn state(&self) -> CircuitState {
        self.lock().state
    }

    pub fn snapshot(&self) -> BreakerSnapshot {
        let state = self.lock();
        BreakerSnapshot {
            state: state.state,
            failure_count: state.failure_count,
        }
    }

    /// Force the breaker back to CLOSED with no recorded failures.
    pub fn reset(&self) {
        let change = {
            let mut state = self.lock();
            state.failure_count = 0;
            state.opened_at = None;
            state.probe_in_flight = false;
            self.transition(&mut state, CircuitState::Closed, "manual reset")
        };
        self.notify(change);
    }

    fn transition(
        &self,
        state: &mut BreakerState,
        new_state: CircuitState,
        reason: &str,
    ) -> Option<StateChange> {
        if state.state == new_state {
            return None;
        }
        let previous = state.state;
        state.state = new_state;
        Some(StateChange {
            name: self.name.clone(),
            previous,
            new_state,
            reason: reason.to_string(),
        })
    }

    fn notify(&self, change: Option<StateChange>) {
        let Some(change) = change else {
            return;
        };
        if change.new_state == CircuitState::Open {
            tracing::warn!(
                breaker = %change.name,
                from = %change.previous,
                to = %change.new_state,
                reason = %change.reason,
                "Circuit breaker opened"
            );
        } else {
            tracing::info!(
                breaker = %change.name,
                from = %change.previous,
                to = %change.new_state,
                reason = %change.reason,
                "Circuit breaker state changed"
            );
        }
        for hook in &self.hooks {
            hook(&change);
        }
    }

    fn admit<E>(&self) -> Result<Admission<'_>, BreakerError<E>> {
        let now = Instant::now();
        let (result, change) = {
            let mut state = self.lock();
            match state.state {
                CircuitState::Closed => (Ok(false), None),
                CircuitState::Open => {
                    let reopen_at = state.opened_at.unwrap_or(now) + self.config.reset_timeout;
                    if now >= reopen_at {
                        state.probe_in_flight = true;
                        let change =
                            self.transition(&mut state, CircuitState::HalfOpen, "reset timeout elapsed");
                        (Ok(true), change)
                    } else {
                        (Err(reopen_at - now), None)
                    }
                }
                CircuitState::HalfOpen if state.probe_in_flight => (Err(Duration::ZERO), None),
                CircuitState::HalfOpen => {
                    state.probe_in_flight = true;
                    (Ok(true), None)
                }
            }
        };
        self.notify(change);

        match result {
            Ok(probe) => Ok(Admission {
                breaker: self,
                probe,
                settled: false,
            }),
            Err(retry_in) => {
                tracing::debug!(breaker = %self.name, "Rejected call while circuit is open");
                Err(BreakerError::Open {
                    name: self.name.clone(),
                    retry_in,
                })
            }
        }
    }

    fn on_success(&self, admission: &mut Admission<'_>) {
        admission.settled = true;
        let change = {
            let mut state = self.lock();
            if admission.probe {
                state.probe_in_flight = false;
                state.failure_count = 0;
                state.opened_at = None;
                self.transition(&mut state, CircuitState::Closed, "probe succeeded")
            } else {
                if state.state == CircuitState::Closed {
                    state.failure_count = 0;
                }
                None
            }
        };
        self.notify(change);
    }

    fn on_failure(&self, admission: &mut Admission<'_>) {
        admission.settled = true;
        let change = {
            let mut state = self.lock();
            if admission.probe {
                state.probe_in_flight = false;
                state.opened_at = Some(Instant::now());
                self.transition(&mut state, CircuitState::Open, "probe failed")
            } else if state.state == CircuitState::Closed {
                state.failure_count += 1;
                if state.failure_count >= self.config.failure_threshold {
                    state.opened_at = Some(Instant::now());
                    let reason = format!("{} consecutive failures", state.failure_count);
                    self.transition(&mut state, CircuitState::Open, &reason)
                } else {
                    None
                }
            } else {
                None
            }
        };
        self.notify(change);
    }

    /// Run `operation` through the breaker.
    ///
    /// A failed attempt is retried while `attempt < max_retries` and
    /// `retry_on(&error, attempt)` approves it, sleeping `backoff(attempt)` in
    /// between. The whole call counts as one success or one failure.
    pub async fn call<T, E, F, Fut, R, B>(
        &self,
        mut operation: F,
        mut retry_on: R,
        backoff: B,
    ) -> Result<T, BreakerError<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        R: FnMut(&E, u32) -> bool,
        B: Fn(u32) -> Duration,
    {
        let mut admission = self.admit()?;
        let mut attempt = 0u32;

        let outcome = loop {
            match operation().await {
                Ok(value) => break Ok(value),
                Err(error) => {
                    if attempt < self.config.max_retries && retry_on(&error, attempt) {
                        let delay = backoff(attempt);
                        tracing::debug!(
                            breaker = %self.name,
                            attempt,
                            delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                            "Retrying after failed attempt"
                        );
                        tokio::time::sleep(delay).await;
                        attempt += 1;
                    } else {
                        break Err(error);
                    }
                }
            }
        };

        match outcome {
            Ok(value) => {
                self.on_success(&mut admission);
                Ok(value)
            }
            Err(error) => {
                self.on_failure(&mut admission);
                Err(BreakerError::Operation(error))
            }
        }
    }
}
