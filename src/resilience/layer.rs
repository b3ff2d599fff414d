//! Unified retry layer: breaker per operation type, global retry budget,
//! exponential backoff with jitter, and telemetry for every call.

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;
use uuid::Uuid;

use super::breaker::{
    BreakerConfig, BreakerError, BreakerSnapshot, CircuitBreaker, CircuitState, StateChange,
};
use super::budget::{BudgetStatus, RetryBudget};
use super::telemetry::{categorize_error, ErrorKind, ErrorSignal, RetryTelemetry, TelemetrySummary};

/// Operation type used when the caller does not name one.
pub const DEFAULT_OPERATION_TYPE: &str = "inference";

/// Retry, backoff, breaker and budget tuning.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RetryConfig {
    pub max_retries: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub backoff_multiplier: f64,
    pub jitter_factor: f64,
    pub failure_threshold: u32,
    pub reset_timeout_ms: u64,
    /// Retries allowed per budget window across all calls.
    pub retry_budget: u32,
    pub retry_budget_window_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay_ms: 1000,
            max_delay_ms: 30_000,
            backoff_multiplier: 2.0,
            jitter_factor: 0.1,
            failure_threshold: 5,
            reset_timeout_ms: 60_000,
            retry_budget: 100,
            retry_budget_window_ms: 60_000,
        }
    }
}

impl RetryConfig {
    fn breaker_config(&self) -> BreakerConfig {
        BreakerConfig {
            failure_threshold: self.failure_threshold,
            reset_timeout: Duration::from_millis(self.reset_timeout_ms),
            max_retries: self.max_retries,
        }
    }
}

type CostFn<'a, T> = Box<dyn Fn(&T) -> Option<f64> + Send + Sync + 'a>;

/// Per-call context for [`UnifiedRetryLayer::execute`].
pub struct ExecuteContext<'a, T> {
    pub model: String,
    pub operation_type: String,
    calculate_cost: Option<CostFn<'a, T>>,
}

impl<T> Default for ExecuteContext<'_, T> {
    fn default() -> Self {
        Self {
            model: "unknown".to_string(),
            operation_type: DEFAULT_OPERATION_TYPE.to_string(),
            calculate_cost: None,
        }
    }
}

impl<'a, T> ExecuteContext<'a, T> {
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    pub fn with_operation_type(mut self, operation_type: impl Into<String>) -> Self {
        self.operation_type = operation_type.into();
        self
    }

    /// Derive a cost figure from a successful result.
    pub fn with_cost(mut self, calculate: impl Fn(&T) -> Option<f64> + Send + Sync + 'a) -> Self {
        self.calculate_cost = Some(Box::new(calculate));
        self
    }
}

#[derive(Debug, Error)]
pub enum ExecuteError<E> {
    #[error("circuit breaker '{name}' is open; retry in {}ms", .retry_in.as_millis())]
    CircuitOpen { name: String, retry_in: Duration },

    /// The operation's last error once retries were exhausted or denied.
    #[error("{error}")]
    Failed {
        error: E,
        kind: ErrorKind,
        attempts: u32,
    },

    #[error("operation cancelled after {attempts} attempt(s)")]
    Cancelled { attempts: u32 },
}

impl<E> ExecuteError<E> {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::CircuitOpen { .. } => ErrorKind::CircuitBreaker,
            Self::Failed { kind, .. } => *kind,
            Self::Cancelled { .. } => ErrorKind::Unknown,
        }
    }

    pub fn attempts(&self) -> u32 {
        match self {
            Self::CircuitOpen { .. } => 0,
            Self::Failed { attempts, .. } | Self::Cancelled { attempts } => *attempts,
        }
    }

    /// The operation's own error, if the failure came from the operation.
    pub fn into_inner(self) -> Option<E> {
        match self {
            Self::Failed { error, .. } => Some(error),
            _ => None,
        }
    }
}

impl<E: ErrorSignal> ErrorSignal for ExecuteError<E> {
    fn status_code(&self) -> Option<u16> {
        match self {
            Self::Failed { error, .. } => error.status_code(),
            _ => None,
        }
    }
}

/// Shared retry layer. Construct once and share it (e.g. behind an `Arc`)
/// between every consumer that should draw from the same budget.
pub struct UnifiedRetryLayer {
    config: RetryConfig,
    telemetry: Arc<RetryTelemetry>,
    budget: RetryBudget,
    breakers: Mutex<HashMap<String, Arc<CircuitBreaker>>>,
}

impl std::fmt::Debug for UnifiedRetryLayer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UnifiedRetryLayer")
            .field("config", &self.config)
            .field("budget", &self.budget)
            .finish_non_exhaustive()
    }
}

impl Default for UnifiedRetryLayer {
    fn default() -> Self {
        Self::new(RetryConfig::default())
    }
}

impl UnifiedRetryLayer {
    pub fn new(config: RetryConfig) -> Self {
        let budget = RetryBudget::new(
            config.retry_budget,
            Duration::from_millis(config.retry_budget_window_ms),
        );
        Self {
            config,
            telemetry: Arc::new(RetryTelemetry::new()),
            budget,
            breakers: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    /// The breaker guarding `operation_type`, created on first use.
    pub fn breaker(&self, operation_type: &str) -> Arc<CircuitBreaker> {
        let mut breakers = self.breakers.lock().unwrap_or_else(PoisonError::into_inner);
        let breaker = breakers.entry(operation_type.to_string()).or_insert_with(|| {
            let telemetry = Arc::clone(&self.telemetry);
            Arc::new(
                CircuitBreaker::new(operation_type, self.config.breaker_config())
                    .with_state_change_hook(Arc::new(move |change: &StateChange| {
                        if change.new_state == CircuitState::Open {
                            telemetry.record_breaker_open();
                        }
                    })),
            )
        });
        Arc::clone(breaker)
    }

    /// Decide whether a failed attempt should be retried. An approved retry of
    /// a transient kind takes one unit from the global budget; other
    /// non-permanent kinds only need the budget to have capacity.
    pub fn should_retry<E: ErrorSignal + ?Sized>(&self, error: &E, attempt: u32) -> bool {
        if attempt >= self.config.max_retries {
            return false;
        }
        if !self.budget.has_capacity() {
            let status = self.budget.status();
            tracing::warn!(
                used = status.used,
                limit = status.limit,
                reset_time = %status.reset_time,
                "Retry budget exhausted"
            );
            return false;
        }
        let kind = categorize_error(error);
        if kind.is_permanent() {
            tracing::debug!(error_kind = %kind, "Not retrying permanent error");
            return false;
        }
        if kind.is_transient() {
            // Another caller may have taken the last unit since the capacity check.
            return self.budget.try_consume();
        }
        true
    }

    /// Backoff before retry number `attempt` (zero-based), with uniform jitter.
    pub fn calculate_delay(&self, attempt: u32) -> Duration {
        let exponential =
            self.config.base_delay_ms as f64 * self.config.backoff_multiplier.powi(attempt as i32);
        let capped = exponential.min(self.config.max_delay_ms as f64);
        let jitter = if self.config.jitter_factor > 0.0 {
            let spread = rand::thread_rng().gen_range(-1.0..=1.0);
            capped * self.config.jitter_factor * spread
        } else {
            0.0
        };
        Duration::from_millis((capped + jitter).max(0.0).round() as u64)
    }

    /// Run `operation` with breaker protection, retries and telemetry.
    pub async fn execute<T, E, F, Fut>(
        &self,
        operation: F,
        context: ExecuteContext<'_, T>,
    ) -> Result<T, ExecuteError<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: ErrorSignal,
    {
        self.run(operation, context, None).await
    }

    /// Like [`execute`](Self::execute), but gives up as soon as `cancel` fires.
    /// The in-flight attempt is dropped.
    pub async fn execute_cancellable<T, E, F, Fut>(
        &self,
        operation: F,
        context: ExecuteContext<'_, T>,
        cancel: &CancellationToken,
    ) -> Result<T, ExecuteError<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: ErrorSignal,
    {
        self.run(operation, context, Some(cancel)).await
    }

    async fn run<T, E, F, Fut>(
        &self,
        operation: F,
        context: ExecuteContext<'_, T>,
        cancel: Option<&CancellationToken>,
    ) -> Result<T, ExecuteError<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: ErrorSignal,
    {
        let span = tracing::info_span!(
            "execute",
            request_id = %Uuid::new_v4(),
            model = %context.model,
            operation_type = %context.operation_type,
        );
        self.run_in_span(operation, context, cancel)
            .instrument(span)
            .await
    }

    async fn run_in_span<T, E, F, Fut>(
        &self,
        mut operation: F,
        context: ExecuteContext<'_, T>,
        cancel: Option<&CancellationToken>,
    ) -> Result<T, ExecuteError<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: ErrorSignal,
    {
        let breaker = self.breaker(&context.operation_type);
        let attempts = AtomicU32::new(0);
        let started = Instant::now();
        let telemetry = &self.telemetry;

        let counted = || {
            let attempt = attempts.fetch_add(1, Ordering::SeqCst) + 1;
            let pending = operation();
            async move {
                let result = pending.await;
                if let Err(error) = &result {
                    let kind = telemetry.record_attempt_error(error);
                    tracing::warn!(attempt, error_kind = %kind, error = %error, "Attempt failed");
                }
                result
            }
        };
        let call = breaker.call(
            counted,
            |error: &E, attempt| self.should_retry(error, attempt),
            |attempt| self.calculate_delay(attempt),
        );

        let outcome = match cancel {
            Some(token) => tokio::select! {
                biased;
                _ = token.cancelled() => None,
                result = call => Some(result),
            },
            None => Some(call.await),
        };

        let latency = started.elapsed();
        let attempts = attempts.load(Ordering::SeqCst);
        let retries = attempts.saturating_sub(1);
        let model = context.model.as_str();

        match outcome {
            Some(Ok(value)) => {
                let cost = context
                    .calculate_cost
                    .as_ref()
                    .and_then(|calculate| calculate(&value));
                self.telemetry
                    .record_call(true, latency, retries, None, Some(model), cost);
                tracing::info!(
                    attempts,
                    latency_ms = u64::try_from(latency.as_millis()).unwrap_or(u64::MAX),
                    "Call succeeded"
                );
                Ok(value)
            }
            Some(Err(BreakerError::Open { name, retry_in })) => {
                let error = ExecuteError::CircuitOpen { name, retry_in };
                self.telemetry
                    .record_call_kind(false, latency, retries, Some(error.kind()), Some(model), None);
                tracing::warn!(error = %error, "Call rejected");
                Err(error)
            }
            Some(Err(BreakerError::Operation(error))) => {
                let kind = categorize_error(&error);
                // Each failed attempt was already counted by kind.
                self.telemetry
                    .record_call(false, latency, retries, None, Some(model), None);
                tracing::error!(
                    attempts,
                    error_kind = %kind,
                    error = %error,
                    "Call failed"
                );
                Err(ExecuteError::Failed {
                    error,
                    kind,
                    attempts,
                })
            }
            None => {
                let error = ExecuteError::<E>::Cancelled { attempts };
                self.telemetry
                    .record_call_kind(false, latency, retries, Some(error.kind()), Some(model), None);
                tracing::info!(attempts, "Call cancelled");
                Err(error)
            }
        }
    }

    pub fn get_telemetry(&self) -> TelemetrySummary {
        self.telemetry.summary()
    }

    pub fn telemetry(&self) -> Arc<RetryTelemetry> {
        Arc::clone(&self.telemetry)
    }

    /// Clear telemetry and start a fresh retry budget window.
    pub fn reset_telemetry(&self) {
        self.telemetry.reset();
        self.budget.reset();
    }

    pub fn get_retry_budget_status(&self) -> BudgetStatus {
        self.budget.status()
    }

    pub fn breaker_states(&self) -> BTreeMap<String, BreakerSnapshot> {
        let breakers = self.breakers.lock().unwrap_or_else(PoisonError::into_inner);
        breakers
            .iter()
            .map(|(name, breaker)| (name.clone(), breaker.snapshot()))
            .collect()
    }
}
