//! Resilience module - retries, circuit breaking and call telemetry around
//! remote model invocations.
//!
//! # Key Concepts
//! - Circuit breaker: one per operation type; fails fast while its dependency is down
//! - Retry budget: a global cap on retries per time window, shared by all calls
//! - Backoff: exponential delay with uniform jitter between attempts
//! - Telemetry: counters, latency percentiles, error kinds and per-model cost

mod breaker;
mod budget;
mod layer;
mod telemetry;

pub use breaker::{
    BreakerConfig, BreakerError, BreakerSnapshot, CircuitBreaker, CircuitState, StateChange,
    StateChangeHook,
};
pub use budget::{BudgetStatus, RetryBudget};
pub use layer::{
    ExecuteContext, ExecuteError, RetryConfig, UnifiedRetryLayer, DEFAULT_OPERATION_TYPE,
};
pub use telemetry::{
    categorize_error, ErrorKind, ErrorSignal, LatencySummary, ModelCost, RetryTelemetry,
    TelemetrySnapshot, TelemetrySummary,
};
