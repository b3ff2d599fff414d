//! Call outcome aggregation: counters, latency percentiles and per-model cost.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

/// An error that can be classified for retry and telemetry purposes.
///
/// Classification looks at the HTTP status (when the error carries one) and at
/// the lowercased `Display` text.
pub trait ErrorSignal: std::fmt::Display {
    /// HTTP status code reported by the backend, if any.
    fn status_code(&self) -> Option<u16> {
        None
    }
}

impl ErrorSignal for anyhow::Error {}

impl ErrorSignal for std::io::Error {}

impl ErrorSignal for String {}

impl ErrorSignal for &str {}

/// Classified failure kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Throttling,
    Authorization,
    Timeout,
    InvalidModel,
    ServerError,
    CircuitBreaker,
    Unknown,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Throttling => "throttling",
            Self::Authorization => "authorization",
            Self::Timeout => "timeout",
            Self::InvalidModel => "invalid_model",
            Self::ServerError => "server_error",
            Self::CircuitBreaker => "circuit_breaker",
            Self::Unknown => "unknown",
        }
    }

    /// Transient kinds that are always worth another attempt.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Throttling | Self::Timeout | Self::ServerError)
    }

    /// Kinds that no amount of retrying will fix.
    pub fn is_permanent(&self) -> bool {
        matches!(self, Self::Authorization | Self::InvalidModel)
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Classify an error. Order matters: throttling and authorization are checked
/// before the generic 5xx bucket.
pub fn categorize_error<E: ErrorSignal + ?Sized>(error: &E) -> ErrorKind {
    let message = error.to_string().to_lowercase();
    let status = error.status_code();

    if status == Some(429) || message.contains("throttl") {
        ErrorKind::Throttling
    } else if matches!(status, Some(401) | Some(403)) || message.contains("access denied") {
        ErrorKind::Authorization
    } else if message.contains("timeout") || message.contains("timed out") {
        ErrorKind::Timeout
    } else if status == Some(404) || message.contains("not found") || message.contains("invalid") {
        ErrorKind::InvalidModel
    } else if status.map_or(false, |s| s >= 500) {
        ErrorKind::ServerError
    } else if message.contains("circuit breaker") {
        ErrorKind::CircuitBreaker
    } else {
        ErrorKind::Unknown
    }
}

/// Call count and accumulated cost for one model.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelCost {
    pub calls: u64,
    pub total_cost: f64,
}

/// Raw telemetry state. Append-only until reset.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TelemetrySnapshot {
    pub total_calls: u64,
    pub successful_calls: u64,
    pub failed_calls: u64,
    pub retried_calls: u64,
    pub circuit_breaker_opens: u64,
    /// Latency of each recorded call, in milliseconds.
    pub latency_samples: Vec<u64>,
    pub errors_by_type: BTreeMap<ErrorKind, u64>,
    pub cost_by_model: BTreeMap<String, ModelCost>,
}

impl TelemetrySnapshot {
    /// Nearest-rank percentile of the latency samples; 0 when empty.
    pub fn latency_percentile(&self, percentile: f64) -> u64 {
        if self.latency_samples.is_empty() {
            return 0;
        }
        let mut sorted = self.latency_samples.clone();
        sorted.sort_unstable();
        let rank = ((percentile / 100.0) * sorted.len() as f64).ceil() as i64 - 1;
        let index = rank.clamp(0, sorted.len() as i64 - 1) as usize;
        sorted[index]
    }

    pub fn summary(&self) -> TelemetrySummary {
        let rate = |count: u64| {
            (self.total_calls > 0).then(|| count as f64 / self.total_calls as f64 * 100.0)
        };
        let samples = &self.latency_samples;
        let mean = if samples.is_empty() {
            0
        } else {
            (samples.iter().sum::<u64>() as f64 / samples.len() as f64).round() as u64
        };

        TelemetrySummary {
            total_calls: self.total_calls,
            successful_calls: self.successful_calls,
            failed_calls: self.failed_calls,
            retried_calls: self.retried_calls,
            circuit_breaker_opens: self.circuit_breaker_opens,
            success_rate: rate(self.successful_calls),
            retry_rate: rate(self.retried_calls),
            latency: LatencySummary {
                mean,
                p50: self.latency_percentile(50.0),
                p95: self.latency_percentile(95.0),
                p99: self.latency_percentile(99.0),
                max: samples.iter().copied().max().unwrap_or(0),
            },
            errors_by_type: self.errors_by_type.clone(),
            cost_by_model: self.cost_by_model.clone(),
        }
    }
}

/// Latency figures in milliseconds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct LatencySummary {
    pub mean: u64,
    pub p50: u64,
    pub p95: u64,
    pub p99: u64,
    pub max: u64,
}

/// Aggregated view of the telemetry.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TelemetrySummary {
    pub total_calls: u64,
    pub successful_calls: u64,
    pub failed_calls: u64,
    pub retried_calls: u64,
    pub circuit_breaker_opens: u64,
    /// Percentage of successful calls; `None` before the first call.
    pub success_rate: Option<f64>,
    /// Percentage of calls that needed at least one retry.
    pub retry_rate: Option<f64>,
    pub latency: LatencySummary,
    pub errors_by_type: BTreeMap<ErrorKind, u64>,
    pub cost_by_model: BTreeMap<String, ModelCost>,
}

/// Thread-safe telemetry collector.
#[derive(Debug, Default)]
pub struct RetryTelemetry {
    metrics: Mutex<TelemetrySnapshot>,
}

impl RetryTelemetry {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_metrics<R>(&self, f: impl FnOnce(&mut TelemetrySnapshot) -> R) -> R {
        let mut metrics = self.metrics.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut metrics)
    }

    /// Record the outcome of one logical call.
    pub fn record_call(
        &self,
        success: bool,
        latency: Duration,
        retries: u32,
        error: Option<&dyn ErrorSignal>,
        model: Option<&str>,
        cost: Option<f64>,
    ) {
        let kind = error.map(|e| categorize_error(e));
        self.record_call_kind(success, latency, retries, kind, model, cost);
    }

    /// Like [`record_call`](Self::record_call), for a caller that already
    /// knows the failure kind.
    pub fn record_call_kind(
        &self,
        success: bool,
        latency: Duration,
        retries: u32,
        kind: Option<ErrorKind>,
        model: Option<&str>,
        cost: Option<f64>,
    ) {
        self.with_metrics(|m| {
            m.total_calls += 1;
            if success {
                m.successful_calls += 1;
            } else {
                m.failed_calls += 1;
            }
            if retries > 0 {
                m.retried_calls += 1;
            }
            m.latency_samples
                .push(u64::try_from(latency.as_millis()).unwrap_or(u64::MAX));
            if let Some(kind) = kind {
                *m.errors_by_type.entry(kind).or_insert(0) += 1;
            }
            if let (Some(model), Some(cost)) = (model, cost) {
                let entry = m.cost_by_model.entry(model.to_string()).or_default();
                entry.calls += 1;
                entry.total_cost += cost;
            }
        });
    }

    /// Count a failed attempt under its error kind without recording a call.
    pub fn record_attempt_error(&self, error: &dyn ErrorSignal) -> ErrorKind {
        let kind = categorize_error(error);
        self.with_metrics(|m| *m.errors_by_type.entry(kind).or_insert(0) += 1);
        kind
    }

    pub fn record_breaker_open(&self) {
        self.with_metrics(|m| m.circuit_breaker_opens += 1);
    }

    pub fn latency_percentile(&self, percentile: f64) -> u64 {
        self.with_metrics(|m| m.latency_percentile(percentile))
    }

    pub fn snapshot(&self) -> TelemetrySnapshot {
        self.with_metrics(|m| m.clone())
    }

    pub fn summary(&self) -> TelemetrySummary {
        self.with_metrics(|m| m.summary())
    }

    pub fn reset(&self) {
        self.with_metrics(|m| *m = TelemetrySnapshot::default());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct StatusError {
        status: Option<u16>,
        message: &'static str,
    }

    impl std::fmt::Display for StatusError {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            f.write_str(self.message)
        }
    }

    impl ErrorSignal for StatusError {
        fn status_code(&self) -> Option<u16> {
            self.status
        }
    }

    fn err(status: Option<u16>, message: &'static str) -> StatusError {
        StatusError { status, message }
    }

    #[test]
    fn test_categorize_order() {
        assert_eq!(categorize_error(&err(Some(429), "internal failure")), ErrorKind::Throttling);
        assert_eq!(categorize_error(&err(Some(503), "ThrottlingException")), ErrorKind::Throttling);
        assert_eq!(categorize_error(&err(Some(503), "Access denied for role")), ErrorKind::Authorization);
        assert_eq!(categorize_error(&err(Some(403), "forbidden")), ErrorKind::Authorization);
        assert_eq!(categorize_error(&err(Some(500), "request timed out")), ErrorKind::Timeout);
        assert_eq!(categorize_error(&err(None, "model not found")), ErrorKind::InvalidModel);
        assert_eq!(categorize_error(&err(Some(400), "Invalid model identifier")), ErrorKind::InvalidModel);
        assert_eq!(categorize_error(&err(Some(502), "bad gateway")), ErrorKind::ServerError);
        assert_eq!(
            categorize_error(&err(None, "circuit breaker 'inference' is open")),
            ErrorKind::CircuitBreaker
        );
        assert_eq!(categorize_error(&err(Some(418), "teapot")), ErrorKind::Unknown);
        assert_eq!(categorize_error(&"connection reset"), ErrorKind::Unknown);
    }

    #[test]
    fn test_nearest_rank_percentiles() {
        let telemetry = RetryTelemetry::new();
        for ms in (1..=100).map(|i| i * 10) {
            telemetry.record_call(true, Duration::from_millis(ms), 0, None, None, None);
        }
        assert_eq!(telemetry.latency_percentile(95.0), 950);
        assert_eq!(telemetry.latency_percentile(50.0), 500);
        assert_eq!(telemetry.latency_percentile(99.0), 990);
        assert_eq!(telemetry.latency_percentile(100.0), 1000);
        assert_eq!(telemetry.latency_percentile(0.0), 10);
    }

    #[test]
    fn test_empty_summary() {
        let summary = RetryTelemetry::new().summary();
        assert_eq!(summary.total_calls, 0);
        assert_eq!(summary.success_rate, None);
        assert_eq!(summary.latency, LatencySummary::default());
    }

    #[test]
    fn test_record_call_updates_counters_and_costs() {
        let telemetry = RetryTelemetry::new();
        telemetry.record_call(true, Duration::from_millis(100), 0, None, Some("sonnet"), Some(0.02));
        telemetry.record_call(true, Duration::from_millis(300), 2, None, Some("sonnet"), Some(0.03));
        let throttled = err(Some(429), "slow down");
        telemetry.record_call(false, Duration::from_millis(200), 3, Some(&throttled), Some("sonnet"), None);

        let summary = telemetry.summary();
        assert_eq!(summary.total_calls, 3);
        assert_eq!(summary.successful_calls, 2);
        assert_eq!(summary.failed_calls, 1);
        assert_eq!(summary.retried_calls, 2);
        assert_eq!(summary.latency.mean, 200);
        assert_eq!(summary.latency.max, 300);
        assert_eq!(summary.errors_by_type.get(&ErrorKind::Throttling), Some(&1));

        let sonnet = &summary.cost_by_model["sonnet"];
        assert_eq!(sonnet.calls, 2);
        assert!((sonnet.total_cost - 0.05).abs() < 1e-12);
        let success_rate = summary.success_rate.unwrap();
        assert!((success_rate - 200.0 / 3.0).abs() < 1e-9);

        telemetry.reset();
        assert_eq!(telemetry.snapshot().total_calls, 0);
    }

    #[test]
    fn test_summary_serializes_error_kinds_as_snake_case() {
        let telemetry = RetryTelemetry::new();
        telemetry.record_attempt_error(&err(Some(404), "missing"));
        let json = serde_json::to_value(telemetry.summary()).unwrap();
        assert_eq!(json["errorsByType"]["invalid_model"], 1);
    }
}
