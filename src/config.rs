//! Runtime configuration loaded from environment variables.
//!
//! Every variable is optional; unset or empty values fall back to defaults.
//! A value that is set but cannot be parsed is an error.

use anyhow::Context;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::resilience::RetryConfig;

pub const DEFAULT_ALIASES_PATH: &str = "config/model-aliases.json";
pub const DEFAULT_ENDPOINT: &str = "https://bedrock-runtime.us-east-1.amazonaws.com";
pub const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 120_000;

#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    /// Alias configuration document.
    pub aliases_path: PathBuf,
    /// Base URL of the inference backend.
    pub endpoint: String,
    /// Optional bearer token sent with every request.
    pub api_key: Option<String>,
    /// Per-request transport timeout.
    pub request_timeout: Duration,
    pub retry: RetryConfig,
}

impl Config {
    /// Load configuration from the process environment.
    ///
    /// - `MODEL_ALIASES_PATH` - alias configuration file
    /// - `MODEL_RELAY_ENDPOINT` - inference backend base URL
    /// - `MODEL_RELAY_API_KEY` - bearer token
    /// - `MODEL_RELAY_TIMEOUT_MS` - per-request timeout
    /// - `MODEL_RELAY_MAX_RETRIES`, `MODEL_RELAY_BASE_DELAY_MS`, `MODEL_RELAY_MAX_DELAY_MS`,
    ///   `MODEL_RELAY_BACKOFF_MULTIPLIER`, `MODEL_RELAY_JITTER_FACTOR` - backoff
    /// - `MODEL_RELAY_FAILURE_THRESHOLD`, `MODEL_RELAY_RESET_TIMEOUT_MS` - circuit breaker
    /// - `MODEL_RELAY_RETRY_BUDGET`, `MODEL_RELAY_RETRY_BUDGET_WINDOW_MS` - retry budget
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Load configuration from an arbitrary variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> anyhow::Result<Self> {
        let var = |name: &str| lookup(name).filter(|value| !value.trim().is_empty());
        let defaults = RetryConfig::default();

        let retry = RetryConfig {
            max_retries: parse(&var, "MODEL_RELAY_MAX_RETRIES", defaults.max_retries)?,
            base_delay_ms: parse(&var, "MODEL_RELAY_BASE_DELAY_MS", defaults.base_delay_ms)?,
            max_delay_ms: parse(&var, "MODEL_RELAY_MAX_DELAY_MS", defaults.max_delay_ms)?,
            backoff_multiplier: parse(
                &var,
                "MODEL_RELAY_BACKOFF_MULTIPLIER",
                defaults.backoff_multiplier,
            )?,
            jitter_factor: parse(&var, "MODEL_RELAY_JITTER_FACTOR", defaults.jitter_factor)?,
            failure_threshold: parse(
                &var,
                "MODEL_RELAY_FAILURE_THRESHOLD",
                defaults.failure_threshold,
            )?,
            reset_timeout_ms: parse(&var, "MODEL_RELAY_RESET_TIMEOUT_MS", defaults.reset_timeout_ms)?,
            retry_budget: parse(&var, "MODEL_RELAY_RETRY_BUDGET", defaults.retry_budget)?,
            retry_budget_window_ms: parse(
                &var,
                "MODEL_RELAY_RETRY_BUDGET_WINDOW_MS",
                defaults.retry_budget_window_ms,
            )?,
        };

        anyhow::ensure!(
            (0.0..=1.0).contains(&retry.jitter_factor),
            "MODEL_RELAY_JITTER_FACTOR must be between 0 and 1, got {}",
            retry.jitter_factor
        );
        anyhow::ensure!(
            retry.backoff_multiplier >= 1.0,
            "MODEL_RELAY_BACKOFF_MULTIPLIER must be at least 1, got {}",
            retry.backoff_multiplier
        );
        anyhow::ensure!(
            retry.failure_threshold > 0,
            "MODEL_RELAY_FAILURE_THRESHOLD must be greater than 0"
        );

        let timeout_ms = parse(&var, "MODEL_RELAY_TIMEOUT_MS", DEFAULT_REQUEST_TIMEOUT_MS)?;

        Ok(Self {
            aliases_path: var("MODEL_ALIASES_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(DEFAULT_ALIASES_PATH)),
            endpoint: var("MODEL_RELAY_ENDPOINT").unwrap_or_else(|| DEFAULT_ENDPOINT.to_string()),
            api_key: var("MODEL_RELAY_API_KEY"),
            request_timeout: Duration::from_millis(timeout_ms),
            retry,
        })
    }
}

fn parse<T>(var: impl Fn(&str) -> Option<String>, name: &str, default: T) -> anyhow::Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match var(name) {
        Some(raw) => raw
            .trim()
            .parse()
            .with_context(|| format!("Invalid value for {}: {:?}", name, raw)),
        None => Ok(default),
    }
}
