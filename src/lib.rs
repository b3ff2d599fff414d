//! # Model Relay
//!
//! Resilient invocation of remote language models.
//!
//! This library provides:
//! - Alias resolution from stable short names to versioned backend model IDs
//! - A unified retry layer with per-operation circuit breakers and a global retry budget
//! - Call telemetry: success rates, latency percentiles, error kinds and per-model cost
//! - An invoker that wires the above to a pluggable inference transport
//!
//! ## Architecture
//!
//! ```text
//!        ┌──────────────────────────────────┐
//!        │           ModelInvoker           │
//!        └───────┬──────────────────┬───────┘
//!                │                  │
//!                ▼                  ▼
//!     ┌──────────────────┐  ┌──────────────────┐
//!     │  AliasResolver   │  │ UnifiedRetryLayer│
//!     │ (legacy chains,  │  │ (breakers, budget│
//!     │  deprecations)   │  │  telemetry)      │
//!     └──────────────────┘  └────────┬─────────┘
//!                                    │
//!                                    ▼
//!                          ┌──────────────────┐
//!                          │InferenceTransport│
//!                          └──────────────────┘
//! ```
//!
//! ## Invocation Flow
//! 1. Resolve the alias (following legacy mappings) to a model and its dispatch ID
//! 2. Build the request body
//! 3. Send it through the breaker for the operation type, retrying within policy and budget
//! 4. Record latency, retries and cost; return the text and usage
//!
//! ## Modules
//! - `aliases`: alias configuration, resolution and audit
//! - `resilience`: circuit breaker, retry budget, retry layer and telemetry
//! - `invoker`: request construction and transports
//! - `config`: environment configuration

pub mod aliases;
pub mod config;
pub mod invoker;
pub mod resilience;

pub use aliases::{AliasError, AliasResolver, ResolveOptions, ResolvedAlias};
pub use config::Config;
pub use invoker::{InvokeError, InvokeRequest, Invocation, ModelInvoker};
pub use resilience::{ExecuteContext, ExecuteError, RetryConfig, UnifiedRetryLayer};
