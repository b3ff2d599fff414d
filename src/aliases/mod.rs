//! Alias module - stable model names and their backend identifiers.
//!
//! # Key Concepts
//! - Alias: a stable short name (e.g. `claude-sonnet-4-5`) for a versioned backend model
//! - Legacy mapping: an old alias redirected to a newer one; chains are walked iteratively
//! - Deprecated alias: a retired name that only resolves when the caller opts in
//! - Pricing: per-1000-token rates used for cost accounting
//! - Audit: static checks over a whole configuration document

mod error;
mod resolver;
mod types;
pub mod validate;

pub use error::AliasError;
pub use resolver::{AliasResolver, MAX_CHAIN_DEPTH};
pub use types::{
    AliasConfig, AliasSummary, ConfigMetadata, CostBreakdown, DeprecatedInfo, ListFilter,
    ModelConfig, ModelMetadata, Pricing, ResolveOptions, ResolvedAlias, TokenUsage,
    DEFAULT_PRIORITY,
};
pub use validate::{audit, AuditFinding, AuditReport};
