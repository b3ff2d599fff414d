//! Types for the alias configuration document and resolution results.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Priority assigned to entries that do not declare one.
pub const DEFAULT_PRIORITY: u32 = 999;

/// The versioned alias configuration document.
///
/// The legacy-mapping graph is expected to be acyclic but is not checked on
/// load; cycles surface as resolution errors.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AliasConfig {
    #[serde(default)]
    pub aliases: BTreeMap<String, ModelConfig>,
    #[serde(default)]
    pub legacy_mappings: BTreeMap<String, String>,
    #[serde(default)]
    pub deprecated_aliases: BTreeMap<String, DeprecatedInfo>,
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub last_updated: Option<String>,
    /// Free-form metadata block carried through to `ConfigMetadata`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
}

/// Backend model entry for an active alias.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelConfig {
    pub model_id: String,
    #[serde(default)]
    pub display_name: String,
    #[serde(default)]
    pub provider: String,
    #[serde(default)]
    pub family: String,
    #[serde(default)]
    pub capabilities: Vec<String>,
    #[serde(default)]
    pub context_window: u64,
    #[serde(default)]
    pub max_output_tokens: u64,
    #[serde(default)]
    pub requires_inference_profile: bool,
    /// Identifier to dispatch to instead of `model_id` (e.g. a cross-region
    /// inference profile ARN).
    #[serde(
        default,
        alias = "inferenceProfileArn",
        skip_serializing_if = "Option::is_none"
    )]
    pub routing_id: Option<String>,
    #[serde(default)]
    pub regions: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pricing: Option<Pricing>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
}

impl ModelConfig {
    /// The identifier a transport should be called with.
    pub fn dispatch_id(&self) -> &str {
        match (&self.routing_id, self.requires_inference_profile) {
            (Some(routing_id), true) => routing_id,
            _ => &self.model_id,
        }
    }
}

/// Per-1000-token pricing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Pricing {
    pub input: f64,
    pub output: f64,
    #[serde(default = "default_currency")]
    pub currency: String,
    #[serde(default = "default_unit")]
    pub unit: String,
}

fn default_currency() -> String {
    "USD".to_string()
}

fn default_unit() -> String {
    "per 1K tokens".to_string()
}

impl Default for Pricing {
    fn default() -> Self {
        Self {
            input: 0.0,
            output: 0.0,
            currency: default_currency(),
            unit: default_unit(),
        }
    }
}

/// A retired alias and the alias that replaces it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeprecatedInfo {
    pub replacement: String,
    #[serde(default)]
    pub deprecation_note: String,
    #[serde(default)]
    pub display_name: String,
    #[serde(default)]
    pub provider: String,
    #[serde(default)]
    pub family: String,
    /// Backend ID the alias used to point at. Kept for audit only; resolution
    /// never hands it out.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deprecated_since: Option<String>,
}

/// Options for a single resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResolveOptions {
    pub allow_deprecated: bool,
    pub warn_deprecated: bool,
}

impl Default for ResolveOptions {
    fn default() -> Self {
        Self {
            allow_deprecated: false,
            warn_deprecated: true,
        }
    }
}

impl ResolveOptions {
    /// Accept deprecated aliases, still logging the deprecation.
    pub fn allow_deprecated() -> Self {
        Self {
            allow_deprecated: true,
            warn_deprecated: true,
        }
    }

    /// Accept deprecated aliases without logging.
    pub fn quiet() -> Self {
        Self {
            allow_deprecated: true,
            warn_deprecated: false,
        }
    }
}

/// Result of resolving an alias. Immutable once built.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResolvedAlias {
    /// Backend model ID. For deprecated results this is the replacement's ID,
    /// or `None` when the replacement is not an active alias.
    pub model_id: Option<String>,
    /// Alias at the end of the legacy chain.
    pub alias: String,
    /// Alias the caller asked for.
    pub original_alias: String,
    pub resolved: bool,
    pub deprecated: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub recommended_replacement: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deprecation_note: Option<String>,
    /// Model metadata (the replacement's for deprecated results).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<ModelConfig>,
}

/// Filters for `AliasResolver::list_aliases`.
#[derive(Debug, Clone, Default)]
pub struct ListFilter {
    pub include_deprecated: bool,
    pub provider: Option<String>,
    pub capability: Option<String>,
}

/// One row of `AliasResolver::list_aliases`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AliasSummary {
    pub alias: String,
    pub display_name: String,
    pub provider: String,
    pub family: String,
    pub capabilities: Vec<String>,
    pub deprecated: bool,
    pub priority: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub replacement: Option<String>,
}

impl AliasSummary {
    pub(crate) fn sort_priority(&self) -> u32 {
        self.priority.unwrap_or(DEFAULT_PRIORITY)
    }
}

/// Full metadata for an alias, as returned by `AliasResolver::get_metadata`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelMetadata {
    pub alias: String,
    pub model_id: Option<String>,
    pub display_name: Option<String>,
    pub provider: Option<String>,
    pub family: Option<String>,
    pub capabilities: Vec<String>,
    pub context_window: Option<u64>,
    pub max_output_tokens: Option<u64>,
    pub requires_inference_profile: bool,
    pub routing_id: Option<String>,
    pub regions: Vec<String>,
    pub deprecated: bool,
    pub pricing: Option<Pricing>,
    pub notes: Option<String>,
}

/// Provenance of the loaded configuration.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigMetadata {
    pub version: Option<String>,
    pub last_updated: Option<String>,
    pub last_load_time: DateTime<Utc>,
    pub config_hash: String,
    pub total_aliases: usize,
    pub total_deprecated: usize,
    pub total_legacy_mappings: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
}

/// Token counts reported by a backend.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    #[serde(default)]
    pub input_tokens: u64,
    #[serde(default)]
    pub output_tokens: u64,
}

impl TokenUsage {
    pub fn new(input_tokens: u64, output_tokens: u64) -> Self {
        Self {
            input_tokens,
            output_tokens,
        }
    }

    pub fn total(&self) -> u64 {
        self.input_tokens.saturating_add(self.output_tokens)
    }
}

/// Cost of a call, derived from per-1000-token pricing.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CostBreakdown {
    pub input_cost: f64,
    pub output_cost: f64,
    pub total_cost: f64,
    pub currency: String,
    pub usage: TokenUsage,
}

impl CostBreakdown {
    pub fn from_pricing(pricing: &Pricing, usage: TokenUsage) -> Self {
        let input_cost = (usage.input_tokens as f64 / 1000.0) * pricing.input;
        let output_cost = (usage.output_tokens as f64 / 1000.0) * pricing.output;
        Self {
            input_cost,
            output_cost,
            total_cost: input_cost + output_cost,
            currency: pricing.currency.clone(),
            usage,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_model_config_accepts_profile_arn_spelling() {
        let json = r#"{
            "modelId": "anthropic.claude-sonnet-4-5-20250929-v1:0",
            "requiresInferenceProfile": true,
            "inferenceProfileArn": "arn:aws:bedrock:us-east-1:123456789012:inference-profile/us.anthropic.claude-sonnet-4-5"
        }"#;
        let model: ModelConfig = serde_json::from_str(json).unwrap();
        assert!(model.routing_id.is_some());
        assert!(model.dispatch_id().starts_with("arn:aws:bedrock"));
    }

    #[test]
    fn test_dispatch_id_ignores_routing_id_when_not_required() {
        let json = r#"{ "modelId": "m-1", "routingId": "profile-1" }"#;
        let model: ModelConfig = serde_json::from_str(json).unwrap();
        assert_eq!(model.dispatch_id(), "m-1");
    }

    #[test]
    fn test_cost_breakdown_per_thousand_tokens() {
        let pricing = Pricing {
            input: 0.003,
            output: 0.015,
            ..Pricing::default()
        };
        let cost = CostBreakdown::from_pricing(&pricing, TokenUsage::new(2000, 500));
        assert!((cost.input_cost - 0.006).abs() < 1e-12);
        assert!((cost.output_cost - 0.0075).abs() < 1e-12);
        assert_eq!(cost.currency, "USD");
    }
}
