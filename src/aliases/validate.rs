//! Static audit of an alias configuration document.
//!
//! Resolution only detects defects on the chains it is asked to walk; the audit
//! walks every legacy mapping and inspects every entry up front, so a broken
//! document can be rejected in CI before it is deployed.

use regex::Regex;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::OnceLock;

use super::resolver::follow_legacy_chain;
use super::types::AliasConfig;

/// Shape of a cross-region inference profile ARN.
const INFERENCE_PROFILE_ARN: &str =
    r"^arn:aws:bedrock:[a-z0-9-]+:\d+:inference-profile/[A-Za-z0-9.:-]+$";

fn profile_arn_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(INFERENCE_PROFILE_ARN).expect("valid ARN pattern"))
}

/// A single problem found by the audit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AuditFinding {
    pub alias: String,
    pub message: String,
}

impl AuditFinding {
    fn new(alias: &str, message: impl Into<String>) -> Self {
        Self {
            alias: alias.to_string(),
            message: message.into(),
        }
    }
}

/// Result of auditing a configuration document.
#[derive(Debug, Clone, Default, Serialize)]
pub struct AuditReport {
    /// Defects that make some alias unusable.
    pub errors: Vec<AuditFinding>,
    /// Suspicious but resolvable entries.
    pub warnings: Vec<AuditFinding>,
    /// Number of entries inspected.
    pub checked: usize,
}

impl AuditReport {
    pub fn is_clean(&self) -> bool {
        self.errors.is_empty()
    }
}

/// Audit every alias, legacy mapping and deprecated entry in `config`.
pub fn audit(config: &AliasConfig) -> AuditReport {
    let mut report = AuditReport::default();

    for (alias, model) in &config.aliases {
        report.checked += 1;

        if model.model_id.trim().is_empty() {
            report.errors.push(AuditFinding::new(alias, "modelId is empty"));
        }
        if model.requires_inference_profile && model.routing_id.is_none() {
            report.errors.push(AuditFinding::new(
                alias,
                "requiresInferenceProfile is set but no routingId is configured",
            ));
        }
        if let Some(routing_id) = &model.routing_id {
            if routing_id.starts_with("arn:") && !profile_arn_pattern().is_match(routing_id) {
                report.warnings.push(AuditFinding::new(
                    alias,
                    format!("routingId is not a well-formed inference profile ARN: {}", routing_id),
                ));
            }
        }
        if let Some(pricing) = &model.pricing {
            if pricing.input < 0.0 || pricing.output < 0.0 {
                report
                    .errors
                    .push(AuditFinding::new(alias, "pricing rates must not be negative"));
            }
        }
        if config.deprecated_aliases.contains_key(alias) {
            report.warnings.push(AuditFinding::new(
                alias,
                "alias is both active and deprecated; the deprecated entry wins",
            ));
        }
    }

    let mut owners: HashMap<&str, Vec<&str>> = HashMap::new();
    for (alias, model) in &config.aliases {
        owners
            .entry(model.model_id.as_str())
            .or_default()
            .push(alias.as_str());
    }
    let mut shared: Vec<(&str, Vec<&str>)> = owners
        .into_iter()
        .filter(|(model_id, aliases)| aliases.len() > 1 && !model_id.is_empty())
        .collect();
    shared.sort();
    for (model_id, aliases) in shared {
        report.warnings.push(AuditFinding::new(
            aliases[0],
            format!("modelId {} is shared by aliases: {}", model_id, aliases.join(", ")),
        ));
    }

    for (alias, info) in &config.deprecated_aliases {
        report.checked += 1;
        if !config.aliases.contains_key(&info.replacement) {
            report.errors.push(AuditFinding::new(
                alias,
                format!("replacement '{}' is not an active alias", info.replacement),
            ));
        }
    }

    for alias in config.legacy_mappings.keys() {
        report.checked += 1;
        match follow_legacy_chain(config, alias) {
            Ok(terminal) => {
                if !config.aliases.contains_key(terminal)
                    && !config.deprecated_aliases.contains_key(terminal)
                {
                    report.errors.push(AuditFinding::new(
                        alias,
                        format!("legacy chain ends at unknown alias '{}'", terminal),
                    ));
                } else if config.deprecated_aliases.contains_key(terminal) {
                    report.warnings.push(AuditFinding::new(
                        alias,
                        format!("legacy chain ends at deprecated alias '{}'", terminal),
                    ));
                }
            }
            Err(fault) => {
                report.errors.push(AuditFinding::new(alias, fault.to_string()));
            }
        }
    }

    tracing::debug!(
        checked = report.checked,
        errors = report.errors.len(),
        warnings = report.warnings.len(),
        "Audited alias configuration"
    );
    report
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(json: &str) -> AliasConfig {
        serde_json::from_str(json).unwrap()
    }

    #[test]
    fn test_clean_config_passes() {
        let config = parse(
            r#"{
                "aliases": {
                    "haiku": { "modelId": "anthropic.claude-3-5-haiku-20241022-v1:0" },
                    "sonnet": {
                        "modelId": "anthropic.claude-sonnet-4-5-20250929-v1:0",
                        "requiresInferenceProfile": true,
                        "routingId": "arn:aws:bedrock:us-east-1:123456789012:inference-profile/us.anthropic.claude-sonnet-4-5-20250929-v1:0"
                    }
                },
                "legacyMappings": { "claude-latest": "sonnet" },
                "deprecatedAliases": { "claude-v2": { "replacement": "haiku" } }
            }"#,
        );
        let report = audit(&config);
        assert!(report.is_clean(), "{:?}", report.errors);
        assert!(report.warnings.is_empty(), "{:?}", report.warnings);
        assert_eq!(report.checked, 4);
    }

    #[test]
    fn test_bundled_config_is_clean() {
        let config = parse(include_str!("../../config/model-aliases.json"));
        let report = audit(&config);
        assert!(report.is_clean(), "{:?}", report.errors);
        assert!(report.warnings.is_empty(), "{:?}", report.warnings);
    }

    #[test]
    fn test_reports_every_chain_defect() {
        let config = parse(
            r#"{
                "aliases": { "haiku": { "modelId": "m-haiku" } },
                "legacyMappings": {
                    "a": "b",
                    "b": "a",
                    "mirror": "mirror",
                    "dangling": "nowhere"
                }
            }"#,
        );
        let report = audit(&config);
        let flagged: Vec<&str> = report.errors.iter().map(|f| f.alias.as_str()).collect();
        assert!(flagged.contains(&"a"));
        assert!(flagged.contains(&"b"));
        assert!(flagged.contains(&"mirror"));
        assert!(flagged.contains(&"dangling"));
    }

    #[test]
    fn test_profile_and_replacement_checks() {
        let config = parse(
            r#"{
                "aliases": {
                    "opus": { "modelId": "m-opus", "requiresInferenceProfile": true },
                    "opus-copy": { "modelId": "m-opus", "routingId": "arn:aws:bedrock:bad" }
                },
                "deprecatedAliases": { "claude-v2": { "replacement": "claude-v3" } }
            }"#,
        );
        let report = audit(&config);
        assert_eq!(report.errors.len(), 2);
        assert!(report
            .errors
            .iter()
            .any(|f| f.alias == "opus" && f.message.contains("routingId")));
        assert!(report.errors.iter().any(|f| f.alias == "claude-v2"));
        assert!(report.warnings.iter().any(|f| f.message.contains("shared")));
        assert!(report.warnings.iter().any(|f| f.alias == "opus-copy"));
    }
}
