//! Alias resolution over the legacy-mapping graph.
//!
//! Resolution walks `legacyMappings` with an explicit loop, a visited set and a
//! hard depth bound, so a malformed document can produce an error but never an
//! unbounded walk.

use chrono::Utc;
use sha2::{Digest, Sha256};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use super::error::AliasError;
use super::types::*;

/// Maximum number of legacy hops followed before giving up.
pub const MAX_CHAIN_DEPTH: usize = 50;

/// Where the configuration document comes from.
#[derive(Debug, Clone)]
enum ConfigSource {
    File(PathBuf),
    Inline(String),
}

impl ConfigSource {
    fn label(&self) -> String {
        match self {
            Self::File(path) => path.display().to_string(),
            Self::Inline(_) => "<inline>".to_string(),
        }
    }
}

#[derive(Debug)]
struct LoadedConfig {
    config: Arc<AliasConfig>,
    hash: String,
    loaded_at: chrono::DateTime<Utc>,
}

/// Resolves stable aliases to backend model metadata.
///
/// One instance is built at startup and shared (typically behind an `Arc`)
/// with every consumer; there is no global accessor.
#[derive(Debug)]
pub struct AliasResolver {
    source: ConfigSource,
    loaded: RwLock<LoadedConfig>,
    /// Memoized results keyed by `(original alias, allow_deprecated)`.
    cache: Mutex<HashMap<(String, bool), ResolvedAlias>>,
    /// Original aliases whose configuration defect has already been logged.
    warned: Mutex<HashSet<String>>,
}

impl AliasResolver {
    /// Load the configuration document at `path`.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, AliasError> {
        Self::from_source(ConfigSource::File(path.as_ref().to_path_buf()))
    }

    /// Build a resolver from an in-memory JSON document.
    pub fn from_json(raw: impl Into<String>) -> Result<Self, AliasError> {
        Self::from_source(ConfigSource::Inline(raw.into()))
    }

    fn from_source(source: ConfigSource) -> Result<Self, AliasError> {
        let loaded = read_source(&source)?;
        tracing::info!(
            source = %source.label(),
            aliases = loaded.config.aliases.len(),
            legacy = loaded.config.legacy_mappings.len(),
            deprecated = loaded.config.deprecated_aliases.len(),
            "Loaded model alias configuration"
        );
        Ok(Self {
            source,
            loaded: RwLock::new(loaded),
            cache: Mutex::new(HashMap::new()),
            warned: Mutex::new(HashSet::new()),
        })
    }

    /// Snapshot of the current configuration document.
    pub fn config(&self) -> Arc<AliasConfig> {
        self.loaded
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .config
            .clone()
    }

    /// Resolve an alias to its model, following legacy mappings.
    pub fn resolve(
        &self,
        alias: &str,
        options: ResolveOptions,
    ) -> Result<ResolvedAlias, AliasError> {
        let cache_key = (alias.to_string(), options.allow_deprecated);
        let cached = self
            .cache
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&cache_key)
            .cloned();
        if let Some(hit) = cached {
            warn_if_deprecated(&hit, options);
            return Ok(hit);
        }

        let config = self.config();
        let terminal = self.walk_chain(&config, alias)?;

        let result = if let Some(deprecated) = config.deprecated_aliases.get(terminal) {
            if !options.allow_deprecated {
                return Err(AliasError::Deprecated {
                    alias: terminal.to_string(),
                    replacement: deprecated.replacement.clone(),
                    note: deprecated.deprecation_note.clone(),
                });
            }
            let replacement = config.aliases.get(&deprecated.replacement);
            ResolvedAlias {
                model_id: replacement.map(|m| m.model_id.clone()),
                alias: terminal.to_string(),
                original_alias: alias.to_string(),
                resolved: false,
                deprecated: true,
                recommended_replacement: Some(deprecated.replacement.clone()),
                deprecation_note: Some(deprecated.deprecation_note.clone()),
                model: replacement.cloned(),
            }
        } else if let Some(model) = config.aliases.get(terminal) {
            ResolvedAlias {
                model_id: Some(model.model_id.clone()),
                alias: terminal.to_string(),
                original_alias: alias.to_string(),
                resolved: true,
                deprecated: false,
                recommended_replacement: None,
                deprecation_note: None,
                model: Some(model.clone()),
            }
        } else {
            return Err(AliasError::UnknownAlias {
                alias: terminal.to_string(),
                available: config.aliases.keys().cloned().collect(),
            });
        };

        self.cache
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(cache_key, result.clone());
        warn_if_deprecated(&result, options);
        Ok(result)
    }

    /// Follow legacy mappings from `alias`, logging a configuration defect once
    /// per original alias.
    fn walk_chain<'a>(&self, config: &'a AliasConfig, alias: &'a str) -> Result<&'a str, AliasError> {
        follow_legacy_chain(config, alias).map_err(|fault| {
            if self.first_warning(alias) {
                tracing::error!(alias = %alias, "{}", fault);
            }
            fault.into_error(alias)
        })
    }

    /// Record that `alias` has been warned about; returns true the first time.
    fn first_warning(&self, alias: &str) -> bool {
        self.warned
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(alias.to_string())
    }

    /// Backend model ID for an alias. Fails for deprecated aliases.
    pub fn get_model_id(&self, alias: &str, options: ResolveOptions) -> Result<String, AliasError> {
        let resolved = self.resolve(alias, options)?;
        match (resolved.resolved, resolved.model_id) {
            (true, Some(model_id)) => Ok(model_id),
            _ => Err(AliasError::NotResolved {
                alias: alias.to_string(),
            }),
        }
    }

    /// Pricing for an alias; zero-cost when the model declares none.
    pub fn get_pricing(&self, alias: &str) -> Result<Pricing, AliasError> {
        let resolved = self.resolve(alias, ResolveOptions::allow_deprecated())?;
        Ok(resolved
            .model
            .and_then(|model| model.pricing)
            .unwrap_or_default())
    }

    /// Cost of `usage` tokens against the alias's per-1000-token pricing.
    pub fn calculate_cost(&self, alias: &str, usage: TokenUsage) -> Result<CostBreakdown, AliasError> {
        let pricing = self.get_pricing(alias)?;
        Ok(CostBreakdown::from_pricing(&pricing, usage))
    }

    /// List aliases. Active entries come first, ordered by ascending priority;
    /// deprecated entries (when requested) come last.
    pub fn list_aliases(&self, filter: &ListFilter) -> Vec<AliasSummary> {
        let config = self.config();
        let mut aliases = Vec::new();

        for (alias, model) in &config.aliases {
            if let Some(provider) = &filter.provider {
                if &model.provider != provider {
                    continue;
                }
            }
            if let Some(capability) = &filter.capability {
                if !model.capabilities.contains(capability) {
                    continue;
                }
            }
            aliases.push(AliasSummary {
                alias: alias.clone(),
                display_name: model.display_name.clone(),
                provider: model.provider.clone(),
                family: model.family.clone(),
                capabilities: model.capabilities.clone(),
                deprecated: false,
                priority: model.priority,
                replacement: None,
            });
        }

        // Deprecated entries carry no capabilities, so a capability filter
        // excludes all of them.
        if filter.include_deprecated && filter.capability.is_none() {
            for (alias, info) in &config.deprecated_aliases {
                if let Some(provider) = &filter.provider {
                    if &info.provider != provider {
                        continue;
                    }
                }
                aliases.push(AliasSummary {
                    alias: alias.clone(),
                    display_name: info.display_name.clone(),
                    provider: info.provider.clone(),
                    family: info.family.clone(),
                    capabilities: Vec::new(),
                    deprecated: true,
                    priority: None,
                    replacement: Some(info.replacement.clone()),
                });
            }
        }

        aliases.sort_by(|a, b| {
            a.deprecated
                .cmp(&b.deprecated)
                .then_with(|| a.sort_priority().cmp(&b.sort_priority()))
        });
        aliases
    }

    /// Complete metadata for an alias (deprecated aliases allowed).
    pub fn get_metadata(&self, alias: &str) -> Result<ModelMetadata, AliasError> {
        let resolved = self.resolve(alias, ResolveOptions::allow_deprecated())?;
        let model = resolved.model.as_ref();
        Ok(ModelMetadata {
            alias: alias.to_string(),
            model_id: resolved.model_id.clone(),
            display_name: model.map(|m| m.display_name.clone()),
            provider: model.map(|m| m.provider.clone()),
            family: model.map(|m| m.family.clone()),
            capabilities: model.map(|m| m.capabilities.clone()).unwrap_or_default(),
            context_window: model.map(|m| m.context_window),
            max_output_tokens: model.map(|m| m.max_output_tokens),
            requires_inference_profile: model.map_or(false, |m| m.requires_inference_profile),
            routing_id: model.and_then(|m| m.routing_id.clone()),
            regions: model.map(|m| m.regions.clone()).unwrap_or_default(),
            deprecated: resolved.deprecated,
            pricing: model.and_then(|m| m.pricing.clone()),
            notes: model.and_then(|m| m.notes.clone()),
        })
    }

    /// Whether the alias resolves at all (deprecated included). Never logs
    /// deprecation warnings.
    pub fn has_alias(&self, alias: &str) -> bool {
        self.resolve(alias, ResolveOptions::quiet()).is_ok()
    }

    /// SHA-256 (hex) of the raw configuration document.
    pub fn get_config_hash(&self) -> String {
        self.loaded
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .hash
            .clone()
    }

    /// Version, load time, hash and entry counts of the loaded document.
    pub fn config_metadata(&self) -> ConfigMetadata {
        let loaded = self.loaded.read().unwrap_or_else(PoisonError::into_inner);
        ConfigMetadata {
            version: loaded.config.version.clone(),
            last_updated: loaded.config.last_updated.clone(),
            last_load_time: loaded.loaded_at,
            config_hash: loaded.hash.clone(),
            total_aliases: loaded.config.aliases.len(),
            total_deprecated: loaded.config.deprecated_aliases.len(),
            total_legacy_mappings: loaded.config.legacy_mappings.len(),
            metadata: loaded.config.metadata.clone(),
        }
    }

    /// Re-read the source and clear memoized results.
    ///
    /// On failure the previous document stays active.
    pub fn reload(&self) -> Result<(), AliasError> {
        let fresh = read_source(&self.source)?;
        let hash = fresh.hash.clone();
        *self.loaded.write().unwrap_or_else(PoisonError::into_inner) = fresh;
        self.cache
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
        tracing::info!(source = %self.source.label(), hash = %hash, "Reloaded model alias configuration");
        Ok(())
    }

    /// Number of memoized resolutions.
    pub fn cached_entries(&self) -> usize {
        self.cache
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

/// A defect found while following legacy mappings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum ChainFault {
    Cycle(Vec<String>),
    SelfMapping(String),
    TooDeep,
}

impl std::fmt::Display for ChainFault {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Cycle(cycle) => write!(f, "Cycle detected in alias resolution: {}", cycle.join(" -> ")),
            Self::SelfMapping(alias) => write!(f, "Self-mapping detected for '{}'", alias),
            Self::TooDeep => write!(f, "Alias chain exceeds maximum depth of {}", MAX_CHAIN_DEPTH),
        }
    }
}

impl ChainFault {
    fn into_error(self, alias: &str) -> AliasError {
        match self {
            Self::Cycle(cycle) => AliasError::CycleDetected {
                alias: alias.to_string(),
                cycle,
            },
            Self::SelfMapping(alias) => AliasError::SelfMapping { alias },
            Self::TooDeep => AliasError::DepthExceeded {
                alias: alias.to_string(),
                max_depth: MAX_CHAIN_DEPTH,
            },
        }
    }
}

/// Walk `legacyMappings` from `alias` to the alias the chain ends on.
///
/// Iterative with a visited set and a hard depth bound.
pub(crate) fn follow_legacy_chain<'a>(
    config: &'a AliasConfig,
    alias: &'a str,
) -> Result<&'a str, ChainFault> {
    let mut visited: HashSet<&str> = HashSet::new();
    let mut chain: Vec<&str> = Vec::new();
    let mut current = alias;
    let mut depth = 0usize;

    loop {
        if !visited.insert(current) {
            let start = chain.iter().position(|a| *a == current).unwrap_or(0);
            let mut cycle: Vec<String> = chain[start..].iter().map(|a| a.to_string()).collect();
            cycle.push(current.to_string());
            return Err(ChainFault::Cycle(cycle));
        }
        chain.push(current);

        if depth > MAX_CHAIN_DEPTH {
            return Err(ChainFault::TooDeep);
        }
        depth += 1;

        match config.legacy_mappings.get(current) {
            Some(target) if target == current => {
                return Err(ChainFault::SelfMapping(current.to_string()));
            }
            Some(target) => {
                tracing::debug!(from = %current, to = %target, "Legacy alias remapped");
                current = target.as_str();
            }
            None => return Ok(current),
        }
    }
}

fn read_source(source: &ConfigSource) -> Result<LoadedConfig, AliasError> {
    let raw = match source {
        ConfigSource::File(path) => {
            std::fs::read_to_string(path).map_err(|source| AliasError::ConfigRead {
                path: path.display().to_string(),
                source,
            })?
        }
        ConfigSource::Inline(raw) => raw.clone(),
    };

    let config: AliasConfig =
        serde_json::from_str(&raw).map_err(|e| AliasError::ConfigParse {
            path: source.label(),
            source: e,
        })?;

    Ok(LoadedConfig {
        config: Arc::new(config),
        hash: hex::encode(Sha256::digest(raw.as_bytes())),
        loaded_at: Utc::now(),
    })
}

/// Deprecation warnings are logged on every resolution that asks for them,
/// cached or not.
fn warn_if_deprecated(resolved: &ResolvedAlias, options: ResolveOptions) {
    if !(resolved.deprecated && options.warn_deprecated) {
        return;
    }
    let replacement = resolved.recommended_replacement.as_deref().unwrap_or_default();
    tracing::warn!(
        alias = %resolved.alias,
        replacement = %replacement,
        "DEPRECATED: {} Use '{}' instead.",
        resolved.deprecation_note.as_deref().unwrap_or_default(),
        replacement
    );
}
