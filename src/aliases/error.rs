use thiserror::Error;

/// Errors raised while loading or resolving model aliases.
#[derive(Debug, Error)]
pub enum AliasError {
    #[error("Failed to read model alias configuration {path}: {source}")]
    ConfigRead {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse model alias configuration {path}: {source}")]
    ConfigParse {
        path: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("Unknown model alias: '{alias}'. Available aliases: {}", .available.join(", "))]
    UnknownAlias {
        alias: String,
        available: Vec<String>,
    },

    #[error("Circular alias reference detected for '{alias}': {}", .cycle.join(" -> "))]
    CycleDetected { alias: String, cycle: Vec<String> },

    #[error("Self-mapping detected for alias '{alias}'")]
    SelfMapping { alias: String },

    #[error("Alias chain for '{alias}' exceeds the maximum depth of {max_depth}")]
    DepthExceeded { alias: String, max_depth: usize },

    #[error("Model alias '{alias}' is deprecated. {note} Use '{replacement}' instead.")]
    Deprecated {
        alias: String,
        replacement: String,
        note: String,
    },

    #[error("Cannot get model ID for deprecated alias '{alias}'")]
    NotResolved { alias: String },
}

impl AliasError {
    /// Whether the error comes from a broken configuration rather than from the
    /// caller's input.
    pub fn is_config_defect(&self) -> bool {
        matches!(
            self,
            Self::ConfigRead { .. }
                | Self::ConfigParse { .. }
                | Self::CycleDetected { .. }
                | Self::SelfMapping { .. }
                | Self::DepthExceeded { .. }
        )
    }
}
