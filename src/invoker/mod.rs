//! Invoker module - resolves an alias, builds the request body and sends it
//! through the retry layer to an inference transport.
//!
//! # Key Concepts
//! - Dispatch ID: the routing identifier for models that require one, otherwise the model ID
//! - Request body: Anthropic messages format with sampling defaults filled in
//! - Transport: any backend implementing [`InferenceTransport`]; [`HttpTransport`] posts JSON over HTTP

mod transport;

pub use transport::{
    classify_http_status, parse_invoke_response, HttpTransport, InferenceTransport,
    InvocationResponse, TransportError, TransportErrorKind,
};

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;

use crate::aliases::{AliasError, AliasResolver, CostBreakdown, ResolveOptions, TokenUsage};
use crate::config::Config;
use crate::resilience::{ErrorKind, ErrorSignal, ExecuteContext, ExecuteError, UnifiedRetryLayer};

pub const ANTHROPIC_VERSION: &str = "bedrock-2023-05-31";
pub const DEFAULT_MAX_TOKENS: u32 = 2000;
pub const DEFAULT_TEMPERATURE: f64 = 0.7;
pub const DEFAULT_TOP_P: f64 = 0.9;
pub const DEFAULT_TOP_K: u32 = 40;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
}

impl Message {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

/// Either a bare prompt or a full conversation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Prompt {
    Text(String),
    Messages(Vec<Message>),
}

impl Prompt {
    pub fn into_messages(self) -> Vec<Message> {
        match self {
            Self::Text(text) => vec![Message::user(text)],
            Self::Messages(messages) => messages,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InvokeRequest {
    pub input: Prompt,
    #[serde(default)]
    pub max_tokens: Option<u32>,
    #[serde(default)]
    pub temperature: Option<f64>,
    #[serde(default)]
    pub top_p: Option<f64>,
    #[serde(default)]
    pub top_k: Option<u32>,
    #[serde(default)]
    pub stop_sequences: Vec<String>,
}

impl InvokeRequest {
    pub fn prompt(text: impl Into<String>) -> Self {
        Self::new(Prompt::Text(text.into()))
    }

    pub fn messages(messages: Vec<Message>) -> Self {
        Self::new(Prompt::Messages(messages))
    }

    fn new(input: Prompt) -> Self {
        Self {
            input,
            max_tokens: None,
            temperature: None,
            top_p: None,
            top_k: None,
            stop_sequences: Vec::new(),
        }
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }

    pub fn with_temperature(mut self, temperature: f64) -> Self {
        self.temperature = Some(temperature);
        self
    }

    pub fn with_stop_sequences(mut self, stop_sequences: Vec<String>) -> Self {
        self.stop_sequences = stop_sequences;
        self
    }
}

/// Build the JSON body sent to the backend. A zero `max_tokens` falls back to
/// the default.
pub fn build_request_body(request: &InvokeRequest) -> serde_json::Value {
    let mut body = serde_json::json!({
        "anthropic_version": ANTHROPIC_VERSION,
        "max_tokens": request.max_tokens.filter(|&n| n > 0).unwrap_or(DEFAULT_MAX_TOKENS),
        "messages": request.input.clone().into_messages(),
        "temperature": request.temperature.unwrap_or(DEFAULT_TEMPERATURE),
        "top_p": request.top_p.unwrap_or(DEFAULT_TOP_P),
        "top_k": request.top_k.unwrap_or(DEFAULT_TOP_K),
    });
    if !request.stop_sequences.is_empty() {
        body["stop_sequences"] = serde_json::json!(request.stop_sequences);
    }
    body
}

/// Result of a successful invocation.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Invocation {
    pub text: String,
    pub usage: TokenUsage,
    pub stop_reason: Option<String>,
    /// Alias the model was resolved to.
    pub alias: String,
    /// Alias the caller asked for.
    pub original_alias: String,
    /// Identifier the request was dispatched to.
    pub model_id: String,
    pub cost: CostBreakdown,
    #[serde(with = "duration_millis")]
    pub latency: Duration,
}

mod duration_millis {
    use serde::Serializer;
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(u64::try_from(value.as_millis()).unwrap_or(u64::MAX))
    }
}

#[derive(Debug, Error)]
pub enum InvokeError {
    #[error(transparent)]
    Alias(#[from] AliasError),

    #[error("Model invocation failed: {0}")]
    Execute(#[from] ExecuteError<TransportError>),
}

impl InvokeError {
    /// Classified kind of a failed invocation; `None` for alias errors.
    pub fn kind(&self) -> Option<ErrorKind> {
        match self {
            Self::Alias(_) => None,
            Self::Execute(error) => Some(error.kind()),
        }
    }
}

impl ErrorSignal for InvokeError {
    fn status_code(&self) -> Option<u16> {
        match self {
            Self::Alias(_) => None,
            Self::Execute(error) => error.status_code(),
        }
    }
}

/// Alias resolution, retries and transport wired together.
pub struct ModelInvoker {
    resolver: Arc<AliasResolver>,
    retry: Arc<UnifiedRetryLayer>,
    transport: Arc<dyn InferenceTransport>,
    resolve_options: ResolveOptions,
}

impl ModelInvoker {
    pub fn new(
        resolver: Arc<AliasResolver>,
        retry: Arc<UnifiedRetryLayer>,
        transport: Arc<dyn InferenceTransport>,
    ) -> Self {
        Self {
            resolver,
            retry,
            transport,
            resolve_options: ResolveOptions::default(),
        }
    }

    /// Build an invoker from environment configuration, using the HTTP transport.
    pub fn from_config(config: &Config) -> anyhow::Result<Self> {
        let resolver = AliasResolver::load(&config.aliases_path)?;
        let transport = HttpTransport::new(
            &config.endpoint,
            config.api_key.clone(),
            config.request_timeout,
        )?;
        tracing::info!(
            aliases = %config.aliases_path.display(),
            endpoint = %config.endpoint,
            config_hash = %resolver.get_config_hash(),
            "Model invoker initialized"
        );
        Ok(Self::new(
            Arc::new(resolver),
            Arc::new(UnifiedRetryLayer::new(config.retry.clone())),
            Arc::new(transport),
        ))
    }

    /// Options used when resolving aliases, e.g. to accept deprecated ones.
    pub fn with_resolve_options(mut self, options: ResolveOptions) -> Self {
        self.resolve_options = options;
        self
    }

    pub fn resolver(&self) -> &Arc<AliasResolver> {
        &self.resolver
    }

    pub fn retry_layer(&self) -> &Arc<UnifiedRetryLayer> {
        &self.retry
    }

    /// Resolve `alias` and invoke its model with `request`.
    pub async fn invoke(&self, alias: &str, request: &InvokeRequest) -> Result<Invocation, InvokeError> {
        let resolved = self.resolver.resolve(alias, self.resolve_options)?;
        let model = resolved.model.ok_or_else(|| AliasError::NotResolved {
            alias: alias.to_string(),
        })?;
        let pricing = model.pricing.clone().unwrap_or_default();
        let dispatch_id = model.dispatch_id().to_string();
        let body = build_request_body(request);

        let transport = &self.transport;
        let dispatch = dispatch_id.as_str();
        let payload = &body;
        let started = Instant::now();
        let response = self
            .retry
            .execute(
                move || transport.invoke(dispatch, payload),
                ExecuteContext::default()
                    .with_model(resolved.alias.clone())
                    .with_cost(|response: &InvocationResponse| {
                        Some(CostBreakdown::from_pricing(&pricing, response.usage).total_cost)
                    }),
            )
            .await?;
        let latency = started.elapsed();

        let cost = CostBreakdown::from_pricing(&pricing, response.usage);
        tracing::info!(
            alias = %resolved.alias,
            model_id = %dispatch_id,
            input_tokens = response.usage.input_tokens,
            output_tokens = response.usage.output_tokens,
            cost = cost.total_cost,
            latency_ms = u64::try_from(latency.as_millis()).unwrap_or(u64::MAX),
            "Model invocation completed"
        );

        Ok(Invocation {
            text: response.text,
            usage: response.usage,
            stop_reason: response.stop_reason,
            alias: resolved.alias,
            original_alias: resolved.original_alias,
            model_id: dispatch_id,
            cost,
            latency,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resilience::RetryConfig;
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    const CONFIG: &str = r#"{
        "version": "2.1.0",
        "aliases": {
            "claude-haiku": {
                "modelId": "anthropic.claude-3-5-haiku-20241022-v1:0",
                "pricing": { "input": 0.001, "output": 0.005 }
            },
            "claude-sonnet": {
                "modelId": "anthropic.claude-sonnet-4-5-20250929-v1:0",
                "requiresInferenceProfile": true,
                "routingId": "arn:aws:bedrock:us-east-1:123456789012:inference-profile/us.anthropic.claude-sonnet-4-5-20250929-v1:0",
                "pricing": { "input": 0.003, "output": 0.015 }
            }
        },
        "legacyMappings": { "claude-latest": "claude-sonnet" },
        "deprecatedAliases": {
            "claude-v2": { "replacement": "claude-haiku", "deprecationNote": "Claude 2 is retired." }
        }
    }"#;

    #[derive(Default)]
    struct ScriptedTransport {
        responses: Mutex<VecDeque<Result<InvocationResponse, TransportError>>>,
        calls: Mutex<Vec<(String, serde_json::Value)>>,
    }

    impl ScriptedTransport {
        fn with(responses: Vec<Result<InvocationResponse, TransportError>>) -> Arc<Self> {
            Arc::new(Self {
                responses: Mutex::new(responses.into()),
                calls: Mutex::default(),
            })
        }

        fn calls(&self) -> Vec<(String, serde_json::Value)> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl InferenceTransport for ScriptedTransport {
        async fn invoke(
            &self,
            model_id: &str,
            body: &serde_json::Value,
        ) -> Result<InvocationResponse, TransportError> {
            self.calls
                .lock()
                .unwrap()
                .push((model_id.to_string(), body.clone()));
            self.responses
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Err(TransportError::network_error("no scripted response")))
        }
    }

    fn reply(text: &str, input_tokens: u64, output_tokens: u64) -> Result<InvocationResponse, TransportError> {
        Ok(InvocationResponse {
            text: text.to_string(),
            usage: TokenUsage::new(input_tokens, output_tokens),
            stop_reason: Some("end_turn".to_string()),
        })
    }

    fn invoker(transport: Arc<ScriptedTransport>) -> ModelInvoker {
        let resolver = AliasResolver::from_json(CONFIG).unwrap();
        let retry = UnifiedRetryLayer::new(RetryConfig {
            base_delay_ms: 5,
            jitter_factor: 0.0,
            ..RetryConfig::default()
        });
        ModelInvoker::new(Arc::new(resolver), Arc::new(retry), transport)
    }

    #[test]
    fn test_request_body_defaults() {
        let body = build_request_body(&InvokeRequest::prompt("hello"));
        assert_eq!(body["anthropic_version"], ANTHROPIC_VERSION);
        assert_eq!(body["max_tokens"], 2000);
        assert_eq!(body["temperature"], 0.7);
        assert_eq!(body["top_p"], 0.9);
        assert_eq!(body["top_k"], 40);
        assert_eq!(body["messages"][0]["role"], "user");
        assert_eq!(body["messages"][0]["content"], "hello");
        assert!(body.get("stop_sequences").is_none());
    }

    #[test]
    fn test_request_body_overrides() {
        let request = InvokeRequest::messages(vec![
            Message::user("hi"),
            Message::assistant("hello"),
            Message::user("bye"),
        ])
        .with_max_tokens(0)
        .with_temperature(0.0)
        .with_stop_sequences(vec!["\n\nHuman:".to_string()]);
        let body = build_request_body(&request);
        assert_eq!(body["max_tokens"], 2000);
        assert_eq!(body["temperature"], 0.0);
        assert_eq!(body["messages"].as_array().unwrap().len(), 3);
        assert_eq!(body["messages"][1]["role"], "assistant");
        assert_eq!(body["stop_sequences"][0], "\n\nHuman:");
    }

    #[tokio::test]
    async fn test_invoke_dispatches_routing_id_and_prices_usage() {
        let transport = ScriptedTransport::with(vec![reply("pong", 1000, 1000)]);
        let invoker = invoker(Arc::clone(&transport));

        let invocation = invoker
            .invoke("claude-latest", &InvokeRequest::prompt("ping"))
            .await
            .unwrap();

        assert_eq!(invocation.text, "pong");
        assert_eq!(invocation.alias, "claude-sonnet");
        assert_eq!(invocation.original_alias, "claude-latest");
        assert!(invocation.model_id.starts_with("arn:aws:bedrock:"));
        assert!((invocation.cost.total_cost - 0.018).abs() < 1e-12);

        let calls = transport.calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].0, invocation.model_id);

        let summary = invoker.retry_layer().get_telemetry();
        assert_eq!(summary.successful_calls, 1);
        assert!((summary.cost_by_model["claude-sonnet"].total_cost - 0.018).abs() < 1e-12);
    }

    #[tokio::test(start_paused = true)]
    async fn test_invoke_retries_throttled_transport() {
        let transport = ScriptedTransport::with(vec![
            Err(TransportError::rate_limited("ThrottlingException", None)),
            reply("ok", 10, 2),
        ]);
        let invoker = invoker(Arc::clone(&transport));

        let invocation = invoker
            .invoke("claude-haiku", &InvokeRequest::prompt("ping"))
            .await
            .unwrap();

        assert_eq!(invocation.model_id, "anthropic.claude-3-5-haiku-20241022-v1:0");
        assert_eq!(transport.calls().len(), 2);
        let summary = invoker.retry_layer().get_telemetry();
        assert_eq!(summary.retried_calls, 1);
        assert_eq!(summary.errors_by_type.get(&ErrorKind::Throttling), Some(&1));
    }

    #[tokio::test]
    async fn test_invoke_surfaces_permanent_failure() {
        let transport = ScriptedTransport::with(vec![Err(TransportError::from_status(
            403,
            "AccessDeniedException",
            None,
        ))]);
        let invoker = invoker(Arc::clone(&transport));

        let err = invoker
            .invoke("claude-haiku", &InvokeRequest::prompt("ping"))
            .await
            .unwrap_err();

        assert_eq!(err.kind(), Some(ErrorKind::Authorization));
        assert_eq!(err.status_code(), Some(403));
        assert_eq!(transport.calls().len(), 1);
    }

    #[tokio::test]
    async fn test_deprecated_alias_requires_opt_in() {
        let transport = ScriptedTransport::with(vec![reply("ok", 1, 1)]);
        let strict = invoker(Arc::clone(&transport));

        let err = strict
            .invoke("claude-v2", &InvokeRequest::prompt("ping"))
            .await
            .unwrap_err();
        assert!(matches!(err, InvokeError::Alias(AliasError::Deprecated { .. })));
        assert!(transport.calls().is_empty());

        let lenient = invoker(Arc::clone(&transport)).with_resolve_options(ResolveOptions::allow_deprecated());
        let invocation = lenient
            .invoke("claude-v2", &InvokeRequest::prompt("ping"))
            .await
            .unwrap();
        assert_eq!(invocation.model_id, "anthropic.claude-3-5-haiku-20241022-v1:0");
    }
}
