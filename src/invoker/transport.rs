//! Transport seam between the invoker and a remote inference backend.

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use url::Url;

use crate::aliases::TokenUsage;
use crate::resilience::ErrorSignal;

/// Broad class of a transport failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportErrorKind {
    RateLimited,
    ServerError,
    ClientError,
    NetworkError,
    ParseError,
}

impl std::fmt::Display for TransportErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::RateLimited => "rate limited",
            Self::ServerError => "server error",
            Self::ClientError => "client error",
            Self::NetworkError => "network error",
            Self::ParseError => "parse error",
        })
    }
}

/// Map an HTTP status to a transport error kind.
pub fn classify_http_status(status: u16) -> TransportErrorKind {
    match status {
        429 => TransportErrorKind::RateLimited,
        400..=499 => TransportErrorKind::ClientError,
        _ => TransportErrorKind::ServerError,
    }
}

#[derive(Debug, Clone, Error)]
#[error("{kind}: {message}")]
pub struct TransportError {
    pub kind: TransportErrorKind,
    pub status: Option<u16>,
    pub message: String,
    /// Server-provided hint from a `Retry-After` header.
    pub retry_after: Option<Duration>,
}

impl TransportError {
    pub fn from_status(status: u16, message: impl Into<String>, retry_after: Option<Duration>) -> Self {
        Self {
            kind: classify_http_status(status),
            status: Some(status),
            message: message.into(),
            retry_after,
        }
    }

    pub fn rate_limited(message: impl Into<String>, retry_after: Option<Duration>) -> Self {
        Self::from_status(429, message, retry_after)
    }

    pub fn network_error(message: impl Into<String>) -> Self {
        Self {
            kind: TransportErrorKind::NetworkError,
            status: None,
            message: message.into(),
            retry_after: None,
        }
    }

    pub fn parse_error(message: impl Into<String>) -> Self {
        Self {
            kind: TransportErrorKind::ParseError,
            status: None,
            message: message.into(),
            retry_after: None,
        }
    }
}

impl ErrorSignal for TransportError {
    fn status_code(&self) -> Option<u16> {
        self.status
    }
}

/// Text, token usage and stop reason returned by one inference call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InvocationResponse {
    pub text: String,
    pub usage: TokenUsage,
    pub stop_reason: Option<String>,
}

/// A remote inference backend.
#[async_trait]
pub trait InferenceTransport: Send + Sync {
    /// Send `body` to the model identified by `model_id`.
    async fn invoke(
        &self,
        model_id: &str,
        body: &serde_json::Value,
    ) -> Result<InvocationResponse, TransportError>;
}

#[derive(Debug, Deserialize)]
struct ContentBlock {
    #[serde(default)]
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
struct InvokeResponseBody {
    #[serde(default)]
    content: Vec<ContentBlock>,
    #[serde(default)]
    completion: Option<String>,
    #[serde(default)]
    usage: TokenUsage,
    #[serde(default)]
    stop_reason: Option<String>,
}

/// Parse an invoke response body. Messages-style `content` blocks win over a
/// legacy `completion` string.
pub fn parse_invoke_response(body: &str) -> Result<InvocationResponse, TransportError> {
    let parsed: InvokeResponseBody = serde_json::from_str(body).map_err(|e| {
        TransportError::parse_error(format!("Failed to parse response: {}, body: {}", e, body))
    })?;

    let text = parsed
        .content
        .into_iter()
        .find_map(|block| block.text)
        .or(parsed.completion)
        .ok_or_else(|| TransportError::parse_error("No text content in response"))?;

    Ok(InvocationResponse {
        text,
        usage: parsed.usage,
        stop_reason: parsed.stop_reason,
    })
}

/// HTTP transport posting JSON bodies to `{endpoint}/model/{model_id}/invoke`.
pub struct HttpTransport {
    client: Client,
    endpoint: Url,
    api_key: Option<String>,
}

impl std::fmt::Debug for HttpTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpTransport")
            .field("endpoint", &self.endpoint.as_str())
            .field("api_key", &self.api_key.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

impl HttpTransport {
    pub fn new(endpoint: &str, api_key: Option<String>, timeout: Duration) -> anyhow::Result<Self> {
        let endpoint = Url::parse(endpoint)
            .map_err(|e| anyhow::anyhow!("Invalid inference endpoint {}: {}", endpoint, e))?;
        if !matches!(endpoint.scheme(), "http" | "https") {
            anyhow::bail!("Inference endpoint must be http or https: {}", endpoint);
        }
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            endpoint,
            api_key,
        })
    }

    pub fn invoke_url(&self, model_id: &str) -> String {
        format!(
            "{}/model/{}/invoke",
            self.endpoint.as_str().trim_end_matches('/'),
            urlencoding::encode(model_id)
        )
    }

    fn parse_retry_after(headers: &reqwest::header::HeaderMap) -> Option<Duration> {
        headers
            .get("retry-after")
            .and_then(|v| v.to_str().ok())
            .and_then(|s| s.trim().parse::<u64>().ok())
            .map(Duration::from_secs)
    }
}

#[async_trait]
impl InferenceTransport for HttpTransport {
    async fn invoke(
        &self,
        model_id: &str,
        body: &serde_json::Value,
    ) -> Result<InvocationResponse, TransportError> {
        let mut request = self
            .client
            .post(self.invoke_url(model_id))
            .header("Accept", "application/json")
            .json(body);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let response = match request.send().await {
            Ok(r) => r,
            Err(e) if e.is_timeout() => {
                return Err(TransportError::network_error(format!("Request timed out: {}", e)))
            }
            Err(e) if e.is_connect() => {
                return Err(TransportError::network_error(format!("Connection failed: {}", e)))
            }
            Err(e) => return Err(TransportError::network_error(format!("Request failed: {}", e))),
        };

        let status = response.status();
        let retry_after = Self::parse_retry_after(response.headers());
        let text = response.text().await.unwrap_or_default();

        if !status.is_success() {
            tracing::debug!(status = status.as_u16(), model_id = %model_id, "Inference request rejected");
            return Err(TransportError::from_status(status.as_u16(), text, retry_after));
        }

        parse_invoke_response(&text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resilience::{categorize_error, ErrorKind};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// Serve a single canned HTTP response and hand back the raw request.
    async fn serve_once(response: &'static str) -> (String, tokio::task::JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let handle = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut raw = Vec::new();
            let mut buf = [0u8; 4096];
            loop {
                let n = socket.read(&mut buf).await.unwrap();
                raw.extend_from_slice(&buf[..n]);
                let text = String::from_utf8_lossy(&raw).to_string();
                if let Some(header_end) = text.find("\r\n\r\n") {
                    let content_length = text[..header_end]
                        .lines()
                        .find_map(|l| {
                            let (name, value) = l.split_once(':')?;
                            name.eq_ignore_ascii_case("content-length")
                                .then(|| value.trim().parse::<usize>().ok())
                                .flatten()
                        })
                        .unwrap_or(0);
                    if raw.len() >= header_end + 4 + content_length {
                        break;
                    }
                }
                if n == 0 {
                    break;
                }
            }
            socket.write_all(response.as_bytes()).await.unwrap();
            socket.shutdown().await.unwrap();
            String::from_utf8_lossy(&raw).to_string()
        });
        (format!("http://{}", addr), handle)
    }

    #[test]
    fn test_classify_http_status() {
        assert_eq!(classify_http_status(429), TransportErrorKind::RateLimited);
        assert_eq!(classify_http_status(403), TransportErrorKind::ClientError);
        assert_eq!(classify_http_status(503), TransportErrorKind::ServerError);
    }

    #[test]
    fn test_transport_errors_categorize() {
        let throttled = TransportError::rate_limited("Too many requests", None);
        assert_eq!(categorize_error(&throttled), ErrorKind::Throttling);
        let timeout = TransportError::network_error("Request timed out: deadline elapsed");
        assert_eq!(categorize_error(&timeout), ErrorKind::Timeout);
        let denied = TransportError::from_status(403, "{}", None);
        assert_eq!(categorize_error(&denied), ErrorKind::Authorization);
        let unavailable = TransportError::from_status(503, "ServiceUnavailable", None);
        assert_eq!(categorize_error(&unavailable), ErrorKind::ServerError);
    }

    #[test]
    fn test_parse_messages_and_completion_bodies() {
        let messages = parse_invoke_response(
            r#"{"content":[{"type":"text","text":"hello"}],"usage":{"input_tokens":12,"output_tokens":3},"stop_reason":"end_turn"}"#,
        )
        .unwrap();
        assert_eq!(messages.text, "hello");
        assert_eq!(messages.usage, TokenUsage::new(12, 3));
        assert_eq!(messages.stop_reason.as_deref(), Some("end_turn"));

        let legacy = parse_invoke_response(r#"{"completion":"hi"}"#).unwrap();
        assert_eq!(legacy.text, "hi");
        assert_eq!(legacy.usage, TokenUsage::default());

        let empty = parse_invoke_response(r#"{"content":[]}"#).unwrap_err();
        assert_eq!(empty.kind, TransportErrorKind::ParseError);
    }

    #[test]
    fn test_invoke_url_encodes_model_id() {
        let transport =
            HttpTransport::new("https://runtime.example.com/", None, Duration::from_secs(5)).unwrap();
        assert_eq!(
            transport.invoke_url("anthropic.claude-3-5-haiku-20241022-v1:0"),
            "https://runtime.example.com/model/anthropic.claude-3-5-haiku-20241022-v1%3A0/invoke"
        );
        assert!(HttpTransport::new("ftp://runtime.example.com", None, Duration::from_secs(5)).is_err());
        assert!(HttpTransport::new("not a url", None, Duration::from_secs(5)).is_err());
    }

    #[tokio::test]
    async fn test_http_invoke_round_trip() {
        let (endpoint, server) = serve_once(
            "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: 74\r\nConnection: close\r\n\r\n{\"content\":[{\"text\":\"pong\"}],\"usage\":{\"input_tokens\":4,\"output_tokens\":1}}",
        )
        .await;
        let transport =
            HttpTransport::new(&endpoint, Some("secret".to_string()), Duration::from_secs(5)).unwrap();

        let response = transport
            .invoke("model-a", &serde_json::json!({ "max_tokens": 10 }))
            .await
            .unwrap();
        assert_eq!(response.text, "pong");
        assert_eq!(response.usage.total(), 5);

        let request = server.await.unwrap();
        assert!(request.starts_with("POST /model/model-a/invoke"));
        assert!(request.to_lowercase().contains("authorization: bearer secret"));
        assert!(request.contains("\"max_tokens\":10"));
    }

    #[tokio::test]
    async fn test_http_error_status_carries_retry_after() {
        let (endpoint, _server) = serve_once(
            "HTTP/1.1 429 Too Many Requests\r\nRetry-After: 7\r\nContent-Length: 19\r\nConnection: close\r\n\r\nThrottlingException",
        )
        .await;
        let transport = HttpTransport::new(&endpoint, None, Duration::from_secs(5)).unwrap();

        let err = transport
            .invoke("model-a", &serde_json::json!({}))
            .await
            .unwrap_err();
        assert_eq!(err.kind, TransportErrorKind::RateLimited);
        assert_eq!(err.status, Some(429));
        assert_eq!(err.retry_after, Some(Duration::from_secs(7)));
        assert_eq!(err.message, "ThrottlingException");
    }
}
