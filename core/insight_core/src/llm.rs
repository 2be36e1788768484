//! Text-analysis capability: the model call behind the analyzer.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde_json::{json, Value};
use thiserror::Error;
use tracing::{debug, error, info};

pub const DEFAULT_LLM_BASE_URL: &str = "https://api.openai.com/v1";
pub const DEFAULT_LLM_MODEL: &str = "gpt-4o-mini";
const REQUEST_TIMEOUT_SECS: u64 = 60;

/// Outcome of one model call. Nothing here is an error to the caller; each
/// variant maps onto a fallback path in the analyzer.
#[derive(Debug)]
pub enum Completion {
    Text(String),
    /// No credential configured.
    ConfigAbsent,
    /// The provider answered 2xx but without usable text.
    MalformedResponse(String),
    ProviderError(ProviderError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderErrorKind {
    /// 401/403.
    Auth,
    /// 429.
    RateLimit,
    /// 408 or client-side timeout.
    Timeout,
    /// Connection refused, DNS failure, reset.
    Network,
    /// 5xx.
    ServerError,
    Unknown,
}

#[derive(Debug, Error)]
#[error("provider error ({kind:?}, status {status:?}): {message}")]
pub struct ProviderError {
    pub kind: ProviderErrorKind,
    pub status: Option<u16>,
    pub message: String,
}

impl ProviderError {
    pub fn from_status(status: u16, body: &str) -> Self {
        let kind = match status {
            401 | 403 => ProviderErrorKind::Auth,
            408 => ProviderErrorKind::Timeout,
            429 => ProviderErrorKind::RateLimit,
            500..=599 => ProviderErrorKind::ServerError,
            _ => ProviderErrorKind::Unknown,
        };
        Self {
            kind,
            status: Some(status),
            message: truncate_body(body),
        }
    }

    pub fn network(err: &reqwest::Error) -> Self {
        let kind = if err.is_timeout() {
            ProviderErrorKind::Timeout
        } else {
            ProviderErrorKind::Network
        };
        Self {
            kind,
            status: None,
            message: err.to_string(),
        }
    }
}

#[async_trait]
pub trait TextAnalysisCapability: Send + Sync {
    /// Whether a credential is present. Absence is a normal configuration.
    fn is_configured(&self) -> bool;

    async fn complete(&self, prompt: &str, max_tokens: u32, temperature: f32) -> Completion;
}

/// Chat-completions client for any OpenAI-compatible endpoint.
pub struct OpenAiCompatibleClient {
    client: Client,
    base_url: String,
    model: String,
    api_key: Option<String>,
}

impl OpenAiCompatibleClient {
    pub fn new(base_url: &str, model: &str, api_key: Option<String>) -> anyhow::Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .build()?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            model: model.to_string(),
            api_key: api_key.filter(|k| !k.trim().is_empty()),
        })
    }
}

#[async_trait]
impl TextAnalysisCapability for OpenAiCompatibleClient {
    fn is_configured(&self) -> bool {
        self.api_key.is_some()
    }

    async fn complete(&self, prompt: &str, max_tokens: u32, temperature: f32) -> Completion {
        let Some(api_key) = self.api_key.as_deref() else {
            return Completion::ConfigAbsent;
        };

        let body = json!({
            "model": self.model,
            "messages": [{ "role": "user", "content": prompt }],
            "max_tokens": max_tokens,
            "temperature": temperature,
        });
        let url = format!("{}/chat/completions", self.base_url);
        info!(model = %self.model, max_tokens, "calling LLM API");

        let resp = match self
            .client
            .post(&url)
            .bearer_auth(api_key)
            .json(&body)
            .send()
            .await
        {
            Ok(r) => r,
            Err(e) => {
                error!("LLM request failed: {e}");
                return Completion::ProviderError(ProviderError::network(&e));
            }
        };

        let status = resp.status();
        let text = match resp.text().await {
            Ok(t) => t,
            Err(e) => return Completion::ProviderError(ProviderError::network(&e)),
        };
        if !status.is_success() {
            error!(status = %status, "LLM API error");
            return Completion::ProviderError(ProviderError::from_status(status.as_u16(), &text));
        }
        debug!(bytes = text.len(), "LLM response received");

        extract_content(&text)
    }
}

/// Pull `choices[0].message.content` out of a chat-completions body.
fn extract_content(body: &str) -> Completion {
    let data: Value = match serde_json::from_str(body) {
        Ok(v) => v,
        Err(e) => return Completion::MalformedResponse(format!("envelope is not JSON: {e}")),
    };
    match data["choices"][0]["message"]["content"].as_str() {
        Some(content) => Completion::Text(content.to_string()),
        None => Completion::MalformedResponse("no choices[0].message.content".to_string()),
    }
}

fn truncate_body(body: &str) -> String {
    const MAX: usize = 300;
    match body.char_indices().nth(MAX) {
        Some((idx, _)) => format!("{}...", &body[..idx]),
        None => body.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_classification() {
        assert_eq!(ProviderError::from_status(401, "").kind, ProviderErrorKind::Auth);
        assert_eq!(ProviderError::from_status(429, "").kind, ProviderErrorKind::RateLimit);
        assert_eq!(ProviderError::from_status(503, "").kind, ProviderErrorKind::ServerError);
        assert_eq!(ProviderError::from_status(418, "").kind, ProviderErrorKind::Unknown);
    }

    #[test]
    fn extract_content_reads_first_choice() {
        let body = r#"{"choices":[{"message":{"role":"assistant","content":"{\"mood\":\"sad\"}"}}]}"#;
        match extract_content(body) {
            Completion::Text(t) => assert_eq!(t, r#"{"mood":"sad"}"#),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn extract_content_flags_missing_choices() {
        assert!(matches!(
            extract_content(r#"{"choices":[]}"#),
            Completion::MalformedResponse(_)
        ));
        assert!(matches!(extract_content("<html>"), Completion::MalformedResponse(_)));
    }

    #[tokio::test]
    async fn missing_key_is_config_absent() {
        let client = OpenAiCompatibleClient::new(DEFAULT_LLM_BASE_URL, DEFAULT_LLM_MODEL, Some("  ".into())).unwrap();
        assert!(!client.is_configured());
        assert!(matches!(client.complete("hi", 10, 0.7).await, Completion::ConfigAbsent));
    }

    #[test]
    fn long_bodies_are_truncated() {
        let body = "x".repeat(1000);
        assert_eq!(truncate_body(&body).len(), 303);
    }
}
