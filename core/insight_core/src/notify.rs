//! Push delivery: the push capability, its FCM adapter and the dispatcher
//! that resolves targets and classifies results.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::store::{EntryStore, StoreError};

const FCM_ENDPOINT: &str = "https://fcm.googleapis.com/v1";
const REQUEST_TIMEOUT_SECS: u64 = 30;

pub const CODE_INVALID_TOKEN: &str = "invalid-registration-token";
pub const CODE_NOT_REGISTERED: &str = "registration-token-not-registered";
pub const CODE_NOT_CONFIGURED: &str = "not-configured";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PushPayload {
    pub title: String,
    pub body: String,
    #[serde(default)]
    pub data: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Error)]
#[error("push provider error {code}: {message}")]
pub struct PushError {
    pub code: String,
    pub message: String,
}

impl PushError {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
        }
    }
}

#[async_trait]
pub trait PushCapability: Send + Sync {
    /// Returns the provider's message id.
    async fn send_to_token(&self, token: &str, payload: &PushPayload) -> Result<String, PushError>;
}

/// Result of one send, as a value. Never an `Err` for the caller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum SendOutcome {
    Delivered { message_id: String },
    /// Terminal: the stored token should not be used again.
    InvalidToken { code: String },
    TransientFailure { reason: String },
}

impl SendOutcome {
    pub fn classify(result: Result<String, PushError>) -> Self {
        match result {
            Ok(message_id) => SendOutcome::Delivered { message_id },
            Err(e) if is_invalid_token_code(&e.code) => SendOutcome::InvalidToken { code: e.code },
            Err(e) => SendOutcome::TransientFailure {
                reason: format!("{}: {}", e.code, e.message),
            },
        }
    }
}

/// Accepts bare codes and namespaced ones such as `messaging/invalid-registration-token`.
pub fn is_invalid_token_code(code: &str) -> bool {
    let bare = code.rsplit('/').next().unwrap_or(code);
    bare == CODE_INVALID_TOKEN || bare == CODE_NOT_REGISTERED
}

/// Enough of a token to correlate log lines without leaking it.
pub fn token_prefix(token: &str) -> String {
    let head: String = token.chars().take(8).collect();
    format!("{head}...")
}

/// FCM HTTP v1 sender using a pre-issued OAuth access token.
pub struct FcmClient {
    client: Client,
    project_id: Option<String>,
    access_token: Option<String>,
}

impl FcmClient {
    pub fn new(project_id: Option<String>, access_token: Option<String>) -> anyhow::Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .build()?;
        Ok(Self {
            client,
            project_id: project_id.filter(|p| !p.trim().is_empty()),
            access_token: access_token.filter(|t| !t.trim().is_empty()),
        })
    }

    pub fn is_configured(&self) -> bool {
        self.project_id.is_some() && self.access_token.is_some()
    }
}

#[async_trait]
impl PushCapability for FcmClient {
    async fn send_to_token(&self, token: &str, payload: &PushPayload) -> Result<String, PushError> {
        let (Some(project), Some(access_token)) = (self.project_id.as_deref(), self.access_token.as_deref()) else {
            return Err(PushError::new(CODE_NOT_CONFIGURED, "push project or access token missing"));
        };

        let url = format!("{FCM_ENDPOINT}/projects/{project}/messages:send");
        let body = json!({
            "message": {
                "token": token,
                "notification": { "title": payload.title, "body": payload.body },
                "data": payload.data,
            }
        });

        let resp = self
            .client
            .post(&url)
            .bearer_auth(access_token)
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                let code = if e.is_timeout() { "timeout" } else { "network" };
                PushError::new(code, e.to_string())
            })?;

        let status = resp.status();
        let text = resp
            .text()
            .await
            .map_err(|e| PushError::new("network", e.to_string()))?;
        if !status.is_success() {
            return Err(fcm_error(status.as_u16(), &text));
        }

        let data: Value =
            serde_json::from_str(&text).map_err(|e| PushError::new("malformed-response", e.to_string()))?;
        match data["name"].as_str() {
            Some(name) => Ok(name.to_string()),
            None => Err(PushError::new("malformed-response", "response has no message name")),
        }
    }
}

/// Map an FCM v1 error body onto provider codes.
fn fcm_error(status: u16, body: &str) -> PushError {
    let data: Value = serde_json::from_str(body).unwrap_or(Value::Null);
    let err = &data["error"];
    let message = err["message"].as_str().unwrap_or("").to_string();

    let error_code = err["details"]
        .as_array()
        .into_iter()
        .flatten()
        .find_map(|d| d["errorCode"].as_str())
        .or_else(|| err["status"].as_str());

    let code = match error_code {
        Some("UNREGISTERED") => CODE_NOT_REGISTERED.to_string(),
        Some("INVALID_ARGUMENT") => CODE_INVALID_TOKEN.to_string(),
        Some(other) => other.to_ascii_lowercase().replace('_', "-"),
        None => format!("http-{status}"),
    };
    PushError::new(code, message)
}

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("no push token given and none stored for the user")]
    MissingTarget,

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Where to send: an explicit token wins over the user's stored one.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct PushTarget {
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub push_token: Option<String>,
}

#[derive(Clone)]
pub struct NotificationDispatcher {
    push: Arc<dyn PushCapability>,
    store: Arc<dyn EntryStore>,
}

impl NotificationDispatcher {
    pub fn new(push: Arc<dyn PushCapability>, store: Arc<dyn EntryStore>) -> Self {
        Self { push, store }
    }

    pub async fn resolve_token(&self, target: &PushTarget) -> Result<String, DispatchError> {
        if let Some(token) = non_blank(target.push_token.as_deref()) {
            return Ok(token.to_string());
        }
        let Some(user_id) = non_blank(target.user_id.as_deref()) else {
            return Err(DispatchError::MissingTarget);
        };
        debug!(user_id = %user_id, "resolving stored push token");
        self.store
            .push_token_for(user_id)
            .await?
            .ok_or(DispatchError::MissingTarget)
    }

    pub async fn send(&self, target: &PushTarget, payload: &PushPayload) -> Result<SendOutcome, DispatchError> {
        let token = self.resolve_token(target).await?;
        Ok(self.send_to_token(&token, payload).await)
    }

    pub async fn send_to_token(&self, token: &str, payload: &PushPayload) -> SendOutcome {
        let outcome = SendOutcome::classify(self.push.send_to_token(token, payload).await);
        match &outcome {
            SendOutcome::Delivered { message_id } => {
                info!(token = %token_prefix(token), message_id = %message_id, "push delivered");
            }
            SendOutcome::InvalidToken { code } => {
                warn!(token = %token_prefix(token), code = %code, "push token rejected");
            }
            SendOutcome::TransientFailure { reason } => {
                warn!(token = %token_prefix(token), reason = %reason, "push send failed");
            }
        }
        outcome
    }
}

fn non_blank(v: Option<&str>) -> Option<&str> {
    v.map(str::trim).filter(|s| !s.is_empty())
}
