//! Sync transport: ships operation batches and pull requests to the server.

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Deserialize;

use crate::error::{Error, Result};
use crate::protocol::{PullRequest, PullResponse, SyncRequest, SyncResponse};
use crate::util::{compact_text, is_http_url, normalize_text_option};

/// Carrier between the outbox and the server. No logic lives here.
#[async_trait]
pub trait SyncTransport: Send + Sync {
    /// Deliver one ordered batch of operations
    async fn push(&self, request: &SyncRequest) -> Result<SyncResponse>;

    /// Fetch rows changed since the given watermarks
    async fn pull(&self, request: &PullRequest) -> Result<PullResponse>;
}

/// JSON over HTTP with a bearer credential
#[derive(Clone)]
pub struct HttpSyncTransport {
    base_url: String,
    access_token: String,
    client: reqwest::Client,
}

impl std::fmt::Debug for HttpSyncTransport {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("HttpSyncTransport")
            .field("base_url", &self.base_url)
            .field("access_token", &"[REDACTED]")
            .finish_non_exhaustive()
    }
}

impl HttpSyncTransport {
    pub fn new(base_url: impl Into<String>, access_token: impl Into<String>) -> Result<Self> {
        let base_url = normalize_base_url(base_url.into())?;
        let access_token = normalize_text_option(Some(access_token.into()))
            .ok_or_else(|| Error::InvalidInput("access token must not be empty".to_string()))?;
        Ok(Self {
            base_url,
            access_token,
            client: reqwest::Client::builder().build()?,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    async fn post_json<B, R>(&self, path: &str, body: &B) -> Result<R>
    where
        B: serde::Serialize + Sync,
        R: serde::de::DeserializeOwned,
    {
        let response = self
            .client
            .post(format!("{}{path}", self.base_url))
            .bearer_auth(&self.access_token)
            .header("Accept", "application/json")
            .json(body)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            let message = parse_api_error(status, &body);
            if status == StatusCode::PAYLOAD_TOO_LARGE {
                return Err(Error::BatchTooLarge(message));
            }
            return Err(Error::Transport(message));
        }

        Ok(response.json::<R>().await?)
    }
}

#[async_trait]
impl SyncTransport for HttpSyncTransport {
    async fn push(&self, request: &SyncRequest) -> Result<SyncResponse> {
        self.post_json("/v1/sync", request).await
    }

    async fn pull(&self, request: &PullRequest) -> Result<PullResponse> {
        self.post_json("/v1/pull", request).await
    }
}

#[derive(Debug, Deserialize)]
struct ApiErrorBody {
    error: Option<String>,
    message: Option<String>,
}

pub(crate) fn parse_api_error(status: StatusCode, body: &str) -> String {
    if let Ok(payload) = serde_json::from_str::<ApiErrorBody>(body) {
        if let Some(message) = payload.message.or(payload.error) {
            return format!("{} ({})", message.trim(), status.as_u16());
        }
    }

    let trimmed = compact_text(body);
    if trimmed.is_empty() {
        format!("HTTP {}", status.as_u16())
    } else {
        format!("{} ({})", trimmed, status.as_u16())
    }
}

pub(crate) fn normalize_base_url(raw: String) -> Result<String> {
    let url = normalize_text_option(Some(raw))
        .ok_or_else(|| Error::InvalidInput("API URL must not be empty".to_string()))?;
    if is_http_url(&url) {
        Ok(url.trim_end_matches('/').to_string())
    } else {
        Err(Error::InvalidInput(
            "API URL must include http:// or https://".to_string(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_base_url_rejects_invalid_values() {
        assert!(normalize_base_url(String::new()).is_err());
        assert!(normalize_base_url("api.example.com".to_string()).is_err());
        assert_eq!(
            normalize_base_url(" https://api.example.com/ ".to_string()).unwrap(),
            "https://api.example.com"
        );
    }

    #[test]
    fn parse_api_error_prefers_json_message() {
        let message = parse_api_error(
            StatusCode::BAD_REQUEST,
            r#"{"error":"batch exceeds 200 operations"}"#,
        );
        assert_eq!(message, "batch exceeds 200 operations (400)");
        assert_eq!(parse_api_error(StatusCode::BAD_GATEWAY, "  "), "HTTP 502");
    }

    #[test]
    fn transport_debug_redacts_token() {
        let transport = HttpSyncTransport::new("http://localhost:8080", "secret").unwrap();
        let debug = format!("{transport:?}");
        assert!(!debug.contains("secret"));
        assert!(debug.contains("[REDACTED]"));
    }
}
