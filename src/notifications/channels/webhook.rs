//! Webhook notification channel
//!
//! Sends alerts as JSON payloads via HTTP POST requests.

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::{Channel, ChannelError, ChannelResult, DeliveryStatus};
use crate::notifications::Alert;
use crate::utils::retry::{with_retry_if, RetryConfig};

/// Webhook channel configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookConfig {
    /// Webhook URL endpoint
    pub url: String,
    /// Optional authentication token (sent as Bearer token)
    pub auth_token: Option<String>,
    /// Request timeout in seconds
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,
    /// Maximum retry attempts on failure
    #[serde(default = "default_retries")]
    pub max_retries: u32,
}

fn default_timeout() -> u64 {
    10
}

fn default_retries() -> u32 {
    3
}

impl WebhookConfig {
    /// Create a new webhook configuration
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            auth_token: None,
            timeout_secs: default_timeout(),
            max_retries: default_retries(),
        }
    }

    /// Set authentication token
    pub fn with_auth_token(mut self, token: impl Into<String>) -> Self {
        self.auth_token = Some(token.into());
        self
    }

    /// Set request timeout
    pub fn with_timeout(mut self, timeout_secs: u64) -> Self {
        self.timeout_secs = timeout_secs;
        self
    }

    /// Set max retries
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), String> {
        if self.url.is_empty() {
            return Err("Webhook URL cannot be empty".to_string());
        }

        if !self.url.starts_with("http://") && !self.url.starts_with("https://") {
            return Err("Webhook URL must start with http:// or https://".to_string());
        }

        if self.timeout_secs == 0 {
            return Err("Timeout must be greater than 0".to_string());
        }

        Ok(())
    }
}

/// Webhook notification channel
///
/// # Payload Format
///
/// ```json
/// {
///   "id": "alert-uuid",
///   "target": {"type": "node", "id": 3},
///   "kind": "node_unreachable",
///   "severity": "critical",
///   "status": "firing",
///   "message": "health probe failed: request timed out",
///   "fired_at": "2024-01-01T12:00:00Z",
///   "resolved_at": null
/// }
/// ```
pub struct WebhookChannel {
    config: WebhookConfig,
    client: Client,
    retry: RetryConfig,
}

impl WebhookChannel {
    /// Create a new webhook channel
    pub fn new(config: WebhookConfig) -> ChannelResult<Self> {
        config.validate().map_err(ChannelError::InvalidConfig)?;

        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| ChannelError::Other(format!("Failed to create HTTP client: {e}")))?;

        let retry = RetryConfig::with_delays(config.max_retries, 1_000, 8_000);

        Ok(Self {
            config,
            client,
            retry,
        })
    }

    /// Create a simple webhook channel with just a URL
    pub fn from_url(url: impl Into<String>) -> ChannelResult<Self> {
        Self::new(WebhookConfig::new(url))
    }

    /// Override the backoff schedule
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Get the webhook URL
    pub fn url(&self) -> &str {
        &self.config.url
    }

    /// Build the webhook payload from an alert
    fn build_payload(&self, alert: &Alert) -> serde_json::Value {
        serde_json::json!({
            "id": alert.id,
            "target": alert.target,
            "kind": alert.kind,
            "severity": alert.severity.as_str(),
            "status": alert.status.as_str(),
            "message": alert.message,
            "fired_at": alert.fired_at.to_rfc3339(),
            "resolved_at": alert.resolved_at.map(|t| t.to_rfc3339()),
        })
    }

    async fn post_once(&self, payload: &serde_json::Value) -> ChannelResult<()> {
        let mut request = self.client.post(&self.config.url);

        if let Some(token) = &self.config.auth_token {
            request = request.bearer_auth(token);
        }

        let response = request.json(payload).send().await?;
        let status = response.status();

        if status.is_success() {
            tracing::debug!(url = %self.config.url, status = status.as_u16(), "Webhook delivered");
            return Ok(());
        }

        let body = response
            .text()
            .await
            .unwrap_or_else(|_| "Unable to read response body".to_string());

        Err(ChannelError::Status {
            status: status.as_u16(),
            body,
        })
    }
}

#[async_trait]
impl Channel for WebhookChannel {
    fn name(&self) -> &str {
        "webhook"
    }

    async fn send(&self, alert: &Alert) -> ChannelResult<DeliveryStatus> {
        let payload = self.build_payload(alert);

        let result = with_retry_if(
            &self.retry,
            || self.post_once(&payload),
            ChannelError::is_retryable,
        )
        .await;

        match result {
            Ok(()) => Ok(DeliveryStatus::success_with_message(
                "webhook",
                format!("Delivered to {}", self.config.url),
            )),
            Err(e) => {
                tracing::error!(url = %self.config.url, error = %e, "Failed to deliver webhook");
                Ok(DeliveryStatus::failure("webhook", e.to_string()))
            }
        }
    }

    fn config(&self) -> serde_json::Value {
        serde_json::json!({
            "name": self.name(),
            "url": self.config.url,
            "timeout_secs": self.config.timeout_secs,
            "max_retries": self.config.max_retries,
            "has_auth": self.config.auth_token.is_some(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::NodeId;
    use crate::notifications::{AlertKind, AlertSeverity, AlertTarget};
    use chrono::Utc;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn alert() -> Alert {
        Alert::new(
            AlertTarget::Node(NodeId(3)),
            AlertKind::NodeUnreachable,
            AlertSeverity::Critical,
            "probe failed",
            Utc::now(),
        )
    }

    fn fast_channel(url: String) -> WebhookChannel {
        WebhookChannel::new(WebhookConfig::new(url).with_auth_token("tok"))
            .unwrap()
            .with_retry(RetryConfig::with_delays(2, 1, 5))
    }

    #[test]
    fn test_webhook_config_validation() {
        assert!(WebhookConfig::new("https://example.com/webhook").validate().is_ok());
        assert!(WebhookConfig::new("").validate().is_err());
        assert!(WebhookConfig::new("example.com/webhook").validate().is_err());
        assert!(WebhookConfig::new("https://example.com")
            .with_timeout(0)
            .validate()
            .is_err());
    }

    #[test]
    fn test_webhook_from_url() {
        let channel = WebhookChannel::from_url("https://example.com/alerts").unwrap();
        assert_eq!(channel.name(), "webhook");
        assert_eq!(channel.url(), "https://example.com/alerts");

        assert!(WebhookChannel::from_url("not-a-url").is_err());
    }

    #[test]
    fn test_webhook_payload_building() {
        let channel = WebhookChannel::from_url("https://example.com/webhook").unwrap();
        let payload = channel.build_payload(&alert());

        assert_eq!(payload["severity"], "critical");
        assert_eq!(payload["status"], "firing");
        assert_eq!(payload["kind"], "node_unreachable");
        assert_eq!(payload["target"]["id"], 3);
        assert!(payload["resolved_at"].is_null());
    }

    #[tokio::test]
    async fn test_webhook_delivers_with_bearer_token() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/hook"))
            .and(header("authorization", "Bearer tok"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let channel = fast_channel(format!("{}/hook", server.uri()));
        let status = channel.send(&alert()).await.unwrap();
        assert!(status.success);
    }

    #[tokio::test]
    async fn test_webhook_does_not_retry_client_errors() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(400))
            .expect(1)
            .mount(&server)
            .await;

        let channel = fast_channel(server.uri());
        let status = channel.send(&alert()).await.unwrap();
        assert!(!status.success);
    }

    #[tokio::test]
    async fn test_webhook_retries_server_errors() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(503))
            .expect(3)
            .mount(&server)
            .await;

        let channel = fast_channel(server.uri());
        let status = channel.send(&alert()).await.unwrap();
        assert!(!status.success);
    }
}
