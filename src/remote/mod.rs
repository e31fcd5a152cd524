//! Remote control channel to gateway nodes
//!
//! Each gateway node exposes a REST control surface for the credential
//! lifecycle. [`NodeControl`] abstracts one node; [`NodeConnector`] produces a
//! handle for a registry entry so the orchestrator never builds HTTP clients
//! itself.
//!
//! Calls are bounded by a timeout and retried with exponential backoff on
//! transport failures, 5xx and 429. Other 4xx statuses fail immediately.
//! Deleting an already-absent credential is a success.

pub mod client;
pub mod error;

#[cfg(test)]
pub(crate) mod fake;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

use crate::models::{Node, NodeId, UserId};
use crate::utils::retry::RetryConfig;

pub use client::HttpNodeClient;
pub use error::RemoteError;

// ============================================================================
// Wire types
// ============================================================================

/// Request body for creating a credential on a node
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CreateCredential {
    pub client_uuid: String,
    pub label: String,
    pub owner_id: UserId,
    pub quota_bytes: u64,
    pub expires_at_ms: i64,
}

/// One entry of a node's credential listing
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RemoteCredentialRecord {
    pub id: String,

    #[serde(default)]
    pub label: String,

    #[serde(default)]
    pub owner_id: Option<UserId>,

    #[serde(default)]
    pub created_at_ms: Option<i64>,

    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

impl RemoteCredentialRecord {
    pub fn created_at(&self) -> Option<DateTime<Utc>> {
        self.created_at_ms.and_then(DateTime::from_timestamp_millis)
    }
}

/// Node status as reported by its control endpoint
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct NodeStatus {
    #[serde(default)]
    pub version: Option<String>,

    #[serde(default)]
    pub uptime_secs: Option<u64>,

    #[serde(default)]
    pub clients: Option<u32>,
}

// ============================================================================
// Traits
// ============================================================================

/// Control operations against a single gateway node
#[async_trait]
pub trait NodeControl: Send + Sync {
    fn node_id(&self) -> NodeId;

    /// Create a credential, returning the id assigned by the node
    async fn create_credential(&self, request: &CreateCredential) -> Result<String, RemoteError>;

    /// Delete a credential. `Ok(false)` means it was already absent.
    async fn delete_credential(&self, remote_id: &str) -> Result<bool, RemoteError>;

    async fn list_credentials(&self) -> Result<Vec<RemoteCredentialRecord>, RemoteError>;

    async fn health_status(&self) -> Result<NodeStatus, RemoteError>;
}

/// Produces control handles for registry nodes
pub trait NodeConnector: Send + Sync {
    fn connect(&self, node: &Node) -> Result<Arc<dyn NodeControl>, RemoteError>;
}

// ============================================================================
// Client configuration
// ============================================================================

/// Configuration shared by all node clients
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Per-request timeout
    pub timeout: Duration,

    /// Backoff schedule
    pub retry: RetryConfig,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(10),
            retry: RetryConfig::from_attempts(3, 500, 5_000),
        }
    }
}

impl ClientConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set timeout
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Set total attempts, first try included
    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.retry.max_retries = attempts.saturating_sub(1);
        self
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }
}

impl From<&crate::config::RemoteConfig> for ClientConfig {
    fn from(config: &crate::config::RemoteConfig) -> Self {
        Self {
            timeout: Duration::from_secs(config.timeout_secs),
            retry: RetryConfig::from_attempts(
                config.max_attempts,
                config.base_delay_ms,
                config.max_delay_ms,
            ),
        }
    }
}

/// Connector building [`HttpNodeClient`]s over one shared connection pool
pub struct HttpConnector {
    http: reqwest::Client,
    config: ClientConfig,
}

impl HttpConnector {
    pub fn new(config: ClientConfig) -> Result<Self, RemoteError> {
        let http = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| RemoteError::Init(e.to_string()))?;

        Ok(Self { http, config })
    }
}

impl NodeConnector for HttpConnector {
    fn connect(&self, node: &Node) -> Result<Arc<dyn NodeControl>, RemoteError> {
        let client = HttpNodeClient::with_http(self.http.clone(), node, self.config.retry.clone())?;
        Ok(Arc::new(client))
    }
}
