//! HTTP client for one node's control endpoint

use async_trait::async_trait;
use reqwest::{Client, Response, StatusCode};
use serde::Deserialize;
use tracing::{debug, instrument};
use url::Url;

use super::{
    ClientConfig, CreateCredential, NodeControl, NodeStatus, RemoteCredentialRecord, RemoteError,
};
use crate::models::{Node, NodeAuth, NodeId};
use crate::utils::retry::{with_retry_if, RetryConfig};

/// Control client bound to a single gateway node
pub struct HttpNodeClient {
    node_id: NodeId,
    base_url: Url,
    auth: NodeAuth,
    http: Client,
    retry: RetryConfig,
}

#[derive(Debug, Deserialize)]
struct CreatedResponse {
    id: serde_json::Value,
}

impl HttpNodeClient {
    /// Create a client with its own connection pool
    pub fn new(node: &Node, config: &ClientConfig) -> Result<Self, RemoteError> {
        let http = Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| RemoteError::Init(e.to_string()))?;

        Self::with_http(http, node, config.retry.clone())
    }

    /// Create a client sharing an existing reqwest pool
    pub fn with_http(http: Client, node: &Node, retry: RetryConfig) -> Result<Self, RemoteError> {
        let mut endpoint = node.endpoint.trim().to_string();
        if !endpoint.ends_with('/') {
            endpoint.push('/');
        }
        let base_url = Url::parse(&endpoint)
            .map_err(|e| RemoteError::Init(format!("invalid endpoint '{}': {e}", node.endpoint)))?;

        Ok(Self {
            node_id: node.id,
            base_url,
            auth: node.auth.clone(),
            http,
            retry,
        })
    }

    fn url(&self, path: &str) -> Result<Url, RemoteError> {
        self.base_url
            .join(path)
            .map_err(|e| RemoteError::Init(e.to_string()))
    }

    /// URL of one credential, with the remote id escaped as a single segment
    fn credential_url(&self, remote_id: &str) -> Result<Url, RemoteError> {
        let mut url = self.url("api/credentials")?;
        url.path_segments_mut()
            .map_err(|()| RemoteError::Init(format!("endpoint cannot be a base: {}", self.base_url)))?
            .push(remote_id);
        Ok(url)
    }

    fn authorized(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        builder.basic_auth(&self.auth.username, Some(&self.auth.password))
    }

    async fn ensure_success(response: Response) -> Result<Response, RemoteError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        Err(RemoteError::Status {
            status: status.as_u16(),
            body: response.text().await.unwrap_or_default(),
        })
    }

    async fn send_create(&self, request: &CreateCredential) -> Result<String, RemoteError> {
        let url = self.url("api/credentials")?;
        let response = self
            .authorized(self.http.post(url))
            .json(request)
            .send()
            .await?;

        let created: CreatedResponse = Self::ensure_success(response).await?.json().await?;
        match created.id {
            serde_json::Value::String(id) if !id.is_empty() => Ok(id),
            serde_json::Value::Number(n) => Ok(n.to_string()),
            other => Err(RemoteError::InvalidResponse(format!(
                "unexpected credential id: {other}"
            ))),
        }
    }

    async fn send_delete(&self, remote_id: &str) -> Result<bool, RemoteError> {
        let url = self.credential_url(remote_id)?;
        let response = self.authorized(self.http.delete(url)).send().await?;

        if response.status() == StatusCode::NOT_FOUND {
            return Ok(false);
        }

        Self::ensure_success(response).await?;
        Ok(true)
    }

    async fn send_list(&self) -> Result<Vec<RemoteCredentialRecord>, RemoteError> {
        let url = self.url("api/credentials")?;
        let response = self.authorized(self.http.get(url)).send().await?;
        Ok(Self::ensure_success(response).await?.json().await?)
    }

    async fn send_status(&self) -> Result<NodeStatus, RemoteError> {
        let url = self.url("api/status")?;
        let response = self.authorized(self.http.get(url)).send().await?;
        Ok(Self::ensure_success(response).await?.json().await?)
    }
}

#[async_trait]
impl NodeControl for HttpNodeClient {
    fn node_id(&self) -> NodeId {
        self.node_id
    }

    #[instrument(skip(self, request), fields(node_id = %self.node_id, owner_id = request.owner_id))]
    async fn create_credential(&self, request: &CreateCredential) -> Result<String, RemoteError> {
        let id = with_retry_if(
            &self.retry,
            move || self.send_create(request),
            RemoteError::is_retryable,
        )
        .await?;

        debug!(remote_id = %id, "Credential created on node");
        Ok(id)
    }

    #[instrument(skip(self), fields(node_id = %self.node_id))]
    async fn delete_credential(&self, remote_id: &str) -> Result<bool, RemoteError> {
        let existed = with_retry_if(
            &self.retry,
            move || self.send_delete(remote_id),
            RemoteError::is_retryable,
        )
        .await?;

        debug!(remote_id, existed, "Credential deleted on node");
        Ok(existed)
    }

    #[instrument(skip(self), fields(node_id = %self.node_id))]
    async fn list_credentials(&self) -> Result<Vec<RemoteCredentialRecord>, RemoteError> {
        with_retry_if(&self.retry, move || self.send_list(), RemoteError::is_retryable).await
    }

    #[instrument(skip(self), fields(node_id = %self.node_id))]
    async fn health_status(&self) -> Result<NodeStatus, RemoteError> {
        with_retry_if(
            &self.retry,
            move || self.send_status(),
            RemoteError::is_retryable,
        )
        .await
    }
}
