//! The remote authority seam and its HTTP transport.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::ACCEPT;
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;
use tracing::debug;

use super::protocol::{PullRequest, PullResponse, PushRequest, PushResponse};
use crate::models::Role;

/// Transport-level failures.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum RemoteError {
    #[error("Network error: {0}")]
    Network(String),

    #[error("Remote returned HTTP {status}: {body}")]
    Status { status: u16, body: String },

    #[error("Forbidden")]
    Forbidden,

    #[error("Invalid response: {0}")]
    Decode(String),

    #[error("Request timed out after {0:?}")]
    Timeout(Duration),
}

/// The authenticated identity a session is bound to.
#[derive(Clone, PartialEq, Eq)]
pub struct Identity {
    pub role: Role,
    pub token: String,
}

impl Identity {
    pub fn new(role: Role, token: impl Into<String>) -> Self {
        Self {
            role,
            token: token.into(),
        }
    }
}

impl fmt::Debug for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Identity")
            .field("role", &self.role)
            .field("token", &"<redacted>")
            .finish()
    }
}

/// Source of truth for replication.
#[async_trait]
pub trait RemoteSource: Send + Sync {
    async fn pull(&self, request: &PullRequest) -> Result<PullResponse, RemoteError>;

    async fn push(&self, request: &PushRequest) -> Result<PushResponse, RemoteError>;
}

/// Builds a [`RemoteSource`] for an identity.
pub trait RemoteConnector: Send + Sync {
    fn connect(&self, identity: &Identity) -> Result<Arc<dyn RemoteSource>, RemoteError>;
}

/// HTTP client for the sync endpoints.
pub struct HttpRemote {
    client: reqwest::Client,
    base_url: String,
    role: Role,
    token: String,
    timeout: Duration,
}

impl HttpRemote {
    pub fn new(base_url: &str, identity: &Identity, timeout: Duration) -> Result<Self, RemoteError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| RemoteError::Network(e.to_string()))?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            role: identity.role,
            token: identity.token.clone(),
            timeout,
        })
    }

    fn endpoint(&self, operation: &str) -> String {
        format!("{}/api/sync/{}/{}", self.base_url, self.role.as_str(), operation)
    }

    fn classify(&self, e: reqwest::Error) -> RemoteError {
        if e.is_timeout() {
            RemoteError::Timeout(self.timeout)
        } else if e.is_decode() {
            RemoteError::Decode(e.to_string())
        } else {
            RemoteError::Network(e.to_string())
        }
    }

    async fn post<B, R>(&self, operation: &str, body: &B) -> Result<R, RemoteError>
    where
        B: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        let url = self.endpoint(operation);
        debug!(url = %url, "sync request");

        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.token)
            .header(ACCEPT, "application/json")
            .json(body)
            .send()
            .await
            .map_err(|e| self.classify(e))?;

        let status = response.status();
        if status == StatusCode::FORBIDDEN {
            return Err(RemoteError::Forbidden);
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_else(|_| "unknown".to_string());
            return Err(RemoteError::Status {
                status: status.as_u16(),
                body,
            });
        }

        response.json::<R>().await.map_err(|e| self.classify(e))
    }
}

#[async_trait]
impl RemoteSource for HttpRemote {
    async fn pull(&self, request: &PullRequest) -> Result<PullResponse, RemoteError> {
        self.post("pull", request).await
    }

    async fn push(&self, request: &PushRequest) -> Result<PushResponse, RemoteError> {
        self.post("push", request).await
    }
}

/// Connects identities to [`HttpRemote`] clients for one base URL.
#[derive(Debug, Clone)]
pub struct HttpConnector {
    base_url: String,
    timeout: Duration,
}

impl HttpConnector {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Self {
        Self {
            base_url: base_url.into(),
            timeout,
        }
    }
}

impl RemoteConnector for HttpConnector {
    fn connect(&self, identity: &Identity) -> Result<Arc<dyn RemoteSource>, RemoteError> {
        Ok(Arc::new(HttpRemote::new(&self.base_url, identity, self.timeout)?))
    }
}
