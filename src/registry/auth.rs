//! External stream validation
//!
//! Before a publish is accepted the stream key is checked with the broadcast
//! service; when the stream ends it is told the key is no longer live.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::AuthError;

/// What the validator hands back for an approved stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamGrant {
    pub stream_id: i64,
    /// Destination path, relative to the segment base path
    pub url: String,
}

/// Approves or denies stream keys
#[async_trait]
pub trait Authorizer: Send + Sync {
    /// Mark the stream active. Succeeds only for an approved, active stream
    /// with a destination.
    async fn activate(&self, stream_key: &str) -> Result<StreamGrant, AuthError>;

    /// Mark the stream inactive
    async fn deactivate(&self, stream_key: &str) -> Result<(), AuthError>;
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct StreamRequest<'a> {
    stream_key: &'a str,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct StreamResponse {
    success: bool,
    result: Option<StreamResult>,
    error: Option<StreamFailure>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct StreamResult {
    stream_id: i64,
    active: bool,
    url: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct StreamFailure {
    message: String,
}

impl StreamResponse {
    fn failure_message(&self) -> String {
        self.error
            .as_ref()
            .map(|e| e.message.clone())
            .filter(|m| !m.is_empty())
            .unwrap_or_else(|| "unspecified".to_string())
    }

    fn into_grant(self) -> Result<StreamGrant, AuthError> {
        if !self.success {
            return Err(AuthError::Denied(self.failure_message()));
        }
        match self.result {
            Some(result) if result.active && !result.url.is_empty() => Ok(StreamGrant {
                stream_id: result.stream_id,
                url: result.url,
            }),
            _ => Err(AuthError::InactiveStream),
        }
    }
}

/// [`Authorizer`] backed by the broadcast service's HTTP API
pub struct HttpAuthorizer {
    client: reqwest::Client,
    base_url: String,
}

impl HttpAuthorizer {
    /// `address` is `host:port`, optionally with a scheme
    pub fn new(address: &str, timeout: Duration) -> Result<Self, AuthError> {
        let client = reqwest::Client::builder()
            .connect_timeout(timeout)
            .timeout(timeout)
            .build()?;
        let address = address.trim_end_matches('/');
        let base_url = if address.starts_with("http://") || address.starts_with("https://") {
            format!("{}/api/broadcast/v1/streams", address)
        } else {
            format!("http://{}/api/broadcast/v1/streams", address)
        };
        Ok(Self { client, base_url })
    }

    async fn put(&self, action: &str, stream_key: &str) -> Result<StreamResponse, AuthError> {
        let body = self
            .client
            .put(format!("{}/{}", self.base_url, action))
            .json(&StreamRequest { stream_key })
            .send()
            .await?
            .text()
            .await?;
        Ok(serde_json::from_str(&body)?)
    }
}

#[async_trait]
impl Authorizer for HttpAuthorizer {
    async fn activate(&self, stream_key: &str) -> Result<StreamGrant, AuthError> {
        let grant = self.put("active", stream_key).await?.into_grant()?;
        tracing::debug!(
            stream_key,
            stream_id = grant.stream_id,
            url = %grant.url,
            "Stream activated"
        );
        Ok(grant)
    }

    async fn deactivate(&self, stream_key: &str) -> Result<(), AuthError> {
        let response = self.put("deactive", stream_key).await?;
        if !response.success {
            return Err(AuthError::Denied(response.failure_message()));
        }
        tracing::debug!(stream_key, "Stream deactivated");
        Ok(())
    }
}
