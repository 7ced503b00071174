//! Remote fetch collaborator.
//!
//! A sync endpoint answers `GET <path>[?<cursor_param>=<token>]` with a JSON
//! array of entities; an empty array means nothing new.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use tracing::{debug, info};

use crate::errors::TransportError;
use crate::models::CursorToken;

/// A per-entity sync endpoint: where to fetch and which query parameter
/// carries the cursor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub path: String,
    pub cursor_param: String,
}

impl Endpoint {
    pub fn new(path: impl Into<String>, cursor_param: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            cursor_param: cursor_param.into(),
        }
    }
}

/// Source of entity batches for the sync coordinator.
#[async_trait]
pub trait RemoteSource: Send + Sync {
    /// Fetch everything newer than `cursor` (or everything, for `None`) as a
    /// JSON array.
    async fn fetch(
        &self,
        endpoint: &Endpoint,
        cursor: Option<&CursorToken>,
    ) -> Result<serde_json::Value, TransportError>;
}

/// [`RemoteSource`] over HTTP.
pub struct HttpRemote {
    client: Client,
    base_url: String,
    token: Option<String>,
}

impl HttpRemote {
    pub fn new(
        base_url: &str,
        token: Option<String>,
        timeout: Duration,
    ) -> Result<Self, TransportError> {
        reqwest::Url::parse(base_url).map_err(|e| TransportError::InvalidUrl {
            url: base_url.to_string(),
            detail: e.to_string(),
        })?;

        let client = Client::builder()
            .user_agent(concat!("meldestelle-sync/", env!("CARGO_PKG_VERSION")))
            .timeout(timeout)
            .build()?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            token,
        })
    }

    fn url_for(&self, endpoint: &Endpoint) -> Result<reqwest::Url, TransportError> {
        let raw = format!("{}/{}", self.base_url, endpoint.path.trim_start_matches('/'));
        reqwest::Url::parse(&raw).map_err(|e| TransportError::InvalidUrl {
            url: raw.clone(),
            detail: e.to_string(),
        })
    }
}

#[async_trait]
impl RemoteSource for HttpRemote {
    async fn fetch(
        &self,
        endpoint: &Endpoint,
        cursor: Option<&CursorToken>,
    ) -> Result<serde_json::Value, TransportError> {
        let url = self.url_for(endpoint)?;
        debug!(url = %url, cursor = ?cursor.map(CursorToken::as_str), "fetching remote batch");

        let mut request = self.client.get(url.clone());
        if let Some(cursor) = cursor {
            request = request.query(&[(endpoint.cursor_param.as_str(), cursor.as_str())]);
        }
        if let Some(ref token) = self.token {
            request = request.bearer_auth(token);
        }

        let resp = request.send().await?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(TransportError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let body: serde_json::Value = resp
            .json()
            .await
            .map_err(|e| TransportError::Decode(e.to_string()))?;
        let Some(items) = body.as_array() else {
            return Err(TransportError::Decode(format!(
                "expected a JSON array from {}, got {}",
                url,
                json_kind(&body)
            )));
        };

        info!(path = %endpoint.path, fetched = items.len(), "remote batch received");
        Ok(body)
    }
}

fn json_kind(value: &serde_json::Value) -> &'static str {
    match value {
        serde_json::Value::Null => "null",
        serde_json::Value::Bool(_) => "a boolean",
        serde_json::Value::Number(_) => "a number",
        serde_json::Value::String(_) => "a string",
        serde_json::Value::Array(_) => "an array",
        serde_json::Value::Object(_) => "an object",
    }
}
