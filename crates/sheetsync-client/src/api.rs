//! Row-store API: CRUD over HTTP.
//!
//! The sync core only talks to [`RowStore`]; [`HttpRowStore`] is the
//! production implementation against the JSON API, and
//! [`MemoryRowStore`](crate::memory::MemoryRowStore) backs tests and offline
//! demos.
//!
//! Routes (all under `/api/v1`):
//!
//! ```text
//! Collection   list / create              update / delete
//! workspaces   GET|POST /workspaces/      PATCH|DELETE /workspaces/{id}
//! sheets       GET|POST /workspaces/{w}/sheets   PATCH|DELETE /sheets/{id}
//! rows         GET|POST /sheets/{s}/rows  PATCH|DELETE /rows/{id}
//! agent_rules  GET|POST /sheets/{s}/rules PATCH|DELETE /rules/{id}
//! ```

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use sheetsync_types::{Collection, EntityId, FieldDelta, QueryKey, Record};
use thiserror::Error;
use tracing::debug;

use crate::config::SyncConfig;
use crate::constants::API_PREFIX;

/// Errors from the row-store.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// Request never produced a response (offline, refused, timed out).
    #[error("network error: {0}")]
    Network(String),
    /// Server answered non-2xx; `reason` is its machine-readable detail.
    #[error("rejected ({status}): {reason}")]
    Rejected { status: u16, reason: String },
    /// Response body did not match the expected shape.
    #[error("failed to decode response: {0}")]
    Decode(String),
    /// The key has no scope but the collection requires one.
    #[error("{0} requires a scope")]
    MissingScope(Collection),
}

impl StoreError {
    pub fn rejected(status: u16, reason: impl Into<String>) -> Self {
        StoreError::Rejected {
            status,
            reason: reason.into(),
        }
    }

    /// Whether retrying the same request could succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            StoreError::Network(_) => true,
            StoreError::Rejected { status, .. } => *status >= 500 || *status == 429,
            StoreError::Decode(_) | StoreError::MissingScope(_) => false,
        }
    }

    /// Failure reason suitable for user-visible messages.
    pub fn reason(&self) -> &str {
        match self {
            StoreError::Rejected { reason, .. } => reason,
            StoreError::Network(msg) | StoreError::Decode(msg) => msg,
            StoreError::MissingScope(_) => "missing scope",
        }
    }
}

/// CRUD over server-owned collections.
///
/// `?Send`: implementations live on the sync core's `LocalSet`.
#[async_trait(?Send)]
pub trait RowStore {
    /// Fetch the full collection for a key, in server order.
    async fn list(&self, key: &QueryKey) -> Result<Vec<Record>, StoreError>;

    /// Create a record in the key's collection; returns the stored record.
    async fn create(&self, key: &QueryKey, fields: &FieldDelta) -> Result<Record, StoreError>;

    /// Partially update one record; returns the stored record.
    async fn update(
        &self,
        collection: Collection,
        id: &EntityId,
        delta: &FieldDelta,
    ) -> Result<Record, StoreError>;

    async fn delete(&self, collection: Collection, id: &EntityId) -> Result<(), StoreError>;
}

// ============================================================================
// HTTP implementation
// ============================================================================

/// Error body shape: `{"detail": "..."}`.
#[derive(Deserialize)]
struct ErrorBody {
    detail: serde_json::Value,
}

/// [`RowStore`] over the JSON HTTP API.
pub struct HttpRowStore {
    client: Client,
    base_url: String,
}

impl HttpRowStore {
    /// Creates a new store client from configuration.
    pub fn new(config: &SyncConfig) -> Result<Self, StoreError> {
        let client = Client::builder()
            .timeout(config.request_timeout())
            .build()
            .map_err(|e| StoreError::Network(format!("failed to create HTTP client: {e}")))?;

        Ok(Self {
            client,
            base_url: format!("{}{}", config.api_url.trim_end_matches('/'), API_PREFIX),
        })
    }

    fn collection_url(&self, key: &QueryKey) -> Result<String, StoreError> {
        let scope = || key.scope.as_ref().ok_or(StoreError::MissingScope(key.collection));
        Ok(match key.collection {
            Collection::Workspaces => format!("{}/workspaces/", self.base_url),
            Collection::Sheets => format!("{}/workspaces/{}/sheets", self.base_url, scope()?),
            Collection::Rows => format!("{}/sheets/{}/rows", self.base_url, scope()?),
            Collection::AgentRules => format!("{}/sheets/{}/rules", self.base_url, scope()?),
        })
    }

    fn record_url(&self, collection: Collection, id: &EntityId) -> String {
        let segment = match collection {
            Collection::Workspaces => "workspaces",
            Collection::Sheets => "sheets",
            Collection::Rows => "rows",
            Collection::AgentRules => "rules",
        };
        format!("{}/{}/{}", self.base_url, segment, id)
    }

    async fn send(&self, req: reqwest::RequestBuilder) -> Result<reqwest::Response, StoreError> {
        let response = req.send().await.map_err(|e| StoreError::Network(e.to_string()))?;
        if response.status().is_success() {
            return Ok(response);
        }

        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        Err(StoreError::rejected(status.as_u16(), failure_reason(status, &body)))
    }

    async fn json<T: serde::de::DeserializeOwned>(
        response: reqwest::Response,
    ) -> Result<T, StoreError> {
        response.json().await.map_err(|e| StoreError::Decode(e.to_string()))
    }
}

/// Pull the `detail` string out of an error body, falling back to the
/// status text.
fn failure_reason(status: StatusCode, body: &str) -> String {
    match serde_json::from_str::<ErrorBody>(body) {
        Ok(ErrorBody { detail: serde_json::Value::String(s) }) => s,
        Ok(ErrorBody { detail }) => detail.to_string(),
        Err(_) => status.canonical_reason().unwrap_or("request failed").to_string(),
    }
}

#[async_trait(?Send)]
impl RowStore for HttpRowStore {
    async fn list(&self, key: &QueryKey) -> Result<Vec<Record>, StoreError> {
        let url = self.collection_url(key)?;
        debug!(%key, %url, "GET collection");
        let response = self.send(self.client.get(&url)).await?;
        Self::json(response).await
    }

    async fn create(&self, key: &QueryKey, fields: &FieldDelta) -> Result<Record, StoreError> {
        let url = self.collection_url(key)?;
        debug!(%key, %url, "POST record");
        let response = self.send(self.client.post(&url).json(fields)).await?;
        Self::json(response).await
    }

    async fn update(
        &self,
        collection: Collection,
        id: &EntityId,
        delta: &FieldDelta,
    ) -> Result<Record, StoreError> {
        let url = self.record_url(collection, id);
        debug!(%collection, id = %id.short(), "PATCH record");
        let response = self.send(self.client.patch(&url).json(delta)).await?;
        Self::json(response).await
    }

    async fn delete(&self, collection: Collection, id: &EntityId) -> Result<(), StoreError> {
        let url = self.record_url(collection, id);
        debug!(%collection, id = %id.short(), "DELETE record");
        self.send(self.client.delete(&url)).await?;
        Ok(())
    }
}
