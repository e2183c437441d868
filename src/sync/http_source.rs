//! HTTP-backed sync handler
//!
//! Fetches each source's configured endpoint and counts the items in the
//! JSON response. Concurrent upstream requests are capped by a semaphore
//! shared across all sources.

use crate::config::{HttpConfig, SourceConfig};
use crate::error::SyncError;
use crate::sync::scheduler::{SyncHandler, SyncOutput};
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tracing::{debug, warn};

/// Wait reported for a 429 without a usable `Retry-After` header
const DEFAULT_RETRY_AFTER_SECS: u64 = 60;

/// [`SyncHandler`] that GETs each source's `endpoint`
#[derive(Debug, Clone)]
pub struct HttpSourceHandler {
    client: Client,
    semaphore: Arc<Semaphore>,
    endpoints: HashMap<String, String>,
}

impl HttpSourceHandler {
    /// Build a handler for every source with an endpoint configured
    pub fn new(
        config: &HttpConfig,
        sources: &BTreeMap<String, SourceConfig>,
    ) -> Result<Self, SyncError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .user_agent(config.user_agent.clone())
            .build()
            .map_err(|e| SyncError::Network(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self::with_client(client, config.max_concurrent, sources))
    }

    /// Build a handler around an existing reqwest client
    pub fn with_client(
        client: Client,
        max_concurrent: usize,
        sources: &BTreeMap<String, SourceConfig>,
    ) -> Self {
        let endpoints = sources
            .iter()
            .filter_map(|(name, source)| {
                source
                    .endpoint
                    .as_ref()
                    .map(|endpoint| (name.clone(), endpoint.clone()))
            })
            .collect();

        Self {
            client,
            semaphore: Arc::new(Semaphore::new(max_concurrent)),
            endpoints,
        }
    }

    /// Endpoint configured for `source`, if any
    pub fn endpoint(&self, source: &str) -> Option<&str> {
        self.endpoints.get(source).map(String::as_str)
    }

    /// Get number of available permits (concurrent request slots)
    pub fn available_permits(&self) -> usize {
        self.semaphore.available_permits()
    }

    async fn fetch(&self, source: &str, url: &str) -> Result<Value, SyncError> {
        let _permit = self
            .semaphore
            .acquire()
            .await
            .map_err(|_| SyncError::Network("Request semaphore closed".to_string()))?;

        debug!(source = source, url = url, "Fetching source");

        let response = self.client.get(url).send().await.map_err(|e| {
            if e.is_timeout() {
                SyncError::NetworkTimeout
            } else if e.is_connect() {
                SyncError::ConnectionRefused
            } else {
                SyncError::Network(e.to_string())
            }
        })?;

        match response.status() {
            status if status.is_success() => response
                .json::<Value>()
                .await
                .map_err(|e| SyncError::InvalidData(e.to_string())),
            StatusCode::TOO_MANY_REQUESTS => {
                let wait = response
                    .headers()
                    .get("Retry-After")
                    .and_then(|v| v.to_str().ok())
                    .and_then(|v| v.trim().parse().ok())
                    .unwrap_or(DEFAULT_RETRY_AFTER_SECS);

                warn!(source = source, retry_after = wait, "Rate limited by upstream");
                Err(SyncError::RateLimited(wait))
            }
            StatusCode::NOT_FOUND => Err(SyncError::NotFound),
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                warn!(source = source, status = ?response.status(), "Unauthorized");
                Err(SyncError::Unauthorized)
            }
            status => {
                warn!(source = source, status = status.as_u16(), "Unexpected status");
                Err(SyncError::ServerError(status.as_u16()))
            }
        }
    }
}

#[async_trait]
impl SyncHandler for HttpSourceHandler {
    async fn sync(&self, source: &str) -> Result<SyncOutput, SyncError> {
        let url = self
            .endpoints
            .get(source)
            .ok_or_else(|| SyncError::MissingEndpoint(source.to_string()))?;

        let body = self.fetch(source, url).await?;
        let items_processed = count_items(&body)?;

        debug!(source = source, items = items_processed, "Source fetched");
        Ok(SyncOutput { items_processed })
    }
}

/// Number of records in a response body
///
/// Accepts a bare array or an object wrapping one in `items` or `data`.
fn count_items(body: &Value) -> Result<u64, SyncError> {
    let items = match body {
        Value::Array(items) => Some(items),
        Value::Object(fields) => ["items", "data"]
            .iter()
            .find_map(|key| fields.get(*key).and_then(Value::as_array)),
        _ => None,
    };

    items.map(|items| items.len() as u64).ok_or_else(|| {
        SyncError::InvalidData("Expected a JSON array or an object with items/data".to_string())
    })
}
