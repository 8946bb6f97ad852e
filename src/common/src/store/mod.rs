//! Client contract for the key-value index service.
//!
//! Every index is addressed by an opaque id and holds unique string keys with
//! string values. Listings are paginated with a continuation marker that is
//! only meaningful within one listing session.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::config::MetadataStoreConfig;

pub mod http;
pub mod memory;
pub mod response;
pub mod signing;

pub use http::HttpMetadataStore;
pub use memory::InMemoryMetadataStore;

/// A single key/value pair of an index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexEntry {
    #[serde(rename = "Key")]
    pub key: String,
    #[serde(rename = "Value")]
    pub value: String,
}

impl IndexEntry {
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }
}

/// One page of an index listing.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ListPage {
    pub entries: Vec<IndexEntry>,
    pub is_truncated: bool,
    pub next_marker: Option<String>,
}

/// Failure reported by the index service (or synthesised for transport failures).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorResult {
    pub status: u16,
    pub reason: String,
    pub message: String,
}

impl ErrorResult {
    pub fn new(status: u16, reason: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            status,
            reason: reason.into(),
            message: message.into(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        self.status == 404
    }
}

impl fmt::Display for ErrorResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.message.is_empty() {
            write!(f, "{} {}", self.status, self.reason)
        } else {
            write!(f, "{} {}: {}", self.status, self.reason, self.message)
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("index {index_id} unavailable: {error}")]
    IndexUnavailable { index_id: String, error: ErrorResult },

    #[error("malformed response from index {index_id}: {reason}")]
    MalformedResponse { index_id: String, reason: String },
}

impl StoreError {
    pub fn unavailable(index_id: &str, error: ErrorResult) -> Self {
        Self::IndexUnavailable {
            index_id: index_id.to_string(),
            error,
        }
    }

    pub fn malformed(index_id: &str, reason: impl Into<String>) -> Self {
        Self::MalformedResponse {
            index_id: index_id.to_string(),
            reason: reason.into(),
        }
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

#[async_trait]
pub trait MetadataStore: Send + Sync {
    /// Fetch the value stored under `key`, `None` when the key does not exist.
    async fn get(&self, index_id: &str, key: &str) -> StoreResult<Option<String>>;

    async fn put(&self, index_id: &str, key: &str, value: &str) -> StoreResult<()>;

    /// Remove `key`. Returns whether the key existed.
    async fn delete(&self, index_id: &str, key: &str) -> StoreResult<bool>;

    /// Fetch one page of at most `max_keys` entries following `marker`.
    async fn list(
        &self,
        index_id: &str,
        marker: Option<&str>,
        max_keys: usize,
    ) -> StoreResult<ListPage>;
}

/// List every entry of an index by following continuation markers.
///
/// Nothing is returned unless every page was fetched, so callers never act on
/// a half-listed index.
pub async fn list_all(
    store: &dyn MetadataStore,
    index_id: &str,
    max_keys: usize,
) -> StoreResult<Vec<IndexEntry>> {
    let mut entries = Vec::new();
    let mut marker: Option<String> = None;

    loop {
        let page = store.list(index_id, marker.as_deref(), max_keys).await?;
        entries.extend(page.entries);

        if !page.is_truncated {
            break;
        }

        match page.next_marker.filter(|m| !m.is_empty()) {
            Some(next) if marker.as_deref() != Some(next.as_str()) => marker = Some(next),
            Some(next) => {
                return Err(StoreError::malformed(
                    index_id,
                    format!("listing did not advance past marker {next}"),
                ));
            }
            None => {
                return Err(StoreError::malformed(
                    index_id,
                    "truncated listing without NextMarker",
                ));
            }
        }
    }

    tracing::debug!(index_id = %index_id, entries = entries.len(), "Listed index");
    Ok(entries)
}

/// Build the metadata store client selected by the endpoint scheme.
pub fn create_metadata_store(
    config: &MetadataStoreConfig,
) -> anyhow::Result<Arc<dyn MetadataStore>> {
    if config.endpoint.starts_with("memory://") {
        return Ok(Arc::new(InMemoryMetadataStore::new()));
    }

    if config.endpoint.starts_with("http://") || config.endpoint.starts_with("https://") {
        return Ok(Arc::new(HttpMetadataStore::new(config)?));
    }

    anyhow::bail!(
        "Unsupported metadata store endpoint: {}. Supported: memory://, http://, https://",
        config.endpoint
    )
}
