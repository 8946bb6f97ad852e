use async_trait::async_trait;
use chrono::Utc;
use percent_encoding::{AsciiSet, NON_ALPHANUMERIC, utf8_percent_encode};
use reqwest::{Method, StatusCode};
use url::Url;

use super::response::parse_list_response;
use super::signing::SigningKey;
use super::{ErrorResult, ListPage, MetadataStore, StoreError, StoreResult};
use crate::config::MetadataStoreConfig;

/// Characters left unescaped in path segments and query values (RFC 3986 unreserved).
const COMPONENT: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'.')
    .remove(b'_')
    .remove(b'~');

fn encode(component: &str) -> String {
    utf8_percent_encode(component, COMPONENT).to_string()
}

/// Signed HTTP client for the index service.
pub struct HttpMetadataStore {
    base_url: String,
    host: String,
    signer: SigningKey,
    http: reqwest::Client,
}

impl HttpMetadataStore {
    pub fn new(config: &MetadataStoreConfig) -> anyhow::Result<Self> {
        let url = Url::parse(&config.endpoint).map_err(|e| {
            anyhow::anyhow!("Invalid metadata store endpoint {}: {e}", config.endpoint)
        })?;
        let host = match (url.host_str(), url.port()) {
            (Some(host), Some(port)) => format!("{host}:{port}"),
            (Some(host), None) => host.to_string(),
            (None, _) => anyhow::bail!("Metadata store endpoint has no host: {}", config.endpoint),
        };

        let http = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| anyhow::anyhow!("Failed to build HTTP client: {e}"))?;

        Ok(Self {
            base_url: config.endpoint.trim_end_matches('/').to_string(),
            host,
            signer: SigningKey::new(
                config.access_key.clone(),
                config.secret_key.clone(),
                config.region.clone(),
                config.service.clone(),
            ),
            http,
        })
    }

    /// Issue a signed request, returning the status and body.
    async fn send(
        &self,
        index_id: &str,
        method: Method,
        path: &str,
        query: &str,
        body: Vec<u8>,
    ) -> StoreResult<(StatusCode, String)> {
        let signed = self
            .signer
            .sign(method.as_str(), &self.host, path, query, &body, Utc::now());

        let url = if query.is_empty() {
            format!("{}{path}", self.base_url)
        } else {
            format!("{}{path}?{query}", self.base_url)
        };

        let resp = self
            .http
            .request(method, &url)
            .header("Authorization", signed.authorization)
            .header("x-amz-content-sha256", signed.content_sha256)
            .header("x-amz-date", signed.amz_date)
            .body(body)
            .send()
            .await
            .map_err(|e| transport_error(index_id, e))?;

        let status = resp.status();
        let text = resp.text().await.map_err(|e| transport_error(index_id, e))?;
        Ok((status, text))
    }
}

fn transport_error(index_id: &str, error: reqwest::Error) -> StoreError {
    tracing::warn!(index_id = %index_id, error = %error, "Index service request failed");
    StoreError::unavailable(index_id, ErrorResult::new(0, "Transport Error", error.to_string()))
}

fn status_error(index_id: &str, status: StatusCode, body: &str) -> StoreError {
    StoreError::unavailable(
        index_id,
        ErrorResult::from_response(
            status.as_u16(),
            status.canonical_reason().unwrap_or("Unknown"),
            body,
        ),
    )
}

fn key_path(index_id: &str, key: &str) -> String {
    format!("/indexes/{}/{}", encode(index_id), encode(key))
}

#[async_trait]
impl MetadataStore for HttpMetadataStore {
    async fn get(&self, index_id: &str, key: &str) -> StoreResult<Option<String>> {
        let (status, body) = self
            .send(index_id, Method::GET, &key_path(index_id, key), "", Vec::new())
            .await?;
        match status {
            StatusCode::OK => Ok(Some(body)),
            StatusCode::NOT_FOUND => Ok(None),
            other => Err(status_error(index_id, other, &body)),
        }
    }

    async fn put(&self, index_id: &str, key: &str, value: &str) -> StoreResult<()> {
        let (status, body) = self
            .send(
                index_id,
                Method::PUT,
                &key_path(index_id, key),
                "",
                value.as_bytes().to_vec(),
            )
            .await?;
        if status == StatusCode::OK {
            tracing::debug!(index_id = %index_id, key = %key, "Stored index entry");
            Ok(())
        } else {
            Err(status_error(index_id, status, &body))
        }
    }

    async fn delete(&self, index_id: &str, key: &str) -> StoreResult<bool> {
        let (status, body) = self
            .send(index_id, Method::DELETE, &key_path(index_id, key), "", Vec::new())
            .await?;
        match status {
            StatusCode::OK | StatusCode::NO_CONTENT => Ok(true),
            StatusCode::NOT_FOUND => Ok(false),
            other => Err(status_error(index_id, other, &body)),
        }
    }

    async fn list(
        &self,
        index_id: &str,
        marker: Option<&str>,
        max_keys: usize,
    ) -> StoreResult<ListPage> {
        let path = format!("/indexes/{}", encode(index_id));
        let mut query = format!("keys={max_keys}");
        if let Some(marker) = marker {
            query.push_str("&marker=");
            query.push_str(&encode(marker));
        }

        let (status, body) = self
            .send(index_id, Method::GET, &path, &query, Vec::new())
            .await?;
        if status != StatusCode::OK {
            return Err(status_error(index_id, status, &body));
        }
        parse_list_response(index_id, &body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_path_escapes_separators() {
        assert_eq!(
            key_path("AAAAAAAAAHg=-AQAQAAAAAAA=", "acct1/bucket A"),
            "/indexes/AAAAAAAAAHg%3D-AQAQAAAAAAA%3D/acct1%2Fbucket%20A"
        );
    }

    #[test]
    fn test_new_extracts_host_and_port() {
        let config = MetadataStoreConfig {
            endpoint: "http://127.0.0.1:28049/".to_string(),
            ..Default::default()
        };
        let store = HttpMetadataStore::new(&config).unwrap();
        assert_eq!(store.host, "127.0.0.1:28049");
        assert_eq!(store.base_url, "http://127.0.0.1:28049");
    }

    #[test]
    fn test_new_rejects_invalid_endpoint() {
        let config = MetadataStoreConfig {
            endpoint: "not a url".to_string(),
            ..Default::default()
        };
        assert!(HttpMetadataStore::new(&config).is_err());
    }

    #[tokio::test]
    async fn test_unreachable_service_is_index_unavailable() {
        let config = MetadataStoreConfig {
            // port 9 (discard) is not expected to serve HTTP
            endpoint: "http://127.0.0.1:9".to_string(),
            timeout: std::time::Duration::from_millis(500),
            ..Default::default()
        };
        let store = HttpMetadataStore::new(&config).unwrap();

        let err = store.list("idx", None, 10).await.unwrap_err();
        assert!(matches!(err, StoreError::IndexUnavailable { .. }));
    }
}
