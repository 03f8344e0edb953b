//! Remote Store Client (C4): authenticates, executes queries, uploads bulk
//! rows, downloads rows since a watermark. See spec §4.3.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::RwLock;
use tracing::{debug, warn};

use crate::change::SyncError;
use crate::value::Row;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QueryMetadata {
    pub count: Option<u64>,
    pub has_more: Option<bool>,
    pub cursor: Option<String>,
}

#[derive(Debug, Clone)]
pub struct QueryResult {
    pub rows: Vec<Row>,
    pub metadata: QueryMetadata,
}

#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// Validates and binds the token to the client; prior token is replaced
    /// atomically on success.
    async fn authenticate(&self, token: &str) -> Result<(), SyncError>;

    async fn execute_sql(&self, sql: &str) -> Result<QueryResult, SyncError>;

    /// At-least-once upsert against the table's primary key.
    async fn upload(&self, table: &str, rows: &[Row]) -> Result<(), SyncError>;

    /// Rows whose last-update timestamp exceeds `since_ts`, or all rows if
    /// absent.
    async fn download(&self, table: &str, since_ts: Option<i64>) -> Result<Vec<Row>, SyncError>;

    /// Applies the engine's compression settings (spec §4.7/§4.8 push step
    /// 4), called once from `SyncEngine::initialize`. Implementations with
    /// no transport-level compression may leave this a no-op.
    fn configure_compression(&self, _enabled: bool, _threshold_bytes: usize) {}
}

/// HTTP-backed `RemoteStore`, mapping transport outcomes to the error
/// taxonomy per spec §4.3: 401 -> `Auth{requires_refresh:false}`, transport
/// failure/timeout/5xx -> `Network{retryable:true}`, other 4xx ->
/// `Network{retryable:false}`, malformed body -> `Unknown`.
#[derive(Debug, Clone, Copy)]
pub struct CompressionConfig {
    pub enabled: bool,
    pub threshold_bytes: usize,
}

impl Default for CompressionConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            threshold_bytes: 1_024,
        }
    }
}

pub struct HttpRemoteStore {
    base_url: String,
    client: reqwest::Client,
    token: RwLock<Option<String>>,
    timeout: std::time::Duration,
    compression: RwLock<CompressionConfig>,
}

impl HttpRemoteStore {
    pub fn new(base_url: impl Into<String>, timeout: std::time::Duration) -> Self {
        Self {
            base_url: base_url.into(),
            client: reqwest::Client::new(),
            token: RwLock::new(None),
            timeout,
            compression: RwLock::new(CompressionConfig::default()),
        }
    }

    pub fn with_compression(self, compression: CompressionConfig) -> Self {
        *self.compression.write().unwrap() = compression;
        self
    }

    fn bearer(&self) -> Option<String> {
        self.token.read().unwrap().clone()
    }

    fn compression(&self) -> CompressionConfig {
        *self.compression.read().unwrap()
    }

    fn classify_status(status: reqwest::StatusCode) -> Option<SyncError> {
        if status == reqwest::StatusCode::UNAUTHORIZED {
            return Some(SyncError::Auth {
                requires_refresh: false,
                message: "remote store rejected credential".to_string(),
            });
        }
        if status.is_server_error() {
            return Some(SyncError::Network {
                retryable: true,
                status: Some(status.as_u16()),
                message: format!("server error {status}"),
            });
        }
        if status.is_client_error() {
            return Some(SyncError::Network {
                retryable: false,
                status: Some(status.as_u16()),
                message: format!("client error {status}"),
            });
        }
        None
    }
}

#[async_trait]
impl RemoteStore for HttpRemoteStore {
    async fn authenticate(&self, token: &str) -> Result<(), SyncError> {
        if token.trim().is_empty() {
            return Err(SyncError::Auth {
                requires_refresh: false,
                message: "empty credential".to_string(),
            });
        }
        let response = self
            .client
            .post(format!("{}/auth", self.base_url))
            .bearer_auth(token)
            .timeout(self.timeout)
            .send()
            .await
            .map_err(request_error)?;

        if let Some(err) = Self::classify_status(response.status()) {
            return Err(err);
        }

        *self.token.write().unwrap() = Some(token.to_string());
        debug!("remote store client authenticated");
        Ok(())
    }

    fn configure_compression(&self, enabled: bool, threshold_bytes: usize) {
        *self.compression.write().unwrap() = CompressionConfig {
            enabled,
            threshold_bytes,
        };
    }

    async fn execute_sql(&self, sql: &str) -> Result<QueryResult, SyncError> {
        let mut req = self
            .client
            .post(format!("{}/sql", self.base_url))
            .timeout(self.timeout)
            .json(&serde_json::json!({ "sql": sql }));
        if let Some(token) = self.bearer() {
            req = req.bearer_auth(token);
        }
        let response = req.send().await.map_err(request_error)?;
        if let Some(err) = Self::classify_status(response.status()) {
            return Err(err);
        }
        #[derive(Deserialize)]
        struct Wire {
            rows: Vec<Row>,
            #[serde(default)]
            count: Option<u64>,
            #[serde(default)]
            has_more: Option<bool>,
            #[serde(default)]
            cursor: Option<String>,
        }
        let wire: Wire = response.json().await.map_err(|e| SyncError::Unknown {
            cause: format!("malformed response body: {e}"),
        })?;
        Ok(QueryResult {
            rows: wire.rows,
            metadata: QueryMetadata {
                count: wire.count,
                has_more: wire.has_more,
                cursor: wire.cursor,
            },
        })
    }

    async fn upload(&self, table: &str, rows: &[Row]) -> Result<(), SyncError> {
        let body = serde_json::to_vec(&serde_json::json!({ "rows": rows }))
            .map_err(|e| SyncError::validation(format!("failed to encode upload payload: {e}")))?;

        let mut req = self
            .client
            .post(format!("{}/tables/{}/upsert", self.base_url, table))
            .timeout(self.timeout)
            .header("content-type", "application/json");

        let compression = self.compression();
        let (payload, compressed) = if compression.enabled {
            crate::batch::compress_if_above_threshold(&body, compression.threshold_bytes)
        } else {
            (body, false)
        };
        if compressed {
            req = req.header("content-encoding", "gzip");
            debug!(table, bytes = payload.len(), "uploading compressed batch");
        }
        req = req.body(payload);

        if let Some(token) = self.bearer() {
            req = req.bearer_auth(token);
        }
        let response = req.send().await.map_err(request_error)?;
        if let Some(err) = Self::classify_status(response.status()) {
            warn!(table, "upload failed");
            return Err(err);
        }
        Ok(())
    }

    async fn download(&self, table: &str, since_ts: Option<i64>) -> Result<Vec<Row>, SyncError> {
        let mut url = format!("{}/tables/{}", self.base_url, table);
        if let Some(ts) = since_ts {
            url = format!("{url}?since={ts}");
        }
        let mut req = self.client.get(url).timeout(self.timeout);
        if let Some(token) = self.bearer() {
            req = req.bearer_auth(token);
        }
        let response = req.send().await.map_err(request_error)?;
        if let Some(err) = Self::classify_status(response.status()) {
            return Err(err);
        }
        #[derive(Deserialize)]
        struct Wire {
            rows: Vec<Row>,
        }
        let wire: Wire = response.json().await.map_err(|e| SyncError::Unknown {
            cause: format!("malformed response body: {e}"),
        })?;
        Ok(wire.rows)
    }
}

/// Transport-level failure (no response at all): timeout, connect refused,
/// DNS failure. Always retryable, since no server state was observed.
fn request_error(e: reqwest::Error) -> SyncError {
    SyncError::Network {
        retryable: true,
        status: e.status().map(|s| s.as_u16()),
        message: e.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classify_status_maps_401_to_auth() {
        let err = HttpRemoteStore::classify_status(reqwest::StatusCode::UNAUTHORIZED).unwrap();
        assert!(matches!(err, SyncError::Auth { requires_refresh: false, .. }));
    }

    #[test]
    fn classify_status_maps_5xx_to_retryable_network() {
        let err =
            HttpRemoteStore::classify_status(reqwest::StatusCode::INTERNAL_SERVER_ERROR).unwrap();
        assert!(matches!(err, SyncError::Network { retryable: true, .. }));
    }

    #[test]
    fn classify_status_maps_other_4xx_to_non_retryable_network() {
        let err = HttpRemoteStore::classify_status(reqwest::StatusCode::BAD_REQUEST).unwrap();
        assert!(matches!(err, SyncError::Network { retryable: false, .. }));
    }

    #[test]
    fn classify_status_is_none_for_success() {
        assert!(HttpRemoteStore::classify_status(reqwest::StatusCode::OK).is_none());
    }
}
