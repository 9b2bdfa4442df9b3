use std::fmt;
use std::time::Duration;

use reqwest::Method;
use serde::de::DeserializeOwned;
use serde_json::value::RawValue;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::api::types::{
    EntityKind, ListEntry, MapPlayersResponse, OnlineResponse, PostQuery, ServerResponse,
};
use crate::config::Config;

/// Maximum ids per detail lookup request.
pub const DETAIL_BATCH_SIZE: usize = 100;

/// How many characters of an error body to keep in error messages.
const BODY_SNIPPET_LEN: usize = 200;

/// Fetch errors, split by whether a retry can help.
///
/// Network failures and 5xx responses are transient; 4xx responses and
/// malformed payloads are not and fail immediately.
#[derive(Debug)]
pub enum ApiError {
    Network(reqwest::Error),
    ServerStatus { status: u16, body: String },
    ClientStatus { status: u16, body: String },
    Decode { url: String, source: serde_json::Error },
    Batch { start: usize, end: usize, source: Box<ApiError> },
    RetriesExhausted { attempts: u32, last: Box<ApiError> },
    Cancelled,
}

impl ApiError {
    fn is_retryable(&self) -> bool {
        matches!(self, ApiError::Network(_) | ApiError::ServerStatus { .. })
    }
}

impl fmt::Display for ApiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ApiError::Network(e) => write!(f, "network error: {}", e),
            ApiError::ServerStatus { status, body } => {
                write!(f, "server error {}: {}", status, body)
            }
            ApiError::ClientStatus { status, body } => {
                write!(f, "client error {}: {}", status, body)
            }
            ApiError::Decode { url, source } => {
                write!(f, "decode response from {}: {}", url, source)
            }
            ApiError::Batch { start, end, source } => {
                write!(f, "detail batch {}-{}: {}", start, end, source)
            }
            ApiError::RetriesExhausted { attempts, last } => {
                write!(f, "all {} attempts failed: {}", attempts, last)
            }
            ApiError::Cancelled => write!(f, "request cancelled by shutdown"),
        }
    }
}

impl std::error::Error for ApiError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ApiError::Network(e) => Some(e),
            ApiError::Decode { source, .. } => Some(source),
            ApiError::Batch { source, .. } => Some(source.as_ref()),
            ApiError::RetriesExhausted { last, .. } => Some(last.as_ref()),
            _ => None,
        }
    }
}

/// Retry budget for one logical call.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_backoff: Duration::from_secs(1),
        }
    }
}

impl RetryPolicy {
    /// Exponential backoff before the given retry (1-based): base * 2^(n-1).
    fn backoff_before(&self, retry: u32) -> Duration {
        self.base_backoff * 2u32.saturating_pow(retry.saturating_sub(1))
    }
}

/// HTTP client for the world-state API and the live-map feed.
pub struct ApiClient {
    http: reqwest::Client,
    base_url: String,
    map_url: String,
    retry: RetryPolicy,
}

impl ApiClient {
    pub fn from_config(config: &Config) -> anyhow::Result<Self> {
        Self::new(
            &config.api_base_url,
            &config.map_url,
            Duration::from_secs(config.request_timeout_secs),
        )
    }

    pub fn new(base_url: &str, map_url: &str, timeout: Duration) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .pool_max_idle_per_host(10)
            .pool_idle_timeout(Duration::from_secs(90))
            .build()?;

        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            map_url: map_url.to_string(),
            retry: RetryPolicy::default(),
        })
    }

    /// Override the retry budget. Tests use a millisecond backoff.
    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Server status document.
    pub async fn get_server(&self, cancel: &CancellationToken) -> Result<ServerResponse, ApiError> {
        let url = format!("{}/", self.base_url);
        self.request_json(cancel, Method::GET, &url, None).await
    }

    /// Currently online players.
    pub async fn get_online(&self, cancel: &CancellationToken) -> Result<OnlineResponse, ApiError> {
        let url = format!("{}/online", self.base_url);
        self.request_json(cancel, Method::GET, &url, None).await
    }

    /// Live-map player positions.
    pub async fn get_positions(
        &self,
        cancel: &CancellationToken,
    ) -> Result<MapPlayersResponse, ApiError> {
        self.request_json(cancel, Method::GET, &self.map_url, None)
            .await
    }

    /// Minimal id + name list for one entity kind.
    pub async fn get_entity_list(
        &self,
        cancel: &CancellationToken,
        kind: EntityKind,
    ) -> Result<Vec<ListEntry>, ApiError> {
        let url = format!("{}/{}", self.base_url, kind.path());
        self.request_json(cancel, Method::GET, &url, None).await
    }

    /// Full detail records for the given ids, fetched in fixed-size batches.
    ///
    /// Results are concatenated in request order. A failing batch fails the
    /// whole call with the originating id range attached.
    pub async fn get_entity_details(
        &self,
        cancel: &CancellationToken,
        kind: EntityKind,
        ids: &[String],
    ) -> Result<Vec<Box<RawValue>>, ApiError> {
        let url = format!("{}/{}", self.base_url, kind.path());
        let mut all = Vec::with_capacity(ids.len());

        for (i, chunk) in ids.chunks(DETAIL_BATCH_SIZE).enumerate() {
            let start = i * DETAIL_BATCH_SIZE;
            let end = start + chunk.len();
            let body = PostQuery { query: chunk };
            let results: Vec<Box<RawValue>> = self
                .request_json(cancel, Method::POST, &url, Some(&body))
                .await
                .map_err(|e| ApiError::Batch {
                    start,
                    end,
                    source: Box::new(e),
                })?;
            all.extend(results);
        }

        Ok(all)
    }

    /// Issue one request with up to `retry.max_attempts` attempts.
    ///
    /// The cancellation token is observed at every point the call can be
    /// waiting: before the first attempt, while a request is in flight
    /// (the request is aborted) and during a retry backoff. All three
    /// return `ApiError::Cancelled`.
    async fn request_json<T: DeserializeOwned>(
        &self,
        cancel: &CancellationToken,
        method: Method,
        url: &str,
        body: Option<&PostQuery<'_>>,
    ) -> Result<T, ApiError> {
        if cancel.is_cancelled() {
            return Err(ApiError::Cancelled);
        }
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            // Dropping the in-flight future aborts the request.
            let outcome = tokio::select! {
                res = self.send_once(method.clone(), url, body) => res,
                _ = cancel.cancelled() => return Err(ApiError::Cancelled),
            };
            match outcome {
                Ok(v) => return Ok(v),
                Err(err) if err.is_retryable() && attempt < self.retry.max_attempts => {
                    let backoff = self.retry.backoff_before(attempt);
                    debug!(
                        url,
                        attempt = attempt + 1,
                        backoff_ms = backoff.as_millis() as u64,
                        error = %err,
                        "retrying request"
                    );
                    tokio::select! {
                        _ = tokio::time::sleep(backoff) => {}
                        _ = cancel.cancelled() => return Err(ApiError::Cancelled),
                    }
                }
                Err(err) if err.is_retryable() => {
                    return Err(ApiError::RetriesExhausted {
                        attempts: attempt,
                        last: Box::new(err),
                    })
                }
                Err(err) => return Err(err),
            }
        }
    }

    async fn send_once<T: DeserializeOwned>(
        &self,
        method: Method,
        url: &str,
        body: Option<&PostQuery<'_>>,
    ) -> Result<T, ApiError> {
        let mut req = self.http.request(method, url);
        if let Some(body) = body {
            req = req.json(body);
        }

        let resp = req.send().await.map_err(ApiError::Network)?;
        let status = resp.status();
        let text = resp.text().await.map_err(ApiError::Network)?;

        if status.is_server_error() {
            return Err(ApiError::ServerStatus {
                status: status.as_u16(),
                body: snippet(&text),
            });
        }
        if status.is_client_error() {
            return Err(ApiError::ClientStatus {
                status: status.as_u16(),
                body: snippet(&text),
            });
        }

        serde_json::from_str(&text).map_err(|e| ApiError::Decode {
            url: url.to_string(),
            source: e,
        })
    }
}

fn snippet(body: &str) -> String {
    body.chars().take(BODY_SNIPPET_LEN).collect()
}
