// Upstream HTTP transport.
//
// The relay talks to upstreams through the UpstreamClient trait so that the
// engine and route handlers never touch a concrete HTTP client. One reqwest
// client (one connection pool) serves the whole process.

use std::pin::Pin;
use std::time::Duration;

use async_trait::async_trait;
use axum::http::{HeaderMap, StatusCode};
use bytes::Bytes;
use futures_util::{Stream, TryStreamExt};

use crate::config::RelayConfig;

#[derive(Debug, thiserror::Error)]
pub enum UpstreamError {
    #[error("upstream connect failed: {0}")]
    Connect(String),

    #[error("upstream request failed: {0}")]
    Transport(String),

    #[error("upstream request timed out: {0}")]
    Timeout(String),
}

/// Outbound request to an upstream API. All relay endpoints are POST.
#[derive(Debug, Clone)]
pub struct UpstreamRequest {
    pub url: String,
    pub headers: HeaderMap,
    pub body: Bytes,
    /// Whether the response body should be surfaced incrementally.
    pub stream: bool,
}

pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes, UpstreamError>> + Send>>;

pub enum UpstreamBody {
    Full(Bytes),
    Stream(ByteStream),
}

impl std::fmt::Debug for UpstreamBody {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            UpstreamBody::Full(bytes) => f.debug_tuple("Full").field(bytes).finish(),
            UpstreamBody::Stream(_) => f.debug_tuple("Stream").field(&"..").finish(),
        }
    }
}

impl UpstreamBody {
    pub fn into_stream(self) -> ByteStream {
        match self {
            UpstreamBody::Full(bytes) => {
                Box::pin(futures_util::stream::once(async move { Ok(bytes) }))
            }
            UpstreamBody::Stream(stream) => stream,
        }
    }
}

#[derive(Debug)]
pub struct UpstreamResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: UpstreamBody,
}

#[async_trait]
pub trait UpstreamClient: Send + Sync {
    async fn send(&self, request: UpstreamRequest) -> Result<UpstreamResponse, UpstreamError>;
}

// ---------------------------------------------------------------------------
// Reqwest implementation
// ---------------------------------------------------------------------------

pub struct ReqwestUpstreamClient {
    client: reqwest::Client,
    request_timeout: Duration,
}

impl ReqwestUpstreamClient {
    /// Build the process-wide upstream client. Connect timeout comes from
    /// config; the total request timeout is applied per call, and only to
    /// buffered requests (streaming reads are bounded by the engine's idle
    /// timeout instead).
    pub fn new(cfg: &RelayConfig) -> Self {
        let client = reqwest::Client::builder()
            .connect_timeout(cfg.connect_timeout)
            .redirect(reqwest::redirect::Policy::none())
            .pool_max_idle_per_host(20)
            .build()
            .expect("failed to build upstream HTTP client");
        Self {
            client,
            request_timeout: cfg.request_timeout,
        }
    }
}

#[async_trait]
impl UpstreamClient for ReqwestUpstreamClient {
    async fn send(&self, request: UpstreamRequest) -> Result<UpstreamResponse, UpstreamError> {
        let mut req = self
            .client
            .post(&request.url)
            .headers(request.headers)
            .body(request.body);
        if !request.stream && !self.request_timeout.is_zero() {
            req = req.timeout(self.request_timeout);
        }

        let resp = req.send().await.map_err(|e| {
            if e.is_timeout() {
                UpstreamError::Timeout(e.to_string())
            } else if e.is_connect() {
                UpstreamError::Connect(e.to_string())
            } else {
                UpstreamError::Transport(e.to_string())
            }
        })?;

        let status = resp.status();
        let headers = resp.headers().clone();

        if request.stream {
            let stream = resp
                .bytes_stream()
                .map_err(|e| UpstreamError::Transport(e.to_string()));
            Ok(UpstreamResponse {
                status,
                headers,
                body: UpstreamBody::Stream(Box::pin(stream)),
            })
        } else {
            let body = resp
                .bytes()
                .await
                .map_err(|e| UpstreamError::Transport(e.to_string()))?;
            Ok(UpstreamResponse {
                status,
                headers,
                body: UpstreamBody::Full(body),
            })
        }
    }
}

// ---------------------------------------------------------------------------
// URL helpers
// ---------------------------------------------------------------------------

/// `{base_url}{path}` with the inbound query string copied over.
pub fn build_upstream_url(base_url: &str, path: &str, query: Option<&str>) -> String {
    let base = base_url.trim_end_matches('/');
    let mut url = format!("{base}{path}");
    if let Some(q) = query.filter(|q| !q.is_empty()) {
        url.push('?');
        url.push_str(q);
    }
    url
}

/// Host (with port, if any) of a URL.
pub fn extract_host(url: &str) -> &str {
    let rest = url.split("://").nth(1).unwrap_or(url);
    rest.split('/').next().unwrap_or(rest)
}
