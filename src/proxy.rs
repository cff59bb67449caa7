// Copyright 2026 The LLM Relay Project
// SPDX-License-Identifier: Apache-2.0

// HTTP surface of the relay.
//
// Responsibilities:
// - Route detection for the protocol endpoints (manual, because Gemini's
//   `{model}:streamGenerateContent` suffix does not fit the router's
//   segment matcher)
// - Request-id assignment, body-size enforcement, JSON validation
// - Trigger evaluation and model-prefix stripping
// - Pass-through relaying (streaming and buffered) and engine hand-off
// - Liveness endpoints

use std::convert::Infallible;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;

use axum::body::Body;
use axum::extract::{ConnectInfo, Request, State};
use axum::http::{header, HeaderValue, Method, Response, StatusCode};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use futures_util::StreamExt;
use serde_json::{json, Value};
use tokio_stream::wrappers::ReceiverStream;
use uuid::Uuid;

use crate::config::RelayConfig;
use crate::engine::{AntiTruncationEngine, EngineContext, EngineStart};
use crate::headers;
use crate::inject;
use crate::parsers::Protocol;
use crate::trigger::{self, Activation};
use crate::upstream::{self, UpstreamBody, UpstreamClient, UpstreamError, UpstreamRequest, UpstreamResponse};

// ---------------------------------------------------------------------------
// Route detection
// ---------------------------------------------------------------------------

/// A relay endpoint resolved from the request path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Route {
    OpenAiChat,
    Gemini {
        version: &'static str,
        /// Raw path segment; percent-decoded by the handler.
        model: String,
        streaming: bool,
    },
    ClaudeMessages,
}

/// Map a request path to a relay endpoint. Returns `None` for unknown paths.
pub fn detect_route(path: &str) -> Option<Route> {
    if path == "/v1/chat/completions" {
        return Some(Route::OpenAiChat);
    }
    if path == "/v1/messages" {
        return Some(Route::ClaudeMessages);
    }
    for (prefix, version) in [("/v1/models/", "v1"), ("/v1beta/models/", "v1beta")] {
        if let Some(rest) = path.strip_prefix(prefix) {
            let (model, action) = rest.rsplit_once(':')?;
            let streaming = match action {
                "streamGenerateContent" => true,
                "generateContent" => false,
                _ => return None,
            };
            if model.is_empty() || model.contains('/') {
                return None;
            }
            return Some(Route::Gemini {
                version,
                model: model.to_string(),
                streaming,
            });
        }
    }
    None
}

// ---------------------------------------------------------------------------
// Error responses
// ---------------------------------------------------------------------------

/// Client-visible relay error, serialized as
/// `{"error":{"kind","message","request_id"}}`.
#[derive(Debug, thiserror::Error)]
#[error("{kind}: {message}")]
pub struct RelayError {
    pub status: StatusCode,
    pub kind: &'static str,
    pub message: String,
    pub request_id: String,
}

impl RelayError {
    fn new(status: StatusCode, kind: &'static str, message: String, request_id: &str) -> Self {
        Self {
            status,
            kind,
            message,
            request_id: request_id.to_string(),
        }
    }

    pub fn not_found(request_id: &str, path: &str) -> Self {
        Self::new(
            StatusCode::NOT_FOUND,
            "unknown_route",
            format!("no relay endpoint matches {path}"),
            request_id,
        )
    }

    pub fn method_not_allowed(request_id: &str, method: &Method) -> Self {
        Self::new(
            StatusCode::METHOD_NOT_ALLOWED,
            "method_not_allowed",
            format!("{method} is not supported on this endpoint"),
            request_id,
        )
    }

    pub fn payload_too_large(request_id: &str, limit: usize) -> Self {
        Self::new(
            StatusCode::PAYLOAD_TOO_LARGE,
            "payload_too_large",
            format!("request body exceeds the {limit} byte limit"),
            request_id,
        )
    }

    pub fn invalid_json(request_id: &str, err: &serde_json::Error) -> Self {
        Self::new(
            StatusCode::BAD_REQUEST,
            "invalid_json",
            format!("request body is not valid JSON: {err}"),
            request_id,
        )
    }

    pub fn bad_gateway(request_id: &str, err: &UpstreamError) -> Self {
        Self::new(
            StatusCode::BAD_GATEWAY,
            "upstream_unreachable",
            err.to_string(),
            request_id,
        )
    }
}

impl IntoResponse for RelayError {
    fn into_response(self) -> axum::response::Response {
        let body = json!({
            "error": {
                "kind": self.kind,
                "message": self.message,
                "request_id": self.request_id,
            }
        });
        let mut response = (self.status, Json(body)).into_response();
        if let Ok(value) = HeaderValue::from_str(&self.request_id) {
            response.headers_mut().insert("x-request-id", value);
        }
        response
    }
}

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

/// Shared state injected into handlers.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<RelayConfig>,
    pub upstream: Arc<dyn UpstreamClient>,
}

pub fn build_router(config: Arc<RelayConfig>, upstream: Arc<dyn UpstreamClient>) -> Router {
    Router::new()
        .route("/", get(root))
        .route("/health", get(health))
        .fallback(relay_handler)
        .with_state(AppState { config, upstream })
}

async fn root() -> Json<Value> {
    Json(json!({
        "status": "ok",
        "service": "llm-relay",
        "version": env!("CARGO_PKG_VERSION"),
        "features": ["openai", "gemini", "claude", "anti-truncation", "transparent-proxy"],
    }))
}

async fn health() -> Json<Value> {
    Json(json!({"status": "healthy"}))
}

// ---------------------------------------------------------------------------
// Relay handler
// ---------------------------------------------------------------------------

async fn relay_handler(
    State(state): State<AppState>,
    connect_info: Option<ConnectInfo<SocketAddr>>,
    request: Request,
) -> axum::response::Response {
    let cfg = &state.config;
    let (parts, body) = request.into_parts();

    let request_id = parts
        .headers
        .get("x-request-id")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    let Some(route) = detect_route(parts.uri.path()) else {
        return RelayError::not_found(&request_id, parts.uri.path()).into_response();
    };
    if parts.method != Method::POST {
        return RelayError::method_not_allowed(&request_id, &parts.method).into_response();
    }

    let peer_ip = connect_info
        .map(|ConnectInfo(addr)| addr.ip())
        .unwrap_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED));

    let body_bytes = match axum::body::to_bytes(body, cfg.max_body_bytes).await {
        Ok(bytes) => bytes,
        Err(_) => {
            return RelayError::payload_too_large(&request_id, cfg.max_body_bytes).into_response()
        }
    };
    let mut body_json: Value = match serde_json::from_slice(&body_bytes) {
        Ok(json) => json,
        Err(e) => return RelayError::invalid_json(&request_id, &e).into_response(),
    };

    // Per-route protocol parameters. The Gemini model lives in the path; for
    // the other protocols it is a body field.
    let (protocol, base_url, is_streaming) = match &route {
        Route::OpenAiChat => (
            Protocol::OpenAi,
            cfg.openai_base_url.as_str(),
            stream_field(&body_json),
        ),
        Route::Gemini { streaming, .. } => {
            (Protocol::Gemini, cfg.gemini_base_url.as_str(), *streaming)
        }
        Route::ClaudeMessages => (
            Protocol::Claude,
            cfg.claude_base_url.as_str(),
            stream_field(&body_json),
        ),
    };

    let original_model = match &route {
        Route::Gemini { model, .. } => Some(percent_decode(model)),
        _ => body_json
            .get("model")
            .and_then(|m| m.as_str())
            .map(str::to_string),
    };

    let query = parts.uri.query();
    let activation = trigger::evaluate(
        cfg,
        &parts.headers,
        query,
        original_model.as_deref(),
        is_streaming,
    );

    // Strip the trigger prefix before forwarding so the upstream sees the
    // real model name. The original value stays in `original_model`.
    if activation == Activation::Enabled {
        if let Some(Value::String(model)) = body_json.get_mut("model") {
            *model = trigger::strip_model_prefix(cfg, model).to_string();
        }
    }
    let path = match &route {
        Route::OpenAiChat => "/v1/chat/completions".to_string(),
        Route::ClaudeMessages => "/v1/messages".to_string(),
        Route::Gemini {
            version, streaming, ..
        } => {
            let mut model = original_model.clone().unwrap_or_default();
            if activation == Activation::Enabled {
                model = trigger::strip_model_prefix(cfg, &model).to_string();
            }
            let action = if *streaming {
                "streamGenerateContent"
            } else {
                "generateContent"
            };
            format!("/{version}/models/{model}:{action}")
        }
    };

    let client_ip = headers::resolve_client_ip(peer_ip, &parts.headers, cfg);
    let inbound_host = parts
        .headers
        .get(header::HOST)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_else(|| upstream::extract_host(base_url));
    // TLS termination is out of scope; the relay's own transport is http.
    let scheme = "http";
    let upstream_headers =
        headers::build_upstream_headers(&parts.headers, peer_ip, client_ip, scheme, inbound_host);
    let url = upstream::build_upstream_url(base_url, &path, query);

    tracing::info!(
        request_id = %request_id,
        path = %path,
        upstream = %base_url,
        anti_truncation = ?activation,
        client_ip = %client_ip,
        streaming = is_streaming,
        model = original_model.as_deref().unwrap_or(""),
        "relaying request"
    );

    if activation == Activation::Enabled {
        inject::inject_done_marker(
            protocol,
            &mut body_json,
            &inject::marker_instruction(&cfg.done_marker),
        );
        let engine = AntiTruncationEngine::new(cfg.clone(), state.upstream.clone());
        let ctx = EngineContext {
            protocol,
            request_id: request_id.clone(),
            url,
            headers: upstream_headers,
            body: body_json,
        };
        return match engine.start(ctx).await {
            Err(e) => {
                tracing::error!(request_id = %request_id, error = %e, "upstream request failed");
                RelayError::bad_gateway(&request_id, &e).into_response()
            }
            Ok(EngineStart::Passthrough(resp)) => relay_upstream_response(resp, &request_id),
            Ok(EngineStart::Stream(rx)) => {
                let stream = ReceiverStream::new(rx).map(Ok::<_, Infallible>);
                Response::builder()
                    .status(StatusCode::OK)
                    .header(header::CONTENT_TYPE, "text/event-stream")
                    .header(header::CACHE_CONTROL, "no-cache")
                    .header("x-request-id", request_id.as_str())
                    .header("x-anti-truncation", "enabled")
                    .body(Body::from_stream(stream))
                    .unwrap()
                    .into_response()
            }
        };
    }

    // Pass-through: the original body bytes are forwarded verbatim.
    let up_request = UpstreamRequest {
        url,
        headers: upstream_headers,
        body: body_bytes,
        stream: is_streaming,
    };
    match state.upstream.send(up_request).await {
        Err(e) => {
            tracing::error!(request_id = %request_id, error = %e, "upstream request failed");
            RelayError::bad_gateway(&request_id, &e).into_response()
        }
        Ok(resp) => {
            let mut response = relay_upstream_response(resp, &request_id);
            if activation == Activation::IgnoredNonStreaming {
                response.headers_mut().insert(
                    "x-anti-truncation-ignored",
                    HeaderValue::from_static("non-streaming"),
                );
            }
            response
        }
    }
}

/// Relay an upstream response downstream: status and headers minus
/// hop-by-hop, body streamed or buffered as received.
fn relay_upstream_response(resp: UpstreamResponse, request_id: &str) -> axum::response::Response {
    let mut headers = headers::filter_response_headers(&resp.headers);
    if let Ok(value) = HeaderValue::from_str(request_id) {
        headers.insert("x-request-id", value);
    }

    let body = match resp.body {
        UpstreamBody::Full(bytes) => Body::from(bytes),
        UpstreamBody::Stream(stream) => {
            // Length is unknowable for a relayed stream.
            headers.remove(header::CONTENT_LENGTH);
            Body::from_stream(stream)
        }
    };

    let mut builder = Response::builder().status(resp.status);
    if let Some(h) = builder.headers_mut() {
        *h = headers;
    }
    builder.body(body).unwrap().into_response()
}

fn stream_field(body: &Value) -> bool {
    body.get("stream").and_then(|s| s.as_bool()).unwrap_or(false)
}

/// Minimal percent-decoding for the Gemini model path segment. Invalid
/// escapes are kept literally.
fn percent_decode(input: &str) -> String {
    let bytes = input.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' && i + 2 < bytes.len() {
            let hex = std::str::from_utf8(&bytes[i + 1..i + 3]).ok();
            if let Some(value) = hex.and_then(|h| u8::from_str_radix(h, 16).ok()) {
                out.push(value);
                i += 3;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use axum::http::HeaderMap;
    use bytes::Bytes;
    use std::sync::Mutex;
    use tower::ServiceExt;

    // -----------------------------------------------------------------
    // Route detection
    // -----------------------------------------------------------------

    #[test]
    fn detects_openai_chat() {
        assert_eq!(detect_route("/v1/chat/completions"), Some(Route::OpenAiChat));
    }

    #[test]
    fn detects_claude_messages() {
        assert_eq!(detect_route("/v1/messages"), Some(Route::ClaudeMessages));
    }

    #[test]
    fn detects_gemini_stream_and_non_stream() {
        assert_eq!(
            detect_route("/v1/models/gemini-2.0-flash:generateContent"),
            Some(Route::Gemini {
                version: "v1",
                model: "gemini-2.0-flash".to_string(),
                streaming: false,
            })
        );
        assert_eq!(
            detect_route("/v1beta/models/gemini-2.0-flash:streamGenerateContent"),
            Some(Route::Gemini {
                version: "v1beta",
                model: "gemini-2.0-flash".to_string(),
                streaming: true,
            })
        );
    }

    #[test]
    fn unknown_paths_are_rejected() {
        assert_eq!(detect_route("/v1/unknown"), None);
        assert_eq!(detect_route("/v1/models/gemini"), None);
        assert_eq!(detect_route("/v1/models/gemini:countTokens"), None);
        assert_eq!(detect_route("/v1/models/:generateContent"), None);
        assert_eq!(detect_route("/v1/models/a/b:generateContent"), None);
        assert_eq!(detect_route("/"), None);
    }

    #[test]
    fn percent_decode_basic() {
        assert_eq!(percent_decode("hello%20world"), "hello world");
        assert_eq!(percent_decode("plain"), "plain");
        assert_eq!(percent_decode("bad%zz"), "bad%zz");
        assert_eq!(
            percent_decode("%E6%B5%81%E5%BC%8F%E6%8A%97%E6%88%AA%E6%96%AD%2Fm"),
            "流式抗截断/m"
        );
    }

    // -----------------------------------------------------------------
    // Mock upstream
    // -----------------------------------------------------------------

    struct MockUpstream {
        status: StatusCode,
        body: Bytes,
        requests: Mutex<Vec<UpstreamRequest>>,
    }

    impl MockUpstream {
        fn with_status(status: StatusCode, body: &str) -> Arc<Self> {
            Arc::new(Self {
                status,
                body: Bytes::copy_from_slice(body.as_bytes()),
                requests: Mutex::new(Vec::new()),
            })
        }

        fn ok(body: &str) -> Arc<Self> {
            Self::with_status(StatusCode::OK, body)
        }
    }

    #[async_trait]
    impl UpstreamClient for MockUpstream {
        async fn send(&self, request: UpstreamRequest) -> Result<UpstreamResponse, UpstreamError> {
            self.requests.lock().unwrap().push(request);
            let mut headers = HeaderMap::new();
            headers.insert("content-type", HeaderValue::from_static("application/json"));
            headers.insert("connection", HeaderValue::from_static("keep-alive"));
            Ok(UpstreamResponse {
                status: self.status,
                headers,
                body: UpstreamBody::Full(self.body.clone()),
            })
        }
    }

    fn app(upstream: Arc<MockUpstream>) -> Router {
        build_router(Arc::new(RelayConfig::default()), upstream)
    }

    fn post_json(path: &str, body: &str) -> Request {
        let mut request = axum::http::Request::builder()
            .method("POST")
            .uri(path)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap();
        request
            .extensions_mut()
            .insert(ConnectInfo(SocketAddr::from(([127, 0, 0, 1], 55000))));
        request
    }

    async fn body_json(resp: axum::response::Response) -> Value {
        let bytes = axum::body::to_bytes(resp.into_body(), 1024 * 1024)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    // -----------------------------------------------------------------
    // Liveness
    // -----------------------------------------------------------------

    #[tokio::test]
    async fn health_returns_200() {
        let app = app(MockUpstream::ok("{}"));
        let req = axum::http::Request::builder()
            .uri("/health")
            .body(Body::empty())
            .unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(body_json(resp).await["status"], "healthy");
    }

    #[tokio::test]
    async fn root_reports_service_info() {
        let app = app(MockUpstream::ok("{}"));
        let req = axum::http::Request::builder()
            .uri("/")
            .body(Body::empty())
            .unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(body_json(resp).await["service"], "llm-relay");
    }

    // -----------------------------------------------------------------
    // Request validation
    // -----------------------------------------------------------------

    #[tokio::test]
    async fn unknown_route_returns_404_with_json_error() {
        let app = app(MockUpstream::ok("{}"));
        let resp = app.oneshot(post_json("/v1/unknown", "{}")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
        assert!(resp.headers().get("x-request-id").is_some());
        let json = body_json(resp).await;
        assert_eq!(json["error"]["kind"], "unknown_route");
    }

    #[tokio::test]
    async fn get_on_relay_endpoint_returns_405() {
        let app = app(MockUpstream::ok("{}"));
        let mut req = axum::http::Request::builder()
            .method("GET")
            .uri("/v1/chat/completions")
            .body(Body::empty())
            .unwrap();
        req.extensions_mut()
            .insert(ConnectInfo(SocketAddr::from(([127, 0, 0, 1], 55000))));
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::METHOD_NOT_ALLOWED);
    }

    #[tokio::test]
    async fn malformed_json_returns_400() {
        let app = app(MockUpstream::ok("{}"));
        let resp = app
            .oneshot(post_json("/v1/chat/completions", "this is not json {{{"))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        let json = body_json(resp).await;
        assert_eq!(json["error"]["kind"], "invalid_json");
        assert!(json["error"]["request_id"].is_string());
    }

    #[tokio::test]
    async fn oversized_body_returns_413() {
        let upstream = MockUpstream::ok("{}");
        let config = RelayConfig {
            max_body_bytes: 64,
            ..RelayConfig::default()
        };
        let app = build_router(Arc::new(config), upstream);
        let big = format!("{{\"pad\":\"{}\"}}", "x".repeat(256));
        let resp = app
            .oneshot(post_json("/v1/chat/completions", &big))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::PAYLOAD_TOO_LARGE);
        let json = body_json(resp).await;
        assert_eq!(json["error"]["kind"], "payload_too_large");
    }

    // -----------------------------------------------------------------
    // Pass-through behavior
    // -----------------------------------------------------------------

    #[tokio::test]
    async fn non_streaming_pass_through_relays_body_and_request_id() {
        let upstream = MockUpstream::ok(r#"{"id":"resp-1","choices":[]}"#);
        let app = app(upstream.clone());
        let resp = app
            .oneshot(post_json(
                "/v1/chat/completions",
                r#"{"model":"gpt-4o","messages":[]}"#,
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert!(resp.headers().get("x-request-id").is_some());
        assert!(resp.headers().get("x-anti-truncation").is_none());
        // Hop-by-hop response headers are filtered.
        assert!(resp.headers().get("connection").is_none());
        let json = body_json(resp).await;
        assert_eq!(json["id"], "resp-1");

        // Body forwarded verbatim, model untouched.
        let requests = upstream.requests.lock().unwrap();
        assert_eq!(requests.len(), 1);
        assert_eq!(
            requests[0].body,
            Bytes::from_static(br#"{"model":"gpt-4o","messages":[]}"#)
        );
        assert!(!requests[0].stream);
    }

    #[tokio::test]
    async fn upstream_error_status_is_relayed_verbatim() {
        let upstream = MockUpstream::with_status(
            StatusCode::UNAUTHORIZED,
            r#"{"error":{"message":"bad key"}}"#,
        );
        let app = app(upstream);
        let resp = app
            .oneshot(post_json(
                "/v1/chat/completions",
                r#"{"model":"gpt-4o","messages":[]}"#,
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
        let json = body_json(resp).await;
        assert_eq!(json["error"]["message"], "bad key");
    }

    #[tokio::test]
    async fn inbound_request_id_is_honored() {
        let upstream = MockUpstream::ok("{}");
        let app = app(upstream);
        let mut req = post_json("/v1/messages", r#"{"model":"claude-3","messages":[]}"#);
        req.headers_mut()
            .insert("x-request-id", HeaderValue::from_static("req-abc"));
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.headers().get("x-request-id").unwrap(), "req-abc");
    }

    #[tokio::test]
    async fn trigger_on_non_streaming_adds_ignored_header() {
        let upstream = MockUpstream::ok("{}");
        let app = app(upstream.clone());
        let mut req = post_json(
            "/v1/chat/completions",
            r#"{"model":"gpt-4o","messages":[]}"#,
        );
        req.headers_mut()
            .insert("x-anti-truncation", HeaderValue::from_static("true"));
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(
            resp.headers().get("x-anti-truncation-ignored").unwrap(),
            "non-streaming"
        );
        // The request passed through untouched: no marker instruction.
        let requests = upstream.requests.lock().unwrap();
        assert!(!String::from_utf8_lossy(&requests[0].body).contains("completion marker"));
    }

    #[tokio::test]
    async fn gemini_query_string_is_copied_upstream() {
        let upstream = MockUpstream::ok("{}");
        let app = app(upstream.clone());
        let resp = app
            .oneshot(post_json(
                "/v1beta/models/gemini-2.0-flash:generateContent?key=secret-key",
                r#"{"contents":[]}"#,
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let requests = upstream.requests.lock().unwrap();
        assert!(requests[0]
            .url
            .ends_with("/v1beta/models/gemini-2.0-flash:generateContent?key=secret-key"));
    }

    #[tokio::test]
    async fn upstream_headers_carry_forwarding_chain() {
        let upstream = MockUpstream::ok("{}");
        let app = app(upstream.clone());
        let mut req = post_json(
            "/v1/chat/completions",
            r#"{"model":"gpt-4o","messages":[]}"#,
        );
        req.headers_mut()
            .insert("x-forwarded-for", HeaderValue::from_static("203.0.113.9"));
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);

        let requests = upstream.requests.lock().unwrap();
        let sent = &requests[0].headers;
        // Peer 127.0.0.1 is trusted by default, so the chain entry wins.
        assert_eq!(sent.get("x-real-ip").unwrap(), "203.0.113.9");
        assert_eq!(
            sent.get("x-forwarded-for").unwrap(),
            "203.0.113.9, 127.0.0.1"
        );
        assert!(sent.get("host").is_none());
    }

    #[tokio::test]
    async fn streaming_request_without_triggers_is_plain_pass_through() {
        let upstream = MockUpstream::ok("data: {}\n\n");
        let app = app(upstream.clone());
        let resp = app
            .oneshot(post_json(
                "/v1/chat/completions",
                r#"{"model":"gpt-4o","messages":[],"stream":true}"#,
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert!(resp.headers().get("x-anti-truncation").is_none());
        let requests = upstream.requests.lock().unwrap();
        assert!(requests[0].stream);
    }

    // -----------------------------------------------------------------
    // Anti-truncation activation through the router
    // -----------------------------------------------------------------

    #[tokio::test]
    async fn streaming_trigger_activates_engine_and_injects_marker() {
        let upstream = MockUpstream::ok(
            "data: {\"choices\":[{\"delta\":{\"content\":\"hi [done]\"}}]}\n\n",
        );
        let app = app(upstream.clone());
        let resp = app
            .oneshot(post_json(
                "/v1/chat/completions",
                r#"{"model":"流式抗截断/gpt-4o","messages":[{"role":"user","content":"go"}],"stream":true}"#,
            ))
            .await
            .unwrap();

        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(resp.headers().get("x-anti-truncation").unwrap(), "enabled");
        assert!(resp.headers().get("x-request-id").is_some());

        let bytes = axum::body::to_bytes(resp.into_body(), 1024 * 1024)
            .await
            .unwrap();
        let body = String::from_utf8_lossy(&bytes);
        assert!(body.contains("\"content\":\"hi \""));
        assert!(!body.contains("[done]"));

        let requests = upstream.requests.lock().unwrap();
        assert_eq!(requests.len(), 1);
        let sent: Value = serde_json::from_slice(&requests[0].body).unwrap();
        // Prefix stripped, marker instruction injected as leading system turn.
        assert_eq!(sent["model"], "gpt-4o");
        assert_eq!(sent["messages"][0]["role"], "system");
        assert!(sent["messages"][0]["content"]
            .as_str()
            .unwrap()
            .contains("[done]"));
        assert!(requests[0].stream);
    }

    #[tokio::test]
    async fn gemini_prefixed_path_model_is_decoded_and_stripped() {
        let upstream = MockUpstream::ok(
            "data: {\"candidates\":[{\"content\":{\"parts\":[{\"text\":\"hi[done]\"}]}}]}\n\n",
        );
        let app = app(upstream.clone());
        // 流式抗截断/gemini-2.0-flash, percent-encoded as a single segment.
        let resp = app
            .oneshot(post_json(
                "/v1beta/models/%E6%B5%81%E5%BC%8F%E6%8A%97%E6%88%AA%E6%96%AD%2Fgemini-2.0-flash:streamGenerateContent",
                r#"{"contents":[{"role":"user","parts":[{"text":"go"}]}]}"#,
            ))
            .await
            .unwrap();

        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(resp.headers().get("x-anti-truncation").unwrap(), "enabled");

        let requests = upstream.requests.lock().unwrap();
        assert_eq!(requests.len(), 1);
        assert!(requests[0]
            .url
            .ends_with("/v1beta/models/gemini-2.0-flash:streamGenerateContent"));
        let sent: Value = serde_json::from_slice(&requests[0].body).unwrap();
        assert!(sent["systemInstruction"]["parts"][0]["text"]
            .as_str()
            .unwrap()
            .contains("[done]"));
    }

    #[tokio::test]
    async fn engine_first_attempt_non_2xx_passes_through() {
        let upstream = MockUpstream::with_status(
            StatusCode::TOO_MANY_REQUESTS,
            r#"{"error":{"message":"slow down"}}"#,
        );
        let app = app(upstream);
        let mut req = post_json(
            "/v1/chat/completions",
            r#"{"model":"gpt-4o","messages":[],"stream":true}"#,
        );
        req.headers_mut()
            .insert("x-anti-truncation", HeaderValue::from_static("true"));
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::TOO_MANY_REQUESTS);
        // The engine never activates on non-2xx streams.
        assert!(resp.headers().get("x-anti-truncation").is_none());
        let json = body_json(resp).await;
        assert_eq!(json["error"]["message"], "slow down");
    }

    #[tokio::test]
    async fn upstream_connect_failure_returns_502() {
        struct FailingUpstream;

        #[async_trait]
        impl UpstreamClient for FailingUpstream {
            async fn send(
                &self,
                _request: UpstreamRequest,
            ) -> Result<UpstreamResponse, UpstreamError> {
                Err(UpstreamError::Connect("connection refused".to_string()))
            }
        }

        let app = build_router(Arc::new(RelayConfig::default()), Arc::new(FailingUpstream));
        let resp = app
            .oneshot(post_json(
                "/v1/chat/completions",
                r#"{"model":"gpt-4o","messages":[]}"#,
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_GATEWAY);
        let json = body_json(resp).await;
        assert_eq!(json["error"]["kind"], "upstream_unreachable");
    }
}
