// Copyright 2026 The Toolshim Project
// SPDX-License-Identifier: Apache-2.0

// HTTP proxy surface
//
// Responsibilities:
// - Target URL extraction from the request path (`/<absolute-url>`)
// - Target policy: scheme, host allowlist, private address rejection
// - Request header policy (forward only credentials and version headers)
// - Request forwarding via injected UpstreamClient trait
// - Response header hygiene (hop-by-hop, length, encoding)
// - Health endpoint

use axum::body::Body;
use axum::extract::State;
use axum::http::{header, HeaderMap, HeaderName, HeaderValue, Method, Request, Response, StatusCode, Uri};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use bytes::Bytes;
use futures_util::StreamExt;
use reqwest::Url;
use serde_json::json;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::sync::Arc;

use crate::config::UpstreamConfig;

/// Largest request body accepted from clients.
pub const MAX_BODY_BYTES: usize = 10 * 1024 * 1024;

// ---------------------------------------------------------------------------
// Domain types
// ---------------------------------------------------------------------------

/// Inbound request data forwarded to the upstream client.
#[derive(Debug, Clone)]
pub struct ProxyRequest {
    pub method: Method,
    /// Validated absolute upstream URL.
    pub target: Url,
    /// Already filtered by [`forward_headers`].
    pub headers: HeaderMap,
    pub body: Bytes,
}

/// Response received from the upstream backend.
#[derive(Debug)]
pub struct ProxyResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Body,
}

impl ProxyResponse {
    pub fn from_bytes(status: StatusCode, body: Vec<u8>) -> Self {
        Self {
            status,
            headers: HeaderMap::new(),
            body: Body::from(body),
        }
    }
}

/// Errors the proxy itself reports to clients.
#[derive(Debug, thiserror::Error)]
pub enum ProxyError {
    #[error("invalid target URL: {0}")]
    InvalidTarget(String),

    #[error("target not allowed: {0}")]
    TargetNotAllowed(String),

    #[error("request body is not valid JSON: {0}")]
    MalformedJson(String),

    #[error("request body is empty")]
    EmptyBody,

    #[error("failed to read request body: {0}")]
    UnreadableBody(String),

    #[error("request body exceeds {0} bytes")]
    BodyTooLarge(usize),

    #[error("upstream request failed: {0}")]
    UpstreamFailure(String),

    #[error("upstream request timed out: {0}")]
    UpstreamTimeout(String),
}

impl ProxyError {
    pub fn status(&self) -> StatusCode {
        match self {
            ProxyError::InvalidTarget(_) => StatusCode::BAD_REQUEST,
            ProxyError::TargetNotAllowed(_) => StatusCode::FORBIDDEN,
            ProxyError::MalformedJson(_)
            | ProxyError::EmptyBody
            | ProxyError::UnreadableBody(_) => StatusCode::BAD_REQUEST,
            ProxyError::BodyTooLarge(_) => StatusCode::PAYLOAD_TOO_LARGE,
            ProxyError::UpstreamFailure(_) => StatusCode::BAD_GATEWAY,
            ProxyError::UpstreamTimeout(_) => StatusCode::GATEWAY_TIMEOUT,
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            ProxyError::InvalidTarget(_) => "invalid_target",
            ProxyError::TargetNotAllowed(_) => "target_not_allowed",
            ProxyError::MalformedJson(_)
            | ProxyError::EmptyBody
            | ProxyError::UnreadableBody(_) => "invalid_request_body",
            ProxyError::BodyTooLarge(_) => "request_too_large",
            ProxyError::UpstreamFailure(_) => "upstream_unreachable",
            ProxyError::UpstreamTimeout(_) => "upstream_timeout",
        }
    }
}

impl IntoResponse for ProxyError {
    fn into_response(self) -> axum::response::Response {
        // Transport details stay in the logs.
        let public_message = match &self {
            ProxyError::UpstreamFailure(_) => "upstream request failed".to_string(),
            ProxyError::UpstreamTimeout(_) => "upstream request timed out".to_string(),
            other => other.to_string(),
        };
        let body = json!({
            "error": {
                "message": public_message,
                "type": "proxy_error",
                "code": self.code(),
            }
        });
        (self.status(), Json(body)).into_response()
    }
}

// ---------------------------------------------------------------------------
// Trait: UpstreamClient (dependency injection point)
// ---------------------------------------------------------------------------

/// Abstraction over whatever forwards requests to the backend.
///
/// Implementations must be Send + Sync so they can be shared across request
/// handlers via `Arc`.
#[async_trait::async_trait]
pub trait UpstreamClient: Send + Sync {
    async fn forward(&self, request: ProxyRequest) -> Result<ProxyResponse, ProxyError>;
}

// ---------------------------------------------------------------------------
// Target extraction and policy
// ---------------------------------------------------------------------------

/// Extract the upstream URL embedded in the request path.
///
/// `/https://api.example.com/v1/chat/completions?x=1` targets
/// `https://api.example.com/v1/chat/completions?x=1`.
pub fn parse_target(uri: &Uri) -> Result<Url, ProxyError> {
    let raw = uri
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or_else(|| uri.path());
    let raw = raw.strip_prefix('/').unwrap_or(raw);
    if raw.is_empty() {
        return Err(ProxyError::InvalidTarget("missing target URL".to_string()));
    }

    let url = Url::parse(raw).map_err(|e| ProxyError::InvalidTarget(e.to_string()))?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(ProxyError::InvalidTarget(format!(
            "unsupported scheme: {}",
            url.scheme()
        )));
    }
    if url.host_str().map_or(true, str::is_empty) {
        return Err(ProxyError::InvalidTarget("missing host".to_string()));
    }
    Ok(url)
}

/// Which upstream hosts the proxy will talk to.
#[derive(Debug, Clone, Default)]
pub struct TargetPolicy {
    allowed_hosts: Vec<String>,
    allow_private: bool,
}

impl TargetPolicy {
    pub fn new(allowed_hosts: Vec<String>, allow_private: bool) -> Self {
        Self {
            allowed_hosts: allowed_hosts
                .into_iter()
                .map(|h| h.to_ascii_lowercase())
                .collect(),
            allow_private,
        }
    }

    pub fn from_config(config: &UpstreamConfig) -> Self {
        Self::new(config.allowed_hosts.clone(), config.allow_private)
    }

    pub fn check(&self, url: &Url) -> Result<(), ProxyError> {
        let Some(host) = url.host_str().filter(|h| !h.is_empty()) else {
            return Err(ProxyError::InvalidTarget("missing host".to_string()));
        };
        let name = host
            .trim_start_matches('[')
            .trim_end_matches(']')
            .trim_end_matches('.')
            .to_ascii_lowercase();
        let private = match name.parse::<IpAddr>() {
            Ok(ip) => is_private_ip(ip),
            Err(_) => name == "localhost" || name.ends_with(".localhost"),
        };

        if !self.allowed_hosts.is_empty() && !self.allowed_hosts.iter().any(|h| *h == name) {
            return Err(ProxyError::TargetNotAllowed(format!(
                "host {name} is not in the allowlist"
            )));
        }
        if private && !self.allow_private {
            return Err(ProxyError::TargetNotAllowed(format!(
                "host {name} is a local or private address"
            )));
        }
        Ok(())
    }
}

/// Loopback, private, link-local, unspecified or broadcast.
pub fn is_private_ip(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => is_private_v4(v4),
        IpAddr::V6(v6) => {
            if let Some(v4) = v6.to_ipv4_mapped() {
                return is_private_v4(v4);
            }
            is_private_v6(v6)
        }
    }
}

fn is_private_v4(ip: Ipv4Addr) -> bool {
    ip.is_loopback()
        || ip.is_private()
        || ip.is_link_local()
        || ip.is_unspecified()
        || ip.is_broadcast()
}

fn is_private_v6(ip: Ipv6Addr) -> bool {
    let first = ip.segments()[0];
    ip.is_loopback()
        || ip.is_unspecified()
        || (first & 0xfe00) == 0xfc00 // unique local fc00::/7
        || (first & 0xffc0) == 0xfe80 // link local fe80::/10
}

// ---------------------------------------------------------------------------
// Header policy
// ---------------------------------------------------------------------------

/// Request headers passed through to the upstream.
const FORWARDED_HEADERS: &[&str] = &["authorization", "x-api-key", "anthropic-version"];

/// Response headers that describe the upstream connection or the original
/// body encoding, neither of which survives the proxy.
const STRIPPED_RESPONSE_HEADERS: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
    "content-length",
    "content-encoding",
];

/// GET and HEAD carry no body.
pub fn carries_body(method: &Method) -> bool {
    !matches!(*method, Method::GET | Method::HEAD)
}

/// Build the upstream request headers from the client's.
pub fn forward_headers(client: &HeaderMap, method: &Method) -> HeaderMap {
    let mut headers = HeaderMap::new();
    for &name in FORWARDED_HEADERS {
        for value in client.get_all(name) {
            headers.append(HeaderName::from_static(name), value.clone());
        }
    }
    if carries_body(method) {
        headers.insert(
            header::CONTENT_TYPE,
            HeaderValue::from_static("application/json"),
        );
    }
    headers
}

/// Remove headers that must not be relayed to the client.
pub fn strip_response_headers(headers: &mut HeaderMap) {
    for &name in STRIPPED_RESPONSE_HEADERS {
        headers.remove(name);
    }
}

// ---------------------------------------------------------------------------
// Shared application state
// ---------------------------------------------------------------------------

/// Shared state injected into axum handlers.
#[derive(Clone)]
pub struct AppState {
    pub upstream: Arc<dyn UpstreamClient>,
    pub policy: Arc<TargetPolicy>,
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

/// Liveness endpoint: GET /healthz -> 200 OK
pub async fn healthz() -> StatusCode {
    StatusCode::OK
}

/// Proxy handler for every other path.
///
/// Validates the target and body, forwards via the injected upstream
/// client, and relays the response.
pub async fn proxy_handler(
    State(state): State<AppState>,
    request: Request<Body>,
) -> axum::response::Response {
    let method = request.method().clone();

    let target = match parse_target(request.uri()).and_then(|url| {
        state.policy.check(&url)?;
        Ok(url)
    }) {
        Ok(url) => url,
        Err(e) => {
            tracing::warn!(path = %request.uri().path(), error = %e, "rejected target");
            return e.into_response();
        }
    };

    let headers = forward_headers(request.headers(), &method);

    let body = match read_body(request.into_body(), MAX_BODY_BYTES).await {
        Ok(b) => b,
        Err(e) => {
            tracing::warn!(error = %e, "rejected request body");
            return e.into_response();
        }
    };

    // Validate body
    if carries_body(&method) {
        if body.is_empty() {
            return ProxyError::EmptyBody.into_response();
        }
        if let Err(e) = serde_json::from_slice::<serde_json::Value>(&body) {
            return ProxyError::MalformedJson(e.to_string()).into_response();
        }
    }

    let proxy_req = ProxyRequest {
        method,
        target,
        headers,
        body,
    };

    match state.upstream.forward(proxy_req).await {
        Ok(mut resp) => {
            strip_response_headers(&mut resp.headers);
            let mut response = Response::new(resp.body);
            *response.status_mut() = resp.status;
            *response.headers_mut() = resp.headers;
            response
        }
        Err(e) => e.into_response(),
    }
}

/// Collect a request body, failing once it grows past `limit` bytes.
async fn read_body(body: Body, limit: usize) -> Result<Bytes, ProxyError> {
    let mut chunks = body.into_data_stream();
    let mut buf = Vec::new();
    while let Some(chunk) = chunks.next().await {
        let chunk = chunk.map_err(|e| ProxyError::UnreadableBody(e.to_string()))?;
        if buf.len() + chunk.len() > limit {
            return Err(ProxyError::BodyTooLarge(limit));
        }
        buf.extend_from_slice(&chunk);
    }
    Ok(Bytes::from(buf))
}

// ---------------------------------------------------------------------------
// Router construction
// ---------------------------------------------------------------------------

/// Build the axum router: health endpoint plus a catch-all proxy route.
///
/// The upstream client is injected; no side effects, no hard-coded clients.
pub fn build_router(upstream: Arc<dyn UpstreamClient>, policy: TargetPolicy) -> Router {
    let state = AppState {
        upstream,
        policy: Arc::new(policy),
    };

    Router::new()
        .route("/healthz", get(healthz))
        .fallback(proxy_handler)
        .with_state(state)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use tower::ServiceExt; // for oneshot

    // -----------------------------------------------------------------------
    // Mock upstream clients
    // -----------------------------------------------------------------------

    /// Returns a fixed response. Handlers never touch a real HTTP client.
    #[derive(Clone)]
    struct MockUpstreamClient {
        status: StatusCode,
        headers: HeaderMap,
        body: Bytes,
    }

    impl MockUpstreamClient {
        fn ok_json(body: &str) -> Self {
            let mut headers = HeaderMap::new();
            headers.insert("content-type", HeaderValue::from_static("application/json"));
            Self {
                status: StatusCode::OK,
                headers,
                body: Bytes::copy_from_slice(body.as_bytes()),
            }
        }
    }

    #[async_trait::async_trait]
    impl UpstreamClient for MockUpstreamClient {
        async fn forward(&self, _request: ProxyRequest) -> Result<ProxyResponse, ProxyError> {
            Ok(ProxyResponse {
                status: self.status,
                headers: self.headers.clone(),
                body: Body::from(self.body.clone()),
            })
        }
    }

    /// Captures the request it was called with.
    struct CapturingClient {
        captured: tokio::sync::Mutex<Option<ProxyRequest>>,
    }

    impl CapturingClient {
        fn new() -> Self {
            Self {
                captured: tokio::sync::Mutex::new(None),
            }
        }
    }

    #[async_trait::async_trait]
    impl UpstreamClient for CapturingClient {
        async fn forward(&self, request: ProxyRequest) -> Result<ProxyResponse, ProxyError> {
            *self.captured.lock().await = Some(request);
            Ok(ProxyResponse::from_bytes(StatusCode::OK, b"{\"ok\":true}".to_vec()))
        }
    }

    struct FailingClient(fn() -> ProxyError);

    #[async_trait::async_trait]
    impl UpstreamClient for FailingClient {
        async fn forward(&self, _request: ProxyRequest) -> Result<ProxyResponse, ProxyError> {
            Err((self.0)())
        }
    }

    fn open_policy() -> TargetPolicy {
        TargetPolicy::new(Vec::new(), false)
    }

    fn json_request(method: &str, path: &str, body: &str) -> Request<Body> {
        Request::builder()
            .method(method)
            .uri(path)
            .header("content-type", "application/json")
            .body(Body::from(body.to_owned()))
            .unwrap()
    }

    async fn error_body(resp: axum::response::Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn uri(s: &str) -> Uri {
        s.parse().unwrap()
    }

    // -----------------------------------------------------------------------
    // Target parsing
    // -----------------------------------------------------------------------

    #[test]
    fn target_extracted_with_query() {
        let url = parse_target(&uri("/https://api.example.com/v1/chat/completions?v=2")).unwrap();
        assert_eq!(url.as_str(), "https://api.example.com/v1/chat/completions?v=2");
    }

    #[test]
    fn target_missing_or_bad_rejected() {
        for path in ["/", "/not a url", "/ftp://example.com/x", "/api.example.com/v1"] {
            let err = parse_target(&uri(&path.replace(' ', "%20"))).unwrap_err();
            assert!(matches!(err, ProxyError::InvalidTarget(_)), "{path}");
        }
    }

    // -----------------------------------------------------------------------
    // Target policy
    // -----------------------------------------------------------------------

    #[test]
    fn private_addresses_rejected_by_default() {
        let policy = open_policy();
        for target in [
            "http://localhost:8080/v1",
            "http://api.localhost/v1",
            "http://127.0.0.1/v1",
            "http://10.1.2.3/v1",
            "http://192.168.0.10/v1",
            "http://169.254.169.254/latest",
            "http://0.0.0.0/v1",
            "http://[::1]/v1",
            "http://[fd00::1]/v1",
            "http://[fe80::1]/v1",
            "http://[::ffff:127.0.0.1]/v1",
        ] {
            let url = Url::parse(target).unwrap();
            assert!(
                matches!(policy.check(&url), Err(ProxyError::TargetNotAllowed(_))),
                "{target}"
            );
        }
    }

    #[test]
    fn public_addresses_allowed() {
        let policy = open_policy();
        for target in [
            "https://api.example.com/v1",
            "http://8.8.8.8/v1",
            "http://[2001:4860:4860::8888]/v1",
        ] {
            assert!(policy.check(&Url::parse(target).unwrap()).is_ok(), "{target}");
        }
    }

    #[test]
    fn allow_private_permits_loopback() {
        let policy = TargetPolicy::new(Vec::new(), true);
        assert!(policy.check(&Url::parse("http://127.0.0.1:9000/v1").unwrap()).is_ok());
    }

    #[test]
    fn allowlist_is_exact_and_case_insensitive() {
        let policy = TargetPolicy::new(vec!["API.Example.com".to_string()], false);
        assert!(policy.check(&Url::parse("https://api.example.com/v1").unwrap()).is_ok());
        assert!(policy.check(&Url::parse("https://evil.example.com/v1").unwrap()).is_err());
        assert!(policy
            .check(&Url::parse("https://api.example.com.evil.net/v1").unwrap())
            .is_err());
    }

    // -----------------------------------------------------------------------
    // Header policy
    // -----------------------------------------------------------------------

    #[test]
    fn only_credential_headers_forwarded() {
        let mut client = HeaderMap::new();
        client.insert("authorization", HeaderValue::from_static("Bearer sk-1"));
        client.insert("x-api-key", HeaderValue::from_static("key"));
        client.insert("anthropic-version", HeaderValue::from_static("2023-06-01"));
        client.insert("cookie", HeaderValue::from_static("session=1"));
        client.insert("host", HeaderValue::from_static("127.0.0.1:9810"));
        client.insert("content-type", HeaderValue::from_static("text/plain"));

        let headers = forward_headers(&client, &Method::POST);
        assert_eq!(headers.get("authorization").unwrap(), "Bearer sk-1");
        assert_eq!(headers.get("x-api-key").unwrap(), "key");
        assert_eq!(headers.get("anthropic-version").unwrap(), "2023-06-01");
        assert_eq!(headers.get("content-type").unwrap(), "application/json");
        assert!(headers.get("cookie").is_none());
        assert!(headers.get("host").is_none());
        assert_eq!(headers.len(), 4);

        let headers = forward_headers(&client, &Method::GET);
        assert!(headers.get("content-type").is_none());
    }

    #[test]
    fn hop_by_hop_response_headers_stripped() {
        let mut headers = HeaderMap::new();
        headers.insert("content-type", HeaderValue::from_static("application/json"));
        headers.insert("content-length", HeaderValue::from_static("42"));
        headers.insert("content-encoding", HeaderValue::from_static("gzip"));
        headers.insert("transfer-encoding", HeaderValue::from_static("chunked"));
        headers.insert("connection", HeaderValue::from_static("keep-alive"));
        headers.insert("x-request-id", HeaderValue::from_static("abc123"));

        strip_response_headers(&mut headers);

        assert_eq!(headers.get("content-type").unwrap(), "application/json");
        assert_eq!(headers.get("x-request-id").unwrap(), "abc123");
        assert_eq!(headers.len(), 2);
    }

    // -----------------------------------------------------------------------
    // Router
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn healthz_returns_200() {
        let app = build_router(Arc::new(MockUpstreamClient::ok_json("{}")), open_policy());
        let req = Request::builder().uri("/healthz").body(Body::empty()).unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn request_forwarded_to_embedded_target() {
        let client = Arc::new(CapturingClient::new());
        let app = build_router(client.clone(), open_policy());

        let req = Request::builder()
            .method("POST")
            .uri("/https://api.example.com/v1/chat/completions")
            .header("authorization", "Bearer sk-test")
            .header("cookie", "a=b")
            .body(Body::from(r#"{"model":"m","messages":[]}"#))
            .unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);

        let captured = client.captured.lock().await;
        let captured = captured.as_ref().unwrap();
        assert_eq!(captured.method, Method::POST);
        assert_eq!(
            captured.target.as_str(),
            "https://api.example.com/v1/chat/completions"
        );
        assert_eq!(captured.headers.get("authorization").unwrap(), "Bearer sk-test");
        assert!(captured.headers.get("cookie").is_none());
        assert_eq!(&captured.body[..], br#"{"model":"m","messages":[]}"#);
    }

    #[tokio::test]
    async fn invalid_target_returns_400() {
        let app = build_router(Arc::new(MockUpstreamClient::ok_json("{}")), open_policy());
        let resp = app
            .oneshot(json_request("POST", "/v1/chat/completions", "{}"))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        let body = error_body(resp).await;
        assert_eq!(body["error"]["code"], "invalid_target");
        assert_eq!(body["error"]["type"], "proxy_error");
    }

    #[tokio::test]
    async fn private_target_returns_403() {
        let client = Arc::new(CapturingClient::new());
        let app = build_router(client.clone(), open_policy());
        let resp = app
            .oneshot(json_request("POST", "/http://127.0.0.1:8000/v1/chat/completions", "{}"))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::FORBIDDEN);
        assert_eq!(error_body(resp).await["error"]["code"], "target_not_allowed");
        assert!(client.captured.lock().await.is_none());
    }

    #[tokio::test]
    async fn malformed_json_returns_400() {
        let app = build_router(Arc::new(MockUpstreamClient::ok_json("{}")), open_policy());
        let resp = app
            .oneshot(json_request("POST", "/https://api.example.com/v1/chat/completions", "{oops"))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        assert_eq!(error_body(resp).await["error"]["code"], "invalid_request_body");
    }

    #[tokio::test]
    async fn oversized_body_returns_413() {
        let client = Arc::new(CapturingClient::new());
        let app = build_router(client.clone(), open_policy());
        let body = format!("{{\"pad\":\"{}\"}}", "x".repeat(MAX_BODY_BYTES));
        let resp = app
            .oneshot(json_request("POST", "/https://api.example.com/v1/chat/completions", &body))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::PAYLOAD_TOO_LARGE);
        let json = error_body(resp).await;
        assert_eq!(json["error"]["code"], "request_too_large");
        assert!(client.captured.lock().await.is_none());
    }

    #[tokio::test]
    async fn read_body_enforces_limit() {
        let body = Body::from(vec![b' '; 64]);
        assert_eq!(read_body(body, 64).await.unwrap().len(), 64);
        let body = Body::from(vec![b' '; 65]);
        assert!(matches!(read_body(body, 64).await, Err(ProxyError::BodyTooLarge(64))));
    }

    #[tokio::test]
    async fn empty_body_returns_400() {
        let app = build_router(Arc::new(MockUpstreamClient::ok_json("{}")), open_policy());
        let resp = app
            .oneshot(json_request("POST", "/https://api.example.com/v1/chat/completions", ""))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn get_without_body_forwarded() {
        let client = Arc::new(CapturingClient::new());
        let app = build_router(client.clone(), open_policy());
        let req = Request::builder()
            .uri("/https://api.example.com/v1/models")
            .body(Body::empty())
            .unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let captured = client.captured.lock().await;
        assert_eq!(captured.as_ref().unwrap().method, Method::GET);
    }

    #[tokio::test]
    async fn upstream_errors_map_to_gateway_statuses() {
        let cases: [(fn() -> ProxyError, StatusCode, &str); 2] = [
            (
                || ProxyError::UpstreamFailure("connection refused".into()),
                StatusCode::BAD_GATEWAY,
                "upstream_unreachable",
            ),
            (
                || ProxyError::UpstreamTimeout("deadline".into()),
                StatusCode::GATEWAY_TIMEOUT,
                "upstream_timeout",
            ),
        ];
        for (make, status, code) in cases {
            let app = build_router(Arc::new(FailingClient(make)), open_policy());
            let resp = app
                .oneshot(json_request("POST", "/https://api.example.com/v1/x", "{}"))
                .await
                .unwrap();
            assert_eq!(resp.status(), status);
            let body = error_body(resp).await;
            assert_eq!(body["error"]["code"], code);
            assert!(!body["error"]["message"]
                .as_str()
                .unwrap()
                .contains("connection refused"));
        }
    }

    #[tokio::test]
    async fn response_headers_cleaned() {
        let mut client = MockUpstreamClient::ok_json(r#"{"ok":true}"#);
        client
            .headers
            .insert("content-length", HeaderValue::from_static("999"));
        client
            .headers
            .insert("x-upstream", HeaderValue::from_static("1"));
        let app = build_router(Arc::new(client), open_policy());
        let resp = app
            .oneshot(json_request("POST", "/https://api.example.com/v1/x", "{}"))
            .await
            .unwrap();
        assert_eq!(resp.headers().get("x-upstream").unwrap(), "1");
        assert_ne!(
            resp.headers().get("content-length").map(|v| v.as_bytes()),
            Some(&b"999"[..])
        );
    }
}
