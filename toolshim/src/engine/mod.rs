// Copyright 2026 The Toolshim Project
// SPDX-License-Identifier: Apache-2.0

// Engine integration
//
// Wires the tool-call pipeline around one upstream round trip:
// - Rewrite chat requests so tools travel as prompt text
// - Forward to the validated upstream target
// - Streaming: transcode marker text into `delta.tool_calls` events
// - Non-streaming: move parsed calls into `message.tool_calls`
// - Upstream errors are relayed untouched

use flate2::read::{DeflateDecoder, GzDecoder};
use std::io::Read as _;

use crate::config::Config;
use crate::finish::ResponseFinisher;
use crate::parser::ToolProtocol;
use crate::proxy::{carries_body, ProxyError, ProxyRequest, ProxyResponse, UpstreamClient};
use crate::stream::{transcode, StreamTranscoder};
use crate::trace::{body_payload, TracePhase, TraceSink};
use crate::transform::{has_tools, RequestTransformer};
use async_trait::async_trait;
use axum::body::Body;
use axum::http::{HeaderMap, Method, StatusCode};
use bytes::Bytes;
use futures_util::stream::{Stream, StreamExt};
use futures_util::TryStreamExt;
use serde_json::{json, Value};
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Request context for structured logging
// ---------------------------------------------------------------------------

struct RequestContext {
    request_id: String,
    /// Target without its query string; queries may carry credentials.
    target: String,
    model: String,
    stream: bool,
    has_tools: bool,
}

// ---------------------------------------------------------------------------
// Interfaces
// ---------------------------------------------------------------------------

/// Sends HTTP requests to the upstream backend.
#[async_trait]
pub trait HttpSender: Send + Sync {
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse, HttpError>;
}

// ---------------------------------------------------------------------------
// Transport types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub method: Method,
    pub url: String,
    pub headers: HeaderMap,
    pub body: Bytes,
    pub timeout_ms: Option<u64>,
    pub stream: bool,
}

pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes, HttpError>> + Send>>;

pub enum HttpBody {
    Full(Bytes),
    Stream(ByteStream),
}

pub struct HttpResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: HttpBody,
}

#[derive(Debug, thiserror::Error)]
pub enum HttpError {
    #[error("upstream request failed: {0}")]
    Transport(String),
    #[error("upstream request timed out: {0}")]
    Timeout(String),
}

// ---------------------------------------------------------------------------
// Engine dependencies
// ---------------------------------------------------------------------------

pub struct EngineDeps {
    pub config: Arc<Config>,
    pub http: Arc<dyn HttpSender>,
    pub protocol: Arc<ToolProtocol>,
    pub tracer: Arc<dyn TraceSink>,
}

// ---------------------------------------------------------------------------
// EngineUpstreamClient
// ---------------------------------------------------------------------------

/// Upstream client that runs the full tool-call pipeline.
pub struct EngineUpstreamClient {
    deps: EngineDeps,
    transformer: RequestTransformer,
    finisher: ResponseFinisher,
}

impl EngineUpstreamClient {
    pub fn new_with(deps: EngineDeps) -> Self {
        let transformer = RequestTransformer::new(Arc::clone(&deps.protocol));
        let finisher = ResponseFinisher::new(Arc::clone(&deps.protocol));
        Self {
            deps,
            transformer,
            finisher,
        }
    }
}

#[async_trait]
impl UpstreamClient for EngineUpstreamClient {
    async fn forward(&self, request: ProxyRequest) -> Result<ProxyResponse, ProxyError> {
        let started = Instant::now();

        let body_json: Option<Value> = if carries_body(&request.method) {
            serde_json::from_slice(&request.body).ok()
        } else {
            None
        };
        let ctx = RequestContext {
            request_id: Uuid::new_v4().to_string(),
            target: redacted_target(&request.target),
            model: extract_model(body_json.as_ref()),
            stream: is_streaming_request(body_json.as_ref()),
            has_tools: body_json.as_ref().is_some_and(has_tools),
        };

        tracing::debug!(
            request_id = %ctx.request_id,
            target = %ctx.target,
            model = %ctx.model,
            stream = ctx.stream,
            has_tools = ctx.has_tools,
            "processing request"
        );

        // 1) Rewrite chat requests; anything else is forwarded as received
        let upstream_body = match &body_json {
            Some(body) if is_chat_request(body) => {
                let transformed = self.transformer.transform(body, ctx.has_tools);
                serde_json::to_vec(&transformed)
                    .map(Bytes::from)
                    .map_err(|e| ProxyError::MalformedJson(e.to_string()))?
            }
            _ if carries_body(&request.method) => request.body.clone(),
            _ => Bytes::new(),
        };

        let tracer = &self.deps.tracer;
        if tracer.enabled() {
            tracer.record(
                &ctx.request_id,
                TracePhase::ClientRequest,
                &json!({
                    "method": request.method.as_str(),
                    "target": ctx.target,
                    "body": body_payload(&request.body),
                }),
            );
            tracer.record(
                &ctx.request_id,
                TracePhase::UpstreamRequest,
                &body_payload(&upstream_body),
            );
        }

        // 2) Forward to upstream. Streams are bounded by the idle timeout
        // once headers arrive; until then by the request timeout.
        let timeout_ms = self.deps.config.upstream.timeout_ms;
        let http_req = HttpRequest {
            method: request.method,
            url: request.target.to_string(),
            headers: request.headers,
            body: upstream_body,
            timeout_ms: (!ctx.stream).then_some(timeout_ms),
            stream: ctx.stream,
        };

        let sent = if ctx.stream {
            tokio::time::timeout(Duration::from_millis(timeout_ms), self.deps.http.send(http_req))
                .await
                .unwrap_or_else(|_| {
                    Err(HttpError::Timeout(format!(
                        "no response headers within {timeout_ms} ms"
                    )))
                })
        } else {
            self.deps.http.send(http_req).await
        };

        let upstream = sent.map_err(|e| {
            tracing::warn!(
                request_id = %ctx.request_id,
                target = %ctx.target,
                error = %e,
                latency_ms = started.elapsed().as_millis() as u64,
                "upstream request failed"
            );
            match e {
                HttpError::Timeout(msg) => ProxyError::UpstreamTimeout(msg),
                HttpError::Transport(msg) => ProxyError::UpstreamFailure(msg),
            }
        })?;

        let status = upstream.status;
        let mut headers = upstream.headers;

        // 3) Streaming responses
        if status.is_success() && ctx.stream && is_event_stream(&headers) {
            // Content-Encoding on SSE is rare; pass the bytes through as-is.
            if is_gzip(&headers) || is_deflate(&headers) {
                tracing::warn!(
                    request_id = %ctx.request_id,
                    "streaming response has Content-Encoding; passing through without decompression"
                );
            }
            let body = self.handle_streaming_response(upstream.body, &ctx);
            tracing::info!(
                request_id = %ctx.request_id,
                target = %ctx.target,
                model = %ctx.model,
                stream = true,
                has_tools = ctx.has_tools,
                status = status.as_u16(),
                latency_ms = started.elapsed().as_millis() as u64,
                "streaming response started"
            );
            return Ok(ProxyResponse {
                status,
                headers,
                body,
            });
        }

        // 4) Complete bodies
        let body_bytes = collect_body(upstream.body).await?;
        let body_bytes = maybe_decompress(&mut headers, body_bytes)?;
        if tracer.enabled() {
            tracer.record(
                &ctx.request_id,
                TracePhase::UpstreamResponse,
                &json!({"status": status.as_u16(), "body": body_payload(&body_bytes)}),
            );
        }

        let (body_bytes, tool_calls) = if status.is_success() {
            self.handle_non_streaming_response(body_bytes, &ctx)
        } else {
            tracing::info!(
                request_id = %ctx.request_id,
                status = status.as_u16(),
                "relaying upstream error response"
            );
            (body_bytes, 0)
        };

        if tracer.enabled() {
            tracer.record(
                &ctx.request_id,
                TracePhase::ClientResponse,
                &json!({"status": status.as_u16(), "body": body_payload(&body_bytes)}),
            );
        }

        tracing::info!(
            request_id = %ctx.request_id,
            target = %ctx.target,
            model = %ctx.model,
            stream = ctx.stream,
            has_tools = ctx.has_tools,
            status = status.as_u16(),
            tool_calls,
            latency_ms = started.elapsed().as_millis() as u64,
            "request completed"
        );

        Ok(ProxyResponse {
            status,
            headers,
            body: Body::from(body_bytes),
        })
    }
}

impl EngineUpstreamClient {
    fn handle_streaming_response(&self, upstream: HttpBody, ctx: &RequestContext) -> Body {
        let idle_timeout = self.deps.config.upstream.stream_idle_timeout();
        let tracer = Arc::clone(&self.deps.tracer);

        let upstream_capture = tracer.enabled().then(|| Arc::new(Mutex::new(Vec::new())));
        let input = into_byte_stream(upstream);
        let input = match &upstream_capture {
            Some(capture) => capture_input(input, Arc::clone(capture)),
            None => input,
        };

        let output = if ctx.has_tools {
            let transcoder = StreamTranscoder::new(Arc::clone(&self.deps.protocol))
                .with_request_id(ctx.request_id.clone());
            transcode(input, transcoder, idle_timeout)
        } else {
            relay_stream(input, idle_timeout, ctx.request_id.clone())
        };

        let output = match upstream_capture {
            Some(capture) => trace_output(output, capture, tracer, ctx.request_id.clone()),
            None => output,
        };

        Body::from_stream(output.map(Ok::<Bytes, std::io::Error>))
    }

    /// Returns the body to send and the number of tool calls recovered.
    fn handle_non_streaming_response(&self, body: Bytes, ctx: &RequestContext) -> (Bytes, usize) {
        if !ctx.has_tools {
            return (body, 0);
        }
        let json: Value = match serde_json::from_slice(&body) {
            Ok(v) => v,
            Err(_) => {
                tracing::debug!(
                    request_id = %ctx.request_id,
                    "upstream body is not JSON; relaying unchanged"
                );
                return (body, 0);
            }
        };

        let original = json.clone();
        let (finished, count) = self.finisher.finish(json, true);
        if finished == original {
            return (body, 0);
        }
        match serde_json::to_vec(&finished) {
            Ok(bytes) => (Bytes::from(bytes), count),
            Err(_) => (body, 0),
        }
    }
}

// ---------------------------------------------------------------------------
// Reqwest-backed sender
// ---------------------------------------------------------------------------

pub struct ReqwestHttpSender {
    client: reqwest::Client,
}

impl ReqwestHttpSender {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl HttpSender for ReqwestHttpSender {
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse, HttpError> {
        let mut req = self
            .client
            .request(request.method, &request.url)
            .headers(request.headers);

        if !request.body.is_empty() {
            req = req.body(request.body);
        }
        if let Some(timeout_ms) = request.timeout_ms {
            req = req.timeout(Duration::from_millis(timeout_ms));
        }

        let resp = req.send().await.map_err(|e| {
            if e.is_timeout() {
                HttpError::Timeout(e.to_string())
            } else {
                HttpError::Transport(e.to_string())
            }
        })?;

        let status = resp.status();
        let headers = resp.headers().clone();

        if request.stream {
            let stream = resp
                .bytes_stream()
                .map_err(|e| HttpError::Transport(e.to_string()));
            Ok(HttpResponse {
                status,
                headers,
                body: HttpBody::Stream(Box::pin(stream)),
            })
        } else {
            let body = resp.bytes().await.map_err(|e| {
                if e.is_timeout() {
                    HttpError::Timeout(e.to_string())
                } else {
                    HttpError::Transport(e.to_string())
                }
            })?;
            Ok(HttpResponse {
                status,
                headers,
                body: HttpBody::Full(body),
            })
        }
    }
}

// ---------------------------------------------------------------------------
// Public factory for default engine client
// ---------------------------------------------------------------------------

pub fn build_engine_client(
    config: Arc<Config>,
    protocol: Arc<ToolProtocol>,
    tracer: Arc<dyn TraceSink>,
) -> Result<EngineUpstreamClient, HttpError> {
    // Redirects are not followed: a redirect could point past the target policy.
    let client = reqwest::Client::builder()
        .connect_timeout(Duration::from_millis(config.upstream.connect_timeout_ms))
        .redirect(reqwest::redirect::Policy::none())
        .build()
        .map_err(|e| HttpError::Transport(e.to_string()))?;

    let deps = EngineDeps {
        config,
        http: Arc::new(ReqwestHttpSender::new(client)),
        protocol,
        tracer,
    };
    Ok(EngineUpstreamClient::new_with(deps))
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn content_encoding_is(headers: &HeaderMap, encoding: &str) -> bool {
    headers
        .get(reqwest::header::CONTENT_ENCODING)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.trim().eq_ignore_ascii_case(encoding))
        .unwrap_or(false)
}

fn is_gzip(headers: &HeaderMap) -> bool {
    content_encoding_is(headers, "gzip")
}

fn is_deflate(headers: &HeaderMap) -> bool {
    content_encoding_is(headers, "deflate")
}

fn is_event_stream(headers: &HeaderMap) -> bool {
    headers
        .get(reqwest::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_ascii_lowercase().starts_with("text/event-stream"))
        .unwrap_or(false)
}

fn decompress_gzip(body: &Bytes) -> Result<Bytes, ProxyError> {
    let mut decoder = GzDecoder::new(&body[..]);
    let mut decompressed = Vec::new();
    decoder
        .read_to_end(&mut decompressed)
        .map_err(|e| ProxyError::UpstreamFailure(format!("gzip decompression failed: {e}")))?;
    Ok(Bytes::from(decompressed))
}

fn decompress_deflate(body: &Bytes) -> Result<Bytes, ProxyError> {
    let mut decoder = DeflateDecoder::new(&body[..]);
    let mut decompressed = Vec::new();
    decoder
        .read_to_end(&mut decompressed)
        .map_err(|e| ProxyError::UpstreamFailure(format!("deflate decompression failed: {e}")))?;
    Ok(Bytes::from(decompressed))
}

/// Decompress body if Content-Encoding is set. Strips Content-Encoding and
/// Content-Length from headers (body size changed after decompression).
fn maybe_decompress(headers: &mut HeaderMap, body: Bytes) -> Result<Bytes, ProxyError> {
    let result = if is_gzip(headers) {
        decompress_gzip(&body)?
    } else if is_deflate(headers) {
        decompress_deflate(&body)?
    } else {
        return Ok(body);
    };
    headers.remove(reqwest::header::CONTENT_ENCODING);
    headers.remove(reqwest::header::CONTENT_LENGTH);
    Ok(result)
}

async fn collect_body(body: HttpBody) -> Result<Bytes, ProxyError> {
    match body {
        HttpBody::Full(b) => Ok(b),
        HttpBody::Stream(mut s) => {
            let mut collected = Vec::new();
            while let Some(chunk) = s.next().await {
                let bytes = chunk.map_err(|e| match e {
                    HttpError::Timeout(msg) => ProxyError::UpstreamTimeout(msg),
                    HttpError::Transport(msg) => ProxyError::UpstreamFailure(msg),
                })?;
                collected.extend_from_slice(&bytes);
            }
            Ok(Bytes::from(collected))
        }
    }
}

fn into_byte_stream(body: HttpBody) -> ByteStream {
    match body {
        HttpBody::Full(bytes) => Box::pin(futures_util::stream::once(async move { Ok(bytes) })),
        HttpBody::Stream(s) => s,
    }
}

/// A chat request is a JSON object carrying messages or tools.
fn is_chat_request(body: &Value) -> bool {
    body.as_object()
        .is_some_and(|obj| obj.contains_key("messages") || obj.contains_key("tools"))
}

fn extract_model(body: Option<&Value>) -> String {
    body.and_then(|v| v.get("model")?.as_str().map(String::from))
        .unwrap_or_default()
}

fn is_streaming_request(body: Option<&Value>) -> bool {
    body.and_then(|v| v.get("stream"))
        .and_then(Value::as_bool)
        .unwrap_or(false)
}

fn redacted_target(target: &reqwest::Url) -> String {
    let mut url = target.clone();
    url.set_query(None);
    url.set_fragment(None);
    url.to_string()
}

/// Relay an upstream stream unchanged, ending it on error or idle timeout.
fn relay_stream(
    input: ByteStream,
    idle_timeout: Duration,
    request_id: String,
) -> Pin<Box<dyn Stream<Item = Bytes> + Send>> {
    let stream = futures_util::stream::unfold(Some(input), move |state| {
        let request_id = request_id.clone();
        async move {
            let mut input = state?;
            match tokio::time::timeout(idle_timeout, input.next()).await {
                Ok(Some(Ok(chunk))) => Some((chunk, Some(input))),
                Ok(Some(Err(e))) => {
                    tracing::warn!(request_id = %request_id, error = %e, "upstream stream failed");
                    None
                }
                Ok(None) => None,
                Err(_) => {
                    tracing::warn!(
                        request_id = %request_id,
                        idle_timeout_ms = idle_timeout.as_millis() as u64,
                        "upstream stream idle"
                    );
                    None
                }
            }
        }
    })
    .filter(|b| futures_util::future::ready(!b.is_empty()));

    Box::pin(stream)
}

fn capture_input(input: ByteStream, capture: Arc<Mutex<Vec<u8>>>) -> ByteStream {
    Box::pin(input.inspect_ok(move |chunk| {
        if let Ok(mut buf) = capture.lock() {
            buf.extend_from_slice(chunk);
        }
    }))
}

/// Record both sides of a stream once the client has read it to the end.
fn trace_output(
    output: Pin<Box<dyn Stream<Item = Bytes> + Send>>,
    upstream: Arc<Mutex<Vec<u8>>>,
    tracer: Arc<dyn TraceSink>,
    request_id: String,
) -> Pin<Box<dyn Stream<Item = Bytes> + Send>> {
    let client = Arc::new(Mutex::new(Vec::new()));
    let client_tap = Arc::clone(&client);

    let tapped = output.inspect(move |chunk| {
        if let Ok(mut buf) = client_tap.lock() {
            buf.extend_from_slice(chunk);
        }
    });
    let record = futures_util::stream::once(async move {
        let upstream_bytes = upstream.lock().map(|b| b.clone()).unwrap_or_default();
        let client_bytes = client.lock().map(|b| b.clone()).unwrap_or_default();
        tracer.record(
            &request_id,
            TracePhase::UpstreamResponse,
            &body_payload(&upstream_bytes),
        );
        tracer.record(
            &request_id,
            TracePhase::ClientResponse,
            &body_payload(&client_bytes),
        );
        Bytes::new()
    });

    Box::pin(
        tapped
            .chain(record)
            .filter(|b| futures_util::future::ready(!b.is_empty())),
    )
}
