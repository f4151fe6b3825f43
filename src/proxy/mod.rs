// Proxy module - the request path in front of the backend
//
// Every chat request flows: model extraction -> activity update -> model
// switch decision -> ensure backend ready -> reverse proxy with SSE
// post-processing. Anthropic-dialect requests are translated to OpenAI
// before this pipeline and their responses translated back after it.
// Failures short-circuit to a structured error or a "loading" message;
// nothing unwinds past the handler.

pub mod capture;
pub mod postprocess;
pub mod server;

use axum::{
    body::Body,
    extract::State,
    http::{header, request::Parts, HeaderValue, Request, Response, StatusCode},
    response::IntoResponse,
};
use bytes::Bytes;
use std::sync::Arc;
use std::time::Instant;

use crate::activation::ActivationController;
use crate::config::Config;
use crate::error::{anthropic_error_body, ActivationError, ProxyError};
use crate::metrics::Metrics;
use crate::registry::ModelRegistry;
use crate::translation::stream::AnthropicStreamTranslator;
use crate::translation::{request as request_translation, response as response_translation};
use crate::translation::{RequestContext, TranslateOptions};
use capture::{ProcessedBody, ResponseRecorder};
use postprocess::SsePostProcessor;

/// Hop-by-hop headers never forwarded in either direction.
/// content-length is dropped because translation and post-processing can
/// change the body size.
const SKIPPED_HEADERS: [&str; 4] = ["host", "connection", "transfer-encoding", "content-length"];

/// Shared state for the proxy server
#[derive(Clone)]
pub struct ProxyState {
    /// HTTP client for forwarding requests
    pub client: reqwest::Client,
    pub controller: Arc<ActivationController>,
    pub registry: Arc<dyn ModelRegistry>,
    pub metrics: Arc<Metrics>,
    pub config: Arc<Config>,
    pub started_at: Instant,
}

// ============================================================================
// Small Endpoints
// ============================================================================

pub async fn health() -> &'static str {
    "OK"
}

/// GET /proxy/version
pub async fn version(State(state): State<ProxyState>) -> impl IntoResponse {
    axum::Json(serde_json::json!({
        "version": crate::config::VERSION,
        "commit": option_env!("PODCHILL_COMMIT").unwrap_or("unknown"),
        "build_date": option_env!("PODCHILL_BUILD_DATE").unwrap_or("unknown"),
        "public_endpoint": state.config.public_endpoint,
    }))
}

/// GET /proxy/stats
pub async fn stats(State(state): State<ProxyState>) -> impl IntoResponse {
    let snapshot = state.controller.snapshot().await;
    axum::Json(serde_json::json!({
        "state": snapshot,
        "uptime_seconds": state.started_at.elapsed().as_secs(),
    }))
}

/// GET /proxy/metrics - backend scrape concatenated with local metrics
pub async fn metrics(State(state): State<ProxyState>) -> Response<Body> {
    // Best-effort: a cold backend simply contributes nothing
    let backend = async {
        state
            .client
            .get(format!("{}/metrics", state.config.backend_url()))
            .timeout(std::time::Duration::from_secs(2))
            .send()
            .await
            .ok()?
            .text()
            .await
            .ok()
    }
    .await
    .unwrap_or_default();

    let mut body = backend;
    if !body.is_empty() && !body.ends_with('\n') {
        body.push('\n');
    }
    body.push_str(&state.metrics.gather());

    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "text/plain; version=0.0.4")
        .body(Body::from(body))
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}

/// GET /v1/models - registry list, OpenAI-shaped
pub async fn list_models(State(state): State<ProxyState>) -> Response<Body> {
    match state.registry.list().await {
        Ok(profiles) => {
            let ids: Vec<String> = profiles.iter().map(|p| p.id()).collect();
            axum::Json(models_list_body(&ids)).into_response()
        }
        Err(e) => ProxyError::Registry(e.to_string()).into_response(),
    }
}

fn models_list_body(ids: &[String]) -> serde_json::Value {
    let created = chrono::Utc::now().timestamp();
    serde_json::json!({
        "object": "list",
        "data": ids.iter().map(|id| serde_json::json!({
            "id": id,
            "object": "model",
            "created": created,
            "owned_by": "podchill",
        })).collect::<Vec<_>>(),
    })
}

// ============================================================================
// Chat Handlers
// ============================================================================

/// OpenAI passthrough path (catch-all)
pub async fn openai_handler(
    State(state): State<ProxyState>,
    req: Request<Body>,
) -> Response<Body> {
    let started = Instant::now();
    let (parts, body) = req.into_parts();
    let body_bytes = match axum::body::to_bytes(body, usize::MAX).await {
        Ok(bytes) => bytes,
        Err(e) => return ProxyError::BadRequest(e.to_string()).into_response(),
    };
    handle_request(state, parts, body_bytes, started, None).await
}

/// Anthropic Messages path: translate, then run the shared pipeline
pub async fn anthropic_handler(
    State(state): State<ProxyState>,
    req: Request<Body>,
) -> Response<Body> {
    let started = Instant::now();
    let (mut parts, body) = req.into_parts();
    let body_bytes = match axum::body::to_bytes(body, usize::MAX).await {
        Ok(bytes) => bytes,
        Err(e) => return ProxyError::BadRequest(e.to_string()).into_response(),
    };

    let opts = TranslateOptions {
        active_model: state.controller.active_model().await,
        max_tokens_cap: state.config.max_tokens_cap,
        context_prune_threshold: state.config.context_prune_threshold,
    };

    let (translated, ctx) = match request_translation::translate(&body_bytes, &opts) {
        Ok(result) => result,
        Err(e) => {
            state.metrics.record_translation_failure("anthropic_to_openai");
            let body = anthropic_error_body(
                StatusCode::BAD_REQUEST,
                &e.to_string(),
                "invalid_request_error",
            );
            return json_response(StatusCode::BAD_REQUEST, &body);
        }
    };

    // x-api-key -> Authorization: Bearer
    if let Some(key) = parts.headers.remove("x-api-key") {
        let bearer = format!("Bearer {}", key.to_str().unwrap_or_default());
        if let Ok(value) = HeaderValue::from_str(&bearer) {
            parts.headers.insert(header::AUTHORIZATION, value);
        }
    }

    // Path rewrite; the query string is dropped with the old URI
    parts.uri = axum::http::Uri::from_static("/v1/chat/completions");

    handle_request(state, parts, Bytes::from(translated), started, Some(ctx)).await
}

/// Shared pipeline after dialect entry
///
/// `anthropic` marks a request that already went through request
/// translation, which suppresses model re-extraction (the translator
/// pinned the model to the active id).
async fn handle_request(
    state: ProxyState,
    parts: Parts,
    body: Bytes,
    started: Instant,
    anthropic: Option<RequestContext>,
) -> Response<Body> {
    let path = parts.uri.path().to_string();
    let request_bytes = body.len();

    let requested_model = if anthropic.is_none() && path.starts_with("/v1") {
        extract_model(&body)
    } else {
        None
    };

    state.controller.update_activity().await;

    // Model switch decision
    if let Some(model) = &requested_model {
        let active = state.controller.active_model().await;
        if *model != active {
            match state.registry.contains(model).await {
                Ok(true) => {
                    if let Err(e) = state.controller.switch_model(model).await {
                        return record_and(
                            &state,
                            &path,
                            started,
                            request_bytes,
                            ProxyError::from(e).into_response(),
                        );
                    }
                }
                Ok(false) => {
                    let response = model_not_found_response(&state, model).await;
                    return record_and(&state, &path, started, request_bytes, response);
                }
                Err(e) => {
                    return record_and(
                        &state,
                        &path,
                        started,
                        request_bytes,
                        ProxyError::Registry(e.to_string()).into_response(),
                    );
                }
            }
        }
    }

    if let Err(e) = state.controller.ensure_ready().await {
        tracing::warn!("backend not ready for {}: {}", path, e);
        let response = not_ready_response(&path, &body, anthropic.as_ref(), &e);
        return record_and(&state, &path, started, request_bytes, response);
    }

    forward(state, parts, body, path, started, request_bytes, anthropic).await
}

/// Reverse-proxy the request to the backend
async fn forward(
    state: ProxyState,
    parts: Parts,
    body: Bytes,
    path: String,
    started: Instant,
    request_bytes: usize,
    anthropic: Option<RequestContext>,
) -> Response<Body> {
    let mut url = format!("{}{}", state.config.backend_url(), path);
    if anthropic.is_none() {
        if let Some(query) = parts.uri.query() {
            url = format!("{}?{}", url, query);
        }
    }

    let method = match reqwest::Method::from_bytes(parts.method.as_str().as_bytes()) {
        Ok(m) => m,
        Err(e) => {
            return record_and(
                &state,
                &path,
                started,
                request_bytes,
                ProxyError::BadRequest(format!("invalid method: {}", e)).into_response(),
            )
        }
    };

    let mut forward_req = state.client.request(method, &url).body(body.to_vec());
    for (key, value) in parts.headers.iter() {
        if SKIPPED_HEADERS.contains(&key.as_str()) {
            continue;
        }
        forward_req = forward_req.header(key.as_str(), value.as_bytes());
    }

    let backend_response = match forward_req.send().await {
        Ok(response) => response,
        Err(e) => {
            tracing::error!("backend transport error: {}", e);
            let response = if anthropic.is_some() {
                json_response(
                    StatusCode::BAD_GATEWAY,
                    &anthropic_error_body(StatusCode::BAD_GATEWAY, &e.to_string(), "upstream_error"),
                )
            } else {
                ProxyError::Upstream(e.to_string()).into_response()
            };
            return record_and(&state, &path, started, request_bytes, response);
        }
    };

    match anthropic {
        Some(ctx) => {
            anthropic_response(state, backend_response, ctx, path, started, request_bytes).await
        }
        None => passthrough_response(state, backend_response, path, started, request_bytes),
    }
}

/// Stream the backend response through the SSE post-processor
fn passthrough_response(
    state: ProxyState,
    backend_response: reqwest::Response,
    path: String,
    started: Instant,
    request_bytes: usize,
) -> Response<Body> {
    let status = backend_response.status();
    let mut builder = Response::builder().status(status.as_u16());
    for (key, value) in backend_response.headers().iter() {
        if SKIPPED_HEADERS.contains(&key.as_str()) {
            continue;
        }
        builder = builder.header(key.as_str(), value.as_bytes());
    }

    let recorder = ResponseRecorder::new(
        state.metrics.clone(),
        &path,
        status.as_u16(),
        started,
        request_bytes,
    );
    let postprocessor =
        SsePostProcessor::new(state.metrics.clone(), state.config.enable_xml_parsing);
    let body = Body::from_stream(ProcessedBody::new(
        Box::pin(backend_response.bytes_stream()),
        postprocessor,
        None,
        recorder,
    ));

    builder
        .body(body)
        .unwrap_or_else(|e| ProxyError::Internal(e.to_string()).into_response())
}

/// Anthropic-facing response: error envelope, streaming translation, or
/// buffered translation
async fn anthropic_response(
    state: ProxyState,
    backend_response: reqwest::Response,
    ctx: RequestContext,
    path: String,
    started: Instant,
    request_bytes: usize,
) -> Response<Body> {
    let status = backend_response.status();

    if status.as_u16() >= 400 {
        let bytes = backend_response.bytes().await.unwrap_or_default();
        let message = serde_json::from_slice::<serde_json::Value>(&bytes)
            .ok()
            .and_then(|v| {
                v.pointer("/error/message")
                    .and_then(|m| m.as_str())
                    .map(String::from)
            })
            .unwrap_or_else(|| String::from_utf8_lossy(&bytes).to_string());
        let axum_status =
            StatusCode::from_u16(status.as_u16()).unwrap_or(StatusCode::BAD_GATEWAY);
        let body = anthropic_error_body(axum_status, &message, "upstream_error");
        let response = json_response(axum_status, &body);
        return record_and(&state, &path, started, request_bytes, response);
    }

    if ctx.streaming {
        let recorder = ResponseRecorder::new(
            state.metrics.clone(),
            &path,
            status.as_u16(),
            started,
            request_bytes,
        );
        let postprocessor =
            SsePostProcessor::new(state.metrics.clone(), state.config.enable_xml_parsing);
        let translator = AnthropicStreamTranslator::new(&ctx);
        let body = Body::from_stream(ProcessedBody::new(
            Box::pin(backend_response.bytes_stream()),
            postprocessor,
            Some(translator),
            recorder,
        ));

        return Response::builder()
            .status(StatusCode::OK)
            .header(header::CONTENT_TYPE, "text/event-stream")
            .header(header::CACHE_CONTROL, "no-cache")
            .body(body)
            .unwrap_or_else(|e| ProxyError::Internal(e.to_string()).into_response());
    }

    // Buffered: translate the complete JSON body
    let bytes = match backend_response.bytes().await {
        Ok(bytes) => bytes,
        Err(e) => {
            let response = json_response(
                StatusCode::BAD_GATEWAY,
                &anthropic_error_body(StatusCode::BAD_GATEWAY, &e.to_string(), "upstream_error"),
            );
            return record_and(&state, &path, started, request_bytes, response);
        }
    };

    let response = match response_translation::translate(&bytes, &ctx) {
        Ok(translated) => Response::builder()
            .status(StatusCode::OK)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(translated))
            .unwrap_or_else(|e| ProxyError::Internal(e.to_string()).into_response()),
        Err(e) => {
            // Non-fatal: the caller gets the original dialect
            tracing::warn!("response translation failed, passing through: {}", e);
            state.metrics.record_translation_failure("openai_to_anthropic");
            Response::builder()
                .status(status.as_u16())
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(bytes))
                .unwrap_or_else(|e| ProxyError::Internal(e.to_string()).into_response())
        }
    };
    record_and(&state, &path, started, request_bytes, response)
}

// ============================================================================
// Short-circuit Responses
// ============================================================================

/// 404 with the registry contents, OpenAI-shaped
async fn model_not_found_response(state: &ProxyState, model: &str) -> Response<Body> {
    let ids = state
        .registry
        .list()
        .await
        .map(|profiles| profiles.iter().map(|p| p.id()).collect::<Vec<_>>())
        .unwrap_or_default();
    json_response(StatusCode::NOT_FOUND, &model_not_found_body(model, &ids))
}

fn model_not_found_body(model: &str, available: &[String]) -> serde_json::Value {
    serde_json::json!({
        "error": {
            "message": format!(
                "model {:?} is not configured; available models: {}",
                model,
                available.join(", ")
            ),
            "type": "not_found_error",
            "code": "model_not_found",
        },
        "available_models": models_list_body(available),
    })
}

/// Backend unavailable after the startup deadline
///
/// Chat completions get a readable "loading" completion so interactive
/// tools show something useful; everything else gets 503 + Retry-After.
fn not_ready_response(
    path: &str,
    body: &Bytes,
    anthropic: Option<&RequestContext>,
    error: &ActivationError,
) -> Response<Body> {
    if path != "/v1/chat/completions" {
        return ProxyError::from(error.clone()).into_response();
    }

    let model = anthropic
        .map(|ctx| ctx.original_model.clone())
        .or_else(|| extract_model(body))
        .unwrap_or_else(|| "model".to_string());
    let streaming = anthropic
        .map(|ctx| ctx.streaming)
        .unwrap_or_else(|| body_requests_streaming(body));

    match anthropic {
        Some(ctx) => loading_anthropic_response(&model, streaming, ctx),
        None => loading_openai_response(&model, streaming),
    }
}

fn loading_message(model: &str) -> String {
    format!(
        "{} is starting up. A cold start can take up to two minutes; \
         please retry your request shortly.",
        model
    )
}

fn loading_completion_json(model: &str) -> serde_json::Value {
    serde_json::json!({
        "id": "chatcmpl-loading",
        "object": "chat.completion",
        "created": chrono::Utc::now().timestamp(),
        "model": model,
        "choices": [{
            "index": 0,
            "message": {"role": "assistant", "content": loading_message(model)},
            "finish_reason": "stop",
        }],
        "usage": {"prompt_tokens": 0, "completion_tokens": 0, "total_tokens": 0},
    })
}

fn loading_completion_sse(model: &str) -> String {
    let make = |delta: serde_json::Value, finish: serde_json::Value| {
        serde_json::json!({
            "id": "chatcmpl-loading",
            "object": "chat.completion.chunk",
            "created": chrono::Utc::now().timestamp(),
            "model": model,
            "choices": [{"index": 0, "delta": delta, "finish_reason": finish}],
        })
    };
    format!(
        "data: {}\n\ndata: {}\n\ndata: {}\n\ndata: [DONE]\n\n",
        make(serde_json::json!({"role": "assistant"}), serde_json::Value::Null),
        make(
            serde_json::json!({"content": loading_message(model)}),
            serde_json::Value::Null
        ),
        make(serde_json::json!({}), serde_json::Value::from("stop")),
    )
}

fn loading_openai_response(model: &str, streaming: bool) -> Response<Body> {
    if streaming {
        Response::builder()
            .status(StatusCode::OK)
            .header(header::CONTENT_TYPE, "text/event-stream")
            .header(header::CACHE_CONTROL, "no-cache")
            .body(Body::from(loading_completion_sse(model)))
            .unwrap_or_else(|e| ProxyError::Internal(e.to_string()).into_response())
    } else {
        json_response(StatusCode::OK, &loading_completion_json(model))
    }
}

/// The loading completion translated into the Anthropic dialect
fn loading_anthropic_response(
    model: &str,
    streaming: bool,
    ctx: &RequestContext,
) -> Response<Body> {
    if streaming {
        let mut translator = AnthropicStreamTranslator::new(ctx);
        let mut bytes = translator.push(loading_completion_sse(model).as_bytes());
        bytes.extend(translator.finish());
        Response::builder()
            .status(StatusCode::OK)
            .header(header::CONTENT_TYPE, "text/event-stream")
            .header(header::CACHE_CONTROL, "no-cache")
            .body(Body::from(bytes))
            .unwrap_or_else(|e| ProxyError::Internal(e.to_string()).into_response())
    } else {
        let loading = loading_completion_json(model).to_string();
        match response_translation::translate(loading.as_bytes(), ctx) {
            Ok(translated) => Response::builder()
                .status(StatusCode::OK)
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(translated))
                .unwrap_or_else(|e| ProxyError::Internal(e.to_string()).into_response()),
            Err(e) => ProxyError::Internal(e.to_string()).into_response(),
        }
    }
}

// ============================================================================
// Helpers
// ============================================================================

/// Parse the model name out of a JSON request body; the bytes are reused
/// untouched for forwarding
fn extract_model(body: &Bytes) -> Option<String> {
    serde_json::from_slice::<serde_json::Value>(body)
        .ok()?
        .get("model")?
        .as_str()
        .map(String::from)
}

fn body_requests_streaming(body: &Bytes) -> bool {
    serde_json::from_slice::<serde_json::Value>(body)
        .ok()
        .and_then(|v| v.get("stream").and_then(|s| s.as_bool()))
        .unwrap_or(false)
}

fn json_response(status: StatusCode, body: &serde_json::Value) -> Response<Body> {
    Response::builder()
        .status(status)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap_or_else(|_| status.into_response())
}

/// Record the request metric for a short-circuit response and return it
fn record_and(
    state: &ProxyState,
    path: &str,
    started: Instant,
    request_bytes: usize,
    response: Response<Body>,
) -> Response<Body> {
    state.metrics.record_request(
        path,
        response.status().as_u16(),
        started.elapsed(),
        request_bytes,
        0,
    );
    response
}
