//! Core library for chatgate.  This module defines the chat wire types,
//! the shared application state and the HTTP handlers that run a request
//! through rate limiting, validation, screening and image admission before
//! streaming the reply from the selected upstream provider.

pub mod admission;
pub mod assembler;
pub mod config;
pub mod error;
pub mod metrics;
pub mod providers;
pub mod rate_limit;
pub mod sanitize;
pub mod telemetry;
pub mod upstream;
pub mod validation;

pub use config::AppConfig;
pub use error::GatewayError;

use std::any::Any;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::body::{Body, Bytes};
use axum::extract::rejection::{BytesRejection, FailedToBufferBody};
use axum::extract::{DefaultBodyLimit, State};
use axum::http::{header, HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use tower_http::catch_panic::CatchPanicLayer;

use crate::admission::{prepare_messages, ImageRejection};
use crate::assembler::{assemble, build_call, RequestOptions};
use crate::metrics::Metrics;
use crate::providers::{validate_credentials, Provider, MODELS};
use crate::rate_limit::{client_identifier, now_ms, RateLimitResult, RateLimiter};
use crate::telemetry::{TelemetryEvent, TelemetrySink, SCHEMA_VERSION};
use crate::upstream::{HttpUpstream, TextStream, Upstream};
use crate::validation::{parse_body, validate_messages};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    Parts(Vec<ContentPart>),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ContentPart {
    Text { text: String },
    /// `image` is a data URL.
    Image { image: String },
}

/// Legacy attachment record sent beside the message content.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attachment {
    pub name: Option<String>,
    #[serde(rename = "contentType")]
    pub content_type: Option<String>,
    pub url: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: MessageContent,
    #[serde(default)]
    pub attachments: Vec<Attachment>,
}

/// Shared across handlers.  Cloning is cheap; everything mutable sits
/// behind an `Arc`.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub rate_limiter: Arc<RateLimiter>,
    pub upstream: Arc<dyn Upstream>,
    pub telemetry: TelemetrySink,
    pub metrics: Arc<Metrics>,
}

/// Build state with an explicit upstream implementation.
pub fn build_state_with_upstream(config: AppConfig, upstream: Arc<dyn Upstream>) -> AppState {
    let telemetry = TelemetrySink::from_config(
        config.log_file.as_deref(),
        &config.rotation,
        config.log_stdout,
    );
    AppState {
        config: Arc::new(config),
        rate_limiter: Arc::new(RateLimiter::new()),
        upstream,
        telemetry,
        metrics: Arc::new(Metrics::new()),
    }
}

/// Build state backed by the real HTTP upstream.
pub fn build_state(config: AppConfig) -> anyhow::Result<AppState> {
    let upstream = HttpUpstream::new(Duration::from_millis(config.upstream.connect_timeout_ms))?;
    Ok(build_state_with_upstream(config, Arc::new(upstream)))
}

/// Build state from environment variables.  See [`AppConfig::from_env`] for
/// the variables read.
pub fn build_state_from_env() -> anyhow::Result<AppState> {
    build_state(AppConfig::from_env()?)
}

/// Build the Axum router and attach handlers.
pub fn app(state: AppState) -> Router {
    let max_request_bytes = state.config.max_request_bytes;
    Router::new()
        .route("/api/chat", post(chat_handler))
        .route("/api/models", get(models_handler))
        .route("/healthz", get(healthz_handler))
        .route("/metrics", get(metrics_handler))
        .layer(DefaultBodyLimit::max(max_request_bytes))
        .layer(CatchPanicLayer::custom(panic_response))
        .with_state(state)
}

/// Outermost boundary: a panic anywhere below becomes a generic 500. The
/// panic message is logged, never returned.
fn panic_response(panic: Box<dyn Any + Send + 'static>) -> Response {
    let detail = if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else {
        "unknown panic payload".to_string()
    };
    GatewayError::Internal(format!("handler panicked: {detail}")).into_response()
}

/// What the chat pipeline learned about a request, success or not.
#[derive(Debug, Default)]
struct RequestTrace {
    provider: Option<Provider>,
    model: Option<&'static str>,
    image_rejections: Vec<ImageRejection>,
}

/// A request that made it upstream.
pub struct ChatReply {
    pub stream: TextStream,
    pub rate: RateLimitResult,
    pub limit: u32,
    pub image_rejections: usize,
}

impl IntoResponse for ChatReply {
    fn into_response(self) -> Response {
        let body = Body::from_stream(self.stream.map(|item| item.map(Bytes::from)));
        let mut response = (StatusCode::OK, body).into_response();
        let headers = response.headers_mut();
        headers.insert(
            header::CONTENT_TYPE,
            HeaderValue::from_static("text/plain; charset=utf-8"),
        );
        headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-cache"));
        headers.insert("x-ratelimit-limit", HeaderValue::from(self.limit));
        headers.insert("x-ratelimit-remaining", HeaderValue::from(self.rate.remaining));
        headers.insert("x-ratelimit-reset", HeaderValue::from(self.rate.reset_time));
        headers.insert(
            "x-image-rejections",
            HeaderValue::from(self.image_rejections as u64),
        );
        response
    }
}

/// Handler for `POST /api/chat`.
async fn chat_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Result<Bytes, BytesRejection>,
) -> Response {
    let started = Instant::now();
    state.metrics.record_request();
    let mut trace = RequestTrace::default();

    let result = run_chat(&state, &headers, body, &mut trace).await;

    let latency_ms = started.elapsed().as_millis() as u64;
    let (status, code, response) = match result {
        Ok(reply) => {
            state.metrics.observe_latency(latency_ms);
            (StatusCode::OK, None, reply.into_response())
        }
        Err(err) => {
            state.metrics.record_rejection(err.code());
            (err.status_code(), Some(err.code()), err.into_response())
        }
    };

    let request_id = headers
        .get("x-request-id")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    state.telemetry.emit(&TelemetryEvent {
        schema_version: SCHEMA_VERSION,
        ts: chrono::Utc::now().to_rfc3339(),
        request_id,
        status: status.as_u16(),
        code,
        provider: trace.provider.map(|p| p.as_str()),
        model: trace.model,
        latency_ms,
        image_rejections: &trace.image_rejections,
    });
    response
}

/// The gateway pipeline.  Stages run in a fixed order and the first failure
/// decides the response.
async fn run_chat(
    state: &AppState,
    headers: &HeaderMap,
    body: Result<Bytes, BytesRejection>,
    trace: &mut RequestTrace,
) -> Result<ChatReply, GatewayError> {
    let config = &state.config;

    let client = client_identifier(headers, &config.trusted_ip_headers);
    let rate = state.rate_limiter.check(&client, config.rate_limit);
    if !rate.success {
        let retry_after_secs = rate.retry_after_secs(now_ms());
        tracing::warn!(client = %client, retry_after_secs, "rate limit exceeded");
        return Err(GatewayError::RateLimited { retry_after_secs });
    }

    let bytes = body.map_err(|rejection| body_rejection(rejection, config.max_request_bytes))?;
    let body = parse_body(&bytes)?;

    let creds = validate_credentials(&body).map_err(|err| {
        tracing::info!(client = %client, code = err.code(), "request rejected: {err}");
        err
    })?;
    trace.provider = Some(creds.provider);
    trace.model = Some(creds.model.id);

    let messages = validate_messages(body.get("messages")).map_err(|err| {
        tracing::info!(provider = %creds.provider, model = creds.model.id, code = err.code(), "request rejected: {err}");
        err
    })?;

    if let Some(hit) = sanitize::find_injection(&messages) {
        state.metrics.record_injection_hit();
        tracing::warn!(
            client = %client,
            provider = %creds.provider,
            model = creds.model.id,
            message_index = hit.message_index,
            pattern = hit.pattern,
            audit_only = config.injection_audit_only,
            "prompt injection pattern in user message"
        );
        if !config.injection_audit_only {
            return Err(GatewayError::DisallowedContent);
        }
    }

    let admitted = prepare_messages(messages);
    state
        .metrics
        .record_images(admitted.state.image_count, &admitted.rejections);
    trace.image_rejections = admitted.rejections;

    let options = RequestOptions::from_body(&body);
    let request = assemble(creds.model, admitted.messages, &options);
    let call = build_call(&request, &config.upstream, &creds.api_key);

    let stream = state.upstream.send(call).await.map_err(|err| {
        state.metrics.record_upstream_error();
        tracing::warn!(provider = %creds.provider, model = creds.model.id, code = err.code(), "upstream call failed: {err}");
        err
    })?;

    Ok(ChatReply {
        stream,
        rate,
        limit: config.rate_limit.limit,
        image_rejections: trace.image_rejections.len(),
    })
}

fn body_rejection(rejection: BytesRejection, limit: usize) -> GatewayError {
    match rejection {
        BytesRejection::FailedToBufferBody(FailedToBufferBody::LengthLimitError(_)) => {
            tracing::warn!(limit, "request body exceeded configured limit");
            GatewayError::PayloadTooLarge { limit }
        }
        other => {
            tracing::info!(error = %other, "failed to read request body");
            GatewayError::InvalidJson
        }
    }
}

/// Handler for `GET /api/models`.
async fn models_handler() -> Response {
    (StatusCode::OK, Json(MODELS)).into_response()
}

/// Health endpoint for container readiness / liveness checks.
async fn healthz_handler(State(state): State<AppState>) -> Response {
    let json = serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "models": MODELS.len(),
        "trackedClients": state.rate_limiter.len(),
    });
    (StatusCode::OK, Json(json)).into_response()
}

/// Prometheus-style metrics exposition.
async fn metrics_handler(State(state): State<AppState>) -> Response {
    let body = state
        .metrics
        .render(&state.telemetry, state.rate_limiter.len());
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        body,
    )
        .into_response()
}
