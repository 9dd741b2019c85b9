//! Gateway error taxonomy and its HTTP mapping.

use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;

/// Every way a chat request can be refused before or while reaching the
/// upstream provider. Per-image admission failures are not errors; they are
/// reported as [`crate::admission::ImageRejection`] records instead.
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("Invalid JSON in request body")]
    InvalidJson,

    #[error("Request body must be a JSON object")]
    InvalidBody,

    #[error("Missing or invalid field: {0}")]
    MissingField(&'static str),

    #[error("Invalid messages: {0}")]
    InvalidMessages(String),

    #[error("Invalid provider")]
    InvalidProvider,

    #[error("Invalid model '{model}' for provider '{provider}'")]
    InvalidModel { model: String, provider: String },

    #[error("API key is required")]
    MissingApiKey,

    #[error("Invalid API key format")]
    InvalidApiKeyFormat,

    #[error("Message contains disallowed content")]
    DisallowedContent,

    #[error("Request too large (body exceeded limit {limit} bytes)")]
    PayloadTooLarge { limit: usize },

    #[error("Too many requests. Please try again later.")]
    RateLimited { retry_after_secs: u64 },

    #[error("Invalid API key")]
    UpstreamUnauthorized,

    #[error("Provider rate limit exceeded. Please try again later.")]
    UpstreamRateLimited { retry_after_secs: Option<u64> },

    #[error("{message}")]
    Upstream { status: u16, message: String },

    #[error("Upstream provider unavailable")]
    UpstreamUnavailable(String),

    #[error("Internal server error")]
    Internal(String),
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorBody {
    pub error: String,
    pub code: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after: Option<u64>,
}

impl GatewayError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::InvalidJson
            | Self::InvalidBody
            | Self::MissingField(_)
            | Self::InvalidMessages(_)
            | Self::InvalidProvider
            | Self::InvalidModel { .. }
            | Self::DisallowedContent => StatusCode::BAD_REQUEST,
            Self::MissingApiKey | Self::InvalidApiKeyFormat | Self::UpstreamUnauthorized => {
                StatusCode::UNAUTHORIZED
            }
            Self::PayloadTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            Self::RateLimited { .. } | Self::UpstreamRateLimited { .. } => {
                StatusCode::TOO_MANY_REQUESTS
            }
            Self::Upstream { status, .. } => {
                StatusCode::from_u16(*status).unwrap_or(StatusCode::BAD_GATEWAY)
            }
            Self::UpstreamUnavailable(_) => StatusCode::BAD_GATEWAY,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Stable machine-readable reason, also used as the metrics label.
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidJson => "invalid_json",
            Self::InvalidBody => "invalid_body",
            Self::MissingField(_) => "missing_field",
            Self::InvalidMessages(_) => "invalid_messages",
            Self::InvalidProvider => "invalid_provider",
            Self::InvalidModel { .. } => "invalid_model",
            Self::MissingApiKey => "missing_api_key",
            Self::InvalidApiKeyFormat => "invalid_api_key_format",
            Self::DisallowedContent => "disallowed_content",
            Self::PayloadTooLarge { .. } => "payload_too_large",
            Self::RateLimited { .. } => "rate_limited",
            Self::UpstreamUnauthorized => "invalid_api_key",
            Self::UpstreamRateLimited { .. } => "upstream_rate_limited",
            Self::Upstream { .. } => "upstream_error",
            Self::UpstreamUnavailable(_) => "upstream_unavailable",
            Self::Internal(_) => "internal_error",
        }
    }

    pub fn retry_after_secs(&self) -> Option<u64> {
        match self {
            Self::RateLimited { retry_after_secs } => Some(*retry_after_secs),
            Self::UpstreamRateLimited { retry_after_secs } => *retry_after_secs,
            _ => None,
        }
    }

    /// All metric labels, in exposition order.
    pub const CODES: [&'static str; 16] = [
        "invalid_json",
        "invalid_body",
        "missing_field",
        "invalid_messages",
        "invalid_provider",
        "invalid_model",
        "missing_api_key",
        "invalid_api_key_format",
        "disallowed_content",
        "payload_too_large",
        "rate_limited",
        "invalid_api_key",
        "upstream_rate_limited",
        "upstream_error",
        "upstream_unavailable",
        "internal_error",
    ];
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        match &self {
            Self::Internal(detail) => {
                tracing::error!(error = %detail, "unhandled gateway error");
            }
            Self::UpstreamUnavailable(detail) => {
                tracing::warn!(error = %detail, "upstream request failed");
            }
            _ => {}
        }
        let retry_after = self.retry_after_secs();
        let body = ErrorBody {
            error: self.to_string(),
            code: self.code(),
            retry_after,
        };
        let mut response = (status, Json(body)).into_response();
        if let Some(secs) = retry_after {
            response
                .headers_mut()
                .insert(header::RETRY_AFTER, HeaderValue::from(secs));
        }
        response
    }
}
