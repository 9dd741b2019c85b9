//! Turns validated, admitted messages into a provider-ready request.

use serde::Serialize;
use serde_json::Value;

use crate::admission::{PreparedMessage, PreparedPart};
use crate::config::UpstreamConfig;
use crate::providers::{self, ModelCapability, Provider, UpstreamCall};

/// Requested reasoning depth. Anything unrecognised falls back to `Medium`.
/// Variants are ordered shallow to deep.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ThinkingLevel {
    #[default]
    Medium,
    High,
    XHigh,
}

impl ThinkingLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            ThinkingLevel::Medium => "medium",
            ThinkingLevel::High => "high",
            ThinkingLevel::XHigh => "xhigh",
        }
    }

    /// Token budget for providers that size reasoning in tokens.
    pub fn budget_tokens(&self) -> u32 {
        match self {
            ThinkingLevel::Medium => 8_192,
            ThinkingLevel::High => 16_384,
            ThinkingLevel::XHigh => 32_768,
        }
    }

    /// Lenient parse of the client's `thinkingLevel` field.
    pub fn from_hint(hint: Option<&Value>) -> ThinkingLevel {
        match hint {
            None | Some(Value::Null) => ThinkingLevel::Medium,
            Some(Value::String(s)) if s == "medium" => ThinkingLevel::Medium,
            Some(Value::String(s)) if s == "high" => ThinkingLevel::High,
            Some(Value::String(s)) if s == "xhigh" => ThinkingLevel::XHigh,
            Some(other) => {
                tracing::debug!(hint = %other, "unrecognised thinking level; using medium");
                ThinkingLevel::Medium
            }
        }
    }
}

/// Everything a provider body builder needs.
#[derive(Debug, Clone)]
pub struct AssembledRequest {
    pub provider: Provider,
    pub model: &'static ModelCapability,
    pub messages: Vec<PreparedMessage>,
    /// Set only for reasoning-capable models.
    pub reasoning: Option<ThinkingLevel>,
    /// Provider search tool, set only when requested and supported.
    pub search_tool: Option<Value>,
}

/// Options read from the request body beside the messages.
#[derive(Debug, Clone, Default)]
pub struct RequestOptions {
    pub thinking_level: Option<Value>,
    pub web_search: bool,
}

impl RequestOptions {
    pub fn from_body(body: &serde_json::Map<String, Value>) -> Self {
        Self {
            thinking_level: body.get("thinkingLevel").cloned(),
            // `webSearch` is accepted as an alias.
            web_search: ["webSearchEnabled", "webSearch"]
                .iter()
                .find_map(|key| body.get(*key).and_then(Value::as_bool))
                .unwrap_or(false),
        }
    }
}

pub fn assemble(
    model: &'static ModelCapability,
    mut messages: Vec<PreparedMessage>,
    options: &RequestOptions,
) -> AssembledRequest {
    let provider = model.provider;

    let reasoning = if model.reasoning {
        let requested = ThinkingLevel::from_hint(options.thinking_level.as_ref());
        let ceiling = model.max_thinking.unwrap_or(ThinkingLevel::XHigh);
        if requested > ceiling {
            tracing::debug!(
                model = model.id,
                requested = requested.as_str(),
                applied = ceiling.as_str(),
                "thinking level clamped to model ceiling"
            );
        }
        Some(requested.min(ceiling))
    } else {
        if options.thinking_level.is_some() {
            tracing::debug!(model = model.id, "model has no reasoning support; ignoring thinking level");
        }
        None
    };

    let search_tool = if options.web_search && model.web_search {
        Some((providers::spec(provider).search_tool)())
    } else {
        None
    };

    if !model.vision {
        let mut dropped = 0usize;
        for message in &mut messages {
            let before = message.parts.len();
            message
                .parts
                .retain(|p| matches!(p, PreparedPart::Text(_)));
            dropped += before - message.parts.len();
            if message.parts.is_empty() {
                message.parts.push(PreparedPart::Text(String::new()));
            }
        }
        if dropped > 0 {
            tracing::debug!(model = model.id, dropped, "model has no vision support; images omitted");
        }
    }

    AssembledRequest {
        provider,
        model,
        messages,
        reasoning,
        search_tool,
    }
}

/// Build the provider HTTP call for an assembled request.
pub fn build_call(request: &AssembledRequest, upstream: &UpstreamConfig, api_key: &str) -> UpstreamCall {
    let spec = providers::spec(request.provider);
    (spec.build_call)(request, upstream.base_url(request.provider), api_key)
}
