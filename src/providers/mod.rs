//! Provider registry.
//!
//! Everything that differs between upstream providers lives behind one
//! lookup: [`spec`] returns the key-format check, the search tool binding,
//! the request builder and the stream event parser for a provider. The
//! static [`MODELS`] table says which model ids exist and what they can do.

pub mod anthropic;
pub mod google;
pub mod openai;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::assembler::{AssembledRequest, ThinkingLevel};
use crate::error::GatewayError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    OpenAi,
    Anthropic,
    Google,
}

impl Provider {
    pub const ALL: [Provider; 3] = [Provider::OpenAi, Provider::Anthropic, Provider::Google];

    pub fn as_str(&self) -> &'static str {
        match self {
            Provider::OpenAi => "openai",
            Provider::Anthropic => "anthropic",
            Provider::Google => "google",
        }
    }

    /// Exact, case-sensitive match against the closed provider set.
    pub fn parse(name: &str) -> Option<Provider> {
        Provider::ALL.into_iter().find(|p| p.as_str() == name)
    }
}

impl std::fmt::Display for Provider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a model id supports. Read-only, compiled into the binary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelCapability {
    pub id: &'static str,
    pub provider: Provider,
    pub reasoning: bool,
    pub web_search: bool,
    pub vision: bool,
    /// Deepest thinking level the model accepts. `None` when `reasoning` is false.
    #[serde(rename = "maxThinkingLevel", skip_serializing_if = "Option::is_none")]
    pub max_thinking: Option<ThinkingLevel>,
}

const fn reasoning_model(
    id: &'static str,
    provider: Provider,
    max_thinking: ThinkingLevel,
) -> ModelCapability {
    ModelCapability {
        id,
        provider,
        reasoning: true,
        web_search: true,
        vision: true,
        max_thinking: Some(max_thinking),
    }
}

const fn plain_model(id: &'static str, provider: Provider) -> ModelCapability {
    ModelCapability {
        id,
        provider,
        reasoning: false,
        web_search: true,
        vision: true,
        max_thinking: None,
    }
}

// OpenAI effort tops out at `high` for these models; gemini-2.5-flash caps
// its thinking budget at 24576 tokens.
pub static MODELS: &[ModelCapability] = &[
    reasoning_model("gpt-5.1", Provider::OpenAi, ThinkingLevel::High),
    reasoning_model("gpt-5", Provider::OpenAi, ThinkingLevel::High),
    reasoning_model("gpt-5-mini", Provider::OpenAi, ThinkingLevel::High),
    plain_model("gpt-4.1", Provider::OpenAi),
    plain_model("gpt-4o", Provider::OpenAi),
    reasoning_model("claude-opus-4-5-20251101", Provider::Anthropic, ThinkingLevel::XHigh),
    reasoning_model("claude-sonnet-4-5-20250929", Provider::Anthropic, ThinkingLevel::XHigh),
    reasoning_model("claude-haiku-4-5-20251001", Provider::Anthropic, ThinkingLevel::XHigh),
    reasoning_model("gemini-3-pro-preview", Provider::Google, ThinkingLevel::XHigh),
    reasoning_model("gemini-2.5-pro", Provider::Google, ThinkingLevel::XHigh),
    reasoning_model("gemini-2.5-flash", Provider::Google, ThinkingLevel::High),
    plain_model("gemini-2.0-flash", Provider::Google),
];

pub fn find_model(id: &str) -> Option<&'static ModelCapability> {
    MODELS.iter().find(|m| m.id == id)
}

/// One parsed upstream stream event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEvent {
    Text(String),
    Error(String),
    Skip,
}

/// A fully-built upstream HTTP request.
#[derive(Debug, Clone, PartialEq)]
pub struct UpstreamCall {
    pub provider: Provider,
    pub url: String,
    pub headers: Vec<(&'static str, String)>,
    pub body: Value,
}

/// Per-provider behaviour, resolved through [`spec`].
pub struct ProviderSpec {
    pub provider: Provider,
    /// Provider-specific key check, applied after the generic gate.
    pub key_format: fn(&str) -> bool,
    pub search_tool: fn() -> Value,
    pub build_call: fn(&AssembledRequest, &str, &str) -> UpstreamCall,
    pub parse_event: fn(&Value) -> StreamEvent,
}

static SPECS: [ProviderSpec; 3] = [openai::SPEC, anthropic::SPEC, google::SPEC];

pub fn spec(provider: Provider) -> &'static ProviderSpec {
    match provider {
        Provider::OpenAi => &SPECS[0],
        Provider::Anthropic => &SPECS[1],
        Provider::Google => &SPECS[2],
    }
}

pub fn is_valid_provider(name: &str) -> bool {
    Provider::parse(name).is_some()
}

pub const MAX_API_KEY_LEN: usize = 256;

/// Provider-independent first gate: non-empty and bounded.
pub fn is_plausible_api_key(key: &str) -> bool {
    let trimmed = key.trim();
    !trimmed.is_empty() && trimmed.chars().count() <= MAX_API_KEY_LEN
}

pub fn is_valid_api_key_format(provider: Provider, key: &str) -> bool {
    is_plausible_api_key(key) && (spec(provider).key_format)(key.trim())
}

/// The model must exist and be registered under the requested provider.
pub fn validate_model(
    provider: Provider,
    model_id: &str,
) -> Result<&'static ModelCapability, GatewayError> {
    match find_model(model_id) {
        Some(cap) if cap.provider == provider => Ok(cap),
        _ => Err(GatewayError::InvalidModel {
            model: model_id.to_string(),
            provider: provider.to_string(),
        }),
    }
}

/// Validated provider, model and key taken from the request body.
#[derive(Debug, Clone)]
pub struct Credentials {
    pub provider: Provider,
    pub model: &'static ModelCapability,
    pub api_key: String,
}

/// Check `provider`, `modelId` and `apiKey` of a parsed body, in that order.
pub fn validate_credentials(body: &Map<String, Value>) -> Result<Credentials, GatewayError> {
    let provider = body
        .get("provider")
        .and_then(Value::as_str)
        .and_then(Provider::parse)
        .ok_or(GatewayError::InvalidProvider)?;

    let model_id = body
        .get("modelId")
        .and_then(Value::as_str)
        .filter(|s| !s.trim().is_empty())
        .ok_or(GatewayError::MissingField("modelId"))?;
    let model = validate_model(provider, model_id)?;

    let api_key = match body.get("apiKey").and_then(Value::as_str) {
        Some(k) if !k.trim().is_empty() => k,
        _ => return Err(GatewayError::MissingApiKey),
    };
    if !is_valid_api_key_format(provider, api_key) {
        return Err(GatewayError::InvalidApiKeyFormat);
    }
    Ok(Credentials {
        provider,
        model,
        api_key: api_key.trim().to_string(),
    })
}
