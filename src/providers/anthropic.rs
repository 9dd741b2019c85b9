//! Anthropic Messages API.

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::{json, Value};

use super::{Provider, ProviderSpec, StreamEvent, UpstreamCall};
use crate::admission::PreparedPart;
use crate::assembler::AssembledRequest;

pub const SPEC: ProviderSpec = ProviderSpec {
    provider: Provider::Anthropic,
    key_format: is_key,
    search_tool,
    build_call,
    parse_event,
};

pub const API_VERSION: &str = "2023-06-01";
/// Output tokens requested on top of any thinking budget.
pub const MAX_OUTPUT_TOKENS: u32 = 8_192;

static KEY_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^sk-ant-[A-Za-z0-9_-]+$").unwrap());

fn is_key(key: &str) -> bool {
    KEY_RE.is_match(key)
}

fn search_tool() -> Value {
    json!({"type": "web_search_20250305", "name": "web_search", "max_uses": 5})
}

fn build_call(req: &AssembledRequest, base_url: &str, api_key: &str) -> UpstreamCall {
    let messages: Vec<Value> = req
        .messages
        .iter()
        .map(|m| {
            let content: Vec<Value> = m
                .parts
                .iter()
                .map(|part| match part {
                    PreparedPart::Text(text) => json!({"type": "text", "text": text}),
                    PreparedPart::Image(img) => json!({
                        "type": "image",
                        "source": {
                            "type": "base64",
                            "media_type": img.upstream_mime_type(),
                            "data": img.base64(),
                        }
                    }),
                })
                .collect();
            json!({"role": m.role.as_str(), "content": content})
        })
        .collect();

    let mut max_tokens = MAX_OUTPUT_TOKENS;
    let mut body = json!({
        "model": req.model.id,
        "messages": messages,
        "stream": true,
    });
    if let Some(level) = req.reasoning {
        let budget = level.budget_tokens();
        max_tokens += budget;
        body["thinking"] = json!({"type": "enabled", "budget_tokens": budget});
    }
    body["max_tokens"] = json!(max_tokens);
    if let Some(tool) = &req.search_tool {
        body["tools"] = json!([tool]);
    }

    UpstreamCall {
        provider: Provider::Anthropic,
        url: format!("{}/messages", base_url.trim_end_matches('/')),
        headers: vec![
            ("x-api-key", api_key.to_string()),
            ("anthropic-version", API_VERSION.to_string()),
        ],
        body,
    }
}

fn parse_event(event: &Value) -> StreamEvent {
    match event.get("type").and_then(Value::as_str) {
        Some("content_block_delta") => {
            let delta = event.get("delta");
            let is_text = delta
                .and_then(|d| d.get("type"))
                .and_then(Value::as_str)
                == Some("text_delta");
            match delta.and_then(|d| d.get("text")).and_then(Value::as_str) {
                Some(text) if is_text => StreamEvent::Text(text.to_string()),
                _ => StreamEvent::Skip,
            }
        }
        Some("error") => StreamEvent::Error(
            event
                .pointer("/error/message")
                .and_then(Value::as_str)
                .unwrap_or("stream error")
                .to_string(),
        ),
        _ => StreamEvent::Skip,
    }
}
