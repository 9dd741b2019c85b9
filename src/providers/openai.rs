//! OpenAI Responses API.

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::{json, Value};

use super::{Provider, ProviderSpec, StreamEvent, UpstreamCall};
use crate::admission::PreparedPart;
use crate::assembler::AssembledRequest;
use crate::Role;

pub const SPEC: ProviderSpec = ProviderSpec {
    provider: Provider::OpenAi,
    key_format: is_key,
    search_tool,
    build_call,
    parse_event,
};

static KEY_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^sk-[A-Za-z0-9_-]+$").unwrap());

fn is_key(key: &str) -> bool {
    KEY_RE.is_match(key)
}

fn search_tool() -> Value {
    json!({"type": "web_search"})
}

fn build_call(req: &AssembledRequest, base_url: &str, api_key: &str) -> UpstreamCall {
    let input: Vec<Value> = req
        .messages
        .iter()
        .map(|m| {
            let content: Vec<Value> = m
                .parts
                .iter()
                .map(|part| match (part, m.role) {
                    (PreparedPart::Text(text), Role::User) => {
                        json!({"type": "input_text", "text": text})
                    }
                    (PreparedPart::Text(text), Role::Assistant) => {
                        json!({"type": "output_text", "text": text})
                    }
                    (PreparedPart::Image(img), _) => {
                        json!({"type": "input_image", "image_url": img.upstream_data_url()})
                    }
                })
                .collect();
            json!({"role": m.role.as_str(), "content": content})
        })
        .collect();

    let mut body = json!({
        "model": req.model.id,
        "input": input,
        "stream": true,
    });
    if let Some(level) = req.reasoning {
        body["reasoning"] = json!({"effort": level.as_str()});
    }
    if let Some(tool) = &req.search_tool {
        body["tools"] = json!([tool]);
    }

    UpstreamCall {
        provider: Provider::OpenAi,
        url: format!("{}/responses", base_url.trim_end_matches('/')),
        headers: vec![("authorization", format!("Bearer {api_key}"))],
        body,
    }
}

fn parse_event(event: &Value) -> StreamEvent {
    match event.get("type").and_then(Value::as_str) {
        Some("response.output_text.delta") => event
            .get("delta")
            .and_then(Value::as_str)
            .map(|d| StreamEvent::Text(d.to_string()))
            .unwrap_or(StreamEvent::Skip),
        Some("error") => StreamEvent::Error(
            event
                .get("message")
                .or_else(|| event.pointer("/error/message"))
                .and_then(Value::as_str)
                .unwrap_or("stream error")
                .to_string(),
        ),
        Some("response.failed") => StreamEvent::Error(
            event
                .pointer("/response/error/message")
                .and_then(Value::as_str)
                .unwrap_or("response failed")
                .to_string(),
        ),
        _ => StreamEvent::Skip,
    }
}
