//! Google Gemini `streamGenerateContent`.

use serde_json::{json, Value};

use super::{Provider, ProviderSpec, StreamEvent, UpstreamCall};
use crate::admission::PreparedPart;
use crate::assembler::AssembledRequest;
use crate::Role;

pub const SPEC: ProviderSpec = ProviderSpec {
    provider: Provider::Google,
    key_format: any_key,
    search_tool,
    build_call,
    parse_event,
};

// Google key formats vary; the generic gate is the only check.
fn any_key(_key: &str) -> bool {
    true
}

fn search_tool() -> Value {
    json!({"google_search": {}})
}

fn build_call(req: &AssembledRequest, base_url: &str, api_key: &str) -> UpstreamCall {
    let contents: Vec<Value> = req
        .messages
        .iter()
        .map(|m| {
            let role = match m.role {
                Role::User => "user",
                Role::Assistant => "model",
            };
            let parts: Vec<Value> = m
                .parts
                .iter()
                .map(|part| match part {
                    PreparedPart::Text(text) => json!({"text": text}),
                    PreparedPart::Image(img) => json!({
                        "inline_data": {
                            "mime_type": img.upstream_mime_type(),
                            "data": img.base64(),
                        }
                    }),
                })
                .collect();
            json!({"role": role, "parts": parts})
        })
        .collect();

    let mut body = json!({ "contents": contents });
    if let Some(level) = req.reasoning {
        body["generationConfig"] = json!({
            "thinkingConfig": {"thinkingBudget": level.budget_tokens()}
        });
    }
    if let Some(tool) = &req.search_tool {
        body["tools"] = json!([tool]);
    }

    UpstreamCall {
        provider: Provider::Google,
        url: format!(
            "{}/models/{}:streamGenerateContent?alt=sse",
            base_url.trim_end_matches('/'),
            req.model.id
        ),
        headers: vec![("x-goog-api-key", api_key.to_string())],
        body,
    }
}

fn parse_event(event: &Value) -> StreamEvent {
    if let Some(err) = event.get("error") {
        return StreamEvent::Error(
            err.get("message")
                .and_then(Value::as_str)
                .unwrap_or("stream error")
                .to_string(),
        );
    }
    let Some(parts) = event
        .pointer("/candidates/0/content/parts")
        .and_then(Value::as_array)
    else {
        return StreamEvent::Skip;
    };
    let text: String = parts
        .iter()
        .filter(|p| !p.get("thought").and_then(Value::as_bool).unwrap_or(false))
        .filter_map(|p| p.get("text").and_then(Value::as_str))
        .collect();
    if text.is_empty() {
        StreamEvent::Skip
    } else {
        StreamEvent::Text(text)
    }
}
