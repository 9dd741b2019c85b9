//! Structural validation of the inbound chat request.
//!
//! Validation runs on the raw JSON value so that a malformed field is caught
//! before anything is destructured or iterated. A single bad message rejects
//! the whole request.

use serde_json::{Map, Value};

use crate::error::GatewayError;
use crate::ChatMessage;

/// Parse the raw body and require a JSON object at the top level.
pub fn parse_body(bytes: &[u8]) -> Result<Map<String, Value>, GatewayError> {
    match serde_json::from_slice::<Value>(bytes) {
        Ok(Value::Object(map)) => Ok(map),
        Ok(_) => Err(GatewayError::InvalidBody),
        Err(err) => {
            tracing::debug!(error = %err, "request body is not valid JSON");
            Err(GatewayError::InvalidJson)
        }
    }
}

/// True when `raw` has an accepted role, well-formed content and, if
/// present, a well-formed attachments array.
pub fn is_valid_message(raw: &Value) -> bool {
    check_message(raw).is_ok()
}

fn check_message(raw: &Value) -> Result<(), &'static str> {
    let obj = raw.as_object().ok_or("message must be an object")?;
    match obj.get("role").and_then(Value::as_str) {
        // The system role is never accepted from the client.
        Some("user") | Some("assistant") => {}
        _ => return Err("role must be 'user' or 'assistant'"),
    }
    match obj.get("content") {
        Some(Value::String(_)) => {}
        Some(Value::Array(parts)) => {
            if !parts.iter().all(is_valid_content_part) {
                return Err("content parts must be text or image parts");
            }
        }
        _ => return Err("content must be a string or an array of parts"),
    }
    if let Some(attachments) = obj.get("attachments") {
        let list = attachments
            .as_array()
            .ok_or("attachments must be an array")?;
        if !list.iter().all(is_valid_attachment) {
            return Err("attachments must have a string url");
        }
    }
    Ok(())
}

fn is_valid_content_part(part: &Value) -> bool {
    let Some(obj) = part.as_object() else {
        return false;
    };
    match obj.get("type").and_then(Value::as_str) {
        Some("text") => obj.get("text").is_some_and(Value::is_string),
        Some("image") => obj.get("image").is_some_and(Value::is_string),
        _ => false,
    }
}

fn is_valid_attachment(att: &Value) -> bool {
    let Some(obj) = att.as_object() else {
        return false;
    };
    let optional_string = |key: &str| obj.get(key).map_or(true, Value::is_string);
    obj.get("url").is_some_and(Value::is_string)
        && optional_string("name")
        && optional_string("contentType")
}

/// Validate the `messages` field and convert it into typed messages.
pub fn validate_messages(raw: Option<&Value>) -> Result<Vec<ChatMessage>, GatewayError> {
    let list = match raw {
        Some(Value::Array(list)) if !list.is_empty() => list,
        Some(Value::Array(_)) => {
            return Err(GatewayError::InvalidMessages(
                "messages must not be empty".into(),
            ))
        }
        _ => {
            return Err(GatewayError::InvalidMessages(
                "messages must be an array".into(),
            ))
        }
    };
    for (idx, message) in list.iter().enumerate() {
        if let Err(reason) = check_message(message) {
            return Err(GatewayError::InvalidMessages(format!(
                "messages[{idx}]: {reason}"
            )));
        }
    }
    list.iter()
        .map(|m| {
            serde_json::from_value::<ChatMessage>(m.clone())
                .map_err(|e| GatewayError::Internal(format!("validated message failed to decode: {e}")))
        })
        .collect()
}
