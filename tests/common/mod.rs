#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use axum::body::Body;
use axum::http::Request;
use axum::response::Response;
use chatgate::providers::UpstreamCall;
use chatgate::upstream::{StreamError, TextStream, Upstream};
use chatgate::{build_state_with_upstream, AppConfig, AppState, GatewayError};
use http_body_util::BodyExt;
use serde_json::{json, Value};

/// Tracks environment variable mutations and restores originals on drop.
pub struct EnvGuard {
    originals: HashMap<String, Option<String>>,
}

impl EnvGuard {
    pub fn new() -> Self {
        Self {
            originals: HashMap::new(),
        }
    }

    pub fn set(&mut self, key: &str, value: &str) {
        self.capture(key);
        std::env::set_var(key, value);
    }

    pub fn set_many(&mut self, entries: &[(&str, &str)]) {
        for (key, value) in entries {
            self.set(key, value);
        }
    }

    pub fn remove(&mut self, key: &str) {
        self.capture(key);
        std::env::remove_var(key);
    }

    fn capture(&mut self, key: &str) {
        if self.originals.contains_key(key) {
            return;
        }
        let original = std::env::var(key).ok();
        self.originals.insert(key.to_string(), original);
    }
}

impl Drop for EnvGuard {
    fn drop(&mut self) {
        for (key, original) in self.originals.drain() {
            match original {
                Some(value) => std::env::set_var(&key, value),
                None => std::env::remove_var(&key),
            }
        }
    }
}

/// In-process upstream that records every call and replies from a script.
pub struct FakeUpstream {
    calls: Mutex<Vec<UpstreamCall>>,
    reply: FakeReply,
}

pub enum FakeReply {
    Text(Vec<&'static str>),
    Fail(fn() -> GatewayError),
}

impl FakeUpstream {
    pub fn text(chunks: &[&'static str]) -> Arc<Self> {
        Arc::new(Self {
            calls: Mutex::new(Vec::new()),
            reply: FakeReply::Text(chunks.to_vec()),
        })
    }

    pub fn failing(make: fn() -> GatewayError) -> Arc<Self> {
        Arc::new(Self {
            calls: Mutex::new(Vec::new()),
            reply: FakeReply::Fail(make),
        })
    }

    pub fn calls(&self) -> Vec<UpstreamCall> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl Upstream for FakeUpstream {
    async fn send(&self, call: UpstreamCall) -> Result<TextStream, GatewayError> {
        self.calls.lock().unwrap().push(call);
        match &self.reply {
            FakeReply::Text(chunks) => {
                let items: Vec<Result<String, StreamError>> =
                    chunks.iter().map(|c| Ok(c.to_string())).collect();
                Ok(Box::pin(futures::stream::iter(items)))
            }
            FakeReply::Fail(make) => Err(make()),
        }
    }
}

pub fn state_with(config: AppConfig, upstream: Arc<FakeUpstream>) -> AppState {
    build_state_with_upstream(config, upstream)
}

pub fn valid_body() -> Value {
    json!({
        "provider": "openai",
        "modelId": "gpt-4o",
        "apiKey": "sk-test-123",
        "messages": [{"role": "user", "content": "hello"}]
    })
}

pub fn chat_request(body: &Value) -> Request<Body> {
    chat_request_from("203.0.113.7", body)
}

pub fn chat_request_from(client_ip: &str, body: &Value) -> Request<Body> {
    let bytes = serde_json::to_vec(body).unwrap();
    Request::builder()
        .method("POST")
        .uri("/api/chat")
        .header("content-type", "application/json")
        .header("x-forwarded-for", client_ip)
        .body(Body::from(bytes))
        .unwrap()
}

pub async fn body_bytes(resp: Response) -> Vec<u8> {
    resp.into_body().collect().await.unwrap().to_bytes().to_vec()
}

pub async fn body_json(resp: Response) -> Value {
    serde_json::from_slice(&body_bytes(resp).await).unwrap()
}

pub async fn body_text(resp: Response) -> String {
    String::from_utf8(body_bytes(resp).await).unwrap()
}

/// A `data:image/<subtype>;base64,` URL whose payload decodes to
/// `decoded_bytes` bytes. `decoded_bytes` must be a multiple of 3.
pub fn image_data_url(subtype: &str, decoded_bytes: usize) -> String {
    assert_eq!(decoded_bytes % 3, 0);
    format!(
        "data:image/{subtype};base64,{}",
        "QUJD".repeat(decoded_bytes / 3)
    )
}
