#[path = "common/mod.rs"]
mod common;

use axum::Router;
use bytes::Bytes;
use chatgate::{app, build_state_with_upstream, AppConfig};
use common::*;
use reqwest::{Client, StatusCode};
use tokio::net::TcpListener;
use tower::ServiceExt; // for oneshot

fn small_limit_config() -> AppConfig {
    AppConfig {
        max_request_bytes: 256,
        ..AppConfig::default()
    }
}

fn oversized_body() -> serde_json::Value {
    let mut body = valid_body();
    body["messages"][0]["content"] = serde_json::json!("X".repeat(2048));
    body
}

#[tokio::test]
async fn declared_length_over_limit_is_payload_too_large() {
    let upstream = FakeUpstream::text(&["x"]);
    let app = app(state_with(small_limit_config(), upstream.clone()));

    let resp = app.oneshot(chat_request(&oversized_body())).await.unwrap();
    assert_eq!(resp.status().as_u16(), 413);
    let json = body_json(resp).await;
    assert_eq!(json["code"], "payload_too_large");
    assert!(json["error"].as_str().unwrap().contains("256"));
    assert!(upstream.calls().is_empty());
}

#[tokio::test]
async fn chunked_payload_over_limit_returns_error_response() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let state = build_state_with_upstream(small_limit_config(), FakeUpstream::text(&["x"]));
    let app: Router = app(state);
    let handle = tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    let payload = oversized_body().to_string();
    let chunks: Vec<Result<Bytes, std::io::Error>> = payload
        .as_bytes()
        .chunks(128)
        .map(|c| Ok(Bytes::copy_from_slice(c)))
        .collect();
    let body = reqwest::Body::wrap_stream(futures::stream::iter(chunks));

    let resp = Client::new()
        .post(format!("http://{}/api/chat", addr))
        .header("content-type", "application/json")
        .body(body)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::PAYLOAD_TOO_LARGE);
    let json: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(json["code"], "payload_too_large");
    handle.abort();
}

#[tokio::test]
async fn body_under_limit_is_accepted() {
    let upstream = FakeUpstream::text(&["fine"]);
    let app = app(state_with(small_limit_config(), upstream));
    let resp = app.oneshot(chat_request(&valid_body())).await.unwrap();
    assert_eq!(resp.status().as_u16(), 200);
    assert_eq!(body_text(resp).await, "fine");
}
