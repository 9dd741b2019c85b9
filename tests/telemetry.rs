#[path = "common/mod.rs"]
mod common;

use axum::body::Body;
use axum::http::Request;
use chatgate::{app, AppConfig};
use common::*;
use serde_json::{json, Value};
use std::fs;
use tower::ServiceExt;

fn config_logging_to(path: &std::path::Path) -> AppConfig {
    AppConfig {
        log_file: Some(path.to_string_lossy().to_string()),
        ..AppConfig::default()
    }
}

fn read_lines(path: &std::path::Path) -> Vec<Value> {
    fs::read_to_string(path)
        .expect("log file readable")
        .lines()
        .map(|l| serde_json::from_str(l).expect("line parses as JSON"))
        .collect()
}

#[tokio::test]
async fn telemetry_writes_jsonl_line_per_request() {
    let dir = tempfile::tempdir().unwrap();
    let log_path = dir.path().join("chat.jsonl");
    let state = state_with(config_logging_to(&log_path), FakeUpstream::text(&["ok"]));
    let app = app(state.clone());

    let mut body = valid_body();
    body["apiKey"] = json!("sk-very-secret-key");
    let req = Request::builder()
        .method("POST")
        .uri("/api/chat")
        .header("content-type", "application/json")
        .header("x-request-id", "req-42")
        .body(Body::from(serde_json::to_vec(&body).unwrap()))
        .unwrap();
    let resp = app.clone().oneshot(req).await.unwrap();
    assert!(resp.status().is_success());

    let mut bad = valid_body();
    bad["modelId"] = json!("gemini-2.5-pro");
    let resp = app.oneshot(chat_request(&bad)).await.unwrap();
    assert_eq!(resp.status().as_u16(), 400);

    let raw = fs::read_to_string(&log_path).unwrap();
    assert!(!raw.contains("sk-very-secret-key"), "api key leaked into telemetry");
    assert!(!raw.contains("hello"), "message content leaked into telemetry");

    let lines = read_lines(&log_path);
    assert_eq!(lines.len(), 2);
    let ok = &lines[0];
    for key in ["schemaVersion", "ts", "requestId", "status", "latencyMs", "imageRejections"] {
        assert!(ok.get(key).is_some(), "missing telemetry field {key}");
    }
    assert_eq!(ok["requestId"], "req-42");
    assert_eq!(ok["status"], 200);
    assert_eq!(ok["provider"], "openai");
    assert_eq!(ok["model"], "gpt-4o");
    assert!(ok.get("code").is_none());
    assert_eq!(ok["imageRejections"], json!([]));

    let rejected = &lines[1];
    assert_eq!(rejected["status"], 400);
    assert_eq!(rejected["code"], "invalid_model");
    assert_eq!(rejected["requestId"], "");
    assert!(rejected.get("model").is_none());

    assert_eq!(state.telemetry.lines_total(), 2);
    assert_eq!(state.telemetry.write_errors_total(), 0);
}

#[tokio::test]
async fn image_rejections_are_recorded_in_telemetry() {
    let dir = tempfile::tempdir().unwrap();
    let log_path = dir.path().join("chat.jsonl");
    let app = app(state_with(config_logging_to(&log_path), FakeUpstream::text(&["ok"])));

    let mut body = valid_body();
    body["messages"] = json!([{
        "role": "user",
        "content": [
            {"type": "text", "text": "what is this"},
            {"type": "image", "image": image_data_url("bmp", 30)}
        ]
    }]);
    let resp = app.oneshot(chat_request(&body)).await.unwrap();
    assert!(resp.status().is_success());

    let lines = read_lines(&log_path);
    let rejections = lines[0]["imageRejections"].as_array().unwrap();
    assert_eq!(rejections.len(), 1);
    assert_eq!(rejections[0]["reason"], "unsupported_mime_type");
    assert_eq!(rejections[0]["messageIndex"], 0);
}

#[tokio::test]
async fn unwritable_log_file_disables_telemetry() {
    let dir = tempfile::tempdir().unwrap();
    let log_path = dir.path().join("missing").join("chat.jsonl");
    let state = state_with(config_logging_to(&log_path), FakeUpstream::text(&["ok"]));
    assert!(!state.telemetry.is_enabled());

    let resp = app(state.clone())
        .oneshot(chat_request(&valid_body()))
        .await
        .unwrap();
    assert!(resp.status().is_success());
    assert_eq!(state.telemetry.lines_total(), 0);
}
