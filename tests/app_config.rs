#[path = "common/mod.rs"]
mod common;

use chatgate::{build_state_from_env, AppConfig};
use common::EnvGuard;
use once_cell::sync::Lazy;
use std::sync::Mutex;

static ENV_MUTEX: Lazy<Mutex<()>> = Lazy::new(|| Mutex::new(()));

const CHATGATE_VARS: [&str; 11] = [
    "PORT",
    "CHATGATE_RATE_LIMIT",
    "CHATGATE_RATE_WINDOW_MS",
    "CHATGATE_RATE_SWEEP_MS",
    "CHATGATE_TRUSTED_IP_HEADERS",
    "CHATGATE_MAX_REQUEST_BYTES",
    "CHATGATE_INJECTION_AUDIT_ONLY",
    "CHATGATE_OPENAI_BASE_URL",
    "LOG_FILE",
    "LOG_ROTATE_COMPRESS",
    "LOG_MAX_BYTES",
];

fn clean_env() -> EnvGuard {
    let mut env = EnvGuard::new();
    for var in CHATGATE_VARS {
        env.remove(var);
    }
    env
}

#[test]
fn rejects_invalid_boolean_env_values() {
    let _guard = ENV_MUTEX.lock().unwrap();
    let mut env = clean_env();
    env.set("LOG_ROTATE_COMPRESS", "maybe");

    let err = AppConfig::from_env().expect_err("expected invalid boolean to error");
    assert!(format!("{}", err).contains("LOG_ROTATE_COMPRESS"));
}

#[test]
fn zero_rate_limit_fails_startup() {
    let _guard = ENV_MUTEX.lock().unwrap();
    let mut env = clean_env();
    env.set("CHATGATE_RATE_LIMIT", "0");

    assert!(build_state_from_env().is_err());
}

#[test]
fn unbounded_window_fails_startup_instead_of_disabling_limits() {
    let _guard = ENV_MUTEX.lock().unwrap();
    let mut env = clean_env();
    env.set("CHATGATE_RATE_WINDOW_MS", "18446744073709551615");

    let err = build_state_from_env().err().expect("oversized window must be rejected");
    assert!(err.to_string().contains("CHATGATE_RATE_WINDOW_MS"));
}

#[test]
fn zero_sweep_interval_and_bad_port_are_rejected() {
    let _guard = ENV_MUTEX.lock().unwrap();
    let mut env = clean_env();
    env.set("CHATGATE_RATE_SWEEP_MS", "0");
    let err = AppConfig::from_env().expect_err("zero sweep interval");
    assert!(err.to_string().contains("CHATGATE_RATE_SWEEP_MS"));

    env.remove("CHATGATE_RATE_SWEEP_MS");
    env.set("PORT", "eighty");
    let err = AppConfig::from_env().expect_err("non-numeric port");
    assert!(err.to_string().contains("PORT"));
}

#[test]
fn env_overrides_reach_app_state() {
    let _guard = ENV_MUTEX.lock().unwrap();
    let mut env = clean_env();
    env.set_many(&[
        ("PORT", "9090"),
        ("CHATGATE_RATE_LIMIT", "5"),
        ("CHATGATE_RATE_WINDOW_MS", "1000"),
        ("CHATGATE_TRUSTED_IP_HEADERS", "Fly-Client-IP"),
        ("CHATGATE_MAX_REQUEST_BYTES", "4096"),
        ("CHATGATE_INJECTION_AUDIT_ONLY", "yes"),
        ("CHATGATE_OPENAI_BASE_URL", "http://127.0.0.1:9/v1"),
    ]);

    let state = build_state_from_env().unwrap();
    let config = &state.config;
    assert_eq!(config.port, 9090);
    assert_eq!(config.rate_limit.limit, 5);
    assert_eq!(config.rate_limit.window_ms, 1000);
    assert_eq!(config.trusted_ip_headers, vec!["fly-client-ip".to_string()]);
    assert_eq!(config.max_request_bytes, 4096);
    assert!(config.injection_audit_only);
    assert_eq!(config.upstream.openai_base_url, "http://127.0.0.1:9/v1");
    assert!(!state.telemetry.is_enabled());
    assert!(state.rate_limiter.is_empty());
}
