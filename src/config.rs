use std::env;

use anyhow::{anyhow, Result};

use crate::providers::Provider;
use crate::rate_limit::RateLimitConfig;

/// Longest accepted rate-limit window. Keeps `now + window` well inside `i64`.
pub const MAX_RATE_WINDOW_MS: u64 = i64::MAX as u64 / 2;
pub const DEFAULT_PORT: u16 = 8080;
pub const DEFAULT_MAX_REQUEST_BYTES: usize = 32 * 1024 * 1024;
pub const DEFAULT_TRUSTED_IP_HEADERS: &str = "cf-connecting-ip,x-vercel-forwarded-for,x-real-ip";

#[derive(Debug, Clone)]
pub struct RotationConfig {
    pub max_bytes: Option<u64>,
    pub keep: usize,
    pub compress: bool,
}

impl Default for RotationConfig {
    fn default() -> Self {
        Self {
            max_bytes: None,
            keep: 1,
            compress: false,
        }
    }
}

/// Base URLs and connection settings for the upstream providers.
#[derive(Debug, Clone)]
pub struct UpstreamConfig {
    pub openai_base_url: String,
    pub anthropic_base_url: String,
    pub google_base_url: String,
    pub connect_timeout_ms: u64,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            openai_base_url: "https://api.openai.com/v1".into(),
            anthropic_base_url: "https://api.anthropic.com/v1".into(),
            google_base_url: "https://generativelanguage.googleapis.com/v1beta".into(),
            connect_timeout_ms: 10_000,
        }
    }
}

impl UpstreamConfig {
    pub fn base_url(&self, provider: Provider) -> &str {
        match provider {
            Provider::OpenAi => &self.openai_base_url,
            Provider::Anthropic => &self.anthropic_base_url,
            Provider::Google => &self.google_base_url,
        }
    }

    /// Point every provider at the same base URL. Used against mock servers.
    pub fn all_at(base_url: &str) -> Self {
        Self {
            openai_base_url: base_url.to_string(),
            anthropic_base_url: base_url.to_string(),
            google_base_url: base_url.to_string(),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub port: u16,
    pub rate_limit: RateLimitConfig,
    pub rate_sweep_ms: u64,
    /// Edge-injected client IP headers, highest priority first.
    pub trusted_ip_headers: Vec<String>,
    pub max_request_bytes: usize,
    /// Log prompt-injection hits without rejecting the request.
    pub injection_audit_only: bool,
    pub upstream: UpstreamConfig,
    pub log_file: Option<String>,
    pub rotation: RotationConfig,
    pub log_stdout: bool,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            rate_limit: RateLimitConfig::default(),
            rate_sweep_ms: 60_000,
            trusted_ip_headers: parse_header_list(DEFAULT_TRUSTED_IP_HEADERS),
            max_request_bytes: DEFAULT_MAX_REQUEST_BYTES,
            injection_audit_only: false,
            upstream: UpstreamConfig::default(),
            log_file: None,
            rotation: RotationConfig::default(),
            log_stdout: false,
        }
    }
}

impl AppConfig {
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();

        let limit = parse_optional_u64("CHATGATE_RATE_LIMIT")?
            .map(|v| u32::try_from(v).map_err(|_| anyhow!("CHATGATE_RATE_LIMIT is too large")))
            .transpose()?
            .unwrap_or(defaults.rate_limit.limit);
        let window_ms = parse_optional_u64("CHATGATE_RATE_WINDOW_MS")?
            .unwrap_or(defaults.rate_limit.window_ms);
        if limit == 0 || window_ms == 0 {
            return Err(anyhow!(
                "CHATGATE_RATE_LIMIT and CHATGATE_RATE_WINDOW_MS must be greater than zero"
            ));
        }
        if window_ms > MAX_RATE_WINDOW_MS {
            return Err(anyhow!(
                "CHATGATE_RATE_WINDOW_MS must be at most {}",
                MAX_RATE_WINDOW_MS
            ));
        }
        let rate_sweep_ms = match parse_optional_u64("CHATGATE_RATE_SWEEP_MS")? {
            Some(0) => return Err(anyhow!("CHATGATE_RATE_SWEEP_MS must be a positive integer")),
            Some(v) => v,
            None => defaults.rate_sweep_ms,
        };

        let port = parse_optional_u64("PORT")?
            .map(|v| match u16::try_from(v) {
                Ok(p) if p > 0 => Ok(p),
                _ => Err(anyhow!("PORT must be a positive integer below 65536")),
            })
            .transpose()?
            .unwrap_or(defaults.port);

        let trusted_ip_headers = match env::var("CHATGATE_TRUSTED_IP_HEADERS") {
            Ok(raw) => parse_header_list(&raw),
            Err(env::VarError::NotPresent) => defaults.trusted_ip_headers,
            Err(err) => return Err(err.into()),
        };

        let max_request_bytes = parse_optional_u64("CHATGATE_MAX_REQUEST_BYTES")?
            .map(|v| v as usize)
            .unwrap_or(defaults.max_request_bytes);

        let upstream = UpstreamConfig {
            openai_base_url: env::var("CHATGATE_OPENAI_BASE_URL")
                .unwrap_or(defaults.upstream.openai_base_url),
            anthropic_base_url: env::var("CHATGATE_ANTHROPIC_BASE_URL")
                .unwrap_or(defaults.upstream.anthropic_base_url),
            google_base_url: env::var("CHATGATE_GOOGLE_BASE_URL")
                .unwrap_or(defaults.upstream.google_base_url),
            connect_timeout_ms: parse_optional_u64("CHATGATE_UPSTREAM_CONNECT_TIMEOUT_MS")?
                .unwrap_or(defaults.upstream.connect_timeout_ms),
        };

        let rotation = RotationConfig {
            max_bytes: parse_optional_u64("LOG_MAX_BYTES")?,
            keep: parse_optional_u64("LOG_ROTATE_KEEP")?.unwrap_or(1) as usize,
            compress: parse_bool_env("LOG_ROTATE_COMPRESS")?.unwrap_or(false),
        };

        Ok(Self {
            port,
            rate_limit: RateLimitConfig { limit, window_ms },
            rate_sweep_ms,
            trusted_ip_headers,
            max_request_bytes,
            injection_audit_only: parse_bool_env("CHATGATE_INJECTION_AUDIT_ONLY")?
                .unwrap_or(false),
            upstream,
            log_file: env::var("LOG_FILE").ok().filter(|s| !s.trim().is_empty()),
            rotation,
            log_stdout: parse_bool_env("CHATGATE_LOG_STDOUT")?.unwrap_or(false),
        })
    }
}

fn parse_header_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|s| s.trim().to_ascii_lowercase())
        .filter(|s| !s.is_empty())
        .collect()
}

fn parse_optional_u64(var: &str) -> Result<Option<u64>> {
    match env::var(var) {
        Ok(value) if !value.trim().is_empty() => value
            .trim()
            .parse::<u64>()
            .map(Some)
            .map_err(|_| anyhow!("{} must be a positive integer", var)),
        Ok(_) => Ok(None),
        Err(env::VarError::NotPresent) => Ok(None),
        Err(err) => Err(err.into()),
    }
}

fn parse_bool_env(var: &str) -> Result<Option<bool>> {
    match env::var(var) {
        Ok(value) if !value.trim().is_empty() => parse_bool(&value)
            .map(Some)
            .ok_or_else(|| anyhow!("{} must be a boolean (true/false/1/0)", var)),
        Ok(_) => Ok(None),
        Err(env::VarError::NotPresent) => Ok(None),
        Err(err) => Err(err.into()),
    }
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}
