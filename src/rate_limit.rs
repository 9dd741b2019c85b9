//! Fixed-window rate limiting keyed by client identifier.
//!
//! The table is process-wide and owned by a [`RateLimiter`] constructed once
//! at start-up. Several gateway processes without shared state each enforce
//! their own independent limit.

use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use ahash::RandomState;
use axum::http::HeaderMap;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::Serialize;
use tokio::task::JoinHandle;

/// Identifier used when no origin header is present at all.
pub const LOOPBACK_IDENTIFIER: &str = "127.0.0.1";

/// Per-identifier window state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitEntry {
    pub count: u32,
    /// Epoch milliseconds at which the window closes.
    pub reset_time: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitConfig {
    pub limit: u32,
    pub window_ms: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            limit: 30,
            window_ms: 60_000,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RateLimitResult {
    pub success: bool,
    pub remaining: u32,
    pub reset_time: i64,
}

impl RateLimitResult {
    /// Whole seconds until `reset_time`, rounded up and never below one.
    pub fn retry_after_secs(&self, now_ms: i64) -> u64 {
        let delta = self.reset_time.saturating_sub(now_ms).max(0) as u64;
        delta.div_ceil(1000).max(1)
    }
}

type Table = DashMap<String, RateLimitEntry, RandomState>;

pub struct RateLimiter {
    table: Arc<Table>,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new()
    }
}

impl RateLimiter {
    pub fn new() -> Self {
        Self {
            table: Arc::new(DashMap::with_hasher(RandomState::new())),
            sweeper: Mutex::new(None),
        }
    }

    pub fn check(&self, identifier: &str, config: RateLimitConfig) -> RateLimitResult {
        self.check_at(identifier, config, now_ms())
    }

    /// Count one request for `identifier` at time `now`.
    ///
    /// The whole read-compare-increment runs while holding the shard lock for
    /// the key, so concurrent callers for the same identifier never lose an
    /// update.
    pub fn check_at(&self, identifier: &str, config: RateLimitConfig, now: i64) -> RateLimitResult {
        let window = i64::try_from(config.window_ms).unwrap_or(i64::MAX);
        let fresh = RateLimitEntry {
            count: 1,
            reset_time: now.saturating_add(window),
        };
        let first_hit = RateLimitResult {
            success: true,
            remaining: config.limit.saturating_sub(1),
            reset_time: fresh.reset_time,
        };
        match self.table.entry(identifier.to_string()) {
            Entry::Vacant(slot) => {
                slot.insert(fresh);
                first_hit
            }
            Entry::Occupied(mut slot) => {
                let current = slot.get_mut();
                if now > current.reset_time {
                    *current = fresh;
                    return first_hit;
                }
                if current.count >= config.limit {
                    return RateLimitResult {
                        success: false,
                        remaining: 0,
                        reset_time: current.reset_time,
                    };
                }
                current.count += 1;
                RateLimitResult {
                    success: true,
                    remaining: config.limit - current.count,
                    reset_time: current.reset_time,
                }
            }
        }
    }

    /// Delete every entry whose window has closed. Returns the number removed.
    pub fn sweep_at(&self, now: i64) -> usize {
        sweep_table(&self.table, now)
    }

    /// Number of identifiers currently tracked.
    pub fn len(&self) -> usize {
        self.table.len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }

    /// Start the periodic eviction task on the current tokio runtime.
    ///
    /// The task only holds a weak reference to the table, so it never keeps
    /// the limiter alive and ends on its own once the limiter is dropped.
    /// Calling `start` twice replaces the previous task.
    pub fn start(&self, interval: Duration) {
        let weak: Weak<Table> = Arc::downgrade(&self.table);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // First tick completes immediately.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(table) = weak.upgrade() else {
                    break;
                };
                let removed = sweep_table(&table, now_ms());
                if removed > 0 {
                    tracing::debug!(removed, remaining = table.len(), "rate limit sweep");
                }
            }
        });
        if let Ok(mut slot) = self.sweeper.lock() {
            if let Some(previous) = slot.replace(handle) {
                previous.abort();
            }
        }
    }

    /// Stop the eviction task if it is running.
    pub fn stop(&self) {
        if let Ok(mut slot) = self.sweeper.lock() {
            if let Some(handle) = slot.take() {
                handle.abort();
            }
        }
    }

    pub fn is_running(&self) -> bool {
        self.sweeper
            .lock()
            .map(|slot| slot.as_ref().is_some_and(|h| !h.is_finished()))
            .unwrap_or(false)
    }
}

impl Drop for RateLimiter {
    fn drop(&mut self) {
        self.stop();
    }
}

fn sweep_table(table: &Table, now: i64) -> usize {
    let before = table.len();
    table.retain(|_, entry| now <= entry.reset_time);
    before.saturating_sub(table.len())
}

pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Pick the client identifier for rate limiting.
///
/// Headers injected by a trusted edge (listed in `trusted_headers`, highest
/// priority first) win over `x-forwarded-for`, which the client can set
/// itself. Falls back to [`LOOPBACK_IDENTIFIER`].
pub fn client_identifier(headers: &HeaderMap, trusted_headers: &[String]) -> String {
    for name in trusted_headers {
        if let Some(value) = first_header_value(headers, name) {
            return value;
        }
    }
    first_header_value(headers, "x-forwarded-for")
        .unwrap_or_else(|| LOOPBACK_IDENTIFIER.to_string())
}

fn first_header_value(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .and_then(|raw| raw.split(',').next())
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .map(|s| s.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    const CFG: RateLimitConfig = RateLimitConfig {
        limit: 3,
        window_ms: 60_000,
    };

    #[test]
    fn fixed_window_counts_down_then_blocks() {
        let limiter = RateLimiter::new();
        let t0 = 1_000_000;
        let r1 = limiter.check_at("client", CFG, t0);
        let r2 = limiter.check_at("client", CFG, t0 + 10);
        let r3 = limiter.check_at("client", CFG, t0 + 20);
        let r4 = limiter.check_at("client", CFG, t0 + 30);
        assert!(r1.success && r2.success && r3.success);
        assert_eq!((r1.remaining, r2.remaining, r3.remaining), (2, 1, 0));
        assert!(!r4.success);
        assert_eq!(r4.remaining, 0);
        assert_eq!(r4.reset_time, t0 + 60_000);
        assert_eq!(r1.reset_time, r4.reset_time);
    }

    #[test]
    fn oversized_windows_saturate_instead_of_wrapping() {
        for window_ms in [u64::MAX, i64::MAX as u64] {
            let limiter = RateLimiter::new();
            let cfg = RateLimitConfig { limit: 1, window_ms };
            let first = limiter.check_at("c", cfg, 1_700_000_000_000);
            let second = limiter.check_at("c", cfg, 1_700_000_000_001);
            assert!(first.success);
            assert_eq!(first.reset_time, i64::MAX);
            assert!(!second.success, "window {window_ms} must still block");
        }
    }

    #[test]
    fn window_resets_after_reset_time() {
        let limiter = RateLimiter::new();
        let t0 = 5_000;
        for i in 0..4 {
            limiter.check_at("c", CFG, t0 + i);
        }
        // Exactly at reset_time the old window still applies.
        assert!(!limiter.check_at("c", CFG, t0 + 60_000).success);
        let fresh = limiter.check_at("c", CFG, t0 + 60_001);
        assert!(fresh.success);
        assert_eq!(fresh.remaining, 2);
        assert_eq!(fresh.reset_time, t0 + 60_001 + 60_000);
    }

    #[test]
    fn identifiers_are_independent() {
        let limiter = RateLimiter::new();
        for _ in 0..3 {
            limiter.check_at("a", CFG, 0);
        }
        assert!(!limiter.check_at("a", CFG, 1).success);
        assert!(limiter.check_at("b", CFG, 1).success);
        assert_eq!(limiter.len(), 2);
    }

    #[test]
    fn second_request_in_same_millisecond_is_counted() {
        let limiter = RateLimiter::new();
        let r1 = limiter.check_at("same", CFG, 42);
        let r2 = limiter.check_at("same", CFG, 42);
        assert_eq!(r1.remaining, 2);
        assert_eq!(r2.remaining, 1);
    }

    #[test]
    fn sweep_removes_only_expired_entries() {
        let limiter = RateLimiter::new();
        limiter.check_at("old", CFG, 0);
        limiter.check_at("new", CFG, 50_000);
        assert_eq!(limiter.sweep_at(60_001), 1);
        assert_eq!(limiter.len(), 1);
        assert_eq!(limiter.sweep_at(200_000), 1);
        assert!(limiter.is_empty());
    }

    #[test]
    fn retry_after_rounds_up() {
        let r = RateLimitResult {
            success: false,
            remaining: 0,
            reset_time: 10_500,
        };
        assert_eq!(r.retry_after_secs(0), 11);
        assert_eq!(r.retry_after_secs(10_000), 1);
        assert_eq!(r.retry_after_secs(20_000), 1);
    }

    #[test]
    fn concurrent_checks_do_not_lose_updates() {
        let limiter = Arc::new(RateLimiter::new());
        let cfg = RateLimitConfig {
            limit: 1_000,
            window_ms: 60_000,
        };
        let threads: Vec<_> = (0..8)
            .map(|_| {
                let limiter = limiter.clone();
                std::thread::spawn(move || {
                    for _ in 0..50 {
                        limiter.check_at("shared", cfg, 1);
                    }
                })
            })
            .collect();
        for t in threads {
            t.join().unwrap();
        }
        let next = limiter.check_at("shared", cfg, 2);
        assert_eq!(next.remaining, 1_000 - 401);
    }

    #[test]
    fn trusted_headers_win_over_forwarded_for() {
        let trusted = vec!["cf-connecting-ip".to_string(), "x-real-ip".to_string()];
        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-for", "6.6.6.6, 10.0.0.1".parse().unwrap());
        assert_eq!(client_identifier(&headers, &trusted), "6.6.6.6");

        headers.insert("x-real-ip", "2.2.2.2".parse().unwrap());
        assert_eq!(client_identifier(&headers, &trusted), "2.2.2.2");

        headers.insert("cf-connecting-ip", "1.1.1.1".parse().unwrap());
        assert_eq!(client_identifier(&headers, &trusted), "1.1.1.1");
    }

    #[test]
    fn falls_back_to_loopback() {
        let headers = HeaderMap::new();
        assert_eq!(client_identifier(&headers, &[]), LOOPBACK_IDENTIFIER);
        let mut blank = HeaderMap::new();
        blank.insert("x-forwarded-for", " ".parse().unwrap());
        assert_eq!(client_identifier(&blank, &[]), LOOPBACK_IDENTIFIER);
    }

    #[tokio::test(start_paused = true)]
    async fn background_sweep_runs_and_stops() {
        let limiter = RateLimiter::new();
        limiter.check_at("stale", CFG, 0);
        limiter.start(Duration::from_millis(100));
        assert!(limiter.is_running());
        tokio::time::sleep(Duration::from_millis(250)).await;
        tokio::task::yield_now().await;
        assert!(limiter.is_empty(), "expired entry should be evicted");
        limiter.stop();
        assert!(!limiter.is_running());
    }
}
