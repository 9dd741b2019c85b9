//! Process-wide counters and their Prometheus text exposition.

use std::fmt::Write as _;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use crate::admission::{ImageRejection, RejectionReason};
use crate::error::GatewayError;
use crate::telemetry::TelemetrySink;

/// Upper bounds (ms) of the request latency histogram buckets.
pub const LATENCY_BUCKETS_MS: [u64; 12] = [
    10, 25, 50, 100, 250, 500, 1_000, 2_500, 5_000, 10_000, 30_000, 60_000,
];

pub struct Metrics {
    requests_total: AtomicU64,
    /// Indexed like [`GatewayError::CODES`].
    rejections: [AtomicU64; GatewayError::CODES.len()],
    images_admitted_total: AtomicU64,
    /// Indexed like [`RejectionReason::ALL`].
    images_rejected: [AtomicU64; RejectionReason::ALL.len()],
    injection_hits_total: AtomicU64,
    upstream_errors_total: AtomicU64,
    hist_counts: [AtomicU64; LATENCY_BUCKETS_MS.len()],
    hist_sum_ms: AtomicU64,
    hist_count: AtomicU64,
    process_start_epoch: f64,
    process_start_instant: Instant,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    pub fn new() -> Self {
        let start = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default();
        Self {
            requests_total: AtomicU64::new(0),
            rejections: std::array::from_fn(|_| AtomicU64::new(0)),
            images_admitted_total: AtomicU64::new(0),
            images_rejected: std::array::from_fn(|_| AtomicU64::new(0)),
            injection_hits_total: AtomicU64::new(0),
            upstream_errors_total: AtomicU64::new(0),
            hist_counts: std::array::from_fn(|_| AtomicU64::new(0)),
            hist_sum_ms: AtomicU64::new(0),
            hist_count: AtomicU64::new(0),
            process_start_epoch: start.as_secs_f64(),
            process_start_instant: Instant::now(),
        }
    }

    pub fn record_request(&self) {
        self.requests_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_rejection(&self, code: &str) {
        if let Some(idx) = GatewayError::CODES.iter().position(|c| *c == code) {
            self.rejections[idx].fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_images(&self, admitted: usize, rejections: &[ImageRejection]) {
        self.images_admitted_total
            .fetch_add(admitted as u64, Ordering::Relaxed);
        for rejection in rejections {
            if let Some(idx) = RejectionReason::ALL
                .iter()
                .position(|r| *r == rejection.reason)
            {
                self.images_rejected[idx].fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    pub fn record_injection_hit(&self) {
        self.injection_hits_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_upstream_error(&self) {
        self.upstream_errors_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn observe_latency(&self, latency_ms: u64) {
        self.hist_sum_ms.fetch_add(latency_ms, Ordering::Relaxed);
        self.hist_count.fetch_add(1, Ordering::Relaxed);
        if let Some(idx) = LATENCY_BUCKETS_MS.iter().position(|ub| latency_ms <= *ub) {
            self.hist_counts[idx].fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn requests_total(&self) -> u64 {
        self.requests_total.load(Ordering::Relaxed)
    }

    pub fn rejections_total(&self, code: &str) -> u64 {
        GatewayError::CODES
            .iter()
            .position(|c| *c == code)
            .map_or(0, |idx| self.rejections[idx].load(Ordering::Relaxed))
    }

    /// Prometheus text format, version 0.0.4.
    pub fn render(&self, telemetry: &TelemetrySink, tracked_clients: usize) -> String {
        let mut buf = String::new();

        family(&mut buf, "chatgate_requests_total", "counter", "Chat requests received");
        sample(&mut buf, "chatgate_requests_total", "", self.requests_total());

        family(
            &mut buf,
            "chatgate_rejections_total",
            "counter",
            "Chat requests refused, by error code",
        );
        for (code, counter) in GatewayError::CODES.iter().zip(&self.rejections) {
            sample(
                &mut buf,
                "chatgate_rejections_total",
                &format!("code=\"{code}\""),
                counter.load(Ordering::Relaxed),
            );
        }

        family(
            &mut buf,
            "chatgate_images_admitted_total",
            "counter",
            "Images forwarded upstream",
        );
        sample(
            &mut buf,
            "chatgate_images_admitted_total",
            "",
            self.images_admitted_total.load(Ordering::Relaxed),
        );

        family(
            &mut buf,
            "chatgate_images_rejected_total",
            "counter",
            "Images dropped by admission control, by reason",
        );
        for (reason, counter) in RejectionReason::ALL.iter().zip(&self.images_rejected) {
            sample(
                &mut buf,
                "chatgate_images_rejected_total",
                &format!("reason=\"{}\"", reason.as_str()),
                counter.load(Ordering::Relaxed),
            );
        }

        family(
            &mut buf,
            "chatgate_injection_hits_total",
            "counter",
            "User messages matching a prompt-injection pattern",
        );
        sample(
            &mut buf,
            "chatgate_injection_hits_total",
            "",
            self.injection_hits_total.load(Ordering::Relaxed),
        );

        family(
            &mut buf,
            "chatgate_upstream_errors_total",
            "counter",
            "Upstream calls that failed before streaming",
        );
        sample(
            &mut buf,
            "chatgate_upstream_errors_total",
            "",
            self.upstream_errors_total.load(Ordering::Relaxed),
        );

        family(
            &mut buf,
            "chatgate_telemetry_lines_total",
            "counter",
            "Telemetry JSON lines written",
        );
        sample(&mut buf, "chatgate_telemetry_lines_total", "", telemetry.lines_total());
        family(
            &mut buf,
            "chatgate_telemetry_write_errors_total",
            "counter",
            "Telemetry JSON line write failures",
        );
        sample(
            &mut buf,
            "chatgate_telemetry_write_errors_total",
            "",
            telemetry.write_errors_total(),
        );

        family(
            &mut buf,
            "chatgate_request_latency_ms",
            "histogram",
            "Time to first upstream byte in milliseconds",
        );
        let mut cumulative = 0u64;
        for (ub, counter) in LATENCY_BUCKETS_MS.iter().zip(&self.hist_counts) {
            cumulative += counter.load(Ordering::Relaxed);
            sample(
                &mut buf,
                "chatgate_request_latency_ms_bucket",
                &format!("le=\"{ub}\""),
                cumulative,
            );
        }
        let count = self.hist_count.load(Ordering::Relaxed);
        sample(&mut buf, "chatgate_request_latency_ms_bucket", "le=\"+Inf\"", count);
        sample(
            &mut buf,
            "chatgate_request_latency_ms_sum",
            "",
            self.hist_sum_ms.load(Ordering::Relaxed),
        );
        sample(&mut buf, "chatgate_request_latency_ms_count", "", count);

        family(
            &mut buf,
            "chatgate_rate_limit_tracked_clients",
            "gauge",
            "Client identifiers currently held by the rate limiter",
        );
        sample(
            &mut buf,
            "chatgate_rate_limit_tracked_clients",
            "",
            tracked_clients as u64,
        );

        family(
            &mut buf,
            "chatgate_telemetry_file_size_bytes",
            "gauge",
            "Size of the active telemetry log file (0 if disabled)",
        );
        sample(
            &mut buf,
            "chatgate_telemetry_file_size_bytes",
            "",
            telemetry.file_size_bytes(),
        );

        family(&mut buf, "chatgate_build_info", "gauge", "Build information");
        sample(
            &mut buf,
            "chatgate_build_info",
            &format!("version=\"{}\"", env!("CARGO_PKG_VERSION")),
            1,
        );

        family(
            &mut buf,
            "chatgate_process_start_time_seconds",
            "gauge",
            "Process start time (Unix epoch seconds)",
        );
        writeln!(
            &mut buf,
            "chatgate_process_start_time_seconds {}",
            self.process_start_epoch
        )
        .ok();
        family(
            &mut buf,
            "chatgate_process_uptime_seconds",
            "gauge",
            "Process uptime seconds",
        );
        writeln!(
            &mut buf,
            "chatgate_process_uptime_seconds {}",
            self.process_start_instant.elapsed().as_secs_f64()
        )
        .ok();

        buf
    }
}

fn family(buf: &mut String, name: &str, kind: &str, help: &str) {
    writeln!(buf, "# HELP {name} {help}").ok();
    writeln!(buf, "# TYPE {name} {kind}").ok();
}

fn sample(buf: &mut String, name: &str, labels: &str, value: u64) {
    if labels.is_empty() {
        writeln!(buf, "{name} {value}").ok();
    } else {
        writeln!(buf, "{name}{{{labels}}} {value}").ok();
    }
}
