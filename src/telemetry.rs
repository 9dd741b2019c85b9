//! Per-request JSONL telemetry with size-based rotation.
//!
//! One line is appended for every `/api/chat` request, accepted or not. The
//! line never contains message text, API keys or image payloads.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use flate2::write::GzEncoder;
use flate2::Compression;
use serde::Serialize;

use crate::admission::ImageRejection;
use crate::config::RotationConfig;

pub const SCHEMA_VERSION: u32 = 1;

/// Append-only writer that rotates `<path>` to `<path>.1 .. <path>.<keep>`
/// once the file reaches `max_bytes`, optionally gzipping the newest backup.
pub struct RotatingWriter {
    path: PathBuf,
    file: fs::File,
    rotation: RotationConfig,
}

impl RotatingWriter {
    pub fn open(path: &str, rotation: RotationConfig) -> std::io::Result<Self> {
        let file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)?;
        Ok(Self {
            path: PathBuf::from(path),
            file,
            rotation,
        })
    }

    pub fn write_line(&mut self, line: &str) -> std::io::Result<()> {
        if let Some(limit) = self.rotation.max_bytes {
            if self.current_size().is_some_and(|len| len >= limit) {
                self.rotate()?;
            }
        }
        writeln!(self.file, "{}", line)
    }

    pub fn current_size(&self) -> Option<u64> {
        self.path.metadata().ok().map(|m| m.len())
    }

    fn backup_path(&self, idx: usize) -> PathBuf {
        let mut name = self.path.clone().into_os_string();
        name.push(format!(".{idx}"));
        PathBuf::from(name)
    }

    fn gz_path(&self, idx: usize) -> PathBuf {
        let mut name = self.backup_path(idx).into_os_string();
        name.push(".gz");
        PathBuf::from(name)
    }

    fn rotate(&mut self) -> std::io::Result<()> {
        let keep = self.rotation.keep;
        if keep > 0 {
            // Shift older backups up by one, dropping whatever falls off the end.
            for idx in (1..keep).rev() {
                for (from, to) in [
                    (self.backup_path(idx), self.backup_path(idx + 1)),
                    (self.gz_path(idx), self.gz_path(idx + 1)),
                ] {
                    if from.exists() {
                        fs::rename(&from, &to)?;
                    }
                }
            }
            let newest = self.backup_path(1);
            fs::rename(&self.path, &newest)?;
            if self.rotation.compress {
                self.compress(&newest);
            }
        }
        self.file = fs::OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&self.path)?;
        Ok(())
    }

    fn compress(&self, rotated: &Path) {
        let Ok(data) = fs::read(rotated) else {
            return;
        };
        let mut gz = GzEncoder::new(Vec::new(), Compression::default());
        let packed = gz.write_all(&data).and_then(|_| gz.finish());
        match packed {
            Ok(buf) => {
                if fs::write(self.gz_path(1), buf).is_ok() {
                    let _ = fs::remove_file(rotated);
                }
            }
            Err(e) => tracing::warn!(error = %e, "failed to compress rotated telemetry file"),
        }
    }
}

/// One telemetry line.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TelemetryEvent<'a> {
    pub schema_version: u32,
    pub ts: String,
    pub request_id: &'a str,
    pub status: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provider: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<&'static str>,
    pub latency_ms: u64,
    pub image_rejections: &'a [ImageRejection],
}

#[derive(Clone, Default)]
pub struct TelemetrySink {
    writer: Option<Arc<Mutex<RotatingWriter>>>,
    log_stdout: bool,
    lines_total: Arc<AtomicU64>,
    write_errors_total: Arc<AtomicU64>,
    file_size_bytes: Arc<AtomicU64>,
}

impl TelemetrySink {
    pub fn new(writer: Option<RotatingWriter>, log_stdout: bool) -> Self {
        Self {
            writer: writer.map(|w| Arc::new(Mutex::new(w))),
            log_stdout,
            ..Self::default()
        }
    }

    /// Open `LOG_FILE` if configured. A file that cannot be opened disables
    /// telemetry with a warning rather than failing start-up.
    pub fn from_config(log_file: Option<&str>, rotation: &RotationConfig, log_stdout: bool) -> Self {
        let writer = match log_file {
            Some(path) => match RotatingWriter::open(path, rotation.clone()) {
                Ok(w) => Some(w),
                Err(e) => {
                    tracing::warn!(path = %path, error = %e, "failed to open LOG_FILE; telemetry disabled");
                    None
                }
            },
            None => {
                tracing::info!("telemetry file disabled: LOG_FILE not set");
                None
            }
        };
        Self::new(writer, log_stdout)
    }

    pub fn emit(&self, event: &TelemetryEvent<'_>) {
        if let Some(writer) = &self.writer {
            match serde_json::to_string(event) {
                Ok(line) => self.write_line(writer, &line),
                Err(e) => {
                    tracing::warn!(error = %e, "failed to encode telemetry line");
                    self.write_errors_total.fetch_add(1, Ordering::Relaxed);
                }
            }
        }
        if self.log_stdout {
            tracing::info!(
                target: "telemetry",
                requestId = event.request_id,
                status = event.status,
                code = ?event.code,
                provider = ?event.provider,
                model = ?event.model,
                latencyMs = event.latency_ms,
                imageRejections = event.image_rejections.len(),
                "chat request"
            );
        }
    }

    fn write_line(&self, writer: &Mutex<RotatingWriter>, line: &str) {
        let Ok(mut guard) = writer.lock() else {
            self.write_errors_total.fetch_add(1, Ordering::Relaxed);
            return;
        };
        match guard.write_line(line) {
            Ok(()) => {
                self.lines_total.fetch_add(1, Ordering::Relaxed);
                if let Some(size) = guard.current_size() {
                    self.file_size_bytes.store(size, Ordering::Relaxed);
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "failed to write telemetry line");
                self.write_errors_total.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.writer.is_some()
    }

    pub fn lines_total(&self) -> u64 {
        self.lines_total.load(Ordering::Relaxed)
    }

    pub fn write_errors_total(&self) -> u64 {
        self.write_errors_total.load(Ordering::Relaxed)
    }

    pub fn file_size_bytes(&self) -> u64 {
        self.file_size_bytes.load(Ordering::Relaxed)
    }
}
