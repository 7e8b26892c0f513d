//! Progress throttling, speed/ETA estimation, and human-readable formatting.

use std::time::{Duration, Instant};

use crate::config::TransferConfig;

/// Current instant on tokio's clock, so paused-time tests drive throttling too.
pub(crate) fn now() -> Instant {
    tokio::time::Instant::now().into_std()
}

/// Percent, speed and ETA for one emitted sample.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Sample {
    pub percent: f64,
    pub speed: Option<f64>,
    pub eta: Option<f64>,
}

/// Decides when a progress sample is worth emitting and computes its rate.
///
/// Emits at most once per interval, plus always on a file's first chunk and
/// once progress reaches 99%.
#[derive(Debug, Clone)]
pub struct ProgressTracker {
    interval: Duration,
    warmup: Duration,
    last_emit: Option<Instant>,
    file_started: Option<Instant>,
}

impl ProgressTracker {
    pub fn new(config: &TransferConfig) -> Self {
        Self {
            interval: config.progress_interval(),
            warmup: config.rate_warmup(),
            last_emit: None,
            file_started: None,
        }
    }

    /// Reset the per-file clock. The emit throttle carries over between files.
    pub fn start_file(&mut self, now: Instant) {
        self.file_started = Some(now);
    }


    /// Record that `done` of `size` bytes are through. Returns a sample if one should be emitted.
    pub fn observe(&mut self, now: Instant, done: u64, size: u64, first_chunk: bool) -> Option<Sample> {
        let percent = percent(done, size);
        let due = match self.last_emit {
            None => true,
            Some(last) => now.saturating_duration_since(last) >= self.interval,
        };
        if !(due || first_chunk || percent >= 99.0) {
            return None;
        }
        self.last_emit = Some(now);
        let elapsed = self
            .file_started
            .map(|s| now.saturating_duration_since(s))
            .unwrap_or_default();
        let (speed, eta) = estimate_rate(done, size, elapsed, self.warmup);
        Some(Sample {
            percent,
            speed,
            eta,
        })
    }
}

/// Percentage of `size` covered by `done`, capped at 100. An empty file is complete.
pub fn percent(done: u64, size: u64) -> f64 {
    if size == 0 {
        return 100.0;
    }
    (done as f64 / size as f64 * 100.0).min(100.0)
}

/// Speed (bytes/s) and ETA (s). Both undefined until `elapsed` exceeds `warmup`;
/// ETA also undefined when the speed is zero.
pub fn estimate_rate(
    done: u64,
    size: u64,
    elapsed: Duration,
    warmup: Duration,
) -> (Option<f64>, Option<f64>) {
    if elapsed <= warmup {
        return (None, None);
    }
    let speed = done as f64 / elapsed.as_secs_f64();
    if speed <= 0.0 {
        return (Some(speed), None);
    }
    let remaining = size.saturating_sub(done) as f64;
    (Some(speed), Some(remaining / speed))
}

/// Placeholder for an unknown speed or ETA.
pub const PLACEHOLDER: &str = "--";

fn scaled(value: f64, units: &[&str]) -> String {
    let k = 1024f64;
    let i = ((value.ln() / k.ln()).floor() as usize).min(units.len() - 1);
    let v = value / k.powi(i as i32);
    format!("{} {}", (v * 100.0).round() / 100.0, units[i])
}

/// "0 Bytes", "1.5 KB", "2 GB", ...
pub fn format_size(bytes: u64) -> String {
    if bytes == 0 {
        return "0 Bytes".to_string();
    }
    scaled(bytes as f64, &["Bytes", "KB", "MB", "GB", "TB"])
}

pub fn format_speed(bytes_per_sec: Option<f64>) -> String {
    match bytes_per_sec {
        Some(s) if s.is_finite() && s >= 1.0 => scaled(s, &["B/s", "KB/s", "MB/s", "GB/s"]),
        _ => PLACEHOLDER.to_string(),
    }
}

pub fn format_eta(seconds: Option<f64>) -> String {
    let s = match seconds {
        Some(s) if s.is_finite() && s > 0.0 => s,
        _ => return PLACEHOLDER.to_string(),
    };
    if s < 60.0 {
        format!("{}s", s.round() as u64)
    } else if s < 3600.0 {
        format!("{}m {}s", (s / 60.0).floor() as u64, (s % 60.0).round() as u64)
    } else {
        format!(
            "{}h {}m",
            (s / 3600.0).floor() as u64,
            ((s % 3600.0) / 60.0).floor() as u64
        )
    }
}
