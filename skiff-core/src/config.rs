//! Transfer tunables. Every knob of the sender, assembler and lifecycle lives here.

use std::time::Duration;

use serde::Deserialize;

/// Fixed chunk size in bytes.
pub const DEFAULT_CHUNK_SIZE: usize = 256 * 1024; // 256 KiB

/// A zero chunk size means the default.
pub(crate) fn chunk_size_or_default(chunk_size: usize) -> usize {
    if chunk_size == 0 {
        DEFAULT_CHUNK_SIZE
    } else {
        chunk_size
    }
}

/// Hard ceiling on bytes queued in the channel but not yet flushed.
pub const DEFAULT_MAX_BUFFER_BYTES: u64 = 8 * 1024 * 1024; // 8 MiB

/// Files strictly larger than this are streamed to storage when a sink is available.
pub const DEFAULT_STREAMING_THRESHOLD: u64 = 500 * 1024 * 1024; // 500 MiB

/// Transfer and lifecycle tunables. Deserializable from the host's `[transfer]` table.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TransferConfig {
    pub chunk_size: usize,
    pub max_buffer_bytes: u64,
    /// Buffer ratio above which the sender waits `soft_wait_ms`.
    pub soft_ratio: f64,
    pub soft_wait_ms: u64,
    /// Buffer ratio above which the sender waits `high_wait_ms`.
    pub high_ratio: f64,
    pub high_wait_ms: u64,
    /// Poll interval while the queue sits above the hard ceiling.
    pub hard_cap_poll_ms: u64,
    pub progress_interval_ms: u64,
    /// Speed/ETA stay undefined until this much of the file's time has elapsed.
    pub rate_warmup_ms: u64,
    /// Delay between the last chunk and `batch_complete` on the sending side. 0 disables it.
    pub settle_delay_ms: u64,
    pub streaming_threshold: u64,
    pub heartbeat_interval_ms: u64,
    pub grace_period_ms: u64,
    /// How long the relay waits after a drop before telling the remaining member.
    pub relay_disconnect_delay_ms: u64,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            max_buffer_bytes: DEFAULT_MAX_BUFFER_BYTES,
            soft_ratio: 0.5,
            soft_wait_ms: 5,
            high_ratio: 0.8,
            high_wait_ms: 20,
            hard_cap_poll_ms: 5,
            progress_interval_ms: 50,
            rate_warmup_ms: 200,
            settle_delay_ms: 500,
            streaming_threshold: DEFAULT_STREAMING_THRESHOLD,
            heartbeat_interval_ms: 3_000,
            grace_period_ms: 45_000,
            relay_disconnect_delay_ms: 5_000,
        }
    }
}

impl TransferConfig {
    /// Chunk size actually used; 0 falls back to the default.
    pub fn effective_chunk_size(&self) -> usize {
        chunk_size_or_default(self.chunk_size)
    }

    pub fn soft_wait(&self) -> Duration {
        Duration::from_millis(self.soft_wait_ms)
    }

    pub fn high_wait(&self) -> Duration {
        Duration::from_millis(self.high_wait_ms)
    }

    pub fn hard_cap_poll(&self) -> Duration {
        Duration::from_millis(self.hard_cap_poll_ms)
    }

    pub fn progress_interval(&self) -> Duration {
        Duration::from_millis(self.progress_interval_ms)
    }

    pub fn rate_warmup(&self) -> Duration {
        Duration::from_millis(self.rate_warmup_ms)
    }

    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn grace_period(&self) -> Duration {
        Duration::from_millis(self.grace_period_ms)
    }

    pub fn relay_disconnect_delay(&self) -> Duration {
        Duration::from_millis(self.relay_disconnect_delay_ms)
    }
}
