//! Flow-controlled sender: metadata, fixed-size chunks, end marker, paced against channel backpressure.

use std::io;
use std::time::Duration;

use tracing::{debug, info};

use crate::channel::{CancelFlag, ChannelError, DuplexChannel, FileSource};
use crate::chunk::split_into_chunks;
use crate::config::TransferConfig;
use crate::events::{Direction, Notice, Progress};
use crate::progress::{now, ProgressTracker};
use crate::protocol::{self, CodecError, ControlFrame, FileMetadata, WireMessage};

/// How a batch ended without an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    Completed,
    Cancelled,
}

#[derive(Debug, thiserror::Error)]
pub enum SendError {
    #[error("channel: {0}")]
    Channel(#[from] ChannelError),
    #[error("codec: {0}")]
    Codec(#[from] CodecError),
    #[error("reading {name}: {source}")]
    Read { name: String, source: io::Error },
}

/// Advisory wait before the next chunk, from the channel's fill ratio.
/// `None` when the buffer is at most `soft_ratio` full.
pub fn pacing_wait(pending: u64, config: &TransferConfig) -> Option<Duration> {
    let ratio = pending as f64 / config.max_buffer_bytes.max(1) as f64;
    if ratio > config.high_ratio {
        Some(config.high_wait())
    } else if ratio > config.soft_ratio {
        Some(config.soft_wait())
    } else {
        None
    }
}

/// Drains a file queue onto a channel.
pub struct FileSender<'a, C: ?Sized> {
    channel: &'a C,
    config: &'a TransferConfig,
    cancel: CancelFlag,
}

impl<'a, C: DuplexChannel + ?Sized> FileSender<'a, C> {
    pub fn new(channel: &'a C, config: &'a TransferConfig, cancel: CancelFlag) -> Self {
        Self {
            channel,
            config,
            cancel,
        }
    }

    /// Send every file of the batch in order. `notify` receives progress and `BatchComplete`.
    ///
    /// Cancellation is observed before each file, before each chunk, and while
    /// waiting on the hard buffer ceiling. Bytes already queued stay queued.
    pub async fn send_batch<S, F>(&self, files: &mut [S], mut notify: F) -> Result<SendOutcome, SendError>
    where
        S: FileSource,
        F: FnMut(Notice) + Send,
    {
        let total = files.len() as u32;
        let chunk_size = self.config.effective_chunk_size();
        let mut tracker = ProgressTracker::new(self.config);

        for (i, file) in files.iter_mut().enumerate() {
            if self.cancel.is_cancelled() {
                info!(event = "send_cancelled", at_file = i + 1, "Batch cancelled before file");
                return Ok(SendOutcome::Cancelled);
            }
            let meta = FileMetadata {
                name: file.name().to_string(),
                size: file.size(),
                content_type: file.content_type().to_string(),
                index: i as u32 + 1,
                total,
            };
            info!(
                event = "file_send_start",
                file = %meta.name,
                bytes = meta.size,
                index = meta.index,
                total,
                "Sending file"
            );
            let size = meta.size;
            let name = meta.name.clone();
            let index = meta.index;
            self.send_control(&ControlFrame::Metadata(meta)).await?;
            tracker.start_file(now());

            for range in split_into_chunks(size, chunk_size) {
                if self.cancel.is_cancelled() {
                    info!(event = "send_cancelled", file = %name, offset = range.start, "Batch cancelled mid-file");
                    return Ok(SendOutcome::Cancelled);
                }
                let bytes = file
                    .read_chunk(range.start, range.len() as usize)
                    .await
                    .map_err(|source| SendError::Read {
                        name: name.clone(),
                        source,
                    })?;
                if !self.wait_for_capacity().await {
                    info!(event = "send_cancelled", file = %name, "Batch cancelled while draining");
                    return Ok(SendOutcome::Cancelled);
                }
                self.channel.send(WireMessage::Binary(bytes)).await?;

                if let Some(s) = tracker.observe(now(), range.end, size, range.is_first()) {
                    notify(Notice::Progress(Progress {
                        direction: Direction::Sending,
                        file_name: name.clone(),
                        index,
                        total,
                        percent: s.percent,
                        speed: s.speed,
                        eta: s.eta,
                    }));
                }
            }
            self.send_control(&ControlFrame::End).await?;
            debug!(event = "file_send_end", file = %name, "End marker queued");
        }

        let settle = self.config.settle_delay();
        if !settle.is_zero() {
            tokio::time::sleep(settle).await;
        }
        info!(event = "batch_sent", files = total, "Batch complete");
        notify(Notice::BatchComplete);
        Ok(SendOutcome::Completed)
    }

    async fn send_control(&self, frame: &ControlFrame) -> Result<(), SendError> {
        let msg = protocol::encode_control(frame)?;
        self.channel.send(msg).await?;
        Ok(())
    }

    /// Soft pacing, then the hard ceiling. Returns false if cancelled while waiting.
    async fn wait_for_capacity(&self) -> bool {
        let pending = self.channel.pending_bytes();
        if let Some(wait) = pacing_wait(pending, self.config) {
            debug!(event = "pacing_wait", pending, wait_ms = wait.as_millis() as u64);
            tokio::time::sleep(wait).await;
        }
        while self.channel.pending_bytes() > self.config.max_buffer_bytes {
            tokio::time::sleep(self.config.hard_cap_poll()).await;
            if self.cancel.is_cancelled() {
                return false;
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{decode, Frame};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
    use std::sync::Mutex;

    struct MemFile {
        name: String,
        data: Vec<u8>,
    }

    impl MemFile {
        fn new(name: &str, len: usize) -> Self {
            Self {
                name: name.into(),
                data: (0..len).map(|i| (i % 251) as u8).collect(),
            }
        }
    }

    #[async_trait]
    impl FileSource for MemFile {
        fn name(&self) -> &str {
            &self.name
        }
        fn size(&self) -> u64 {
            self.data.len() as u64
        }
        fn content_type(&self) -> &str {
            "application/octet-stream"
        }
        async fn read_chunk(&mut self, offset: u64, len: usize) -> io::Result<Vec<u8>> {
            let start = offset as usize;
            Ok(self.data[start..start + len].to_vec())
        }
    }

    /// Records messages; optionally cancels after a number of binary sends.
    #[derive(Default)]
    struct RecordingChannel {
        sent: Mutex<Vec<WireMessage>>,
        pending: AtomicU64,
        binaries: AtomicUsize,
        cancel_after: Option<(usize, CancelFlag)>,
    }

    #[async_trait]
    impl DuplexChannel for RecordingChannel {
        async fn send(&self, msg: WireMessage) -> Result<(), ChannelError> {
            if matches!(msg, WireMessage::Binary(_)) {
                let n = self.binaries.fetch_add(1, Ordering::SeqCst) + 1;
                if let Some((after, flag)) = &self.cancel_after {
                    if n == *after {
                        flag.cancel();
                    }
                }
            }
            self.sent.lock().unwrap().push(msg);
            Ok(())
        }
        fn pending_bytes(&self) -> u64 {
            self.pending.load(Ordering::SeqCst)
        }
        fn is_open(&self) -> bool {
            true
        }
    }

    impl RecordingChannel {
        fn frames(&self) -> Vec<Frame> {
            self.sent
                .lock()
                .unwrap()
                .iter()
                .cloned()
                .map(|m| decode(m).unwrap())
                .collect()
        }
    }

    fn small_config() -> TransferConfig {
        TransferConfig {
            chunk_size: 1024,
            settle_delay_ms: 0,
            ..TransferConfig::default()
        }
    }

    #[test]
    fn pacing_thresholds() {
        let c = TransferConfig::default();
        let max = c.max_buffer_bytes;
        assert_eq!(pacing_wait(0, &c), None);
        assert_eq!(pacing_wait(max / 2, &c), None);
        assert_eq!(pacing_wait(max / 2 + 1, &c), Some(Duration::from_millis(5)));
        assert_eq!(pacing_wait(max * 8 / 10 + 1, &c), Some(Duration::from_millis(20)));
        assert_eq!(pacing_wait(max * 2, &c), Some(Duration::from_millis(20)));
    }

    #[tokio::test(start_paused = true)]
    async fn frame_sequence_per_file() {
        let config = small_config();
        let channel = RecordingChannel::default();
        let mut files = vec![MemFile::new("a.bin", 2500), MemFile::new("empty", 0)];
        let sender = FileSender::new(&channel, &config, CancelFlag::new());
        let outcome = sender.send_batch(&mut files, |_| {}).await.unwrap();
        assert_eq!(outcome, SendOutcome::Completed);

        let frames = channel.frames();
        // a.bin: metadata, 3 chunks, end; empty: metadata, end.
        assert_eq!(frames.len(), 7);
        match &frames[0] {
            Frame::Control(ControlFrame::Metadata(m)) => {
                assert_eq!(m.name, "a.bin");
                assert_eq!((m.index, m.total), (1, 2));
            }
            other => panic!("expected metadata, got {other:?}"),
        }
        let lens: Vec<usize> = frames[1..4]
            .iter()
            .map(|f| match f {
                Frame::Data(b) => b.len(),
                other => panic!("expected data, got {other:?}"),
            })
            .collect();
        assert_eq!(lens, vec![1024, 1024, 452]);
        assert_eq!(frames[4], Frame::Control(ControlFrame::End));
        assert!(matches!(&frames[5], Frame::Control(ControlFrame::Metadata(m)) if m.index == 2 && m.size == 0));
        assert_eq!(frames[6], Frame::Control(ControlFrame::End));
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_before_start_sends_nothing() {
        let config = small_config();
        let channel = RecordingChannel::default();
        let cancel = CancelFlag::new();
        cancel.cancel();
        let mut files = vec![MemFile::new("a", 10)];
        let outcome = FileSender::new(&channel, &config, cancel)
            .send_batch(&mut files, |_| {})
            .await
            .unwrap();
        assert_eq!(outcome, SendOutcome::Cancelled);
        assert!(channel.frames().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_mid_file_stops_before_next_chunk() {
        let config = small_config();
        let cancel = CancelFlag::new();
        let channel = RecordingChannel {
            cancel_after: Some((2, cancel.clone())),
            ..RecordingChannel::default()
        };
        let mut files = vec![MemFile::new("big", 10 * 1024), MemFile::new("next", 10)];
        let mut notices = Vec::new();
        let outcome = FileSender::new(&channel, &config, cancel)
            .send_batch(&mut files, |n| notices.push(n))
            .await
            .unwrap();
        assert_eq!(outcome, SendOutcome::Cancelled);
        let frames = channel.frames();
        // metadata + the two chunks sent before the flag was observed; no end marker.
        assert_eq!(frames.len(), 3);
        assert!(!frames.contains(&Frame::Control(ControlFrame::End)));
        assert!(!notices.contains(&Notice::BatchComplete));
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_observed_inside_hard_cap_wait() {
        let config = small_config();
        let channel = RecordingChannel::default();
        channel
            .pending
            .store(config.max_buffer_bytes + 1, Ordering::SeqCst);
        let cancel = CancelFlag::new();
        let canceller = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            canceller.cancel();
        });
        let mut files = vec![MemFile::new("stuck", 10)];
        let outcome = FileSender::new(&channel, &config, cancel)
            .send_batch(&mut files, |_| {})
            .await
            .unwrap();
        assert_eq!(outcome, SendOutcome::Cancelled);
        // Only the metadata made it out.
        assert_eq!(channel.frames().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn progress_first_and_last_and_batch_complete_after_settle() {
        let config = TransferConfig {
            chunk_size: 1024,
            ..TransferConfig::default()
        };
        let channel = RecordingChannel::default();
        let mut files = vec![MemFile::new("p", 8 * 1024)];
        let mut notices = Vec::new();
        let started = tokio::time::Instant::now();
        FileSender::new(&channel, &config, CancelFlag::new())
            .send_batch(&mut files, |n| notices.push(n))
            .await
            .unwrap();
        assert!(started.elapsed() >= Duration::from_millis(500));

        let percents: Vec<f64> = notices
            .iter()
            .filter_map(|n| match n {
                Notice::Progress(p) => Some(p.percent),
                _ => None,
            })
            .collect();
        // No time passes between chunks, so only the first chunk and the >=99% one emit.
        assert_eq!(percents, vec![12.5, 100.0]);
        assert_eq!(notices.last(), Some(&Notice::BatchComplete));
    }
}
