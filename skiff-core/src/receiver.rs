//! Receive assembler: turns the inbound frame stream back into files.
//!
//! Each file is received into one of two buffers, picked at metadata time and
//! kept for the file's lifetime: retained chunks in memory, or a storage sink
//! written chunk by chunk. Frames that arrive with no active file are dropped.

use std::mem;

use tracing::{debug, info, warn};

use crate::channel::{Sink, SinkOpen, SinkProvider};
use crate::config::TransferConfig;
use crate::events::{Direction, Notice, Progress};
use crate::progress::{now, ProgressTracker};
use crate::protocol::{ControlFrame, FileMetadata, Frame};

/// One completed in-memory file, ready for the delivery step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedFile {
    pub name: String,
    pub content_type: String,
    pub size: u64,
    pub artifact: Vec<u8>,
}

/// What the host must do after a frame is consumed.
#[derive(Debug, PartialEq)]
pub enum AssemblerOutput {
    Notify(Notice),
    /// Hand the batch's buffered files to the delivery step.
    Deliver(Vec<ReceivedFile>),
    /// Send a control frame back to the origin.
    Reply(ControlFrame),
}

enum ReceiveBuffer {
    Buffered { chunks: Vec<Vec<u8>>, received: u64 },
    Streamed { sink: Box<dyn Sink>, written: u64 },
}

impl ReceiveBuffer {
    fn received(&self) -> u64 {
        match self {
            ReceiveBuffer::Buffered { received, .. } => *received,
            ReceiveBuffer::Streamed { written, .. } => *written,
        }
    }

    fn is_streamed(&self) -> bool {
        matches!(self, ReceiveBuffer::Streamed { .. })
    }
}

struct ActiveFile {
    meta: FileMetadata,
    buffer: ReceiveBuffer,
}

pub struct ReceiveAssembler<P> {
    provider: P,
    config: TransferConfig,
    tracker: ProgressTracker,
    active: Option<ActiveFile>,
    completed: Vec<ReceivedFile>,
    /// Set after a cancel or failure: everything up to the next batch start is stale.
    discarding: bool,
}

impl<P: SinkProvider> ReceiveAssembler<P> {
    pub fn new(provider: P, config: TransferConfig) -> Self {
        let tracker = ProgressTracker::new(&config);
        Self {
            provider,
            config,
            tracker,
            active: None,
            completed: Vec::new(),
            discarding: false,
        }
    }

    /// No file in flight and nothing waiting for delivery.
    pub fn is_idle(&self) -> bool {
        self.active.is_none() && self.completed.is_empty()
    }

    pub fn provider(&self) -> &P {
        &self.provider
    }

    pub async fn on_frame(&mut self, frame: Frame) -> Vec<AssemblerOutput> {
        match frame {
            Frame::Control(ControlFrame::Metadata(meta)) => self.on_metadata(meta).await,
            Frame::Data(bytes) => self.on_data(bytes).await,
            Frame::Control(ControlFrame::End) => self.on_end().await,
            Frame::Control(ControlFrame::Cancel) => {
                info!(event = "peer_cancelled", "Peer cancelled the batch");
                self.cancel().await;
                vec![AssemblerOutput::Notify(Notice::Cancelled)]
            }
            Frame::Control(ControlFrame::Heartbeat | ControlFrame::IntentionalDisconnect) => {
                Vec::new()
            }
        }
    }

    /// Drop all in-flight state and ignore frames until the next batch starts.
    /// Safe to call any number of times.
    pub async fn cancel(&mut self) {
        if let Some(active) = self.active.take() {
            abort_quietly(active).await;
        }
        self.completed.clear();
        self.discarding = true;
    }

    /// Clear in-flight state after the channel is lost. The next batch starts fresh.
    pub async fn reset(&mut self) {
        self.cancel().await;
        self.discarding = false;
    }

    async fn on_metadata(&mut self, meta: FileMetadata) -> Vec<AssemblerOutput> {
        if self.discarding && !meta.is_first() {
            debug!(event = "stale_metadata", file = %meta.name, index = meta.index, "Dropping metadata from a cancelled batch");
            return Vec::new();
        }
        self.discarding = false;
        if let Some(previous) = self.active.take() {
            debug!(event = "file_abandoned", file = %previous.meta.name, "Metadata replaced an unfinished file");
            abort_quietly(previous).await;
        }
        if meta.is_first() {
            self.completed.clear();
        }

        let buffer = if meta.size > self.config.streaming_threshold && self.provider.supports_streaming() {
            match self.provider.open_sink(&meta.name, meta.size).await {
                Ok(SinkOpen::Opened(sink)) => ReceiveBuffer::Streamed { sink, written: 0 },
                Ok(SinkOpen::Declined) => {
                    info!(event = "save_declined", file = %meta.name, "Save target declined, cancelling batch");
                    self.cancel().await;
                    return vec![
                        AssemblerOutput::Notify(Notice::Cancelled),
                        AssemblerOutput::Reply(ControlFrame::Cancel),
                    ];
                }
                Err(e) => {
                    warn!(event = "sink_open_failed", file = %meta.name, error = %e, "Falling back to buffered receive");
                    ReceiveBuffer::Buffered {
                        chunks: Vec::new(),
                        received: 0,
                    }
                }
            }
        } else {
            ReceiveBuffer::Buffered {
                chunks: Vec::new(),
                received: 0,
            }
        };

        info!(
            event = "file_receive_start",
            file = %meta.name,
            bytes = meta.size,
            index = meta.index,
            total = meta.total,
            streamed = buffer.is_streamed(),
            "Receiving file"
        );
        self.tracker.start_file(now());
        self.active = Some(ActiveFile { meta, buffer });
        Vec::new()
    }

    async fn on_data(&mut self, bytes: Vec<u8>) -> Vec<AssemblerOutput> {
        let Some(active) = self.active.as_mut() else {
            debug!(event = "orphan_chunk", bytes = bytes.len(), "Dropping chunk with no active file");
            return Vec::new();
        };
        let first_chunk = active.buffer.received() == 0;
        let len = bytes.len() as u64;
        match &mut active.buffer {
            ReceiveBuffer::Buffered { chunks, received } => {
                chunks.push(bytes);
                *received += len;
            }
            ReceiveBuffer::Streamed { sink, written } => {
                if let Err(e) = sink.write(&bytes).await {
                    let name = active.meta.name.clone();
                    warn!(event = "sink_write_failed", file = %name, error = %e, "Storage write failed");
                    self.cancel().await;
                    return vec![
                        AssemblerOutput::Notify(Notice::Error(format!("writing {name}: {e}"))),
                        AssemblerOutput::Reply(ControlFrame::Cancel),
                    ];
                }
                *written += len;
            }
        }

        let done = active.buffer.received();
        match self.tracker.observe(now(), done, active.meta.size, first_chunk) {
            Some(s) => vec![AssemblerOutput::Notify(Notice::Progress(Progress {
                direction: Direction::Receiving,
                file_name: active.meta.name.clone(),
                index: active.meta.index,
                total: active.meta.total,
                percent: s.percent,
                speed: s.speed,
                eta: s.eta,
            }))],
            None => Vec::new(),
        }
    }

    async fn on_end(&mut self) -> Vec<AssemblerOutput> {
        let Some(ActiveFile { meta, buffer }) = self.active.take() else {
            debug!(event = "orphan_end", "Dropping end marker with no active file");
            return Vec::new();
        };
        let mut out = Vec::new();
        match buffer {
            ReceiveBuffer::Streamed { mut sink, written } => {
                if let Err(e) = sink.close().await {
                    warn!(event = "sink_close_failed", file = %meta.name, error = %e, "Closing storage target failed");
                    self.cancel().await;
                    return vec![
                        AssemblerOutput::Notify(Notice::Error(format!("saving {}: {e}", meta.name))),
                        AssemblerOutput::Reply(ControlFrame::Cancel),
                    ];
                }
                info!(event = "file_saved", file = %meta.name, bytes = written, "Streamed file closed");
                out.push(AssemblerOutput::Notify(Notice::FileSaved {
                    name: meta.name.clone(),
                    size: written,
                }));
            }
            ReceiveBuffer::Buffered { chunks, received } => {
                let artifact = concat_draining(chunks, received);
                info!(event = "file_assembled", file = %meta.name, bytes = artifact.len(), "Buffered file assembled");
                self.completed.push(ReceivedFile {
                    size: artifact.len() as u64,
                    name: meta.name.clone(),
                    content_type: meta.content_type.clone(),
                    artifact,
                });
            }
        }

        if meta.is_last() {
            if !self.completed.is_empty() {
                out.push(AssemblerOutput::Deliver(mem::take(&mut self.completed)));
            }
            info!(event = "batch_received", files = meta.total, "Batch complete");
            out.push(AssemblerOutput::Notify(Notice::BatchComplete));
        }
        out
    }
}

/// Concatenate chunks, freeing each one as soon as it is copied.
fn concat_draining(chunks: Vec<Vec<u8>>, total: u64) -> Vec<u8> {
    let mut artifact = Vec::with_capacity(total as usize);
    for chunk in chunks {
        artifact.extend_from_slice(&chunk);
    }
    artifact
}

async fn abort_quietly(active: ActiveFile) {
    if let ReceiveBuffer::Streamed { mut sink, .. } = active.buffer {
        if let Err(e) = sink.abort().await {
            debug!(event = "sink_abort_failed", file = %active.meta.name, error = %e);
        }
    }
}
