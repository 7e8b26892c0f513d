//! Seams the host implements: the duplex channel, file sources, and storage sinks.
//!
//! Inbound channel events (open, close, error, message) are not callbacks here;
//! the host turns them into [`crate::lifecycle::Event`]s and feeds the dispatcher.

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;

use crate::protocol::WireMessage;

/// Ordered, reliable, message-boundary-preserving transport to the peer.
#[async_trait]
pub trait DuplexChannel: Send + Sync {
    /// Queue one message. Returns once the message is accepted, not once it is on the wire.
    async fn send(&self, msg: WireMessage) -> Result<(), ChannelError>;

    /// Bytes accepted by `send` but not yet flushed to the wire.
    fn pending_bytes(&self) -> u64;

    fn is_open(&self) -> bool;
}

#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("channel closed")]
    Closed,
    #[error("channel I/O: {0}")]
    Io(#[from] io::Error),
}

/// Cooperative cancellation flag, one per batch.
///
/// A fresh flag is issued for every batch, so a stale task from a cancelled batch
/// keeps observing its own (set) flag.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Two flags are equal when they belong to the same batch.
impl PartialEq for CancelFlag {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl Eq for CancelFlag {}

/// A file the origin offers, readable by range.
#[async_trait]
pub trait FileSource: Send {
    fn name(&self) -> &str;
    fn size(&self) -> u64;
    fn content_type(&self) -> &str;
    /// Read exactly `len` bytes starting at `offset`.
    async fn read_chunk(&mut self, offset: u64, len: usize) -> io::Result<Vec<u8>>;
}

/// Writable storage target for a streamed file.
#[async_trait]
pub trait Sink: Send {
    async fn write(&mut self, bytes: &[u8]) -> io::Result<()>;
    async fn close(&mut self) -> io::Result<()>;

    /// Give up on a partially written file. Defaults to a plain close.
    async fn abort(&mut self) -> io::Result<()> {
        self.close().await
    }
}

/// Result of asking the host for a save target.
pub enum SinkOpen {
    Opened(Box<dyn Sink>),
    /// The user dismissed the save prompt. Not an error.
    Declined,
}

/// Storage sink capability. Hosts without direct-to-storage writes report `supports_streaming() == false`.
#[async_trait]
pub trait SinkProvider: Send {
    fn supports_streaming(&self) -> bool;
    async fn open_sink(&mut self, suggested_name: &str, size: u64) -> io::Result<SinkOpen>;
}

/// Provider for hosts with no streaming capability; every file is buffered.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoStreaming;

#[async_trait]
impl SinkProvider for NoStreaming {
    fn supports_streaming(&self) -> bool {
        false
    }

    async fn open_sink(&mut self, _suggested_name: &str, _size: u64) -> io::Result<SinkOpen> {
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "streaming not supported",
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cancel_flag_is_shared_between_clones() {
        let a = CancelFlag::new();
        let b = a.clone();
        assert!(!b.is_cancelled());
        a.cancel();
        assert!(b.is_cancelled());
        // A new batch gets an independent flag.
        assert!(!CancelFlag::new().is_cancelled());
    }
}
