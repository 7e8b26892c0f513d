//! Notices for the presentation layer.

use std::net::Ipv4Addr;

/// Which way bytes are moving for a progress sample.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Sending,
    Receiving,
}

/// A throttled progress sample for the file in flight.
#[derive(Debug, Clone, PartialEq)]
pub struct Progress {
    pub direction: Direction,
    pub file_name: String,
    pub index: u32,
    pub total: u32,
    /// 0.0..=100.0
    pub percent: f64,
    /// Bytes per second; `None` until the rate warm-up has elapsed.
    pub speed: Option<f64>,
    /// Seconds remaining; `None` while the speed is unknown or zero.
    pub eta: Option<f64>,
}

/// Everything the core tells the user about.
#[derive(Debug, Clone, PartialEq)]
pub enum Notice {
    Progress(Progress),
    /// A streamed file was closed on storage.
    FileSaved { name: String, size: u64 },
    BatchComplete,
    Cancelled,
    Reconnecting,
    Reconnected,
    ConnectionLost,
    NetworkMismatch { local: Ipv4Addr, peer: Ipv4Addr },
    /// Peer ended the session on purpose.
    PeerLeft,
    Error(String),
}
