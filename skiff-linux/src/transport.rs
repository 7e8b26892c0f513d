//! TCP duplex channel: one writer task, one reader task, framed with `skiff_core::wire`.

use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use skiff_core::wire::{encode_frame, FrameHeader, HEADER_SIZE};
use skiff_core::{ChannelError, DuplexChannel, WireMessage};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

const DIAL_TIMEOUT: Duration = Duration::from_secs(5);

/// Inbound events, tagged with the id the channel was spawned with.
#[derive(Debug)]
pub enum ChannelEvent {
    Message { id: u64, msg: WireMessage },
    Closed { id: u64, error: Option<String> },
}

enum Outgoing {
    Frame(Vec<u8>),
    Close,
}

pub struct TcpChannel {
    id: u64,
    tx: mpsc::UnboundedSender<Outgoing>,
    pending: Arc<AtomicU64>,
    open: Arc<AtomicBool>,
    reader: JoinHandle<()>,
    writer: Mutex<Option<JoinHandle<()>>>,
}

impl TcpChannel {
    /// Take over a connected stream. Inbound messages and the close go to `events`.
    pub fn spawn(stream: TcpStream, id: u64, events: mpsc::UnboundedSender<ChannelEvent>) -> Self {
        let _ = stream.set_nodelay(true);
        let (reader, writer) = stream.into_split();
        let (tx, rx) = mpsc::unbounded_channel();
        let pending = Arc::new(AtomicU64::new(0));
        let open = Arc::new(AtomicBool::new(true));

        let writer = tokio::spawn(run_writer(writer, rx, pending.clone(), open.clone(), id));
        let reader = tokio::spawn(run_reader(reader, events, open.clone(), id));
        Self {
            id,
            tx,
            pending,
            open,
            reader,
            writer: Mutex::new(Some(writer)),
        }
    }

    /// Flush what is queued, then close. Waits at most `timeout` for the flush.
    pub async fn shutdown(&self, timeout: Duration) {
        self.open.store(false, Ordering::SeqCst);
        self.reader.abort();
        let _ = self.tx.send(Outgoing::Close);
        let writer = self.writer.lock().ok().and_then(|mut w| w.take());
        if let Some(writer) = writer {
            if tokio::time::timeout(timeout, writer).await.is_err() {
                debug!(event = "flush_timeout", channel = self.id);
            }
        }
    }
}

impl Drop for TcpChannel {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

#[async_trait]
impl DuplexChannel for TcpChannel {
    async fn send(&self, msg: WireMessage) -> Result<(), ChannelError> {
        if !self.is_open() {
            return Err(ChannelError::Closed);
        }
        let frame = encode_frame(&msg).map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
        self.pending.fetch_add(frame.len() as u64, Ordering::SeqCst);
        self.tx
            .send(Outgoing::Frame(frame))
            .map_err(|_| ChannelError::Closed)
    }

    fn pending_bytes(&self) -> u64 {
        self.pending.load(Ordering::SeqCst)
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }
}

async fn run_writer(
    mut writer: OwnedWriteHalf,
    mut rx: mpsc::UnboundedReceiver<Outgoing>,
    pending: Arc<AtomicU64>,
    open: Arc<AtomicBool>,
    id: u64,
) {
    while let Some(out) = rx.recv().await {
        match out {
            Outgoing::Frame(frame) => {
                let len = frame.len() as u64;
                if let Err(e) = writer.write_all(&frame).await {
                    warn!(event = "write_failed", channel = id, error = %e);
                    open.store(false, Ordering::SeqCst);
                    return;
                }
                pending.fetch_sub(len, Ordering::SeqCst);
                trace!(channel = id, bytes = len, "frame written");
            }
            Outgoing::Close => break,
        }
    }
    let _ = writer.flush().await;
    let _ = writer.shutdown().await;
}

async fn run_reader(
    mut reader: OwnedReadHalf,
    events: mpsc::UnboundedSender<ChannelEvent>,
    open: Arc<AtomicBool>,
    id: u64,
) {
    let error = loop {
        match read_message(&mut reader).await {
            Ok(Some(msg)) => {
                if events.send(ChannelEvent::Message { id, msg }).is_err() {
                    break None;
                }
            }
            Ok(None) => break None,
            Err(e) => break Some(e.to_string()),
        }
    };
    open.store(false, Ordering::SeqCst);
    debug!(event = "channel_closed", channel = id, error = ?error);
    let _ = events.send(ChannelEvent::Closed { id, error });
}

/// Next message, or `None` on a clean end of stream at a frame boundary.
async fn read_message(reader: &mut OwnedReadHalf) -> io::Result<Option<WireMessage>> {
    let mut head = [0u8; HEADER_SIZE];
    match reader.read_exact(&mut head).await {
        Ok(_) => {}
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e),
    }
    let header = FrameHeader::parse(&head).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    let mut payload = vec![0u8; header.len];
    reader.read_exact(&mut payload).await?;
    header
        .into_message(payload)
        .map(Some)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
}

pub async fn bind_listener(port: u16) -> io::Result<TcpListener> {
    TcpListener::bind(("0.0.0.0", port)).await
}

/// Forward every accepted stream to `out`, wrapped by `wrap`, until the receiver is gone.
pub fn spawn_acceptor<T: Send + 'static>(
    listener: TcpListener,
    out: mpsc::UnboundedSender<T>,
    wrap: fn(TcpStream) -> T,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match listener.accept().await {
                Ok((stream, peer)) => {
                    debug!(event = "accepted", %peer);
                    if out.send(wrap(stream)).is_err() {
                        break;
                    }
                }
                Err(e) => {
                    warn!(event = "accept_failed", error = %e);
                    break;
                }
            }
        }
    })
}

/// Connect to the first reachable candidate.
pub async fn dial(candidates: &[SocketAddr]) -> io::Result<TcpStream> {
    let mut last = io::Error::new(io::ErrorKind::NotFound, "no candidates");
    for addr in candidates {
        match tokio::time::timeout(DIAL_TIMEOUT, TcpStream::connect(addr)).await {
            Ok(Ok(stream)) => return Ok(stream),
            Ok(Err(e)) => last = e,
            Err(_) => last = io::Error::new(io::ErrorKind::TimedOut, format!("connecting to {addr}")),
        }
        debug!(event = "dial_failed", %addr, error = %last);
    }
    Err(last)
}

/// Local IPv4 address the default route would use. No packet is sent.
pub fn local_ipv4() -> io::Result<Ipv4Addr> {
    let socket = UdpSocket::bind("0.0.0.0:0")?;
    socket.connect("8.8.8.8:80")?;
    match socket.local_addr()?.ip() {
        IpAddr::V4(ip) if !ip.is_unspecified() => Ok(ip),
        other => Err(io::Error::new(
            io::ErrorKind::AddrNotAvailable,
            format!("no usable IPv4 address ({other})"),
        )),
    }
}
