//! Sender -> channel -> assembler over in-memory channels.

use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use skiff_core::channel::NoStreaming;
use skiff_core::chunk::chunk_count;
use skiff_core::protocol::decode;
use skiff_core::{
    Action, AssemblerOutput, CancelFlag, ChannelError, ControlFrame, DuplexChannel, Event, FileSender, FileSource,
    Frame, Notice, ReceiveAssembler, ReceivedFile, Role, RoomCode, SendOutcome, SessionController, TransferConfig,
    WireMessage,
};
use tokio::time::Instant;

struct MemFile {
    name: String,
    data: Vec<u8>,
}

impl MemFile {
    fn new(name: &str, len: usize, seed: u8) -> Self {
        Self {
            name: name.to_string(),
            data: (0..len).map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed)).collect(),
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

struct DrainState {
    pending: u64,
    last: Instant,
}

/// Channel that flushes `rate` bytes per millisecond of virtual time.
struct SlowDrainChannel {
    rate: u64,
    state: Mutex<DrainState>,
    sent: Mutex<Vec<WireMessage>>,
    /// Highest pending count observed right before a data frame was accepted.
    max_before_data: AtomicU64,
}

impl SlowDrainChannel {
    fn new(rate: u64) -> Self {
        Self {
            rate,
            state: Mutex::new(DrainState {
                pending: 0,
                last: Instant::now(),
            }),
            sent: Mutex::new(Vec::new()),
            max_before_data: AtomicU64::new(0),
        }
    }

    fn drain(&self) -> u64 {
        let mut s = self.state.lock().unwrap();
        let now = Instant::now();
        let drained = now.duration_since(s.last).as_millis() as u64;
        let drained = drained.saturating_mul(self.rate);
        if drained > 0 {
            s.pending = s.pending.saturating_sub(drained);
            s.last = now;
        }
        s.pending
    }

    fn take_sent(&self) -> Vec<WireMessage> {
        std::mem::take(&mut self.sent.lock().unwrap())
    }
}

#[async_trait]
impl DuplexChannel for SlowDrainChannel {
    async fn send(&self, msg: WireMessage) -> Result<(), ChannelError> {
        let before = self.drain();
        if matches!(msg, WireMessage::Binary(_)) {
            self.max_before_data.fetch_max(before, Ordering::SeqCst);
        }
        self.state.lock().unwrap().pending += msg.len() as u64;
        self.sent.lock().unwrap().push(msg);
        Ok(())
    }

    fn pending_bytes(&self) -> u64 {
        self.drain()
    }

    fn is_open(&self) -> bool {
        true
    }
}

async fn receive_all(messages: Vec<WireMessage>) -> Vec<ReceivedFile> {
    let mut rx = ReceiveAssembler::new(NoStreaming, TransferConfig::default());
    let mut delivered = Vec::new();
    for msg in messages {
        for out in rx.on_frame(decode(msg).unwrap()).await {
            if let AssemblerOutput::Deliver(files) = out {
                delivered.extend(files);
            }
        }
    }
    assert!(rx.is_idle());
    delivered
}

#[tokio::test(start_paused = true)]
async fn artifacts_are_byte_identical() {
    let config = TransferConfig::default();
    let c = config.chunk_size;
    let sizes = [0, 1, c - 1, c, c + 1, 10 * c];
    let mut files: Vec<MemFile> = sizes
        .iter()
        .enumerate()
        .map(|(i, &len)| MemFile::new(&format!("f{i}"), len, i as u8))
        .collect();
    let originals: Vec<Vec<u8>> = files.iter().map(|f| f.data.clone()).collect();

    let channel = SlowDrainChannel::new(u64::MAX / 1_000_000);
    let outcome = FileSender::new(&channel, &config, CancelFlag::new())
        .send_batch(&mut files, |_| {})
        .await
        .unwrap();
    assert_eq!(outcome, SendOutcome::Completed);

    let sent = channel.take_sent();
    let data_frames: Vec<usize> = sent
        .iter()
        .filter_map(|m| match m {
            WireMessage::Binary(b) => Some(b.len()),
            WireMessage::Text(_) => None,
        })
        .collect();
    let expected: u64 = sizes.iter().map(|&s| chunk_count(s as u64, c)).sum();
    assert_eq!(data_frames.len() as u64, expected);
    assert_eq!(data_frames.iter().sum::<usize>(), sizes.iter().sum::<usize>());

    let delivered = receive_all(sent).await;
    assert_eq!(delivered.len(), sizes.len());
    for (file, original) in delivered.iter().zip(&originals) {
        assert_eq!(file.size, original.len() as u64);
        assert_eq!(&file.artifact, original, "{} differs", file.name);
    }
}

#[tokio::test(start_paused = true)]
async fn pending_stays_under_cap_on_slow_drain() {
    let config = TransferConfig {
        chunk_size: 16 * 1024,
        max_buffer_bytes: 64 * 1024,
        settle_delay_ms: 0,
        ..TransferConfig::default()
    };
    let channel = SlowDrainChannel::new(4 * 1024);
    let mut files = vec![MemFile::new("slow.bin", 1024 * 1024, 7)];
    let started = Instant::now();
    FileSender::new(&channel, &config, CancelFlag::new())
        .send_batch(&mut files, |_| {})
        .await
        .unwrap();

    // Every data frame was accepted with the queue at or below the ceiling.
    assert!(channel.max_before_data.load(Ordering::SeqCst) <= config.max_buffer_bytes);
    // The drain rate bounds throughput: 1 MiB at 4 KiB/ms needs well over 100 ms.
    assert!(started.elapsed() >= Duration::from_millis(200));

    let delivered = receive_all(channel.take_sent()).await;
    assert_eq!(delivered[0].artifact, files[0].data);
}

#[tokio::test(start_paused = true)]
async fn cancelled_batch_then_fresh_batch() {
    let config = TransferConfig {
        chunk_size: 1024,
        max_buffer_bytes: 4 * 1024,
        settle_delay_ms: 0,
        ..TransferConfig::default()
    };
    let channel = SlowDrainChannel::new(1024);
    let cancel = CancelFlag::new();
    let canceller = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(20)).await;
        canceller.cancel();
    });
    let mut big = vec![MemFile::new("big", 256 * 1024, 1), MemFile::new("second", 10, 2)];
    let outcome = FileSender::new(&channel, &config, cancel)
        .send_batch(&mut big, |_| {})
        .await
        .unwrap();
    assert_eq!(outcome, SendOutcome::Cancelled);

    // The receiver sees the partial batch, then the peer's cancel, then a new batch.
    let mut rx = ReceiveAssembler::new(NoStreaming, TransferConfig::default());
    for msg in channel.take_sent() {
        rx.on_frame(decode(msg).unwrap()).await;
    }
    assert!(!rx.is_idle());
    rx.on_frame(Frame::Control(ControlFrame::Cancel)).await;
    rx.on_frame(Frame::Control(ControlFrame::Cancel)).await;
    assert!(rx.is_idle());

    let mut again = vec![MemFile::new("again", 3000, 9)];
    FileSender::new(&channel, &config, CancelFlag::new())
        .send_batch(&mut again, |_| {})
        .await
        .unwrap();
    let mut delivered = Vec::new();
    for msg in channel.take_sent() {
        for out in rx.on_frame(decode(msg).unwrap()).await {
            if let AssemblerOutput::Deliver(files) = out {
                delivered.extend(files);
            }
        }
    }
    assert_eq!(delivered.len(), 1);
    assert_eq!(delivered[0].artifact, again[0].data);
}

/// Target side wired the way a host wires it: controls go to the controller first,
/// every frame then goes to the assembler, and aborts are applied to the assembler.
struct TargetSide {
    ctl: SessionController,
    rx: ReceiveAssembler<NoStreaming>,
    outputs: Vec<AssemblerOutput>,
}

impl TargetSide {
    fn open() -> Self {
        let config = TransferConfig::default();
        let mut ctl = SessionController::new(Role::Target, &config);
        ctl.handle(Event::RoomJoined(RoomCode::parse("ABC123").unwrap()));
        ctl.handle(Event::ChannelOpened);
        Self {
            ctl,
            rx: ReceiveAssembler::new(NoStreaming, config),
            outputs: Vec::new(),
        }
    }

    async fn apply(&mut self, actions: Vec<Action>) {
        for action in actions {
            if let Action::AbortTransfer { discard_in_flight } = action {
                if discard_in_flight {
                    self.rx.cancel().await;
                } else {
                    self.rx.reset().await;
                }
            }
        }
    }

    async fn frame(&mut self, msg: WireMessage) {
        let frame = decode(msg).unwrap();
        if let Frame::Control(c) = &frame {
            let actions = self.ctl.handle(Event::Control(c.clone()));
            self.apply(actions).await;
        }
        let out = self.rx.on_frame(frame).await;
        self.outputs.extend(out);
    }

    fn delivered(&self) -> Vec<&ReceivedFile> {
        self.outputs
            .iter()
            .filter_map(|o| match o {
                AssemblerOutput::Deliver(files) => Some(files),
                _ => None,
            })
            .flatten()
            .collect()
    }

    fn completed(&self) -> bool {
        self.outputs
            .iter()
            .any(|o| *o == AssemblerOutput::Notify(Notice::BatchComplete))
    }
}

#[tokio::test(start_paused = true)]
async fn receiver_cancel_drops_frames_already_in_flight() {
    let config = TransferConfig {
        settle_delay_ms: 0,
        ..TransferConfig::default()
    };
    let channel = SlowDrainChannel::new(u64::MAX / 1_000_000);
    let mut files = vec![MemFile::new("one", 3, 1), MemFile::new("two", 3, 2)];
    FileSender::new(&channel, &config, CancelFlag::new())
        .send_batch(&mut files, |_| {})
        .await
        .unwrap();
    let batch = channel.take_sent();
    // metadata, data, end per file
    assert_eq!(batch.len(), 6);

    let mut target = TargetSide::open();
    let mut in_flight = batch.clone().into_iter();
    for msg in in_flight.by_ref().take(2) {
        target.frame(msg).await;
    }
    let actions = target.ctl.handle(Event::LocalCancel);
    assert!(actions.contains(&Action::Send(ControlFrame::Cancel)));
    target.apply(actions).await;

    // The origin had the rest of the batch queued before our cancel reached it.
    for msg in in_flight {
        target.frame(msg).await;
    }
    assert!(target.delivered().is_empty());
    assert!(!target.completed());
    assert!(target.rx.is_idle());

    // The next batch starts at index 1 and is accepted in full.
    for msg in batch {
        target.frame(msg).await;
    }
    let delivered = target.delivered();
    assert_eq!(delivered.len(), 2);
    assert_eq!(delivered[0].artifact, files[0].data);
    assert_eq!(delivered[1].artifact, files[1].data);
    assert!(target.completed());
}
