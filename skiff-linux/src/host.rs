//! Session host: runs one send or receive session against the relay and a TCP channel.
//!
//! A single task owns the controller, the channel and the assembler. Everything
//! else (relay reader, acceptor, dialer, timers, sender) reports back through
//! one event queue. Timer tasks hold only a weak sender, so they never keep the
//! host alive.

use std::collections::{HashMap, VecDeque};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use skiff_core::netcheck::{candidate_addr, host_candidate};
use skiff_core::protocol::{decode, encode_control};
use skiff_core::signaling::{ClientMessage, ServerMessage};
use skiff_core::{
    Action, AssemblerOutput, CancelFlag, ControlFrame, DuplexChannel, Event, FileSender, Frame, LifecycleState,
    Notice, ReceiveAssembler, Role, RoomCode, SendError, SendOutcome, SessionController, TimerHandle,
};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::Config;
use crate::files::DiskFile;
use crate::signal_client::RelayClient;
use crate::storage::{self, DiskSinks, SavePrompt};
use crate::transport::{self, ChannelEvent, TcpChannel};
use crate::ui;

/// Target re-dials this often while the channel is down.
const REDIAL_INTERVAL: Duration = Duration::from_secs(2);
/// Upper bound on flushing queued frames when closing the channel.
const FLUSH_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub enum Mode {
    Send(Vec<PathBuf>),
    Receive(RoomCode),
}

impl Mode {
    fn role(&self) -> Role {
        match self {
            Mode::Send(_) => Role::Origin,
            Mode::Receive(_) => Role::Target,
        }
    }
}

#[derive(Debug)]
pub enum HostEvent {
    Relay(ServerMessage),
    RelayClosed,
    Channel(ChannelEvent),
    Incoming(TcpStream),
    Dialed(TcpStream),
    Timer(TimerHandle),
    Notice(Notice),
    SendDone {
        batch: CancelFlag,
        result: Result<SendOutcome, SendError>,
    },
    Interrupt,
    Terminate,
    Backgrounded,
    Foregrounded,
}

/// External inputs to a running host: interrupts and visibility hints.
#[derive(Debug, Clone)]
pub struct HostHandle(mpsc::UnboundedSender<HostEvent>);

impl HostHandle {
    pub fn interrupt(&self) {
        let _ = self.0.send(HostEvent::Interrupt);
    }

    pub fn terminate(&self) {
        let _ = self.0.send(HostEvent::Terminate);
    }

    pub fn backgrounded(&self) {
        let _ = self.0.send(HostEvent::Backgrounded);
    }

    pub fn foregrounded(&self) {
        let _ = self.0.send(HostEvent::Foregrounded);
    }
}

/// How a session ended when it ended well.
#[derive(Debug, Default)]
pub struct Summary {
    pub room: Option<RoomCode>,
    /// Buffered files written by the delivery step.
    pub saved: Vec<PathBuf>,
    pub batch_complete: bool,
}

pub struct Host {
    mode: Mode,
    config: Config,
    ctl: SessionController,
    relay: RelayClient,
    room: Option<RoomCode>,
    announce: Option<oneshot::Sender<RoomCode>>,
    notices: Option<mpsc::UnboundedSender<Notice>>,
    events_tx: mpsc::UnboundedSender<HostEvent>,
    events_rx: mpsc::UnboundedReceiver<HostEvent>,
    chan_tx: mpsc::UnboundedSender<ChannelEvent>,
    chan_rx: mpsc::UnboundedReceiver<ChannelEvent>,
    timers: HashMap<TimerHandle, JoinHandle<()>>,
    channel: Option<Arc<TcpChannel>>,
    channel_id: u64,
    acceptor: Option<JoinHandle<()>>,
    candidates: Vec<SocketAddr>,
    redial: Option<JoinHandle<()>>,
    assembler: ReceiveAssembler<DiskSinks>,
    batch: Option<CancelFlag>,
    sending: Option<JoinHandle<()>>,
    /// The channel came back before the interrupted batch's task reported in.
    restart_batch: bool,
    summary: Summary,
    failure: Option<String>,
    finished: bool,
}

impl Host {
    /// Connect to the relay and prepare a session. Nothing is sent until [`Host::run`].
    pub async fn connect(
        mode: Mode,
        config: Config,
        prompt: Option<Box<dyn SavePrompt>>,
    ) -> anyhow::Result<(Self, HostHandle)> {
        let (relay, mut relay_rx) = RelayClient::connect(&config.relay_addr)
            .await
            .with_context(|| format!("connecting to relay at {}", config.relay_addr))?;
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (chan_tx, chan_rx) = mpsc::unbounded_channel();

        let forward = events_tx.clone();
        tokio::spawn(async move {
            while let Some(msg) = relay_rx.recv().await {
                if forward.send(HostEvent::Relay(msg)).is_err() {
                    return;
                }
            }
            let _ = forward.send(HostEvent::RelayClosed);
        });

        let sinks = DiskSinks::new(config.download_dir.clone(), config.stream_large_files, prompt);
        let host = Self {
            ctl: SessionController::new(mode.role(), &config.transfer),
            assembler: ReceiveAssembler::new(sinks, config.transfer.clone()),
            mode,
            config,
            relay,
            room: None,
            announce: None,
            notices: None,
            events_tx: events_tx.clone(),
            events_rx,
            chan_tx,
            chan_rx,
            timers: HashMap::new(),
            channel: None,
            channel_id: 0,
            acceptor: None,
            candidates: Vec::new(),
            redial: None,
            batch: None,
            sending: None,
            restart_batch: false,
            summary: Summary::default(),
            failure: None,
            finished: false,
        };
        Ok((host, HostHandle(events_tx)))
    }

    /// Deliver the room code here once the relay assigns it.
    pub fn announce_room(mut self, tx: oneshot::Sender<RoomCode>) -> Self {
        self.announce = Some(tx);
        self
    }

    /// Copy every notice the session presents to `tx`, for wrapper UIs.
    pub fn observe_notices(mut self, tx: mpsc::UnboundedSender<Notice>) -> Self {
        self.notices = Some(tx);
        self
    }

    pub async fn run(mut self) -> anyhow::Result<Summary> {
        match &self.mode {
            Mode::Send(_) => self.relay.send(ClientMessage::CreateRoom),
            Mode::Receive(code) => self.relay.send(ClientMessage::JoinRoom { room: code.to_string() }),
        }
        while !self.finished {
            let event = tokio::select! {
                Some(ev) = self.events_rx.recv() => ev,
                Some(ev) = self.chan_rx.recv() => HostEvent::Channel(ev),
                else => break,
            };
            self.on_event(event).await;
        }
        self.shutdown().await;
        match self.failure {
            Some(msg) => Err(anyhow::anyhow!(msg)),
            None => Ok(self.summary),
        }
    }

    async fn on_event(&mut self, event: HostEvent) {
        match event {
            HostEvent::Relay(msg) => self.on_relay(msg).await,
            HostEvent::RelayClosed => {
                if matches!(self.ctl.state(), LifecycleState::Idle | LifecycleState::AwaitingPeer) {
                    self.fail("relay connection closed before pairing".to_string());
                } else {
                    warn!(event = "relay_closed", "Relay connection closed");
                }
            }
            HostEvent::Channel(ChannelEvent::Message { id, msg }) if id == self.channel_id => {
                match decode(msg) {
                    Ok(frame) => self.on_frame(frame).await,
                    Err(e) => warn!(event = "malformed_frame", error = %e, "Dropping frame"),
                }
            }
            HostEvent::Channel(ChannelEvent::Closed { id, error }) if id == self.channel_id => {
                self.channel = None;
                match error {
                    Some(e) => self.feed(Event::ChannelError(e)).await,
                    None => self.feed(Event::ChannelClosed).await,
                }
            }
            HostEvent::Channel(_) => debug!(event = "stale_channel_event"),
            HostEvent::Incoming(stream) | HostEvent::Dialed(stream) => self.attach(stream).await,
            HostEvent::Timer(handle) => {
                self.timers.remove(&handle);
                self.feed(Event::TimerFired(handle)).await;
            }
            HostEvent::Notice(n) => self.present(&n),
            HostEvent::SendDone { batch, result } => self.on_send_done(batch, result).await,
            HostEvent::Interrupt => {
                if self.ctl.state() == LifecycleState::Transferring {
                    self.feed(Event::LocalCancel).await;
                } else {
                    self.feed(Event::LocalTeardown).await;
                }
            }
            HostEvent::Terminate => self.feed(Event::LocalTeardown).await,
            HostEvent::Backgrounded => self.feed(Event::Backgrounded).await,
            HostEvent::Foregrounded => {
                let channel_open = self.channel_open();
                self.feed(Event::Foregrounded { channel_open }).await;
            }
        }
    }

    async fn on_relay(&mut self, msg: ServerMessage) {
        match msg {
            ServerMessage::RoomCreated { room } => match RoomCode::parse(&room) {
                Ok(code) => {
                    println!("Room code: {code}");
                    println!("On the receiving machine run: skiff receive {code}");
                    if let Some(tx) = self.announce.take() {
                        let _ = tx.send(code.clone());
                    }
                    self.room = Some(code.clone());
                    self.feed(Event::RoomCreated(code)).await;
                }
                Err(e) => self.fail(format!("relay sent an invalid room code: {e}")),
            },
            ServerMessage::Joined { room } => match RoomCode::parse(&room) {
                Ok(code) => {
                    println!("Joined room {code}, connecting...");
                    self.room = Some(code.clone());
                    self.feed(Event::RoomJoined(code)).await;
                }
                Err(e) => self.fail(format!("relay sent an invalid room code: {e}")),
            },
            ServerMessage::JoinFailed { error } => self.fail(error),
            ServerMessage::ReceiverJoined => self.feed(Event::PeerJoined).await,
            ServerMessage::Offer { sdp } => {
                debug!(event = "offer", %sdp);
                if let Some(room) = self.room_str() {
                    self.relay.send(ClientMessage::Answer {
                        room,
                        sdp: session_description("answer"),
                    });
                }
                let ip = local_ip();
                self.feed(Event::LocalCandidate(host_candidate(SocketAddr::new(IpAddr::V4(ip), 0))))
                    .await;
            }
            ServerMessage::Answer { sdp } => debug!(event = "answer", %sdp),
            ServerMessage::IceCandidate { candidate } => {
                if self.mode.role() != Role::Target {
                    return;
                }
                match candidate_addr(&candidate) {
                    Some(addr) if !self.candidates.contains(&addr) => {
                        info!(event = "candidate", %addr);
                        self.candidates.push(addr);
                        self.restart_redial();
                    }
                    Some(_) => {}
                    None => warn!(event = "bad_candidate", %candidate),
                }
            }
            ServerMessage::LocalIp { ip } => match ip.parse::<Ipv4Addr>() {
                Ok(ip) => self.feed(Event::PeerLocalIp(ip)).await,
                Err(_) => warn!(event = "bad_peer_ip", %ip),
            },
            ServerMessage::PeerDisconnected => self.feed(Event::PeerDisconnected).await,
        }
    }

    async fn on_frame(&mut self, frame: Frame) {
        if let Frame::Control(c) = &frame {
            self.feed(Event::Control(c.clone())).await;
        }
        if self.mode.role() == Role::Target && !self.finished {
            let outputs = self.assembler.on_frame(frame).await;
            self.on_assembled(outputs).await;
        }
    }

    async fn on_assembled(&mut self, outputs: Vec<AssemblerOutput>) {
        for out in outputs {
            match out {
                AssemblerOutput::Notify(n) => {
                    self.present(&n);
                    if n == Notice::BatchComplete {
                        self.summary.batch_complete = true;
                    }
                    if matches!(n, Notice::BatchComplete | Notice::Cancelled | Notice::Error(_)) {
                        self.feed(Event::TransferFinished).await;
                    }
                }
                AssemblerOutput::Deliver(files) => {
                    match storage::save_files(&self.config.download_dir, files).await {
                        Ok(paths) => {
                            for p in &paths {
                                println!("Saved {}", p.display());
                            }
                            self.summary.saved.extend(paths);
                        }
                        Err(e) => {
                            error!(event = "delivery_failed", error = %e);
                            self.present(&Notice::Error(format!("saving files: {e}")));
                        }
                    }
                }
                AssemblerOutput::Reply(frame) => self.send_control(&frame).await,
            }
        }
    }

    async fn on_send_done(&mut self, batch: CancelFlag, result: Result<SendOutcome, SendError>) {
        if self.batch.as_ref() != Some(&batch) {
            debug!(event = "stale_batch_done");
            return;
        }
        self.batch = None;
        self.sending = None;
        match result {
            Ok(SendOutcome::Completed) => {
                self.summary.batch_complete = true;
                self.feed(Event::TransferFinished).await;
                self.feed(Event::LocalTeardown).await;
            }
            Ok(SendOutcome::Cancelled) => self.feed(Event::TransferFinished).await,
            Err(SendError::Channel(e)) => {
                // The channel's own close event drives recovery.
                debug!(event = "send_interrupted", error = %e);
            }
            Err(e) => {
                error!(event = "send_failed", error = %e);
                self.present(&Notice::Error(e.to_string()));
                self.feed(Event::LocalCancel).await;
                self.feed(Event::TransferFinished).await;
            }
        }
        if std::mem::take(&mut self.restart_batch) {
            self.restart_if_unfinished().await;
        }
    }

    /// Run the controller on `event` and carry out everything it asks for.
    async fn feed(&mut self, event: Event) {
        let mut queue = VecDeque::from([event]);
        while let Some(ev) = queue.pop_front() {
            for action in self.ctl.handle(ev) {
                self.execute(action, &mut queue).await;
            }
        }
    }

    async fn execute(&mut self, action: Action, queue: &mut VecDeque<Event>) {
        match action {
            Action::Send(frame) => self.send_control(&frame).await,
            Action::BeginNegotiation => self.begin_negotiation(queue).await,
            Action::Reconnect => {
                if self.mode.role() == Role::Target {
                    self.restart_redial();
                } else {
                    info!(event = "awaiting_reconnect", "Waiting for the receiver to reconnect");
                }
            }
            Action::CloseChannel => {
                if let Some(channel) = self.channel.take() {
                    channel.shutdown(FLUSH_TIMEOUT).await;
                }
            }
            Action::StartTimer(handle, after) => self.start_timer(handle, after),
            Action::CancelTimer(handle) => {
                if let Some(task) = self.timers.remove(&handle) {
                    task.abort();
                }
            }
            Action::StartSending(flag) => self.start_sending(flag),
            Action::AbortTransfer { discard_in_flight } => {
                if self.mode.role() == Role::Target {
                    if discard_in_flight {
                        self.assembler.cancel().await;
                    } else {
                        self.assembler.reset().await;
                    }
                }
            }
            Action::RelayLocalIp(ip) => {
                if let Some(room) = self.room_str() {
                    self.relay.send(ClientMessage::LocalIp {
                        room,
                        ip: ip.to_string(),
                    });
                }
            }
            Action::Notify(n) => {
                self.present(&n);
                if matches!(n, Notice::ConnectionLost | Notice::NetworkMismatch { .. }) {
                    self.failure = Some(ui::render(&n));
                }
            }
            Action::Teardown => {
                if let Some(room) = self.room_str() {
                    self.relay.send(ClientMessage::Leave { room });
                }
                self.finished = true;
            }
        }
    }

    async fn begin_negotiation(&mut self, queue: &mut VecDeque<Event>) {
        let listener = match transport::bind_listener(self.config.transport_port).await {
            Ok(l) => l,
            Err(e) => {
                error!(event = "listen_failed", port = self.config.transport_port, error = %e);
                self.failure = Some(format!("binding transport port: {e}"));
                queue.push_back(Event::LocalTeardown);
                return;
            }
        };
        let port = match listener.local_addr() {
            Ok(addr) => addr.port(),
            Err(e) => {
                self.failure = Some(format!("reading listener address: {e}"));
                queue.push_back(Event::LocalTeardown);
                return;
            }
        };
        self.acceptor = Some(transport::spawn_acceptor(
            listener,
            self.events_tx.clone(),
            HostEvent::Incoming,
        ));
        let candidate = host_candidate(SocketAddr::new(IpAddr::V4(local_ip()), port));
        info!(event = "listening", %candidate);
        if let Some(room) = self.room_str() {
            self.relay.send(ClientMessage::IceCandidate {
                room: room.clone(),
                candidate: candidate.clone(),
            });
            self.relay.send(ClientMessage::Offer {
                room,
                sdp: session_description("offer"),
            });
        }
        queue.push_back(Event::LocalCandidate(candidate));
    }

    async fn attach(&mut self, stream: TcpStream) {
        if self.channel_open() {
            warn!(event = "connection_refused", "Channel already open, refusing another");
            return;
        }
        if !matches!(
            self.ctl.state(),
            LifecycleState::Negotiating | LifecycleState::GracePeriod
        ) {
            debug!(event = "connection_dropped", state = ?self.ctl.state());
            return;
        }
        if let Some(task) = self.redial.take() {
            task.abort();
        }
        self.channel_id += 1;
        let channel = TcpChannel::spawn(stream, self.channel_id, self.chan_tx.clone());
        self.channel = Some(Arc::new(channel));
        self.feed(Event::ChannelOpened).await;

        if self.batch.is_some() {
            self.restart_batch = true;
        } else {
            self.restart_if_unfinished().await;
        }
    }

    /// A batch that never completed starts over from its first file.
    async fn restart_if_unfinished(&mut self) {
        if self.mode.role() == Role::Origin
            && self.ctl.state() == LifecycleState::Open
            && self.channel_open()
            && !self.summary.batch_complete
        {
            self.feed(Event::SendRequested).await;
        }
    }

    fn start_sending(&mut self, flag: CancelFlag) {
        let Mode::Send(paths) = &self.mode else {
            return;
        };
        let Some(channel) = self.channel.clone() else {
            warn!(event = "send_without_channel");
            return;
        };
        let paths = paths.clone();
        let config = self.config.transfer.clone();
        let tx = self.events_tx.clone();
        self.batch = Some(flag.clone());
        self.sending = Some(tokio::spawn(async move {
            let result = send_files(&*channel, &paths, &config, flag.clone(), tx.clone()).await;
            let _ = tx.send(HostEvent::SendDone { batch: flag, result });
        }));
    }

    fn start_timer(&mut self, handle: TimerHandle, after: Duration) {
        let weak = self.events_tx.downgrade();
        let task = tokio::spawn(async move {
            tokio::time::sleep(after).await;
            if let Some(tx) = weak.upgrade() {
                let _ = tx.send(HostEvent::Timer(handle));
            }
        });
        if let Some(old) = self.timers.insert(handle, task) {
            old.abort();
        }
    }

    /// Dial the known candidates until one answers, retrying every few seconds.
    fn restart_redial(&mut self) {
        if let Some(task) = self.redial.take() {
            task.abort();
        }
        if self.candidates.is_empty() || self.channel_open() {
            return;
        }
        let candidates = self.candidates.clone();
        let weak = self.events_tx.downgrade();
        self.redial = Some(tokio::spawn(async move {
            loop {
                match transport::dial(&candidates).await {
                    Ok(stream) => {
                        if let Some(tx) = weak.upgrade() {
                            let _ = tx.send(HostEvent::Dialed(stream));
                        }
                        return;
                    }
                    Err(e) => debug!(event = "dial_retry", error = %e),
                }
                tokio::time::sleep(REDIAL_INTERVAL).await;
            }
        }));
    }

    async fn send_control(&mut self, frame: &ControlFrame) {
        let Some(channel) = &self.channel else {
            debug!(event = "control_dropped", kind = frame.kind(), "No channel");
            return;
        };
        match encode_control(frame) {
            Ok(msg) => {
                if let Err(e) = channel.send(msg).await {
                    debug!(event = "control_send_failed", kind = frame.kind(), error = %e);
                }
            }
            Err(e) => warn!(event = "control_encode_failed", error = %e),
        }
    }

    fn present(&self, notice: &Notice) {
        println!("{}", ui::render(notice));
        if let Some(tx) = &self.notices {
            let _ = tx.send(notice.clone());
        }
    }

    fn channel_open(&self) -> bool {
        self.channel.as_ref().is_some_and(|c| c.is_open())
    }

    fn room_str(&self) -> Option<String> {
        self.room.as_ref().map(RoomCode::to_string)
    }

    fn fail(&mut self, msg: String) {
        error!(event = "session_failed", %msg);
        self.failure = Some(msg);
        self.finished = true;
    }

    async fn shutdown(&mut self) {
        for (_, task) in self.timers.drain() {
            task.abort();
        }
        for task in [self.acceptor.take(), self.redial.take(), self.sending.take()]
            .into_iter()
            .flatten()
        {
            task.abort();
        }
        if let Some(channel) = self.channel.take() {
            channel.shutdown(FLUSH_TIMEOUT).await;
        }
        self.summary.room = self.room.take();
    }
}

async fn send_files(
    channel: &TcpChannel,
    paths: &[PathBuf],
    config: &skiff_core::TransferConfig,
    flag: CancelFlag,
    tx: mpsc::UnboundedSender<HostEvent>,
) -> Result<SendOutcome, SendError> {
    let mut files = Vec::with_capacity(paths.len());
    for p in paths {
        let file = DiskFile::open(p).await.map_err(|source| SendError::Read {
            name: p.display().to_string(),
            source,
        })?;
        files.push(file);
    }
    FileSender::new(channel, config, flag)
        .send_batch(&mut files, move |n| {
            let _ = tx.send(HostEvent::Notice(n));
        })
        .await
}

fn local_ip() -> Ipv4Addr {
    transport::local_ipv4().unwrap_or_else(|e| {
        debug!(event = "no_local_ip", error = %e, "Using loopback");
        Ipv4Addr::LOCALHOST
    })
}

/// Opaque session description; the TCP transport needs nothing beyond the candidates.
fn session_description(kind: &str) -> String {
    format!("skiff-tcp/1 {kind} {}", Uuid::new_v4())
}
