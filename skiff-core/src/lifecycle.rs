//! Host-driven session lifecycle: the host passes events in and executes the actions that come back.
//!
//! The controller owns no timers and no channel. It asks for them through
//! [`Action::StartTimer`]/[`Action::CancelTimer`] and tags every timer with a
//! generation so a fire that raced a cancel is recognised and ignored.

use std::net::Ipv4Addr;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::channel::CancelFlag;
use crate::config::TransferConfig;
use crate::events::Notice;
use crate::netcheck::{NetworkCheck, Verdict};
use crate::protocol::ControlFrame;
use crate::session::{LifecycleState, Role, RoomCode, Session};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimerKind {
    Heartbeat,
    Grace,
}

/// Identifies one arming of a timer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerHandle {
    pub kind: TimerKind,
    pub generation: u64,
}

/// Inputs to the controller.
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    /// Origin: the relay created our room.
    RoomCreated(RoomCode),
    /// Target: the relay admitted us to the room.
    RoomJoined(RoomCode),
    /// Origin: a target joined the room.
    PeerJoined,
    ChannelOpened,
    ChannelClosed,
    ChannelError(String),
    TimerFired(TimerHandle),
    /// A control frame from the peer. Data frames never reach the controller.
    Control(ControlFrame),
    /// Origin: start sending the file queue.
    SendRequested,
    /// The active batch ended (completed, cancelled or failed).
    TransferFinished,
    /// Local user cancels the in-flight batch.
    LocalCancel,
    /// Local user ends the session.
    LocalTeardown,
    /// Host went to the background, e.g. a system file dialog is up.
    Backgrounded,
    Foregrounded { channel_open: bool },
    /// Relay: the other member dropped and did not come back within the relay's delay.
    PeerDisconnected,
    LocalCandidate(String),
    PeerLocalIp(Ipv4Addr),
}

/// Side effects for the host to carry out, in order.
#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    Send(ControlFrame),
    /// Origin: set up the transport and send an offer through the relay.
    BeginNegotiation,
    /// Try to reopen the channel.
    Reconnect,
    CloseChannel,
    StartTimer(TimerHandle, Duration),
    CancelTimer(TimerHandle),
    /// Origin: run the sender for the queued files, observing this flag.
    StartSending(CancelFlag),
    /// Discard any in-flight sender or assembler state. With `discard_in_flight` the
    /// channel stays up, so frames of the aborted batch already on the wire must be
    /// dropped until the next batch starts.
    AbortTransfer { discard_in_flight: bool },
    RelayLocalIp(Ipv4Addr),
    Notify(Notice),
    /// Session is over: leave the room and release everything.
    Teardown,
}

pub struct SessionController {
    session: Session,
    heartbeat_interval: Duration,
    grace_period: Duration,
    generation: u64,
    heartbeat: Option<TimerHandle>,
    grace: Option<TimerHandle>,
    backgrounded: bool,
    network: NetworkCheck,
    batch: Option<CancelFlag>,
}

impl SessionController {
    pub fn new(role: Role, config: &TransferConfig) -> Self {
        Self {
            session: Session::new(role),
            heartbeat_interval: config.heartbeat_interval(),
            grace_period: config.grace_period(),
            generation: 0,
            heartbeat: None,
            grace: None,
            backgrounded: false,
            network: NetworkCheck::default(),
            batch: None,
        }
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn state(&self) -> LifecycleState {
        self.session.state
    }

    pub fn grace_pending(&self) -> bool {
        self.grace.is_some()
    }

    /// Map one event to the actions it requires.
    pub fn handle(&mut self, event: Event) -> Vec<Action> {
        let mut out = Vec::new();
        if self.session.state == LifecycleState::Reset {
            if event == Event::ChannelOpened {
                out.push(Action::CloseChannel);
            }
            debug!(event = "ignored_after_reset", ?event);
            return out;
        }
        match event {
            Event::RoomCreated(code) => self.on_room(code, Role::Origin, LifecycleState::AwaitingPeer),
            Event::RoomJoined(code) => self.on_room(code, Role::Target, LifecycleState::Negotiating),
            Event::PeerJoined => {
                if self.session.state == LifecycleState::AwaitingPeer {
                    info!(event = "peer_joined", "Peer joined, negotiating");
                    self.session.state = LifecycleState::Negotiating;
                    out.push(Action::BeginNegotiation);
                }
            }
            Event::ChannelOpened => self.on_channel_opened(&mut out),
            Event::ChannelClosed => self.on_channel_lost("closed", &mut out),
            Event::ChannelError(reason) => {
                warn!(event = "channel_error", %reason);
                self.on_channel_lost("error", &mut out);
            }
            Event::TimerFired(handle) => self.on_timer(handle, &mut out),
            Event::Control(frame) => self.on_control(frame, &mut out),
            Event::SendRequested => {
                if self.session.role == Role::Origin && self.session.state == LifecycleState::Open {
                    let flag = CancelFlag::new();
                    self.batch = Some(flag.clone());
                    self.session.state = LifecycleState::Transferring;
                    info!(event = "batch_start", "Starting batch");
                    out.push(Action::StartSending(flag));
                } else {
                    debug!(event = "send_rejected", state = ?self.session.state, role = ?self.session.role);
                }
            }
            Event::TransferFinished => {
                self.batch = None;
                if self.session.state == LifecycleState::Transferring {
                    self.session.state = LifecycleState::Open;
                }
            }
            Event::LocalCancel => {
                if self.session.state == LifecycleState::Transferring {
                    info!(event = "local_cancel", "Cancelling batch");
                    self.abort_batch(true, &mut out);
                    self.session.state = LifecycleState::Open;
                    out.push(Action::Send(ControlFrame::Cancel));
                    out.push(Action::Notify(Notice::Cancelled));
                }
            }
            Event::LocalTeardown => self.teardown(&mut out),
            Event::Backgrounded => {
                debug!(event = "backgrounded");
                self.backgrounded = true;
            }
            Event::Foregrounded { channel_open } => {
                debug!(event = "foregrounded", channel_open);
                self.backgrounded = false;
                self.on_foregrounded(channel_open, &mut out);
            }
            Event::PeerDisconnected => self.on_peer_disconnected(&mut out),
            Event::LocalCandidate(candidate) => {
                if let Some(ip) = self.network.observe_candidate(&candidate) {
                    info!(event = "local_ip", %ip);
                    out.push(Action::RelayLocalIp(ip));
                    self.check_network(&mut out);
                }
            }
            Event::PeerLocalIp(ip) => {
                info!(event = "peer_ip", %ip);
                self.network.set_peer(ip);
                self.check_network(&mut out);
            }
        }
        out
    }

    fn next_timer(&mut self, kind: TimerKind) -> TimerHandle {
        self.generation += 1;
        TimerHandle {
            kind,
            generation: self.generation,
        }
    }

    fn on_room(&mut self, code: RoomCode, role: Role, next: LifecycleState) {
        if self.session.state != LifecycleState::Idle || self.session.role != role {
            warn!(event = "unexpected_room", room = %code, state = ?self.session.state);
            return;
        }
        info!(event = "room", room = %code, state = ?next);
        self.session.room = Some(code);
        self.session.state = next;
    }

    fn on_channel_opened(&mut self, out: &mut Vec<Action>) {
        match self.session.state {
            LifecycleState::Negotiating | LifecycleState::GracePeriod => {}
            state => {
                debug!(event = "unexpected_open", ?state);
                return;
            }
        }
        if let Some(grace) = self.grace.take() {
            info!(event = "reconnected", "Channel reopened within grace period");
            out.push(Action::CancelTimer(grace));
            out.push(Action::Notify(Notice::Reconnected));
        } else {
            info!(event = "channel_open", "Channel open");
        }
        self.session.state = LifecycleState::Open;
        self.start_heartbeat(out);
    }

    fn on_channel_lost(&mut self, cause: &'static str, out: &mut Vec<Action>) {
        if self.session.intentional_teardown {
            return;
        }
        if self.backgrounded {
            info!(event = "close_ignored", cause, "Channel loss while backgrounded, waiting for foreground");
            return;
        }
        match self.session.state {
            LifecycleState::Negotiating | LifecycleState::Open | LifecycleState::Transferring => {
                self.enter_grace(cause, out)
            }
            state => debug!(event = "close_ignored", cause, ?state),
        }
    }

    fn enter_grace(&mut self, cause: &'static str, out: &mut Vec<Action>) {
        warn!(event = "channel_lost", cause, "Channel lost, entering grace period");
        self.stop_heartbeat(out);
        self.abort_batch(false, out);
        self.session.state = LifecycleState::GracePeriod;
        out.push(Action::Notify(Notice::Reconnecting));
        self.arm_grace(out);
        out.push(Action::Reconnect);
    }

    fn on_peer_disconnected(&mut self, out: &mut Vec<Action>) {
        if self.session.intentional_teardown || self.grace.is_some() {
            return;
        }
        match self.session.state {
            LifecycleState::Negotiating => self.enter_grace("peer_disconnected", out),
            // A live channel outranks the relay's view of the peer.
            state => debug!(event = "peer_disconnected_ignored", ?state),
        }
    }

    fn on_foregrounded(&mut self, channel_open: bool, out: &mut Vec<Action>) {
        if let Some(grace) = self.grace.take() {
            out.push(Action::CancelTimer(grace));
        }
        if channel_open {
            return;
        }
        match self.session.state {
            LifecycleState::GracePeriod => {
                info!(event = "reconnect_on_foreground", "Reopening channel now");
                self.arm_grace(out);
                out.push(Action::Reconnect);
            }
            LifecycleState::Open | LifecycleState::Transferring => {
                self.enter_grace("closed_while_backgrounded", out)
            }
            _ => {}
        }
    }

    fn on_timer(&mut self, handle: TimerHandle, out: &mut Vec<Action>) {
        match handle.kind {
            TimerKind::Heartbeat if self.heartbeat == Some(handle) => {
                out.push(Action::Send(ControlFrame::Heartbeat));
                out.push(Action::StartTimer(handle, self.heartbeat_interval));
            }
            TimerKind::Grace if self.grace == Some(handle) => {
                self.grace = None;
                warn!(event = "connection_lost", "Grace period expired");
                out.push(Action::Notify(Notice::ConnectionLost));
                self.reset(out);
            }
            _ => debug!(event = "stale_timer", ?handle),
        }
    }

    fn on_control(&mut self, frame: ControlFrame, out: &mut Vec<Action>) {
        match frame {
            ControlFrame::IntentionalDisconnect => {
                info!(event = "peer_left", "Peer ended the session");
                self.session.intentional_teardown = true;
                out.push(Action::Notify(Notice::PeerLeft));
                self.reset(out);
            }
            ControlFrame::Cancel => {
                if self.session.state != LifecycleState::Transferring {
                    return;
                }
                self.session.state = LifecycleState::Open;
                // The assembler reports the target side's own cancellation.
                if self.session.role == Role::Origin {
                    info!(event = "peer_cancelled", "Peer cancelled the batch");
                    self.abort_batch(true, out);
                    out.push(Action::Notify(Notice::Cancelled));
                }
            }
            ControlFrame::Metadata(meta) => {
                if self.session.role == Role::Target
                    && self.session.state == LifecycleState::Open
                    && meta.is_first()
                {
                    self.session.state = LifecycleState::Transferring;
                }
            }
            ControlFrame::Heartbeat | ControlFrame::End => {}
        }
    }

    fn check_network(&mut self, out: &mut Vec<Action>) {
        if let Verdict::Mismatch { local, peer } = self.network.verdict() {
            warn!(event = "network_mismatch", %local, %peer, "Peers are on different networks");
            out.push(Action::Notify(Notice::NetworkMismatch { local, peer }));
            self.teardown(out);
        }
    }

    fn start_heartbeat(&mut self, out: &mut Vec<Action>) {
        self.stop_heartbeat(out);
        let handle = self.next_timer(TimerKind::Heartbeat);
        self.heartbeat = Some(handle);
        out.push(Action::StartTimer(handle, self.heartbeat_interval));
    }

    fn stop_heartbeat(&mut self, out: &mut Vec<Action>) {
        if let Some(handle) = self.heartbeat.take() {
            out.push(Action::CancelTimer(handle));
        }
    }

    fn arm_grace(&mut self, out: &mut Vec<Action>) {
        let handle = self.next_timer(TimerKind::Grace);
        self.grace = Some(handle);
        out.push(Action::StartTimer(handle, self.grace_period));
    }

    fn abort_batch(&mut self, discard_in_flight: bool, out: &mut Vec<Action>) {
        if let Some(flag) = self.batch.take() {
            flag.cancel();
        }
        out.push(Action::AbortTransfer { discard_in_flight });
    }

    /// Local, deliberate end of the session.
    fn teardown(&mut self, out: &mut Vec<Action>) {
        self.session.intentional_teardown = true;
        if self.session.state.channel_up() {
            out.push(Action::Send(ControlFrame::IntentionalDisconnect));
        }
        self.reset(out);
    }

    /// The single exit path. Releases timers, transfer state and the channel.
    fn reset(&mut self, out: &mut Vec<Action>) {
        info!(event = "session_reset", room = ?self.session.room.as_ref().map(RoomCode::as_str));
        self.stop_heartbeat(out);
        if let Some(grace) = self.grace.take() {
            out.push(Action::CancelTimer(grace));
        }
        self.abort_batch(false, out);
        out.push(Action::CloseChannel);
        out.push(Action::Teardown);
        self.session.state = LifecycleState::Reset;
    }
}
