//! Skiff transfer session engine.
//! Host-driven: no sockets or files here; the host implements the channel and storage traits,
//! feeds lifecycle events in and executes the actions that come back.

pub mod channel;
pub mod chunk;
pub mod config;
pub mod events;
pub mod lifecycle;
pub mod netcheck;
pub mod progress;
pub mod protocol;
pub mod receiver;
pub mod sender;
pub mod session;
pub mod signaling;
pub mod wire;

pub use channel::{CancelFlag, ChannelError, DuplexChannel, FileSource, Sink, SinkOpen, SinkProvider};
pub use config::TransferConfig;
pub use events::{Direction, Notice, Progress};
pub use lifecycle::{Action, Event, SessionController, TimerHandle, TimerKind};
pub use protocol::{ControlFrame, FileMetadata, Frame, WireMessage};
pub use receiver::{AssemblerOutput, ReceiveAssembler, ReceivedFile};
pub use sender::{FileSender, SendError, SendOutcome};
pub use session::{LifecycleState, Role, RoomCode};
pub use wire::{decode_frame, encode_frame, FrameDecodeError, FrameEncodeError};
