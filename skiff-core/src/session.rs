//! Session identity: room code, role, lifecycle state, teardown flag.

use std::fmt;
use std::str::FromStr;

use rand::Rng;

pub const ROOM_CODE_LEN: usize = 6;

const ROOM_CODE_ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";

/// Short one-time pairing code. Always stored uppercase.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RoomCode(String);

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RoomCodeError {
    #[error("room code must be {ROOM_CODE_LEN} characters, got {0}")]
    Length(usize),
    #[error("room code contains invalid character {0:?}")]
    InvalidChar(char),
}

impl RoomCode {
    /// Parse user input. Surrounding whitespace is ignored and case does not matter.
    pub fn parse(input: &str) -> Result<Self, RoomCodeError> {
        let code = input.trim().to_ascii_uppercase();
        if let Some(c) = code.chars().find(|c| !c.is_ascii_alphanumeric()) {
            return Err(RoomCodeError::InvalidChar(c));
        }
        if code.len() != ROOM_CODE_LEN {
            return Err(RoomCodeError::Length(code.chars().count()));
        }
        Ok(Self(code))
    }

    pub fn generate<R: Rng + ?Sized>(rng: &mut R) -> Self {
        let code = (0..ROOM_CODE_LEN)
            .map(|_| ROOM_CODE_ALPHABET[rng.gen_range(0..ROOM_CODE_ALPHABET.len())] as char)
            .collect();
        Self(code)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RoomCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for RoomCode {
    type Err = RoomCodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

/// Fixed for the life of a session: the origin sends, the target receives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Origin,
    Target,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Idle,
    AwaitingPeer,
    Negotiating,
    Open,
    Transferring,
    /// Channel lost unexpectedly; waiting for it to reopen.
    GracePeriod,
    /// Terminal for this session instance.
    Reset,
}

impl LifecycleState {
    /// States in which the channel is believed to be up.
    pub fn channel_up(self) -> bool {
        matches!(self, LifecycleState::Open | LifecycleState::Transferring)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    pub room: Option<RoomCode>,
    pub role: Role,
    pub state: LifecycleState,
    /// Set before the local side closes on purpose, so the close skips the grace period.
    pub intentional_teardown: bool,
}

impl Session {
    pub fn new(role: Role) -> Self {
        Self {
            room: None,
            role,
            state: LifecycleState::Idle,
            intentional_teardown: false,
        }
    }
}
