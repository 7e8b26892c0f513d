//! Signaling relay protocol and room bookkeeping.
//!
//! The relay only pairs two endpoints and forwards setup messages between them.
//! Messages are JSON objects tagged by `type`, one per line on the wire.

use std::collections::HashMap;

use rand::Rng;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::session::RoomCode;

/// Relay-side identity of one connected client.
pub type ClientId = Uuid;

/// Client to relay.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    CreateRoom,
    JoinRoom { room: String },
    Offer { room: String, sdp: String },
    Answer { room: String, sdp: String },
    IceCandidate { room: String, candidate: String },
    LocalIp { room: String, ip: String },
    Leave { room: String },
}

impl ClientMessage {
    /// Pass-through messages and the room they are scoped to.
    pub fn relay_target(&self) -> Option<&str> {
        match self {
            ClientMessage::Offer { room, .. }
            | ClientMessage::Answer { room, .. }
            | ClientMessage::IceCandidate { room, .. }
            | ClientMessage::LocalIp { room, .. } => Some(room),
            _ => None,
        }
    }

    /// What the other member receives for a pass-through message.
    pub fn forwarded(&self) -> Option<ServerMessage> {
        Some(match self {
            ClientMessage::Offer { sdp, .. } => ServerMessage::Offer { sdp: sdp.clone() },
            ClientMessage::Answer { sdp, .. } => ServerMessage::Answer { sdp: sdp.clone() },
            ClientMessage::IceCandidate { candidate, .. } => ServerMessage::IceCandidate {
                candidate: candidate.clone(),
            },
            ClientMessage::LocalIp { ip, .. } => ServerMessage::LocalIp { ip: ip.clone() },
            _ => return None,
        })
    }
}

/// Relay to client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    RoomCreated { room: String },
    Joined { room: String },
    JoinFailed { error: String },
    /// To the origin: a target is in the room.
    ReceiverJoined,
    Offer { sdp: String },
    Answer { sdp: String },
    IceCandidate { candidate: String },
    LocalIp { ip: String },
    /// The other member dropped and did not come back.
    PeerDisconnected,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum JoinError {
    #[error("Room not found or already full")]
    NotFoundOrFull,
}

#[derive(Debug, Clone)]
struct Room {
    origin: ClientId,
    target: Option<ClientId>,
    /// Bumped on every change, so a delayed expiry can tell the room was touched.
    epoch: u64,
}

impl Room {
    fn has(&self, client: ClientId) -> bool {
        self.origin == client || self.target == Some(client)
    }

    fn other(&self, client: ClientId) -> Option<ClientId> {
        if self.origin == client {
            self.target
        } else if self.target == Some(client) {
            Some(self.origin)
        } else {
            None
        }
    }
}

/// Pending expiry of a room after one of its members dropped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Expiry {
    pub room: RoomCode,
    pub epoch: u64,
    pub gone: ClientId,
}

/// Live rooms. Pure bookkeeping; the relay server owns the sockets and timers.
#[derive(Debug, Default)]
pub struct RoomRegistry {
    rooms: HashMap<RoomCode, Room>,
    epoch: u64,
}

impl RoomRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.rooms.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rooms.is_empty()
    }

    fn bump(&mut self) -> u64 {
        self.epoch += 1;
        self.epoch
    }

    /// New room owned by `origin`, with a code unique among live rooms.
    pub fn create_room<R: Rng + ?Sized>(&mut self, origin: ClientId, rng: &mut R) -> RoomCode {
        let code = loop {
            let code = RoomCode::generate(rng);
            if !self.rooms.contains_key(&code) {
                break code;
            }
        };
        let epoch = self.bump();
        self.rooms.insert(
            code.clone(),
            Room {
                origin,
                target: None,
                epoch,
            },
        );
        code
    }

    /// Admit `target`. Returns the normalized code and the origin to notify.
    pub fn join_room(&mut self, room: &str, target: ClientId) -> Result<(RoomCode, ClientId), JoinError> {
        let code = RoomCode::parse(room).map_err(|_| JoinError::NotFoundOrFull)?;
        let epoch = self.bump();
        let entry = self.rooms.get_mut(&code).ok_or(JoinError::NotFoundOrFull)?;
        if entry.target.is_some() || entry.origin == target {
            return Err(JoinError::NotFoundOrFull);
        }
        entry.target = Some(target);
        entry.epoch = epoch;
        Ok((code, entry.origin))
    }

    /// The other member of `room`, if `from` is a member.
    pub fn peer_of(&self, room: &str, from: ClientId) -> Option<ClientId> {
        let code = RoomCode::parse(room).ok()?;
        self.rooms.get(&code)?.other(from)
    }

    /// Deliberate exit: the room is closed at once.
    pub fn leave(&mut self, room: &str, client: ClientId) -> bool {
        let Ok(code) = RoomCode::parse(room) else {
            return false;
        };
        match self.rooms.get(&code) {
            Some(r) if r.has(client) => self.rooms.remove(&code).is_some(),
            _ => false,
        }
    }

    /// A client's connection dropped. Returns one expiry per room it was in.
    pub fn on_disconnect(&self, client: ClientId) -> Vec<Expiry> {
        self.rooms
            .iter()
            .filter(|(_, r)| r.has(client))
            .map(|(code, r)| Expiry {
                room: code.clone(),
                epoch: r.epoch,
                gone: client,
            })
            .collect()
    }

    /// Run a delayed expiry. If the room is unchanged since the drop it is deleted,
    /// and the remaining member (if any) is returned for a `peer_disconnected` notice.
    pub fn expire(&mut self, expiry: &Expiry) -> Option<Option<ClientId>> {
        match self.rooms.get(&expiry.room) {
            Some(r) if r.epoch == expiry.epoch => {
                let remaining = r.other(expiry.gone);
                self.rooms.remove(&expiry.room);
                Some(remaining)
            }
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id() -> ClientId {
        Uuid::new_v4()
    }

    #[test]
    fn wire_format_is_snake_case_tagged() {
        let msg = serde_json::to_string(&ClientMessage::JoinRoom { room: "abc123".into() }).unwrap();
        assert_eq!(msg, r#"{"type":"join_room","room":"abc123"}"#);
        let back: ServerMessage = serde_json::from_str(r#"{"type":"receiver_joined"}"#).unwrap();
        assert_eq!(back, ServerMessage::ReceiverJoined);
        let err = serde_json::to_string(&ServerMessage::JoinFailed {
            error: JoinError::NotFoundOrFull.to_string(),
        })
        .unwrap();
        assert_eq!(err, r#"{"type":"join_failed","error":"Room not found or already full"}"#);
    }

    #[test]
    fn pass_through_forwarding() {
        let m = ClientMessage::IceCandidate {
            room: "R".into(),
            candidate: "c".into(),
        };
        assert_eq!(m.relay_target(), Some("R"));
        assert_eq!(m.forwarded(), Some(ServerMessage::IceCandidate { candidate: "c".into() }));
        assert_eq!(ClientMessage::CreateRoom.forwarded(), None);
    }

    #[test]
    fn join_is_case_insensitive_and_single_use() {
        let mut reg = RoomRegistry::new();
        let (origin, target, third) = (id(), id(), id());
        let code = reg.create_room(origin, &mut rand::thread_rng());
        let lower = code.as_str().to_ascii_lowercase();
        assert_eq!(reg.join_room(&lower, target), Ok((code.clone(), origin)));
        assert_eq!(reg.join_room(code.as_str(), third), Err(JoinError::NotFoundOrFull));
        assert_eq!(reg.join_room("ZZZZZZ", third), Err(JoinError::NotFoundOrFull));
        assert_eq!(reg.join_room("bad", third), Err(JoinError::NotFoundOrFull));
    }

    #[test]
    fn origin_cannot_join_own_room() {
        let mut reg = RoomRegistry::new();
        let origin = id();
        let code = reg.create_room(origin, &mut rand::thread_rng());
        assert_eq!(reg.join_room(code.as_str(), origin), Err(JoinError::NotFoundOrFull));
    }

    #[test]
    fn forwarding_only_between_members() {
        let mut reg = RoomRegistry::new();
        let (origin, target, outsider) = (id(), id(), id());
        let code = reg.create_room(origin, &mut rand::thread_rng());
        assert_eq!(reg.peer_of(code.as_str(), origin), None);
        reg.join_room(code.as_str(), target).unwrap();
        assert_eq!(reg.peer_of(code.as_str(), origin), Some(target));
        assert_eq!(reg.peer_of(code.as_str(), target), Some(origin));
        assert_eq!(reg.peer_of(code.as_str(), outsider), None);
    }

    #[test]
    fn expiry_notifies_remaining_member() {
        let mut reg = RoomRegistry::new();
        let (origin, target) = (id(), id());
        let code = reg.create_room(origin, &mut rand::thread_rng());
        reg.join_room(code.as_str(), target).unwrap();
        let expiries = reg.on_disconnect(target);
        assert_eq!(expiries.len(), 1);
        assert_eq!(reg.expire(&expiries[0]), Some(Some(origin)));
        assert!(reg.is_empty());
        // Second run is a no-op.
        assert_eq!(reg.expire(&expiries[0]), None);
    }

    #[test]
    fn modified_room_survives_expiry() {
        let mut reg = RoomRegistry::new();
        let (origin, target) = (id(), id());
        let code = reg.create_room(origin, &mut rand::thread_rng());
        let expiries = reg.on_disconnect(origin);
        // A join lands during the delay.
        reg.join_room(code.as_str(), target).unwrap();
        assert_eq!(reg.expire(&expiries[0]), None);
        assert_eq!(reg.len(), 1);
    }

    #[test]
    fn leave_closes_room() {
        let mut reg = RoomRegistry::new();
        let (origin, outsider) = (id(), id());
        let code = reg.create_room(origin, &mut rand::thread_rng());
        assert!(!reg.leave(code.as_str(), outsider));
        assert!(reg.leave(code.as_str(), origin));
        assert!(reg.is_empty());
    }
}
