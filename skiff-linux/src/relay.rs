//! Signaling relay server: pairs two endpoints per room and forwards setup messages.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use skiff_core::signaling::{ClientId, ClientMessage, RoomRegistry, ServerMessage};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, warn};
use uuid::Uuid;

#[derive(Default)]
struct RelayState {
    registry: RoomRegistry,
    clients: HashMap<ClientId, mpsc::UnboundedSender<ServerMessage>>,
}

impl RelayState {
    fn send_to(&self, client: ClientId, msg: ServerMessage) {
        if let Some(tx) = self.clients.get(&client) {
            let _ = tx.send(msg);
        }
    }
}

type Shared = Arc<Mutex<RelayState>>;

/// Accept clients forever. `disconnect_delay` is how long a dropped member's room survives.
pub async fn serve(listener: TcpListener, disconnect_delay: Duration) -> std::io::Result<()> {
    let state: Shared = Arc::new(Mutex::new(RelayState::default()));
    info!(event = "relay_listening", addr = %listener.local_addr()?);
    loop {
        let (stream, peer) = listener.accept().await?;
        let state = state.clone();
        tokio::spawn(async move {
            let id = Uuid::new_v4();
            debug!(event = "relay_client", client = %id, %peer);
            handle_client(stream, id, state.clone()).await;
            on_disconnect(id, state, disconnect_delay).await;
        });
    }
}

async fn handle_client(stream: TcpStream, id: ClientId, state: Shared) {
    let (reader, mut writer) = stream.into_split();
    let (tx, mut rx) = mpsc::unbounded_channel::<ServerMessage>();
    state.lock().await.clients.insert(id, tx);

    let write_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            let Ok(mut line) = serde_json::to_vec(&msg) else {
                continue;
            };
            line.push(b'\n');
            if writer.write_all(&line).await.is_err() {
                break;
            }
        }
    });

    let mut lines = BufReader::new(reader).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => match serde_json::from_str::<ClientMessage>(&line) {
                Ok(msg) => handle_message(&state, id, msg).await,
                Err(e) => warn!(event = "relay_malformed", client = %id, error = %e),
            },
            Ok(None) => break,
            Err(e) => {
                debug!(event = "relay_read_failed", client = %id, error = %e);
                break;
            }
        }
    }
    state.lock().await.clients.remove(&id);
    write_task.abort();
}

async fn handle_message(state: &Shared, id: ClientId, msg: ClientMessage) {
    let mut st = state.lock().await;
    match msg {
        ClientMessage::CreateRoom => {
            let code = st.registry.create_room(id, &mut rand::thread_rng());
            info!(event = "room_created", room = %code, client = %id);
            st.send_to(id, ServerMessage::RoomCreated { room: code.to_string() });
        }
        ClientMessage::JoinRoom { room } => match st.registry.join_room(&room, id) {
            Ok((code, origin)) => {
                info!(event = "room_joined", room = %code, client = %id);
                st.send_to(id, ServerMessage::Joined { room: code.to_string() });
                st.send_to(origin, ServerMessage::ReceiverJoined);
            }
            Err(e) => {
                debug!(event = "join_failed", room = %room, client = %id);
                st.send_to(id, ServerMessage::JoinFailed { error: e.to_string() });
            }
        },
        ClientMessage::Leave { room } => {
            if st.registry.leave(&room, id) {
                info!(event = "room_closed", room = %room, client = %id);
            }
        }
        other => {
            let (Some(room), Some(forward)) = (other.relay_target(), other.forwarded()) else {
                return;
            };
            match st.registry.peer_of(room, id) {
                Some(peer) => st.send_to(peer, forward),
                None => debug!(event = "relay_no_peer", room = %room, client = %id),
            }
        }
    }
}

async fn on_disconnect(id: ClientId, state: Shared, delay: Duration) {
    let expiries = state.lock().await.registry.on_disconnect(id);
    for expiry in expiries {
        let state = state.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let mut st = state.lock().await;
            if let Some(remaining) = st.registry.expire(&expiry) {
                info!(event = "room_expired", room = %expiry.room);
                if let Some(peer) = remaining {
                    st.send_to(peer, ServerMessage::PeerDisconnected);
                }
            }
        });
    }
}
