//! Relay client: newline-delimited JSON over TCP.

use std::io;

use skiff_core::signaling::{ClientMessage, ServerMessage};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Handle for sending to the relay. Cheap to clone.
#[derive(Debug, Clone)]
pub struct RelayClient {
    tx: mpsc::UnboundedSender<ClientMessage>,
}

impl RelayClient {
    /// Connect. The returned receiver yields relay messages and ends when the relay connection does.
    pub async fn connect(addr: &str) -> io::Result<(Self, mpsc::UnboundedReceiver<ServerMessage>)> {
        let stream = TcpStream::connect(addr).await?;
        let (reader, mut writer) = stream.into_split();
        let (tx, mut rx) = mpsc::unbounded_channel::<ClientMessage>();
        let (in_tx, in_rx) = mpsc::unbounded_channel();

        tokio::spawn(async move {
            while let Some(msg) = rx.recv().await {
                let mut line = match serde_json::to_vec(&msg) {
                    Ok(l) => l,
                    Err(e) => {
                        warn!(event = "relay_encode_failed", error = %e);
                        continue;
                    }
                };
                line.push(b'\n');
                if writer.write_all(&line).await.is_err() {
                    break;
                }
            }
        });

        tokio::spawn(async move {
            let mut lines = BufReader::new(reader).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                match serde_json::from_str::<ServerMessage>(&line) {
                    Ok(msg) => {
                        debug!(event = "relay_in", ?msg);
                        if in_tx.send(msg).is_err() {
                            break;
                        }
                    }
                    Err(e) => warn!(event = "relay_malformed", error = %e, "Dropping relay message"),
                }
            }
        });

        Ok((Self { tx }, in_rx))
    }

    /// Queue a message. Errors are logged; the relay going away surfaces on the receiver.
    pub fn send(&self, msg: ClientMessage) {
        if self.tx.send(msg).is_err() {
            debug!(event = "relay_gone", "Relay writer closed");
        }
    }
}
