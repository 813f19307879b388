//! Per-connection session state.

use crate::auth::Identity;
use crate::error::{GatewayError, Result};
use crate::protocol::ServerMessage;
use axum::extract::ws::Message;
use engine::ConnectionId;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// An authenticated connection: verified identity plus the outbound channel
/// feeding its WebSocket.
pub struct ClientSession {
    pub identity: Identity,
    pub connection_id: ConnectionId,
    msg_tx: mpsc::UnboundedSender<Message>,
}

impl ClientSession {
    pub fn new(
        identity: Identity,
        connection_id: ConnectionId,
        msg_tx: mpsc::UnboundedSender<Message>,
    ) -> Self {
        Self {
            identity,
            connection_id,
            msg_tx,
        }
    }

    /// Send a directed protocol message to this connection.
    pub fn send(&self, msg: &ServerMessage) -> Result<()> {
        let json = serde_json::to_string(msg)?;
        self.msg_tx
            .send(Message::Text(json.into()))
            .map_err(|_| GatewayError::ChannelSend)
    }

    /// Send a raw WebSocket frame (pongs).
    pub fn send_frame(&self, frame: Message) -> Result<()> {
        self.msg_tx.send(frame).map_err(|_| GatewayError::ChannelSend)
    }
}

/// Forward pre-serialized broadcast frames from the hub into the
/// connection's outbound channel. Frames arrive in publish order and leave
/// in the same order.
pub fn spawn_event_pump(
    mut event_rx: mpsc::UnboundedReceiver<String>,
    msg_tx: mpsc::UnboundedSender<Message>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(frame) = event_rx.recv().await {
            if msg_tx.send(Message::Text(frame.into())).is_err() {
                break;
            }
        }
    })
}
