use carewatch_core::types::ConnId;
use carewatch_protocol::ServerMessage;
use tokio::sync::mpsc::{self, error::TrySendError};

/// Registry-side handle to one live WebSocket.
///
/// Frames go through a bounded channel drained by the connection task.
/// Sending never fails: a closed or full channel drops the frame.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    pub id: ConnId,
    tx: mpsc::Sender<String>,
}

impl ConnectionHandle {
    pub fn new(id: ConnId, tx: mpsc::Sender<String>) -> Self {
        Self { id, tx }
    }

    /// False once the connection task has stopped reading outbound frames.
    pub fn is_open(&self) -> bool {
        !self.tx.is_closed()
    }

    pub fn send(&self, msg: &ServerMessage) {
        self.send_raw(msg.to_json());
    }

    /// Send pre-serialized JSON (fan-out serializes once per push).
    pub fn send_raw(&self, json: String) {
        match self.tx.try_send(json) {
            Ok(()) | Err(TrySendError::Closed(_)) => {}
            Err(TrySendError::Full(_)) => {
                tracing::debug!(conn_id = %self.id, "outbound buffer full, frame dropped");
            }
        }
    }
}
