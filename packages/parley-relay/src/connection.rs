//! Live connection handles.
//!
//! Each WebSocket gets an unbounded outbound channel drained by its own
//! sender task, so emitting to a slow or vanished client never blocks the
//! caller.

use tokio::sync::mpsc;
use uuid::Uuid;

use crate::protocol::ServerMessage;

/// A connected client's sender channel.
pub type ClientSender = mpsc::UnboundedSender<ServerMessage>;

/// Identifies one WebSocket connection for its whole lifetime.
pub type ConnectionId = Uuid;

/// Cloneable capability to push frames to one live connection.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    id: ConnectionId,
    sender: ClientSender,
}

impl ConnectionHandle {
    pub fn new(sender: ClientSender) -> Self {
        Self {
            id: Uuid::new_v4(),
            sender,
        }
    }

    /// Create a handle together with the receiving end of its channel.
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<ServerMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self::new(tx), rx)
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Queue a frame for the connection. Returns false if the connection's
    /// sender task is gone.
    pub fn emit(&self, message: ServerMessage) -> bool {
        self.sender.send(message).is_ok()
    }

    /// Opportunistic liveness probe. Presence entries, not this, decide
    /// whether a principal is reachable.
    pub fn is_alive(&self) -> bool {
        !self.sender.is_closed()
    }
}
