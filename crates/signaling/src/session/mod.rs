//! Broadcast sessions and the connections taking part in them

pub mod candidates;
pub mod registry;

pub use candidates::CandidateQueue;
pub use registry::{
    PresenterRecord, Session, SessionGuard, SessionRegistry, SessionState, ViewerRecord,
};

use crate::signaling::ServerMessage;
use tokio::sync::mpsc;
use tracing::debug;

/// Identifier of a broadcast session (room)
pub type SessionId = String;

/// Identifier of one client connection, unique for the process lifetime
pub type ConnectionId = String;

/// Outbound side of a client connection
///
/// Messages are queued on an unbounded channel drained by the transport, so
/// sending never blocks the session's critical section.
#[derive(Debug, Clone)]
pub struct PeerHandle {
    connection_id: ConnectionId,
    tx: mpsc::UnboundedSender<ServerMessage>,
}

impl PeerHandle {
    /// Wrap the outbound queue of `connection_id`
    pub fn new(connection_id: ConnectionId, tx: mpsc::UnboundedSender<ServerMessage>) -> Self {
        Self { connection_id, tx }
    }

    /// Connection ID
    pub fn connection_id(&self) -> &str {
        &self.connection_id
    }

    /// Queue `message` for delivery; returns false if the connection is gone
    pub fn send(&self, message: ServerMessage) -> bool {
        match self.tx.send(message) {
            Ok(()) => true,
            Err(_) => {
                debug!(connection_id = %self.connection_id, "Dropping message for closed connection");
                false
            }
        }
    }
}
