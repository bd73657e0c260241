//! Transport error types

/// Result type alias using the transport Error
pub type Result<T> = std::result::Result<T, Error>;

/// Errors raised while serving WebSocket clients
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Socket bind or accept failure
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Handshake or framing failure
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    /// Configuration or coordination failure
    #[error(transparent)]
    Signaling(#[from] one2many_signaling::Error),
}
