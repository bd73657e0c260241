//! Error types for broadcast signaling

/// Result type alias using the signaling Error
pub type Result<T> = std::result::Result<T, Error>;

/// Human-readable reason sent when a second presenter is refused
pub const PRESENTER_ALREADY_ACTIVE_MESSAGE: &str =
    "Another user is currently acting as presenter. Try again later ...";

/// Human-readable reason sent when a viewer arrives before any presenter
pub const NO_ACTIVE_PRESENTER_MESSAGE: &str = "No active presenter. Try again later...";

/// Human-readable reason sent when the presenter asks to view its own broadcast
pub const ALREADY_PRESENTING_MESSAGE: &str =
    "This connection is already acting as presenter. Stop presenting before viewing.";

/// Errors that can occur while coordinating a broadcast session
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The media engine could not be reached
    #[error("Could not find media server at address {address}: {reason}")]
    MediaEngineUnavailable {
        /// Address that was dialed
        address: String,
        /// Underlying failure
        reason: String,
    },

    /// The session already has a presenter
    #[error("{}", PRESENTER_ALREADY_ACTIVE_MESSAGE)]
    PresenterAlreadyActive,

    /// The requesting connection already owns the presenter slot
    #[error("{}", ALREADY_PRESENTING_MESSAGE)]
    AlreadyPresenting,

    /// The session has no established presenter to attach to
    #[error("{}", NO_ACTIVE_PRESENTER_MESSAGE)]
    NoActivePresenter,

    /// Offer/answer exchange, media connection or candidate gathering failed
    #[error("Negotiation failed: {0}")]
    NegotiationFailed(String),

    /// Pipeline or endpoint lifecycle call failed
    #[error("Media engine error: {0}")]
    MediaEngineError(String),

    /// The record being established was torn down while the request was in flight
    #[error("{}", NO_ACTIVE_PRESENTER_MESSAGE)]
    SessionInvalidated,

    /// Inbound message could not be understood
    #[error("Invalid message {0}")]
    InvalidMessage(String),

    /// Invalid configuration parameter
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// WebSocket error
    #[error("WebSocket error: {0}")]
    WebSocketError(String),

    /// Operation timeout
    #[error("Operation timeout: {0}")]
    Timeout(String),

    /// I/O error
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    /// Any other error
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl Error {
    /// Check if this error is an expected rejection rather than a fault
    pub fn is_rejection(&self) -> bool {
        matches!(
            self,
            Error::PresenterAlreadyActive
                | Error::AlreadyPresenting
                | Error::NoActivePresenter
                | Error::SessionInvalidated
        )
    }

    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::MediaEngineUnavailable { .. }
                | Error::Timeout(_)
                | Error::WebSocketError(_)
                | Error::IoError(_)
        )
    }

    /// Check if this error originated in the media engine
    pub fn is_media_engine_error(&self) -> bool {
        matches!(
            self,
            Error::MediaEngineUnavailable { .. }
                | Error::MediaEngineError(_)
                | Error::NegotiationFailed(_)
                | Error::Timeout(_)
        )
    }

    /// Reclassify a media engine failure raised during negotiation
    pub fn into_negotiation(self) -> Self {
        match self {
            Error::MediaEngineError(reason) => Error::NegotiationFailed(reason),
            other => other,
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::SerializationError(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::InvalidConfig("test".to_string());
        assert_eq!(err.to_string(), "Invalid configuration: test");
    }

    #[test]
    fn test_rejection_reasons_are_human_readable() {
        assert_eq!(
            Error::PresenterAlreadyActive.to_string(),
            PRESENTER_ALREADY_ACTIVE_MESSAGE
        );
        assert_eq!(Error::NoActivePresenter.to_string(), NO_ACTIVE_PRESENTER_MESSAGE);
        assert_eq!(Error::SessionInvalidated.to_string(), NO_ACTIVE_PRESENTER_MESSAGE);
    }

    #[test]
    fn test_media_engine_unavailable_names_address() {
        let err = Error::MediaEngineUnavailable {
            address: "ws://kms:8888/kurento".to_string(),
            reason: "connection refused".to_string(),
        };
        let text = err.to_string();
        assert!(text.contains("ws://kms:8888/kurento"));
        assert!(text.contains("connection refused"));
    }

    #[test]
    fn test_error_classification() {
        assert!(Error::PresenterAlreadyActive.is_rejection());
        assert!(Error::AlreadyPresenting.is_rejection());
        assert!(!Error::NegotiationFailed("bad sdp".to_string()).is_rejection());
        assert!(Error::Timeout("create".to_string()).is_retryable());
        assert!(!Error::NoActivePresenter.is_retryable());
        assert!(Error::NegotiationFailed("bad sdp".to_string()).is_media_engine_error());
    }

    #[test]
    fn test_into_negotiation_only_rewrites_engine_errors() {
        assert!(matches!(
            Error::MediaEngineError("no such object".to_string()).into_negotiation(),
            Error::NegotiationFailed(reason) if reason == "no such object"
        ));
        assert!(matches!(
            Error::Timeout("processOffer".to_string()).into_negotiation(),
            Error::Timeout(_)
        ));
    }

    #[test]
    fn test_io_error_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err = Error::from(io_err);
        assert!(matches!(err, Error::IoError(_)));
    }
}
