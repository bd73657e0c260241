//! Media engine abstraction
//!
//! The media engine is the external service that owns pipelines and WebRTC
//! endpoints and performs SDP negotiation, ICE gathering and RTP relay. The
//! coordinator only ever talks to it through the traits in this module.
//!
//! Two implementations are provided:
//! - [`kurento`]: JSON-RPC 2.0 client for a Kurento Media Server
//! - [`loopback`]: in-process engine for tests and media-less runs

pub mod handle;
pub mod kurento;
pub mod loopback;

use crate::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

pub use handle::MediaEngineHandle;

/// ICE candidate as exchanged with browsers and the media engine
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
    /// Candidate attribute line (`candidate:...`)
    pub candidate: String,

    /// Media stream identification tag
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,

    /// Index of the m-line the candidate belongs to
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_m_line_index: Option<u16>,
}

impl IceCandidate {
    /// Candidate with only the attribute line set
    pub fn new(candidate: impl Into<String>) -> Self {
        Self {
            candidate: candidate.into(),
            sdp_mid: None,
            sdp_m_line_index: None,
        }
    }
}

/// Callback invoked for every candidate the media engine discovers locally
pub type LocalCandidateCallback = Arc<dyn Fn(IceCandidate) + Send + Sync>;

/// Dials a media engine
#[async_trait]
pub trait MediaEngineConnector: Send + Sync {
    /// Connect to the engine at `address`
    ///
    /// Fails with [`crate::Error::MediaEngineUnavailable`] when unreachable.
    async fn connect(&self, address: &str) -> Result<Arc<dyn MediaEngineClient>>;
}

/// Connected media engine session
#[async_trait]
pub trait MediaEngineClient: Send + Sync {
    /// Create a new media pipeline
    async fn create_pipeline(&self) -> Result<Arc<dyn MediaPipeline>>;

    /// Whether the connection to the engine is still usable
    fn is_connected(&self) -> bool;

    /// Close the connection to the engine
    async fn close(&self);
}

/// Group of media elements; releasing it releases every endpoint created on it
#[async_trait]
pub trait MediaPipeline: Send + Sync {
    /// Engine-assigned identifier
    fn id(&self) -> &str;

    /// Create a WebRTC endpoint on this pipeline
    async fn create_endpoint(&self) -> Result<Arc<dyn WebRtcEndpoint>>;

    /// Release the pipeline and, transitively, all of its endpoints
    async fn release(&self) -> Result<()>;
}

/// WebRTC endpoint bound to one browser peer connection
#[async_trait]
pub trait WebRtcEndpoint: Send + Sync {
    /// Engine-assigned identifier
    fn id(&self) -> &str;

    /// Process a remote SDP offer and return the SDP answer
    async fn process_offer(&self, sdp_offer: &str) -> Result<String>;

    /// Send this endpoint's media to `sink` (one direction only)
    async fn connect_to(&self, sink: &dyn WebRtcEndpoint) -> Result<()>;

    /// Add a remote ICE candidate
    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()>;

    /// Start gathering local ICE candidates
    async fn gather_candidates(&self) -> Result<()>;

    /// Register the callback receiving locally discovered candidates
    async fn on_local_candidate(&self, callback: LocalCandidateCallback) -> Result<()>;

    /// Release this endpoint only
    async fn release(&self) -> Result<()>;
}
