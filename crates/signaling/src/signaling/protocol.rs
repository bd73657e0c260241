//! Client-facing JSON wire protocol
//!
//! Every frame is a JSON object whose `id` field names the message kind.

use crate::media::IceCandidate;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};

/// Which side of the broadcast an inbound candidate belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum CandidateRole {
    /// Candidate of the presenter's peer connection
    #[serde(rename = "pub")]
    Publisher,
    /// Candidate of a viewer's peer connection
    #[default]
    #[serde(rename = "sub")]
    Subscriber,
}

/// Messages sent by browsers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "id", rename_all = "camelCase")]
pub enum ClientMessage {
    /// Request to publish
    Presenter {
        #[serde(rename = "sdpOffer")]
        sdp_offer: String,
    },
    /// Request to subscribe
    Viewer {
        #[serde(rename = "sdpOffer")]
        sdp_offer: String,
    },
    /// Leave the broadcast
    Stop,
    /// Trickled remote ICE candidate
    OnIceCandidate {
        #[serde(rename = "type", default)]
        role: CandidateRole,
        candidate: IceCandidate,
    },
}

impl ClientMessage {
    /// Parse an inbound text frame
    pub fn from_json(text: &str) -> Result<Self> {
        serde_json::from_str(text).map_err(|_| Error::InvalidMessage(text.to_string()))
    }

    /// Wire name of this message kind
    pub fn kind(&self) -> &'static str {
        match self {
            ClientMessage::Presenter { .. } => "presenter",
            ClientMessage::Viewer { .. } => "viewer",
            ClientMessage::Stop => "stop",
            ClientMessage::OnIceCandidate { .. } => "onIceCandidate",
        }
    }
}

/// Outcome of a presenter or viewer request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResponseStatus {
    Accepted,
    Rejected,
}

/// Body of `presenterResponse` and `viewerResponse`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Response {
    pub response: ResponseStatus,

    #[serde(rename = "sdpAnswer", default, skip_serializing_if = "Option::is_none")]
    pub sdp_answer: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl Response {
    /// Accepted response carrying the SDP answer
    pub fn accepted(sdp_answer: impl Into<String>) -> Self {
        Self {
            response: ResponseStatus::Accepted,
            sdp_answer: Some(sdp_answer.into()),
            message: None,
        }
    }

    /// Rejected response carrying a human-readable reason
    pub fn rejected(message: impl Into<String>) -> Self {
        Self {
            response: ResponseStatus::Rejected,
            sdp_answer: None,
            message: Some(message.into()),
        }
    }

    fn from_result(result: &Result<String>) -> Self {
        match result {
            Ok(answer) => Self::accepted(answer.as_str()),
            Err(e) => Self::rejected(e.to_string()),
        }
    }
}

/// Messages sent to browsers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "id", rename_all = "camelCase")]
pub enum ServerMessage {
    PresenterResponse(Response),
    ViewerResponse(Response),
    /// Locally gathered candidate of the connection's media endpoint
    IceCandidate {
        candidate: IceCandidate,
    },
    /// The presenter left; the viewer's media stream has ended
    StopCommunication,
    Error {
        message: String,
    },
}

impl ServerMessage {
    /// `presenterResponse` for the outcome of a presenter request
    pub fn presenter_response(result: &Result<String>) -> Self {
        ServerMessage::PresenterResponse(Response::from_result(result))
    }

    /// `viewerResponse` for the outcome of a viewer request
    pub fn viewer_response(result: &Result<String>) -> Self {
        ServerMessage::ViewerResponse(Response::from_result(result))
    }

    pub fn ice_candidate(candidate: IceCandidate) -> Self {
        ServerMessage::IceCandidate { candidate }
    }

    pub fn error(message: impl Into<String>) -> Self {
        ServerMessage::Error {
            message: message.into(),
        }
    }

    /// Serialize to a text frame
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}
