//! JSON-RPC 2.0 message types for the Kurento media server protocol

use crate::media::IceCandidate;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

/// JSON-RPC 2.0 protocol version
pub const JSONRPC_VERSION: &str = "2.0";

/// Event emitted by WebRTC endpoints for each locally gathered candidate
pub const ICE_CANDIDATE_FOUND: &str = "IceCandidateFound";

/// JSON-RPC 2.0 request
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JsonRpcRequest {
    /// Protocol version (must be "2.0")
    pub jsonrpc: String,

    /// Method name to invoke
    pub method: String,

    /// Method parameters
    pub params: Value,

    /// Request ID for matching with response (absent for notifications)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<u64>,
}

/// JSON-RPC 2.0 error object
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ErrorObject {
    /// Error code
    pub code: i64,

    /// Human-readable error message
    pub message: String,

    /// Additional error data
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

/// Any message the media server sends: a response or a notification
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct InboundMessage {
    /// Present on responses
    #[serde(default)]
    pub id: Option<u64>,

    /// Present on notifications (`onEvent`)
    #[serde(default)]
    pub method: Option<String>,

    /// Notification parameters
    #[serde(default)]
    pub params: Option<Value>,

    /// Successful response payload
    #[serde(default)]
    pub result: Option<Value>,

    /// Failed response payload
    #[serde(default)]
    pub error: Option<ErrorObject>,
}

/// `IceCandidate` complex type as encoded by the media server
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct KurentoIceCandidate {
    #[serde(rename = "__module__", default = "kurento_module")]
    module: String,
    #[serde(rename = "__type__", default = "ice_candidate_type")]
    type_name: String,
    candidate: String,
    #[serde(default)]
    sdp_mid: Option<String>,
    #[serde(default, rename = "sdpMLineIndex")]
    sdp_m_line_index: Option<u16>,
}

fn kurento_module() -> String {
    "kurento".to_string()
}

fn ice_candidate_type() -> String {
    "IceCandidate".to_string()
}

impl From<IceCandidate> for KurentoIceCandidate {
    fn from(c: IceCandidate) -> Self {
        Self {
            module: kurento_module(),
            type_name: ice_candidate_type(),
            candidate: c.candidate,
            sdp_mid: c.sdp_mid,
            sdp_m_line_index: c.sdp_m_line_index,
        }
    }
}

impl From<KurentoIceCandidate> for IceCandidate {
    fn from(c: KurentoIceCandidate) -> Self {
        Self {
            candidate: c.candidate,
            sdp_mid: c.sdp_mid,
            sdp_m_line_index: c.sdp_m_line_index,
        }
    }
}

/// Decoded `onEvent` notification
#[derive(Debug, Clone, PartialEq)]
pub struct MediaEvent {
    /// Object that raised the event
    pub object: String,
    /// Event type
    pub event_type: String,
    /// Event payload
    pub data: Value,
}

impl MediaEvent {
    /// Parse the params of an `onEvent` notification
    pub fn from_params(params: &Value) -> Result<Self> {
        let value = params
            .get("value")
            .ok_or_else(|| Error::SerializationError("onEvent without value".to_string()))?;
        let data = value.get("data").cloned().unwrap_or(Value::Null);
        let object = value
            .get("object")
            .and_then(Value::as_str)
            .or_else(|| data.get("source").and_then(Value::as_str))
            .ok_or_else(|| Error::SerializationError("onEvent without object".to_string()))?
            .to_string();
        let event_type = value
            .get("type")
            .and_then(Value::as_str)
            .or_else(|| data.get("type").and_then(Value::as_str))
            .unwrap_or_default()
            .to_string();

        Ok(Self {
            object,
            event_type,
            data,
        })
    }

    /// Candidate carried by an `IceCandidateFound` event
    pub fn ice_candidate(&self) -> Option<IceCandidate> {
        if self.event_type != ICE_CANDIDATE_FOUND {
            return None;
        }
        let raw = self.data.get("candidate")?.clone();
        serde_json::from_value::<KurentoIceCandidate>(raw)
            .ok()
            .map(IceCandidate::from)
    }
}

impl JsonRpcRequest {
    /// Create a new JSON-RPC request
    pub fn new(method: impl Into<String>, params: Value, id: Option<u64>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            method: method.into(),
            params,
            id,
        }
    }

    /// Convert to JSON string
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self).map_err(|e| {
            Error::SerializationError(format!("Failed to serialize JSON-RPC request: {}", e))
        })
    }
}

impl InboundMessage {
    /// Parse from JSON string
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| {
            Error::SerializationError(format!("Failed to deserialize JSON-RPC message: {}", e))
        })
    }
}

/// Parameter builders for the media server methods
pub mod params {
    use super::*;

    /// `create` params for a media pipeline
    pub fn create_pipeline() -> Value {
        json!({
            "type": "MediaPipeline",
            "constructorParams": {},
            "properties": {}
        })
    }

    /// `create` params for a WebRTC endpoint on `pipeline`
    pub fn create_endpoint(pipeline: &str) -> Value {
        json!({
            "type": "WebRtcEndpoint",
            "constructorParams": { "mediaPipeline": pipeline },
            "properties": {}
        })
    }

    /// `invoke` params
    pub fn invoke(object: &str, operation: &str, operation_params: Value) -> Value {
        json!({
            "object": object,
            "operation": operation,
            "operationParams": operation_params
        })
    }

    /// `subscribe` params
    pub fn subscribe(object: &str, event_type: &str) -> Value {
        json!({ "object": object, "type": event_type })
    }

    /// `release` params
    pub fn release(object: &str) -> Value {
        json!({ "object": object })
    }

    /// `ping` params
    pub fn ping(interval_ms: u64) -> Value {
        json!({ "interval": interval_ms })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_serialization() {
        let req = JsonRpcRequest::new("create", params::create_pipeline(), Some(1));
        let json: Value = serde_json::from_str(&req.to_json().unwrap()).unwrap();

        assert_eq!(json["jsonrpc"], "2.0");
        assert_eq!(json["id"], 1);
        assert_eq!(json["params"]["type"], "MediaPipeline");
    }

    #[test]
    fn test_parse_error_response() {
        let msg = InboundMessage::from_json(
            r#"{"jsonrpc":"2.0","id":7,"error":{"code":40101,"message":"Object not found"}}"#,
        )
        .unwrap();

        assert_eq!(msg.id, Some(7));
        assert_eq!(msg.error.unwrap().message, "Object not found");
        assert!(msg.result.is_none());
    }

    #[test]
    fn test_ice_candidate_event() {
        let msg = InboundMessage::from_json(
            r#"{
                "jsonrpc": "2.0",
                "method": "onEvent",
                "params": {
                    "value": {
                        "data": {
                            "candidate": {
                                "__module__": "kurento",
                                "__type__": "IceCandidate",
                                "candidate": "candidate:1 1 UDP 2013266431 10.0.0.5 40000 typ host",
                                "sdpMLineIndex": 0,
                                "sdpMid": "0"
                            },
                            "source": "ep-1",
                            "type": "IceCandidateFound"
                        },
                        "object": "ep-1",
                        "type": "IceCandidateFound"
                    }
                }
            }"#,
        )
        .unwrap();

        let event = MediaEvent::from_params(msg.params.as_ref().unwrap()).unwrap();
        assert_eq!(event.object, "ep-1");

        let candidate = event.ice_candidate().unwrap();
        assert_eq!(candidate.sdp_mid.as_deref(), Some("0"));
        assert!(candidate.candidate.starts_with("candidate:1"));
    }

    #[test]
    fn test_candidate_encoding_carries_type_markers() {
        let encoded = serde_json::to_value(KurentoIceCandidate::from(IceCandidate {
            candidate: "candidate:x".to_string(),
            sdp_mid: Some("video".to_string()),
            sdp_m_line_index: Some(1),
        }))
        .unwrap();

        assert_eq!(encoded["__type__"], "IceCandidate");
        assert_eq!(encoded["sdpMid"], "video");
        assert_eq!(encoded["sdpMLineIndex"], 1);
    }
}
