//! Configuration types for the broadcast signaling server

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::time::Duration;

/// Main configuration for the signaling server
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SignalingConfig {
    /// Address the WebSocket listener binds to
    pub listen_address: String,

    /// Request path clients upgrade on (default: /one2many)
    pub ws_path: String,

    /// Media engine WebSocket URI (ws:// or wss://)
    pub media_engine_uri: String,

    /// Per-request timeout for media engine calls in milliseconds (default: 15000)
    pub media_engine_request_timeout_ms: u64,

    /// Media engine keepalive ping interval in seconds (default: 240, 0 = disabled)
    pub media_engine_keepalive_secs: u64,
}

impl Default for SignalingConfig {
    fn default() -> Self {
        Self {
            listen_address: "0.0.0.0:8443".to_string(),
            ws_path: "/one2many".to_string(),
            media_engine_uri: "ws://localhost:8888/kurento".to_string(),
            media_engine_request_timeout_ms: 15_000,
            media_engine_keepalive_secs: 240,
        }
    }
}

impl SignalingConfig {
    /// Validate configuration parameters
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - `listen_address` is not a socket address
    /// - `ws_path` does not start with `/`
    /// - `media_engine_uri` does not start with ws:// or wss://
    /// - `media_engine_request_timeout_ms` is zero
    pub fn validate(&self) -> Result<()> {
        self.listen_address.parse::<SocketAddr>().map_err(|e| {
            Error::InvalidConfig(format!(
                "listen_address must be a socket address, got {}: {}",
                self.listen_address, e
            ))
        })?;

        if !self.ws_path.starts_with('/') {
            return Err(Error::InvalidConfig(format!(
                "ws_path must start with '/', got {}",
                self.ws_path
            )));
        }

        if !self.media_engine_uri.starts_with("ws://") && !self.media_engine_uri.starts_with("wss://")
        {
            return Err(Error::InvalidConfig(format!(
                "media_engine_uri must start with ws:// or wss://, got {}",
                self.media_engine_uri
            )));
        }

        if self.media_engine_request_timeout_ms == 0 {
            return Err(Error::InvalidConfig(
                "media_engine_request_timeout_ms must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }

    /// Parsed listen address
    pub fn socket_addr(&self) -> Result<SocketAddr> {
        self.listen_address.parse().map_err(|e| {
            Error::InvalidConfig(format!("invalid listen_address {}: {}", self.listen_address, e))
        })
    }

    /// Media engine request timeout
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.media_engine_request_timeout_ms)
    }

    /// Media engine keepalive interval, `None` when disabled
    pub fn keepalive_interval(&self) -> Option<Duration> {
        (self.media_engine_keepalive_secs > 0)
            .then(|| Duration::from_secs(self.media_engine_keepalive_secs))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = SignalingConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.ws_path, "/one2many");
        assert_eq!(config.request_timeout(), Duration::from_secs(15));
        assert_eq!(config.keepalive_interval(), Some(Duration::from_secs(240)));
    }

    #[test]
    fn test_rejects_non_websocket_media_engine_uri() {
        let config = SignalingConfig {
            media_engine_uri: "http://localhost:8888/kurento".to_string(),
            ..Default::default()
        };
        let err = config.validate().unwrap_err();
        assert!(matches!(err, Error::InvalidConfig(_)));
    }

    #[test]
    fn test_rejects_bad_listen_address_and_path() {
        let config = SignalingConfig {
            listen_address: "localhost".to_string(),
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = SignalingConfig {
            ws_path: "one2many".to_string(),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_zero_timeout_rejected_and_zero_keepalive_disables() {
        let config = SignalingConfig {
            media_engine_request_timeout_ms: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = SignalingConfig {
            media_engine_keepalive_secs: 0,
            ..Default::default()
        };
        assert!(config.validate().is_ok());
        assert_eq!(config.keepalive_interval(), None);
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config: SignalingConfig =
            serde_json::from_str(r#"{"ws_path": "/live"}"#).unwrap();
        assert_eq!(config.ws_path, "/live");
        assert_eq!(config.listen_address, "0.0.0.0:8443");
    }
}
