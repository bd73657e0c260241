//! Process-wide media engine client handle
//!
//! The client is created lazily by the first presenter request and closed
//! once the session registry is empty. Both transitions run under the same
//! async mutex, so two concurrent "last session gone" teardowns cannot close
//! the client twice and a presenter arriving during teardown always gets a
//! fresh connection.

use super::{MediaEngineClient, MediaEngineConnector};
use crate::session::SessionRegistry;
use crate::Result;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Lazily connected, shared media engine client
pub struct MediaEngineHandle {
    connector: Arc<dyn MediaEngineConnector>,
    address: String,
    client: Mutex<Option<Arc<dyn MediaEngineClient>>>,
}

impl MediaEngineHandle {
    /// Create a handle that dials `address` through `connector` on first use
    pub fn new(connector: Arc<dyn MediaEngineConnector>, address: impl Into<String>) -> Self {
        Self {
            connector,
            address: address.into(),
            client: Mutex::new(None),
        }
    }

    /// Return the connected client, connecting first if necessary
    ///
    /// A cached client whose connection has been lost is replaced.
    pub async fn acquire(&self) -> Result<Arc<dyn MediaEngineClient>> {
        let mut slot = self.client.lock().await;
        if slot.as_ref().is_some_and(|client| !client.is_connected()) {
            warn!(address = %self.address, "Media engine connection lost, reconnecting");
            *slot = None;
        }
        if let Some(client) = slot.as_ref() {
            return Ok(Arc::clone(client));
        }

        info!(address = %self.address, "Connecting to media engine");
        let client = self.connector.connect(&self.address).await?;
        *slot = Some(Arc::clone(&client));
        Ok(client)
    }

    /// Close the client if no session remains
    ///
    /// Returns true when this call closed the client.
    pub async fn release_if_idle(&self, registry: &SessionRegistry) -> bool {
        let mut slot = self.client.lock().await;
        if !registry.is_empty() {
            debug!(sessions = registry.len(), "Media engine still in use");
            return false;
        }

        match slot.take() {
            Some(client) => {
                info!(address = %self.address, "Closing media engine client");
                client.close().await;
                true
            }
            None => false,
        }
    }

    /// Whether a client is currently connected
    pub async fn is_connected(&self) -> bool {
        self.client.lock().await.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::loopback::LoopbackEngine;

    #[tokio::test]
    async fn test_acquire_connects_once() {
        let engine = LoopbackEngine::new();
        let handle = MediaEngineHandle::new(Arc::new(engine.clone()), "loopback://");

        assert!(!handle.is_connected().await);
        handle.acquire().await.unwrap();
        handle.acquire().await.unwrap();

        assert!(handle.is_connected().await);
        assert_eq!(engine.stats().connects, 1);
    }

    #[tokio::test]
    async fn test_acquire_replaces_lost_connection() {
        let engine = LoopbackEngine::new();
        let handle = MediaEngineHandle::new(Arc::new(engine.clone()), "loopback://");

        let first = handle.acquire().await.unwrap();
        engine.drop_connections();
        assert!(!first.is_connected());
        assert!(first.create_pipeline().await.is_err());

        let second = handle.acquire().await.unwrap();
        assert!(second.is_connected());
        assert!(second.create_pipeline().await.is_ok());
        assert_eq!(engine.stats().connects, 2);
    }

    #[tokio::test]
    async fn test_release_if_idle_closes_once() {
        let engine = LoopbackEngine::new();
        let handle = Arc::new(MediaEngineHandle::new(
            Arc::new(engine.clone()),
            "loopback://",
        ));
        let registry = Arc::new(SessionRegistry::new());
        handle.acquire().await.unwrap();

        let (a, b) = tokio::join!(
            handle.release_if_idle(&registry),
            handle.release_if_idle(&registry)
        );

        assert!(a ^ b, "exactly one teardown closes the client");
        assert_eq!(engine.stats().closes, 1);
        assert!(!handle.is_connected().await);
    }

    #[tokio::test]
    async fn test_release_if_idle_keeps_client_while_sessions_exist() {
        let engine = LoopbackEngine::new();
        let handle = MediaEngineHandle::new(Arc::new(engine.clone()), "loopback://");
        let registry = SessionRegistry::new();
        handle.acquire().await.unwrap();

        let _session = registry.lock("room-1").await;
        assert!(!handle.release_if_idle(&registry).await);
        assert_eq!(engine.stats().closes, 0);
    }

    #[tokio::test]
    async fn test_unreachable_engine_surfaces_error() {
        let engine = LoopbackEngine::new();
        engine.set_unreachable(true);
        let handle = MediaEngineHandle::new(Arc::new(engine), "loopback://");

        let err = handle.acquire().await.err().unwrap();
        assert!(matches!(err, crate::Error::MediaEngineUnavailable { .. }));
        assert!(!handle.is_connected().await);
    }
}
