//! Connection dispatcher
//!
//! Routes inbound client messages to the coordinator and formats its results
//! into outbound messages. Presenter and viewer negotiations run on their own
//! tasks so that candidates and stop requests from the same connection keep
//! flowing while the media engine works.

use super::protocol::{ClientMessage, ServerMessage};
use crate::coordinator::SignalingCoordinator;
use crate::session::{PeerHandle, SessionId};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Identity of one client connection
#[derive(Debug, Clone)]
pub struct ConnectionContext {
    session_id: SessionId,
    peer: PeerHandle,
}

impl ConnectionContext {
    pub fn new(session_id: impl Into<SessionId>, peer: PeerHandle) -> Self {
        Self {
            session_id: session_id.into(),
            peer,
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn connection_id(&self) -> &str {
        self.peer.connection_id()
    }

    pub fn peer(&self) -> &PeerHandle {
        &self.peer
    }
}

/// Shared entry point for every transport connection
#[derive(Clone)]
pub struct ConnectionDispatcher {
    coordinator: Arc<SignalingCoordinator>,
}

impl ConnectionDispatcher {
    pub fn new(coordinator: Arc<SignalingCoordinator>) -> Self {
        Self { coordinator }
    }

    pub fn coordinator(&self) -> &Arc<SignalingCoordinator> {
        &self.coordinator
    }

    /// Handle one inbound text frame
    ///
    /// Returns the negotiation task spawned for an accepted presenter or
    /// viewer reservation; every other message is fully handled on return.
    pub async fn dispatch(&self, ctx: &ConnectionContext, text: &str) -> Option<JoinHandle<()>> {
        let message = match ClientMessage::from_json(text) {
            Ok(message) => message,
            Err(e) => {
                warn!(connection_id = ctx.connection_id(), error = %e, "Rejecting inbound message");
                ctx.peer.send(ServerMessage::error(e.to_string()));
                return None;
            }
        };
        debug!(
            session_id = ctx.session_id(),
            connection_id = ctx.connection_id(),
            kind = message.kind(),
            "Received message"
        );

        match message {
            ClientMessage::Presenter { sdp_offer } => self.presenter(ctx, sdp_offer).await,
            ClientMessage::Viewer { sdp_offer } => self.viewer(ctx, sdp_offer).await,
            ClientMessage::Stop => {
                self.coordinator
                    .handle_stop(ctx.session_id(), ctx.connection_id())
                    .await;
                None
            }
            ClientMessage::OnIceCandidate { role, candidate } => {
                if let Err(e) = self
                    .coordinator
                    .handle_ice_candidate(role, ctx.session_id(), ctx.connection_id(), candidate)
                    .await
                {
                    warn!(
                        session_id = ctx.session_id(),
                        connection_id = ctx.connection_id(),
                        error = %e,
                        "Failed to add remote candidate"
                    );
                }
                None
            }
        }
    }

    /// Tear down everything owned by a closed or failed connection
    pub async fn disconnect(&self, ctx: &ConnectionContext) {
        debug!(
            session_id = ctx.session_id(),
            connection_id = ctx.connection_id(),
            "Connection closed"
        );
        self.coordinator
            .handle_stop(ctx.session_id(), ctx.connection_id())
            .await;
    }

    async fn presenter(&self, ctx: &ConnectionContext, sdp_offer: String) -> Option<JoinHandle<()>> {
        let reservation = match self
            .coordinator
            .reserve_presenter(ctx.session_id(), ctx.peer.clone())
            .await
        {
            Ok(reservation) => reservation,
            Err(e) => {
                ctx.peer.send(ServerMessage::presenter_response(&Err(e)));
                return None;
            }
        };

        let coordinator = Arc::clone(&self.coordinator);
        let ctx = ctx.clone();
        Some(tokio::spawn(async move {
            let result = coordinator.negotiate_presenter(reservation, &sdp_offer).await;
            let accepted = result.is_ok();
            ctx.peer.send(ServerMessage::presenter_response(&result));
            if accepted {
                gather(&coordinator, &ctx).await;
            }
        }))
    }

    async fn viewer(&self, ctx: &ConnectionContext, sdp_offer: String) -> Option<JoinHandle<()>> {
        let reservation = match self
            .coordinator
            .reserve_viewer(ctx.session_id(), ctx.peer.clone())
            .await
        {
            Ok(reservation) => reservation,
            Err(e) => {
                ctx.peer.send(ServerMessage::viewer_response(&Err(e)));
                return None;
            }
        };

        let coordinator = Arc::clone(&self.coordinator);
        let ctx = ctx.clone();
        Some(tokio::spawn(async move {
            let result = coordinator.negotiate_viewer(reservation, &sdp_offer).await;
            let accepted = result.is_ok();
            ctx.peer.send(ServerMessage::viewer_response(&result));
            if accepted {
                gather(&coordinator, &ctx).await;
            }
        }))
    }
}

/// Start candidate gathering after the answer has been queued to the client
async fn gather(coordinator: &SignalingCoordinator, ctx: &ConnectionContext) {
    let Err(e) = coordinator
        .start_gathering(ctx.session_id(), ctx.connection_id())
        .await
    else {
        return;
    };

    if e.is_rejection() {
        debug!(connection_id = ctx.connection_id(), "Connection left before gathering");
        return;
    }

    warn!(
        session_id = ctx.session_id(),
        connection_id = ctx.connection_id(),
        error = %e,
        "Candidate gathering failed"
    );
    ctx.peer.send(ServerMessage::error(e.to_string()));
    coordinator
        .handle_stop(ctx.session_id(), ctx.connection_id())
        .await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::loopback::LoopbackEngine;
    use crate::signaling::ResponseStatus;
    use tokio::sync::mpsc;

    fn setup() -> (ConnectionDispatcher, LoopbackEngine) {
        let engine = LoopbackEngine::new();
        let coordinator = SignalingCoordinator::new(Arc::new(engine.clone()), "loopback://");
        (ConnectionDispatcher::new(Arc::new(coordinator)), engine)
    }

    fn connect(
        session_id: &str,
        connection_id: &str,
    ) -> (ConnectionContext, mpsc::UnboundedReceiver<ServerMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let peer = PeerHandle::new(connection_id.to_string(), tx);
        (ConnectionContext::new(session_id, peer), rx)
    }

    #[tokio::test]
    async fn test_unknown_message_yields_error_and_no_state() {
        let (dispatcher, _engine) = setup();
        let (ctx, mut rx) = connect("room", "c1");

        assert!(dispatcher.dispatch(&ctx, r#"{"id":"record"}"#).await.is_none());

        match rx.recv().await.unwrap() {
            ServerMessage::Error { message } => {
                assert_eq!(message, r#"Invalid message {"id":"record"}"#)
            }
            other => panic!("unexpected message {:?}", other),
        }
        assert!(dispatcher.coordinator().registry().is_empty());
    }

    #[tokio::test]
    async fn test_presenter_request_is_answered() {
        let (dispatcher, _engine) = setup();
        let (ctx, mut rx) = connect("room", "p");

        let task = dispatcher
            .dispatch(&ctx, r#"{"id":"presenter","sdpOffer":"offer"}"#)
            .await
            .unwrap();
        task.await.unwrap();

        match rx.recv().await.unwrap() {
            ServerMessage::PresenterResponse(response) => {
                assert_eq!(response.response, ResponseStatus::Accepted);
                assert!(response.sdp_answer.is_some());
                assert!(response.message.is_none());
            }
            other => panic!("unexpected message {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_viewer_without_presenter_is_rejected_inline() {
        let (dispatcher, _engine) = setup();
        let (ctx, mut rx) = connect("room", "v");

        assert!(dispatcher
            .dispatch(&ctx, r#"{"id":"viewer","sdpOffer":"offer"}"#)
            .await
            .is_none());

        assert_eq!(
            rx.recv().await.unwrap(),
            ServerMessage::viewer_response(&Err(crate::Error::NoActivePresenter))
        );
        assert!(dispatcher.coordinator().registry().is_empty());
    }

    #[tokio::test]
    async fn test_answer_precedes_local_candidates() {
        let (dispatcher, engine) = setup();
        engine.set_local_candidates(vec![crate::media::IceCandidate::new("local")]);
        let (ctx, mut rx) = connect("room", "p");

        dispatcher
            .dispatch(&ctx, r#"{"id":"presenter","sdpOffer":"offer"}"#)
            .await
            .unwrap()
            .await
            .unwrap();

        assert!(matches!(
            rx.recv().await.unwrap(),
            ServerMessage::PresenterResponse(_)
        ));
        assert!(matches!(
            rx.recv().await.unwrap(),
            ServerMessage::IceCandidate { .. }
        ));
    }

    #[tokio::test]
    async fn test_disconnect_tears_down_presenter() {
        let (dispatcher, engine) = setup();
        let (ctx, _rx) = connect("room", "p");

        dispatcher
            .dispatch(&ctx, r#"{"id":"presenter","sdpOffer":"offer"}"#)
            .await
            .unwrap()
            .await
            .unwrap();
        dispatcher.disconnect(&ctx).await;

        assert!(dispatcher.coordinator().registry().is_empty());
        assert_eq!(engine.live_pipelines(), 0);
        assert_eq!(engine.stats().closes, 1);
    }
}
