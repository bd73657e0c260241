//! Signaling coordinator
//!
//! Processes presenter, viewer, stop and ICE candidate events against the
//! session registry and the media engine.
//!
//! All reads and writes of a session happen while holding that session's
//! guard. Media engine calls that create or negotiate resources run outside
//! the guard; every resumption re-enters the critical section and checks that
//! the record being built still belongs to the same request attempt. When it
//! does not, the request fails with [`Error::SessionInvalidated`] and releases
//! whatever it created locally.
//!
//! Presenter and viewer requests are split into a reservation step, which
//! claims the slot synchronously with respect to later messages of the same
//! connection, and a negotiation step that may run concurrently with them.

use crate::media::{
    IceCandidate, LocalCandidateCallback, MediaEngineConnector, MediaEngineHandle, MediaPipeline,
    WebRtcEndpoint,
};
use crate::session::{
    PeerHandle, PresenterRecord, Session, SessionGuard, SessionId, SessionRegistry, SessionState,
    ViewerRecord,
};
use crate::signaling::{CandidateRole, ServerMessage};
use crate::{Error, Result};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Presenter slot claimed by a connection, awaiting negotiation
#[derive(Debug)]
pub struct PresenterReservation {
    session_id: SessionId,
    peer: PeerHandle,
    attempt: u64,
}

impl PresenterReservation {
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn connection_id(&self) -> &str {
        self.peer.connection_id()
    }
}

/// Viewer record registered against a live presenter, awaiting negotiation
pub struct ViewerReservation {
    session_id: SessionId,
    peer: PeerHandle,
    attempt: u64,
    pipeline: Arc<dyn MediaPipeline>,
    presenter_endpoint: Arc<dyn WebRtcEndpoint>,
}

impl ViewerReservation {
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn connection_id(&self) -> &str {
        self.peer.connection_id()
    }
}

/// One-presenter/many-viewers session state machine
pub struct SignalingCoordinator {
    registry: SessionRegistry,
    engine: MediaEngineHandle,
    attempts: AtomicU64,
}

impl SignalingCoordinator {
    /// Create a coordinator whose media engine client dials `address` on first use
    pub fn new(connector: Arc<dyn MediaEngineConnector>, address: impl Into<String>) -> Self {
        Self {
            registry: SessionRegistry::new(),
            engine: MediaEngineHandle::new(connector, address),
            attempts: AtomicU64::new(0),
        }
    }

    /// Session registry
    pub fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    /// Process-wide media engine handle
    pub fn engine(&self) -> &MediaEngineHandle {
        &self.engine
    }

    fn next_attempt(&self) -> u64 {
        self.attempts.fetch_add(1, Ordering::Relaxed) + 1
    }

    // ---- presenter ----

    /// Accept `peer` as presenter of `session_id` and return the SDP answer
    ///
    /// Candidate gathering is started separately with
    /// [`start_gathering`](Self::start_gathering) once the answer is delivered.
    pub async fn handle_presenter_request(
        &self,
        session_id: &str,
        peer: PeerHandle,
        sdp_offer: &str,
    ) -> Result<String> {
        let reservation = self.reserve_presenter(session_id, peer).await?;
        self.negotiate_presenter(reservation, sdp_offer).await
    }

    /// Claim the presenter slot of `session_id` for `peer`
    ///
    /// Fails with [`Error::PresenterAlreadyActive`] if the slot is taken; the
    /// requester's buffered candidates are discarded in both outcomes.
    pub async fn reserve_presenter(
        &self,
        session_id: &str,
        peer: PeerHandle,
    ) -> Result<PresenterReservation> {
        let mut session = self.registry.lock(session_id).await;
        session.candidates.clear(peer.connection_id());

        if let Some(current) = &session.presenter {
            info!(
                session_id,
                connection_id = peer.connection_id(),
                presenter = current.connection_id(),
                "Rejecting presenter, slot already taken"
            );
            return Err(Error::PresenterAlreadyActive);
        }

        let attempt = self.next_attempt();
        session.presenter = Some(PresenterRecord::pending(peer.clone(), attempt));
        debug!(session_id, connection_id = peer.connection_id(), attempt, "Presenter slot reserved");

        Ok(PresenterReservation {
            session_id: session_id.to_string(),
            peer,
            attempt,
        })
    }

    /// Build the presenter's pipeline and endpoint and negotiate its offer
    ///
    /// On failure the reservation is torn down completely before the error is
    /// returned.
    pub async fn negotiate_presenter(
        &self,
        reservation: PresenterReservation,
        sdp_offer: &str,
    ) -> Result<String> {
        match self.establish_presenter(&reservation, sdp_offer).await {
            Ok(answer) => {
                info!(
                    session_id = %reservation.session_id,
                    connection_id = reservation.connection_id(),
                    "Presenter accepted"
                );
                Ok(answer)
            }
            Err(e) => {
                let owned = self.abort_presenter(&reservation).await;
                warn!(
                    session_id = %reservation.session_id,
                    connection_id = reservation.connection_id(),
                    error = %e,
                    "Presenter request failed"
                );
                if owned {
                    Err(e)
                } else {
                    Err(Error::SessionInvalidated)
                }
            }
        }
    }

    async fn establish_presenter(
        &self,
        reservation: &PresenterReservation,
        sdp_offer: &str,
    ) -> Result<String> {
        let session_id = reservation.session_id.as_str();
        let connection_id = reservation.connection_id();
        let attempt = reservation.attempt;

        let client = self.engine.acquire().await?;
        self.ensure_presenter(session_id, attempt).await?;

        let pipeline = client.create_pipeline().await?;
        let committed = self
            .with_presenter(session_id, attempt, |record| {
                record.pipeline = Some(Arc::clone(&pipeline));
            })
            .await
            .is_some();
        if !committed {
            release_pipeline(pipeline.as_ref()).await;
            return Err(Error::SessionInvalidated);
        }

        let endpoint = pipeline.create_endpoint().await?;
        {
            let mut guard = self.lock_live(session_id).await?;
            let session = &mut *guard;
            match session.presenter.as_mut().filter(|p| p.attempt == attempt) {
                Some(record) => record.endpoint = Some(Arc::clone(&endpoint)),
                None => return Err(Error::SessionInvalidated),
            }
            session
                .candidates
                .drain_to(connection_id, endpoint.as_ref())
                .await?;
            endpoint
                .on_local_candidate(forward_local_candidates(&reservation.peer))
                .await?;
        }

        let answer = endpoint
            .process_offer(sdp_offer)
            .await
            .map_err(Error::into_negotiation)?;
        self.ensure_presenter(session_id, attempt).await?;

        Ok(answer)
    }

    /// Tear down the reservation if it is still current; returns whether it was
    async fn abort_presenter(&self, reservation: &PresenterReservation) -> bool {
        let Some(mut session) = self.registry.lock_existing(&reservation.session_id).await else {
            // The session went away while the engine was being dialed
            self.engine.release_if_idle(&self.registry).await;
            return false;
        };

        let owned = session
            .presenter
            .as_ref()
            .is_some_and(|p| p.attempt == reservation.attempt);
        let pipeline = if owned {
            teardown_presenter(&mut session)
        } else {
            None
        };
        session.candidates.clear(reservation.connection_id());

        self.finish(session, pipeline, None).await;
        owned
    }

    // ---- viewer ----

    /// Attach `peer` as a viewer of the presenter of `session_id` and return the SDP answer
    ///
    /// Candidate gathering is started separately with
    /// [`start_gathering`](Self::start_gathering) once the answer is delivered.
    pub async fn handle_viewer_request(
        &self,
        session_id: &str,
        peer: PeerHandle,
        sdp_offer: &str,
    ) -> Result<String> {
        let reservation = self.reserve_viewer(session_id, peer).await?;
        self.negotiate_viewer(reservation, sdp_offer).await
    }

    /// Register `peer` as a viewer of `session_id`
    ///
    /// Fails with [`Error::NoActivePresenter`] unless the presenter's pipeline
    /// and endpoint are established, and with [`Error::AlreadyPresenting`] when
    /// `peer` owns the presenter slot itself. A previous viewer record of the same
    /// connection is replaced and its endpoint released.
    pub async fn reserve_viewer(
        &self,
        session_id: &str,
        peer: PeerHandle,
    ) -> Result<ViewerReservation> {
        let connection_id = peer.connection_id().to_string();
        let mut session = self.registry.lock(session_id).await;

        if session
            .presenter
            .as_ref()
            .is_some_and(|p| p.connection_id() == connection_id)
        {
            info!(session_id, connection_id = %connection_id, "Rejecting viewer, connection is the presenter");
            return Err(Error::AlreadyPresenting);
        }

        let established = session.presenter.as_ref().and_then(|p| {
            match (&p.pipeline, &p.endpoint) {
                (Some(pipeline), Some(endpoint)) => Some((Arc::clone(pipeline), Arc::clone(endpoint))),
                _ => None,
            }
        });
        let Some((pipeline, presenter_endpoint)) = established else {
            info!(session_id, connection_id = %connection_id, "Rejecting viewer, no active presenter");
            session.candidates.clear(&connection_id);
            self.finish(session, None, None).await;
            return Err(Error::NoActivePresenter);
        };

        let attempt = self.next_attempt();
        let stale = session
            .viewers
            .insert(connection_id.clone(), ViewerRecord::pending(peer.clone(), attempt))
            .and_then(|previous| previous.endpoint);
        drop(session);

        if let Some(endpoint) = stale {
            debug!(session_id, connection_id = %connection_id, "Replacing previous viewer endpoint");
            release_endpoint(endpoint.as_ref()).await;
        }

        Ok(ViewerReservation {
            session_id: session_id.to_string(),
            peer,
            attempt,
            pipeline,
            presenter_endpoint,
        })
    }

    /// Create the viewer's endpoint, negotiate its offer and connect the presenter to it
    ///
    /// On failure only the viewer's own record and endpoint are rolled back.
    pub async fn negotiate_viewer(
        &self,
        reservation: ViewerReservation,
        sdp_offer: &str,
    ) -> Result<String> {
        match self.establish_viewer(&reservation, sdp_offer).await {
            Ok(answer) => {
                info!(
                    session_id = %reservation.session_id,
                    connection_id = reservation.connection_id(),
                    "Viewer accepted"
                );
                Ok(answer)
            }
            Err(e) => {
                let owned = self.abort_viewer(&reservation).await;
                warn!(
                    session_id = %reservation.session_id,
                    connection_id = reservation.connection_id(),
                    error = %e,
                    "Viewer request failed"
                );
                if owned {
                    Err(e)
                } else {
                    Err(Error::SessionInvalidated)
                }
            }
        }
    }

    async fn establish_viewer(
        &self,
        reservation: &ViewerReservation,
        sdp_offer: &str,
    ) -> Result<String> {
        let session_id = reservation.session_id.as_str();
        let connection_id = reservation.connection_id();
        let attempt = reservation.attempt;

        let endpoint = reservation.pipeline.create_endpoint().await?;
        {
            let mut guard = match self.lock_live(session_id).await {
                Ok(guard) => guard,
                Err(e) => {
                    release_endpoint(endpoint.as_ref()).await;
                    return Err(e);
                }
            };
            let session = &mut *guard;
            match session.viewer_for(connection_id, attempt) {
                Some(record) => record.endpoint = Some(Arc::clone(&endpoint)),
                None => {
                    release_endpoint(endpoint.as_ref()).await;
                    return Err(Error::SessionInvalidated);
                }
            }
            session
                .candidates
                .drain_to(connection_id, endpoint.as_ref())
                .await?;
            endpoint
                .on_local_candidate(forward_local_candidates(&reservation.peer))
                .await?;
        }

        let answer = endpoint
            .process_offer(sdp_offer)
            .await
            .map_err(Error::into_negotiation)?;
        self.ensure_viewer(session_id, connection_id, attempt).await?;

        reservation
            .presenter_endpoint
            .connect_to(endpoint.as_ref())
            .await
            .map_err(Error::into_negotiation)?;
        self.ensure_viewer(session_id, connection_id, attempt).await?;

        Ok(answer)
    }

    /// Remove the viewer record if it is still current; returns whether it was
    async fn abort_viewer(&self, reservation: &ViewerReservation) -> bool {
        let connection_id = reservation.connection_id();
        let Some(mut session) = self.registry.lock_existing(&reservation.session_id).await else {
            return false;
        };

        let owned = session
            .viewers
            .get(connection_id)
            .is_some_and(|v| v.attempt == reservation.attempt);
        let endpoint = if owned {
            session
                .viewers
                .remove(connection_id)
                .and_then(|record| record.endpoint)
        } else {
            None
        };
        session.candidates.clear(connection_id);

        self.finish(session, None, endpoint).await;
        owned
    }

    // ---- gathering ----

    /// Start local candidate gathering on the endpoint owned by `connection_id`
    ///
    /// Gathered candidates are pushed to the connection as `iceCandidate`
    /// messages by the callback registered during negotiation.
    pub async fn start_gathering(&self, session_id: &str, connection_id: &str) -> Result<()> {
        let endpoint = {
            let session = self.lock_live(session_id).await?;
            owned_endpoint(&session, connection_id).ok_or(Error::SessionInvalidated)?
        };

        endpoint
            .gather_candidates()
            .await
            .map_err(Error::into_negotiation)?;
        debug!(session_id, connection_id, endpoint = endpoint.id(), "Gathering candidates");
        Ok(())
    }

    // ---- stop ----

    /// Remove `connection_id` from `session_id`
    ///
    /// A presenter stop notifies every viewer with `stopCommunication` and
    /// releases the pipeline; a viewer stop releases only its endpoint. The
    /// connection's buffered candidates are discarded in every case and the
    /// session is dropped once empty, closing the media engine client when it
    /// was the last one. Stopping an unknown session or connection is a no-op.
    pub async fn handle_stop(&self, session_id: &str, connection_id: &str) {
        let Some(mut session) = self.registry.lock_existing(session_id).await else {
            debug!(session_id, connection_id, "Stop for unknown session");
            return;
        };

        let is_presenter = session
            .presenter
            .as_ref()
            .is_some_and(|p| p.connection_id() == connection_id);

        let mut pipeline = None;
        let mut endpoint = None;
        if is_presenter {
            info!(session_id, connection_id, viewers = session.viewers.len(), "Presenter stopped");
            pipeline = teardown_presenter(&mut session);
        } else if let Some(viewer) = session.viewers.remove(connection_id) {
            info!(session_id, connection_id, "Viewer stopped");
            endpoint = viewer.endpoint;
        }
        session.candidates.clear(connection_id);

        self.finish(session, pipeline, endpoint).await;
    }

    // ---- ICE ----

    /// Route a remote candidate to its endpoint, or buffer it until the endpoint exists
    ///
    /// A publisher candidate goes to the presenter endpoint when this
    /// connection owns it; otherwise the connection's viewer endpoint is used;
    /// otherwise the candidate is queued under the connection ID. Candidates
    /// for a session without presenter or viewers are dropped, since nothing
    /// could ever claim them.
    pub async fn handle_ice_candidate(
        &self,
        role: CandidateRole,
        session_id: &str,
        connection_id: &str,
        candidate: IceCandidate,
    ) -> Result<()> {
        let Some(mut guard) = self.registry.lock_existing(session_id).await else {
            debug!(session_id, connection_id, ?role, "Dropping candidate for unknown session");
            return Ok(());
        };
        let session = &mut *guard;

        let presenter_endpoint = match role {
            CandidateRole::Publisher => session
                .presenter
                .as_ref()
                .filter(|p| p.connection_id() == connection_id)
                .and_then(|p| p.endpoint.clone()),
            CandidateRole::Subscriber => None,
        };
        let target = presenter_endpoint.or_else(|| {
            session
                .viewers
                .get(connection_id)
                .and_then(|v| v.endpoint.clone())
        });

        match target {
            Some(endpoint) => endpoint.add_ice_candidate(candidate).await,
            None => {
                debug!(session_id, connection_id, ?role, "Queueing candidate");
                session.candidates.enqueue(connection_id, candidate);
                Ok(())
            }
        }
    }

    // ---- introspection ----

    /// Coarse state of `session_id`; unknown sessions are idle
    pub async fn session_state(&self, session_id: &str) -> SessionState {
        match self.registry.lock_existing(session_id).await {
            Some(session) => session.state(),
            None => SessionState::Idle,
        }
    }

    /// Media engine ID of the presenter endpoint
    pub async fn presenter_endpoint_id(&self, session_id: &str) -> Option<String> {
        let session = self.registry.lock_existing(session_id).await?;
        let presenter = session.presenter.as_ref()?;
        presenter.endpoint.as_ref().map(|e| e.id().to_string())
    }

    /// Media engine ID of the endpoint of viewer `connection_id`
    pub async fn viewer_endpoint_id(&self, session_id: &str, connection_id: &str) -> Option<String> {
        let session = self.registry.lock_existing(session_id).await?;
        let viewer = session.viewers.get(connection_id)?;
        viewer.endpoint.as_ref().map(|e| e.id().to_string())
    }

    /// Number of viewer records of `session_id`
    pub async fn viewer_count(&self, session_id: &str) -> usize {
        match self.registry.lock_existing(session_id).await {
            Some(session) => session.viewers.len(),
            None => 0,
        }
    }

    // ---- helpers ----

    async fn lock_live(&self, session_id: &str) -> Result<SessionGuard> {
        self.registry
            .lock_existing(session_id)
            .await
            .ok_or(Error::SessionInvalidated)
    }

    async fn with_presenter<R>(
        &self,
        session_id: &str,
        attempt: u64,
        f: impl FnOnce(&mut PresenterRecord) -> R,
    ) -> Option<R> {
        let mut session = self.registry.lock_existing(session_id).await?;
        session.presenter_for(attempt).map(f)
    }

    async fn ensure_presenter(&self, session_id: &str, attempt: u64) -> Result<()> {
        self.with_presenter(session_id, attempt, |_| ())
            .await
            .ok_or(Error::SessionInvalidated)
    }

    async fn ensure_viewer(&self, session_id: &str, connection_id: &str, attempt: u64) -> Result<()> {
        let mut session = self.lock_live(session_id).await?;
        session
            .viewer_for(connection_id, attempt)
            .map(|_| ())
            .ok_or(Error::SessionInvalidated)
    }

    /// Leave the critical section, release detached media and drop the session if empty
    async fn finish(
        &self,
        mut session: SessionGuard,
        pipeline: Option<Arc<dyn MediaPipeline>>,
        endpoint: Option<Arc<dyn WebRtcEndpoint>>,
    ) {
        let removed = self.registry.remove_if_empty(&mut session);
        drop(session);

        if let Some(endpoint) = endpoint {
            release_endpoint(endpoint.as_ref()).await;
        }
        if let Some(pipeline) = pipeline {
            release_pipeline(pipeline.as_ref()).await;
        }
        if removed {
            self.engine.release_if_idle(&self.registry).await;
        }
    }
}

/// Clear the presenter slot and every viewer, notifying each viewer once
///
/// Returns the pipeline to release; releasing it also releases every viewer
/// endpoint.
fn teardown_presenter(session: &mut Session) -> Option<Arc<dyn MediaPipeline>> {
    let presenter = session.presenter.take()?;
    for (connection_id, viewer) in session.viewers.drain() {
        viewer.peer.send(ServerMessage::StopCommunication);
        session.candidates.clear(&connection_id);
    }
    presenter.pipeline
}

fn owned_endpoint(session: &Session, connection_id: &str) -> Option<Arc<dyn WebRtcEndpoint>> {
    match &session.presenter {
        Some(p) if p.connection_id() == connection_id => p.endpoint.clone(),
        _ => session
            .viewers
            .get(connection_id)
            .and_then(|v| v.endpoint.clone()),
    }
}

fn forward_local_candidates(peer: &PeerHandle) -> LocalCandidateCallback {
    let peer = peer.clone();
    Arc::new(move |candidate| {
        peer.send(ServerMessage::ice_candidate(candidate));
    })
}

async fn release_pipeline(pipeline: &dyn MediaPipeline) {
    if let Err(e) = pipeline.release().await {
        warn!(pipeline = pipeline.id(), error = %e, "Failed to release pipeline");
    }
}

async fn release_endpoint(endpoint: &dyn WebRtcEndpoint) {
    if let Err(e) = endpoint.release().await {
        warn!(endpoint = endpoint.id(), error = %e, "Failed to release endpoint");
    }
}
