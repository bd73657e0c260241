//! Session registry
//!
//! Authoritative map from session ID to the session's presenter, viewers and
//! buffered candidates. Each session sits behind its own async mutex; holding
//! the guard is the per-session critical section the coordinator serializes
//! on. The map itself is only locked briefly to look up or remove entries.

use super::candidates::CandidateQueue;
use super::{ConnectionId, PeerHandle, SessionId};
use crate::media::{MediaPipeline, WebRtcEndpoint};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tracing::{debug, info};

/// Coarse broadcast state of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// No presenter
    Idle,
    /// Presenter slot reserved, pipeline or endpoint not yet established
    Negotiating,
    /// Presenter pipeline and endpoint established
    Live,
}

/// The single publisher of a session
pub struct PresenterRecord {
    /// Outbound handle of the presenter's connection
    pub peer: PeerHandle,
    /// Request attempt that owns this record
    pub attempt: u64,
    /// Media pipeline, set once created
    pub pipeline: Option<Arc<dyn MediaPipeline>>,
    /// Publisher endpoint, set once created
    pub endpoint: Option<Arc<dyn WebRtcEndpoint>>,
}

impl PresenterRecord {
    /// Reserve the presenter slot for `peer`
    pub fn pending(peer: PeerHandle, attempt: u64) -> Self {
        Self {
            peer,
            attempt,
            pipeline: None,
            endpoint: None,
        }
    }

    /// Connection that owns the presenter slot
    pub fn connection_id(&self) -> &str {
        self.peer.connection_id()
    }

    /// Whether pipeline and endpoint both exist
    pub fn is_established(&self) -> bool {
        self.pipeline.is_some() && self.endpoint.is_some()
    }
}

/// A subscriber attached to the presenter's pipeline
pub struct ViewerRecord {
    /// Outbound handle of the viewer's connection
    pub peer: PeerHandle,
    /// Request attempt that owns this record
    pub attempt: u64,
    /// Subscriber endpoint, set once created
    pub endpoint: Option<Arc<dyn WebRtcEndpoint>>,
}

impl ViewerRecord {
    /// Register `peer` as a viewer whose endpoint is still being created
    pub fn pending(peer: PeerHandle, attempt: u64) -> Self {
        Self {
            peer,
            attempt,
            endpoint: None,
        }
    }
}

/// One broadcast room
pub struct Session {
    session_id: SessionId,
    /// Current presenter, at most one
    pub presenter: Option<PresenterRecord>,
    /// Viewers keyed by their own connection ID
    pub viewers: HashMap<ConnectionId, ViewerRecord>,
    /// Candidates waiting for their endpoint, keyed by connection ID
    pub candidates: CandidateQueue,
    closed: bool,
}

impl Session {
    fn new(session_id: SessionId) -> Self {
        Self {
            session_id,
            presenter: None,
            viewers: HashMap::new(),
            candidates: CandidateQueue::new(),
            closed: false,
        }
    }

    /// Session ID
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Whether the session has neither presenter nor viewers
    ///
    /// Buffered candidates do not keep a session alive.
    pub fn is_empty(&self) -> bool {
        self.presenter.is_none() && self.viewers.is_empty()
    }

    /// Coarse broadcast state
    pub fn state(&self) -> SessionState {
        match &self.presenter {
            None => SessionState::Idle,
            Some(p) if p.is_established() => SessionState::Live,
            Some(_) => SessionState::Negotiating,
        }
    }

    /// Presenter record if it still belongs to `attempt`
    pub fn presenter_for(&mut self, attempt: u64) -> Option<&mut PresenterRecord> {
        self.presenter.as_mut().filter(|p| p.attempt == attempt)
    }

    /// Viewer record of `connection_id` if it still belongs to `attempt`
    pub fn viewer_for(&mut self, connection_id: &str, attempt: u64) -> Option<&mut ViewerRecord> {
        self.viewers
            .get_mut(connection_id)
            .filter(|v| v.attempt == attempt)
    }
}

/// Guard over a session's critical section
pub type SessionGuard = OwnedMutexGuard<Session>;

/// Map of live sessions
#[derive(Default)]
pub struct SessionRegistry {
    sessions: Mutex<HashMap<SessionId, Arc<AsyncMutex<Session>>>>,
}

impl SessionRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the session for `session_id`, creating an empty one if absent
    pub fn get_or_create_session(&self, session_id: &str) -> Arc<AsyncMutex<Session>> {
        let mut sessions = self.sessions.lock();
        Arc::clone(sessions.entry(session_id.to_string()).or_insert_with(|| {
            debug!(session_id, "Creating session");
            Arc::new(AsyncMutex::new(Session::new(session_id.to_string())))
        }))
    }

    /// Enter the critical section of `session_id`, creating the session if absent
    ///
    /// A session removed while this call waited for its lock is skipped and the
    /// lookup retried, so the returned guard always refers to the registered
    /// session.
    pub async fn lock(&self, session_id: &str) -> SessionGuard {
        loop {
            let guard = self.get_or_create_session(session_id).lock_owned().await;
            if !guard.closed {
                return guard;
            }
        }
    }

    /// Enter the critical section of `session_id` only if it exists
    pub async fn lock_existing(&self, session_id: &str) -> Option<SessionGuard> {
        loop {
            let session = self.sessions.lock().get(session_id).cloned()?;
            let guard = session.lock_owned().await;
            if !guard.closed {
                return Some(guard);
            }
        }
    }

    /// Remove the locked session if it is empty
    ///
    /// Candidates still buffered for connections without a role are discarded.
    /// Must be called with the session's own guard; returns true when removed.
    pub fn remove_if_empty(&self, session: &mut Session) -> bool {
        if session.closed || !session.is_empty() {
            return false;
        }

        let discarded = session.candidates.clear_all();
        session.closed = true;
        self.sessions.lock().remove(&session.session_id);
        info!(session_id = %session.session_id, discarded, "Session removed");
        true
    }

    /// Whether a session is registered
    pub fn contains(&self, session_id: &str) -> bool {
        self.sessions.lock().contains_key(session_id)
    }

    /// Number of registered sessions
    pub fn len(&self) -> usize {
        self.sessions.lock().len()
    }

    /// Whether no session is registered
    pub fn is_empty(&self) -> bool {
        self.sessions.lock().is_empty()
    }
}
