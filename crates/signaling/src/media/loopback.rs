//! In-process loopback media engine
//!
//! Implements the media engine traits without any media plane: answers are
//! synthesised, and every call is recorded so tests can assert on candidate
//! order, media links and releases. Failure injection and an artificial
//! per-call delay make it possible to exercise rollback and in-flight
//! cancellation paths.

use super::{
    IceCandidate, LocalCandidateCallback, MediaEngineClient, MediaEngineConnector, MediaPipeline,
    WebRtcEndpoint,
};
use crate::{Error, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

/// Call counters of a loopback engine
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LoopbackStats {
    /// Successful `connect` calls
    pub connects: usize,
    /// `close` calls
    pub closes: usize,
    /// Pipelines created
    pub pipelines_created: usize,
    /// Endpoints created
    pub endpoints_created: usize,
}

#[derive(Default)]
struct PipelineState {
    released: bool,
    endpoints: Vec<String>,
}

#[derive(Default)]
struct EndpointState {
    pipeline: String,
    released: bool,
    offers: Vec<String>,
    candidates: Vec<IceCandidate>,
    sinks: Vec<String>,
    callback: Option<LocalCandidateCallback>,
}

#[derive(Default)]
struct EngineState {
    unreachable: bool,
    fail_negotiation: bool,
    fail_endpoint_creation: bool,
    delay: Duration,
    generation: u64,
    local_candidates: Vec<IceCandidate>,
    next_id: u64,
    stats: LoopbackStats,
    pipelines: HashMap<String, PipelineState>,
    endpoint_order: Vec<String>,
    endpoints: HashMap<String, EndpointState>,
}

impl EngineState {
    fn alloc_id(&mut self, kind: &str) -> String {
        self.next_id += 1;
        format!("{}-{}", kind, self.next_id)
    }

    fn live_endpoint(&mut self, id: &str) -> Result<&mut EndpointState> {
        match self.endpoints.get_mut(id) {
            Some(endpoint) if !endpoint.released => Ok(endpoint),
            Some(_) => Err(Error::MediaEngineError(format!("endpoint {} released", id))),
            None => Err(Error::MediaEngineError(format!("unknown endpoint {}", id))),
        }
    }
}

/// In-process media engine; clones share state
#[derive(Clone, Default)]
pub struct LoopbackEngine {
    state: Arc<Mutex<EngineState>>,
}

impl LoopbackEngine {
    /// Create a healthy engine with no delay
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `connect` fail as if the engine were down
    pub fn set_unreachable(&self, unreachable: bool) {
        self.state.lock().unreachable = unreachable;
    }

    /// Make `process_offer` fail
    pub fn set_fail_negotiation(&self, fail: bool) {
        self.state.lock().fail_negotiation = fail;
    }

    /// Make `create_endpoint` fail
    pub fn set_fail_endpoint_creation(&self, fail: bool) {
        self.state.lock().fail_endpoint_creation = fail;
    }

    /// Sever every client connected so far, as if the engine restarted
    pub fn drop_connections(&self) {
        self.state.lock().generation += 1;
    }

    /// Delay applied before every engine call completes
    pub fn set_delay(&self, delay: Duration) {
        self.state.lock().delay = delay;
    }

    /// Candidates emitted through the local-candidate callback on `gather_candidates`
    pub fn set_local_candidates(&self, candidates: Vec<IceCandidate>) {
        self.state.lock().local_candidates = candidates;
    }

    /// Call counters
    pub fn stats(&self) -> LoopbackStats {
        self.state.lock().stats
    }

    /// Endpoint IDs in creation order
    pub fn endpoint_ids(&self) -> Vec<String> {
        self.state.lock().endpoint_order.clone()
    }

    /// Remote candidates delivered to an endpoint, in delivery order
    pub fn candidates_of(&self, endpoint_id: &str) -> Vec<IceCandidate> {
        self.state
            .lock()
            .endpoints
            .get(endpoint_id)
            .map(|e| e.candidates.clone())
            .unwrap_or_default()
    }

    /// Offers processed by an endpoint
    pub fn offers_of(&self, endpoint_id: &str) -> Vec<String> {
        self.state
            .lock()
            .endpoints
            .get(endpoint_id)
            .map(|e| e.offers.clone())
            .unwrap_or_default()
    }

    /// Endpoints an endpoint sends media to
    pub fn sinks_of(&self, endpoint_id: &str) -> Vec<String> {
        self.state
            .lock()
            .endpoints
            .get(endpoint_id)
            .map(|e| e.sinks.clone())
            .unwrap_or_default()
    }

    /// Whether a pipeline or endpoint has been released
    pub fn is_released(&self, id: &str) -> bool {
        let state = self.state.lock();
        if let Some(pipeline) = state.pipelines.get(id) {
            return pipeline.released;
        }
        state.endpoints.get(id).map(|e| e.released).unwrap_or(false)
    }

    /// Number of pipelines not yet released
    pub fn live_pipelines(&self) -> usize {
        self.state
            .lock()
            .pipelines
            .values()
            .filter(|p| !p.released)
            .count()
    }

    async fn pause(&self) {
        let delay = self.state.lock().delay;
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
    }
}

#[async_trait]
impl MediaEngineConnector for LoopbackEngine {
    async fn connect(&self, address: &str) -> Result<Arc<dyn MediaEngineClient>> {
        self.pause().await;
        let mut state = self.state.lock();
        if state.unreachable {
            return Err(Error::MediaEngineUnavailable {
                address: address.to_string(),
                reason: "loopback engine unreachable".to_string(),
            });
        }
        state.stats.connects += 1;
        Ok(Arc::new(LoopbackClient {
            engine: self.clone(),
            generation: state.generation,
        }))
    }
}

struct LoopbackClient {
    engine: LoopbackEngine,
    generation: u64,
}

#[async_trait]
impl MediaEngineClient for LoopbackClient {
    async fn create_pipeline(&self) -> Result<Arc<dyn MediaPipeline>> {
        self.engine.pause().await;
        let mut state = self.engine.state.lock();
        if state.generation != self.generation {
            return Err(Error::MediaEngineUnavailable {
                address: "loopback://".to_string(),
                reason: "connection closed".to_string(),
            });
        }
        let id = state.alloc_id("pipeline");
        state.pipelines.insert(id.clone(), PipelineState::default());
        state.stats.pipelines_created += 1;
        Ok(Arc::new(LoopbackPipeline {
            id,
            engine: self.engine.clone(),
        }))
    }

    fn is_connected(&self) -> bool {
        self.engine.state.lock().generation == self.generation
    }

    async fn close(&self) {
        self.engine.state.lock().stats.closes += 1;
    }
}

struct LoopbackPipeline {
    id: String,
    engine: LoopbackEngine,
}

#[async_trait]
impl MediaPipeline for LoopbackPipeline {
    fn id(&self) -> &str {
        &self.id
    }

    async fn create_endpoint(&self) -> Result<Arc<dyn WebRtcEndpoint>> {
        self.engine.pause().await;
        let mut state = self.engine.state.lock();
        if state.fail_endpoint_creation {
            return Err(Error::MediaEngineError(
                "loopback endpoint creation failed".to_string(),
            ));
        }
        match state.pipelines.get(&self.id) {
            Some(p) if !p.released => {}
            _ => {
                return Err(Error::MediaEngineError(format!(
                    "pipeline {} released",
                    self.id
                )))
            }
        }

        let id = state.alloc_id("endpoint");
        if let Some(pipeline) = state.pipelines.get_mut(&self.id) {
            pipeline.endpoints.push(id.clone());
        }
        state.endpoints.insert(
            id.clone(),
            EndpointState {
                pipeline: self.id.clone(),
                ..Default::default()
            },
        );
        state.endpoint_order.push(id.clone());
        state.stats.endpoints_created += 1;

        Ok(Arc::new(LoopbackEndpoint {
            id,
            engine: self.engine.clone(),
        }))
    }

    async fn release(&self) -> Result<()> {
        self.engine.pause().await;
        let mut state = self.engine.state.lock();
        let endpoints = match state.pipelines.get_mut(&self.id) {
            Some(pipeline) if !pipeline.released => {
                pipeline.released = true;
                pipeline.endpoints.clone()
            }
            _ => {
                return Err(Error::MediaEngineError(format!(
                    "pipeline {} already released",
                    self.id
                )))
            }
        };
        for endpoint in endpoints {
            if let Some(e) = state.endpoints.get_mut(&endpoint) {
                e.released = true;
                e.callback = None;
            }
        }
        Ok(())
    }
}

struct LoopbackEndpoint {
    id: String,
    engine: LoopbackEngine,
}

#[async_trait]
impl WebRtcEndpoint for LoopbackEndpoint {
    fn id(&self) -> &str {
        &self.id
    }

    async fn process_offer(&self, sdp_offer: &str) -> Result<String> {
        self.engine.pause().await;
        let mut state = self.engine.state.lock();
        let fail = state.fail_negotiation;
        let endpoint = state.live_endpoint(&self.id)?;
        if fail || sdp_offer.is_empty() {
            return Err(Error::NegotiationFailed(format!(
                "loopback endpoint {} rejected offer",
                self.id
            )));
        }
        endpoint.offers.push(sdp_offer.to_string());
        Ok(format!(
            "v=0\r\no=loopback 0 0 IN IP4 127.0.0.1\r\ns={}\r\nt=0 0\r\n",
            self.id
        ))
    }

    async fn connect_to(&self, sink: &dyn WebRtcEndpoint) -> Result<()> {
        self.engine.pause().await;
        let mut state = self.engine.state.lock();
        state.live_endpoint(sink.id())?;
        let pipeline = state.live_endpoint(&self.id)?.pipeline.clone();
        if state.endpoints.get(sink.id()).map(|e| e.pipeline.as_str()) != Some(pipeline.as_str()) {
            return Err(Error::NegotiationFailed(format!(
                "{} and {} are on different pipelines",
                self.id,
                sink.id()
            )));
        }
        state.live_endpoint(&self.id)?.sinks.push(sink.id().to_string());
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()> {
        self.engine.pause().await;
        let mut state = self.engine.state.lock();
        state.live_endpoint(&self.id)?.candidates.push(candidate);
        Ok(())
    }

    async fn gather_candidates(&self) -> Result<()> {
        self.engine.pause().await;
        let (callback, candidates) = {
            let mut state = self.engine.state.lock();
            let local = state.local_candidates.clone();
            let endpoint = state.live_endpoint(&self.id)?;
            (endpoint.callback.clone(), local)
        };
        if let Some(callback) = callback {
            for candidate in candidates {
                callback(candidate);
            }
        }
        Ok(())
    }

    async fn on_local_candidate(&self, callback: LocalCandidateCallback) -> Result<()> {
        let mut state = self.engine.state.lock();
        state.live_endpoint(&self.id)?.callback = Some(callback);
        Ok(())
    }

    async fn release(&self) -> Result<()> {
        self.engine.pause().await;
        let mut state = self.engine.state.lock();
        let endpoint = state.live_endpoint(&self.id)?;
        endpoint.released = true;
        endpoint.callback = None;
        Ok(())
    }
}
