//! Buffer for ICE candidates that arrive before their endpoint exists

use super::ConnectionId;
use crate::media::{IceCandidate, WebRtcEndpoint};
use crate::Result;
use std::collections::{HashMap, VecDeque};
use tracing::debug;

/// Per-connection FIFO queues of remote ICE candidates
#[derive(Debug, Default)]
pub struct CandidateQueue {
    queues: HashMap<ConnectionId, VecDeque<IceCandidate>>,
}

impl CandidateQueue {
    /// Create an empty queue
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a candidate for `key`
    pub fn enqueue(&mut self, key: &str, candidate: IceCandidate) {
        self.queues
            .entry(key.to_string())
            .or_default()
            .push_back(candidate);
    }

    /// Remove and return every candidate buffered for `key`, oldest first
    pub fn take(&mut self, key: &str) -> VecDeque<IceCandidate> {
        self.queues.remove(key).unwrap_or_default()
    }

    /// Forward every candidate buffered for `key` to `endpoint` in arrival order
    ///
    /// The entry is removed before forwarding, so each candidate is delivered at
    /// most once. Returns the number of candidates forwarded.
    pub async fn drain_to(&mut self, key: &str, endpoint: &dyn WebRtcEndpoint) -> Result<usize> {
        let queued = self.take(key);
        let count = queued.len();
        for candidate in queued {
            endpoint.add_ice_candidate(candidate).await?;
        }
        if count > 0 {
            debug!(connection_id = key, endpoint = endpoint.id(), count, "Flushed queued candidates");
        }
        Ok(count)
    }

    /// Discard every candidate buffered for `key` without forwarding
    pub fn clear(&mut self, key: &str) -> usize {
        self.queues.remove(key).map(|q| q.len()).unwrap_or(0)
    }

    /// Discard every buffered candidate of every connection
    pub fn clear_all(&mut self) -> usize {
        self.queues.drain().map(|(_, q)| q.len()).sum()
    }

    /// Number of candidates buffered for `key`
    pub fn len(&self, key: &str) -> usize {
        self.queues.get(key).map(VecDeque::len).unwrap_or(0)
    }

    /// Whether no candidate is buffered for any connection
    pub fn is_empty(&self) -> bool {
        self.queues.is_empty()
    }
}
