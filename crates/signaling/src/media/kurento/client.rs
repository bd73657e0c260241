//! WebSocket JSON-RPC client for the Kurento media server
//!
//! One background task writes outgoing frames, another reads responses and
//! `onEvent` notifications. Requests are correlated with responses through a
//! table of one-shot channels keyed by request id.

use super::protocol::{params, InboundMessage, JsonRpcRequest, MediaEvent, ICE_CANDIDATE_FOUND};
use crate::media::{
    IceCandidate, LocalCandidateCallback, MediaEngineClient, MediaEngineConnector, MediaPipeline,
    WebRtcEndpoint,
};
use crate::{Error, Result};
use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, warn};

type WsStream = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

type PendingRequests = HashMap<u64, oneshot::Sender<Result<Value>>>;

/// Dials Kurento media servers
#[derive(Debug, Clone)]
pub struct KurentoConnector {
    request_timeout: Duration,
    keepalive: Option<Duration>,
}

impl KurentoConnector {
    /// Create a connector
    ///
    /// # Arguments
    ///
    /// * `request_timeout` - Deadline for every JSON-RPC request, including the initial dial
    /// * `keepalive` - Interval between `ping` requests, `None` to disable
    pub fn new(request_timeout: Duration, keepalive: Option<Duration>) -> Self {
        Self {
            request_timeout,
            keepalive,
        }
    }
}

#[async_trait]
impl MediaEngineConnector for KurentoConnector {
    async fn connect(&self, address: &str) -> Result<Arc<dyn MediaEngineClient>> {
        let client = KurentoClient::connect(address, self.request_timeout, self.keepalive).await?;
        Ok(Arc::new(client))
    }
}

struct Inner {
    address: String,
    tx: mpsc::UnboundedSender<Message>,
    pending: Mutex<PendingRequests>,
    listeners: Mutex<HashMap<String, LocalCandidateCallback>>,
    session_id: Mutex<Option<String>>,
    next_id: AtomicU64,
    request_timeout: Duration,
    closed: AtomicBool,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Inner {
    fn unavailable(&self, reason: impl Into<String>) -> Error {
        Error::MediaEngineUnavailable {
            address: self.address.clone(),
            reason: reason.into(),
        }
    }

    async fn request(&self, method: &str, mut params: Value) -> Result<Value> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(self.unavailable("connection closed"));
        }

        let session_id = self.session_id.lock().clone();
        if let (Some(session_id), Some(map)) = (session_id, params.as_object_mut()) {
            map.insert("sessionId".to_string(), Value::String(session_id));
        }

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(id, tx);

        let json = JsonRpcRequest::new(method, params, Some(id)).to_json()?;
        debug!(id, method, "Sending media engine request");

        if self.tx.send(Message::Text(json)).is_err() {
            self.pending.lock().remove(&id);
            return Err(self.unavailable("connection closed"));
        }

        match tokio::time::timeout(self.request_timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(self.unavailable("connection closed")),
            Err(_) => {
                self.pending.lock().remove(&id);
                Err(Error::Timeout(format!(
                    "{} after {:?}",
                    method, self.request_timeout
                )))
            }
        }
    }

    async fn request_value(&self, method: &str, params: Value) -> Result<String> {
        let result = self.request(method, params).await?;
        result
            .get("value")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| {
                Error::MediaEngineError(format!("{} response without value: {}", method, result))
            })
    }

    fn handle_message(&self, text: &str) -> Result<()> {
        let msg = InboundMessage::from_json(text)?;

        if let Some(method) = msg.method.as_deref() {
            if method == "onEvent" {
                let params = msg.params.unwrap_or(Value::Null);
                let event = MediaEvent::from_params(&params)?;
                if let Some(candidate) = event.ice_candidate() {
                    let callback = self.listeners.lock().get(&event.object).cloned();
                    match callback {
                        Some(callback) => callback(candidate),
                        None => debug!(object = %event.object, "No listener for local candidate"),
                    }
                } else {
                    debug!(event_type = %event.event_type, object = %event.object, "Ignoring media event");
                }
            } else {
                debug!(method, "Ignoring media engine notification");
            }
            return Ok(());
        }

        let Some(id) = msg.id else {
            warn!("Media engine message without id or method: {}", text);
            return Ok(());
        };

        let result = match (msg.result, msg.error) {
            (_, Some(err)) => Err(Error::MediaEngineError(format!(
                "{} (code {})",
                err.message, err.code
            ))),
            (Some(result), None) => {
                if let Some(session_id) = result.get("sessionId").and_then(Value::as_str) {
                    let mut current = self.session_id.lock();
                    if current.is_none() {
                        debug!(session_id, "Media engine session established");
                        *current = Some(session_id.to_string());
                    }
                }
                Ok(result)
            }
            (None, None) => Ok(Value::Null),
        };

        match self.pending.lock().remove(&id) {
            Some(tx) => {
                let _ = tx.send(result);
            }
            None => debug!(id, "Response for unknown or expired request"),
        }
        Ok(())
    }

    fn shutdown(&self, reason: &str) {
        self.closed.store(true, Ordering::SeqCst);
        let pending: Vec<_> = self.pending.lock().drain().collect();
        for (_, tx) in pending {
            let _ = tx.send(Err(self.unavailable(reason)));
        }
        self.listeners.lock().clear();
    }
}

/// Connected Kurento client
pub struct KurentoClient {
    inner: Arc<Inner>,
}

impl KurentoClient {
    /// Connect to the media server at `address`
    ///
    /// Establishes the WebSocket connection and starts background tasks for
    /// sending, receiving and keepalive pings.
    pub async fn connect(
        address: &str,
        request_timeout: Duration,
        keepalive: Option<Duration>,
    ) -> Result<Self> {
        info!("Connecting to media server: {}", address);

        let unavailable = |reason: String| Error::MediaEngineUnavailable {
            address: address.to_string(),
            reason,
        };

        let (ws_stream, _) = tokio::time::timeout(request_timeout, connect_async(address))
            .await
            .map_err(|_| unavailable(format!("connect timed out after {:?}", request_timeout)))?
            .map_err(|e| unavailable(e.to_string()))?;

        info!("Connected to media server");

        let (write, read) = ws_stream.split();
        let (tx, rx) = mpsc::unbounded_channel();

        let inner = Arc::new(Inner {
            address: address.to_string(),
            tx,
            pending: Mutex::new(HashMap::new()),
            listeners: Mutex::new(HashMap::new()),
            session_id: Mutex::new(None),
            next_id: AtomicU64::new(1),
            request_timeout,
            closed: AtomicBool::new(false),
            tasks: Mutex::new(Vec::new()),
        });

        let mut tasks = vec![
            tokio::spawn(Self::sender_task(write, rx)),
            tokio::spawn(Self::receiver_task(read, Arc::clone(&inner))),
        ];
        if let Some(interval) = keepalive {
            tasks.push(tokio::spawn(Self::keepalive_task(Arc::clone(&inner), interval)));
        }
        *inner.tasks.lock() = tasks;

        Ok(Self { inner })
    }

    /// Sender task: sends messages from channel to WebSocket
    async fn sender_task(
        mut write: futures::stream::SplitSink<WsStream, Message>,
        mut rx: mpsc::UnboundedReceiver<Message>,
    ) {
        while let Some(msg) = rx.recv().await {
            if let Err(e) = write.send(msg).await {
                error!("Failed to send media engine message: {}", e);
                break;
            }
        }

        debug!("Media engine sender task terminated");
    }

    /// Receiver task: routes responses to waiting requests and events to listeners
    async fn receiver_task(mut read: futures::stream::SplitStream<WsStream>, inner: Arc<Inner>) {
        while let Some(msg_result) = read.next().await {
            match msg_result {
                Ok(Message::Text(text)) => {
                    if let Err(e) = inner.handle_message(&text) {
                        warn!("Failed to handle media engine message: {}", e);
                    }
                }
                Ok(Message::Close(_)) => {
                    info!("Media server closed the connection");
                    break;
                }
                Err(e) => {
                    error!("Media engine WebSocket error: {}", e);
                    break;
                }
                _ => {}
            }
        }

        inner.shutdown("connection lost");
        debug!("Media engine receiver task terminated");
    }

    async fn keepalive_task(inner: Arc<Inner>, interval: Duration) {
        let interval_ms = u64::try_from(interval.as_millis()).unwrap_or(u64::MAX);
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await;

        while !inner.closed.load(Ordering::SeqCst) {
            ticker.tick().await;
            if let Err(e) = inner.request("ping", params::ping(interval_ms)).await {
                warn!("Media engine keepalive failed: {}", e);
            }
        }
    }
}

#[async_trait]
impl MediaEngineClient for KurentoClient {
    async fn create_pipeline(&self) -> Result<Arc<dyn MediaPipeline>> {
        let id = self
            .inner
            .request_value("create", params::create_pipeline())
            .await?;
        debug!(pipeline = %id, "Created media pipeline");

        Ok(Arc::new(KurentoPipeline {
            id,
            inner: Arc::clone(&self.inner),
            endpoints: Mutex::new(Vec::new()),
        }))
    }

    fn is_connected(&self) -> bool {
        !self.inner.closed.load(Ordering::SeqCst)
    }

    async fn close(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let _ = self.inner.tx.send(Message::Close(None));
        self.inner.shutdown("client closed");

        // Leave the sender running so the close frame gets flushed
        let tasks: Vec<_> = self.inner.tasks.lock().drain(..).collect();
        for task in tasks.into_iter().skip(1) {
            task.abort();
        }
    }
}

struct KurentoPipeline {
    id: String,
    inner: Arc<Inner>,
    endpoints: Mutex<Vec<String>>,
}

#[async_trait]
impl MediaPipeline for KurentoPipeline {
    fn id(&self) -> &str {
        &self.id
    }

    async fn create_endpoint(&self) -> Result<Arc<dyn WebRtcEndpoint>> {
        let id = self
            .inner
            .request_value("create", params::create_endpoint(&self.id))
            .await?;
        debug!(pipeline = %self.id, endpoint = %id, "Created WebRTC endpoint");
        self.endpoints.lock().push(id.clone());

        Ok(Arc::new(KurentoEndpoint {
            id,
            inner: Arc::clone(&self.inner),
        }))
    }

    async fn release(&self) -> Result<()> {
        let endpoints: Vec<String> = self.endpoints.lock().drain(..).collect();
        {
            let mut listeners = self.inner.listeners.lock();
            for endpoint in &endpoints {
                listeners.remove(endpoint);
            }
        }
        self.inner.request("release", params::release(&self.id)).await?;
        debug!(pipeline = %self.id, "Released media pipeline");
        Ok(())
    }
}

struct KurentoEndpoint {
    id: String,
    inner: Arc<Inner>,
}

impl KurentoEndpoint {
    async fn invoke(&self, operation: &str, operation_params: Value) -> Result<Value> {
        self.inner
            .request("invoke", params::invoke(&self.id, operation, operation_params))
            .await
    }
}

#[async_trait]
impl WebRtcEndpoint for KurentoEndpoint {
    fn id(&self) -> &str {
        &self.id
    }

    async fn process_offer(&self, sdp_offer: &str) -> Result<String> {
        let result = self
            .invoke("processOffer", json!({ "offer": sdp_offer }))
            .await
            .map_err(Error::into_negotiation)?;
        result
            .get("value")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| Error::NegotiationFailed("processOffer returned no answer".to_string()))
    }

    async fn connect_to(&self, sink: &dyn WebRtcEndpoint) -> Result<()> {
        self.invoke("connect", json!({ "sink": sink.id() }))
            .await
            .map_err(Error::into_negotiation)?;
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()> {
        let encoded = super::protocol::KurentoIceCandidate::from(candidate);
        self.invoke("addIceCandidate", json!({ "candidate": encoded }))
            .await?;
        Ok(())
    }

    async fn gather_candidates(&self) -> Result<()> {
        self.invoke("gatherCandidates", json!({}))
            .await
            .map_err(Error::into_negotiation)?;
        Ok(())
    }

    async fn on_local_candidate(&self, callback: LocalCandidateCallback) -> Result<()> {
        self.inner.listeners.lock().insert(self.id.clone(), callback);
        self.inner
            .request("subscribe", params::subscribe(&self.id, ICE_CANDIDATE_FOUND))
            .await?;
        Ok(())
    }

    async fn release(&self) -> Result<()> {
        self.inner.listeners.lock().remove(&self.id);
        self.inner.request("release", params::release(&self.id)).await?;
        debug!(endpoint = %self.id, "Released WebRTC endpoint");
        Ok(())
    }
}
