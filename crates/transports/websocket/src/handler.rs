//! Per-connection WebSocket handler
//!
//! Performs the upgrade, assigns session and connection identity, then pumps
//! text frames into the dispatcher and queued server messages back out.

use crate::Result;
use futures_util::{SinkExt, StreamExt};
use one2many_signaling::session::{PeerHandle, SessionId};
use one2many_signaling::signaling::{ConnectionContext, ConnectionDispatcher, ServerMessage};
use std::net::SocketAddr;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::accept_hdr_async;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::{StatusCode, Uri};
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Query parameter selecting the session a connection joins
pub const SESSION_ID_PARAM: &str = "sessionId";

/// Session requested in the upgrade URI, if any
fn requested_session(uri: &Uri) -> Option<SessionId> {
    let query = uri.query()?;
    url::form_urlencoded::parse(query.as_bytes())
        .find(|(key, _)| key == SESSION_ID_PARAM)
        .map(|(_, value)| value.into_owned())
        .filter(|value| !value.is_empty())
}

fn not_found() -> ErrorResponse {
    let mut response = ErrorResponse::new(Some("Not Found".to_string()));
    *response.status_mut() = StatusCode::NOT_FOUND;
    response
}

/// Serve one client socket until it closes
///
/// Upgrades on `ws_path` only; other paths are refused with 404. The session
/// is taken from the `sessionId` query parameter or generated when absent.
pub async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    dispatcher: ConnectionDispatcher,
    ws_path: &str,
) -> Result<()> {
    let mut requested = None;
    let ws_stream = accept_hdr_async(stream, |request: &Request, response: Response| {
        if request.uri().path() != ws_path {
            warn!(%addr, path = request.uri().path(), "Refusing upgrade on unknown path");
            return Err(not_found());
        }
        requested = requested_session(request.uri());
        Ok(response)
    })
    .await?;

    let session_id = requested.unwrap_or_else(|| Uuid::new_v4().to_string());
    let connection_id = Uuid::new_v4().to_string();
    info!(%addr, session_id = %session_id, connection_id = %connection_id, "Client connected");

    let (mut ws_tx, mut ws_rx) = ws_stream.split();

    // Outbound queue for this connection, shared with the coordinator
    let (tx, mut rx) = mpsc::unbounded_channel::<ServerMessage>();
    let ctx = ConnectionContext::new(session_id, PeerHandle::new(connection_id, tx));

    let forward_task = tokio::spawn(async move {
        while let Some(message) = rx.recv().await {
            let text = match message.to_json() {
                Ok(text) => text,
                Err(e) => {
                    error!("Failed to encode server message: {}", e);
                    continue;
                }
            };
            if let Err(e) = ws_tx.send(Message::Text(text)).await {
                debug!("Failed to send WebSocket message: {}", e);
                break;
            }
        }
    });

    while let Some(msg) = ws_rx.next().await {
        match msg {
            Ok(Message::Text(text)) => {
                // Negotiations continue on their own task
                let _ = dispatcher.dispatch(&ctx, &text).await;
            }
            Ok(Message::Close(_)) => {
                info!(connection_id = ctx.connection_id(), "WebSocket connection closed by client");
                break;
            }
            Ok(Message::Binary(_)) => {
                debug!(connection_id = ctx.connection_id(), "Ignoring binary frame");
            }
            Err(e) => {
                warn!(connection_id = ctx.connection_id(), "WebSocket error: {}", e);
                break;
            }
            _ => {}
        }
    }

    dispatcher.disconnect(&ctx).await;
    forward_task.abort();

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_from_query() {
        let uri: Uri = "/one2many?sessionId=room%201&x=y".parse().unwrap();
        assert_eq!(requested_session(&uri).as_deref(), Some("room 1"));
    }

    #[test]
    fn test_missing_or_empty_session() {
        let uri: Uri = "/one2many".parse().unwrap();
        assert!(requested_session(&uri).is_none());

        let uri: Uri = "/one2many?sessionId=".parse().unwrap();
        assert!(requested_session(&uri).is_none());
    }

    #[test]
    fn test_not_found_status() {
        assert_eq!(not_found().status(), StatusCode::NOT_FOUND);
    }
}
