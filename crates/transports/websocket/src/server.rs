//! WebSocket listener

use crate::handler::handle_connection;
use crate::Result;
use one2many_signaling::{ConnectionDispatcher, SignalingConfig};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

/// WebSocket signaling server bound to a local address
pub struct SignalingServer {
    listener: TcpListener,
    dispatcher: ConnectionDispatcher,
    ws_path: Arc<str>,
}

/// Handle to a running server
pub struct SignalingServerHandle {
    local_addr: SocketAddr,
    shutdown_tx: broadcast::Sender<()>,
    task: JoinHandle<()>,
}

impl SignalingServer {
    /// Bind the listener described by `config`
    pub async fn bind(config: &SignalingConfig, dispatcher: ConnectionDispatcher) -> Result<Self> {
        config.validate()?;
        let listener = TcpListener::bind(config.socket_addr()?).await?;

        Ok(Self {
            listener,
            dispatcher,
            ws_path: Arc::from(config.ws_path.as_str()),
        })
    }

    /// Address the listener is bound to
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Start accepting connections in the background
    pub fn start(self) -> Result<SignalingServerHandle> {
        let local_addr = self.local_addr()?;
        let (shutdown_tx, mut shutdown_rx) = broadcast::channel::<()>(1);

        info!("WebSocket signaling server listening on ws://{}{}", local_addr, self.ws_path);

        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown_rx.recv() => {
                        info!("WebSocket signaling server shutting down");
                        break;
                    }
                    accepted = self.listener.accept() => {
                        match accepted {
                            Ok((stream, addr)) => {
                                let dispatcher = self.dispatcher.clone();
                                let ws_path = Arc::clone(&self.ws_path);
                                tokio::spawn(async move {
                                    if let Err(e) = handle_connection(stream, addr, dispatcher, &ws_path).await {
                                        debug!(%addr, "Connection ended with error: {}", e);
                                    }
                                });
                            }
                            Err(e) => {
                                error!("Failed to accept connection: {}", e);
                            }
                        }
                    }
                }
            }
        });

        Ok(SignalingServerHandle {
            local_addr,
            shutdown_tx,
            task,
        })
    }
}

impl SignalingServerHandle {
    /// Address the server accepts connections on
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stop accepting new connections and wait for the accept loop to exit
    ///
    /// Connections already established keep running until their clients leave.
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(());
        if let Err(e) = self.task.await {
            error!("Accept loop terminated abnormally: {}", e);
        }
    }
}
