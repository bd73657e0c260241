//! one2many signaling server entry point
//!
//! Serves the broadcast signaling protocol over WebSocket and drives a
//! Kurento media server (or the in-process loopback engine).
//!
//! # Usage
//!
//! ```bash
//! # Against a local Kurento media server
//! cargo run -p one2many-server -- \
//!   --listen 0.0.0.0:8443 \
//!   --media-engine-uri ws://localhost:8888/kurento
//!
//! # Signaling only, no media server required
//! cargo run -p one2many-server -- --media-engine loopback
//! ```

use clap::Parser;
use one2many_signaling::media::kurento::KurentoConnector;
use one2many_signaling::media::loopback::LoopbackEngine;
use one2many_signaling::media::MediaEngineConnector;
use one2many_signaling::{ConnectionDispatcher, SignalingConfig, SignalingCoordinator};
use one2many_websocket::SignalingServer;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// one2many broadcast signaling server
///
/// One presenter publishes, any number of viewers subscribe.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Address the WebSocket listener binds to
    #[arg(long, default_value = "0.0.0.0:8443", env = "ONE2MANY_LISTEN")]
    listen: String,

    /// Request path clients upgrade on
    #[arg(long, default_value = "/one2many", env = "ONE2MANY_WS_PATH")]
    path: String,

    /// Media engine backend
    #[arg(long, default_value = "kurento", env = "ONE2MANY_MEDIA_ENGINE")]
    media_engine: MediaEngineKind,

    /// Kurento media server WebSocket URI
    #[arg(
        long,
        default_value = "ws://localhost:8888/kurento",
        env = "ONE2MANY_MEDIA_ENGINE_URI"
    )]
    media_engine_uri: String,

    /// Media engine request timeout in milliseconds
    #[arg(long, default_value_t = 15_000, env = "ONE2MANY_REQUEST_TIMEOUT_MS")]
    request_timeout_ms: u64,

    /// Media engine keepalive interval in seconds (0 disables)
    #[arg(long, default_value_t = 240, env = "ONE2MANY_KEEPALIVE_SECS")]
    keepalive_secs: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
enum MediaEngineKind {
    /// Kurento media server over JSON-RPC
    Kurento,
    /// In-process engine without a media plane
    Loopback,
}

impl Args {
    fn config(&self) -> SignalingConfig {
        SignalingConfig {
            listen_address: self.listen.clone(),
            ws_path: self.path.clone(),
            media_engine_uri: self.media_engine_uri.clone(),
            media_engine_request_timeout_ms: self.request_timeout_ms,
            media_engine_keepalive_secs: self.keepalive_secs,
        }
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let shutdown_flag = Arc::new(AtomicBool::new(false));
    let shutdown_flag_handler = Arc::clone(&shutdown_flag);

    ctrlc::set_handler(move || {
        eprintln!("\nCtrl+C received, shutting down...");
        if shutdown_flag_handler.swap(true, Ordering::SeqCst) {
            eprintln!("Shutdown already in progress, forcing exit");
            std::process::exit(0);
        }
    })?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(num_cpus::get())
        .thread_name("one2many-worker")
        .enable_all()
        .build()?;

    runtime.block_on(async_main(args, shutdown_flag))
}

async fn async_main(
    args: Args,
    shutdown_flag: Arc<AtomicBool>,
) -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();

    let config = args.config();
    config.validate()?;

    info!(
        version = env!("CARGO_PKG_VERSION"),
        listen = %config.listen_address,
        path = %config.ws_path,
        media_engine = ?args.media_engine,
        media_engine_uri = %config.media_engine_uri,
        "one2many signaling server starting"
    );

    let connector: Arc<dyn MediaEngineConnector> = match args.media_engine {
        MediaEngineKind::Kurento => Arc::new(KurentoConnector::new(
            config.request_timeout(),
            config.keepalive_interval(),
        )),
        MediaEngineKind::Loopback => Arc::new(LoopbackEngine::new()),
    };
    let coordinator = Arc::new(SignalingCoordinator::new(
        connector,
        config.media_engine_uri.clone(),
    ));

    let server = SignalingServer::bind(&config, ConnectionDispatcher::new(coordinator)).await?;
    let handle = server.start()?;
    info!("Server running on {}. Press Ctrl+C to shutdown.", handle.local_addr());

    while !shutdown_flag.load(Ordering::SeqCst) {
        tokio::time::sleep(tokio::time::Duration::from_millis(100)).await;
    }

    info!("Shutdown signal received, stopping listener...");
    handle.shutdown().await;
    info!("Signaling server shut down");

    Ok(())
}

fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}
