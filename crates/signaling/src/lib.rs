//! Signaling for one-presenter/many-viewers WebRTC broadcasts
//!
//! A single presenter publishes media into a media engine pipeline and any
//! number of viewers subscribe to it. This crate decides who may present,
//! attaches viewers to the live presenter, buffers ICE candidates that arrive
//! before their endpoint exists, and cascades teardown when any party leaves.
//!
//! # Components
//!
//! - [`session`]: candidate queue and session registry
//! - [`coordinator`]: the per-session state machine
//! - [`signaling`]: JSON wire protocol and the connection dispatcher
//! - [`media`]: media engine traits, the Kurento client and a loopback engine
//!
//! # Usage
//!
//! ```
//! use one2many_signaling::coordinator::SignalingCoordinator;
//! use one2many_signaling::media::loopback::LoopbackEngine;
//! use one2many_signaling::session::PeerHandle;
//! use std::sync::Arc;
//!
//! # tokio_test::block_on(async {
//! let coordinator = SignalingCoordinator::new(Arc::new(LoopbackEngine::new()), "loopback://");
//! let (tx, _rx) = tokio::sync::mpsc::unbounded_channel();
//! let presenter = PeerHandle::new("conn-1".to_string(), tx);
//!
//! let answer = coordinator
//!     .handle_presenter_request("room-1", presenter, "v=0 ...")
//!     .await
//!     .unwrap();
//! assert!(answer.starts_with("v=0"));
//! # });
//! ```

pub mod config;
pub mod coordinator;
pub mod error;
pub mod media;
pub mod session;
pub mod signaling;

pub use config::SignalingConfig;
pub use coordinator::SignalingCoordinator;
pub use error::{Error, Result};
pub use signaling::{ConnectionContext, ConnectionDispatcher};
