//! Kurento media server backend
//!
//! Speaks JSON-RPC 2.0 over WebSocket: `create`, `invoke`, `subscribe`,
//! `release` and `ping` requests, with `onEvent` notifications carrying
//! locally gathered ICE candidates.

mod client;
pub mod protocol;

pub use client::{KurentoClient, KurentoConnector};
