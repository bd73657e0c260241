//! WebSocket transport for one2many broadcast signaling
//!
//! Browsers connect to `ws://host:port/<path>?sessionId=<room>` and exchange
//! JSON messages with the [`ConnectionDispatcher`]. Each accepted socket gets
//! a fresh connection ID; closing the socket or a transport error tears down
//! everything the connection owned.
//!
//! [`ConnectionDispatcher`]: one2many_signaling::ConnectionDispatcher

mod error;
mod handler;
mod server;

pub use error::{Error, Result};
pub use handler::{handle_connection, SESSION_ID_PARAM};
pub use server::{SignalingServer, SignalingServerHandle};
