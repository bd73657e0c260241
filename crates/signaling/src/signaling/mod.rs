//! Client signaling: wire protocol and per-connection message routing

pub mod dispatcher;
pub mod protocol;

pub use dispatcher::{ConnectionContext, ConnectionDispatcher};
pub use protocol::{CandidateRole, ClientMessage, Response, ResponseStatus, ServerMessage};
