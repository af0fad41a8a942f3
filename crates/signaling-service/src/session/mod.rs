//! Client sessions.
//!
//! Each transport connection is served by two independently scheduled
//! tasks:
//!
//! ```text
//!   transport ──recv──▶ inbound task ──dispatch (inline)──▶ Router
//!                           │ on exit: close outbound queue
//!                           ▼
//!   outbound queue ──▶ outbound task ──send──▶ transport
//!                           │ on queue closed: close transport,
//!                           ▼                  unregister
//!                       Registry
//! ```
//!
//! The session code is generic over any `Sink<String>` / `Stream` pair so
//! the WebSocket adapter and tests share one implementation.

mod connection;
mod tasks;

pub use connection::{Connection, ConnectionId, SendError};
pub use tasks::spawn_session;

use thiserror::Error;

/// Transport-level receive failure. Ends the inbound task.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("peer closed the transport")]
    ClosedByPeer,
    #[error("transport failure: {0}")]
    Io(String),
}
