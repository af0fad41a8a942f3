//! Events consumed by the registry actor.

use crate::errors::RegistryError;
use crate::protocol::{PeerDescriptor, StatusFlag};
use crate::session::Connection;
use common::types::{RoomId, UserId};
use std::sync::Arc;
use tokio::sync::oneshot;

/// Login completion for a connection that has passed the login handler.
#[derive(Debug)]
pub struct LoginEvent {
    pub conn: Arc<Connection>,
    pub peer: PeerDescriptor,
    pub respond_to: oneshot::Sender<Result<(), RegistryError>>,
}

/// Local broadcast of an already-encoded frame.
#[derive(Debug, Clone)]
pub struct BroadcastEvent {
    pub frame: String,
    /// Restrict to one room; `None` reaches every logged-in connection.
    pub room: Option<RoomId>,
    /// User skipped by the broadcast, normally the sender.
    pub exclude: Option<UserId>,
}

/// Change to a peer descriptor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerMutation {
    /// Room-wide: applied to every descriptor of the room.
    LockRoom { password: String },
    /// Room-wide.
    UnlockRoom,
    LockUser,
    UnlockUser,
    SetStatus { flag: StatusFlag, value: bool },
}

/// Peer descriptor update, optionally announced to the room once applied.
#[derive(Debug)]
pub struct PeerUpdate {
    pub room: RoomId,
    pub user: UserId,
    pub mutation: PeerMutation,
    pub announce: Option<BroadcastEvent>,
    pub respond_to: oneshot::Sender<Result<(), RegistryError>>,
}
