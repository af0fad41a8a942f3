//! Connection registry: the authoritative in-process view of connections,
//! logged-in users and room peers.
//!
//! # Concurrency
//!
//! All membership mutations (register, login completion, unregister,
//! broadcast, peer updates) are applied by one [`actor::RegistryActor`]
//! task reading from bounded queues, so compound side effects such as
//! "insert peer, notify the room, index the user" never interleave with
//! another mutation. Readers from any task take one of three independent
//! read-write locks:
//!
//! | Index | Key | Value |
//! |-------|-----|-------|
//! | connections | `ConnectionId` | `Arc<Connection>` |
//! | users | `PresenceKey` (`room_user`) | `Arc<Connection>` |
//! | peers | `RoomId` → `UserId` | `PeerDescriptor` |
//!
//! A reader may see a slightly stale snapshot, never a half-applied one
//! for a single index.

mod actor;
pub mod messages;

pub(crate) use actor::deliver;
pub use messages::{BroadcastEvent, LoginEvent, PeerMutation, PeerUpdate};

use crate::config::IceServer;
use crate::errors::RegistryError;
use crate::presence::PresenceStore;
use crate::protocol::PeerDescriptor;
use crate::session::{Connection, ConnectionId};
use actor::RegistryActor;
use common::types::{InstanceAddr, PresenceKey, RoomId, UserId};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, RwLock};
use tokio_util::sync::CancellationToken;

/// Settings the registry needs from configuration.
#[derive(Debug, Clone)]
pub struct RegistrySettings {
    pub queue_capacity: usize,
    pub instance: InstanceAddr,
    pub ice_servers: Vec<IceServer>,
}

/// Counts reported by `/stats`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistryStats {
    pub connections: usize,
    pub users: usize,
    pub rooms: usize,
}

/// The three indices.
#[derive(Debug, Default)]
pub struct RegistryState {
    connections: RwLock<HashMap<ConnectionId, Arc<Connection>>>,
    users: RwLock<HashMap<PresenceKey, Arc<Connection>>>,
    peers: RwLock<HashMap<RoomId, BTreeMap<UserId, PeerDescriptor>>>,
}

impl RegistryState {
    pub async fn lookup_user_connection(&self, room: RoomId, user: UserId) -> Option<Arc<Connection>> {
        self.users
            .read()
            .await
            .get(&PresenceKey::new(room, user))
            .cloned()
    }

    /// Logged-in users of a room, ascending. `RoomId::ALL` lists every room.
    pub async fn list_room_users(&self, room: RoomId) -> Vec<UserId> {
        let users = self.users.read().await;
        let mut ids: Vec<UserId> = users
            .values()
            .filter(|c| room == RoomId::ALL || c.room_id() == room)
            .map(|c| c.user_id())
            .collect();
        ids.sort_unstable();
        ids
    }

    pub async fn list_room_peers(&self, room: RoomId) -> Vec<PeerDescriptor> {
        self.peers
            .read()
            .await
            .get(&room)
            .map(|peers| peers.values().cloned().collect())
            .unwrap_or_default()
    }

    pub async fn peer(&self, room: RoomId, user: UserId) -> Option<PeerDescriptor> {
        self.peers
            .read()
            .await
            .get(&room)
            .and_then(|peers| peers.get(&user))
            .cloned()
    }

    /// Every registered connection, logged in or not.
    pub async fn connections(&self) -> Vec<Arc<Connection>> {
        self.connections.read().await.values().cloned().collect()
    }

    pub async fn contains_connection(&self, id: ConnectionId) -> bool {
        self.connections.read().await.contains_key(&id)
    }

    /// Logged-in connections, optionally restricted to one room.
    pub async fn user_connections(&self, room: Option<RoomId>) -> Vec<Arc<Connection>> {
        self.users
            .read()
            .await
            .values()
            .filter(|c| room.map_or(true, |r| c.room_id() == r))
            .cloned()
            .collect()
    }

    pub async fn stats(&self) -> RegistryStats {
        RegistryStats {
            connections: self.connections.read().await.len(),
            users: self.users.read().await.len(),
            rooms: self.peers.read().await.len(),
        }
    }
}

/// Handle to the registry.
///
/// Mutations are queued to the registry actor; reads go straight to the
/// shared indices.
#[derive(Clone)]
pub struct RegistryHandle {
    register_tx: mpsc::Sender<Arc<Connection>>,
    login_tx: mpsc::Sender<LoginEvent>,
    unregister_tx: mpsc::Sender<Arc<Connection>>,
    broadcast_tx: mpsc::Sender<BroadcastEvent>,
    peer_tx: mpsc::Sender<PeerUpdate>,
    state: Arc<RegistryState>,
    cancel_token: CancellationToken,
}

impl RegistryHandle {
    /// Create the registry and spawn its actor.
    #[must_use]
    pub fn new(
        settings: RegistrySettings,
        presence: Arc<dyn PresenceStore>,
        cancel_token: CancellationToken,
    ) -> Self {
        let capacity = settings.queue_capacity;
        let (register_tx, register_rx) = mpsc::channel(capacity);
        let (login_tx, login_rx) = mpsc::channel(capacity);
        let (unregister_tx, unregister_rx) = mpsc::channel(capacity);
        let (broadcast_tx, broadcast_rx) = mpsc::channel(capacity);
        let (peer_tx, peer_rx) = mpsc::channel(capacity);
        let state = Arc::new(RegistryState::default());

        let actor = RegistryActor::new(
            Arc::clone(&state),
            actor::Queues {
                register: register_rx,
                login: login_rx,
                unregister: unregister_rx,
                broadcast: broadcast_rx,
                peer: peer_rx,
            },
            presence,
            settings,
            cancel_token.clone(),
        );
        tokio::spawn(actor.run());

        Self {
            register_tx,
            login_tx,
            unregister_tx,
            broadcast_tx,
            peer_tx,
            state,
            cancel_token,
        }
    }

    pub async fn register(&self, conn: Arc<Connection>) -> Result<(), RegistryError> {
        self.register_tx
            .send(conn)
            .await
            .map_err(|e| RegistryError::Unavailable(format!("channel send failed: {e}")))
    }

    /// Submit a login completion and wait for the registry's verdict.
    pub async fn complete_login(
        &self,
        conn: Arc<Connection>,
        peer: PeerDescriptor,
    ) -> Result<(), RegistryError> {
        let (tx, rx) = oneshot::channel();
        self.login_tx
            .send(LoginEvent {
                conn,
                peer,
                respond_to: tx,
            })
            .await
            .map_err(|e| RegistryError::Unavailable(format!("channel send failed: {e}")))?;

        rx.await
            .map_err(|e| RegistryError::Unavailable(format!("response receive failed: {e}")))?
    }

    pub async fn unregister(&self, conn: Arc<Connection>) -> Result<(), RegistryError> {
        self.unregister_tx
            .send(conn)
            .await
            .map_err(|e| RegistryError::Unavailable(format!("channel send failed: {e}")))
    }

    pub async fn broadcast(&self, event: BroadcastEvent) -> Result<(), RegistryError> {
        self.broadcast_tx
            .send(event)
            .await
            .map_err(|e| RegistryError::Unavailable(format!("channel send failed: {e}")))
    }

    /// Apply a peer mutation, then broadcast `announce` if given.
    pub async fn update_peer(
        &self,
        room: RoomId,
        user: UserId,
        mutation: PeerMutation,
        announce: Option<BroadcastEvent>,
    ) -> Result<(), RegistryError> {
        let (tx, rx) = oneshot::channel();
        self.peer_tx
            .send(PeerUpdate {
                room,
                user,
                mutation,
                announce,
                respond_to: tx,
            })
            .await
            .map_err(|e| RegistryError::Unavailable(format!("channel send failed: {e}")))?;

        rx.await
            .map_err(|e| RegistryError::Unavailable(format!("response receive failed: {e}")))?
    }

    pub async fn lookup_user_connection(&self, room: RoomId, user: UserId) -> Option<Arc<Connection>> {
        self.state.lookup_user_connection(room, user).await
    }

    pub async fn list_room_users(&self, room: RoomId) -> Vec<UserId> {
        self.state.list_room_users(room).await
    }

    pub async fn list_room_peers(&self, room: RoomId) -> Vec<PeerDescriptor> {
        self.state.list_room_peers(room).await
    }

    pub async fn peer(&self, room: RoomId, user: UserId) -> Option<PeerDescriptor> {
        self.state.peer(room, user).await
    }

    pub async fn connections(&self) -> Vec<Arc<Connection>> {
        self.state.connections().await
    }

    pub async fn contains_connection(&self, id: ConnectionId) -> bool {
        self.state.contains_connection(id).await
    }

    pub async fn stats(&self) -> RegistryStats {
        self.state.stats().await
    }

    /// True until the registry actor is cancelled.
    #[must_use]
    pub fn is_running(&self) -> bool {
        !self.cancel_token.is_cancelled()
    }
}
