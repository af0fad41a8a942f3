//! The registry consumer task.

use super::messages::{BroadcastEvent, LoginEvent, PeerMutation, PeerUpdate};
use super::{RegistrySettings, RegistryState};
use crate::clock;
use crate::errors::RegistryError;
use crate::observability::metrics;
use crate::presence::{PresenceRecord, PresenceStore};
use crate::protocol::{cmd, CreatePeerConnection, MemberNotice, OutboundFrame, PeerDescriptor};
use crate::session::{Connection, SendError};
use common::types::{RoomId, UserId};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

const CONNECT_GREETING: &str = "user has joined";
const EXIT_GREETING: &str = "user has left";

pub(super) struct Queues {
    pub register: mpsc::Receiver<Arc<Connection>>,
    pub login: mpsc::Receiver<LoginEvent>,
    pub unregister: mpsc::Receiver<Arc<Connection>>,
    pub broadcast: mpsc::Receiver<BroadcastEvent>,
    pub peer: mpsc::Receiver<PeerUpdate>,
}

impl Queues {
    fn pending(&self) -> usize {
        self.register.len()
            + self.login.len()
            + self.unregister.len()
            + self.broadcast.len()
            + self.peer.len()
    }
}

pub(super) struct RegistryActor {
    state: Arc<RegistryState>,
    queues: Queues,
    presence: Arc<dyn PresenceStore>,
    settings: RegistrySettings,
    cancel_token: CancellationToken,
    events_processed: u64,
}

impl RegistryActor {
    pub(super) fn new(
        state: Arc<RegistryState>,
        queues: Queues,
        presence: Arc<dyn PresenceStore>,
        settings: RegistrySettings,
        cancel_token: CancellationToken,
    ) -> Self {
        Self {
            state,
            queues,
            presence,
            settings,
            cancel_token,
            events_processed: 0,
        }
    }

    /// Consume the queues until cancelled.
    ///
    /// Queues are polled in lifecycle order (register, login, unregister,
    /// broadcast, peer update) so an event is never applied before an
    /// earlier-enqueued event it depends on.
    #[instrument(skip_all, name = "sig.registry", fields(instance = %self.settings.instance))]
    pub(super) async fn run(mut self) {
        info!(target: "sig.registry", "Registry started");

        loop {
            tokio::select! {
                biased;

                () = self.cancel_token.cancelled() => {
                    info!(target: "sig.registry", "Registry received cancellation signal");
                    break;
                }

                Some(conn) = self.queues.register.recv() => self.register(conn).await,

                Some(event) = self.queues.login.recv() => {
                    let result = self.complete_login(&event.conn, event.peer).await;
                    let _ = event.respond_to.send(result);
                }

                Some(conn) = self.queues.unregister.recv() => self.unregister(conn).await,

                Some(event) = self.queues.broadcast.recv() => self.broadcast_local(&event).await,

                Some(update) = self.queues.peer.recv() => {
                    let result = self.update_peer(update.room, update.user, update.mutation).await;
                    if result.is_ok() {
                        if let Some(announce) = &update.announce {
                            self.broadcast_local(announce).await;
                        }
                    }
                    let _ = update.respond_to.send(result);
                }

                else => {
                    info!(target: "sig.registry", "Registry queues closed, exiting");
                    break;
                }
            }

            self.events_processed += 1;
            metrics::set_registry_queue_depth(self.queues.pending());
        }

        info!(
            target: "sig.registry",
            events_processed = self.events_processed,
            "Registry stopped"
        );
    }

    async fn register(&self, conn: Arc<Connection>) {
        debug!(
            target: "sig.registry",
            connection_id = conn.id(),
            client_addr = %conn.client_addr(),
            "Connection registered"
        );
        self.state.connections.write().await.insert(conn.id(), conn);
        self.update_gauges().await;
    }

    async fn complete_login(
        &self,
        conn: &Arc<Connection>,
        mut peer: PeerDescriptor,
    ) -> Result<(), RegistryError> {
        if !self.state.contains_connection(conn.id()).await {
            debug!(
                target: "sig.registry",
                connection_id = conn.id(),
                "Login completion for unregistered connection"
            );
            return Err(RegistryError::UnknownConnection);
        }

        let room = conn.room_id();
        let user = conn.user_id();
        let key = conn.presence_key();

        let existing = self.state.users.read().await.get(&key).cloned();
        if let Some(existing) = existing {
            info!(
                target: "sig.registry",
                room_id = %room,
                user_id = %user,
                connection_id = conn.id(),
                existing_connection_id = existing.id(),
                "Duplicate login rejected"
            );
            // The rejected login already wrote its presence record
            self.restore_presence(&existing).await;
            return Err(RegistryError::AlreadyLoggedIn);
        }

        let room_peers: Vec<PeerDescriptor> = {
            let mut peers = self.state.peers.write().await;
            let room_peers = peers.entry(room).or_default();
            // A newcomer joins the room in its current lock state
            if let Some(existing) = room_peers.values().next() {
                peer.room_lock = existing.room_lock;
                peer.room_password.clone_from(&existing.room_password);
            }
            room_peers.insert(user, peer);
            room_peers.values().cloned().collect()
        };

        let others = self.state.user_connections(Some(room)).await;

        let joined = CreatePeerConnection {
            user_id: user,
            peers: &room_peers,
            should_create_offer: false,
            ice_servers: &self.settings.ice_servers,
        };
        if let Some(frame) = encode_push(cmd::CREATE_PEER_CONNECTION, &joined) {
            for other in &others {
                deliver(other, frame.clone());
            }
        }

        for other in &others {
            let notice = CreatePeerConnection {
                user_id: other.user_id(),
                peers: &room_peers,
                should_create_offer: true,
                ice_servers: &self.settings.ice_servers,
            };
            if let Some(frame) = encode_push(cmd::CREATE_PEER_CONNECTION, &notice) {
                deliver(conn, frame);
            }
        }

        self.state
            .users
            .write()
            .await
            .insert(key, Arc::clone(conn));

        let greeting = self.member_notice(room, user, cmd::CONNECT, CONNECT_GREETING).await;
        if let Some(event) = greeting {
            self.broadcast_local(&event).await;
        }

        info!(
            target: "sig.registry",
            room_id = %room,
            user_id = %user,
            connection_id = conn.id(),
            room_size = room_peers.len(),
            "User logged in"
        );
        self.update_gauges().await;
        Ok(())
    }

    async fn unregister(&self, conn: Arc<Connection>) {
        self.state.connections.write().await.remove(&conn.id());

        if !conn.is_logged_in() {
            debug!(
                target: "sig.registry",
                connection_id = conn.id(),
                "Anonymous connection unregistered"
            );
            self.update_gauges().await;
            return;
        }

        let room = conn.room_id();
        let user = conn.user_id();
        let key = conn.presence_key();

        let removed = {
            let mut users = self.state.users.write().await;
            match users.get(&key) {
                Some(current) if current.id() == conn.id() => {
                    users.remove(&key);
                    true
                }
                _ => false,
            }
        };

        if !removed {
            debug!(
                target: "sig.registry",
                room_id = %room,
                user_id = %user,
                connection_id = conn.id(),
                "Stale unregistration, newer connection keeps the key"
            );
            self.update_gauges().await;
            return;
        }

        let user_name = {
            let mut peers = self.state.peers.write().await;
            let name = peers
                .get_mut(&room)
                .and_then(|room_peers| room_peers.remove(&user))
                .map(|p| p.user_name);
            if peers.get(&room).is_some_and(|room_peers| room_peers.is_empty()) {
                peers.remove(&room);
            }
            name.unwrap_or_default()
        };

        self.mark_logged_off(&conn).await;

        let notice = MemberNotice {
            room_id: room,
            user_id: user,
            user_name,
            message: EXIT_GREETING.to_string(),
        };
        if let Some(frame) = encode_push(cmd::EXIT, &notice) {
            self.broadcast_local(&BroadcastEvent {
                frame,
                room: Some(room),
                exclude: Some(user),
            })
            .await;
        }

        info!(
            target: "sig.registry",
            room_id = %room,
            user_id = %user,
            connection_id = conn.id(),
            "User logged out"
        );
        self.update_gauges().await;
    }

    /// Rewrite the presence record of `conn`, the indexed owner of its key.
    async fn restore_presence(&self, conn: &Connection) {
        let key = conn.presence_key();
        let user_name = self
            .state
            .peer(conn.room_id(), conn.user_id())
            .await
            .map(|p| p.user_name)
            .unwrap_or_default();

        let mut record = PresenceRecord::login(
            self.settings.instance.clone(),
            conn.room_id(),
            conn.user_id(),
            user_name,
            conn.client_addr().to_string(),
            conn.login_time(),
        );
        record.heartbeat(conn.heartbeat_time());

        if let Err(e) = self.presence.set_user_online(&key, &record).await {
            warn!(target: "sig.registry", key = %key, error = %e, "Failed to restore presence record");
        }
    }

    /// Mark the presence record logged off, unless a newer login (here or
    /// on another instance) owns it.
    async fn mark_logged_off(&self, conn: &Connection) {
        let key = conn.presence_key();
        let mut record = match self.presence.get_user_online(&key).await {
            Ok(Some(record)) => record,
            Ok(None) => {
                debug!(target: "sig.registry", key = %key, "No presence record to log off");
                return;
            }
            Err(e) => {
                warn!(target: "sig.registry", key = %key, error = %e, "Failed to read presence record");
                return;
            }
        };

        if !record.is_hosted_by(&self.settings.instance) || record.login_time != conn.login_time() {
            debug!(
                target: "sig.registry",
                key = %key,
                "Presence record belongs to a newer login"
            );
            return;
        }

        record.log_out(clock::unix_now());
        if let Err(e) = self.presence.set_user_online(&key, &record).await {
            warn!(target: "sig.registry", key = %key, error = %e, "Failed to mark presence logged off");
        }
    }

    async fn broadcast_local(&self, event: &BroadcastEvent) {
        let targets = self.state.user_connections(event.room).await;
        for target in targets {
            if event.exclude == Some(target.user_id()) {
                continue;
            }
            deliver(&target, event.frame.clone());
        }
    }

    async fn update_peer(
        &self,
        room: RoomId,
        user: UserId,
        mutation: PeerMutation,
    ) -> Result<(), RegistryError> {
        let mut peers = self.state.peers.write().await;
        let room_peers = peers.get_mut(&room).ok_or(RegistryError::PeerNotFound)?;
        if !room_peers.contains_key(&user) {
            return Err(RegistryError::PeerNotFound);
        }

        match mutation {
            PeerMutation::LockRoom { password } => {
                for peer in room_peers.values_mut() {
                    peer.room_lock = true;
                    peer.room_password.clone_from(&password);
                }
            }
            PeerMutation::UnlockRoom => {
                for peer in room_peers.values_mut() {
                    peer.room_lock = false;
                    peer.room_password.clear();
                }
            }
            PeerMutation::LockUser => {
                room_peers.get_mut(&user).ok_or(RegistryError::PeerNotFound)?.user_lock = true;
            }
            PeerMutation::UnlockUser => {
                room_peers.get_mut(&user).ok_or(RegistryError::PeerNotFound)?.user_lock = false;
            }
            PeerMutation::SetStatus { flag, value } => {
                room_peers
                    .get_mut(&user)
                    .ok_or(RegistryError::PeerNotFound)?
                    .set_status(flag, value);
            }
        }

        debug!(target: "sig.registry", room_id = %room, user_id = %user, "Peer updated");
        Ok(())
    }

    async fn member_notice(
        &self,
        room: RoomId,
        user: UserId,
        command: &str,
        message: &str,
    ) -> Option<BroadcastEvent> {
        let user_name = self
            .state
            .peer(room, user)
            .await
            .map(|p| p.user_name)
            .unwrap_or_default();
        let notice = MemberNotice {
            room_id: room,
            user_id: user,
            user_name,
            message: message.to_string(),
        };
        encode_push(command, &notice).map(|frame| BroadcastEvent {
            frame,
            room: Some(room),
            exclude: Some(user),
        })
    }

    async fn update_gauges(&self) {
        let stats = self.state.stats().await;
        metrics::set_connections_active(stats.connections);
        metrics::set_users_logged_in(stats.users);
    }
}

fn encode_push<T: serde::Serialize + ?Sized>(command: &str, data: &T) -> Option<String> {
    OutboundFrame::push(command, data)
        .and_then(|frame| frame.to_text())
        .map_err(|e| warn!(target: "sig.registry", cmd = command, error = %e, "Failed to encode push"))
        .ok()
}

/// Non-blocking delivery. A full queue sacrifices the slow consumer.
pub(crate) fn deliver(conn: &Connection, frame: String) -> bool {
    match conn.send_raw(frame) {
        Ok(()) => true,
        Err(SendError::Full) => {
            warn!(
                target: "sig.registry",
                connection_id = conn.id(),
                room_id = %conn.room_id(),
                user_id = %conn.user_id(),
                "Outbound queue full, closing slow consumer"
            );
            conn.close_outbound();
            metrics::record_broadcast_drop("full");
            false
        }
        Err(SendError::Closed) => {
            metrics::record_broadcast_drop("closed");
            false
        }
        Err(SendError::Encode(_)) => {
            metrics::record_broadcast_drop("encode");
            false
        }
    }
}
