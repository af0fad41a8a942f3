//! Cross-instance relay.
//!
//! Reaches users wherever they are connected. Local targets are served from
//! the registry; remote targets are located through the presence cache and
//! reached with one RPC on the hosting instance's relay server.
//!
//! ```text
//!   send_to_user ──local?──▶ registry connection
//!        │ no
//!        ▼
//!   presence record ──offline/absent──▶ UserOffline (no RPC)
//!        │ online elsewhere
//!        ▼
//!   RelayClient::send_msg(instance)
//! ```
//!
//! Room fan-out always delivers locally in-process, then issues one
//! independent RPC per remote live instance. Remote failures are logged and
//! never fail the fan-out.

mod client;
mod service;

pub use client::GrpcRelayClient;
pub use service::RelayService;

use crate::clock;
use crate::errors::RelayError;
use crate::observability::metrics;
use crate::presence::PresenceStore;
use crate::protocol::{new_seq, OutboundFrame};
use crate::registry::{self, BroadcastEvent, RegistryHandle};
use async_trait::async_trait;
use common::types::{InstanceAddr, PresenceKey, RoomId, UserId};
use futures_util::future::join_all;
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, instrument, warn};

/// Payload encodings carried in the relay `type` field.
pub const KIND_JSON: &str = "json";
pub const KIND_TEXT: &str = "text";

/// A push addressed to users, in transit between instances.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayMessage {
    pub seq: String,
    pub cmd: String,
    pub kind: String,
    /// Encoded payload: JSON for `json`, free text for `text`.
    pub msg: String,
}

impl RelayMessage {
    /// Message whose payload is `data` encoded as JSON.
    pub fn json<T: Serialize + ?Sized>(cmd: &str, data: &T) -> Result<Self, RelayError> {
        let msg = serde_json::to_string(data).map_err(|e| RelayError::Encode(e.to_string()))?;
        Ok(Self {
            seq: new_seq(),
            cmd: cmd.to_string(),
            kind: KIND_JSON.to_string(),
            msg,
        })
    }

    #[must_use]
    pub fn text(cmd: &str, msg: impl Into<String>) -> Self {
        Self {
            seq: new_seq(),
            cmd: cmd.to_string(),
            kind: KIND_TEXT.to_string(),
            msg: msg.into(),
        }
    }

    /// Decode into the frame delivered to clients.
    ///
    /// A `text` payload that is not JSON is delivered as a JSON string.
    pub fn to_frame(&self) -> Result<OutboundFrame, RelayError> {
        let data = match serde_json::from_str::<Value>(&self.msg) {
            Ok(value) => value,
            Err(_) if self.kind == KIND_TEXT => Value::String(self.msg.clone()),
            Err(e) => return Err(RelayError::Encode(format!("invalid relay payload: {e}"))),
        };
        Ok(OutboundFrame::push_value(self.seq.clone(), &self.cmd, data))
    }

    pub fn to_text(&self) -> Result<String, RelayError> {
        self.to_frame()?
            .to_text()
            .map_err(|e| RelayError::Encode(e.to_string()))
    }
}

/// Client side of the relay RPC surface.
#[async_trait]
pub trait RelayClient: Send + Sync {
    /// Ask `instance` whether it hosts (room, user).
    ///
    /// Not used for routing: [`Relay::is_user_online_anywhere`] answers from
    /// the presence cache without an RPC. This is the client half of
    /// `QueryUsersOnline` for callers that need the host's own answer.
    async fn query_users_online(
        &self,
        instance: &InstanceAddr,
        room: RoomId,
        user: UserId,
    ) -> Result<bool, RelayError>;

    /// Deliver to one user on `instance`. Returns the callee's message id.
    async fn send_msg(
        &self,
        instance: &InstanceAddr,
        room: RoomId,
        user: UserId,
        message: &RelayMessage,
    ) -> Result<String, RelayError>;

    /// Deliver to a room on `instance`, skipping `exclude` (zero skips
    /// nobody). `RoomId::ALL` addresses every room.
    async fn send_msg_all(
        &self,
        instance: &InstanceAddr,
        room: RoomId,
        exclude: UserId,
        message: &RelayMessage,
    ) -> Result<String, RelayError>;

    async fn get_user_list(&self, instance: &InstanceAddr, room: RoomId) -> Result<Vec<UserId>, RelayError>;
}

/// Relay operations available to handlers and the relay server.
pub struct Relay {
    registry: RegistryHandle,
    presence: Arc<dyn PresenceStore>,
    client: Arc<dyn RelayClient>,
    instance: InstanceAddr,
    room_ids: Vec<RoomId>,
    online_window: u64,
}

impl Relay {
    #[must_use]
    pub fn new(
        registry: RegistryHandle,
        presence: Arc<dyn PresenceStore>,
        client: Arc<dyn RelayClient>,
        instance: InstanceAddr,
        room_ids: Vec<RoomId>,
        online_window: u64,
    ) -> Self {
        Self {
            registry,
            presence,
            client,
            instance,
            room_ids,
            online_window,
        }
    }

    #[must_use]
    pub fn instance(&self) -> &InstanceAddr {
        &self.instance
    }

    /// Online check against the presence cache. `RoomId::ALL` checks every
    /// configured room and stops at the first match.
    pub async fn is_user_online_anywhere(&self, room: RoomId, user: UserId) -> Result<bool, RelayError> {
        if room != RoomId::ALL {
            return self.is_user_online(room, user).await;
        }
        for candidate in &self.room_ids {
            if self.is_user_online(*candidate, user).await? {
                return Ok(true);
            }
        }
        Ok(false)
    }

    async fn is_user_online(&self, room: RoomId, user: UserId) -> Result<bool, RelayError> {
        if self.registry.lookup_user_connection(room, user).await.is_some() {
            return Ok(true);
        }
        let key = PresenceKey::new(room, user);
        let record = self.presence.get_user_online(&key).await?;
        Ok(record.is_some_and(|r| r.is_online(clock::unix_now(), self.online_window)))
    }

    /// Deliver to one user, locally if connected here, otherwise via the
    /// instance named in the user's presence record.
    #[instrument(skip_all, name = "sig.relay.send_to_user", fields(room_id = %room, user_id = %user, cmd = %message.cmd))]
    pub async fn send_to_user(
        &self,
        room: RoomId,
        user: UserId,
        message: RelayMessage,
    ) -> Result<(), RelayError> {
        if self.registry.lookup_user_connection(room, user).await.is_some() {
            return self.deliver_local(room, user, &message).await;
        }

        let key = PresenceKey::new(room, user);
        let record = self
            .presence
            .get_user_online(&key)
            .await?
            .ok_or(RelayError::UserOffline)?;

        if !record.is_online(clock::unix_now(), self.online_window) {
            debug!(target: "sig.relay", key = %key, "Target offline");
            return Err(RelayError::UserOffline);
        }
        if record.is_hosted_by(&self.instance) {
            // Record claims this instance but the registry has no connection
            debug!(target: "sig.relay", key = %key, "Stale presence record for local user");
            return Err(RelayError::UserOffline);
        }

        let result = self
            .client
            .send_msg(&record.instance_addr, room, user, &message)
            .await;
        metrics::record_relay_call("send_msg", outcome_label(&result));
        result.map(|msg_id| {
            debug!(
                target: "sig.relay",
                instance = %record.instance_addr,
                send_msg_id = %msg_id,
                "Relayed to remote instance"
            );
        })
    }

    /// Deliver to every user of `room` on every live instance, skipping
    /// `exclude`. Returns the number of remote instances attempted.
    #[instrument(skip_all, name = "sig.relay.send_to_all_in_room", fields(room_id = %room, cmd = %message.cmd))]
    pub async fn send_to_all_in_room(
        &self,
        room: RoomId,
        exclude: Option<UserId>,
        message: RelayMessage,
    ) -> Result<usize, RelayError> {
        self.broadcast_local(room, exclude, &message).await?;

        let servers = self.presence.get_server_all(clock::unix_now()).await?;
        let remotes: Vec<InstanceAddr> = servers
            .into_iter()
            .map(|s| s.addr)
            .filter(|addr| addr != &self.instance)
            .collect();

        let exclude = exclude.unwrap_or(UserId::NONE);
        let calls = remotes.iter().map(|instance| {
            let message = &message;
            async move {
                let result = self.client.send_msg_all(instance, room, exclude, message).await;
                (instance, result)
            }
        });

        for (instance, result) in join_all(calls).await {
            metrics::record_relay_call("send_msg_all", outcome_label(&result));
            if let Err(e) = result {
                warn!(target: "sig.relay", instance = %instance, error = %e, "Room fan-out to instance failed");
            }
        }

        Ok(remotes.len())
    }

    /// Users of `room` on this instance followed by those of every remote
    /// live instance. Not deduplicated.
    pub async fn list_users_anywhere(&self, room: RoomId) -> Result<Vec<UserId>, RelayError> {
        let mut users = self.registry.list_room_users(room).await;

        let servers = self.presence.get_server_all(clock::unix_now()).await?;
        for server in servers.iter().filter(|s| s.addr != self.instance) {
            let result = self.client.get_user_list(&server.addr, room).await;
            metrics::record_relay_call("get_user_list", outcome_label(&result));
            match result {
                Ok(remote) => users.extend(remote),
                Err(e) => {
                    warn!(target: "sig.relay", instance = %server.addr, error = %e, "User list from instance failed");
                }
            }
        }
        Ok(users)
    }

    /// Deliver to a user connected to this instance.
    pub async fn deliver_local(
        &self,
        room: RoomId,
        user: UserId,
        message: &RelayMessage,
    ) -> Result<(), RelayError> {
        let conn = self
            .registry
            .lookup_user_connection(room, user)
            .await
            .ok_or(RelayError::NotConnectedHere)?;
        let frame = message.to_text()?;
        if registry::deliver(&conn, frame) {
            Ok(())
        } else {
            Err(RelayError::NotConnectedHere)
        }
    }

    /// Broadcast to this instance's users of `room` (`RoomId::ALL` for every
    /// room).
    pub async fn broadcast_local(
        &self,
        room: RoomId,
        exclude: Option<UserId>,
        message: &RelayMessage,
    ) -> Result<(), RelayError> {
        let frame = message.to_text()?;
        self.registry
            .broadcast(BroadcastEvent {
                frame,
                room: (room != RoomId::ALL).then_some(room),
                exclude: exclude.filter(|u| u.is_valid()),
            })
            .await?;
        Ok(())
    }

    #[must_use]
    pub fn registry(&self) -> &RegistryHandle {
        &self.registry
    }
}

fn outcome_label<T>(result: &Result<T, RelayError>) -> &'static str {
    match result {
        Ok(_) => "success",
        Err(RelayError::Remote { .. }) => "remote_error",
        Err(_) => "error",
    }
}
