//! Presence cache gateway.
//!
//! The shared cache answers two questions for the whole cluster: which
//! instance hosts a given (room, user), and which instances are alive.
//!
//! A missing or expired record is `Ok(None)`, never an error. Errors are
//! reserved for infrastructure failures and undecodable payloads.

mod redis;

pub use self::redis::RedisPresenceStore;

use crate::errors::PresenceError;
use async_trait::async_trait;
use common::types::{InstanceAddr, PresenceKey, RoomId, UserId};
use serde::{Deserialize, Serialize};

/// Cluster-visible record of one user's login.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresenceRecord {
    /// Address of the instance hosting the connection.
    pub instance_addr: InstanceAddr,
    pub room_id: RoomId,
    pub user_id: UserId,
    #[serde(default)]
    pub user_name: String,
    pub client_addr: String,
    pub login_time: u64,
    pub heartbeat_time: u64,
    #[serde(default)]
    pub logout_time: u64,
    #[serde(default)]
    pub is_logoff: bool,
}

impl PresenceRecord {
    /// Record for a fresh login.
    #[must_use]
    pub fn login(
        instance_addr: InstanceAddr,
        room_id: RoomId,
        user_id: UserId,
        user_name: String,
        client_addr: String,
        now: u64,
    ) -> Self {
        Self {
            instance_addr,
            room_id,
            user_id,
            user_name,
            client_addr,
            login_time: now,
            heartbeat_time: now,
            logout_time: 0,
            is_logoff: false,
        }
    }

    /// Refresh the heartbeat. A heartbeat also revives a logged-off record.
    pub fn heartbeat(&mut self, now: u64) {
        self.heartbeat_time = now;
        self.is_logoff = false;
    }

    pub fn log_out(&mut self, now: u64) {
        self.logout_time = now;
        self.is_logoff = true;
    }

    /// Online iff not logged off and the last heartbeat is within `window`
    /// seconds of `now`.
    #[must_use]
    pub fn is_online(&self, now: u64, window: u64) -> bool {
        !self.is_logoff && now.saturating_sub(self.heartbeat_time) <= window
    }

    #[must_use]
    pub fn is_hosted_by(&self, instance: &InstanceAddr) -> bool {
        &self.instance_addr == instance
    }
}

/// Liveness entry of one instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerInfo {
    pub addr: InstanceAddr,
    pub timestamp: u64,
}

/// Shared presence cache.
#[async_trait]
pub trait PresenceStore: Send + Sync {
    /// Upsert the record under `key` with the presence TTL.
    async fn set_user_online(
        &self,
        key: &PresenceKey,
        record: &PresenceRecord,
    ) -> Result<(), PresenceError>;

    async fn get_user_online(&self, key: &PresenceKey) -> Result<Option<PresenceRecord>, PresenceError>;

    /// Publish this instance's liveness entry.
    async fn set_server_info(&self, info: &ServerInfo) -> Result<(), PresenceError>;

    async fn del_server_info(&self, addr: &InstanceAddr) -> Result<(), PresenceError>;

    /// Live instances as of `now`. Entries older than the instance TTL are
    /// dropped from the result.
    async fn get_server_all(&self, now: u64) -> Result<Vec<ServerInfo>, PresenceError>;

    /// Readiness probe.
    async fn ping(&self) -> Result<(), PresenceError>;
}
