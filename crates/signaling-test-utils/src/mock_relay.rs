//! Recording relay client.
//!
//! Stands in for the gRPC client when a test only needs to know which
//! peer instances would have been called, and with what.

use async_trait::async_trait;
use common::types::{InstanceAddr, RoomId, UserId};
use signaling_service::errors::RelayError;
use signaling_service::relay::{RelayClient, RelayMessage};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

/// One recorded relay call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayCall {
    QueryUsersOnline {
        instance: InstanceAddr,
        room: RoomId,
        user: UserId,
    },
    SendMsg {
        instance: InstanceAddr,
        room: RoomId,
        user: UserId,
        message: RelayMessage,
    },
    SendMsgAll {
        instance: InstanceAddr,
        room: RoomId,
        exclude: UserId,
        message: RelayMessage,
    },
    GetUserList {
        instance: InstanceAddr,
        room: RoomId,
    },
}

impl RelayCall {
    #[must_use]
    pub fn instance(&self) -> &InstanceAddr {
        match self {
            RelayCall::QueryUsersOnline { instance, .. }
            | RelayCall::SendMsg { instance, .. }
            | RelayCall::SendMsgAll { instance, .. }
            | RelayCall::GetUserList { instance, .. } => instance,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct RecordingRelayClient {
    inner: Arc<Mutex<RecordingInner>>,
}

#[derive(Debug, Default)]
struct RecordingInner {
    calls: Vec<RelayCall>,
    /// Instances whose calls fail as unreachable
    unreachable: HashSet<InstanceAddr>,
    user_lists: HashMap<(InstanceAddr, RoomId), Vec<UserId>>,
    online: HashSet<(InstanceAddr, RoomId, UserId)>,
}

impl RecordingRelayClient {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_unreachable(self, instance: &str) -> Self {
        self.inner
            .lock()
            .unwrap()
            .unreachable
            .insert(InstanceAddr::new(instance));
        self
    }

    /// Users `instance` reports for `room` in `GetUserList`.
    #[must_use]
    pub fn with_user_list(self, instance: &str, room: RoomId, users: &[u64]) -> Self {
        self.inner.lock().unwrap().user_lists.insert(
            (InstanceAddr::new(instance), room),
            users.iter().copied().map(UserId).collect(),
        );
        self
    }

    #[must_use]
    pub fn with_online(self, instance: &str, room: RoomId, user: UserId) -> Self {
        self.inner
            .lock()
            .unwrap()
            .online
            .insert((InstanceAddr::new(instance), room, user));
        self
    }

    pub fn calls(&self) -> Vec<RelayCall> {
        self.inner.lock().unwrap().calls.clone()
    }

    pub fn clear(&self) {
        self.inner.lock().unwrap().calls.clear();
    }

    fn record(&self, call: RelayCall) -> Result<(), RelayError> {
        let mut inner = self.inner.lock().unwrap();
        let unreachable = inner.unreachable.contains(call.instance());
        let instance = call.instance().to_string();
        inner.calls.push(call);
        if unreachable {
            return Err(RelayError::Rpc {
                instance,
                message: "mock: instance unreachable".to_string(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl RelayClient for RecordingRelayClient {
    async fn query_users_online(
        &self,
        instance: &InstanceAddr,
        room: RoomId,
        user: UserId,
    ) -> Result<bool, RelayError> {
        self.record(RelayCall::QueryUsersOnline {
            instance: instance.clone(),
            room,
            user,
        })?;
        let inner = self.inner.lock().unwrap();
        Ok(inner.online.contains(&(instance.clone(), room, user)))
    }

    async fn send_msg(
        &self,
        instance: &InstanceAddr,
        room: RoomId,
        user: UserId,
        message: &RelayMessage,
    ) -> Result<String, RelayError> {
        self.record(RelayCall::SendMsg {
            instance: instance.clone(),
            room,
            user,
            message: message.clone(),
        })?;
        Ok(message.seq.clone())
    }

    async fn send_msg_all(
        &self,
        instance: &InstanceAddr,
        room: RoomId,
        exclude: UserId,
        message: &RelayMessage,
    ) -> Result<String, RelayError> {
        self.record(RelayCall::SendMsgAll {
            instance: instance.clone(),
            room,
            exclude,
            message: message.clone(),
        })?;
        Ok(message.seq.clone())
    }

    async fn get_user_list(&self, instance: &InstanceAddr, room: RoomId) -> Result<Vec<UserId>, RelayError> {
        self.record(RelayCall::GetUserList {
            instance: instance.clone(),
            room,
        })?;
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .user_lists
            .get(&(instance.clone(), room))
            .cloned()
            .unwrap_or_default())
    }
}
