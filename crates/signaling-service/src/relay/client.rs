//! tonic client for the relay RPC surface.
//!
//! # Connection Pattern
//!
//! One lazily connected `Channel` per peer instance, cached by address. A
//! `Channel` is cheap to clone and reconnects on its own, so callers clone
//! it per request without locking across the call.

use super::{RelayClient, RelayMessage};
use crate::errors::{RelayError, ResponseCode};
use async_trait::async_trait;
use common::types::{InstanceAddr, RoomId, UserId};
use proto_gen::relay::signal_relay_client::SignalRelayClient;
use proto_gen::relay::{
    GetUserListRequest, QueryUsersOnlineRequest, SendMsgAllRequest, SendMsgRequest,
};
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::RwLock;
use tonic::transport::{Channel, Endpoint};
use tracing::{debug, instrument};

/// Relay client dialing peers over gRPC with a fixed connect and request
/// timeout.
pub struct GrpcRelayClient {
    timeout: Duration,
    channels: RwLock<HashMap<InstanceAddr, Channel>>,
}

impl GrpcRelayClient {
    #[must_use]
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            channels: RwLock::new(HashMap::new()),
        }
    }

    async fn client(&self, instance: &InstanceAddr) -> Result<SignalRelayClient<Channel>, RelayError> {
        if let Some(channel) = self.channels.read().await.get(instance) {
            return Ok(SignalRelayClient::new(channel.clone()));
        }

        let channel = Endpoint::from_shared(instance.endpoint_uri())
            .map_err(|e| RelayError::Rpc {
                instance: instance.to_string(),
                message: format!("invalid endpoint: {e}"),
            })?
            .connect_timeout(self.timeout)
            .timeout(self.timeout)
            .connect_lazy();

        debug!(target: "sig.relay.client", instance = %instance, "Created relay channel");
        self.channels
            .write()
            .await
            .insert(instance.clone(), channel.clone());
        Ok(SignalRelayClient::new(channel))
    }
}

fn rpc_error(instance: &InstanceAddr, status: &tonic::Status) -> RelayError {
    RelayError::Rpc {
        instance: instance.to_string(),
        message: format!("{}: {}", status.code(), status.message()),
    }
}

fn check_ret_code(instance: &InstanceAddr, ret_code: u32, err_msg: String) -> Result<(), RelayError> {
    if ret_code == ResponseCode::Ok.as_u32() {
        Ok(())
    } else {
        Err(RelayError::Remote {
            instance: instance.to_string(),
            code: ret_code,
            message: err_msg,
        })
    }
}

#[async_trait]
impl RelayClient for GrpcRelayClient {
    #[instrument(skip_all, fields(instance = %instance, room_id = %room, user_id = %user))]
    async fn query_users_online(
        &self,
        instance: &InstanceAddr,
        room: RoomId,
        user: UserId,
    ) -> Result<bool, RelayError> {
        let mut client = self.client(instance).await?;
        let response = client
            .query_users_online(QueryUsersOnlineRequest {
                room_id: room.0,
                user_id: user.0,
            })
            .await
            .map_err(|status| rpc_error(instance, &status))?
            .into_inner();

        check_ret_code(instance, response.ret_code, response.err_msg)?;
        Ok(response.online)
    }

    #[instrument(skip_all, fields(instance = %instance, room_id = %room, user_id = %user))]
    async fn send_msg(
        &self,
        instance: &InstanceAddr,
        room: RoomId,
        user: UserId,
        message: &RelayMessage,
    ) -> Result<String, RelayError> {
        let mut client = self.client(instance).await?;
        let response = client
            .send_msg(SendMsgRequest {
                seq: message.seq.clone(),
                room_id: room.0,
                user_id: user.0,
                cmd: message.cmd.clone(),
                r#type: message.kind.clone(),
                msg: message.msg.clone(),
                is_local: false,
            })
            .await
            .map_err(|status| rpc_error(instance, &status))?
            .into_inner();

        check_ret_code(instance, response.ret_code, response.err_msg)?;
        Ok(response.send_msg_id)
    }

    #[instrument(skip_all, fields(instance = %instance, room_id = %room))]
    async fn send_msg_all(
        &self,
        instance: &InstanceAddr,
        room: RoomId,
        exclude: UserId,
        message: &RelayMessage,
    ) -> Result<String, RelayError> {
        let mut client = self.client(instance).await?;
        let response = client
            .send_msg_all(SendMsgAllRequest {
                seq: message.seq.clone(),
                room_id: room.0,
                user_id: exclude.0,
                cmd: message.cmd.clone(),
                msg: message.msg.clone(),
            })
            .await
            .map_err(|status| rpc_error(instance, &status))?
            .into_inner();

        check_ret_code(instance, response.ret_code, response.err_msg)?;
        Ok(response.send_msg_id)
    }

    #[instrument(skip_all, fields(instance = %instance, room_id = %room))]
    async fn get_user_list(&self, instance: &InstanceAddr, room: RoomId) -> Result<Vec<UserId>, RelayError> {
        let mut client = self.client(instance).await?;
        let response = client
            .get_user_list(GetUserListRequest { room_id: room.0 })
            .await
            .map_err(|status| rpc_error(instance, &status))?
            .into_inner();

        check_ret_code(instance, response.ret_code, response.err_msg)?;
        Ok(response.user_id.into_iter().map(UserId).collect())
    }
}
