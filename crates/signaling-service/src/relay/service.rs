//! Relay gRPC service.
//!
//! Implements `signal.relay.SignalRelay`, called by peer instances to reach
//! users connected here. Application outcomes travel in `ret_code`; a gRPC
//! `Status` error is reserved for transport-level failures.

use super::{Relay, RelayMessage, KIND_JSON, KIND_TEXT};
use crate::errors::ResponseCode;
use common::types::{RoomId, UserId};
use proto_gen::relay::signal_relay_server::SignalRelay;
use proto_gen::relay::{
    GetUserListRequest, GetUserListResponse, QueryUsersOnlineRequest, QueryUsersOnlineResponse,
    SendMsgAllRequest, SendMsgAllResponse, SendMsgRequest, SendMsgResponse,
};
use std::sync::Arc;
use tonic::{Request, Response, Status};
use tracing::{debug, instrument, warn};

pub struct RelayService {
    relay: Arc<Relay>,
}

impl RelayService {
    #[must_use]
    pub fn new(relay: Arc<Relay>) -> Self {
        Self { relay }
    }
}

/// `ret_code` and client-safe `err_msg` for a failed call.
fn failure(code: ResponseCode) -> (u32, String) {
    (code.as_u32(), code.message().to_string())
}

fn message_from(seq: String, cmd: String, kind: String, msg: String) -> RelayMessage {
    RelayMessage {
        seq,
        cmd,
        kind: if kind.is_empty() { KIND_JSON.to_string() } else { kind },
        msg,
    }
}

#[tonic::async_trait]
impl SignalRelay for RelayService {
    #[instrument(skip_all, name = "sig.relay.server.query_users_online")]
    async fn query_users_online(
        &self,
        request: Request<QueryUsersOnlineRequest>,
    ) -> Result<Response<QueryUsersOnlineResponse>, Status> {
        let inner = request.into_inner();
        let room = RoomId(inner.room_id);
        let user = UserId(inner.user_id);

        let response = match self.relay.is_user_online_anywhere(room, user).await {
            Ok(online) => QueryUsersOnlineResponse {
                ret_code: ResponseCode::Ok.as_u32(),
                err_msg: String::new(),
                online,
            },
            Err(e) => {
                warn!(target: "sig.relay.server", room_id = %room, user_id = %user, error = %e, "Online query failed");
                let (ret_code, err_msg) = failure(e.response_code());
                QueryUsersOnlineResponse {
                    ret_code,
                    err_msg,
                    online: false,
                }
            }
        };
        Ok(Response::new(response))
    }

    #[instrument(skip_all, name = "sig.relay.server.send_msg")]
    async fn send_msg(
        &self,
        request: Request<SendMsgRequest>,
    ) -> Result<Response<SendMsgResponse>, Status> {
        let inner = request.into_inner();
        let room = RoomId(inner.room_id);
        let user = UserId(inner.user_id);

        if inner.is_local {
            debug!(target: "sig.relay.server", "Rejecting SendMsg marked local");
            let (ret_code, err_msg) = failure(ResponseCode::ParameterIllegal);
            return Ok(Response::new(SendMsgResponse {
                ret_code,
                err_msg,
                send_msg_id: String::new(),
            }));
        }

        let message = message_from(inner.seq, inner.cmd, inner.r#type, inner.msg);
        let send_msg_id = message.seq.clone();

        let response = match self.relay.deliver_local(room, user, &message).await {
            Ok(()) => SendMsgResponse {
                ret_code: ResponseCode::Ok.as_u32(),
                err_msg: String::new(),
                send_msg_id,
            },
            Err(e) => {
                debug!(target: "sig.relay.server", room_id = %room, user_id = %user, error = %e, "SendMsg not delivered");
                let (ret_code, err_msg) = failure(e.response_code());
                SendMsgResponse {
                    ret_code,
                    err_msg,
                    send_msg_id: String::new(),
                }
            }
        };
        Ok(Response::new(response))
    }

    #[instrument(skip_all, name = "sig.relay.server.send_msg_all")]
    async fn send_msg_all(
        &self,
        request: Request<SendMsgAllRequest>,
    ) -> Result<Response<SendMsgAllResponse>, Status> {
        let inner = request.into_inner();
        let room = RoomId(inner.room_id);
        let exclude = UserId(inner.user_id);

        // SendMsgAll carries no payload type; decode leniently
        let message = message_from(inner.seq, inner.cmd, KIND_TEXT.to_string(), inner.msg);
        let send_msg_id = message.seq.clone();

        let response = match self.relay.broadcast_local(room, Some(exclude), &message).await {
            Ok(()) => SendMsgAllResponse {
                ret_code: ResponseCode::Ok.as_u32(),
                err_msg: String::new(),
                send_msg_id,
            },
            Err(e) => {
                warn!(target: "sig.relay.server", room_id = %room, error = %e, "SendMsgAll broadcast failed");
                let (ret_code, err_msg) = failure(e.response_code());
                SendMsgAllResponse {
                    ret_code,
                    err_msg,
                    send_msg_id: String::new(),
                }
            }
        };
        Ok(Response::new(response))
    }

    #[instrument(skip_all, name = "sig.relay.server.get_user_list")]
    async fn get_user_list(
        &self,
        request: Request<GetUserListRequest>,
    ) -> Result<Response<GetUserListResponse>, Status> {
        let room = RoomId(request.into_inner().room_id);
        let users = self.relay.registry().list_room_users(room).await;

        Ok(Response::new(GetUserListResponse {
            ret_code: ResponseCode::Ok.as_u32(),
            err_msg: String::new(),
            user_id: users.into_iter().map(|u| u.0).collect(),
        }))
    }
}
