//! Built-in command handlers.

use super::{Handler, HandlerReply, HandlerRequest};
use crate::clock;
use crate::context::AppContext;
use crate::errors::{RegistryError, ResponseCode};
use crate::presence::PresenceRecord;
use crate::protocol::{
    cmd, CheckOnlineRequest, HeartbeatRequest, IceCandidateRequest, LoginRequest, OutboundFrame,
    PeerDescriptor, PeerStatusRequest, RoomActionRequest, SessionDescriptionRequest, StatusFlag,
    TextMessage, TextMessageRequest, UserListRequest,
};
use crate::registry::{BroadcastEvent, PeerMutation};
use crate::relay::RelayMessage;
use crate::session::Connection;
use common::types::{RoomId, UserId};
use futures_util::FutureExt;
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

pub(super) fn register_defaults(table: &mut HashMap<&'static str, Handler>) {
    table.insert(cmd::PING, |req| ping(req).boxed());
    table.insert(cmd::LOGIN, |req| login(req).boxed());
    table.insert(cmd::HEARTBEAT, |req| heartbeat(req).boxed());
    table.insert(cmd::ICE_CANDIDATE, |req| ice_candidate(req).boxed());
    table.insert(cmd::SESSION_DESCRIPTION, |req| session_description(req).boxed());
    table.insert(cmd::ROOM_ACTION, |req| room_action(req).boxed());
    table.insert(cmd::PEER_ACTION, |req| peer_action(req).boxed());
    table.insert(cmd::PEER_STATUS, |req| peer_status(req).boxed());
    table.insert(cmd::CHECK_ONLINE, |req| check_online(req).boxed());
    table.insert(cmd::USER_LIST, |req| user_list(req).boxed());
    table.insert(cmd::MESSAGE, |req| message(req).boxed());
}

macro_rules! parse_or_reply {
    ($req:expr, $ty:ty) => {
        match $req.parse::<$ty>() {
            Ok(body) => body,
            Err(reply) => return reply,
        }
    };
}

fn require_login(conn: &Connection) -> Result<(), HandlerReply> {
    if conn.is_logged_in() {
        Ok(())
    } else {
        Err(HandlerReply::error(ResponseCode::NotLoggedIn))
    }
}

async fn ping(_req: HandlerRequest) -> HandlerReply {
    HandlerReply::ok(Value::String("pong".to_string()))
}

async fn login(req: HandlerRequest) -> HandlerReply {
    let body = parse_or_reply!(req, LoginRequest);
    let HandlerRequest { ctx, conn, .. } = req;

    if !body.user_id.is_valid() {
        return HandlerReply::error(ResponseCode::InvalidUserId);
    }
    if !body.room_id.is_valid() {
        return HandlerReply::error(ResponseCode::InvalidRoomId);
    }
    if conn.is_logged_in() {
        return HandlerReply::error(ResponseCode::HasLoggedIn);
    }

    match ctx.tokens.verify(&body.token).await {
        Ok(Some(identity)) if identity.user_id != body.user_id => {
            warn!(target: "sig.login", user_id = %body.user_id, token_user = %identity.user_id, "Token identity mismatch");
            return HandlerReply::error(ResponseCode::Unauthorized);
        }
        Ok(_) => {}
        Err(e) => {
            warn!(target: "sig.login", error = %e, "Token verification failed");
            return HandlerReply::error(e.response_code());
        }
    }

    let user = match ctx.directory.find_user(body.user_id).await {
        Ok(Some(user)) => user,
        Ok(None) => return HandlerReply::error(ResponseCode::NotUser),
        Err(e) => {
            warn!(target: "sig.login", error = %e, "User lookup failed");
            return HandlerReply::error(e.response_code());
        }
    };
    let room = match ctx.directory.find_room(body.room_id).await {
        Ok(Some(room)) => room,
        Ok(None) => return HandlerReply::error(ResponseCode::NotRoom),
        Err(e) => {
            warn!(target: "sig.login", error = %e, "Room lookup failed");
            return HandlerReply::error(e.response_code());
        }
    };

    if ctx
        .registry
        .lookup_user_connection(body.room_id, body.user_id)
        .await
        .is_some()
    {
        return HandlerReply::error(ResponseCode::HasLoggedIn);
    }

    let user_name = if body.user_name.is_empty() {
        user.name
    } else {
        body.user_name
    };

    let now = clock::unix_now();
    conn.login(body.room_id, body.user_id, now);

    let record = PresenceRecord::login(
        ctx.instance.clone(),
        body.room_id,
        body.user_id,
        user_name.clone(),
        conn.client_addr().to_string(),
        now,
    );
    if let Err(e) = ctx.presence.set_user_online(&conn.presence_key(), &record).await {
        warn!(target: "sig.login", error = %e, "Presence write failed, login rolled back");
        conn.reset_login();
        return HandlerReply::error(ResponseCode::ServerError);
    }

    let peer = PeerDescriptor {
        room_id: body.room_id,
        room_name: room.name,
        room_lock: false,
        room_password: String::new(),
        user_id: body.user_id,
        user_name,
        user_lock: false,
        flags: body.flags,
    };

    match ctx.registry.complete_login(Arc::clone(&conn), peer).await {
        Ok(()) => {
            info!(
                target: "sig.login",
                connection_id = conn.id(),
                room_id = %body.room_id,
                user_id = %body.user_id,
                "User logged in"
            );
            HandlerReply::ok(json!({"roomId": body.room_id, "userId": body.user_id}))
        }
        Err(RegistryError::AlreadyLoggedIn) => {
            conn.reset_login();
            HandlerReply::error(ResponseCode::HasLoggedIn)
        }
        Err(e) => {
            warn!(target: "sig.login", error = %e, "Registry refused login");
            conn.reset_login();
            HandlerReply::error(e.response_code())
        }
    }
}

async fn heartbeat(req: HandlerRequest) -> HandlerReply {
    if let Err(reply) = require_login(&req.conn) {
        return reply;
    }
    let body = parse_or_reply!(req, HeartbeatRequest);
    let HandlerRequest { ctx, conn, .. } = req;

    if body.user_id.is_valid() && body.user_id != conn.user_id() {
        return HandlerReply::error(ResponseCode::InvalidUserId);
    }

    let now = clock::unix_now();
    conn.heartbeat(now);

    let key = conn.presence_key();
    let mut record = match ctx.presence.get_user_online(&key).await {
        Ok(Some(record)) => record,
        Ok(None) => {
            debug!(target: "sig.heartbeat", key = %key, "No presence record");
            return HandlerReply::error(ResponseCode::NotLoggedIn);
        }
        Err(e) => {
            warn!(target: "sig.heartbeat", key = %key, error = %e, "Presence read failed");
            return HandlerReply::error(ResponseCode::ServerError);
        }
    };

    record.heartbeat(now);
    if let Err(e) = ctx.presence.set_user_online(&key, &record).await {
        warn!(target: "sig.heartbeat", key = %key, error = %e, "Presence write failed");
        return HandlerReply::error(ResponseCode::ServerError);
    }
    HandlerReply::ok(Value::Null)
}

/// Forward a signaling payload from the session's user to `target` in the
/// same room.
async fn forward_to_peer<T: Serialize + ?Sized>(
    ctx: &AppContext,
    conn: &Connection,
    target: UserId,
    command: &str,
    payload: &T,
) -> HandlerReply {
    if !target.is_valid() {
        return HandlerReply::error(ResponseCode::InvalidUserId);
    }
    let message = match RelayMessage::json(command, payload) {
        Ok(message) => message,
        Err(e) => return HandlerReply::error(e.response_code()),
    };
    match ctx.relay.send_to_user(conn.room_id(), target, message).await {
        Ok(()) => HandlerReply::ok(Value::Null),
        Err(e) => {
            debug!(target: "sig.signaling", cmd = command, to = %target, error = %e, "Forward failed");
            HandlerReply::error(e.response_code())
        }
    }
}

async fn ice_candidate(req: HandlerRequest) -> HandlerReply {
    if let Err(reply) = require_login(&req.conn) {
        return reply;
    }
    let body = parse_or_reply!(req, IceCandidateRequest);
    let payload = json!({
        "userId": req.conn.user_id(),
        "iceCandidate": body.ice_candidate,
    });
    forward_to_peer(&req.ctx, &req.conn, body.user_id, cmd::ICE_CANDIDATE, &payload).await
}

async fn session_description(req: HandlerRequest) -> HandlerReply {
    if let Err(reply) = require_login(&req.conn) {
        return reply;
    }
    let body = parse_or_reply!(req, SessionDescriptionRequest);
    let payload = json!({
        "userId": req.conn.user_id(),
        "sessionDescription": body.session_description,
    });
    forward_to_peer(&req.ctx, &req.conn, body.user_id, cmd::SESSION_DESCRIPTION, &payload).await
}

/// Build the room announcement for an applied mutation, skipping the sender.
fn announcement<T: Serialize + ?Sized>(
    command: &str,
    room: RoomId,
    sender: UserId,
    data: &T,
) -> Result<BroadcastEvent, HandlerReply> {
    OutboundFrame::push(command, data)
        .and_then(|frame| frame.to_text())
        .map(|frame| BroadcastEvent {
            frame,
            room: Some(room),
            exclude: Some(sender),
        })
        .map_err(|e| {
            warn!(target: "sig.peers", cmd = command, error = %e, "Announcement encode failed");
            HandlerReply::error(ResponseCode::ServerError)
        })
}

async fn apply_mutation(
    ctx: &AppContext,
    room: RoomId,
    user: UserId,
    mutation: PeerMutation,
    announce: BroadcastEvent,
) -> HandlerReply {
    match ctx
        .registry
        .update_peer(room, user, mutation, Some(announce))
        .await
    {
        Ok(()) => HandlerReply::ok(Value::Null),
        Err(e) => {
            debug!(target: "sig.peers", room_id = %room, user_id = %user, error = %e, "Peer update failed");
            HandlerReply::error(e.response_code())
        }
    }
}

fn password_verdict(expected: &str, given: &str) -> &'static str {
    if expected == given {
        "OK"
    } else {
        "KO"
    }
}

async fn room_action(req: HandlerRequest) -> HandlerReply {
    if let Err(reply) = require_login(&req.conn) {
        return reply;
    }
    let body = parse_or_reply!(req, RoomActionRequest);
    let HandlerRequest { ctx, conn, .. } = req;
    let room = conn.room_id();
    let user = conn.user_id();

    let Some(peer) = ctx.registry.peer(room, user).await else {
        return HandlerReply::error(ResponseCode::OperationFailure);
    };

    let mutation = match body.action.as_str() {
        "lock" => PeerMutation::LockRoom {
            password: body.password.clone(),
        },
        "unlock" => PeerMutation::UnlockRoom,
        "checkPassword" => {
            let verdict = password_verdict(&peer.room_password, &body.password);
            return HandlerReply::ok(json!({ "password": verdict }));
        }
        other => {
            debug!(target: "sig.peers", action = other, "Unknown room action");
            return HandlerReply::error(ResponseCode::ParameterIllegal);
        }
    };

    let notice = RoomActionRequest {
        action: body.action.clone(),
        room_id: room,
        user_id: user,
        user_name: peer.user_name,
        password: String::new(),
    };
    let announce = match announcement(&body.action, room, user, &notice) {
        Ok(event) => event,
        Err(reply) => return reply,
    };
    apply_mutation(&ctx, room, user, mutation, announce).await
}

async fn peer_action(req: HandlerRequest) -> HandlerReply {
    if let Err(reply) = require_login(&req.conn) {
        return reply;
    }
    let body = parse_or_reply!(req, RoomActionRequest);
    let HandlerRequest { ctx, conn, .. } = req;
    let room = conn.room_id();
    let target = body.user_id;

    if !target.is_valid() {
        return HandlerReply::error(ResponseCode::InvalidUserId);
    }
    let mutation = match body.action.as_str() {
        "lock" => PeerMutation::LockUser,
        "unlock" => PeerMutation::UnlockUser,
        other => {
            debug!(target: "sig.peers", action = other, "Unknown peer action");
            return HandlerReply::error(ResponseCode::ParameterIllegal);
        }
    };
    let Some(peer) = ctx.registry.peer(room, target).await else {
        return HandlerReply::error(ResponseCode::OperationFailure);
    };

    let notice = RoomActionRequest {
        action: body.action.clone(),
        room_id: room,
        user_id: target,
        user_name: peer.user_name,
        password: String::new(),
    };
    let announce = match announcement(&body.action, room, conn.user_id(), &notice) {
        Ok(event) => event,
        Err(reply) => return reply,
    };
    apply_mutation(&ctx, room, target, mutation, announce).await
}

async fn peer_status(req: HandlerRequest) -> HandlerReply {
    if let Err(reply) = require_login(&req.conn) {
        return reply;
    }
    let body = parse_or_reply!(req, PeerStatusRequest);
    let HandlerRequest { ctx, conn, .. } = req;

    let Some(flag) = StatusFlag::from_action(&body.action) else {
        return HandlerReply::error(ResponseCode::ParameterIllegal);
    };
    let room = conn.room_id();
    let user = conn.user_id();

    let notice = PeerStatusRequest {
        action: body.action,
        room_id: room,
        user_id: user,
        status: body.status,
    };
    let announce = match announcement(cmd::PEER_STATUS, room, user, &notice) {
        Ok(event) => event,
        Err(reply) => return reply,
    };
    let mutation = PeerMutation::SetStatus {
        flag,
        value: body.status,
    };
    apply_mutation(&ctx, room, user, mutation, announce).await
}

async fn check_online(req: HandlerRequest) -> HandlerReply {
    let body = parse_or_reply!(req, CheckOnlineRequest);
    if !body.user_id.is_valid() {
        return HandlerReply::error(ResponseCode::InvalidUserId);
    }
    match req.ctx.relay.is_user_online_anywhere(body.room_id, body.user_id).await {
        Ok(online) => HandlerReply::ok(json!({ "online": online })),
        Err(e) => {
            warn!(target: "sig.relay", error = %e, "Online check failed");
            HandlerReply::error(e.response_code())
        }
    }
}

async fn user_list(req: HandlerRequest) -> HandlerReply {
    let body = parse_or_reply!(req, UserListRequest);
    match req.ctx.relay.list_users_anywhere(body.room_id).await {
        Ok(users) => HandlerReply::ok(json!({ "userList": users })),
        Err(e) => {
            warn!(target: "sig.relay", error = %e, "User list failed");
            HandlerReply::error(e.response_code())
        }
    }
}

async fn message(req: HandlerRequest) -> HandlerReply {
    if let Err(reply) = require_login(&req.conn) {
        return reply;
    }
    let body = parse_or_reply!(req, TextMessageRequest);
    let HandlerRequest { ctx, conn, .. } = req;
    let room = conn.room_id();
    let from = conn.user_id();

    let text = TextMessage {
        target: body.user_id,
        kind: "text".to_string(),
        msg: body.message,
        from,
    };
    let relay_message = match RelayMessage::json(cmd::MSG, &text) {
        Ok(message) => message,
        Err(e) => return HandlerReply::error(e.response_code()),
    };

    let result = if body.user_id.is_valid() {
        ctx.relay.send_to_user(room, body.user_id, relay_message).await
    } else {
        ctx.relay
            .send_to_all_in_room(room, Some(from), relay_message)
            .await
            .map(|_| ())
    };
    match result {
        Ok(()) => HandlerReply::ok(Value::Null),
        Err(e) => {
            debug!(target: "sig.message", room_id = %room, to = %body.user_id, error = %e, "Message not delivered");
            HandlerReply::error(e.response_code())
        }
    }
}
