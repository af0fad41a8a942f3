//! Client wire protocol.
//!
//! Clients send JSON text frames `{seq, cmd, data}`. Every frame the server
//! writes, whether a reply to a request or an unsolicited push, has the
//! single shape `{seq, cmd, code, msg, data}`; pushes carry code 200.

use crate::config::IceServer;
use crate::errors::ResponseCode;
use common::types::{RoomId, UserId};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Command names.
pub mod cmd {
    pub const PING: &str = "ping";
    pub const LOGIN: &str = "login";
    pub const HEARTBEAT: &str = "heartbeat";
    pub const ICE_CANDIDATE: &str = "iceCandidate";
    pub const SESSION_DESCRIPTION: &str = "sessionDescription";
    pub const ROOM_ACTION: &str = "roomAction";
    pub const PEER_ACTION: &str = "peerAction";
    pub const PEER_STATUS: &str = "peerStatus";
    pub const CHECK_ONLINE: &str = "checkOnline";
    pub const USER_LIST: &str = "userList";
    pub const MESSAGE: &str = "message";

    // Server pushes
    pub const CREATE_PEER_CONNECTION: &str = "createRTCPeerConnection";
    pub const CONNECT: &str = "connect";
    pub const EXIT: &str = "exit";
    pub const MSG: &str = "msg";
}

/// Fresh sequence id for server-originated frames.
#[must_use]
pub fn new_seq() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}

/// Inbound frame. `data` is kept raw and re-encoded for the handler.
#[derive(Debug, Deserialize)]
pub struct InboundEnvelope {
    #[serde(default)]
    pub seq: String,
    pub cmd: String,
    #[serde(default)]
    pub data: Value,
}

/// Outbound frame, for replies and pushes alike.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboundFrame {
    pub seq: String,
    pub cmd: String,
    pub code: u32,
    pub msg: String,
    #[serde(default)]
    pub data: Value,
}

impl OutboundFrame {
    /// Reply to a request, echoing its `seq` and `cmd`.
    #[must_use]
    pub fn reply(seq: &str, cmd: &str, code: ResponseCode, msg: Option<String>, data: Value) -> Self {
        Self {
            seq: seq.to_string(),
            cmd: cmd.to_string(),
            code: code.as_u32(),
            msg: msg.unwrap_or_else(|| code.message().to_string()),
            data,
        }
    }

    /// Unsolicited push with a fresh `seq`.
    pub fn push<T: Serialize + ?Sized>(cmd: &str, data: &T) -> Result<Self, serde_json::Error> {
        Ok(Self::push_value(new_seq(), cmd, serde_json::to_value(data)?))
    }

    /// Push with an already-encoded payload and caller-chosen `seq`.
    #[must_use]
    pub fn push_value(seq: String, cmd: &str, data: Value) -> Self {
        Self {
            seq,
            cmd: cmd.to_string(),
            code: ResponseCode::Ok.as_u32(),
            msg: ResponseCode::Ok.message().to_string(),
            data,
        }
    }

    pub fn to_text(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// Media and UI flags a client reports for itself.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct PeerFlags {
    pub use_video: bool,
    pub use_audio: bool,
    pub audio_status: bool,
    pub video_status: bool,
    pub screen_status: bool,
    pub hand_status: bool,
    pub record_status: bool,
    pub privacy_status: bool,
}

/// Per-(room, user) conference state, shared with every member of the room.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerDescriptor {
    pub room_id: RoomId,
    pub room_name: String,
    pub room_lock: bool,
    /// Never sent to clients.
    #[serde(rename = "roomPasswd", skip_serializing, default)]
    pub room_password: String,
    pub user_id: UserId,
    pub user_name: String,
    pub user_lock: bool,
    #[serde(flatten)]
    pub flags: PeerFlags,
}

impl PeerDescriptor {
    pub fn set_status(&mut self, flag: StatusFlag, value: bool) {
        let slot = match flag {
            StatusFlag::Video => &mut self.flags.video_status,
            StatusFlag::Audio => &mut self.flags.audio_status,
            StatusFlag::Screen => &mut self.flags.screen_status,
            StatusFlag::Hand => &mut self.flags.hand_status,
            StatusFlag::Record => &mut self.flags.record_status,
            StatusFlag::Privacy => &mut self.flags.privacy_status,
        };
        *slot = value;
    }
}

/// Toggleable peer status, named by the `action` of a `peerStatus` request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusFlag {
    Video,
    Audio,
    Screen,
    Hand,
    Record,
    Privacy,
}

impl StatusFlag {
    #[must_use]
    pub fn from_action(action: &str) -> Option<Self> {
        match action {
            "video" => Some(Self::Video),
            "audio" => Some(Self::Audio),
            "screen" => Some(Self::Screen),
            "hand" => Some(Self::Hand),
            "record" => Some(Self::Record),
            "privacy" => Some(Self::Privacy),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoginRequest {
    #[serde(default)]
    pub token: String,
    #[serde(default)]
    pub room_id: RoomId,
    #[serde(default)]
    pub user_id: UserId,
    #[serde(default)]
    pub user_name: String,
    #[serde(flatten)]
    pub flags: PeerFlags,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HeartbeatRequest {
    #[serde(default)]
    pub user_id: UserId,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(rename = "sdpMLineIndex", default)]
    pub sdp_m_line_index: u32,
    #[serde(rename = "sdpMid", default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidateRequest {
    pub user_id: UserId,
    pub ice_candidate: IceCandidate,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionDescription {
    pub sdp: String,
    /// "offer", "answer", "pranswer" or "rollback".
    #[serde(rename = "type")]
    pub kind: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionDescriptionRequest {
    pub user_id: UserId,
    pub session_description: SessionDescription,
}

/// `roomAction` and `peerAction` body. Also the body of the resulting push.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct RoomActionRequest {
    pub action: String,
    pub room_id: RoomId,
    pub user_id: UserId,
    pub user_name: String,
    pub password: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerStatusRequest {
    pub action: String,
    #[serde(default)]
    pub room_id: RoomId,
    #[serde(default)]
    pub user_id: UserId,
    pub status: bool,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckOnlineRequest {
    #[serde(default)]
    pub room_id: RoomId,
    pub user_id: UserId,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserListRequest {
    pub room_id: RoomId,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TextMessageRequest {
    /// Recipient; zero addresses the whole room.
    #[serde(default)]
    pub user_id: UserId,
    pub message: String,
}

/// `createRTCPeerConnection` push.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CreatePeerConnection<'a> {
    /// The other side of the peer connection to create.
    pub user_id: UserId,
    pub peers: &'a [PeerDescriptor],
    pub should_create_offer: bool,
    pub ice_servers: &'a [IceServer],
}

/// `connect` and `exit` pushes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MemberNotice {
    pub room_id: RoomId,
    pub user_id: UserId,
    pub user_name: String,
    pub message: String,
}

/// `msg` push carrying a chat message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TextMessage {
    /// Addressed user, zero for the whole room.
    pub target: UserId,
    #[serde(rename = "type")]
    pub kind: String,
    pub msg: String,
    pub from: UserId,
}
