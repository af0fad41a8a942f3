//! Cross-instance relay: routing decisions, room fan-out and the relay
//! server's handling of inbound calls.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic, clippy::indexing_slicing)]

use common::types::{InstanceAddr, RoomId, UserId};
use proto_gen::relay::signal_relay_server::SignalRelay;
use proto_gen::relay::{
    GetUserListRequest, QueryUsersOnlineRequest, SendMsgAllRequest, SendMsgRequest,
};
use serde_json::json;
use signaling_service::clock;
use signaling_service::errors::RelayError;
use signaling_service::presence::PresenceRecord;
use signaling_service::relay::{RelayMessage, RelayService};
use signaling_test_utils::*;
use std::sync::Arc;
use std::time::Duration;
use tonic::Request;

const PEER_A: &str = "10.0.0.2:50061";
const PEER_B: &str = "10.0.0.3:50061";
const PEER_STALE: &str = "10.0.0.4:50061";

fn record_on(instance: &str, user: u64, heartbeat: u64) -> PresenceRecord {
    let mut record = PresenceRecord::login(
        InstanceAddr::new(instance),
        RoomId(TEST_ROOM),
        UserId(user),
        format!("User {user}"),
        "10.9.9.9:1".to_string(),
        heartbeat,
    );
    record.heartbeat(heartbeat);
    record
}

fn cluster(now: u64) -> MockPresenceStore {
    MockPresenceStore::new()
        .with_server(TEST_INSTANCE, now)
        .with_server(PEER_A, now)
        .with_server(PEER_B, now - 10)
        .with_server(PEER_STALE, now - 500)
}

// ============================================================================
// Room fan-out
// ============================================================================

#[tokio::test]
async fn test_room_fanout_reaches_local_and_each_live_remote_once() {
    let now = clock::unix_now();
    let harness = TestHarness::with_parts(&test_config(), cluster(now), RecordingRelayClient::new());
    let mut alice = harness.logged_in(TEST_ROOM, 1).await;
    let _bob = harness.logged_in(TEST_ROOM, 2).await;

    let message = RelayMessage::json("msg", &json!({"msg": "all hands"})).unwrap();
    let attempted = harness
        .ctx
        .relay
        .send_to_all_in_room(RoomId(TEST_ROOM), Some(UserId(2)), message.clone())
        .await
        .unwrap();
    assert_eq!(attempted, 2);

    let push = alice.expect_push("msg").await;
    assert_eq!(push.seq, message.seq);
    assert_eq!(push.data, json!({"msg": "all hands"}));

    let mut instances: Vec<_> = harness
        .relay
        .calls()
        .into_iter()
        .map(|call| match call {
            RelayCall::SendMsgAll {
                instance, exclude, ..
            } => {
                assert_eq!(exclude, UserId(2));
                instance
            }
            other => panic!("unexpected relay call {other:?}"),
        })
        .collect();
    instances.sort();
    assert_eq!(instances, vec![InstanceAddr::new(PEER_A), InstanceAddr::new(PEER_B)]);
}

#[tokio::test]
async fn test_room_fanout_tolerates_unreachable_instance() {
    let now = clock::unix_now();
    let relay = RecordingRelayClient::new().with_unreachable(PEER_A);
    let harness = TestHarness::with_parts(&test_config(), cluster(now), relay);
    let mut alice = harness.logged_in(TEST_ROOM, 1).await;

    let message = RelayMessage::json("msg", &json!({"msg": "still delivered"})).unwrap();
    let attempted = harness
        .ctx
        .relay
        .send_to_all_in_room(RoomId(TEST_ROOM), None, message)
        .await
        .unwrap();
    assert_eq!(attempted, 2);
    assert_eq!(harness.relay.calls().len(), 2);

    let push = alice.expect_push("msg").await;
    assert_eq!(push.data["msg"], "still delivered");
}

#[tokio::test]
async fn test_room_fanout_fails_when_instance_set_unreadable() {
    let presence = MockPresenceStore::new().failing("get_server_all");
    let harness = TestHarness::with_parts(&test_config(), presence, RecordingRelayClient::new());

    let message = RelayMessage::text("msg", "hi");
    let result = harness
        .ctx
        .relay
        .send_to_all_in_room(RoomId(TEST_ROOM), None, message)
        .await;
    assert!(matches!(result, Err(RelayError::Presence(_))));
}

// ============================================================================
// Single-user routing
// ============================================================================

#[tokio::test]
async fn test_logged_off_record_is_offline_without_rpc() {
    let now = clock::unix_now();
    let mut record = record_on(PEER_A, 5, now);
    record.log_out(now);
    let presence = MockPresenceStore::new().with_user(record);
    let harness = TestHarness::with_parts(&test_config(), presence, RecordingRelayClient::new());

    let message = RelayMessage::text("msg", "anyone?");
    let result = harness
        .ctx
        .relay
        .send_to_user(RoomId(TEST_ROOM), UserId(5), message)
        .await;
    assert!(matches!(result, Err(RelayError::UserOffline)));
    assert!(harness.relay.calls().is_empty());
}

#[tokio::test]
async fn test_heartbeat_outside_window_is_offline() {
    let now = clock::unix_now();
    let presence = MockPresenceStore::new().with_user(record_on(PEER_A, 5, now - 361));
    let harness = TestHarness::with_parts(&test_config(), presence, RecordingRelayClient::new());

    let online = harness
        .ctx
        .relay
        .is_user_online_anywhere(RoomId(TEST_ROOM), UserId(5))
        .await
        .unwrap();
    assert!(!online);
}

#[tokio::test]
async fn test_record_claiming_this_instance_is_offline() {
    let now = clock::unix_now();
    let presence = MockPresenceStore::new().with_user(record_on(TEST_INSTANCE, 5, now));
    let harness = TestHarness::with_parts(&test_config(), presence, RecordingRelayClient::new());

    let result = harness
        .ctx
        .relay
        .send_to_user(RoomId(TEST_ROOM), UserId(5), RelayMessage::text("msg", "x"))
        .await;
    assert!(matches!(result, Err(RelayError::UserOffline)));
    assert!(harness.relay.calls().is_empty());
}

#[tokio::test]
async fn test_remote_rejection_surfaces_as_error() {
    let now = clock::unix_now();
    let presence = MockPresenceStore::new().with_user(record_on(PEER_B, 5, now));
    let relay = RecordingRelayClient::new().with_unreachable(PEER_B);
    let harness = TestHarness::with_parts(&test_config(), presence, relay);

    let result = harness
        .ctx
        .relay
        .send_to_user(RoomId(TEST_ROOM), UserId(5), RelayMessage::text("msg", "x"))
        .await;
    assert!(matches!(result, Err(RelayError::Rpc { .. })));
}

// ============================================================================
// Relay server
// ============================================================================

#[tokio::test]
async fn test_server_send_msg_delivers_locally() {
    let harness = TestHarness::new();
    let mut bob = harness.logged_in(TEST_ROOM, 2).await;
    let service = RelayService::new(Arc::clone(&harness.ctx.relay));

    let response = service
        .send_msg(Request::new(SendMsgRequest {
            seq: "remote-7".to_string(),
            room_id: TEST_ROOM,
            user_id: 2,
            cmd: "iceCandidate".to_string(),
            r#type: "json".to_string(),
            msg: r#"{"userId":1,"iceCandidate":{"candidate":"c","sdpMLineIndex":0}}"#.to_string(),
            is_local: false,
        }))
        .await
        .unwrap()
        .into_inner();
    assert_eq!(response.ret_code, 200);
    assert_eq!(response.send_msg_id, "remote-7");

    let push = bob.expect_push("iceCandidate").await;
    assert_eq!(push.seq, "remote-7");
    assert_eq!(push.data["userId"], 1);
}

#[tokio::test]
async fn test_server_send_msg_rejects_local_flag_and_absent_user() {
    let harness = TestHarness::new();
    let service = RelayService::new(Arc::clone(&harness.ctx.relay));

    let request = |is_local| SendMsgRequest {
        seq: "s".to_string(),
        room_id: TEST_ROOM,
        user_id: 2,
        cmd: "msg".to_string(),
        r#type: "json".to_string(),
        msg: "{}".to_string(),
        is_local,
    };

    let local = service.send_msg(Request::new(request(true))).await.unwrap().into_inner();
    assert_eq!(local.ret_code, 1001);

    let absent = service.send_msg(Request::new(request(false))).await.unwrap().into_inner();
    assert_eq!(absent.ret_code, 1012);
    assert!(absent.send_msg_id.is_empty());
}

#[tokio::test]
async fn test_server_send_msg_all_skips_excluded_user() {
    let harness = TestHarness::new();
    let mut alice = harness.logged_in(TEST_ROOM, 1).await;
    let mut bob = harness.logged_in(TEST_ROOM, 2).await;
    alice.expect_push("createRTCPeerConnection").await;
    alice.expect_push("connect").await;
    bob.expect_push("createRTCPeerConnection").await;

    let service = RelayService::new(Arc::clone(&harness.ctx.relay));
    let response = service
        .send_msg_all(Request::new(SendMsgAllRequest {
            seq: "fan-1".to_string(),
            room_id: TEST_ROOM,
            user_id: 1,
            cmd: "msg".to_string(),
            msg: "plain words".to_string(),
        }))
        .await
        .unwrap()
        .into_inner();
    assert_eq!(response.ret_code, 200);

    let push = bob.expect_push("msg").await;
    assert_eq!(push.data, json!("plain words"));
    assert!(alice.is_quiet(Duration::from_millis(100)).await);
}

#[tokio::test]
async fn test_server_user_list_and_online_query() {
    let harness = TestHarness::new();
    let _alice = harness.logged_in(TEST_ROOM, 1).await;
    let _bob = harness.logged_in(102, 2).await;
    let service = RelayService::new(Arc::clone(&harness.ctx.relay));

    let room = service
        .get_user_list(Request::new(GetUserListRequest { room_id: TEST_ROOM }))
        .await
        .unwrap()
        .into_inner();
    assert_eq!(room.user_id, vec![1]);

    let all = service
        .get_user_list(Request::new(GetUserListRequest { room_id: 0 }))
        .await
        .unwrap()
        .into_inner();
    assert_eq!(all.user_id, vec![1, 2]);

    let online = service
        .query_users_online(Request::new(QueryUsersOnlineRequest {
            room_id: 102,
            user_id: 2,
        }))
        .await
        .unwrap()
        .into_inner();
    assert_eq!(online.ret_code, 200);
    assert!(online.online);
}
