//! Router and handler behavior through real sessions.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic, clippy::indexing_slicing)]

use common::types::{InstanceAddr, PresenceKey, RoomId, UserId};
use futures_util::FutureExt;
use serde_json::json;
use signaling_service::clock;
use signaling_service::presence::PresenceRecord;
use signaling_service::router::HandlerReply;
use signaling_test_utils::*;
use std::time::Duration;

const REMOTE: &str = "10.0.0.2:50061";

fn remote_record(user: u64) -> PresenceRecord {
    PresenceRecord::login(
        InstanceAddr::new(REMOTE),
        RoomId(TEST_ROOM),
        UserId(user),
        format!("User {user}"),
        "10.9.9.9:1".to_string(),
        clock::unix_now(),
    )
}

// ============================================================================
// Envelope handling
// ============================================================================

#[tokio::test]
async fn test_ping_replies_pong() {
    let harness = TestHarness::new();
    let mut client = harness.client("10.1.0.1:1").await;

    let reply = client.request("ping", json!({})).await;
    assert_eq!(reply.code, 200);
    assert_eq!(reply.msg, "Success");
    assert_eq!(reply.data, json!("pong"));
}

#[tokio::test]
async fn test_malformed_frame_gets_parameter_illegal() {
    let harness = TestHarness::new();
    let mut client = harness.client("10.1.0.2:1").await;

    client.send_raw("{not json").await;
    let reply = client.next_frame().await.expect("reply to malformed frame");
    assert_eq!(reply.code, 1001);
    assert_eq!(reply.seq, "");
    assert_eq!(reply.cmd, "");

    // The session survives
    assert_eq!(client.request("ping", json!(null)).await.code, 200);
}

#[tokio::test]
async fn test_unknown_command_gets_routing_not_exist() {
    let harness = TestHarness::new();
    let mut client = harness.client("10.1.0.3:1").await;

    let reply = client.request("teleport", json!({})).await;
    assert_eq!(reply.code, 1013);
    assert_eq!(reply.cmd, "teleport");
}

#[tokio::test]
async fn test_panicking_handler_answers_server_error() {
    let harness = TestHarness::new();
    harness
        .ctx
        .router
        .register("boom", |_req| {
            async {
                if clock::unix_now() > 0 {
                    panic!("handler bug");
                }
                HandlerReply::ok(json!(null))
            }
            .boxed()
        })
        .await;
    let mut client = harness.client("10.1.0.4:1").await;

    let reply = client.request("boom", json!({})).await;
    assert_eq!(reply.code, 1005);
    assert_eq!(client.request("ping", json!({})).await.code, 200);
}

#[tokio::test]
async fn test_commands_requiring_login() {
    let harness = TestHarness::new();
    let mut client = harness.client("10.1.0.5:1").await;

    for cmd in ["heartbeat", "iceCandidate", "sessionDescription", "roomAction", "peerAction", "peerStatus", "message"] {
        let reply = client.request(cmd, json!({})).await;
        assert_eq!(reply.code, 1000, "{cmd} should require login");
    }
}

// ============================================================================
// Login and heartbeat
// ============================================================================

#[tokio::test]
async fn test_login_presence_failure_rolls_back() {
    let harness = TestHarness::new();
    harness.presence.set_failing("set_user_online", true);
    let mut client = harness.client("10.1.0.6:1").await;

    let reply = client.login(TEST_ROOM, 4).await;
    assert_eq!(reply.code, 1005);
    assert!(!client.conn.is_logged_in());
    assert!(harness
        .ctx
        .registry
        .lookup_user_connection(RoomId(TEST_ROOM), UserId(4))
        .await
        .is_none());
}

#[tokio::test]
async fn test_login_writes_presence_record() {
    let harness = TestHarness::new();
    let client = harness.logged_in(TEST_ROOM, 4).await;

    let record = harness
        .presence
        .user(&PresenceKey::new(RoomId(TEST_ROOM), UserId(4)))
        .expect("presence record written");
    assert_eq!(record.instance_addr, InstanceAddr::new(TEST_INSTANCE));
    assert_eq!(record.login_time, client.conn.login_time());
    assert_eq!(record.user_name, "User 4");
    assert!(!record.is_logoff);
}

#[tokio::test]
async fn test_heartbeat_refreshes_presence() {
    let harness = TestHarness::new();
    let mut client = harness.logged_in(TEST_ROOM, 6).await;

    let reply = client.request("heartbeat", json!({"userId": 6})).await;
    assert_eq!(reply.code, 200);
    assert_eq!(harness.presence.calls("get_user_online"), 1);
    assert_eq!(harness.presence.calls("set_user_online"), 2);
}

#[tokio::test]
async fn test_heartbeat_error_codes() {
    let harness = TestHarness::new();
    let mut client = harness.logged_in(TEST_ROOM, 6).await;

    let reply = client.request("heartbeat", json!({"userId": 7})).await;
    assert_eq!(reply.code, 1002);

    harness.presence.set_failing("get_user_online", true);
    let reply = client.request("heartbeat", json!({})).await;
    assert_eq!(reply.code, 1005);
}

#[tokio::test]
async fn test_heartbeat_without_presence_record_is_not_logged_in() {
    let harness = TestHarness::new();
    harness.presence.set_now(clock::unix_now());
    let mut client = harness.logged_in(TEST_ROOM, 6).await;

    // Past the presence TTL the record is gone
    harness.presence.advance(DEFAULT_PRESENCE_TTL + 1);
    let reply = client.request("heartbeat", json!({})).await;
    assert_eq!(reply.code, 1000);
}

// ============================================================================
// Signaling forwarding
// ============================================================================

#[tokio::test]
async fn test_ice_candidate_forwarded_locally() {
    let harness = TestHarness::new();
    let mut alice = harness.logged_in(TEST_ROOM, 1).await;
    let mut bob = harness.logged_in(TEST_ROOM, 2).await;

    let candidate = json!({"candidate": "candidate:1 1 UDP 2122252543 10.0.0.5 50000 typ host", "sdpMLineIndex": 0, "sdpMid": "0"});
    let reply = alice
        .request("iceCandidate", json!({"userId": 2, "iceCandidate": candidate}))
        .await;
    assert_eq!(reply.code, 200);

    let push = bob.expect_push("iceCandidate").await;
    assert_eq!(push.code, 200);
    assert_eq!(push.data["userId"], 1);
    assert_eq!(push.data["iceCandidate"], candidate);
    assert!(harness.relay.calls().is_empty());
}

#[tokio::test]
async fn test_session_description_to_offline_user_fails() {
    let harness = TestHarness::new();
    let mut alice = harness.logged_in(TEST_ROOM, 1).await;

    let reply = alice
        .request(
            "sessionDescription",
            json!({"userId": 42, "sessionDescription": {"type": "offer", "sdp": "v=0"}}),
        )
        .await;
    assert_eq!(reply.code, 1012);
    assert!(harness.relay.calls().is_empty());
}

#[tokio::test]
async fn test_session_description_relayed_to_remote_host() {
    let harness = TestHarness::new();
    harness.presence.insert_user(remote_record(2));
    let mut alice = harness.logged_in(TEST_ROOM, 1).await;

    let reply = alice
        .request(
            "sessionDescription",
            json!({"userId": 2, "sessionDescription": {"type": "answer", "sdp": "v=0"}}),
        )
        .await;
    assert_eq!(reply.code, 200);

    let calls = harness.relay.calls();
    assert_eq!(calls.len(), 1);
    match calls.first().unwrap() {
        RelayCall::SendMsg {
            instance,
            room,
            user,
            message,
        } => {
            assert_eq!(instance, &InstanceAddr::new(REMOTE));
            assert_eq!(*room, RoomId(TEST_ROOM));
            assert_eq!(*user, UserId(2));
            assert_eq!(message.cmd, "sessionDescription");
            let payload: serde_json::Value = serde_json::from_str(&message.msg).unwrap();
            assert_eq!(payload["userId"], 1);
            assert_eq!(payload["sessionDescription"]["type"], "answer");
        }
        other => panic!("unexpected relay call {other:?}"),
    }
}

#[tokio::test]
async fn test_relay_failure_reported_as_operation_failure() {
    let presence = MockPresenceStore::new().with_user(remote_record(2));
    let relay = RecordingRelayClient::new().with_unreachable(REMOTE);
    let harness = TestHarness::with_parts(&test_config(), presence, relay);
    let mut alice = harness.logged_in(TEST_ROOM, 1).await;

    let reply = alice
        .request(
            "iceCandidate",
            json!({"userId": 2, "iceCandidate": {"candidate": "c", "sdpMLineIndex": 0}}),
        )
        .await;
    assert_eq!(reply.code, 1012);
}

// ============================================================================
// Room and peer state
// ============================================================================

#[tokio::test]
async fn test_room_lock_announced_and_inherited() {
    let harness = TestHarness::new();
    let mut alice = harness.logged_in(TEST_ROOM, 1).await;
    let mut bob = harness.logged_in(TEST_ROOM, 2).await;

    let reply = alice
        .request("roomAction", json!({"action": "lock", "password": "letmein"}))
        .await;
    assert_eq!(reply.code, 200);

    let push = bob.expect_push("lock").await;
    assert_eq!(push.data["userId"], 1);
    assert_eq!(push.data["password"], "");

    let ok = bob
        .request("roomAction", json!({"action": "checkPassword", "password": "letmein"}))
        .await;
    assert_eq!(ok.data["password"], "OK");
    let ko = bob
        .request("roomAction", json!({"action": "checkPassword", "password": "guess"}))
        .await;
    assert_eq!(ko.data["password"], "KO");

    // A newcomer joins locked and never sees the password
    let mut carol = harness.client("10.1.0.9:1").await;
    assert_eq!(carol.login(TEST_ROOM, 3).await.code, 200);
    let pairing = carol.expect_push("createRTCPeerConnection").await;
    for peer in pairing.data["peers"].as_array().unwrap() {
        assert_eq!(peer["roomLock"], true);
        assert!(peer.get("roomPasswd").is_none());
    }

    let reply = alice.request("roomAction", json!({"action": "unlock"})).await;
    assert_eq!(reply.code, 200);
    let peer = harness.ctx.registry.peer(RoomId(TEST_ROOM), UserId(3)).await.unwrap();
    assert!(!peer.room_lock);
    assert!(peer.room_password.is_empty());
}

#[tokio::test]
async fn test_unknown_room_action_rejected() {
    let harness = TestHarness::new();
    let mut alice = harness.logged_in(TEST_ROOM, 1).await;

    let reply = alice.request("roomAction", json!({"action": "dissolve"})).await;
    assert_eq!(reply.code, 1001);
}

#[tokio::test]
async fn test_peer_action_locks_target() {
    let harness = TestHarness::new();
    let mut alice = harness.logged_in(TEST_ROOM, 1).await;
    let mut bob = harness.logged_in(TEST_ROOM, 2).await;

    let reply = alice
        .request("peerAction", json!({"action": "lock", "userId": 2}))
        .await;
    assert_eq!(reply.code, 200);

    let push = bob.expect_push("lock").await;
    assert_eq!(push.data["userId"], 2);
    let peer = harness.ctx.registry.peer(RoomId(TEST_ROOM), UserId(2)).await.unwrap();
    assert!(peer.user_lock);

    let missing = alice
        .request("peerAction", json!({"action": "lock", "userId": 77}))
        .await;
    assert_eq!(missing.code, 1012);
}

#[tokio::test]
async fn test_peer_status_updates_descriptor() {
    let harness = TestHarness::new();
    let mut alice = harness.logged_in(TEST_ROOM, 1).await;
    let mut bob = harness.logged_in(TEST_ROOM, 2).await;

    let reply = alice
        .request("peerStatus", json!({"action": "video", "status": true}))
        .await;
    assert_eq!(reply.code, 200);

    let push = bob.expect_push("peerStatus").await;
    assert_eq!(push.data, json!({"action": "video", "roomId": TEST_ROOM, "userId": 1, "status": true}));

    let peer = harness.ctx.registry.peer(RoomId(TEST_ROOM), UserId(1)).await.unwrap();
    assert!(peer.flags.video_status);

    let reply = alice
        .request("peerStatus", json!({"action": "volume", "status": true}))
        .await;
    assert_eq!(reply.code, 1001);
}

// ============================================================================
// Queries and messages
// ============================================================================

#[tokio::test]
async fn test_check_online() {
    let harness = TestHarness::new();
    harness.presence.insert_user(remote_record(2));
    let _alice = harness.logged_in(TEST_ROOM, 1).await;
    let mut probe = harness.client("10.1.0.10:1").await;

    let local = probe.request("checkOnline", json!({"roomId": TEST_ROOM, "userId": 1})).await;
    assert_eq!(local.data, json!({"online": true}));

    let remote = probe.request("checkOnline", json!({"roomId": TEST_ROOM, "userId": 2})).await;
    assert_eq!(remote.data, json!({"online": true}));

    // Room zero searches every configured room
    let any_room = probe.request("checkOnline", json!({"userId": 1})).await;
    assert_eq!(any_room.data, json!({"online": true}));

    let absent = probe.request("checkOnline", json!({"roomId": TEST_ROOM, "userId": 99})).await;
    assert_eq!(absent.data, json!({"online": false}));
}

#[tokio::test]
async fn test_user_list_merges_remote_instances() {
    let now = clock::unix_now();
    let presence = MockPresenceStore::new()
        .with_server(TEST_INSTANCE, now)
        .with_server(REMOTE, now);
    let relay = RecordingRelayClient::new().with_user_list(REMOTE, RoomId(TEST_ROOM), &[20, 21]);
    let harness = TestHarness::with_parts(&test_config(), presence, relay);
    let mut alice = harness.logged_in(TEST_ROOM, 1).await;

    let reply = alice.request("userList", json!({"roomId": TEST_ROOM})).await;
    assert_eq!(reply.code, 200);
    assert_eq!(reply.data, json!({"userList": [1, 20, 21]}));

    // Only the remote instance is asked
    assert_eq!(harness.relay.calls().len(), 1);
}

#[tokio::test]
async fn test_room_message_reaches_everyone_but_sender() {
    let harness = TestHarness::new();
    let mut alice = harness.logged_in(TEST_ROOM, 1).await;
    let mut bob = harness.logged_in(TEST_ROOM, 2).await;
    let mut carol = harness.logged_in(TEST_ROOM, 3).await;

    let reply = alice.request("message", json!({"message": "hello room"})).await;
    assert_eq!(reply.code, 200);

    for client in [&mut bob, &mut carol] {
        let push = client.expect_push("msg").await;
        assert_eq!(push.data, json!({"target": 0, "type": "text", "msg": "hello room", "from": 1}));
    }
    for _ in 0..2 {
        alice.expect_push("createRTCPeerConnection").await;
        alice.expect_push("connect").await;
    }
    assert!(alice.is_quiet(Duration::from_millis(100)).await);
}

#[tokio::test]
async fn test_direct_message() {
    let harness = TestHarness::new();
    let mut alice = harness.logged_in(TEST_ROOM, 1).await;
    let mut bob = harness.logged_in(TEST_ROOM, 2).await;

    let reply = alice
        .request("message", json!({"userId": 2, "message": "psst"}))
        .await;
    assert_eq!(reply.code, 200);

    let push = bob.expect_push("msg").await;
    assert_eq!(push.data["target"], 2);
    assert_eq!(push.data["from"], 1);
}
