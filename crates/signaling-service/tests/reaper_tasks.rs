//! Background jobs against live sessions.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::indexing_slicing)]

use common::types::{InstanceAddr, RoomId, UserId};
use signaling_service::reaper::{
    publish_liveness, spawn_connection_sweep, spawn_liveness_publisher, sweep_connections,
};
use signaling_test_utils::*;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

#[tokio::test]
async fn test_sweep_closes_only_expired_connections() {
    let harness = TestHarness::new();
    let mut stale = harness.logged_in(TEST_ROOM, 1).await;
    let mut fresh = harness.logged_in(TEST_ROOM, 2).await;

    let last = stale.conn.heartbeat_time();
    fresh.conn.heartbeat(last + 300);

    // The window boundary itself is not a timeout
    assert_eq!(sweep_connections(&harness.ctx.registry, last + 360).await, 0);
    assert_eq!(sweep_connections(&harness.ctx.registry, last + 361).await, 1);

    assert!(stale.wait_closed().await);
    let registry = harness.ctx.registry.clone();
    let id = stale.conn.id();
    eventually("expired connection unregistered", || {
        let registry = registry.clone();
        async move { !registry.contains_connection(id).await }
    })
    .await;

    // Remaining member is told the peer left
    let exit = fresh.expect_push("exit").await;
    assert_eq!(exit.data["userId"], 1);
    assert!(!fresh.conn.is_transport_closed());
    assert_eq!(
        harness.ctx.registry.list_room_users(RoomId(TEST_ROOM)).await,
        vec![UserId(2)]
    );
}

#[tokio::test]
async fn test_sweep_skips_already_closed_transport() {
    let harness = TestHarness::new();
    let client = harness.logged_in(TEST_ROOM, 3).await;
    let far_future = client.conn.heartbeat_time() + 10_000;

    client.conn.close_transport();
    assert_eq!(sweep_connections(&harness.ctx.registry, far_future).await, 0);
}

#[tokio::test]
async fn test_spawned_sweep_stops_on_cancel() {
    let harness = TestHarness::new();
    let cancel = CancellationToken::new();
    let handle = spawn_connection_sweep(
        harness.ctx.registry.clone(),
        Duration::ZERO,
        Duration::from_millis(10),
        cancel.clone(),
    );

    // Fresh connections survive a few real sweeps
    let mut client = harness.logged_in(TEST_ROOM, 4).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!client.conn.is_transport_closed());

    cancel.cancel();
    tokio::time::timeout(FRAME_TIMEOUT, handle).await.unwrap().unwrap();

    let reply = client.request("ping", serde_json::Value::Null).await;
    assert_eq!(reply.data, "pong");
}

#[tokio::test]
async fn test_publish_liveness_writes_server_entry() {
    let presence = MockPresenceStore::new();
    let instance = InstanceAddr::new(TEST_INSTANCE);

    publish_liveness(&presence, &instance).await;

    let servers = presence.servers();
    assert_eq!(servers.len(), 1);
    assert_eq!(servers[0].addr, instance);
}

#[tokio::test]
async fn test_publish_liveness_tolerates_cache_failure() {
    let presence = MockPresenceStore::new().failing("set_server_info");
    publish_liveness(&presence, &InstanceAddr::new(TEST_INSTANCE)).await;

    assert_eq!(presence.calls("set_server_info"), 1);
    assert!(presence.servers().is_empty());
}

#[tokio::test]
async fn test_liveness_publisher_withdraws_entry_on_shutdown() {
    let presence = MockPresenceStore::new();
    let cancel = CancellationToken::new();
    let handle = spawn_liveness_publisher(
        Arc::new(presence.clone()),
        InstanceAddr::new(TEST_INSTANCE),
        Duration::ZERO,
        Duration::from_millis(10),
        cancel.clone(),
    );

    let observed = presence.clone();
    eventually("liveness entry published", || {
        let observed = observed.clone();
        async move { observed.calls("set_server_info") >= 2 }
    })
    .await;
    assert_eq!(presence.servers().len(), 1);

    cancel.cancel();
    tokio::time::timeout(FRAME_TIMEOUT, handle).await.unwrap().unwrap();

    assert!(presence.servers().is_empty());
    assert_eq!(presence.calls("del_server_info"), 1);
}
