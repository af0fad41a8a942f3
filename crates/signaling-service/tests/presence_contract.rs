//! Presence store contract.
//!
//! One suite run against the in-memory store always, and against Redis when
//! `SIG_TEST_REDIS_URL` points at a disposable instance.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use common::types::{InstanceAddr, PresenceKey, RoomId, UserId};
use signaling_service::clock;
use signaling_service::config::Config;
use signaling_service::presence::{PresenceRecord, PresenceStore, RedisPresenceStore, ServerInfo};
use signaling_test_utils::{test_vars, MockPresenceStore};

fn record(instance: &str, room: u64, user: u64, now: u64) -> PresenceRecord {
    PresenceRecord::login(
        InstanceAddr::new(instance),
        RoomId(room),
        UserId(user),
        format!("User {user}"),
        "192.168.1.20:40000".to_string(),
        now,
    )
}

async fn run_contract(store: &dyn PresenceStore, namespace: u64) {
    let now = clock::unix_now();
    let room = 900_000 + namespace;

    // Absent keys are not errors
    let missing = PresenceKey::new(RoomId(room), UserId(1));
    assert_eq!(store.get_user_online(&missing).await.unwrap(), None);

    // Upsert and read back
    let key = PresenceKey::new(RoomId(room), UserId(2));
    let mut rec = record("10.0.0.1:50061", room, 2, now);
    store.set_user_online(&key, &rec).await.unwrap();
    assert_eq!(store.get_user_online(&key).await.unwrap(), Some(rec.clone()));

    // Heartbeat and logoff overwrite
    rec.heartbeat(now + 30);
    rec.log_out(now + 31);
    store.set_user_online(&key, &rec).await.unwrap();
    let stored = store.get_user_online(&key).await.unwrap().unwrap();
    assert!(stored.is_logoff);
    assert_eq!(stored.logout_time, now + 31);
    assert!(!stored.is_online(now + 31, 360));

    // Live instance set
    let fresh = InstanceAddr::new(format!("10.{namespace}.0.1:50061"));
    let stale = InstanceAddr::new(format!("10.{namespace}.0.2:50061"));
    store
        .set_server_info(&ServerInfo {
            addr: fresh.clone(),
            timestamp: now,
        })
        .await
        .unwrap();
    store
        .set_server_info(&ServerInfo {
            addr: stale.clone(),
            timestamp: now - 10_000,
        })
        .await
        .unwrap();

    let live: Vec<InstanceAddr> = store
        .get_server_all(now)
        .await
        .unwrap()
        .into_iter()
        .map(|s| s.addr)
        .collect();
    assert!(live.contains(&fresh));
    assert!(!live.contains(&stale));

    store.del_server_info(&fresh).await.unwrap();
    let live = store.get_server_all(now).await.unwrap();
    assert!(live.iter().all(|s| s.addr != fresh));

    store.ping().await.unwrap();
}

#[tokio::test]
async fn test_contract_in_memory() {
    let store = MockPresenceStore::new();
    run_contract(&store, 1).await;
}

#[tokio::test]
async fn test_contract_redis() {
    let Ok(url) = std::env::var("SIG_TEST_REDIS_URL") else {
        eprintln!("SIG_TEST_REDIS_URL not set, skipping Redis presence contract");
        return;
    };
    let mut vars = test_vars();
    vars.insert("REDIS_URL".to_string(), url);
    let config = Config::from_vars(&vars).unwrap();

    let store = RedisPresenceStore::connect(&config).await.unwrap();
    run_contract(&store, 2).await;
}

#[tokio::test]
async fn test_unreachable_redis_fails_fast() {
    let mut vars = test_vars();
    // Port 9 (discard) on loopback is closed in test environments
    vars.insert("REDIS_URL".to_string(), "redis://127.0.0.1:9".to_string());
    vars.insert("SIG_CACHE_TIMEOUT_MS".to_string(), "300".to_string());
    let config = Config::from_vars(&vars).unwrap();

    assert!(RedisPresenceStore::connect(&config).await.is_err());
}
