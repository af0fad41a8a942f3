//! In-memory presence store.
//!
//! Mirrors the Redis store's contract: per-key TTL on presence records,
//! stale-entry pruning on `get_server_all`, `Ok(None)` for absent keys.
//! Time is taken from a settable mock clock so tests can step past TTLs
//! without sleeping.
//!
//! # Example
//!
//! ```rust,ignore
//! use signaling_test_utils::MockPresenceStore;
//!
//! let store = MockPresenceStore::new()
//!     .with_server("10.0.0.2:50061", now)
//!     .failing("get_user_online");
//!
//! assert!(store.get_user_online(&key).await.is_err());
//! ```

use async_trait::async_trait;
use common::types::{InstanceAddr, PresenceKey};
use signaling_service::clock;
use signaling_service::errors::PresenceError;
use signaling_service::presence::{PresenceRecord, PresenceStore, ServerInfo};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

/// Presence TTL used when none is given.
pub const DEFAULT_PRESENCE_TTL: u64 = 24 * 60 * 60;

/// Instance staleness window used when none is given.
pub const DEFAULT_INSTANCE_TTL: u64 = 180;

/// Mock presence store for testing handlers, relay and reaper.
#[derive(Debug, Clone)]
pub struct MockPresenceStore {
    inner: Arc<Mutex<MockPresenceInner>>,
}

#[derive(Debug, Default)]
struct MockPresenceInner {
    /// Presence records with their expiry time
    users: HashMap<PresenceKey, (PresenceRecord, u64)>,
    servers: HashMap<InstanceAddr, ServerInfo>,
    presence_ttl: u64,
    instance_ttl: u64,
    /// Fixed clock; `None` follows wall time
    now: Option<u64>,
    /// Operations that fail with `Unavailable`
    failing: HashSet<String>,
    calls: HashMap<String, usize>,
}

impl Default for MockPresenceStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MockPresenceStore {
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(MockPresenceInner {
                presence_ttl: DEFAULT_PRESENCE_TTL,
                instance_ttl: DEFAULT_INSTANCE_TTL,
                ..MockPresenceInner::default()
            })),
        }
    }

    #[must_use]
    pub fn with_presence_ttl(self, seconds: u64) -> Self {
        self.inner.lock().unwrap().presence_ttl = seconds;
        self
    }

    #[must_use]
    pub fn with_instance_ttl(self, seconds: u64) -> Self {
        self.inner.lock().unwrap().instance_ttl = seconds;
        self
    }

    /// Seed a presence record, stored as of the mock clock.
    #[must_use]
    pub fn with_user(self, record: PresenceRecord) -> Self {
        self.insert_user(record);
        self
    }

    /// Seed a live instance entry.
    #[must_use]
    pub fn with_server(self, addr: &str, timestamp: u64) -> Self {
        {
            let mut inner = self.inner.lock().unwrap();
            let addr = InstanceAddr::new(addr);
            inner.servers.insert(addr.clone(), ServerInfo { addr, timestamp });
        }
        self
    }

    /// Make `operation` (a `PresenceStore` method name) fail.
    #[must_use]
    pub fn failing(self, operation: &str) -> Self {
        self.set_failing(operation, true);
        self
    }

    pub fn set_failing(&self, operation: &str, failing: bool) {
        let mut inner = self.inner.lock().unwrap();
        if failing {
            inner.failing.insert(operation.to_string());
        } else {
            inner.failing.remove(operation);
        }
    }

    /// Freeze the mock clock at `now`.
    pub fn set_now(&self, now: u64) {
        self.inner.lock().unwrap().now = Some(now);
    }

    pub fn advance(&self, seconds: u64) {
        let mut inner = self.inner.lock().unwrap();
        let now = inner.now.unwrap_or_else(clock::unix_now);
        inner.now = Some(now + seconds);
    }

    pub fn insert_user(&self, record: PresenceRecord) {
        let mut inner = self.inner.lock().unwrap();
        let key = PresenceKey::new(record.room_id, record.user_id);
        let expires_at = inner.clock() + inner.presence_ttl;
        inner.users.insert(key, (record, expires_at));
    }

    /// Record as stored, ignoring TTL and failure injection.
    pub fn user(&self, key: &PresenceKey) -> Option<PresenceRecord> {
        let inner = self.inner.lock().unwrap();
        inner.users.get(key).map(|(record, _)| record.clone())
    }

    /// Raw instance entries, stale ones included.
    pub fn servers(&self) -> Vec<ServerInfo> {
        let inner = self.inner.lock().unwrap();
        let mut servers: Vec<_> = inner.servers.values().cloned().collect();
        servers.sort_by(|a, b| a.addr.cmp(&b.addr));
        servers
    }

    /// Number of calls made to `operation`, failed calls included.
    pub fn calls(&self, operation: &str) -> usize {
        let inner = self.inner.lock().unwrap();
        inner.calls.get(operation).copied().unwrap_or(0)
    }

    fn enter(&self, operation: &'static str) -> Result<std::sync::MutexGuard<'_, MockPresenceInner>, PresenceError> {
        let mut inner = self.inner.lock().unwrap();
        *inner.calls.entry(operation.to_string()).or_default() += 1;
        if inner.failing.contains(operation) {
            return Err(PresenceError::Unavailable(format!("mock {operation} failure")));
        }
        Ok(inner)
    }
}

impl MockPresenceInner {
    fn clock(&self) -> u64 {
        self.now.unwrap_or_else(clock::unix_now)
    }
}

#[async_trait]
impl PresenceStore for MockPresenceStore {
    async fn set_user_online(
        &self,
        key: &PresenceKey,
        record: &PresenceRecord,
    ) -> Result<(), PresenceError> {
        let mut inner = self.enter("set_user_online")?;
        let expires_at = inner.clock() + inner.presence_ttl;
        inner.users.insert(key.clone(), (record.clone(), expires_at));
        Ok(())
    }

    async fn get_user_online(&self, key: &PresenceKey) -> Result<Option<PresenceRecord>, PresenceError> {
        let mut inner = self.enter("get_user_online")?;
        let now = inner.clock();
        match inner.users.get(key) {
            Some((_, expires_at)) if *expires_at <= now => {
                inner.users.remove(key);
                Ok(None)
            }
            Some((record, _)) => Ok(Some(record.clone())),
            None => Ok(None),
        }
    }

    async fn set_server_info(&self, info: &ServerInfo) -> Result<(), PresenceError> {
        let mut inner = self.enter("set_server_info")?;
        inner.servers.insert(info.addr.clone(), info.clone());
        Ok(())
    }

    async fn del_server_info(&self, addr: &InstanceAddr) -> Result<(), PresenceError> {
        let mut inner = self.enter("del_server_info")?;
        inner.servers.remove(addr);
        Ok(())
    }

    async fn get_server_all(&self, now: u64) -> Result<Vec<ServerInfo>, PresenceError> {
        let mut inner = self.enter("get_server_all")?;
        let ttl = inner.instance_ttl;
        inner
            .servers
            .retain(|_, info| now.saturating_sub(info.timestamp) <= ttl);
        let mut servers: Vec<_> = inner.servers.values().cloned().collect();
        servers.sort_by(|a, b| a.addr.cmp(&b.addr));
        Ok(servers)
    }

    async fn ping(&self) -> Result<(), PresenceError> {
        self.enter("ping").map(|_| ())
    }
}
