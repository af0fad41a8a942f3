//! Redis-backed presence store.
//!
//! # Key Patterns
//!
//! - `sig:user:online:{room}_{user}` - presence record (JSON), SETEX with the
//!   presence TTL
//! - `sig:server:online` - HASH of instance address to `{addr, timestamp}`
//!   JSON; the hash itself expires after the instance TTL if nobody refreshes
//!   it
//!
//! Every call is bounded by the cache timeout. The multiplexed connection is
//! cloned per call.

use super::{PresenceRecord, PresenceStore, ServerInfo};
use crate::config::Config;
use crate::errors::PresenceError;
use crate::observability::metrics;
use async_trait::async_trait;
use common::secret::ExposeSecret;
use common::types::{InstanceAddr, PresenceKey};
use redis::aio::MultiplexedConnection;
use redis::{AsyncCommands, Client, RedisResult};
use std::collections::HashMap;
use std::future::Future;
use std::time::{Duration, Instant};
use tracing::{debug, error, instrument, warn};

const USER_ONLINE_PREFIX: &str = "sig:user:online:";
const SERVER_ONLINE_KEY: &str = "sig:server:online";

fn user_online_key(key: &PresenceKey) -> String {
    format!("{USER_ONLINE_PREFIX}{key}")
}

#[derive(Clone)]
pub struct RedisPresenceStore {
    connection: MultiplexedConnection,
    presence_ttl_seconds: u64,
    instance_ttl_seconds: u64,
    timeout: Duration,
}

impl RedisPresenceStore {
    /// Connect using the cache settings of `config`.
    pub async fn connect(config: &Config) -> Result<Self, PresenceError> {
        let client = Client::open(config.redis_url.expose_secret()).map_err(|e| {
            // The URL may carry credentials, never log it
            error!(target: "sig.presence", error = %e, "Failed to open Redis client");
            PresenceError::Unavailable(format!("Failed to open Redis client: {e}"))
        })?;

        let connection = tokio::time::timeout(
            config.cache_timeout(),
            client.get_multiplexed_async_connection(),
        )
        .await
        .map_err(|_| PresenceError::Timeout("connect"))?
        .map_err(|e| {
            error!(target: "sig.presence", error = %e, "Failed to connect to Redis");
            PresenceError::Unavailable(format!("Failed to connect to Redis: {e}"))
        })?;

        Ok(Self {
            connection,
            presence_ttl_seconds: config.presence_ttl_seconds,
            instance_ttl_seconds: config.instance_ttl_seconds,
            timeout: config.cache_timeout(),
        })
    }

    async fn timed<T, F>(&self, op: &'static str, fut: F) -> Result<T, PresenceError>
    where
        F: Future<Output = RedisResult<T>>,
    {
        let start = Instant::now();
        let result = match tokio::time::timeout(self.timeout, fut).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => Err(PresenceError::Unavailable(format!("{op} failed: {e}"))),
            Err(_) => Err(PresenceError::Timeout(op)),
        };
        metrics::record_presence_latency(op, start.elapsed());

        if let Err(e) = &result {
            warn!(target: "sig.presence", operation = op, error = %e, "Presence operation failed");
            metrics::record_presence_error(op, e.kind_label());
        }
        result
    }
}

#[async_trait]
impl PresenceStore for RedisPresenceStore {
    #[instrument(skip_all, fields(key = %key))]
    async fn set_user_online(
        &self,
        key: &PresenceKey,
        record: &PresenceRecord,
    ) -> Result<(), PresenceError> {
        let payload =
            serde_json::to_string(record).map_err(|e| PresenceError::Corrupt(e.to_string()))?;
        let mut conn = self.connection.clone();
        let redis_key = user_online_key(key);

        self.timed("set_user_online", async {
            let _: () = conn
                .set_ex(&redis_key, payload, self.presence_ttl_seconds)
                .await?;
            Ok::<_, redis::RedisError>(())
        })
        .await?;

        debug!(target: "sig.presence", key = %key, "Presence record stored");
        Ok(())
    }

    #[instrument(skip_all, fields(key = %key))]
    async fn get_user_online(&self, key: &PresenceKey) -> Result<Option<PresenceRecord>, PresenceError> {
        let mut conn = self.connection.clone();
        let redis_key = user_online_key(key);

        let raw: Option<String> = self
            .timed("get_user_online", async { conn.get(&redis_key).await })
            .await?;

        raw.map(|payload| {
            serde_json::from_str(&payload).map_err(|e| {
                metrics::record_presence_error("get_user_online", "corrupt");
                PresenceError::Corrupt(format!("{key}: {e}"))
            })
        })
        .transpose()
    }

    async fn set_server_info(&self, info: &ServerInfo) -> Result<(), PresenceError> {
        let payload =
            serde_json::to_string(info).map_err(|e| PresenceError::Corrupt(e.to_string()))?;
        let mut conn = self.connection.clone();
        let ttl = i64::try_from(self.instance_ttl_seconds).unwrap_or(i64::MAX);

        self.timed("set_server_info", async {
            let _: () = conn
                .hset(SERVER_ONLINE_KEY, info.addr.as_str(), payload)
                .await?;
            let _: () = conn.expire(SERVER_ONLINE_KEY, ttl).await?;
            Ok::<_, redis::RedisError>(())
        })
        .await
    }

    async fn del_server_info(&self, addr: &InstanceAddr) -> Result<(), PresenceError> {
        let mut conn = self.connection.clone();
        self.timed("del_server_info", async {
            let _: () = conn.hdel(SERVER_ONLINE_KEY, addr.as_str()).await?;
            Ok::<_, redis::RedisError>(())
        })
        .await
    }

    async fn get_server_all(&self, now: u64) -> Result<Vec<ServerInfo>, PresenceError> {
        let mut conn = self.connection.clone();
        let entries: HashMap<String, String> = self
            .timed("get_server_all", async { conn.hgetall(SERVER_ONLINE_KEY).await })
            .await?;

        let mut live = Vec::with_capacity(entries.len());
        let mut stale = Vec::new();
        for (field, payload) in entries {
            match serde_json::from_str::<ServerInfo>(&payload) {
                Ok(info) if now.saturating_sub(info.timestamp) <= self.instance_ttl_seconds => {
                    live.push(info);
                }
                Ok(_) => stale.push(field),
                Err(e) => {
                    warn!(target: "sig.presence", field = %field, error = %e, "Dropping corrupt liveness entry");
                    stale.push(field);
                }
            }
        }

        if !stale.is_empty() {
            debug!(target: "sig.presence", count = stale.len(), "Pruning stale liveness entries");
            let mut conn = self.connection.clone();
            // Pruning is best effort; the read already succeeded
            let _ = self
                .timed("prune_server_info", async {
                    let _: () = conn.hdel(SERVER_ONLINE_KEY, stale).await?;
                    Ok::<_, redis::RedisError>(())
                })
                .await;
        }

        live.sort_by(|a, b| a.addr.cmp(&b.addr));
        Ok(live)
    }

    async fn ping(&self) -> Result<(), PresenceError> {
        let mut conn = self.connection.clone();
        let _: String = self
            .timed("ping", async { redis::cmd("PING").query_async(&mut conn).await })
            .await?;
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use common::types::{RoomId, UserId};

    #[test]
    fn test_user_online_key() {
        let key = PresenceKey::new(RoomId(7), UserId(3));
        assert_eq!(user_online_key(&key), "sig:user:online:7_3");
    }

    #[test]
    fn test_server_info_json() {
        let info = ServerInfo {
            addr: InstanceAddr::new("10.0.0.1:50061"),
            timestamp: 1_700_000_000,
        };
        assert_eq!(
            serde_json::to_string(&info).unwrap(),
            r#"{"addr":"10.0.0.1:50061","timestamp":1700000000}"#
        );
    }
}
