//! Signaling service configuration.
//!
//! Configuration is loaded from environment variables. All sensitive
//! fields are redacted in Debug output.

use common::secret::{ExposeSecret, SecretString};
use common::types::{InstanceAddr, RoomId};
use serde::Serialize;
use std::collections::HashMap;
use std::env;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

/// Default WebSocket (client signaling) bind address.
pub const DEFAULT_WS_BIND_ADDRESS: &str = "0.0.0.0:8080";

/// Default gRPC bind address for the instance-to-instance relay.
pub const DEFAULT_GRPC_BIND_ADDRESS: &str = "0.0.0.0:50061";

/// Default health endpoint bind address.
pub const DEFAULT_HEALTH_BIND_ADDRESS: &str = "0.0.0.0:8081";

/// Seconds without a heartbeat before a connection is evicted and before a
/// presence record stops counting as online.
pub const DEFAULT_HEARTBEAT_TIMEOUT_SECONDS: u64 = 360;

/// Per-connection outbound queue capacity.
pub const DEFAULT_OUTBOUND_QUEUE_CAPACITY: usize = 100;

/// Capacity of each registry mutation queue.
pub const DEFAULT_REGISTRY_QUEUE_CAPACITY: usize = 1000;

/// Presence record TTL (24h).
pub const DEFAULT_PRESENCE_TTL_SECONDS: u64 = 24 * 60 * 60;

/// Instance liveness record TTL.
pub const DEFAULT_INSTANCE_TTL_SECONDS: u64 = 180;

pub const DEFAULT_SWEEP_INTERVAL_SECONDS: u64 = 3;
pub const DEFAULT_SWEEP_INITIAL_DELAY_SECONDS: u64 = 3;
pub const DEFAULT_LIVENESS_INTERVAL_SECONDS: u64 = 2;
pub const DEFAULT_LIVENESS_INITIAL_DELAY_SECONDS: u64 = 2;

/// Timeout applied to each relay RPC (connect and request).
pub const DEFAULT_RPC_TIMEOUT_MS: u64 = 1000;

/// Timeout applied to each shared-cache call.
pub const DEFAULT_CACHE_TIMEOUT_MS: u64 = 1000;

/// Rooms scanned by "all rooms" online queries.
pub const DEFAULT_ROOM_IDS: &[u64] = &[101, 102, 103, 104];

/// One entry of the `iceServers` list handed to clients.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IceServer {
    pub urls: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub credential: Option<String>,
}

/// Signaling service configuration.
///
/// Loaded from environment variables with sensible defaults.
/// Sensitive fields are redacted in Debug output.
#[derive(Clone)]
pub struct Config {
    /// Redis connection URL (presence cache and instance liveness).
    /// Protected by `SecretString` to prevent accidental logging.
    pub redis_url: SecretString,

    /// Postgres URL for user/room lookups. When absent, any user id is
    /// accepted and only the configured rooms exist.
    pub database_url: Option<SecretString>,

    pub ws_bind_address: String,
    pub grpc_bind_address: String,
    pub health_bind_address: String,

    /// Address other instances dial to reach this instance's relay server.
    pub advertise_address: InstanceAddr,

    pub heartbeat_timeout_seconds: u64,
    pub outbound_queue_capacity: usize,
    pub registry_queue_capacity: usize,
    pub presence_ttl_seconds: u64,
    pub instance_ttl_seconds: u64,

    pub sweep_interval_seconds: u64,
    pub sweep_initial_delay_seconds: u64,
    pub liveness_interval_seconds: u64,
    pub liveness_initial_delay_seconds: u64,

    pub rpc_timeout_ms: u64,
    pub cache_timeout_ms: u64,

    /// Fixed room set for "all rooms" queries.
    pub room_ids: Vec<RoomId>,

    pub stun_urls: Vec<String>,
    pub turn_urls: Vec<String>,
    pub turn_username: Option<String>,
    pub turn_credential: Option<SecretString>,
}

/// Custom Debug implementation that redacts sensitive fields.
impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("redis_url", &"[REDACTED]")
            .field(
                "database_url",
                &self.database_url.as_ref().map(|_| "[REDACTED]"),
            )
            .field("ws_bind_address", &self.ws_bind_address)
            .field("grpc_bind_address", &self.grpc_bind_address)
            .field("health_bind_address", &self.health_bind_address)
            .field("advertise_address", &self.advertise_address)
            .field("heartbeat_timeout_seconds", &self.heartbeat_timeout_seconds)
            .field("outbound_queue_capacity", &self.outbound_queue_capacity)
            .field("registry_queue_capacity", &self.registry_queue_capacity)
            .field("presence_ttl_seconds", &self.presence_ttl_seconds)
            .field("instance_ttl_seconds", &self.instance_ttl_seconds)
            .field("sweep_interval_seconds", &self.sweep_interval_seconds)
            .field(
                "liveness_interval_seconds",
                &self.liveness_interval_seconds,
            )
            .field("rpc_timeout_ms", &self.rpc_timeout_ms)
            .field("cache_timeout_ms", &self.cache_timeout_ms)
            .field("room_ids", &self.room_ids)
            .field("stun_urls", &self.stun_urls)
            .field("turn_urls", &self.turn_urls)
            .field("turn_username", &self.turn_username)
            .field(
                "turn_credential",
                &self.turn_credential.as_ref().map(|_| "[REDACTED]"),
            )
            .finish()
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid configuration value: {0}")]
    InvalidValue(String),
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_vars(&env::vars().collect())
    }

    /// Load configuration from a `HashMap` (for testing).
    pub fn from_vars(vars: &HashMap<String, String>) -> Result<Self, ConfigError> {
        let redis_url = SecretString::from(
            vars.get("REDIS_URL")
                .ok_or_else(|| ConfigError::MissingEnvVar("REDIS_URL".to_string()))?
                .clone(),
        );

        let database_url = vars
            .get("DATABASE_URL")
            .filter(|s| !s.is_empty())
            .map(|s| SecretString::from(s.clone()));

        let ws_bind_address = string_var(vars, "SIG_WS_BIND_ADDRESS", DEFAULT_WS_BIND_ADDRESS);
        let grpc_bind_address =
            string_var(vars, "SIG_GRPC_BIND_ADDRESS", DEFAULT_GRPC_BIND_ADDRESS);
        let health_bind_address =
            string_var(vars, "SIG_HEALTH_BIND_ADDRESS", DEFAULT_HEALTH_BIND_ADDRESS);

        // Peers cannot dial a wildcard address
        let advertise_address = InstanceAddr::new(
            vars.get("SIG_ADVERTISE_ADDRESS")
                .cloned()
                .unwrap_or_else(|| grpc_bind_address.replace("0.0.0.0", "127.0.0.1")),
        );

        let heartbeat_timeout_seconds = positive_var(
            vars,
            "SIG_HEARTBEAT_TIMEOUT_SECONDS",
            DEFAULT_HEARTBEAT_TIMEOUT_SECONDS,
        )?;
        let outbound_queue_capacity = positive_var(
            vars,
            "SIG_OUTBOUND_QUEUE_CAPACITY",
            DEFAULT_OUTBOUND_QUEUE_CAPACITY,
        )?;
        let registry_queue_capacity = positive_var(
            vars,
            "SIG_REGISTRY_QUEUE_CAPACITY",
            DEFAULT_REGISTRY_QUEUE_CAPACITY,
        )?;
        let presence_ttl_seconds = positive_var(
            vars,
            "SIG_PRESENCE_TTL_SECONDS",
            DEFAULT_PRESENCE_TTL_SECONDS,
        )?;
        let instance_ttl_seconds = positive_var(
            vars,
            "SIG_INSTANCE_TTL_SECONDS",
            DEFAULT_INSTANCE_TTL_SECONDS,
        )?;
        let sweep_interval_seconds = positive_var(
            vars,
            "SIG_SWEEP_INTERVAL_SECONDS",
            DEFAULT_SWEEP_INTERVAL_SECONDS,
        )?;
        let sweep_initial_delay_seconds = parse_var(
            vars,
            "SIG_SWEEP_INITIAL_DELAY_SECONDS",
            DEFAULT_SWEEP_INITIAL_DELAY_SECONDS,
        )?;
        let liveness_interval_seconds = positive_var(
            vars,
            "SIG_LIVENESS_INTERVAL_SECONDS",
            DEFAULT_LIVENESS_INTERVAL_SECONDS,
        )?;
        let liveness_initial_delay_seconds = parse_var(
            vars,
            "SIG_LIVENESS_INITIAL_DELAY_SECONDS",
            DEFAULT_LIVENESS_INITIAL_DELAY_SECONDS,
        )?;
        let rpc_timeout_ms = positive_var(vars, "SIG_RPC_TIMEOUT_MS", DEFAULT_RPC_TIMEOUT_MS)?;
        let cache_timeout_ms =
            positive_var(vars, "SIG_CACHE_TIMEOUT_MS", DEFAULT_CACHE_TIMEOUT_MS)?;

        if liveness_interval_seconds >= instance_ttl_seconds {
            return Err(ConfigError::InvalidValue(format!(
                "SIG_LIVENESS_INTERVAL_SECONDS ({liveness_interval_seconds}) must be less than \
                 SIG_INSTANCE_TTL_SECONDS ({instance_ttl_seconds})"
            )));
        }

        let room_ids = match vars.get("SIG_ROOM_IDS") {
            Some(raw) => parse_room_ids(raw)?,
            None => DEFAULT_ROOM_IDS.iter().copied().map(RoomId).collect(),
        };

        let stun_urls = list_var(vars, "SIG_STUN_URLS");
        let turn_urls = list_var(vars, "SIG_TURN_URLS");
        let turn_username = vars.get("SIG_TURN_USERNAME").cloned();
        let turn_credential = vars
            .get("SIG_TURN_CREDENTIAL")
            .map(|s| SecretString::from(s.clone()));

        Ok(Config {
            redis_url,
            database_url,
            ws_bind_address,
            grpc_bind_address,
            health_bind_address,
            advertise_address,
            heartbeat_timeout_seconds,
            outbound_queue_capacity,
            registry_queue_capacity,
            presence_ttl_seconds,
            instance_ttl_seconds,
            sweep_interval_seconds,
            sweep_initial_delay_seconds,
            liveness_interval_seconds,
            liveness_initial_delay_seconds,
            rpc_timeout_ms,
            cache_timeout_ms,
            room_ids,
            stun_urls,
            turn_urls,
            turn_username,
            turn_credential,
        })
    }

    /// ICE servers handed to clients in `createRTCPeerConnection`.
    ///
    /// The TURN credential is exposed here on purpose: clients need it to
    /// allocate relays.
    #[must_use]
    pub fn ice_servers(&self) -> Vec<IceServer> {
        let mut servers = Vec::new();
        if !self.stun_urls.is_empty() {
            servers.push(IceServer {
                urls: self.stun_urls.clone(),
                username: None,
                credential: None,
            });
        }
        if !self.turn_urls.is_empty() {
            servers.push(IceServer {
                urls: self.turn_urls.clone(),
                username: self.turn_username.clone(),
                credential: self
                    .turn_credential
                    .as_ref()
                    .map(|c| c.expose_secret().to_string()),
            });
        }
        servers
    }

    #[must_use]
    pub fn rpc_timeout(&self) -> Duration {
        Duration::from_millis(self.rpc_timeout_ms)
    }

    #[must_use]
    pub fn cache_timeout(&self) -> Duration {
        Duration::from_millis(self.cache_timeout_ms)
    }
}

fn string_var(vars: &HashMap<String, String>, name: &str, default: &str) -> String {
    vars.get(name)
        .cloned()
        .unwrap_or_else(|| default.to_string())
}

fn parse_var<T: FromStr>(
    vars: &HashMap<String, String>,
    name: &str,
    default: T,
) -> Result<T, ConfigError> {
    match vars.get(name) {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|_| ConfigError::InvalidValue(format!("{name} is not a valid number: {raw}"))),
        None => Ok(default),
    }
}

fn positive_var<T: FromStr + Default + PartialEq>(
    vars: &HashMap<String, String>,
    name: &str,
    default: T,
) -> Result<T, ConfigError> {
    let value = parse_var(vars, name, default)?;
    if value == T::default() {
        return Err(ConfigError::InvalidValue(format!("{name} must be greater than zero")));
    }
    Ok(value)
}

fn list_var(vars: &HashMap<String, String>, name: &str) -> Vec<String> {
    vars.get(name)
        .map(|raw| {
            raw.split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(ToString::to_string)
                .collect()
        })
        .unwrap_or_default()
}

fn parse_room_ids(raw: &str) -> Result<Vec<RoomId>, ConfigError> {
    let mut rooms = Vec::new();
    for part in raw.split(',').map(str::trim).filter(|s| !s.is_empty()) {
        let id: u64 = part
            .parse()
            .map_err(|_| ConfigError::InvalidValue(format!("SIG_ROOM_IDS entry: {part}")))?;
        if id == 0 {
            return Err(ConfigError::InvalidValue(
                "SIG_ROOM_IDS must not contain 0".to_string(),
            ));
        }
        rooms.push(RoomId(id));
    }
    if rooms.is_empty() {
        return Err(ConfigError::InvalidValue(
            "SIG_ROOM_IDS must list at least one room".to_string(),
        ));
    }
    Ok(rooms)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn base_vars() -> HashMap<String, String> {
        HashMap::from([(
            "REDIS_URL".to_string(),
            "redis://localhost:6379".to_string(),
        )])
    }

    #[test]
    fn test_from_vars_success_with_defaults() {
        let config = Config::from_vars(&base_vars()).expect("Config should load successfully");

        assert_eq!(config.redis_url.expose_secret(), "redis://localhost:6379");
        assert!(config.database_url.is_none());
        assert_eq!(config.ws_bind_address, DEFAULT_WS_BIND_ADDRESS);
        assert_eq!(config.grpc_bind_address, DEFAULT_GRPC_BIND_ADDRESS);
        assert_eq!(config.health_bind_address, DEFAULT_HEALTH_BIND_ADDRESS);
        assert_eq!(config.advertise_address.as_str(), "127.0.0.1:50061");
        assert_eq!(
            config.heartbeat_timeout_seconds,
            DEFAULT_HEARTBEAT_TIMEOUT_SECONDS
        );
        assert_eq!(config.outbound_queue_capacity, 100);
        assert_eq!(config.registry_queue_capacity, 1000);
        assert_eq!(config.presence_ttl_seconds, 86_400);
        assert_eq!(config.instance_ttl_seconds, 180);
        assert_eq!(config.sweep_interval_seconds, 3);
        assert_eq!(config.liveness_interval_seconds, 2);
        assert_eq!(config.rpc_timeout(), Duration::from_secs(1));
        assert_eq!(
            config.room_ids,
            vec![RoomId(101), RoomId(102), RoomId(103), RoomId(104)]
        );
        assert!(config.ice_servers().is_empty());
    }

    #[test]
    fn test_from_vars_success_with_custom_values() {
        let mut vars = base_vars();
        vars.insert(
            "SIG_ADVERTISE_ADDRESS".to_string(),
            "10.1.2.3:50061".to_string(),
        );
        vars.insert("SIG_HEARTBEAT_TIMEOUT_SECONDS".to_string(), "90".to_string());
        vars.insert("SIG_ROOM_IDS".to_string(), " 7, 8 ,9".to_string());
        vars.insert(
            "DATABASE_URL".to_string(),
            "postgres://sig:pw@db/sig".to_string(),
        );

        let config = Config::from_vars(&vars).expect("Config should load successfully");

        assert_eq!(config.advertise_address.as_str(), "10.1.2.3:50061");
        assert_eq!(config.heartbeat_timeout_seconds, 90);
        assert_eq!(config.room_ids, vec![RoomId(7), RoomId(8), RoomId(9)]);
        assert_eq!(
            config.database_url.as_ref().unwrap().expose_secret(),
            "postgres://sig:pw@db/sig"
        );
    }

    #[test]
    fn test_missing_redis_url() {
        let result = Config::from_vars(&HashMap::new());
        assert!(matches!(result, Err(ConfigError::MissingEnvVar(v)) if v == "REDIS_URL"));
    }

    #[test]
    fn test_invalid_numbers_rejected() {
        let mut vars = base_vars();
        vars.insert(
            "SIG_OUTBOUND_QUEUE_CAPACITY".to_string(),
            "lots".to_string(),
        );
        assert!(matches!(
            Config::from_vars(&vars),
            Err(ConfigError::InvalidValue(_))
        ));

        let mut vars = base_vars();
        vars.insert("SIG_REGISTRY_QUEUE_CAPACITY".to_string(), "0".to_string());
        assert!(matches!(
            Config::from_vars(&vars),
            Err(ConfigError::InvalidValue(_))
        ));
    }

    #[test]
    fn test_liveness_interval_must_be_below_ttl() {
        let mut vars = base_vars();
        vars.insert("SIG_INSTANCE_TTL_SECONDS".to_string(), "5".to_string());
        vars.insert("SIG_LIVENESS_INTERVAL_SECONDS".to_string(), "5".to_string());
        assert!(matches!(
            Config::from_vars(&vars),
            Err(ConfigError::InvalidValue(_))
        ));
    }

    #[test]
    fn test_room_ids_reject_zero_and_empty() {
        let mut vars = base_vars();
        vars.insert("SIG_ROOM_IDS".to_string(), "101,0".to_string());
        assert!(Config::from_vars(&vars).is_err());

        vars.insert("SIG_ROOM_IDS".to_string(), " , ".to_string());
        assert!(Config::from_vars(&vars).is_err());
    }

    #[test]
    fn test_ice_servers_from_stun_and_turn() {
        let mut vars = base_vars();
        vars.insert(
            "SIG_STUN_URLS".to_string(),
            "stun:stun1.example.com:3478,stun:stun2.example.com:3478".to_string(),
        );
        vars.insert(
            "SIG_TURN_URLS".to_string(),
            "turn:turn.example.com:3478".to_string(),
        );
        vars.insert("SIG_TURN_USERNAME".to_string(), "webrtc".to_string());
        vars.insert("SIG_TURN_CREDENTIAL".to_string(), "s3cr3t".to_string());

        let config = Config::from_vars(&vars).unwrap();
        let servers = config.ice_servers();

        assert_eq!(servers.len(), 2);
        let stun = servers.first().unwrap();
        assert_eq!(stun.urls.len(), 2);
        assert!(stun.credential.is_none());
        let turn = servers.last().unwrap();
        assert_eq!(turn.username.as_deref(), Some("webrtc"));
        assert_eq!(turn.credential.as_deref(), Some("s3cr3t"));
    }

    #[test]
    fn test_debug_redacts_secrets() {
        let mut vars = base_vars();
        vars.insert(
            "REDIS_URL".to_string(),
            "redis://:hunter2@cache:6379".to_string(),
        );
        vars.insert("SIG_TURN_CREDENTIAL".to_string(), "s3cr3t".to_string());
        vars.insert(
            "DATABASE_URL".to_string(),
            "postgres://u:dbpass@db/sig".to_string(),
        );

        let config = Config::from_vars(&vars).unwrap();
        let debug_str = format!("{config:?}");

        assert!(debug_str.contains("[REDACTED]"));
        assert!(!debug_str.contains("hunter2"));
        assert!(!debug_str.contains("s3cr3t"));
        assert!(!debug_str.contains("dbpass"));
    }
}
