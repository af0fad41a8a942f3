//! Shared application context.
//!
//! Everything a session, handler or server task needs is reached through one
//! `Arc<AppContext>` built at startup.

use crate::clock;
use crate::config::Config;
use crate::directory::{Directory, TokenVerifier};
use crate::observability::metrics;
use crate::presence::PresenceStore;
use crate::registry::{RegistryHandle, RegistrySettings};
use crate::relay::{Relay, RelayClient};
use crate::router::Router;
use crate::session::Connection;
use common::types::InstanceAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

pub struct AppContext {
    pub instance: InstanceAddr,
    pub registry: RegistryHandle,
    pub presence: Arc<dyn PresenceStore>,
    pub relay: Arc<Relay>,
    pub directory: Arc<dyn Directory>,
    pub tokens: Arc<dyn TokenVerifier>,
    pub router: Router,
    heartbeat_window: u64,
    outbound_capacity: usize,
    next_connection_id: AtomicU64,
}

impl AppContext {
    /// Build the context and spawn the registry consumer under
    /// `cancel_token`.
    #[must_use]
    pub fn new(
        config: &Config,
        presence: Arc<dyn PresenceStore>,
        directory: Arc<dyn Directory>,
        tokens: Arc<dyn TokenVerifier>,
        relay_client: Arc<dyn RelayClient>,
        cancel_token: CancellationToken,
    ) -> Arc<Self> {
        let instance = config.advertise_address.clone();
        let registry = RegistryHandle::new(
            RegistrySettings {
                queue_capacity: config.registry_queue_capacity,
                instance: instance.clone(),
                ice_servers: config.ice_servers(),
            },
            Arc::clone(&presence),
            cancel_token,
        );
        let relay = Arc::new(Relay::new(
            registry.clone(),
            Arc::clone(&presence),
            relay_client,
            instance.clone(),
            config.room_ids.clone(),
            config.heartbeat_timeout_seconds,
        ));

        Arc::new(Self {
            instance,
            registry,
            presence,
            relay,
            directory,
            tokens,
            router: Router::new(),
            heartbeat_window: config.heartbeat_timeout_seconds,
            outbound_capacity: config.outbound_queue_capacity,
            next_connection_id: AtomicU64::new(1),
        })
    }

    /// Create a connection for a freshly accepted transport. The caller
    /// registers it and starts its session.
    #[must_use]
    pub fn open_connection(&self, client_addr: String) -> (Arc<Connection>, mpsc::Receiver<String>) {
        let id = self.next_connection_id.fetch_add(1, Ordering::Relaxed);
        let (conn, outbound_rx) = Connection::new(
            id,
            client_addr,
            clock::unix_now(),
            self.heartbeat_window,
            self.outbound_capacity,
        );
        metrics::record_connection_opened();
        (Arc::new(conn), outbound_rx)
    }

    /// Online window in seconds, shared by the local heartbeat timeout and
    /// presence records.
    #[must_use]
    pub fn heartbeat_window(&self) -> u64 {
        self.heartbeat_window
    }
}
