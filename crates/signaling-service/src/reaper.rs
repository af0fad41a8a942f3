//! Periodic background jobs.
//!
//! Two jobs run for the life of the instance:
//!
//! - **Connection sweep**: closes connections whose last heartbeat is older
//!   than the heartbeat window. The session teardown then unregisters them.
//! - **Liveness publisher**: refreshes this instance's entry in the live
//!   instance set, and removes it on shutdown.
//!
//! A panicking tick is logged and counted; the job keeps running.

use crate::clock;
use crate::observability::metrics;
use crate::presence::{PresenceStore, ServerInfo};
use crate::registry::RegistryHandle;
use common::types::InstanceAddr;
use futures_util::FutureExt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

/// Run `tick` every `period`, first after `initial_delay`, until `cancel`.
///
/// Missed ticks are skipped rather than bunched.
pub async fn run_periodic<F, Fut>(
    name: &'static str,
    initial_delay: Duration,
    period: Duration,
    cancel: CancellationToken,
    mut tick: F,
) where
    F: FnMut() -> Fut,
    Fut: Future<Output = ()>,
{
    let mut ticker = interval_at(Instant::now() + initial_delay, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    info!(
        target: "sig.reaper",
        job = name,
        initial_delay_ms = initial_delay.as_millis(),
        period_ms = period.as_millis(),
        "Periodic job started"
    );

    loop {
        tokio::select! {
            () = cancel.cancelled() => {
                info!(target: "sig.reaper", job = name, "Periodic job stopping");
                break;
            }
            _ = ticker.tick() => {
                if AssertUnwindSafe(tick()).catch_unwind().await.is_err() {
                    error!(target: "sig.reaper", job = name, "Periodic job tick panicked");
                    metrics::record_reaper_panic(name);
                }
            }
        }
    }
}

/// Close every connection that missed its heartbeat window. Returns the
/// number closed.
#[instrument(skip_all, name = "sig.reaper.sweep")]
pub async fn sweep_connections(registry: &RegistryHandle, now: u64) -> usize {
    let mut evicted = 0;
    for conn in registry.connections().await {
        if conn.is_transport_closed() || !conn.is_heartbeat_timeout(now) {
            continue;
        }
        info!(
            target: "sig.reaper",
            connection_id = conn.id(),
            client_addr = %conn.client_addr(),
            room_id = %conn.room_id(),
            user_id = %conn.user_id(),
            last_heartbeat = conn.heartbeat_time(),
            "Closing connection after heartbeat timeout"
        );
        conn.close_transport();
        evicted += 1;
    }

    if evicted > 0 {
        metrics::record_reaper_evictions(evicted);
    }
    evicted
}

/// Spawn the connection sweep.
pub fn spawn_connection_sweep(
    registry: RegistryHandle,
    initial_delay: Duration,
    period: Duration,
    cancel: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        run_periodic("connection_sweep", initial_delay, period, cancel, || {
            let registry = registry.clone();
            async move {
                let evicted = sweep_connections(&registry, clock::unix_now()).await;
                debug!(target: "sig.reaper", evicted, "Sweep complete");
            }
        })
        .await;
    })
}

/// Publish this instance as live once.
pub async fn publish_liveness(presence: &dyn PresenceStore, instance: &InstanceAddr) {
    let info = ServerInfo {
        addr: instance.clone(),
        timestamp: clock::unix_now(),
    };
    if let Err(e) = presence.set_server_info(&info).await {
        warn!(target: "sig.reaper", instance = %instance, error = %e, "Liveness publish failed");
    }
}

/// Spawn the liveness publisher. Its entry is withdrawn once `cancel`
/// fires.
pub fn spawn_liveness_publisher(
    presence: Arc<dyn PresenceStore>,
    instance: InstanceAddr,
    initial_delay: Duration,
    period: Duration,
    cancel: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        run_periodic("liveness_publisher", initial_delay, period, cancel, || {
            let presence = Arc::clone(&presence);
            let instance = instance.clone();
            async move { publish_liveness(presence.as_ref(), &instance).await }
        })
        .await;

        match presence.del_server_info(&instance).await {
            Ok(()) => info!(target: "sig.reaper", instance = %instance, "Liveness entry withdrawn"),
            Err(e) => {
                warn!(target: "sig.reaper", instance = %instance, error = %e, "Liveness withdrawal failed");
            }
        }
    })
}
