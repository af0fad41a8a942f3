//! Health and stats endpoints.
//!
//! - `GET /health` - Liveness probe (is the process running?)
//! - `GET /ready` - Readiness probe: startup finished, the registry consumer
//!   is running and the presence cache answers PING
//! - `GET /stats` - Registry counts and the live instance set
//!
//! The `/metrics` endpoint is served separately by
//! `metrics-exporter-prometheus` on the same listener.

use crate::clock;
use crate::context::AppContext;
use axum::{extract::State, http::StatusCode, routing::get, Json, Router};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::debug;

/// Liveness and readiness flags.
#[derive(Debug)]
pub struct HealthState {
    live: AtomicBool,
    ready: AtomicBool,
}

impl Default for HealthState {
    fn default() -> Self {
        Self::new()
    }
}

impl HealthState {
    /// Create a new health state (live=true, ready=false).
    #[must_use]
    pub fn new() -> Self {
        Self {
            live: AtomicBool::new(true),
            ready: AtomicBool::new(false),
        }
    }

    pub fn set_ready(&self) {
        self.ready.store(true, Ordering::SeqCst);
    }

    /// Mark the service as not ready (e.g., during shutdown).
    pub fn set_not_ready(&self) {
        self.ready.store(false, Ordering::SeqCst);
    }

    #[must_use]
    pub fn is_live(&self) -> bool {
        self.live.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }
}

#[derive(Clone)]
struct ProbeState {
    health: Arc<HealthState>,
    ctx: Arc<AppContext>,
}

/// Router with `/health` and `/ready`.
pub fn health_router(health_state: Arc<HealthState>, ctx: Arc<AppContext>) -> Router {
    Router::new()
        .route("/health", get(liveness_handler))
        .route("/ready", get(readiness_handler))
        .with_state(ProbeState {
            health: health_state,
            ctx,
        })
}

async fn liveness_handler(State(state): State<ProbeState>) -> StatusCode {
    if state.health.is_live() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    }
}

async fn readiness_handler(State(state): State<ProbeState>) -> StatusCode {
    if !state.health.is_ready() || !state.ctx.registry.is_running() {
        return StatusCode::SERVICE_UNAVAILABLE;
    }
    match state.ctx.presence.ping().await {
        Ok(()) => StatusCode::OK,
        Err(e) => {
            debug!(target: "sig.health", error = %e, "Readiness probe failed presence ping");
            StatusCode::SERVICE_UNAVAILABLE
        }
    }
}

/// Body of `GET /stats`.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatsResponse {
    pub instance: String,
    pub connections: usize,
    pub users: usize,
    pub rooms: usize,
    /// `None` when the presence cache could not be read.
    pub live_instances: Option<Vec<String>>,
}

/// Router with `/stats`.
pub fn stats_router(ctx: Arc<AppContext>) -> Router {
    Router::new()
        .route("/stats", get(stats_handler))
        .with_state(ctx)
}

async fn stats_handler(State(ctx): State<Arc<AppContext>>) -> Json<StatsResponse> {
    let stats = ctx.registry.stats().await;
    let live_instances = ctx
        .presence
        .get_server_all(clock::unix_now())
        .await
        .map(|servers| servers.into_iter().map(|s| s.addr.to_string()).collect())
        .ok();

    Json(StatsResponse {
        instance: ctx.instance.to_string(),
        connections: stats.connections,
        users: stats.users,
        rooms: stats.rooms,
        live_instances,
    })
}
