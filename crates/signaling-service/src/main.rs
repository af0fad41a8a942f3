//! Signaling Service
//!
//! WebRTC signaling and presence backbone.
//!
//! # Servers
//!
//! Each instance runs three servers:
//! - WebSocket server for clients (default: 0.0.0.0:8080, path `/ws`)
//! - gRPC relay server for peer instances (default: 0.0.0.0:50061)
//! - HTTP server for health, stats and metrics (default: 0.0.0.0:8081)
//!
//! # Startup Flow
//!
//! 1. Load configuration from environment
//! 2. Initialize Prometheus metrics recorder
//! 3. Connect to Redis (presence cache)
//! 4. Open the user/room directory (Postgres if configured)
//! 5. Build the application context and spawn the registry actor
//! 6. Start health, relay and WebSocket servers
//! 7. Start the connection sweep and liveness publisher
//! 8. Wait for shutdown signal

#![warn(clippy::pedantic)]
#![allow(clippy::too_many_lines)] // main.rs orchestrates startup, naturally longer

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use proto_gen::relay::signal_relay_server::SignalRelayServer;
use signaling_service::config::Config;
use signaling_service::context::AppContext;
use signaling_service::directory::{AcceptAnyToken, Directory, PgDirectory, StaticDirectory};
use signaling_service::errors::SignalingError;
use signaling_service::observability::metrics::init_metrics_recorder;
use signaling_service::observability::{health_router, stats_router, HealthState};
use signaling_service::presence::{PresenceStore, RedisPresenceStore};
use signaling_service::reaper;
use signaling_service::relay::{GrpcRelayClient, RelayService};
use signaling_service::ws::ws_router;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Grace period for in-flight sessions after the servers stop accepting.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "signaling_service=info,sig=info,tower_http=info".into());
    if std::env::var("LOG_FORMAT").is_ok_and(|f| f == "json") {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }

    info!("Starting Signaling Service");

    // Load configuration
    let config = Config::from_env().map_err(fatal)?;

    info!(
        ws_bind_address = %config.ws_bind_address,
        grpc_bind_address = %config.grpc_bind_address,
        health_bind_address = %config.health_bind_address,
        advertise_address = %config.advertise_address,
        heartbeat_timeout_seconds = config.heartbeat_timeout_seconds,
        instance_ttl_seconds = config.instance_ttl_seconds,
        "Configuration loaded successfully"
    );

    // Must happen before any metrics are recorded
    let prometheus_handle = init_metrics_recorder()
        .map_err(|e| fatal(SignalingError::Metrics(e)))?;
    info!("Prometheus metrics recorder initialized");

    let health_state = Arc::new(HealthState::new());

    info!("Connecting to Redis...");
    let presence: Arc<dyn PresenceStore> = Arc::new(
        RedisPresenceStore::connect(&config)
            .await
            .map_err(fatal)?,
    );
    info!("Redis connection established");

    let directory: Arc<dyn Directory> = match &config.database_url {
        Some(url) => {
            info!("Connecting to Postgres directory...");
            Arc::new(PgDirectory::connect(url).await.map_err(fatal)?)
        }
        None => {
            info!(rooms = config.room_ids.len(), "No DATABASE_URL, using static directory");
            Arc::new(StaticDirectory::new(&config.room_ids))
        }
    };

    let shutdown_token = CancellationToken::new();

    let ctx = AppContext::new(
        &config,
        Arc::clone(&presence),
        directory,
        Arc::new(AcceptAnyToken),
        Arc::new(GrpcRelayClient::new(config.rpc_timeout())),
        shutdown_token.child_token(),
    );
    info!(instance = %ctx.instance, "Registry started");

    // Health server: liveness, readiness, stats and /metrics
    let health_addr = parse_bind_address("health", &config.health_bind_address)?;

    let metrics_router = Router::new().route(
        "/metrics",
        axum::routing::get(move || {
            let handle = prometheus_handle.clone();
            async move { handle.render() }
        }),
    );
    let health_app = health_router(Arc::clone(&health_state), Arc::clone(&ctx))
        .merge(stats_router(Arc::clone(&ctx)))
        .merge(metrics_router);

    // Bind listener BEFORE spawning to fail fast on bind errors
    let health_listener = tokio::net::TcpListener::bind(health_addr)
        .await
        .map_err(|e| transport_failure("health", &e))?;

    let health_shutdown_token = shutdown_token.child_token();
    tokio::spawn(async move {
        info!(addr = %health_addr, "Health server starting");
        let server = axum::serve(health_listener, health_app).with_graceful_shutdown(async move {
            health_shutdown_token.cancelled().await;
            info!("Health server shutting down");
        });
        if let Err(e) = server.await {
            transport_failure("health", &e);
        }
    });

    // Relay gRPC server
    let grpc_addr = parse_bind_address("gRPC", &config.grpc_bind_address)?;

    let grpc_shutdown_token = shutdown_token.child_token();
    let grpc_server = tonic::transport::Server::builder()
        .add_service(SignalRelayServer::new(RelayService::new(Arc::clone(&ctx.relay))))
        .serve_with_shutdown(grpc_addr, async move {
            grpc_shutdown_token.cancelled().await;
            info!("gRPC server shutting down");
        });
    tokio::spawn(async move {
        info!(addr = %grpc_addr, "gRPC relay server starting");
        if let Err(e) = grpc_server.await {
            transport_failure("gRPC", &e);
        }
    });

    // WebSocket server
    let ws_addr = parse_bind_address("WebSocket", &config.ws_bind_address)?;
    let ws_listener = tokio::net::TcpListener::bind(ws_addr)
        .await
        .map_err(|e| transport_failure("WebSocket", &e))?;

    let ws_app = ws_router(Arc::clone(&ctx)).layer(TraceLayer::new_for_http());
    let ws_shutdown_token = shutdown_token.child_token();
    tokio::spawn(async move {
        info!(addr = %ws_addr, "WebSocket server starting");
        let server = axum::serve(
            ws_listener,
            ws_app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(async move {
            ws_shutdown_token.cancelled().await;
            info!("WebSocket server shutting down");
        });
        if let Err(e) = server.await {
            transport_failure("WebSocket", &e);
        }
    });

    // Background jobs
    let sweep = reaper::spawn_connection_sweep(
        ctx.registry.clone(),
        Duration::from_secs(config.sweep_initial_delay_seconds),
        Duration::from_secs(config.sweep_interval_seconds),
        shutdown_token.child_token(),
    );
    let liveness = reaper::spawn_liveness_publisher(
        Arc::clone(&presence),
        ctx.instance.clone(),
        Duration::from_secs(config.liveness_initial_delay_seconds),
        Duration::from_secs(config.liveness_interval_seconds),
        shutdown_token.child_token(),
    );

    health_state.set_ready();
    info!("Signaling Service running - press Ctrl+C to shutdown");

    shutdown_signal().await;

    info!("Shutdown signal received, initiating graceful shutdown...");

    // Mark as not ready immediately so k8s stops sending traffic
    health_state.set_not_ready();

    // Propagates to the servers, the registry actor and both jobs
    shutdown_token.cancel();

    // The liveness publisher withdraws this instance's entry on exit
    if let Err(e) = liveness.await {
        warn!(error = %e, "Liveness publisher task failed");
    }
    if let Err(e) = sweep.await {
        warn!(error = %e, "Connection sweep task failed");
    }

    tokio::time::sleep(SHUTDOWN_GRACE).await;

    info!("Signaling Service shutdown complete");
    Ok(())
}

/// Log a fatal startup error with its type label and hand it back.
fn fatal(e: impl Into<SignalingError>) -> SignalingError {
    let e = e.into();
    error!(error = %e, error_type = e.error_type_label(), "Startup failed");
    e
}

fn parse_bind_address(server: &'static str, addr: &str) -> Result<SocketAddr, SignalingError> {
    addr.parse().map_err(|e: std::net::AddrParseError| {
        fatal(SignalingError::BindAddress {
            server,
            addr: addr.to_string(),
            message: e.to_string(),
        })
    })
}

/// Log a server transport failure (bind or serve) and return it.
fn transport_failure(server: &'static str, e: &dyn std::fmt::Display) -> SignalingError {
    let e = SignalingError::Transport {
        server,
        message: e.to_string(),
    };
    error!(error = %e, error_type = e.error_type_label(), "Server transport failed");
    e
}

#[expect(
    clippy::expect_used,
    reason = "Signal handler installation failure is unrecoverable at startup"
)]
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }
}
