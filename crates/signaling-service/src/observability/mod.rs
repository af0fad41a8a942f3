//! Observability: Prometheus metrics plus health, readiness and stats
//! endpoints.

pub mod health;
pub mod metrics;

pub use health::{health_router, stats_router, HealthState};
