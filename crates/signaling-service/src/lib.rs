//! Signaling Service Library
//!
//! A horizontally scalable WebRTC signaling backbone. Clients hold one
//! WebSocket each; the service authenticates them into rooms, forwards SDP
//! and ICE payloads between peers, fans out room events and tracks presence
//! across every instance of the cluster.
//!
//! # Architecture
//!
//! ```text
//!   client ──ws──▶ session tasks ──▶ Router ──▶ handlers
//!                       │                         │
//!                       ▼                         ▼
//!                 RegistryActor ◀────────────── Relay ──gRPC──▶ peer instance
//!                       │                         │
//!                       └────── PresenceStore ◀───┘   (Redis)
//! ```
//!
//! - One registry actor per instance owns connection membership, the user
//!   index and peer descriptors. Reads go through shared snapshots.
//! - Presence records and the live instance set live in Redis with TTLs.
//! - Instances reach each other's users through the `SignalRelay` gRPC
//!   service.
//!
//! # Modules
//!
//! - [`config`] - Service configuration from environment
//! - [`context`] - Shared application context
//! - [`registry`] - Connection and room membership
//! - [`router`] - Command dispatch and handlers
//! - [`relay`] - Cross-instance delivery
//! - [`presence`] - Presence cache
//! - [`reaper`] - Heartbeat sweep and liveness publishing

pub mod clock;
pub mod config;
pub mod context;
pub mod directory;
pub mod errors;
pub mod observability;
pub mod presence;
pub mod protocol;
pub mod reaper;
pub mod registry;
pub mod relay;
pub mod router;
pub mod session;
pub mod ws;
