//! Common types shared across the signaling workspace crates.

#![warn(clippy::pedantic)]

/// Module for identifier and key types
pub mod types;

/// Module for secret types that prevent accidental logging
pub mod secret;
