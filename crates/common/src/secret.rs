//! Secret wrappers for credentials carried in configuration.
//!
//! Re-exports the `secrecy` types so every crate in the workspace redacts
//! Redis/Postgres URLs and TURN credentials the same way. `Debug` prints
//! `[REDACTED]`; reading the value requires an explicit `expose_secret()`.

pub use secrecy::{ExposeSecret, SecretBox, SecretString};
