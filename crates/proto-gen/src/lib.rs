//! Generated Protocol Buffer code for the signaling relay.
//!
//! This crate contains the compiled definitions of the instance-to-instance
//! relay service, with both the tonic client and server stubs.

#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::doc_markdown)] // Generated code has various doc formatting
#![allow(clippy::default_trait_access)]
#![allow(clippy::too_many_lines)]

// Re-export prost traits for convenience
pub use prost::Message;

// Generated protobuf modules
pub mod relay {
    //! Instance-to-instance relay messages and service
    include!("generated/signal.relay.rs");
}
