//! # Signaling Test Utilities
//!
//! Shared test utilities for the signaling service.
//!
//! This crate provides mock implementations and fixtures for isolated
//! testing without Redis, Postgres or peer instances.
//!
//! ## Modules
//!
//! - `mock_presence` - In-memory presence store with a mock clock
//! - `mock_relay` - Relay client that records calls instead of dialing
//! - `fixtures` - Test config, a wired [`TestHarness`] and [`TestClient`]
//!
//! ## Usage
//!
//! ```rust,ignore
//! use signaling_test_utils::*;
//!
//! #[tokio::test]
//! async fn test_example() {
//!     let harness = TestHarness::new();
//!     let mut alice = harness.logged_in(TEST_ROOM, 1).await;
//!     let mut bob = harness.logged_in(TEST_ROOM, 2).await;
//!
//!     let push = alice.expect_push("connect").await;
//!     assert_eq!(push.data["userId"], 2);
//! }
//! ```

pub mod fixtures;
pub mod mock_presence;
pub mod mock_relay;

// Re-export commonly used items
pub use fixtures::*;
pub use mock_presence::*;
pub use mock_relay::*;
