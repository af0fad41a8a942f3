//! Identifier types for rooms, users, presence keys and instances.
//!
//! Room and user ids are positive integers on the wire. Zero is never a
//! valid id: a zero `UserId` marks a connection that has not logged in, and
//! a zero `RoomId` is the "all rooms" wildcard in online queries.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Numeric room identifier.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct RoomId(pub u64);

impl RoomId {
    /// Wildcard used by online queries to mean "any configured room".
    pub const ALL: RoomId = RoomId(0);

    /// True for any id other than zero.
    #[must_use]
    pub const fn is_valid(self) -> bool {
        self.0 > 0
    }
}

impl fmt::Display for RoomId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Numeric user identifier.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct UserId(pub u64);

impl UserId {
    /// Placeholder held by connections that have not logged in.
    pub const NONE: UserId = UserId(0);

    /// True for any id other than zero.
    #[must_use]
    pub const fn is_valid(self) -> bool {
        self.0 > 0
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Key of a logged-in user: `"{room}_{user}"`.
///
/// Used both for the in-process user index and as the suffix of the
/// shared-cache presence key, so both sides agree on identity.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PresenceKey(String);

impl PresenceKey {
    #[must_use]
    pub fn new(room_id: RoomId, user_id: UserId) -> Self {
        Self(format!("{room_id}_{user_id}"))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PresenceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Advertised `host:port` of an instance's relay (gRPC) server.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct InstanceAddr(String);

impl InstanceAddr {
    #[must_use]
    pub fn new(addr: impl Into<String>) -> Self {
        Self(addr.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// URI used to dial the instance's relay server.
    #[must_use]
    pub fn endpoint_uri(&self) -> String {
        format!("http://{}", self.0)
    }
}

impl fmt::Display for InstanceAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
