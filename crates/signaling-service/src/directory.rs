//! User and room directory, and bearer-token verification.
//!
//! Login consults a [`Directory`] to confirm that the user and room exist
//! and to resolve display names. With `DATABASE_URL` set the service reads
//! the `users` and `rooms` tables through [`PgDirectory`]; otherwise the
//! configured room set backs a [`StaticDirectory`].
//!
//! # Security
//!
//! - All queries use parameterized statements
//! - Tokens are never logged

use crate::errors::DirectoryError;
use async_trait::async_trait;
use common::secret::{ExposeSecret, SecretString};
use common::types::{RoomId, UserId};
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Row};
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, error, instrument};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserRecord {
    pub id: UserId,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoomRecord {
    pub id: RoomId,
    pub name: String,
}

/// Lookup of users and rooms by id. Absence is `Ok(None)`.
#[async_trait]
pub trait Directory: Send + Sync {
    async fn find_user(&self, id: UserId) -> Result<Option<UserRecord>, DirectoryError>;
    async fn find_room(&self, id: RoomId) -> Result<Option<RoomRecord>, DirectoryError>;
}

/// Identity proven by a login token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifiedIdentity {
    pub user_id: UserId,
    pub name: String,
}

/// Validates the login token.
///
/// `Ok(None)` means the verifier makes no claim about the token; login then
/// trusts the ids in the request. `Ok(Some(identity))` must match the
/// requested user.
#[async_trait]
pub trait TokenVerifier: Send + Sync {
    async fn verify(&self, token: &str) -> Result<Option<VerifiedIdentity>, DirectoryError>;
}

/// Verifier that accepts every token without asserting an identity.
#[derive(Debug, Clone, Copy, Default)]
pub struct AcceptAnyToken;

#[async_trait]
impl TokenVerifier for AcceptAnyToken {
    async fn verify(&self, _token: &str) -> Result<Option<VerifiedIdentity>, DirectoryError> {
        Ok(None)
    }
}

/// In-memory directory.
///
/// Rooms are the configured room set. Any positive user id exists unless
/// explicit users were added, in which case only those do.
#[derive(Debug, Clone, Default)]
pub struct StaticDirectory {
    rooms: HashMap<RoomId, String>,
    users: HashMap<UserId, String>,
}

impl StaticDirectory {
    /// Directory over `rooms`, named "Room {id}".
    #[must_use]
    pub fn new(rooms: &[RoomId]) -> Self {
        Self {
            rooms: rooms.iter().map(|id| (*id, format!("Room {id}"))).collect(),
            users: HashMap::new(),
        }
    }

    #[must_use]
    pub fn with_room(mut self, id: RoomId, name: impl Into<String>) -> Self {
        self.rooms.insert(id, name.into());
        self
    }

    #[must_use]
    pub fn with_user(mut self, id: UserId, name: impl Into<String>) -> Self {
        self.users.insert(id, name.into());
        self
    }
}

#[async_trait]
impl Directory for StaticDirectory {
    async fn find_user(&self, id: UserId) -> Result<Option<UserRecord>, DirectoryError> {
        if !id.is_valid() {
            return Ok(None);
        }
        if self.users.is_empty() {
            return Ok(Some(UserRecord {
                id,
                name: format!("User {id}"),
            }));
        }
        Ok(self.users.get(&id).map(|name| UserRecord {
            id,
            name: name.clone(),
        }))
    }

    async fn find_room(&self, id: RoomId) -> Result<Option<RoomRecord>, DirectoryError> {
        Ok(self.rooms.get(&id).map(|name| RoomRecord {
            id,
            name: name.clone(),
        }))
    }
}

/// Postgres-backed directory over the `users (id, name)` and
/// `rooms (id, name)` tables.
#[derive(Clone)]
pub struct PgDirectory {
    pool: PgPool,
}

impl PgDirectory {
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Open a small pool against `database_url`.
    pub async fn connect(database_url: &SecretString) -> Result<Self, DirectoryError> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .min_connections(1)
            .acquire_timeout(Duration::from_secs(5))
            .idle_timeout(Duration::from_secs(600))
            .connect(database_url.expose_secret())
            .await
            .map_err(|e| {
                error!(target: "sig.directory", error = %e, "Failed to connect to database");
                DirectoryError::Unavailable(format!("Failed to connect to database: {e}"))
            })?;
        Ok(Self::new(pool))
    }
}

#[async_trait]
impl Directory for PgDirectory {
    #[instrument(skip_all, fields(user_id = %id))]
    async fn find_user(&self, id: UserId) -> Result<Option<UserRecord>, DirectoryError> {
        let Ok(db_id) = i64::try_from(id.0) else {
            return Ok(None);
        };

        let row = sqlx::query("SELECT id, name FROM users WHERE id = $1")
            .bind(db_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| DirectoryError::Unavailable(format!("user lookup failed: {e}")))?;

        debug!(target: "sig.directory", found = row.is_some(), "User lookup");
        Ok(row.map(|row| UserRecord {
            id,
            name: row.get("name"),
        }))
    }

    #[instrument(skip_all, fields(room_id = %id))]
    async fn find_room(&self, id: RoomId) -> Result<Option<RoomRecord>, DirectoryError> {
        let Ok(db_id) = i64::try_from(id.0) else {
            return Ok(None);
        };

        let row = sqlx::query("SELECT id, name FROM rooms WHERE id = $1")
            .bind(db_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| DirectoryError::Unavailable(format!("room lookup failed: {e}")))?;

        debug!(target: "sig.directory", found = row.is_some(), "Room lookup");
        Ok(row.map(|row| RoomRecord {
            id,
            name: row.get("name"),
        }))
    }
}
