//! Signaling service error types.
//!
//! Every failure that can surface to a client is converted into a
//! [`ResponseCode`] and written back over the originating connection. The
//! numeric codes are part of the client protocol and must not be renumbered.
//! Internal details are logged server-side but not exposed to clients.

use crate::config::ConfigError;
use thiserror::Error;

/// Response codes carried in the `code` field of every outbound frame and in
/// the `ret_code` field of relay RPC responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum ResponseCode {
    Ok = 200,
    NotLoggedIn = 1000,
    ParameterIllegal = 1001,
    InvalidUserId = 1002,
    InvalidRoomId = 1003,
    Unauthorized = 1004,
    ServerError = 1005,
    NotData = 1006,
    NotUser = 1007,
    NotRoom = 1008,
    OperationFailure = 1012,
    RoutingNotExist = 1013,
    HasLoggedIn = 1014,
}

impl ResponseCode {
    #[must_use]
    pub const fn as_u32(self) -> u32 {
        self as u32
    }

    /// Parse a code received from a peer instance.
    #[must_use]
    pub const fn from_u32(value: u32) -> Option<Self> {
        Some(match value {
            200 => Self::Ok,
            1000 => Self::NotLoggedIn,
            1001 => Self::ParameterIllegal,
            1002 => Self::InvalidUserId,
            1003 => Self::InvalidRoomId,
            1004 => Self::Unauthorized,
            1005 => Self::ServerError,
            1006 => Self::NotData,
            1007 => Self::NotUser,
            1008 => Self::NotRoom,
            1012 => Self::OperationFailure,
            1013 => Self::RoutingNotExist,
            1014 => Self::HasLoggedIn,
            _ => return None,
        })
    }

    #[must_use]
    pub const fn is_ok(self) -> bool {
        matches!(self, Self::Ok)
    }

    /// Default client-facing message for the code.
    #[must_use]
    pub const fn message(self) -> &'static str {
        match self {
            Self::Ok => "Success",
            Self::NotLoggedIn => "Not logged in",
            Self::ParameterIllegal => "Illegal parameter",
            Self::InvalidUserId => "Invalid user id",
            Self::InvalidRoomId => "Invalid room id",
            Self::Unauthorized => "Unauthorized",
            Self::ServerError => "Server error",
            Self::NotData => "No data",
            Self::NotUser => "User does not exist",
            Self::NotRoom => "Room does not exist",
            Self::OperationFailure => "Operation failed",
            Self::RoutingNotExist => "Route does not exist",
            Self::HasLoggedIn => "Already logged in",
        }
    }

    /// Bounded label for metrics.
    #[must_use]
    pub const fn as_label(self) -> &'static str {
        match self {
            Self::Ok => "ok",
            Self::NotLoggedIn => "not_logged_in",
            Self::ParameterIllegal => "parameter_illegal",
            Self::InvalidUserId => "invalid_user_id",
            Self::InvalidRoomId => "invalid_room_id",
            Self::Unauthorized => "unauthorized",
            Self::ServerError => "server_error",
            Self::NotData => "not_data",
            Self::NotUser => "not_user",
            Self::NotRoom => "not_room",
            Self::OperationFailure => "operation_failure",
            Self::RoutingNotExist => "routing_not_exist",
            Self::HasLoggedIn => "has_logged_in",
        }
    }
}

/// Failures that stop the process: startup errors and servers that exit.
///
/// These never reach clients; `main` logs them with their
/// [`error_type_label`](Self::error_type_label) and exits.
#[derive(Debug, Error)]
pub enum SignalingError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Presence(#[from] PresenceError),

    #[error(transparent)]
    Directory(#[from] DirectoryError),

    #[error("Metrics recorder error: {0}")]
    Metrics(String),

    #[error("Invalid {server} bind address {addr}: {message}")]
    BindAddress {
        server: &'static str,
        addr: String,
        message: String,
    },

    #[error("{server} server transport error: {message}")]
    Transport {
        server: &'static str,
        message: String,
    },
}

impl SignalingError {
    /// Returns a bounded label for logs and metrics.
    #[must_use]
    pub fn error_type_label(&self) -> &'static str {
        match self {
            SignalingError::Config(_) | SignalingError::BindAddress { .. } => "config",
            SignalingError::Presence(_) => "presence",
            SignalingError::Directory(_) => "directory",
            SignalingError::Metrics(_) => "metrics",
            SignalingError::Transport { .. } => "transport",
        }
    }
}

/// Shared-cache failures.
///
/// A missing or expired key is NOT an error: lookups return `Ok(None)`.
/// These variants cover only infrastructure failures and corrupt payloads.
#[derive(Debug, Error)]
pub enum PresenceError {
    #[error("Presence store unavailable: {0}")]
    Unavailable(String),

    #[error("Presence store timed out during {0}")]
    Timeout(&'static str),

    #[error("Corrupt presence payload: {0}")]
    Corrupt(String),
}

impl PresenceError {
    #[must_use]
    pub fn response_code(&self) -> ResponseCode {
        ResponseCode::ServerError
    }

    #[must_use]
    pub fn kind_label(&self) -> &'static str {
        match self {
            PresenceError::Unavailable(_) => "unavailable",
            PresenceError::Timeout(_) => "timeout",
            PresenceError::Corrupt(_) => "corrupt",
        }
    }
}

/// Connection registry failures.
#[derive(Debug, Error)]
pub enum RegistryError {
    /// The connection was unregistered before its login completed.
    #[error("Connection is no longer registered")]
    UnknownConnection,

    /// The (room, user) key is already indexed by another connection.
    #[error("User is already logged in on this instance")]
    AlreadyLoggedIn,

    #[error("Peer not found in room")]
    PeerNotFound,

    /// The registry consumer is gone (shutdown).
    #[error("Registry unavailable: {0}")]
    Unavailable(String),
}

impl RegistryError {
    #[must_use]
    pub fn response_code(&self) -> ResponseCode {
        match self {
            RegistryError::AlreadyLoggedIn => ResponseCode::HasLoggedIn,
            RegistryError::UnknownConnection | RegistryError::PeerNotFound => {
                ResponseCode::OperationFailure
            }
            RegistryError::Unavailable(_) => ResponseCode::ServerError,
        }
    }
}

/// Cross-instance relay failures.
#[derive(Debug, Error)]
pub enum RelayError {
    /// No presence record, or the record is logged off or stale.
    #[error("User is not online")]
    UserOffline,

    /// The user is not connected to this instance.
    #[error("User is not connected to this instance")]
    NotConnectedHere,

    #[error("RPC to {instance} failed: {message}")]
    Rpc { instance: String, message: String },

    #[error("Instance {instance} answered {code}: {message}")]
    Remote {
        instance: String,
        code: u32,
        message: String,
    },

    #[error("Failed to encode relay payload: {0}")]
    Encode(String),

    #[error(transparent)]
    Presence(#[from] PresenceError),

    #[error(transparent)]
    Registry(#[from] RegistryError),
}

impl RelayError {
    #[must_use]
    pub fn response_code(&self) -> ResponseCode {
        match self {
            RelayError::UserOffline
            | RelayError::NotConnectedHere
            | RelayError::Rpc { .. }
            | RelayError::Remote { .. } => ResponseCode::OperationFailure,
            RelayError::Encode(_) => ResponseCode::ServerError,
            RelayError::Presence(e) => e.response_code(),
            RelayError::Registry(e) => e.response_code(),
        }
    }
}

/// User/room directory and token verification failures.
#[derive(Debug, Error)]
pub enum DirectoryError {
    #[error("Directory unavailable: {0}")]
    Unavailable(String),
}

impl DirectoryError {
    #[must_use]
    pub fn response_code(&self) -> ResponseCode {
        ResponseCode::ServerError
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_response_code_wire_values() {
        assert_eq!(ResponseCode::Ok.as_u32(), 200);
        assert_eq!(ResponseCode::NotLoggedIn.as_u32(), 1000);
        assert_eq!(ResponseCode::ParameterIllegal.as_u32(), 1001);
        assert_eq!(ResponseCode::ServerError.as_u32(), 1005);
        assert_eq!(ResponseCode::OperationFailure.as_u32(), 1012);
        assert_eq!(ResponseCode::RoutingNotExist.as_u32(), 1013);
        assert_eq!(ResponseCode::HasLoggedIn.as_u32(), 1014);
    }

    #[test]
    fn test_response_code_from_u32() {
        for code in [
            ResponseCode::Ok,
            ResponseCode::NotUser,
            ResponseCode::NotRoom,
            ResponseCode::HasLoggedIn,
        ] {
            assert_eq!(ResponseCode::from_u32(code.as_u32()), Some(code));
        }
        assert_eq!(ResponseCode::from_u32(1009), None);
        assert_eq!(ResponseCode::from_u32(0), None);
    }

    #[test]
    fn test_presence_errors_are_server_errors() {
        assert_eq!(
            PresenceError::Unavailable("connection refused".to_string()).response_code(),
            ResponseCode::ServerError
        );
        assert_eq!(
            PresenceError::Timeout("get_user_online").response_code(),
            ResponseCode::ServerError
        );
    }

    #[test]
    fn test_registry_error_mapping() {
        assert_eq!(
            RegistryError::AlreadyLoggedIn.response_code(),
            ResponseCode::HasLoggedIn
        );
        assert_eq!(
            RegistryError::UnknownConnection.response_code(),
            ResponseCode::OperationFailure
        );
        assert_eq!(
            RegistryError::Unavailable("closed".to_string()).response_code(),
            ResponseCode::ServerError
        );
    }

    #[test]
    fn test_relay_error_mapping() {
        assert_eq!(
            RelayError::UserOffline.response_code(),
            ResponseCode::OperationFailure
        );
        assert_eq!(
            RelayError::Rpc {
                instance: "10.0.0.2:50061".to_string(),
                message: "deadline exceeded".to_string(),
            }
            .response_code(),
            ResponseCode::OperationFailure
        );
        assert_eq!(
            RelayError::Presence(PresenceError::Timeout("get_server_all")).response_code(),
            ResponseCode::ServerError
        );
    }

    #[test]
    fn test_signaling_error_labels_and_display() {
        let err = SignalingError::from(PresenceError::Timeout("connect"));
        assert_eq!(err.error_type_label(), "presence");

        let err = SignalingError::BindAddress {
            server: "WebSocket",
            addr: "0.0.0.0:notaport".to_string(),
            message: "invalid socket address syntax".to_string(),
        };
        assert_eq!(err.error_type_label(), "config");
        assert_eq!(
            err.to_string(),
            "Invalid WebSocket bind address 0.0.0.0:notaport: invalid socket address syntax"
        );

        let err = SignalingError::from(ConfigError::MissingEnvVar("REDIS_URL".to_string()));
        assert_eq!(err.error_type_label(), "config");
    }
}
