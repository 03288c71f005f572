//! Error types for the client sync layer
//!
//! Three layers, mirroring how failures travel through the system:
//! - [`NetworkError`]: transport-level failures (timeouts, connectivity, HTTP status)
//! - [`AuthError`]: outcomes of a credential refresh round
//! - [`Error`]: the umbrella type surfaced to the presentation layer

use thiserror::Error;

/// Result type alias for client sync operations
pub type Result<T> = std::result::Result<T, Error>;

/// Transport-level failure. Always treated as transient by the core.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum NetworkError {
    #[error("request timed out: {0}")]
    Timeout(String),

    #[error("connectivity lost: {0}")]
    Connectivity(String),

    #[error("server returned {code}: {message}")]
    Status { code: u16, message: String },

    #[error("malformed response: {0}")]
    Decode(String),

    /// The task carrying the request went away before producing a result.
    #[error("request aborted: {0}")]
    Aborted(String),
}

impl NetworkError {
    /// Build a timeout error for `operation` after `after`.
    #[must_use]
    pub fn timeout(operation: &str, after: std::time::Duration) -> Self {
        Self::Timeout(format!("{operation} exceeded {}ms", after.as_millis()))
    }

    #[must_use]
    pub fn status(code: u16, message: impl Into<String>) -> Self {
        Self::Status {
            code,
            message: message.into(),
        }
    }

    /// Whether the server rejected the access token (HTTP 401).
    #[must_use]
    pub const fn is_unauthorized(&self) -> bool {
        matches!(self, Self::Status { code: 401, .. })
    }

    /// Stable error code string.
    #[must_use]
    pub const fn error_type(&self) -> &'static str {
        match self {
            Self::Timeout(_) => "NETWORK_TIMEOUT",
            Self::Connectivity(_) => "NETWORK_UNAVAILABLE",
            Self::Status { .. } => "HTTP_STATUS",
            Self::Decode(_) => "DECODE_ERROR",
            Self::Aborted(_) => "ABORTED",
        }
    }
}

/// Outcome of a failed credential refresh round.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum AuthError {
    /// Refresh failed for a transient reason. The gate never retries on its own.
    #[error("credential refresh failed: {0}")]
    Network(#[from] NetworkError),

    /// The refresh token was rejected. Terminal: forces a full re-login.
    #[error("refresh token rejected; re-authentication required")]
    InvalidRefreshToken,

    /// There is no credential at all (never logged in, or logged out).
    #[error("not authenticated")]
    NotAuthenticated,

    /// Only ever returned to the caller that cancelled its own wait.
    #[error("credential wait cancelled")]
    Cancelled,
}

impl AuthError {
    /// Terminal authentication failures must surface as a re-login prompt.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::InvalidRefreshToken | Self::NotAuthenticated)
    }

    #[must_use]
    pub const fn error_type(&self) -> &'static str {
        match self {
            Self::Network(e) => e.error_type(),
            Self::InvalidRefreshToken => "INVALID_REFRESH_TOKEN",
            Self::NotAuthenticated => "NOT_AUTHENTICATED",
            Self::Cancelled => "CANCELLED",
        }
    }
}

/// Main error type for the client sync layer
#[derive(Debug, Error)]
pub enum Error {
    // ==========================================================================
    // Remote
    // ==========================================================================
    #[error(transparent)]
    Network(#[from] NetworkError),

    #[error(transparent)]
    Auth(#[from] AuthError),

    // ==========================================================================
    // Local state
    // ==========================================================================
    #[error("{entity} not found: {identifier}")]
    NotFound {
        entity: &'static str,
        identifier: String,
    },

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Credential storage error: {0}")]
    Storage(String),

    // ==========================================================================
    // I/O
    // ==========================================================================
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Create a not found error
    pub fn not_found(entity: &'static str, identifier: impl Into<String>) -> Self {
        Self::NotFound {
            entity,
            identifier: identifier.into(),
        }
    }

    /// Returns the error type string (stable code for the presentation layer)
    #[must_use]
    pub const fn error_type(&self) -> &'static str {
        match self {
            Self::Network(e) => e.error_type(),
            Self::Auth(e) => e.error_type(),
            Self::NotFound { .. } => "NOT_FOUND",
            Self::InvalidArgument(_) => "INVALID_ARGUMENT",
            Self::Storage(_) => "STORAGE_ERROR",
            Self::Io(_) => "OS_ERROR",
            Self::Serialization(_) => "TYPE_ERROR",
            Self::Internal(_) => "UNHANDLED_EXCEPTION",
        }
    }

    /// Returns whether the operation may succeed if attempted again later.
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        match self {
            Self::Network(_) | Self::Storage(_) | Self::Io(_) => true,
            Self::Auth(e) => matches!(e, AuthError::Network(_) | AuthError::Cancelled),
            Self::NotFound { .. }
            | Self::InvalidArgument(_)
            | Self::Serialization(_)
            | Self::Internal(_) => false,
        }
    }

    /// Whether the presentation layer must prompt for a full re-login.
    #[must_use]
    pub const fn requires_reauth(&self) -> bool {
        match self {
            Self::Auth(e) => e.is_terminal(),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_type_mapping() {
        let cases: Vec<(Error, &str)> = vec![
            (
                Error::Network(NetworkError::Timeout("x".into())),
                "NETWORK_TIMEOUT",
            ),
            (
                Error::Network(NetworkError::Connectivity("x".into())),
                "NETWORK_UNAVAILABLE",
            ),
            (Error::Network(NetworkError::status(503, "x")), "HTTP_STATUS"),
            (Error::Auth(AuthError::InvalidRefreshToken), "INVALID_REFRESH_TOKEN"),
            (Error::Auth(AuthError::NotAuthenticated), "NOT_AUTHENTICATED"),
            (Error::Auth(AuthError::Cancelled), "CANCELLED"),
            (
                Error::Auth(AuthError::Network(NetworkError::Decode("x".into()))),
                "DECODE_ERROR",
            ),
            (Error::not_found("Notification", "abc"), "NOT_FOUND"),
            (Error::InvalidArgument("x".into()), "INVALID_ARGUMENT"),
            (Error::Storage("x".into()), "STORAGE_ERROR"),
            (Error::Io(std::io::Error::other("x")), "OS_ERROR"),
            (Error::Internal("x".into()), "UNHANDLED_EXCEPTION"),
        ];

        for (err, expected_type) in &cases {
            assert_eq!(
                err.error_type(),
                *expected_type,
                "Error {err:?} should map to {expected_type}"
            );
        }
    }

    #[test]
    fn test_reauth_only_for_terminal_auth_errors() {
        assert!(Error::Auth(AuthError::InvalidRefreshToken).requires_reauth());
        assert!(Error::Auth(AuthError::NotAuthenticated).requires_reauth());
        assert!(!Error::Auth(AuthError::Cancelled).requires_reauth());
        assert!(
            !Error::Auth(AuthError::Network(NetworkError::Timeout("x".into()))).requires_reauth()
        );
        assert!(!Error::Network(NetworkError::status(401, "x")).requires_reauth());
    }

    #[test]
    fn test_recoverable_classification() {
        assert!(Error::Network(NetworkError::Connectivity("x".into())).is_recoverable());
        assert!(
            Error::Auth(AuthError::Network(NetworkError::Timeout("x".into()))).is_recoverable()
        );
        assert!(!Error::Auth(AuthError::InvalidRefreshToken).is_recoverable());
        assert!(!Error::not_found("Notification", "x").is_recoverable());
        assert!(!Error::Internal("x".into()).is_recoverable());
    }

    #[test]
    fn test_unauthorized_detection() {
        assert!(NetworkError::status(401, "expired").is_unauthorized());
        assert!(!NetworkError::status(403, "forbidden").is_unauthorized());
        assert!(!NetworkError::Timeout("x".into()).is_unauthorized());
    }

    #[test]
    fn test_timeout_message_includes_budget() {
        let err = NetworkError::timeout("flush", std::time::Duration::from_millis(1500));
        assert_eq!(err.to_string(), "request timed out: flush exceeded 1500ms");
    }
}
