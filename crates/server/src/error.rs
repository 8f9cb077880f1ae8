//! Error taxonomy for the real-time layer.
//!
//! Nothing here is fatal to the process: handshake errors refuse a single
//! upgrade, everything else is scoped to one event and reported back to the
//! connection that sent it.

use thiserror::Error;

/// Why a connection was refused at handshake time.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum HandshakeError {
    #[error("Authentication error: No token provided")]
    AuthenticationMissing,
    #[error("Authentication error: Invalid token")]
    InvalidToken,
    #[error("Authentication error: userId does not match token")]
    IdentityMismatch,
}

/// Failures of the persistence gateway's compound operations.
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("Access denied")]
    AuthorizationDenied,
    #[error("{0} not found")]
    NotFound(&'static str),
    #[error("database error: {0}")]
    Persistence(#[from] rusqlite::Error),
    #[error("database task failed: {0}")]
    Blocking(#[from] tokio::task::JoinError),
}

impl GatewayError {
    /// Unexpected failures are logged and reported with a generic message.
    pub fn is_unexpected(&self) -> bool {
        matches!(self, GatewayError::Persistence(_) | GatewayError::Blocking(_))
    }
}

/// Failure of a single inbound event.
#[derive(Debug, Error)]
pub enum EventError {
    #[error("{0}")]
    Validation(&'static str),
    #[error(transparent)]
    Gateway(#[from] GatewayError),
}

impl EventError {
    /// Text sent to the client. `fallback` replaces internal details.
    pub fn client_message(&self, fallback: &str) -> String {
        match self {
            EventError::Gateway(e) if e.is_unexpected() => fallback.to_string(),
            other => other.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expected_failures_surface_their_own_text() {
        let denied = EventError::from(GatewayError::AuthorizationDenied);
        assert_eq!(denied.client_message("Failed"), "Access denied");

        let missing = EventError::from(GatewayError::NotFound("Task"));
        assert_eq!(missing.client_message("Failed"), "Task not found");

        let invalid = EventError::Validation("Invalid status");
        assert_eq!(invalid.client_message("Failed"), "Invalid status");
    }

    #[test]
    fn persistence_failures_are_masked() {
        let err = EventError::from(GatewayError::Persistence(
            rusqlite::Error::InvalidQuery,
        ));
        assert_eq!(
            err.client_message("Failed to send message"),
            "Failed to send message"
        );
    }
}
