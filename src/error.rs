//! Error types for the auth gateway

use thiserror::Error;

use crate::auth::{IdpError, TokenError};
use crate::service_accounts::MappingError;

/// Result type alias for the auth gateway
pub type Result<T> = std::result::Result<T, Error>;

/// Auth gateway errors
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration error (bad pattern, missing field, invalid URL)
    #[error("Configuration error: {0}")]
    Config(String),

    /// Bearer token rejected
    #[error(transparent)]
    Token(#[from] TokenError),

    /// Identity provider registry error
    #[error(transparent)]
    Idp(#[from] IdpError),

    /// No usable service account
    #[error(transparent)]
    ServiceAccount(#[from] MappingError),

    /// Session missing or expired
    #[error("Session not found: {0}")]
    SessionNotFound(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// HTTP status a transport should answer with for this error.
    #[must_use]
    pub fn http_status(&self) -> u16 {
        match self {
            Self::Token(_) | Self::SessionNotFound(_) => 401,
            Self::ServiceAccount(MappingError::NoMapping { .. }) => 403,
            Self::ServiceAccount(_) | Self::Idp(_) => 503,
            _ => 500,
        }
    }

    /// `WWW-Authenticate` challenge for token failures, if any.
    #[must_use]
    pub fn challenge(&self) -> Option<String> {
        match self {
            Self::Token(e) => Some(e.www_authenticate()),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_errors_map_to_401_with_challenge() {
        let err = Error::from(TokenError::Expired("exp in the past".to_string()));

        assert_eq!(err.http_status(), 401);
        let challenge = err.challenge().unwrap();
        assert!(challenge.starts_with("Bearer "));
        assert!(challenge.contains("invalid_token"));
    }

    #[test]
    fn no_mapping_is_forbidden_but_exhausted_chain_is_unavailable() {
        let no_mapping = Error::from(MappingError::NoMapping {
            subject: "alice".to_string(),
        });
        let exhausted = Error::from(MappingError::AllAccountsFailed {
            attempted: vec!["a".to_string(), "b".to_string()],
        });

        assert_eq!(no_mapping.http_status(), 403);
        assert_eq!(exhausted.http_status(), 503);
        assert!(exhausted.challenge().is_none());
    }

    #[test]
    fn configuration_and_internal_errors_are_server_errors() {
        assert_eq!(Error::Config("bad".to_string()).http_status(), 500);
        assert_eq!(Error::Internal("oops".to_string()).http_status(), 500);
        assert_eq!(
            Error::SessionNotFound("sess_x".to_string()).http_status(),
            401
        );
    }
}
