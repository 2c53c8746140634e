//! Errors surfaced by the client, grouped into coarse kinds for callers to branch on

use std::fmt;

use logto_oidc::{ClaimsDecodeError, DiscoveryError, TokenRequestError, VerificationError};
use thiserror::Error;

use crate::{config::ConfigError, session::SessionError, storage::StorageError};

/// A credential that the client could not find or obtain
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Credential {
    /// An access token
    AccessToken,
    /// An ID token
    IdToken,
}

impl fmt::Display for Credential {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(match self {
            Self::AccessToken => "access token",
            Self::IdToken => "ID token",
        })
    }
}

/// An error from a [`LogtoClient`][crate::LogtoClient] operation
#[derive(Debug, Error)]
pub enum LogtoError {
    /// The provider has no end-session endpoint
    #[error("the provider does not support ending sessions")]
    EndSessionNotSupported,
    /// The configuration is invalid
    #[error(transparent)]
    Config(#[from] ConfigError),
    /// The callback could not complete the pending sign-in
    #[error(transparent)]
    Session(#[from] SessionError),
    /// The discovery document could not be fetched
    #[error("provider discovery failed")]
    Discovery(#[from] DiscoveryError),
    /// A call to the token or userinfo endpoint failed
    #[error(transparent)]
    TokenRequest(#[from] TokenRequestError),
    /// An ID token failed verification
    #[error(transparent)]
    Verification(#[from] VerificationError),
    /// A required credential is not available
    #[error("{0} not found")]
    CredentialNotFound(Credential),
    /// A token's payload could not be decoded
    #[error(transparent)]
    ClaimsDecode(#[from] ClaimsDecodeError),
    /// Persisted session state could not be encoded or decoded
    #[error("persisted session state is invalid")]
    PersistedState(#[from] serde_json::Error),
    /// The storage backend failed
    #[error(transparent)]
    Storage(#[from] StorageError),
    /// The HTTP client could not be constructed
    #[error("unable to construct HTTP client")]
    HttpClient(#[source] reqwest::Error),
}

/// The broad category of a [`LogtoError`]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorKind {
    /// A required provider capability or configuration value is missing; retrying will
    /// not help
    Configuration,
    /// The callback was forged, replayed, or arrived after its session was lost
    SessionState,
    /// The provider could not be reached or returned something unusable
    Transport,
    /// An ID token must not be trusted
    Verification,
    /// No token is available for an operation that needs one
    AbsentCredential,
    /// A token is not a well-formed JWT
    Decode,
    /// The session store failed
    Storage,
}

impl LogtoError {
    /// The category of this error
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::EndSessionNotSupported | Self::Config(_) | Self::HttpClient(_) => {
                ErrorKind::Configuration
            }
            Self::Session(_) => ErrorKind::SessionState,
            Self::Discovery(_) | Self::TokenRequest(_) => ErrorKind::Transport,
            Self::Verification(_) => ErrorKind::Verification,
            Self::CredentialNotFound(_) => ErrorKind::AbsentCredential,
            Self::ClaimsDecode(_) => ErrorKind::Decode,
            Self::PersistedState(_) | Self::Storage(_) => ErrorKind::Storage,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn messages_name_the_failure() {
        assert_eq!(
            LogtoError::from(SessionError::StateMismatch).to_string(),
            "state mismatch"
        );
        assert_eq!(
            LogtoError::CredentialNotFound(Credential::AccessToken).to_string(),
            "access token not found"
        );
    }

    #[test]
    fn kinds_follow_the_taxonomy() {
        assert_eq!(
            LogtoError::from(SessionError::NotFound).kind(),
            ErrorKind::SessionState
        );
        assert_eq!(
            LogtoError::EndSessionNotSupported.kind(),
            ErrorKind::Configuration
        );
        assert_eq!(
            LogtoError::CredentialNotFound(Credential::IdToken).kind(),
            ErrorKind::AbsentCredential
        );
        assert_eq!(
            LogtoError::from(ClaimsDecodeError::Malformed).kind(),
            ErrorKind::Decode
        );
    }

    #[test]
    fn unreadable_persisted_state_is_a_storage_failure() {
        let err = serde_json::from_str::<serde_json::Value>("{").unwrap_err();
        let err = LogtoError::from(err);
        assert!(matches!(err, LogtoError::PersistedState(_)));
        assert_eq!(err.kind(), ErrorKind::Storage);
    }
}
