//! Persistence of per-user session state
//!
//! The client is stateless between requests. Everything that must survive the
//! redirect round trip to Logto lives behind the [`Storage`] trait, scoped to a
//! single end user's session.

use std::{error, fmt};

use async_trait::async_trait;
use thiserror::Error;

#[cfg(feature = "file")]
pub mod file;
pub mod in_memory;

#[cfg(feature = "file")]
pub use file::FileStorage;
pub use in_memory::InMemoryStorage;

/// The keys the client persists
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum StorageKey {
    /// The verified ID token
    IdToken,
    /// The serialized access token cache
    AccessTokenMap,
    /// The refresh token
    RefreshToken,
    /// The pending sign-in
    SignInSession,
}

impl StorageKey {
    /// All keys, in the order they are cleared
    pub const ALL: [StorageKey; 4] = [
        Self::IdToken,
        Self::AccessTokenMap,
        Self::RefreshToken,
        Self::SignInSession,
    ];

    /// The stable encoding of this key
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::IdToken => "logto::id_token",
            Self::AccessTokenMap => "logto::access_token_map",
            Self::RefreshToken => "logto::refresh_token",
            Self::SignInSession => "logto::sign_in_session",
        }
    }
}

impl fmt::Display for StorageKey {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An error raised by a storage backend
#[derive(Debug, Error)]
#[error("storage backend error")]
pub struct StorageError(#[source] Box<dyn error::Error + Send + Sync + 'static>);

impl StorageError {
    /// Wraps a backend-specific error
    pub fn new(error: impl Into<Box<dyn error::Error + Send + Sync + 'static>>) -> Self {
        Self(error.into())
    }
}

impl From<std::io::Error> for StorageError {
    fn from(error: std::io::Error) -> Self {
        Self::new(error)
    }
}

/// A string key-value store scoped to one user's session
///
/// Setting a key to `None` is equivalent to deleting it.
#[async_trait]
pub trait Storage: Send + Sync + fmt::Debug {
    /// Reads the value stored under `key`
    async fn get(&self, key: StorageKey) -> Result<Option<String>, StorageError>;

    /// Stores `value` under `key`, or removes the key if `value` is `None`
    async fn set(&self, key: StorageKey, value: Option<String>) -> Result<(), StorageError>;

    /// Removes `key`
    async fn delete(&self, key: StorageKey) -> Result<(), StorageError> {
        self.set(key, None).await
    }
}
