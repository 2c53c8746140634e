//! Server-side sign-in with Logto
//!
//! This crate drives the OpenID Connect Authorization Code flow with PKCE against a
//! Logto tenant on behalf of a backend application, and manages the tokens that flow
//! produces.
//!
//! The client does not keep state between requests. Everything that has to survive
//! the redirect round trip (the pending sign-in, the ID token, the refresh token, and
//! cached access tokens) lives in a [`Storage`] scoped to one end user's session.
//! An application typically constructs a [`LogtoClient`] per request, handing it the
//! storage belonging to the current session.
//!
//! # General Flow
//!
//! 1. [`LogtoClient::sign_in`] stores a pending sign-in and returns the URL to
//!    redirect the user to.
//! 2. Logto redirects back to the application's callback. Hand the request to
//!    [`LogtoClient::handle_sign_in_callback`], which validates it against the pending
//!    sign-in, exchanges the code, verifies the ID token, and stores the tokens.
//! 3. [`LogtoClient::access_token`] and [`LogtoClient::organization_token`] return
//!    cached access tokens and lazily refresh them when they expire. No background
//!    refresh takes place.
//! 4. [`LogtoClient::sign_out`] drops the stored tokens and returns the provider's
//!    end-session URL.
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use logto::{storage::InMemoryStorage, CallbackRequest, LogtoClient, LogtoConfig};
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let config = LogtoConfig::from_env()?;
//! let storage = Arc::new(InMemoryStorage::new());
//! let client = LogtoClient::discover(config, storage).await?;
//!
//! let sign_in_url = client.sign_in("https://app.example/callback", None).await?;
//! // redirect the user to `sign_in_url`, then on the callback request:
//! # let callback_url: url::Url = "https://app.example/callback?code=c&state=s".parse()?;
//! if let Some(request) = CallbackRequest::from_url(&callback_url) {
//!     client.handle_sign_in_callback(&request).await?;
//! }
//!
//! let access_token = client.access_token("https://api.example").await?;
//! # let _ = (sign_in_url, access_token);
//! # Ok(())
//! # }
//! ```
//!
//! # Features
//!
//! * `file` (default): [`FileStorage`][storage::FileStorage], a storage backend using
//!   the local filesystem.
//! * `ec`, `rsa`, `hmac` (default): the signature algorithms accepted on ID tokens.
//!   Logto signs with `ES384` unless configured otherwise, which requires `ec`.
//! * `default-tls`, `rustls-tls`: TLS support for the HTTP client. One of them is
//!   needed to reach a tenant over `https`.

#![cfg_attr(docsrs, feature(doc_cfg))]
#![warn(
    missing_docs,
    unused_import_braces,
    unused_imports,
    unused_qualifications
)]
#![deny(
    missing_debug_implementations,
    trivial_numeric_casts,
    unsafe_code,
    unused_must_use
)]

pub mod cache;
mod client;
mod config;
mod error;
mod session;
pub mod storage;
#[cfg(test)]
mod test_util;

pub use client::LogtoClient;
pub use config::{ConfigError, InteractionMode, LogtoConfig, Prompt};
pub use error::{Credential, ErrorKind, LogtoError};
pub use session::{CallbackRequest, SessionError, SignInSession};
pub use storage::{Storage, StorageError, StorageKey};
