//! OpenID Connect building blocks for talking to a Logto authorization server
//!
//! This crate holds the protocol-level pieces used by the `logto` client:
//!
//! * [`ProviderMetadata`] discovery from `<endpoint>/oidc/.well-known/openid-configuration`
//! * PKCE and `state` generation in [`pkce`]
//! * the `authorization_code` and `refresh_token` grants and the userinfo call in
//!   [`exchange`]
//! * ID token verification against the provider's JSON Web Key Set in [`verify`]
//! * claim views over ID tokens, access tokens, and userinfo responses in [`claims`]
//!
//! None of these types hold per-user state. Persisting tokens across requests is the
//! job of the caller.
//!
//! # Feature flags
//!
//! Logto signs ID tokens with `ES384` by default. Verifying those requires the `ec`
//! feature, which pulls in OpenSSL through `aliri`. The default features only enable
//! the `rsa` and `hmac` algorithm families.
//!
//! This crate does not automatically enable TLS support in `reqwest`. If the only
//! reason you are using `reqwest` is transitively through this crate, enable the
//! `default-tls` or `rustls-tls` feature to be able to call an HTTPS endpoint.

#![cfg_attr(docsrs, feature(doc_cfg))]
#![warn(
    missing_docs,
    unused_import_braces,
    unused_imports,
    unused_qualifications
)]
#![deny(
    missing_debug_implementations,
    trivial_casts,
    trivial_numeric_casts,
    unsafe_code,
    unused_must_use
)]

mod braids;
pub mod claims;
pub mod exchange;
pub mod metadata;
pub mod pkce;
pub mod scope;
#[cfg(test)]
mod test_util;
pub mod verify;

pub use braids::*;
pub use claims::{AccessTokenClaims, ClaimsDecodeError, IdTokenClaims, UserIdentity, UserInfo};
pub use exchange::{ClientCredentials, TokenClient, TokenRequestError, TokenResponse};
pub use metadata::{DiscoveryError, MetadataCache, ProviderMetadata};
pub use scope::{ReservedResource, ReservedScope, ScopeToken, ScopeTokenRef, Scopes, UserScope};
pub use verify::{
    IdTokenVerifier, RemoteKeySet, SignatureError, SignatureVerifier, StaticKeySet,
    VerificationError,
};

/// The user agent sent with every request made by this crate
pub(crate) const USER_AGENT: &str = concat!("logto_oidc/", env!("CARGO_PKG_VERSION"));

/// Builds a `reqwest` client carrying this crate's user agent
///
/// # Errors
///
/// Returns an error if the TLS backend cannot be initialized.
pub fn default_http_client() -> Result<reqwest::Client, reqwest::Error> {
    reqwest::Client::builder().user_agent(USER_AGENT).build()
}
