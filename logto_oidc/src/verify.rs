//! ID token verification
//!
//! Signature checks are delegated to a [`SignatureVerifier`], which owns whatever
//! key-set retrieval and caching strategy is in use. [`IdTokenVerifier`] layers the
//! audience and issuer assertions on top of it.

use std::{fmt, sync::Arc};

use aliri::{
    jwt::{self, CoreHeaders, HasAlgorithm},
    Jwks, JwtRef,
};
use aliri_clock::{Clock, System, UnixTime};
use arc_swap::ArcSwap;
use async_trait::async_trait;
use reqwest::{
    header::{self, HeaderValue},
    StatusCode,
};
use thiserror::Error;
use url::Url;

use crate::{ClientIdRef, IdTokenClaims, IdTokenRef};

/// How long, in seconds, a [`RemoteKeySet`] trusts a fetched key set by default
pub const DEFAULT_JWKS_TTL_SECS: u64 = 300;

/// The cryptographic check on a token failed or could not be performed
#[derive(Debug, Error)]
pub enum SignatureError {
    /// No key in the key set matches the specifications in the token header
    #[error("no matching key found to validate JWT")]
    UnknownKeyId,
    /// The JWT was malformed, its signature is invalid, or it has expired
    #[error("invalid JWT")]
    JwtVerifyError(#[from] aliri::error::JwtVerifyError),
    /// The key set could not be retrieved
    #[error("unable to retrieve JWKS")]
    KeySetUnavailable(#[from] reqwest::Error),
}

/// An ID token failed verification
#[derive(Debug, Error)]
pub enum VerificationError {
    /// The signature could not be verified
    #[error("invalid ID token: signature verification failed")]
    Signature(#[from] SignatureError),
    /// A claim does not hold the expected value
    #[error("invalid ID token: {claim} is not {expected}")]
    ClaimMismatch {
        /// The name of the mismatched claim
        claim: &'static str,
        /// The value the claim was expected to hold
        expected: String,
    },
}

/// Verifies token signatures against a provider's key set
#[async_trait]
pub trait SignatureVerifier: fmt::Debug + Send + Sync {
    /// Verifies the token's signature with the key named by its `kid` header and
    /// returns its claims
    ///
    /// # Errors
    ///
    /// Returns an error if no key matches, the signature does not verify, or the
    /// token is otherwise rejected by the configured validator.
    async fn verify_signature(&self, token: &JwtRef) -> Result<IdTokenClaims, SignatureError>;
}

fn verify_with(
    jwks: &Jwks,
    validator: &jwt::CoreValidator,
    token: &JwtRef,
) -> Result<IdTokenClaims, SignatureError> {
    let decomposed: jwt::Decomposed = token.decompose()?;

    let key = {
        let kid = decomposed.kid();
        let alg = decomposed.alg();

        jwks.get_key_by_opt(kid, alg).ok_or_else(|| {
            if let Some(kid) = kid {
                tracing::debug!(%kid, %alg, "unable to find matching key");
            } else {
                tracing::debug!(%alg, "unable to find matching key");
            }
            SignatureError::UnknownKeyId
        })?
    };

    let validated: jwt::Validated<IdTokenClaims> = decomposed.verify(key, validator)?;
    let (_, claims) = validated.extract();

    Ok(claims)
}

/// A fixed key set
#[derive(Debug)]
pub struct StaticKeySet {
    jwks: Jwks,
    validator: jwt::CoreValidator,
}

impl StaticKeySet {
    /// Constructs a verifier from an existing key set
    ///
    /// The default validator only checks that the token has not expired.
    pub fn new(jwks: Jwks) -> Self {
        Self {
            jwks,
            validator: jwt::CoreValidator::default(),
        }
    }

    /// Replaces the validator applied after the signature check
    pub fn with_validator(self, validator: jwt::CoreValidator) -> Self {
        Self { validator, ..self }
    }
}

#[async_trait]
impl SignatureVerifier for StaticKeySet {
    async fn verify_signature(&self, token: &JwtRef) -> Result<IdTokenClaims, SignatureError> {
        verify_with(&self.jwks, &self.validator, token)
    }
}

#[derive(Debug)]
struct VolatileData {
    jwks: Jwks,
    etag: Option<HeaderValue>,
    last_modified: Option<HeaderValue>,
    fetched_at: Option<UnixTime>,
}

/// A key set fetched from the provider's `jwks_uri`
///
/// The key set is loaded on first use and reloaded once it is older than its
/// time-to-live. A token naming an unknown key triggers one immediate reload, so
/// key rotation at the provider is picked up without waiting for the TTL.
#[derive(Debug)]
pub struct RemoteKeySet<C = System> {
    data: ArcSwap<VolatileData>,
    jwks_url: Url,
    client: reqwest::Client,
    validator: jwt::CoreValidator,
    ttl_secs: u64,
    clock: C,
}

impl RemoteKeySet {
    /// Constructs a key set that loads from `jwks_url` on first use
    pub fn new(client: reqwest::Client, jwks_url: Url) -> Self {
        Self::with_clock(client, jwks_url, DEFAULT_JWKS_TTL_SECS, System)
    }
}

impl<C: Clock> RemoteKeySet<C> {
    /// Constructs a key set with a custom time-to-live and clock
    pub fn with_clock(client: reqwest::Client, jwks_url: Url, ttl_secs: u64, clock: C) -> Self {
        let data = VolatileData {
            jwks: Jwks::default(),
            etag: None,
            last_modified: None,
            fetched_at: None,
        };

        Self {
            data: ArcSwap::from_pointee(data),
            jwks_url,
            client,
            validator: jwt::CoreValidator::default(),
            ttl_secs,
            clock,
        }
    }

    /// Replaces the validator applied after the signature check
    pub fn with_validator(self, validator: jwt::CoreValidator) -> Self {
        Self { validator, ..self }
    }

    fn is_stale(&self) -> bool {
        let data = self.data.load();
        match data.fetched_at {
            Some(at) => self.clock.now().0 >= at.0.saturating_add(self.ttl_secs),
            None => true,
        }
    }

    /// Refreshes the key set from the remote URL
    ///
    /// No retries are attempted. If the attempt to refresh the key set fails, no
    /// change is made to the held keys.
    #[tracing::instrument(skip(self), fields(jwks.url = %self.jwks_url))]
    pub async fn refresh(&self) -> Result<(), reqwest::Error> {
        tracing::debug!("refreshing JWKS");
        let mut request = self.client.get(self.jwks_url.clone());

        let current = self.data.load_full();
        if let Some(etag) = &current.etag {
            request = request.header(header::IF_NONE_MATCH, etag)
        } else if let Some(last_modified) = &current.last_modified {
            request = request.header(header::IF_MODIFIED_SINCE, last_modified)
        }

        let response = request.send().await?;
        let now = self.clock.now();

        if response.status() == StatusCode::NOT_MODIFIED {
            tracing::debug!("JWKS not modified");
            self.data.store(Arc::new(VolatileData {
                jwks: current.jwks.clone(),
                etag: current.etag.clone(),
                last_modified: current.last_modified.clone(),
                fetched_at: Some(now),
            }));
            return Ok(());
        } else if let Err(err) = response.error_for_status_ref() {
            let error: &dyn std::error::Error = &err;
            tracing::warn!(
                error,
                http.status_code = response.status().as_u16(),
                "JWKS refresh failed; unexpected response status",
            );
            return Err(err);
        }

        let etag = response.headers().get(header::ETAG).map(ToOwned::to_owned);
        let last_modified = response
            .headers()
            .get(header::LAST_MODIFIED)
            .map(ToOwned::to_owned);
        match response.json::<Jwks>().await {
            Ok(jwks) => {
                if jwks.keys().is_empty() {
                    tracing::warn!(
                        "JWKS holds no keys usable with the enabled signature algorithms; \
                         EC keys require the `ec` feature"
                    );
                }
                self.data.store(Arc::new(VolatileData {
                    jwks,
                    etag,
                    last_modified,
                    fetched_at: Some(now),
                }));
                tracing::info!("JWKS refreshed");
                Ok(())
            }
            Err(err) => {
                let error: &dyn std::error::Error = &err;
                tracing::warn!(error, "JWKS refresh failed; unexpected error");
                Err(err)
            }
        }
    }

    fn verify_loaded(&self, token: &JwtRef) -> Result<IdTokenClaims, SignatureError> {
        let data = self.data.load();
        verify_with(&data.jwks, &self.validator, token)
    }
}

#[async_trait]
impl<C: Clock + fmt::Debug + Send + Sync> SignatureVerifier for RemoteKeySet<C> {
    async fn verify_signature(&self, token: &JwtRef) -> Result<IdTokenClaims, SignatureError> {
        let mut refreshed = false;
        if self.is_stale() {
            let never_loaded = self.data.load().fetched_at.is_none();
            match self.refresh().await {
                Ok(()) => refreshed = true,
                Err(err) if never_loaded => return Err(err.into()),
                Err(_) => tracing::debug!("continuing with stale JWKS"),
            }
        }

        match self.verify_loaded(token) {
            Err(SignatureError::UnknownKeyId) if !refreshed => {
                tracing::debug!("unknown key; refreshing JWKS before retrying");
                self.refresh().await?;
                self.verify_loaded(token)
            }
            result => result,
        }
    }
}

/// Verifies ID tokens issued to this application
#[derive(Debug, Clone)]
pub struct IdTokenVerifier {
    keys: Arc<dyn SignatureVerifier>,
}

impl IdTokenVerifier {
    /// Constructs a verifier that checks signatures with `keys`
    pub fn new(keys: Arc<dyn SignatureVerifier>) -> Self {
        Self { keys }
    }

    /// Verifies the token's signature, then asserts that it was issued by
    /// `expected_issuer` for `expected_client_id`
    ///
    /// # Errors
    ///
    /// Returns [`VerificationError::Signature`] if the cryptographic check fails and
    /// [`VerificationError::ClaimMismatch`] naming the first mismatched claim.
    #[tracing::instrument(err, skip(self, id_token, expected_client_id, expected_issuer), fields(client_id = %expected_client_id, issuer = %expected_issuer))]
    pub async fn verify(
        &self,
        id_token: &IdTokenRef,
        expected_client_id: &ClientIdRef,
        expected_issuer: &jwt::IssuerRef,
    ) -> Result<IdTokenClaims, VerificationError> {
        let claims = self
            .keys
            .verify_signature(JwtRef::from_str(id_token.as_str()))
            .await?;

        if !claims
            .aud
            .iter()
            .any(|aud| aud.as_str() == expected_client_id.as_str())
        {
            return Err(VerificationError::ClaimMismatch {
                claim: "aud",
                expected: expected_client_id.as_str().to_owned(),
            });
        }

        if claims.iss.as_str() != expected_issuer.as_str() {
            return Err(VerificationError::ClaimMismatch {
                claim: "iss",
                expected: expected_issuer.as_str().to_owned(),
            });
        }

        tracing::debug!(sub = %claims.sub, "ID token verified");

        Ok(claims)
    }
}
