//! OpenID Provider discovery

use std::{collections::HashMap, sync::Arc, sync::Mutex};

use aliri::jwt;
use aliri_clock::{Clock, System, UnixTime};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

/// The path, relative to the Logto endpoint, of the discovery document
pub const DISCOVERY_PATH: &str = "/oidc/.well-known/openid-configuration";

/// How long, in seconds, a [`MetadataCache`] reuses a discovery document by default
pub const DEFAULT_METADATA_TTL_SECS: u64 = 3600;

/// An error while retrieving the provider's discovery document
#[derive(Debug, Error)]
pub enum DiscoveryError {
    /// The Logto endpoint cannot be turned into a discovery URL
    #[error("invalid endpoint URL")]
    InvalidEndpoint(#[from] url::ParseError),
    /// An error from the provider with an error body
    #[error("error requesting discovery document: {body}")]
    ErrorWithBody {
        /// The underlying request error
        source: reqwest::Error,
        /// The body of the error
        body: String,
    },
    /// The discovery document could not be decoded
    #[error("error deserializing discovery document")]
    Decode(#[from] serde_json::Error),
    /// Unable to read the response
    #[error("error reading response body")]
    BodyRead(reqwest::Error),
    /// Unable to send the request to the provider
    #[error("error sending request to provider")]
    RequestSend(reqwest::Error),
}

/// The subset of OpenID Provider metadata used by a relying party
///
/// Fields not named here are kept in `extra` so that the document survives a
/// serialization round trip intact.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ProviderMetadata {
    /// The issuer identifier, compared verbatim against the `iss` claim
    pub issuer: jwt::Issuer,
    /// Where users are redirected to authenticate
    pub authorization_endpoint: Url,
    /// Where codes and refresh tokens are exchanged
    pub token_endpoint: Url,
    /// Where user claims can be fetched with an access token
    pub userinfo_endpoint: Url,
    /// The provider's JSON Web Key Set
    pub jwks_uri: Url,
    /// Where users are redirected to sign out, if supported
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_session_endpoint: Option<Url>,
    /// The dynamic client registration endpoint, if supported
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub registration_endpoint: Option<Url>,
    /// The token introspection endpoint, if supported
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub introspection_endpoint: Option<Url>,
    /// The token revocation endpoint, if supported
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub revocation_endpoint: Option<Url>,
    /// Scopes the provider supports
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub scopes_supported: Vec<String>,
    /// Supported `response_type` values
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub response_types_supported: Vec<String>,
    /// Supported `response_mode` values
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub response_modes_supported: Vec<String>,
    /// Supported grant types
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub grant_types_supported: Vec<String>,
    /// Supported subject identifier types
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub subject_types_supported: Vec<String>,
    /// Algorithms the provider may sign ID tokens with
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub id_token_signing_alg_values_supported: Vec<String>,
    /// Client authentication methods accepted by the token endpoint
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub token_endpoint_auth_methods_supported: Vec<String>,
    /// Supported PKCE challenge methods
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub code_challenge_methods_supported: Vec<String>,
    /// Claims the provider may supply
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub claims_supported: Vec<String>,
    /// Whether the `claims` request parameter is supported
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub claims_parameter_supported: Option<bool>,
    /// Whether the `request` request parameter is supported
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_parameter_supported: Option<bool>,
    /// Any other provider-specific metadata
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// Builds the discovery URL for a Logto endpoint
///
/// A trailing slash on the endpoint is ignored.
///
/// # Errors
///
/// Returns an error if the resulting URL cannot be parsed.
pub fn discovery_url(endpoint: &Url) -> Result<Url, url::ParseError> {
    Url::parse(&format!(
        "{}{}",
        endpoint.as_str().trim_end_matches('/'),
        DISCOVERY_PATH
    ))
}

impl ProviderMetadata {
    /// Fetches and decodes the discovery document at `discovery_url`
    ///
    /// # Errors
    ///
    /// Fails on transport errors, non-success statuses, and documents missing any of
    /// the required endpoints.
    #[tracing::instrument(err, skip(client, discovery_url), fields(discovery_url = %discovery_url))]
    pub async fn fetch(
        client: &reqwest::Client,
        discovery_url: &Url,
    ) -> Result<Self, DiscoveryError> {
        tracing::trace!("requesting discovery document");

        let resp = client
            .get(discovery_url.clone())
            .send()
            .await
            .map_err(DiscoveryError::RequestSend)?;

        tracing::debug!(
            response.status = resp.status().as_u16(),
            "received discovery response"
        );

        if let Err(error) = resp.error_for_status_ref() {
            let body = resp.text().await.map_err(DiscoveryError::BodyRead)?;
            return Err(DiscoveryError::ErrorWithBody {
                source: error,
                body,
            });
        }

        let body = resp.bytes().await.map_err(DiscoveryError::BodyRead)?;
        let metadata: Self = serde_json::from_slice(&body)?;

        tracing::info!(issuer = %metadata.issuer, "discovered provider metadata");

        Ok(metadata)
    }

    /// Fetches the discovery document for a Logto endpoint
    ///
    /// # Errors
    ///
    /// See [`ProviderMetadata::fetch`].
    pub async fn discover(client: &reqwest::Client, endpoint: &Url) -> Result<Self, DiscoveryError> {
        let url = discovery_url(endpoint)?;
        Self::fetch(client, &url).await
    }
}

/// Reuses discovery documents for a bounded time
///
/// Entries are keyed by discovery URL, so one cache may be shared by clients of
/// different Logto tenants.
#[derive(Debug)]
pub struct MetadataCache<C = System> {
    ttl_secs: u64,
    clock: C,
    entries: Mutex<HashMap<Url, (UnixTime, Arc<ProviderMetadata>)>>,
}

impl Default for MetadataCache {
    fn default() -> Self {
        Self::new(DEFAULT_METADATA_TTL_SECS)
    }
}

impl MetadataCache {
    /// Constructs an empty cache that keeps entries for `ttl_secs` seconds
    pub fn new(ttl_secs: u64) -> Self {
        Self::with_clock(ttl_secs, System)
    }
}

impl<C: Clock> MetadataCache<C> {
    /// Constructs an empty cache using a custom clock
    pub fn with_clock(ttl_secs: u64, clock: C) -> Self {
        Self {
            ttl_secs,
            clock,
            entries: Mutex::new(HashMap::new()),
        }
    }

    fn lookup(&self, url: &Url) -> Option<Arc<ProviderMetadata>> {
        let now = self.clock.now();
        let entries = self.entries.lock().ok()?;
        match entries.get(url) {
            Some((expires_at, metadata)) if *expires_at > now => Some(Arc::clone(metadata)),
            _ => None,
        }
    }

    /// Returns the cached document for a Logto endpoint, fetching it if it is absent
    /// or stale
    ///
    /// # Errors
    ///
    /// See [`ProviderMetadata::fetch`]. A failed fetch leaves any stale entry in place.
    /// Stale entries for other endpoints are dropped whenever a document is stored.
    pub async fn discover(
        &self,
        client: &reqwest::Client,
        endpoint: &Url,
    ) -> Result<Arc<ProviderMetadata>, DiscoveryError> {
        let url = discovery_url(endpoint)?;

        if let Some(metadata) = self.lookup(&url) {
            tracing::debug!(discovery_url = %url, "using cached provider metadata");
            return Ok(metadata);
        }

        let metadata = Arc::new(ProviderMetadata::fetch(client, &url).await?);
        let now = self.clock.now();
        let expires_at = UnixTime(now.0.saturating_add(self.ttl_secs));

        if let Ok(mut entries) = self.entries.lock() {
            entries.retain(|_, (expires_at, _)| *expires_at > now);
            entries.insert(url, (expires_at, Arc::clone(&metadata)));
        }

        Ok(metadata)
    }
}
