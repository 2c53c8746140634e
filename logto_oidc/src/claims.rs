//! Claim views over ID tokens, access tokens, and userinfo responses
//!
//! Every view keeps claims it does not name in an `extra` map, so re-serializing a
//! view reproduces everything the provider sent.

use std::collections::BTreeMap;

use aliri::jwt;
use aliri_base64::Base64Url;
use aliri_clock::UnixTime;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use thiserror::Error;

type Extra = serde_json::Map<String, serde_json::Value>;

/// Claims carried by a Logto ID token
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct IdTokenClaims {
    /// The issuer
    pub iss: jwt::Issuer,
    /// The user ID
    pub sub: jwt::Subject,
    /// The audience, which is the application ID
    pub aud: jwt::Audiences,
    /// Expiration time
    pub exp: UnixTime,
    /// Issued-at time
    pub iat: UnixTime,
    /// Access token hash
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub at_hash: Option<String>,
    /// Full name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Username
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    /// Profile picture URL
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub picture: Option<String>,
    /// Email address
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    /// Whether the email address has been verified
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email_verified: Option<bool>,
    /// Phone number
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phone_number: Option<String>,
    /// Whether the phone number has been verified
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phone_number_verified: Option<bool>,
    /// Role names assigned to the user
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub roles: Option<Vec<String>>,
    /// IDs of the organizations the user belongs to
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub organizations: Option<Vec<String>>,
    /// Organization roles, as `<organization id>:<role name>`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub organization_roles: Option<Vec<String>>,
    /// Additional claims
    #[serde(flatten)]
    pub extra: Extra,
}

impl jwt::CoreClaims for IdTokenClaims {
    #[inline]
    fn nbf(&self) -> Option<UnixTime> {
        None
    }

    #[inline]
    fn exp(&self) -> Option<UnixTime> {
        Some(self.exp)
    }

    #[inline]
    fn aud(&self) -> &jwt::Audiences {
        &self.aud
    }

    #[inline]
    fn iss(&self) -> Option<&jwt::IssuerRef> {
        Some(&self.iss)
    }

    #[inline]
    fn sub(&self) -> Option<&jwt::SubjectRef> {
        Some(&self.sub)
    }
}

/// Claims carried by a Logto access token
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AccessTokenClaims {
    /// The issuer
    pub iss: jwt::Issuer,
    /// The user ID
    pub sub: jwt::Subject,
    /// The resource the token was issued for
    pub aud: jwt::Audiences,
    /// Expiration time
    pub exp: UnixTime,
    /// Issued-at time
    pub iat: UnixTime,
    /// Space-separated scopes granted to the token
    #[serde(default)]
    pub scope: String,
    /// The application the token was issued to
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    /// Additional claims
    #[serde(flatten)]
    pub extra: Extra,
}

impl AccessTokenClaims {
    /// The individual scopes granted to the token
    pub fn scopes(&self) -> impl Iterator<Item = &str> {
        self.scope.split_whitespace()
    }
}

/// A social or enterprise identity linked to the user
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct UserIdentity {
    /// The user's ID at the identity provider
    #[serde(rename = "userId")]
    pub user_id: String,
    /// Provider-specific profile details
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<Extra>,
    /// Additional fields
    #[serde(flatten)]
    pub extra: Extra,
}

/// The response of the userinfo endpoint
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct UserInfo {
    /// The user ID
    pub sub: String,
    /// Full name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Username
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    /// Profile picture URL
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub picture: Option<String>,
    /// Email address
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    /// Whether the email address has been verified
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email_verified: Option<bool>,
    /// Phone number
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phone_number: Option<String>,
    /// Whether the phone number has been verified
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phone_number_verified: Option<bool>,
    /// Custom data; requires the `custom_data` scope
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub custom_data: Option<serde_json::Value>,
    /// Linked identities keyed by provider; requires the `identities` scope
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub identities: Option<BTreeMap<String, UserIdentity>>,
    /// Additional claims
    #[serde(flatten)]
    pub extra: Extra,
}

/// An error decoding the payload of a compact JWT
#[derive(Debug, Error)]
pub enum ClaimsDecodeError {
    /// The token is not three dot-separated segments
    #[error("token is not a compact JWT")]
    Malformed,
    /// The payload segment is not URL-safe base64
    #[error("token payload is not valid base64url")]
    Base64(#[from] aliri_base64::InvalidBase64Data),
    /// The payload does not hold the expected claims
    #[error("token payload does not hold the expected claims")]
    Json(#[from] serde_json::Error),
}

/// Decodes the payload of a compact JWT without checking its signature
///
/// Only use this on tokens obtained directly from the token endpoint or that have
/// already been verified.
///
/// # Errors
///
/// Returns an error if the token is malformed or the payload does not match `T`.
pub fn decode_unverified<T: DeserializeOwned>(token: &str) -> Result<T, ClaimsDecodeError> {
    let mut segments = token.split('.');
    let payload = match (segments.next(), segments.next(), segments.next(), segments.next()) {
        (Some(_), Some(payload), Some(_), None) => payload,
        _ => return Err(ClaimsDecodeError::Malformed),
    };

    let raw = Base64Url::from_encoded(payload)?;
    Ok(serde_json::from_slice(raw.as_slice())?)
}
