//! Calls to the token and userinfo endpoints

use serde::{Deserialize, Serialize, Serializer};
use thiserror::Error;
use url::Url;

use crate::{
    claims::UserInfo, scope, AccessToken, AccessTokenRef, AuthorizationCodeRef, ClientId,
    ClientIdRef, ClientSecret, CodeVerifierRef, IdToken, ProviderMetadata, RefreshToken,
    RefreshTokenRef,
};

/// The credentials of a Logto application
#[derive(Clone, Debug)]
pub struct ClientCredentials {
    /// The application ID
    pub client_id: ClientId,

    /// The application secret, if the application is confidential
    pub client_secret: Option<ClientSecret>,
}

/// A successful response from the token endpoint
///
/// Fields beyond those named here are kept in `extra`.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct TokenResponse {
    /// The access token
    pub access_token: AccessToken,
    /// The token type, normally `Bearer`
    pub token_type: String,
    /// Seconds until the access token expires
    pub expires_in: u64,
    /// A new refresh token, if one was issued
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<RefreshToken>,
    /// A new ID token, if one was issued
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id_token: Option<IdToken>,
    /// The granted scopes, if they differ from those requested
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,
    /// Additional provider-specific fields
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// An error while calling the token or userinfo endpoint
#[derive(Debug, Error)]
pub enum TokenRequestError {
    /// An error from the authority with an error body
    #[error("error response from authority: {body}")]
    ErrorWithBody {
        /// The underlying request error
        source: reqwest::Error,
        /// The body of the error
        body: String,
    },
    /// Unable to deserialize the response body
    #[error("error deserializing response body from authority")]
    TokenBodyError(#[from] serde_json::Error),
    /// Unable to read the response
    #[error("error reading response body")]
    BodyReadError(reqwest::Error),
    /// Unable to send the request to the authority
    #[error("error sending request to authority")]
    RequestSend(reqwest::Error),
}

/// The audience a refresh token grant is requested for
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RefreshTarget<'a> {
    /// The default resource; neither `resource` nor `organization_id` is sent
    Default,
    /// An API resource, sent as `resource`
    Resource(&'a str),
    /// An organization, sent as `organization_id`
    Organization(&'a str),
}

impl<'a> RefreshTarget<'a> {
    /// Classifies a resource key
    ///
    /// The empty string is the default resource. Keys with the organization URN
    /// prefix target the organization named by the remainder.
    pub fn from_resource(resource: &'a str) -> Self {
        if let Some(id) = scope::organization_id(resource) {
            Self::Organization(id)
        } else if resource.is_empty() {
            Self::Default
        } else {
            Self::Resource(resource)
        }
    }
}

trait GrantRequest: Serialize {
    fn grant_type() -> &'static str;
    fn client_id(&self) -> &ClientIdRef;
    fn resource(&self) -> Option<&str> {
        None
    }
}

struct AuthorizationCodeGrant<'a> {
    credentials: &'a ClientCredentials,
    redirect_uri: &'a str,
    code: &'a AuthorizationCodeRef,
    code_verifier: &'a CodeVerifierRef,
}

impl Serialize for AuthorizationCodeGrant<'_> {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        use serde::ser::SerializeStruct;

        let mut ser = serializer.serialize_struct("AuthorizationCodeGrant", 6)?;
        ser.serialize_field("grant_type", Self::grant_type())?;
        ser.serialize_field("client_id", &self.credentials.client_id)?;
        if let Some(secret) = &self.credentials.client_secret {
            ser.serialize_field("client_secret", secret)?;
        } else {
            ser.skip_field("client_secret")?;
        }
        ser.serialize_field("redirect_uri", self.redirect_uri)?;
        ser.serialize_field("code", self.code)?;
        ser.serialize_field("code_verifier", self.code_verifier)?;
        ser.end()
    }
}

impl GrantRequest for AuthorizationCodeGrant<'_> {
    fn grant_type() -> &'static str {
        "authorization_code"
    }
    fn client_id(&self) -> &ClientIdRef {
        &self.credentials.client_id
    }
}

struct RefreshTokenGrant<'a> {
    credentials: &'a ClientCredentials,
    refresh_token: &'a RefreshTokenRef,
    target: RefreshTarget<'a>,
}

impl Serialize for RefreshTokenGrant<'_> {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        use serde::ser::SerializeStruct;

        let mut ser = serializer.serialize_struct("RefreshTokenGrant", 6)?;
        ser.serialize_field("grant_type", Self::grant_type())?;
        ser.serialize_field("client_id", &self.credentials.client_id)?;
        if let Some(secret) = &self.credentials.client_secret {
            ser.serialize_field("client_secret", secret)?;
        } else {
            ser.skip_field("client_secret")?;
        }
        ser.serialize_field("refresh_token", self.refresh_token)?;
        match self.target {
            RefreshTarget::Default => {
                ser.skip_field("resource")?;
                ser.skip_field("organization_id")?;
            }
            RefreshTarget::Resource(resource) => {
                ser.serialize_field("resource", resource)?;
                ser.skip_field("organization_id")?;
            }
            RefreshTarget::Organization(id) => {
                ser.skip_field("resource")?;
                ser.serialize_field("organization_id", id)?;
            }
        }
        ser.end()
    }
}

impl GrantRequest for RefreshTokenGrant<'_> {
    fn grant_type() -> &'static str {
        "refresh_token"
    }
    fn client_id(&self) -> &ClientIdRef {
        &self.credentials.client_id
    }
    fn resource(&self) -> Option<&str> {
        match self.target {
            RefreshTarget::Default => None,
            RefreshTarget::Resource(r) | RefreshTarget::Organization(r) => Some(r),
        }
    }
}

fn maybe_value<'a, T: tracing::Value + 'a>(v: &'a Option<T>) -> &'a dyn tracing::Value {
    if let Some(v) = v {
        v
    } else {
        &tracing::field::Empty
    }
}

/// A client for the grants and the userinfo call made by a relying party
#[derive(Clone, Debug)]
pub struct TokenClient {
    client: reqwest::Client,
    token_endpoint: Url,
    userinfo_endpoint: Url,
    credentials: ClientCredentials,
}

impl TokenClient {
    /// Constructs a client for the endpoints named in the provider metadata
    pub fn new(
        client: reqwest::Client,
        metadata: &ProviderMetadata,
        credentials: ClientCredentials,
    ) -> Self {
        Self {
            client,
            token_endpoint: metadata.token_endpoint.clone(),
            userinfo_endpoint: metadata.userinfo_endpoint.clone(),
            credentials,
        }
    }

    /// The application ID sent with every grant
    pub fn client_id(&self) -> &ClientIdRef {
        &self.credentials.client_id
    }

    /// Exchanges an authorization code for tokens
    ///
    /// # Errors
    ///
    /// Fails on transport errors, non-success statuses, and responses missing a
    /// required field.
    pub async fn exchange_code(
        &self,
        redirect_uri: &str,
        code: &AuthorizationCodeRef,
        code_verifier: &CodeVerifierRef,
    ) -> Result<TokenResponse, TokenRequestError> {
        let grant = AuthorizationCodeGrant {
            credentials: &self.credentials,
            redirect_uri,
            code,
            code_verifier,
        };

        request_token(&self.client, &self.token_endpoint, &grant).await
    }

    /// Exchanges a refresh token for an access token to `resource`
    ///
    /// `resource` is a resource key: empty for the default resource, an API
    /// indicator, or an organization URN.
    ///
    /// # Errors
    ///
    /// Fails on transport errors, non-success statuses, and responses missing a
    /// required field.
    pub async fn exchange_refresh_token(
        &self,
        refresh_token: &RefreshTokenRef,
        resource: &str,
    ) -> Result<TokenResponse, TokenRequestError> {
        let grant = RefreshTokenGrant {
            credentials: &self.credentials,
            refresh_token,
            target: RefreshTarget::from_resource(resource),
        };

        request_token(&self.client, &self.token_endpoint, &grant).await
    }

    /// Fetches the user's claims from the userinfo endpoint
    ///
    /// # Errors
    ///
    /// Fails on transport errors, non-success statuses, and bodies that are not a
    /// userinfo object.
    #[tracing::instrument(err, skip(self, access_token), fields(userinfo_url = %self.userinfo_endpoint))]
    pub async fn fetch_user_info(
        &self,
        access_token: &AccessTokenRef,
    ) -> Result<UserInfo, TokenRequestError> {
        tracing::trace!("requesting user info");

        let resp = self
            .client
            .get(self.userinfo_endpoint.clone())
            .bearer_auth(access_token.as_str())
            .send()
            .await
            .map_err(TokenRequestError::RequestSend)?;

        tracing::debug!(
            response.status = resp.status().as_u16(),
            "received user info response"
        );

        let body = read_success_body(resp).await?;
        Ok(serde_json::from_slice(&body)?)
    }
}

async fn read_success_body(resp: reqwest::Response) -> Result<Vec<u8>, TokenRequestError> {
    if let Err(error) = resp.error_for_status_ref() {
        let body = resp
            .text()
            .await
            .map_err(TokenRequestError::BodyReadError)?;
        return Err(TokenRequestError::ErrorWithBody {
            source: error,
            body,
        });
    }

    let body = resp
        .bytes()
        .await
        .map_err(TokenRequestError::BodyReadError)?;
    Ok(body.to_vec())
}

#[tracing::instrument(
    err,
    skip(client, token_url, grant),
    fields(
        token_url = %token_url,
        grant.grant_type = G::grant_type(),
        grant.client_id = %grant.client_id(),
        grant.resource = maybe_value(&grant.resource()),
    ),
)]
async fn request_token<G: GrantRequest>(
    client: &reqwest::Client,
    token_url: &Url,
    grant: &G,
) -> Result<TokenResponse, TokenRequestError> {
    tracing::trace!("requesting token from authority");

    let resp = client
        .post(token_url.clone())
        .form(grant)
        .send()
        .await
        .map_err(TokenRequestError::RequestSend)?;

    tracing::debug!(
        response.status = resp.status().as_u16(),
        "received token response from issuing authority"
    );

    let body = read_success_body(resp).await?;
    let resp: TokenResponse = serde_json::from_slice(&body)?;

    tracing::info!(
        has_id_token = resp.id_token.is_some(),
        has_refresh_token = resp.refresh_token.is_some(),
        lifetime = resp.expires_in,
        "received new tokens"
    );

    Ok(resp)
}
