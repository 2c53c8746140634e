//! The pending sign-in and the callback request that completes it

use logto_oidc::{AuthorizationCode, AuthorizationCodeRef, CodeVerifier};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

/// A callback that cannot complete the pending sign-in
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum SessionError {
    /// No sign-in is pending, it expired, or it was already completed
    #[error("sign-in session not found")]
    NotFound,
    /// The callback did not arrive at the redirect URI of the pending sign-in
    #[error("callback does not match the sign-in redirect URI")]
    RedirectUriMismatch,
    /// The `state` parameter does not match the pending sign-in
    #[error("state mismatch")]
    StateMismatch,
    /// The callback has no authorization code
    #[error("authorization code not found")]
    CodeNotFound,
}

/// A sign-in in flight, persisted between the redirect to Logto and the callback
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignInSession {
    /// The redirect URI sent with the authorization request
    pub redirect_uri: String,
    /// The PKCE code verifier
    pub code_verifier: CodeVerifier,
    /// The `state` sent with the authorization request
    pub state: String,
}

impl SignInSession {
    /// Checks that `request` is the callback for this sign-in
    ///
    /// The host and path of the request must match the redirect URI, then the
    /// `state` must match, then a code must be present. The first failing check is
    /// reported.
    pub fn validate<'a>(
        &self,
        request: &'a CallbackRequest,
    ) -> Result<&'a AuthorizationCodeRef, SessionError> {
        let redirect_uri =
            Url::parse(&self.redirect_uri).map_err(|_| SessionError::RedirectUriMismatch)?;

        if redirect_uri.host_str() != Some(without_port(&request.host))
            || redirect_uri.path() != request.path
        {
            return Err(SessionError::RedirectUriMismatch);
        }

        if request.state.as_deref() != Some(self.state.as_str()) {
            return Err(SessionError::StateMismatch);
        }

        request.code.as_deref().ok_or(SessionError::CodeNotFound)
    }
}

/// Strips a trailing `:port`, keeping bracketed IPv6 literals intact
fn without_port(host: &str) -> &str {
    if host.starts_with('[') {
        match host.find(']') {
            Some(end) => &host[..=end],
            None => host,
        }
    } else {
        host.split(':').next().unwrap_or(host)
    }
}

/// The parts of an incoming callback request needed to complete a sign-in
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CallbackRequest {
    /// The request host
    ///
    /// Ports are not compared, so a `Host` header value such as `localhost:3000`
    /// and the bare server name `localhost` are both accepted.
    pub host: String,
    /// The request path, without the query
    pub path: String,
    /// The `state` query parameter
    pub state: Option<String>,
    /// The `code` query parameter
    pub code: Option<AuthorizationCode>,
}

impl CallbackRequest {
    /// Constructs a callback request from its parts
    pub fn new(
        host: impl Into<String>,
        path: impl Into<String>,
        state: Option<String>,
        code: Option<AuthorizationCode>,
    ) -> Self {
        Self {
            host: host.into(),
            path: path.into(),
            state,
            code,
        }
    }

    /// Extracts the callback parameters from the full request URL
    ///
    /// Returns `None` if the URL has no host.
    pub fn from_url(url: &Url) -> Option<Self> {
        let host = url.host_str()?.to_owned();
        let mut state = None;
        let mut code = None;

        for (name, value) in url.query_pairs() {
            match &*name {
                "state" if state.is_none() => state = Some(value.into_owned()),
                "code" if code.is_none() => code = Some(AuthorizationCode::new(value.into_owned())),
                _ => {}
            }
        }

        Some(Self {
            host,
            path: url.path().to_owned(),
            state,
            code,
        })
    }
}
