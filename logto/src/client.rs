//! The sign-in flow and token lifecycle of one user session

use std::sync::Arc;

use aliri_clock::{Clock, System};
use logto_oidc::{
    claims::decode_unverified,
    pkce::{self, ProofSource, RandomProofs},
    scope, AccessToken, AccessTokenClaims, ClientCredentials, IdToken, IdTokenClaims,
    IdTokenVerifier, MetadataCache, ProviderMetadata, RefreshToken, RemoteKeySet,
    SignatureVerifier, TokenClient, TokenResponse, UserInfo,
};
use url::Url;

use crate::{
    cache::AccessTokenCache,
    config::{InteractionMode, LogtoConfig},
    error::{Credential, LogtoError},
    session::{CallbackRequest, SessionError, SignInSession},
    storage::{Storage, StorageKey},
};

/// A Logto client bound to one user's session store
///
/// The client keeps no state of its own between calls. Whether a user is signed
/// in, signing in, or anonymous is read from the [`Storage`] on every call, so a
/// client may be constructed per request.
#[derive(Debug)]
pub struct LogtoClient<C = System> {
    config: LogtoConfig,
    storage: Arc<dyn Storage>,
    metadata: Arc<ProviderMetadata>,
    tokens: TokenClient,
    verifier: IdTokenVerifier,
    cache: AccessTokenCache<C>,
    proofs: Arc<dyn ProofSource>,
}

impl LogtoClient {
    /// Constructs a client from already-resolved provider metadata and key set
    ///
    /// Share one [`RemoteKeySet`] between clients to avoid fetching the key set on
    /// every request.
    pub fn new(
        config: LogtoConfig,
        storage: Arc<dyn Storage>,
        metadata: Arc<ProviderMetadata>,
        http: reqwest::Client,
        keys: Arc<dyn SignatureVerifier>,
    ) -> Self {
        let credentials = ClientCredentials {
            client_id: config.app_id.clone(),
            client_secret: config.app_secret.clone(),
        };

        Self {
            tokens: TokenClient::new(http, &metadata, credentials),
            verifier: IdTokenVerifier::new(keys),
            cache: AccessTokenCache::new(Arc::clone(&storage)),
            proofs: Arc::new(RandomProofs),
            config,
            storage,
            metadata,
        }
    }

    /// Constructs a client that verifies ID tokens against the provider's published
    /// key set
    pub fn from_metadata(
        config: LogtoConfig,
        storage: Arc<dyn Storage>,
        metadata: Arc<ProviderMetadata>,
        http: reqwest::Client,
    ) -> Self {
        let keys = Arc::new(RemoteKeySet::new(http.clone(), metadata.jwks_uri.clone()));
        Self::new(config, storage, metadata, http, keys)
    }

    /// Fetches the provider metadata for the configured endpoint and constructs a
    /// client
    ///
    /// # Errors
    ///
    /// Fails if the HTTP client cannot be built or discovery fails.
    pub async fn discover(config: LogtoConfig, storage: Arc<dyn Storage>) -> Result<Self, LogtoError> {
        let http = logto_oidc::default_http_client().map_err(LogtoError::HttpClient)?;
        let metadata = ProviderMetadata::discover(&http, &config.endpoint).await?;
        Ok(Self::from_metadata(config, storage, Arc::new(metadata), http))
    }

    /// Like [`discover`][Self::discover], but reuses metadata held in `metadata_cache`
    ///
    /// # Errors
    ///
    /// Fails if discovery fails.
    pub async fn discover_cached<D: Clock>(
        config: LogtoConfig,
        storage: Arc<dyn Storage>,
        http: reqwest::Client,
        metadata_cache: &MetadataCache<D>,
    ) -> Result<Self, LogtoError> {
        let metadata = metadata_cache.discover(&http, &config.endpoint).await?;
        Ok(Self::from_metadata(config, storage, metadata, http))
    }
}

impl<C> LogtoClient<C> {
    /// Sets a custom clock for access token expiry
    ///
    /// Useful for testing purposes
    pub fn with_clock<D: Clock>(self, clock: D) -> LogtoClient<D> {
        LogtoClient {
            cache: AccessTokenCache::with_clock(Arc::clone(&self.storage), clock),
            config: self.config,
            storage: self.storage,
            metadata: self.metadata,
            tokens: self.tokens,
            verifier: self.verifier,
            proofs: self.proofs,
        }
    }

    /// Sets the source of `state` values and code verifiers
    pub fn with_proof_source(self, proofs: impl ProofSource + 'static) -> Self {
        Self {
            proofs: Arc::new(proofs),
            ..self
        }
    }

    /// The client configuration
    pub fn config(&self) -> &LogtoConfig {
        &self.config
    }

    /// The provider metadata
    pub fn metadata(&self) -> &ProviderMetadata {
        &self.metadata
    }
}

impl<C: Clock> LogtoClient<C> {
    /// Whether an ID token is stored
    ///
    /// The token is not verified again; it was verified before it was stored.
    pub async fn is_authenticated(&self) -> Result<bool, LogtoError> {
        Ok(self.storage.get(StorageKey::IdToken).await?.is_some())
    }

    /// The stored ID token
    pub async fn id_token(&self) -> Result<Option<IdToken>, LogtoError> {
        Ok(self.storage.get(StorageKey::IdToken).await?.map(IdToken::new))
    }

    /// The stored refresh token
    pub async fn refresh_token(&self) -> Result<Option<RefreshToken>, LogtoError> {
        Ok(self
            .storage
            .get(StorageKey::RefreshToken)
            .await?
            .map(RefreshToken::new))
    }

    /// The claims of the stored ID token
    ///
    /// # Errors
    ///
    /// Fails with [`LogtoError::CredentialNotFound`] if no ID token is stored.
    pub async fn id_token_claims(&self) -> Result<IdTokenClaims, LogtoError> {
        let id_token = self
            .id_token()
            .await?
            .ok_or(LogtoError::CredentialNotFound(Credential::IdToken))?;
        Ok(decode_unverified(id_token.as_str())?)
    }

    /// Starts a sign-in and returns the URL to redirect the user to
    ///
    /// Any state stored for this session is cleared and replaced by a new pending
    /// sign-in.
    #[tracing::instrument(err, skip(self), fields(client_id = %self.config.app_id))]
    pub async fn sign_in(
        &self,
        redirect_uri: &str,
        interaction_mode: Option<InteractionMode>,
    ) -> Result<Url, LogtoError> {
        let state = self.proofs.state();
        let code_verifier = self.proofs.code_verifier();
        let code_challenge = pkce::generate_code_challenge(&code_verifier);

        let mut url = self.metadata.authorization_endpoint.clone();
        {
            let mut query = url.query_pairs_mut();
            query
                .append_pair("client_id", self.config.app_id.as_str())
                .append_pair("redirect_uri", redirect_uri)
                .append_pair("response_type", "code")
                .append_pair("scope", &self.config.effective_scopes().to_string())
                .append_pair("prompt", self.config.prompt.as_str())
                .append_pair("code_challenge", &code_challenge)
                .append_pair("code_challenge_method", pkce::CODE_CHALLENGE_METHOD)
                .append_pair("state", &state);

            if let Some(mode) = interaction_mode {
                query.append_pair("interaction_mode", mode.as_str());
            }

            for resource in self.config.effective_resources() {
                query.append_pair("resource", &resource);
            }
        }

        self.clear_all().await?;

        let session = SignInSession {
            redirect_uri: redirect_uri.to_owned(),
            code_verifier,
            state,
        };
        self.storage
            .set(StorageKey::SignInSession, Some(serde_json::to_string(&session)?))
            .await?;

        tracing::info!("sign-in started");
        Ok(url)
    }

    /// Completes the pending sign-in from the callback request
    ///
    /// On success the ID token, refresh token, and access token are stored and the
    /// pending sign-in is removed, so replaying the callback fails with
    /// [`SessionError::NotFound`].
    ///
    /// # Errors
    ///
    /// Fails with a [`SessionError`] if no sign-in is pending or the request does
    /// not belong to it. The pending sign-in is kept in that case, unless the client
    /// was configured with
    /// [`with_one_shot_sign_in_session`][LogtoConfig::with_one_shot_sign_in_session].
    /// Fails without storing anything if the code exchange fails or the returned ID
    /// token does not verify.
    #[tracing::instrument(err, skip(self, request), fields(host = %request.host, path = %request.path))]
    pub async fn handle_sign_in_callback(&self, request: &CallbackRequest) -> Result<(), LogtoError> {
        let session = self.sign_in_session().await?.ok_or(SessionError::NotFound)?;

        let code = match session.validate(request) {
            Ok(code) => code,
            Err(error) => {
                if self.config.one_shot_sign_in_session {
                    self.storage.delete(StorageKey::SignInSession).await?;
                    tracing::debug!("discarded sign-in session after rejected callback");
                }
                return Err(error.into());
            }
        };

        let response = self
            .tokens
            .exchange_code(&session.redirect_uri, code, &session.code_verifier)
            .await?;
        self.store_grant(response, "").await?;
        self.storage.delete(StorageKey::SignInSession).await?;

        tracing::info!("sign-in completed");
        Ok(())
    }

    /// Returns an access token for `resource`, refreshing it if necessary
    ///
    /// The empty string is the default resource. Returns `None` if no unexpired token
    /// is cached and no refresh token is stored.
    ///
    /// # Errors
    ///
    /// Fails if the refresh grant fails or returns an ID token that does not verify.
    #[tracing::instrument(err, skip(self))]
    pub async fn access_token(&self, resource: &str) -> Result<Option<AccessToken>, LogtoError> {
        if let Some(token) = self.cache.get(resource).await? {
            return Ok(Some(token));
        }

        let refresh_token = match self.refresh_token().await? {
            Some(refresh_token) => refresh_token,
            None => {
                tracing::debug!("no refresh token stored");
                return Ok(None);
            }
        };

        let response = self
            .tokens
            .exchange_refresh_token(&refresh_token, resource)
            .await?;
        self.store_grant(response, resource).await.map(Some)
    }

    /// Returns an access token for an organization, refreshing it if necessary
    ///
    /// # Errors
    ///
    /// See [`access_token`][Self::access_token].
    pub async fn organization_token(
        &self,
        organization_id: &str,
    ) -> Result<Option<AccessToken>, LogtoError> {
        self.access_token(&scope::organization_urn(organization_id))
            .await
    }

    /// The claims of the access token for `resource`
    ///
    /// # Errors
    ///
    /// Fails with [`LogtoError::CredentialNotFound`] if no access token can be
    /// obtained, in addition to the failures of
    /// [`access_token`][Self::access_token].
    pub async fn access_token_claims(&self, resource: &str) -> Result<AccessTokenClaims, LogtoError> {
        let token = self
            .access_token(resource)
            .await?
            .ok_or(LogtoError::CredentialNotFound(Credential::AccessToken))?;
        Ok(decode_unverified(token.as_str())?)
    }

    /// The claims of the access token for an organization
    ///
    /// # Errors
    ///
    /// See [`access_token_claims`][Self::access_token_claims].
    pub async fn organization_token_claims(
        &self,
        organization_id: &str,
    ) -> Result<AccessTokenClaims, LogtoError> {
        self.access_token_claims(&scope::organization_urn(organization_id))
            .await
    }

    /// Fetches the user's claims from the userinfo endpoint
    ///
    /// # Errors
    ///
    /// Fails with [`LogtoError::CredentialNotFound`] if no default access token can
    /// be obtained, or if the userinfo call fails.
    pub async fn fetch_user_info(&self) -> Result<UserInfo, LogtoError> {
        let token = self
            .access_token("")
            .await?
            .ok_or(LogtoError::CredentialNotFound(Credential::AccessToken))?;
        Ok(self.tokens.fetch_user_info(&token).await?)
    }

    /// Signs the user out and returns the provider's end-session URL
    ///
    /// The ID token, refresh token, and cached access tokens are removed. A pending
    /// sign-in is left alone.
    ///
    /// # Errors
    ///
    /// Fails with [`LogtoError::EndSessionNotSupported`] if the provider has no
    /// end-session endpoint. Local tokens are removed regardless.
    #[tracing::instrument(err, skip(self), fields(client_id = %self.config.app_id))]
    pub async fn sign_out(&self, post_logout_redirect_uri: Option<&str>) -> Result<Url, LogtoError> {
        self.storage.delete(StorageKey::IdToken).await?;
        self.storage.delete(StorageKey::RefreshToken).await?;
        self.cache.clear().await?;
        tracing::info!("signed out");

        let mut url = self
            .metadata
            .end_session_endpoint
            .clone()
            .ok_or(LogtoError::EndSessionNotSupported)?;
        {
            let mut query = url.query_pairs_mut();
            query.append_pair("client_id", self.config.app_id.as_str());
            if let Some(redirect_uri) = post_logout_redirect_uri {
                query.append_pair("post_logout_redirect_uri", redirect_uri);
            }
        }

        Ok(url)
    }

    async fn sign_in_session(&self) -> Result<Option<SignInSession>, LogtoError> {
        match self.storage.get(StorageKey::SignInSession).await? {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    async fn clear_all(&self) -> Result<(), LogtoError> {
        self.storage.delete(StorageKey::IdToken).await?;
        self.cache.clear().await?;
        self.storage.delete(StorageKey::RefreshToken).await?;
        self.storage.delete(StorageKey::SignInSession).await?;
        Ok(())
    }

    /// Verifies and stores the tokens of a grant, returning its access token
    ///
    /// The ID token is verified before anything is written.
    async fn store_grant(
        &self,
        response: TokenResponse,
        resource: &str,
    ) -> Result<AccessToken, LogtoError> {
        let TokenResponse {
            access_token,
            expires_in,
            refresh_token,
            id_token,
            ..
        } = response;

        if let Some(id_token) = id_token {
            let claims = self
                .verifier
                .verify(&id_token, &self.config.app_id, &self.metadata.issuer)
                .await?;
            self.storage
                .set(StorageKey::IdToken, Some(id_token.as_str().to_owned()))
                .await?;
            tracing::debug!(sub = %claims.sub, "stored ID token");
        }

        if let Some(refresh_token) = refresh_token {
            self.storage
                .set(
                    StorageKey::RefreshToken,
                    Some(refresh_token.as_str().to_owned()),
                )
                .await?;
        }

        self.cache
            .put(resource, access_token.clone(), expires_in)
            .await?;

        Ok(access_token)
    }
}

#[cfg(test)]
mod tests {
    use color_eyre::Result;
    use logto_oidc::{scope::UserScope, AuthorizationCode, ClientId, CodeVerifier, StaticKeySet};
    use tracing_test::traced_test;
    use wiremock::{
        matchers::{body_string, header, method, path},
        Mock, MockServer, ResponseTemplate,
    };

    use super::*;
    use crate::{
        cache::AccessTokenMap,
        config::Prompt,
        error::ErrorKind,
        storage::InMemoryStorage,
        test_util::{self, FixedProofs, ManualClock, APP_ID},
    };

    const REDIRECT_URI: &str = "https://app/cb";

    struct Harness {
        server: MockServer,
        storage: Arc<InMemoryStorage>,
        clock: ManualClock,
        client: LogtoClient<ManualClock>,
    }

    impl Harness {
        async fn new() -> Result<Self> {
            Self::with(|config| config, |doc| doc).await
        }

        async fn with(
            configure: impl FnOnce(LogtoConfig) -> LogtoConfig,
            edit_discovery: impl FnOnce(serde_json::Value) -> serde_json::Value,
        ) -> Result<Self> {
            let server = MockServer::start().await;
            let metadata: ProviderMetadata =
                serde_json::from_value(edit_discovery(test_util::discovery_document(&server.uri())))?;
            let storage = Arc::new(InMemoryStorage::new());
            let clock = ManualClock::new(1_000_000);
            let config = configure(LogtoConfig::new(
                server.uri().parse()?,
                ClientId::from_static(APP_ID),
            ));

            let client = LogtoClient::new(
                config,
                storage.clone(),
                Arc::new(metadata),
                reqwest::Client::new(),
                Arc::new(StaticKeySet::new(test_util::key_set())),
            )
            .with_clock(clock.clone())
            .with_proof_source(FixedProofs);

            Ok(Self {
                server,
                storage,
                clock,
                client,
            })
        }

        fn issuer(&self) -> String {
            format!("{}/oidc", self.server.uri())
        }

        async fn put(&self, key: StorageKey, value: &str) -> Result<()> {
            self.storage.set(key, Some(value.to_owned())).await?;
            Ok(())
        }

        async fn get(&self, key: StorageKey) -> Result<Option<String>> {
            Ok(self.storage.get(key).await?)
        }

        async fn pending_sign_in(&self) -> Result<()> {
            let session = SignInSession {
                redirect_uri: REDIRECT_URI.to_owned(),
                code_verifier: CodeVerifier::from_static("v"),
                state: "s".to_owned(),
            };
            self.put(StorageKey::SignInSession, &serde_json::to_string(&session)?)
                .await
        }

        async fn mock_code_exchange(&self, body: serde_json::Value) {
            Mock::given(method("POST"))
                .and(path("/oidc/token"))
                .and(body_string(
                    "grant_type=authorization_code&client_id=app-id&redirect_uri=https%3A%2F%2Fapp%2Fcb&code=c&code_verifier=v",
                ))
                .respond_with(ResponseTemplate::new(200).set_body_json(body))
                .expect(1)
                .mount(&self.server)
                .await;
        }
    }

    fn callback(state: &str, code: Option<&str>) -> CallbackRequest {
        CallbackRequest::new(
            "app",
            "/cb",
            Some(state.to_owned()),
            code.map(|c| AuthorizationCode::new(c.to_owned())),
        )
    }

    fn grant(access_token: &str, refresh_token: Option<&str>, id_token: Option<&IdToken>) -> serde_json::Value {
        let mut body = serde_json::json!({
            "access_token": access_token,
            "token_type": "Bearer",
            "expires_in": 3600,
            "scope": "openid offline_access profile",
        });
        if let Some(refresh_token) = refresh_token {
            body["refresh_token"] = refresh_token.into();
        }
        if let Some(id_token) = id_token {
            body["id_token"] = id_token.as_str().into();
        }
        body
    }

    fn query_value(url: &Url, name: &str) -> Option<String> {
        url.query_pairs()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.into_owned())
    }

    #[tokio::test]
    async fn cold_start_is_anonymous() -> Result<()> {
        let h = Harness::new().await?;

        assert!(!h.client.is_authenticated().await?);
        assert!(h.client.access_token("").await?.is_none());
        assert!(h.client.id_token().await?.is_none());
        Ok(())
    }

    #[tokio::test]
    async fn sign_in_url_carries_every_parameter_in_order() -> Result<()> {
        let h = Harness::new().await?;

        let url = h.client.sign_in(REDIRECT_URI, None).await?;

        assert_eq!(
            url.as_str(),
            format!(
                "{}/oidc/auth?client_id=app-id&redirect_uri=https%3A%2F%2Fapp%2Fcb&response_type=code\
                 &scope=openid+offline_access+profile&prompt=consent\
                 &code_challenge=MECTtcb4ROyU3HC91G2lX8LdLtz7xHZLccixsXrP6pI&code_challenge_method=S256\
                 &state=fixed-state",
                h.server.uri()
            )
        );
        Ok(())
    }

    #[tokio::test]
    async fn sign_in_repeats_resource_parameters() -> Result<()> {
        let h = Harness::with(
            |config| {
                config
                    .with_scope(UserScope::Email)
                    .with_scope(UserScope::Organizations)
                    .with_resource("https://api.logto.app")
                    .with_prompt(Prompt::Login)
            },
            |doc| doc,
        )
        .await?;

        let url = h
            .client
            .sign_in(REDIRECT_URI, Some(InteractionMode::SignUp))
            .await?;
        let query = url.query().unwrap_or_default();

        assert!(query.contains(
            "&scope=email+urn%3Alogto%3Ascope%3Aorganizations+openid+offline_access+profile&prompt=login&"
        ));
        assert!(query.ends_with(
            "&state=fixed-state&interaction_mode=signUp\
             &resource=https%3A%2F%2Fapi.logto.app&resource=urn%3Alogto%3Aresource%3Aorganizations"
        ));
        Ok(())
    }

    #[tokio::test]
    async fn random_proofs_are_43_url_safe_characters() -> Result<()> {
        let h = Harness::new().await?;
        let client = h.client.with_proof_source(RandomProofs);

        let url = client.sign_in(REDIRECT_URI, None).await?;

        for name in ["state", "code_challenge"] {
            let value = query_value(&url, name).unwrap_or_default();
            assert_eq!(value.len(), 43, "{}", name);
            assert!(value
                .bytes()
                .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_'));
        }
        assert_eq!(
            query_value(&url, "code_challenge_method").as_deref(),
            Some("S256")
        );
        Ok(())
    }

    #[tokio::test]
    async fn sign_in_replaces_existing_session_state() -> Result<()> {
        let h = Harness::new().await?;
        h.put(StorageKey::IdToken, "old-id-token").await?;
        h.put(StorageKey::RefreshToken, "old-refresh-token").await?;
        h.put(StorageKey::AccessTokenMap, "{}").await?;

        h.client.sign_in(REDIRECT_URI, None).await?;

        assert_eq!(h.get(StorageKey::IdToken).await?, None);
        assert_eq!(h.get(StorageKey::RefreshToken).await?, None);
        assert_eq!(h.get(StorageKey::AccessTokenMap).await?, None);

        let session: serde_json::Value =
            serde_json::from_str(&h.get(StorageKey::SignInSession).await?.unwrap_or_default())?;
        assert_eq!(
            session,
            serde_json::json!({
                "redirectUri": REDIRECT_URI,
                "codeVerifier": test_util::CODE_VERIFIER,
                "state": test_util::STATE,
            })
        );
        Ok(())
    }

    #[tokio::test]
    #[traced_test]
    async fn callback_stores_tokens() -> Result<()> {
        let h = Harness::new().await?;
        h.pending_sign_in().await?;
        let id_token = test_util::id_token(&h.issuer(), "user1")?;
        h.mock_code_exchange(grant("access-1", Some("r"), Some(&id_token)))
            .await;

        h.client.handle_sign_in_callback(&callback("s", Some("c"))).await?;

        assert!(h.client.is_authenticated().await?);
        assert_eq!(h.get(StorageKey::IdToken).await?.as_deref(), Some(id_token.as_str()));
        assert_eq!(h.get(StorageKey::RefreshToken).await?.as_deref(), Some("r"));
        assert_eq!(h.get(StorageKey::SignInSession).await?, None);

        let token = h.client.access_token("").await?;
        assert_eq!(token.as_deref().map(|t| t.as_str()), Some("access-1"));

        let claims = h.client.id_token_claims().await?;
        assert_eq!(claims.sub.as_str(), "user1");
        assert_eq!(claims.name.as_deref(), Some("John Wick"));

        assert!(logs_contain("sign-in completed"));
        Ok(())
    }

    #[tokio::test]
    async fn replayed_callback_finds_no_session() -> Result<()> {
        let h = Harness::new().await?;
        h.pending_sign_in().await?;
        h.mock_code_exchange(grant("access-1", Some("r"), None)).await;

        h.client.handle_sign_in_callback(&callback("s", Some("c"))).await?;
        let err = h
            .client
            .handle_sign_in_callback(&callback("s", Some("c")))
            .await
            .unwrap_err();

        assert!(matches!(err, LogtoError::Session(SessionError::NotFound)));
        assert_eq!(err.kind(), ErrorKind::SessionState);
        Ok(())
    }

    #[tokio::test]
    async fn callback_without_sign_in_finds_no_session() -> Result<()> {
        let h = Harness::new().await?;

        let err = h
            .client
            .handle_sign_in_callback(&callback("s", Some("c")))
            .await
            .unwrap_err();

        assert_eq!(err.to_string(), "sign-in session not found");
        Ok(())
    }

    #[tokio::test]
    async fn state_mismatch_keeps_the_session() -> Result<()> {
        let h = Harness::new().await?;
        h.pending_sign_in().await?;
        h.mock_code_exchange(grant("access-1", Some("r"), None)).await;

        let err = h
            .client
            .handle_sign_in_callback(&callback("wrong", Some("c")))
            .await
            .unwrap_err();
        assert!(matches!(err, LogtoError::Session(SessionError::StateMismatch)));
        assert!(h.get(StorageKey::SignInSession).await?.is_some());

        h.client.handle_sign_in_callback(&callback("s", Some("c"))).await?;
        assert_eq!(h.get(StorageKey::RefreshToken).await?.as_deref(), Some("r"));
        Ok(())
    }

    #[tokio::test]
    async fn one_shot_session_is_discarded_on_state_mismatch() -> Result<()> {
        let h = Harness::with(LogtoConfig::with_one_shot_sign_in_session, |doc| doc).await?;
        h.pending_sign_in().await?;

        let err = h
            .client
            .handle_sign_in_callback(&callback("wrong", Some("c")))
            .await
            .unwrap_err();
        assert!(matches!(err, LogtoError::Session(SessionError::StateMismatch)));
        assert_eq!(h.get(StorageKey::SignInSession).await?, None);

        let err = h
            .client
            .handle_sign_in_callback(&callback("s", Some("c")))
            .await
            .unwrap_err();
        assert!(matches!(err, LogtoError::Session(SessionError::NotFound)));
        Ok(())
    }

    #[tokio::test]
    async fn callback_checks_redirect_uri_and_code() -> Result<()> {
        let h = Harness::new().await?;
        h.pending_sign_in().await?;

        let other_path = CallbackRequest::new("app", "/elsewhere", Some("s".to_owned()), None);
        let err = h.client.handle_sign_in_callback(&other_path).await.unwrap_err();
        assert!(matches!(err, LogtoError::Session(SessionError::RedirectUriMismatch)));

        let err = h
            .client
            .handle_sign_in_callback(&callback("s", None))
            .await
            .unwrap_err();
        assert!(matches!(err, LogtoError::Session(SessionError::CodeNotFound)));
        Ok(())
    }

    #[tokio::test]
    async fn unverifiable_id_token_is_not_stored() -> Result<()> {
        let h = Harness::new().await?;
        h.pending_sign_in().await?;
        let foreign = test_util::id_token("https://someone-else.app/oidc", "user1")?;
        h.mock_code_exchange(grant("access-1", Some("r"), Some(&foreign)))
            .await;

        let err = h
            .client
            .handle_sign_in_callback(&callback("s", Some("c")))
            .await
            .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::Verification);
        assert!(err.to_string().starts_with("invalid ID token: iss is not"));
        assert!(!h.client.is_authenticated().await?);
        assert_eq!(h.get(StorageKey::RefreshToken).await?, None);
        assert_eq!(h.get(StorageKey::AccessTokenMap).await?, None);
        assert!(h.get(StorageKey::SignInSession).await?.is_some());
        Ok(())
    }

    #[tokio::test]
    async fn failed_exchange_surfaces_the_provider_error() -> Result<()> {
        let h = Harness::new().await?;
        h.pending_sign_in().await?;
        Mock::given(method("POST"))
            .and(path("/oidc/token"))
            .respond_with(
                ResponseTemplate::new(400).set_body_string(r#"{"error":"invalid_grant"}"#),
            )
            .mount(&h.server)
            .await;

        let err = h
            .client
            .handle_sign_in_callback(&callback("s", Some("c")))
            .await
            .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::Transport);
        assert!(!h.client.is_authenticated().await?);
        Ok(())
    }

    #[tokio::test]
    async fn expired_token_without_refresh_token_is_none() -> Result<()> {
        let h = Harness::new().await?;
        let mut map = AccessTokenMap::default();
        map.upsert("", AccessToken::from_static("stale"), 3600, h.clock.now());
        h.put(StorageKey::AccessTokenMap, &map.to_blob()?).await?;

        assert!(h.client.access_token("").await?.is_some());

        h.clock.advance(3540);
        assert!(h.client.access_token("").await?.is_none());
        Ok(())
    }

    #[tokio::test]
    async fn expired_token_is_refreshed() -> Result<()> {
        let h = Harness::new().await?;
        h.pending_sign_in().await?;
        h.mock_code_exchange(grant("access-1", Some("r"), None)).await;
        Mock::given(method("POST"))
            .and(path("/oidc/token"))
            .and(body_string("grant_type=refresh_token&client_id=app-id&refresh_token=r"))
            .respond_with(ResponseTemplate::new(200).set_body_json(grant("access-2", None, None)))
            .expect(1)
            .mount(&h.server)
            .await;

        h.client.handle_sign_in_callback(&callback("s", Some("c"))).await?;
        h.clock.advance(3600);

        let token = h.client.access_token("").await?;
        assert_eq!(token.as_deref().map(|t| t.as_str()), Some("access-2"));
        assert_eq!(h.get(StorageKey::RefreshToken).await?.as_deref(), Some("r"));
        Ok(())
    }

    #[tokio::test]
    async fn refresh_with_unverifiable_id_token_changes_nothing() -> Result<()> {
        let h = Harness::new().await?;
        h.pending_sign_in().await?;
        let id_token = test_util::id_token(&h.issuer(), "user1")?;
        h.mock_code_exchange(grant("access-1", Some("r"), Some(&id_token)))
            .await;
        let foreign = test_util::id_token("https://someone-else.app/oidc", "user1")?;
        Mock::given(method("POST"))
            .and(path("/oidc/token"))
            .and(body_string("grant_type=refresh_token&client_id=app-id&refresh_token=r"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(grant("access-2", Some("r2"), Some(&foreign))),
            )
            .expect(1)
            .mount(&h.server)
            .await;

        h.client.handle_sign_in_callback(&callback("s", Some("c"))).await?;
        let cached = h.get(StorageKey::AccessTokenMap).await?;
        h.clock.advance(3600);

        let err = h.client.access_token("").await.unwrap_err();

        assert_eq!(err.kind(), ErrorKind::Verification);
        assert_eq!(
            h.get(StorageKey::IdToken).await?.as_deref(),
            Some(id_token.as_str())
        );
        assert_eq!(h.get(StorageKey::RefreshToken).await?.as_deref(), Some("r"));
        assert_eq!(h.get(StorageKey::AccessTokenMap).await?, cached);
        Ok(())
    }

    #[tokio::test]
    async fn resource_token_is_refreshed_once_then_cached() -> Result<()> {
        let h = Harness::new().await?;
        h.put(StorageKey::RefreshToken, "r").await?;
        let id_token = test_util::id_token(&h.issuer(), "user1")?;
        Mock::given(method("POST"))
            .and(path("/oidc/token"))
            .and(body_string(
                "grant_type=refresh_token&client_id=app-id&refresh_token=r&resource=https%3A%2F%2Fapi.logto.app",
            ))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(grant("api-token", Some("r2"), Some(&id_token))),
            )
            .expect(1)
            .mount(&h.server)
            .await;

        for _ in 0..2 {
            let token = h.client.access_token("https://api.logto.app").await?;
            assert_eq!(token.as_deref().map(|t| t.as_str()), Some("api-token"));
        }

        assert_eq!(h.get(StorageKey::RefreshToken).await?.as_deref(), Some("r2"));
        assert!(h.client.is_authenticated().await?);
        Ok(())
    }

    #[tokio::test]
    async fn organization_token_sends_organization_id() -> Result<()> {
        let h = Harness::new().await?;
        h.put(StorageKey::RefreshToken, "r").await?;
        let org_token = test_util::access_token("urn:logto:organization:org1");
        Mock::given(method("POST"))
            .and(path("/oidc/token"))
            .and(body_string(
                "grant_type=refresh_token&client_id=app-id&refresh_token=r&organization_id=org1",
            ))
            .respond_with(ResponseTemplate::new(200).set_body_json(grant(&org_token, None, None)))
            .expect(1)
            .mount(&h.server)
            .await;

        let claims = h.client.organization_token_claims("org1").await?;
        assert!(claims
            .aud
            .iter()
            .any(|aud| aud.as_str() == "urn:logto:organization:org1"));
        assert_eq!(claims.scopes().collect::<Vec<_>>(), ["read", "write"]);

        let token = h.client.organization_token("org1").await?;
        assert_eq!(token.as_deref().map(|t| t.as_str()), Some(org_token.as_str()));

        let map = AccessTokenMap::from_blob(&h.get(StorageKey::AccessTokenMap).await?.unwrap_or_default());
        assert!(map.entry("urn:logto:organization:org1").is_some());
        Ok(())
    }

    #[tokio::test]
    async fn concurrent_refreshes_keep_both_cache_entries() -> Result<()> {
        let h = Harness::new().await?;
        h.put(StorageKey::RefreshToken, "r").await?;
        for (resource, encoded, token) in [
            ("https://a.example", "https%3A%2F%2Fa.example", "token-a"),
            ("https://b.example", "https%3A%2F%2Fb.example", "token-b"),
        ] {
            Mock::given(method("POST"))
                .and(path("/oidc/token"))
                .and(body_string(format!(
                    "grant_type=refresh_token&client_id=app-id&refresh_token=r&resource={}",
                    encoded
                )))
                .respond_with(ResponseTemplate::new(200).set_body_json(grant(token, None, None)))
                .expect(1)
                .named(resource)
                .mount(&h.server)
                .await;
        }

        let (a, b) = tokio::join!(
            h.client.access_token("https://a.example"),
            h.client.access_token("https://b.example"),
        );
        assert_eq!(a?.as_deref().map(|t| t.as_str()), Some("token-a"));
        assert_eq!(b?.as_deref().map(|t| t.as_str()), Some("token-b"));

        let map = AccessTokenMap::from_blob(&h.get(StorageKey::AccessTokenMap).await?.unwrap_or_default());
        assert_eq!(map.len(), 2);
        Ok(())
    }

    #[tokio::test]
    async fn claims_require_a_token() -> Result<()> {
        let h = Harness::new().await?;

        let err = h.client.access_token_claims("").await.unwrap_err();
        assert!(matches!(
            err,
            LogtoError::CredentialNotFound(Credential::AccessToken)
        ));

        let err = h.client.id_token_claims().await.unwrap_err();
        assert!(matches!(err, LogtoError::CredentialNotFound(Credential::IdToken)));
        assert_eq!(err.kind(), ErrorKind::AbsentCredential);

        let err = h.client.fetch_user_info().await.unwrap_err();
        assert_eq!(err.to_string(), "access token not found");
        Ok(())
    }

    #[tokio::test]
    async fn malformed_access_token_is_a_decode_error() -> Result<()> {
        let h = Harness::new().await?;
        let mut map = AccessTokenMap::default();
        map.upsert("", AccessToken::from_static("opaque"), 3600, h.clock.now());
        h.put(StorageKey::AccessTokenMap, &map.to_blob()?).await?;

        let err = h.client.access_token_claims("").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Decode);
        Ok(())
    }

    #[tokio::test]
    async fn fetches_user_info_with_default_token() -> Result<()> {
        let h = Harness::new().await?;
        let mut map = AccessTokenMap::default();
        map.upsert("", AccessToken::from_static("access-1"), 3600, h.clock.now());
        h.put(StorageKey::AccessTokenMap, &map.to_blob()?).await?;
        Mock::given(method("GET"))
            .and(path("/oidc/me"))
            .and(header("authorization", "Bearer access-1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "sub": "user1",
                "username": "john",
                "custom_data": { "plan": "pro" },
            })))
            .expect(1)
            .mount(&h.server)
            .await;

        let info = h.client.fetch_user_info().await?;
        assert_eq!(info.sub, "user1");
        assert_eq!(info.username.as_deref(), Some("john"));
        assert_eq!(
            info.custom_data,
            Some(serde_json::json!({ "plan": "pro" }))
        );
        Ok(())
    }

    #[tokio::test]
    async fn sign_out_clears_tokens_but_not_pending_sign_in() -> Result<()> {
        let h = Harness::new().await?;
        h.put(StorageKey::IdToken, "id").await?;
        h.put(StorageKey::RefreshToken, "r").await?;
        h.put(StorageKey::AccessTokenMap, "{}").await?;
        h.pending_sign_in().await?;

        let url = h.client.sign_out(Some("https://app")).await?;

        assert_eq!(
            url.as_str(),
            format!(
                "{}/oidc/session/end?client_id=app-id&post_logout_redirect_uri=https%3A%2F%2Fapp",
                h.server.uri()
            )
        );
        assert!(!h.client.is_authenticated().await?);
        assert_eq!(h.get(StorageKey::RefreshToken).await?, None);
        assert_eq!(h.get(StorageKey::AccessTokenMap).await?, None);
        assert!(h.get(StorageKey::SignInSession).await?.is_some());
        Ok(())
    }

    #[tokio::test]
    async fn sign_out_requires_end_session_endpoint() -> Result<()> {
        let h = Harness::with(
            |config| config,
            |mut doc| {
                if let Some(doc) = doc.as_object_mut() {
                    doc.remove("end_session_endpoint");
                }
                doc
            },
        )
        .await?;
        h.put(StorageKey::IdToken, "id").await?;

        let err = h.client.sign_out(None).await.unwrap_err();

        assert!(matches!(err, LogtoError::EndSessionNotSupported));
        assert_eq!(err.kind(), ErrorKind::Configuration);
        assert!(!h.client.is_authenticated().await?);
        Ok(())
    }

    #[tokio::test]
    async fn discovered_client_verifies_with_remote_keys() -> Result<()> {
        let server = MockServer::start().await;
        let issuer = format!("{}/oidc", server.uri());
        Mock::given(method("GET"))
            .and(path("/oidc/.well-known/openid-configuration"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(test_util::discovery_document(&server.uri())),
            )
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/oidc/jwks"))
            .respond_with(ResponseTemplate::new(200).set_body_json(test_util::key_set()))
            .expect(1)
            .mount(&server)
            .await;
        let id_token = test_util::id_token(&issuer, "user1")?;
        Mock::given(method("POST"))
            .and(path("/oidc/token"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(grant("access-1", Some("r"), Some(&id_token))),
            )
            .expect(1)
            .mount(&server)
            .await;

        let storage = Arc::new(InMemoryStorage::new());
        let config = LogtoConfig::new(server.uri().parse()?, ClientId::from_static(APP_ID));
        let client = LogtoClient::discover(config, storage).await?;
        assert_eq!(client.metadata().issuer.as_str(), issuer);

        let url = client.sign_in("https://app/cb", None).await?;
        let state = query_value(&url, "state").unwrap_or_default();
        let request = CallbackRequest::from_url(&Url::parse(&format!(
            "https://app/cb?code=c&state={}",
            state
        ))?)
        .ok_or_else(|| color_eyre::eyre::eyre!("callback URL has no host"))?;

        client.handle_sign_in_callback(&request).await?;

        assert!(client.is_authenticated().await?);
        Ok(())
    }
}
