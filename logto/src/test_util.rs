use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};

use aliri::{
    jwa,
    jwk::{self, Jwk},
    jwt, Jwks, Jwt,
};
use aliri_base64::Base64Url;
use aliri_clock::{Clock, UnixTime};
use color_eyre::Result;
use logto_oidc::{pkce::ProofSource, CodeVerifier, IdToken};

pub(crate) const APP_ID: &str = "app-id";
pub(crate) const KEY_ID: &str = "k1";

/// A clock that can be advanced through a shared handle
#[derive(Clone, Debug, Default)]
pub(crate) struct ManualClock(Arc<AtomicU64>);

impl ManualClock {
    pub(crate) fn new(now: u64) -> Self {
        Self(Arc::new(AtomicU64::new(now)))
    }

    pub(crate) fn advance(&self, secs: u64) {
        self.0.fetch_add(secs, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> UnixTime {
        UnixTime(self.0.load(Ordering::SeqCst))
    }
}

/// Always hands out the same state and code verifier
#[derive(Debug)]
pub(crate) struct FixedProofs;

pub(crate) const STATE: &str = "fixed-state";
pub(crate) const CODE_VERIFIER: &str = "fixed-code-verifier";

impl ProofSource for FixedProofs {
    fn state(&self) -> String {
        STATE.to_owned()
    }

    fn code_verifier(&self) -> CodeVerifier {
        CodeVerifier::from_static(CODE_VERIFIER)
    }
}

pub(crate) fn discovery_document(base: &str) -> serde_json::Value {
    serde_json::json!({
        "issuer": format!("{}/oidc", base),
        "authorization_endpoint": format!("{}/oidc/auth", base),
        "token_endpoint": format!("{}/oidc/token", base),
        "userinfo_endpoint": format!("{}/oidc/me", base),
        "jwks_uri": format!("{}/oidc/jwks", base),
        "end_session_endpoint": format!("{}/oidc/session/end", base),
        "response_types_supported": ["code"],
        "code_challenge_methods_supported": ["S256"],
    })
}

pub(crate) fn signing_key() -> Jwk {
    Jwk::from(jwa::Hmac::new(Base64Url::from_raw(
        b"a very secret key for signing tokens".to_vec(),
    )))
    .with_algorithm(jwa::Algorithm::HS256)
    .with_key_id(jwk::KeyId::from_static(KEY_ID))
}

pub(crate) fn key_set() -> Jwks {
    let mut jwks = Jwks::default();
    jwks.add_key(signing_key());
    jwks
}

pub(crate) fn id_token(issuer: &str, sub: &str) -> Result<IdToken> {
    let claims = serde_json::json!({
        "iss": issuer,
        "sub": sub,
        "aud": APP_ID,
        "exp": 9_999_999_999u64,
        "iat": 1_616_446_300u64,
        "name": "John Wick",
        "organizations": ["org1"],
    });
    let headers =
        jwt::BasicHeaders::with_key_id(jwa::Algorithm::HS256, jwk::KeyId::from_static(KEY_ID));
    let token = Jwt::try_from_parts_with_signature(&headers, &claims, &signing_key())?;
    Ok(IdToken::new(token.as_str().to_owned()))
}

/// An unsigned access token for `aud`; its signature segment is never checked
pub(crate) fn access_token(aud: &str) -> String {
    let header = Base64Url::from_raw(br#"{"alg":"RS256","kid":"1"}"#.to_vec());
    let payload = serde_json::json!({
        "iss": "https://logto.app/oidc",
        "sub": "user1",
        "aud": aud,
        "exp": 9_999_999_999u64,
        "iat": 1_616_446_300u64,
        "scope": "read write",
        "client_id": APP_ID,
    });
    let payload = Base64Url::from_raw(payload.to_string().into_bytes());
    format!("{}.{}.c2lnbmF0dXJl", header, payload)
}
