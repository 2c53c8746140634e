//! Client configuration

use std::{env, fmt, str::FromStr};

use logto_oidc::{
    scope::{InvalidScopeToken, ReservedResource},
    ClientId, ClientSecret, ScopeToken, Scopes,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

/// An error building a [`LogtoConfig`]
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A required environment variable was not set
    #[error("missing required variable `{0}`")]
    MissingVariable(&'static str),
    /// The Logto endpoint is not an absolute URL
    #[error("invalid Logto endpoint")]
    InvalidEndpoint(#[from] url::ParseError),
    /// A configured scope is not a valid scope token
    #[error("invalid scope")]
    InvalidScope(#[from] InvalidScopeToken),
    /// The prompt is neither `consent` nor `login`
    #[error("invalid prompt `{0}`, expected `consent` or `login`")]
    InvalidPrompt(String),
}

/// The `prompt` sent with the authorization request
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Prompt {
    /// Ask the user to grant consent, reusing an existing session at the provider
    #[default]
    Consent,
    /// Force the user to authenticate again
    Login,
}

impl Prompt {
    /// The value sent as the `prompt` parameter
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Consent => "consent",
            Self::Login => "login",
        }
    }
}

impl fmt::Display for Prompt {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Prompt {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "consent" => Ok(Self::Consent),
            "login" => Ok(Self::Login),
            other => Err(ConfigError::InvalidPrompt(other.to_owned())),
        }
    }
}

/// The first screen shown by the Logto sign-in experience
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum InteractionMode {
    /// The sign-in screen
    #[serde(rename = "signIn")]
    SignIn,
    /// The registration screen
    #[serde(rename = "signUp")]
    SignUp,
}

impl InteractionMode {
    /// The value sent as the `interaction_mode` parameter
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::SignIn => "signIn",
            Self::SignUp => "signUp",
        }
    }
}

impl fmt::Display for InteractionMode {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Configuration of a Logto application
///
/// ```
/// use logto::{LogtoConfig, Prompt};
/// use logto_oidc::{scope::UserScope, ClientId};
///
/// # fn main() -> Result<(), url::ParseError> {
/// let config = LogtoConfig::new(
///     "https://tenant.logto.app".parse()?,
///     ClientId::from_static("app-id"),
/// )
/// .with_scope(UserScope::Email)
/// .with_resource("https://api.example.com")
/// .with_prompt(Prompt::Login);
///
/// assert_eq!(
///     config.effective_scopes().to_string(),
///     "email openid offline_access profile"
/// );
/// # Ok(())
/// # }
/// ```
#[derive(Clone, Debug)]
pub struct LogtoConfig {
    /// The Logto tenant endpoint, such as `https://tenant.logto.app`
    pub endpoint: Url,
    /// The application ID
    pub app_id: ClientId,
    /// The application secret, for traditional web applications
    pub app_secret: Option<ClientSecret>,
    /// Scopes to request in addition to the defaults
    pub scopes: Vec<ScopeToken>,
    /// API resources to request access to
    pub resources: Vec<String>,
    /// The prompt sent with each sign-in
    pub prompt: Prompt,
    /// Whether a callback that fails validation also discards the pending sign-in
    pub one_shot_sign_in_session: bool,
}

impl LogtoConfig {
    /// Constructs a configuration with no secret, no extra scopes, and no resources
    pub fn new(endpoint: Url, app_id: ClientId) -> Self {
        Self {
            endpoint,
            app_id,
            app_secret: None,
            scopes: Vec::new(),
            resources: Vec::new(),
            prompt: Prompt::default(),
            one_shot_sign_in_session: false,
        }
    }

    /// Reads the configuration from the process environment
    ///
    /// `LOGTO_ENDPOINT` and `LOGTO_APP_ID` are required. `LOGTO_APP_SECRET`,
    /// `LOGTO_SCOPES` and `LOGTO_RESOURCES` (both space separated), and `LOGTO_PROMPT`
    /// are optional. Empty values are treated as unset.
    ///
    /// # Errors
    ///
    /// Returns an error if a required variable is missing or a value is invalid.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| env::var(name).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let var = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());

        let endpoint = var("LOGTO_ENDPOINT").ok_or(ConfigError::MissingVariable("LOGTO_ENDPOINT"))?;
        let app_id = var("LOGTO_APP_ID").ok_or(ConfigError::MissingVariable("LOGTO_APP_ID"))?;

        let endpoint: Url = endpoint.parse()?;
        let mut config = Self::new(endpoint, ClientId::new(app_id));

        if let Some(secret) = var("LOGTO_APP_SECRET") {
            config.app_secret = Some(ClientSecret::new(secret));
        }

        if let Some(scopes) = var("LOGTO_SCOPES") {
            config.scopes = scopes
                .split_whitespace()
                .map(|s| ScopeToken::new(s.to_owned()))
                .collect::<Result<_, _>>()?;
        }

        if let Some(resources) = var("LOGTO_RESOURCES") {
            config.resources = resources.split_whitespace().map(String::from).collect();
        }

        if let Some(prompt) = var("LOGTO_PROMPT") {
            config.prompt = prompt.trim().parse()?;
        }

        Ok(config)
    }

    /// Sets the application secret
    pub fn with_app_secret(mut self, app_secret: ClientSecret) -> Self {
        self.app_secret = Some(app_secret);
        self
    }

    /// Adds a scope to request
    pub fn with_scope(mut self, scope: impl Into<ScopeToken>) -> Self {
        self.scopes.push(scope.into());
        self
    }

    /// Adds several scopes to request
    pub fn with_scopes<I>(mut self, scopes: I) -> Self
    where
        I: IntoIterator,
        I::Item: Into<ScopeToken>,
    {
        self.scopes.extend(scopes.into_iter().map(Into::into));
        self
    }

    /// Adds an API resource to request access to
    pub fn with_resource(mut self, resource: impl Into<String>) -> Self {
        self.resources.push(resource.into());
        self
    }

    /// Sets the prompt
    pub fn with_prompt(mut self, prompt: Prompt) -> Self {
        self.prompt = prompt;
        self
    }

    /// Discards the pending sign-in whenever a callback fails validation
    ///
    /// By default a callback with a mismatched `state` leaves the pending sign-in in
    /// place, so that a later callback carrying the right `state` can still complete.
    pub fn with_one_shot_sign_in_session(mut self) -> Self {
        self.one_shot_sign_in_session = true;
        self
    }

    /// The scopes sent with the authorization request
    pub fn effective_scopes(&self) -> Scopes {
        Scopes::with_defaults(self.scopes.iter().cloned())
    }

    /// Whether the organizations scope is requested
    pub fn has_organization_scope(&self) -> bool {
        self.effective_scopes().has_organizations()
    }

    /// The resources sent with the authorization request
    ///
    /// Duplicates are dropped. The organizations resource is added when the
    /// organizations scope is requested.
    pub fn effective_resources(&self) -> Vec<String> {
        let mut resources: Vec<String> = Vec::with_capacity(self.resources.len() + 1);
        let organizations = self
            .has_organization_scope()
            .then(|| ReservedResource::Organizations.as_str().to_owned());

        for resource in self.resources.iter().cloned().chain(organizations) {
            if !resources.contains(&resource) {
                resources.push(resource);
            }
        }

        resources
    }
}
