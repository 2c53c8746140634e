//! Scopes, reserved resources, and organization resource URNs

use std::{convert::Infallible, fmt, iter::FromIterator, str::FromStr};

use aliri_braid::braid;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// An invalid scope token
#[derive(Debug, Error)]
pub enum InvalidScopeToken {
    /// The scope token was the empty string
    #[error("scope token cannot be empty")]
    EmptyString,
    /// The scope token contained an invalid byte
    #[error("invalid scope token byte at position {position}: 0x{value:02x}")]
    InvalidByte {
        /// The index in the scope token where the invalid byte was found
        position: usize,
        /// The invalid byte value
        value: u8,
    },
}

impl From<Infallible> for InvalidScopeToken {
    fn from(x: Infallible) -> Self {
        match x {}
    }
}

/// An OAuth2 scope token as defined in [RFC 6749, Section 3.3][RFC6749 3.3]
///
/// A scope token must be composed of printable ASCII characters excluding
/// ` ` (space), `"` (double quote), and `\` (backslash).
///
///   [RFC6749 3.3]: (https://datatracker.ietf.org/doc/html/rfc6749#section-3.3)
#[braid(
    serde,
    validator,
    ref_doc = "A borrowed reference to an OAuth2 [`ScopeToken`]"
)]
pub struct ScopeToken;

impl aliri_braid::Validator for ScopeToken {
    type Error = InvalidScopeToken;

    fn validate(s: &str) -> Result<(), Self::Error> {
        if s.is_empty() {
            Err(InvalidScopeToken::EmptyString)
        } else if let Some((position, &value)) = s
            .as_bytes()
            .iter()
            .enumerate()
            .find(|(_, &b)| b <= 0x20 || b == 0x22 || b == 0x5C || 0x7F <= b)
        {
            Err(InvalidScopeToken::InvalidByte { position, value })
        } else {
            Ok(())
        }
    }
}

/// Scopes that are always requested
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ReservedScope {
    /// `openid`
    #[serde(rename = "openid")]
    OpenId,
    /// `offline_access`, required to receive a refresh token
    #[serde(rename = "offline_access")]
    OfflineAccess,
}

impl ReservedScope {
    /// The wire encoding of this scope
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::OpenId => "openid",
            Self::OfflineAccess => "offline_access",
        }
    }
}

/// Scopes for requesting user information
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum UserScope {
    /// Basic profile: name, username, and picture
    #[serde(rename = "profile")]
    Profile,
    /// `email` and `email_verified`
    #[serde(rename = "email")]
    Email,
    /// `phone_number` and `phone_number_verified`
    #[serde(rename = "phone")]
    Phone,
    /// Custom data attached to the user; only available from the userinfo endpoint
    #[serde(rename = "custom_data")]
    CustomData,
    /// Linked social identities; only available from the userinfo endpoint
    #[serde(rename = "identities")]
    Identities,
    /// Roles assigned to the user
    #[serde(rename = "roles")]
    Roles,
    /// Organizations the user belongs to
    ///
    /// Requesting this scope also requests the organizations resource.
    #[serde(rename = "urn:logto:scope:organizations")]
    Organizations,
    /// Roles the user holds within each organization
    #[serde(rename = "urn:logto:scope:organization_roles")]
    OrganizationRoles,
}

impl UserScope {
    /// The wire encoding of this scope
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Profile => "profile",
            Self::Email => "email",
            Self::Phone => "phone",
            Self::CustomData => "custom_data",
            Self::Identities => "identities",
            Self::Roles => "roles",
            Self::Organizations => "urn:logto:scope:organizations",
            Self::OrganizationRoles => "urn:logto:scope:organization_roles",
        }
    }
}

/// Resources reserved by Logto
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ReservedResource {
    /// The resource that organization tokens are issued for
    #[serde(rename = "urn:logto:resource:organizations")]
    Organizations,
}

impl ReservedResource {
    /// The wire encoding of this resource
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Organizations => "urn:logto:resource:organizations",
        }
    }
}

macro_rules! scope_token_conversions {
    ($($ty:ty),*) => {
        $(
            impl From<$ty> for ScopeToken {
                fn from(scope: $ty) -> Self {
                    ScopeToken::from_static(scope.as_str())
                }
            }

            impl fmt::Display for $ty {
                fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
                    f.write_str(self.as_str())
                }
            }
        )*
    };
}

scope_token_conversions!(ReservedScope, UserScope);

impl fmt::Display for ReservedResource {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The prefix of a resource key identifying an organization
pub const ORGANIZATION_URN_PREFIX: &str = "urn:logto:organization:";

/// Builds the resource key used to request a token for an organization
pub fn organization_urn(organization_id: &str) -> String {
    format!("{}{}", ORGANIZATION_URN_PREFIX, organization_id)
}

/// Extracts the organization ID from an organization resource key
///
/// Returns `None` if the resource is not an organization URN.
pub fn organization_id(resource: &str) -> Option<&str> {
    resource.strip_prefix(ORGANIZATION_URN_PREFIX)
}

/// The scopes requested on every sign-in, in request order
pub const DEFAULT_SCOPES: [ReservedScope; 2] = [ReservedScope::OpenId, ReservedScope::OfflineAccess];

/// An ordered, de-duplicated list of scope tokens
///
/// Unlike a set, insertion order is kept so that the `scope` parameter sent to the
/// authorization server is stable.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Scopes(Vec<ScopeToken>);

impl Scopes {
    /// Produces an empty scope list
    #[inline]
    pub fn empty() -> Self {
        Self(Vec::new())
    }

    /// Builds the scopes to request: the given scopes followed by `openid`,
    /// `offline_access`, and `profile`, keeping the first occurrence of each
    pub fn with_defaults<I>(scopes: I) -> Self
    where
        I: IntoIterator<Item = ScopeToken>,
    {
        let mut this: Self = scopes.into_iter().collect();
        this.extend(DEFAULT_SCOPES.iter().copied().map(ScopeToken::from));
        this.insert(UserScope::Profile.into());
        this
    }

    /// Appends a scope token if it is not already present
    pub fn insert(&mut self, scope_token: ScopeToken) {
        if !self.contains(&scope_token) {
            self.0.push(scope_token);
        }
    }

    /// Whether the list contains the scope token
    pub fn contains(&self, scope_token: &ScopeTokenRef) -> bool {
        self.0.iter().any(|s| s.as_str() == scope_token.as_str())
    }

    /// Whether the organizations scope has been requested
    pub fn has_organizations(&self) -> bool {
        self.0
            .iter()
            .any(|s| s.as_str() == UserScope::Organizations.as_str())
    }

    /// Produces an iterator of the scope tokens in request order
    pub fn iter(&self) -> impl Iterator<Item = &ScopeTokenRef> {
        self.0.iter().map(|s| &**s)
    }

    /// The number of scope tokens
    #[inline]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether there are no scope tokens
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for Scopes {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let mut first = true;
        for scope in &self.0 {
            if !first {
                f.write_str(" ")?;
            }
            first = false;
            f.write_str(scope.as_str())?;
        }
        Ok(())
    }
}

impl Extend<ScopeToken> for Scopes {
    fn extend<I>(&mut self, iter: I)
    where
        I: IntoIterator<Item = ScopeToken>,
    {
        for scope_token in iter {
            self.insert(scope_token);
        }
    }
}

impl FromIterator<ScopeToken> for Scopes {
    fn from_iter<I>(iter: I) -> Self
    where
        I: IntoIterator<Item = ScopeToken>,
    {
        let mut this = Self::empty();
        this.extend(iter);
        this
    }
}

impl FromStr for Scopes {
    type Err = InvalidScopeToken;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.split_whitespace()
            .map(|t| ScopeToken::new(t.to_owned()))
            .collect()
    }
}
