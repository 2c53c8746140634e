//! The per-resource access token cache
//!
//! The cache is persisted as one JSON object under [`StorageKey::AccessTokenMap`],
//! keyed by resource. The empty string is the default resource.
//!
//! ```json
//! { "": { "token": "…", "expiresAt": 1700000000 } }
//! ```

use std::{collections::BTreeMap, sync::Arc};

use aliri_clock::{Clock, System, UnixTime};
use logto_oidc::{AccessToken, AccessTokenRef};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::storage::{Storage, StorageError, StorageKey};

/// Seconds subtracted from `expires_in` so that tokens are dropped before the
/// provider would reject them
pub const EXPIRY_SKEW_SECS: u64 = 60;

/// A cached access token
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccessTokenEntry {
    /// The access token
    pub token: AccessToken,
    /// When the entry stops being served
    pub expires_at: UnixTime,
}

/// Access tokens keyed by resource
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AccessTokenMap(BTreeMap<String, AccessTokenEntry>);

impl AccessTokenMap {
    /// Parses a persisted map
    ///
    /// Entries that do not have the expected shape are dropped. A blob that is not
    /// a JSON object at all yields an empty map.
    pub fn from_blob(blob: &str) -> Self {
        let raw: serde_json::Map<String, serde_json::Value> = match serde_json::from_str(blob) {
            Ok(raw) => raw,
            Err(error) => {
                let error: &dyn std::error::Error = &error;
                tracing::warn!(error, "access token cache is corrupt, ignoring it");
                return Self::default();
            }
        };

        let entries = raw
            .into_iter()
            .filter_map(|(resource, value)| match serde_json::from_value(value) {
                Ok(entry) => Some((resource, entry)),
                Err(error) => {
                    let error: &dyn std::error::Error = &error;
                    tracing::warn!(error, %resource, "dropping malformed access token cache entry");
                    None
                }
            })
            .collect();

        Self(entries)
    }

    /// Serializes the map for persistence
    pub fn to_blob(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// The token cached for `resource`, if it has not expired at `now`
    pub fn get_valid(&self, resource: &str, now: UnixTime) -> Option<&AccessTokenRef> {
        self.0
            .get(resource)
            .filter(|entry| entry.expires_at > now)
            .map(|entry| &*entry.token)
    }

    /// Replaces the entry for `resource`
    ///
    /// The entry expires [`EXPIRY_SKEW_SECS`] before the provider's `expires_in`.
    pub fn upsert(&mut self, resource: &str, token: AccessToken, expires_in: u64, now: UnixTime) {
        let expires_at = UnixTime(
            now.0
                .saturating_add(expires_in)
                .saturating_sub(EXPIRY_SKEW_SECS),
        );
        self.0
            .insert(resource.to_owned(), AccessTokenEntry { token, expires_at });
    }

    /// The entry for `resource`, whether or not it has expired
    pub fn entry(&self, resource: &str) -> Option<&AccessTokenEntry> {
        self.0.get(resource)
    }

    /// The number of entries
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether the map has no entries
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// The access token cache of one user session
///
/// Writes are a read-modify-write of the whole persisted map. They are serialized
/// through an async mutex so that concurrent refreshes for different resources do
/// not overwrite each other's entries.
#[derive(Debug)]
pub struct AccessTokenCache<C = System> {
    storage: Arc<dyn Storage>,
    clock: C,
    write_lock: Mutex<()>,
}

impl AccessTokenCache {
    /// Constructs a cache over `storage`
    pub fn new(storage: Arc<dyn Storage>) -> Self {
        Self::with_clock(storage, System)
    }
}

impl<C: Clock> AccessTokenCache<C> {
    /// Constructs a cache using a custom clock
    pub fn with_clock(storage: Arc<dyn Storage>, clock: C) -> Self {
        Self {
            storage,
            clock,
            write_lock: Mutex::new(()),
        }
    }

    async fn load(&self) -> Result<AccessTokenMap, StorageError> {
        Ok(self
            .storage
            .get(StorageKey::AccessTokenMap)
            .await?
            .map(|blob| AccessTokenMap::from_blob(&blob))
            .unwrap_or_default())
    }

    /// Returns the unexpired token for `resource`
    ///
    /// Never performs network activity.
    pub async fn get(&self, resource: &str) -> Result<Option<AccessToken>, StorageError> {
        let map = self.load().await?;
        let token = map
            .get_valid(resource, self.clock.now())
            .map(AccessTokenRef::to_owned);

        if token.is_some() {
            tracing::debug!(%resource, "access token cache hit");
        } else {
            tracing::debug!(%resource, "access token cache miss");
        }

        Ok(token)
    }

    /// Caches `token` for `resource` and persists the whole map
    pub async fn put(
        &self,
        resource: &str,
        token: AccessToken,
        expires_in: u64,
    ) -> Result<(), StorageError> {
        let _guard = self.write_lock.lock().await;

        let mut map = self.load().await?;
        map.upsert(resource, token, expires_in, self.clock.now());
        let blob = map.to_blob().map_err(StorageError::new)?;
        self.storage
            .set(StorageKey::AccessTokenMap, Some(blob))
            .await
    }

    /// Removes every cached token
    pub async fn clear(&self) -> Result<(), StorageError> {
        let _guard = self.write_lock.lock().await;
        self.storage.delete(StorageKey::AccessTokenMap).await
    }
}
