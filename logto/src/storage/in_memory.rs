//! An in-memory storage backend

use std::{collections::HashMap, sync::Mutex};

use async_trait::async_trait;

use super::{Storage, StorageError, StorageKey};

/// Session state held in process memory
///
/// Useful for tests and for single-process applications that keep one client per
/// user session.
#[derive(Default, Debug)]
pub struct InMemoryStorage {
    values: Mutex<HashMap<StorageKey, String>>,
}

impl InMemoryStorage {
    /// Constructs an empty store
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Storage for InMemoryStorage {
    async fn get(&self, key: StorageKey) -> Result<Option<String>, StorageError> {
        let values = self
            .values
            .lock()
            .map_err(|_| StorageError::new("in-memory storage lock poisoned"))?;
        Ok(values.get(&key).cloned())
    }

    async fn set(&self, key: StorageKey, value: Option<String>) -> Result<(), StorageError> {
        let mut values = self
            .values
            .lock()
            .map_err(|_| StorageError::new("in-memory storage lock poisoned"))?;
        match value {
            Some(value) => values.insert(key, value),
            None => values.remove(&key),
        };
        Ok(())
    }
}
