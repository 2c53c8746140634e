//! A file storage backend

use std::{collections::BTreeMap, io, path::PathBuf};

use async_trait::async_trait;
use tokio::{fs::OpenOptions, sync::Mutex};

use super::{Storage, StorageError, StorageKey};

type Values = BTreeMap<String, String>;

/// Session state kept as a JSON object in a local file
///
/// Every write rewrites the whole file. On Unix the file is created readable only by
/// its owner, since it holds refresh tokens.
#[derive(Debug)]
pub struct FileStorage {
    path: PathBuf,
    lock: Mutex<()>,
}

impl FileStorage {
    /// Constructs a store backed by the file at `path`
    ///
    /// The file is created on the first write.
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            lock: Mutex::new(()),
        }
    }

    async fn read_values(&self) -> Result<Values, io::Error> {
        use tokio::io::AsyncReadExt;

        let mut file = match OpenOptions::new().read(true).open(&self.path).await {
            Ok(file) => file,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Values::new()),
            Err(err) => return Err(err),
        };
        let mut data = String::new();
        file.read_to_string(&mut data).await?;
        if data.trim().is_empty() {
            return Ok(Values::new());
        }
        let values = serde_json::from_str(&data)?;
        Ok(values)
    }

    async fn write_values(&self, values: &Values) -> Result<(), io::Error> {
        use tokio::io::AsyncWriteExt;

        let mut file_opts = OpenOptions::new();

        file_opts.create(true).truncate(true).write(true);

        #[cfg(unix)]
        file_opts.mode(0o600);

        let mut file = file_opts.open(&self.path).await?;
        let data = serde_json::to_string_pretty(values)?;
        file.write_all(data.as_bytes()).await?;
        file.flush().await?;
        Ok(())
    }
}

#[async_trait]
impl Storage for FileStorage {
    async fn get(&self, key: StorageKey) -> Result<Option<String>, StorageError> {
        let _guard = self.lock.lock().await;
        let mut values = self.read_values().await?;
        Ok(values.remove(key.as_str()))
    }

    async fn set(&self, key: StorageKey, value: Option<String>) -> Result<(), StorageError> {
        let _guard = self.lock.lock().await;
        let mut values = self.read_values().await?;
        match value {
            Some(value) => values.insert(key.as_str().to_owned(), value),
            None => values.remove(key.as_str()),
        };
        self.write_values(&values).await?;
        tracing::trace!(path = %self.path.display(), %key, "persisted session state");
        Ok(())
    }
}
