//! Key-value persistence backends.
//!
//! Values are JSON documents. [`MemoryStore`] keeps them in memory;
//! [`FileStore`] keeps one file per key in a directory and replaces files
//! atomically.

use std::collections::BTreeMap;
use std::future::Future;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use serde_json::Value;
use tokio::fs;
use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::error::{StorageError, StorageResult};

/// Durable get/set/remove/iterate over JSON values.
///
/// A successful `set` must be visible to every later `get`.
pub trait KvStore: Send + Sync + 'static {
    fn get(&self, key: &str) -> impl Future<Output = StorageResult<Option<Value>>> + Send;

    fn set(&self, key: &str, value: Value) -> impl Future<Output = StorageResult<()>> + Send;

    fn remove(&self, key: &str) -> impl Future<Output = StorageResult<()>> + Send;

    /// All keys currently stored, in no particular order.
    fn keys(&self) -> impl Future<Output = StorageResult<Vec<String>>> + Send;
}

/// In-memory store, lost on drop.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: RwLock<BTreeMap<String, Value>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KvStore for MemoryStore {
    async fn get(&self, key: &str) -> StorageResult<Option<Value>> {
        Ok(self.entries.read().await.get(key).cloned())
    }

    async fn set(&self, key: &str, value: Value) -> StorageResult<()> {
        self.entries.write().await.insert(key.to_owned(), value);
        Ok(())
    }

    async fn remove(&self, key: &str) -> StorageResult<()> {
        self.entries.write().await.remove(key);
        Ok(())
    }

    async fn keys(&self) -> StorageResult<Vec<String>> {
        Ok(self.entries.read().await.keys().cloned().collect())
    }
}

const FILE_SUFFIX: &str = ".json";
const TEMP_SUFFIX: &str = ".json.tmp";

/// One JSON file per key under a directory.
///
/// File names are the hex encoding of the key, so any key (including
/// `entity:sensor.x`) maps to a portable name.
#[derive(Debug, Clone)]
pub struct FileStore {
    dir: PathBuf,
}

impl FileStore {
    /// Opens (and creates if needed) a store rooted at `dir`.
    pub async fn open(dir: impl Into<PathBuf>) -> StorageResult<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir).await?;
        debug!(dir = %dir.display(), "opened file store");
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn file_path(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{}{FILE_SUFFIX}", hex::encode(key)))
    }

    fn temp_path(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{}{TEMP_SUFFIX}", hex::encode(key)))
    }
}

/// Recovers a key from a store file name, skipping temp and foreign files.
fn key_from_file_name(name: &str) -> Option<String> {
    if name.ends_with(TEMP_SUFFIX) {
        return None;
    }
    let encoded = name.strip_suffix(FILE_SUFFIX)?;
    let bytes = hex::decode(encoded).ok()?;
    String::from_utf8(bytes).ok()
}

impl KvStore for FileStore {
    async fn get(&self, key: &str) -> StorageResult<Option<Value>> {
        let bytes = match fs::read(self.file_path(key)).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|source| StorageError::Corrupt {
                key: key.to_owned(),
                source,
            })
    }

    /// Writes to a temp file first, then renames over the old file.
    async fn set(&self, key: &str, value: Value) -> StorageResult<()> {
        let content = serde_json::to_vec(&value)?;
        let temp_path = self.temp_path(key);

        fs::create_dir_all(&self.dir).await?;
        fs::write(&temp_path, &content).await?;
        fs::rename(&temp_path, self.file_path(key)).await?;
        Ok(())
    }

    async fn remove(&self, key: &str) -> StorageResult<()> {
        match fs::remove_file(self.file_path(key)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn keys(&self) -> StorageResult<Vec<String>> {
        let mut entries = match fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut keys = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            let Some(name) = name.to_str() else {
                continue;
            };
            match key_from_file_name(name) {
                Some(key) => keys.push(key),
                None if !name.ends_with(TEMP_SUFFIX) => {
                    warn!(file = name, "ignoring foreign file in store directory");
                }
                None => {}
            }
        }
        Ok(keys)
    }
}
