use std::{
    fmt::Write as _,
    io,
    path::{Path, PathBuf},
    time::Duration,
};

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use tokio::{fs, sync::Mutex};
use uuid::Uuid;

use crate::store::{validate_key, StateStore, StoreError, StoredValue};

const DOCUMENT_EXT: &str = "json";
/// Longest file name common filesystems accept.
const MAX_FILE_NAME: usize = 255;

/// Durable state store keeping one JSON document per key under a root
/// directory.
///
/// Writes go to a temporary file that is renamed over the target, so readers
/// see either the previous or the new document, never a partial one.
#[derive(Debug)]
pub struct FileStateStore {
    root: PathBuf,
    // Serializes mutations so eviction never races a concurrent rewrite.
    write_lock: Mutex<()>,
}

impl FileStateStore {
    /// Opens (and creates if needed) a store rooted at `root`.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let root = root.into();
        std::fs::create_dir_all(&root).map_err(|err| unavailable(&root, &err))?;
        Ok(Self {
            root,
            write_lock: Mutex::new(()),
        })
    }

    /// Root directory.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, key: &str) -> Result<PathBuf, StoreError> {
        validate_key(key)?;
        let name = format!("{}.{DOCUMENT_EXT}", encode_key(key));
        if name.len() > MAX_FILE_NAME {
            return Err(StoreError::InvalidKey(key.to_string()));
        }
        Ok(self.root.join(name))
    }

    async fn read_document(&self, path: &Path) -> Result<Option<StoredValue>, StoreError> {
        match fs::read(path).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                // A vanished root means the store is gone, not the key.
                fs::metadata(&self.root)
                    .await
                    .map_err(|root_err| unavailable(&self.root, &root_err))?;
                Ok(None)
            }
            Err(err) => Err(unavailable(path, &err)),
        }
    }

    async fn document_paths(&self) -> Result<Vec<(String, PathBuf)>, StoreError> {
        let mut dir = fs::read_dir(&self.root)
            .await
            .map_err(|err| unavailable(&self.root, &err))?;
        let mut found = Vec::new();
        while let Some(item) = dir
            .next_entry()
            .await
            .map_err(|err| unavailable(&self.root, &err))?
        {
            let path = item.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some(DOCUMENT_EXT) {
                continue;
            }
            let Some(key) = path
                .file_stem()
                .and_then(|stem| stem.to_str())
                .and_then(decode_key)
            else {
                continue;
            };
            found.push((key, path));
        }
        Ok(found)
    }
}

#[async_trait]
impl StateStore for FileStateStore {
    async fn put(&self, key: &str, value: Value, ttl: Option<Duration>) -> Result<(), StoreError> {
        let target = self.path_for(key)?;
        let stored = StoredValue::new(key, value, ttl);
        let bytes = serde_json::to_vec_pretty(&stored)?;
        let staging = self.root.join(format!(".staging-{}", Uuid::new_v4()));

        let _guard = self.write_lock.lock().await;
        fs::write(&staging, &bytes)
            .await
            .map_err(|err| unavailable(&staging, &err))?;
        if let Err(err) = fs::rename(&staging, &target).await {
            let _ = fs::remove_file(&staging).await;
            return Err(unavailable(&target, &err));
        }
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Value, StoreError> {
        let path = self.path_for(key)?;
        let now = Utc::now();
        match self.read_document(&path).await? {
            Some(stored) if !stored.is_expired(now) => Ok(stored.value),
            _ => Err(StoreError::NotFound(key.to_string())),
        }
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        let path = self.path_for(key)?;
        let _guard = self.write_lock.lock().await;
        match fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(unavailable(&path, &err)),
        }
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        let now = Utc::now();
        let mut keys = Vec::new();
        for (key, path) in self.document_paths().await? {
            if !key.starts_with(prefix) {
                continue;
            }
            // Documents removed between listing and reading are skipped.
            if let Some(stored) = self.read_document(&path).await? {
                if !stored.is_expired(now) {
                    keys.push(key);
                }
            }
        }
        keys.sort();
        Ok(keys)
    }

    async fn evict_expired(&self) -> Result<usize, StoreError> {
        let now = Utc::now();
        let _guard = self.write_lock.lock().await;
        let mut removed = 0;
        for (key, path) in self.document_paths().await? {
            let expired = match self.read_document(&path).await {
                Ok(Some(stored)) => stored.is_expired(now),
                Ok(None) => false,
                Err(StoreError::Serialization(reason)) => {
                    tracing::warn!(%key, %reason, "skipping undecodable state document");
                    false
                }
                Err(err) => return Err(err),
            };
            if expired {
                match fs::remove_file(&path).await {
                    Ok(()) => removed += 1,
                    Err(err) if err.kind() == io::ErrorKind::NotFound => {}
                    Err(err) => return Err(unavailable(&path, &err)),
                }
            }
        }
        Ok(removed)
    }
}

fn unavailable(path: &Path, err: &io::Error) -> StoreError {
    StoreError::Unavailable(format!("{}: {err}", path.display()))
}

/// Maps a key onto a portable file stem: `[A-Za-z0-9_-]` pass through,
/// every other byte becomes `%XX`.
fn encode_key(key: &str) -> String {
    let mut encoded = String::with_capacity(key.len());
    for byte in key.bytes() {
        if byte.is_ascii_alphanumeric() || byte == b'_' || byte == b'-' {
            encoded.push(char::from(byte));
        } else {
            let _ = write!(encoded, "%{byte:02X}");
        }
    }
    encoded
}

fn decode_key(stem: &str) -> Option<String> {
    let bytes = stem.as_bytes();
    let mut decoded = Vec::with_capacity(bytes.len());
    let mut idx = 0;
    while idx < bytes.len() {
        if bytes[idx] == b'%' {
            let hex = stem.get(idx + 1..idx + 3)?;
            decoded.push(u8::from_str_radix(hex, 16).ok()?);
            idx += 3;
        } else {
            decoded.push(bytes[idx]);
            idx += 1;
        }
    }
    String::from_utf8(decoded).ok()
}
