//! Memory service layering typed agent memories over a [`StateStore`].

use std::{fmt, sync::Arc, time::Duration};

use chrono::Utc;
use tracing::{debug, instrument};

use crate::{
    entry::MemoryEntry,
    store::{get_json, put_json, StateStore, StoreError},
};

/// Key prefix under which memories live in the shared store.
pub const MEMORY_PREFIX: &str = "memory/";

/// Captures, recalls, and expires [`MemoryEntry`] values.
#[derive(Clone)]
pub struct MemoryService {
    store: Arc<dyn StateStore>,
    default_ttl: Option<Duration>,
}

impl fmt::Debug for MemoryService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryService")
            .field("default_ttl", &self.default_ttl)
            .finish_non_exhaustive()
    }
}

impl MemoryService {
    /// Creates a service. `default_ttl` applies to entries without their own
    /// expiry; `None` keeps them indefinitely.
    #[must_use]
    pub fn new(store: Arc<dyn StateStore>, default_ttl: Option<Duration>) -> Self {
        Self { store, default_ttl }
    }

    /// Underlying store handle.
    #[must_use]
    pub fn store(&self) -> Arc<dyn StateStore> {
        Arc::clone(&self.store)
    }

    fn storage_key(key: &str) -> String {
        format!("{MEMORY_PREFIX}{key}")
    }

    /// Persists `entry`, applying the default TTL when it has no expiry.
    #[instrument(skip(self, entry), fields(key = %entry.key))]
    pub async fn remember(&self, mut entry: MemoryEntry) -> Result<MemoryEntry, StoreError> {
        if entry.expires_at.is_none() {
            if let Some(ttl) = self.default_ttl {
                entry = entry.with_ttl(ttl);
            }
        }
        let ttl = entry.remaining_ttl(Utc::now());
        put_json(
            self.store.as_ref(),
            &Self::storage_key(&entry.key),
            &entry,
            ttl,
        )
        .await?;
        debug!(category = ?entry.category, importance = entry.importance, "memory captured");
        Ok(entry)
    }

    /// Reads a single live memory.
    pub async fn recall(&self, key: &str) -> Result<MemoryEntry, StoreError> {
        let entry: MemoryEntry = get_json(self.store.as_ref(), &Self::storage_key(key)).await?;
        if entry.is_expired(Utc::now()) {
            return Err(StoreError::NotFound(key.to_string()));
        }
        Ok(entry)
    }

    /// Removes a memory. Missing keys are fine.
    pub async fn forget(&self, key: &str) -> Result<(), StoreError> {
        self.store.delete(&Self::storage_key(key)).await
    }

    /// All live memories, ordered by key.
    ///
    /// Entries that vanish or expire between listing and reading are skipped.
    pub async fn entries(&self) -> Result<Vec<MemoryEntry>, StoreError> {
        let keys = self.store.list(MEMORY_PREFIX).await?;
        let mut entries = Vec::with_capacity(keys.len());
        for storage_key in keys {
            let key = &storage_key[MEMORY_PREFIX.len()..];
            match self.recall(key).await {
                Ok(entry) => entries.push(entry),
                Err(StoreError::NotFound(_)) => {}
                Err(StoreError::Serialization(reason)) => {
                    tracing::warn!(%key, %reason, "ignoring undecodable memory");
                }
                Err(err) => return Err(err),
            }
        }
        Ok(entries)
    }

    /// Physically evicts expired values from the backing store.
    pub async fn sweep(&self) -> Result<usize, StoreError> {
        let removed = self.store.evict_expired().await?;
        debug!(removed, "memory sweep finished");
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{entry::MemoryCategory, short_term::MemoryStateStore};
    use serde_json::json;

    fn service(default_ttl: Option<Duration>) -> (MemoryService, MemoryStateStore) {
        let store = MemoryStateStore::new();
        (MemoryService::new(Arc::new(store.clone()), default_ttl), store)
    }

    #[tokio::test]
    async fn remember_and_recall() {
        let (memory, _) = service(None);
        let entry = MemoryEntry::new("pool/health", json!({ "miners": 1200 }), MemoryCategory::Knowledge)
            .with_tags(["pool", "health"]);
        memory.remember(entry.clone()).await.unwrap();
        let recalled = memory.recall("pool/health").await.unwrap();
        assert_eq!(recalled, entry);
        memory.forget("pool/health").await.unwrap();
        assert!(matches!(
            memory.recall("pool/health").await,
            Err(StoreError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn default_ttl_applies_only_without_expiry() {
        let (memory, store) = service(Some(Duration::from_millis(10)));
        memory
            .remember(MemoryEntry::new("brief", json!(1), MemoryCategory::Transient))
            .await
            .unwrap();
        memory
            .remember(
                MemoryEntry::new("explicit", json!(2), MemoryCategory::Knowledge)
                    .with_ttl(Duration::from_secs(3600)),
            )
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;

        let keys: Vec<String> = memory
            .entries()
            .await
            .unwrap()
            .into_iter()
            .map(|entry| entry.key)
            .collect();
        assert_eq!(keys, vec!["explicit"]);
        assert_eq!(memory.sweep().await.unwrap(), 1);
        assert_eq!(store.raw_len(), 1);
    }
}
