use std::{collections::BTreeMap, sync::Arc, time::Duration};

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::RwLock;
use serde_json::Value;

use crate::store::{validate_key, StateStore, StoreError, StoredValue};

/// In-process state store. Expired values are hidden on read and dropped by
/// [`StateStore::evict_expired`].
///
/// Clones share the same underlying map.
#[derive(Debug, Clone, Default)]
pub struct MemoryStateStore {
    entries: Arc<RwLock<BTreeMap<String, StoredValue>>>,
}

impl MemoryStateStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of physically held values, expired ones included.
    #[must_use]
    pub fn raw_len(&self) -> usize {
        self.entries.read().len()
    }
}

#[async_trait]
impl StateStore for MemoryStateStore {
    async fn put(&self, key: &str, value: Value, ttl: Option<Duration>) -> Result<(), StoreError> {
        validate_key(key)?;
        let stored = StoredValue::new(key, value, ttl);
        self.entries.write().insert(key.to_string(), stored);
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Value, StoreError> {
        validate_key(key)?;
        let now = Utc::now();
        self.entries
            .read()
            .get(key)
            .filter(|stored| !stored.is_expired(now))
            .map(|stored| stored.value.clone())
            .ok_or_else(|| StoreError::NotFound(key.to_string()))
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        validate_key(key)?;
        self.entries.write().remove(key);
        Ok(())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        let now = Utc::now();
        let entries = self.entries.read();
        Ok(entries
            .range(prefix.to_string()..)
            .take_while(|(key, _)| key.starts_with(prefix))
            .filter(|(_, stored)| !stored.is_expired(now))
            .map(|(key, _)| key.clone())
            .collect())
    }

    async fn evict_expired(&self) -> Result<usize, StoreError> {
        let now = Utc::now();
        let mut entries = self.entries.write();
        let before = entries.len();
        entries.retain(|_, stored| !stored.is_expired(now));
        Ok(before - entries.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn put_get_delete_roundtrip() {
        let store = MemoryStateStore::new();
        store.put("agent/a/state", json!({ "v": 1 }), None).await.unwrap();
        assert_eq!(store.get("agent/a/state").await.unwrap(), json!({ "v": 1 }));
        store.delete("agent/a/state").await.unwrap();
        store.delete("agent/a/state").await.unwrap();
        assert_eq!(
            store.get("agent/a/state").await,
            Err(StoreError::NotFound("agent/a/state".into()))
        );
    }

    #[tokio::test]
    async fn expired_values_behave_like_missing() {
        let store = MemoryStateStore::new();
        store
            .put("memory/short", json!("gone soon"), Some(Duration::from_millis(10)))
            .await
            .unwrap();
        store.put("memory/long", json!("stays"), None).await.unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;

        assert!(matches!(
            store.get("memory/short").await,
            Err(StoreError::NotFound(_))
        ));
        assert_eq!(store.list("memory/").await.unwrap(), vec!["memory/long"]);
        // Still physically present until eviction.
        assert_eq!(store.raw_len(), 2);
        assert_eq!(store.evict_expired().await.unwrap(), 1);
        assert_eq!(store.raw_len(), 1);
    }

    #[tokio::test]
    async fn list_is_prefix_scoped_and_sorted() {
        let store = MemoryStateStore::new();
        for key in ["agent/b/state", "agent/a/state", "memory/x", "agent"] {
            store.put(key, Value::Null, None).await.unwrap();
        }
        assert_eq!(
            store.list("agent/").await.unwrap(),
            vec!["agent/a/state", "agent/b/state"]
        );
        assert_eq!(store.list("").await.unwrap().len(), 4);
    }

    #[tokio::test]
    async fn clones_share_state() {
        let store = MemoryStateStore::new();
        let other = store.clone();
        store.put("k", json!(1), None).await.unwrap();
        assert_eq!(other.get("k").await.unwrap(), json!(1));
    }
}
