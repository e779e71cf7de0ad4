//! Storage contract shared by every backend.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Errors surfaced by state store backends.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// The backing storage cannot be reached. Callers should degrade, not fail.
    #[error("state store unavailable: {0}")]
    Unavailable(String),
    /// No live value exists for the key (never written, deleted, or expired).
    #[error("key not found: {0}")]
    NotFound(String),
    /// Stored payload could not be encoded or decoded.
    #[error("serialization error: {0}")]
    Serialization(String),
    /// Key rejected by the backend.
    #[error("invalid key: {0:?}")]
    InvalidKey(String),
}

impl StoreError {
    /// Whether a later retry can succeed.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::Unavailable(_))
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

/// Key-scoped persistent storage with optional logical expiry.
///
/// A `get` after expiry must be indistinguishable from [`StoreError::NotFound`]
/// whether or not the value has been physically removed. Every operation is
/// idempotent.
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Writes `value` under `key`, replacing any previous value.
    async fn put(&self, key: &str, value: Value, ttl: Option<Duration>) -> Result<(), StoreError>;

    /// Reads the live value for `key`.
    async fn get(&self, key: &str) -> Result<Value, StoreError>;

    /// Removes `key`. Deleting a missing key succeeds.
    async fn delete(&self, key: &str) -> Result<(), StoreError>;

    /// Lists live keys starting with `prefix`, sorted ascending.
    async fn list(&self, prefix: &str) -> Result<Vec<String>, StoreError>;

    /// Physically drops expired values, returning how many were removed.
    async fn evict_expired(&self) -> Result<usize, StoreError>;
}

/// Serializes `value` and writes it under `key`.
pub async fn put_json<T>(
    store: &dyn StateStore,
    key: &str,
    value: &T,
    ttl: Option<Duration>,
) -> Result<(), StoreError>
where
    T: Serialize + Sync + ?Sized,
{
    let encoded = serde_json::to_value(value)?;
    store.put(key, encoded, ttl).await
}

/// Reads `key` and decodes it into `T`.
pub async fn get_json<T>(store: &dyn StateStore, key: &str) -> Result<T, StoreError>
where
    T: DeserializeOwned,
{
    let raw = store.get(key).await?;
    Ok(serde_json::from_value(raw)?)
}

/// Rejects keys no backend can address.
pub(crate) fn validate_key(key: &str) -> Result<(), StoreError> {
    if key.is_empty() || key.chars().any(char::is_control) {
        return Err(StoreError::InvalidKey(key.to_string()));
    }
    Ok(())
}

/// Value plus expiry bookkeeping, as held by the backends.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct StoredValue {
    pub key: String,
    pub value: Value,
    pub stored_at: DateTime<Utc>,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
}

impl StoredValue {
    pub fn new(key: &str, value: Value, ttl: Option<Duration>) -> Self {
        let stored_at = Utc::now();
        Self {
            key: key.to_string(),
            value,
            stored_at,
            expires_at: ttl.map(|ttl| expiry_after(stored_at, ttl)),
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

/// `start + ttl`, saturating at the maximum representable instant.
#[must_use]
pub fn expiry_after(start: DateTime<Utc>, ttl: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(ttl)
        .ok()
        .and_then(|delta| start.checked_add_signed(delta))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}
