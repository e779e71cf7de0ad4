use std::time::Duration;

use chrono::{DateTime, Utc};
use indexmap::IndexSet;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::store::expiry_after;

/// Category of a memory entry. Biases retrieval ranking.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum MemoryCategory {
    /// Durable facts worth recalling across many cycles.
    Knowledge,
    /// Short-lived observations such as per-cycle outcomes.
    Transient,
    /// Caller-defined category.
    Custom(String),
}

impl MemoryCategory {
    /// Multiplier applied to retrieval relevance.
    #[must_use]
    pub const fn retrieval_weight(&self) -> f64 {
        match self {
            Self::Knowledge => 1.0,
            Self::Transient => 0.5,
            Self::Custom(_) => 0.75,
        }
    }
}

/// Single memory held in the state store.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MemoryEntry {
    /// Unique key (without the store prefix).
    pub key: String,
    /// Opaque payload.
    pub value: Value,
    /// Category.
    pub category: MemoryCategory,
    /// Importance in `[0, 1]`.
    pub importance: f64,
    /// Tags used for keyword retrieval.
    #[serde(default)]
    pub tags: IndexSet<String>,
    /// Capture time.
    pub created_at: DateTime<Utc>,
    /// Logical expiry, if any.
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
}

impl MemoryEntry {
    /// Creates an entry with medium importance and no expiry.
    #[must_use]
    pub fn new(key: impl Into<String>, value: Value, category: MemoryCategory) -> Self {
        Self {
            key: key.into(),
            value,
            category,
            importance: 0.5,
            tags: IndexSet::new(),
            created_at: Utc::now(),
            expires_at: None,
        }
    }

    /// Sets importance, clamped to `[0, 1]`. Non-finite input becomes zero.
    #[must_use]
    pub fn with_importance(mut self, importance: f64) -> Self {
        self.importance = if importance.is_finite() {
            importance.clamp(0.0, 1.0)
        } else {
            0.0
        };
        self
    }

    /// Adds tags.
    #[must_use]
    pub fn with_tags(mut self, tags: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.tags.extend(tags.into_iter().map(Into::into));
        self
    }

    /// Sets the expiry relative to the capture time.
    #[must_use]
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.expires_at = Some(expiry_after(self.created_at, ttl));
        self
    }

    /// Whether the entry is past its expiry at `now`.
    #[must_use]
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }

    /// Time left before expiry, `None` when the entry never expires.
    #[must_use]
    pub fn remaining_ttl(&self, now: DateTime<Utc>) -> Option<Duration> {
        self.expires_at
            .map(|at| (at - now).to_std().unwrap_or(Duration::ZERO))
    }
}
