//! Knowledge retrieval over stored memories.

use std::cmp::Ordering;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use indexmap::IndexSet;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::{entry::MemoryEntry, orchestration_entry::MemoryService, store::StoreError};

static KEYWORD: Lazy<Regex> = Lazy::new(|| Regex::new(r"[a-z0-9]+").expect("valid keyword regex"));

const CONTENT_HIT: f64 = 10.0;
const TAG_HIT: f64 = 3.0;
const IMPORTANCE_BONUS: f64 = 5.0;

/// A memory together with its relevance to a query.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RankedMemory {
    /// Matched entry.
    pub entry: MemoryEntry,
    /// Relevance score; higher is better.
    pub relevance: f64,
}

/// Capability used by the decision engine to pull context for a topic.
#[async_trait]
pub trait KnowledgeRetriever: Send + Sync {
    /// Returns at most `limit` memories ranked by relevance to `topic`.
    async fn query(&self, topic: &str, limit: usize) -> Result<Vec<RankedMemory>, StoreError>;
}

/// Store-backed keyword matcher.
///
/// Each topic keyword found in an entry's payload scores 10, each tag
/// containing a keyword scores 3. Keys are addresses and never match. Matching entries then gain `5 * importance`
/// and a recency bonus (+5 under a week, +2 under a month), and the total is
/// scaled by the category weight.
#[derive(Debug, Clone)]
pub struct KeywordRetriever {
    memory: MemoryService,
}

impl KeywordRetriever {
    /// Creates a retriever over `memory`.
    #[must_use]
    pub const fn new(memory: MemoryService) -> Self {
        Self { memory }
    }
}

#[async_trait]
impl KnowledgeRetriever for KeywordRetriever {
    async fn query(&self, topic: &str, limit: usize) -> Result<Vec<RankedMemory>, StoreError> {
        let keywords = keywords(topic);
        if keywords.is_empty() || limit == 0 {
            return Ok(Vec::new());
        }
        let now = Utc::now();
        let mut ranked: Vec<RankedMemory> = self
            .memory
            .entries()
            .await?
            .into_iter()
            .filter_map(|entry| {
                score_entry(&entry, &keywords, now).map(|relevance| RankedMemory { entry, relevance })
            })
            .collect();
        ranked.sort_by(compare_ranked);
        ranked.truncate(limit);
        Ok(ranked)
    }
}

/// Lower-cased alphanumeric keywords of `topic`, first occurrence order.
#[must_use]
pub fn keywords(topic: &str) -> IndexSet<String> {
    let lowered = topic.to_lowercase();
    KEYWORD
        .find_iter(&lowered)
        .map(|m| m.as_str().to_string())
        .collect()
}

/// Relevance of `entry` for `keywords`, `None` when nothing matches.
#[must_use]
pub fn score_entry(
    entry: &MemoryEntry,
    keywords: &IndexSet<String>,
    now: DateTime<Utc>,
) -> Option<f64> {
    let haystack = entry.value.to_string().to_lowercase();
    let tags: Vec<String> = entry.tags.iter().map(|tag| tag.to_lowercase()).collect();

    let mut score = 0.0;
    for keyword in keywords {
        if haystack.contains(keyword.as_str()) {
            score += CONTENT_HIT;
        }
        for tag in &tags {
            if tag.contains(keyword.as_str()) {
                score += TAG_HIT;
            }
        }
    }
    if score <= 0.0 {
        return None;
    }

    score += IMPORTANCE_BONUS * entry.importance;
    let age_days = (now - entry.created_at).num_days();
    if age_days < 7 {
        score += 5.0;
    } else if age_days < 30 {
        score += 2.0;
    }
    Some(score * entry.category.retrieval_weight())
}

fn compare_ranked(a: &RankedMemory, b: &RankedMemory) -> Ordering {
    b.relevance
        .total_cmp(&a.relevance)
        .then_with(|| a.entry.key.cmp(&b.entry.key))
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::{entry::MemoryCategory, short_term::MemoryStateStore};
    use serde_json::json;

    fn retriever() -> (KeywordRetriever, MemoryService) {
        let memory = MemoryService::new(Arc::new(MemoryStateStore::new()), None);
        (KeywordRetriever::new(memory.clone()), memory)
    }

    #[test]
    fn keywords_split_on_punctuation() {
        let found: Vec<String> = keywords("Refresh_Leaderboard, mesh-bonus!").into_iter().collect();
        assert_eq!(found, vec!["refresh", "leaderboard", "mesh", "bonus"]);
    }

    #[test]
    fn knowledge_outranks_transient_with_same_match() {
        let now = Utc::now();
        let kw = keywords("treasury");
        let knowledge = MemoryEntry::new("policy/1", json!("treasury split"), MemoryCategory::Knowledge);
        let transient = MemoryEntry::new("outcome/1", json!("treasury split"), MemoryCategory::Transient);
        let k = score_entry(&knowledge, &kw, now).unwrap();
        let t = score_entry(&transient, &kw, now).unwrap();
        assert!(k > t);
        assert!((k - 2.0 * t).abs() < 1e-9);
    }

    #[test]
    fn old_entries_lose_recency_bonus() {
        let now = Utc::now();
        let kw = keywords("mesh");
        let mut entry = MemoryEntry::new("note/1", json!("mesh"), MemoryCategory::Knowledge)
            .with_importance(0.0);
        assert_eq!(score_entry(&entry, &kw, now), Some(15.0));
        entry.created_at = now - chrono::Duration::days(10);
        assert_eq!(score_entry(&entry, &kw, now), Some(12.0));
        entry.created_at = now - chrono::Duration::days(90);
        assert_eq!(score_entry(&entry, &kw, now), Some(10.0));
    }

    #[test]
    fn owner_named_in_key_is_not_evidence() {
        let now = Utc::now();
        let entry = MemoryEntry::new(
            "outcome/leaderboard-agent/consolidate_memory/001",
            json!({ "action": "consolidate_memory", "outcome": -1.0 }),
            MemoryCategory::Transient,
        )
        .with_tags(["consolidate memory"]);
        assert_eq!(score_entry(&entry, &keywords("refresh leaderboard"), now), None);
        assert!(score_entry(&entry, &keywords("consolidate memory"), now).is_some());
    }

    #[tokio::test]
    async fn query_ranks_and_limits() {
        let (retriever, memory) = retriever();
        memory
            .remember(
                MemoryEntry::new("outcome/1", json!({ "action": "allocate_treasury" }), MemoryCategory::Transient)
                    .with_tags(["treasury"]),
            )
            .await
            .unwrap();
        memory
            .remember(
                MemoryEntry::new("policy/treasury", json!("treasury keeps 85/15"), MemoryCategory::Knowledge)
                    .with_importance(1.0),
            )
            .await
            .unwrap();
        memory
            .remember(MemoryEntry::new("unrelated", json!("mesh"), MemoryCategory::Knowledge))
            .await
            .unwrap();

        let ranked = retriever.query("treasury", 5).await.unwrap();
        let keys: Vec<&str> = ranked.iter().map(|r| r.entry.key.as_str()).collect();
        assert_eq!(keys, vec!["policy/treasury", "outcome/1"]);

        let top = retriever.query("treasury", 1).await.unwrap();
        assert_eq!(top.len(), 1);
        assert!(retriever.query("   ", 5).await.unwrap().is_empty());
    }
}
