use serde_json::Value;
use xmrt_memory_data::{MemoryEntry, RankedMemory};

/// Outcome signal stored on a memory, clamped to `[-1, 1]`.
///
/// Memories written by the cycle runner carry `{"outcome": 1.0 | -1.0}`.
/// Anything else counts as neutral.
#[must_use]
pub fn outcome_of(entry: &MemoryEntry) -> f64 {
    entry
        .value
        .get("outcome")
        .and_then(Value::as_f64)
        .filter(|v| v.is_finite())
        .map_or(0.0, |v| v.clamp(-1.0, 1.0))
}

/// Relevance-weighted mean outcome of `memories`, scaled by `weight`.
///
/// `None` when nothing relevant was retrieved.
#[must_use]
pub fn context_adjustment(memories: &[RankedMemory], weight: f64) -> Option<f64> {
    let (weighted, total) = memories
        .iter()
        .filter(|m| m.relevance.is_finite() && m.relevance > 0.0)
        .fold((0.0, 0.0), |(weighted, total), m| {
            (weighted + m.relevance * outcome_of(&m.entry), total + m.relevance)
        });
    (total > 0.0).then(|| weight * weighted / total)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use xmrt_memory_data::MemoryCategory;

    fn ranked(outcome: Value, relevance: f64) -> RankedMemory {
        RankedMemory {
            entry: MemoryEntry::new("k", json!({ "outcome": outcome }), MemoryCategory::Transient),
            relevance,
        }
    }

    #[test]
    fn outcome_is_clamped_and_defaults_to_neutral() {
        assert!((outcome_of(&ranked(json!(5.0), 1.0).entry) - 1.0).abs() < f64::EPSILON);
        assert!(outcome_of(&ranked(json!("good"), 1.0).entry).abs() < f64::EPSILON);
    }

    #[test]
    fn adjustment_weights_by_relevance() {
        let memories = [ranked(json!(1.0), 3.0), ranked(json!(-1.0), 1.0)];
        let adjustment = context_adjustment(&memories, 0.25).unwrap();
        // 0.25 * (3 - 1) / 4
        assert!((adjustment - 0.125).abs() < 1e-12);
        assert_eq!(context_adjustment(&[], 0.25), None);
    }
}
