use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::module::{ActionKind, AutonomyError};

/// Weight applied to each decision criterion. Risk is normally negative.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CriteriaWeights {
    /// Weight of the expected benefit.
    pub expected_value: f64,
    /// Weight of the estimated risk.
    pub risk: f64,
    /// Weight of how closely the action fits the current autonomy level.
    pub autonomy_alignment: f64,
}

impl Default for CriteriaWeights {
    fn default() -> Self {
        Self {
            expected_value: 0.5,
            risk: -0.3,
            autonomy_alignment: 0.2,
        }
    }
}

impl CriteriaWeights {
    /// Rejects non-finite weights.
    pub fn validate(&self) -> Result<(), AutonomyError> {
        let weights = [self.expected_value, self.risk, self.autonomy_alignment];
        if weights.iter().all(|w| w.is_finite()) {
            Ok(())
        } else {
            Err(AutonomyError::InvalidInput(format!(
                "criteria weights must be finite: {self:?}"
            )))
        }
    }
}

/// An action considered in a cycle, with its criteria.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionCandidate {
    /// What would be done.
    pub kind: ActionKind,
    /// Expected benefit in `[0, 1]`.
    pub expected_value: f64,
    /// Estimated risk in `[0, 1]`.
    pub risk: f64,
    /// Autonomy level the action suits.
    pub required_autonomy: f64,
}

impl ActionCandidate {
    /// Candidate carrying the kind's default criteria.
    #[must_use]
    pub fn from_kind(kind: ActionKind) -> Self {
        let profile = kind.profile();
        Self {
            kind,
            expected_value: profile.expected_value,
            risk: profile.risk,
            required_autonomy: profile.required_autonomy,
        }
    }

    /// Overrides the expected value.
    #[must_use]
    pub fn with_expected_value(mut self, value: f64) -> Self {
        self.expected_value = value;
        self
    }

    /// Overrides the risk.
    #[must_use]
    pub fn with_risk(mut self, risk: f64) -> Self {
        self.risk = risk;
        self
    }

    /// Overrides the required autonomy.
    #[must_use]
    pub fn with_required_autonomy(mut self, level: f64) -> Self {
        self.required_autonomy = level;
        self
    }
}

/// A candidate with its score and per-criterion breakdown.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoredCandidate {
    /// Position in the input list. Ties resolve to the lowest index.
    pub index: usize,
    /// The candidate.
    pub candidate: ActionCandidate,
    /// Weighted score, reflection adjustments included.
    pub score: f64,
    /// Criterion name to weighted contribution.
    pub rationale: BTreeMap<String, f64>,
}

/// Scores `candidate` at the given autonomy level.
///
/// The result may be non-finite when inputs are; callers decide what that means.
#[must_use]
pub fn score_candidate(
    weights: &CriteriaWeights,
    index: usize,
    candidate: &ActionCandidate,
    autonomy_level: f64,
) -> ScoredCandidate {
    let alignment = 1.0 - (autonomy_level - candidate.required_autonomy).abs();
    let contributions = [
        ("expected_value", weights.expected_value * candidate.expected_value),
        ("risk", weights.risk * candidate.risk),
        ("autonomy_alignment", weights.autonomy_alignment * alignment),
    ];
    let score = contributions.iter().map(|(_, value)| value).sum();
    ScoredCandidate {
        index,
        candidate: candidate.clone(),
        score,
        rationale: contributions
            .into_iter()
            .map(|(name, value)| (name.to_string(), value))
            .collect(),
    }
}

/// Orders by score descending, then index ascending. Scores must be finite.
pub fn rank_scored(scored: &mut [ScoredCandidate]) {
    scored.sort_by(|a, b| b.score.total_cmp(&a.score).then(a.index.cmp(&b.index)));
}
