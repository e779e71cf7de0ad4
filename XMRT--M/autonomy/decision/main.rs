//! Multi-criteria action selection with an optional, bounded reflection loop.

/// Context adjustments derived from retrieved memories.
pub mod reflection;
/// Criteria weights, candidates, and scoring.
pub mod scoring;

use std::{fmt, sync::Arc, time::Duration};

use serde::{Deserialize, Serialize};
use serde_json::json;
use shared_logging::LogLevel;
use tracing::{debug, warn};
use xmrt_memory_data::KnowledgeRetriever;

use crate::{
    module::{ActionKind, AutonomyError},
    state::AgentState,
    telemetry::AutonomyTelemetry,
};
use reflection::context_adjustment;
use scoring::{rank_scored, score_candidate, ActionCandidate, CriteriaWeights, ScoredCandidate};

/// Rationale key carrying the reflection adjustment.
pub const REFLECTION_CRITERION: &str = "reflection";

/// States a single decision moves through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionPhase {
    /// Nothing evaluated yet.
    Idle,
    /// Base scores computed.
    Scoring,
    /// Re-scoring the leaders with retrieved context.
    Reflecting,
    /// Choice made.
    Committed,
}

/// Why the default action was chosen instead of a scored one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FallbackReason {
    /// Agent state could not be loaded.
    DegradedState,
    /// The component offers no candidates.
    NoCandidates,
    /// A candidate scored NaN or infinity.
    NonFiniteScore,
}

/// Tunables for [`DecisionEngine`].
#[derive(Debug, Clone, PartialEq)]
pub struct DecisionConfig {
    /// Criterion weights.
    pub weights: CriteriaWeights,
    /// Maximum reflection passes; zero disables reflection.
    pub reflection_budget: u32,
    /// How many leaders are re-scored per pass.
    pub reflection_top_k: usize,
    /// Scale applied to the retrieved outcome signal.
    pub reflection_weight: f64,
    /// Memories retrieved per candidate.
    pub retrieval_limit: usize,
    /// Budget for each retriever call.
    pub call_timeout: Duration,
}

impl Default for DecisionConfig {
    fn default() -> Self {
        Self {
            weights: CriteriaWeights::default(),
            reflection_budget: 1,
            reflection_top_k: 3,
            reflection_weight: 0.25,
            retrieval_limit: 8,
            call_timeout: Duration::from_secs(5),
        }
    }
}

impl DecisionConfig {
    /// Rejects settings the engine cannot honour.
    pub fn validate(&self) -> Result<(), AutonomyError> {
        self.weights.validate()?;
        if !self.reflection_weight.is_finite() {
            return Err(AutonomyError::InvalidInput(
                "reflection weight must be finite".to_string(),
            ));
        }
        if self.reflection_budget > 0 && self.reflection_top_k == 0 {
            return Err(AutonomyError::InvalidInput(
                "reflection_top_k must be positive when reflection is enabled".to_string(),
            ));
        }
        Ok(())
    }
}

/// What a decision is made from.
#[derive(Debug, Clone, Copy)]
pub struct DecisionInput<'a> {
    /// Current agent state; `None` when it could not be loaded.
    pub state: Option<&'a AgentState>,
    /// Candidates in insertion order.
    pub candidates: &'a [ActionCandidate],
    /// Taken whenever scoring cannot proceed.
    pub default_action: &'a ActionKind,
}

/// A committed choice.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Decision {
    /// Chosen action.
    pub chosen: ScoredCandidate,
    /// Final ranking, best first. Empty on fallback.
    pub ranking: Vec<ScoredCandidate>,
    /// Phases visited, in order.
    pub phases: Vec<DecisionPhase>,
    /// Completed reflection passes.
    pub reflection_passes: u32,
    /// Set when the default action was taken.
    pub fallback: Option<FallbackReason>,
}

impl Decision {
    fn defaulted(default_action: &ActionKind, mut phases: Vec<DecisionPhase>, reason: FallbackReason) -> Self {
        phases.push(DecisionPhase::Committed);
        Self {
            chosen: ScoredCandidate {
                index: 0,
                candidate: ActionCandidate::from_kind(default_action.clone()),
                score: 0.0,
                rationale: std::collections::BTreeMap::new(),
            },
            ranking: Vec::new(),
            phases,
            reflection_passes: 0,
            fallback: Some(reason),
        }
    }

    /// Whether the default action was taken.
    #[must_use]
    pub const fn is_fallback(&self) -> bool {
        self.fallback.is_some()
    }
}

/// Scores candidates and commits to one. Never fails.
#[derive(Clone)]
pub struct DecisionEngine {
    config: DecisionConfig,
    retriever: Option<Arc<dyn KnowledgeRetriever>>,
    telemetry: Option<AutonomyTelemetry>,
}

impl fmt::Debug for DecisionEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DecisionEngine")
            .field("config", &self.config)
            .field("retriever", &self.retriever.is_some())
            .finish_non_exhaustive()
    }
}

impl DecisionEngine {
    /// Engine without a retriever; reflection is skipped until one is attached.
    #[must_use]
    pub const fn new(config: DecisionConfig) -> Self {
        Self {
            config,
            retriever: None,
            telemetry: None,
        }
    }

    /// Attaches the knowledge retriever used during reflection.
    #[must_use]
    pub fn with_retriever(mut self, retriever: Arc<dyn KnowledgeRetriever>) -> Self {
        self.retriever = Some(retriever);
        self
    }

    /// Attaches telemetry sinks.
    #[must_use]
    pub fn with_telemetry(mut self, telemetry: AutonomyTelemetry) -> Self {
        self.telemetry = Some(telemetry);
        self
    }

    /// Current configuration.
    #[must_use]
    pub const fn config(&self) -> &DecisionConfig {
        &self.config
    }

    /// Picks an action for `input`.
    pub async fn decide(&self, input: DecisionInput<'_>) -> Decision {
        let mut phases = vec![DecisionPhase::Idle];
        let Some(state) = input.state else {
            return self.commit(Decision::defaulted(input.default_action, phases, FallbackReason::DegradedState));
        };
        if input.candidates.is_empty() {
            return self.commit(Decision::defaulted(input.default_action, phases, FallbackReason::NoCandidates));
        }

        phases.push(DecisionPhase::Scoring);
        let base: Vec<ScoredCandidate> = input
            .candidates
            .iter()
            .enumerate()
            .map(|(index, candidate)| {
                score_candidate(&self.config.weights, index, candidate, state.autonomy_level)
            })
            .collect();
        if base.iter().any(|s| !s.score.is_finite()) {
            return self.commit(Decision::defaulted(input.default_action, phases, FallbackReason::NonFiniteScore));
        }
        let mut ranking = base.clone();
        rank_scored(&mut ranking);

        let mut passes = 0;
        if let Some(retriever) = self.retriever.as_ref().filter(|_| self.config.reflection_budget > 0) {
            phases.push(DecisionPhase::Reflecting);
            while passes < self.config.reflection_budget {
                let Some(next) = self.reflect(retriever.as_ref(), &base, &ranking).await else {
                    break;
                };
                passes += 1;
                let unchanged = next.iter().map(|s| s.index).eq(ranking.iter().map(|s| s.index));
                ranking = next;
                if unchanged {
                    break;
                }
            }
        }

        phases.push(DecisionPhase::Committed);
        let chosen = ranking[0].clone();
        self.commit(Decision {
            chosen,
            ranking,
            phases,
            reflection_passes: passes,
            fallback: None,
        })
    }

    /// One pass over the current leaders. `None` when the pass could not
    /// complete; partial adjustments are discarded.
    async fn reflect(
        &self,
        retriever: &dyn KnowledgeRetriever,
        base: &[ScoredCandidate],
        ranking: &[ScoredCandidate],
    ) -> Option<Vec<ScoredCandidate>> {
        let mut adjustments = Vec::new();
        for leader in ranking.iter().take(self.config.reflection_top_k) {
            let topic = leader.candidate.kind.topic();
            let query = retriever.query(&topic, self.config.retrieval_limit);
            match tokio::time::timeout(self.config.call_timeout, query).await {
                Ok(Ok(memories)) => adjustments.push((
                    leader.index,
                    context_adjustment(&memories, self.config.reflection_weight),
                )),
                Ok(Err(err)) => {
                    warn!(%topic, error = %err, "knowledge retrieval failed; ending reflection");
                    return None;
                }
                Err(_) => {
                    warn!(%topic, timeout = ?self.config.call_timeout, "knowledge retrieval timed out; ending reflection");
                    return None;
                }
            }
        }

        let mut next = ranking.to_vec();
        for (index, adjustment) in adjustments {
            let Some(slot) = next.iter_mut().find(|s| s.index == index) else {
                continue;
            };
            let origin = &base[index];
            slot.score = origin.score + adjustment.unwrap_or(0.0);
            slot.rationale = origin.rationale.clone();
            if let Some(value) = adjustment {
                slot.rationale.insert(REFLECTION_CRITERION.to_string(), value);
            }
        }
        if next.iter().any(|s| !s.score.is_finite()) {
            warn!("reflection produced a non-finite score; keeping previous ranking");
            return None;
        }
        rank_scored(&mut next);
        Some(next)
    }

    fn commit(&self, decision: Decision) -> Decision {
        debug!(
            action = %decision.chosen.candidate.kind,
            score = decision.chosen.score,
            passes = decision.reflection_passes,
            fallback = ?decision.fallback,
            "decision committed"
        );
        if let Some(tel) = &self.telemetry {
            if let Err(err) = tel.log(
                LogLevel::Debug,
                "autonomy.decision.committed",
                json!({
                    "action": decision.chosen.candidate.kind.to_string(),
                    "score": decision.chosen.score,
                    "reflection_passes": decision.reflection_passes,
                    "fallback": decision.fallback,
                }),
            ) {
                warn!(error = %err, "audit log write failed");
            }
        }
        decision
    }
}
