use std::{collections::BTreeMap, fmt, future::Future, sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;
use xmrt_memory_data::{get_json, put_json, StateStore, StoreError};

use crate::module::{ActionKind, AutonomyError};

/// Persistent per-agent record. Only the owning component mutates it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AgentState {
    /// Owning component id.
    pub agent_id: String,
    /// Current autonomy level in `[0, 1]`.
    pub autonomy_level: f64,
    /// Sum of scores of applied actions.
    pub accumulated_score: f64,
    /// Highest cycle id consumed. Zero before the first cycle.
    pub last_cycle_id: u64,
    /// Bumped on every mutation.
    pub version: u64,
    /// Last mutation time.
    pub updated_at: DateTime<Utc>,
}

impl AgentState {
    /// Fresh state at `autonomy_level` (clamped).
    #[must_use]
    pub fn new(agent_id: impl Into<String>, autonomy_level: f64) -> Self {
        Self {
            agent_id: agent_id.into(),
            autonomy_level: clamp_unit(autonomy_level),
            accumulated_score: 0.0,
            last_cycle_id: 0,
            version: 0,
            updated_at: Utc::now(),
        }
    }

    /// Id the next cycle will use.
    pub fn next_cycle_id(&self) -> Result<u64, AutonomyError> {
        self.last_cycle_id.checked_add(1).ok_or_else(|| {
            AutonomyError::Fatal(format!("{}: cycle id space exhausted", self.agent_id))
        })
    }

    /// Picks whichever of two copies is further along.
    #[must_use]
    pub fn newest(self, other: Self) -> Self {
        if (other.last_cycle_id, other.version) > (self.last_cycle_id, self.version) {
            other
        } else {
            self
        }
    }

    /// Marks `cycle_id` consumed without changing score or autonomy.
    pub fn consume_cycle(&mut self, cycle_id: u64) {
        self.last_cycle_id = self.last_cycle_id.max(cycle_id);
        self.version += 1;
        self.updated_at = Utc::now();
    }

    /// Raises the consumed mark to `cycle_id` when another record shows it
    /// was already used. Not a mutation of the agent itself.
    pub fn raise_high_water(&mut self, cycle_id: u64) {
        self.last_cycle_id = self.last_cycle_id.max(cycle_id);
    }

    /// Consumes `cycle_id`, adds `score`, and nudges autonomy by `delta`.
    pub fn advance(&mut self, cycle_id: u64, score: f64, delta: f64) {
        if score.is_finite() {
            self.accumulated_score += score;
        }
        self.autonomy_level = clamp_unit(self.autonomy_level + delta);
        self.consume_cycle(cycle_id);
    }
}

fn clamp_unit(value: f64) -> f64 {
    if value.is_finite() {
        value.clamp(0.0, 1.0)
    } else {
        0.0
    }
}

/// How a cycle ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CycleOutcome {
    /// Chosen action applied and state persisted.
    Success,
    /// Something degraded or was rejected; the component keeps running.
    PartialFailure,
    /// The component must stop.
    Fatal,
}

impl fmt::Display for CycleOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Success => "success",
            Self::PartialFailure => "partial_failure",
            Self::Fatal => "fatal",
        })
    }
}

/// One action decided within a cycle. Immutable once appended.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ActionRecord {
    /// Action kind.
    pub kind: ActionKind,
    /// Final score.
    pub score: f64,
    /// Criterion name to weighted contribution.
    pub rationale: BTreeMap<String, f64>,
    /// Whether the side effect took place.
    pub applied: bool,
    /// Whether this is the fallback action.
    #[serde(default)]
    pub fallback: bool,
    /// Result summary or failure reason.
    #[serde(default)]
    pub detail: Option<String>,
}

/// A cycle in progress. Closing it yields the immutable [`CycleRecord`].
#[derive(Debug)]
pub struct OpenCycle {
    cycle_id: u64,
    agent_id: String,
    started_at: DateTime<Utc>,
    actions: Vec<ActionRecord>,
    reflection_passes: u32,
    notes: Vec<String>,
}

impl OpenCycle {
    /// Starts cycle `cycle_id` for `agent_id`.
    #[must_use]
    pub fn start(agent_id: impl Into<String>, cycle_id: u64) -> Self {
        Self {
            cycle_id,
            agent_id: agent_id.into(),
            started_at: Utc::now(),
            actions: Vec::new(),
            reflection_passes: 0,
            notes: Vec::new(),
        }
    }

    /// Cycle id.
    #[must_use]
    pub const fn cycle_id(&self) -> u64 {
        self.cycle_id
    }

    /// Appends a decided action.
    pub fn push_action(&mut self, action: ActionRecord) {
        self.actions.push(action);
    }

    /// Records how many reflection passes the decision used.
    pub fn set_reflection_passes(&mut self, passes: u32) {
        self.reflection_passes = passes;
    }

    /// Adds a free-form note (degradations, errors).
    pub fn note(&mut self, note: impl Into<String>) {
        self.notes.push(note.into());
    }

    /// Closes the cycle.
    #[must_use]
    pub fn close(self, outcome: CycleOutcome) -> CycleRecord {
        CycleRecord {
            cycle_id: self.cycle_id,
            agent_id: self.agent_id,
            started_at: self.started_at,
            ended_at: Utc::now(),
            outcome,
            actions_taken: self.actions,
            reflection_passes: self.reflection_passes,
            notes: self.notes,
        }
    }
}

/// Closed, immutable account of one cycle.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CycleRecord {
    /// Strictly increasing per agent.
    pub cycle_id: u64,
    /// Owning component.
    pub agent_id: String,
    /// Start time.
    pub started_at: DateTime<Utc>,
    /// End time.
    pub ended_at: DateTime<Utc>,
    /// Outcome.
    pub outcome: CycleOutcome,
    /// Actions decided in this cycle.
    pub actions_taken: Vec<ActionRecord>,
    /// Reflection passes used by the decision.
    #[serde(default)]
    pub reflection_passes: u32,
    /// Degradations and errors observed.
    #[serde(default)]
    pub notes: Vec<String>,
}

/// Store key of an agent's state.
#[must_use]
pub fn state_key(agent_id: &str) -> String {
    format!("agent/{agent_id}/state")
}

fn high_water_key(agent_id: &str) -> String {
    format!("agent/{agent_id}/high_water")
}

fn cycles_prefix(agent_id: &str) -> String {
    format!("agent/{agent_id}/cycles/")
}

/// Store key of one cycle record. Zero-padded so keys sort by id.
#[must_use]
pub fn cycle_key(agent_id: &str, cycle_id: u64) -> String {
    format!("{}{cycle_id:020}", cycles_prefix(agent_id))
}

/// Reads and writes [`AgentState`] and [`CycleRecord`] through a state store,
/// bounding every call by a timeout.
#[derive(Clone)]
pub struct AgentStateRepository {
    store: Arc<dyn StateStore>,
    call_timeout: Duration,
}

impl fmt::Debug for AgentStateRepository {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AgentStateRepository")
            .field("call_timeout", &self.call_timeout)
            .finish_non_exhaustive()
    }
}

impl AgentStateRepository {
    /// Creates a repository.
    #[must_use]
    pub fn new(store: Arc<dyn StateStore>, call_timeout: Duration) -> Self {
        Self {
            store,
            call_timeout,
        }
    }

    async fn within<T, F>(&self, what: &str, call: F) -> Result<Result<T, StoreError>, AutonomyError>
    where
        F: Future<Output = Result<T, StoreError>>,
    {
        tokio::time::timeout(self.call_timeout, call)
            .await
            .map_err(|_| AutonomyError::Timeout(format!("{what} exceeded {:?}", self.call_timeout)))
    }

    async fn bounded<T, F>(&self, what: &str, call: F) -> Result<T, AutonomyError>
    where
        F: Future<Output = Result<T, StoreError>>,
    {
        self.within(what, call).await?.map_err(AutonomyError::from)
    }

    /// Stored state, `None` when the agent never persisted one.
    pub async fn load(&self, agent_id: &str) -> Result<Option<AgentState>, AutonomyError> {
        let key = state_key(agent_id);
        match self
            .within("state load", get_json::<AgentState>(self.store.as_ref(), &key))
            .await?
        {
            Ok(state) => Ok(Some(state)),
            Err(StoreError::NotFound(_)) => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    /// Persists `state`.
    pub async fn save(&self, state: &AgentState) -> Result<(), AutonomyError> {
        let key = state_key(&state.agent_id);
        self.bounded("state save", put_json(self.store.as_ref(), &key, state, None))
            .await
    }

    /// Highest cycle id recorded outside the state document, zero if none.
    pub async fn high_water(&self, agent_id: &str) -> Result<u64, AutonomyError> {
        let key = high_water_key(agent_id);
        match self
            .within("high water load", get_json::<u64>(self.store.as_ref(), &key))
            .await?
        {
            Ok(mark) => Ok(mark),
            Err(StoreError::NotFound(_)) => Ok(0),
            Err(err) => Err(err.into()),
        }
    }

    /// Records `cycle_id` as consumed without touching the state document.
    pub async fn save_high_water(&self, agent_id: &str, cycle_id: u64) -> Result<(), AutonomyError> {
        let key = high_water_key(agent_id);
        self.bounded("high water save", put_json(self.store.as_ref(), &key, &cycle_id, None))
            .await
    }

    /// Persists a closed cycle.
    pub async fn append_cycle(&self, record: &CycleRecord) -> Result<(), AutonomyError> {
        let key = cycle_key(&record.agent_id, record.cycle_id);
        self.bounded("cycle append", put_json(self.store.as_ref(), &key, record, None))
            .await
    }

    /// Up to `limit` most recent cycles, oldest first.
    pub async fn recent_cycles(
        &self,
        agent_id: &str,
        limit: usize,
    ) -> Result<Vec<CycleRecord>, AutonomyError> {
        let keys = self
            .bounded("cycle listing", self.store.list(&cycles_prefix(agent_id)))
            .await?;
        let start = keys.len().saturating_sub(limit);
        let mut records = Vec::with_capacity(keys.len() - start);
        for key in &keys[start..] {
            match self
                .within("cycle load", get_json::<CycleRecord>(self.store.as_ref(), key))
                .await?
            {
                Ok(record) => records.push(record),
                Err(StoreError::NotFound(_)) => {}
                Err(StoreError::Serialization(reason)) => {
                    warn!(%key, %reason, "skipping unreadable cycle record");
                }
                Err(err) => return Err(err.into()),
            }
        }
        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use xmrt_memory_data::MemoryStateStore;

    fn repo() -> AgentStateRepository {
        AgentStateRepository::new(Arc::new(MemoryStateStore::new()), Duration::from_secs(1))
    }

    #[test]
    fn advance_clamps_autonomy_and_bumps_version() {
        let mut state = AgentState::new("treasury-agent", 0.995);
        state.advance(1, 0.4, 0.01);
        assert!((state.autonomy_level - 1.0).abs() < f64::EPSILON);
        assert!((state.accumulated_score - 0.4).abs() < f64::EPSILON);
        assert_eq!((state.last_cycle_id, state.version), (1, 1));

        state.consume_cycle(2);
        assert!((state.accumulated_score - 0.4).abs() < f64::EPSILON);
        assert_eq!((state.last_cycle_id, state.version), (2, 2));
    }

    #[test]
    fn newest_prefers_higher_cycle_id() {
        let mut ahead = AgentState::new("a", 0.5);
        ahead.consume_cycle(5);
        let behind = AgentState::new("a", 0.5);
        assert_eq!(behind.clone().newest(ahead.clone()).last_cycle_id, 5);
        assert_eq!(ahead.newest(behind).last_cycle_id, 5);
    }

    #[test]
    fn cycle_keys_sort_numerically() {
        assert!(cycle_key("a", 9) < cycle_key("a", 10));
        assert_eq!(cycle_key("a", 7), "agent/a/cycles/00000000000000000007");
    }

    #[tokio::test]
    async fn state_and_cycles_roundtrip() {
        let repo = repo();
        assert_eq!(repo.load("a").await.unwrap(), None);

        let mut state = AgentState::new("a", 0.85);
        state.advance(1, 0.3, 0.01);
        repo.save(&state).await.unwrap();
        assert_eq!(repo.load("a").await.unwrap(), Some(state));

        for id in 1..=3 {
            let record = OpenCycle::start("a", id).close(CycleOutcome::Success);
            repo.append_cycle(&record).await.unwrap();
        }
        let recent: Vec<u64> = repo
            .recent_cycles("a", 2)
            .await
            .unwrap()
            .into_iter()
            .map(|r| r.cycle_id)
            .collect();
        assert_eq!(recent, vec![2, 3]);
    }

    #[tokio::test]
    async fn high_water_is_kept_apart_from_state() {
        let repo = repo();
        assert_eq!(repo.high_water("a").await.unwrap(), 0);
        repo.save_high_water("a", 7).await.unwrap();
        assert_eq!(repo.high_water("a").await.unwrap(), 7);
        assert_eq!(repo.load("a").await.unwrap(), None);
        assert!(repo.recent_cycles("a", 10).await.unwrap().is_empty());

        let mut state = AgentState::new("a", 0.85);
        state.raise_high_water(7);
        state.raise_high_water(3);
        assert_eq!((state.last_cycle_id, state.version), (7, 0));
        assert_eq!(state.next_cycle_id().unwrap(), 8);
    }

    #[test]
    fn closed_cycle_keeps_actions_and_notes() {
        let mut open = OpenCycle::start("a", 4);
        open.push_action(ActionRecord {
            kind: ActionKind::Observe,
            score: 0.0,
            rationale: BTreeMap::new(),
            applied: true,
            fallback: true,
            detail: None,
        });
        open.note("state store unavailable");
        let record = open.close(CycleOutcome::PartialFailure);
        assert_eq!(record.actions_taken.len(), 1);
        assert_eq!(record.notes, vec!["state store unavailable"]);
        assert!(record.ended_at >= record.started_at);
    }
}
