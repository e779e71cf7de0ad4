//! Links decisions to their side effects: one full cycle per call.

use std::{
    collections::{BTreeMap, HashMap},
    fmt,
    sync::Arc,
    time::Duration,
};

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use shared_logging::LogLevel;
use tracing::{error, info, instrument, warn};
use xmrt_memory_data::{MemoryCategory, MemoryEntry};

use crate::{
    decision::{
        scoring::{ActionCandidate, ScoredCandidate},
        DecisionEngine, DecisionInput,
    },
    module::{ActionKind, AutonomyError, ComponentSpec},
    services::{bounded, CoordinatorServices},
    state::{ActionRecord, AgentState, AgentStateRepository, CycleOutcome, CycleRecord, OpenCycle},
    telemetry::AutonomyTelemetry,
};

/// Memory key of an outcome slot of `agent_id` for `kind`.
#[must_use]
pub fn outcome_key(agent_id: &str, kind: &ActionKind, slot: u64) -> String {
    format!("outcome/{agent_id}/{kind}/{slot:03}")
}

/// Side effect handed to an external collaborator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DispatchRequest {
    /// Component that decided.
    pub agent_id: String,
    /// Cycle in which it decided.
    pub cycle_id: u64,
    /// What to do.
    pub action: ActionKind,
    /// Decision score.
    pub score: f64,
}

/// Executes actions the coordinator does not implement itself.
#[async_trait]
pub trait ActionDispatcher: Send + Sync {
    /// Performs `request`, returning a summary for the cycle record.
    async fn dispatch(&self, request: &DispatchRequest) -> Result<Value, AutonomyError>;
}

/// Dispatcher that only logs. Used when no collaborator is wired in.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingDispatcher;

#[async_trait]
impl ActionDispatcher for TracingDispatcher {
    async fn dispatch(&self, request: &DispatchRequest) -> Result<Value, AutonomyError> {
        info!(
            agent = %request.agent_id,
            cycle = request.cycle_id,
            action = %request.action,
            "dispatching action"
        );
        Ok(json!({ "dispatched": request.action.to_string() }))
    }
}

/// Autonomy adaptation and memory policy for cycles.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CyclePolicy {
    /// Autonomy level of agents without stored state.
    pub default_autonomy: f64,
    /// Autonomy change after each cycle.
    pub autonomy_step: f64,
    /// Lifetime of outcome memories.
    pub memory_ttl: Option<Duration>,
    /// Outcome memories kept per agent and action; older slots are reused.
    pub outcome_history: usize,
}

impl Default for CyclePolicy {
    fn default() -> Self {
        Self {
            default_autonomy: 0.85,
            autonomy_step: 0.01,
            memory_ttl: None,
            outcome_history: 16,
        }
    }
}

/// Runs single cycles: load state, decide, apply, persist.
#[derive(Clone)]
pub struct CycleRunner {
    engine: DecisionEngine,
    services: CoordinatorServices,
    repository: AgentStateRepository,
    dispatcher: Arc<dyn ActionDispatcher>,
    policy: CyclePolicy,
    last_known: Arc<Mutex<HashMap<String, AgentState>>>,
    telemetry: Option<AutonomyTelemetry>,
}

impl fmt::Debug for CycleRunner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CycleRunner")
            .field("engine", &self.engine)
            .field("policy", &self.policy)
            .finish_non_exhaustive()
    }
}

enum LoadedState {
    Current(AgentState),
    /// Store unreachable; the state is this process's last copy.
    Degraded(AgentState, AutonomyError),
    /// Stored state exists but cannot be trusted.
    Unusable(AgentState, AutonomyError),
}

/// Result of applying one action.
struct Applied {
    record: ActionRecord,
    error: Option<AutonomyError>,
}

impl CycleRunner {
    /// Creates a runner with the default policy.
    #[must_use]
    pub fn new(
        engine: DecisionEngine,
        services: CoordinatorServices,
        repository: AgentStateRepository,
        dispatcher: Arc<dyn ActionDispatcher>,
    ) -> Self {
        Self {
            engine,
            services,
            repository,
            dispatcher,
            policy: CyclePolicy::default(),
            last_known: Arc::new(Mutex::new(HashMap::new())),
            telemetry: None,
        }
    }

    /// Overrides the policy.
    #[must_use]
    pub const fn with_policy(mut self, policy: CyclePolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Attaches telemetry sinks.
    #[must_use]
    pub fn with_telemetry(mut self, telemetry: AutonomyTelemetry) -> Self {
        self.telemetry = Some(telemetry);
        self
    }

    /// Shared services.
    #[must_use]
    pub const fn services(&self) -> &CoordinatorServices {
        &self.services
    }

    /// State repository.
    #[must_use]
    pub const fn repository(&self) -> &AgentStateRepository {
        &self.repository
    }

    /// Last state this process saw for `agent_id`.
    #[must_use]
    pub fn last_known_state(&self, agent_id: &str) -> Option<AgentState> {
        self.last_known.lock().get(agent_id).cloned()
    }

    fn remember_state(&self, state: &AgentState) {
        self.last_known
            .lock()
            .insert(state.agent_id.clone(), state.clone());
    }

    /// Loads the newest of the stored and in-process state, never below the
    /// stored high-water cycle id.
    async fn load_state(&self, agent_id: &str) -> LoadedState {
        let cached = self.last_known_state(agent_id);
        let fresh = || AgentState::new(agent_id, self.policy.default_autonomy);
        match self.repository.load(agent_id).await {
            Ok(stored) => {
                let mut state = match (cached, stored) {
                    (Some(cached), Some(stored)) => cached.newest(stored),
                    (cached, stored) => cached.or(stored).unwrap_or_else(fresh),
                };
                self.apply_high_water(&mut state).await;
                LoadedState::Current(state)
            }
            Err(err) if err.is_retryable() => {
                warn!(agent = agent_id, error = %err, "state unavailable; running on in-memory state");
                LoadedState::Degraded(cached.unwrap_or_else(fresh), err)
            }
            Err(err) => {
                let mut state = cached.unwrap_or_else(fresh);
                self.apply_high_water(&mut state).await;
                LoadedState::Unusable(state, err)
            }
        }
    }

    async fn apply_high_water(&self, state: &mut AgentState) {
        match self.repository.high_water(&state.agent_id).await {
            Ok(mark) => state.raise_high_water(mark),
            Err(err) => warn!(agent = %state.agent_id, error = %err, "cycle high water unavailable"),
        }
    }

    /// Runs one cycle for `spec`. Failures are folded into the record's
    /// outcome; this never returns an error.
    #[instrument(skip(self, spec), fields(agent = %spec.id))]
    pub async fn run_cycle(&self, spec: &ComponentSpec) -> CycleRecord {
        let (mut state, degradation) = match self.load_state(&spec.id).await {
            LoadedState::Current(state) => (state, None),
            LoadedState::Degraded(state, err) => (state, Some(err)),
            LoadedState::Unusable(state, err) => {
                return self
                    .finish_fatal(state, format!("agent state unusable: {err}"), false)
                    .await;
            }
        };
        let degraded = degradation.is_some();
        let cycle_id = match state.next_cycle_id() {
            Ok(id) => id,
            Err(err) => return self.finish_fatal(state, err.to_string(), true).await,
        };
        let mut open = OpenCycle::start(&spec.id, cycle_id);
        if let Some(err) = degradation {
            open.note(format!("state load degraded: {err}"));
        }

        let decision = self
            .engine
            .decide(DecisionInput {
                state: (!degraded).then_some(&state),
                candidates: &spec.candidates,
                default_action: &spec.default_action,
            })
            .await;
        open.set_reflection_passes(decision.reflection_passes);
        if let Some(reason) = decision.fallback {
            open.note(format!("default action taken: {reason:?}"));
        }

        let primary = self
            .apply(&spec.id, cycle_id, &decision.chosen, decision.is_fallback())
            .await;
        let step = self.policy.autonomy_step;
        let chosen_kind = primary.record.kind.clone();
        let primary_applied = primary.record.applied;
        let primary_score = primary.record.score;
        open.push_action(primary.record);

        let mut outcome = match primary.error {
            None => {
                state.advance(cycle_id, primary_score, step);
                if degraded {
                    CycleOutcome::PartialFailure
                } else {
                    CycleOutcome::Success
                }
            }
            Some(err) if err.is_retryable() => {
                open.note(format!("{chosen_kind} failed: {err}"));
                if chosen_kind != spec.default_action {
                    let fallback = ScoredCandidate {
                        index: 0,
                        candidate: ActionCandidate::from_kind(spec.default_action.clone()),
                        score: 0.0,
                        rationale: BTreeMap::new(),
                    };
                    let applied = self.apply(&spec.id, cycle_id, &fallback, true).await;
                    if let Some(err) = &applied.error {
                        open.note(format!("default action failed: {err}"));
                    }
                    open.push_action(applied.record);
                }
                state.advance(cycle_id, 0.0, -step);
                CycleOutcome::PartialFailure
            }
            Some(err) if err.is_fatal() => {
                open.note(err.to_string());
                state.consume_cycle(cycle_id);
                CycleOutcome::Fatal
            }
            Some(err) => {
                open.note(format!("{chosen_kind} rejected: {err}"));
                state.consume_cycle(cycle_id);
                CycleOutcome::PartialFailure
            }
        };

        if !degraded && chosen_kind != ActionKind::Observe {
            if let Err(err) = self
                .record_outcome(&spec.id, cycle_id, &chosen_kind, primary_applied)
                .await
            {
                warn!(error = %err, "outcome memory not written");
                open.note(format!("outcome memory not written: {err}"));
            }
        }

        self.remember_state(&state);
        if !degraded {
            if let Err(err) = self.repository.save(&state).await {
                warn!(error = %err, "agent state not persisted");
                open.note(format!("state save failed: {err}"));
                if outcome == CycleOutcome::Success {
                    outcome = CycleOutcome::PartialFailure;
                }
            }
        }

        let record = open.close(outcome);
        if !degraded {
            if let Err(err) = self.repository.append_cycle(&record).await {
                warn!(error = %err, cycle = cycle_id, "cycle record not persisted");
            }
        }
        self.report(&record).await;
        record
    }

    /// Closes a cycle as `Fatal` without deciding anything. Used when the
    /// cycle itself could not run, e.g. after a panic.
    pub async fn fatal_record(&self, spec: &ComponentSpec, reason: impl Into<String>) -> CycleRecord {
        let (state, trusted) = match self.load_state(&spec.id).await {
            LoadedState::Current(state) | LoadedState::Degraded(state, _) => (state, true),
            LoadedState::Unusable(state, _) => (state, false),
        };
        self.finish_fatal(state, reason.into(), trusted).await
    }

    /// Consumes the next cycle id and records it as `Fatal`. An untrusted
    /// state document is left as found; only the high-water id is written.
    async fn finish_fatal(&self, mut state: AgentState, reason: String, trusted: bool) -> CycleRecord {
        let cycle_id = state.last_cycle_id.saturating_add(1);
        let mut open = OpenCycle::start(&state.agent_id, cycle_id);
        open.note(reason);
        state.consume_cycle(cycle_id);
        self.remember_state(&state);
        let persisted = if trusted {
            self.repository.save(&state).await
        } else {
            self.repository.save_high_water(&state.agent_id, cycle_id).await
        };
        if let Err(err) = persisted {
            warn!(error = %err, cycle = cycle_id, "consumed cycle id not persisted");
            open.note(format!("cycle id not persisted: {err}"));
        }
        let record = open.close(CycleOutcome::Fatal);
        if let Err(err) = self.repository.append_cycle(&record).await {
            warn!(error = %err, cycle = cycle_id, "fatal cycle record not persisted");
        }
        self.report(&record).await;
        record
    }

    async fn apply(&self, agent_id: &str, cycle_id: u64, chosen: &ScoredCandidate, fallback: bool) -> Applied {
        let kind = chosen.candidate.kind.clone();
        let result = match &kind {
            ActionKind::RefreshLeaderboard => {
                let report = self.services.refresh_leaderboard().await;
                Ok(format!(
                    "{} participants ranked{}",
                    report.entries.len(),
                    if report.is_degraded() { " (degraded)" } else { "" }
                ))
            }
            ActionKind::AllocateTreasury => self.services.allocate_treasury().await.map(|r| {
                format!(
                    "treasury {:.8} / operations {:.8} of {:.8}",
                    r.treasury_share, r.operations_share, r.total
                )
            }),
            ActionKind::ConsolidateMemory => self
                .services
                .consolidate_memory()
                .await
                .map(|evicted| format!("{evicted} expired memories evicted")),
            ActionKind::Observe => Ok("observed".to_string()),
            ActionKind::Custom(_) => {
                let request = DispatchRequest {
                    agent_id: agent_id.to_string(),
                    cycle_id,
                    action: kind.clone(),
                    score: chosen.score,
                };
                let timeout = self.services.call_timeout();
                match tokio::time::timeout(timeout, self.dispatcher.dispatch(&request)).await {
                    Ok(result) => result.map(|summary| summary.to_string()),
                    Err(_) => Err(AutonomyError::Timeout(format!(
                        "dispatch of {kind} exceeded {timeout:?}"
                    ))),
                }
            }
        };
        let (applied, detail, error) = match result {
            Ok(detail) => (true, Some(detail), None),
            Err(err) => (false, Some(err.to_string()), Some(err)),
        };
        Applied {
            record: ActionRecord {
                kind,
                score: chosen.score,
                rationale: chosen.rationale.clone(),
                applied,
                fallback,
                detail,
            },
            error,
        }
    }

    async fn record_outcome(
        &self,
        agent_id: &str,
        cycle_id: u64,
        kind: &ActionKind,
        succeeded: bool,
    ) -> Result<(), AutonomyError> {
        let outcome = if succeeded { 1.0 } else { -1.0 };
        // Ring of slots per agent and action; the owner lives in the key only.
        let slots = u64::try_from(self.policy.outcome_history.max(1)).unwrap_or(u64::MAX);
        let mut entry = MemoryEntry::new(
            outcome_key(agent_id, kind, cycle_id % slots),
            json!({
                "action": kind.to_string(),
                "outcome": outcome,
                "cycle_id": cycle_id,
            }),
            MemoryCategory::Transient,
        )
        .with_tags([kind.topic()]);
        if let Some(ttl) = self.policy.memory_ttl {
            entry = entry.with_ttl(ttl);
        }
        bounded(
            self.services.call_timeout(),
            "outcome memory",
            self.services.memory().remember(entry),
        )
        .await
        .map(|_| ())
    }

    async fn report(&self, record: &CycleRecord) {
        let action = record.actions_taken.first().map(|a| a.kind.to_string());
        match record.outcome {
            CycleOutcome::Fatal => error!(
                agent = %record.agent_id,
                cycle = record.cycle_id,
                record = %serde_json::to_string(record).unwrap_or_default(),
                "cycle failed fatally"
            ),
            outcome => info!(
                agent = %record.agent_id,
                cycle = record.cycle_id,
                %outcome,
                action = action.as_deref().unwrap_or("none"),
                "cycle completed"
            ),
        }
        if let Some(tel) = &self.telemetry {
            let level = if record.outcome == CycleOutcome::Fatal {
                LogLevel::Error
            } else {
                LogLevel::Info
            };
            let full = serde_json::to_value(record).unwrap_or(Value::Null);
            if let Err(err) = tel.log(level, "autonomy.cycle.completed", full) {
                warn!(error = %err, cycle = record.cycle_id, "audit log write failed");
            }
            if let Err(err) = tel
                .event(
                    "autonomy.cycle.completed",
                    json!({
                        "agent_id": record.agent_id,
                        "cycle_id": record.cycle_id,
                        "outcome": record.outcome,
                        "action": action,
                    }),
                )
                .await
            {
                warn!(error = %err, cycle = record.cycle_id, "cycle event not published");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        decision::{scoring::ActionCandidate, DecisionConfig},
        state::state_key,
    };
    use shared_event_bus::{EventPublisher, EventRecord};
    use std::sync::atomic::{AtomicBool, Ordering};
    use tempfile::tempdir;
    use xmrt_feeds::{StaticMeshSource, StaticMiningSource};
    use xmrt_fusion::{FusionConfig, LeaderboardFusion};
    use xmrt_memory_data::{
        FileStateStore, KeywordRetriever, KnowledgeRetriever, MemoryService, MemoryStateStore,
        StateStore, StoreError,
    };

    /// Store that can be switched off.
    struct Switchable {
        inner: MemoryStateStore,
        down: AtomicBool,
    }

    impl Switchable {
        fn check(&self) -> Result<(), StoreError> {
            if self.down.load(Ordering::SeqCst) {
                Err(StoreError::Unavailable("switched off".into()))
            } else {
                Ok(())
            }
        }
    }

    #[async_trait]
    impl StateStore for Switchable {
        async fn put(&self, key: &str, value: Value, ttl: Option<Duration>) -> Result<(), StoreError> {
            self.check()?;
            self.inner.put(key, value, ttl).await
        }
        async fn get(&self, key: &str) -> Result<Value, StoreError> {
            self.check()?;
            self.inner.get(key).await
        }
        async fn delete(&self, key: &str) -> Result<(), StoreError> {
            self.check()?;
            self.inner.delete(key).await
        }
        async fn list(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
            self.check()?;
            self.inner.list(prefix).await
        }
        async fn evict_expired(&self) -> Result<usize, StoreError> {
            self.check()?;
            self.inner.evict_expired().await
        }
    }

    struct Scripted(Result<Value, AutonomyError>);

    #[async_trait]
    impl ActionDispatcher for Scripted {
        async fn dispatch(&self, _request: &DispatchRequest) -> Result<Value, AutonomyError> {
            self.0.clone()
        }
    }

    struct Stalled;

    #[async_trait]
    impl ActionDispatcher for Stalled {
        async fn dispatch(&self, _request: &DispatchRequest) -> Result<Value, AutonomyError> {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok(Value::Null)
        }
    }

    fn runner(store: Arc<dyn StateStore>, dispatcher: Arc<dyn ActionDispatcher>) -> CycleRunner {
        let mining = Arc::new(StaticMiningSource::simulated());
        let identities = mining.identities();
        let fusion = LeaderboardFusion::new(
            mining,
            Arc::new(StaticMeshSource::simulated()),
            identities,
            std::collections::BTreeMap::from([("worker_001".to_string(), "mesh_001".to_string())]),
            FusionConfig::default(),
        )
        .unwrap();
        let memory = MemoryService::new(Arc::clone(&store), None);
        let timeout = Duration::from_millis(500);
        let services = CoordinatorServices::new(fusion, memory, 0.85, timeout).unwrap();
        CycleRunner::new(
            DecisionEngine::new(DecisionConfig {
                call_timeout: timeout,
                ..DecisionConfig::default()
            }),
            services,
            AgentStateRepository::new(store, timeout),
            dispatcher,
        )
    }

    fn spec(kind: ActionKind) -> ComponentSpec {
        ComponentSpec::new("agent", Duration::from_secs(60)).with_candidate(ActionCandidate::from_kind(kind))
    }

    #[tokio::test]
    async fn successful_cycle_persists_everything() {
        let store: Arc<dyn StateStore> = Arc::new(MemoryStateStore::new());
        let runner = runner(Arc::clone(&store), Arc::new(TracingDispatcher));
        let record = runner.run_cycle(&spec(ActionKind::AllocateTreasury)).await;

        assert_eq!(record.outcome, CycleOutcome::Success);
        assert_eq!(record.cycle_id, 1);
        assert!(record.actions_taken[0].applied);

        let allocation = runner.services().latest_allocation().await.unwrap();
        allocation.verify().unwrap();
        assert!(runner.services().latest_leaderboard().await.is_some());

        let state = runner.repository().load("agent").await.unwrap().unwrap();
        assert_eq!((state.last_cycle_id, state.version), (1, 1));
        assert!(state.accumulated_score > 0.0);
        assert_eq!(runner.repository().recent_cycles("agent", 10).await.unwrap().len(), 1);
        assert_eq!(store.list("memory/outcome/agent/").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn unavailable_store_degrades_to_in_memory_state() {
        let switchable = Arc::new(Switchable {
            inner: MemoryStateStore::new(),
            down: AtomicBool::new(false),
        });
        let runner = runner(switchable.clone(), Arc::new(TracingDispatcher));
        let spec = spec(ActionKind::RefreshLeaderboard);
        assert_eq!(runner.run_cycle(&spec).await.outcome, CycleOutcome::Success);

        switchable.down.store(true, Ordering::SeqCst);
        let degraded = runner.run_cycle(&spec).await;
        assert_eq!(degraded.cycle_id, 2);
        assert_eq!(degraded.outcome, CycleOutcome::PartialFailure);
        assert_eq!(degraded.actions_taken[0].kind, ActionKind::Observe);
        assert!(degraded.actions_taken[0].fallback);

        switchable.down.store(false, Ordering::SeqCst);
        let recovered = runner.run_cycle(&spec).await;
        assert_eq!(recovered.cycle_id, 3);
        assert_eq!(recovered.outcome, CycleOutcome::Success);
    }

    #[tokio::test]
    async fn cycle_ids_survive_restart() {
        let dir = tempdir().unwrap();
        let spec = spec(ActionKind::ConsolidateMemory);
        {
            let store: Arc<dyn StateStore> = Arc::new(FileStateStore::open(dir.path()).unwrap());
            let runner = runner(store, Arc::new(TracingDispatcher));
            runner.run_cycle(&spec).await;
            runner.run_cycle(&spec).await;
        }
        let store: Arc<dyn StateStore> = Arc::new(FileStateStore::open(dir.path()).unwrap());
        let runner = runner(store, Arc::new(TracingDispatcher));
        let record = runner.run_cycle(&spec).await;
        assert_eq!(record.cycle_id, 3);
        let ids: Vec<u64> = runner
            .repository()
            .recent_cycles("agent", 10)
            .await
            .unwrap()
            .iter()
            .map(|r| r.cycle_id)
            .collect();
        assert_eq!(ids, vec![1, 2, 3]);
    }

    fn outcomes(records: &[CycleRecord]) -> Vec<(u64, CycleOutcome)> {
        records.iter().map(|r| (r.cycle_id, r.outcome)).collect()
    }

    #[tokio::test]
    async fn fatal_cycles_keep_their_ids_across_restart() {
        let dir = tempdir().unwrap();
        let spec = spec(ActionKind::RefreshLeaderboard);
        {
            let store: Arc<dyn StateStore> = Arc::new(FileStateStore::open(dir.path()).unwrap());
            let runner = runner(store, Arc::new(TracingDispatcher));
            assert_eq!(runner.run_cycle(&spec).await.cycle_id, 1);
            let fatal = runner.fatal_record(&spec, "cycle panicked").await;
            assert_eq!((fatal.cycle_id, fatal.outcome), (2, CycleOutcome::Fatal));
        }
        let store: Arc<dyn StateStore> = Arc::new(FileStateStore::open(dir.path()).unwrap());
        let runner = runner(store, Arc::new(TracingDispatcher));
        assert_eq!(runner.run_cycle(&spec).await.cycle_id, 3);
        let persisted = runner.repository().recent_cycles("agent", 10).await.unwrap();
        assert_eq!(
            outcomes(&persisted),
            vec![
                (1, CycleOutcome::Success),
                (2, CycleOutcome::Fatal),
                (3, CycleOutcome::Success),
            ]
        );
    }

    #[tokio::test]
    async fn unusable_state_is_left_intact_while_ids_keep_rising() {
        let store: Arc<dyn StateStore> = Arc::new(MemoryStateStore::new());
        let garbage = json!({ "garbage": true });
        store.put(&state_key("agent"), garbage.clone(), None).await.unwrap();
        let spec = spec(ActionKind::RefreshLeaderboard);

        let first = runner(Arc::clone(&store), Arc::new(TracingDispatcher)).run_cycle(&spec).await;
        assert_eq!((first.cycle_id, first.outcome), (1, CycleOutcome::Fatal));
        // A fresh runner has no in-process copy, as after a restart.
        let runner = runner(Arc::clone(&store), Arc::new(TracingDispatcher));
        let second = runner.run_cycle(&spec).await;
        assert_eq!((second.cycle_id, second.outcome), (2, CycleOutcome::Fatal));

        let persisted = runner.repository().recent_cycles("agent", 10).await.unwrap();
        assert_eq!(
            outcomes(&persisted),
            vec![(1, CycleOutcome::Fatal), (2, CycleOutcome::Fatal)]
        );
        assert_eq!(store.get(&state_key("agent")).await.unwrap(), garbage);
    }

    #[tokio::test]
    async fn outcome_memories_are_capped_per_action() {
        let store: Arc<dyn StateStore> = Arc::new(MemoryStateStore::new());
        let runner = runner(Arc::clone(&store), Arc::new(TracingDispatcher)).with_policy(CyclePolicy {
            outcome_history: 4,
            ..CyclePolicy::default()
        });
        let spec = spec(ActionKind::ConsolidateMemory);
        for _ in 0..50 {
            runner.run_cycle(&spec).await;
        }
        assert_eq!(runner.last_known_state("agent").unwrap().last_cycle_id, 50);
        assert_eq!(store.list("memory/outcome/agent/").await.unwrap().len(), 4);
    }

    #[tokio::test]
    async fn owner_id_does_not_leak_evidence_between_actions() {
        let store: Arc<dyn StateStore> = Arc::new(MemoryStateStore::new());
        let runner = runner(
            store,
            Arc::new(Scripted(Err(AutonomyError::InvalidInput("bad payload".into())))),
        );
        let spec = ComponentSpec::new("leaderboard-agent", Duration::from_secs(60))
            .with_candidate(ActionCandidate::from_kind(ActionKind::Custom("flaky".into())));
        for _ in 0..3 {
            runner.run_cycle(&spec).await;
        }

        let retriever = KeywordRetriever::new(runner.services().memory().clone());
        assert!(retriever.query("refresh leaderboard", 8).await.unwrap().is_empty());
        let flaky = retriever.query("flaky", 8).await.unwrap();
        assert_eq!(flaky.len(), 3);
        assert!(flaky
            .iter()
            .all(|m| m.entry.value["outcome"] == json!(-1.0) && m.entry.value.get("agent_id").is_none()));
    }

    struct Unreachable;

    #[async_trait]
    impl EventPublisher for Unreachable {
        async fn publish(&self, _event: EventRecord) -> anyhow::Result<()> {
            anyhow::bail!("bus unreachable")
        }
    }

    #[tokio::test]
    async fn telemetry_failures_never_change_the_outcome() {
        let store: Arc<dyn StateStore> = Arc::new(MemoryStateStore::new());
        let telemetry = AutonomyTelemetry::builder("autonomy.test")
            .event_publisher(Arc::new(Unreachable))
            .build()
            .unwrap();
        let base = runner(Arc::clone(&store), Arc::new(TracingDispatcher));
        let runner = CycleRunner {
            services: base.services().clone().with_telemetry(telemetry.clone()),
            ..base
        }
        .with_telemetry(telemetry);

        let record = runner.run_cycle(&spec(ActionKind::AllocateTreasury)).await;
        assert_eq!(record.outcome, CycleOutcome::Success);
        assert!(record.notes.is_empty());
        assert!(runner.services().latest_allocation().await.is_some());
        assert_eq!(runner.repository().load("agent").await.unwrap().unwrap().last_cycle_id, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn dispatch_timeout_falls_back_and_lowers_autonomy() {
        let store: Arc<dyn StateStore> = Arc::new(MemoryStateStore::new());
        let runner = runner(store, Arc::new(Stalled));
        let record = runner
            .run_cycle(&spec(ActionKind::Custom("notify".into())))
            .await;
        assert_eq!(record.outcome, CycleOutcome::PartialFailure);
        assert_eq!(record.actions_taken.len(), 2);
        assert!(!record.actions_taken[0].applied);
        assert!(record.actions_taken[1].fallback && record.actions_taken[1].applied);
        let state = runner.last_known_state("agent").unwrap();
        assert!(state.autonomy_level < 0.85);
        assert_eq!(state.last_cycle_id, 1);
    }

    #[tokio::test]
    async fn rejected_action_only_consumes_the_cycle_id() {
        let store: Arc<dyn StateStore> = Arc::new(MemoryStateStore::new());
        let runner = runner(
            store,
            Arc::new(Scripted(Err(AutonomyError::InvalidInput("bad payload".into())))),
        );
        let record = runner
            .run_cycle(&spec(ActionKind::Custom("notify".into())))
            .await;
        assert_eq!(record.outcome, CycleOutcome::PartialFailure);
        assert_eq!(record.actions_taken.len(), 1);
        let state = runner.repository().load("agent").await.unwrap().unwrap();
        assert_eq!(state.last_cycle_id, 1);
        assert!(state.accumulated_score.abs() < f64::EPSILON);
        assert!((state.autonomy_level - 0.85).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn fatal_dispatch_is_recorded() {
        let store: Arc<dyn StateStore> = Arc::new(MemoryStateStore::new());
        let runner = runner(
            store,
            Arc::new(Scripted(Err(AutonomyError::Fatal("collaborator corrupted".into())))),
        );
        let record = runner
            .run_cycle(&spec(ActionKind::Custom("notify".into())))
            .await;
        assert_eq!(record.outcome, CycleOutcome::Fatal);
        assert_eq!(record.notes.last().map(String::as_str), Some("fatal: collaborator corrupted"));
    }
}
