//! Per-component scheduling loops with fault isolation.

/// Builder for the scheduler.
pub mod maker;

use std::{
    collections::{HashMap, VecDeque},
    fmt,
    sync::Arc,
};

use futures::future::join_all;
use maker::SchedulerBuilder;
use parking_lot::{Mutex, RwLock};
use serde_json::json;
use shared_logging::LogLevel;
use tokio::{
    sync::watch,
    task::{JoinError, JoinHandle},
    time::MissedTickBehavior,
};
use tracing::{error, info, warn};

use crate::{
    linker::CycleRunner,
    module::{AutonomyError, ComponentRegistry, ComponentSpec, ComponentStatus, Lifecycle},
    state::{CycleOutcome, CycleRecord},
    telemetry::AutonomyTelemetry,
};

struct LoopHandle {
    stop: watch::Sender<bool>,
    task: JoinHandle<()>,
}

/// State shared between the scheduler and its loops.
#[derive(Clone)]
struct LoopContext {
    registry: ComponentRegistry,
    runner: CycleRunner,
    history: Arc<RwLock<HashMap<String, VecDeque<CycleRecord>>>>,
    history_limit: usize,
    telemetry: Option<AutonomyTelemetry>,
}

impl LoopContext {
    fn remember(&self, record: &CycleRecord) {
        self.registry.record_cycle(record);
        let mut history = self.history.write();
        let recent = history.entry(record.agent_id.clone()).or_default();
        recent.push_back(record.clone());
        while recent.len() > self.history_limit {
            recent.pop_front();
        }
    }

    /// Runs one cycle in its own task so a panic cannot unwind through the loop.
    async fn cycle(&self, spec: &ComponentSpec) -> CycleRecord {
        let runner = self.runner.clone();
        let owned = spec.clone();
        match tokio::spawn(async move { runner.run_cycle(&owned).await }).await {
            Ok(record) => record,
            Err(err) => {
                let reason = panic_reason(&err);
                self.runner.fatal_record(spec, reason).await
            }
        }
    }

    async fn halt(&self, record: &CycleRecord) {
        if let Err(err) = self.registry.transition(&record.agent_id, Lifecycle::Stopped) {
            warn!(agent = %record.agent_id, error = %err, "component already left the running state");
        }
        error!(
            agent = %record.agent_id,
            cycle = record.cycle_id,
            notes = ?record.notes,
            "component stopped after fatal cycle"
        );
        if let Some(tel) = &self.telemetry {
            let payload = json!({
                "agent_id": record.agent_id,
                "cycle_id": record.cycle_id,
                "reason": record.notes.last(),
            });
            if let Err(err) = tel.log(LogLevel::Error, "autonomy.component.stopped", payload.clone()) {
                warn!(agent = %record.agent_id, error = %err, "audit log write failed");
            }
            if let Err(err) = tel.event("autonomy.component.stopped", payload).await {
                warn!(agent = %record.agent_id, error = %err, "stop event not published");
            }
        }
    }

    async fn run(self, spec: ComponentSpec, mut stop: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(spec.cycle_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(agent = %spec.id, interval = ?spec.cycle_interval, "component loop started");
        loop {
            tokio::select! {
                biased;
                changed = stop.changed() => {
                    if changed.is_err() || *stop.borrow() {
                        break;
                    }
                }
                _ = ticker.tick() => {
                    let record = self.cycle(&spec).await;
                    self.remember(&record);
                    if record.outcome == CycleOutcome::Fatal {
                        self.halt(&record).await;
                        return;
                    }
                }
            }
        }
        info!(agent = %spec.id, "component loop stopped");
    }
}

fn panic_reason(err: &JoinError) -> String {
    if err.is_panic() {
        format!("cycle panicked: {err}")
    } else {
        format!("cycle task aborted: {err}")
    }
}

/// Drives one independent cycle loop per registered component.
pub struct Scheduler {
    context: LoopContext,
    loops: Mutex<HashMap<String, LoopHandle>>,
}

impl fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scheduler")
            .field("components", &self.context.registry.ids())
            .field("history_limit", &self.context.history_limit)
            .finish_non_exhaustive()
    }
}

impl Scheduler {
    /// Creates a scheduler over `registry`.
    #[must_use]
    pub fn new(registry: ComponentRegistry, runner: CycleRunner, history_limit: usize) -> Self {
        Self {
            context: LoopContext {
                registry,
                runner,
                history: Arc::new(RwLock::new(HashMap::new())),
                history_limit: history_limit.max(1),
                telemetry: None,
            },
            loops: Mutex::new(HashMap::new()),
        }
    }

    /// Returns a builder.
    #[must_use]
    pub fn builder(runner: CycleRunner) -> SchedulerBuilder {
        SchedulerBuilder::new(runner)
    }

    /// Attaches telemetry.
    #[must_use]
    pub fn with_telemetry(mut self, telemetry: AutonomyTelemetry) -> Self {
        self.context.telemetry = Some(telemetry);
        self
    }

    /// Component registry.
    #[must_use]
    pub const fn registry(&self) -> &ComponentRegistry {
        &self.context.registry
    }

    /// Cycle runner shared by every loop.
    #[must_use]
    pub const fn runner(&self) -> &CycleRunner {
        &self.context.runner
    }

    /// Seeds each component's last cycle from the store so status survives a
    /// restart. An unreachable store leaves the slots empty.
    pub async fn restore_status(&self) {
        for id in self.context.registry.ids() {
            match self.context.runner.repository().recent_cycles(&id, 1).await {
                Ok(records) => {
                    if let Some(last) = records.last() {
                        self.context.registry.record_cycle(last);
                    }
                }
                Err(err) => warn!(agent = %id, error = %err, "persisted status unavailable"),
            }
        }
    }

    /// Starts the loop of `id`. Must be called inside a tokio runtime.
    pub fn start(&self, id: &str) -> Result<(), AutonomyError> {
        let spec = self.context.registry.spec(id)?;
        let mut loops = self.loops.lock();
        if loops.get(id).is_some_and(|handle| !handle.task.is_finished()) {
            return Err(AutonomyError::InvalidTransition {
                component: id.to_string(),
                from: Lifecycle::Running,
                to: Lifecycle::Running,
            });
        }
        self.context.registry.transition(id, Lifecycle::Running)?;
        let (stop, receiver) = watch::channel(false);
        let task = tokio::spawn(self.context.clone().run(spec, receiver));
        loops.insert(id.to_string(), LoopHandle { stop, task });
        Ok(())
    }

    /// Starts every component that is not running. Returns the ids started.
    pub fn start_all(&self) -> Result<Vec<String>, AutonomyError> {
        let mut started = Vec::new();
        for id in self.context.registry.ids() {
            if self.context.registry.lifecycle(&id)? != Lifecycle::Running {
                self.start(&id)?;
                started.push(id);
            }
        }
        Ok(started)
    }

    /// Stops the loop of `id`, letting an in-flight cycle finish first.
    pub async fn stop(&self, id: &str) -> Result<(), AutonomyError> {
        let from = self.context.registry.lifecycle(id)?;
        if from != Lifecycle::Running {
            return Err(AutonomyError::InvalidTransition {
                component: id.to_string(),
                from,
                to: Lifecycle::Stopped,
            });
        }
        let handle = self.loops.lock().remove(id);
        if let Some(handle) = handle {
            let _ = handle.stop.send(true);
            if let Err(err) = handle.task.await {
                warn!(agent = id, error = %err, "component loop ended abnormally");
            }
        }
        // A fatal cycle may have stopped it while we waited.
        if self.context.registry.lifecycle(id)? == Lifecycle::Running {
            self.context.registry.transition(id, Lifecycle::Stopped)?;
        }
        info!(agent = id, "component stopped");
        Ok(())
    }

    /// Stops every running component.
    pub async fn shutdown(&self) {
        let running: Vec<String> = self
            .context
            .registry
            .ids()
            .into_iter()
            .filter(|id| matches!(self.context.registry.lifecycle(id), Ok(Lifecycle::Running)))
            .collect();
        let results = join_all(running.iter().map(|id| self.stop(id))).await;
        for (id, result) in running.iter().zip(results) {
            if let Err(err) = result {
                warn!(agent = %id, error = %err, "stop during shutdown failed");
            }
        }
    }

    /// Status of every component; `running` is true only while its loop is alive.
    #[must_use]
    pub fn status(&self) -> Vec<ComponentStatus> {
        let loops = self.loops.lock();
        self.context
            .registry
            .statuses()
            .into_iter()
            .map(|mut status| {
                status.running = status.lifecycle == Lifecycle::Running
                    && loops.get(&status.id).is_some_and(|h| !h.task.is_finished());
                status
            })
            .collect()
    }

    /// Up to `limit` most recent cycles of `id`, oldest first. Falls back to
    /// persisted records when this process has none; an unreachable store
    /// yields an empty list.
    pub async fn history(&self, id: &str, limit: usize) -> Result<Vec<CycleRecord>, AutonomyError> {
        self.context.registry.spec(id)?;
        let recent: Vec<CycleRecord> = self
            .context
            .history
            .read()
            .get(id)
            .map(|records| {
                let skip = records.len().saturating_sub(limit);
                records.iter().skip(skip).cloned().collect()
            })
            .unwrap_or_default();
        if !recent.is_empty() {
            return Ok(recent);
        }
        match self.context.runner.repository().recent_cycles(id, limit).await {
            Ok(records) => Ok(records),
            Err(err) => {
                warn!(agent = id, error = %err, "persisted history unavailable");
                Ok(Vec::new())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        decision::{scoring::ActionCandidate, DecisionConfig, DecisionEngine},
        linker::{ActionDispatcher, DispatchRequest},
        module::ActionKind,
        services::CoordinatorServices,
        state::AgentStateRepository,
    };
    use async_trait::async_trait;
    use serde_json::Value;
    use std::{collections::BTreeMap, time::Duration};
    use xmrt_feeds::{StaticMeshSource, StaticMiningSource};
    use xmrt_fusion::{FusionConfig, LeaderboardFusion};
    use xmrt_memory_data::{MemoryService, MemoryStateStore, StateStore};

    /// Panics for `custom:explode`, fails fatally for `custom:corrupt`.
    struct Hazard;

    #[async_trait]
    impl ActionDispatcher for Hazard {
        async fn dispatch(&self, request: &DispatchRequest) -> Result<Value, AutonomyError> {
            match &request.action {
                ActionKind::Custom(name) if name == "explode" => panic!("collaborator exploded"),
                ActionKind::Custom(name) if name == "corrupt" => {
                    Err(AutonomyError::Fatal("collaborator state corrupted".into()))
                }
                _ => Ok(Value::Null),
            }
        }
    }

    fn scheduler() -> Scheduler {
        let store: Arc<dyn StateStore> = Arc::new(MemoryStateStore::new());
        let mining = Arc::new(StaticMiningSource::simulated());
        let identities = mining.identities();
        let fusion = LeaderboardFusion::new(
            mining,
            Arc::new(StaticMeshSource::simulated()),
            identities,
            BTreeMap::new(),
            FusionConfig::default(),
        )
        .unwrap();
        let timeout = Duration::from_secs(1);
        let services =
            CoordinatorServices::new(fusion, MemoryService::new(Arc::clone(&store), None), 0.85, timeout)
                .unwrap();
        let runner = CycleRunner::new(
            DecisionEngine::new(DecisionConfig::default()),
            services,
            AgentStateRepository::new(store, timeout),
            Arc::new(Hazard),
        );
        let one = |id: &str, kind: ActionKind| {
            ComponentSpec::new(id, Duration::from_secs(10)).with_candidate(ActionCandidate::from_kind(kind))
        };
        Scheduler::builder(runner)
            .history_limit(4)
            .component(one("steady", ActionKind::RefreshLeaderboard))
            .component(one("exploding", ActionKind::Custom("explode".into())))
            .component(one("corrupt", ActionKind::Custom("corrupt".into())))
            .build()
            .unwrap()
    }

    /// Lets spawned loops drain; paused time only advances once they are idle.
    async fn settle() {
        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn failing_components_never_stop_the_others() {
        let scheduler = scheduler();
        scheduler.start_all().unwrap();
        tokio::time::sleep(Duration::from_secs(35)).await;
        settle().await;

        let status: HashMap<String, ComponentStatus> = scheduler
            .status()
            .into_iter()
            .map(|s| (s.id.clone(), s))
            .collect();
        assert!(status["steady"].running);
        assert!(status["steady"].last_cycle_id.unwrap() >= 3);
        for failed in ["exploding", "corrupt"] {
            assert_eq!(status[failed].lifecycle, Lifecycle::Stopped);
            assert!(!status[failed].running);
            assert_eq!(status[failed].last_outcome, Some(CycleOutcome::Fatal));
            assert_eq!(status[failed].last_cycle_id, Some(1));
        }
        assert!(status["exploding"]
            .last_error
            .as_deref()
            .is_some_and(|e| e.contains("panic")));

        let history = scheduler.history("steady", 10).await.unwrap();
        assert!(history.len() <= 4);
        assert!(history.windows(2).all(|w| w[0].cycle_id < w[1].cycle_id));
        scheduler.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn stop_and_restart_continue_cycle_ids() {
        let scheduler = scheduler();
        scheduler.start("steady").unwrap();
        assert!(scheduler.start("steady").is_err());
        tokio::time::sleep(Duration::from_secs(15)).await;
        settle().await;
        scheduler.stop("steady").await.unwrap();
        assert!(scheduler.stop("steady").await.is_err());
        let before = scheduler.history("steady", 10).await.unwrap();
        let last = before.last().unwrap().cycle_id;

        scheduler.start("steady").unwrap();
        settle().await;
        let after = scheduler.history("steady", 10).await.unwrap();
        assert_eq!(after.last().unwrap().cycle_id, last + 1);
        scheduler.shutdown().await;
        assert!(scheduler.status().iter().all(|s| !s.running));
    }

    #[tokio::test]
    async fn status_is_restored_from_persisted_cycles() {
        let scheduler = scheduler();
        let spec = scheduler.registry().spec("corrupt").unwrap();
        let record = scheduler.runner().run_cycle(&spec).await;
        assert_eq!(record.outcome, CycleOutcome::Fatal);
        assert!(scheduler.status().iter().all(|s| s.last_cycle_id.is_none()));

        scheduler.restore_status().await;
        let status = scheduler.registry().status("corrupt").unwrap();
        assert_eq!(status.last_cycle_id, Some(1));
        assert_eq!(status.last_outcome, Some(CycleOutcome::Fatal));
        assert!(status.last_error.is_some_and(|e| e.contains("corrupted")));
        assert_eq!(scheduler.registry().status("steady").unwrap().last_cycle_id, None);
    }

    #[tokio::test]
    async fn unknown_component_is_reported() {
        let scheduler = scheduler();
        assert!(matches!(
            scheduler.start("ghost"),
            Err(AutonomyError::ComponentNotFound(_))
        ));
        assert!(matches!(
            scheduler.history("ghost", 1).await,
            Err(AutonomyError::ComponentNotFound(_))
        ));
    }
}
