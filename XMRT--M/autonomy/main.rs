//! Runtime wiring: builds every collaborator from a [`CoordinatorConfig`].

use std::sync::Arc;

use anyhow::{Context, Result};
use shared_event_bus::{EventPublisher, FanoutPublisher, FileEventPublisher, MemoryEventBus};
use tracing::info;
use xmrt_feeds::FeedSources;
use xmrt_fusion::{AllocationResult, FusionReport, LeaderboardFusion};
use xmrt_memory_data::{FileStateStore, KeywordRetriever, MemoryService, MemoryStateStore, StateStore};

use crate::{
    config::{CoordinatorConfig, StoreBackend},
    decision::DecisionEngine,
    linker::{ActionDispatcher, CyclePolicy, CycleRunner, TracingDispatcher},
    master::Scheduler,
    module::{AutonomyError, ComponentStatus},
    services::CoordinatorServices,
    state::{AgentStateRepository, CycleRecord},
    telemetry::AutonomyTelemetry,
};

/// Builder for [`AutonomyRuntime`]. Anything not supplied is derived from
/// the configuration.
pub struct AutonomyRuntimeBuilder {
    config: CoordinatorConfig,
    store: Option<Arc<dyn StateStore>>,
    sources: Option<FeedSources>,
    dispatcher: Option<Arc<dyn ActionDispatcher>>,
}

impl AutonomyRuntimeBuilder {
    /// Creates the builder.
    #[must_use]
    pub fn new(config: CoordinatorConfig) -> Self {
        Self {
            config,
            store: None,
            sources: None,
            dispatcher: None,
        }
    }

    /// Uses `store` instead of the configured backend.
    #[must_use]
    pub fn store(mut self, store: Arc<dyn StateStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Uses `sources` instead of the configured feeds.
    #[must_use]
    pub fn sources(mut self, sources: FeedSources) -> Self {
        self.sources = Some(sources);
        self
    }

    /// Routes custom actions to `dispatcher`.
    #[must_use]
    pub fn dispatcher(mut self, dispatcher: Arc<dyn ActionDispatcher>) -> Self {
        self.dispatcher = Some(dispatcher);
        self
    }

    fn open_store(&self) -> Result<Arc<dyn StateStore>> {
        if let Some(store) = &self.store {
            return Ok(Arc::clone(store));
        }
        Ok(match self.config.store.backend {
            StoreBackend::Memory => Arc::new(MemoryStateStore::new()),
            StoreBackend::File => {
                let path = &self.config.store.path;
                Arc::new(
                    FileStateStore::open(path)
                        .with_context(|| format!("opening state store at {}", path.display()))?,
                )
            }
        })
    }

    /// Wires the runtime. Components are registered but not started; their
    /// status is seeded from the last persisted cycles.
    pub async fn build(self) -> Result<AutonomyRuntime> {
        self.config.validate()?;
        let engine_config = &self.config.engine;
        let store = self.open_store()?;

        let events = Arc::new(MemoryEventBus::new(self.config.telemetry.event_backlog));
        let mut fanout = FanoutPublisher::new().with(events.clone());
        if let Some(path) = &self.config.telemetry.event_log_path {
            let file = FileEventPublisher::new(path)
                .with_context(|| format!("opening event log {}", path.display()))?;
            fanout = fanout.with(Arc::new(file));
        }
        let publisher: Arc<dyn EventPublisher> = Arc::new(fanout);
        let mut telemetry = AutonomyTelemetry::builder("autonomy.runtime").event_publisher(publisher);
        if let Some(path) = &self.config.telemetry.log_path {
            telemetry = telemetry.log_path(path);
        }
        let telemetry = telemetry.build().context("building autonomy telemetry")?;

        let sources = match self.sources {
            Some(sources) => sources,
            None => self.config.feeds.build_sources()?,
        };
        let fusion = LeaderboardFusion::new(
            sources.mining,
            sources.mesh,
            sources.identities,
            sources.mesh_mapping,
            engine_config.fusion_config(),
        )?;

        let memory = MemoryService::new(Arc::clone(&store), engine_config.memory_ttl());
        let decision = DecisionEngine::new(engine_config.decision_config())
            .with_retriever(Arc::new(KeywordRetriever::new(memory.clone())))
            .with_telemetry(telemetry.clone());
        let services = CoordinatorServices::new(
            fusion,
            memory,
            engine_config.treasury_ratio,
            engine_config.call_timeout(),
        )?
        .with_telemetry(telemetry.clone());
        let runner = CycleRunner::new(
            decision,
            services,
            AgentStateRepository::new(store, engine_config.call_timeout()),
            self.dispatcher
                .unwrap_or_else(|| Arc::new(TracingDispatcher)),
        )
        .with_policy(CyclePolicy {
            default_autonomy: engine_config.default_autonomy,
            autonomy_step: engine_config.autonomy_step,
            memory_ttl: engine_config.memory_ttl(),
            outcome_history: engine_config.outcome_history,
        })
        .with_telemetry(telemetry.clone());

        let scheduler = self
            .config
            .component_specs()?
            .into_iter()
            .fold(
                Scheduler::builder(runner)
                    .history_limit(engine_config.history_limit)
                    .telemetry(telemetry.clone()),
                |builder, spec| builder.component(spec),
            )
            .build()?;
        scheduler.restore_status().await;
        info!(
            components = ?scheduler.registry().ids(),
            backend = ?self.config.store.backend,
            "autonomy runtime ready"
        );
        Ok(AutonomyRuntime {
            scheduler: Arc::new(scheduler),
            events,
            telemetry,
        })
    }
}

/// Fully wired coordinator: scheduler, shared services, and event bus.
#[derive(Debug, Clone)]
pub struct AutonomyRuntime {
    scheduler: Arc<Scheduler>,
    events: Arc<MemoryEventBus>,
    telemetry: AutonomyTelemetry,
}

impl AutonomyRuntime {
    /// Returns a builder.
    #[must_use]
    pub fn builder(config: CoordinatorConfig) -> AutonomyRuntimeBuilder {
        AutonomyRuntimeBuilder::new(config)
    }

    /// Scheduler driving the component loops.
    #[must_use]
    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    /// In-process event bus.
    #[must_use]
    pub fn events(&self) -> Arc<MemoryEventBus> {
        Arc::clone(&self.events)
    }

    /// Runtime telemetry handle.
    #[must_use]
    pub const fn telemetry(&self) -> &AutonomyTelemetry {
        &self.telemetry
    }

    /// Starts every registered component.
    pub fn start_all(&self) -> Result<Vec<String>, AutonomyError> {
        self.scheduler.start_all()
    }

    /// Starts one component.
    pub fn start(&self, id: &str) -> Result<(), AutonomyError> {
        self.scheduler.start(id)
    }

    /// Stops one component after its in-flight cycle.
    pub async fn stop(&self, id: &str) -> Result<(), AutonomyError> {
        self.scheduler.stop(id).await
    }

    /// Per-component status.
    #[must_use]
    pub fn status(&self) -> Vec<ComponentStatus> {
        self.scheduler.status()
    }

    /// Most recent leaderboard, if any was ever computed.
    pub async fn leaderboard(&self) -> Option<FusionReport> {
        self.scheduler.runner().services().latest_leaderboard().await
    }

    /// Most recent allocation, if any was ever computed.
    pub async fn allocation(&self) -> Option<AllocationResult> {
        self.scheduler.runner().services().latest_allocation().await
    }

    /// Recent cycles of `id`, oldest first.
    pub async fn history(&self, id: &str, limit: usize) -> Result<Vec<CycleRecord>, AutonomyError> {
        self.scheduler.history(id, limit).await
    }

    /// Stops every component.
    pub async fn shutdown(&self) {
        self.scheduler.shutdown().await;
        info!("autonomy runtime shut down");
    }
}
