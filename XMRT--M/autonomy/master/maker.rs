use crate::{
    linker::CycleRunner,
    module::{AutonomyError, ComponentRegistry, ComponentSpec},
    telemetry::AutonomyTelemetry,
};

use super::Scheduler;

/// Builder used to configure a [`Scheduler`].
#[derive(Debug, Clone)]
pub struct SchedulerBuilder {
    runner: CycleRunner,
    registry: ComponentRegistry,
    components: Vec<ComponentSpec>,
    history_limit: usize,
    telemetry: Option<AutonomyTelemetry>,
}

impl SchedulerBuilder {
    /// Creates a new builder.
    #[must_use]
    pub fn new(runner: CycleRunner) -> Self {
        Self {
            runner,
            registry: ComponentRegistry::default(),
            components: Vec::new(),
            history_limit: 64,
            telemetry: None,
        }
    }

    /// Uses an existing registry instead of a fresh one.
    #[must_use]
    pub fn registry(mut self, registry: ComponentRegistry) -> Self {
        self.registry = registry;
        self
    }

    /// Registers `spec` when the scheduler is built.
    #[must_use]
    pub fn component(mut self, spec: ComponentSpec) -> Self {
        self.components.push(spec);
        self
    }

    /// Overrides how many cycle records each component keeps in memory.
    #[must_use]
    pub fn history_limit(mut self, history_limit: usize) -> Self {
        self.history_limit = history_limit.max(1);
        self
    }

    /// Attaches telemetry used by the scheduler.
    #[must_use]
    pub fn telemetry(mut self, telemetry: AutonomyTelemetry) -> Self {
        self.telemetry = Some(telemetry);
        self
    }

    /// Registers the components and finalizes the configuration.
    pub fn build(self) -> Result<Scheduler, AutonomyError> {
        for spec in self.components {
            self.registry.register(spec)?;
        }
        let mut scheduler = Scheduler::new(self.registry, self.runner, self.history_limit);
        if let Some(tel) = self.telemetry {
            scheduler = scheduler.with_telemetry(tel);
        }
        Ok(scheduler)
    }
}
