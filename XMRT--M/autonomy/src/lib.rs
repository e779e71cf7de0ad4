#![deny(
    clippy::all,
    clippy::pedantic,
    clippy::nursery,
    missing_docs,
    rust_2018_idioms
)]

//! XMRT autonomy kernel: decision engine, cycle runner, and component scheduler.

/// Decision engine with bounded reflection.
#[path = "../decision/main.rs"]
pub mod decision;

/// Single-cycle execution.
#[path = "../linker.rs"]
pub mod linker;

/// Leaderboard, treasury, and memory services shared by components.
#[path = "../services.rs"]
pub mod services;

/// Per-component scheduling loops.
#[path = "../master/main.rs"]
pub mod master;

/// Component registry, action kinds, and errors.
#[path = "../module/main.rs"]
pub mod module;

/// Agent state, cycle records, and their persistence.
#[path = "../state.rs"]
pub mod state;

/// Coordinator configuration.
#[path = "../config.rs"]
pub mod config;

/// Telemetry helpers.
#[path = "../telemetry.rs"]
pub mod telemetry;

/// Runtime wiring.
#[path = "../main.rs"]
pub mod orchestration_entry;

pub use config::{
    ActionConfig, ComponentConfig, CoordinatorConfig, EngineConfig, StoreBackend, StoreConfig,
    TelemetryConfig,
};
pub use decision::{
    scoring::{ActionCandidate, CriteriaWeights, ScoredCandidate},
    Decision, DecisionConfig, DecisionEngine, DecisionInput, DecisionPhase, FallbackReason,
};
pub use linker::{
    outcome_key, ActionDispatcher, CyclePolicy, CycleRunner, DispatchRequest, TracingDispatcher,
};
pub use master::{maker::SchedulerBuilder, Scheduler};
pub use module::{
    ActionKind, AutonomyError, ComponentRegistry, ComponentSpec, ComponentStatus, Lifecycle,
};
pub use services::{CoordinatorServices, ALLOCATION_KEY, LEADERBOARD_KEY};
pub use orchestration_entry::{AutonomyRuntime, AutonomyRuntimeBuilder};
pub use state::{
    ActionRecord, AgentState, AgentStateRepository, CycleOutcome, CycleRecord, OpenCycle,
};
pub use telemetry::{AutonomyTelemetry, AutonomyTelemetryBuilder};
pub use xmrt_feeds::FeedsConfig;
