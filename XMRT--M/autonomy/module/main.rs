//! Component registry, action taxonomy, and the autonomy error type.

use std::{fmt, str::FromStr, sync::Arc, time::Duration};

use indexmap::IndexMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use xmrt_fusion::{AllocationError, FusionError};
use xmrt_memory_data::StoreError;

use crate::{
    decision::scoring::ActionCandidate,
    state::{CycleOutcome, CycleRecord},
};

/// Errors surfaced by the autonomy kernel.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AutonomyError {
    /// The state store could not be reached. The cycle continues on
    /// in-memory state.
    #[error("state store unavailable: {0}")]
    StoreUnavailable(String),
    /// A collaborator call exceeded its budget.
    #[error("timed out: {0}")]
    Timeout(String),
    /// Input rejected. Not retryable.
    #[error("invalid input: {0}")]
    InvalidInput(String),
    /// Unrecoverable failure. Stops the owning component.
    #[error("fatal: {0}")]
    Fatal(String),
    /// No component registered under the id.
    #[error("component not found: {0}")]
    ComponentNotFound(String),
    /// A component with the id already exists.
    #[error("component already registered: {0}")]
    DuplicateComponent(String),
    /// Lifecycle change not allowed from the current state.
    #[error("component {component}: cannot move from {from} to {to}")]
    InvalidTransition {
        /// Component id.
        component: String,
        /// Current lifecycle.
        from: Lifecycle,
        /// Requested lifecycle.
        to: Lifecycle,
    },
}

impl AutonomyError {
    /// Whether a later cycle may succeed where this one failed.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::StoreUnavailable(_) | Self::Timeout(_))
    }

    /// Whether the failure must stop the owning component.
    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        matches!(self, Self::Fatal(_))
    }
}

impl From<StoreError> for AutonomyError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Unavailable(reason) => Self::StoreUnavailable(reason),
            StoreError::NotFound(key) => Self::InvalidInput(format!("missing key {key}")),
            StoreError::InvalidKey(key) => Self::InvalidInput(format!("invalid key {key:?}")),
            StoreError::Serialization(reason) => {
                Self::Fatal(format!("corrupt stored document: {reason}"))
            }
        }
    }
}

impl From<AllocationError> for AutonomyError {
    fn from(err: AllocationError) -> Self {
        match err {
            AllocationError::InvalidInput(reason) => Self::InvalidInput(reason),
            violation @ AllocationError::InvariantViolation { .. } => {
                Self::Fatal(violation.to_string())
            }
        }
    }
}

impl From<FusionError> for AutonomyError {
    fn from(err: FusionError) -> Self {
        match err {
            FusionError::InvalidInput(reason) => Self::InvalidInput(reason),
        }
    }
}

/// Actions a component can take in a cycle.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum ActionKind {
    /// Fuse telemetry and publish a fresh leaderboard.
    RefreshLeaderboard,
    /// Split current revenue between treasury and operations.
    AllocateTreasury,
    /// Evict expired memories.
    ConsolidateMemory,
    /// Do nothing. The built-in fallback.
    #[default]
    Observe,
    /// Handled by an external dispatcher. Written `custom:<name>`.
    Custom(String),
}

/// Baseline criteria for an action before configuration overrides.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ActionProfile {
    /// Expected benefit in `[0, 1]`.
    pub expected_value: f64,
    /// Estimated risk in `[0, 1]`.
    pub risk: f64,
    /// Autonomy level the action is designed for.
    pub required_autonomy: f64,
}

/// Longest component id or custom action name, in bytes. Both end up in
/// store keys, which file-backed stores turn into file names.
pub const MAX_NAME_LEN: usize = 48;

impl ActionKind {
    const CUSTOM_PREFIX: &'static str = "custom:";

    /// Default criteria.
    #[must_use]
    pub const fn profile(&self) -> ActionProfile {
        let (expected_value, risk, required_autonomy) = match self {
            Self::RefreshLeaderboard => (0.6, 0.1, 0.5),
            Self::AllocateTreasury => (0.8, 0.4, 0.85),
            Self::ConsolidateMemory => (0.3, 0.05, 0.3),
            Self::Observe => (0.1, 0.0, 0.0),
            Self::Custom(_) => (0.5, 0.3, 0.5),
        };
        ActionProfile {
            expected_value,
            risk,
            required_autonomy,
        }
    }

    /// Words used to look up related memories.
    #[must_use]
    pub fn topic(&self) -> String {
        match self {
            Self::Custom(name) => name.replace(['_', '-', '.'], " "),
            other => other.to_string().replace('_', " "),
        }
    }
}

impl fmt::Display for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::RefreshLeaderboard => f.write_str("refresh_leaderboard"),
            Self::AllocateTreasury => f.write_str("allocate_treasury"),
            Self::ConsolidateMemory => f.write_str("consolidate_memory"),
            Self::Observe => f.write_str("observe"),
            Self::Custom(name) => write!(f, "{}{name}", Self::CUSTOM_PREFIX),
        }
    }
}

impl FromStr for ActionKind {
    type Err = AutonomyError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim() {
            "refresh_leaderboard" => Ok(Self::RefreshLeaderboard),
            "allocate_treasury" => Ok(Self::AllocateTreasury),
            "consolidate_memory" => Ok(Self::ConsolidateMemory),
            "observe" => Ok(Self::Observe),
            other => match other.strip_prefix(Self::CUSTOM_PREFIX) {
                Some(name)
                    if !name.is_empty()
                        && name.len() <= MAX_NAME_LEN
                        && name
                            .chars()
                            .all(|c| c.is_ascii_alphanumeric() || "_-.".contains(c)) =>
                {
                    Ok(Self::Custom(name.to_string()))
                }
                _ => Err(AutonomyError::InvalidInput(format!(
                    "unknown action kind {other:?}"
                ))),
            },
        }
    }
}

impl TryFrom<String> for ActionKind {
    type Error = AutonomyError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<ActionKind> for String {
    fn from(kind: ActionKind) -> Self {
        kind.to_string()
    }
}

/// Component lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Lifecycle {
    /// Known but never started.
    Registered,
    /// Loop active.
    Running,
    /// Loop ended by request or by a fatal cycle. May be restarted.
    Stopped,
}

impl Lifecycle {
    /// Whether `self -> to` is a legal transition.
    #[must_use]
    pub const fn can_move_to(self, to: Self) -> bool {
        matches!(
            (self, to),
            (Self::Registered | Self::Stopped, Self::Running) | (Self::Running, Self::Stopped)
        )
    }
}

impl fmt::Display for Lifecycle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Registered => "registered",
            Self::Running => "running",
            Self::Stopped => "stopped",
        })
    }
}

/// Static description of a scheduled component.
#[derive(Debug, Clone, PartialEq)]
pub struct ComponentSpec {
    /// Unique id; also the agent id for its state.
    pub id: String,
    /// Time between cycle starts.
    pub cycle_interval: Duration,
    /// Actions evaluated each cycle, in insertion order.
    pub candidates: Vec<ActionCandidate>,
    /// Action taken when scoring cannot proceed.
    pub default_action: ActionKind,
}

impl ComponentSpec {
    /// Component with no candidates and `Observe` as fallback.
    #[must_use]
    pub fn new(id: impl Into<String>, cycle_interval: Duration) -> Self {
        Self {
            id: id.into(),
            cycle_interval,
            candidates: Vec::new(),
            default_action: ActionKind::Observe,
        }
    }

    /// Adds a candidate.
    #[must_use]
    pub fn with_candidate(mut self, candidate: ActionCandidate) -> Self {
        self.candidates.push(candidate);
        self
    }

    /// Sets the fallback action.
    #[must_use]
    pub fn with_default_action(mut self, kind: ActionKind) -> Self {
        self.default_action = kind;
        self
    }

    /// Rejects ids that cannot key persistent state and zero intervals.
    pub fn validate(&self) -> Result<(), AutonomyError> {
        if self.id.trim().is_empty() || self.id.contains('/') || self.id.chars().any(char::is_control) {
            return Err(AutonomyError::InvalidInput(format!(
                "component id {:?} must be non-empty without '/'",
                self.id
            )));
        }
        if self.id.len() > MAX_NAME_LEN {
            return Err(AutonomyError::InvalidInput(format!(
                "component id {:?} exceeds {MAX_NAME_LEN} bytes",
                self.id
            )));
        }
        if self.cycle_interval.is_zero() {
            return Err(AutonomyError::InvalidInput(format!(
                "component {}: cycle interval must be positive",
                self.id
            )));
        }
        Ok(())
    }
}

/// Externally visible state of a component.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ComponentStatus {
    /// Component id.
    pub id: String,
    /// Lifecycle state.
    pub lifecycle: Lifecycle,
    /// Whether the scheduling loop is alive.
    pub running: bool,
    /// Last completed cycle id.
    pub last_cycle_id: Option<u64>,
    /// Outcome of that cycle.
    pub last_outcome: Option<CycleOutcome>,
    /// Reason recorded by the last fatal cycle.
    pub last_error: Option<String>,
}

#[derive(Debug, Clone)]
struct ComponentSlot {
    spec: ComponentSpec,
    lifecycle: Lifecycle,
    last_cycle_id: Option<u64>,
    last_outcome: Option<CycleOutcome>,
    last_error: Option<String>,
}

/// Registry of components and their lifecycles.
#[derive(Debug, Default, Clone)]
pub struct ComponentRegistry {
    inner: Arc<RwLock<IndexMap<String, ComponentSlot>>>,
}

impl ComponentRegistry {
    /// Registers a new component in the `Registered` state.
    pub fn register(&self, spec: ComponentSpec) -> Result<(), AutonomyError> {
        spec.validate()?;
        let mut inner = self.inner.write();
        if inner.contains_key(&spec.id) {
            return Err(AutonomyError::DuplicateComponent(spec.id));
        }
        inner.insert(
            spec.id.clone(),
            ComponentSlot {
                spec,
                lifecycle: Lifecycle::Registered,
                last_cycle_id: None,
                last_outcome: None,
                last_error: None,
            },
        );
        Ok(())
    }

    /// Number of registered components.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.read().len()
    }

    /// Whether nothing is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.read().is_empty()
    }

    /// Ids in registration order.
    #[must_use]
    pub fn ids(&self) -> Vec<String> {
        self.inner.read().keys().cloned().collect()
    }

    /// Spec of `id`.
    pub fn spec(&self, id: &str) -> Result<ComponentSpec, AutonomyError> {
        self.inner
            .read()
            .get(id)
            .map(|slot| slot.spec.clone())
            .ok_or_else(|| AutonomyError::ComponentNotFound(id.to_string()))
    }

    /// Current lifecycle of `id`.
    pub fn lifecycle(&self, id: &str) -> Result<Lifecycle, AutonomyError> {
        self.inner
            .read()
            .get(id)
            .map(|slot| slot.lifecycle)
            .ok_or_else(|| AutonomyError::ComponentNotFound(id.to_string()))
    }

    /// Moves `id` to `to`, returning the previous lifecycle.
    pub fn transition(&self, id: &str, to: Lifecycle) -> Result<Lifecycle, AutonomyError> {
        let mut inner = self.inner.write();
        let slot = inner
            .get_mut(id)
            .ok_or_else(|| AutonomyError::ComponentNotFound(id.to_string()))?;
        let from = slot.lifecycle;
        if !from.can_move_to(to) {
            return Err(AutonomyError::InvalidTransition {
                component: id.to_string(),
                from,
                to,
            });
        }
        slot.lifecycle = to;
        if to == Lifecycle::Running {
            slot.last_error = None;
        }
        Ok(from)
    }

    /// Records the result of a finished cycle.
    pub fn record_cycle(&self, record: &CycleRecord) {
        if let Some(slot) = self.inner.write().get_mut(&record.agent_id) {
            slot.last_cycle_id = Some(record.cycle_id);
            slot.last_outcome = Some(record.outcome);
            if record.outcome == CycleOutcome::Fatal {
                slot.last_error = record.notes.last().cloned();
            }
        }
    }

    /// Status of `id`; `running` reflects the lifecycle only.
    pub fn status(&self, id: &str) -> Result<ComponentStatus, AutonomyError> {
        self.inner
            .read()
            .get(id)
            .map(|slot| to_status(id, slot))
            .ok_or_else(|| AutonomyError::ComponentNotFound(id.to_string()))
    }

    /// Status of every component in registration order.
    #[must_use]
    pub fn statuses(&self) -> Vec<ComponentStatus> {
        self.inner
            .read()
            .iter()
            .map(|(id, slot)| to_status(id, slot))
            .collect()
    }
}

fn to_status(id: &str, slot: &ComponentSlot) -> ComponentStatus {
    ComponentStatus {
        id: id.to_string(),
        lifecycle: slot.lifecycle,
        running: slot.lifecycle == Lifecycle::Running,
        last_cycle_id: slot.last_cycle_id,
        last_outcome: slot.last_outcome,
        last_error: slot.last_error.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(id: &str) -> ComponentSpec {
        ComponentSpec::new(id, Duration::from_secs(60))
            .with_candidate(ActionCandidate::from_kind(ActionKind::RefreshLeaderboard))
    }

    #[test]
    fn action_kind_names_roundtrip_through_strings() {
        for raw in [
            "refresh_leaderboard",
            "allocate_treasury",
            "consolidate_memory",
            "observe",
            "custom:rebalance-pool",
        ] {
            let kind: ActionKind = raw.parse().unwrap();
            assert_eq!(kind.to_string(), raw);
        }
        assert!("launch_rockets".parse::<ActionKind>().is_err());
        assert!("custom:".parse::<ActionKind>().is_err());
        assert!("custom:a/b".parse::<ActionKind>().is_err());
        assert_eq!(ActionKind::AllocateTreasury.topic(), "allocate treasury");
    }

    #[test]
    fn lifecycle_transitions() {
        let registry = ComponentRegistry::default();
        registry.register(spec("leaderboard-agent")).unwrap();
        assert!(matches!(
            registry.register(spec("leaderboard-agent")),
            Err(AutonomyError::DuplicateComponent(_))
        ));
        assert!(matches!(
            registry.transition("leaderboard-agent", Lifecycle::Stopped),
            Err(AutonomyError::InvalidTransition { .. })
        ));
        assert_eq!(
            registry.transition("leaderboard-agent", Lifecycle::Running).unwrap(),
            Lifecycle::Registered
        );
        registry
            .transition("leaderboard-agent", Lifecycle::Stopped)
            .unwrap();
        registry
            .transition("leaderboard-agent", Lifecycle::Running)
            .unwrap();
        assert!(matches!(
            registry.transition("ghost", Lifecycle::Running),
            Err(AutonomyError::ComponentNotFound(_))
        ));
    }

    #[test]
    fn rejects_unusable_component_ids() {
        let registry = ComponentRegistry::default();
        assert!(registry.register(spec("a/b")).is_err());
        assert!(registry.register(spec(" ")).is_err());
        assert!(registry.register(spec(&"a".repeat(MAX_NAME_LEN + 1))).is_err());
        assert!(registry.register(spec(&"a".repeat(MAX_NAME_LEN))).is_ok());
        assert!(format!("custom:{}", "n".repeat(MAX_NAME_LEN + 1))
            .parse::<ActionKind>()
            .is_err());
        let zero = ComponentSpec::new("zero", Duration::ZERO);
        assert!(registry.register(zero).is_err());
        assert_eq!(registry.ids(), vec!["a".repeat(MAX_NAME_LEN)]);
    }

    #[test]
    fn store_errors_map_onto_cycle_semantics() {
        assert!(AutonomyError::from(StoreError::Unavailable("down".into())).is_retryable());
        assert!(AutonomyError::from(StoreError::Serialization("bad".into())).is_fatal());
    }
}
