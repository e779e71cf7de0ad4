use std::{
    collections::BTreeSet,
    fs,
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use xmrt_feeds::FeedsConfig;
use xmrt_fusion::{FusionConfig, DEFAULT_TREASURY_RATIO};

use crate::{
    decision::{
        scoring::{ActionCandidate, CriteriaWeights},
        DecisionConfig,
    },
    module::{ActionKind, ComponentSpec},
};

/// Top-level coordinator configuration document.
#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
#[serde(default)]
pub struct CoordinatorConfig {
    /// Decision and allocation tunables.
    pub engine: EngineConfig,
    /// State store backend.
    pub store: StoreConfig,
    /// Log and event sinks.
    pub telemetry: TelemetryConfig,
    /// Telemetry sources.
    pub feeds: FeedsConfig,
    /// Scheduled components. Defaults apply when empty.
    pub components: Vec<ComponentConfig>,
}

/// `[engine]` section.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct EngineConfig {
    /// Treasury share of revenue.
    pub treasury_ratio: f64,
    /// Hash-rate multiplier for mesh-connected participants.
    pub connectivity_bonus: f64,
    /// Maximum reflection passes per decision.
    pub reflection_budget: u32,
    /// Leaders re-scored per reflection pass.
    pub reflection_top_k: usize,
    /// Scale of the reflection adjustment.
    pub reflection_weight: f64,
    /// Memories retrieved per candidate during reflection.
    pub retrieval_limit: usize,
    /// Autonomy level of agents without stored state.
    pub default_autonomy: f64,
    /// Autonomy change after each cycle.
    pub autonomy_step: f64,
    /// Budget for each store, telemetry, or retriever call.
    pub call_timeout_ms: u64,
    /// Cycle records kept in memory per component.
    pub history_limit: usize,
    /// Lifetime of outcome memories; unset keeps them indefinitely.
    pub memory_ttl_seconds: Option<u64>,
    /// Outcome memories kept per component and action.
    pub outcome_history: usize,
    /// Criterion weights.
    pub weights: CriteriaWeights,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            treasury_ratio: DEFAULT_TREASURY_RATIO,
            connectivity_bonus: 1.10,
            reflection_budget: 1,
            reflection_top_k: 3,
            reflection_weight: 0.25,
            retrieval_limit: 8,
            default_autonomy: 0.85,
            autonomy_step: 0.01,
            call_timeout_ms: 5_000,
            history_limit: 64,
            memory_ttl_seconds: None,
            outcome_history: 16,
            weights: CriteriaWeights::default(),
        }
    }
}

impl EngineConfig {
    /// Per-call timeout.
    #[must_use]
    pub const fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.call_timeout_ms)
    }

    /// Lifetime of outcome memories.
    #[must_use]
    pub fn memory_ttl(&self) -> Option<Duration> {
        self.memory_ttl_seconds.map(Duration::from_secs)
    }

    /// Decision engine settings.
    #[must_use]
    pub fn decision_config(&self) -> DecisionConfig {
        DecisionConfig {
            weights: self.weights,
            reflection_budget: self.reflection_budget,
            reflection_top_k: self.reflection_top_k,
            reflection_weight: self.reflection_weight,
            retrieval_limit: self.retrieval_limit,
            call_timeout: self.call_timeout(),
        }
    }

    /// Leaderboard fusion settings.
    #[must_use]
    pub const fn fusion_config(&self) -> FusionConfig {
        FusionConfig {
            connectivity_bonus: self.connectivity_bonus,
            fetch_timeout: self.call_timeout(),
        }
    }

    fn validate(&self) -> Result<()> {
        if !(0.0..=1.0).contains(&self.treasury_ratio) {
            bail!("engine.treasury_ratio must lie in [0, 1], got {}", self.treasury_ratio);
        }
        if !self.connectivity_bonus.is_finite() || self.connectivity_bonus < 1.0 {
            bail!("engine.connectivity_bonus must be >= 1.0, got {}", self.connectivity_bonus);
        }
        if !(0.0..=1.0).contains(&self.default_autonomy) {
            bail!("engine.default_autonomy must lie in [0, 1]");
        }
        if !self.autonomy_step.is_finite() || !(0.0..=1.0).contains(&self.autonomy_step) {
            bail!("engine.autonomy_step must lie in [0, 1]");
        }
        if self.call_timeout_ms == 0 {
            bail!("engine.call_timeout_ms must be positive");
        }
        if self.history_limit == 0 {
            bail!("engine.history_limit must be positive");
        }
        if self.memory_ttl_seconds == Some(0) {
            bail!("engine.memory_ttl_seconds must be positive when set");
        }
        if self.outcome_history == 0 {
            bail!("engine.outcome_history must be positive");
        }
        self.decision_config()
            .validate()
            .context("engine decision settings")?;
        Ok(())
    }
}

/// Storage backend selector.
#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StoreBackend {
    /// In-process; nothing survives a restart.
    #[default]
    Memory,
    /// JSON documents under `store.path`.
    File,
}

/// `[store]` section.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct StoreConfig {
    /// Backend.
    pub backend: StoreBackend,
    /// Root directory of the file backend.
    pub path: PathBuf,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::Memory,
            path: PathBuf::from("state"),
        }
    }
}

/// `[telemetry]` section.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct TelemetryConfig {
    /// JSON-lines log of autonomy records.
    pub log_path: Option<PathBuf>,
    /// JSON-lines mirror of published events.
    pub event_log_path: Option<PathBuf>,
    /// Events retained by the in-memory bus.
    pub event_backlog: usize,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_path: None,
            event_log_path: None,
            event_backlog: 256,
        }
    }
}

/// `[[components]]` entry.
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct ComponentConfig {
    /// Component id.
    pub id: String,
    /// Seconds between cycle starts.
    pub cycle_interval_seconds: u64,
    /// Action taken when scoring cannot proceed.
    #[serde(default)]
    pub default_action: ActionKind,
    /// Candidate actions in evaluation order.
    #[serde(default)]
    pub actions: Vec<ActionConfig>,
}

/// `[[components.actions]]` entry; unset criteria use the kind's defaults.
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct ActionConfig {
    /// Action kind, e.g. `refresh_leaderboard` or `custom:notify`.
    pub kind: ActionKind,
    /// Expected benefit override.
    #[serde(default)]
    pub expected_value: Option<f64>,
    /// Risk override.
    #[serde(default)]
    pub risk: Option<f64>,
    /// Required autonomy override.
    #[serde(default)]
    pub required_autonomy: Option<f64>,
}

impl ActionConfig {
    fn candidate(&self) -> ActionCandidate {
        let mut candidate = ActionCandidate::from_kind(self.kind.clone());
        if let Some(value) = self.expected_value {
            candidate = candidate.with_expected_value(value);
        }
        if let Some(risk) = self.risk {
            candidate = candidate.with_risk(risk);
        }
        if let Some(level) = self.required_autonomy {
            candidate = candidate.with_required_autonomy(level);
        }
        candidate
    }
}

impl ComponentConfig {
    fn with_actions(id: &str, interval: u64, kinds: &[ActionKind]) -> Self {
        Self {
            id: id.to_string(),
            cycle_interval_seconds: interval,
            default_action: ActionKind::Observe,
            actions: kinds
                .iter()
                .map(|kind| ActionConfig {
                    kind: kind.clone(),
                    expected_value: None,
                    risk: None,
                    required_autonomy: None,
                })
                .collect(),
        }
    }

    /// Components scheduled when the document configures none.
    #[must_use]
    pub fn defaults() -> Vec<Self> {
        vec![
            Self::with_actions(
                "leaderboard-agent",
                60,
                &[ActionKind::RefreshLeaderboard, ActionKind::ConsolidateMemory],
            ),
            Self::with_actions(
                "treasury-agent",
                300,
                &[ActionKind::AllocateTreasury, ActionKind::Observe],
            ),
        ]
    }

    /// Registry spec for this component.
    pub fn to_spec(&self) -> Result<ComponentSpec> {
        let spec = self.actions.iter().fold(
            ComponentSpec::new(&self.id, Duration::from_secs(self.cycle_interval_seconds))
                .with_default_action(self.default_action.clone()),
            |spec, action| spec.with_candidate(action.candidate()),
        );
        spec.validate()
            .with_context(|| format!("component {}", self.id))?;
        for candidate in &spec.candidates {
            let criteria = [candidate.expected_value, candidate.risk, candidate.required_autonomy];
            if criteria.iter().any(|v| !v.is_finite()) {
                bail!("component {}: action {} has non-finite criteria", self.id, candidate.kind);
            }
        }
        Ok(spec)
    }
}

impl CoordinatorConfig {
    /// Reads, resolves, and validates the document at `path`.
    ///
    /// Relative store and telemetry paths are taken relative to the
    /// document's directory.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = fs::read_to_string(path)
            .with_context(|| format!("reading coordinator config {}", path.display()))?;
        let mut config = Self::from_toml_str(&raw)
            .with_context(|| format!("parsing coordinator config {}", path.display()))?;
        if let Some(base) = path.parent() {
            config.resolve_paths(base);
        }
        Ok(config)
    }

    /// Parses and validates a TOML document.
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let config: Self = toml::from_str(raw).context("invalid coordinator TOML")?;
        config.validate()?;
        Ok(config)
    }

    fn resolve_paths(&mut self, base: &Path) {
        let resolve = |path: &mut PathBuf| {
            if path.is_relative() {
                *path = base.join(&*path);
            }
        };
        resolve(&mut self.store.path);
        if let Some(path) = self.telemetry.log_path.as_mut() {
            resolve(path);
        }
        if let Some(path) = self.telemetry.event_log_path.as_mut() {
            resolve(path);
        }
    }

    /// Validates every section.
    pub fn validate(&self) -> Result<()> {
        self.engine.validate()?;
        self.feeds.validate()?;
        if self.telemetry.event_backlog == 0 {
            bail!("telemetry.event_backlog must be positive");
        }
        let mut seen = BTreeSet::new();
        for component in &self.components {
            if !seen.insert(component.id.as_str()) {
                bail!("component {} is configured twice", component.id);
            }
            component.to_spec()?;
        }
        Ok(())
    }

    /// Configured components, or the defaults when none are configured.
    pub fn component_specs(&self) -> Result<Vec<ComponentSpec>> {
        if self.components.is_empty() {
            ComponentConfig::defaults().iter().map(ComponentConfig::to_spec).collect()
        } else {
            self.components.iter().map(ComponentConfig::to_spec).collect()
        }
    }
}
