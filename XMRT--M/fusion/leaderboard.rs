use std::{
    cmp::Ordering,
    collections::{BTreeMap, BTreeSet},
    fmt,
    sync::Arc,
    time::Duration,
};

use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, instrument, warn};
use xmrt_feeds::{
    FeedError, MeshTelemetry, MiningTelemetry, NodeInfo, ParticipantTelemetry, PoolSnapshot,
    Position,
};

/// Fusion failures that reject input rather than degrade the report.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FusionError {
    /// A value outside its accepted domain.
    #[error("invalid input: {0}")]
    InvalidInput(String),
}

/// Fusion policy knobs.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct FusionConfig {
    /// Multiplier applied to mesh-connected participants.
    pub connectivity_bonus: f64,
    /// Budget for each telemetry call.
    pub fetch_timeout: Duration,
}

impl Default for FusionConfig {
    fn default() -> Self {
        Self {
            connectivity_bonus: 1.10,
            fetch_timeout: Duration::from_secs(5),
        }
    }
}

impl FusionConfig {
    /// Rejects a bonus below 1.0 or a zero timeout.
    pub fn validate(&self) -> Result<(), FusionError> {
        if !self.connectivity_bonus.is_finite() || self.connectivity_bonus < 1.0 {
            return Err(FusionError::InvalidInput(format!(
                "connectivity bonus must be finite and >= 1.0, got {}",
                self.connectivity_bonus
            )));
        }
        if self.fetch_timeout.is_zero() {
            return Err(FusionError::InvalidInput("fetch timeout must be positive".into()));
        }
        Ok(())
    }
}

/// Participant joined with its mesh node for one refresh.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ParticipantRecord {
    /// Wallet or worker identity.
    pub identity: String,
    /// Hash rate in H/s.
    pub hash_rate: f64,
    /// Pending earnings in coins.
    pub earned_amount: f64,
    /// Mapped mesh node, present only when that node is in the topology.
    pub mesh_node_id: Option<String>,
    /// Signal strength of the mapped node in dBm.
    pub signal_strength: Option<f64>,
    /// Position of the mapped node.
    pub position: Option<Position>,
}

impl ParticipantRecord {
    /// Participant without mesh connectivity.
    #[must_use]
    pub fn new(identity: impl Into<String>, hash_rate: f64, earned_amount: f64) -> Self {
        Self {
            identity: identity.into(),
            hash_rate,
            earned_amount,
            mesh_node_id: None,
            signal_strength: None,
            position: None,
        }
    }

    /// Attaches the node this participant is reachable through.
    #[must_use]
    pub fn on_node(mut self, node: &NodeInfo) -> Self {
        self.mesh_node_id = Some(node.node_id.clone());
        self.signal_strength = Some(node.signal_strength_dbm);
        self.position = node.position;
        self
    }

    /// Whether the participant is reachable over the mesh.
    #[must_use]
    pub const fn mesh_connected(&self) -> bool {
        self.mesh_node_id.is_some()
    }

    fn validate(&self) -> Result<(), FusionError> {
        if !self.hash_rate.is_finite() || self.hash_rate < 0.0 {
            return Err(FusionError::InvalidInput(format!(
                "{}: hash rate {} is not a finite non-negative number",
                self.identity, self.hash_rate
            )));
        }
        if !self.earned_amount.is_finite() || self.earned_amount < 0.0 {
            return Err(FusionError::InvalidInput(format!(
                "{}: earned amount {} is not a finite non-negative number",
                self.identity, self.earned_amount
            )));
        }
        Ok(())
    }
}

/// One ranked row of the leaderboard.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LeaderboardEntry {
    /// 1-based rank.
    pub rank: usize,
    /// Wallet or worker identity.
    pub identity: String,
    /// Raw hash rate in H/s.
    pub hash_rate: f64,
    /// Link quality in `0..=100`, zero when not on the mesh.
    pub connectivity_score: u8,
    /// Ranking multiplier, `>= 1.0`.
    pub efficiency_bonus: f64,
    /// Whether the participant is reachable over the mesh.
    pub mesh_connected: bool,
    /// Mesh node, when connected.
    pub mesh_node_id: Option<String>,
    /// Pending earnings in coins.
    pub earned_amount: f64,
}

impl LeaderboardEntry {
    /// Hash rate after the connectivity bonus. This is the ranking key.
    #[must_use]
    pub fn weighted_hash_rate(&self) -> f64 {
        self.hash_rate * self.efficiency_bonus
    }
}

/// Maps signal strength to a `0..=100` score: `clamp(round(100 + dBm), 0, 100)`.
///
/// Missing or non-finite readings score zero.
#[must_use]
#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
pub fn connectivity_score(signal_strength_dbm: Option<f64>) -> u8 {
    match signal_strength_dbm {
        Some(dbm) if dbm.is_finite() => (100.0 + dbm).round().clamp(0.0, 100.0) as u8,
        _ => 0,
    }
}

/// Ranks `records` by `hash_rate * bonus` descending, identity ascending.
///
/// Only mesh-connected records receive `bonus`. Duplicate identities keep
/// their best-weighted record, so the output never depends on input order.
#[must_use]
pub fn rank(records: &[ParticipantRecord], bonus: f64) -> Vec<LeaderboardEntry> {
    let mut by_identity: BTreeMap<&str, LeaderboardEntry> = BTreeMap::new();
    for record in records {
        let connected = record.mesh_connected();
        let entry = LeaderboardEntry {
            rank: 0,
            identity: record.identity.clone(),
            hash_rate: record.hash_rate,
            connectivity_score: if connected {
                connectivity_score(record.signal_strength)
            } else {
                0
            },
            efficiency_bonus: if connected { bonus } else { 1.0 },
            mesh_connected: connected,
            mesh_node_id: record.mesh_node_id.clone(),
            earned_amount: record.earned_amount,
        };
        by_identity
            .entry(record.identity.as_str())
            .and_modify(|current| {
                if compare_entries(&entry, current) == Ordering::Less {
                    *current = entry.clone();
                }
            })
            .or_insert(entry);
    }

    let mut entries: Vec<LeaderboardEntry> = by_identity.into_values().collect();
    entries.sort_by(compare_entries);
    for (idx, entry) in entries.iter_mut().enumerate() {
        entry.rank = idx + 1;
    }
    entries
}

fn compare_entries(a: &LeaderboardEntry, b: &LeaderboardEntry) -> Ordering {
    b.weighted_hash_rate()
        .total_cmp(&a.weighted_hash_rate())
        .then_with(|| a.identity.cmp(&b.identity))
        .then_with(|| b.earned_amount.total_cmp(&a.earned_amount))
        .then_with(|| a.mesh_node_id.cmp(&b.mesh_node_id))
}

/// Coarse health of mesh participation.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MeshHealth {
    /// More than 80 % of participants connected.
    Excellent,
    /// More than 50 % connected.
    Good,
    /// Everything else.
    Fair,
}

impl fmt::Display for MeshHealth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Excellent => "Excellent",
            Self::Good => "Good",
            Self::Fair => "Fair",
        })
    }
}

/// Mesh network overview accompanying a leaderboard.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NetworkSummary {
    /// Nodes in the fetched topology.
    pub total_nodes: usize,
    /// Nodes heard within the liveness window.
    pub online_nodes: usize,
    /// Ranked participants.
    pub total_participants: usize,
    /// Ranked participants reachable over the mesh.
    pub connected_participants: usize,
    /// `connected / total * 100`, zero without participants.
    pub connectivity_rate: f64,
    /// Sum of raw hash rates.
    pub total_hash_rate: f64,
    /// Health band.
    pub health: MeshHealth,
}

impl NetworkSummary {
    /// Summarizes `entries` against `topology` at `now`.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn compute(entries: &[LeaderboardEntry], topology: &[NodeInfo], now: DateTime<Utc>) -> Self {
        let total = entries.len();
        let connected = entries.iter().filter(|e| e.mesh_connected).count();
        let health = if connected as f64 > total as f64 * 0.8 {
            MeshHealth::Excellent
        } else if connected as f64 > total as f64 * 0.5 {
            MeshHealth::Good
        } else {
            MeshHealth::Fair
        };
        Self {
            total_nodes: topology.len(),
            online_nodes: topology
                .iter()
                .filter(|node| node.is_online(now, NodeInfo::ONLINE_WINDOW))
                .count(),
            total_participants: total,
            connected_participants: connected,
            connectivity_rate: if total == 0 {
                0.0
            } else {
                connected as f64 / total as f64 * 100.0
            },
            total_hash_rate: entries.iter().map(|e| e.hash_rate).sum(),
            health,
        }
    }
}

/// Participant left out of a report, with the reason.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DegradedParticipant {
    /// Identity that was skipped.
    pub identity: String,
    /// Why it was skipped.
    pub reason: String,
}

/// Result of one fusion pass.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FusionReport {
    /// When the pass finished.
    pub generated_at: DateTime<Utc>,
    /// Pool statistics, absent when the pool call failed.
    pub pool: Option<PoolSnapshot>,
    /// Ranked participants.
    pub entries: Vec<LeaderboardEntry>,
    /// Participants omitted because their telemetry was unusable.
    pub degraded: Vec<DegradedParticipant>,
    /// Whether the mesh topology was reachable.
    pub mesh_available: bool,
    /// Network overview.
    pub summary: NetworkSummary,
}

impl FusionReport {
    /// Sum of pending earnings across ranked participants.
    #[must_use]
    pub fn total_earned(&self) -> f64 {
        self.entries.iter().map(|e| e.earned_amount).sum()
    }

    /// Whether anything was skipped or unreachable.
    #[must_use]
    pub fn is_degraded(&self) -> bool {
        self.pool.is_none() || !self.mesh_available || !self.degraded.is_empty()
    }
}

/// Joins mining and mesh telemetry into a ranked leaderboard.
#[derive(Clone)]
pub struct LeaderboardFusion {
    mining: Arc<dyn MiningTelemetry>,
    mesh: Arc<dyn MeshTelemetry>,
    identities: Vec<String>,
    mesh_mapping: BTreeMap<String, String>,
    config: FusionConfig,
}

impl fmt::Debug for LeaderboardFusion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LeaderboardFusion")
            .field("identities", &self.identities)
            .field("mesh_mapping", &self.mesh_mapping)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl LeaderboardFusion {
    /// Creates a fusion over the given sources. Identities are deduplicated.
    pub fn new(
        mining: Arc<dyn MiningTelemetry>,
        mesh: Arc<dyn MeshTelemetry>,
        identities: impl IntoIterator<Item = String>,
        mesh_mapping: BTreeMap<String, String>,
        config: FusionConfig,
    ) -> Result<Self, FusionError> {
        config.validate()?;
        let identities: BTreeSet<String> = identities.into_iter().collect();
        Ok(Self {
            mining,
            mesh,
            identities: identities.into_iter().collect(),
            mesh_mapping,
            config,
        })
    }

    /// Active policy.
    #[must_use]
    pub const fn config(&self) -> &FusionConfig {
        &self.config
    }

    async fn bounded<T, F>(&self, target: &str, call: F) -> Result<T, FeedError>
    where
        F: std::future::Future<Output = Result<T, FeedError>>,
    {
        tokio::time::timeout(self.config.fetch_timeout, call)
            .await
            .unwrap_or_else(|_| {
                Err(FeedError::Timeout {
                    target: target.to_string(),
                    elapsed: self.config.fetch_timeout,
                })
            })
    }

    /// Runs one fusion pass. Never fails: unreachable sources degrade the
    /// report instead.
    #[instrument(skip(self), fields(participants = self.identities.len()))]
    pub async fn fuse(&self) -> FusionReport {
        let pool_call = self.bounded("pool statistics", self.mining.fetch_pool_stats());
        let mesh_call = self.bounded("mesh topology", self.mesh.fetch_mesh_topology());
        let participant_calls = join_all(self.identities.iter().map(|identity| async move {
            let telemetry = self
                .bounded(identity, self.mining.fetch_participant(identity))
                .await;
            (identity.clone(), telemetry)
        }));
        let (pool, topology, participants) =
            futures::future::join3(pool_call, mesh_call, participant_calls).await;

        let pool = pool
            .map_err(|err| warn!(error = %err, "pool statistics unavailable"))
            .ok();
        let (topology, mesh_available) = match topology {
            Ok(nodes) => (nodes, true),
            Err(err) => {
                warn!(error = %err, "mesh topology unavailable; ranking everyone as disconnected");
                (Vec::new(), false)
            }
        };
        let nodes: BTreeMap<&str, &NodeInfo> = topology
            .iter()
            .map(|node| (node.node_id.as_str(), node))
            .collect();

        let mut records = Vec::with_capacity(participants.len());
        let mut degraded = Vec::new();
        for (identity, telemetry) in participants {
            match telemetry.map_err(|err| err.to_string()).and_then(|t| {
                let record = self.join(&t, &nodes);
                record.validate().map_err(|err| err.to_string())?;
                Ok(record)
            }) {
                Ok(record) => records.push(record),
                Err(reason) => {
                    warn!(%identity, %reason, "participant omitted from leaderboard");
                    degraded.push(DegradedParticipant { identity, reason });
                }
            }
        }

        let entries = rank(&records, self.config.connectivity_bonus);
        let now = Utc::now();
        let summary = NetworkSummary::compute(&entries, &topology, now);
        debug!(
            ranked = entries.len(),
            degraded = degraded.len(),
            health = %summary.health,
            "leaderboard fused"
        );
        FusionReport {
            generated_at: now,
            pool,
            entries,
            degraded,
            mesh_available,
            summary,
        }
    }

    fn join(&self, telemetry: &ParticipantTelemetry, nodes: &BTreeMap<&str, &NodeInfo>) -> ParticipantRecord {
        let record = ParticipantRecord::new(
            telemetry.identity.clone(),
            telemetry.hash_rate,
            telemetry.amount_due,
        );
        match self
            .mesh_mapping
            .get(&telemetry.identity)
            .and_then(|node_id| nodes.get(node_id.as_str()))
        {
            Some(node) => record.on_node(node),
            None => record,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use xmrt_feeds::{StaticMeshSource, StaticMiningSource};

    fn mapping() -> BTreeMap<String, String> {
        BTreeMap::from([
            ("worker_001".to_string(), "mesh_001".to_string()),
            ("worker_002".to_string(), "mesh_002".to_string()),
        ])
    }

    fn fusion(mining: StaticMiningSource, mesh: StaticMeshSource) -> LeaderboardFusion {
        let identities = mining.identities();
        LeaderboardFusion::new(
            Arc::new(mining),
            Arc::new(mesh),
            identities,
            mapping(),
            FusionConfig::default(),
        )
        .unwrap()
    }

    #[test]
    fn connectivity_mapping() {
        assert_eq!(connectivity_score(Some(-85.0)), 15);
        assert_eq!(connectivity_score(Some(-92.0)), 8);
        assert_eq!(connectivity_score(Some(-120.0)), 0);
        assert_eq!(connectivity_score(Some(12.0)), 100);
        assert_eq!(connectivity_score(Some(f64::NAN)), 0);
        assert_eq!(connectivity_score(None), 0);
    }

    #[test]
    fn ranking_applies_bonus_and_breaks_ties_by_identity() {
        let node = NodeInfo::new("mesh_001", -85.0);
        let records = vec![
            ParticipantRecord::new("zeta", 110.0, 0.0),
            ParticipantRecord::new("alpha", 101.0, 0.0).on_node(&node),
            ParticipantRecord::new("beta", 110.0, 0.0),
        ];
        let entries = rank(&records, 1.10);
        let order: Vec<(&str, usize)> = entries
            .iter()
            .map(|e| (e.identity.as_str(), e.rank))
            .collect();
        assert_eq!(order, vec![("alpha", 1), ("beta", 2), ("zeta", 3)]);
        assert_eq!(entries[0].connectivity_score, 15);
        assert!((entries[1].efficiency_bonus - 1.0).abs() < f64::EPSILON);
        assert_eq!(entries[1].connectivity_score, 0);
    }

    #[test]
    fn ranking_is_independent_of_input_order() {
        let node = NodeInfo::new("mesh_002", -92.0);
        let mut records = vec![
            ParticipantRecord::new("a", 50.0, 0.1),
            ParticipantRecord::new("b", 50.0, 0.2),
            ParticipantRecord::new("c", 45.5, 0.3).on_node(&node),
            ParticipantRecord::new("d", 0.0, 0.0),
            ParticipantRecord::new("a", 20.0, 0.9),
        ];
        let forward = rank(&records, 1.10);
        records.reverse();
        assert_eq!(rank(&records, 1.10), forward);
        let ranks: Vec<usize> = forward.iter().map(|e| e.rank).collect();
        assert_eq!(ranks, vec![1, 2, 3, 4]);
        // c wins on the bonus; the duplicate `a` keeps its stronger record.
        assert_eq!(forward[0].identity, "c");
        assert_eq!(forward[1].identity, "a");
        assert!((forward[1].hash_rate - 50.0).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn simulated_network_fuses() {
        let report = fusion(StaticMiningSource::simulated(), StaticMeshSource::simulated())
            .fuse()
            .await;
        let ids: Vec<&str> = report.entries.iter().map(|e| e.identity.as_str()).collect();
        assert_eq!(ids, vec!["worker_001", "worker_002", "worker_003"]);
        assert_eq!(report.entries[0].connectivity_score, 15);
        assert_eq!(report.entries[1].connectivity_score, 8);
        assert!(!report.entries[2].mesh_connected);
        assert!(!report.is_degraded());
        assert_eq!(report.summary.connected_participants, 2);
        assert_eq!(report.summary.health, MeshHealth::Good);
        assert_eq!(report.summary.online_nodes, 3);
        assert!((report.total_earned() - 0.002_43).abs() < 1e-12);
    }

    #[tokio::test]
    async fn mesh_failure_degrades_to_disconnected() {
        let mesh = StaticMeshSource::simulated();
        mesh.set_failure(Some(FeedError::Transport("radio offline".into())));
        let report = fusion(StaticMiningSource::simulated(), mesh).fuse().await;
        assert!(!report.mesh_available);
        assert_eq!(report.entries.len(), 3);
        for entry in &report.entries {
            assert!(!entry.mesh_connected);
            assert_eq!(entry.connectivity_score, 0);
            assert!((entry.efficiency_bonus - 1.0).abs() < f64::EPSILON);
        }
        assert_eq!(report.summary.health, MeshHealth::Fair);
    }

    #[tokio::test]
    async fn unmapped_node_missing_from_topology_is_disconnected() {
        let mesh = StaticMeshSource::new(vec![NodeInfo::new("mesh_001", -70.0)]);
        let report = fusion(StaticMiningSource::simulated(), mesh).fuse().await;
        let beta = report
            .entries
            .iter()
            .find(|e| e.identity == "worker_002")
            .unwrap();
        assert!(!beta.mesh_connected);
        assert_eq!(beta.mesh_node_id, None);
    }

    #[tokio::test]
    async fn bad_participants_are_omitted_and_listed() {
        let mining = StaticMiningSource::simulated()
            .with_participant(ParticipantTelemetry::new("worker_nan", f64::NAN, 0.0))
            .with_participant(ParticipantTelemetry::new("worker_neg", -1.0, 0.0))
            .with_failure("worker_down", FeedError::Transport("reset".into()));
        let report = fusion(mining, StaticMeshSource::simulated()).fuse().await;
        assert_eq!(report.entries.len(), 3);
        let skipped: Vec<&str> = report.degraded.iter().map(|d| d.identity.as_str()).collect();
        assert_eq!(skipped, vec!["worker_down", "worker_nan", "worker_neg"]);
        assert!(report.is_degraded());
    }

    struct StalledMesh;

    #[async_trait]
    impl MeshTelemetry for StalledMesh {
        async fn fetch_mesh_topology(&self) -> Result<Vec<NodeInfo>, FeedError> {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok(Vec::new())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn stalled_mesh_times_out() {
        let mining = StaticMiningSource::simulated();
        let identities = mining.identities();
        let fusion = LeaderboardFusion::new(
            Arc::new(mining),
            Arc::new(StalledMesh),
            identities,
            mapping(),
            FusionConfig::default(),
        )
        .unwrap();
        let report = fusion.fuse().await;
        assert!(!report.mesh_available);
        assert_eq!(report.entries.len(), 3);
    }

    #[test]
    fn rejects_bonus_below_one() {
        let config = FusionConfig {
            connectivity_bonus: 0.9,
            ..FusionConfig::default()
        };
        assert!(config.validate().is_err());
    }
}
