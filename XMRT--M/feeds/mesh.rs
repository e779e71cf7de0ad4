use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

use crate::{error::FeedError, http};

/// Geographic position reported by a mesh node.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct Position {
    /// Latitude in degrees.
    pub lat: f64,
    /// Longitude in degrees.
    pub lon: f64,
}

/// A node visible in the mesh topology.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NodeInfo {
    /// Stable node identifier.
    pub node_id: String,
    /// Operator handle.
    #[serde(default)]
    pub user_id: String,
    /// Short display name.
    #[serde(default)]
    pub short_name: String,
    /// Long display name.
    #[serde(default)]
    pub long_name: String,
    /// Radio hardware model.
    #[serde(default)]
    pub hardware_model: String,
    /// Received signal strength in dBm.
    #[serde(alias = "rssi")]
    pub signal_strength_dbm: f64,
    /// Signal-to-noise ratio in dB.
    #[serde(default)]
    pub snr: Option<f64>,
    /// Last time the node was heard.
    #[serde(default = "Utc::now")]
    pub last_seen: DateTime<Utc>,
    /// Reported position.
    #[serde(default)]
    pub position: Option<Position>,
}

impl NodeInfo {
    /// Default liveness window.
    pub const ONLINE_WINDOW: Duration = Duration::from_secs(300);

    /// Node heard just now with the given signal strength.
    #[must_use]
    pub fn new(node_id: impl Into<String>, signal_strength_dbm: f64) -> Self {
        let node_id = node_id.into();
        Self {
            user_id: String::new(),
            short_name: node_id.clone(),
            long_name: node_id.clone(),
            node_id,
            hardware_model: String::new(),
            signal_strength_dbm,
            snr: None,
            last_seen: Utc::now(),
            position: None,
        }
    }

    /// Whether the node was heard within `window` of `now`.
    #[must_use]
    pub fn is_online(&self, now: DateTime<Utc>, window: Duration) -> bool {
        (now - self.last_seen)
            .to_std()
            .map_or(true, |silent| silent < window)
    }
}

/// Read access to the mesh network topology.
#[async_trait]
pub trait MeshTelemetry: Send + Sync {
    /// Every node currently known to the mesh.
    async fn fetch_mesh_topology(&self) -> Result<Vec<NodeInfo>, FeedError>;
}

/// HTTP topology provider returning a JSON array of nodes.
#[derive(Debug, Clone)]
pub struct MeshApiClient {
    client: Client,
    url: String,
    timeout: Duration,
}

impl MeshApiClient {
    /// Creates a client for `url`.
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self, FeedError> {
        Ok(Self {
            client: http::build_client()?,
            url: url.into(),
            timeout,
        })
    }
}

#[async_trait]
impl MeshTelemetry for MeshApiClient {
    #[instrument(skip(self), fields(url = %self.url))]
    async fn fetch_mesh_topology(&self) -> Result<Vec<NodeInfo>, FeedError> {
        let nodes: Vec<NodeInfo> =
            http::fetch_json(&self.client, "mesh topology", &self.url, self.timeout).await?;
        debug!(nodes = nodes.len(), "mesh topology fetched");
        Ok(nodes)
    }
}

/// In-process topology for simulation and tests.
#[derive(Debug, Default)]
pub struct StaticMeshSource {
    nodes: RwLock<Vec<NodeInfo>>,
    failure: RwLock<Option<FeedError>>,
    refresh_last_seen: bool,
}

impl StaticMeshSource {
    /// Source serving `nodes` as given.
    #[must_use]
    pub fn new(nodes: Vec<NodeInfo>) -> Self {
        Self {
            nodes: RwLock::new(nodes),
            ..Self::default()
        }
    }

    /// Three-node simulated mesh whose nodes are always freshly heard.
    #[must_use]
    pub fn simulated() -> Self {
        let node = |id: &str, user: &str, short: &str, role: &str, hw: &str, dbm, snr, lat, lon| {
            NodeInfo {
                node_id: id.into(),
                user_id: user.into(),
                short_name: short.into(),
                long_name: format!("{short} {role} Node"),
                hardware_model: hw.into(),
                signal_strength_dbm: dbm,
                snr: Some(snr),
                last_seen: Utc::now(),
                position: Some(Position { lat, lon }),
            }
        };
        Self {
            nodes: RwLock::new(vec![
                node("mesh_001", "miner_alpha", "ALPHA", "Mining", "HELTEC_V3", -85.0, 12.5, 10.0, -84.0),
                node("mesh_002", "miner_beta", "BETA", "Mining", "TBEAM", -92.0, 8.2, 10.1, -84.1),
                node("mesh_003", "relay_gamma", "GAMMA", "Relay", "HELTEC_V2", -78.0, 15.1, 10.05, -84.05),
            ]),
            failure: RwLock::new(None),
            refresh_last_seen: true,
        }
    }

    /// Replaces the topology.
    pub fn set_nodes(&self, nodes: Vec<NodeInfo>) {
        *self.nodes.write() = nodes;
    }

    /// Makes subsequent fetches fail with `error`; `None` restores service.
    pub fn set_failure(&self, error: Option<FeedError>) {
        *self.failure.write() = error;
    }
}

#[async_trait]
impl MeshTelemetry for StaticMeshSource {
    async fn fetch_mesh_topology(&self) -> Result<Vec<NodeInfo>, FeedError> {
        if let Some(err) = self.failure.read().clone() {
            return Err(err);
        }
        let mut nodes = self.nodes.read().clone();
        if self.refresh_last_seen {
            let now = Utc::now();
            nodes.iter_mut().for_each(|node| node.last_seen = now);
        }
        Ok(nodes)
    }
}
