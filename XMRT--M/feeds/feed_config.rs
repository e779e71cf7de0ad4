use std::{collections::BTreeMap, fmt, sync::Arc, time::Duration};

use anyhow::{bail, Context, Result};
use serde::Deserialize;

use crate::{
    mesh::{MeshApiClient, MeshTelemetry, StaticMeshSource},
    mining::{MiningTelemetry, PoolApiClient, StaticMiningSource},
};

/// `[feeds]` section of the coordinator configuration.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct FeedsConfig {
    /// Serve simulated telemetry instead of calling upstreams.
    #[serde(default)]
    pub simulate: bool,
    /// Pool API base URL.
    #[serde(default = "default_pool_base_url")]
    pub pool_base_url: String,
    /// Mesh topology endpoint. Without it the mesh is reported empty.
    #[serde(default)]
    pub mesh_url: Option<String>,
    /// Participant identities tracked on the leaderboard.
    #[serde(default)]
    pub identities: Vec<String>,
    /// Per-call timeout in milliseconds.
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    /// Participant identity to mesh node id.
    #[serde(default)]
    pub mesh_mapping: BTreeMap<String, String>,
}

impl Default for FeedsConfig {
    fn default() -> Self {
        Self {
            simulate: false,
            pool_base_url: default_pool_base_url(),
            mesh_url: None,
            identities: Vec::new(),
            timeout_ms: default_timeout_ms(),
            mesh_mapping: BTreeMap::new(),
        }
    }
}

/// Telemetry sources resolved from a [`FeedsConfig`].
#[derive(Clone)]
pub struct FeedSources {
    /// Mining statistics source.
    pub mining: Arc<dyn MiningTelemetry>,
    /// Mesh topology source.
    pub mesh: Arc<dyn MeshTelemetry>,
    /// Identities to fetch each refresh.
    pub identities: Vec<String>,
    /// Identity to mesh node id.
    pub mesh_mapping: BTreeMap<String, String>,
}

impl fmt::Debug for FeedSources {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FeedSources")
            .field("identities", &self.identities)
            .field("mesh_mapping", &self.mesh_mapping)
            .finish_non_exhaustive()
    }
}

impl FeedsConfig {
    /// Simulation defaults: three workers, two of them on the mesh.
    #[must_use]
    pub fn simulated() -> Self {
        Self {
            simulate: true,
            identities: vec!["worker_001".into(), "worker_002".into(), "worker_003".into()],
            mesh_mapping: BTreeMap::from([
                ("worker_001".to_string(), "mesh_001".to_string()),
                ("worker_002".to_string(), "mesh_002".to_string()),
            ]),
            ..Self::default()
        }
    }

    /// Per-call timeout.
    #[must_use]
    pub const fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// Checks ranges and mapping consistency.
    pub fn validate(&self) -> Result<()> {
        if self.timeout_ms == 0 {
            bail!("feeds.timeout_ms must be positive");
        }
        if !self.simulate && self.pool_base_url.trim().is_empty() {
            bail!("feeds.pool_base_url is required unless simulate = true");
        }
        if let Some(empty) = self.identities.iter().find(|id| id.trim().is_empty()) {
            bail!("feeds.identities contains a blank identity {empty:?}");
        }
        for (identity, node) in &self.mesh_mapping {
            if node.trim().is_empty() {
                bail!("feeds.mesh_mapping.{identity} maps to a blank node id");
            }
        }
        Ok(())
    }

    /// Builds the configured sources.
    pub fn build_sources(&self) -> Result<FeedSources> {
        self.validate()?;
        let (mining, mesh): (Arc<dyn MiningTelemetry>, Arc<dyn MeshTelemetry>) = if self.simulate {
            (
                Arc::new(StaticMiningSource::simulated()),
                Arc::new(StaticMeshSource::simulated()),
            )
        } else {
            let mining = PoolApiClient::new(&self.pool_base_url, self.timeout())
                .with_context(|| format!("pool client for {}", self.pool_base_url))?;
            let mesh: Arc<dyn MeshTelemetry> = match &self.mesh_url {
                Some(url) => Arc::new(
                    MeshApiClient::new(url, self.timeout())
                        .with_context(|| format!("mesh client for {url}"))?,
                ),
                None => Arc::new(StaticMeshSource::default()),
            };
            (Arc::new(mining), mesh)
        };
        Ok(FeedSources {
            mining,
            mesh,
            identities: self.identities.clone(),
            mesh_mapping: self.mesh_mapping.clone(),
        })
    }
}

fn default_pool_base_url() -> String {
    "https://supportxmr.com/api".into()
}

const fn default_timeout_ms() -> u64 {
    5_000
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_with_defaults() {
        let config: FeedsConfig = toml::from_str(
            r#"
            identities = ["worker_001"]
            [mesh_mapping]
            worker_001 = "mesh_001"
            "#,
        )
        .unwrap();
        assert_eq!(config.timeout(), Duration::from_secs(5));
        assert_eq!(config.pool_base_url, "https://supportxmr.com/api");
        assert_eq!(config.mesh_mapping["worker_001"], "mesh_001");
        config.validate().unwrap();
    }

    #[test]
    fn rejects_zero_timeout_and_blank_nodes() {
        let mut config = FeedsConfig::simulated();
        config.timeout_ms = 0;
        assert!(config.validate().is_err());

        let mut config = FeedsConfig::simulated();
        config.mesh_mapping.insert("worker_003".into(), " ".into());
        assert!(config.validate().is_err());
    }

    #[tokio::test]
    async fn simulated_sources_serve_mapped_workers() {
        let sources = FeedsConfig::simulated().build_sources().unwrap();
        assert_eq!(sources.identities.len(), 3);
        let topology = sources.mesh.fetch_mesh_topology().await.unwrap();
        assert!(topology.iter().any(|node| node.node_id == "mesh_001"));
        let worker = sources.mining.fetch_participant("worker_003").await.unwrap();
        assert!((worker.hash_rate - 45.2).abs() < f64::EPSILON);
    }

    #[test]
    fn live_sources_build_without_network() {
        let config = FeedsConfig {
            mesh_url: Some("http://127.0.0.1:9/mesh".into()),
            ..FeedsConfig::default()
        };
        let sources = config.build_sources().unwrap();
        assert!(sources.identities.is_empty());
    }
}
