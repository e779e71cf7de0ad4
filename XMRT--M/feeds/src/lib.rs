#![deny(
    clippy::all,
    clippy::pedantic,
    clippy::nursery,
    rust_2018_idioms,
    missing_docs
)]

//! Telemetry adapters: mining pool statistics and mesh network topology.

/// Adapter error type.
#[path = "../error.rs"]
pub mod error;

/// Mining pool telemetry.
#[path = "../mining.rs"]
pub mod mining;

/// Mesh topology telemetry.
#[path = "../mesh.rs"]
pub mod mesh;

mod http;

/// Feed configuration and source construction.
#[path = "../feed_config.rs"]
pub mod feed_config;

pub use error::FeedError;
pub use feed_config::{FeedSources, FeedsConfig};
pub use mesh::{MeshApiClient, MeshTelemetry, NodeInfo, Position, StaticMeshSource};
pub use mining::{
    MiningTelemetry, ParticipantTelemetry, PoolApiClient, PoolSnapshot, StaticMiningSource,
    ATOMIC_UNITS_PER_COIN,
};
