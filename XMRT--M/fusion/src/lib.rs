#![deny(
    clippy::all,
    clippy::pedantic,
    clippy::nursery,
    rust_2018_idioms,
    missing_docs
)]

//! Leaderboard fusion and treasury allocation.

/// Leaderboard fusion of mining and mesh telemetry.
#[path = "../leaderboard.rs"]
pub mod leaderboard;

/// Revenue split between treasury and operations.
#[path = "../treasury.rs"]
pub mod treasury;

pub use leaderboard::{
    connectivity_score, rank, DegradedParticipant, FusionConfig, FusionError, FusionReport,
    LeaderboardEntry, LeaderboardFusion, MeshHealth, NetworkSummary, ParticipantRecord,
};
pub use treasury::{allocate, AllocationError, AllocationResult, DEFAULT_TREASURY_RATIO};
