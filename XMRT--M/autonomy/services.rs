//! Leaderboard, treasury, and memory operations shared by every component.

use std::{fmt, future::Future, sync::Arc, time::Duration};

use parking_lot::RwLock;
use serde_json::{json, Value};
use shared_logging::LogLevel;
use tracing::{instrument, warn};
use xmrt_fusion::{allocate, AllocationResult, FusionReport, LeaderboardFusion};
use xmrt_memory_data::{get_json, put_json, MemoryService, StoreError};

use crate::{module::AutonomyError, telemetry::AutonomyTelemetry};

/// Store key of the most recent leaderboard.
pub const LEADERBOARD_KEY: &str = "leaderboard/latest";
/// Store key of the most recent allocation.
pub const ALLOCATION_KEY: &str = "treasury/latest";

pub(crate) async fn bounded<T, F>(timeout: Duration, what: &str, call: F) -> Result<T, AutonomyError>
where
    F: Future<Output = Result<T, StoreError>>,
{
    match tokio::time::timeout(timeout, call).await {
        Ok(result) => result.map_err(AutonomyError::from),
        Err(_) => Err(AutonomyError::Timeout(format!("{what} exceeded {timeout:?}"))),
    }
}

/// Leaderboard, treasury, and memory operations shared by every component.
#[derive(Clone)]
pub struct CoordinatorServices {
    fusion: LeaderboardFusion,
    memory: MemoryService,
    treasury_ratio: f64,
    call_timeout: Duration,
    latest_leaderboard: Arc<RwLock<Option<FusionReport>>>,
    latest_allocation: Arc<RwLock<Option<AllocationResult>>>,
    telemetry: Option<AutonomyTelemetry>,
}

impl fmt::Debug for CoordinatorServices {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CoordinatorServices")
            .field("fusion", &self.fusion)
            .field("treasury_ratio", &self.treasury_ratio)
            .field("call_timeout", &self.call_timeout)
            .finish_non_exhaustive()
    }
}

impl CoordinatorServices {
    /// Creates the services. Rejects a ratio outside `[0, 1]`.
    pub fn new(
        fusion: LeaderboardFusion,
        memory: MemoryService,
        treasury_ratio: f64,
        call_timeout: Duration,
    ) -> Result<Self, AutonomyError> {
        if !(0.0..=1.0).contains(&treasury_ratio) {
            return Err(AutonomyError::InvalidInput(format!(
                "treasury ratio must lie in [0, 1], got {treasury_ratio}"
            )));
        }
        Ok(Self {
            fusion,
            memory,
            treasury_ratio,
            call_timeout,
            latest_leaderboard: Arc::new(RwLock::new(None)),
            latest_allocation: Arc::new(RwLock::new(None)),
            telemetry: None,
        })
    }

    /// Attaches telemetry sinks.
    #[must_use]
    pub fn with_telemetry(mut self, telemetry: AutonomyTelemetry) -> Self {
        self.telemetry = Some(telemetry);
        self
    }

    /// Memory service backing outcome memories.
    #[must_use]
    pub const fn memory(&self) -> &MemoryService {
        &self.memory
    }

    /// Per-call budget.
    #[must_use]
    pub const fn call_timeout(&self) -> Duration {
        self.call_timeout
    }

    async fn publish(&self, event_type: &str, payload: Value) {
        if let Some(tel) = &self.telemetry {
            if let Err(err) = tel.log(LogLevel::Info, event_type, payload.clone()) {
                warn!(error = %err, event = event_type, "audit log write failed");
            }
            if let Err(err) = tel.event(event_type, payload).await {
                warn!(error = %err, event = event_type, "event not published");
            }
        }
    }

    /// Runs fusion and publishes the result. Persisting is best effort.
    #[instrument(skip(self))]
    pub async fn refresh_leaderboard(&self) -> FusionReport {
        let report = self.fusion.fuse().await;
        *self.latest_leaderboard.write() = Some(report.clone());
        let store = self.memory.store();
        if let Err(err) = bounded(
            self.call_timeout,
            "leaderboard persist",
            put_json(store.as_ref(), LEADERBOARD_KEY, &report, None),
        )
        .await
        {
            warn!(error = %err, "leaderboard not persisted");
        }
        self.publish(
            "fusion.leaderboard.refreshed",
            json!({
                "participants": report.entries.len(),
                "degraded": report.is_degraded(),
                "total_hash_rate": report.summary.total_hash_rate,
            }),
        )
        .await;
        report
    }

    /// Splits the revenue on the latest leaderboard, refreshing it first
    /// when none is available.
    #[instrument(skip(self))]
    pub async fn allocate_treasury(&self) -> Result<AllocationResult, AutonomyError> {
        let report = match self.latest_leaderboard().await {
            Some(report) => report,
            None => self.refresh_leaderboard().await,
        };
        let result = allocate(report.total_earned(), self.treasury_ratio)?;
        *self.latest_allocation.write() = Some(result);
        let store = self.memory.store();
        if let Err(err) = bounded(
            self.call_timeout,
            "allocation persist",
            put_json(store.as_ref(), ALLOCATION_KEY, &result, None),
        )
        .await
        {
            warn!(error = %err, "allocation not persisted");
        }
        self.publish(
            "treasury.allocation.computed",
            json!({
                "total": result.total,
                "treasury_share": result.treasury_share,
                "operations_share": result.operations_share,
                "treasury_ratio": result.treasury_ratio,
            }),
        )
        .await;
        Ok(result)
    }

    /// Drops expired memories, returning how many were removed.
    pub async fn consolidate_memory(&self) -> Result<usize, AutonomyError> {
        bounded(self.call_timeout, "memory sweep", self.memory.sweep()).await
    }

    /// Latest leaderboard from this process, else from the store.
    pub async fn latest_leaderboard(&self) -> Option<FusionReport> {
        let cached = self.latest_leaderboard.read().clone();
        if cached.is_some() {
            return cached;
        }
        let store = self.memory.store();
        let stored: FusionReport = bounded(
            self.call_timeout,
            "leaderboard load",
            get_json(store.as_ref(), LEADERBOARD_KEY),
        )
        .await
        .ok()?;
        *self.latest_leaderboard.write() = Some(stored.clone());
        Some(stored)
    }

    /// Latest allocation from this process, else from the store. A stored
    /// result that fails verification is ignored.
    pub async fn latest_allocation(&self) -> Option<AllocationResult> {
        let cached = *self.latest_allocation.read();
        if cached.is_some() {
            return cached;
        }
        let store = self.memory.store();
        let stored: AllocationResult = bounded(
            self.call_timeout,
            "allocation load",
            get_json(store.as_ref(), ALLOCATION_KEY),
        )
        .await
        .ok()?;
        if let Err(err) = stored.verify() {
            warn!(error = %err, "ignoring stored allocation");
            return None;
        }
        *self.latest_allocation.write() = Some(stored);
        Some(stored)
    }
}
