use std::{collections::BTreeMap, time::Duration};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

use crate::{error::FeedError, http};

/// Atomic units per whole coin on the pool API.
pub const ATOMIC_UNITS_PER_COIN: f64 = 1e12;

/// Pool-wide statistics at fetch time.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PoolSnapshot {
    /// Pool hash rate in H/s.
    pub hash_rate: f64,
    /// Connected miners.
    pub miners: u64,
    /// Hashes submitted since pool start.
    pub total_hashes: u64,
    /// Blocks found by the pool.
    pub blocks_found: u64,
    /// When the last block was found.
    pub last_block_found_at: Option<DateTime<Utc>>,
    /// Miners that have received a payout.
    pub total_miners_paid: u64,
    /// Payout transactions sent.
    pub total_payments: u64,
    /// Hashes in the current round.
    pub round_hashes: u64,
    /// Local fetch time.
    pub fetched_at: DateTime<Utc>,
}

/// Mining statistics for one participant.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ParticipantTelemetry {
    /// Wallet address or worker identity.
    pub identity: String,
    /// Current hash rate in H/s.
    pub hash_rate: f64,
    /// Hashes submitted overall.
    pub total_hashes: u64,
    /// Accepted shares.
    pub valid_shares: u64,
    /// Rejected shares.
    pub invalid_shares: u64,
    /// Pending balance in coins.
    pub amount_due: f64,
    /// Paid out so far, in coins.
    pub amount_paid: f64,
    /// Payout transactions received.
    pub transaction_count: u64,
    /// Last submitted hash.
    pub last_hash_at: Option<DateTime<Utc>>,
}

impl ParticipantTelemetry {
    /// Default window after which a silent miner counts as offline.
    pub const ACTIVE_WINDOW: Duration = Duration::from_secs(30 * 60);

    /// Builds a record from the simplified fields used by static sources.
    #[must_use]
    pub fn new(identity: impl Into<String>, hash_rate: f64, amount_due: f64) -> Self {
        Self {
            identity: identity.into(),
            hash_rate,
            total_hashes: 0,
            valid_shares: 0,
            invalid_shares: 0,
            amount_due,
            amount_paid: 0.0,
            transaction_count: 0,
            last_hash_at: None,
        }
    }

    /// Whether a hash was submitted within `window` of `now`.
    #[must_use]
    pub fn is_active(&self, now: DateTime<Utc>, window: Duration) -> bool {
        self.last_hash_at.is_some_and(|last| {
            (now - last)
                .to_std()
                .map_or(true, |silent| silent <= window)
        })
    }

    /// Share of submitted shares that were accepted, in `[0, 1]`.
    #[must_use]
    pub fn share_efficiency(&self) -> Option<f64> {
        let total = self.valid_shares.checked_add(self.invalid_shares)?;
        (total > 0).then(|| ratio(self.valid_shares, total))
    }
}

/// Read access to mining pool statistics.
#[async_trait]
pub trait MiningTelemetry: Send + Sync {
    /// Pool-wide statistics.
    async fn fetch_pool_stats(&self) -> Result<PoolSnapshot, FeedError>;

    /// Statistics for one participant.
    async fn fetch_participant(&self, identity: &str) -> Result<ParticipantTelemetry, FeedError>;
}

#[derive(Debug, Deserialize)]
struct PoolStatsResponse {
    pool_statistics: PoolStatisticsWire,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct PoolStatisticsWire {
    hash_rate: f64,
    miners: u64,
    total_hashes: u64,
    total_blocks_found: u64,
    last_block_found_time: i64,
    total_miners_paid: u64,
    total_payments: u64,
    round_hashes: u64,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct MinerStatsWire {
    hash: f64,
    total_hashes: u64,
    valid_shares: u64,
    invalid_shares: u64,
    last_hash: i64,
    amt_due: u64,
    amt_paid: u64,
    txn_count: u64,
}

impl PoolStatisticsWire {
    fn into_snapshot(self, fetched_at: DateTime<Utc>) -> PoolSnapshot {
        PoolSnapshot {
            hash_rate: self.hash_rate,
            miners: self.miners,
            total_hashes: self.total_hashes,
            blocks_found: self.total_blocks_found,
            last_block_found_at: from_unix(self.last_block_found_time),
            total_miners_paid: self.total_miners_paid,
            total_payments: self.total_payments,
            round_hashes: self.round_hashes,
            fetched_at,
        }
    }
}

impl MinerStatsWire {
    fn into_telemetry(self, identity: &str) -> ParticipantTelemetry {
        ParticipantTelemetry {
            identity: identity.to_string(),
            hash_rate: self.hash,
            total_hashes: self.total_hashes,
            valid_shares: self.valid_shares,
            invalid_shares: self.invalid_shares,
            amount_due: atomic_to_coin(self.amt_due),
            amount_paid: atomic_to_coin(self.amt_paid),
            transaction_count: self.txn_count,
            last_hash_at: from_unix(self.last_hash),
        }
    }
}

/// Converts atomic pool units into whole coins.
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn atomic_to_coin(atomic: u64) -> f64 {
    atomic as f64 / ATOMIC_UNITS_PER_COIN
}

#[allow(clippy::cast_precision_loss)]
fn ratio(part: u64, whole: u64) -> f64 {
    part as f64 / whole as f64
}

fn from_unix(seconds: i64) -> Option<DateTime<Utc>> {
    (seconds > 0)
        .then(|| DateTime::from_timestamp(seconds, 0))
        .flatten()
}

/// HTTP client for a SupportXMR-style pool API.
#[derive(Debug, Clone)]
pub struct PoolApiClient {
    client: Client,
    base_url: String,
    timeout: Duration,
}

impl PoolApiClient {
    /// Creates a client for `base_url` (e.g. `https://supportxmr.com/api`).
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, FeedError> {
        Ok(Self {
            client: http::build_client()?,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            timeout,
        })
    }

    /// Base URL without a trailing slash.
    #[must_use]
    pub fn base_url(&self) -> &str {
        &self.base_url
    }
}

#[async_trait]
impl MiningTelemetry for PoolApiClient {
    #[instrument(skip(self), fields(base = %self.base_url))]
    async fn fetch_pool_stats(&self) -> Result<PoolSnapshot, FeedError> {
        let url = format!("{}/pool/stats", self.base_url);
        let response: PoolStatsResponse =
            http::fetch_json(&self.client, "pool statistics", &url, self.timeout).await?;
        debug!("pool statistics fetched");
        Ok(response.pool_statistics.into_snapshot(Utc::now()))
    }

    #[instrument(skip(self), fields(base = %self.base_url))]
    async fn fetch_participant(&self, identity: &str) -> Result<ParticipantTelemetry, FeedError> {
        if identity.is_empty() || identity.contains('/') {
            return Err(FeedError::NotFound(format!("participant {identity:?}")));
        }
        let url = format!("{}/miner/{identity}/stats", self.base_url);
        let target = format!("participant {identity}");
        let wire: MinerStatsWire =
            http::fetch_json(&self.client, &target, &url, self.timeout).await?;
        Ok(wire.into_telemetry(identity))
    }
}

/// In-process mining source for simulation and tests.
#[derive(Debug, Default)]
pub struct StaticMiningSource {
    pool: RwLock<Option<PoolSnapshot>>,
    participants: RwLock<BTreeMap<String, Result<ParticipantTelemetry, FeedError>>>,
}

impl StaticMiningSource {
    /// Creates an empty source. Pool statistics report `NotFound` until set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Source seeded with three simulated workers.
    #[must_use]
    pub fn simulated() -> Self {
        let now = Utc::now();
        let source = Self::new().with_pool(PoolSnapshot {
            hash_rate: 284.5,
            miners: 3,
            total_hashes: 0,
            blocks_found: 0,
            last_block_found_at: None,
            total_miners_paid: 0,
            total_payments: 0,
            round_hashes: 0,
            fetched_at: now,
        });
        for (identity, hash_rate, due) in [
            ("worker_001", 150.0, 0.001_24),
            ("worker_002", 89.3, 0.000_87),
            ("worker_003", 45.2, 0.000_32),
        ] {
            let mut telemetry = ParticipantTelemetry::new(identity, hash_rate, due);
            telemetry.last_hash_at = Some(now);
            source.upsert_participant(telemetry);
        }
        source
    }

    /// Sets the pool snapshot.
    #[must_use]
    pub fn with_pool(self, snapshot: PoolSnapshot) -> Self {
        *self.pool.write() = Some(snapshot);
        self
    }

    /// Adds a participant.
    #[must_use]
    pub fn with_participant(self, telemetry: ParticipantTelemetry) -> Self {
        self.upsert_participant(telemetry);
        self
    }

    /// Makes every fetch for `identity` fail with `error`.
    #[must_use]
    pub fn with_failure(self, identity: impl Into<String>, error: FeedError) -> Self {
        self.participants.write().insert(identity.into(), Err(error));
        self
    }

    /// Inserts or replaces a participant at runtime.
    pub fn upsert_participant(&self, telemetry: ParticipantTelemetry) {
        self.participants
            .write()
            .insert(telemetry.identity.clone(), Ok(telemetry));
    }

    /// Known identities, sorted.
    #[must_use]
    pub fn identities(&self) -> Vec<String> {
        self.participants.read().keys().cloned().collect()
    }
}

#[async_trait]
impl MiningTelemetry for StaticMiningSource {
    async fn fetch_pool_stats(&self) -> Result<PoolSnapshot, FeedError> {
        self.pool
            .read()
            .clone()
            .map(|mut snapshot| {
                snapshot.fetched_at = Utc::now();
                snapshot
            })
            .ok_or_else(|| FeedError::NotFound("pool statistics".into()))
    }

    async fn fetch_participant(&self, identity: &str) -> Result<ParticipantTelemetry, FeedError> {
        self.participants
            .read()
            .get(identity)
            .cloned()
            .unwrap_or_else(|| Err(FeedError::NotFound(format!("participant {identity}"))))
    }
}
