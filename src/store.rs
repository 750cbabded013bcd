// =============================================================================
// Storage interfaces — bets, races, strategies, performance rollups
// =============================================================================
//
// The engine only ever touches persistence through these traits. The in-memory
// implementations below back paper mode and the test suite; production
// deployments plug a database-backed implementation in behind the same
// interfaces.
//
// Thread-safety of the memory stores: all mutable state is behind
// `parking_lot::RwLock`, and no lock is held across an await point.
// =============================================================================

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::types::{Bet, OddsTick, Race, RaceResult, Runner, StrategyRecord};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Storage failure surfaced to callers. The executor treats any `create`
/// failure as a persistence error and never contacts the exchange for that
/// bet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// Insert violated the primary key.
    DuplicateKey(String),
    /// Lookup target does not exist.
    NotFound(String),
    /// Backend failure (connection, I/O, serialization).
    Backend(String),
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::DuplicateKey(id) => write!(f, "duplicate key: {id}"),
            Self::NotFound(id) => write!(f, "not found: {id}"),
            Self::Backend(msg) => write!(f, "storage backend error: {msg}"),
        }
    }
}

impl std::error::Error for StoreError {}

pub type StoreResult<T> = Result<T, StoreError>;

// ---------------------------------------------------------------------------
// Traits
// ---------------------------------------------------------------------------

/// Bet persistence. Called by the executor, the order poller and the monitor.
#[async_trait]
pub trait BetStore: Send + Sync {
    /// Atomic insert with a unique primary key.
    async fn create(&self, bet: &Bet) -> StoreResult<()>;

    /// Full-record update keyed by `bet.id`.
    async fn update(&self, bet: &Bet) -> StoreResult<()>;

    async fn get(&self, id: &str) -> StoreResult<Bet>;

    async fn get_by_exchange_id(&self, exchange_bet_id: &str) -> StoreResult<Bet>;

    /// Bets with `settled_at` strictly after `watermark`, chronologically
    /// ordered by `settled_at`.
    async fn get_settled_since(&self, watermark: DateTime<Utc>) -> StoreResult<Vec<Bet>>;

    /// All bets not yet in a terminal state, for polling and reconciliation.
    async fn get_non_terminal(&self) -> StoreResult<Vec<Bet>>;
}

/// Race, runner and odds queries. Implementations must return odds carrying a
/// capture timestamp so the orchestrator can exclude lookahead.
#[async_trait]
pub trait RaceStore: Send + Sync {
    /// Races scheduled to start within `[from, to]`.
    async fn upcoming(&self, from: DateTime<Utc>, to: DateTime<Utc>) -> StoreResult<Vec<Race>>;

    async fn race(&self, race_id: &str) -> StoreResult<Option<Race>>;

    async fn runners(&self, race_id: &str) -> StoreResult<Vec<Runner>>;

    /// Latest odds tick per runner for the race.
    async fn odds(&self, race_id: &str) -> StoreResult<Vec<OddsTick>>;

    /// Final result, once the race has finished.
    async fn result(&self, race_id: &str) -> StoreResult<Option<RaceResult>>;
}

/// Strategy registrations, read at the start of each tick.
#[async_trait]
pub trait StrategyStore: Send + Sync {
    async fn active(&self) -> StoreResult<Vec<StrategyRecord>>;
}

/// Per-strategy rolled-up performance metrics.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StrategyPerformance {
    pub strategy_id: String,
    pub total_bets: u64,
    pub wins: u64,
    pub losses: u64,
    pub win_rate: f64,
    /// Realized P&L divided by total stake.
    pub roi: f64,
    pub total_staked: f64,
    pub total_pnl: f64,
    pub largest_win: f64,
    pub largest_loss: f64,
    /// Positive = consecutive wins, negative = consecutive losses.
    pub current_streak: i32,
    pub updated_at: DateTime<Utc>,
}

#[async_trait]
pub trait PerformanceStore: Send + Sync {
    async fn upsert(&self, perf: &StrategyPerformance) -> StoreResult<()>;

    async fn get(&self, strategy_id: &str) -> StoreResult<Option<StrategyPerformance>>;
}

// =============================================================================
// In-memory implementations
// =============================================================================

/// In-memory bet store keyed by bet id.
#[derive(Default)]
pub struct MemoryBetStore {
    bets: RwLock<HashMap<String, Bet>>,
}

impl MemoryBetStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of every bet, for diagnostics and tests.
    pub fn all(&self) -> Vec<Bet> {
        self.bets.read().values().cloned().collect()
    }
}

#[async_trait]
impl BetStore for MemoryBetStore {
    async fn create(&self, bet: &Bet) -> StoreResult<()> {
        let mut bets = self.bets.write();
        if bets.contains_key(&bet.id) {
            return Err(StoreError::DuplicateKey(bet.id.clone()));
        }
        bets.insert(bet.id.clone(), bet.clone());
        Ok(())
    }

    async fn update(&self, bet: &Bet) -> StoreResult<()> {
        let mut bets = self.bets.write();
        match bets.get_mut(&bet.id) {
            Some(existing) => {
                *existing = bet.clone();
                Ok(())
            }
            None => Err(StoreError::NotFound(bet.id.clone())),
        }
    }

    async fn get(&self, id: &str) -> StoreResult<Bet> {
        self.bets
            .read()
            .get(id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(id.to_string()))
    }

    async fn get_by_exchange_id(&self, exchange_bet_id: &str) -> StoreResult<Bet> {
        self.bets
            .read()
            .values()
            .find(|b| b.exchange_bet_id.as_deref() == Some(exchange_bet_id))
            .cloned()
            .ok_or_else(|| StoreError::NotFound(exchange_bet_id.to_string()))
    }

    async fn get_settled_since(&self, watermark: DateTime<Utc>) -> StoreResult<Vec<Bet>> {
        let mut settled: Vec<Bet> = self
            .bets
            .read()
            .values()
            .filter(|b| b.settled_at.map(|t| t > watermark).unwrap_or(false))
            .cloned()
            .collect();
        settled.sort_by_key(|b| b.settled_at);
        Ok(settled)
    }

    async fn get_non_terminal(&self) -> StoreResult<Vec<Bet>> {
        let mut open: Vec<Bet> = self
            .bets
            .read()
            .values()
            .filter(|b| !b.status.is_terminal())
            .cloned()
            .collect();
        open.sort_by_key(|b| b.placed_at);
        Ok(open)
    }
}

/// In-memory race store fed by tests or an external ingestion adapter.
#[derive(Default)]
pub struct MemoryRaceStore {
    races: RwLock<HashMap<String, Race>>,
    runners: RwLock<HashMap<String, Vec<Runner>>>,
    odds: RwLock<HashMap<String, Vec<OddsTick>>>,
    results: RwLock<HashMap<String, RaceResult>>,
}

impl MemoryRaceStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_race(&self, race: Race, runners: Vec<Runner>, odds: Vec<OddsTick>) {
        self.runners.write().insert(race.id.clone(), runners);
        self.odds.write().insert(race.id.clone(), odds);
        self.races.write().insert(race.id.clone(), race);
    }

    pub fn set_status(&self, race_id: &str, status: crate::types::RaceStatus) {
        if let Some(race) = self.races.write().get_mut(race_id) {
            race.status = status;
        }
    }

    pub fn insert_result(&self, result: RaceResult) {
        if let Some(race) = self.races.write().get_mut(&result.race_id) {
            race.status = crate::types::RaceStatus::Finished;
        }
        self.results.write().insert(result.race_id.clone(), result);
    }
}

#[async_trait]
impl RaceStore for MemoryRaceStore {
    async fn upcoming(&self, from: DateTime<Utc>, to: DateTime<Utc>) -> StoreResult<Vec<Race>> {
        let mut races: Vec<Race> = self
            .races
            .read()
            .values()
            .filter(|r| {
                r.status == crate::types::RaceStatus::Scheduled
                    && r.scheduled_start >= from
                    && r.scheduled_start <= to
            })
            .cloned()
            .collect();
        races.sort_by_key(|r| r.scheduled_start);
        Ok(races)
    }

    async fn race(&self, race_id: &str) -> StoreResult<Option<Race>> {
        Ok(self.races.read().get(race_id).cloned())
    }

    async fn runners(&self, race_id: &str) -> StoreResult<Vec<Runner>> {
        Ok(self.runners.read().get(race_id).cloned().unwrap_or_default())
    }

    async fn odds(&self, race_id: &str) -> StoreResult<Vec<OddsTick>> {
        Ok(self.odds.read().get(race_id).cloned().unwrap_or_default())
    }

    async fn result(&self, race_id: &str) -> StoreResult<Option<RaceResult>> {
        Ok(self.results.read().get(race_id).cloned())
    }
}

/// In-memory strategy registry.
#[derive(Default)]
pub struct MemoryStrategyStore {
    records: RwLock<Vec<StrategyRecord>>,
}

impl MemoryStrategyStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn upsert(&self, record: StrategyRecord) {
        let mut records = self.records.write();
        match records.iter_mut().find(|r| r.id == record.id) {
            Some(existing) => *existing = record,
            None => records.push(record),
        }
    }
}

#[async_trait]
impl StrategyStore for MemoryStrategyStore {
    async fn active(&self) -> StoreResult<Vec<StrategyRecord>> {
        Ok(self
            .records
            .read()
            .iter()
            .filter(|r| r.active)
            .cloned()
            .collect())
    }
}

/// In-memory performance rollup store.
#[derive(Default)]
pub struct MemoryPerformanceStore {
    rollups: RwLock<HashMap<String, StrategyPerformance>>,
}

impl MemoryPerformanceStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl PerformanceStore for MemoryPerformanceStore {
    async fn upsert(&self, perf: &StrategyPerformance) -> StoreResult<()> {
        self.rollups
            .write()
            .insert(perf.strategy_id.clone(), perf.clone());
        Ok(())
    }

    async fn get(&self, strategy_id: &str) -> StoreResult<Option<StrategyPerformance>> {
        Ok(self.rollups.read().get(strategy_id).cloned())
    }
}
