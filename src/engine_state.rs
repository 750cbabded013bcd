// =============================================================================
// Engine state — shared counters and the status snapshot
// =============================================================================
//
// The single place the status API reads from. Subsystems own their state
// (risk manager, breaker); this struct ties them together and accumulates
// per-tick outcome counters.
//
// Thread safety: atomic counters for lock-free increments, parking_lot for
// the rest.
// =============================================================================

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;

use crate::breaker::{BreakerSnapshot, CircuitBreaker};
use crate::executor::BatchTally;
use crate::risk::{RiskManager, RiskState};

/// Cumulative outcome counters since startup.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct OutcomeCounters {
    pub placed: u64,
    pub skipped: u64,
    pub rejected: u64,
    pub failed: u64,
}

/// Central shared state, wrapped in `Arc` at startup.
pub struct EngineState {
    pub risk: Arc<RiskManager>,
    pub breaker: Arc<CircuitBreaker>,
    last_tick: RwLock<Option<DateTime<Utc>>>,
    tick_count: AtomicU64,
    outcomes: RwLock<OutcomeCounters>,
    strategy_failures: AtomicU64,
    model_failures: AtomicU64,
    started_at: DateTime<Utc>,
}

impl EngineState {
    pub fn new(risk: Arc<RiskManager>, breaker: Arc<CircuitBreaker>) -> Self {
        Self {
            risk,
            breaker,
            last_tick: RwLock::new(None),
            tick_count: AtomicU64::new(0),
            outcomes: RwLock::new(OutcomeCounters::default()),
            strategy_failures: AtomicU64::new(0),
            model_failures: AtomicU64::new(0),
            started_at: Utc::now(),
        }
    }

    /// Record the completion of one trading-loop tick.
    pub fn record_tick(&self, at: DateTime<Utc>, tally: &BatchTally) {
        *self.last_tick.write() = Some(at);
        self.tick_count.fetch_add(1, Ordering::Relaxed);

        let mut outcomes = self.outcomes.write();
        outcomes.placed += tally.placed as u64;
        outcomes.skipped += tally.skipped as u64;
        outcomes.rejected += tally.rejected as u64;
        outcomes.failed += tally.failed as u64;
    }

    pub fn record_strategy_failure(&self) {
        self.strategy_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_model_failure(&self) {
        self.model_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Build the payload for `GET /api/v1/status`.
    pub fn snapshot(&self) -> StatusSnapshot {
        StatusSnapshot {
            server_time: Utc::now(),
            started_at: self.started_at,
            breaker: self.breaker.snapshot(),
            risk: self.risk.snapshot(),
            last_tick_at: *self.last_tick.read(),
            ticks: self.tick_count.load(Ordering::Relaxed),
            outcomes: *self.outcomes.read(),
            strategy_failures: self.strategy_failures.load(Ordering::Relaxed),
            model_failures: self.model_failures.load(Ordering::Relaxed),
        }
    }
}

/// Full engine status, served by the API.
#[derive(Debug, Clone, Serialize)]
pub struct StatusSnapshot {
    pub server_time: DateTime<Utc>,
    pub started_at: DateTime<Utc>,
    pub breaker: BreakerSnapshot,
    pub risk: RiskState,
    pub last_tick_at: Option<DateTime<Utc>>,
    pub ticks: u64,
    pub outcomes: OutcomeCounters,
    pub strategy_failures: u64,
    pub model_failures: u64,
}
