// =============================================================================
// Shared types used across the Trapline betting engine
// =============================================================================

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Races and runners
// ---------------------------------------------------------------------------

/// Lifecycle status of a race as reported by the ingestion pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RaceStatus {
    Scheduled,
    Finished,
    Abandoned,
}

impl std::fmt::Display for RaceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Scheduled => write!(f, "Scheduled"),
            Self::Finished => write!(f, "Finished"),
            Self::Abandoned => write!(f, "Abandoned"),
        }
    }
}

/// A single greyhound race. Created by external ingestion; read-only here.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Race {
    pub id: String,
    pub scheduled_start: DateTime<Utc>,
    pub track: String,
    /// Race distance in metres.
    pub distance_m: u32,
    pub status: RaceStatus,
}

/// A runner (dog) in a race. Read-only here.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Runner {
    pub id: String,
    pub race_id: String,
    /// Trap number, 1-based.
    pub trap: u8,
    pub name: String,
    /// Composite form rating from the ingestion pipeline; higher is better.
    pub form_rating: f64,
}

/// Final result of a race, used to settle paper bets locally.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RaceResult {
    pub race_id: String,
    pub winner_runner_id: String,
    pub finished_at: DateTime<Utc>,
}

/// A timestamped odds observation for one runner. The capture timestamp is
/// mandatory so the orchestrator can exclude lookahead when evaluating
/// strategies.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OddsTick {
    pub runner_id: String,
    /// Best available back price (decimal odds).
    pub back_price: f64,
    /// Best available lay price (decimal odds).
    pub lay_price: f64,
    pub captured_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Strategies and signals
// ---------------------------------------------------------------------------

/// A strategy registration row. Activated/deactivated externally; reloaded at
/// the start of each orchestrator tick.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StrategyRecord {
    pub id: String,
    /// Factory name, e.g. "form-value" or "drift-lay".
    pub name: String,
    /// Opaque tuning knobs interpreted by the concrete strategy.
    #[serde(default)]
    pub params: HashMap<String, f64>,
    pub active: bool,
    #[serde(default)]
    pub version: u32,
    /// Minimum model confidence to keep a signal; `None` disables model
    /// filtering for this strategy.
    #[serde(default)]
    pub model_confidence_threshold: Option<f64>,
    /// Whether signals may proceed on the strategy's own probability when no
    /// model prediction is available.
    #[serde(default)]
    pub allow_unmodelled: bool,
}

/// Back takes the "yes" side of a proposition; Lay takes the "no" side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Side {
    Back,
    Lay,
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Back => write!(f, "Back"),
            Self::Lay => write!(f, "Lay"),
        }
    }
}

/// A betting opportunity produced by a strategy. Produced and consumed within
/// one orchestrator tick; never persisted.
#[derive(Debug, Clone)]
pub struct Signal {
    pub race_id: String,
    pub runner_id: String,
    pub strategy_id: String,
    pub side: Side,
    /// Expected profit per unit stake, `b·p − q`.
    pub edge: f64,
    /// The strategy's probability estimate that this bet wins: the runner
    /// winning for a back, the runner losing for a lay.
    pub probability: f64,
    /// Odds the strategy wants to take.
    pub odds: f64,
    /// Model confidence attached by the orchestrator's filter pass.
    pub confidence: Option<f64>,
}

// ---------------------------------------------------------------------------
// Bets
// ---------------------------------------------------------------------------

/// Lifecycle status of a bet.
///
/// Terminal states: `SettledWin`, `SettledLoss`, `Cancelled`, `Failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BetStatus {
    /// Persisted locally; exchange confirmation outstanding.
    Pending,
    /// Matched on the exchange.
    Matched,
    /// Simulated fill in paper mode; never reached the exchange.
    MatchedPaper,
    SettledWin,
    SettledLoss,
    Cancelled,
    Failed,
}

impl BetStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::SettledWin | Self::SettledLoss | Self::Cancelled | Self::Failed
        )
    }
}

impl std::fmt::Display for BetStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "Pending"),
            Self::Matched => write!(f, "Matched"),
            Self::MatchedPaper => write!(f, "MatchedPaper"),
            Self::SettledWin => write!(f, "SettledWin"),
            Self::SettledLoss => write!(f, "SettledLoss"),
            Self::Cancelled => write!(f, "Cancelled"),
            Self::Failed => write!(f, "Failed"),
        }
    }
}

/// A persisted bet. Created by the executor; mutated only by the executor (on
/// submit), the order poller (status/matched fields) and settlement (P&L).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Bet {
    /// Unique identifier (UUID v4). Doubles as the customer order reference
    /// sent to the exchange, which is the at-most-once dedup key.
    pub id: String,
    pub race_id: String,
    pub runner_id: String,
    pub strategy_id: String,
    pub side: Side,
    pub requested_odds: f64,
    pub stake: f64,
    pub status: BetStatus,
    #[serde(default)]
    pub exchange_bet_id: Option<String>,
    #[serde(default)]
    pub exchange_market_id: Option<String>,
    #[serde(default)]
    pub matched_price: Option<f64>,
    #[serde(default)]
    pub matched_size: Option<f64>,
    pub placed_at: DateTime<Utc>,
    #[serde(default)]
    pub matched_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub settled_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub cancelled_at: Option<DateTime<Utc>>,
    /// Realized profit or loss, net of commission. Zero until settled.
    #[serde(default)]
    pub realized_pnl: f64,
    #[serde(default)]
    pub commission: f64,
    /// True when the bet was simulated and never reached the exchange.
    pub paper: bool,
}

impl Bet {
    /// The worst loss this bet can realize: the stake for a back bet, the
    /// liability `stake·(odds−1)` for a lay bet.
    pub fn worst_case_loss(&self) -> f64 {
        worst_case_loss(self.stake, self.side, self.requested_odds)
    }
}

/// Worst-case loss for a proposed stake before a `Bet` exists.
pub fn worst_case_loss(stake: f64, side: Side, odds: f64) -> f64 {
    match side {
        Side::Back => stake,
        Side::Lay => stake * (odds - 1.0),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_statuses() {
        assert!(BetStatus::SettledWin.is_terminal());
        assert!(BetStatus::SettledLoss.is_terminal());
        assert!(BetStatus::Cancelled.is_terminal());
        assert!(BetStatus::Failed.is_terminal());
        assert!(!BetStatus::Pending.is_terminal());
        assert!(!BetStatus::Matched.is_terminal());
        assert!(!BetStatus::MatchedPaper.is_terminal());
    }

    #[test]
    fn worst_case_back_is_stake() {
        assert_eq!(worst_case_loss(10.0, Side::Back, 5.0), 10.0);
    }

    #[test]
    fn worst_case_lay_is_liability() {
        assert!((worst_case_loss(10.0, Side::Lay, 4.0) - 30.0).abs() < 1e-9);
    }
}
