// =============================================================================
// Executor — converts approved signals into persisted bets and drives
// submission, with full paper-mode simulation support
// =============================================================================
//
// Per-signal sequence: breaker gate → size → reserve → persist → submit. The
// bet row is written before the exchange is ever contacted, and the bet id
// rides along as the customer order reference, so a submission can never
// happen twice for one decision — on restart the reconciler resolves any
// pending rows against the exchange by that reference.
//
// Live-mode gating is enforced here in addition to config validation: an
// executor constructed with `live_enabled = false` refuses to submit any
// real-money order even if asked.
// =============================================================================

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::breaker::CircuitBreaker;
use crate::exchange::{ExchangeClient, ExchangeOrderStatus};
use crate::risk::{LimitBreach, RiskManager};
use crate::store::{BetStore, StoreError};
use crate::types::{Bet, BetStatus, Signal};

// ---------------------------------------------------------------------------
// Outcomes
// ---------------------------------------------------------------------------

/// Result of one execution attempt. Rejections and skips are benign events,
/// not errors; callers record them and move on.
#[derive(Debug, Clone)]
pub enum ExecutionOutcome {
    /// Live order acknowledged by the exchange.
    Placed(Bet),
    /// Simulated fill recorded in paper mode.
    PlacedPaper(Bet),
    /// Live submission hit a transient failure; the bet stays `Pending` and
    /// the order poller owns the retry.
    PlacedPending(Bet),
    /// Sized stake was below the dust threshold.
    SkippedLowStake,
    /// One of the four risk limits rejected the stake.
    RejectedLimit(LimitBreach),
    /// The circuit breaker is open (or the half-open probe is taken).
    RejectedBreakerOpen,
    /// Neither live nor paper mode permits this signal.
    RejectedLiveDisabled,
    /// The bet row could not be written; the exchange was never contacted.
    PersistFailed(StoreError),
    /// Terminal exchange rejection; the bet is marked `Failed`.
    Failed(String),
}

impl ExecutionOutcome {
    /// Structured-log label for this outcome.
    pub fn label(&self) -> &'static str {
        match self {
            Self::Placed(_) => "placed",
            Self::PlacedPaper(_) => "placed_paper",
            Self::PlacedPending(_) => "placed_pending",
            Self::SkippedLowStake => "skipped_low_stake",
            Self::RejectedLimit(_) => "rejected_limit",
            Self::RejectedBreakerOpen => "circuit_open",
            Self::RejectedLiveDisabled => "rejected_live_disabled",
            Self::PersistFailed(_) => "persist_failed",
            Self::Failed(_) => "exchange_failed",
        }
    }
}

impl std::fmt::Display for ExecutionOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Placed(bet) => write!(f, "Placed({})", bet.id),
            Self::PlacedPaper(bet) => write!(f, "PlacedPaper({})", bet.id),
            Self::PlacedPending(bet) => write!(f, "PlacedPending({})", bet.id),
            Self::SkippedLowStake => write!(f, "SkippedLowStake"),
            Self::RejectedLimit(breach) => write!(f, "RejectedLimit({breach})"),
            Self::RejectedBreakerOpen => write!(f, "RejectedBreakerOpen"),
            Self::RejectedLiveDisabled => write!(f, "RejectedLiveDisabled"),
            Self::PersistFailed(err) => write!(f, "PersistFailed({err})"),
            Self::Failed(msg) => write!(f, "Failed({msg})"),
        }
    }
}

/// Aggregate counts over a batch of executions.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct BatchTally {
    pub placed: u32,
    pub skipped: u32,
    pub rejected: u32,
    pub failed: u32,
}

impl BatchTally {
    pub fn record(&mut self, outcome: &ExecutionOutcome) {
        match outcome {
            ExecutionOutcome::Placed(_)
            | ExecutionOutcome::PlacedPaper(_)
            | ExecutionOutcome::PlacedPending(_) => self.placed += 1,
            ExecutionOutcome::SkippedLowStake | ExecutionOutcome::RejectedLimit(_) => {
                self.skipped += 1
            }
            ExecutionOutcome::RejectedBreakerOpen | ExecutionOutcome::RejectedLiveDisabled => {
                self.rejected += 1
            }
            ExecutionOutcome::PersistFailed(_) | ExecutionOutcome::Failed(_) => self.failed += 1,
        }
    }
}

// ---------------------------------------------------------------------------
// Executor
// ---------------------------------------------------------------------------

pub struct Executor {
    bets: Arc<dyn BetStore>,
    exchange: Arc<dyn ExchangeClient>,
    risk: Arc<RiskManager>,
    breaker: Arc<CircuitBreaker>,
    live_enabled: bool,
    paper_enabled: bool,
    /// Set by the breaker's shutdown callback; short-circuits a running batch.
    halted: AtomicBool,
}

impl Executor {
    pub fn new(
        bets: Arc<dyn BetStore>,
        exchange: Arc<dyn ExchangeClient>,
        risk: Arc<RiskManager>,
        breaker: Arc<CircuitBreaker>,
        live_enabled: bool,
        paper_enabled: bool,
    ) -> Self {
        info!(live_enabled, paper_enabled, "Executor initialised");
        Self {
            bets,
            exchange,
            risk,
            breaker,
            live_enabled,
            paper_enabled,
            halted: AtomicBool::new(false),
        }
    }

    /// Breaker shutdown hook: stop the current batch at the next signal
    /// boundary. Idempotent and non-blocking.
    pub fn emergency_stop(&self) {
        self.halted.store(true, Ordering::SeqCst);
        warn!("executor emergency stop engaged");
    }

    // -------------------------------------------------------------------------
    // Single-signal execution
    // -------------------------------------------------------------------------

    pub async fn execute(&self, signal: &Signal) -> ExecutionOutcome {
        // 1. Breaker gate.
        if self.breaker.is_open() {
            debug!(runner_id = %signal.runner_id, "signal refused — breaker open");
            return ExecutionOutcome::RejectedBreakerOpen;
        }

        // 2. Mode gate. With live trading off and paper off there is nothing
        // this executor is allowed to do with the signal.
        if !self.live_enabled && !self.paper_enabled {
            return ExecutionOutcome::RejectedLiveDisabled;
        }

        // 3. Size the stake.
        let bankroll = self.risk.current_bankroll();
        let stake = self.risk.size(signal, bankroll);
        if stake <= 0.0 {
            return ExecutionOutcome::SkippedLowStake;
        }

        // 4. Limit check before anything is built.
        if let Err(breach) = self.risk.check(stake, signal.side, signal.odds) {
            return ExecutionOutcome::RejectedLimit(breach);
        }

        // 5. Construct the bet and reserve exposure. `reserve` re-validates
        // under its own lock, so a concurrent execution cannot sneak past the
        // check above.
        let mut bet = Bet {
            id: Uuid::new_v4().to_string(),
            race_id: signal.race_id.clone(),
            runner_id: signal.runner_id.clone(),
            strategy_id: signal.strategy_id.clone(),
            side: signal.side,
            requested_odds: signal.odds,
            stake,
            status: BetStatus::Pending,
            exchange_bet_id: None,
            exchange_market_id: None,
            matched_price: None,
            matched_size: None,
            placed_at: Utc::now(),
            matched_at: None,
            settled_at: None,
            cancelled_at: None,
            realized_pnl: 0.0,
            commission: 0.0,
            paper: !self.live_enabled,
        };

        if let Err(breach) = self.risk.reserve(&bet) {
            return ExecutionOutcome::RejectedLimit(breach);
        }

        // 6. Claim the breaker admission (in HalfOpen this is the single
        // probe). Refusal here releases the reservation untouched.
        if !self.breaker.allow_execution() {
            self.risk.release(&bet, 0.0);
            return ExecutionOutcome::RejectedBreakerOpen;
        }

        // 7. Persist before the exchange sees anything.
        if let Err(err) = self.bets.create(&bet).await {
            warn!(bet_id = %bet.id, error = %err, "bet persistence failed — exchange not contacted");
            self.risk.release(&bet, 0.0);
            self.breaker.record_failure();
            return ExecutionOutcome::PersistFailed(err);
        }

        // 8. Submit (or simulate).
        if bet.paper {
            self.fill_paper(&mut bet).await
        } else {
            self.submit_live(&mut bet).await
        }
    }

    async fn fill_paper(&self, bet: &mut Bet) -> ExecutionOutcome {
        bet.status = BetStatus::MatchedPaper;
        bet.matched_price = Some(bet.requested_odds);
        bet.matched_size = Some(bet.stake);
        bet.matched_at = Some(Utc::now());

        if let Err(err) = self.bets.update(bet).await {
            warn!(bet_id = %bet.id, error = %err, "paper fill commit failed");
            self.breaker.record_failure();
            return ExecutionOutcome::PersistFailed(err);
        }

        info!(
            bet_id = %bet.id,
            race_id = %bet.race_id,
            runner_id = %bet.runner_id,
            side = %bet.side,
            odds = bet.requested_odds,
            stake = bet.stake,
            outcome = "placed_paper",
            "paper bet recorded"
        );
        ExecutionOutcome::PlacedPaper(bet.clone())
    }

    async fn submit_live(&self, bet: &mut Bet) -> ExecutionOutcome {
        debug!(bet_id = %bet.id, "submitting live order");

        let result = self
            .exchange
            .place_order(
                &bet.race_id,
                &bet.runner_id,
                bet.side,
                bet.requested_odds,
                bet.stake,
                &bet.id,
            )
            .await;

        match result {
            Ok(placed) => {
                bet.exchange_bet_id = Some(placed.exchange_bet_id);
                bet.exchange_market_id = Some(placed.market_id);
                if placed.status == ExchangeOrderStatus::Matched {
                    bet.status = BetStatus::Matched;
                    bet.matched_price = placed.matched_price;
                    bet.matched_size = placed.matched_size;
                    bet.matched_at = Some(Utc::now());
                }

                if let Err(err) = self.bets.update(bet).await {
                    // The exchange ack is lost from local state; the poller
                    // resubmits with the same customer_ref and the exchange
                    // dedups it.
                    warn!(bet_id = %bet.id, error = %err, "post-submit update failed");
                    self.breaker.record_failure();
                }

                info!(
                    bet_id = %bet.id,
                    exchange_bet_id = %bet.exchange_bet_id.as_deref().unwrap_or("-"),
                    status = %bet.status,
                    outcome = "placed",
                    "live bet submitted"
                );
                ExecutionOutcome::Placed(bet.clone())
            }
            Err(err) if err.is_transient() => {
                // Leave the bet Pending with no exchange id; the poller
                // retries with the same customer_ref.
                warn!(
                    bet_id = %bet.id,
                    error = %err,
                    outcome = "placed_pending",
                    "transient submit failure — poller will retry"
                );
                self.breaker.record_failure();
                ExecutionOutcome::PlacedPending(bet.clone())
            }
            Err(err) => {
                warn!(
                    bet_id = %bet.id,
                    error = %err,
                    outcome = "exchange_failed",
                    "terminal submit failure — bet marked failed"
                );
                bet.status = BetStatus::Failed;
                if let Err(update_err) = self.bets.update(bet).await {
                    warn!(bet_id = %bet.id, error = %update_err, "failed-bet update also failed");
                }
                self.risk.release(bet, 0.0);
                self.breaker.record_failure();
                ExecutionOutcome::Failed(err.to_string())
            }
        }
    }

    // -------------------------------------------------------------------------
    // Batch execution
    // -------------------------------------------------------------------------

    /// Execute a batch of signals sequentially, short-circuiting if the
    /// breaker opens (or the emergency stop fires) mid-batch.
    pub async fn execute_batch(&self, signals: &[Signal]) -> (Vec<ExecutionOutcome>, BatchTally) {
        // A previous open may have left the stop engaged; a batch only starts
        // when the orchestrator has seen the breaker non-open.
        if !self.breaker.is_open() {
            self.halted.store(false, Ordering::SeqCst);
        }

        let mut outcomes = Vec::with_capacity(signals.len());
        let mut tally = BatchTally::default();

        for signal in signals {
            if self.halted.load(Ordering::SeqCst) || self.breaker.is_open() {
                let remaining = signals.len() - outcomes.len();
                debug!(remaining, "batch short-circuited — breaker open");
                for _ in 0..remaining {
                    let outcome = ExecutionOutcome::RejectedBreakerOpen;
                    tally.record(&outcome);
                    outcomes.push(outcome);
                }
                break;
            }

            let outcome = self.execute(signal).await;
            tally.record(&outcome);
            outcomes.push(outcome);
        }

        (outcomes, tally)
    }

    // -------------------------------------------------------------------------
    // Cancellation
    // -------------------------------------------------------------------------

    /// Cancel a `Pending`/`Matched` bet. Terminal.
    pub async fn cancel(&self, bet_id: &str) -> anyhow::Result<Bet> {
        let mut bet = self
            .bets
            .get(bet_id)
            .await
            .map_err(|e| anyhow::anyhow!("cancel lookup failed: {e}"))?;

        if bet.status.is_terminal() {
            anyhow::bail!("bet {bet_id} already terminal ({})", bet.status);
        }

        if !bet.paper {
            if let Some(exchange_bet_id) = bet.exchange_bet_id.clone() {
                self.exchange
                    .cancel_order(&exchange_bet_id)
                    .await
                    .map_err(|e| anyhow::anyhow!("exchange cancel failed: {e}"))?;
            }
        }

        bet.status = BetStatus::Cancelled;
        bet.cancelled_at = Some(Utc::now());
        self.bets
            .update(&bet)
            .await
            .map_err(|e| anyhow::anyhow!("cancel update failed: {e}"))?;
        self.risk.release(&bet, 0.0);

        info!(bet_id = %bet.id, "bet cancelled");
        Ok(bet)
    }
}

impl std::fmt::Debug for Executor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Executor")
            .field("live_enabled", &self.live_enabled)
            .field("paper_enabled", &self.paper_enabled)
            .field("halted", &self.halted.load(Ordering::SeqCst))
            .finish()
    }
}
