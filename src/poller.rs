// =============================================================================
// Order-status poller — drives every non-terminal bet to a terminal state
// =============================================================================
//
// Runs as a background Tokio task, waking every `order_monitoring_interval`:
//
//   1. Live bets with an exchange id are polled in one batch; status,
//      matched fields and settlement P&L are applied, and the risk
//      reservation is released on every transition to a terminal state.
//   2. Live bets without an exchange id (a transient submit failure left
//      them Pending) are resubmitted with the original customer reference,
//      which the exchange uses to dedup — at most one real order per bet.
//   3. Paper bets are settled locally from race results so the monitor and
//      breaker see the same feedback loop in paper mode as in live mode.
//
// Exchange failures feed the breaker's failure window once per failed cycle.
// A bet the exchange no longer reports is flagged as stuck; this module
// never invents a terminal state for it.
// =============================================================================

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::breaker::CircuitBreaker;
use crate::exchange::{ExchangeClient, ExchangeOrderStatus, OrderReport};
use crate::risk::RiskManager;
use crate::store::{BetStore, RaceStore};
use crate::types::{Bet, BetStatus, RaceStatus, Side};

/// Summary of a single poll cycle.
#[derive(Debug, Clone, Default)]
pub struct PollStats {
    pub polled: usize,
    pub transitioned: usize,
    pub resubmitted: usize,
    pub paper_settled: usize,
    pub stuck: usize,
}

pub struct OrderPoller {
    bets: Arc<dyn BetStore>,
    races: Arc<dyn RaceStore>,
    exchange: Arc<dyn ExchangeClient>,
    risk: Arc<RiskManager>,
    breaker: Arc<CircuitBreaker>,
    commission_rate: f64,
    interval: Duration,
}

impl OrderPoller {
    pub fn new(
        bets: Arc<dyn BetStore>,
        races: Arc<dyn RaceStore>,
        exchange: Arc<dyn ExchangeClient>,
        risk: Arc<RiskManager>,
        breaker: Arc<CircuitBreaker>,
        commission_rate: f64,
        interval: Duration,
    ) -> Self {
        Self {
            bets,
            races,
            exchange,
            risk,
            breaker,
            commission_rate,
            interval,
        }
    }

    /// Run the poll loop until shutdown, draining the current cycle.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        info!(interval_secs = self.interval.as_secs(), "order poller started");
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match self.run_once().await {
                        Ok(stats) => {
                            debug!(
                                polled = stats.polled,
                                transitioned = stats.transitioned,
                                resubmitted = stats.resubmitted,
                                paper_settled = stats.paper_settled,
                                stuck = stats.stuck,
                                "poll cycle complete"
                            );
                        }
                        Err(e) => {
                            warn!(error = %e, "poll cycle failed");
                            self.breaker.record_failure();
                        }
                    }
                }
                _ = shutdown.changed() => {
                    info!("order poller stopped");
                    return;
                }
            }
        }
    }

    /// One poll cycle. Public so tests and the startup reconciler can drive
    /// it directly.
    pub async fn run_once(&self) -> Result<PollStats> {
        let open = self
            .bets
            .get_non_terminal()
            .await
            .context("fetching non-terminal bets")?;

        let mut stats = PollStats {
            polled: open.len(),
            ..PollStats::default()
        };

        let mut tracked: Vec<Bet> = Vec::new();
        let mut unsubmitted: Vec<Bet> = Vec::new();
        let mut paper: Vec<Bet> = Vec::new();

        for bet in open {
            if bet.paper {
                paper.push(bet);
            } else if bet.exchange_bet_id.is_some() {
                tracked.push(bet);
            } else {
                unsubmitted.push(bet);
            }
        }

        self.settle_paper(paper, &mut stats).await;
        self.poll_tracked(tracked, &mut stats).await;
        self.resubmit(unsubmitted, &mut stats).await;

        Ok(stats)
    }

    // -------------------------------------------------------------------------
    // Exchange-tracked bets
    // -------------------------------------------------------------------------

    async fn poll_tracked(&self, tracked: Vec<Bet>, stats: &mut PollStats) {
        if tracked.is_empty() {
            return;
        }

        let ids: Vec<String> = tracked
            .iter()
            .filter_map(|b| b.exchange_bet_id.clone())
            .collect();

        let reports = match self.exchange.list_orders(&ids).await {
            Ok(reports) => reports,
            Err(e) => {
                warn!(error = %e, "order status poll failed");
                self.breaker.record_failure();
                return;
            }
        };

        for bet in tracked {
            let exchange_id = bet.exchange_bet_id.clone().unwrap_or_default();
            let Some(report) = reports.iter().find(|r| r.exchange_bet_id == exchange_id) else {
                stats.stuck += 1;
                warn!(
                    bet_id = %bet.id,
                    exchange_bet_id = %exchange_id,
                    "bet missing from exchange report — marked stuck"
                );
                continue;
            };

            if self.apply_report(bet, report).await {
                stats.transitioned += 1;
            }
        }
    }

    /// Apply one order report to a bet. Returns true when the bet changed.
    async fn apply_report(&self, mut bet: Bet, report: &OrderReport) -> bool {
        match report.status {
            ExchangeOrderStatus::Pending => false,
            ExchangeOrderStatus::Matched => {
                if bet.status == BetStatus::Matched {
                    return false;
                }
                bet.status = BetStatus::Matched;
                bet.matched_price = report.matched_price;
                bet.matched_size = report.matched_size;
                bet.matched_at = Some(Utc::now());
                self.commit(&bet, None).await
            }
            ExchangeOrderStatus::Cancelled => {
                bet.status = BetStatus::Cancelled;
                bet.cancelled_at = Some(Utc::now());
                self.commit(&bet, Some(0.0)).await
            }
            ExchangeOrderStatus::SettledWon | ExchangeOrderStatus::SettledLost => {
                let won = report.status == ExchangeOrderStatus::SettledWon;
                let price = report
                    .matched_price
                    .or(bet.matched_price)
                    .unwrap_or(bet.requested_odds);
                let size = report
                    .matched_size
                    .or(bet.matched_size)
                    .unwrap_or(bet.stake);

                let (pnl, commission) =
                    settlement_pnl(bet.side, price, size, won, self.commission_rate, report.commission);

                bet.status = if won {
                    BetStatus::SettledWin
                } else {
                    BetStatus::SettledLoss
                };
                bet.matched_price = Some(price);
                bet.matched_size = Some(size);
                bet.realized_pnl = pnl;
                bet.commission = commission;
                bet.settled_at = Some(Utc::now());
                self.commit(&bet, Some(pnl)).await
            }
        }
    }

    /// Persist a transition; release the reservation when it is terminal.
    async fn commit(&self, bet: &Bet, release_pnl: Option<f64>) -> bool {
        if let Err(e) = self.bets.update(bet).await {
            warn!(bet_id = %bet.id, error = %e, "bet transition update failed");
            self.breaker.record_failure();
            return false;
        }

        if let Some(pnl) = release_pnl {
            self.risk.release(bet, pnl);
        }

        info!(
            bet_id = %bet.id,
            status = %bet.status,
            realized_pnl = bet.realized_pnl,
            "bet transition applied"
        );
        true
    }

    // -------------------------------------------------------------------------
    // Resubmission of transiently failed submissions
    // -------------------------------------------------------------------------

    async fn resubmit(&self, unsubmitted: Vec<Bet>, stats: &mut PollStats) {
        for mut bet in unsubmitted {
            debug!(bet_id = %bet.id, "resubmitting pending bet");
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
                    if self.commit(&bet, None).await {
                        stats.resubmitted += 1;
                    }
                }
                Err(e) if e.is_transient() => {
                    warn!(bet_id = %bet.id, error = %e, "resubmission failed — will retry");
                    self.breaker.record_failure();
                }
                Err(e) => {
                    warn!(bet_id = %bet.id, error = %e, "resubmission rejected — bet failed");
                    bet.status = BetStatus::Failed;
                    self.commit(&bet, Some(0.0)).await;
                    self.breaker.record_failure();
                }
            }
        }
    }

    // -------------------------------------------------------------------------
    // Paper settlement
    // -------------------------------------------------------------------------

    async fn settle_paper(&self, paper: Vec<Bet>, stats: &mut PollStats) {
        for mut bet in paper {
            if bet.status != BetStatus::MatchedPaper {
                continue;
            }

            let result = match self.races.result(&bet.race_id).await {
                Ok(result) => result,
                Err(e) => {
                    warn!(bet_id = %bet.id, error = %e, "race result lookup failed");
                    continue;
                }
            };

            let Some(result) = result else {
                // No result yet. An abandoned race will never produce one, so
                // void the bet instead of leaving it open forever.
                if let Ok(Some(race)) = self.races.race(&bet.race_id).await {
                    if race.status == RaceStatus::Abandoned {
                        bet.status = BetStatus::Cancelled;
                        bet.cancelled_at = Some(Utc::now());
                        if self.commit(&bet, Some(0.0)).await {
                            stats.transitioned += 1;
                        }
                    }
                }
                continue;
            };

            let runner_won = result.winner_runner_id == bet.runner_id;
            let won = match bet.side {
                Side::Back => runner_won,
                Side::Lay => !runner_won,
            };

            let price = bet.matched_price.unwrap_or(bet.requested_odds);
            let size = bet.matched_size.unwrap_or(bet.stake);
            let (pnl, commission) =
                settlement_pnl(bet.side, price, size, won, self.commission_rate, None);

            bet.status = if won {
                BetStatus::SettledWin
            } else {
                BetStatus::SettledLoss
            };
            bet.realized_pnl = pnl;
            bet.commission = commission;
            bet.settled_at = Some(Utc::now());

            if self.commit(&bet, Some(pnl)).await {
                stats.paper_settled += 1;
            }
        }
    }
}

/// Realized P&L and commission for a settled bet.
///
/// Back: win `size·(price−1)` gross, lose `size`. Lay: win `size` gross
/// (the backer's stake), lose the liability `size·(price−1)`. Commission is
/// charged on winnings only; an exchange-reported figure takes precedence.
fn settlement_pnl(
    side: Side,
    price: f64,
    size: f64,
    won: bool,
    commission_rate: f64,
    reported_commission: Option<f64>,
) -> (f64, f64) {
    if !won {
        let loss = match side {
            Side::Back => size,
            Side::Lay => size * (price - 1.0),
        };
        return (-loss, 0.0);
    }

    let gross = match side {
        Side::Back => size * (price - 1.0),
        Side::Lay => size,
    };
    let commission = reported_commission.unwrap_or(gross * commission_rate);
    (gross - commission, commission)
}

impl std::fmt::Debug for OrderPoller {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OrderPoller")
            .field("interval", &self.interval)
            .field("commission_rate", &self.commission_rate)
            .finish()
    }
}
