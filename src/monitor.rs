// =============================================================================
// Performance Monitor — settled-bet aggregation feeding the circuit breaker
// =============================================================================
//
// Runs as a background Tokio task, waking on a fixed interval to:
//   1. Fetch bets settled since the last watermark (chronological order).
//   2. Feed each outcome to the circuit breaker together with the bankroll as
//      of that settlement, so drawdown reflects intermediate peaks and not
//      just the final balance.
//   3. Fold the bets into per-strategy rollups and persist them.
//   4. Advance the watermark.
//
// The watermark only advances when the settled-bet read succeeds, so a
// storage outage is retried on the next tick without losing outcomes. Rollup
// upsert failures are counted and self-heal on the next successful pass; a
// single tick failure never crashes the orchestrator.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::breaker::CircuitBreaker;
use crate::store::{BetStore, PerformanceStore, StrategyPerformance};
use crate::types::{Bet, BetStatus};

pub struct PerformanceMonitor {
    bets: Arc<dyn BetStore>,
    performance: Arc<dyn PerformanceStore>,
    breaker: Arc<CircuitBreaker>,
    base_bankroll: f64,
    interval: Duration,
    watermark: Mutex<DateTime<Utc>>,
    cumulative_pnl: Mutex<f64>,
    /// Last computed rollup per strategy, served without touching storage.
    live: RwLock<HashMap<String, StrategyPerformance>>,
}

impl PerformanceMonitor {
    pub fn new(
        bets: Arc<dyn BetStore>,
        performance: Arc<dyn PerformanceStore>,
        breaker: Arc<CircuitBreaker>,
        base_bankroll: f64,
        interval: Duration,
        started_at: DateTime<Utc>,
    ) -> Self {
        Self {
            bets,
            performance,
            breaker,
            base_bankroll,
            interval,
            watermark: Mutex::new(started_at),
            cumulative_pnl: Mutex::new(0.0),
            live: RwLock::new(HashMap::new()),
        }
    }

    /// Last computed snapshot for one strategy, without querying storage.
    pub fn live_metrics(&self, strategy_id: &str) -> Option<StrategyPerformance> {
        self.live.read().get(strategy_id).cloned()
    }

    /// Run the monitor loop until shutdown, then drain one final pass.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        info!(interval_secs = self.interval.as_secs(), "performance monitor started");
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.run_once().await {
                        warn!(error = %e, "performance pass failed — retrying next tick");
                        self.breaker.record_failure();
                    }
                }
                _ = shutdown.changed() => {
                    // Final drain so the breaker sees every settled bet.
                    if let Err(e) = self.run_once().await {
                        warn!(error = %e, "final performance pass failed");
                    }
                    info!("performance monitor stopped");
                    return;
                }
            }
        }
    }

    /// One aggregation pass. Public so tests and the shutdown drain can call
    /// it directly.
    pub async fn run_once(&self) -> Result<usize> {
        let watermark = *self.watermark.lock();
        let settled = self
            .bets
            .get_settled_since(watermark)
            .await
            .context("fetching settled bets")?;

        if settled.is_empty() {
            debug!("performance pass: nothing newly settled");
            return Ok(0);
        }

        // Feed the breaker in settlement order with the bankroll as of each
        // settlement. This ordering is what makes drawdown and streaks
        // deterministic.
        let mut cumulative = *self.cumulative_pnl.lock();
        let mut new_watermark = watermark;
        for bet in &settled {
            cumulative += bet.realized_pnl;
            self.breaker
                .record_outcome(bet, self.base_bankroll + cumulative);
            if let Some(at) = bet.settled_at {
                new_watermark = new_watermark.max(at);
            }
        }

        // Fold into per-strategy rollups.
        let updated: Vec<StrategyPerformance> = {
            let mut live = self.live.write();
            let mut touched: Vec<String> = Vec::new();
            for bet in &settled {
                let entry = live
                    .entry(bet.strategy_id.clone())
                    .or_insert_with(|| empty_rollup(&bet.strategy_id));
                fold_bet(entry, bet);
                if !touched.contains(&bet.strategy_id) {
                    touched.push(bet.strategy_id.clone());
                }
            }
            touched
                .iter()
                .filter_map(|id| live.get(id).cloned())
                .collect()
        };

        // Commit the feed before attempting rollup persistence: a failed
        // upsert must not cause outcomes to be re-fed next tick.
        *self.cumulative_pnl.lock() = cumulative;
        *self.watermark.lock() = new_watermark;

        for rollup in &updated {
            if let Err(e) = self.performance.upsert(rollup).await {
                warn!(
                    strategy_id = %rollup.strategy_id,
                    error = %e,
                    "rollup upsert failed — will self-heal on next pass"
                );
                self.breaker.record_failure();
            }
        }

        info!(
            settled = settled.len(),
            cumulative_pnl = cumulative,
            strategies = updated.len(),
            "performance pass complete"
        );
        Ok(settled.len())
    }
}

fn empty_rollup(strategy_id: &str) -> StrategyPerformance {
    StrategyPerformance {
        strategy_id: strategy_id.to_string(),
        total_bets: 0,
        wins: 0,
        losses: 0,
        win_rate: 0.0,
        roi: 0.0,
        total_staked: 0.0,
        total_pnl: 0.0,
        largest_win: 0.0,
        largest_loss: 0.0,
        current_streak: 0,
        updated_at: Utc::now(),
    }
}

/// Fold one settled bet into a strategy rollup. Cancelled and failed bets
/// count toward nothing; only wins and losses carry information.
fn fold_bet(rollup: &mut StrategyPerformance, bet: &Bet) {
    match bet.status {
        BetStatus::SettledWin => {
            rollup.total_bets += 1;
            rollup.wins += 1;
            rollup.current_streak = if rollup.current_streak > 0 {
                rollup.current_streak + 1
            } else {
                1
            };
            if bet.realized_pnl > rollup.largest_win {
                rollup.largest_win = bet.realized_pnl;
            }
        }
        BetStatus::SettledLoss => {
            rollup.total_bets += 1;
            rollup.losses += 1;
            rollup.current_streak = if rollup.current_streak < 0 {
                rollup.current_streak - 1
            } else {
                -1
            };
            if bet.realized_pnl < rollup.largest_loss {
                rollup.largest_loss = bet.realized_pnl;
            }
        }
        _ => return,
    }

    rollup.total_staked += bet.stake;
    rollup.total_pnl += bet.realized_pnl;
    rollup.win_rate = rollup.wins as f64 / rollup.total_bets as f64;
    rollup.roi = if rollup.total_staked > 0.0 {
        rollup.total_pnl / rollup.total_staked
    } else {
        0.0
    };
    rollup.updated_at = Utc::now();
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::breaker::{BreakerConfig, BreakerState};
    use crate::store::{MemoryBetStore, MemoryPerformanceStore};
    use crate::types::Side;
    use chrono::Duration as ChronoDuration;

    fn breaker(max_losses: u32, max_drawdown: f64) -> Arc<CircuitBreaker> {
        Arc::new(CircuitBreaker::new(
            BreakerConfig {
                max_consecutive_losses: max_losses,
                max_drawdown_percent: max_drawdown,
                failure_window: ChronoDuration::seconds(60),
                max_failures_in_window: 50,
                cooldown: ChronoDuration::seconds(60),
            },
            1000.0,
        ))
    }

    fn settled_bet(
        strategy: &str,
        stake: f64,
        pnl: f64,
        settled_at: DateTime<Utc>,
    ) -> Bet {
        Bet {
            id: uuid::Uuid::new_v4().to_string(),
            race_id: "race-1".to_string(),
            runner_id: "runner-1".to_string(),
            strategy_id: strategy.to_string(),
            side: Side::Back,
            requested_odds: 3.0,
            stake,
            status: if pnl >= 0.0 {
                BetStatus::SettledWin
            } else {
                BetStatus::SettledLoss
            },
            exchange_bet_id: None,
            exchange_market_id: None,
            matched_price: Some(3.0),
            matched_size: Some(stake),
            placed_at: settled_at - ChronoDuration::minutes(5),
            matched_at: Some(settled_at - ChronoDuration::minutes(5)),
            settled_at: Some(settled_at),
            cancelled_at: None,
            realized_pnl: pnl,
            commission: 0.0,
            paper: true,
        }
    }

    fn monitor(
        bets: Arc<MemoryBetStore>,
        breaker: Arc<CircuitBreaker>,
        started_at: DateTime<Utc>,
    ) -> PerformanceMonitor {
        PerformanceMonitor::new(
            bets,
            Arc::new(MemoryPerformanceStore::new()),
            breaker,
            1000.0,
            Duration::from_secs(60),
            started_at,
        )
    }

    #[tokio::test]
    async fn drawdown_trips_on_the_bet_that_crosses_the_threshold() {
        let bets = Arc::new(MemoryBetStore::new());
        let cb = breaker(100, 0.15);
        let start = Utc::now() - ChronoDuration::hours(1);
        let m = monitor(bets.clone(), cb.clone(), start);

        // Losses totaling 150: drawdown exactly 0.15 — still closed.
        bets.create(&settled_bet("s1", 10.0, -100.0, start + ChronoDuration::minutes(1)))
            .await
            .unwrap();
        bets.create(&settled_bet("s1", 10.0, -50.0, start + ChronoDuration::minutes(2)))
            .await
            .unwrap();
        m.run_once().await.unwrap();
        assert_eq!(cb.state(), BreakerState::Closed);

        // The next loss pushes drawdown to 0.16 — open.
        bets.create(&settled_bet("s1", 10.0, -10.0, start + ChronoDuration::minutes(3)))
            .await
            .unwrap();
        m.run_once().await.unwrap();
        assert_eq!(cb.state(), BreakerState::Open);
    }

    #[tokio::test]
    async fn chronological_feed_preserves_intermediate_peaks() {
        let bets = Arc::new(MemoryBetStore::new());
        let cb = breaker(100, 0.15);
        let start = Utc::now() - ChronoDuration::hours(1);
        let m = monitor(bets.clone(), cb.clone(), start);

        // A win lifts the peak to 1200, then a loss lands at 1010 — only 1%
        // under the base bankroll but 15.8% under the intermediate peak.
        bets.create(&settled_bet("s1", 10.0, 200.0, start + ChronoDuration::minutes(1)))
            .await
            .unwrap();
        bets.create(&settled_bet("s1", 10.0, -190.0, start + ChronoDuration::minutes(2)))
            .await
            .unwrap();

        m.run_once().await.unwrap();
        assert_eq!(cb.state(), BreakerState::Open);
    }

    #[tokio::test]
    async fn consecutive_loss_trip_through_the_monitor() {
        let bets = Arc::new(MemoryBetStore::new());
        let cb = breaker(3, 0.9);
        let start = Utc::now() - ChronoDuration::hours(1);
        let m = monitor(bets.clone(), cb.clone(), start);

        for i in 0..3 {
            bets.create(&settled_bet(
                "s1",
                10.0,
                -10.0,
                start + ChronoDuration::minutes(i + 1),
            ))
            .await
            .unwrap();
        }

        m.run_once().await.unwrap();
        assert_eq!(cb.state(), BreakerState::Open);
    }

    #[tokio::test]
    async fn watermark_prevents_double_counting() {
        let bets = Arc::new(MemoryBetStore::new());
        let cb = breaker(3, 0.9);
        let start = Utc::now() - ChronoDuration::hours(1);
        let m = monitor(bets.clone(), cb.clone(), start);

        for i in 0..2 {
            bets.create(&settled_bet(
                "s1",
                10.0,
                -10.0,
                start + ChronoDuration::minutes(i + 1),
            ))
            .await
            .unwrap();
        }

        assert_eq!(m.run_once().await.unwrap(), 2);
        assert_eq!(cb.snapshot().consecutive_losses, 2);

        // Re-running with no new settlements feeds nothing.
        assert_eq!(m.run_once().await.unwrap(), 0);
        assert_eq!(cb.snapshot().consecutive_losses, 2);
        assert_eq!(cb.state(), BreakerState::Closed);
    }

    #[tokio::test]
    async fn per_strategy_rollups_and_live_metrics() {
        let bets = Arc::new(MemoryBetStore::new());
        let cb = breaker(100, 0.9);
        let start = Utc::now() - ChronoDuration::hours(1);
        let m = monitor(bets.clone(), cb.clone(), start);

        // s1: win 20 on 10, loss 10 on 10. s2: loss 5 on 5.
        bets.create(&settled_bet("s1", 10.0, 20.0, start + ChronoDuration::minutes(1)))
            .await
            .unwrap();
        bets.create(&settled_bet("s1", 10.0, -10.0, start + ChronoDuration::minutes(2)))
            .await
            .unwrap();
        bets.create(&settled_bet("s2", 5.0, -5.0, start + ChronoDuration::minutes(3)))
            .await
            .unwrap();

        m.run_once().await.unwrap();

        let s1 = m.live_metrics("s1").unwrap();
        assert_eq!(s1.total_bets, 2);
        assert_eq!(s1.wins, 1);
        assert_eq!(s1.losses, 1);
        assert!((s1.win_rate - 0.5).abs() < 1e-9);
        assert!((s1.total_pnl - 10.0).abs() < 1e-9);
        assert!((s1.roi - 0.5).abs() < 1e-9);
        assert!((s1.largest_win - 20.0).abs() < 1e-9);
        assert!((s1.largest_loss + 10.0).abs() < 1e-9);
        assert_eq!(s1.current_streak, -1);

        let s2 = m.live_metrics("s2").unwrap();
        assert_eq!(s2.total_bets, 1);
        assert_eq!(s2.current_streak, -1);

        assert!(m.live_metrics("s3").is_none());
    }

    #[tokio::test]
    async fn streaks_extend_across_passes() {
        let bets = Arc::new(MemoryBetStore::new());
        let cb = breaker(100, 0.9);
        let start = Utc::now() - ChronoDuration::hours(1);
        let m = monitor(bets.clone(), cb.clone(), start);

        bets.create(&settled_bet("s1", 10.0, -10.0, start + ChronoDuration::minutes(1)))
            .await
            .unwrap();
        m.run_once().await.unwrap();

        bets.create(&settled_bet("s1", 10.0, -10.0, start + ChronoDuration::minutes(2)))
            .await
            .unwrap();
        m.run_once().await.unwrap();

        assert_eq!(m.live_metrics("s1").unwrap().current_streak, -2);
    }
}
