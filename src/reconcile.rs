// =============================================================================
// Startup reconciliation — resolve bets left non-terminal by a previous run
// =============================================================================
//
// SAFETY POLICY: a pending bet with no exchange id is stale — the previous
// process died between persisting it and receiving an acknowledgment. The
// exchange may or may not hold a matching order, and resubmitting blind would
// risk a duplicate, so the safe default is to mark it failed locally; the
// customer reference makes any later manual resolution unambiguous.
//
// Bets the exchange does know about are left to the order poller, with their
// risk reservations re-established so the exposure and concurrency limits
// see them. Nothing here ever cancels an order on the exchange.
// =============================================================================

use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::{info, warn};

use crate::risk::RiskManager;
use crate::store::BetStore;
use crate::types::BetStatus;

/// Summary of a startup reconciliation pass.
#[derive(Debug, Clone, Default)]
pub struct ReconcileReport {
    /// Non-terminal bets found in storage.
    pub checked: usize,
    /// Reservations re-established (bets left for the poller to drive).
    pub restored: usize,
    /// Stale submissions marked failed.
    pub failed_stale: usize,
}

/// Run one reconciliation pass over all non-terminal bets.
pub async fn reconcile_startup(
    bets: &Arc<dyn BetStore>,
    risk: &Arc<RiskManager>,
    live_enabled: bool,
) -> Result<ReconcileReport> {
    let open = bets
        .get_non_terminal()
        .await
        .context("reconcile: fetching non-terminal bets")?;

    let mut report = ReconcileReport {
        checked: open.len(),
        ..ReconcileReport::default()
    };

    for mut bet in open {
        let stale_submission =
            !bet.paper && bet.exchange_bet_id.is_none() && bet.status == BetStatus::Pending;

        if stale_submission {
            warn!(
                bet_id = %bet.id,
                race_id = %bet.race_id,
                "stale pending bet with no exchange id — marking failed"
            );
            bet.status = BetStatus::Failed;
            bets.update(&bet)
                .await
                .with_context(|| format!("reconcile: failing stale bet {}", bet.id))?;
            report.failed_stale += 1;
            continue;
        }

        if !bet.paper && !live_enabled {
            // A live bet from a previous run cannot be polled without a live
            // session. Keep it on the books and let the operator resolve it.
            warn!(
                bet_id = %bet.id,
                exchange_bet_id = %bet.exchange_bet_id.as_deref().unwrap_or("-"),
                "live bet found with live trading disabled — unmanaged until re-enabled"
            );
        }

        risk.restore(&bet);
        report.restored += 1;
    }

    info!(
        checked = report.checked,
        restored = report.restored,
        failed_stale = report.failed_stale,
        "startup reconciliation complete"
    );
    Ok(report)
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::risk::RiskLimits;
    use crate::store::MemoryBetStore;
    use crate::types::{Bet, Side};
    use chrono::Utc;

    fn risk() -> Arc<RiskManager> {
        Arc::new(RiskManager::new(
            RiskLimits {
                kelly_fraction: 0.25,
                min_stake: 2.0,
                max_stake_per_bet: 50.0,
                max_exposure: 500.0,
                max_daily_loss: 500.0,
                max_concurrent_bets: 50,
            },
            1000.0,
            Utc::now(),
        ))
    }

    fn bet(id: &str, paper: bool, exchange_id: Option<&str>, status: BetStatus) -> Bet {
        Bet {
            id: id.to_string(),
            race_id: "race-1".to_string(),
            runner_id: "runner-1".to_string(),
            strategy_id: "strat-1".to_string(),
            side: Side::Back,
            requested_odds: 3.0,
            stake: 10.0,
            status,
            exchange_bet_id: exchange_id.map(|s| s.to_string()),
            exchange_market_id: exchange_id.map(|_| "mkt-1".to_string()),
            matched_price: None,
            matched_size: None,
            placed_at: Utc::now(),
            matched_at: None,
            settled_at: None,
            cancelled_at: None,
            realized_pnl: 0.0,
            commission: 0.0,
            paper,
        }
    }

    #[tokio::test]
    async fn stale_pending_bets_are_failed() {
        let bets: Arc<dyn BetStore> = Arc::new(MemoryBetStore::new());
        let risk = risk();

        bets.create(&bet("stale", false, None, BetStatus::Pending))
            .await
            .unwrap();

        let report = reconcile_startup(&bets, &risk, true).await.unwrap();
        assert_eq!(report.checked, 1);
        assert_eq!(report.failed_stale, 1);
        assert_eq!(report.restored, 0);

        assert_eq!(bets.get("stale").await.unwrap().status, BetStatus::Failed);
        // No reservation for a failed bet.
        assert_eq!(risk.snapshot().open_bets, 0);
    }

    #[tokio::test]
    async fn tracked_and_paper_bets_get_reservations_back() {
        let bets: Arc<dyn BetStore> = Arc::new(MemoryBetStore::new());
        let risk = risk();

        bets.create(&bet("tracked", false, Some("ex-1"), BetStatus::Matched))
            .await
            .unwrap();
        bets.create(&bet("paper", true, None, BetStatus::MatchedPaper))
            .await
            .unwrap();

        let report = reconcile_startup(&bets, &risk, true).await.unwrap();
        assert_eq!(report.restored, 2);
        assert_eq!(report.failed_stale, 0);

        let snap = risk.snapshot();
        assert_eq!(snap.open_bets, 2);
        assert!((snap.exposure - 20.0).abs() < 1e-9);

        // Statuses untouched.
        assert_eq!(bets.get("tracked").await.unwrap().status, BetStatus::Matched);
        assert_eq!(
            bets.get("paper").await.unwrap().status,
            BetStatus::MatchedPaper
        );
    }
}
