// =============================================================================
// Circuit Breaker — halts trading when loss signals exceed bounds
// =============================================================================
//
// State machine over bet outcomes and system failures:
//
//   Closed ──(trip)──▶ Open ──(cooldown)──▶ HalfOpen ──(settled win)──▶ Closed
//                        ▲                      │
//                        └──(loss / failure)────┘
//
// Trip conditions while Closed:
//   1. Consecutive settled losses reach the configured threshold.
//   2. Drawdown from peak bankroll exceeds the configured fraction.
//   3. System failures within the rolling window reach the configured count.
//
// HalfOpen admits exactly one probe bet. Recovery requires a settled win;
// a successful placement alone proves nothing about the loss streak that
// opened the breaker.
//
// Shutdown callbacks fire exactly once per entry into Open, outside the
// mutex. They must be non-blocking and idempotent.
// =============================================================================

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::types::{Bet, BetStatus};

// ---------------------------------------------------------------------------
// Public types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BreakerState {
    Closed,
    HalfOpen,
    Open,
}

impl std::fmt::Display for BreakerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Closed => write!(f, "Closed"),
            Self::HalfOpen => write!(f, "HalfOpen"),
            Self::Open => write!(f, "Open"),
        }
    }
}

/// Trip thresholds supplied at construction time.
#[derive(Debug, Clone)]
pub struct BreakerConfig {
    pub max_consecutive_losses: u32,
    /// Fraction of peak bankroll; drawdown strictly greater trips the breaker.
    pub max_drawdown_percent: f64,
    pub failure_window: Duration,
    pub max_failures_in_window: u32,
    pub cooldown: Duration,
}

/// Serialisable view of the breaker for the status API.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BreakerSnapshot {
    pub state: BreakerState,
    pub consecutive_losses: u32,
    pub drawdown: f64,
    pub failures_in_window: u32,
    pub peak_bankroll: f64,
    pub current_bankroll: f64,
    pub opened_at: Option<DateTime<Utc>>,
    pub cooldown_until: Option<DateTime<Utc>>,
}

/// Fan-out shutdown hook invoked when the breaker opens.
pub type ShutdownCallback = Arc<dyn Fn() + Send + Sync>;

// ---------------------------------------------------------------------------
// Internal mutable state (behind the mutex)
// ---------------------------------------------------------------------------

struct Inner {
    state: BreakerState,
    consecutive_losses: u32,
    peak_bankroll: f64,
    current_bankroll: f64,
    failures: Vec<DateTime<Utc>>,
    opened_at: Option<DateTime<Utc>>,
    cooldown_until: Option<DateTime<Utc>>,
    /// Whether the single HalfOpen probe has been handed out.
    probe_inflight: bool,
}

impl Inner {
    fn drawdown(&self) -> f64 {
        if self.peak_bankroll <= 0.0 {
            return 0.0;
        }
        ((self.peak_bankroll - self.current_bankroll) / self.peak_bankroll).clamp(0.0, 1.0)
    }

    fn prune_failures(&mut self, window: Duration, now: DateTime<Utc>) {
        let cutoff = now - window;
        self.failures.retain(|t| *t > cutoff);
    }
}

// ---------------------------------------------------------------------------
// Circuit Breaker
// ---------------------------------------------------------------------------

pub struct CircuitBreaker {
    config: BreakerConfig,
    inner: Mutex<Inner>,
    callbacks: Mutex<Vec<ShutdownCallback>>,
}

impl CircuitBreaker {
    pub fn new(config: BreakerConfig, starting_bankroll: f64) -> Self {
        info!(
            max_consecutive_losses = config.max_consecutive_losses,
            max_drawdown_percent = config.max_drawdown_percent,
            max_failures_in_window = config.max_failures_in_window,
            failure_window_secs = config.failure_window.num_seconds(),
            cooldown_secs = config.cooldown.num_seconds(),
            "CircuitBreaker initialised"
        );

        Self {
            config,
            inner: Mutex::new(Inner {
                state: BreakerState::Closed,
                consecutive_losses: 0,
                peak_bankroll: starting_bankroll,
                current_bankroll: starting_bankroll,
                failures: Vec::new(),
                opened_at: None,
                cooldown_until: None,
                probe_inflight: false,
            }),
            callbacks: Mutex::new(Vec::new()),
        }
    }

    // -------------------------------------------------------------------------
    // Outcome feed (monitor, in settlement order)
    // -------------------------------------------------------------------------

    /// Record a settled bet outcome together with the bankroll as of that
    /// settlement. Must be fed in chronological settlement order so streak
    /// counters and intermediate peaks are deterministic.
    pub fn record_outcome(&self, bet: &Bet, current_bankroll: f64) {
        let won = match bet.status {
            BetStatus::SettledWin => true,
            BetStatus::SettledLoss => false,
            other => {
                debug!(bet_id = %bet.id, status = %other, "ignoring non-settled outcome");
                return;
            }
        };

        let now = Utc::now();
        let mut inner = self.inner.lock();
        self.tick_cooldown(&mut inner, now);

        inner.current_bankroll = current_bankroll;
        if current_bankroll > inner.peak_bankroll {
            inner.peak_bankroll = current_bankroll;
        }

        if won {
            inner.consecutive_losses = 0;
        } else {
            inner.consecutive_losses += 1;
        }

        let opened = match inner.state {
            BreakerState::Closed => {
                if inner.consecutive_losses >= self.config.max_consecutive_losses {
                    let reason = format!("{} consecutive losses", inner.consecutive_losses);
                    self.open(&mut inner, now, &reason)
                } else if inner.drawdown() > self.config.max_drawdown_percent {
                    let reason = format!("drawdown {:.4} from peak", inner.drawdown());
                    self.open(&mut inner, now, &reason)
                } else {
                    false
                }
            }
            BreakerState::HalfOpen => {
                inner.probe_inflight = false;
                if won {
                    self.close(&mut inner, "probe bet settled as a win");
                    false
                } else {
                    self.open(&mut inner, now, "probe bet settled as a loss")
                }
            }
            BreakerState::Open => false,
        };

        drop(inner);
        if opened {
            self.fire_callbacks();
        }
    }

    // -------------------------------------------------------------------------
    // System failure feed (any component)
    // -------------------------------------------------------------------------

    /// Record a system-level (not financial) failure event.
    pub fn record_failure(&self) {
        let now = Utc::now();
        let mut inner = self.inner.lock();
        self.tick_cooldown(&mut inner, now);

        inner.failures.push(now);
        inner.prune_failures(self.config.failure_window, now);

        let opened = match inner.state {
            BreakerState::Closed => {
                if inner.failures.len() as u32 >= self.config.max_failures_in_window {
                    let reason = format!("{} failures within window", inner.failures.len());
                    self.open(&mut inner, now, &reason)
                } else {
                    false
                }
            }
            BreakerState::HalfOpen => {
                inner.probe_inflight = false;
                self.open(&mut inner, now, "failure while half-open")
            }
            BreakerState::Open => false,
        };

        drop(inner);
        if opened {
            self.fire_callbacks();
        }
    }

    /// Record a system-level success. Closes the breaker from HalfOpen when
    /// the trip was failure-driven rather than financial.
    pub fn record_success(&self) {
        let now = Utc::now();
        let mut inner = self.inner.lock();
        self.tick_cooldown(&mut inner, now);

        if inner.state == BreakerState::HalfOpen {
            inner.probe_inflight = false;
            self.close(&mut inner, "success signal while half-open");
        }
    }

    // -------------------------------------------------------------------------
    // Readers
    // -------------------------------------------------------------------------

    pub fn state(&self) -> BreakerState {
        let mut inner = self.inner.lock();
        self.tick_cooldown(&mut inner, Utc::now());
        inner.state
    }

    pub fn is_open(&self) -> bool {
        self.state() == BreakerState::Open
    }

    /// Whether the executor may run a signal right now. Closed always allows;
    /// Open always refuses; HalfOpen hands out exactly one probe until it is
    /// resolved by an outcome, failure or success.
    pub fn allow_execution(&self) -> bool {
        let mut inner = self.inner.lock();
        self.tick_cooldown(&mut inner, Utc::now());

        match inner.state {
            BreakerState::Closed => true,
            BreakerState::Open => false,
            BreakerState::HalfOpen => {
                if inner.probe_inflight {
                    false
                } else {
                    inner.probe_inflight = true;
                    debug!("half-open probe admitted");
                    true
                }
            }
        }
    }

    /// Hand back a probe admitted by `allow_execution` that never turned into
    /// a bet (e.g. the reservation was rejected), so the next signal can
    /// claim it.
    pub fn release_probe(&self) {
        let mut inner = self.inner.lock();
        if inner.state == BreakerState::HalfOpen {
            inner.probe_inflight = false;
        }
    }

    pub fn snapshot(&self) -> BreakerSnapshot {
        let mut inner = self.inner.lock();
        let now = Utc::now();
        self.tick_cooldown(&mut inner, now);
        inner.prune_failures(self.config.failure_window, now);

        BreakerSnapshot {
            state: inner.state,
            consecutive_losses: inner.consecutive_losses,
            drawdown: inner.drawdown(),
            failures_in_window: inner.failures.len() as u32,
            peak_bankroll: inner.peak_bankroll,
            current_bankroll: inner.current_bankroll,
            opened_at: inner.opened_at,
            cooldown_until: inner.cooldown_until,
        }
    }

    // -------------------------------------------------------------------------
    // Control
    // -------------------------------------------------------------------------

    /// Register a shutdown hook fired on every entry into Open.
    pub fn register_shutdown(&self, callback: ShutdownCallback) {
        self.callbacks.lock().push(callback);
    }

    /// Privileged manual transition back to Closed; clears all counters and
    /// the cooldown.
    pub fn reset(&self) {
        let mut inner = self.inner.lock();
        warn!("circuit breaker manually reset");
        inner.failures.clear();
        self.close(&mut inner, "manual reset");
    }

    // -------------------------------------------------------------------------
    // Internals
    // -------------------------------------------------------------------------

    /// Lazily move Open → HalfOpen once the cooldown deadline has passed.
    fn tick_cooldown(&self, inner: &mut Inner, now: DateTime<Utc>) {
        if inner.state == BreakerState::Open {
            if let Some(deadline) = inner.cooldown_until {
                if now >= deadline {
                    inner.state = BreakerState::HalfOpen;
                    inner.probe_inflight = false;
                    info!("cooldown elapsed — breaker half-open");
                }
            }
        }
    }

    /// Returns true when this call performed the Closed/HalfOpen → Open
    /// transition; the caller fires callbacks after releasing the lock.
    fn open(&self, inner: &mut Inner, now: DateTime<Utc>, reason: &str) -> bool {
        if inner.state == BreakerState::Open {
            return false;
        }
        inner.state = BreakerState::Open;
        inner.opened_at = Some(now);
        inner.cooldown_until = Some(now + self.config.cooldown);
        inner.probe_inflight = false;
        warn!(
            reason,
            cooldown_until = %inner.cooldown_until.map(|t| t.to_rfc3339()).unwrap_or_default(),
            "circuit breaker OPEN — trading halted"
        );
        true
    }

    fn close(&self, inner: &mut Inner, reason: &str) {
        inner.state = BreakerState::Closed;
        inner.consecutive_losses = 0;
        inner.opened_at = None;
        inner.cooldown_until = None;
        inner.probe_inflight = false;
        info!(reason, "circuit breaker closed");
    }

    fn fire_callbacks(&self) {
        let callbacks: Vec<ShutdownCallback> = self.callbacks.lock().clone();
        for cb in callbacks {
            cb();
        }
    }
}

impl std::fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let snap = self.snapshot();
        f.debug_struct("CircuitBreaker")
            .field("state", &snap.state)
            .field("consecutive_losses", &snap.consecutive_losses)
            .field("drawdown", &snap.drawdown)
            .field("failures_in_window", &snap.failures_in_window)
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Side;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn config() -> BreakerConfig {
        BreakerConfig {
            max_consecutive_losses: 3,
            max_drawdown_percent: 0.15,
            failure_window: Duration::seconds(60),
            max_failures_in_window: 3,
            cooldown: Duration::milliseconds(30),
        }
    }

    fn settled(status: BetStatus, pnl: f64) -> Bet {
        Bet {
            id: uuid::Uuid::new_v4().to_string(),
            race_id: "race-1".to_string(),
            runner_id: "runner-1".to_string(),
            strategy_id: "strat-1".to_string(),
            side: Side::Back,
            requested_odds: 3.0,
            stake: 10.0,
            status,
            exchange_bet_id: None,
            exchange_market_id: None,
            matched_price: Some(3.0),
            matched_size: Some(10.0),
            placed_at: Utc::now(),
            matched_at: Some(Utc::now()),
            settled_at: Some(Utc::now()),
            cancelled_at: None,
            realized_pnl: pnl,
            commission: 0.0,
            paper: true,
        }
    }

    #[test]
    fn consecutive_losses_trip_and_callbacks_fire_once() {
        let cb = CircuitBreaker::new(config(), 1000.0);
        let fired = Arc::new(AtomicU32::new(0));
        let counter = fired.clone();
        cb.register_shutdown(Arc::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        }));

        let mut bankroll = 1000.0;
        for i in 0..3 {
            bankroll -= 10.0;
            cb.record_outcome(&settled(BetStatus::SettledLoss, -10.0), bankroll);
            if i < 2 {
                assert_eq!(cb.state(), BreakerState::Closed);
            }
        }

        assert_eq!(cb.state(), BreakerState::Open);
        assert!(!cb.allow_execution());
        assert_eq!(fired.load(Ordering::SeqCst), 1);

        // Further losses while open do not re-fire the callbacks.
        cb.record_outcome(&settled(BetStatus::SettledLoss, -10.0), bankroll - 10.0);
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn win_resets_loss_streak() {
        let cb = CircuitBreaker::new(config(), 1000.0);
        cb.record_outcome(&settled(BetStatus::SettledLoss, -10.0), 990.0);
        cb.record_outcome(&settled(BetStatus::SettledLoss, -10.0), 980.0);
        cb.record_outcome(&settled(BetStatus::SettledWin, 20.0), 1000.0);
        cb.record_outcome(&settled(BetStatus::SettledLoss, -10.0), 990.0);
        cb.record_outcome(&settled(BetStatus::SettledLoss, -10.0), 980.0);
        assert_eq!(cb.state(), BreakerState::Closed);
    }

    #[test]
    fn drawdown_trips_only_past_threshold() {
        let cb = CircuitBreaker::new(
            BreakerConfig {
                max_consecutive_losses: 100,
                ..config()
            },
            1000.0,
        );

        // Down 150 from a 1000 peak: drawdown exactly 0.15, still closed.
        cb.record_outcome(&settled(BetStatus::SettledLoss, -150.0), 850.0);
        assert_eq!(cb.state(), BreakerState::Closed);

        // The next loss pushes drawdown to 0.16 → open.
        cb.record_outcome(&settled(BetStatus::SettledLoss, -10.0), 840.0);
        assert_eq!(cb.state(), BreakerState::Open);
    }

    #[test]
    fn drawdown_uses_intermediate_peak() {
        let cb = CircuitBreaker::new(
            BreakerConfig {
                max_consecutive_losses: 100,
                ..config()
            },
            1000.0,
        );

        // Bankroll rises to 1200 first; the peak moves with it.
        cb.record_outcome(&settled(BetStatus::SettledWin, 200.0), 1200.0);
        // 1010 is only 1% below the starting bankroll but 15.8% below the
        // 1200 peak → open.
        cb.record_outcome(&settled(BetStatus::SettledLoss, -190.0), 1010.0);
        assert_eq!(cb.state(), BreakerState::Open);
    }

    #[test]
    fn failure_window_trips() {
        let cb = CircuitBreaker::new(config(), 1000.0);
        cb.record_failure();
        cb.record_failure();
        assert_eq!(cb.state(), BreakerState::Closed);
        cb.record_failure();
        assert_eq!(cb.state(), BreakerState::Open);
    }

    #[test]
    fn cooldown_half_opens_and_probe_is_single_admission() {
        let cb = CircuitBreaker::new(config(), 1000.0);
        for _ in 0..3 {
            cb.record_failure();
        }
        assert_eq!(cb.state(), BreakerState::Open);
        assert!(!cb.allow_execution());

        std::thread::sleep(std::time::Duration::from_millis(50));
        assert_eq!(cb.state(), BreakerState::HalfOpen);

        // Exactly one probe gets through.
        assert!(cb.allow_execution());
        assert!(!cb.allow_execution());
    }

    #[test]
    fn half_open_win_closes_and_loss_reopens() {
        let cb = CircuitBreaker::new(config(), 1000.0);
        for _ in 0..3 {
            cb.record_failure();
        }
        std::thread::sleep(std::time::Duration::from_millis(50));
        assert!(cb.allow_execution());

        // Probe loss → straight back to Open with a fresh cooldown.
        cb.record_outcome(&settled(BetStatus::SettledLoss, -10.0), 990.0);
        assert_eq!(cb.state(), BreakerState::Open);

        std::thread::sleep(std::time::Duration::from_millis(50));
        assert!(cb.allow_execution());

        // Probe win → Closed with counters zeroed.
        cb.record_outcome(&settled(BetStatus::SettledWin, 20.0), 1010.0);
        assert_eq!(cb.state(), BreakerState::Closed);
        assert_eq!(cb.snapshot().consecutive_losses, 0);
        assert!(cb.allow_execution());
    }

    #[test]
    fn record_success_closes_from_half_open() {
        let cb = CircuitBreaker::new(config(), 1000.0);
        for _ in 0..3 {
            cb.record_failure();
        }
        std::thread::sleep(std::time::Duration::from_millis(50));
        assert_eq!(cb.state(), BreakerState::HalfOpen);

        cb.record_success();
        assert_eq!(cb.state(), BreakerState::Closed);
    }

    #[test]
    fn manual_reset_clears_everything() {
        let cb = CircuitBreaker::new(config(), 1000.0);
        for _ in 0..3 {
            cb.record_failure();
        }
        assert!(cb.is_open());

        cb.reset();
        assert_eq!(cb.state(), BreakerState::Closed);
        let snap = cb.snapshot();
        assert_eq!(snap.consecutive_losses, 0);
        assert_eq!(snap.failures_in_window, 0);
        assert!(snap.cooldown_until.is_none());
        assert!(cb.allow_execution());
    }

    #[test]
    fn reopening_fires_callbacks_again() {
        let cb = CircuitBreaker::new(config(), 1000.0);
        let fired = Arc::new(AtomicU32::new(0));
        let counter = fired.clone();
        cb.register_shutdown(Arc::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        }));

        for _ in 0..3 {
            cb.record_failure();
        }
        assert_eq!(fired.load(Ordering::SeqCst), 1);

        std::thread::sleep(std::time::Duration::from_millis(50));
        assert!(cb.allow_execution());
        cb.record_failure(); // probe fails while half-open
        assert_eq!(fired.load(Ordering::SeqCst), 2);
    }
}
