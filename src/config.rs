// =============================================================================
// Engine Configuration — validated settings with atomic save
// =============================================================================
//
// Central configuration hub for the Trapline engine. Every tunable parameter
// lives here; credentials are never stored in the file and come from the
// environment instead.
//
// Persistence uses an atomic tmp + rename pattern to prevent corruption on
// crash. All fields carry `#[serde(default)]` so that adding new fields never
// breaks loading an older config file.
// =============================================================================

use std::path::Path;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use tracing::info;

// =============================================================================
// Default-value helpers (required by serde `default = "..."` attribute)
// =============================================================================

fn default_true() -> bool {
    true
}

fn default_starting_bankroll() -> f64 {
    1000.0
}

fn default_kelly_fraction() -> f64 {
    0.25
}

fn default_min_stake() -> f64 {
    2.0
}

fn default_max_stake_per_bet() -> f64 {
    10.0
}

fn default_max_exposure() -> f64 {
    100.0
}

fn default_max_daily_loss() -> f64 {
    50.0
}

fn default_max_concurrent_bets() -> u32 {
    5
}

fn default_commission_rate() -> f64 {
    0.05
}

fn default_max_consecutive_losses() -> u32 {
    5
}

fn default_max_drawdown_percent() -> f64 {
    0.15
}

fn default_failure_window_secs() -> u64 {
    300
}

fn default_max_failures_in_window() -> u32 {
    5
}

fn default_cooldown_secs() -> u64 {
    600
}

fn default_strategy_evaluation_interval_secs() -> u64 {
    30
}

fn default_order_monitoring_interval_secs() -> u64 {
    10
}

fn default_performance_update_interval_secs() -> u64 {
    60
}

fn default_min_time_to_start_secs() -> u64 {
    120
}

fn default_lookahead_window_secs() -> u64 {
    3600
}

fn default_strategy_timeout_ms() -> u64 {
    2000
}

fn default_shutdown_drain_secs() -> u64 {
    10
}

fn default_bind_addr() -> String {
    "0.0.0.0:3001".to_string()
}

fn default_exchange_endpoint() -> String {
    "https://exchange.trapline.local".to_string()
}

// =============================================================================
// Settings
// =============================================================================

/// Top-level configuration for the Trapline engine.
///
/// Every field has a serde default so that older JSON files missing new fields
/// will still deserialise correctly.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    // --- Operating modes -----------------------------------------------------

    /// Gates real exchange submissions. When false the executor refuses every
    /// real-money order regardless of what it is asked.
    #[serde(default)]
    pub live_trading_enabled: bool,

    /// Permits simulated (paper) bet records. At least one of the two modes
    /// must be enabled.
    #[serde(default = "default_true")]
    pub paper_trading_enabled: bool,

    // --- Bankroll & staking --------------------------------------------------

    /// Bankroll at engine start, used as the Kelly base and drawdown anchor.
    #[serde(default = "default_starting_bankroll")]
    pub starting_bankroll: f64,

    /// Fractional Kelly multiplier in (0, 1].
    #[serde(default = "default_kelly_fraction")]
    pub kelly_fraction: f64,

    /// Stakes sized below this threshold are treated as "do not bet".
    #[serde(default = "default_min_stake")]
    pub min_stake: f64,

    #[serde(default = "default_max_stake_per_bet")]
    pub max_stake_per_bet: f64,

    #[serde(default = "default_max_exposure")]
    pub max_exposure: f64,

    /// Rolling daily loss cap; resets at local midnight.
    #[serde(default = "default_max_daily_loss")]
    pub max_daily_loss: f64,

    #[serde(default = "default_max_concurrent_bets")]
    pub max_concurrent_bets: u32,

    /// Exchange commission charged on winnings, in [0, 1).
    #[serde(default = "default_commission_rate")]
    pub commission_rate: f64,

    // --- Circuit breaker -----------------------------------------------------

    #[serde(default = "default_max_consecutive_losses")]
    pub max_consecutive_losses: u32,

    /// Drawdown fraction from peak bankroll that trips the breaker, in (0, 1).
    #[serde(default = "default_max_drawdown_percent")]
    pub max_drawdown_percent: f64,

    #[serde(default = "default_failure_window_secs")]
    pub failure_window_secs: u64,

    #[serde(default = "default_max_failures_in_window")]
    pub max_failures_in_window: u32,

    #[serde(default = "default_cooldown_secs")]
    pub cooldown_secs: u64,

    // --- Scheduling ----------------------------------------------------------

    #[serde(default = "default_strategy_evaluation_interval_secs")]
    pub strategy_evaluation_interval_secs: u64,

    #[serde(default = "default_order_monitoring_interval_secs")]
    pub order_monitoring_interval_secs: u64,

    #[serde(default = "default_performance_update_interval_secs")]
    pub performance_update_interval_secs: u64,

    /// No late entries: races starting sooner than this are skipped.
    #[serde(default = "default_min_time_to_start_secs")]
    pub min_time_to_start_secs: u64,

    /// How far ahead the race query looks.
    #[serde(default = "default_lookahead_window_secs")]
    pub lookahead_window_secs: u64,

    /// Per-invocation budget for one strategy evaluation; overruns are counted
    /// as failures and the strategy is skipped for the tick.
    #[serde(default = "default_strategy_timeout_ms")]
    pub strategy_timeout_ms: u64,

    /// Bounded drain deadline on shutdown.
    #[serde(default = "default_shutdown_drain_secs")]
    pub shutdown_drain_secs: u64,

    // --- Endpoints -----------------------------------------------------------

    /// Status API listen address.
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,

    /// Predictive-model service base URL; `None` disables model filtering.
    #[serde(default)]
    pub model_endpoint: Option<String>,

    /// Default model-confidence threshold applied to strategies that do not
    /// set their own, in (0, 1].
    #[serde(default)]
    pub model_confidence_threshold: Option<f64>,

    /// Betting-exchange REST base URL.
    #[serde(default = "default_exchange_endpoint")]
    pub exchange_endpoint: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            live_trading_enabled: false,
            paper_trading_enabled: true,
            starting_bankroll: default_starting_bankroll(),
            kelly_fraction: default_kelly_fraction(),
            min_stake: default_min_stake(),
            max_stake_per_bet: default_max_stake_per_bet(),
            max_exposure: default_max_exposure(),
            max_daily_loss: default_max_daily_loss(),
            max_concurrent_bets: default_max_concurrent_bets(),
            commission_rate: default_commission_rate(),
            max_consecutive_losses: default_max_consecutive_losses(),
            max_drawdown_percent: default_max_drawdown_percent(),
            failure_window_secs: default_failure_window_secs(),
            max_failures_in_window: default_max_failures_in_window(),
            cooldown_secs: default_cooldown_secs(),
            strategy_evaluation_interval_secs: default_strategy_evaluation_interval_secs(),
            order_monitoring_interval_secs: default_order_monitoring_interval_secs(),
            performance_update_interval_secs: default_performance_update_interval_secs(),
            min_time_to_start_secs: default_min_time_to_start_secs(),
            lookahead_window_secs: default_lookahead_window_secs(),
            strategy_timeout_ms: default_strategy_timeout_ms(),
            shutdown_drain_secs: default_shutdown_drain_secs(),
            bind_addr: default_bind_addr(),
            model_endpoint: None,
            model_confidence_threshold: None,
            exchange_endpoint: default_exchange_endpoint(),
        }
    }
}

impl Settings {
    /// Load configuration from a JSON file at `path`.
    ///
    /// If the file does not exist, returns an error so the caller can fall
    /// back to defaults with a warning.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config from {}", path.display()))?;

        let settings: Self = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse config from {}", path.display()))?;

        info!(
            path = %path.display(),
            live = settings.live_trading_enabled,
            paper = settings.paper_trading_enabled,
            "config loaded"
        );

        Ok(settings)
    }

    /// Persist the current configuration to `path` using an atomic write
    /// (write to `.tmp`, then rename).
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();

        let content =
            serde_json::to_string_pretty(self).context("failed to serialise config to JSON")?;

        let tmp_path = path.with_extension("json.tmp");

        std::fs::write(&tmp_path, &content)
            .with_context(|| format!("failed to write tmp config to {}", tmp_path.display()))?;

        std::fs::rename(&tmp_path, path)
            .with_context(|| format!("failed to rename tmp config to {}", path.display()))?;

        info!(path = %path.display(), "config saved (atomic)");
        Ok(())
    }

    /// Reject configurations the engine must not start with. Fatal at
    /// startup; the process exits non-zero.
    pub fn validate(&self) -> Result<()> {
        if !self.live_trading_enabled && !self.paper_trading_enabled {
            bail!("at least one of live_trading_enabled / paper_trading_enabled must be true");
        }
        if !(self.kelly_fraction > 0.0 && self.kelly_fraction <= 1.0) {
            bail!("kelly_fraction must be in (0, 1], got {}", self.kelly_fraction);
        }
        if !(self.max_drawdown_percent > 0.0 && self.max_drawdown_percent < 1.0) {
            bail!(
                "max_drawdown_percent must be in (0, 1), got {}",
                self.max_drawdown_percent
            );
        }
        if !(self.commission_rate >= 0.0 && self.commission_rate < 1.0) {
            bail!("commission_rate must be in [0, 1), got {}", self.commission_rate);
        }
        if let Some(threshold) = self.model_confidence_threshold {
            if !(threshold > 0.0 && threshold <= 1.0) {
                bail!("model_confidence_threshold must be in (0, 1], got {threshold}");
            }
        }

        for (name, value) in [
            ("starting_bankroll", self.starting_bankroll),
            ("min_stake", self.min_stake),
            ("max_stake_per_bet", self.max_stake_per_bet),
            ("max_exposure", self.max_exposure),
            ("max_daily_loss", self.max_daily_loss),
        ] {
            if value <= 0.0 {
                bail!("{name} must be strictly positive, got {value}");
            }
        }

        for (name, value) in [
            ("max_concurrent_bets", self.max_concurrent_bets as u64),
            ("max_consecutive_losses", self.max_consecutive_losses as u64),
            ("failure_window_secs", self.failure_window_secs),
            ("max_failures_in_window", self.max_failures_in_window as u64),
            ("cooldown_secs", self.cooldown_secs),
            (
                "strategy_evaluation_interval_secs",
                self.strategy_evaluation_interval_secs,
            ),
            (
                "order_monitoring_interval_secs",
                self.order_monitoring_interval_secs,
            ),
            (
                "performance_update_interval_secs",
                self.performance_update_interval_secs,
            ),
            ("min_time_to_start_secs", self.min_time_to_start_secs),
            ("lookahead_window_secs", self.lookahead_window_secs),
            ("strategy_timeout_ms", self.strategy_timeout_ms),
            ("shutdown_drain_secs", self.shutdown_drain_secs),
        ] {
            if value == 0 {
                bail!("{name} must be strictly positive");
            }
        }

        Ok(())
    }

    // --- Duration accessors --------------------------------------------------

    pub fn strategy_evaluation_interval(&self) -> Duration {
        Duration::from_secs(self.strategy_evaluation_interval_secs)
    }

    pub fn order_monitoring_interval(&self) -> Duration {
        Duration::from_secs(self.order_monitoring_interval_secs)
    }

    pub fn performance_update_interval(&self) -> Duration {
        Duration::from_secs(self.performance_update_interval_secs)
    }

    pub fn strategy_timeout(&self) -> Duration {
        Duration::from_millis(self.strategy_timeout_ms)
    }

    pub fn shutdown_drain(&self) -> Duration {
        Duration::from_secs(self.shutdown_drain_secs)
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_paper_only_and_valid() {
        let cfg = Settings::default();
        assert!(!cfg.live_trading_enabled);
        assert!(cfg.paper_trading_enabled);
        assert!((cfg.kelly_fraction - 0.25).abs() < f64::EPSILON);
        assert_eq!(cfg.max_concurrent_bets, 5);
        assert_eq!(cfg.max_consecutive_losses, 5);
        cfg.validate().unwrap();
    }

    #[test]
    fn deserialise_empty_json_uses_defaults() {
        let cfg: Settings = serde_json::from_str("{}").unwrap();
        assert!(!cfg.live_trading_enabled);
        assert!(cfg.paper_trading_enabled);
        assert_eq!(cfg.cooldown_secs, 600);
        assert_eq!(cfg.min_time_to_start_secs, 120);
        assert!(cfg.model_endpoint.is_none());
    }

    #[test]
    fn deserialise_partial_json_fills_defaults() {
        let json = r#"{ "live_trading_enabled": true, "max_stake_per_bet": 25.0 }"#;
        let cfg: Settings = serde_json::from_str(json).unwrap();
        assert!(cfg.live_trading_enabled);
        assert!((cfg.max_stake_per_bet - 25.0).abs() < f64::EPSILON);
        assert!((cfg.max_exposure - 100.0).abs() < f64::EPSILON);
        assert_eq!(cfg.max_failures_in_window, 5);
    }

    #[test]
    fn both_modes_disabled_fails_validation() {
        let cfg = Settings {
            live_trading_enabled: false,
            paper_trading_enabled: false,
            ..Settings::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn out_of_range_kelly_fraction_fails_validation() {
        let cfg = Settings {
            kelly_fraction: 1.5,
            ..Settings::default()
        };
        assert!(cfg.validate().is_err());

        let cfg = Settings {
            kelly_fraction: 0.0,
            ..Settings::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn zero_interval_fails_validation() {
        let cfg = Settings {
            order_monitoring_interval_secs: 0,
            ..Settings::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn roundtrip_serialisation() {
        let cfg = Settings::default();
        let json = serde_json::to_string(&cfg).unwrap();
        let cfg2: Settings = serde_json::from_str(&json).unwrap();
        assert_eq!(cfg.max_concurrent_bets, cfg2.max_concurrent_bets);
        assert_eq!(cfg.bind_addr, cfg2.bind_addr);
        assert!((cfg.max_daily_loss - cfg2.max_daily_loss).abs() < f64::EPSILON);
    }
}
