// =============================================================================
// Trapline — Main Entry Point
// =============================================================================
//
// Startup ordering is deterministic; every step completes before the next:
// config → stores → model client → circuit breaker → risk manager → monitor
// (with the breaker injected) → exchange login (live mode) → executor →
// order poller → emergency-stop registration → reconciliation → tasks.
//
// The engine exits 0 on a clean shutdown and non-zero when config
// validation, store initialisation or exchange login fails.
// =============================================================================

// ── Module declarations ──────────────────────────────────────────────────────
mod api;
mod breaker;
mod config;
mod engine_state;
mod exchange;
mod executor;
mod model;
mod monitor;
mod orchestrator;
mod poller;
mod reconcile;
mod risk;
mod store;
mod strategy;
mod types;

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Context;
use chrono::{Duration as ChronoDuration, Utc};
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::breaker::{BreakerConfig, CircuitBreaker};
use crate::config::Settings;
use crate::engine_state::EngineState;
use crate::exchange::{rest::RestExchangeClient, ExchangeClient};
use crate::executor::Executor;
use crate::model::{ModelClient, RestModelClient};
use crate::monitor::PerformanceMonitor;
use crate::orchestrator::{Orchestrator, OrchestratorConfig};
use crate::poller::OrderPoller;
use crate::risk::{RiskLimits, RiskManager};
use crate::store::{
    BetStore, MemoryBetStore, MemoryPerformanceStore, MemoryRaceStore, MemoryStrategyStore,
    PerformanceStore, RaceStore, StrategyStore,
};
use crate::types::StrategyRecord;

const CONFIG_PATH: &str = "trapline.json";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ── 1. Environment & logging ─────────────────────────────────────────
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("╔══════════════════════════════════════════════════════════╗");
    info!("║              Trapline — Starting Up                      ║");
    info!("╚══════════════════════════════════════════════════════════╝");

    // ── 2. Config (validation failures are fatal) ────────────────────────
    let settings = Settings::load(CONFIG_PATH).unwrap_or_else(|e| {
        warn!(error = %e, "failed to load config — using defaults");
        Settings::default()
    });
    settings.validate().context("config validation failed")?;

    info!(
        live = settings.live_trading_enabled,
        paper = settings.paper_trading_enabled,
        bankroll = settings.starting_bankroll,
        "engine mode resolved"
    );

    // ── 3. Stores ────────────────────────────────────────────────────────
    // In-memory stores back paper mode; database-backed implementations of
    // the same traits plug in here for production.
    let bet_store: Arc<dyn BetStore> = Arc::new(MemoryBetStore::new());
    let race_store: Arc<dyn RaceStore> = Arc::new(MemoryRaceStore::new());
    let performance_store: Arc<dyn PerformanceStore> = Arc::new(MemoryPerformanceStore::new());
    let strategy_store = Arc::new(MemoryStrategyStore::new());
    seed_builtin_strategies(&strategy_store, &settings);
    let strategy_store: Arc<dyn StrategyStore> = strategy_store;

    // ── 4. Model client (optional) ───────────────────────────────────────
    let model: Option<Arc<dyn ModelClient>> = settings.model_endpoint.as_ref().map(|endpoint| {
        info!(endpoint = %endpoint, "model filtering enabled");
        Arc::new(RestModelClient::new(endpoint.clone())) as Arc<dyn ModelClient>
    });

    let now = Utc::now();

    // ── 5. Circuit breaker (constructed before everything that feeds it) ─
    let breaker = Arc::new(CircuitBreaker::new(
        BreakerConfig {
            max_consecutive_losses: settings.max_consecutive_losses,
            max_drawdown_percent: settings.max_drawdown_percent,
            failure_window: ChronoDuration::seconds(settings.failure_window_secs as i64),
            max_failures_in_window: settings.max_failures_in_window,
            cooldown: ChronoDuration::seconds(settings.cooldown_secs as i64),
        },
        settings.starting_bankroll,
    ));

    // ── 6. Risk manager ──────────────────────────────────────────────────
    let risk = Arc::new(RiskManager::new(
        RiskLimits {
            kelly_fraction: settings.kelly_fraction,
            min_stake: settings.min_stake,
            max_stake_per_bet: settings.max_stake_per_bet,
            max_exposure: settings.max_exposure,
            max_daily_loss: settings.max_daily_loss,
            max_concurrent_bets: settings.max_concurrent_bets,
        },
        settings.starting_bankroll,
        now,
    ));

    // ── 7. Performance monitor (breaker injected) ────────────────────────
    let monitor = Arc::new(PerformanceMonitor::new(
        bet_store.clone(),
        performance_store.clone(),
        breaker.clone(),
        settings.starting_bankroll,
        settings.performance_update_interval(),
        now,
    ));

    // ── 8. Exchange client; login is fatal in live mode ──────────────────
    let api_key = std::env::var("TRAPLINE_EXCHANGE_KEY").unwrap_or_default();
    let api_secret = std::env::var("TRAPLINE_EXCHANGE_SECRET").unwrap_or_default();
    let exchange: Arc<dyn ExchangeClient> = Arc::new(RestExchangeClient::new(
        settings.exchange_endpoint.clone(),
        api_key,
        api_secret,
    ));

    if settings.live_trading_enabled {
        exchange
            .login()
            .await
            .map_err(|e| anyhow::anyhow!("exchange login failed: {e}"))?;
    }

    // ── 9. Executor ──────────────────────────────────────────────────────
    let executor = Arc::new(Executor::new(
        bet_store.clone(),
        exchange.clone(),
        risk.clone(),
        breaker.clone(),
        settings.live_trading_enabled,
        settings.paper_trading_enabled,
    ));

    // ── 10. Order poller (also settles paper bets from race results) ─────
    let order_poller = Arc::new(OrderPoller::new(
        bet_store.clone(),
        race_store.clone(),
        exchange.clone(),
        risk.clone(),
        breaker.clone(),
        settings.commission_rate,
        settings.order_monitoring_interval(),
    ));

    // ── 11. Emergency stop wiring ────────────────────────────────────────
    {
        let executor = executor.clone();
        breaker.register_shutdown(Arc::new(move || executor.emergency_stop()));
    }

    // ── 12. Reconcile bets left over from a previous run ─────────────────
    reconcile::reconcile_startup(&bet_store, &risk, settings.live_trading_enabled)
        .await
        .context("startup reconciliation failed")?;

    // ── 13. Status API ───────────────────────────────────────────────────
    let state = Arc::new(EngineState::new(risk.clone(), breaker.clone()));
    let listener = tokio::net::TcpListener::bind(&settings.bind_addr)
        .await
        .with_context(|| format!("failed to bind status API to {}", settings.bind_addr))?;
    info!(addr = %settings.bind_addr, "status API listening");

    let api_state = state.clone();
    tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, api::rest::router(api_state)).await {
            error!(error = %e, "status API server failed");
        }
    });

    // ── 14. Background tasks with cooperative shutdown ───────────────────
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let monitor_handle = tokio::spawn(monitor.clone().run(shutdown_rx.clone()));
    let poller_handle = tokio::spawn(order_poller.clone().run(shutdown_rx.clone()));

    let orchestrator = Arc::new(Orchestrator::new(
        OrchestratorConfig {
            evaluation_interval: settings.strategy_evaluation_interval(),
            min_time_to_start: ChronoDuration::seconds(settings.min_time_to_start_secs as i64),
            lookahead_window: ChronoDuration::seconds(settings.lookahead_window_secs as i64),
            strategy_timeout: settings.strategy_timeout(),
        },
        race_store.clone(),
        strategy_store.clone(),
        bet_store.clone(),
        executor.clone(),
        model,
        state.clone(),
    ));
    let loop_handle = tokio::spawn(orchestrator.run(shutdown_rx));

    info!("All subsystems running. Press Ctrl+C to stop.");

    // ── 15. Graceful shutdown with a bounded drain ───────────────────────
    wait_for_shutdown_signal().await?;
    warn!("Shutdown signal received — stopping gracefully");
    let _ = shutdown_tx.send(true);

    let drained = tokio::time::timeout(settings.shutdown_drain(), async {
        let _ = tokio::join!(loop_handle, monitor_handle, poller_handle);
    })
    .await;
    if drained.is_err() {
        warn!(
            deadline_secs = settings.shutdown_drain_secs,
            "drain deadline elapsed — abandoning background tasks"
        );
    }

    if settings.live_trading_enabled {
        if let Err(e) = exchange.logout().await {
            error!(error = %e, "exchange logout failed");
        }
    }

    info!("Trapline shut down complete.");
    Ok(())
}

/// Register the built-in strategies until an external registry is attached.
fn seed_builtin_strategies(store: &MemoryStrategyStore, settings: &Settings) {
    for (id, name) in [
        ("builtin-form-value", strategy::FormValue::NAME),
        ("builtin-drift-lay", strategy::DriftLay::NAME),
    ] {
        store.upsert(StrategyRecord {
            id: id.to_string(),
            name: name.to_string(),
            params: HashMap::new(),
            active: true,
            version: 1,
            model_confidence_threshold: settings.model_confidence_threshold,
            allow_unmodelled: true,
        });
    }
}

/// Wait for SIGINT or SIGTERM.
#[cfg(unix)]
async fn wait_for_shutdown_signal() -> anyhow::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};
    let mut sigterm = signal(SignalKind::terminate()).context("installing SIGTERM handler")?;

    tokio::select! {
        result = tokio::signal::ctrl_c() => result.context("waiting for SIGINT")?,
        _ = sigterm.recv() => {}
    }
    Ok(())
}

#[cfg(not(unix))]
async fn wait_for_shutdown_signal() -> anyhow::Result<()> {
    tokio::signal::ctrl_c().await.context("waiting for SIGINT")?;
    Ok(())
}
