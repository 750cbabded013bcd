// =============================================================================
// Orchestrator — the trading loop
// =============================================================================
//
// One tick:
//   1. Skip entirely while the breaker is open.
//   2. Run the risk manager's midnight rollover check.
//   3. Load upcoming races inside [now + min_time_to_start, now + lookahead]
//      (no late entries).
//   4. Evaluate every active strategy against every race, using only odds
//      captured at or before the tick (no lookahead). Each evaluation runs on
//      a blocking thread under a timeout; a panic or overrun counts as a
//      failure and skips that strategy for the rest of the tick.
//   5. Suppress signals that duplicate a still-open bet, then filter through
//      the predictive model where configured.
//   6. Hand the surviving signals to the executor as one batch.
//
// Per-tick failures (store, model, exchange) are counted and fed to the
// breaker's failure window; they never terminate the loop.
// =============================================================================

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::{Duration as ChronoDuration, Utc};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::engine_state::EngineState;
use crate::executor::{BatchTally, Executor};
use crate::model::{ModelClient, PredictionRequest};
use crate::store::{BetStore, RaceStore, StrategyStore};
use crate::strategy::{build, Strategy};
use crate::types::{OddsTick, Race, Runner, Side, Signal, StrategyRecord};

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub evaluation_interval: std::time::Duration,
    pub min_time_to_start: ChronoDuration,
    pub lookahead_window: ChronoDuration,
    pub strategy_timeout: std::time::Duration,
}

/// What one tick did, for logging and tests.
#[derive(Debug, Clone, Default)]
pub struct TickSummary {
    pub breaker_open: bool,
    pub races: usize,
    pub signals_generated: usize,
    pub signals_executed: usize,
    pub tally: BatchTally,
}

pub struct Orchestrator {
    config: OrchestratorConfig,
    races: Arc<dyn RaceStore>,
    strategies: Arc<dyn StrategyStore>,
    bets: Arc<dyn BetStore>,
    executor: Arc<Executor>,
    model: Option<Arc<dyn ModelClient>>,
    state: Arc<EngineState>,
}

impl Orchestrator {
    pub fn new(
        config: OrchestratorConfig,
        races: Arc<dyn RaceStore>,
        strategies: Arc<dyn StrategyStore>,
        bets: Arc<dyn BetStore>,
        executor: Arc<Executor>,
        model: Option<Arc<dyn ModelClient>>,
        state: Arc<EngineState>,
    ) -> Self {
        Self {
            config,
            races,
            strategies,
            bets,
            executor,
            model,
            state,
        }
    }

    /// Run the trading loop until shutdown.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        info!(
            interval_secs = self.config.evaluation_interval.as_secs(),
            "trading loop started"
        );
        let mut ticker = tokio::time::interval(self.config.evaluation_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let summary = self.tick().await;
                    debug!(
                        breaker_open = summary.breaker_open,
                        races = summary.races,
                        signals = summary.signals_generated,
                        executed = summary.signals_executed,
                        placed = summary.tally.placed,
                        skipped = summary.tally.skipped,
                        "tick complete"
                    );
                }
                _ = shutdown.changed() => {
                    info!("trading loop stopped");
                    return;
                }
            }
        }
    }

    /// One pass of the trading loop.
    pub async fn tick(&self) -> TickSummary {
        let now = Utc::now();
        let mut summary = TickSummary::default();

        // 1. Breaker gate: nothing is evaluated while open.
        if self.state.breaker.is_open() {
            summary.breaker_open = true;
            debug!(outcome = "circuit_open", "tick skipped — breaker open");
            return summary;
        }

        // 2. Midnight rollover.
        self.state.risk.on_tick(now);

        // 3. Upcoming races, excluding late entries.
        let from = now + self.config.min_time_to_start;
        let to = now + self.config.lookahead_window;
        let races = match self.races.upcoming(from, to).await {
            Ok(races) => races,
            Err(e) => {
                warn!(error = %e, "race query failed");
                self.state.breaker.record_failure();
                return summary;
            }
        };
        summary.races = races.len();
        if races.is_empty() {
            self.state.record_tick(now, &summary.tally);
            return summary;
        }

        // 4. Active strategies, rebuilt fresh every tick.
        let records = match self.strategies.active().await {
            Ok(records) => records,
            Err(e) => {
                warn!(error = %e, "strategy query failed");
                self.state.breaker.record_failure();
                return summary;
            }
        };
        let built: Vec<(StrategyRecord, Arc<dyn Strategy>)> = records
            .iter()
            .filter_map(|r| build(r).map(|s| (r.clone(), Arc::from(s))))
            .collect();
        let record_map: HashMap<String, StrategyRecord> =
            records.into_iter().map(|r| (r.id.clone(), r)).collect();

        // 5. Evaluate, isolating each strategy invocation.
        let mut signals: Vec<Signal> = Vec::new();
        let mut skipped_strategies: HashSet<String> = HashSet::new();

        for race in &races {
            let runners = match self.races.runners(&race.id).await {
                Ok(runners) => runners,
                Err(e) => {
                    warn!(race_id = %race.id, error = %e, "runner query failed");
                    self.state.breaker.record_failure();
                    continue;
                }
            };
            let odds: Vec<OddsTick> = match self.races.odds(&race.id).await {
                Ok(odds) => odds.into_iter().filter(|t| t.captured_at <= now).collect(),
                Err(e) => {
                    warn!(race_id = %race.id, error = %e, "odds query failed");
                    self.state.breaker.record_failure();
                    continue;
                }
            };
            if odds.is_empty() {
                debug!(race_id = %race.id, "no usable odds at tick");
                continue;
            }

            for (record, strategy) in &built {
                if skipped_strategies.contains(&record.id) {
                    continue;
                }

                match evaluate_bounded(
                    strategy.clone(),
                    race.clone(),
                    runners.clone(),
                    odds.clone(),
                    self.config.strategy_timeout,
                )
                .await
                {
                    Ok(mut produced) => signals.append(&mut produced),
                    Err(reason) => {
                        warn!(
                            strategy_id = %record.id,
                            strategy = %record.name,
                            race_id = %race.id,
                            reason,
                            "strategy evaluation failed — skipped for this tick"
                        );
                        skipped_strategies.insert(record.id.clone());
                        self.state.record_strategy_failure();
                        self.state.breaker.record_failure();
                    }
                }
            }
        }
        summary.signals_generated = signals.len();

        // Suppress duplicates of still-open bets before spending model calls.
        let Some(signals) = self.suppress_open_duplicates(signals).await else {
            return summary;
        };

        // 6. Model confidence filter.
        let signals = self.model_filter(signals, &record_map).await;
        summary.signals_executed = signals.len();

        // 7. Execute.
        let (_outcomes, tally) = self.executor.execute_batch(&signals).await;
        summary.tally = tally;

        self.state.record_tick(now, &summary.tally);
        summary
    }

    /// Drop signals that duplicate an open bet on the same
    /// (race, runner, strategy). `None` aborts the tick on a store failure.
    async fn suppress_open_duplicates(&self, signals: Vec<Signal>) -> Option<Vec<Signal>> {
        if signals.is_empty() {
            return Some(signals);
        }

        let open = match self.bets.get_non_terminal().await {
            Ok(open) => open,
            Err(e) => {
                warn!(error = %e, "open-bet query failed");
                self.state.breaker.record_failure();
                return None;
            }
        };

        let open_keys: HashSet<(String, String, String)> = open
            .into_iter()
            .map(|b| (b.race_id, b.runner_id, b.strategy_id))
            .collect();

        let before = signals.len();
        let kept: Vec<Signal> = signals
            .into_iter()
            .filter(|s| {
                !open_keys.contains(&(
                    s.race_id.clone(),
                    s.runner_id.clone(),
                    s.strategy_id.clone(),
                ))
            })
            .collect();

        if kept.len() < before {
            debug!(suppressed = before - kept.len(), "duplicate signals suppressed");
        }
        Some(kept)
    }

    /// Attach model predictions and drop signals below their strategy's
    /// confidence threshold. Model errors are soft.
    async fn model_filter(
        &self,
        signals: Vec<Signal>,
        records: &HashMap<String, StrategyRecord>,
    ) -> Vec<Signal> {
        let Some(model) = &self.model else {
            return signals;
        };
        if signals.is_empty() {
            return signals;
        }

        let mut seen: HashSet<String> = HashSet::new();
        let requests: Vec<PredictionRequest> = signals
            .iter()
            .filter(|s| seen.insert(s.runner_id.clone()))
            .map(|s| PredictionRequest {
                race_id: s.race_id.clone(),
                runner_id: s.runner_id.clone(),
            })
            .collect();

        let allow_unmodelled = |s: &Signal| {
            records
                .get(&s.strategy_id)
                .map(|r| r.allow_unmodelled)
                .unwrap_or(false)
        };

        let predictions = match model.batch_predict(&requests).await {
            Ok(predictions) => predictions,
            Err(e) => {
                warn!(error = %e, "model unavailable — falling back per strategy");
                self.state.record_model_failure();
                return signals.into_iter().filter(|s| allow_unmodelled(s)).collect();
            }
        };

        let by_runner: HashMap<&str, _> = predictions
            .iter()
            .map(|p| (p.runner_id.as_str(), p))
            .collect();

        signals
            .into_iter()
            .filter_map(|mut s| {
                let threshold = records
                    .get(&s.strategy_id)
                    .and_then(|r| r.model_confidence_threshold);

                match by_runner.get(s.runner_id.as_str()) {
                    Some(p) => {
                        // The model speaks about the runner winning; a lay
                        // signal wins when the runner does not.
                        s.probability = match s.side {
                            Side::Back => p.probability,
                            Side::Lay => 1.0 - p.probability,
                        };
                        s.confidence = Some(p.confidence);
                        if let Some(threshold) = threshold {
                            if p.confidence < threshold {
                                debug!(
                                    runner_id = %s.runner_id,
                                    confidence = p.confidence,
                                    threshold,
                                    "signal dropped — model confidence below threshold"
                                );
                                return None;
                            }
                        }
                        Some(s)
                    }
                    None if allow_unmodelled(&s) => Some(s),
                    None => {
                        debug!(runner_id = %s.runner_id, "signal dropped — no prediction");
                        None
                    }
                }
            })
            .collect()
    }
}

/// Run one strategy evaluation on a blocking thread under a time budget.
/// Returns the failure reason when the invocation panicked or overran.
pub(crate) async fn evaluate_bounded(
    strategy: Arc<dyn Strategy>,
    race: Race,
    runners: Vec<Runner>,
    odds: Vec<OddsTick>,
    budget: std::time::Duration,
) -> Result<Vec<Signal>, &'static str> {
    let handle =
        tokio::task::spawn_blocking(move || strategy.evaluate(&race, &runners, &odds));

    match tokio::time::timeout(budget, handle).await {
        Ok(Ok(signals)) => Ok(signals),
        Ok(Err(join_err)) if join_err.is_panic() => Err("panicked"),
        Ok(Err(_)) => Err("cancelled"),
        Err(_) => Err("timed out"),
    }
}
