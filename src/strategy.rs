// =============================================================================
// Strategy layer — pluggable signal generators over race cards
// =============================================================================
//
// Strategies are pure CPU: given a race, its runners and the odds at the
// tick, they return zero or more signals. They hold no mutable state and are
// rebuilt from their store records at the start of every tick, so activation,
// deactivation and parameter changes take effect between ticks.
//
// Built-ins:
//   form-value — rating-derived win probabilities vs. implied probability
//                from the back price; backs runners priced longer than the
//                form says they should be.
//   drift-lay  — lays favourites whose implied probability exceeds the
//                rating-derived probability by a margin.
// =============================================================================

use std::collections::HashMap;

use tracing::warn;

use crate::types::{OddsTick, Race, Runner, Side, Signal, StrategyRecord};

/// A signal generator. Implementations must not share mutable state; each
/// invocation is bounded in time by the orchestrator.
pub trait Strategy: Send + Sync {
    fn name(&self) -> &str;

    fn evaluate(&self, race: &Race, runners: &[Runner], odds: &[OddsTick]) -> Vec<Signal>;
}

/// Build a strategy from its registration record. Unknown names are logged
/// and skipped for the tick.
pub fn build(record: &StrategyRecord) -> Option<Box<dyn Strategy>> {
    match record.name.as_str() {
        FormValue::NAME => Some(Box::new(FormValue::from_record(record))),
        DriftLay::NAME => Some(Box::new(DriftLay::from_record(record))),
        other => {
            warn!(strategy_id = %record.id, name = other, "unknown strategy name — skipped");
            None
        }
    }
}

fn param(record: &StrategyRecord, key: &str, default: f64) -> f64 {
    record.params.get(key).copied().unwrap_or(default)
}

/// Win probability per runner from form ratings: `r^gamma / Σ r^gamma`.
/// Returns an empty map when no runner carries a usable rating.
fn rating_probabilities(runners: &[Runner], gamma: f64) -> HashMap<String, f64> {
    let total: f64 = runners
        .iter()
        .filter(|r| r.form_rating > 0.0)
        .map(|r| r.form_rating.powf(gamma))
        .sum();
    if total <= 0.0 {
        return HashMap::new();
    }

    runners
        .iter()
        .filter(|r| r.form_rating > 0.0)
        .map(|r| (r.id.clone(), r.form_rating.powf(gamma) / total))
        .collect()
}

/// Edge per unit stake at decimal odds `o` for win probability `p`.
fn edge(odds: f64, probability: f64) -> f64 {
    (odds - 1.0) * probability - (1.0 - probability)
}

// ---------------------------------------------------------------------------
// form-value
// ---------------------------------------------------------------------------

pub struct FormValue {
    strategy_id: String,
    /// Rating-to-probability sharpening exponent.
    gamma: f64,
    /// Minimum edge per unit stake to emit a signal.
    min_edge: f64,
    /// Long-shot cutoff: prices above this are ignored.
    max_odds: f64,
}

impl FormValue {
    pub const NAME: &'static str = "form-value";

    pub fn from_record(record: &StrategyRecord) -> Self {
        Self {
            strategy_id: record.id.clone(),
            gamma: param(record, "gamma", 1.0),
            min_edge: param(record, "min_edge", 0.05),
            max_odds: param(record, "max_odds", 12.0),
        }
    }
}

impl Strategy for FormValue {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn evaluate(&self, race: &Race, runners: &[Runner], odds: &[OddsTick]) -> Vec<Signal> {
        let probabilities = rating_probabilities(runners, self.gamma);
        if probabilities.is_empty() {
            return Vec::new();
        }

        let mut signals = Vec::new();
        for tick in odds {
            if tick.back_price <= 1.0 || tick.back_price > self.max_odds {
                continue;
            }
            let Some(&p) = probabilities.get(&tick.runner_id) else {
                continue;
            };

            let e = edge(tick.back_price, p);
            if e >= self.min_edge {
                signals.push(Signal {
                    race_id: race.id.clone(),
                    runner_id: tick.runner_id.clone(),
                    strategy_id: self.strategy_id.clone(),
                    side: Side::Back,
                    edge: e,
                    probability: p,
                    odds: tick.back_price,
                    confidence: None,
                });
            }
        }
        signals
    }
}

// ---------------------------------------------------------------------------
// drift-lay
// ---------------------------------------------------------------------------

pub struct DriftLay {
    strategy_id: String,
    gamma: f64,
    /// How far the implied probability must exceed the rating probability.
    min_margin: f64,
    /// Only lay prices at or below this (liability control).
    max_lay_odds: f64,
}

impl DriftLay {
    pub const NAME: &'static str = "drift-lay";

    pub fn from_record(record: &StrategyRecord) -> Self {
        Self {
            strategy_id: record.id.clone(),
            gamma: param(record, "gamma", 1.0),
            min_margin: param(record, "min_margin", 0.1),
            max_lay_odds: param(record, "max_lay_odds", 4.0),
        }
    }
}

impl Strategy for DriftLay {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn evaluate(&self, race: &Race, runners: &[Runner], odds: &[OddsTick]) -> Vec<Signal> {
        let probabilities = rating_probabilities(runners, self.gamma);
        if probabilities.is_empty() {
            return Vec::new();
        }

        // Only the market favourite (shortest lay price) is a lay candidate.
        let Some(favourite) = odds
            .iter()
            .filter(|t| t.lay_price > 1.0)
            .min_by(|a, b| a.lay_price.total_cmp(&b.lay_price))
        else {
            return Vec::new();
        };

        if favourite.lay_price > self.max_lay_odds {
            return Vec::new();
        }
        let Some(&p_win) = probabilities.get(&favourite.runner_id) else {
            return Vec::new();
        };

        let implied = 1.0 / favourite.lay_price;
        if implied - p_win < self.min_margin {
            return Vec::new();
        }

        // The lay proposition wins when the runner loses.
        let p_lay = 1.0 - p_win;
        let e = edge(favourite.lay_price, p_lay);
        if e <= 0.0 {
            return Vec::new();
        }

        vec![Signal {
            race_id: race.id.clone(),
            runner_id: favourite.runner_id.clone(),
            strategy_id: self.strategy_id.clone(),
            side: Side::Lay,
            edge: e,
            probability: p_lay,
            odds: favourite.lay_price,
            confidence: None,
        }]
    }
}
