// =============================================================================
// Status API — Axum 0.7
// =============================================================================
//
// Read-only diagnostics under `/api/v1/`. Trading control is deliberately not
// exposed here; the breaker and config own those decisions.
//
// CORS is configured permissively for development; tighten `allow_origin` in
// production.
// =============================================================================

use std::sync::Arc;

use axum::{extract::State, response::IntoResponse, routing::get, Json, Router};
use serde::Serialize;
use tower_http::cors::{Any, CorsLayer};

use crate::engine_state::EngineState;

/// Build the status router with CORS middleware and shared state.
pub fn router(state: Arc<EngineState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/api/v1/health", get(health))
        .route("/api/v1/status", get(status))
        .layer(cors)
        .with_state(state)
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    server_time: i64,
}

async fn health() -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok",
        server_time: chrono::Utc::now().timestamp_millis(),
    })
}

/// Breaker state, exposure, daily loss, open-bet count and last tick time.
async fn status(State(state): State<Arc<EngineState>>) -> impl IntoResponse {
    Json(state.snapshot())
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::breaker::{BreakerConfig, CircuitBreaker};
    use crate::risk::{RiskLimits, RiskManager};
    use chrono::{Duration, Utc};

    fn state() -> Arc<EngineState> {
        let risk = Arc::new(RiskManager::new(
            RiskLimits {
                kelly_fraction: 0.25,
                min_stake: 2.0,
                max_stake_per_bet: 10.0,
                max_exposure: 100.0,
                max_daily_loss: 50.0,
                max_concurrent_bets: 5,
            },
            1000.0,
            Utc::now(),
        ));
        let breaker = Arc::new(CircuitBreaker::new(
            BreakerConfig {
                max_consecutive_losses: 3,
                max_drawdown_percent: 0.15,
                failure_window: Duration::seconds(60),
                max_failures_in_window: 5,
                cooldown: Duration::seconds(60),
            },
            1000.0,
        ));
        Arc::new(EngineState::new(risk, breaker))
    }

    #[tokio::test]
    async fn status_snapshot_serialises() {
        let state = state();
        let snapshot = state.snapshot();
        let json = serde_json::to_value(&snapshot).unwrap();
        assert_eq!(json["breaker"]["state"], "Closed");
        assert_eq!(json["risk"]["open_bets"], 0);
        assert!(json["last_tick_at"].is_null());
    }

    #[test]
    fn router_builds() {
        let _router = router(state());
    }
}
