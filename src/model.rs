// =============================================================================
// Predictive-model client — per-runner win probability and confidence
// =============================================================================
//
// Model errors are always soft: the orchestrator falls back to the strategy's
// own probability estimate (when the strategy allows it) or drops the signal.
// A model outage can never halt the engine on its own.
// =============================================================================

use async_trait::async_trait;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// One (race, runner) pair to score.
#[derive(Debug, Clone, Serialize)]
pub struct PredictionRequest {
    pub race_id: String,
    pub runner_id: String,
}

/// Model output for one runner.
#[derive(Debug, Clone, Deserialize)]
pub struct Prediction {
    pub runner_id: String,
    /// Win probability in [0, 1].
    pub probability: f64,
    /// Model self-assessed confidence in [0, 1].
    pub confidence: f64,
}

/// Batch prediction interface. Callable in both paper and live mode.
#[async_trait]
pub trait ModelClient: Send + Sync {
    async fn batch_predict(&self, requests: &[PredictionRequest]) -> Result<Vec<Prediction>>;
}

// ---------------------------------------------------------------------------
// REST implementation
// ---------------------------------------------------------------------------

/// Per-request timeout; model calls sit on the tick's critical path.
const REQUEST_TIMEOUT_SECS: u64 = 5;

pub struct RestModelClient {
    endpoint: String,
    client: reqwest::Client,
}

#[derive(Serialize)]
struct BatchRequest<'a> {
    requests: &'a [PredictionRequest],
}

#[derive(Deserialize)]
struct BatchResponse {
    predictions: Vec<Prediction>,
}

impl RestModelClient {
    pub fn new(endpoint: impl Into<String>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .build()
            .expect("failed to build reqwest client");

        Self {
            endpoint: endpoint.into(),
            client,
        }
    }
}

#[async_trait]
impl ModelClient for RestModelClient {
    async fn batch_predict(&self, requests: &[PredictionRequest]) -> Result<Vec<Prediction>> {
        let url = format!("{}/v1/predict", self.endpoint);

        let resp = self
            .client
            .post(&url)
            .json(&BatchRequest { requests })
            .send()
            .await
            .context("POST /v1/predict request failed")?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            anyhow::bail!("model service returned {status}: {body}");
        }

        let body: BatchResponse = resp
            .json()
            .await
            .context("failed to parse model response")?;

        debug!(
            requested = requests.len(),
            predicted = body.predictions.len(),
            "batch prediction complete"
        );
        Ok(body.predictions)
    }
}

impl std::fmt::Debug for RestModelClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RestModelClient")
            .field("endpoint", &self.endpoint)
            .finish()
    }
}

// =============================================================================
// Test double
// =============================================================================
#[cfg(test)]
pub mod testkit {
    use super::*;
    use parking_lot::Mutex;
    use std::collections::HashMap;

    /// Returns canned predictions by runner id; unknown runners get nothing.
    #[derive(Default)]
    pub struct StaticModel {
        pub predictions: HashMap<String, Prediction>,
        pub fail: Mutex<bool>,
    }

    impl StaticModel {
        pub fn with(predictions: Vec<Prediction>) -> Self {
            Self {
                predictions: predictions
                    .into_iter()
                    .map(|p| (p.runner_id.clone(), p))
                    .collect(),
                fail: Mutex::new(false),
            }
        }
    }

    #[async_trait]
    impl ModelClient for StaticModel {
        async fn batch_predict(&self, requests: &[PredictionRequest]) -> Result<Vec<Prediction>> {
            if *self.fail.lock() {
                anyhow::bail!("model service unavailable");
            }
            Ok(requests
                .iter()
                .filter_map(|r| self.predictions.get(&r.runner_id).cloned())
                .collect())
        }
    }
}
