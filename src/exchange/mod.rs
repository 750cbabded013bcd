// =============================================================================
// Betting-exchange interface — order placement, cancellation, status polling
// =============================================================================
//
// The engine talks to the exchange only through the `ExchangeClient` trait.
// Errors are classified at this boundary so callers can route them without
// inspecting transport details: transient errors are retried by the order
// poller, terminal rejections fail the bet, auth errors are fatal at startup.
// =============================================================================

pub mod rest;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::types::Side;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Exchange failure, pre-classified for the executor and poller.
#[derive(Debug, Clone)]
pub enum ExchangeError {
    /// Network failure, timeout, or 5xx — safe to retry.
    Transient(String),
    /// Order rejected, insufficient funds, market closed — never retried.
    Rejected(String),
    /// Login/session failure. Fatal at startup in live mode.
    Auth(String),
}

impl ExchangeError {
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

impl std::fmt::Display for ExchangeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Transient(msg) => write!(f, "transient exchange error: {msg}"),
            Self::Rejected(msg) => write!(f, "order rejected: {msg}"),
            Self::Auth(msg) => write!(f, "exchange authentication failed: {msg}"),
        }
    }
}

impl std::error::Error for ExchangeError {}

// ---------------------------------------------------------------------------
// Order types
// ---------------------------------------------------------------------------

/// Order state as reported by the exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExchangeOrderStatus {
    Pending,
    Matched,
    Cancelled,
    SettledWon,
    SettledLost,
}

/// Acknowledgment returned by a successful order submission.
#[derive(Debug, Clone, Deserialize)]
pub struct PlacedOrder {
    pub exchange_bet_id: String,
    pub market_id: String,
    pub status: ExchangeOrderStatus,
    pub matched_price: Option<f64>,
    pub matched_size: Option<f64>,
}

/// One row of an order-status poll.
#[derive(Debug, Clone, Deserialize)]
pub struct OrderReport {
    pub exchange_bet_id: String,
    pub status: ExchangeOrderStatus,
    pub matched_price: Option<f64>,
    pub matched_size: Option<f64>,
    /// Commission charged on settlement, when the exchange reports it.
    pub commission: Option<f64>,
}

// ---------------------------------------------------------------------------
// Client trait
// ---------------------------------------------------------------------------

/// Exchange operations used by the engine. Idempotency is not assumed; the
/// caller-supplied `customer_ref` is the exchange-side dedup key.
#[async_trait]
pub trait ExchangeClient: Send + Sync {
    async fn login(&self) -> Result<(), ExchangeError>;

    async fn logout(&self) -> Result<(), ExchangeError>;

    async fn place_order(
        &self,
        market: &str,
        selection: &str,
        side: Side,
        price: f64,
        stake: f64,
        customer_ref: &str,
    ) -> Result<PlacedOrder, ExchangeError>;

    async fn cancel_order(&self, exchange_bet_id: &str) -> Result<(), ExchangeError>;

    async fn list_orders(&self, ids: &[String]) -> Result<Vec<OrderReport>, ExchangeError>;
}

// =============================================================================
// Test double — scripted, call-recording exchange
// =============================================================================
#[cfg(test)]
pub mod testkit {
    use super::*;
    use parking_lot::Mutex;
    use std::collections::VecDeque;

    /// Recorded `place_order` invocation.
    #[derive(Debug, Clone)]
    pub struct PlacedCall {
        pub market: String,
        pub selection: String,
        pub side: Side,
        pub price: f64,
        pub stake: f64,
        pub customer_ref: String,
    }

    /// Hand-rolled mock: every call is recorded; responses are scripted by
    /// pushing onto the queues, with sensible defaults when a queue is empty.
    #[derive(Default)]
    pub struct ScriptedExchange {
        pub placed: Mutex<Vec<PlacedCall>>,
        pub cancelled: Mutex<Vec<String>>,
        pub place_results: Mutex<VecDeque<Result<PlacedOrder, ExchangeError>>>,
        pub list_results: Mutex<VecDeque<Result<Vec<OrderReport>, ExchangeError>>>,
        pub login_result: Mutex<Option<ExchangeError>>,
    }

    impl ScriptedExchange {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn push_place_result(&self, result: Result<PlacedOrder, ExchangeError>) {
            self.place_results.lock().push_back(result);
        }

        pub fn push_list_result(&self, result: Result<Vec<OrderReport>, ExchangeError>) {
            self.list_results.lock().push_back(result);
        }

        pub fn place_calls(&self) -> usize {
            self.placed.lock().len()
        }
    }

    #[async_trait]
    impl ExchangeClient for ScriptedExchange {
        async fn login(&self) -> Result<(), ExchangeError> {
            match self.login_result.lock().clone() {
                Some(err) => Err(err),
                None => Ok(()),
            }
        }

        async fn logout(&self) -> Result<(), ExchangeError> {
            Ok(())
        }

        async fn place_order(
            &self,
            market: &str,
            selection: &str,
            side: Side,
            price: f64,
            stake: f64,
            customer_ref: &str,
        ) -> Result<PlacedOrder, ExchangeError> {
            self.placed.lock().push(PlacedCall {
                market: market.to_string(),
                selection: selection.to_string(),
                side,
                price,
                stake,
                customer_ref: customer_ref.to_string(),
            });

            match self.place_results.lock().pop_front() {
                Some(result) => result,
                None => Ok(PlacedOrder {
                    exchange_bet_id: format!("ex-{customer_ref}"),
                    market_id: format!("mkt-{market}"),
                    status: ExchangeOrderStatus::Matched,
                    matched_price: Some(price),
                    matched_size: Some(stake),
                }),
            }
        }

        async fn cancel_order(&self, exchange_bet_id: &str) -> Result<(), ExchangeError> {
            self.cancelled.lock().push(exchange_bet_id.to_string());
            Ok(())
        }

        async fn list_orders(&self, _ids: &[String]) -> Result<Vec<OrderReport>, ExchangeError> {
            match self.list_results.lock().pop_front() {
                Some(result) => result,
                None => Ok(Vec::new()),
            }
        }
    }
}
