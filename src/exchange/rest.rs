// =============================================================================
// REST exchange client — HMAC-SHA256 signed requests
// =============================================================================
//
// SECURITY: the secret key is never logged or serialized. Every request is
// signed over `timestamp.METHOD.path.body` and carries the API key, signature
// and timestamp as headers; the session token obtained at login rides along
// as a bearer header.
// =============================================================================

use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use hmac::{Hmac, Mac};
use parking_lot::RwLock;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use tracing::{debug, info, warn};

use super::{ExchangeClient, ExchangeError, OrderReport, PlacedOrder};
use crate::types::Side;

type HmacSha256 = Hmac<Sha256>;

/// Per-request timeout for all exchange calls.
const REQUEST_TIMEOUT_SECS: u64 = 10;

/// REST betting-exchange client with HMAC-SHA256 request signing.
pub struct RestExchangeClient {
    api_key: String,
    secret: String,
    base_url: String,
    client: reqwest::Client,
    session_token: RwLock<Option<String>>,
}

#[derive(Serialize)]
struct LoginRequest<'a> {
    api_key: &'a str,
}

#[derive(Deserialize)]
struct LoginResponse {
    session_token: String,
}

#[derive(Serialize)]
struct PlaceOrderRequest<'a> {
    market: &'a str,
    selection: &'a str,
    side: &'a str,
    price: f64,
    stake: f64,
    customer_ref: &'a str,
}

#[derive(Serialize)]
struct ListOrdersRequest<'a> {
    ids: &'a [String],
}

impl RestExchangeClient {
    /// Create a new client.
    ///
    /// # Arguments
    /// * `base_url` — exchange REST endpoint.
    /// * `api_key`  — account API key (sent as a header, never in the path).
    /// * `secret`   — secret key used exclusively for HMAC signing.
    pub fn new(
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        secret: impl Into<String>,
    ) -> Self {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .build()
            .expect("failed to build reqwest client");

        let base_url = base_url.into();
        debug!(base_url = %base_url, "RestExchangeClient initialised");

        Self {
            api_key: api_key.into(),
            secret: secret.into(),
            base_url,
            client,
            session_token: RwLock::new(None),
        }
    }

    // -------------------------------------------------------------------------
    // Signing helpers
    // -------------------------------------------------------------------------

    fn timestamp_ms() -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0)
    }

    /// HMAC-SHA256 hex signature over `timestamp.METHOD.path.body`.
    fn sign(&self, timestamp: u64, method: &str, path: &str, body: &str) -> String {
        let payload = format!("{timestamp}.{method}.{path}.{body}");
        let mut mac = HmacSha256::new_from_slice(self.secret.as_bytes())
            .expect("HMAC accepts any key size");
        mac.update(payload.as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    async fn send(
        &self,
        method: reqwest::Method,
        path: &str,
        body: Option<String>,
    ) -> Result<(StatusCode, String), ExchangeError> {
        let url = format!("{}{}", self.base_url, path);
        let body_str = body.unwrap_or_default();
        let ts = Self::timestamp_ms();
        let signature = self.sign(ts, method.as_str(), path, &body_str);

        let mut req = self
            .client
            .request(method, &url)
            .header("X-TL-APIKEY", &self.api_key)
            .header("X-TL-TIMESTAMP", ts.to_string())
            .header("X-TL-SIGNATURE", signature);

        if let Some(token) = self.session_token.read().clone() {
            req = req.bearer_auth(token);
        }
        if !body_str.is_empty() {
            req = req
                .header("content-type", "application/json")
                .body(body_str);
        }

        let resp = req
            .send()
            .await
            .map_err(|e| ExchangeError::Transient(format!("request to {path} failed: {e}")))?;

        let status = resp.status();
        let text = resp
            .text()
            .await
            .map_err(|e| ExchangeError::Transient(format!("reading {path} response: {e}")))?;

        Ok((status, text))
    }

    /// Map an HTTP status to the error taxonomy.
    fn classify(status: StatusCode, path: &str, body: &str) -> ExchangeError {
        if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
            ExchangeError::Transient(format!("{path} returned {status}: {body}"))
        } else if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            ExchangeError::Auth(format!("{path} returned {status}: {body}"))
        } else {
            ExchangeError::Rejected(format!("{path} returned {status}: {body}"))
        }
    }

    fn parse<T: serde::de::DeserializeOwned>(path: &str, text: &str) -> Result<T, ExchangeError> {
        serde_json::from_str(text)
            .map_err(|e| ExchangeError::Transient(format!("malformed {path} response: {e}")))
    }
}

#[async_trait]
impl ExchangeClient for RestExchangeClient {
    async fn login(&self) -> Result<(), ExchangeError> {
        let body = serde_json::to_string(&LoginRequest {
            api_key: &self.api_key,
        })
        .map_err(|e| ExchangeError::Auth(format!("encoding login request: {e}")))?;

        let (status, text) = self
            .send(reqwest::Method::POST, "/v1/session", Some(body))
            .await?;

        if !status.is_success() {
            // Login failures are auth errors regardless of status class.
            return Err(ExchangeError::Auth(format!(
                "/v1/session returned {status}: {text}"
            )));
        }

        let resp: LoginResponse = Self::parse("/v1/session", &text)?;
        *self.session_token.write() = Some(resp.session_token);
        info!("exchange session established");
        Ok(())
    }

    async fn logout(&self) -> Result<(), ExchangeError> {
        let (status, text) = self
            .send(reqwest::Method::DELETE, "/v1/session", None)
            .await?;

        if !status.is_success() {
            warn!(status = %status, "exchange logout returned non-success");
            return Err(Self::classify(status, "/v1/session", &text));
        }

        *self.session_token.write() = None;
        info!("exchange session closed");
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
        let side_str = match side {
            Side::Back => "BACK",
            Side::Lay => "LAY",
        };
        let body = serde_json::to_string(&PlaceOrderRequest {
            market,
            selection,
            side: side_str,
            price,
            stake,
            customer_ref,
        })
        .map_err(|e| ExchangeError::Rejected(format!("encoding order request: {e}")))?;

        debug!(market, selection, side = side_str, price, stake, customer_ref, "placing order");

        let (status, text) = self
            .send(reqwest::Method::POST, "/v1/orders", Some(body))
            .await?;

        if !status.is_success() {
            return Err(Self::classify(status, "/v1/orders", &text));
        }

        let placed: PlacedOrder = Self::parse("/v1/orders", &text)?;
        debug!(
            exchange_bet_id = %placed.exchange_bet_id,
            status = ?placed.status,
            "order placed"
        );
        Ok(placed)
    }

    async fn cancel_order(&self, exchange_bet_id: &str) -> Result<(), ExchangeError> {
        let path = format!("/v1/orders/{exchange_bet_id}");
        let (status, text) = self.send(reqwest::Method::DELETE, &path, None).await?;

        if !status.is_success() {
            return Err(Self::classify(status, &path, &text));
        }

        debug!(exchange_bet_id, "order cancelled");
        Ok(())
    }

    async fn list_orders(&self, ids: &[String]) -> Result<Vec<OrderReport>, ExchangeError> {
        let body = serde_json::to_string(&ListOrdersRequest { ids })
            .map_err(|e| ExchangeError::Transient(format!("encoding list request: {e}")))?;

        let (status, text) = self
            .send(reqwest::Method::POST, "/v1/orders/status", Some(body))
            .await?;

        if !status.is_success() {
            return Err(Self::classify(status, "/v1/orders/status", &text));
        }

        let reports: Vec<OrderReport> = Self::parse("/v1/orders/status", &text)?;
        debug!(count = reports.len(), "order reports fetched");
        Ok(reports)
    }
}

impl std::fmt::Debug for RestExchangeClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RestExchangeClient")
            .field("api_key", &"<redacted>")
            .field("secret", &"<redacted>")
            .field("base_url", &self.base_url)
            .finish()
    }
}
