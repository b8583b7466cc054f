//! Broker interface
//!
//! The decision engine treats the brokerage as an opaque capability: read
//! positions, cash and prices, submit market orders. Failures are typed so
//! retry policy is decided on the variant, never by matching message text.
//! `RobustBroker` wraps any implementation with bounded retry-with-backoff
//! and a circuit breaker.

use async_trait::async_trait;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::time::sleep;
use tracing::{debug, warn};

use crate::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig};
use crate::config::BrokerConfig;
use crate::{Side, Symbol};

type HmacSha256 = Hmac<Sha256>;

/// Typed broker failure taxonomy
#[derive(Debug, Error)]
pub enum BrokerError {
    /// Throttled by the broker; retryable after backoff
    #[error("rate limited by broker")]
    RateLimited,

    /// Network or server-side trouble; retryable
    #[error("transient broker failure: {0}")]
    Transient(String),

    /// Rejected request, bad credentials, malformed order; not retryable
    #[error("fatal broker error: {0}")]
    Fatal(String),

    /// The wrapper refused the call without touching the wire
    #[error("circuit breaker is open")]
    CircuitOpen,
}

impl BrokerError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, BrokerError::RateLimited | BrokerError::Transient(_))
    }
}

pub type BrokerResult<T> = Result<T, BrokerError>;

/// A position as reported by the broker
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerPosition {
    pub symbol: Symbol,
    pub quantity: f64,
    pub avg_entry_price: f64,
    pub market_value: f64,
}

/// Acknowledgement of a submitted order
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderAck {
    pub order_id: String,
    pub symbol: Symbol,
    pub quantity: f64,
    pub side: Side,
}

/// Opaque brokerage capability consumed by the engine
#[async_trait]
pub trait Broker: Send + Sync {
    async fn get_positions(&self) -> BrokerResult<Vec<BrokerPosition>>;
    async fn get_last_price(&self, symbol: &Symbol) -> BrokerResult<f64>;
    async fn get_cash(&self) -> BrokerResult<f64>;
    async fn get_portfolio_value(&self) -> BrokerResult<f64>;
    async fn submit_order(&self, symbol: &Symbol, quantity: f64, side: Side)
        -> BrokerResult<OrderAck>;
}

// =============================================================================
// REST client
// =============================================================================

#[derive(Debug, Serialize)]
struct OrderRequest<'a> {
    symbol: &'a str,
    quantity: f64,
    side: &'a str,
    order_type: &'a str,
    timestamp: i64,
}

#[derive(Debug, Deserialize)]
struct OrderResponse {
    id: String,
}

#[derive(Debug, Deserialize)]
struct AccountResponse {
    cash: f64,
    portfolio_value: f64,
}

#[derive(Debug, Deserialize)]
struct QuoteResponse {
    last_price: f64,
}

#[derive(Debug, Deserialize)]
struct PositionRow {
    symbol: String,
    quantity: f64,
    avg_entry_price: f64,
    market_value: f64,
}

/// HMAC-signed REST client for the brokerage API
pub struct RestBroker {
    base_url: String,
    api_key: String,
    api_secret: String,
    client: reqwest::Client,
}

impl RestBroker {
    pub fn new(config: &BrokerConfig) -> anyhow::Result<Self> {
        let api_key = config
            .api_key
            .clone()
            .ok_or_else(|| anyhow::anyhow!("BROKER_API_KEY not configured"))?;
        let api_secret = config
            .api_secret
            .clone()
            .ok_or_else(|| anyhow::anyhow!("BROKER_API_SECRET not configured"))?;

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| anyhow::anyhow!("failed to build HTTP client: {e}"))?;

        Ok(Self {
            base_url: config.base_url.clone(),
            api_key,
            api_secret,
            client,
        })
    }

    fn sign(&self, payload: &str) -> String {
        let mut mac = HmacSha256::new_from_slice(self.api_secret.as_bytes())
            .expect("HMAC can take key of any size");
        mac.update(payload.as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    /// Map a transport/HTTP outcome to the typed taxonomy
    fn classify_status(status: reqwest::StatusCode, body: &str) -> BrokerError {
        if status.as_u16() == 429 {
            BrokerError::RateLimited
        } else if status.is_server_error() {
            BrokerError::Transient(format!("HTTP {}: {}", status, body))
        } else {
            BrokerError::Fatal(format!("HTTP {}: {}", status, body))
        }
    }

    async fn get_json<R: serde::de::DeserializeOwned>(&self, endpoint: &str) -> BrokerResult<R> {
        let url = format!("{}{}", self.base_url, endpoint);
        let timestamp = chrono::Utc::now().timestamp_millis();
        let payload = format!("{}{}", timestamp, endpoint);
        let signature = self.sign(&payload);

        let response = self
            .client
            .get(&url)
            .header("X-API-KEY", &self.api_key)
            .header("X-API-TIMESTAMP", timestamp)
            .header("X-API-SIGNATURE", signature)
            .send()
            .await
            .map_err(|e| BrokerError::Transient(e.to_string()))?;

        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| BrokerError::Transient(e.to_string()))?;

        if !status.is_success() {
            return Err(Self::classify_status(status, &text));
        }

        serde_json::from_str(&text).map_err(|e| BrokerError::Fatal(format!("bad response: {e}")))
    }
}

#[async_trait]
impl Broker for RestBroker {
    async fn get_positions(&self) -> BrokerResult<Vec<BrokerPosition>> {
        let rows: Vec<PositionRow> = self.get_json("/v1/positions").await?;
        Ok(rows
            .into_iter()
            .map(|r| BrokerPosition {
                symbol: Symbol::new(&r.symbol),
                quantity: r.quantity,
                avg_entry_price: r.avg_entry_price,
                market_value: r.market_value,
            })
            .collect())
    }

    async fn get_last_price(&self, symbol: &Symbol) -> BrokerResult<f64> {
        let quote: QuoteResponse = self
            .get_json(&format!("/v1/quotes/{}", symbol.as_str()))
            .await?;
        if quote.last_price <= 0.0 {
            return Err(BrokerError::Fatal(format!(
                "non-positive quote for {}",
                symbol
            )));
        }
        Ok(quote.last_price)
    }

    async fn get_cash(&self) -> BrokerResult<f64> {
        let account: AccountResponse = self.get_json("/v1/account").await?;
        Ok(account.cash)
    }

    async fn get_portfolio_value(&self) -> BrokerResult<f64> {
        let account: AccountResponse = self.get_json("/v1/account").await?;
        Ok(account.portfolio_value)
    }

    async fn submit_order(
        &self,
        symbol: &Symbol,
        quantity: f64,
        side: Side,
    ) -> BrokerResult<OrderAck> {
        let url = format!("{}/v1/orders", self.base_url);
        let request = OrderRequest {
            symbol: symbol.as_str(),
            quantity,
            side: side.as_str(),
            order_type: "market",
            timestamp: chrono::Utc::now().timestamp_millis(),
        };

        let body = serde_json::to_string(&request)
            .map_err(|e| BrokerError::Fatal(format!("serialize order: {e}")))?;
        let signature = self.sign(&body);

        let response = self
            .client
            .post(&url)
            .header("Content-Type", "application/json")
            .header("X-API-KEY", &self.api_key)
            .header("X-API-SIGNATURE", signature)
            .body(body)
            .send()
            .await
            .map_err(|e| BrokerError::Transient(e.to_string()))?;

        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| BrokerError::Transient(e.to_string()))?;

        if !status.is_success() {
            return Err(Self::classify_status(status, &text));
        }

        let parsed: OrderResponse = serde_json::from_str(&text)
            .map_err(|e| BrokerError::Fatal(format!("bad order response: {e}")))?;

        Ok(OrderAck {
            order_id: parsed.id,
            symbol: symbol.clone(),
            quantity,
            side,
        })
    }
}

// =============================================================================
// Retry + circuit-breaker wrapper
// =============================================================================

/// Wraps any broker with bounded retry-with-backoff and a circuit breaker.
///
/// Retryable errors back off exponentially (base, 2x, 4x, ...). A run of
/// exhausted calls opens the circuit; while open, calls fail fast with
/// `BrokerError::CircuitOpen` without touching the inner broker.
pub struct RobustBroker<B> {
    inner: B,
    breaker: Mutex<CircuitBreaker>,
    max_retries: u32,
    backoff_base: Duration,
}

impl<B: Broker> RobustBroker<B> {
    pub fn new(inner: B, config: &BrokerConfig) -> Self {
        let breaker = CircuitBreaker::new(
            CircuitBreakerConfig::default()
                .with_failure_threshold(config.failure_threshold)
                .with_cooldown(Duration::from_secs(config.cooldown_secs)),
        );
        Self {
            inner,
            breaker: Mutex::new(breaker),
            max_retries: config.max_retries,
            backoff_base: Duration::from_secs(config.backoff_base_secs),
        }
    }

    pub fn inner(&self) -> &B {
        &self.inner
    }

    async fn call<'a, T, F, Fut>(&'a self, operation: F) -> BrokerResult<T>
    where
        F: Fn(&'a B) -> Fut,
        Fut: std::future::Future<Output = BrokerResult<T>>,
    {
        {
            let mut breaker = self.breaker.lock().await;
            if !breaker.can_attempt() {
                return Err(BrokerError::CircuitOpen);
            }
        }

        let mut last_error = None;

        for attempt in 0..=self.max_retries {
            if attempt > 0 {
                let delay = self.backoff_base * 2u32.pow(attempt - 1);
                debug!("retrying broker call after {}ms", delay.as_millis());
                sleep(delay).await;
            }

            match operation(&self.inner).await {
                Ok(result) => {
                    self.breaker.lock().await.record_success();
                    return Ok(result);
                }
                Err(e) if e.is_retryable() => {
                    warn!(
                        "broker call failed (attempt {}/{}): {}",
                        attempt + 1,
                        self.max_retries + 1,
                        e
                    );
                    last_error = Some(e);
                }
                Err(e) => {
                    // Fatal errors count against the circuit but never retry
                    self.breaker.lock().await.record_failure();
                    return Err(e);
                }
            }
        }

        self.breaker.lock().await.record_failure();
        Err(last_error.unwrap_or_else(|| BrokerError::Transient("retries exhausted".into())))
    }
}

#[async_trait]
impl<B: Broker> Broker for RobustBroker<B> {
    async fn get_positions(&self) -> BrokerResult<Vec<BrokerPosition>> {
        self.call(|b| b.get_positions()).await
    }

    async fn get_last_price(&self, symbol: &Symbol) -> BrokerResult<f64> {
        self.call(move |b| b.get_last_price(symbol)).await
    }

    async fn get_cash(&self) -> BrokerResult<f64> {
        self.call(|b| b.get_cash()).await
    }

    async fn get_portfolio_value(&self) -> BrokerResult<f64> {
        self.call(|b| b.get_portfolio_value()).await
    }

    async fn submit_order(
        &self,
        symbol: &Symbol,
        quantity: f64,
        side: Side,
    ) -> BrokerResult<OrderAck> {
        self.call(move |b| b.submit_order(symbol, quantity, side))
            .await
    }
}
