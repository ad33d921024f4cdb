//! REST venue connector
//!
//! Client for any venue daemon exposing the engine's uniform REST surface
//! (the packaged mock venue speaks it). Requests are HMAC-SHA256 signed,
//! rate limited with a token bucket, and retried once with backoff on
//! transient failures. Reads and submits carry separate timeouts.

use async_trait::async_trait;
use hmac::{Hmac, Mac};
use reqwest::{Client, Method, StatusCode};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::collections::HashMap;
use std::time::Duration;
use tokio::time::sleep;

use super::{AssetBalance, Exchange, ExchangeOrder, PrecisionRules};
use crate::common::{RateLimiter, RateLimiterConfig};
use crate::error::{EngineError, EngineResult};
use crate::security::ApiCredentials;
use crate::types::{OrderType, Side};

type HmacSha256 = Hmac<Sha256>;

/// Connector configuration.
#[derive(Debug, Clone)]
pub struct RestConnectorConfig {
    pub base_url: String,
    pub read_timeout: Duration,
    pub submit_timeout: Duration,
    pub rate_limit_per_second: usize,
    pub max_retries: u32,
}

impl Default for RestConnectorConfig {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:9100".to_string(),
            read_timeout: Duration::from_secs(30),
            submit_timeout: Duration::from_secs(60),
            rate_limit_per_second: 10,
            max_retries: 1,
        }
    }
}

/// Sign `timestamp + method + path + body` with the API secret.
pub fn sign_request(secret: &str, timestamp: i64, method: &str, path: &str, body: &str) -> String {
    let payload = format!("{timestamp}{method}{path}{body}");
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC accepts any key size");
    mac.update(payload.as_bytes());
    hex::encode(mac.finalize().into_bytes())
}

#[derive(Debug, Serialize)]
struct PlaceOrderRequest<'a> {
    symbol: &'a str,
    #[serde(rename = "type")]
    order_type: &'a str,
    side: &'a str,
    quantity: Decimal,
    #[serde(skip_serializing_if = "Option::is_none")]
    price: Option<Decimal>,
}

#[derive(Debug, Deserialize)]
struct OrderDoc {
    id: String,
    symbol: String,
    side: String,
    #[serde(rename = "type")]
    order_type: String,
    price: Option<Decimal>,
    quantity: Decimal,
    status: String,
    #[serde(default)]
    filled: Decimal,
    #[serde(default)]
    avg_price: Decimal,
    #[serde(default)]
    fee: Decimal,
    #[serde(default)]
    fee_currency: Option<String>,
}

impl OrderDoc {
    fn into_order(self) -> EngineResult<ExchangeOrder> {
        let side = self
            .side
            .parse::<Side>()
            .map_err(EngineError::Validation)?;
        let order_type = self
            .order_type
            .parse::<OrderType>()
            .map_err(EngineError::Validation)?;
        Ok(ExchangeOrder {
            id: self.id,
            symbol: self.symbol,
            side,
            order_type,
            price: self.price,
            quantity: self.quantity,
            status: self.status,
            filled: self.filled,
            avg_price: self.avg_price,
            fee: self.fee,
            fee_currency: self.fee_currency,
        })
    }
}

#[derive(Debug, Deserialize)]
struct TickerDoc {
    symbol: String,
    last: Decimal,
}

#[derive(Debug, Deserialize)]
struct BalanceDoc {
    asset: String,
    total: Decimal,
    free: Decimal,
    used: Decimal,
}

#[derive(Debug, Deserialize)]
struct SymbolInfoDoc {
    symbol: String,
    tick_size: Decimal,
    step_size: Decimal,
    min_qty: Decimal,
    min_notional: Decimal,
}

/// REST connector for one venue and one credential pair.
pub struct RestConnector {
    credentials: ApiCredentials,
    config: RestConnectorConfig,
    read_client: Client,
    submit_client: Client,
    rate_limiter: RateLimiter,
}

impl RestConnector {
    pub fn new(credentials: ApiCredentials, config: RestConnectorConfig) -> Self {
        let read_client = Client::builder()
            .timeout(config.read_timeout)
            .build()
            .expect("Failed to create HTTP client");
        let submit_client = Client::builder()
            .timeout(config.submit_timeout)
            .build()
            .expect("Failed to create HTTP client");
        let rate_limiter = RateLimiter::new(
            RateLimiterConfig::default().with_rate(config.rate_limit_per_second),
        );
        Self {
            credentials,
            config,
            read_client,
            submit_client,
            rate_limiter,
        }
    }

    /// Prefix of the API key, used by the gateway's connector cache key.
    pub fn key_prefix(&self) -> String {
        self.credentials.api_key.chars().take(8).collect()
    }

    async fn request<T: serde::de::DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        query: &[(&str, String)],
        body: Option<String>,
        submitting: bool,
    ) -> EngineResult<T> {
        let mut attempt = 0;
        loop {
            match self
                .request_once(method.clone(), path, query, body.clone(), submitting)
                .await
            {
                Ok(value) => return Ok(value),
                Err(e) if e.is_transient() && attempt < self.config.max_retries => {
                    attempt += 1;
                    let backoff = Duration::from_millis(250 * 2u64.pow(attempt));
                    tracing::warn!(path, attempt, error = %e, "retrying venue request");
                    sleep(backoff).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn request_once<T: serde::de::DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        query: &[(&str, String)],
        body: Option<String>,
        submitting: bool,
    ) -> EngineResult<T> {
        self.rate_limiter.acquire().await;

        let client = if submitting {
            &self.submit_client
        } else {
            &self.read_client
        };
        let url = format!("{}{}", self.config.base_url.trim_end_matches('/'), path);
        let timestamp = chrono::Utc::now().timestamp_millis();
        let body_str = body.clone().unwrap_or_default();
        let signature = sign_request(
            &self.credentials.api_secret,
            timestamp,
            method.as_str(),
            path,
            &body_str,
        );

        let mut request = client
            .request(method, &url)
            .query(query)
            .header("X-API-KEY", &self.credentials.api_key)
            .header("X-TIMESTAMP", timestamp.to_string())
            .header("X-SIGNATURE", signature);
        if let Some(body) = body {
            request = request
                .header("Content-Type", "application/json")
                .body(body);
        }

        let response = request
            .send()
            .await
            .map_err(|e| EngineError::VenueTransient(format!("request failed: {e}")))?;

        let status = response.status();
        if status.is_success() {
            return response
                .json::<T>()
                .await
                .map_err(|e| EngineError::VenueTransient(format!("malformed response: {e}")));
        }

        let text = response.text().await.unwrap_or_default();
        Err(map_error_status(status, &text))
    }
}

fn map_error_status(status: StatusCode, body: &str) -> EngineError {
    if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
        EngineError::VenueTransient(format!("venue {status}: {body}"))
    } else {
        EngineError::from_venue_message(&format!("venue {status}: {body}"))
    }
}

#[async_trait]
impl Exchange for RestConnector {
    async fn place_order(
        &self,
        symbol: &str,
        order_type: OrderType,
        side: Side,
        quantity: Decimal,
        price: Option<Decimal>,
    ) -> EngineResult<ExchangeOrder> {
        let body = serde_json::to_string(&PlaceOrderRequest {
            symbol,
            order_type: order_type.as_str(),
            side: side.as_str(),
            quantity,
            price,
        })
        .expect("order request serializes");

        let doc: OrderDoc = self
            .request(Method::POST, "/api/v1/order", &[], Some(body), true)
            .await?;
        doc.into_order()
    }

    async fn get_order_status(&self, order_id: &str, symbol: &str) -> EngineResult<ExchangeOrder> {
        let doc: OrderDoc = self
            .request(
                Method::GET,
                "/api/v1/order",
                &[("id", order_id.to_string()), ("symbol", symbol.to_string())],
                None,
                false,
            )
            .await?;
        doc.into_order()
    }

    async fn cancel_order(&self, order_id: &str, symbol: &str) -> EngineResult<()> {
        let _: serde_json::Value = self
            .request(
                Method::DELETE,
                "/api/v1/order",
                &[("id", order_id.to_string()), ("symbol", symbol.to_string())],
                None,
                true,
            )
            .await?;
        Ok(())
    }

    async fn fetch_open_orders(&self, symbol: Option<&str>) -> EngineResult<Vec<ExchangeOrder>> {
        let query: Vec<(&str, String)> = symbol
            .map(|s| vec![("symbol", s.to_string())])
            .unwrap_or_default();
        let docs: Vec<OrderDoc> = self
            .request(Method::GET, "/api/v1/openOrders", &query, None, false)
            .await?;
        docs.into_iter().map(OrderDoc::into_order).collect()
    }

    async fn get_current_price(&self, symbol: &str) -> EngineResult<Decimal> {
        let doc: TickerDoc = self
            .request(
                Method::GET,
                "/api/v1/ticker",
                &[("symbol", symbol.to_string())],
                None,
                false,
            )
            .await?;
        Ok(doc.last)
    }

    async fn get_all_tickers(&self) -> EngineResult<HashMap<String, Decimal>> {
        let docs: Vec<TickerDoc> = self
            .request(Method::GET, "/api/v1/tickers", &[], None, false)
            .await?;
        Ok(docs.into_iter().map(|d| (d.symbol, d.last)).collect())
    }

    async fn fetch_balance(&self) -> EngineResult<HashMap<String, AssetBalance>> {
        let docs: Vec<BalanceDoc> = self
            .request(Method::GET, "/api/v1/balance", &[], None, false)
            .await?;
        Ok(docs
            .into_iter()
            .map(|d| {
                (
                    d.asset,
                    AssetBalance {
                        total: d.total,
                        free: d.free,
                        used: d.used,
                    },
                )
            })
            .collect())
    }

    async fn get_precision_rules(&self) -> EngineResult<HashMap<String, PrecisionRules>> {
        let docs: Vec<SymbolInfoDoc> = self
            .request(Method::GET, "/api/v1/exchangeInfo", &[], None, false)
            .await?;
        Ok(docs
            .into_iter()
            .map(|d| {
                (
                    d.symbol,
                    PrecisionRules {
                        tick_size: d.tick_size,
                        step_size: d.step_size,
                        min_qty: d.min_qty,
                        min_notional: d.min_notional,
                    },
                )
            })
            .collect())
    }

    async fn close(&self) {
        // reqwest clients release their pools on drop
    }
}
