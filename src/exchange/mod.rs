//! Exchange gateway
//!
//! Uniform interface to remote venues. The engine depends only on the
//! operations declared here; any venue exposing this surface plus precision
//! rules is pluggable. A packaged in-process mock venue backs the tests.

pub mod gateway;
pub mod mock;
pub mod rest;

use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::error::EngineResult;
use crate::types::{OrderType, Side};

pub use gateway::{ExchangeGateway, GatewayConfig};
pub use mock::MockExchange;
pub use rest::RestConnector;

/// Known quote assets, longest first so suffix stripping is unambiguous.
pub const QUOTE_ASSETS: [&str; 6] = ["USDT", "USDC", "BUSD", "USD", "EUR", "DAI"];

/// Split a symbol like "BTCUSDT" into ("BTC", "USDT") by stripping a known
/// quote suffix. Falls back to treating the whole symbol as the base.
pub fn split_symbol(symbol: &str) -> (String, String) {
    for quote in QUOTE_ASSETS {
        if symbol.len() > quote.len() && symbol.ends_with(quote) {
            let base = &symbol[..symbol.len() - quote.len()];
            return (base.to_string(), quote.to_string());
        }
    }
    (symbol.to_string(), String::new())
}

/// Per-symbol precision and minimum-size rules.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PrecisionRules {
    pub tick_size: Decimal,
    pub step_size: Decimal,
    pub min_qty: Decimal,
    pub min_notional: Decimal,
}

impl Default for PrecisionRules {
    fn default() -> Self {
        use rust_decimal_macros::dec;
        Self {
            tick_size: dec!(0.01),
            step_size: dec!(0.001),
            min_qty: dec!(0.001),
            min_notional: dec!(10),
        }
    }
}

/// An order as the venue reports it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExchangeOrder {
    pub id: String,
    pub symbol: String,
    pub side: Side,
    pub order_type: OrderType,
    pub price: Option<Decimal>,
    pub quantity: Decimal,
    /// Venue status string: "open", "closed", "canceled", ...
    pub status: String,
    pub filled: Decimal,
    pub avg_price: Decimal,
    pub fee: Decimal,
    pub fee_currency: Option<String>,
}

impl ExchangeOrder {
    pub fn is_open(&self) -> bool {
        matches!(self.status.as_str(), "open" | "new" | "partially_filled")
    }
}

/// Balance of one asset.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AssetBalance {
    pub total: Decimal,
    pub free: Decimal,
    pub used: Decimal,
}

/// Uniform venue operations. Every outbound call from the engine goes
/// through an implementation of this trait, wrapped by the per-venue
/// circuit breaker in the gateway.
#[async_trait]
pub trait Exchange: Send + Sync {
    /// Submit an order. `price` is required for limit orders.
    async fn place_order(
        &self,
        symbol: &str,
        order_type: OrderType,
        side: Side,
        quantity: Decimal,
        price: Option<Decimal>,
    ) -> EngineResult<ExchangeOrder>;

    async fn get_order_status(&self, order_id: &str, symbol: &str) -> EngineResult<ExchangeOrder>;

    async fn cancel_order(&self, order_id: &str, symbol: &str) -> EngineResult<()>;

    async fn fetch_open_orders(&self, symbol: Option<&str>) -> EngineResult<Vec<ExchangeOrder>>;

    async fn get_current_price(&self, symbol: &str) -> EngineResult<Decimal>;

    async fn get_all_tickers(&self) -> EngineResult<HashMap<String, Decimal>>;

    async fn fetch_balance(&self) -> EngineResult<HashMap<String, AssetBalance>>;

    /// Free balances only, keyed by asset.
    async fn fetch_free_balance(&self) -> EngineResult<HashMap<String, Decimal>> {
        let balances = self.fetch_balance().await?;
        Ok(balances.into_iter().map(|(k, v)| (k, v.free)).collect())
    }

    async fn get_precision_rules(&self) -> EngineResult<HashMap<String, PrecisionRules>>;

    /// Release the underlying session. Called on cache eviction.
    async fn close(&self);
}
