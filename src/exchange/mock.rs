//! Packaged reference venue
//!
//! In-process matching engine over a small store of symbols, orders,
//! balances and prices. Limit orders fill when a configured price crosses
//! them, market orders fill immediately, and every trade charges a taker
//! fee. Admin methods (`set_price`, `inject_failure`, `credit`, `reset`)
//! drive test scenarios; the venue type "mock" bypasses the connector cache
//! and the circuit breaker.

use async_trait::async_trait;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::collections::HashMap;
use std::sync::Mutex;

use super::{split_symbol, AssetBalance, Exchange, ExchangeOrder, PrecisionRules};
use crate::error::{EngineError, EngineResult};
use crate::types::{OrderType, Side};

#[derive(Debug, Default)]
struct MockState {
    prices: HashMap<String, Decimal>,
    precision: HashMap<String, PrecisionRules>,
    balances: HashMap<String, AssetBalance>,
    orders: HashMap<String, ExchangeOrder>,
    next_id: u64,
    /// Pending injected failure: (message, remaining call count).
    injected_failure: Option<(String, u32)>,
    /// Injected failure consumed only by order placement.
    injected_order_failure: Option<(String, u32)>,
}

/// The in-process mock venue.
pub struct MockExchange {
    state: Mutex<MockState>,
    taker_fee: Decimal,
}

impl Default for MockExchange {
    fn default() -> Self {
        Self::new()
    }
}

impl MockExchange {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MockState::default()),
            taker_fee: dec!(0.001),
        }
    }

    // ---- admin surface ----

    /// Set the last price for a symbol and run the matching pass: any
    /// resting limit order the new price crosses is filled at its limit.
    pub fn set_price(&self, symbol: &str, price: Decimal) {
        let mut state = self.state.lock().unwrap();
        state.prices.insert(symbol.to_string(), price);

        let crossed: Vec<String> = state
            .orders
            .values()
            .filter(|order| {
                if order.symbol != symbol || !order.is_open() {
                    return false;
                }
                match (order.side, order.price) {
                    (Side::Buy, Some(limit)) => price <= limit,
                    (Side::Sell, Some(limit)) => price >= limit,
                    _ => false,
                }
            })
            .map(|order| order.id.clone())
            .collect();

        for id in crossed {
            Self::fill_locked(&mut state, &id, self.taker_fee);
        }
    }

    pub fn set_precision(&self, symbol: &str, rules: PrecisionRules) {
        self.state
            .lock()
            .unwrap()
            .precision
            .insert(symbol.to_string(), rules);
    }

    /// Make the next `count` calls fail with `message`.
    pub fn inject_failure(&self, message: &str, count: u32) {
        self.state.lock().unwrap().injected_failure = Some((message.to_string(), count));
    }

    /// Make the next `count` order placements fail with `message`, leaving
    /// read calls untouched.
    pub fn inject_order_failure(&self, message: &str, count: u32) {
        self.state.lock().unwrap().injected_order_failure = Some((message.to_string(), count));
    }

    /// Credit an asset balance.
    pub fn credit(&self, asset: &str, amount: Decimal) {
        let mut state = self.state.lock().unwrap();
        let balance = state.balances.entry(asset.to_string()).or_default();
        balance.total += amount;
        balance.free += amount;
    }

    pub fn reset(&self) {
        *self.state.lock().unwrap() = MockState::default();
    }

    /// Number of resting orders, for assertions.
    pub fn open_order_count(&self) -> usize {
        self.state
            .lock()
            .unwrap()
            .orders
            .values()
            .filter(|order| order.is_open())
            .count()
    }

    // ---- internals ----

    fn take_injected_failure(state: &mut MockState) -> Option<String> {
        if let Some((message, remaining)) = state.injected_failure.take() {
            if remaining > 1 {
                state.injected_failure = Some((message.clone(), remaining - 1));
            }
            return Some(message);
        }
        None
    }

    fn take_injected_order_failure(state: &mut MockState) -> Option<String> {
        if let Some((message, remaining)) = state.injected_order_failure.take() {
            if remaining > 1 {
                state.injected_order_failure = Some((message.clone(), remaining - 1));
            }
            return Some(message);
        }
        None
    }

    /// Fill an order completely: limit orders at their limit price, market
    /// orders at the current price. Adjusts asset balances; balances may go
    /// negative, tests fund the account when the number matters.
    fn fill_locked(state: &mut MockState, order_id: &str, taker_fee: Decimal) {
        let current_price = match state.orders.get(order_id) {
            Some(order) => state
                .prices
                .get(&order.symbol)
                .copied()
                .unwrap_or(Decimal::ZERO),
            None => return,
        };

        let (symbol, side, quantity, fill_price, fee) = {
            let order = state.orders.get_mut(order_id).unwrap();
            let fill_price = order.price.unwrap_or(current_price);
            order.status = "closed".to_string();
            order.filled = order.quantity;
            order.avg_price = fill_price;
            let value = fill_price * order.quantity;
            order.fee = value * taker_fee;
            let (_, quote) = split_symbol(&order.symbol);
            order.fee_currency = if quote.is_empty() {
                None
            } else {
                Some(quote)
            };
            (
                order.symbol.clone(),
                order.side,
                order.quantity,
                fill_price,
                order.fee,
            )
        };

        let (base, quote) = split_symbol(&symbol);
        let value = fill_price * quantity;
        if !quote.is_empty() {
            let quote_balance = state.balances.entry(quote).or_default();
            match side {
                Side::Buy => {
                    quote_balance.total -= value + fee;
                    quote_balance.free -= value + fee;
                }
                Side::Sell => {
                    quote_balance.total += value - fee;
                    quote_balance.free += value - fee;
                }
            }
        }
        let base_balance = state.balances.entry(base).or_default();
        match side {
            Side::Buy => {
                base_balance.total += quantity;
                base_balance.free += quantity;
            }
            Side::Sell => {
                base_balance.total -= quantity;
                base_balance.free -= quantity;
            }
        }
    }
}

#[async_trait]
impl Exchange for MockExchange {
    async fn place_order(
        &self,
        symbol: &str,
        order_type: OrderType,
        side: Side,
        quantity: Decimal,
        price: Option<Decimal>,
    ) -> EngineResult<ExchangeOrder> {
        let mut state = self.state.lock().unwrap();
        if let Some(message) = Self::take_injected_failure(&mut state) {
            return Err(EngineError::from_venue_message(&message));
        }
        if let Some(message) = Self::take_injected_order_failure(&mut state) {
            return Err(EngineError::from_venue_message(&message));
        }

        let current = state.prices.get(symbol).copied().unwrap_or(Decimal::ZERO);
        if order_type == OrderType::Market && current <= Decimal::ZERO {
            return Err(EngineError::VenuePermanent(format!(
                "invalid symbol {symbol}: no price configured"
            )));
        }
        if order_type == OrderType::Limit && price.is_none() {
            return Err(EngineError::Validation(
                "limit order requires a price".to_string(),
            ));
        }

        state.next_id += 1;
        let id = format!("mock-{}", state.next_id);
        let order = ExchangeOrder {
            id: id.clone(),
            symbol: symbol.to_string(),
            side,
            order_type,
            // Market orders carry no limit price; they fill at the current tick.
            price: if order_type == OrderType::Market {
                None
            } else {
                price
            },
            quantity,
            status: "open".to_string(),
            filled: Decimal::ZERO,
            avg_price: Decimal::ZERO,
            fee: Decimal::ZERO,
            fee_currency: None,
        };
        state.orders.insert(id.clone(), order);

        let fills_now = match order_type {
            OrderType::Market => true,
            OrderType::Limit => {
                let limit = price.unwrap_or(Decimal::ZERO);
                current > Decimal::ZERO
                    && match side {
                        Side::Buy => current <= limit,
                        Side::Sell => current >= limit,
                    }
            }
        };
        if fills_now {
            Self::fill_locked(&mut state, &id, self.taker_fee);
        }

        Ok(state.orders[&id].clone())
    }

    async fn get_order_status(&self, order_id: &str, _symbol: &str) -> EngineResult<ExchangeOrder> {
        let mut state = self.state.lock().unwrap();
        if let Some(message) = Self::take_injected_failure(&mut state) {
            return Err(EngineError::from_venue_message(&message));
        }
        state
            .orders
            .get(order_id)
            .cloned()
            .ok_or_else(|| EngineError::VenuePermanent(format!("order {order_id} not found")))
    }

    async fn cancel_order(&self, order_id: &str, _symbol: &str) -> EngineResult<()> {
        let mut state = self.state.lock().unwrap();
        if let Some(message) = Self::take_injected_failure(&mut state) {
            return Err(EngineError::from_venue_message(&message));
        }
        match state.orders.get_mut(order_id) {
            Some(order) if order.is_open() => {
                order.status = "canceled".to_string();
                Ok(())
            }
            Some(_) => Ok(()),
            None => Err(EngineError::VenuePermanent(format!(
                "order {order_id} not found"
            ))),
        }
    }

    async fn fetch_open_orders(&self, symbol: Option<&str>) -> EngineResult<Vec<ExchangeOrder>> {
        let mut state = self.state.lock().unwrap();
        if let Some(message) = Self::take_injected_failure(&mut state) {
            return Err(EngineError::from_venue_message(&message));
        }
        Ok(state
            .orders
            .values()
            .filter(|order| order.is_open())
            .filter(|order| symbol.map_or(true, |s| order.symbol == s))
            .cloned()
            .collect())
    }

    async fn get_current_price(&self, symbol: &str) -> EngineResult<Decimal> {
        let mut state = self.state.lock().unwrap();
        if let Some(message) = Self::take_injected_failure(&mut state) {
            return Err(EngineError::from_venue_message(&message));
        }
        state
            .prices
            .get(symbol)
            .copied()
            .ok_or_else(|| EngineError::VenuePermanent(format!("invalid symbol {symbol}")))
    }

    async fn get_all_tickers(&self) -> EngineResult<HashMap<String, Decimal>> {
        Ok(self.state.lock().unwrap().prices.clone())
    }

    async fn fetch_balance(&self) -> EngineResult<HashMap<String, AssetBalance>> {
        let mut state = self.state.lock().unwrap();
        if let Some(message) = Self::take_injected_failure(&mut state) {
            return Err(EngineError::from_venue_message(&message));
        }
        Ok(state.balances.clone())
    }

    async fn get_precision_rules(&self) -> EngineResult<HashMap<String, PrecisionRules>> {
        let state = self.state.lock().unwrap();
        if state.precision.is_empty() {
            // Default rules for any configured symbol
            return Ok(state
                .prices
                .keys()
                .map(|symbol| (symbol.clone(), PrecisionRules::default()))
                .collect());
        }
        Ok(state.precision.clone())
    }

    async fn close(&self) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_market_order_fills_immediately() {
        let venue = MockExchange::new();
        venue.set_price("SOLUSDT", dec!(100));

        let order = venue
            .place_order("SOLUSDT", OrderType::Market, Side::Buy, dec!(2), None)
            .await
            .unwrap();
        assert_eq!(order.status, "closed");
        assert_eq!(order.avg_price, dec!(100));
        assert_eq!(order.filled, dec!(2));
        // 0.1% taker fee on 200 USDT
        assert_eq!(order.fee, dec!(0.2000));
        assert_eq!(order.fee_currency.as_deref(), Some("USDT"));
    }

    #[tokio::test]
    async fn test_limit_order_rests_until_price_crosses() {
        let venue = MockExchange::new();
        venue.set_price("SOLUSDT", dec!(100));

        let order = venue
            .place_order(
                "SOLUSDT",
                OrderType::Limit,
                Side::Sell,
                dec!(2),
                Some(dec!(102)),
            )
            .await
            .unwrap();
        assert_eq!(order.status, "open");
        assert_eq!(venue.open_order_count(), 1);

        venue.set_price("SOLUSDT", dec!(103));
        let status = venue.get_order_status(&order.id, "SOLUSDT").await.unwrap();
        assert_eq!(status.status, "closed");
        assert_eq!(status.avg_price, dec!(102));
        assert_eq!(venue.open_order_count(), 0);
    }

    #[tokio::test]
    async fn test_buy_limit_below_market_rests() {
        let venue = MockExchange::new();
        venue.set_price("BTCUSDT", dec!(50000));

        let order = venue
            .place_order(
                "BTCUSDT",
                OrderType::Limit,
                Side::Buy,
                dec!(0.1),
                Some(dec!(49000)),
            )
            .await
            .unwrap();
        assert_eq!(order.status, "open");

        venue.set_price("BTCUSDT", dec!(48900));
        let status = venue.get_order_status(&order.id, "BTCUSDT").await.unwrap();
        assert_eq!(status.status, "closed");
        assert_eq!(status.avg_price, dec!(49000));
    }

    #[tokio::test]
    async fn test_fill_updates_balances() {
        let venue = MockExchange::new();
        venue.set_price("SOLUSDT", dec!(100));
        venue.credit("USDT", dec!(1000));

        venue
            .place_order("SOLUSDT", OrderType::Market, Side::Buy, dec!(2), None)
            .await
            .unwrap();

        let balances = venue.fetch_balance().await.unwrap();
        assert_eq!(balances["SOL"].free, dec!(2));
        // 1000 - 200 - 0.2 fee
        assert_eq!(balances["USDT"].free, dec!(799.8000));
    }

    #[tokio::test]
    async fn test_injected_failure_consumed_per_call() {
        let venue = MockExchange::new();
        venue.set_price("SOLUSDT", dec!(100));
        venue.inject_failure("gateway timeout", 1);

        assert!(venue.get_current_price("SOLUSDT").await.is_err());
        assert!(venue.get_current_price("SOLUSDT").await.is_ok());
    }

    #[tokio::test]
    async fn test_cancel_unknown_order_is_error() {
        let venue = MockExchange::new();
        let err = venue.cancel_order("nope", "SOLUSDT").await.unwrap_err();
        assert!(err.to_string().contains("not found"));
    }
}
