//! Order service
//!
//! Places and cancels entry, take-profit, and close orders, and owns the
//! TP replay safeguard: before placing a TP for a filled entry leg it scans
//! the venue's open orders and adopts an equivalent order instead of
//! placing a duplicate. This keeps TP placement at-most-once per leg even
//! when a transaction rolled back after the venue call succeeded.

use chrono::Utc;
use rust_decimal::Decimal;
use uuid::Uuid;

use crate::error::{EngineError, EngineResult};
use crate::exchange::{Exchange, ExchangeOrder};
use crate::grid::{round_to_tick, GridLevel};
use crate::store::Database;
use crate::types::{
    DcaOrder, OrderStatus, OrderType, PositionGroup, Pyramid, Side, TP_FILL_LEG_INDEX,
};

const HUNDRED: Decimal = Decimal::from_parts(100, 0, 0, false, 0);
/// Relative price tolerance for TP adoption (0.1%).
const TP_PRICE_TOLERANCE: Decimal = Decimal::from_parts(1, 0, 0, false, 3);
/// Relative quantity tolerance for TP adoption (0.5%).
const TP_QTY_TOLERANCE: Decimal = Decimal::from_parts(5, 0, 0, false, 3);

/// What to do when a market close drifts past the slippage bound.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlippageAction {
    /// Log and continue.
    Warn,
    /// Fail the close.
    Reject,
}

pub struct OrderService {
    db: Database,
}

impl OrderService {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Submit one pyramid's ladder. Each leg is persisted `pending` before
    /// the venue call; acknowledged legs move to `open` (or straight to
    /// `filled` when the venue fills on ack). Permanent submit failures
    /// mark the leg `failed`; transient ones leave it `pending` for the
    /// reconciler to retry resolution.
    pub async fn submit_entry_ladder(
        &self,
        exchange: &dyn Exchange,
        group: &PositionGroup,
        pyramid: &Pyramid,
        ladder: &[GridLevel],
        entry_order_type: OrderType,
    ) -> EngineResult<Vec<DcaOrder>> {
        let mut orders = Vec::with_capacity(ladder.len());

        for level in ladder {
            // Only the base leg honours a market entry; deeper legs always
            // rest as limits below the base price.
            let order_type = if level.leg_index == 0 {
                entry_order_type
            } else {
                OrderType::Limit
            };

            let mut order = DcaOrder {
                id: Uuid::new_v4(),
                group_id: group.id,
                pyramid_id: pyramid.id,
                leg_index: level.leg_index,
                symbol: group.symbol.clone(),
                side: Side::Buy,
                order_type,
                price: level.price,
                quantity: level.quantity,
                gap_percent: level.gap_percent,
                weight_percent: level.weight_percent,
                tp_percent: level.tp_percent,
                tp_price: level.tp_price,
                exchange_order_id: None,
                status: OrderStatus::Pending,
                filled_quantity: Decimal::ZERO,
                avg_fill_price: Decimal::ZERO,
                fee: Decimal::ZERO,
                fee_currency: None,
                submitted_at: None,
                filled_at: None,
                error: None,
                tp_order_id: None,
                tp_hit: false,
            };
            self.db.insert_order(&order)?;

            let price_arg = match order_type {
                OrderType::Limit => Some(level.price),
                OrderType::Market => None,
            };
            match exchange
                .place_order(&group.symbol, order_type, Side::Buy, level.quantity, price_arg)
                .await
            {
                Ok(ack) => {
                    order.exchange_order_id = Some(ack.id.clone());
                    order.submitted_at = Some(Utc::now());
                    order.status = OrderStatus::from_exchange(&ack.status, OrderStatus::Open);
                    if order.status == OrderStatus::Filled {
                        order.filled_quantity = ack.filled;
                        order.avg_fill_price = ack.avg_price;
                        order.fee = ack.fee;
                        order.fee_currency = ack.fee_currency.clone();
                        order.filled_at = Some(Utc::now());
                    }
                    self.db.update_order(&order)?;
                }
                Err(e) if e.is_transient() => {
                    tracing::warn!(
                        group = %group.id,
                        leg = level.leg_index,
                        error = %e,
                        "transient submit failure, leaving leg pending"
                    );
                    order.error = Some(e.to_string());
                    self.db.update_order(&order)?;
                }
                Err(e) => {
                    tracing::error!(
                        group = %group.id,
                        leg = level.leg_index,
                        error = %e,
                        "entry leg submission failed"
                    );
                    order.status = OrderStatus::Failed;
                    order.error = Some(e.to_string());
                    self.db.update_order(&order)?;
                }
            }
            orders.push(order);
        }

        Ok(orders)
    }

    /// Place the TP for a filled entry leg, with the duplicate safeguard:
    /// if the venue already shows exactly one equivalent opposite-side
    /// order, adopt its id instead of placing a new one.
    pub async fn place_tp_with_dedup(
        &self,
        exchange: &dyn Exchange,
        leg: &mut DcaOrder,
        tick_size: Decimal,
    ) -> EngineResult<()> {
        if leg.tp_order_id.is_some() || leg.filled_quantity <= Decimal::ZERO {
            return Ok(());
        }

        let tp_price = round_to_tick(leg.adjusted_tp_price(), tick_size);
        let tp_side = leg.side.opposite();

        let open_orders = exchange.fetch_open_orders(Some(&leg.symbol)).await?;
        let price_tolerance = tick_size.max(tp_price * TP_PRICE_TOLERANCE);
        let qty_tolerance = leg.filled_quantity * TP_QTY_TOLERANCE;

        let matches: Vec<&ExchangeOrder> = open_orders
            .iter()
            .filter(|order| {
                order.side == tp_side
                    && order
                        .price
                        .map(|p| (p - tp_price).abs() <= price_tolerance)
                        .unwrap_or(false)
                    && (order.quantity - leg.filled_quantity).abs() <= qty_tolerance
            })
            .collect();

        if matches.len() == 1 {
            let adopted = matches[0].id.clone();
            tracing::info!(
                leg = %leg.id,
                tp_order = %adopted,
                "adopted existing venue TP order instead of placing a duplicate"
            );
            leg.tp_order_id = Some(adopted);
            self.db.update_order(leg)?;
            return Ok(());
        }

        let ack = exchange
            .place_order(
                &leg.symbol,
                OrderType::Limit,
                tp_side,
                leg.filled_quantity,
                Some(tp_price),
            )
            .await?;
        leg.tp_order_id = Some(ack.id);
        self.db.update_order(leg)?;
        tracing::info!(
            leg = %leg.id,
            price = %tp_price,
            quantity = %leg.filled_quantity,
            "placed take-profit order"
        );
        Ok(())
    }

    /// Market close with a slippage bound. `expected_price` is what the
    /// caller observed when deciding to close; the actual tick is fetched
    /// again here and compared.
    pub async fn close_position_market(
        &self,
        exchange: &dyn Exchange,
        group: &PositionGroup,
        quantity: Decimal,
        expected_price: Decimal,
        max_slippage_percent: Decimal,
        action: SlippageAction,
    ) -> EngineResult<ExchangeOrder> {
        let current = exchange.get_current_price(&group.symbol).await?;
        if expected_price > Decimal::ZERO {
            let slippage = ((current - expected_price).abs() / expected_price) * HUNDRED;
            if slippage > max_slippage_percent {
                match action {
                    SlippageAction::Reject => {
                        return Err(EngineError::SlippageExceeded {
                            actual: slippage,
                            max: max_slippage_percent,
                        });
                    }
                    SlippageAction::Warn => {
                        tracing::warn!(
                            group = %group.id,
                            slippage = %slippage,
                            max = %max_slippage_percent,
                            "close slippage above bound, continuing"
                        );
                    }
                }
            }
        }

        exchange
            .place_order(
                &group.symbol,
                OrderType::Market,
                group.side.opposite(),
                quantity,
                None,
            )
            .await
    }

    /// Best-effort cancel of every resting entry and TP order for a group.
    /// "Order not found" is a no-op. Returns the number of venue cancels
    /// issued.
    pub async fn cancel_open_orders_for_group(
        &self,
        exchange: &dyn Exchange,
        group_id: Uuid,
    ) -> EngineResult<u32> {
        let mut cancelled = 0;

        for mut order in self.db.open_orders_for_group(group_id)? {
            if let Some(exchange_id) = order.exchange_order_id.clone() {
                match exchange.cancel_order(&exchange_id, &order.symbol).await {
                    Ok(()) => cancelled += 1,
                    Err(e) if EngineError::is_not_found(&e.to_string()) => {}
                    Err(e) => {
                        tracing::warn!(order = %order.id, error = %e, "cancel failed");
                        continue;
                    }
                }
            }
            order.status = OrderStatus::Cancelled;
            self.db.update_order(&order)?;
        }

        // Resting TPs on filled legs also come down before a close.
        for order in self.db.filled_entry_legs(group_id)? {
            if order.tp_hit {
                continue;
            }
            if let Some(tp_id) = &order.tp_order_id {
                match exchange.cancel_order(tp_id, &order.symbol).await {
                    Ok(()) => cancelled += 1,
                    Err(e) if EngineError::is_not_found(&e.to_string()) => {}
                    Err(e) => {
                        tracing::warn!(order = %order.id, error = %e, "tp cancel failed")
                    }
                }
            }
        }

        Ok(cancelled)
    }

    /// Persist the synthetic TP-fill record (leg index 999) carrying the
    /// realized proceeds of a TP close. Excluded from entry queries.
    pub fn record_tp_fill(
        &self,
        group: &PositionGroup,
        pyramid_id: Uuid,
        fill: &ExchangeOrder,
    ) -> EngineResult<DcaOrder> {
        let record = DcaOrder {
            id: Uuid::new_v4(),
            group_id: group.id,
            pyramid_id,
            leg_index: TP_FILL_LEG_INDEX,
            symbol: group.symbol.clone(),
            side: group.side.opposite(),
            order_type: fill.order_type,
            price: fill.avg_price,
            quantity: fill.quantity,
            gap_percent: Decimal::ZERO,
            weight_percent: Decimal::ZERO,
            tp_percent: Decimal::ZERO,
            tp_price: Decimal::ZERO,
            exchange_order_id: Some(fill.id.clone()),
            status: OrderStatus::Filled,
            filled_quantity: fill.filled,
            avg_fill_price: fill.avg_price,
            fee: fill.fee,
            fee_currency: fill.fee_currency.clone(),
            submitted_at: Some(Utc::now()),
            filled_at: Some(Utc::now()),
            error: None,
            tp_order_id: None,
            tp_hit: true,
        };
        self.db.insert_order(&record)?;
        Ok(record)
    }
}
