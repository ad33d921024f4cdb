//! Position manager
//!
//! Creates position groups from signals, appends pyramid continuations,
//! drives exit-signal closes, and recomputes aggregate statistics from
//! child fills. Creation and pyramid appends run under coordination-layer
//! locks so concurrent promotions cannot double-create.

use chrono::Utc;
use rust_decimal::Decimal;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use crate::config::DcaGridConfig;
use crate::coordination::Coordination;
use crate::error::{EngineError, EngineResult};
use crate::exchange::{split_symbol, Exchange, ExchangeGateway, PrecisionRules};
use crate::grid;
use crate::services::order_service::{OrderService, SlippageAction};
use crate::store::Database;
use crate::types::{GroupStatus, PositionGroup, Pyramid, RiskAction, RiskActionType, Side};

const HUNDRED: Decimal = Decimal::from_parts(100, 0, 0, false, 0);
const CREATE_LOCK_TTL: Duration = Duration::from_secs(30);
const GROUP_LOCK_TTL: Duration = Duration::from_secs(30);

pub struct PositionManager {
    db: Database,
    coordination: Arc<Coordination>,
    gateway: Arc<ExchangeGateway>,
    orders: OrderService,
    /// Estimated exit fee percent applied to unrealized PnL.
    estimated_exit_fee_percent: Decimal,
}

impl PositionManager {
    pub fn new(
        db: Database,
        coordination: Arc<Coordination>,
        gateway: Arc<ExchangeGateway>,
        estimated_exit_fee_percent: Decimal,
    ) -> Self {
        let orders = OrderService::new(db.clone());
        Self {
            db,
            coordination,
            gateway,
            orders,
            estimated_exit_fee_percent,
        }
    }

    pub fn order_service(&self) -> &OrderService {
        &self.orders
    }

    async fn precision_for(
        &self,
        exchange: &dyn Exchange,
        symbol: &str,
    ) -> EngineResult<PrecisionRules> {
        let rules = exchange.get_precision_rules().await?;
        rules.get(symbol).cloned().ok_or_else(|| {
            EngineError::Precondition(format!("no precision rules for symbol '{symbol}'"))
        })
    }

    /// Create a new position group from a promoted signal: acquire the
    /// creation lock, re-check for a concurrent duplicate, compute the
    /// initial ladder, persist group + pyramid + legs atomically, then
    /// submit the ladder. Failure before submission marks the group
    /// `failed`; the caller releases its pool slot on error.
    #[allow(clippy::too_many_arguments)]
    pub async fn create_from_signal(
        &self,
        user: &crate::types::User,
        venue: &str,
        symbol: &str,
        timeframe: i64,
        side: Side,
        entry_price: Decimal,
        capital_usd: Decimal,
        dca_config: &DcaGridConfig,
    ) -> EngineResult<PositionGroup> {
        let lock_resource = format!(
            "position:new:{}:{}:{}:{}",
            user.id,
            symbol,
            timeframe,
            side.as_str()
        );
        let lock_token = Uuid::new_v4().to_string();
        if !self
            .coordination
            .acquire_lock(&lock_resource, &lock_token, CREATE_LOCK_TTL)
            .await
        {
            return Err(EngineError::Concurrency(format!(
                "creation lock contended for {symbol}"
            )));
        }

        let result = self
            .create_locked(
                user,
                venue,
                symbol,
                timeframe,
                side,
                entry_price,
                capital_usd,
                dca_config,
            )
            .await;

        self.coordination
            .release_lock(&lock_resource, &lock_token)
            .await;
        result
    }

    #[allow(clippy::too_many_arguments)]
    async fn create_locked(
        &self,
        user: &crate::types::User,
        venue: &str,
        symbol: &str,
        timeframe: i64,
        side: Side,
        entry_price: Decimal,
        capital_usd: Decimal,
        dca_config: &DcaGridConfig,
    ) -> EngineResult<PositionGroup> {
        // Guard against duplicate create under concurrent promotions.
        if let Some(existing) =
            self.db
                .find_group_for_signal(user.id, venue, symbol, timeframe, side, false)?
        {
            return Err(EngineError::Precondition(format!(
                "active group {} already exists for {symbol}",
                existing.id
            )));
        }

        let exchange = self.gateway.connector_for(user, venue)?;
        let precision = self.precision_for(exchange.as_ref(), symbol).await?;

        let base_price = if entry_price > Decimal::ZERO {
            entry_price
        } else {
            exchange.get_current_price(symbol).await?
        };

        let ladder = grid::build_ladder(base_price, dca_config, side, &precision, 0, capital_usd)?;

        let mut group = PositionGroup::new(
            user.id,
            venue,
            symbol,
            timeframe,
            side,
            base_price,
            dca_config.tp_mode,
            dca_config.tp_aggregate_percent,
            dca_config.max_pyramids,
        );
        group.pyramid_count = 1;
        group.total_dca_legs = ladder.len() as i64;
        group.allocated_capital_usd = capital_usd;

        let pyramid = Pyramid::new(group.id, 0, base_price, dca_config.clone());
        // Legs are persisted by the order service as they submit; the
        // atomic create covers group + pyramid so a crash cannot orphan.
        self.db.create_position_atomic(&group, &pyramid, &[])?;

        match self
            .orders
            .submit_entry_ladder(
                exchange.as_ref(),
                &group,
                &pyramid,
                &ladder,
                dca_config.entry_order_type,
            )
            .await
        {
            Ok(orders) => {
                let any_submitted = orders.iter().any(|o| o.exchange_order_id.is_some());
                group.status = if any_submitted {
                    GroupStatus::Live
                } else {
                    GroupStatus::Failed
                };
                self.db.update_group(&mut group)?;
                if group.status == GroupStatus::Failed {
                    return Err(EngineError::VenuePermanent(format!(
                        "no entry leg accepted for {symbol}"
                    )));
                }
                tracing::info!(
                    group = %group.id,
                    symbol,
                    legs = orders.len(),
                    "position group created"
                );
                Ok(group)
            }
            Err(e) => {
                group.status = GroupStatus::Failed;
                self.db.update_group(&mut group)?;
                Err(e)
            }
        }
    }

    /// Append a pyramid continuation to an existing group at the current
    /// market price. Runs under the per-group lock; counters advance via a
    /// single-statement update.
    pub async fn append_pyramid(
        &self,
        user: &crate::types::User,
        group_id: Uuid,
        capital_usd: Decimal,
        dca_config: &DcaGridConfig,
    ) -> EngineResult<Pyramid> {
        let lock_resource = format!("position:{group_id}");
        let lock_token = Uuid::new_v4().to_string();
        if !self
            .coordination
            .acquire_lock(&lock_resource, &lock_token, GROUP_LOCK_TTL)
            .await
        {
            return Err(EngineError::Concurrency(format!(
                "group lock contended for {group_id}"
            )));
        }

        let result = self
            .append_pyramid_locked(user, group_id, capital_usd, dca_config)
            .await;

        self.coordination
            .release_lock(&lock_resource, &lock_token)
            .await;
        result
    }

    async fn append_pyramid_locked(
        &self,
        user: &crate::types::User,
        group_id: Uuid,
        capital_usd: Decimal,
        dca_config: &DcaGridConfig,
    ) -> EngineResult<Pyramid> {
        let mut group = self
            .db
            .get_group(group_id)?
            .ok_or_else(|| EngineError::Invariant(format!("group {group_id} missing")))?;

        if !group.can_pyramid() {
            return Err(EngineError::Precondition(format!(
                "group {group_id} cannot pyramid (status={}, {}/{})",
                group.status.as_str(),
                group.pyramid_count,
                group.max_pyramids
            )));
        }

        let exchange = self.gateway.connector_for(user, &group.venue)?;
        let precision = self.precision_for(exchange.as_ref(), &group.symbol).await?;
        let base_price = exchange.get_current_price(&group.symbol).await?;

        let pyramid_index = group.pyramid_count;
        let ladder = grid::build_ladder(
            base_price,
            dca_config,
            group.side,
            &precision,
            pyramid_index,
            capital_usd,
        )?;

        let pyramid = Pyramid::new(group.id, pyramid_index, base_price, dca_config.clone());
        self.db.insert_pyramid(&pyramid)?;

        self.orders
            .submit_entry_ladder(
                exchange.as_ref(),
                &group,
                &pyramid,
                &ladder,
                crate::types::OrderType::Limit,
            )
            .await?;

        self.db
            .append_pyramid_counters(group.id, ladder.len() as i64)?;
        group.allocated_capital_usd += capital_usd;
        self.db.update_group(&mut group)?;

        tracing::info!(
            group = %group.id,
            pyramid = pyramid_index,
            legs = ladder.len(),
            "pyramid appended"
        );
        Ok(pyramid)
    }

    /// Close a group in response to an exit signal (or a manual/engine
    /// close): cancel resting orders, market-sell the filled quantity, and
    /// finalize accounting. On "insufficient balance" the close retries
    /// with the venue's free balance of the base currency.
    pub async fn handle_exit_signal(
        &self,
        user: &crate::types::User,
        group_id: Uuid,
        max_slippage_percent: Decimal,
        slippage_action: SlippageAction,
        exit_reason: &str,
    ) -> EngineResult<()> {
        let mut group = self
            .db
            .get_group(group_id)?
            .ok_or_else(|| EngineError::Invariant(format!("group {group_id} missing")))?;

        if group.status == GroupStatus::Closed {
            tracing::warn!(group = %group_id, "exit signal for already-closed group, skipping");
            return Ok(());
        }

        if group.status != GroupStatus::Closing {
            group.status = GroupStatus::Closing;
            group.closing_started_at = Some(Utc::now());
            self.db.update_group(&mut group)?;
        }

        let exchange = self.gateway.connector_for(user, &group.venue)?;
        let cancelled = self
            .orders
            .cancel_open_orders_for_group(exchange.as_ref(), group.id)
            .await?;
        tracing::info!(group = %group.id, cancelled, "cancelled resting orders for exit");

        let quantity = group.total_filled_quantity;
        if quantity <= Decimal::ZERO {
            group.status = GroupStatus::Closed;
            group.closed_at = Some(Utc::now());
            self.db.update_group(&mut group)?;
            self.cleanup_group_locks(group.id).await;
            return Ok(());
        }

        let expected = exchange.get_current_price(&group.symbol).await?;
        let fill = match self
            .orders
            .close_position_market(
                exchange.as_ref(),
                &group,
                quantity,
                expected,
                max_slippage_percent,
                slippage_action,
            )
            .await
        {
            Ok(fill) => fill,
            Err(e) if e.to_string().to_lowercase().contains("insufficient") => {
                self.retry_close_with_free_balance(exchange.as_ref(), &group, &e)
                    .await?
            }
            Err(e) => return Err(e),
        };

        let closed_quantity = fill.filled;
        let exit_value = fill.avg_price * closed_quantity;
        let cost_basis = group.total_invested_usd;
        let exit_fee = fill.fee;
        // Entry fees on legs already consumed by TP closes are part of the
        // realized figure those closes produced.
        let unconsumed_entry_fees: Decimal = self
            .db
            .filled_entry_legs(group.id)?
            .iter()
            .filter(|leg| !leg.tp_hit)
            .map(|leg| leg.fee)
            .sum();

        group.status = GroupStatus::Closed;
        group.closed_at = Some(Utc::now());
        group.total_exit_fees_usd += exit_fee;
        group.realized_pnl_usd += exit_value - cost_basis - exit_fee - unconsumed_entry_fees;
        group.total_filled_quantity = Decimal::ZERO;
        group.unrealized_pnl_usd = Decimal::ZERO;
        group.unrealized_pnl_percent = Decimal::ZERO;
        self.db.update_group(&mut group)?;

        self.save_close_action(
            &group,
            fill.avg_price,
            exit_reason,
            group.realized_pnl_usd,
            closed_quantity,
        )?;
        self.cleanup_group_locks(group.id).await;

        tracing::info!(
            group = %group.id,
            realized = %group.realized_pnl_usd,
            reason = exit_reason,
            "position group closed"
        );
        Ok(())
    }

    /// Insufficient-balance fallback: derive the base currency by
    /// stripping a known quote suffix, fetch the free balance, and retry
    /// with that amount.
    async fn retry_close_with_free_balance(
        &self,
        exchange: &dyn Exchange,
        group: &PositionGroup,
        original: &EngineError,
    ) -> EngineResult<crate::exchange::ExchangeOrder> {
        let (base, _) = split_symbol(&group.symbol);
        let free = exchange.fetch_free_balance().await?;
        let available = free.get(&base).copied().unwrap_or(Decimal::ZERO);

        if available <= Decimal::ZERO {
            tracing::error!(group = %group.id, base, "no free balance to retry close");
            return Err(EngineError::VenuePermanent(original.to_string()));
        }

        tracing::warn!(
            group = %group.id,
            available = %available,
            "retrying close with available balance"
        );
        exchange
            .place_order(
                &group.symbol,
                crate::types::OrderType::Market,
                group.side.opposite(),
                available,
                None,
            )
            .await
    }

    /// Recompute aggregate statistics from the union of filled entry legs
    /// and the current tick, in one write. The weighted average entry
    /// spans every filled entry leg; the live quantity and cost basis are
    /// net of close records (TP fills and offset partial closes).
    pub async fn refresh_group_statistics(
        &self,
        group: &mut PositionGroup,
        current_price: Decimal,
    ) -> EngineResult<()> {
        let filled = self.db.filled_entry_legs(group.id)?;

        let mut invested = Decimal::ZERO;
        let mut entry_quantity = Decimal::ZERO;
        let mut entry_fees = Decimal::ZERO;
        for leg in &filled {
            invested += leg.avg_fill_price * leg.filled_quantity;
            entry_quantity += leg.filled_quantity;
            entry_fees += leg.fee;
        }

        let closed_quantity: Decimal = self
            .db
            .close_records(group.id)?
            .iter()
            .map(|record| record.filled_quantity)
            .sum();
        let remaining = (entry_quantity - closed_quantity).max(Decimal::ZERO);

        group.filled_dca_legs = filled.len() as i64;
        group.total_filled_quantity = remaining;
        group.total_entry_fees_usd = entry_fees;
        group.weighted_avg_entry = if entry_quantity > Decimal::ZERO {
            invested / entry_quantity
        } else {
            Decimal::ZERO
        };
        let cost_basis = group.weighted_avg_entry * remaining;
        group.total_invested_usd = cost_basis;

        if remaining > Decimal::ZERO && current_price > Decimal::ZERO {
            let market_value = current_price * remaining;
            let estimated_exit_fee = market_value * self.estimated_exit_fee_percent / HUNDRED;
            group.unrealized_pnl_usd = market_value - cost_basis - estimated_exit_fee;
            group.unrealized_pnl_percent = if cost_basis > Decimal::ZERO {
                group.unrealized_pnl_usd / cost_basis * HUNDRED
            } else {
                Decimal::ZERO
            };
        } else {
            group.unrealized_pnl_usd = Decimal::ZERO;
            group.unrealized_pnl_percent = Decimal::ZERO;
        }

        // Fill-driven status advancement for open groups.
        if group.status.is_open() && remaining > Decimal::ZERO {
            group.status = GroupStatus::Active;
        }

        self.db.update_group(group)?;
        Ok(())
    }

    /// Record a close in the audit trail. Never fails the close flow.
    pub fn save_close_action(
        &self,
        group: &PositionGroup,
        exit_price: Decimal,
        exit_reason: &str,
        realized_pnl: Decimal,
        quantity_closed: Decimal,
    ) -> EngineResult<()> {
        let entry_price = group.weighted_avg_entry;
        let pnl_percent = if entry_price > Decimal::ZERO {
            match group.side {
                Side::Buy => (exit_price - entry_price) / entry_price * HUNDRED,
                Side::Sell => (entry_price - exit_price) / entry_price * HUNDRED,
            }
        } else {
            Decimal::ZERO
        };

        let close_time = group.closed_at.unwrap_or_else(Utc::now);
        let duration_seconds = (close_time - group.created_at).num_seconds();

        let action = RiskAction {
            id: Uuid::new_v4(),
            group_id: group.id,
            action_type: RiskActionType::from_exit_reason(exit_reason),
            exit_price,
            entry_price,
            pnl_percent,
            realized_pnl_usd: realized_pnl,
            quantity_closed,
            duration_seconds: Some(duration_seconds),
            notes: format!(
                "Position closed via {exit_reason}. Symbol: {}, Side: {}",
                group.symbol, group.side
            ),
            timestamp: Utc::now(),
        };

        if let Err(e) = self.db.insert_risk_action(&action) {
            tracing::error!(group = %group.id, error = %e, "failed to save close action");
        }
        Ok(())
    }

    /// Retire the per-group lock resources once a group is closed.
    async fn cleanup_group_locks(&self, group_id: Uuid) {
        self.coordination
            .cleanup(&format!("position:{group_id}"))
            .await;
    }
}
