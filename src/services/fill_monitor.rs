//! Order fill monitor
//!
//! Leader-only reconciler. Each cycle loads every order the venue might
//! have moved (one batched query), advances local state from venue state,
//! places missing TPs through the dedup safeguard, evaluates the
//! take-profit policy per group, and finalizes groups whose quantity has
//! been fully consumed. Re-running a cycle against unchanged venue state
//! produces no writes.

use chrono::Utc;
use itertools::Itertools;
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::Arc;
use uuid::Uuid;

use crate::coordination::{Coordination, ServiceHealth};
use crate::error::{EngineError, EngineResult};
use crate::exchange::{Exchange, ExchangeGateway};
use crate::services::position_manager::PositionManager;
use crate::services::take_profit;
use crate::store::Database;
use crate::types::{
    DcaOrder, GroupStatus, OrderStatus, OrderType, PositionGroup, PyramidStatus, User,
};

pub const SERVICE_NAME: &str = "order_fill_monitor";

/// Per-cycle counters, for logging and tests.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CycleReport {
    pub orders_checked: usize,
    pub orders_updated: usize,
    pub fills_observed: usize,
    pub tps_placed: usize,
    pub tp_hits: usize,
    pub groups_closed: usize,
    pub errors: usize,
}

pub struct FillMonitor {
    db: Database,
    gateway: Arc<ExchangeGateway>,
    positions: Arc<PositionManager>,
    coordination: Arc<Coordination>,
}

impl FillMonitor {
    pub fn new(
        db: Database,
        gateway: Arc<ExchangeGateway>,
        positions: Arc<PositionManager>,
        coordination: Arc<Coordination>,
    ) -> Self {
        Self {
            db,
            gateway,
            positions,
            coordination,
        }
    }

    /// One reconciliation pass. Per-group failures are counted and the
    /// cycle continues with the next group.
    pub async fn run_cycle(&self) -> EngineResult<CycleReport> {
        let mut report = CycleReport::default();

        let batch = self.db.reconciliation_batch()?;
        report.orders_checked = batch.len();

        // The batch is ordered by group id; chunk it into per-group work.
        let grouped = batch.into_iter().chunk_by(|order| order.group_id);
        let by_group: Vec<(Uuid, Vec<DcaOrder>)> = grouped
            .into_iter()
            .map(|(group_id, orders)| (group_id, orders.collect()))
            .collect();

        for (group_id, orders) in by_group {
            match self.reconcile_group(group_id, orders, &mut report).await {
                Ok(()) => {}
                Err(e) => {
                    report.errors += 1;
                    tracing::error!(group = %group_id, error = %e, "group reconciliation failed");
                }
            }
        }

        self.coordination
            .set_service_health(SERVICE_NAME, &ServiceHealth::running())
            .await;
        Ok(report)
    }

    async fn reconcile_group(
        &self,
        group_id: Uuid,
        orders: Vec<DcaOrder>,
        report: &mut CycleReport,
    ) -> EngineResult<()> {
        let Some(mut group) = self.db.get_group(group_id)? else {
            return Err(EngineError::Invariant(format!(
                "orders reference missing group {group_id}"
            )));
        };
        if group.status == GroupStatus::Closed || group.status == GroupStatus::Failed {
            return Ok(());
        }
        let Some(user) = self.db.get_user(group.user_id)? else {
            return Err(EngineError::Invariant(format!(
                "group {group_id} references missing user"
            )));
        };

        let exchange = self.gateway.connector_for(&user, &group.venue)?;
        let tick_size = self.tick_size_for(exchange.as_ref(), &group.symbol).await;

        let mut state_changed = false;
        for order in orders {
            match self
                .reconcile_order(exchange.as_ref(), &group, order, tick_size, report)
                .await
            {
                Ok(changed) => state_changed |= changed,
                Err(e) => {
                    report.errors += 1;
                    tracing::warn!(error = %e, "order reconciliation failed");
                }
            }
        }

        let current_price = exchange.get_current_price(&group.symbol).await?;
        let filled_count = self.db.filled_entry_legs(group.id)?.len() as i64;
        if state_changed || group.filled_dca_legs != filled_count {
            self.positions
                .refresh_group_statistics(&mut group, current_price)
                .await?;
        }

        // Evaluate the TP policy over filled un-hit legs. Legs whose TP
        // rests on the venue close through that order; the evaluator
        // drives market closes for the rest (aggregate triggers).
        let filled_legs = self.db.filled_entry_legs(group.id)?;
        let unhit: Vec<DcaOrder> = filled_legs
            .iter()
            .filter(|leg| !leg.tp_hit)
            .cloned()
            .collect();
        let to_close = take_profit::legs_to_close(&group, &unhit, current_price);
        if !to_close.is_empty() {
            let ids: Vec<Uuid> = to_close.iter().map(|leg| leg.id).collect();
            self.close_legs_at_market(exchange.as_ref(), &mut group, &ids, report)
                .await?;
            self.positions
                .refresh_group_statistics(&mut group, current_price)
                .await?;
        }

        self.sync_pyramid_statuses(group.id)?;
        self.maybe_finalize_group(&mut group, report)?;
        Ok(())
    }

    /// Derive each pyramid's status from its legs. Idempotent: only
    /// changed rows are written.
    fn sync_pyramid_statuses(&self, group_id: Uuid) -> EngineResult<()> {
        let orders = self.db.orders_for_group(group_id)?;
        for pyramid in self.db.pyramids_for_group(group_id)? {
            let legs: Vec<&DcaOrder> = orders
                .iter()
                .filter(|o| o.is_entry() && o.pyramid_id == pyramid.id)
                .collect();
            if legs.is_empty() {
                continue;
            }

            let all_filled = legs.iter().all(|o| o.status == OrderStatus::Filled);
            let any_filled = legs.iter().any(|o| o.status == OrderStatus::Filled);
            let all_terminal = legs.iter().all(|o| o.status.is_terminal());

            let derived = if all_filled && legs.iter().all(|o| o.tp_hit) {
                PyramidStatus::Closed
            } else if all_filled {
                PyramidStatus::Filled
            } else if any_filled {
                PyramidStatus::PartiallyFilled
            } else if all_terminal {
                PyramidStatus::Cancelled
            } else {
                PyramidStatus::Pending
            };

            if derived != pyramid.status {
                self.db.update_pyramid_status(pyramid.id, derived)?;
            }
        }
        Ok(())
    }

    async fn tick_size_for(&self, exchange: &dyn Exchange, symbol: &str) -> Decimal {
        match exchange.get_precision_rules().await {
            Ok(rules) => rules
                .get(symbol)
                .map(|r| r.tick_size)
                .unwrap_or_else(|| crate::exchange::PrecisionRules::default().tick_size),
            Err(_) => crate::exchange::PrecisionRules::default().tick_size,
        }
    }

    /// Reconcile one order row. Returns true when group accounting needs
    /// a refresh.
    async fn reconcile_order(
        &self,
        exchange: &dyn Exchange,
        group: &PositionGroup,
        mut order: DcaOrder,
        tick_size: Decimal,
        report: &mut CycleReport,
    ) -> EngineResult<bool> {
        // Filled entry leg: its venue TP is what moves.
        if order.status == OrderStatus::Filled {
            return self
                .reconcile_tp_order(exchange, group, order, tick_size, report)
                .await;
        }

        let Some(exchange_id) = order.exchange_order_id.clone() else {
            // Never acknowledged: nothing to reconcile until resubmission.
            return Ok(false);
        };

        let venue_order = match exchange.get_order_status(&exchange_id, &order.symbol).await {
            Ok(venue_order) => venue_order,
            Err(e) if EngineError::is_not_found(&e.to_string()) => {
                // Gone from the venue: cancelled out of band.
                order.status = OrderStatus::Cancelled;
                self.db.update_order(&order)?;
                report.orders_updated += 1;
                tracing::warn!(order = %order.id, "order missing on venue, marked cancelled");
                return Ok(true);
            }
            Err(e) => return Err(e),
        };

        let new_status = OrderStatus::from_exchange(&venue_order.status, order.status);
        if new_status == order.status {
            return Ok(false);
        }

        report.orders_updated += 1;
        match new_status {
            OrderStatus::Filled => {
                report.fills_observed += 1;
                self.db.mark_order_filled(
                    order.id,
                    venue_order.filled,
                    venue_order.avg_price,
                    venue_order.fee,
                    venue_order.fee_currency.as_deref(),
                )?;
                order.status = OrderStatus::Filled;
                order.filled_quantity = venue_order.filled;
                order.avg_fill_price = venue_order.avg_price;
                tracing::info!(
                    order = %order.id,
                    leg = order.leg_index,
                    price = %venue_order.avg_price,
                    quantity = %venue_order.filled,
                    "entry leg filled"
                );

                if group.tp_mode.places_leg_tp() && order.tp_order_id.is_none() {
                    self.positions
                        .order_service()
                        .place_tp_with_dedup(exchange, &mut order, tick_size)
                        .await?;
                    report.tps_placed += 1;
                }
            }
            other => {
                order.status = other;
                self.db.update_order(&order)?;
            }
        }
        Ok(true)
    }

    /// Check whether a filled leg's resting TP has executed; place the TP
    /// (through the dedup safeguard) when the leg has none yet.
    async fn reconcile_tp_order(
        &self,
        exchange: &dyn Exchange,
        group: &PositionGroup,
        mut leg: DcaOrder,
        tick_size: Decimal,
        report: &mut CycleReport,
    ) -> EngineResult<bool> {
        let Some(tp_id) = leg.tp_order_id.clone() else {
            if group.tp_mode.places_leg_tp() && leg.filled_quantity > Decimal::ZERO {
                self.positions
                    .order_service()
                    .place_tp_with_dedup(exchange, &mut leg, tick_size)
                    .await?;
                report.tps_placed += 1;
            }
            return Ok(false);
        };

        let venue_order = match exchange.get_order_status(&tp_id, &leg.symbol).await {
            Ok(venue_order) => venue_order,
            Err(e) if EngineError::is_not_found(&e.to_string()) => {
                // The TP vanished; clear the link so the next sweep
                // re-places it (the dedup safeguard rechecks the venue).
                leg.tp_order_id = None;
                self.db.update_order(&leg)?;
                report.orders_updated += 1;
                return Ok(false);
            }
            Err(e) => return Err(e),
        };

        if OrderStatus::from_exchange(&venue_order.status, OrderStatus::Open)
            != OrderStatus::Filled
        {
            return Ok(false);
        }

        report.tp_hits += 1;
        leg.tp_hit = true;
        self.db.update_order(&leg)?;

        let record = self
            .positions
            .order_service()
            .record_tp_fill(group, leg.pyramid_id, &venue_order)?;

        // Realize the leg's PnL into the group.
        let proceeds = venue_order.avg_price * venue_order.filled;
        let cost = leg.avg_fill_price * venue_order.filled;
        let realized = proceeds - cost - leg.fee - venue_order.fee;
        let mut group = self
            .db
            .get_group(group.id)?
            .ok_or_else(|| EngineError::Invariant(format!("group {} vanished", group.id)))?;
        group.realized_pnl_usd += realized;
        group.total_exit_fees_usd += venue_order.fee;
        self.db.update_group(&mut group)?;

        tracing::info!(
            leg = %leg.id,
            record = %record.id,
            realized = %realized,
            "take-profit filled on venue"
        );
        Ok(true)
    }

    /// Market-close specific legs after an evaluator trigger. Resting TPs
    /// come down first so the close cannot double-sell.
    async fn close_legs_at_market(
        &self,
        exchange: &dyn Exchange,
        group: &mut PositionGroup,
        leg_ids: &[Uuid],
        report: &mut CycleReport,
    ) -> EngineResult<()> {
        for leg_id in leg_ids {
            let Some(mut leg) = self.db.get_order(*leg_id)? else {
                continue;
            };
            if leg.tp_hit || leg.filled_quantity <= Decimal::ZERO {
                continue;
            }

            if let Some(tp_id) = leg.tp_order_id.clone() {
                match exchange.cancel_order(&tp_id, &leg.symbol).await {
                    Ok(()) => {}
                    Err(e) if EngineError::is_not_found(&e.to_string()) => {}
                    Err(e) => {
                        tracing::warn!(leg = %leg.id, error = %e, "tp cancel before close failed");
                        continue;
                    }
                }
            }

            let fill = exchange
                .place_order(
                    &leg.symbol,
                    OrderType::Market,
                    leg.side.opposite(),
                    leg.filled_quantity,
                    None,
                )
                .await?;

            leg.tp_hit = true;
            self.db.update_order(&leg)?;
            self.positions
                .order_service()
                .record_tp_fill(group, leg.pyramid_id, &fill)?;

            let proceeds = fill.avg_price * fill.filled;
            let cost = leg.avg_fill_price * fill.filled;
            let realized = proceeds - cost - leg.fee - fill.fee;
            group.realized_pnl_usd += realized;
            group.total_exit_fees_usd += fill.fee;
            self.db.update_group(group)?;

            report.tp_hits += 1;
            tracing::info!(
                leg = %leg.id,
                realized = %realized,
                "leg closed at market by take-profit evaluator"
            );
        }
        Ok(())
    }

    /// Close out a group once every leg is terminal and no quantity
    /// remains to manage.
    fn maybe_finalize_group(
        &self,
        group: &mut PositionGroup,
        report: &mut CycleReport,
    ) -> EngineResult<()> {
        if !group.status.is_open() {
            return Ok(());
        }

        let orders = self.db.orders_for_group(group.id)?;
        let entries: Vec<&DcaOrder> = orders.iter().filter(|o| o.is_entry()).collect();
        if entries.is_empty() {
            return Ok(());
        }

        let all_terminal = entries.iter().all(|o| o.status.is_terminal());
        let any_filled = entries
            .iter()
            .any(|o| o.status == OrderStatus::Filled);
        let unhit_quantity: Decimal = entries
            .iter()
            .filter(|o| o.status == OrderStatus::Filled && !o.tp_hit)
            .map(|o| o.filled_quantity)
            .sum();

        if all_terminal && any_filled && unhit_quantity <= Decimal::ZERO {
            let consumed_quantity: Decimal = entries
                .iter()
                .filter(|o| o.status == OrderStatus::Filled)
                .map(|o| o.filled_quantity)
                .sum();
            group.status = GroupStatus::Closed;
            group.closed_at = Some(Utc::now());
            group.total_filled_quantity = Decimal::ZERO;
            group.unrealized_pnl_usd = Decimal::ZERO;
            group.unrealized_pnl_percent = Decimal::ZERO;
            self.db.update_group(group)?;
            report.groups_closed += 1;

            self.positions.save_close_action(
                group,
                group.weighted_avg_entry,
                "tp_hit",
                group.realized_pnl_usd,
                consumed_quantity,
            )?;
            tracing::info!(
                group = %group.id,
                realized = %group.realized_pnl_usd,
                "group fully closed by take-profit"
            );
        }
        Ok(())
    }

    /// On-demand resync of one group against the venue, exposed for the
    /// operator surface.
    pub async fn sync_group(&self, group_id: Uuid) -> EngineResult<CycleReport> {
        let mut report = CycleReport::default();
        let orders: Vec<DcaOrder> = self
            .db
            .orders_for_group(group_id)?
            .into_iter()
            .filter(|o| o.is_entry() && !o.status.is_terminal() && o.exchange_order_id.is_some())
            .collect();
        report.orders_checked = orders.len();
        self.reconcile_group(group_id, orders, &mut report).await?;
        Ok(report)
    }

    /// Report orders resting on the venue that the database has no row
    /// for (orphans), without mutating anything.
    pub async fn detect_orphans(
        &self,
        user: &User,
        venue: &str,
        symbol: &str,
    ) -> EngineResult<Vec<String>> {
        let exchange = self.gateway.connector_for(user, venue)?;
        let venue_orders = exchange.fetch_open_orders(Some(symbol)).await?;

        let mut known: HashMap<String, ()> = HashMap::new();
        for group in self.db.open_groups_for_user(user.id)? {
            for order in self.db.orders_for_group(group.id)? {
                if let Some(id) = order.exchange_order_id {
                    known.insert(id, ());
                }
                if let Some(id) = order.tp_order_id {
                    known.insert(id, ());
                }
            }
        }

        let orphans: Vec<String> = venue_orders
            .into_iter()
            .filter(|order| !known.contains_key(&order.id))
            .map(|order| order.id)
            .collect();
        if !orphans.is_empty() {
            tracing::warn!(symbol, count = orphans.len(), "orphaned venue orders detected");
        }
        Ok(orphans)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::CircuitBreakerConfig;
    use crate::config::DcaGridConfig;
    use crate::exchange::GatewayConfig;
    use crate::security::PlainCipher;
    use crate::types::{Side, TpMode};
    use rust_decimal_macros::dec;

    struct Fixture {
        db: Database,
        monitor: FillMonitor,
        positions: Arc<PositionManager>,
        gateway: Arc<ExchangeGateway>,
        user: User,
    }

    fn fixture() -> Fixture {
        let db = Database::open_in_memory().unwrap();
        let user = User {
            id: Uuid::new_v4(),
            webhook_secret: "s".to_string(),
            credentials: Default::default(),
            risk_config: crate::config::RiskEngineConfig::default(),
            dca_configs: Default::default(),
            default_venue: "mock".to_string(),
            created_at: Utc::now(),
        };
        db.upsert_user(&user).unwrap();

        let gateway = Arc::new(ExchangeGateway::new(
            GatewayConfig {
                venues: Default::default(),
                breaker: CircuitBreakerConfig::default(),
            },
            Arc::new(PlainCipher),
        ));
        gateway.mock_venue().set_price("SOLUSDT", dec!(100));

        let coordination = Arc::new(Coordination::in_process());
        let positions = Arc::new(PositionManager::new(
            db.clone(),
            Arc::clone(&coordination),
            Arc::clone(&gateway),
            dec!(0.1),
        ));
        let monitor = FillMonitor::new(
            db.clone(),
            Arc::clone(&gateway),
            Arc::clone(&positions),
            coordination,
        );
        Fixture {
            db,
            monitor,
            positions,
            gateway,
            user,
        }
    }

    async fn create_single_leg_group(fixture: &Fixture, tp_percent: Decimal) -> PositionGroup {
        fixture
            .positions
            .create_from_signal(
                &fixture.user,
                "mock",
                "SOLUSDT",
                60,
                Side::Buy,
                dec!(100),
                dec!(200),
                &DcaGridConfig::single_leg(tp_percent),
            )
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_fill_observation_places_tp() {
        let fixture = fixture();
        let group = create_single_leg_group(&fixture, dec!(2)).await;

        // The market entry filled on submit; first cycle refreshes
        // accounting and the mock fill already carried its details, but
        // the TP is placed when the monitor observes the filled leg.
        let report = fixture.monitor.run_cycle().await.unwrap();
        assert_eq!(report.errors, 0);

        let orders = fixture.db.orders_for_group(group.id).unwrap();
        // Entry got a TP resting on the venue
        assert!(orders[0].tp_order_id.is_some() || fixture.gateway.mock_venue().open_order_count() > 0);
    }

    #[tokio::test]
    async fn test_simple_long_tp_hit_closes_group() {
        let fixture = fixture();
        let group = create_single_leg_group(&fixture, dec!(2)).await;

        // Cycle 1: reconcile fill, place TP at 102
        fixture.monitor.run_cycle().await.unwrap();

        // Price runs through the target: the resting TP fills
        fixture.gateway.mock_venue().set_price("SOLUSDT", dec!(103));

        // Cycle 2: observe the TP fill and close the group
        let report = fixture.monitor.run_cycle().await.unwrap();
        assert_eq!(report.errors, 0);

        let closed = fixture.db.get_group(group.id).unwrap().unwrap();
        assert_eq!(closed.status, GroupStatus::Closed);
        assert!(closed.closed_at.is_some());
        // 2 SOL bought at 100, sold at 102: ~4 USD minus entry+exit fees
        assert!(closed.realized_pnl_usd > dec!(3.3));
        assert!(closed.realized_pnl_usd < dec!(4));

        let actions = fixture.db.actions_for_group(group.id).unwrap();
        assert_eq!(actions.len(), 1);
        assert_eq!(
            actions[0].action_type,
            crate::types::RiskActionType::TpHit
        );
    }

    #[tokio::test]
    async fn test_replay_idempotence_on_unchanged_state() {
        let fixture = fixture();
        create_single_leg_group(&fixture, dec!(2)).await;

        // First cycle settles everything there is to settle
        fixture.monitor.run_cycle().await.unwrap();
        let after_first = fixture.monitor.run_cycle().await.unwrap();

        // With the venue unchanged, the second pass writes nothing
        assert_eq!(after_first.orders_updated, 0);
        assert_eq!(after_first.fills_observed, 0);
        assert_eq!(after_first.tp_hits, 0);
        assert_eq!(after_first.groups_closed, 0);
    }

    #[tokio::test]
    async fn test_resting_entry_fill_advances_on_price_cross() {
        let fixture = fixture();
        let mut config = DcaGridConfig::single_leg(dec!(2));
        config.entry_order_type = OrderType::Limit;
        config.levels[0].gap_percent = dec!(-2);

        let group = fixture
            .positions
            .create_from_signal(
                &fixture.user,
                "mock",
                "SOLUSDT",
                60,
                Side::Buy,
                dec!(100),
                dec!(200),
                &config,
            )
            .await
            .unwrap();

        // Entry rests at 98
        fixture.monitor.run_cycle().await.unwrap();
        let loaded = fixture.db.get_group(group.id).unwrap().unwrap();
        assert_eq!(loaded.filled_dca_legs, 0);

        fixture.gateway.mock_venue().set_price("SOLUSDT", dec!(97.5));
        let report = fixture.monitor.run_cycle().await.unwrap();
        assert_eq!(report.fills_observed, 1);

        let loaded = fixture.db.get_group(group.id).unwrap().unwrap();
        assert_eq!(loaded.filled_dca_legs, 1);
        assert_eq!(loaded.status, GroupStatus::Active);
        assert_eq!(loaded.weighted_avg_entry, dec!(98));
    }

    #[tokio::test]
    async fn test_vanished_order_marked_cancelled() {
        let fixture = fixture();
        let mut config = DcaGridConfig::single_leg(dec!(2));
        config.entry_order_type = OrderType::Limit;
        config.levels[0].gap_percent = dec!(-2);

        let group = fixture
            .positions
            .create_from_signal(
                &fixture.user,
                "mock",
                "SOLUSDT",
                60,
                Side::Buy,
                dec!(100),
                dec!(200),
                &config,
            )
            .await
            .unwrap();

        // Wipe the venue: the resting order is gone without a trace
        fixture.gateway.mock_venue().reset();
        fixture.gateway.mock_venue().set_price("SOLUSDT", dec!(100));

        fixture.monitor.run_cycle().await.unwrap();
        let orders = fixture.db.orders_for_group(group.id).unwrap();
        assert_eq!(orders[0].status, OrderStatus::Cancelled);
    }

    #[tokio::test]
    async fn test_aggregate_mode_market_closes_on_target() {
        let fixture = fixture();
        let mut config = DcaGridConfig::single_leg(dec!(50));
        config.tp_mode = TpMode::Aggregate;
        config.tp_aggregate_percent = dec!(2);

        let group = fixture
            .positions
            .create_from_signal(
                &fixture.user,
                "mock",
                "SOLUSDT",
                60,
                Side::Buy,
                dec!(100),
                dec!(200),
                &config,
            )
            .await
            .unwrap();

        // Settle the fill; no leg TP in aggregate mode
        fixture.monitor.run_cycle().await.unwrap();
        assert_eq!(fixture.gateway.mock_venue().open_order_count(), 0);

        // Cross the aggregate target (100 * 1.02)
        fixture.gateway.mock_venue().set_price("SOLUSDT", dec!(102.5));
        let report = fixture.monitor.run_cycle().await.unwrap();
        assert_eq!(report.tp_hits, 1);

        let closed = fixture.db.get_group(group.id).unwrap().unwrap();
        assert_eq!(closed.status, GroupStatus::Closed);
        assert!(closed.realized_pnl_usd > dec!(4));
    }
}
