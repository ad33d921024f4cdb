//! Risk engine
//!
//! The 60-second leader loop: recovers stuck closes, advances risk
//! timers, selects an eligible loser and the winners to offset it,
//! computes the partial-close plan, and executes it. Also owns the
//! pre-trade gate consulted by the queue manager and the promotion
//! switches (force-stop / force-start, daily-loss auto-pause).

pub mod executor;
pub mod selector;
pub mod timer;

pub use executor::{compute_close_plan, CloseInstruction};
pub use selector::{filter_eligible_losers, pyramids_complete, select_loser_and_winners};
pub use timer::{recover_stuck_closing, update_risk_timers, TimerEvent};

use chrono::{Duration, Timelike, Utc};
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::Arc;
use uuid::Uuid;

use crate::config::RiskEngineConfig;
use crate::error::{EngineError, EngineResult};
use crate::exchange::ExchangeGateway;
use crate::services::order_service::SlippageAction;
use crate::services::position_manager::PositionManager;
use crate::store::Database;
use crate::types::{
    GroupStatus, PositionGroup, QueuedSignal, RiskAction, RiskActionType, User,
};

const HUNDRED: Decimal = Decimal::from_parts(100, 0, 0, false, 0);

/// Outcome of the pre-trade gate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GateDecision {
    Proceed,
    /// Promotion is paused; the signal stays queued.
    Paused,
    /// The signal may not trade; reason recorded on the signal.
    Reject(String),
}

fn start_of_day_utc() -> chrono::DateTime<Utc> {
    let now = Utc::now();
    now - Duration::seconds(now.num_seconds_from_midnight() as i64)
}

/// Pre-trade risk gate, invoked by the queue manager before promotion.
pub fn pre_trade_gate(
    db: &Database,
    user: &User,
    signal: &QueuedSignal,
    capital_usd: Decimal,
    is_pyramid: bool,
) -> EngineResult<GateDecision> {
    let config = &user.risk_config;

    if config.promotion_paused {
        return Ok(GateDecision::Paused);
    }

    let realized_today = db.realized_pnl_since(user.id, start_of_day_utc())?;
    if realized_today < -config.max_realized_loss_usd {
        return Ok(GateDecision::Reject(format!(
            "daily realized loss {realized_today} breaches limit {}",
            config.max_realized_loss_usd
        )));
    }

    let exposure = db.total_open_exposure(user.id)?;
    if exposure + capital_usd > config.max_total_exposure_usd {
        return Ok(GateDecision::Reject(format!(
            "exposure {exposure} + {capital_usd} exceeds cap {}",
            config.max_total_exposure_usd
        )));
    }

    if !is_pyramid {
        let open = db.count_open_groups(Some(user.id))?;
        if open >= config.max_open_positions_global {
            return Ok(GateDecision::Reject(format!(
                "open positions {open} at global cap {}",
                config.max_open_positions_global
            )));
        }

        let same_symbol = db.count_open_groups_for_symbol(
            user.id,
            &signal.venue,
            &signal.symbol,
            signal.timeframe,
        )?;
        if same_symbol >= config.max_open_positions_per_symbol {
            return Ok(GateDecision::Reject(format!(
                "{} open positions on {} at per-symbol cap {}",
                same_symbol, signal.symbol, config.max_open_positions_per_symbol
            )));
        }
    }

    Ok(GateDecision::Proceed)
}

pub struct RiskEngine {
    db: Database,
    gateway: Arc<ExchangeGateway>,
    positions: Arc<PositionManager>,
    max_slippage_percent: Decimal,
}

impl RiskEngine {
    pub fn new(
        db: Database,
        gateway: Arc<ExchangeGateway>,
        positions: Arc<PositionManager>,
        max_slippage_percent: Decimal,
    ) -> Self {
        Self {
            db,
            gateway,
            positions,
            max_slippage_percent,
        }
    }

    /// One full engine cycle across all users. Per-user failures are
    /// recorded and do not stop the cycle.
    pub async fn run_cycle(&self) -> EngineResult<()> {
        for user in self.db.list_users()? {
            if let Err(e) = self.run_user_cycle(&user).await {
                tracing::error!(user = %user.id, error = %e, "risk cycle failed for user");
            }
        }
        Ok(())
    }

    async fn run_user_cycle(&self, user: &User) -> EngineResult<()> {
        let now = Utc::now();

        // Step 1: recover stuck closing positions.
        let mut closing = self.db.groups_by_status(user.id, GroupStatus::Closing)?;
        recover_stuck_closing(&self.db, &mut closing, now)?;

        // Refresh accounting before timers read it.
        let mut groups = self.db.groups_by_status(user.id, GroupStatus::Active)?;
        for group in &mut groups {
            if let Ok(exchange) = self.gateway.connector_for(user, &group.venue) {
                if let Ok(price) = exchange.get_current_price(&group.symbol).await {
                    self.positions.refresh_group_statistics(group, price).await?;
                }
            }
        }

        // Step 2: advance risk timers.
        update_risk_timers(&self.db, &mut groups, &user.risk_config, now)?;

        // Step 3: select loser and winners over the full open set.
        let open = self.db.open_groups_for_user(user.id)?;
        let Some((loser, winners, required_usd)) =
            select_loser_and_winners(&open, &user.risk_config, now)
        else {
            self.enforce_daily_loss_breaker(user).await?;
            return Ok(());
        };

        if !user.risk_config.partial_close_enabled {
            tracing::info!(user = %user.id, "partial close disabled, skipping offset");
            return Ok(());
        }

        tracing::info!(
            loser = %loser.id,
            loser_symbol = %loser.symbol,
            required = %required_usd,
            winners = winners.len(),
            "offset selected"
        );

        // Step 4: compute the plan from live prices and precision.
        let (prices, precision) = self.market_data_for(user, &winners).await?;
        let (plan, realizable) =
            compute_close_plan(&winners, &prices, &precision, required_usd);
        if plan.is_empty() || realizable < required_usd * user.risk_config.min_plan_coverage() {
            tracing::warn!(
                required = %required_usd,
                realizable = %realizable,
                "close plan cannot cover the loss, aborting cycle"
            );
            return Ok(());
        }

        // Step 5: execute.
        self.execute_offset(user, loser, &winners, &plan).await?;
        self.enforce_daily_loss_breaker(user).await?;
        Ok(())
    }

    async fn market_data_for(
        &self,
        user: &User,
        winners: &[&PositionGroup],
    ) -> EngineResult<(
        HashMap<String, Decimal>,
        HashMap<String, crate::exchange::PrecisionRules>,
    )> {
        let mut prices = HashMap::new();
        let mut precision = HashMap::new();
        for winner in winners {
            if prices.contains_key(&winner.symbol) {
                continue;
            }
            let exchange = self.gateway.connector_for(user, &winner.venue)?;
            match exchange.get_current_price(&winner.symbol).await {
                Ok(price) => {
                    prices.insert(winner.symbol.clone(), price);
                }
                Err(e) => {
                    tracing::warn!(symbol = %winner.symbol, error = %e, "price fetch failed");
                }
            }
            if let Ok(rules) = exchange.get_precision_rules().await {
                precision.extend(rules);
            }
        }
        Ok((prices, precision))
    }

    /// Transition everyone to `closing`, close winners partially, then
    /// close the loser fully. A venue error reverts statuses and
    /// surfaces; the next cycle's recovery pass mops up stragglers.
    async fn execute_offset(
        &self,
        user: &User,
        loser: &PositionGroup,
        winners: &[&PositionGroup],
        plan: &[CloseInstruction],
    ) -> EngineResult<()> {
        let mut marked: Vec<Uuid> = Vec::new();
        for group_ref in std::iter::once(loser).chain(winners.iter().copied()) {
            if let Some(mut group) = self.db.get_group(group_ref.id)? {
                group.status = GroupStatus::Closing;
                group.closing_started_at = Some(Utc::now());
                self.db.update_group(&mut group)?;
                marked.push(group.id);
            }
        }

        for instruction in plan {
            if let Err(e) = self.close_winner_partial(user, instruction).await {
                tracing::error!(
                    group = %instruction.group_id,
                    error = %e,
                    "winner partial close failed, reverting offset"
                );
                self.revert_to_active(&marked)?;
                return Err(e);
            }
        }

        if let Err(e) = self
            .positions
            .handle_exit_signal(
                user,
                loser.id,
                self.max_slippage_percent,
                SlippageAction::Warn,
                "risk_offset",
            )
            .await
        {
            tracing::error!(group = %loser.id, error = %e, "loser close failed");
            self.revert_to_active(std::slice::from_ref(&loser.id))?;
            return Err(e);
        }

        tracing::info!(
            loser = %loser.id,
            closes = plan.len(),
            "offset executed"
        );
        Ok(())
    }

    fn revert_to_active(&self, group_ids: &[Uuid]) -> EngineResult<()> {
        for id in group_ids {
            if let Some(mut group) = self.db.get_group(*id)? {
                if group.status == GroupStatus::Closing {
                    group.status = GroupStatus::Active;
                    group.closing_started_at = None;
                    self.db.update_group(&mut group)?;
                }
            }
        }
        Ok(())
    }

    /// Sell part of a winner, realize the cash, and return the group to
    /// `active` with reduced quantity and cost basis.
    async fn close_winner_partial(
        &self,
        user: &User,
        instruction: &CloseInstruction,
    ) -> EngineResult<()> {
        let mut group = self
            .db
            .get_group(instruction.group_id)?
            .ok_or_else(|| {
                EngineError::Invariant(format!("winner {} missing", instruction.group_id))
            })?;

        let exchange = self.gateway.connector_for(user, &group.venue)?;
        let expected = exchange.get_current_price(&group.symbol).await?;
        let fill = self
            .positions
            .order_service()
            .close_position_market(
                exchange.as_ref(),
                &group,
                instruction.quantity,
                expected,
                self.max_slippage_percent,
                SlippageAction::Warn,
            )
            .await?;

        let closed_quantity = fill.filled;
        let cost_removed = group.weighted_avg_entry * closed_quantity;
        let realized = fill.avg_price * closed_quantity - cost_removed - fill.fee;
        // The cash the sale realizes is the loser's offset contribution;
        // the profit-only bound keeps it within the winner's unrealized
        // profit, so the audit record carries the cash figure.
        let cash_realized = fill.avg_price * closed_quantity - fill.fee;

        // The close record keeps quantity accounting consistent with the
        // next statistics refresh.
        if let Some(pyramid) = self.db.pyramids_for_group(group.id)?.first() {
            self.positions
                .order_service()
                .record_tp_fill(&group, pyramid.id, &fill)?;
        }

        group.total_filled_quantity -= closed_quantity;
        group.total_invested_usd -= cost_removed;
        group.realized_pnl_usd += realized;
        group.total_exit_fees_usd += fill.fee;
        group.unrealized_pnl_usd =
            (group.unrealized_pnl_usd - realized).max(Decimal::ZERO);
        group.status = GroupStatus::Active;
        group.closing_started_at = None;
        self.db.update_group(&mut group)?;

        let pnl_percent = if group.weighted_avg_entry > Decimal::ZERO {
            (fill.avg_price - group.weighted_avg_entry) / group.weighted_avg_entry * HUNDRED
        } else {
            Decimal::ZERO
        };
        self.db.insert_risk_action(&RiskAction {
            id: Uuid::new_v4(),
            group_id: group.id,
            action_type: RiskActionType::OffsetWinner,
            exit_price: fill.avg_price,
            entry_price: group.weighted_avg_entry,
            pnl_percent,
            realized_pnl_usd: cash_realized,
            quantity_closed: closed_quantity,
            duration_seconds: Some((Utc::now() - group.created_at).num_seconds()),
            notes: format!(
                "Partial close realizing {cash_realized} cash to offset a losing position. Symbol: {}",
                group.symbol
            ),
            timestamp: Utc::now(),
        })?;

        tracing::info!(
            group = %group.id,
            quantity = %closed_quantity,
            realized = %realized,
            "winner partially closed"
        );
        Ok(())
    }

    /// Auto-pause promotion once the day's realized loss breaches the
    /// configured limit; persisted so followers and restarts see it.
    async fn enforce_daily_loss_breaker(&self, user: &User) -> EngineResult<()> {
        if user.risk_config.promotion_paused {
            return Ok(());
        }
        let realized_today = self.db.realized_pnl_since(user.id, start_of_day_utc())?;
        if realized_today < -user.risk_config.max_realized_loss_usd {
            tracing::warn!(
                user = %user.id,
                realized = %realized_today,
                limit = %user.risk_config.max_realized_loss_usd,
                "daily loss limit breached, pausing promotion"
            );
            let mut config = user.risk_config.clone();
            config.promotion_paused = true;
            self.db.update_user_risk_config(user.id, &config)?;
        }
        Ok(())
    }

    /// Halt queue promotion for a user. Evaluation continues.
    pub fn force_stop(&self, user_id: Uuid) -> EngineResult<()> {
        self.set_paused(user_id, true)
    }

    /// Resume queue promotion.
    pub fn force_start(&self, user_id: Uuid) -> EngineResult<()> {
        self.set_paused(user_id, false)
    }

    fn set_paused(&self, user_id: Uuid, paused: bool) -> EngineResult<()> {
        let user = self
            .db
            .get_user(user_id)?
            .ok_or_else(|| EngineError::Precondition(format!("unknown user {user_id}")))?;
        let mut config = user.risk_config;
        config.promotion_paused = paused;
        self.db.update_user_risk_config(user_id, &config)?;
        tracing::info!(user = %user_id, paused, "promotion switch changed");
        Ok(())
    }
}

impl RiskEngineConfig {
    /// Coverage ratio the computed plan must reach before execution. The
    /// required condition already guarantees the winners' unrealized
    /// profit covers the loss; step rounding may shave slightly under.
    fn min_plan_coverage(&self) -> Decimal {
        Decimal::from_parts(95, 0, 0, false, 2) // 0.95
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn seeded_user(db: &Database) -> User {
        let user = User {
            id: Uuid::new_v4(),
            webhook_secret: "s".to_string(),
            credentials: Default::default(),
            risk_config: RiskEngineConfig::default(),
            dca_configs: Default::default(),
            default_venue: "mock".to_string(),
            created_at: Utc::now(),
        };
        db.upsert_user(&user).unwrap();
        user
    }

    fn queued(user: &User, symbol: &str) -> QueuedSignal {
        QueuedSignal {
            id: Uuid::new_v4(),
            user_id: user.id,
            venue: "mock".to_string(),
            symbol: symbol.to_string(),
            timeframe: 60,
            side: crate::types::Side::Buy,
            entry_price: dec!(100),
            payload: serde_json::json!({}),
            queued_at: Utc::now(),
            replacement_count: 0,
            current_loss_percent: None,
            status: crate::types::SignalStatus::Queued,
            priority_score: Decimal::ZERO,
            failure_reason: None,
        }
    }

    #[test]
    fn test_gate_pauses_when_promotion_paused() {
        let db = Database::open_in_memory().unwrap();
        let mut user = seeded_user(&db);
        user.risk_config.promotion_paused = true;

        let decision =
            pre_trade_gate(&db, &user, &queued(&user, "SOLUSDT"), dec!(100), false).unwrap();
        assert_eq!(decision, GateDecision::Paused);
    }

    #[test]
    fn test_gate_rejects_over_exposure() {
        let db = Database::open_in_memory().unwrap();
        let mut user = seeded_user(&db);
        user.risk_config.max_total_exposure_usd = dec!(500);

        let mut group = PositionGroup::new(
            user.id,
            "mock",
            "BTCUSDT",
            60,
            crate::types::Side::Buy,
            dec!(100),
            crate::types::TpMode::PerLeg,
            Decimal::ZERO,
            5,
        );
        group.status = GroupStatus::Active;
        group.allocated_capital_usd = dec!(450);
        db.insert_group(&group).unwrap();

        let decision =
            pre_trade_gate(&db, &user, &queued(&user, "SOLUSDT"), dec!(100), false).unwrap();
        assert!(matches!(decision, GateDecision::Reject(_)));

        // Smaller ask fits
        let decision =
            pre_trade_gate(&db, &user, &queued(&user, "SOLUSDT"), dec!(40), false).unwrap();
        assert_eq!(decision, GateDecision::Proceed);
    }

    #[test]
    fn test_gate_per_symbol_cap_spares_pyramids() {
        let db = Database::open_in_memory().unwrap();
        let user = seeded_user(&db);

        let mut group = PositionGroup::new(
            user.id,
            "mock",
            "SOLUSDT",
            60,
            crate::types::Side::Buy,
            dec!(100),
            crate::types::TpMode::PerLeg,
            Decimal::ZERO,
            5,
        );
        group.status = GroupStatus::Active;
        db.insert_group(&group).unwrap();

        // New position on the same key is capped
        let decision =
            pre_trade_gate(&db, &user, &queued(&user, "SOLUSDT"), dec!(100), false).unwrap();
        assert!(matches!(decision, GateDecision::Reject(_)));

        // A pyramid continuation bypasses the per-symbol cap
        let decision =
            pre_trade_gate(&db, &user, &queued(&user, "SOLUSDT"), dec!(100), true).unwrap();
        assert_eq!(decision, GateDecision::Proceed);
    }

    #[test]
    fn test_gate_rejects_after_daily_loss() {
        let db = Database::open_in_memory().unwrap();
        let mut user = seeded_user(&db);
        user.risk_config.max_realized_loss_usd = dec!(100);

        let mut group = PositionGroup::new(
            user.id,
            "mock",
            "BTCUSDT",
            60,
            crate::types::Side::Buy,
            dec!(100),
            crate::types::TpMode::PerLeg,
            Decimal::ZERO,
            5,
        );
        group.status = GroupStatus::Closed;
        db.insert_group(&group).unwrap();
        db.insert_risk_action(&RiskAction {
            id: Uuid::new_v4(),
            group_id: group.id,
            action_type: RiskActionType::EngineClose,
            exit_price: dec!(90),
            entry_price: dec!(100),
            pnl_percent: dec!(-10),
            realized_pnl_usd: dec!(-150),
            quantity_closed: dec!(1),
            duration_seconds: None,
            notes: String::new(),
            timestamp: Utc::now(),
        })
        .unwrap();

        let decision =
            pre_trade_gate(&db, &user, &queued(&user, "SOLUSDT"), dec!(50), false).unwrap();
        assert!(matches!(decision, GateDecision::Reject(_)));
    }
}
