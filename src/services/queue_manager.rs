//! Queue manager
//!
//! Leader-only loop that ranks queued signals and promotes the best
//! candidate whenever pool capacity allows. Ranking is tiered: rules are
//! evaluated in the user's configured order and the first that fires
//! assigns the tier; the tie-breaker sum saturates below the gap to the
//! next tier, so tie-breakers can never promote a signal across tiers.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::sync::Arc;

use crate::config::PriorityRulesConfig;
use crate::coordination::Coordination;
use crate::error::{EngineError, EngineResult};
use crate::exchange::ExchangeGateway;
use crate::services::position_manager::PositionManager;
use crate::services::pool::ExecutionPool;
use crate::services::risk::{pre_trade_gate, GateDecision};
use crate::services::signal_router::{capital_from_payload, parse_payload};
use crate::store::Database;
use crate::types::{PositionGroup, QueuedSignal, SignalStatus, User};

/// Geometrically separated tier bases. Tie-breaker sums are clamped to
/// the gap below the next-higher base, which keeps the tiers strictly
/// ordered no matter how extreme the inputs get.
const TIER_BASES: [Decimal; 4] = [
    Decimal::from_parts(10_000_000, 0, 0, false, 0),
    Decimal::from_parts(1_000_000, 0, 0, false, 0),
    Decimal::from_parts(10_000, 0, 0, false, 0),
    Decimal::from_parts(1_000, 0, 0, false, 0),
];

/// Cap a tier's tie-breaker sum just below the distance to the tier
/// above. The top tier has no neighbour and needs no cap. Within-tier
/// ordering saturates at the cap, which only matters for pathological
/// inputs (a near-total loss, thousands of replacements).
fn clamp_to_tier(tier: usize, base: Decimal, breakers: Decimal) -> Decimal {
    if tier == 0 {
        return base + breakers;
    }
    let tier_above = TIER_BASES[tier.min(TIER_BASES.len() - 1) - 1];
    let headroom = tier_above - base - Decimal::ONE;
    base + breakers.min(headroom)
}

/// Score one queued signal. `is_pyramid` marks a continuation of an
/// active group on the same (symbol, timeframe, venue, side).
pub fn calculate_priority(
    signal: &QueuedSignal,
    is_pyramid: bool,
    config: &PriorityRulesConfig,
    now: DateTime<Utc>,
) -> Decimal {
    let time_score =
        Decimal::from((now - signal.queued_at).num_seconds().max(0)) * dec!(0.001);
    let replacement_score = Decimal::from(signal.replacement_count) * dec!(100);
    let loss_score = match signal.current_loss_percent {
        Some(loss) if loss < Decimal::ZERO => loss.abs() * dec!(10000),
        _ => Decimal::ZERO,
    };

    for (tier, rule) in config.rule_order.iter().enumerate() {
        if !config.is_enabled(rule) {
            continue;
        }
        let fires = match rule.as_str() {
            "same_pair_timeframe" => is_pyramid,
            "deepest_loss_percent" => signal
                .current_loss_percent
                .map(|loss| loss < Decimal::ZERO)
                .unwrap_or(false),
            "highest_replacement" => signal.replacement_count > 0,
            "fifo_fallback" => true,
            _ => false,
        };
        if !fires {
            continue;
        }
        let base = TIER_BASES[tier.min(TIER_BASES.len() - 1)];
        let breakers = match rule.as_str() {
            "same_pair_timeframe" | "deepest_loss_percent" => {
                loss_score + replacement_score + time_score
            }
            "highest_replacement" => replacement_score + time_score,
            _ => time_score,
        };
        return clamp_to_tier(tier, base, breakers);
    }

    // No enabled rule fired; order by age alone.
    clamp_to_tier(TIER_BASES.len() - 1, TIER_BASES[3], time_score)
}

pub struct QueueManager {
    db: Database,
    pool: Arc<ExecutionPool>,
    positions: Arc<PositionManager>,
    gateway: Arc<ExchangeGateway>,
    coordination: Arc<Coordination>,
}

impl QueueManager {
    pub fn new(
        db: Database,
        pool: Arc<ExecutionPool>,
        positions: Arc<PositionManager>,
        gateway: Arc<ExchangeGateway>,
        coordination: Arc<Coordination>,
    ) -> Self {
        Self {
            db,
            pool,
            positions,
            gateway,
            coordination,
        }
    }

    /// One promotion pass: refresh scores, then promote best-first until
    /// capacity or candidates run out. Returns promoted signal count.
    pub async fn run_cycle(&self) -> EngineResult<usize> {
        let users = self.db.list_users()?;
        let mut promoted = 0;

        for user in &users {
            if user.risk_config.promotion_paused {
                tracing::debug!(user = %user.id, "promotion paused, signals stay queued");
                continue;
            }
            if !self.pool.has_capacity(user.id) {
                continue;
            }
            promoted += self.promote_for_user(user).await?;
        }

        Ok(promoted)
    }

    async fn promote_for_user(&self, user: &User) -> EngineResult<usize> {
        let open_groups = self.db.open_groups_for_user(user.id)?;
        let mut signals = self.db.queued_signals_for_user(user.id)?;
        if signals.is_empty() {
            return Ok(0);
        }

        let now = Utc::now();
        for signal in &mut signals {
            let matching = find_matching_group(&open_groups, signal);
            self.refresh_loss_percent(user, signal, matching).await;
            signal.priority_score = calculate_priority(
                signal,
                matching.is_some(),
                &user.risk_config.priority_rules,
                now,
            );
            self.db.update_signal(signal)?;
        }

        // Best-first; scores are strictly ordered by tier construction.
        signals.sort_by(|a, b| b.priority_score.cmp(&a.priority_score));

        let mut promoted = 0;
        for signal in signals {
            if !self.pool.has_capacity(user.id) {
                break;
            }
            // Re-read the open set: an earlier promotion in this pass may
            // have created the group this signal should pyramid onto.
            let open_groups = self.db.open_groups_for_user(user.id)?;
            match self.promote_one(user, &signal, &open_groups).await {
                Ok(true) => promoted += 1,
                Ok(false) => {}
                Err(e) => {
                    tracing::warn!(signal = %signal.id, error = %e, "promotion failed");
                }
            }
        }
        Ok(promoted)
    }

    /// Refresh the signed PnL% of the matching group before ranking so
    /// the deepest-loss rule sees current data.
    async fn refresh_loss_percent(
        &self,
        user: &User,
        signal: &mut QueuedSignal,
        matching: Option<&PositionGroup>,
    ) {
        let Some(group) = matching else {
            signal.current_loss_percent = None;
            return;
        };
        if group.weighted_avg_entry <= Decimal::ZERO {
            signal.current_loss_percent = None;
            return;
        }

        let price = match self.cached_price(user, &signal.venue, &signal.symbol).await {
            Some(price) => price,
            None => return,
        };
        let pnl = (price - group.weighted_avg_entry) / group.weighted_avg_entry * dec!(100);
        signal.current_loss_percent = Some(pnl);
    }

    async fn cached_price(&self, user: &User, venue: &str, symbol: &str) -> Option<Decimal> {
        if let Some(tickers) = self.coordination.get_tickers(venue).await {
            if let Some(price) = tickers.get(symbol) {
                return Some(*price);
            }
        }
        let exchange = self.gateway.connector_for(user, venue).ok()?;
        match exchange.get_all_tickers().await {
            Ok(tickers) => {
                self.coordination.set_tickers(venue, &tickers).await;
                tickers.get(symbol).copied()
            }
            Err(e) => {
                tracing::warn!(venue, symbol, error = %e, "ticker refresh failed");
                None
            }
        }
    }

    /// Promote one signal: pre-trade gate, pool slot, then create or
    /// pyramid. Gate rejections and venue failures mark the signal failed
    /// with its reason; a paused engine leaves it queued.
    async fn promote_one(
        &self,
        user: &User,
        signal: &QueuedSignal,
        open_groups: &[PositionGroup],
    ) -> EngineResult<bool> {
        let is_pyramid = find_matching_group(open_groups, signal).is_some();
        let payload = match parse_payload(&signal.payload) {
            Ok(payload) => payload,
            Err(e) => {
                self.db
                    .mark_signal(signal.id, SignalStatus::Failed, Some(&e.to_string()))?;
                return Err(e);
            }
        };

        // The signal's requested size, bounded by the per-position share
        // of the exposure budget and the optional absolute cap.
        let mut capital = capital_from_payload(&payload);
        let share_cap = user.risk_config.max_total_exposure_usd
            * user.risk_config.risk_per_position_percent
            / Decimal::from(100);
        if share_cap > Decimal::ZERO {
            capital = capital.min(share_cap);
        }
        if let Some(cap) = user.risk_config.risk_per_position_cap_usd {
            capital = capital.min(cap);
        }

        match pre_trade_gate(&self.db, user, signal, capital, is_pyramid)? {
            GateDecision::Proceed => {}
            GateDecision::Paused => {
                tracing::info!(signal = %signal.id, "promotion gated: engine paused");
                return Ok(false);
            }
            GateDecision::Reject(reason) => {
                self.db
                    .mark_signal(signal.id, SignalStatus::Failed, Some(&reason))?;
                return Err(EngineError::Precondition(reason));
            }
        }

        if !self.pool.request_slot(user.id) {
            // Not a failure; the signal waits for the next vacancy.
            return Ok(false);
        }

        let dca_config = user.dca_config_for(&signal.symbol, signal.timeframe, &signal.venue);
        let result = if let Some(group) = find_matching_group(open_groups, signal) {
            self.positions
                .append_pyramid(user, group.id, capital, &dca_config)
                .await
                .map(|_| ())
        } else {
            self.positions
                .create_from_signal(
                    user,
                    &signal.venue,
                    &signal.symbol,
                    signal.timeframe,
                    signal.side,
                    signal.entry_price,
                    capital,
                    &dca_config,
                )
                .await
                .map(|_| ())
        };

        match result {
            Ok(()) => {
                // Pyramids share the existing group's slot.
                if is_pyramid {
                    self.pool.release_slot(user.id);
                }
                self.db.mark_signal(signal.id, SignalStatus::Promoted, None)?;
                tracing::info!(
                    signal = %signal.id,
                    symbol = %signal.symbol,
                    replacements = signal.replacement_count,
                    pyramid = is_pyramid,
                    "signal promoted"
                );
                Ok(true)
            }
            Err(e) => {
                self.pool.release_slot(user.id);
                self.db
                    .mark_signal(signal.id, SignalStatus::Failed, Some(&e.to_string()))?;
                Err(e)
            }
        }
    }
}

fn find_matching_group<'a>(
    groups: &'a [PositionGroup],
    signal: &QueuedSignal,
) -> Option<&'a PositionGroup> {
    groups.iter().find(|group| {
        group.status.is_open()
            && group.matches_signal(
                signal.user_id,
                &signal.venue,
                &signal.symbol,
                signal.timeframe,
                signal.side,
            )
    })
}
