//! Partial-close plan computation
//!
//! Pure math: given the selected winners, current prices, and precision
//! rules, decide how much of each winner to sell to realize the required
//! cash. The profit-only constraint holds throughout: no winner ever
//! realizes more cash than its own unrealized profit.

use rust_decimal::Decimal;
use std::collections::HashMap;
use uuid::Uuid;

use crate::exchange::PrecisionRules;
use crate::grid::round_to_step;
use crate::types::PositionGroup;

/// One planned partial close.
#[derive(Debug, Clone, PartialEq)]
pub struct CloseInstruction {
    pub group_id: Uuid,
    pub symbol: String,
    pub quantity: Decimal,
    /// Cash this close realizes at the planning price.
    pub cash: Decimal,
}

/// Walk the winners in order, taking from each until `required_usd` is
/// covered. Winners are skipped when their profit-per-unit is non-positive,
/// the contribution falls under the venue minimum, or the plan would sell
/// more than the position holds.
pub fn compute_close_plan(
    winners: &[&PositionGroup],
    prices: &HashMap<String, Decimal>,
    precision: &HashMap<String, PrecisionRules>,
    required_usd: Decimal,
) -> (Vec<CloseInstruction>, Decimal) {
    let mut plan = Vec::new();
    let mut total_realizable = Decimal::ZERO;
    let mut remaining = required_usd;

    for winner in winners {
        if remaining <= Decimal::ZERO {
            break;
        }

        let Some(&current_price) = prices.get(&winner.symbol) else {
            tracing::warn!(group = %winner.id, symbol = %winner.symbol, "no price for winner, skipping");
            continue;
        };
        if current_price <= Decimal::ZERO {
            continue;
        }

        let rules = precision.get(&winner.symbol).cloned().unwrap_or_default();

        let profit_per_unit = current_price - winner.weighted_avg_entry;
        if profit_per_unit <= Decimal::ZERO {
            tracing::warn!(
                group = %winner.id,
                symbol = %winner.symbol,
                "winner has no profit per unit at current price, skipping"
            );
            continue;
        }

        // Profit-only bound: cash realized may not exceed the winner's
        // unrealized profit, so quantity caps at profit / price.
        let available_profit = winner.unrealized_pnl_usd;
        let max_quantity = round_to_step(available_profit / current_price, rules.step_size);
        let max_contribution = max_quantity * current_price;

        let cash = max_contribution.min(remaining);
        if cash <= Decimal::ZERO {
            continue;
        }

        let quantity = round_to_step(cash / current_price, rules.step_size);
        let notional = quantity * current_price;

        if notional < rules.min_notional {
            tracing::warn!(
                group = %winner.id,
                notional = %notional,
                min = %rules.min_notional,
                "partial close below venue minimum, skipping winner"
            );
            continue;
        }
        if quantity > winner.total_filled_quantity {
            tracing::warn!(
                group = %winner.id,
                quantity = %quantity,
                held = %winner.total_filled_quantity,
                "plan would exceed position size, skipping winner"
            );
            continue;
        }

        plan.push(CloseInstruction {
            group_id: winner.id,
            symbol: winner.symbol.clone(),
            quantity,
            cash: notional,
        });
        total_realizable += notional;
        remaining -= notional;
    }

    (plan, total_realizable)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{GroupStatus, Side, TpMode};
    use rust_decimal_macros::dec;

    fn winner(
        symbol: &str,
        weighted_avg: Decimal,
        unrealized: Decimal,
        quantity: Decimal,
    ) -> PositionGroup {
        let mut group = PositionGroup::new(
            Uuid::new_v4(),
            "mock",
            symbol,
            60,
            Side::Buy,
            weighted_avg,
            TpMode::PerLeg,
            Decimal::ZERO,
            5,
        );
        group.status = GroupStatus::Active;
        group.weighted_avg_entry = weighted_avg;
        group.unrealized_pnl_usd = unrealized;
        group.total_filled_quantity = quantity;
        group
    }

    fn rules() -> HashMap<String, PrecisionRules> {
        HashMap::new() // defaults: step 0.001, min notional 10
    }

    #[test]
    fn test_plan_realizes_required_cash_from_one_winner() {
        // ETH bought at 2000, now 2100: +200 unrealized on 2 ETH
        let eth = winner("ETHUSDT", dec!(2000), dec!(200), dec!(2));
        let prices = HashMap::from([("ETHUSDT".to_string(), dec!(2100))]);

        let winners = [&eth];
        let (plan, total) = compute_close_plan(&winners, &prices, &rules(), dec!(100));

        assert_eq!(plan.len(), 1);
        // ~100 / 2100 = 0.047619 -> 0.047 at step 0.001 -> 98.70 cash
        assert_eq!(plan[0].quantity, dec!(0.047));
        assert_eq!(plan[0].cash, dec!(98.700));
        assert_eq!(total, dec!(98.700));
        // Never more than the required amount (modulo step rounding down)
        assert!(total <= dec!(100));
    }

    #[test]
    fn test_profit_only_constraint_caps_contribution() {
        // Only 50 USD unrealized profit: cash taken must stay under 50
        let eth = winner("ETHUSDT", dec!(2000), dec!(50), dec!(10));
        let prices = HashMap::from([("ETHUSDT".to_string(), dec!(2100))]);

        let winners = [&eth];
        let (plan, total) = compute_close_plan(&winners, &prices, &rules(), dec!(500));

        assert_eq!(plan.len(), 1);
        assert!(total <= dec!(50));
        assert!(plan[0].quantity * dec!(2100) <= dec!(50));
    }

    #[test]
    fn test_winners_chain_until_covered() {
        let eth = winner("ETHUSDT", dec!(2000), dec!(60), dec!(5));
        let sol = winner("SOLUSDT", dec!(100), dec!(80), dec!(50));
        let prices = HashMap::from([
            ("ETHUSDT".to_string(), dec!(2100)),
            ("SOLUSDT".to_string(), dec!(110)),
        ]);

        let winners = [&eth, &sol];
        let (plan, total) = compute_close_plan(&winners, &prices, &rules(), dec!(100));

        assert_eq!(plan.len(), 2);
        assert!(total > dec!(95) && total <= dec!(110));
    }

    #[test]
    fn test_underwater_winner_is_skipped() {
        // Stale unrealized figure but price is now below entry
        let eth = winner("ETHUSDT", dec!(2000), dec!(100), dec!(2));
        let prices = HashMap::from([("ETHUSDT".to_string(), dec!(1950))]);

        let winners = [&eth];
        let (plan, total) = compute_close_plan(&winners, &prices, &rules(), dec!(50));
        assert!(plan.is_empty());
        assert_eq!(total, Decimal::ZERO);
    }

    #[test]
    fn test_below_min_notional_is_skipped() {
        let eth = winner("ETHUSDT", dec!(2000), dec!(8), dec!(2));
        let prices = HashMap::from([("ETHUSDT".to_string(), dec!(2100))]);

        // Max contribution ~8 USD < 10 min notional
        let winners = [&eth];
        let (plan, _) = compute_close_plan(&winners, &prices, &rules(), dec!(8));
        assert!(plan.is_empty());
    }

    #[test]
    fn test_missing_price_is_skipped_not_fatal() {
        let eth = winner("ETHUSDT", dec!(2000), dec!(100), dec!(2));
        let sol = winner("SOLUSDT", dec!(100), dec!(100), dec!(50));
        let prices = HashMap::from([("SOLUSDT".to_string(), dec!(110))]);

        let winners = [&eth, &sol];
        let (plan, _) = compute_close_plan(&winners, &prices, &rules(), dec!(50));
        assert_eq!(plan.len(), 1);
        assert_eq!(plan[0].symbol, "SOLUSDT");
    }
}
