//! Take-profit evaluator
//!
//! Pure condition checks over a group's filled entry legs. Only FILLED
//! legs participate; partially filled legs wait for the reconciler to
//! promote them. Per-leg targets compensate for fill slippage by
//! preferring the actual average fill price over the planned leg price.

use rust_decimal::Decimal;

use crate::types::{DcaOrder, PositionGroup, Side, TpMode};

const HUNDRED: Decimal = Decimal::from_parts(100, 0, 0, false, 0);

/// Has this leg's own TP target been reached at `current_price`?
pub fn is_leg_tp_reached(order: &DcaOrder, current_price: Decimal, side: Side) -> bool {
    let target = order.adjusted_tp_price();
    if target <= Decimal::ZERO {
        return false;
    }
    match side {
        Side::Buy => current_price >= target,
        Side::Sell => current_price <= target,
    }
}

/// The aggregate TP target relative to the weighted average entry.
pub fn aggregate_target(
    weighted_avg_entry: Decimal,
    tp_aggregate_percent: Decimal,
    side: Side,
) -> Decimal {
    let factor = tp_aggregate_percent / HUNDRED;
    match side {
        Side::Buy => weighted_avg_entry * (Decimal::ONE + factor),
        Side::Sell => weighted_avg_entry * (Decimal::ONE - factor),
    }
}

fn price_beyond(current: Decimal, target: Decimal, side: Side) -> bool {
    match side {
        Side::Buy => current >= target,
        Side::Sell => current <= target,
    }
}

/// Evaluate the group's TP policy against the current price and return the
/// legs to close. `legs` should be the group's filled entry legs.
///
/// - per_leg: each un-hit leg closes when its own target is reached.
/// - aggregate: once the weighted-entry target is reached, every un-hit
///   filled leg closes.
/// - hybrid: first trigger wins — per-leg hits close only the matching
///   legs; if none hit but the aggregate target is beyond, close all.
pub fn legs_to_close<'a>(
    group: &PositionGroup,
    legs: &'a [DcaOrder],
    current_price: Decimal,
) -> Vec<&'a DcaOrder> {
    let candidates: Vec<&DcaOrder> = legs.iter().filter(|leg| leg.tp_unresolved()).collect();
    if candidates.is_empty() {
        return Vec::new();
    }

    match group.tp_mode {
        TpMode::PerLeg => candidates
            .into_iter()
            .filter(|leg| is_leg_tp_reached(leg, current_price, group.side))
            .collect(),
        TpMode::Aggregate => {
            if group.weighted_avg_entry <= Decimal::ZERO {
                return Vec::new();
            }
            let target = aggregate_target(
                group.weighted_avg_entry,
                group.tp_aggregate_percent,
                group.side,
            );
            if price_beyond(current_price, target, group.side) {
                candidates
            } else {
                Vec::new()
            }
        }
        TpMode::Hybrid => {
            let per_leg_hits: Vec<&DcaOrder> = candidates
                .iter()
                .copied()
                .filter(|leg| is_leg_tp_reached(leg, current_price, group.side))
                .collect();
            if !per_leg_hits.is_empty() {
                return per_leg_hits;
            }
            if group.weighted_avg_entry <= Decimal::ZERO {
                return Vec::new();
            }
            let target = aggregate_target(
                group.weighted_avg_entry,
                group.tp_aggregate_percent,
                group.side,
            );
            if price_beyond(current_price, target, group.side) {
                candidates
            } else {
                Vec::new()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{GroupStatus, OrderStatus, OrderType};
    use rust_decimal_macros::dec;
    use uuid::Uuid;

    fn group(tp_mode: TpMode, weighted_avg: Decimal, aggregate_pct: Decimal) -> PositionGroup {
        let mut group = PositionGroup::new(
            Uuid::new_v4(),
            "mock",
            "SOLUSDT",
            60,
            Side::Buy,
            dec!(100),
            tp_mode,
            aggregate_pct,
            5,
        );
        group.weighted_avg_entry = weighted_avg;
        group.status = GroupStatus::Active;
        group
    }

    fn filled_leg(leg_index: i64, fill_price: Decimal, tp_percent: Decimal) -> DcaOrder {
        DcaOrder {
            id: Uuid::new_v4(),
            group_id: Uuid::new_v4(),
            pyramid_id: Uuid::new_v4(),
            leg_index,
            symbol: "SOLUSDT".to_string(),
            side: Side::Buy,
            order_type: OrderType::Limit,
            price: fill_price,
            quantity: dec!(1),
            gap_percent: Decimal::ZERO,
            weight_percent: dec!(100),
            tp_percent,
            tp_price: fill_price * (Decimal::ONE + tp_percent / dec!(100)),
            exchange_order_id: Some(format!("ex-{leg_index}")),
            status: OrderStatus::Filled,
            filled_quantity: dec!(1),
            avg_fill_price: fill_price,
            fee: Decimal::ZERO,
            fee_currency: None,
            submitted_at: None,
            filled_at: None,
            error: None,
            tp_order_id: None,
            tp_hit: false,
        }
    }

    #[test]
    fn test_per_leg_closes_only_reached_legs() {
        let group = group(TpMode::PerLeg, dec!(99), Decimal::ZERO);
        let legs = vec![
            filled_leg(0, dec!(100), dec!(2)), // target 102
            filled_leg(1, dec!(98), dec!(2)),  // target 99.96
        ];

        let hits = legs_to_close(&group, &legs, dec!(100.5));
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].leg_index, 1);

        let hits = legs_to_close(&group, &legs, dec!(102.5));
        assert_eq!(hits.len(), 2);
    }

    #[test]
    fn test_per_leg_uses_fill_adjusted_target() {
        let group = group(TpMode::PerLeg, dec!(100), Decimal::ZERO);
        // Planned at 100 but filled at 99: target is 99 * 1.02 = 100.98
        let mut leg = filled_leg(0, dec!(100), dec!(2));
        leg.avg_fill_price = dec!(99);

        assert!(legs_to_close(&group, std::slice::from_ref(&leg), dec!(101)).len() == 1);
        assert!(legs_to_close(&group, std::slice::from_ref(&leg), dec!(100.5)).is_empty());
    }

    #[test]
    fn test_aggregate_closes_all_or_nothing() {
        let group = group(TpMode::Aggregate, dec!(100), dec!(3));
        let legs = vec![
            filled_leg(0, dec!(101), dec!(2)),
            filled_leg(1, dec!(99), dec!(2)),
        ];

        // Target is 103
        assert!(legs_to_close(&group, &legs, dec!(102.9)).is_empty());
        assert_eq!(legs_to_close(&group, &legs, dec!(103)).len(), 2);
    }

    #[test]
    fn test_hybrid_per_leg_wins_over_aggregate() {
        let group = group(TpMode::Hybrid, dec!(100), dec!(5));
        let legs = vec![
            filled_leg(0, dec!(98), dec!(2)),  // target 99.96
            filled_leg(1, dec!(101), dec!(2)), // target 103.02
        ];

        // Per-leg trigger on leg 0 only; aggregate (105) not reached
        let hits = legs_to_close(&group, &legs, dec!(100));
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].leg_index, 0);
    }

    #[test]
    fn test_hybrid_falls_back_to_aggregate() {
        let group = group(TpMode::Hybrid, dec!(90), dec!(2));
        // Both legs far from their per-leg targets
        let legs = vec![
            filled_leg(0, dec!(100), dec!(10)),
            filled_leg(1, dec!(100), dec!(10)),
        ];

        // Aggregate target 90 * 1.02 = 91.8
        let hits = legs_to_close(&group, &legs, dec!(92));
        assert_eq!(hits.len(), 2);
    }

    #[test]
    fn test_hit_legs_are_skipped() {
        let group = group(TpMode::PerLeg, dec!(100), Decimal::ZERO);
        let mut leg = filled_leg(0, dec!(100), dec!(2));
        leg.tp_hit = true;
        assert!(legs_to_close(&group, std::slice::from_ref(&leg), dec!(110)).is_empty());
    }

    #[test]
    fn test_unfilled_legs_are_out_of_scope() {
        let group = group(TpMode::Aggregate, dec!(100), dec!(1));
        let mut leg = filled_leg(0, dec!(100), dec!(2));
        leg.status = OrderStatus::PartiallyFilled;
        assert!(legs_to_close(&group, std::slice::from_ref(&leg), dec!(110)).is_empty());
    }
}
