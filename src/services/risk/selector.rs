//! Loser/winner selection for the offset engine
//!
//! Pure functions over in-memory position groups: no I/O, fully
//! deterministic, independently testable.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use std::cmp::Ordering;

use crate::config::RiskEngineConfig;
use crate::types::{GroupStatus, PositionGroup};

/// "Pyramids complete": the required number of waves are in and every DCA
/// leg across the group has filled.
pub fn pyramids_complete(group: &PositionGroup, required_pyramids: i64) -> bool {
    group.pyramid_count >= required_pyramids && group.filled_dca_legs >= group.total_dca_legs
}

/// Groups eligible to be offset as losers: active, not blocked or
/// skip-flagged, pyramids complete, loss beyond the threshold, and the
/// risk timer expired.
pub fn filter_eligible_losers<'a>(
    groups: &'a [PositionGroup],
    config: &RiskEngineConfig,
    now: DateTime<Utc>,
) -> Vec<&'a PositionGroup> {
    groups
        .iter()
        .filter(|group| {
            if group.status != GroupStatus::Active {
                return false;
            }
            if group.risk_blocked || group.risk_skip_once {
                return false;
            }
            if !pyramids_complete(group, config.required_pyramids_for_timer) {
                return false;
            }
            if group.unrealized_pnl_percent > config.loss_threshold_percent {
                return false;
            }
            match group.risk_timer_expires {
                Some(expires) => expires <= now,
                None => false,
            }
        })
        .collect()
}

/// Loser ordering: deepest loss percent first, then largest loss in USD,
/// then oldest.
fn loser_priority(a: &PositionGroup, b: &PositionGroup) -> Ordering {
    b.unrealized_pnl_percent
        .abs()
        .cmp(&a.unrealized_pnl_percent.abs())
        .then_with(|| {
            b.unrealized_pnl_usd
                .abs()
                .cmp(&a.unrealized_pnl_usd.abs())
        })
        .then_with(|| a.created_at.cmp(&b.created_at))
}

/// Top-K profitable groups by unrealized USD, excluding the loser. Any
/// open status with positive unrealized profit and remaining quantity
/// qualifies; fully hedged groups (zero quantity) do not.
pub fn select_top_winners<'a>(
    groups: &'a [PositionGroup],
    count: usize,
    exclude: Option<uuid::Uuid>,
) -> Vec<&'a PositionGroup> {
    let mut winners: Vec<&PositionGroup> = groups
        .iter()
        .filter(|group| {
            group.status.is_winner_eligible()
                && group.unrealized_pnl_usd > Decimal::ZERO
                && group.total_filled_quantity > Decimal::ZERO
                && exclude != Some(group.id)
        })
        .collect();
    winners.sort_by(|a, b| b.unrealized_pnl_usd.cmp(&a.unrealized_pnl_usd));
    winners.truncate(count);
    winners
}

/// Full selection: pick the highest-priority eligible loser and the
/// winners to offset it. Returns None (no partial offset) unless the
/// winners' combined unrealized profit covers the loser's entire loss.
pub fn select_loser_and_winners<'a>(
    groups: &'a [PositionGroup],
    config: &RiskEngineConfig,
    now: DateTime<Utc>,
) -> Option<(&'a PositionGroup, Vec<&'a PositionGroup>, Decimal)> {
    let mut losers = filter_eligible_losers(groups, config, now);
    if losers.is_empty() {
        return None;
    }
    losers.sort_by(|a, b| loser_priority(a, b));
    let loser = losers[0];

    let required_usd = loser.unrealized_pnl_usd.abs();
    let winners = select_top_winners(groups, config.max_winners_to_combine, Some(loser.id));

    let combined_profit: Decimal = winners.iter().map(|w| w.unrealized_pnl_usd).sum();
    if combined_profit < required_usd {
        return None;
    }

    Some((loser, winners, required_usd))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Side, TpMode};
    use rust_decimal_macros::dec;
    use uuid::Uuid;

    fn group(status: GroupStatus, pnl_usd: Decimal, pnl_pct: Decimal) -> PositionGroup {
        let mut group = PositionGroup::new(
            Uuid::new_v4(),
            "mock",
            "BTCUSDT",
            60,
            Side::Buy,
            dec!(100),
            TpMode::PerLeg,
            Decimal::ZERO,
            5,
        );
        group.status = status;
        group.unrealized_pnl_usd = pnl_usd;
        group.unrealized_pnl_percent = pnl_pct;
        group.total_filled_quantity = dec!(1);
        group
    }

    fn eligible_loser(pnl_usd: Decimal, pnl_pct: Decimal) -> PositionGroup {
        let mut group = group(GroupStatus::Active, pnl_usd, pnl_pct);
        group.pyramid_count = 3;
        group.total_dca_legs = 9;
        group.filled_dca_legs = 9;
        group.risk_timer_start = Some(Utc::now() - chrono::Duration::minutes(30));
        group.risk_timer_expires = Some(Utc::now() - chrono::Duration::minutes(1));
        group.risk_eligible = true;
        group
    }

    #[test]
    fn test_pyramids_complete_requires_all_legs() {
        let mut group = group(GroupStatus::Active, dec!(-10), dec!(-2));
        group.pyramid_count = 3;
        group.total_dca_legs = 9;
        group.filled_dca_legs = 8;
        assert!(!pyramids_complete(&group, 3));

        group.filled_dca_legs = 9;
        assert!(pyramids_complete(&group, 3));

        group.pyramid_count = 2;
        assert!(!pyramids_complete(&group, 3));
    }

    #[test]
    fn test_eligibility_gates() {
        let config = RiskEngineConfig::default();
        let now = Utc::now();

        let ready = eligible_loser(dec!(-100), dec!(-3));
        assert_eq!(filter_eligible_losers(&[ready.clone()], &config, now).len(), 1);

        let mut blocked = eligible_loser(dec!(-100), dec!(-3));
        blocked.risk_blocked = true;
        assert!(filter_eligible_losers(&[blocked], &config, now).is_empty());

        let mut skip_once = eligible_loser(dec!(-100), dec!(-3));
        skip_once.risk_skip_once = true;
        assert!(filter_eligible_losers(&[skip_once], &config, now).is_empty());

        let mut timer_running = eligible_loser(dec!(-100), dec!(-3));
        timer_running.risk_timer_expires = Some(now + chrono::Duration::minutes(5));
        assert!(filter_eligible_losers(&[timer_running], &config, now).is_empty());

        // Loss above threshold (-1.5) is not eligible
        let shallow = eligible_loser(dec!(-100), dec!(-1));
        assert!(filter_eligible_losers(&[shallow], &config, now).is_empty());
    }

    #[test]
    fn test_loser_priority_ordering() {
        let config = RiskEngineConfig::default();
        let now = Utc::now();

        let shallow = eligible_loser(dec!(-500), dec!(-2));
        let deep = eligible_loser(dec!(-50), dec!(-8));
        let groups = vec![shallow, deep.clone()];

        let selection_input = [
            groups[0].clone(),
            groups[1].clone(),
            group(GroupStatus::Active, dec!(1000), dec!(10)),
        ];
        let (loser, _, required) = select_loser_and_winners(&selection_input, &config, now)
            .unwrap();
        // Deepest percentage loss wins even with a smaller USD loss
        assert_eq!(loser.id, deep.id);
        assert_eq!(required, dec!(50));
    }

    #[test]
    fn test_winner_selection_excludes_and_ranks() {
        let a = group(GroupStatus::Active, dec!(300), dec!(5));
        let b = group(GroupStatus::Live, dec!(500), dec!(4));
        let c = group(GroupStatus::PartiallyFilled, dec!(100), dec!(2));
        let closing = group(GroupStatus::Closing, dec!(900), dec!(9));
        let mut hedged = group(GroupStatus::Active, dec!(900), dec!(9));
        hedged.total_filled_quantity = Decimal::ZERO;

        let groups = vec![a.clone(), b.clone(), c.clone(), closing, hedged];
        let winners = select_top_winners(&groups, 2, Some(c.id));
        let ids: Vec<_> = winners.iter().map(|w| w.id).collect();
        assert_eq!(ids, vec![b.id, a.id]);
    }

    #[test]
    fn test_shortfall_aborts_selection() {
        let config = RiskEngineConfig::default();
        let now = Utc::now();

        let loser = eligible_loser(dec!(-500), dec!(-5));
        let small_winner = group(GroupStatus::Active, dec!(200), dec!(3));

        assert!(select_loser_and_winners(
            &[loser.clone(), small_winner.clone()],
            &config,
            now
        )
        .is_none());

        // Add enough combined profit and selection goes through
        let second_winner = group(GroupStatus::Active, dec!(350), dec!(4));
        let selection_input = [loser, small_winner, second_winner];
        let (_, winners, _) = select_loser_and_winners(&selection_input, &config, now).unwrap();
        assert_eq!(winners.len(), 2);
    }
}
