//! Risk timer state machine and stuck-close recovery.

use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use uuid::Uuid;

use super::selector::pyramids_complete;
use crate::config::RiskEngineConfig;
use crate::error::EngineResult;
use crate::store::Database;
use crate::types::{GroupStatus, PositionGroup};

/// Time in `closing` after which a position is considered stuck.
pub const CLOSING_TIMEOUT_MINUTES: i64 = 2;

/// Timer transitions, emitted for logging and operator visibility.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerEvent {
    Started,
    Expired,
    Reset,
}

/// Advance the risk timers of the given active groups.
///
/// The timer starts when pyramids are complete AND the loss breaches the
/// threshold. It keeps running while pyramids stay complete and the
/// position remains in loss (even above the threshold). It resets when a
/// new pyramid breaks completeness or the position turns profitable.
pub fn update_risk_timers(
    db: &Database,
    groups: &mut [PositionGroup],
    config: &RiskEngineConfig,
    now: DateTime<Utc>,
) -> EngineResult<Vec<(Uuid, TimerEvent)>> {
    let mut events = Vec::new();

    for group in groups.iter_mut() {
        if group.status != GroupStatus::Active {
            continue;
        }

        let complete = pyramids_complete(group, config.required_pyramids_for_timer);
        let loss_exceeded = group.unrealized_pnl_percent <= config.loss_threshold_percent;
        let still_in_loss = group.unrealized_pnl_percent < Decimal::ZERO;

        let should_start = complete && loss_exceeded;
        let should_continue = complete && still_in_loss;

        if should_start || (group.risk_timer_start.is_some() && should_continue) {
            if group.risk_timer_start.is_none() {
                group.risk_timer_start = Some(now);
                group.risk_timer_expires =
                    Some(now + Duration::minutes(config.post_pyramids_wait_minutes));
                group.risk_eligible = false;
                db.update_group(group)?;
                events.push((group.id, TimerEvent::Started));
                tracing::info!(
                    group = %group.id,
                    symbol = %group.symbol,
                    loss = %group.unrealized_pnl_percent,
                    wait_minutes = config.post_pyramids_wait_minutes,
                    "risk timer started"
                );
            } else if let Some(expires) = group.risk_timer_expires {
                if now >= expires && !group.risk_eligible {
                    group.risk_eligible = true;
                    db.update_group(group)?;
                    events.push((group.id, TimerEvent::Expired));
                    tracing::info!(
                        group = %group.id,
                        symbol = %group.symbol,
                        "risk timer expired, eligible for offset"
                    );
                }
            }
        } else if group.risk_timer_start.is_some() {
            group.risk_timer_start = None;
            group.risk_timer_expires = None;
            group.risk_eligible = false;
            db.update_group(group)?;
            events.push((group.id, TimerEvent::Reset));
            tracing::info!(
                group = %group.id,
                symbol = %group.symbol,
                pyramids_complete = complete,
                in_loss = still_in_loss,
                "risk timer reset"
            );
        }
    }

    Ok(events)
}

/// Recover groups stuck in `closing`: past the timeout with quantity
/// remaining they revert to `active` (risk timer cleared for
/// re-evaluation); with zero quantity they finalize to `closed`.
pub fn recover_stuck_closing(
    db: &Database,
    groups: &mut [PositionGroup],
    now: DateTime<Utc>,
) -> EngineResult<Vec<Uuid>> {
    let mut recovered = Vec::new();

    for group in groups.iter_mut() {
        if group.status != GroupStatus::Closing {
            continue;
        }

        let closing_since = group
            .closing_started_at
            .map(|started| started.max(group.updated_at))
            .unwrap_or(group.updated_at);
        if now - closing_since < Duration::minutes(CLOSING_TIMEOUT_MINUTES) {
            continue;
        }

        if group.total_filled_quantity > Decimal::ZERO {
            tracing::warn!(
                group = %group.id,
                symbol = %group.symbol,
                stuck_secs = (now - closing_since).num_seconds(),
                "recovering stuck closing position, reverting to active"
            );
            group.status = GroupStatus::Active;
            group.closing_started_at = None;
            group.risk_timer_start = None;
            group.risk_timer_expires = None;
            group.risk_eligible = false;
        } else {
            tracing::warn!(
                group = %group.id,
                symbol = %group.symbol,
                "stuck closing position has no quantity, finalizing to closed"
            );
            group.status = GroupStatus::Closed;
            group.closed_at = Some(now);
        }
        db.update_group(group)?;
        recovered.push(group.id);
    }

    Ok(recovered)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Side, TpMode};
    use rust_decimal_macros::dec;

    fn db_with_group(status: GroupStatus) -> (Database, PositionGroup) {
        let db = Database::open_in_memory().unwrap();
        let user = crate::types::User {
            id: Uuid::new_v4(),
            webhook_secret: "s".to_string(),
            credentials: Default::default(),
            risk_config: RiskEngineConfig::default(),
            dca_configs: Default::default(),
            default_venue: "mock".to_string(),
            created_at: Utc::now(),
        };
        db.upsert_user(&user).unwrap();

        let mut group = PositionGroup::new(
            user.id,
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
        group.pyramid_count = 3;
        group.total_dca_legs = 9;
        group.filled_dca_legs = 9;
        db.insert_group(&group).unwrap();
        (db, group)
    }

    #[test]
    fn test_timer_starts_when_conditions_met() {
        let (db, mut group) = db_with_group(GroupStatus::Active);
        group.unrealized_pnl_percent = dec!(-2);
        let config = RiskEngineConfig::default();

        let events =
            update_risk_timers(&db, std::slice::from_mut(&mut group), &config, Utc::now())
                .unwrap();
        assert_eq!(events, vec![(group.id, TimerEvent::Started)]);
        assert!(group.risk_timer_expires.is_some());
        assert!(!group.risk_eligible);
    }

    #[test]
    fn test_timer_expires_into_eligibility() {
        let (db, mut group) = db_with_group(GroupStatus::Active);
        group.unrealized_pnl_percent = dec!(-2);
        group.risk_timer_start = Some(Utc::now() - Duration::minutes(20));
        group.risk_timer_expires = Some(Utc::now() - Duration::minutes(1));
        let config = RiskEngineConfig::default();

        let events =
            update_risk_timers(&db, std::slice::from_mut(&mut group), &config, Utc::now())
                .unwrap();
        assert_eq!(events, vec![(group.id, TimerEvent::Expired)]);
        assert!(group.risk_eligible);

        // A second pass emits nothing new
        let events =
            update_risk_timers(&db, std::slice::from_mut(&mut group), &config, Utc::now())
                .unwrap();
        assert!(events.is_empty());
    }

    #[test]
    fn test_timer_continues_above_threshold_while_in_loss() {
        let (db, mut group) = db_with_group(GroupStatus::Active);
        // Loss improved past the -1.5 threshold but still negative
        group.unrealized_pnl_percent = dec!(-0.5);
        group.risk_timer_start = Some(Utc::now() - Duration::minutes(5));
        group.risk_timer_expires = Some(Utc::now() + Duration::minutes(10));
        let config = RiskEngineConfig::default();

        let events =
            update_risk_timers(&db, std::slice::from_mut(&mut group), &config, Utc::now())
                .unwrap();
        assert!(events.is_empty());
        assert!(group.risk_timer_start.is_some());
    }

    #[test]
    fn test_timer_resets_when_profitable() {
        let (db, mut group) = db_with_group(GroupStatus::Active);
        group.unrealized_pnl_percent = dec!(0.5);
        group.risk_timer_start = Some(Utc::now() - Duration::minutes(5));
        group.risk_timer_expires = Some(Utc::now() + Duration::minutes(10));
        group.risk_eligible = true;
        let config = RiskEngineConfig::default();

        let events =
            update_risk_timers(&db, std::slice::from_mut(&mut group), &config, Utc::now())
                .unwrap();
        assert_eq!(events, vec![(group.id, TimerEvent::Reset)]);
        assert!(group.risk_timer_start.is_none());
        assert!(!group.risk_eligible);
    }

    #[test]
    fn test_timer_resets_when_new_pyramid_breaks_completeness() {
        let (db, mut group) = db_with_group(GroupStatus::Active);
        group.unrealized_pnl_percent = dec!(-3);
        group.total_dca_legs = 12; // new wave appended, legs unfilled
        group.risk_timer_start = Some(Utc::now() - Duration::minutes(5));
        group.risk_timer_expires = Some(Utc::now() + Duration::minutes(10));
        let config = RiskEngineConfig::default();

        let events =
            update_risk_timers(&db, std::slice::from_mut(&mut group), &config, Utc::now())
                .unwrap();
        assert_eq!(events, vec![(group.id, TimerEvent::Reset)]);
    }

    #[test]
    fn test_stuck_closing_with_quantity_reverts_to_active() {
        let (db, mut group) = db_with_group(GroupStatus::Closing);
        group.total_filled_quantity = dec!(1);
        group.risk_timer_expires = Some(Utc::now());
        db.update_group(&mut group).unwrap();

        // Backdate updated_at past the timeout
        let now = Utc::now() + Duration::minutes(3);
        let recovered = recover_stuck_closing(&db, std::slice::from_mut(&mut group), now).unwrap();
        assert_eq!(recovered, vec![group.id]);

        let loaded = db.get_group(group.id).unwrap().unwrap();
        assert_eq!(loaded.status, GroupStatus::Active);
        assert!(loaded.risk_timer_expires.is_none());
    }

    #[test]
    fn test_stuck_closing_without_quantity_finalizes() {
        let (db, mut group) = db_with_group(GroupStatus::Closing);
        group.total_filled_quantity = Decimal::ZERO;
        db.update_group(&mut group).unwrap();

        let now = Utc::now() + Duration::minutes(3);
        let recovered = recover_stuck_closing(&db, std::slice::from_mut(&mut group), now).unwrap();
        assert_eq!(recovered.len(), 1);

        let loaded = db.get_group(group.id).unwrap().unwrap();
        assert_eq!(loaded.status, GroupStatus::Closed);
        assert!(loaded.closed_at.is_some());
    }

    #[test]
    fn test_recent_closing_is_left_alone() {
        let (db, mut group) = db_with_group(GroupStatus::Closing);
        group.total_filled_quantity = dec!(1);
        group.closing_started_at = Some(Utc::now());
        db.update_group(&mut group).unwrap();

        let recovered =
            recover_stuck_closing(&db, std::slice::from_mut(&mut group), Utc::now()).unwrap();
        assert!(recovered.is_empty());
        assert_eq!(group.status, GroupStatus::Closing);
    }
}
