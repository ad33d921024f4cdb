//! Position group persistence and predicate queries.

use chrono::Utc;
use rusqlite::{params, Row};
use rust_decimal::Decimal;
use uuid::Uuid;

use super::users::parse_uuid;
use super::{
    dec_from_sql, opt_time_from_sql, opt_time_to_sql, parse_sql, time_from_sql, time_to_sql,
    Database,
};
use crate::error::EngineResult;
use crate::types::{GroupStatus, PositionGroup};

fn group_from_row(row: &Row<'_>) -> rusqlite::Result<PositionGroup> {
    let id: String = row.get("id")?;
    let user_id: String = row.get("user_id")?;
    Ok(PositionGroup {
        id: parse_uuid(&id)?,
        user_id: parse_uuid(&user_id)?,
        venue: row.get("venue")?,
        symbol: row.get("symbol")?,
        timeframe: row.get("timeframe")?,
        side: parse_sql(row.get("side")?)?,
        base_entry_price: dec_from_sql(row.get("base_entry_price")?)?,
        weighted_avg_entry: dec_from_sql(row.get("weighted_avg_entry")?)?,
        total_invested_usd: dec_from_sql(row.get("total_invested_usd")?)?,
        total_filled_quantity: dec_from_sql(row.get("total_filled_quantity")?)?,
        total_dca_legs: row.get("total_dca_legs")?,
        filled_dca_legs: row.get("filled_dca_legs")?,
        pyramid_count: row.get("pyramid_count")?,
        max_pyramids: row.get("max_pyramids")?,
        tp_mode: parse_sql(row.get("tp_mode")?)?,
        tp_aggregate_percent: dec_from_sql(row.get("tp_aggregate_percent")?)?,
        allocated_capital_usd: dec_from_sql(row.get("allocated_capital_usd")?)?,
        realized_pnl_usd: dec_from_sql(row.get("realized_pnl_usd")?)?,
        unrealized_pnl_usd: dec_from_sql(row.get("unrealized_pnl_usd")?)?,
        unrealized_pnl_percent: dec_from_sql(row.get("unrealized_pnl_percent")?)?,
        total_entry_fees_usd: dec_from_sql(row.get("total_entry_fees_usd")?)?,
        total_exit_fees_usd: dec_from_sql(row.get("total_exit_fees_usd")?)?,
        risk_blocked: row.get("risk_blocked")?,
        risk_skip_once: row.get("risk_skip_once")?,
        risk_timer_start: opt_time_from_sql(row.get("risk_timer_start")?)?,
        risk_timer_expires: opt_time_from_sql(row.get("risk_timer_expires")?)?,
        risk_eligible: row.get("risk_eligible")?,
        closing_started_at: opt_time_from_sql(row.get("closing_started_at")?)?,
        status: parse_sql(row.get("status")?)?,
        created_at: time_from_sql(row.get("created_at")?)?,
        updated_at: time_from_sql(row.get("updated_at")?)?,
        closed_at: opt_time_from_sql(row.get("closed_at")?)?,
    })
}

const OPEN_STATUSES: &str = "'waiting','live','partially_filled','active'";
const OPEN_OR_CLOSING: &str = "'waiting','live','partially_filled','active','closing'";

/// Aggregates for the dashboard surface.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct PortfolioSummary {
    pub open_groups: i64,
    pub total_invested_usd: Decimal,
    pub unrealized_pnl_usd: Decimal,
    pub realized_pnl_usd: Decimal,
}

impl Database {
    pub fn insert_group(&self, group: &PositionGroup) -> EngineResult<()> {
        let conn = self.lock();
        insert_group_stmt(&conn, group)
    }

    pub fn update_group(&self, group: &mut PositionGroup) -> EngineResult<()> {
        group.updated_at = Utc::now();
        let conn = self.lock();
        conn.execute(
            "UPDATE position_groups SET
                weighted_avg_entry = ?2, total_invested_usd = ?3,
                total_filled_quantity = ?4, total_dca_legs = ?5,
                filled_dca_legs = ?6, pyramid_count = ?7,
                tp_mode = ?8, tp_aggregate_percent = ?9,
                allocated_capital_usd = ?10, realized_pnl_usd = ?11,
                unrealized_pnl_usd = ?12, unrealized_pnl_percent = ?13,
                total_entry_fees_usd = ?14, total_exit_fees_usd = ?15,
                risk_blocked = ?16, risk_skip_once = ?17,
                risk_timer_start = ?18, risk_timer_expires = ?19,
                risk_eligible = ?20, closing_started_at = ?21,
                status = ?22, updated_at = ?23, closed_at = ?24
             WHERE id = ?1",
            params![
                group.id.to_string(),
                group.weighted_avg_entry.to_string(),
                group.total_invested_usd.to_string(),
                group.total_filled_quantity.to_string(),
                group.total_dca_legs,
                group.filled_dca_legs,
                group.pyramid_count,
                group.tp_mode.as_str(),
                group.tp_aggregate_percent.to_string(),
                group.allocated_capital_usd.to_string(),
                group.realized_pnl_usd.to_string(),
                group.unrealized_pnl_usd.to_string(),
                group.unrealized_pnl_percent.to_string(),
                group.total_entry_fees_usd.to_string(),
                group.total_exit_fees_usd.to_string(),
                group.risk_blocked,
                group.risk_skip_once,
                opt_time_to_sql(group.risk_timer_start),
                opt_time_to_sql(group.risk_timer_expires),
                group.risk_eligible,
                opt_time_to_sql(group.closing_started_at),
                group.status.as_str(),
                time_to_sql(group.updated_at),
                opt_time_to_sql(group.closed_at),
            ],
        )?;
        Ok(())
    }

    pub fn get_group(&self, id: Uuid) -> EngineResult<Option<PositionGroup>> {
        let conn = self.lock();
        let mut stmt = conn.prepare("SELECT * FROM position_groups WHERE id = ?1")?;
        let mut rows = stmt.query_map(params![id.to_string()], group_from_row)?;
        match rows.next() {
            Some(group) => Ok(Some(group?)),
            None => Ok(None),
        }
    }

    /// The open group matching a signal's identity key, if any.
    /// `include_closing` widens the match for exit routing.
    pub fn find_group_for_signal(
        &self,
        user_id: Uuid,
        venue: &str,
        symbol: &str,
        timeframe: i64,
        side: crate::types::Side,
        include_closing: bool,
    ) -> EngineResult<Option<PositionGroup>> {
        let statuses = if include_closing {
            OPEN_OR_CLOSING
        } else {
            OPEN_STATUSES
        };
        let sql = format!(
            "SELECT * FROM position_groups
             WHERE user_id = ?1 AND venue = ?2 AND symbol = ?3
               AND timeframe = ?4 AND side = ?5
               AND status IN ({statuses})
             ORDER BY created_at LIMIT 1"
        );
        let conn = self.lock();
        let mut stmt = conn.prepare(&sql)?;
        let mut rows = stmt.query_map(
            params![
                user_id.to_string(),
                venue.to_lowercase(),
                symbol,
                timeframe,
                side.as_str()
            ],
            group_from_row,
        )?;
        match rows.next() {
            Some(group) => Ok(Some(group?)),
            None => Ok(None),
        }
    }

    /// All open (or closing) groups for one user.
    pub fn open_groups_for_user(&self, user_id: Uuid) -> EngineResult<Vec<PositionGroup>> {
        let sql = format!(
            "SELECT * FROM position_groups
             WHERE user_id = ?1 AND status IN ({OPEN_OR_CLOSING})
             ORDER BY created_at"
        );
        let conn = self.lock();
        let mut stmt = conn.prepare(&sql)?;
        let groups = stmt
            .query_map(params![user_id.to_string()], group_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(groups)
    }

    /// Groups in a specific status for one user.
    pub fn groups_by_status(
        &self,
        user_id: Uuid,
        status: GroupStatus,
    ) -> EngineResult<Vec<PositionGroup>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT * FROM position_groups
             WHERE user_id = ?1 AND status = ?2 ORDER BY created_at",
        )?;
        let groups = stmt
            .query_map(params![user_id.to_string(), status.as_str()], group_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(groups)
    }

    /// Count of open groups for the execution-pool reconcile.
    pub fn count_open_groups(&self, user_id: Option<Uuid>) -> EngineResult<i64> {
        let conn = self.lock();
        let count = match user_id {
            Some(user_id) => conn.query_row(
                &format!(
                    "SELECT COUNT(*) FROM position_groups
                     WHERE user_id = ?1 AND status IN ({OPEN_STATUSES})"
                ),
                params![user_id.to_string()],
                |row| row.get(0),
            )?,
            None => conn.query_row(
                &format!(
                    "SELECT COUNT(*) FROM position_groups WHERE status IN ({OPEN_STATUSES})"
                ),
                [],
                |row| row.get(0),
            )?,
        };
        Ok(count)
    }

    /// Open groups on the same (venue, symbol, timeframe), for the
    /// per-symbol pre-trade gate.
    pub fn count_open_groups_for_symbol(
        &self,
        user_id: Uuid,
        venue: &str,
        symbol: &str,
        timeframe: i64,
    ) -> EngineResult<i64> {
        let conn = self.lock();
        let count = conn.query_row(
            &format!(
                "SELECT COUNT(*) FROM position_groups
                 WHERE user_id = ?1 AND venue = ?2 AND symbol = ?3 AND timeframe = ?4
                   AND status IN ({OPEN_STATUSES})"
            ),
            params![user_id.to_string(), venue.to_lowercase(), symbol, timeframe],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    /// Sum of capital allocated to open groups, for the exposure gate.
    pub fn total_open_exposure(&self, user_id: Uuid) -> EngineResult<Decimal> {
        let sql = format!(
            "SELECT allocated_capital_usd FROM position_groups
             WHERE user_id = ?1 AND status IN ({OPEN_OR_CLOSING})"
        );
        let conn = self.lock();
        let mut stmt = conn.prepare(&sql)?;
        let amounts = stmt
            .query_map(params![user_id.to_string()], |row| {
                dec_from_sql(row.get(0)?)
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(amounts.into_iter().sum())
    }

    /// Aggregate figures for the dashboard surface: open exposure,
    /// unrealized PnL across open groups, and lifetime realized PnL.
    pub fn portfolio_summary(&self, user_id: Uuid) -> EngineResult<PortfolioSummary> {
        let open = self.open_groups_for_user(user_id)?;
        let mut summary = PortfolioSummary::default();
        summary.open_groups = open.len() as i64;
        for group in &open {
            summary.total_invested_usd += group.total_invested_usd;
            summary.unrealized_pnl_usd += group.unrealized_pnl_usd;
        }

        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT realized_pnl_usd FROM position_groups WHERE user_id = ?1",
        )?;
        let amounts = stmt
            .query_map(params![user_id.to_string()], |row| {
                dec_from_sql(row.get(0)?)
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        summary.realized_pnl_usd = amounts.into_iter().sum();
        Ok(summary)
    }

    /// Atomically bump the pyramid counter and leg total in a single
    /// statement so concurrent fills cannot observe a torn update.
    pub fn append_pyramid_counters(&self, group_id: Uuid, legs_added: i64) -> EngineResult<()> {
        let conn = self.lock();
        conn.execute(
            "UPDATE position_groups
             SET pyramid_count = pyramid_count + 1,
                 total_dca_legs = total_dca_legs + ?2,
                 updated_at = ?3
             WHERE id = ?1",
            params![group_id.to_string(), legs_added, time_to_sql(Utc::now())],
        )?;
        Ok(())
    }

    /// Create a group with its initial pyramid and ladder in one
    /// transaction, so a crash cannot leave a group without children.
    pub fn create_position_atomic(
        &self,
        group: &PositionGroup,
        pyramid: &crate::types::Pyramid,
        orders: &[crate::types::DcaOrder],
    ) -> EngineResult<()> {
        let mut conn = self.lock();
        let tx = conn.transaction().map_err(crate::error::EngineError::from)?;
        insert_group_stmt(&tx, group)?;
        super::pyramids::insert_pyramid_stmt(&tx, pyramid)?;
        for order in orders {
            super::dca_orders::insert_order_stmt(&tx, order)?;
        }
        tx.commit().map_err(crate::error::EngineError::from)?;
        Ok(())
    }
}

fn insert_group_stmt(conn: &rusqlite::Connection, group: &PositionGroup) -> EngineResult<()> {
    conn.execute(
        "INSERT INTO position_groups (
            id, user_id, venue, symbol, timeframe, side,
            base_entry_price, weighted_avg_entry, total_invested_usd,
            total_filled_quantity, total_dca_legs, filled_dca_legs,
            pyramid_count, max_pyramids, tp_mode, tp_aggregate_percent,
            allocated_capital_usd, realized_pnl_usd, unrealized_pnl_usd,
            unrealized_pnl_percent, total_entry_fees_usd, total_exit_fees_usd,
            risk_blocked, risk_skip_once, risk_timer_start, risk_timer_expires,
            risk_eligible, closing_started_at, status, created_at, updated_at, closed_at
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14,
                  ?15, ?16, ?17, ?18, ?19, ?20, ?21, ?22, ?23, ?24, ?25, ?26,
                  ?27, ?28, ?29, ?30, ?31, ?32)",
        params![
            group.id.to_string(),
            group.user_id.to_string(),
            group.venue,
            group.symbol,
            group.timeframe,
            group.side.as_str(),
            group.base_entry_price.to_string(),
            group.weighted_avg_entry.to_string(),
            group.total_invested_usd.to_string(),
            group.total_filled_quantity.to_string(),
            group.total_dca_legs,
            group.filled_dca_legs,
            group.pyramid_count,
            group.max_pyramids,
            group.tp_mode.as_str(),
            group.tp_aggregate_percent.to_string(),
            group.allocated_capital_usd.to_string(),
            group.realized_pnl_usd.to_string(),
            group.unrealized_pnl_usd.to_string(),
            group.unrealized_pnl_percent.to_string(),
            group.total_entry_fees_usd.to_string(),
            group.total_exit_fees_usd.to_string(),
            group.risk_blocked,
            group.risk_skip_once,
            opt_time_to_sql(group.risk_timer_start),
            opt_time_to_sql(group.risk_timer_expires),
            group.risk_eligible,
            opt_time_to_sql(group.closing_started_at),
            group.status.as_str(),
            time_to_sql(group.created_at),
            time_to_sql(group.updated_at),
            opt_time_to_sql(group.closed_at),
        ],
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Side, TpMode};
    use rust_decimal_macros::dec;

    fn seed_user(db: &Database) -> Uuid {
        let user = crate::types::User {
            id: Uuid::new_v4(),
            webhook_secret: "s".to_string(),
            credentials: Default::default(),
            risk_config: crate::config::RiskEngineConfig::default(),
            dca_configs: Default::default(),
            default_venue: "mock".to_string(),
            created_at: Utc::now(),
        };
        db.upsert_user(&user).unwrap();
        user.id
    }

    fn sample_group(user_id: Uuid) -> PositionGroup {
        PositionGroup::new(
            user_id,
            "mock",
            "SOLUSDT",
            60,
            Side::Buy,
            dec!(100),
            TpMode::PerLeg,
            Decimal::ZERO,
            5,
        )
    }

    #[test]
    fn test_group_roundtrip() {
        let db = Database::open_in_memory().unwrap();
        let user_id = seed_user(&db);
        let group = sample_group(user_id);
        db.insert_group(&group).unwrap();

        let loaded = db.get_group(group.id).unwrap().unwrap();
        assert_eq!(loaded.symbol, "SOLUSDT");
        assert_eq!(loaded.status, GroupStatus::Waiting);
        assert_eq!(loaded.base_entry_price, dec!(100));
    }

    #[test]
    fn test_find_group_for_signal_respects_statuses() {
        let db = Database::open_in_memory().unwrap();
        let user_id = seed_user(&db);
        let mut group = sample_group(user_id);
        db.insert_group(&group).unwrap();

        assert!(db
            .find_group_for_signal(user_id, "mock", "SOLUSDT", 60, Side::Buy, false)
            .unwrap()
            .is_some());

        group.status = GroupStatus::Closing;
        db.update_group(&mut group).unwrap();
        assert!(db
            .find_group_for_signal(user_id, "mock", "SOLUSDT", 60, Side::Buy, false)
            .unwrap()
            .is_none());
        assert!(db
            .find_group_for_signal(user_id, "mock", "SOLUSDT", 60, Side::Buy, true)
            .unwrap()
            .is_some());
    }

    #[test]
    fn test_append_pyramid_counters_is_single_statement() {
        let db = Database::open_in_memory().unwrap();
        let user_id = seed_user(&db);
        let mut group = sample_group(user_id);
        group.total_dca_legs = 3;
        group.pyramid_count = 1;
        db.insert_group(&group).unwrap();

        db.append_pyramid_counters(group.id, 3).unwrap();
        let loaded = db.get_group(group.id).unwrap().unwrap();
        assert_eq!(loaded.pyramid_count, 2);
        assert_eq!(loaded.total_dca_legs, 6);
    }

    #[test]
    fn test_exposure_and_counts() {
        let db = Database::open_in_memory().unwrap();
        let user_id = seed_user(&db);

        let mut a = sample_group(user_id);
        a.allocated_capital_usd = dec!(200);
        a.status = GroupStatus::Active;
        db.insert_group(&a).unwrap();

        let mut b = sample_group(user_id);
        b.symbol = "BTCUSDT".to_string();
        b.allocated_capital_usd = dec!(300);
        b.status = GroupStatus::Live;
        db.insert_group(&b).unwrap();

        assert_eq!(db.count_open_groups(Some(user_id)).unwrap(), 2);
        assert_eq!(db.count_open_groups(None).unwrap(), 2);
        assert_eq!(
            db.count_open_groups_for_symbol(user_id, "mock", "SOLUSDT", 60)
                .unwrap(),
            1
        );
        assert_eq!(db.total_open_exposure(user_id).unwrap(), dec!(500));
    }

    #[test]
    fn test_portfolio_summary_spans_open_and_closed() {
        let db = Database::open_in_memory().unwrap();
        let user_id = seed_user(&db);

        let mut open = sample_group(user_id);
        open.status = GroupStatus::Active;
        open.total_invested_usd = dec!(400);
        open.unrealized_pnl_usd = dec!(12);
        db.insert_group(&open).unwrap();

        let mut closed = sample_group(user_id);
        closed.symbol = "BTCUSDT".to_string();
        closed.status = GroupStatus::Closed;
        closed.realized_pnl_usd = dec!(-30);
        db.insert_group(&closed).unwrap();

        let summary = db.portfolio_summary(user_id).unwrap();
        assert_eq!(summary.open_groups, 1);
        assert_eq!(summary.total_invested_usd, dec!(400));
        assert_eq!(summary.unrealized_pnl_usd, dec!(12));
        assert_eq!(summary.realized_pnl_usd, dec!(-30));
    }
}
