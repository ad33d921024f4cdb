//! Close-action audit trail.

use chrono::{DateTime, Utc};
use rusqlite::{params, Row};
use rust_decimal::Decimal;
use uuid::Uuid;

use super::users::parse_uuid;
use super::{dec_from_sql, parse_sql, time_from_sql, time_to_sql, Database};
use crate::error::EngineResult;
use crate::types::RiskAction;

fn action_from_row(row: &Row<'_>) -> rusqlite::Result<RiskAction> {
    let id: String = row.get("id")?;
    let group_id: String = row.get("group_id")?;
    Ok(RiskAction {
        id: parse_uuid(&id)?,
        group_id: parse_uuid(&group_id)?,
        action_type: parse_sql(row.get("action_type")?)?,
        exit_price: dec_from_sql(row.get("exit_price")?)?,
        entry_price: dec_from_sql(row.get("entry_price")?)?,
        pnl_percent: dec_from_sql(row.get("pnl_percent")?)?,
        realized_pnl_usd: dec_from_sql(row.get("realized_pnl_usd")?)?,
        quantity_closed: dec_from_sql(row.get("quantity_closed")?)?,
        duration_seconds: row.get("duration_seconds")?,
        notes: row.get("notes")?,
        timestamp: time_from_sql(row.get("timestamp")?)?,
    })
}

impl Database {
    pub fn insert_risk_action(&self, action: &RiskAction) -> EngineResult<()> {
        let conn = self.lock();
        conn.execute(
            "INSERT INTO risk_actions (
                id, group_id, action_type, exit_price, entry_price,
                pnl_percent, realized_pnl_usd, quantity_closed,
                duration_seconds, notes, timestamp
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            params![
                action.id.to_string(),
                action.group_id.to_string(),
                action.action_type.as_str(),
                action.exit_price.to_string(),
                action.entry_price.to_string(),
                action.pnl_percent.to_string(),
                action.realized_pnl_usd.to_string(),
                action.quantity_closed.to_string(),
                action.duration_seconds,
                action.notes,
                time_to_sql(action.timestamp),
            ],
        )?;
        Ok(())
    }

    pub fn actions_for_group(&self, group_id: Uuid) -> EngineResult<Vec<RiskAction>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT * FROM risk_actions WHERE group_id = ?1 ORDER BY timestamp",
        )?;
        let actions = stmt
            .query_map(params![group_id.to_string()], action_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(actions)
    }

    /// Sum of realized PnL recorded for a user since `since`. Drives the
    /// daily-loss auto-pause and the pre-trade gate.
    pub fn realized_pnl_since(
        &self,
        user_id: Uuid,
        since: DateTime<Utc>,
    ) -> EngineResult<Decimal> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT ra.realized_pnl_usd FROM risk_actions ra
             JOIN position_groups pg ON ra.group_id = pg.id
             WHERE pg.user_id = ?1 AND ra.timestamp >= ?2",
        )?;
        let amounts = stmt
            .query_map(params![user_id.to_string(), time_to_sql(since)], |row| {
                dec_from_sql(row.get(0)?)
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(amounts.into_iter().sum())
    }
}
