//! Queued signal persistence: dedup lookup and promotion bookkeeping.

use rusqlite::{params, Row};
use uuid::Uuid;

use super::users::parse_uuid;
use super::{dec_from_sql, opt_dec_from_sql, parse_sql, sql_invalid, time_from_sql, time_to_sql, Database};
use crate::error::EngineResult;
use crate::types::{QueuedSignal, Side, SignalStatus};

fn signal_from_row(row: &Row<'_>) -> rusqlite::Result<QueuedSignal> {
    let id: String = row.get("id")?;
    let user_id: String = row.get("user_id")?;
    let payload_json: String = row.get("payload")?;
    Ok(QueuedSignal {
        id: parse_uuid(&id)?,
        user_id: parse_uuid(&user_id)?,
        venue: row.get("venue")?,
        symbol: row.get("symbol")?,
        timeframe: row.get("timeframe")?,
        side: parse_sql(row.get("side")?)?,
        entry_price: dec_from_sql(row.get("entry_price")?)?,
        payload: serde_json::from_str(&payload_json)
            .map_err(|e| sql_invalid(format!("bad payload snapshot: {e}")))?,
        queued_at: time_from_sql(row.get("queued_at")?)?,
        replacement_count: row.get("replacement_count")?,
        current_loss_percent: opt_dec_from_sql(row.get("current_loss_percent")?)?,
        status: parse_sql(row.get("status")?)?,
        priority_score: dec_from_sql(row.get("priority_score")?)?,
        failure_reason: row.get("failure_reason")?,
    })
}

impl Database {
    pub fn insert_signal(&self, signal: &QueuedSignal) -> EngineResult<()> {
        let conn = self.lock();
        conn.execute(
            "INSERT INTO queued_signals (
                id, user_id, venue, symbol, timeframe, side, entry_price,
                payload, queued_at, replacement_count, current_loss_percent,
                status, priority_score, failure_reason
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
            params![
                signal.id.to_string(),
                signal.user_id.to_string(),
                signal.venue,
                signal.symbol,
                signal.timeframe,
                signal.side.as_str(),
                signal.entry_price.to_string(),
                signal.payload.to_string(),
                time_to_sql(signal.queued_at),
                signal.replacement_count,
                signal.current_loss_percent.map(|d| d.to_string()),
                signal.status.as_str(),
                signal.priority_score.to_string(),
                signal.failure_reason,
            ],
        )?;
        Ok(())
    }

    pub fn update_signal(&self, signal: &QueuedSignal) -> EngineResult<()> {
        let conn = self.lock();
        conn.execute(
            "UPDATE queued_signals SET
                entry_price = ?2, payload = ?3, queued_at = ?4,
                replacement_count = ?5, current_loss_percent = ?6,
                status = ?7, priority_score = ?8, failure_reason = ?9
             WHERE id = ?1",
            params![
                signal.id.to_string(),
                signal.entry_price.to_string(),
                signal.payload.to_string(),
                time_to_sql(signal.queued_at),
                signal.replacement_count,
                signal.current_loss_percent.map(|d| d.to_string()),
                signal.status.as_str(),
                signal.priority_score.to_string(),
                signal.failure_reason,
            ],
        )?;
        Ok(())
    }

    /// The queued signal on the same dedup composite, if any. Latest-wins
    /// replacement updates this row in place.
    pub fn find_queued_duplicate(
        &self,
        user_id: Uuid,
        venue: &str,
        symbol: &str,
        timeframe: i64,
        side: Side,
    ) -> EngineResult<Option<QueuedSignal>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT * FROM queued_signals
             WHERE user_id = ?1 AND venue = ?2 AND symbol = ?3
               AND timeframe = ?4 AND side = ?5 AND status = 'queued'
             LIMIT 1",
        )?;
        let mut rows = stmt.query_map(
            params![
                user_id.to_string(),
                venue.to_lowercase(),
                symbol,
                timeframe,
                side.as_str()
            ],
            signal_from_row,
        )?;
        match rows.next() {
            Some(signal) => Ok(Some(signal?)),
            None => Ok(None),
        }
    }

    /// All signals still waiting for a slot, oldest first.
    pub fn queued_signals(&self) -> EngineResult<Vec<QueuedSignal>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT * FROM queued_signals WHERE status = 'queued' ORDER BY queued_at",
        )?;
        let signals = stmt
            .query_map([], signal_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(signals)
    }

    pub fn queued_signals_for_user(&self, user_id: Uuid) -> EngineResult<Vec<QueuedSignal>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT * FROM queued_signals
             WHERE user_id = ?1 AND status = 'queued' ORDER BY queued_at",
        )?;
        let signals = stmt
            .query_map(params![user_id.to_string()], signal_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(signals)
    }

    /// Terminal bookkeeping for a signal; failed signals keep their reason
    /// for history.
    pub fn mark_signal(
        &self,
        id: Uuid,
        status: SignalStatus,
        reason: Option<&str>,
    ) -> EngineResult<()> {
        let conn = self.lock();
        conn.execute(
            "UPDATE queued_signals SET status = ?2, failure_reason = ?3 WHERE id = ?1",
            params![id.to_string(), status.as_str(), reason],
        )?;
        Ok(())
    }
}
