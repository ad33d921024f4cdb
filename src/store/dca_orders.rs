//! DCA order persistence and the reconciliation queries.

use chrono::Utc;
use rusqlite::{params, Connection, Row};
use uuid::Uuid;

use super::users::parse_uuid;
use super::{
    dec_from_sql, opt_time_from_sql, opt_time_to_sql, parse_sql, time_to_sql, Database,
};
use crate::error::EngineResult;
use crate::types::{DcaOrder, TP_FILL_LEG_INDEX};

fn order_from_row(row: &Row<'_>) -> rusqlite::Result<DcaOrder> {
    let id: String = row.get("id")?;
    let group_id: String = row.get("group_id")?;
    let pyramid_id: String = row.get("pyramid_id")?;
    Ok(DcaOrder {
        id: parse_uuid(&id)?,
        group_id: parse_uuid(&group_id)?,
        pyramid_id: parse_uuid(&pyramid_id)?,
        leg_index: row.get("leg_index")?,
        symbol: row.get("symbol")?,
        side: parse_sql(row.get("side")?)?,
        order_type: parse_sql(row.get("order_type")?)?,
        price: dec_from_sql(row.get("price")?)?,
        quantity: dec_from_sql(row.get("quantity")?)?,
        gap_percent: dec_from_sql(row.get("gap_percent")?)?,
        weight_percent: dec_from_sql(row.get("weight_percent")?)?,
        tp_percent: dec_from_sql(row.get("tp_percent")?)?,
        tp_price: dec_from_sql(row.get("tp_price")?)?,
        exchange_order_id: row.get("exchange_order_id")?,
        status: parse_sql(row.get("status")?)?,
        filled_quantity: dec_from_sql(row.get("filled_quantity")?)?,
        avg_fill_price: dec_from_sql(row.get("avg_fill_price")?)?,
        fee: dec_from_sql(row.get("fee")?)?,
        fee_currency: row.get("fee_currency")?,
        submitted_at: opt_time_from_sql(row.get("submitted_at")?)?,
        filled_at: opt_time_from_sql(row.get("filled_at")?)?,
        error: row.get("error")?,
        tp_order_id: row.get("tp_order_id")?,
        tp_hit: row.get("tp_hit")?,
    })
}

pub(super) fn insert_order_stmt(conn: &Connection, order: &DcaOrder) -> EngineResult<()> {
    conn.execute(
        "INSERT INTO dca_orders (
            id, group_id, pyramid_id, leg_index, symbol, side, order_type,
            price, quantity, gap_percent, weight_percent, tp_percent, tp_price,
            exchange_order_id, status, filled_quantity, avg_fill_price,
            fee, fee_currency, submitted_at, filled_at, error, tp_order_id, tp_hit
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13,
                  ?14, ?15, ?16, ?17, ?18, ?19, ?20, ?21, ?22, ?23, ?24)",
        params![
            order.id.to_string(),
            order.group_id.to_string(),
            order.pyramid_id.to_string(),
            order.leg_index,
            order.symbol,
            order.side.as_str(),
            order.order_type.as_str(),
            order.price.to_string(),
            order.quantity.to_string(),
            order.gap_percent.to_string(),
            order.weight_percent.to_string(),
            order.tp_percent.to_string(),
            order.tp_price.to_string(),
            order.exchange_order_id,
            order.status.as_str(),
            order.filled_quantity.to_string(),
            order.avg_fill_price.to_string(),
            order.fee.to_string(),
            order.fee_currency,
            opt_time_to_sql(order.submitted_at),
            opt_time_to_sql(order.filled_at),
            order.error,
            order.tp_order_id,
            order.tp_hit,
        ],
    )?;
    Ok(())
}

impl Database {
    pub fn insert_order(&self, order: &DcaOrder) -> EngineResult<()> {
        let conn = self.lock();
        insert_order_stmt(&conn, order)
    }

    /// Full-row update. Terminal statuses never regress: a stored
    /// filled/cancelled/failed row keeps its status unless the update
    /// carries the same terminal state.
    pub fn update_order(&self, order: &DcaOrder) -> EngineResult<()> {
        let conn = self.lock();
        conn.execute(
            "UPDATE dca_orders SET
                exchange_order_id = ?2,
                status = CASE
                    WHEN status IN ('filled','cancelled','failed') AND status != ?3
                    THEN status ELSE ?3 END,
                filled_quantity = ?4, avg_fill_price = ?5, fee = ?6,
                fee_currency = ?7, submitted_at = ?8, filled_at = ?9,
                error = ?10, tp_order_id = ?11, tp_hit = ?12
             WHERE id = ?1",
            params![
                order.id.to_string(),
                order.exchange_order_id,
                order.status.as_str(),
                order.filled_quantity.to_string(),
                order.avg_fill_price.to_string(),
                order.fee.to_string(),
                order.fee_currency,
                opt_time_to_sql(order.submitted_at),
                opt_time_to_sql(order.filled_at),
                order.error,
                order.tp_order_id,
                order.tp_hit,
            ],
        )?;
        Ok(())
    }

    pub fn get_order(&self, id: Uuid) -> EngineResult<Option<DcaOrder>> {
        let conn = self.lock();
        let mut stmt = conn.prepare("SELECT * FROM dca_orders WHERE id = ?1")?;
        let mut rows = stmt.query_map(params![id.to_string()], order_from_row)?;
        match rows.next() {
            Some(order) => Ok(Some(order?)),
            None => Ok(None),
        }
    }

    pub fn orders_for_group(&self, group_id: Uuid) -> EngineResult<Vec<DcaOrder>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT * FROM dca_orders WHERE group_id = ?1 ORDER BY leg_index",
        )?;
        let orders = stmt
            .query_map(params![group_id.to_string()], order_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(orders)
    }

    /// Orders still resting on the venue for one group.
    pub fn open_orders_for_group(&self, group_id: Uuid) -> EngineResult<Vec<DcaOrder>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT * FROM dca_orders
             WHERE group_id = ?1
               AND status IN ('open','partially_filled','trigger_pending')
             ORDER BY leg_index",
        )?;
        let orders = stmt
            .query_map(params![group_id.to_string()], order_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(orders)
    }

    /// Filled entry legs of a group, excluding TP-fill records. These rows
    /// are the accounting basis for weighted entry and cost basis.
    pub fn filled_entry_legs(&self, group_id: Uuid) -> EngineResult<Vec<DcaOrder>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT * FROM dca_orders
             WHERE group_id = ?1 AND status = 'filled' AND leg_index != ?2
             ORDER BY leg_index",
        )?;
        let orders = stmt
            .query_map(params![group_id.to_string(), TP_FILL_LEG_INDEX], order_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(orders)
    }

    /// The fill monitor's batched scan across all users: every order the
    /// venue might have moved. Unions resting orders with filled entry
    /// legs whose TP state is unresolved (TP missing, or placed but not
    /// yet hit).
    pub fn reconciliation_batch(&self) -> EngineResult<Vec<DcaOrder>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT * FROM dca_orders
             WHERE status IN ('open','partially_filled','trigger_pending')
                OR (status = 'filled' AND tp_hit = 0 AND leg_index != ?1)
             ORDER BY group_id, leg_index",
        )?;
        let orders = stmt
            .query_map(params![TP_FILL_LEG_INDEX], order_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(orders)
    }

    /// Close records (synthetic leg 999): TP fills and offset partial
    /// closes. Their quantities are subtracted from the entry side when
    /// aggregates are recomputed.
    pub fn close_records(&self, group_id: Uuid) -> EngineResult<Vec<DcaOrder>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT * FROM dca_orders
             WHERE group_id = ?1 AND leg_index = ?2 AND status = 'filled'",
        )?;
        let orders = stmt
            .query_map(params![group_id.to_string(), TP_FILL_LEG_INDEX], order_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(orders)
    }

    /// Record a newly observed entry fill in one statement.
    pub fn mark_order_filled(
        &self,
        id: Uuid,
        filled_quantity: rust_decimal::Decimal,
        avg_fill_price: rust_decimal::Decimal,
        fee: rust_decimal::Decimal,
        fee_currency: Option<&str>,
    ) -> EngineResult<()> {
        let conn = self.lock();
        conn.execute(
            "UPDATE dca_orders SET
                status = 'filled', filled_quantity = ?2, avg_fill_price = ?3,
                fee = ?4, fee_currency = ?5,
                filled_at = COALESCE(filled_at, ?6)
             WHERE id = ?1 AND status NOT IN ('cancelled','failed')",
            params![
                id.to_string(),
                filled_quantity.to_string(),
                avg_fill_price.to_string(),
                fee.to_string(),
                fee_currency,
                time_to_sql(Utc::now()),
            ],
        )?;
        Ok(())
    }
}
