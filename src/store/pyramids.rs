//! Pyramid persistence.

use rusqlite::{params, Connection, Row};
use uuid::Uuid;

use super::users::parse_uuid;
use super::{dec_from_sql, parse_sql, sql_invalid, time_from_sql, time_to_sql, Database};
use crate::error::EngineResult;
use crate::types::{Pyramid, PyramidStatus};

fn pyramid_from_row(row: &Row<'_>) -> rusqlite::Result<Pyramid> {
    let id: String = row.get("id")?;
    let group_id: String = row.get("group_id")?;
    let config_json: String = row.get("dca_config")?;
    Ok(Pyramid {
        id: parse_uuid(&id)?,
        group_id: parse_uuid(&group_id)?,
        pyramid_index: row.get("pyramid_index")?,
        entry_price: dec_from_sql(row.get("entry_price")?)?,
        entry_timestamp: time_from_sql(row.get("entry_timestamp")?)?,
        dca_config: serde_json::from_str(&config_json)
            .map_err(|e| sql_invalid(format!("bad dca config snapshot: {e}")))?,
        status: parse_sql(row.get("status")?)?,
    })
}

pub(super) fn insert_pyramid_stmt(conn: &Connection, pyramid: &Pyramid) -> EngineResult<()> {
    conn.execute(
        "INSERT INTO pyramids (id, group_id, pyramid_index, entry_price,
                               entry_timestamp, dca_config, status)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            pyramid.id.to_string(),
            pyramid.group_id.to_string(),
            pyramid.pyramid_index,
            pyramid.entry_price.to_string(),
            time_to_sql(pyramid.entry_timestamp),
            serde_json::to_string(&pyramid.dca_config).unwrap_or_else(|_| "{}".to_string()),
            pyramid.status.as_str(),
        ],
    )?;
    Ok(())
}

impl Database {
    pub fn insert_pyramid(&self, pyramid: &Pyramid) -> EngineResult<()> {
        let conn = self.lock();
        insert_pyramid_stmt(&conn, pyramid)
    }

    pub fn update_pyramid_status(&self, id: Uuid, status: PyramidStatus) -> EngineResult<()> {
        let conn = self.lock();
        conn.execute(
            "UPDATE pyramids SET status = ?2 WHERE id = ?1",
            params![id.to_string(), status.as_str()],
        )?;
        Ok(())
    }

    pub fn pyramids_for_group(&self, group_id: Uuid) -> EngineResult<Vec<Pyramid>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT * FROM pyramids WHERE group_id = ?1 ORDER BY pyramid_index",
        )?;
        let pyramids = stmt
            .query_map(params![group_id.to_string()], pyramid_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(pyramids)
    }
}
