//! Database of record
//!
//! SQLite-backed persistence for the engine's data model. One `Database` handle
//! wraps the connection behind a mutex (WAL mode for concurrent readers);
//! entity-specific queries live in sibling modules as further `impl`
//! blocks. Decimals are stored as TEXT so no accounting value ever passes
//! through floating point. Closed groups keep their children: there are no
//! cascade deletes anywhere in the schema.

mod dca_orders;
mod position_groups;
mod pyramids;
mod queued_signals;
mod risk_actions;
mod users;

pub use position_groups::PortfolioSummary;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::Connection;
use rust_decimal::Decimal;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

/// Shared handle to the engine database. Cloning shares the connection.
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    /// Open (or create) the database file and ensure the schema exists.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open database: {}", path.display()))?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        conn.busy_timeout(std::time::Duration::from_secs(5))?;

        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        db.create_tables()?;
        tracing::info!(path = %path.display(), "database initialized");
        Ok(db)
    }

    /// In-memory database for tests.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        db.create_tables()?;
        Ok(db)
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().expect("database mutex poisoned")
    }

    fn create_tables(&self) -> Result<()> {
        let conn = self.lock();

        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS users (
                id TEXT PRIMARY KEY,
                webhook_secret TEXT NOT NULL,
                credentials TEXT NOT NULL DEFAULT '{}',
                risk_config TEXT NOT NULL DEFAULT '{}',
                dca_configs TEXT NOT NULL DEFAULT '{}',
                default_venue TEXT NOT NULL DEFAULT 'mock',
                created_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS position_groups (
                id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL REFERENCES users(id),
                venue TEXT NOT NULL,
                symbol TEXT NOT NULL,
                timeframe INTEGER NOT NULL,
                side TEXT NOT NULL,
                base_entry_price TEXT NOT NULL,
                weighted_avg_entry TEXT NOT NULL DEFAULT '0',
                total_invested_usd TEXT NOT NULL DEFAULT '0',
                total_filled_quantity TEXT NOT NULL DEFAULT '0',
                total_dca_legs INTEGER NOT NULL DEFAULT 0,
                filled_dca_legs INTEGER NOT NULL DEFAULT 0,
                pyramid_count INTEGER NOT NULL DEFAULT 0,
                max_pyramids INTEGER NOT NULL DEFAULT 5,
                tp_mode TEXT NOT NULL DEFAULT 'per_leg',
                tp_aggregate_percent TEXT NOT NULL DEFAULT '0',
                allocated_capital_usd TEXT NOT NULL DEFAULT '0',
                realized_pnl_usd TEXT NOT NULL DEFAULT '0',
                unrealized_pnl_usd TEXT NOT NULL DEFAULT '0',
                unrealized_pnl_percent TEXT NOT NULL DEFAULT '0',
                total_entry_fees_usd TEXT NOT NULL DEFAULT '0',
                total_exit_fees_usd TEXT NOT NULL DEFAULT '0',
                risk_blocked INTEGER NOT NULL DEFAULT 0,
                risk_skip_once INTEGER NOT NULL DEFAULT 0,
                risk_timer_start TEXT,
                risk_timer_expires TEXT,
                risk_eligible INTEGER NOT NULL DEFAULT 0,
                closing_started_at TEXT,
                status TEXT NOT NULL DEFAULT 'waiting',
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                closed_at TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_groups_user_status
                ON position_groups(user_id, status);
            CREATE INDEX IF NOT EXISTS idx_groups_signal_key
                ON position_groups(user_id, venue, symbol, timeframe, side);

            CREATE TABLE IF NOT EXISTS pyramids (
                id TEXT PRIMARY KEY,
                group_id TEXT NOT NULL REFERENCES position_groups(id),
                pyramid_index INTEGER NOT NULL,
                entry_price TEXT NOT NULL,
                entry_timestamp TEXT NOT NULL,
                dca_config TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'pending'
            );
            CREATE INDEX IF NOT EXISTS idx_pyramids_group ON pyramids(group_id);

            CREATE TABLE IF NOT EXISTS dca_orders (
                id TEXT PRIMARY KEY,
                group_id TEXT NOT NULL REFERENCES position_groups(id),
                pyramid_id TEXT NOT NULL REFERENCES pyramids(id),
                leg_index INTEGER NOT NULL,
                symbol TEXT NOT NULL,
                side TEXT NOT NULL,
                order_type TEXT NOT NULL,
                price TEXT NOT NULL DEFAULT '0',
                quantity TEXT NOT NULL DEFAULT '0',
                gap_percent TEXT NOT NULL DEFAULT '0',
                weight_percent TEXT NOT NULL DEFAULT '0',
                tp_percent TEXT NOT NULL DEFAULT '0',
                tp_price TEXT NOT NULL DEFAULT '0',
                exchange_order_id TEXT,
                status TEXT NOT NULL DEFAULT 'pending',
                filled_quantity TEXT NOT NULL DEFAULT '0',
                avg_fill_price TEXT NOT NULL DEFAULT '0',
                fee TEXT NOT NULL DEFAULT '0',
                fee_currency TEXT,
                submitted_at TEXT,
                filled_at TEXT,
                error TEXT,
                tp_order_id TEXT,
                tp_hit INTEGER NOT NULL DEFAULT 0
            );
            CREATE INDEX IF NOT EXISTS idx_orders_group ON dca_orders(group_id);
            CREATE INDEX IF NOT EXISTS idx_orders_status ON dca_orders(status);

            CREATE TABLE IF NOT EXISTS queued_signals (
                id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL REFERENCES users(id),
                venue TEXT NOT NULL,
                symbol TEXT NOT NULL,
                timeframe INTEGER NOT NULL,
                side TEXT NOT NULL,
                entry_price TEXT NOT NULL DEFAULT '0',
                payload TEXT NOT NULL DEFAULT '{}',
                queued_at TEXT NOT NULL,
                replacement_count INTEGER NOT NULL DEFAULT 0,
                current_loss_percent TEXT,
                status TEXT NOT NULL DEFAULT 'queued',
                priority_score TEXT NOT NULL DEFAULT '0',
                failure_reason TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_signals_dedup
                ON queued_signals(user_id, symbol, timeframe, side, venue, status);

            CREATE TABLE IF NOT EXISTS risk_actions (
                id TEXT PRIMARY KEY,
                group_id TEXT NOT NULL REFERENCES position_groups(id),
                action_type TEXT NOT NULL,
                exit_price TEXT NOT NULL DEFAULT '0',
                entry_price TEXT NOT NULL DEFAULT '0',
                pnl_percent TEXT NOT NULL DEFAULT '0',
                realized_pnl_usd TEXT NOT NULL DEFAULT '0',
                quantity_closed TEXT NOT NULL DEFAULT '0',
                duration_seconds INTEGER,
                notes TEXT NOT NULL DEFAULT '',
                timestamp TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_actions_group ON risk_actions(group_id);
            CREATE INDEX IF NOT EXISTS idx_actions_time ON risk_actions(timestamp);",
        )?;

        Ok(())
    }
}

// ---- SQL <-> domain conversion helpers, shared by the entity modules ----

pub(crate) fn sql_invalid(message: impl Into<String>) -> rusqlite::Error {
    let message: String = message.into();
    rusqlite::Error::FromSqlConversionFailure(
        0,
        rusqlite::types::Type::Text,
        message.into(),
    )
}

pub(crate) fn dec_from_sql(text: String) -> rusqlite::Result<Decimal> {
    text.parse::<Decimal>()
        .map_err(|e| sql_invalid(format!("bad decimal '{text}': {e}")))
}

pub(crate) fn opt_dec_from_sql(text: Option<String>) -> rusqlite::Result<Option<Decimal>> {
    text.map(dec_from_sql).transpose()
}

pub(crate) fn time_from_sql(text: String) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(&text)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| sql_invalid(format!("bad timestamp '{text}': {e}")))
}

pub(crate) fn opt_time_from_sql(text: Option<String>) -> rusqlite::Result<Option<DateTime<Utc>>> {
    text.map(time_from_sql).transpose()
}

pub(crate) fn parse_sql<T: std::str::FromStr<Err = String>>(text: String) -> rusqlite::Result<T> {
    text.parse::<T>().map_err(sql_invalid)
}

pub(crate) fn time_to_sql(time: DateTime<Utc>) -> String {
    time.to_rfc3339()
}

pub(crate) fn opt_time_to_sql(time: Option<DateTime<Utc>>) -> Option<String> {
    time.map(time_to_sql)
}
