//! User persistence.

use rusqlite::{params, Row};
use uuid::Uuid;

use super::{sql_invalid, time_from_sql, time_to_sql, Database};
use crate::error::EngineResult;
use crate::types::User;

fn user_from_row(row: &Row<'_>) -> rusqlite::Result<User> {
    let id: String = row.get("id")?;
    let credentials_json: String = row.get("credentials")?;
    let risk_json: String = row.get("risk_config")?;
    Ok(User {
        id: parse_uuid(&id)?,
        webhook_secret: row.get("webhook_secret")?,
        credentials: serde_json::from_str(&credentials_json)
            .map_err(|e| sql_invalid(format!("bad credentials map: {e}")))?,
        risk_config: serde_json::from_str(&risk_json)
            .map_err(|e| sql_invalid(format!("bad risk config: {e}")))?,
        dca_configs: {
            let json: String = row.get("dca_configs")?;
            serde_json::from_str(&json)
                .map_err(|e| sql_invalid(format!("bad dca configs: {e}")))?
        },
        default_venue: row.get("default_venue")?,
        created_at: time_from_sql(row.get("created_at")?)?,
    })
}

pub(crate) fn parse_uuid(text: &str) -> rusqlite::Result<Uuid> {
    Uuid::parse_str(text).map_err(|e| sql_invalid(format!("bad uuid '{text}': {e}")))
}

impl Database {
    pub fn upsert_user(&self, user: &User) -> EngineResult<()> {
        let conn = self.lock();
        conn.execute(
            "INSERT INTO users (id, webhook_secret, credentials, risk_config, dca_configs, default_venue, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
             ON CONFLICT(id) DO UPDATE SET
                webhook_secret = excluded.webhook_secret,
                credentials = excluded.credentials,
                risk_config = excluded.risk_config,
                dca_configs = excluded.dca_configs,
                default_venue = excluded.default_venue",
            params![
                user.id.to_string(),
                user.webhook_secret,
                serde_json::to_string(&user.credentials).unwrap_or_else(|_| "{}".to_string()),
                serde_json::to_string(&user.risk_config).unwrap_or_else(|_| "{}".to_string()),
                serde_json::to_string(&user.dca_configs).unwrap_or_else(|_| "{}".to_string()),
                user.default_venue,
                time_to_sql(user.created_at),
            ],
        )?;
        Ok(())
    }

    pub fn get_user(&self, id: Uuid) -> EngineResult<Option<User>> {
        let conn = self.lock();
        let mut stmt = conn.prepare("SELECT * FROM users WHERE id = ?1")?;
        let mut rows = stmt.query_map(params![id.to_string()], user_from_row)?;
        match rows.next() {
            Some(user) => Ok(Some(user?)),
            None => Ok(None),
        }
    }

    pub fn list_users(&self) -> EngineResult<Vec<User>> {
        let conn = self.lock();
        let mut stmt = conn.prepare("SELECT * FROM users ORDER BY created_at")?;
        let users = stmt
            .query_map([], user_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(users)
    }

    /// Persist only the risk configuration (used by force-stop/start and
    /// the daily-loss auto-pause).
    pub fn update_user_risk_config(
        &self,
        id: Uuid,
        config: &crate::config::RiskEngineConfig,
    ) -> EngineResult<()> {
        let conn = self.lock();
        conn.execute(
            "UPDATE users SET risk_config = ?2 WHERE id = ?1",
            params![
                id.to_string(),
                serde_json::to_string(config).unwrap_or_else(|_| "{}".to_string())
            ],
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RiskEngineConfig;
    use crate::types::VenueCredential;
    use chrono::Utc;
    use std::collections::HashMap;

    fn sample_user() -> User {
        let mut credentials = HashMap::new();
        credentials.insert(
            "mock".to_string(),
            VenueCredential {
                encrypted_blob: "blob".to_string(),
                testnet: false,
                market_kind: "spot".to_string(),
            },
        );
        User {
            id: Uuid::new_v4(),
            webhook_secret: "shh".to_string(),
            credentials,
            risk_config: RiskEngineConfig::default(),
            dca_configs: Default::default(),
            default_venue: "mock".to_string(),
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_user_roundtrip() {
        let db = Database::open_in_memory().unwrap();
        let user = sample_user();
        db.upsert_user(&user).unwrap();

        let loaded = db.get_user(user.id).unwrap().unwrap();
        assert_eq!(loaded.webhook_secret, "shh");
        assert_eq!(loaded.credentials.len(), 1);
        assert!(loaded.credential_for("MOCK").is_some());
        assert_eq!(db.list_users().unwrap().len(), 1);
    }

    #[test]
    fn test_upsert_replaces() {
        let db = Database::open_in_memory().unwrap();
        let mut user = sample_user();
        db.upsert_user(&user).unwrap();

        user.webhook_secret = "new-secret".to_string();
        db.upsert_user(&user).unwrap();

        let loaded = db.get_user(user.id).unwrap().unwrap();
        assert_eq!(loaded.webhook_secret, "new-secret");
    }

    #[test]
    fn test_update_risk_config_pauses_promotion() {
        let db = Database::open_in_memory().unwrap();
        let user = sample_user();
        db.upsert_user(&user).unwrap();

        let mut config = user.risk_config.clone();
        config.promotion_paused = true;
        db.update_user_risk_config(user.id, &config).unwrap();

        let loaded = db.get_user(user.id).unwrap().unwrap();
        assert!(loaded.risk_config.promotion_paused);
    }
}
