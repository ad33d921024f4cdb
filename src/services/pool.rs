//! Execution pool
//!
//! Bounded counter capping live position groups, per user or globally.
//! The in-memory count can drift from reality after crashes or manual
//! closes; a periodic reconcile snaps it back to the database's live
//! group count.

use std::collections::HashMap;
use std::sync::Mutex;
use uuid::Uuid;

use crate::config::{PoolConfig, PoolScope};
use crate::error::EngineResult;
use crate::store::Database;

pub struct ExecutionPool {
    config: PoolConfig,
    counts: Mutex<HashMap<Uuid, i64>>,
    db: Database,
}

impl ExecutionPool {
    pub fn new(config: PoolConfig, db: Database) -> Self {
        Self {
            config,
            counts: Mutex::new(HashMap::new()),
            db,
        }
    }

    fn key_for(&self, user_id: Uuid) -> Uuid {
        match self.config.scope {
            PoolScope::PerUser => user_id,
            PoolScope::Global => Uuid::nil(),
        }
    }

    /// Take a slot if the pool has capacity. Returns false when full.
    pub fn request_slot(&self, user_id: Uuid) -> bool {
        let key = self.key_for(user_id);
        let mut counts = self.counts.lock().unwrap();
        let count = counts.entry(key).or_insert(0);
        if *count >= self.config.max_live_groups {
            return false;
        }
        *count += 1;
        true
    }

    /// Return a slot. Saturates at zero so double-releases cannot create
    /// phantom capacity below the floor.
    pub fn release_slot(&self, user_id: Uuid) {
        let key = self.key_for(user_id);
        let mut counts = self.counts.lock().unwrap();
        let count = counts.entry(key).or_insert(0);
        *count = (*count - 1).max(0);
    }

    pub fn slots_in_use(&self, user_id: Uuid) -> i64 {
        let key = self.key_for(user_id);
        *self.counts.lock().unwrap().get(&key).unwrap_or(&0)
    }

    pub fn has_capacity(&self, user_id: Uuid) -> bool {
        self.slots_in_use(user_id) < self.config.max_live_groups
    }

    /// Heal drift: snap each counter to the database's live group count.
    pub fn reconcile(&self) -> EngineResult<()> {
        match self.config.scope {
            PoolScope::Global => {
                let live = self.db.count_open_groups(None)?;
                let mut counts = self.counts.lock().unwrap();
                let entry = counts.entry(Uuid::nil()).or_insert(0);
                if *entry != live {
                    tracing::warn!(tracked = *entry, live, "pool counter drift healed");
                    *entry = live;
                }
            }
            PoolScope::PerUser => {
                let users = self.db.list_users()?;
                let mut counts = self.counts.lock().unwrap();
                for user in users {
                    let live = self.db.count_open_groups(Some(user.id))?;
                    let entry = counts.entry(user.id).or_insert(0);
                    if *entry != live {
                        tracing::warn!(
                            user = %user.id,
                            tracked = *entry,
                            live,
                            "pool counter drift healed"
                        );
                        *entry = live;
                    }
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool(max: i64, scope: PoolScope) -> ExecutionPool {
        ExecutionPool::new(
            PoolConfig {
                max_live_groups: max,
                scope,
            },
            Database::open_in_memory().unwrap(),
        )
    }

    #[test]
    fn test_per_user_cap() {
        let pool = pool(2, PoolScope::PerUser);
        let alice = Uuid::new_v4();
        let bob = Uuid::new_v4();

        assert!(pool.request_slot(alice));
        assert!(pool.request_slot(alice));
        assert!(!pool.request_slot(alice));
        // Separate user, separate counter
        assert!(pool.request_slot(bob));

        pool.release_slot(alice);
        assert!(pool.request_slot(alice));
    }

    #[test]
    fn test_global_scope_shares_one_counter() {
        let pool = pool(2, PoolScope::Global);
        let alice = Uuid::new_v4();
        let bob = Uuid::new_v4();

        assert!(pool.request_slot(alice));
        assert!(pool.request_slot(bob));
        assert!(!pool.request_slot(alice));
    }

    #[test]
    fn test_release_saturates_at_zero() {
        let pool = pool(1, PoolScope::PerUser);
        let user = Uuid::new_v4();
        pool.release_slot(user);
        pool.release_slot(user);
        assert_eq!(pool.slots_in_use(user), 0);
        assert!(pool.request_slot(user));
        assert!(!pool.request_slot(user));
    }

    #[test]
    fn test_reconcile_heals_drift() {
        use crate::types::{PositionGroup, Side, TpMode};
        use chrono::Utc;
        use rust_decimal::Decimal;
        use rust_decimal_macros::dec;

        let db = Database::open_in_memory().unwrap();
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

        let mut group = PositionGroup::new(
            user.id,
            "mock",
            "SOLUSDT",
            60,
            Side::Buy,
            dec!(100),
            TpMode::PerLeg,
            Decimal::ZERO,
            5,
        );
        group.status = crate::types::GroupStatus::Active;
        db.insert_group(&group).unwrap();

        let pool = ExecutionPool::new(
            PoolConfig {
                max_live_groups: 10,
                scope: PoolScope::PerUser,
            },
            db,
        );
        // Tracker thinks zero; database has one live group
        assert_eq!(pool.slots_in_use(user.id), 0);
        pool.reconcile().unwrap();
        assert_eq!(pool.slots_in_use(user.id), 1);
    }
}
