//! Coordination layer
//!
//! Key-value cache with TTL plus distributed locks over Redis. Locks are
//! bounded (no lock survives its TTL) and tokenized (only the holder may
//! release, enforced with a test-and-delete script). When the backend is
//! unreachable the layer degrades to process-local state with the same API,
//! trading multi-process safety for availability on that resource.

use redis::AsyncCommands;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

const CACHE_PREFIX: &str = "engine:cache:";
const LOCK_PREFIX: &str = "engine:lock:";

/// TTLs for the typed cache helpers.
pub const TICKERS_TTL: Duration = Duration::from_secs(60);
pub const BALANCE_TTL: Duration = Duration::from_secs(300);
pub const DASHBOARD_TTL: Duration = Duration::from_secs(60);
pub const HEALTH_TTL: Duration = Duration::from_secs(600);

/// Heartbeat record a background service publishes each cycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceHealth {
    /// Unix seconds of the last heartbeat.
    pub last_heartbeat: i64,
    /// "running", "error", or "stopped".
    pub status: String,
    #[serde(default)]
    pub error_count: u64,
    #[serde(default)]
    pub last_error: Option<String>,
}

impl ServiceHealth {
    pub fn running() -> Self {
        Self {
            last_heartbeat: unix_now(),
            status: "running".to_string(),
            error_count: 0,
            last_error: None,
        }
    }

    pub fn heartbeat_age_secs(&self) -> i64 {
        unix_now() - self.last_heartbeat
    }
}

fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}

struct FallbackValue {
    value: String,
    expires_at: Instant,
}

struct FallbackLock {
    token: String,
    expires_at: Instant,
}

/// The coordination service. Cheap to share behind an `Arc`.
pub struct Coordination {
    conn: Option<redis::aio::MultiplexedConnection>,
    fallback_kv: Mutex<HashMap<String, FallbackValue>>,
    fallback_locks: Mutex<HashMap<String, FallbackLock>>,
}

impl Coordination {
    /// Connect to the backend. Connection failure is not fatal: the layer
    /// starts in process-local mode and logs the degradation.
    pub async fn connect(redis_url: &str) -> Self {
        let conn = match redis::Client::open(redis_url) {
            Ok(client) => match client.get_multiplexed_tokio_connection().await {
                Ok(conn) => {
                    tracing::info!(url = %redis_url, "coordination backend connected");
                    Some(conn)
                }
                Err(e) => {
                    tracing::warn!(
                        url = %redis_url,
                        error = %e,
                        "coordination backend unreachable, degrading to process-local mode"
                    );
                    None
                }
            },
            Err(e) => {
                tracing::warn!(error = %e, "invalid coordination URL, using process-local mode");
                None
            }
        };

        Self {
            conn,
            fallback_kv: Mutex::new(HashMap::new()),
            fallback_locks: Mutex::new(HashMap::new()),
        }
    }

    /// Process-local instance, used by tests and single-replica deployments.
    pub fn in_process() -> Self {
        Self {
            conn: None,
            fallback_kv: Mutex::new(HashMap::new()),
            fallback_locks: Mutex::new(HashMap::new()),
        }
    }

    /// True when locks are actually distributed.
    pub fn is_distributed(&self) -> bool {
        self.conn.is_some()
    }

    // ---- key-value with TTL ----

    pub async fn get(&self, key: &str) -> Option<String> {
        let full_key = format!("{CACHE_PREFIX}{key}");
        if let Some(conn) = &self.conn {
            let mut conn = conn.clone();
            match conn.get::<_, Option<String>>(&full_key).await {
                Ok(value) => return value,
                Err(e) => tracing::warn!(key = %key, error = %e, "cache get failed"),
            }
        }
        let mut kv = self.fallback_kv.lock().unwrap();
        match kv.get(&full_key) {
            Some(entry) if entry.expires_at > Instant::now() => Some(entry.value.clone()),
            Some(_) => {
                kv.remove(&full_key);
                None
            }
            None => None,
        }
    }

    pub async fn set(&self, key: &str, value: &str, ttl: Duration) {
        let full_key = format!("{CACHE_PREFIX}{key}");
        if let Some(conn) = &self.conn {
            let mut conn = conn.clone();
            let seconds = ttl.as_secs().max(1) as usize;
            match conn.set_ex::<_, _, ()>(&full_key, value, seconds).await {
                Ok(()) => return,
                Err(e) => tracing::warn!(key = %key, error = %e, "cache set failed"),
            }
        }
        self.fallback_kv.lock().unwrap().insert(
            full_key,
            FallbackValue {
                value: value.to_string(),
                expires_at: Instant::now() + ttl,
            },
        );
    }

    pub async fn delete(&self, key: &str) {
        let full_key = format!("{CACHE_PREFIX}{key}");
        if let Some(conn) = &self.conn {
            let mut conn = conn.clone();
            if let Err(e) = conn.del::<_, ()>(&full_key).await {
                tracing::warn!(key = %key, error = %e, "cache delete failed");
            }
        }
        self.fallback_kv.lock().unwrap().remove(&full_key);
    }

    // ---- distributed locks ----

    /// Try to take the lock for `resource`. Non-blocking: returns false
    /// when another holder owns it.
    pub async fn acquire_lock(&self, resource: &str, token: &str, ttl: Duration) -> bool {
        let key = format!("{LOCK_PREFIX}{resource}");
        if let Some(conn) = &self.conn {
            let mut conn = conn.clone();
            let result: redis::RedisResult<Option<String>> = redis::cmd("SET")
                .arg(&key)
                .arg(token)
                .arg("NX")
                .arg("PX")
                .arg(ttl.as_millis() as u64)
                .query_async(&mut conn)
                .await;
            match result {
                Ok(reply) => {
                    // Re-acquisition by the current holder extends the lease.
                    if reply.is_some() {
                        return true;
                    }
                    return self.reacquire_if_held(&mut conn, &key, token, ttl).await;
                }
                Err(e) => {
                    tracing::warn!(resource = %resource, error = %e, "lock acquire failed, using fallback");
                }
            }
        }
        self.fallback_acquire(&key, token, ttl)
    }

    /// SET NX fails for the current holder too; leaders re-acquire to renew,
    /// so check ownership and extend in that case.
    async fn reacquire_if_held(
        &self,
        conn: &mut redis::aio::MultiplexedConnection,
        key: &str,
        token: &str,
        ttl: Duration,
    ) -> bool {
        let script = redis::Script::new(
            r#"
            if redis.call("get", KEYS[1]) == ARGV[1] then
                return redis.call("pexpire", KEYS[1], ARGV[2])
            else
                return 0
            end
            "#,
        );
        let result: redis::RedisResult<i64> = script
            .key(key)
            .arg(token)
            .arg(ttl.as_millis() as u64)
            .invoke_async(conn)
            .await;
        match result {
            Ok(result) => result == 1,
            Err(e) => {
                tracing::warn!(key = %key, error = %e, "lock reacquire check failed");
                false
            }
        }
    }

    /// Release the lock, conditional on holding it. Test-and-delete runs
    /// atomically on the backend.
    pub async fn release_lock(&self, resource: &str, token: &str) -> bool {
        let key = format!("{LOCK_PREFIX}{resource}");
        if let Some(conn) = &self.conn {
            let mut conn = conn.clone();
            let script = redis::Script::new(
                r#"
                if redis.call("get", KEYS[1]) == ARGV[1] then
                    return redis.call("del", KEYS[1])
                else
                    return 0
                end
                "#,
            );
            let result: redis::RedisResult<i64> =
                script.key(&key).arg(token).invoke_async(&mut conn).await;
            match result {
                Ok(result) => return result == 1,
                Err(e) => {
                    tracing::warn!(resource = %resource, error = %e, "lock release failed, using fallback");
                }
            }
        }
        self.fallback_release(&key, token)
    }

    /// Extend the TTL of a lock this token still holds.
    pub async fn extend_lock(&self, resource: &str, token: &str, ttl: Duration) -> bool {
        let key = format!("{LOCK_PREFIX}{resource}");
        if let Some(conn) = &self.conn {
            let mut conn = conn.clone();
            return self.reacquire_if_held(&mut conn, &key, token, ttl).await;
        }

        let mut locks = self.fallback_locks.lock().unwrap();
        match locks.get_mut(&key) {
            Some(lock) if lock.token == token && lock.expires_at > Instant::now() => {
                lock.expires_at = Instant::now() + ttl;
                true
            }
            _ => false,
        }
    }

    /// Drop all lock state for a permanently retired resource.
    pub async fn cleanup(&self, resource: &str) {
        let key = format!("{LOCK_PREFIX}{resource}");
        if let Some(conn) = &self.conn {
            let mut conn = conn.clone();
            let _: redis::RedisResult<()> = conn.del(&key).await;
        }
        self.fallback_locks.lock().unwrap().remove(&key);
    }

    fn fallback_acquire(&self, key: &str, token: &str, ttl: Duration) -> bool {
        let mut locks = self.fallback_locks.lock().unwrap();
        let now = Instant::now();
        match locks.get(key) {
            Some(lock) if lock.expires_at > now && lock.token != token => false,
            _ => {
                locks.insert(
                    key.to_string(),
                    FallbackLock {
                        token: token.to_string(),
                        expires_at: now + ttl,
                    },
                );
                true
            }
        }
    }

    fn fallback_release(&self, key: &str, token: &str) -> bool {
        let mut locks = self.fallback_locks.lock().unwrap();
        match locks.get(key) {
            Some(lock) if lock.token == token => {
                locks.remove(key);
                true
            }
            _ => false,
        }
    }

    // ---- typed cache helpers ----

    pub async fn set_tickers(&self, venue: &str, tickers: &HashMap<String, Decimal>) {
        if let Ok(json) = serde_json::to_string(tickers) {
            self.set(&format!("tickers:{venue}"), &json, TICKERS_TTL)
                .await;
        }
    }

    pub async fn get_tickers(&self, venue: &str) -> Option<HashMap<String, Decimal>> {
        let json = self.get(&format!("tickers:{venue}")).await?;
        serde_json::from_str(&json).ok()
    }

    pub async fn set_balance(&self, user_id: &str, venue: &str, balance_json: &str) {
        self.set(&format!("balance:{user_id}:{venue}"), balance_json, BALANCE_TTL)
            .await;
    }

    pub async fn get_balance(&self, user_id: &str, venue: &str) -> Option<String> {
        self.get(&format!("balance:{user_id}:{venue}")).await
    }

    pub async fn set_dashboard(&self, user_id: &str, view: &str, payload: &str) {
        self.set(&format!("dashboard:{user_id}:{view}"), payload, DASHBOARD_TTL)
            .await;
    }

    pub async fn get_dashboard(&self, user_id: &str, view: &str) -> Option<String> {
        self.get(&format!("dashboard:{user_id}:{view}")).await
    }

    /// Publish a service heartbeat, read back by the watchdog.
    pub async fn set_service_health(&self, service: &str, health: &ServiceHealth) {
        if let Ok(json) = serde_json::to_string(health) {
            self.set(&format!("health:{service}"), &json, HEALTH_TTL)
                .await;
        }
    }

    pub async fn get_service_health(&self, service: &str) -> Option<ServiceHealth> {
        let json = self.get(&format!("health:{service}")).await?;
        serde_json::from_str(&json).ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_fallback_kv_honours_ttl() {
        let coord = Coordination::in_process();
        coord.set("k", "v", Duration::from_millis(20)).await;
        assert_eq!(coord.get("k").await.as_deref(), Some("v"));

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(coord.get("k").await, None);
    }

    #[tokio::test]
    async fn test_fallback_lock_is_exclusive_and_tokenized() {
        let coord = Coordination::in_process();
        assert!(coord.acquire_lock("res", "a", Duration::from_secs(5)).await);
        assert!(!coord.acquire_lock("res", "b", Duration::from_secs(5)).await);

        // Wrong token cannot release
        assert!(!coord.release_lock("res", "b").await);
        assert!(coord.release_lock("res", "a").await);

        // Now free for the other holder
        assert!(coord.acquire_lock("res", "b", Duration::from_secs(5)).await);
    }

    #[tokio::test]
    async fn test_fallback_lock_expires() {
        let coord = Coordination::in_process();
        assert!(
            coord
                .acquire_lock("res", "a", Duration::from_millis(10))
                .await
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(coord.acquire_lock("res", "b", Duration::from_secs(5)).await);
    }

    #[tokio::test]
    async fn test_holder_reacquire_renews() {
        let coord = Coordination::in_process();
        assert!(coord.acquire_lock("res", "a", Duration::from_secs(5)).await);
        // Same holder re-acquiring extends rather than failing
        assert!(coord.acquire_lock("res", "a", Duration::from_secs(5)).await);
        assert!(coord.extend_lock("res", "a", Duration::from_secs(10)).await);
        assert!(!coord.extend_lock("res", "b", Duration::from_secs(10)).await);
    }

    #[tokio::test]
    async fn test_cleanup_frees_resource() {
        let coord = Coordination::in_process();
        assert!(coord.acquire_lock("res", "a", Duration::from_secs(60)).await);
        coord.cleanup("res").await;
        assert!(coord.acquire_lock("res", "b", Duration::from_secs(5)).await);
    }

    #[tokio::test]
    async fn test_service_health_roundtrip() {
        let coord = Coordination::in_process();
        let health = ServiceHealth::running();
        coord.set_service_health("fill_monitor", &health).await;
        let loaded = coord.get_service_health("fill_monitor").await.unwrap();
        assert_eq!(loaded.status, "running");
        assert!(loaded.heartbeat_age_secs() < 5);
    }
}
