//! Connector factory, cache, and circuit-breaker wrapping
//!
//! Hands out venue connectors keyed by (venue, api-key prefix, mode flags).
//! Cached connectors live for five minutes; eviction closes the underlying
//! session. Every call on a real venue passes through that venue's circuit
//! breaker. The venue type "mock" bypasses both the cache and the breaker.

use async_trait::async_trait;
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use super::rest::{RestConnector, RestConnectorConfig};
use super::{AssetBalance, Exchange, ExchangeOrder, MockExchange, PrecisionRules};
use crate::common::{BreakerRegistry, CircuitBreaker, CircuitBreakerConfig};
use crate::config::VenueEndpoint;
use crate::error::{EngineError, EngineResult};
use crate::security::SecretCipher;
use crate::types::{OrderType, Side, User};

const CONNECTOR_CACHE_TTL: Duration = Duration::from_secs(300);

/// Gateway construction parameters.
pub struct GatewayConfig {
    pub venues: HashMap<String, VenueEndpoint>,
    pub breaker: CircuitBreakerConfig,
}

struct CacheEntry {
    connector: Arc<dyn Exchange>,
    created: Instant,
}

/// The exchange gateway singleton: initialised once, drained on shutdown.
pub struct ExchangeGateway {
    venues: HashMap<String, VenueEndpoint>,
    breakers: BreakerRegistry,
    cipher: Arc<dyn SecretCipher>,
    cache: Mutex<HashMap<String, CacheEntry>>,
    /// Shared in-process reference venue, exposed for test scenarios.
    mock: Arc<MockExchange>,
}

impl ExchangeGateway {
    pub fn new(config: GatewayConfig, cipher: Arc<dyn SecretCipher>) -> Self {
        Self {
            venues: config
                .venues
                .into_iter()
                .map(|(k, v)| (k.to_lowercase(), v))
                .collect(),
            breakers: BreakerRegistry::new(config.breaker),
            cipher,
            cache: Mutex::new(HashMap::new()),
            mock: Arc::new(MockExchange::new()),
        }
    }

    /// The packaged mock venue, for admin/test access.
    pub fn mock_venue(&self) -> Arc<MockExchange> {
        Arc::clone(&self.mock)
    }

    pub fn breaker_metrics(&self) -> Vec<crate::common::circuit_breaker::BreakerMetrics> {
        self.breakers.all_metrics()
    }

    /// Resolve a breaker-guarded connector for a user's venue.
    pub fn connector_for(&self, user: &User, venue: &str) -> EngineResult<Arc<dyn Exchange>> {
        let venue = venue.to_lowercase();

        if venue == "mock" {
            return Ok(Arc::new(GuardedExchange {
                inner: Arc::clone(&self.mock) as Arc<dyn Exchange>,
                breaker: None,
            }));
        }

        let credential = user.credential_for(&venue).ok_or_else(|| {
            EngineError::Precondition(format!(
                "user {} has no credentials for venue '{venue}'",
                user.id
            ))
        })?;
        let endpoint = self.venues.get(&venue).ok_or_else(|| {
            EngineError::Precondition(format!("venue '{venue}' is not configured"))
        })?;

        let api = self
            .cipher
            .decrypt_credentials(&credential.encrypted_blob)?;
        let key_prefix: String = api.api_key.chars().take(8).collect();
        let cache_key = format!(
            "{venue}:{key_prefix}:{}:{}",
            credential.testnet, credential.market_kind
        );

        let connector = {
            let mut cache = self.cache.lock().unwrap();
            if let Some(entry) = cache.get(&cache_key) {
                if entry.created.elapsed() < CONNECTOR_CACHE_TTL {
                    Arc::clone(&entry.connector)
                } else {
                    let stale = cache.remove(&cache_key).map(|e| e.connector);
                    if let Some(stale) = stale {
                        tokio::spawn(async move { stale.close().await });
                    }
                    let fresh = self.build_connector(api, endpoint);
                    cache.insert(
                        cache_key,
                        CacheEntry {
                            connector: Arc::clone(&fresh),
                            created: Instant::now(),
                        },
                    );
                    fresh
                }
            } else {
                let fresh = self.build_connector(api, endpoint);
                cache.insert(
                    cache_key,
                    CacheEntry {
                        connector: Arc::clone(&fresh),
                        created: Instant::now(),
                    },
                );
                fresh
            }
        };

        Ok(Arc::new(GuardedExchange {
            inner: connector,
            breaker: Some(self.breakers.for_venue(&venue)),
        }))
    }

    fn build_connector(
        &self,
        api: crate::security::ApiCredentials,
        endpoint: &VenueEndpoint,
    ) -> Arc<dyn Exchange> {
        Arc::new(RestConnector::new(
            api,
            RestConnectorConfig {
                base_url: endpoint.base_url.clone(),
                read_timeout: Duration::from_secs(endpoint.read_timeout_secs),
                submit_timeout: Duration::from_secs(endpoint.submit_timeout_secs),
                rate_limit_per_second: endpoint.rate_limit_per_second,
                max_retries: 1,
            },
        ))
    }

    /// Evict connectors past their TTL, closing their sessions.
    pub async fn sweep_expired(&self) {
        let expired: Vec<Arc<dyn Exchange>> = {
            let mut cache = self.cache.lock().unwrap();
            let stale_keys: Vec<String> = cache
                .iter()
                .filter(|(_, entry)| entry.created.elapsed() >= CONNECTOR_CACHE_TTL)
                .map(|(key, _)| key.clone())
                .collect();
            stale_keys
                .into_iter()
                .filter_map(|key| cache.remove(&key).map(|e| e.connector))
                .collect()
        };
        for connector in expired {
            connector.close().await;
        }
    }

    /// Close every cached connector. Called on shutdown.
    pub async fn drain(&self) {
        let all: Vec<Arc<dyn Exchange>> = {
            let mut cache = self.cache.lock().unwrap();
            cache.drain().map(|(_, entry)| entry.connector).collect()
        };
        for connector in all {
            connector.close().await;
        }
        tracing::info!("exchange gateway drained");
    }
}

/// Connector wrapper that routes every call through the venue's breaker.
struct GuardedExchange {
    inner: Arc<dyn Exchange>,
    breaker: Option<Arc<CircuitBreaker>>,
}

impl GuardedExchange {
    fn admit(&self) -> EngineResult<()> {
        if let Some(breaker) = &self.breaker {
            if !breaker.can_execute() {
                return Err(EngineError::CircuitOpen {
                    venue: breaker.name().to_string(),
                    retry_after: breaker.time_until_retry(),
                });
            }
        }
        Ok(())
    }

    fn record<T>(&self, result: &EngineResult<T>) {
        let Some(breaker) = &self.breaker else {
            return;
        };
        match result {
            Ok(_) => breaker.record_success(),
            Err(e) if e.counts_against_breaker() => breaker.record_failure(),
            Err(_) => {}
        }
    }
}

#[async_trait]
impl Exchange for GuardedExchange {
    async fn place_order(
        &self,
        symbol: &str,
        order_type: OrderType,
        side: Side,
        quantity: Decimal,
        price: Option<Decimal>,
    ) -> EngineResult<ExchangeOrder> {
        self.admit()?;
        let result = self
            .inner
            .place_order(symbol, order_type, side, quantity, price)
            .await;
        self.record(&result);
        result
    }

    async fn get_order_status(&self, order_id: &str, symbol: &str) -> EngineResult<ExchangeOrder> {
        self.admit()?;
        let result = self.inner.get_order_status(order_id, symbol).await;
        self.record(&result);
        result
    }

    async fn cancel_order(&self, order_id: &str, symbol: &str) -> EngineResult<()> {
        self.admit()?;
        let result = self.inner.cancel_order(order_id, symbol).await;
        self.record(&result);
        result
    }

    async fn fetch_open_orders(&self, symbol: Option<&str>) -> EngineResult<Vec<ExchangeOrder>> {
        self.admit()?;
        let result = self.inner.fetch_open_orders(symbol).await;
        self.record(&result);
        result
    }

    async fn get_current_price(&self, symbol: &str) -> EngineResult<Decimal> {
        self.admit()?;
        let result = self.inner.get_current_price(symbol).await;
        self.record(&result);
        result
    }

    async fn get_all_tickers(&self) -> EngineResult<HashMap<String, Decimal>> {
        self.admit()?;
        let result = self.inner.get_all_tickers().await;
        self.record(&result);
        result
    }

    async fn fetch_balance(&self) -> EngineResult<HashMap<String, AssetBalance>> {
        self.admit()?;
        let result = self.inner.fetch_balance().await;
        self.record(&result);
        result
    }

    async fn get_precision_rules(&self) -> EngineResult<HashMap<String, PrecisionRules>> {
        self.admit()?;
        let result = self.inner.get_precision_rules().await;
        self.record(&result);
        result
    }

    async fn close(&self) {
        self.inner.close().await;
    }
}
