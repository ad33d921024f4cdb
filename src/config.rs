//! Configuration management
//!
//! Engine settings load from a JSON file with environment variable
//! overrides for deployment-specific values (database path, coordination
//! backend URL). Per-user risk settings and DCA grid shapes live here too
//! so the repository layer can snapshot them onto pyramids.

use anyhow::{Context, Result};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::Path;

use crate::types::{OrderType, TpMode};

/// One layer of a DCA ladder.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DcaLevel {
    /// Percentage gap from the base price. Negative gaps average down.
    pub gap_percent: Decimal,
    /// Share of the pyramid's capital allocated to this layer.
    pub weight_percent: Decimal,
    /// Take-profit percentage above this layer's fill.
    pub tp_percent: Decimal,
}

/// Per-pyramid DCA grid configuration, snapshotted onto each pyramid when
/// its ladder is computed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DcaGridConfig {
    /// Default layer list.
    pub levels: Vec<DcaLevel>,
    /// Overrides per pyramid index ("1", "2", ...). Index 0 (the initial
    /// entry) always uses the default list.
    #[serde(default)]
    pub pyramid_specific_levels: HashMap<String, Vec<DcaLevel>>,
    #[serde(default = "default_tp_mode")]
    pub tp_mode: TpMode,
    #[serde(default)]
    pub tp_aggregate_percent: Decimal,
    #[serde(default = "default_max_pyramids")]
    pub max_pyramids: i64,
    #[serde(default = "default_entry_order_type")]
    pub entry_order_type: OrderType,
}

fn default_tp_mode() -> TpMode {
    TpMode::PerLeg
}

fn default_max_pyramids() -> i64 {
    5
}

fn default_entry_order_type() -> OrderType {
    OrderType::Limit
}

impl DcaGridConfig {
    /// Resolve the layer list for a pyramid index: a specific override if
    /// configured, otherwise the default levels.
    pub fn levels_for_pyramid(&self, pyramid_index: i64) -> &[DcaLevel] {
        let key = pyramid_index.to_string();
        match self.pyramid_specific_levels.get(&key) {
            Some(levels) if !levels.is_empty() => levels,
            _ => &self.levels,
        }
    }

    /// A single-leg market-entry grid, useful for tests and simple signals.
    pub fn single_leg(tp_percent: Decimal) -> Self {
        Self {
            levels: vec![DcaLevel {
                gap_percent: Decimal::ZERO,
                weight_percent: dec!(100),
                tp_percent,
            }],
            pyramid_specific_levels: HashMap::new(),
            tp_mode: TpMode::PerLeg,
            tp_aggregate_percent: Decimal::ZERO,
            max_pyramids: default_max_pyramids(),
            entry_order_type: OrderType::Market,
        }
    }
}

impl Default for DcaGridConfig {
    fn default() -> Self {
        Self {
            levels: vec![
                DcaLevel {
                    gap_percent: dec!(0),
                    weight_percent: dec!(40),
                    tp_percent: dec!(2),
                },
                DcaLevel {
                    gap_percent: dec!(-1.5),
                    weight_percent: dec!(30),
                    tp_percent: dec!(2),
                },
                DcaLevel {
                    gap_percent: dec!(-3),
                    weight_percent: dec!(30),
                    tp_percent: dec!(2),
                },
            ],
            pyramid_specific_levels: HashMap::new(),
            tp_mode: TpMode::PerLeg,
            tp_aggregate_percent: Decimal::ZERO,
            max_pyramids: default_max_pyramids(),
            entry_order_type: OrderType::Limit,
        }
    }
}

/// Names of the queue priority rules, in their default execution order.
pub const PRIORITY_RULE_NAMES: [&str; 4] = [
    "same_pair_timeframe",
    "deepest_loss_percent",
    "highest_replacement",
    "fifo_fallback",
];

/// User-configurable queue priority rules: which are enabled and in what
/// order they are evaluated.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PriorityRulesConfig {
    pub rules_enabled: HashMap<String, bool>,
    pub rule_order: Vec<String>,
}

impl Default for PriorityRulesConfig {
    fn default() -> Self {
        Self {
            rules_enabled: PRIORITY_RULE_NAMES
                .iter()
                .map(|name| (name.to_string(), true))
                .collect(),
            rule_order: PRIORITY_RULE_NAMES.iter().map(|s| s.to_string()).collect(),
        }
    }
}

impl PriorityRulesConfig {
    /// Validate that at least one rule is enabled and the order lists all
    /// four known rules exactly once.
    pub fn validate(&self) -> Result<()> {
        if !self.rules_enabled.values().any(|enabled| *enabled) {
            anyhow::bail!("at least one priority rule must be enabled");
        }
        let mut sorted = self.rule_order.clone();
        sorted.sort();
        let mut expected: Vec<String> = PRIORITY_RULE_NAMES.iter().map(|s| s.to_string()).collect();
        expected.sort();
        if sorted != expected {
            anyhow::bail!(
                "rule_order must contain all rules {:?}, got {:?}",
                PRIORITY_RULE_NAMES,
                self.rule_order
            );
        }
        Ok(())
    }

    pub fn is_enabled(&self, rule: &str) -> bool {
        self.rules_enabled.get(rule).copied().unwrap_or(false)
    }
}

/// Per-user risk engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskEngineConfig {
    // Pre-trade gates
    pub max_open_positions_global: i64,
    pub max_open_positions_per_symbol: i64,
    pub max_total_exposure_usd: Decimal,
    /// Realized daily loss beyond which promotion auto-pauses.
    pub max_realized_loss_usd: Decimal,

    // Position sizing
    pub risk_per_position_percent: Decimal,
    pub risk_per_position_cap_usd: Option<Decimal>,

    // Offset engine
    pub loss_threshold_percent: Decimal,
    pub post_pyramids_wait_minutes: i64,
    pub required_pyramids_for_timer: i64,
    pub max_winners_to_combine: usize,
    pub min_close_notional: Decimal,
    pub partial_close_enabled: bool,

    /// Promotion paused by `force_stop` or the daily-loss breaker.
    #[serde(default)]
    pub promotion_paused: bool,

    #[serde(default)]
    pub priority_rules: PriorityRulesConfig,
}

impl Default for RiskEngineConfig {
    fn default() -> Self {
        Self {
            max_open_positions_global: 10,
            max_open_positions_per_symbol: 1,
            max_total_exposure_usd: dec!(10000),
            max_realized_loss_usd: dec!(500),
            risk_per_position_percent: dec!(10),
            risk_per_position_cap_usd: None,
            loss_threshold_percent: dec!(-1.5),
            post_pyramids_wait_minutes: 15,
            required_pyramids_for_timer: 3,
            max_winners_to_combine: 3,
            min_close_notional: dec!(10),
            partial_close_enabled: true,
            promotion_paused: false,
            priority_rules: PriorityRulesConfig::default(),
        }
    }
}

/// Endpoint for a venue speaking the uniform REST surface.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VenueEndpoint {
    pub base_url: String,
    #[serde(default = "default_read_timeout_secs")]
    pub read_timeout_secs: u64,
    #[serde(default = "default_submit_timeout_secs")]
    pub submit_timeout_secs: u64,
    #[serde(default = "default_rate_limit")]
    pub rate_limit_per_second: usize,
}

fn default_read_timeout_secs() -> u64 {
    30
}

fn default_submit_timeout_secs() -> u64 {
    60
}

fn default_rate_limit() -> usize {
    10
}

/// Background loop cadence.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoopIntervals {
    pub fill_monitor_secs: u64,
    pub risk_engine_secs: u64,
    pub queue_manager_secs: u64,
    pub pool_reconcile_secs: u64,
}

impl Default for LoopIntervals {
    fn default() -> Self {
        Self {
            fill_monitor_secs: 5,
            risk_engine_secs: 60,
            queue_manager_secs: 10,
            pool_reconcile_secs: 300,
        }
    }
}

/// Watchdog tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WatchdogConfig {
    pub check_interval_secs: u64,
    pub heartbeat_timeout_secs: u64,
    pub max_restarts: u32,
    pub restart_cooldown_secs: u64,
    pub error_threshold: u64,
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        Self {
            check_interval_secs: 30,
            heartbeat_timeout_secs: 120,
            max_restarts: 3,
            restart_cooldown_secs: 60,
            error_threshold: 10,
        }
    }
}

/// Execution pool scope: one counter per user, or a single global counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PoolScope {
    PerUser,
    Global,
}

/// Pool sizing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    pub max_live_groups: i64,
    pub scope: PoolScope,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_live_groups: 10,
            scope: PoolScope::PerUser,
        }
    }
}

/// Top-level engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default = "default_database_path")]
    pub database_path: String,
    #[serde(default = "default_redis_url")]
    pub redis_url: String,
    /// venue name -> REST endpoint. The reserved name "mock" needs no entry.
    #[serde(default)]
    pub venues: HashMap<String, VenueEndpoint>,
    #[serde(default)]
    pub intervals: LoopIntervals,
    #[serde(default)]
    pub watchdog: WatchdogConfig,
    #[serde(default)]
    pub pool: PoolConfig,
    /// Default slippage bound for market closes, in percent.
    #[serde(default = "default_max_slippage_percent")]
    pub max_slippage_percent: Decimal,
    /// Estimated exit fee applied to unrealized PnL, in percent.
    #[serde(default = "default_estimated_exit_fee_percent")]
    pub estimated_exit_fee_percent: Decimal,
}

fn default_database_path() -> String {
    "engine.db".to_string()
}

fn default_redis_url() -> String {
    "redis://127.0.0.1:6379".to_string()
}

fn default_max_slippage_percent() -> Decimal {
    Decimal::ONE
}

fn default_estimated_exit_fee_percent() -> Decimal {
    dec!(0.1)
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            database_path: default_database_path(),
            redis_url: default_redis_url(),
            venues: HashMap::new(),
            intervals: LoopIntervals::default(),
            watchdog: WatchdogConfig::default(),
            pool: PoolConfig::default(),
            max_slippage_percent: default_max_slippage_percent(),
            estimated_exit_fee_percent: default_estimated_exit_fee_percent(),
        }
    }
}

impl EngineConfig {
    /// Load configuration from a JSON file, then apply environment
    /// overrides for deployment values.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let contents = fs::read_to_string(path.as_ref()).context("Failed to read config file")?;
        let mut config: EngineConfig =
            serde_json::from_str(&contents).context("Failed to parse config JSON")?;

        if let Ok(url) = std::env::var("REDIS_URL") {
            config.redis_url = url;
        }
        if let Ok(db) = std::env::var("ENGINE_DATABASE_PATH") {
            config.database_path = db;
        }

        Ok(config)
    }
}
