//! Core domain model
//!
//! Defines position groups, pyramids, DCA legs, queued signals, and the
//! audit records the risk engine writes. All monetary and quantity fields
//! are `Decimal`; identifiers are UUIDs.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Synthetic leg index designating a TP-fill record rather than an entry.
/// These rows carry realized TP proceeds for accounting and are excluded
/// from entry-reconciliation queries.
pub const TP_FILL_LEG_INDEX: i64 = 999;

/// Position side. The engine is spot-long-only; `Sell` appears only on
/// orders (exits and TPs), never on a position group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    pub fn opposite(self) -> Side {
        match self {
            Side::Buy => Side::Sell,
            Side::Sell => Side::Buy,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Side::Buy => "buy",
            Side::Sell => "sell",
        }
    }
}

impl FromStr for Side {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "buy" | "long" => Ok(Side::Buy),
            "sell" | "short" => Ok(Side::Sell),
            other => Err(format!("unknown side '{other}'")),
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Order execution type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderType {
    Limit,
    Market,
}

impl OrderType {
    pub fn as_str(self) -> &'static str {
        match self {
            OrderType::Limit => "limit",
            OrderType::Market => "market",
        }
    }
}

impl FromStr for OrderType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "limit" => Ok(OrderType::Limit),
            "market" => Ok(OrderType::Market),
            other => Err(format!("unknown order type '{other}'")),
        }
    }
}

/// Take-profit policy for a position group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TpMode {
    /// Each filled entry leg carries its own TP target.
    PerLeg,
    /// One TP at the weighted-average entry target; closes all filled legs.
    Aggregate,
    /// First trigger wins: per-leg hits close matching legs, otherwise the
    /// aggregate target closes everything.
    Hybrid,
}

impl TpMode {
    pub fn as_str(self) -> &'static str {
        match self {
            TpMode::PerLeg => "per_leg",
            TpMode::Aggregate => "aggregate",
            TpMode::Hybrid => "hybrid",
        }
    }

    /// True when filled entry legs should have a resting TP order on venue.
    pub fn places_leg_tp(self) -> bool {
        matches!(self, TpMode::PerLeg | TpMode::Hybrid)
    }
}

impl FromStr for TpMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "per_leg" => Ok(TpMode::PerLeg),
            "aggregate" => Ok(TpMode::Aggregate),
            "hybrid" => Ok(TpMode::Hybrid),
            other => Err(format!("unknown tp mode '{other}'")),
        }
    }
}

/// Position group lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GroupStatus {
    /// Created, ladder not yet acknowledged by the venue.
    Waiting,
    /// Ladder resting on the venue, nothing filled yet.
    Live,
    PartiallyFilled,
    /// At least one entry filled; the group owns live venue orders.
    Active,
    /// A close is in flight. Recovered by the risk engine if stuck.
    Closing,
    Closed,
    Failed,
}

impl GroupStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            GroupStatus::Waiting => "waiting",
            GroupStatus::Live => "live",
            GroupStatus::PartiallyFilled => "partially_filled",
            GroupStatus::Active => "active",
            GroupStatus::Closing => "closing",
            GroupStatus::Closed => "closed",
            GroupStatus::Failed => "failed",
        }
    }

    /// States in which the group matches incoming signals and counts
    /// against the execution pool.
    pub fn is_open(self) -> bool {
        matches!(
            self,
            GroupStatus::Waiting
                | GroupStatus::Live
                | GroupStatus::PartiallyFilled
                | GroupStatus::Active
        )
    }

    /// States eligible as risk-engine winners.
    pub fn is_winner_eligible(self) -> bool {
        matches!(
            self,
            GroupStatus::Live | GroupStatus::PartiallyFilled | GroupStatus::Active
        )
    }
}

impl FromStr for GroupStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "waiting" => Ok(GroupStatus::Waiting),
            "live" => Ok(GroupStatus::Live),
            "partially_filled" => Ok(GroupStatus::PartiallyFilled),
            "active" => Ok(GroupStatus::Active),
            "closing" => Ok(GroupStatus::Closing),
            "closed" => Ok(GroupStatus::Closed),
            "failed" => Ok(GroupStatus::Failed),
            other => Err(format!("unknown group status '{other}'")),
        }
    }
}

/// Pyramid lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PyramidStatus {
    Pending,
    PartiallyFilled,
    Filled,
    Closed,
    Cancelled,
}

impl PyramidStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            PyramidStatus::Pending => "pending",
            PyramidStatus::PartiallyFilled => "partially_filled",
            PyramidStatus::Filled => "filled",
            PyramidStatus::Closed => "closed",
            PyramidStatus::Cancelled => "cancelled",
        }
    }
}

impl FromStr for PyramidStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pending" => Ok(PyramidStatus::Pending),
            "partially_filled" => Ok(PyramidStatus::PartiallyFilled),
            "filled" => Ok(PyramidStatus::Filled),
            "closed" => Ok(PyramidStatus::Closed),
            "cancelled" => Ok(PyramidStatus::Cancelled),
            other => Err(format!("unknown pyramid status '{other}'")),
        }
    }
}

/// DCA order state machine. Terminal states never regress.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    Pending,
    TriggerPending,
    Open,
    PartiallyFilled,
    Filled,
    Cancelled,
    Failed,
}

impl OrderStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            OrderStatus::Pending => "pending",
            OrderStatus::TriggerPending => "trigger_pending",
            OrderStatus::Open => "open",
            OrderStatus::PartiallyFilled => "partially_filled",
            OrderStatus::Filled => "filled",
            OrderStatus::Cancelled => "cancelled",
            OrderStatus::Failed => "failed",
        }
    }

    pub fn is_active(self) -> bool {
        matches!(
            self,
            OrderStatus::Pending
                | OrderStatus::TriggerPending
                | OrderStatus::Open
                | OrderStatus::PartiallyFilled
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            OrderStatus::Filled | OrderStatus::Cancelled | OrderStatus::Failed
        )
    }

    /// Map a venue-reported status string onto the local enum, defaulting
    /// to the current status when the venue says something unrecognised.
    pub fn from_exchange(status: &str, current: OrderStatus) -> OrderStatus {
        match status.to_lowercase().as_str() {
            "open" | "new" => OrderStatus::Open,
            "partially_filled" => OrderStatus::PartiallyFilled,
            "closed" | "filled" => OrderStatus::Filled,
            "canceled" | "cancelled" | "expired" => OrderStatus::Cancelled,
            "rejected" => OrderStatus::Failed,
            _ => current,
        }
    }
}

impl FromStr for OrderStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pending" => Ok(OrderStatus::Pending),
            "trigger_pending" => Ok(OrderStatus::TriggerPending),
            "open" => Ok(OrderStatus::Open),
            "partially_filled" => Ok(OrderStatus::PartiallyFilled),
            "filled" => Ok(OrderStatus::Filled),
            "cancelled" => Ok(OrderStatus::Cancelled),
            "failed" => Ok(OrderStatus::Failed),
            other => Err(format!("unknown order status '{other}'")),
        }
    }
}

/// Queued signal lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalStatus {
    Queued,
    Promoted,
    Cancelled,
    Failed,
}

impl SignalStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            SignalStatus::Queued => "queued",
            SignalStatus::Promoted => "promoted",
            SignalStatus::Cancelled => "cancelled",
            SignalStatus::Failed => "failed",
        }
    }
}

impl FromStr for SignalStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "queued" => Ok(SignalStatus::Queued),
            "promoted" => Ok(SignalStatus::Promoted),
            "cancelled" => Ok(SignalStatus::Cancelled),
            "failed" => Ok(SignalStatus::Failed),
            other => Err(format!("unknown signal status '{other}'")),
        }
    }
}

/// Classification of a recorded close.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskActionType {
    ManualClose,
    EngineClose,
    TpHit,
    /// Loser side of a loss-offset action.
    OffsetLoss,
    /// Winner side of a loss-offset action (partial close).
    OffsetWinner,
}

impl RiskActionType {
    pub fn as_str(self) -> &'static str {
        match self {
            RiskActionType::ManualClose => "manual_close",
            RiskActionType::EngineClose => "engine_close",
            RiskActionType::TpHit => "tp_hit",
            RiskActionType::OffsetLoss => "offset_loss",
            RiskActionType::OffsetWinner => "offset_winner",
        }
    }

    /// Map an exit-signal trigger reason onto an action type.
    pub fn from_exit_reason(reason: &str) -> RiskActionType {
        match reason {
            "manual" => RiskActionType::ManualClose,
            "tp_hit" => RiskActionType::TpHit,
            "risk_offset" => RiskActionType::OffsetLoss,
            _ => RiskActionType::EngineClose,
        }
    }
}

impl FromStr for RiskActionType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "manual_close" => Ok(RiskActionType::ManualClose),
            "engine_close" => Ok(RiskActionType::EngineClose),
            "tp_hit" => Ok(RiskActionType::TpHit),
            "offset_loss" => Ok(RiskActionType::OffsetLoss),
            "offset_winner" => Ok(RiskActionType::OffsetWinner),
            other => Err(format!("unknown risk action type '{other}'")),
        }
    }
}

/// Per-venue credential blob plus mode flags. The blob is opaque here;
/// the configured [`crate::security::SecretCipher`] decrypts it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VenueCredential {
    pub encrypted_blob: String,
    #[serde(default)]
    pub testnet: bool,
    #[serde(default = "default_market_kind")]
    pub market_kind: String,
}

fn default_market_kind() -> String {
    "spot".to_string()
}

/// A configured user. Created out of band; referenced by everything below.
#[derive(Debug, Clone)]
pub struct User {
    pub id: Uuid,
    pub webhook_secret: String,
    /// venue name (lowercase) -> credential blob + mode flags. The legacy
    /// single-key format is rejected at ingestion.
    pub credentials: HashMap<String, VenueCredential>,
    pub risk_config: crate::config::RiskEngineConfig,
    /// DCA grid shapes keyed "{symbol}:{timeframe}:{venue}", with an
    /// optional "default" entry as the fallback.
    pub dca_configs: HashMap<String, crate::config::DcaGridConfig>,
    pub default_venue: String,
    pub created_at: DateTime<Utc>,
}

impl User {
    /// Resolve the credential for a venue, case-insensitively.
    pub fn credential_for(&self, venue: &str) -> Option<&VenueCredential> {
        self.credentials.get(&venue.to_lowercase())
    }

    /// Resolve the grid configuration for a signal key, falling back to
    /// the user's "default" entry, then to the built-in defaults.
    pub fn dca_config_for(
        &self,
        symbol: &str,
        timeframe: i64,
        venue: &str,
    ) -> crate::config::DcaGridConfig {
        let key = format!("{symbol}:{timeframe}:{}", venue.to_lowercase());
        self.dca_configs
            .get(&key)
            .or_else(|| self.dca_configs.get("default"))
            .cloned()
            .unwrap_or_default()
    }
}

/// The unit the engine plans and closes against: one symbol, one timeframe,
/// one side, many pyramids each carrying a DCA ladder.
#[derive(Debug, Clone)]
pub struct PositionGroup {
    pub id: Uuid,
    pub user_id: Uuid,
    pub venue: String,
    pub symbol: String,
    pub timeframe: i64,
    pub side: Side,

    // Plan
    pub base_entry_price: Decimal,
    pub weighted_avg_entry: Decimal,
    pub total_invested_usd: Decimal,
    pub total_filled_quantity: Decimal,
    pub total_dca_legs: i64,
    pub filled_dca_legs: i64,
    pub pyramid_count: i64,
    pub max_pyramids: i64,
    pub tp_mode: TpMode,
    pub tp_aggregate_percent: Decimal,
    /// Capital allocated to this group at promotion, used by the exposure gate.
    pub allocated_capital_usd: Decimal,

    // Accounting
    pub realized_pnl_usd: Decimal,
    pub unrealized_pnl_usd: Decimal,
    pub unrealized_pnl_percent: Decimal,
    pub total_entry_fees_usd: Decimal,
    pub total_exit_fees_usd: Decimal,

    // Risk control
    pub risk_blocked: bool,
    pub risk_skip_once: bool,
    pub risk_timer_start: Option<DateTime<Utc>>,
    pub risk_timer_expires: Option<DateTime<Utc>>,
    pub risk_eligible: bool,
    pub closing_started_at: Option<DateTime<Utc>>,

    pub status: GroupStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub closed_at: Option<DateTime<Utc>>,
}

impl PositionGroup {
    /// New group in `waiting` for a freshly routed signal.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        user_id: Uuid,
        venue: &str,
        symbol: &str,
        timeframe: i64,
        side: Side,
        base_entry_price: Decimal,
        tp_mode: TpMode,
        tp_aggregate_percent: Decimal,
        max_pyramids: i64,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            user_id,
            venue: venue.to_lowercase(),
            symbol: symbol.to_string(),
            timeframe,
            side,
            base_entry_price,
            weighted_avg_entry: Decimal::ZERO,
            total_invested_usd: Decimal::ZERO,
            total_filled_quantity: Decimal::ZERO,
            total_dca_legs: 0,
            filled_dca_legs: 0,
            pyramid_count: 0,
            max_pyramids,
            tp_mode,
            tp_aggregate_percent,
            allocated_capital_usd: Decimal::ZERO,
            realized_pnl_usd: Decimal::ZERO,
            unrealized_pnl_usd: Decimal::ZERO,
            unrealized_pnl_percent: Decimal::ZERO,
            total_entry_fees_usd: Decimal::ZERO,
            total_exit_fees_usd: Decimal::ZERO,
            risk_blocked: false,
            risk_skip_once: false,
            risk_timer_start: None,
            risk_timer_expires: None,
            risk_eligible: false,
            closing_started_at: None,
            status: GroupStatus::Waiting,
            created_at: now,
            updated_at: now,
            closed_at: None,
        }
    }

    /// True once another pyramid may still be appended.
    pub fn can_pyramid(&self) -> bool {
        self.status.is_open() && self.pyramid_count < self.max_pyramids
    }

    /// Signal identity key: groups match signals on (user, venue, symbol,
    /// timeframe, side).
    pub fn matches_signal(
        &self,
        user_id: Uuid,
        venue: &str,
        symbol: &str,
        timeframe: i64,
        side: Side,
    ) -> bool {
        self.user_id == user_id
            && self.venue.eq_ignore_ascii_case(venue)
            && self.symbol == symbol
            && self.timeframe == timeframe
            && self.side == side
    }
}

/// One entry wave within a group. Index 0 is the initial entry.
#[derive(Debug, Clone)]
pub struct Pyramid {
    pub id: Uuid,
    pub group_id: Uuid,
    pub pyramid_index: i64,
    /// Base price used for this wave's grid calculation.
    pub entry_price: Decimal,
    pub entry_timestamp: DateTime<Utc>,
    /// Snapshot of the DCA config the ladder was computed from.
    pub dca_config: crate::config::DcaGridConfig,
    pub status: PyramidStatus,
}

impl Pyramid {
    pub fn new(
        group_id: Uuid,
        pyramid_index: i64,
        entry_price: Decimal,
        dca_config: crate::config::DcaGridConfig,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            group_id,
            pyramid_index,
            entry_price,
            entry_timestamp: Utc::now(),
            dca_config,
            status: PyramidStatus::Pending,
        }
    }
}

/// A single leg of a pyramid's ladder, or (leg_index 999) a TP-fill record.
#[derive(Debug, Clone)]
pub struct DcaOrder {
    pub id: Uuid,
    pub group_id: Uuid,
    pub pyramid_id: Uuid,
    pub leg_index: i64,

    // Plan
    pub symbol: String,
    pub side: Side,
    pub order_type: OrderType,
    pub price: Decimal,
    pub quantity: Decimal,
    pub gap_percent: Decimal,
    pub weight_percent: Decimal,
    pub tp_percent: Decimal,
    pub tp_price: Decimal,

    // Execution
    pub exchange_order_id: Option<String>,
    pub status: OrderStatus,
    pub filled_quantity: Decimal,
    pub avg_fill_price: Decimal,
    pub fee: Decimal,
    pub fee_currency: Option<String>,
    pub submitted_at: Option<DateTime<Utc>>,
    pub filled_at: Option<DateTime<Utc>>,
    pub error: Option<String>,

    // TP linkage
    pub tp_order_id: Option<String>,
    pub tp_hit: bool,
}

impl DcaOrder {
    /// True for a real entry leg (not a TP-fill record).
    pub fn is_entry(&self) -> bool {
        self.leg_index != TP_FILL_LEG_INDEX
    }

    /// A filled entry leg waiting for its TP to resolve.
    pub fn tp_unresolved(&self) -> bool {
        self.is_entry() && self.status == OrderStatus::Filled && !self.tp_hit
    }

    /// The per-leg TP target adjusted for actual fill slippage: prefers
    /// `avg_fill_price` over the planned price when available.
    pub fn adjusted_tp_price(&self) -> Decimal {
        if self.avg_fill_price > Decimal::ZERO && self.tp_percent > Decimal::ZERO {
            self.avg_fill_price * (Decimal::ONE + self.tp_percent / Decimal::from(100))
        } else {
            self.tp_price
        }
    }
}

/// A pending intent waiting for an execution-pool slot.
#[derive(Debug, Clone)]
pub struct QueuedSignal {
    pub id: Uuid,
    pub user_id: Uuid,
    pub venue: String,
    pub symbol: String,
    pub timeframe: i64,
    pub side: Side,
    pub entry_price: Decimal,
    /// Raw webhook payload snapshot; replayed at promotion.
    pub payload: serde_json::Value,
    pub queued_at: DateTime<Utc>,
    pub replacement_count: i64,
    /// Signed PnL% of the matching active group, refreshed pre-promotion.
    pub current_loss_percent: Option<Decimal>,
    pub status: SignalStatus,
    pub priority_score: Decimal,
    pub failure_reason: Option<String>,
}

impl QueuedSignal {
    pub fn dedup_key(&self) -> (Uuid, &str, i64, Side, &str) {
        (
            self.user_id,
            self.symbol.as_str(),
            self.timeframe,
            self.side,
            self.venue.as_str(),
        )
    }
}

/// Immutable audit record of an engine- or user-initiated close.
#[derive(Debug, Clone)]
pub struct RiskAction {
    pub id: Uuid,
    pub group_id: Uuid,
    pub action_type: RiskActionType,
    pub exit_price: Decimal,
    pub entry_price: Decimal,
    pub pnl_percent: Decimal,
    pub realized_pnl_usd: Decimal,
    pub quantity_closed: Decimal,
    pub duration_seconds: Option<i64>,
    pub notes: String,
    pub timestamp: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_side_roundtrip() {
        assert_eq!("buy".parse::<Side>().unwrap(), Side::Buy);
        assert_eq!("long".parse::<Side>().unwrap(), Side::Buy);
        assert_eq!(Side::Sell.opposite(), Side::Buy);
    }

    #[test]
    fn test_group_status_predicates() {
        assert!(GroupStatus::Active.is_open());
        assert!(GroupStatus::Waiting.is_open());
        assert!(!GroupStatus::Closing.is_open());
        assert!(!GroupStatus::Waiting.is_winner_eligible());
        assert!(GroupStatus::PartiallyFilled.is_winner_eligible());
    }

    #[test]
    fn test_order_status_exchange_mapping() {
        assert_eq!(
            OrderStatus::from_exchange("closed", OrderStatus::Open),
            OrderStatus::Filled
        );
        assert_eq!(
            OrderStatus::from_exchange("expired", OrderStatus::Open),
            OrderStatus::Cancelled
        );
        assert_eq!(
            OrderStatus::from_exchange("rejected", OrderStatus::Pending),
            OrderStatus::Failed
        );
        // Unknown statuses leave the local state untouched
        assert_eq!(
            OrderStatus::from_exchange("weird", OrderStatus::Open),
            OrderStatus::Open
        );
    }

    #[test]
    fn test_adjusted_tp_prefers_fill_price() {
        let mut order = sample_order();
        order.tp_percent = dec!(2);
        order.tp_price = dec!(102);
        order.avg_fill_price = dec!(99);
        assert_eq!(order.adjusted_tp_price(), dec!(100.98));

        order.avg_fill_price = Decimal::ZERO;
        assert_eq!(order.adjusted_tp_price(), dec!(102));
    }

    #[test]
    fn test_tp_fill_record_is_not_entry() {
        let mut order = sample_order();
        order.leg_index = TP_FILL_LEG_INDEX;
        assert!(!order.is_entry());
        assert!(!order.tp_unresolved());
    }

    fn sample_order() -> DcaOrder {
        DcaOrder {
            id: Uuid::new_v4(),
            group_id: Uuid::new_v4(),
            pyramid_id: Uuid::new_v4(),
            leg_index: 0,
            symbol: "BTCUSDT".to_string(),
            side: Side::Buy,
            order_type: OrderType::Limit,
            price: dec!(100),
            quantity: dec!(1),
            gap_percent: Decimal::ZERO,
            weight_percent: dec!(100),
            tp_percent: dec!(2),
            tp_price: dec!(102),
            exchange_order_id: None,
            status: OrderStatus::Filled,
            filled_quantity: dec!(1),
            avg_fill_price: dec!(100),
            fee: Decimal::ZERO,
            fee_currency: None,
            submitted_at: None,
            filled_at: None,
            error: None,
            tp_order_id: None,
            tp_hit: false,
        }
    }
}
