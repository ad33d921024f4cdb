//! Signal router
//!
//! Validates inbound webhook intents, rejects non-exit sells (the engine
//! is spot-long-only), and routes: buys enqueue (latest-wins replacement on
//! the dedup composite), exits close the matching group synchronously.
//! The HTTP layer itself is an external collaborator; it hands the parsed
//! JSON document plus the path user id to [`SignalRouter::route`].

use chrono::Utc;
use rust_decimal::Decimal;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use crate::coordination::Coordination;
use crate::error::{EngineError, EngineResult};
use crate::security::constant_time_eq;
use crate::services::order_service::SlippageAction;
use crate::services::position_manager::PositionManager;
use crate::store::Database;
use crate::types::{QueuedSignal, Side, SignalStatus, User};

const WEBHOOK_LOCK_TTL: Duration = Duration::from_secs(5);

/// The inbound webhook document. Unknown fields are ignored.
#[derive(Debug, Clone, Deserialize)]
pub struct WebhookPayload {
    pub user_id: Uuid,
    pub secret: String,
    pub source: String,
    pub timestamp: String,
    pub tv: TvFields,
    pub execution_intent: ExecutionIntent,
    pub strategy_info: StrategyInfo,
    #[serde(default)]
    pub risk: RiskFields,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TvFields {
    pub exchange: String,
    pub symbol: String,
    pub timeframe: i64,
    pub action: String,
    pub entry_price: Decimal,
    pub order_size: Decimal,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ExecutionIntent {
    #[serde(rename = "type")]
    pub intent_type: String,
    pub side: String,
    #[serde(default = "default_position_size_type")]
    pub position_size_type: String,
}

fn default_position_size_type() -> String {
    "quote".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct StrategyInfo {
    pub trade_id: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RiskFields {
    pub max_slippage_percent: Option<Decimal>,
}

/// What the router did with an accepted intent. The HTTP layer maps these
/// onto 202 (queued/replaced) and 200 (exit completed).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteOutcome {
    /// Buy intent queued for promotion.
    Queued {
        signal_id: Uuid,
        /// An earlier queued signal on the same key was replaced in place.
        replaced: bool,
        /// A matching active group exists; promotion will pyramid.
        pyramid: bool,
    },
    /// Exit intent executed synchronously.
    ExitCompleted { group_id: Uuid },
}

pub struct SignalRouter {
    db: Database,
    coordination: Arc<Coordination>,
    positions: Arc<PositionManager>,
    default_max_slippage: Decimal,
}

impl SignalRouter {
    pub fn new(
        db: Database,
        coordination: Arc<Coordination>,
        positions: Arc<PositionManager>,
        default_max_slippage: Decimal,
    ) -> Self {
        Self {
            db,
            coordination,
            positions,
            default_max_slippage,
        }
    }

    /// Validate and route one intent. `path_user_id` is the user id from
    /// the webhook URL; it must match the document body.
    pub async fn route(
        &self,
        path_user_id: Uuid,
        raw: &serde_json::Value,
    ) -> EngineResult<RouteOutcome> {
        let payload = parse_payload(raw)?;

        if payload.user_id != path_user_id {
            return Err(EngineError::Validation(
                "user_id does not match webhook path".to_string(),
            ));
        }

        let user = self
            .db
            .get_user(payload.user_id)?
            .ok_or(EngineError::Auth)?;
        if !constant_time_eq(&payload.secret, &user.webhook_secret) {
            return Err(EngineError::Auth);
        }

        let venue = payload.tv.exchange.to_lowercase();
        let symbol = normalize_symbol(&payload.tv.symbol);
        let timeframe = payload.tv.timeframe;
        let action: Side = payload.tv.action.parse().map_err(EngineError::Validation)?;
        let is_exit = payload.execution_intent.intent_type == "exit";

        // Spot is long-only: a sell that is not an exit has nowhere to go.
        if action == Side::Sell && !is_exit {
            return Err(EngineError::Validation(
                "spot does not support short positions".to_string(),
            ));
        }

        if is_exit {
            self.route_exit(&user, &venue, &symbol, timeframe, &payload)
                .await
        } else {
            self.route_entry(&user, &venue, &symbol, timeframe, raw, &payload)
                .await
        }
    }

    async fn route_exit(
        &self,
        user: &User,
        venue: &str,
        symbol: &str,
        timeframe: i64,
        payload: &WebhookPayload,
    ) -> EngineResult<RouteOutcome> {
        // Positions are always long; exits close the long side.
        let group = self
            .db
            .find_group_for_signal(user.id, venue, symbol, timeframe, Side::Buy, true)?
            .ok_or_else(|| {
                EngineError::Precondition(format!("no open position for {symbol} to exit"))
            })?;

        let max_slippage = payload
            .risk
            .max_slippage_percent
            .unwrap_or(self.default_max_slippage);

        self.positions
            .handle_exit_signal(
                user,
                group.id,
                max_slippage,
                SlippageAction::Warn,
                "engine",
            )
            .await?;

        // An exit supersedes anything still queued on the same key.
        if let Some(queued) =
            self.db
                .find_queued_duplicate(user.id, venue, symbol, timeframe, Side::Buy)?
        {
            self.db
                .mark_signal(queued.id, SignalStatus::Cancelled, Some("superseded by exit"))?;
        }

        Ok(RouteOutcome::ExitCompleted { group_id: group.id })
    }

    async fn route_entry(
        &self,
        user: &User,
        venue: &str,
        symbol: &str,
        timeframe: i64,
        raw: &serde_json::Value,
        payload: &WebhookPayload,
    ) -> EngineResult<RouteOutcome> {
        let lock_resource = format!("webhook:{}:{symbol}:{timeframe}:buy", user.id);
        let lock_token = Uuid::new_v4().to_string();
        if !self
            .coordination
            .acquire_lock(&lock_resource, &lock_token, WEBHOOK_LOCK_TTL)
            .await
        {
            return Err(EngineError::Concurrency(format!(
                "webhook dedup lock contended for {symbol}"
            )));
        }

        let result = self
            .enqueue_locked(user, venue, symbol, timeframe, raw, payload)
            .await;

        self.coordination
            .release_lock(&lock_resource, &lock_token)
            .await;
        result
    }

    async fn enqueue_locked(
        &self,
        user: &User,
        venue: &str,
        symbol: &str,
        timeframe: i64,
        raw: &serde_json::Value,
        payload: &WebhookPayload,
    ) -> EngineResult<RouteOutcome> {
        let pyramid = self
            .db
            .find_group_for_signal(user.id, venue, symbol, timeframe, Side::Buy, false)?
            .is_some();

        // Latest-wins replacement on the dedup composite.
        if let Some(mut existing) =
            self.db
                .find_queued_duplicate(user.id, venue, symbol, timeframe, Side::Buy)?
        {
            existing.entry_price = payload.tv.entry_price;
            existing.payload = raw.clone();
            existing.replacement_count += 1;
            existing.queued_at = Utc::now();
            self.db.update_signal(&existing)?;
            tracing::info!(
                signal = %existing.id,
                symbol,
                replacements = existing.replacement_count,
                "queued signal replaced in place"
            );
            return Ok(RouteOutcome::Queued {
                signal_id: existing.id,
                replaced: true,
                pyramid,
            });
        }

        let signal = QueuedSignal {
            id: Uuid::new_v4(),
            user_id: user.id,
            venue: venue.to_string(),
            symbol: symbol.to_string(),
            timeframe,
            side: Side::Buy,
            entry_price: payload.tv.entry_price,
            payload: raw.clone(),
            queued_at: Utc::now(),
            replacement_count: 0,
            current_loss_percent: None,
            status: SignalStatus::Queued,
            priority_score: Decimal::ZERO,
            failure_reason: None,
        };
        self.db.insert_signal(&signal)?;
        tracing::info!(signal = %signal.id, symbol, pyramid, "signal queued");

        Ok(RouteOutcome::Queued {
            signal_id: signal.id,
            replaced: false,
            pyramid,
        })
    }
}

/// Parse and validate the webhook document. Unresolved template
/// placeholders anywhere in the document are a validation failure.
pub fn parse_payload(raw: &serde_json::Value) -> EngineResult<WebhookPayload> {
    if contains_placeholder(raw) {
        return Err(EngineError::Validation(
            "payload contains unresolved template placeholders".to_string(),
        ));
    }

    let payload: WebhookPayload = serde_json::from_value(raw.clone())
        .map_err(|e| EngineError::Validation(format!("malformed webhook payload: {e}")))?;

    if payload.tv.entry_price <= Decimal::ZERO {
        return Err(EngineError::Validation(
            "entry_price must be positive".to_string(),
        ));
    }
    if payload.tv.order_size <= Decimal::ZERO {
        return Err(EngineError::Validation(
            "order_size must be positive".to_string(),
        ));
    }
    if payload.tv.timeframe <= 0 {
        return Err(EngineError::Validation(
            "timeframe must be positive".to_string(),
        ));
    }
    if !matches!(payload.execution_intent.intent_type.as_str(), "signal" | "exit") {
        return Err(EngineError::Validation(format!(
            "unknown execution intent type '{}'",
            payload.execution_intent.intent_type
        )));
    }
    if !matches!(
        payload.execution_intent.position_size_type.as_str(),
        "quote" | "base"
    ) {
        return Err(EngineError::Validation(format!(
            "unknown position_size_type '{}'",
            payload.execution_intent.position_size_type
        )));
    }
    if payload.strategy_info.trade_id.is_empty() {
        return Err(EngineError::Validation("trade_id is required".to_string()));
    }

    Ok(payload)
}

/// Capital to allocate, in quote currency, from the payload's sizing.
pub fn capital_from_payload(payload: &WebhookPayload) -> Decimal {
    match payload.execution_intent.position_size_type.as_str() {
        "base" => payload.tv.order_size * payload.tv.entry_price,
        _ => payload.tv.order_size,
    }
}

/// Symbols arrive with or without a slash separator.
pub fn normalize_symbol(symbol: &str) -> String {
    symbol.replace('/', "").to_uppercase()
}

fn contains_placeholder(value: &serde_json::Value) -> bool {
    match value {
        serde_json::Value::String(s) => s.contains("{{"),
        serde_json::Value::Array(items) => items.iter().any(contains_placeholder),
        serde_json::Value::Object(map) => map.values().any(contains_placeholder),
        _ => false,
    }
}
