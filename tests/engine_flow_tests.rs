//! End-to-end pipeline tests against the in-process mock venue:
//! webhook intent -> queue -> promotion -> fills -> take-profit -> close.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use rust_decimal_macros::dec;
use uuid::Uuid;

use dca_engine::common::CircuitBreakerConfig;
use dca_engine::config::{DcaGridConfig, RiskEngineConfig};
use dca_engine::coordination::Coordination;
use dca_engine::exchange::{ExchangeGateway, GatewayConfig};
use dca_engine::security::PlainCipher;
use dca_engine::services::{
    ExecutionPool, FillMonitor, PositionManager, QueueManager, RouteOutcome, SignalRouter,
};
use dca_engine::types::{GroupStatus, RiskActionType, SignalStatus, User};
use dca_engine::Database;

struct Harness {
    db: Database,
    gateway: Arc<ExchangeGateway>,
    router: SignalRouter,
    queue: QueueManager,
    monitor: FillMonitor,
    user: User,
}

fn harness() -> Harness {
    let db = Database::open_in_memory().unwrap();

    let mut dca_configs = HashMap::new();
    dca_configs.insert("default".to_string(), DcaGridConfig::single_leg(dec!(2)));
    let user = User {
        id: Uuid::new_v4(),
        webhook_secret: "hunter2".to_string(),
        credentials: HashMap::new(),
        risk_config: RiskEngineConfig::default(),
        dca_configs,
        default_venue: "mock".to_string(),
        created_at: Utc::now(),
    };
    db.upsert_user(&user).unwrap();

    let gateway = Arc::new(ExchangeGateway::new(
        GatewayConfig {
            venues: HashMap::new(),
            breaker: CircuitBreakerConfig::default(),
        },
        Arc::new(PlainCipher),
    ));
    let coordination = Arc::new(Coordination::in_process());
    let positions = Arc::new(PositionManager::new(
        db.clone(),
        Arc::clone(&coordination),
        Arc::clone(&gateway),
        dec!(0.1),
    ));
    let pool = Arc::new(ExecutionPool::new(
        dca_engine::config::PoolConfig::default(),
        db.clone(),
    ));

    let router = SignalRouter::new(
        db.clone(),
        Arc::clone(&coordination),
        Arc::clone(&positions),
        dec!(1),
    );
    let queue = QueueManager::new(
        db.clone(),
        pool,
        Arc::clone(&positions),
        Arc::clone(&gateway),
        Arc::clone(&coordination),
    );
    let monitor = FillMonitor::new(
        db.clone(),
        Arc::clone(&gateway),
        positions,
        coordination,
    );

    Harness {
        db,
        gateway,
        router,
        queue,
        monitor,
        user,
    }
}

fn buy_payload(user: &User, symbol: &str, order_size: &str) -> serde_json::Value {
    serde_json::json!({
        "user_id": user.id,
        "secret": user.webhook_secret,
        "source": "tradingview",
        "timestamp": "2025-06-01T12:00:00Z",
        "tv": {
            "exchange": "mock",
            "symbol": symbol,
            "timeframe": 60,
            "action": "buy",
            "entry_price": "100",
            "order_size": order_size
        },
        "execution_intent": { "type": "signal", "side": "buy" },
        "strategy_info": { "trade_id": "t-1" }
    })
}

#[tokio::test]
async fn test_simple_long_with_tp_hit() {
    let harness = harness();
    harness.gateway.mock_venue().set_price("SOLUSDT", dec!(100));

    // Webhook buy, 200 USDT, single-leg 2% TP
    let outcome = harness
        .router
        .route(harness.user.id, &buy_payload(&harness.user, "SOL/USDT", "200"))
        .await
        .unwrap();
    assert!(matches!(outcome, RouteOutcome::Queued { .. }));

    // Promotion fills the market entry at 100.00 for 2 SOL
    let promoted = harness.queue.run_cycle().await.unwrap();
    assert_eq!(promoted, 1);

    let groups = harness.db.open_groups_for_user(harness.user.id).unwrap();
    assert_eq!(groups.len(), 1);
    let group_id = groups[0].id;

    // First monitor cycle settles accounting and rests the TP at 102
    harness.monitor.run_cycle().await.unwrap();
    let group = harness.db.get_group(group_id).unwrap().unwrap();
    assert_eq!(group.status, GroupStatus::Active);
    assert_eq!(group.total_filled_quantity, dec!(2.000));
    assert_eq!(group.weighted_avg_entry, dec!(100));
    assert_eq!(harness.gateway.mock_venue().open_order_count(), 1);

    // Price runs to 103: the TP fills, and one cycle later the group is
    // closed with ~4 USD realized minus fees
    harness.gateway.mock_venue().set_price("SOLUSDT", dec!(103));
    harness.monitor.run_cycle().await.unwrap();

    let closed = harness.db.get_group(group_id).unwrap().unwrap();
    assert_eq!(closed.status, GroupStatus::Closed);
    assert!(closed.realized_pnl_usd > dec!(3.3));
    assert!(closed.realized_pnl_usd < dec!(4));

    let actions = harness.db.actions_for_group(group_id).unwrap();
    assert_eq!(actions.len(), 1);
    assert_eq!(actions[0].action_type, RiskActionType::TpHit);
}

#[tokio::test]
async fn test_pyramid_continuation_on_second_signal() {
    let harness = harness();
    harness.gateway.mock_venue().set_price("SOLUSDT", dec!(100));

    harness
        .router
        .route(harness.user.id, &buy_payload(&harness.user, "SOL/USDT", "200"))
        .await
        .unwrap();
    harness.queue.run_cycle().await.unwrap();
    harness.monitor.run_cycle().await.unwrap();

    let group_id = harness.db.open_groups_for_user(harness.user.id).unwrap()[0].id;

    // Market dipped; a second buy arrives on the same key
    harness.gateway.mock_venue().set_price("SOLUSDT", dec!(97));
    let outcome = harness
        .router
        .route(harness.user.id, &buy_payload(&harness.user, "SOL/USDT", "200"))
        .await
        .unwrap();
    assert!(matches!(outcome, RouteOutcome::Queued { pyramid: true, .. }));

    harness.queue.run_cycle().await.unwrap();

    let group = harness.db.get_group(group_id).unwrap().unwrap();
    assert_eq!(group.pyramid_count, 2);
    assert_eq!(group.total_dca_legs, 2);

    let pyramids = harness.db.pyramids_for_group(group_id).unwrap();
    assert_eq!(pyramids.len(), 2);
    assert_eq!(pyramids[1].pyramid_index, 1);
    // The continuation's ladder is computed at the then-current price
    assert_eq!(pyramids[1].entry_price, dec!(97));

    // Only one group exists; no duplicate was created
    assert_eq!(harness.db.open_groups_for_user(harness.user.id).unwrap().len(), 1);
}

#[tokio::test]
async fn test_short_signal_rejected_without_db_writes() {
    let harness = harness();
    harness.gateway.mock_venue().set_price("BTCUSDT", dec!(50000));

    let mut payload = buy_payload(&harness.user, "BTC/USDT", "200");
    payload["tv"]["action"] = serde_json::json!("sell");
    payload["execution_intent"]["side"] = serde_json::json!("sell");

    let err = harness
        .router
        .route(harness.user.id, &payload)
        .await
        .unwrap_err();
    assert!(err.to_string().contains("spot does not support short"));

    assert!(harness.db.queued_signals().unwrap().is_empty());
    assert!(harness
        .db
        .open_groups_for_user(harness.user.id)
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn test_replacement_then_promotion_carries_latest_price() {
    let harness = harness();
    harness.gateway.mock_venue().set_price("SOLUSDT", dec!(100));

    harness
        .router
        .route(harness.user.id, &buy_payload(&harness.user, "SOL/USDT", "200"))
        .await
        .unwrap();

    // Same key arrives again before promotion: latest wins
    let mut replacement = buy_payload(&harness.user, "SOL/USDT", "300");
    replacement["tv"]["entry_price"] = serde_json::json!("99");
    harness
        .router
        .route(harness.user.id, &replacement)
        .await
        .unwrap();

    let queued = harness.db.queued_signals().unwrap();
    assert_eq!(queued.len(), 1);
    assert_eq!(queued[0].replacement_count, 1);
    assert_eq!(queued[0].entry_price, dec!(99));

    harness.queue.run_cycle().await.unwrap();
    let signals = harness.db.queued_signals().unwrap();
    assert!(signals.is_empty());

    let groups = harness.db.open_groups_for_user(harness.user.id).unwrap();
    // Promotion used the replacement's sizing (300 quote at 99)
    assert_eq!(groups[0].allocated_capital_usd, dec!(300));
    assert_eq!(groups[0].base_entry_price, dec!(99));
}

#[tokio::test]
async fn test_monitor_replay_produces_no_writes() {
    let harness = harness();
    harness.gateway.mock_venue().set_price("SOLUSDT", dec!(100));

    harness
        .router
        .route(harness.user.id, &buy_payload(&harness.user, "SOL/USDT", "200"))
        .await
        .unwrap();
    harness.queue.run_cycle().await.unwrap();

    // Settle everything, then replay against unchanged venue state
    harness.monitor.run_cycle().await.unwrap();
    let replay = harness.monitor.run_cycle().await.unwrap();
    assert_eq!(replay.orders_updated, 0);
    assert_eq!(replay.fills_observed, 0);
    assert_eq!(replay.tps_placed, 0);
    assert_eq!(replay.tp_hits, 0);
    assert_eq!(replay.groups_closed, 0);
}

#[tokio::test]
async fn test_tp_dedup_survives_simulated_rollback() {
    let harness = harness();
    harness.gateway.mock_venue().set_price("SOLUSDT", dec!(100));

    harness
        .router
        .route(harness.user.id, &buy_payload(&harness.user, "SOL/USDT", "200"))
        .await
        .unwrap();
    harness.queue.run_cycle().await.unwrap();
    harness.monitor.run_cycle().await.unwrap();

    let group_id = harness.db.open_groups_for_user(harness.user.id).unwrap()[0].id;
    let orders = harness.db.orders_for_group(group_id).unwrap();
    let mut leg = orders.into_iter().find(|o| o.is_entry()).unwrap();
    assert!(leg.tp_order_id.is_some());
    assert_eq!(harness.gateway.mock_venue().open_order_count(), 1);

    // Simulate the rollback failure mode: the DB lost the TP link while
    // the venue order remains
    leg.tp_order_id = None;
    harness.db.update_order(&leg).unwrap();

    // The next sweep adopts the existing order instead of duplicating
    harness.monitor.run_cycle().await.unwrap();
    let orders = harness.db.orders_for_group(group_id).unwrap();
    let leg = orders.into_iter().find(|o| o.is_entry()).unwrap();
    assert!(leg.tp_order_id.is_some());
    assert_eq!(harness.gateway.mock_venue().open_order_count(), 1);
}

#[tokio::test]
async fn test_exit_webhook_closes_synchronously_and_cancels_queue() {
    let harness = harness();
    harness.gateway.mock_venue().set_price("SOLUSDT", dec!(100));

    harness
        .router
        .route(harness.user.id, &buy_payload(&harness.user, "SOL/USDT", "200"))
        .await
        .unwrap();
    harness.queue.run_cycle().await.unwrap();
    harness.monitor.run_cycle().await.unwrap();
    let group_id = harness.db.open_groups_for_user(harness.user.id).unwrap()[0].id;

    // A further buy is waiting in the queue when the exit lands
    harness
        .router
        .route(harness.user.id, &buy_payload(&harness.user, "SOL/USDT", "200"))
        .await
        .unwrap();

    let mut exit = buy_payload(&harness.user, "SOL/USDT", "200");
    exit["tv"]["action"] = serde_json::json!("sell");
    exit["execution_intent"] = serde_json::json!({ "type": "exit", "side": "sell" });
    exit["risk"] = serde_json::json!({ "max_slippage_percent": "1.0" });

    let outcome = harness.router.route(harness.user.id, &exit).await.unwrap();
    assert_eq!(outcome, RouteOutcome::ExitCompleted { group_id });

    let closed = harness.db.get_group(group_id).unwrap().unwrap();
    assert_eq!(closed.status, GroupStatus::Closed);

    // The queued pyramid signal was superseded
    assert!(harness.db.queued_signals().unwrap().is_empty());
    let all = harness.db.queued_signals_for_user(harness.user.id).unwrap();
    assert!(all.iter().all(|s| s.status != SignalStatus::Queued));
}

#[tokio::test]
async fn test_per_symbol_cap_blocks_second_group_but_not_pyramid() {
    let harness = harness();
    harness.gateway.mock_venue().set_price("SOLUSDT", dec!(100));
    harness.gateway.mock_venue().set_price("BTCUSDT", dec!(50000));

    // First SOL group
    harness
        .router
        .route(harness.user.id, &buy_payload(&harness.user, "SOL/USDT", "200"))
        .await
        .unwrap();
    harness.queue.run_cycle().await.unwrap();

    // A BTC group is fine (different symbol)
    harness
        .router
        .route(harness.user.id, &buy_payload(&harness.user, "BTC/USDT", "200"))
        .await
        .unwrap();
    harness.queue.run_cycle().await.unwrap();
    assert_eq!(harness.db.open_groups_for_user(harness.user.id).unwrap().len(), 2);

    // Another SOL signal is a pyramid continuation, not a new group
    harness
        .router
        .route(harness.user.id, &buy_payload(&harness.user, "SOL/USDT", "200"))
        .await
        .unwrap();
    harness.queue.run_cycle().await.unwrap();

    let groups = harness.db.open_groups_for_user(harness.user.id).unwrap();
    assert_eq!(groups.len(), 2);
    let sol = groups.iter().find(|g| g.symbol == "SOLUSDT").unwrap();
    assert_eq!(sol.pyramid_count, 2);
}

#[tokio::test]
async fn test_paused_promotion_retains_queue() {
    let harness = harness();
    harness.gateway.mock_venue().set_price("SOLUSDT", dec!(100));

    let mut user = harness.user.clone();
    user.risk_config.promotion_paused = true;
    harness.db.upsert_user(&user).unwrap();

    harness
        .router
        .route(user.id, &buy_payload(&user, "SOL/USDT", "200"))
        .await
        .unwrap();

    let promoted = harness.queue.run_cycle().await.unwrap();
    assert_eq!(promoted, 0);
    // Signal stays queued rather than failing
    assert_eq!(harness.db.queued_signals().unwrap().len(), 1);
}

#[tokio::test]
async fn test_grid_validation_failure_marks_signal_failed() {
    let harness = harness();
    harness.gateway.mock_venue().set_price("SOLUSDT", dec!(100));

    // Order size far below the venue's min notional
    harness
        .router
        .route(harness.user.id, &buy_payload(&harness.user, "SOL/USDT", "5"))
        .await
        .unwrap();
    harness.queue.run_cycle().await.unwrap();

    assert!(harness.db.queued_signals().unwrap().is_empty());
    assert!(harness
        .db
        .open_groups_for_user(harness.user.id)
        .unwrap()
        .iter()
        .all(|g| g.status != GroupStatus::Live));

    // Promotion failure left the pool slot free for the next signal
    harness
        .router
        .route(harness.user.id, &buy_payload(&harness.user, "SOL/USDT", "200"))
        .await
        .unwrap();
    let promoted = harness.queue.run_cycle().await.unwrap();
    assert_eq!(promoted, 1);
}

#[tokio::test]
async fn test_aggregate_close_consumes_quantity() {
    let harness = harness();
    harness.gateway.mock_venue().set_price("ETHUSDT", dec!(2000));

    // Aggregate mode with a 1% target
    let mut config = DcaGridConfig::single_leg(dec!(50));
    config.tp_mode = dca_engine::types::TpMode::Aggregate;
    config.tp_aggregate_percent = dec!(1);
    let mut user = harness.user.clone();
    user.dca_configs.insert("default".to_string(), config);
    harness.db.upsert_user(&user).unwrap();

    harness
        .router
        .route(user.id, &{
            let mut payload = buy_payload(&user, "ETH/USDT", "200");
            payload["tv"]["entry_price"] = serde_json::json!("2000");
            payload
        })
        .await
        .unwrap();
    harness.queue.run_cycle().await.unwrap();
    harness.monitor.run_cycle().await.unwrap();

    // No resting leg TP in aggregate mode
    assert_eq!(harness.gateway.mock_venue().open_order_count(), 0);

    harness.gateway.mock_venue().set_price("ETHUSDT", dec!(2025));
    harness.monitor.run_cycle().await.unwrap();

    let group = &harness
        .db
        .list_users()
        .unwrap()
        .iter()
        .flat_map(|u| harness.db.open_groups_for_user(u.id).unwrap())
        .collect::<Vec<_>>();
    // Everything closed: the group left the open set
    assert!(group.is_empty());
}
