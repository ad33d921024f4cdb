//! Engine services: the signal → queue → execution pipeline, the two
//! reconciling loops, and the cluster coordination pieces that gate them.

pub mod fill_monitor;
pub mod leader;
pub mod order_service;
pub mod pool;
pub mod position_manager;
pub mod queue_manager;
pub mod risk;
pub mod signal_router;
pub mod take_profit;
pub mod watchdog;

pub use fill_monitor::FillMonitor;
pub use leader::LeaderElection;
pub use order_service::{OrderService, SlippageAction};
pub use pool::ExecutionPool;
pub use position_manager::PositionManager;
pub use queue_manager::QueueManager;
pub use risk::RiskEngine;
pub use signal_router::{RouteOutcome, SignalRouter, WebhookPayload};
pub use watchdog::Watchdog;
