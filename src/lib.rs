//! DCA Trading Engine
//!
//! A multi-user, multi-exchange automated spot-trading engine: webhook
//! intents become DCA ladders, pyramids stack further entries, take-profit
//! policies close winners, and a risk engine opportunistically closes
//! partial winners to offset an eligible loser. Background loops run on
//! exactly one replica, elected through the coordination layer.

pub mod common;
pub mod config;
pub mod coordination;
pub mod error;
pub mod exchange;
pub mod grid;
pub mod security;
pub mod services;
pub mod store;
pub mod types;

pub use config::EngineConfig;
pub use error::{EngineError, EngineResult};
pub use store::Database;
pub use types::*;
