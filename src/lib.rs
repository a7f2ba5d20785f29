//! Bartrade
//!
//! A bar-driven algorithmic trading engine: strategies react to time-ordered
//! market bars by issuing orders or declaring target positions, a risk layer
//! admits them to a paper broker and exchange pair, fills flow back into a
//! per-strategy position book with live PnL, and orders and positions are
//! persisted across daily boundaries.

pub mod calendar;
pub mod config;
pub mod data;
pub mod engine;
pub mod errors;
pub mod market_data;
pub mod runner;
pub mod store;
pub mod types;

pub use config::EngineConfig;
pub use errors::{EngineError, EngineResult, StoreError};
pub use types::*;
