//! # Intraday Trader
//!
//! Signal-to-order execution loop for intraday strategies on a Kite-style
//! brokerage, with broker-snapshot reconciliation as the source of truth.
//!
//! ## Architecture
//!
//! - `config`: Configuration management and validation
//! - `broker`: Brokerage API (REST + WebSocket tick stream + paper broker)
//! - `indicators`: ATR, MACD and Supertrend over bar history
//! - `signal`: Renko, triple-Supertrend and option-leg signal engines
//! - `store`: Per-instrument state records behind per-instrument locks
//! - `engine`: Tick dispatch, reconciliation, order lifecycle, square-off

pub mod broker;
pub mod config;
pub mod engine;
pub mod indicators;
pub mod signal;
pub mod store;

pub use config::Config;
