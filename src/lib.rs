//! # Tradebot Engine
//!
//! Execution engine for a multi-exchange trading bot: sizes positions,
//! picks instruments and direction, places orders through rate-limited and
//! retried exchange gateways, and manages exits until each trade is closed.
//!
//! ## Architecture
//!
//! - `config`: Configuration management and validation
//! - `error`: Exchange error classification and sizing errors
//! - `exchange`: Venue adapters (Binance, Gate.io, mock) and the gateway
//!   that paces and retries every call
//! - `strategy`: Sizing, selection, allocation and the cycle pipeline
//! - `risk`: Exit manager, price monitor and reconciliation sweeper
//! - `persistence`: SQLite trade store, audit log and bot-run totals
//! - `utils`: Shared decimal arithmetic

pub mod config;
pub mod error;
pub mod exchange;
pub mod persistence;
pub mod risk;
pub mod strategy;
pub mod utils;

pub use config::Config;
