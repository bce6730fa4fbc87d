//! Exchange integrations.
//!
//! ## Binance
//! Spot REST API (HMAC-SHA256 query signing):
//! - Balances, symbol filters, prices, one-minute candles
//! - Market orders (spot or cross margin) and OCO brackets
//!
//! ## Gate.io
//! Spot REST API v4 (HMAC-SHA512 header signing). No native brackets;
//! positions are monitored client-side.
//!
//! ## Gateway
//! [`ExchangeGateway`] wraps any adapter with pacing, retries and the
//! lot-size cache.

mod binance;
mod gateio;
mod gateway;
mod lot_cache;
pub mod mock;
mod rate_limit;
mod retry;
pub mod signing;
mod traits;
mod types;

pub use binance::BinanceAdapter;
pub use gateio::GateIoAdapter;
pub use gateway::ExchangeGateway;
pub use lot_cache::LotSizeCache;
pub use mock::{MockExchange, MockOperation};
pub use rate_limit::RateLimiter;
pub use retry::{RetryContext, RetryController, RetryPolicy};
pub use traits::ExchangeAdapter;
pub use types::*;
