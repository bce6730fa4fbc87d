//! Venue-agnostic adapter trait.
//!
//! One implementation per exchange. Implementations perform a single signed
//! request per call; pacing, retries and caching are layered on top by
//! [`ExchangeGateway`](super::ExchangeGateway).

use super::types::*;
use crate::error::ExchangeError;
use async_trait::async_trait;
use rust_decimal::Decimal;

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ExchangeAdapter: Send + Sync {
    /// Returns the venue identifier.
    fn exchange(&self) -> Exchange;

    /// Whether the venue accepts native take-profit/stop-loss pairs.
    fn supports_brackets(&self) -> bool;

    /// Free (unlocked) balance of an asset.
    async fn get_free_balance(&self, asset: &str) -> Result<Decimal, ExchangeError>;

    /// Free and borrowed amounts of an asset in the cross-margin wallet,
    /// where leveraged positions live.
    async fn get_margin_balance(&self, asset: &str) -> Result<MarginBalance, ExchangeError>;

    /// Step size, minimum quantity and minimum notional for a pair.
    async fn get_lot_size(&self, pair: &Pair) -> Result<LotSize, ExchangeError>;

    /// Last traded price.
    async fn get_price(&self, pair: &Pair) -> Result<Decimal, ExchangeError>;

    /// Closing prices of the most recent one-minute candles, oldest first.
    async fn get_recent_closes(
        &self,
        pair: &Pair,
        limit: usize,
    ) -> Result<Vec<Decimal>, ExchangeError>;

    /// Place a market order. The request's idempotency key is sent as the
    /// client order id so a replay is rejected rather than executed twice.
    async fn place_market_order(
        &self,
        request: &MarketOrderRequest,
    ) -> Result<OrderFill, ExchangeError>;

    async fn place_bracket_order(
        &self,
        request: &BracketOrderRequest,
    ) -> Result<BracketHandle, ExchangeError>;

    async fn get_order_status(
        &self,
        pair: &Pair,
        order: &OrderRef,
        account: AccountType,
    ) -> Result<OrderFill, ExchangeError>;

    async fn get_bracket_status(
        &self,
        pair: &Pair,
        bracket_id: &str,
    ) -> Result<BracketStatus, ExchangeError>;

    async fn cancel_bracket(&self, pair: &Pair, bracket_id: &str) -> Result<(), ExchangeError>;
}
