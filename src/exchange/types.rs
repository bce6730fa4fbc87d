//! Shared types for exchange adapters.

use crate::utils::round_down_to_lot;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Supported exchanges.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Exchange {
    Binance,
    #[serde(rename = "gateio")]
    GateIo,
}

impl Exchange {
    pub const ALL: [Exchange; 2] = [Exchange::Binance, Exchange::GateIo];

    pub fn as_str(&self) -> &'static str {
        match self {
            Exchange::Binance => "binance",
            Exchange::GateIo => "gateio",
        }
    }
}

impl fmt::Display for Exchange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Exchange {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "binance" => Ok(Exchange::Binance),
            "gateio" | "gate" | "gate.io" => Ok(Exchange::GateIo),
            other => Err(format!("unknown exchange: {other}")),
        }
    }
}

/// A spot instrument, e.g. `BTC/USDT`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Pair {
    pub base: String,
    pub quote: String,
}

impl Pair {
    pub fn new(base: impl Into<String>, quote: impl Into<String>) -> Self {
        Self {
            base: base.into().to_ascii_uppercase(),
            quote: quote.into().to_ascii_uppercase(),
        }
    }

    /// Binance symbol format (`BTCUSDT`).
    pub fn binance_symbol(&self) -> String {
        format!("{}{}", self.base, self.quote)
    }

    /// Gate.io currency pair format (`BTC_USDT`).
    pub fn gate_symbol(&self) -> String {
        format!("{}_{}", self.base, self.quote)
    }
}

impl fmt::Display for Pair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.base, self.quote)
    }
}

impl FromStr for Pair {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.split(['/', '_', '-']);
        match (parts.next(), parts.next(), parts.next()) {
            (Some(base), Some(quote), None) if !base.is_empty() && !quote.is_empty() => {
                Ok(Pair::new(base, quote))
            }
            _ => Err(format!("invalid pair '{s}', expected BASE/QUOTE")),
        }
    }
}

impl TryFrom<String> for Pair {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Pair> for String {
    fn from(pair: Pair) -> Self {
        pair.to_string()
    }
}

/// Position direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Long,
    Short,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Long => "long",
            Direction::Short => "short",
        }
    }

    /// +1 for long, -1 for short.
    pub fn sign(&self) -> Decimal {
        match self {
            Direction::Long => Decimal::ONE,
            Direction::Short => Decimal::NEGATIVE_ONE,
        }
    }

    pub fn entry_side(&self) -> OrderSide {
        match self {
            Direction::Long => OrderSide::Buy,
            Direction::Short => OrderSide::Sell,
        }
    }

    pub fn exit_side(&self) -> OrderSide {
        match self {
            Direction::Long => OrderSide::Sell,
            Direction::Short => OrderSide::Buy,
        }
    }

    pub fn opposite(&self) -> Direction {
        match self {
            Direction::Long => Direction::Short,
            Direction::Short => Direction::Long,
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Direction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "long" => Ok(Direction::Long),
            "short" => Ok(Direction::Short),
            other => Err(format!("unknown direction: {other}")),
        }
    }
}

/// Trading mode for a bot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TradingMode {
    Spot,
    Leverage,
}

impl FromStr for TradingMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "spot" => Ok(TradingMode::Spot),
            "leverage" | "margin" => Ok(TradingMode::Leverage),
            other => Err(format!("unknown trading mode: {other}")),
        }
    }
}

/// Order side (buy or sell).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OrderSide {
    Buy,
    Sell,
}

impl OrderSide {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderSide::Buy => "BUY",
            OrderSide::Sell => "SELL",
        }
    }
}

/// Order status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderStatus {
    New,
    PartiallyFilled,
    Filled,
    Canceled,
    Rejected,
    Expired,
}

/// Lot-size and precision metadata for a pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LotSize {
    pub step_size: Decimal,
    pub min_qty: Decimal,
    pub min_notional: Decimal,
}

impl LotSize {
    /// Largest multiple of the step size not exceeding `quantity`, never negative.
    pub fn quantize(&self, quantity: Decimal) -> Decimal {
        if quantity <= Decimal::ZERO {
            return Decimal::ZERO;
        }
        round_down_to_lot(quantity, self.step_size).normalize()
    }

    /// Whether `quantity` at `price` is below the tradable minimum.
    pub fn is_dust(&self, quantity: Decimal, price: Decimal) -> bool {
        quantity <= Decimal::ZERO || quantity < self.min_qty || quantity * price < self.min_notional
    }
}

/// Market order request.
#[derive(Debug, Clone, PartialEq)]
pub struct MarketOrderRequest {
    pub pair: Pair,
    pub side: OrderSide,
    pub quantity: Decimal,
    /// Client order id; reused verbatim on every retry.
    pub idempotency_key: String,
    /// Values above 1 route through the margin account.
    pub leverage: u32,
    /// Last known price, used by venues that size market buys in quote currency.
    pub reference_price: Decimal,
}

/// Fill information for an order.
#[derive(Debug, Clone, PartialEq)]
pub struct OrderFill {
    pub order_id: String,
    pub client_order_id: String,
    pub status: OrderStatus,
    pub avg_price: Decimal,
    pub executed_qty: Decimal,
}

/// Order lookup key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OrderRef {
    Exchange(String),
    Client(String),
}

/// Wallet an order was placed from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccountType {
    Spot,
    /// Cross margin
    Margin,
}

impl AccountType {
    pub fn for_leverage(leverage: u32) -> Self {
        if leverage > 1 {
            AccountType::Margin
        } else {
            AccountType::Spot
        }
    }
}

/// One asset in the cross-margin wallet.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MarginBalance {
    pub free: Decimal,
    /// Outstanding loan, excluding interest
    pub borrowed: Decimal,
}

/// Take-profit / stop-loss order pair.
#[derive(Debug, Clone, PartialEq)]
pub struct BracketOrderRequest {
    pub pair: Pair,
    /// Exit side of the position being protected.
    pub side: OrderSide,
    pub quantity: Decimal,
    pub take_profit_price: Decimal,
    pub stop_price: Decimal,
    pub stop_limit_price: Decimal,
    pub idempotency_key: String,
}

/// Handle returned after placing a bracket.
#[derive(Debug, Clone, PartialEq)]
pub struct BracketHandle {
    pub bracket_id: String,
    pub leg_ids: Vec<String>,
}

/// Which side of a bracket filled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BracketLeg {
    TakeProfit,
    StopLoss,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BracketState {
    Active,
    Filled,
    Cancelled,
    Expired,
}

/// Current state of a bracket order.
#[derive(Debug, Clone, PartialEq)]
pub struct BracketStatus {
    pub state: BracketState,
    pub filled_leg: Option<BracketLeg>,
    pub fill_price: Option<Decimal>,
}

impl BracketStatus {
    pub fn active() -> Self {
        Self {
            state: BracketState::Active,
            filled_leg: None,
            fill_price: None,
        }
    }

    /// Cancelled or expired without either leg filling.
    pub fn is_terminal_without_fill(&self) -> bool {
        matches!(self.state, BracketState::Cancelled | BracketState::Expired)
            && self.filled_leg.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_pair_parsing_formats() {
        let pair: Pair = "btc/usdt".parse().unwrap();
        assert_eq!(pair, Pair::new("BTC", "USDT"));
        assert_eq!("ETH_USDT".parse::<Pair>().unwrap().binance_symbol(), "ETHUSDT");
        assert_eq!("SOL-USDT".parse::<Pair>().unwrap().gate_symbol(), "SOL_USDT");
        assert!("BTCUSDT".parse::<Pair>().is_err());
    }

    #[test]
    fn test_quantize_floors_to_step() {
        let lot = LotSize {
            step_size: dec!(0.001),
            min_qty: dec!(0.001),
            min_notional: dec!(10),
        };
        assert_eq!(lot.quantize(dec!(0.12345)), dec!(0.123));
        assert_eq!(lot.quantize(dec!(0.0009)), Decimal::ZERO);
        assert_eq!(lot.quantize(dec!(-1)), Decimal::ZERO);
    }

    #[test]
    fn test_dust_detection() {
        let lot = LotSize {
            step_size: dec!(0.01),
            min_qty: dec!(0.1),
            min_notional: dec!(5),
        };
        assert!(lot.is_dust(dec!(0.05), dec!(1000)));
        assert!(lot.is_dust(dec!(0.2), dec!(10)));
        assert!(!lot.is_dust(dec!(0.2), dec!(100)));
    }

    #[test]
    fn test_direction_sides() {
        assert_eq!(Direction::Long.entry_side(), OrderSide::Buy);
        assert_eq!(Direction::Short.exit_side(), OrderSide::Buy);
        assert_eq!(Direction::Short.sign(), Decimal::NEGATIVE_ONE);
    }
}
