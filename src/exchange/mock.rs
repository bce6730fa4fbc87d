//! In-memory exchange for paper trading and tests.
//!
//! Simulates balances, prices, candles and lot sizes for one venue, charges
//! taker fees on fills, rejects reused client order ids, and can be scripted
//! to fail specific operations. Leveraged orders settle in a separate
//! cross-margin wallet that borrows on shortfall and repays from proceeds.

use super::traits::ExchangeAdapter;
use super::types::*;
use crate::error::{ErrorKind, ExchangeError};
use async_trait::async_trait;
use rust_decimal::Decimal;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info};

/// Adapter operations that can be scripted to fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MockOperation {
    Balance,
    MarginBalance,
    LotSize,
    Price,
    Closes,
    MarketOrder,
    BracketOrder,
    OrderStatus,
    BracketStatus,
    CancelBracket,
}

#[derive(Debug, Clone)]
struct MockBracket {
    pair: Pair,
    side: OrderSide,
    quantity: Decimal,
    take_profit_price: Decimal,
    stop_limit_price: Decimal,
    status: BracketStatus,
}

/// Simulated account and market state.
#[derive(Debug, Default)]
pub struct MockExchangeState {
    /// Spot wallet
    balances: HashMap<String, Decimal>,
    /// Cross-margin wallet
    margin: HashMap<String, MarginBalance>,
    /// Balances reserved by open brackets
    locked: HashMap<String, Decimal>,
    prices: HashMap<Pair, Decimal>,
    closes: HashMap<Pair, Vec<Decimal>>,
    lot_sizes: HashMap<Pair, LotSize>,
    /// Filled orders keyed by client order id
    orders: HashMap<String, OrderFill>,
    brackets: HashMap<String, MockBracket>,
    failures: HashMap<MockOperation, VecDeque<ExchangeError>>,
    calls: HashMap<MockOperation, u32>,
    pub total_fees: Decimal,
}

pub struct MockExchange {
    exchange: Exchange,
    state: Arc<RwLock<MockExchangeState>>,
    order_id_counter: AtomicU64,
    fee_rate: Decimal,
    brackets_enabled: bool,
}

impl MockExchange {
    /// Create a mock venue holding `quote_balance` of `quote_asset`.
    pub fn new(exchange: Exchange, quote_asset: &str, quote_balance: Decimal) -> Self {
        let mut state = MockExchangeState::default();
        state
            .balances
            .insert(quote_asset.to_uppercase(), quote_balance);

        Self {
            exchange,
            state: Arc::new(RwLock::new(state)),
            order_id_counter: AtomicU64::new(1),
            fee_rate: Decimal::new(1, 3),
            brackets_enabled: false,
        }
    }

    pub fn with_fee_rate(mut self, fee_rate: Decimal) -> Self {
        self.fee_rate = fee_rate;
        self
    }

    pub fn with_brackets(mut self, enabled: bool) -> Self {
        self.brackets_enabled = enabled;
        self
    }

    pub fn fee_rate(&self) -> Decimal {
        self.fee_rate
    }

    pub async fn set_balance(&self, asset: &str, amount: Decimal) {
        self.state
            .write()
            .await
            .balances
            .insert(asset.to_uppercase(), amount);
    }

    pub async fn balance(&self, asset: &str) -> Decimal {
        self.state
            .read()
            .await
            .balances
            .get(&asset.to_uppercase())
            .copied()
            .unwrap_or_default()
    }

    pub async fn set_margin_balance(&self, asset: &str, balance: MarginBalance) {
        self.state
            .write()
            .await
            .margin
            .insert(asset.to_uppercase(), balance);
    }

    pub async fn margin_balance(&self, asset: &str) -> MarginBalance {
        self.state
            .read()
            .await
            .margin
            .get(&asset.to_uppercase())
            .copied()
            .unwrap_or_default()
    }

    pub async fn set_price(&self, pair: &Pair, price: Decimal) {
        self.state.write().await.prices.insert(pair.clone(), price);
    }

    pub async fn set_closes(&self, pair: &Pair, closes: Vec<Decimal>) {
        self.state.write().await.closes.insert(pair.clone(), closes);
    }

    pub async fn set_lot_size(&self, pair: &Pair, lot: LotSize) {
        self.state.write().await.lot_sizes.insert(pair.clone(), lot);
    }

    /// Fail the next call of `op` with `err`. Queued errors are consumed in order.
    pub async fn fail_next(&self, op: MockOperation, err: ExchangeError) {
        self.state
            .write()
            .await
            .failures
            .entry(op)
            .or_default()
            .push_back(err);
    }

    pub async fn call_count(&self, op: MockOperation) -> u32 {
        self.state
            .read()
            .await
            .calls
            .get(&op)
            .copied()
            .unwrap_or(0)
    }

    /// Number of orders that actually executed.
    pub async fn order_count(&self) -> usize {
        self.state.read().await.orders.len()
    }

    pub async fn total_fees(&self) -> Decimal {
        self.state.read().await.total_fees
    }

    /// Simulate one bracket leg filling at its limit price.
    pub async fn fill_bracket(&self, bracket_id: &str, leg: BracketLeg) -> Result<(), ExchangeError> {
        let mut state = self.state.write().await;
        let bracket = state
            .brackets
            .get(bracket_id)
            .cloned()
            .ok_or_else(|| self.rejected(format!("unknown bracket {bracket_id}")))?;
        if bracket.status.state != BracketState::Active {
            return Err(self.rejected(format!("bracket {bracket_id} is not active")));
        }

        let price = match leg {
            BracketLeg::TakeProfit => bracket.take_profit_price,
            BracketLeg::StopLoss => bracket.stop_limit_price,
        };
        Self::unlock(&mut state, &bracket);
        self.settle(&mut state, &bracket.pair, bracket.side, bracket.quantity, price);

        if let Some(entry) = state.brackets.get_mut(bracket_id) {
            entry.status = BracketStatus {
                state: BracketState::Filled,
                filled_leg: Some(leg),
                fill_price: Some(price),
            };
        }
        info!("[MOCK] Bracket {} {:?} leg filled @ {}", bracket_id, leg, price);
        Ok(())
    }

    /// Simulate the venue expiring a bracket without a fill.
    pub async fn expire_bracket(&self, bracket_id: &str) {
        let mut state = self.state.write().await;
        if let Some(bracket) = state.brackets.get(bracket_id).cloned() {
            if bracket.status.state == BracketState::Active {
                Self::unlock(&mut state, &bracket);
            }
            if let Some(entry) = state.brackets.get_mut(bracket_id) {
                entry.status.state = BracketState::Expired;
            }
        }
    }

    fn rejected(&self, message: impl Into<String>) -> ExchangeError {
        ExchangeError::new(self.exchange, ErrorKind::OrderRejected, message)
    }

    /// Count the call and pop a scripted failure, if any.
    async fn enter(&self, op: MockOperation) -> Result<(), ExchangeError> {
        let mut state = self.state.write().await;
        *state.calls.entry(op).or_insert(0) += 1;
        match state.failures.get_mut(&op).and_then(|q| q.pop_front()) {
            Some(err) => {
                debug!("[MOCK] Scripted failure for {:?}: {}", op, err);
                Err(err)
            }
            None => Ok(()),
        }
    }

    fn unlock(state: &mut MockExchangeState, bracket: &MockBracket) {
        if bracket.side == OrderSide::Sell {
            let base = bracket.pair.base.clone();
            *state.locked.entry(base.clone()).or_default() -= bracket.quantity;
            *state.balances.entry(base).or_default() += bracket.quantity;
        }
    }

    /// Apply a fill to balances and charge the taker fee in quote currency.
    fn settle(
        &self,
        state: &mut MockExchangeState,
        pair: &Pair,
        side: OrderSide,
        quantity: Decimal,
        price: Decimal,
    ) {
        let value = quantity * price;
        let fee = value * self.fee_rate;
        match side {
            OrderSide::Buy => {
                *state.balances.entry(pair.base.clone()).or_default() += quantity;
                *state.balances.entry(pair.quote.clone()).or_default() -= value + fee;
            }
            OrderSide::Sell => {
                *state.balances.entry(pair.base.clone()).or_default() -= quantity;
                *state.balances.entry(pair.quote.clone()).or_default() += value - fee;
            }
        }
        state.total_fees += fee;
    }

    /// Apply a leveraged fill to the margin wallet. Shortfalls are borrowed,
    /// incoming funds repay outstanding loans first.
    fn settle_margin(
        &self,
        state: &mut MockExchangeState,
        pair: &Pair,
        side: OrderSide,
        quantity: Decimal,
        price: Decimal,
    ) {
        let value = quantity * price;
        let fee = value * self.fee_rate;
        let (outgoing, out_amount, incoming, in_amount) = match side {
            OrderSide::Buy => (&pair.quote, value + fee, &pair.base, quantity),
            OrderSide::Sell => (&pair.base, quantity, &pair.quote, value - fee),
        };

        let out = state.margin.entry(outgoing.clone()).or_default();
        if out.free >= out_amount {
            out.free -= out_amount;
        } else {
            out.borrowed += out_amount - out.free;
            out.free = Decimal::ZERO;
        }

        let inc = state.margin.entry(incoming.clone()).or_default();
        let repay = inc.borrowed.min(in_amount);
        inc.borrowed -= repay;
        inc.free += in_amount - repay;

        state.total_fees += fee;
    }

    /// Move quote collateral from spot into margin so the wallet holds at
    /// least `required`.
    fn fund_margin(
        &self,
        state: &mut MockExchangeState,
        quote: &str,
        required: Decimal,
    ) -> Result<(), ExchangeError> {
        let held = state.margin.get(quote).map(|b| b.free).unwrap_or_default();
        if held >= required {
            return Ok(());
        }
        let spot = state.balances.get(quote).copied().unwrap_or_default();
        let transfer = (required - held).min(spot.max(Decimal::ZERO));
        *state.balances.entry(quote.to_string()).or_default() -= transfer;
        state.margin.entry(quote.to_string()).or_default().free += transfer;
        if held + transfer < required {
            return Err(ExchangeError::new(
                self.exchange,
                ErrorKind::InsufficientBalance,
                format!("insufficient margin collateral: {} < {required}", held + transfer),
            ));
        }
        Ok(())
    }
}

#[async_trait]
impl ExchangeAdapter for MockExchange {
    fn exchange(&self) -> Exchange {
        self.exchange
    }

    fn supports_brackets(&self) -> bool {
        self.brackets_enabled
    }

    async fn get_free_balance(&self, asset: &str) -> Result<Decimal, ExchangeError> {
        self.enter(MockOperation::Balance).await?;
        Ok(self.balance(asset).await.max(Decimal::ZERO))
    }

    async fn get_margin_balance(&self, asset: &str) -> Result<MarginBalance, ExchangeError> {
        self.enter(MockOperation::MarginBalance).await?;
        Ok(self.margin_balance(asset).await)
    }

    async fn get_lot_size(&self, pair: &Pair) -> Result<LotSize, ExchangeError> {
        self.enter(MockOperation::LotSize).await?;
        self.state
            .read()
            .await
            .lot_sizes
            .get(pair)
            .copied()
            .ok_or_else(|| self.rejected(format!("unknown symbol {pair}")))
    }

    async fn get_price(&self, pair: &Pair) -> Result<Decimal, ExchangeError> {
        self.enter(MockOperation::Price).await?;
        self.state
            .read()
            .await
            .prices
            .get(pair)
            .copied()
            .ok_or_else(|| self.rejected(format!("no price for {pair}")))
    }

    async fn get_recent_closes(
        &self,
        pair: &Pair,
        limit: usize,
    ) -> Result<Vec<Decimal>, ExchangeError> {
        self.enter(MockOperation::Closes).await?;
        let state = self.state.read().await;
        let closes = state.closes.get(pair).cloned().unwrap_or_default();
        let skip = closes.len().saturating_sub(limit);
        Ok(closes.into_iter().skip(skip).collect())
    }

    async fn place_market_order(
        &self,
        request: &MarketOrderRequest,
    ) -> Result<OrderFill, ExchangeError> {
        self.enter(MockOperation::MarketOrder).await?;
        let mut state = self.state.write().await;

        if state.orders.contains_key(&request.idempotency_key) {
            return Err(ExchangeError::duplicate(
                self.exchange,
                format!("duplicate client order id {}", request.idempotency_key),
            ));
        }
        if request.quantity <= Decimal::ZERO {
            return Err(self.rejected("quantity must be positive"));
        }
        let price = state
            .prices
            .get(&request.pair)
            .copied()
            .ok_or_else(|| self.rejected(format!("no price for {}", request.pair)))?;

        let value = request.quantity * price;
        match AccountType::for_leverage(request.leverage) {
            AccountType::Margin => {
                // Only orders that take on a new loan need collateral.
                let (asset, needed) = match request.side {
                    OrderSide::Buy => (&request.pair.quote, value * (Decimal::ONE + self.fee_rate)),
                    OrderSide::Sell => (&request.pair.base, request.quantity),
                };
                let held = state.margin.get(asset).map(|b| b.free).unwrap_or_default();
                if held < needed {
                    let collateral = value / Decimal::from(request.leverage);
                    self.fund_margin(&mut state, &request.pair.quote, collateral)?;
                }
                self.settle_margin(&mut state, &request.pair, request.side, request.quantity, price);
            }
            AccountType::Spot => {
                let (asset, free, required) = match request.side {
                    OrderSide::Buy => (
                        &request.pair.quote,
                        state.balances.get(&request.pair.quote).copied().unwrap_or_default(),
                        value * (Decimal::ONE + self.fee_rate),
                    ),
                    OrderSide::Sell => (
                        &request.pair.base,
                        state.balances.get(&request.pair.base).copied().unwrap_or_default(),
                        request.quantity,
                    ),
                };
                if free < required {
                    return Err(ExchangeError::new(
                        self.exchange,
                        ErrorKind::InsufficientBalance,
                        format!("insufficient {asset} balance: {free} < {required}"),
                    ));
                }
                self.settle(&mut state, &request.pair, request.side, request.quantity, price);
            }
        }

        let order_id = self.order_id_counter.fetch_add(1, Ordering::SeqCst);
        let fill = OrderFill {
            order_id: order_id.to_string(),
            client_order_id: request.idempotency_key.clone(),
            status: OrderStatus::Filled,
            avg_price: price,
            executed_qty: request.quantity,
        };
        state
            .orders
            .insert(request.idempotency_key.clone(), fill.clone());

        info!(
            "[MOCK] {} {:?} {} {} @ {}",
            self.exchange, request.side, request.quantity, request.pair, price
        );
        Ok(fill)
    }

    async fn place_bracket_order(
        &self,
        request: &BracketOrderRequest,
    ) -> Result<BracketHandle, ExchangeError> {
        self.enter(MockOperation::BracketOrder).await?;
        if !self.brackets_enabled {
            return Err(self.rejected("bracket orders are not supported"));
        }

        let mut state = self.state.write().await;
        if request.side == OrderSide::Sell {
            let base = request.pair.base.clone();
            let free = state.balances.get(&base).copied().unwrap_or_default();
            if free < request.quantity {
                return Err(ExchangeError::new(
                    self.exchange,
                    ErrorKind::InsufficientBalance,
                    format!("insufficient {base} to lock: {free} < {}", request.quantity),
                ));
            }
            *state.balances.entry(base.clone()).or_default() -= request.quantity;
            *state.locked.entry(base).or_default() += request.quantity;
        }

        let id = self.order_id_counter.fetch_add(3, Ordering::SeqCst);
        let bracket_id = format!("oco-{id}");
        let handle = BracketHandle {
            bracket_id: bracket_id.clone(),
            leg_ids: vec![(id + 1).to_string(), (id + 2).to_string()],
        };
        state.brackets.insert(
            bracket_id,
            MockBracket {
                pair: request.pair.clone(),
                side: request.side,
                quantity: request.quantity,
                take_profit_price: request.take_profit_price,
                stop_limit_price: request.stop_limit_price,
                status: BracketStatus::active(),
            },
        );

        debug!("[MOCK] Bracket {} placed for {}", handle.bracket_id, request.pair);
        Ok(handle)
    }

    async fn get_order_status(
        &self,
        _pair: &Pair,
        order: &OrderRef,
        _account: AccountType,
    ) -> Result<OrderFill, ExchangeError> {
        self.enter(MockOperation::OrderStatus).await?;
        let state = self.state.read().await;
        let found = match order {
            OrderRef::Client(key) => state.orders.get(key).cloned(),
            OrderRef::Exchange(id) => state.orders.values().find(|o| &o.order_id == id).cloned(),
        };
        found.ok_or_else(|| self.rejected(format!("order does not exist: {order:?}")))
    }

    async fn get_bracket_status(
        &self,
        _pair: &Pair,
        bracket_id: &str,
    ) -> Result<BracketStatus, ExchangeError> {
        self.enter(MockOperation::BracketStatus).await?;
        self.state
            .read()
            .await
            .brackets
            .get(bracket_id)
            .map(|b| b.status.clone())
            .ok_or_else(|| self.rejected(format!("unknown bracket {bracket_id}")))
    }

    async fn cancel_bracket(&self, _pair: &Pair, bracket_id: &str) -> Result<(), ExchangeError> {
        self.enter(MockOperation::CancelBracket).await?;
        let mut state = self.state.write().await;
        let bracket = state
            .brackets
            .get(bracket_id)
            .cloned()
            .ok_or_else(|| self.rejected(format!("unknown bracket {bracket_id}")))?;

        match bracket.status.state {
            BracketState::Filled => Err(self.rejected(format!("bracket {bracket_id} already filled"))),
            BracketState::Active => {
                Self::unlock(&mut state, &bracket);
                if let Some(entry) = state.brackets.get_mut(bracket_id) {
                    entry.status.state = BracketState::Cancelled;
                }
                Ok(())
            }
            BracketState::Cancelled | BracketState::Expired => Ok(()),
        }
    }
}
