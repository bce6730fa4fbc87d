//! Per-position exit state machine.
//!
//! `OPEN -> HOLDING_FOR_PROFIT -> CLOSED`, or `OPEN -> CLOSED` directly for
//! stale, orphaned and bracket-filled positions. Each call to
//! [`ExitManager::evaluate`] is one poll of one position.

use super::closer::{estimate_pnl, held_on_venue, ExitOutcome, PositionCloser};
use crate::config::ExitConfig;
use crate::exchange::{BracketLeg, BracketState, BracketStatus, Direction, Exchange, ExchangeGateway, Pair};
use crate::persistence::{AuditAction, AuditEntry, CloseReason, Trade, TradeStore};
use anyhow::Result;
use chrono::Utc;
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Why the client-side monitor fired.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MonitorTrigger {
    TakeProfit,
    /// Fixed or trailing stop
    StopLoss,
    TimeExit,
}

impl From<MonitorTrigger> for CloseReason {
    fn from(trigger: MonitorTrigger) -> Self {
        match trigger {
            MonitorTrigger::TakeProfit => CloseReason::ProfitTake,
            MonitorTrigger::StopLoss => CloseReason::StopLoss,
            MonitorTrigger::TimeExit => CloseReason::TimeExit,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum MonitorResult {
    Triggered { trigger: MonitorTrigger, price: Decimal },
    Cancelled,
}

/// Price levels computed once, before monitoring starts.
#[derive(Debug, Clone, PartialEq)]
pub struct ExitThresholds {
    pub direction: Direction,
    pub entry_price: Decimal,
    pub take_profit: Decimal,
    pub stop_loss: Decimal,
    pub trailing_pct: Option<Decimal>,
    pub max_hold: Duration,
    pub poll_interval: Duration,
}

impl ExitThresholds {
    /// Take-profit where net P&L reaches the target after round-trip fees.
    pub fn for_trade(trade: &Trade, fee_rate: Decimal, config: &ExitConfig) -> Self {
        let sign = trade.direction.sign();
        let fees = fee_rate * Decimal::TWO * trade.entry_price * trade.quantity;
        let move_needed = if trade.quantity > Decimal::ZERO {
            (trade.target_profit + fees) / trade.quantity
        } else {
            Decimal::ZERO
        };
        Self {
            direction: trade.direction,
            entry_price: trade.entry_price,
            take_profit: trade.entry_price + sign * move_needed,
            stop_loss: trade.entry_price * (Decimal::ONE - sign * config.stop_loss_pct),
            trailing_pct: (config.trailing_stop_pct > Decimal::ZERO)
                .then_some(config.trailing_stop_pct),
            max_hold: Duration::from_secs(config.max_hold_minutes * 60),
            poll_interval: Duration::from_millis(config.poll_interval_ms),
        }
    }
}

/// Client-side fallback when brackets are unavailable.
pub struct PriceMonitor;

impl PriceMonitor {
    /// Poll until a threshold triggers or `is_cancelled` returns true. The
    /// cancellation check runs before every fetch, never mid-fetch.
    pub async fn watch<C>(
        gateway: &ExchangeGateway,
        pair: &Pair,
        thresholds: &ExitThresholds,
        is_cancelled: C,
    ) -> Result<MonitorResult, crate::error::ExchangeError>
    where
        C: Fn() -> bool,
    {
        let started = Instant::now();
        let sign = thresholds.direction.sign();
        let mut best: Option<Decimal> = None;

        loop {
            if is_cancelled() {
                debug!(%pair, "Price monitor cancelled");
                return Ok(MonitorResult::Cancelled);
            }

            let price = gateway.get_price(pair).await?;

            // Signed so "higher is better" for both directions
            let favourable = sign * price;
            if favourable >= sign * thresholds.take_profit {
                return Ok(MonitorResult::Triggered {
                    trigger: MonitorTrigger::TakeProfit,
                    price,
                });
            }
            if favourable <= sign * thresholds.stop_loss {
                return Ok(MonitorResult::Triggered {
                    trigger: MonitorTrigger::StopLoss,
                    price,
                });
            }

            let peak = best.map_or(favourable, |b| b.max(favourable));
            best = Some(peak);
            if let Some(trail) = thresholds.trailing_pct {
                // Trail only once the position has been in profit
                if peak > sign * thresholds.entry_price {
                    let give_back = peak.abs() * trail;
                    if favourable <= peak - give_back {
                        return Ok(MonitorResult::Triggered {
                            trigger: MonitorTrigger::StopLoss,
                            price,
                        });
                    }
                }
            }

            if started.elapsed() >= thresholds.max_hold {
                return Ok(MonitorResult::Triggered {
                    trigger: MonitorTrigger::TimeExit,
                    price,
                });
            }

            tokio::time::sleep(thresholds.poll_interval).await;
        }
    }
}

/// Summary of one pass over all open trades.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct ExitReport {
    pub examined: usize,
    pub closed: usize,
    pub holding: usize,
    pub dust_held: usize,
    pub failed: usize,
    pub skipped: usize,
}

pub struct ExitManager {
    gateways: HashMap<Exchange, ExchangeGateway>,
    closer: PositionCloser,
    config: ExitConfig,
}

impl ExitManager {
    pub fn new(
        gateways: HashMap<Exchange, ExchangeGateway>,
        store: Arc<TradeStore>,
        config: ExitConfig,
    ) -> Self {
        let lease = Duration::from_secs(config.claim_lease_secs);
        Self {
            gateways,
            closer: PositionCloser::new(store, "exit-manager", lease),
            config,
        }
    }

    /// One poll of every open trade.
    pub async fn run_once(&self) -> Result<ExitReport> {
        let trades = self.closer.store().open_trades()?;
        let mut report = ExitReport::default();

        for trade in &trades {
            report.examined += 1;
            match self.evaluate(trade).await? {
                ExitOutcome::Closed { .. } => report.closed += 1,
                ExitOutcome::Holding { .. } => report.holding += 1,
                ExitOutcome::DustHold { .. } => report.dust_held += 1,
                ExitOutcome::ExitFailed { .. } => report.failed += 1,
                ExitOutcome::Skipped { .. } => report.skipped += 1,
            }
        }

        info!(
            examined = report.examined,
            closed = report.closed,
            holding = report.holding,
            "Exit pass complete"
        );
        Ok(report)
    }

    pub async fn evaluate(&self, trade: &Trade) -> Result<ExitOutcome> {
        if !trade.is_open() {
            return Ok(ExitOutcome::Skipped {
                reason: "not open".to_string(),
            });
        }
        let Some(gateway) = self.gateways.get(&trade.exchange) else {
            warn!(trade_id = trade.id, exchange = %trade.exchange, "No gateway for exchange");
            return Ok(ExitOutcome::Skipped {
                reason: format!("no gateway for {}", trade.exchange),
            });
        };

        let price = match gateway.get_price(&trade.pair).await {
            Ok(price) => price,
            Err(e) => {
                warn!(trade_id = trade.id, "Price unavailable, skipping poll: {}", e);
                return Ok(ExitOutcome::Skipped {
                    reason: format!("price unavailable: {e}"),
                });
            }
        };
        let fee_rate = gateway.fee_rate();
        let estimate = estimate_pnl(trade, price, trade.quantity, fee_rate);
        let stale = trade.age_hours(Utc::now()) >= i64::from(self.config.stale_after_hours);

        // A filled bracket leg is authoritative.
        let bracket = match &trade.bracket_id {
            Some(id) => match gateway.get_bracket_status(&trade.pair, id).await {
                Ok(status) => Some(status),
                Err(e) => {
                    // Inventory may be locked by the bracket; don't guess.
                    warn!(trade_id = trade.id, bracket_id = %id, "Bracket status unavailable: {}", e);
                    return Ok(ExitOutcome::Skipped {
                        reason: format!("bracket status unavailable: {e}"),
                    });
                }
            },
            None => None,
        };
        if let Some(BracketStatus {
            state: BracketState::Filled,
            filled_leg: Some(leg),
            fill_price,
        }) = &bracket
        {
            if !self.closer.claim(trade)? {
                return Ok(claimed_elsewhere());
            }
            let exit_price = fill_price.unwrap_or(price);
            let pnl = estimate_pnl(trade, exit_price, trade.quantity, fee_rate);
            let reason = match leg {
                BracketLeg::TakeProfit => CloseReason::ProfitTake,
                BracketLeg::StopLoss => CloseReason::StopLoss,
            };
            return self
                .closer
                .close(trade, price, exit_price, pnl, reason, format!("bracket {leg:?} leg filled"));
        }
        if bracket.as_ref().is_some_and(BracketStatus::is_terminal_without_fill) {
            debug!(trade_id = trade.id, "Bracket ended without a fill, clearing");
            self.closer.clear_bracket(trade);
        }
        let bracket_active = matches!(&bracket, Some(s) if s.state == BracketState::Active);

        let lot = match gateway.get_lot_size(&trade.pair).await {
            Ok(lot) => lot,
            Err(e) => {
                warn!(trade_id = trade.id, "Lot size unavailable, skipping poll: {}", e);
                return Ok(ExitOutcome::Skipped {
                    reason: format!("lot size unavailable: {e}"),
                });
            }
        };

        let available = if bracket_active {
            trade.quantity
        } else {
            match held_on_venue(gateway, trade, price).await {
                Ok(held) => held,
                Err(e) => {
                    warn!(trade_id = trade.id, "Balance unavailable, skipping poll: {}", e);
                    return Ok(ExitOutcome::Skipped {
                        reason: format!("balance unavailable: {e}"),
                    });
                }
            }
        };
        let exit_qty = lot.quantize(available);

        // Nothing left to sell and no live bracket: already closed venue-side.
        if exit_qty.is_zero() && !bracket_active {
            if !self.closer.claim(trade)? {
                return Ok(claimed_elsewhere());
            }
            return self.closer.close(
                trade,
                price,
                price,
                estimate,
                CloseReason::Orphan,
                "position no longer held on venue, closed at last price",
            );
        }

        if lot.is_dust(exit_qty, price) {
            if estimate.net >= trade.target_profit || stale {
                if !self.closer.claim(trade)? {
                    return Ok(claimed_elsewhere());
                }
                return self.closer.close(
                    trade,
                    price,
                    price,
                    estimate,
                    CloseReason::Dust,
                    format!("dust quantity {exit_qty} below venue minimum"),
                );
            }
            debug!(trade_id = trade.id, net = %estimate.net, "Dust below target, holding");
            self.closer.audit(AuditEntry {
                trade_id: trade.id,
                action: AuditAction::DustHold,
                exchange: trade.exchange,
                pair: trade.pair.clone(),
                price_before: price,
                price_after: None,
                fees: estimate.fees,
                net_pnl: Some(estimate.net),
                success: true,
                detail: format!(
                    "dust quantity {exit_qty}, net {} below target {}",
                    estimate.net, trade.target_profit
                ),
                created_at: Utc::now(),
            });
            return Ok(ExitOutcome::DustHold {
                net_pnl: estimate.net,
            });
        }

        let reason = if stale {
            CloseReason::StaleClose
        } else if estimate.net >= trade.target_profit {
            CloseReason::ProfitTake
        } else {
            if !trade.holding_for_profit {
                self.closer.store().set_holding_for_profit(trade.id, true)?;
            }
            debug!(
                trade_id = trade.id,
                net = %estimate.net,
                target = %trade.target_profit,
                "Below target, holding"
            );
            return Ok(ExitOutcome::Holding {
                net_pnl: estimate.net,
            });
        };

        if !self.closer.claim(trade)? {
            return Ok(claimed_elsewhere());
        }
        self.exit_at_market(gateway, trade, bracket_active, exit_qty, price, reason)
            .await
    }

    /// Cancel any live bracket, sell, and close the record at the fill price.
    async fn exit_at_market(
        &self,
        gateway: &ExchangeGateway,
        trade: &Trade,
        bracket_active: bool,
        quantity: Decimal,
        price: Decimal,
        reason: CloseReason,
    ) -> Result<ExitOutcome> {
        if bracket_active {
            if let Some(id) = &trade.bracket_id {
                if let Err(e) = gateway.cancel_bracket(&trade.pair, id).await {
                    // The bracket may have filled between the status read and the cancel.
                    if let Ok(BracketStatus {
                        state: BracketState::Filled,
                        filled_leg: Some(leg),
                        fill_price,
                    }) = gateway.get_bracket_status(&trade.pair, id).await
                    {
                        let exit_price = fill_price.unwrap_or(price);
                        let pnl = estimate_pnl(trade, exit_price, trade.quantity, gateway.fee_rate());
                        let reason = match leg {
                            BracketLeg::TakeProfit => CloseReason::ProfitTake,
                            BracketLeg::StopLoss => CloseReason::StopLoss,
                        };
                        return self.closer.close(
                            trade,
                            price,
                            exit_price,
                            pnl,
                            reason,
                            "bracket filled during exit",
                        );
                    }
                    return Ok(self.closer.exit_failed(trade, price, &e));
                }
                self.closer.clear_bracket(trade);
            }
        }

        match self.closer.market_exit(gateway, trade, quantity, price).await {
            Ok(fill) => {
                let exit_price = if fill.avg_price > Decimal::ZERO {
                    fill.avg_price
                } else {
                    price
                };
                let executed = if fill.executed_qty > Decimal::ZERO {
                    fill.executed_qty
                } else {
                    quantity
                };
                let pnl = estimate_pnl(trade, exit_price, executed, gateway.fee_rate());
                self.closer.close(
                    trade,
                    price,
                    exit_price,
                    pnl,
                    reason,
                    format!("market exit order {}", fill.order_id),
                )
            }
            Err(e) => Ok(self.closer.exit_failed(trade, price, &e)),
        }
    }

    /// Watch one position client-side until a threshold triggers, then exit.
    pub async fn monitor_and_exit<C>(&self, trade: &Trade, is_cancelled: C) -> Result<ExitOutcome>
    where
        C: Fn() -> bool,
    {
        let Some(gateway) = self.gateways.get(&trade.exchange) else {
            return Ok(ExitOutcome::Skipped {
                reason: format!("no gateway for {}", trade.exchange),
            });
        };
        let thresholds = ExitThresholds::for_trade(trade, gateway.fee_rate(), &self.config);
        info!(
            trade_id = trade.id,
            take_profit = %thresholds.take_profit,
            stop_loss = %thresholds.stop_loss,
            "Monitoring position client-side"
        );

        let result = match PriceMonitor::watch(gateway, &trade.pair, &thresholds, is_cancelled).await
        {
            Ok(result) => result,
            Err(e) => {
                warn!(trade_id = trade.id, "Monitor stopped on price error: {}", e);
                return Ok(ExitOutcome::Skipped {
                    reason: format!("monitor stopped: {e}"),
                });
            }
        };

        let (trigger, price) = match result {
            MonitorResult::Cancelled => {
                info!(trade_id = trade.id, "Monitor cancelled, position left open");
                return Ok(ExitOutcome::Skipped {
                    reason: "monitor cancelled".to_string(),
                });
            }
            MonitorResult::Triggered { trigger, price } => (trigger, price),
        };
        info!(trade_id = trade.id, ?trigger, %price, "Exit threshold triggered");

        let lot = gateway.get_lot_size(&trade.pair).await;
        let quantity = match lot {
            Ok(lot) => lot.quantize(trade.quantity),
            Err(_) => trade.quantity,
        };
        if !self.closer.claim(trade)? {
            return Ok(claimed_elsewhere());
        }
        self.exit_at_market(gateway, trade, false, quantity, price, trigger.into())
            .await
    }
}

fn claimed_elsewhere() -> ExitOutcome {
    ExitOutcome::Skipped {
        reason: "claimed by another worker".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::exchange::{ExchangeAdapter, LotSize, MarginBalance, MockExchange};
    use crate::persistence::tests::sample_trade;
    use rust_decimal_macros::dec;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

    fn btc() -> Pair {
        Pair::new("BTC", "USDT")
    }

    async fn setup(base_held: Decimal) -> (Arc<TradeStore>, Arc<MockExchange>, ExitManager) {
        setup_with(base_held, false).await
    }

    async fn setup_with(
        base_held: Decimal,
        brackets: bool,
    ) -> (Arc<TradeStore>, Arc<MockExchange>, ExitManager) {
        let mut config = Config::default();
        config.exchanges.binance.min_request_interval_ms = 0;
        config.rate_limit.jitter_ms = 0;

        let store = Arc::new(TradeStore::in_memory().unwrap());
        let mock = Arc::new(
            MockExchange::new(Exchange::Binance, "USDT", dec!(100))
                .with_fee_rate(dec!(0.001))
                .with_brackets(brackets),
        );
        mock.set_balance("BTC", base_held).await;
        mock.set_price(&btc(), dec!(50000)).await;
        mock.set_lot_size(
            &btc(),
            LotSize {
                step_size: dec!(0.0001),
                min_qty: dec!(0.0001),
                min_notional: dec!(10),
            },
        )
        .await;

        let adapter: Arc<dyn ExchangeAdapter> = mock.clone();
        let gateways = ExchangeGateway::build_all(&config, vec![adapter], None);
        let manager = ExitManager::new(gateways, Arc::clone(&store), config.exit.clone());
        (store, mock, manager)
    }

    fn open_trade(store: &TradeStore, target: Decimal) -> Trade {
        let mut new = sample_trade("k1");
        new.target_profit = target;
        let id = store.insert_trade(&new).unwrap();
        store.get_trade(id).unwrap().unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn test_below_target_sets_holding_flag() {
        let (store, _mock, manager) = setup(dec!(0.0004)).await;
        let trade = open_trade(&store, dec!(0.5));

        let outcome = manager.evaluate(&trade).await.unwrap();
        assert!(matches!(outcome, ExitOutcome::Holding { .. }));
        assert!(store.get_trade(trade.id).unwrap().unwrap().holding_for_profit);
    }

    #[tokio::test(start_paused = true)]
    async fn test_target_met_places_market_exit() {
        let (store, mock, manager) = setup(dec!(0.0004)).await;
        let trade = open_trade(&store, dec!(0.3));
        mock.set_price(&btc(), dec!(51000)).await;

        let outcome = manager.evaluate(&trade).await.unwrap();
        let ExitOutcome::Closed { reason, exit_price, .. } = outcome else {
            panic!("expected close, got {outcome:?}");
        };
        assert_eq!(reason, CloseReason::ProfitTake);
        assert_eq!(exit_price, dec!(51000));
        assert_eq!(mock.balance("BTC").await, dec!(0));

        let stored = store.get_trade(trade.id).unwrap().unwrap();
        assert_eq!(stored.close_reason(), Some(CloseReason::ProfitTake));
        assert_eq!(stored.pnl(), Some(dec!(0.3596)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_balance_closes_as_orphan_at_last_price() {
        let (store, mock, manager) = setup(dec!(0)).await;
        let trade = open_trade(&store, dec!(1));
        mock.set_price(&btc(), dec!(49000)).await;

        let outcome = manager.evaluate(&trade).await.unwrap();
        assert!(matches!(
            outcome,
            ExitOutcome::Closed {
                reason: CloseReason::Orphan,
                ..
            }
        ));
        let stored = store.get_trade(trade.id).unwrap().unwrap();
        // Estimate from the live price, not a synthetic zero
        assert_eq!(stored.exit_price(), Some(dec!(49000)));
    }

    fn leveraged_trade(store: &TradeStore, direction: Direction) -> Trade {
        let mut new = sample_trade("k3x");
        new.direction = direction;
        new.quantity = dec!(0.0012);
        new.notional = dec!(60);
        new.leverage = 3;
        new.target_profit = dec!(0.5);
        let id = store.insert_trade(&new).unwrap();
        store.get_trade(id).unwrap().unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn test_leveraged_long_is_read_from_margin_wallet() {
        // Spot wallet holds only USDT; the 3x long lives in cross margin
        let (store, mock, manager) = setup(dec!(0)).await;
        mock.set_margin_balance(
            "BTC",
            MarginBalance {
                free: dec!(0.0012),
                borrowed: dec!(0),
            },
        )
        .await;
        mock.set_margin_balance(
            "USDT",
            MarginBalance {
                free: dec!(0),
                borrowed: dec!(40.06),
            },
        )
        .await;
        let trade = leveraged_trade(&store, Direction::Long);

        let outcome = manager.evaluate(&trade).await.unwrap();
        assert!(matches!(outcome, ExitOutcome::Holding { .. }), "got {outcome:?}");
        assert_eq!(mock.order_count().await, 0);

        mock.set_price(&btc(), dec!(51000)).await;
        let outcome = manager.evaluate(&trade).await.unwrap();
        let ExitOutcome::Closed { reason, .. } = outcome else {
            panic!("expected close, got {outcome:?}");
        };
        assert_eq!(reason, CloseReason::ProfitTake);
        assert_eq!(mock.order_count().await, 1);
        assert_eq!(mock.margin_balance("BTC").await, MarginBalance::default());
        assert_eq!(mock.margin_balance("USDT").await.borrowed, dec!(0));
        assert_eq!(mock.balance("BTC").await, dec!(0));
    }

    #[tokio::test(start_paused = true)]
    async fn test_leveraged_short_buys_back_loan() {
        let (store, mock, manager) = setup(dec!(0)).await;
        mock.set_margin_balance(
            "BTC",
            MarginBalance {
                free: dec!(0),
                borrowed: dec!(0.0012),
            },
        )
        .await;
        let trade = leveraged_trade(&store, Direction::Short);
        mock.set_price(&btc(), dec!(49000)).await;

        let outcome = manager.evaluate(&trade).await.unwrap();
        let ExitOutcome::Closed { reason, .. } = outcome else {
            panic!("expected close, got {outcome:?}");
        };
        assert_eq!(reason, CloseReason::ProfitTake);
        assert_eq!(mock.order_count().await, 1);
        assert_eq!(mock.margin_balance("BTC").await.borrowed, dec!(0));
    }

    #[tokio::test(start_paused = true)]
    async fn test_repaid_short_closes_as_orphan() {
        let (store, mock, manager) = setup(dec!(0)).await;
        let trade = leveraged_trade(&store, Direction::Short);

        let outcome = manager.evaluate(&trade).await.unwrap();
        assert!(matches!(
            outcome,
            ExitOutcome::Closed {
                reason: CloseReason::Orphan,
                ..
            }
        ));
        assert_eq!(mock.order_count().await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_position_forced_out() {
        let (store, _mock, manager) = setup(dec!(0.0004)).await;
        let mut new = sample_trade("old");
        new.target_profit = dec!(100);
        new.opened_at = Utc::now() - chrono::Duration::hours(72);
        let id = store.insert_trade(&new).unwrap();
        let trade = store.get_trade(id).unwrap().unwrap();

        let outcome = manager.evaluate(&trade).await.unwrap();
        assert!(matches!(
            outcome,
            ExitOutcome::Closed {
                reason: CloseReason::StaleClose,
                ..
            }
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_claimed_trade_is_skipped() {
        let (store, mock, manager) = setup(dec!(0.0004)).await;
        let trade = open_trade(&store, dec!(0.3));
        mock.set_price(&btc(), dec!(51000)).await;
        assert!(store.try_claim(trade.id, "sweeper", Duration::from_secs(60)).unwrap());

        let outcome = manager.evaluate(&trade).await.unwrap();
        assert!(matches!(outcome, ExitOutcome::Skipped { .. }));
        assert!(store.get_trade(trade.id).unwrap().unwrap().is_open());
        assert_eq!(mock.order_count().await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_filled_bracket_closes_without_order() {
        let (store, mock, manager) = setup_with(dec!(0.0004), true).await;
        let gateway = manager.gateways.get(&Exchange::Binance).unwrap().clone();
        let handle = gateway
            .place_bracket_order(&crate::exchange::BracketOrderRequest {
                pair: btc(),
                side: crate::exchange::OrderSide::Sell,
                quantity: dec!(0.0004),
                take_profit_price: dec!(51000),
                stop_price: dec!(48500),
                stop_limit_price: dec!(48450),
                idempotency_key: "k1-b".to_string(),
            })
            .await
            .unwrap();

        let mut new = sample_trade("k1");
        new.bracket_id = Some(handle.bracket_id.clone());
        let id = store.insert_trade(&new).unwrap();
        let trade = store.get_trade(id).unwrap().unwrap();

        // Active bracket locks the base asset; still holding, not orphaned
        let outcome = manager.evaluate(&trade).await.unwrap();
        assert!(matches!(outcome, ExitOutcome::Holding { .. }));

        mock.fill_bracket(&handle.bracket_id, BracketLeg::StopLoss)
            .await
            .unwrap();
        let orders_before = mock.order_count().await;
        let outcome = manager.evaluate(&trade).await.unwrap();
        let ExitOutcome::Closed { reason, exit_price, .. } = outcome else {
            panic!("expected close, got {outcome:?}");
        };
        assert_eq!(reason, CloseReason::StopLoss);
        assert_eq!(exit_price, dec!(48450));
        assert_eq!(mock.order_count().await, orders_before);
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_bracket_is_cleared() {
        let (store, mock, manager) = setup_with(dec!(0.0004), true).await;
        let gateway = manager.gateways.get(&Exchange::Binance).unwrap().clone();
        let handle = gateway
            .place_bracket_order(&crate::exchange::BracketOrderRequest {
                pair: btc(),
                side: crate::exchange::OrderSide::Sell,
                quantity: dec!(0.0004),
                take_profit_price: dec!(51000),
                stop_price: dec!(48500),
                stop_limit_price: dec!(48450),
                idempotency_key: "k1-b".to_string(),
            })
            .await
            .unwrap();
        let mut new = sample_trade("k1");
        new.bracket_id = Some(handle.bracket_id.clone());
        let id = store.insert_trade(&new).unwrap();
        let trade = store.get_trade(id).unwrap().unwrap();

        mock.expire_bracket(&handle.bracket_id).await;
        let outcome = manager.evaluate(&trade).await.unwrap();

        // Inventory is free again, so the position is simply held
        assert!(matches!(outcome, ExitOutcome::Holding { .. }));
        assert_eq!(store.get_trade(id).unwrap().unwrap().bracket_id, None);
    }

    #[test]
    fn test_thresholds_include_fees() {
        let store = TradeStore::in_memory().unwrap();
        let trade = open_trade(&store, dec!(0.36));
        let thresholds = ExitThresholds::for_trade(&trade, dec!(0.001), &ExitConfig::default());
        // (0.36 + 0.04) / 0.0004 = 1000
        assert_eq!(thresholds.take_profit, dec!(51000));
        assert_eq!(thresholds.stop_loss, dec!(48500));
    }

    #[tokio::test(start_paused = true)]
    async fn test_monitor_take_profit() {
        let (store, mock, manager) = setup(dec!(0.0004)).await;
        let trade = open_trade(&store, dec!(0.36));
        mock.set_price(&btc(), dec!(51500)).await;

        let outcome = manager.monitor_and_exit(&trade, || false).await.unwrap();
        assert!(matches!(
            outcome,
            ExitOutcome::Closed {
                reason: CloseReason::ProfitTake,
                ..
            }
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_monitor_time_exit() {
        let (store, _mock, manager) = setup(dec!(0.0004)).await;
        let trade = open_trade(&store, dec!(0.36));

        let outcome = manager.monitor_and_exit(&trade, || false).await.unwrap();
        assert!(matches!(
            outcome,
            ExitOutcome::Closed {
                reason: CloseReason::TimeExit,
                ..
            }
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_monitor_cancelled_before_fetch() {
        let (store, mock, manager) = setup(dec!(0.0004)).await;
        let trade = open_trade(&store, dec!(0.36));
        let polls = AtomicU32::new(0);
        let cancel = AtomicBool::new(false);

        let outcome = manager
            .monitor_and_exit(&trade, || {
                // Cancel on the third check: two fetches happen, no third
                if polls.fetch_add(1, Ordering::SeqCst) >= 2 {
                    cancel.store(true, Ordering::SeqCst);
                }
                cancel.load(Ordering::SeqCst)
            })
            .await
            .unwrap();

        assert!(matches!(outcome, ExitOutcome::Skipped { .. }));
        assert_eq!(
            mock.call_count(crate::exchange::MockOperation::Price).await,
            2
        );
        assert!(store.get_trade(trade.id).unwrap().unwrap().is_open());
    }

    #[tokio::test(start_paused = true)]
    async fn test_trailing_stop_after_peak() {
        let (store, mock, manager) = setup(dec!(0.0004)).await;
        let trade = open_trade(&store, dec!(10));
        let thresholds = ExitThresholds::for_trade(&trade, dec!(0.001), &ExitConfig::default());
        mock.set_price(&btc(), dec!(50500)).await;

        let gateway = manager.gateways.get(&Exchange::Binance).unwrap().clone();
        let pair = btc();
        let watch = PriceMonitor::watch(&gateway, &pair, &thresholds, || false);
        let drop = async {
            tokio::time::sleep(Duration::from_millis(2500)).await;
            // 50500 * (1 - 0.015) = 49742.5; 49700 trails out above the fixed stop
            mock.set_price(&btc(), dec!(49700)).await;
        };
        let (result, _) = tokio::join!(watch, drop);

        assert_eq!(
            result.unwrap(),
            MonitorResult::Triggered {
                trigger: MonitorTrigger::StopLoss,
                price: dec!(49700)
            }
        );
    }
}
