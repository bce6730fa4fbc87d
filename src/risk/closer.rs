//! Close mechanics shared by the exit manager and the sweeper.
//!
//! A multi-step close runs under a lease on the trade row; the final write is
//! a compare-and-set on `status = 'open'`. The audit entry and bot-run update
//! that accompany a close are best-effort.

use crate::error::ExchangeError;
use crate::exchange::{AccountType, Direction, ExchangeGateway, MarketOrderRequest, OrderFill};
use crate::persistence::{AuditAction, AuditEntry, CloseReason, CloseRecord, Trade, TradeStore};
use crate::utils::safe_div;
use anyhow::Result;
use chrono::Utc;
use rust_decimal::Decimal;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

/// Fee-aware P&L of a position at a given exit price.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PnlEstimate {
    pub gross: Decimal,
    pub fees: Decimal,
    pub net: Decimal,
}

/// P&L for closing `exit_qty` of `trade` at `exit_price`; entry fees are
/// charged on the full recorded quantity.
pub fn estimate_pnl(trade: &Trade, exit_price: Decimal, exit_qty: Decimal, fee_rate: Decimal) -> PnlEstimate {
    let gross = trade.direction.sign() * (exit_price - trade.entry_price) * exit_qty;
    let fees = fee_rate * (trade.entry_price * trade.quantity + exit_price * exit_qty);
    PnlEstimate {
        gross,
        fees,
        net: gross - fees,
    }
}

/// Outcome of one attempt to resolve a position.
#[derive(Debug, Clone, PartialEq)]
pub enum ExitOutcome {
    Closed {
        reason: CloseReason,
        exit_price: Decimal,
        pnl: Decimal,
    },
    /// Below target; flagged `holding_for_profit`
    Holding { net_pnl: Decimal },
    /// Sub-minimum quantity below target; left open
    DustHold { net_pnl: Decimal },
    /// Exit attempt failed; trade left open with a needs-review audit entry
    ExitFailed { detail: String },
    /// Nothing done this pass (claimed elsewhere, price unavailable, ...)
    Skipped { reason: String },
}

impl ExitOutcome {
    pub fn is_closed(&self) -> bool {
        matches!(self, ExitOutcome::Closed { .. })
    }
}

pub struct PositionCloser {
    store: Arc<TradeStore>,
    owner: String,
    lease: Duration,
}

impl PositionCloser {
    pub fn new(store: Arc<TradeStore>, owner: impl Into<String>, lease: Duration) -> Self {
        Self {
            store,
            owner: owner.into(),
            lease,
        }
    }

    pub fn store(&self) -> &TradeStore {
        &self.store
    }

    /// Take the lease; false means another worker owns the close.
    pub fn claim(&self, trade: &Trade) -> Result<bool> {
        let claimed = self.store.try_claim(trade.id, &self.owner, self.lease)?;
        if !claimed {
            info!(trade_id = trade.id, owner = %self.owner, "Trade claimed elsewhere, skipping");
        }
        Ok(claimed)
    }

    pub fn release(&self, trade: &Trade) {
        if let Err(e) = self.store.release_claim(trade.id, &self.owner) {
            warn!(trade_id = trade.id, "Failed to release claim: {:#}", e);
        }
    }

    /// Market order closing `quantity` of the position. The client order id
    /// is derived from the trade, so a replay returns the original fill.
    pub async fn market_exit(
        &self,
        gateway: &ExchangeGateway,
        trade: &Trade,
        quantity: Decimal,
        reference_price: Decimal,
    ) -> Result<OrderFill, ExchangeError> {
        gateway
            .place_market_order(&MarketOrderRequest {
                pair: trade.pair.clone(),
                side: trade.direction.exit_side(),
                quantity,
                idempotency_key: format!("{}-x", trade.idempotency_key),
                leverage: trade.leverage,
                reference_price,
            })
            .await
    }

    /// Persist the close, then write the audit entry and bot-run update.
    pub fn close(
        &self,
        trade: &Trade,
        price_before: Decimal,
        exit_price: Decimal,
        pnl: PnlEstimate,
        reason: CloseReason,
        detail: impl Into<String>,
    ) -> Result<ExitOutcome> {
        let record = CloseRecord {
            exit_price,
            pnl: pnl.net,
            reason,
        };
        if !self.store.close_trade(trade.id, Some(&self.owner), &record)? {
            warn!(trade_id = trade.id, %reason, "Trade already closed or claimed, close skipped");
            return Ok(ExitOutcome::Skipped {
                reason: "already closed".to_string(),
            });
        }

        info!(
            trade_id = trade.id,
            exchange = %trade.exchange,
            pair = %trade.pair,
            %reason,
            %exit_price,
            pnl = %pnl.net,
            "Position closed"
        );

        self.audit(AuditEntry {
            trade_id: trade.id,
            action: AuditAction::from(reason),
            exchange: trade.exchange,
            pair: trade.pair.clone(),
            price_before,
            price_after: Some(exit_price),
            fees: pnl.fees,
            net_pnl: Some(pnl.net),
            success: true,
            detail: detail.into(),
            created_at: Utc::now(),
        });

        if let Some(run_id) = &trade.run_id {
            if let Err(e) = self.store.record_bot_run_close(run_id, &trade.bot_id, pnl.net) {
                warn!(trade_id = trade.id, run_id = %run_id, "Failed to update bot run: {:#}", e);
            }
        }

        Ok(ExitOutcome::Closed {
            reason,
            exit_price,
            pnl: pnl.net,
        })
    }

    /// Record a failed exit and leave the trade open for review.
    pub fn exit_failed(&self, trade: &Trade, price: Decimal, err: &ExchangeError) -> ExitOutcome {
        error!(
            trade_id = trade.id,
            exchange = %trade.exchange,
            pair = %trade.pair,
            kind = %err.kind,
            "Exit failed, needs review: {}",
            err.message
        );
        let detail = format!("{} exit failed: {}", trade.direction, err);
        for action in [AuditAction::ExitFailed, AuditAction::NeedsReview] {
            self.audit(AuditEntry {
                trade_id: trade.id,
                action,
                exchange: trade.exchange,
                pair: trade.pair.clone(),
                price_before: price,
                price_after: None,
                fees: Decimal::ZERO,
                net_pnl: None,
                success: false,
                detail: detail.clone(),
                created_at: Utc::now(),
            });
        }
        self.release(trade);
        ExitOutcome::ExitFailed { detail }
    }

    /// Forget a bracket that can no longer fill.
    pub fn clear_bracket(&self, trade: &Trade) {
        if let Err(e) = self.store.set_bracket(trade.id, None) {
            warn!(trade_id = trade.id, "Failed to clear bracket id: {:#}", e);
        }
    }

    pub fn audit(&self, entry: AuditEntry) {
        if let Err(e) = self.store.append_audit(&entry) {
            warn!(
                trade_id = entry.trade_id,
                action = entry.action.as_str(),
                "Failed to write audit entry: {:#}",
                e
            );
        }
    }
}

/// Recorded quantity capped by what the venue still holds.
pub fn exit_quantity(trade: &Trade, held: Decimal) -> Decimal {
    trade.quantity.min(held.max(Decimal::ZERO))
}

/// How much of the position is still backed on the venue, read from the
/// wallet the entry order used.
///
/// | account | long              | short                          |
/// |---------|-------------------|--------------------------------|
/// | spot    | free base         | free quote / buy-back cost     |
/// | margin  | free base         | outstanding base loan          |
pub async fn held_on_venue(
    gateway: &ExchangeGateway,
    trade: &Trade,
    price: Decimal,
) -> Result<Decimal, ExchangeError> {
    let pair = &trade.pair;
    let held = match (AccountType::for_leverage(trade.leverage), trade.direction) {
        (AccountType::Spot, Direction::Long) => gateway.get_free_balance(&pair.base).await?,
        (AccountType::Spot, Direction::Short) => {
            let quote = gateway.get_free_balance(&pair.quote).await?;
            safe_div(quote, price * (Decimal::ONE + gateway.fee_rate()))
        }
        (AccountType::Margin, Direction::Long) => gateway.get_margin_balance(&pair.base).await?.free,
        (AccountType::Margin, Direction::Short) => {
            gateway.get_margin_balance(&pair.base).await?.borrowed
        }
    };
    Ok(exit_quantity(trade, held))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::tests::sample_trade;
    use rust_decimal_macros::dec;

    fn stored_trade(store: &TradeStore) -> Trade {
        let id = store.insert_trade(&sample_trade("k1")).unwrap();
        store.get_trade(id).unwrap().unwrap()
    }

    #[test]
    fn test_estimate_pnl_long_and_short() {
        let store = TradeStore::in_memory().unwrap();
        let mut trade = stored_trade(&store);
        // 0.0004 BTC from 50000 to 51000: gross 0.4, fees 0.001 * (20 + 20.4)
        let pnl = estimate_pnl(&trade, dec!(51000), trade.quantity, dec!(0.001));
        assert_eq!(pnl.gross, dec!(0.4));
        assert_eq!(pnl.fees, dec!(0.0404));
        assert_eq!(pnl.net, dec!(0.3596));

        trade.direction = Direction::Short;
        let pnl = estimate_pnl(&trade, dec!(51000), trade.quantity, dec!(0.001));
        assert_eq!(pnl.gross, dec!(-0.4));
    }

    #[test]
    fn test_close_writes_audit_and_bot_run() {
        let store = Arc::new(TradeStore::in_memory().unwrap());
        let trade = stored_trade(&store);
        let closer = PositionCloser::new(Arc::clone(&store), "exit", Duration::from_secs(60));
        assert!(closer.claim(&trade).unwrap());

        let pnl = estimate_pnl(&trade, dec!(51000), trade.quantity, dec!(0.001));
        let outcome = closer
            .close(&trade, dec!(51000), dec!(51000), pnl, CloseReason::ProfitTake, "target met")
            .unwrap();
        assert!(outcome.is_closed());

        let audit = store.audit_entries(trade.id).unwrap();
        assert_eq!(audit.len(), 1);
        assert_eq!(audit[0].action, AuditAction::ProfitTake);
        assert_eq!(store.get_bot_run("run-1").unwrap().unwrap().trades_executed, 1);

        // A second close is a skip, not a second audit entry
        let again = closer
            .close(&trade, dec!(51000), dec!(51000), pnl, CloseReason::ProfitTake, "again")
            .unwrap();
        assert!(matches!(again, ExitOutcome::Skipped { .. }));
        assert_eq!(store.audit_entries(trade.id).unwrap().len(), 1);
    }

    #[test]
    fn test_exit_quantity() {
        let store = TradeStore::in_memory().unwrap();
        let trade = stored_trade(&store);
        assert_eq!(exit_quantity(&trade, dec!(0.0003)), dec!(0.0003));
        assert_eq!(exit_quantity(&trade, dec!(1)), dec!(0.0004));
        assert_eq!(exit_quantity(&trade, dec!(-1)), dec!(0));
    }

    #[tokio::test(start_paused = true)]
    async fn test_held_on_venue_reads_the_entry_wallet() {
        use crate::config::Config;
        use crate::exchange::{Exchange, ExchangeAdapter, MarginBalance, MockExchange};

        let mut config = Config::default();
        config.exchanges.binance.min_request_interval_ms = 0;
        config.rate_limit.jitter_ms = 0;
        let mock = Arc::new(MockExchange::new(Exchange::Binance, "USDT", dec!(0)));
        mock.set_balance("BTC", dec!(0.0004)).await;
        mock.set_margin_balance(
            "BTC",
            MarginBalance {
                free: dec!(0.001),
                borrowed: dec!(0.0002),
            },
        )
        .await;
        let adapter: Arc<dyn ExchangeAdapter> = mock.clone();
        let gateways = ExchangeGateway::build_all(&config, vec![adapter], None);
        let gateway = &gateways[&Exchange::Binance];

        let store = TradeStore::in_memory().unwrap();
        let mut trade = stored_trade(&store);
        trade.quantity = dec!(0.0012);
        let price = dec!(50000);

        // Spot long: free spot base
        assert_eq!(held_on_venue(gateway, &trade, price).await.unwrap(), dec!(0.0004));
        // Leveraged long: margin wallet, not spot
        trade.leverage = 3;
        assert_eq!(held_on_venue(gateway, &trade, price).await.unwrap(), dec!(0.001));
        // Leveraged short: outstanding loan
        trade.direction = Direction::Short;
        assert_eq!(held_on_venue(gateway, &trade, price).await.unwrap(), dec!(0.0002));
        // Spot short with no quote to buy back
        trade.leverage = 1;
        assert_eq!(held_on_venue(gateway, &trade, price).await.unwrap(), dec!(0));
    }
}
