//! Reconciliation sweeper for stale open trades.
//!
//! Runs on a schedule independent of the exit manager. Shares its close
//! mechanics, so a trade is never closed twice when both reach it at once.

use super::closer::{estimate_pnl, held_on_venue, ExitOutcome, PositionCloser};
use crate::config::{ExitConfig, SweeperConfig};
use crate::exchange::{BracketLeg, BracketState, Exchange, ExchangeGateway};
use crate::persistence::{AuditAction, AuditEntry, CloseReason, Trade, TradeStore};
use anyhow::Result;
use chrono::{Duration as ChronoDuration, Utc};
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SweepReport {
    pub examined: usize,
    pub orphaned: usize,
    pub dust: usize,
    pub stale_cleanup: usize,
    /// Closed from a bracket leg that filled while nobody was watching
    pub bracket_filled: usize,
    pub failed: usize,
    pub skipped: usize,
}

pub struct ReconciliationSweeper {
    gateways: HashMap<Exchange, ExchangeGateway>,
    closer: PositionCloser,
    config: SweeperConfig,
}

impl ReconciliationSweeper {
    pub fn new(
        gateways: HashMap<Exchange, ExchangeGateway>,
        store: Arc<TradeStore>,
        config: SweeperConfig,
        exit: &ExitConfig,
    ) -> Self {
        Self {
            gateways,
            closer: PositionCloser::new(store, "sweeper", Duration::from_secs(exit.claim_lease_secs)),
            config,
        }
    }

    pub async fn run_once(&self) -> Result<SweepReport> {
        let cutoff = Utc::now() - ChronoDuration::hours(i64::from(self.config.stale_after_hours));
        let trades = self
            .closer
            .store()
            .open_trades_older_than(cutoff, self.config.batch_limit)?;
        let mut report = SweepReport::default();

        for trade in &trades {
            report.examined += 1;
            match self.sweep(trade).await? {
                ExitOutcome::Closed { reason, .. } => match reason {
                    CloseReason::Orphan => report.orphaned += 1,
                    CloseReason::Dust => report.dust += 1,
                    CloseReason::StaleCleanup => report.stale_cleanup += 1,
                    _ => report.bracket_filled += 1,
                },
                ExitOutcome::ExitFailed { .. } => report.failed += 1,
                _ => report.skipped += 1,
            }
        }

        info!(
            examined = report.examined,
            orphaned = report.orphaned,
            dust = report.dust,
            stale_cleanup = report.stale_cleanup,
            failed = report.failed,
            "Sweep complete"
        );
        Ok(report)
    }

    async fn sweep(&self, trade: &Trade) -> Result<ExitOutcome> {
        let Some(gateway) = self.gateways.get(&trade.exchange) else {
            warn!(trade_id = trade.id, exchange = %trade.exchange, "Stale trade on unconfigured exchange");
            self.closer.audit(AuditEntry {
                trade_id: trade.id,
                action: AuditAction::NeedsReview,
                exchange: trade.exchange,
                pair: trade.pair.clone(),
                price_before: trade.entry_price,
                price_after: None,
                fees: Decimal::ZERO,
                net_pnl: None,
                success: false,
                detail: format!("no gateway for {}", trade.exchange),
                created_at: Utc::now(),
            });
            return Ok(ExitOutcome::Skipped {
                reason: "no gateway".to_string(),
            });
        };

        if !self.closer.claim(trade)? {
            return Ok(ExitOutcome::Skipped {
                reason: "claimed by another worker".to_string(),
            });
        }

        let (price, fallback) = self.sweep_price(gateway, trade).await;
        let detail = |text: String| match &fallback {
            Some(note) => format!("{text}; {note}"),
            None => text,
        };
        let fee_rate = gateway.fee_rate();

        if let Some(id) = &trade.bracket_id {
            match gateway.get_bracket_status(&trade.pair, id).await {
                Ok(status) if status.state == BracketState::Filled => {
                    let exit_price = status.fill_price.unwrap_or(price);
                    let reason = match status.filled_leg {
                        Some(BracketLeg::TakeProfit) => CloseReason::ProfitTake,
                        _ => CloseReason::StopLoss,
                    };
                    let pnl = estimate_pnl(trade, exit_price, trade.quantity, fee_rate);
                    return self
                        .closer
                        .close(trade, price, exit_price, pnl, reason, detail("bracket filled before sweep".into()));
                }
                Ok(status) if status.state == BracketState::Active => {
                    if let Err(e) = gateway.cancel_bracket(&trade.pair, id).await {
                        return Ok(self.closer.exit_failed(trade, price, &e));
                    }
                    self.closer.clear_bracket(trade);
                }
                Ok(status) if status.is_terminal_without_fill() => self.closer.clear_bracket(trade),
                Ok(_) => {}
                Err(e) => return Ok(self.closer.exit_failed(trade, price, &e)),
            }
        }

        let available = match held_on_venue(gateway, trade, price).await {
            Ok(held) => held,
            Err(e) => return Ok(self.closer.exit_failed(trade, price, &e)),
        };

        if available.is_zero() {
            let pnl = estimate_pnl(trade, price, trade.quantity, fee_rate);
            return self.closer.close(
                trade,
                price,
                price,
                pnl,
                CloseReason::Orphan,
                detail("no inventory on exchange".into()),
            );
        }

        let lot = match gateway.get_lot_size(&trade.pair).await {
            Ok(lot) => lot,
            Err(e) => return Ok(self.closer.exit_failed(trade, price, &e)),
        };
        let quantity = lot.quantize(available);
        if lot.is_dust(quantity, price) {
            let pnl = estimate_pnl(trade, price, trade.quantity, fee_rate);
            return self.closer.close(
                trade,
                price,
                price,
                pnl,
                CloseReason::Dust,
                detail(format!("residual {available} below venue minimum")),
            );
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
                let pnl = estimate_pnl(trade, exit_price, executed, fee_rate);
                self.closer.close(
                    trade,
                    price,
                    exit_price,
                    pnl,
                    CloseReason::StaleCleanup,
                    detail(format!("stale cleanup order {}", fill.order_id)),
                )
            }
            Err(e) => Ok(self.closer.exit_failed(trade, price, &e)),
        }
    }

    /// Live price, or the best stand-in with a note for the audit detail:
    /// the gateway's last read, then the trade's latest audited price, then
    /// the entry price.
    async fn sweep_price(&self, gateway: &ExchangeGateway, trade: &Trade) -> (Decimal, Option<String>) {
        let err = match gateway.get_price(&trade.pair).await {
            Ok(price) => return (price, None),
            Err(e) => e,
        };
        let (price, source) = if let Some(last) = gateway.last_price(&trade.pair).await {
            (last, "last known price")
        } else if let Some(audited) = self.last_audited_price(trade) {
            (audited, "last audited price")
        } else {
            (trade.entry_price, "entry price")
        };
        warn!(trade_id = trade.id, %price, source, "Price unavailable: {}", err);
        (price, Some(format!("price unavailable, using {source} {price}")))
    }

    fn last_audited_price(&self, trade: &Trade) -> Option<Decimal> {
        let entries = self.closer.store().audit_entries(trade.id).ok()?;
        entries
            .iter()
            .rev()
            .map(|e| e.price_after.unwrap_or(e.price_before))
            .find(|price| *price > Decimal::ZERO)
    }
}
