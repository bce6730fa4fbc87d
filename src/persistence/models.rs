//! Records owned by the store.

use crate::error::ErrorKind;
use crate::exchange::{Direction, Exchange, Pair};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Why a trade was closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CloseReason {
    /// Net P&L reached the target (market exit or take-profit leg)
    ProfitTake,
    StopLoss,
    TimeExit,
    /// Exit manager forced a market exit on an over-age position
    StaleClose,
    /// Sweeper sold an over-age position that still held inventory
    StaleCleanup,
    /// Nothing left to sell exchange-side
    Orphan,
    /// Remaining quantity below the venue minimum
    Dust,
}

impl CloseReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            CloseReason::ProfitTake => "profit_take",
            CloseReason::StopLoss => "stop_loss",
            CloseReason::TimeExit => "time_exit",
            CloseReason::StaleClose => "stale_close",
            CloseReason::StaleCleanup => "stale_cleanup",
            CloseReason::Orphan => "orphan",
            CloseReason::Dust => "dust",
        }
    }
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CloseReason {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "profit_take" => CloseReason::ProfitTake,
            "stop_loss" => CloseReason::StopLoss,
            "time_exit" => CloseReason::TimeExit,
            "stale_close" => CloseReason::StaleClose,
            "stale_cleanup" => CloseReason::StaleCleanup,
            "orphan" => CloseReason::Orphan,
            "dust" => CloseReason::Dust,
            other => return Err(format!("unknown close reason: {other}")),
        })
    }
}

/// Lifecycle state. Exit price and P&L exist only once closed.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum TradeState {
    Open,
    Closed {
        exit_price: Decimal,
        pnl: Decimal,
        closed_at: DateTime<Utc>,
        reason: CloseReason,
    },
}

/// A position opened by the engine.
#[derive(Debug, Clone, Serialize)]
pub struct Trade {
    pub id: i64,
    pub bot_id: String,
    pub run_id: Option<String>,
    pub pair: Pair,
    pub direction: Direction,
    pub exchange: Exchange,
    pub sandbox: bool,
    pub entry_price: Decimal,
    pub quantity: Decimal,
    /// Margin committed in quote currency
    pub notional: Decimal,
    pub leverage: u32,
    pub target_profit: Decimal,
    pub holding_for_profit: bool,
    pub bracket_id: Option<String>,
    pub idempotency_key: String,
    pub created_at: DateTime<Utc>,
    pub telemetry: Option<serde_json::Value>,
    pub version: i64,
    pub state: TradeState,
}

impl Trade {
    pub fn is_open(&self) -> bool {
        matches!(self.state, TradeState::Open)
    }

    pub fn status(&self) -> &'static str {
        match self.state {
            TradeState::Open => "open",
            TradeState::Closed { .. } => "closed",
        }
    }

    pub fn exit_price(&self) -> Option<Decimal> {
        match self.state {
            TradeState::Open => None,
            TradeState::Closed { exit_price, .. } => Some(exit_price),
        }
    }

    pub fn pnl(&self) -> Option<Decimal> {
        match self.state {
            TradeState::Open => None,
            TradeState::Closed { pnl, .. } => Some(pnl),
        }
    }

    pub fn close_reason(&self) -> Option<CloseReason> {
        match self.state {
            TradeState::Open => None,
            TradeState::Closed { reason, .. } => Some(reason),
        }
    }

    pub fn age_hours(&self, now: DateTime<Utc>) -> i64 {
        (now - self.created_at).num_hours()
    }
}

/// Insert payload for a freshly opened trade.
#[derive(Debug, Clone)]
pub struct NewTrade {
    pub bot_id: String,
    pub run_id: Option<String>,
    pub pair: Pair,
    pub direction: Direction,
    pub exchange: Exchange,
    pub sandbox: bool,
    pub entry_price: Decimal,
    pub quantity: Decimal,
    pub notional: Decimal,
    pub leverage: u32,
    pub target_profit: Decimal,
    pub bracket_id: Option<String>,
    pub idempotency_key: String,
    pub telemetry: Option<serde_json::Value>,
    pub opened_at: DateTime<Utc>,
}

/// Close payload.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CloseRecord {
    pub exit_price: Decimal,
    pub pnl: Decimal,
    pub reason: CloseReason,
}

/// Consequential actions written to the audit trail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditAction {
    ProfitTake,
    StopLoss,
    TimeExit,
    StaleClose,
    StaleCleanup,
    Orphan,
    DustClose,
    DustHold,
    ExitFailed,
    NeedsReview,
}

impl AuditAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditAction::ProfitTake => "profit_take",
            AuditAction::StopLoss => "stop_loss",
            AuditAction::TimeExit => "time_exit",
            AuditAction::StaleClose => "stale_close",
            AuditAction::StaleCleanup => "stale_cleanup",
            AuditAction::Orphan => "orphan",
            AuditAction::DustClose => "dust_close",
            AuditAction::DustHold => "dust_hold",
            AuditAction::ExitFailed => "exit_failed",
            AuditAction::NeedsReview => "needs_review",
        }
    }
}

impl From<CloseReason> for AuditAction {
    fn from(reason: CloseReason) -> Self {
        match reason {
            CloseReason::ProfitTake => AuditAction::ProfitTake,
            CloseReason::StopLoss => AuditAction::StopLoss,
            CloseReason::TimeExit => AuditAction::TimeExit,
            CloseReason::StaleClose => AuditAction::StaleClose,
            CloseReason::StaleCleanup => AuditAction::StaleCleanup,
            CloseReason::Orphan => AuditAction::Orphan,
            CloseReason::Dust => AuditAction::DustClose,
        }
    }
}

impl FromStr for AuditAction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "profit_take" => AuditAction::ProfitTake,
            "stop_loss" => AuditAction::StopLoss,
            "time_exit" => AuditAction::TimeExit,
            "stale_close" => AuditAction::StaleClose,
            "stale_cleanup" => AuditAction::StaleCleanup,
            "orphan" => AuditAction::Orphan,
            "dust_close" => AuditAction::DustClose,
            "dust_hold" => AuditAction::DustHold,
            "exit_failed" => AuditAction::ExitFailed,
            "needs_review" => AuditAction::NeedsReview,
            other => return Err(format!("unknown audit action: {other}")),
        })
    }
}

/// Append-only audit record.
#[derive(Debug, Clone, Serialize)]
pub struct AuditEntry {
    pub trade_id: i64,
    pub action: AuditAction,
    pub exchange: Exchange,
    pub pair: Pair,
    pub price_before: Decimal,
    pub price_after: Option<Decimal>,
    pub fees: Decimal,
    pub net_pnl: Option<Decimal>,
    pub success: bool,
    pub detail: String,
    pub created_at: DateTime<Utc>,
}

/// Aggregate counters for one bot run.
#[derive(Debug, Clone, Serialize)]
pub struct BotRun {
    pub run_id: String,
    pub bot_id: String,
    pub total_pnl: Decimal,
    pub trades_executed: u32,
    pub wins: u32,
    pub updated_at: DateTime<Utc>,
}

impl BotRun {
    pub fn hit_rate(&self) -> Decimal {
        if self.trades_executed == 0 {
            Decimal::ZERO
        } else {
            Decimal::from(self.wins) / Decimal::from(self.trades_executed)
        }
    }
}

/// Outcome of one retry attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Resolution {
    Retrying,
    Success,
    Failed,
}

impl Resolution {
    pub fn as_str(&self) -> &'static str {
        match self {
            Resolution::Retrying => "retrying",
            Resolution::Success => "success",
            Resolution::Failed => "failed",
        }
    }
}

impl FromStr for Resolution {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "retrying" => Ok(Resolution::Retrying),
            "success" => Ok(Resolution::Success),
            "failed" => Ok(Resolution::Failed),
            other => Err(format!("unknown resolution: {other}")),
        }
    }
}

/// One row per retry attempt.
#[derive(Debug, Clone, Serialize)]
pub struct RecoveryAttempt {
    pub operation: String,
    pub exchange: Exchange,
    /// Idempotency key or trade id the attempt belongs to
    pub reference: Option<String>,
    pub attempt: u32,
    pub error_kind: Option<ErrorKind>,
    pub backoff_ms: u64,
    pub resolution: Resolution,
    pub message: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Per-direction outcome counts over a lookback window.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DirectionStats {
    pub long_wins: u32,
    pub long_total: u32,
    pub short_wins: u32,
    pub short_total: u32,
    /// Summed P&L of winning trades
    pub long_win_pnl: Decimal,
    /// Summed magnitude of losing trades
    pub long_loss_pnl: Decimal,
    pub short_win_pnl: Decimal,
    pub short_loss_pnl: Decimal,
}

impl DirectionStats {
    pub fn win_rate(&self, direction: Direction) -> Option<Decimal> {
        let (wins, total) = match direction {
            Direction::Long => (self.long_wins, self.long_total),
            Direction::Short => (self.short_wins, self.short_total),
        };
        (total > 0).then(|| Decimal::from(wins) / Decimal::from(total))
    }

    /// Average win over average loss. `None` until the window holds at
    /// least one win and one loss.
    pub fn win_loss_ratio(&self, direction: Direction) -> Option<Decimal> {
        let (wins, total, win_pnl, loss_pnl) = match direction {
            Direction::Long => (self.long_wins, self.long_total, self.long_win_pnl, self.long_loss_pnl),
            Direction::Short => {
                (self.short_wins, self.short_total, self.short_win_pnl, self.short_loss_pnl)
            }
        };
        let losses = total - wins;
        if wins == 0 || losses == 0 || loss_pnl <= Decimal::ZERO {
            return None;
        }
        let avg_win = win_pnl / Decimal::from(wins);
        let avg_loss = loss_pnl / Decimal::from(losses);
        Some(avg_win / avg_loss)
    }

    pub fn samples(&self, direction: Direction) -> u32 {
        match direction {
            Direction::Long => self.long_total,
            Direction::Short => self.short_total,
        }
    }
}
