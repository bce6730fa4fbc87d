//! SQLite persistence for trades and their audit trail.
//!
//! Tables:
//! - `trades`: one row per position, lifecycle enforced by a CHECK constraint
//! - `bot_runs`: additive per-run counters
//! - `audit_log`: append-only record of every close-related action
//! - `error_recovery`: one row per retry attempt
//!
//! Every commit point is a single-row insert or update. Multi-step closes are
//! guarded by a short lease (`claim_owner`, `claim_expires_at`) and the final
//! close is a compare-and-set on `status = 'open'`.

mod models;

pub use models::*;

use crate::error::ErrorKind;
use crate::exchange::{Direction, Exchange, Pair};
use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row};
use rust_decimal::Decimal;
use std::fmt::Display;
use std::path::Path;
use std::str::FromStr;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tracing::{debug, info};

const TRADE_COLUMNS: &str = "id, bot_id, run_id, pair, direction, exchange, sandbox, entry_price, \
     quantity, notional, leverage, target_profit, holding_for_profit, bracket_id, idempotency_key, \
     status, exit_price, pnl, close_reason, created_at, closed_at, telemetry, version";

/// Fixed-width RFC 3339 so stored timestamps compare lexically.
fn ts(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn parse_col<T>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T>
where
    T: FromStr,
    T::Err: Display,
{
    let raw: String = row.get(idx)?;
    raw.parse::<T>().map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, e.to_string().into())
    })
}

fn parse_opt_col<T>(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<T>>
where
    T: FromStr,
    T::Err: Display,
{
    let raw: Option<String> = row.get(idx)?;
    raw.map(|s| {
        s.parse::<T>().map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, e.to_string().into())
        })
    })
    .transpose()
}

fn parse_ts(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let raw: String = row.get(idx)?;
    DateTime::parse_from_rfc3339(&raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn row_to_trade(row: &Row<'_>) -> rusqlite::Result<Trade> {
    let status: String = row.get(15)?;
    let state = if status == "closed" {
        TradeState::Closed {
            exit_price: parse_col(row, 16)?,
            pnl: parse_col(row, 17)?,
            reason: parse_col(row, 18)?,
            closed_at: parse_ts(row, 20)?,
        }
    } else {
        TradeState::Open
    };

    let telemetry: Option<String> = row.get(21)?;

    Ok(Trade {
        id: row.get(0)?,
        bot_id: row.get(1)?,
        run_id: row.get(2)?,
        pair: parse_col(row, 3)?,
        direction: parse_col(row, 4)?,
        exchange: parse_col(row, 5)?,
        sandbox: row.get(6)?,
        entry_price: parse_col(row, 7)?,
        quantity: parse_col(row, 8)?,
        notional: parse_col(row, 9)?,
        leverage: row.get(10)?,
        target_profit: parse_col(row, 11)?,
        holding_for_profit: row.get(12)?,
        bracket_id: row.get(13)?,
        idempotency_key: row.get(14)?,
        created_at: parse_ts(row, 19)?,
        telemetry: telemetry.and_then(|t| serde_json::from_str(&t).ok()),
        version: row.get(22)?,
        state,
    })
}

fn row_to_audit(row: &Row<'_>) -> rusqlite::Result<AuditEntry> {
    Ok(AuditEntry {
        trade_id: row.get(0)?,
        action: parse_col(row, 1)?,
        exchange: parse_col(row, 2)?,
        pair: parse_col(row, 3)?,
        price_before: parse_col(row, 4)?,
        price_after: parse_opt_col(row, 5)?,
        fees: parse_col(row, 6)?,
        net_pnl: parse_opt_col(row, 7)?,
        success: row.get(8)?,
        detail: row.get(9)?,
        created_at: parse_ts(row, 10)?,
    })
}

fn row_to_bot_run(row: &Row<'_>) -> rusqlite::Result<BotRun> {
    Ok(BotRun {
        run_id: row.get(0)?,
        bot_id: row.get(1)?,
        total_pnl: parse_col(row, 2)?,
        trades_executed: row.get(3)?,
        wins: row.get(4)?,
        updated_at: parse_ts(row, 5)?,
    })
}

/// SQLite-backed store shared by the pipeline, exit manager and sweeper.
pub struct TradeStore {
    conn: Mutex<Connection>,
}

impl TradeStore {
    /// Open (or create) the database at `db_path`.
    pub fn new<P: AsRef<Path>>(db_path: P) -> Result<Self> {
        if let Some(parent) = db_path.as_ref().parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("Failed to create {:?}", parent))?;
            }
        }

        let conn = Connection::open(db_path.as_ref())
            .with_context(|| format!("Failed to open database at {:?}", db_path.as_ref()))?;

        let store = Self {
            conn: Mutex::new(conn),
        };
        store.init_schema()?;

        info!("Trade store initialized at {:?}", db_path.as_ref());
        Ok(store)
    }

    /// Private in-memory database, used by tests and dry runs.
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("Failed to open in-memory database")?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.init_schema()?;
        Ok(store)
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| anyhow!("trade store connection mutex poisoned"))
    }

    fn init_schema(&self) -> Result<()> {
        self.conn()?.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS trades (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                bot_id TEXT NOT NULL,
                run_id TEXT,
                pair TEXT NOT NULL,
                direction TEXT NOT NULL CHECK (direction IN ('long', 'short')),
                exchange TEXT NOT NULL,
                sandbox INTEGER NOT NULL,
                entry_price TEXT NOT NULL,
                quantity TEXT NOT NULL,
                notional TEXT NOT NULL,
                leverage INTEGER NOT NULL,
                target_profit TEXT NOT NULL,
                holding_for_profit INTEGER NOT NULL DEFAULT 0,
                bracket_id TEXT,
                idempotency_key TEXT NOT NULL UNIQUE,
                status TEXT NOT NULL DEFAULT 'open',
                exit_price TEXT,
                pnl TEXT,
                close_reason TEXT,
                created_at TEXT NOT NULL,
                closed_at TEXT,
                telemetry TEXT,
                version INTEGER NOT NULL DEFAULT 0,
                claim_owner TEXT,
                claim_expires_at TEXT,
                CHECK (
                    (status = 'open' AND exit_price IS NULL AND pnl IS NULL AND closed_at IS NULL)
                    OR
                    (status = 'closed' AND exit_price IS NOT NULL AND pnl IS NOT NULL AND closed_at IS NOT NULL)
                )
            );
            CREATE INDEX IF NOT EXISTS idx_trades_status ON trades(status, created_at);
            CREATE INDEX IF NOT EXISTS idx_trades_pair ON trades(pair, direction, sandbox, status);

            CREATE TABLE IF NOT EXISTS bot_runs (
                run_id TEXT PRIMARY KEY,
                bot_id TEXT NOT NULL,
                total_pnl TEXT NOT NULL,
                trades_executed INTEGER NOT NULL,
                wins INTEGER NOT NULL,
                updated_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS audit_log (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                trade_id INTEGER NOT NULL,
                action TEXT NOT NULL,
                exchange TEXT NOT NULL,
                pair TEXT NOT NULL,
                price_before TEXT NOT NULL,
                price_after TEXT,
                fees TEXT NOT NULL,
                net_pnl TEXT,
                success INTEGER NOT NULL,
                detail TEXT NOT NULL,
                created_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_audit_trade ON audit_log(trade_id);

            CREATE TABLE IF NOT EXISTS error_recovery (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                operation TEXT NOT NULL,
                exchange TEXT NOT NULL,
                reference TEXT,
                attempt INTEGER NOT NULL,
                error_kind TEXT,
                backoff_ms INTEGER NOT NULL,
                resolution TEXT NOT NULL,
                message TEXT,
                created_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_recovery_reference ON error_recovery(reference);
            "#,
        )?;

        debug!("Database schema initialized");
        Ok(())
    }

    // ==================== Trades ====================

    /// Insert a newly opened trade. Fails if the idempotency key is taken.
    pub fn insert_trade(&self, trade: &NewTrade) -> Result<i64> {
        let conn = self.conn()?;
        conn.execute(
            r#"
            INSERT INTO trades (bot_id, run_id, pair, direction, exchange, sandbox, entry_price,
                                quantity, notional, leverage, target_profit, bracket_id,
                                idempotency_key, created_at, telemetry)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)
            "#,
            params![
                trade.bot_id,
                trade.run_id,
                trade.pair.to_string(),
                trade.direction.as_str(),
                trade.exchange.as_str(),
                trade.sandbox,
                trade.entry_price.to_string(),
                trade.quantity.to_string(),
                trade.notional.to_string(),
                trade.leverage,
                trade.target_profit.to_string(),
                trade.bracket_id,
                trade.idempotency_key,
                ts(trade.opened_at),
                trade.telemetry.as_ref().map(|t| t.to_string()),
            ],
        )
        .with_context(|| format!("Failed to insert trade {}", trade.idempotency_key))?;

        Ok(conn.last_insert_rowid())
    }

    pub fn get_trade(&self, id: i64) -> Result<Option<Trade>> {
        let conn = self.conn()?;
        let trade = conn
            .query_row(
                &format!("SELECT {TRADE_COLUMNS} FROM trades WHERE id = ?1"),
                [id],
                row_to_trade,
            )
            .optional()?;
        Ok(trade)
    }

    pub fn find_by_idempotency_key(&self, key: &str) -> Result<Option<Trade>> {
        let conn = self.conn()?;
        let trade = conn
            .query_row(
                &format!("SELECT {TRADE_COLUMNS} FROM trades WHERE idempotency_key = ?1"),
                [key],
                row_to_trade,
            )
            .optional()?;
        Ok(trade)
    }

    pub fn open_trades(&self) -> Result<Vec<Trade>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {TRADE_COLUMNS} FROM trades WHERE status = 'open' ORDER BY created_at"
        ))?;
        let trades = stmt
            .query_map([], row_to_trade)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(trades)
    }

    /// Open trades created before `cutoff`, oldest first.
    pub fn open_trades_older_than(&self, cutoff: DateTime<Utc>, limit: u32) -> Result<Vec<Trade>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {TRADE_COLUMNS} FROM trades \
             WHERE status = 'open' AND created_at < ?1 ORDER BY created_at LIMIT ?2"
        ))?;
        let trades = stmt
            .query_map(params![ts(cutoff), limit], row_to_trade)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(trades)
    }

    pub fn count_open_by_exchange(&self, exchange: Exchange, sandbox: bool) -> Result<u32> {
        let conn = self.conn()?;
        let count: u32 = conn.query_row(
            "SELECT COUNT(*) FROM trades WHERE status = 'open' AND exchange = ?1 AND sandbox = ?2",
            params![exchange.as_str(), sandbox],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    /// Net P&L of the most recent closed trades, newest first.
    pub fn recent_closed_pnls(
        &self,
        pair: &Pair,
        direction: Direction,
        sandbox: bool,
        limit: u32,
    ) -> Result<Vec<Decimal>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT pnl FROM trades \
             WHERE status = 'closed' AND pair = ?1 AND direction = ?2 AND sandbox = ?3 \
             ORDER BY closed_at DESC, id DESC LIMIT ?4",
        )?;
        let pnls = stmt
            .query_map(
                params![pair.to_string(), direction.as_str(), sandbox, limit],
                |row| parse_col::<Decimal>(row, 0),
            )?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(pnls)
    }

    /// Most recent open time for a pair (optionally one direction).
    pub fn last_opened_at(
        &self,
        pair: &Pair,
        direction: Option<Direction>,
        sandbox: bool,
    ) -> Result<Option<DateTime<Utc>>> {
        let conn = self.conn()?;
        let raw: Option<String> = conn.query_row(
            "SELECT MAX(created_at) FROM trades \
             WHERE pair = ?1 AND sandbox = ?2 AND (?3 IS NULL OR direction = ?3)",
            params![pair.to_string(), sandbox, direction.map(|d| d.as_str())],
            |row| row.get(0),
        )?;
        Ok(raw
            .and_then(|s| DateTime::parse_from_rfc3339(&s).ok())
            .map(|dt| dt.with_timezone(&Utc)))
    }

    /// Win/total counts and P&L sums per direction for trades closed since
    /// `since`.
    pub fn direction_stats(
        &self,
        pair: &Pair,
        sandbox: bool,
        since: DateTime<Utc>,
    ) -> Result<DirectionStats> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT direction, pnl FROM trades \
             WHERE status = 'closed' AND pair = ?1 AND sandbox = ?2 AND closed_at >= ?3",
        )?;
        let rows = stmt
            .query_map(params![pair.to_string(), sandbox, ts(since)], |row| {
                Ok((parse_col::<Direction>(row, 0)?, parse_col::<Decimal>(row, 1)?))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        let mut stats = DirectionStats::default();
        for (direction, pnl) in rows {
            let (total, wins, win_pnl, loss_pnl) = match direction {
                Direction::Long => (
                    &mut stats.long_total,
                    &mut stats.long_wins,
                    &mut stats.long_win_pnl,
                    &mut stats.long_loss_pnl,
                ),
                Direction::Short => (
                    &mut stats.short_total,
                    &mut stats.short_wins,
                    &mut stats.short_win_pnl,
                    &mut stats.short_loss_pnl,
                ),
            };
            *total += 1;
            if pnl > Decimal::ZERO {
                *wins += 1;
                *win_pnl += pnl;
            } else {
                *loss_pnl -= pnl;
            }
        }
        Ok(stats)
    }

    pub fn set_holding_for_profit(&self, id: i64, holding: bool) -> Result<()> {
        self.conn()?.execute(
            "UPDATE trades SET holding_for_profit = ?1, version = version + 1 \
             WHERE id = ?2 AND status = 'open' AND holding_for_profit != ?1",
            params![holding, id],
        )?;
        Ok(())
    }

    pub fn set_bracket(&self, id: i64, bracket_id: Option<&str>) -> Result<()> {
        self.conn()?.execute(
            "UPDATE trades SET bracket_id = ?1, version = version + 1 WHERE id = ?2 AND status = 'open'",
            params![bracket_id, id],
        )?;
        Ok(())
    }

    /// Take the close lease on an open trade. Returns false if another owner
    /// holds an unexpired lease or the trade is no longer open.
    pub fn try_claim(&self, id: i64, owner: &str, lease: Duration) -> Result<bool> {
        let now = Utc::now();
        let expires = now + chrono::Duration::from_std(lease).unwrap_or(chrono::Duration::seconds(60));
        let changed = self.conn()?.execute(
            "UPDATE trades SET claim_owner = ?1, claim_expires_at = ?2, version = version + 1 \
             WHERE id = ?3 AND status = 'open' \
               AND (claim_owner IS NULL OR claim_owner = ?1 OR claim_expires_at < ?4)",
            params![owner, ts(expires), id, ts(now)],
        )?;
        Ok(changed == 1)
    }

    pub fn release_claim(&self, id: i64, owner: &str) -> Result<()> {
        self.conn()?.execute(
            "UPDATE trades SET claim_owner = NULL, claim_expires_at = NULL \
             WHERE id = ?1 AND claim_owner = ?2",
            params![id, owner],
        )?;
        Ok(())
    }

    /// Close an open trade. Compare-and-set: succeeds only if the trade is
    /// still open and unclaimed, claimed by `owner`, or the lease expired.
    pub fn close_trade(&self, id: i64, owner: Option<&str>, record: &CloseRecord) -> Result<bool> {
        let now = Utc::now();
        let changed = self.conn()?.execute(
            "UPDATE trades SET status = 'closed', exit_price = ?1, pnl = ?2, close_reason = ?3, \
                    closed_at = ?4, holding_for_profit = 0, claim_owner = NULL, \
                    claim_expires_at = NULL, version = version + 1 \
             WHERE id = ?5 AND status = 'open' \
               AND (claim_owner IS NULL OR claim_owner = ?6 OR claim_expires_at < ?4)",
            params![
                record.exit_price.to_string(),
                record.pnl.to_string(),
                record.reason.as_str(),
                ts(now),
                id,
                owner,
            ],
        )?;
        Ok(changed == 1)
    }

    // ==================== Audit log ====================

    pub fn append_audit(&self, entry: &AuditEntry) -> Result<i64> {
        let conn = self.conn()?;
        conn.execute(
            r#"
            INSERT INTO audit_log (trade_id, action, exchange, pair, price_before, price_after,
                                   fees, net_pnl, success, detail, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
            "#,
            params![
                entry.trade_id,
                entry.action.as_str(),
                entry.exchange.as_str(),
                entry.pair.to_string(),
                entry.price_before.to_string(),
                entry.price_after.map(|p| p.to_string()),
                entry.fees.to_string(),
                entry.net_pnl.map(|p| p.to_string()),
                entry.success,
                entry.detail,
                ts(entry.created_at),
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub fn audit_entries(&self, trade_id: i64) -> Result<Vec<AuditEntry>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT trade_id, action, exchange, pair, price_before, price_after, fees, net_pnl, \
                    success, detail, created_at \
             FROM audit_log WHERE trade_id = ?1 ORDER BY id",
        )?;
        let entries = stmt
            .query_map([trade_id], row_to_audit)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(entries)
    }

    // ==================== Bot runs ====================

    /// Create an empty run row if none exists yet.
    pub fn ensure_bot_run(&self, run_id: &str, bot_id: &str) -> Result<()> {
        self.conn()?.execute(
            "INSERT OR IGNORE INTO bot_runs (run_id, bot_id, total_pnl, trades_executed, wins, updated_at) \
             VALUES (?1, ?2, '0', 0, 0, ?3)",
            params![run_id, bot_id, ts(Utc::now())],
        )?;
        Ok(())
    }

    /// Add one closed trade to a run's counters, creating the run if needed.
    pub fn record_bot_run_close(&self, run_id: &str, bot_id: &str, pnl: Decimal) -> Result<()> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;

        let current: Option<String> = tx
            .query_row(
                "SELECT total_pnl FROM bot_runs WHERE run_id = ?1",
                [run_id],
                |row| row.get(0),
            )
            .optional()?;
        let total = current
            .map(|s| Decimal::from_str(&s).unwrap_or_default())
            .unwrap_or_default()
            + pnl;
        let win = u32::from(pnl > Decimal::ZERO);

        tx.execute(
            r#"
            INSERT INTO bot_runs (run_id, bot_id, total_pnl, trades_executed, wins, updated_at)
            VALUES (?1, ?2, ?3, 1, ?4, ?5)
            ON CONFLICT(run_id) DO UPDATE SET
                total_pnl = ?3,
                trades_executed = trades_executed + 1,
                wins = wins + ?4,
                updated_at = ?5
            "#,
            params![run_id, bot_id, total.to_string(), win, ts(Utc::now())],
        )?;
        tx.commit()?;
        Ok(())
    }

    pub fn get_bot_run(&self, run_id: &str) -> Result<Option<BotRun>> {
        let conn = self.conn()?;
        let run = conn
            .query_row(
                "SELECT run_id, bot_id, total_pnl, trades_executed, wins, updated_at \
                 FROM bot_runs WHERE run_id = ?1",
                [run_id],
                row_to_bot_run,
            )
            .optional()?;
        Ok(run)
    }

    pub fn bot_runs(&self) -> Result<Vec<BotRun>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT run_id, bot_id, total_pnl, trades_executed, wins, updated_at \
             FROM bot_runs ORDER BY updated_at DESC",
        )?;
        let runs = stmt
            .query_map([], row_to_bot_run)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(runs)
    }

    // ==================== Error recovery ====================

    pub fn insert_recovery(&self, attempt: &RecoveryAttempt) -> Result<i64> {
        let conn = self.conn()?;
        conn.execute(
            r#"
            INSERT INTO error_recovery (operation, exchange, reference, attempt, error_kind,
                                        backoff_ms, resolution, message, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
            "#,
            params![
                attempt.operation,
                attempt.exchange.as_str(),
                attempt.reference,
                attempt.attempt,
                attempt.error_kind.map(|k| k.as_str()),
                attempt.backoff_ms,
                attempt.resolution.as_str(),
                attempt.message,
                ts(attempt.created_at),
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// Attempts for one operation reference, in insertion order.
    pub fn recovery_attempts(&self, reference: &str) -> Result<Vec<RecoveryAttempt>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT operation, exchange, reference, attempt, error_kind, backoff_ms, resolution, \
                    message, created_at \
             FROM error_recovery WHERE reference = ?1 ORDER BY id",
        )?;
        let attempts = stmt
            .query_map([reference], |row| {
                Ok(RecoveryAttempt {
                    operation: row.get(0)?,
                    exchange: parse_col(row, 1)?,
                    reference: row.get(2)?,
                    attempt: row.get(3)?,
                    error_kind: parse_opt_col::<ErrorKind>(row, 4)?,
                    backoff_ms: row.get(5)?,
                    resolution: parse_col(row, 6)?,
                    message: row.get(7)?,
                    created_at: parse_ts(row, 8)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(attempts)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    pub(crate) fn sample_trade(key: &str) -> NewTrade {
        NewTrade {
            bot_id: "bot-1".to_string(),
            run_id: Some("run-1".to_string()),
            pair: Pair::new("BTC", "USDT"),
            direction: Direction::Long,
            exchange: Exchange::Binance,
            sandbox: true,
            entry_price: dec!(50000),
            quantity: dec!(0.0004),
            notional: dec!(20),
            leverage: 1,
            target_profit: dec!(0.5),
            bracket_id: None,
            idempotency_key: key.to_string(),
            telemetry: Some(serde_json::json!({"attempts": 1})),
            opened_at: Utc::now(),
        }
    }

    fn close(reason: CloseReason, pnl: Decimal) -> CloseRecord {
        CloseRecord {
            exit_price: dec!(51000),
            pnl,
            reason,
        }
    }

    #[test]
    fn test_insert_and_load_trade() {
        let store = TradeStore::in_memory().unwrap();
        let id = store.insert_trade(&sample_trade("k1")).unwrap();

        let trade = store.get_trade(id).unwrap().unwrap();
        assert!(trade.is_open());
        assert_eq!(trade.pair, Pair::new("BTC", "USDT"));
        assert_eq!(trade.exit_price(), None);
        assert_eq!(trade.pnl(), None);
        assert_eq!(trade.telemetry, Some(serde_json::json!({"attempts": 1})));
    }

    #[test]
    fn test_duplicate_idempotency_key_rejected() {
        let store = TradeStore::in_memory().unwrap();
        store.insert_trade(&sample_trade("same")).unwrap();
        assert!(store.insert_trade(&sample_trade("same")).is_err());
        assert_eq!(store.open_trades().unwrap().len(), 1);
    }

    #[test]
    fn test_close_sets_exit_fields_once() {
        let store = TradeStore::in_memory().unwrap();
        let id = store.insert_trade(&sample_trade("k1")).unwrap();

        assert!(store.close_trade(id, None, &close(CloseReason::ProfitTake, dec!(0.4))).unwrap());
        // Second close is a no-op
        assert!(!store.close_trade(id, None, &close(CloseReason::Orphan, dec!(0))).unwrap());

        let trade = store.get_trade(id).unwrap().unwrap();
        assert_eq!(trade.status(), "closed");
        assert_eq!(trade.exit_price(), Some(dec!(51000)));
        assert_eq!(trade.close_reason(), Some(CloseReason::ProfitTake));
    }

    #[test]
    fn test_check_constraint_rejects_half_closed_rows() {
        let store = TradeStore::in_memory().unwrap();
        let id = store.insert_trade(&sample_trade("k1")).unwrap();
        let conn = store.conn().unwrap();
        let result = conn.execute(
            "UPDATE trades SET exit_price = '1' WHERE id = ?1",
            [id],
        );
        assert!(result.is_err());
        let result = conn.execute("UPDATE trades SET status = 'closed' WHERE id = ?1", [id]);
        assert!(result.is_err());
    }

    #[test]
    fn test_claim_blocks_other_owner() {
        let store = TradeStore::in_memory().unwrap();
        let id = store.insert_trade(&sample_trade("k1")).unwrap();

        assert!(store.try_claim(id, "exit", Duration::from_secs(60)).unwrap());
        assert!(!store.try_claim(id, "sweeper", Duration::from_secs(60)).unwrap());
        // Sweeper cannot close while the exit manager holds the lease
        assert!(!store
            .close_trade(id, Some("sweeper"), &close(CloseReason::Orphan, dec!(0)))
            .unwrap());
        assert!(store
            .close_trade(id, Some("exit"), &close(CloseReason::ProfitTake, dec!(1)))
            .unwrap());
    }

    #[test]
    fn test_released_claim_can_be_retaken() {
        let store = TradeStore::in_memory().unwrap();
        let id = store.insert_trade(&sample_trade("k1")).unwrap();
        assert!(store.try_claim(id, "a", Duration::from_secs(60)).unwrap());
        store.release_claim(id, "a").unwrap();
        assert!(store.try_claim(id, "b", Duration::from_secs(60)).unwrap());
    }

    #[test]
    fn test_recent_closed_pnls_newest_first() {
        let store = TradeStore::in_memory().unwrap();
        for (i, pnl) in [dec!(1), dec!(-0.2), dec!(-0.3)].iter().enumerate() {
            let id = store.insert_trade(&sample_trade(&format!("k{i}"))).unwrap();
            store
                .close_trade(id, None, &close(CloseReason::StopLoss, *pnl))
                .unwrap();
        }
        let pnls = store
            .recent_closed_pnls(&Pair::new("BTC", "USDT"), Direction::Long, true, 10)
            .unwrap();
        assert_eq!(pnls, vec![dec!(-0.3), dec!(-0.2), dec!(1)]);
    }

    #[test]
    fn test_direction_stats() {
        let store = TradeStore::in_memory().unwrap();
        let mut short = sample_trade("s1");
        short.direction = Direction::Short;
        let sid = store.insert_trade(&short).unwrap();
        store.close_trade(sid, None, &close(CloseReason::ProfitTake, dec!(0.5))).unwrap();
        let lid = store.insert_trade(&sample_trade("l1")).unwrap();
        store.close_trade(lid, None, &close(CloseReason::StopLoss, dec!(-0.5))).unwrap();

        let stats = store
            .direction_stats(&Pair::new("BTC", "USDT"), true, Utc::now() - chrono::Duration::days(1))
            .unwrap();
        assert_eq!(stats.win_rate(Direction::Short), Some(dec!(1)));
        assert_eq!(stats.win_rate(Direction::Long), Some(dec!(0)));
    }

    #[test]
    fn test_win_loss_ratio_from_closed_pnl() {
        let store = TradeStore::in_memory().unwrap();
        for (key, pnl) in [("w1", dec!(1.2)), ("w2", dec!(0.8)), ("l1", dec!(-0.5))] {
            let id = store.insert_trade(&sample_trade(key)).unwrap();
            store.close_trade(id, None, &close(CloseReason::ProfitTake, pnl)).unwrap();
        }
        let mut short = sample_trade("s1");
        short.direction = Direction::Short;
        let sid = store.insert_trade(&short).unwrap();
        store.close_trade(sid, None, &close(CloseReason::ProfitTake, dec!(0.3))).unwrap();

        let stats = store
            .direction_stats(&Pair::new("BTC", "USDT"), true, Utc::now() - chrono::Duration::days(1))
            .unwrap();
        assert_eq!(stats.long_win_pnl, dec!(2.0));
        assert_eq!(stats.long_loss_pnl, dec!(0.5));
        // avg win 1.0 over avg loss 0.5
        assert_eq!(stats.win_loss_ratio(Direction::Long), Some(dec!(2)));
        // No losses yet
        assert_eq!(stats.win_loss_ratio(Direction::Short), None);
    }

    #[test]
    fn test_bot_run_is_additive() {
        let store = TradeStore::in_memory().unwrap();
        store.ensure_bot_run("run-1", "bot-1").unwrap();
        assert_eq!(store.get_bot_run("run-1").unwrap().unwrap().trades_executed, 0);
        store.record_bot_run_close("run-1", "bot-1", dec!(1.5)).unwrap();
        store.record_bot_run_close("run-1", "bot-1", dec!(-0.5)).unwrap();

        let run = store.get_bot_run("run-1").unwrap().unwrap();
        assert_eq!(run.total_pnl, dec!(1.0));
        assert_eq!(run.trades_executed, 2);
        assert_eq!(run.wins, 1);
        assert_eq!(run.hit_rate(), dec!(0.5));
    }

    #[test]
    fn test_open_trades_older_than() {
        let store = TradeStore::in_memory().unwrap();
        let mut old = sample_trade("old");
        old.opened_at = Utc::now() - chrono::Duration::hours(72);
        store.insert_trade(&old).unwrap();
        store.insert_trade(&sample_trade("new")).unwrap();

        let stale = store
            .open_trades_older_than(Utc::now() - chrono::Duration::hours(48), 100)
            .unwrap();
        assert_eq!(stale.len(), 1);
        assert_eq!(stale[0].idempotency_key, "old");
    }
}
