//! Retry/recovery controller.
//!
//! `ATTEMPTING -> SUCCESS | RETRYING -> ATTEMPTING | FAILED`. Failures are
//! classified by [`ErrorKind`]; retryable kinds back off exponentially with a
//! cap and jitter, terminal kinds fail immediately. Once an operation has
//! failed at least once, every attempt and the final outcome are written to
//! the `error_recovery` table. A rejected duplicate idempotency key can be
//! left for the caller to resolve, in which case the caller records the
//! final row after looking up the original order.

use super::types::Exchange;
use crate::config::RetryConfig;
use crate::error::ExchangeError;
use crate::persistence::{RecoveryAttempt, Resolution, TradeStore};
use crate::utils::to_f64;
use chrono::Utc;
use rand::Rng;
use rust_decimal::Decimal;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Fraction of the backoff applied as +/- jitter
    pub jitter: Decimal,
}

impl RetryPolicy {
    pub fn from_config(config: &RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts,
            base_delay: Duration::from_millis(config.base_delay_ms),
            max_delay: Duration::from_millis(config.max_delay_ms),
            jitter: config.jitter,
        }
    }

    /// Backoff after failed attempt `attempt` (1-based), without jitter.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        let factor = 1u64 << exponent;
        let millis = (self.base_delay.as_millis() as u64).saturating_mul(factor);
        Duration::from_millis(millis).min(self.max_delay)
    }

    /// Backoff with uniform jitter in `[-jitter, +jitter]` of the base value.
    pub fn jittered_backoff(&self, attempt: u32) -> Duration {
        let base = self.backoff(attempt);
        let jitter = to_f64(self.jitter).clamp(0.0, 1.0);
        if jitter == 0.0 {
            return base;
        }
        let factor = 1.0 + rand::thread_rng().gen_range(-jitter..=jitter);
        base.mul_f64(factor)
    }
}

/// What an attempt history row belongs to.
#[derive(Debug, Clone)]
pub struct RetryContext {
    pub operation: &'static str,
    pub exchange: Exchange,
    pub reference: Option<String>,
    /// Caller resolves duplicate-key rejections itself
    pub resolves_duplicates: bool,
}

impl RetryContext {
    pub fn new(operation: &'static str, exchange: Exchange) -> Self {
        Self {
            operation,
            exchange,
            reference: None,
            resolves_duplicates: false,
        }
    }

    pub fn with_reference(mut self, reference: impl Into<String>) -> Self {
        self.reference = Some(reference.into());
        self
    }

    pub fn resolving_duplicates(mut self) -> Self {
        self.resolves_duplicates = true;
        self
    }
}

#[derive(Clone)]
pub struct RetryController {
    policy: RetryPolicy,
    store: Option<Arc<TradeStore>>,
}

impl RetryController {
    pub fn new(policy: RetryPolicy, store: Option<Arc<TradeStore>>) -> Self {
        Self { policy, store }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Run `op` until it succeeds, fails terminally, or the attempt ceiling
    /// is reached.
    pub async fn run<T, F, Fut>(&self, ctx: &RetryContext, op: F) -> Result<T, ExchangeError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ExchangeError>>,
    {
        self.run_counted(ctx, op).await.0
    }

    /// Like [`run`](Self::run), also returning the number of attempts made.
    pub async fn run_counted<T, F, Fut>(
        &self,
        ctx: &RetryContext,
        mut op: F,
    ) -> (Result<T, ExchangeError>, u32)
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ExchangeError>>,
    {
        let max_attempts = self.policy.max_attempts.max(1);
        let mut failed_before = false;
        let mut attempt = 1;

        loop {
            match op().await {
                Ok(value) => {
                    if failed_before {
                        info!(
                            operation = ctx.operation,
                            exchange = %ctx.exchange,
                            attempt,
                            "Recovered after retry"
                        );
                        self.record(ctx, attempt, None, 0, Resolution::Success, None);
                    }
                    return (Ok(value), attempt);
                }
                Err(err) if err.is_retryable() && attempt < max_attempts => {
                    let backoff = self.policy.jittered_backoff(attempt);
                    warn!(
                        operation = ctx.operation,
                        exchange = %ctx.exchange,
                        attempt,
                        kind = %err.kind,
                        backoff_ms = backoff.as_millis() as u64,
                        "Retrying after error: {}",
                        err.message
                    );
                    self.record(
                        ctx,
                        attempt,
                        Some(&err),
                        backoff.as_millis() as u64,
                        Resolution::Retrying,
                        Some(err.message.clone()),
                    );
                    failed_before = true;
                    tokio::time::sleep(backoff).await;
                    attempt += 1;
                }
                Err(err) if err.duplicate_order && ctx.resolves_duplicates => {
                    warn!(
                        operation = ctx.operation,
                        exchange = %ctx.exchange,
                        attempt,
                        "Duplicate key rejected, caller resolves: {}",
                        err.message
                    );
                    return (Err(err), attempt);
                }
                Err(err) => {
                    error!(
                        operation = ctx.operation,
                        exchange = %ctx.exchange,
                        attempt,
                        kind = %err.kind,
                        "Operation failed: {}",
                        err.message
                    );
                    self.record(
                        ctx,
                        attempt,
                        Some(&err),
                        0,
                        Resolution::Failed,
                        Some(err.message.clone()),
                    );
                    return (Err(err), attempt);
                }
            }
        }
    }

    /// Final row for an operation whose outcome was settled by the caller.
    pub fn record_resolution(
        &self,
        ctx: &RetryContext,
        attempt: u32,
        err: Option<&ExchangeError>,
        resolution: Resolution,
        message: impl Into<String>,
    ) {
        self.record(ctx, attempt, err, 0, resolution, Some(message.into()));
    }

    fn record(
        &self,
        ctx: &RetryContext,
        attempt: u32,
        err: Option<&ExchangeError>,
        backoff_ms: u64,
        resolution: Resolution,
        message: Option<String>,
    ) {
        let Some(store) = &self.store else {
            return;
        };
        let row = RecoveryAttempt {
            operation: ctx.operation.to_string(),
            exchange: ctx.exchange,
            reference: ctx.reference.clone(),
            attempt,
            error_kind: err.map(|e| e.kind),
            backoff_ms,
            resolution,
            message,
            created_at: Utc::now(),
        };
        if let Err(e) = store.insert_recovery(&row) {
            warn!(operation = ctx.operation, "Failed to record retry attempt: {:#}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use rust_decimal_macros::dec;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tokio::time::Instant;

    fn policy(jitter: Decimal) -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            jitter,
        }
    }

    #[test]
    fn test_backoff_is_monotonic_and_capped() {
        let policy = RetryPolicy {
            max_attempts: 12,
            ..policy(dec!(0))
        };
        let delays: Vec<_> = (1..=12).map(|a| policy.backoff(a)).collect();
        assert_eq!(delays[0], Duration::from_secs(1));
        assert_eq!(delays[1], Duration::from_secs(2));
        assert_eq!(delays[5], Duration::from_secs(32));
        assert!(delays.windows(2).all(|w| w[0] <= w[1]));
        assert!(delays.iter().all(|d| *d <= Duration::from_secs(60)));
        assert_eq!(delays[11], Duration::from_secs(60));
    }

    #[test]
    fn test_jitter_stays_within_band() {
        let policy = policy(dec!(0.2));
        for _ in 0..100 {
            let d = policy.jittered_backoff(2);
            assert!(d >= Duration::from_millis(1600) && d <= Duration::from_millis(2400));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_retryable_errors_then_success() {
        let store = Arc::new(TradeStore::in_memory().unwrap());
        let controller = RetryController::new(policy(dec!(0)), Some(Arc::clone(&store)));
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let ctx = RetryContext::new("place_market_order", Exchange::Binance).with_reference("k1");

        let start = Instant::now();
        let result = controller
            .run(&ctx, move || async move {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(ExchangeError::new(Exchange::Binance, ErrorKind::RateLimit, "429"))
                } else {
                    Ok(42)
                }
            })
            .await;

        assert_eq!(result.unwrap(), 42);
        assert!(start.elapsed() >= Duration::from_secs(3));

        let rows = store.recovery_attempts("k1").unwrap();
        let resolutions: Vec<_> = rows.iter().map(|r| r.resolution).collect();
        assert_eq!(
            resolutions,
            vec![Resolution::Retrying, Resolution::Retrying, Resolution::Success]
        );
        assert_eq!(rows[0].error_kind, Some(ErrorKind::RateLimit));
        assert_eq!(rows[1].backoff_ms, 2000);
    }

    #[tokio::test(start_paused = true)]
    async fn test_terminal_error_is_not_retried() {
        let controller = RetryController::new(policy(dec!(0)), None);
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let ctx = RetryContext::new("place_market_order", Exchange::GateIo);

        let result: Result<(), _> = controller
            .run(&ctx, move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(ExchangeError::new(
                    Exchange::GateIo,
                    ErrorKind::InsufficientBalance,
                    "BALANCE_NOT_ENOUGH",
                ))
            })
            .await;

        assert_eq!(result.unwrap_err().kind, ErrorKind::InsufficientBalance);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_gives_up_after_max_attempts() {
        let store = Arc::new(TradeStore::in_memory().unwrap());
        let controller = RetryController::new(policy(dec!(0)), Some(Arc::clone(&store)));
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let ctx = RetryContext::new("get_price", Exchange::Binance).with_reference("px");

        let result: Result<(), _> = controller
            .run(&ctx, move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(ExchangeError::new(Exchange::Binance, ErrorKind::Timeout, "timed out"))
            })
            .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        let rows = store.recovery_attempts("px").unwrap();
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[2].resolution, Resolution::Failed);
        assert_eq!(rows[2].attempt, 3);
    }
}
