//! Per-exchange pacing gate.
//!
//! Every call waits until the exchange's minimum interval has elapsed since
//! the previous permitted request, then adds a small random jitter. There is
//! no burst credit.

use super::types::Exchange;
use crate::config::Config;
use rand::Rng;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::trace;

pub struct RateLimiter {
    intervals: HashMap<Exchange, Duration>,
    jitter_ms: u64,
    /// Last permitted request per exchange. The per-key mutex is held while
    /// waiting, so callers on one exchange are serialized.
    last_request: HashMap<Exchange, Arc<Mutex<Option<Instant>>>>,
}

impl RateLimiter {
    pub fn new(intervals: HashMap<Exchange, Duration>, jitter_ms: u64) -> Self {
        let last_request = Exchange::ALL
            .iter()
            .map(|ex| (*ex, Arc::new(Mutex::new(None))))
            .collect();
        Self {
            intervals,
            jitter_ms,
            last_request,
        }
    }

    pub fn from_config(config: &Config) -> Self {
        let intervals = Exchange::ALL
            .iter()
            .map(|ex| (*ex, config.exchanges.get(*ex).min_request_interval()))
            .collect();
        Self::new(intervals, config.rate_limit.jitter_ms)
    }

    pub fn min_interval(&self, exchange: Exchange) -> Duration {
        self.intervals
            .get(&exchange)
            .copied()
            .unwrap_or(Duration::from_secs(1))
    }

    /// Block until this exchange may be called again.
    pub async fn await_slot(&self, exchange: Exchange) {
        let Some(slot) = self.last_request.get(&exchange) else {
            return;
        };
        let interval = self.min_interval(exchange);
        let jitter = if self.jitter_ms > 0 {
            Duration::from_millis(rand::thread_rng().gen_range(0..=self.jitter_ms))
        } else {
            Duration::ZERO
        };

        let mut last = slot.lock().await;
        if let Some(prev) = *last {
            let ready_at = prev + interval + jitter;
            let now = Instant::now();
            if ready_at > now {
                trace!(%exchange, wait_ms = (ready_at - now).as_millis() as u64, "Rate limit wait");
                tokio::time::sleep_until(ready_at).await;
            }
        }
        *last = Some(Instant::now());
    }
}
