//! Process-local lot-size cache with explicit TTL eviction.

use super::types::{Exchange, LotSize, Pair};
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::time::Instant;

pub struct LotSizeCache {
    ttl: Duration,
    entries: RwLock<HashMap<(Exchange, Pair), (LotSize, Instant)>>,
}

impl LotSizeCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// Cached entry, if present and younger than the TTL.
    pub async fn get(&self, exchange: Exchange, pair: &Pair) -> Option<LotSize> {
        let entries = self.entries.read().await;
        entries
            .get(&(exchange, pair.clone()))
            .filter(|(_, stored_at)| stored_at.elapsed() < self.ttl)
            .map(|(lot, _)| *lot)
    }

    pub async fn insert(&self, exchange: Exchange, pair: &Pair, lot: LotSize) {
        self.entries
            .write()
            .await
            .insert((exchange, pair.clone()), (lot, Instant::now()));
    }

    /// Drop expired entries. Returns how many were removed.
    pub async fn evict_expired(&self) -> usize {
        let mut entries = self.entries.write().await;
        let before = entries.len();
        entries.retain(|_, (_, stored_at)| stored_at.elapsed() < self.ttl);
        before - entries.len()
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn lot() -> LotSize {
        LotSize {
            step_size: dec!(0.0001),
            min_qty: dec!(0.0001),
            min_notional: dec!(10),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_entries_expire_after_ttl() {
        let cache = LotSizeCache::new(Duration::from_secs(60));
        let pair = Pair::new("BTC", "USDT");
        cache.insert(Exchange::Binance, &pair, lot()).await;

        assert_eq!(cache.get(Exchange::Binance, &pair).await, Some(lot()));
        assert_eq!(cache.get(Exchange::GateIo, &pair).await, None);

        tokio::time::advance(Duration::from_secs(61)).await;
        assert_eq!(cache.get(Exchange::Binance, &pair).await, None);
        assert_eq!(cache.evict_expired().await, 1);
        assert_eq!(cache.len().await, 0);
    }
}
