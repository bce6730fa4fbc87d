//! Adapter + rate limiter + retry controller + lot-size cache.
//!
//! All engine code talks to exchanges through [`ExchangeGateway`]; raw
//! adapters are never called directly outside this module.

use super::lot_cache::LotSizeCache;
use super::rate_limit::RateLimiter;
use super::retry::{RetryContext, RetryController, RetryPolicy};
use super::traits::ExchangeAdapter;
use super::types::*;
use crate::config::Config;
use crate::error::ExchangeError;
use crate::persistence::{Resolution, TradeStore};
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, warn};

#[derive(Clone)]
pub struct ExchangeGateway {
    adapter: Arc<dyn ExchangeAdapter>,
    limiter: Arc<RateLimiter>,
    retry: RetryController,
    lots: Arc<LotSizeCache>,
    fee_rate: Decimal,
    /// Most recent successful price read per pair
    last_prices: Arc<RwLock<HashMap<Pair, Decimal>>>,
}

impl ExchangeGateway {
    pub fn new(
        adapter: Arc<dyn ExchangeAdapter>,
        limiter: Arc<RateLimiter>,
        retry: RetryController,
        lots: Arc<LotSizeCache>,
        fee_rate: Decimal,
    ) -> Self {
        Self {
            adapter,
            limiter,
            retry,
            lots,
            fee_rate,
            last_prices: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// One gateway per adapter, sharing a rate limiter and lot-size cache.
    pub fn build_all(
        config: &Config,
        adapters: Vec<Arc<dyn ExchangeAdapter>>,
        store: Option<Arc<TradeStore>>,
    ) -> HashMap<Exchange, ExchangeGateway> {
        let limiter = Arc::new(RateLimiter::from_config(config));
        let lots = Arc::new(LotSizeCache::new(Duration::from_secs(
            config.storage.lot_cache_ttl_secs,
        )));
        let retry = RetryController::new(RetryPolicy::from_config(&config.retry), store);

        adapters
            .into_iter()
            .map(|adapter| {
                let exchange = adapter.exchange();
                let fee_rate = config.exchanges.get(exchange).taker_fee_rate;
                let gateway = ExchangeGateway::new(
                    adapter,
                    Arc::clone(&limiter),
                    retry.clone(),
                    Arc::clone(&lots),
                    fee_rate,
                );
                (exchange, gateway)
            })
            .collect()
    }

    pub fn exchange(&self) -> Exchange {
        self.adapter.exchange()
    }

    /// Taker fee rate charged on each leg.
    pub fn fee_rate(&self) -> Decimal {
        self.fee_rate
    }

    pub fn supports_brackets(&self) -> bool {
        self.adapter.supports_brackets()
    }

    /// Paced, retried adapter call.
    async fn call<T, F, Fut>(&self, ctx: RetryContext, f: F) -> Result<T, ExchangeError>
    where
        F: Fn(Arc<dyn ExchangeAdapter>) -> Fut,
        Fut: Future<Output = Result<T, ExchangeError>>,
    {
        self.call_counted(&ctx, f).await.0
    }

    async fn call_counted<T, F, Fut>(
        &self,
        ctx: &RetryContext,
        f: F,
    ) -> (Result<T, ExchangeError>, u32)
    where
        F: Fn(Arc<dyn ExchangeAdapter>) -> Fut,
        Fut: Future<Output = Result<T, ExchangeError>>,
    {
        let exchange = self.exchange();
        let limiter = &self.limiter;
        let adapter = &self.adapter;
        let f = &f;
        self.retry
            .run_counted(ctx, move || async move {
                limiter.await_slot(exchange).await;
                f(Arc::clone(adapter)).await
            })
            .await
    }

    fn ctx(&self, operation: &'static str) -> RetryContext {
        RetryContext::new(operation, self.exchange())
    }

    pub async fn get_free_balance(&self, asset: &str) -> Result<Decimal, ExchangeError> {
        self.call(self.ctx("get_free_balance"), |a| async move {
            a.get_free_balance(asset).await
        })
        .await
    }

    pub async fn get_margin_balance(&self, asset: &str) -> Result<MarginBalance, ExchangeError> {
        self.call(self.ctx("get_margin_balance"), |a| async move {
            a.get_margin_balance(asset).await
        })
        .await
    }

    /// Lot size, served from the cache while fresh.
    pub async fn get_lot_size(&self, pair: &Pair) -> Result<LotSize, ExchangeError> {
        let exchange = self.exchange();
        if let Some(lot) = self.lots.get(exchange, pair).await {
            return Ok(lot);
        }
        let lot = self
            .call(self.ctx("get_lot_size"), |a| async move { a.get_lot_size(pair).await })
            .await?;
        let evicted = self.lots.evict_expired().await;
        self.lots.insert(exchange, pair, lot).await;
        let cached = self.lots.len().await;
        debug!(
            %exchange,
            %pair,
            evicted,
            cached,
            "Cached lot size: {:?}",
            lot
        );
        Ok(lot)
    }

    pub async fn get_price(&self, pair: &Pair) -> Result<Decimal, ExchangeError> {
        let price = self
            .call(self.ctx("get_price"), |a| async move { a.get_price(pair).await })
            .await?;
        self.last_prices.write().await.insert(pair.clone(), price);
        Ok(price)
    }

    /// Last price this gateway saw for `pair`, however old.
    pub async fn last_price(&self, pair: &Pair) -> Option<Decimal> {
        self.last_prices.read().await.get(pair).copied()
    }

    pub async fn get_recent_closes(
        &self,
        pair: &Pair,
        limit: usize,
    ) -> Result<Vec<Decimal>, ExchangeError> {
        self.call(self.ctx("get_recent_closes"), |a| async move {
            a.get_recent_closes(pair, limit).await
        })
        .await
    }

    /// Place a market order. If the venue rejects the idempotency key as
    /// already used, the original order is looked up and returned instead,
    /// and the recovery history records the lookup's outcome.
    pub async fn place_market_order(
        &self,
        request: &MarketOrderRequest,
    ) -> Result<OrderFill, ExchangeError> {
        let ctx = self
            .ctx("place_market_order")
            .with_reference(&request.idempotency_key)
            .resolving_duplicates();
        let (result, attempts) = self
            .call_counted(&ctx, |a| async move { a.place_market_order(request).await })
            .await;

        let err = match result {
            Err(err) if err.duplicate_order => err,
            other => return other,
        };
        warn!(
            exchange = %self.exchange(),
            key = %request.idempotency_key,
            "Order key already used, fetching original fill"
        );
        let lookup = self
            .get_order_status(
                &request.pair,
                &OrderRef::Client(request.idempotency_key.clone()),
                AccountType::for_leverage(request.leverage),
            )
            .await;
        match &lookup {
            Ok(fill) => self.retry.record_resolution(
                &ctx,
                attempts,
                Some(&err),
                Resolution::Success,
                format!("duplicate key, recovered original order {}", fill.order_id),
            ),
            Err(lookup_err) => self.retry.record_resolution(
                &ctx,
                attempts,
                Some(lookup_err),
                Resolution::Failed,
                format!("duplicate key, original order lookup failed: {}", lookup_err.message),
            ),
        }
        lookup
    }

    pub async fn place_bracket_order(
        &self,
        request: &BracketOrderRequest,
    ) -> Result<BracketHandle, ExchangeError> {
        let ctx = self
            .ctx("place_bracket_order")
            .with_reference(&request.idempotency_key);
        self.call(ctx, |a| async move { a.place_bracket_order(request).await })
            .await
    }

    pub async fn get_order_status(
        &self,
        pair: &Pair,
        order: &OrderRef,
        account: AccountType,
    ) -> Result<OrderFill, ExchangeError> {
        self.call(self.ctx("get_order_status"), |a| async move {
            a.get_order_status(pair, order, account).await
        })
        .await
    }

    pub async fn get_bracket_status(
        &self,
        pair: &Pair,
        bracket_id: &str,
    ) -> Result<BracketStatus, ExchangeError> {
        let ctx = self.ctx("get_bracket_status").with_reference(bracket_id);
        self.call(ctx, |a| async move { a.get_bracket_status(pair, bracket_id).await })
            .await
    }

    pub async fn cancel_bracket(&self, pair: &Pair, bracket_id: &str) -> Result<(), ExchangeError> {
        let ctx = self.ctx("cancel_bracket").with_reference(bracket_id);
        self.call(ctx, |a| async move { a.cancel_bracket(pair, bracket_id).await })
            .await
    }
}
