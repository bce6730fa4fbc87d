//! Binance spot REST adapter.

use super::signing::{canonical_query, hmac_sha256_hex};
use super::traits::ExchangeAdapter;
use super::types::*;
use crate::config::ExchangeConfig;
use crate::error::{ErrorKind, ExchangeError};
use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::{Client, Method};
use rust_decimal::Decimal;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::time::Duration;
use tracing::{debug, instrument};

const SPOT_BASE_URL: &str = "https://api.binance.com";
const SPOT_TESTNET_URL: &str = "https://testnet.binance.vision";
const RECV_WINDOW_MS: u64 = 5000;

/// Binance spot and cross-margin client.
pub struct BinanceAdapter {
    http: Client,
    api_key: String,
    secret_key: String,
    base_url: String,
}

#[derive(Debug, Deserialize)]
struct ApiError {
    code: i64,
    msg: String,
}

#[derive(Debug, Deserialize)]
struct AccountInfo {
    balances: Vec<AssetBalance>,
}

#[derive(Debug, Deserialize)]
struct AssetBalance {
    asset: String,
    #[serde(with = "rust_decimal::serde::str")]
    free: Decimal,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MarginAccount {
    user_assets: Vec<MarginAsset>,
}

#[derive(Debug, Deserialize)]
struct MarginAsset {
    asset: String,
    #[serde(with = "rust_decimal::serde::str")]
    free: Decimal,
    #[serde(with = "rust_decimal::serde::str")]
    borrowed: Decimal,
}

#[derive(Debug, Deserialize)]
struct ExchangeInfo {
    symbols: Vec<SymbolInfo>,
}

#[derive(Debug, Deserialize)]
struct SymbolInfo {
    filters: Vec<SymbolFilter>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "filterType")]
enum SymbolFilter {
    #[serde(rename = "LOT_SIZE", rename_all = "camelCase")]
    LotSize {
        #[serde(with = "rust_decimal::serde::str")]
        step_size: Decimal,
        #[serde(with = "rust_decimal::serde::str")]
        min_qty: Decimal,
    },
    #[serde(rename = "NOTIONAL", rename_all = "camelCase")]
    Notional {
        #[serde(with = "rust_decimal::serde::str")]
        min_notional: Decimal,
    },
    #[serde(rename = "MIN_NOTIONAL", rename_all = "camelCase")]
    MinNotional {
        #[serde(with = "rust_decimal::serde::str")]
        min_notional: Decimal,
    },
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
struct TickerPrice {
    #[serde(with = "rust_decimal::serde::str")]
    price: Decimal,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BinanceOrder {
    order_id: i64,
    client_order_id: String,
    status: String,
    #[serde(rename = "type", default)]
    order_type: String,
    #[serde(with = "rust_decimal::serde::str")]
    executed_qty: Decimal,
    #[serde(with = "rust_decimal::serde::str")]
    cummulative_quote_qty: Decimal,
}

impl BinanceOrder {
    fn into_fill(self) -> OrderFill {
        let avg_price = if self.executed_qty > Decimal::ZERO {
            self.cummulative_quote_qty / self.executed_qty
        } else {
            Decimal::ZERO
        };
        OrderFill {
            order_id: self.order_id.to_string(),
            client_order_id: self.client_order_id,
            status: parse_status(&self.status),
            avg_price,
            executed_qty: self.executed_qty,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct OrderListResponse {
    order_list_id: i64,
    list_order_status: String,
    orders: Vec<OrderListLeg>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct OrderListLeg {
    order_id: i64,
}

fn parse_status(status: &str) -> OrderStatus {
    match status {
        "NEW" => OrderStatus::New,
        "PARTIALLY_FILLED" => OrderStatus::PartiallyFilled,
        "FILLED" => OrderStatus::Filled,
        "CANCELED" | "PENDING_CANCEL" => OrderStatus::Canceled,
        "REJECTED" => OrderStatus::Rejected,
        _ => OrderStatus::Expired,
    }
}

/// Map a Binance error body onto the shared taxonomy.
fn classify(status: u16, body: &str) -> (ErrorKind, String, bool) {
    let Ok(err) = serde_json::from_str::<ApiError>(body) else {
        return (ErrorKind::from_http_status(status), body.to_string(), false);
    };
    let msg_lower = err.msg.to_ascii_lowercase();
    if msg_lower.contains("duplicate") {
        return (ErrorKind::OrderRejected, err.msg, true);
    }
    let kind = match err.code {
        -1003 | -1015 => ErrorKind::RateLimit,
        -1007 => ErrorKind::Timeout,
        -1021 | -1022 => ErrorKind::ClockSkew,
        -1001 => ErrorKind::Network,
        _ if msg_lower.contains("insufficient balance") => ErrorKind::InsufficientBalance,
        -2010 | -2011 | -1013 | -1100 | -1102 | -1111 | -1121 => ErrorKind::OrderRejected,
        _ => match ErrorKind::from_http_status(status) {
            ErrorKind::Unknown if (400..500).contains(&status) => ErrorKind::OrderRejected,
            other => other,
        },
    };
    (kind, format!("{} ({})", err.msg, err.code), false)
}

impl BinanceAdapter {
    /// Create a new Binance adapter from configuration.
    pub fn new(config: &ExchangeConfig) -> Result<Self> {
        let base_url = if config.testnet {
            SPOT_TESTNET_URL
        } else {
            SPOT_BASE_URL
        };
        Self::with_base_url(config, base_url)
    }

    /// Create an adapter against a custom base URL.
    pub fn with_base_url(config: &ExchangeConfig, base_url: &str) -> Result<Self> {
        let http = Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            http,
            api_key: config.api_key.clone(),
            secret_key: config.secret_key.clone(),
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    fn err(&self, kind: ErrorKind, message: impl Into<String>) -> ExchangeError {
        ExchangeError::new(Exchange::Binance, kind, message)
    }

    async fn send<T: DeserializeOwned>(
        &self,
        request: reqwest::RequestBuilder,
    ) -> Result<T, ExchangeError> {
        let response = request
            .send()
            .await
            .map_err(|e| ExchangeError::from_transport(Exchange::Binance, &e))?;

        let status = response.status();
        if status.is_success() {
            return response
                .json()
                .await
                .map_err(|e| self.err(ErrorKind::Unknown, format!("bad response body: {e}")));
        }

        let body = response.text().await.unwrap_or_default();
        let (kind, message, duplicate) = classify(status.as_u16(), &body);
        if duplicate {
            return Err(ExchangeError::duplicate(Exchange::Binance, message));
        }
        Err(self.err(kind, format!("HTTP {}: {}", status.as_u16(), message)))
    }

    async fn public<T: DeserializeOwned>(
        &self,
        path: &str,
        params: &[(&str, String)],
    ) -> Result<T, ExchangeError> {
        let url = format!("{}{}?{}", self.base_url, path, canonical_query(params));
        self.send(self.http.get(&url)).await
    }

    async fn signed<T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        mut params: Vec<(&str, String)>,
    ) -> Result<T, ExchangeError> {
        params.push(("recvWindow", RECV_WINDOW_MS.to_string()));
        params.push(("timestamp", chrono::Utc::now().timestamp_millis().to_string()));

        let query = canonical_query(&params);
        let signature = hmac_sha256_hex(&self.secret_key, &query);
        let url = format!("{}{}?{}&signature={}", self.base_url, path, query, signature);

        self.send(
            self.http
                .request(method, &url)
                .header("X-MBX-APIKEY", &self.api_key),
        )
        .await
    }

    async fn query_order(
        &self,
        pair: &Pair,
        order: &OrderRef,
        account: AccountType,
    ) -> Result<BinanceOrder, ExchangeError> {
        let mut params = vec![("symbol", pair.binance_symbol())];
        match order {
            OrderRef::Exchange(id) => params.push(("orderId", id.clone())),
            OrderRef::Client(id) => params.push(("origClientOrderId", id.clone())),
        }
        let path = match account {
            AccountType::Spot => "/api/v3/order",
            AccountType::Margin => "/sapi/v1/margin/order",
        };
        self.signed(Method::GET, path, params).await
    }
}

#[async_trait]
impl ExchangeAdapter for BinanceAdapter {
    fn exchange(&self) -> Exchange {
        Exchange::Binance
    }

    fn supports_brackets(&self) -> bool {
        true
    }

    #[instrument(skip(self))]
    async fn get_free_balance(&self, asset: &str) -> Result<Decimal, ExchangeError> {
        let account: AccountInfo = self
            .signed(Method::GET, "/api/v3/account", vec![("omitZeroBalances", "true".into())])
            .await?;

        Ok(account
            .balances
            .into_iter()
            .find(|b| b.asset.eq_ignore_ascii_case(asset))
            .map(|b| b.free)
            .unwrap_or(Decimal::ZERO))
    }

    #[instrument(skip(self))]
    async fn get_margin_balance(&self, asset: &str) -> Result<MarginBalance, ExchangeError> {
        let account: MarginAccount = self
            .signed(Method::GET, "/sapi/v1/margin/account", Vec::new())
            .await?;

        Ok(account
            .user_assets
            .into_iter()
            .find(|a| a.asset.eq_ignore_ascii_case(asset))
            .map(|a| MarginBalance {
                free: a.free,
                borrowed: a.borrowed,
            })
            .unwrap_or_default())
    }

    #[instrument(skip(self), fields(pair = %pair))]
    async fn get_lot_size(&self, pair: &Pair) -> Result<LotSize, ExchangeError> {
        let info: ExchangeInfo = self
            .public("/api/v3/exchangeInfo", &[("symbol", pair.binance_symbol())])
            .await?;

        let symbol = info
            .symbols
            .into_iter()
            .next()
            .ok_or_else(|| self.err(ErrorKind::OrderRejected, format!("unknown symbol {pair}")))?;

        let mut lot = LotSize {
            step_size: Decimal::ZERO,
            min_qty: Decimal::ZERO,
            min_notional: Decimal::ZERO,
        };
        for filter in symbol.filters {
            match filter {
                SymbolFilter::LotSize { step_size, min_qty } => {
                    lot.step_size = step_size;
                    lot.min_qty = min_qty;
                }
                SymbolFilter::Notional { min_notional }
                | SymbolFilter::MinNotional { min_notional } => {
                    lot.min_notional = min_notional;
                }
                SymbolFilter::Other => {}
            }
        }

        debug!(%pair, step = %lot.step_size, min_qty = %lot.min_qty, min_notional = %lot.min_notional, "Lot size loaded");
        Ok(lot)
    }

    #[instrument(skip(self), fields(pair = %pair))]
    async fn get_price(&self, pair: &Pair) -> Result<Decimal, ExchangeError> {
        let ticker: TickerPrice = self
            .public("/api/v3/ticker/price", &[("symbol", pair.binance_symbol())])
            .await?;
        Ok(ticker.price)
    }

    #[instrument(skip(self), fields(pair = %pair))]
    async fn get_recent_closes(
        &self,
        pair: &Pair,
        limit: usize,
    ) -> Result<Vec<Decimal>, ExchangeError> {
        let klines: Vec<Vec<serde_json::Value>> = self
            .public(
                "/api/v3/klines",
                &[
                    ("symbol", pair.binance_symbol()),
                    ("interval", "1m".to_string()),
                    ("limit", limit.to_string()),
                ],
            )
            .await?;

        Ok(klines
            .iter()
            .filter_map(|k| k.get(4).and_then(|v| v.as_str()))
            .filter_map(|s| s.parse::<Decimal>().ok())
            .collect())
    }

    #[instrument(skip(self), fields(pair = %request.pair, side = ?request.side))]
    async fn place_market_order(
        &self,
        request: &MarketOrderRequest,
    ) -> Result<OrderFill, ExchangeError> {
        let mut params = vec![
            ("symbol", request.pair.binance_symbol()),
            ("side", request.side.as_str().to_string()),
            ("type", "MARKET".to_string()),
            ("quantity", request.quantity.normalize().to_string()),
            ("newClientOrderId", request.idempotency_key.clone()),
            ("newOrderRespType", "FULL".to_string()),
        ];

        let path = if request.leverage > 1 {
            params.push(("sideEffectType", "AUTO_BORROW_REPAY".to_string()));
            "/sapi/v1/margin/order"
        } else {
            "/api/v3/order"
        };

        debug!(key = %request.idempotency_key, %path, "Placing market order");

        let order: BinanceOrder = self.signed(Method::POST, path, params).await?;
        Ok(order.into_fill())
    }

    #[instrument(skip(self), fields(pair = %request.pair))]
    async fn place_bracket_order(
        &self,
        request: &BracketOrderRequest,
    ) -> Result<BracketHandle, ExchangeError> {
        let qty = request.quantity.normalize().to_string();
        let tp = request.take_profit_price.normalize().to_string();
        let stop = request.stop_price.normalize().to_string();
        let stop_limit = request.stop_limit_price.normalize().to_string();

        let mut params = vec![
            ("symbol", request.pair.binance_symbol()),
            ("side", request.side.as_str().to_string()),
            ("quantity", qty),
            ("listClientOrderId", request.idempotency_key.clone()),
        ];

        // Selling out of a long: profit leg above, stop leg below. Buying back
        // a short: the reverse.
        match request.side {
            OrderSide::Sell => params.extend([
                ("aboveType", "LIMIT_MAKER".to_string()),
                ("abovePrice", tp),
                ("belowType", "STOP_LOSS_LIMIT".to_string()),
                ("belowStopPrice", stop),
                ("belowPrice", stop_limit),
                ("belowTimeInForce", "GTC".to_string()),
            ]),
            OrderSide::Buy => params.extend([
                ("aboveType", "STOP_LOSS_LIMIT".to_string()),
                ("aboveStopPrice", stop),
                ("abovePrice", stop_limit),
                ("aboveTimeInForce", "GTC".to_string()),
                ("belowType", "LIMIT_MAKER".to_string()),
                ("belowPrice", tp),
            ]),
        }

        let list: OrderListResponse = self
            .signed(Method::POST, "/api/v3/orderList/oco", params)
            .await?;

        Ok(BracketHandle {
            bracket_id: list.order_list_id.to_string(),
            leg_ids: list.orders.iter().map(|o| o.order_id.to_string()).collect(),
        })
    }

    #[instrument(skip(self), fields(pair = %pair))]
    async fn get_order_status(
        &self,
        pair: &Pair,
        order: &OrderRef,
        account: AccountType,
    ) -> Result<OrderFill, ExchangeError> {
        Ok(self.query_order(pair, order, account).await?.into_fill())
    }

    #[instrument(skip(self), fields(pair = %pair))]
    async fn get_bracket_status(
        &self,
        pair: &Pair,
        bracket_id: &str,
    ) -> Result<BracketStatus, ExchangeError> {
        let list: OrderListResponse = self
            .signed(
                Method::GET,
                "/api/v3/orderList",
                vec![("orderListId", bracket_id.to_string())],
            )
            .await?;

        if list.list_order_status == "EXECUTING" {
            return Ok(BracketStatus::active());
        }

        for leg in &list.orders {
            let order = self
                .query_order(
                    pair,
                    &OrderRef::Exchange(leg.order_id.to_string()),
                    AccountType::Spot,
                )
                .await?;
            if parse_status(&order.status) == OrderStatus::Filled {
                let filled_leg = if order.order_type == "LIMIT_MAKER" {
                    BracketLeg::TakeProfit
                } else {
                    BracketLeg::StopLoss
                };
                let fill = order.into_fill();
                return Ok(BracketStatus {
                    state: BracketState::Filled,
                    filled_leg: Some(filled_leg),
                    fill_price: Some(fill.avg_price),
                });
            }
        }

        let state = if list.list_order_status == "REJECT" {
            BracketState::Expired
        } else {
            BracketState::Cancelled
        };
        Ok(BracketStatus {
            state,
            filled_leg: None,
            fill_price: None,
        })
    }

    #[instrument(skip(self), fields(pair = %pair))]
    async fn cancel_bracket(&self, pair: &Pair, bracket_id: &str) -> Result<(), ExchangeError> {
        let _: serde_json::Value = self
            .signed(
                Method::DELETE,
                "/api/v3/orderList",
                vec![
                    ("symbol", pair.binance_symbol()),
                    ("orderListId", bracket_id.to_string()),
                ],
            )
            .await?;
        Ok(())
    }
}
