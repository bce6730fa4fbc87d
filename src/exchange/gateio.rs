//! Gate.io spot REST adapter (API v4).
//!
//! Gate.io has no native OCO order on spot, so brackets are reported as
//! unsupported and exits are monitored client-side.

use super::signing::{canonical_query, gate_sign_payload, hmac_sha512_hex};
use super::traits::ExchangeAdapter;
use super::types::*;
use crate::config::ExchangeConfig;
use crate::error::{ErrorKind, ExchangeError};
use crate::utils::{round_to_tick, step_from_precision};
use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::{Client, Method};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, instrument};

const BASE_URL: &str = "https://api.gateio.ws";
const TESTNET_URL: &str = "https://api-testnet.gateapi.io";
const API_PREFIX: &str = "/api/v4";

/// Gate.io spot client.
pub struct GateIoAdapter {
    http: Client,
    api_key: String,
    secret_key: String,
    base_url: String,
}

#[derive(Debug, Deserialize)]
struct ApiError {
    label: String,
    #[serde(default)]
    message: String,
}

#[derive(Debug, Deserialize)]
struct SpotAccount {
    currency: String,
    #[serde(with = "rust_decimal::serde::str")]
    available: Decimal,
}

#[derive(Debug, Deserialize)]
struct CrossMarginAccount {
    #[serde(default)]
    balances: HashMap<String, CrossMarginBalance>,
}

#[derive(Debug, Deserialize)]
struct CrossMarginBalance {
    #[serde(with = "rust_decimal::serde::str")]
    available: Decimal,
    #[serde(with = "rust_decimal::serde::str")]
    borrowed: Decimal,
}

#[derive(Debug, Deserialize)]
struct CurrencyPair {
    #[serde(default, with = "rust_decimal::serde::str_option")]
    min_base_amount: Option<Decimal>,
    #[serde(default, with = "rust_decimal::serde::str_option")]
    min_quote_amount: Option<Decimal>,
    amount_precision: u32,
}

#[derive(Debug, Deserialize)]
struct Ticker {
    #[serde(with = "rust_decimal::serde::str")]
    last: Decimal,
}

#[derive(Debug, Serialize)]
struct NewOrder {
    text: String,
    currency_pair: String,
    #[serde(rename = "type")]
    order_type: &'static str,
    account: &'static str,
    side: &'static str,
    amount: String,
    time_in_force: &'static str,
}

#[derive(Debug, Deserialize)]
struct GateOrder {
    id: String,
    #[serde(default)]
    text: String,
    status: String,
    side: String,
    #[serde(with = "rust_decimal::serde::str")]
    amount: Decimal,
    #[serde(default, with = "rust_decimal::serde::str_option")]
    left: Option<Decimal>,
    #[serde(default, with = "rust_decimal::serde::str_option")]
    filled_total: Option<Decimal>,
    #[serde(default, with = "rust_decimal::serde::str_option")]
    avg_deal_price: Option<Decimal>,
    #[serde(default)]
    finish_as: Option<String>,
}

impl GateOrder {
    fn into_fill(self) -> OrderFill {
        let avg_price = self.avg_deal_price.unwrap_or(Decimal::ZERO);
        // Market buys are denominated in quote currency.
        let executed_qty = if self.side == "buy" {
            match self.filled_total {
                Some(total) if avg_price > Decimal::ZERO => total / avg_price,
                _ => Decimal::ZERO,
            }
        } else {
            self.amount - self.left.unwrap_or(Decimal::ZERO)
        };

        let status = match (self.status.as_str(), self.finish_as.as_deref()) {
            ("open", _) => OrderStatus::New,
            ("closed", Some("filled")) | ("closed", None) => OrderStatus::Filled,
            ("closed", Some("ioc")) if executed_qty > Decimal::ZERO => OrderStatus::Filled,
            ("cancelled", _) => OrderStatus::Canceled,
            _ => OrderStatus::Expired,
        };

        OrderFill {
            order_id: self.id,
            client_order_id: self.text,
            status,
            avg_price,
            executed_qty,
        }
    }
}

fn classify(status: u16, body: &str) -> (ErrorKind, String, bool) {
    let Ok(err) = serde_json::from_str::<ApiError>(body) else {
        return (ErrorKind::from_http_status(status), body.to_string(), false);
    };
    let duplicate = err.label == "DUPLICATE_REQUEST"
        || err.message.to_ascii_lowercase().contains("duplicate");
    let kind = match err.label.as_str() {
        "TOO_MANY_REQUESTS" => ErrorKind::RateLimit,
        "REQUEST_EXPIRED" | "INVALID_KEY_TIMESTAMP" => ErrorKind::ClockSkew,
        "BALANCE_NOT_ENOUGH" | "MARGIN_BALANCE_NOT_ENOUGH" => ErrorKind::InsufficientBalance,
        "SERVER_ERROR" => ErrorKind::Network,
        "INVALID_PARAM_VALUE" | "INVALID_CURRENCY_PAIR" | "INVALID_AMOUNT" | "AMOUNT_TOO_LITTLE"
        | "AMOUNT_TOO_MUCH" | "ORDER_NOT_FOUND" | "DUPLICATE_REQUEST" => ErrorKind::OrderRejected,
        _ => ErrorKind::from_http_status(status),
    };
    (kind, format!("{}: {}", err.label, err.message), duplicate)
}

impl GateIoAdapter {
    pub fn new(config: &ExchangeConfig) -> Result<Self> {
        let base_url = if config.testnet { TESTNET_URL } else { BASE_URL };
        Self::with_base_url(config, base_url)
    }

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
        ExchangeError::new(Exchange::GateIo, kind, message)
    }

    async fn request<T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        params: &[(&str, String)],
        body: Option<String>,
        signed: bool,
    ) -> Result<T, ExchangeError> {
        let full_path = format!("{API_PREFIX}{path}");
        let query = canonical_query(params);
        let url = if query.is_empty() {
            format!("{}{}", self.base_url, full_path)
        } else {
            format!("{}{}?{}", self.base_url, full_path, query)
        };
        let body = body.unwrap_or_default();

        let mut builder = self
            .http
            .request(method.clone(), &url)
            .header("Accept", "application/json")
            .header("Content-Type", "application/json");

        if signed {
            let timestamp = chrono::Utc::now().timestamp();
            let payload = gate_sign_payload(method.as_str(), &full_path, &query, &body, timestamp);
            builder = builder
                .header("KEY", &self.api_key)
                .header("Timestamp", timestamp.to_string())
                .header("SIGN", hmac_sha512_hex(&self.secret_key, &payload));
        }
        if !body.is_empty() {
            builder = builder.body(body);
        }

        let response = builder
            .send()
            .await
            .map_err(|e| ExchangeError::from_transport(Exchange::GateIo, &e))?;

        let status = response.status();
        if status.is_success() {
            return response
                .json()
                .await
                .map_err(|e| self.err(ErrorKind::Unknown, format!("bad response body: {e}")));
        }

        let text = response.text().await.unwrap_or_default();
        let (kind, message, duplicate) = classify(status.as_u16(), &text);
        if duplicate {
            return Err(ExchangeError::duplicate(Exchange::GateIo, message));
        }
        Err(self.err(kind, format!("HTTP {}: {}", status.as_u16(), message)))
    }
}

/// Gate.io custom order ids must start with `t-` and stay within 30 chars.
fn order_text(idempotency_key: &str) -> String {
    let mut text = format!("t-{idempotency_key}");
    text.truncate(30);
    text
}

#[async_trait]
impl ExchangeAdapter for GateIoAdapter {
    fn exchange(&self) -> Exchange {
        Exchange::GateIo
    }

    fn supports_brackets(&self) -> bool {
        false
    }

    #[instrument(skip(self))]
    async fn get_free_balance(&self, asset: &str) -> Result<Decimal, ExchangeError> {
        let accounts: Vec<SpotAccount> = self
            .request(
                Method::GET,
                "/spot/accounts",
                &[("currency", asset.to_ascii_uppercase())],
                None,
                true,
            )
            .await?;

        Ok(accounts
            .into_iter()
            .find(|a| a.currency.eq_ignore_ascii_case(asset))
            .map(|a| a.available)
            .unwrap_or(Decimal::ZERO))
    }

    #[instrument(skip(self))]
    async fn get_margin_balance(&self, asset: &str) -> Result<MarginBalance, ExchangeError> {
        let account: CrossMarginAccount = self
            .request(Method::GET, "/margin/cross/accounts", &[], None, true)
            .await?;

        Ok(account
            .balances
            .into_iter()
            .find(|(currency, _)| currency.eq_ignore_ascii_case(asset))
            .map(|(_, b)| MarginBalance {
                free: b.available,
                borrowed: b.borrowed,
            })
            .unwrap_or_default())
    }

    #[instrument(skip(self), fields(pair = %pair))]
    async fn get_lot_size(&self, pair: &Pair) -> Result<LotSize, ExchangeError> {
        let info: CurrencyPair = self
            .request(
                Method::GET,
                &format!("/spot/currency_pairs/{}", pair.gate_symbol()),
                &[],
                None,
                false,
            )
            .await?;

        let step_size = step_from_precision(info.amount_precision);
        Ok(LotSize {
            step_size,
            min_qty: info.min_base_amount.unwrap_or(step_size),
            min_notional: info.min_quote_amount.unwrap_or(Decimal::ONE),
        })
    }

    #[instrument(skip(self), fields(pair = %pair))]
    async fn get_price(&self, pair: &Pair) -> Result<Decimal, ExchangeError> {
        let tickers: Vec<Ticker> = self
            .request(
                Method::GET,
                "/spot/tickers",
                &[("currency_pair", pair.gate_symbol())],
                None,
                false,
            )
            .await?;

        tickers
            .first()
            .map(|t| t.last)
            .ok_or_else(|| self.err(ErrorKind::Unknown, format!("no ticker for {pair}")))
    }

    #[instrument(skip(self), fields(pair = %pair))]
    async fn get_recent_closes(
        &self,
        pair: &Pair,
        limit: usize,
    ) -> Result<Vec<Decimal>, ExchangeError> {
        let candles: Vec<Vec<serde_json::Value>> = self
            .request(
                Method::GET,
                "/spot/candlesticks",
                &[
                    ("currency_pair", pair.gate_symbol()),
                    ("interval", "1m".to_string()),
                    ("limit", limit.to_string()),
                ],
                None,
                false,
            )
            .await?;

        // [timestamp, quote volume, close, high, low, open, ...]
        Ok(candles
            .iter()
            .filter_map(|c| c.get(2).and_then(|v| v.as_str()))
            .filter_map(|s| s.parse::<Decimal>().ok())
            .collect())
    }

    #[instrument(skip(self), fields(pair = %request.pair, side = ?request.side))]
    async fn place_market_order(
        &self,
        request: &MarketOrderRequest,
    ) -> Result<OrderFill, ExchangeError> {
        let amount = match request.side {
            OrderSide::Buy => round_to_tick(request.quantity * request.reference_price, dec!(0.01)),
            OrderSide::Sell => request.quantity,
        };

        let order = NewOrder {
            text: order_text(&request.idempotency_key),
            currency_pair: request.pair.gate_symbol(),
            order_type: "market",
            account: match AccountType::for_leverage(request.leverage) {
                AccountType::Spot => "spot",
                AccountType::Margin => "cross_margin",
            },
            side: if request.side == OrderSide::Buy { "buy" } else { "sell" },
            amount: amount.normalize().to_string(),
            time_in_force: "ioc",
        };
        let body = serde_json::to_string(&order)
            .map_err(|e| self.err(ErrorKind::Unknown, e.to_string()))?;

        debug!(text = %order.text, "Placing market order");

        let placed: GateOrder = self
            .request(Method::POST, "/spot/orders", &[], Some(body), true)
            .await?;
        Ok(placed.into_fill())
    }

    async fn place_bracket_order(
        &self,
        _request: &BracketOrderRequest,
    ) -> Result<BracketHandle, ExchangeError> {
        Err(self.err(
            ErrorKind::OrderRejected,
            "bracket orders are not supported on gate.io spot",
        ))
    }

    #[instrument(skip(self), fields(pair = %pair))]
    async fn get_order_status(
        &self,
        pair: &Pair,
        order: &OrderRef,
        account: AccountType,
    ) -> Result<OrderFill, ExchangeError> {
        let id = match order {
            OrderRef::Exchange(id) => id.clone(),
            OrderRef::Client(key) => order_text(key),
        };
        let mut params = vec![("currency_pair", pair.gate_symbol())];
        if account == AccountType::Margin {
            params.push(("account", "cross_margin".to_string()));
        }
        let found: GateOrder = self
            .request(Method::GET, &format!("/spot/orders/{id}"), &params, None, true)
            .await?;
        Ok(found.into_fill())
    }

    async fn get_bracket_status(
        &self,
        _pair: &Pair,
        bracket_id: &str,
    ) -> Result<BracketStatus, ExchangeError> {
        Err(self.err(
            ErrorKind::OrderRejected,
            format!("unknown bracket {bracket_id}: brackets are not supported"),
        ))
    }

    async fn cancel_bracket(&self, _pair: &Pair, bracket_id: &str) -> Result<(), ExchangeError> {
        Err(self.err(
            ErrorKind::OrderRejected,
            format!("unknown bracket {bracket_id}: brackets are not supported"),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{header_exists, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn test_config() -> ExchangeConfig {
        ExchangeConfig {
            api_key: "gate-key".to_string(),
            secret_key: "gate-secret".to_string(),
            ..ExchangeConfig::gateio_defaults()
        }
    }

    #[test]
    fn test_order_text_prefix_and_length() {
        let text = order_text("0123456789abcdef0123456789abcdef");
        assert!(text.starts_with("t-"));
        assert_eq!(text.len(), 30);
    }

    #[test]
    fn test_classify_labels() {
        let body = r#"{"label":"BALANCE_NOT_ENOUGH","message":"Not enough balance"}"#;
        assert_eq!(classify(400, body).0, ErrorKind::InsufficientBalance);
        let body = r#"{"label":"REQUEST_EXPIRED","message":"gap too large"}"#;
        assert_eq!(classify(401, body).0, ErrorKind::ClockSkew);
        let body = r#"{"label":"TOO_MANY_REQUESTS","message":""}"#;
        assert_eq!(classify(429, body).0, ErrorKind::RateLimit);
    }

    #[test]
    fn test_buy_fill_converts_quote_total() {
        let order = GateOrder {
            id: "1".into(),
            text: "t-x".into(),
            status: "closed".into(),
            side: "buy".into(),
            amount: Decimal::from(100),
            left: Some(Decimal::ZERO),
            filled_total: Some(Decimal::from(100)),
            avg_deal_price: Some(Decimal::from(50)),
            finish_as: Some("filled".into()),
        };
        let fill = order.into_fill();
        assert_eq!(fill.executed_qty, Decimal::from(2));
        assert_eq!(fill.status, OrderStatus::Filled);
    }

    #[tokio::test]
    async fn test_balance_request_is_signed() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/v4/spot/accounts"))
            .and(header_exists("KEY"))
            .and(header_exists("SIGN"))
            .and(header_exists("Timestamp"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!([
                {"currency": "USDT", "available": "42.5", "locked": "0"}
            ])))
            .expect(1)
            .mount(&server)
            .await;

        let adapter = GateIoAdapter::with_base_url(&test_config(), &server.uri()).unwrap();
        let balance = adapter.get_free_balance("USDT").await.unwrap();
        assert_eq!(balance, dec!(42.5));
    }

    #[tokio::test]
    async fn test_cross_margin_balance() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/v4/margin/cross/accounts"))
            .and(header_exists("SIGN"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "user_id": 10001,
                "balances": {
                    "BTC": {"available": "0", "freeze": "0", "borrowed": "0.0012", "interest": "0"},
                    "USDT": {"available": "120.5", "freeze": "0", "borrowed": "0", "interest": "0"}
                }
            })))
            .mount(&server)
            .await;

        let adapter = GateIoAdapter::with_base_url(&test_config(), &server.uri()).unwrap();
        let btc = adapter.get_margin_balance("BTC").await.unwrap();
        assert_eq!(btc.free, dec!(0));
        assert_eq!(btc.borrowed, dec!(0.0012));
        assert_eq!(
            adapter.get_margin_balance("SOL").await.unwrap(),
            MarginBalance::default()
        );
    }

    #[tokio::test]
    async fn test_margin_order_lookup_names_account() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/v4/spot/orders/t-key-3"))
            .and(query_param("account", "cross_margin"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "id": "99",
                "text": "t-key-3",
                "status": "closed",
                "side": "sell",
                "amount": "0.0012",
                "left": "0",
                "filled_total": "60",
                "avg_deal_price": "50000",
                "finish_as": "filled"
            })))
            .expect(1)
            .mount(&server)
            .await;

        let adapter = GateIoAdapter::with_base_url(&test_config(), &server.uri()).unwrap();
        let fill = adapter
            .get_order_status(
                &Pair::new("BTC", "USDT"),
                &OrderRef::Client("key-3".to_string()),
                AccountType::Margin,
            )
            .await
            .unwrap();
        assert_eq!(fill.executed_qty, dec!(0.0012));
        assert_eq!(fill.status, OrderStatus::Filled);
    }
}
