//! Order execution pipeline.
//!
//! One call to [`ExecutionPipeline::run_cycle`] is one bounded unit of work:
//! balances and lot sizes are gathered across exchanges concurrently, the
//! allocator grants slots, then each exchange fills its slots in parallel with
//! the others (calls on one exchange serialize behind its rate limiter).

use crate::config::{Config, ExitConfig};
use crate::error::{ErrorKind, ExchangeError, SizingError};
use crate::exchange::{
    BracketOrderRequest, Direction, Exchange, ExchangeGateway, MarketOrderRequest, OrderSide,
    Pair, TradingMode,
};
use crate::persistence::{NewTrade, TradeStore};
use crate::strategy::allocator::{CapitalAllocator, ExchangeCapacity, ExchangeSnapshot};
use crate::strategy::selector::{Candidate, InstrumentSelector, Selection};
use crate::strategy::sizer::{volatility, PositionSizer, SizeDecision, SizingInputs};
use chrono::Utc;
use futures_util::future::join_all;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{error, info, warn};

/// Inputs for one trading cycle.
#[derive(Debug, Clone)]
pub struct CycleRequest {
    pub bot_id: String,
    pub run_id: Option<String>,
    /// Distinguishes cycles; part of every idempotency key
    pub cycle_id: String,
    pub mode: TradingMode,
    pub target_profit: Decimal,
    pub exchanges: Vec<Exchange>,
    pub leverage: HashMap<Exchange, u32>,
    /// Caller-supplied prices, used instead of a fetch when present
    pub prices: HashMap<Pair, Decimal>,
    pub sandbox: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PositionSummary {
    pub trade_id: i64,
    pub exchange: Exchange,
    pub pair: Pair,
    pub direction: Direction,
    pub entry_price: Decimal,
    pub quantity: Decimal,
    pub notional: Decimal,
    pub leverage: u32,
    pub target_profit: Decimal,
    pub bracket_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SkipReason {
    NoEligibleExchange,
    NoSlots,
    NoCandidate { detail: String },
    Duplicate { idempotency_key: String },
    BelowMinimum { detail: String },
}

/// Result of one cycle. Business failures and system failures are distinct
/// variants; HTTP translation happens only in [`CycleOutcome::http_status`].
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum CycleOutcome {
    Opened { positions: Vec<PositionSummary> },
    Skipped { reason: SkipReason },
    UserError { kind: ErrorKind, reason: String },
    SystemError { cause: String },
}

impl CycleOutcome {
    pub fn http_status(&self) -> u16 {
        match self {
            CycleOutcome::SystemError { .. } => 500,
            _ => 200,
        }
    }
}

/// Deterministic client order id for one logical order.
pub fn idempotency_key(
    bot_id: &str,
    cycle_id: &str,
    exchange: Exchange,
    pair: &Pair,
    direction: Direction,
) -> String {
    let mut hasher = Sha256::new();
    hasher.update(format!("{bot_id}|{cycle_id}|{exchange}|{pair}|{direction}").as_bytes());
    let digest = hex::encode(hasher.finalize());
    format!("tb-{}", &digest[..24])
}

enum OpenResult {
    Opened(PositionSummary),
    Skipped(SkipReason),
}

enum OpenError {
    User { kind: ErrorKind, reason: String },
    System(String),
}

impl From<ExchangeError> for OpenError {
    fn from(err: ExchangeError) -> Self {
        if err.kind.is_user_error() {
            OpenError::User {
                kind: err.kind,
                reason: err.to_string(),
            }
        } else {
            OpenError::System(err.to_string())
        }
    }
}

impl From<anyhow::Error> for OpenError {
    fn from(err: anyhow::Error) -> Self {
        OpenError::System(format!("{:#}", err))
    }
}

#[derive(Default)]
struct ExchangeRun {
    opened: Vec<PositionSummary>,
    skips: Vec<SkipReason>,
    user_errors: Vec<(ErrorKind, String)>,
    system_errors: Vec<String>,
}

pub struct ExecutionPipeline {
    gateways: HashMap<Exchange, ExchangeGateway>,
    store: Arc<TradeStore>,
    selector: InstrumentSelector,
    sizer: PositionSizer,
    allocator: CapitalAllocator,
    candidates: Vec<Pair>,
    quote_asset: String,
    connected: HashMap<Exchange, bool>,
    exit: ExitConfig,
}

impl ExecutionPipeline {
    pub fn new(
        config: &Config,
        store: Arc<TradeStore>,
        gateways: HashMap<Exchange, ExchangeGateway>,
    ) -> Self {
        Self {
            gateways,
            selector: InstrumentSelector::new(config.selection.clone(), Arc::clone(&store)),
            sizer: PositionSizer::new(config.sizing.clone()),
            allocator: CapitalAllocator::new(
                config.allocation.clone(),
                config.sizing.fixed_position_size,
            ),
            store,
            candidates: config.selection.candidate_pairs.clone(),
            quote_asset: config.allocation.quote_asset.clone(),
            connected: Exchange::ALL
                .iter()
                .map(|ex| (*ex, config.exchanges.get(*ex).connected))
                .collect(),
            exit: config.exit.clone(),
        }
    }

    pub async fn run_cycle(&self, request: &CycleRequest) -> CycleOutcome {
        info!(
            bot_id = %request.bot_id,
            cycle_id = %request.cycle_id,
            mode = ?request.mode,
            exchanges = ?request.exchanges,
            "Starting trading cycle"
        );

        let gateways: Vec<&ExchangeGateway> = request
            .exchanges
            .iter()
            .filter(|ex| self.connected.get(ex).copied().unwrap_or(false))
            .filter_map(|ex| self.gateways.get(ex))
            .collect();
        if gateways.is_empty() {
            return CycleOutcome::Skipped {
                reason: SkipReason::NoEligibleExchange,
            };
        }

        // Fan out balance and lot-size lookups, join before allocating.
        let snapshots = join_all(gateways.iter().map(|gw| self.snapshot(gw, request.sandbox))).await;
        let mut lookup_errors = Vec::new();
        let mut ready = Vec::new();
        for result in snapshots {
            match result {
                Ok(snapshot) => ready.push(snapshot),
                Err(e) => lookup_errors.push(e),
            }
        }
        if ready.is_empty() {
            return CycleOutcome::SystemError {
                cause: lookup_errors.join("; "),
            };
        }

        let plan = self.allocator.plan(&ready);
        if plan.is_empty() {
            let any_eligible = ready
                .iter()
                .any(|s| self.allocator.is_eligible(s.free_balance, s.min_notional));
            return CycleOutcome::Skipped {
                reason: if any_eligible {
                    SkipReason::NoSlots
                } else {
                    SkipReason::NoEligibleExchange
                },
            };
        }

        let runs = join_all(plan.iter().filter_map(|capacity| {
            self.gateways
                .get(&capacity.exchange)
                .map(|gw| self.fill_slots(gw, capacity, request))
        }))
        .await;

        self.combine(runs)
    }

    async fn snapshot(
        &self,
        gateway: &ExchangeGateway,
        sandbox: bool,
    ) -> Result<ExchangeSnapshot, String> {
        let exchange = gateway.exchange();
        let free_balance = gateway
            .get_free_balance(&self.quote_asset)
            .await
            .map_err(|e| e.to_string())?;

        let lots = join_all(self.candidates.iter().map(|pair| gateway.get_lot_size(pair))).await;
        let min_notional = lots
            .iter()
            .filter_map(|lot| lot.as_ref().ok())
            .map(|lot| lot.min_notional)
            .min()
            .ok_or_else(|| format!("{exchange}: no lot size metadata for any candidate"))?;

        let open_positions = self
            .store
            .count_open_by_exchange(exchange, sandbox)
            .map_err(|e| format!("{:#}", e))?;

        Ok(ExchangeSnapshot {
            exchange,
            free_balance,
            min_notional,
            open_positions,
        })
    }

    /// Open up to `capacity.slots` positions on one exchange.
    async fn fill_slots(
        &self,
        gateway: &ExchangeGateway,
        capacity: &ExchangeCapacity,
        request: &CycleRequest,
    ) -> ExchangeRun {
        let mut run = ExchangeRun::default();
        let mut taken = HashSet::new();
        let mut available = capacity.free_balance;

        for _ in 0..capacity.slots {
            let selection = match self
                .selector
                .select(gateway, &self.candidates, request.mode, request.sandbox, &taken)
                .await
            {
                Ok(selection) => selection,
                Err(e) => {
                    error!(exchange = %capacity.exchange, "Selection failed: {:#}", e);
                    run.system_errors.push(format!("{:#}", e));
                    break;
                }
            };

            let candidate = match selection {
                Selection::Chosen(candidate) => candidate,
                Selection::NoCandidate { reason } => {
                    info!(exchange = %capacity.exchange, "No candidate: {}", reason);
                    run.skips.push(SkipReason::NoCandidate { detail: reason });
                    break;
                }
            };
            taken.insert((candidate.pair.clone(), candidate.direction));

            match self.open_position(gateway, request, &candidate, available).await {
                Ok(OpenResult::Opened(summary)) => {
                    available -= summary.notional;
                    run.opened.push(summary);
                }
                Ok(OpenResult::Skipped(reason)) => run.skips.push(reason),
                Err(OpenError::User { kind, reason }) => {
                    warn!(exchange = %capacity.exchange, %kind, "Exchange user error: {}", reason);
                    run.user_errors.push((kind, reason));
                    if kind == ErrorKind::InsufficientBalance {
                        break;
                    }
                }
                Err(OpenError::System(cause)) => {
                    error!(exchange = %capacity.exchange, "Open failed: {}", cause);
                    run.system_errors.push(cause);
                    break;
                }
            }
        }

        run
    }

    async fn open_position(
        &self,
        gateway: &ExchangeGateway,
        request: &CycleRequest,
        candidate: &Candidate,
        available: Decimal,
    ) -> Result<OpenResult, OpenError> {
        let exchange = gateway.exchange();
        let pair = &candidate.pair;
        let direction = candidate.direction;
        let key = idempotency_key(
            &request.bot_id,
            &request.cycle_id,
            exchange,
            pair,
            direction,
        );

        if self.store.find_by_idempotency_key(&key)?.is_some() {
            info!(%exchange, %pair, %direction, %key, "Already opened in this cycle");
            return Ok(OpenResult::Skipped(SkipReason::Duplicate {
                idempotency_key: key,
            }));
        }

        let price = match request.prices.get(pair) {
            Some(px) if *px > Decimal::ZERO => *px,
            _ => gateway.get_price(pair).await?,
        };
        let lot = gateway.get_lot_size(pair).await?;
        let leverage = match request.mode {
            TradingMode::Spot => 1,
            TradingMode::Leverage => request.leverage.get(&exchange).copied().unwrap_or(1).max(1),
        };

        let size = match self.sizer.size(&SizingInputs {
            pair: pair.clone(),
            target_profit: request.target_profit,
            leverage,
            available_balance: available,
            price,
            lot,
            fee_rate: gateway.fee_rate(),
            win_rate: candidate.win_rate,
            win_loss_ratio: candidate.win_loss_ratio,
            volatility: volatility(&candidate.closes),
        }) {
            Ok(size) => size,
            Err(SizingError::InsufficientBalance {
                available,
                required,
            }) => {
                return Err(OpenError::User {
                    kind: ErrorKind::InsufficientBalance,
                    reason: format!("available {available} below required {required}"),
                })
            }
            Err(e @ SizingError::BelowMinimum { .. }) => {
                return Ok(OpenResult::Skipped(SkipReason::BelowMinimum {
                    detail: e.to_string(),
                }))
            }
            Err(e @ SizingError::InvalidPrice(_)) => return Err(OpenError::System(e.to_string())),
        };

        let fill = gateway
            .place_market_order(&MarketOrderRequest {
                pair: pair.clone(),
                side: direction.entry_side(),
                quantity: size.quantity,
                idempotency_key: key.clone(),
                leverage,
                reference_price: price,
            })
            .await?;

        let entry_price = if fill.avg_price > Decimal::ZERO {
            fill.avg_price
        } else {
            price
        };
        let quantity = if fill.executed_qty > Decimal::ZERO {
            fill.executed_qty
        } else {
            size.quantity
        };

        let bracket = if self.exit.use_brackets && gateway.supports_brackets() && leverage == 1 {
            self.place_bracket(gateway, pair, direction, entry_price, quantity, &size, &key)
                .await
        } else {
            None
        };

        let notional = quantity * entry_price / Decimal::from(leverage);
        let telemetry = serde_json::json!({
            "cycle_id": request.cycle_id,
            "order_id": fill.order_id,
            "confidence": candidate.confidence,
            "aligned": candidate.aligned,
            "reasons": candidate.reasons,
            "loss_streak": candidate.loss_streak,
            "round_trip_fees": size.round_trip_fees,
            "reference_price": price,
            "bracket_legs": bracket.as_ref().map(|(_, legs)| legs.clone()),
        });

        let trade = NewTrade {
            bot_id: request.bot_id.clone(),
            run_id: request.run_id.clone(),
            pair: pair.clone(),
            direction,
            exchange,
            sandbox: request.sandbox,
            entry_price,
            quantity,
            notional,
            leverage,
            target_profit: size.target_profit,
            bracket_id: bracket.as_ref().map(|(id, _)| id.clone()),
            idempotency_key: key.clone(),
            telemetry: Some(telemetry),
            opened_at: Utc::now(),
        };

        let trade_id = self.store.insert_trade(&trade).map_err(|e| {
            error!(%exchange, %pair, %key, "Order filled but trade record failed: {:#}", e);
            OpenError::System(format!("order {} filled but not recorded: {:#}", fill.order_id, e))
        })?;

        if let Some(run_id) = &request.run_id {
            if let Err(e) = self.store.ensure_bot_run(run_id, &request.bot_id) {
                warn!(run_id = %run_id, "Failed to create bot run: {:#}", e);
            }
        }

        info!(
            trade_id,
            %exchange,
            %pair,
            %direction,
            %entry_price,
            %quantity,
            %notional,
            target = %size.target_profit,
            "Position opened"
        );

        Ok(OpenResult::Opened(PositionSummary {
            trade_id,
            exchange,
            pair: pair.clone(),
            direction,
            entry_price,
            quantity,
            notional,
            leverage,
            target_profit: size.target_profit,
            bracket_id: trade.bracket_id,
        }))
    }

    /// Take-profit at the fee-adjusted target, stop at a fixed percentage.
    /// Failure leaves the position to client-side monitoring.
    #[allow(clippy::too_many_arguments)]
    async fn place_bracket(
        &self,
        gateway: &ExchangeGateway,
        pair: &Pair,
        direction: Direction,
        entry_price: Decimal,
        quantity: Decimal,
        size: &SizeDecision,
        key: &str,
    ) -> Option<(String, Vec<String>)> {
        let lot = gateway.get_lot_size(pair).await.ok()?;
        let exit_qty = lot.quantize(quantity);
        if lot.is_dust(exit_qty, entry_price) {
            return None;
        }

        let scale = entry_price.scale().max(2);
        let sign = direction.sign();
        let move_needed = (size.target_profit + size.round_trip_fees) / exit_qty;
        let take_profit_price = (entry_price + sign * move_needed).round_dp(scale);
        let stop_price = (entry_price * (Decimal::ONE - sign * self.exit.stop_loss_pct)).round_dp(scale);
        let stop_limit_price =
            (stop_price * (Decimal::ONE - sign * self.exit.stop_limit_offset_pct)).round_dp(scale);
        if take_profit_price <= dec!(0) || stop_limit_price <= dec!(0) {
            return None;
        }

        let side: OrderSide = direction.exit_side();
        match gateway
            .place_bracket_order(&BracketOrderRequest {
                pair: pair.clone(),
                side,
                quantity: exit_qty,
                take_profit_price,
                stop_price,
                stop_limit_price,
                idempotency_key: format!("{key}-b"),
            })
            .await
        {
            Ok(handle) => {
                info!(%pair, bracket_id = %handle.bracket_id, %take_profit_price, %stop_price, "Bracket placed");
                Some((handle.bracket_id, handle.leg_ids))
            }
            Err(e) => {
                warn!(%pair, "Bracket placement failed, monitoring client-side: {}", e);
                None
            }
        }
    }

    fn combine(&self, runs: Vec<ExchangeRun>) -> CycleOutcome {
        let mut positions = Vec::new();
        let mut skips = Vec::new();
        let mut user_errors = Vec::new();
        let mut system_errors = Vec::new();
        for run in runs {
            positions.extend(run.opened);
            skips.extend(run.skips);
            user_errors.extend(run.user_errors);
            system_errors.extend(run.system_errors);
        }

        if !positions.is_empty() {
            info!(opened = positions.len(), "Cycle complete");
            return CycleOutcome::Opened { positions };
        }
        if let Some((kind, reason)) = user_errors.into_iter().next() {
            return CycleOutcome::UserError { kind, reason };
        }
        if !system_errors.is_empty() {
            return CycleOutcome::SystemError {
                cause: system_errors.join("; "),
            };
        }
        CycleOutcome::Skipped {
            reason: skips.into_iter().next().unwrap_or(SkipReason::NoCandidate {
                detail: "no attempts made".to_string(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchange::{ExchangeAdapter, LotSize, MockExchange, MockOperation};
    use crate::persistence::CloseReason;

    fn btc() -> Pair {
        Pair::new("BTC", "USDT")
    }

    fn test_config() -> Config {
        let mut config = Config::default();
        config.selection.candidate_pairs = vec![btc()];
        config.selection.cooldown_minutes = 0;
        config.exchanges.binance.min_request_interval_ms = 0;
        config.rate_limit.jitter_ms = 0;
        config
    }

    async fn mock_exchange(balance: Decimal) -> Arc<MockExchange> {
        let mock = MockExchange::new(Exchange::Binance, "USDT", balance).with_fee_rate(dec!(0.001));
        mock.set_price(&btc(), dec!(50000)).await;
        mock.set_lot_size(
            &btc(),
            LotSize {
                step_size: dec!(0.0001),
                min_qty: dec!(0.0001),
                min_notional: dec!(10),
            },
        )
        .await;
        Arc::new(mock)
    }

    fn pipeline(config: &Config, store: Arc<TradeStore>, mock: Arc<MockExchange>) -> ExecutionPipeline {
        let adapter: Arc<dyn ExchangeAdapter> = mock;
        let gateways = ExchangeGateway::build_all(config, vec![adapter], Some(Arc::clone(&store)));
        ExecutionPipeline::new(config, store, gateways)
    }

    fn request(cycle_id: &str) -> CycleRequest {
        CycleRequest {
            bot_id: "bot-1".to_string(),
            run_id: Some("run-1".to_string()),
            cycle_id: cycle_id.to_string(),
            mode: TradingMode::Spot,
            target_profit: dec!(0.1),
            exchanges: vec![Exchange::Binance],
            leverage: HashMap::new(),
            prices: HashMap::new(),
            sandbox: true,
        }
    }

    #[test]
    fn test_idempotency_key_is_deterministic() {
        let a = idempotency_key("bot", "c1", Exchange::Binance, &btc(), Direction::Long);
        let b = idempotency_key("bot", "c1", Exchange::Binance, &btc(), Direction::Long);
        let c = idempotency_key("bot", "c2", Exchange::Binance, &btc(), Direction::Long);
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.len(), 27);
        assert!(a.starts_with("tb-"));
    }

    #[test]
    fn test_http_status_translation() {
        let user = CycleOutcome::UserError {
            kind: ErrorKind::InsufficientBalance,
            reason: "low".to_string(),
        };
        let system = CycleOutcome::SystemError {
            cause: "down".to_string(),
        };
        assert_eq!(user.http_status(), 200);
        assert_eq!(system.http_status(), 500);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cycle_opens_and_records_position() {
        let config = test_config();
        let store = Arc::new(TradeStore::in_memory().unwrap());
        let mock = mock_exchange(dec!(50)).await;
        let pipeline = pipeline(&config, Arc::clone(&store), Arc::clone(&mock));

        let outcome = pipeline.run_cycle(&request("c1")).await;
        let CycleOutcome::Opened { positions } = outcome else {
            panic!("expected opened, got {outcome:?}");
        };
        assert_eq!(positions.len(), 1);
        assert_eq!(positions[0].direction, Direction::Long);
        assert_eq!(positions[0].quantity, dec!(0.0004));

        let trade = store.get_trade(positions[0].trade_id).unwrap().unwrap();
        assert!(trade.is_open());
        assert_eq!(trade.close_reason(), None::<CloseReason>);
        assert_eq!(mock.order_count().await, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_replayed_cycle_does_not_double_open() {
        let config = test_config();
        let store = Arc::new(TradeStore::in_memory().unwrap());
        let mock = mock_exchange(dec!(100)).await;
        let pipeline = pipeline(&config, Arc::clone(&store), Arc::clone(&mock));

        pipeline.run_cycle(&request("c1")).await;
        let outcome = pipeline.run_cycle(&request("c1")).await;

        assert!(matches!(
            outcome,
            CycleOutcome::Skipped {
                reason: SkipReason::Duplicate { .. }
            }
        ));
        assert_eq!(mock.order_count().await, 1);
        assert_eq!(store.open_trades().unwrap().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_low_balance_skips() {
        let config = test_config();
        let store = Arc::new(TradeStore::in_memory().unwrap());
        let mock = mock_exchange(dec!(5)).await;
        let pipeline = pipeline(&config, store, mock);

        let outcome = pipeline.run_cycle(&request("c1")).await;
        assert_eq!(
            outcome,
            CycleOutcome::Skipped {
                reason: SkipReason::NoEligibleExchange
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_insufficient_balance_is_user_error() {
        let config = test_config();
        let store = Arc::new(TradeStore::in_memory().unwrap());
        let mock = mock_exchange(dec!(50)).await;
        mock.fail_next(
            MockOperation::MarketOrder,
            ExchangeError::new(Exchange::Binance, ErrorKind::InsufficientBalance, "insufficient"),
        )
        .await;
        let pipeline = pipeline(&config, store, mock);

        let outcome = pipeline.run_cycle(&request("c1")).await;
        assert!(matches!(
            outcome,
            CycleOutcome::UserError {
                kind: ErrorKind::InsufficientBalance,
                ..
            }
        ));
        assert_eq!(outcome.http_status(), 200);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unknown_failure_is_system_error() {
        let config = test_config();
        let store = Arc::new(TradeStore::in_memory().unwrap());
        let mock = mock_exchange(dec!(50)).await;
        mock.fail_next(
            MockOperation::MarketOrder,
            ExchangeError::new(Exchange::Binance, ErrorKind::Unknown, "boom"),
        )
        .await;
        let pipeline = pipeline(&config, Arc::clone(&store), mock);

        let outcome = pipeline.run_cycle(&request("c1")).await;
        assert_eq!(outcome.http_status(), 500);
        assert!(store.open_trades().unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnected_exchange_is_skipped() {
        let mut config = test_config();
        config.exchanges.binance.connected = false;
        let store = Arc::new(TradeStore::in_memory().unwrap());
        let mock = mock_exchange(dec!(50)).await;
        let pipeline = pipeline(&config, store, mock);

        let outcome = pipeline.run_cycle(&request("c1")).await;
        assert_eq!(
            outcome,
            CycleOutcome::Skipped {
                reason: SkipReason::NoEligibleExchange
            }
        );
    }
}
