//! Configuration management for the trading engine.
//!
//! Loads settings from environment variables and config files.

use crate::exchange::{Exchange, Pair};
use anyhow::{Context, Result};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Main application configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Per-exchange credentials and pacing
    #[serde(default)]
    pub exchanges: ExchangesConfig,
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub sizing: SizingConfig,
    #[serde(default)]
    pub selection: SelectionConfig,
    #[serde(default)]
    pub allocation: AllocationConfig,
    #[serde(default)]
    pub exit: ExitConfig,
    #[serde(default)]
    pub sweeper: SweeperConfig,
    #[serde(default)]
    pub storage: StorageConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExchangesConfig {
    #[serde(default = "ExchangeConfig::binance_defaults")]
    pub binance: ExchangeConfig,
    #[serde(default = "ExchangeConfig::gateio_defaults")]
    pub gateio: ExchangeConfig,
}

impl ExchangesConfig {
    pub fn get(&self, exchange: Exchange) -> &ExchangeConfig {
        match exchange {
            Exchange::Binance => &self.binance,
            Exchange::GateIo => &self.gateio,
        }
    }
}

impl Default for ExchangesConfig {
    fn default() -> Self {
        Self {
            binance: ExchangeConfig::binance_defaults(),
            gateio: ExchangeConfig::gateio_defaults(),
        }
    }
}

/// Credential and pacing settings for one exchange.
///
/// Keys arrive already decrypted from the secret store. `Config::load`
/// seeds the venue-specific interval and fee.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExchangeConfig {
    #[serde(default)]
    pub api_key: String,
    #[serde(default)]
    pub secret_key: String,
    /// Use testnet instead of production
    #[serde(default)]
    pub testnet: bool,
    /// Connectivity flag; disconnected exchanges are never traded
    #[serde(default = "default_true")]
    pub connected: bool,
    /// Minimum spacing between requests, from the venue's published quota
    pub min_request_interval_ms: u64,
    /// Taker fee per side (0.001 = 0.1%)
    pub taker_fee_rate: Decimal,
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
}

impl ExchangeConfig {
    pub fn binance_defaults() -> Self {
        Self {
            api_key: String::new(),
            secret_key: String::new(),
            testnet: false,
            connected: true,
            min_request_interval_ms: 100,
            taker_fee_rate: Decimal::new(1, 3), // 0.1%
            request_timeout_secs: default_request_timeout(),
        }
    }

    pub fn gateio_defaults() -> Self {
        Self {
            api_key: String::new(),
            secret_key: String::new(),
            testnet: false,
            connected: true,
            min_request_interval_ms: 1000,
            taker_fee_rate: Decimal::new(2, 3), // 0.2%
            request_timeout_secs: default_request_timeout(),
        }
    }

    pub fn min_request_interval(&self) -> Duration {
        Duration::from_millis(self.min_request_interval_ms)
    }

    pub fn has_credentials(&self) -> bool {
        !self.api_key.is_empty() && !self.secret_key.is_empty()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    /// Upper bound of the random delay added to every slot
    #[serde(default = "default_jitter_ms")]
    pub jitter_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    /// Relative jitter applied to each backoff (0.2 = ±20%)
    #[serde(default = "default_retry_jitter")]
    pub jitter: Decimal,
}

/// How the base notional of a new position is chosen.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SizingMode {
    Fixed,
    Volatility,
    Kelly,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SizingConfig {
    #[serde(default = "default_sizing_mode")]
    pub mode: SizingMode,
    /// Fixed per-trade notional in quote currency; also the slot unit
    #[serde(default = "default_fixed_position_size")]
    pub fixed_position_size: Decimal,
    #[serde(default = "default_max_position_size")]
    pub max_position_size: Decimal,
    /// Multiplier applied to the exchange minimum notional
    #[serde(default = "default_min_notional_buffer")]
    pub min_notional_buffer: Decimal,
    /// Smallest net profit worth targeting
    #[serde(default = "default_min_profit_floor")]
    pub min_profit_floor: Decimal,
    /// Win rate assumed when there is no history
    #[serde(default = "default_win_rate")]
    pub default_win_rate: Decimal,
    /// Upper bound on the raw Kelly fraction before halving
    #[serde(default = "default_kelly_ceiling")]
    pub kelly_ceiling: Decimal,
    /// Per-minute volatility considered "normal" for volatility sizing
    #[serde(default = "default_target_volatility")]
    pub target_volatility: Decimal,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SelectionConfig {
    /// Candidate instruments in priority order
    #[serde(default = "default_candidate_pairs")]
    pub candidate_pairs: Vec<Pair>,
    /// Consecutive losses at which a (pair, direction) is blocked
    #[serde(default = "default_loss_streak_ceiling")]
    pub loss_streak_ceiling: u32,
    /// Net P&L below this counts as a loss
    #[serde(default = "default_loss_threshold")]
    pub loss_threshold: Decimal,
    /// How many recent closed trades to scan for a streak
    #[serde(default = "default_streak_lookback")]
    pub streak_lookback: u32,
    #[serde(default = "default_cooldown_minutes")]
    pub cooldown_minutes: u32,
    /// Momentum windows in minutes, shortest first
    #[serde(default = "default_momentum_windows")]
    pub momentum_windows: Vec<u32>,
    #[serde(default = "default_momentum_weights")]
    pub momentum_weights: Vec<Decimal>,
    #[serde(default = "default_win_rate_lookback_days")]
    pub win_rate_lookback_days: u32,
    /// Win-rate gap above which history overrides momentum
    #[serde(default = "default_win_rate_override_gap")]
    pub win_rate_override_gap: Decimal,
    #[serde(default = "default_win_rate_min_samples")]
    pub win_rate_min_samples: u32,
    /// Fall back to the least-blocked candidate when everything is blocked
    #[serde(default = "default_true")]
    pub reset_least_blocked: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AllocationConfig {
    /// Share of free balance usable as margin for new slots
    #[serde(default = "default_margin_fraction")]
    pub margin_fraction: Decimal,
    /// Free balance must exceed min notional times this factor
    #[serde(default = "default_balance_safety_factor")]
    pub balance_safety_factor: Decimal,
    #[serde(default = "default_quote_asset")]
    pub quote_asset: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExitConfig {
    /// Positions older than this are force-exited regardless of profit
    #[serde(default = "default_stale_after_hours")]
    pub stale_after_hours: u32,
    #[serde(default = "default_stop_loss_pct")]
    pub stop_loss_pct: Decimal,
    /// Stop-limit offset below the stop trigger
    #[serde(default = "default_stop_limit_offset_pct")]
    pub stop_limit_offset_pct: Decimal,
    #[serde(default = "default_trailing_stop_pct")]
    pub trailing_stop_pct: Decimal,
    #[serde(default = "default_max_hold_minutes")]
    pub max_hold_minutes: u64,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Place native brackets after entry where the venue supports them
    #[serde(default = "default_true")]
    pub use_brackets: bool,
    /// Lease held on a trade during a multi-step close
    #[serde(default = "default_claim_lease_secs")]
    pub claim_lease_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SweeperConfig {
    #[serde(default = "default_stale_after_hours")]
    pub stale_after_hours: u32,
    #[serde(default = "default_sweep_batch_limit")]
    pub batch_limit: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_database_path")]
    pub database_path: String,
    #[serde(default = "default_lot_cache_ttl_secs")]
    pub lot_cache_ttl_secs: u64,
}

// Default value functions
fn default_true() -> bool {
    true
}

fn default_request_timeout() -> u64 {
    10
}

fn default_jitter_ms() -> u64 {
    50
}

fn default_max_attempts() -> u32 {
    3 // Latency-sensitive path, not a batch job
}

fn default_base_delay_ms() -> u64 {
    1000
}

fn default_max_delay_ms() -> u64 {
    60_000
}

fn default_retry_jitter() -> Decimal {
    Decimal::new(2, 1) // ±20%
}

fn default_sizing_mode() -> SizingMode {
    SizingMode::Fixed
}

fn default_fixed_position_size() -> Decimal {
    Decimal::new(20, 0) // $20
}

fn default_max_position_size() -> Decimal {
    Decimal::new(100, 0)
}

fn default_min_notional_buffer() -> Decimal {
    Decimal::new(11, 1) // 1.1x
}

fn default_min_profit_floor() -> Decimal {
    Decimal::new(5, 2) // $0.05
}

fn default_win_rate() -> Decimal {
    Decimal::new(55, 2)
}

fn default_kelly_ceiling() -> Decimal {
    Decimal::new(25, 2)
}

fn default_target_volatility() -> Decimal {
    Decimal::new(2, 3) // 0.2% per minute
}

fn default_candidate_pairs() -> Vec<Pair> {
    ["BTC", "ETH", "SOL", "XRP"]
        .iter()
        .map(|base| Pair::new(*base, "USDT"))
        .collect()
}

fn default_loss_streak_ceiling() -> u32 {
    3
}

fn default_loss_threshold() -> Decimal {
    Decimal::new(-5, 2) // -$0.05
}

fn default_streak_lookback() -> u32 {
    10
}

fn default_cooldown_minutes() -> u32 {
    5
}

fn default_momentum_windows() -> Vec<u32> {
    vec![5, 15, 60]
}

fn default_momentum_weights() -> Vec<Decimal> {
    vec![Decimal::new(5, 1), Decimal::new(3, 1), Decimal::new(2, 1)]
}

fn default_win_rate_lookback_days() -> u32 {
    7
}

fn default_win_rate_override_gap() -> Decimal {
    Decimal::new(15, 2)
}

fn default_win_rate_min_samples() -> u32 {
    5
}

fn default_margin_fraction() -> Decimal {
    Decimal::new(9, 1)
}

fn default_balance_safety_factor() -> Decimal {
    Decimal::new(11, 1)
}

fn default_quote_asset() -> String {
    "USDT".to_string()
}

fn default_stale_after_hours() -> u32 {
    48
}

fn default_stop_loss_pct() -> Decimal {
    Decimal::new(3, 2) // 3%
}

fn default_stop_limit_offset_pct() -> Decimal {
    Decimal::new(1, 3) // 0.1%
}

fn default_trailing_stop_pct() -> Decimal {
    Decimal::new(15, 3) // 1.5%
}

fn default_max_hold_minutes() -> u64 {
    240
}

fn default_poll_interval_ms() -> u64 {
    2000
}

fn default_claim_lease_secs() -> u64 {
    60
}

fn default_sweep_batch_limit() -> u32 {
    200
}

fn default_database_path() -> String {
    "data/tradebot.db".to_string()
}

fn default_lot_cache_ttl_secs() -> u64 {
    3600
}

impl Config {
    /// Load configuration from environment variables and config files.
    pub fn load() -> Result<Self> {
        dotenvy::dotenv().ok();

        // Per-venue pacing and fees differ, so they are seeded here rather
        // than through field-level serde defaults.
        let binance = ExchangeConfig::binance_defaults();
        let gateio = ExchangeConfig::gateio_defaults();

        let config = config::Config::builder()
            .set_default(
                "exchanges.binance.min_request_interval_ms",
                binance.min_request_interval_ms,
            )?
            .set_default(
                "exchanges.binance.taker_fee_rate",
                binance.taker_fee_rate.to_string(),
            )?
            .set_default(
                "exchanges.gateio.min_request_interval_ms",
                gateio.min_request_interval_ms,
            )?
            .set_default(
                "exchanges.gateio.taker_fee_rate",
                gateio.taker_fee_rate.to_string(),
            )?
            .add_source(config::File::with_name("config").required(false))
            .add_source(config::Environment::default().separator("__").prefix("TBE"))
            .build()
            .context("Failed to build configuration")?;

        config
            .try_deserialize()
            .context("Failed to deserialize configuration")
    }

    /// Validate configuration values.
    pub fn validate(&self) -> Result<()> {
        anyhow::ensure!(
            self.retry.max_attempts >= 1,
            "retry.max_attempts must be at least 1"
        );

        anyhow::ensure!(
            self.retry.base_delay_ms <= self.retry.max_delay_ms,
            "retry.base_delay_ms must not exceed retry.max_delay_ms"
        );

        anyhow::ensure!(
            self.retry.jitter >= Decimal::ZERO && self.retry.jitter < Decimal::ONE,
            "retry.jitter must be in [0, 1)"
        );

        anyhow::ensure!(
            self.sizing.fixed_position_size > Decimal::ZERO
                && self.sizing.fixed_position_size <= self.sizing.max_position_size,
            "sizing.fixed_position_size must be > 0 and <= max_position_size"
        );

        anyhow::ensure!(
            self.selection.momentum_windows.len() == self.selection.momentum_weights.len()
                && !self.selection.momentum_windows.is_empty(),
            "selection.momentum_windows and momentum_weights must be non-empty and equal length"
        );

        anyhow::ensure!(
            self.allocation.margin_fraction > Decimal::ZERO
                && self.allocation.margin_fraction <= Decimal::ONE,
            "allocation.margin_fraction must be between 0 and 1"
        );

        anyhow::ensure!(
            self.selection.loss_threshold <= Decimal::ZERO,
            "selection.loss_threshold must not be positive"
        );

        Ok(())
    }
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            jitter_ms: default_jitter_ms(),
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            jitter: default_retry_jitter(),
        }
    }
}

impl Default for SizingConfig {
    fn default() -> Self {
        Self {
            mode: default_sizing_mode(),
            fixed_position_size: default_fixed_position_size(),
            max_position_size: default_max_position_size(),
            min_notional_buffer: default_min_notional_buffer(),
            min_profit_floor: default_min_profit_floor(),
            default_win_rate: default_win_rate(),
            kelly_ceiling: default_kelly_ceiling(),
            target_volatility: default_target_volatility(),
        }
    }
}

impl Default for SelectionConfig {
    fn default() -> Self {
        Self {
            candidate_pairs: default_candidate_pairs(),
            loss_streak_ceiling: default_loss_streak_ceiling(),
            loss_threshold: default_loss_threshold(),
            streak_lookback: default_streak_lookback(),
            cooldown_minutes: default_cooldown_minutes(),
            momentum_windows: default_momentum_windows(),
            momentum_weights: default_momentum_weights(),
            win_rate_lookback_days: default_win_rate_lookback_days(),
            win_rate_override_gap: default_win_rate_override_gap(),
            win_rate_min_samples: default_win_rate_min_samples(),
            reset_least_blocked: true,
        }
    }
}

impl Default for AllocationConfig {
    fn default() -> Self {
        Self {
            margin_fraction: default_margin_fraction(),
            balance_safety_factor: default_balance_safety_factor(),
            quote_asset: default_quote_asset(),
        }
    }
}

impl Default for ExitConfig {
    fn default() -> Self {
        Self {
            stale_after_hours: default_stale_after_hours(),
            stop_loss_pct: default_stop_loss_pct(),
            stop_limit_offset_pct: default_stop_limit_offset_pct(),
            trailing_stop_pct: default_trailing_stop_pct(),
            max_hold_minutes: default_max_hold_minutes(),
            poll_interval_ms: default_poll_interval_ms(),
            use_brackets: true,
            claim_lease_secs: default_claim_lease_secs(),
        }
    }
}

impl Default for SweeperConfig {
    fn default() -> Self {
        Self {
            stale_after_hours: default_stale_after_hours(),
            batch_limit: default_sweep_batch_limit(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            database_path: default_database_path(),
            lot_cache_ttl_secs: default_lot_cache_ttl_secs(),
        }
    }
}
