//! Tradebot Engine - Main Entry Point
//!
//! Runs trading cycles, exit passes and reconciliation sweeps against live
//! venues or the in-memory mock exchange.

use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn, Level};
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::EnvFilter;
use tradebot_engine::config::Config;
use tradebot_engine::exchange::{
    BinanceAdapter, Exchange, ExchangeAdapter, ExchangeGateway, GateIoAdapter, LotSize,
    MockExchange, Pair, TradingMode,
};
use tradebot_engine::persistence::TradeStore;
use tradebot_engine::risk::{ExitManager, ReconciliationSweeper};
use tradebot_engine::strategy::{CycleOutcome, CycleRequest, ExecutionPipeline};

/// Tradebot Engine CLI
#[derive(Parser)]
#[command(name = "tradebot-engine")]
#[command(version, about = "Order execution and exit management for trading bots")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Seed price for the mock exchange, as BASE/QUOTE=PRICE (repeatable)
    #[arg(long = "price", global = true, value_parser = parse_price)]
    prices: Vec<(Pair, Decimal)>,

    /// Quote balance for each mock exchange
    #[arg(long, global = true, default_value = "100")]
    mock_balance: Decimal,
}

#[derive(Subcommand)]
enum Commands {
    /// Run one trading cycle and print the outcome as JSON
    Cycle {
        #[arg(long)]
        bot_id: String,

        #[arg(long)]
        run_id: Option<String>,

        /// Unique per cycle; defaults to the current timestamp
        #[arg(long)]
        cycle_id: Option<String>,

        /// spot or leverage
        #[arg(long, default_value = "spot")]
        mode: TradingMode,

        #[arg(long, default_value = "0.05")]
        target_profit: Decimal,

        /// Exchanges to trade on (repeatable); defaults to all connected
        #[arg(long = "exchange")]
        exchanges: Vec<Exchange>,

        #[arg(long, default_value = "1")]
        leverage: u32,
    },

    /// Run one exit pass over all open trades
    Monitor,

    /// Sweep stale open trades once
    Sweep,

    /// Run cycles, exit passes and sweeps until interrupted
    Run {
        #[arg(long)]
        bot_id: String,

        #[arg(long, default_value = "spot")]
        mode: TradingMode,

        #[arg(long, default_value = "0.05")]
        target_profit: Decimal,

        #[arg(long, default_value = "60")]
        cycle_interval_secs: u64,

        #[arg(long, default_value = "3600")]
        sweep_interval_secs: u64,
    },

    /// Show open trades and bot-run totals
    Status {
        /// Path to the trade database
        #[arg(long)]
        db: Option<String>,
    },
}

fn parse_price(s: &str) -> Result<(Pair, Decimal), String> {
    let (pair, price) = s
        .split_once('=')
        .ok_or_else(|| format!("expected BASE/QUOTE=PRICE, got {s}"))?;
    let price: Decimal = price.parse().map_err(|e| format!("bad price {price}: {e}"))?;
    Ok((pair.parse()?, price))
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    init_logging()?;

    let config = Config::load()?;
    config.validate()?;

    if let Commands::Status { db } = &cli.command {
        let path = db.as_deref().unwrap_or(&config.storage.database_path);
        return show_status(path);
    }

    let store = Arc::new(TradeStore::new(&config.storage.database_path)?);
    let live = std::env::var("LIVE_TRADING").unwrap_or_default() == "true";
    let adapters = if live {
        warn!("LIVE TRADING MODE - Real money at risk!");
        live_adapters(&config)?
    } else {
        info!("MOCK TRADING MODE - Paper trading enabled");
        mock_adapters(&config, &cli.prices, cli.mock_balance).await
    };
    let gateways = ExchangeGateway::build_all(&config, adapters, Some(Arc::clone(&store)));

    match cli.command {
        Commands::Cycle {
            bot_id,
            run_id,
            cycle_id,
            mode,
            target_profit,
            exchanges,
            leverage,
        } => {
            let pipeline = ExecutionPipeline::new(&config, Arc::clone(&store), gateways);
            let request = CycleRequest {
                bot_id,
                run_id,
                cycle_id: cycle_id.unwrap_or_else(|| Utc::now().timestamp_millis().to_string()),
                mode,
                target_profit,
                exchanges: if exchanges.is_empty() {
                    Exchange::ALL.to_vec()
                } else {
                    exchanges
                },
                leverage: Exchange::ALL.iter().map(|ex| (*ex, leverage)).collect(),
                prices: cli.prices.iter().cloned().collect(),
                sandbox: !live,
            };
            let outcome = pipeline.run_cycle(&request).await;
            println!("{}", serde_json::to_string_pretty(&outcome)?);
            if matches!(outcome, CycleOutcome::SystemError { .. }) {
                std::process::exit(1);
            }
        }
        Commands::Monitor => {
            let manager = ExitManager::new(gateways, store, config.exit.clone());
            let report = manager.run_once().await?;
            println!("{report:#?}");
        }
        Commands::Sweep => {
            let sweeper =
                ReconciliationSweeper::new(gateways, store, config.sweeper.clone(), &config.exit);
            let report = sweeper.run_once().await?;
            println!("{report:#?}");
        }
        Commands::Run {
            bot_id,
            mode,
            target_profit,
            cycle_interval_secs,
            sweep_interval_secs,
        } => {
            run_loop(
                &config,
                store,
                gateways,
                RunSettings {
                    bot_id,
                    mode,
                    target_profit,
                    cycle_interval: Duration::from_secs(cycle_interval_secs),
                    sweep_interval: Duration::from_secs(sweep_interval_secs),
                    sandbox: !live,
                },
            )
            .await?;
        }
        Commands::Status { .. } => unreachable!("handled before adapters are built"),
    }

    Ok(())
}

fn live_adapters(config: &Config) -> Result<Vec<Arc<dyn ExchangeAdapter>>> {
    for exchange in Exchange::ALL {
        let exchange_config = config.exchanges.get(exchange);
        anyhow::ensure!(
            !exchange_config.connected || exchange_config.has_credentials(),
            "{exchange} is connected but has no API credentials"
        );
    }

    let mut adapters: Vec<Arc<dyn ExchangeAdapter>> = Vec::new();
    if config.exchanges.binance.connected {
        adapters.push(Arc::new(BinanceAdapter::new(&config.exchanges.binance)?));
    }
    if config.exchanges.gateio.connected {
        adapters.push(Arc::new(GateIoAdapter::new(&config.exchanges.gateio)?));
    }
    Ok(adapters)
}

async fn mock_adapters(
    config: &Config,
    prices: &[(Pair, Decimal)],
    balance: Decimal,
) -> Vec<Arc<dyn ExchangeAdapter>> {
    let mut adapters: Vec<Arc<dyn ExchangeAdapter>> = Vec::new();
    for exchange in Exchange::ALL {
        let exchange_config = config.exchanges.get(exchange);
        if !exchange_config.connected {
            continue;
        }
        let mock = MockExchange::new(exchange, &config.allocation.quote_asset, balance)
            .with_fee_rate(exchange_config.taker_fee_rate)
            .with_brackets(exchange == Exchange::Binance);
        for (pair, price) in prices {
            mock.set_price(pair, *price).await;
            mock.set_closes(pair, vec![*price; 61]).await;
            mock.set_lot_size(
                pair,
                LotSize {
                    step_size: dec!(0.00001),
                    min_qty: dec!(0.00001),
                    min_notional: dec!(10),
                },
            )
            .await;
        }
        adapters.push(Arc::new(mock));
    }
    adapters
}

struct RunSettings {
    bot_id: String,
    mode: TradingMode,
    target_profit: Decimal,
    cycle_interval: Duration,
    sweep_interval: Duration,
    sandbox: bool,
}

async fn run_loop(
    config: &Config,
    store: Arc<TradeStore>,
    gateways: HashMap<Exchange, ExchangeGateway>,
    settings: RunSettings,
) -> Result<()> {
    let pipeline = ExecutionPipeline::new(config, Arc::clone(&store), gateways.clone());
    let exits = ExitManager::new(gateways.clone(), Arc::clone(&store), config.exit.clone());
    let sweeper =
        ReconciliationSweeper::new(gateways, Arc::clone(&store), config.sweeper.clone(), &config.exit);

    let shutdown = Arc::new(AtomicBool::new(false));
    let shutdown_clone = shutdown.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("Shutdown signal received");
        shutdown_clone.store(true, Ordering::SeqCst);
    });

    let run_id = format!("{}-{}", settings.bot_id, Utc::now().format("%Y%m%d%H%M%S"));
    let poll = Duration::from_millis(config.exit.poll_interval_ms.max(1000));
    let mut last_cycle: Option<tokio::time::Instant> = None;
    let mut last_sweep = tokio::time::Instant::now();
    info!(run_id = %run_id, "Trading loop started");

    while !shutdown.load(Ordering::SeqCst) {
        if last_cycle.map_or(true, |t| t.elapsed() >= settings.cycle_interval) {
            let request = CycleRequest {
                bot_id: settings.bot_id.clone(),
                run_id: Some(run_id.clone()),
                cycle_id: Utc::now().timestamp_millis().to_string(),
                mode: settings.mode,
                target_profit: settings.target_profit,
                exchanges: Exchange::ALL.to_vec(),
                leverage: HashMap::new(),
                prices: HashMap::new(),
                sandbox: settings.sandbox,
            };
            match pipeline.run_cycle(&request).await {
                CycleOutcome::SystemError { cause } => error!("Cycle failed: {}", cause),
                outcome => info!(outcome = ?outcome, "Cycle finished"),
            }
            last_cycle = Some(tokio::time::Instant::now());
        }

        if let Err(e) = exits.run_once().await {
            error!("Exit pass failed: {:#}", e);
        }

        if last_sweep.elapsed() >= settings.sweep_interval {
            if let Err(e) = sweeper.run_once().await {
                error!("Sweep failed: {:#}", e);
            }
            last_sweep = tokio::time::Instant::now();
        }

        tokio::time::sleep(poll).await;
    }

    info!("Trading loop stopped");
    Ok(())
}

/// Initialize logging with stdout and an hourly rolling file.
fn init_logging() -> Result<()> {
    use tracing_subscriber::fmt::writer::MakeWriterExt;

    std::fs::create_dir_all("logs")?;

    let file_appender = tracing_appender::rolling::hourly("logs", "tradebot-engine.log");
    let (file_writer, guard) = tracing_appender::non_blocking(file_appender);

    // Leak the guard to keep it alive for the program duration
    Box::leak(Box::new(guard));

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive("tradebot_engine=debug".parse()?)
                .add_directive(Level::INFO.into()),
        )
        .with_writer(std::io::stderr.and(file_writer))
        .with_target(true)
        .with_file(true)
        .with_line_number(true)
        .with_span_events(FmtSpan::CLOSE)
        .with_ansi(true)
        .init();

    Ok(())
}

fn show_status(db_path: &str) -> Result<()> {
    if !Path::new(db_path).exists() {
        println!("Database not found: {}", db_path);
        return Ok(());
    }
    let store = TradeStore::new(db_path).context("Failed to open trade database")?;

    let open = store.open_trades()?;
    println!("Open trades: {}", open.len());
    let now = Utc::now();
    for trade in &open {
        println!(
            "   #{:<5} {:<8} {:<10} {:<5} qty {} @ {}  target ${}  age {}h{}",
            trade.id,
            trade.exchange,
            trade.pair,
            trade.direction,
            trade.quantity,
            trade.entry_price,
            trade.target_profit,
            trade.age_hours(now),
            if trade.holding_for_profit { "  (holding)" } else { "" }
        );
    }

    let runs = store.bot_runs()?;
    println!("\nBot runs: {}", runs.len());
    for run in &runs {
        println!(
            "   {:<24} {:<12} trades {:<4} P&L ${:.4}  hit rate {:.1}%",
            run.run_id,
            run.bot_id,
            run.trades_executed,
            run.total_pnl,
            run.hit_rate() * dec!(100)
        );
    }
    Ok(())
}
