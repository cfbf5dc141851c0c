//! Altseason Trader - Main Entry Point

use altseason_trader::backtest::{
    write_candles_csv, BacktestConfig, BacktestEngine, BacktestResult, CandleDataLoader, CsvCandleLoader,
};
use altseason_trader::config::{Config, TradingMode};
use altseason_trader::exchange::{to_exchange_symbol, BinanceClient, Candle, CoinGeckoClient, PaperExchange};
use altseason_trader::market::MarketDataHandler;
use altseason_trader::monitor;
use altseason_trader::persistence::PersistenceManager;
use altseason_trader::trading::TradingBot;
use altseason_trader::utils::{decimal_from_f64, safe_div};
use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{info, warn, Level};
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::EnvFilter;

/// Altseason Trader CLI
#[derive(Parser)]
#[command(name = "altseason-trader")]
#[command(version, about = "Alt season spot trading bot for Binance")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run in the mode set by configuration (default)
    Run,

    /// Run a backtest on historical candles
    Backtest {
        /// CSV file with candles (fetched from Binance when omitted)
        #[arg(short, long)]
        data: Option<String>,

        /// CSV file with BTC candles for the correlation filter
        #[arg(long)]
        btc_data: Option<String>,

        /// Pair to test (defaults to every configured pair)
        #[arg(short, long)]
        pair: Option<String>,

        /// Days of history to fetch
        #[arg(long)]
        days: Option<u32>,

        /// Initial balance for simulation
        #[arg(short = 'b', long)]
        initial_balance: Option<f64>,

        /// Output directory for results
        #[arg(short, long)]
        output: Option<String>,
    },

    /// Show persisted bot state and recent trades
    Status {
        /// Path to SQLite database (defaults to the configured path)
        #[arg(short, long)]
        db: Option<String>,

        /// Show detailed position and trade information
        #[arg(short, long)]
        verbose: bool,
    },

    /// Analyze the latest log file and run the decimal self-check
    Monitor {
        /// Log directory (defaults to the configured directory)
        #[arg(short, long)]
        log_dir: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = Config::load()?;

    match &cli.command {
        Some(Commands::Status { db, verbose }) => {
            return show_status(db.as_deref().unwrap_or(&config.trading.db_path), *verbose);
        }
        Some(Commands::Monitor { log_dir }) => {
            return run_monitor(log_dir.as_deref().unwrap_or(&config.trading.log_dir));
        }
        _ => {}
    }

    init_logging(&config.trading.log_dir)?;
    config.validate().context("Invalid configuration")?;

    match cli.command {
        Some(Commands::Backtest {
            data,
            btc_data,
            pair,
            days,
            initial_balance,
            output,
        }) => {
            let options = BacktestOptions {
                data,
                btc_data,
                pair,
                days: days.unwrap_or(config.trading.backtest_days),
                initial_balance,
                output,
            };
            run_backtest(config, options).await
        }
        _ => run(config).await,
    }
}

/// Run the bot in the configured mode.
async fn run(config: Config) -> Result<()> {
    info!(
        version = env!("CARGO_PKG_VERSION"),
        mode = %config.trading.mode,
        "Altseason Trader starting"
    );
    log_config(&config);

    if config.trading.mode == TradingMode::Backtest {
        let options = BacktestOptions {
            days: config.trading.backtest_days,
            ..BacktestOptions::default()
        };
        return run_backtest(config, options).await;
    }

    let binance = Arc::new(BinanceClient::new(&config.binance)?);
    let dominance = Arc::new(CoinGeckoClient::new(&config.market.coingecko_url)?);
    let persistence = PersistenceManager::new(&config.trading.db_path)
        .with_context(|| format!("Failed to open database {}", config.trading.db_path))?;

    let shutdown = Arc::new(AtomicBool::new(false));
    let signal_flag = shutdown.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("Received shutdown signal");
        signal_flag.store(true, Ordering::SeqCst);
    });

    if config.trading.mode == TradingMode::Live {
        anyhow::ensure!(
            binance.has_credentials(),
            "Live mode requires BINANCE_API_KEY and BINANCE_API_SECRET"
        );
        warn!("LIVE TRADING MODE - real orders will be placed");
        let mut bot = TradingBot::new(config, binance.clone(), binance, dominance)
            .with_persistence(persistence)?;
        bot.run(shutdown).await?;
    } else {
        info!("Paper trading mode - orders are simulated");
        let paper = Arc::new(
            PaperExchange::new(config.trading.initial_balance, config.risk.fee_rate)
                .with_price_feed(binance.clone()),
        );
        let mut bot = TradingBot::new(config, binance, paper.clone(), dominance)
            .with_persistence(persistence)?;

        // Restored positions must be sellable on the simulated account
        let holdings = bot
            .book()
            .positions()
            .values()
            .map(|p| (to_exchange_symbol(&p.pair), p.quantity))
            .collect();
        paper.restore_state(bot.book().balance(), holdings).await;

        bot.run(shutdown).await?;
    }

    info!("Altseason Trader shutdown complete");
    Ok(())
}

#[derive(Debug, Default)]
struct BacktestOptions {
    data: Option<String>,
    btc_data: Option<String>,
    pair: Option<String>,
    days: u32,
    initial_balance: Option<f64>,
    output: Option<String>,
}

/// Backtest one CSV file, or every requested pair fetched from Binance.
async fn run_backtest(config: Config, options: BacktestOptions) -> Result<()> {
    let initial_balance = match options.initial_balance {
        Some(balance) => decimal_from_f64(balance).context("Invalid initial balance")?,
        None => config.trading.initial_balance,
    };
    let backtest_config = BacktestConfig {
        initial_balance,
        record_equity_curve: true,
    };
    let engine = BacktestEngine::new(config.clone(), backtest_config);

    let btc_from_file = match &options.btc_data {
        Some(path) => Some(load_csv(path)?),
        None => None,
    };

    if let Some(path) = &options.data {
        let pair = options
            .pair
            .clone()
            .or_else(|| config.trading.pairs.first().cloned())
            .context("No pair given for CSV data")?;
        let candles = load_csv(path)?;
        let result = engine.run(&pair, &candles, btc_from_file.as_deref())?;
        return report_backtest(&result, options.output.as_deref());
    }

    let binance = Arc::new(BinanceClient::new(&config.binance)?);
    let dominance = Arc::new(CoinGeckoClient::new(&config.market.coingecko_url)?);
    let market = MarketDataHandler::new(binance, dominance, config.market.clone());
    let timeframe = config.trading.timeframe.as_str();

    let btc = match btc_from_file {
        Some(candles) => Some(candles),
        None if config.market.correlation_filter => {
            let candles = market
                .fetch_candles(&config.market.btc_pair, timeframe, options.days)
                .await;
            (!candles.is_empty()).then_some(candles)
        }
        None => None,
    };

    let pairs = match &options.pair {
        Some(pair) => vec![pair.clone()],
        None => config.trading.pairs.clone(),
    };

    let mut results = Vec::with_capacity(pairs.len());
    for pair in &pairs {
        let candles = market.fetch_candles(pair, timeframe, options.days).await;
        if let Some(dir) = options.output.as_deref() {
            std::fs::create_dir_all(dir)?;
            let path = format!("{}/{}_{}.csv", dir, to_exchange_symbol(pair), timeframe);
            write_candles_csv(&path, &candles)?;
        }

        match engine.run(pair, &candles, btc.as_deref()) {
            Ok(result) => {
                report_backtest(&result, options.output.as_deref())?;
                results.push(result);
            }
            Err(e) => warn!(pair = %pair, error = %e, "Backtest skipped"),
        }
    }

    if results.len() > 1 {
        print_combined(&results, initial_balance);
    }
    Ok(())
}

fn load_csv(path: &str) -> Result<Vec<Candle>> {
    info!(path, "Loading candles");
    let loader = CsvCandleLoader::new(path)?;
    if let Some((start, end)) = loader.available_range() {
        info!(
            candles = loader.len(),
            from = %start.format("%Y-%m-%d %H:%M"),
            to = %end.format("%Y-%m-%d %H:%M"),
            "Data range"
        );
    }
    loader.load_candles(None, None)
}

fn report_backtest(result: &BacktestResult, output_dir: Option<&str>) -> Result<()> {
    println!("\n{}", result.summary());

    if let Some(dir) = output_dir {
        std::fs::create_dir_all(dir)?;
        let symbol = to_exchange_symbol(&result.pair);

        let equity_path = format!("{}/{}_equity_curve.csv", dir, symbol);
        result.equity_to_csv(&equity_path)?;
        info!(path = %equity_path, "Equity curve saved");

        let trades_path = format!("{}/{}_trades.csv", dir, symbol);
        result.trades_to_csv(&trades_path)?;
        info!(path = %trades_path, "Trades saved");
    }
    Ok(())
}

fn print_combined(results: &[BacktestResult], initial_balance: Decimal) {
    let trades: usize = results.iter().map(|r| r.book.trades).sum();
    let wins: usize = results.iter().map(|r| r.book.wins).sum();
    let pnl: Decimal = results.iter().map(|r| r.book.total_pnl).sum();
    let fees: Decimal = results.iter().map(|r| r.book.total_fees).sum();
    let win_rate = safe_div(Decimal::from(wins as u64) * dec!(100), Decimal::from(trades as u64));

    println!("\n═══ COMBINED ({} pairs) ═══", results.len());
    println!("   ├─ Trades:      {}", trades);
    println!("   ├─ Win Rate:    {:.2}%", win_rate);
    println!("   ├─ Total PnL:   ${:.4}", pnl);
    println!("   ├─ Total Fees:  ${:.4}", fees);
    println!(
        "   └─ Return:      {:.2}% per ${:.2} book",
        safe_div(pnl * dec!(100), initial_balance),
        initial_balance
    );
}

/// Initialize logging to stdout and an hourly rolling file.
fn init_logging(log_dir: &str) -> Result<()> {
    use tracing_subscriber::fmt::writer::MakeWriterExt;

    std::fs::create_dir_all(log_dir)?;

    let file_appender = tracing_appender::rolling::hourly(log_dir, "trading-bot.log");
    let (file_writer, _guard) = tracing_appender::non_blocking(file_appender);

    // Keep the writer alive for the program duration
    Box::leak(Box::new(_guard));

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive("altseason_trader=debug".parse()?)
                .add_directive(Level::INFO.into()),
        )
        .with_writer(std::io::stdout.and(file_writer))
        .with_target(true)
        .with_thread_ids(false)
        .with_file(true)
        .with_line_number(true)
        .with_span_events(FmtSpan::CLOSE)
        .with_ansi(false)
        .init();

    Ok(())
}

fn log_config(config: &Config) {
    info!(
        pairs = ?config.trading.pairs,
        timeframe = %config.trading.timeframe,
        interval_secs = config.trading.update_interval_secs,
        initial_balance = %config.trading.initial_balance,
        "Trading configuration"
    );
    info!(
        dominance_threshold = %config.market.btc_dominance_threshold,
        gate = config.market.alt_season_gate,
        correlation_filter = config.market.correlation_filter,
        "Market configuration"
    );
    info!(
        max_position = %(config.risk.max_position_size * dec!(100)),
        max_allocation = %(config.risk.max_portfolio_allocation * dec!(100)),
        max_daily_loss = %(config.risk.max_daily_loss * dec!(100)),
        max_trades_per_day = config.risk.max_trades_per_day,
        "Risk limits (%)"
    );
}

/// Show persisted bot state.
fn show_status(db_path: &str, verbose: bool) -> Result<()> {
    println!("╔════════════════════════════════════════════════════════════╗");
    println!("║              ALTSEASON TRADER STATUS                       ║");
    println!("╚════════════════════════════════════════════════════════════╝");

    if !Path::new(db_path).exists() {
        println!("\n❌ Database not found: {}", db_path);
        println!("   The bot has not been started yet, or the database path is incorrect.");
        return Ok(());
    }

    let persistence = PersistenceManager::new(db_path)?;

    let Some(state) = persistence.load_state()? else {
        println!("\n❌ No saved state found in database.");
        return Ok(());
    };

    let exposure: Decimal = state.positions.iter().map(|p| p.entry_cost).sum();
    let realized = state.balance + exposure - state.initial_balance;
    let realized_pct = safe_div(realized * dec!(100), state.initial_balance);

    println!("\n📊 Account Summary");
    println!("   ├─ Initial Balance:  ${:.2}", state.initial_balance);
    println!("   ├─ Free Balance:     ${:.2}", state.balance);
    println!("   ├─ In Positions:     ${:.2}", exposure);
    println!("   ├─ Realized PnL:     ${:.2} ({:+.2}%)", realized, realized_pct);
    println!("   └─ Last Updated:     {}", state.last_saved.format("%Y-%m-%d %H:%M:%S UTC"));

    println!("\n📈 Today ({})", state.daily_date);
    println!("   ├─ Trades:           {}", state.daily_trades);
    println!("   └─ PnL:              ${:.4}", state.daily_pnl);

    if !state.positions.is_empty() {
        println!("\n🔓 Open Positions");
        for pos in &state.positions {
            println!("   ┌─ {}", pos.pair);
            println!("   ├─ Entry:    {} @ ${:.4} (${:.2})", pos.quantity, pos.entry_price, pos.usdt_size);
            if let Some(stop) = pos.current_stop {
                println!("   ├─ Stop:     ${:.4}", stop);
            }
            if let Some(target) = pos.take_profit {
                println!("   ├─ Target:   ${:.4}", target);
            }
            println!("   └─ Opened:   {}", pos.opened_at.format("%Y-%m-%d %H:%M:%S UTC"));

            if verbose {
                let hours = (Utc::now() - pos.opened_at).num_hours();
                println!("       Duration: {}h", hours);
            }
        }
    }

    let limit = if verbose { 50 } else { 10 };
    let trades = persistence.recent_trades(limit)?;
    if !trades.is_empty() {
        println!("\n📜 Recent Trades");
        for t in &trades {
            println!(
                "   ├─ {} {} ${:.4} -> ${:.4}  pnl ${:.4}  ({})",
                t.closed_at.format("%Y-%m-%d %H:%M"),
                t.pair,
                t.entry_price,
                t.exit_price,
                t.pnl,
                t.exit_reason
            );
        }
    }

    println!();
    Ok(())
}

/// Analyze the newest log and check decimal normalization.
fn run_monitor(log_dir: &str) -> Result<()> {
    println!("\n=== Decimal Self-Check ===");
    let outcomes = monitor::self_check();
    for outcome in &outcomes {
        println!(
            "   {} {} -> {} (expected {})",
            if outcome.passed() { "✅" } else { "❌" },
            outcome.input,
            outcome.actual,
            outcome.expected
        );
    }
    let passed = outcomes.iter().filter(|o| o.passed()).count();
    println!("   {}/{} passed", passed, outcomes.len());

    println!("\n=== Logs ===");
    match monitor::analyze_latest(log_dir)? {
        Some((path, report)) => {
            println!("Latest log: {}\n", path.display());
            println!("{}", report);
            if !report.is_clean() {
                println!("\nReview errors in the log file.");
            }
        }
        None => println!("No log files found in {}", log_dir),
    }

    anyhow::ensure!(passed == outcomes.len(), "decimal self-check failed");
    Ok(())
}
