//! Live and paper trading loop.

use crate::config::Config;
use crate::exchange::{
    Candle, DominanceSource, MarketDataSource, OrderGateway, OrderResponse, OrderSide,
};
use crate::market::MarketDataHandler;
use crate::persistence::{PersistedState, PersistenceManager};
use crate::risk::{ExitReason, StopLevels};
use crate::strategy::{align_closes, AltSeasonGate, Signal, SignalGenerator, TradeExecutor};
use crate::trading::book::{TradeAction, TradeBook, TradeRecord};
use crate::utils::{decimal_from_f64, normalize_decimal, safe_div};
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// What happened during one iteration.
#[derive(Debug, Clone, Default)]
pub struct IterationReport {
    pub btc_dominance: Option<Decimal>,
    pub entries_allowed: bool,
    pub pairs_processed: usize,
    pub pairs_failed: usize,
    pub opened: Vec<String>,
    pub closed: Vec<TradeRecord>,
}

pub struct TradingBot<M, O, D> {
    config: Config,
    market: MarketDataHandler<M, D>,
    executor: TradeExecutor<O>,
    signals: SignalGenerator,
    gate: AltSeasonGate,
    book: TradeBook,
    persistence: Option<PersistenceManager>,
    /// Closed trades not yet written to the database
    unsaved_trades: Vec<TradeRecord>,
    iterations: u64,
}

impl<M, O, D> TradingBot<M, O, D>
where
    M: MarketDataSource,
    O: OrderGateway,
    D: DominanceSource,
{
    pub fn new(config: Config, source: Arc<M>, gateway: Arc<O>, dominance: Arc<D>) -> Self {
        let market = MarketDataHandler::new(source, dominance, config.market.clone());
        let executor = TradeExecutor::new(gateway, config.execution.clone());
        let signals = SignalGenerator::new(config.signal.clone());
        let gate = AltSeasonGate::new(
            config.market.btc_dominance_threshold,
            config.market.alt_season_gate,
        );
        let book = TradeBook::new(config.trading.initial_balance, config.risk.clone(), Utc::now());

        Self {
            config,
            market,
            executor,
            signals,
            gate,
            book,
            persistence: None,
            unsaved_trades: Vec::new(),
            iterations: 0,
        }
    }

    /// Attach a database and restore any state saved in it.
    pub fn with_persistence(mut self, persistence: PersistenceManager) -> Result<Self> {
        if let Some(state) = persistence.load_state()? {
            let history = persistence.all_trades()?;
            self.book
                .restore(state.initial_balance, state.balance, state.positions, history);
            self.book
                .restore_drawdown(state.peak_equity, state.max_drawdown, state.last_saved);
            if state.daily_date == Utc::now().date_naive() {
                self.book
                    .risk_mut()
                    .restore_daily(state.daily_date, state.daily_pnl, state.daily_trades);
            }
        } else {
            info!(balance = %self.book.balance(), "No previous state found, starting fresh");
        }
        self.persistence = Some(persistence);
        Ok(self)
    }

    pub fn book(&self) -> &TradeBook {
        &self.book
    }

    /// Run until `shutdown` is set.
    pub async fn run(&mut self, shutdown: Arc<AtomicBool>) -> Result<()> {
        let interval = Duration::from_secs(self.config.trading.update_interval_secs);
        let backoff = Duration::from_secs(self.config.trading.error_backoff_secs);

        info!(
            mode = %self.config.trading.mode,
            pairs = ?self.config.trading.pairs,
            interval_secs = interval.as_secs(),
            "Starting trading loop"
        );

        while !shutdown.load(Ordering::SeqCst) {
            let started = Utc::now();
            let wait = match self.run_iteration().await {
                Ok(report) => {
                    debug!(
                        elapsed_ms = (Utc::now() - started).num_milliseconds(),
                        processed = report.pairs_processed,
                        failed = report.pairs_failed,
                        "Iteration completed"
                    );
                    interval
                }
                Err(e) => {
                    error!(error = %e, backoff_secs = backoff.as_secs(), "Error in main loop");
                    backoff
                }
            };
            sleep_unless_shutdown(wait, &shutdown).await;
        }

        self.save_state()?;
        self.log_summary();
        info!("Trading loop stopped");
        Ok(())
    }

    /// One pass over every configured pair.
    pub async fn run_iteration(&mut self) -> Result<IterationReport> {
        self.iterations += 1;
        let now = Utc::now();
        info!(iteration = self.iterations, "Starting iteration");

        let mut report = IterationReport::default();
        report.btc_dominance = self.market.btc_dominance().await;
        report.entries_allowed = self.gate.allows_entries(report.btc_dominance);

        match report.btc_dominance {
            Some(dominance) if !report.entries_allowed => {
                info!(
                    dominance = %dominance.round_dp(2),
                    threshold = %self.gate.threshold(),
                    "Not alt season, new entries paused"
                );
            }
            Some(dominance) => info!(dominance = %dominance.round_dp(2), "BTC dominance"),
            None => warn!("BTC dominance unavailable, entries allowed"),
        }

        let btc = if self.config.market.correlation_filter {
            let candles = self
                .market
                .fetch_candles(
                    &self.config.market.btc_pair,
                    &self.config.trading.timeframe,
                    self.config.trading.live_days,
                )
                .await;
            (!candles.is_empty()).then_some(candles)
        } else {
            None
        };

        let pairs = self.config.trading.pairs.clone();
        for pair in &pairs {
            match self
                .process_pair(pair, report.entries_allowed, btc.as_deref(), now)
                .await
            {
                Ok(outcome) => {
                    report.pairs_processed += 1;
                    match outcome {
                        PairOutcome::Opened => report.opened.push(pair.clone()),
                        PairOutcome::Closed(record) => report.closed.push(record),
                        PairOutcome::Unchanged => {}
                    }
                }
                Err(e) => {
                    report.pairs_failed += 1;
                    error!(pair = %pair, error = %e, "Error processing pair");
                }
            }
        }

        self.mark_positions(now).await;

        self.unsaved_trades.extend(report.closed.iter().cloned());
        self.record_trades();
        self.save_state()?;

        Ok(report)
    }

    /// Write pending closed trades; whatever fails stays queued for the next iteration.
    fn record_trades(&mut self) {
        let Some(persistence) = &self.persistence else {
            self.unsaved_trades.clear();
            return;
        };

        let mut recorded = 0;
        for trade in &self.unsaved_trades {
            if let Err(e) = persistence.record_trade(trade) {
                error!(
                    pair = %trade.pair,
                    pending = self.unsaved_trades.len() - recorded,
                    error = %e,
                    "Failed to record trade, will retry"
                );
                break;
            }
            recorded += 1;
        }
        self.unsaved_trades = self.unsaved_trades.split_off(recorded);
    }

    async fn process_pair(
        &mut self,
        pair: &str,
        entries_allowed: bool,
        btc: Option<&[Candle]>,
        now: DateTime<Utc>,
    ) -> Result<PairOutcome> {
        let candles = self
            .market
            .fetch_candles(pair, &self.config.trading.timeframe, self.config.trading.live_days)
            .await;
        if candles.len() < self.config.signal.ema_slow {
            warn!(pair, count = candles.len(), "Not enough candles for signals");
            return Ok(PairOutcome::Unchanged);
        }

        let index = candles.len() - 1;
        let frame = self.signals.compute_indicators(&candles);
        let aligned = btc.map(|b| align_closes(&candles, b));
        let in_position = self.book.in_position(pair);

        let mut signal = self
            .signals
            .evaluate(pair, &frame, &candles, index, in_position, aligned.as_deref());
        if signal == Signal::Buy && !entries_allowed {
            info!(pair, "Buy signal ignored outside alt season");
            signal = Signal::Hold;
        }

        let last_close = decimal_from_f64(candles[index].close)
            .with_context(|| format!("Invalid close for {pair}"))?;
        let price = self.market.current_price(pair).await.unwrap_or(last_close);
        let atr = frame
            .atr_at(index)
            .and_then(|a| decimal_from_f64(a).ok())
            .unwrap_or(Decimal::ZERO);

        match self.book.decide(pair, signal, price, atr, now) {
            TradeAction::Open { size, levels } => self.enter(pair, size, price, &levels, now).await,
            TradeAction::Close { reason } => self.exit(pair, price, reason, now).await,
            TradeAction::Hold => Ok(PairOutcome::Unchanged),
        }
    }

    async fn enter(
        &mut self,
        pair: &str,
        size: Decimal,
        price: Decimal,
        levels: &StopLevels,
        now: DateTime<Utc>,
    ) -> Result<PairOutcome> {
        let price = normalize_decimal(price);
        if price <= Decimal::ZERO {
            warn!(pair, "Price rounds to zero, skipping buy");
            return Ok(PairOutcome::Unchanged);
        }

        let quantity = normalize_decimal(size / price);
        let response = self.executor.execute(pair, OrderSide::Buy, quantity, price).await?;

        let Some(fill) = filled_price(&response) else {
            info!(pair, order_id = response.order_id, status = ?response.status, "Buy order not filled");
            return Ok(PairOutcome::Unchanged);
        };

        let ratio = fill_ratio(&response, quantity);
        let size = normalize_decimal(size * ratio);
        if ratio < Decimal::ONE {
            info!(pair, ratio = %ratio, size = %size, "Buy order partially filled");
        }

        self.book
            .open(pair, fill, size, levels, now)
            .with_context(|| format!("Failed to open position for {pair}"))?;
        Ok(PairOutcome::Opened)
    }

    async fn exit(
        &mut self,
        pair: &str,
        price: Decimal,
        reason: ExitReason,
        now: DateTime<Utc>,
    ) -> Result<PairOutcome> {
        let quantity = self
            .book
            .position(pair)
            .map(|p| p.quantity)
            .context("No position to close")?;

        info!(pair, reason = %reason, price = %price, "Closing position");
        let response = self.executor.execute(pair, OrderSide::Sell, quantity, price).await?;

        let Some(fill) = filled_price(&response) else {
            info!(pair, order_id = response.order_id, status = ?response.status, "Sell order not filled");
            return Ok(PairOutcome::Unchanged);
        };

        let mut ratio = fill_ratio(&response, quantity);
        if ratio < Decimal::ONE {
            let remainder = normalize_decimal(quantity * (Decimal::ONE - ratio) * fill);
            let min_trade = self.book.risk().config().min_trade_amount;
            if remainder < min_trade {
                info!(pair, remainder = %remainder, "Unsold remainder below minimum trade, closing in full");
                ratio = Decimal::ONE;
            } else {
                info!(pair, ratio = %ratio, remainder = %remainder, "Sell order partially filled");
            }
        }

        let record = self
            .book
            .close_partial(pair, fill, ratio, reason, now)
            .with_context(|| format!("Failed to close position for {pair}"))?
            .context("Position vanished before close")?;
        Ok(PairOutcome::Closed(record))
    }

    /// Log open positions and mark equity at current prices.
    async fn mark_positions(&mut self, now: DateTime<Utc>) {
        let mut prices = HashMap::new();
        for (pair, position) in self.book.positions() {
            let price = self.market.current_price(pair).await.unwrap_or(position.entry_price);
            prices.insert(pair.clone(), price);
            let value = position.current_value(price);
            info!(
                pair = %pair,
                entry = %position.entry_price,
                price = %price,
                unrealized_pnl = %value.unrealized_pnl,
                stop = ?position.current_stop,
                target = ?position.take_profit,
                "Open position"
            );
        }

        let today = self.book.daily_stats(Utc::now().date_naive());
        info!(
            trades = today.trades,
            pnl = %today.pnl,
            win_rate = %today.win_rate,
            balance = %self.book.balance(),
            "Today's trading statistics"
        );

        let equity = self.book.equity(&prices);
        self.book.record_equity(equity, now);
        if let Some(room) = self.book.drawdown().near_alert() {
            warn!(
                drawdown = %self.book.drawdown().current_drawdown().round_dp(4),
                room = %room.round_dp(4),
                equity = %equity,
                "Drawdown approaching alert level"
            );
        }
    }

    fn save_state(&self) -> Result<()> {
        let Some(persistence) = &self.persistence else {
            return Ok(());
        };

        let risk = self.book.risk();
        let state = PersistedState {
            initial_balance: self.book.initial_balance(),
            balance: self.book.balance(),
            daily_date: Utc::now().date_naive(),
            daily_pnl: risk.daily_pnl(),
            daily_trades: risk.daily_trades(),
            peak_equity: self.book.drawdown().peak_equity(),
            max_drawdown: self.book.drawdown().max_drawdown(),
            positions: self.book.positions().values().cloned().collect(),
            last_saved: Utc::now(),
        };
        persistence.save_state(&state).context("Failed to save state")
    }

    fn log_summary(&self) {
        let summary = self.book.summary();
        info!(
            trades = summary.trades,
            win_rate = %summary.win_rate,
            total_pnl = %summary.total_pnl,
            total_fees = %summary.total_fees,
            balance = %summary.balance,
            max_drawdown = %summary.max_drawdown.round_dp(4),
            peak_equity = %self.book.drawdown().peak_equity(),
            "Final statistics"
        );
    }
}

enum PairOutcome {
    Opened,
    Closed(TradeRecord),
    Unchanged,
}

/// Average fill price, or None when nothing executed.
fn filled_price(response: &OrderResponse) -> Option<Decimal> {
    if response.executed_qty <= Decimal::ZERO {
        return None;
    }
    response
        .avg_fill_price()
        .filter(|p| *p > Decimal::ZERO)
        .or(Some(response.price))
        .filter(|p| *p > Decimal::ZERO)
        .map(normalize_decimal)
}

/// Share of `requested` that executed, capped at one.
fn fill_ratio(response: &OrderResponse, requested: Decimal) -> Decimal {
    if requested <= Decimal::ZERO {
        return Decimal::ONE;
    }
    safe_div(response.executed_qty, requested).min(Decimal::ONE)
}

async fn sleep_unless_shutdown(total: Duration, shutdown: &AtomicBool) {
    let step = Duration::from_secs(1);
    let mut waited = Duration::ZERO;
    while waited < total && !shutdown.load(Ordering::SeqCst) {
        let chunk = step.min(total - waited);
        tokio::time::sleep(chunk).await;
        waited += chunk;
    }
}
