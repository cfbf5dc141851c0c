//! Backtesting simulation engine.
//!
//! Replays historical candles through the signal generator and the trade
//! book, one bar at a time, filling every order at the bar's close.

use crate::backtest::metrics::{BacktestMetrics, EquityPoint};
use crate::backtest::BacktestConfig;
use crate::config::Config;
use crate::exchange::Candle;
use crate::risk::ExitReason;
use crate::strategy::{align_closes, Signal, SignalGenerator};
use crate::trading::{BookSummary, TradeAction, TradeBook, TradeRecord};
use crate::utils::decimal_from_f64;
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::io::Write;
use std::path::Path;
use tracing::{debug, info};

/// Complete result of a backtest run.
#[derive(Debug, Clone)]
pub struct BacktestResult {
    pub pair: String,
    pub metrics: BacktestMetrics,
    pub book: BookSummary,
    pub trades: Vec<TradeRecord>,
    pub equity_curve: Vec<EquityPoint>,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub bars_processed: usize,
    pub buy_signals: usize,
    pub sell_signals: usize,
}

impl BacktestResult {
    /// Export equity curve to CSV.
    pub fn equity_to_csv<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        let mut file = std::fs::File::create(path)
            .with_context(|| format!("Failed to create {}", path.display()))?;
        writeln!(file, "timestamp,balance,unrealized_pnl,total_equity,drawdown,positions")?;

        for point in &self.equity_curve {
            writeln!(
                file,
                "{},{},{},{},{},{}",
                point.timestamp.to_rfc3339(),
                point.balance,
                point.unrealized_pnl,
                point.total_equity,
                point.drawdown.round_dp(8),
                point.position_count,
            )?;
        }

        Ok(())
    }

    /// Export closed trades to CSV.
    pub fn trades_to_csv<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        let mut file = std::fs::File::create(path)
            .with_context(|| format!("Failed to create {}", path.display()))?;
        writeln!(
            file,
            "pair,opened_at,closed_at,entry_price,exit_price,usdt_size,quantity,pnl,fees,exit_reason"
        )?;

        for t in &self.trades {
            writeln!(
                file,
                "{},{},{},{},{},{},{},{},{},{}",
                t.pair,
                t.opened_at.to_rfc3339(),
                t.closed_at.to_rfc3339(),
                t.entry_price,
                t.exit_price,
                t.usdt_size,
                t.quantity,
                t.pnl,
                t.fees,
                t.exit_reason,
            )?;
        }

        Ok(())
    }

    pub fn summary(&self) -> String {
        format!(
            "{}\n\nPair: {}\nBacktest Period: {} to {}\nBars: {}\nSignals: {} buy / {} sell",
            self.metrics.summary(),
            self.pair,
            self.start_time.format("%Y-%m-%d %H:%M"),
            self.end_time.format("%Y-%m-%d %H:%M"),
            self.bars_processed,
            self.buy_signals,
            self.sell_signals,
        )
    }
}

/// The backtesting simulation engine.
pub struct BacktestEngine {
    config: Config,
    backtest_config: BacktestConfig,
}

impl BacktestEngine {
    pub fn new(config: Config, backtest_config: BacktestConfig) -> Self {
        Self {
            config,
            backtest_config,
        }
    }

    /// Replay `candles` for `pair`.
    ///
    /// `btc`, when given, feeds the correlation filter. Positions still open
    /// after the last bar are closed at its close.
    pub fn run(&self, pair: &str, candles: &[Candle], btc: Option<&[Candle]>) -> Result<BacktestResult> {
        let warmup = self.config.signal.ema_slow;
        anyhow::ensure!(
            candles.len() > warmup,
            "Not enough candles for {}: need more than {}, got {}",
            pair,
            warmup,
            candles.len()
        );

        let first = &candles[0];
        let last = &candles[candles.len() - 1];
        info!(
            pair,
            candles = candles.len(),
            from = %first.open_time.format("%Y-%m-%d %H:%M"),
            to = %last.open_time.format("%Y-%m-%d %H:%M"),
            balance = %self.backtest_config.initial_balance,
            "Starting backtest"
        );

        let mut generator = SignalGenerator::new(self.config.signal.clone());
        let frame = generator.compute_indicators(candles);
        let aligned = btc
            .filter(|_| self.config.market.correlation_filter)
            .map(|b| align_closes(candles, b));

        let mut book = TradeBook::new(
            self.backtest_config.initial_balance,
            self.config.risk.clone(),
            first.open_time,
        );
        let mut equity_curve = Vec::with_capacity(candles.len() - warmup);
        let mut peak_equity = self.backtest_config.initial_balance;
        let (mut buy_signals, mut sell_signals) = (0, 0);

        for i in warmup..candles.len() {
            let bar = &candles[i];
            let price = decimal_from_f64(bar.close)
                .with_context(|| format!("Invalid close at {}", bar.open_time))?;
            let atr = frame
                .atr_at(i)
                .and_then(|a| decimal_from_f64(a).ok())
                .unwrap_or(Decimal::ZERO);

            let in_position = book.in_position(pair);
            let signal = generator.evaluate(pair, &frame, candles, i, in_position, aligned.as_deref());
            match signal {
                Signal::Buy => buy_signals += 1,
                Signal::Sell => sell_signals += 1,
                Signal::Hold => {}
            }

            match book.decide(pair, signal, price, atr, bar.open_time) {
                TradeAction::Open { size, levels } => {
                    book.open(pair, price, size, &levels, bar.open_time)
                        .with_context(|| format!("Failed to open {} at {}", pair, bar.open_time))?;
                }
                TradeAction::Close { reason } => {
                    book.close(pair, price, reason, bar.open_time);
                }
                TradeAction::Hold => {}
            }

            let prices = HashMap::from([(pair.to_string(), price)]);
            let equity = book.equity(&prices);
            book.record_equity(equity, bar.open_time);
            peak_equity = peak_equity.max(equity);

            if self.backtest_config.record_equity_curve {
                equity_curve.push(EquityPoint::new(
                    bar.open_time,
                    book.balance(),
                    equity - book.balance(),
                    book.positions().len(),
                    peak_equity,
                ));
            }

            if i % 500 == 0 {
                debug!(
                    bar = i,
                    total = candles.len(),
                    equity = %equity.round_dp(2),
                    "Backtest progress"
                );
            }
        }

        let final_price = decimal_from_f64(last.close)
            .with_context(|| format!("Invalid close at {}", last.open_time))?;
        let still_open: Vec<String> = book.positions().keys().cloned().collect();
        for open_pair in still_open {
            book.close(&open_pair, final_price, ExitReason::EndOfData, last.open_time);
        }

        let trades = book.history().to_vec();
        let metrics = BacktestMetrics::calculate(&equity_curve, self.backtest_config.initial_balance, &trades);
        let summary = book.summary();

        info!(
            pair,
            final_balance = %summary.balance,
            trades = summary.trades,
            win_rate = %summary.win_rate,
            max_drawdown = %summary.max_drawdown.round_dp(4),
            "Backtest complete"
        );

        Ok(BacktestResult {
            pair: pair.to_string(),
            metrics,
            book: summary,
            trades,
            equity_curve,
            start_time: first.open_time,
            end_time: last.open_time,
            bars_processed: candles.len() - warmup,
            buy_signals,
            sell_signals,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};
    use rust_decimal_macros::dec;

    fn start() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap()
    }

    fn series(n: usize, spike_at: &[usize], weak_at: &[usize]) -> Vec<Candle> {
        (0..n)
            .map(|i| {
                let close = 100.0 + i as f64 * 0.2 + if i % 2 == 0 { 0.3 } else { -0.3 };
                let volume = if spike_at.contains(&i) {
                    5000.0
                } else if weak_at.contains(&i) {
                    100.0
                } else {
                    1000.0
                };
                Candle::new(
                    start() + Duration::minutes(15 * i as i64),
                    close,
                    close + 0.5,
                    close - 0.5,
                    close,
                    volume,
                )
            })
            .collect()
    }

    fn engine() -> BacktestEngine {
        let mut config = Config::default();
        config.signal.value_area_sd = 100.0;
        BacktestEngine::new(
            config,
            BacktestConfig {
                initial_balance: dec!(100),
                ..BacktestConfig::default()
            },
        )
    }

    #[test]
    fn test_rejects_short_history() {
        let candles = series(15, &[], &[]);
        assert!(engine().run("SOL/USDT", &candles, None).is_err());
    }

    #[test]
    fn test_flat_run_has_no_trades() {
        let candles = series(80, &[], &[]);
        let result = engine().run("SOL/USDT", &candles, None).unwrap();

        assert!(result.trades.is_empty());
        assert_eq!(result.bars_processed, 59);
        assert_eq!(result.equity_curve.len(), 59);
        assert_eq!(result.metrics.final_equity, dec!(100));
    }

    #[test]
    fn test_signal_round_trip_trade() {
        let candles = series(80, &[59], &[65]);
        let result = engine().run("SOL/USDT", &candles, None).unwrap();

        assert_eq!(result.buy_signals, 1);
        assert_eq!(result.trades.len(), 1);
        let trade = &result.trades[0];
        assert_eq!(trade.exit_reason, ExitReason::Signal);
        assert_eq!(trade.opened_at, candles[59].open_time);
        assert_eq!(trade.closed_at, candles[65].open_time);
        assert_eq!(result.book.balance, dec!(100) + trade.pnl);
        assert_eq!(result.metrics.total_trades, 1);
    }

    #[test]
    fn test_open_position_closed_at_end_of_data() {
        let candles = series(70, &[69], &[]);
        let result = engine().run("SOL/USDT", &candles, None).unwrap();

        assert_eq!(result.trades.len(), 1);
        assert_eq!(result.trades[0].exit_reason, ExitReason::EndOfData);
        assert_eq!(result.book.open_positions, 0);
        // Entry and exit at the same close: only fees are lost
        let trade = &result.trades[0];
        assert!(trade.pnl < Decimal::ZERO);
        assert!((-trade.pnl - trade.fees).abs() < dec!(0.0001));
    }

    #[test]
    fn test_exports() {
        let candles = series(80, &[59], &[65]);
        let result = engine().run("SOL/USDT", &candles, None).unwrap();

        let dir = std::env::temp_dir().join(format!("backtest-export-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        result.trades_to_csv(dir.join("trades.csv")).unwrap();
        result.equity_to_csv(dir.join("equity.csv")).unwrap();

        let trades = std::fs::read_to_string(dir.join("trades.csv")).unwrap();
        assert_eq!(trades.lines().count(), 2);
        assert!(trades.lines().nth(1).unwrap().ends_with(",signal"));

        let equity = std::fs::read_to_string(dir.join("equity.csv")).unwrap();
        assert_eq!(equity.lines().count(), 60);
        std::fs::remove_dir_all(dir).ok();

        assert!(result.summary().contains("SOL/USDT"));
    }
}
