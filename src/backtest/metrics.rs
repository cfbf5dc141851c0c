//! Performance metrics calculation for backtesting.
//!
//! Provides Sharpe ratio, Sortino ratio, drawdown analysis, and trade statistics.

use crate::risk::ExitReason;
use crate::trading::TradeRecord;
use crate::utils::{decimal_from_f64, to_f64};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt::Write as _;

/// A point on the equity curve.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EquityPoint {
    pub timestamp: DateTime<Utc>,
    pub balance: Decimal,
    pub unrealized_pnl: Decimal,
    pub total_equity: Decimal,
    pub drawdown: Decimal,
    pub position_count: usize,
}

impl EquityPoint {
    pub fn new(
        timestamp: DateTime<Utc>,
        balance: Decimal,
        unrealized_pnl: Decimal,
        position_count: usize,
        peak_equity: Decimal,
    ) -> Self {
        let total_equity = balance + unrealized_pnl;
        let drawdown = if peak_equity > total_equity && peak_equity > Decimal::ZERO {
            (peak_equity - total_equity) / peak_equity
        } else {
            Decimal::ZERO
        };

        Self {
            timestamp,
            balance,
            unrealized_pnl,
            total_equity,
            drawdown,
            position_count,
        }
    }
}

/// Backtest performance metrics.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BacktestMetrics {
    // Returns
    pub initial_balance: Decimal,
    pub final_equity: Decimal,
    /// Final minus initial
    pub total_return: Decimal,
    pub total_return_pct: Decimal,
    pub annualized_return: Decimal,

    // Risk
    /// Maximum drawdown (0.0-1.0)
    pub max_drawdown: Decimal,
    pub max_drawdown_duration_hours: i64,
    /// Annualized std dev of bar returns
    pub volatility: Decimal,

    // Risk-adjusted
    /// Sharpe ratio (zero risk-free rate)
    pub sharpe_ratio: Decimal,
    /// Sortino ratio (downside deviation only)
    pub sortino_ratio: Decimal,

    // Trades
    pub total_trades: usize,
    pub winning_trades: usize,
    pub losing_trades: usize,
    /// Percent of trades with positive PnL
    pub win_rate: Decimal,
    pub total_fees: Decimal,
    pub avg_trade_pnl: Decimal,
    pub best_trade: Decimal,
    pub worst_trade: Decimal,
    /// Gross profit over gross loss, zero when there were no losses
    pub profit_factor: Decimal,
    pub avg_trade_duration_hours: f64,
    pub exit_reasons: BTreeMap<ExitReason, usize>,

    pub duration_days: f64,
}

impl BacktestMetrics {
    /// Calculate metrics from the equity curve and closed trades.
    pub fn calculate(equity_curve: &[EquityPoint], initial_balance: Decimal, trades: &[TradeRecord]) -> Self {
        let mut metrics = Self::empty(initial_balance);
        metrics.apply_trades(trades);

        let (Some(first), Some(last)) = (equity_curve.first(), equity_curve.last()) else {
            return metrics;
        };

        let duration = last.timestamp - first.timestamp;
        let duration_days = duration.num_seconds() as f64 / 86400.0;
        let duration_years = duration_days / 365.0;

        metrics.final_equity = last.total_equity;
        metrics.total_return = last.total_equity - initial_balance;
        metrics.total_return_pct = if initial_balance > Decimal::ZERO {
            (metrics.total_return / initial_balance * dec!(100)).round_dp(4)
        } else {
            Decimal::ZERO
        };

        metrics.annualized_return = if duration_years > 0.0 {
            let factor = 1.0 + to_f64(metrics.total_return_pct) / 100.0;
            let annualized = factor.powf(1.0 / duration_years) - 1.0;
            to_decimal(annualized * 100.0)
        } else {
            Decimal::ZERO
        };

        let (max_drawdown, max_dd_duration) = calculate_max_drawdown(equity_curve);
        metrics.max_drawdown = max_drawdown;
        metrics.max_drawdown_duration_hours = max_dd_duration;

        let returns = calculate_period_returns(equity_curve);
        metrics.volatility = calculate_volatility(&returns, duration_years);
        metrics.sharpe_ratio = calculate_sharpe(&returns, duration_years);
        metrics.sortino_ratio = calculate_sortino(&returns, duration_years);
        metrics.duration_days = duration_days;

        metrics
    }

    /// Metrics with no activity.
    pub fn empty(initial_balance: Decimal) -> Self {
        Self {
            initial_balance,
            final_equity: initial_balance,
            total_return: Decimal::ZERO,
            total_return_pct: Decimal::ZERO,
            annualized_return: Decimal::ZERO,
            max_drawdown: Decimal::ZERO,
            max_drawdown_duration_hours: 0,
            volatility: Decimal::ZERO,
            sharpe_ratio: Decimal::ZERO,
            sortino_ratio: Decimal::ZERO,
            total_trades: 0,
            winning_trades: 0,
            losing_trades: 0,
            win_rate: Decimal::ZERO,
            total_fees: Decimal::ZERO,
            avg_trade_pnl: Decimal::ZERO,
            best_trade: Decimal::ZERO,
            worst_trade: Decimal::ZERO,
            profit_factor: Decimal::ZERO,
            avg_trade_duration_hours: 0.0,
            exit_reasons: BTreeMap::new(),
            duration_days: 0.0,
        }
    }

    fn apply_trades(&mut self, trades: &[TradeRecord]) {
        if trades.is_empty() {
            return;
        }

        let n = trades.len();
        let gross_profit: Decimal = trades.iter().map(|t| t.pnl).filter(|p| *p > Decimal::ZERO).sum();
        let gross_loss: Decimal = trades.iter().map(|t| t.pnl).filter(|p| *p < Decimal::ZERO).sum();
        let total_pnl: Decimal = trades.iter().map(|t| t.pnl).sum();
        let minutes: i64 = trades
            .iter()
            .map(|t| (t.closed_at - t.opened_at).num_minutes())
            .sum();

        self.total_trades = n;
        self.winning_trades = trades.iter().filter(|t| t.pnl > Decimal::ZERO).count();
        self.losing_trades = trades.iter().filter(|t| t.pnl < Decimal::ZERO).count();
        self.win_rate = (Decimal::from(self.winning_trades) * dec!(100) / Decimal::from(n)).round_dp(2);
        self.total_fees = trades.iter().map(|t| t.fees).sum();
        self.avg_trade_pnl = (total_pnl / Decimal::from(n)).round_dp(8);
        self.best_trade = trades.iter().map(|t| t.pnl).max().unwrap_or_default();
        self.worst_trade = trades.iter().map(|t| t.pnl).min().unwrap_or_default();
        self.profit_factor = if gross_loss < Decimal::ZERO {
            (gross_profit / -gross_loss).round_dp(4)
        } else {
            Decimal::ZERO
        };
        self.avg_trade_duration_hours = minutes as f64 / 60.0 / n as f64;

        for trade in trades {
            *self.exit_reasons.entry(trade.exit_reason).or_insert(0) += 1;
        }
    }

    /// Format metrics as a summary string.
    pub fn summary(&self) -> String {
        let mut out = format!(
            r#"═══════════════════════════════════════════════
BACKTEST RESULTS ({:.1} days)
═══════════════════════════════════════════════
RETURNS
  Initial Balance:   ${:.2}
  Final Equity:      ${:.2}
  Total Return:      ${:.2} ({:.2}%)
  Annualized:        {:.2}%

RISK
  Max Drawdown:      {:.2}%
  Volatility:        {:.2}%

RISK-ADJUSTED
  Sharpe Ratio:      {:.3}
  Sortino Ratio:     {:.3}

TRADES
  Total Trades:      {}
  Win Rate:          {:.2}%
  Total Fees:        ${:.2}
  Average Trade:     ${:.2}
  Best / Worst:      ${:.2} / ${:.2}
  Profit Factor:     {:.2}
  Avg Duration:      {:.1}h
"#,
            self.duration_days,
            self.initial_balance,
            self.final_equity,
            self.total_return,
            self.total_return_pct,
            self.annualized_return,
            self.max_drawdown * dec!(100),
            self.volatility * dec!(100),
            self.sharpe_ratio,
            self.sortino_ratio,
            self.total_trades,
            self.win_rate,
            self.total_fees,
            self.avg_trade_pnl,
            self.best_trade,
            self.worst_trade,
            self.profit_factor,
            self.avg_trade_duration_hours,
        );

        if !self.exit_reasons.is_empty() {
            out.push_str("\nEXIT REASONS\n");
            for (reason, count) in &self.exit_reasons {
                let share = *count as f64 / self.total_trades.max(1) as f64 * 100.0;
                let _ = writeln!(out, "  {:<18} {} ({:.1}%)", format!("{reason}:"), count, share);
            }
        }
        out.push_str("═══════════════════════════════════════════════");
        out
    }
}

fn to_decimal(value: f64) -> Decimal {
    decimal_from_f64(value).map(|d| d.round_dp(4)).unwrap_or_default()
}

fn calculate_period_returns(equity_curve: &[EquityPoint]) -> Vec<f64> {
    equity_curve
        .windows(2)
        .map(|w| {
            let prev = to_f64(w[0].total_equity);
            let curr = to_f64(w[1].total_equity);
            if prev > 0.0 {
                (curr - prev) / prev
            } else {
                0.0
            }
        })
        .collect()
}

/// Maximum drawdown and its duration in hours.
fn calculate_max_drawdown(equity_curve: &[EquityPoint]) -> (Decimal, i64) {
    let Some(first) = equity_curve.first() else {
        return (Decimal::ZERO, 0);
    };

    let mut peak = first.total_equity;
    let mut peak_time = first.timestamp;
    let mut max_dd = Decimal::ZERO;
    let mut max_dd_duration: i64 = 0;

    for point in equity_curve {
        if point.total_equity >= peak {
            peak = point.total_equity;
            peak_time = point.timestamp;
            continue;
        }

        if peak > Decimal::ZERO {
            let dd = (peak - point.total_equity) / peak;
            if dd > max_dd {
                max_dd = dd;
            }
        }
        max_dd_duration = max_dd_duration.max((point.timestamp - peak_time).num_hours());
    }

    (max_dd, max_dd_duration)
}

fn mean(values: &[f64]) -> f64 {
    values.iter().sum::<f64>() / values.len() as f64
}

fn calculate_volatility(returns: &[f64], duration_years: f64) -> Decimal {
    if returns.len() < 2 || duration_years <= 0.0 {
        return Decimal::ZERO;
    }

    let n = returns.len() as f64;
    let m = mean(returns);
    let variance = returns.iter().map(|r| (r - m).powi(2)).sum::<f64>() / n;

    let periods_per_year = n / duration_years;
    to_decimal(variance.sqrt() * periods_per_year.sqrt())
}

fn calculate_sharpe(returns: &[f64], duration_years: f64) -> Decimal {
    if returns.is_empty() || duration_years <= 0.0 {
        return Decimal::ZERO;
    }

    let n = returns.len() as f64;
    let m = mean(returns);
    let std_dev = (returns.iter().map(|r| (r - m).powi(2)).sum::<f64>() / n).sqrt();

    if std_dev < 1e-10 {
        return Decimal::ZERO;
    }

    let periods_per_year = n / duration_years;
    to_decimal(m * periods_per_year / (std_dev * periods_per_year.sqrt()))
}

fn calculate_sortino(returns: &[f64], duration_years: f64) -> Decimal {
    if returns.is_empty() || duration_years <= 0.0 {
        return Decimal::ZERO;
    }

    let n = returns.len() as f64;
    let m = mean(returns);

    let downside: Vec<f64> = returns.iter().copied().filter(|r| *r < 0.0).collect();
    if downside.is_empty() {
        // No losing periods; cap instead of dividing by zero
        return dec!(100);
    }

    let downside_deviation = (downside.iter().map(|r| r.powi(2)).sum::<f64>() / downside.len() as f64).sqrt();
    if downside_deviation < 1e-10 {
        return dec!(100);
    }

    let periods_per_year = n / duration_years;
    to_decimal(m * periods_per_year / (downside_deviation * periods_per_year.sqrt()))
}
