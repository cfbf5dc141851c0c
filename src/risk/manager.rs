//! Position sizing, stop levels and daily trading limits.

use crate::config::RiskConfig;
use crate::risk::position::Position;
use crate::utils::normalize_decimal;
use chrono::NaiveDate;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::{debug, info};

/// Why a position was closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExitReason {
    /// Exit signal from the strategy
    Signal,
    StopLoss,
    /// Stop hit after it was trailed above the initial stop
    TrailingStop,
    TakeProfit,
    /// Backtest ran out of candles
    EndOfData,
}

impl ExitReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExitReason::Signal => "signal",
            ExitReason::StopLoss => "stop_loss",
            ExitReason::TrailingStop => "trailing_stop",
            ExitReason::TakeProfit => "take_profit",
            ExitReason::EndOfData => "end_of_data",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "signal" => Some(ExitReason::Signal),
            "stop_loss" => Some(ExitReason::StopLoss),
            "trailing_stop" => Some(ExitReason::TrailingStop),
            "take_profit" => Some(ExitReason::TakeProfit),
            "end_of_data" => Some(ExitReason::EndOfData),
            _ => None,
        }
    }
}

impl fmt::Display for ExitReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// ATR-derived exit levels for a new position.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct StopLevels {
    pub stop_loss: Decimal,
    pub take_profit: Decimal,
    pub trailing_stop: Decimal,
    pub trailing_activation: Decimal,
    /// ATR after flooring
    pub atr: Decimal,
}

impl StopLevels {
    /// Copy these levels onto a freshly opened position.
    pub fn apply_to(&self, position: &mut Position) {
        position.atr = self.atr;
        position.stop_loss = Some(self.stop_loss);
        position.take_profit = Some(self.take_profit);
        position.current_stop = Some(self.trailing_stop);
        position.trailing_activation = Some(self.trailing_activation);
    }
}

pub struct RiskManager {
    config: RiskConfig,
    daily_pnl: Decimal,
    daily_trades: u32,
    last_reset: Option<NaiveDate>,
}

impl RiskManager {
    pub fn new(config: RiskConfig) -> Self {
        Self {
            config,
            daily_pnl: normalize_decimal(Decimal::ZERO),
            daily_trades: 0,
            last_reset: None,
        }
    }

    pub fn config(&self) -> &RiskConfig {
        &self.config
    }

    pub fn daily_pnl(&self) -> Decimal {
        self.daily_pnl
    }

    pub fn daily_trades(&self) -> u32 {
        self.daily_trades
    }

    /// Restore daily counters (e.g. after a restart).
    pub fn restore_daily(&mut self, date: NaiveDate, pnl: Decimal, trades: u32) {
        self.last_reset = Some(date);
        self.daily_pnl = normalize_decimal(pnl);
        self.daily_trades = trades;
    }

    /// Reset daily counters when `today` is a new date.
    pub fn roll_day(&mut self, today: NaiveDate) {
        if self.last_reset.map_or(true, |last| today > last) {
            if self.last_reset.is_some() {
                info!(%today, "New trading day, daily limits reset");
            }
            self.daily_pnl = normalize_decimal(Decimal::ZERO);
            self.daily_trades = 0;
            self.last_reset = Some(today);
        }
    }

    /// Whether new trades are allowed for `balance` on `today`.
    pub fn can_trade(&mut self, balance: Decimal, today: NaiveDate) -> bool {
        self.roll_day(today);

        if self.daily_pnl <= -balance * self.config.max_daily_loss {
            debug!(daily_pnl = %self.daily_pnl, %balance, "Daily loss limit reached");
            return false;
        }
        if self.daily_trades >= self.config.max_trades_per_day {
            debug!(trades = self.daily_trades, "Daily trade limit reached");
            return false;
        }
        true
    }

    /// Explicit check against a given daily PnL and starting balance.
    pub fn can_trade_with(&self, daily_pnl: Decimal, initial_balance: Decimal) -> bool {
        if normalize_decimal(daily_pnl) <= -normalize_decimal(initial_balance) * self.config.max_daily_loss {
            return false;
        }
        self.daily_trades < self.config.max_trades_per_day
    }

    /// Initial stop, target and trailing activation from ATR.
    pub fn stop_levels(&self, entry: Decimal, atr: Decimal) -> StopLevels {
        let entry = normalize_decimal(entry);
        let atr = normalize_decimal(atr.max(entry * self.config.atr_floor_pct));

        let stop_loss = normalize_decimal(entry - atr * self.config.atr_sl_mult);
        StopLevels {
            stop_loss,
            take_profit: normalize_decimal(entry + atr * self.config.atr_tp_mult),
            trailing_stop: stop_loss,
            trailing_activation: normalize_decimal(entry + atr * self.config.atr_trail_mult),
            atr,
        }
    }

    /// Quote amount to commit, shrinking with volatility (ATR / price).
    pub fn position_size(&self, balance: Decimal, volatility: Decimal) -> Decimal {
        let max_position = balance * self.config.max_position_size;
        let vol_adj = (Decimal::ONE - volatility * self.config.volatility_scale)
            .max(self.config.min_volatility_factor);

        let size = (max_position * vol_adj)
            .min(max_position)
            .max(self.config.min_trade_amount);
        normalize_decimal(size)
    }

    /// Quote amount that may still be deployed without breaching the allocation cap.
    pub fn allocation_headroom(&self, equity: Decimal, exposure: Decimal) -> Decimal {
        normalize_decimal((equity * self.config.max_portfolio_allocation - exposure).max(Decimal::ZERO))
    }

    pub fn record_trade(&mut self, pnl: Decimal) {
        self.daily_pnl = normalize_decimal(self.daily_pnl + pnl);
        self.daily_trades += 1;
    }

    /// Raised stop once price has cleared the activation level, if it is higher.
    pub fn trailing_stop(&self, position: &Position, price: Decimal) -> Option<Decimal> {
        let activation = position.trailing_activation?;
        if price < activation {
            return None;
        }

        let candidate = normalize_decimal(price - position.atr * self.config.atr_trail_mult);
        match position.current_stop {
            Some(stop) if candidate <= stop => None,
            _ => Some(candidate),
        }
    }

    pub fn evaluate_exit(&self, position: &Position, price: Decimal) -> Option<ExitReason> {
        if let Some(stop) = position.current_stop {
            if price <= stop {
                let trailed = position.stop_loss.map_or(false, |initial| stop > initial);
                return Some(if trailed {
                    ExitReason::TrailingStop
                } else {
                    ExitReason::StopLoss
                });
            }
        }
        if let Some(target) = position.take_profit {
            if price >= target {
                return Some(ExitReason::TakeProfit);
            }
        }
        None
    }
}
