//! Backtesting over historical candles.
//!
//! This module provides:
//! - Historical candle loading (CSV import and export)
//! - Bar-by-bar replay of the signal and risk pipeline
//! - Performance metrics calculation
//!
//! # Example
//!
//! ```rust,ignore
//! use altseason_trader::backtest::{BacktestConfig, BacktestEngine, CandleDataLoader, CsvCandleLoader};
//!
//! let loader = CsvCandleLoader::new("data/SOLUSDT_15m.csv")?;
//! let candles = loader.load_candles(None, None)?;
//! let engine = BacktestEngine::new(config, BacktestConfig::default());
//!
//! let result = engine.run("SOL/USDT", &candles, None)?;
//! println!("Return: {:.2}%", result.metrics.total_return_pct);
//! ```

mod data;
mod engine;
mod metrics;

pub use data::{write_candles_csv, CandleDataLoader, CsvCandleLoader};
pub use engine::{BacktestEngine, BacktestResult};
pub use metrics::{BacktestMetrics, EquityPoint};

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Configuration for a backtest run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BacktestConfig {
    /// Starting quote balance
    pub initial_balance: Decimal,

    /// Whether to record every equity point
    pub record_equity_curve: bool,
}

impl Default for BacktestConfig {
    fn default() -> Self {
        Self {
            initial_balance: Decimal::new(100, 0),
            record_equity_curve: true,
        }
    }
}
