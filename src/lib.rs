//! # Altseason Trader
//!
//! A Rust spot trading bot for altcoins on Binance, gated on BTC dominance
//! and driven by EMA trend, QQE momentum and volume signals.
//!
//! ## Architecture
//!
//! - `config`: Configuration management and validation
//! - `exchange`: Binance and CoinGecko REST clients, paper exchange
//! - `market`: Candle and price fetching with caching and rate limiting
//! - `indicators`: EMA, RSI, ATR, QQE, volume profile and correlation
//! - `strategy`: Signal generation, alt-season gate and order execution
//! - `risk`: Position accounting, stops, sizing and drawdown tracking
//! - `trading`: Portfolio book and the live trading loop
//! - `persistence`: SQLite-based state persistence
//! - `backtest`: Historical replay and performance metrics
//! - `monitor`: Log analysis and decimal self-check
//! - `utils`: Shared utilities and decimal arithmetic

pub mod backtest;
pub mod config;
pub mod exchange;
pub mod indicators;
pub mod market;
pub mod monitor;
pub mod persistence;
pub mod risk;
pub mod strategy;
pub mod trading;
pub mod utils;

pub use config::Config;
