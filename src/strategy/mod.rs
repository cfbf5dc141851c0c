//! Trading strategy implementation.
//!
//! Contains the core logic for:
//! - Signal generation from indicators
//! - Alt season gating on BTC dominance
//! - Order execution

mod alt_season;
mod executor;
mod signals;

pub use alt_season::AltSeasonGate;
pub use executor::{limit_price, TradeExecutor};
pub use signals::{align_closes, IndicatorFrame, Signal, SignalGenerator};
