//! Portfolio book and the live trading loop.

mod book;
mod bot;

pub use book::{BookSummary, DailyStats, TradeAction, TradeBook, TradeRecord};
pub use bot::{IterationReport, TradingBot};
