//! Risk management.
//!
//! - Fee-aware position accounting
//! - Position sizing, ATR stops and trailing stops
//! - Daily loss and trade-count limits
//! - Maximum drawdown tracking

mod manager;
mod mdd;
mod position;

pub use manager::{ExitReason, RiskManager, StopLevels};
pub use mdd::DrawdownTracker;
pub use position::{CloseResult, Position, PositionError, Valuation};
