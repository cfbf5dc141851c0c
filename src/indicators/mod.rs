//! Technical indicators.
//!
//! Series functions return one `Option<f64>` per input bar, `None` while
//! the indicator is warming up. Leading missing values in an input series
//! are skipped before seeding, so indicators can be chained (EMA of RSI).

mod atr;
mod correlation;
mod moving_average;
mod qqe;
mod rsi;
mod volume_profile;

pub use atr::atr;
pub use correlation::log_return_correlation;
pub use moving_average::{ema, ema_series, sma, sma_series};
pub use qqe::{Qqe, QqeOutput};
pub use rsi::rsi;
pub use volume_profile::{ProfileLevels, VolumeProfile};
