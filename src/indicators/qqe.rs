//! Quantitative Qualitative Estimation.

use super::moving_average::ema_series;
use super::rsi::rsi;

/// QQE lines aligned to the input closes.
#[derive(Debug, Clone, Default)]
pub struct QqeOutput {
    /// EMA-smoothed RSI
    pub rsi_ma: Vec<Option<f64>>,
    pub upper: Vec<Option<f64>>,
    pub lower: Vec<Option<f64>>,
}

#[derive(Debug, Clone, Copy)]
pub struct Qqe {
    pub rsi_period: usize,
    /// EMA period applied to RSI
    pub smoothing: usize,
    /// Band width as a fraction of the RSI deviation
    pub wilder: f64,
}

impl Default for Qqe {
    fn default() -> Self {
        Self {
            rsi_period: 14,
            smoothing: 5,
            wilder: 0.33,
        }
    }
}

impl Qqe {
    pub fn new(rsi_period: usize, smoothing: usize, wilder: f64) -> Self {
        Self {
            rsi_period,
            smoothing,
            wilder,
        }
    }

    pub fn calculate(&self, closes: &[f64]) -> QqeOutput {
        let rsi = rsi(closes, self.rsi_period);
        let rsi_ma = ema_series(&rsi, self.smoothing);

        let (upper, lower) = rsi
            .iter()
            .zip(&rsi_ma)
            .map(|(r, ma)| match (r, ma) {
                (Some(r), Some(ma)) => {
                    let delta = (r - ma) * self.wilder;
                    (Some(ma + delta), Some(ma - delta))
                }
                _ => (None, None),
            })
            .unzip();

        QqeOutput { rsi_ma, upper, lower }
    }
}
