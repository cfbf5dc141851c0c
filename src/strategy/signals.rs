//! Entry and exit signal generation.
//!
//! Entries need an uptrend (close above the slow EMA), bullish QQE momentum
//! and above-average volume. Exits fire on fading momentum or drying volume.
//! Both are suppressed while the pair moves in lockstep with BTC, when price
//! sits outside the volume-profile value area, or during the cooldown after
//! a previous signal.

use crate::config::SignalConfig;
use crate::exchange::Candle;
use crate::indicators::{atr, ema, log_return_correlation, rsi, sma, Qqe, QqeOutput, VolumeProfile};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use tracing::{debug, info};

/// Trading signal for a single bar.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Signal {
    Buy,
    Sell,
    Hold,
}

impl Signal {
    /// `1` buy, `-1` sell, `0` hold.
    pub fn as_i8(&self) -> i8 {
        match self {
            Signal::Buy => 1,
            Signal::Sell => -1,
            Signal::Hold => 0,
        }
    }
}

impl fmt::Display for Signal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Signal::Buy => write!(f, "buy"),
            Signal::Sell => write!(f, "sell"),
            Signal::Hold => write!(f, "hold"),
        }
    }
}

/// Indicator series aligned to a candle slice.
#[derive(Debug, Clone, Default)]
pub struct IndicatorFrame {
    pub ema_fast: Vec<Option<f64>>,
    pub ema_slow: Vec<Option<f64>>,
    pub atr: Vec<Option<f64>>,
    pub volume_ma: Vec<Option<f64>>,
    pub rsi: Vec<Option<f64>>,
    pub qqe: QqeOutput,
}

impl IndicatorFrame {
    pub fn len(&self) -> usize {
        self.ema_slow.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ema_slow.is_empty()
    }

    pub fn atr_at(&self, index: usize) -> Option<f64> {
        self.atr.get(index).copied().flatten()
    }
}

/// BTC closes keyed onto the bars of `target` by open time.
pub fn align_closes(target: &[Candle], reference: &[Candle]) -> Vec<Option<f64>> {
    let by_time: HashMap<i64, f64> = reference
        .iter()
        .map(|c| (c.open_time_ms(), c.close))
        .collect();
    target
        .iter()
        .map(|c| by_time.get(&c.open_time_ms()).copied())
        .collect()
}

pub struct SignalGenerator {
    config: SignalConfig,
    qqe: Qqe,
    profile: VolumeProfile,
    /// Bar time of the last accepted signal, per pair
    last_signal: HashMap<String, DateTime<Utc>>,
}

impl SignalGenerator {
    pub fn new(config: SignalConfig) -> Self {
        let qqe = Qqe::new(config.rsi_period, config.qqe_smoothing, config.qqe_wilder);
        let profile = VolumeProfile::new(
            config.volume_profile_bucket,
            config.value_area_sd,
            config.volume_profile_lookback,
        );
        Self {
            config,
            qqe,
            profile,
            last_signal: HashMap::new(),
        }
    }

    pub fn config(&self) -> &SignalConfig {
        &self.config
    }

    /// Compute every indicator the signal rules read.
    pub fn compute_indicators(&self, candles: &[Candle]) -> IndicatorFrame {
        let closes: Vec<f64> = candles.iter().map(|c| c.close).collect();
        let highs: Vec<f64> = candles.iter().map(|c| c.high).collect();
        let lows: Vec<f64> = candles.iter().map(|c| c.low).collect();
        let volumes: Vec<f64> = candles.iter().map(|c| c.volume).collect();

        IndicatorFrame {
            ema_fast: ema(&closes, self.config.ema_fast),
            ema_slow: ema(&closes, self.config.ema_slow),
            atr: atr(&highs, &lows, &closes, self.config.atr_period),
            volume_ma: sma(&volumes, self.config.volume_ma_period),
            rsi: rsi(&closes, self.config.rsi_period),
            qqe: self.qqe.calculate(&closes),
        }
    }

    /// Signal for bar `index`.
    ///
    /// `btc_closes`, when given, must be aligned with `candles`.
    pub fn evaluate(
        &mut self,
        pair: &str,
        frame: &IndicatorFrame,
        candles: &[Candle],
        index: usize,
        in_position: bool,
        btc_closes: Option<&[Option<f64>]>,
    ) -> Signal {
        if index >= candles.len() || index >= frame.len() || index + 1 < self.config.ema_slow {
            return Signal::Hold;
        }

        let latest = &candles[index];
        let (Some(ema_slow), Some(volume_ma), Some(rsi_ma)) = (
            frame.ema_slow[index],
            frame.volume_ma[index],
            frame.qqe.rsi_ma[index],
        ) else {
            return Signal::Hold;
        };

        if let Some(btc) = btc_closes {
            if !self.correlation_allows(candles, btc, index) {
                debug!(pair, "Signal skipped: high BTC correlation");
                return Signal::Hold;
            }
        }

        if let Some(levels) = self.profile.calculate(&candles[..=index]) {
            if !levels.contains(latest.close) {
                debug!(
                    pair,
                    close = latest.close,
                    low = levels.value_area_low,
                    high = levels.value_area_high,
                    "Signal skipped: price outside value area"
                );
                return Signal::Hold;
            }
        }

        let volume_ratio = if volume_ma > 0.0 {
            latest.volume / volume_ma
        } else {
            0.0
        };

        debug!(
            pair,
            qqe = %format!("{:.1}", rsi_ma),
            vol_ratio = %format!("{:.2}", volume_ratio),
            ema_fast = ?frame.ema_fast[index],
            ema_slow = %format!("{:.2}", ema_slow),
            "Signal conditions"
        );

        if !in_position {
            let trend_up = latest.close > ema_slow;
            let qqe_bullish = rsi_ma > self.config.qqe_buy_threshold;
            let volume_active = latest.volume > volume_ma * self.config.volume_multiplier;

            if trend_up && qqe_bullish && volume_active && self.validate(pair, latest) {
                info!(pair, price = latest.close, "Buy signal generated: all conditions met");
                return Signal::Buy;
            }
        } else {
            let qqe_bearish = rsi_ma < self.config.qqe_sell_threshold;
            let volume_weak = volume_ratio < self.config.weak_volume_ratio;

            if (qqe_bearish || volume_weak) && self.validate(pair, latest) {
                info!(pair, price = latest.close, "Sell signal generated: exit conditions met");
                return Signal::Sell;
            }
        }

        Signal::Hold
    }

    /// Signals for a whole series, tracking a simulated position.
    pub fn generate_signals(&mut self, pair: &str, candles: &[Candle], btc: Option<&[Candle]>) -> Vec<Signal> {
        let frame = self.compute_indicators(candles);
        let aligned = btc.map(|b| align_closes(candles, b));
        let mut in_position = false;

        (0..candles.len())
            .map(|i| {
                let signal = self.evaluate(pair, &frame, candles, i, in_position, aligned.as_deref());
                match signal {
                    Signal::Buy => in_position = true,
                    Signal::Sell => in_position = false,
                    Signal::Hold => {}
                }
                signal
            })
            .collect()
    }

    /// Clear all cooldowns.
    pub fn reset(&mut self) {
        self.last_signal.clear();
    }

    fn correlation_allows(&self, candles: &[Candle], btc: &[Option<f64>], index: usize) -> bool {
        let window = self.config.correlation_window;
        if index + 1 < window + 1 || btc.len() <= index {
            return true;
        }

        let start = index - window;
        let btc_window: Option<Vec<f64>> = btc[start..=index].iter().copied().collect();
        let Some(btc_window) = btc_window else {
            return true;
        };
        let pair_window: Vec<f64> = candles[start..=index].iter().map(|c| c.close).collect();

        match log_return_correlation(&pair_window, &btc_window, window) {
            Some(r) => r.abs() < self.config.correlation_threshold,
            None => true,
        }
    }

    /// Enforce the per-pair cooldown on bar time and arm it.
    fn validate(&mut self, pair: &str, bar: &Candle) -> bool {
        let cooldown = Duration::minutes(self.config.cooldown_minutes);
        if let Some(last) = self.last_signal.get(pair) {
            let since = bar.open_time - *last;
            if since < cooldown {
                debug!(
                    pair,
                    since_secs = since.num_seconds(),
                    cooldown_secs = cooldown.num_seconds(),
                    "Signal rejected: cooldown active"
                );
                return false;
            }
        }
        self.last_signal.insert(pair.to_string(), bar.open_time);
        true
    }
}
