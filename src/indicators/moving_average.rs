//! Simple and exponential moving averages.

/// Index of the first present value.
pub(crate) fn first_valid(values: &[Option<f64>]) -> Option<usize> {
    values.iter().position(|v| v.is_some())
}

pub(crate) fn lift(values: &[f64]) -> Vec<Option<f64>> {
    values
        .iter()
        .map(|v| if v.is_finite() { Some(*v) } else { None })
        .collect()
}

/// Simple moving average; `None` until `period` values are available.
pub fn sma(values: &[f64], period: usize) -> Vec<Option<f64>> {
    sma_series(&lift(values), period)
}

/// SMA over a series that may start with missing values.
pub fn sma_series(values: &[Option<f64>], period: usize) -> Vec<Option<f64>> {
    let mut out = vec![None; values.len()];
    let Some(start) = first_valid(values) else {
        return out;
    };
    if period == 0 {
        return out;
    }

    for i in (start + period - 1)..values.len() {
        let window = &values[i + 1 - period..=i];
        let sum: Option<f64> = window.iter().copied().sum();
        out[i] = sum.map(|s| s / period as f64);
    }
    out
}

/// Exponential moving average seeded with the SMA of the first `period` values.
pub fn ema(values: &[f64], period: usize) -> Vec<Option<f64>> {
    ema_series(&lift(values), period)
}

/// EMA over a series that may start with missing values.
///
/// A gap after seeding leaves the running average untouched and yields `None`.
pub fn ema_series(values: &[Option<f64>], period: usize) -> Vec<Option<f64>> {
    let mut out = vec![None; values.len()];
    let Some(start) = first_valid(values) else {
        return out;
    };
    if period == 0 || values.len() < start + period {
        return out;
    }

    let seed_end = start + period - 1;
    let seed: Option<f64> = values[start..=seed_end].iter().copied().sum();
    let Some(seed) = seed else {
        return out;
    };

    let k = 2.0 / (period as f64 + 1.0);
    let mut prev = seed / period as f64;
    out[seed_end] = Some(prev);

    for i in (seed_end + 1)..values.len() {
        if let Some(v) = values[i] {
            prev += k * (v - prev);
            out[i] = Some(prev);
        }
    }
    out
}
