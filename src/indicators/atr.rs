//! Average True Range.

/// True range for bar `i` (requires `i >= 1`).
fn true_range(high: &[f64], low: &[f64], close: &[f64], i: usize) -> f64 {
    let prev_close = close[i - 1];
    (high[i] - low[i])
        .max((high[i] - prev_close).abs())
        .max((low[i] - prev_close).abs())
}

/// Wilder-smoothed ATR; the first value lands at index `period` and is
/// the mean true range of bars `1..=period`.
pub fn atr(high: &[f64], low: &[f64], close: &[f64], period: usize) -> Vec<Option<f64>> {
    let len = high.len().min(low.len()).min(close.len());
    let mut out = vec![None; len];
    if period == 0 || len <= period {
        return out;
    }

    let p = period as f64;
    let mut value = (1..=period)
        .map(|i| true_range(high, low, close, i))
        .sum::<f64>()
        / p;
    out[period] = Some(value);

    for i in (period + 1)..len {
        value = (value * (p - 1.0) + true_range(high, low, close, i)) / p;
        out[i] = Some(value);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_atr_constant_range() {
        let high = vec![11.0; 10];
        let low = vec![9.0; 10];
        let close = vec![10.0; 10];
        let out = atr(&high, &low, &close, 3);

        assert!(out[..3].iter().all(Option::is_none));
        assert_eq!(out[3], Some(2.0));
        assert_eq!(out[9], Some(2.0));
    }

    #[test]
    fn test_atr_uses_gaps() {
        // Bar 2 gaps up: |high - prev close| = 5 beats high - low = 1
        let high = vec![10.0, 10.0, 15.0, 15.0];
        let low = vec![10.0, 10.0, 14.0, 15.0];
        let close = vec![10.0, 10.0, 15.0, 15.0];
        let out = atr(&high, &low, &close, 2);

        assert_eq!(out[2], Some(2.5));
        assert_eq!(out[3], Some(1.25));
    }

    #[test]
    fn test_atr_too_short() {
        assert!(atr(&[1.0], &[1.0], &[1.0], 14).iter().all(Option::is_none));
    }
}
