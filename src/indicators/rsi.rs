//! Relative Strength Index with Wilder smoothing.

use super::moving_average::{first_valid, lift};

/// RSI over closing prices; the first value lands at index `period`.
///
/// A window with only gains reads 100, one with no movement at all reads 50.
pub fn rsi(closes: &[f64], period: usize) -> Vec<Option<f64>> {
    let values = lift(closes);
    let mut out = vec![None; values.len()];
    let Some(start) = first_valid(&values) else {
        return out;
    };
    if period == 0 || values.len() <= start + period {
        return out;
    }

    let series: Vec<f64> = values[start..].iter().map(|v| v.unwrap_or(f64::NAN)).collect();
    let p = period as f64;

    let mut avg_gain = 0.0;
    let mut avg_loss = 0.0;
    for i in 1..=period {
        let change = series[i] - series[i - 1];
        if change > 0.0 {
            avg_gain += change;
        } else {
            avg_loss -= change;
        }
    }
    avg_gain /= p;
    avg_loss /= p;
    out[start + period] = rsi_value(avg_gain, avg_loss);

    for i in (period + 1)..series.len() {
        let change = series[i] - series[i - 1];
        let (gain, loss) = if change > 0.0 { (change, 0.0) } else { (0.0, -change) };
        avg_gain = (avg_gain * (p - 1.0) + gain) / p;
        avg_loss = (avg_loss * (p - 1.0) + loss) / p;
        out[start + i] = rsi_value(avg_gain, avg_loss);
    }
    out
}

fn rsi_value(avg_gain: f64, avg_loss: f64) -> Option<f64> {
    let total = avg_gain + avg_loss;
    if !total.is_finite() {
        return None;
    }
    if total == 0.0 {
        return Some(50.0);
    }
    Some(100.0 * avg_gain / total)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_value_at_period() {
        let closes: Vec<f64> = (0..20).map(|i| 100.0 + (i % 3) as f64).collect();
        let out = rsi(&closes, 14);
        assert!(out[..14].iter().all(Option::is_none));
        assert!(out[14].is_some());
        assert!(out[19].is_some());
    }

    #[test]
    fn test_all_gains_is_100() {
        let closes: Vec<f64> = (0..16).map(|i| 10.0 + i as f64).collect();
        let out = rsi(&closes, 14);
        assert_eq!(out[14], Some(100.0));
        assert_eq!(out[15], Some(100.0));
    }

    #[test]
    fn test_flat_is_50() {
        let out = rsi(&[5.0; 16], 14);
        assert_eq!(out[14], Some(50.0));
    }

    #[test]
    fn test_wilder_smoothing() {
        // Period 2: changes +1, -1 seed avg_gain = avg_loss = 0.5
        // next change +2: gain = (0.5 + 2) / 2 = 1.25, loss = 0.25
        let out = rsi(&[1.0, 2.0, 1.0, 3.0], 2);
        assert_eq!(out[2], Some(50.0));
        let expected = 100.0 * 1.25 / 1.5;
        assert!((out[3].unwrap() - expected).abs() < 1e-9);
    }

    #[test]
    fn test_too_short() {
        assert!(rsi(&[1.0, 2.0, 3.0], 14).iter().all(Option::is_none));
    }
}
