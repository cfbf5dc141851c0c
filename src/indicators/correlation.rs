//! Return correlation between two price series.

fn log_returns(prices: &[f64]) -> Vec<f64> {
    prices.windows(2).map(|w| (w[1] / w[0]).ln()).collect()
}

/// Pearson correlation of the last `window` log returns of `a` and `b`.
///
/// Series are aligned at their ends. Returns `None` when fewer than two
/// returns are available, when either series has zero variance, or when a
/// price is non-positive.
pub fn log_return_correlation(a: &[f64], b: &[f64], window: usize) -> Option<f64> {
    let len = a.len().min(b.len()).min(window + 1);
    if len < 3 {
        return None;
    }

    let ra = log_returns(&a[a.len() - len..]);
    let rb = log_returns(&b[b.len() - len..]);
    pearson(&ra, &rb)
}

fn pearson(x: &[f64], y: &[f64]) -> Option<f64> {
    let n = x.len() as f64;
    let mean_x = x.iter().sum::<f64>() / n;
    let mean_y = y.iter().sum::<f64>() / n;

    let mut cov = 0.0;
    let mut var_x = 0.0;
    let mut var_y = 0.0;
    for (xi, yi) in x.iter().zip(y) {
        let dx = xi - mean_x;
        let dy = yi - mean_y;
        cov += dx * dy;
        var_x += dx * dx;
        var_y += dy * dy;
    }

    let denom = (var_x * var_y).sqrt();
    if denom == 0.0 || !denom.is_finite() {
        return None;
    }
    let r = cov / denom;
    r.is_finite().then_some(r.clamp(-1.0, 1.0))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identical_moves_correlate() {
        let a = [100.0, 101.0, 99.0, 103.0, 102.0];
        let b: Vec<f64> = a.iter().map(|p| p * 300.0).collect();
        let r = log_return_correlation(&a, &b, 24).unwrap();
        assert!((r - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_opposite_moves() {
        let a = [100.0, 110.0, 100.0, 110.0];
        let b = [100.0, 100.0 / 1.1, 100.0, 100.0 / 1.1];
        let r = log_return_correlation(&a, &b, 24).unwrap();
        assert!((r + 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_window_uses_tail() {
        // Early history diverges, the last three returns match exactly
        let a = [1.0, 5.0, 2.0, 2.2, 2.0, 2.4];
        let b = [9.0, 1.0, 4.0, 4.4, 4.0, 4.8];
        let r = log_return_correlation(&a, &b, 3).unwrap();
        assert!((r - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_degenerate_inputs() {
        assert_eq!(log_return_correlation(&[1.0, 2.0], &[1.0, 2.0], 24), None);
        assert_eq!(log_return_correlation(&[1.0; 10], &[1.0, 2.0, 3.0, 4.0], 24), None);
    }
}
