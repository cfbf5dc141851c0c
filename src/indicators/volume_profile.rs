//! Volume-at-price profile with point of control and value area.

use crate::exchange::Candle;
use std::collections::BTreeMap;

/// Result of a volume profile calculation.
#[derive(Debug, Clone, PartialEq)]
pub struct ProfileLevels {
    /// Price bucket with the most traded volume
    pub poc: f64,
    pub value_area_low: f64,
    pub value_area_high: f64,
    pub bucket_width: f64,
}

impl ProfileLevels {
    pub fn contains(&self, price: f64) -> bool {
        price >= self.value_area_low && price <= self.value_area_high
    }
}

#[derive(Debug, Clone, Copy)]
pub struct VolumeProfile {
    /// Bucket width as a fraction of the latest close
    pub bucket_size: f64,
    /// Standard deviations of close around the POC
    pub value_area_sd: f64,
    /// Bars considered, counting back from the latest
    pub lookback: usize,
}

impl Default for VolumeProfile {
    fn default() -> Self {
        Self {
            bucket_size: 0.0025,
            value_area_sd: 1.2,
            lookback: 14 * 96,
        }
    }
}

impl VolumeProfile {
    pub fn new(bucket_size: f64, value_area_sd: f64, lookback: usize) -> Self {
        Self {
            bucket_size,
            value_area_sd,
            lookback,
        }
    }

    /// Profile of the last `lookback` candles; `None` for empty input or a
    /// non-positive price.
    pub fn calculate(&self, candles: &[Candle]) -> Option<ProfileLevels> {
        let window = &candles[candles.len().saturating_sub(self.lookback)..];
        let last = window.last()?;
        let width = last.close * self.bucket_size;
        if !(width.is_finite() && width > 0.0) {
            return None;
        }

        let mut volume_by_bucket: BTreeMap<i64, f64> = BTreeMap::new();
        for candle in window {
            let bucket = (candle.close / width).round() as i64;
            *volume_by_bucket.entry(bucket).or_default() += candle.volume;
        }

        // Ties resolve to the lowest price bucket.
        let (poc_bucket, _) = volume_by_bucket
            .iter()
            .fold(None::<(i64, f64)>, |best, (&bucket, &volume)| match best {
                Some((_, best_volume)) if best_volume >= volume => best,
                _ => Some((bucket, volume)),
            })?;
        let poc = poc_bucket as f64 * width;

        let spread = sample_std(window.iter().map(|c| c.close)) * self.value_area_sd;

        Some(ProfileLevels {
            poc,
            value_area_low: poc - spread,
            value_area_high: poc + spread,
            bucket_width: width,
        })
    }
}

/// Sample standard deviation (n - 1); zero for fewer than two values.
fn sample_std(values: impl Iterator<Item = f64> + Clone) -> f64 {
    let n = values.clone().count();
    if n < 2 {
        return 0.0;
    }
    let mean = values.clone().sum::<f64>() / n as f64;
    let var = values.map(|v| (v - mean).powi(2)).sum::<f64>() / (n - 1) as f64;
    var.sqrt()
}
