//! Historical candle loading for backtesting.

use crate::exchange::Candle;
use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use std::collections::BTreeMap;
use std::io::Write;
use std::path::Path;

/// Trait for loading historical candles.
pub trait CandleDataLoader: Send + Sync {
    /// Candles with `start <= open_time <= end`, oldest first.
    fn load_candles(&self, start: Option<DateTime<Utc>>, end: Option<DateTime<Utc>>) -> Result<Vec<Candle>>;

    /// First and last open time in the data.
    fn available_range(&self) -> Option<(DateTime<Utc>, DateTime<Utc>)>;
}

/// CSV candle loader.
///
/// Expected CSV format:
/// ```csv
/// timestamp,open,high,low,close,volume
/// 2024-01-01T00:00:00Z,101.2,102.0,100.9,101.7,35210.5
/// 1704067200000,101.7,101.9,101.1,101.4,28001.0
/// ```
/// Timestamps may be RFC3339, `YYYY-MM-DD HH:MM:SS` (UTC) or epoch milliseconds.
#[derive(Clone)]
pub struct CsvCandleLoader {
    candles: Vec<Candle>,
}

impl CsvCandleLoader {
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read CSV file: {}", path.display()))?;

        Self::from_csv_content(&content)
    }

    /// Parse CSV content. Duplicate timestamps keep the first row.
    pub fn from_csv_content(content: &str) -> Result<Self> {
        let mut by_time: BTreeMap<i64, Candle> = BTreeMap::new();

        for (line_num, line) in content.lines().enumerate() {
            if line_num == 0 && line.trim_start().starts_with("timestamp") {
                continue;
            }
            if line.trim().is_empty() {
                continue;
            }

            let candle = parse_row(line)
                .with_context(|| format!("Failed to parse line {}: {}", line_num + 1, line))?;
            by_time.entry(candle.open_time_ms()).or_insert(candle);
        }

        if by_time.is_empty() {
            anyhow::bail!("CSV file contains no data rows");
        }

        Ok(Self {
            candles: by_time.into_values().collect(),
        })
    }

    pub fn from_candles(mut candles: Vec<Candle>) -> Self {
        candles.sort_by_key(|c| c.open_time);
        candles.dedup_by_key(|c| c.open_time);
        Self { candles }
    }

    pub fn len(&self) -> usize {
        self.candles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.candles.is_empty()
    }
}

impl CandleDataLoader for CsvCandleLoader {
    fn load_candles(&self, start: Option<DateTime<Utc>>, end: Option<DateTime<Utc>>) -> Result<Vec<Candle>> {
        Ok(self
            .candles
            .iter()
            .filter(|c| start.map_or(true, |s| c.open_time >= s))
            .filter(|c| end.map_or(true, |e| c.open_time <= e))
            .cloned()
            .collect())
    }

    fn available_range(&self) -> Option<(DateTime<Utc>, DateTime<Utc>)> {
        let first = self.candles.first()?;
        let last = self.candles.last()?;
        Some((first.open_time, last.open_time))
    }
}

/// Write candles in the format [`CsvCandleLoader`] reads.
pub fn write_candles_csv<P: AsRef<Path>>(path: P, candles: &[Candle]) -> Result<()> {
    let path = path.as_ref();
    let mut file = std::fs::File::create(path)
        .with_context(|| format!("Failed to create {}", path.display()))?;
    writeln!(file, "timestamp,open,high,low,close,volume")?;

    for c in candles {
        writeln!(
            file,
            "{},{},{},{},{},{}",
            c.open_time.to_rfc3339(),
            c.open,
            c.high,
            c.low,
            c.close,
            c.volume
        )?;
    }
    Ok(())
}

fn parse_row(line: &str) -> Result<Candle> {
    let parts: Vec<&str> = line.split(',').map(str::trim).collect();
    if parts.len() < 6 {
        anyhow::bail!(
            "Expected 6 columns (timestamp,open,high,low,close,volume), got {}",
            parts.len()
        );
    }

    let field = |idx: usize, name: &str| -> Result<f64> {
        let value: f64 = parts[idx]
            .parse()
            .with_context(|| format!("Invalid {}: {}", name, parts[idx]))?;
        anyhow::ensure!(value.is_finite(), "Non-finite {}: {}", name, parts[idx]);
        Ok(value)
    };

    Ok(Candle::new(
        parse_timestamp(parts[0])?,
        field(1, "open")?,
        field(2, "high")?,
        field(3, "low")?,
        field(4, "close")?,
        field(5, "volume")?,
    ))
}

fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>> {
    if let Ok(ms) = raw.parse::<i64>() {
        return Utc
            .timestamp_millis_opt(ms)
            .single()
            .with_context(|| format!("Timestamp out of range: {raw}"));
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Ok(dt.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S")
        .map(|naive| naive.and_utc())
        .with_context(|| format!("Invalid timestamp: {raw}"))
}
