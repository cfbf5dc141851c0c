//! Log analysis and decimal self-check for a running bot.

use crate::utils::{normalize_decimal, parse_decimal};
use anyhow::{Context, Result};
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

/// Decimal-related error lines shown in the report.
const SHOWN_DECIMAL_ERRORS: usize = 5;

/// Reference inputs for `normalize_decimal` and their 8dp renderings.
pub const NORMALIZE_VECTORS: [(&str, &str); 5] = [
    ("0.123456785", "0.12345679"),
    ("0.123456784", "0.12345678"),
    ("0.1234567849", "0.12345678"),
    ("2", "2.00000000"),
    ("0.000000001", "0.00000000"),
];

/// Summary of one log file.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LogReport {
    pub errors: usize,
    pub warnings: usize,
    pub buy_signals: usize,
    pub sell_signals: usize,
    pub decimal_operations: usize,
    /// ERROR lines mentioning decimals, in file order
    pub decimal_errors: Vec<String>,
}

impl LogReport {
    pub fn is_clean(&self) -> bool {
        self.errors == 0 && self.decimal_errors.is_empty()
    }
}

impl fmt::Display for LogReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Log Analysis")?;
        writeln!(f, "   ├─ Errors:             {}", self.errors)?;
        writeln!(f, "   ├─ Warnings:           {}", self.warnings)?;
        writeln!(f, "   ├─ Buy Signals:        {}", self.buy_signals)?;
        writeln!(f, "   ├─ Sell Signals:       {}", self.sell_signals)?;
        write!(f, "   └─ Decimal Operations: {}", self.decimal_operations)?;

        if !self.decimal_errors.is_empty() {
            write!(f, "\n\nDecimal-related errors:")?;
            for line in self.decimal_errors.iter().take(SHOWN_DECIMAL_ERRORS) {
                write!(f, "\n   - {}", line.trim())?;
            }
            if self.decimal_errors.len() > SHOWN_DECIMAL_ERRORS {
                write!(f, "\n   ... and {} more", self.decimal_errors.len() - SHOWN_DECIMAL_ERRORS)?;
            }
        }
        Ok(())
    }
}

/// One self-check vector and what `normalize_decimal` produced for it.
#[derive(Debug, Clone, PartialEq)]
pub struct CheckOutcome {
    pub input: &'static str,
    pub expected: &'static str,
    pub actual: String,
}

impl CheckOutcome {
    pub fn passed(&self) -> bool {
        self.actual == self.expected
    }
}

/// Most recently modified `.log` file under `dir`, rolled files included.
pub fn latest_log_file<P: AsRef<Path>>(dir: P) -> Result<Option<PathBuf>> {
    let dir = dir.as_ref();
    if !dir.is_dir() {
        return Ok(None);
    }

    let mut latest: Option<(SystemTime, PathBuf)> = None;
    for entry in std::fs::read_dir(dir).with_context(|| format!("Failed to read {}", dir.display()))? {
        let entry = entry?;
        let path = entry.path();
        let name = entry.file_name();
        if !path.is_file() || !name.to_string_lossy().contains(".log") {
            continue;
        }

        let modified = entry.metadata()?.modified()?;
        if latest.as_ref().map_or(true, |(t, _)| modified > *t) {
            latest = Some((modified, path));
        }
    }

    Ok(latest.map(|(_, path)| path))
}

/// Count errors, warnings and signals in a log.
pub fn analyze_log(content: &str) -> LogReport {
    let mut report = LogReport::default();

    for line in content.lines() {
        let is_error = line.contains("ERROR");
        if is_error {
            report.errors += 1;
        }
        if line.contains("WARN") {
            report.warnings += 1;
        }
        if line.contains("Buy signal generated") {
            report.buy_signals += 1;
        }
        if line.contains("Sell signal generated") {
            report.sell_signals += 1;
        }
        if line.contains("normalize_decimal") {
            report.decimal_operations += 1;
        }
        if is_error && line.to_lowercase().contains("decimal") {
            report.decimal_errors.push(line.to_string());
        }
    }

    report
}

/// Read and analyze the newest log under `dir`.
pub fn analyze_latest<P: AsRef<Path>>(dir: P) -> Result<Option<(PathBuf, LogReport)>> {
    let Some(path) = latest_log_file(dir)? else {
        return Ok(None);
    };
    let content = std::fs::read_to_string(&path)
        .with_context(|| format!("Failed to read log file: {}", path.display()))?;
    Ok(Some((path, analyze_log(&content))))
}

/// Run every reference vector through `normalize_decimal`.
pub fn self_check() -> Vec<CheckOutcome> {
    NORMALIZE_VECTORS
        .iter()
        .map(|&(input, expected)| {
            let actual = match parse_decimal(input) {
                Ok(value) => normalize_decimal(value).to_string(),
                Err(e) => format!("error: {e}"),
            };
            CheckOutcome {
                input,
                expected,
                actual,
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    const LOG: &str = "\
2024-03-01T00:00:00Z  INFO altseason_trader::strategy::signals: Buy signal generated: all conditions met pair=\"SOL/USDT\"
2024-03-01T00:15:00Z  WARN altseason_trader::market: BTC dominance unavailable
2024-03-01T00:30:00Z ERROR altseason_trader::trading::bot: Pair failed pair=\"ADA/USDT\" error=Invalid decimal: abc
2024-03-01T00:45:00Z  INFO altseason_trader::strategy::signals: Sell signal generated: exit conditions met pair=\"SOL/USDT\"
2024-03-01T01:00:00Z ERROR altseason_trader::exchange::client: Request failed status=503
";

    #[test]
    fn test_analyze_log_counts() {
        let report = analyze_log(LOG);

        assert_eq!(report.errors, 2);
        assert_eq!(report.warnings, 1);
        assert_eq!(report.buy_signals, 1);
        assert_eq!(report.sell_signals, 1);
        assert_eq!(report.decimal_errors.len(), 1);
        assert!(report.decimal_errors[0].contains("ADA/USDT"));
        assert!(!report.is_clean());
    }

    #[test]
    fn test_report_shows_first_five_decimal_errors() {
        let content: String = (0..7)
            .map(|i| format!("ERROR bad decimal #{i}\n"))
            .collect();
        let report = analyze_log(&content);
        let rendered = report.to_string();

        assert_eq!(report.decimal_errors.len(), 7);
        assert!(rendered.contains("bad decimal #4"));
        assert!(!rendered.contains("bad decimal #5"));
        assert!(rendered.contains("... and 2 more"));
    }

    #[test]
    fn test_empty_log_is_clean() {
        let report = analyze_log("");
        assert_eq!(report, LogReport::default());
        assert!(report.is_clean());
    }

    #[test]
    fn test_self_check_passes() {
        let outcomes = self_check();
        assert_eq!(outcomes.len(), NORMALIZE_VECTORS.len());
        for outcome in &outcomes {
            assert!(outcome.passed(), "{} -> {} (expected {})", outcome.input, outcome.actual, outcome.expected);
        }
    }

    #[test]
    fn test_latest_log_file() {
        let dir = std::env::temp_dir().join(format!("monitor-logs-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        assert!(latest_log_file(&dir).unwrap().is_none());

        std::fs::write(dir.join("notes.txt"), "ignored").unwrap();
        std::fs::write(dir.join("trading-bot.log.2024-03-01-00"), LOG).unwrap();
        let found = latest_log_file(&dir).unwrap().unwrap();
        assert!(found.ends_with("trading-bot.log.2024-03-01-00"));

        let (_, report) = analyze_latest(&dir).unwrap().unwrap();
        assert_eq!(report.buy_signals, 1);

        std::fs::remove_dir_all(dir).ok();
        assert!(latest_log_file(std::env::temp_dir().join("no-such-log-dir-xyz")).unwrap().is_none());
    }
}
