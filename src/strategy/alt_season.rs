//! Alt season detection from Bitcoin market cap dominance.

use rust_decimal::Decimal;

#[derive(Debug, Clone, Copy)]
pub struct AltSeasonGate {
    /// Dominance (percent) below which altcoins are in season
    threshold: Decimal,
    enabled: bool,
}

impl AltSeasonGate {
    pub fn new(threshold: Decimal, enabled: bool) -> Self {
        Self { threshold, enabled }
    }

    pub fn threshold(&self) -> Decimal {
        self.threshold
    }

    pub fn is_alt_season(&self, dominance: Decimal) -> bool {
        dominance < self.threshold
    }

    /// Whether new entries are allowed. Unknown dominance does not block.
    ///
    /// Pure check; callers log the outcome.
    pub fn allows_entries(&self, dominance: Option<Decimal>) -> bool {
        !self.enabled || dominance.map_or(true, |d| self.is_alt_season(d))
    }
}
