//! Maximum drawdown tracking.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use tracing::warn;

/// Share of the alert level left before `near_alert` reports true.
const NEAR_ALERT_MARGIN: Decimal = dec!(0.2);

/// Peak equity and the deepest fall from it.
///
/// The alert level only drives warnings; it never halts trading.
#[derive(Debug, Clone)]
pub struct DrawdownTracker {
    /// Drawdown (0.0-1.0) at which alerts fire
    alert_drawdown: Decimal,
    peak_equity: Decimal,
    peak_at: DateTime<Utc>,
    current_drawdown: Decimal,
    /// Worst drawdown observed, carried across restarts
    max_drawdown: Decimal,
}

impl DrawdownTracker {
    pub fn new(alert_drawdown: Decimal, initial_equity: Decimal, at: DateTime<Utc>) -> Self {
        Self {
            alert_drawdown,
            peak_equity: initial_equity,
            peak_at: at,
            current_drawdown: Decimal::ZERO,
            max_drawdown: Decimal::ZERO,
        }
    }

    /// Resume from a saved peak and maximum drawdown.
    pub fn restore(&mut self, peak_equity: Decimal, max_drawdown: Decimal, at: DateTime<Utc>) {
        self.peak_equity = peak_equity;
        self.peak_at = at;
        self.max_drawdown = max_drawdown.max(Decimal::ZERO);
        self.current_drawdown = Decimal::ZERO;
    }

    /// Mark equity at `at`. True when the drawdown is at or past the alert level.
    pub fn update(&mut self, equity: Decimal, at: DateTime<Utc>) -> bool {
        if equity > self.peak_equity {
            self.peak_equity = equity;
            self.peak_at = at;
            self.current_drawdown = Decimal::ZERO;
            return false;
        }
        if self.peak_equity <= Decimal::ZERO {
            return false;
        }

        self.current_drawdown = (self.peak_equity - equity) / self.peak_equity;
        if self.current_drawdown > self.max_drawdown {
            self.max_drawdown = self.current_drawdown;
            if self.max_drawdown >= self.alert_drawdown {
                warn!(
                    mdd = %self.max_drawdown.round_dp(4),
                    peak = %self.peak_equity,
                    peak_at = %self.peak_at,
                    current = %equity,
                    "New maximum drawdown recorded"
                );
            }
        }

        self.current_drawdown >= self.alert_drawdown
    }

    pub fn current_drawdown(&self) -> Decimal {
        self.current_drawdown
    }

    pub fn max_drawdown(&self) -> Decimal {
        self.max_drawdown
    }

    pub fn peak_equity(&self) -> Decimal {
        self.peak_equity
    }

    /// Remaining room before the alert level, when it is within the last fifth of it.
    pub fn near_alert(&self) -> Option<Decimal> {
        let room = self.alert_drawdown - self.current_drawdown;
        (self.current_drawdown > Decimal::ZERO && room <= self.alert_drawdown * NEAR_ALERT_MARGIN)
            .then_some(room)
    }
}
