//! A single spot position with fee-aware accounting.
//!
//! Every stored amount is normalized to 8 decimal places. Intermediate
//! products are computed at full precision and normalized once.

use crate::utils::normalize_decimal;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error, PartialEq)]
pub enum PositionError {
    #[error("close ratio must be in (0, 1], got {0}")]
    InvalidCloseRatio(Decimal),
    #[error("entry price must be positive, got {0}")]
    InvalidEntryPrice(Decimal),
}

/// Current worth of an open position.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Valuation {
    pub gross_value: Decimal,
    pub exit_fee: Decimal,
    pub net_value: Decimal,
    pub unrealized_pnl: Decimal,
}

/// Outcome of closing all or part of a position.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CloseResult {
    pub gross_value: Decimal,
    pub exit_fee: Decimal,
    pub net_value: Decimal,
    pub realized_pnl: Decimal,
    /// Entry plus exit fees attributable to the closed part
    pub total_fees: Decimal,
    /// Quantity still held afterwards
    pub remaining_quantity: Decimal,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub pair: String,
    pub entry_price: Decimal,
    /// Quote amount committed, fee included
    pub usdt_size: Decimal,
    pub fee_rate: Decimal,
    pub entry_fee: Decimal,
    /// Base asset received after the entry fee
    pub quantity: Decimal,
    /// Quote amount still attributed to the open quantity
    pub entry_cost: Decimal,
    pub atr: Decimal,
    pub stop_loss: Option<Decimal>,
    pub take_profit: Option<Decimal>,
    /// Active stop, raised by the trailing logic
    pub current_stop: Option<Decimal>,
    pub trailing_activation: Option<Decimal>,
    pub opened_at: DateTime<Utc>,
}

impl Position {
    pub fn open(
        pair: impl Into<String>,
        entry_price: Decimal,
        usdt_size: Decimal,
        fee_rate: Decimal,
        opened_at: DateTime<Utc>,
    ) -> Result<Self, PositionError> {
        let entry_price = normalize_decimal(entry_price);
        if entry_price <= Decimal::ZERO {
            return Err(PositionError::InvalidEntryPrice(entry_price));
        }

        let usdt_size = normalize_decimal(usdt_size);
        let fee_rate = normalize_decimal(fee_rate);
        let entry_fee = normalize_decimal(usdt_size * fee_rate);
        let quantity = normalize_decimal((usdt_size - entry_fee) / entry_price);

        Ok(Self {
            pair: pair.into(),
            entry_price,
            usdt_size,
            fee_rate,
            entry_fee,
            quantity,
            entry_cost: usdt_size,
            atr: normalize_decimal(Decimal::ZERO),
            stop_loss: None,
            take_profit: None,
            current_stop: None,
            trailing_activation: None,
            opened_at,
        })
    }

    /// Whether the position meets the minimum order size.
    pub fn is_valid(&self, min_order: Decimal) -> bool {
        self.usdt_size >= min_order
    }

    pub fn current_value(&self, price: Decimal) -> Valuation {
        let gross_value = normalize_decimal(self.quantity * price);
        let exit_fee = normalize_decimal(gross_value * self.fee_rate);
        let net_value = normalize_decimal(gross_value - exit_fee);

        Valuation {
            gross_value,
            exit_fee,
            net_value,
            unrealized_pnl: normalize_decimal(net_value - self.entry_cost),
        }
    }

    /// Realize the whole position at `price`. The position itself is untouched.
    pub fn close(&self, price: Decimal) -> CloseResult {
        let value = self.current_value(price);

        CloseResult {
            gross_value: value.gross_value,
            exit_fee: value.exit_fee,
            net_value: value.net_value,
            realized_pnl: value.unrealized_pnl,
            total_fees: normalize_decimal(self.entry_fee + value.exit_fee),
            remaining_quantity: normalize_decimal(Decimal::ZERO),
        }
    }

    /// Realize `ratio` of the position and shrink what remains.
    pub fn close_partial(&mut self, price: Decimal, ratio: Decimal) -> Result<CloseResult, PositionError> {
        if ratio <= Decimal::ZERO || ratio > Decimal::ONE {
            return Err(PositionError::InvalidCloseRatio(ratio));
        }

        let close_quantity = normalize_decimal(self.quantity * ratio);
        let remaining_quantity = normalize_decimal(self.quantity - close_quantity);

        let gross_value = normalize_decimal(close_quantity * price);
        let exit_fee = normalize_decimal(gross_value * self.fee_rate);
        let net_value = normalize_decimal(gross_value - exit_fee);

        let closed_cost = normalize_decimal(self.entry_cost * ratio);
        let closed_entry_fee = normalize_decimal(self.entry_fee * ratio);

        let keep = Decimal::ONE - ratio;
        self.quantity = remaining_quantity;
        self.entry_cost = normalize_decimal(self.entry_cost * keep);
        self.entry_fee = normalize_decimal(self.entry_fee * keep);

        Ok(CloseResult {
            gross_value,
            exit_fee,
            net_value,
            realized_pnl: normalize_decimal(net_value - closed_cost),
            total_fees: normalize_decimal(closed_entry_fee + exit_fee),
            remaining_quantity,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use rust_decimal_macros::dec;

    fn open(price: Decimal, size: Decimal) -> Position {
        let at = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        Position::open("SOL/USDT", price, size, dec!(0.001), at).unwrap()
    }

    #[test]
    fn test_open_deducts_fee() {
        let position = open(dec!(100), dec!(50));

        assert_eq!(position.entry_fee, dec!(0.05));
        assert_eq!(position.quantity, dec!(0.4995));
        assert_eq!(position.entry_cost, dec!(50));
        assert_eq!(position.quantity.scale(), 8);
        assert_eq!(position.entry_fee.to_string(), "0.05000000");
    }

    #[test]
    fn test_quantity_rounds_half_up() {
        let position = open(dec!(3), dec!(10));
        // (10 - 0.01) / 3 = 3.33
        assert_eq!(position.quantity, dec!(3.33));

        let position = open(dec!(7), dec!(10));
        // 9.99 / 7 = 1.427142857...
        assert_eq!(position.quantity, dec!(1.42714286));
    }

    #[test]
    fn test_minimum_size() {
        assert!(open(dec!(100), dec!(10)).is_valid(dec!(10)));
        assert!(!open(dec!(100), dec!(9.99)).is_valid(dec!(10)));
    }

    #[test]
    fn test_valuation_and_close() {
        let position = open(dec!(100), dec!(50));
        let value = position.current_value(dec!(110));

        // 0.4995 * 110 = 54.945, fee 0.054945
        assert_eq!(value.gross_value, dec!(54.945));
        assert_eq!(value.exit_fee, dec!(0.054945));
        assert_eq!(value.net_value, dec!(54.890055));
        assert_eq!(value.unrealized_pnl, dec!(4.890055));

        let closed = position.close(dec!(110));
        assert_eq!(closed.realized_pnl, dec!(4.890055));
        assert_eq!(closed.total_fees, dec!(0.104945));
    }

    #[test]
    fn test_partial_close() {
        let mut position = open(dec!(100), dec!(50));
        let result = position.close_partial(dec!(100), dec!(0.5)).unwrap();

        assert_eq!(result.remaining_quantity, dec!(0.24975));
        assert_eq!(position.quantity, dec!(0.24975));
        assert_eq!(position.entry_cost, dec!(25));
        assert_eq!(position.entry_fee, dec!(0.025));
        // 0.24975 * 100 = 24.975, fee 0.024975
        assert_eq!(result.net_value, dec!(24.950025));
        assert_eq!(result.realized_pnl, dec!(-0.049975));
    }

    #[test]
    fn test_partial_close_rejects_bad_ratio() {
        let mut position = open(dec!(100), dec!(50));
        assert_eq!(
            position.close_partial(dec!(100), dec!(0)),
            Err(PositionError::InvalidCloseRatio(dec!(0)))
        );
        assert!(position.close_partial(dec!(100), dec!(1.5)).is_err());
        assert_eq!(position.quantity, dec!(0.4995));

        assert!(position.close_partial(dec!(100), dec!(1)).is_ok());
        assert_eq!(position.quantity, Decimal::ZERO);
    }

    #[test]
    fn test_rejects_zero_price() {
        let at = Utc::now();
        assert!(Position::open("SOL/USDT", Decimal::ZERO, dec!(50), dec!(0.001), at).is_err());
    }

    #[test]
    fn test_rejects_price_below_eight_decimals() {
        // Rounds to zero at 8dp, so it must not reach the quantity division
        let result = Position::open("PEPE/USDT", dec!(0.000000001), dec!(50), dec!(0.001), Utc::now());
        assert_eq!(result, Err(PositionError::InvalidEntryPrice(Decimal::ZERO)));
    }
}
