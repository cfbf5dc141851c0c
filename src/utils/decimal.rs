//! Decimal arithmetic utilities for financial calculations.
//!
//! Every monetary amount in the bot passes through [`normalize_decimal`],
//! which quantizes to 8 fractional digits with round-half-up (ties away
//! from zero) and always leaves the value at scale 8.

use rust_decimal::prelude::ToPrimitive;
use rust_decimal::{Decimal, RoundingStrategy};
use std::str::FromStr;
use thiserror::Error;

/// Fractional digits kept on every normalized amount.
pub const DECIMAL_PLACES: u32 = 8;

/// Errors raised when converting external numbers into decimals.
#[derive(Debug, Error, PartialEq)]
pub enum DecimalError {
    #[error("invalid decimal literal: {0:?}")]
    Invalid(String),
    #[error("non-finite float cannot be represented as a decimal: {0}")]
    NonFinite(f64),
}

/// Quantize to 8 decimal places using round-half-up.
pub fn normalize_decimal(value: Decimal) -> Decimal {
    normalize_to(value, DECIMAL_PLACES)
}

/// Quantize to `dp` decimal places using round-half-up, keeping trailing zeros.
pub fn normalize_to(value: Decimal, dp: u32) -> Decimal {
    let mut rounded = value.round_dp_with_strategy(dp, RoundingStrategy::MidpointAwayFromZero);
    rounded.rescale(dp);
    rounded
}

/// Parse a decimal string (plain or scientific notation) and normalize it.
pub fn parse_decimal(input: &str) -> Result<Decimal, DecimalError> {
    let trimmed = input.trim();
    let parsed = if trimmed.contains(['e', 'E']) {
        Decimal::from_scientific(trimmed)
    } else {
        Decimal::from_str(trimmed)
    };

    parsed
        .map(normalize_decimal)
        .map_err(|_| DecimalError::Invalid(input.to_string()))
}

/// Convert a float through its shortest round-trip text form, then normalize.
///
/// `0.1` becomes `0.10000000`, not the binary expansion of the float.
pub fn decimal_from_f64(value: f64) -> Result<Decimal, DecimalError> {
    if !value.is_finite() {
        return Err(DecimalError::NonFinite(value));
    }
    parse_decimal(&value.to_string())
}

/// Lossy conversion for indicator math and display.
pub fn to_f64(value: Decimal) -> f64 {
    value.to_f64().unwrap_or(0.0)
}

/// Safe division that returns zero if divisor is zero.
pub fn safe_div(numerator: Decimal, denominator: Decimal) -> Decimal {
    if denominator == Decimal::ZERO {
        Decimal::ZERO
    } else {
        numerator / denominator
    }
}

/// Calculate percentage change from `base` to `value`.
pub fn percentage_diff(value: Decimal, base: Decimal) -> Decimal {
    safe_div(value - base, base) * Decimal::ONE_HUNDRED
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_round_half_up() {
        assert_eq!(
            parse_decimal("0.123456785").unwrap().to_string(),
            "0.12345679"
        );
        assert_eq!(
            parse_decimal("0.1234567849").unwrap().to_string(),
            "0.12345678"
        );
        assert_eq!(
            parse_decimal("0.123456784").unwrap().to_string(),
            "0.12345678"
        );
    }

    #[test]
    fn test_smallest_value_rounds_to_zero() {
        assert_eq!(
            parse_decimal("0.000000001").unwrap().to_string(),
            "0.00000000"
        );
        assert_eq!(
            parse_decimal("0.000000005").unwrap().to_string(),
            "0.00000001"
        );
    }

    #[test]
    fn test_float_input_keeps_scale() {
        let two = decimal_from_f64(2.0).unwrap();
        assert_eq!(two, dec!(2));
        assert_eq!(two.scale(), 8);
        assert_eq!(two.to_string(), "2.00000000");
    }

    #[test]
    fn test_float_uses_shortest_repr() {
        // 0.123456785 is not exactly representable in binary; the textual
        // form is what gets rounded.
        assert_eq!(decimal_from_f64(0.123456785).unwrap(), dec!(0.12345679));
        assert_eq!(decimal_from_f64(0.1).unwrap().to_string(), "0.10000000");
    }

    #[test]
    fn test_negative_ties_round_away_from_zero() {
        assert_eq!(normalize_decimal(dec!(-0.123456785)), dec!(-0.12345679));
    }

    #[test]
    fn test_scientific_and_whitespace() {
        assert_eq!(parse_decimal(" 1.5e-3 ").unwrap(), dec!(0.0015));
        assert_eq!(parse_decimal("1E2").unwrap(), dec!(100));
    }

    #[test]
    fn test_invalid_inputs() {
        assert!(matches!(parse_decimal("abc"), Err(DecimalError::Invalid(_))));
        assert_eq!(
            decimal_from_f64(f64::NAN).unwrap_err().to_string(),
            "non-finite float cannot be represented as a decimal: NaN"
        );
        assert!(decimal_from_f64(f64::INFINITY).is_err());
    }

    #[test]
    fn test_normalize_to_precision() {
        assert_eq!(normalize_to(dec!(1.005), 2), dec!(1.01));
        assert_eq!(normalize_to(dec!(3), 2).to_string(), "3.00");
    }

    #[test]
    fn test_percentage_diff() {
        assert_eq!(percentage_diff(dec!(110), dec!(100)), dec!(10));
        assert_eq!(percentage_diff(dec!(5), Decimal::ZERO), Decimal::ZERO);
    }
}
