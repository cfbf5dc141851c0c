//! Shared utilities.

pub mod decimal;

pub use decimal::{
    decimal_from_f64, normalize_decimal, normalize_to, parse_decimal, percentage_diff, safe_div,
    to_f64, DecimalError, DECIMAL_PLACES,
};
