//! Decimal helpers for quantities, prices and ratios.

use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;

/// Round to tick size (e.g., 0.01 for most prices).
pub fn round_to_tick(value: Decimal, tick_size: Decimal) -> Decimal {
    if tick_size <= Decimal::ZERO {
        return value;
    }
    (value / tick_size).round() * tick_size
}

/// Round down to lot size (quantity precision).
pub fn round_down_to_lot(value: Decimal, lot_size: Decimal) -> Decimal {
    if lot_size <= Decimal::ZERO {
        return value;
    }
    (value / lot_size).floor() * lot_size
}

/// Safe division that returns zero if divisor is zero.
pub fn safe_div(numerator: Decimal, denominator: Decimal) -> Decimal {
    if denominator == Decimal::ZERO {
        Decimal::ZERO
    } else {
        numerator / denominator
    }
}

/// Clamp into `[lo, hi]`.
pub fn clamp(value: Decimal, lo: Decimal, hi: Decimal) -> Decimal {
    value.max(lo).min(hi)
}

/// Step size implied by a number of decimal places (3 -> 0.001).
pub fn step_from_precision(decimals: u32) -> Decimal {
    Decimal::new(1, decimals)
}

/// Lossy conversion for jitter and logging math.
pub fn to_f64(value: Decimal) -> f64 {
    value.to_f64().unwrap_or(0.0)
}
