//! Position sizing.
//!
//! Sizes are expressed as margin committed in quote currency; exposure is
//! margin times leverage. Every size clears the venue minimum notional with a
//! safety buffer and is quantized to the step size before it leaves here.

use crate::config::{SizingConfig, SizingMode};
use crate::error::SizingError;
use crate::exchange::{LotSize, Pair};
use crate::utils::{clamp, safe_div};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use tracing::debug;

const MIN_WIN_RATE: Decimal = dec!(0.5);
const MAX_WIN_RATE: Decimal = dec!(0.99);
const FEE_EPSILON: Decimal = dec!(0.000001);
const LOSS_EPSILON: Decimal = dec!(0.01);

/// Win rate clamped into the range every formula here assumes.
pub fn clamp_win_rate(win_rate: Decimal) -> Decimal {
    clamp(win_rate, MIN_WIN_RATE, MAX_WIN_RATE)
}

/// Smallest net profit worth targeting for a position of `size`.
///
/// Round-trip fees scaled by `1 / (2w - 0.5)`, floored at `floor`.
pub fn calculate_minimum_profit(
    size: Decimal,
    fee_rate: Decimal,
    win_rate: Decimal,
    floor: Decimal,
) -> Decimal {
    let fee_rate = fee_rate.max(FEE_EPSILON);
    let w = clamp_win_rate(win_rate);
    let round_trip = size.max(Decimal::ZERO) * fee_rate * dec!(2);
    let edge = dec!(2) * w - dec!(0.5);
    (round_trip / edge).max(floor)
}

/// Minimum profit with a safety multiplier that grows as free capital
/// shrinks relative to the position and as volatility rises.
pub fn calculate_optimal_profit(
    minimum_profit: Decimal,
    size: Decimal,
    available: Decimal,
    volatility: Option<Decimal>,
    target_volatility: Decimal,
) -> Decimal {
    let float_pressure = if available <= Decimal::ZERO {
        Decimal::ONE
    } else {
        clamp(size / available, Decimal::ZERO, Decimal::ONE)
    };
    let vol_pressure = volatility
        .map(|v| clamp(safe_div(v, target_volatility.max(FEE_EPSILON)), Decimal::ZERO, dec!(2)))
        .unwrap_or(Decimal::ZERO);

    minimum_profit * (Decimal::ONE + float_pressure * dec!(0.5) + vol_pressure * dec!(0.25))
}

/// Half-Kelly fraction of capital, clamped to `[0, ceiling]` before halving.
pub fn kelly_fraction(win_rate: Decimal, win_loss_ratio: Decimal, ceiling: Decimal) -> Decimal {
    let p = clamp_win_rate(win_rate);
    let b = win_loss_ratio.max(LOSS_EPSILON);
    let full = p - (Decimal::ONE - p) / b;
    clamp(full, Decimal::ZERO, ceiling) / dec!(2)
}

/// Mean absolute one-period return over a close series, oldest first.
pub fn volatility(closes: &[Decimal]) -> Option<Decimal> {
    let returns: Vec<Decimal> = closes
        .windows(2)
        .filter(|w| w[0] > Decimal::ZERO)
        .map(|w| ((w[1] - w[0]) / w[0]).abs())
        .collect();
    if returns.is_empty() {
        return None;
    }
    Some(returns.iter().sum::<Decimal>() / Decimal::from(returns.len()))
}

/// Everything the sizer needs for one decision.
#[derive(Debug, Clone)]
pub struct SizingInputs {
    pub pair: Pair,
    pub target_profit: Decimal,
    pub leverage: u32,
    pub available_balance: Decimal,
    pub price: Decimal,
    pub lot: LotSize,
    pub fee_rate: Decimal,
    pub win_rate: Option<Decimal>,
    pub win_loss_ratio: Option<Decimal>,
    pub volatility: Option<Decimal>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SizeDecision {
    /// Margin committed in quote currency
    pub notional: Decimal,
    /// Base quantity, a multiple of the step size
    pub quantity: Decimal,
    pub round_trip_fees: Decimal,
    /// Net profit the exit manager should wait for
    pub target_profit: Decimal,
}

pub struct PositionSizer {
    config: SizingConfig,
}

impl PositionSizer {
    pub fn new(config: SizingConfig) -> Self {
        Self { config }
    }

    pub fn size(&self, inputs: &SizingInputs) -> Result<SizeDecision, SizingError> {
        if inputs.price <= Decimal::ZERO {
            return Err(SizingError::InvalidPrice(inputs.price));
        }
        let leverage = Decimal::from(inputs.leverage.max(1));
        let win_rate = inputs.win_rate.unwrap_or(self.config.default_win_rate);

        let min_margin = inputs.lot.min_notional * self.config.min_notional_buffer / leverage;
        let cap = self.config.max_position_size.min(inputs.available_balance);
        if cap < min_margin {
            return Err(SizingError::InsufficientBalance {
                available: inputs.available_balance,
                required: min_margin,
            });
        }

        let candidate = match self.config.mode {
            SizingMode::Fixed => self.config.fixed_position_size,
            SizingMode::Volatility => match inputs.volatility {
                Some(vol) if vol > Decimal::ZERO => {
                    let scale = clamp(self.config.target_volatility / vol, dec!(0.5), dec!(2));
                    self.config.fixed_position_size * scale
                }
                _ => self.config.fixed_position_size,
            },
            SizingMode::Kelly => {
                let ratio = inputs.win_loss_ratio.unwrap_or(Decimal::ONE);
                inputs.available_balance * kelly_fraction(win_rate, ratio, self.config.kelly_ceiling)
            }
        };
        let notional = clamp(candidate, min_margin, cap);

        let mut quantity = inputs.lot.quantize(notional * leverage / inputs.price);
        if inputs.lot.is_dust(quantity, inputs.price) {
            // One step up if the cap still allows it
            let bumped = quantity + inputs.lot.step_size;
            if !inputs.lot.is_dust(bumped, inputs.price) && bumped * inputs.price / leverage <= cap {
                quantity = bumped;
            } else {
                return Err(SizingError::BelowMinimum {
                    pair: inputs.pair.to_string(),
                    quantity,
                });
            }
        }

        let exposure = quantity * inputs.price;
        let notional = exposure / leverage;
        let round_trip_fees = exposure * inputs.fee_rate * dec!(2);
        let minimum = calculate_minimum_profit(
            exposure,
            inputs.fee_rate,
            win_rate,
            self.config.min_profit_floor,
        );
        let optimal = calculate_optimal_profit(
            minimum,
            notional,
            inputs.available_balance,
            inputs.volatility,
            self.config.target_volatility,
        );
        let target_profit = inputs.target_profit.max(optimal);

        debug!(
            pair = %inputs.pair,
            %notional,
            %quantity,
            %round_trip_fees,
            %target_profit,
            "Sized position"
        );

        Ok(SizeDecision {
            notional,
            quantity,
            round_trip_fees,
            target_profit,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lot() -> LotSize {
        LotSize {
            step_size: dec!(0.0001),
            min_qty: dec!(0.0001),
            min_notional: dec!(10),
        }
    }

    fn inputs(available: Decimal) -> SizingInputs {
        SizingInputs {
            pair: Pair::new("BTC", "USDT"),
            target_profit: dec!(0.1),
            leverage: 1,
            available_balance: available,
            price: dec!(50000),
            lot: lot(),
            fee_rate: dec!(0.001),
            win_rate: None,
            win_loss_ratio: None,
            volatility: None,
        }
    }

    #[test]
    fn test_minimum_profit_monotonic_in_fee_and_win_rate() {
        let fees = [dec!(0), dec!(0.0005), dec!(0.001), dec!(0.002), dec!(0.01)];
        let rates = [dec!(0.5), dec!(0.6), dec!(0.75), dec!(0.9), dec!(0.99)];
        for w in rates {
            let by_fee: Vec<_> = fees
                .iter()
                .map(|f| calculate_minimum_profit(dec!(100), *f, w, dec!(0)))
                .collect();
            assert!(by_fee.windows(2).all(|p| p[0] <= p[1]));
        }
        for f in fees {
            let by_rate: Vec<_> = rates
                .iter()
                .map(|w| calculate_minimum_profit(dec!(100), f, *w, dec!(0)))
                .collect();
            assert!(by_rate.windows(2).all(|p| p[0] >= p[1]));
        }
    }

    #[test]
    fn test_win_rate_clamped_at_extremes() {
        let at_zero = calculate_minimum_profit(dec!(100), dec!(0.001), dec!(0), dec!(0));
        let at_half = calculate_minimum_profit(dec!(100), dec!(0.001), dec!(0.5), dec!(0));
        assert_eq!(at_zero, at_half);
        let at_one = calculate_minimum_profit(dec!(100), dec!(0.001), dec!(1), dec!(0));
        let at_99 = calculate_minimum_profit(dec!(100), dec!(0.001), dec!(0.99), dec!(0));
        assert_eq!(at_one, at_99);
    }

    #[test]
    fn test_minimum_profit_floor() {
        assert_eq!(
            calculate_minimum_profit(dec!(1), dec!(0.001), dec!(0.6), dec!(0.05)),
            dec!(0.05)
        );
    }

    #[test]
    fn test_kelly_is_halved_and_capped() {
        // p = 0.6, b = 2 -> 0.6 - 0.4 / 2 = 0.4, capped to 0.25, halved
        assert_eq!(kelly_fraction(dec!(0.6), dec!(2), dec!(0.25)), dec!(0.125));
        // p = 0.55, b = 1 -> 0.1, halved
        assert_eq!(kelly_fraction(dec!(0.55), dec!(1), dec!(0.25)), dec!(0.05));
        // Negative edge clamps to zero
        assert_eq!(kelly_fraction(dec!(0.5), dec!(0.5), dec!(0.25)), dec!(0));
    }

    #[test]
    fn test_optimal_profit_grows_with_pressure() {
        let base = calculate_optimal_profit(dec!(1), dec!(10), dec!(1000), None, dec!(0.002));
        let tight = calculate_optimal_profit(dec!(1), dec!(10), dec!(20), None, dec!(0.002));
        let volatile =
            calculate_optimal_profit(dec!(1), dec!(10), dec!(1000), Some(dec!(0.004)), dec!(0.002));
        assert!(tight > base);
        assert!(volatile > base);
    }

    #[test]
    fn test_size_within_bounds_for_small_balance() {
        let sizer = PositionSizer::new(SizingConfig::default());
        let decision = sizer.size(&inputs(dec!(50))).unwrap();
        assert!(decision.notional >= dec!(11) && decision.notional <= dec!(50));
        assert_eq!(decision.quantity, dec!(0.0004));
        assert_eq!(decision.round_trip_fees, dec!(0.04));
    }

    #[test]
    fn test_insufficient_balance() {
        let sizer = PositionSizer::new(SizingConfig::default());
        let err = sizer.size(&inputs(dec!(10))).unwrap_err();
        assert!(matches!(err, SizingError::InsufficientBalance { .. }));
    }

    #[test]
    fn test_quantity_is_multiple_of_step() {
        let sizer = PositionSizer::new(SizingConfig::default());
        let mut input = inputs(dec!(50));
        input.price = dec!(33333.33);
        let decision = sizer.size(&input).unwrap();
        assert_eq!(decision.quantity % dec!(0.0001), dec!(0));
        assert!(decision.quantity * input.price <= dec!(20));
    }

    #[test]
    fn test_target_never_below_fee_floor() {
        let sizer = PositionSizer::new(SizingConfig::default());
        let mut input = inputs(dec!(50));
        input.target_profit = dec!(0);
        let decision = sizer.size(&input).unwrap();
        assert!(decision.target_profit >= decision.round_trip_fees);
    }

    #[test]
    fn test_target_raised_by_float_and_volatility() {
        let sizer = PositionSizer::new(SizingConfig::default());
        let mut input = inputs(dec!(50));
        input.target_profit = dec!(0.01);
        let calm = sizer.size(&input).unwrap();

        input.volatility = Some(dec!(0.004));
        let volatile = sizer.size(&input).unwrap();

        let minimum = calculate_minimum_profit(dec!(20), dec!(0.001), dec!(0.55), dec!(0.05));
        assert_eq!(
            volatile.target_profit,
            calculate_optimal_profit(minimum, dec!(20), dec!(50), Some(dec!(0.004)), dec!(0.002))
        );
        assert!(calm.target_profit > minimum);
        assert!(volatile.target_profit > calm.target_profit);

        // An explicit target above the computed one is kept
        input.target_profit = dec!(1);
        assert_eq!(sizer.size(&input).unwrap().target_profit, dec!(1));
    }

    #[test]
    fn test_kelly_uses_win_loss_ratio() {
        let config = SizingConfig {
            mode: SizingMode::Kelly,
            ..SizingConfig::default()
        };
        let sizer = PositionSizer::new(config);
        let mut input = inputs(dec!(200));
        input.win_rate = Some(dec!(0.6));

        // b = 1: (0.6 - 0.4) / 2 of 200
        assert_eq!(sizer.size(&input).unwrap().quantity, dec!(0.0004));
        // b = 2: 0.4 capped to 0.25, halved, of 200
        input.win_loss_ratio = Some(dec!(2));
        assert_eq!(sizer.size(&input).unwrap().quantity, dec!(0.0005));
    }

    #[test]
    fn test_volatility() {
        assert_eq!(volatility(&[dec!(100)]), None);
        assert_eq!(volatility(&[dec!(100), dec!(101), dec!(100)]).map(|v| v.round_dp(4)), Some(dec!(0.0100)));
    }
}
