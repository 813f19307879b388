//! Fixed-point money helpers.
//!
//! Prices and amounts carry exactly two fractional digits; arithmetic stays
//! in `rust_decimal::Decimal`, never binary floating-point.

use rust_decimal::{Decimal, RoundingStrategy};

/// Fractional digits carried by every price and amount.
pub const MONEY_SCALE: u32 = 2;

/// Round to the money scale, half away from zero.
pub fn round_money(value: Decimal) -> Decimal {
    value.round_dp_with_strategy(MONEY_SCALE, RoundingStrategy::MidpointAwayFromZero)
}

/// Whether a client-supplied amount is acceptable: strictly positive and no
/// finer than the money scale.
pub fn is_valid_amount(value: Decimal) -> bool {
    value > Decimal::ZERO && value == round_money(value)
}

/// Round `value` to the nearest multiple of `step`, never below one step.
pub fn round_to_step(value: Decimal, step: Decimal) -> Decimal {
    if step <= Decimal::ZERO {
        return value;
    }
    let multiples =
        (value / step).round_dp_with_strategy(0, RoundingStrategy::MidpointAwayFromZero);
    round_money((multiples * step).max(step))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_round_money() {
        assert_eq!(round_money(dec!(3.456)), dec!(3.46));
        assert_eq!(round_money(dec!(3.455)), dec!(3.46));
        assert_eq!(round_money(dec!(3.4)), dec!(3.40));
    }

    #[test]
    fn test_is_valid_amount() {
        assert!(is_valid_amount(dec!(0.01)));
        assert!(is_valid_amount(dec!(115)));
        assert!(!is_valid_amount(dec!(0)));
        assert!(!is_valid_amount(dec!(-5.00)));
        assert!(!is_valid_amount(dec!(1.001)));
    }

    #[test]
    fn test_round_to_step() {
        assert_eq!(round_to_step(dec!(3.5), dec!(1)), dec!(4.00));
        assert_eq!(round_to_step(dec!(7.3), dec!(5)), dec!(5.00));
        assert_eq!(round_to_step(dec!(7.5), dec!(5)), dec!(10.00));
        assert_eq!(round_to_step(dec!(12), dec!(25)), dec!(25.00));
        assert_eq!(round_to_step(dec!(0.2), dec!(1)), dec!(1.00));
        assert_eq!(round_to_step(dec!(480), dec!(50)), dec!(500.00));
    }
}
