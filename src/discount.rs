// =============================================================================
// DISCOUNT MODULE
// =============================================================================
// The discount curve: a pure, deterministic mapping from a drop's
// accumulated committed value to its discount percentage.
//
// The curve is linear interpolation of fill = current_value/target_value
// (clamped to [0, 1]) into [min_discount, max_discount]. Any monotonic
// non-decreasing curve would satisfy the ledger's contract; linear is
// the policy shipped here. The ratchet itself (never decrease once
// raised) is enforced at the database with GREATEST, not here.
// =============================================================================

use rust_decimal::Decimal;

/// Discount percentage for a drop at the given accumulated value.
///
/// A non-positive `target_value` degenerates to the maximum discount
/// being unreachable by fill, so the minimum is returned; drop creation
/// validates target_value > 0 and this is only a guard.
pub fn discount_for(
    current_value: Decimal,
    target_value: Decimal,
    min_discount: Decimal,
    max_discount: Decimal,
) -> Decimal {
    if target_value <= Decimal::ZERO {
        return min_discount;
    }

    let fill = (current_value / target_value)
        .clamp(Decimal::ZERO, Decimal::ONE);

    let discount = min_discount + fill * (max_discount - min_discount);

    // Percentages are reported and stored with two decimal places
    discount.round_dp(2)
}

/// Final price of a captured reservation: original × (1 − discount/100),
/// rounded to cents. The result can never exceed the original price
/// (the authorized amount) while the discount is within [0, 100].
pub fn final_price(original_price: Decimal, discount_percentage: Decimal) -> Decimal {
    let factor = Decimal::ONE - discount_percentage / Decimal::from(100);
    (original_price * factor).round_dp(2)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn linear_curve_matches_reference_scenario() {
        // target 1000, band 10-30%: value 400 -> 18%, value 1000 -> 30%
        assert_eq!(
            discount_for(dec!(400), dec!(1000), dec!(10), dec!(30)),
            dec!(18.00)
        );
        assert_eq!(
            discount_for(dec!(1000), dec!(1000), dec!(10), dec!(30)),
            dec!(30.00)
        );
    }

    #[test]
    fn curve_is_clamped_to_band() {
        // Empty drop sits at the minimum
        assert_eq!(
            discount_for(dec!(0), dec!(1000), dec!(10), dec!(30)),
            dec!(10.00)
        );
        // Overshooting the target never exceeds the maximum
        assert_eq!(
            discount_for(dec!(2500), dec!(1000), dec!(10), dec!(30)),
            dec!(30.00)
        );
    }

    #[test]
    fn curve_is_monotonic_non_decreasing() {
        let mut last = Decimal::ZERO;
        for value in (0..=2000).step_by(50) {
            let d = discount_for(
                Decimal::from(value),
                dec!(1000),
                dec!(10),
                dec!(30),
            );
            assert!(d >= last, "discount decreased at value {}", value);
            last = d;
        }
    }

    #[test]
    fn zero_target_degenerates_to_minimum() {
        assert_eq!(
            discount_for(dec!(500), dec!(0), dec!(10), dec!(30)),
            dec!(10)
        );
    }

    #[test]
    fn final_price_matches_reference_scenario() {
        // At 30%: 400 -> 280.00, 600 -> 420.00
        assert_eq!(final_price(dec!(400), dec!(30)), dec!(280.00));
        assert_eq!(final_price(dec!(600), dec!(30)), dec!(420.00));
    }

    #[test]
    fn final_price_never_exceeds_original() {
        for discount in [dec!(0), dec!(10), dec!(18.25), dec!(30), dec!(100)] {
            let fp = final_price(dec!(149.99), discount);
            assert!(fp <= dec!(149.99));
        }
    }
}
