//! Pricing transform
//!
//! Single source of truth for money semantics. The vendor network quotes in
//! minor currency units (pence); users see marked-up prices in pounds. Every
//! place that touches price (quote display, booking fare, payment commission,
//! settlement aggregation) goes through this module so rounding can never
//! diverge between call sites.

use rust_decimal::prelude::*;
use rust_decimal::RoundingStrategy;
use serde::{Deserialize, Serialize};

/// An amount in minor currency units (pence). All interior pricing code
/// carries this tagged type; raw `f64` values only exist at the outermost
/// vendor/input boundary.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Pence(pub i64);

impl Pence {
    /// Convert to pounds as a 2dp decimal.
    pub fn to_pounds(self) -> Decimal {
        (Decimal::from(self.0) / Decimal::from(100)).round_dp(2)
    }
}

impl std::fmt::Display for Pence {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}p", self.0)
    }
}

/// Markup/commission rates, parsed once from configuration.
#[derive(Debug, Clone, Copy)]
pub struct PricingConfig {
    pub markup_rate: Decimal,
    pub commission_rate: Decimal,
}

impl Default for PricingConfig {
    fn default() -> Self {
        Self {
            markup_rate: Decimal::new(25, 2),     // 0.25
            commission_rate: Decimal::new(20, 2), // 0.20
        }
    }
}

impl PricingConfig {
    pub fn new(markup_rate: f64, commission_rate: f64) -> Self {
        let default = Self::default();
        Self {
            markup_rate: Decimal::from_f64(markup_rate).unwrap_or(default.markup_rate),
            commission_rate: Decimal::from_f64(commission_rate).unwrap_or(default.commission_rate),
        }
    }
}

/// Commission/vendor split of a final fare. Invariant:
/// `commission_amount + vendor_amount == final_fare` exactly to 2dp.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommissionSplit {
    pub commission_amount: Decimal,
    pub vendor_amount: Decimal,
}

/// Normalize an ambiguously-unitted amount to pence.
///
/// Integral values >= 1000 are treated as already being pence; everything
/// else is treated as pounds and multiplied by 100 (rounded to the nearest
/// integer). The boundary at 1000 is load-bearing input compatibility:
/// `1550` -> 1550p, `15.50` -> 1550p, `999` -> 99900p.
pub fn normalize_to_minor_units(value: f64) -> Pence {
    if value >= 1000.0 && value.fract() == 0.0 {
        Pence(value as i64)
    } else {
        Pence((value * 100.0).round() as i64)
    }
}

/// Apply the platform markup to a vendor-quoted price. Returns the display
/// price in pounds, rounded half-up to 2dp.
pub fn apply_markup(vendor_price: Pence, markup_rate: Decimal) -> Decimal {
    let marked_up = Decimal::from(vendor_price.0) * (Decimal::ONE + markup_rate);
    (marked_up / Decimal::from(100))
        .round_dp_with_strategy(2, RoundingStrategy::MidpointAwayFromZero)
}

/// Split a final charged fare (pounds) into platform commission and vendor
/// payout. The commission is rounded first and the vendor amount computed by
/// subtraction, so the two always sum back to the fare exactly.
pub fn split_commission(final_fare: Decimal, commission_rate: Decimal) -> CommissionSplit {
    let commission_amount = (final_fare * commission_rate)
        .round_dp_with_strategy(2, RoundingStrategy::MidpointAwayFromZero);
    let vendor_amount = final_fare - commission_amount;
    CommissionSplit {
        commission_amount,
        vendor_amount,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rates() -> PricingConfig {
        PricingConfig::default()
    }

    #[test]
    fn normalize_treats_large_integral_values_as_pence() {
        assert_eq!(normalize_to_minor_units(1550.0), Pence(1550));
        assert_eq!(normalize_to_minor_units(2300.0), Pence(2300));
        assert_eq!(normalize_to_minor_units(1000.0), Pence(1000));
    }

    #[test]
    fn normalize_treats_decimals_and_small_values_as_pounds() {
        assert_eq!(normalize_to_minor_units(15.50), Pence(1550));
        // 999 is below the integral-pence boundary, so it is pounds
        assert_eq!(normalize_to_minor_units(999.0), Pence(99900));
        assert_eq!(normalize_to_minor_units(0.99), Pence(99));
        // decimals above the boundary are still pounds
        assert_eq!(normalize_to_minor_units(1000.5), Pence(100050));
    }

    #[test]
    fn markup_matches_display_price_rule() {
        // 2300p * 1.25 = 2875p = GBP 28.75
        let display = apply_markup(Pence(2300), rates().markup_rate);
        assert_eq!(display, Decimal::new(2875, 2));
    }

    #[test]
    fn markup_rounds_half_up_to_two_decimals() {
        // 1111p * 1.25 = 1388.75p -> GBP 13.89
        let display = apply_markup(Pence(1111), rates().markup_rate);
        assert_eq!(display, Decimal::new(1389, 2));
    }

    #[test]
    fn commission_split_is_exact() {
        let fare = Decimal::new(2875, 2); // GBP 28.75
        let split = split_commission(fare, rates().commission_rate);
        assert_eq!(split.commission_amount, Decimal::new(575, 2));
        assert_eq!(split.vendor_amount, Decimal::new(2300, 2));
        assert_eq!(split.commission_amount + split.vendor_amount, fare);
    }

    #[test]
    fn commission_split_sums_exactly_for_awkward_fares() {
        // Fares whose 20% does not land on a clean 2dp value
        for pennies in [1, 3, 7, 99, 101, 12345, 99999] {
            let fare = Pence(pennies).to_pounds();
            let split = split_commission(fare, rates().commission_rate);
            assert_eq!(
                split.commission_amount + split.vendor_amount,
                fare,
                "split must be exact for {fare}"
            );
        }
    }

    #[test]
    fn pence_to_pounds() {
        assert_eq!(Pence(2300).to_pounds(), Decimal::new(2300, 2));
        assert_eq!(Pence(99).to_pounds(), Decimal::new(99, 2));
    }
}
