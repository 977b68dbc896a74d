//! Price calculator: raw observed price → tax- and fee-inclusive final price.
//!
//! Pure functions, no store access. All monetary math is decimal; rounding
//! happens once, half-up to 2 decimals, at the end of a computation
//! (`models::round_money`), so repeated recomputation never drifts.

pub mod change;

use crate::error::{CoreError, Result};
use crate::models::{PriceBreakdown, Region, round_money};
use rust_decimal::Decimal;

/// Compute the final price of `base_price` in `region`, including excise tax,
/// sales tax and delivery charges.
///
/// `final = base + base·excise + base·sales + delivery`. The tax amount is
/// rounded first so the identity `final = base + tax + delivery` holds
/// exactly on the returned breakdown.
pub fn compute_final_price(
    base_price: Decimal,
    region: &Region,
    delivery_charges: Decimal,
) -> Result<PriceBreakdown> {
    if base_price <= Decimal::ZERO {
        return Err(CoreError::InvalidInput(format!(
            "base price must be positive, got {base_price}"
        )));
    }
    if delivery_charges < Decimal::ZERO {
        return Err(CoreError::InvalidInput(format!(
            "delivery charges must be non-negative, got {delivery_charges}"
        )));
    }
    if region.is_dry {
        return Err(CoreError::ineligible(&region.code, "alcohol sale prohibited"));
    }

    let base_price = round_money(base_price);
    let delivery_charges = round_money(delivery_charges);

    let tax_amount =
        round_money(base_price * (region.excise_tax_rate + region.sales_tax_rate));
    let final_price = base_price + tax_amount + delivery_charges;

    Ok(PriceBreakdown {
        base_price,
        tax_amount,
        delivery_charges,
        final_price,
    })
}

/// Discount relative to MRP, as a percentage in [0, 100].
/// Returns zero when MRP is unset/non-positive or the price exceeds MRP.
pub fn compute_discount_percentage(base_price: Decimal, mrp: Decimal) -> Decimal {
    if mrp <= Decimal::ZERO {
        return Decimal::ZERO;
    }
    let pct = (mrp - base_price) / mrp * Decimal::ONE_HUNDRED;
    round_money(pct.max(Decimal::ZERO))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn region(code: &str, excise: Decimal, sales: Decimal, dry: bool) -> Region {
        Region {
            id: 1,
            name: code.to_string(),
            code: code.to_string(),
            excise_tax_rate: excise,
            sales_tax_rate: sales,
            is_dry: dry,
            online_delivery_allowed: !dry,
            home_delivery_allowed: !dry,
            max_quantity_per_person: if dry { 0 } else { 2 },
        }
    }

    #[test]
    fn test_delhi_worked_example() {
        // DL: 20% excise, 5% sales; 500 base + 40 delivery → 125 tax, 665 final.
        let dl = region("DL", dec!(0.20), dec!(0.05), false);
        let b = compute_final_price(dec!(500.00), &dl, dec!(40.00)).unwrap();
        assert_eq!(b.tax_amount, dec!(125.00));
        assert_eq!(b.final_price, dec!(665.00));
        assert_eq!(b.base_price + b.tax_amount + b.delivery_charges, b.final_price);
    }

    #[test]
    fn test_tax_identity_holds_after_rounding() {
        let mh = region("MH", dec!(0.15), dec!(0.06), false);
        // 333.33 * 0.21 = 69.9993 → tax rounds to 70.00
        let b = compute_final_price(dec!(333.33), &mh, dec!(0)).unwrap();
        assert_eq!(b.tax_amount, dec!(70.00));
        assert_eq!(b.base_price + b.tax_amount + b.delivery_charges, b.final_price);
    }

    #[test]
    fn test_dry_region_rejected_for_any_price() {
        let gj = region("GJ", dec!(0), dec!(0), true);
        for base in [dec!(0.01), dec!(500), dec!(99999.99)] {
            let err = compute_final_price(base, &gj, dec!(0)).unwrap_err();
            assert!(matches!(err, CoreError::RegionIneligible { .. }));
        }
    }

    #[test]
    fn test_non_positive_base_rejected() {
        let dl = region("DL", dec!(0.20), dec!(0.05), false);
        assert!(matches!(
            compute_final_price(dec!(0), &dl, dec!(0)),
            Err(CoreError::InvalidInput(_))
        ));
        assert!(matches!(
            compute_final_price(dec!(-10), &dl, dec!(0)),
            Err(CoreError::InvalidInput(_))
        ));
    }

    #[test]
    fn test_negative_delivery_rejected() {
        let dl = region("DL", dec!(0.20), dec!(0.05), false);
        assert!(matches!(
            compute_final_price(dec!(100), &dl, dec!(-1)),
            Err(CoreError::InvalidInput(_))
        ));
    }

    #[test]
    fn test_discount_percentage() {
        assert_eq!(compute_discount_percentage(dec!(750), dec!(1000)), dec!(25.00));
        // Price above MRP clamps to zero, never negative.
        assert_eq!(compute_discount_percentage(dec!(1200), dec!(1000)), dec!(0));
        // Unset MRP.
        assert_eq!(compute_discount_percentage(dec!(500), dec!(0)), dec!(0));
    }
}
