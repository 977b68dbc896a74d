//! Price-change detector: decides whether a newly computed final price is a
//! recordable transition versus the stored record, and builds the history
//! entry if so. Pure; the store applies the result transactionally.

use crate::models::{PriceHistoryEntry, PriceRecord, round_money};
use chrono::NaiveDateTime;
use rust_decimal::Decimal;

/// Sub-threshold fluctuations (|Δ| ≤ threshold) are treated as unchanged so
/// rounding jitter never pollutes the history table.
pub fn detect_change(
    previous: Option<&PriceRecord>,
    new_final_price: Decimal,
    threshold: Decimal,
    now: NaiveDateTime,
) -> Option<PriceHistoryEntry> {
    let prev = previous?;

    let delta = round_money(new_final_price - prev.final_price);
    if delta.abs() <= threshold {
        return None;
    }

    let change_percentage = if prev.final_price.is_zero() {
        None
    } else {
        Some(round_money(delta / prev.final_price * Decimal::ONE_HUNDRED))
    };

    Some(PriceHistoryEntry {
        spirit_id: prev.spirit_id,
        region_code: prev.region_code.clone(),
        retailer_id: prev.retailer_id,
        old_price: prev.final_price,
        new_price: new_final_price,
        change: delta,
        change_percentage,
        reason: classify_change(change_percentage).to_string(),
        recorded_at: now,
    })
}

/// Magnitude label recorded with each history entry.
pub fn classify_change(change_percentage: Option<Decimal>) -> &'static str {
    let Some(pct) = change_percentage else {
        // Old price was zero; the change is unbounded and flagged separately.
        return "baseline";
    };
    let magnitude = pct.abs();
    let five = Decimal::from(5);
    if magnitude < Decimal::ONE {
        "minor"
    } else if pct > Decimal::ZERO {
        if magnitude >= five { "major_hike" } else { "hike" }
    } else if magnitude >= five {
        "major_drop"
    } else {
        "drop"
    }
}
