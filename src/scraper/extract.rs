//! Text extraction helpers for retailer product pages. Retailers render
//! prices as "₹1,249.00", "Rs. 1249" or "MRP ₹1,499"; availability is a
//! free-text badge.

use crate::models::{AvailabilityStatus, round_money};
use rust_decimal::Decimal;
use scraper::{Html, Selector};
use std::str::FromStr;

/// Pull a monetary amount out of arbitrary page text. Everything but digits
/// and the decimal point is stripped before parsing, so currency symbols,
/// thousands separators and surrounding labels all fall away.
pub fn parse_price(text: &str) -> Option<Decimal> {
    let cleaned: String = text
        .chars()
        .filter(|c| c.is_ascii_digit() || *c == '.')
        .collect();
    if cleaned.is_empty() {
        return None;
    }
    let value = Decimal::from_str(&cleaned).ok()?;
    if value <= Decimal::ZERO {
        return None;
    }
    Some(round_money(value))
}

/// Map an availability badge to a status. Unrecognized text is `Unknown`,
/// never an error; a missing badge is the caller's concern.
pub fn parse_availability(text: &str) -> AvailabilityStatus {
    let lower = text.trim().to_lowercase();
    if lower.contains("out of stock") || lower.contains("sold out") || lower.contains("unavailable")
    {
        AvailabilityStatus::OutOfStock
    } else if lower.contains("pre-order") || lower.contains("pre order") || lower.contains("coming soon")
    {
        AvailabilityStatus::PreOrder
    } else if lower.contains("in stock")
        || lower.contains("available")
        || lower.contains("add to cart")
        || lower.contains("buy now")
    {
        AvailabilityStatus::Available
    } else {
        AvailabilityStatus::Unknown
    }
}

/// First match of a CSS selector in the document, as trimmed inner text.
pub fn select_text(document: &Html, selector: &str) -> Option<String> {
    let selector = Selector::parse(selector).ok()?;
    let element = document.select(&selector).next()?;
    let text: String = element.text().collect::<Vec<_>>().join(" ");
    let trimmed = text.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_parse_price_formats() {
        assert_eq!(parse_price("₹1,249.00"), Some(dec!(1249.00)));
        assert_eq!(parse_price("Rs. 1249"), Some(dec!(1249.00)));
        assert_eq!(parse_price("MRP ₹1,499"), Some(dec!(1499.00)));
        assert_eq!(parse_price("  665.5 "), Some(dec!(665.50)));
    }

    #[test]
    fn test_parse_price_rejects_junk() {
        assert_eq!(parse_price(""), None);
        assert_eq!(parse_price("Call for price"), None);
        assert_eq!(parse_price("₹0.00"), None);
        assert_eq!(parse_price("1.2.3.4"), None);
    }

    #[test]
    fn test_parse_availability() {
        assert_eq!(parse_availability("In Stock"), AvailabilityStatus::Available);
        assert_eq!(parse_availability("ADD TO CART"), AvailabilityStatus::Available);
        assert_eq!(parse_availability("Sold Out!"), AvailabilityStatus::OutOfStock);
        assert_eq!(
            parse_availability("Currently unavailable"),
            AvailabilityStatus::OutOfStock
        );
        assert_eq!(parse_availability("Pre-Order now"), AvailabilityStatus::PreOrder);
        assert_eq!(parse_availability("weird badge"), AvailabilityStatus::Unknown);
    }

    #[test]
    fn test_select_text() {
        let html = Html::parse_document(
            r#"<div><span class="price">₹ 665.00</span><span class="stock">In Stock</span></div>"#,
        );
        assert_eq!(select_text(&html, ".price"), Some("₹ 665.00".to_string()));
        assert_eq!(select_text(&html, ".missing"), None);
        assert_eq!(select_text(&html, "p !!"), None);
    }
}
