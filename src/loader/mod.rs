//! Bulk import: a JSON reference catalog (regions, retailers, spirits) and a
//! CSV feed of manually collected price observations. Both are contracts
//! with outside collaborators, so malformed rows are skipped with a warning
//! rather than failing the whole file.

use crate::models::{
    AvailabilityStatus, PriceObservation, RawObservationRow, Region, Retailer, Spirit, round_money,
};
use anyhow::{Context, Result};
use chrono::{NaiveDateTime, Utc};
use rust_decimal::Decimal;
use serde::Deserialize;
use std::io::Read;
use std::path::Path;
use std::str::FromStr;
use tracing::{info, warn};

/// Reference data as maintained by the catalog collaborator.
#[derive(Debug, Deserialize)]
pub struct Catalog {
    #[serde(default)]
    pub regions: Vec<Region>,
    #[serde(default)]
    pub retailers: Vec<Retailer>,
    #[serde(default)]
    pub spirits: Vec<Spirit>,
}

pub fn load_catalog(path: &Path) -> Result<Catalog> {
    let json = std::fs::read_to_string(path)
        .with_context(|| format!("Reading catalog {:?}", path))?;
    let catalog: Catalog =
        serde_json::from_str(&json).with_context(|| format!("Parsing catalog {:?}", path))?;
    info!(
        "Catalog {:?}: {} regions, {} retailers, {} spirits",
        path,
        catalog.regions.len(),
        catalog.retailers.len(),
        catalog.spirits.len()
    );
    Ok(catalog)
}

/// Parse an observation CSV:
/// spirit_id, retailer_id, region_code, base_price, delivery_charges,
/// minimum_order_amount, mrp_price, availability
pub fn load_observations_csv(path: &Path) -> Result<Vec<PriceObservation>> {
    let file = std::fs::File::open(path)
        .with_context(|| format!("Opening observations {:?}", path))?;
    let observations = parse_observations(file)?;
    info!("{:?}: {} observations loaded", path, observations.len());
    Ok(observations)
}

pub fn parse_observations<R: Read>(input: R) -> Result<Vec<PriceObservation>> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .from_reader(input);

    let now = Utc::now().naive_utc();
    let mut observations = Vec::new();

    for (i, result) in reader.records().enumerate() {
        let record = match result {
            Ok(r) => r,
            Err(e) => {
                warn!("Row {}: {}", i + 1, e);
                continue;
            }
        };

        let raw = RawObservationRow {
            spirit_id: record.get(0).map(|s| s.to_string()),
            retailer_id: record.get(1).map(|s| s.to_string()),
            region_code: record.get(2).map(|s| s.to_string()),
            base_price: record.get(3).map(|s| s.to_string()),
            delivery_charges: record.get(4).map(|s| s.to_string()),
            minimum_order_amount: record.get(5).map(|s| s.to_string()),
            mrp_price: record.get(6).map(|s| s.to_string()),
            availability: record.get(7).map(|s| s.to_string()),
        };

        match csv_row_to_observation(&raw, now) {
            Some(obs) => observations.push(obs),
            None => warn!("Row {}: unusable, skipped", i + 1),
        }
    }

    Ok(observations)
}

/// One row → one observation. Required fields must parse; the monetary
/// extras default to zero and a missing availability is `Unknown`.
pub fn csv_row_to_observation(
    raw: &RawObservationRow,
    now: NaiveDateTime,
) -> Option<PriceObservation> {
    let spirit_id: i64 = raw.spirit_id.as_deref()?.trim().parse().ok()?;
    let retailer_id: i64 = raw.retailer_id.as_deref()?.trim().parse().ok()?;
    let region_code = raw.region_code.as_deref()?.trim().to_uppercase();
    if region_code.is_empty() {
        return None;
    }
    let base_price = parse_decimal(raw.base_price.as_deref()?)?;

    let delivery_charges = raw
        .delivery_charges
        .as_deref()
        .and_then(parse_decimal)
        .unwrap_or(Decimal::ZERO);
    let minimum_order_amount = raw
        .minimum_order_amount
        .as_deref()
        .and_then(parse_decimal)
        .unwrap_or(Decimal::ZERO);
    let mrp_price = raw.mrp_price.as_deref().and_then(parse_decimal);
    let availability = raw
        .availability
        .as_deref()
        .and_then(|s| AvailabilityStatus::from_str(s).ok())
        .unwrap_or(AvailabilityStatus::Unknown);

    Some(PriceObservation {
        spirit_id,
        retailer_id,
        region_code,
        base_price,
        delivery_charges,
        minimum_order_amount,
        mrp_price,
        availability,
        observed_at: now,
    })
}

fn parse_decimal(s: &str) -> Option<Decimal> {
    let cleaned = s.trim().replace([',', '₹'], "");
    if cleaned.is_empty() {
        return None;
    }
    Decimal::from_str(&cleaned).ok().map(round_money)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_parse_observations_skips_bad_rows() {
        let csv = "\
spirit_id,retailer_id,region_code,base_price,delivery_charges,minimum_order_amount,mrp_price,availability
1,1,DL,500.00,40.00,500.00,1000.00,available
2,1,dl,768,,,,
x,1,DL,500.00,,,,
3,1,,500.00,,,,
4,1,MH,not-a-price,,,,
";
        let observations = parse_observations(csv.as_bytes()).unwrap();
        assert_eq!(observations.len(), 2);

        let first = &observations[0];
        assert_eq!(first.spirit_id, 1);
        assert_eq!(first.base_price, dec!(500.00));
        assert_eq!(first.mrp_price, Some(dec!(1000.00)));
        assert_eq!(first.availability, AvailabilityStatus::Available);

        // Region codes normalize to uppercase; blanks default.
        let second = &observations[1];
        assert_eq!(second.region_code, "DL");
        assert_eq!(second.delivery_charges, dec!(0));
        assert_eq!(second.availability, AvailabilityStatus::Unknown);
    }

    #[test]
    fn test_parse_decimal_strips_formatting() {
        assert_eq!(parse_decimal("₹1,249.00"), Some(dec!(1249.00)));
        assert_eq!(parse_decimal("  665 "), Some(dec!(665)));
        assert_eq!(parse_decimal("n/a"), None);
    }

    #[test]
    fn test_catalog_parses_minimal_json() {
        let json = r#"{
            "regions": [{
                "id": 1, "name": "Delhi", "code": "DL",
                "excise_tax_rate": "0.20", "sales_tax_rate": "0.05",
                "is_dry": false, "online_delivery_allowed": true,
                "home_delivery_allowed": true, "max_quantity_per_person": 2
            }],
            "spirits": [{
                "id": 1, "name": "Amrut Fusion", "brand": "Amrut",
                "spirit_type": "whisky", "manufacturer": "Amrut Distilleries",
                "bottle_size_ml": 750, "mrp": "1000.00",
                "is_local_brand": true, "available_regions": ["DL"]
            }]
        }"#;
        let catalog: Catalog = serde_json::from_str(json).unwrap();
        assert_eq!(catalog.regions[0].excise_tax_rate, dec!(0.20));
        assert_eq!(catalog.spirits[0].mrp, dec!(1000.00));
        assert!(catalog.retailers.is_empty());
        assert!(catalog.spirits[0].flavors.is_empty());
    }
}
