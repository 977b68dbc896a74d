use chrono::NaiveDateTime;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

// ── Money helpers ─────────────────────────────────────────────────────────────

/// The single rounding rule for monetary values: half-up, 2 decimals.
/// Applied at the end of a computation, never in the middle.
pub fn round_money(value: Decimal) -> Decimal {
    value.round_dp_with_strategy(2, RoundingStrategy::MidpointAwayFromZero)
}

/// Convert a rounded monetary value to integer minor units (paise).
/// Returns `None` only for values outside the i64 range.
pub fn to_minor_units(value: Decimal) -> Option<i64> {
    (round_money(value) * Decimal::ONE_HUNDRED).to_i64()
}

pub fn from_minor_units(minor: i64) -> Decimal {
    Decimal::new(minor, 2)
}

/// Percentages are persisted as hundredths of a percent (e.g. 5.26% → 526).
pub fn to_pct_centis(pct: Decimal) -> Option<i64> {
    (pct.round_dp_with_strategy(2, RoundingStrategy::MidpointAwayFromZero)
        * Decimal::ONE_HUNDRED)
        .to_i64()
}

pub fn from_pct_centis(centis: i64) -> Decimal {
    Decimal::new(centis, 2)
}

/// Tax rates are persisted as basis points (0.0550 → 550).
pub fn to_rate_bp(rate: Decimal) -> Option<i64> {
    (rate * Decimal::from(10_000)).to_i64()
}

pub fn from_rate_bp(bp: i64) -> Decimal {
    Decimal::new(bp, 4)
}

// ── Region ────────────────────────────────────────────────────────────────────

/// A taxing jurisdiction (modeled on Indian states). Seeded once by the
/// reference-data collaborator; read-only to the pricing core.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Region {
    pub id: i64,
    pub name: String,
    pub code: String, // two-letter, unique
    pub excise_tax_rate: Decimal,
    pub sales_tax_rate: Decimal,
    pub is_dry: bool,
    pub online_delivery_allowed: bool,
    pub home_delivery_allowed: bool,
    pub max_quantity_per_person: u32,
}

// ── Retailer ──────────────────────────────────────────────────────────────────

/// CSS selectors for a retailer's product page. Opaque to the pricing core;
/// only the scraper interprets it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ScrapeTargets {
    pub base_url: String,
    #[serde(default = "default_search_path")]
    pub search_path: String,
    pub price_selector: String,
    pub availability_selector: String,
    #[serde(default)]
    pub mrp_selector: Option<String>,
    #[serde(default)]
    pub delivery_selector: Option<String>,
    #[serde(default)]
    pub minimum_order_selector: Option<String>,
}

fn default_search_path() -> String {
    "/search?q=".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Retailer {
    pub id: i64,
    pub name: String,
    pub operating_regions: Vec<String>, // region codes
    #[serde(default)]
    pub scrape_targets: Option<ScrapeTargets>,
    pub delivery_available: bool,
    pub default_delivery_charge: Decimal,
    pub default_minimum_order: Decimal,
    /// Rolling scrape success rate, 0–100. Owned by the pipeline.
    #[serde(default = "default_success_rate")]
    pub success_rate: f64,
    #[serde(default)]
    pub last_scraped_at: Option<NaiveDateTime>,
    #[serde(default = "default_is_active")]
    pub is_active: bool,
}

fn default_success_rate() -> f64 {
    100.0
}

fn default_is_active() -> bool {
    true
}

impl Retailer {
    pub fn operates_in(&self, region_code: &str) -> bool {
        self.operating_regions.iter().any(|c| c == region_code)
    }
}

// ── Spirit ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SpiritType {
    Whisky,
    Vodka,
    Rum,
    Gin,
    Brandy,
    Tequila,
    Beer,
    Wine,
    Liqueur,
}

impl SpiritType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Whisky => "whisky",
            Self::Vodka => "vodka",
            Self::Rum => "rum",
            Self::Gin => "gin",
            Self::Brandy => "brandy",
            Self::Tequila => "tequila",
            Self::Beer => "beer",
            Self::Wine => "wine",
            Self::Liqueur => "liqueur",
        }
    }
}

impl FromStr for SpiritType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "whisky" | "whiskey" => Ok(Self::Whisky),
            "vodka" => Ok(Self::Vodka),
            "rum" => Ok(Self::Rum),
            "gin" => Ok(Self::Gin),
            "brandy" => Ok(Self::Brandy),
            "tequila" => Ok(Self::Tequila),
            "beer" => Ok(Self::Beer),
            "wine" => Ok(Self::Wine),
            "liqueur" => Ok(Self::Liqueur),
            other => Err(format!("unknown spirit type: {other}")),
        }
    }
}

impl fmt::Display for SpiritType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A sellable item. MRP is the master-catalog reference price and the
/// authoritative baseline for discount computation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Spirit {
    pub id: i64,
    pub name: String,
    pub brand: String,
    pub spirit_type: SpiritType,
    pub manufacturer: String,
    pub bottle_size_ml: u32,
    pub mrp: Decimal,
    pub is_local_brand: bool,
    pub available_regions: Vec<String>, // region codes where legally sellable
    #[serde(default)]
    pub flavors: Vec<String>,
}

impl Spirit {
    pub fn available_in(&self, region_code: &str) -> bool {
        self.available_regions.iter().any(|c| c == region_code)
    }
}

// ── Price observation & record ────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AvailabilityStatus {
    Available,
    OutOfStock,
    PreOrder,
    Unknown,
}

impl AvailabilityStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Available => "available",
            Self::OutOfStock => "out_of_stock",
            Self::PreOrder => "pre_order",
            Self::Unknown => "unknown",
        }
    }
}

impl FromStr for AvailabilityStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "available" => Ok(Self::Available),
            "out_of_stock" => Ok(Self::OutOfStock),
            "pre_order" => Ok(Self::PreOrder),
            "unknown" | "" => Ok(Self::Unknown),
            other => Err(format!("unknown availability status: {other}")),
        }
    }
}

/// One raw observation from the ingestion collaborator (scraper or manual
/// feed) before pricing. Prices here are pre-tax.
#[derive(Debug, Clone, PartialEq)]
pub struct PriceObservation {
    pub spirit_id: i64,
    pub retailer_id: i64,
    pub region_code: String,
    pub base_price: Decimal,
    pub delivery_charges: Decimal,
    pub minimum_order_amount: Decimal,
    /// Retailer-reported MRP, stored for audit only; the master-catalog MRP
    /// drives discount computation.
    pub mrp_price: Option<Decimal>,
    pub availability: AvailabilityStatus,
    pub observed_at: NaiveDateTime,
}

/// Output of the price calculator. `final_price` always equals
/// `base_price + tax_amount + delivery_charges` exactly.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PriceBreakdown {
    pub base_price: Decimal,
    pub tax_amount: Decimal,
    pub delivery_charges: Decimal,
    pub final_price: Decimal,
}

/// The current price for one (spirit, region, retailer) triple. Exactly one
/// row exists per triple; updates overwrite in place.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PriceRecord {
    pub spirit_id: i64,
    pub region_code: String,
    pub retailer_id: i64,
    pub base_price: Decimal,
    pub tax_amount: Decimal,
    pub final_price: Decimal,
    pub mrp_price: Option<Decimal>,
    pub discount_percentage: Decimal,
    pub availability: AvailabilityStatus,
    pub delivery_charges: Decimal,
    pub minimum_order_amount: Decimal,
    pub observed_at: NaiveDateTime,
}

/// Immutable audit record of one price transition exceeding the minimum
/// change threshold.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PriceHistoryEntry {
    pub spirit_id: i64,
    pub region_code: String,
    pub retailer_id: i64,
    pub old_price: Decimal,
    pub new_price: Decimal,
    pub change: Decimal,
    /// `None` when the old price was zero (unbounded change).
    pub change_percentage: Option<Decimal>,
    pub reason: String,
    pub recorded_at: NaiveDateTime,
}

// ── Raw CSV rows (manual observation feed) ────────────────────────────────────

#[derive(Debug, Clone, Default)]
pub struct RawObservationRow {
    pub spirit_id: Option<String>,
    pub retailer_id: Option<String>,
    pub region_code: Option<String>,
    pub base_price: Option<String>,
    pub delivery_charges: Option<String>,
    pub minimum_order_amount: Option<String>,
    pub mrp_price: Option<String>,
    pub availability: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_round_money_half_up() {
        assert_eq!(round_money(dec!(1.005)), dec!(1.01));
        assert_eq!(round_money(dec!(1.004)), dec!(1.00));
        assert_eq!(round_money(dec!(-1.005)), dec!(-1.01));
    }

    #[test]
    fn test_minor_units_round_trip() {
        assert_eq!(to_minor_units(dec!(665.00)), Some(66500));
        assert_eq!(from_minor_units(66500), dec!(665.00));
        assert_eq!(to_minor_units(dec!(0.01)), Some(1));
    }

    #[test]
    fn test_rate_bp_round_trip() {
        assert_eq!(to_rate_bp(dec!(0.0550)), Some(550));
        assert_eq!(from_rate_bp(2000), dec!(0.2000));
    }

    #[test]
    fn test_spirit_type_parse() {
        assert_eq!("Whiskey".parse::<SpiritType>(), Ok(SpiritType::Whisky));
        assert!("mead".parse::<SpiritType>().is_err());
    }

    #[test]
    fn test_availability_parse() {
        assert_eq!(
            "out_of_stock".parse::<AvailabilityStatus>(),
            Ok(AvailabilityStatus::OutOfStock)
        );
        assert_eq!("".parse::<AvailabilityStatus>(), Ok(AvailabilityStatus::Unknown));
    }
}
