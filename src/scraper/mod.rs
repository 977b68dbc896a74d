//! Retailer price ingestion. Each retailer row carries its own CSS selector
//! set; `SelectorScraper` drives a polite HTTP client through them and turns
//! product pages into raw observations for the pricing core.

pub mod extract;
pub mod http_client;

use crate::config::ScraperConfig;
use crate::models::{AvailabilityStatus, PriceObservation, Retailer, ScrapeTargets, Spirit};
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use http_client::HttpClient;
use scraper::Html;
use tracing::{debug, warn};

/// Source of raw price observations for one (retailer, spirit, region).
/// `Ok(None)` means the retailer had nothing usable (no listing, no price);
/// errors are transport-level and count against the retailer's success rate.
#[async_trait]
pub trait RetailerPriceSource: Send + Sync {
    async fn observe(
        &self,
        retailer: &Retailer,
        spirit: &Spirit,
        region_code: &str,
    ) -> Result<Option<PriceObservation>>;
}

pub struct SelectorScraper {
    http: HttpClient,
}

impl SelectorScraper {
    pub fn new(config: &ScraperConfig) -> Result<Self> {
        Ok(Self {
            http: HttpClient::new(config)?,
        })
    }

    fn search_url(targets: &ScrapeTargets, spirit: &Spirit) -> String {
        let query: String =
            url::form_urlencoded::byte_serialize(spirit.name.as_bytes()).collect();
        format!(
            "{}{}{}",
            targets.base_url.trim_end_matches('/'),
            targets.search_path,
            query
        )
    }
}

/// Selector-driven extraction, separated from the fetch so it stays testable
/// without a network.
fn parse_product_page(
    html: &str,
    targets: &ScrapeTargets,
    retailer: &Retailer,
    spirit: &Spirit,
    region_code: &str,
) -> Option<PriceObservation> {
    let document = Html::parse_document(html);

    let price_text = extract::select_text(&document, &targets.price_selector)?;
    let base_price = extract::parse_price(&price_text)?;

    let availability = extract::select_text(&document, &targets.availability_selector)
        .map(|t| extract::parse_availability(&t))
        .unwrap_or(AvailabilityStatus::Unknown);

    let mrp_price = targets
        .mrp_selector
        .as_deref()
        .and_then(|sel| extract::select_text(&document, sel))
        .and_then(|t| extract::parse_price(&t));

    let delivery_charges = targets
        .delivery_selector
        .as_deref()
        .and_then(|sel| extract::select_text(&document, sel))
        .and_then(|t| extract::parse_price(&t))
        .unwrap_or(retailer.default_delivery_charge);

    let minimum_order_amount = targets
        .minimum_order_selector
        .as_deref()
        .and_then(|sel| extract::select_text(&document, sel))
        .and_then(|t| extract::parse_price(&t))
        .unwrap_or(retailer.default_minimum_order);

    Some(PriceObservation {
        spirit_id: spirit.id,
        retailer_id: retailer.id,
        region_code: region_code.to_string(),
        base_price,
        delivery_charges,
        minimum_order_amount,
        mrp_price,
        availability,
        observed_at: Utc::now().naive_utc(),
    })
}

#[async_trait]
impl RetailerPriceSource for SelectorScraper {
    async fn observe(
        &self,
        retailer: &Retailer,
        spirit: &Spirit,
        region_code: &str,
    ) -> Result<Option<PriceObservation>> {
        let Some(targets) = &retailer.scrape_targets else {
            warn!("Retailer {} has no scrape targets, skipping", retailer.name);
            return Ok(None);
        };

        let url = Self::search_url(targets, spirit);
        debug!("Scraping {} for '{}'", retailer.name, spirit.name);

        let html = self
            .http
            .get_text(&url)
            .await
            .with_context(|| format!("Fetching {} from {}", spirit.name, retailer.name))?;

        let observation = parse_product_page(&html, targets, retailer, spirit, region_code);
        if observation.is_none() {
            debug!(
                "No usable price for '{}' on {} ({})",
                spirit.name, retailer.name, url
            );
        }
        Ok(observation)
    }
}
