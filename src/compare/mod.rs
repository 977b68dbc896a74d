//! Comparison engine: cross-retailer quotes for a spirit in a region, plus
//! budget-driven recommendations. Read-only over the store, with a small
//! read-through TTL cache so repeated lookups during a pipeline run do not
//! hammer DuckDB.

use crate::config::{CacheConfig, RecommendConfig};
use crate::error::{CoreError, Result};
use crate::models::{AvailabilityStatus, PriceRecord, Spirit, SpiritType, round_money};
use crate::storage::Repository;
use chrono::{NaiveDateTime, Utc};
use rust_decimal::Decimal;
use rust_decimal::prelude::{FromPrimitive, ToPrimitive};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

// ── Result types ──────────────────────────────────────────────────────────────

/// One retailer's current offer, fully priced for the region.
#[derive(Debug, Clone, Serialize)]
pub struct RetailerQuote {
    pub retailer_id: i64,
    pub retailer_name: String,
    pub base_price: Decimal,
    pub tax_amount: Decimal,
    pub delivery_charges: Decimal,
    pub final_price: Decimal,
    pub discount_percentage: Decimal,
    pub minimum_order_amount: Decimal,
    pub availability: AvailabilityStatus,
    pub observed_at: NaiveDateTime,
}

/// Aggregates over the quote list. Absent when there are no quotes, so
/// "no data yet" stays distinguishable from "not available here".
#[derive(Debug, Clone, Serialize)]
pub struct ComparisonSummary {
    pub lowest_price: Decimal,
    pub highest_price: Decimal,
    pub average_price: Decimal,
    pub price_range: Decimal,
    pub retailer_count: usize,
    pub average_discount: Decimal,
}

#[derive(Debug, Clone, Serialize)]
pub struct Comparison {
    pub spirit_id: i64,
    pub spirit_name: String,
    pub region_code: String,
    /// Cheapest first; equal prices break toward the fresher observation.
    pub quotes: Vec<RetailerQuote>,
    pub summary: Option<ComparisonSummary>,
    pub generated_at: NaiveDateTime,
}

#[derive(Debug, Clone, Default)]
pub struct RecommendFilters {
    pub spirit_type: Option<SpiritType>,
    pub flavors: Vec<String>,
    pub local_only: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct Recommendation {
    pub spirit: Spirit,
    pub retailer_id: i64,
    pub retailer_name: String,
    pub best_price: Decimal,
    pub score: f64,
}

// ── Engine ────────────────────────────────────────────────────────────────────

pub struct ComparisonEngine {
    repo: Arc<Repository>,
    recommend: RecommendConfig,
    cache_ttl: Duration,
    cache: Mutex<HashMap<(i64, String), CacheEntry>>,
}

struct CacheEntry {
    stored_at: Instant,
    comparison: Comparison,
}

impl ComparisonEngine {
    pub fn new(repo: Arc<Repository>, recommend: RecommendConfig, cache: CacheConfig) -> Self {
        Self {
            repo,
            recommend,
            cache_ttl: Duration::from_secs(cache.ttl_secs),
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// Compare all current retailer prices for a spirit in a region.
    ///
    /// A dry region or a spirit not legally sold there fails with
    /// `RegionIneligible`; a valid pair with no observations yet succeeds
    /// with an empty quote list. A failing store falls back to the most
    /// recent cached comparison even past its TTL.
    pub fn compare(&self, spirit_id: i64, region_code: &str) -> Result<Comparison> {
        let key = (spirit_id, region_code.to_string());
        if let Some(cached) = self.cache_get(&key, false) {
            debug!("Comparison cache hit for spirit {spirit_id} in {region_code}");
            return Ok(cached);
        }

        match self.build_comparison(spirit_id, region_code) {
            Ok(comparison) => {
                self.cache_put(key, comparison.clone());
                Ok(comparison)
            }
            Err(e @ (CoreError::Storage(_) | CoreError::Degraded(_))) => {
                if let Some(stale) = self.cache_get(&key, true) {
                    warn!("Store unavailable, serving stale comparison: {e}");
                    return Ok(stale);
                }
                Err(CoreError::Degraded(e.to_string()))
            }
            Err(e) => Err(e),
        }
    }

    fn build_comparison(&self, spirit_id: i64, region_code: &str) -> Result<Comparison> {
        let spirit = self.repo.get_spirit(spirit_id)?;
        let region = self.repo.get_region(region_code)?;
        if region.is_dry {
            return Err(CoreError::ineligible(&region.code, "alcohol sale prohibited"));
        }
        if !spirit.available_in(region_code) {
            return Err(CoreError::ineligible(
                region_code,
                format!("{} is not sold there", spirit.name),
            ));
        }

        let records = self.repo.current_prices(spirit_id, region_code)?;
        let mut quotes = Vec::with_capacity(records.len());
        for record in &records {
            quotes.push(self.quote_from(record)?);
        }

        Ok(Comparison {
            spirit_id,
            spirit_name: spirit.name,
            region_code: region_code.to_string(),
            summary: summarize(&quotes),
            quotes,
            generated_at: Utc::now().naive_utc(),
        })
    }

    fn quote_from(&self, record: &PriceRecord) -> Result<RetailerQuote> {
        let retailer = self.repo.get_retailer(record.retailer_id)?;
        Ok(RetailerQuote {
            retailer_id: retailer.id,
            retailer_name: retailer.name,
            base_price: record.base_price,
            tax_amount: record.tax_amount,
            delivery_charges: record.delivery_charges,
            final_price: record.final_price,
            discount_percentage: record.discount_percentage,
            minimum_order_amount: record.minimum_order_amount,
            availability: record.availability,
            observed_at: record.observed_at,
        })
    }

    fn cache_get(&self, key: &(i64, String), allow_stale: bool) -> Option<Comparison> {
        let cache = self.cache.lock().ok()?;
        let entry = cache.get(key)?;
        if allow_stale || entry.stored_at.elapsed() < self.cache_ttl {
            Some(entry.comparison.clone())
        } else {
            None
        }
    }

    fn cache_put(&self, key: (i64, String), comparison: Comparison) {
        if let Ok(mut cache) = self.cache.lock() {
            cache.insert(
                key,
                CacheEntry {
                    stored_at: Instant::now(),
                    comparison,
                },
            );
        }
    }

    // ── Recommendation ────────────────────────────────────────────────────────

    /// Rank spirits in a region for a budget. Candidates must have a current
    /// cheapest price inside `[floor_ratio·budget, budget]`, both ends
    /// inclusive. Scoring is a fixed weighted sum of budget fit and flavor
    /// overlap; equal inputs over equal data always produce the same list.
    pub fn recommend(
        &self,
        region_code: &str,
        budget: Decimal,
        filters: &RecommendFilters,
    ) -> Result<Vec<Recommendation>> {
        if budget <= Decimal::ZERO {
            return Err(CoreError::InvalidInput(format!(
                "budget must be positive, got {budget}"
            )));
        }
        let region = self.repo.get_region(region_code)?;
        if region.is_dry {
            return Err(CoreError::ineligible(&region.code, "alcohol sale prohibited"));
        }

        let floor_ratio = Decimal::from_f64(self.recommend.budget_floor_ratio)
            .filter(|r| *r >= Decimal::ZERO && *r < Decimal::ONE)
            .ok_or_else(|| {
                CoreError::InvalidInput(format!(
                    "budget floor ratio out of range: {}",
                    self.recommend.budget_floor_ratio
                ))
            })?;
        let floor = round_money(budget * floor_ratio);

        let mut recs = Vec::new();
        for (spirit_id, best_price) in self.repo.cheapest_by_spirit(region_code)? {
            if best_price < floor || best_price > budget {
                continue;
            }
            let spirit = self.repo.get_spirit(spirit_id)?;
            if !spirit.available_in(region_code) {
                continue;
            }
            if let Some(wanted) = filters.spirit_type {
                if spirit.spirit_type != wanted {
                    continue;
                }
            }
            if filters.local_only && !spirit.is_local_brand {
                continue;
            }

            // The cheapest record carries the retailer for this quote.
            let records = self.repo.current_prices(spirit_id, region_code)?;
            let Some(best) = records.first() else { continue };
            let retailer = self.repo.get_retailer(best.retailer_id)?;

            let score = self.score(best_price, budget, floor, &spirit, &filters.flavors);
            recs.push(Recommendation {
                spirit,
                retailer_id: retailer.id,
                retailer_name: retailer.name,
                best_price,
                score,
            });
        }

        recs.sort_by(|a, b| {
            b.score
                .total_cmp(&a.score)
                .then(a.best_price.cmp(&b.best_price))
                .then(a.spirit.id.cmp(&b.spirit.id))
        });
        recs.truncate(self.recommend.max_results);
        Ok(recs)
    }

    /// Budget fit peaks at the middle of the window and falls off linearly
    /// toward either end; flavor fit is the fraction of requested flavors the
    /// spirit carries. Both land in [0, 1] before weighting.
    fn score(
        &self,
        price: Decimal,
        budget: Decimal,
        floor: Decimal,
        spirit: &Spirit,
        wanted_flavors: &[String],
    ) -> f64 {
        let price = price.to_f64().unwrap_or(0.0);
        let budget = budget.to_f64().unwrap_or(1.0);
        let floor = floor.to_f64().unwrap_or(0.0);

        let midpoint = (floor + budget) / 2.0;
        let half_width = (budget - floor) / 2.0;
        let budget_fit = if half_width > 0.0 {
            (1.0 - (price - midpoint).abs() / half_width).clamp(0.0, 1.0)
        } else {
            1.0
        };

        let flavor_fit = if wanted_flavors.is_empty() {
            0.0
        } else {
            let matched = wanted_flavors
                .iter()
                .filter(|w| spirit.flavors.iter().any(|f| f.eq_ignore_ascii_case(w)))
                .count();
            matched as f64 / wanted_flavors.len() as f64
        };

        self.recommend.budget_weight * budget_fit + self.recommend.flavor_weight * flavor_fit
    }
}

fn summarize(quotes: &[RetailerQuote]) -> Option<ComparisonSummary> {
    let first = quotes.first()?;
    let mut lowest = first.final_price;
    let mut highest = first.final_price;
    let mut price_sum = Decimal::ZERO;
    let mut discount_sum = Decimal::ZERO;
    for q in quotes {
        lowest = lowest.min(q.final_price);
        highest = highest.max(q.final_price);
        price_sum += q.final_price;
        discount_sum += q.discount_percentage;
    }
    let n = Decimal::from(quotes.len());
    Some(ComparisonSummary {
        lowest_price: lowest,
        highest_price: highest,
        average_price: round_money(price_sum / n),
        price_range: highest - lowest,
        retailer_count: quotes.len(),
        average_discount: round_money(discount_sum / n),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::tests::{observation, retailer, seed_reference, spirit, test_repo};
    use rust_decimal_macros::dec;

    fn engine(repo: Arc<Repository>) -> ComparisonEngine {
        ComparisonEngine::new(
            repo,
            RecommendConfig {
                budget_weight: 0.6,
                flavor_weight: 0.4,
                budget_floor_ratio: 0.25,
                max_results: 5,
            },
            CacheConfig { ttl_secs: 600 },
        )
    }

    fn seeded_engine() -> (Arc<Repository>, ComparisonEngine) {
        let repo = Arc::new(test_repo());
        seed_reference(&repo);
        let engine = engine(Arc::clone(&repo));
        (repo, engine)
    }

    #[test]
    fn test_compare_orders_cheapest_first() {
        let (repo, engine) = seeded_engine();
        repo.upsert_retailers(&[retailer(3, "Wine Park", &["DL"])]).unwrap();
        repo.upsert_price(&observation(1, 1, "DL", dec!(600.00))).unwrap();
        repo.upsert_price(&observation(1, 3, "DL", dec!(500.00))).unwrap();

        let cmp = engine.compare(1, "DL").unwrap();
        assert_eq!(cmp.quotes.len(), 2);
        assert_eq!(cmp.quotes[0].retailer_name, "Wine Park");
        assert!(cmp.quotes[0].final_price <= cmp.quotes[1].final_price);

        let summary = cmp.summary.unwrap();
        assert_eq!(summary.retailer_count, 2);
        assert_eq!(summary.lowest_price, cmp.quotes[0].final_price);
        assert_eq!(summary.highest_price, cmp.quotes[1].final_price);
        assert_eq!(summary.price_range, summary.highest_price - summary.lowest_price);
        assert_eq!(
            summary.average_price,
            round_money((summary.lowest_price + summary.highest_price) / dec!(2))
        );
    }

    #[test]
    fn test_compare_empty_vs_not_available() {
        let (_repo, engine) = seeded_engine();

        // Valid pair, no observations: empty comparison, no summary.
        let cmp = engine.compare(1, "DL").unwrap();
        assert!(cmp.quotes.is_empty());
        assert!(cmp.summary.is_none());

        // Dry region: ineligible, not empty.
        assert!(matches!(
            engine.compare(1, "GJ"),
            Err(CoreError::RegionIneligible { .. })
        ));
        // Spirit 2 is only sold in DL.
        assert!(matches!(
            engine.compare(2, "MH"),
            Err(CoreError::RegionIneligible { .. })
        ));
        // Unknown spirit.
        assert!(matches!(
            engine.compare(99, "DL"),
            Err(CoreError::NotFound { .. })
        ));
    }

    #[test]
    fn test_compare_serves_cached_result() {
        let (repo, engine) = seeded_engine();
        repo.upsert_price(&observation(1, 1, "DL", dec!(500.00))).unwrap();

        let first = engine.compare(1, "DL").unwrap();
        // A later write is invisible until the TTL lapses.
        repo.upsert_price(&observation(1, 1, "DL", dec!(600.00))).unwrap();
        let second = engine.compare(1, "DL").unwrap();
        assert_eq!(first.quotes[0].final_price, second.quotes[0].final_price);
    }

    #[test]
    fn test_store_failure_serves_stale_cache() {
        let repo = Arc::new(test_repo());
        seed_reference(&repo);
        repo.upsert_price(&observation(1, 1, "DL", dec!(500.00))).unwrap();

        // Zero TTL: every hit is stale and forces a rebuild.
        let engine = ComparisonEngine::new(
            Arc::clone(&repo),
            RecommendConfig::default(),
            CacheConfig { ttl_secs: 0 },
        );
        let first = engine.compare(1, "DL").unwrap();

        repo.execute_batch_raw("DROP TABLE prices").unwrap();

        // The rebuild now fails; the expired cache entry answers instead.
        let fallback = engine.compare(1, "DL").unwrap();
        assert_eq!(fallback.quotes.len(), 1);
        assert_eq!(fallback.quotes[0].final_price, first.quotes[0].final_price);

        // With nothing cached the failure surfaces as Degraded.
        let cold = ComparisonEngine::new(
            Arc::clone(&repo),
            RecommendConfig::default(),
            CacheConfig { ttl_secs: 0 },
        );
        assert!(matches!(cold.compare(1, "DL"), Err(CoreError::Degraded(_))));
    }

    #[test]
    fn test_recommend_budget_window_is_inclusive() {
        let (repo, engine) = seeded_engine();
        // Finals in DL (25% tax + 40 delivery): 290, 665, 1000 and 2540.
        repo.upsert_spirits(&[
            spirit(3, "Old Monk", dec!(400.00), &["DL"]),
            spirit(4, "Indri Trini", dec!(4000.00), &["DL"]),
        ])
        .unwrap();
        repo.upsert_price(&observation(3, 1, "DL", dec!(200.00))).unwrap(); // 290
        repo.upsert_price(&observation(1, 1, "DL", dec!(500.00))).unwrap(); // 665
        repo.upsert_price(&observation(2, 1, "DL", dec!(768.00))).unwrap(); // 1000
        repo.upsert_price(&observation(4, 1, "DL", dec!(2000.00))).unwrap(); // 2540

        // Budget 1000 → window [250, 1000]: the 1000 quote is in (inclusive
        // top), 290 is in (above the 250 floor), 2540 is out.
        let recs = engine.recommend("DL", dec!(1000.00), &RecommendFilters::default()).unwrap();
        let ids: Vec<i64> = recs.iter().map(|r| r.spirit.id).collect();
        assert!(ids.contains(&1));
        assert!(ids.contains(&2));
        assert!(ids.contains(&3));
        assert!(!ids.contains(&4));

        // Budget 1160 → floor is exactly 290: inclusive bottom keeps it.
        let recs = engine.recommend("DL", dec!(1160.00), &RecommendFilters::default()).unwrap();
        assert!(recs.iter().any(|r| r.spirit.id == 3));
    }

    #[test]
    fn test_recommend_is_deterministic() {
        let (repo, engine) = seeded_engine();
        repo.upsert_price(&observation(1, 1, "DL", dec!(500.00))).unwrap();
        repo.upsert_price(&observation(2, 1, "DL", dec!(700.00))).unwrap();

        let filters = RecommendFilters {
            flavors: vec!["smoky".to_string()],
            ..Default::default()
        };
        let a = engine.recommend("DL", dec!(1000.00), &filters).unwrap();
        let b = engine.recommend("DL", dec!(1000.00), &filters).unwrap();
        let ids = |v: &[Recommendation]| v.iter().map(|r| (r.spirit.id, r.score.to_bits())).collect::<Vec<_>>();
        assert_eq!(ids(&a), ids(&b));
        assert!(!a.is_empty());
    }

    #[test]
    fn test_recommend_flavor_overlap_breaks_price_ties() {
        let (repo, engine) = seeded_engine();
        // Two spirits at the same price; only one carries the wanted flavor.
        let mut plain = spirit(5, "Blenders Pride", dec!(1000.00), &["DL"]);
        plain.flavors = vec!["sweet".to_string()];
        repo.upsert_spirits(&[plain]).unwrap();
        repo.upsert_price(&observation(1, 1, "DL", dec!(500.00))).unwrap();
        repo.upsert_price(&observation(5, 1, "DL", dec!(500.00))).unwrap();

        let filters = RecommendFilters {
            flavors: vec!["smoky".to_string()],
            ..Default::default()
        };
        let recs = engine.recommend("DL", dec!(1000.00), &filters).unwrap();
        assert_eq!(recs[0].spirit.id, 1);
        assert!(recs[0].score > recs[1].score);
    }

    #[test]
    fn test_recommend_rejects_bad_input() {
        let (_repo, engine) = seeded_engine();
        assert!(matches!(
            engine.recommend("DL", dec!(0), &RecommendFilters::default()),
            Err(CoreError::InvalidInput(_))
        ));
        assert!(matches!(
            engine.recommend("GJ", dec!(1000), &RecommendFilters::default()),
            Err(CoreError::RegionIneligible { .. })
        ));
    }

    #[test]
    fn test_recommend_type_filter() {
        let (repo, engine) = seeded_engine();
        repo.upsert_price(&observation(1, 1, "DL", dec!(500.00))).unwrap();

        let filters = RecommendFilters {
            spirit_type: Some(SpiritType::Vodka),
            ..Default::default()
        };
        assert!(engine.recommend("DL", dec!(1000), &filters).unwrap().is_empty());
    }
}
