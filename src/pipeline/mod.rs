//! Ingestion orchestrator: ties scraper → pricing → storage together.
//!
//! One run walks every active retailer, every region it operates in, and
//! every catalog spirit whose price there is missing or older than the
//! freshness window. Each fetch is bounded by a timeout and the whole run is
//! throttled by a semaphore; a fetch that fails or times out never touches
//! the store. Re-running within the freshness window is a no-op.

use crate::config::AppConfig;
use crate::error::CoreError;
use crate::models::{Retailer, Spirit};
use crate::scraper::{RetailerPriceSource, SelectorScraper};
use crate::storage::Repository;
use anyhow::{Context, Result};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::time::timeout;
use tracing::{error, info, warn};

pub struct Pipeline {
    config: AppConfig,
}

#[derive(Debug)]
pub struct PipelineStats {
    pub retailers_processed: usize,
    pub observations: usize,
    pub changes_recorded: usize,
    pub skipped: usize,
    pub errors: usize,
}

impl Pipeline {
    pub fn new(config: AppConfig) -> Self {
        Self { config }
    }

    pub async fn run(&self) -> Result<PipelineStats> {
        let repo = Arc::new(
            Repository::open(&self.config.storage.db_path, self.config.pricing.clone())
                .context("Failed to open DuckDB")?,
        );

        if self.config.storage.run_migrations {
            repo.run_migrations()?;
        }

        let source: Arc<dyn RetailerPriceSource> = Arc::new(
            SelectorScraper::new(&self.config.scraper).context("Failed to build scraper")?,
        );

        self.run_with(repo, source).await
    }

    pub async fn run_with(
        &self,
        repo: Arc<Repository>,
        source: Arc<dyn RetailerPriceSource>,
    ) -> Result<PipelineStats> {
        let run_id = repo.begin_ingest_run().unwrap_or(0);

        // ── 1. Work list: stale (retailer, region, spirit) triples ────────────
        let work = match self.plan_work(&repo) {
            Ok(work) => work,
            Err(e) => {
                // Close the run log so the run never dangles as "running".
                let msg = format!("planning failed: {e:#}");
                repo.finish_ingest_run(run_id, 0, 0, 1, Some(&msg)).ok();
                return Err(e);
            }
        };

        // ── 2. Fetch + price + store, bounded ─────────────────────────────────
        let sem = Arc::new(Semaphore::new(self.config.pipeline.concurrency));
        let fetch_timeout = Duration::from_secs(self.config.pipeline.fetch_timeout_secs);
        let mut handles = Vec::new();

        for (retailer, region_code, spirit) in work {
            let label = format!("{} / {} / {}", retailer.name, region_code, spirit.name);
            let retailer_id = retailer.id;
            let source = Arc::clone(&source);
            let repo = Arc::clone(&repo);
            let sem = Arc::clone(&sem);

            let handle = tokio::spawn(async move {
                let _permit = sem.acquire().await?;

                let fetched = timeout(
                    fetch_timeout,
                    source.observe(&retailer, &spirit, &region_code),
                )
                .await
                .map_err(|_| anyhow::anyhow!("fetch timed out after {:?}", fetch_timeout))?
                .with_context(|| format!("observe({})", spirit.name))?;

                let Some(observation) = fetched else {
                    return Ok::<Option<bool>, anyhow::Error>(None);
                };

                let outcome = repo
                    .upsert_price(&observation)
                    .with_context(|| format!("upsert_price({})", spirit.name))?;

                if let Some(entry) = &outcome.history {
                    info!(
                        "{}: {} → {} ({})",
                        spirit.name, entry.old_price, entry.new_price, entry.reason
                    );
                }
                Ok(Some(outcome.history.is_some()))
            });

            handles.push((retailer_id, label, handle));
        }

        let mut observations = 0usize;
        let mut changes = 0usize;
        let mut skipped = 0usize;
        let mut errors = 0usize;
        // (attempts, successes) per retailer, for the rolling success rate.
        let mut per_retailer: HashMap<i64, (u32, u32)> = HashMap::new();

        for (retailer_id, label, handle) in handles {
            let tally = per_retailer.entry(retailer_id).or_insert((0, 0));
            tally.0 += 1;
            match handle.await {
                Ok(Ok(Some(changed))) => {
                    tally.1 += 1;
                    observations += 1;
                    if changed {
                        changes += 1;
                    }
                }
                Ok(Ok(None)) => {
                    tally.1 += 1;
                    skipped += 1;
                }
                Ok(Err(e)) => {
                    // An ineligible or invalid observation is this listing's
                    // problem, not the retailer's connectivity.
                    if e.downcast_ref::<CoreError>().is_some() {
                        tally.1 += 1;
                    }
                    warn!("{}: {:#}", label, e);
                    errors += 1;
                }
                Err(e) => {
                    error!("Task panic for {}: {}", label, e);
                    errors += 1;
                }
            }
        }

        // ── 3. Retailer bookkeeping + run log ─────────────────────────────────
        for (retailer_id, (attempts, successes)) in &per_retailer {
            if *attempts == 0 {
                continue;
            }
            let rate = f64::from(*successes) / f64::from(*attempts) * 100.0;
            if let Err(e) = repo.record_scrape_result(*retailer_id, rate) {
                warn!("Could not update retailer {}: {}", retailer_id, e);
            }
        }

        let stats = PipelineStats {
            retailers_processed: per_retailer.len(),
            observations,
            changes_recorded: changes,
            skipped,
            errors,
        };

        let err_msg = (errors > 0).then(|| format!("{} errors", errors));
        repo.finish_ingest_run(run_id, observations, changes, errors, err_msg.as_deref())
            .ok();

        info!(
            "=== Done: {} retailers | {} observations | {} changes | {} skipped | {} errors ===",
            stats.retailers_processed,
            stats.observations,
            stats.changes_recorded,
            stats.skipped,
            stats.errors,
        );

        Ok(stats)
    }

    fn plan_work(&self, repo: &Repository) -> Result<Vec<(Retailer, String, Spirit)>> {
        let retailers = repo.list_active_retailers()?;
        info!("=== Step 1: Planning work for {} retailers ===", retailers.len());

        let mut work: Vec<(Retailer, String, Spirit)> = Vec::new();
        for retailer in &retailers {
            for code in &retailer.operating_regions {
                let region = match repo.get_region(code) {
                    Ok(r) => r,
                    Err(e) => {
                        warn!("{}: unknown region {}: {}", retailer.name, code, e);
                        continue;
                    }
                };
                if region.is_dry {
                    continue;
                }
                let stale = repo.stale_spirits(
                    retailer.id,
                    code,
                    self.config.pipeline.freshness_hours,
                    self.config.pipeline.batch_limit,
                )?;
                for spirit in stale {
                    work.push((retailer.clone(), code.clone(), spirit));
                }
            }
        }
        info!("{} stale listings to refresh", work.len());
        Ok(work)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{AvailabilityStatus, PriceObservation};
    use crate::storage::tests::{seed_reference, test_repo};
    use chrono::Utc;
    use rust_decimal::Decimal;
    use rust_decimal_macros::dec;

    struct FixedSource {
        base_price: Decimal,
    }

    #[async_trait::async_trait]
    impl RetailerPriceSource for FixedSource {
        async fn observe(
            &self,
            retailer: &Retailer,
            spirit: &Spirit,
            region_code: &str,
        ) -> Result<Option<PriceObservation>> {
            Ok(Some(PriceObservation {
                spirit_id: spirit.id,
                retailer_id: retailer.id,
                region_code: region_code.to_string(),
                base_price: self.base_price,
                delivery_charges: retailer.default_delivery_charge,
                minimum_order_amount: retailer.default_minimum_order,
                mrp_price: None,
                availability: AvailabilityStatus::Available,
                observed_at: Utc::now().naive_utc(),
            }))
        }
    }

    struct FailingSource;

    #[async_trait::async_trait]
    impl RetailerPriceSource for FailingSource {
        async fn observe(
            &self,
            _retailer: &Retailer,
            _spirit: &Spirit,
            _region_code: &str,
        ) -> Result<Option<PriceObservation>> {
            anyhow::bail!("connection reset")
        }
    }

    fn pipeline() -> Pipeline {
        Pipeline::new(AppConfig::default())
    }

    #[tokio::test]
    async fn test_run_fills_store_and_is_idempotent() {
        let repo = Arc::new(test_repo());
        seed_reference(&repo);
        let source: Arc<dyn RetailerPriceSource> = Arc::new(FixedSource {
            base_price: dec!(500.00),
        });

        // Eligible listings: BigBasket DL (spirits 1+2), BigBasket MH
        // (spirit 1), Living Liquidz MH (spirit 1).
        let stats = pipeline().run_with(Arc::clone(&repo), Arc::clone(&source)).await.unwrap();
        assert_eq!(stats.observations, 4);
        assert_eq!(stats.changes_recorded, 0);
        assert_eq!(stats.errors, 0);
        assert_eq!(repo.price_count().unwrap(), 4);

        // Everything is fresh now: the second run plans no work.
        let stats = pipeline().run_with(Arc::clone(&repo), source).await.unwrap();
        assert_eq!(stats.observations, 0);
        assert_eq!(repo.price_count().unwrap(), 4);

        let bb = repo.get_retailer(1).unwrap();
        assert_eq!(bb.success_rate, 100.0);
        assert!(bb.last_scraped_at.is_some());
    }

    #[tokio::test]
    async fn test_failed_planning_closes_run_log() {
        let repo = Arc::new(test_repo());
        seed_reference(&repo);
        repo.execute_batch_raw("DROP TABLE spirits").unwrap();
        let source: Arc<dyn RetailerPriceSource> = Arc::new(FailingSource);

        let result = pipeline().run_with(Arc::clone(&repo), source).await;
        assert!(result.is_err());
        // The run log row is closed out, not left dangling as "running".
        assert_eq!(repo.ingest_run_status(1).unwrap(), "error");
    }

    #[tokio::test]
    async fn test_failed_fetches_count_as_errors() {
        let repo = Arc::new(test_repo());
        seed_reference(&repo);
        let source: Arc<dyn RetailerPriceSource> = Arc::new(FailingSource);

        let stats = pipeline().run_with(Arc::clone(&repo), source).await.unwrap();
        assert_eq!(stats.observations, 0);
        assert_eq!(stats.errors, 4);
        assert_eq!(repo.price_count().unwrap(), 0);

        let bb = repo.get_retailer(1).unwrap();
        assert_eq!(bb.success_rate, 0.0);
    }
}
