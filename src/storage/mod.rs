use crate::config::PricingConfig;
use crate::error::{CoreError, Result};
use crate::models::{
    AvailabilityStatus, PriceHistoryEntry, PriceObservation, PriceRecord, Region, Retailer,
    ScrapeTargets, Spirit, SpiritType, from_minor_units, from_pct_centis, from_rate_bp,
    round_money, to_minor_units, to_pct_centis, to_rate_bp,
};
use crate::pricing::{self, change};
use chrono::{Duration, NaiveDateTime, Utc};
use duckdb::{Connection, params};
use rust_decimal::Decimal;
use std::path::Path;
use std::str::FromStr;
use std::sync::Mutex;
use tracing::{info, warn};

// ── Schema ────────────────────────────────────────────────────────────────────
//
// Monetary columns are BIGINT minor units (paise); tax rates are basis
// points; percentages are hundredths of a percent. DuckDB round-trips are
// therefore exact and the decimal rounding rule lives in one place.

const DDL: &str = r#"
CREATE TABLE IF NOT EXISTS regions (
    id                      BIGINT  PRIMARY KEY,
    name                    VARCHAR NOT NULL,
    code                    VARCHAR UNIQUE NOT NULL,
    excise_rate_bp          BIGINT  NOT NULL,
    sales_rate_bp           BIGINT  NOT NULL,
    is_dry                  BOOLEAN NOT NULL,
    online_delivery_allowed BOOLEAN NOT NULL,
    home_delivery_allowed   BOOLEAN NOT NULL,
    max_quantity_per_person INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS retailers (
    id                          BIGINT  PRIMARY KEY,
    name                        VARCHAR UNIQUE NOT NULL,
    operating_regions           VARCHAR NOT NULL,
    scrape_targets              VARCHAR,
    delivery_available          BOOLEAN NOT NULL,
    default_delivery_minor      BIGINT  NOT NULL DEFAULT 0,
    default_minimum_order_minor BIGINT  NOT NULL DEFAULT 0,
    success_rate                DOUBLE  NOT NULL DEFAULT 100.0,
    last_scraped_at             TIMESTAMP,
    is_active                   BOOLEAN NOT NULL DEFAULT true
);

CREATE TABLE IF NOT EXISTS spirits (
    id                BIGINT  PRIMARY KEY,
    name              VARCHAR UNIQUE NOT NULL,
    brand             VARCHAR NOT NULL,
    spirit_type       VARCHAR NOT NULL,
    manufacturer      VARCHAR NOT NULL,
    bottle_size_ml    INTEGER NOT NULL,
    mrp_minor         BIGINT  NOT NULL,
    is_local_brand    BOOLEAN NOT NULL,
    available_regions VARCHAR NOT NULL,
    flavors           VARCHAR NOT NULL DEFAULT ''
);

CREATE TABLE IF NOT EXISTS prices (
    spirit_id            BIGINT  NOT NULL,
    region_code          VARCHAR NOT NULL,
    retailer_id          BIGINT  NOT NULL,
    base_price_minor     BIGINT  NOT NULL,
    tax_amount_minor     BIGINT  NOT NULL,
    final_price_minor    BIGINT  NOT NULL,
    mrp_price_minor      BIGINT,
    discount_pct_centis  BIGINT  NOT NULL DEFAULT 0,
    availability         VARCHAR NOT NULL,
    delivery_minor       BIGINT  NOT NULL DEFAULT 0,
    minimum_order_minor  BIGINT  NOT NULL DEFAULT 0,
    observed_at          TIMESTAMP NOT NULL,
    PRIMARY KEY (spirit_id, region_code, retailer_id)
);

CREATE TABLE IF NOT EXISTS price_history (
    spirit_id        BIGINT  NOT NULL,
    region_code      VARCHAR NOT NULL,
    retailer_id      BIGINT  NOT NULL,
    old_price_minor  BIGINT  NOT NULL,
    new_price_minor  BIGINT  NOT NULL,
    change_minor     BIGINT  NOT NULL,
    change_pct_centis BIGINT,
    reason           VARCHAR NOT NULL,
    recorded_at      TIMESTAMP NOT NULL
);

CREATE TABLE IF NOT EXISTS ingest_runs (
    id                  BIGINT PRIMARY KEY,
    started_at          TIMESTAMP NOT NULL,
    finished_at         TIMESTAMP,
    status              VARCHAR NOT NULL DEFAULT 'running',
    observations        INTEGER DEFAULT 0,
    changes_recorded    INTEGER DEFAULT 0,
    errors              INTEGER DEFAULT 0,
    error_msg           VARCHAR
);

CREATE TABLE IF NOT EXISTS schema_version (
    version     INTEGER PRIMARY KEY,
    applied_at  TIMESTAMP NOT NULL
);
"#;

const INDEXES: &str = r#"
CREATE INDEX IF NOT EXISTS idx_prices_region   ON prices (region_code);
CREATE INDEX IF NOT EXISTS idx_prices_spirit   ON prices (spirit_id);
CREATE INDEX IF NOT EXISTS idx_history_triple  ON price_history (spirit_id, region_code, retailer_id);
CREATE INDEX IF NOT EXISTS idx_history_time    ON price_history (recorded_at);
"#;

// ── Repository ────────────────────────────────────────────────────────────────

/// Durable store for current prices and their history. The connection sits
/// behind a mutex so concurrent `upsert_price` calls on the same triple are
/// serialized and history entries stay strictly ordered; there is exactly
/// one writer at a time per process.
pub struct Repository {
    conn: Mutex<Connection>,
    pricing: PricingConfig,
}

/// Outcome of a single upsert: the record as written, plus the history entry
/// when the change cleared the threshold.
#[derive(Debug)]
pub struct UpsertOutcome {
    pub record: PriceRecord,
    pub history: Option<PriceHistoryEntry>,
}

/// Aggregates over one (spirit, region) history window. Increases and
/// decreases are reported separately; a window with only drops has a zero
/// `largest_increase`, not a negative one.
#[derive(Debug, PartialEq)]
pub struct HistorySummary {
    pub changes: usize,
    pub net_change: Decimal,
    pub average_change: Decimal,
    pub largest_increase: Decimal,
    pub largest_decrease: Decimal,
}

impl Repository {
    pub fn open(path: &Path, pricing: PricingConfig) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| CoreError::Degraded(format!("could not create dir {parent:?}: {e}")))?;
        }
        let conn = Connection::open(path)?;
        Ok(Self {
            conn: Mutex::new(conn),
            pricing,
        })
    }

    pub fn open_in_memory(pricing: PricingConfig) -> Result<Self> {
        Ok(Self {
            conn: Mutex::new(Connection::open_in_memory()?),
            pricing,
        })
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| CoreError::Degraded("connection lock poisoned".to_string()))
    }

    pub fn run_migrations(&self) -> Result<()> {
        info!("Running migrations…");
        let conn = self.lock()?;
        conn.execute_batch(DDL)?;
        conn.execute_batch(INDEXES)?;
        conn.execute(
            "INSERT OR IGNORE INTO schema_version (version, applied_at) VALUES (1, ?)",
            params![Utc::now().naive_utc()],
        )?;
        info!("Migrations done.");
        Ok(())
    }

    // ── Reference data (owned by the reference-data collaborator) ─────────────

    pub fn upsert_regions(&self, regions: &[Region]) -> Result<usize> {
        let conn = self.lock()?;
        let tx = conn.unchecked_transaction()?;
        for r in regions {
            let excise = to_rate_bp(r.excise_tax_rate)
                .ok_or_else(|| CoreError::InvalidInput(format!("excise rate for {}", r.code)))?;
            let sales = to_rate_bp(r.sales_tax_rate)
                .ok_or_else(|| CoreError::InvalidInput(format!("sales rate for {}", r.code)))?;
            tx.execute(
                r#"INSERT INTO regions (id, name, code, excise_rate_bp, sales_rate_bp,
                                        is_dry, online_delivery_allowed, home_delivery_allowed,
                                        max_quantity_per_person)
                   VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
                   ON CONFLICT (id) DO UPDATE SET
                       name = excluded.name,
                       excise_rate_bp = excluded.excise_rate_bp,
                       sales_rate_bp = excluded.sales_rate_bp,
                       is_dry = excluded.is_dry,
                       online_delivery_allowed = excluded.online_delivery_allowed,
                       home_delivery_allowed = excluded.home_delivery_allowed,
                       max_quantity_per_person = excluded.max_quantity_per_person"#,
                params![
                    r.id,
                    r.name,
                    r.code,
                    excise,
                    sales,
                    r.is_dry,
                    r.online_delivery_allowed,
                    r.home_delivery_allowed,
                    r.max_quantity_per_person,
                ],
            )?;
        }
        tx.commit()?;
        Ok(regions.len())
    }

    pub fn upsert_retailers(&self, retailers: &[Retailer]) -> Result<usize> {
        let conn = self.lock()?;
        let tx = conn.unchecked_transaction()?;
        for r in retailers {
            let targets = match &r.scrape_targets {
                Some(t) => Some(
                    serde_json::to_string(t)
                        .map_err(|e| CoreError::InvalidInput(format!("scrape targets for {}: {e}", r.name)))?,
                ),
                None => None,
            };
            let delivery = to_minor_units(r.default_delivery_charge)
                .ok_or_else(|| CoreError::InvalidInput(format!("delivery charge for {}", r.name)))?;
            let min_order = to_minor_units(r.default_minimum_order)
                .ok_or_else(|| CoreError::InvalidInput(format!("minimum order for {}", r.name)))?;
            tx.execute(
                r#"INSERT INTO retailers (id, name, operating_regions, scrape_targets,
                                          delivery_available, default_delivery_minor,
                                          default_minimum_order_minor, success_rate,
                                          last_scraped_at, is_active)
                   VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                   ON CONFLICT (id) DO UPDATE SET
                       name = excluded.name,
                       operating_regions = excluded.operating_regions,
                       scrape_targets = excluded.scrape_targets,
                       delivery_available = excluded.delivery_available,
                       default_delivery_minor = excluded.default_delivery_minor,
                       default_minimum_order_minor = excluded.default_minimum_order_minor,
                       is_active = excluded.is_active"#,
                params![
                    r.id,
                    r.name,
                    r.operating_regions.join(","),
                    targets,
                    r.delivery_available,
                    delivery,
                    min_order,
                    r.success_rate,
                    r.last_scraped_at,
                    r.is_active,
                ],
            )?;
        }
        tx.commit()?;
        Ok(retailers.len())
    }

    pub fn upsert_spirits(&self, spirits: &[Spirit]) -> Result<usize> {
        let conn = self.lock()?;
        let tx = conn.unchecked_transaction()?;
        for s in spirits {
            let mrp = to_minor_units(s.mrp)
                .ok_or_else(|| CoreError::InvalidInput(format!("mrp for {}", s.name)))?;
            tx.execute(
                r#"INSERT INTO spirits (id, name, brand, spirit_type, manufacturer,
                                        bottle_size_ml, mrp_minor, is_local_brand,
                                        available_regions, flavors)
                   VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                   ON CONFLICT (id) DO UPDATE SET
                       name = excluded.name,
                       brand = excluded.brand,
                       spirit_type = excluded.spirit_type,
                       manufacturer = excluded.manufacturer,
                       bottle_size_ml = excluded.bottle_size_ml,
                       mrp_minor = excluded.mrp_minor,
                       is_local_brand = excluded.is_local_brand,
                       available_regions = excluded.available_regions,
                       flavors = excluded.flavors"#,
                params![
                    s.id,
                    s.name,
                    s.brand,
                    s.spirit_type.as_str(),
                    s.manufacturer,
                    s.bottle_size_ml,
                    mrp,
                    s.is_local_brand,
                    s.available_regions.join(","),
                    s.flavors.join(","),
                ],
            )?;
        }
        tx.commit()?;
        Ok(spirits.len())
    }

    pub fn get_region(&self, code: &str) -> Result<Region> {
        let conn = self.lock()?;
        let row = conn.query_row(
            r#"SELECT id, name, code, excise_rate_bp, sales_rate_bp, is_dry,
                      online_delivery_allowed, home_delivery_allowed, max_quantity_per_person
               FROM regions WHERE code = ?"#,
            params![code],
            |r| {
                Ok(Region {
                    id: r.get(0)?,
                    name: r.get(1)?,
                    code: r.get(2)?,
                    excise_tax_rate: from_rate_bp(r.get(3)?),
                    sales_tax_rate: from_rate_bp(r.get(4)?),
                    is_dry: r.get(5)?,
                    online_delivery_allowed: r.get(6)?,
                    home_delivery_allowed: r.get(7)?,
                    max_quantity_per_person: r.get(8)?,
                })
            },
        );
        match row {
            Ok(region) => Ok(region),
            Err(duckdb::Error::QueryReturnedNoRows) => Err(CoreError::not_found("region", code)),
            Err(e) => Err(e.into()),
        }
    }

    pub fn get_retailer(&self, id: i64) -> Result<Retailer> {
        let conn = self.lock()?;
        let row = conn.query_row(
            r#"SELECT id, name, operating_regions, scrape_targets, delivery_available,
                      default_delivery_minor, default_minimum_order_minor, success_rate,
                      last_scraped_at, is_active
               FROM retailers WHERE id = ?"#,
            params![id],
            Self::map_retailer_row,
        );
        match row {
            Ok(retailer) => Ok(retailer),
            Err(duckdb::Error::QueryReturnedNoRows) => Err(CoreError::not_found("retailer", id)),
            Err(e) => Err(e.into()),
        }
    }

    pub fn list_active_retailers(&self) -> Result<Vec<Retailer>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            r#"SELECT id, name, operating_regions, scrape_targets, delivery_available,
                      default_delivery_minor, default_minimum_order_minor, success_rate,
                      last_scraped_at, is_active
               FROM retailers WHERE is_active ORDER BY last_scraped_at ASC NULLS FIRST"#,
        )?;
        let retailers = stmt
            .query_map([], Self::map_retailer_row)?
            .collect::<duckdb::Result<Vec<_>>>()?;
        Ok(retailers)
    }

    fn map_retailer_row(r: &duckdb::Row<'_>) -> duckdb::Result<Retailer> {
        let regions: String = r.get(2)?;
        let targets_json: Option<String> = r.get(3)?;
        let scrape_targets = targets_json.and_then(|json| {
            serde_json::from_str::<ScrapeTargets>(&json)
                .map_err(|e| warn!("Bad scrape targets JSON: {e}"))
                .ok()
        });
        Ok(Retailer {
            id: r.get(0)?,
            name: r.get(1)?,
            operating_regions: split_codes(&regions),
            scrape_targets,
            delivery_available: r.get(4)?,
            default_delivery_charge: from_minor_units(r.get(5)?),
            default_minimum_order: from_minor_units(r.get(6)?),
            success_rate: r.get(7)?,
            last_scraped_at: r.get(8)?,
            is_active: r.get(9)?,
        })
    }

    pub fn get_spirit(&self, id: i64) -> Result<Spirit> {
        let conn = self.lock()?;
        let row = conn.query_row(
            r#"SELECT id, name, brand, spirit_type, manufacturer, bottle_size_ml,
                      mrp_minor, is_local_brand, available_regions, flavors
               FROM spirits WHERE id = ?"#,
            params![id],
            Self::map_spirit_row,
        );
        match row {
            Ok(spirit) => Ok(spirit),
            Err(duckdb::Error::QueryReturnedNoRows) => Err(CoreError::not_found("spirit", id)),
            Err(e) => Err(e.into()),
        }
    }

    pub fn list_spirits(&self) -> Result<Vec<Spirit>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            r#"SELECT id, name, brand, spirit_type, manufacturer, bottle_size_ml,
                      mrp_minor, is_local_brand, available_regions, flavors
               FROM spirits ORDER BY id"#,
        )?;
        let spirits = stmt
            .query_map([], Self::map_spirit_row)?
            .collect::<duckdb::Result<Vec<_>>>()?;
        Ok(spirits)
    }

    fn map_spirit_row(r: &duckdb::Row<'_>) -> duckdb::Result<Spirit> {
        let type_str: String = r.get(3)?;
        let regions: String = r.get(8)?;
        let flavors: String = r.get(9)?;
        Ok(Spirit {
            id: r.get(0)?,
            name: r.get(1)?,
            brand: r.get(2)?,
            spirit_type: SpiritType::from_str(&type_str).unwrap_or(SpiritType::Whisky),
            manufacturer: r.get(4)?,
            bottle_size_ml: r.get(5)?,
            mrp: from_minor_units(r.get(6)?),
            is_local_brand: r.get(7)?,
            available_regions: split_codes(&regions),
            flavors: split_codes(&flavors),
        })
    }

    // ── Current prices & upsert ───────────────────────────────────────────────

    pub fn current_record(
        &self,
        spirit_id: i64,
        region_code: &str,
        retailer_id: i64,
    ) -> Result<Option<PriceRecord>> {
        let conn = self.lock()?;
        Self::read_current(&conn, spirit_id, region_code, retailer_id)
    }

    fn read_current(
        conn: &Connection,
        spirit_id: i64,
        region_code: &str,
        retailer_id: i64,
    ) -> Result<Option<PriceRecord>> {
        let row = conn.query_row(
            r#"SELECT spirit_id, region_code, retailer_id, base_price_minor,
                      tax_amount_minor, final_price_minor, mrp_price_minor,
                      discount_pct_centis, availability, delivery_minor,
                      minimum_order_minor, observed_at
               FROM prices
               WHERE spirit_id = ? AND region_code = ? AND retailer_id = ?"#,
            params![spirit_id, region_code, retailer_id],
            Self::map_price_row,
        );
        match row {
            Ok(record) => Ok(Some(record)),
            Err(duckdb::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn map_price_row(r: &duckdb::Row<'_>) -> duckdb::Result<PriceRecord> {
        let availability: String = r.get(8)?;
        let mrp_minor: Option<i64> = r.get(6)?;
        Ok(PriceRecord {
            spirit_id: r.get(0)?,
            region_code: r.get(1)?,
            retailer_id: r.get(2)?,
            base_price: from_minor_units(r.get(3)?),
            tax_amount: from_minor_units(r.get(4)?),
            final_price: from_minor_units(r.get(5)?),
            mrp_price: mrp_minor.map(from_minor_units),
            discount_percentage: from_pct_centis(r.get(7)?),
            availability: AvailabilityStatus::from_str(&availability)
                .unwrap_or(AvailabilityStatus::Unknown),
            delivery_charges: from_minor_units(r.get(9)?),
            minimum_order_amount: from_minor_units(r.get(10)?),
            observed_at: r.get(11)?,
        })
    }

    /// Apply one observation: derive the final price for the region, diff it
    /// against the stored record, and atomically append the history entry and
    /// overwrite the current record. Serialized per triple; the optimistic
    /// previous-price predicate is retried a bounded number of times before
    /// surfacing `Conflict`.
    pub fn upsert_price(&self, obs: &PriceObservation) -> Result<UpsertOutcome> {
        let region = self.get_region(&obs.region_code)?;
        if region.is_dry {
            return Err(CoreError::ineligible(&region.code, "alcohol sale prohibited"));
        }

        let retailer = self.get_retailer(obs.retailer_id)?;
        if !retailer.operates_in(&obs.region_code) {
            return Err(CoreError::ineligible(
                &obs.region_code,
                format!("retailer {} does not operate there", retailer.name),
            ));
        }

        let spirit = self.get_spirit(obs.spirit_id)?;

        if obs.minimum_order_amount < Decimal::ZERO {
            return Err(CoreError::InvalidInput(format!(
                "minimum order must be non-negative, got {}",
                obs.minimum_order_amount
            )));
        }

        let breakdown = pricing::compute_final_price(obs.base_price, &region, obs.delivery_charges)?;
        // Master-catalog MRP is authoritative for the discount; the
        // retailer-reported figure is persisted for audit only.
        let discount = pricing::compute_discount_percentage(breakdown.base_price, spirit.mrp);
        let threshold = from_minor_units(self.pricing.change_threshold_minor);

        let max_attempts = self.pricing.max_upsert_retries.max(1);
        let mut attempt = 0;
        loop {
            attempt += 1;
            // Fresh previous-value read per attempt; the update predicate in
            // try_upsert catches a writer that slips in after this read.
            let previous =
                self.current_record(obs.spirit_id, &obs.region_code, obs.retailer_id)?;
            match self.try_upsert(obs, &breakdown, discount, threshold, previous.as_ref()) {
                Err(CoreError::Conflict { .. }) if attempt < max_attempts => {
                    warn!(
                        "Upsert conflict for ({}, {}, {}), retrying (attempt {})",
                        obs.spirit_id, obs.region_code, obs.retailer_id, attempt
                    );
                    continue;
                }
                Err(CoreError::Conflict { key, .. }) => {
                    return Err(CoreError::Conflict {
                        key,
                        attempts: attempt,
                    });
                }
                other => return other,
            }
        }
    }

    pub(crate) fn try_upsert(
        &self,
        obs: &PriceObservation,
        breakdown: &crate::models::PriceBreakdown,
        discount: Decimal,
        threshold: Decimal,
        previous: Option<&PriceRecord>,
    ) -> Result<UpsertOutcome> {
        let conn = self.lock()?;
        let tx = conn.unchecked_transaction()?;

        let entry =
            change::detect_change(previous, breakdown.final_price, threshold, obs.observed_at);

        if let Some(e) = &entry {
            let pct_centis = match e.change_percentage {
                Some(p) => Some(
                    to_pct_centis(p).ok_or_else(|| {
                        CoreError::InvalidInput(format!("change percentage out of range: {p}"))
                    })?,
                ),
                None => None,
            };
            tx.execute(
                r#"INSERT INTO price_history
                       (spirit_id, region_code, retailer_id, old_price_minor,
                        new_price_minor, change_minor, change_pct_centis, reason, recorded_at)
                   VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)"#,
                params![
                    e.spirit_id,
                    e.region_code,
                    e.retailer_id,
                    minor(e.old_price)?,
                    minor(e.new_price)?,
                    minor(e.change)?,
                    pct_centis,
                    e.reason,
                    e.recorded_at,
                ],
            )?;
        }

        let record = PriceRecord {
            spirit_id: obs.spirit_id,
            region_code: obs.region_code.clone(),
            retailer_id: obs.retailer_id,
            base_price: breakdown.base_price,
            tax_amount: breakdown.tax_amount,
            final_price: breakdown.final_price,
            mrp_price: obs.mrp_price,
            discount_percentage: discount,
            availability: obs.availability,
            delivery_charges: breakdown.delivery_charges,
            minimum_order_amount: obs.minimum_order_amount,
            observed_at: obs.observed_at,
        };

        let mrp_minor = match record.mrp_price {
            Some(m) => Some(minor(m)?),
            None => None,
        };
        let discount_centis = to_pct_centis(discount)
            .ok_or_else(|| CoreError::InvalidInput(format!("discount out of range: {discount}")))?;

        let written = match previous {
            None => tx.execute(
                r#"INSERT INTO prices
                       (spirit_id, region_code, retailer_id, base_price_minor,
                        tax_amount_minor, final_price_minor, mrp_price_minor,
                        discount_pct_centis, availability, delivery_minor,
                        minimum_order_minor, observed_at)
                   VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"#,
                params![
                    record.spirit_id,
                    record.region_code,
                    record.retailer_id,
                    minor(record.base_price)?,
                    minor(record.tax_amount)?,
                    minor(record.final_price)?,
                    mrp_minor,
                    discount_centis,
                    record.availability.as_str(),
                    minor(record.delivery_charges)?,
                    minor(record.minimum_order_amount)?,
                    record.observed_at,
                ],
            )?,
            Some(prev) => tx.execute(
                // The previous final price in the predicate is the optimistic
                // check: a concurrent writer that slipped in between the read
                // and this update makes it match zero rows.
                r#"UPDATE prices SET
                       base_price_minor = ?, tax_amount_minor = ?, final_price_minor = ?,
                       mrp_price_minor = ?, discount_pct_centis = ?, availability = ?,
                       delivery_minor = ?, minimum_order_minor = ?, observed_at = ?
                   WHERE spirit_id = ? AND region_code = ? AND retailer_id = ?
                     AND final_price_minor = ?"#,
                params![
                    minor(record.base_price)?,
                    minor(record.tax_amount)?,
                    minor(record.final_price)?,
                    mrp_minor,
                    discount_centis,
                    record.availability.as_str(),
                    minor(record.delivery_charges)?,
                    minor(record.minimum_order_amount)?,
                    record.observed_at,
                    record.spirit_id,
                    record.region_code,
                    record.retailer_id,
                    minor(prev.final_price)?,
                ],
            )?,
        };

        if written != 1 {
            // Rolls back the history insert with the dropped transaction.
            return Err(CoreError::Conflict {
                key: format!(
                    "({}, {}, {})",
                    obs.spirit_id, obs.region_code, obs.retailer_id
                ),
                attempts: 1,
            });
        }

        tx.commit()?;
        Ok(UpsertOutcome {
            record,
            history: entry,
        })
    }

    /// All current records for a (spirit, region), cheapest first, ties by
    /// freshest observation.
    pub fn current_prices(&self, spirit_id: i64, region_code: &str) -> Result<Vec<PriceRecord>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            r#"SELECT spirit_id, region_code, retailer_id, base_price_minor,
                      tax_amount_minor, final_price_minor, mrp_price_minor,
                      discount_pct_centis, availability, delivery_minor,
                      minimum_order_minor, observed_at
               FROM prices
               WHERE spirit_id = ? AND region_code = ?
               ORDER BY final_price_minor ASC, observed_at DESC"#,
        )?;
        let records = stmt
            .query_map(params![spirit_id, region_code], Self::map_price_row)?
            .collect::<duckdb::Result<Vec<_>>>()?;
        Ok(records)
    }

    /// Cheapest current final price per spirit in a region, for the
    /// recommendation path.
    pub fn cheapest_by_spirit(&self, region_code: &str) -> Result<Vec<(i64, Decimal)>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            r#"SELECT spirit_id, MIN(final_price_minor)
               FROM prices WHERE region_code = ?
               GROUP BY spirit_id ORDER BY spirit_id"#,
        )?;
        let rows = stmt
            .query_map(params![region_code], |r| {
                Ok((r.get::<_, i64>(0)?, r.get::<_, i64>(1)?))
            })?
            .collect::<duckdb::Result<Vec<_>>>()?;
        Ok(rows
            .into_iter()
            .map(|(id, m)| (id, from_minor_units(m)))
            .collect())
    }

    // ── History & alerts ──────────────────────────────────────────────────────

    pub fn history(
        &self,
        spirit_id: i64,
        region_code: &str,
        days: u32,
        retailer_id: Option<i64>,
    ) -> Result<Vec<PriceHistoryEntry>> {
        let cutoff = Utc::now().naive_utc() - Duration::days(days as i64);
        let conn = self.lock()?;
        let mut sql = String::from(
            r#"SELECT spirit_id, region_code, retailer_id, old_price_minor,
                      new_price_minor, change_minor, change_pct_centis, reason, recorded_at
               FROM price_history
               WHERE spirit_id = ? AND region_code = ? AND recorded_at > ?"#,
        );
        if retailer_id.is_some() {
            sql.push_str(" AND retailer_id = ?");
        }
        sql.push_str(" ORDER BY recorded_at DESC");

        let mut stmt = conn.prepare(&sql)?;
        let entries = match retailer_id {
            Some(rid) => stmt
                .query_map(params![spirit_id, region_code, cutoff, rid], Self::map_history_row)?
                .collect::<duckdb::Result<Vec<_>>>()?,
            None => stmt
                .query_map(params![spirit_id, region_code, cutoff], Self::map_history_row)?
                .collect::<duckdb::Result<Vec<_>>>()?,
        };
        Ok(entries)
    }

    /// Fold a history window into its aggregates. `None` when the window is
    /// empty, so callers can tell "no changes" apart from a zero average.
    pub fn summarize_history(entries: &[PriceHistoryEntry]) -> Option<HistorySummary> {
        let first = entries.first()?;
        let mut sum = Decimal::ZERO;
        let mut largest = first.change;
        let mut smallest = first.change;
        for e in entries {
            sum += e.change;
            largest = largest.max(e.change);
            smallest = smallest.min(e.change);
        }
        Some(HistorySummary {
            changes: entries.len(),
            net_change: round_money(sum),
            average_change: round_money(sum / Decimal::from(entries.len())),
            largest_increase: largest.max(Decimal::ZERO),
            largest_decrease: smallest.min(Decimal::ZERO),
        })
    }

    /// Significant recent transitions: |change %| at or above `threshold_pct`
    /// within the last `days`, largest magnitude first.
    pub fn alerts(
        &self,
        threshold_pct: Decimal,
        days: u32,
        limit: usize,
    ) -> Result<Vec<PriceHistoryEntry>> {
        let threshold_centis = to_pct_centis(threshold_pct)
            .ok_or_else(|| CoreError::InvalidInput(format!("threshold out of range: {threshold_pct}")))?;
        let cutoff = Utc::now().naive_utc() - Duration::days(days as i64);
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            r#"SELECT spirit_id, region_code, retailer_id, old_price_minor,
                      new_price_minor, change_minor, change_pct_centis, reason, recorded_at
               FROM price_history
               WHERE change_pct_centis IS NOT NULL
                 AND ABS(change_pct_centis) >= ?
                 AND recorded_at > ?
               ORDER BY ABS(change_pct_centis) DESC, recorded_at DESC
               LIMIT ?"#,
        )?;
        let entries = stmt
            .query_map(
                params![threshold_centis, cutoff, limit as i64],
                Self::map_history_row,
            )?
            .collect::<duckdb::Result<Vec<_>>>()?;
        Ok(entries)
    }

    fn map_history_row(r: &duckdb::Row<'_>) -> duckdb::Result<PriceHistoryEntry> {
        let pct_centis: Option<i64> = r.get(6)?;
        Ok(PriceHistoryEntry {
            spirit_id: r.get(0)?,
            region_code: r.get(1)?,
            retailer_id: r.get(2)?,
            old_price: from_minor_units(r.get(3)?),
            new_price: from_minor_units(r.get(4)?),
            change: from_minor_units(r.get(5)?),
            change_percentage: pct_centis.map(from_pct_centis),
            reason: r.get(7)?,
            recorded_at: r.get(8)?,
        })
    }

    // ── Pipeline support ──────────────────────────────────────────────────────

    /// Spirits a retailer should (re)scrape in a region: never priced, or
    /// priced longer ago than the freshness window. Availability in the
    /// region is checked against the spirit's legal-region set.
    pub fn stale_spirits(
        &self,
        retailer_id: i64,
        region_code: &str,
        freshness_hours: u32,
        limit: usize,
    ) -> Result<Vec<Spirit>> {
        let cutoff = Utc::now().naive_utc() - Duration::hours(freshness_hours as i64);
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            r#"SELECT s.id, s.name, s.brand, s.spirit_type, s.manufacturer,
                      s.bottle_size_ml, s.mrp_minor, s.is_local_brand,
                      s.available_regions, s.flavors, p.observed_at
               FROM spirits s
               LEFT JOIN prices p
                 ON p.spirit_id = s.id AND p.retailer_id = ? AND p.region_code = ?
               ORDER BY s.id"#,
        )?;
        let rows = stmt
            .query_map(params![retailer_id, region_code], |r| {
                let spirit = Self::map_spirit_row(r)?;
                let observed: Option<NaiveDateTime> = r.get(10)?;
                Ok((spirit, observed))
            })?
            .collect::<duckdb::Result<Vec<_>>>()?;

        Ok(rows
            .into_iter()
            .filter(|(spirit, observed)| {
                spirit.available_in(region_code)
                    && observed.map(|t| t < cutoff).unwrap_or(true)
            })
            .map(|(spirit, _)| spirit)
            .take(limit)
            .collect())
    }

    pub fn record_scrape_result(&self, retailer_id: i64, success_rate: f64) -> Result<()> {
        let conn = self.lock()?;
        conn.execute(
            "UPDATE retailers SET success_rate = ?, last_scraped_at = ? WHERE id = ?",
            params![
                success_rate.clamp(0.0, 100.0),
                Utc::now().naive_utc(),
                retailer_id
            ],
        )?;
        Ok(())
    }

    // ── Ingest run log ────────────────────────────────────────────────────────

    pub fn begin_ingest_run(&self) -> Result<i64> {
        let conn = self.lock()?;
        let id: i64 = conn.query_row(
            "SELECT COALESCE(MAX(id), 0) + 1 FROM ingest_runs",
            [],
            |r| r.get(0),
        )?;
        conn.execute(
            "INSERT INTO ingest_runs (id, started_at, status) VALUES (?, ?, 'running')",
            params![id, Utc::now().naive_utc()],
        )?;
        Ok(id)
    }

    pub fn finish_ingest_run(
        &self,
        run_id: i64,
        observations: usize,
        changes: usize,
        errors: usize,
        error_msg: Option<&str>,
    ) -> Result<()> {
        let conn = self.lock()?;
        conn.execute(
            r#"UPDATE ingest_runs SET
               finished_at = ?, status = ?,
               observations = ?, changes_recorded = ?, errors = ?, error_msg = ?
               WHERE id = ?"#,
            params![
                Utc::now().naive_utc(),
                if error_msg.is_none() { "success" } else { "error" },
                observations as i64,
                changes as i64,
                errors as i64,
                error_msg,
                run_id,
            ],
        )?;
        Ok(())
    }

    // ── Stats ─────────────────────────────────────────────────────────────────

    pub fn price_count(&self) -> Result<i64> {
        self.scalar("SELECT COUNT(*) FROM prices")
    }

    pub fn history_count(&self) -> Result<i64> {
        self.scalar("SELECT COUNT(*) FROM price_history")
    }

    pub fn spirit_count(&self) -> Result<i64> {
        self.scalar("SELECT COUNT(*) FROM spirits")
    }

    pub fn region_count(&self) -> Result<i64> {
        self.scalar("SELECT COUNT(*) FROM regions")
    }

    pub fn dry_region_count(&self) -> Result<i64> {
        self.scalar("SELECT COUNT(*) FROM regions WHERE is_dry")
    }

    pub fn retailer_count(&self) -> Result<i64> {
        self.scalar("SELECT COUNT(*) FROM retailers WHERE is_active")
    }

    pub fn prices_updated_within_hours(&self, hours: u32) -> Result<i64> {
        let cutoff = Utc::now().naive_utc() - Duration::hours(hours as i64);
        let conn = self.lock()?;
        Ok(conn.query_row(
            "SELECT COUNT(*) FROM prices WHERE observed_at > ?",
            params![cutoff],
            |r| r.get(0),
        )?)
    }

    pub fn changes_within_days(&self, days: u32) -> Result<i64> {
        let cutoff = Utc::now().naive_utc() - Duration::days(days as i64);
        let conn = self.lock()?;
        Ok(conn.query_row(
            "SELECT COUNT(*) FROM price_history WHERE recorded_at > ?",
            params![cutoff],
            |r| r.get(0),
        )?)
    }

    fn scalar(&self, sql: &str) -> Result<i64> {
        let conn = self.lock()?;
        Ok(conn.query_row(sql, [], |r| r.get(0))?)
    }
}

fn minor(value: Decimal) -> Result<i64> {
    to_minor_units(value)
        .ok_or_else(|| CoreError::InvalidInput(format!("monetary value out of range: {value}")))
}

fn split_codes(s: &str) -> Vec<String> {
    s.split(',')
        .map(|c| c.trim().to_string())
        .filter(|c| !c.is_empty())
        .collect()
}

#[cfg(test)]
impl Repository {
    /// Raw SQL escape hatch for failure-injection in tests.
    pub(crate) fn execute_batch_raw(&self, sql: &str) -> Result<()> {
        let conn = self.lock()?;
        conn.execute_batch(sql)?;
        Ok(())
    }

    pub(crate) fn ingest_run_status(&self, run_id: i64) -> Result<String> {
        let conn = self.lock()?;
        Ok(conn.query_row(
            "SELECT status FROM ingest_runs WHERE id = ?",
            params![run_id],
            |r| r.get(0),
        )?)
    }
}
