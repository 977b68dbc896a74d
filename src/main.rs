mod compare;
mod config;
mod error;
mod loader;
mod models;
mod pipeline;
mod pricing;
mod scraper;
mod storage;
mod utils;

use anyhow::Result;
use clap::{Parser, Subcommand};
use rust_decimal::Decimal;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

use crate::compare::{ComparisonEngine, RecommendFilters};
use crate::config::AppConfig;
use crate::loader::{load_catalog, load_observations_csv};
use crate::models::SpiritType;
use crate::pipeline::Pipeline;
use crate::storage::Repository;

#[derive(Parser)]
#[command(name = "spirit-pricing", about = "Regional spirit pricing & comparison engine", version)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,
}

#[derive(Subcommand)]
enum Command {
    /// Apply schema migrations without loading data
    Migrate,

    /// Load a JSON reference catalog (regions, retailers, spirits)
    LoadCatalog {
        /// Path to the catalog file
        #[arg(short, long, default_value = "data/catalog.json")]
        file: PathBuf,
    },

    /// Bulk-load manually collected price observations from a CSV file
    LoadObservations {
        /// Path to the observations CSV
        #[arg(short, long, default_value = "data/observations.csv")]
        file: PathBuf,
    },

    /// Scrape stale retailer listings and refresh stored prices
    Update,

    /// Compare retailer prices for a spirit in a region
    Compare {
        spirit_id: i64,
        region: String,
    },

    /// Recommend spirits in a region for a budget
    Recommend {
        region: String,
        budget: Decimal,

        /// Restrict to one spirit type (whisky, rum, …)
        #[arg(short = 't', long)]
        spirit_type: Option<String>,

        /// Preferred flavor notes, comma separated
        #[arg(short = 'f', long, value_delimiter = ',')]
        flavors: Vec<String>,

        /// Only locally produced brands
        #[arg(long)]
        local_only: bool,
    },

    /// Show the price change history for a spirit in a region
    History {
        spirit_id: i64,
        region: String,

        #[arg(short, long, default_value_t = 30)]
        days: u32,

        /// Restrict to one retailer
        #[arg(short, long)]
        retailer: Option<i64>,
    },

    /// Show recent significant price movements
    Alerts {
        /// Minimum |change| in percent
        #[arg(short, long, default_value = "10")]
        threshold: Decimal,

        #[arg(short, long, default_value_t = 7)]
        days: u32,

        #[arg(short, long, default_value_t = 20)]
        limit: usize,
    },

    /// Show database statistics
    Stats,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = match cli.verbose {
        0 => "spirit_pricing_engine=info,warn",
        1 => "spirit_pricing_engine=debug,info",
        _ => "trace",
    };

    tracing_subscriber::fmt()
        .compact()
        .with_target(false)
        .with_env_filter(EnvFilter::new(filter))
        .init();

    let config = AppConfig::load()?;

    match cli.command {
        Command::Migrate => {
            Repository::open(&config.storage.db_path, config.pricing.clone())?.run_migrations()?;
            println!("Migrations applied.");
        }

        Command::LoadCatalog { file } => {
            let _t = utils::Timer::start("Catalog load");
            let repo = Repository::open(&config.storage.db_path, config.pricing.clone())?;
            repo.run_migrations()?;

            let catalog = load_catalog(&file)?;
            let regions = repo.upsert_regions(&catalog.regions)?;
            let retailers = repo.upsert_retailers(&catalog.retailers)?;
            let spirits = repo.upsert_spirits(&catalog.spirits)?;
            info!(
                "Done: {} regions, {} retailers, {} spirits upserted",
                regions, retailers, spirits
            );
        }

        Command::LoadObservations { file } => {
            let _t = utils::Timer::start("Observation bulk load");
            let repo = Repository::open(&config.storage.db_path, config.pricing.clone())?;
            repo.run_migrations()?;

            let observations = load_observations_csv(&file)?;
            let mut stored = 0usize;
            let mut changes = 0usize;
            let mut errors = 0usize;
            for obs in &observations {
                match repo.upsert_price(obs) {
                    Ok(outcome) => {
                        stored += 1;
                        if outcome.history.is_some() {
                            changes += 1;
                        }
                    }
                    Err(e) => {
                        info!(
                            "Skipping ({}, {}, {}): {}",
                            obs.spirit_id, obs.region_code, obs.retailer_id, e
                        );
                        errors += 1;
                    }
                }
            }
            info!(
                "Done: {} stored, {} price changes, {} rejected",
                stored, changes, errors
            );
        }

        Command::Update => {
            let _t = utils::Timer::start("Price update");
            let stats = Pipeline::new(config).run().await?;
            info!(
                "Done: {} retailers, {} observations, {} changes, {} errors",
                stats.retailers_processed, stats.observations, stats.changes_recorded, stats.errors
            );
        }

        Command::Compare { spirit_id, region } => {
            let repo = Arc::new(Repository::open(&config.storage.db_path, config.pricing.clone())?);
            let engine =
                ComparisonEngine::new(repo, config.recommend.clone(), config.cache.clone());

            let cmp = engine.compare(spirit_id, &region)?;
            println!("─────────────────────────────────────────────");
            println!("  {} in {}", cmp.spirit_name, cmp.region_code);
            println!("─────────────────────────────────────────────");
            if cmp.quotes.is_empty() {
                println!("  No prices recorded yet.");
            }
            for q in &cmp.quotes {
                println!(
                    "  {:<20} {:>12}  (base {} + tax {} + delivery {})  {} off MRP  [{}]",
                    q.retailer_name,
                    utils::fmt_money(q.final_price),
                    utils::fmt_money(q.base_price),
                    utils::fmt_money(q.tax_amount),
                    utils::fmt_money(q.delivery_charges),
                    format_args!("{}%", q.discount_percentage),
                    q.availability.as_str(),
                );
            }
            if let Some(s) = &cmp.summary {
                println!("─────────────────────────────────────────────");
                println!(
                    "  {} retailers | low {} | high {} | avg {} | spread {}",
                    s.retailer_count,
                    utils::fmt_money(s.lowest_price),
                    utils::fmt_money(s.highest_price),
                    utils::fmt_money(s.average_price),
                    utils::fmt_money(s.price_range),
                );
            }
        }

        Command::Recommend {
            region,
            budget,
            spirit_type,
            flavors,
            local_only,
        } => {
            let repo = Arc::new(Repository::open(&config.storage.db_path, config.pricing.clone())?);
            let engine =
                ComparisonEngine::new(repo, config.recommend.clone(), config.cache.clone());

            let spirit_type = match spirit_type {
                Some(s) => Some(
                    s.parse::<SpiritType>()
                        .map_err(|e| anyhow::anyhow!(e))?,
                ),
                None => None,
            };
            let filters = RecommendFilters {
                spirit_type,
                flavors,
                local_only,
            };

            let recs = engine.recommend(&region, budget, &filters)?;
            if recs.is_empty() {
                println!(
                    "Nothing in {} fits a budget of {}.",
                    region,
                    utils::fmt_money(budget)
                );
            }
            for (i, r) in recs.iter().enumerate() {
                println!(
                    "{}. {} ({} {}, {}ml) — {} at {}  [score {:.3}]",
                    i + 1,
                    r.spirit.name,
                    r.spirit.brand,
                    r.spirit.spirit_type,
                    r.spirit.bottle_size_ml,
                    utils::fmt_money(r.best_price),
                    r.retailer_name,
                    r.score,
                );
            }
        }

        Command::History {
            spirit_id,
            region,
            days,
            retailer,
        } => {
            let repo = Repository::open(&config.storage.db_path, config.pricing.clone())?;
            let entries = repo.history(spirit_id, &region, days, retailer)?;
            if entries.is_empty() {
                println!("No price changes in the last {} days.", days);
            } else {
                for e in &entries {
                    println!(
                        "{}  retailer {}: {} → {} ({}{}, {})",
                        e.recorded_at,
                        e.retailer_id,
                        utils::fmt_money(e.old_price),
                        utils::fmt_money(e.new_price),
                        if e.change > Decimal::ZERO { "+" } else { "" },
                        utils::fmt_money(e.change),
                        e.reason,
                    );
                }
                if let Some(s) = Repository::summarize_history(&entries) {
                    println!(
                        "{} changes | net {}{} | avg {}{} | largest rise {} | largest drop {}",
                        s.changes,
                        if s.net_change > Decimal::ZERO { "+" } else { "" },
                        utils::fmt_money(s.net_change),
                        if s.average_change > Decimal::ZERO { "+" } else { "" },
                        utils::fmt_money(s.average_change),
                        utils::fmt_money(s.largest_increase),
                        utils::fmt_money(s.largest_decrease),
                    );
                }
            }
        }

        Command::Alerts {
            threshold,
            days,
            limit,
        } => {
            let repo = Repository::open(&config.storage.db_path, config.pricing.clone())?;
            let alerts = repo.alerts(threshold, days, limit)?;
            if alerts.is_empty() {
                println!(
                    "No moves of {}% or more in the last {} days.",
                    threshold, days
                );
            }
            for a in &alerts {
                println!(
                    "{}  spirit {} in {} (retailer {}): {} → {}  {}%  [{}]",
                    a.recorded_at,
                    a.spirit_id,
                    a.region_code,
                    a.retailer_id,
                    utils::fmt_money(a.old_price),
                    utils::fmt_money(a.new_price),
                    a.change_percentage
                        .map(|p| p.to_string())
                        .unwrap_or_else(|| "—".into()),
                    a.reason,
                );
            }
        }

        Command::Stats => {
            let repo = Repository::open(&config.storage.db_path, config.pricing.clone())?;
            println!("─────────────────────────────────");
            println!("  Spirit Pricing — Database Stats");
            println!("─────────────────────────────────");
            println!("  Regions    : {} ({} dry)", repo.region_count()?, repo.dry_region_count()?);
            println!("  Retailers  : {}", utils::fmt_number(repo.retailer_count()?));
            println!("  Spirits    : {}", utils::fmt_number(repo.spirit_count()?));
            println!("  Prices     : {}", utils::fmt_number(repo.price_count()?));
            println!("  Fresh <24h : {}", utils::fmt_number(repo.prices_updated_within_hours(24)?));
            println!("  History    : {}", utils::fmt_number(repo.history_count()?));
            println!("  Changes 7d : {}", utils::fmt_number(repo.changes_within_days(7)?));
            println!("─────────────────────────────────");
        }
    }

    Ok(())
}
