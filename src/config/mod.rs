use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Top-level application configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AppConfig {
    #[serde(default)]
    pub scraper: ScraperConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub pipeline: PipelineConfig,
    #[serde(default)]
    pub pricing: PricingConfig,
    #[serde(default)]
    pub recommend: RecommendConfig,
    #[serde(default)]
    pub cache: CacheConfig,
}

/// Scraper configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ScraperConfig {
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,

    #[serde(default = "default_request_delay_ms")]
    pub request_delay_ms: u64,

    #[serde(default = "default_jitter_ms")]
    pub jitter_ms: u64,

    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    #[serde(default = "default_user_agents")]
    pub user_agents: Vec<String>,
}

/// Storage configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StorageConfig {
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,

    #[serde(default = "default_true")]
    pub run_migrations: bool,
}

/// Pipeline configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PipelineConfig {
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,

    /// Re-scrape a (spirit, retailer, region) only when its record is older
    /// than this, or missing entirely.
    #[serde(default = "default_freshness_hours")]
    pub freshness_hours: u32,

    #[serde(default = "default_batch_limit")]
    pub batch_limit: usize,

    /// Hard bound on one fetch; on expiry the attempt is abandoned without
    /// touching the store.
    #[serde(default = "default_fetch_timeout_secs")]
    pub fetch_timeout_secs: u64,
}

/// Pricing core configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PricingConfig {
    /// Minimum |Δ| in minor units (paise) for a history entry. 1 = ₹0.01.
    #[serde(default = "default_change_threshold_minor")]
    pub change_threshold_minor: i64,

    #[serde(default = "default_max_upsert_retries")]
    pub max_upsert_retries: u32,
}

/// Recommendation scoring weights. Explicit configuration, never hidden
/// randomness; identical inputs and data always rank identically.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RecommendConfig {
    #[serde(default = "default_budget_weight")]
    pub budget_weight: f64,

    #[serde(default = "default_flavor_weight")]
    pub flavor_weight: f64,

    /// Lower bound of the budget window as a fraction of the budget.
    #[serde(default = "default_budget_floor_ratio")]
    pub budget_floor_ratio: f64,

    #[serde(default = "default_max_results")]
    pub max_results: usize,
}

/// Read-through comparison cache
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CacheConfig {
    #[serde(default = "default_cache_ttl_secs")]
    pub ttl_secs: u64,
}

// ── Defaults ─────────────────────────────────────────────────────────────────

fn default_timeout_secs() -> u64 {
    30
}
fn default_request_delay_ms() -> u64 {
    2000
}
fn default_jitter_ms() -> u64 {
    500
}
fn default_max_retries() -> u32 {
    3
}
fn default_user_agents() -> Vec<String> {
    vec![
        "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0 Safari/537.36".to_string(),
        "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/17.0 Safari/605.1.15".to_string(),
        "Mozilla/5.0 (X11; Linux x86_64; rv:121.0) Gecko/20100101 Firefox/121.0".to_string(),
    ]
}
fn default_db_path() -> PathBuf {
    PathBuf::from("data/spirit_pricing.duckdb")
}
fn default_true() -> bool {
    true
}
fn default_concurrency() -> usize {
    3
}
fn default_freshness_hours() -> u32 {
    24
}
fn default_batch_limit() -> usize {
    50
}
fn default_fetch_timeout_secs() -> u64 {
    45
}
fn default_change_threshold_minor() -> i64 {
    1
}
fn default_max_upsert_retries() -> u32 {
    3
}
fn default_budget_weight() -> f64 {
    0.6
}
fn default_flavor_weight() -> f64 {
    0.4
}
fn default_budget_floor_ratio() -> f64 {
    0.25
}
fn default_max_results() -> usize {
    5
}
fn default_cache_ttl_secs() -> u64 {
    600
}

impl Default for ScraperConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_timeout_secs(),
            request_delay_ms: default_request_delay_ms(),
            jitter_ms: default_jitter_ms(),
            max_retries: default_max_retries(),
            user_agents: default_user_agents(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
            run_migrations: true,
        }
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            concurrency: default_concurrency(),
            freshness_hours: default_freshness_hours(),
            batch_limit: default_batch_limit(),
            fetch_timeout_secs: default_fetch_timeout_secs(),
        }
    }
}

impl Default for PricingConfig {
    fn default() -> Self {
        Self {
            change_threshold_minor: default_change_threshold_minor(),
            max_upsert_retries: default_max_upsert_retries(),
        }
    }
}

impl Default for RecommendConfig {
    fn default() -> Self {
        Self {
            budget_weight: default_budget_weight(),
            flavor_weight: default_flavor_weight(),
            budget_floor_ratio: default_budget_floor_ratio(),
            max_results: default_max_results(),
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl_secs: default_cache_ttl_secs(),
        }
    }
}

// ── Loader ───────────────────────────────────────────────────────────────────

impl AppConfig {
    /// Load configuration from file + environment overrides
    pub fn load() -> Result<Self> {
        dotenv::dotenv().ok();

        let cfg = config::Config::builder()
            .add_source(
                config::File::with_name("config/default")
                    .required(false)
                    .format(config::FileFormat::Toml),
            )
            .add_source(
                config::File::with_name("config/local")
                    .required(false)
                    .format(config::FileFormat::Toml),
            )
            .add_source(config::Environment::with_prefix("SPIRIT").separator("__"))
            .build()?;

        let app_cfg: AppConfig = cfg.try_deserialize().unwrap_or_else(|_| AppConfig::default());
        Ok(app_cfg)
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            scraper: ScraperConfig::default(),
            storage: StorageConfig::default(),
            pipeline: PipelineConfig::default(),
            pricing: PricingConfig::default(),
            recommend: RecommendConfig::default(),
            cache: CacheConfig::default(),
        }
    }
}
