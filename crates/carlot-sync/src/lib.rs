//! Inventory sync: scrape, reconcile against the catalog, commit once per run.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use carlot_adapters::{
    AdapterContext, DealerInventoryScraper, FixtureInventoryScraper, InventoryScraper,
};
use carlot_core::RawListing;
use carlot_storage::{BackoffPolicy, CarBatch, CarStore, HttpClientConfig, HttpFetcher};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::Mutex;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

pub const DEFAULT_INVENTORY_URL: &str = "https://www.claycooley.com/inventory/new-cars/";

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub database_url: String,
    pub inventory_url: String,
    pub inventory_fixture: Option<PathBuf>,
    pub scheduler_enabled: bool,
    pub sync_interval: Duration,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub http_max_retries: usize,
    pub max_pages: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self::from_lookup(|_| None)
    }
}

impl SyncConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        Self {
            database_url: lookup("DATABASE_URL").unwrap_or_else(|| "sqlite://cars.db".to_string()),
            inventory_url: lookup("CARLOT_INVENTORY_URL")
                .unwrap_or_else(|| DEFAULT_INVENTORY_URL.to_string()),
            inventory_fixture: lookup("CARLOT_INVENTORY_FIXTURE")
                .filter(|v| !v.trim().is_empty())
                .map(PathBuf::from),
            scheduler_enabled: lookup("CARLOT_SCHEDULER_ENABLED")
                .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
                .unwrap_or(true),
            sync_interval: Duration::from_secs(
                lookup("CARLOT_SYNC_INTERVAL_HOURS")
                    .and_then(|v| v.parse::<u64>().ok())
                    .unwrap_or(24)
                    .max(1)
                    * 60
                    * 60,
            ),
            user_agent: lookup("CARLOT_USER_AGENT").unwrap_or_else(|| "carlot-bot/0.1".to_string()),
            http_timeout_secs: lookup("CARLOT_HTTP_TIMEOUT_SECS")
                .and_then(|v| v.parse().ok())
                .unwrap_or(20),
            http_max_retries: lookup("CARLOT_HTTP_MAX_RETRIES")
                .and_then(|v| v.parse().ok())
                .unwrap_or(0),
            max_pages: lookup("CARLOT_MAX_PAGES")
                .and_then(|v| v.parse().ok())
                .unwrap_or(10),
        }
    }
}

/// Which lookup a raw listing is deduplicated by.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MatchKey {
    Vin(String),
    Identity { make: String, model: String, year: i32 },
}

impl MatchKey {
    /// VIN when the listing has a non-blank one, otherwise (make, model, coerced year).
    pub fn for_listing(listing: &RawListing) -> Self {
        match listing.vin() {
            Some(vin) => MatchKey::Vin(vin.to_string()),
            None => MatchKey::Identity {
                make: listing.make.clone(),
                model: listing.model.clone(),
                year: listing.year(),
            },
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileStats {
    pub scraped: usize,
    pub inserted: usize,
    pub skipped_by_vin: usize,
    pub skipped_by_identity: usize,
}

impl ReconcileStats {
    pub fn skipped(&self) -> usize {
        self.skipped_by_vin + self.skipped_by_identity
    }
}

/// Inserts every listing that has no matching car yet. Existing rows are never touched.
///
/// Lookups go through `batch`, so a listing inserted earlier in the same run counts as
/// existing for later ones. Any error leaves the batch uncommitted for the caller to drop.
pub async fn reconcile(batch: &mut CarBatch, listings: &[RawListing]) -> Result<ReconcileStats> {
    let mut stats = ReconcileStats {
        scraped: listings.len(),
        ..Default::default()
    };

    for (idx, listing) in listings.iter().enumerate() {
        let key = MatchKey::for_listing(listing);
        let existing = match &key {
            MatchKey::Vin(vin) => batch.find_by_vin(vin).await,
            MatchKey::Identity { make, model, year } => {
                batch.find_by_identity(make, model, *year).await
            }
        }
        .with_context(|| format!("looking up listing #{idx} by {key:?}"))?;

        if let Some(car) = existing {
            debug!(listing = idx, existing_id = car.id, ?key, "listing already in catalog");
            match key {
                MatchKey::Vin(_) => stats.skipped_by_vin += 1,
                MatchKey::Identity { .. } => stats.skipped_by_identity += 1,
            }
            continue;
        }

        let car = listing.to_new_car().with_context(|| {
            format!(
                "malformed listing #{idx} ({} {} {})",
                listing.year, listing.make, listing.model
            )
        })?;
        batch
            .insert(&car)
            .await
            .with_context(|| format!("inserting listing #{idx}"))?;
        stats.inserted += 1;
    }

    Ok(stats)
}

#[derive(Debug, Clone, Serialize)]
pub struct SyncRunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub scraper: String,
    pub inventory_url: String,
    pub scraped: usize,
    pub inserted: usize,
    pub skipped: usize,
}

pub fn scraper_from_config(config: &SyncConfig) -> Result<Box<dyn InventoryScraper>> {
    if let Some(path) = &config.inventory_fixture {
        return Ok(Box::new(FixtureInventoryScraper::new(path.clone())));
    }
    let http = HttpFetcher::new(HttpClientConfig {
        timeout: Duration::from_secs(config.http_timeout_secs),
        user_agent: Some(config.user_agent.clone()),
        backoff: BackoffPolicy {
            max_retries: config.http_max_retries,
            ..Default::default()
        },
    })?;
    Ok(Box::new(DealerInventoryScraper::new(http, config.max_pages)))
}

pub struct SyncPipeline {
    config: SyncConfig,
    store: CarStore,
    scraper: Box<dyn InventoryScraper>,
    in_flight: Mutex<()>,
}

impl SyncPipeline {
    pub fn new(config: SyncConfig, store: CarStore) -> Result<Self> {
        let scraper = scraper_from_config(&config)?;
        Ok(Self::with_scraper(config, store, scraper))
    }

    pub fn with_scraper(config: SyncConfig, store: CarStore, scraper: Box<dyn InventoryScraper>) -> Self {
        Self {
            config,
            store,
            scraper,
            in_flight: Mutex::new(()),
        }
    }

    /// One scrape + reconcile pass. Either every new listing is committed or none is.
    pub async fn run_once(&self) -> Result<SyncRunSummary> {
        let started_at = Utc::now();
        let run_id = Uuid::new_v4();
        let url = &self.config.inventory_url;
        info!(%run_id, scraper = self.scraper.name(), %url, "running inventory sync");

        let listings = self
            .scraper
            .scrape(&AdapterContext { run_id }, url)
            .await
            .with_context(|| format!("scraping {url}"))?;

        let mut batch = self.store.begin_batch().await.context("opening sync batch")?;
        let stats = reconcile(&mut batch, &listings).await?;
        let inserted = batch.commit().await.context("committing sync batch")?;

        let summary = SyncRunSummary {
            run_id,
            started_at,
            finished_at: Utc::now(),
            scraper: self.scraper.name().to_string(),
            inventory_url: url.clone(),
            scraped: stats.scraped,
            inserted,
            skipped: stats.skipped(),
        };
        info!(
            %run_id,
            scraped = summary.scraped,
            inserted = summary.inserted,
            skipped = summary.skipped,
            "inventory sync complete"
        );
        Ok(summary)
    }

    /// Runs a sync unless another one on this pipeline is still going, in which case
    /// nothing happens and `None` comes back.
    pub async fn run_if_idle(&self) -> Option<Result<SyncRunSummary>> {
        let Ok(_running) = self.in_flight.try_lock() else {
            warn!("previous inventory sync still running; skipping this tick");
            return None;
        };
        Some(self.run_once().await)
    }

    /// Registers the single repeating sync job. Returns `None` when the scheduler is disabled.
    ///
    /// Ticks that fire while a previous run is still going are skipped.
    pub async fn maybe_build_scheduler(self: Arc<Self>) -> Result<Option<JobScheduler>> {
        if !self.config.scheduler_enabled {
            return Ok(None);
        }

        let sched = JobScheduler::new().await.context("creating scheduler")?;
        let interval = self.config.sync_interval;
        let pipeline = self;
        let job = Job::new_repeated_async(interval, move |_uuid, _lock| {
            let pipeline = Arc::clone(&pipeline);
            Box::pin(async move {
                if let Some(Err(err)) = pipeline.run_if_idle().await {
                    error!(error = ?err, "scheduled inventory sync failed");
                }
            })
        })
        .with_context(|| format!("creating sync job every {}s", interval.as_secs()))?;
        sched.add(job).await.context("adding sync job")?;
        info!(every_secs = interval.as_secs(), "inventory sync scheduled");
        Ok(Some(sched))
    }
}
