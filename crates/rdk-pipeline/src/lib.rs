//! Ingestion pipeline, aggregator, scheduler and the typed repository over
//! the raw kv store.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use rdk_adapters::{fetch_reviews, ReviewSource};
use rdk_core::{
    month_bucket_date, month_key, App, Frequency, RatingHistoryPoint, RegionCount, Review, Source,
    Stats,
};
use rdk_store::{append_chunked, KvStore, ListPager, StoreError, LIST_PAGE_SIZE, MAX_APPEND_BYTES};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{info, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "rdk-pipeline";

pub const APPS_HASH: &str = "apps";

pub fn reviews_key(app_id: &str) -> String {
    format!("reviews:{app_id}")
}

pub fn rating_history_key(app_id: &str) -> String {
    format!("rating_history:{app_id}")
}

pub fn region_distribution_key(app_id: &str) -> String {
    format!("region_distribution:{app_id}")
}

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("app {0} not found")]
    AppNotFound(String),
    #[error("invalid app config: {0}")]
    InvalidConfig(String),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Typed read/write layer over the raw kv store. This is the single
/// serialization boundary: values are encoded exactly once on the way in and
/// decoded exactly once on the way out, and any record that fails to decode
/// is logged and treated as absent so one corrupt entry never takes down a
/// list or aggregate read.
#[derive(Clone)]
pub struct Repository {
    store: Arc<dyn KvStore>,
}

impl Repository {
    pub fn new(store: Arc<dyn KvStore>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<dyn KvStore> {
        &self.store
    }

    pub async fn get_app(&self, id: &str) -> Result<Option<App>, StoreError> {
        let Some(raw) = self.store.hash_get(APPS_HASH, id).await? else {
            return Ok(None);
        };
        match serde_json::from_str(&raw) {
            Ok(app) => Ok(Some(app)),
            Err(err) => {
                warn!(app_id = id, error = %err, "corrupt app record; treating as absent");
                Ok(None)
            }
        }
    }

    pub async fn get_all_apps(&self) -> Result<Vec<App>, StoreError> {
        let entries = self.store.hash_get_all(APPS_HASH).await?;
        let mut apps = Vec::with_capacity(entries.len());
        for (id, raw) in entries {
            match serde_json::from_str(&raw) {
                Ok(app) => apps.push(app),
                Err(err) => warn!(app_id = %id, error = %err, "corrupt app record; skipping"),
            }
        }
        Ok(apps)
    }

    pub async fn put_app(&self, app: &App) -> Result<(), StoreError> {
        let raw = serde_json::to_string(app)?;
        self.store.hash_set(APPS_HASH, &app.id, raw).await
    }

    /// Delete an app and cascade to its reviews and derived aggregates.
    pub async fn delete_app(&self, id: &str) -> Result<(), StoreError> {
        self.store.hash_delete(APPS_HASH, id).await?;
        self.store.delete(&reviews_key(id)).await?;
        self.store.delete(&rating_history_key(id)).await?;
        self.store.delete(&region_distribution_key(id)).await?;
        Ok(())
    }

    /// Full paged read of an app's review list. Corrupt entries are skipped.
    pub async fn read_reviews(&self, app_id: &str) -> Result<Vec<Review>, StoreError> {
        let key = reviews_key(app_id);
        let mut pager = ListPager::new(self.store.as_ref(), key.clone(), LIST_PAGE_SIZE);
        let mut reviews = Vec::new();
        while let Some(page) = pager.next_page().await? {
            for raw in page {
                match serde_json::from_str(&raw) {
                    Ok(review) => reviews.push(review),
                    Err(err) => warn!(key = %key, error = %err, "corrupt review entry; skipping"),
                }
            }
        }
        Ok(reviews)
    }

    pub async fn append_reviews(&self, app_id: &str, reviews: &[Review]) -> Result<(), StoreError> {
        let mut items = Vec::with_capacity(reviews.len());
        for review in reviews {
            items.push(serde_json::to_string(review)?);
        }
        append_chunked(
            self.store.as_ref(),
            &reviews_key(app_id),
            items,
            MAX_APPEND_BYTES,
        )
        .await
    }

    pub async fn rating_history(&self, app_id: &str) -> Result<Vec<RatingHistoryPoint>, StoreError> {
        self.read_scalar_vec(&rating_history_key(app_id)).await
    }

    pub async fn set_rating_history(
        &self,
        app_id: &str,
        history: &[RatingHistoryPoint],
    ) -> Result<(), StoreError> {
        let raw = serde_json::to_string(history)?;
        self.store.scalar_set(&rating_history_key(app_id), raw).await
    }

    pub async fn region_distribution(&self, app_id: &str) -> Result<Vec<RegionCount>, StoreError> {
        self.read_scalar_vec(&region_distribution_key(app_id)).await
    }

    pub async fn set_region_distribution(
        &self,
        app_id: &str,
        distribution: &[RegionCount],
    ) -> Result<(), StoreError> {
        let raw = serde_json::to_string(distribution)?;
        self.store
            .scalar_set(&region_distribution_key(app_id), raw)
            .await
    }

    async fn read_scalar_vec<T: serde::de::DeserializeOwned>(
        &self,
        key: &str,
    ) -> Result<Vec<T>, StoreError> {
        let Some(raw) = self.store.scalar_get(key).await? else {
            return Ok(Vec::new());
        };
        match serde_json::from_str(&raw) {
            Ok(items) => Ok(items),
            Err(err) => {
                warn!(key, error = %err, "corrupt derived record; returning empty");
                Ok(Vec::new())
            }
        }
    }

    /// Registry create: assigns an id, zeroes derived fields and stamps
    /// `lastUpdated`. Enforces the per-source invariant: regions and
    /// frequency travel with the external id or not at all.
    pub async fn create_app(&self, new: NewApp) -> Result<App, PipelineError> {
        if new.app_store_id.is_none() && new.play_store_id.is_none() {
            return Err(PipelineError::InvalidConfig(
                "at least one of appStoreId / playStoreId is required".to_string(),
            ));
        }
        let mut app = App {
            id: Uuid::new_v4().to_string(),
            name: new.name,
            icon: new.icon,
            app_store_id: new.app_store_id,
            play_store_id: new.play_store_id,
            app_store_regions: new.app_store_regions,
            play_store_regions: new.play_store_regions,
            app_store_frequency: new.app_store_frequency,
            play_store_frequency: new.play_store_frequency,
            rating: 0.0,
            review_count: 0,
            last_updated: Some(Utc::now()),
        };
        normalize_source_config(&mut app);
        self.put_app(&app).await?;
        Ok(app)
    }

    /// Registry update; stamps `lastUpdated` as a config edit. Enforces the
    /// same at-least-one-external-id rule as `create_app`.
    pub async fn update_app(&self, mut app: App) -> Result<App, PipelineError> {
        if app.app_store_id.is_none() && app.play_store_id.is_none() {
            return Err(PipelineError::InvalidConfig(
                "at least one of appStoreId / playStoreId is required".to_string(),
            ));
        }
        if self.get_app(&app.id).await?.is_none() {
            return Err(PipelineError::AppNotFound(app.id));
        }
        normalize_source_config(&mut app);
        app.last_updated = Some(Utc::now());
        self.put_app(&app).await?;
        Ok(app)
    }

    /// All apps' reviews merged, newest first, truncated to `limit`.
    pub async fn recent_reviews(&self, limit: usize) -> Result<Vec<Review>, StoreError> {
        let apps = self.get_all_apps().await?;
        let mut all = Vec::new();
        for app in &apps {
            all.extend(self.read_reviews(&app.id).await?);
        }
        all.sort_by(|a, b| b.date.cmp(&a.date));
        all.truncate(limit);
        Ok(all)
    }

    /// Global rollup. The trend strings are a deliberately superficial
    /// summary kept for the dashboard cards.
    pub async fn stats(&self) -> Result<Stats, StoreError> {
        let apps = self.get_all_apps().await?;
        let mut total_reviews = 0u64;
        let mut total_rating = 0u64;
        for app in &apps {
            let reviews = self.read_reviews(&app.id).await?;
            total_reviews += reviews.len() as u64;
            total_rating += reviews.iter().map(|r| r.rating as u64).sum::<u64>();
        }
        let average_rating = if total_reviews > 0 {
            total_rating as f64 / total_reviews as f64
        } else {
            0.0
        };
        Ok(Stats {
            total_apps: apps.len() as u64,
            total_reviews,
            average_rating,
            apps_trend: "+1 this week".to_string(),
            reviews_trend: format!("+{} this week", total_reviews / 10),
            rating_trend: "-0.1 this week".to_string(),
            apps_trend_up: true,
            reviews_trend_up: true,
            rating_trend_up: false,
        })
    }
}

/// New-app payload accepted by the registry.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewApp {
    pub name: String,
    #[serde(default)]
    pub icon: Option<String>,
    #[serde(default)]
    pub app_store_id: Option<String>,
    #[serde(default)]
    pub play_store_id: Option<String>,
    #[serde(default)]
    pub app_store_regions: Vec<String>,
    #[serde(default)]
    pub play_store_regions: Vec<String>,
    #[serde(default)]
    pub app_store_frequency: Option<Frequency>,
    #[serde(default)]
    pub play_store_frequency: Option<Frequency>,
}

fn normalize_source_config(app: &mut App) {
    if app.app_store_id.is_none() {
        app.app_store_regions.clear();
        app.app_store_frequency = None;
    }
    if app.play_store_id.is_none() {
        app.play_store_regions.clear();
        app.play_store_frequency = None;
    }
}

/// Arithmetic mean of all review ratings; 0 for an empty set.
pub fn mean_rating(reviews: &[Review]) -> f64 {
    if reviews.is_empty() {
        return 0.0;
    }
    let total: u64 = reviews.iter().map(|r| r.rating as u64).sum();
    total as f64 / reviews.len() as f64
}

fn mean_of(ratings: &[u8]) -> f64 {
    if ratings.is_empty() {
        return 0.0;
    }
    let total: u64 = ratings.iter().map(|&r| r as u64).sum();
    total as f64 / ratings.len() as f64
}

/// Month buckets of per-source mean ratings, ascending by month. A source
/// with no reviews in a bucketed month scores 0 for that month.
pub fn rating_history(reviews: &[Review]) -> Vec<RatingHistoryPoint> {
    let mut buckets: BTreeMap<String, (Vec<u8>, Vec<u8>)> = BTreeMap::new();
    for review in reviews {
        let bucket = buckets.entry(month_key(&review.date)).or_default();
        match review.store {
            Source::AppStore => bucket.0.push(review.rating),
            Source::PlayStore => bucket.1.push(review.rating),
        }
    }
    buckets
        .into_iter()
        .map(|(month, (app_store, play_store))| RatingHistoryPoint {
            date: month_bucket_date(&month),
            app_store: mean_of(&app_store),
            play_store: mean_of(&play_store),
        })
        .collect()
}

/// Per-region review counts, descending by count (name ascending on ties).
pub fn region_distribution(reviews: &[Review]) -> Vec<RegionCount> {
    let mut counts: HashMap<&str, u64> = HashMap::new();
    for review in reviews {
        *counts.entry(review.region.as_str()).or_default() += 1;
    }
    let mut distribution: Vec<RegionCount> = counts
        .into_iter()
        .map(|(name, value)| RegionCount {
            name: name.to_string(),
            value,
        })
        .collect();
    distribution.sort_by(|a, b| b.value.cmp(&a.value).then(a.name.cmp(&b.name)));
    distribution
}

/// Drop candidates already present in the store or duplicated within the
/// batch. Two-level key: exact id, or the content fingerprint — identical
/// (user, rating, text, version) tuples are treated as the same review even
/// under different ids.
pub fn dedup_candidates(candidates: Vec<Review>, existing: &[Review]) -> Vec<Review> {
    let mut seen_ids: HashSet<String> = existing.iter().map(|r| r.id.clone()).collect();
    let mut seen_prints: HashSet<String> = existing.iter().map(Review::fingerprint).collect();
    let mut fresh = Vec::new();
    for candidate in candidates {
        let print = candidate.fingerprint();
        if seen_ids.contains(&candidate.id) || seen_prints.contains(&print) {
            continue;
        }
        seen_ids.insert(candidate.id.clone());
        seen_prints.insert(print);
        fresh.push(candidate);
    }
    fresh
}

/// Whether a scheduled refresh is due. No recorded run is always due.
pub fn is_due(
    frequency: Frequency,
    last_updated: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
) -> bool {
    match last_updated {
        None => true,
        Some(last) => now - last >= ChronoDuration::hours(frequency.threshold_hours()),
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IngestSummary {
    pub app_id: String,
    pub candidates: usize,
    pub reviews_added: usize,
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ScheduleRunSummary {
    pub apps_checked: usize,
    pub tasks_run: usize,
    pub reviews_added: usize,
    pub failures: usize,
}

/// Ad-hoc scrape request for a configuration that need not be persisted.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AdhocScrapeConfig {
    #[serde(default)]
    pub app_store_id: Option<String>,
    #[serde(default)]
    pub play_store_id: Option<String>,
    #[serde(default)]
    pub app_store_regions: Vec<String>,
    #[serde(default)]
    pub play_store_regions: Vec<String>,
}

/// Orchestrates adapters per app per configured region, dedups against the
/// growing review store, appends survivors and recomputes aggregates.
pub struct Pipeline {
    repo: Repository,
    app_source: Arc<dyn ReviewSource>,
    play_source: Arc<dyn ReviewSource>,
    app_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl Pipeline {
    pub fn new(
        repo: Repository,
        app_source: Arc<dyn ReviewSource>,
        play_source: Arc<dyn ReviewSource>,
    ) -> Self {
        Self {
            repo,
            app_source,
            play_source,
            app_locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn repo(&self) -> &Repository {
        &self.repo
    }

    fn source(&self, store: Source) -> &Arc<dyn ReviewSource> {
        match store {
            Source::AppStore => &self.app_source,
            Source::PlayStore => &self.play_source,
        }
    }

    /// Per-app mutual-exclusion token: append + recompute for one app never
    /// overlap, while different apps proceed concurrently.
    async fn app_lock(&self, app_id: &str) -> Arc<Mutex<()>> {
        let mut locks = self.app_locks.lock().await;
        locks
            .entry(app_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Run one ingestion for a registered app. Zero new reviews after dedup
    /// is a normal outcome, not an error.
    pub async fn ingest(&self, app_id: &str, full_scrape: bool) -> Result<IngestSummary, PipelineError> {
        let app = self
            .repo
            .get_app(app_id)
            .await?
            .ok_or_else(|| PipelineError::AppNotFound(app_id.to_string()))?;

        let candidates = self.collect_candidates(&app, full_scrape).await;
        let candidate_count = candidates.len();

        let lock = self.app_lock(app_id).await;
        let _guard = lock.lock().await;

        let existing = self.repo.read_reviews(app_id).await?;
        let fresh = dedup_candidates(candidates, &existing);
        let reviews_added = fresh.len();
        if !fresh.is_empty() {
            self.repo.append_reviews(app_id, &fresh).await?;
        }
        self.recompute_locked(app_id).await?;

        info!(app_id, candidates = candidate_count, reviews_added, "ingestion run complete");
        Ok(IngestSummary {
            app_id: app_id.to_string(),
            candidates: candidate_count,
            reviews_added,
        })
    }

    async fn collect_candidates(&self, app: &App, full_scrape: bool) -> Vec<Review> {
        let mut candidates = Vec::new();
        for store in [Source::AppStore, Source::PlayStore] {
            if !app.source_enabled(store) {
                continue;
            }
            let external_id = app.external_id(store).unwrap_or_default().to_string();
            for region in app.regions(store) {
                let mut reviews =
                    fetch_reviews(self.source(store).as_ref(), &external_id, region, full_scrape)
                        .await;
                for review in &mut reviews {
                    review.app_id = app.id.clone();
                    review.app_name = app.name.clone();
                }
                candidates.extend(reviews);
            }
        }
        candidates
    }

    /// Recompute an app's derived aggregates from its full review set.
    pub async fn recompute(&self, app_id: &str) -> Result<(), PipelineError> {
        let lock = self.app_lock(app_id).await;
        let _guard = lock.lock().await;
        self.recompute_locked(app_id).await
    }

    // Caller holds the app lock.
    async fn recompute_locked(&self, app_id: &str) -> Result<(), PipelineError> {
        let app = self
            .repo
            .get_app(app_id)
            .await?
            .ok_or_else(|| PipelineError::AppNotFound(app_id.to_string()))?;
        let reviews = self.repo.read_reviews(app_id).await?;

        let updated = App {
            rating: mean_rating(&reviews),
            review_count: reviews.len() as u64,
            last_updated: Some(Utc::now()),
            ..app
        };
        let history = rating_history(&reviews);
        let distribution = region_distribution(&reviews);

        self.repo.put_app(&updated).await?;
        self.repo.set_rating_history(app_id, &history).await?;
        self.repo.set_region_distribution(app_id, &distribution).await?;
        Ok(())
    }

    /// Scrape an arbitrary, not-necessarily-persisted configuration at full
    /// volume and report how many reviews came back. Nothing is stored.
    pub async fn scrape_adhoc(&self, config: &AdhocScrapeConfig) -> usize {
        let mut count = 0;
        if let Some(id) = &config.app_store_id {
            for region in &config.app_store_regions {
                count += fetch_reviews(self.app_source.as_ref(), id, region, true).await.len();
            }
        }
        if let Some(id) = &config.play_store_id {
            for region in &config.play_store_regions {
                count += fetch_reviews(self.play_source.as_ref(), id, region, true).await.len();
            }
        }
        count
    }

    /// Evaluate due-ness for every app and source and run ingestion where
    /// due. One app's failure never blocks the rest of the batch.
    ///
    /// Both sources share the app's single `lastUpdated` due-clock, so one
    /// source's refresh resets the other's schedule as well; due-ness is
    /// evaluated against the snapshot loaded at the top of the run.
    pub async fn run_due_tasks(&self) -> Result<ScheduleRunSummary, PipelineError> {
        let apps = self.repo.get_all_apps().await?;
        let now = Utc::now();
        let mut summary = ScheduleRunSummary::default();

        for app in &apps {
            summary.apps_checked += 1;
            for store in [Source::AppStore, Source::PlayStore] {
                if app.external_id(store).is_none() {
                    continue;
                }
                let Some(frequency) = app.frequency(store) else {
                    continue;
                };
                if !is_due(frequency, app.last_updated, now) {
                    continue;
                }
                match self.ingest(&app.id, false).await {
                    Ok(outcome) => {
                        summary.tasks_run += 1;
                        summary.reviews_added += outcome.reviews_added;
                        info!(
                            app_id = %app.id,
                            store = %store,
                            reviews_added = outcome.reviews_added,
                            "scheduled ingestion complete"
                        );
                    }
                    Err(err) => {
                        summary.failures += 1;
                        warn!(app_id = %app.id, store = %store, error = %err, "scheduled ingestion failed");
                    }
                }
            }
        }
        Ok(summary)
    }
}
