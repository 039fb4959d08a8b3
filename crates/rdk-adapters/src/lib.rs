//! Source adapters: pagination, volume caps, rate limiting and defensive
//! mapping of source-native review shapes into the canonical [`Review`].

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use rdk_core::{RegionCode, Review, Source};
use scraper::{Html, Selector};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::{info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "rdk-adapters";

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("unexpected payload: {0}")]
    Payload(String),
}

/// Outbound HTTP settings shared by both source clients.
#[derive(Debug, Clone)]
pub struct HttpConfig {
    pub timeout: Duration,
    pub user_agent: String,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: "reviewdeck/0.1".to_string(),
        }
    }
}

impl HttpConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            timeout: std::env::var("RDK_HTTP_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .map(Duration::from_secs)
                .unwrap_or(defaults.timeout),
            user_agent: std::env::var("RDK_USER_AGENT").unwrap_or(defaults.user_agent),
        }
    }
}

fn build_client(config: &HttpConfig) -> Result<reqwest::Client, SourceError> {
    Ok(reqwest::Client::builder()
        .gzip(true)
        .brotli(true)
        .timeout(config.timeout)
        .user_agent(config.user_agent.clone())
        .build()?)
}

/// One source-native review before canonical mapping. Every field is
/// optional; the mapping step fills documented defaults.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RawReview {
    pub native_id: Option<String>,
    pub user_name: Option<String>,
    pub rating: Option<u8>,
    pub text: Option<String>,
    pub date: Option<DateTime<Utc>>,
    pub version: Option<String>,
}

/// Paging profile for one source: how big a page runs, where the volume caps
/// sit, and how long to wait between page requests. The fixed inter-request
/// delay trades latency for not tripping source-side throttling.
#[derive(Debug, Clone, Copy)]
pub struct PagingProfile {
    pub page_size: usize,
    pub normal_cap: usize,
    pub full_cap: usize,
    pub request_delay: Duration,
}

pub const APP_STORE_PAGING: PagingProfile = PagingProfile {
    page_size: 50,
    normal_cap: 100,
    full_cap: 3000,
    request_delay: Duration::from_millis(500),
};

pub const PLAY_STORE_PAGING: PagingProfile = PagingProfile {
    page_size: 150,
    normal_cap: 100,
    full_cap: 6000,
    request_delay: Duration::from_millis(500),
};

/// Page-oriented contract wrapping one external review platform.
#[async_trait]
pub trait ReviewSource: Send + Sync {
    fn store(&self) -> Source;
    fn paging(&self) -> PagingProfile;

    /// Fetch one zero-indexed page of source-native reviews. An empty page
    /// means the source has no more data for this (app, region) pair.
    async fn fetch_page(
        &self,
        external_id: &str,
        region: &RegionCode,
        page: usize,
    ) -> Result<Vec<RawReview>, SourceError>;
}

/// Fetch all reviews for one (app, region) pair, paginating until the source
/// runs dry, a page undershoots the source's page size, or the volume cap is
/// hit. Never fails: transport/parse errors are logged and yield an empty
/// collection so sibling region/source fetches are unaffected.
pub async fn fetch_reviews(
    source: &dyn ReviewSource,
    external_id: &str,
    region: &str,
    full_scrape: bool,
) -> Vec<Review> {
    match paged_fetch(source, external_id, region, full_scrape).await {
        Ok(reviews) => reviews,
        Err(err) => {
            warn!(
                store = %source.store(),
                external_id,
                region,
                error = %err,
                "source fetch failed; returning no reviews"
            );
            Vec::new()
        }
    }
}

async fn paged_fetch(
    source: &dyn ReviewSource,
    external_id: &str,
    region: &str,
    full_scrape: bool,
) -> Result<Vec<Review>, SourceError> {
    let paging = source.paging();
    let cap = if full_scrape {
        paging.full_cap
    } else {
        paging.normal_cap
    };
    let region_code = RegionCode::parse(region);

    let mut out: Vec<Review> = Vec::new();
    let mut page = 0usize;
    while out.len() < cap {
        if page > 0 && !paging.request_delay.is_zero() {
            tokio::time::sleep(paging.request_delay).await;
        }
        let span = info_span!("source_fetch", store = %source.store(), external_id, region, page);
        let raw = source
            .fetch_page(external_id, &region_code, page)
            .instrument(span)
            .await?;
        let undershoot = raw.len() < paging.page_size;
        for item in raw {
            out.push(canonical_review(source.store(), region, item));
            if out.len() == cap {
                break;
            }
        }
        if undershoot {
            break;
        }
        page += 1;
    }
    Ok(out)
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|s| !s.trim().is_empty())
}

/// Map a source-native review into the canonical shape. `app_id`/`app_name`
/// are filled by the caller once the owning app is known.
pub fn canonical_review(store: Source, region: &str, raw: RawReview) -> Review {
    let user_name = non_empty(raw.user_name).unwrap_or_else(|| "Anonymous".to_string());
    let rating = raw.rating.unwrap_or(0);
    let text = raw.text.unwrap_or_default();
    let date = raw.date.unwrap_or_else(Utc::now);
    let version = non_empty(raw.version).unwrap_or_else(|| "Unknown".to_string());
    let native_id = non_empty(raw.native_id)
        .unwrap_or_else(|| fallback_native_id(store, &user_name, &text, &date));
    Review {
        id: format!("{}-{}", store.id_prefix(), native_id),
        app_id: String::new(),
        app_name: String::new(),
        user_name,
        rating,
        text,
        date,
        store,
        region: region.to_string(),
        version,
    }
}

/// Deterministic stand-in id when the source supplies none, so repeated
/// scrapes of the same review re-mint the same id.
fn fallback_native_id(store: Source, user_name: &str, text: &str, date: &DateTime<Utc>) -> String {
    let seed = format!("{}:{}:{}:{}", store.as_str(), user_name, text, date.to_rfc3339());
    Uuid::new_v5(&Uuid::NAMESPACE_OID, seed.as_bytes()).to_string()
}

// ---------------------------------------------------------------------------
// App Store client (iTunes customer-reviews RSS, JSON rendering)
// ---------------------------------------------------------------------------

pub struct AppStoreClient {
    http: reqwest::Client,
    paging: PagingProfile,
}

impl AppStoreClient {
    pub fn new(config: &HttpConfig) -> Result<Self, SourceError> {
        Ok(Self {
            http: build_client(config)?,
            paging: APP_STORE_PAGING,
        })
    }

    fn page_url(external_id: &str, country: &str, page: usize) -> String {
        // RSS pages are 1-indexed.
        format!(
            "https://itunes.apple.com/{}/rss/customerreviews/page={}/id={}/sortby=mostrecent/json",
            country.to_ascii_lowercase(),
            page + 1,
            external_id
        )
    }
}

fn json_str<'a>(value: &'a JsonValue, path: &[&str]) -> Option<&'a str> {
    let mut cur = value;
    for segment in path {
        cur = cur.get(*segment)?;
    }
    cur.as_str()
}

/// Parse one RSS feed document into raw reviews. The feed's first entry can
/// be app metadata rather than a review; anything without a rating label is
/// skipped.
pub fn parse_rss_feed(body: &str) -> Result<Vec<RawReview>, SourceError> {
    let value: JsonValue =
        serde_json::from_str(body).map_err(|e| SourceError::Payload(e.to_string()))?;
    let entries = match value.get("feed").and_then(|f| f.get("entry")) {
        Some(JsonValue::Array(items)) => items.clone(),
        Some(entry @ JsonValue::Object(_)) => vec![entry.clone()],
        _ => Vec::new(),
    };
    Ok(entries
        .iter()
        .filter_map(|entry| {
            let rating = json_str(entry, &["im:rating", "label"])?.parse::<u8>().ok()?;
            Some(RawReview {
                native_id: json_str(entry, &["id", "label"]).map(ToString::to_string),
                user_name: json_str(entry, &["author", "name", "label"]).map(ToString::to_string),
                rating: Some(rating),
                text: json_str(entry, &["content", "label"]).map(ToString::to_string),
                date: json_str(entry, &["updated", "label"])
                    .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
                    .map(|d| d.with_timezone(&Utc)),
                version: json_str(entry, &["im:version", "label"]).map(ToString::to_string),
            })
        })
        .collect())
}

#[async_trait]
impl ReviewSource for AppStoreClient {
    fn store(&self) -> Source {
        Source::AppStore
    }

    fn paging(&self) -> PagingProfile {
        self.paging
    }

    async fn fetch_page(
        &self,
        external_id: &str,
        region: &RegionCode,
        page: usize,
    ) -> Result<Vec<RawReview>, SourceError> {
        let url = Self::page_url(external_id, &region.country, page);
        let resp = self.http.get(&url).send().await?;
        let status = resp.status();
        // The feed 4xxes past its last page; treat that as end-of-data.
        if status.as_u16() == 400 || status.as_u16() == 404 {
            return Ok(Vec::new());
        }
        if !status.is_success() {
            return Err(SourceError::HttpStatus {
                status: status.as_u16(),
                url,
            });
        }
        let body = resp.text().await?;
        parse_rss_feed(&body)
    }
}

// ---------------------------------------------------------------------------
// Play Store client (details page with embedded review payload)
// ---------------------------------------------------------------------------

pub struct PlayStoreClient {
    http: reqwest::Client,
    paging: PagingProfile,
}

impl PlayStoreClient {
    pub fn new(config: &HttpConfig) -> Result<Self, SourceError> {
        Ok(Self {
            http: build_client(config)?,
            paging: PLAY_STORE_PAGING,
        })
    }

    fn details_url(external_id: &str, region: &RegionCode) -> String {
        let language = region.language.as_deref().unwrap_or("en");
        format!(
            "https://play.google.com/store/apps/details?id={}&hl={}&gl={}",
            external_id, language, region.country
        )
    }
}

fn slice_between<'a>(text: &'a str, open: &str, close: &str) -> Option<&'a str> {
    let start = text.find(open)? + open.len();
    let end = text[start..].find(close)? + start;
    Some(&text[start..end])
}

/// Pull the review tuples embedded in the details page's bootstrap script
/// blobs. Best effort: anything that does not match the expected tuple shape
/// is skipped rather than failing the page.
pub fn extract_embedded_reviews(html: &str) -> Result<Vec<RawReview>, SourceError> {
    let document = Html::parse_document(html);
    let selector = Selector::parse("script").map_err(|e| SourceError::Payload(e.to_string()))?;
    let mut out = Vec::new();
    for script in document.select(&selector) {
        let text: String = script.text().collect();
        if !text.contains("AF_initDataCallback") {
            continue;
        }
        let Some(blob) = slice_between(&text, "data:", ", sideChannel") else {
            continue;
        };
        let Ok(value) = serde_json::from_str::<JsonValue>(blob.trim()) else {
            continue;
        };
        collect_review_nodes(&value, &mut out);
    }
    Ok(out)
}

fn collect_review_nodes(value: &JsonValue, out: &mut Vec<RawReview>) {
    if let Some(raw) = review_from_node(value) {
        out.push(raw);
        return;
    }
    if let Some(items) = value.as_array() {
        for item in items {
            collect_review_nodes(item, out);
        }
    }
}

/// A review tuple looks like `[id, [author, ...], rating, _, text, [secs, ..],
/// ..., version]`; positions are stable within one payload revision.
fn review_from_node(value: &JsonValue) -> Option<RawReview> {
    let node = value.as_array()?;
    let native_id = node.first()?.as_str()?;
    let user_name = node.get(1)?.as_array()?.first()?.as_str()?;
    let rating = node.get(2)?.as_u64()?;
    if !(1..=5).contains(&rating) {
        return None;
    }
    let text = node.get(4).and_then(|v| v.as_str());
    let date = node
        .get(5)
        .and_then(|v| v.as_array())
        .and_then(|ts| ts.first())
        .and_then(|v| v.as_i64())
        .and_then(|secs| Utc.timestamp_opt(secs, 0).single());
    let version = node.get(10).and_then(|v| v.as_str());
    Some(RawReview {
        native_id: Some(native_id.to_string()),
        user_name: Some(user_name.to_string()),
        rating: Some(rating as u8),
        text: text.map(ToString::to_string),
        date,
        version: version.map(ToString::to_string),
    })
}

#[async_trait]
impl ReviewSource for PlayStoreClient {
    fn store(&self) -> Source {
        Source::PlayStore
    }

    fn paging(&self) -> PagingProfile {
        self.paging
    }

    async fn fetch_page(
        &self,
        external_id: &str,
        region: &RegionCode,
        page: usize,
    ) -> Result<Vec<RawReview>, SourceError> {
        // Continuation pages need a session token the public details page
        // does not expose; report end-of-data past the first page.
        if page > 0 {
            return Ok(Vec::new());
        }
        let url = Self::details_url(external_id, region);
        let resp = self.http.get(&url).send().await?;
        let status = resp.status();
        if status.as_u16() == 404 {
            return Ok(Vec::new());
        }
        if !status.is_success() {
            return Err(SourceError::HttpStatus {
                status: status.as_u16(),
                url,
            });
        }
        let body = resp.text().await?;
        extract_embedded_reviews(&body)
    }
}
