//! Core domain model for reviewdeck.

use std::fmt;

use chrono::{DateTime, Datelike, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

pub const CRATE_NAME: &str = "rdk-core";

/// The two external review platforms we ingest from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Source {
    #[serde(rename = "app-store")]
    AppStore,
    #[serde(rename = "play-store")]
    PlayStore,
}

impl Source {
    /// Prefix baked into review ids so ids never collide across sources.
    pub fn id_prefix(self) -> &'static str {
        match self {
            Source::AppStore => "as",
            Source::PlayStore => "ps",
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Source::AppStore => "app-store",
            Source::PlayStore => "play-store",
        }
    }
}

impl fmt::Display for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Refresh cadence configured per source on an app.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Frequency {
    Hourly,
    Daily,
    Weekly,
    Monthly,
}

impl Frequency {
    /// Minimum elapsed hours before another scheduled scrape is due.
    pub fn threshold_hours(self) -> i64 {
        match self {
            Frequency::Hourly => 1,
            Frequency::Daily => 24,
            Frequency::Weekly => 168,
            Frequency::Monthly => 720,
        }
    }
}

/// A monitored app plus its rolling derived stats.
///
/// Invariant: a source's region list and frequency are populated iff that
/// source's external id is set; `source_enabled` is the canonical check.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct App {
    pub id: String,
    pub name: String,
    pub icon: Option<String>,
    pub app_store_id: Option<String>,
    pub play_store_id: Option<String>,
    #[serde(default)]
    pub app_store_regions: Vec<String>,
    #[serde(default)]
    pub play_store_regions: Vec<String>,
    pub app_store_frequency: Option<Frequency>,
    pub play_store_frequency: Option<Frequency>,
    pub rating: f64,
    pub review_count: u64,
    pub last_updated: Option<DateTime<Utc>>,
}

impl App {
    pub fn external_id(&self, source: Source) -> Option<&str> {
        match source {
            Source::AppStore => self.app_store_id.as_deref(),
            Source::PlayStore => self.play_store_id.as_deref(),
        }
    }

    pub fn regions(&self, source: Source) -> &[String] {
        match source {
            Source::AppStore => &self.app_store_regions,
            Source::PlayStore => &self.play_store_regions,
        }
    }

    pub fn frequency(&self, source: Source) -> Option<Frequency> {
        match source {
            Source::AppStore => self.app_store_frequency,
            Source::PlayStore => self.play_store_frequency,
        }
    }

    pub fn source_enabled(&self, source: Source) -> bool {
        self.external_id(source).is_some() && !self.regions(source).is_empty()
    }
}

/// A single canonical user review.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Review {
    pub id: String,
    pub app_id: String,
    pub app_name: String,
    pub user_name: String,
    pub rating: u8,
    pub text: String,
    pub date: DateTime<Utc>,
    pub store: Source,
    pub region: String,
    pub version: String,
}

impl Review {
    /// Content fingerprint used for cross-scrape dedup. Some sources mint
    /// unstable ids across repeated scrapes of the same underlying review, so
    /// two reviews with identical (user, rating, text, version) are treated
    /// as the same review even when their ids differ.
    pub fn fingerprint(&self) -> String {
        let mut hasher = Sha256::new();
        for part in [
            self.user_name.as_str(),
            &self.rating.to_string(),
            &self.text,
            &self.version,
        ] {
            hasher.update(part.as_bytes());
            hasher.update([0u8]);
        }
        hex::encode(hasher.finalize())
    }
}

/// One month bucket of per-source average ratings. Fully recomputed from the
/// review set, never incrementally patched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RatingHistoryPoint {
    /// First-of-month ISO timestamp, e.g. `2024-01-01T00:00:00.000Z`.
    pub date: String,
    pub app_store: f64,
    pub play_store: f64,
}

/// Review count for one region, for the distribution chart.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegionCount {
    pub name: String,
    pub value: u64,
}

/// Global dashboard rollup. The trend strings are a superficial summary and
/// not part of the core contract.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Stats {
    pub total_apps: u64,
    pub total_reviews: u64,
    pub average_rating: f64,
    pub apps_trend: String,
    pub reviews_trend: String,
    pub rating_trend: String,
    pub apps_trend_up: bool,
    pub reviews_trend_up: bool,
    pub rating_trend_up: bool,
}

/// A configured region: either a bare country code (`US`) or a compound
/// `language-COUNTRY` code (`en-US`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegionCode {
    pub language: Option<String>,
    pub country: String,
}

impl RegionCode {
    pub fn parse(raw: &str) -> Self {
        match raw.split_once('-') {
            Some((language, country)) if !language.is_empty() && !country.is_empty() => Self {
                language: Some(language.to_ascii_lowercase()),
                country: country.to_string(),
            },
            _ => Self {
                language: None,
                country: raw.to_string(),
            },
        }
    }
}

/// `YYYY-MM` bucket key for a review date.
pub fn month_key(date: &DateTime<Utc>) -> String {
    format!("{:04}-{:02}", date.year(), date.month())
}

/// First-of-month timestamp for a `YYYY-MM` key, in the stored history format.
pub fn month_bucket_date(key: &str) -> String {
    format!("{key}-01T00:00:00.000Z")
}

/// Millisecond-precision UTC timestamp, the display format used across the
/// read surface and CSV export.
pub fn iso_millis(date: &DateTime<Utc>) -> String {
    date.to_rfc3339_opts(SecondsFormat::Millis, true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn review(user: &str, rating: u8, text: &str, version: &str) -> Review {
        Review {
            id: "as-1".to_string(),
            app_id: "app".to_string(),
            app_name: "App".to_string(),
            user_name: user.to_string(),
            rating,
            text: text.to_string(),
            date: Utc.with_ymd_and_hms(2024, 1, 5, 12, 0, 0).single().unwrap(),
            store: Source::AppStore,
            region: "US".to_string(),
            version: version.to_string(),
        }
    }

    #[test]
    fn frequency_thresholds() {
        assert_eq!(Frequency::Hourly.threshold_hours(), 1);
        assert_eq!(Frequency::Daily.threshold_hours(), 24);
        assert_eq!(Frequency::Weekly.threshold_hours(), 168);
        assert_eq!(Frequency::Monthly.threshold_hours(), 720);
    }

    #[test]
    fn compound_region_splits_into_language_and_country() {
        let region = RegionCode::parse("en-US");
        assert_eq!(region.language.as_deref(), Some("en"));
        assert_eq!(region.country, "US");
    }

    #[test]
    fn bare_region_has_no_language() {
        let region = RegionCode::parse("US");
        assert_eq!(region.language, None);
        assert_eq!(region.country, "US");
    }

    #[test]
    fn fingerprint_matches_on_equal_content_despite_ids() {
        let a = review("alice", 5, "great app", "2.1");
        let mut b = review("alice", 5, "great app", "2.1");
        b.id = "as-other".to_string();
        assert_eq!(a.fingerprint(), b.fingerprint());
    }

    #[test]
    fn fingerprint_differs_when_any_component_differs() {
        let base = review("alice", 5, "great app", "2.1");
        assert_ne!(base.fingerprint(), review("bob", 5, "great app", "2.1").fingerprint());
        assert_ne!(base.fingerprint(), review("alice", 4, "great app", "2.1").fingerprint());
        assert_ne!(base.fingerprint(), review("alice", 5, "bad app", "2.1").fingerprint());
        assert_ne!(base.fingerprint(), review("alice", 5, "great app", "2.2").fingerprint());
    }

    #[test]
    fn month_bucketing_formats() {
        let date = Utc.with_ymd_and_hms(2024, 1, 28, 23, 59, 0).single().unwrap();
        assert_eq!(month_key(&date), "2024-01");
        assert_eq!(month_bucket_date("2024-01"), "2024-01-01T00:00:00.000Z");
    }

    #[test]
    fn app_json_uses_dashboard_field_names() {
        let app = App {
            id: "1".to_string(),
            name: "Demo".to_string(),
            icon: None,
            app_store_id: Some("123".to_string()),
            play_store_id: None,
            app_store_regions: vec!["US".to_string()],
            play_store_regions: vec![],
            app_store_frequency: Some(Frequency::Daily),
            play_store_frequency: None,
            rating: 4.5,
            review_count: 10,
            last_updated: None,
        };
        let value = serde_json::to_value(&app).unwrap();
        assert_eq!(value["appStoreId"], "123");
        assert_eq!(value["appStoreFrequency"], "daily");
        assert_eq!(value["reviewCount"], 10);
    }

    #[test]
    fn review_store_tag_serializes_with_dash() {
        let r = review("alice", 5, "x", "1.0");
        let value = serde_json::to_value(&r).unwrap();
        assert_eq!(value["store"], "app-store");
        assert_eq!(value["userName"], "alice");
    }
}
