//! Listing source contract + fixture-first and HTTP feed implementations.

mod http;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use bidtrack_core::{ObservedCompletion, ObservedListing};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

pub use http::{is_transient_status, FeedClientConfig, HttpListingSource};

pub const CRATE_NAME: &str = "bidtrack-adapters";

pub const ACTIVE_SNAPSHOT: &str = "active.json";
pub const COMPLETED_SNAPSHOT: &str = "completed.json";

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("request failed after retries: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("invalid feed url {url}: {detail}")]
    InvalidUrl { url: String, detail: String },
    #[error("decoding {what}: {source}")]
    Decode {
        what: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("reading {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Where observations come from. Implementations hand back records already
/// shaped for the reconciler. A failed fetch or a body that is not a JSON
/// array fails the whole call; a single record that does not decode is
/// logged and left out.
#[async_trait]
pub trait ListingSource: Send + Sync {
    fn source_id(&self) -> &'static str;

    async fn fetch_active(
        &self,
        pattern: &str,
        lookahead_hours: u32,
    ) -> Result<Vec<ObservedListing>, SourceError>;

    async fn fetch_completed(&self, lookback_hours: u32) -> Result<Vec<ObservedCompletion>, SourceError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    Fixture,
    Http,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SourceSettings {
    pub kind: SourceKind,
    pub fixture_dir: Option<PathBuf>,
    pub base_url: Option<String>,
    pub user_agent: String,
    pub request_delay_secs: u64,
    pub timeout_secs: u64,
    pub excluded_terms: Vec<String>,
}

impl Default for SourceSettings {
    fn default() -> Self {
        Self {
            kind: SourceKind::Fixture,
            fixture_dir: Some(PathBuf::from("fixtures/sample")),
            base_url: None,
            user_agent: "bidtrack/0.1".to_string(),
            request_delay_secs: 2,
            timeout_secs: 20,
            excluded_terms: ["broken", "not working", "for parts", "repair", "faulty"]
                .into_iter()
                .map(String::from)
                .collect(),
        }
    }
}

/// Title terms that disqualify a listing, compared case-insensitively.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExcludedTerms(Vec<String>);

impl ExcludedTerms {
    pub fn new<I, S>(terms: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self(
            terms
                .into_iter()
                .map(|t| t.as_ref().trim().to_lowercase())
                .filter(|t| !t.is_empty())
                .collect(),
        )
    }

    pub fn matches(&self, title: &str) -> bool {
        let title = title.to_lowercase();
        self.0.iter().any(|term| title.contains(term.as_str()))
    }

    pub fn retain(&self, listings: Vec<ObservedListing>) -> Vec<ObservedListing> {
        let before = listings.len();
        let kept: Vec<_> = listings
            .into_iter()
            .filter(|listing| {
                let excluded = self.matches(&listing.title);
                if excluded {
                    debug!(item_id = %listing.item_id, "listing dropped by excluded term");
                }
                !excluded
            })
            .collect();
        if kept.len() < before {
            debug!(dropped = before - kept.len(), "excluded-term filter applied");
        }
        kept
    }
}

/// True when every whitespace-separated term of `pattern` occurs in `title`.
pub fn title_matches_pattern(title: &str, pattern: &str) -> bool {
    let title = title.to_lowercase();
    pattern
        .split_whitespace()
        .all(|term| title.contains(&term.to_lowercase()))
}

/// Stamp the requested pattern onto listings that did not carry one.
pub(crate) fn stamp_pattern(listings: &mut [ObservedListing], pattern: &str) {
    for listing in listings.iter_mut().filter(|l| l.search_pattern.trim().is_empty()) {
        listing.search_pattern = pattern.to_string();
    }
}

/// Decode a JSON array record by record. Elements that do not fit `T` are
/// logged with their `item_id` and dropped.
pub(crate) fn decode_records<T: DeserializeOwned>(body: &[u8], what: &str) -> Result<Vec<T>, SourceError> {
    let raw: Vec<serde_json::Value> = serde_json::from_slice(body).map_err(|source| SourceError::Decode {
        what: what.to_string(),
        source,
    })?;
    let total = raw.len();
    let mut records = Vec::with_capacity(total);
    for (index, value) in raw.into_iter().enumerate() {
        let item_id = value
            .get("item_id")
            .and_then(serde_json::Value::as_str)
            .unwrap_or_default()
            .to_string();
        match serde_json::from_value(value) {
            Ok(record) => records.push(record),
            Err(err) => warn!(what, index, item_id = %item_id, error = %err, "record skipped: does not decode"),
        }
    }
    if records.len() < total {
        warn!(what, skipped = total - records.len(), kept = records.len(), "batch decoded with skipped records");
    }
    Ok(records)
}

/// Replays `active.json` / `completed.json` snapshots from a directory. The
/// files are re-read on every call so they can be swapped between cycles.
/// Time windows are not applied to snapshot data.
#[derive(Debug, Clone)]
pub struct FixtureListingSource {
    dir: PathBuf,
    excluded: ExcludedTerms,
}

impl FixtureListingSource {
    pub fn new(dir: impl Into<PathBuf>, excluded: ExcludedTerms) -> Self {
        Self {
            dir: dir.into(),
            excluded,
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    async fn read_snapshot<T: DeserializeOwned>(&self, name: &str) -> Result<Vec<T>, SourceError> {
        let path = self.dir.join(name);
        let data = match tokio::fs::read(&path).await {
            Ok(data) => data,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                warn!(path = %path.display(), "fixture snapshot missing; treating as empty");
                return Ok(Vec::new());
            }
            Err(source) => return Err(SourceError::Io { path, source }),
        };
        decode_records(&data, &path.display().to_string())
    }
}

#[async_trait]
impl ListingSource for FixtureListingSource {
    fn source_id(&self) -> &'static str {
        "fixture"
    }

    async fn fetch_active(
        &self,
        pattern: &str,
        _lookahead_hours: u32,
    ) -> Result<Vec<ObservedListing>, SourceError> {
        let mut listings: Vec<ObservedListing> = self.read_snapshot(ACTIVE_SNAPSHOT).await?;
        listings.retain(|l| title_matches_pattern(&l.title, pattern));
        stamp_pattern(&mut listings, pattern);
        Ok(self.excluded.retain(listings))
    }

    async fn fetch_completed(&self, _lookback_hours: u32) -> Result<Vec<ObservedCompletion>, SourceError> {
        self.read_snapshot(COMPLETED_SNAPSHOT).await
    }
}

/// Build the listing source the settings ask for.
pub fn source_from_settings(settings: &SourceSettings) -> anyhow::Result<Arc<dyn ListingSource>> {
    let excluded = ExcludedTerms::new(&settings.excluded_terms);
    match settings.kind {
        SourceKind::Fixture => {
            let dir = settings
                .fixture_dir
                .clone()
                .context("source.fixture_dir is required for the fixture source")?;
            Ok(Arc::new(FixtureListingSource::new(dir, excluded)))
        }
        SourceKind::Http => {
            let base_url = settings
                .base_url
                .clone()
                .context("source.base_url is required for the http source")?;
            let config = FeedClientConfig {
                timeout: Duration::from_secs(settings.timeout_secs),
                user_agent: settings.user_agent.clone(),
                request_spacing: Duration::from_secs(settings.request_delay_secs),
                ..Default::default()
            };
            Ok(Arc::new(HttpListingSource::new(base_url, config, excluded)?))
        }
    }
}
