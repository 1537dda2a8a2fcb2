//! HTTP listing feed: JSON over GET, paced and retried on transient failures.

use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use bidtrack_core::{ObservedCompletion, ObservedListing};
use reqwest::{StatusCode, Url};
use serde::de::DeserializeOwned;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info_span, warn, Instrument};

use crate::{decode_records, stamp_pattern, ExcludedTerms, ListingSource, SourceError};

/// Connection, retry and pacing knobs for the listing feed.
#[derive(Debug, Clone)]
pub struct FeedClientConfig {
    pub timeout: Duration,
    pub user_agent: String,
    /// Attempts made after the first one fails transiently.
    pub max_retries: u32,
    pub retry_base: Duration,
    pub retry_cap: Duration,
    /// Minimum gap between the starts of two requests. Zero disables pacing.
    pub request_spacing: Duration,
}

impl Default for FeedClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: "bidtrack/0.1".to_string(),
            max_retries: 3,
            retry_base: Duration::from_millis(500),
            retry_cap: Duration::from_secs(10),
            request_spacing: Duration::ZERO,
        }
    }
}

impl FeedClientConfig {
    /// Wait before retry number `retry` (zero-based): doubles each time, capped.
    pub fn retry_delay(&self, retry: u32) -> Duration {
        let factor = 1u32.checked_shl(retry).unwrap_or(u32::MAX);
        self.retry_base.saturating_mul(factor).min(self.retry_cap)
    }
}

/// Throttling and server-side failures are worth another attempt.
pub fn is_transient_status(status: StatusCode) -> bool {
    status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS
}

fn is_transient_transport(err: &reqwest::Error) -> bool {
    err.is_timeout() || err.is_connect()
}

/// Holds every request until at least `spacing` has passed since the
/// previous one started.
#[derive(Debug)]
struct RequestPacer {
    spacing: Duration,
    next_slot: Mutex<Option<Instant>>,
}

impl RequestPacer {
    fn new(spacing: Duration) -> Self {
        Self {
            spacing,
            next_slot: Mutex::new(None),
        }
    }

    async fn wait_turn(&self) {
        if self.spacing.is_zero() {
            return;
        }
        let mut next_slot = self.next_slot.lock().await;
        if let Some(slot) = *next_slot {
            tokio::time::sleep_until(slot).await;
        }
        *next_slot = Some(Instant::now() + self.spacing);
    }
}

/// JSON listing feed:
/// `GET {base}/listings/active?q=&hours=` and `GET {base}/listings/completed?hours=`,
/// each answering with an array of observations.
#[derive(Debug)]
pub struct HttpListingSource {
    base_url: String,
    client: reqwest::Client,
    config: FeedClientConfig,
    pacer: RequestPacer,
    excluded: ExcludedTerms,
}

impl HttpListingSource {
    pub fn new(
        base_url: impl Into<String>,
        config: FeedClientConfig,
        excluded: ExcludedTerms,
    ) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout)
            .user_agent(config.user_agent.clone())
            .build()
            .context("building feed http client")?;
        Ok(Self {
            base_url: base_url.into(),
            client,
            pacer: RequestPacer::new(config.request_spacing),
            config,
            excluded,
        })
    }

    fn endpoint(&self, path: &str, params: &[(&str, String)]) -> Result<Url, SourceError> {
        let raw = format!("{}/{path}", self.base_url.trim_end_matches('/'));
        Url::parse_with_params(&raw, params).map_err(|err| SourceError::InvalidUrl {
            url: raw.clone(),
            detail: err.to_string(),
        })
    }

    /// One GET, returning the body of a 2xx answer or the error that
    /// ended it plus whether a retry may help.
    async fn attempt(&self, url: &Url) -> Result<Vec<u8>, (SourceError, bool)> {
        let response = match self.client.get(url.clone()).send().await {
            Ok(response) => response,
            Err(err) => {
                let transient = is_transient_transport(&err);
                return Err((SourceError::Request(err), transient));
            }
        };
        let status = response.status();
        if !status.is_success() {
            return Err((
                SourceError::HttpStatus {
                    status: status.as_u16(),
                    url: url.to_string(),
                },
                is_transient_status(status),
            ));
        }
        match response.bytes().await {
            Ok(body) => Ok(body.to_vec()),
            Err(err) => {
                let transient = is_transient_transport(&err);
                Err((SourceError::Request(err), transient))
            }
        }
    }

    async fn get_body(&self, url: &Url) -> Result<Vec<u8>, SourceError> {
        let mut retry = 0u32;
        loop {
            self.pacer.wait_turn().await;
            match self.attempt(url).await {
                Ok(body) => {
                    debug!(bytes = body.len(), retry, "feed answered");
                    return Ok(body);
                }
                Err((err, transient)) if transient && retry < self.config.max_retries => {
                    let delay = self.config.retry_delay(retry);
                    warn!(retry, delay_ms = delay.as_millis() as u64, error = %err, "feed request failed; retrying");
                    tokio::time::sleep(delay).await;
                    retry += 1;
                }
                Err((err, _)) => return Err(err),
            }
        }
    }

    async fn get_records<T: DeserializeOwned>(&self, url: Url, what: &str) -> Result<Vec<T>, SourceError> {
        let body = self
            .get_body(&url)
            .instrument(info_span!("feed_get", url = %url))
            .await?;
        decode_records(&body, &format!("{what} from {url}"))
    }
}

#[async_trait]
impl ListingSource for HttpListingSource {
    fn source_id(&self) -> &'static str {
        "http-feed"
    }

    async fn fetch_active(
        &self,
        pattern: &str,
        lookahead_hours: u32,
    ) -> Result<Vec<ObservedListing>, SourceError> {
        let url = self.endpoint(
            "listings/active",
            &[("q", pattern.to_string()), ("hours", lookahead_hours.to_string())],
        )?;
        let mut listings: Vec<ObservedListing> = self.get_records(url, "active listings").await?;
        stamp_pattern(&mut listings, pattern);
        Ok(self.excluded.retain(listings))
    }

    async fn fetch_completed(&self, lookback_hours: u32) -> Result<Vec<ObservedCompletion>, SourceError> {
        let url = self.endpoint("listings/completed", &[("hours", lookback_hours.to_string())])?;
        self.get_records(url, "completed listings").await
    }
}
