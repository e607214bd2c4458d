/// Source adapters for upstream observation providers.
///
/// Every provider sits behind `SourceAdapter`, which turns a site, a set of
/// measurement kinds, and a time range into normalized `Reading`s. Bad data
/// for one kind is reported against that kind alone; the other kinds from
/// the same response are still delivered. HTTP
/// adapters share one blocking `reqwest` client with an enforced timeout and
/// wrap each request in `fetch_with_retry`.
///
/// Submodules:
/// - `usgs`: USGS NWIS Instantaneous Values (discharge, gage height).
/// - `iem` : Iowa Environmental Mesonet ASOS observations (weather).

pub mod iem;
pub mod usgs;

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::logging::{self, DataSource};
use crate::model::{MeasurementKind, Reading, SourceError, TimeRange};
use crate::sites::Site;

// ---------------------------------------------------------------------------
// Adapter contract
// ---------------------------------------------------------------------------

/// A provider of timestamped readings.
///
/// Implementations must be shareable across the per-site worker threads.
pub trait SourceAdapter: Send + Sync {
    /// Short provider name, recorded as `Reading::source`.
    fn name(&self) -> &str;

    /// The kinds this provider can deliver.
    fn kinds(&self) -> &[MeasurementKind];

    /// Whether this provider has anything to offer for `site`.
    fn serves(&self, _site: &Site) -> bool {
        true
    }

    /// Readings for `site` restricted to `kinds` and `range`.
    ///
    /// `Err` means the call as a whole produced nothing: the provider was
    /// unreachable or the body was not the expected format at all.
    fn fetch(
        &self,
        site: &Site,
        kinds: &[MeasurementKind],
        range: &TimeRange,
    ) -> Result<Fetched, SourceError>;
}

/// The result of one provider call that got a readable response.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Fetched {
    pub readings: Vec<Reading>,
    /// Kinds whose data in the response could not be read, at most one
    /// entry per kind.
    pub malformed: Vec<(MeasurementKind, SourceError)>,
}

impl Fetched {
    pub fn from_readings(readings: Vec<Reading>) -> Self {
        Self {
            readings,
            malformed: Vec::new(),
        }
    }

    /// Drops readings and malformed reports outside `kinds` or `range`.
    pub fn restrict(mut self, kinds: &[MeasurementKind], range: &TimeRange) -> Self {
        self.readings
            .retain(|r| kinds.contains(&r.kind) && range.contains(r.timestamp));
        self.malformed.retain(|(kind, _)| kinds.contains(kind));
        self
    }

    /// Records a malformed-data error for `kind` unless one is already held.
    pub fn report_malformed(&mut self, kind: MeasurementKind, error: SourceError) {
        if !self.malformed.iter().any(|(k, _)| *k == kind) {
            self.malformed.push((kind, error));
        }
    }

    /// Nothing came back but some kind was reported malformed.
    pub fn is_total_loss(&self) -> bool {
        self.readings.is_empty() && !self.malformed.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Fetch configuration and retry
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FetchConfig {
    /// Per-request timeout.
    pub timeout_secs: u64,
    /// Retries after the first attempt.
    pub max_retries: u32,
    /// Backoff before the first retry; doubles on each further retry.
    pub initial_backoff_ms: u64,
    /// How far back to fetch for a site with no recorded history.
    pub backfill_hours: i64,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 30,
            max_retries: 3,
            initial_backoff_ms: 500,
            backfill_hours: 168,
        }
    }
}

impl FetchConfig {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.max_retries,
            initial_backoff: Duration::from_millis(self.initial_backoff_ms),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub initial_backoff: Duration,
}

impl RetryPolicy {
    const MAX_BACKOFF: Duration = Duration::from_secs(30);

    /// A single attempt, no sleeping.
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            initial_backoff: Duration::ZERO,
        }
    }

    /// Sleep before retry number `retry` (0-based).
    pub fn backoff_for(&self, retry: u32) -> Duration {
        let factor = 2u32.saturating_pow(retry);
        self.initial_backoff
            .saturating_mul(factor)
            .min(Self::MAX_BACKOFF)
    }
}

/// Runs `op` until it succeeds, fails with a non-retryable error, or the
/// retry budget is spent. Only `SourceUnavailable` is retried.
pub fn fetch_with_retry<T, F>(
    policy: &RetryPolicy,
    source: DataSource,
    site_id: &str,
    mut op: F,
) -> Result<T, SourceError>
where
    F: FnMut() -> Result<T, SourceError>,
{
    let mut retry = 0;
    loop {
        match op() {
            Ok(value) => return Ok(value),
            Err(err) if err.is_retryable() && retry < policy.max_retries => {
                let wait = policy.backoff_for(retry);
                logging::debug(
                    source,
                    Some(site_id),
                    &format!(
                        "attempt {} failed ({}), retrying in {} ms",
                        retry + 1,
                        err,
                        wait.as_millis()
                    ),
                );
                std::thread::sleep(wait);
                retry += 1;
            }
            Err(err) => return Err(err),
        }
    }
}

// ---------------------------------------------------------------------------
// HTTP helpers
// ---------------------------------------------------------------------------

/// Builds the shared HTTP client with the configured timeout.
pub fn build_http_client(config: &FetchConfig) -> Result<reqwest::blocking::Client, SourceError> {
    reqwest::blocking::Client::builder()
        .timeout(Duration::from_secs(config.timeout_secs))
        .user_agent(concat!("kayak_service/", env!("CARGO_PKG_VERSION")))
        .build()
        .map_err(|e| SourceError::unavailable("http", e))
}

/// GETs `url` and returns the body. Transport errors and non-2xx statuses
/// are reported as `SourceUnavailable`.
pub(crate) fn get_text(
    client: &reqwest::blocking::Client,
    provider: &str,
    url: &str,
) -> Result<String, SourceError> {
    let response = client
        .get(url)
        .send()
        .map_err(|e| SourceError::unavailable(provider, e))?;

    if !response.status().is_success() {
        return Err(SourceError::unavailable(
            provider,
            format!("HTTP error: {}", response.status()),
        ));
    }

    response
        .text()
        .map_err(|e| SourceError::unavailable(provider, e))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
