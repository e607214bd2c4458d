/// One batch run of the kayakability pipeline
///
/// Per selected site, in parallel scoped threads:
///   fetch (every adapter that serves the site) → align → score →
///   forecast → score forecast → candidate windows
///
/// Then, on the calling thread: rank windows across sites, decide whether
/// the run is usable, and hand history rows plus the snapshot to the store
/// in a single commit. Nothing is written unless every site finished.

use chrono::{DateTime, TimeDelta, Utc};

use crate::analysis::align::{DropReason, align};
use crate::analysis::forecast::forecast;
use crate::analysis::scoring::{WeightedScorer, score_series};
use crate::analysis::windows::{WindowError, WindowExtractor, rank_windows};
use crate::config::{Config, ConfigError};
use crate::ingest::SourceAdapter;
use crate::logging::{self, DataSource};
use crate::model::{CompositeRecord, MeasurementKind, ScoredRecord, SourceError, TimeRange, Window};
use crate::sites::{Site, select_sites};
use crate::store::{HistoryStore, Snapshot, StoreError};

// ---------------------------------------------------------------------------
// Inputs and outputs
// ---------------------------------------------------------------------------

/// Per-invocation overrides from the trigger surface.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RunOptions {
    /// Site ids to process. Empty means every configured site.
    pub sites: Vec<String>,
    /// Start of the fetch range. Defaults to the site's last recorded
    /// timestamp, or `fetch.backfill_hours` ago without history.
    pub start: Option<DateTime<Utc>>,
    /// End of the fetch range. Defaults to now.
    pub end: Option<DateTime<Utc>>,
}

/// Data a provider call failed to deliver: the whole call, or only the
/// kinds named here when the rest of the response was usable.
#[derive(Debug, Clone, PartialEq)]
pub struct FetchFailure {
    pub site_id: String,
    pub provider: String,
    pub kinds: Vec<MeasurementKind>,
    pub error: SourceError,
}

/// What a run did, for the console and the logs.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RunSummary {
    pub sites: usize,
    pub fetch_attempts: usize,
    /// Attempts that delivered no readings at all.
    pub failed_fetches: usize,
    pub failures: Vec<FetchFailure>,
    pub readings: usize,
    pub dropped_readings: usize,
    pub records_aligned: usize,
    pub records_scored: usize,
    pub records_insufficient: usize,
    pub records_appended: usize,
    pub forecast_records: usize,
    /// Ranked windows across every site.
    pub windows: Vec<Window>,
}

impl RunSummary {
    /// Some provider calls failed but the run still produced output.
    pub fn is_partial(&self) -> bool {
        !self.failures.is_empty()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("no usable data: none of the {records} records in range could be scored")]
    NoUsableData { records: usize },
    #[error("all {attempts} source fetches failed")]
    AllSourcesFailed { attempts: usize },
    #[error("persistence failure: {0}")]
    Persistence(#[from] StoreError),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Windows(#[from] WindowError),
}

// ---------------------------------------------------------------------------
// Per-site work
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct SiteOutcome {
    fetch_attempts: usize,
    failed_fetches: usize,
    failures: Vec<FetchFailure>,
    readings: usize,
    dropped: usize,
    records: Vec<CompositeRecord>,
    scored: usize,
    insufficient: usize,
    forecast: Vec<ScoredRecord>,
    windows: Vec<Window>,
}

fn fetch_range(
    site: &Site,
    config: &Config,
    options: &RunOptions,
    last_recorded: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
) -> TimeRange {
    let end = options.end.unwrap_or(now);
    let start = options
        .start
        .or(last_recorded)
        .unwrap_or_else(|| end - TimeDelta::hours(config.fetch.backfill_hours));
    logging::debug(
        DataSource::Pipeline,
        Some(&site.site_id),
        &format!("fetch range {} .. {}", start, end),
    );
    TimeRange::new(start, end)
}

fn process_site(
    site: &Site,
    config: &Config,
    adapters: &[Box<dyn SourceAdapter>],
    range: &TimeRange,
) -> Result<SiteOutcome, WindowError> {
    let mut outcome = SiteOutcome::default();
    let mut readings = Vec::new();

    for adapter in adapters.iter().filter(|a| a.serves(site)) {
        outcome.fetch_attempts += 1;
        let kinds = adapter.kinds();
        let source = DataSource::for_provider(adapter.name());
        let mut failed = |failed_kinds: &[MeasurementKind], error: SourceError| {
            logging::log_fetch_failure(source, &site.site_id, failed_kinds, &error);
            outcome.failures.push(FetchFailure {
                site_id: site.site_id.clone(),
                provider: adapter.name().to_string(),
                kinds: failed_kinds.to_vec(),
                error,
            });
        };

        match adapter.fetch(site, kinds, range) {
            Ok(mut fetched) => {
                fetched.readings.retain(|r| r.site_id == site.site_id);
                let total_loss = fetched.is_total_loss();
                logging::debug(
                    source,
                    Some(&site.site_id),
                    &format!(
                        "{} readings, {} kinds malformed",
                        fetched.readings.len(),
                        fetched.malformed.len()
                    ),
                );
                for (kind, error) in fetched.malformed {
                    failed(&[kind], error);
                }
                readings.append(&mut fetched.readings);
                if total_loss {
                    outcome.failed_fetches += 1;
                }
            }
            Err(error) => {
                failed(kinds, error);
                outcome.failed_fetches += 1;
            }
        }
    }
    outcome.readings = readings.len();

    let alignment = align(&readings, &config.alignment);
    outcome.dropped = alignment.dropped.len();
    if !alignment.dropped.is_empty() {
        let non_finite = alignment
            .dropped
            .iter()
            .filter(|d| d.reason == DropReason::NonFiniteValue)
            .count();
        logging::warn(
            DataSource::Pipeline,
            Some(&site.site_id),
            &format!(
                "dropped {} readings ({} outside tolerance, {} non-finite)",
                alignment.dropped.len(),
                alignment.dropped.len() - non_finite,
                non_finite
            ),
        );
    }

    let scorer = WeightedScorer::for_site(site, &config.scoring);
    let (mut scored, insufficient) = score_series(&scorer, &alignment.records);
    outcome.scored = scored.len();
    outcome.insufficient = insufficient.len();
    if !insufficient.is_empty() {
        logging::debug(
            DataSource::Pipeline,
            Some(&site.site_id),
            &format!("{} records had insufficient data", insufficient.len()),
        );
    }

    let bucket = config.alignment.bucket();
    let projected = forecast(&alignment.records, &config.forecast, bucket);
    let (forecast_scored, _) = score_series(&scorer, &projected);

    // Forecast timestamps all follow the last observed bucket, so the
    // combined sequence stays sorted.
    scored.extend(forecast_scored.iter().cloned());
    outcome.windows = WindowExtractor::new(config.windows, bucket).candidates(&scored)?;
    outcome.forecast = forecast_scored;
    outcome.records = alignment.records;

    logging::info(
        DataSource::Pipeline,
        Some(&site.site_id),
        &format!(
            "{} records, {} scored, {} forecast, {} candidate windows",
            outcome.records.len(),
            outcome.scored,
            outcome.forecast.len(),
            outcome.windows.len()
        ),
    );
    Ok(outcome)
}

// ---------------------------------------------------------------------------
// Run
// ---------------------------------------------------------------------------

/// Runs the pipeline once and persists its output.
///
/// Returns the run summary, or the reason the run produced nothing. On any
/// error the store is left exactly as it was.
pub fn run(
    config: &Config,
    adapters: &[Box<dyn SourceAdapter>],
    store: &dyn HistoryStore,
    options: &RunOptions,
    now: DateTime<Utc>,
) -> Result<RunSummary, PipelineError> {
    let sites = select_sites(&config.sites, &options.sites);
    if sites.is_empty() {
        return Err(ConfigError::Invalid(format!(
            "no configured site matches {:?}",
            options.sites
        ))
        .into());
    }
    let last_recorded = store.last_recorded()?;

    let ranges: Vec<TimeRange> = sites
        .iter()
        .map(|site| {
            let last = last_recorded.get(&site.site_id).copied();
            fetch_range(site, config, options, last, now)
        })
        .collect();

    let outcomes: Vec<Result<SiteOutcome, WindowError>> = std::thread::scope(|scope| {
        let handles: Vec<_> = sites
            .iter()
            .zip(&ranges)
            .map(|(site, range)| scope.spawn(move || process_site(site, config, adapters, range)))
            .collect();
        handles
            .into_iter()
            .map(|h| h.join().unwrap_or_else(|payload| std::panic::resume_unwind(payload)))
            .collect()
    });

    let mut summary = RunSummary {
        sites: sites.len(),
        ..RunSummary::default()
    };
    let mut rows = Vec::new();
    let mut candidates = Vec::new();
    let mut forecast_rows = Vec::new();

    for (site, outcome) in sites.iter().zip(outcomes) {
        let outcome = outcome?;
        summary.fetch_attempts += outcome.fetch_attempts;
        summary.failed_fetches += outcome.failed_fetches;
        summary.failures.extend(outcome.failures);
        summary.readings += outcome.readings;
        summary.dropped_readings += outcome.dropped;
        summary.records_aligned += outcome.records.len();
        summary.records_scored += outcome.scored;
        summary.records_insufficient += outcome.insufficient;
        summary.forecast_records += outcome.forecast.len();

        let last = last_recorded.get(&site.site_id).copied();
        rows.extend(
            outcome
                .records
                .into_iter()
                .filter(|r| last.is_none_or(|t| r.timestamp() > t)),
        );
        candidates.extend(outcome.windows);
        forecast_rows.extend(outcome.forecast);
    }

    logging::log_fetch_summary(summary.fetch_attempts, summary.failed_fetches);

    if summary.fetch_attempts > 0 && summary.failed_fetches == summary.fetch_attempts {
        return Err(PipelineError::AllSourcesFailed {
            attempts: summary.fetch_attempts,
        });
    }
    if summary.records_aligned > 0 && summary.records_scored == 0 {
        return Err(PipelineError::NoUsableData {
            records: summary.records_aligned,
        });
    }

    summary.windows = rank_windows(candidates);
    summary.records_appended = rows.len();

    let snapshot = Snapshot {
        windows: summary.windows.clone(),
        forecast: forecast_rows,
    };
    store.commit(&rows, &snapshot)?;

    let message = format!(
        "Run complete: {} records scored ({} insufficient), {} appended, {} windows",
        summary.records_scored,
        summary.records_insufficient,
        summary.records_appended,
        summary.windows.len()
    );
    if summary.is_partial() {
        logging::warn(
            DataSource::Pipeline,
            None,
            &format!(
                "{} (partial: {} fetches failed, {} gaps reported)",
                message,
                summary.failed_fetches,
                summary.failures.len()
            ),
        );
    } else {
        logging::info(DataSource::Pipeline, None, &message);
    }

    Ok(summary)
}

