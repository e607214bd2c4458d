/// Structured logging for the kayakability service
///
/// Provides context-rich logging with source and site identifiers on top of
/// `tracing`. Console output goes through a `tracing-subscriber` formatter;
/// an optional log file receives the same events without ANSI colors.

use std::fmt;
use std::fs::OpenOptions;
use std::sync::Mutex;

use tracing_subscriber::EnvFilter;

use crate::model::{MeasurementKind, SourceError};

// ---------------------------------------------------------------------------
// Data Source Types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataSource {
    Usgs,
    Iem,
    Store,
    Pipeline,
}

impl fmt::Display for DataSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DataSource::Usgs => write!(f, "USGS"),
            DataSource::Iem => write!(f, "IEM"),
            DataSource::Store => write!(f, "STORE"),
            DataSource::Pipeline => write!(f, "PIPELINE"),
        }
    }
}

impl DataSource {
    /// Maps an adapter name onto its logging source.
    pub fn for_provider(provider: &str) -> Self {
        match provider {
            "usgs" => DataSource::Usgs,
            "iem" => DataSource::Iem,
            _ => DataSource::Pipeline,
        }
    }
}

// ---------------------------------------------------------------------------
// Failure Classification
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureType {
    /// Expected failure - station offline or not reporting this kind
    Expected,
    /// Unexpected failure - service degradation or an API change
    Unexpected,
    /// Unknown - cannot determine if this is expected or not
    Unknown,
}

impl fmt::Display for FailureType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureType::Expected => write!(f, "EXPECTED"),
            FailureType::Unexpected => write!(f, "UNEXPECTED"),
            FailureType::Unknown => write!(f, "UNKNOWN"),
        }
    }
}

// ---------------------------------------------------------------------------
// Initialization
// ---------------------------------------------------------------------------

/// Initialize the global subscriber.
///
/// Verbosity mapping: 0 -> warn, 1 -> info, 2 -> debug, 3+ -> trace.
/// `RUST_LOG` overrides the flag when set. Calling this twice is harmless;
/// the first subscriber stays installed.
pub fn init_logger(verbosity: u8, log_file: Option<&str>) {
    let level = match verbosity {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("kayak_service={}", level)));

    let builder = tracing_subscriber::fmt().with_env_filter(filter).with_target(false);

    let file = log_file.and_then(|path| {
        match OpenOptions::new().create(true).append(true).open(path) {
            Ok(f) => Some(f),
            Err(e) => {
                eprintln!("Failed to open log file {}: {}", path, e);
                None
            }
        }
    });

    let _ = match file {
        Some(f) => builder.with_ansi(false).with_writer(Mutex::new(f)).try_init(),
        None => builder.with_writer(std::io::stderr).try_init(),
    };
}

// ---------------------------------------------------------------------------
// Public Logging Functions
// ---------------------------------------------------------------------------

/// Log a general informational message
pub fn info(source: DataSource, site_id: Option<&str>, message: &str) {
    tracing::info!(source = %source, site = site_id.unwrap_or("-"), "{}", message);
}

/// Log a warning message
pub fn warn(source: DataSource, site_id: Option<&str>, message: &str) {
    tracing::warn!(source = %source, site = site_id.unwrap_or("-"), "{}", message);
}

/// Log an error message
pub fn error(source: DataSource, site_id: Option<&str>, message: &str) {
    tracing::error!(source = %source, site = site_id.unwrap_or("-"), "{}", message);
}

/// Log a debug message
pub fn debug(source: DataSource, site_id: Option<&str>, message: &str) {
    tracing::debug!(source = %source, site = site_id.unwrap_or("-"), "{}", message);
}

// ---------------------------------------------------------------------------
// Failure Classification Helpers
// ---------------------------------------------------------------------------

/// Classify a fetch failure from its error.
pub fn classify_fetch_failure(err: &SourceError) -> FailureType {
    match err {
        // A payload we cannot read suggests an API change or a bug.
        SourceError::MalformedResponse { .. } => FailureType::Unexpected,
        SourceError::SourceUnavailable { reason, .. } => {
            if reason.contains("HTTP error: 404") {
                // Station retired or never reported this field
                FailureType::Expected
            } else if reason.contains("HTTP error: 5") || reason.contains("timed out") {
                FailureType::Unexpected
            } else {
                FailureType::Unknown
            }
        }
    }
}

/// Log a failed fetch with automatic classification. Every kind the call
/// was meant to deliver is named so the gap is traceable in the output.
pub fn log_fetch_failure(source: DataSource, site_id: &str, kinds: &[MeasurementKind], err: &SourceError) {
    let failure_type = classify_fetch_failure(err);
    let kinds = kinds.iter().map(|k| k.to_string()).collect::<Vec<_>>().join(",");
    let message = format!("fetch [{}] failed ({}): {}", kinds, failure_type, err);

    match failure_type {
        FailureType::Expected => debug(source, Some(site_id), &message),
        FailureType::Unexpected => error(source, Some(site_id), &message),
        FailureType::Unknown => warn(source, Some(site_id), &message),
    }
}

// ---------------------------------------------------------------------------
// Run Summary Logging
// ---------------------------------------------------------------------------

/// Log the outcome of a fetch sweep across all sites and kinds
pub fn log_fetch_summary(total: usize, failed: usize) {
    let message = format!(
        "Fetch complete: {}/{} kind fetches successful, {} failed",
        total - failed.min(total),
        total,
        failed
    );

    if failed == 0 {
        info(DataSource::Pipeline, None, &message);
    } else if failed >= total {
        error(DataSource::Pipeline, None, &message);
    } else {
        warn(DataSource::Pipeline, None, &message);
    }
}
