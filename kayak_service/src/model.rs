/// Core data types for the kayakability service.
///
/// This module defines the shared domain model imported by all other modules:
/// measurement kinds, raw readings, aligned composite records, scored records,
/// windows, and the errors raised while fetching and scoring them.
/// It contains no I/O.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Parameter codes
// ---------------------------------------------------------------------------

/// USGS parameter code for discharge (streamflow), in cubic feet per second.
pub const PARAM_DISCHARGE: &str = "00060";

/// USGS parameter code for gage height (stage), in feet.
pub const PARAM_STAGE: &str = "00065";

// ---------------------------------------------------------------------------
// Measurement kinds
// ---------------------------------------------------------------------------

/// Every measurement the pipeline tracks.
///
/// The derived ordering is the column order of the historical CSV.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MeasurementKind {
    Discharge,
    GageHeight,
    Temperature,
    WindSpeed,
    Precipitation,
}

impl MeasurementKind {
    /// The full tracked set, in column order.
    pub const ALL: [MeasurementKind; 5] = [
        MeasurementKind::Discharge,
        MeasurementKind::GageHeight,
        MeasurementKind::Temperature,
        MeasurementKind::WindSpeed,
        MeasurementKind::Precipitation,
    ];

    /// CSV column name, including the unit.
    pub fn column(self) -> &'static str {
        match self {
            MeasurementKind::Discharge => "discharge_cfs",
            MeasurementKind::GageHeight => "gage_height_ft",
            MeasurementKind::Temperature => "temperature_f",
            MeasurementKind::WindSpeed => "wind_speed_mph",
            MeasurementKind::Precipitation => "precipitation_in",
        }
    }

    pub fn from_column(column: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|k| k.column() == column)
    }

    /// Physical quantities that cannot go below zero.
    pub fn is_non_negative(self) -> bool {
        !matches!(self, MeasurementKind::Temperature)
    }
}

impl fmt::Display for MeasurementKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MeasurementKind::Discharge => "discharge",
            MeasurementKind::GageHeight => "gage_height",
            MeasurementKind::Temperature => "temperature",
            MeasurementKind::WindSpeed => "wind_speed",
            MeasurementKind::Precipitation => "precipitation",
        };
        write!(f, "{}", name)
    }
}

// ---------------------------------------------------------------------------
// Reading types
// ---------------------------------------------------------------------------

/// A single raw observation of one measurement kind from one source.
///
/// `fetched_at` records when the source call returned; the aligner uses it
/// to prefer the most recently fetched reading when two are equally close
/// to a bucket boundary.
#[derive(Debug, Clone, PartialEq)]
pub struct Reading {
    pub timestamp: DateTime<Utc>,
    pub site_id: String,
    pub kind: MeasurementKind,
    pub value: f64,
    pub source: String,
    pub fetched_at: DateTime<Utc>,
}

/// Half-open time interval `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeRange {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl TimeRange {
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        Self { start, end }
    }

    pub fn contains(&self, instant: DateTime<Utc>) -> bool {
        instant >= self.start && instant < self.end
    }

    pub fn is_empty(&self) -> bool {
        self.end <= self.start
    }
}

// ---------------------------------------------------------------------------
// Composite and scored records
// ---------------------------------------------------------------------------

/// The merged view of every tracked kind for one site at one bucket.
///
/// Always carries an entry for each kind in `MeasurementKind::ALL`; kinds
/// with no reading in the bucket are `None`. Fields are private so a record
/// cannot be changed once it has been handed out.
#[derive(Debug, Clone, PartialEq)]
pub struct CompositeRecord {
    timestamp: DateTime<Utc>,
    site_id: String,
    values: BTreeMap<MeasurementKind, Option<f64>>,
}

impl CompositeRecord {
    /// A record with every kind set to null.
    pub fn new(site_id: impl Into<String>, timestamp: DateTime<Utc>) -> Self {
        Self {
            timestamp,
            site_id: site_id.into(),
            values: MeasurementKind::ALL.iter().map(|k| (*k, None)).collect(),
        }
    }

    /// Builder-style setter used while a record is being assembled.
    pub fn with_value(mut self, kind: MeasurementKind, value: Option<f64>) -> Self {
        self.values.insert(kind, value);
        self
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    pub fn site_id(&self) -> &str {
        &self.site_id
    }

    pub fn value(&self, kind: MeasurementKind) -> Option<f64> {
        self.values.get(&kind).copied().flatten()
    }

    /// All kinds in column order, with their optional values.
    pub fn values(&self) -> impl Iterator<Item = (MeasurementKind, Option<f64>)> + '_ {
        self.values.iter().map(|(k, v)| (*k, *v))
    }

    /// Number of kinds that carry a value.
    pub fn present_count(&self) -> usize {
        self.values.values().filter(|v| v.is_some()).count()
    }
}

/// Categorical suitability label, ordered from worst to best.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Label {
    Poor,
    Marginal,
    Good,
    Excellent,
}

impl Label {
    pub const EXCELLENT_MIN: f64 = 80.0;
    pub const GOOD_MIN: f64 = 60.0;
    pub const MARGINAL_MIN: f64 = 40.0;

    /// Fixed cut points: >=80 excellent, >=60 good, >=40 marginal, else poor.
    pub fn from_score(score: f64) -> Self {
        if score >= Self::EXCELLENT_MIN {
            Label::Excellent
        } else if score >= Self::GOOD_MIN {
            Label::Good
        } else if score >= Self::MARGINAL_MIN {
            Label::Marginal
        } else {
            Label::Poor
        }
    }

    /// Whether a record with this label can be part of a window.
    pub fn is_suitable(self) -> bool {
        matches!(self, Label::Good | Label::Excellent)
    }
}

impl fmt::Display for Label {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Label::Poor => write!(f, "poor"),
            Label::Marginal => write!(f, "marginal"),
            Label::Good => write!(f, "good"),
            Label::Excellent => write!(f, "excellent"),
        }
    }
}

/// A composite record with its suitability score attached.
#[derive(Debug, Clone, PartialEq)]
pub struct ScoredRecord {
    pub record: CompositeRecord,
    pub score: f64,
    pub label: Label,
}

impl ScoredRecord {
    pub fn timestamp(&self) -> DateTime<Utc> {
        self.record.timestamp()
    }

    pub fn site_id(&self) -> &str {
        self.record.site_id()
    }
}

// ---------------------------------------------------------------------------
// Windows
// ---------------------------------------------------------------------------

/// A ranked span of consecutive suitable buckets for one site.
///
/// `start` and `end` are the timestamps of the first and last member records.
#[derive(Debug, Clone, PartialEq)]
pub struct Window {
    pub site_id: String,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub mean_score: f64,
    pub rank: usize,
    pub record_count: usize,
    pub max_score: f64,
    pub mean_discharge_cfs: Option<f64>,
    pub mean_gage_height_ft: Option<f64>,
}

impl Window {
    pub fn overlaps(&self, other: &Window) -> bool {
        self.site_id == other.site_id && self.start <= other.end && other.start <= self.end
    }
}

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

/// Errors that can arise when fetching observations from an upstream provider.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum SourceError {
    /// Endpoint unreachable, timed out, or answered with a non-2xx status,
    /// after all retries were spent.
    #[error("{provider} unavailable: {reason}")]
    SourceUnavailable { provider: String, reason: String },
    /// The payload could not be turned into readings.
    #[error("malformed response from {provider}: {reason}")]
    MalformedResponse { provider: String, reason: String },
}

impl SourceError {
    pub fn unavailable(provider: &str, reason: impl fmt::Display) -> Self {
        SourceError::SourceUnavailable {
            provider: provider.to_string(),
            reason: reason.to_string(),
        }
    }

    pub fn malformed(provider: &str, reason: impl fmt::Display) -> Self {
        SourceError::MalformedResponse {
            provider: provider.to_string(),
            reason: reason.to_string(),
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, SourceError::SourceUnavailable { .. })
    }
}

/// Errors raised by a scorer.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ScoreError {
    /// No weighted kind carried a value.
    #[error("insufficient data for site {site_id} at {timestamp}")]
    InsufficientData {
        site_id: String,
        timestamp: DateTime<Utc>,
    },
}
