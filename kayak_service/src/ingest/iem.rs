/// IEM (Iowa Environmental Mesonet) Data API Client
///
/// Retrieves ASOS (Automated Surface Observing System) station data from
/// the Iowa State University Mesonet API: air temperature, sustained wind,
/// and one-hour precipitation near each paddling site.
///
/// API Documentation: https://mesonet.agron.iastate.edu/request/download.phtml

use std::collections::BTreeMap;

use chrono::{DateTime, NaiveDateTime, Utc};

use super::{Fetched, RetryPolicy, SourceAdapter, fetch_with_retry, get_text};
use crate::logging::DataSource;
use crate::model::{MeasurementKind, Reading, SourceError, TimeRange};
use crate::sites::Site;

pub const IEM_BASE_URL: &str = "https://mesonet.agron.iastate.edu";

const PROVIDER: &str = "iem";

const KNOTS_TO_MPH: f64 = 1.150_779;

/// IEM reports trace precipitation as "T"; count it as a hundredth of the
/// smallest measurable amount.
const TRACE_PRECIP_IN: f64 = 0.0001;

/// CSV column requested for each kind.
fn column_for_kind(kind: MeasurementKind) -> Option<&'static str> {
    match kind {
        MeasurementKind::Temperature => Some("tmpf"),
        MeasurementKind::WindSpeed => Some("sknt"),
        MeasurementKind::Precipitation => Some("p01i"),
        _ => None,
    }
}

// ============================================================================
// URL construction and parsing
// ============================================================================

/// Builds the ASOS download URL for one station, the given fields, and range.
pub fn build_asos_url(base_url: &str, station_id: &str, columns: &[&str], range: &TimeRange) -> String {
    let data: String = columns.iter().map(|c| format!("&data={}", c)).collect();
    let (begin, end) = (range.start, range.end);
    format!(
        "{}/cgi-bin/request/asos.py?station={}{}&year1={}&month1={}&day1={}&hour1={}&minute1={}&year2={}&month2={}&day2={}&hour2={}&minute2={}&tz=Etc/UTC&format=onlycomma&latlon=no&elev=no&missing=null&trace=T&direct=no&report_type=3",
        base_url,
        station_id,
        data,
        begin.format("%Y"),
        begin.format("%m"),
        begin.format("%d"),
        begin.format("%H"),
        begin.format("%M"),
        end.format("%Y"),
        end.format("%m"),
        end.format("%d"),
        end.format("%H"),
        end.format("%M"),
    )
}

/// Parses a numeric field that might be "null", "M" (missing), or "T"
/// (trace). `Ok(None)` is a legitimately absent value.
fn parse_field(raw: &str, kind: MeasurementKind) -> Result<Option<f64>, String> {
    match raw.trim() {
        "" | "null" | "M" => Ok(None),
        "T" if kind == MeasurementKind::Precipitation => Ok(Some(TRACE_PRECIP_IN)),
        s => s.parse().map(Some).map_err(|_| format!("bad {} value '{}'", kind, s)),
    }
}

/// Parses an IEM ASOS CSV response into readings for `site_id`.
///
/// Columns are located by header name, so the field order IEM returns does
/// not matter. Incomplete rows and comment lines are skipped. A missing
/// `valid` column is a `MalformedResponse` for the whole call. A row with an
/// unparseable timestamp is skipped and counted against every kind it
/// carries; an unparseable value is skipped and counted against its kind.
pub fn parse_asos_csv(
    csv: &str,
    site_id: &str,
    fetched_at: DateTime<Utc>,
) -> Result<Fetched, SourceError> {
    let mut lines = csv
        .lines()
        .filter(|l| !l.trim().is_empty() && !l.starts_with('#'));

    let Some(header) = lines.next() else {
        return Ok(Fetched::default());
    };
    let columns: Vec<&str> = header.split(',').map(str::trim).collect();
    let valid_idx = columns
        .iter()
        .position(|c| *c == "valid")
        .ok_or_else(|| SourceError::malformed(PROVIDER, format!("no 'valid' column in header '{}'", header)))?;

    let kind_columns: Vec<(MeasurementKind, usize)> = [
        MeasurementKind::Temperature,
        MeasurementKind::WindSpeed,
        MeasurementKind::Precipitation,
    ]
    .into_iter()
    .filter_map(|kind| {
        let name = column_for_kind(kind)?;
        columns.iter().position(|c| *c == name).map(|idx| (kind, idx))
    })
    .collect();

    // First problem seen per kind, and how many values it affected.
    let mut problems: BTreeMap<MeasurementKind, (String, usize)> = BTreeMap::new();
    let mut note = |kind: MeasurementKind, reason: String| {
        problems.entry(kind).or_insert((reason, 0)).1 += 1;
    };

    let mut fetched = Fetched::default();
    for line in lines {
        let fields: Vec<&str> = line.split(',').collect();
        if fields.len() < columns.len() {
            continue; // Skip incomplete rows
        }

        // Timestamp format: "2024-06-01 12:54"
        let timestamp_str = fields[valid_idx].trim();
        let timestamp = match NaiveDateTime::parse_from_str(timestamp_str, "%Y-%m-%d %H:%M") {
            Ok(dt) => DateTime::from_naive_utc_and_offset(dt, Utc),
            Err(e) => {
                for (kind, idx) in &kind_columns {
                    if matches!(parse_field(fields[*idx], *kind), Ok(None)) {
                        continue;
                    }
                    note(*kind, format!("bad timestamp '{}': {}", timestamp_str, e));
                }
                continue;
            }
        };

        for (kind, idx) in &kind_columns {
            let raw = match parse_field(fields[*idx], *kind) {
                Ok(Some(raw)) => raw,
                Ok(None) => continue,
                Err(reason) => {
                    note(*kind, format!("{} at {}", reason, timestamp_str));
                    continue;
                }
            };
            let value = if *kind == MeasurementKind::WindSpeed {
                raw * KNOTS_TO_MPH
            } else {
                raw
            };
            fetched.readings.push(Reading {
                timestamp,
                site_id: site_id.to_string(),
                kind: *kind,
                value,
                source: PROVIDER.to_string(),
                fetched_at,
            });
        }
    }

    for (kind, (reason, count)) in problems {
        let reason = if count > 1 {
            format!("{} (and {} more)", reason, count - 1)
        } else {
            reason
        };
        fetched.report_malformed(kind, SourceError::malformed(PROVIDER, reason));
    }
    Ok(fetched)
}

// ============================================================================
// Adapter
// ============================================================================

/// Weather adapter over the IEM ASOS download service.
pub struct IemAdapter {
    client: reqwest::blocking::Client,
    retry: RetryPolicy,
    base_url: String,
}

impl IemAdapter {
    const KINDS: [MeasurementKind; 3] = [
        MeasurementKind::Temperature,
        MeasurementKind::WindSpeed,
        MeasurementKind::Precipitation,
    ];

    pub fn new(client: reqwest::blocking::Client, retry: RetryPolicy) -> Self {
        Self::with_base_url(client, retry, IEM_BASE_URL)
    }

    pub fn with_base_url(
        client: reqwest::blocking::Client,
        retry: RetryPolicy,
        base_url: &str,
    ) -> Self {
        Self {
            client,
            retry,
            base_url: base_url.to_string(),
        }
    }
}

impl SourceAdapter for IemAdapter {
    fn name(&self) -> &str {
        PROVIDER
    }

    fn kinds(&self) -> &[MeasurementKind] {
        &Self::KINDS
    }

    fn serves(&self, site: &Site) -> bool {
        site.weather_station.is_some()
    }

    fn fetch(
        &self,
        site: &Site,
        kinds: &[MeasurementKind],
        range: &TimeRange,
    ) -> Result<Fetched, SourceError> {
        let Some(station) = site.weather_station.as_deref() else {
            return Ok(Fetched::default());
        };
        let columns: Vec<&str> = kinds.iter().filter_map(|k| column_for_kind(*k)).collect();
        if columns.is_empty() || range.is_empty() {
            return Ok(Fetched::default());
        }

        let url = build_asos_url(&self.base_url, station, &columns, range);
        let body = fetch_with_retry(&self.retry, DataSource::Iem, &site.site_id, || {
            get_text(&self.client, PROVIDER, &url)
        })?;

        Ok(parse_asos_csv(&body, &site.site_id, Utc::now())?.restrict(kinds, range))
    }
}

// ============================================================================
// Tests
// ============================================================================
