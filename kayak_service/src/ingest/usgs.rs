/// USGS NWIS Instantaneous Values client.
///
/// Retrieves discharge (00060) and gage height (00065) for river sites from
/// the USGS water services JSON API and flattens the nested `timeSeries`
/// structure into `Reading`s.
///
/// API Documentation: https://waterservices.usgs.gov/docs/instantaneous-values/

use chrono::{DateTime, SecondsFormat, Utc};
use serde::Deserialize;

use super::{Fetched, RetryPolicy, SourceAdapter, fetch_with_retry, get_text};
use crate::logging::DataSource;
use crate::model::{
    MeasurementKind, PARAM_DISCHARGE, PARAM_STAGE, Reading, SourceError, TimeRange,
};
use crate::sites::Site;

pub const USGS_IV_URL: &str = "https://waterservices.usgs.gov/nwis/iv/";

const PROVIDER: &str = "usgs";

/// USGS marks missing values with this sentinel when `noDataValue` is absent.
const DEFAULT_NO_DATA: f64 = -999999.0;

// ============================================================================
// IV API Response Structures
// ============================================================================

#[derive(Debug, Deserialize)]
struct IvResponse {
    value: IvValue,
}

#[derive(Debug, Deserialize)]
struct IvValue {
    #[serde(rename = "timeSeries", default)]
    time_series: Vec<IvTimeSeries>,
}

#[derive(Debug, Deserialize)]
struct IvTimeSeries {
    #[serde(rename = "sourceInfo")]
    source_info: IvSourceInfo,
    variable: IvVariable,
    #[serde(default)]
    values: Vec<IvValueBlock>,
}

#[derive(Debug, Deserialize)]
struct IvSourceInfo {
    #[serde(rename = "siteCode")]
    site_code: Vec<IvCode>,
}

#[derive(Debug, Deserialize)]
struct IvVariable {
    #[serde(rename = "variableCode")]
    variable_code: Vec<IvCode>,
    #[serde(rename = "noDataValue")]
    no_data_value: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct IvCode {
    value: String,
}

#[derive(Debug, Deserialize)]
struct IvValueBlock {
    #[serde(default)]
    value: Vec<IvPoint>,
}

#[derive(Debug, Deserialize)]
struct IvPoint {
    value: String,
    #[serde(rename = "dateTime")]
    date_time: String,
}

// ============================================================================
// URL construction and parsing
// ============================================================================

/// Maps a USGS parameter code onto the kind it measures.
pub fn kind_for_parameter(code: &str) -> Option<MeasurementKind> {
    match code {
        PARAM_DISCHARGE => Some(MeasurementKind::Discharge),
        PARAM_STAGE => Some(MeasurementKind::GageHeight),
        _ => None,
    }
}

pub fn parameter_for_kind(kind: MeasurementKind) -> Option<&'static str> {
    match kind {
        MeasurementKind::Discharge => Some(PARAM_DISCHARGE),
        MeasurementKind::GageHeight => Some(PARAM_STAGE),
        _ => None,
    }
}

/// Builds an IV request URL for explicit start and end instants.
pub fn build_iv_url(
    base_url: &str,
    site_codes: &[&str],
    parameter_codes: &[&str],
    range: &TimeRange,
) -> String {
    format!(
        "{}?format=json&sites={}&parameterCd={}&startDT={}&endDT={}&siteStatus=all",
        base_url,
        site_codes.join(","),
        parameter_codes.join(","),
        range.start.to_rfc3339_opts(SecondsFormat::Secs, true),
        range.end.to_rfc3339_opts(SecondsFormat::Secs, true),
    )
}

/// Parses an IV JSON body into readings.
///
/// Empty strings and the series' no-data sentinel are skipped. Unknown
/// parameter codes are ignored. A body that is not IV JSON is a
/// `MalformedResponse` for the whole call. A series with a missing site
/// code, an unparseable value, or an unparseable timestamp is discarded and
/// reported against its own kind; the other series are kept.
pub fn parse_iv_response(body: &str, fetched_at: DateTime<Utc>) -> Result<Fetched, SourceError> {
    let response: IvResponse =
        serde_json::from_str(body).map_err(|e| SourceError::malformed(PROVIDER, e))?;

    let mut fetched = Fetched::default();
    for series in &response.value.time_series {
        let Some(kind) = series
            .variable
            .variable_code
            .first()
            .and_then(|c| kind_for_parameter(&c.value))
        else {
            continue;
        };
        match parse_series(series, kind, fetched_at) {
            Ok(mut readings) => fetched.readings.append(&mut readings),
            Err(err) => fetched.report_malformed(kind, err),
        }
    }
    Ok(fetched)
}

fn parse_series(
    series: &IvTimeSeries,
    kind: MeasurementKind,
    fetched_at: DateTime<Utc>,
) -> Result<Vec<Reading>, SourceError> {
    let site_id = series
        .source_info
        .site_code
        .first()
        .map(|c| c.value.as_str())
        .ok_or_else(|| SourceError::malformed(PROVIDER, format!("{} series without siteCode", kind)))?;
    let no_data = series.variable.no_data_value.unwrap_or(DEFAULT_NO_DATA);

    let mut readings = Vec::new();
    for point in series.values.iter().flat_map(|block| block.value.iter()) {
        let raw = point.value.trim();
        if raw.is_empty() {
            continue;
        }
        let value: f64 = raw.parse().map_err(|_| {
            SourceError::malformed(PROVIDER, format!("bad {} value '{}' for {}", kind, raw, site_id))
        })?;
        if value == no_data {
            continue;
        }
        let timestamp = DateTime::parse_from_rfc3339(&point.date_time)
            .map_err(|e| {
                SourceError::malformed(
                    PROVIDER,
                    format!("bad {} dateTime '{}' for {}: {}", kind, point.date_time, site_id, e),
                )
            })?
            .with_timezone(&Utc);

        readings.push(Reading {
            timestamp,
            site_id: site_id.to_string(),
            kind,
            value,
            source: PROVIDER.to_string(),
            fetched_at,
        });
    }
    Ok(readings)
}

// ============================================================================
// Adapter
// ============================================================================

/// River gauge adapter over the USGS IV service.
pub struct UsgsAdapter {
    client: reqwest::blocking::Client,
    retry: RetryPolicy,
    base_url: String,
}

impl UsgsAdapter {
    const KINDS: [MeasurementKind; 2] = [MeasurementKind::Discharge, MeasurementKind::GageHeight];

    pub fn new(client: reqwest::blocking::Client, retry: RetryPolicy) -> Self {
        Self::with_base_url(client, retry, USGS_IV_URL)
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

impl SourceAdapter for UsgsAdapter {
    fn name(&self) -> &str {
        PROVIDER
    }

    fn kinds(&self) -> &[MeasurementKind] {
        &Self::KINDS
    }

    fn fetch(
        &self,
        site: &Site,
        kinds: &[MeasurementKind],
        range: &TimeRange,
    ) -> Result<Fetched, SourceError> {
        let params: Vec<&str> = kinds.iter().filter_map(|k| parameter_for_kind(*k)).collect();
        if params.is_empty() || range.is_empty() {
            return Ok(Fetched::default());
        }

        let url = build_iv_url(&self.base_url, &[site.site_id.as_str()], &params, range);
        let body = fetch_with_retry(&self.retry, DataSource::Usgs, &site.site_id, || {
            get_text(&self.client, PROVIDER, &url)
        })?;

        let mut fetched = parse_iv_response(&body, Utc::now())?;
        fetched.readings.retain(|r| r.site_id == site.site_id);
        Ok(fetched.restrict(kinds, range))
    }
}

// ============================================================================
// Tests
// ============================================================================
