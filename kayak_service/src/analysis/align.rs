//! Series alignment.
//!
//! Buckets raw readings from every source onto a fixed grid anchored at the
//! Unix epoch and merges them into one `CompositeRecord` per site and bucket.
//! Gaps stay null; nothing is interpolated here.

use std::cmp::Ordering;
use std::collections::BTreeMap;

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};

use crate::model::{CompositeRecord, MeasurementKind, Reading};

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AlignConfig {
    /// Grid spacing. Hourly by default.
    pub bucket_minutes: i64,
    /// How far a reading may sit from a bucket boundary and still count.
    pub tolerance_minutes: i64,
}

impl Default for AlignConfig {
    fn default() -> Self {
        Self {
            bucket_minutes: 60,
            tolerance_minutes: 30,
        }
    }
}

impl AlignConfig {
    pub fn bucket(&self) -> TimeDelta {
        TimeDelta::minutes(self.bucket_minutes)
    }

    pub fn tolerance(&self) -> TimeDelta {
        TimeDelta::minutes(self.tolerance_minutes)
    }
}

// ---------------------------------------------------------------------------
// Output
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    /// Not within tolerance of any bucket boundary.
    OutsideTolerance,
    /// NaN or infinite value.
    NonFiniteValue,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DroppedReading {
    pub reading: Reading,
    pub reason: DropReason,
}

/// Aligned records, sorted by `(site_id, timestamp)`, plus every reading
/// that could not be placed.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Alignment {
    pub records: Vec<CompositeRecord>,
    pub dropped: Vec<DroppedReading>,
}

// ---------------------------------------------------------------------------
// Grid arithmetic
// ---------------------------------------------------------------------------

/// Greatest grid boundary at or before `instant`.
pub fn bucket_floor(instant: DateTime<Utc>, width: TimeDelta) -> DateTime<Utc> {
    let width_secs = width.num_seconds().max(1);
    let offset = TimeDelta::seconds(instant.timestamp().rem_euclid(width_secs))
        + TimeDelta::nanoseconds(i64::from(instant.timestamp_subsec_nanos()));
    instant - offset
}

/// The bucket a reading at `instant` belongs to.
///
/// The greatest boundary at or before the reading wins when it is within
/// tolerance. This extends the plain floor rule in one deliberate way: a
/// reading that misses its floor boundary is assigned to the following
/// boundary if it precedes it by no more than the tolerance, so an ASOS
/// report at :54 lands on the next hour. With `tolerance_minutes = 0` only
/// exact boundaries match either way. `None` means the reading fits
/// neither.
pub fn assign_bucket(instant: DateTime<Utc>, config: &AlignConfig) -> Option<DateTime<Utc>> {
    let width = config.bucket();
    let tolerance = config.tolerance();
    let floor = bucket_floor(instant, width);
    if instant - floor <= tolerance {
        return Some(floor);
    }
    let next = floor + width;
    (next - instant <= tolerance).then_some(next)
}

/// Orders two readings competing for one bucket; `Less` means `a` wins.
///
/// Closest to the boundary first, then most recently fetched. Source name,
/// value and timestamp only break exact ties so the choice never depends on
/// input order.
fn compare_candidates(a: &Reading, b: &Reading, bucket: DateTime<Utc>) -> Ordering {
    let dist_a = (a.timestamp - bucket).abs();
    let dist_b = (b.timestamp - bucket).abs();
    dist_a
        .cmp(&dist_b)
        .then_with(|| b.fetched_at.cmp(&a.fetched_at))
        .then_with(|| a.source.cmp(&b.source))
        .then_with(|| a.value.total_cmp(&b.value))
        .then_with(|| a.timestamp.cmp(&b.timestamp))
}

// ---------------------------------------------------------------------------
// Alignment
// ---------------------------------------------------------------------------

type BucketKey = (String, DateTime<Utc>);

/// Merges readings into one composite record per `(site_id, bucket)`.
///
/// Records are produced for the union of buckets observed across all kinds.
/// The result does not depend on the order of `readings`.
pub fn align(readings: &[Reading], config: &AlignConfig) -> Alignment {
    let mut buckets: BTreeMap<BucketKey, BTreeMap<MeasurementKind, &Reading>> = BTreeMap::new();
    let mut dropped = Vec::new();

    for reading in readings {
        if !reading.value.is_finite() {
            dropped.push(DroppedReading {
                reading: reading.clone(),
                reason: DropReason::NonFiniteValue,
            });
            continue;
        }
        let Some(bucket) = assign_bucket(reading.timestamp, config) else {
            dropped.push(DroppedReading {
                reading: reading.clone(),
                reason: DropReason::OutsideTolerance,
            });
            continue;
        };

        let slot = buckets
            .entry((reading.site_id.clone(), bucket))
            .or_default();
        let wins = slot.get(&reading.kind).is_none_or(|current| {
            compare_candidates(reading, current, bucket) == Ordering::Less
        });
        if wins {
            slot.insert(reading.kind, reading);
        }
    }

    let records = buckets
        .into_iter()
        .map(|((site_id, timestamp), kinds)| {
            kinds
                .into_iter()
                .fold(CompositeRecord::new(site_id, timestamp), |record, (kind, r)| {
                    record.with_value(kind, Some(r.value))
                })
        })
        .collect();

    // Report drops in a stable order too.
    dropped.sort_by(|a, b| {
        a.reading
            .site_id
            .cmp(&b.reading.site_id)
            .then_with(|| a.reading.timestamp.cmp(&b.reading.timestamp))
            .then_with(|| a.reading.kind.cmp(&b.reading.kind))
            .then_with(|| a.reading.value.total_cmp(&b.reading.value))
    });

    Alignment { records, dropped }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
