//! Short-range projection of a site's aligned series.
//!
//! Each kind is extended independently with a damped linear trend: the slope
//! is a least-squares fit over the recent lookback, anchored at the last
//! observed value and shrunk by `damping` every step so projections level off
//! instead of running away.

use chrono::TimeDelta;
use serde::{Deserialize, Serialize};

use crate::model::{CompositeRecord, MeasurementKind};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ForecastConfig {
    /// Buckets to project past the last record. 0 disables forecasting.
    pub horizon_buckets: usize,
    /// Buckets of history used to fit the trend.
    pub lookback_buckets: usize,
    /// Per-step trend damping in (0, 1].
    pub damping: f64,
}

impl Default for ForecastConfig {
    fn default() -> Self {
        Self {
            horizon_buckets: 48,
            lookback_buckets: 24,
            damping: 0.9,
        }
    }
}

/// Slope per bucket and the anchor point `(x, value)` of the last
/// observation, with `x` measured in buckets relative to the last record.
struct Trend {
    slope: f64,
    anchor_x: f64,
    anchor_value: f64,
}

fn fit_trend(points: &[(f64, f64)]) -> Option<Trend> {
    let &(anchor_x, anchor_value) = points.last()?;
    let n = points.len() as f64;
    let mean_x = points.iter().map(|(x, _)| x).sum::<f64>() / n;
    let mean_y = points.iter().map(|(_, y)| y).sum::<f64>() / n;
    let sxx: f64 = points.iter().map(|(x, _)| (x - mean_x).powi(2)).sum();
    let sxy: f64 = points.iter().map(|(x, y)| (x - mean_x) * (y - mean_y)).sum();
    let slope = if sxx > 0.0 { sxy / sxx } else { 0.0 };
    Some(Trend {
        slope,
        anchor_x,
        anchor_value,
    })
}

/// Σ φ^i for i in 1..=steps.
fn damped_steps(damping: f64, steps: i32) -> f64 {
    if steps <= 0 {
        return 0.0;
    }
    if (damping - 1.0).abs() < f64::EPSILON {
        return f64::from(steps);
    }
    damping * (1.0 - damping.powi(steps)) / (1.0 - damping)
}

/// Projects `records` (one site, sorted ascending) `horizon_buckets` past
/// its last timestamp. Kinds with no value in the lookback stay null.
pub fn forecast(
    records: &[CompositeRecord],
    config: &ForecastConfig,
    bucket: TimeDelta,
) -> Vec<CompositeRecord> {
    let Some(last) = records.last() else {
        return Vec::new();
    };
    if config.horizon_buckets == 0 || bucket <= TimeDelta::zero() {
        return Vec::new();
    }

    let origin = last.timestamp();
    let bucket_secs = bucket.num_seconds() as f64;
    let lookback_start = origin - bucket * config.lookback_buckets.max(1) as i32;
    let damping = config.damping.clamp(0.0, 1.0);

    let trends: Vec<(MeasurementKind, Option<Trend>)> = MeasurementKind::ALL
        .iter()
        .map(|kind| {
            let points: Vec<(f64, f64)> = records
                .iter()
                .filter(|r| r.timestamp() > lookback_start)
                .filter_map(|r| {
                    let value = r.value(*kind)?;
                    let x = (r.timestamp() - origin).num_seconds() as f64 / bucket_secs;
                    Some((x, value))
                })
                .collect();
            (*kind, fit_trend(&points))
        })
        .collect();

    (1..=config.horizon_buckets)
        .map(|step| {
            let timestamp = origin + bucket * step as i32;
            trends.iter().fold(
                CompositeRecord::new(last.site_id(), timestamp),
                |record, (kind, trend)| {
                    let value = trend.as_ref().map(|t| {
                        let steps = (step as f64 - t.anchor_x).round() as i32;
                        let projected = t.anchor_value + t.slope * damped_steps(damping, steps);
                        if kind.is_non_negative() {
                            projected.max(0.0)
                        } else {
                            projected
                        }
                    });
                    record.with_value(*kind, value)
                },
            )
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, TimeZone, Utc};

    fn hour(h: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap() + TimeDelta::hours(h)
    }

    fn discharge_series(values: &[f64]) -> Vec<CompositeRecord> {
        values
            .iter()
            .enumerate()
            .map(|(i, v)| {
                CompositeRecord::new("01100000", hour(i as i64))
                    .with_value(MeasurementKind::Discharge, Some(*v))
            })
            .collect()
    }

    #[test]
    fn test_flat_series_persists() {
        let records = discharge_series(&[1200.0; 10]);
        let out = forecast(&records, &ForecastConfig::default(), TimeDelta::hours(1));
        assert_eq!(out.len(), 48);
        for r in &out {
            assert!((r.value(MeasurementKind::Discharge).unwrap() - 1200.0).abs() < 1e-9);
        }
    }

    #[test]
    fn test_timestamps_continue_on_the_grid() {
        let records = discharge_series(&[1000.0, 1010.0]);
        let config = ForecastConfig {
            horizon_buckets: 3,
            ..ForecastConfig::default()
        };
        let out = forecast(&records, &config, TimeDelta::hours(1));
        let stamps: Vec<_> = out.iter().map(|r| r.timestamp()).collect();
        assert_eq!(stamps, vec![hour(2), hour(3), hour(4)]);
        assert!(out.iter().all(|r| r.site_id() == "01100000"));
    }

    #[test]
    fn test_rising_trend_is_damped() {
        let records = discharge_series(&[1000.0, 1010.0, 1020.0, 1030.0]);
        let config = ForecastConfig {
            horizon_buckets: 100,
            lookback_buckets: 24,
            damping: 0.5,
        };
        let out = forecast(&records, &config, TimeDelta::hours(1));
        let first = out[0].value(MeasurementKind::Discharge).unwrap();
        assert!((first - 1035.0).abs() < 1e-9);
        // Sum of 0.5^i converges to 1, so the projection never passes 1040.
        let last = out[99].value(MeasurementKind::Discharge).unwrap();
        assert!(last < 1040.0 + 1e-9 && last > 1039.0);
    }

    #[test]
    fn test_non_negative_kinds_are_clamped() {
        let records: Vec<_> = [0.3, 0.2, 0.1]
            .iter()
            .enumerate()
            .map(|(i, v)| {
                CompositeRecord::new("01100000", hour(i as i64))
                    .with_value(MeasurementKind::Precipitation, Some(*v))
                    .with_value(MeasurementKind::Temperature, Some(-(i as f64) * 10.0))
            })
            .collect();
        let config = ForecastConfig {
            horizon_buckets: 24,
            lookback_buckets: 24,
            damping: 1.0,
        };
        let out = forecast(&records, &config, TimeDelta::hours(1));
        let last = out.last().unwrap();
        assert_eq!(last.value(MeasurementKind::Precipitation), Some(0.0));
        assert!(last.value(MeasurementKind::Temperature).unwrap() < -200.0);
    }

    #[test]
    fn test_kinds_without_history_stay_null() {
        let records = discharge_series(&[900.0, 950.0]);
        let out = forecast(&records, &ForecastConfig::default(), TimeDelta::hours(1));
        assert!(out.iter().all(|r| r.value(MeasurementKind::WindSpeed).is_none()));
    }

    #[test]
    fn test_zero_horizon_or_empty_input_yields_nothing() {
        let config = ForecastConfig {
            horizon_buckets: 0,
            ..ForecastConfig::default()
        };
        assert!(forecast(&discharge_series(&[1.0]), &config, TimeDelta::hours(1)).is_empty());
        assert!(forecast(&[], &ForecastConfig::default(), TimeDelta::hours(1)).is_empty());
    }

    #[test]
    fn test_lookback_ignores_old_values() {
        // A big early jump falls outside a 2-bucket lookback.
        let records = discharge_series(&[5000.0, 1000.0, 1000.0, 1000.0]);
        let config = ForecastConfig {
            horizon_buckets: 5,
            lookback_buckets: 2,
            damping: 1.0,
        };
        let out = forecast(&records, &config, TimeDelta::hours(1));
        assert!(out
            .iter()
            .all(|r| (r.value(MeasurementKind::Discharge).unwrap() - 1000.0).abs() < 1e-9));
    }
}
