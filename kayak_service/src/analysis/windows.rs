//! Optimal window extraction.
//!
//! A linear scan per site walks the scored sequence with a two-state
//! machine (`Scanning` / `InWindow`). A window opens on the first suitable
//! record, survives up to `max_gap` consecutive unsuitable records, and closes
//! on the last suitable record before the gap grew too long, before a missing
//! bucket, or at the end of the site's records.

use std::collections::HashSet;

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};

use crate::model::{MeasurementKind, ScoredRecord, Window};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WindowConfig {
    /// Consecutive unsuitable records tolerated inside a window.
    pub max_gap: usize,
    /// Windows with fewer member records are discarded as noise.
    pub min_records: usize,
}

impl Default for WindowConfig {
    fn default() -> Self {
        Self {
            max_gap: 0,
            min_records: 1,
        }
    }
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum WindowError {
    /// Records for a site were out of order, duplicated, or interleaved
    /// with another site's records.
    #[error("scored records for site {site_id} are not sorted and deduplicated at {timestamp}")]
    UnsortedInput {
        site_id: String,
        timestamp: DateTime<Utc>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ScanState {
    Scanning,
    InWindow {
        start: usize,
        last_suitable: usize,
        gap: usize,
    },
}

/// Extracts and ranks windows from a scored sequence.
#[derive(Debug, Clone, Copy)]
pub struct WindowExtractor {
    config: WindowConfig,
    bucket: TimeDelta,
}

impl WindowExtractor {
    pub fn new(config: WindowConfig, bucket: TimeDelta) -> Self {
        Self { config, bucket }
    }

    /// Candidate windows for every site in `scored`, unranked (rank 0).
    ///
    /// Records of several sites may be concatenated as long as each site's
    /// records form one contiguous, strictly increasing block.
    pub fn candidates(&self, scored: &[ScoredRecord]) -> Result<Vec<Window>, WindowError> {
        let mut windows = Vec::new();
        let mut seen_sites = HashSet::new();
        let mut block_start = 0;

        while block_start < scored.len() {
            let site_id = scored[block_start].site_id();
            if !seen_sites.insert(site_id) {
                return Err(WindowError::UnsortedInput {
                    site_id: site_id.to_string(),
                    timestamp: scored[block_start].timestamp(),
                });
            }
            let block_end = scored[block_start..]
                .iter()
                .position(|r| r.site_id() != site_id)
                .map_or(scored.len(), |offset| block_start + offset);

            windows.extend(self.scan_site(&scored[block_start..block_end])?);
            block_start = block_end;
        }
        Ok(windows)
    }

    /// Candidate windows ranked across all sites.
    pub fn extract(&self, scored: &[ScoredRecord]) -> Result<Vec<Window>, WindowError> {
        Ok(rank_windows(self.candidates(scored)?))
    }

    fn scan_site(&self, records: &[ScoredRecord]) -> Result<Vec<Window>, WindowError> {
        let mut windows = Vec::new();
        let mut state = ScanState::Scanning;

        for (i, record) in records.iter().enumerate() {
            if i > 0 {
                let step = record.timestamp() - records[i - 1].timestamp();
                if step <= TimeDelta::zero() {
                    return Err(WindowError::UnsortedInput {
                        site_id: record.site_id().to_string(),
                        timestamp: record.timestamp(),
                    });
                }
                if step > self.bucket {
                    // missing bucket
                    if let ScanState::InWindow {
                        start,
                        last_suitable,
                        ..
                    } = state
                    {
                        windows.extend(self.close(&records[start..=last_suitable]));
                    }
                    state = ScanState::Scanning;
                }
            }

            let suitable = record.label.is_suitable();
            state = match (state, suitable) {
                (ScanState::Scanning, true) => ScanState::InWindow {
                    start: i,
                    last_suitable: i,
                    gap: 0,
                },
                (ScanState::Scanning, false) => ScanState::Scanning,
                (ScanState::InWindow { start, .. }, true) => ScanState::InWindow {
                    start,
                    last_suitable: i,
                    gap: 0,
                },
                (
                    ScanState::InWindow {
                        start,
                        last_suitable,
                        gap,
                    },
                    false,
                ) => {
                    if gap + 1 > self.config.max_gap {
                        windows.extend(self.close(&records[start..=last_suitable]));
                        ScanState::Scanning
                    } else {
                        ScanState::InWindow {
                            start,
                            last_suitable,
                            gap: gap + 1,
                        }
                    }
                }
            };
        }

        if let ScanState::InWindow {
            start,
            last_suitable,
            ..
        } = state
        {
            windows.extend(self.close(&records[start..=last_suitable]));
        }
        Ok(windows)
    }

    fn close(&self, members: &[ScoredRecord]) -> Option<Window> {
        if members.len() < self.config.min_records.max(1) {
            return None;
        }
        let first = members.first()?;
        let last = members.last()?;
        let mean_score = members.iter().map(|r| r.score).sum::<f64>() / members.len() as f64;
        let max_score = members.iter().map(|r| r.score).fold(f64::MIN, f64::max);

        Some(Window {
            site_id: first.site_id().to_string(),
            start: first.timestamp(),
            end: last.timestamp(),
            mean_score,
            rank: 0,
            record_count: members.len(),
            max_score,
            mean_discharge_cfs: mean_of(members, MeasurementKind::Discharge),
            mean_gage_height_ft: mean_of(members, MeasurementKind::GageHeight),
        })
    }
}

fn mean_of(members: &[ScoredRecord], kind: MeasurementKind) -> Option<f64> {
    let values: Vec<f64> = members.iter().filter_map(|r| r.record.value(kind)).collect();
    if values.is_empty() {
        None
    } else {
        Some(values.iter().sum::<f64>() / values.len() as f64)
    }
}

/// Sorts by descending mean score (ties: earlier start, then site id) and
/// assigns ranks from 1.
pub fn rank_windows(mut windows: Vec<Window>) -> Vec<Window> {
    windows.sort_by(|a, b| {
        b.mean_score
            .total_cmp(&a.mean_score)
            .then_with(|| a.start.cmp(&b.start))
            .then_with(|| a.site_id.cmp(&b.site_id))
    });
    for (i, window) in windows.iter_mut().enumerate() {
        window.rank = i + 1;
    }
    windows
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{CompositeRecord, Label};
    use chrono::TimeZone;

    fn hour(h: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap() + TimeDelta::hours(h)
    }

    fn scored(site: &str, h: i64, score: f64) -> ScoredRecord {
        ScoredRecord {
            record: CompositeRecord::new(site, hour(h))
                .with_value(MeasurementKind::Discharge, Some(1000.0 + h as f64)),
            score,
            label: Label::from_score(score),
        }
    }

    fn series(site: &str, scores: &[f64]) -> Vec<ScoredRecord> {
        scores
            .iter()
            .enumerate()
            .map(|(i, s)| scored(site, i as i64, *s))
            .collect()
    }

    fn hourly(config: WindowConfig) -> WindowExtractor {
        WindowExtractor::new(config, TimeDelta::hours(1))
    }

    #[test]
    fn test_two_excellent_then_marginal_yields_one_window() {
        let records = series("01100000", &[85.0, 90.0, 55.0]);
        let windows = hourly(WindowConfig::default()).extract(&records).unwrap();
        assert_eq!(windows.len(), 1);
        let w = &windows[0];
        assert_eq!(w.rank, 1);
        assert_eq!(w.start, hour(0));
        assert_eq!(w.end, hour(1));
        assert_eq!(w.mean_score, 87.5);
        assert_eq!(w.max_score, 90.0);
        assert_eq!(w.record_count, 2);
        assert_eq!(w.mean_discharge_cfs, Some(1000.5));
        assert_eq!(w.mean_gage_height_ft, None);
    }

    #[test]
    fn test_strict_contiguity_splits_on_single_gap() {
        let records = series("01100000", &[70.0, 50.0, 90.0]);
        let windows = hourly(WindowConfig::default()).extract(&records).unwrap();
        assert_eq!(windows.len(), 2);
        assert_eq!(windows[0].start, hour(2));
        assert_eq!(windows[1].start, hour(0));
    }

    #[test]
    fn test_gap_tolerance_bridges_short_dips() {
        let config = WindowConfig {
            max_gap: 1,
            min_records: 1,
        };
        let records = series("01100000", &[70.0, 50.0, 90.0, 30.0, 20.0, 80.0]);
        let windows = hourly(config).extract(&records).unwrap();
        assert_eq!(windows.len(), 2);

        let bridged = windows.iter().find(|w| w.start == hour(0)).unwrap();
        assert_eq!(bridged.end, hour(2));
        assert_eq!(bridged.record_count, 3);
        assert!((bridged.mean_score - 70.0).abs() < 1e-12);

        let tail = windows.iter().find(|w| w.start == hour(5)).unwrap();
        assert_eq!(tail.record_count, 1);
    }

    #[test]
    fn test_trailing_gap_records_are_not_members() {
        let config = WindowConfig {
            max_gap: 2,
            min_records: 1,
        };
        let records = series("01100000", &[65.0, 75.0, 10.0]);
        let windows = hourly(config).extract(&records).unwrap();
        assert_eq!(windows.len(), 1);
        assert_eq!(windows[0].end, hour(1));
        assert_eq!(windows[0].mean_score, 70.0);
    }

    #[test]
    fn test_missing_bucket_ends_window() {
        let records = vec![
            scored("01100000", 0, 90.0),
            scored("01100000", 1, 90.0),
            scored("01100000", 3, 90.0),
        ];
        let config = WindowConfig {
            max_gap: 3,
            min_records: 1,
        };
        let windows = hourly(config).extract(&records).unwrap();
        assert_eq!(windows.len(), 2);
        assert!(windows.iter().any(|w| w.start == hour(0) && w.end == hour(1)));
        assert!(windows.iter().any(|w| w.start == hour(3) && w.end == hour(3)));
    }

    #[test]
    fn test_short_windows_are_discarded() {
        let config = WindowConfig {
            max_gap: 0,
            min_records: 2,
        };
        let records = series("01100000", &[90.0, 10.0, 70.0, 75.0, 10.0]);
        let windows = hourly(config).extract(&records).unwrap();
        assert_eq!(windows.len(), 1);
        assert_eq!(windows[0].start, hour(2));
    }

    #[test]
    fn test_no_suitable_records_yields_no_windows() {
        let records = series("01100000", &[10.0, 45.0, 59.9]);
        assert!(hourly(WindowConfig::default()).extract(&records).unwrap().is_empty());
        assert!(hourly(WindowConfig::default()).extract(&[]).unwrap().is_empty());
    }

    #[test]
    fn test_ties_rank_earlier_start_first() {
        let records = series("01100000", &[80.0, 10.0, 80.0, 10.0, 95.0]);
        let windows = hourly(WindowConfig::default()).extract(&records).unwrap();
        let order: Vec<_> = windows.iter().map(|w| (w.rank, w.start)).collect();
        assert_eq!(order, vec![(1, hour(4)), (2, hour(0)), (3, hour(2))]);
    }

    #[test]
    fn test_sites_are_scanned_independently_and_ranked_together() {
        let mut records = series("01092000", &[62.0, 64.0]);
        records.extend(series("01100000", &[99.0, 10.0, 70.0]));
        let windows = hourly(WindowConfig::default()).extract(&records).unwrap();
        let summary: Vec<_> = windows
            .iter()
            .map(|w| (w.rank, w.site_id.as_str(), w.start))
            .collect();
        assert_eq!(
            summary,
            vec![
                (1, "01100000", hour(0)),
                (2, "01100000", hour(2)),
                (3, "01092000", hour(0)),
            ]
        );
    }

    #[test]
    fn test_windows_never_overlap_and_are_sorted() {
        let scores: Vec<f64> = (0..200)
            .map(|i| ((i * 37 % 100) as f64 + (i % 7) as f64 * 3.0).min(100.0))
            .collect();
        for max_gap in 0..4 {
            let config = WindowConfig {
                max_gap,
                min_records: 1,
            };
            let windows = hourly(config).extract(&series("01100000", &scores)).unwrap();
            for (i, a) in windows.iter().enumerate() {
                assert_eq!(a.rank, i + 1);
                for b in &windows[i + 1..] {
                    assert!(!a.overlaps(b), "{:?} overlaps {:?}", a, b);
                    assert!(a.mean_score >= b.mean_score);
                }
            }
        }
    }

    #[test]
    fn test_unsorted_input_is_rejected() {
        let records = vec![scored("01100000", 1, 90.0), scored("01100000", 0, 90.0)];
        let err = hourly(WindowConfig::default()).extract(&records).unwrap_err();
        assert_eq!(
            err,
            WindowError::UnsortedInput {
                site_id: "01100000".to_string(),
                timestamp: hour(0),
            }
        );
    }

    #[test]
    fn test_duplicate_and_interleaved_sites_are_rejected() {
        let dup = vec![scored("01100000", 0, 90.0), scored("01100000", 0, 90.0)];
        assert!(hourly(WindowConfig::default()).extract(&dup).is_err());

        let interleaved = vec![
            scored("01100000", 0, 90.0),
            scored("01092000", 0, 90.0),
            scored("01100000", 1, 90.0),
        ];
        assert!(hourly(WindowConfig::default()).extract(&interleaved).is_err());
    }
}
