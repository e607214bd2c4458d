//! Kayakability scoring.
//!
//! Each measurement kind maps to a sub-score in [0, 100] through a response
//! curve; the composite score is the weighted mean of the sub-scores that are
//! present, with weights renormalized over those kinds. The curves and
//! weights here are placeholders carried as configuration, not calibrated
//! values.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::model::{CompositeRecord, Label, MeasurementKind, ScoreError, ScoredRecord};
use crate::sites::Site;

// ---------------------------------------------------------------------------
// Response curves
// ---------------------------------------------------------------------------

/// Maps a raw measurement onto a sub-score in [0, 100].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "shape", rename_all = "snake_case")]
pub enum ResponseCurve {
    /// 0 at or below `floor`, rising linearly to 100 at `ideal_min`, flat
    /// through `ideal_max`, falling linearly to 0 at `ceiling`.
    Band {
        floor: f64,
        ideal_min: f64,
        ideal_max: f64,
        ceiling: f64,
    },
    /// 100 at or below `threshold`, falling linearly to 0 at `zero_at`.
    Decay { threshold: f64, zero_at: f64 },
}

impl ResponseCurve {
    /// A band whose shoulders reach half the low end and one and a half
    /// times the high end of the ideal range.
    pub fn band_around(ideal: (f64, f64)) -> Self {
        let (lo, hi) = ideal;
        ResponseCurve::Band {
            floor: lo * 0.5,
            ideal_min: lo,
            ideal_max: hi,
            ceiling: hi * 1.5,
        }
    }

    pub fn sub_score(&self, value: f64) -> f64 {
        let raw = match *self {
            ResponseCurve::Band {
                floor,
                ideal_min,
                ideal_max,
                ceiling,
            } => {
                if value <= floor {
                    0.0
                } else if value < ideal_min {
                    100.0 * (value - floor) / (ideal_min - floor)
                } else if value <= ideal_max {
                    100.0
                } else if value < ceiling {
                    100.0 * (ceiling - value) / (ceiling - ideal_max)
                } else {
                    0.0
                }
            }
            ResponseCurve::Decay { threshold, zero_at } => {
                if value <= threshold {
                    100.0
                } else if value >= zero_at {
                    0.0
                } else {
                    100.0 * (zero_at - value) / (zero_at - threshold)
                }
            }
        };
        raw.clamp(0.0, 100.0)
    }

    pub fn is_well_formed(&self) -> bool {
        match *self {
            ResponseCurve::Band {
                floor,
                ideal_min,
                ideal_max,
                ceiling,
            } => floor <= ideal_min && ideal_min <= ideal_max && ideal_max <= ceiling,
            ResponseCurve::Decay { threshold, zero_at } => threshold <= zero_at,
        }
    }
}

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Relative importance of each kind. Need not sum to 1.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct KindWeights {
    pub discharge: f64,
    pub gage_height: f64,
    pub temperature: f64,
    pub wind_speed: f64,
    pub precipitation: f64,
}

impl Default for KindWeights {
    fn default() -> Self {
        Self {
            discharge: 0.4,
            gage_height: 0.2,
            temperature: 0.15,
            wind_speed: 0.15,
            precipitation: 0.1,
        }
    }
}

impl KindWeights {
    pub fn get(&self, kind: MeasurementKind) -> f64 {
        match kind {
            MeasurementKind::Discharge => self.discharge,
            MeasurementKind::GageHeight => self.gage_height,
            MeasurementKind::Temperature => self.temperature,
            MeasurementKind::WindSpeed => self.wind_speed,
            MeasurementKind::Precipitation => self.precipitation,
        }
    }
}

/// Weights plus the site-independent weather curves. River curves are built
/// per site from its ideal ranges.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScoringConfig {
    pub weights: KindWeights,
    /// Air temperature, degrees Fahrenheit.
    pub temperature: ResponseCurve,
    /// Sustained wind, miles per hour.
    pub wind_speed: ResponseCurve,
    /// One-hour precipitation, inches.
    pub precipitation: ResponseCurve,
}

impl Default for ScoringConfig {
    fn default() -> Self {
        Self {
            weights: KindWeights::default(),
            temperature: ResponseCurve::Band {
                floor: 40.0,
                ideal_min: 65.0,
                ideal_max: 85.0,
                ceiling: 100.0,
            },
            wind_speed: ResponseCurve::Decay {
                threshold: 10.0,
                zero_at: 30.0,
            },
            precipitation: ResponseCurve::Decay {
                threshold: 0.02,
                zero_at: 0.5,
            },
        }
    }
}

// ---------------------------------------------------------------------------
// Scorers
// ---------------------------------------------------------------------------

/// Turns a composite record into a scored record. Implementations must be
/// pure: the same record always yields the same result.
pub trait Scorer {
    fn score(&self, record: &CompositeRecord) -> Result<ScoredRecord, ScoreError>;
}

/// Weighted mean of per-kind response curves.
#[derive(Debug, Clone, PartialEq)]
pub struct WeightedScorer {
    curves: BTreeMap<MeasurementKind, ResponseCurve>,
    weights: BTreeMap<MeasurementKind, f64>,
}

impl WeightedScorer {
    pub fn new(
        curves: BTreeMap<MeasurementKind, ResponseCurve>,
        weights: BTreeMap<MeasurementKind, f64>,
    ) -> Self {
        Self { curves, weights }
    }

    /// Scorer for one site: river curves from the site's ideal ranges,
    /// weather curves and weights from configuration.
    pub fn for_site(site: &Site, config: &ScoringConfig) -> Self {
        let curves = BTreeMap::from([
            (
                MeasurementKind::Discharge,
                ResponseCurve::band_around(site.ideal_discharge_cfs),
            ),
            (
                MeasurementKind::GageHeight,
                ResponseCurve::band_around(site.ideal_gage_height_ft),
            ),
            (MeasurementKind::Temperature, config.temperature),
            (MeasurementKind::WindSpeed, config.wind_speed),
            (MeasurementKind::Precipitation, config.precipitation),
        ]);
        let weights = MeasurementKind::ALL
            .iter()
            .map(|k| (*k, config.weights.get(*k)))
            .collect();
        Self::new(curves, weights)
    }

    /// Weights of the kinds usable for `record`, renormalized to sum to 1.
    /// Empty when no weighted kind is present.
    pub fn effective_weights(&self, record: &CompositeRecord) -> Vec<(MeasurementKind, f64)> {
        let usable: Vec<(MeasurementKind, f64)> = record
            .values()
            .filter(|(kind, value)| {
                value.is_some_and(f64::is_finite) && self.curves.contains_key(kind)
            })
            .map(|(kind, _)| (kind, self.weights.get(&kind).copied().unwrap_or(0.0)))
            .filter(|(_, weight)| *weight > 0.0)
            .collect();

        let total: f64 = usable.iter().map(|(_, w)| w).sum();
        if total <= 0.0 {
            return Vec::new();
        }
        usable.into_iter().map(|(k, w)| (k, w / total)).collect()
    }
}

impl Scorer for WeightedScorer {
    fn score(&self, record: &CompositeRecord) -> Result<ScoredRecord, ScoreError> {
        let weights = self.effective_weights(record);
        if weights.is_empty() {
            return Err(ScoreError::InsufficientData {
                site_id: record.site_id().to_string(),
                timestamp: record.timestamp(),
            });
        }

        let mut score = 0.0;
        for (kind, weight) in weights {
            // effective_weights only yields kinds with a curve and a value
            if let (Some(curve), Some(value)) = (self.curves.get(&kind), record.value(kind)) {
                score += weight * curve.sub_score(value);
            }
        }
        let score = score.clamp(0.0, 100.0);

        Ok(ScoredRecord {
            record: record.clone(),
            score,
            label: Label::from_score(score),
        })
    }
}

/// Scores every record, setting aside the ones with insufficient data.
pub fn score_series<S: Scorer + ?Sized>(
    scorer: &S,
    records: &[CompositeRecord],
) -> (Vec<ScoredRecord>, Vec<ScoreError>) {
    let mut scored = Vec::with_capacity(records.len());
    let mut insufficient = Vec::new();
    for record in records {
        match scorer.score(record) {
            Ok(s) => scored.push(s),
            Err(e) => insufficient.push(e),
        }
    }
    (scored, insufficient)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
