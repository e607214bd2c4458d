/// Service configuration
///
/// Loaded from `kayak.toml`; every section is optional and falls back to
/// built-in defaults. `.env` is read through `dotenv`, and two variables
/// override the file:
///
/// - `KAYAK_CONFIG`    : path to the TOML file.
/// - `KAYAK_OUTPUT_DIR`: directory for the CSV artifacts.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::analysis::align::AlignConfig;
use crate::analysis::forecast::ForecastConfig;
use crate::analysis::scoring::ScoringConfig;
use crate::analysis::windows::WindowConfig;
use crate::ingest::FetchConfig;
use crate::model::MeasurementKind;
use crate::sites::{Site, default_sites};

pub const DEFAULT_CONFIG_FILE: &str = "kayak.toml";
pub const DEFAULT_OUTPUT_DIR: &str = "kayak_forecast_data";

pub const ENV_CONFIG: &str = "KAYAK_CONFIG";
pub const ENV_OUTPUT_DIR: &str = "KAYAK_OUTPUT_DIR";

/// One week.
pub const MAX_BUCKET_MINUTES: i64 = 7 * 24 * 60;
/// Ten years.
pub const MAX_BACKFILL_HOURS: i64 = 10 * 8766;
/// Upper bound on forecast horizon and lookback, in buckets.
pub const MAX_FORECAST_BUCKETS: usize = 10_000;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: toml::de::Error,
    },
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub output_dir: PathBuf,
    pub fetch: FetchConfig,
    pub alignment: AlignConfig,
    pub scoring: ScoringConfig,
    pub windows: WindowConfig,
    pub forecast: ForecastConfig,
    /// Monitored sites. Empty means the built-in registry.
    pub sites: Vec<Site>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            output_dir: PathBuf::from(DEFAULT_OUTPUT_DIR),
            fetch: FetchConfig::default(),
            alignment: AlignConfig::default(),
            scoring: ScoringConfig::default(),
            windows: WindowConfig::default(),
            forecast: ForecastConfig::default(),
            sites: default_sites(),
        }
    }
}

impl Config {
    /// Parses TOML text. Missing sections take their defaults.
    pub fn from_toml(text: &str, origin: &str) -> Result<Self, ConfigError> {
        let mut config: Config = toml::from_str(text).map_err(|source| ConfigError::Parse {
            path: origin.to_string(),
            source,
        })?;
        if config.sites.is_empty() {
            config.sites = default_sites();
        }
        Ok(config)
    }

    /// Reads and parses a config file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let origin = path.display().to_string();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: origin.clone(),
            source,
        })?;
        Self::from_toml(&text, &origin)
    }

    /// Resolves the effective configuration for a run.
    ///
    /// Path precedence: `explicit`, then `KAYAK_CONFIG`, then `kayak.toml` in
    /// the working directory if present, else built-in defaults. The result
    /// is validated before it is returned.
    pub fn resolve(explicit: Option<&Path>) -> Result<Self, ConfigError> {
        dotenv::dotenv().ok();
        Self::resolve_with(explicit, |key| std::env::var(key).ok())
    }

    /// `resolve` with an injectable environment lookup.
    pub fn resolve_with<F>(explicit: Option<&Path>, env: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let path = explicit
            .map(Path::to_path_buf)
            .or_else(|| env(ENV_CONFIG).map(PathBuf::from))
            .or_else(|| {
                let fallback = PathBuf::from(DEFAULT_CONFIG_FILE);
                fallback.exists().then_some(fallback)
            });

        let mut config = match path {
            Some(p) => Self::load(&p)?,
            None => Self::default(),
        };
        if let Some(dir) = env(ENV_OUTPUT_DIR) {
            config.output_dir = PathBuf::from(dir);
        }
        config.validate()?;
        Ok(config)
    }

    /// Rejects settings the pipeline cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: String| Err(ConfigError::Invalid(msg));

        if !(1..=MAX_BUCKET_MINUTES).contains(&self.alignment.bucket_minutes) {
            return invalid(format!(
                "alignment.bucket_minutes must be in [1, {}], got {}",
                MAX_BUCKET_MINUTES, self.alignment.bucket_minutes
            ));
        }
        if self.alignment.tolerance_minutes < 0
            || self.alignment.tolerance_minutes >= self.alignment.bucket_minutes
        {
            return invalid(format!(
                "alignment.tolerance_minutes must be in [0, {}), got {}",
                self.alignment.bucket_minutes, self.alignment.tolerance_minutes
            ));
        }
        if self.fetch.timeout_secs == 0 {
            return invalid("fetch.timeout_secs must be positive".to_string());
        }
        if !(1..=MAX_BACKFILL_HOURS).contains(&self.fetch.backfill_hours) {
            return invalid(format!(
                "fetch.backfill_hours must be in [1, {}], got {}",
                MAX_BACKFILL_HOURS, self.fetch.backfill_hours
            ));
        }
        if self.windows.min_records == 0 {
            return invalid("windows.min_records must be at least 1".to_string());
        }
        for (field, buckets) in [
            ("horizon_buckets", self.forecast.horizon_buckets),
            ("lookback_buckets", self.forecast.lookback_buckets),
        ] {
            if buckets > MAX_FORECAST_BUCKETS {
                return invalid(format!(
                    "forecast.{} must be at most {}, got {}",
                    field, MAX_FORECAST_BUCKETS, buckets
                ));
            }
        }
        if !(self.forecast.damping > 0.0 && self.forecast.damping <= 1.0) {
            return invalid(format!(
                "forecast.damping must be in (0, 1], got {}",
                self.forecast.damping
            ));
        }

        for kind in MeasurementKind::ALL {
            let weight = self.scoring.weights.get(kind);
            if !weight.is_finite() || weight < 0.0 {
                return invalid(format!("scoring weight for {} must be non-negative, got {}", kind, weight));
            }
        }
        for (name, curve) in [
            ("temperature", &self.scoring.temperature),
            ("wind_speed", &self.scoring.wind_speed),
            ("precipitation", &self.scoring.precipitation),
        ] {
            if !curve.is_well_formed() {
                return invalid(format!("scoring.{} curve is not well formed: {:?}", name, curve));
            }
        }

        if self.sites.is_empty() {
            return invalid("no sites configured".to_string());
        }
        let mut seen = HashSet::new();
        for site in &self.sites {
            if site.site_id.is_empty() || site.site_id.contains([',', '"', '\n', '\r']) {
                return invalid(format!("site id '{}' is not usable in CSV output", site.site_id));
            }
            if !seen.insert(site.site_id.as_str()) {
                return invalid(format!("duplicate site id {}", site.site_id));
            }
            for (field, (lo, hi)) in [
                ("ideal_discharge_cfs", site.ideal_discharge_cfs),
                ("ideal_gage_height_ft", site.ideal_gage_height_ft),
            ] {
                if !(lo.is_finite() && hi.is_finite() && lo <= hi) {
                    return invalid(format!(
                        "site {}: {} range ({}, {}) is inverted",
                        site.site_id, field, lo, hi
                    ));
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::scoring::ResponseCurve;

    fn no_env(_: &str) -> Option<String> {
        None
    }

    #[test]
    fn test_defaults_are_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.sites.len(), default_sites().len());
        assert_eq!(config.output_dir, PathBuf::from("kayak_forecast_data"));
    }

    #[test]
    fn test_partial_toml_keeps_other_defaults() {
        let text = r#"
            output_dir = "out"

            [alignment]
            bucket_minutes = 30
            tolerance_minutes = 10

            [windows]
            max_gap = 1

            [scoring.wind_speed]
            shape = "decay"
            threshold = 8.0
            zero_at = 25.0
        "#;
        let config = Config::from_toml(text, "inline").expect("valid toml");
        assert_eq!(config.output_dir, PathBuf::from("out"));
        assert_eq!(config.alignment.bucket_minutes, 30);
        assert_eq!(config.windows.max_gap, 1);
        assert_eq!(config.windows.min_records, 1);
        assert_eq!(
            config.scoring.wind_speed,
            ResponseCurve::Decay { threshold: 8.0, zero_at: 25.0 }
        );
        assert_eq!(config.fetch, FetchConfig::default());
        assert!(!config.sites.is_empty(), "empty site list falls back to the registry");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_sites_from_toml_replace_registry() {
        let text = r#"
            [[sites]]
            site_id = "99999999"
            name = "Test Run"
            latitude = 43.0
            longitude = -71.0
            ideal_discharge_cfs = [500.0, 1500.0]
            ideal_gage_height_ft = [2.0, 4.0]
        "#;
        let config = Config::from_toml(text, "inline").unwrap();
        assert_eq!(config.sites.len(), 1);
        assert_eq!(config.sites[0].weather_station, None);
    }

    #[test]
    fn test_unknown_field_is_parse_error() {
        let err = Config::from_toml("bucket = 5\n", "inline").unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
    }

    #[test]
    fn test_validate_rejects_bad_alignment() {
        let mut config = Config::default();
        config.alignment.bucket_minutes = 0;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));

        let mut config = Config::default();
        config.alignment.tolerance_minutes = 60;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_durations_out_of_range() {
        // Large enough to overflow a TimeDelta if it reached the aligner.
        let text = "[alignment]\nbucket_minutes = 9223372036854775\ntolerance_minutes = 0\n";
        let config = Config::from_toml(text, "inline").expect("parses as an integer");
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));

        let mut config = Config::default();
        config.alignment.bucket_minutes = MAX_BUCKET_MINUTES;
        assert!(config.validate().is_ok());

        for hours in [0, -24, i64::MAX] {
            let mut config = Config::default();
            config.fetch.backfill_hours = hours;
            assert!(config.validate().is_err(), "backfill_hours = {}", hours);
        }

        let mut config = Config::default();
        config.forecast.horizon_buckets = MAX_FORECAST_BUCKETS + 1;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_bad_sites_and_weights() {
        let mut config = Config::default();
        let dup = config.sites[0].clone();
        config.sites.push(dup);
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.sites[0].ideal_discharge_cfs = (2000.0, 1000.0);
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.scoring.weights.wind_speed = -0.1;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_resolve_applies_env_overrides() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("custom.toml");
        std::fs::write(&path, "[windows]\nmax_gap = 2\n").unwrap();
        let path_str = path.display().to_string();

        let config = Config::resolve_with(None, |key| match key {
            ENV_CONFIG => Some(path_str.clone()),
            ENV_OUTPUT_DIR => Some("/tmp/kayak-out".to_string()),
            _ => None,
        })
        .unwrap();
        assert_eq!(config.windows.max_gap, 2);
        assert_eq!(config.output_dir, PathBuf::from("/tmp/kayak-out"));
    }

    #[test]
    fn test_explicit_missing_file_is_io_error() {
        let err = Config::resolve_with(Some(Path::new("/nonexistent/kayak.toml")), no_env).unwrap_err();
        assert!(matches!(err, ConfigError::Io { .. }));
    }
}
