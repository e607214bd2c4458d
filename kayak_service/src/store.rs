//! Durable CSV artifacts read by the dashboards.
//!
//! - `historical_hourly_data.csv`: append-only, one row per composite record.
//! - `optimal_windows.csv`: the current run's ranked windows, replaced each run.
//! - `forecast_data.csv`: the current run's scored forecast, replaced each run.
//!
//! `CsvStore::commit` is all-or-nothing. Both snapshots are staged in
//! temporary files and renamed into place, then the history rows are appended
//! in a single write. If any step fails, snapshots already replaced are
//! restored from their previous contents, the history file is truncated back
//! to its previous length, and an output directory created by the failed
//! commit is removed again.

use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{DateTime, SecondsFormat, Utc};

use crate::logging::{self, DataSource};
use crate::model::{CompositeRecord, MeasurementKind, ScoredRecord, Window};

pub const HISTORY_FILE: &str = "historical_hourly_data.csv";
pub const WINDOWS_FILE: &str = "optimal_windows.csv";
pub const FORECAST_FILE: &str = "forecast_data.csv";

const WINDOW_COLUMNS: &str = "site_id,start,end,mean_score,rank,record_count,max_score,mean_discharge_cfs,mean_gage_height_ft";

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("failed to access {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("history file {path} is malformed at line {line}: {reason}")]
    Malformed {
        path: String,
        line: usize,
        reason: String,
    },
}

impl StoreError {
    fn io(path: &Path, source: std::io::Error) -> Self {
        StoreError::Io {
            path: path.display().to_string(),
            source,
        }
    }
}

/// Everything a run replaces wholesale.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Snapshot {
    pub windows: Vec<Window>,
    pub forecast: Vec<ScoredRecord>,
}

/// Persistence seam used by the pipeline.
pub trait HistoryStore: Sync {
    /// Latest recorded timestamp for every site present in the history.
    fn last_recorded(&self) -> Result<BTreeMap<String, DateTime<Utc>>, StoreError>;

    /// Appends `rows` to the history and replaces the snapshot, all or nothing.
    fn commit(&self, rows: &[CompositeRecord], snapshot: &Snapshot) -> Result<(), StoreError>;
}

// ---------------------------------------------------------------------------
// CSV formatting
// ---------------------------------------------------------------------------

fn format_timestamp(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Secs, true)
}

fn format_optional(value: Option<f64>) -> String {
    value.map(|v| v.to_string()).unwrap_or_default()
}

fn format_optional_2dp(value: Option<f64>) -> String {
    value.map(|v| format!("{:.2}", v)).unwrap_or_default()
}

fn kind_header() -> String {
    MeasurementKind::ALL
        .iter()
        .map(|k| k.column())
        .collect::<Vec<_>>()
        .join(",")
}

pub fn history_header() -> String {
    format!("timestamp,site_id,{}", kind_header())
}

pub fn forecast_header() -> String {
    format!("timestamp,site_id,{},score,label", kind_header())
}

fn record_fields(record: &CompositeRecord) -> String {
    let values: Vec<String> = record.values().map(|(_, v)| format_optional(v)).collect();
    format!(
        "{},{},{}",
        format_timestamp(record.timestamp()),
        record.site_id(),
        values.join(",")
    )
}

pub fn history_row(record: &CompositeRecord) -> String {
    record_fields(record)
}

pub fn forecast_row(scored: &ScoredRecord) -> String {
    format!("{},{:.2},{}", record_fields(&scored.record), scored.score, scored.label)
}

pub fn window_row(window: &Window) -> String {
    format!(
        "{},{},{},{:.2},{},{},{:.2},{},{}",
        window.site_id,
        format_timestamp(window.start),
        format_timestamp(window.end),
        window.mean_score,
        window.rank,
        window.record_count,
        window.max_score,
        format_optional_2dp(window.mean_discharge_cfs),
        format_optional_2dp(window.mean_gage_height_ft),
    )
}

/// Parses history CSV text back into composite records.
pub fn parse_history(text: &str, path: &str) -> Result<Vec<CompositeRecord>, StoreError> {
    let mut lines = text.lines().enumerate().filter(|(_, l)| !l.trim().is_empty());
    let Some((_, header)) = lines.next() else {
        return Ok(Vec::new());
    };

    let malformed = |line: usize, reason: String| StoreError::Malformed {
        path: path.to_string(),
        line: line + 1,
        reason,
    };

    let columns: Vec<&str> = header.split(',').map(str::trim).collect();
    let ts_idx = columns
        .iter()
        .position(|c| *c == "timestamp")
        .ok_or_else(|| malformed(0, "missing timestamp column".to_string()))?;
    let site_idx = columns
        .iter()
        .position(|c| *c == "site_id")
        .ok_or_else(|| malformed(0, "missing site_id column".to_string()))?;
    let kind_idx: Vec<(MeasurementKind, usize)> = columns
        .iter()
        .enumerate()
        .filter_map(|(i, c)| MeasurementKind::from_column(c).map(|k| (k, i)))
        .collect();

    let mut records = Vec::new();
    for (line_no, line) in lines {
        let fields: Vec<&str> = line.split(',').collect();
        if fields.len() != columns.len() {
            return Err(malformed(
                line_no,
                format!("expected {} fields, found {}", columns.len(), fields.len()),
            ));
        }
        let timestamp = DateTime::parse_from_rfc3339(fields[ts_idx].trim())
            .map_err(|e| malformed(line_no, format!("bad timestamp: {}", e)))?
            .with_timezone(&Utc);

        let mut record = CompositeRecord::new(fields[site_idx].trim(), timestamp);
        for (kind, idx) in &kind_idx {
            let raw = fields[*idx].trim();
            if raw.is_empty() {
                continue;
            }
            let value: f64 = raw
                .parse()
                .map_err(|_| malformed(line_no, format!("bad {} value '{}'", kind, raw)))?;
            record = record.with_value(*kind, Some(value));
        }
        records.push(record);
    }
    Ok(records)
}

// ---------------------------------------------------------------------------
// CSV store
// ---------------------------------------------------------------------------

/// File-backed store rooted at one output directory.
pub struct CsvStore {
    dir: PathBuf,
    write_lock: Mutex<()>,
}

impl CsvStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn history_path(&self) -> PathBuf {
        self.dir.join(HISTORY_FILE)
    }

    pub fn windows_path(&self) -> PathBuf {
        self.dir.join(WINDOWS_FILE)
    }

    pub fn forecast_path(&self) -> PathBuf {
        self.dir.join(FORECAST_FILE)
    }

    /// Every record in the history file; empty when the file does not exist.
    pub fn load_history(&self) -> Result<Vec<CompositeRecord>, StoreError> {
        let path = self.history_path();
        match fs::read_to_string(&path) {
            Ok(text) => parse_history(&text, &path.display().to_string()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(e) => Err(StoreError::io(&path, e)),
        }
    }

    /// Appends rows to the history, writing the header first when the file
    /// is new or empty. All rows go out in one write; on failure the file is
    /// cut back to its previous length.
    fn append_history(&self, rows: &[CompositeRecord]) -> Result<(), StoreError> {
        let path = self.history_path();
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| StoreError::io(&path, e))?;
        let previous_len = file.metadata().map_err(|e| StoreError::io(&path, e))?.len();

        let mut buffer = String::new();
        if previous_len == 0 {
            let _ = writeln!(buffer, "{}", history_header());
        }
        for row in rows {
            let _ = writeln!(buffer, "{}", history_row(row));
        }
        if buffer.is_empty() {
            return Ok(());
        }
        if let Err(e) = file.write_all(buffer.as_bytes()).and_then(|_| file.sync_all()) {
            if let Err(undo) = file.set_len(previous_len) {
                logging::error(
                    DataSource::Store,
                    None,
                    &format!("could not truncate {} after failed append: {}", path.display(), undo),
                );
            }
            return Err(StoreError::io(&path, e));
        }
        Ok(())
    }

    fn commit_locked(&self, rows: &[CompositeRecord], snapshot: &Snapshot) -> Result<(), StoreError> {
        let mut staged = Vec::with_capacity(2);
        for (path, contents) in [
            (self.windows_path(), render_windows(&snapshot.windows)),
            (self.forecast_path(), render_forecast(&snapshot.forecast)),
        ] {
            match StagedFile::write(path, &contents) {
                Ok(file) => staged.push(file),
                Err(e) => {
                    staged.iter().for_each(StagedFile::discard);
                    return Err(e);
                }
            }
        }

        let mut installed = 0;
        for file in &staged {
            if let Err(e) = file.install() {
                staged[..installed].iter().for_each(StagedFile::restore);
                staged[installed..].iter().for_each(StagedFile::discard);
                return Err(e);
            }
            installed += 1;
        }

        if let Err(e) = self.append_history(rows) {
            staged.iter().for_each(StagedFile::restore);
            return Err(e);
        }
        Ok(())
    }
}

/// Runs `op` with `dir` present, removing `dir` again if it did not exist
/// before and `op` failed.
fn with_output_dir<T>(dir: &Path, op: impl FnOnce() -> Result<T, StoreError>) -> Result<T, StoreError> {
    let created = !dir.exists();
    fs::create_dir_all(dir).map_err(|e| StoreError::io(dir, e))?;
    let result = op();
    if result.is_err() && created {
        if let Err(e) = fs::remove_dir_all(dir) {
            logging::warn(
                DataSource::Store,
                None,
                &format!("could not remove {} after failed commit: {}", dir.display(), e),
            );
        }
    }
    result
}

fn staging_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".tmp");
    PathBuf::from(name)
}

/// A replacement snapshot file waiting in its staging path, with the
/// contents it replaces.
struct StagedFile {
    target: PathBuf,
    staging: PathBuf,
    /// `None` when there was no regular file at `target`.
    previous: Option<Vec<u8>>,
}

impl StagedFile {
    fn write(target: PathBuf, contents: &str) -> Result<Self, StoreError> {
        let previous = if target.is_file() {
            Some(fs::read(&target).map_err(|e| StoreError::io(&target, e))?)
        } else {
            None
        };
        let staging = staging_path(&target);
        fs::write(&staging, contents).map_err(|e| StoreError::io(&staging, e))?;
        Ok(Self {
            target,
            staging,
            previous,
        })
    }

    fn install(&self) -> Result<(), StoreError> {
        fs::rename(&self.staging, &self.target).map_err(|e| StoreError::io(&self.target, e))
    }

    fn discard(&self) {
        let _ = fs::remove_file(&self.staging);
    }

    /// Puts the previous contents back after `install` succeeded.
    fn restore(&self) {
        let result = match &self.previous {
            Some(bytes) => fs::write(&self.target, bytes),
            None => fs::remove_file(&self.target),
        };
        if let Err(e) = result {
            logging::error(
                DataSource::Store,
                None,
                &format!("could not restore {}: {}", self.target.display(), e),
            );
        }
    }
}

pub fn render_windows(windows: &[Window]) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "{}", WINDOW_COLUMNS);
    for window in windows {
        let _ = writeln!(out, "{}", window_row(window));
    }
    out
}

pub fn render_forecast(forecast: &[ScoredRecord]) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "{}", forecast_header());
    for record in forecast {
        let _ = writeln!(out, "{}", forecast_row(record));
    }
    out
}

impl HistoryStore for CsvStore {
    fn last_recorded(&self) -> Result<BTreeMap<String, DateTime<Utc>>, StoreError> {
        let mut latest: BTreeMap<String, DateTime<Utc>> = BTreeMap::new();
        for record in self.load_history()? {
            let entry = latest
                .entry(record.site_id().to_string())
                .or_insert(record.timestamp());
            if record.timestamp() > *entry {
                *entry = record.timestamp();
            }
        }
        Ok(latest)
    }

    fn commit(&self, rows: &[CompositeRecord], snapshot: &Snapshot) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock().unwrap_or_else(|e| e.into_inner());
        with_output_dir(&self.dir, || self.commit_locked(rows, snapshot))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Label;
    use chrono::{TimeDelta, TimeZone};

    fn hour(h: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap() + TimeDelta::hours(h)
    }

    fn record(site: &str, h: i64) -> CompositeRecord {
        CompositeRecord::new(site, hour(h))
            .with_value(MeasurementKind::Discharge, Some(1200.0 + h as f64))
            .with_value(MeasurementKind::WindSpeed, Some(4.5))
    }

    fn window(rank: usize) -> Window {
        Window {
            site_id: "01100000".to_string(),
            start: hour(0),
            end: hour(2),
            mean_score: 87.456,
            rank,
            record_count: 3,
            max_score: 90.0,
            mean_discharge_cfs: Some(1201.0),
            mean_gage_height_ft: None,
        }
    }

    #[test]
    fn test_history_row_leaves_null_kinds_empty() {
        let row = history_row(&record("01100000", 1));
        assert_eq!(row, "2024-06-01T01:00:00Z,01100000,1201,,,4.5,");
        assert_eq!(
            history_header(),
            "timestamp,site_id,discharge_cfs,gage_height_ft,temperature_f,wind_speed_mph,precipitation_in"
        );
    }

    #[test]
    fn test_window_row_format() {
        assert_eq!(
            window_row(&window(1)),
            "01100000,2024-06-01T00:00:00Z,2024-06-01T02:00:00Z,87.46,1,3,90.00,1201.00,"
        );
    }

    fn history_rows(store: &CsvStore) -> usize {
        store.load_history().unwrap().len()
    }

    #[test]
    fn test_append_writes_header_once_and_round_trips() {
        let dir = tempfile::tempdir().expect("create temp dir");
        let store = CsvStore::new(dir.path());
        store.commit(&[record("01100000", 0)], &Snapshot::default()).unwrap();
        store
            .commit(&[record("01100000", 1), record("01092000", 3)], &Snapshot::default())
            .unwrap();

        let text = fs::read_to_string(store.history_path()).unwrap();
        assert_eq!(text.matches("timestamp,site_id").count(), 1);

        let loaded = store.load_history().unwrap();
        assert_eq!(loaded, vec![record("01100000", 0), record("01100000", 1), record("01092000", 3)]);
    }

    #[test]
    fn test_last_recorded_per_site() {
        let dir = tempfile::tempdir().unwrap();
        let store = CsvStore::new(dir.path());
        assert!(store.last_recorded().unwrap().is_empty());

        store
            .commit(
                &[record("01100000", 5), record("01100000", 2), record("01092000", 1)],
                &Snapshot::default(),
            )
            .unwrap();
        let latest = store.last_recorded().unwrap();
        assert_eq!(latest.get("01100000"), Some(&hour(5)));
        assert_eq!(latest.get("01092000"), Some(&hour(1)));
    }

    #[test]
    fn test_commit_replaces_snapshot_and_appends_history() {
        let dir = tempfile::tempdir().unwrap();
        let store = CsvStore::new(dir.path().join("out"));

        let first = Snapshot {
            windows: vec![window(1), window(2)],
            forecast: Vec::new(),
        };
        store.commit(&[record("01100000", 0)], &first).unwrap();
        let second = Snapshot {
            windows: vec![window(1)],
            forecast: vec![ScoredRecord {
                record: record("01100000", 9),
                score: 75.0,
                label: Label::Good,
            }],
        };
        store.commit(&[record("01100000", 1)], &second).unwrap();

        let windows = fs::read_to_string(store.windows_path()).unwrap();
        assert_eq!(windows.lines().count(), 2, "header plus one window");
        let forecast = fs::read_to_string(store.forecast_path()).unwrap();
        assert!(forecast.lines().nth(1).unwrap().ends_with(",75.00,good"));
        assert_eq!(store.load_history().unwrap().len(), 2);
        assert!(!staging_path(&store.windows_path()).exists());
    }

    #[test]
    fn test_empty_commit_writes_headers_only() {
        let dir = tempfile::tempdir().unwrap();
        let store = CsvStore::new(dir.path());
        store.commit(&[], &Snapshot::default()).unwrap();

        let windows = fs::read_to_string(store.windows_path()).unwrap();
        assert_eq!(windows.trim_end(), WINDOW_COLUMNS);
        let history = fs::read_to_string(store.history_path()).unwrap();
        assert_eq!(history.trim_end(), history_header());
    }

    #[test]
    fn test_failed_commit_leaves_previous_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let store = CsvStore::new(dir.path());
        store
            .commit(&[], &Snapshot { windows: vec![window(1)], forecast: Vec::new() })
            .unwrap();
        let before = fs::read_to_string(store.windows_path()).unwrap();
        let forecast_before = fs::read_to_string(store.forecast_path()).unwrap();

        // A directory where the history file should be makes the append fail.
        fs::remove_file(store.history_path()).unwrap();
        fs::create_dir(store.history_path()).unwrap();

        let replacement = Snapshot {
            windows: vec![window(1), window(2)],
            forecast: Vec::new(),
        };
        let err = store.commit(&[record("01100000", 0)], &replacement).unwrap_err();
        assert!(matches!(err, StoreError::Io { .. }));
        assert_eq!(fs::read_to_string(store.windows_path()).unwrap(), before);
        assert_eq!(fs::read_to_string(store.forecast_path()).unwrap(), forecast_before);
        assert!(!staging_path(&store.windows_path()).exists());
        assert!(!staging_path(&store.forecast_path()).exists());
    }

    #[test]
    fn test_failed_snapshot_rename_keeps_history_and_windows() {
        let dir = tempfile::tempdir().unwrap();
        let store = CsvStore::new(dir.path());
        store
            .commit(&[record("01100000", 0)], &Snapshot { windows: vec![window(1)], forecast: Vec::new() })
            .unwrap();
        let history_before = fs::read_to_string(store.history_path()).unwrap();
        let windows_before = fs::read_to_string(store.windows_path()).unwrap();

        // A non-empty directory cannot be replaced by a rename, so the
        // forecast fails after the windows file was already swapped in.
        fs::remove_file(store.forecast_path()).unwrap();
        fs::create_dir(store.forecast_path()).unwrap();
        fs::write(store.forecast_path().join("keep"), "x").unwrap();

        let replacement = Snapshot {
            windows: vec![window(1), window(2)],
            forecast: Vec::new(),
        };
        assert!(store.commit(&[record("01100000", 1)], &replacement).is_err());

        assert_eq!(history_rows(&store), 1);
        assert_eq!(fs::read_to_string(store.history_path()).unwrap(), history_before);
        assert_eq!(fs::read_to_string(store.windows_path()).unwrap(), windows_before);
        assert!(!staging_path(&store.windows_path()).exists());
        assert!(!staging_path(&store.forecast_path()).exists());
    }

    #[test]
    fn test_snapshot_without_previous_file_is_removed_on_failure() {
        let dir = tempfile::tempdir().unwrap();
        let store = CsvStore::new(dir.path());
        fs::create_dir(store.forecast_path()).unwrap();
        fs::write(store.forecast_path().join("keep"), "x").unwrap();

        assert!(store.commit(&[record("01100000", 0)], &Snapshot::default()).is_err());

        assert!(!store.windows_path().exists());
        assert!(!store.history_path().exists());
    }

    #[test]
    fn test_output_dir_created_by_failed_commit_is_removed() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("out");

        let result: Result<(), StoreError> = with_output_dir(&out, || {
            assert!(out.is_dir());
            fs::write(out.join("partial"), "x").unwrap();
            Err(StoreError::io(&out, std::io::Error::other("disk full")))
        });
        assert!(result.is_err());
        assert!(!out.exists());

        // A directory that was already there is left alone.
        fs::create_dir(&out).unwrap();
        let result: Result<(), StoreError> =
            with_output_dir(&out, || Err(StoreError::io(&out, std::io::Error::other("disk full"))));
        assert!(result.is_err());
        assert!(out.is_dir());

        assert_eq!(with_output_dir(&dir.path().join("fresh"), || Ok(7)).unwrap(), 7);
        assert!(dir.path().join("fresh").is_dir());
    }

    #[test]
    fn test_malformed_history_is_reported_with_line() {
        let text = format!("{}\nnot-a-time,01100000,1,,,,\n", history_header());
        let err = parse_history(&text, "history.csv").unwrap_err();
        match err {
            StoreError::Malformed { line, .. } => assert_eq!(line, 2),
            other => panic!("unexpected error {:?}", other),
        }
    }
}
