/// Console rendering of a run's results
///
/// The CSV snapshot is the durable output; this is the human-readable view
/// printed at the end of a run. Times are shown in UTC.

use std::collections::BTreeMap;
use std::fmt::Write as _;

use chrono::NaiveDate;

use crate::model::Window;
use crate::pipeline::RunSummary;
use crate::sites::Site;

pub const DEFAULT_LIMIT: usize = 10;

const RULE: &str = "══════════════════════════════════════════════════";

fn site_name<'a>(sites: &'a [Site], site_id: &'a str) -> &'a str {
    sites
        .iter()
        .find(|s| s.site_id == site_id)
        .map_or(site_id, |s| s.name.as_str())
}

fn format_measure(value: Option<f64>, unit: &str) -> String {
    match value {
        Some(v) => format!("{:.1} {}", v, unit),
        None => "n/a".to_string(),
    }
}

/// The top `limit` windows (already ranked) grouped by calendar day.
pub fn render_recommendations(windows: &[Window], sites: &[Site], limit: usize) -> String {
    if windows.is_empty() {
        return "❌ No optimal kayaking windows found.".to_string();
    }
    if limit == 0 {
        return format!(
            "🚣 {} kayaking windows found; none listed (limit is 0).",
            windows.len()
        );
    }

    let mut by_day: BTreeMap<NaiveDate, Vec<&Window>> = BTreeMap::new();
    for window in windows.iter().take(limit) {
        by_day.entry(window.start.date_naive()).or_default().push(window);
    }

    let mut out = String::new();
    let _ = writeln!(out, "🚣 KAYAK RECOMMENDATIONS");
    let _ = writeln!(out, "{}", RULE);

    for (day, day_windows) in &by_day {
        let _ = writeln!(out);
        let _ = writeln!(out, "📅 {}", day.format("%A, %B %d"));
        let _ = writeln!(out, "{}", "-".repeat(30));
        for w in day_windows {
            let _ = writeln!(out, "#{} ⭐ Score: {:.1}/100 (peak {:.1})", w.rank, w.mean_score, w.max_score);
            let _ = writeln!(
                out,
                "🕐 Time: {} - {} UTC ({} records)",
                w.start.format("%H:%M"),
                w.end.format("%H:%M"),
                w.record_count
            );
            let _ = writeln!(out, "🌊 Site: {} ({})", site_name(sites, &w.site_id), w.site_id);
            let _ = writeln!(out, "💧 Discharge: {}", format_measure(w.mean_discharge_cfs, "cfs"));
            let _ = writeln!(out, "📏 Gage: {}", format_measure(w.mean_gage_height_ft, "ft"));
        }
    }
    out
}

/// Counts reported after every run.
pub fn render_summary(summary: &RunSummary) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "{}", RULE);
    let _ = writeln!(out, "📊 RUN SUMMARY");
    let _ = writeln!(out, "{}", RULE);
    let _ = writeln!(out, "Sites:             {}", summary.sites);
    let _ = writeln!(
        out,
        "Fetches:           {}/{} successful ({} failed, {} gaps)",
        summary.fetch_attempts - summary.failed_fetches.min(summary.fetch_attempts),
        summary.fetch_attempts,
        summary.failed_fetches,
        summary.failures.len()
    );
    let _ = writeln!(
        out,
        "Readings:          {} ({} dropped)",
        summary.readings, summary.dropped_readings
    );
    let _ = writeln!(
        out,
        "Records scored:    {}/{} ({} insufficient)",
        summary.records_scored, summary.records_aligned, summary.records_insufficient
    );
    let _ = writeln!(out, "Records appended:  {}", summary.records_appended);
    let _ = writeln!(out, "Forecast records:  {}", summary.forecast_records);
    let _ = writeln!(out, "Windows found:     {}", summary.windows.len());
    for failure in &summary.failures {
        let kinds = failure.kinds.iter().map(|k| k.to_string()).collect::<Vec<_>>().join(",");
        let _ = writeln!(
            out,
            "⚠ {} {} [{}]: {}",
            failure.site_id, failure.provider, kinds, failure.error
        );
    }
    out
}
