/// Scoring and windowing core of the kayakability service.
///
/// Everything in here is pure computation over in-memory series; fetching
/// lives in `ingest` and persistence in `store`.
///
/// Submodules:
/// - `align`   : merges readings onto a fixed bucket grid as composite records.
/// - `scoring` : per-kind response curves and the weighted `Scorer`.
/// - `windows` : suitable-run extraction and ranking.
/// - `forecast`: damped-trend projection of a site's aligned series.

pub mod align;
pub mod forecast;
pub mod scoring;
pub mod windows;
