//! Accuracy recorder: joins an arriving actual with every prediction made
//! for that date.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::Result;
use crate::ml::{PredictionRecord, Track};
use crate::series::AttendancePoint;
use crate::stats;
use crate::traits::{AttendanceStore, PredictionLog};

/// Store the actual and evaluate all records for its date.
///
/// Returns the latest production record after evaluation, or `None` when
/// the date was never predicted.
pub fn record_actual(
    store: &dyn AttendanceStore,
    log: &dyn PredictionLog,
    point: AttendancePoint,
) -> Result<Option<PredictionRecord>> {
    store.upsert_actual(point)?;
    let actual = f64::from(point.count);
    let records = log.for_date(point.date)?;
    if records.is_empty() {
        warn!(date = %point.date, "actual recorded for a date without predictions");
        return Ok(None);
    }
    for r in records {
        log.upsert(r.with_actual(actual))?;
    }
    let latest = log.latest(point.date, Track::Production)?;
    if let Some(r) = &latest {
        info!(
            date = %point.date,
            actual,
            predicted = r.final_value,
            error = r.error.unwrap_or(f64::NAN),
            "actual recorded"
        );
    }
    Ok(latest)
}

/// Coverage and error summary over evaluated records.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccuracySummary {
    pub n: usize,
    pub mae: f64,
    pub mape: f64,
    pub bias: f64,
    pub coverage80: f64,
    pub coverage95: f64,
}

/// Summarise the latest evaluated record per date on one track.
pub fn summarize(
    log: &dyn PredictionLog,
    start: NaiveDate,
    end: NaiveDate,
    track: Track,
) -> Result<Option<AccuracySummary>> {
    let mut latest: Vec<PredictionRecord> = Vec::new();
    for r in log.range(start, end)? {
        if r.track != track || r.error.is_none() {
            continue;
        }
        // range() is ordered by date then predicted_at
        match latest.last_mut() {
            Some(prev) if prev.target_date == r.target_date => *prev = r,
            _ => latest.push(r),
        }
    }
    if latest.is_empty() {
        return Ok(None);
    }
    let errors: Vec<f64> = latest.iter().filter_map(|r| r.error).collect();
    let abs: Vec<f64> = errors.iter().map(|e| e.abs()).collect();
    let pct: Vec<f64> = latest
        .iter()
        .filter_map(|r| r.error_pct.map(f64::abs))
        .collect();
    let share = |flag: fn(&PredictionRecord) -> Option<bool>| {
        latest.iter().filter(|r| flag(r) == Some(true)).count() as f64 / latest.len() as f64
    };
    Ok(Some(AccuracySummary {
        n: latest.len(),
        mae: stats::mean(&abs),
        mape: stats::mean(&pct),
        bias: stats::mean(&errors),
        coverage80: share(|r| r.in_ci80),
        coverage95: share(|r| r.in_ci95),
    }))
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;
    use crate::ml::confidence::intervals;
    use crate::store::{MemoryAttendanceStore, MemoryPredictionLog};
    use crate::traits::HKT;

    fn d(day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 2, day).unwrap()
    }

    fn record(day: u32, track: Track, value: f64) -> PredictionRecord {
        let (ci80, ci95) = intervals(value, 10.0, 0.0, 1000.0);
        PredictionRecord {
            target_date: d(day),
            horizon: 0,
            track,
            base: value,
            weather_adj: 0.0,
            ai_adj: 0.0,
            final_value: value,
            ci80,
            ci95,
            model_version: "v1".into(),
            predicted_at: HKT.with_ymd_and_hms(2024, 2, 1, 8, 0, 0).unwrap(),
            actual: None,
            error: None,
            error_pct: None,
            in_ci80: None,
            in_ci95: None,
        }
    }

    #[test]
    fn test_record_actual_updates_both_tracks() {
        let store = MemoryAttendanceStore::default();
        let log = MemoryPredictionLog::new();
        log.upsert(record(3, Track::Production, 300.0)).unwrap();
        log.upsert(record(3, Track::Experimental, 310.0)).unwrap();

        let point = AttendancePoint { date: d(3), count: 305 };
        let prod = record_actual(&store, &log, point).unwrap().unwrap();
        assert_eq!(prod.error, Some(-5.0));
        assert_eq!(prod.in_ci80, Some(true));

        let exp = log.latest(d(3), Track::Experimental).unwrap().unwrap();
        assert_eq!(exp.error, Some(5.0));
        assert_eq!(store.load_series().unwrap().get(d(3)), Some(305.0));
    }

    #[test]
    fn test_record_actual_without_prediction_still_stores() {
        let store = MemoryAttendanceStore::default();
        let log = MemoryPredictionLog::new();
        let out = record_actual(&store, &log, AttendancePoint { date: d(4), count: 280 }).unwrap();
        assert!(out.is_none());
        assert_eq!(store.load_series().unwrap().len(), 1);
    }

    #[test]
    fn test_summary_counts_coverage() {
        let log = MemoryPredictionLog::new();
        log.upsert(record(1, Track::Production, 300.0).with_actual(305.0)).unwrap();
        log.upsert(record(2, Track::Production, 300.0).with_actual(340.0)).unwrap();
        log.upsert(record(3, Track::Production, 300.0)).unwrap();
        let s = summarize(&log, d(1), d(3), Track::Production).unwrap().unwrap();
        assert_eq!(s.n, 2);
        assert_eq!(s.mae, 22.5);
        assert_eq!(s.bias, -22.5);
        assert_eq!(s.coverage80, 0.5);
        assert_eq!(s.coverage95, 0.5);
        assert!(summarize(&log, d(1), d(3), Track::Experimental).unwrap().is_none());
    }
}
