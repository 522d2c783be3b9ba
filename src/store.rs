//! In-memory adapters and CSV import/export.
//!
//! The core talks to synchronous store traits. These adapters back them
//! with plain collections: tests use them directly, and the binary hydrates
//! them from PostgreSQL before a run and writes them back afterwards.

use std::collections::BTreeMap;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, FixedOffset, NaiveDate};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{ForecastError, Result};
use crate::learner::{ImpactSet, WeightUpdateRecord};
use crate::ml::{PredictionRecord, Track};
use crate::series::{AttendancePoint, Series};
use crate::traits::{AttendanceStore, LearnerState, PredictionLog};

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

// ==================== Attendance ====================

/// Attendance series held in memory.
///
/// `set_available(false)` simulates an upstream outage: every call then
/// fails with `StoreUnavailable`.
#[derive(Debug, Default)]
pub struct MemoryAttendanceStore {
    series: Mutex<Series>,
    unavailable: AtomicBool,
}

impl MemoryAttendanceStore {
    pub fn new(series: Series) -> Self {
        Self {
            series: Mutex::new(series),
            unavailable: AtomicBool::new(false),
        }
    }

    pub fn from_points<I: IntoIterator<Item = AttendancePoint>>(points: I) -> Self {
        Self::new(Series::from_points(points))
    }

    pub fn set_available(&self, available: bool) {
        self.unavailable.store(!available, Ordering::SeqCst);
    }

    fn check(&self) -> Result<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(ForecastError::StoreUnavailable(
                "attendance store offline".into(),
            ));
        }
        Ok(())
    }
}

impl AttendanceStore for MemoryAttendanceStore {
    fn load_series(&self) -> Result<Series> {
        self.check()?;
        Ok(lock(&self.series).clone())
    }

    fn upsert_actual(&self, point: AttendancePoint) -> Result<()> {
        self.check()?;
        lock(&self.series).insert(point.date, f64::from(point.count))
    }
}

// ==================== Prediction Log ====================

type LogKey = (NaiveDate, String, Track);

/// Prediction log keyed by (target date, model version, track).
#[derive(Debug, Default)]
pub struct MemoryPredictionLog {
    records: Mutex<BTreeMap<LogKey, PredictionRecord>>,
}

impl MemoryPredictionLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_records<I: IntoIterator<Item = PredictionRecord>>(records: I) -> Self {
        let log = Self::new();
        {
            let mut map = lock(&log.records);
            for r in records {
                map.insert((r.target_date, r.model_version.clone(), r.track), r);
            }
        }
        log
    }

    pub fn len(&self) -> usize {
        lock(&self.records).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Every record, ordered by key.
    pub fn all(&self) -> Vec<PredictionRecord> {
        lock(&self.records).values().cloned().collect()
    }
}

fn by_time(mut records: Vec<PredictionRecord>) -> Vec<PredictionRecord> {
    records.sort_by(|a, b| {
        a.target_date
            .cmp(&b.target_date)
            .then(a.predicted_at.cmp(&b.predicted_at))
    });
    records
}

impl PredictionLog for MemoryPredictionLog {
    fn upsert(&self, record: PredictionRecord) -> Result<()> {
        let key = (record.target_date, record.model_version.clone(), record.track);
        lock(&self.records).insert(key, record);
        Ok(())
    }

    fn for_date(&self, date: NaiveDate) -> Result<Vec<PredictionRecord>> {
        self.range(date, date)
    }

    fn range(&self, start: NaiveDate, end: NaiveDate) -> Result<Vec<PredictionRecord>> {
        if start > end {
            return Ok(Vec::new());
        }
        let records = lock(&self.records)
            .values()
            .filter(|r| (start..=end).contains(&r.target_date))
            .cloned()
            .collect();
        Ok(by_time(records))
    }
}

// ==================== Learner State ====================

/// Learner state held in memory, keeping the full fusion-weight history.
#[derive(Debug, Default)]
pub struct MemoryLearnerState {
    impact: Mutex<ImpactSet>,
    weights: Mutex<Vec<WeightUpdateRecord>>,
}

impl MemoryLearnerState {
    pub fn new() -> Self {
        Self::default()
    }

    /// State loaded from elsewhere, e.g. the database.
    pub fn seeded(impact: ImpactSet, fusion: Option<WeightUpdateRecord>) -> Self {
        Self {
            impact: Mutex::new(impact),
            weights: Mutex::new(fusion.into_iter().collect()),
        }
    }

    pub fn weight_history(&self) -> Vec<WeightUpdateRecord> {
        lock(&self.weights).clone()
    }
}

impl LearnerState for MemoryLearnerState {
    fn impact_params(&self) -> Result<ImpactSet> {
        Ok(lock(&self.impact).clone())
    }

    fn save_impact_params(&self, params: &ImpactSet) -> Result<()> {
        *lock(&self.impact) = params.clone();
        Ok(())
    }

    fn fusion_weights(&self) -> Result<Option<WeightUpdateRecord>> {
        Ok(lock(&self.weights).last().cloned())
    }

    fn publish_fusion_weights(&self, record: &WeightUpdateRecord) -> Result<()> {
        lock(&self.weights).push(record.clone());
        Ok(())
    }
}

// ==================== CSV ====================

#[derive(Debug, Deserialize)]
struct AttendanceRow {
    date: String,
    count: String,
}

/// Read a `date,count` CSV with a header row.
///
/// The first bad row aborts the import with `Malformed`, naming its line.
pub fn import_attendance_csv<R: Read>(reader: R) -> Result<Vec<AttendancePoint>> {
    let mut rdr = csv::ReaderBuilder::new().trim(csv::Trim::All).from_reader(reader);
    let mut points = Vec::new();
    for (i, row) in rdr.deserialize::<AttendanceRow>().enumerate() {
        // header is line 1
        let line = i + 2;
        let row = row.map_err(|e| ForecastError::Malformed(format!("line {}: {}", line, e)))?;
        let point = AttendancePoint::parse(&row.date, &row.count)
            .map_err(|e| ForecastError::Malformed(format!("line {}: {}", line, e)))?;
        points.push(point);
    }
    debug!(rows = points.len(), "attendance CSV parsed");
    Ok(points)
}

pub fn import_attendance_file(path: &Path) -> Result<Vec<AttendancePoint>> {
    let file = std::fs::File::open(path)?;
    import_attendance_csv(file)
}

/// Flat row written by the prediction export.
#[derive(Debug, Serialize)]
struct PredictionRow<'a> {
    target_date: NaiveDate,
    horizon: u32,
    track: &'static str,
    base: f64,
    weather_adj: f64,
    ai_adj: f64,
    final_value: f64,
    ci80_low: f64,
    ci80_high: f64,
    ci95_low: f64,
    ci95_high: f64,
    model_version: &'a str,
    predicted_at: String,
    actual: Option<f64>,
    error: Option<f64>,
    error_pct: Option<f64>,
    in_ci80: Option<bool>,
    in_ci95: Option<bool>,
}

impl<'a> From<&'a PredictionRecord> for PredictionRow<'a> {
    fn from(r: &'a PredictionRecord) -> Self {
        Self {
            target_date: r.target_date,
            horizon: r.horizon,
            track: r.track.as_str(),
            base: r.base,
            weather_adj: r.weather_adj,
            ai_adj: r.ai_adj,
            final_value: r.final_value,
            ci80_low: r.ci80.low,
            ci80_high: r.ci80.high,
            ci95_low: r.ci95.low,
            ci95_high: r.ci95.high,
            model_version: &r.model_version,
            predicted_at: r.predicted_at.to_rfc3339(),
            actual: r.actual,
            error: r.error,
            error_pct: r.error_pct,
            in_ci80: r.in_ci80,
            in_ci95: r.in_ci95,
        }
    }
}

pub fn write_predictions_csv<W: Write>(writer: W, records: &[PredictionRecord]) -> Result<()> {
    let mut wtr = csv::Writer::from_writer(writer);
    for r in records {
        wtr.serialize(PredictionRow::from(r))
            .map_err(|e| ForecastError::Serialization(e.to_string()))?;
    }
    wtr.flush()?;
    Ok(())
}

/// Export name stamped with the HKT wall-clock time.
pub fn export_file_name(now: DateTime<FixedOffset>) -> String {
    format!("aed_predictions_{}_HKT.csv", now.format("%Y%m%d_%H%M%S"))
}

/// Write `records` to a timestamped CSV inside `dir`.
pub fn export_predictions(
    dir: &Path,
    records: &[PredictionRecord],
    now: DateTime<FixedOffset>,
) -> Result<PathBuf> {
    let path = dir.join(export_file_name(now));
    let file = std::fs::File::create(&path)?;
    write_predictions_csv(file, records)?;
    info!(path = %path.display(), rows = records.len(), "prediction log exported");
    Ok(path)
}
