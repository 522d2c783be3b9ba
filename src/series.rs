//! Daily attendance series.
//!
//! [`Series`] keeps one value per calendar date in date order. Values are
//! stored as `f64` so the rolling predictor can append its own forecasts as
//! pseudo-actuals; counts coming from the store are validated as
//! non-negative integers on the way in.

use std::collections::BTreeMap;

use chrono::{Duration, NaiveDate};
use serde::{Deserialize, Serialize};

use crate::error::{ForecastError, Result};

/// ISO-8601 calendar date format used for every persisted date.
pub const DATE_FORMAT: &str = "%Y-%m-%d";

/// Parse an ISO-8601 (`YYYY-MM-DD`) date.
pub fn parse_date(s: &str) -> Result<NaiveDate> {
    NaiveDate::parse_from_str(s.trim(), DATE_FORMAT)
        .map_err(|e| ForecastError::Malformed(format!("unparsable date '{}': {}", s, e)))
}

/// A single observed day.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AttendancePoint {
    pub date: NaiveDate,
    pub count: u32,
}

impl AttendancePoint {
    /// Build a point from a raw count, rejecting negatives.
    pub fn new(date: NaiveDate, count: i64) -> Result<Self> {
        if count < 0 {
            return Err(ForecastError::Malformed(format!(
                "negative attendance {} on {}",
                count, date
            )));
        }
        let count = u32::try_from(count).map_err(|_| {
            ForecastError::Malformed(format!("attendance {} on {} out of range", count, date))
        })?;
        Ok(Self { date, count })
    }

    /// Parse a `(date, count)` pair of strings as found in CSV exports.
    ///
    /// Counts like `"231.0"` are accepted, `"231.5"` and `"-3"` are not.
    pub fn parse(date: &str, count: &str) -> Result<Self> {
        let date = parse_date(date)?;
        let raw = count.trim();
        let value: f64 = raw
            .parse()
            .map_err(|_| ForecastError::Malformed(format!("unparsable count '{}' on {}", raw, date)))?;
        if !value.is_finite() || value.fract() != 0.0 {
            return Err(ForecastError::Malformed(format!(
                "non-integer count '{}' on {}",
                raw, date
            )));
        }
        Self::new(date, value as i64)
    }
}

/// Ordered daily series, unique by date.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Series {
    values: BTreeMap<NaiveDate, f64>,
}

impl Series {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from points; a repeated date keeps the last value seen.
    pub fn from_points<I>(points: I) -> Self
    where
        I: IntoIterator<Item = AttendancePoint>,
    {
        let mut series = Self::new();
        for p in points {
            series.values.insert(p.date, f64::from(p.count));
        }
        series
    }

    /// Build from raw `(date, value)` pairs; negative or non-finite values are rejected.
    pub fn from_values<I>(values: I) -> Result<Self>
    where
        I: IntoIterator<Item = (NaiveDate, f64)>,
    {
        let mut series = Self::new();
        for (date, value) in values {
            series.insert(date, value)?;
        }
        Ok(series)
    }

    /// Insert or overwrite the value for `date`.
    pub fn insert(&mut self, date: NaiveDate, value: f64) -> Result<()> {
        if !value.is_finite() || value < 0.0 {
            return Err(ForecastError::Malformed(format!(
                "invalid attendance value {} on {}",
                value, date
            )));
        }
        self.values.insert(date, value);
        Ok(())
    }

    pub fn get(&self, date: NaiveDate) -> Option<f64> {
        self.values.get(&date).copied()
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn first_date(&self) -> Option<NaiveDate> {
        self.values.keys().next().copied()
    }

    pub fn last_date(&self) -> Option<NaiveDate> {
        self.values.keys().next_back().copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = (NaiveDate, f64)> + '_ {
        self.values.iter().map(|(d, v)| (*d, *v))
    }

    pub fn dates(&self) -> impl Iterator<Item = NaiveDate> + '_ {
        self.values.keys().copied()
    }

    /// Copy of the series restricted to dates strictly before `date`.
    pub fn before(&self, date: NaiveDate) -> Series {
        Series {
            values: self.values.range(..date).map(|(d, v)| (*d, *v)).collect(),
        }
    }

    /// Missing date ranges (inclusive) between the first and last observation.
    pub fn gaps(&self) -> Vec<(NaiveDate, NaiveDate)> {
        let mut gaps = Vec::new();
        let mut prev: Option<NaiveDate> = None;
        for date in self.values.keys() {
            if let Some(p) = prev {
                if (*date - p).num_days() > 1 {
                    gaps.push((p + Duration::days(1), *date - Duration::days(1)));
                }
            }
            prev = Some(*date);
        }
        gaps
    }

    /// Back to store points. Pseudo-actuals are rounded to whole patients.
    pub fn to_points(&self) -> Vec<AttendancePoint> {
        self.values
            .iter()
            .map(|(d, v)| AttendancePoint {
                date: *d,
                count: v.round().max(0.0) as u32,
            })
            .collect()
    }

    /// Dense, gap-filled (NaN) view used by the feature builder.
    pub fn dense(&self) -> DenseHistory {
        DenseHistory::from_series(self)
    }
}

impl FromIterator<AttendancePoint> for Series {
    fn from_iter<I: IntoIterator<Item = AttendancePoint>>(iter: I) -> Self {
        Series::from_points(iter)
    }
}

/// Contiguous daily array starting at `start`, with NaN marking missing days.
#[derive(Debug, Clone, PartialEq)]
pub struct DenseHistory {
    start: Option<NaiveDate>,
    values: Vec<f64>,
}

impl DenseHistory {
    pub fn from_series(series: &Series) -> Self {
        let (Some(first), Some(last)) = (series.first_date(), series.last_date()) else {
            return Self {
                start: None,
                values: Vec::new(),
            };
        };
        let len = (last - first).num_days() as usize + 1;
        let mut values = vec![f64::NAN; len];
        for (date, value) in series.iter() {
            values[(date - first).num_days() as usize] = value;
        }
        Self {
            start: Some(first),
            values,
        }
    }

    pub fn start(&self) -> Option<NaiveDate> {
        self.start
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Observed value on `date`, NaN if missing or out of range.
    pub fn value_on(&self, date: NaiveDate) -> f64 {
        match self.start {
            Some(start) if date >= start => self
                .values
                .get((date - start).num_days() as usize)
                .copied()
                .unwrap_or(f64::NAN),
            _ => f64::NAN,
        }
    }

    /// Set the value on `date`, extending the array (with NaN gaps) as needed.
    pub fn set(&mut self, date: NaiveDate, value: f64) {
        let start = match self.start {
            Some(start) if date >= start => start,
            Some(start) => {
                let shift = (start - date).num_days() as usize;
                let mut values = vec![f64::NAN; shift];
                values.append(&mut self.values);
                self.values = values;
                self.start = Some(date);
                date
            }
            None => {
                self.start = Some(date);
                date
            }
        };
        let idx = (date - start).num_days() as usize;
        if idx >= self.values.len() {
            self.values.resize(idx + 1, f64::NAN);
        }
        self.values[idx] = value;
    }

    /// Pad with NaN so the array reaches at least `date`.
    pub fn extend_to(&mut self, date: NaiveDate) {
        if let Some(start) = self.start {
            if date >= start {
                let len = (date - start).num_days() as usize + 1;
                if len > self.values.len() {
                    self.values.resize(len, f64::NAN);
                }
            }
        }
    }

    /// Last date with an array slot.
    pub fn end(&self) -> Option<NaiveDate> {
        self.start
            .map(|s| s + Duration::days(self.values.len() as i64 - 1))
    }

    /// Everything observed strictly before `date`.
    ///
    /// This is the one place where the target series is shifted: every lag,
    /// rolling, EWMA and encoding feature is computed from the returned view,
    /// so the value on `date` itself (or later) can never reach a feature.
    ///
    /// The view ends at the last array slot; callers looking past
    /// [`DenseHistory::end`] + 1 day must [`extend_to`](Self::extend_to) first.
    pub fn past(&self, date: NaiveDate) -> PastView<'_> {
        let end = match self.start {
            Some(start) if date > start => {
                ((date - start).num_days() as usize).min(self.values.len())
            }
            _ => 0,
        };
        PastView {
            values: &self.values[..end],
            target: date,
        }
    }
}

/// Observations strictly before a target date, oldest first.
#[derive(Debug, Clone, Copy)]
pub struct PastView<'a> {
    values: &'a [f64],
    target: NaiveDate,
}

impl<'a> PastView<'a> {
    pub fn target(&self) -> NaiveDate {
        self.target
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Value `k` days before the target (`k >= 1`), NaN if unavailable.
    pub fn lag(&self, k: usize) -> f64 {
        if k == 0 || k > self.values.len() {
            return f64::NAN;
        }
        self.values[self.values.len() - k]
    }

    /// The last `w` days before the target (fewer near the series start).
    pub fn window(&self, w: usize) -> &'a [f64] {
        let start = self.values.len().saturating_sub(w);
        &self.values[start..]
    }

    /// All past values, oldest first.
    pub fn all(&self) -> &'a [f64] {
        self.values
    }

    /// Date of the value at position `idx` of [`PastView::all`].
    pub fn date_at(&self, idx: usize) -> NaiveDate {
        self.target - Duration::days((self.values.len() - idx) as i64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn d(y: i32, m: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, day).unwrap()
    }

    #[test]
    fn test_parse_point_valid() {
        let p = AttendancePoint::parse("2024-01-05", "231").unwrap();
        assert_eq!(p.date, d(2024, 1, 5));
        assert_eq!(p.count, 231);

        let p = AttendancePoint::parse("2024-01-05", "231.0").unwrap();
        assert_eq!(p.count, 231);
    }

    #[test]
    fn test_parse_point_rejects_negative_and_fraction() {
        assert!(matches!(
            AttendancePoint::parse("2024-01-05", "-3"),
            Err(ForecastError::Malformed(_))
        ));
        assert!(matches!(
            AttendancePoint::parse("2024-01-05", "12.5"),
            Err(ForecastError::Malformed(_))
        ));
        assert!(matches!(
            AttendancePoint::parse("05/01/2024", "12"),
            Err(ForecastError::Malformed(_))
        ));
    }

    #[test]
    fn test_duplicate_dates_last_write_wins() {
        let series = Series::from_points(vec![
            AttendancePoint { date: d(2024, 1, 1), count: 100 },
            AttendancePoint { date: d(2024, 1, 1), count: 120 },
        ]);
        assert_eq!(series.len(), 1);
        assert_eq!(series.get(d(2024, 1, 1)), Some(120.0));
    }

    #[test]
    fn test_gaps_are_reported() {
        let series = Series::from_points(vec![
            AttendancePoint { date: d(2024, 1, 1), count: 1 },
            AttendancePoint { date: d(2024, 1, 2), count: 1 },
            AttendancePoint { date: d(2024, 1, 6), count: 1 },
        ]);
        assert_eq!(series.gaps(), vec![(d(2024, 1, 3), d(2024, 1, 5))]);
    }

    #[test]
    fn test_dense_fills_gaps_with_nan() {
        let series = Series::from_points(vec![
            AttendancePoint { date: d(2024, 1, 1), count: 10 },
            AttendancePoint { date: d(2024, 1, 3), count: 30 },
        ]);
        let dense = series.dense();
        assert_eq!(dense.len(), 3);
        assert_eq!(dense.value_on(d(2024, 1, 1)), 10.0);
        assert!(dense.value_on(d(2024, 1, 2)).is_nan());
        assert!(dense.value_on(d(2024, 1, 9)).is_nan());
    }

    #[test]
    fn test_past_view_excludes_target_day() {
        let series = Series::from_points(
            (0..7).map(|i| AttendancePoint { date: d(2024, 1, 1 + i), count: 200 + 10 * i }),
        );
        let dense = series.dense();

        let past = dense.past(d(2024, 1, 4));
        assert_eq!(past.all(), &[200.0, 210.0, 220.0]);
        assert_eq!(past.lag(1), 220.0);
        assert_eq!(past.lag(3), 200.0);
        assert!(past.lag(4).is_nan());
        assert_eq!(past.date_at(0), d(2024, 1, 1));

        // beyond the end: all observations are past
        let past = dense.past(d(2024, 1, 20));
        assert_eq!(past.len(), 7);
        assert!(dense.past(d(2023, 12, 1)).is_empty());
    }

    #[test]
    fn test_window_truncates_at_start() {
        let series = Series::from_points(
            (0..3).map(|i| AttendancePoint { date: d(2024, 1, 1 + i), count: i }),
        );
        let dense = series.dense();
        let past = dense.past(d(2024, 1, 4));
        assert_eq!(past.window(7).len(), 3);
        assert_eq!(past.window(2), &[1.0, 2.0]);
    }

    #[test]
    fn test_dense_set_extends_both_ways() {
        let mut dense = Series::from_points(vec![AttendancePoint { date: d(2024, 1, 5), count: 5 }]).dense();
        dense.set(d(2024, 1, 7), 7.0);
        assert_eq!(dense.len(), 3);
        assert!(dense.value_on(d(2024, 1, 6)).is_nan());
        dense.set(d(2024, 1, 3), 3.0);
        assert_eq!(dense.start(), Some(d(2024, 1, 3)));
        assert_eq!(dense.end(), Some(d(2024, 1, 7)));
        assert_eq!(dense.value_on(d(2024, 1, 5)), 5.0);
        assert_eq!(dense.past(d(2024, 1, 8)).lag(1), 7.0);
    }

    #[test]
    fn test_insert_rejects_negative() {
        let mut series = Series::new();
        assert!(series.insert(d(2024, 1, 1), -1.0).is_err());
        assert!(series.insert(d(2024, 1, 1), f64::NAN).is_err());
        assert!(series.insert(d(2024, 1, 1), 3.0).is_ok());
    }

    #[test]
    fn test_before_is_strict() {
        let series = Series::from_points(
            (0..5).map(|i| AttendancePoint { date: d(2024, 1, 1 + i), count: i }),
        );
        let before = series.before(d(2024, 1, 3));
        assert_eq!(before.len(), 2);
        assert_eq!(before.last_date(), Some(d(2024, 1, 2)));
    }
}
