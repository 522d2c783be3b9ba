//! Abstractions for time and for the stores the forecasting core talks to.
//!
//! This module provides traits for:
//! - `Clock`: Hong Kong wall-clock time, injectable for deterministic tests
//! - `AttendanceStore`: the daily attendance series (read + upsert actuals)
//! - `DailyLookup`: pure per-date lookups for exogenous tables
//! - `HolidayProvider`: public-holiday queries
//! - `PredictionLog`: prediction records keyed by (target date, model version, track)
//! - `LearnerState`: weather-impact parameters and fusion weights
//!
//! All store traits are synchronous. The PostgreSQL adapter in `db` is
//! async and is used by the binary to hydrate the in-memory adapters in
//! `store` before the core runs, then to write results back.

use std::sync::{Arc, Mutex, PoisonError};

use chrono::{DateTime, Duration, FixedOffset, NaiveDate, Utc};

use crate::error::Result;
use crate::learner::{ImpactSet, WeightUpdateRecord};
use crate::ml::{PredictionRecord, Track};
use crate::series::{AttendancePoint, Series};

/// Asia/Hong_Kong. No daylight saving since 1979, so a fixed offset is exact.
///
/// Const-evaluated: an out-of-range offset fails the build, so the `None`
/// arm never runs.
pub const HKT: FixedOffset = match FixedOffset::east_opt(8 * 3600) {
    Some(offset) => offset,
    None => panic!("invalid HKT offset"),
};

// ==================== Clock Trait ====================

/// Trait for abstracting time access.
///
/// Every timestamp the core persists is taken from a `Clock` so tests can
/// pin it.
pub trait Clock: Send + Sync {
    /// Get the current time in UTC.
    fn now_utc(&self) -> DateTime<Utc>;

    /// Get the current time in Hong Kong.
    fn now_hkt(&self) -> DateTime<FixedOffset> {
        self.now_utc().with_timezone(&HKT)
    }

    /// Today's date in Hong Kong.
    fn today_hkt(&self) -> NaiveDate {
        self.now_hkt().date_naive()
    }
}

/// System clock implementation using real time.
#[derive(Debug, Clone, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_utc(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Mock clock for testing with controllable time.
#[derive(Debug, Clone)]
pub struct MockClock {
    utc_time: Arc<Mutex<DateTime<Utc>>>,
}

impl MockClock {
    /// Create a new mock clock set to the given UTC time.
    pub fn new(time: DateTime<Utc>) -> Self {
        Self {
            utc_time: Arc::new(Mutex::new(time)),
        }
    }

    /// Set the mock clock to a new time.
    pub fn set_time(&self, time: DateTime<Utc>) {
        *self.utc_time.lock().unwrap_or_else(PoisonError::into_inner) = time;
    }

    /// Advance the clock by a duration.
    pub fn advance(&self, duration: Duration) {
        let mut time = self.utc_time.lock().unwrap_or_else(PoisonError::into_inner);
        *time += duration;
    }
}

impl Clock for MockClock {
    fn now_utc(&self) -> DateTime<Utc> {
        *self.utc_time.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

// ==================== Attendance Store ====================

/// Source of truth for daily attendance.
pub trait AttendanceStore: Send + Sync {
    /// Full series, ordered by date. Fails with `StoreUnavailable` on
    /// transport errors and `Malformed` on invalid counts.
    fn load_series(&self) -> Result<Series>;

    /// Insert or overwrite the actual count for one date.
    fn upsert_actual(&self, point: AttendancePoint) -> Result<()>;
}

// ==================== Exogenous Lookups ====================

/// Pure per-date lookup over an exogenous table.
pub trait DailyLookup<T>: Send + Sync {
    /// Record for `date`, `None` when missing.
    fn get(&self, date: NaiveDate) -> Option<T>;

    /// Records for every date in `[start, end]` that has one.
    fn range(&self, start: NaiveDate, end: NaiveDate) -> Vec<(NaiveDate, T)> {
        start
            .iter_days()
            .take_while(|d| *d <= end)
            .filter_map(|d| self.get(d).map(|v| (d, v)))
            .collect()
    }
}

/// Public-holiday queries for the target jurisdiction.
pub trait HolidayProvider: Send + Sync {
    fn is_holiday(&self, date: NaiveDate) -> bool;

    /// Days from `date` to the next holiday on or after it, `None` if none is known.
    fn days_to_next_holiday(&self, date: NaiveDate) -> Option<i64>;

    /// Days from the previous holiday on or before `date`, `None` if none is known.
    fn days_since_previous_holiday(&self, date: NaiveDate) -> Option<i64>;

    /// The day before a holiday (and not itself a holiday).
    fn is_holiday_eve(&self, date: NaiveDate) -> bool {
        !self.is_holiday(date) && date.succ_opt().is_some_and(|d| self.is_holiday(d))
    }

    /// The first non-holiday after a holiday.
    fn is_post_holiday(&self, date: NaiveDate) -> bool {
        !self.is_holiday(date) && date.pred_opt().is_some_and(|d| self.is_holiday(d))
    }
}

// ==================== Prediction Log ====================

/// Prediction records keyed by (target date, model version, track).
pub trait PredictionLog: Send + Sync {
    /// Insert or replace the record with the same key.
    fn upsert(&self, record: PredictionRecord) -> Result<()>;

    /// All records for one target date, ordered by `predicted_at`.
    fn for_date(&self, date: NaiveDate) -> Result<Vec<PredictionRecord>>;

    /// All records with target date in `[start, end]`, ordered by date then `predicted_at`.
    fn range(&self, start: NaiveDate, end: NaiveDate) -> Result<Vec<PredictionRecord>>;

    /// Latest record for `date` on `track`.
    fn latest(&self, date: NaiveDate, track: Track) -> Result<Option<PredictionRecord>> {
        Ok(self
            .for_date(date)?
            .into_iter()
            .filter(|r| r.track == track)
            .max_by_key(|r| r.predicted_at))
    }
}

// ==================== Learner State ====================

/// Single-writer state owned by the continuous learner.
pub trait LearnerState: Send + Sync {
    /// Current weather-impact coefficients (empty when never fitted).
    fn impact_params(&self) -> Result<ImpactSet>;

    /// Replace the weather-impact coefficients.
    fn save_impact_params(&self, params: &ImpactSet) -> Result<()>;

    /// Latest fusion-weight record, `None` before the first publish.
    fn fusion_weights(&self) -> Result<Option<WeightUpdateRecord>>;

    /// Publish a new fusion-weight record as the current one.
    fn publish_fusion_weights(&self, record: &WeightUpdateRecord) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use chrono::{TimeZone, Timelike};

    use super::*;

    #[test]
    fn test_system_clock_returns_current_time() {
        let clock = SystemClock;
        let before = Utc::now();
        let clock_time = clock.now_utc();
        let after = Utc::now();

        assert!(clock_time >= before);
        assert!(clock_time <= after);
    }

    #[test]
    fn test_mock_clock_can_be_updated() {
        let time1 = Utc.with_ymd_and_hms(2024, 6, 15, 10, 0, 0).unwrap();
        let time2 = Utc.with_ymd_and_hms(2024, 6, 15, 14, 0, 0).unwrap();

        let clock = MockClock::new(time1);
        assert_eq!(clock.now_utc(), time1);

        clock.set_time(time2);
        assert_eq!(clock.now_utc(), time2);

        clock.advance(Duration::hours(2));
        assert_eq!(clock.now_utc(), time2 + Duration::hours(2));
    }

    #[test]
    fn test_hkt_is_utc_plus_eight() {
        // 20:30 UTC is already the next day in Hong Kong
        let clock = MockClock::new(Utc.with_ymd_and_hms(2024, 12, 31, 20, 30, 0).unwrap());
        let hkt = clock.now_hkt();
        assert_eq!(hkt.hour(), 4);
        assert_eq!(clock.today_hkt(), NaiveDate::from_ymd_opt(2025, 1, 1).unwrap());
        assert_eq!(hkt.offset().local_minus_utc(), 8 * 3600);
    }

    struct Fixed(BTreeSet<NaiveDate>);

    impl HolidayProvider for Fixed {
        fn is_holiday(&self, date: NaiveDate) -> bool {
            self.0.contains(&date)
        }
        fn days_to_next_holiday(&self, date: NaiveDate) -> Option<i64> {
            self.0.range(date..).next().map(|h| (*h - date).num_days())
        }
        fn days_since_previous_holiday(&self, date: NaiveDate) -> Option<i64> {
            self.0.range(..=date).next_back().map(|h| (date - *h).num_days())
        }
    }

    #[test]
    fn test_eve_and_post_holiday_defaults() {
        let xmas = NaiveDate::from_ymd_opt(2024, 12, 25).unwrap();
        let cal = Fixed([xmas].into_iter().collect());

        assert!(cal.is_holiday_eve(NaiveDate::from_ymd_opt(2024, 12, 24).unwrap()));
        assert!(!cal.is_holiday_eve(xmas));
        assert!(cal.is_post_holiday(NaiveDate::from_ymd_opt(2024, 12, 26).unwrap()));
        assert!(!cal.is_post_holiday(NaiveDate::from_ymd_opt(2024, 12, 27).unwrap()));
    }

    struct Squares;

    impl DailyLookup<u32> for Squares {
        fn get(&self, date: NaiveDate) -> Option<u32> {
            use chrono::Datelike;
            (date.day() % 2 == 0).then(|| date.day() * date.day())
        }
    }

    #[test]
    fn test_range_skips_missing_days() {
        let start = NaiveDate::from_ymd_opt(2024, 3, 1).unwrap();
        let end = NaiveDate::from_ymd_opt(2024, 3, 6).unwrap();
        let got: Vec<u32> = Squares.range(start, end).into_iter().map(|(_, v)| v).collect();
        assert_eq!(got, vec![4, 16, 36]);
    }
}
