//! Exogenous daily tables: weather, air quality and qualitative factors.
//!
//! Every field that the source may omit is an `Option`; the feature builder
//! turns `None` into NaN, never into zero.

use std::collections::BTreeMap;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::error::{ForecastError, Result};
use crate::holidays::HolidayCalendar;
use crate::traits::DailyLookup;

/// Daily weather observation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WeatherDay {
    pub date: NaiveDate,
    pub temp_mean: Option<f64>,
    pub temp_max: Option<f64>,
    pub temp_min: Option<f64>,
    /// Millimetres.
    pub rainfall: Option<f64>,
    /// Relative humidity, percent.
    pub humidity: Option<f64>,
    /// Mean sea-level pressure, hPa.
    pub pressure: Option<f64>,
    /// Mean wind speed, km/h.
    pub wind: Option<f64>,
    /// Kilometres.
    pub visibility: Option<f64>,
    /// Cloud cover, percent.
    pub cloud: Option<f64>,
    /// Bright sunshine, hours.
    pub sunshine: Option<f64>,
}

impl WeatherDay {
    pub fn empty(date: NaiveDate) -> Self {
        Self {
            date,
            ..Default::default()
        }
    }

    /// Overlay the fields present in `other` onto `self`.
    pub fn merge(&mut self, other: &WeatherDay) {
        macro_rules! take {
            ($($f:ident),*) => {
                $( if other.$f.is_some() { self.$f = other.$f; } )*
            };
        }
        take!(
            temp_mean, temp_max, temp_min, rainfall, humidity, pressure, wind, visibility, cloud,
            sunshine
        );
    }

    /// Daily temperature range, when both extremes are known.
    pub fn temp_range(&self) -> Option<f64> {
        Some(self.temp_max? - self.temp_min?)
    }
}

/// AQHI health-risk bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AqhiRisk {
    Low,
    Moderate,
    High,
    VeryHigh,
    Serious,
}

impl AqhiRisk {
    /// Bucket for an AQHI index value (1-3 low, 4-6 moderate, 7 high, 8-10 very high, 10+ serious).
    pub fn from_index(aqhi: f64) -> Self {
        match aqhi {
            a if a <= 3.0 => AqhiRisk::Low,
            a if a <= 6.0 => AqhiRisk::Moderate,
            a if a <= 7.0 => AqhiRisk::High,
            a if a <= 10.0 => AqhiRisk::VeryHigh,
            _ => AqhiRisk::Serious,
        }
    }

    /// Ordinal 0..=4, the encoding used as a feature.
    pub fn ordinal(self) -> f64 {
        match self {
            AqhiRisk::Low => 0.0,
            AqhiRisk::Moderate => 1.0,
            AqhiRisk::High => 2.0,
            AqhiRisk::VeryHigh => 3.0,
            AqhiRisk::Serious => 4.0,
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().replace(['-', ' '], "_").as_str() {
            "low" => Ok(AqhiRisk::Low),
            "moderate" => Ok(AqhiRisk::Moderate),
            "high" => Ok(AqhiRisk::High),
            "very_high" => Ok(AqhiRisk::VeryHigh),
            "serious" => Ok(AqhiRisk::Serious),
            other => Err(ForecastError::Malformed(format!("unknown AQHI risk '{}'", other))),
        }
    }
}

/// Daily air-quality summary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AqhiDay {
    pub date: NaiveDate,
    pub general_max: Option<f64>,
    pub roadside_max: Option<f64>,
    pub risk: Option<AqhiRisk>,
}

impl AqhiDay {
    /// Risk bucket, derived from the worst station reading when not given.
    pub fn effective_risk(&self) -> Option<AqhiRisk> {
        self.risk.or_else(|| {
            let worst = match (self.general_max, self.roadside_max) {
                (Some(g), Some(r)) => Some(g.max(r)),
                (g, r) => g.or(r),
            };
            worst.map(AqhiRisk::from_index)
        })
    }
}

/// Category of a qualitative factor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FactorCategory {
    Weather,
    Epidemic,
    Policy,
    Event,
    Other,
}

impl FactorCategory {
    pub const ALL: [FactorCategory; 5] = [
        FactorCategory::Weather,
        FactorCategory::Epidemic,
        FactorCategory::Policy,
        FactorCategory::Event,
        FactorCategory::Other,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            FactorCategory::Weather => "weather",
            FactorCategory::Epidemic => "epidemic",
            FactorCategory::Policy => "policy",
            FactorCategory::Event => "event",
            FactorCategory::Other => "other",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s.trim().to_ascii_lowercase().as_str() {
            "weather" => FactorCategory::Weather,
            "epidemic" | "health" => FactorCategory::Epidemic,
            "policy" => FactorCategory::Policy,
            "event" => FactorCategory::Event,
            _ => FactorCategory::Other,
        }
    }
}

/// Qualitative impact adjustment for one date.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QualitativeFactor {
    pub date: NaiveDate,
    pub multiplier: f64,
    pub confidence: f64,
    pub category: FactorCategory,
}

impl QualitativeFactor {
    pub const MIN_MULTIPLIER: f64 = 0.5;
    pub const MAX_MULTIPLIER: f64 = 1.5;

    /// Validated constructor; multipliers outside [0.5, 1.5] are rejected.
    pub fn new(
        date: NaiveDate,
        multiplier: f64,
        confidence: f64,
        category: FactorCategory,
    ) -> Result<Self> {
        if !(Self::MIN_MULTIPLIER..=Self::MAX_MULTIPLIER).contains(&multiplier) {
            return Err(ForecastError::Malformed(format!(
                "impact multiplier {} on {} outside [{}, {}]",
                multiplier,
                date,
                Self::MIN_MULTIPLIER,
                Self::MAX_MULTIPLIER
            )));
        }
        if !(0.0..=1.0).contains(&confidence) {
            return Err(ForecastError::Malformed(format!(
                "factor confidence {} on {} outside [0, 1]",
                confidence, date
            )));
        }
        Ok(Self {
            date,
            multiplier,
            confidence,
            category,
        })
    }
}

/// Records that know their own date.
pub trait Dated {
    fn date(&self) -> NaiveDate;
}

impl Dated for WeatherDay {
    fn date(&self) -> NaiveDate {
        self.date
    }
}

impl Dated for AqhiDay {
    fn date(&self) -> NaiveDate {
        self.date
    }
}

impl Dated for QualitativeFactor {
    fn date(&self) -> NaiveDate {
        self.date
    }
}

/// In-memory table of one record per date.
#[derive(Debug, Clone, PartialEq)]
pub struct DailyTable<T> {
    rows: BTreeMap<NaiveDate, T>,
}

impl<T> Default for DailyTable<T> {
    fn default() -> Self {
        Self {
            rows: BTreeMap::new(),
        }
    }
}

impl<T: Dated + Clone> DailyTable<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace the record for its date.
    pub fn insert(&mut self, row: T) {
        self.rows.insert(row.date(), row);
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Last date with a record: the table's horizon.
    pub fn last_date(&self) -> Option<NaiveDate> {
        self.rows.keys().next_back().copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.rows.values()
    }
}

impl<T: Dated + Clone> FromIterator<T> for DailyTable<T> {
    fn from_iter<I: IntoIterator<Item = T>>(iter: I) -> Self {
        let mut table = Self::new();
        for row in iter {
            table.insert(row);
        }
        table
    }
}

impl<T: Dated + Clone + Send + Sync> DailyLookup<T> for DailyTable<T> {
    fn get(&self, date: NaiveDate) -> Option<T> {
        self.rows.get(&date).cloned()
    }

    fn range(&self, start: NaiveDate, end: NaiveDate) -> Vec<(NaiveDate, T)> {
        if start > end {
            return Vec::new();
        }
        self.rows
            .range(start..=end)
            .map(|(d, v)| (*d, v.clone()))
            .collect()
    }
}

pub type WeatherTable = DailyTable<WeatherDay>;
pub type AqhiTable = DailyTable<AqhiDay>;
pub type FactorTable = DailyTable<QualitativeFactor>;

/// Snapshot of every exogenous stream used for one training or forecasting run.
#[derive(Debug, Clone, Default)]
pub struct Exogenous {
    pub weather: WeatherTable,
    pub aqhi: AqhiTable,
    pub factors: FactorTable,
    pub holidays: HolidayCalendar,
}

impl Exogenous {
    pub fn with_holidays(holidays: HolidayCalendar) -> Self {
        Self {
            holidays,
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn d(day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 7, day).unwrap()
    }

    #[test]
    fn test_weather_merge_keeps_existing_fields() {
        let mut base = WeatherDay {
            date: d(1),
            temp_mean: Some(28.0),
            humidity: Some(80.0),
            ..Default::default()
        };
        let update = WeatherDay {
            date: d(1),
            temp_mean: Some(29.5),
            rainfall: Some(12.0),
            ..Default::default()
        };
        base.merge(&update);
        assert_eq!(base.temp_mean, Some(29.5));
        assert_eq!(base.humidity, Some(80.0));
        assert_eq!(base.rainfall, Some(12.0));
        assert_eq!(base.temp_range(), None);
    }

    #[test]
    fn test_aqhi_bucket_boundaries() {
        assert_eq!(AqhiRisk::from_index(3.0), AqhiRisk::Low);
        assert_eq!(AqhiRisk::from_index(4.0), AqhiRisk::Moderate);
        assert_eq!(AqhiRisk::from_index(7.0), AqhiRisk::High);
        assert_eq!(AqhiRisk::from_index(9.0), AqhiRisk::VeryHigh);
        assert_eq!(AqhiRisk::from_index(11.0), AqhiRisk::Serious);
        assert_eq!(AqhiRisk::parse("Very High").unwrap(), AqhiRisk::VeryHigh);
        assert!(AqhiRisk::parse("awful").is_err());
    }

    #[test]
    fn test_effective_risk_uses_worst_station() {
        let day = AqhiDay {
            date: d(2),
            general_max: Some(5.0),
            roadside_max: Some(8.0),
            risk: None,
        };
        assert_eq!(day.effective_risk(), Some(AqhiRisk::VeryHigh));
    }

    #[test]
    fn test_factor_multiplier_is_validated() {
        assert!(QualitativeFactor::new(d(3), 1.2, 0.8, FactorCategory::Event).is_ok());
        assert!(matches!(
            QualitativeFactor::new(d(3), 1.8, 0.8, FactorCategory::Event),
            Err(ForecastError::Malformed(_))
        ));
        assert!(QualitativeFactor::new(d(3), 1.0, 1.5, FactorCategory::Other).is_err());
    }

    #[test]
    fn test_table_range_is_inclusive() {
        let table: WeatherTable = (1..=5).map(|i| WeatherDay::empty(d(i))).collect();
        assert_eq!(table.range(d(2), d(4)).len(), 3);
        assert!(table.range(d(4), d(2)).is_empty());
        assert_eq!(table.last_date(), Some(d(5)));
        assert!(table.get(d(9)).is_none());
    }
}
