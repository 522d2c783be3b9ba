//! Feature builder.
//!
//! Turns the attendance series plus exogenous tables into one vector per
//! date, in the order of a model-owned feature-name list. Every feature that
//! reads the attendance series goes through [`DenseHistory::past`], which
//! only exposes values strictly before the target date.
//!
//! Exogenous features for date D use the records for D and earlier. Missing
//! values are NaN; the booster routes them natively.

use std::collections::HashSet;
use std::f64::consts::PI;
use std::fmt;

use chrono::{Datelike, Duration, NaiveDate, Weekday};
use ndarray::{Array2, ArrayView1};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{ForecastError, Result};
use crate::exogenous::{AqhiRisk, Exogenous, FactorCategory, WeatherDay};
use crate::series::{DenseHistory, PastView, Series};
use crate::stats;
use crate::traits::{DailyLookup, HolidayProvider};

/// Holiday distances are clipped to this many days.
const HOLIDAY_DISTANCE_CAP: i64 = 30;
/// Longest run counted by the weather streak features.
const STREAK_CAP: i64 = 30;
const ROLL_POS_EPS: f64 = 1e-6;

pub const LAGS: [usize; 5] = [1, 7, 14, 30, 365];
pub const ROLL_WINDOWS: [usize; 6] = [3, 7, 14, 30, 60, 90];
pub const EWMA_SPANS: [usize; 5] = [3, 7, 14, 21, 30];
pub const DIFF_STEPS: [usize; 3] = [1, 7, 30];
pub const ROLL_POS_WINDOWS: [usize; 2] = [7, 30];
pub const TREND_WINDOWS: [usize; 2] = [7, 14];

/// Rolling statistic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RollStat {
    Mean,
    Std,
    Min,
    Max,
    Median,
}

impl RollStat {
    pub const ALL: [RollStat; 5] = [
        RollStat::Mean,
        RollStat::Std,
        RollStat::Min,
        RollStat::Max,
        RollStat::Median,
    ];

    fn as_str(self) -> &'static str {
        match self {
            RollStat::Mean => "Mean",
            RollStat::Std => "Std",
            RollStat::Min => "Min",
            RollStat::Max => "Max",
            RollStat::Median => "Median",
        }
    }

    fn apply(self, window: &[f64]) -> f64 {
        match self {
            RollStat::Mean => stats::mean(window),
            RollStat::Std => stats::std_dev(window),
            RollStat::Min => stats::min(window),
            RollStat::Max => stats::max(window),
            RollStat::Median => stats::median(window),
        }
    }
}

/// Raw weather columns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WeatherField {
    TempMean,
    TempMax,
    TempMin,
    Rainfall,
    Humidity,
    Pressure,
    Wind,
    Visibility,
    Cloud,
    Sunshine,
}

impl WeatherField {
    pub const ALL: [WeatherField; 10] = [
        WeatherField::TempMean,
        WeatherField::TempMax,
        WeatherField::TempMin,
        WeatherField::Rainfall,
        WeatherField::Humidity,
        WeatherField::Pressure,
        WeatherField::Wind,
        WeatherField::Visibility,
        WeatherField::Cloud,
        WeatherField::Sunshine,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            WeatherField::TempMean => "TempMean",
            WeatherField::TempMax => "TempMax",
            WeatherField::TempMin => "TempMin",
            WeatherField::Rainfall => "Rainfall",
            WeatherField::Humidity => "Humidity",
            WeatherField::Pressure => "Pressure",
            WeatherField::Wind => "Wind",
            WeatherField::Visibility => "Visibility",
            WeatherField::Cloud => "Cloud",
            WeatherField::Sunshine => "Sunshine",
        }
    }

    pub fn read(self, day: &WeatherDay) -> Option<f64> {
        match self {
            WeatherField::TempMean => day.temp_mean,
            WeatherField::TempMax => day.temp_max,
            WeatherField::TempMin => day.temp_min,
            WeatherField::Rainfall => day.rainfall,
            WeatherField::Humidity => day.humidity,
            WeatherField::Pressure => day.pressure,
            WeatherField::Wind => day.wind,
            WeatherField::Visibility => day.visibility,
            WeatherField::Cloud => day.cloud,
            WeatherField::Sunshine => day.sunshine,
        }
    }
}

/// Weather-derived indicators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WeatherFlag {
    TempRange,
    /// Mean temperature fell by more than 5 °C from the previous day.
    TempDrop,
    TempRise,
    /// More than 25 mm of rain.
    HeavyRain,
    /// Minimum at or below 12 °C.
    ExtremeCold,
    /// Maximum at or above 33 °C.
    ExtremeHot,
    /// Humidity at least 85% with a maximum of 30 °C or more.
    HumidHot,
    /// Mean below 15 °C with at least 1 mm of rain.
    ColdRain,
    /// Mean temperature change over three days.
    TempChange3,
    /// Rainfall summed over the day and the two before it.
    Rain3Sum,
    ColdStreak,
    HotStreak,
    RainStreak,
}

impl WeatherFlag {
    pub const ALL: [WeatherFlag; 13] = [
        WeatherFlag::TempRange,
        WeatherFlag::TempDrop,
        WeatherFlag::TempRise,
        WeatherFlag::HeavyRain,
        WeatherFlag::ExtremeCold,
        WeatherFlag::ExtremeHot,
        WeatherFlag::HumidHot,
        WeatherFlag::ColdRain,
        WeatherFlag::TempChange3,
        WeatherFlag::Rain3Sum,
        WeatherFlag::ColdStreak,
        WeatherFlag::HotStreak,
        WeatherFlag::RainStreak,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            WeatherFlag::TempRange => "TempRange",
            WeatherFlag::TempDrop => "TempDrop",
            WeatherFlag::TempRise => "TempRise",
            WeatherFlag::HeavyRain => "HeavyRain",
            WeatherFlag::ExtremeCold => "ExtremeCold",
            WeatherFlag::ExtremeHot => "ExtremeHot",
            WeatherFlag::HumidHot => "HumidHot",
            WeatherFlag::ColdRain => "ColdRain",
            WeatherFlag::TempChange3 => "TempChange3",
            WeatherFlag::Rain3Sum => "Rain3Sum",
            WeatherFlag::ColdStreak => "ColdStreak",
            WeatherFlag::HotStreak => "HotStreak",
            WeatherFlag::RainStreak => "RainStreak",
        }
    }
}

/// One named feature.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Feature {
    DayOfWeek,
    DowSin,
    DowCos,
    Month,
    MonthSin,
    MonthCos,
    DayOfMonth,
    Quarter,
    WeekOfYear,
    IsWeekend,
    IsMonthStart,
    IsMonthEnd,
    IsHoliday,
    DaysToHoliday,
    DaysSinceHoliday,
    IsHolidayEve,
    IsPostHoliday,
    Lag(usize),
    Roll(usize, RollStat),
    Ewma(usize),
    /// count(D−1) − count(D−1−k)
    Diff(usize),
    /// Relative change over the same span as `Diff`.
    Pct(usize),
    DowMean,
    MonthMean,
    RollPos(usize),
    Trend(usize),
    Weather(WeatherField),
    WeatherFlag(WeatherFlag),
    AqhiGeneral,
    AqhiRoadside,
    AqhiRisk,
    AqhiHigh,
    AqhiVeryHigh,
    AiFactor,
    AiCategory(FactorCategory),
}

impl Feature {
    /// Whether the value is derived from the attendance series itself.
    pub fn is_target_derived(&self) -> bool {
        matches!(
            self,
            Feature::Lag(_)
                | Feature::Roll(..)
                | Feature::Ewma(_)
                | Feature::Diff(_)
                | Feature::Pct(_)
                | Feature::DowMean
                | Feature::MonthMean
                | Feature::RollPos(_)
                | Feature::Trend(_)
        )
    }

    /// Parse a feature name such as `Lag7`, `Roll30Median` or `AiCatEpidemic`.
    pub fn parse(name: &str) -> Option<Feature> {
        let simple = match name {
            "DayOfWeek" => Some(Feature::DayOfWeek),
            "DowSin" => Some(Feature::DowSin),
            "DowCos" => Some(Feature::DowCos),
            "Month" => Some(Feature::Month),
            "MonthSin" => Some(Feature::MonthSin),
            "MonthCos" => Some(Feature::MonthCos),
            "DayOfMonth" => Some(Feature::DayOfMonth),
            "Quarter" => Some(Feature::Quarter),
            "WeekOfYear" => Some(Feature::WeekOfYear),
            "IsWeekend" => Some(Feature::IsWeekend),
            "IsMonthStart" => Some(Feature::IsMonthStart),
            "IsMonthEnd" => Some(Feature::IsMonthEnd),
            "IsHoliday" => Some(Feature::IsHoliday),
            "DaysToHoliday" => Some(Feature::DaysToHoliday),
            "DaysSinceHoliday" => Some(Feature::DaysSinceHoliday),
            "IsHolidayEve" => Some(Feature::IsHolidayEve),
            "IsPostHoliday" => Some(Feature::IsPostHoliday),
            "DowMean" => Some(Feature::DowMean),
            "MonthMean" => Some(Feature::MonthMean),
            "AqhiGeneral" => Some(Feature::AqhiGeneral),
            "AqhiRoadside" => Some(Feature::AqhiRoadside),
            "AqhiRisk" => Some(Feature::AqhiRisk),
            "AqhiHigh" => Some(Feature::AqhiHigh),
            "AqhiVeryHigh" => Some(Feature::AqhiVeryHigh),
            "AiFactor" => Some(Feature::AiFactor),
            _ => None,
        };
        if simple.is_some() {
            return simple;
        }
        if let Some(f) = WeatherField::ALL.iter().find(|f| f.as_str() == name) {
            return Some(Feature::Weather(*f));
        }
        if let Some(f) = WeatherFlag::ALL.iter().find(|f| f.as_str() == name) {
            return Some(Feature::WeatherFlag(*f));
        }
        if let Some(cat) = name.strip_prefix("AiCat") {
            return FactorCategory::ALL
                .iter()
                .find(|c| capitalize(c.as_str()) == cat)
                .map(|c| Feature::AiCategory(*c));
        }
        if let Some(rest) = name.strip_prefix("Roll") {
            if let Some(k) = rest.strip_prefix("Pos") {
                return parse_param(k).map(Feature::RollPos);
            }
            for stat in RollStat::ALL {
                if let Some(w) = rest.strip_suffix(stat.as_str()) {
                    return parse_param(w).map(|w| Feature::Roll(w, stat));
                }
            }
            return None;
        }
        let prefixed: [(&str, fn(usize) -> Feature); 5] = [
            ("Lag", Feature::Lag),
            ("Ewma", Feature::Ewma),
            ("Diff", Feature::Diff),
            ("Pct", Feature::Pct),
            ("Trend", Feature::Trend),
        ];
        prefixed
            .iter()
            .find_map(|(p, make)| name.strip_prefix(p).and_then(parse_param).map(make))
    }

    /// Smallest history a target-derived feature needs before it is defined.
    fn min_periods(window: usize) -> usize {
        (window / 2).max(1)
    }
}

impl fmt::Display for Feature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Feature::Lag(k) => write!(f, "Lag{}", k),
            Feature::Roll(w, s) => write!(f, "Roll{}{}", w, s.as_str()),
            Feature::Ewma(s) => write!(f, "Ewma{}", s),
            Feature::Diff(k) => write!(f, "Diff{}", k),
            Feature::Pct(k) => write!(f, "Pct{}", k),
            Feature::RollPos(w) => write!(f, "RollPos{}", w),
            Feature::Trend(w) => write!(f, "Trend{}", w),
            Feature::Weather(w) => f.write_str(w.as_str()),
            Feature::WeatherFlag(w) => f.write_str(w.as_str()),
            Feature::AiCategory(c) => write!(f, "AiCat{}", capitalize(c.as_str())),
            other => write!(f, "{:?}", other),
        }
    }
}

fn parse_param(s: &str) -> Option<usize> {
    if s.is_empty() || s.starts_with('0') || !s.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    s.parse().ok()
}

fn capitalize(s: &str) -> String {
    let mut chars = s.chars();
    match chars.next() {
        Some(c) => c.to_ascii_uppercase().to_string() + chars.as_str(),
        None => String::new(),
    }
}

/// Cyclical encoding for periodic features
/// Returns (sin, cos) encoding to preserve continuity
fn cyclical_encode(value: f64, period: f64) -> (f64, f64) {
    let angle = 2.0 * PI * value / period;
    (angle.sin(), angle.cos())
}

/// The full catalogue in canonical order.
pub fn catalogue() -> Vec<Feature> {
    let mut out = vec![
        Feature::DayOfWeek,
        Feature::DowSin,
        Feature::DowCos,
        Feature::Month,
        Feature::MonthSin,
        Feature::MonthCos,
        Feature::DayOfMonth,
        Feature::Quarter,
        Feature::WeekOfYear,
        Feature::IsWeekend,
        Feature::IsMonthStart,
        Feature::IsMonthEnd,
        Feature::IsHoliday,
        Feature::DaysToHoliday,
        Feature::DaysSinceHoliday,
        Feature::IsHolidayEve,
        Feature::IsPostHoliday,
    ];
    out.extend(LAGS.iter().map(|k| Feature::Lag(*k)));
    for w in ROLL_WINDOWS {
        out.extend(RollStat::ALL.iter().map(|s| Feature::Roll(w, *s)));
    }
    out.extend(EWMA_SPANS.iter().map(|s| Feature::Ewma(*s)));
    out.extend(DIFF_STEPS.iter().map(|k| Feature::Diff(*k)));
    out.extend(DIFF_STEPS.iter().map(|k| Feature::Pct(*k)));
    out.extend([Feature::DowMean, Feature::MonthMean]);
    out.extend(ROLL_POS_WINDOWS.iter().map(|w| Feature::RollPos(*w)));
    out.extend(TREND_WINDOWS.iter().map(|w| Feature::Trend(*w)));
    out.extend(WeatherField::ALL.iter().map(|w| Feature::Weather(*w)));
    out.extend(WeatherFlag::ALL.iter().map(|w| Feature::WeatherFlag(*w)));
    out.extend([
        Feature::AqhiGeneral,
        Feature::AqhiRoadside,
        Feature::AqhiRisk,
        Feature::AqhiHigh,
        Feature::AqhiVeryHigh,
        Feature::AiFactor,
    ]);
    out.extend(FactorCategory::ALL.iter().map(|c| Feature::AiCategory(*c)));
    out
}

/// Ordered, validated feature-name list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "Vec<String>", into = "Vec<String>")]
pub struct FeatureSet {
    names: Vec<String>,
    features: Vec<Feature>,
}

impl FeatureSet {
    /// Parse names in order. Unknown or repeated names make the list invalid.
    pub fn parse<S: AsRef<str>>(names: &[S]) -> Result<Self> {
        if names.is_empty() {
            return Err(ForecastError::ArtifactInvalid("empty feature list".into()));
        }
        let mut seen = HashSet::new();
        let mut features = Vec::with_capacity(names.len());
        for name in names {
            let name = name.as_ref();
            let feature = Feature::parse(name).ok_or_else(|| {
                ForecastError::ArtifactInvalid(format!("unknown feature '{}'", name))
            })?;
            if !seen.insert(feature) {
                return Err(ForecastError::ArtifactInvalid(format!(
                    "feature '{}' listed twice",
                    name
                )));
            }
            features.push(feature);
        }
        Ok(Self {
            names: features.iter().map(|f| f.to_string()).collect(),
            features,
        })
    }

    pub fn from_features(features: Vec<Feature>) -> Result<Self> {
        let names: Vec<String> = features.iter().map(|f| f.to_string()).collect();
        Self::parse(&names)
    }

    pub fn catalogue() -> Self {
        let features = catalogue();
        Self {
            names: features.iter().map(|f| f.to_string()).collect(),
            features,
        }
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }

    pub fn features(&self) -> &[Feature] {
        &self.features
    }

    pub fn len(&self) -> usize {
        self.features.len()
    }

    pub fn is_empty(&self) -> bool {
        self.features.is_empty()
    }

    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.names.iter().position(|n| n == name)
    }

    /// Columns whose NaN disqualifies a training row.
    pub fn required_columns(&self) -> Vec<usize> {
        self.features
            .iter()
            .enumerate()
            .filter(|(_, f)| f.is_target_derived())
            .map(|(i, _)| i)
            .collect()
    }

    /// Byte-identical comparison with an artifact's list.
    pub fn ensure_matches(&self, expected: &[String]) -> Result<()> {
        if self.names.as_slice() != expected {
            return Err(ForecastError::ArtifactInvalid(format!(
                "feature list mismatch: artifact has {} names, builder has {}",
                expected.len(),
                self.names.len()
            )));
        }
        Ok(())
    }
}

impl TryFrom<Vec<String>> for FeatureSet {
    type Error = ForecastError;

    fn try_from(names: Vec<String>) -> Result<Self> {
        Self::parse(&names)
    }
}

impl From<FeatureSet> for Vec<String> {
    fn from(set: FeatureSet) -> Self {
        set.names
    }
}

/// Feature rows for a run of dates.
#[derive(Debug, Clone)]
pub struct FeatureMatrix {
    pub names: Vec<String>,
    pub dates: Vec<NaiveDate>,
    pub x: Array2<f64>,
    /// Observed attendance per row, NaN where unknown.
    pub y: Vec<f64>,
}

impl FeatureMatrix {
    pub fn n_rows(&self) -> usize {
        self.dates.len()
    }

    /// Rows satisfying `keep`, in order.
    pub fn filter_rows<F: Fn(usize) -> bool>(&self, keep: F) -> FeatureMatrix {
        let idx: Vec<usize> = (0..self.n_rows()).filter(|i| keep(*i)).collect();
        self.take_rows(&idx)
    }

    pub fn take_rows(&self, idx: &[usize]) -> FeatureMatrix {
        let n_cols = self.x.ncols();
        let mut x = Array2::<f64>::zeros((idx.len(), n_cols));
        for (out, i) in idx.iter().enumerate() {
            x.row_mut(out).assign(&self.x.row(*i));
        }
        FeatureMatrix {
            names: self.names.clone(),
            dates: idx.iter().map(|i| self.dates[*i]).collect(),
            x,
            y: idx.iter().map(|i| self.y[*i]).collect(),
        }
    }

    /// Contiguous row range.
    pub fn slice_rows(&self, start: usize, end: usize) -> FeatureMatrix {
        let idx: Vec<usize> = (start..end.min(self.n_rows())).collect();
        self.take_rows(&idx)
    }

    /// Columns reordered to `names`.
    pub fn project(&self, names: &[String]) -> Result<FeatureMatrix> {
        let cols: Vec<usize> = names
            .iter()
            .map(|n| {
                self.names.iter().position(|m| m == n).ok_or_else(|| {
                    ForecastError::ArtifactInvalid(format!("feature '{}' not built", n))
                })
            })
            .collect::<Result<_>>()?;
        let mut x = Array2::<f64>::zeros((self.n_rows(), cols.len()));
        for (j, c) in cols.iter().enumerate() {
            x.column_mut(j).assign(&self.x.column(*c));
        }
        Ok(FeatureMatrix {
            names: names.to_vec(),
            dates: self.dates.clone(),
            x,
            y: self.y.clone(),
        })
    }

    /// Rows with a known target and no missing value in `required` columns.
    pub fn trainable_rows(&self, required: &[usize]) -> Vec<usize> {
        (0..self.n_rows())
            .filter(|i| self.y[*i].is_finite())
            .filter(|i| required.iter().all(|c| self.x[[*i, *c]].is_finite()))
            .collect()
    }
}

/// Builds feature vectors against a fixed exogenous snapshot.
pub struct FeatureBuilder<'a> {
    exo: &'a Exogenous,
    set: FeatureSet,
}

impl<'a> FeatureBuilder<'a> {
    pub fn new(exo: &'a Exogenous, set: FeatureSet) -> Self {
        Self { exo, set }
    }

    pub fn feature_set(&self) -> &FeatureSet {
        &self.set
    }

    /// Vector for `date`, reading the attendance history only before `date`.
    pub fn vector(&self, history: &DenseHistory, date: NaiveDate) -> Vec<f64> {
        let eve = date - Duration::days(1);
        if history.end().is_some_and(|end| end < eve) {
            // days between the history and `date` are unobserved, not absent
            let mut padded = history.clone();
            padded.extend_to(eve);
            return self.vector(&padded, date);
        }
        let past = history.past(date);
        self.set
            .features()
            .iter()
            .map(|f| self.value(*f, date, &past))
            .collect()
    }

    /// Matrix for `dates`, in order.
    pub fn matrix(&self, series: &Series, dates: &[NaiveDate]) -> FeatureMatrix {
        let history = series.dense();
        let mut x = Array2::<f64>::zeros((dates.len(), self.set.len()));
        for (i, date) in dates.iter().enumerate() {
            let row = self.vector(&history, *date);
            x.row_mut(i).assign(&ArrayView1::from(row.as_slice()));
        }
        debug!(rows = dates.len(), features = self.set.len(), "built feature matrix");
        FeatureMatrix {
            names: self.set.names().to_vec(),
            dates: dates.to_vec(),
            x,
            y: dates
                .iter()
                .map(|d| series.get(*d).unwrap_or(f64::NAN))
                .collect(),
        }
    }

    /// Perturb everything on or after each sampled date and require the
    /// vector for that date to stay bit-identical.
    pub fn audit_leakage(&self, series: &Series, dates: &[NaiveDate]) -> Result<()> {
        let history = series.dense();
        for date in dates {
            let before = self.vector(&history, *date);
            let mut perturbed = history.clone();
            let mut d = *date;
            while let Some(end) = perturbed.end() {
                if d > end {
                    break;
                }
                let v = perturbed.value_on(d);
                perturbed.set(d, if v.is_nan() { 997.0 } else { v * 3.0 + 17.0 });
                d += Duration::days(1);
            }
            let after = self.vector(&perturbed, *date);
            for (i, (a, b)) in before.iter().zip(&after).enumerate() {
                if a.to_bits() != b.to_bits() && !(a.is_nan() && b.is_nan()) {
                    return Err(ForecastError::LeakageDetected(format!(
                        "feature '{}' at {} changed when later attendance changed",
                        self.set.names()[i],
                        date
                    )));
                }
            }
        }
        Ok(())
    }

    fn value(&self, feature: Feature, date: NaiveDate, past: &PastView<'_>) -> f64 {
        match feature {
            Feature::DayOfWeek => f64::from(date.weekday().num_days_from_monday()),
            Feature::DowSin => {
                cyclical_encode(f64::from(date.weekday().num_days_from_monday()), 7.0).0
            }
            Feature::DowCos => {
                cyclical_encode(f64::from(date.weekday().num_days_from_monday()), 7.0).1
            }
            Feature::Month => f64::from(date.month()),
            Feature::MonthSin => cyclical_encode(f64::from(date.month0()), 12.0).0,
            Feature::MonthCos => cyclical_encode(f64::from(date.month0()), 12.0).1,
            Feature::DayOfMonth => f64::from(date.day()),
            Feature::Quarter => f64::from(date.month0() / 3 + 1),
            Feature::WeekOfYear => f64::from(date.iso_week().week()),
            Feature::IsWeekend => flag(matches!(date.weekday(), Weekday::Sat | Weekday::Sun)),
            Feature::IsMonthStart => flag(date.day() == 1),
            Feature::IsMonthEnd => flag(date.succ_opt().is_some_and(|d| d.day() == 1)),
            Feature::IsHoliday => flag(self.exo.holidays.is_holiday(date)),
            Feature::DaysToHoliday => self
                .exo
                .holidays
                .days_to_next_holiday(date)
                .unwrap_or(HOLIDAY_DISTANCE_CAP)
                .clamp(0, HOLIDAY_DISTANCE_CAP) as f64,
            Feature::DaysSinceHoliday => self
                .exo
                .holidays
                .days_since_previous_holiday(date)
                .unwrap_or(HOLIDAY_DISTANCE_CAP)
                .clamp(0, HOLIDAY_DISTANCE_CAP) as f64,
            Feature::IsHolidayEve => flag(self.exo.holidays.is_holiday_eve(date)),
            Feature::IsPostHoliday => flag(self.exo.holidays.is_post_holiday(date)),
            Feature::Lag(k) => past.lag(k),
            Feature::Roll(w, stat) => {
                let window = past.window(w);
                if stats::count_finite(window) < Feature::min_periods(w) {
                    f64::NAN
                } else {
                    stat.apply(window)
                }
            }
            Feature::Ewma(span) => {
                let alpha = 2.0 / (span as f64 + 1.0);
                // weights below 1e-10 of the newest are dropped
                let reach = ((1e-10f64).ln() / (1.0 - alpha).ln()).ceil() as usize;
                stats::ewma(past.window(reach.max(1)), span as f64)
            }
            Feature::Diff(k) => past.lag(1) - past.lag(1 + k),
            Feature::Pct(k) => {
                let base = past.lag(1 + k);
                if base.is_finite() && base != 0.0 {
                    (past.lag(1) - base) / base
                } else {
                    f64::NAN
                }
            }
            Feature::DowMean => {
                let all = past.all();
                let same_weekday: Vec<f64> = (1..=all.len() / 7)
                    .map(|k| all[all.len() - 7 * k])
                    .collect();
                stats::mean(&same_weekday)
            }
            Feature::MonthMean => {
                let month = date.month();
                let same_month: Vec<f64> = past
                    .all()
                    .iter()
                    .enumerate()
                    .filter(|(i, _)| past.date_at(*i).month() == month)
                    .map(|(_, v)| *v)
                    .collect();
                stats::mean(&same_month)
            }
            Feature::RollPos(w) => {
                let window = past.window(w);
                if stats::count_finite(window) < Feature::min_periods(w) {
                    return f64::NAN;
                }
                let (lo, hi) = (stats::min(window), stats::max(window));
                (past.lag(1) - lo) / (hi - lo + ROLL_POS_EPS)
            }
            Feature::Trend(w) => {
                let window = past.window(w);
                if stats::count_finite(window) < Feature::min_periods(w).max(2) {
                    f64::NAN
                } else {
                    stats::ols_slope(window)
                }
            }
            Feature::Weather(field) => self
                .weather(date)
                .and_then(|w| field.read(&w))
                .unwrap_or(f64::NAN),
            Feature::WeatherFlag(flag_kind) => self.weather_flag(flag_kind, date),
            Feature::AqhiGeneral => self
                .exo
                .aqhi
                .get(date)
                .and_then(|a| a.general_max)
                .unwrap_or(f64::NAN),
            Feature::AqhiRoadside => self
                .exo
                .aqhi
                .get(date)
                .and_then(|a| a.roadside_max)
                .unwrap_or(f64::NAN),
            Feature::AqhiRisk => self
                .aqhi_risk(date)
                .map(AqhiRisk::ordinal)
                .unwrap_or(f64::NAN),
            Feature::AqhiHigh => self
                .aqhi_risk(date)
                .map(|r| flag(r >= AqhiRisk::High))
                .unwrap_or(f64::NAN),
            Feature::AqhiVeryHigh => self
                .aqhi_risk(date)
                .map(|r| flag(r >= AqhiRisk::VeryHigh))
                .unwrap_or(f64::NAN),
            Feature::AiFactor => self
                .exo
                .factors
                .get(date)
                .map(|f| f.multiplier)
                .unwrap_or(1.0),
            Feature::AiCategory(cat) => flag(
                self.exo
                    .factors
                    .get(date)
                    .is_some_and(|f| f.category == cat),
            ),
        }
    }

    fn weather(&self, date: NaiveDate) -> Option<WeatherDay> {
        self.exo.weather.get(date)
    }

    fn weather_field(&self, date: NaiveDate, field: WeatherField) -> Option<f64> {
        self.weather(date).and_then(|w| field.read(&w))
    }

    fn aqhi_risk(&self, date: NaiveDate) -> Option<AqhiRisk> {
        self.exo.aqhi.get(date).and_then(|a| a.effective_risk())
    }

    fn weather_flag(&self, kind: WeatherFlag, date: NaiveDate) -> f64 {
        use WeatherField as W;
        let field = |d: NaiveDate, f: W| self.weather_field(d, f);
        let prev = |k: i64| date - Duration::days(k);
        let out = match kind {
            WeatherFlag::TempRange => self.weather(date).and_then(|w| w.temp_range()),
            WeatherFlag::TempDrop => field(date, W::TempMean)
                .zip(field(prev(1), W::TempMean))
                .map(|(t, y)| flag(t - y < -5.0)),
            WeatherFlag::TempRise => field(date, W::TempMean)
                .zip(field(prev(1), W::TempMean))
                .map(|(t, y)| flag(t - y > 5.0)),
            WeatherFlag::HeavyRain => field(date, W::Rainfall).map(|r| flag(r > 25.0)),
            WeatherFlag::ExtremeCold => field(date, W::TempMin).map(|t| flag(t <= 12.0)),
            WeatherFlag::ExtremeHot => field(date, W::TempMax).map(|t| flag(t >= 33.0)),
            WeatherFlag::HumidHot => field(date, W::Humidity)
                .zip(field(date, W::TempMax))
                .map(|(h, t)| flag(h >= 85.0 && t >= 30.0)),
            WeatherFlag::ColdRain => field(date, W::TempMean)
                .zip(field(date, W::Rainfall))
                .map(|(t, r)| flag(t < 15.0 && r >= 1.0)),
            WeatherFlag::TempChange3 => field(date, W::TempMean)
                .zip(field(prev(3), W::TempMean))
                .map(|(t, p)| t - p),
            WeatherFlag::Rain3Sum => {
                let rain: Vec<f64> = (0..3).filter_map(|k| field(prev(k), W::Rainfall)).collect();
                (!rain.is_empty()).then(|| rain.iter().sum::<f64>())
            }
            WeatherFlag::ColdStreak => self.streak(date, |w| w.temp_min.map(|t| t <= 12.0)),
            WeatherFlag::HotStreak => self.streak(date, |w| w.temp_max.map(|t| t >= 33.0)),
            WeatherFlag::RainStreak => self.streak(date, |w| w.rainfall.map(|r| r >= 1.0)),
        };
        out.unwrap_or(f64::NAN)
    }

    /// Consecutive days ending at `date` satisfying `cond`; `None` if `date` has no reading.
    fn streak<F>(&self, date: NaiveDate, cond: F) -> Option<f64>
    where
        F: Fn(&WeatherDay) -> Option<bool>,
    {
        let today = cond(&self.weather(date)?)?;
        if !today {
            return Some(0.0);
        }
        let mut n = 1;
        while n < STREAK_CAP {
            let day = date - Duration::days(n);
            match self.weather(day).and_then(|w| cond(&w)) {
                Some(true) => n += 1,
                _ => break,
            }
        }
        Some(n as f64)
    }
}

fn flag(b: bool) -> f64 {
    if b { 1.0 } else { 0.0 }
}

/// Build the matrix for `dates` with the given names.
///
/// This is the free-function form of [`FeatureBuilder::matrix`]; the name
/// list is parsed and validated first.
pub fn build_features(
    series: &Series,
    exo: &Exogenous,
    names: &[String],
    dates: &[NaiveDate],
) -> Result<FeatureMatrix> {
    let set = FeatureSet::parse(names)?;
    let builder = FeatureBuilder::new(exo, set);
    let matrix = builder.matrix(series, dates);
    let empty: Vec<&String> = names
        .iter()
        .enumerate()
        .filter(|(j, _)| matrix.x.column(*j).iter().all(|v| v.is_nan()))
        .map(|(_, n)| n)
        .collect();
    if !empty.is_empty() && !dates.is_empty() {
        warn!(features = ?empty, "features are missing on every requested date");
    }
    Ok(matrix)
}

#[cfg(test)]
mod tests {
    use approx::assert_relative_eq;

    use super::*;
    use crate::exogenous::{AqhiDay, QualitativeFactor};
    use crate::holidays::HolidayCalendar;
    use crate::series::AttendancePoint;

    fn d(y: i32, m: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, day).unwrap()
    }

    fn ramp(start: NaiveDate, n: usize) -> Series {
        Series::from_points((0..n).map(|i| AttendancePoint {
            date: start + Duration::days(i as i64),
            count: 200 + 10 * i as u32,
        }))
    }

    fn names(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_every_catalogue_name_round_trips() {
        for f in catalogue() {
            assert_eq!(Feature::parse(&f.to_string()), Some(f), "{}", f);
        }
        assert_eq!(catalogue().len(), FeatureSet::catalogue().len());
    }

    #[test]
    fn test_unknown_and_duplicate_names_are_invalid() {
        assert!(matches!(
            FeatureSet::parse(&names(&["Lag1", "Bogus"])),
            Err(ForecastError::ArtifactInvalid(_))
        ));
        assert!(matches!(
            FeatureSet::parse(&names(&["Lag1", "Lag1"])),
            Err(ForecastError::ArtifactInvalid(_))
        ));
        assert!(Feature::parse("Lag07").is_none());
        assert!(Feature::parse("Roll7Mode").is_none());
        assert_eq!(Feature::parse("Roll45Median"), Some(Feature::Roll(45, RollStat::Median)));
        assert_eq!(
            Feature::parse("AiCatEpidemic"),
            Some(Feature::AiCategory(FactorCategory::Epidemic))
        );
    }

    #[test]
    fn test_lag_vector_for_first_unseen_day() {
        let series = ramp(d(2024, 1, 1), 7);
        let m = build_features(&series, &Exogenous::default(), &names(&["Lag1", "Lag7"]), &[d(2024, 1, 8)])
            .unwrap();
        assert_eq!(m.x.row(0).to_vec(), vec![260.0, 200.0]);
        assert!(m.y[0].is_nan());
    }

    #[test]
    fn test_rolling_window_ends_the_day_before() {
        let series = ramp(d(2024, 1, 1), 10);
        let set = FeatureSet::parse(&names(&["Roll3Mean", "Roll3Max", "Roll7Min", "Diff1", "Diff7"]))
            .unwrap();
        let exo = Exogenous::default();
        let builder = FeatureBuilder::new(&exo, set);
        let v = builder.vector(&series.dense(), d(2024, 1, 10));
        // window for 10 Jan is 7..9 Jan = 260, 270, 280
        assert_relative_eq!(v[0], 270.0);
        assert_relative_eq!(v[1], 280.0);
        assert_relative_eq!(v[2], 220.0);
        // 9 Jan minus 8 Jan, 9 Jan minus 2 Jan
        assert_relative_eq!(v[3], 10.0);
        assert_relative_eq!(v[4], 70.0);
    }

    #[test]
    fn test_rolling_needs_half_a_window() {
        let series = ramp(d(2024, 1, 1), 3);
        let set = FeatureSet::parse(&names(&["Roll7Mean", "Roll3Mean", "Trend7"])).unwrap();
        let exo = Exogenous::default();
        let builder = FeatureBuilder::new(&exo, set);
        let v = builder.vector(&series.dense(), d(2024, 1, 3));
        // two observations: below 7/2 = 3, at least 3/2 = 1
        assert!(v[0].is_nan());
        assert_relative_eq!(v[1], 205.0);
        assert!(v[2].is_nan());
    }

    #[test]
    fn test_target_encodings_use_only_the_past() {
        let series = ramp(d(2024, 1, 1), 21);
        let set = FeatureSet::parse(&names(&["DowMean", "MonthMean"])).unwrap();
        let exo = Exogenous::default();
        let builder = FeatureBuilder::new(&exo, set);
        let v = builder.vector(&series.dense(), d(2024, 1, 15));
        // same weekday before 15 Jan: 1 Jan (200) and 8 Jan (270)
        assert_relative_eq!(v[0], 235.0);
        // 1..14 Jan
        assert_relative_eq!(v[1], 265.0);
    }

    #[test]
    fn test_calendar_and_holiday_features() {
        let exo = Exogenous::with_holidays(HolidayCalendar::new([d(2024, 12, 25)]));
        let set = FeatureSet::parse(&names(&[
            "DayOfWeek",
            "IsWeekend",
            "IsHoliday",
            "DaysToHoliday",
            "DaysSinceHoliday",
            "IsHolidayEve",
            "IsMonthEnd",
            "Quarter",
        ]))
        .unwrap();
        let builder = FeatureBuilder::new(&exo, set);
        let empty = Series::new().dense();

        let eve = builder.vector(&empty, d(2024, 12, 24));
        assert_eq!(eve, vec![1.0, 0.0, 0.0, 1.0, 30.0, 1.0, 0.0, 4.0]);

        let xmas = builder.vector(&empty, d(2024, 12, 25));
        assert_eq!(xmas[2..5], [1.0, 0.0, 0.0]);

        let nye = builder.vector(&empty, d(2024, 12, 31));
        assert_eq!(nye[4], 6.0);
        assert_eq!(nye[6], 1.0);
        // far before the only holiday the distance is clipped
        assert_eq!(builder.vector(&empty, d(2024, 6, 1))[3], 30.0);
    }

    #[test]
    fn test_weather_missing_is_nan_and_flags_fire() {
        let mut exo = Exogenous::default();
        exo.weather.insert(WeatherDay {
            date: d(2024, 1, 1),
            temp_mean: Some(20.0),
            rainfall: Some(10.0),
            ..Default::default()
        });
        exo.weather.insert(WeatherDay {
            date: d(2024, 1, 2),
            temp_mean: Some(13.0),
            temp_min: Some(10.0),
            rainfall: Some(30.0),
            ..Default::default()
        });
        let set = FeatureSet::parse(&names(&[
            "TempMean",
            "Humidity",
            "TempDrop",
            "HeavyRain",
            "ExtremeCold",
            "ColdRain",
            "Rain3Sum",
            "RainStreak",
        ]))
        .unwrap();
        let builder = FeatureBuilder::new(&exo, set);
        let v = builder.vector(&Series::new().dense(), d(2024, 1, 2));
        assert_eq!(v[0], 13.0);
        assert!(v[1].is_nan());
        assert_eq!(&v[2..], &[1.0, 1.0, 1.0, 1.0, 40.0, 2.0]);

        let none = builder.vector(&Series::new().dense(), d(2024, 1, 5));
        assert!(none.iter().all(|v| v.is_nan()));
    }

    #[test]
    fn test_aqhi_and_factor_features() {
        let mut exo = Exogenous::default();
        exo.aqhi.insert(AqhiDay {
            date: d(2024, 3, 1),
            general_max: Some(6.0),
            roadside_max: Some(8.0),
            risk: None,
        });
        exo.factors.insert(
            QualitativeFactor::new(d(2024, 3, 1), 1.2, 0.7, FactorCategory::Epidemic).unwrap(),
        );
        let set = FeatureSet::parse(&names(&[
            "AqhiRisk",
            "AqhiHigh",
            "AqhiVeryHigh",
            "AiFactor",
            "AiCatEpidemic",
            "AiCatEvent",
        ]))
        .unwrap();
        let builder = FeatureBuilder::new(&exo, set);
        let empty = Series::new().dense();
        assert_eq!(builder.vector(&empty, d(2024, 3, 1)), vec![3.0, 1.0, 1.0, 1.2, 1.0, 0.0]);
        let other = builder.vector(&empty, d(2024, 3, 2));
        assert!(other[0].is_nan());
        assert_eq!(&other[3..], &[1.0, 0.0, 0.0]);
    }

    #[test]
    fn test_leakage_audit_passes_for_catalogue() {
        let series = ramp(d(2023, 1, 1), 400);
        let exo = Exogenous::default();
        let builder = FeatureBuilder::new(&exo, FeatureSet::catalogue());
        builder
            .audit_leakage(&series, &[d(2023, 6, 1), d(2024, 1, 20), d(2024, 2, 4)])
            .unwrap();
    }

    #[test]
    fn test_trainable_rows_require_target_features() {
        let series = ramp(d(2024, 1, 1), 10);
        let dates: Vec<NaiveDate> = (0..10).map(|i| d(2024, 1, 1) + Duration::days(i)).collect();
        let m = build_features(&series, &Exogenous::default(), &names(&["DayOfWeek", "Lag7"]), &dates)
            .unwrap();
        let set = FeatureSet::parse(&m.names).unwrap();
        let rows = m.trainable_rows(&set.required_columns());
        assert_eq!(rows, vec![7, 8, 9]);
    }

    #[test]
    fn test_project_reorders_and_rejects_unknown() {
        let series = ramp(d(2024, 1, 1), 10);
        let m = build_features(&series, &Exogenous::default(), &names(&["Lag1", "Lag7"]), &[d(2024, 1, 9)])
            .unwrap();
        let p = m.project(&names(&["Lag7", "Lag1"])).unwrap();
        assert_eq!(p.x.row(0).to_vec(), vec![210.0, 270.0]);
        assert!(m.project(&names(&["Lag14"])).is_err());
    }

    #[test]
    fn test_feature_set_serde_validates() {
        let json = serde_json::to_string(&FeatureSet::parse(&names(&["Lag1", "DowSin"])).unwrap())
            .unwrap();
        assert_eq!(json, r#"["Lag1","DowSin"]"#);
        assert!(serde_json::from_str::<FeatureSet>(r#"["Lag1","Nope"]"#).is_err());
    }

    mod proptest_tests {
        use proptest::prelude::*;

        use super::*;

        fn same(a: &[f64], b: &[f64]) -> bool {
            a.len() == b.len()
                && a
                    .iter()
                    .zip(b)
                    .all(|(x, y)| x.to_bits() == y.to_bits() || (x.is_nan() && y.is_nan()))
        }

        proptest! {
            #[test]
            fn vector_ignores_target_day_and_later(
                counts in prop::collection::vec(0u32..800, 20..80),
                cut in 0usize..60,
                noise in 0u32..800,
            ) {
                let start = d(2024, 1, 1);
                let cut = cut % counts.len();
                let series = Series::from_points(counts.iter().enumerate().map(|(i, c)| {
                    AttendancePoint { date: start + Duration::days(i as i64), count: *c }
                }));
                let target = start + Duration::days(cut as i64);

                let mut tampered = series.before(target);
                for i in cut..counts.len() {
                    tampered.insert(start + Duration::days(i as i64), f64::from(noise)).unwrap();
                }

                let exo = Exogenous::default();
                let builder = FeatureBuilder::new(&exo, FeatureSet::catalogue());
                let honest = builder.vector(&series.dense(), target);
                let leaked = builder.vector(&tampered.dense(), target);
                prop_assert!(same(&honest, &leaked), "features differ for {}", target);
            }
        }
    }
}
