//! Prediction intervals and prediction records

use chrono::{DateTime, FixedOffset, NaiveDate};
use serde::{Deserialize, Serialize};

/// Two-sided standard-normal quantile for 80% coverage.
pub const Z80: f64 = 1.2816;
/// Two-sided standard-normal quantile for 95% coverage.
pub const Z95: f64 = 1.96;

/// Which fusion-weight set produced a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Track {
    /// Served weights with the AI factor switched off.
    Production,
    /// Current weights with the AI factor enabled, logged for the governor.
    Experimental,
}

impl Track {
    pub fn as_str(self) -> &'static str {
        match self {
            Track::Production => "production",
            Track::Experimental => "experimental",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "production" => Some(Track::Production),
            "experimental" => Some(Track::Experimental),
            _ => None,
        }
    }
}

/// Closed interval `[low, high]`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Interval {
    pub low: f64,
    pub high: f64,
}

impl Interval {
    pub fn contains(&self, value: f64) -> bool {
        self.low <= value && value <= self.high
    }

    pub fn width(&self) -> f64 {
        self.high - self.low
    }
}

/// 80% and 95% intervals around `point`, clamped to `[lo, hi]`.
///
/// Both intervals are symmetric before clamping, and clamping both sides
/// with the same bounds keeps the nesting
/// `low95 <= low80 <= point <= high80 <= high95`.
pub fn intervals(point: f64, sigma: f64, lo: f64, hi: f64) -> (Interval, Interval) {
    let sigma = if sigma.is_finite() { sigma.max(0.0) } else { 0.0 };
    let point = point.clamp(lo, hi);
    let make = |z: f64| Interval {
        low: (point - z * sigma).clamp(lo, hi),
        high: (point + z * sigma).clamp(lo, hi),
    };
    (make(Z80), make(Z95))
}

/// One logged prediction for a target date.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PredictionRecord {
    pub target_date: NaiveDate,
    /// Days ahead of the first forecast day (0 for the first).
    pub horizon: u32,
    pub track: Track,
    /// Point after blending, calendar factors, noise and clamping.
    pub base: f64,
    /// Additive weather correction actually applied.
    pub weather_adj: f64,
    /// Additive equivalent of the AI-factor correction actually applied.
    pub ai_adj: f64,
    pub final_value: f64,
    pub ci80: Interval,
    pub ci95: Interval,
    pub model_version: String,
    pub predicted_at: DateTime<FixedOffset>,
    pub actual: Option<f64>,
    /// `final_value - actual`.
    pub error: Option<f64>,
    pub error_pct: Option<f64>,
    pub in_ci80: Option<bool>,
    pub in_ci95: Option<bool>,
}

impl PredictionRecord {
    /// Fill in the actual-dependent fields.
    pub fn with_actual(mut self, actual: f64) -> Self {
        let error = self.final_value - actual;
        self.actual = Some(actual);
        self.error = Some(error);
        self.error_pct = (self.final_value != 0.0).then(|| 100.0 * error / self.final_value);
        self.in_ci80 = Some(self.ci80.contains(actual));
        self.in_ci95 = Some(self.ci95.contains(actual));
        self
    }

    /// Interval nesting around the final value.
    pub fn is_ordered(&self) -> bool {
        self.ci95.low <= self.ci80.low
            && self.ci80.low <= self.final_value
            && self.final_value <= self.ci80.high
            && self.ci80.high <= self.ci95.high
    }
}
