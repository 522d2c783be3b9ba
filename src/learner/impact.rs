//! Weather-impact learner.
//!
//! Regresses the base model's residual (actual − base) on a handful of
//! weather variables. The fitted coefficients are a small additive
//! correction applied at serve time; the booster is never retrained here.

use chrono::{DateTime, FixedOffset, NaiveDate};
use linfa::prelude::*;
use linfa_linear::LinearRegression;
use ndarray::{Array1, Array2};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::config::LearnerConfig;
use crate::error::{ForecastError, Result};
use crate::exogenous::WeatherDay;
use crate::ml::PredictionRecord;
use crate::ml::features::WeatherField;
use crate::traits::DailyLookup;

pub const INTERCEPT: &str = "Intercept";

/// Weather variables the correction is fitted on.
pub const IMPACT_FEATURES: [&str; 5] = ["TempMean", "TempRange", "Rainfall", "Humidity", "Wind"];

fn impact_value(name: &str, day: &WeatherDay) -> Option<f64> {
    match name {
        "TempRange" => day.temp_range(),
        _ => WeatherField::ALL
            .iter()
            .find(|f| f.as_str() == name)
            .and_then(|f| f.read(day)),
    }
}

/// One named coefficient.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImpactParam {
    pub name: String,
    pub value: f64,
    pub sample_count: usize,
    pub updated_at: DateTime<FixedOffset>,
}

/// The current set of weather-impact coefficients. Empty means "no correction".
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ImpactSet {
    pub params: Vec<ImpactParam>,
}

impl ImpactSet {
    pub fn is_empty(&self) -> bool {
        self.params.is_empty()
    }

    pub fn get(&self, name: &str) -> Option<f64> {
        self.params.iter().find(|p| p.name == name).map(|p| p.value)
    }

    /// Additive attendance correction for a day's weather.
    ///
    /// Zero without coefficients or without a weather record; a missing
    /// variable contributes nothing.
    pub fn correction(&self, weather: Option<&WeatherDay>) -> f64 {
        let Some(day) = weather else {
            return 0.0;
        };
        if self.is_empty() {
            return 0.0;
        }
        let mut total = self.get(INTERCEPT).unwrap_or(0.0);
        for p in self.params.iter().filter(|p| p.name != INTERCEPT) {
            if let Some(x) = impact_value(&p.name, day) {
                total += p.value * x;
            }
        }
        total
    }
}

/// A residual joined with that day's weather.
#[derive(Debug, Clone, PartialEq)]
pub struct ImpactSample {
    pub date: NaiveDate,
    pub residual: f64,
    pub values: [f64; IMPACT_FEATURES.len()],
}

/// Join evaluated records with weather. Days missing any impact variable are skipped.
pub fn join_samples(
    records: &[PredictionRecord],
    weather: &dyn DailyLookup<WeatherDay>,
) -> Vec<ImpactSample> {
    records
        .iter()
        .filter_map(|r| {
            let actual = r.actual?;
            let day = weather.get(r.target_date)?;
            let mut values = [0.0; IMPACT_FEATURES.len()];
            for (slot, name) in values.iter_mut().zip(IMPACT_FEATURES) {
                *slot = impact_value(name, &day)?;
            }
            Some(ImpactSample {
                date: r.target_date,
                residual: actual - r.base,
                values,
            })
        })
        .collect()
}

/// Fit the coefficients by ordinary least squares with an intercept.
///
/// Fewer than `impact_min_samples` samples is `InsufficientData`; nothing
/// is written by this function either way.
pub fn fit_impact(
    samples: &[ImpactSample],
    cfg: &LearnerConfig,
    now: DateTime<FixedOffset>,
) -> Result<ImpactSet> {
    if samples.len() < cfg.impact_min_samples {
        return Err(ForecastError::insufficient(
            "weather-impact samples",
            cfg.impact_min_samples,
            samples.len(),
        ));
    }
    let n = samples.len();
    let flat: Vec<f64> = samples.iter().flat_map(|s| s.values).collect();
    let x = Array2::from_shape_vec((n, IMPACT_FEATURES.len()), flat)
        .map_err(|e| ForecastError::Numerical(e.to_string()))?;
    let y = Array1::from_iter(samples.iter().map(|s| s.residual));
    let dataset = Dataset::new(x, y);

    let model = LinearRegression::default()
        .with_intercept(true)
        .fit(&dataset)
        .map_err(|e: linfa_linear::LinearError<f64>| ForecastError::Numerical(e.to_string()))?;

    let coefficients = model.params();
    if coefficients.iter().any(|c| !c.is_finite()) || !model.intercept().is_finite() {
        return Err(ForecastError::Numerical("non-finite impact coefficient".into()));
    }
    let param = |name: &str, value: f64| ImpactParam {
        name: name.to_string(),
        value,
        sample_count: n,
        updated_at: now,
    };
    let mut params = vec![param(INTERCEPT, model.intercept())];
    params.extend(
        IMPACT_FEATURES
            .iter()
            .zip(coefficients.iter())
            .map(|(name, c)| param(name, *c)),
    );
    for p in &params {
        debug!(name = %p.name, value = p.value, "impact coefficient");
    }
    info!(samples = n, "weather-impact coefficients fitted");
    Ok(ImpactSet { params })
}

#[cfg(test)]
mod tests {
    use approx::assert_relative_eq;
    use chrono::{Duration, TimeZone};

    use super::*;
    use crate::exogenous::WeatherTable;
    use crate::ml::confidence::{Interval, Track};
    use crate::traits::HKT;

    fn now() -> DateTime<FixedOffset> {
        HKT.with_ymd_and_hms(2024, 6, 1, 9, 0, 0).unwrap()
    }

    fn synthetic(n: usize) -> Vec<ImpactSample> {
        let start = NaiveDate::from_ymd_opt(2024, 1, 1).unwrap();
        (0..n)
            .map(|i| {
                let t = 15.0 + (i % 13) as f64;
                let range = 4.0 + (i % 5) as f64;
                let rain = (i % 7) as f64 * 3.0;
                let hum = 60.0 + (i % 11) as f64 * 3.0;
                let wind = 10.0 + (i % 3) as f64 * 4.0;
                ImpactSample {
                    date: start + Duration::days(i as i64),
                    residual: 5.0 - 0.8 * t + 0.5 * rain,
                    values: [t, range, rain, hum, wind],
                }
            })
            .collect()
    }

    #[test]
    fn test_refuses_below_threshold() {
        let err = fit_impact(&synthetic(30), &LearnerConfig::default(), now()).unwrap_err();
        assert!(matches!(
            err,
            ForecastError::InsufficientData { required: 50, found: 30, .. }
        ));
    }

    #[test]
    fn test_recovers_linear_coefficients() {
        let set = fit_impact(&synthetic(120), &LearnerConfig::default(), now()).unwrap();
        assert_eq!(set.params.len(), 6);
        assert_relative_eq!(set.get(INTERCEPT).unwrap(), 5.0, epsilon = 1e-4);
        assert_relative_eq!(set.get("TempMean").unwrap(), -0.8, epsilon = 1e-4);
        assert_relative_eq!(set.get("Rainfall").unwrap(), 0.5, epsilon = 1e-4);
        assert_relative_eq!(set.get("Humidity").unwrap(), 0.0, epsilon = 1e-4);
        assert!(set.params.iter().all(|p| p.sample_count == 120));
    }

    #[test]
    fn test_correction_skips_missing_weather() {
        let set = fit_impact(&synthetic(120), &LearnerConfig::default(), now()).unwrap();
        assert_eq!(set.correction(None), 0.0);
        assert_eq!(ImpactSet::default().correction(Some(&WeatherDay::default())), 0.0);
        let day = WeatherDay {
            temp_mean: Some(20.0),
            rainfall: Some(10.0),
            ..Default::default()
        };
        assert_relative_eq!(set.correction(Some(&day)), 5.0 - 16.0 + 5.0, epsilon = 1e-2);
    }

    #[test]
    fn test_join_needs_actual_and_complete_weather() {
        let d = NaiveDate::from_ymd_opt(2024, 3, 1).unwrap();
        let record = |date: NaiveDate, actual: Option<f64>| PredictionRecord {
            target_date: date,
            horizon: 0,
            track: Track::Production,
            base: 300.0,
            weather_adj: 0.0,
            ai_adj: 0.0,
            final_value: 300.0,
            ci80: Interval { low: 280.0, high: 320.0 },
            ci95: Interval { low: 270.0, high: 330.0 },
            model_version: "v".into(),
            predicted_at: now(),
            actual,
            error: None,
            error_pct: None,
            in_ci80: None,
            in_ci95: None,
        };
        let mut weather = WeatherTable::new();
        weather.insert(WeatherDay {
            date: d,
            temp_mean: Some(20.0),
            temp_max: Some(24.0),
            temp_min: Some(18.0),
            rainfall: Some(0.0),
            humidity: Some(80.0),
            wind: Some(12.0),
            ..Default::default()
        });
        weather.insert(WeatherDay {
            date: d + Duration::days(1),
            temp_mean: Some(20.0),
            ..Default::default()
        });
        let records = [
            record(d, Some(310.0)),
            record(d + Duration::days(1), Some(290.0)),
            record(d + Duration::days(2), None),
        ];
        let samples = join_samples(&records, &weather);
        assert_eq!(samples.len(), 1);
        assert_eq!(samples[0].residual, 10.0);
        assert_eq!(samples[0].values, [20.0, 6.0, 0.0, 80.0, 12.0]);
    }
}
