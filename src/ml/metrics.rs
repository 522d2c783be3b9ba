//! Regression metrics.

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::stats;

/// JSON has no NaN; non-finite floats are written as `null` and read back as NaN.
pub mod nan_safe {
    use super::*;

    pub fn serialize<S: Serializer>(v: &f64, s: S) -> Result<S::Ok, S::Error> {
        if v.is_finite() {
            s.serialize_some(v)
        } else {
            s.serialize_none()
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<f64, D::Error> {
        Ok(Option::<f64>::deserialize(d)?.unwrap_or(f64::NAN))
    }
}

/// Evaluation of predictions against actuals.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Metrics {
    pub n: usize,
    #[serde(with = "nan_safe")]
    pub mae: f64,
    #[serde(with = "nan_safe")]
    pub rmse: f64,
    /// Percent; days with a zero actual are skipped.
    #[serde(with = "nan_safe")]
    pub mape: f64,
    #[serde(with = "nan_safe")]
    pub r2: f64,
    #[serde(with = "nan_safe")]
    pub adjusted_r2: f64,
    /// Mean of (prediction − actual).
    #[serde(with = "nan_safe")]
    pub mean_error: f64,
    #[serde(with = "nan_safe")]
    pub error_std: f64,
}

impl Metrics {
    /// Compute every metric; `n_predictors` feeds the adjusted R².
    pub fn compute(pred: &[f64], actual: &[f64], n_predictors: usize) -> Self {
        let n = pred.len().min(actual.len());
        if n == 0 {
            return Self::empty();
        }
        let errors: Vec<f64> = pred.iter().zip(actual).map(|(p, a)| p - a).collect();

        let mae = errors.iter().map(|e| e.abs()).sum::<f64>() / n as f64;
        let rmse = (errors.iter().map(|e| e * e).sum::<f64>() / n as f64).sqrt();
        let mape = mape(pred, actual);

        let mean_actual = actual[..n].iter().sum::<f64>() / n as f64;
        let ss_tot: f64 = actual[..n].iter().map(|a| (a - mean_actual).powi(2)).sum();
        let ss_res: f64 = errors.iter().map(|e| e * e).sum();
        let r2 = if ss_tot > 0.0 { 1.0 - ss_res / ss_tot } else { f64::NAN };
        let adjusted_r2 = if n > n_predictors + 1 {
            1.0 - (1.0 - r2) * (n - 1) as f64 / (n - n_predictors - 1) as f64
        } else {
            f64::NAN
        };

        Self {
            n,
            mae,
            rmse,
            mape,
            r2,
            adjusted_r2,
            mean_error: stats::mean(&errors),
            error_std: stats::std_dev(&errors),
        }
    }

    fn empty() -> Self {
        Self {
            n: 0,
            mae: f64::NAN,
            rmse: f64::NAN,
            mape: f64::NAN,
            r2: f64::NAN,
            adjusted_r2: f64::NAN,
            mean_error: f64::NAN,
            error_std: f64::NAN,
        }
    }
}

pub fn mae(pred: &[f64], actual: &[f64]) -> f64 {
    let n = pred.len().min(actual.len());
    if n == 0 {
        return f64::NAN;
    }
    pred.iter().zip(actual).map(|(p, a)| (p - a).abs()).sum::<f64>() / n as f64
}

pub fn mape(pred: &[f64], actual: &[f64]) -> f64 {
    let terms: Vec<f64> = pred
        .iter()
        .zip(actual)
        .filter(|(_, a)| **a != 0.0)
        .map(|(p, a)| ((p - a) / a).abs())
        .collect();
    if terms.is_empty() {
        f64::NAN
    } else {
        100.0 * terms.iter().sum::<f64>() / terms.len() as f64
    }
}

/// Per-fold metrics of walk-forward cross-validation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CvSummary {
    pub folds: Vec<Metrics>,
    #[serde(with = "nan_safe")]
    pub mae_mean: f64,
    #[serde(with = "nan_safe")]
    pub mae_std: f64,
    #[serde(with = "nan_safe")]
    pub rmse_mean: f64,
    #[serde(with = "nan_safe")]
    pub rmse_std: f64,
    #[serde(with = "nan_safe")]
    pub mape_mean: f64,
    #[serde(with = "nan_safe")]
    pub mape_std: f64,
}

impl CvSummary {
    pub fn from_folds(folds: Vec<Metrics>) -> Self {
        let pick = |f: fn(&Metrics) -> f64| -> Vec<f64> { folds.iter().map(f).collect() };
        let (mae, rmse, mape) = (pick(|m| m.mae), pick(|m| m.rmse), pick(|m| m.mape));
        Self {
            mae_mean: stats::mean(&mae),
            mae_std: population_std(&mae),
            rmse_mean: stats::mean(&rmse),
            rmse_std: population_std(&rmse),
            mape_mean: stats::mean(&mape),
            mape_std: population_std(&mape),
            folds,
        }
    }

    /// Fold MAE spread relative to its mean.
    pub fn relative_mae_std(&self) -> f64 {
        if self.mae_mean > 0.0 {
            self.mae_std / self.mae_mean
        } else {
            f64::NAN
        }
    }
}

fn population_std(values: &[f64]) -> f64 {
    let xs = stats::finite(values);
    if xs.is_empty() {
        return f64::NAN;
    }
    let m = xs.iter().sum::<f64>() / xs.len() as f64;
    (xs.iter().map(|x| (x - m).powi(2)).sum::<f64>() / xs.len() as f64).sqrt()
}
