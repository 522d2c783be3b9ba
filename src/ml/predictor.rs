//! Rolling multi-day predictor.
//!
//! Each forecast day is built from a working copy of the history that the
//! previous days' base points have been appended to, so lag, rolling and
//! EWMA features for day `i` see the forecasts for days `0..i` and nothing
//! observed on or after the start date.
//!
//! Per day: model point, blend with the recent same-weekday mean, weekday
//! and holiday multipliers, bounded seeded noise, clamp. The result is the
//! base point. Each logged track then adds its fusion corrections:
//!
//! ```text
//! final = base + w_weather * impact(weather) + w_ai * base * (m - 1)
//! ```
//!
//! which is the convex combination of the base point, the weather-corrected
//! point and the AI-scaled point under weights summing to one.

use chrono::{DateTime, Datelike, Duration, FixedOffset, NaiveDate};
use rand::SeedableRng;
use rand::rngs::StdRng;
use rand_distr::{Distribution, StandardNormal};
use tracing::{debug, info};

use crate::config::PredictionConfig;
use crate::error::{ForecastError, Result};
use crate::exogenous::Exogenous;
use crate::learner::{FusionWeights, ImpactSet};
use crate::ml::confidence::{PredictionRecord, Track, intervals};
use crate::ml::features::{FeatureBuilder, FeatureSet};
use crate::ml::gbm::Regressor;
use crate::ml::registry::ModelArtifact;
use crate::ml::training::DowProfile;
use crate::ml::CancelToken;
use crate::series::{DenseHistory, Series};
use crate::traits::{DailyLookup, HolidayProvider};

/// The parts of a trained model the predictor needs.
pub struct ServingModel<'a> {
    pub regressor: &'a dyn Regressor,
    pub features: &'a FeatureSet,
    pub version: &'a str,
    pub dow: &'a DowProfile,
    /// σ(0) for the intervals; non-positive falls back to the configured default.
    pub residual_std: f64,
}

impl<'a> ServingModel<'a> {
    pub fn from_artifact(artifact: &'a ModelArtifact) -> Self {
        Self {
            regressor: &artifact.booster,
            features: &artifact.features,
            version: artifact.version(),
            dow: &artifact.meta.dow_profile,
            residual_std: artifact.metrics.residual_std,
        }
    }
}

/// Weights and coefficients applied on top of the base point.
#[derive(Debug, Clone)]
pub struct Fusion {
    pub impact: ImpactSet,
    /// Served weights, already folded by [`FusionWeights::production`].
    pub production: FusionWeights,
    /// Logged as a second track when present.
    pub experimental: Option<FusionWeights>,
}

impl Default for Fusion {
    fn default() -> Self {
        Self {
            impact: ImpactSet::default(),
            production: FusionWeights::new(1.0, 0.0, 0.0),
            experimental: None,
        }
    }
}

pub struct RollingPredictor<'a> {
    exo: &'a Exogenous,
    cfg: &'a PredictionConfig,
    fusion: Fusion,
    cancel: CancelToken,
}

impl<'a> RollingPredictor<'a> {
    pub fn new(exo: &'a Exogenous, cfg: &'a PredictionConfig) -> Self {
        Self {
            exo,
            cfg,
            fusion: Fusion::default(),
            cancel: CancelToken::new(),
        }
    }

    pub fn with_fusion(mut self, fusion: Fusion) -> Self {
        self.fusion = fusion;
        self
    }

    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Model weight on day `i` of the horizon.
    pub fn blend_alpha(&self, i: usize) -> f64 {
        let c = self.cfg;
        if c.blend_decay_days <= 0.0 {
            return c.blend_floor;
        }
        c.blend_floor + (c.blend_start - c.blend_floor) * (-(i as f64) / c.blend_decay_days).exp()
    }

    /// Interval σ on day `i`; non-decreasing in `i`.
    pub fn sigma(&self, sigma0: f64, i: usize) -> f64 {
        sigma0 * (1.0 + self.cfg.interval_growth * i as f64).sqrt()
    }

    fn recent_weekday_mean(&self, w: &DenseHistory, date: NaiveDate) -> Option<f64> {
        let values: Vec<f64> = (1..=self.cfg.blend_weeks)
            .map(|k| w.value_on(date - Duration::days(7 * k as i64)))
            .filter(|v| v.is_finite())
            .collect();
        (!values.is_empty()).then(|| values.iter().sum::<f64>() / values.len() as f64)
    }

    /// Forecast `start ..= start + horizon - 1`.
    ///
    /// Only history strictly before `start` is used. Records come back
    /// ordered by date, production before experimental.
    pub fn predict_range(
        &self,
        model: &ServingModel<'_>,
        history: &Series,
        start: NaiveDate,
        horizon: usize,
        now: DateTime<FixedOffset>,
    ) -> Result<Vec<PredictionRecord>> {
        if horizon == 0 {
            return Err(ForecastError::Malformed("horizon must be at least 1".into()));
        }
        if model.regressor.n_features() != model.features.len() {
            return Err(ForecastError::ArtifactInvalid(format!(
                "model expects {} features, feature list has {}",
                model.regressor.n_features(),
                model.features.len()
            )));
        }
        let known = history.before(start);
        if known.is_empty() {
            return Err(ForecastError::insufficient("history days before start", 1, 0));
        }

        let cfg = self.cfg;
        let builder = FeatureBuilder::new(self.exo, model.features.clone());
        let mut w = known.dense();
        w.extend_to(start - Duration::days(1));

        let mut rng = StdRng::seed_from_u64(start.num_days_from_ce() as u64);
        let sigma0 = if model.residual_std.is_finite() && model.residual_std > 0.0 {
            model.residual_std
        } else {
            cfg.default_residual_std
        };

        let mut tracks = vec![(Track::Production, self.fusion.production)];
        if cfg.dual_track {
            if let Some(exp) = self.fusion.experimental {
                tracks.push((Track::Experimental, exp));
            }
        }

        let mut out = Vec::with_capacity(horizon * tracks.len());
        for i in 0..horizon {
            if self.cancel.is_cancelled() {
                info!(day = i, "rolling prediction cancelled");
                return Err(ForecastError::Cancelled);
            }
            let date = start + Duration::days(i as i64);
            let row = builder.vector(&w, date);
            let raw = model.regressor.predict_row(&row);
            if !raw.is_finite() {
                return Err(ForecastError::Numerical(format!(
                    "model returned {} for {}",
                    raw, date
                )));
            }

            let mut point = raw;
            if cfg.blend_enabled {
                if let Some(m) = self
                    .recent_weekday_mean(&w, date)
                    .or_else(|| model.dow.mean(date))
                {
                    let alpha = self.blend_alpha(i);
                    point = alpha * point + (1.0 - alpha) * m;
                }
            }
            if cfg.use_dow_factors {
                point *= model.dow.factor(date);
            }
            let holiday = self.exo.holidays.is_holiday(date);
            if holiday {
                point *= cfg.holiday_multiplier;
            }
            if cfg.noise_enabled {
                let z: f64 = StandardNormal.sample(&mut rng);
                let z = z.clamp(-cfg.noise_bound, cfg.noise_bound);
                point += z * cfg.noise_fraction * point.abs() * (1.0 + cfg.noise_growth * i as f64);
            }
            let base = point.clamp(cfg.clamp_min, cfg.clamp_max);

            let weather = self.exo.weather.get(date);
            let correction = self.fusion.impact.correction(weather.as_ref());
            let multiplier = self.exo.factors.get(date).map_or(1.0, |f| f.multiplier);
            let sigma = self.sigma(sigma0, i);

            for (track, weights) in &tracks {
                let weather_adj = weights.w_weather * correction;
                let ai_adj = weights.w_ai * base * (multiplier - 1.0);
                let final_value = (base + weather_adj + ai_adj).clamp(cfg.clamp_min, cfg.clamp_max);
                let (ci80, ci95) = intervals(final_value, sigma, cfg.clamp_min, cfg.clamp_max);
                out.push(PredictionRecord {
                    target_date: date,
                    horizon: i as u32,
                    track: *track,
                    base,
                    weather_adj,
                    ai_adj,
                    final_value,
                    ci80,
                    ci95,
                    model_version: model.version.to_string(),
                    predicted_at: now,
                    actual: None,
                    error: None,
                    error_pct: None,
                    in_ci80: None,
                    in_ci95: None,
                });
            }
            debug!(%date, raw, base, holiday, sigma, "predicted day");

            w.set(date, base);
        }
        info!(
            %start,
            horizon,
            tracks = tracks.len(),
            version = model.version,
            "rolling prediction complete"
        );
        Ok(out)
    }
}
