//! Training pipeline: features, split, walk-forward CV, optional search,
//! final fit and evaluation on the untouched test tail.

use std::time::Duration;

use chrono::{Datelike, NaiveDate};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::features::{Feature, FeatureBuilder, FeatureMatrix, FeatureSet};
use super::gbm::{Booster, BoosterParams, EvalSet, Regressor};
use super::metrics::{CvSummary, Metrics, nan_safe};
use super::registry::{ARTIFACT_FORMAT, ArtifactMeta, ModelArtifact};
use super::search::TpeSearch;
use super::split::{SplitPlan, ensure_before, plan_split, walk_forward_folds};
use super::CancelToken;
use crate::config::TrainingConfig;
use crate::error::{ForecastError, Result};
use crate::exogenous::Exogenous;
use crate::series::Series;
use crate::stats;
use crate::traits::Clock;

/// Day-of-week factors are clamped to this band around 1.
const DOW_FACTOR_BAND: f64 = 0.1;
/// Upper bound on screening-model rounds during feature auto-selection.
const PROBE_ROUNDS: usize = 200;

/// Non-fatal conditions attached to a training run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrainingFlag {
    /// Test MAE is at least `overfit_ratio` times the early-stopping tail MAE.
    Overfit,
    /// The search timeout fired; best-so-far parameters were used.
    SearchBudgetExceeded,
    /// Fold MAE spread exceeded the configured envelope.
    CvVarianceHigh,
}

/// Per-weekday multiplicative factors and historical means, Monday first.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DowProfile {
    pub factors: [f64; 7],
    pub means: [Option<f64>; 7],
}

impl Default for DowProfile {
    fn default() -> Self {
        Self {
            factors: [1.0; 7],
            means: [None; 7],
        }
    }
}

impl DowProfile {
    pub fn factor(&self, date: NaiveDate) -> f64 {
        self.factors[date.weekday().num_days_from_monday() as usize]
    }

    pub fn mean(&self, date: NaiveDate) -> Option<f64> {
        self.means[date.weekday().num_days_from_monday() as usize]
    }

    /// Mean of `actual / predicted` per weekday, clamped to [0.9, 1.1].
    fn fit_factors(dates: &[NaiveDate], actual: &[f64], predicted: &[f64]) -> [f64; 7] {
        let mut sums = [0.0; 7];
        let mut counts = [0usize; 7];
        for ((d, a), p) in dates.iter().zip(actual).zip(predicted) {
            if *p > 0.0 && a.is_finite() {
                let wd = d.weekday().num_days_from_monday() as usize;
                sums[wd] += a / p;
                counts[wd] += 1;
            }
        }
        let mut factors = [1.0; 7];
        for wd in 0..7 {
            if counts[wd] > 0 {
                factors[wd] = (sums[wd] / counts[wd] as f64)
                    .clamp(1.0 - DOW_FACTOR_BAND, 1.0 + DOW_FACTOR_BAND);
            }
        }
        factors
    }

    fn fit_means(series: &Series, before: NaiveDate) -> [Option<f64>; 7] {
        let mut buckets: [Vec<f64>; 7] = Default::default();
        for (d, v) in series.iter().take_while(|(d, _)| *d < before) {
            buckets[d.weekday().num_days_from_monday() as usize].push(v);
        }
        buckets.map(|b| (!b.is_empty()).then(|| stats::mean(&b)))
    }
}

/// Hyperparameter-search summary kept with the metrics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchSummary {
    pub trials: usize,
    #[serde(with = "nan_safe")]
    pub best_loss: f64,
    pub budget_exceeded: bool,
}

/// Contents of `metrics.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingMetrics {
    pub test: Metrics,
    /// Early-stopping tail, scored by the model fitted before the tail was folded in.
    pub tail: Metrics,
    pub cv: CvSummary,
    /// Standard deviation of tail residuals; σ(0) of the serving intervals.
    #[serde(with = "nan_safe")]
    pub residual_std: f64,
    pub feature_importance: Vec<(String, f64)>,
    pub search: Option<SearchSummary>,
    pub flags: Vec<TrainingFlag>,
}

impl TrainingMetrics {
    pub fn has_flag(&self, flag: TrainingFlag) -> bool {
        self.flags.contains(&flag)
    }
}

/// Rows of a matrix as an evaluation set borrowed for early stopping.
fn eval_of(m: &FeatureMatrix) -> EvalSet<'_> {
    EvalSet {
        x: m.x.view(),
        y: &m.y,
    }
}

/// Runs the training protocol for one configuration.
pub struct Trainer<'a> {
    cfg: &'a TrainingConfig,
    clock: &'a dyn Clock,
    cancel: CancelToken,
}

impl<'a> Trainer<'a> {
    pub fn new(cfg: &'a TrainingConfig, clock: &'a dyn Clock, cancel: CancelToken) -> Self {
        Self { cfg, clock, cancel }
    }

    fn check_cancel(&self) -> Result<()> {
        if self.cancel.is_cancelled() {
            warn!("training cancelled");
            return Err(ForecastError::Cancelled);
        }
        Ok(())
    }

    /// Keep the `auto_select_top_k` catalogue features with the most gain
    /// in a screening model; `Lag1` and `Lag7` are always kept.
    pub fn auto_select(&self, series: &Series, exo: &Exogenous) -> Result<FeatureSet> {
        let catalogue = FeatureSet::catalogue();
        let builder = FeatureBuilder::new(exo, catalogue.clone());
        let dates: Vec<NaiveDate> = series.dates().collect();
        let anchors = FeatureSet::from_features(vec![Feature::Lag(1), Feature::Lag(7)])?;
        let required: Vec<usize> = anchors
            .names()
            .iter()
            .filter_map(|n| catalogue.index_of(n))
            .collect();
        let matrix = builder.matrix(series, &dates);
        let rows = matrix.trainable_rows(&required);
        if rows.len() < self.cfg.min_training_rows {
            return Err(ForecastError::insufficient(
                "feature selection rows",
                self.cfg.min_training_rows,
                rows.len(),
            ));
        }
        let m = matrix.take_rows(&rows);
        let plan = plan_split(&m.dates, self.cfg)?;
        let params = BoosterParams {
            n_rounds: self.cfg.booster.n_rounds.min(PROBE_ROUNDS),
            ..self.cfg.booster.clone()
        };
        let fit = m.take_rows(&plan.fit);
        let tail = m.take_rows(&plan.tail);
        let (screening, _) = Booster::fit(
            fit.x.view(),
            &fit.y,
            Some(plan.fit_weights()),
            &params,
            self.cfg.seed,
            Some(eval_of(&tail)),
            self.cfg.early_stopping_rounds,
        )?;

        let gains = screening.feature_importance();
        let mut ranked: Vec<usize> = (0..gains.len()).filter(|i| gains[*i] > 0.0).collect();
        ranked.sort_by(|a, b| gains[*b].total_cmp(&gains[*a]).then(a.cmp(b)));
        ranked.truncate(self.cfg.auto_select_top_k);
        for anchor in &required {
            if !ranked.contains(anchor) {
                ranked.push(*anchor);
            }
        }
        ranked.sort_unstable();
        let chosen: Vec<Feature> = ranked.iter().map(|i| catalogue.features()[*i]).collect();
        info!(selected = chosen.len(), "auto-selected features");
        FeatureSet::from_features(chosen)
    }

    /// Train, evaluate and package a model under `version`. Nothing is
    /// persisted here.
    pub fn train(
        &self,
        series: &Series,
        exo: &Exogenous,
        features: FeatureSet,
        version: String,
    ) -> Result<ModelArtifact> {
        self.cfg.validate()?;
        info!(
            version = %version,
            observations = series.len(),
            features = features.len(),
            "training started"
        );
        let builder = FeatureBuilder::new(exo, features.clone());
        let dates: Vec<NaiveDate> = series.dates().collect();
        builder.audit_leakage(series, &audit_sample(&dates, self.cfg.leakage_audit_samples))?;

        let matrix = builder.matrix(series, &dates);
        let rows = matrix.trainable_rows(&features.required_columns());
        if rows.len() < self.cfg.min_training_rows {
            return Err(ForecastError::insufficient(
                "training rows",
                self.cfg.min_training_rows,
                rows.len(),
            ));
        }
        let m = matrix.take_rows(&rows);
        debug!(dropped = matrix.n_rows() - m.n_rows(), "rows without required predictors dropped");
        let plan = plan_split(&m.dates, self.cfg)?;
        self.check_cancel()?;

        let mut flags = Vec::new();
        let cv = self.cross_validate(&m, &plan)?;
        if cv.relative_mae_std() > self.cfg.cv_max_relative_std {
            warn!(
                relative_std = cv.relative_mae_std(),
                limit = self.cfg.cv_max_relative_std,
                "cross-validation variance above envelope"
            );
            flags.push(TrainingFlag::CvVarianceHigh);
        }

        let fit = m.take_rows(&plan.fit);
        let tail = m.take_rows(&plan.tail);
        let (params, search) = if self.cfg.do_hyperparameter_search {
            let outcome = TpeSearch::new(
                self.cfg.booster.clone(),
                self.cfg.search_trials,
                self.cfg.search_timeout_secs.map(Duration::from_secs),
                self.cfg.seed,
            )
            .run(&self.cancel, |p| {
                let (b, _) = Booster::fit(
                    fit.x.view(),
                    &fit.y,
                    Some(plan.fit_weights()),
                    p,
                    self.cfg.seed,
                    Some(eval_of(&tail)),
                    self.cfg.early_stopping_rounds,
                )?;
                Ok(b.best_score().unwrap_or(f64::NAN))
            })?;
            if outcome.budget_exceeded {
                flags.push(TrainingFlag::SearchBudgetExceeded);
            }
            let summary = SearchSummary {
                trials: outcome.trials.len(),
                best_loss: outcome.best_loss,
                budget_exceeded: outcome.budget_exceeded,
            };
            (outcome.best, Some(summary))
        } else {
            (self.cfg.booster.clone(), None)
        };
        self.check_cancel()?;

        // Early stopping on the tail picks the round count ...
        let (staged, _) = Booster::fit(
            fit.x.view(),
            &fit.y,
            Some(plan.fit_weights()),
            &params,
            self.cfg.seed,
            Some(eval_of(&tail)),
            self.cfg.early_stopping_rounds,
        )?;
        let n_rounds = staged.best_n_rounds();
        let tail_pred = staged.predict(tail.x.view());
        let tail_metrics = Metrics::compute(&tail_pred, &tail.y, features.len());
        let residuals: Vec<f64> = tail.y.iter().zip(&tail_pred).map(|(a, p)| a - p).collect();
        let residual_std = stats::std_dev(&residuals);
        let dow_factors = DowProfile::fit_factors(&tail.dates, &tail.y, &tail_pred);

        // ... and the final model is refitted on every training row.
        let train = m.take_rows(&plan.train());
        let final_params = BoosterParams {
            n_rounds,
            ..params.clone()
        };
        let (booster, _) = Booster::fit(
            train.x.view(),
            &train.y,
            Some(plan.weights.as_slice()),
            &final_params,
            self.cfg.seed,
            None,
            0,
        )?;
        self.check_cancel()?;

        let test = m.take_rows(&plan.test);
        let test_pred = booster.predict(test.x.view());
        let test_metrics = Metrics::compute(&test_pred, &test.y, features.len());
        if test_metrics.mae >= self.cfg.overfit_ratio * tail_metrics.mae {
            warn!(
                test_mae = test_metrics.mae,
                tail_mae = tail_metrics.mae,
                "test error far above training-tail error; flagged as overfit"
            );
            flags.push(TrainingFlag::Overfit);
        }

        let feature_importance = features
            .names()
            .iter()
            .cloned()
            .zip(booster.feature_importance())
            .collect();
        let test_start = test.dates.first().copied();
        let dow_profile = DowProfile {
            factors: dow_factors,
            means: DowProfile::fit_means(series, test_start.unwrap_or(NaiveDate::MAX)),
        };

        let metrics = TrainingMetrics {
            test: test_metrics,
            tail: tail_metrics,
            cv,
            residual_std,
            feature_importance,
            search,
            flags,
        };
        let meta = ArtifactMeta {
            format: ARTIFACT_FORMAT,
            version,
            created_at: self.clock.now_hkt(),
            params: final_params,
            n_rounds,
            seed: self.cfg.seed,
            data_window: self.cfg.data_window,
            excluded_periods: self.cfg.excluded_periods.clone(),
            exclusion_mode: self.cfg.exclusion_mode,
            time_decay_rate: self.cfg.time_decay_rate,
            train_start: train.dates[0],
            train_end: train.dates[train.n_rows() - 1],
            test_start,
            test_end: test.dates.last().copied(),
            n_train: train.n_rows(),
            n_test: test.n_rows(),
            dow_profile,
        };
        info!(
            version = %meta.version,
            rounds = n_rounds,
            test_mae = metrics.test.mae,
            cv_mae = metrics.cv.mae_mean,
            flags = ?metrics.flags,
            "training finished"
        );
        Ok(ModelArtifact {
            booster,
            features,
            metrics,
            meta,
        })
    }

    /// Expanding-window CV over the training rows. Each fold early-stops
    /// on the tail of its own training block.
    fn cross_validate(&self, m: &FeatureMatrix, plan: &SplitPlan) -> Result<CvSummary> {
        let train = plan.train();
        let folds = walk_forward_folds(train.len(), self.cfg.cv_folds)?;
        let mut results = Vec::with_capacity(folds.len());
        for (k, fold) in folds.iter().enumerate() {
            self.check_cancel()?;
            let fold_train = &train[fold.train.clone()];
            let fold_valid = &train[fold.valid.clone()];
            ensure_before(&m.dates, fold_train, fold_valid, "cross-validation")?;

            let stop = ((fold_train.len() as f64 * self.cfg.early_stopping_fraction).ceil() as usize)
                .clamp(1, fold_train.len() - 1);
            let (inner, inner_tail) = fold_train.split_at(fold_train.len() - stop);
            let fit = m.take_rows(inner);
            let tail = m.take_rows(inner_tail);
            let valid = m.take_rows(fold_valid);
            let weights = &plan.weights[fold.train.start..fold.train.start + inner.len()];

            let (b, _) = Booster::fit(
                fit.x.view(),
                &fit.y,
                Some(weights),
                &self.cfg.booster,
                self.cfg.seed,
                Some(eval_of(&tail)),
                self.cfg.early_stopping_rounds,
            )?;
            let pred = b.predict(valid.x.view());
            let metrics = Metrics::compute(&pred, &valid.y, m.x.ncols());
            info!(
                fold = k,
                train_rows = fold_train.len(),
                valid_rows = fold_valid.len(),
                mae = metrics.mae,
                rmse = metrics.rmse,
                mape = metrics.mape,
                "cross-validation fold"
            );
            results.push(metrics);
        }
        let summary = CvSummary::from_folds(results);
        info!(
            mae_mean = summary.mae_mean,
            mae_std = summary.mae_std,
            "cross-validation finished"
        );
        Ok(summary)
    }
}

/// Up to `n` dates spread evenly over `dates`.
fn audit_sample(dates: &[NaiveDate], n: usize) -> Vec<NaiveDate> {
    if dates.is_empty() || n == 0 {
        return Vec::new();
    }
    let n = n.min(dates.len());
    (0..n)
        .map(|i| dates[i * (dates.len() - 1) / (n - 1).max(1)])
        .collect()
}

#[cfg(test)]
mod tests {
    use chrono::{Duration as ChronoDuration, TimeZone, Utc};

    use super::*;
    use crate::traits::MockClock;

    fn weekly_series(days: i64) -> Series {
        let start = NaiveDate::from_ymd_opt(2022, 1, 3).unwrap();
        Series::from_values((0..days).map(|i| {
            let d = start + ChronoDuration::days(i);
            let weekday = d.weekday().num_days_from_monday() as f64;
            (d, 250.0 + 15.0 * weekday + (i % 11) as f64)
        }))
        .unwrap()
    }

    fn quick_config() -> TrainingConfig {
        TrainingConfig {
            booster: BoosterParams {
                n_rounds: 60,
                max_depth: 3,
                learning_rate: 0.2,
                ..Default::default()
            },
            early_stopping_rounds: 10,
            ..Default::default()
        }
    }

    fn clock() -> MockClock {
        MockClock::new(Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap())
    }

    fn lag_features() -> FeatureSet {
        FeatureSet::parse(&["DayOfWeek", "Lag1", "Lag7", "Roll7Mean"]).unwrap()
    }

    #[test]
    fn test_train_produces_consistent_artifact() {
        let series = weekly_series(300);
        let cfg = quick_config();
        let clock = clock();
        let trainer = Trainer::new(&cfg, &clock, CancelToken::new());
        let artifact = trainer
            .train(&series, &Exogenous::default(), lag_features(), "v20240101-080000-1".into())
            .unwrap();

        assert_eq!(artifact.booster.n_features(), 4);
        assert_eq!(artifact.metrics.cv.folds.len(), 3);
        assert!(artifact.metrics.test.mae < 30.0);
        assert!(artifact.metrics.residual_std.is_finite());
        assert!(artifact.meta.train_end < artifact.meta.test_start.unwrap());
        assert_eq!(artifact.meta.n_train + artifact.meta.n_test, 300 - 7);
        assert!(artifact
            .meta
            .dow_profile
            .factors
            .iter()
            .all(|f| (0.9..=1.1).contains(f)));
        assert_eq!(artifact.meta.created_at.offset().local_minus_utc(), 8 * 3600);
    }

    #[test]
    fn test_too_few_rows_is_insufficient() {
        let series = weekly_series(40);
        let cfg = quick_config();
        let clock = clock();
        let err = Trainer::new(&cfg, &clock, CancelToken::new())
            .train(&series, &Exogenous::default(), lag_features(), "v20240101-080000-1".into())
            .unwrap_err();
        assert!(matches!(
            err,
            ForecastError::InsufficientData { required: 60, found: 33, .. }
        ));
    }

    #[test]
    fn test_cancelled_training_stops() {
        let series = weekly_series(200);
        let cfg = quick_config();
        let clock = clock();
        let cancel = CancelToken::new();
        cancel.cancel();
        let err = Trainer::new(&cfg, &clock, cancel)
            .train(&series, &Exogenous::default(), lag_features(), "v20240101-080000-1".into())
            .unwrap_err();
        assert!(matches!(err, ForecastError::Cancelled));
    }

    #[test]
    fn test_search_budget_flag() {
        let series = weekly_series(200);
        let cfg = TrainingConfig {
            do_hyperparameter_search: true,
            search_trials: 5,
            search_timeout_secs: Some(0),
            ..quick_config()
        };
        let clock = clock();
        let artifact = Trainer::new(&cfg, &clock, CancelToken::new())
            .train(&series, &Exogenous::default(), lag_features(), "v20240101-080000-1".into())
            .unwrap();
        assert!(artifact.metrics.has_flag(TrainingFlag::SearchBudgetExceeded));
        assert_eq!(artifact.metrics.search.as_ref().unwrap().trials, 1);
    }

    #[test]
    fn test_auto_select_keeps_anchor_lags() {
        let series = weekly_series(200);
        let cfg = TrainingConfig {
            auto_select_top_k: 5,
            ..quick_config()
        };
        let clock = clock();
        let set = Trainer::new(&cfg, &clock, CancelToken::new())
            .auto_select(&series, &Exogenous::default())
            .unwrap();
        assert!(set.len() <= 7);
        assert!(set.index_of("Lag1").is_some());
        assert!(set.index_of("Lag7").is_some());
    }

    #[test]
    fn test_dow_factors_are_clamped() {
        let d = NaiveDate::from_ymd_opt(2024, 1, 1).unwrap();
        let dates = [d, d + ChronoDuration::days(1), d + ChronoDuration::days(7)];
        let f = DowProfile::fit_factors(&dates, &[200.0, 105.0, 220.0], &[100.0, 100.0, 200.0]);
        // Monday: mean(2.0, 1.1) clamped, Tuesday 1.05, the rest untouched
        assert_eq!(f[0], 1.1);
        assert!((f[1] - 1.05).abs() < 1e-12);
        assert_eq!(f[2], 1.0);
    }

    #[test]
    fn test_audit_sample_spans_range() {
        let start = NaiveDate::from_ymd_opt(2024, 1, 1).unwrap();
        let dates: Vec<NaiveDate> = (0..10).map(|i| start + ChronoDuration::days(i)).collect();
        let s = audit_sample(&dates, 3);
        assert_eq!(s, vec![dates[0], dates[4], dates[9]]);
        assert!(audit_sample(&[], 3).is_empty());
    }
}
