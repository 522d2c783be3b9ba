//! In-process surface of the forecasting core.
//!
//! [`Forecaster`] wires the stores, the exogenous snapshot, the model
//! registry and the clock together and exposes the eight operations callers
//! use: load history, build features, train, load a model, predict a range,
//! record an actual, run the impact learner and run the fusion governor.

use std::sync::Arc;

use chrono::{Duration, NaiveDate};
use tracing::{info, warn};

use crate::config::{FeatureSelection, LearnerConfig, PredictionConfig, TrainingConfig};
use crate::error::{ForecastError, Result};
use crate::exogenous::Exogenous;
use crate::learner::{
    self, FusionWeights, GovernorDecision, ImpactSet, WeightUpdateRecord, fit_impact,
    join_samples,
};
use crate::ml::predictor::Fusion;
use crate::ml::{
    CancelToken, FeatureMatrix, FeatureSet, ModelArtifact, ModelRegistry, PredictionRecord,
    RollingPredictor, ServingModel, Trainer, TrainingFlag, Track, VersionSelector, build_features,
};
use crate::series::{AttendancePoint, Series};
use crate::traits::{AttendanceStore, Clock, LearnerState, PredictionLog, SystemClock};

pub struct Forecaster {
    store: Arc<dyn AttendanceStore>,
    log: Arc<dyn PredictionLog>,
    learner_state: Arc<dyn LearnerState>,
    registry: ModelRegistry,
    exo: Exogenous,
    prediction: PredictionConfig,
    learner: LearnerConfig,
    clock: Arc<dyn Clock>,
    cancel: CancelToken,
}

impl Forecaster {
    pub fn new(
        store: Arc<dyn AttendanceStore>,
        log: Arc<dyn PredictionLog>,
        learner_state: Arc<dyn LearnerState>,
        registry: ModelRegistry,
        exo: Exogenous,
    ) -> Self {
        Self {
            store,
            log,
            learner_state,
            registry,
            exo,
            prediction: PredictionConfig::default(),
            learner: LearnerConfig::default(),
            clock: Arc::new(SystemClock),
            cancel: CancelToken::new(),
        }
    }

    pub fn with_prediction_config(mut self, cfg: PredictionConfig) -> Self {
        self.prediction = cfg;
        self
    }

    pub fn with_learner_config(mut self, cfg: LearnerConfig) -> Self {
        self.learner = cfg;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn registry(&self) -> &ModelRegistry {
        &self.registry
    }

    pub fn exogenous(&self) -> &Exogenous {
        &self.exo
    }

    // ==================== History & Features ====================

    pub fn load_history(&self) -> Result<Series> {
        let series = self.store.load_series()?;
        let gaps = series.gaps();
        if !gaps.is_empty() {
            warn!(gaps = gaps.len(), "attendance series has missing days");
        }
        Ok(series)
    }

    /// Feature matrix for `dates`; the matrix carries the ordered name list.
    pub fn build_features(
        &self,
        series: &Series,
        names: &[String],
        dates: &[NaiveDate],
    ) -> Result<FeatureMatrix> {
        build_features(series, &self.exo, names, dates)
    }

    // ==================== Training & Registry ====================

    fn resolve_features(&self, trainer: &Trainer<'_>, cfg: &TrainingConfig, series: &Series) -> Result<FeatureSet> {
        match &cfg.feature_list {
            FeatureSelection::Explicit(names) => FeatureSet::parse(names),
            FeatureSelection::FromLatestArtifact => {
                Ok(self.registry.load(&VersionSelector::Latest)?.features)
            }
            FeatureSelection::AutoSelect => trainer.auto_select(series, &self.exo),
        }
    }

    /// Train and publish a new version. On any error the registry is untouched.
    pub fn train(&self, cfg: &TrainingConfig) -> Result<String> {
        cfg.validate()?;
        let series = self.load_history()?;
        let trainer = Trainer::new(cfg, self.clock.as_ref(), self.cancel.clone());
        let features = self.resolve_features(&trainer, cfg, &series)?;
        let version = self.registry.next_version(self.clock.now_hkt())?;
        let artifact = trainer.train(&series, &self.exo, features, version.clone())?;
        if self.cancel.is_cancelled() {
            return Err(ForecastError::Cancelled);
        }
        for flag in &artifact.metrics.flags {
            warn!(version = %version, ?flag, "training flag raised");
        }
        if artifact.metrics.has_flag(TrainingFlag::Overfit) {
            warn!(
                test_mae = artifact.metrics.test.mae,
                tail_mae = artifact.metrics.tail.mae,
                "model publishes with an overfitting warning"
            );
        }
        self.registry.save(&artifact)?;
        info!(version = %version, "model published");
        Ok(version)
    }

    pub fn load_model(&self, selector: &VersionSelector) -> Result<ModelArtifact> {
        self.registry.load(selector)
    }

    // ==================== Serving ====================

    /// Current fusion-weight record, or the configured initial weights.
    pub fn current_weights(&self) -> Result<WeightUpdateRecord> {
        Ok(self
            .learner_state
            .fusion_weights()?
            .unwrap_or_else(|| WeightUpdateRecord::initial(&self.learner, self.clock.now_hkt())))
    }

    /// Forecast `start ..` for `horizon` days with the latest model and log
    /// every record.
    pub fn predict_range(&self, start: NaiveDate, horizon: usize) -> Result<Vec<PredictionRecord>> {
        let artifact = self.registry.load(&VersionSelector::Latest)?;
        let history = self.load_history()?;
        let weights: FusionWeights = self.current_weights()?.new;
        let fusion = Fusion {
            impact: self.learner_state.impact_params()?,
            production: weights.production(&self.learner),
            experimental: self
                .prediction
                .dual_track
                .then(|| weights.experimental(&self.learner)),
        };
        let records = RollingPredictor::new(&self.exo, &self.prediction)
            .with_fusion(fusion)
            .with_cancel(self.cancel.clone())
            .predict_range(
                &ServingModel::from_artifact(&artifact),
                &history,
                start,
                horizon,
                self.clock.now_hkt(),
            )?;
        for r in &records {
            self.log.upsert(r.clone())?;
        }
        Ok(records)
    }

    // ==================== Continuous Learning ====================

    /// Store an actual and evaluate the predictions made for its date.
    pub fn record_actual(&self, date: NaiveDate, count: i64) -> Result<Option<PredictionRecord>> {
        let point = AttendancePoint::new(date, count)?;
        learner::record_actual(self.store.as_ref(), self.log.as_ref(), point)
    }

    fn window(&self, days: i64) -> (NaiveDate, NaiveDate) {
        let end = self.clock.today_hkt();
        (end - Duration::days(days.max(1)), end)
    }

    /// Refit the weather-impact coefficients over the trailing window.
    ///
    /// Uses the latest evaluated production record per date. Fewer than the
    /// configured minimum samples leaves the stored coefficients untouched.
    pub fn run_impact_learner(&self, window_days: i64) -> Result<ImpactSet> {
        let (start, end) = self.window(window_days);
        let mut records: Vec<PredictionRecord> = Vec::new();
        for r in self.log.range(start, end)? {
            if r.track != Track::Production || r.actual.is_none() {
                continue;
            }
            match records.last_mut() {
                Some(prev) if prev.target_date == r.target_date => *prev = r,
                _ => records.push(r),
            }
        }
        let samples = join_samples(&records, &self.exo.weather);
        info!(%start, %end, samples = samples.len(), "weather-impact learner running");
        let set = fit_impact(&samples, &self.learner, self.clock.now_hkt())?;
        self.learner_state.save_impact_params(&set)?;
        Ok(set)
    }

    /// Compare the two tracks over the trailing window and publish new
    /// weights when every guardrail passes. `Unchanged` writes nothing.
    pub fn run_fusion_governor(&self, window_days: i64) -> Result<WeightUpdateRecord> {
        let (start, end) = self.window(window_days);
        let pairs = learner::pair_tracks(&self.log.range(start, end)?);
        let current = self.current_weights()?;
        let outcome = learner::govern(&current, &pairs, &self.learner, self.clock.now_hkt())?;
        if outcome.decision == GovernorDecision::Updated {
            self.learner_state.publish_fusion_weights(&outcome)?;
        }
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use chrono::{Datelike, TimeZone, Utc};

    use super::*;
    use crate::ml::BoosterParams;
    use crate::store::{MemoryAttendanceStore, MemoryLearnerState, MemoryPredictionLog};
    use crate::traits::MockClock;

    fn series(days: i64) -> Series {
        let start = NaiveDate::from_ymd_opt(2023, 1, 2).unwrap();
        Series::from_values((0..days).map(|i| {
            let d = start + Duration::days(i);
            let weekday = d.weekday().num_days_from_monday() as f64;
            (d, 280.0 + 12.0 * weekday + (i % 9) as f64)
        }))
        .unwrap()
    }

    fn quick_training(features: &[&str]) -> TrainingConfig {
        TrainingConfig {
            booster: BoosterParams {
                n_rounds: 40,
                max_depth: 3,
                learning_rate: 0.2,
                ..Default::default()
            },
            early_stopping_rounds: 10,
            feature_list: FeatureSelection::Explicit(features.iter().map(|s| s.to_string()).collect()),
            ..Default::default()
        }
    }

    struct Fixture {
        forecaster: Forecaster,
        log: Arc<MemoryPredictionLog>,
        _dir: tempfile::TempDir,
    }

    fn fixture(days: i64) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let log = Arc::new(MemoryPredictionLog::new());
        let clock = Arc::new(MockClock::new(Utc.with_ymd_and_hms(2024, 2, 1, 1, 0, 0).unwrap()));
        let forecaster = Forecaster::new(
            Arc::new(MemoryAttendanceStore::new(series(days))),
            log.clone(),
            Arc::new(MemoryLearnerState::new()),
            ModelRegistry::open(dir.path()).unwrap(),
            Exogenous::default(),
        )
        .with_clock(clock);
        Fixture {
            forecaster,
            log,
            _dir: dir,
        }
    }

    #[test]
    fn test_train_then_predict_logs_both_tracks() {
        let fx = fixture(300);
        let version = fx
            .forecaster
            .train(&quick_training(&["DayOfWeek", "Lag1", "Lag7"]))
            .unwrap();
        assert_eq!(fx.forecaster.registry().latest_version().unwrap(), Some(version.clone()));

        let start = NaiveDate::from_ymd_opt(2023, 10, 29).unwrap();
        let records = fx.forecaster.predict_range(start, 3).unwrap();
        assert_eq!(records.len(), 6);
        assert_eq!(fx.log.len(), 6);
        assert!(records.iter().all(|r| r.model_version == version && r.is_ordered()));
    }

    #[test]
    fn test_from_latest_artifact_reuses_feature_order() {
        let fx = fixture(300);
        fx.forecaster
            .train(&quick_training(&["Lag7", "DayOfWeek", "Lag1"]))
            .unwrap();
        let cfg = TrainingConfig {
            feature_list: FeatureSelection::FromLatestArtifact,
            ..quick_training(&[])
        };
        let second = fx.forecaster.train(&cfg).unwrap();
        let artifact = fx.forecaster.load_model(&VersionSelector::Version(second)).unwrap();
        assert_eq!(artifact.features.names(), &["Lag7", "DayOfWeek", "Lag1"]);
    }

    #[test]
    fn test_auto_select_reports_bad_config_first() {
        let fx = fixture(300);
        let cfg = TrainingConfig {
            feature_list: FeatureSelection::AutoSelect,
            split_fraction: 1.5,
            ..quick_training(&[])
        };
        let err = fx.forecaster.train(&cfg).unwrap_err();
        assert!(matches!(err, ForecastError::Config(ref msg) if msg.contains("split_fraction")), "{}", err);
        assert_eq!(fx.forecaster.registry().latest_version().unwrap(), None);
    }

    #[test]
    fn test_from_latest_without_model_is_invalid() {
        let fx = fixture(300);
        let cfg = TrainingConfig {
            feature_list: FeatureSelection::FromLatestArtifact,
            ..quick_training(&[])
        };
        assert!(matches!(fx.forecaster.train(&cfg), Err(ForecastError::ArtifactInvalid(_))));
        assert!(fx.forecaster.registry().list_versions().unwrap().is_empty());
    }

    #[test]
    fn test_failed_training_publishes_nothing() {
        let fx = fixture(30);
        let err = fx.forecaster.train(&quick_training(&["Lag1"])).unwrap_err();
        assert!(matches!(err, ForecastError::InsufficientData { .. }));
        assert_eq!(fx.forecaster.registry().latest_version().unwrap(), None);
    }

    #[test]
    fn test_record_actual_rejects_negative_count() {
        let fx = fixture(10);
        let date = NaiveDate::from_ymd_opt(2024, 1, 31).unwrap();
        assert!(matches!(
            fx.forecaster.record_actual(date, -1),
            Err(ForecastError::Malformed(_))
        ));
    }

    #[test]
    fn test_governor_without_history_leaves_weights() {
        let fx = fixture(10);
        let out = fx.forecaster.run_fusion_governor(30).unwrap();
        assert_eq!(out.decision, GovernorDecision::Unchanged);
        assert_eq!(out.version, 0);
        assert!(fx.forecaster.learner_state.fusion_weights().unwrap().is_none());
    }
}
